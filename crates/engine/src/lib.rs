// Copyright (c) quarrydb.io 2025
// This file is licensed under the Apache-2.0, see license.md file

//! Assembly of the storage and transaction core: configuration, component
//! wiring, crash recovery and ordered shutdown.

pub use engine::Engine;
pub use error::{EngineError, Result};
pub use recovery::RecoveryReport;
pub use settings::Settings;

mod engine;
mod error;
mod recovery;
mod settings;
