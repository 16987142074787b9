// Copyright (c) quarrydb.io 2025
// This file is licensed under the Apache-2.0, see license.md file

pub use timestamp::{Timestamp, UNCOMMITTED_BIT};

pub mod bitmap;
pub mod constants;
pub mod pool;
mod timestamp;
