// Copyright (c) quarrydb.io 2025
// This file is licensed under the Apache-2.0, see license.md file

//! The write-ahead log pipeline.
//!
//! Three task threads connected by bounded queues: the serializer drains
//! redo buffers handed in by committing transactions and turns them into a
//! self-describing byte stream; the disk writer owns a pool of page buffers
//! and appends them to the log file; the flusher fsyncs on an interval (or
//! on demand) and fires commit callbacks only once their bytes are durable.
//! Bounded queues are the backpressure: when the disk falls behind, commits
//! stall. There is no drop policy.

pub use error::{DurabilityError, Result, WalError};
pub use manager::{CommitCallback, LogManager, WalSettings};
pub use page::encode_page;
pub use reader::{LogFileReader, RecoveredRecord, SlotKey, TableRegistry, TailRepair};

mod error;
mod manager;
mod page;
mod reader;
mod serializer;
