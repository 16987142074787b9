// Copyright (c) quarrydb.io 2025
// This file is licensed under the Apache-2.0, see license.md file

use thiserror::Error;

/// Delivered through the commit callback when the log manager could not
/// durably record a commit. By the caller contract the transaction is then
/// considered aborted.
#[derive(Clone, Debug, Error)]
#[error("write-ahead log failed to persist: {message}")]
pub struct DurabilityError {
	pub message: String,
}

#[derive(Debug, Error)]
pub enum WalError {
	#[error("log io failed: {0}")]
	Io(#[from] std::io::Error),

	/// A record failed a size or checksum check during recovery. Recovery
	/// stops at that record; the tail is truncated.
	#[error("corrupt log record at stream offset {offset}: {reason}")]
	Corrupt { offset: u64, reason: String },

	#[error("redo record references unknown table {database}.{table}")]
	UnknownTable { database: u32, table: u32 },
}

pub type Result<T> = std::result::Result<T, WalError>;
