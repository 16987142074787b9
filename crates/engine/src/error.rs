// Copyright (c) quarrydb.io 2025
// This file is licensed under the Apache-2.0, see license.md file

use quarry_storage::StorageError;
use quarry_wal::WalError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
	#[error("invalid setting: {0}")]
	InvalidSetting(String),

	#[error(transparent)]
	Storage(#[from] StorageError),

	/// Recovery errors are fatal and surface to the startup caller.
	#[error("recovery failed: {0}")]
	Recovery(#[from] WalError),

	#[error("a table with id {database}.{table} already exists")]
	TableExists { database: u32, table: u32 },

	#[error("recover() may only run once, before the engine accepts transactions")]
	AlreadyRecovered,
}

pub type Result<T> = std::result::Result<T, EngineError>;
