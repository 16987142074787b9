// Copyright (c) quarrydb.io 2025
// This file is licensed under the Apache-2.0, see license.md file

use std::path::PathBuf;
use std::time::Duration;

use quarry_core::constants::{BLOCK_SIZE, MAX_COLUMNS};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Engine configuration. Serializable so deployments can keep it in a
/// config file; every knob has a default suitable for tests.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
	/// Raw block size in bytes; must be a power of two.
	pub block_size: usize,
	/// Block store pool bounds.
	pub block_store_size: u64,
	pub block_store_reuse: u64,
	/// Redo/undo buffer segment pool bounds.
	pub buffer_segment_pool_size: u64,
	pub buffer_segment_pool_reuse: u64,
	/// Upper bound on columns per table, at most [`MAX_COLUMNS`].
	pub max_columns: u16,
	/// Write-ahead log file. `None` disables logging (and with it crash
	/// recovery).
	pub log_file: Option<PathBuf>,
	/// Page buffers owned by the log manager.
	pub wal_num_buffers: usize,
	pub wal_serialization_interval_ms: u64,
	pub wal_flush_interval_ms: u64,
	pub gc_enabled: bool,
	pub gc_interval_ms: u64,
}

impl Default for Settings {
	fn default() -> Self {
		Self {
			block_size: BLOCK_SIZE,
			block_store_size: 1000,
			block_store_reuse: 100,
			buffer_segment_pool_size: 10_000,
			buffer_segment_pool_reuse: 1_000,
			max_columns: MAX_COLUMNS,
			log_file: None,
			wal_num_buffers: 16,
			wal_serialization_interval_ms: 5,
			wal_flush_interval_ms: 5,
			gc_enabled: true,
			gc_interval_ms: 10,
		}
	}
}

impl Settings {
	pub fn validate(&self) -> Result<(), EngineError> {
		if !self.block_size.is_power_of_two() {
			return Err(EngineError::InvalidSetting(format!(
				"block_size {} is not a power of two",
				self.block_size
			)));
		}
		if self.block_store_reuse > self.block_store_size {
			return Err(EngineError::InvalidSetting(
				"block_store_reuse exceeds block_store_size".into(),
			));
		}
		if self.buffer_segment_pool_reuse > self.buffer_segment_pool_size {
			return Err(EngineError::InvalidSetting(
				"buffer_segment_pool_reuse exceeds buffer_segment_pool_size".into(),
			));
		}
		if self.max_columns > MAX_COLUMNS {
			return Err(EngineError::InvalidSetting(format!(
				"max_columns {} exceeds the system limit of {MAX_COLUMNS}",
				self.max_columns
			)));
		}
		if self.wal_num_buffers == 0 {
			return Err(EngineError::InvalidSetting("wal_num_buffers must be positive".into()));
		}
		Ok(())
	}

	pub fn wal_serialization_interval(&self) -> Duration {
		Duration::from_millis(self.wal_serialization_interval_ms)
	}

	pub fn wal_flush_interval(&self) -> Duration {
		Duration::from_millis(self.wal_flush_interval_ms)
	}

	pub fn gc_interval(&self) -> Duration {
		Duration::from_millis(self.gc_interval_ms)
	}
}
