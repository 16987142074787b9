// Copyright (c) quarrydb.io 2025
// This file is licensed under the Apache-2.0, see license.md file

use quarry_core::pool::PoolExhausted;
use thiserror::Error;

use crate::block::TupleSlot;

#[derive(Debug, Error)]
pub enum StorageError {
	/// Two concurrent mutations raced on the same slot. Surfaced to the
	/// caller; whether to abort and retry is caller policy.
	#[error("write-write conflict on {slot:?}")]
	WriteWriteConflict { slot: TupleSlot },

	/// Every slot of the block is taken.
	#[error("block is full")]
	BlockFull,

	/// The table could not grow because the block store is at its limit.
	#[error("table is full: {0}")]
	TableFull(#[source] PoolExhausted),

	/// A record buffer segment could not be allocated.
	#[error("out of memory: {0}")]
	OutOfMemory(#[from] PoolExhausted),

	#[error("a table needs at least one user column")]
	EmptyLayout,

	#[error("a table may have at most {max} columns, got {got}")]
	TooManyColumns { got: usize, max: u16 },

	#[error("unsupported attribute size {size}, expected 1, 2, 4, 8 or VARLEN_COLUMN")]
	InvalidAttrSize { size: u16 },

	#[error("a block of {block_size} bytes cannot hold a single tuple of this layout")]
	LayoutTooLarge { block_size: usize },
}

pub type Result<T> = std::result::Result<T, StorageError>;
