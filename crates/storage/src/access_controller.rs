// Copyright (c) quarrydb.io 2025
// This file is licensed under the Apache-2.0, see license.md file

//! Per-block access control between transactional readers/writers and the
//! block compactor.
//!
//! Hot blocks are latch-free: readers and writers go straight through the
//! MVCC protocol. Once the compactor marks a block cooling, readers take a
//! shared latch and the gather pass takes the exclusive latch, so gathered
//! Arrow buffers are never swapped out from under a reader. Any write flips
//! the block back to hot, invalidating the block's Arrow metadata.

use std::hint::spin_loop;
use std::sync::atomic::Ordering;

use crate::block::RawBlock;

const EXCLUSIVE_BIT: u32 = 1 << 31;

/// Lifecycle of a block in the compaction pipeline.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BlockState {
	/// Transactionally mutated; Arrow metadata is not authoritative.
	Hot = 0,
	/// Enqueued for compaction; readers latch, writers re-heat.
	Cooling = 1,
	/// Gather in progress under the exclusive latch.
	Freezing = 2,
	/// Gathered; Arrow metadata describes the block contents.
	Frozen = 3,
}

impl BlockState {
	fn from_u8(value: u8) -> BlockState {
		match value {
			0 => BlockState::Hot,
			1 => BlockState::Cooling,
			2 => BlockState::Freezing,
			3 => BlockState::Frozen,
			_ => unreachable!("invalid block state"),
		}
	}
}

/// Shared latch held by a reader of a non-hot block. The hot fast path
/// carries no latch at all.
pub struct BlockReadGuard {
	block: Option<RawBlock>,
}

impl Drop for BlockReadGuard {
	fn drop(&mut self) {
		if let Some(block) = self.block {
			block.header().readers.fetch_sub(1, Ordering::AcqRel);
		}
	}
}

/// Exclusive latch held by the gather pass.
pub struct BlockWriteGuard {
	block: RawBlock,
}

impl Drop for BlockWriteGuard {
	fn drop(&mut self) {
		self.block.header().readers.fetch_and(!EXCLUSIVE_BIT, Ordering::AcqRel);
	}
}

impl RawBlock {
	pub fn state(&self) -> BlockState {
		BlockState::from_u8(self.header().state.load(Ordering::Acquire))
	}

	pub fn set_state(&self, state: BlockState) {
		self.header().state.store(state as u8, Ordering::Release);
	}

	/// Taken by readers before copying slot contents. Latch-free while the
	/// block is hot.
	pub fn acquire_read(&self) -> BlockReadGuard {
		if self.state() == BlockState::Hot {
			return BlockReadGuard { block: None };
		}
		let header = self.header();
		loop {
			let current = header.readers.load(Ordering::Acquire);
			if current & EXCLUSIVE_BIT != 0 {
				spin_loop();
				continue;
			}
			if header
				.readers
				.compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Relaxed)
				.is_ok()
			{
				return BlockReadGuard { block: Some(*self) };
			}
		}
	}

	/// Taken by the gather pass. Fails if any reader holds the shared
	/// latch.
	pub fn try_acquire_exclusive(&self) -> Option<BlockWriteGuard> {
		if self
			.header()
			.readers
			.compare_exchange(0, EXCLUSIVE_BIT, Ordering::AcqRel, Ordering::Acquire)
			.is_ok()
		{
			Some(BlockWriteGuard { block: *self })
		} else {
			None
		}
	}

	/// Called by every writer after claiming a version. Re-heats cooling or
	/// frozen blocks, waiting out a concurrent gather first.
	pub fn touch_for_write(&self) {
		if self.state() == BlockState::Hot {
			return;
		}
		let guard = self.acquire_read();
		self.set_state(BlockState::Hot);
		drop(guard);
	}
}
