// Copyright (c) quarrydb.io 2025
// This file is licensed under the Apache-2.0, see license.md file

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU8};

use quarry_core::pool::{Pool, PoolAllocator};

use crate::data_table::DataTable;
use crate::error::{Result, StorageError};

/// Fixed header at the start of every raw block. Everything after it is
/// interpreted through the owning table's [`crate::BlockLayout`].
#[repr(C)]
pub struct BlockHeader {
	table: AtomicPtr<DataTable>,
	insert_head: AtomicU32,
	layout_version: AtomicU32,
	pub(crate) state: AtomicU8,
	_pad: [u8; 3],
	pub(crate) readers: AtomicU32,
}

pub(crate) const BLOCK_HEADER_SIZE: usize = size_of::<BlockHeader>();

impl BlockHeader {
	/// Back pointer to the table this block belongs to.
	///
	/// # Safety
	///
	/// The caller must know the owning table is still alive (blocks are
	/// released before their table is dropped).
	pub unsafe fn data_table<'a>(&self) -> &'a DataTable {
		let ptr = self.table.load(std::sync::atomic::Ordering::Acquire);
		debug_assert!(!ptr.is_null());
		unsafe { &*ptr }
	}

	pub(crate) fn set_data_table(&self, table: *const DataTable) {
		self.table.store(table as *mut DataTable, std::sync::atomic::Ordering::Release);
	}

	/// Number of slots handed out so far; only grows while the block is the
	/// table's insertion target.
	pub fn insert_head(&self) -> &AtomicU32 {
		&self.insert_head
	}

	pub fn layout_version(&self) -> u32 {
		self.layout_version.load(std::sync::atomic::Ordering::Relaxed)
	}

	pub(crate) fn set_layout_version(&self, version: u32) {
		self.layout_version.store(version, std::sync::atomic::Ordering::Relaxed);
	}
}

/// Handle to a power-of-two-sized raw memory region owned by a
/// [`BlockStore`]. Copyable; identity is the base address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct RawBlock {
	ptr: NonNull<u8>,
}

// Blocks are shared across client, GC and WAL threads; all mutation of block
// contents goes through atomics or is guarded by the MVCC protocol.
unsafe impl Send for RawBlock {}
unsafe impl Sync for RawBlock {}

impl RawBlock {
	pub(crate) unsafe fn from_raw(ptr: *mut u8) -> Self {
		Self {
			ptr: NonNull::new(ptr).expect("block allocation returned null"),
		}
	}

	pub fn header(&self) -> &BlockHeader {
		unsafe { &*(self.ptr.as_ptr() as *const BlockHeader) }
	}

	pub(crate) fn base(&self) -> *mut u8 {
		self.ptr.as_ptr()
	}

	/// Stable numeric identity, used as the slot key in serialized redo
	/// records.
	pub fn id(&self) -> u64 {
		self.ptr.as_ptr() as u64
	}
}

/// The stable identity of a tuple: the block it lives in and its slot offset
/// within that block. Does not change for the life of the tuple; compaction
/// only moves tuples whose version chains are empty.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(C)]
pub struct TupleSlot {
	block: RawBlock,
	offset: u32,
}

impl TupleSlot {
	pub fn new(block: RawBlock, offset: u32) -> Self {
		Self { block, offset }
	}

	/// A placeholder for records whose slot is assigned later. Never
	/// dereferenced.
	pub(crate) fn unset() -> Self {
		Self {
			block: RawBlock {
				ptr: NonNull::dangling(),
			},
			offset: u32::MAX,
		}
	}

	pub fn block(&self) -> RawBlock {
		self.block
	}

	pub fn offset(&self) -> u32 {
		self.offset
	}
}

pub struct BlockAllocator {
	layout: Layout,
}

impl PoolAllocator<RawBlock> for BlockAllocator {
	fn allocate(&self) -> RawBlock {
		let ptr = unsafe { alloc(self.layout) };
		if ptr.is_null() {
			handle_alloc_error(self.layout);
		}
		unsafe { RawBlock::from_raw(ptr) }
	}

	fn destroy(&self, block: RawBlock) {
		unsafe { dealloc(block.base(), self.layout) };
	}
}

/// Pool allocator handing out aligned raw blocks. Callers receive
/// uninitialized bytes; [`crate::TupleAccessStrategy::initialize_block`]
/// makes a block usable for a particular layout.
pub struct BlockStore {
	pool: Pool<RawBlock, BlockAllocator>,
	block_size: usize,
}

impl BlockStore {
	pub fn new(block_size: usize, size_limit: u64, reuse_limit: u64) -> Self {
		assert!(block_size.is_power_of_two());
		let layout = Layout::from_size_align(block_size, block_size)
			.expect("block size is a valid allocation layout");
		Self {
			pool: Pool::new(BlockAllocator { layout }, size_limit, reuse_limit),
			block_size,
		}
	}

	pub fn get(&self) -> Result<RawBlock> {
		self.pool.get().map_err(StorageError::OutOfMemory)
	}

	pub fn release(&self, block: RawBlock) {
		self.pool.release(block);
	}

	pub fn block_size(&self) -> usize {
		self.block_size
	}

	/// Blocks currently allocated, handed out or reusable.
	pub fn allocated(&self) -> u64 {
		self.pool.allocated()
	}

	/// Blocks parked in the reuse pool.
	pub fn reusable(&self) -> usize {
		self.pool.reusable()
	}
}
