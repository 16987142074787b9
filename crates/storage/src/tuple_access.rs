// Copyright (c) quarrydb.io 2025
// This file is licensed under the Apache-2.0, see license.md file

use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

use quarry_core::bitmap::RawBitmap;

use crate::access_controller::BlockState;
use crate::arrow_metadata::ArrowBlockMetadata;
use crate::block::{RawBlock, TupleSlot, BLOCK_HEADER_SIZE};
use crate::data_table::DataTable;
use crate::ids::{ColumnId, VERSION_POINTER_COLUMN};
use crate::layout::BlockLayout;
use crate::undo_record::UndoRecord;

/// Interprets a raw block as a column-major set of slots with per-column
/// null bitmaps, a slot-presence bitmap and an embedded Arrow metadata
/// region, all at offsets derived from one [`BlockLayout`].
///
/// Column 0 is the version-pointer column: its value array is read and
/// written atomically and its bitmap is the presence bitmap.
pub struct TupleAccessStrategy {
	layout: BlockLayout,
}

impl TupleAccessStrategy {
	pub fn new(layout: BlockLayout) -> Self {
		Self { layout }
	}

	pub fn layout(&self) -> &BlockLayout {
		&self.layout
	}

	/// Prepares freshly allocated (uninitialized) block memory: header,
	/// Arrow metadata region, all bitmaps and the version-pointer column
	/// are zeroed; value arrays are left as junk.
	pub fn initialize_block(&self, block: RawBlock, table: *const DataTable, layout_version: u32) {
		let base = block.base();
		unsafe {
			// Zeroes the header, the Arrow metadata region and the
			// access-controller state in one sweep.
			ptr::write_bytes(base, 0, BLOCK_HEADER_SIZE + self.layout.arrow_metadata_size());
		}
		block.header().set_layout_version(layout_version);
		block.header().set_data_table(table);
		debug_assert_eq!(block.state(), BlockState::Hot);
		for col in 0..self.layout.num_columns() {
			let col = ColumnId(col);
			let offset = self.layout.bitmap_offset(col);
			unsafe {
				ptr::write_bytes(
					base.add(offset),
					0,
					RawBitmap::size_in_bytes(self.layout.num_slots() as usize),
				);
			}
		}
		let versions = self.layout.value_array_offset(VERSION_POINTER_COLUMN);
		unsafe {
			ptr::write_bytes(
				base.add(versions),
				0,
				self.layout.num_slots() as usize * size_of::<u64>(),
			);
		}
	}

	/// The slot-presence bitmap (column 0's bitmap).
	pub fn presence_bitmap(&self, block: RawBlock) -> RawBitmap<'_> {
		self.column_null_bitmap(block, VERSION_POINTER_COLUMN)
	}

	pub fn column_null_bitmap(&self, block: RawBlock, col: ColumnId) -> RawBitmap<'_> {
		let offset = self.layout.bitmap_offset(col);
		unsafe {
			RawBitmap::from_raw(block.base().add(offset), self.layout.num_slots() as usize)
		}
	}

	pub fn allocated(&self, slot: TupleSlot) -> bool {
		self.presence_bitmap(slot.block()).test(slot.offset() as usize)
	}

	/// Claims a free slot for an insert. The insert undo record is CAS
	/// published as the slot's version chain *before* the presence bit is
	/// set, so concurrent readers either miss the slot entirely or see an
	/// uncommitted insert version and treat the tuple as invisible.
	///
	/// Returns `None` when every slot is taken. The caller must hold
	/// `record` unpublished: its slot field is rewritten for every claim
	/// attempt.
	pub fn allocate(&self, block: RawBlock, record: *mut UndoRecord) -> Option<u32> {
		let presence = self.presence_bitmap(block);
		let num_slots = self.layout.num_slots() as usize;
		let mut pos = 0;
		while pos < num_slots {
			if presence.test(pos) {
				pos += 1;
				continue;
			}
			let slot = TupleSlot::new(block, pos as u32);
			unsafe { (*record).set_slot(slot) };
			// A deleted slot whose chain has not been unlinked yet fails
			// the CAS and stays unavailable until the GC frees it.
			if self.compare_exchange_version_ptr(slot, ptr::null_mut(), record) {
				presence.set(pos);
				block.header().insert_head().fetch_max(pos as u32 + 1, Ordering::AcqRel);
				return Some(pos as u32);
			}
			pos += 1;
		}
		None
	}

	/// Clears the presence bit, making the slot allocatable once its
	/// version chain is gone.
	pub fn deallocate(&self, slot: TupleSlot) {
		self.presence_bitmap(slot.block()).clear(slot.offset() as usize);
	}

	/// Raw pointer to a column value. No null check.
	pub fn access(&self, slot: TupleSlot, col: ColumnId) -> *mut u8 {
		debug_assert!(col != VERSION_POINTER_COLUMN);
		let offset = self.layout.value_array_offset(col)
			+ slot.offset() as usize * self.layout.attr_size(col) as usize;
		unsafe { slot.block().base().add(offset) }
	}

	pub fn access_with_null_check(&self, slot: TupleSlot, col: ColumnId) -> Option<*const u8> {
		if self.column_null_bitmap(slot.block(), col).test(slot.offset() as usize) {
			Some(self.access(slot, col) as *const u8)
		} else {
			None
		}
	}

	/// Value pointer for writing; sets the column not-null.
	pub fn access_force_not_null(&self, slot: TupleSlot, col: ColumnId) -> *mut u8 {
		self.column_null_bitmap(slot.block(), col).set(slot.offset() as usize);
		self.access(slot, col)
	}

	pub fn set_null(&self, slot: TupleSlot, col: ColumnId) {
		self.column_null_bitmap(slot.block(), col).clear(slot.offset() as usize);
	}

	pub fn is_null(&self, slot: TupleSlot, col: ColumnId) -> bool {
		!self.column_null_bitmap(slot.block(), col).test(slot.offset() as usize)
	}

	fn version_cell(&self, slot: TupleSlot) -> &AtomicU64 {
		let offset = self.layout.value_array_offset(VERSION_POINTER_COLUMN)
			+ slot.offset() as usize * size_of::<u64>();
		unsafe { &*(slot.block().base().add(offset) as *const AtomicU64) }
	}

	/// Head of the slot's version chain.
	pub fn version_ptr(&self, slot: TupleSlot) -> *mut UndoRecord {
		self.version_cell(slot).load(Ordering::Acquire) as *mut UndoRecord
	}

	/// CAS on the version pointer; the linearization point for updates.
	pub fn compare_exchange_version_ptr(
		&self,
		slot: TupleSlot,
		expected: *mut UndoRecord,
		desired: *mut UndoRecord,
	) -> bool {
		self.version_cell(slot)
			.compare_exchange(
				expected as u64,
				desired as u64,
				Ordering::AcqRel,
				Ordering::Acquire,
			)
			.is_ok()
	}

	/// Unconditional version-pointer store. Only valid while the caller
	/// owns the chain head (rollback) or has proven no one can race (GC).
	pub fn store_version_ptr(&self, slot: TupleSlot, record: *mut UndoRecord) {
		self.version_cell(slot).store(record as u64, Ordering::Release);
	}

	pub fn arrow_metadata(&self, block: RawBlock) -> &ArrowBlockMetadata {
		unsafe { &*(block.base().add(BLOCK_HEADER_SIZE) as *const ArrowBlockMetadata) }
	}

	/// # Safety
	///
	/// Caller must hold the block's exclusive latch or otherwise be the
	/// sole mutator of the metadata region.
	pub unsafe fn arrow_metadata_mut(&self, block: RawBlock) -> &mut ArrowBlockMetadata {
		unsafe { &mut *(block.base().add(BLOCK_HEADER_SIZE) as *mut ArrowBlockMetadata) }
	}
}
