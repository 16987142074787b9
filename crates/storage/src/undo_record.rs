// Copyright (c) quarrydb.io 2025
// This file is licensed under the Apache-2.0, see license.md file

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use quarry_core::Timestamp;

use crate::block::TupleSlot;
use crate::data_table::DataTable;
use crate::projected_row::{ProjectedRow, ProjectedRowInitializer};

/// What kind of mutation a version-chain entry undoes.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum UndoRecordType {
	/// Rolling back means the tuple did not exist: clear the presence bit.
	Insert = 0,
	/// Rolling back restores the before-image of the mutated columns.
	Update = 1,
	/// Rolling back restores the full before-image and the presence bit.
	Delete = 2,
}

/// A version-chain entry. Allocated inside a transaction's undo buffer and
/// threaded into the owning slot's chain, newest first. The timestamp holds
/// the transaction's transient id while in flight and the commit timestamp
/// afterwards; along any chain, timestamps strictly decrease.
///
/// For update and delete records a before-image [`ProjectedRow`] follows the
/// header inline.
#[repr(C)]
pub struct UndoRecord {
	size: u32,
	record_type: UndoRecordType,
	_pad: [u8; 3],
	timestamp: AtomicU64,
	next: AtomicPtr<UndoRecord>,
	table: *const DataTable,
	slot: TupleSlot,
}

const DELTA_OFFSET: usize = size_of::<UndoRecord>();

impl UndoRecord {
	pub fn size_without_delta() -> usize {
		DELTA_OFFSET
	}

	pub fn size_with_delta(initializer: &ProjectedRowInitializer) -> usize {
		DELTA_OFFSET + initializer.row_size()
	}

	/// Writes an undo record header into `mem`, which must hold at least
	/// the size reported by the sizing functions above.
	///
	/// # Safety
	///
	/// `mem` must be 8-aligned, writable and sized for the record.
	unsafe fn initialize(
		mem: *mut u8,
		size: usize,
		record_type: UndoRecordType,
		txn_id: Timestamp,
		table: *const DataTable,
		slot: TupleSlot,
	) -> *mut UndoRecord {
		let record = mem as *mut UndoRecord;
		unsafe {
			ptr::addr_of_mut!((*record).size).write(size as u32);
			ptr::addr_of_mut!((*record).record_type).write(record_type);
			ptr::addr_of_mut!((*record)._pad).write([0; 3]);
			ptr::addr_of_mut!((*record).timestamp).write(AtomicU64::new(txn_id.0));
			ptr::addr_of_mut!((*record).next).write(AtomicPtr::new(ptr::null_mut()));
			ptr::addr_of_mut!((*record).table).write(table);
			ptr::addr_of_mut!((*record).slot).write(slot);
		}
		record
	}

	/// # Safety
	///
	/// See [`UndoRecord::initialize`].
	pub(crate) unsafe fn initialize_insert(
		mem: *mut u8,
		txn_id: Timestamp,
		table: *const DataTable,
		slot: TupleSlot,
	) -> *mut UndoRecord {
		unsafe {
			Self::initialize(
				mem,
				Self::size_without_delta(),
				UndoRecordType::Insert,
				txn_id,
				table,
				slot,
			)
		}
	}

	/// # Safety
	///
	/// See [`UndoRecord::initialize`].
	pub(crate) unsafe fn initialize_with_delta(
		mem: *mut u8,
		record_type: UndoRecordType,
		txn_id: Timestamp,
		table: *const DataTable,
		slot: TupleSlot,
		initializer: &ProjectedRowInitializer,
	) -> *mut UndoRecord {
		debug_assert!(matches!(
			record_type,
			UndoRecordType::Update | UndoRecordType::Delete
		));
		let size = Self::size_with_delta(initializer);
		let record = unsafe { Self::initialize(mem, size, record_type, txn_id, table, slot) };
		let delta = unsafe {
			std::slice::from_raw_parts_mut(mem.add(DELTA_OFFSET), initializer.row_size())
		};
		initializer.initialize(delta);
		record
	}

	pub fn record_type(&self) -> UndoRecordType {
		self.record_type
	}

	pub fn timestamp(&self) -> &AtomicU64 {
		&self.timestamp
	}

	pub fn next(&self) -> &AtomicPtr<UndoRecord> {
		&self.next
	}

	pub fn slot(&self) -> TupleSlot {
		self.slot
	}

	pub(crate) fn set_slot(&mut self, slot: TupleSlot) {
		self.slot = slot;
	}

	/// The table this record's slot belongs to.
	///
	/// # Safety
	///
	/// The caller must know the table is still alive.
	pub unsafe fn table<'a>(&self) -> &'a DataTable {
		debug_assert!(!self.table.is_null());
		unsafe { &*self.table }
	}

	/// The before-image of the columns this record mutated. `None` for
	/// insert records.
	pub fn delta(&self) -> Option<&ProjectedRow> {
		if self.record_type == UndoRecordType::Insert {
			return None;
		}
		let bytes = unsafe {
			std::slice::from_raw_parts(
				(self as *const UndoRecord as *const u8).add(DELTA_OFFSET),
				self.size as usize - DELTA_OFFSET,
			)
		};
		Some(unsafe { ProjectedRow::from_bytes(bytes) })
	}

	pub(crate) fn delta_mut(&mut self) -> Option<&mut ProjectedRow> {
		if self.record_type == UndoRecordType::Insert {
			return None;
		}
		let bytes = unsafe {
			std::slice::from_raw_parts_mut(
				(self as *mut UndoRecord as *mut u8).add(DELTA_OFFSET),
				self.size as usize - DELTA_OFFSET,
			)
		};
		Some(unsafe { ProjectedRow::from_bytes_mut(bytes) })
	}

	/// Whether this record's version is visible to a reader: committed at or
	/// before the reader's snapshot, or written by the reader itself.
	pub fn visible_to(&self, begin: Timestamp, txn_id: Timestamp) -> bool {
		let ts = Timestamp(self.timestamp.load(Ordering::Acquire));
		if ts.is_uncommitted() {
			ts == txn_id
		} else {
			ts <= begin
		}
	}
}
