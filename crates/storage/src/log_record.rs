// Copyright (c) quarrydb.io 2025
// This file is licensed under the Apache-2.0, see license.md file

use std::ptr;

use quarry_core::Timestamp;

use crate::block::TupleSlot;
use crate::ids::{DatabaseId, TableId};
use crate::projected_row::ProjectedRow;

/// Discriminates the in-memory and on-disk log record variants.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LogRecordType {
	Redo = 1,
	Delete = 2,
	Commit = 3,
	Abort = 4,
}

impl LogRecordType {
	pub fn from_u8(value: u8) -> Option<Self> {
		match value {
			1 => Some(Self::Redo),
			2 => Some(Self::Delete),
			3 => Some(Self::Commit),
			4 => Some(Self::Abort),
			_ => None,
		}
	}
}

/// In-memory shape of a write-ahead log record inside a redo buffer:
/// a common header followed by a type-specific body. The serializer turns
/// this into the self-describing on-disk stream; the in-memory size is
/// not the serialized size.
#[repr(C)]
pub struct LogRecord {
	size: u32,
	record_type: LogRecordType,
	_pad: [u8; 3],
	txn_begin: u64,
}

const BODY_OFFSET: usize = size_of::<LogRecord>();

/// Body of a redo record: the after-image of one mutation. The delta row
/// follows the body inline.
#[repr(C)]
pub struct RedoRecordBody {
	pub database: DatabaseId,
	pub table: TableId,
	pub slot: TupleSlot,
}

const REDO_DELTA_OFFSET: usize = BODY_OFFSET + size_of::<RedoRecordBody>();

#[repr(C)]
pub struct DeleteRecordBody {
	pub database: DatabaseId,
	pub table: TableId,
	pub slot: TupleSlot,
}

#[repr(C)]
pub struct CommitRecordBody {
	pub commit_ts: u64,
}

impl LogRecord {
	pub fn redo_size_for_row(row: &ProjectedRow) -> usize {
		REDO_DELTA_OFFSET + row.size()
	}

	pub fn delete_size() -> usize {
		BODY_OFFSET + size_of::<DeleteRecordBody>()
	}

	pub fn commit_size() -> usize {
		BODY_OFFSET + size_of::<CommitRecordBody>()
	}

	unsafe fn initialize(
		mem: *mut u8,
		size: usize,
		record_type: LogRecordType,
		txn_begin: Timestamp,
	) -> *mut LogRecord {
		let record = mem as *mut LogRecord;
		unsafe {
			ptr::addr_of_mut!((*record).size).write(size as u32);
			ptr::addr_of_mut!((*record).record_type).write(record_type);
			ptr::addr_of_mut!((*record)._pad).write([0; 3]);
			ptr::addr_of_mut!((*record).txn_begin).write(txn_begin.0);
		}
		record
	}

	/// Writes a redo record whose after-image is a verbatim copy of `row`.
	///
	/// # Safety
	///
	/// `mem` must be 8-aligned, writable and hold at least
	/// `redo_size_for_row`.
	pub(crate) unsafe fn initialize_redo_from_row(
		mem: *mut u8,
		txn_begin: Timestamp,
		database: DatabaseId,
		table: TableId,
		slot: TupleSlot,
		row: &ProjectedRow,
	) {
		let size = Self::redo_size_for_row(row);
		unsafe {
			Self::initialize(mem, size, LogRecordType::Redo, txn_begin);
			let body = mem.add(BODY_OFFSET) as *mut RedoRecordBody;
			ptr::addr_of_mut!((*body).database).write(database);
			ptr::addr_of_mut!((*body).table).write(table);
			ptr::addr_of_mut!((*body).slot).write(slot);
			ptr::copy_nonoverlapping(row.as_bytes().as_ptr(), mem.add(REDO_DELTA_OFFSET), row.size());
		}
	}

	/// # Safety
	///
	/// As [`LogRecord::initialize_redo_from_row`], sized by `delete_size`.
	pub(crate) unsafe fn initialize_delete(
		mem: *mut u8,
		txn_begin: Timestamp,
		database: DatabaseId,
		table: TableId,
		slot: TupleSlot,
	) {
		unsafe {
			Self::initialize(mem, Self::delete_size(), LogRecordType::Delete, txn_begin);
			let body = mem.add(BODY_OFFSET) as *mut DeleteRecordBody;
			ptr::addr_of_mut!((*body).database).write(database);
			ptr::addr_of_mut!((*body).table).write(table);
			ptr::addr_of_mut!((*body).slot).write(slot);
		}
	}

	/// # Safety
	///
	/// As [`LogRecord::initialize_redo_from_row`], sized by `commit_size`.
	pub(crate) unsafe fn initialize_commit(mem: *mut u8, txn_begin: Timestamp, commit_ts: Timestamp) {
		unsafe {
			Self::initialize(mem, Self::commit_size(), LogRecordType::Commit, txn_begin);
			let body = mem.add(BODY_OFFSET) as *mut CommitRecordBody;
			ptr::addr_of_mut!((*body).commit_ts).write(commit_ts.0);
		}
	}

	pub fn record_type(&self) -> LogRecordType {
		self.record_type
	}

	pub fn txn_begin(&self) -> Timestamp {
		Timestamp(self.txn_begin)
	}

	pub fn redo_body(&self) -> &RedoRecordBody {
		debug_assert_eq!(self.record_type, LogRecordType::Redo);
		unsafe { &*((self as *const LogRecord as *const u8).add(BODY_OFFSET) as *const RedoRecordBody) }
	}

	/// The after-image carried by a redo record.
	pub fn redo_delta(&self) -> &ProjectedRow {
		debug_assert_eq!(self.record_type, LogRecordType::Redo);
		let bytes = unsafe {
			std::slice::from_raw_parts(
				(self as *const LogRecord as *const u8).add(REDO_DELTA_OFFSET),
				self.size as usize - REDO_DELTA_OFFSET,
			)
		};
		unsafe { ProjectedRow::from_bytes(bytes) }
	}

	pub fn delete_body(&self) -> &DeleteRecordBody {
		debug_assert_eq!(self.record_type, LogRecordType::Delete);
		unsafe {
			&*((self as *const LogRecord as *const u8).add(BODY_OFFSET) as *const DeleteRecordBody)
		}
	}

	pub fn commit_body(&self) -> &CommitRecordBody {
		debug_assert_eq!(self.record_type, LogRecordType::Commit);
		unsafe {
			&*((self as *const LogRecord as *const u8).add(BODY_OFFSET) as *const CommitRecordBody)
		}
	}
}
