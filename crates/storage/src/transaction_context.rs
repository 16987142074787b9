// Copyright (c) quarrydb.io 2025
// This file is licensed under the Apache-2.0, see license.md file

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use quarry_core::Timestamp;

use crate::block::TupleSlot;
use crate::data_table::DataTable;
use crate::error::Result;
use crate::ids::{DatabaseId, TableId};
use crate::log_record::LogRecord;
use crate::projected_row::{ProjectedRow, ProjectedRowInitializer};
use crate::record_buffer::{BufferSegmentPool, RedoBuffer, UndoBuffer};
use crate::undo_record::{UndoRecord, UndoRecordType};

/// Everything one transaction owns: its read snapshot (begin timestamp),
/// its transient id, the undo buffer its version-chain entries live in, and
/// the redo buffer handed to the log manager at commit.
///
/// A context is single-writer while the transaction runs; after completion
/// it moves to the garbage collector, which eventually frees it and with it
/// every undo record it produced.
pub struct TransactionContext {
	start_time: Timestamp,
	txn_id: AtomicU64,
	segment_pool: Arc<BufferSegmentPool>,
	undo_buffer: UndoBuffer,
	redo_buffer: Option<RedoBuffer>,
	pending_commit: Option<*mut u8>,
	log_processed: Arc<AtomicBool>,
	aborted: bool,
}

impl TransactionContext {
	pub fn new(start_time: Timestamp, segment_pool: Arc<BufferSegmentPool>) -> Self {
		let undo_buffer = UndoBuffer::new(segment_pool.clone());
		Self {
			start_time,
			txn_id: AtomicU64::new(start_time.as_uncommitted().0),
			segment_pool,
			undo_buffer,
			redo_buffer: None,
			pending_commit: None,
			log_processed: Arc::new(AtomicBool::new(false)),
			aborted: false,
		}
	}

	/// The read snapshot: every version committed at or before this is
	/// visible.
	pub fn begin_ts(&self) -> Timestamp {
		self.start_time
	}

	/// The transient id while in flight, the commit timestamp afterwards.
	pub fn id(&self) -> Timestamp {
		Timestamp(self.txn_id.load(Ordering::Acquire))
	}

	pub fn undo_buffer(&self) -> &UndoBuffer {
		&self.undo_buffer
	}

	/// Atomically publishes `commit` into every undo record this
	/// transaction produced, clearing the uncommitted marker in the same
	/// store. Called by the transaction manager under the exclusive commit
	/// latch.
	pub fn flip_timestamps(&self, commit: Timestamp) {
		for record in self.undo_buffer.iter() {
			unsafe { (*record).timestamp().store(commit.0, Ordering::Release) };
		}
		self.txn_id.store(commit.0, Ordering::Release);
	}

	/// The timestamp the GC orders this completed transaction by: commit
	/// timestamp for committed transactions, begin timestamp for aborted
	/// ones.
	pub fn final_timestamp(&self) -> Timestamp {
		let id = self.id();
		if id.is_uncommitted() {
			self.start_time
		} else {
			id
		}
	}

	pub(crate) fn undo_insert(&mut self, table: *const DataTable) -> Result<*mut UndoRecord> {
		let mem = self.undo_buffer.reserve(UndoRecord::size_without_delta())?;
		// The slot is rewritten per claim attempt while the record is
		// still unpublished.
		Ok(unsafe { UndoRecord::initialize_insert(mem, self.id(), table, TupleSlot::unset()) })
	}

	pub(crate) fn undo_with_delta(
		&mut self,
		record_type: UndoRecordType,
		table: *const DataTable,
		slot: TupleSlot,
		initializer: &ProjectedRowInitializer,
	) -> Result<*mut UndoRecord> {
		let mem = self.undo_buffer.reserve(UndoRecord::size_with_delta(initializer))?;
		Ok(unsafe {
			UndoRecord::initialize_with_delta(mem, record_type, self.id(), table, slot, initializer)
		})
	}

	/// Rolls the bump allocator back over a record that was reserved but
	/// never published (e.g. the insert could not find a slot).
	pub(crate) fn abandon_undo(&mut self, size: usize) {
		self.undo_buffer.undo_last_reserve(size);
	}

	fn redo_buffer(&mut self) -> &mut RedoBuffer {
		self.redo_buffer
			.get_or_insert_with(|| RedoBuffer::new(self.segment_pool.clone()))
	}

	pub(crate) fn stage_write(
		&mut self,
		database: DatabaseId,
		table: TableId,
		slot: TupleSlot,
		row: &ProjectedRow,
	) -> Result<()> {
		let txn_begin = self.start_time;
		let mem = self.redo_buffer().reserve(LogRecord::redo_size_for_row(row))?;
		unsafe { LogRecord::initialize_redo_from_row(mem, txn_begin, database, table, slot, row) };
		Ok(())
	}

	pub(crate) fn stage_delete(
		&mut self,
		database: DatabaseId,
		table: TableId,
		slot: TupleSlot,
	) -> Result<()> {
		let txn_begin = self.start_time;
		let mem = self.redo_buffer().reserve(LogRecord::delete_size())?;
		unsafe { LogRecord::initialize_delete(mem, txn_begin, database, table, slot) };
		Ok(())
	}

	/// Reserves the commit record before the commit timestamp exists, so
	/// that nothing can fail between flipping timestamps and handing the
	/// buffer to the log manager.
	pub fn prepare_commit_record(&mut self) -> Result<()> {
		let txn_begin = self.start_time;
		let mem = self.redo_buffer().reserve(LogRecord::commit_size())?;
		unsafe { LogRecord::initialize_commit(mem, txn_begin, Timestamp(0)) };
		self.pending_commit = Some(mem);
		Ok(())
	}

	/// Stamps the commit timestamp into the record reserved by
	/// [`TransactionContext::prepare_commit_record`].
	pub fn finalize_commit_record(&mut self, commit_ts: Timestamp) {
		let mem = self.pending_commit.take().expect("commit record was prepared");
		unsafe { LogRecord::initialize_commit(mem, self.start_time, commit_ts) };
	}

	/// Whether this transaction has anything to make durable.
	pub fn has_redo(&self) -> bool {
		self.redo_buffer.as_ref().is_some_and(|b| !b.is_empty())
	}

	/// Hands the redo buffer off for serialization (or discard, on abort).
	pub fn take_redo_buffer(&mut self) -> Option<RedoBuffer> {
		self.redo_buffer.take()
	}

	pub fn mark_aborted(&mut self) {
		self.aborted = true;
	}

	pub fn is_aborted(&self) -> bool {
		self.aborted
	}

	/// Set by the log serializer once this transaction's redo buffer is on
	/// its way to disk; the GC must not free the transaction before then,
	/// because serialization still reads varlen contents the transaction's
	/// undo records keep alive.
	pub fn log_processed(&self) -> &Arc<AtomicBool> {
		&self.log_processed
	}
}

// Contexts migrate from the client thread to the completed queue and on to
// the GC thread; the raw pointers inside the buffers stay valid because the
// engine keeps tables and blocks alive for longer than any context.
unsafe impl Send for TransactionContext {}
