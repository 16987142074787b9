// Copyright (c) quarrydb.io 2025
// This file is licensed under the Apache-2.0, see license.md file

use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::RwLock;
use quarry_core::Timestamp;
use tracing::trace;

use crate::block::{BlockStore, RawBlock, TupleSlot};
use crate::error::{Result, StorageError};
use crate::ids::{DatabaseId, TableId};
use crate::layout::BlockLayout;
use crate::projected_row::{ProjectedRow, ProjectedRowBuffer, ProjectedRowInitializer};
use crate::storage_util::{apply_delta, copy_attr_from_block, copy_attr_into_block};
use crate::transaction_context::TransactionContext;
use crate::tuple_access::TupleAccessStrategy;
use crate::undo_record::{UndoRecord, UndoRecordType};
use crate::varlen::VarlenEntry;

/// A logical heap of tuples spread across raw blocks.
///
/// All mutation goes through the MVCC protocol: the mutating transaction
/// CAS-installs an undo record at the slot's version-chain head (its write
/// lock on the slot), then changes the slot contents in place. Readers copy
/// slot contents first and repair them by applying before-images, so they
/// never block writers and writers never block readers.
pub struct DataTable {
	database: DatabaseId,
	table_id: TableId,
	block_store: Arc<BlockStore>,
	accessor: TupleAccessStrategy,
	layout_version: u32,
	full_row_initializer: ProjectedRowInitializer,
	blocks: RwLock<Vec<RawBlock>>,
}

impl DataTable {
	pub fn new(
		block_store: Arc<BlockStore>,
		layout: BlockLayout,
		database: DatabaseId,
		table_id: TableId,
	) -> Self {
		assert_eq!(layout.block_size(), block_store.block_size());
		let full_row_initializer = ProjectedRowInitializer::all_columns(&layout);
		Self {
			database,
			table_id,
			block_store,
			accessor: TupleAccessStrategy::new(layout),
			layout_version: 0,
			full_row_initializer,
			blocks: RwLock::new(Vec::new()),
		}
	}

	pub fn database(&self) -> DatabaseId {
		self.database
	}

	pub fn table_id(&self) -> TableId {
		self.table_id
	}

	pub fn accessor(&self) -> &TupleAccessStrategy {
		&self.accessor
	}

	pub fn layout(&self) -> &BlockLayout {
		self.accessor.layout()
	}

	/// An initializer covering every user column, e.g. for full scans and
	/// delete before-images.
	pub fn full_row_initializer(&self) -> &ProjectedRowInitializer {
		&self.full_row_initializer
	}

	/// Snapshot of the block list. Readers iterate the snapshot; blocks are
	/// only ever appended.
	pub fn blocks(&self) -> Vec<RawBlock> {
		self.blocks.read().clone()
	}

	/// Materializes the version of `slot` visible to `txn` into `out`.
	/// Returns false when no version at or below the transaction's snapshot
	/// exists (a visibility miss, not an error).
	pub fn select(&self, txn: &TransactionContext, slot: TupleSlot, out: &mut ProjectedRow) -> bool {
		self.select_at(txn.begin_ts(), txn.id(), slot, out)
	}

	fn select_at(
		&self,
		begin: Timestamp,
		txn_id: Timestamp,
		slot: TupleSlot,
		out: &mut ProjectedRow,
	) -> bool {
		let _guard = slot.block().acquire_read();

		// Copy current content first; the copy may be torn by a concurrent
		// writer, but every byte a writer may be changing is covered by a
		// before-image we apply below.
		let mut visible = self.accessor.allocated(slot);
		for index in 0..out.num_columns() {
			copy_attr_from_block(&self.accessor, slot, out, index);
		}

		let mut current = self.accessor.version_ptr(slot);
		while !current.is_null() {
			let record = unsafe { &*current };
			if record.visible_to(begin, txn_id) {
				break;
			}
			match record.record_type() {
				// Before this version the tuple did not exist.
				UndoRecordType::Insert => visible = false,
				UndoRecordType::Update | UndoRecordType::Delete => {
					apply_delta(record.delta().expect("update/delete carry a delta"), out);
					visible = true;
				}
			}
			current = record.next().load(Ordering::Acquire);
		}
		visible
	}

	/// Inserts a full row, allocating a slot from the last block and growing
	/// the table when it is full. Fails with `TableFull` and no partial
	/// effects when the block store is exhausted.
	pub fn insert(&self, txn: &mut TransactionContext, row: &ProjectedRow) -> Result<TupleSlot> {
		debug_assert_eq!(row.num_columns() + 1, self.layout().num_columns(), "insert takes a full row");
		let record = txn.undo_insert(self as *const DataTable)?;
		loop {
			let last = self.blocks.read().last().copied();
			if let Some(block) = last {
				// Re-heat before claiming anything so a concurrent gather
				// pass either finishes first or backs off.
				block.touch_for_write();
				if let Some(offset) = self.accessor.allocate(block, record) {
					let slot = TupleSlot::new(block, offset);
					for index in 0..row.num_columns() {
						copy_attr_into_block(&self.accessor, row, index, slot);
					}
					txn.stage_write(self.database, self.table_id, slot, row)?;
					return Ok(slot);
				}
			}
			if let Err(error) = self.add_block(last) {
				txn.abandon_undo(UndoRecord::size_without_delta());
				return Err(error);
			}
		}
	}

	/// Inserts into a specific block, used by the compactor to densify a
	/// block in place. Fails with `BlockFull` instead of growing the table.
	pub fn insert_into(
		&self,
		txn: &mut TransactionContext,
		row: &ProjectedRow,
		block: RawBlock,
	) -> Result<TupleSlot> {
		let record = txn.undo_insert(self as *const DataTable)?;
		match self.accessor.allocate(block, record) {
			Some(offset) => {
				let slot = TupleSlot::new(block, offset);
				for index in 0..row.num_columns() {
					copy_attr_into_block(&self.accessor, row, index, slot);
				}
				txn.stage_write(self.database, self.table_id, slot, row)?;
				Ok(slot)
			}
			None => {
				txn.abandon_undo(UndoRecord::size_without_delta());
				Err(StorageError::BlockFull)
			}
		}
	}

	fn add_block(&self, known_last: Option<RawBlock>) -> Result<()> {
		let mut blocks = self.blocks.write();
		if blocks.last().copied() != known_last {
			// Someone else grew the table while we waited; retry on their
			// block.
			return Ok(());
		}
		let block = self.block_store.get().map_err(|error| match error {
			StorageError::OutOfMemory(exhausted) => StorageError::TableFull(exhausted),
			other => other,
		})?;
		self.accessor
			.initialize_block(block, self as *const DataTable, self.layout_version);
		trace!(table = %self.table_id, blocks = blocks.len() + 1, "table grew by one block");
		blocks.push(block);
		Ok(())
	}

	/// Updates the projected columns of `slot` to the values in `row`.
	///
	/// The undo record carrying the before-image of just the updated
	/// columns is CAS-linked at the chain head; on CAS failure the conflict
	/// rule is re-evaluated against the new head. Two updates of the same
	/// slot by one transaction produce two undo records.
	pub fn update(&self, txn: &mut TransactionContext, slot: TupleSlot, row: &ProjectedRow) -> Result<()> {
		let col_ids = (0..row.num_columns()).map(|i| row.column_id(i)).collect();
		let initializer = ProjectedRowInitializer::new(self.layout(), col_ids);
		let record = txn.undo_with_delta(UndoRecordType::Update, self, slot, &initializer)?;
		self.install_and_apply(txn, slot, record, Some(row))?;
		txn.stage_write(self.database, self.table_id, slot, row)?;
		Ok(())
	}

	/// Logically deletes `slot`: installs a delete-marker undo record
	/// carrying the full before-image, then clears the presence bit under
	/// the version's protection.
	pub fn delete(&self, txn: &mut TransactionContext, slot: TupleSlot) -> Result<()> {
		let record =
			txn.undo_with_delta(UndoRecordType::Delete, self, slot, &self.full_row_initializer)?;
		self.install_and_apply(txn, slot, record, None)?;
		self.accessor.deallocate(slot);
		txn.stage_delete(self.database, self.table_id, slot)?;
		Ok(())
	}

	/// Shared update/delete path: evaluate the conflict rule, capture the
	/// before-image, CAS-install at the chain head, then apply the new
	/// values (updates only).
	fn install_and_apply(
		&self,
		txn: &TransactionContext,
		slot: TupleSlot,
		record: *mut UndoRecord,
		after_image: Option<&ProjectedRow>,
	) -> Result<()> {
		// Re-heat before claiming the version: a gather pass in progress
		// finishes first, one not yet started will see the hot state and
		// back off.
		slot.block().touch_for_write();
		loop {
			let head = self.accessor.version_ptr(slot);
			if self.write_conflict(head, slot, txn) {
				return Err(StorageError::WriteWriteConflict { slot });
			}
			// Capture the before-image. The head load above synchronizes
			// with the previous owner's release of the slot, so these reads
			// see settled bytes; if a new owner sneaks in, our CAS fails
			// and we recapture.
			let delta = unsafe { (*record).delta_mut().expect("update/delete carry a delta") };
			for index in 0..delta.num_columns() {
				copy_attr_from_block(&self.accessor, slot, delta, index);
			}
			unsafe { (*record).next().store(head, Ordering::Relaxed) };
			if self.accessor.compare_exchange_version_ptr(slot, head, record) {
				break;
			}
		}
		if let Some(row) = after_image {
			for index in 0..row.num_columns() {
				copy_attr_into_block(&self.accessor, row, index, slot);
			}
		}
		Ok(())
	}

	/// The write-write conflict rule. A mutation fails if the chain head is
	/// another transaction's in-flight version, a version committed after
	/// this transaction's snapshot, or a delete visible to it (including
	/// its own).
	fn write_conflict(&self, head: *mut UndoRecord, slot: TupleSlot, txn: &TransactionContext) -> bool {
		if head.is_null() {
			// No chain: the tuple exists iff its presence bit survived GC.
			return !self.accessor.allocated(slot);
		}
		let record = unsafe { &*head };
		let ts = Timestamp(record.timestamp().load(Ordering::Acquire));
		if ts.is_uncommitted() {
			if ts != txn.id() {
				return true;
			}
		} else if ts > txn.begin_ts() {
			return true;
		}
		// Updating through a delete marker: the tuple is gone for us.
		record.record_type() == UndoRecordType::Delete
	}

	/// Restores the newest version this transaction installed on `slot` and
	/// pops it off the chain. Called once per undo record on abort; popping
	/// newest-first per slot restores the original state regardless of the
	/// iteration order of the undo buffer.
	///
	/// No CAS is needed for the final pointer write: the head still carries
	/// the transaction's id, which no one else may overwrite.
	pub fn rollback(&self, txn_id: Timestamp, slot: TupleSlot) {
		let head = self.accessor.version_ptr(slot);
		if head.is_null() {
			return;
		}
		let record = unsafe { &*head };
		if Timestamp(record.timestamp().load(Ordering::Acquire)) != txn_id {
			return;
		}
		match record.record_type() {
			UndoRecordType::Insert => {
				self.reclaim_owned_varlens(slot, &self.full_row_initializer);
				self.accessor.deallocate(slot);
			}
			UndoRecordType::Update => {
				let delta = record.delta().expect("update carries a delta");
				self.reclaim_replaced_varlens(slot, delta);
				for index in 0..delta.num_columns() {
					copy_attr_into_block(&self.accessor, delta, index, slot);
				}
			}
			UndoRecordType::Delete => {
				let delta = record.delta().expect("delete carries a delta");
				for index in 0..delta.num_columns() {
					copy_attr_into_block(&self.accessor, delta, index, slot);
				}
				self.accessor
					.presence_bitmap(slot.block())
					.set(slot.offset() as usize);
			}
		}
		self.accessor
			.store_version_ptr(slot, record.next().load(Ordering::Acquire));
	}

	/// Frees the varlen allocations the aborting transaction published into
	/// the slot for the columns `delta` is about to restore.
	fn reclaim_replaced_varlens(&self, slot: TupleSlot, delta: &ProjectedRow) {
		for index in 0..delta.num_columns() {
			let col = delta.column_id(index);
			if !self.layout().is_varlen(col) {
				continue;
			}
			if let Some(ptr) = self.accessor.access_with_null_check(slot, col) {
				let entry = unsafe { (ptr as *const VarlenEntry).read() };
				if entry.is_reclaimable() {
					unsafe { entry.reclaim() };
				}
			}
		}
	}

	/// Frees every varlen allocation currently stored in the slot; used when
	/// rolling back an insert.
	fn reclaim_owned_varlens(&self, slot: TupleSlot, columns: &ProjectedRowInitializer) {
		for (index, &col) in columns.column_ids().iter().enumerate() {
			if !columns.is_varlen(index as u16) {
				continue;
			}
			if let Some(ptr) = self.accessor.access_with_null_check(slot, col) {
				let entry = unsafe { (ptr as *const VarlenEntry).read() };
				if entry.is_reclaimable() {
					unsafe { entry.reclaim() };
				}
				self.accessor.set_null(slot, col);
			}
		}
	}

	/// Unlinks a dead undo record from its chain. Only the (single) GC
	/// thread calls this, and only for records no active snapshot can
	/// reach, so interior pointer writes cannot race with anything but
	/// head pushes, which the CAS absorbs.
	pub fn unlink_undo_record(&self, record: *mut UndoRecord) {
		let slot = unsafe { (*record).slot() };
		loop {
			let head = self.accessor.version_ptr(slot);
			if head == record {
				let next = unsafe { (*record).next().load(Ordering::Acquire) };
				if self.accessor.compare_exchange_version_ptr(slot, record, next) {
					return;
				}
				continue;
			}
			let mut prev = head;
			while !prev.is_null() {
				let next = unsafe { (*prev).next().load(Ordering::Acquire) };
				if next == record {
					let after = unsafe { (*record).next().load(Ordering::Acquire) };
					unsafe { (*prev).next().store(after, Ordering::Release) };
					return;
				}
				prev = next;
			}
			// Already off-chain (rollback got here first).
			return;
		}
	}

	/// Lazy snapshot scan over every tuple visible to `txn`, projected to
	/// the initializer's columns. Restart by calling `scan` again.
	pub fn scan<'a>(
		&'a self,
		txn: &'a TransactionContext,
		initializer: &'a ProjectedRowInitializer,
	) -> TableScanIter<'a> {
		TableScanIter {
			table: self,
			txn,
			initializer,
			blocks: self.blocks(),
			block_index: 0,
			offset: 0,
		}
	}
}

impl Drop for DataTable {
	fn drop(&mut self) {
		let num_cols = self.layout().num_columns();
		let num_slots = self.accessor.layout().num_slots();
		let blocks = std::mem::take(&mut *self.blocks.write());
		for block in blocks {
			// Gathered Arrow buffers.
			unsafe { self.accessor.arrow_metadata_mut(block) }.deallocate_columns(num_cols);
			// Varlen allocations still owned by live tuples. Superseded
			// values are owned by undo records and freed by the GC.
			for offset in 0..num_slots {
				let slot = TupleSlot::new(block, offset);
				if self.accessor.allocated(slot) {
					self.reclaim_owned_varlens(slot, &self.full_row_initializer);
				}
			}
			self.block_store.release(block);
		}
	}
}

/// Iterator returned by [`DataTable::scan`].
pub struct TableScanIter<'a> {
	table: &'a DataTable,
	txn: &'a TransactionContext,
	initializer: &'a ProjectedRowInitializer,
	blocks: Vec<RawBlock>,
	block_index: usize,
	offset: u32,
}

impl Iterator for TableScanIter<'_> {
	type Item = (TupleSlot, ProjectedRowBuffer);

	fn next(&mut self) -> Option<Self::Item> {
		loop {
			let block = *self.blocks.get(self.block_index)?;
			let bound = block
				.header()
				.insert_head()
				.load(Ordering::Acquire)
				.min(self.table.layout().num_slots());
			if self.offset >= bound {
				self.block_index += 1;
				self.offset = 0;
				continue;
			}
			let slot = TupleSlot::new(block, self.offset);
			self.offset += 1;
			let mut buffer = ProjectedRowBuffer::new(self.initializer);
			if self.table.select(self.txn, slot, buffer.row_mut()) {
				return Some((slot, buffer));
			}
		}
	}
}
