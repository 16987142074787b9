// Copyright (c) quarrydb.io 2025
// This file is licensed under the Apache-2.0, see license.md file

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use quarry_core::bitmap::RawBitmap;
use quarry_core::Timestamp;
use quarry_storage::{
	ArrowColumnInfo, ArrowColumnType, ArrowVarlenColumn, BlockState, ColumnId, DataTable,
	ProjectedRow, ProjectedRowBuffer, RawBlock, TableId, TupleSlot, VarlenEntry,
	VARLEN_INLINE_THRESHOLD,
};
use quarry_transaction::TransactionManager;
use tracing::{debug, trace};

const VARLEN_VALUE_SIZE: usize = 16;

struct CompactionGroup {
	table: Arc<DataTable>,
	block: RawBlock,
	/// Time the block last entered the cooling state. Gather may only run
	/// once every transaction that could have read the block latch-free has
	/// ended, i.e. once the oldest active begin timestamp passes the fence.
	fence: Option<Timestamp>,
}

/// Compacts partially empty blocks and gathers cold blocks into Arrow
/// layout.
///
/// Blocks are enqueued by policy (high empty-slot ratio, no active
/// writers); each queue pass moves live tuples into the lowest free slots
/// through the normal MVCC insert+delete path. Once the block is cold and
/// the cooling fence has passed, a gather pass rewrites varlen columns into
/// contiguous values+offsets buffers under the block's exclusive latch.
pub struct BlockCompactor {
	txn_manager: Arc<TransactionManager>,
	queue: Mutex<VecDeque<CompactionGroup>>,
	dictionary_columns: Mutex<HashSet<(TableId, ColumnId)>>,
}

impl BlockCompactor {
	pub fn new(txn_manager: Arc<TransactionManager>) -> Self {
		Self {
			txn_manager,
			queue: Mutex::new(VecDeque::new()),
			dictionary_columns: Mutex::new(HashSet::new()),
		}
	}

	/// Marks a varlen column for dictionary compression in subsequent
	/// gather passes.
	pub fn compress_as_dictionary(&self, table: TableId, col: ColumnId) {
		self.dictionary_columns.lock().insert((table, col));
	}

	/// Enqueues a block for compaction; the block starts cooling, making
	/// readers take the shared latch.
	pub fn put_in_queue(&self, table: Arc<DataTable>, block: RawBlock) {
		block.set_state(BlockState::Cooling);
		self.queue.lock().push_back(CompactionGroup {
			table,
			block,
			fence: None,
		});
	}

	/// One pass over the queue. Returns how many blocks reached the frozen
	/// state; unfinished blocks are requeued for the next pass.
	pub fn process_compaction_queue(&self) -> usize {
		let mut frozen = 0;
		let batch: Vec<CompactionGroup> = {
			let mut queue = self.queue.lock();
			queue.drain(..).collect()
		};
		for group in batch {
			match self.process_group(group) {
				None => frozen += 1,
				Some(group) => self.queue.lock().push_back(group),
			}
		}
		frozen
	}

	/// Returns the group to requeue, or `None` once the block is frozen.
	fn process_group(&self, mut group: CompactionGroup) -> Option<CompactionGroup> {
		let block = group.block;
		if block.state() == BlockState::Hot {
			// A writer re-heated the block; start cooling over.
			block.set_state(BlockState::Cooling);
			group.fence = None;
			return Some(group);
		}

		match self.compact_block(&group.table, block) {
			// Moves create fresh version chains; gather must wait for the
			// GC to prune them.
			Ok(moved) if moved > 0 => {
				group.fence = None;
				return Some(group);
			}
			Ok(_) => {}
			Err(()) => {
				trace!("compaction pass hit a concurrent writer, requeueing");
				group.fence = None;
				return Some(group);
			}
		}

		let fence = *group.fence.get_or_insert_with(|| self.txn_manager.time());
		if self.txn_manager.oldest_transaction_start_time() < fence {
			return Some(group);
		}

		if self.gather_block(&group.table, block) {
			debug!(table = %group.table.table_id(), "block gathered and frozen");
			None
		} else {
			Some(group)
		}
	}

	/// Moves live tuples toward the low-offset end of the block, producing
	/// a dense prefix. Runs under a transaction so concurrent readers keep
	/// seeing consistent snapshots. `Err` means a conflict or a hot tuple;
	/// the whole pass is rolled back and retried later.
	fn compact_block(&self, table: &DataTable, block: RawBlock) -> Result<usize, ()> {
		let accessor = table.accessor();
		let num_slots = table.layout().num_slots();
		let mut txn = self.txn_manager.begin();
		let mut moved = 0;

		for offset in (0..num_slots).rev() {
			let slot = TupleSlot::new(block, offset);
			if !accessor.allocated(slot) {
				continue;
			}
			// Tuples with version chains are not movable (slot stability);
			// the block is simply still hot.
			if !accessor.version_ptr(slot).is_null() {
				txn.abort();
				return Err(());
			}
			let Some(first_free) = accessor.presence_bitmap(block).first_clear(num_slots as usize)
			else {
				break;
			};
			if first_free as u32 >= offset {
				// Everything below is occupied: the prefix is dense.
				break;
			}

			let mut buffer = ProjectedRowBuffer::new(table.full_row_initializer());
			if !table.select(&txn, slot, buffer.row_mut()) {
				continue;
			}
			deep_copy_varlens(buffer.row_mut());

			let new_slot = match table.insert_into(&mut txn, buffer.row(), block) {
				Ok(new_slot) => new_slot,
				Err(_) => {
					txn.abort();
					return Err(());
				}
			};
			if new_slot.offset() >= offset {
				// Lost the slot to a concurrent inserter.
				txn.abort();
				return Err(());
			}
			if table.delete(&mut txn, slot).is_err() {
				txn.abort();
				return Err(());
			}
			moved += 1;
		}

		if moved == 0 {
			txn.abort();
			return Ok(0);
		}
		trace!(moved, "compaction pass moved tuples into the dense prefix");
		match txn.commit(Box::new(|_| {})) {
			Ok(_) => Ok(moved),
			Err(_) => Err(()),
		}
	}

	/// Rewrites a cold block's varlen columns into Arrow layout. Runs under
	/// the block's exclusive latch; returns false (to retry) if the latch
	/// is contended, the block re-heated, or a version chain survives.
	fn gather_block(&self, table: &DataTable, block: RawBlock) -> bool {
		let Some(_guard) = block.try_acquire_exclusive() else {
			return false;
		};
		if block.state() != BlockState::Cooling {
			return false;
		}
		let accessor = table.accessor();
		let layout = table.layout();
		let num_slots = layout.num_slots();
		for offset in 0..num_slots {
			if !accessor.version_ptr(TupleSlot::new(block, offset)).is_null() {
				return false;
			}
		}
		block.set_state(BlockState::Freezing);

		let num_cols = layout.num_columns();
		let presence = accessor.presence_bitmap(block);
		let meta = unsafe { accessor.arrow_metadata_mut(block) };
		meta.set_num_records(presence.count_set(num_slots as usize) as u32);

		let dictionary = self.dictionary_columns.lock();
		for col in layout.user_columns() {
			let mut null_count = 0;
			for offset in 0..num_slots {
				let slot = TupleSlot::new(block, offset);
				if presence.test(offset as usize) && accessor.is_null(slot, col) {
					null_count += 1;
				}
			}
			meta.set_null_count(col, null_count);

			let info = meta.column_info_mut(num_cols, col);
			if !layout.is_varlen(col) {
				// Fixed-length columns are already Arrow-compatible in
				// place.
				info.set_column_type(ArrowColumnType::Fixed);
				continue;
			}
			if dictionary.contains(&(table.table_id(), col)) {
				gather_dictionary_column(table, block, col, &presence, num_slots, info);
			} else {
				gather_varlen_column(table, block, col, &presence, num_slots, info);
			}
		}

		block.set_state(BlockState::Frozen);
		true
	}
}

/// Replaces every varlen entry in `row` with a freshly owned copy, so a
/// moved tuple never shares allocations with the to-be-deleted original.
fn deep_copy_varlens(row: &mut ProjectedRow) {
	for index in 0..row.num_columns() {
		if row.value_size(index) != VARLEN_VALUE_SIZE {
			continue;
		}
		if let Some(entry) = row.varlen_entry(index) {
			row.set_varlen_entry(index, VarlenEntry::from_bytes(entry.as_bytes()));
		}
	}
}

fn read_entry(table: &DataTable, slot: TupleSlot, col: ColumnId) -> Option<VarlenEntry> {
	table
		.accessor()
		.access_with_null_check(slot, col)
		.map(|ptr| unsafe { (ptr as *const VarlenEntry).read() })
}

/// Builds the replacement entry for a gathered value: small values stay
/// inline, larger ones point into the gather buffer.
///
/// # Safety contract: `values_ptr` must outlive the block's current frozen
/// incarnation, which `ArrowColumnInfo::install_varlen` guarantees.
fn rebuilt_entry(values_ptr: *const u8, start: usize, bytes: &[u8]) -> VarlenEntry {
	if bytes.len() <= VARLEN_INLINE_THRESHOLD {
		VarlenEntry::inline(bytes)
	} else {
		unsafe { VarlenEntry::gathered(values_ptr.add(start), bytes.len() as u32, bytes) }
	}
}

fn gather_varlen_column(
	table: &DataTable,
	block: RawBlock,
	col: ColumnId,
	presence: &RawBitmap<'_>,
	num_slots: u32,
	info: &mut ArrowColumnInfo,
) {
	let accessor = table.accessor();

	let mut offsets = vec![0u32; num_slots as usize + 1];
	let mut values_len = 0usize;
	for offset in 0..num_slots {
		offsets[offset as usize] = values_len as u32;
		let slot = TupleSlot::new(block, offset);
		if presence.test(offset as usize) {
			if let Some(entry) = read_entry(table, slot, col) {
				values_len += entry.size();
			}
		}
	}
	offsets[num_slots as usize] = values_len as u32;

	let mut column = ArrowVarlenColumn::allocate(values_len as u32, num_slots + 1);
	for offset in 0..num_slots {
		let slot = TupleSlot::new(block, offset);
		if !presence.test(offset as usize) {
			continue;
		}
		if let Some(entry) = read_entry(table, slot, col) {
			let start = offsets[offset as usize] as usize;
			column.values_mut()[start..start + entry.size()].copy_from_slice(entry.as_bytes());
		}
	}
	column.offsets_mut().copy_from_slice(&offsets);

	// Swap the block's entries over to the gathered buffer and free the
	// old allocations.
	let values_ptr = column.values_ptr();
	for offset in 0..num_slots {
		let slot = TupleSlot::new(block, offset);
		if !presence.test(offset as usize) {
			continue;
		}
		let cell = accessor.access(slot, col) as *mut VarlenEntry;
		let Some(old) = read_entry(table, slot, col) else {
			continue;
		};
		let start = offsets[offset as usize] as usize;
		let bytes = &column.values()[start..start + old.size()];
		let rebuilt = rebuilt_entry(values_ptr, start, bytes);
		unsafe { cell.write(rebuilt) };
		if old.is_reclaimable() {
			unsafe { old.reclaim() };
		}
	}

	info.install_varlen(column);
	info.set_column_type(ArrowColumnType::GatheredVarlen);
}

fn gather_dictionary_column(
	table: &DataTable,
	block: RawBlock,
	col: ColumnId,
	presence: &RawBitmap<'_>,
	num_slots: u32,
	info: &mut ArrowColumnInfo,
) {
	let accessor = table.accessor();

	// De-duplicate values in sorted order.
	let mut distinct: BTreeMap<Vec<u8>, u32> = BTreeMap::new();
	for offset in 0..num_slots {
		let slot = TupleSlot::new(block, offset);
		if presence.test(offset as usize) {
			if let Some(entry) = read_entry(table, slot, col) {
				distinct.entry(entry.as_bytes().to_vec()).or_insert(0);
			}
		}
	}
	let mut values_len = 0usize;
	let mut value_offsets = Vec::with_capacity(distinct.len() + 1);
	for (index, (value, slot_index)) in distinct.iter_mut().enumerate() {
		*slot_index = index as u32;
		value_offsets.push(values_len as u32);
		values_len += value.len();
	}
	value_offsets.push(values_len as u32);

	let mut column = ArrowVarlenColumn::allocate(values_len as u32, distinct.len() as u32 + 1);
	{
		let values = column.values_mut();
		for (value, index) in &distinct {
			let start = value_offsets[*index as usize] as usize;
			values[start..start + value.len()].copy_from_slice(value);
		}
	}
	column.offsets_mut().copy_from_slice(&value_offsets);

	// Per-slot indices; empty or null slots get the sentinel.
	let mut indices = vec![u32::MAX; num_slots as usize];
	let values_ptr = column.values_ptr();
	for offset in 0..num_slots {
		let slot = TupleSlot::new(block, offset);
		if !presence.test(offset as usize) {
			continue;
		}
		let Some(old) = read_entry(table, slot, col) else {
			continue;
		};
		let index = distinct[old.as_bytes()];
		indices[offset as usize] = index;
		let start = value_offsets[index as usize] as usize;
		let bytes = &column.values()[start..start + old.size()];
		let rebuilt = rebuilt_entry(values_ptr, start, bytes);
		let cell = accessor.access(slot, col) as *mut VarlenEntry;
		unsafe { cell.write(rebuilt) };
		if old.is_reclaimable() {
			unsafe { old.reclaim() };
		}
	}

	info.install_varlen(column);
	info.install_indices(indices.into_boxed_slice());
	info.set_column_type(ArrowColumnType::DictionaryCompressed);
}
