// Copyright (c) quarrydb.io 2025
// This file is licensed under the Apache-2.0, see license.md file

//! MVCC semantics of the data table, driven with hand-built transaction
//! contexts. The transaction crate owns the real timestamp dispensing; here
//! timestamps are chosen explicitly to pin down visibility rules.

use std::sync::Arc;

use quarry_core::Timestamp;
use quarry_storage::{
	BlockLayout, BlockStore, BufferSegmentPool, DataTable, DatabaseId, ProjectedRow,
	ProjectedRowBuffer, SegmentAllocator, StorageError, TableId, TransactionContext, TupleSlot,
};

const SMALL_BLOCK: usize = 4096;

fn setup(store_limit: u64) -> (Arc<DataTable>, Arc<BufferSegmentPool>) {
	let store = Arc::new(BlockStore::new(SMALL_BLOCK, store_limit, store_limit));
	let layout = BlockLayout::new(SMALL_BLOCK, &[8]).unwrap();
	let table = Arc::new(DataTable::new(store, layout, DatabaseId(1), TableId(1)));
	let pool = Arc::new(BufferSegmentPool::new(SegmentAllocator, 10_000, 1_000));
	(table, pool)
}

fn txn(begin: u64, pool: &Arc<BufferSegmentPool>) -> TransactionContext {
	TransactionContext::new(Timestamp(begin), pool.clone())
}

fn int_row(table: &DataTable, value: i64) -> ProjectedRowBuffer {
	let mut buffer = ProjectedRowBuffer::new(table.full_row_initializer());
	buffer
		.row_mut()
		.access_force_not_null(0)
		.copy_from_slice(&value.to_ne_bytes());
	buffer
}

fn read_int(row: &ProjectedRow) -> Option<i64> {
	row.access_with_null_check(0)
		.map(|bytes| i64::from_ne_bytes(bytes.try_into().unwrap()))
}

fn select_int(table: &DataTable, reader: &TransactionContext, slot: TupleSlot) -> Option<Option<i64>> {
	let mut buffer = ProjectedRowBuffer::new(table.full_row_initializer());
	table.select(reader, slot, buffer.row_mut()).then(|| read_int(buffer.row()))
}

#[test]
fn insert_is_visible_to_itself_but_not_to_others_until_commit() {
	let (table, pool) = setup(10);
	let mut writer = txn(1, &pool);
	let slot = table.insert(&mut writer, int_row(&table, 5).row()).unwrap();

	assert_eq!(select_int(&table, &writer, slot), Some(Some(5)));

	let reader = txn(2, &pool);
	assert_eq!(select_int(&table, &reader, slot), None);

	// Commit at 3: still invisible to the snapshot at 2, visible at 4.
	writer.flip_timestamps(Timestamp(3));
	assert_eq!(select_int(&table, &reader, slot), None);
	let late_reader = txn(4, &pool);
	assert_eq!(select_int(&table, &late_reader, slot), Some(Some(5)));
}

#[test]
fn readers_keep_their_snapshot_across_updates() {
	let (table, pool) = setup(10);
	let mut setup_txn = txn(1, &pool);
	let slot = table.insert(&mut setup_txn, int_row(&table, 5).row()).unwrap();
	setup_txn.flip_timestamps(Timestamp(2));

	let reader = txn(3, &pool);
	assert_eq!(select_int(&table, &reader, slot), Some(Some(5)));

	let mut updater = txn(4, &pool);
	table.update(&mut updater, slot, int_row(&table, 7).row()).unwrap();
	// In-flight update: reader still sees 5.
	assert_eq!(select_int(&table, &reader, slot), Some(Some(5)));
	updater.flip_timestamps(Timestamp(5));
	// Committed after the reader began: still 5.
	assert_eq!(select_int(&table, &reader, slot), Some(Some(5)));

	let fresh = txn(6, &pool);
	assert_eq!(select_int(&table, &fresh, slot), Some(Some(7)));
}

#[test]
fn concurrent_writers_conflict() {
	let (table, pool) = setup(10);
	let mut setup_txn = txn(1, &pool);
	let slot = table.insert(&mut setup_txn, int_row(&table, 10).row()).unwrap();
	setup_txn.flip_timestamps(Timestamp(2));

	let mut first = txn(3, &pool);
	table.update(&mut first, slot, int_row(&table, 11).row()).unwrap();

	let mut second = txn(4, &pool);
	assert!(matches!(
		table.update(&mut second, slot, int_row(&table, 12).row()),
		Err(StorageError::WriteWriteConflict { .. })
	));

	// After the first commits, a transaction with a newer snapshot wins.
	first.flip_timestamps(Timestamp(5));
	let mut third = txn(6, &pool);
	table.update(&mut third, slot, int_row(&table, 20).row()).unwrap();
	third.flip_timestamps(Timestamp(7));

	let reader = txn(8, &pool);
	assert_eq!(select_int(&table, &reader, slot), Some(Some(20)));
}

#[test]
fn committed_newer_version_also_conflicts() {
	let (table, pool) = setup(10);
	let mut setup_txn = txn(1, &pool);
	let slot = table.insert(&mut setup_txn, int_row(&table, 1).row()).unwrap();
	setup_txn.flip_timestamps(Timestamp(2));

	// Stale snapshot from before the update below committed.
	let mut stale = txn(3, &pool);

	let mut updater = txn(4, &pool);
	table.update(&mut updater, slot, int_row(&table, 2).row()).unwrap();
	updater.flip_timestamps(Timestamp(5));

	assert!(matches!(
		table.update(&mut stale, slot, int_row(&table, 3).row()),
		Err(StorageError::WriteWriteConflict { .. })
	));
}

#[test]
fn same_transaction_may_update_twice_without_coalescing() {
	let (table, pool) = setup(10);
	let mut writer = txn(1, &pool);
	let slot = table.insert(&mut writer, int_row(&table, 1).row()).unwrap();
	let records_after_insert = writer.undo_buffer().record_count();

	table.update(&mut writer, slot, int_row(&table, 2).row()).unwrap();
	table.update(&mut writer, slot, int_row(&table, 3).row()).unwrap();

	// Two updates, two undo records: duplicates are not coalesced.
	assert_eq!(writer.undo_buffer().record_count(), records_after_insert + 2);
	assert_eq!(select_int(&table, &writer, slot), Some(Some(3)));
}

#[test]
fn delete_hides_the_tuple_from_newer_snapshots_only() {
	let (table, pool) = setup(10);
	let mut setup_txn = txn(1, &pool);
	let slot = table.insert(&mut setup_txn, int_row(&table, 9).row()).unwrap();
	setup_txn.flip_timestamps(Timestamp(2));

	let old_reader = txn(3, &pool);

	let mut deleter = txn(4, &pool);
	table.delete(&mut deleter, slot).unwrap();
	deleter.flip_timestamps(Timestamp(5));

	// The presence bit is cleared, but the before-image keeps the old
	// snapshot whole.
	assert_eq!(select_int(&table, &old_reader, slot), Some(Some(9)));
	let new_reader = txn(6, &pool);
	assert_eq!(select_int(&table, &new_reader, slot), None);
}

#[test]
fn mutating_through_a_delete_marker_conflicts() {
	let (table, pool) = setup(10);
	let mut writer = txn(1, &pool);
	let slot = table.insert(&mut writer, int_row(&table, 9).row()).unwrap();
	table.delete(&mut writer, slot).unwrap();

	assert!(matches!(
		table.update(&mut writer, slot, int_row(&table, 10).row()),
		Err(StorageError::WriteWriteConflict { .. })
	));
	assert!(matches!(
		table.delete(&mut writer, slot),
		Err(StorageError::WriteWriteConflict { .. })
	));
}

#[test]
fn null_columns_round_trip() {
	let (table, pool) = setup(10);
	let mut writer = txn(1, &pool);
	let buffer = ProjectedRowBuffer::new(table.full_row_initializer());
	let slot = table.insert(&mut writer, buffer.row()).unwrap();
	writer.flip_timestamps(Timestamp(2));

	let reader = txn(3, &pool);
	assert_eq!(select_int(&table, &reader, slot), Some(None));
}

#[test]
fn full_block_triggers_growth() {
	let (table, pool) = setup(10);
	let mut writer = txn(1, &pool);
	let num_slots = table.layout().num_slots();
	for value in 0..=num_slots {
		table.insert(&mut writer, int_row(&table, value as i64).row()).unwrap();
	}
	assert_eq!(table.blocks().len(), 2);
}

#[test]
fn exhausted_block_store_fails_without_partial_effects() {
	let (table, pool) = setup(1);
	let mut writer = txn(1, &pool);
	let num_slots = table.layout().num_slots();
	for value in 0..num_slots {
		table.insert(&mut writer, int_row(&table, value as i64).row()).unwrap();
	}
	let records_before = writer.undo_buffer().record_count();

	assert!(matches!(
		table.insert(&mut writer, int_row(&table, -1).row()),
		Err(StorageError::TableFull(_))
	));

	assert_eq!(writer.undo_buffer().record_count(), records_before);
	assert_eq!(table.blocks().len(), 1);
	writer.flip_timestamps(Timestamp(2));
	let reader = txn(3, &pool);
	assert_eq!(
		table.scan(&reader, table.full_row_initializer()).count() as u32,
		num_slots
	);
}

#[test]
fn scan_yields_only_visible_tuples() {
	let (table, pool) = setup(10);
	let mut committed = txn(1, &pool);
	for value in 0..5 {
		table.insert(&mut committed, int_row(&table, value).row()).unwrap();
	}
	committed.flip_timestamps(Timestamp(2));

	let mut in_flight = txn(3, &pool);
	for value in 10..13 {
		table.insert(&mut in_flight, int_row(&table, value).row()).unwrap();
	}

	let reader = txn(4, &pool);
	let mut seen: Vec<i64> = table
		.scan(&reader, table.full_row_initializer())
		.map(|(_, buffer)| read_int(buffer.row()).unwrap())
		.collect();
	seen.sort_unstable();
	assert_eq!(seen, vec![0, 1, 2, 3, 4]);
}
