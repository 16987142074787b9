// Copyright (c) quarrydb.io 2025
// This file is licensed under the Apache-2.0, see license.md file

use quarry_core::constants::BLOCK_SIZE;
use quarry_storage::{
	BlockLayout, ColumnId, ProjectedRowBuffer, ProjectedRowInitializer, VarlenEntry, VARLEN_COLUMN,
};

fn layout() -> BlockLayout {
	BlockLayout::new(BLOCK_SIZE, &[8, 4, VARLEN_COLUMN]).unwrap()
}

#[test]
fn initialize_starts_all_null() {
	let layout = layout();
	let initializer = ProjectedRowInitializer::all_columns(&layout);
	let buffer = ProjectedRowBuffer::new(&initializer);
	let row = buffer.row();
	assert_eq!(row.num_columns(), 3);
	for index in 0..3 {
		assert!(row.is_null(index));
		assert!(row.access_with_null_check(index).is_none());
	}
}

#[test]
fn values_round_trip() {
	let layout = layout();
	let initializer = ProjectedRowInitializer::all_columns(&layout);
	let mut buffer = ProjectedRowBuffer::new(&initializer);
	let row = buffer.row_mut();

	row.access_force_not_null(0).copy_from_slice(&7i64.to_ne_bytes());
	row.access_force_not_null(1).copy_from_slice(&13i32.to_ne_bytes());
	row.set_varlen_entry(2, VarlenEntry::from_bytes(b"short"));

	assert_eq!(row.access_with_null_check(0).unwrap(), &7i64.to_ne_bytes());
	assert_eq!(row.access_with_null_check(1).unwrap(), &13i32.to_ne_bytes());
	assert_eq!(row.varlen_entry(2).unwrap().as_bytes(), b"short");

	row.set_null(1);
	assert!(row.access_with_null_check(1).is_none());
	assert!(!row.is_null(0));
}

#[test]
fn column_ids_are_sorted_and_searchable() {
	let layout = layout();
	let initializer =
		ProjectedRowInitializer::new(&layout, vec![ColumnId(3), ColumnId(1)]);
	let buffer = ProjectedRowBuffer::new(&initializer);
	let row = buffer.row();
	assert_eq!(row.num_columns(), 2);
	assert_eq!(row.column_id(0), ColumnId(1));
	assert_eq!(row.column_id(1), ColumnId(3));
	assert_eq!(row.column_index(ColumnId(3)), Some(1));
	assert_eq!(row.column_index(ColumnId(2)), None);
}

#[test]
fn value_sizes_follow_the_layout() {
	let layout = layout();
	let initializer = ProjectedRowInitializer::all_columns(&layout);
	let buffer = ProjectedRowBuffer::new(&initializer);
	let row = buffer.row();
	assert_eq!(row.value_size(0), 8);
	assert_eq!(row.value_size(1), 4);
	assert_eq!(row.value_size(2), 16);
	assert_eq!(row.size(), initializer.row_size());
}

#[test]
fn copy_of_preserves_bytes() {
	let layout = layout();
	let initializer = ProjectedRowInitializer::all_columns(&layout);
	let mut buffer = ProjectedRowBuffer::new(&initializer);
	buffer.row_mut().access_force_not_null(0).copy_from_slice(&42i64.to_ne_bytes());
	let copy = ProjectedRowBuffer::copy_of(buffer.row());
	assert_eq!(copy.row().access_with_null_check(0).unwrap(), &42i64.to_ne_bytes());
	assert!(copy.row().is_null(1));
}
