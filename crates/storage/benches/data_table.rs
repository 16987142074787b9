// Copyright (c) quarrydb.io 2025
// This file is licensed under the Apache-2.0, see license.md file

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use quarry_core::Timestamp;
use quarry_storage::{
	BlockLayout, BlockStore, BufferSegmentPool, DataTable, DatabaseId, ProjectedRowBuffer,
	SegmentAllocator, TableId, TransactionContext,
};

const BLOCK: usize = 1 << 20;
const BATCH: u64 = 1_000;

fn fixture() -> (Arc<DataTable>, Arc<BufferSegmentPool>) {
	let store = Arc::new(BlockStore::new(BLOCK, 1_000, 100));
	let layout = BlockLayout::new(BLOCK, &[8, 8]).unwrap();
	let table = Arc::new(DataTable::new(store, layout, DatabaseId(1), TableId(1)));
	let pool = Arc::new(BufferSegmentPool::new(SegmentAllocator, 1_000_000, 100_000));
	(table, pool)
}

fn row(table: &DataTable, value: i64) -> ProjectedRowBuffer {
	let mut buffer = ProjectedRowBuffer::new(table.full_row_initializer());
	buffer.row_mut().access_force_not_null(0).copy_from_slice(&value.to_ne_bytes());
	buffer.row_mut().access_force_not_null(1).copy_from_slice(&(value * 7).to_ne_bytes());
	buffer
}

fn insert_throughput(c: &mut Criterion) {
	let mut group = c.benchmark_group("data_table");
	group.throughput(Throughput::Elements(BATCH));
	group.bench_function("insert", |b| {
		b.iter_batched(
			fixture,
			|(table, pool)| {
				let mut txn = TransactionContext::new(Timestamp(1), pool);
				for value in 0..BATCH as i64 {
					table.insert(&mut txn, row(&table, value).row()).unwrap();
				}
				txn.flip_timestamps(Timestamp(2));
				(table, txn)
			},
			BatchSize::LargeInput,
		)
	});
	group.finish();
}

fn select_throughput(c: &mut Criterion) {
	let (table, pool) = fixture();
	let mut txn = TransactionContext::new(Timestamp(1), pool.clone());
	let slots: Vec<_> = (0..BATCH as i64)
		.map(|value| table.insert(&mut txn, row(&table, value).row()).unwrap())
		.collect();
	txn.flip_timestamps(Timestamp(2));
	let reader = TransactionContext::new(Timestamp(3), pool);

	let mut group = c.benchmark_group("data_table");
	group.throughput(Throughput::Elements(BATCH));
	group.bench_function("select", |b| {
		let mut out = ProjectedRowBuffer::new(table.full_row_initializer());
		b.iter(|| {
			for &slot in &slots {
				assert!(table.select(&reader, slot, out.row_mut()));
			}
		})
	});
	group.finish();
}

criterion_group!(benches, insert_throughput, select_throughput);
criterion_main!(benches);
