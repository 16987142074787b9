// Copyright (c) quarrydb.io 2025
// This file is licensed under the Apache-2.0, see license.md file

//! Durability pipeline tests: callbacks gate on fsync, the serialized
//! stream reads back, and torn tails are detected.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use quarry_core::Timestamp;
use quarry_storage::{
	BlockLayout, BlockStore, BufferSegmentPool, DataTable, DatabaseId, ProjectedRowBuffer,
	SegmentAllocator, TableId, TransactionContext, VarlenEntry, VARLEN_COLUMN,
};
use quarry_testing::tempdir::temp_dir;
use quarry_wal::{LogFileReader, LogManager, RecoveredRecord, TableRegistry, WalSettings};

const BLOCK: usize = 1 << 16;

struct Fixture {
	table: Arc<DataTable>,
	pool: Arc<BufferSegmentPool>,
}

fn fixture() -> Fixture {
	let store = Arc::new(BlockStore::new(BLOCK, 100, 100));
	let layout = BlockLayout::new(BLOCK, &[8, VARLEN_COLUMN]).unwrap();
	let table = Arc::new(DataTable::new(store, layout, DatabaseId(1), TableId(7)));
	let pool = Arc::new(BufferSegmentPool::new(SegmentAllocator, 10_000, 1_000));
	Fixture { table, pool }
}

impl TableRegistry for Fixture {
	fn layout(&self, database: DatabaseId, table: TableId) -> Option<&BlockLayout> {
		(database == self.table.database() && table == self.table.table_id())
			.then(|| self.table.layout())
	}
}

fn row(fixture: &Fixture, value: i64, text: &[u8]) -> ProjectedRowBuffer {
	let mut buffer = ProjectedRowBuffer::new(fixture.table.full_row_initializer());
	buffer
		.row_mut()
		.access_force_not_null(0)
		.copy_from_slice(&value.to_ne_bytes());
	buffer.row_mut().set_varlen_entry(1, VarlenEntry::from_bytes(text));
	buffer
}

fn settings() -> WalSettings {
	WalSettings {
		num_buffers: 4,
		serialization_interval: Duration::from_millis(2),
		flush_interval: Duration::from_millis(2),
	}
}

/// Runs a little write workload and submits every transaction's redo buffer
/// like the transaction manager would.
fn commit_workload(fixture: &Fixture, log: &LogManager, transactions: usize) -> Vec<mpsc::Receiver<bool>> {
	let mut waiters = Vec::new();
	for i in 0..transactions {
		let begin = Timestamp(2 * i as u64 + 1);
		let commit = Timestamp(2 * i as u64 + 2);
		let mut txn = TransactionContext::new(begin, fixture.pool.clone());
		fixture
			.table
			.insert(&mut txn, row(fixture, i as i64, format!("value-{i}").as_bytes()).row())
			.unwrap();
		txn.prepare_commit_record().unwrap();
		txn.flip_timestamps(commit);
		txn.finalize_commit_record(commit);
		let (tx, rx) = mpsc::channel();
		log.submit(
			txn.take_redo_buffer().unwrap(),
			begin,
			txn.log_processed().clone(),
			Box::new(move |result| {
				tx.send(result.is_ok()).unwrap();
			}),
		);
		waiters.push(rx);
	}
	waiters
}

#[test]
fn callbacks_fire_after_durability_in_order() {
	temp_dir(|dir| {
		let fixture = fixture();
		let path = dir.join("wal");
		let log = LogManager::start(&path, settings()).unwrap();
		let waiters = commit_workload(&fixture, &log, 10);
		for (i, rx) in waiters.iter().enumerate() {
			assert!(
				rx.recv_timeout(Duration::from_secs(5)).unwrap(),
				"commit {i} failed"
			);
		}
		log.stop();
		assert!(path.metadata().unwrap().len() > 0);
	});
}

#[test]
fn log_processed_is_set_once_serialized() {
	temp_dir(|dir| {
		let fixture = fixture();
		let log = LogManager::start(dir.join("wal"), settings()).unwrap();

		let mut txn = TransactionContext::new(Timestamp(1), fixture.pool.clone());
		fixture.table.insert(&mut txn, row(&fixture, 1, b"x").row()).unwrap();
		txn.prepare_commit_record().unwrap();
		txn.flip_timestamps(Timestamp(2));
		txn.finalize_commit_record(Timestamp(2));
		let flag = txn.log_processed().clone();
		let (tx, rx) = mpsc::channel();
		log.submit(
			txn.take_redo_buffer().unwrap(),
			Timestamp(1),
			flag.clone(),
			Box::new(move |_| tx.send(()).unwrap()),
		);
		rx.recv_timeout(Duration::from_secs(5)).unwrap();
		assert!(flag.load(std::sync::atomic::Ordering::Acquire));
		log.stop();
	});
}

#[test]
fn stop_drains_everything() {
	temp_dir(|dir| {
		let fixture = fixture();
		let log = LogManager::start(dir.join("wal"), settings()).unwrap();
		let waiters = commit_workload(&fixture, &log, 50);
		// Stop without waiting: the drain must still fire every callback.
		log.stop();
		for rx in waiters {
			assert!(rx.try_recv().unwrap());
		}
	});
}

#[test]
fn serialized_stream_reads_back() {
	temp_dir(|dir| {
		let fixture = fixture();
		let path = dir.join("wal");
		let log = LogManager::start(&path, settings()).unwrap();
		for rx in commit_workload(&fixture, &log, 5) {
			rx.recv_timeout(Duration::from_secs(5)).unwrap();
		}
		log.stop();

		let mut reader = LogFileReader::open(&path).unwrap();
		let mut redo_rows = HashMap::new();
		let mut commits = Vec::new();
		while let Some(record) = reader.next_record(&fixture).unwrap() {
			match record {
				RecoveredRecord::Redo { txn_begin, row, .. } => {
					let value = i64::from_ne_bytes(
						row.row().access_with_null_check(0).unwrap().try_into().unwrap(),
					);
					let text = row.row().varlen_entry(1).unwrap().as_bytes().to_vec();
					redo_rows.insert(txn_begin.0, (value, text));
				}
				RecoveredRecord::Commit { txn_begin, commit_ts } => {
					commits.push((txn_begin.0, commit_ts.0));
				}
				_ => panic!("unexpected record kind"),
			}
		}
		assert!(!reader.needs_repair());
		assert_eq!(commits.len(), 5);
		for (i, (begin, commit)) in commits.iter().enumerate() {
			assert_eq!(*begin, 2 * i as u64 + 1);
			assert_eq!(*commit, 2 * i as u64 + 2);
			let (value, text) = &redo_rows[begin];
			assert_eq!(*value, i as i64);
			assert_eq!(text, format!("value-{i}").as_bytes());
		}
	});
}

#[test]
fn torn_tail_is_detected_and_repairable() {
	temp_dir(|dir| {
		let fixture = fixture();
		let path = dir.join("wal");
		let log = LogManager::start(&path, settings()).unwrap();
		for rx in commit_workload(&fixture, &log, 3) {
			rx.recv_timeout(Duration::from_secs(5)).unwrap();
		}
		log.stop();
		let clean_len = path.metadata().unwrap().len();

		// Simulate a crash mid page write.
		let mut file = OpenOptions::new().append(true).open(&path).unwrap();
		file.write_all(&[0xabu8; 100]).unwrap();
		drop(file);

		let mut reader = LogFileReader::open(&path).unwrap();
		let mut records = 0;
		while reader.next_record(&fixture).unwrap().is_some() {
			records += 1;
		}
		// All three transactions survive: one redo plus one commit each.
		assert_eq!(records, 6);
		assert!(reader.needs_repair());
		let repair = reader.tail_repair();
		assert!(repair.keep_file_bytes <= clean_len);
	});
}

#[test]
fn records_spanning_many_pages_read_back() {
	temp_dir(|dir| {
		let fixture = fixture();
		let path = dir.join("wal");
		let log = LogManager::start(&path, settings()).unwrap();

		// A value several times the page payload forces the serializer to
		// rotate buffers mid record.
		let big = "x".repeat(10_000);
		let mut txn = TransactionContext::new(Timestamp(1), fixture.pool.clone());
		fixture
			.table
			.insert(&mut txn, row(&fixture, 42, big.as_bytes()).row())
			.unwrap();
		txn.prepare_commit_record().unwrap();
		txn.flip_timestamps(Timestamp(2));
		txn.finalize_commit_record(Timestamp(2));
		let (tx, rx) = mpsc::channel();
		log.submit(
			txn.take_redo_buffer().unwrap(),
			Timestamp(1),
			txn.log_processed().clone(),
			Box::new(move |result| tx.send(result.is_ok()).unwrap()),
		);
		assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
		log.stop();

		let mut reader = LogFileReader::open(&path).unwrap();
		let mut seen_big = false;
		while let Some(record) = reader.next_record(&fixture).unwrap() {
			if let RecoveredRecord::Redo { row, .. } = record {
				assert_eq!(row.row().varlen_entry(1).unwrap().as_bytes(), big.as_bytes());
				seen_big = true;
			}
		}
		assert!(seen_big);
		assert!(!reader.needs_repair());
	});
}

#[test]
fn concurrent_submitters_all_become_durable() {
	temp_dir(|dir| {
		let fixture = Arc::new(fixture());
		let log = Arc::new(LogManager::start(dir.join("wal"), settings()).unwrap());
		const THREADS: u64 = 4;
		const PER_THREAD: u64 = 25;

		let mut handles = Vec::new();
		for thread in 0..THREADS {
			let fixture = fixture.clone();
			let log = log.clone();
			handles.push(std::thread::spawn(move || {
				let mut waiters = Vec::new();
				for i in 0..PER_THREAD {
					let begin = Timestamp(1 + 2 * (thread * PER_THREAD + i));
					let commit = Timestamp(begin.0 + 1);
					let mut txn = TransactionContext::new(begin, fixture.pool.clone());
					fixture
						.table
						.insert(&mut txn, row(&fixture, begin.0 as i64, b"payload").row())
						.unwrap();
					txn.prepare_commit_record().unwrap();
					txn.flip_timestamps(commit);
					txn.finalize_commit_record(commit);
					let (tx, rx) = mpsc::channel();
					log.submit(
						txn.take_redo_buffer().unwrap(),
						begin,
						txn.log_processed().clone(),
						Box::new(move |result| tx.send(result.is_ok()).unwrap()),
					);
					waiters.push(rx);
				}
				for rx in waiters {
					assert!(rx.recv_timeout(Duration::from_secs(10)).unwrap());
				}
			}));
		}
		for handle in handles {
			handle.join().unwrap();
		}
		log.stop();
	});
}

#[test]
fn force_flush_makes_prior_submissions_durable() {
	temp_dir(|dir| {
		let fixture = fixture();
		let path = dir.join("wal");
		let log = LogManager::start(
			&path,
			WalSettings {
				num_buffers: 4,
				// Glacial intervals: only force_flush can make progress.
				serialization_interval: Duration::from_millis(1),
				flush_interval: Duration::from_secs(3600),
			},
		)
		.unwrap();
		let waiters = commit_workload(&fixture, &log, 2);
		// Give the serializer a moment to pick the submissions up.
		std::thread::sleep(Duration::from_millis(50));
		log.force_flush();
		for rx in waiters {
			assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
		}
		log.stop();
	});
}
