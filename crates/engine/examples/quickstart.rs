// Copyright (c) quarrydb.io 2025
// This file is licensed under the Apache-2.0, see license.md file

//! Minimal end-to-end use of the storage core: start, write, read, stop.

use std::sync::mpsc;

use quarry_engine::{Engine, Settings};
use quarry_storage::{DatabaseId, ProjectedRowBuffer, TableId, VarlenEntry, VARLEN_COLUMN};

fn main() -> Result<(), Box<dyn std::error::Error>> {
	tracing_subscriber::fmt::init();

	let engine = Engine::start(Settings {
		log_file: Some("quickstart.wal".into()),
		..Settings::default()
	})?;
	// One BIGINT column and one TEXT column.
	let table = engine.create_table(DatabaseId(1), TableId(1), &[8, VARLEN_COLUMN])?;
	let report = engine.recover()?;
	println!("recovered {} committed transactions", report.committed_transactions);

	let mut txn = engine.begin();
	let mut row = ProjectedRowBuffer::new(table.full_row_initializer());
	row.row_mut().access_force_not_null(0).copy_from_slice(&1i64.to_ne_bytes());
	row.row_mut().set_varlen_entry(1, VarlenEntry::from_bytes(b"hello, quarry"));
	let slot = table.insert(&mut txn, row.row())?;

	let (sender, durable) = mpsc::channel();
	txn.commit(Box::new(move |result| {
		sender.send(result).expect("main outlives the flusher");
	}))?;
	durable.recv()??;

	let reader = engine.begin();
	let mut out = ProjectedRowBuffer::new(table.full_row_initializer());
	assert!(table.select(&reader, slot, out.row_mut()));
	let text = out.row().varlen_entry(1).expect("not null");
	println!("read back: {}", String::from_utf8_lossy(text.as_bytes()));
	reader.abort();

	engine.stop();
	Ok(())
}
