// Copyright (c) quarrydb.io 2025
// This file is licensed under the Apache-2.0, see license.md file

//! Replaying the write-ahead log after a crash.
//!
//! Redo and delete records are buffered per transaction until that
//! transaction's commit record is seen, then replayed under a fresh
//! transaction against the recovered tables. Replay-inserts produce new
//! tuple slots, so a remap table translates logged slot identifiers.
//! Transactions that end in an abort record, or whose commit record never
//! made it to disk, are discarded with their buffered records.

use std::collections::HashMap;
use std::sync::Arc;

use quarry_storage::{DataTable, DatabaseId, ProjectedRow, TableId, TupleSlot};
use quarry_transaction::TransactionManager;
use quarry_wal::{RecoveredRecord, SlotKey, WalError};
use tracing::warn;

use crate::error::Result;

const VARLEN_VALUE_SIZE: usize = 16;

#[derive(Clone, Copy, Debug, Default)]
pub struct RecoveryReport {
	pub committed_transactions: usize,
	pub discarded_transactions: usize,
	pub replayed_records: usize,
}

pub(crate) struct RecoveryManager {
	txn_manager: Arc<TransactionManager>,
	tables: HashMap<(DatabaseId, TableId), Arc<DataTable>>,
	buffered: HashMap<u64, Vec<RecoveredRecord>>,
	slot_map: HashMap<SlotKey, TupleSlot>,
	report: RecoveryReport,
}

impl RecoveryManager {
	pub(crate) fn new(
		txn_manager: Arc<TransactionManager>,
		tables: HashMap<(DatabaseId, TableId), Arc<DataTable>>,
	) -> Self {
		Self {
			txn_manager,
			tables,
			buffered: HashMap::new(),
			slot_map: HashMap::new(),
			report: RecoveryReport::default(),
		}
	}

	pub(crate) fn process(&mut self, record: RecoveredRecord) -> Result<()> {
		match record {
			RecoveredRecord::Commit { txn_begin, .. } => self.replay_transaction(txn_begin.0)?,
			RecoveredRecord::Abort { txn_begin } => self.discard_transaction(txn_begin.0),
			buffered @ (RecoveredRecord::Redo { .. } | RecoveredRecord::Delete { .. }) => {
				let txn_begin = match &buffered {
					RecoveredRecord::Redo { txn_begin, .. }
					| RecoveredRecord::Delete { txn_begin, .. } => txn_begin.0,
					_ => unreachable!(),
				};
				self.buffered.entry(txn_begin).or_default().push(buffered);
			}
		}
		Ok(())
	}

	/// Discards everything left buffered (transactions whose commit record
	/// never reached disk) and returns the final report.
	pub(crate) fn finish(mut self) -> RecoveryReport {
		let dangling: Vec<u64> = self.buffered.keys().copied().collect();
		for txn_begin in dangling {
			warn!(txn = txn_begin, "discarding transaction without a commit record");
			self.discard_transaction(txn_begin);
		}
		self.report
	}

	fn table(&self, database: DatabaseId, table: TableId) -> Result<Arc<DataTable>> {
		self.tables
			.get(&(database, table))
			.cloned()
			.ok_or_else(|| {
				WalError::UnknownTable {
					database: database.0,
					table: table.0,
				}
				.into()
			})
	}

	fn replay_transaction(&mut self, txn_begin: u64) -> Result<()> {
		let records = self.buffered.remove(&txn_begin).unwrap_or_default();
		let mut txn = self.txn_manager.begin();
		for record in records {
			match record {
				RecoveredRecord::Redo {
					database,
					table,
					slot,
					row,
					..
				} => {
					let data_table = self.table(database, table)?;
					match self.slot_map.get(&slot) {
						// A slot seen for the first time is an insert; the
						// replay-produced slot stands in for the logged one
						// from here on.
						None => {
							let new_slot = data_table.insert(&mut txn, row.row())?;
							self.slot_map.insert(slot, new_slot);
						}
						Some(&new_slot) => {
							data_table.update(&mut txn, new_slot, row.row())?;
						}
					}
				}
				RecoveredRecord::Delete {
					database,
					table,
					slot,
					..
				} => {
					let data_table = self.table(database, table)?;
					let new_slot = self
						.slot_map
						.remove(&slot)
						.expect("delete of a slot the log never produced");
					data_table.delete(&mut txn, new_slot)?;
				}
				RecoveredRecord::Commit { .. } | RecoveredRecord::Abort { .. } => {
					unreachable!("only redo and delete records are buffered")
				}
			}
			self.report.replayed_records += 1;
		}
		// Logging is not attached during recovery, so this commits inline.
		txn.commit(Box::new(|_| {}))?;
		self.report.committed_transactions += 1;
		Ok(())
	}

	fn discard_transaction(&mut self, txn_begin: u64) {
		if let Some(records) = self.buffered.remove(&txn_begin) {
			for record in records {
				if let RecoveredRecord::Redo { row, .. } = record {
					reclaim_row_varlens(row.row());
				}
			}
		}
		self.report.discarded_transactions += 1;
	}
}

/// Frees the varlen allocations a parsed-but-unused after-image owns.
fn reclaim_row_varlens(row: &ProjectedRow) {
	for index in 0..row.num_columns() {
		if row.value_size(index) != VARLEN_VALUE_SIZE {
			continue;
		}
		if let Some(entry) = row.varlen_entry(index) {
			if entry.is_reclaimable() {
				unsafe { entry.reclaim() };
			}
		}
	}
}
