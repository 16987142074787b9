// Copyright (c) quarrydb.io 2025
// This file is licensed under the Apache-2.0, see license.md file

use crate::block::TupleSlot;
use crate::projected_row::ProjectedRow;
use crate::transaction_context::TransactionContext;

/// Contract for secondary indexes, implemented outside the storage core.
///
/// Indexes store [`TupleSlot`]s as values; the core guarantees slot
/// stability, so an indexed slot keeps identifying the same tuple for the
/// tuple's whole life. Visibility is still the caller's job: a slot coming
/// out of an index scan must be resolved through
/// [`crate::DataTable::select`] under the same transaction.
pub trait Index: Send + Sync {
	/// Appends every slot whose indexed columns equal `key`.
	fn scan_key(&self, txn: &TransactionContext, key: &ProjectedRow, out: &mut Vec<TupleSlot>);

	/// Appends slots with keys in `[low, high]`, in ascending key order.
	fn scan_ascending(
		&self,
		txn: &TransactionContext,
		low: &ProjectedRow,
		high: &ProjectedRow,
		out: &mut Vec<TupleSlot>,
	);

	/// As [`Index::scan_ascending`], stopping after `limit` slots.
	fn scan_limit(
		&self,
		txn: &TransactionContext,
		low: &ProjectedRow,
		high: &ProjectedRow,
		limit: u32,
		out: &mut Vec<TupleSlot>,
	);
}
