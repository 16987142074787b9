// Copyright (c) quarrydb.io 2025
// This file is licensed under the Apache-2.0, see license.md file

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use quarry_core::Timestamp;
use quarry_storage::{ProjectedRow, TransactionContext};
use quarry_transaction::TransactionManager;
use tracing::trace;

// A 16-byte value in a projected row can only be a varlen entry; fixed
// attributes are at most 8 bytes.
const VARLEN_VALUE_SIZE: usize = 16;

struct UnlinkedBatch {
	context: Box<TransactionContext>,
	/// Global time when the unlink happened; the batch may be freed once
	/// every transaction that began before this has ended.
	unlink_time: Timestamp,
}

/// Two-pass garbage collector for completed transactions. Single-threaded:
/// exactly one collector may run against a transaction manager, which is
/// what makes interior chain unlinking safe.
pub struct GarbageCollector {
	txn_manager: Arc<TransactionManager>,
	pending_unlink: VecDeque<Box<TransactionContext>>,
	pending_deallocate: VecDeque<UnlinkedBatch>,
}

impl GarbageCollector {
	pub fn new(txn_manager: Arc<TransactionManager>) -> Self {
		Self {
			txn_manager,
			pending_unlink: VecDeque::new(),
			pending_deallocate: VecDeque::new(),
		}
	}

	/// One GC cycle. Returns `(deallocated transactions, unlinked undo
	/// records)`, the observable progress counters.
	pub fn perform_garbage_collection(&mut self) -> (usize, usize) {
		let deallocated = self.process_deallocate_queue();
		let unlinked = self.process_unlink_queue();
		if deallocated != 0 || unlinked != 0 {
			trace!(deallocated, unlinked, "garbage collection cycle");
		}
		(deallocated, unlinked)
	}

	fn process_deallocate_queue(&mut self) -> usize {
		let oldest = self.txn_manager.oldest_transaction_start_time();
		let mut count = 0;
		while let Some(batch) = self.pending_deallocate.front() {
			// Wait out readers that may have loaded a pointer to an
			// unlinked record, and the serializer that may still read
			// varlen contents out of the redo buffer's referents.
			if batch.unlink_time > oldest
				|| !batch.context.log_processed().load(Ordering::Acquire)
			{
				break;
			}
			let batch = self.pending_deallocate.pop_front().expect("peeked");
			Self::deallocate(batch.context);
			count += 1;
		}
		count
	}

	fn deallocate(context: Box<TransactionContext>) {
		if !context.is_aborted() {
			// Before-images of committed updates and deletes own the
			// varlen allocations they superseded; nothing else references
			// them now.
			for record in context.undo_buffer().iter() {
				if let Some(delta) = unsafe { (*record).delta() } {
					reclaim_delta_varlens(delta);
				}
			}
		}
		// Dropping the context returns its buffer segments to the pool.
		drop(context);
	}

	fn process_unlink_queue(&mut self) -> usize {
		self.pending_unlink
			.extend(self.txn_manager.completed_transactions());
		let oldest = self.txn_manager.oldest_transaction_start_time();
		let mut count = 0;
		let mut still_pending = VecDeque::new();
		while let Some(context) = self.pending_unlink.pop_front() {
			// A transaction's records become unreachable once every active
			// snapshot is newer than its final timestamp.
			if context.final_timestamp() >= oldest {
				still_pending.push_back(context);
				continue;
			}
			if context.is_aborted() {
				// Rollback already unlinked everything; only the grace
				// period before deallocation remains.
			} else {
				for record in context.undo_buffer().iter() {
					let table = unsafe { (*record).table() };
					table.unlink_undo_record(record);
					count += 1;
				}
			}
			self.pending_deallocate.push_back(UnlinkedBatch {
				context,
				unlink_time: self.txn_manager.time(),
			});
		}
		self.pending_unlink = still_pending;
		count
	}

	/// Transactions awaiting unlink and deallocation, for observability.
	pub fn queue_depths(&self) -> (usize, usize) {
		(self.pending_unlink.len(), self.pending_deallocate.len())
	}
}

/// Frees every reclaimable varlen allocation a before-image owns.
fn reclaim_delta_varlens(delta: &ProjectedRow) {
	for index in 0..delta.num_columns() {
		if delta.value_size(index) != VARLEN_VALUE_SIZE {
			continue;
		}
		if let Some(entry) = delta.varlen_entry(index) {
			if entry.is_reclaimable() {
				unsafe { entry.reclaim() };
			}
		}
	}
}
