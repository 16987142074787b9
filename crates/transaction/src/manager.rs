// Copyright (c) quarrydb.io 2025
// This file is licensed under the Apache-2.0, see license.md file

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use quarry_core::Timestamp;
use quarry_storage::{BufferSegmentPool, Result, TransactionContext};
use quarry_wal::{CommitCallback, LogManager};
use tracing::{debug, trace};

/// Hands out begin/commit timestamps, installs commit timestamps into undo
/// records, performs rollback, and queues completed transactions for the
/// garbage collector.
pub struct TransactionManager {
	time: AtomicU64,
	commit_latch: RwLock<()>,
	running: SkipMap<u64, ()>,
	completed: Mutex<Vec<Box<TransactionContext>>>,
	segment_pool: Arc<BufferSegmentPool>,
	log_manager: OnceCell<Arc<LogManager>>,
	gc_enabled: bool,
}

impl TransactionManager {
	pub fn new(segment_pool: Arc<BufferSegmentPool>, gc_enabled: bool) -> Self {
		Self {
			time: AtomicU64::new(Timestamp::INITIAL.0),
			commit_latch: RwLock::new(()),
			running: SkipMap::new(),
			completed: Mutex::new(Vec::new()),
			segment_pool,
			log_manager: OnceCell::new(),
			gc_enabled,
		}
	}

	/// Attaches the log manager once it is running. Recovery runs before
	/// this point with logging disabled, exactly like a fresh system whose
	/// log is not yet up.
	pub fn attach_log_manager(&self, log_manager: Arc<LogManager>) {
		self.log_manager
			.set(log_manager)
			.unwrap_or_else(|_| panic!("log manager attached twice"));
	}

	pub fn segment_pool(&self) -> &Arc<BufferSegmentPool> {
		&self.segment_pool
	}

	/// Begins a transaction: under the commit latch in shared mode, fetch
	/// the begin timestamp and register the transaction as running. The
	/// returned handle aborts on drop unless committed or aborted
	/// explicitly.
	pub fn begin(self: &Arc<Self>) -> TransactionHandle {
		let context = {
			let _shared = self.commit_latch.read();
			let start = Timestamp(self.time.fetch_add(1, Ordering::SeqCst));
			let context = Box::new(TransactionContext::new(start, self.segment_pool.clone()));
			self.running.insert(start.0, ());
			context
		};
		trace!(txn = %context.begin_ts(), "begin");
		TransactionHandle {
			manager: self.clone(),
			context: Some(context),
		}
	}

	/// Commits: under the commit latch in exclusive mode, fetch the commit
	/// timestamp and atomically flip every undo record to it, clearing the
	/// uncommitted marker and publishing a monotonically correct chain
	/// timestamp in one store per record. The redo buffer is handed to the
	/// log manager inside the same critical section, so submissions reach
	/// the serializer in commit-timestamp order and callbacks (which fire
	/// in flush order) keep that order too. A full submission queue
	/// therefore stalls new commits, which is the intended backpressure.
	/// Read-only transactions produce no WAL bytes and get their callback
	/// inline.
	fn commit(&self, mut context: Box<TransactionContext>, callback: CommitCallback) -> Result<Timestamp> {
		let log_manager = self.log_manager.get().filter(|_| context.has_redo());
		if log_manager.is_some() {
			// Reserve the commit record up front so nothing can fail after
			// the timestamps flip.
			if let Err(error) = context.prepare_commit_record() {
				self.abort(context);
				return Err(error);
			}
		}

		let commit_ts;
		{
			let _exclusive = self.commit_latch.write();
			commit_ts = Timestamp(self.time.fetch_add(1, Ordering::SeqCst));
			context.flip_timestamps(commit_ts);
			self.running.remove(&context.begin_ts().0);
			match log_manager {
				Some(log_manager) => {
					context.finalize_commit_record(commit_ts);
					let buffer = context.take_redo_buffer().expect("has_redo checked");
					log_manager.submit(
						buffer,
						context.begin_ts(),
						context.log_processed().clone(),
						callback,
					);
				}
				None => {
					// Read-only fast path (or logging disabled): nothing
					// to make durable.
					context.log_processed().store(true, Ordering::Release);
					callback(Ok(()));
				}
			}
		}
		trace!(txn = %context.begin_ts(), %commit_ts, "commit");

		self.retire(context);
		Ok(commit_ts)
	}

	/// Aborts: restores before-images in LIFO order per slot by popping
	/// this transaction's versions off their chains, then discards the redo
	/// buffer.
	fn abort(&self, mut context: Box<TransactionContext>) {
		let txn_id = context.id();
		debug_assert!(txn_id.is_uncommitted());
		for record in context.undo_buffer().iter() {
			let record = unsafe { &*record };
			let table = unsafe { record.table() };
			table.rollback(txn_id, record.slot());
		}
		context.mark_aborted();
		drop(context.take_redo_buffer());
		context.log_processed().store(true, Ordering::Release);
		self.running.remove(&context.begin_ts().0);
		trace!(txn = %context.begin_ts(), "abort");
		self.retire(context);
	}

	fn retire(&self, context: Box<TransactionContext>) {
		if self.gc_enabled {
			self.completed.lock().push(context);
		}
		// Without a GC the context (and its undo records) are freed here;
		// only safe because nothing can reference undo records once no
		// snapshot needs them, which single-threaded callers control.
	}

	/// Minimum begin timestamp among running transactions, or the current
	/// time when none are running. Everything below it is invisible to any
	/// present or future snapshot.
	pub fn oldest_transaction_start_time(&self) -> Timestamp {
		self.running
			.front()
			.map(|entry| Timestamp(*entry.key()))
			.unwrap_or_else(|| Timestamp(self.time.load(Ordering::SeqCst)))
	}

	/// Current value of the global time counter.
	pub fn time(&self) -> Timestamp {
		Timestamp(self.time.load(Ordering::SeqCst))
	}

	pub fn running_count(&self) -> usize {
		self.running.len()
	}

	/// Drains the completed-transaction queue for the garbage collector.
	pub fn completed_transactions(&self) -> Vec<Box<TransactionContext>> {
		std::mem::take(&mut *self.completed.lock())
	}
}

/// Owning handle to a running transaction. Guarantees release on all exits:
/// dropping an uncommitted handle aborts it.
pub struct TransactionHandle {
	manager: Arc<TransactionManager>,
	context: Option<Box<TransactionContext>>,
}

impl TransactionHandle {
	/// Commits and registers `on_durable` to fire once the commit record is
	/// on stable storage (immediately for read-only transactions). Returns
	/// the commit timestamp.
	pub fn commit(mut self, on_durable: CommitCallback) -> Result<Timestamp> {
		let context = self.context.take().expect("handle not finished");
		self.manager.commit(context, on_durable)
	}

	pub fn abort(mut self) {
		let context = self.context.take().expect("handle not finished");
		self.manager.abort(context);
	}
}

impl Deref for TransactionHandle {
	type Target = TransactionContext;

	fn deref(&self) -> &TransactionContext {
		self.context.as_ref().expect("handle not finished")
	}
}

impl DerefMut for TransactionHandle {
	fn deref_mut(&mut self) -> &mut TransactionContext {
		self.context.as_mut().expect("handle not finished")
	}
}

impl Drop for TransactionHandle {
	fn drop(&mut self) {
		if let Some(context) = self.context.take() {
			debug!(txn = %context.begin_ts(), "unfinished transaction dropped, aborting");
			self.manager.abort(context);
		}
	}
}
