// Copyright (c) quarrydb.io 2025
// This file is licensed under the Apache-2.0, see license.md file

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use quarry_core::Timestamp;
use quarry_storage::RedoBuffer;
use tracing::{debug, error, warn};

use crate::error::{DurabilityError, WalError};
use crate::page::LogBuffer;
use crate::serializer::{serialize_record, SerializerOutput};

/// Invoked exactly once per commit, with `Ok` only after the transaction's
/// commit record is on stable storage.
pub type CommitCallback = Box<dyn FnOnce(std::result::Result<(), DurabilityError>) + Send + 'static>;

#[derive(Clone, Debug)]
pub struct WalSettings {
	/// Page buffers cycling between the serializer and the disk writer.
	pub num_buffers: usize,
	pub serialization_interval: Duration,
	pub flush_interval: Duration,
}

impl Default for WalSettings {
	fn default() -> Self {
		Self {
			num_buffers: 16,
			serialization_interval: Duration::from_millis(10),
			flush_interval: Duration::from_millis(10),
		}
	}
}

/// A committing transaction's redo buffer on its way to disk.
struct Submission {
	buffer: RedoBuffer,
	txn_begin: Timestamp,
	log_processed: Arc<AtomicBool>,
	callback: CommitCallback,
}

#[derive(Default)]
struct FlushState {
	do_persist: bool,
}

struct LogShared {
	file: File,
	/// Callbacks keyed by the payload-stream position that must be durable
	/// before they may fire; appended in serialization (= commit) order.
	pending: Mutex<VecDeque<(u64, CommitCallback)>>,
	written: AtomicU64,
	durable: AtomicU64,
	failed: AtomicBool,
	run: AtomicBool,
	flush_state: Mutex<FlushState>,
	flush_cv: Condvar,
	persist_cv: Condvar,
}

impl LogShared {
	/// Poisons the manager: every pending and future callback fires with a
	/// durability failure.
	fn fail(&self, reason: &std::io::Error) {
		error!(%reason, "write-ahead log failed, poisoning the log manager");
		self.failed.store(true, Ordering::Release);
		let failure = DurabilityError {
			message: reason.to_string(),
		};
		let mut pending = self.pending.lock();
		for (_, callback) in pending.drain(..) {
			callback(Err(failure.clone()));
		}
	}

	/// Fires every callback whose position is durable.
	fn fire_durable(&self) {
		let durable = self.durable.load(Ordering::Acquire);
		let mut pending = self.pending.lock();
		while pending.front().is_some_and(|(position, _)| *position <= durable) {
			let (_, callback) = pending.pop_front().expect("peeked");
			callback(Ok(()));
		}
	}
}

/// The write-ahead log manager. `start` spawns the serializer, disk writer
/// and flusher task threads; `stop` drains and joins them in that order,
/// with a final fsync.
pub struct LogManager {
	submissions: Mutex<Option<Sender<Submission>>>,
	shared: Arc<LogShared>,
	threads: Mutex<Vec<JoinHandle<()>>>,
}

impl LogManager {
	pub fn start(path: impl AsRef<Path>, settings: WalSettings) -> crate::Result<LogManager> {
		let file = OpenOptions::new()
			.create(true)
			.append(true)
			.open(path.as_ref())
			.map_err(WalError::Io)?;

		let shared = Arc::new(LogShared {
			file,
			pending: Mutex::new(VecDeque::new()),
			written: AtomicU64::new(0),
			durable: AtomicU64::new(0),
			failed: AtomicBool::new(false),
			run: AtomicBool::new(true),
			flush_state: Mutex::new(FlushState::default()),
			flush_cv: Condvar::new(),
			persist_cv: Condvar::new(),
		});

		let (submission_tx, submission_rx) = bounded::<Submission>(settings.num_buffers);
		let (empty_tx, empty_rx) = bounded::<LogBuffer>(settings.num_buffers);
		let (filled_tx, filled_rx) = bounded::<LogBuffer>(settings.num_buffers);
		for _ in 0..settings.num_buffers {
			empty_tx.send(LogBuffer::new()).expect("queue sized for all buffers");
		}

		let mut threads = Vec::new();
		{
			let shared = shared.clone();
			let interval = settings.serialization_interval;
			threads.push(
				std::thread::Builder::new()
					.name("wal-serializer".into())
					.spawn(move || serializer_task(submission_rx, empty_rx, filled_tx, shared, interval))
					.expect("spawn wal serializer"),
			);
		}
		{
			let shared = shared.clone();
			threads.push(
				std::thread::Builder::new()
					.name("wal-writer".into())
					.spawn(move || writer_task(filled_rx, empty_tx, shared))
					.expect("spawn wal writer"),
			);
		}
		{
			let shared = shared.clone();
			let interval = settings.flush_interval;
			threads.push(
				std::thread::Builder::new()
					.name("wal-flusher".into())
					.spawn(move || flusher_task(shared, interval))
					.expect("spawn wal flusher"),
			);
		}

		debug!(buffers = settings.num_buffers, "log manager started");
		Ok(LogManager {
			submissions: Mutex::new(Some(submission_tx)),
			shared,
			threads: Mutex::new(threads),
		})
	}

	/// Hands a committed transaction's redo buffer to the serializer. The
	/// callback fires once the commit record is durable (or with a failure
	/// if the log is poisoned). Blocks when the submission queue is full.
	pub fn submit(
		&self,
		buffer: RedoBuffer,
		txn_begin: Timestamp,
		log_processed: Arc<AtomicBool>,
		callback: CommitCallback,
	) {
		if self.shared.failed.load(Ordering::Acquire) {
			log_processed.store(true, Ordering::Release);
			callback(Err(DurabilityError {
				message: "log manager is poisoned".into(),
			}));
			return;
		}
		let submission = Submission {
			buffer,
			txn_begin,
			log_processed,
			callback,
		};
		let sender = self.submissions.lock().clone();
		let rejected = match sender {
			Some(sender) => match sender.send(submission) {
				Ok(()) => return,
				Err(error) => error.into_inner(),
			},
			None => submission,
		};
		warn!("submission after log manager shutdown");
		rejected.log_processed.store(true, Ordering::Release);
		(rejected.callback)(Err(DurabilityError {
			message: "log manager is stopped".into(),
		}));
	}

	/// Blocks until everything serialized so far is fsynced and its
	/// callbacks have fired. A no-op once the manager is stopped.
	pub fn force_flush(&self) {
		if !self.shared.run.load(Ordering::Acquire) {
			return;
		}
		let mut state = self.shared.flush_state.lock();
		state.do_persist = true;
		self.shared.flush_cv.notify_all();
		while state.do_persist && self.shared.run.load(Ordering::Acquire) {
			self.shared.persist_cv.wait(&mut state);
		}
	}

	/// Serializer → writer → flusher, drained and joined in order, ending
	/// with an fsync. Every submitted callback has fired when this returns.
	/// Idempotent.
	pub fn stop(&self) {
		// Closing the submission channel lets the serializer drain and
		// exit; it drops the filled-buffer sender, which stops the writer.
		let Some(sender) = self.submissions.lock().take() else {
			return;
		};
		drop(sender);
		let mut threads = std::mem::take(&mut *self.threads.lock());
		let flusher = threads.pop().expect("three task threads");
		let writer = threads.pop().expect("three task threads");
		let serializer = threads.pop().expect("three task threads");
		let _ = serializer.join();
		let _ = writer.join();
		self.shared.run.store(false, Ordering::Release);
		self.shared.flush_cv.notify_all();
		let _ = flusher.join();
		debug!("log manager stopped");
	}
}

impl Drop for LogManager {
	fn drop(&mut self) {
		self.stop();
	}
}

fn serializer_task(
	submissions: Receiver<Submission>,
	empty: Receiver<LogBuffer>,
	filled: Sender<LogBuffer>,
	shared: Arc<LogShared>,
	interval: Duration,
) {
	let mut out = SerializerOutput::new(&empty, &filled);
	loop {
		match submissions.recv_timeout(interval) {
			Ok(submission) => {
				process_submission(submission, &mut out, &shared);
				// Drain whatever else queued up in this round.
				while let Ok(submission) = submissions.try_recv() {
					process_submission(submission, &mut out, &shared);
				}
				out.flush_current();
			}
			Err(RecvTimeoutError::Timeout) => out.flush_current(),
			Err(RecvTimeoutError::Disconnected) => {
				out.flush_current();
				return;
			}
		}
	}
}

fn process_submission(submission: Submission, out: &mut SerializerOutput<'_>, shared: &LogShared) {
	if shared.failed.load(Ordering::Acquire) {
		submission.log_processed.store(true, Ordering::Release);
		(submission.callback)(Err(DurabilityError {
			message: "log manager is poisoned".into(),
		}));
		return;
	}
	for record in submission.buffer.iter() {
		serialize_record(unsafe { &*record }, out);
	}
	// The GC may reclaim this transaction's memory once its buffer is
	// serialized; the varlen contents the records referenced have been
	// copied out.
	submission.log_processed.store(true, Ordering::Release);
	tracing::trace!(txn = %submission.txn_begin, position = out.position(), "transaction serialized");
	shared.pending.lock().push_back((out.position(), submission.callback));
	// Dropping the redo buffer returns its segments to the pool.
}

fn writer_task(filled: Receiver<LogBuffer>, empty: Sender<LogBuffer>, shared: Arc<LogShared>) {
	for mut buffer in filled.iter() {
		if !shared.failed.load(Ordering::Acquire) {
			let page = buffer.encode();
			if let Err(error) = (&shared.file).write_all(&page) {
				shared.fail(&error);
			} else {
				shared.written.store(buffer.end_position, Ordering::Release);
			}
		}
		buffer.reset();
		if empty.send(buffer).is_err() {
			return;
		}
	}
}

fn flusher_task(shared: Arc<LogShared>, interval: Duration) {
	loop {
		let stopping = !shared.run.load(Ordering::Acquire);
		if !stopping {
			let mut state = shared.flush_state.lock();
			if !state.do_persist {
				shared.flush_cv.wait_for(&mut state, interval);
			}
		}

		if shared.failed.load(Ordering::Acquire) {
			// Submissions serialized while the failure raced in still have
			// pending callbacks; answer them with the failure.
			let mut pending = shared.pending.lock();
			for (_, callback) in pending.drain(..) {
				callback(Err(DurabilityError {
					message: "log manager is poisoned".into(),
				}));
			}
		} else {
			let target = shared.written.load(Ordering::Acquire);
			if target > shared.durable.load(Ordering::Acquire) {
				if let Err(error) = shared.file.sync_data() {
					shared.fail(&error);
				} else {
					shared.durable.store(target, Ordering::Release);
				}
			}
			shared.fire_durable();
		}

		{
			let mut state = shared.flush_state.lock();
			if state.do_persist {
				state.do_persist = false;
				shared.persist_cv.notify_all();
			}
		}

		if stopping {
			return;
		}
	}
}
