// Copyright (c) quarrydb.io 2025
// This file is licensed under the Apache-2.0, see license.md file

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::debug;

use crate::compactor::BlockCompactor;
use crate::gc::GarbageCollector;

/// Dedicated thread driving the garbage collector (and, when attached, the
/// block compactor) on a fixed interval.
pub struct GarbageCollectorThread {
	run: Arc<AtomicBool>,
	handle: Option<JoinHandle<()>>,
}

impl GarbageCollectorThread {
	pub fn spawn(
		mut gc: GarbageCollector,
		compactor: Option<Arc<BlockCompactor>>,
		interval: Duration,
	) -> Self {
		let run = Arc::new(AtomicBool::new(true));
		let thread_run = run.clone();
		let handle = std::thread::Builder::new()
			.name("gc".into())
			.spawn(move || {
				while thread_run.load(Ordering::Acquire) {
					gc.perform_garbage_collection();
					if let Some(compactor) = &compactor {
						compactor.process_compaction_queue();
					}
					std::thread::park_timeout(interval);
				}
				// Completed transactions need one unlink pass and one
				// deallocate pass to be fully reclaimed.
				gc.perform_garbage_collection();
				gc.perform_garbage_collection();
				debug!("gc thread stopped");
			})
			.expect("spawn gc thread");
		Self {
			run,
			handle: Some(handle),
		}
	}

	pub fn stop(mut self) {
		self.run.store(false, Ordering::Release);
		if let Some(handle) = self.handle.take() {
			handle.thread().unpark();
			let _ = handle.join();
		}
	}
}

impl Drop for GarbageCollectorThread {
	fn drop(&mut self) {
		if let Some(handle) = self.handle.take() {
			self.run.store(false, Ordering::Release);
			handle.thread().unpark();
			let _ = handle.join();
		}
	}
}
