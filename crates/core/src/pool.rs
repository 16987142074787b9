// Copyright (c) quarrydb.io 2025
// This file is licensed under the Apache-2.0, see license.md file

//! Bounded object pool.
//!
//! Prevents liberal allocation on the hot path and keeps memory use
//! observable: blocks and record buffer segments are both handed out by
//! pools with a hard size limit and a reuse limit.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use thiserror::Error;

/// The pool has reached its size limit and cannot hand out more objects.
#[derive(Clone, Debug, PartialEq, Error)]
#[error("object pool size limit of {limit} reached")]
pub struct PoolExhausted {
	pub limit: u64,
}

/// Constructs, recycles and destroys the objects a [`Pool`] manages. The
/// returned object may be handed out many times before it is destroyed;
/// `reuse` sees it in whatever state the previous holder left it.
pub trait PoolAllocator<T>: Send + Sync {
	fn allocate(&self) -> T;

	fn reuse(&self, _object: &mut T) {}

	fn destroy(&self, object: T) {
		drop(object);
	}
}

/// A concurrent object pool with a hard size limit and a bounded reuse
/// queue. `get` prefers recycled objects; `release` either requeues the
/// object or destroys it when the reuse queue is full.
pub struct Pool<T, A: PoolAllocator<T>> {
	allocator: A,
	size_limit: u64,
	reuse_limit: u64,
	allocated: AtomicU64,
	reuse: Mutex<Vec<T>>,
}

impl<T, A: PoolAllocator<T>> Pool<T, A> {
	pub fn new(allocator: A, size_limit: u64, reuse_limit: u64) -> Self {
		debug_assert!(reuse_limit <= size_limit);
		Self {
			allocator,
			size_limit,
			reuse_limit,
			allocated: AtomicU64::new(0),
			reuse: Mutex::new(Vec::new()),
		}
	}

	pub fn get(&self) -> Result<T, PoolExhausted> {
		if let Some(mut object) = self.reuse.lock().pop() {
			self.allocator.reuse(&mut object);
			return Ok(object);
		}
		let mut current = self.allocated.load(Ordering::Relaxed);
		loop {
			if current >= self.size_limit {
				return Err(PoolExhausted {
					limit: self.size_limit,
				});
			}
			match self.allocated.compare_exchange(
				current,
				current + 1,
				Ordering::Relaxed,
				Ordering::Relaxed,
			) {
				Ok(_) => return Ok(self.allocator.allocate()),
				Err(observed) => current = observed,
			}
		}
	}

	pub fn release(&self, object: T) {
		let mut reuse = self.reuse.lock();
		if (reuse.len() as u64) < self.reuse_limit {
			reuse.push(object);
		} else {
			drop(reuse);
			self.allocator.destroy(object);
			self.allocated.fetch_sub(1, Ordering::Relaxed);
		}
	}

	/// Number of objects currently allocated, whether handed out or parked
	/// in the reuse queue.
	pub fn allocated(&self) -> u64 {
		self.allocated.load(Ordering::Relaxed)
	}

	/// Number of objects parked in the reuse queue.
	pub fn reusable(&self) -> usize {
		self.reuse.lock().len()
	}

	pub fn size_limit(&self) -> u64 {
		self.size_limit
	}
}

impl<T, A: PoolAllocator<T>> Drop for Pool<T, A> {
	fn drop(&mut self) {
		for object in self.reuse.get_mut().drain(..) {
			self.allocator.destroy(object);
		}
	}
}
