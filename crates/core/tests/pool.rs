// Copyright (c) quarrydb.io 2025
// This file is licensed under the Apache-2.0, see license.md file

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use quarry_core::pool::{Pool, PoolAllocator};

#[derive(Clone)]
struct CountingAllocator {
	created: Arc<AtomicUsize>,
	destroyed: Arc<AtomicUsize>,
}

impl PoolAllocator<Vec<u8>> for CountingAllocator {
	fn allocate(&self) -> Vec<u8> {
		self.created.fetch_add(1, Ordering::Relaxed);
		vec![0u8; 64]
	}

	fn reuse(&self, object: &mut Vec<u8>) {
		object.fill(0);
	}

	fn destroy(&self, object: Vec<u8>) {
		self.destroyed.fetch_add(1, Ordering::Relaxed);
		drop(object);
	}
}

fn counting_pool(size: u64, reuse: u64) -> (Pool<Vec<u8>, CountingAllocator>, CountingAllocator) {
	let allocator = CountingAllocator {
		created: Arc::new(AtomicUsize::new(0)),
		destroyed: Arc::new(AtomicUsize::new(0)),
	};
	(Pool::new(allocator.clone(), size, reuse), allocator)
}

#[test]
fn get_fails_at_the_size_limit() {
	let (pool, _) = counting_pool(2, 2);
	let a = pool.get().unwrap();
	let _b = pool.get().unwrap();
	assert!(pool.get().is_err());
	// Releasing makes room again via the reuse queue.
	pool.release(a);
	assert!(pool.get().is_ok());
}

#[test]
fn release_prefers_reuse_up_to_the_limit() {
	let (pool, allocator) = counting_pool(4, 1);
	let a = pool.get().unwrap();
	let b = pool.get().unwrap();
	pool.release(a);
	pool.release(b);
	// Only one object fits the reuse queue; the second was destroyed.
	assert_eq!(pool.reusable(), 1);
	assert_eq!(allocator.destroyed.load(Ordering::Relaxed), 1);
	assert_eq!(pool.allocated(), 1);
}

#[test]
fn reused_objects_are_reset() {
	let (pool, allocator) = counting_pool(1, 1);
	let mut object = pool.get().unwrap();
	object[0] = 42;
	pool.release(object);
	let object = pool.get().unwrap();
	assert_eq!(object[0], 0);
	assert_eq!(allocator.created.load(Ordering::Relaxed), 1);
}

#[test]
fn concurrent_get_release_respects_the_limit() {
	const THREADS: usize = 8;
	const ITERATIONS: usize = 1_000;
	let (pool, _) = counting_pool(THREADS as u64 / 2, THREADS as u64 / 2);
	let pool = Arc::new(pool);

	let mut handles = Vec::new();
	for _ in 0..THREADS {
		let pool = pool.clone();
		handles.push(std::thread::spawn(move || {
			let mut failures = 0;
			for _ in 0..ITERATIONS {
				match pool.get() {
					Ok(object) => pool.release(object),
					Err(_) => failures += 1,
				}
			}
			failures
		}));
	}
	for handle in handles {
		handle.join().unwrap();
	}
	assert!(pool.allocated() <= THREADS as u64 / 2);
}
