// Copyright (c) quarrydb.io 2025
// This file is licensed under the Apache-2.0, see license.md file

//! Pooled buffer segments that undo and redo records are bump-allocated
//! into. Segments are fixed-size and 8-aligned; a single record never spans
//! segments, so every record must fit in one.

use std::sync::Arc;

use quarry_core::constants::BUFFER_SEGMENT_SIZE;
use quarry_core::pool::{Pool, PoolAllocator};

use crate::error::{Result, StorageError};
use crate::log_record::LogRecord;
use crate::undo_record::UndoRecord;

/// One fixed-size allocation arena. The backing store is word-typed so every
/// reserved record starts 8-aligned.
pub struct RecordBufferSegment {
	words: Box<[u64]>,
	used: usize,
}

impl RecordBufferSegment {
	fn new() -> Self {
		Self {
			words: vec![0u64; BUFFER_SEGMENT_SIZE / 8].into_boxed_slice(),
			used: 0,
		}
	}

	fn reset(&mut self) {
		self.used = 0;
	}

	fn reserve(&mut self, size: usize) -> Option<*mut u8> {
		let aligned = size.next_multiple_of(8);
		if self.used + aligned > BUFFER_SEGMENT_SIZE {
			return None;
		}
		let ptr = unsafe { (self.words.as_mut_ptr() as *mut u8).add(self.used) };
		self.used += aligned;
		Some(ptr)
	}

	fn base(&self) -> *const u8 {
		self.words.as_ptr() as *const u8
	}

	fn used(&self) -> usize {
		self.used
	}
}

pub struct SegmentAllocator;

impl PoolAllocator<RecordBufferSegment> for SegmentAllocator {
	fn allocate(&self) -> RecordBufferSegment {
		RecordBufferSegment::new()
	}

	fn reuse(&self, segment: &mut RecordBufferSegment) {
		segment.reset();
	}
}

/// Shared pool bounding how many segments all transactions may hold at once.
pub type BufferSegmentPool = Pool<RecordBufferSegment, SegmentAllocator>;

/// A chain of segments with bump allocation. Records are self-sizing: the
/// first four bytes of every record hold its byte size, which is how
/// iteration finds record boundaries.
struct RecordBuffer {
	pool: Arc<BufferSegmentPool>,
	segments: Vec<RecordBufferSegment>,
}

impl RecordBuffer {
	fn new(pool: Arc<BufferSegmentPool>) -> Self {
		Self {
			pool,
			segments: Vec::new(),
		}
	}

	fn reserve(&mut self, size: usize) -> Result<*mut u8> {
		assert!(size <= BUFFER_SEGMENT_SIZE, "record exceeds segment size");
		if let Some(segment) = self.segments.last_mut() {
			if let Some(ptr) = segment.reserve(size) {
				return Ok(ptr);
			}
		}
		let mut segment = self.pool.get().map_err(StorageError::OutOfMemory)?;
		let ptr = segment.reserve(size).expect("fresh segment fits any record");
		self.segments.push(segment);
		Ok(ptr)
	}

	fn is_empty(&self) -> bool {
		self.segments.is_empty()
	}

	fn iter(&self) -> RawRecordIter<'_> {
		RawRecordIter {
			buffer: self,
			segment: 0,
			offset: 0,
		}
	}
}

impl Drop for RecordBuffer {
	fn drop(&mut self) {
		for segment in self.segments.drain(..) {
			self.pool.release(segment);
		}
	}
}

struct RawRecordIter<'a> {
	buffer: &'a RecordBuffer,
	segment: usize,
	offset: usize,
}

impl Iterator for RawRecordIter<'_> {
	type Item = *mut u8;

	fn next(&mut self) -> Option<*mut u8> {
		loop {
			let segment = self.buffer.segments.get(self.segment)?;
			if self.offset >= segment.used() {
				self.segment += 1;
				self.offset = 0;
				continue;
			}
			let ptr = unsafe { segment.base().add(self.offset) as *mut u8 };
			// Every record stores its size in its first four bytes.
			let size = unsafe { (ptr as *const u32).read() } as usize;
			debug_assert!(size >= size_of::<u32>());
			self.offset += size.next_multiple_of(8);
			return Some(ptr);
		}
	}
}

/// Per-transaction buffer of undo records. Single-writer while the owning
/// transaction runs; read by the manager at commit/abort and by the GC once
/// the transaction completes.
pub struct UndoBuffer(RecordBuffer);

impl UndoBuffer {
	pub fn new(pool: Arc<BufferSegmentPool>) -> Self {
		Self(RecordBuffer::new(pool))
	}

	pub(crate) fn reserve(&mut self, size: usize) -> Result<*mut u8> {
		self.0.reserve(size)
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	/// Rolls the bump allocator back over the most recent reservation.
	/// Only valid while that record has not been published anywhere.
	pub(crate) fn undo_last_reserve(&mut self, size: usize) {
		let segment = self.0.segments.last_mut().expect("a reservation to roll back");
		let aligned = size.next_multiple_of(8);
		debug_assert!(segment.used >= aligned);
		segment.used -= aligned;
	}

	pub fn iter(&self) -> impl Iterator<Item = *mut UndoRecord> + '_ {
		self.0.iter().map(|ptr| ptr as *mut UndoRecord)
	}

	pub fn record_count(&self) -> usize {
		self.iter().count()
	}
}

/// Per-transaction append-only buffer of redo records, handed to the log
/// manager at commit and consumed by the serializer.
pub struct RedoBuffer(RecordBuffer);

impl RedoBuffer {
	pub fn new(pool: Arc<BufferSegmentPool>) -> Self {
		Self(RecordBuffer::new(pool))
	}

	pub(crate) fn reserve(&mut self, size: usize) -> Result<*mut u8> {
		self.0.reserve(size)
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item = *const LogRecord> + '_ {
		self.0.iter().map(|ptr| ptr as *const LogRecord)
	}
}

// The buffers only carry raw records whose referenced blocks and tables are
// kept alive by the engine for at least as long as any buffer.
unsafe impl Send for UndoBuffer {}
unsafe impl Send for RedoBuffer {}

#[cfg(test)]
mod tests {
	use super::*;

	fn pool() -> Arc<BufferSegmentPool> {
		Arc::new(BufferSegmentPool::new(SegmentAllocator, 16, 8))
	}

	fn write_record(buffer: &mut RecordBuffer, size: u32, fill: u8) {
		let mem = buffer.reserve(size as usize).unwrap();
		unsafe {
			(mem as *mut u32).write(size);
			std::ptr::write_bytes(mem.add(4), fill, size as usize - 4);
		}
	}

	#[test]
	fn iteration_walks_size_prefixed_records() {
		let mut buffer = RecordBuffer::new(pool());
		for (size, fill) in [(12u32, 1u8), (20, 2), (9, 3)] {
			write_record(&mut buffer, size, fill);
		}
		let records: Vec<(u32, u8)> = buffer
			.iter()
			.map(|ptr| unsafe { ((ptr as *const u32).read(), ptr.add(4).read()) })
			.collect();
		assert_eq!(records, vec![(12, 1), (20, 2), (9, 3)]);
	}

	#[test]
	fn records_spill_into_new_segments() {
		let mut buffer = RecordBuffer::new(pool());
		let record_size = BUFFER_SEGMENT_SIZE / 2 + 8;
		write_record(&mut buffer, record_size as u32, 1);
		write_record(&mut buffer, record_size as u32, 2);
		assert_eq!(buffer.segments.len(), 2);
		assert_eq!(buffer.iter().count(), 2);
	}

	#[test]
	fn segments_return_to_the_pool_on_drop() {
		let pool = pool();
		{
			let mut buffer = RecordBuffer::new(pool.clone());
			write_record(&mut buffer, 16, 0);
		}
		assert_eq!(pool.reusable(), 1);
		assert_eq!(pool.allocated(), 1);
	}

	#[test]
	fn undo_last_reserve_hides_the_record() {
		let pool = pool();
		let mut undo = UndoBuffer::new(pool);
		let mem = undo.reserve(24).unwrap();
		unsafe { (mem as *mut u32).write(24) };
		assert_eq!(undo.record_count(), 1);
		undo.undo_last_reserve(24);
		assert_eq!(undo.record_count(), 0);
	}
}
