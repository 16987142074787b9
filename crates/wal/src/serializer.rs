// Copyright (c) quarrydb.io 2025
// This file is licensed under the Apache-2.0, see license.md file

//! Turning in-memory log records into the self-describing on-disk stream.
//!
//! Every serialized record is `[size: u32][kind: u8][txn_begin: u64][body]`
//! where `size` counts everything after the size field. Redo bodies carry
//! `[db][table][slot][num_cols][col_ids][null bitmap][values]`; fixed-width
//! values are raw bytes, varlen values are `[len: u32][bytes]` and null
//! columns contribute only their bitmap bit. Endianness is native: log
//! files are not portable across architectures.

use crossbeam_channel::{Receiver, Sender};
use quarry_storage::{LogRecord, LogRecordType, ProjectedRow};

use crate::page::LogBuffer;

// Fixed-width attributes are at most 8 bytes, so a 16-byte value can only
// be a varlen entry. This keeps the serializer independent of table
// layouts.
const VARLEN_VALUE_SIZE: usize = 16;

/// Rotates page buffers under the serializer: writes stream bytes into the
/// current buffer, handing full buffers to the disk writer and blocking on
/// the empty-buffer pool when the writer falls behind.
pub(crate) struct SerializerOutput<'a> {
	current: Option<LogBuffer>,
	position: u64,
	empty: &'a Receiver<LogBuffer>,
	filled: &'a Sender<LogBuffer>,
}

impl<'a> SerializerOutput<'a> {
	pub(crate) fn new(empty: &'a Receiver<LogBuffer>, filled: &'a Sender<LogBuffer>) -> Self {
		Self {
			current: None,
			position: 0,
			empty,
			filled,
		}
	}

	/// Payload-stream offset of everything written so far.
	pub(crate) fn position(&self) -> u64 {
		self.position
	}

	fn write(&mut self, mut bytes: &[u8]) {
		while !bytes.is_empty() {
			if self.current.is_none() {
				// Blocks until the disk writer frees a buffer.
				self.current = Some(self.empty.recv().expect("buffer pool outlives serializer"));
			}
			let buffer = self.current.as_mut().expect("just ensured");
			let taken = buffer.fill(bytes);
			self.position += taken as u64;
			bytes = &bytes[taken..];
			if buffer.remaining() == 0 {
				self.hand_off();
			}
		}
	}

	fn write_u16(&mut self, value: u16) {
		self.write(&value.to_ne_bytes());
	}

	fn write_u32(&mut self, value: u32) {
		self.write(&value.to_ne_bytes());
	}

	fn write_u64(&mut self, value: u64) {
		self.write(&value.to_ne_bytes());
	}

	fn hand_off(&mut self) {
		if let Some(mut buffer) = self.current.take() {
			buffer.end_position = self.position;
			self.filled.send(buffer).expect("disk writer outlives serializer");
		}
	}

	/// Hands the current partially filled buffer to the disk writer, e.g.
	/// at the end of a serialization round.
	pub(crate) fn flush_current(&mut self) {
		if self.current.as_ref().is_some_and(|b| !b.is_empty()) {
			self.hand_off();
		}
	}
}

fn bitmap_bytes(num_cols: usize) -> usize {
	num_cols.div_ceil(8)
}

fn redo_values_size(delta: &ProjectedRow) -> usize {
	let mut size = 0;
	for index in 0..delta.num_columns() {
		if delta.is_null(index) {
			continue;
		}
		let value_size = delta.value_size(index);
		if value_size == VARLEN_VALUE_SIZE {
			let entry = delta.varlen_entry(index).expect("checked not null");
			size += size_of::<u32>() + entry.size();
		} else {
			size += value_size;
		}
	}
	size
}

/// Serialized size of everything after the leading size field.
fn serialized_size(record: &LogRecord) -> usize {
	let common = size_of::<u8>() + size_of::<u64>();
	let slot = size_of::<u64>() + size_of::<u32>();
	let table = 2 * size_of::<u32>();
	match record.record_type() {
		LogRecordType::Redo => {
			let delta = record.redo_delta();
			let num_cols = delta.num_columns() as usize;
			common + table + slot + size_of::<u16>() + 2 * num_cols + bitmap_bytes(num_cols)
				+ redo_values_size(delta)
		}
		LogRecordType::Delete => common + table + slot,
		LogRecordType::Commit => common + size_of::<u64>(),
		LogRecordType::Abort => common,
	}
}

pub(crate) fn serialize_record(record: &LogRecord, out: &mut SerializerOutput<'_>) {
	out.write_u32(serialized_size(record) as u32);
	out.write(&[record.record_type() as u8]);
	out.write_u64(record.txn_begin().0);

	match record.record_type() {
		LogRecordType::Redo => {
			let body = record.redo_body();
			out.write_u32(body.database.0);
			out.write_u32(body.table.0);
			out.write_u64(body.slot.block().id());
			out.write_u32(body.slot.offset());

			let delta = record.redo_delta();
			let num_cols = delta.num_columns();
			out.write_u16(num_cols);
			for index in 0..num_cols {
				out.write_u16(delta.column_id(index).0);
			}
			let mut bitmap = vec![0u8; bitmap_bytes(num_cols as usize)];
			for index in 0..num_cols {
				if !delta.is_null(index) {
					bitmap[index as usize / 8] |= 1 << (index % 8);
				}
			}
			out.write(&bitmap);
			for index in 0..num_cols {
				let Some(value) = delta.access_with_null_check(index) else {
					continue;
				};
				if value.len() == VARLEN_VALUE_SIZE {
					let entry = delta.varlen_entry(index).expect("checked not null");
					out.write_u32(entry.size() as u32);
					out.write(entry.as_bytes());
				} else {
					out.write(value);
				}
			}
		}
		LogRecordType::Delete => {
			let body = record.delete_body();
			out.write_u32(body.database.0);
			out.write_u32(body.table.0);
			out.write_u64(body.slot.block().id());
			out.write_u32(body.slot.offset());
		}
		LogRecordType::Commit => {
			out.write_u64(record.commit_body().commit_ts);
		}
		LogRecordType::Abort => {}
	}
}
