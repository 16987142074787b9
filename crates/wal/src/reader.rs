// Copyright (c) quarrydb.io 2025
// This file is licensed under the Apache-2.0, see license.md file

//! Reading the log back at startup.
//!
//! The reader validates pages (length field + checksum), concatenates their
//! payloads into the record stream and parses records until the stream ends
//! or turns bad. A torn or corrupt tail is not an error: recovery stops at
//! the offending record and the caller truncates the tail using
//! [`TailRepair`].

use std::fs::File;
use std::io::Read;
use std::path::Path;

use quarry_core::constants::LOG_BUFFER_SIZE;
use quarry_core::Timestamp;
use quarry_storage::{
	BlockLayout, ColumnId, DatabaseId, LogRecordType, ProjectedRowBuffer,
	ProjectedRowInitializer, TableId, VarlenEntry,
};
use tracing::{debug, warn};

use crate::error::{Result, WalError};
use crate::page::decode_page;

/// The serialized identity of a tuple slot: block id and offset as they
/// were in the writing process. Only meaningful as a remap key during
/// replay.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SlotKey {
	pub block: u64,
	pub offset: u32,
}

/// Resolves layouts for redo-record parsing. Implemented by the engine's
/// table registry.
pub trait TableRegistry {
	fn layout(&self, database: DatabaseId, table: TableId) -> Option<&BlockLayout>;
}

/// A fully parsed on-disk record.
pub enum RecoveredRecord {
	Redo {
		txn_begin: Timestamp,
		database: DatabaseId,
		table: TableId,
		slot: SlotKey,
		row: ProjectedRowBuffer,
	},
	Delete {
		txn_begin: Timestamp,
		database: DatabaseId,
		table: TableId,
		slot: SlotKey,
	},
	Commit {
		txn_begin: Timestamp,
		commit_ts: Timestamp,
	},
	Abort {
		txn_begin: Timestamp,
	},
}

/// Instructions for cutting a torn tail off the log file: keep
/// `keep_file_bytes`, then append one page holding `final_payload` (unless
/// empty).
pub struct TailRepair {
	pub keep_file_bytes: u64,
	pub final_payload: Vec<u8>,
}

pub struct LogFileReader {
	stream: Vec<u8>,
	/// Cumulative payload length at the end of each valid page.
	page_ends: Vec<usize>,
	cursor: usize,
	last_complete_end: usize,
	saw_bad_page: bool,
	done: bool,
}

impl LogFileReader {
	pub fn open(path: impl AsRef<Path>) -> Result<Self> {
		let mut file = File::open(path.as_ref()).map_err(WalError::Io)?;
		let mut stream = Vec::new();
		let mut page_ends = Vec::new();
		let mut page = [0u8; LOG_BUFFER_SIZE];
		let mut saw_bad_page = false;
		loop {
			match read_exact_or_eof(&mut file, &mut page)? {
				ReadOutcome::Page => match decode_page(&page) {
					Some(payload) => {
						stream.extend_from_slice(payload);
						page_ends.push(stream.len());
					}
					None => {
						warn!(page = page_ends.len(), "corrupt log page, truncating tail");
						saw_bad_page = true;
						break;
					}
				},
				ReadOutcome::Eof => break,
				ReadOutcome::Partial => {
					warn!(page = page_ends.len(), "torn trailing log page, truncating tail");
					saw_bad_page = true;
					break;
				}
			}
		}
		debug!(pages = page_ends.len(), bytes = stream.len(), "log scanned");
		Ok(Self {
			stream,
			page_ends,
			cursor: 0,
			last_complete_end: 0,
			saw_bad_page,
			done: false,
		})
	}

	/// Parses the next record, or `None` once the stream ends (including at
	/// a torn or corrupt tail).
	pub fn next_record<R: TableRegistry>(&mut self, registry: &R) -> Result<Option<RecoveredRecord>> {
		if self.done {
			return Ok(None);
		}
		let Some(record) = self.parse_one(registry)? else {
			self.done = true;
			return Ok(None);
		};
		self.last_complete_end = self.cursor;
		Ok(Some(record))
	}

	fn parse_one<R: TableRegistry>(&mut self, registry: &R) -> Result<Option<RecoveredRecord>> {
		let mut parser = StreamParser {
			bytes: &self.stream,
			pos: self.cursor,
		};
		let Some(size) = parser.u32() else {
			return Ok(None);
		};
		let end = parser.pos + size as usize;
		if end > self.stream.len() {
			// Record extends past the valid stream: torn tail.
			return Ok(None);
		}
		let Some(kind) = parser.u8().and_then(LogRecordType::from_u8) else {
			return Ok(None);
		};
		let Some(txn_begin) = parser.u64().map(Timestamp) else {
			return Ok(None);
		};

		let record = match kind {
			LogRecordType::Commit => {
				let Some(commit_ts) = parser.u64().map(Timestamp) else {
					return Ok(None);
				};
				RecoveredRecord::Commit {
					txn_begin,
					commit_ts,
				}
			}
			LogRecordType::Abort => RecoveredRecord::Abort { txn_begin },
			LogRecordType::Delete => {
				let Some((database, table, slot)) = parser.table_slot() else {
					return Ok(None);
				};
				RecoveredRecord::Delete {
					txn_begin,
					database,
					table,
					slot,
				}
			}
			LogRecordType::Redo => {
				let Some((database, table, slot)) = parser.table_slot() else {
					return Ok(None);
				};
				let layout = registry.layout(database, table).ok_or(WalError::UnknownTable {
					database: database.0,
					table: table.0,
				})?;
				let Some(row) = parser.redo_row(layout) else {
					return Ok(None);
				};
				RecoveredRecord::Redo {
					txn_begin,
					database,
					table,
					slot,
					row,
				}
			}
		};

		if parser.pos != end {
			// Body length disagrees with the size field.
			return Ok(None);
		}
		self.cursor = parser.pos;
		Ok(Some(record))
	}

	/// Whether the file has a tail that should be cut off before appending
	/// new records.
	pub fn needs_repair(&self) -> bool {
		self.saw_bad_page || self.last_complete_end != self.stream.len()
	}

	pub fn tail_repair(&self) -> TailRepair {
		let end = self.last_complete_end;
		let mut full_pages = 0;
		while full_pages < self.page_ends.len() && self.page_ends[full_pages] <= end {
			full_pages += 1;
		}
		let consumed_before = if full_pages == 0 {
			0
		} else {
			self.page_ends[full_pages - 1]
		};
		TailRepair {
			keep_file_bytes: (full_pages * LOG_BUFFER_SIZE) as u64,
			final_payload: self.stream[consumed_before..end].to_vec(),
		}
	}
}

enum ReadOutcome {
	Page,
	Partial,
	Eof,
}

fn read_exact_or_eof(file: &mut File, page: &mut [u8]) -> Result<ReadOutcome> {
	let mut filled = 0;
	while filled < page.len() {
		let n = file.read(&mut page[filled..]).map_err(WalError::Io)?;
		if n == 0 {
			return Ok(if filled == 0 {
				ReadOutcome::Eof
			} else {
				ReadOutcome::Partial
			});
		}
		filled += n;
	}
	Ok(ReadOutcome::Page)
}

struct StreamParser<'a> {
	bytes: &'a [u8],
	pos: usize,
}

impl StreamParser<'_> {
	fn take(&mut self, n: usize) -> Option<&[u8]> {
		if self.pos + n > self.bytes.len() {
			return None;
		}
		let slice = &self.bytes[self.pos..self.pos + n];
		self.pos += n;
		Some(slice)
	}

	fn u8(&mut self) -> Option<u8> {
		self.take(1).map(|b| b[0])
	}

	fn u16(&mut self) -> Option<u16> {
		self.take(2).map(|b| u16::from_ne_bytes(b.try_into().unwrap()))
	}

	fn u32(&mut self) -> Option<u32> {
		self.take(4).map(|b| u32::from_ne_bytes(b.try_into().unwrap()))
	}

	fn u64(&mut self) -> Option<u64> {
		self.take(8).map(|b| u64::from_ne_bytes(b.try_into().unwrap()))
	}

	fn table_slot(&mut self) -> Option<(DatabaseId, TableId, SlotKey)> {
		let database = DatabaseId(self.u32()?);
		let table = TableId(self.u32()?);
		let block = self.u64()?;
		let offset = self.u32()?;
		Some((database, table, SlotKey { block, offset }))
	}

	/// Parses the serialized after-image back into an owned projected row.
	fn redo_row(&mut self, layout: &BlockLayout) -> Option<ProjectedRowBuffer> {
		let num_cols = self.u16()? as usize;
		if num_cols == 0 || num_cols >= layout.num_columns() as usize {
			return None;
		}
		let mut col_ids = Vec::with_capacity(num_cols);
		for _ in 0..num_cols {
			let col = ColumnId(self.u16()?);
			if col.0 == 0 || col.0 >= layout.num_columns() {
				return None;
			}
			col_ids.push(col);
		}
		let bitmap = self.take(num_cols.div_ceil(8))?.to_vec();

		let initializer = ProjectedRowInitializer::new(layout, col_ids.clone());
		let mut buffer = ProjectedRowBuffer::new(&initializer);
		let row = buffer.row_mut();
		for (index, &col) in col_ids.iter().enumerate() {
			if bitmap[index / 8] & (1 << (index % 8)) == 0 {
				row.set_null(index as u16);
				continue;
			}
			if layout.is_varlen(col) {
				let len = self.u32()? as usize;
				let bytes = self.take(len)?;
				row.set_varlen_entry(index as u16, VarlenEntry::from_bytes(bytes));
			} else {
				let bytes = self.take(layout.attr_size(col) as usize)?;
				row.access_force_not_null(index as u16).copy_from_slice(bytes);
			}
		}
		Some(buffer)
	}
}
