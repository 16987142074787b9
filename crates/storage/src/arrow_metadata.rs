// Copyright (c) quarrydb.io 2025
// This file is licensed under the Apache-2.0, see license.md file

//! The per-block Arrow metadata region.
//!
//! Lives embedded in block memory right after the header:
//!
//!   [num_records: u32][null_counts: u32 x num_cols][pad to 8]
//!   [ArrowColumnInfo x num_cols]
//!
//! When a block is frozen the region describes every column well enough for
//! an external analytic consumer to read the block without the MVCC layer.
//! While the block is hot the region is not authoritative.

use std::ptr;
use std::slice;

use crate::ids::ColumnId;

/// How a column is represented for Arrow consumers.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ArrowColumnType {
	/// Fixed-length values; the in-block value array is already
	/// Arrow-compatible.
	Fixed = 0,
	/// Varlen values gathered into a contiguous values buffer plus an
	/// offsets array.
	GatheredVarlen = 1,
	/// De-duplicated values buffer plus a per-slot indices array.
	DictionaryCompressed = 2,
}

impl ArrowColumnType {
	pub fn from_u8(value: u8) -> ArrowColumnType {
		match value {
			0 => ArrowColumnType::Fixed,
			1 => ArrowColumnType::GatheredVarlen,
			2 => ArrowColumnType::DictionaryCompressed,
			_ => unreachable!("invalid arrow column type"),
		}
	}
}

/// An Arrow list column: a byte array of values and an array of offsets
/// into it, `num_slots + 1` entries long.
#[repr(C)]
pub struct ArrowVarlenColumn {
	values_length: u32,
	offsets_length: u32,
	values: *mut u8,
	offsets: *mut u32,
}

impl ArrowVarlenColumn {
	pub fn allocate(values_length: u32, offsets_length: u32) -> Self {
		let values = Box::into_raw(vec![0u8; values_length as usize].into_boxed_slice()) as *mut u8;
		let offsets =
			Box::into_raw(vec![0u32; offsets_length as usize].into_boxed_slice()) as *mut u32;
		Self {
			values_length,
			offsets_length,
			values,
			offsets,
		}
	}

	pub fn is_allocated(&self) -> bool {
		!self.values.is_null()
	}

	pub fn values_length(&self) -> u32 {
		self.values_length
	}

	pub fn offsets_length(&self) -> u32 {
		self.offsets_length
	}

	pub fn values(&self) -> &[u8] {
		debug_assert!(self.is_allocated());
		unsafe { slice::from_raw_parts(self.values, self.values_length as usize) }
	}

	pub fn values_mut(&mut self) -> &mut [u8] {
		debug_assert!(self.is_allocated());
		unsafe { slice::from_raw_parts_mut(self.values, self.values_length as usize) }
	}

	pub fn values_ptr(&self) -> *const u8 {
		self.values
	}

	pub fn offsets(&self) -> &[u32] {
		debug_assert!(self.is_allocated());
		unsafe { slice::from_raw_parts(self.offsets, self.offsets_length as usize) }
	}

	pub fn offsets_mut(&mut self) -> &mut [u32] {
		debug_assert!(self.is_allocated());
		unsafe { slice::from_raw_parts_mut(self.offsets, self.offsets_length as usize) }
	}

	pub(crate) fn deallocate(&mut self) {
		if !self.values.is_null() {
			unsafe {
				drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
					self.values,
					self.values_length as usize,
				)));
				drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
					self.offsets,
					self.offsets_length as usize,
				)));
			}
			self.values = ptr::null_mut();
			self.offsets = ptr::null_mut();
			self.values_length = 0;
			self.offsets_length = 0;
		}
	}
}

/// Everything Arrow needs to interpret one column of a frozen block.
#[repr(C)]
pub struct ArrowColumnInfo {
	varlen: ArrowVarlenColumn,
	indices: *mut u32,
	indices_length: u32,
	column_type: u8,
	_pad: [u8; 3],
}

impl ArrowColumnInfo {
	pub fn column_type(&self) -> ArrowColumnType {
		ArrowColumnType::from_u8(self.column_type)
	}

	pub fn set_column_type(&mut self, column_type: ArrowColumnType) {
		self.column_type = column_type as u8;
	}

	pub fn varlen_column(&self) -> &ArrowVarlenColumn {
		&self.varlen
	}

	pub fn varlen_column_mut(&mut self) -> &mut ArrowVarlenColumn {
		&mut self.varlen
	}

	/// Replaces the gathered buffers, freeing the previous incarnation.
	pub fn install_varlen(&mut self, column: ArrowVarlenColumn) {
		self.varlen.deallocate();
		// Move the buffers in without dropping them.
		unsafe { ptr::write(&mut self.varlen, column) };
	}

	/// Only meaningful for dictionary-compressed columns: one entry per
	/// slot, indexing into the de-duplicated values buffer.
	pub fn indices(&self) -> &[u32] {
		debug_assert_eq!(self.column_type(), ArrowColumnType::DictionaryCompressed);
		unsafe { slice::from_raw_parts(self.indices, self.indices_length as usize) }
	}

	pub fn install_indices(&mut self, indices: Box<[u32]>) {
		self.drop_indices();
		self.indices_length = indices.len() as u32;
		self.indices = Box::into_raw(indices) as *mut u32;
	}

	fn drop_indices(&mut self) {
		if !self.indices.is_null() {
			unsafe {
				drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
					self.indices,
					self.indices_length as usize,
				)));
			}
			self.indices = ptr::null_mut();
			self.indices_length = 0;
		}
	}

	/// Frees every owned buffer; called when the block is released or the
	/// column is re-gathered.
	pub(crate) fn deallocate(&mut self) {
		self.varlen.deallocate();
		self.drop_indices();
	}
}

/// Header of the embedded metadata region. The trailing null-count and
/// column-info arrays are reached through offset math because their length
/// depends on the layout.
#[repr(C)]
pub struct ArrowBlockMetadata {
	num_records: u32,
}

impl ArrowBlockMetadata {
	/// Region size for a layout with `num_cols` columns (including the
	/// reserved version-pointer column, whose entries are unused).
	pub fn size(num_cols: u16) -> usize {
		Self::infos_offset(num_cols) + num_cols as usize * size_of::<ArrowColumnInfo>()
	}

	fn infos_offset(num_cols: u16) -> usize {
		(size_of::<u32>() + size_of::<u32>() * num_cols as usize).next_multiple_of(8)
	}

	pub fn num_records(&self) -> u32 {
		self.num_records
	}

	pub fn set_num_records(&mut self, num_records: u32) {
		self.num_records = num_records;
	}

	fn base(&self) -> *const u8 {
		self as *const ArrowBlockMetadata as *const u8
	}

	pub fn null_count(&self, col: ColumnId) -> u32 {
		unsafe {
			(self.base().add(size_of::<u32>()) as *const u32)
				.add(col.0 as usize)
				.read()
		}
	}

	pub fn set_null_count(&mut self, col: ColumnId, count: u32) {
		unsafe {
			(self.base().add(size_of::<u32>()) as *mut u32)
				.add(col.0 as usize)
				.write(count);
		}
	}

	pub fn column_info(&self, num_cols: u16, col: ColumnId) -> &ArrowColumnInfo {
		debug_assert!(col.0 < num_cols);
		unsafe {
			&*(self.base().add(Self::infos_offset(num_cols)) as *const ArrowColumnInfo)
				.add(col.0 as usize)
		}
	}

	pub fn column_info_mut(&mut self, num_cols: u16, col: ColumnId) -> &mut ArrowColumnInfo {
		debug_assert!(col.0 < num_cols);
		unsafe {
			&mut *(self.base().add(Self::infos_offset(num_cols)) as *mut ArrowColumnInfo)
				.add(col.0 as usize)
		}
	}

	/// Frees all gathered buffers, e.g. before the block returns to its
	/// store.
	pub fn deallocate_columns(&mut self, num_cols: u16) {
		for col in 0..num_cols {
			self.column_info_mut(num_cols, ColumnId(col)).deallocate();
		}
	}
}
