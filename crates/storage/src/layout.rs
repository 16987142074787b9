// Copyright (c) quarrydb.io 2025
// This file is licensed under the Apache-2.0, see license.md file

use quarry_core::bitmap::RawBitmap;
use quarry_core::constants::MAX_COLUMNS;

use crate::arrow_metadata::ArrowBlockMetadata;
use crate::block::BLOCK_HEADER_SIZE;
use crate::error::{Result, StorageError};
use crate::ids::ColumnId;
use crate::varlen::VarlenEntry;

/// Attribute-size sentinel marking a column as variable-length. The stored
/// width is the size of a [`VarlenEntry`].
pub const VARLEN_COLUMN: u16 = 0x8000 | size_of::<VarlenEntry>() as u16;

const VALID_ATTR_SIZES: [u16; 4] = [1, 2, 4, 8];

fn align8(offset: usize) -> usize {
	offset.next_multiple_of(8)
}

/// Immutable descriptor of how tuples of one table are laid out inside a raw
/// block: per-column attribute sizes, which columns are variable-length, how
/// many slots fit, and the derived byte offsets of every bitmap and value
/// array.
///
/// Column 0 is reserved: its 8-byte value array holds version pointers and
/// its bitmap is the slot-presence bitmap. User attribute sizes passed to
/// [`BlockLayout::new`] become columns 1 and up.
#[derive(Clone, Debug)]
pub struct BlockLayout {
	attr_sizes: Vec<u16>,
	block_size: usize,
	num_slots: u32,
	bitmap_offsets: Vec<usize>,
	value_offsets: Vec<usize>,
	arrow_metadata_size: usize,
}

impl BlockLayout {
	pub fn new(block_size: usize, user_attr_sizes: &[u16]) -> Result<Self> {
		assert!(block_size.is_power_of_two());
		if user_attr_sizes.is_empty() {
			return Err(StorageError::EmptyLayout);
		}
		if user_attr_sizes.len() + 1 > MAX_COLUMNS as usize {
			return Err(StorageError::TooManyColumns {
				got: user_attr_sizes.len() + 1,
				max: MAX_COLUMNS,
			});
		}
		let mut attr_sizes = Vec::with_capacity(user_attr_sizes.len() + 1);
		attr_sizes.push(size_of::<u64>() as u16);
		for &size in user_attr_sizes {
			if size != VARLEN_COLUMN && !VALID_ATTR_SIZES.contains(&size) {
				return Err(StorageError::InvalidAttrSize { size });
			}
			attr_sizes.push(size);
		}

		let num_cols = attr_sizes.len();
		let arrow_metadata_size = ArrowBlockMetadata::size(num_cols as u16);
		let fixed = BLOCK_HEADER_SIZE + arrow_metadata_size;
		let tuple_size: usize = attr_sizes.iter().map(|&s| attr_width(s) as usize).sum();

		if fixed >= block_size {
			return Err(StorageError::LayoutTooLarge { block_size });
		}

		// Estimate the slot count ignoring padding, then shrink until the
		// real layout fits.
		let mut num_slots = ((block_size - fixed) * 8 / (tuple_size * 8 + num_cols)) as u32;
		while num_slots > 0 && Self::occupied(fixed, &attr_sizes, num_slots) > block_size {
			num_slots -= 1;
		}
		if num_slots == 0 {
			return Err(StorageError::LayoutTooLarge { block_size });
		}

		let mut bitmap_offsets = Vec::with_capacity(num_cols);
		let mut value_offsets = Vec::with_capacity(num_cols);
		let mut cursor = fixed;
		for &size in &attr_sizes {
			cursor = align8(cursor);
			bitmap_offsets.push(cursor);
			cursor += RawBitmap::size_in_bytes(num_slots as usize);
			value_offsets.push(cursor);
			cursor += num_slots as usize * attr_width(size) as usize;
		}
		debug_assert!(cursor <= block_size);

		Ok(Self {
			attr_sizes,
			block_size,
			num_slots,
			bitmap_offsets,
			value_offsets,
			arrow_metadata_size,
		})
	}

	fn occupied(fixed: usize, attr_sizes: &[u16], num_slots: u32) -> usize {
		let mut cursor = fixed;
		for &size in attr_sizes {
			cursor = align8(cursor);
			cursor += RawBitmap::size_in_bytes(num_slots as usize);
			cursor += num_slots as usize * attr_width(size) as usize;
		}
		cursor
	}

	pub fn num_columns(&self) -> u16 {
		self.attr_sizes.len() as u16
	}

	/// Stored width of a column in bytes (varlen columns store the entry).
	pub fn attr_size(&self, col: ColumnId) -> u16 {
		attr_width(self.attr_sizes[col.0 as usize])
	}

	pub fn is_varlen(&self, col: ColumnId) -> bool {
		self.attr_sizes[col.0 as usize] == VARLEN_COLUMN
	}

	pub fn num_slots(&self) -> u32 {
		self.num_slots
	}

	pub fn block_size(&self) -> usize {
		self.block_size
	}

	/// Bytes one tuple occupies across all value arrays.
	pub fn tuple_size(&self) -> usize {
		self.attr_sizes.iter().map(|&s| attr_width(s) as usize).sum()
	}

	/// All user columns, in id order.
	pub fn user_columns(&self) -> impl Iterator<Item = ColumnId> + '_ {
		(1..self.num_columns()).map(ColumnId)
	}

	pub(crate) fn bitmap_offset(&self, col: ColumnId) -> usize {
		self.bitmap_offsets[col.0 as usize]
	}

	pub(crate) fn value_array_offset(&self, col: ColumnId) -> usize {
		self.value_offsets[col.0 as usize]
	}

	pub(crate) fn arrow_metadata_size(&self) -> usize {
		self.arrow_metadata_size
	}

	/// Offset of the first byte past the header and Arrow metadata region.
	pub(crate) fn content_end(&self) -> usize {
		*self.value_offsets.last().unwrap()
			+ self.num_slots as usize * self.attr_size(ColumnId(self.num_columns() - 1)) as usize
	}
}

fn attr_width(size: u16) -> u16 {
	size & !0x8000
}
