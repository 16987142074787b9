// Copyright (c) quarrydb.io 2025
// This file is licensed under the Apache-2.0, see license.md file

//! Byte-moving helpers between blocks and projected rows.

use std::ptr;

use crate::block::TupleSlot;
use crate::projected_row::ProjectedRow;
use crate::tuple_access::TupleAccessStrategy;

/// Copies one column value (and its null state) out of a block into a
/// projected row.
pub(crate) fn copy_attr_from_block(
	accessor: &TupleAccessStrategy,
	slot: TupleSlot,
	row: &mut ProjectedRow,
	index: u16,
) {
	let col = row.column_id(index);
	match accessor.access_with_null_check(slot, col) {
		Some(src) => {
			let dst = row.access_force_not_null(index);
			unsafe { ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len()) };
		}
		None => row.set_null(index),
	}
}

/// Copies one column value (and its null state) from a projected row into a
/// block slot.
pub(crate) fn copy_attr_into_block(
	accessor: &TupleAccessStrategy,
	row: &ProjectedRow,
	index: u16,
	slot: TupleSlot,
) {
	let col = row.column_id(index);
	match row.access_with_null_check(index) {
		Some(src) => {
			let dst = accessor.access_force_not_null(slot, col);
			unsafe { ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len()) };
		}
		None => accessor.set_null(slot, col),
	}
}

/// Applies a before-image onto `out`: every column the delta carries that is
/// also projected in `out` gets the delta's value and null state. Both
/// column-id lists are sorted, so this is a linear merge.
pub(crate) fn apply_delta(delta: &ProjectedRow, out: &mut ProjectedRow) {
	let mut out_index: u16 = 0;
	let out_cols = out.num_columns();
	for delta_index in 0..delta.num_columns() {
		let col = delta.column_id(delta_index);
		while out_index < out_cols && out.column_id(out_index) < col {
			out_index += 1;
		}
		if out_index >= out_cols {
			break;
		}
		if out.column_id(out_index) != col {
			continue;
		}
		match delta.access_with_null_check(delta_index) {
			Some(src) => {
				let dst = out.access_force_not_null(out_index);
				debug_assert_eq!(src.len(), dst.len());
				dst.copy_from_slice(src);
			}
			None => out.set_null(out_index),
		}
		out_index += 1;
	}
}
