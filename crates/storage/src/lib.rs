// Copyright (c) quarrydb.io 2025
// This file is licensed under the Apache-2.0, see license.md file

//! Block-organized MVCC tuple storage.
//!
//! A [`DataTable`] is a logical heap of tuples spread across raw blocks laid
//! out column-major (PAX). Every tuple slot carries a version chain of undo
//! records; readers reconstruct their snapshot by applying before-images,
//! writers install versions with a CAS on the slot's version pointer.
//! Readers never block writers and writers never block readers.

pub use access_controller::{BlockReadGuard, BlockState, BlockWriteGuard};
pub use arrow_metadata::{ArrowBlockMetadata, ArrowColumnInfo, ArrowColumnType, ArrowVarlenColumn};
pub use block::{BlockHeader, BlockStore, RawBlock, TupleSlot};
pub use error::{Result, StorageError};
pub use ids::{ColumnId, DatabaseId, TableId, VERSION_POINTER_COLUMN};
pub use index::Index;
pub use layout::{BlockLayout, VARLEN_COLUMN};
pub use log_record::{CommitRecordBody, DeleteRecordBody, LogRecord, LogRecordType, RedoRecordBody};
pub use projected_row::{ProjectedRow, ProjectedRowBuffer, ProjectedRowInitializer};
pub use record_buffer::{BufferSegmentPool, RecordBufferSegment, RedoBuffer, SegmentAllocator, UndoBuffer};
pub use data_table::{DataTable, TableScanIter};
pub use transaction_context::TransactionContext;
pub use tuple_access::TupleAccessStrategy;
pub use undo_record::{UndoRecord, UndoRecordType};
pub use varlen::{VarlenEntry, VARLEN_INLINE_THRESHOLD};

mod access_controller;
mod arrow_metadata;
mod block;
mod data_table;
mod error;
mod ids;
mod index;
mod layout;
mod log_record;
mod projected_row;
mod record_buffer;
mod storage_util;
mod transaction_context;
mod tuple_access;
mod undo_record;
mod varlen;
