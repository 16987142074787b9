// Copyright (c) quarrydb.io 2025
// This file is licensed under the Apache-2.0, see license.md file

//! System-level constants that cannot change at runtime.

/// Default raw block size, in bytes. Must be a power of two.
pub const BLOCK_SIZE: usize = 1 << 20;

/// Record buffer segment size, in bytes. Undo and redo buffers are chains of
/// segments of this size, so a single record can never exceed it.
pub const BUFFER_SEGMENT_SIZE: usize = 1 << 12;

/// Maximum number of columns a table is allowed to have. Small enough that a
/// block still holds at least one slot when every column is as wide as it can
/// be.
pub const MAX_COLUMNS: u16 = 12_500;

/// Size of the physical pages the log manager writes, in bytes.
pub const LOG_BUFFER_SIZE: usize = 1 << 12;

/// Each log page starts with the payload length.
pub const LOG_PAGE_HEADER_SIZE: usize = size_of::<u32>();

/// Each log page ends with a 64-bit checksum over its payload.
pub const LOG_CHECKSUM_SIZE: usize = size_of::<u64>();

/// Serialized log bytes available per page.
pub const LOG_BUFFER_PAYLOAD_SIZE: usize = LOG_BUFFER_SIZE - LOG_PAGE_HEADER_SIZE - LOG_CHECKSUM_SIZE;
