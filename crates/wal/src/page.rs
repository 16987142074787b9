// Copyright (c) quarrydb.io 2025
// This file is licensed under the Apache-2.0, see license.md file

//! Physical log pages.
//!
//! The file is a sequence of fixed-size pages:
//!
//!   [payload_len: u32][payload, zero padded][checksum: u64]
//!
//! where the checksum is xxh3 over the used payload bytes. Serialized
//! records flow through the concatenated payloads and freely span pages.

use quarry_core::constants::{LOG_BUFFER_PAYLOAD_SIZE, LOG_BUFFER_SIZE, LOG_PAGE_HEADER_SIZE};
use xxhash_rust::xxh3::xxh3_64;

/// One page-sized write buffer cycling between the serializer and the disk
/// writer.
pub struct LogBuffer {
	payload: Vec<u8>,
	/// Logical payload-stream offset just past this buffer's content; the
	/// flusher compares pending callback positions against it.
	pub end_position: u64,
}

impl LogBuffer {
	pub fn new() -> Self {
		Self {
			payload: Vec::with_capacity(LOG_BUFFER_PAYLOAD_SIZE),
			end_position: 0,
		}
	}

	pub fn reset(&mut self) {
		self.payload.clear();
		self.end_position = 0;
	}

	pub fn remaining(&self) -> usize {
		LOG_BUFFER_PAYLOAD_SIZE - self.payload.len()
	}

	pub fn is_empty(&self) -> bool {
		self.payload.is_empty()
	}

	/// Appends up to `remaining()` bytes; returns how many were taken.
	pub fn fill(&mut self, bytes: &[u8]) -> usize {
		let take = bytes.len().min(self.remaining());
		self.payload.extend_from_slice(&bytes[..take]);
		take
	}

	/// Encodes the page image written to disk.
	pub fn encode(&self) -> [u8; LOG_BUFFER_SIZE] {
		encode_page(&self.payload)
	}
}

pub fn encode_page(payload: &[u8]) -> [u8; LOG_BUFFER_SIZE] {
	debug_assert!(payload.len() <= LOG_BUFFER_PAYLOAD_SIZE);
	let mut page = [0u8; LOG_BUFFER_SIZE];
	page[..LOG_PAGE_HEADER_SIZE].copy_from_slice(&(payload.len() as u32).to_ne_bytes());
	page[LOG_PAGE_HEADER_SIZE..LOG_PAGE_HEADER_SIZE + payload.len()].copy_from_slice(payload);
	let checksum = xxh3_64(payload);
	page[LOG_BUFFER_SIZE - size_of::<u64>()..].copy_from_slice(&checksum.to_ne_bytes());
	page
}

/// Decodes a page image, verifying the length field and checksum. Returns
/// the payload, or `None` for a torn or corrupt page.
pub fn decode_page(page: &[u8]) -> Option<&[u8]> {
	if page.len() != LOG_BUFFER_SIZE {
		return None;
	}
	let len = u32::from_ne_bytes(page[..LOG_PAGE_HEADER_SIZE].try_into().unwrap()) as usize;
	if len > LOG_BUFFER_PAYLOAD_SIZE {
		return None;
	}
	let payload = &page[LOG_PAGE_HEADER_SIZE..LOG_PAGE_HEADER_SIZE + len];
	let stored =
		u64::from_ne_bytes(page[LOG_BUFFER_SIZE - size_of::<u64>()..].try_into().unwrap());
	if xxh3_64(payload) != stored {
		return None;
	}
	Some(payload)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn page_round_trip() {
		let payload = vec![7u8; 100];
		let page = encode_page(&payload);
		assert_eq!(decode_page(&page), Some(&payload[..]));
	}

	#[test]
	fn corrupt_page_is_rejected() {
		let payload = vec![7u8; 100];
		let mut page = encode_page(&payload);
		page[LOG_PAGE_HEADER_SIZE + 10] ^= 0xff;
		assert_eq!(decode_page(&page), None);
	}

	#[test]
	fn oversized_length_field_is_rejected() {
		let mut page = encode_page(&[]);
		page[..4].copy_from_slice(&(u32::MAX).to_ne_bytes());
		assert_eq!(decode_page(&page), None);
	}
}
