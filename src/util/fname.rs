//! Module containing the external file name codec.
//!
//! A TFS file name is an 18-byte binary value encoded with the URL-safe
//! base64 alphabet, giving a fixed 24-character name:
//! `{lead, block_id(4,BE), file_id(8,BE), suffix_hash(4,BE), check}`.
//! The lead byte is `T` for small files and `L` for large ones (whose
//! payload is an index of child names, handled outside the core).

use crate::data::{crc32, BlockId, FileId};
use crate::error::Error;

pub const FILE_NAME_RAW_LEN: usize = 18;
pub const FILE_NAME_LEN: usize = 24;

const LEAD_SMALL: u8 = b'T';
const LEAD_LARGE: u8 = b'L';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TfsName {
	pub block_id: BlockId,
	pub file_id: FileId,
	pub suffix_hash: u32,
	pub large: bool,
}

/// Hash of a user-supplied suffix, embedded both in the name and in the
/// high half of the file id
pub fn suffix_hash(suffix: &str) -> u32 {
	if suffix.is_empty() {
		0
	} else {
		crc32(suffix.as_bytes())
	}
}

/// Replace the suffix-hash half of a file id
pub fn file_id_with_suffix(file_id: FileId, suffix: &str) -> FileId {
	(file_id & 0xffff_ffff) | ((suffix_hash(suffix) as u64) << 32)
}

impl TfsName {
	pub fn new(block_id: BlockId, file_id: FileId, suffix: Option<&str>) -> Self {
		Self {
			block_id,
			file_id,
			suffix_hash: suffix.map(suffix_hash).unwrap_or((file_id >> 32) as u32),
			large: false,
		}
	}

	fn check_byte(raw: &[u8]) -> u8 {
		raw[1..17].iter().fold(0u8, |acc, b| acc ^ b)
	}

	pub fn encode(&self) -> String {
		let mut raw = [0u8; FILE_NAME_RAW_LEN];
		raw[0] = if self.large { LEAD_LARGE } else { LEAD_SMALL };
		raw[1..5].copy_from_slice(&self.block_id.to_be_bytes());
		raw[5..13].copy_from_slice(&self.file_id.to_be_bytes());
		raw[13..17].copy_from_slice(&self.suffix_hash.to_be_bytes());
		raw[17] = Self::check_byte(&raw);
		base64::encode_config(raw, base64::URL_SAFE_NO_PAD)
	}

	pub fn decode(name: &str) -> Result<Self, Error> {
		if name.len() != FILE_NAME_LEN {
			return Err(Error::Message(format!(
				"Invalid file name {}: expected {} characters",
				name, FILE_NAME_LEN
			)));
		}
		let raw = base64::decode_config(name, base64::URL_SAFE_NO_PAD)
			.map_err(|e| Error::Message(format!("Invalid file name {}: {}", name, e)))?;
		if raw.len() != FILE_NAME_RAW_LEN {
			return Err(Error::Message(format!("Invalid file name {}", name)));
		}
		let large = match raw[0] {
			LEAD_SMALL => false,
			LEAD_LARGE => true,
			_ => {
				return Err(Error::Message(format!(
					"Invalid file name {}: bad lead byte",
					name
				)))
			}
		};
		if raw[17] != Self::check_byte(&raw) {
			return Err(Error::Message(format!(
				"Invalid file name {}: bad check byte",
				name
			)));
		}
		let mut b4 = [0u8; 4];
		let mut b8 = [0u8; 8];
		b4.copy_from_slice(&raw[1..5]);
		let block_id = u32::from_be_bytes(b4);
		b8.copy_from_slice(&raw[5..13]);
		let file_id = u64::from_be_bytes(b8);
		b4.copy_from_slice(&raw[13..17]);
		let suffix_hash = u32::from_be_bytes(b4);
		Ok(Self {
			block_id,
			file_id,
			suffix_hash,
			large,
		})
	}
}

impl std::fmt::Display for TfsName {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.encode())
	}
}
