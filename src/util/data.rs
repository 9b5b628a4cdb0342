//! Module containing the core identifiers and shared record types

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};

/// Identifier of a logical block (the unit of replication and placement)
pub type BlockId = u32;

/// Identifier of a file within a logical block.
/// The low 32 bits are the per-block sequence number, the high 32 bits
/// carry the suffix hash for named files (0 for plain files).
pub type FileId = u64;

/// Identifier of a storage node: its IPv4 address and port packed together
pub type ServerId = u64;

/// Magic version number written into freshly created block headers
pub const BLOCK_VERSION_MAGIC_NUM: u32 = 2;

/// Pack an IPv4 socket address into a `ServerId`
pub fn pack_server_id(addr: SocketAddr) -> ServerId {
	let ip = match addr.ip() {
		IpAddr::V4(v4) => u32::from(v4),
		IpAddr::V6(v6) => match v6.to_ipv4() {
			Some(v4) => u32::from(v4),
			None => 0,
		},
	};
	((ip as u64) << 16) | addr.port() as u64
}

/// Recover the socket address from a packed `ServerId`
pub fn server_addr(id: ServerId) -> SocketAddr {
	let ip = Ipv4Addr::from((id >> 16) as u32);
	SocketAddr::new(IpAddr::V4(ip), (id & 0xffff) as u16)
}

/// Rack key of a server: nodes in the same /24 share a rack for placement
pub fn server_rack(id: ServerId) -> u32 {
	((id >> 16) as u32) & 0xffff_ff00
}

pub fn server_str(id: ServerId) -> String {
	server_addr(id).to_string()
}

/// CRC-32 of a byte slice (the only integrity check TFS uses)
pub fn crc32(data: &[u8]) -> u32 {
	let mut h = crc32fast::Hasher::new();
	h.update(data);
	h.finalize()
}

/// Continue a running CRC-32 with more bytes
pub fn crc32_append(crc: u32, data: &[u8]) -> u32 {
	let mut h = crc32fast::Hasher::new_with_initial(crc);
	h.update(data);
	h.finalize()
}

/// Smallest prime >= n, used to size index bucket arrays
pub fn next_prime(n: u32) -> u32 {
	fn is_prime(x: u32) -> bool {
		if x < 4 {
			return x >= 2;
		}
		if x % 2 == 0 {
			return false;
		}
		let mut d = 3;
		while d * d <= x {
			if x % d == 0 {
				return false;
			}
			d += 2;
		}
		true
	}
	let mut c = n.max(2);
	while !is_prime(c) {
		c += 1;
	}
	c
}

// ---- shared record types ----

/// Per-block counters, kept in the index header on disk and in the
/// coordinator's registry in memory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
	pub block_id: BlockId,
	/// Monotonic mutation counter, starts at `BLOCK_VERSION_MAGIC_NUM`
	pub version: u32,
	pub file_count: u32,
	/// Live bytes (record headers included)
	pub size: u32,
	pub del_file_count: u32,
	/// Dead bytes reclaimable by compaction
	pub del_size: u32,
	/// File id allocation counter
	pub seq_no: u32,
}

/// File status flag bits
pub const FI_DELETED: u32 = 1;
pub const FI_INVALID: u32 = 2;
pub const FI_CONCEAL: u32 = 4;

/// Per-file header fields as stored in front of each payload record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
	pub file_id: FileId,
	/// Offset of the record in the logical payload area
	pub offset: u32,
	/// Payload size in bytes
	pub size: u32,
	/// Record size (header + payload)
	pub usize: u32,
	pub modify_time: u32,
	pub create_time: u32,
	pub flag: u32,
	pub crc: u32,
}

impl FileInfo {
	pub fn is_deleted(&self) -> bool {
		self.flag & FI_DELETED != 0
	}
	pub fn is_invalid(&self) -> bool {
		self.flag & FI_INVALID != 0
	}
	pub fn is_concealed(&self) -> bool {
		self.flag & FI_CONCEAL != 0
	}
	/// A file is readable without the force option iff no flag bit is set
	pub fn is_readable(&self, force: bool) -> bool {
		if self.is_deleted() || self.is_invalid() {
			false
		} else {
			force || !self.is_concealed()
		}
	}
}

/// Argument of an unlink operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnlinkAction {
	Delete,
	Undelete,
	Conceal,
	Unconceal,
}

/// Minimal index entry shipped when a whole block is replicated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMeta {
	pub file_id: FileId,
	pub offset: u32,
	pub size: u32,
}
