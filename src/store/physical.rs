//! A single preallocated physical block file: 12-byte chaining prefix
//! followed by the payload area

use std::fs;
use std::os::unix::fs::FileExt;
use std::path::Path;

use tfs_util::data::BlockId;
use tfs_util::error::Error;

pub const BLOCK_PREFIX_SIZE: u32 = 12;

/// Chaining prefix at offset 0 of every physical block file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockPrefix {
	pub logic_block_id: BlockId,
	pub prev_physic_block_id: u32,
	pub next_physic_block_id: u32,
}

impl BlockPrefix {
	pub fn to_bytes(&self) -> [u8; BLOCK_PREFIX_SIZE as usize] {
		let mut b = [0u8; BLOCK_PREFIX_SIZE as usize];
		b[0..4].copy_from_slice(&self.logic_block_id.to_le_bytes());
		b[4..8].copy_from_slice(&self.prev_physic_block_id.to_le_bytes());
		b[8..12].copy_from_slice(&self.next_physic_block_id.to_le_bytes());
		b
	}

	pub fn from_bytes(b: &[u8]) -> Self {
		let word = |i: usize| {
			let mut w = [0u8; 4];
			w.copy_from_slice(&b[i * 4..i * 4 + 4]);
			u32::from_le_bytes(w)
		};
		Self {
			logic_block_id: word(0),
			prev_physic_block_id: word(1),
			next_physic_block_id: word(2),
		}
	}
}

/// An open physical block file
pub struct PhysicalBlock {
	pub physic_id: u32,
	pub prefix: BlockPrefix,
	file: fs::File,
	/// Bytes available for records: file size minus the prefix
	pub payload_capacity: u32,
}

impl PhysicalBlock {
	pub fn open(path: &Path, physic_id: u32, size: u32) -> Result<Self, Error> {
		let file = fs::OpenOptions::new().read(true).write(true).open(path)?;
		let mut b = [0u8; BLOCK_PREFIX_SIZE as usize];
		file.read_exact_at(&mut b, 0)?;
		Ok(Self {
			physic_id,
			prefix: BlockPrefix::from_bytes(&b),
			file,
			payload_capacity: size - BLOCK_PREFIX_SIZE,
		})
	}

	/// Stamp an unused slot with its chain position
	pub fn assign(
		path: &Path,
		physic_id: u32,
		size: u32,
		logic_block_id: BlockId,
		prev: u32,
	) -> Result<Self, Error> {
		let mut block = Self::open(path, physic_id, size)?;
		block.prefix = BlockPrefix {
			logic_block_id,
			prev_physic_block_id: prev,
			next_physic_block_id: 0,
		};
		block.write_prefix()?;
		Ok(block)
	}

	pub fn write_prefix(&self) -> Result<(), Error> {
		self.file.write_all_at(&self.prefix.to_bytes(), 0)?;
		self.file.sync_data()?;
		Ok(())
	}

	pub fn set_next(&mut self, next: u32) -> Result<(), Error> {
		self.prefix.next_physic_block_id = next;
		self.write_prefix()
	}

	/// Unstamp a freed slot so a prefix scan cannot resurrect it
	pub fn release(&mut self) -> Result<(), Error> {
		self.prefix = BlockPrefix::default();
		self.write_prefix()
	}

	pub fn read_at(&self, local_offset: u32, buf: &mut [u8]) -> Result<(), Error> {
		debug_assert!(local_offset + buf.len() as u32 <= self.payload_capacity);
		self.file
			.read_exact_at(buf, (BLOCK_PREFIX_SIZE + local_offset) as u64)?;
		Ok(())
	}

	pub fn write_at(&self, local_offset: u32, buf: &[u8]) -> Result<(), Error> {
		debug_assert!(local_offset + buf.len() as u32 <= self.payload_capacity);
		self.file
			.write_all_at(buf, (BLOCK_PREFIX_SIZE + local_offset) as u64)?;
		Ok(())
	}

	pub fn sync(&self) -> Result<(), Error> {
		self.file.sync_data()?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_prefix_roundtrip() {
		let p = BlockPrefix {
			logic_block_id: 101,
			prev_physic_block_id: 3,
			next_physic_block_id: 9,
		};
		assert_eq!(BlockPrefix::from_bytes(&p.to_bytes()), p);
	}

	#[test]
	fn test_assign_open_rw() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let path = tmp.to_path_buf().join("1");
		let f = fs::File::create(&path).unwrap();
		f.set_len(4096).unwrap();
		drop(f);

		let blk = PhysicalBlock::assign(&path, 1, 4096, 55, 0).unwrap();
		blk.write_at(100, b"hello").unwrap();

		let blk2 = PhysicalBlock::open(&path, 1, 4096).unwrap();
		assert_eq!(blk2.prefix.logic_block_id, 55);
		assert_eq!(blk2.payload_capacity, 4096 - BLOCK_PREFIX_SIZE);
		let mut buf = [0u8; 5];
		blk2.read_at(100, &mut buf).unwrap();
		assert_eq!(&buf, b"hello");
	}
}
