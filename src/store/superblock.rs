//! The superblock (`fs_super`) of a formatted mount point: device tag,
//! geometry, and the allocated/error block bitmaps

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tfs_util::data::{crc32, BlockId, BLOCK_VERSION_MAGIC_NUM};
use tfs_util::error::Error;

use crate::{DIR_MODE, EXTEND_DIR, INDEX_DIR, SUPERBLOCK_NAME};

const DEV_TAG: &[u8] = b"TAOBAO";
const DEV_TAG_LEN: usize = 32;
const HEADER_LEN: usize = DEV_TAG_LEN + 7 * 4;

/// Simple persisted bitmap over physical block slots
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitMap {
	bits: Vec<u8>,
	len: u32,
}

impl BitMap {
	pub fn new(len: u32) -> Self {
		Self {
			bits: vec![0u8; ((len + 7) / 8) as usize],
			len,
		}
	}

	fn from_bytes(bytes: &[u8], len: u32) -> Self {
		Self {
			bits: bytes.to_vec(),
			len,
		}
	}

	pub fn byte_len(len: u32) -> usize {
		((len + 7) / 8) as usize
	}

	pub fn test(&self, slot: u32) -> bool {
		slot < self.len && self.bits[(slot / 8) as usize] & (1 << (slot % 8)) != 0
	}

	pub fn set(&mut self, slot: u32) {
		if slot < self.len {
			self.bits[(slot / 8) as usize] |= 1 << (slot % 8);
		}
	}

	pub fn clear(&mut self, slot: u32) {
		if slot < self.len {
			self.bits[(slot / 8) as usize] &= !(1 << (slot % 8));
		}
	}

	/// First clear slot in [0, len)
	pub fn first_clear(&self) -> Option<u32> {
		(0..self.len).find(|s| !self.test(*s))
	}

	pub fn count_set(&self) -> u32 {
		(0..self.len).filter(|s| self.test(*s)).count() as u32
	}

	pub fn clear_all(&mut self) {
		for b in self.bits.iter_mut() {
			*b = 0;
		}
	}
}

/// Geometry and allocation state of one formatted data directory.
///
/// Physical block ids are 1-based: ids `1..=main_block_count` are main
/// blocks living directly under the mount point, ids
/// `main_block_count+1..` are extension blocks under `extend/`.
#[derive(Debug)]
pub struct Superblock {
	root: PathBuf,
	pub main_block_size: u32,
	pub ext_block_size: u32,
	pub main_block_count: u32,
	pub ext_block_count: u32,
	pub bucket_count: u32,
	/// Allocation bitmap over all physical slots (mains then extensions)
	pub allocated: BitMap,
	/// Blocks observed failing CRC or IO; reported to the coordinator
	pub error: BitMap,
}

impl Superblock {
	fn slot_count(main: u32, ext: u32) -> u32 {
		main + ext
	}

	pub fn path(root: &Path) -> PathBuf {
		root.join(SUPERBLOCK_NAME)
	}

	pub fn main_path(&self, physic_id: u32) -> PathBuf {
		self.root.join(format!("{}", physic_id))
	}

	pub fn ext_path(&self, physic_id: u32) -> PathBuf {
		self.root.join(EXTEND_DIR).join(format!("{}", physic_id))
	}

	pub fn index_path(&self, block_id: BlockId) -> PathBuf {
		self.root.join(INDEX_DIR).join(format!("{}", block_id))
	}

	pub fn index_dir(&self) -> PathBuf {
		self.root.join(INDEX_DIR)
	}

	pub fn is_main(&self, physic_id: u32) -> bool {
		physic_id >= 1 && physic_id <= self.main_block_count
	}

	pub fn physic_path(&self, physic_id: u32) -> PathBuf {
		if self.is_main(physic_id) {
			self.main_path(physic_id)
		} else {
			self.ext_path(physic_id)
		}
	}

	pub fn physic_size(&self, physic_id: u32) -> u32 {
		if self.is_main(physic_id) {
			self.main_block_size
		} else {
			self.ext_block_size
		}
	}

	/// Format a mount point: directory tree, superblock, and all
	/// preallocated block files
	pub fn format(
		root: &Path,
		main_block_size: u32,
		ext_block_size: u32,
		main_block_count: u32,
		ext_block_count: u32,
		bucket_count: u32,
	) -> Result<Superblock, Error> {
		for dir in [root.to_path_buf(), root.join(EXTEND_DIR), root.join(INDEX_DIR)].iter() {
			fs::create_dir_all(dir)?;
			fs::set_permissions(dir, fs::Permissions::from_mode(DIR_MODE))?;
		}

		let sb = Superblock {
			root: root.to_path_buf(),
			main_block_size,
			ext_block_size,
			main_block_count,
			ext_block_count,
			bucket_count,
			allocated: BitMap::new(Self::slot_count(main_block_count, ext_block_count)),
			error: BitMap::new(Self::slot_count(main_block_count, ext_block_count)),
		};

		for id in 1..=main_block_count {
			let f = fs::File::create(sb.main_path(id))?;
			f.set_len(main_block_size as u64)?;
		}
		for id in (main_block_count + 1)..=(main_block_count + ext_block_count) {
			let f = fs::File::create(sb.ext_path(id))?;
			f.set_len(ext_block_size as u64)?;
		}

		sb.persist()?;
		info!(
			"Formatted {} with {} main blocks of {} bytes, {} extension blocks of {} bytes",
			root.display(),
			main_block_count,
			main_block_size,
			ext_block_count,
			ext_block_size
		);
		Ok(sb)
	}

	pub fn load(root: &Path) -> Result<Superblock, Error> {
		let mut file = fs::File::open(Self::path(root))?;
		let mut header = [0u8; HEADER_LEN];
		file.read_exact(&mut header)?;

		if &header[0..DEV_TAG.len()] != DEV_TAG {
			return Err(Error::CorruptData(format!(
				"{}: bad device tag",
				root.display()
			)));
		}
		let word = |i: usize| {
			let mut b = [0u8; 4];
			b.copy_from_slice(&header[DEV_TAG_LEN + i * 4..DEV_TAG_LEN + i * 4 + 4]);
			u32::from_le_bytes(b)
		};
		if word(0) != BLOCK_VERSION_MAGIC_NUM {
			return Err(Error::CorruptData(format!(
				"{}: unsupported superblock version {}",
				root.display(),
				word(0)
			)));
		}
		let stored_crc = word(6);
		let computed = crc32(&header[0..HEADER_LEN - 4]);
		if stored_crc != computed {
			return Err(Error::CrcError {
				stored: stored_crc,
				computed,
			});
		}

		let main_block_size = word(1);
		let ext_block_size = word(2);
		let main_block_count = word(3);
		let ext_block_count = word(4);
		let bucket_count = word(5);

		let slots = Self::slot_count(main_block_count, ext_block_count);
		let mut bits = vec![0u8; 2 * BitMap::byte_len(slots)];
		file.read_exact(&mut bits)?;
		let half = BitMap::byte_len(slots);

		Ok(Superblock {
			root: root.to_path_buf(),
			main_block_size,
			ext_block_size,
			main_block_count,
			ext_block_count,
			bucket_count,
			allocated: BitMap::from_bytes(&bits[..half], slots),
			error: BitMap::from_bytes(&bits[half..], slots),
		})
	}

	pub fn persist(&self) -> Result<(), Error> {
		let mut header = [0u8; HEADER_LEN];
		header[0..DEV_TAG.len()].copy_from_slice(DEV_TAG);
		let mut put = |i: usize, v: u32| {
			header[DEV_TAG_LEN + i * 4..DEV_TAG_LEN + i * 4 + 4].copy_from_slice(&v.to_le_bytes());
		};
		put(0, BLOCK_VERSION_MAGIC_NUM);
		put(1, self.main_block_size);
		put(2, self.ext_block_size);
		put(3, self.main_block_count);
		put(4, self.ext_block_count);
		put(5, self.bucket_count);
		let crc = crc32(&header[0..HEADER_LEN - 4]);
		header[HEADER_LEN - 4..].copy_from_slice(&crc.to_le_bytes());

		let mut file = fs::OpenOptions::new()
			.write(true)
			.create(true)
			.open(Self::path(&self.root))?;
		file.seek(SeekFrom::Start(0))?;
		file.write_all(&header)?;
		file.write_all(&self.allocated.bits)?;
		file.write_all(&self.error.bits)?;
		file.sync_data()?;
		Ok(())
	}

	/// Allocate a free main slot (for block creation or compaction)
	pub fn alloc_main(&mut self) -> Result<u32, Error> {
		for id in 1..=self.main_block_count {
			if !self.allocated.test(id - 1) {
				self.allocated.set(id - 1);
				return Ok(id);
			}
		}
		Err(Error::CapacityExhausted("no free main block".into()))
	}

	/// Allocate a free extension slot
	pub fn alloc_ext(&mut self) -> Result<u32, Error> {
		for id in (self.main_block_count + 1)..=(self.main_block_count + self.ext_block_count) {
			if !self.allocated.test(id - 1) {
				self.allocated.set(id - 1);
				return Ok(id);
			}
		}
		Err(Error::CapacityExhausted("no free extension block".into()))
	}

	pub fn free_slot(&mut self, physic_id: u32) {
		self.allocated.clear(physic_id - 1);
		self.error.clear(physic_id - 1);
	}

	pub fn mark_allocated(&mut self, physic_id: u32) {
		self.allocated.set(physic_id - 1);
	}

	pub fn mark_error(&mut self, physic_id: u32) {
		self.error.set(physic_id - 1);
	}

	pub fn is_error(&self, physic_id: u32) -> bool {
		self.error.test(physic_id - 1)
	}

	/// Total capacity of the mount point in bytes
	pub fn total_capacity(&self) -> u64 {
		self.main_block_count as u64 * self.main_block_size as u64
			+ self.ext_block_count as u64 * self.ext_block_size as u64
	}

	/// Bytes held by allocated slots
	pub fn used_capacity(&self) -> u64 {
		let mut used = 0u64;
		for id in 1..=(self.main_block_count + self.ext_block_count) {
			if self.allocated.test(id - 1) {
				used += self.physic_size(id) as u64;
			}
		}
		used
	}
}
