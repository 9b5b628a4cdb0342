//! The per-block index file: block counters, hashed file lookup with
//! separate chaining, and a free-slot list for recycled entries

use std::fs;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use tfs_util::data::{crc32, BlockId, BlockInfo, FileId, RawMeta, BLOCK_VERSION_MAGIC_NUM};
use tfs_util::error::Error;

const INDEX_MAGIC: u32 = 0x5446_5349;
pub const INDEX_HEADER_SIZE: u32 = 64;
pub const META_SLOT_SIZE: u32 = 20;

/// Mutation state of a logical block, persisted in its index header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyFlag {
	Clean,
	Dirty,
	Compacting,
}

impl DirtyFlag {
	fn to_u32(self) -> u32 {
		match self {
			DirtyFlag::Clean => 0,
			DirtyFlag::Dirty => 1,
			DirtyFlag::Compacting => 2,
		}
	}
	fn from_u32(v: u32) -> Result<Self, Error> {
		match v {
			0 => Ok(DirtyFlag::Clean),
			1 => Ok(DirtyFlag::Dirty),
			2 => Ok(DirtyFlag::Compacting),
			x => Err(Error::CorruptData(format!("bad dirty flag {}", x))),
		}
	}
}

/// Header of an index file
#[derive(Debug, Clone, Copy)]
pub struct IndexHeader {
	pub info: BlockInfo,
	pub dirty_flag: DirtyFlag,
	pub bucket_count: u32,
	/// Append offset in the logical payload area
	pub data_end: u32,
	/// Head of the free-slot list (0 = empty)
	pub free_head: u32,
	/// Main physical block of the chain this index describes
	pub main_physic_id: u32,
	/// End-of-file offset where the next fresh slot goes
	pub index_end: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct MetaSlot {
	file_id: FileId,
	offset: u32,
	size: u32,
	next: u32,
}

impl MetaSlot {
	fn to_bytes(&self) -> [u8; META_SLOT_SIZE as usize] {
		let mut b = [0u8; META_SLOT_SIZE as usize];
		b[0..8].copy_from_slice(&self.file_id.to_le_bytes());
		b[8..12].copy_from_slice(&self.offset.to_le_bytes());
		b[12..16].copy_from_slice(&self.size.to_le_bytes());
		b[16..20].copy_from_slice(&self.next.to_le_bytes());
		b
	}
	fn from_bytes(b: &[u8]) -> Self {
		let mut b8 = [0u8; 8];
		b8.copy_from_slice(&b[0..8]);
		let word = |i: usize| {
			let mut w = [0u8; 4];
			w.copy_from_slice(&b[i..i + 4]);
			u32::from_le_bytes(w)
		};
		Self {
			file_id: u64::from_le_bytes(b8),
			offset: word(8),
			size: word(12),
			next: word(16),
		}
	}
}

/// An open index file. The bucket array is cached in memory and written
/// through; meta slots live on disk and are read on demand.
pub struct BlockIndex {
	path: PathBuf,
	file: fs::File,
	pub header: IndexHeader,
	buckets: Vec<u32>,
}

impl BlockIndex {
	fn buckets_offset() -> u32 {
		INDEX_HEADER_SIZE
	}

	fn slots_offset(bucket_count: u32) -> u32 {
		INDEX_HEADER_SIZE + 4 * bucket_count
	}

	/// Create a fresh, empty index for a newly created logical block
	pub fn create(
		path: &Path,
		block_id: BlockId,
		bucket_count: u32,
		main_physic_id: u32,
	) -> Result<Self, Error> {
		let header = IndexHeader {
			info: BlockInfo {
				block_id,
				version: BLOCK_VERSION_MAGIC_NUM,
				..Default::default()
			},
			dirty_flag: DirtyFlag::Clean,
			bucket_count,
			data_end: 0,
			free_head: 0,
			main_physic_id,
			index_end: Self::slots_offset(bucket_count),
		};
		let file = fs::OpenOptions::new()
			.read(true)
			.write(true)
			.create_new(true)
			.open(path)?;
		let mut index = Self {
			path: path.to_path_buf(),
			file,
			header,
			buckets: vec![0u32; bucket_count as usize],
		};
		index.save_header()?;
		index.save_buckets()?;
		index.file.sync_data()?;
		Ok(index)
	}

	/// Open an existing index, verifying its header before trusting it
	pub fn open(path: &Path) -> Result<Self, Error> {
		let file = fs::OpenOptions::new().read(true).write(true).open(path)?;
		let mut h = [0u8; INDEX_HEADER_SIZE as usize];
		file.read_exact_at(&mut h, 0)?;

		let word = |i: usize| {
			let mut w = [0u8; 4];
			w.copy_from_slice(&h[i * 4..i * 4 + 4]);
			u32::from_le_bytes(w)
		};
		if word(0) != INDEX_MAGIC {
			return Err(Error::CorruptData(format!(
				"{}: bad index magic",
				path.display()
			)));
		}
		let stored_crc = word(15);
		let computed = crc32(&h[0..(INDEX_HEADER_SIZE - 4) as usize]);
		if stored_crc != computed {
			return Err(Error::CrcError {
				stored: stored_crc,
				computed,
			});
		}

		let header = IndexHeader {
			info: BlockInfo {
				block_id: word(1),
				version: word(2),
				file_count: word(3),
				size: word(4),
				del_file_count: word(5),
				del_size: word(6),
				seq_no: word(7),
			},
			dirty_flag: DirtyFlag::from_u32(word(8))?,
			bucket_count: word(9),
			data_end: word(10),
			free_head: word(11),
			main_physic_id: word(12),
			index_end: word(13),
		};
		if header.bucket_count == 0 {
			return Err(Error::CorruptData(format!(
				"{}: zero bucket count",
				path.display()
			)));
		}
		let file_len = file.metadata()?.len();
		if file_len < header.index_end as u64 {
			return Err(Error::CorruptData(format!(
				"{}: truncated index ({} < {})",
				path.display(),
				file_len,
				header.index_end
			)));
		}

		let mut bucket_bytes = vec![0u8; 4 * header.bucket_count as usize];
		file.read_exact_at(&mut bucket_bytes, Self::buckets_offset() as u64)?;
		let buckets = bucket_bytes
			.chunks_exact(4)
			.map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
			.collect();

		Ok(Self {
			path: path.to_path_buf(),
			file,
			header,
			buckets,
		})
	}

	/// Build a fresh index holding the given entries, used when a block is
	/// compacted, received from a peer, or recovered from a payload scan
	pub fn build(
		path: &Path,
		bucket_count: u32,
		main_physic_id: u32,
		metas: &[RawMeta],
		info: BlockInfo,
		data_end: u32,
	) -> Result<Self, Error> {
		if path.exists() {
			fs::remove_file(path)?;
		}
		let mut index = Self::create(path, info.block_id, bucket_count, main_physic_id)?;
		index.header.info = info;
		index.header.data_end = data_end;
		for m in metas {
			index.insert_or_replace(m.file_id, m.offset, m.size)?;
		}
		// insert_or_replace persists as it goes; settle the counters last
		index.header.info = info;
		index.header.data_end = data_end;
		index.save_header()?;
		index.file.sync_data()?;
		Ok(index)
	}

	pub fn save_header(&mut self) -> Result<(), Error> {
		let mut h = [0u8; INDEX_HEADER_SIZE as usize];
		let mut put = |i: usize, v: u32| {
			h[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
		};
		put(0, INDEX_MAGIC);
		put(1, self.header.info.block_id);
		put(2, self.header.info.version);
		put(3, self.header.info.file_count);
		put(4, self.header.info.size);
		put(5, self.header.info.del_file_count);
		put(6, self.header.info.del_size);
		put(7, self.header.info.seq_no);
		put(8, self.header.dirty_flag.to_u32());
		put(9, self.header.bucket_count);
		put(10, self.header.data_end);
		put(11, self.header.free_head);
		put(12, self.header.main_physic_id);
		put(13, self.header.index_end);
		let crc = crc32(&h[0..(INDEX_HEADER_SIZE - 4) as usize]);
		h[(INDEX_HEADER_SIZE - 4) as usize..].copy_from_slice(&crc.to_le_bytes());
		self.file.write_all_at(&h, 0)?;
		Ok(())
	}

	fn save_buckets(&self) -> Result<(), Error> {
		let mut bytes = Vec::with_capacity(4 * self.buckets.len());
		for b in self.buckets.iter() {
			bytes.extend_from_slice(&b.to_le_bytes());
		}
		self.file
			.write_all_at(&bytes, Self::buckets_offset() as u64)?;
		Ok(())
	}

	fn save_bucket(&self, idx: usize) -> Result<(), Error> {
		self.file.write_all_at(
			&self.buckets[idx].to_le_bytes(),
			(Self::buckets_offset() + 4 * idx as u32) as u64,
		)?;
		Ok(())
	}

	fn read_slot(&self, off: u32) -> Result<MetaSlot, Error> {
		let mut b = [0u8; META_SLOT_SIZE as usize];
		self.file.read_exact_at(&mut b, off as u64)?;
		Ok(MetaSlot::from_bytes(&b))
	}

	fn write_slot(&self, off: u32, slot: &MetaSlot) -> Result<(), Error> {
		self.file.write_all_at(&slot.to_bytes(), off as u64)?;
		Ok(())
	}

	fn bucket_of(&self, file_id: FileId) -> usize {
		(file_id % self.header.bucket_count as u64) as usize
	}

	pub fn lookup(&self, file_id: FileId) -> Result<Option<RawMeta>, Error> {
		let mut off = self.buckets[self.bucket_of(file_id)];
		while off != 0 {
			let slot = self.read_slot(off)?;
			if slot.file_id == file_id {
				return Ok(Some(RawMeta {
					file_id,
					offset: slot.offset,
					size: slot.size,
				}));
			}
			off = slot.next;
		}
		Ok(None)
	}

	/// Insert a new entry, or repoint an existing one in place.
	/// Returns the previous entry on replacement.
	pub fn insert_or_replace(
		&mut self,
		file_id: FileId,
		offset: u32,
		size: u32,
	) -> Result<Option<RawMeta>, Error> {
		let bucket = self.bucket_of(file_id);
		let mut off = self.buckets[bucket];
		while off != 0 {
			let mut slot = self.read_slot(off)?;
			if slot.file_id == file_id {
				let old = RawMeta {
					file_id,
					offset: slot.offset,
					size: slot.size,
				};
				slot.offset = offset;
				slot.size = size;
				self.write_slot(off, &slot)?;
				return Ok(Some(old));
			}
			off = slot.next;
		}

		// new entry: pop the free list, or grow the file
		let slot_off = if self.header.free_head != 0 {
			let free = self.header.free_head;
			self.header.free_head = self.read_slot(free)?.next;
			free
		} else {
			let off = self.header.index_end;
			self.header.index_end += META_SLOT_SIZE;
			off
		};
		self.write_slot(
			slot_off,
			&MetaSlot {
				file_id,
				offset,
				size,
				next: self.buckets[bucket],
			},
		)?;
		self.buckets[bucket] = slot_off;
		self.save_bucket(bucket)?;
		self.save_header()?;
		Ok(None)
	}

	/// Unlink an entry from its chain and recycle its slot
	pub fn remove(&mut self, file_id: FileId) -> Result<Option<RawMeta>, Error> {
		let bucket = self.bucket_of(file_id);
		let mut prev: Option<u32> = None;
		let mut off = self.buckets[bucket];
		while off != 0 {
			let slot = self.read_slot(off)?;
			if slot.file_id == file_id {
				match prev {
					None => {
						self.buckets[bucket] = slot.next;
						self.save_bucket(bucket)?;
					}
					Some(p) => {
						let mut pslot = self.read_slot(p)?;
						pslot.next = slot.next;
						self.write_slot(p, &pslot)?;
					}
				}
				self.write_slot(
					off,
					&MetaSlot {
						file_id: 0,
						offset: 0,
						size: 0,
						next: self.header.free_head,
					},
				)?;
				self.header.free_head = off;
				self.save_header()?;
				return Ok(Some(RawMeta {
					file_id,
					offset: slot.offset,
					size: slot.size,
				}));
			}
			prev = Some(off);
			off = slot.next;
		}
		Ok(None)
	}

	/// All live entries, in bucket order
	pub fn metas(&self) -> Result<Vec<RawMeta>, Error> {
		let mut out = Vec::with_capacity(self.header.info.file_count as usize);
		for bucket in 0..self.buckets.len() {
			let mut off = self.buckets[bucket];
			while off != 0 {
				let slot = self.read_slot(off)?;
				out.push(RawMeta {
					file_id: slot.file_id,
					offset: slot.offset,
					size: slot.size,
				});
				off = slot.next;
			}
		}
		Ok(out)
	}

	pub fn sync(&self) -> Result<(), Error> {
		self.file.sync_data()?;
		Ok(())
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// Count of slots currently on the free list
	pub fn free_slots(&self) -> Result<usize, Error> {
		let mut n = 0;
		let mut off = self.header.free_head;
		while off != 0 {
			n += 1;
			off = self.read_slot(off)?.next;
		}
		Ok(n)
	}
}
