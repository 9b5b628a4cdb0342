//! A logical block: a chain of physical blocks plus its index, and the
//! whole file lifecycle inside it

use tfs_util::data::*;
use tfs_util::error::Error;
use tfs_util::time::now_sec;

use crate::index::{BlockIndex, DirtyFlag};
use crate::physical::PhysicalBlock;
use crate::MAX_COMPACT_READ_SIZE;

pub const FILE_INFO_SIZE: u32 = 36;

pub(crate) fn file_info_to_bytes(fi: &FileInfo) -> [u8; FILE_INFO_SIZE as usize] {
	let mut b = [0u8; FILE_INFO_SIZE as usize];
	b[0..8].copy_from_slice(&fi.file_id.to_le_bytes());
	b[8..12].copy_from_slice(&fi.offset.to_le_bytes());
	b[12..16].copy_from_slice(&fi.size.to_le_bytes());
	b[16..20].copy_from_slice(&fi.usize.to_le_bytes());
	b[20..24].copy_from_slice(&fi.modify_time.to_le_bytes());
	b[24..28].copy_from_slice(&fi.create_time.to_le_bytes());
	b[28..32].copy_from_slice(&fi.flag.to_le_bytes());
	b[32..36].copy_from_slice(&fi.crc.to_le_bytes());
	b
}

pub(crate) fn file_info_from_bytes(b: &[u8]) -> FileInfo {
	let mut b8 = [0u8; 8];
	b8.copy_from_slice(&b[0..8]);
	let word = |i: usize| {
		let mut w = [0u8; 4];
		w.copy_from_slice(&b[i..i + 4]);
		u32::from_le_bytes(w)
	};
	FileInfo {
		file_id: u64::from_le_bytes(b8),
		offset: word(8),
		size: word(12),
		usize: word(16),
		modify_time: word(20),
		create_time: word(24),
		flag: word(28),
		crc: word(32),
	}
}

/// Allocator handed down by the store: gives out a stamped physical
/// block (main or extension) chained after `prev`
pub(crate) type PhysicAlloc<'a> =
	dyn FnMut(bool, u32) -> Result<PhysicalBlock, Error> + 'a;

pub struct LogicBlock {
	pub block_id: BlockId,
	chain: Vec<PhysicalBlock>,
	pub index: BlockIndex,
}

impl LogicBlock {
	pub fn new(block_id: BlockId, chain: Vec<PhysicalBlock>, index: BlockIndex) -> Self {
		Self {
			block_id,
			chain,
			index,
		}
	}

	pub fn info(&self) -> BlockInfo {
		self.index.header.info
	}

	pub fn physic_ids(&self) -> Vec<u32> {
		self.chain.iter().map(|p| p.physic_id).collect()
	}

	pub fn is_compacting(&self) -> bool {
		self.index.header.dirty_flag == DirtyFlag::Compacting
	}

	fn chain_capacity(&self) -> u32 {
		self.chain.iter().map(|p| p.payload_capacity).sum()
	}

	/// Map a range of the logical payload area onto the chain
	fn segments(&self, mut offset: u32, mut len: u32) -> Vec<(usize, u32, u32)> {
		let mut out = vec![];
		for (i, p) in self.chain.iter().enumerate() {
			if len == 0 {
				break;
			}
			if offset >= p.payload_capacity {
				offset -= p.payload_capacity;
				continue;
			}
			let n = len.min(p.payload_capacity - offset);
			out.push((i, offset, n));
			offset = 0;
			len -= n;
		}
		out
	}

	fn read_payload(&self, offset: u32, buf: &mut [u8]) -> Result<(), Error> {
		let mut cursor = 0usize;
		for (i, local, n) in self.segments(offset, buf.len() as u32) {
			self.chain[i].read_at(local, &mut buf[cursor..cursor + n as usize])?;
			cursor += n as usize;
		}
		if cursor != buf.len() {
			return Err(Error::Message(format!(
				"block {}: read past end of chain at offset {}",
				self.block_id, offset
			)));
		}
		Ok(())
	}

	fn write_payload(&self, offset: u32, buf: &[u8]) -> Result<(), Error> {
		let mut cursor = 0usize;
		for (i, local, n) in self.segments(offset, buf.len() as u32) {
			self.chain[i].write_at(local, &buf[cursor..cursor + n as usize])?;
			cursor += n as usize;
		}
		if cursor != buf.len() {
			return Err(Error::Message(format!(
				"block {}: write past end of chain at offset {}",
				self.block_id, offset
			)));
		}
		Ok(())
	}

	/// Grow the chain with extension blocks until `need` payload bytes fit
	fn ensure_capacity(&mut self, need: u32, alloc: &mut PhysicAlloc) -> Result<(), Error> {
		while self.chain_capacity() < need {
			let prev_id = self.chain.last().map(|p| p.physic_id).unwrap_or(0);
			let ext = alloc(false, prev_id)?;
			if let Some(last) = self.chain.last_mut() {
				last.set_next(ext.physic_id)?;
			}
			debug!(
				"block {}: chained extension block {} after {}",
				self.block_id, ext.physic_id, prev_id
			);
			self.chain.push(ext);
		}
		Ok(())
	}

	fn read_file_info(&self, meta: &RawMeta) -> Result<FileInfo, Error> {
		let mut hdr = [0u8; FILE_INFO_SIZE as usize];
		self.read_payload(meta.offset, &mut hdr)?;
		let fi = file_info_from_bytes(&hdr);
		if fi.file_id != meta.file_id {
			return Err(Error::CorruptData(format!(
				"block {}: index entry for file {:#x} points at record of file {:#x}",
				self.block_id, meta.file_id, fi.file_id
			)));
		}
		Ok(fi)
	}

	fn write_file_info(&self, meta: &RawMeta, fi: &FileInfo) -> Result<(), Error> {
		self.write_payload(meta.offset, &file_info_to_bytes(fi))
	}

	fn lookup(&self, file_id: FileId) -> Result<RawMeta, Error> {
		self.index.lookup(file_id)?.ok_or_else(|| {
			Error::NotFound(format!(
				"file {:#x} in block {}",
				file_id, self.block_id
			))
		})
	}

	/// Bump the allocation counter and return a fresh file id
	pub fn alloc_file_id(&mut self) -> Result<FileId, Error> {
		self.index.header.info.seq_no += 1;
		let fid = self.index.header.info.seq_no as FileId;
		self.index.save_header()?;
		Ok(fid)
	}

	/// Append a file record. `file_id == 0` allocates a fresh id.
	/// Returns the id and the payload CRC.
	pub fn write(
		&mut self,
		file_id: FileId,
		data: &[u8],
		alloc: &mut PhysicAlloc,
	) -> Result<(FileId, u32), Error> {
		if self.is_compacting() {
			return Err(Error::Busy(format!(
				"block {} is being compacted",
				self.block_id
			)));
		}

		let file_id = if file_id == 0 {
			self.alloc_file_id()?
		} else {
			// keep the allocator ahead of explicitly named ids
			let low = (file_id & 0xffff_ffff) as u32;
			if low > self.index.header.info.seq_no {
				self.index.header.info.seq_no = low;
			}
			file_id
		};

		// the flags of a record being replaced decide its accounting below
		let old_flags = match self.index.lookup(file_id)? {
			Some(m) => Some(self.read_file_info(&m)?.flag),
			None => None,
		};

		let offset = self.index.header.data_end;
		let rec_size = FILE_INFO_SIZE + data.len() as u32;
		self.ensure_capacity(offset + rec_size, alloc)?;

		let now = now_sec();
		let crc = crc32(data);
		let fi = FileInfo {
			file_id,
			offset,
			size: data.len() as u32,
			usize: rec_size,
			modify_time: now,
			create_time: now,
			flag: 0,
			crc,
		};

		let mut rec = Vec::with_capacity(rec_size as usize);
		rec.extend_from_slice(&file_info_to_bytes(&fi));
		rec.extend_from_slice(data);
		self.write_payload(offset, &rec)?;
		for (i, _, _) in self.segments(offset, rec_size) {
			self.chain[i].sync()?;
		}

		let old = self.index.insert_or_replace(file_id, offset, rec_size)?;
		let info = &mut self.index.header.info;
		match (old, old_flags) {
			(Some(old_meta), Some(flags)) if flags & (FI_DELETED | FI_INVALID) == 0 => {
				// a live record was replaced: its bytes become dead space
				info.size = info.size - old_meta.size + rec_size;
				info.del_size += old_meta.size;
			}
			(Some(_), _) => {
				// the old record was already counted as dead
				info.file_count += 1;
				info.size += rec_size;
			}
			(None, _) => {
				info.file_count += 1;
				info.size += rec_size;
			}
		}
		info.version += 1;
		self.index.header.data_end = offset + rec_size;
		self.index.header.dirty_flag = DirtyFlag::Dirty;
		self.index.save_header()?;

		Ok((file_id, crc))
	}

	/// Read `len` payload bytes starting at `offset` within the file
	pub fn read(
		&self,
		file_id: FileId,
		offset: u32,
		len: u32,
		force: bool,
	) -> Result<Vec<u8>, Error> {
		let meta = self.lookup(file_id)?;
		let fi = self.read_file_info(&meta)?;
		self.check_readable(&fi, force)?;
		if offset > fi.size {
			return Err(Error::Message(format!(
				"read at offset {} beyond end of file ({} bytes)",
				offset, fi.size
			)));
		}
		let n = len.min(fi.size - offset);
		let mut buf = vec![0u8; n as usize];
		self.read_payload(meta.offset + FILE_INFO_SIZE + offset, &mut buf)?;

		// a whole-file read is the integrity checkpoint
		if offset == 0 && n == fi.size {
			let computed = crc32(&buf);
			if computed != fi.crc {
				return Err(Error::CrcError {
					stored: fi.crc,
					computed,
				});
			}
		}
		Ok(buf)
	}

	fn check_readable(&self, fi: &FileInfo, force: bool) -> Result<(), Error> {
		if fi.is_deleted() {
			Err(Error::NotFound(format!(
				"file {:#x} is deleted",
				fi.file_id
			)))
		} else if fi.is_invalid() {
			Err(Error::NotFound(format!(
				"file {:#x} is invalid",
				fi.file_id
			)))
		} else if fi.is_concealed() && !force {
			Err(Error::NotFound(format!(
				"file {:#x} is concealed",
				fi.file_id
			)))
		} else {
			Ok(())
		}
	}

	/// Header of a file; without `force`, flagged files read as absent
	pub fn stat(&self, file_id: FileId, force: bool) -> Result<FileInfo, Error> {
		let meta = self.lookup(file_id)?;
		let fi = self.read_file_info(&meta)?;
		if !force {
			self.check_readable(&fi, false)?;
		}
		Ok(fi)
	}

	/// Flip a file's status flag. Idempotent per action.
	/// Returns the file's payload size.
	pub fn unlink(&mut self, file_id: FileId, action: UnlinkAction) -> Result<u32, Error> {
		if self.is_compacting() {
			return Err(Error::Busy(format!(
				"block {} is being compacted",
				self.block_id
			)));
		}
		let meta = self.lookup(file_id)?;
		let mut fi = self.read_file_info(&meta)?;
		if fi.is_invalid() {
			return Err(Error::NotFound(format!(
				"file {:#x} is invalid",
				file_id
			)));
		}

		let info = &mut self.index.header.info;
		let changed = match action {
			UnlinkAction::Delete => {
				if fi.is_deleted() {
					false
				} else {
					fi.flag |= FI_DELETED;
					info.file_count -= 1;
					info.size -= fi.usize;
					info.del_file_count += 1;
					info.del_size += fi.usize;
					true
				}
			}
			UnlinkAction::Undelete => {
				if !fi.is_deleted() {
					false
				} else {
					fi.flag &= !FI_DELETED;
					info.file_count += 1;
					info.size += fi.usize;
					info.del_file_count -= 1;
					info.del_size -= fi.usize;
					true
				}
			}
			UnlinkAction::Conceal => {
				if fi.is_deleted() {
					return Err(Error::NotFound(format!(
						"file {:#x} is deleted",
						file_id
					)));
				}
				let was = fi.is_concealed();
				fi.flag |= FI_CONCEAL;
				!was
			}
			UnlinkAction::Unconceal => {
				let was = fi.is_concealed();
				fi.flag &= !FI_CONCEAL;
				was
			}
		};

		if changed {
			fi.modify_time = now_sec();
			self.write_file_info(&meta, &fi)?;
			self.index.header.info.version += 1;
			self.index.header.dirty_flag = DirtyFlag::Dirty;
			self.index.save_header()?;
		}
		Ok(fi.size)
	}

	/// Undo a committed write whose replication failed: the record is
	/// flagged invalid and its index slot recycled
	pub fn rollback(&mut self, file_id: FileId) -> Result<(), Error> {
		let meta = match self.index.lookup(file_id)? {
			Some(m) => m,
			None => return Ok(()),
		};
		let mut fi = self.read_file_info(&meta)?;
		fi.flag |= FI_INVALID;
		self.write_file_info(&meta, &fi)?;
		self.index.remove(file_id)?;

		let info = &mut self.index.header.info;
		info.file_count -= 1;
		info.size -= meta.size;
		info.del_size += meta.size;
		info.version += 1;
		self.index.header.dirty_flag = DirtyFlag::Dirty;
		self.index.save_header()?;
		Ok(())
	}

	/// Give a file a new id (suffix rename)
	pub fn rename(&mut self, file_id: FileId, new_file_id: FileId) -> Result<(), Error> {
		if self.index.lookup(new_file_id)?.is_some() {
			return Err(Error::AlreadyExists(format!(
				"file {:#x} in block {}",
				new_file_id, self.block_id
			)));
		}
		let meta = self.lookup(file_id)?;
		let mut fi = self.read_file_info(&meta)?;
		fi.file_id = new_file_id;
		fi.modify_time = now_sec();
		self.write_file_info(&meta, &fi)?;
		self.index.remove(file_id)?;
		self.index
			.insert_or_replace(new_file_id, meta.offset, meta.size)?;
		self.index.header.info.version += 1;
		self.index.header.dirty_flag = DirtyFlag::Dirty;
		self.index.save_header()?;
		Ok(())
	}

	/// Headers of all indexed files, in bucket order
	pub fn list(&self) -> Result<Vec<FileInfo>, Error> {
		let mut out = vec![];
		for meta in self.index.metas()? {
			out.push(self.read_file_info(&meta)?);
		}
		Ok(out)
	}

	// ---- raw transfer interface (replication) ----

	/// Read raw payload bytes for streaming to a replication target.
	/// Returns the bytes and whether the end of payload was reached.
	pub fn raw_read(&self, offset: u32, len: u32) -> Result<(Vec<u8>, bool), Error> {
		let end = self.index.header.data_end;
		if offset >= end {
			return Ok((vec![], true));
		}
		let n = len.min(end - offset);
		let mut buf = vec![0u8; n as usize];
		self.read_payload(offset, &mut buf)?;
		Ok((buf, offset + n == end))
	}

	/// Write raw payload bytes received from a replication source
	pub fn raw_write(
		&mut self,
		offset: u32,
		data: &[u8],
		alloc: &mut PhysicAlloc,
	) -> Result<(), Error> {
		self.ensure_capacity(offset + data.len() as u32, alloc)?;
		self.write_payload(offset, data)
	}

	/// Everything a replication target needs to rebuild the index
	pub fn export(&self) -> Result<(Vec<RawMeta>, BlockInfo, u32), Error> {
		Ok((
			self.index.metas()?,
			self.index.header.info,
			self.index.header.data_end,
		))
	}

	/// Read raw payload bounded by chain capacity rather than the indexed
	/// append offset; recovery scans use this when the index is gone
	pub fn raw_read_unchecked(&self, offset: u32, len: u32) -> Result<(Vec<u8>, bool), Error> {
		let capacity = self.chain_capacity();
		if offset >= capacity {
			return Ok((vec![], true));
		}
		let n = len.min(capacity - offset);
		let mut buf = vec![0u8; n as usize];
		self.read_payload(offset, &mut buf)?;
		Ok((buf, offset + n == capacity))
	}

	/// Unstamp every physical block of the chain (block deletion)
	pub fn release_chain(&mut self) -> Result<(), Error> {
		for p in self.chain.iter_mut() {
			p.release()?;
		}
		Ok(())
	}

	/// Atomically replace the index with one rebuilt from the given
	/// entries (final step of a replication transfer)
	pub fn install_index(
		&mut self,
		index_path: &std::path::Path,
		bucket_count: u32,
		metas: &[RawMeta],
		info: BlockInfo,
		data_end: u32,
	) -> Result<(), Error> {
		let tmp = index_path.with_extension("rebuild");
		let index = BlockIndex::build(
			&tmp,
			bucket_count,
			self.chain[0].physic_id,
			metas,
			info,
			data_end,
		)?;
		drop(index);
		std::fs::rename(&tmp, index_path)?;
		for p in self.chain.iter() {
			p.sync()?;
		}
		self.index = BlockIndex::open(index_path)?;
		Ok(())
	}

	/// Rewrite the block with only its live records, into freshly
	/// allocated physical blocks, and swap atomically. Returns the new
	/// counters and the old physical ids for the caller to free.
	pub fn compact(
		&mut self,
		bucket_count: u32,
		alloc: &mut PhysicAlloc,
	) -> Result<(BlockInfo, Vec<u32>), Error> {
		if self.is_compacting() {
			return Err(Error::Busy(format!(
				"block {} is already compacting",
				self.block_id
			)));
		}
		self.index.header.dirty_flag = DirtyFlag::Compacting;
		self.index.save_header()?;

		match self.compact_inner(bucket_count, alloc) {
			Ok(res) => Ok(res),
			Err(e) => {
				// leave the block addressable through its old index
				self.index.header.dirty_flag = DirtyFlag::Dirty;
				self.index.save_header()?;
				let tmp = self.index.path().with_extension("compact");
				let _ = std::fs::remove_file(tmp);
				Err(e)
			}
		}
	}

	fn compact_inner(
		&mut self,
		bucket_count: u32,
		alloc: &mut PhysicAlloc,
	) -> Result<(BlockInfo, Vec<u32>), Error> {
		let main = alloc(true, 0)?;
		let mut new_chain = vec![main];

		match self.compact_into(bucket_count, &mut new_chain, alloc) {
			Ok(res) => Ok(res),
			Err(e) => {
				// unstamp the abandoned copy so no recovery scan can
				// mistake it for the live chain
				for p in new_chain.iter_mut() {
					let _ = p.release();
				}
				Err(e)
			}
		}
	}

	fn compact_into(
		&mut self,
		bucket_count: u32,
		new_chain: &mut Vec<PhysicalBlock>,
		alloc: &mut PhysicAlloc,
	) -> Result<(BlockInfo, Vec<u32>), Error> {
		let old_info = self.index.header.info;
		let new_main_id = new_chain[0].physic_id;

		// live records, in index order
		let mut live = vec![];
		for meta in self.index.metas()? {
			let fi = self.read_file_info(&meta)?;
			if !fi.is_deleted() && !fi.is_invalid() {
				live.push(meta);
			}
		}

		let mut new_metas = Vec::with_capacity(live.len());
		let mut write_off = 0u32;

		for meta in live.iter() {
			// re-point the record header at its new home
			let mut hdr = [0u8; FILE_INFO_SIZE as usize];
			self.read_payload(meta.offset, &mut hdr)?;
			let mut fi = file_info_from_bytes(&hdr);
			fi.offset = write_off;

			ensure_chain_capacity(new_chain, write_off + meta.size, alloc)?;
			write_to_chain(new_chain, write_off, &file_info_to_bytes(&fi))?;

			// stream the payload within the copy budget
			let mut copied = FILE_INFO_SIZE;
			while copied < meta.size {
				let n = (meta.size - copied).min(MAX_COMPACT_READ_SIZE);
				let mut buf = vec![0u8; n as usize];
				self.read_payload(meta.offset + copied, &mut buf)?;
				write_to_chain(new_chain, write_off + copied, &buf)?;
				copied += n;
			}

			new_metas.push(RawMeta {
				file_id: meta.file_id,
				offset: write_off,
				size: meta.size,
			});
			write_off += meta.size;
		}

		for p in new_chain.iter() {
			p.sync()?;
		}

		let new_info = BlockInfo {
			block_id: self.block_id,
			version: old_info.version + 1,
			file_count: new_metas.len() as u32,
			size: write_off,
			del_file_count: 0,
			del_size: 0,
			seq_no: old_info.seq_no,
		};

		let final_path = self.index.path().to_path_buf();
		let tmp_path = final_path.with_extension("compact");
		BlockIndex::build(
			&tmp_path,
			bucket_count,
			new_main_id,
			&new_metas,
			new_info,
			write_off,
		)?;
		std::fs::rename(&tmp_path, &final_path)?;

		let old_ids = self.physic_ids();
		for p in self.chain.iter_mut() {
			p.release()?;
		}
		self.chain = std::mem::take(new_chain);
		self.index = BlockIndex::open(&final_path)?;

		info!(
			"Compacted block {}: {} files / {} bytes live, version {}",
			self.block_id, new_info.file_count, new_info.size, new_info.version
		);
		Ok((new_info, old_ids))
	}
}

fn chain_capacity(chain: &[PhysicalBlock]) -> u32 {
	chain.iter().map(|p| p.payload_capacity).sum()
}

fn ensure_chain_capacity(
	chain: &mut Vec<PhysicalBlock>,
	need: u32,
	alloc: &mut PhysicAlloc,
) -> Result<(), Error> {
	while chain_capacity(chain) < need {
		let prev_id = chain.last().map(|p| p.physic_id).unwrap_or(0);
		let ext = alloc(false, prev_id)?;
		if let Some(last) = chain.last_mut() {
			last.set_next(ext.physic_id)?;
		}
		chain.push(ext);
	}
	Ok(())
}

fn write_to_chain(chain: &[PhysicalBlock], mut offset: u32, buf: &[u8]) -> Result<(), Error> {
	let mut cursor = 0usize;
	let mut len = buf.len() as u32;
	for p in chain.iter() {
		if len == 0 {
			break;
		}
		if offset >= p.payload_capacity {
			offset -= p.payload_capacity;
			continue;
		}
		let n = len.min(p.payload_capacity - offset);
		p.write_at(offset, &buf[cursor..cursor + n as usize])?;
		cursor += n as usize;
		offset = 0;
		len -= n;
	}
	if len != 0 {
		return Err(Error::Message("write past end of chain".into()));
	}
	Ok(())
}
