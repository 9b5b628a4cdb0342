//! The block store facade: superblock plus the set of open logical
//! blocks, with per-block locking and physical slot allocation

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use tfs_util::config::DsConfig;
use tfs_util::data::*;
use tfs_util::error::Error;

use crate::block::{file_info_from_bytes, LogicBlock, FILE_INFO_SIZE};
use crate::index::BlockIndex;
use crate::physical::PhysicalBlock;
use crate::superblock::Superblock;

/// Capacity summary carried in heartbeats
#[derive(Debug, Clone, Copy, Default)]
pub struct FsStat {
	pub use_capacity: u64,
	pub total_capacity: u64,
	pub block_count: u32,
}

pub struct BlockStore {
	root: PathBuf,
	sb: Mutex<Superblock>,
	blocks: RwLock<HashMap<BlockId, Arc<Mutex<LogicBlock>>>>,
	/// Blocks whose on-disk state failed validation at open; they are
	/// reported to the coordinator and never served
	quarantined: Mutex<Vec<BlockId>>,
}

impl BlockStore {
	/// Format a mount point according to the dataserver configuration
	pub fn format(root: &Path, cfg: &DsConfig) -> Result<(), Error> {
		let bucket_count = next_prime(cfg.main_block_size / cfg.avg_file_size.max(1));
		Superblock::format(
			root,
			cfg.main_block_size,
			cfg.ext_block_size,
			cfg.main_block_count,
			cfg.ext_block_count,
			bucket_count,
		)?;
		Ok(())
	}

	/// Open a formatted mount point, validating every logical block and
	/// healing what can be healed
	pub fn open(root: &Path) -> Result<Self, Error> {
		let mut sb = Superblock::load(root)?;
		let mut blocks = HashMap::new();
		let mut quarantined = vec![];

		// stray temp indexes are leftovers of an interrupted compaction
		for entry in fs::read_dir(sb.index_dir())? {
			let path = entry?.path();
			if path.extension().map(|e| e == "compact").unwrap_or(false) {
				warn!("Removing stray compaction index {}", path.display());
				fs::remove_file(path)?;
			}
		}

		// the index directory is the source of truth for which logical
		// blocks exist
		let mut ids = vec![];
		for entry in fs::read_dir(sb.index_dir())? {
			let name = entry?.file_name();
			if let Some(id) = name.to_str().and_then(|s| s.parse::<BlockId>().ok()) {
				ids.push(id);
			}
		}
		ids.sort_unstable();

		for block_id in ids {
			match Self::load_block(&sb, block_id) {
				Ok(block) => {
					blocks.insert(block_id, Arc::new(Mutex::new(block)));
				}
				Err(e) => {
					warn!("Block {} failed validation ({}), rebuilding index", block_id, e);
					match Self::rebuild_block(&sb, block_id) {
						Ok(block) => {
							info!("Block {}: index rebuilt from payload scan", block_id);
							blocks.insert(block_id, Arc::new(Mutex::new(block)));
						}
						Err(e) => {
							error!("Block {} quarantined: {}", block_id, e);
							quarantined.push(block_id);
						}
					}
				}
			}
		}

		// the allocation bitmap follows from the reachable chains
		sb.allocated.clear_all();
		for block in blocks.values() {
			for pid in block.lock().unwrap().physic_ids() {
				sb.mark_allocated(pid);
			}
		}
		sb.persist()?;

		info!(
			"Opened block store at {} with {} blocks ({} quarantined)",
			root.display(),
			blocks.len(),
			quarantined.len()
		);
		Ok(Self {
			root: root.to_path_buf(),
			sb: Mutex::new(sb),
			blocks: RwLock::new(blocks),
			quarantined: Mutex::new(quarantined),
		})
	}

	fn load_block(sb: &Superblock, block_id: BlockId) -> Result<LogicBlock, Error> {
		let index = BlockIndex::open(&sb.index_path(block_id))?;
		let chain = Self::load_chain(sb, block_id, index.header.main_physic_id)?;
		Ok(LogicBlock::new(block_id, chain, index))
	}

	fn load_chain(
		sb: &Superblock,
		block_id: BlockId,
		main_physic_id: u32,
	) -> Result<Vec<PhysicalBlock>, Error> {
		let mut chain = vec![];
		let mut pid = main_physic_id;
		while pid != 0 {
			let block =
				PhysicalBlock::open(&sb.physic_path(pid), pid, sb.physic_size(pid))?;
			if block.prefix.logic_block_id != block_id {
				return Err(Error::CorruptData(format!(
					"physical block {} claims logical id {}, expected {}",
					pid, block.prefix.logic_block_id, block_id
				)));
			}
			if chain.len() > (sb.main_block_count + sb.ext_block_count) as usize {
				return Err(Error::CorruptData(format!(
					"block {}: chain cycle at physical block {}",
					block_id, pid
				)));
			}
			pid = block.prefix.next_physic_block_id;
			chain.push(block);
		}
		if chain.is_empty() {
			return Err(Error::CorruptData(format!("block {}: empty chain", block_id)));
		}
		Ok(chain)
	}

	/// Rebuild a block whose index is unusable by scanning its payload.
	/// Every record must pass its CRC check, otherwise the block is
	/// quarantined.
	fn rebuild_block(sb: &Superblock, block_id: BlockId) -> Result<LogicBlock, Error> {
		// find the main physical block by its chaining prefix
		let mut main_id = None;
		for pid in 1..=(sb.main_block_count + sb.ext_block_count) {
			let path = sb.physic_path(pid);
			if !path.exists() {
				continue;
			}
			let block = PhysicalBlock::open(&path, pid, sb.physic_size(pid))?;
			if block.prefix.logic_block_id == block_id
				&& block.prefix.prev_physic_block_id == 0
				&& sb.is_main(pid)
			{
				main_id = Some(pid);
				break;
			}
		}
		let main_id = main_id.ok_or_else(|| {
			Error::CorruptData(format!("block {}: no main physical block found", block_id))
		})?;
		let chain = Self::load_chain(sb, block_id, main_id)?;
		let scratch = LogicBlock::new(
			block_id,
			chain,
			// scan through a throwaway index; replaced below
			BlockIndex::build(
				&sb.index_path(block_id).with_extension("rebuild"),
				sb.bucket_count,
				main_id,
				&[],
				BlockInfo {
					block_id,
					..Default::default()
				},
				0,
			)?,
		);

		let capacity: u32 = scratch
			.physic_ids()
			.iter()
			.map(|pid| sb.physic_size(*pid) - crate::physical::BLOCK_PREFIX_SIZE)
			.sum();

		// walk records; the winner for each file id is the last record
		let mut winners: HashMap<FileId, FileInfo> = HashMap::new();
		let mut max_seq = 0u32;
		let mut data_end = 0u32;
		let mut offset = 0u32;
		loop {
			if offset + FILE_INFO_SIZE > capacity {
				break;
			}
			let (hdr_bytes, _) = scratch.raw_read_unchecked(offset, FILE_INFO_SIZE)?;
			if hdr_bytes.len() < FILE_INFO_SIZE as usize {
				break;
			}
			let fi = file_info_from_bytes(&hdr_bytes);
			// a record that does not parse cleanly marks the end of the
			// payload (or garbage: either way the scan stops here)
			let rec_size = match fi.size.checked_add(FILE_INFO_SIZE) {
				Some(r) => r,
				None => break,
			};
			if fi.file_id == 0
				|| fi.offset != offset
				|| fi.usize != rec_size
				|| offset.checked_add(rec_size).map(|e| e > capacity).unwrap_or(true)
			{
				break;
			}
			let (payload, _) = scratch.raw_read_unchecked(offset + FILE_INFO_SIZE, fi.size)?;
			if payload.len() != fi.size as usize {
				break;
			}
			let computed = crc32(&payload);
			if computed != fi.crc {
				return Err(Error::CrcError {
					stored: fi.crc,
					computed,
				});
			}
			max_seq = max_seq.max((fi.file_id & 0xffff_ffff) as u32);
			winners.insert(fi.file_id, fi);
			offset += fi.usize;
			data_end = offset;
		}

		let mut metas = vec![];
		let mut info = BlockInfo {
			block_id,
			version: BLOCK_VERSION_MAGIC_NUM,
			seq_no: max_seq,
			..Default::default()
		};
		for fi in winners.values() {
			if fi.is_invalid() {
				continue;
			}
			metas.push(RawMeta {
				file_id: fi.file_id,
				offset: fi.offset,
				size: fi.usize,
			});
			if fi.is_deleted() {
				info.del_file_count += 1;
				info.del_size += fi.usize;
			} else {
				info.file_count += 1;
				info.size += fi.usize;
			}
		}
		// bytes not owned by a winning record are dead space
		info.del_size = data_end - info.size;

		let rebuild_path = sb.index_path(block_id).with_extension("rebuild");
		let final_path = sb.index_path(block_id);
		let index = BlockIndex::build(
			&rebuild_path,
			sb.bucket_count,
			main_id,
			&metas,
			info,
			data_end,
		)?;
		drop(index);
		fs::rename(&rebuild_path, &final_path)?;

		Self::load_block(sb, block_id)
	}

	fn get_block(&self, block_id: BlockId) -> Result<Arc<Mutex<LogicBlock>>, Error> {
		self.blocks
			.read()
			.unwrap()
			.get(&block_id)
			.cloned()
			.ok_or_else(|| Error::NotFound(format!("block {}", block_id)))
	}

	fn alloc_physic(
		&self,
		block_id: BlockId,
		is_main: bool,
		prev: u32,
		log: &mut Vec<u32>,
	) -> Result<PhysicalBlock, Error> {
		let (pid, path, size) = {
			let mut sb = self.sb.lock().unwrap();
			let pid = if is_main {
				sb.alloc_main()?
			} else {
				sb.alloc_ext()?
			};
			sb.persist()?;
			(pid, sb.physic_path(pid), sb.physic_size(pid))
		};
		log.push(pid);
		PhysicalBlock::assign(&path, pid, size, block_id, prev)
	}

	fn free_physics(&self, pids: &[u32]) -> Result<(), Error> {
		let mut sb = self.sb.lock().unwrap();
		for pid in pids {
			sb.free_slot(*pid);
		}
		sb.persist()
	}

	// ---- public contract ----

	/// Allocate and initialize a new logical block
	pub fn create(&self, block_id: BlockId) -> Result<(), Error> {
		{
			let blocks = self.blocks.read().unwrap();
			if blocks.contains_key(&block_id) {
				return Err(Error::AlreadyExists(format!("block {}", block_id)));
			}
		}
		let (main_id, index_path, bucket_count, path, size) = {
			let mut sb = self.sb.lock().unwrap();
			let main_id = sb.alloc_main()?;
			sb.persist()?;
			(
				main_id,
				sb.index_path(block_id),
				sb.bucket_count,
				sb.physic_path(main_id),
				sb.physic_size(main_id),
			)
		};
		let cleanup = |this: &Self| {
			let _ = this.free_physics(&[main_id]);
		};
		if index_path.exists() {
			// garbage from a block that failed to register previously
			if let Err(e) = fs::remove_file(&index_path) {
				cleanup(self);
				return Err(e.into());
			}
		}
		let chain = match PhysicalBlock::assign(&path, main_id, size, block_id, 0) {
			Ok(b) => vec![b],
			Err(e) => {
				cleanup(self);
				return Err(e);
			}
		};
		let index = match BlockIndex::create(&index_path, block_id, bucket_count, main_id) {
			Ok(i) => i,
			Err(e) => {
				cleanup(self);
				return Err(e);
			}
		};
		let block = LogicBlock::new(block_id, chain, index);
		let mut blocks = self.blocks.write().unwrap();
		if blocks.contains_key(&block_id) {
			drop(blocks);
			let _ = fs::remove_file(&index_path);
			cleanup(self);
			return Err(Error::AlreadyExists(format!("block {}", block_id)));
		}
		blocks.insert(block_id, Arc::new(Mutex::new(block)));
		info!("Created block {} on physical slot {}", block_id, main_id);
		Ok(())
	}

	/// Append a file; `file_id == 0` allocates a fresh id.
	/// Returns the file id and payload CRC.
	pub fn write(
		&self,
		block_id: BlockId,
		file_id: FileId,
		data: &[u8],
	) -> Result<(FileId, u32), Error> {
		let handle = self.get_block(block_id)?;
		let mut allocated = vec![];
		let res = {
			let mut block = handle.lock().unwrap();
			block.write(file_id, data, &mut |is_main, prev| {
				self.alloc_physic(block_id, is_main, prev, &mut allocated)
			})
		};
		if res.is_err() && !allocated.is_empty() {
			let _ = self.free_physics(&allocated);
		}
		if let Err(Error::Io(_)) = &res {
			self.flag_error(block_id);
		}
		res
	}

	pub fn read(
		&self,
		block_id: BlockId,
		file_id: FileId,
		offset: u32,
		len: u32,
		force: bool,
	) -> Result<Vec<u8>, Error> {
		let handle = self.get_block(block_id)?;
		let res = {
			let block = handle.lock().unwrap();
			block.read(file_id, offset, len, force)
		};
		match &res {
			Err(Error::CrcError { .. }) | Err(Error::Io(_)) => self.flag_error(block_id),
			_ => (),
		}
		res
	}

	pub fn unlink(
		&self,
		block_id: BlockId,
		file_id: FileId,
		action: UnlinkAction,
	) -> Result<u32, Error> {
		let handle = self.get_block(block_id)?;
		let mut block = handle.lock().unwrap();
		block.unlink(file_id, action)
	}

	pub fn stat(
		&self,
		block_id: BlockId,
		file_id: FileId,
		force: bool,
	) -> Result<FileInfo, Error> {
		let handle = self.get_block(block_id)?;
		let block = handle.lock().unwrap();
		block.stat(file_id, force)
	}

	pub fn rollback(&self, block_id: BlockId, file_id: FileId) -> Result<(), Error> {
		let handle = self.get_block(block_id)?;
		let mut block = handle.lock().unwrap();
		block.rollback(file_id)
	}

	pub fn rename(
		&self,
		block_id: BlockId,
		file_id: FileId,
		new_file_id: FileId,
	) -> Result<(), Error> {
		let handle = self.get_block(block_id)?;
		let mut block = handle.lock().unwrap();
		block.rename(file_id, new_file_id)
	}

	pub fn list(&self, block_id: BlockId) -> Result<Vec<FileInfo>, Error> {
		let handle = self.get_block(block_id)?;
		let block = handle.lock().unwrap();
		block.list()
	}

	pub fn alloc_file_id(&self, block_id: BlockId) -> Result<FileId, Error> {
		let handle = self.get_block(block_id)?;
		let mut block = handle.lock().unwrap();
		block.alloc_file_id()
	}

	pub fn block_info(&self, block_id: BlockId) -> Result<BlockInfo, Error> {
		let handle = self.get_block(block_id)?;
		let block = handle.lock().unwrap();
		Ok(block.info())
	}

	/// Rewrite a block keeping only live records
	pub fn compact(&self, block_id: BlockId) -> Result<BlockInfo, Error> {
		let handle = self.get_block(block_id)?;
		let mut block = handle.lock().unwrap();
		let bucket_count = self.sb.lock().unwrap().bucket_count;
		let mut allocated = vec![];
		let res = block.compact(bucket_count, &mut |is_main, prev| {
			self.alloc_physic(block_id, is_main, prev, &mut allocated)
		});
		match res {
			Ok((info, old_ids)) => {
				self.free_physics(&old_ids)?;
				Ok(info)
			}
			Err(e) => {
				if !allocated.is_empty() {
					let _ = self.free_physics(&allocated);
				}
				Err(e)
			}
		}
	}

	/// Delete a logical block and free its physical slots
	pub fn remove(&self, block_id: BlockId) -> Result<(), Error> {
		let handle = {
			let mut blocks = self.blocks.write().unwrap();
			blocks.remove(&block_id)
		};
		let handle = match handle {
			Some(h) => h,
			None => {
				let mut quarantined = self.quarantined.lock().unwrap();
				if quarantined.contains(&block_id) {
					quarantined.retain(|b| *b != block_id);
					let index_path = self.sb.lock().unwrap().index_path(block_id);
					let _ = fs::remove_file(index_path);
					return Ok(());
				}
				return Err(Error::NotFound(format!("block {}", block_id)));
			}
		};
		let mut block = handle.lock().unwrap();
		let pids = block.physic_ids();
		block.release_chain()?;
		let index_path = self.sb.lock().unwrap().index_path(block_id);
		fs::remove_file(index_path)?;
		self.free_physics(&pids)?;
		info!("Removed block {} ({} physical slots freed)", block_id, pids.len());
		Ok(())
	}

	// ---- replication target interface ----

	/// Raw payload bytes for streaming to a replication target
	pub fn raw_read(
		&self,
		block_id: BlockId,
		offset: u32,
		len: u32,
	) -> Result<(Vec<u8>, bool), Error> {
		let handle = self.get_block(block_id)?;
		let block = handle.lock().unwrap();
		block.raw_read(offset, len)
	}

	/// Index entries and counters for the final replication message
	pub fn export(&self, block_id: BlockId) -> Result<(Vec<RawMeta>, BlockInfo, u32), Error> {
		let handle = self.get_block(block_id)?;
		let block = handle.lock().unwrap();
		block.export()
	}

	/// Raw payload bytes received from a replication source
	pub fn raw_write(&self, block_id: BlockId, offset: u32, data: &[u8]) -> Result<(), Error> {
		let handle = self.get_block(block_id)?;
		let mut block = handle.lock().unwrap();
		let mut allocated = vec![];
		let res = block.raw_write(offset, data, &mut |is_main, prev| {
			self.alloc_physic(block_id, is_main, prev, &mut allocated)
		});
		if res.is_err() && !allocated.is_empty() {
			let _ = self.free_physics(&allocated);
		}
		res
	}

	/// Install the index of a fully transferred replica
	pub fn commit_replica(
		&self,
		block_id: BlockId,
		metas: &[RawMeta],
		info: BlockInfo,
		data_len: u32,
	) -> Result<(), Error> {
		let handle = self.get_block(block_id)?;
		let mut block = handle.lock().unwrap();
		let (index_path, bucket_count) = {
			let sb = self.sb.lock().unwrap();
			(sb.index_path(block_id), sb.bucket_count)
		};
		block.install_index(&index_path, bucket_count, metas, info, data_len)?;
		info!(
			"Committed replica of block {}: {} files, version {}",
			block_id, info.file_count, info.version
		);
		Ok(())
	}

	// ---- reporting ----

	pub fn flag_error(&self, block_id: BlockId) {
		if let Ok(handle) = self.get_block(block_id) {
			let pids = handle.lock().unwrap().physic_ids();
			let mut sb = self.sb.lock().unwrap();
			for pid in pids {
				sb.mark_error(pid);
			}
			if let Err(e) = sb.persist() {
				error!("Could not persist error bitmap: {}", e);
			}
		}
		warn!("Block {} flagged as errored", block_id);
	}

	pub fn is_error(&self, block_id: BlockId) -> bool {
		if let Ok(handle) = self.get_block(block_id) {
			let pids = handle.lock().unwrap().physic_ids();
			let sb = self.sb.lock().unwrap();
			pids.iter().any(|pid| sb.is_error(*pid))
		} else {
			self.quarantined.lock().unwrap().contains(&block_id)
		}
	}

	/// One entry per logical block, for the full heartbeat report
	pub fn report(&self) -> Vec<(BlockInfo, bool)> {
		let blocks: Vec<_> = {
			let map = self.blocks.read().unwrap();
			map.iter().map(|(id, b)| (*id, b.clone())).collect()
		};
		let mut out = vec![];
		for (id, handle) in blocks {
			let info = handle.lock().unwrap().info();
			out.push((info, self.is_error(id)));
		}
		for id in self.quarantined.lock().unwrap().iter() {
			out.push((
				BlockInfo {
					block_id: *id,
					..Default::default()
				},
				true,
			));
		}
		out.sort_by_key(|(info, _)| info.block_id);
		out
	}

	pub fn block_ids(&self) -> Vec<BlockId> {
		let mut ids: Vec<_> = self.blocks.read().unwrap().keys().cloned().collect();
		ids.sort_unstable();
		ids
	}

	pub fn stat_fs(&self) -> FsStat {
		let sb = self.sb.lock().unwrap();
		FsStat {
			use_capacity: sb.used_capacity(),
			total_capacity: sb.total_capacity(),
			block_count: self.blocks.read().unwrap().len() as u32,
		}
	}

	pub fn root(&self) -> &Path {
		&self.root
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn test_config() -> DsConfig {
		DsConfig {
			main_block_size: 4096,
			ext_block_size: 1024,
			main_block_count: 4,
			ext_block_count: 4,
			avg_file_size: 64,
			..Default::default()
		}
	}

	fn new_store(dir: &Path) -> BlockStore {
		BlockStore::format(dir, &test_config()).unwrap();
		BlockStore::open(dir).unwrap()
	}

	fn check_accounting(store: &BlockStore, block_id: BlockId) {
		let info = store.block_info(block_id).unwrap();
		let handle = store.get_block(block_id).unwrap();
		let data_end = handle.lock().unwrap().index.header.data_end;
		assert_eq!(info.size + info.del_size, data_end);
	}

	#[test]
	fn test_write_read_stat() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let store = new_store(&tmp.to_path_buf());
		store.create(100).unwrap();

		let payload = vec![0x41u8; 512];
		let (fid, crc) = store.write(100, 0, &payload).unwrap();
		assert_eq!(fid, 1);
		assert_eq!(crc, crc32(&payload));

		assert_eq!(store.read(100, fid, 0, 512, false).unwrap(), payload);
		// partial reads
		assert_eq!(store.read(100, fid, 10, 20, false).unwrap(), vec![0x41u8; 20]);
		// read at end-of-file yields no bytes
		assert!(store.read(100, fid, 512, 8, false).unwrap().is_empty());
		assert!(store.read(100, fid, 513, 1, false).is_err());

		let fi = store.stat(100, fid, false).unwrap();
		assert_eq!(fi.size, 512);
		assert_eq!(fi.flag, 0);
		assert_eq!(fi.crc, crc);

		let info = store.block_info(100).unwrap();
		assert_eq!(info.file_count, 1);
		assert_eq!(info.version, BLOCK_VERSION_MAGIC_NUM + 1);
		check_accounting(&store, 100);
	}

	#[test]
	fn test_create_duplicate_and_missing() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let store = new_store(&tmp.to_path_buf());
		store.create(1).unwrap();
		assert!(matches!(store.create(1), Err(Error::AlreadyExists(_))));
		assert!(matches!(store.read(2, 1, 0, 1, false), Err(Error::NotFound(_))));
	}

	#[test]
	fn test_capacity_exhausted() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let store = new_store(&tmp.to_path_buf());
		for id in 1..=4 {
			store.create(id).unwrap();
		}
		assert!(matches!(
			store.create(5),
			Err(Error::CapacityExhausted(_))
		));
	}

	#[test]
	fn test_unlink_lifecycle() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let store = new_store(&tmp.to_path_buf());
		store.create(7).unwrap();
		let payload = b"hello block store".to_vec();
		let (fid, _) = store.write(7, 0, &payload).unwrap();
		let rec = FILE_INFO_SIZE + payload.len() as u32;

		store.unlink(7, fid, UnlinkAction::Delete).unwrap();
		assert!(matches!(
			store.read(7, fid, 0, 10, false),
			Err(Error::NotFound(_))
		));
		let info = store.block_info(7).unwrap();
		assert_eq!(info.file_count, 0);
		assert_eq!(info.del_file_count, 1);
		assert_eq!(info.del_size, rec);
		check_accounting(&store, 7);

		// deletion is idempotent: counted once
		store.unlink(7, fid, UnlinkAction::Delete).unwrap();
		let info2 = store.block_info(7).unwrap();
		assert_eq!(info2.del_file_count, 1);
		assert_eq!(info2.del_size, rec);

		// undelete restores read and accounting
		store.unlink(7, fid, UnlinkAction::Undelete).unwrap();
		assert_eq!(store.read(7, fid, 0, 1024, false).unwrap(), payload);
		let info3 = store.block_info(7).unwrap();
		assert_eq!(info3.file_count, 1);
		assert_eq!(info3.del_size, 0);
		check_accounting(&store, 7);
	}

	#[test]
	fn test_conceal_requires_force() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let store = new_store(&tmp.to_path_buf());
		store.create(7).unwrap();
		let (fid, _) = store.write(7, 0, b"secret").unwrap();

		store.unlink(7, fid, UnlinkAction::Conceal).unwrap();
		assert!(store.read(7, fid, 0, 10, false).is_err());
		assert_eq!(store.read(7, fid, 0, 10, true).unwrap(), b"secret");
		assert!(store.stat(7, fid, false).is_err());
		assert!(store.stat(7, fid, true).unwrap().is_concealed());

		store.unlink(7, fid, UnlinkAction::Unconceal).unwrap();
		assert_eq!(store.read(7, fid, 0, 10, false).unwrap(), b"secret");
	}

	#[test]
	fn test_update_replaces_in_place() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let store = new_store(&tmp.to_path_buf());
		store.create(3).unwrap();
		let (fid, _) = store.write(3, 0, b"version one").unwrap();
		let (fid2, _) = store.write(3, fid, b"version two!").unwrap();
		assert_eq!(fid, fid2);

		assert_eq!(store.read(3, fid, 0, 64, false).unwrap(), b"version two!");
		let info = store.block_info(3).unwrap();
		assert_eq!(info.file_count, 1);
		assert!(info.del_size > 0);
		check_accounting(&store, 3);
	}

	#[test]
	fn test_extension_chaining() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let store = new_store(&tmp.to_path_buf());
		store.create(9).unwrap();

		// payload spanning the main block tail into extensions
		let big = (0..5000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>();
		let (fid, _) = store.write(9, 0, &big).unwrap();
		let handle = store.get_block(9).unwrap();
		assert!(handle.lock().unwrap().physic_ids().len() > 1);
		drop(handle);

		assert_eq!(store.read(9, fid, 0, 5000, false).unwrap(), big);
		// a read crossing the physical boundary
		assert_eq!(
			store.read(9, fid, 4000, 100, false).unwrap(),
			big[4000..4100].to_vec()
		);
		check_accounting(&store, 9);
	}

	#[test]
	fn test_write_at_exact_capacity() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let store = new_store(&tmp.to_path_buf());
		store.create(9).unwrap();

		// fills the main block payload area exactly: no extension needed
		let exact = vec![7u8; (4096 - 12 - FILE_INFO_SIZE) as usize];
		let (fid, _) = store.write(9, 0, &exact).unwrap();
		let handle = store.get_block(9).unwrap();
		assert_eq!(handle.lock().unwrap().physic_ids().len(), 1);
		drop(handle);
		assert_eq!(store.read(9, fid, 0, exact.len() as u32, false).unwrap(), exact);

		// one more byte forces the chain to grow
		let (fid2, _) = store.write(9, 0, b"x").unwrap();
		let handle = store.get_block(9).unwrap();
		assert_eq!(handle.lock().unwrap().physic_ids().len(), 2);
		drop(handle);
		assert_eq!(store.read(9, fid2, 0, 1, false).unwrap(), b"x");
	}

	#[test]
	fn test_rollback_recycles_index_slot() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let store = new_store(&tmp.to_path_buf());
		store.create(5).unwrap();
		let (fid, _) = store.write(5, 0, b"doomed").unwrap();
		store.rollback(5, fid).unwrap();

		assert!(matches!(store.read(5, fid, 0, 6, false), Err(Error::NotFound(_))));
		let info = store.block_info(5).unwrap();
		assert_eq!(info.file_count, 0);
		check_accounting(&store, 5);

		let handle = store.get_block(5).unwrap();
		assert_eq!(handle.lock().unwrap().index.free_slots().unwrap(), 1);
	}

	#[test]
	fn test_compaction() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let store = new_store(&tmp.to_path_buf());
		store.create(11).unwrap();

		let mut fids = vec![];
		for i in 0..10u8 {
			let (fid, _) = store.write(11, 0, &[i; 20]).unwrap();
			fids.push(fid);
		}
		for fid in fids.iter().take(7) {
			store.unlink(11, *fid, UnlinkAction::Delete).unwrap();
		}
		let before = store.block_info(11).unwrap();
		assert_eq!(before.del_file_count, 7);

		let after = store.compact(11).unwrap();
		assert_eq!(after.file_count, 3);
		assert_eq!(after.del_file_count, 0);
		assert_eq!(after.del_size, 0);
		assert_eq!(after.version, before.version + 1);

		// survivors keep their bytes, victims are gone for good
		for (i, fid) in fids.iter().enumerate() {
			let res = store.read(11, *fid, 0, 20, false);
			if i < 7 {
				assert!(res.is_err());
			} else {
				assert_eq!(res.unwrap(), vec![i as u8; 20]);
			}
		}
		check_accounting(&store, 11);
	}

	#[test]
	fn test_compact_empty_block() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let store = new_store(&tmp.to_path_buf());
		store.create(2).unwrap();
		let info = store.compact(2).unwrap();
		assert_eq!(info.file_count, 0);
		assert_eq!(info.size, 0);
	}

	#[test]
	fn test_compact_preserves_live_triples() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let store = new_store(&tmp.to_path_buf());
		store.create(4).unwrap();
		let (a, crc_a) = store.write(4, 0, b"aaaa").unwrap();
		let (b, _) = store.write(4, 0, b"bbbb").unwrap();
		let (c, crc_c) = store.write(4, 0, b"cccc").unwrap();
		store.unlink(4, b, UnlinkAction::Delete).unwrap();

		store.compact(4).unwrap();
		let list = store.list(4).unwrap();
		let mut triples: Vec<_> = list.iter().map(|fi| (fi.file_id, fi.crc)).collect();
		triples.sort_unstable();
		assert_eq!(triples, vec![(a, crc_a), (c, crc_c)]);
	}

	#[test]
	fn test_remove_block_frees_slots() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let dir = tmp.to_path_buf();
		let store = new_store(&dir);
		for id in 1..=4 {
			store.create(id).unwrap();
		}
		store.remove(3).unwrap();
		assert!(store.block_info(3).is_err());
		// the freed slot is usable again
		store.create(5).unwrap();
		assert_eq!(store.block_ids(), vec![1, 2, 4, 5]);
	}

	#[test]
	fn test_reopen_preserves_state() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let dir = tmp.to_path_buf();
		let payload = b"persistent".to_vec();
		let fid;
		{
			let store = new_store(&dir);
			store.create(21).unwrap();
			fid = store.write(21, 0, &payload).unwrap().0;
		}
		let store = BlockStore::open(&dir).unwrap();
		assert_eq!(store.read(21, fid, 0, 64, false).unwrap(), payload);
		let info = store.block_info(21).unwrap();
		assert_eq!(info.file_count, 1);
	}

	#[test]
	fn test_reopen_rebuilds_corrupt_index() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let dir = tmp.to_path_buf();
		let fid_live;
		let fid_dead;
		{
			let store = new_store(&dir);
			store.create(21).unwrap();
			fid_live = store.write(21, 0, b"live data").unwrap().0;
			fid_dead = store.write(21, 0, b"dead data").unwrap().0;
			store.unlink(21, fid_dead, UnlinkAction::Delete).unwrap();
		}
		// trash the index header
		let index_path = dir.join(crate::INDEX_DIR).join("21");
		let mut bytes = fs::read(&index_path).unwrap();
		for b in bytes.iter_mut().take(16) {
			*b = 0xaa;
		}
		fs::write(&index_path, &bytes).unwrap();

		let store = BlockStore::open(&dir).unwrap();
		assert_eq!(store.read(21, fid_live, 0, 64, false).unwrap(), b"live data");
		assert!(store.read(21, fid_dead, 0, 64, false).is_err());
		let info = store.block_info(21).unwrap();
		assert_eq!(info.file_count, 1);
		assert_eq!(info.del_file_count, 1);
		assert!(store.report().iter().all(|(_, error)| !error));
	}

	#[test]
	fn test_reopen_quarantines_corrupt_payload() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let dir = tmp.to_path_buf();
		{
			let store = new_store(&dir);
			store.create(21).unwrap();
			store.write(21, 0, b"some payload bytes").unwrap();
		}
		// trash both the index and the payload: nothing left to trust
		let index_path = dir.join(crate::INDEX_DIR).join("21");
		let mut bytes = fs::read(&index_path).unwrap();
		for b in bytes.iter_mut().take(16) {
			*b = 0xaa;
		}
		fs::write(&index_path, &bytes).unwrap();
		let main_path = dir.join("1");
		let mut data = fs::read(&main_path).unwrap();
		// flip payload bytes after the record header
		for b in data[(12 + FILE_INFO_SIZE as usize)..(12 + FILE_INFO_SIZE as usize + 4)].iter_mut()
		{
			*b ^= 0xff;
		}
		fs::write(&main_path, &data).unwrap();

		let store = BlockStore::open(&dir).unwrap();
		assert!(store.block_info(21).is_err());
		let report = store.report();
		assert_eq!(report.len(), 1);
		assert!(report[0].1);
		assert_eq!(report[0].0.block_id, 21);
	}

	#[test]
	fn test_stray_compact_index_removed_on_open() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let dir = tmp.to_path_buf();
		{
			let store = new_store(&dir);
			store.create(13).unwrap();
			store.write(13, 0, b"kept").unwrap();
		}
		let stray = dir.join(crate::INDEX_DIR).join("13.compact");
		fs::write(&stray, b"half-written").unwrap();

		let store = BlockStore::open(&dir).unwrap();
		assert!(!stray.exists());
		assert_eq!(store.block_info(13).unwrap().file_count, 1);
	}

	#[test]
	fn test_crc_error_flags_block() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let dir = tmp.to_path_buf();
		let store = new_store(&dir);
		store.create(6).unwrap();
		let (fid, _) = store.write(6, 0, b"checksummed").unwrap();
		drop(store);

		// corrupt one payload byte on disk
		let main_path = dir.join("1");
		let mut data = fs::read(&main_path).unwrap();
		let off = 12 + FILE_INFO_SIZE as usize;
		data[off] ^= 0x01;
		fs::write(&main_path, &data).unwrap();

		let store = BlockStore::open(&dir).unwrap();
		assert!(matches!(
			store.read(6, fid, 0, 64, false),
			Err(Error::CrcError { .. })
		));
		let report = store.report();
		assert!(report.iter().any(|(info, error)| info.block_id == 6 && *error));
	}

	#[test]
	fn test_replication_transfer() {
		let tmp_src = mktemp::Temp::new_dir().unwrap();
		let tmp_dst = mktemp::Temp::new_dir().unwrap();
		let src = new_store(&tmp_src.to_path_buf());
		let dst = new_store(&tmp_dst.to_path_buf());

		src.create(30).unwrap();
		let (fa, _) = src.write(30, 0, b"first file").unwrap();
		let (fb, _) = src.write(30, 0, b"second file").unwrap();
		src.unlink(30, fb, UnlinkAction::Delete).unwrap();

		// stream in small chunks, as the dataserver executor does
		dst.create(30).unwrap();
		let (metas, info, data_len) = src.export(30).unwrap();
		let mut off = 0u32;
		loop {
			let (chunk, eof) = src.raw_read(30, off, 16).unwrap();
			if !chunk.is_empty() {
				dst.raw_write(30, off, &chunk).unwrap();
				off += chunk.len() as u32;
			}
			if eof {
				break;
			}
		}
		assert_eq!(off, data_len);
		dst.commit_replica(30, &metas, info, data_len).unwrap();

		assert_eq!(dst.read(30, fa, 0, 64, false).unwrap(), b"first file");
		assert!(dst.read(30, fb, 0, 64, false).is_err());
		assert_eq!(dst.block_info(30).unwrap(), info);
	}

	#[test]
	fn test_rename_file() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let store = new_store(&tmp.to_path_buf());
		store.create(8).unwrap();
		let (fid, _) = store.write(8, 0, b"renamed").unwrap();
		let new_fid = fid | (0x1234u64 << 32);
		store.rename(8, fid, new_fid).unwrap();
		assert!(store.read(8, fid, 0, 8, false).is_err());
		assert_eq!(store.read(8, new_fid, 0, 8, false).unwrap(), b"renamed");
	}

	#[test]
	fn test_stat_fs() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let store = new_store(&tmp.to_path_buf());
		let empty = store.stat_fs();
		assert_eq!(empty.use_capacity, 0);
		assert_eq!(empty.total_capacity, 4 * 4096 + 4 * 1024);
		store.create(1).unwrap();
		let one = store.stat_fs();
		assert_eq!(one.use_capacity, 4096);
		assert_eq!(one.block_count, 1);
	}
}
