//! The TFS storage node agent: client I/O service over the local block
//! store, the replication chain on the write path, heartbeats to the
//! nameserver, and executors for coordinator plans

#[macro_use]
extern crate tracing;

pub mod executor;
pub mod heartbeat;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_bytes::ByteBuf;
use tokio::sync::Mutex;

use tfs_rpc::message::*;
use tfs_rpc::{MessageHandler, RpcHelper};
use tfs_store::BlockStore;
use tfs_util::background::BackgroundRunner;
use tfs_util::config::Config;
use tfs_util::data::*;
use tfs_util::error::Error;
use tfs_util::time::now_sec;

/// An open write: bytes buffered between CreateFilename and CloseFile
struct WriteLease {
	buf: Vec<u8>,
	created: Instant,
}

pub struct Dataserver {
	pub store: Arc<BlockStore>,
	pub rpc: RpcHelper,
	pub server_id: ServerId,
	pub ns_addr: SocketAddr,
	pub config: Config,
	startup_time: u32,
	leases: Mutex<HashMap<(BlockId, FileId), WriteLease>>,
	visits: Mutex<HashMap<BlockId, u64>>,
	/// Set when the next heartbeat must carry the full block report
	pub need_report: AtomicBool,
	load: AtomicU32,
}

impl Dataserver {
	pub fn new(config: Config, store: Arc<BlockStore>, public_addr: SocketAddr) -> Arc<Self> {
		let rpc = RpcHelper::new(config.rpc_timeout_msec, config.client_retry_count);
		Arc::new(Self {
			store,
			rpc,
			server_id: pack_server_id(public_addr),
			ns_addr: config.dataserver.ns_addr,
			config,
			startup_time: now_sec(),
			leases: Mutex::new(HashMap::new()),
			visits: Mutex::new(HashMap::new()),
			need_report: AtomicBool::new(true),
			load: AtomicU32::new(0),
		})
	}

	pub fn spawn_workers(self: &Arc<Self>, bg: &BackgroundRunner) {
		bg.spawn_worker(heartbeat::HeartbeatWorker::new(self.clone()));
	}

	pub fn current_load(&self) -> u32 {
		self.load.load(Ordering::SeqCst)
	}

	pub fn startup_time(&self) -> u32 {
		self.startup_time
	}

	/// Run a block-store operation off the async executor
	pub(crate) async fn blocking<T, F>(&self, f: F) -> Result<T, Error>
	where
		T: Send + 'static,
		F: FnOnce(&BlockStore) -> Result<T, Error> + Send + 'static,
	{
		let store = self.store.clone();
		tokio::task::spawn_blocking(move || f(&store)).await?
	}

	fn is_primary(&self, replicas: &[ServerId]) -> bool {
		replicas.first() == Some(&self.server_id)
	}

	fn secondaries<'a>(&self, replicas: &'a [ServerId]) -> &'a [ServerId] {
		if replicas.is_empty() {
			&[]
		} else {
			&replicas[1..]
		}
	}

	// ---- write path ----

	async fn create_filename(&self, block_id: BlockId, file_id: FileId) -> Message {
		if file_id != 0 {
			return Message::FilenameReply { block_id, file_id };
		}
		match self.blocking(move |s| s.alloc_file_id(block_id)).await {
			Ok(file_id) => Message::FilenameReply { block_id, file_id },
			Err(e) => Message::error(&e),
		}
	}

	async fn write_data(
		&self,
		block_id: BlockId,
		file_id: FileId,
		offset: u32,
		data: ByteBuf,
		replicas: Vec<ServerId>,
	) -> Message {
		{
			let mut leases = self.leases.lock().await;
			let lease = leases.entry((block_id, file_id)).or_insert_with(|| {
				self.load.fetch_add(1, Ordering::SeqCst);
				WriteLease {
					buf: vec![],
					created: Instant::now(),
				}
			});
			let end = offset as usize + data.len();
			if end > lease.buf.len() {
				lease.buf.resize(end, 0);
			}
			lease.buf[offset as usize..end].copy_from_slice(&data);
		}

		if self.is_primary(&replicas) {
			// forward in replica order; failures surface at close time
			for target in self.secondaries(&replicas) {
				let forward = Message::WriteData {
					block_id,
					file_id,
					offset,
					data: data.clone(),
					replicas: vec![],
				};
				if let Err(e) = self.rpc.call_unit(server_addr(*target), &forward).await {
					warn!(
						"Write forward of {}/{:#x} to {} failed: {}",
						block_id,
						file_id,
						server_str(*target),
						e
					);
				}
			}
		}
		Message::ok()
	}

	async fn close_file(
		&self,
		block_id: BlockId,
		file_id: FileId,
		crc: u32,
		replicas: Vec<ServerId>,
	) -> Message {
		let buf = {
			let mut leases = self.leases.lock().await;
			match leases.remove(&(block_id, file_id)) {
				Some(lease) => {
					self.load.fetch_sub(1, Ordering::SeqCst);
					lease.buf
				}
				None => {
					return Message::error(&Error::NotFound(format!(
						"no open write for {}/{:#x}",
						block_id, file_id
					)))
				}
			}
		};

		let computed = crc32(&buf);
		if computed != crc {
			return Message::error(&Error::CrcError {
				stored: crc,
				computed,
			});
		}

		if let Err(e) = self
			.blocking(move |s| s.write(block_id, file_id, &buf).map(|_| ()))
			.await
		{
			return Message::error(&e);
		}

		if !self.is_primary(&replicas) {
			return Message::ok();
		}

		// the primary drives the chain: each secondary commits in turn
		let mut committed = vec![self.server_id];
		let mut failed = vec![];
		for target in self.secondaries(&replicas) {
			let forward = Message::CloseFile {
				block_id,
				file_id,
				crc,
				replicas: vec![],
			};
			match self.rpc.call_unit(server_addr(*target), &forward).await {
				Ok(()) => committed.push(*target),
				Err(e) => {
					warn!(
						"Close forward of {}/{:#x} to {} failed: {}",
						block_id,
						file_id,
						server_str(*target),
						e
					);
					failed.push(*target);
				}
			}
		}

		let required = self
			.config
			.dataserver
			.write_min_replica
			.min(replicas.len().max(1) as u32);
		if (committed.len() as u32) < required {
			// not enough copies: undo everywhere the commit succeeded
			error!(
				"Write {}/{:#x} reached {} of {} required replicas, rolling back",
				block_id,
				file_id,
				committed.len(),
				required
			);
			let _ = self
				.blocking(move |s| s.rollback(block_id, file_id))
				.await;
			for target in committed.into_iter().skip(1) {
				let rollback = Message::RollbackFile { block_id, file_id };
				if let Err(e) = self.rpc.call_unit(server_addr(target), &rollback).await {
					warn!(
						"Rollback of {}/{:#x} on {} failed: {}",
						block_id,
						file_id,
						server_str(target),
						e
					);
				}
			}
			return Message::error(&Error::Message(format!(
				"write replicated to too few nodes ({} failed)",
				failed.len()
			)));
		}
		Message::ok()
	}

	// ---- read path ----

	async fn read_data(
		&self,
		block_id: BlockId,
		file_id: FileId,
		offset: u32,
		len: u32,
		force: bool,
	) -> Message {
		{
			let mut visits = self.visits.lock().await;
			*visits.entry(block_id).or_insert(0) += 1;
		}
		match self
			.blocking(move |s| s.read(block_id, file_id, offset, len, force))
			.await
		{
			Ok(data) => Message::DataReply {
				data: ByteBuf::from(data),
			},
			Err(e) => {
				if let Error::CrcError { .. } = e {
					// the coordinator learns about it with the next report
					self.need_report.store(true, Ordering::SeqCst);
				}
				Message::error(&e)
			}
		}
	}

	// ---- unlink / rename, forwarded like writes ----

	async fn unlink_file(
		&self,
		block_id: BlockId,
		file_id: FileId,
		action: UnlinkAction,
		replicas: Vec<ServerId>,
	) -> Message {
		if let Err(e) = self
			.blocking(move |s| s.unlink(block_id, file_id, action).map(|_| ()))
			.await
		{
			return Message::error(&e);
		}
		if self.is_primary(&replicas) {
			for target in self.secondaries(&replicas) {
				let forward = Message::UnlinkFile {
					block_id,
					file_id,
					action,
					replicas: vec![],
				};
				if let Err(e) = self.rpc.call_unit(server_addr(*target), &forward).await {
					warn!(
						"Unlink forward of {}/{:#x} to {} failed: {}",
						block_id,
						file_id,
						server_str(*target),
						e
					);
				}
			}
		}
		Message::ok()
	}

	async fn rename_file(
		&self,
		block_id: BlockId,
		file_id: FileId,
		new_file_id: FileId,
		replicas: Vec<ServerId>,
	) -> Message {
		if let Err(e) = self
			.blocking(move |s| s.rename(block_id, file_id, new_file_id))
			.await
		{
			return Message::error(&e);
		}
		if self.is_primary(&replicas) {
			for target in self.secondaries(&replicas) {
				let forward = Message::RenameFile {
					block_id,
					file_id,
					new_file_id,
					replicas: vec![],
				};
				if let Err(e) = self.rpc.call_unit(server_addr(*target), &forward).await {
					warn!(
						"Rename forward of {}/{:#x} to {} failed: {}",
						block_id,
						file_id,
						server_str(*target),
						e
					);
				}
			}
		}
		Message::ok()
	}

	/// Drop writes that were opened but never closed
	pub(crate) async fn sweep_leases(&self) {
		let timeout = std::time::Duration::from_secs(60);
		let mut leases = self.leases.lock().await;
		let before = leases.len();
		leases.retain(|_, lease| lease.created.elapsed() < timeout);
		let dropped = before - leases.len();
		if dropped > 0 {
			self.load.fetch_sub(dropped as u32, Ordering::SeqCst);
			warn!("Dropped {} stale write leases", dropped);
		}
	}
}

#[async_trait]
impl MessageHandler for Dataserver {
	async fn handle(self: &Arc<Self>, msg: Message, _from: SocketAddr) -> Message {
		match msg {
			Message::CreateFilename { block_id, file_id } => {
				self.create_filename(block_id, file_id).await
			}
			Message::WriteData {
				block_id,
				file_id,
				offset,
				data,
				replicas,
			} => {
				self.write_data(block_id, file_id, offset, data, replicas)
					.await
			}
			Message::CloseFile {
				block_id,
				file_id,
				crc,
				replicas,
			} => self.close_file(block_id, file_id, crc, replicas).await,
			Message::RollbackFile { block_id, file_id } => {
				match self.blocking(move |s| s.rollback(block_id, file_id)).await {
					Ok(()) => Message::ok(),
					Err(e) => Message::error(&e),
				}
			}
			Message::ReadData {
				block_id,
				file_id,
				offset,
				len,
				force,
			} => self.read_data(block_id, file_id, offset, len, force).await,
			Message::GetFileInfo {
				block_id,
				file_id,
				force,
			} => match self
				.blocking(move |s| s.stat(block_id, file_id, force))
				.await
			{
				Ok(info) => Message::FileInfoReply { info },
				Err(e) => Message::error(&e),
			},
			Message::UnlinkFile {
				block_id,
				file_id,
				action,
				replicas,
			} => {
				self.unlink_file(block_id, file_id, action, replicas)
					.await
			}
			Message::RenameFile {
				block_id,
				file_id,
				new_file_id,
				replicas,
			} => {
				self.rename_file(block_id, file_id, new_file_id, replicas)
					.await
			}
			Message::ListFiles { block_id } => {
				match self.blocking(move |s| s.list(block_id)).await {
					Ok(files) => Message::FileListReply { files },
					Err(e) => Message::error(&e),
				}
			}
			Message::GetDsBlockInfo { block_id } => {
				let visit_count = *self.visits.lock().await.get(&block_id).unwrap_or(&0);
				match self.blocking(move |s| s.block_info(block_id)).await {
					Ok(info) => Message::DsBlockInfoReply {
						error: self.store.is_error(block_id),
						info,
						visit_count,
					},
					Err(e) => Message::error(&e),
				}
			}

			// ---- coordinator commands ----
			Message::NewBlock { block_id } => {
				match self.blocking(move |s| s.create(block_id)).await {
					Ok(()) => Message::ok(),
					Err(e) => Message::error(&e),
				}
			}
			Message::RemoveBlock { block_id } => {
				match self.blocking(move |s| s.remove(block_id)).await {
					Ok(()) => Message::ok(),
					Err(e) => Message::error(&e),
				}
			}
			Message::ReplicateBlock {
				block_id,
				source,
				target,
				is_move,
			} => {
				if source != self.server_id {
					return Message::error(&Error::Message(format!(
						"replicate source mismatch: got {}, am {}",
						server_str(source),
						server_str(self.server_id)
					)));
				}
				let this = self.clone();
				tokio::spawn(async move {
					executor::replicate_block(this, block_id, target, is_move).await;
				});
				Message::ok()
			}
			Message::CompactBlock { block_id } => {
				let this = self.clone();
				tokio::spawn(async move {
					executor::compact_block(this, block_id).await;
				});
				Message::ok()
			}
			Message::ReplicateData {
				block_id,
				offset,
				data,
				commit,
			} => {
				let res = self
					.blocking(move |s| {
						if offset == 0 && s.block_info(block_id).is_err() {
							s.create(block_id)?;
						}
						if !data.is_empty() {
							s.raw_write(block_id, offset, &data)?;
						}
						if let Some(commit) = commit {
							s.commit_replica(
								block_id,
								&commit.metas,
								commit.info,
								commit.data_len,
							)?;
						}
						Ok(())
					})
					.await;
				match res {
					Ok(()) => Message::ok(),
					Err(e) => Message::error(&e),
				}
			}
			m => Message::error(&Error::unexpected_message(m)),
		}
	}
}
