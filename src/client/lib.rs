//! Thin TFS client: resolve a block through the nameserver, then talk
//! to the storage nodes directly

#[macro_use]
extern crate tracing;

use std::net::SocketAddr;

use serde_bytes::ByteBuf;

use tfs_rpc::message::*;
use tfs_rpc::RpcHelper;
use tfs_util::data::*;
use tfs_util::error::Error;
use tfs_util::fname::{file_id_with_suffix, suffix_hash, TfsName};

/// Transfer unit of the client read/write paths
const CHUNK_SIZE: usize = 1 << 20;

pub struct TfsClient {
	ns_addr: SocketAddr,
	rpc: RpcHelper,
}

impl TfsClient {
	pub fn new(ns_addr: SocketAddr) -> Self {
		Self {
			ns_addr,
			rpc: RpcHelper::new(10_000, 3),
		}
	}

	pub fn with_rpc(ns_addr: SocketAddr, rpc: RpcHelper) -> Self {
		Self { ns_addr, rpc }
	}

	async fn resolve_write(&self, force_new: bool) -> Result<(BlockId, Vec<ServerId>), Error> {
		let reply = self
			.rpc
			.call_retry(
				self.ns_addr,
				&Message::GetBlockInfo {
					block_id: 0,
					mode: if force_new {
						AccessMode::CreateNew
					} else {
						AccessMode::Write
					},
					admin: force_new,
				},
			)
			.await?;
		match reply {
			Message::BlockInfoReply {
				block_id, replicas, ..
			} if !replicas.is_empty() => Ok((block_id, replicas)),
			Message::BlockInfoReply { block_id, .. } => Err(Error::NotFound(format!(
				"block {} has no live replica",
				block_id
			))),
			m => m
				.into_result()
				.and(Err(Error::Message("empty block info reply".into()))),
		}
	}

	async fn resolve_read(&self, block_id: BlockId) -> Result<Vec<ServerId>, Error> {
		let reply = self
			.rpc
			.call_retry(
				self.ns_addr,
				&Message::GetBlockInfo {
					block_id,
					mode: AccessMode::Read,
					admin: false,
				},
			)
			.await?;
		match reply {
			Message::BlockInfoReply { replicas, .. } if !replicas.is_empty() => Ok(replicas),
			Message::BlockInfoReply { .. } => Err(Error::NotFound(format!(
				"block {} has no live replica",
				block_id
			))),
			m => m
				.into_result()
				.and(Err(Error::Message("empty block info reply".into()))),
		}
	}

	/// Store a buffer as a new file; returns its external name
	pub async fn save(&self, data: &[u8], suffix: Option<&str>) -> Result<String, Error> {
		self.save_inner(data, suffix, false).await
	}

	/// Store a buffer into a freshly allocated block (admin operation)
	pub async fn save_force_new_block(
		&self,
		data: &[u8],
		suffix: Option<&str>,
	) -> Result<String, Error> {
		self.save_inner(data, suffix, true).await
	}

	async fn save_inner(
		&self,
		data: &[u8],
		suffix: Option<&str>,
		force_new: bool,
	) -> Result<String, Error> {
		let (block_id, replicas) = self.resolve_write(force_new).await?;
		let primary = server_addr(replicas[0]);

		let file_id = match self
			.rpc
			.call(primary, &Message::CreateFilename { block_id, file_id: 0 })
			.await?
		{
			Message::FilenameReply { file_id, .. } => file_id,
			m => return Err(Error::unexpected_message(m)),
		};
		let file_id = match suffix {
			Some(s) => file_id_with_suffix(file_id, s),
			None => file_id,
		};

		let mut offset = 0usize;
		loop {
			let end = (offset + CHUNK_SIZE).min(data.len());
			self.rpc
				.call_unit(
					primary,
					&Message::WriteData {
						block_id,
						file_id,
						offset: offset as u32,
						data: ByteBuf::from(data[offset..end].to_vec()),
						replicas: replicas.clone(),
					},
				)
				.await?;
			offset = end;
			if offset >= data.len() {
				break;
			}
		}

		self.rpc
			.call_unit(
				primary,
				&Message::CloseFile {
					block_id,
					file_id,
					crc: crc32(data),
					replicas: replicas.clone(),
				},
			)
			.await?;

		let name = TfsName::new(block_id, file_id, suffix);
		debug!("Saved {} bytes as {}", data.len(), name);
		Ok(name.encode())
	}

	fn parse_name(&self, name: &str, suffix: Option<&str>) -> Result<TfsName, Error> {
		let parsed = TfsName::decode(name)?;
		if let Some(s) = suffix {
			if suffix_hash(s) != parsed.suffix_hash {
				return Err(Error::NotFound(format!(
					"suffix {:?} does not match file name {}",
					s, name
				)));
			}
		}
		if parsed.large {
			return Err(Error::Message(format!(
				"{} is a large-file name, not supported by this client",
				name
			)));
		}
		Ok(parsed)
	}

	/// Fetch a whole file by name
	pub async fn fetch(&self, name: &str, suffix: Option<&str>) -> Result<Vec<u8>, Error> {
		let parsed = self.parse_name(name, suffix)?;
		let replicas = self.resolve_read(parsed.block_id).await?;

		let mut last_err = None;
		for server in replicas {
			match self.fetch_from(parsed, server_addr(server)).await {
				Ok(data) => return Ok(data),
				Err(e) => {
					debug!("Read of {} from {} failed: {}", name, server_str(server), e);
					last_err = Some(e);
				}
			}
		}
		Err(last_err.unwrap_or_else(|| Error::NotFound(name.to_string())))
	}

	async fn fetch_from(&self, name: TfsName, addr: SocketAddr) -> Result<Vec<u8>, Error> {
		let info = self.stat_on(name, addr, false).await?;
		let mut data = Vec::with_capacity(info.size as usize);
		while (data.len() as u32) < info.size {
			let reply = self
				.rpc
				.call(
					addr,
					&Message::ReadData {
						block_id: name.block_id,
						file_id: name.file_id,
						offset: data.len() as u32,
						len: CHUNK_SIZE as u32,
						force: false,
					},
				)
				.await?;
			match reply {
				Message::DataReply { data: chunk } if !chunk.is_empty() => {
					data.extend_from_slice(&chunk);
				}
				Message::DataReply { .. } => break,
				m => return m.into_result().and(Err(Error::Message("empty read".into()))),
			}
		}
		if data.len() as u32 != info.size {
			return Err(Error::Message(format!(
				"short read: {} of {} bytes",
				data.len(),
				info.size
			)));
		}
		Ok(data)
	}

	async fn stat_on(&self, name: TfsName, addr: SocketAddr, force: bool) -> Result<FileInfo, Error> {
		match self
			.rpc
			.call(
				addr,
				&Message::GetFileInfo {
					block_id: name.block_id,
					file_id: name.file_id,
					force,
				},
			)
			.await?
		{
			Message::FileInfoReply { info } => Ok(info),
			m => m
				.into_result()
				.and(Err(Error::Message("empty file info reply".into()))),
		}
	}

	/// Header of a file; with `force`, flagged files are visible too
	pub async fn stat(&self, name: &str, suffix: Option<&str>, force: bool) -> Result<FileInfo, Error> {
		let parsed = self.parse_name(name, suffix)?;
		let replicas = self.resolve_read(parsed.block_id).await?;
		let mut last_err = None;
		for server in replicas {
			match self.stat_on(parsed, server_addr(server), force).await {
				Ok(info) => return Ok(info),
				Err(e) => last_err = Some(e),
			}
		}
		Err(last_err.unwrap_or_else(|| Error::NotFound(name.to_string())))
	}

	/// Flip a file's status flag (delete, undelete, conceal, unconceal)
	pub async fn unlink(
		&self,
		name: &str,
		suffix: Option<&str>,
		action: UnlinkAction,
	) -> Result<(), Error> {
		let parsed = self.parse_name(name, suffix)?;
		let replicas = self.resolve_read(parsed.block_id).await?;
		self.rpc
			.call_unit(
				server_addr(replicas[0]),
				&Message::UnlinkFile {
					block_id: parsed.block_id,
					file_id: parsed.file_id,
					action,
					replicas,
				},
			)
			.await
	}

	/// Give a file a new suffix; returns the new name
	pub async fn rename(&self, name: &str, new_suffix: &str) -> Result<String, Error> {
		let parsed = self.parse_name(name, None)?;
		let new_file_id = file_id_with_suffix(parsed.file_id, new_suffix);
		let replicas = self.resolve_read(parsed.block_id).await?;
		self.rpc
			.call_unit(
				server_addr(replicas[0]),
				&Message::RenameFile {
					block_id: parsed.block_id,
					file_id: parsed.file_id,
					new_file_id,
					replicas,
				},
			)
			.await?;
		Ok(TfsName::new(parsed.block_id, new_file_id, Some(new_suffix)).encode())
	}

	/// Replica set of a block, from the nameserver
	pub async fn list_block(&self, block_id: BlockId) -> Result<Vec<ServerId>, Error> {
		self.resolve_read(block_id).await
	}

	/// Files of a block, from one storage node
	pub async fn list_files(
		&self,
		block_id: BlockId,
		ds_addr: SocketAddr,
	) -> Result<Vec<FileInfo>, Error> {
		match self
			.rpc
			.call(ds_addr, &Message::ListFiles { block_id })
			.await?
		{
			Message::FileListReply { files } => Ok(files),
			m => m
				.into_result()
				.and(Err(Error::Message("empty file list reply".into()))),
		}
	}

	/// Counters of a block on one storage node
	pub async fn stat_block(
		&self,
		block_id: BlockId,
		ds_addr: SocketAddr,
	) -> Result<(BlockInfo, bool, u64), Error> {
		match self
			.rpc
			.call(ds_addr, &Message::GetDsBlockInfo { block_id })
			.await?
		{
			Message::DsBlockInfoReply {
				info,
				error,
				visit_count,
			} => Ok((info, error, visit_count)),
			m => m
				.into_result()
				.and(Err(Error::Message("empty block info reply".into()))),
		}
	}

	/// Admin command relayed through the nameserver
	pub async fn admin_cmd(&self, cmd: ClientCmd) -> Result<(), Error> {
		self.rpc
			.call_unit(self.ns_addr, &Message::ClientCmdReq { cmd, admin: true })
			.await
	}
}
