//! Durable operation log of registry mutations, streamed to the standby
//! nameserver. Entries are framed `len | body | crc` in rolling
//! append-only segment files.

use std::collections::BTreeMap;
use std::convert::TryInto;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};

use tfs_rpc::message::Message;
use tfs_rpc::RpcHelper;
use tfs_util::background::worker::{Worker, WorkerStatus};
use tfs_util::data::{crc32, BlockId, FileId};
use tfs_util::error::Error;
use tfs_util::time::now_msec;

use crate::ha::{NsRuntime, SyncOplogFlag};
use crate::registry::Registry;

const OPLOG_DIR: &str = "oplog";
const APPLIED_FILE: &str = "applied_seq";
const SEND_BATCH_MAX: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
	Insert,
	Delete,
	Undelete,
	Update,
}

/// One mutation of the registry. Block-level entries carry the block
/// version in the `size` field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OpLogEntry {
	pub seq: u64,
	pub op: OpKind,
	pub block_id: BlockId,
	pub file_id: FileId,
	pub size: u32,
	pub timestamp: u64,
}

struct Segment {
	first_seq: u64,
	path: PathBuf,
}

struct AppendState {
	file: fs::File,
	seg_first_seq: u64,
	seg_len: u64,
	next_seq: u64,
	segments: Vec<Segment>,
}

pub struct OplogManager {
	dir: PathBuf,
	fsync: bool,
	segment_size: u64,
	retain_margin: u64,
	state: Mutex<AppendState>,
	/// Highest sequence number acknowledged by the standby
	last_acked: AtomicU64,
	/// Highest sequence number applied locally (standby role)
	last_applied: AtomicU64,
	pub notify: Notify,
}

fn segment_path(dir: &Path, first_seq: u64) -> PathBuf {
	dir.join(format!("{:016x}", first_seq))
}

fn encode_frame(entry: &OpLogEntry) -> Result<Vec<u8>, Error> {
	let body = rmp_serde::encode::to_vec_named(entry)?;
	let mut frame = Vec::with_capacity(body.len() + 8);
	frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
	frame.extend_from_slice(&body);
	frame.extend_from_slice(&crc32(&body).to_be_bytes());
	Ok(frame)
}

/// Decode as many whole frames as the buffer holds
pub fn decode_frames(bytes: &[u8]) -> Result<Vec<OpLogEntry>, Error> {
	let mut out = vec![];
	let mut at = 0usize;
	while at + 4 <= bytes.len() {
		let len = u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
			as usize;
		if at + 4 + len + 4 > bytes.len() {
			break;
		}
		let body = &bytes[at + 4..at + 4 + len];
		let stored = u32::from_be_bytes([
			bytes[at + 4 + len],
			bytes[at + 4 + len + 1],
			bytes[at + 4 + len + 2],
			bytes[at + 4 + len + 3],
		]);
		let computed = crc32(body);
		if stored != computed {
			return Err(Error::CrcError { stored, computed });
		}
		out.push(rmp_serde::decode::from_read_ref(body)?);
		at += 4 + len + 4;
	}
	Ok(out)
}

impl OplogManager {
	pub fn open(metadata_dir: &Path, fsync: bool, segment_size: u64, retain_margin: u64) -> Result<Self, Error> {
		let dir = metadata_dir.join(OPLOG_DIR);
		fs::create_dir_all(&dir)?;

		let mut segments: BTreeMap<u64, PathBuf> = BTreeMap::new();
		for entry in fs::read_dir(&dir)? {
			let entry = entry?;
			if let Some(first_seq) = entry
				.file_name()
				.to_str()
				.and_then(|s| u64::from_str_radix(s, 16).ok())
			{
				segments.insert(first_seq, entry.path());
			}
		}

		// the next sequence number continues after the last durable entry
		let mut next_seq = 1u64;
		if let Some((first, path)) = segments.iter().next_back() {
			let mut bytes = vec![];
			fs::File::open(path)?.read_to_end(&mut bytes)?;
			let entries = decode_frames(&bytes)?;
			next_seq = entries.last().map(|e| e.seq + 1).unwrap_or(*first);
		}

		let last_segment = segments
			.iter()
			.next_back()
			.map(|(first, path)| (*first, path.clone()));
		let (seg_first_seq, path) = match last_segment {
			Some(seg) => seg,
			None => {
				let path = segment_path(&dir, next_seq);
				fs::File::create(&path)?;
				segments.insert(next_seq, path.clone());
				(next_seq, path)
			}
		};
		let file = fs::OpenOptions::new().append(true).open(&path)?;
		let seg_len = file.metadata()?.len();

		let last_applied = match fs::read(dir.join(APPLIED_FILE)) {
			Ok(bytes) if bytes.len() == 8 => u64::from_le_bytes(bytes[..8].try_into().unwrap()),
			_ => 0,
		};

		Ok(Self {
			dir,
			fsync,
			segment_size,
			retain_margin,
			state: Mutex::new(AppendState {
				file,
				seg_first_seq,
				seg_len,
				next_seq,
				segments: segments
					.into_iter()
					.map(|(first_seq, path)| Segment { first_seq, path })
					.collect(),
			}),
			last_acked: AtomicU64::new(0),
			last_applied: AtomicU64::new(last_applied),
			notify: Notify::new(),
		})
	}

	/// Append one mutation, durable before this returns (unless fsync is
	/// configured off)
	pub fn append(
		&self,
		op: OpKind,
		block_id: BlockId,
		file_id: FileId,
		size: u32,
	) -> Result<u64, Error> {
		let seq = {
			let mut state = self.state.lock().unwrap();
			let seq = state.next_seq;
			let entry = OpLogEntry {
				seq,
				op,
				block_id,
				file_id,
				size,
				timestamp: now_msec(),
			};
			let frame = encode_frame(&entry)?;

			if state.seg_len + frame.len() as u64 > self.segment_size && state.seg_len > 0 {
				let path = segment_path(&self.dir, seq);
				let file = fs::OpenOptions::new()
					.create_new(true)
					.append(true)
					.open(&path)?;
				state.file = file;
				state.seg_first_seq = seq;
				state.seg_len = 0;
				state.segments.push(Segment {
					first_seq: seq,
					path,
				});
				debug!("Oplog rotated to segment {:016x}", seq);
			}

			state.file.write_all(&frame)?;
			if self.fsync {
				state.file.sync_data()?;
			}
			state.seg_len += frame.len() as u64;
			state.next_seq = seq + 1;
			seq
		};
		self.notify.notify_waiters();
		Ok(seq)
	}

	pub fn last_seq(&self) -> u64 {
		self.state.lock().unwrap().next_seq - 1
	}

	pub fn last_acked(&self) -> u64 {
		self.last_acked.load(Ordering::SeqCst)
	}

	pub fn last_applied(&self) -> u64 {
		self.last_applied.load(Ordering::SeqCst)
	}

	/// Raw frames of up to `max` entries starting at `from_seq`
	pub fn read_from(&self, from_seq: u64, max: usize) -> Result<Vec<u8>, Error> {
		let paths: Vec<PathBuf> = {
			let state = self.state.lock().unwrap();
			state
				.segments
				.iter()
				.filter(|seg| {
					// a segment is relevant if it may contain >= from_seq
					let next_first = state
						.segments
						.iter()
						.map(|s| s.first_seq)
						.filter(|f| *f > seg.first_seq)
						.min();
					next_first.map(|n| n > from_seq).unwrap_or(true)
				})
				.map(|seg| seg.path.clone())
				.collect()
		};

		let mut out = vec![];
		let mut count = 0usize;
		for path in paths {
			let mut bytes = vec![];
			fs::File::open(&path)?.read_to_end(&mut bytes)?;
			for entry in decode_frames(&bytes)? {
				if entry.seq >= from_seq {
					out.extend_from_slice(&encode_frame(&entry)?);
					count += 1;
					if count >= max {
						return Ok(out);
					}
				}
			}
		}
		Ok(out)
	}

	/// Record the standby's progress and recycle fully-acked segments
	pub fn ack(&self, seq: u64) -> Result<(), Error> {
		let prev = self.last_acked.fetch_max(seq, Ordering::SeqCst);
		if seq <= prev {
			return Ok(());
		}
		let boundary = seq.saturating_sub(self.retain_margin);
		let mut state = self.state.lock().unwrap();
		// a segment is recyclable when the following segment starts at or
		// below the boundary; the active segment always stays
		let firsts: Vec<u64> = state.segments.iter().map(|s| s.first_seq).collect();
		let mut drop_paths = vec![];
		state.segments.retain(|seg| {
			let next_first = firsts.iter().filter(|f| **f > seg.first_seq).min();
			match next_first {
				Some(next) if *next <= boundary => {
					drop_paths.push(seg.path.clone());
					false
				}
				_ => true,
			}
		});
		drop(state);
		for path in drop_paths {
			info!("Recycling oplog segment {}", path.display());
			fs::remove_file(path)?;
		}
		Ok(())
	}

	/// Standby side: verify, apply to the registry, persist progress.
	/// Returns the new high-water mark.
	pub fn apply_raw(&self, bytes: &[u8], registry: &Registry) -> Result<u64, Error> {
		let entries = decode_frames(bytes)?;
		let mut applied = self.last_applied.load(Ordering::SeqCst);
		for entry in entries {
			if entry.seq <= applied {
				continue;
			}
			if entry.seq != applied + 1 && applied != 0 {
				warn!(
					"Oplog gap: expected seq {}, got {}",
					applied + 1,
					entry.seq
				);
			}
			match entry.op {
				OpKind::Insert | OpKind::Update | OpKind::Undelete => {
					registry.replay_block(entry.block_id, entry.size);
				}
				OpKind::Delete => {
					registry.remove_block(entry.block_id);
				}
			}
			applied = entry.seq;
		}
		self.last_applied.store(applied, Ordering::SeqCst);
		fs::write(self.dir.join(APPLIED_FILE), applied.to_le_bytes())?;
		Ok(applied)
	}
}

/// Background sender streaming the log to the standby
pub struct OplogSendWorker {
	oplog: Arc<OplogManager>,
	runtime: Arc<NsRuntime>,
	rpc: RpcHelper,
	peer: Option<std::net::SocketAddr>,
}

impl OplogSendWorker {
	pub fn new(
		oplog: Arc<OplogManager>,
		runtime: Arc<NsRuntime>,
		rpc: RpcHelper,
		peer: Option<std::net::SocketAddr>,
	) -> Self {
		Self {
			oplog,
			runtime,
			rpc,
			peer,
		}
	}
}

#[async_trait]
impl Worker for OplogSendWorker {
	fn name(&self) -> String {
		"Oplog sender".into()
	}

	async fn work(&mut self, _must_exit: &mut watch::Receiver<bool>) -> Result<WorkerStatus, Error> {
		let peer = match self.peer {
			Some(p) => p,
			None => return Ok(WorkerStatus::Done),
		};
		if self.runtime.sync_flag() != SyncOplogFlag::Yes {
			return Ok(WorkerStatus::Idle);
		}
		let from = self.oplog.last_acked() + 1;
		if from > self.oplog.last_seq() {
			return Ok(WorkerStatus::Idle);
		}
		let frames = self.oplog.read_from(from, SEND_BATCH_MAX)?;
		if frames.is_empty() {
			return Ok(WorkerStatus::Idle);
		}
		let reply = self
			.rpc
			.call(
				peer,
				&Message::OplogSync {
					entries: frames.into(),
				},
			)
			.await?;
		match reply {
			Message::OplogSyncAck { last_applied_seq } => {
				self.oplog.ack(last_applied_seq)?;
				Ok(WorkerStatus::Busy)
			}
			m => Err(Error::unexpected_message(m)),
		}
	}

	async fn wait_for_work(&mut self, _must_exit: &watch::Receiver<bool>) -> WorkerStatus {
		tokio::select! {
			_ = self.oplog.notify.notified() => (),
			_ = tokio::time::sleep(Duration::from_secs(1)) => (),
		}
		WorkerStatus::Busy
	}
}
