//! The semantic message set of the TFS protocol.
//!
//! Every request and response exchanged between clients, dataservers and
//! nameservers is one variant of [`Message`]; the old per-pcode packet
//! classes collapse into this tagged union, and decoding is a single
//! MessagePack deserialization at the codec layer.

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use tfs_util::data::*;
use tfs_util::error::{Error, ErrorKind};

/// Status tag of a [`Message::StatusReply`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
	Ok,
	Error(ErrorKind),
}

/// Liveness state a dataserver declares about itself in a heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DsStatus {
	Alive,
	/// Clean shutdown notice: release this node's blocks immediately
	Dead,
}

/// Statistics a dataserver reports with every heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataserverStat {
	pub id: ServerId,
	pub use_capacity: u64,
	pub total_capacity: u64,
	pub current_load: u32,
	pub block_count: u32,
	pub startup_time: u32,
	pub status: DsStatus,
}

/// One entry of a full block report
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BlockReport {
	pub info: BlockInfo,
	/// Set when the block is flagged in the error bitmap (CRC or IO failure)
	pub error: bool,
}

/// Top-level status of a heartbeat response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeartStatus {
	Ok,
	/// The expires list carries blocks this node must delete
	ExpireBlockId,
	/// The node must attach its full block report to the next heartbeat
	NeedSendBlockInfo,
	Error,
}

/// What the requesting client intends to do with the block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
	Read,
	Write,
	/// Force allocation of a fresh block; admin-gated
	CreateNew,
}

/// Role of a nameserver in the HA pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NsRole {
	Master,
	Slave,
}

/// Startup/liveness state of a nameserver
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NsStatus {
	Uninitialized,
	OtherSideDead,
	AcceptDsInfo,
	Initialized,
}

/// Trailer of the last chunk of a block replication transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaCommit {
	pub metas: Vec<RawMeta>,
	pub info: BlockInfo,
	/// Total payload bytes transferred, i.e. the append offset to restore
	pub data_len: u32,
}

/// An admin command relayed through the nameserver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientCmd {
	CompactBlock(BlockId),
	RemoveBlock(BlockId),
}

/// All requests and responses of the TFS wire protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
	/// Generic acknowledgment / error reply
	StatusReply { code: StatusCode, msg: String },

	// ---- dataserver -> nameserver ----
	Heartbeat {
		stat: DataserverStat,
		blocks: Option<Vec<BlockReport>>,
	},
	HeartbeatResponse {
		status: HeartStatus,
		expires: Vec<BlockId>,
		msg: Option<String>,
	},
	ReplicateBlockDone {
		block_id: BlockId,
		source: ServerId,
		target: ServerId,
		is_move: bool,
		info: BlockInfo,
	},
	CompactBlockDone {
		block_id: BlockId,
		server: ServerId,
		info: BlockInfo,
	},

	// ---- nameserver -> dataserver ----
	NewBlock { block_id: BlockId },
	RemoveBlock { block_id: BlockId },
	ReplicateBlock {
		block_id: BlockId,
		source: ServerId,
		target: ServerId,
		is_move: bool,
	},
	CompactBlock { block_id: BlockId },

	// ---- dataserver -> dataserver ----
	ReplicateData {
		block_id: BlockId,
		offset: u32,
		data: ByteBuf,
		commit: Option<ReplicaCommit>,
	},

	// ---- nameserver <-> nameserver ----
	NsHeartbeat {
		ip_port: ServerId,
		role: NsRole,
		status: NsStatus,
		/// Force the receiver to take the role carried by this message
		force: bool,
	},
	NsHeartbeatResponse {
		ip_port: ServerId,
		role: NsRole,
		status: NsStatus,
	},
	OplogSync { entries: ByteBuf },
	OplogSyncAck { last_applied_seq: u64 },
	/// A dataserver lost its nameserver and pokes whoever now answers on
	/// the VIP: with the hint set, a slave holding the VIP re-checks its
	/// role right away
	NsSwitchProbe { switch_hint: bool },
	NsSwitchReply { status: NsStatus },

	// ---- client <-> nameserver ----
	GetBlockInfo {
		block_id: BlockId,
		mode: AccessMode,
		admin: bool,
	},
	BatchGetBlockInfo {
		blocks: Vec<BlockId>,
		mode: AccessMode,
	},
	BlockInfoReply {
		block_id: BlockId,
		version: u32,
		/// Replica set, primary first
		replicas: Vec<ServerId>,
	},
	BatchBlockInfoReply {
		entries: Vec<(BlockId, u32, Vec<ServerId>)>,
	},
	ClientCmdReq { cmd: ClientCmd, admin: bool },
	BlockListReply { blocks: Vec<(BlockId, Vec<ServerId>)> },
	ListBlocks,

	// ---- client <-> dataserver ----
	CreateFilename {
		block_id: BlockId,
		file_id: FileId,
	},
	FilenameReply {
		block_id: BlockId,
		file_id: FileId,
	},
	WriteData {
		block_id: BlockId,
		file_id: FileId,
		offset: u32,
		data: ByteBuf,
		/// Replica set, primary first; the primary forwards in this order.
		/// Empty on forwarded writes.
		replicas: Vec<ServerId>,
	},
	CloseFile {
		block_id: BlockId,
		file_id: FileId,
		crc: u32,
		replicas: Vec<ServerId>,
	},
	RollbackFile {
		block_id: BlockId,
		file_id: FileId,
	},
	ReadData {
		block_id: BlockId,
		file_id: FileId,
		offset: u32,
		len: u32,
		force: bool,
	},
	DataReply { data: ByteBuf },
	GetFileInfo {
		block_id: BlockId,
		file_id: FileId,
		force: bool,
	},
	FileInfoReply { info: FileInfo },
	UnlinkFile {
		block_id: BlockId,
		file_id: FileId,
		action: UnlinkAction,
		replicas: Vec<ServerId>,
	},
	RenameFile {
		block_id: BlockId,
		file_id: FileId,
		new_file_id: FileId,
		replicas: Vec<ServerId>,
	},
	ListFiles { block_id: BlockId },
	FileListReply { files: Vec<FileInfo> },
	GetDsBlockInfo { block_id: BlockId },
	DsBlockInfoReply {
		info: BlockInfo,
		error: bool,
		visit_count: u64,
	},
}

impl Message {
	/// Successful status reply
	pub fn ok() -> Self {
		Message::StatusReply {
			code: StatusCode::Ok,
			msg: String::new(),
		}
	}

	/// Status reply carrying a local error
	pub fn error(e: &Error) -> Self {
		Message::StatusReply {
			code: StatusCode::Error(e.kind()),
			msg: format!("{}", e),
		}
	}

	/// Reconstruct a `Result` from a status reply; any other message is
	/// itself an error (protocol violation)
	pub fn into_result(self) -> Result<(), Error> {
		match self {
			Message::StatusReply {
				code: StatusCode::Ok,
				..
			} => Ok(()),
			Message::StatusReply {
				code: StatusCode::Error(kind),
				msg,
			} => Err(rebuild_error(kind, msg)),
			m => Err(Error::unexpected_message(m)),
		}
	}
}

/// Turn a wire status back into the closest local error value
pub fn rebuild_error(kind: ErrorKind, msg: String) -> Error {
	match kind {
		ErrorKind::NotFound => Error::NotFound(msg),
		ErrorKind::AlreadyExists => Error::AlreadyExists(msg),
		ErrorKind::Busy => Error::Busy(msg),
		ErrorKind::StaleVersion => Error::Message(msg),
		ErrorKind::CrcError => Error::CorruptData(msg),
		ErrorKind::CapacityExhausted => Error::CapacityExhausted(msg),
		ErrorKind::Network => Error::Network(msg),
		ErrorKind::NotLeader => Error::NotLeader(msg),
		ErrorKind::Unauthorized => Error::Unauthorized(msg),
		ErrorKind::Io | ErrorKind::Other => Error::Message(msg),
	}
}
