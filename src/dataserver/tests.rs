use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_bytes::ByteBuf;
use tokio::sync::{watch, Mutex};

use tfs_rpc::message::*;
use tfs_rpc::{server, MessageHandler, RpcHelper};
use tfs_store::BlockStore;
use tfs_util::config::{Config, DsConfig, NsConfig};
use tfs_util::data::*;
use tfs_util::error::Error;

use crate::Dataserver;

fn small_ds_config(ns_addr: SocketAddr) -> DsConfig {
	DsConfig {
		ns_addr,
		main_block_size: 4096,
		ext_block_size: 1024,
		main_block_count: 8,
		ext_block_count: 8,
		avg_file_size: 64,
		write_min_replica: 2,
		copy_chunk_size: 64,
		..Default::default()
	}
}

fn test_config(data_dir: std::path::PathBuf, ns_addr: SocketAddr) -> Config {
	Config {
		metadata_dir: data_dir.clone(),
		data_dir,
		replica_count: 2,
		rpc_timeout_msec: 2_000,
		client_retry_count: 0,
		nameserver: NsConfig::default(),
		dataserver: small_ds_config(ns_addr),
	}
}

struct TestDs {
	ds: Arc<Dataserver>,
	addr: SocketAddr,
	_stop: watch::Sender<bool>,
	_tmp: mktemp::Temp,
}

async fn spawn_ds(ns_addr: SocketAddr) -> TestDs {
	let tmp = mktemp::Temp::new_dir().unwrap();
	let dir = tmp.to_path_buf();
	BlockStore::format(&dir, &small_ds_config(ns_addr)).unwrap();
	let store = Arc::new(BlockStore::open(&dir).unwrap());

	let listener = server::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
	let addr = listener.local_addr().unwrap();
	let ds = Dataserver::new(test_config(dir, ns_addr), store, addr);

	let (stop, stop_rx) = watch::channel(false);
	let handler = ds.clone();
	tokio::spawn(async move {
		let _ = server::serve_listener(listener, handler, stop_rx).await;
	});
	TestDs {
		ds,
		addr,
		_stop: stop,
		_tmp: tmp,
	}
}

/// Stand-in nameserver recording completion reports
struct RecordingNs {
	msgs: Mutex<Vec<Message>>,
}

#[async_trait]
impl MessageHandler for RecordingNs {
	async fn handle(self: &Arc<Self>, msg: Message, _from: SocketAddr) -> Message {
		self.msgs.lock().await.push(msg);
		Message::ok()
	}
}

async fn spawn_recording_ns() -> (Arc<RecordingNs>, SocketAddr, watch::Sender<bool>) {
	let ns = Arc::new(RecordingNs {
		msgs: Mutex::new(vec![]),
	});
	let listener = server::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
	let addr = listener.local_addr().unwrap();
	let (stop, stop_rx) = watch::channel(false);
	let handler = ns.clone();
	tokio::spawn(async move {
		let _ = server::serve_listener(listener, handler, stop_rx).await;
	});
	(ns, addr, stop)
}

async fn write_file(
	rpc: &RpcHelper,
	primary: SocketAddr,
	replicas: Vec<ServerId>,
	block_id: BlockId,
	payload: &[u8],
) -> Result<FileId, Error> {
	let file_id = match rpc
		.call(primary, &Message::CreateFilename { block_id, file_id: 0 })
		.await?
	{
		Message::FilenameReply { file_id, .. } => file_id,
		m => return Err(Error::unexpected_message(m)),
	};
	rpc.call_unit(
		primary,
		&Message::WriteData {
			block_id,
			file_id,
			offset: 0,
			data: ByteBuf::from(payload.to_vec()),
			replicas: replicas.clone(),
		},
	)
	.await?;
	rpc.call_unit(
		primary,
		&Message::CloseFile {
			block_id,
			file_id,
			crc: crc32(payload),
			replicas,
		},
	)
	.await?;
	Ok(file_id)
}

async fn read_file(
	rpc: &RpcHelper,
	addr: SocketAddr,
	block_id: BlockId,
	file_id: FileId,
	len: u32,
) -> Result<Vec<u8>, Error> {
	match rpc
		.call(
			addr,
			&Message::ReadData {
				block_id,
				file_id,
				offset: 0,
				len,
				force: false,
			},
		)
		.await?
	{
		Message::DataReply { data } => Ok(data.into_vec()),
		m => m.into_result().map(|_| vec![]),
	}
}

#[tokio::test]
async fn test_write_replicates_and_reads_back() {
	let (_ns, ns_addr, _ns_stop) = spawn_recording_ns().await;
	let a = spawn_ds(ns_addr).await;
	let b = spawn_ds(ns_addr).await;
	let rpc = RpcHelper::new(2_000, 0);
	let replicas = vec![a.ds.server_id, b.ds.server_id];

	for addr in [a.addr, b.addr] {
		rpc.call_unit(addr, &Message::NewBlock { block_id: 1 })
			.await
			.unwrap();
	}

	let payload = vec![0x41u8; 512];
	let file_id = write_file(&rpc, a.addr, replicas.clone(), 1, &payload)
		.await
		.unwrap();

	// both replicas serve the same bytes
	assert_eq!(read_file(&rpc, a.addr, 1, file_id, 512).await.unwrap(), payload);
	assert_eq!(read_file(&rpc, b.addr, 1, file_id, 512).await.unwrap(), payload);

	// stat on either side agrees
	for addr in [a.addr, b.addr] {
		match rpc
			.call(
				addr,
				&Message::GetFileInfo {
					block_id: 1,
					file_id,
					force: false,
				},
			)
			.await
			.unwrap()
		{
			Message::FileInfoReply { info } => {
				assert_eq!(info.size, 512);
				assert_eq!(info.flag, 0);
				assert_eq!(info.crc, crc32(&payload));
			}
			m => panic!("unexpected {:?}", m),
		}
	}
}

#[tokio::test]
async fn test_close_with_wrong_crc_fails() {
	let (_ns, ns_addr, _ns_stop) = spawn_recording_ns().await;
	let a = spawn_ds(ns_addr).await;
	let rpc = RpcHelper::new(2_000, 0);

	rpc.call_unit(a.addr, &Message::NewBlock { block_id: 1 })
		.await
		.unwrap();
	rpc.call_unit(
		a.addr,
		&Message::WriteData {
			block_id: 1,
			file_id: 7,
			offset: 0,
			data: ByteBuf::from(b"payload".to_vec()),
			replicas: vec![],
		},
	)
	.await
	.unwrap();
	let res = rpc
		.call_unit(
			a.addr,
			&Message::CloseFile {
				block_id: 1,
				file_id: 7,
				crc: 0xdeadbeef,
				replicas: vec![],
			},
		)
		.await;
	assert!(matches!(res, Err(Error::CorruptData(_))));
	// nothing was committed
	let read = read_file(&rpc, a.addr, 1, 7, 16).await;
	assert!(read.is_err());
}

#[tokio::test]
async fn test_failed_replication_rolls_back() {
	let (_ns, ns_addr, _ns_stop) = spawn_recording_ns().await;
	let a = spawn_ds(ns_addr).await;
	let rpc = RpcHelper::new(500, 0);

	rpc.call_unit(a.addr, &Message::NewBlock { block_id: 1 })
		.await
		.unwrap();

	// a secondary that does not exist: the chain cannot reach min=2
	let bogus = pack_server_id("127.0.0.1:1".parse().unwrap());
	let replicas = vec![a.ds.server_id, bogus];
	let payload = b"must not survive".to_vec();

	rpc.call_unit(
		a.addr,
		&Message::WriteData {
			block_id: 1,
			file_id: 9,
			offset: 0,
			data: ByteBuf::from(payload.clone()),
			replicas: replicas.clone(),
		},
	)
	.await
	.unwrap();
	let res = rpc
		.call_unit(
			a.addr,
			&Message::CloseFile {
				block_id: 1,
				file_id: 9,
				crc: crc32(&payload),
				replicas,
			},
		)
		.await;
	assert!(res.is_err());

	// the rolled-back file is unreadable on the primary
	assert!(read_file(&rpc, a.addr, 1, 9, 64).await.is_err());
}

#[tokio::test]
async fn test_unlink_forwarded_to_secondaries() {
	let (_ns, ns_addr, _ns_stop) = spawn_recording_ns().await;
	let a = spawn_ds(ns_addr).await;
	let b = spawn_ds(ns_addr).await;
	let rpc = RpcHelper::new(2_000, 0);
	let replicas = vec![a.ds.server_id, b.ds.server_id];

	for addr in [a.addr, b.addr] {
		rpc.call_unit(addr, &Message::NewBlock { block_id: 3 })
			.await
			.unwrap();
	}
	let payload = b"short lived".to_vec();
	let file_id = write_file(&rpc, a.addr, replicas.clone(), 3, &payload)
		.await
		.unwrap();

	rpc.call_unit(
		a.addr,
		&Message::UnlinkFile {
			block_id: 3,
			file_id,
			action: UnlinkAction::Delete,
			replicas: replicas.clone(),
		},
	)
	.await
	.unwrap();

	assert!(read_file(&rpc, a.addr, 3, file_id, 64).await.is_err());
	assert!(read_file(&rpc, b.addr, 3, file_id, 64).await.is_err());

	// undelete restores both replicas
	rpc.call_unit(
		a.addr,
		&Message::UnlinkFile {
			block_id: 3,
			file_id,
			action: UnlinkAction::Undelete,
			replicas: replicas.clone(),
		},
	)
	.await
	.unwrap();
	assert_eq!(
		read_file(&rpc, b.addr, 3, file_id, 64).await.unwrap(),
		payload
	);
}

#[tokio::test]
async fn test_replicate_block_executor() {
	let (ns, ns_addr, _ns_stop) = spawn_recording_ns().await;
	let a = spawn_ds(ns_addr).await;
	let b = spawn_ds(ns_addr).await;
	let rpc = RpcHelper::new(2_000, 0);

	rpc.call_unit(a.addr, &Message::NewBlock { block_id: 5 })
		.await
		.unwrap();
	let payload = (0..300u32).map(|i| (i % 251) as u8).collect::<Vec<_>>();
	let file_id = write_file(&rpc, a.addr, vec![a.ds.server_id], 5, &payload)
		.await
		.unwrap();

	rpc.call_unit(
		a.addr,
		&Message::ReplicateBlock {
			block_id: 5,
			source: a.ds.server_id,
			target: b.ds.server_id,
			is_move: false,
		},
	)
	.await
	.unwrap();

	// the transfer runs in the background; poll the target
	let mut copied = None;
	for _ in 0..100 {
		tokio::time::sleep(Duration::from_millis(50)).await;
		if let Ok(data) = read_file(&rpc, b.addr, 5, file_id, 1024).await {
			copied = Some(data);
			break;
		}
	}
	assert_eq!(copied.expect("replica did not appear"), payload);

	// the completion report reached the nameserver
	let msgs = ns.msgs.lock().await;
	assert!(msgs.iter().any(|m| matches!(
		m,
		Message::ReplicateBlockDone {
			block_id: 5,
			is_move: false,
			..
		}
	)));
}

#[tokio::test]
async fn test_heartbeat_reports_and_expires() {
	let (ns, ns_addr, _ns_stop) = spawn_recording_ns().await;
	let a = spawn_ds(ns_addr).await;
	let rpc = RpcHelper::new(2_000, 0);
	rpc.call_unit(a.addr, &Message::NewBlock { block_id: 8 })
		.await
		.unwrap();

	// drive one beat by hand
	let mut worker = crate::heartbeat::HeartbeatWorker::new(a.ds.clone());
	let (_tx, mut must_exit) = watch::channel(false);
	use tfs_util::background::worker::Worker;
	worker.work(&mut must_exit).await.unwrap();

	let msgs = ns.msgs.lock().await;
	match msgs.first() {
		Some(Message::Heartbeat {
			stat,
			blocks: Some(blocks),
		}) => {
			assert_eq!(stat.id, a.ds.server_id);
			assert_eq!(stat.status, DsStatus::Alive);
			assert_eq!(blocks.len(), 1);
			assert_eq!(blocks[0].info.block_id, 8);
		}
		m => panic!("unexpected first message {:?}", m),
	}
}
