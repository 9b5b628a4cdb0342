//! The TFS nameserver: block/server registry, heartbeat ingestion,
//! background planning, oplog replication to the standby, and HA role
//! arbitration over the VIP

#[macro_use]
extern crate tracing;

pub mod ha;
pub mod heartbeat;
pub mod oplog;
pub mod plan;
pub mod registry;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use tfs_rpc::message::*;
use tfs_rpc::vip::VipResolver;
use tfs_rpc::{MessageHandler, RpcHelper};
use tfs_util::background::BackgroundRunner;
use tfs_util::config::Config;
use tfs_util::data::*;
use tfs_util::error::Error;

use ha::{CheckRoleWorker, MasterHeartWorker, NsRuntime, SlaveHeartWorker};
use heartbeat::{GcWorker, HeartManager};
use oplog::{OpKind, OplogManager, OplogSendWorker};
use plan::{PlanEngine, PlanWorker};
use registry::Registry;

pub struct Nameserver {
	pub registry: Arc<Registry>,
	pub plans: Arc<PlanEngine>,
	pub oplog: Arc<OplogManager>,
	pub runtime: Arc<NsRuntime>,
	pub heart: Arc<HeartManager>,
	rpc: RpcHelper,
	config: Config,
}

impl Nameserver {
	pub fn new(config: Config, vip: Arc<dyn VipResolver>) -> Result<Arc<Self>, Error> {
		let ns_cfg = &config.nameserver;
		let runtime = Arc::new(NsRuntime::new(
			pack_server_id(ns_cfg.bind_addr),
			ns_cfg.peer_addr,
			vip,
			Duration::from_secs(ns_cfg.safe_mode_sec),
		));
		let registry = Arc::new(Registry::new(
			config.replica_count,
			ns_cfg.max_write_block_size,
		));
		let oplog = Arc::new(OplogManager::open(
			&config.metadata_dir,
			ns_cfg.oplog_fsync,
			ns_cfg.oplog_segment_size,
			ns_cfg.oplog_retain_margin,
		)?);
		let rpc = RpcHelper::new(config.rpc_timeout_msec, config.client_retry_count);
		let plans = PlanEngine::new(
			registry.clone(),
			runtime.clone(),
			oplog.clone(),
			rpc,
			ns_cfg,
		);
		let heart = HeartManager::new(registry.clone(), runtime.clone(), oplog.clone(), ns_cfg);

		Ok(Arc::new(Self {
			registry,
			plans,
			oplog,
			runtime,
			heart,
			rpc,
			config,
		}))
	}

	pub fn spawn_workers(self: &Arc<Self>, bg: &BackgroundRunner) {
		let ns_cfg = &self.config.nameserver;
		self.heart.spawn_workers(bg, ns_cfg.heart_thread_count);
		bg.spawn_worker(PlanWorker {
			plans: self.plans.clone(),
			interval: Duration::from_millis(ns_cfg.plan_interval_msec),
		});
		bg.spawn_worker(GcWorker {
			registry: self.registry.clone(),
			interval: Duration::from_millis(ns_cfg.ds_dead_msec / 2),
			ds_dead_msec: ns_cfg.ds_dead_msec,
			ds_clear_msec: ns_cfg.ds_clear_msec,
		});
		bg.spawn_worker(CheckRoleWorker {
			runtime: self.runtime.clone(),
			plans: self.plans.clone(),
			registry: self.registry.clone(),
			rpc: self.rpc,
			interval: Duration::from_millis(ns_cfg.master_heart_interval_msec),
		});
		if self.runtime.peer_addr.is_some() {
			bg.spawn_worker(MasterHeartWorker {
				runtime: self.runtime.clone(),
				rpc: self.rpc,
				interval: Duration::from_millis(ns_cfg.master_heart_interval_msec),
			});
			bg.spawn_worker(SlaveHeartWorker {
				runtime: self.runtime.clone(),
				plans: self.plans.clone(),
				registry: self.registry.clone(),
				rpc: self.rpc,
				interval: Duration::from_millis(ns_cfg.master_heart_interval_msec),
			});
			bg.spawn_worker(OplogSendWorker::new(
				self.oplog.clone(),
				self.runtime.clone(),
				self.rpc,
				self.runtime.peer_addr,
			));
		}
		self.runtime.set_initialized();
	}

	async fn get_block_info(&self, block_id: BlockId, mode: AccessMode, admin: bool) -> Message {
		match mode {
			AccessMode::Read => match self.registry.get_block(block_id) {
				Some((info, replicas)) if !replicas.is_empty() => Message::BlockInfoReply {
					block_id,
					version: info.version,
					replicas,
				},
				_ => Message::error(&Error::NotFound(format!("block {}", block_id))),
			},
			AccessMode::Write | AccessMode::CreateNew => {
				if !self.runtime.is_master() {
					return Message::error(&Error::NotLeader(
						"mutating requests go to the master nameserver".into(),
					));
				}
				if self.runtime.in_safe_mode() {
					return Message::error(&Error::Busy(
						"nameserver is in safe mode after a role switch".into(),
					));
				}
				if mode == AccessMode::CreateNew && !admin {
					return Message::error(&Error::Unauthorized(
						"forcing a new block requires the admin flag".into(),
					));
				}
				if mode == AccessMode::Write {
					if let Some((block_id, replicas)) = self.registry.pick_write_block() {
						let version = self
							.registry
							.block_collect(block_id)
							.map(|bc| bc.info.version)
							.unwrap_or(BLOCK_VERSION_MAGIC_NUM);
						return Message::BlockInfoReply {
							block_id,
							version,
							replicas,
						};
					}
				}
				self.create_block().await
			}
		}
	}

	/// Pick targets and create a fresh block on them
	async fn create_block(&self) -> Message {
		let block_id = self.registry.alloc_block_id();
		let mut exclude = vec![];
		let mut servers = vec![];
		for _ in 0..self.config.replica_count {
			let target = match self.registry.elect_target(&exclude) {
				Some(t) => t,
				None => break,
			};
			exclude.push(target);
			match self
				.rpc
				.call_unit(server_addr(target), &Message::NewBlock { block_id })
				.await
			{
				Ok(()) => servers.push(target),
				Err(e) => warn!(
					"Could not create block {} on {}: {}",
					block_id,
					server_str(target),
					e
				),
			}
		}
		if servers.is_empty() {
			return Message::error(&Error::CapacityExhausted(
				"no dataserver accepted a new block".into(),
			));
		}
		servers.sort_unstable();
		self.registry
			.add_block(block_id, servers.clone(), BLOCK_VERSION_MAGIC_NUM);
		if let Err(e) = self
			.oplog
			.append(OpKind::Insert, block_id, 0, BLOCK_VERSION_MAGIC_NUM)
		{
			error!("Oplog append failed: {}", e);
		}
		info!(
			"Created block {} on {} servers",
			block_id,
			servers.len()
		);
		Message::BlockInfoReply {
			block_id,
			version: BLOCK_VERSION_MAGIC_NUM,
			replicas: servers,
		}
	}

	async fn client_cmd(&self, cmd: ClientCmd, admin: bool) -> Message {
		if !admin {
			return Message::error(&Error::Unauthorized(
				"admin commands require the admin flag".into(),
			));
		}
		if !self.runtime.is_master() {
			return Message::error(&Error::NotLeader(
				"admin commands go to the master nameserver".into(),
			));
		}
		match cmd {
			ClientCmd::CompactBlock(block_id) => match self.plans.request_compact(block_id) {
				Ok(()) => Message::ok(),
				Err(e) => Message::error(&e),
			},
			ClientCmd::RemoveBlock(block_id) => {
				let replicas = self
					.registry
					.get_block(block_id)
					.map(|(_, r)| r)
					.unwrap_or_default();
				for server in replicas {
					if let Err(e) = self
						.rpc
						.call_unit(server_addr(server), &Message::RemoveBlock { block_id })
						.await
					{
						warn!(
							"Could not remove block {} on {}: {}",
							block_id,
							server_str(server),
							e
						);
					}
				}
				if self.registry.remove_block(block_id) {
					if let Err(e) = self.oplog.append(OpKind::Delete, block_id, 0, 0) {
						error!("Oplog append failed: {}", e);
					}
					Message::ok()
				} else {
					Message::error(&Error::NotFound(format!("block {}", block_id)))
				}
			}
		}
	}
}

#[async_trait]
impl MessageHandler for Nameserver {
	async fn handle(self: &Arc<Self>, msg: Message, from: SocketAddr) -> Message {
		match msg {
			Message::Heartbeat { stat, blocks } => self.heart.push(stat, blocks, from).await,
			Message::ReplicateBlockDone {
				block_id,
				source,
				target,
				is_move,
				info,
			} => self
				.plans
				.complete_replicate(block_id, source, target, is_move, info),
			Message::CompactBlockDone {
				block_id,
				server,
				info,
			} => self.plans.complete_compact(block_id, server, info),
			Message::NsHeartbeat {
				role,
				status,
				force,
				..
			} => ha::handle_peer_heartbeat(&self.runtime, &self.plans, role, status, force),
			Message::OplogSync { entries } => {
				match self.oplog.apply_raw(&entries, &self.registry) {
					Ok(last_applied_seq) => Message::OplogSyncAck { last_applied_seq },
					Err(e) => Message::error(&e),
				}
			}
			Message::NsSwitchProbe { switch_hint } => {
				if switch_hint && !self.runtime.is_master() && self.runtime.vip_is_local() {
					warn!("Dataserver reports the master unreachable and the vip is here");
					self.runtime
						.promote(NsStatus::OtherSideDead, ha::SyncOplogFlag::No);
					self.plans.destroy_plans();
					self.registry.request_full_reports();
				}
				Message::NsSwitchReply {
					status: self.runtime.snapshot().owner_status,
				}
			}
			Message::GetBlockInfo {
				block_id,
				mode,
				admin,
			} => self.get_block_info(block_id, mode, admin).await,
			Message::BatchGetBlockInfo { blocks, mode: _ } => {
				let entries = blocks
					.into_iter()
					.filter_map(|block_id| {
						self.registry
							.get_block(block_id)
							.map(|(info, replicas)| (block_id, info.version, replicas))
					})
					.collect();
				Message::BatchBlockInfoReply { entries }
			}
			Message::ClientCmdReq { cmd, admin } => self.client_cmd(cmd, admin).await,
			Message::ListBlocks => {
				let mut blocks: Vec<(BlockId, Vec<ServerId>)> = self
					.registry
					.all_blocks()
					.into_iter()
					.map(|bc| (bc.info.block_id, bc.replicas))
					.collect();
				blocks.sort_unstable_by_key(|(id, _)| *id);
				Message::BlockListReply { blocks }
			}
			m => Message::error(&Error::unexpected_message(m)),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tfs_rpc::vip::StaticVipResolver;
	use tfs_util::config::{DsConfig, NsConfig};

	fn test_config(metadata_dir: std::path::PathBuf, max_queue_size: usize, safe_mode_sec: u64) -> Config {
		Config {
			data_dir: metadata_dir.clone(),
			metadata_dir,
			replica_count: 2,
			rpc_timeout_msec: 200,
			client_retry_count: 0,
			nameserver: NsConfig {
				max_queue_size,
				safe_mode_sec,
				..Default::default()
			},
			dataserver: DsConfig::default(),
		}
	}

	fn ds_stat(id: ServerId, status: DsStatus) -> DataserverStat {
		DataserverStat {
			id,
			use_capacity: 0,
			total_capacity: 1 << 30,
			current_load: 0,
			block_count: 0,
			startup_time: 0,
			status,
		}
	}

	fn block_report(block_id: BlockId) -> BlockReport {
		BlockReport {
			info: BlockInfo {
				block_id,
				version: BLOCK_VERSION_MAGIC_NUM,
				..Default::default()
			},
			error: false,
		}
	}

	fn peer() -> SocketAddr {
		"127.0.0.1:45678".parse().unwrap()
	}

	struct Cluster {
		ns: Arc<Nameserver>,
		stop: tokio::sync::watch::Sender<bool>,
		_bg: Arc<BackgroundRunner>,
		_tmp: mktemp::Temp,
	}

	async fn cluster(max_queue_size: usize, vip_local: bool, safe_mode_sec: u64) -> Cluster {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let config = test_config(tmp.to_path_buf(), max_queue_size, safe_mode_sec);
		let ns = Nameserver::new(config, Arc::new(StaticVipResolver::new(vip_local))).unwrap();
		let (stop, watch) = tokio::sync::watch::channel(false);
		let (bg, _done) = BackgroundRunner::new(watch);
		ns.spawn_workers(&bg);
		Cluster {
			ns,
			stop,
			_bg: bg,
			_tmp: tmp,
		}
	}

	#[tokio::test]
	async fn test_heartbeat_backpressure() {
		// a zero-size queue rejects every ordinary beat immediately
		let c = cluster(0, true, 0).await;
		let reply = c
			.ns
			.handle(
				Message::Heartbeat {
					stat: ds_stat(11, DsStatus::Alive),
					blocks: None,
				},
				peer(),
			)
			.await;
		match reply {
			Message::HeartbeatResponse {
				status: HeartStatus::Error,
				msg: Some(msg),
				..
			} => assert!(msg.contains("busy")),
			m => panic!("expected busy, got {:?}", m),
		}

		// a dead notice bypasses the bound
		let reply = c
			.ns
			.handle(
				Message::Heartbeat {
					stat: ds_stat(11, DsStatus::Dead),
					blocks: None,
				},
				peer(),
			)
			.await;
		assert!(matches!(
			reply,
			Message::HeartbeatResponse {
				status: HeartStatus::Ok,
				..
			}
		));

		// a block report bypasses the bound too
		let reply = c
			.ns
			.handle(
				Message::Heartbeat {
					stat: ds_stat(12, DsStatus::Alive),
					blocks: Some(vec![block_report(70)]),
				},
				peer(),
			)
			.await;
		assert!(matches!(
			reply,
			Message::HeartbeatResponse {
				status: HeartStatus::Ok,
				..
			}
		));
		let _ = c.stop.send(true);
	}

	#[tokio::test]
	async fn test_new_server_told_to_report() {
		let c = cluster(64, true, 0).await;
		let reply = c
			.ns
			.handle(
				Message::Heartbeat {
					stat: ds_stat(21, DsStatus::Alive),
					blocks: None,
				},
				peer(),
			)
			.await;
		assert!(matches!(
			reply,
			Message::HeartbeatResponse {
				status: HeartStatus::NeedSendBlockInfo,
				..
			}
		));

		// after a report, ordinary beats are plain ok
		c.ns.handle(
			Message::Heartbeat {
				stat: ds_stat(21, DsStatus::Alive),
				blocks: Some(vec![]),
			},
			peer(),
		)
		.await;
		let reply = c
			.ns
			.handle(
				Message::Heartbeat {
					stat: ds_stat(21, DsStatus::Alive),
					blocks: None,
				},
				peer(),
			)
			.await;
		assert!(matches!(
			reply,
			Message::HeartbeatResponse {
				status: HeartStatus::Ok,
				..
			}
		));
		let _ = c.stop.send(true);
	}

	#[tokio::test]
	async fn test_expire_orphan_report() {
		let c = cluster(64, true, 0).await;
		for id in [1u64, 2, 3] {
			c.ns.handle(
				Message::Heartbeat {
					stat: ds_stat(id, DsStatus::Alive),
					blocks: None,
				},
				peer(),
			)
			.await;
		}
		// two holders fill the replica set
		for id in [1u64, 2] {
			c.ns.handle(
				Message::Heartbeat {
					stat: ds_stat(id, DsStatus::Alive),
					blocks: Some(vec![block_report(300)]),
				},
				peer(),
			)
			.await;
		}
		// the third holder is an orphan and must delete its copy
		let reply = c
			.ns
			.handle(
				Message::Heartbeat {
					stat: ds_stat(3, DsStatus::Alive),
					blocks: Some(vec![block_report(300)]),
				},
				peer(),
			)
			.await;
		match reply {
			Message::HeartbeatResponse {
				status: HeartStatus::ExpireBlockId,
				expires,
				..
			} => assert_eq!(expires, vec![300]),
			m => panic!("expected expire, got {:?}", m),
		}
		let _ = c.stop.send(true);
	}

	#[tokio::test]
	async fn test_write_requires_master() {
		let c = cluster(64, false, 0).await;
		let reply = c
			.ns
			.handle(
				Message::GetBlockInfo {
					block_id: 0,
					mode: AccessMode::Write,
					admin: false,
				},
				peer(),
			)
			.await;
		assert!(matches!(
			reply.into_result(),
			Err(Error::NotLeader(_))
		));
		let _ = c.stop.send(true);
	}

	#[tokio::test]
	async fn test_write_blocked_in_safe_mode() {
		let c = cluster(64, true, 300).await;
		let reply = c
			.ns
			.handle(
				Message::GetBlockInfo {
					block_id: 0,
					mode: AccessMode::Write,
					admin: false,
				},
				peer(),
			)
			.await;
		assert!(matches!(reply.into_result(), Err(Error::Busy(_))));
		let _ = c.stop.send(true);
	}

	#[tokio::test]
	async fn test_force_new_block_requires_admin() {
		let c = cluster(64, true, 0).await;
		let reply = c
			.ns
			.handle(
				Message::GetBlockInfo {
					block_id: 0,
					mode: AccessMode::CreateNew,
					admin: false,
				},
				peer(),
			)
			.await;
		assert!(matches!(
			reply.into_result(),
			Err(Error::Unauthorized(_))
		));
		let _ = c.stop.send(true);
	}

	#[tokio::test]
	async fn test_read_lookup() {
		let c = cluster(64, true, 0).await;
		for id in [1u64, 2] {
			c.ns.handle(
				Message::Heartbeat {
					stat: ds_stat(id, DsStatus::Alive),
					blocks: Some(vec![block_report(55)]),
				},
				peer(),
			)
			.await;
		}
		let reply = c
			.ns
			.handle(
				Message::GetBlockInfo {
					block_id: 55,
					mode: AccessMode::Read,
					admin: false,
				},
				peer(),
			)
			.await;
		match reply {
			Message::BlockInfoReply {
				block_id,
				replicas,
				..
			} => {
				assert_eq!(block_id, 55);
				assert_eq!(replicas, vec![1, 2]);
			}
			m => panic!("unexpected {:?}", m),
		}

		let missing = c
			.ns
			.handle(
				Message::GetBlockInfo {
					block_id: 56,
					mode: AccessMode::Read,
					admin: false,
				},
				peer(),
			)
			.await;
		assert!(matches!(missing.into_result(), Err(Error::NotFound(_))));
		let _ = c.stop.send(true);
	}

	#[tokio::test]
	async fn test_oplog_sync_roundtrip_between_peers() {
		let c_active = cluster(64, true, 0).await;
		let c_standby = cluster(64, false, 0).await;

		// a report on the active appends to its oplog
		c_active
			.ns
			.handle(
				Message::Heartbeat {
					stat: ds_stat(1, DsStatus::Alive),
					blocks: Some(vec![block_report(88)]),
				},
				peer(),
			)
			.await;
		assert!(c_active.ns.oplog.last_seq() >= 1);

		let frames = c_active.ns.oplog.read_from(1, 100).unwrap();
		let reply = c_standby
			.ns
			.handle(
				Message::OplogSync {
					entries: frames.into(),
				},
				peer(),
			)
			.await;
		match reply {
			Message::OplogSyncAck { last_applied_seq } => {
				assert_eq!(last_applied_seq, c_active.ns.oplog.last_seq());
			}
			m => panic!("unexpected {:?}", m),
		}
		// the standby registry is warm
		assert!(c_standby.ns.registry.block_collect(88).is_some());
		let _ = c_active.stop.send(true);
		let _ = c_standby.stop.send(true);
	}
}
