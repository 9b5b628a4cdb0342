//! Background work planner: replicate under-replicated blocks, compact
//! blocks past the dead-space ratio, move blocks off crowded nodes, and
//! drop blocks nobody holds anymore

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use tfs_rpc::message::Message;
use tfs_rpc::RpcHelper;
use tfs_util::background::worker::{Worker, WorkerStatus};
use tfs_util::config::NsConfig;
use tfs_util::data::*;
use tfs_util::error::Error;
use tfs_util::time::now_msec;

use crate::ha::NsRuntime;
use crate::oplog::{OpKind, OplogManager};
use crate::registry::Registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanKind {
	Replicate,
	Compact,
	Move,
	Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanState {
	Running,
	Finished,
	TimedOut,
	Failed,
}

#[derive(Debug, Clone)]
pub struct Plan {
	pub id: u64,
	pub kind: PlanKind,
	pub block_id: BlockId,
	pub source: ServerId,
	pub targets: Vec<ServerId>,
	pub started_at: u64,
	pub deadline: u64,
	pub state: PlanState,
	pub retries: u32,
}

#[derive(Default)]
struct PlanSet {
	by_id: HashMap<u64, Plan>,
	by_block: HashMap<BlockId, u64>,
	next_id: u64,
}

pub struct PlanEngine {
	plans: Mutex<PlanSet>,
	registry: Arc<Registry>,
	runtime: Arc<NsRuntime>,
	oplog: Arc<OplogManager>,
	rpc: RpcHelper,
	plan_timeout: u64,
	plan_retry_max: u32,
	max_plans_per_server: usize,
	compact_ratio: f64,
	balance_slack: u32,
}

impl PlanEngine {
	pub fn new(
		registry: Arc<Registry>,
		runtime: Arc<NsRuntime>,
		oplog: Arc<OplogManager>,
		rpc: RpcHelper,
		cfg: &NsConfig,
	) -> Arc<Self> {
		Arc::new(Self {
			plans: Mutex::new(PlanSet::default()),
			registry,
			runtime,
			oplog,
			rpc,
			plan_timeout: cfg.plan_timeout_msec,
			plan_retry_max: cfg.plan_retry_max,
			max_plans_per_server: cfg.max_plans_per_server,
			compact_ratio: cfg.compact_ratio,
			balance_slack: cfg.balance_slack,
		})
	}

	/// Drop every plan (role switches, shutdown)
	pub fn destroy_plans(&self) {
		let mut plans = self.plans.lock().unwrap();
		let n = plans.by_id.len();
		plans.by_id.clear();
		plans.by_block.clear();
		if n > 0 {
			warn!("Destroyed {} in-flight plans", n);
		}
	}

	pub fn plan_count(&self) -> usize {
		self.plans.lock().unwrap().by_id.len()
	}

	pub fn plan_for_block(&self, block_id: BlockId) -> Option<Plan> {
		let plans = self.plans.lock().unwrap();
		plans
			.by_block
			.get(&block_id)
			.and_then(|id| plans.by_id.get(id))
			.cloned()
	}

	fn running_on(&self, plans: &PlanSet, server: ServerId) -> usize {
		plans
			.by_id
			.values()
			.filter(|p| p.state == PlanState::Running && p.source == server)
			.count()
	}

	/// Admit and register a plan; returns it for dispatch, or None when
	/// inadmissible
	fn admit(
		&self,
		kind: PlanKind,
		block_id: BlockId,
		source: ServerId,
		targets: Vec<ServerId>,
		now: u64,
	) -> Option<Plan> {
		let mut plans = self.plans.lock().unwrap();
		if plans.by_block.contains_key(&block_id) {
			return None;
		}
		if self.running_on(&plans, source) >= self.max_plans_per_server {
			return None;
		}
		plans.next_id += 1;
		let plan = Plan {
			id: plans.next_id,
			kind,
			block_id,
			source,
			targets,
			started_at: now,
			deadline: now + self.plan_timeout,
			state: PlanState::Running,
			retries: 0,
		};
		plans.by_block.insert(block_id, plan.id);
		plans.by_id.insert(plan.id, plan.clone());
		Some(plan)
	}

	fn remove_plan(&self, plan_id: u64, state: PlanState) {
		let mut plans = self.plans.lock().unwrap();
		if let Some(plan) = plans.by_id.remove(&plan_id) {
			plans.by_block.remove(&plan.block_id);
			debug!(
				"Plan {} ({:?} block {}) ended {:?}",
				plan.id, plan.kind, plan.block_id, state
			);
		}
	}

	fn dispatch(&self, plan: &Plan) {
		let rpc = self.rpc;
		let kind = plan.kind;
		let block_id = plan.block_id;
		let source = plan.source;
		let targets = plan.targets.clone();
		tokio::spawn(async move {
			let sends: Vec<(ServerId, Message)> = match kind {
				PlanKind::Replicate | PlanKind::Move => vec![(
					source,
					Message::ReplicateBlock {
						block_id,
						source,
						target: targets[0],
						is_move: kind == PlanKind::Move,
					},
				)],
				PlanKind::Compact => targets
					.iter()
					.map(|t| (*t, Message::CompactBlock { block_id }))
					.collect(),
				PlanKind::Delete => targets
					.iter()
					.map(|t| (*t, Message::RemoveBlock { block_id }))
					.collect(),
			};
			for (server, msg) in sends {
				if let Err(e) = rpc.call_unit(server_addr(server), &msg).await {
					warn!(
						"Dispatch of {:?} for block {} to {} failed: {}",
						kind,
						block_id,
						server_str(server),
						e
					);
				}
			}
		});
	}

	fn log_update(&self, block_id: BlockId, op: OpKind, version: u32) {
		if self.runtime.is_master() {
			if let Err(e) = self.oplog.append(op, block_id, 0, version) {
				error!("Oplog append failed: {}", e);
			}
		}
	}

	/// One planning pass. Separated from the worker for tests.
	pub fn tick(&self, now: u64) {
		if !self.runtime.is_master() || self.runtime.in_safe_mode() {
			return;
		}

		// reap expired plans; the next pass re-derives them
		let expired: Vec<u64> = {
			let plans = self.plans.lock().unwrap();
			plans
				.by_id
				.values()
				.filter(|p| p.deadline < now)
				.map(|p| p.id)
				.collect()
		};
		for id in expired {
			warn!("Plan {} timed out", id);
			self.remove_plan(id, PlanState::TimedOut);
		}

		let replica_count = self.registry.replica_count();
		for bc in self.registry.all_blocks() {
			let block_id = bc.info.block_id;
			if self.plan_for_block(block_id).is_some() {
				continue;
			}
			let alive = match self.registry.get_block(block_id) {
				Some((_, alive)) => alive,
				None => continue,
			};

			if bc.replicas.is_empty() {
				// nobody holds it and nothing is in flight: forget it
				if self.registry.remove_block(block_id) {
					self.log_update(block_id, OpKind::Delete, 0);
				}
				continue;
			}
			if alive.is_empty() {
				// all holders are dead; wait for one to come back
				continue;
			}

			if (alive.len() as u32) < replica_count {
				let source = alive[0];
				if let Some(target) = self.registry.elect_target(&bc.replicas) {
					if let Some(plan) =
						self.admit(PlanKind::Replicate, block_id, source, vec![target], now)
					{
						info!(
							"Replicate block {}: {} -> {}",
							block_id,
							server_str(source),
							server_str(target)
						);
						self.dispatch(&plan);
					}
				}
				continue;
			}

			let total = (bc.info.size + bc.info.del_size) as f64;
			if total > 0.0 && bc.info.del_size as f64 / total > self.compact_ratio {
				if let Some(plan) =
					self.admit(PlanKind::Compact, block_id, alive[0], alive.clone(), now)
				{
					info!(
						"Compact block {} ({} dead of {} bytes)",
						block_id, bc.info.del_size, total
					);
					self.dispatch(&plan);
				}
			}
		}

		self.plan_rebalance(now);
	}

	/// At most one move per pass, from the most to the least loaded node
	fn plan_rebalance(&self, now: u64) {
		let servers = self.registry.alive_servers();
		if servers.len() < 2 {
			return;
		}
		let max = servers.iter().max_by_key(|sc| sc.stat.block_count).unwrap();
		let min = servers.iter().min_by_key(|sc| sc.stat.block_count).unwrap();
		if max.stat.block_count.saturating_sub(min.stat.block_count) <= self.balance_slack {
			return;
		}
		let candidate = max.hold.iter().find(|block_id| {
			self.plan_for_block(**block_id).is_none()
				&& self
					.registry
					.block_collect(**block_id)
					.map(|bc| {
						!bc.replicas.contains(&min.stat.id)
							&& bc.replicas.len() as u32 >= self.registry.replica_count()
					})
					.unwrap_or(false)
		});
		if let Some(block_id) = candidate {
			if let Some(plan) = self.admit(
				PlanKind::Move,
				*block_id,
				max.stat.id,
				vec![min.stat.id],
				now,
			) {
				info!(
					"Move block {}: {} -> {}",
					block_id,
					server_str(max.stat.id),
					server_str(min.stat.id)
				);
				self.dispatch(&plan);
			}
		}
	}

	/// Admin-requested compaction, outside the periodic scan
	pub fn request_compact(&self, block_id: BlockId) -> Result<(), Error> {
		let now = now_msec();
		let alive = match self.registry.get_block(block_id) {
			Some((_, alive)) if !alive.is_empty() => alive,
			_ => return Err(Error::NotFound(format!("block {}", block_id))),
		};
		match self.admit(PlanKind::Compact, block_id, alive[0], alive, now) {
			Some(plan) => {
				self.dispatch(&plan);
				Ok(())
			}
			None => Err(Error::Busy(format!(
				"block {} already has a plan in flight",
				block_id
			))),
		}
	}

	/// A replication (or move) transfer finished on the dataserver side
	pub fn complete_replicate(
		&self,
		block_id: BlockId,
		source: ServerId,
		target: ServerId,
		is_move: bool,
		info: BlockInfo,
	) -> Message {
		let plan = self.plan_for_block(block_id);
		let accepted = self.registry.add_replica(block_id, target, info);
		if accepted {
			if is_move {
				self.registry.remove_replica(block_id, source);
			}
			self.log_update(block_id, OpKind::Update, info.version);
			if let Some(plan) = plan {
				self.remove_plan(plan.id, PlanState::Finished);
			}
			Message::ok()
		} else {
			// stale version: retry the transfer, give up past the limit
			if let Some(mut plan) = plan {
				plan.retries += 1;
				if plan.retries > self.plan_retry_max {
					self.remove_plan(plan.id, PlanState::Failed);
				} else {
					let mut plans = self.plans.lock().unwrap();
					if let Some(p) = plans.by_id.get_mut(&plan.id) {
						p.retries = plan.retries;
						p.deadline = now_msec() + self.plan_timeout;
					}
					drop(plans);
					self.dispatch(&plan);
				}
			}
			Message::error(&Error::StaleVersion {
				have: self
					.registry
					.block_collect(block_id)
					.map(|bc| bc.info.version)
					.unwrap_or(0),
				got: info.version,
			})
		}
	}

	/// A compaction finished on one replica
	pub fn complete_compact(&self, block_id: BlockId, server: ServerId, info: BlockInfo) -> Message {
		self.registry.update_info(block_id, info);
		self.log_update(block_id, OpKind::Update, info.version);
		if let Some(plan) = self.plan_for_block(block_id) {
			if plan.kind == PlanKind::Compact && plan.source == server {
				self.remove_plan(plan.id, PlanState::Finished);
			}
		}
		Message::ok()
	}
}

/// Periodic driver of the plan engine
pub struct PlanWorker {
	pub plans: Arc<PlanEngine>,
	pub interval: Duration,
}

#[async_trait]
impl Worker for PlanWorker {
	fn name(&self) -> String {
		"Plan engine".into()
	}

	async fn work(&mut self, _must_exit: &mut watch::Receiver<bool>) -> Result<WorkerStatus, Error> {
		self.plans.tick(now_msec());
		Ok(WorkerStatus::Idle)
	}

	async fn wait_for_work(&mut self, _must_exit: &watch::Receiver<bool>) -> WorkerStatus {
		tokio::time::sleep(self.interval).await;
		WorkerStatus::Busy
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tfs_rpc::message::{BlockReport, DataserverStat, DsStatus};
	use tfs_rpc::vip::StaticVipResolver;

	fn server(n: u8) -> ServerId {
		pack_server_id(format!("10.0.{}.1:3200", n).parse().unwrap())
	}

	fn stat(id: ServerId) -> DataserverStat {
		DataserverStat {
			id,
			use_capacity: 0,
			total_capacity: 1 << 30,
			current_load: 0,
			block_count: 0,
			startup_time: 0,
			status: DsStatus::Alive,
		}
	}

	fn report(block_id: BlockId, version: u32, del_size: u32, size: u32) -> BlockReport {
		BlockReport {
			info: BlockInfo {
				block_id,
				version,
				size,
				del_size,
				..Default::default()
			},
			error: false,
		}
	}

	struct Fixture {
		plans: Arc<PlanEngine>,
		registry: Arc<Registry>,
		_tmp: mktemp::Temp,
	}

	fn fixture(master: bool) -> Fixture {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let registry = Arc::new(Registry::new(2, 1 << 20));
		let runtime = Arc::new(NsRuntime::new(
			7,
			None,
			Arc::new(StaticVipResolver::new(master)),
			Duration::from_secs(0),
		));
		let oplog = Arc::new(OplogManager::open(&tmp.to_path_buf(), true, 1 << 20, 16).unwrap());
		let plans = PlanEngine::new(
			registry.clone(),
			runtime,
			oplog,
			RpcHelper::new(100, 0),
			&tfs_util::config::NsConfig::default(),
		);
		Fixture {
			plans,
			registry,
			_tmp: tmp,
		}
	}

	#[tokio::test]
	async fn test_replicate_plan_for_underreplicated_block() {
		let f = fixture(true);
		let (s1, s2) = (server(1), server(2));
		f.registry.keepalive(stat(s1), 1);
		f.registry.keepalive(stat(s2), 1);
		f.registry.process_report(s1, &[report(100, 2, 0, 10)], 2);

		f.plans.tick(now_msec());
		let plan = f.plans.plan_for_block(100).expect("plan expected");
		assert_eq!(plan.kind, PlanKind::Replicate);
		assert_eq!(plan.source, s1);
		assert_eq!(plan.targets, vec![s2]);

		// one active plan per block
		f.plans.tick(now_msec());
		assert_eq!(f.plans.plan_count(), 1);
	}

	#[tokio::test]
	async fn test_no_plans_when_slave() {
		let f = fixture(false);
		let s1 = server(1);
		f.registry.keepalive(stat(s1), 1);
		f.registry.process_report(s1, &[report(100, 2, 0, 10)], 2);
		f.plans.tick(now_msec());
		assert_eq!(f.plans.plan_count(), 0);
	}

	#[tokio::test]
	async fn test_compact_plan_on_dead_space() {
		let f = fixture(true);
		let (s1, s2) = (server(1), server(2));
		f.registry.keepalive(stat(s1), 1);
		f.registry.keepalive(stat(s2), 1);
		// 40% dead: past the default 0.3 ratio
		f.registry.process_report(s1, &[report(9, 2, 400, 600)], 2);
		f.registry.process_report(s2, &[report(9, 2, 400, 600)], 3);

		f.plans.tick(now_msec());
		let plan = f.plans.plan_for_block(9).expect("plan expected");
		assert_eq!(plan.kind, PlanKind::Compact);
		assert_eq!(plan.targets.len(), 2);
	}

	#[tokio::test]
	async fn test_replicate_wins_over_compact() {
		let f = fixture(true);
		let (s1, s2) = (server(1), server(2));
		f.registry.keepalive(stat(s1), 1);
		f.registry.keepalive(stat(s2), 1);
		// both under-replicated and past compaction pressure
		f.registry.process_report(s1, &[report(9, 2, 400, 600)], 2);

		f.plans.tick(now_msec());
		assert_eq!(f.plans.plan_for_block(9).unwrap().kind, PlanKind::Replicate);
	}

	#[tokio::test]
	async fn test_plan_timeout_frees_slot() {
		let f = fixture(true);
		let (s1, s2) = (server(1), server(2));
		f.registry.keepalive(stat(s1), 1);
		f.registry.keepalive(stat(s2), 1);
		f.registry.process_report(s1, &[report(100, 2, 0, 10)], 2);

		let now = now_msec();
		f.plans.tick(now);
		assert_eq!(f.plans.plan_count(), 1);

		// past the deadline the plan is reaped, then re-derived
		let later = now + NsConfig::default().plan_timeout_msec + 1_000;
		f.plans.tick(later);
		assert_eq!(f.plans.plan_count(), 1);
		assert!(f.plans.plan_for_block(100).unwrap().started_at >= later);
	}

	#[tokio::test]
	async fn test_complete_replicate_updates_registry() {
		let f = fixture(true);
		let (s1, s2) = (server(1), server(2));
		f.registry.keepalive(stat(s1), 1);
		f.registry.keepalive(stat(s2), 1);
		f.registry.process_report(s1, &[report(100, 5, 0, 10)], 2);
		f.plans.tick(now_msec());

		let done = f
			.plans
			.complete_replicate(100, s1, s2, false, BlockInfo {
				block_id: 100,
				version: 5,
				size: 10,
				..Default::default()
			});
		assert!(done.into_result().is_ok());
		assert_eq!(f.plans.plan_count(), 0);
		let bc = f.registry.block_collect(100).unwrap();
		assert_eq!(bc.replicas.len(), 2);
		assert!(bc.replicas.contains(&s2));
	}

	#[tokio::test]
	async fn test_complete_replicate_rejects_stale_version() {
		let f = fixture(true);
		let (s1, s2) = (server(1), server(2));
		f.registry.keepalive(stat(s1), 1);
		f.registry.keepalive(stat(s2), 1);
		f.registry.process_report(s1, &[report(100, 5, 0, 10)], 2);
		f.plans.tick(now_msec());

		let done = f
			.plans
			.complete_replicate(100, s1, s2, false, BlockInfo {
				block_id: 100,
				version: 3,
				..Default::default()
			});
		assert!(done.into_result().is_err());
		assert_eq!(f.registry.block_collect(100).unwrap().replicas.len(), 1);
	}

	#[tokio::test]
	async fn test_move_completion_drops_source_replica() {
		let f = fixture(true);
		let (s1, s2) = (server(1), server(2));
		f.registry.keepalive(stat(s1), 1);
		f.registry.keepalive(stat(s2), 1);
		f.registry.process_report(s1, &[report(100, 5, 0, 10)], 2);

		let done = f.plans.complete_replicate(100, s1, s2, true, BlockInfo {
			block_id: 100,
			version: 5,
			size: 10,
			..Default::default()
		});
		assert!(done.into_result().is_ok());
		let bc = f.registry.block_collect(100).unwrap();
		assert_eq!(bc.replicas, vec![s2]);
	}

	#[tokio::test]
	async fn test_zero_replica_block_is_dropped() {
		let f = fixture(true);
		let s1 = server(1);
		f.registry.keepalive(stat(s1), 1);
		f.registry.process_report(s1, &[report(100, 2, 0, 10)], 2);
		// the only holder stops reporting the block
		f.registry.process_report(s1, &[], 3);

		f.plans.tick(now_msec());
		assert!(f.registry.block_collect(100).is_none());
	}
}
