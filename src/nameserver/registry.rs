//! The block/server registry: who holds which block, placement scoring,
//! primary selection, and expire reconciliation

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;

use tfs_rpc::message::{BlockReport, DataserverStat, DsStatus};
use tfs_util::data::*;
use tfs_util::time::now_msec;

const BLOCK_SHARDS: usize = 16;

/// Coordinator-side state of one logical block
#[derive(Debug, Clone)]
pub struct BlockCollect {
	pub info: BlockInfo,
	/// Replica holders, sorted by server id; the primary is the first
	/// alive member
	pub replicas: Vec<ServerId>,
	pub create_time: u64,
	pub last_update: u64,
}

/// Coordinator-side state of one storage node
#[derive(Debug, Clone)]
pub struct ServerCollect {
	pub stat: DataserverStat,
	pub alive: bool,
	pub last_heartbeat: u64,
	/// 0 until the node has sent a full block report
	pub last_report: u64,
	pub dead_since: u64,
	pub hold: HashSet<BlockId>,
	pub hold_master: HashSet<BlockId>,
	pub need_report: bool,
}

/// What a full block report changed, for the caller to log and relay
#[derive(Debug, Default)]
pub struct ReportOutcome {
	/// Blocks the node holds but the registry does not assign to it
	pub expires: Vec<BlockId>,
	/// Blocks first seen in this report
	pub new_blocks: Vec<BlockId>,
}

pub struct Registry {
	block_shards: Vec<RwLock<HashMap<BlockId, BlockCollect>>>,
	servers: RwLock<HashMap<ServerId, ServerCollect>>,
	next_block_id: AtomicU32,
	replica_count: u32,
	max_write_block_size: u32,
}

impl Registry {
	pub fn new(replica_count: u32, max_write_block_size: u32) -> Self {
		Self {
			block_shards: (0..BLOCK_SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
			servers: RwLock::new(HashMap::new()),
			next_block_id: AtomicU32::new(1),
			replica_count,
			max_write_block_size,
		}
	}

	fn shard(&self, block_id: BlockId) -> &RwLock<HashMap<BlockId, BlockCollect>> {
		&self.block_shards[(block_id as usize) % BLOCK_SHARDS]
	}

	fn bump_block_id(&self, seen: BlockId) {
		let mut cur = self.next_block_id.load(Ordering::SeqCst);
		while seen >= cur {
			match self.next_block_id.compare_exchange(
				cur,
				seen + 1,
				Ordering::SeqCst,
				Ordering::SeqCst,
			) {
				Ok(_) => break,
				Err(now) => cur = now,
			}
		}
	}

	pub fn alloc_block_id(&self) -> BlockId {
		self.next_block_id.fetch_add(1, Ordering::SeqCst)
	}

	// ---- server liveness ----

	/// Record a heartbeat. Returns whether the node is new to the registry.
	pub fn keepalive(&self, stat: DataserverStat, now: u64) -> bool {
		let mut servers = self.servers.write().unwrap();
		match servers.get_mut(&stat.id) {
			Some(sc) => {
				let was_dead = !sc.alive;
				sc.stat = stat;
				sc.last_heartbeat = now;
				// a dead notice leaves the liveness transition to
				// mark_dead, which also releases the hold set
				if stat.status == DsStatus::Alive {
					sc.alive = true;
					sc.dead_since = 0;
					if was_dead {
						// a node coming back must re-report its blocks
						sc.need_report = true;
					}
				}
				false
			}
			None => {
				servers.insert(
					stat.id,
					ServerCollect {
						stat,
						alive: stat.status == DsStatus::Alive,
						last_heartbeat: now,
						last_report: 0,
						dead_since: 0,
						hold: HashSet::new(),
						hold_master: HashSet::new(),
						need_report: true,
					},
				);
				info!("Dataserver {} joined", server_str(stat.id));
				true
			}
		}
	}

	pub fn needs_report(&self, server_id: ServerId) -> bool {
		self.servers
			.read()
			.unwrap()
			.get(&server_id)
			.map(|sc| sc.need_report || sc.last_report == 0)
			.unwrap_or(true)
	}

	/// Make every node resend its block list (used after a failover)
	pub fn request_full_reports(&self) {
		for sc in self.servers.write().unwrap().values_mut() {
			sc.need_report = true;
		}
	}

	/// Mark a node dead and release its hold set.
	/// Returns the blocks that lost a replica.
	pub fn mark_dead(&self, server_id: ServerId, now: u64) -> Vec<BlockId> {
		let hold = {
			let mut servers = self.servers.write().unwrap();
			match servers.get_mut(&server_id) {
				Some(sc) => {
					sc.alive = false;
					sc.stat.status = DsStatus::Dead;
					if sc.dead_since == 0 {
						sc.dead_since = now;
					}
					sc.hold_master.clear();
					sc.hold.drain().collect::<Vec<_>>()
				}
				None => return vec![],
			}
		};
		let mut affected = vec![];
		for block_id in hold {
			let mut shard = self.shard(block_id).write().unwrap();
			if let Some(bc) = shard.get_mut(&block_id) {
				bc.replicas.retain(|s| *s != server_id);
				bc.last_update = now;
				affected.push(block_id);
			}
		}
		warn!(
			"Dataserver {} marked dead, {} blocks lost a replica",
			server_str(server_id),
			affected.len()
		);
		self.refresh_primaries(&affected);
		affected
	}

	/// Servers whose heartbeats stopped without a clean exit
	pub fn check_timeouts(&self, now: u64, dead_after: u64) -> Vec<ServerId> {
		let lapsed: Vec<ServerId> = {
			let servers = self.servers.read().unwrap();
			servers
				.values()
				.filter(|sc| sc.alive && now.saturating_sub(sc.last_heartbeat) > dead_after)
				.map(|sc| sc.stat.id)
				.collect()
		};
		for id in lapsed.iter() {
			self.mark_dead(*id, now);
		}
		lapsed
	}

	/// Forget dead servers past the grace interval
	pub fn clear_dead(&self, now: u64, clear_after: u64) -> Vec<ServerId> {
		let mut servers = self.servers.write().unwrap();
		let gone: Vec<ServerId> = servers
			.values()
			.filter(|sc| {
				!sc.alive && sc.dead_since > 0 && now.saturating_sub(sc.dead_since) > clear_after
			})
			.map(|sc| sc.stat.id)
			.collect();
		for id in gone.iter() {
			servers.remove(id);
			info!("Dataserver {} removed from registry", server_str(*id));
		}
		gone
	}

	// ---- block reports ----

	/// Reconcile a node's full block report against the registry
	pub fn process_report(
		&self,
		server_id: ServerId,
		reports: &[BlockReport],
		now: u64,
	) -> ReportOutcome {
		let mut outcome = ReportOutcome::default();
		let mut held = HashSet::new();
		let mut touched = vec![];

		for report in reports {
			let block_id = report.info.block_id;
			self.bump_block_id(block_id);
			let mut shard = self.shard(block_id).write().unwrap();

			if report.error {
				// drop the bad replica unless it is the only copy left
				match shard.get_mut(&block_id) {
					Some(bc) if bc.replicas.iter().any(|s| *s != server_id) => {
						bc.replicas.retain(|s| *s != server_id);
						bc.last_update = now;
						outcome.expires.push(block_id);
						touched.push(block_id);
						warn!(
							"Block {} on {} reported in error, replica dropped",
							block_id,
							server_str(server_id)
						);
						continue;
					}
					Some(_) => {
						warn!(
							"Block {} on {} reported in error but is the last copy",
							block_id,
							server_str(server_id)
						);
					}
					None => {
						// broken garbage the registry never knew about
						outcome.expires.push(block_id);
						continue;
					}
				}
			}

			match shard.get_mut(&block_id) {
				None => {
					shard.insert(
						block_id,
						BlockCollect {
							info: report.info,
							replicas: vec![server_id],
							create_time: now,
							last_update: now,
						},
					);
					outcome.new_blocks.push(block_id);
					held.insert(block_id);
					touched.push(block_id);
				}
				Some(bc) => {
					if bc.replicas.contains(&server_id) {
						if report.info.version >= bc.info.version {
							bc.info = report.info;
						}
						bc.last_update = now;
						held.insert(block_id);
					} else if (bc.replicas.len() as u32) < self.replica_count {
						bc.replicas.push(server_id);
						bc.replicas.sort_unstable();
						if report.info.version >= bc.info.version {
							bc.info = report.info;
						}
						bc.last_update = now;
						held.insert(block_id);
						touched.push(block_id);
					} else {
						// fully replicated elsewhere: the copy is an orphan
						outcome.expires.push(block_id);
					}
				}
			}
		}

		// blocks the registry assigned to this node that it stopped reporting
		let lost: Vec<BlockId> = {
			let servers = self.servers.read().unwrap();
			servers
				.get(&server_id)
				.map(|sc| sc.hold.difference(&held).cloned().collect())
				.unwrap_or_default()
		};
		for block_id in lost {
			let mut shard = self.shard(block_id).write().unwrap();
			if let Some(bc) = shard.get_mut(&block_id) {
				bc.replicas.retain(|s| *s != server_id);
				bc.last_update = now;
				touched.push(block_id);
				warn!(
					"Block {} no longer reported by {}",
					block_id,
					server_str(server_id)
				);
			}
		}

		{
			let mut servers = self.servers.write().unwrap();
			if let Some(sc) = servers.get_mut(&server_id) {
				sc.hold = held;
				sc.last_report = now;
				sc.need_report = false;
				sc.stat.block_count = sc.hold.len() as u32;
			}
		}
		self.refresh_primaries(&touched);
		outcome
	}

	/// Re-derive `hold_master` for the given blocks: the primary is the
	/// lowest-id alive replica
	fn refresh_primaries(&self, blocks: &[BlockId]) {
		let mut servers = self.servers.write().unwrap();
		for block_id in blocks {
			let replicas = {
				let shard = self.shard(*block_id).read().unwrap();
				match shard.get(block_id) {
					Some(bc) => bc.replicas.clone(),
					None => vec![],
				}
			};
			let primary = replicas
				.iter()
				.find(|s| servers.get(s).map(|sc| sc.alive).unwrap_or(false))
				.cloned();
			for sid in replicas {
				if let Some(sc) = servers.get_mut(&sid) {
					if Some(sid) == primary {
						sc.hold_master.insert(*block_id);
					} else {
						sc.hold_master.remove(block_id);
					}
				}
			}
		}
	}

	// ---- queries ----

	/// Replica set of a block, primary first, alive members only
	pub fn get_block(&self, block_id: BlockId) -> Option<(BlockInfo, Vec<ServerId>)> {
		let replicas = {
			let shard = self.shard(block_id).read().unwrap();
			let bc = shard.get(&block_id)?;
			(bc.info, bc.replicas.clone())
		};
		let (info, members) = replicas;
		let servers = self.servers.read().unwrap();
		let alive: Vec<ServerId> = members
			.into_iter()
			.filter(|s| servers.get(s).map(|sc| sc.alive).unwrap_or(false))
			.collect();
		Some((info, alive))
	}

	pub fn block_collect(&self, block_id: BlockId) -> Option<BlockCollect> {
		self.shard(block_id).read().unwrap().get(&block_id).cloned()
	}

	pub fn server_collect(&self, server_id: ServerId) -> Option<ServerCollect> {
		self.servers.read().unwrap().get(&server_id).cloned()
	}

	pub fn alive_servers(&self) -> Vec<ServerCollect> {
		self.servers
			.read()
			.unwrap()
			.values()
			.filter(|sc| sc.alive)
			.cloned()
			.collect()
	}

	pub fn block_count(&self) -> usize {
		self.block_shards
			.iter()
			.map(|s| s.read().unwrap().len())
			.sum()
	}

	pub fn all_blocks(&self) -> Vec<BlockCollect> {
		let mut out = vec![];
		for shard in self.block_shards.iter() {
			out.extend(shard.read().unwrap().values().cloned());
		}
		out
	}

	/// A block able to take one more file, fully replicated, primary first
	pub fn pick_write_block(&self) -> Option<(BlockId, Vec<ServerId>)> {
		let candidates: Vec<(u32, BlockId)> = {
			let mut out = vec![];
			for shard in self.block_shards.iter() {
				let shard = shard.read().unwrap();
				for bc in shard.values() {
					let fill = bc.info.size + bc.info.del_size;
					if fill < self.max_write_block_size
						&& bc.replicas.len() as u32 >= self.replica_count
					{
						out.push((fill, bc.info.block_id));
					}
				}
			}
			out
		};
		// least-filled first, deterministic on ties
		let mut candidates = candidates;
		candidates.sort_unstable();
		for (_, block_id) in candidates {
			if let Some((_, alive)) = self.get_block(block_id) {
				if alive.len() as u32 >= self.replica_count {
					let ordered = self.primary_first(block_id, alive);
					return Some((block_id, ordered));
				}
			}
		}
		None
	}

	fn primary_first(&self, block_id: BlockId, mut alive: Vec<ServerId>) -> Vec<ServerId> {
		let _ = block_id;
		// replicas are kept sorted; the primary is the lowest alive id
		alive.sort_unstable();
		alive
	}

	/// Rank a replication destination among alive servers.
	/// Scoring: free-capacity ratio, block count below average, rack
	/// diversity against the existing holders, load below average;
	/// ties break on server id.
	pub fn elect_target(&self, exclude: &[ServerId]) -> Option<ServerId> {
		let servers = self.alive_servers();
		let candidates: Vec<&ServerCollect> = servers
			.iter()
			.filter(|sc| !exclude.contains(&sc.stat.id))
			.collect();
		if candidates.is_empty() {
			return None;
		}
		let avg_blocks = candidates.iter().map(|sc| sc.stat.block_count as u64).sum::<u64>()
			/ candidates.len() as u64;
		let avg_load = candidates.iter().map(|sc| sc.stat.current_load as u64).sum::<u64>()
			/ candidates.len() as u64;
		let exclude_racks: HashSet<u32> = exclude.iter().map(|s| server_rack(*s)).collect();

		let mut best: Option<(&ServerCollect, (u64, bool, bool, bool))> = None;
		for sc in candidates {
			let free_ratio = if sc.stat.total_capacity == 0 {
				0
			} else {
				// per-mille, to stay in integer ordering
				(sc.stat.total_capacity - sc.stat.use_capacity.min(sc.stat.total_capacity))
					* 1000 / sc.stat.total_capacity
			};
			let key = (
				free_ratio,
				sc.stat.block_count as u64 <= avg_blocks,
				!exclude_racks.contains(&server_rack(sc.stat.id)),
				sc.stat.current_load as u64 <= avg_load,
			);
			let better = match &best {
				None => true,
				Some((cur, cur_key)) => {
					key > *cur_key || (key == *cur_key && sc.stat.id < cur.stat.id)
				}
			};
			if better {
				best = Some((sc, key));
			}
		}
		best.map(|(sc, _)| sc.stat.id)
	}

	// ---- mutations from plans and block creation ----

	/// Register a block the coordinator just created on `servers`
	pub fn add_block(&self, block_id: BlockId, servers: Vec<ServerId>, version: u32) {
		self.bump_block_id(block_id);
		let now = now_msec();
		let mut replicas = servers.clone();
		replicas.sort_unstable();
		self.shard(block_id).write().unwrap().insert(
			block_id,
			BlockCollect {
				info: BlockInfo {
					block_id,
					version,
					..Default::default()
				},
				replicas,
				create_time: now,
				last_update: now,
			},
		);
		{
			let mut smap = self.servers.write().unwrap();
			for sid in servers.iter() {
				if let Some(sc) = smap.get_mut(sid) {
					sc.hold.insert(block_id);
				}
			}
		}
		self.refresh_primaries(&[block_id]);
	}

	/// A replica finished transferring; admit it if its version is fresh
	pub fn add_replica(&self, block_id: BlockId, server_id: ServerId, info: BlockInfo) -> bool {
		{
			let mut shard = self.shard(block_id).write().unwrap();
			let bc = match shard.get_mut(&block_id) {
				Some(bc) => bc,
				None => return false,
			};
			if info.version < bc.info.version {
				warn!(
					"Replica of block {} on {} has stale version {} < {}",
					block_id,
					server_str(server_id),
					info.version,
					bc.info.version
				);
				return false;
			}
			bc.info = info;
			if !bc.replicas.contains(&server_id) {
				bc.replicas.push(server_id);
				bc.replicas.sort_unstable();
			}
			bc.last_update = now_msec();
		}
		{
			let mut servers = self.servers.write().unwrap();
			if let Some(sc) = servers.get_mut(&server_id) {
				sc.hold.insert(block_id);
			}
		}
		self.refresh_primaries(&[block_id]);
		true
	}

	pub fn remove_replica(&self, block_id: BlockId, server_id: ServerId) {
		{
			let mut shard = self.shard(block_id).write().unwrap();
			if let Some(bc) = shard.get_mut(&block_id) {
				bc.replicas.retain(|s| *s != server_id);
				bc.last_update = now_msec();
			}
		}
		{
			let mut servers = self.servers.write().unwrap();
			if let Some(sc) = servers.get_mut(&server_id) {
				sc.hold.remove(&block_id);
				sc.hold_master.remove(&block_id);
			}
		}
		self.refresh_primaries(&[block_id]);
	}

	/// Update the counters of a block (post-compaction)
	pub fn update_info(&self, block_id: BlockId, info: BlockInfo) {
		let mut shard = self.shard(block_id).write().unwrap();
		if let Some(bc) = shard.get_mut(&block_id) {
			if info.version >= bc.info.version {
				bc.info = info;
				bc.last_update = now_msec();
			}
		}
	}

	/// Drop a block with no replicas left
	pub fn remove_block(&self, block_id: BlockId) -> bool {
		let removed = self.shard(block_id).write().unwrap().remove(&block_id);
		if removed.is_some() {
			let mut servers = self.servers.write().unwrap();
			for sc in servers.values_mut() {
				sc.hold.remove(&block_id);
				sc.hold_master.remove(&block_id);
			}
			info!("Block {} dropped from registry", block_id);
		}
		removed.is_some()
	}

	/// Ensure a block exists (standby oplog replay)
	pub fn replay_block(&self, block_id: BlockId, version: u32) {
		self.bump_block_id(block_id);
		let mut shard = self.shard(block_id).write().unwrap();
		let now = now_msec();
		shard
			.entry(block_id)
			.and_modify(|bc| {
				if version > bc.info.version {
					bc.info.version = version;
				}
			})
			.or_insert_with(|| BlockCollect {
				info: BlockInfo {
					block_id,
					version,
					..Default::default()
				},
				replicas: vec![],
				create_time: now,
				last_update: now,
			});
	}

	pub fn replica_count(&self) -> u32 {
		self.replica_count
	}
}
