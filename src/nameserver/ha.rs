//! Active/standby arbitration over a floating VIP: runtime role state,
//! the three periodic tasks that maintain it, and the peer heartbeat
//! handler

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Notify};

use tfs_rpc::message::{Message, NsRole, NsStatus};
use tfs_rpc::vip::VipResolver;
use tfs_rpc::RpcHelper;
use tfs_util::background::worker::{Worker, WorkerStatus};
use tfs_util::data::{server_str, ServerId};
use tfs_util::error::Error;
use tfs_util::time::now_msec;

use crate::plan::PlanEngine;
use crate::registry::Registry;

const FORCE_MODIFY_RETRY: usize = 3;
const PEER_HEART_RETRY: usize = 3;

/// Whether mutations may be streamed to the standby right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SyncOplogFlag {
	None,
	No,
	Ready,
	Yes,
}

#[derive(Debug, Clone, Copy)]
pub struct NsState {
	pub owner_role: NsRole,
	pub owner_status: NsStatus,
	pub other_side_role: NsRole,
	pub other_side_status: NsStatus,
	pub sync_oplog_flag: SyncOplogFlag,
	/// End of the safe-mode window (msec since epoch)
	pub switch_time: u64,
}

/// Global runtime information of one nameserver process. Every
/// multi-field transition happens under the single mutex.
pub struct NsRuntime {
	state: Mutex<NsState>,
	vip: Arc<dyn VipResolver>,
	pub owner_ip_port: ServerId,
	pub peer_addr: Option<SocketAddr>,
	safe_mode: Duration,
	/// Wakes the oplog sender when the sync flag advances to yes
	pub oplog_notify: Arc<Notify>,
}

impl NsRuntime {
	pub fn new(
		owner_ip_port: ServerId,
		peer_addr: Option<SocketAddr>,
		vip: Arc<dyn VipResolver>,
		safe_mode: Duration,
	) -> Self {
		let is_master = vip.is_local();
		let state = NsState {
			owner_role: if is_master { NsRole::Master } else { NsRole::Slave },
			owner_status: NsStatus::AcceptDsInfo,
			other_side_role: if is_master { NsRole::Slave } else { NsRole::Master },
			other_side_status: NsStatus::Uninitialized,
			sync_oplog_flag: if peer_addr.is_some() {
				SyncOplogFlag::No
			} else {
				SyncOplogFlag::None
			},
			// boot counts as a switch: give dataservers time to report
			switch_time: now_msec() + safe_mode.as_millis() as u64,
		};
		info!(
			"Starting as {} (vip {})",
			if is_master { "master" } else { "slave" },
			if is_master { "local" } else { "remote" }
		);
		Self {
			state: Mutex::new(state),
			vip,
			owner_ip_port,
			peer_addr,
			safe_mode,
			oplog_notify: Arc::new(Notify::new()),
		}
	}

	pub fn snapshot(&self) -> NsState {
		*self.state.lock().unwrap()
	}

	pub fn is_master(&self) -> bool {
		self.state.lock().unwrap().owner_role == NsRole::Master
	}

	pub fn in_safe_mode(&self) -> bool {
		now_msec() < self.state.lock().unwrap().switch_time
	}

	pub fn vip_is_local(&self) -> bool {
		self.vip.is_local()
	}

	pub fn sync_flag(&self) -> SyncOplogFlag {
		self.state.lock().unwrap().sync_oplog_flag
	}

	pub fn set_initialized(&self) {
		self.state.lock().unwrap().owner_status = NsStatus::Initialized;
	}

	/// Become master. Safe mode starts, the caller destroys plans.
	pub fn promote(&self, peer_status: NsStatus, sync: SyncOplogFlag) {
		let mut state = self.state.lock().unwrap();
		state.owner_role = NsRole::Master;
		state.other_side_role = NsRole::Slave;
		state.other_side_status = peer_status;
		state.sync_oplog_flag = sync;
		state.switch_time = now_msec() + self.safe_mode.as_millis() as u64;
		if sync == SyncOplogFlag::Yes {
			self.oplog_notify.notify_waiters();
		}
	}

	/// Step down. Safe mode starts, the caller destroys plans.
	pub fn demote(&self) {
		let mut state = self.state.lock().unwrap();
		state.owner_role = NsRole::Slave;
		state.other_side_role = NsRole::Master;
		state.sync_oplog_flag = SyncOplogFlag::No;
		state.switch_time = now_msec() + self.safe_mode.as_millis() as u64;
	}

	/// The peer ordered a role; take it. Returns true when the role
	/// actually changed.
	pub fn apply_forced_role(&self, role: NsRole, peer_status: NsStatus) -> bool {
		let mut state = self.state.lock().unwrap();
		if state.owner_role == role {
			return false;
		}
		state.owner_role = role;
		state.other_side_role = match role {
			NsRole::Master => NsRole::Slave,
			NsRole::Slave => NsRole::Master,
		};
		state.other_side_status = peer_status;
		state.sync_oplog_flag = match role {
			NsRole::Master => SyncOplogFlag::Yes,
			NsRole::Slave => SyncOplogFlag::No,
		};
		state.switch_time = now_msec() + self.safe_mode.as_millis() as u64;
		if state.sync_oplog_flag == SyncOplogFlag::Yes {
			self.oplog_notify.notify_waiters();
		}
		true
	}

	/// Track the peer's status; as master, advance the sync flag when the
	/// peer becomes able to receive the stream
	pub fn update_peer_status(&self, status: NsStatus) {
		let mut state = self.state.lock().unwrap();
		state.other_side_status = status;
		if state.owner_role == NsRole::Master {
			if status == NsStatus::Initialized && state.sync_oplog_flag < SyncOplogFlag::Yes {
				state.sync_oplog_flag = SyncOplogFlag::Yes;
				self.oplog_notify.notify_waiters();
				info!("Peer initialized, oplog sync enabled");
			} else if status >= NsStatus::AcceptDsInfo
				&& state.sync_oplog_flag < SyncOplogFlag::Ready
			{
				state.sync_oplog_flag = SyncOplogFlag::Ready;
			}
		}
	}

	/// Master-side conclusion after repeated peer heartbeat failures
	pub fn peer_dead_as_master(&self) {
		let mut state = self.state.lock().unwrap();
		state.sync_oplog_flag = SyncOplogFlag::No;
		state.other_side_status = NsStatus::Uninitialized;
	}

	pub fn set_peer_status(&self, status: NsStatus) {
		self.state.lock().unwrap().other_side_status = status;
	}
}

fn heartbeat_message(runtime: &NsRuntime, force: bool) -> Message {
	let state = runtime.snapshot();
	Message::NsHeartbeat {
		ip_port: runtime.owner_ip_port,
		role: if force {
			// a forced message carries the role the PEER must take
			NsRole::Slave
		} else {
			state.owner_role
		},
		status: state.owner_status,
		force,
	}
}

/// Promote with full side effects: destroy plans, ask every dataserver
/// for a fresh report
fn do_promote(
	runtime: &NsRuntime,
	plans: &PlanEngine,
	registry: &Registry,
	peer_status: NsStatus,
	sync: SyncOplogFlag,
) {
	warn!(
		"The master ns is gone, {} is taking over",
		server_str(runtime.owner_ip_port)
	);
	runtime.promote(peer_status, sync);
	plans.destroy_plans();
	registry.request_full_reports();
}

fn do_demote(runtime: &NsRuntime, plans: &PlanEngine) {
	warn!("Lost the vip, stepping down to slave");
	runtime.demote();
	plans.destroy_plans();
}

/// Handle a heartbeat from the peer nameserver (both roles)
pub fn handle_peer_heartbeat(
	runtime: &NsRuntime,
	plans: &PlanEngine,
	msg_role: NsRole,
	msg_status: NsStatus,
	force: bool,
) -> Message {
	let my_role = runtime.snapshot().owner_role;
	if force && msg_role != my_role {
		info!("Peer forces role change to {:?}", msg_role);
		if runtime.apply_forced_role(msg_role, msg_status) && msg_role == NsRole::Slave {
			plans.destroy_plans();
		}
	} else {
		match (my_role, msg_role) {
			(NsRole::Master, NsRole::Slave) | (NsRole::Slave, NsRole::Master) => {
				runtime.update_peer_status(msg_status);
			}
			_ => {
				// both sides claim the same role; the check-role task
				// arbitrates against the vip
				warn!(
					"Role conflict in peer heartbeat: own {:?}, peer {:?}",
					my_role, msg_role
				);
			}
		}
	}
	let state = runtime.snapshot();
	Message::NsHeartbeatResponse {
		ip_port: runtime.owner_ip_port,
		role: state.owner_role,
		status: state.owner_status,
	}
}

/// Force the peer into the slave role, with a bounded retry
async fn force_modify_peer(runtime: &NsRuntime, rpc: &RpcHelper) {
	let peer = match runtime.peer_addr {
		Some(p) => p,
		None => return,
	};
	for _ in 0..FORCE_MODIFY_RETRY {
		match rpc.call(peer, &heartbeat_message(runtime, true)).await {
			Ok(Message::NsHeartbeatResponse { role, status, .. }) => {
				if role == NsRole::Slave {
					runtime.update_peer_status(status);
					return;
				}
			}
			Ok(_) | Err(_) => (),
		}
	}
	warn!("Could not force peer {} into the slave role", peer);
}

/// Periodic task arbitrating the role against the vip
pub struct CheckRoleWorker {
	pub runtime: Arc<NsRuntime>,
	pub plans: Arc<PlanEngine>,
	pub registry: Arc<Registry>,
	pub rpc: RpcHelper,
	pub interval: Duration,
}

#[async_trait]
impl Worker for CheckRoleWorker {
	fn name(&self) -> String {
		"NS role check".into()
	}

	async fn work(&mut self, _must_exit: &mut watch::Receiver<bool>) -> Result<WorkerStatus, Error> {
		let vip_local = self.runtime.vip_is_local();
		let state = self.runtime.snapshot();

		if !vip_local {
			if state.owner_role == NsRole::Master {
				do_demote(&self.runtime, &self.plans);
			}
			return Ok(WorkerStatus::Idle);
		}

		match state.owner_role {
			NsRole::Master => {
				if state.other_side_role == NsRole::Master {
					// I hold the vip: the peer must yield
					force_modify_peer(&self.runtime, &self.rpc).await;
				}
			}
			NsRole::Slave => {
				self.check_when_slave_hold_vip().await;
			}
		}
		Ok(WorkerStatus::Idle)
	}

	async fn wait_for_work(&mut self, _must_exit: &watch::Receiver<bool>) -> WorkerStatus {
		tokio::time::sleep(self.interval).await;
		WorkerStatus::Busy
	}
}

impl CheckRoleWorker {
	/// I hold the vip but believe I am slave: poll the peer before
	/// promoting, to avoid a split brain
	async fn check_when_slave_hold_vip(&self) {
		let peer = match self.runtime.peer_addr {
			Some(p) => p,
			None => {
				do_promote(
					&self.runtime,
					&self.plans,
					&self.registry,
					NsStatus::OtherSideDead,
					SyncOplogFlag::None,
				);
				return;
			}
		};
		match self
			.rpc
			.call(peer, &heartbeat_message(&self.runtime, false))
			.await
		{
			Err(_) => {
				// peer unreachable: presumed dead
				do_promote(
					&self.runtime,
					&self.plans,
					&self.registry,
					NsStatus::OtherSideDead,
					SyncOplogFlag::No,
				);
			}
			Ok(Message::NsHeartbeatResponse { role, status, .. }) => {
				if role == NsRole::Slave {
					let sync = if status == NsStatus::Initialized {
						SyncOplogFlag::Yes
					} else {
						SyncOplogFlag::No
					};
					do_promote(&self.runtime, &self.plans, &self.registry, status, sync);
				} else if self.runtime.vip_is_local() {
					// peer still claims master while the vip is here
					do_promote(
						&self.runtime,
						&self.plans,
						&self.registry,
						status,
						SyncOplogFlag::Yes,
					);
					force_modify_peer(&self.runtime, &self.rpc).await;
				}
			}
			Ok(m) => {
				warn!("Unexpected reply to ns heartbeat: {:?}", m);
			}
		}
	}
}

/// Master-side peer heartbeat task
pub struct MasterHeartWorker {
	pub runtime: Arc<NsRuntime>,
	pub rpc: RpcHelper,
	pub interval: Duration,
}

#[async_trait]
impl Worker for MasterHeartWorker {
	fn name(&self) -> String {
		"NS master heart".into()
	}

	async fn work(&mut self, _must_exit: &mut watch::Receiver<bool>) -> Result<WorkerStatus, Error> {
		let state = self.runtime.snapshot();
		if state.owner_role != NsRole::Master || state.owner_status != NsStatus::Initialized {
			return Ok(WorkerStatus::Idle);
		}
		let peer = match self.runtime.peer_addr {
			Some(p) => p,
			None => return Ok(WorkerStatus::Done),
		};

		for _ in 0..PEER_HEART_RETRY {
			match self
				.rpc
				.call(peer, &heartbeat_message(&self.runtime, false))
				.await
			{
				Ok(Message::NsHeartbeatResponse {
					role: NsRole::Slave,
					status,
					..
				}) => {
					self.runtime.update_peer_status(status);
					return Ok(WorkerStatus::Idle);
				}
				Ok(Message::NsHeartbeatResponse { role, .. }) => {
					warn!(
						"Peer heartbeat role mismatch: own master, peer {:?}",
						role
					);
				}
				Ok(_) | Err(_) => (),
			}
		}

		warn!("Slave {} presumed dead", peer);
		self.runtime.peer_dead_as_master();
		Ok(WorkerStatus::Idle)
	}

	async fn wait_for_work(&mut self, _must_exit: &watch::Receiver<bool>) -> WorkerStatus {
		tokio::time::sleep(self.interval).await;
		WorkerStatus::Busy
	}
}

/// Slave-side heartbeat task of the standby nameserver
pub struct SlaveHeartWorker {
	pub runtime: Arc<NsRuntime>,
	pub plans: Arc<PlanEngine>,
	pub registry: Arc<Registry>,
	pub rpc: RpcHelper,
	pub interval: Duration,
}

#[async_trait]
impl Worker for SlaveHeartWorker {
	fn name(&self) -> String {
		"NS slave heart".into()
	}

	async fn work(&mut self, _must_exit: &mut watch::Receiver<bool>) -> Result<WorkerStatus, Error> {
		let state = self.runtime.snapshot();
		if state.owner_role != NsRole::Slave || state.owner_status != NsStatus::Initialized {
			return Ok(WorkerStatus::Idle);
		}
		let peer = match self.runtime.peer_addr {
			Some(p) => p,
			None => return Ok(WorkerStatus::Done),
		};

		for _ in 0..PEER_HEART_RETRY {
			match self
				.rpc
				.call(peer, &heartbeat_message(&self.runtime, false))
				.await
			{
				Ok(Message::NsHeartbeatResponse {
					role: NsRole::Master,
					status,
					..
				}) => {
					self.runtime.set_peer_status(status);
					return Ok(WorkerStatus::Idle);
				}
				Ok(Message::NsHeartbeatResponse { role, .. }) => {
					warn!(
						"Peer heartbeat role mismatch: own slave, peer {:?}",
						role
					);
				}
				Ok(_) | Err(_) => (),
			}
			// a failed master with the vip already here: take over now
			if self.runtime.vip_is_local() {
				do_promote(
					&self.runtime,
					&self.plans,
					&self.registry,
					NsStatus::OtherSideDead,
					SyncOplogFlag::No,
				);
				return Ok(WorkerStatus::Idle);
			}
		}

		self.runtime.set_peer_status(NsStatus::OtherSideDead);
		if self.runtime.vip_is_local() {
			do_promote(
				&self.runtime,
				&self.plans,
				&self.registry,
				NsStatus::OtherSideDead,
				SyncOplogFlag::No,
			);
		}
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
	use tfs_rpc::vip::StaticVipResolver;
	use tfs_util::config::NsConfig;

	use crate::oplog::OplogManager;
	use crate::plan::PlanEngine;

	fn runtime_with_vip(local: bool, safe_mode_sec: u64) -> (Arc<NsRuntime>, Arc<StaticVipResolver>) {
		let vip = Arc::new(StaticVipResolver::new(local));
		let runtime = Arc::new(NsRuntime::new(
			42,
			None,
			vip.clone(),
			Duration::from_secs(safe_mode_sec),
		));
		(runtime, vip)
	}

	fn engine(runtime: &Arc<NsRuntime>, dir: &std::path::Path) -> (Arc<PlanEngine>, Arc<Registry>) {
		let registry = Arc::new(Registry::new(2, 1 << 20));
		let oplog = Arc::new(OplogManager::open(dir, true, 1 << 20, 16).unwrap());
		let plans = PlanEngine::new(
			registry.clone(),
			runtime.clone(),
			oplog,
			RpcHelper::new(100, 0),
			&NsConfig::default(),
		);
		(plans, registry)
	}

	#[test]
	fn test_boot_role_follows_vip() {
		let (master, _) = runtime_with_vip(true, 300);
		assert!(master.is_master());
		assert!(master.in_safe_mode());

		let (slave, _) = runtime_with_vip(false, 300);
		assert!(!slave.is_master());
	}

	#[test]
	fn test_sync_flag_follows_peer_status() {
		let (runtime, _) = runtime_with_vip(true, 0);
		assert_ne!(runtime.sync_flag(), SyncOplogFlag::Yes);

		runtime.update_peer_status(NsStatus::AcceptDsInfo);
		assert_eq!(runtime.sync_flag(), SyncOplogFlag::Ready);

		runtime.update_peer_status(NsStatus::Initialized);
		assert_eq!(runtime.sync_flag(), SyncOplogFlag::Yes);

		// peer death resets the flag
		runtime.peer_dead_as_master();
		assert_eq!(runtime.sync_flag(), SyncOplogFlag::No);
		assert_eq!(runtime.snapshot().other_side_status, NsStatus::Uninitialized);
	}

	#[test]
	fn test_forced_role_change() {
		let (runtime, _) = runtime_with_vip(true, 0);
		assert!(runtime.is_master());
		assert!(runtime.apply_forced_role(NsRole::Slave, NsStatus::Initialized));
		assert!(!runtime.is_master());
		assert_eq!(runtime.sync_flag(), SyncOplogFlag::No);
		assert!(runtime.in_safe_mode());
		// idempotent
		assert!(!runtime.apply_forced_role(NsRole::Slave, NsStatus::Initialized));
	}

	#[tokio::test]
	async fn test_master_demotes_on_vip_loss() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let (runtime, vip) = runtime_with_vip(true, 0);
		let (plans, registry) = engine(&runtime, &tmp.to_path_buf());
		assert!(runtime.is_master());

		vip.set_local(false);
		let mut worker = CheckRoleWorker {
			runtime: runtime.clone(),
			plans,
			registry,
			rpc: RpcHelper::new(100, 0),
			interval: Duration::from_millis(10),
		};
		let (_tx, mut must_exit) = watch::channel(false);
		worker.work(&mut must_exit).await.unwrap();

		assert!(!runtime.is_master());
		assert!(runtime.in_safe_mode());
	}

	#[tokio::test]
	async fn test_slave_with_vip_and_no_peer_promotes() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let (runtime, vip) = runtime_with_vip(false, 0);
		let (plans, registry) = engine(&runtime, &tmp.to_path_buf());
		assert!(!runtime.is_master());

		vip.set_local(true);
		let mut worker = CheckRoleWorker {
			runtime: runtime.clone(),
			plans: plans.clone(),
			registry,
			rpc: RpcHelper::new(100, 0),
			interval: Duration::from_millis(10),
		};
		let (_tx, mut must_exit) = watch::channel(false);
		worker.work(&mut must_exit).await.unwrap();

		assert!(runtime.is_master());
		assert!(runtime.in_safe_mode());
		assert_eq!(plans.plan_count(), 0);
	}

	#[test]
	fn test_peer_heartbeat_updates_status() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let (runtime, _) = runtime_with_vip(true, 0);
		let (plans, _) = engine(&runtime, &tmp.to_path_buf());

		let reply = handle_peer_heartbeat(
			&runtime,
			&plans,
			NsRole::Slave,
			NsStatus::Initialized,
			false,
		);
		match reply {
			Message::NsHeartbeatResponse { role, .. } => assert_eq!(role, NsRole::Master),
			m => panic!("unexpected reply {:?}", m),
		}
		assert_eq!(runtime.sync_flag(), SyncOplogFlag::Yes);

		// a forced demand flips the role
		handle_peer_heartbeat(&runtime, &plans, NsRole::Slave, NsStatus::Initialized, true)
			.into_result()
			.ok();
		// (reply is a heartbeat response, not a status; just check state)
		assert!(!runtime.is_master());
	}
}
