//! Heartbeat loop of a storage node: liveness every interval, the full
//! block report every Nth beat or on demand, and the clean dead notice
//! at shutdown

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;

use tfs_rpc::message::*;
use tfs_util::background::worker::{Worker, WorkerStatus};
use tfs_util::error::Error;

use crate::Dataserver;

const SWITCH_PROBE_AFTER: u32 = 3;

pub struct HeartbeatWorker {
	ds: Arc<Dataserver>,
	interval: Duration,
	next_beat: Instant,
	beat_count: u64,
	missed_beats: u32,
	dead_notice_sent: bool,
}

impl HeartbeatWorker {
	pub fn new(ds: Arc<Dataserver>) -> Self {
		let interval = Duration::from_millis(ds.config.dataserver.heartbeat_interval_msec);
		Self {
			ds,
			interval,
			next_beat: Instant::now(),
			beat_count: 0,
			missed_beats: 0,
			dead_notice_sent: false,
		}
	}

	fn stat(&self, status: DsStatus) -> DataserverStat {
		let fs = self.ds.store.stat_fs();
		DataserverStat {
			id: self.ds.server_id,
			use_capacity: fs.use_capacity,
			total_capacity: fs.total_capacity,
			current_load: self.ds.current_load(),
			block_count: fs.block_count,
			startup_time: self.ds.startup_time(),
			status,
		}
	}

	async fn beat(&mut self) -> Result<(), Error> {
		self.ds.sweep_leases().await;

		let report_due = self.beat_count
			% self.ds.config.dataserver.report_block_interval.max(1) as u64
			== 0;
		let blocks = if report_due || self.ds.need_report.load(Ordering::SeqCst) {
			self.ds.need_report.store(false, Ordering::SeqCst);
			Some(
				self.ds
					.store
					.report()
					.into_iter()
					.map(|(info, error)| BlockReport { info, error })
					.collect(),
			)
		} else {
			None
		};
		self.beat_count += 1;

		let msg = Message::Heartbeat {
			stat: self.stat(DsStatus::Alive),
			blocks,
		};
		let reply = self.ds.rpc.call(self.ds.ns_addr, &msg).await?;
		match reply {
			Message::HeartbeatResponse {
				status: HeartStatus::Ok,
				..
			} => (),
			Message::HeartbeatResponse {
				status: HeartStatus::NeedSendBlockInfo,
				..
			} => {
				self.ds.need_report.store(true, Ordering::SeqCst);
			}
			Message::HeartbeatResponse {
				status: HeartStatus::ExpireBlockId,
				expires,
				..
			} => {
				for block_id in expires {
					info!("Deleting expired block {}", block_id);
					if let Err(e) = self.ds.blocking(move |s| s.remove(block_id)).await {
						warn!("Could not delete expired block {}: {}", block_id, e);
					}
				}
				self.ds.need_report.store(true, Ordering::SeqCst);
			}
			Message::HeartbeatResponse {
				status: HeartStatus::Error,
				msg,
				..
			} => {
				debug!(
					"Heartbeat rejected: {}",
					msg.unwrap_or_else(|| "(no reason)".into())
				);
			}
			m => return Err(Error::unexpected_message(m)),
		}
		Ok(())
	}

	async fn send_dead_notice(&mut self) {
		if self.dead_notice_sent {
			return;
		}
		self.dead_notice_sent = true;
		let msg = Message::Heartbeat {
			stat: self.stat(DsStatus::Dead),
			blocks: None,
		};
		match self.ds.rpc.call(self.ds.ns_addr, &msg).await {
			Ok(_) => info!("Sent dead notice to nameserver"),
			Err(e) => warn!("Could not send dead notice: {}", e),
		}
	}
}

#[async_trait]
impl Worker for HeartbeatWorker {
	fn name(&self) -> String {
		"Dataserver heartbeat".into()
	}

	async fn work(&mut self, must_exit: &mut watch::Receiver<bool>) -> Result<WorkerStatus, Error> {
		if *must_exit.borrow() {
			self.send_dead_notice().await;
			return Ok(WorkerStatus::Done);
		}
		// a missed beat is routine while the nameserver fails over
		match self.beat().await {
			Ok(()) => self.missed_beats = 0,
			Err(e) => {
				debug!("Heartbeat failed: {}", e);
				self.missed_beats += 1;
				if self.missed_beats >= SWITCH_PROBE_AFTER {
					// whoever answers on the vip now should check its role
					self.missed_beats = 0;
					let probe = Message::NsSwitchProbe { switch_hint: true };
					if let Err(e) = self.ds.rpc.call(self.ds.ns_addr, &probe).await {
						debug!("Switch probe failed: {}", e);
					}
				}
			}
		}
		Ok(WorkerStatus::Idle)
	}

	async fn wait_for_work(&mut self, _must_exit: &watch::Receiver<bool>) -> WorkerStatus {
		tokio::time::sleep_until(self.next_beat.into()).await;
		self.next_beat = Instant::now() + self.interval;
		WorkerStatus::Busy
	}
}
