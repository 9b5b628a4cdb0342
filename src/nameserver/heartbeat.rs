//! Heartbeat ingestion: a worker pool behind an admission-controlled
//! queue. Ordinary liveness beats are bounded and answered "busy" when
//! the pool is behind; dead notices and block reports are never dropped.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch, Mutex};

use tfs_rpc::message::{BlockReport, DataserverStat, DsStatus, HeartStatus, Message};
use tfs_util::background::worker::{Worker, WorkerStatus};
use tfs_util::config::NsConfig;
use tfs_util::data::server_str;
use tfs_util::error::Error;
use tfs_util::time::now_msec;

use crate::ha::NsRuntime;
use crate::oplog::{OpKind, OplogManager};
use crate::registry::Registry;

pub struct HeartTask {
	pub stat: DataserverStat,
	pub blocks: Option<Vec<BlockReport>>,
	pub from: SocketAddr,
	pub reply: oneshot::Sender<Message>,
	normal: bool,
}

pub struct HeartManager {
	tx: mpsc::UnboundedSender<HeartTask>,
	rx: Arc<Mutex<mpsc::UnboundedReceiver<HeartTask>>>,
	queued_normal: Arc<AtomicUsize>,
	max_queue_size: usize,
	registry: Arc<Registry>,
	runtime: Arc<NsRuntime>,
	oplog: Arc<OplogManager>,
}

impl HeartManager {
	pub fn new(
		registry: Arc<Registry>,
		runtime: Arc<NsRuntime>,
		oplog: Arc<OplogManager>,
		cfg: &NsConfig,
	) -> Arc<Self> {
		let (tx, rx) = mpsc::unbounded_channel();
		Arc::new(Self {
			tx,
			rx: Arc::new(Mutex::new(rx)),
			queued_normal: Arc::new(AtomicUsize::new(0)),
			max_queue_size: cfg.max_queue_size,
			registry,
			runtime,
			oplog,
		})
	}

	pub fn spawn_workers(self: &Arc<Self>, bg: &tfs_util::background::BackgroundRunner, count: usize) {
		for index in 0..count {
			bg.spawn_worker(HeartWorker {
				index,
				manager: self.clone(),
				next_task: None,
			});
		}
	}

	/// Admit a heartbeat. The future resolves with the reply message;
	/// an over-full queue answers immediately with the busy error.
	pub async fn push(
		&self,
		stat: DataserverStat,
		blocks: Option<Vec<BlockReport>>,
		from: SocketAddr,
	) -> Message {
		// dead notices and block reports bypass the bound
		let normal = stat.status == DsStatus::Alive && blocks.is_none();
		if normal {
			let queued = self.queued_normal.fetch_add(1, Ordering::SeqCst);
			if queued >= self.max_queue_size {
				self.queued_normal.fetch_sub(1, Ordering::SeqCst);
				warn!(
					"Heartbeat queue full, rejecting beat from {}",
					server_str(stat.id)
				);
				return Message::HeartbeatResponse {
					status: HeartStatus::Error,
					expires: vec![],
					msg: Some(format!(
						"nameserver heartbeat busy! cannot accept this request from: {}",
						from
					)),
				};
			}
		}

		let (reply_tx, reply_rx) = oneshot::channel();
		let task = HeartTask {
			stat,
			blocks,
			from,
			reply: reply_tx,
			normal,
		};
		if self.tx.send(task).is_err() {
			return Message::HeartbeatResponse {
				status: HeartStatus::Error,
				expires: vec![],
				msg: Some("nameserver is shutting down".into()),
			};
		}
		match reply_rx.await {
			Ok(msg) => msg,
			Err(_) => Message::HeartbeatResponse {
				status: HeartStatus::Error,
				expires: vec![],
				msg: Some("heartbeat processing aborted".into()),
			},
		}
	}

	/// Process one heartbeat against the registry
	fn process(&self, stat: DataserverStat, blocks: Option<Vec<BlockReport>>) -> Message {
		let now = now_msec();
		let is_new = self.registry.keepalive(stat, now);

		if stat.status == DsStatus::Dead {
			// clean exit: release the hold set at once, accept and forget
			let affected = self.registry.mark_dead(stat.id, now);
			info!(
				"Dataserver {} exit ({} blocks affected)",
				server_str(stat.id),
				affected.len()
			);
			return Message::HeartbeatResponse {
				status: HeartStatus::Ok,
				expires: vec![],
				msg: None,
			};
		}

		if let Some(reports) = blocks {
			let outcome = self.registry.process_report(stat.id, &reports, now);
			if self.runtime.is_master() {
				for block_id in outcome.new_blocks.iter() {
					let version = self
						.registry
						.block_collect(*block_id)
						.map(|bc| bc.info.version)
						.unwrap_or(0);
					if let Err(e) = self.oplog.append(OpKind::Insert, *block_id, 0, version) {
						error!("Oplog append failed: {}", e);
					}
				}
			}
			if outcome.expires.is_empty() {
				Message::HeartbeatResponse {
					status: HeartStatus::Ok,
					expires: vec![],
					msg: None,
				}
			} else {
				Message::HeartbeatResponse {
					status: HeartStatus::ExpireBlockId,
					expires: outcome.expires,
					msg: None,
				}
			}
		} else {
			let need = is_new || self.registry.needs_report(stat.id);
			Message::HeartbeatResponse {
				status: if need {
					HeartStatus::NeedSendBlockInfo
				} else {
					HeartStatus::Ok
				},
				expires: vec![],
				msg: None,
			}
		}
	}
}

/// One member of the ingestion pool
struct HeartWorker {
	index: usize,
	manager: Arc<HeartManager>,
	next_task: Option<HeartTask>,
}

#[async_trait]
impl Worker for HeartWorker {
	fn name(&self) -> String {
		format!("Heartbeat worker #{}", self.index)
	}

	async fn work(&mut self, _must_exit: &mut watch::Receiver<bool>) -> Result<WorkerStatus, Error> {
		match self.next_task.take() {
			None => Ok(WorkerStatus::Idle),
			Some(task) => {
				if task.normal {
					self.manager.queued_normal.fetch_sub(1, Ordering::SeqCst);
				}
				let reply = self.manager.process(task.stat, task.blocks);
				let _ = task.reply.send(reply);
				Ok(WorkerStatus::Busy)
			}
		}
	}

	async fn wait_for_work(&mut self, _must_exit: &watch::Receiver<bool>) -> WorkerStatus {
		match self.manager.rx.lock().await.recv().await {
			Some(task) => {
				self.next_task = Some(task);
				WorkerStatus::Busy
			}
			None => WorkerStatus::Done,
		}
	}
}

/// Liveness sweeper: detects silent deaths and forgets long-dead nodes
pub struct GcWorker {
	pub registry: Arc<Registry>,
	pub interval: Duration,
	pub ds_dead_msec: u64,
	pub ds_clear_msec: u64,
}

#[async_trait]
impl Worker for GcWorker {
	fn name(&self) -> String {
		"Registry GC".into()
	}

	async fn work(&mut self, _must_exit: &mut watch::Receiver<bool>) -> Result<WorkerStatus, Error> {
		let now = now_msec();
		for id in self.registry.check_timeouts(now, self.ds_dead_msec) {
			warn!("Dataserver {} missed heartbeats, marked dead", server_str(id));
		}
		self.registry.clear_dead(now, self.ds_clear_msec);
		Ok(WorkerStatus::Idle)
	}

	async fn wait_for_work(&mut self, _must_exit: &watch::Receiver<bool>) -> WorkerStatus {
		tokio::time::sleep(self.interval).await;
		WorkerStatus::Busy
	}
}
