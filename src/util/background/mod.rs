//! Runner for long-lived background workers

pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use worker::{run_worker, Worker};

/// How long the supervisor waits for workers to finish at shutdown
/// before detaching the stragglers
const DRAIN_TIMEOUT: Duration = Duration::from_secs(8);

/// Runner for background workers: each service registers its periodic
/// and queue-draining tasks here. Every worker runs on its own task;
/// the runner's supervisor waits for all of them at shutdown.
pub struct BackgroundRunner {
	stop_signal: watch::Receiver<bool>,
	register: mpsc::UnboundedSender<(String, JoinHandle<()>)>,
}

impl BackgroundRunner {
	/// Create a new BackgroundRunner
	pub fn new(stop_signal: watch::Receiver<bool>) -> (Arc<Self>, JoinHandle<()>) {
		let (register, registered) = mpsc::unbounded_channel();

		let await_all_done = tokio::spawn(supervise(registered, stop_signal.clone()));

		let bgrunner = Arc::new(Self {
			stop_signal,
			register,
		});
		(bgrunner, await_all_done)
	}

	pub fn spawn_worker<W>(&self, worker: W)
	where
		W: Worker + 'static,
	{
		let name = worker.name();
		let handle = tokio::spawn(run_worker(Box::new(worker), self.stop_signal.clone()));
		self.register
			.send((name, handle))
			.ok()
			.expect("Could not register worker");
	}
}

/// Collect worker handles until shutdown, then join them under a
/// deadline
async fn supervise(
	mut registered: mpsc::UnboundedReceiver<(String, JoinHandle<()>)>,
	mut stop_signal: watch::Receiver<bool>,
) {
	let mut tasks: Vec<(String, JoinHandle<()>)> = vec![];
	while !*stop_signal.borrow() {
		select! {
			reg = registered.recv() => match reg {
				Some(task) => tasks.push(task),
				None => break,
			},
			res = stop_signal.changed() => {
				if res.is_err() {
					break;
				}
			}
		}
	}
	while let Ok(task) = registered.try_recv() {
		tasks.push(task);
	}

	let n = tasks.len();
	let drain = async {
		for (name, handle) in tasks {
			if let Err(e) = handle.await {
				warn!("Worker {} panicked: {}", name, e);
			}
		}
	};
	select! {
		_ = drain => {
			info!("All {} background workers exited", n);
		}
		_ = tokio::time::sleep(DRAIN_TIMEOUT) => {
			error!("Some background workers are still running at shutdown, detaching them");
		}
	}
}
