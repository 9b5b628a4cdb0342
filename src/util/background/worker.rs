use std::time::Duration;

use async_trait::async_trait;
use tokio::select;
use tokio::sync::watch;

use crate::error::Error;

/// Grace given to an idle worker at shutdown to claim one last unit of
/// work (a dataserver uses it to send its dead notice)
const EXIT_GRACE: Duration = Duration::from_secs(3);
/// Pause after a failed work unit so a persistent error cannot spin
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

#[derive(PartialEq, Copy, Clone, Debug)]
pub enum WorkerStatus {
	Busy,
	Idle,
	Done,
}

#[async_trait]
pub trait Worker: Send {
	fn name(&self) -> String;

	/// Do one unit of work, if one is available (otherwise, return
	/// WorkerStatus::Idle immediately). Runs to completion even during
	/// shutdown; an error is logged and work() retried after a pause.
	async fn work(&mut self, must_exit: &mut watch::Receiver<bool>) -> Result<WorkerStatus, Error>;

	/// Await the next unit of work. May be dropped at any point; the
	/// runner races it against the stop signal.
	async fn wait_for_work(&mut self, must_exit: &watch::Receiver<bool>) -> WorkerStatus;
}

/// Drive one worker until it is done or the process shuts down.
/// Each worker runs on its own task; the runner only supervises.
pub(crate) async fn run_worker(mut worker: Box<dyn Worker>, mut must_exit: watch::Receiver<bool>) {
	// the wait future reads the signal while the loop races .changed()
	let worker_exit = must_exit.clone();
	let name = worker.name();
	let mut status = WorkerStatus::Busy;

	loop {
		match status {
			WorkerStatus::Busy => match worker.work(&mut must_exit).await {
				Ok(s) => status = s,
				Err(e) => {
					error!("Error in worker {}: {}", name, e);
					select! {
						_ = tokio::time::sleep(ERROR_BACKOFF) => (),
						_ = must_exit.changed() => (),
					}
				}
			},
			WorkerStatus::Idle if *must_exit.borrow() => {
				// shutting down: a bounded window for one last unit
				select! {
					s = worker.wait_for_work(&worker_exit) => status = s,
					_ = tokio::time::sleep(EXIT_GRACE) => break,
				}
			}
			WorkerStatus::Idle => {
				select! {
					s = worker.wait_for_work(&worker_exit) => status = s,
					res = must_exit.changed() => {
						// a dropped stop channel counts as a stop signal
						if res.is_err() {
							break;
						}
					}
				}
			}
			WorkerStatus::Done => break,
		}
	}
	info!("Worker {} exited", name);
}
