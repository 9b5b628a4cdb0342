//! Server startup and shutdown wiring, shared by both roles

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;

use tfs_dataserver::Dataserver;
use tfs_nameserver::Nameserver;
use tfs_rpc::server::run_server;
use tfs_rpc::vip::{NetVipResolver, StaticVipResolver, VipResolver};
use tfs_store::BlockStore;
use tfs_util::background::BackgroundRunner;
use tfs_util::config::read_config;
use tfs_util::error::Error;

pub async fn run_nameserver(config_file: PathBuf) -> Result<(), Error> {
	info!("Loading configuration...");
	let config = read_config(config_file)?;

	let vip: Arc<dyn VipResolver> = match config.nameserver.vip {
		Some(vip) => Arc::new(NetVipResolver::new(vip)),
		// without a vip there is nothing to arbitrate: always master
		None => Arc::new(StaticVipResolver::new(true)),
	};

	info!("Initializing nameserver...");
	let bind_addr = config.nameserver.bind_addr;
	let ns = Nameserver::new(config, vip)?;

	info!("Initializing background runner...");
	let watch_cancel = watch_shutdown_signal();
	let (background, await_background_done) = BackgroundRunner::new(watch_cancel.clone());

	info!("Spawning nameserver workers...");
	ns.spawn_workers(&background);

	run_server(bind_addr, ns, watch_cancel).await?;

	info!("Waiting for background tasks...");
	await_background_done.await?;
	info!("Cleaning up...");
	Ok(())
}

pub async fn run_dataserver(config_file: PathBuf) -> Result<(), Error> {
	info!("Loading configuration...");
	let config = read_config(config_file)?;

	info!("Opening block store at {}...", config.data_dir.display());
	let data_dir = config.data_dir.clone();
	let store = tokio::task::spawn_blocking(move || BlockStore::open(&data_dir)).await??;
	let store = Arc::new(store);

	let bind_addr = config.dataserver.bind_addr;
	let ds = Dataserver::new(config, store, bind_addr);

	info!("Initializing background runner...");
	let watch_cancel = watch_shutdown_signal();
	let (background, await_background_done) = BackgroundRunner::new(watch_cancel.clone());

	info!("Spawning dataserver workers...");
	ds.spawn_workers(&background);

	run_server(bind_addr, ds, watch_cancel).await?;

	info!("Waiting for background tasks...");
	await_background_done.await?;
	info!("Cleaning up...");
	Ok(())
}

#[cfg(unix)]
fn watch_shutdown_signal() -> watch::Receiver<bool> {
	use tokio::signal::unix::*;

	let (send_cancel, watch_cancel) = watch::channel(false);
	tokio::spawn(async move {
		let mut sigint = signal(SignalKind::interrupt()).expect("Failed to install SIGINT handler");
		let mut sigterm =
			signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
		let mut sighup = signal(SignalKind::hangup()).expect("Failed to install SIGHUP handler");
		tokio::select! {
			_ = sigint.recv() => info!("Received SIGINT, shutting down."),
			_ = sigterm.recv() => info!("Received SIGTERM, shutting down."),
			_ = sighup.recv() => info!("Received SIGHUP, shutting down."),
		}
		send_cancel.send(true).unwrap();
	});
	watch_cancel
}

#[cfg(windows)]
fn watch_shutdown_signal() -> watch::Receiver<bool> {
	use tokio::signal::windows::*;

	let (send_cancel, watch_cancel) = watch::channel(false);
	tokio::spawn(async move {
		let mut sigint = ctrl_c().expect("Failed to install Ctrl-C handler");
		let mut sigclose = ctrl_close().expect("Failed to install Ctrl-Close handler");
		tokio::select! {
			_ = sigint.recv() => info!("Received Ctrl-C, shutting down."),
			_ = sigclose.recv() => info!("Received Ctrl-Close, shutting down."),
		}
		send_cancel.send(true).unwrap();
	});
	watch_cancel
}
