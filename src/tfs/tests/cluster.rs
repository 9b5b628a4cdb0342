//! End-to-end exercises of a small in-process cluster: one nameserver,
//! a few dataservers, and the thin client, all over real sockets

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use tfs_client::TfsClient;
use tfs_dataserver::Dataserver;
use tfs_nameserver::Nameserver;
use tfs_rpc::server;
use tfs_rpc::vip::StaticVipResolver;
use tfs_rpc::RpcHelper;
use tfs_store::BlockStore;
use tfs_util::background::BackgroundRunner;
use tfs_util::config::{Config, DsConfig, NsConfig};
use tfs_util::data::*;
use tfs_util::fname::TfsName;

fn cluster_config(dir: std::path::PathBuf, ns_addr: SocketAddr) -> Config {
	Config {
		metadata_dir: dir.clone(),
		data_dir: dir,
		replica_count: 2,
		rpc_timeout_msec: 2_000,
		client_retry_count: 2,
		nameserver: NsConfig {
			bind_addr: ns_addr,
			safe_mode_sec: 0,
			plan_interval_msec: 200,
			ds_dead_msec: 60_000,
			max_write_block_size: 1 << 20,
			..Default::default()
		},
		dataserver: DsConfig {
			ns_addr,
			main_block_size: 1 << 20,
			ext_block_size: 1 << 18,
			main_block_count: 4,
			ext_block_count: 4,
			avg_file_size: 1 << 10,
			heartbeat_interval_msec: 100,
			report_block_interval: 2,
			copy_chunk_size: 4 << 10,
			..Default::default()
		},
	}
}

struct Node {
	stop: watch::Sender<bool>,
	_bg: Arc<BackgroundRunner>,
	_tmp: mktemp::Temp,
}

struct TestCluster {
	ns: Arc<Nameserver>,
	ns_addr: SocketAddr,
	dataservers: Vec<(Arc<Dataserver>, Node)>,
	_ns_node: Node,
}

async fn start_cluster(n_dataservers: usize) -> TestCluster {
	// nameserver
	let ns_tmp = mktemp::Temp::new_dir().unwrap();
	let ns_listener = server::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
	let ns_addr = ns_listener.local_addr().unwrap();
	let config = cluster_config(ns_tmp.to_path_buf(), ns_addr);
	let ns = Nameserver::new(config, Arc::new(StaticVipResolver::new(true))).unwrap();

	let (ns_stop, stop_rx) = watch::channel(false);
	let (ns_bg, _) = BackgroundRunner::new(stop_rx.clone());
	ns.spawn_workers(&ns_bg);
	let handler = ns.clone();
	tokio::spawn(async move {
		let _ = server::serve_listener(ns_listener, handler, stop_rx).await;
	});
	let ns_node = Node {
		stop: ns_stop,
		_bg: ns_bg,
		_tmp: ns_tmp,
	};

	// dataservers
	let mut dataservers = vec![];
	for _ in 0..n_dataservers {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let dir = tmp.to_path_buf();
		let config = cluster_config(dir.clone(), ns_addr);
		BlockStore::format(&dir, &config.dataserver).unwrap();
		let store = Arc::new(BlockStore::open(&dir).unwrap());

		let listener = server::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
		let addr = listener.local_addr().unwrap();
		let ds = Dataserver::new(config, store, addr);

		let (stop, stop_rx) = watch::channel(false);
		let (bg, _) = BackgroundRunner::new(stop_rx.clone());
		ds.spawn_workers(&bg);
		let handler = ds.clone();
		tokio::spawn(async move {
			let _ = server::serve_listener(listener, handler, stop_rx).await;
		});
		dataservers.push((
			ds,
			Node {
				stop,
				_bg: bg,
				_tmp: tmp,
			},
		));
	}

	let cluster = TestCluster {
		ns,
		ns_addr,
		dataservers,
		_ns_node: ns_node,
	};
	cluster.wait_for_alive(n_dataservers).await;
	cluster
}

impl TestCluster {
	fn client(&self) -> TfsClient {
		TfsClient::with_rpc(self.ns_addr, RpcHelper::new(2_000, 2))
	}

	async fn wait_for_alive(&self, n: usize) {
		for _ in 0..100 {
			if self.ns.registry.alive_servers().len() >= n {
				return;
			}
			tokio::time::sleep(Duration::from_millis(50)).await;
		}
		panic!("dataservers did not register in time");
	}

	/// Flip one dataserver's stop signal; its heartbeat worker sends the
	/// dead notice while draining
	fn kill_dataserver(&self, server_id: ServerId) {
		for (ds, node) in self.dataservers.iter() {
			if ds.server_id == server_id {
				let _ = node.stop.send(true);
				return;
			}
		}
		panic!("no such dataserver");
	}
}

#[tokio::test]
async fn test_write_and_read() {
	let cluster = start_cluster(3).await;
	let client = cluster.client();

	let payload = vec![0x41u8; 512];
	let name = client.save(&payload, None).await.unwrap();
	assert_eq!(name.len(), tfs_util::fname::FILE_NAME_LEN);

	// the block is registered with a full replica set
	let parsed = TfsName::decode(&name).unwrap();
	let (_, replicas) = cluster.ns.registry.get_block(parsed.block_id).unwrap();
	assert_eq!(replicas.len(), 2);

	let fetched = client.fetch(&name, None).await.unwrap();
	assert_eq!(fetched, payload);

	let info = client.stat(&name, None, false).await.unwrap();
	assert_eq!(info.size, 512);
	assert_eq!(info.flag, 0);
	assert_eq!(info.crc, crc32(&payload));
}

#[tokio::test]
async fn test_suffix_checked_on_fetch() {
	let cluster = start_cluster(2).await;
	let client = cluster.client();

	let name = client.save(b"suffixed", Some(".jpg")).await.unwrap();
	assert_eq!(
		client.fetch(&name, Some(".jpg")).await.unwrap(),
		b"suffixed"
	);
	assert!(client.fetch(&name, Some(".png")).await.is_err());
}

#[tokio::test]
async fn test_delete_undelete_conceal() {
	let cluster = start_cluster(2).await;
	let client = cluster.client();

	let name = client.save(b"now you see me", None).await.unwrap();
	client
		.unlink(&name, None, UnlinkAction::Delete)
		.await
		.unwrap();
	assert!(client.fetch(&name, None).await.is_err());

	client
		.unlink(&name, None, UnlinkAction::Undelete)
		.await
		.unwrap();
	assert_eq!(client.fetch(&name, None).await.unwrap(), b"now you see me");

	client
		.unlink(&name, None, UnlinkAction::Conceal)
		.await
		.unwrap();
	assert!(client.fetch(&name, None).await.is_err());
	// a concealed file is still visible to a forced stat
	assert!(client.stat(&name, None, true).await.unwrap().is_concealed());
}

#[tokio::test]
async fn test_replica_recovery_after_node_death() {
	let cluster = start_cluster(3).await;
	let client = cluster.client();

	let payload = (0..2048u32).map(|i| (i % 251) as u8).collect::<Vec<_>>();
	let name = client.save(&payload, None).await.unwrap();
	let parsed = TfsName::decode(&name).unwrap();

	let (_, replicas) = cluster.ns.registry.get_block(parsed.block_id).unwrap();
	assert_eq!(replicas.len(), 2);

	// kill the non-primary holder; the dead notice frees its blocks and
	// the plan engine re-replicates onto the third node
	let victim = replicas[1];
	cluster.kill_dataserver(victim);

	let mut recovered = None;
	for _ in 0..200 {
		tokio::time::sleep(Duration::from_millis(100)).await;
		if let Some((_, replicas)) = cluster.ns.registry.get_block(parsed.block_id) {
			if replicas.len() == 2 && !replicas.contains(&victim) {
				recovered = Some(replicas);
				break;
			}
		}
	}
	let recovered = recovered.expect("replica count did not recover");
	assert!(!recovered.contains(&victim));

	// the payload survives, served by the fresh replica set
	assert_eq!(client.fetch(&name, None).await.unwrap(), payload);
}

#[tokio::test]
async fn test_failover_promotes_standby() {
	// two nameservers arbitrating over a simulated vip
	let a_tmp = mktemp::Temp::new_dir().unwrap();
	let b_tmp = mktemp::Temp::new_dir().unwrap();
	let a_listener = server::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
	let b_listener = server::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
	let a_addr = a_listener.local_addr().unwrap();
	let b_addr = b_listener.local_addr().unwrap();

	let mut a_config = cluster_config(a_tmp.to_path_buf(), a_addr);
	a_config.nameserver.peer_addr = Some(b_addr);
	a_config.nameserver.master_heart_interval_msec = 200;
	let mut b_config = cluster_config(b_tmp.to_path_buf(), b_addr);
	b_config.nameserver.peer_addr = Some(a_addr);
	b_config.nameserver.master_heart_interval_msec = 200;

	let a_vip = Arc::new(StaticVipResolver::new(true));
	let b_vip = Arc::new(StaticVipResolver::new(false));
	let ns_a = Nameserver::new(a_config, a_vip.clone()).unwrap();
	let ns_b = Nameserver::new(b_config, b_vip.clone()).unwrap();

	let (a_stop, a_rx) = watch::channel(false);
	let (a_bg, _) = BackgroundRunner::new(a_rx.clone());
	ns_a.spawn_workers(&a_bg);
	let handler = ns_a.clone();
	tokio::spawn(async move {
		let _ = server::serve_listener(a_listener, handler, a_rx).await;
	});

	let (_b_stop, b_rx) = watch::channel(false);
	let (b_bg, _) = BackgroundRunner::new(b_rx.clone());
	ns_b.spawn_workers(&b_bg);
	let handler = ns_b.clone();
	tokio::spawn(async move {
		let _ = server::serve_listener(b_listener, handler, b_rx).await;
	});

	assert!(ns_a.runtime.is_master());
	assert!(!ns_b.runtime.is_master());

	// dataservers report to the standby so it can serve after promotion
	let mut nodes = vec![];
	for _ in 0..2 {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let dir = tmp.to_path_buf();
		let config = cluster_config(dir.clone(), b_addr);
		BlockStore::format(&dir, &config.dataserver).unwrap();
		let store = Arc::new(BlockStore::open(&dir).unwrap());
		let listener = server::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
		let addr = listener.local_addr().unwrap();
		let ds = Dataserver::new(config, store, addr);
		let (stop, stop_rx) = watch::channel(false);
		let (bg, _) = BackgroundRunner::new(stop_rx.clone());
		ds.spawn_workers(&bg);
		let handler = ds.clone();
		tokio::spawn(async move {
			let _ = server::serve_listener(listener, handler, stop_rx).await;
		});
		nodes.push((ds, stop, bg, tmp));
	}
	for _ in 0..100 {
		if ns_b.registry.alive_servers().len() >= 2 {
			break;
		}
		tokio::time::sleep(Duration::from_millis(50)).await;
	}

	// kill the active and move the vip: the standby must take over
	let _ = a_stop.send(true);
	drop(a_bg);
	a_vip.set_local(false);
	b_vip.set_local(true);

	let mut promoted = false;
	for _ in 0..100 {
		tokio::time::sleep(Duration::from_millis(100)).await;
		if ns_b.runtime.is_master() {
			promoted = true;
			break;
		}
	}
	assert!(promoted, "standby did not promote");
	assert_eq!(ns_b.plans.plan_count(), 0);

	// with safe mode at zero, the promoted master accepts writes at once
	let client = TfsClient::with_rpc(b_addr, RpcHelper::new(2_000, 2));
	let name = client.save(b"after failover", None).await.unwrap();
	assert_eq!(client.fetch(&name, None).await.unwrap(), b"after failover");
}
