//! Contains type and functions related to TFS configuration files

use std::io::Read;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::Error;

/// Represent the whole configuration
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
	/// Path where the nameserver stores its oplog and where a dataserver
	/// keeps runtime state. Should be fast, but low volume
	pub metadata_dir: PathBuf,
	/// Mount point holding a dataserver's block files
	pub data_dir: PathBuf,

	/// Target number of replicas per logical block
	#[serde(default = "default_replica_count")]
	pub replica_count: u32,

	/// RPC call timeout in milliseconds
	#[serde(default = "default_rpc_timeout_msec")]
	pub rpc_timeout_msec: u64,

	/// Client retry count on busy/network errors
	#[serde(default = "default_client_retry_count")]
	pub client_retry_count: u32,

	#[serde(default)]
	pub nameserver: NsConfig,
	#[serde(default)]
	pub dataserver: DsConfig,
}

/// Nameserver-side tunables
#[derive(Deserialize, Debug, Clone)]
pub struct NsConfig {
	/// Address to bind for all nameserver traffic
	#[serde(default = "default_ns_bind_addr")]
	pub bind_addr: SocketAddr,
	/// The other nameserver of the HA pair
	pub peer_addr: Option<SocketAddr>,
	/// Floating IP address whose local presence designates the master
	pub vip: Option<IpAddr>,

	/// Number of heartbeat ingestion workers
	#[serde(default = "default_heart_thread_count")]
	pub heart_thread_count: usize,
	/// Bound of the ordinary heartbeat queue; dead notices and block
	/// reports bypass it
	#[serde(default = "default_max_queue_size")]
	pub max_queue_size: usize,

	/// A dataserver missing heartbeats for this long is dead
	#[serde(default = "default_ds_dead_msec")]
	pub ds_dead_msec: u64,
	/// A dead dataserver is dropped from the registry after this grace delay
	#[serde(default = "default_ds_clear_msec")]
	pub ds_clear_msec: u64,

	#[serde(default = "default_plan_interval_msec")]
	pub plan_interval_msec: u64,
	#[serde(default = "default_plan_timeout_msec")]
	pub plan_timeout_msec: u64,
	#[serde(default = "default_plan_retry_max")]
	pub plan_retry_max: u32,
	#[serde(default = "default_max_plans_per_server")]
	pub max_plans_per_server: usize,
	/// Dead-to-total ratio above which a block is scheduled for compaction
	#[serde(default = "default_compact_ratio")]
	pub compact_ratio: f64,
	/// Blocks past this fill level stop accepting new writes
	#[serde(default = "default_max_write_block_size")]
	pub max_write_block_size: u32,
	/// Block count spread tolerated before move plans are emitted
	#[serde(default = "default_balance_slack")]
	pub balance_slack: u32,

	/// Post-switch window during which no plans are emitted
	#[serde(default = "default_safe_mode_sec")]
	pub safe_mode_sec: u64,
	/// Interval of the role-check and HA heartbeat tasks
	#[serde(default = "default_master_heart_interval_msec")]
	pub master_heart_interval_msec: u64,

	/// Whether oplog appends are fsync'ed before acknowledging
	#[serde(default = "default_oplog_fsync")]
	pub oplog_fsync: bool,
	#[serde(default = "default_oplog_segment_size")]
	pub oplog_segment_size: u64,
	/// Acked entries retained before a segment may be recycled
	#[serde(default = "default_oplog_retain_margin")]
	pub oplog_retain_margin: u64,
}

/// Dataserver-side tunables
#[derive(Deserialize, Debug, Clone)]
pub struct DsConfig {
	/// Address to bind for client and nameserver traffic
	#[serde(default = "default_ds_bind_addr")]
	pub bind_addr: SocketAddr,
	/// Nameserver address (the VIP in an HA deployment)
	#[serde(default = "default_ns_addr")]
	pub ns_addr: SocketAddr,

	/// Size of a preallocated main block file
	#[serde(default = "default_main_block_size")]
	pub main_block_size: u32,
	/// Size of a preallocated extension block file
	#[serde(default = "default_ext_block_size")]
	pub ext_block_size: u32,
	/// Number of main blocks preallocated by `tfs format`
	#[serde(default = "default_main_block_count")]
	pub main_block_count: u32,
	/// Number of extension blocks preallocated by `tfs format`
	#[serde(default = "default_ext_block_count")]
	pub ext_block_count: u32,
	/// Expected average file size, used to size the index bucket arrays
	#[serde(default = "default_avg_file_size")]
	pub avg_file_size: u32,

	#[serde(default = "default_heartbeat_interval_msec")]
	pub heartbeat_interval_msec: u64,
	/// Every Nth heartbeat carries the full block report
	#[serde(default = "default_report_block_interval")]
	pub report_block_interval: u32,

	/// Minimum successful replicas for a close to be acknowledged
	#[serde(default = "default_write_min_replica")]
	pub write_min_replica: u32,
	/// Chunk size of compaction copies and replication transfers
	#[serde(default = "default_copy_chunk_size")]
	pub copy_chunk_size: u32,
}

impl Default for NsConfig {
	fn default() -> Self {
		Self {
			bind_addr: default_ns_bind_addr(),
			peer_addr: None,
			vip: None,
			heart_thread_count: default_heart_thread_count(),
			max_queue_size: default_max_queue_size(),
			ds_dead_msec: default_ds_dead_msec(),
			ds_clear_msec: default_ds_clear_msec(),
			plan_interval_msec: default_plan_interval_msec(),
			plan_timeout_msec: default_plan_timeout_msec(),
			plan_retry_max: default_plan_retry_max(),
			max_plans_per_server: default_max_plans_per_server(),
			compact_ratio: default_compact_ratio(),
			max_write_block_size: default_max_write_block_size(),
			balance_slack: default_balance_slack(),
			safe_mode_sec: default_safe_mode_sec(),
			master_heart_interval_msec: default_master_heart_interval_msec(),
			oplog_fsync: default_oplog_fsync(),
			oplog_segment_size: default_oplog_segment_size(),
			oplog_retain_margin: default_oplog_retain_margin(),
		}
	}
}

impl Default for DsConfig {
	fn default() -> Self {
		Self {
			bind_addr: default_ds_bind_addr(),
			ns_addr: default_ns_addr(),
			main_block_size: default_main_block_size(),
			ext_block_size: default_ext_block_size(),
			main_block_count: default_main_block_count(),
			ext_block_count: default_ext_block_count(),
			avg_file_size: default_avg_file_size(),
			heartbeat_interval_msec: default_heartbeat_interval_msec(),
			report_block_interval: default_report_block_interval(),
			write_min_replica: default_write_min_replica(),
			copy_chunk_size: default_copy_chunk_size(),
		}
	}
}

fn default_replica_count() -> u32 {
	2
}
fn default_rpc_timeout_msec() -> u64 {
	10_000
}
fn default_client_retry_count() -> u32 {
	3
}
fn default_ns_bind_addr() -> SocketAddr {
	"0.0.0.0:3100".parse().unwrap()
}
fn default_ds_bind_addr() -> SocketAddr {
	"0.0.0.0:3200".parse().unwrap()
}
fn default_ns_addr() -> SocketAddr {
	"127.0.0.1:3100".parse().unwrap()
}
fn default_heart_thread_count() -> usize {
	2
}
fn default_max_queue_size() -> usize {
	1024
}
fn default_ds_dead_msec() -> u64 {
	6_000
}
fn default_ds_clear_msec() -> u64 {
	60_000
}
fn default_plan_interval_msec() -> u64 {
	5_000
}
fn default_plan_timeout_msec() -> u64 {
	120_000
}
fn default_plan_retry_max() -> u32 {
	3
}
fn default_max_plans_per_server() -> usize {
	2
}
fn default_compact_ratio() -> f64 {
	0.3
}
fn default_max_write_block_size() -> u32 {
	56 * 1024 * 1024
}
fn default_balance_slack() -> u32 {
	16
}
fn default_safe_mode_sec() -> u64 {
	300
}
fn default_master_heart_interval_msec() -> u64 {
	2_000
}
fn default_oplog_fsync() -> bool {
	true
}
fn default_oplog_segment_size() -> u64 {
	8 * 1024 * 1024
}
fn default_oplog_retain_margin() -> u64 {
	1024
}
fn default_main_block_size() -> u32 {
	64 * 1024 * 1024
}
fn default_ext_block_size() -> u32 {
	4 * 1024 * 1024
}
fn default_main_block_count() -> u32 {
	32
}
fn default_ext_block_count() -> u32 {
	16
}
fn default_avg_file_size() -> u32 {
	40 * 1024
}
fn default_heartbeat_interval_msec() -> u64 {
	2_000
}
fn default_report_block_interval() -> u32 {
	10
}
fn default_write_min_replica() -> u32 {
	1
}
fn default_copy_chunk_size() -> u32 {
	1024 * 1024
}

/// Read and parse configuration
pub fn read_config(config_file: PathBuf) -> Result<Config, Error> {
	let mut file = std::fs::OpenOptions::new()
		.read(true)
		.open(config_file.as_path())?;

	let mut config = String::new();
	file.read_to_string(&mut config)?;

	Ok(toml::from_str(&config)?)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_parse_minimal() {
		let config: Config = toml::from_str(
			r#"
			metadata_dir = "/tmp/meta"
			data_dir = "/tmp/data"
			"#,
		)
		.unwrap();
		assert_eq!(config.replica_count, 2);
		assert_eq!(config.nameserver.max_queue_size, 1024);
		assert_eq!(config.nameserver.safe_mode_sec, 300);
		assert_eq!(config.dataserver.heartbeat_interval_msec, 2_000);
		assert!(config.nameserver.vip.is_none());
	}

	#[test]
	fn test_parse_sections() {
		let config: Config = toml::from_str(
			r#"
			metadata_dir = "/tmp/meta"
			data_dir = "/tmp/data"
			replica_count = 3

			[nameserver]
			bind_addr = "10.0.0.1:3100"
			peer_addr = "10.0.0.2:3100"
			vip = "10.0.0.100"
			max_queue_size = 8

			[dataserver]
			main_block_size = 1048576
			report_block_interval = 2
			"#,
		)
		.unwrap();
		assert_eq!(config.replica_count, 3);
		assert_eq!(config.nameserver.vip.unwrap().to_string(), "10.0.0.100");
		assert_eq!(config.nameserver.max_queue_size, 8);
		assert_eq!(config.dataserver.main_block_size, 1048576);
		assert_eq!(config.dataserver.report_block_interval, 2);
	}
}
