//! TFS entry point: nameserver, dataserver, and the format tool

#[macro_use]
extern crate tracing;

mod server;

use std::path::PathBuf;

use structopt::StructOpt;

use tfs_store::BlockStore;
use tfs_util::config::read_config;
use tfs_util::error::Error;

#[derive(StructOpt, Debug)]
#[structopt(name = "tfs", about = "TFS distributed small-file store")]
enum Command {
	/// Run the cluster coordinator
	#[structopt(name = "nameserver")]
	Nameserver(ServerOpt),

	/// Run a storage node
	#[structopt(name = "dataserver")]
	Dataserver(ServerOpt),

	/// Format a storage node's data directory
	#[structopt(name = "format")]
	Format(ServerOpt),
}

#[derive(StructOpt, Debug)]
struct ServerOpt {
	/// Configuration file
	#[structopt(short = "c", long = "config", default_value = "/etc/tfs/tfs.toml")]
	pub config_file: PathBuf,
}

#[tokio::main]
async fn main() {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
		)
		.init();

	let res = match Command::from_args() {
		Command::Nameserver(opt) => server::run_nameserver(opt.config_file).await,
		Command::Dataserver(opt) => server::run_dataserver(opt.config_file).await,
		Command::Format(opt) => format_node(opt.config_file),
	};
	if let Err(e) = res {
		error!("{}", e);
		std::process::exit(1);
	}
}

fn format_node(config_file: PathBuf) -> Result<(), Error> {
	let config = read_config(config_file)?;
	BlockStore::format(&config.data_dir, &config.dataserver)?;
	info!("Formatted {}", config.data_dir.display());
	Ok(())
}
