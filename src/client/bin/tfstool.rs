//! Interactive command-line tool for TFS, in the spirit of the classic
//! tfstool: local directory navigation plus put/get/rm and block
//! inspection commands against a running cluster

use std::io::{BufRead, Write};
use std::net::SocketAddr;
use std::path::PathBuf;

use structopt::StructOpt;

use tfs_client::TfsClient;
use tfs_rpc::message::ClientCmd;
use tfs_util::data::{server_str, UnlinkAction};
use tfs_util::error::Error;
use tfs_util::fname::TfsName;
use tfs_util::time::msec_to_rfc3339;

#[derive(StructOpt, Debug)]
#[structopt(name = "tfstool", about = "Interactive TFS client tool")]
struct Opt {
	/// Nameserver address (the VIP in an HA deployment)
	#[structopt(short = "s", long = "server")]
	ns_addr: SocketAddr,

	/// Suppress the prompt (for scripted use)
	#[structopt(short = "n")]
	quiet: bool,

	/// Run a single command and exit
	#[structopt(short = "i")]
	command: Option<String>,
}

fn usage() {
	println!("commands:");
	println!("  cd [dir]                    change local work directory");
	println!("  ls [dir]                    list local directory content");
	println!("  pwd                         print local work directory");
	println!("  put localfile [suffix]      store a local file, print its tfs name");
	println!("  uput localfile [suffix]     unique store (not supported)");
	println!("  putl localfile [suffix]     store as large file (not supported)");
	println!("  get tfsname localfile       fetch a file");
	println!("  rm tfsname                  delete a file");
	println!("  urm tfsname                 unique delete (not supported)");
	println!("  undel tfsname               restore a deleted file");
	println!("  hide tfsname [1|0]          conceal / reveal a file");
	println!("  rename tfsname newsuffix    give a file a new suffix");
	println!("  stat tfsname                show file header");
	println!("  statblk blockid ip:port     show block counters on a node");
	println!("  vcblk ip:port count         visit counts (not supported)");
	println!("  lsf blockid ip:port         list files in a block");
	println!("  listblock blockid           show the replica set of a block");
	println!("  cfi tfsname                 decode and check a tfs name");
	println!("  batch file | @ file         run commands from a file");
	println!("  help                        this text");
	println!("  quit | exit                 leave");
}

async fn cmd_put(client: &TfsClient, args: &[&str]) -> Result<(), Error> {
	let data = std::fs::read(args[0])?;
	let suffix = args.get(1).copied();
	let name = client.save(&data, suffix).await?;
	println!("{} => {} ({} bytes)", args[0], name, data.len());
	Ok(())
}

async fn cmd_get(client: &TfsClient, args: &[&str]) -> Result<(), Error> {
	let data = client.fetch(args[0], None).await?;
	std::fs::write(args[1], &data)?;
	println!("{} => {} ({} bytes)", args[0], args[1], data.len());
	Ok(())
}

async fn cmd_stat(client: &TfsClient, args: &[&str]) -> Result<(), Error> {
	let info = client.stat(args[0], None, true).await?;
	println!("name:        {}", args[0]);
	println!("file id:     {:#x}", info.file_id);
	println!("offset:      {}", info.offset);
	println!("size:        {}", info.size);
	println!("record size: {}", info.usize);
	println!("flag:        {}", info.flag);
	println!("crc:         {:#010x}", info.crc);
	println!("created:     {}", msec_to_rfc3339(info.create_time as u64 * 1000));
	println!("modified:    {}", msec_to_rfc3339(info.modify_time as u64 * 1000));
	Ok(())
}

async fn cmd_statblk(client: &TfsClient, args: &[&str]) -> Result<(), Error> {
	let block_id = args[0].parse().map_err(|_| usage_err("bad block id"))?;
	let ds_addr: SocketAddr = args[1].parse().map_err(|_| usage_err("bad address"))?;
	let (info, error, visits) = client.stat_block(block_id, ds_addr).await?;
	println!("block:       {}", info.block_id);
	println!("version:     {}", info.version);
	println!("files:       {}", info.file_count);
	println!("size:        {}", info.size);
	println!("del files:   {}", info.del_file_count);
	println!("del size:    {}", info.del_size);
	println!("seq no:      {}", info.seq_no);
	println!("state:       {}", if error { "error" } else { "ok" });
	println!("visits:      {}", visits);
	Ok(())
}

async fn cmd_lsf(client: &TfsClient, args: &[&str]) -> Result<(), Error> {
	let block_id = args[0].parse().map_err(|_| usage_err("bad block id"))?;
	let ds_addr: SocketAddr = args[1].parse().map_err(|_| usage_err("bad address"))?;
	let files = client.list_files(block_id, ds_addr).await?;
	for fi in files.iter() {
		println!(
			"{:#018x}  {:>10}  flag {}  crc {:#010x}",
			fi.file_id, fi.size, fi.flag, fi.crc
		);
	}
	println!("{} files", files.len());
	Ok(())
}

async fn cmd_listblock(client: &TfsClient, args: &[&str]) -> Result<(), Error> {
	let block_id = args[0].parse().map_err(|_| usage_err("bad block id"))?;
	let replicas = client.list_block(block_id).await?;
	let list: Vec<String> = replicas.iter().map(|s| server_str(*s)).collect();
	println!("block {}: {}", block_id, list.join(", "));
	Ok(())
}

fn cmd_cfi(args: &[&str]) -> Result<(), Error> {
	let name = TfsName::decode(args[0])?;
	println!("name:        {}", args[0]);
	println!("kind:        {}", if name.large { "large" } else { "small" });
	println!("block id:    {}", name.block_id);
	println!("file id:     {:#x}", name.file_id);
	println!("suffix hash: {:#010x}", name.suffix_hash);
	Ok(())
}

fn cmd_ls(args: &[&str]) -> Result<(), Error> {
	let dir = args.first().map(PathBuf::from).unwrap_or_else(|| ".".into());
	let mut names: Vec<String> = std::fs::read_dir(dir)?
		.filter_map(|e| e.ok())
		.filter_map(|e| e.file_name().into_string().ok())
		.collect();
	names.sort();
	for name in names {
		println!("{}", name);
	}
	Ok(())
}

fn usage_err(msg: &str) -> Error {
	Error::Message(msg.to_string())
}

fn check_args(args: &[&str], min: usize, max: usize, usage: &str) -> Result<(), Error> {
	if args.len() < min || args.len() > max {
		Err(usage_err(&format!("usage: {}", usage)))
	} else {
		Ok(())
	}
}

/// Returns false when the tool should exit
async fn run_line(client: &TfsClient, line: &str) -> Result<bool, Error> {
	let parts: Vec<&str> = line.split_whitespace().collect();
	let (cmd, args) = match parts.split_first() {
		Some((cmd, args)) => (*cmd, args),
		None => return Ok(true),
	};
	match cmd {
		"help" => usage(),
		"quit" | "exit" => return Ok(false),
		"cd" => {
			check_args(args, 0, 1, "cd [directory]")?;
			let dir = args.first().copied().unwrap_or("/");
			std::env::set_current_dir(dir)?;
		}
		"ls" => {
			check_args(args, 0, 1, "ls [directory]")?;
			cmd_ls(args)?;
		}
		"pwd" => println!("{}", std::env::current_dir()?.display()),
		"put" => {
			check_args(args, 1, 2, "put localfile [suffix]")?;
			cmd_put(client, args).await?;
		}
		"uput" => println!("uput: unique store is handled outside this tool"),
		"putl" => println!("putl: large files are handled outside this tool"),
		"get" => {
			check_args(args, 2, 2, "get tfsname localfile")?;
			cmd_get(client, args).await?;
		}
		"rm" => {
			check_args(args, 1, 1, "rm tfsname")?;
			client.unlink(args[0], None, UnlinkAction::Delete).await?;
			println!("deleted {}", args[0]);
		}
		"urm" => println!("urm: unique delete is handled outside this tool"),
		"undel" => {
			check_args(args, 1, 1, "undel tfsname")?;
			// historical behavior: report success, keep the real code in
			// the logs
			if let Err(e) = client.unlink(args[0], None, UnlinkAction::Undelete).await {
				tracing::debug!("undel {}: {}", args[0], e);
			}
			println!("undeleted {}", args[0]);
		}
		"hide" => {
			check_args(args, 1, 2, "hide tfsname [1|0]")?;
			let action = match args.get(1).copied().unwrap_or("1") {
				"0" => UnlinkAction::Unconceal,
				_ => UnlinkAction::Conceal,
			};
			client.unlink(args[0], None, action).await?;
			println!("done");
		}
		"rename" => {
			check_args(args, 2, 2, "rename tfsname newsuffix")?;
			let new_name = client.rename(args[0], args[1]).await?;
			println!("{} => {}", args[0], new_name);
		}
		"stat" => {
			check_args(args, 1, 1, "stat tfsname")?;
			cmd_stat(client, args).await?;
		}
		"statblk" => {
			check_args(args, 2, 2, "statblk blockid serverip:port")?;
			cmd_statblk(client, args).await?;
		}
		"vcblk" => println!("vcblk: use statblk for per-block visit counts"),
		"lsf" => {
			check_args(args, 2, 3, "lsf blockid serverip:port [detail]")?;
			cmd_lsf(client, args).await?;
		}
		"listblock" => {
			check_args(args, 1, 1, "listblock blockid")?;
			cmd_listblock(client, args).await?;
		}
		"cfi" => {
			check_args(args, 1, 1, "cfi tfsname")?;
			cmd_cfi(args)?;
		}
		"compactblk" => {
			check_args(args, 1, 1, "compactblk blockid")?;
			let block_id = args[0].parse().map_err(|_| usage_err("bad block id"))?;
			client.admin_cmd(ClientCmd::CompactBlock(block_id)).await?;
			println!("compaction requested");
		}
		"batch" | "@" => {
			check_args(args, 1, 1, "batch file")?;
			let content = std::fs::read_to_string(args[0])?;
			for line in content.lines() {
				let line = line.trim();
				if line.is_empty() || line.starts_with('#') {
					continue;
				}
				if let Err(e) = Box::pin(run_line(client, line)).await {
					eprintln!("{}: {}", line, e);
				}
			}
		}
		other => {
			eprintln!("unknown command {:?}, try help", other);
		}
	}
	Ok(true)
}

#[tokio::main]
async fn main() {
	tracing_subscriber::fmt()
		.with_writer(std::io::stderr)
		.with_env_filter(
			tracing_subscriber::EnvFilter::from_default_env(),
		)
		.init();

	let opt = Opt::from_args();
	let client = TfsClient::new(opt.ns_addr);

	if let Some(command) = opt.command {
		if let Err(e) = run_line(&client, &command).await {
			eprintln!("{}", e);
			std::process::exit(1);
		}
		return;
	}

	let stdin = std::io::stdin();
	let mut lines = stdin.lock().lines();
	loop {
		if !opt.quiet {
			print!("TFS> ");
			let _ = std::io::stdout().flush();
		}
		let line = match lines.next() {
			Some(Ok(line)) => line,
			_ => break,
		};
		match run_line(&client, line.trim()).await {
			Ok(true) => (),
			Ok(false) => break,
			Err(e) => eprintln!("{}", e),
		}
	}
}
