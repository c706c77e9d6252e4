use std::path::PathBuf;

use clap::{ArgAction, Parser};

const URL_FORMAT: &str = "[transport+]proxy://[user:pass@][host]:port[#key1=value1,...]";

#[derive(Parser, Debug)]
#[command(about, long_about = None, after_help = format!("INBOUND and OUTBOUND format: {URL_FORMAT}"))]
pub struct Cli {
	/// Inbound route URLs
	#[arg(value_name = "INBOUND")]
	pub inbounds: Vec<String>,

	/// Outbound route URLs, default is a direct connection
	#[arg(short = 'r', long = "outbound", value_name = "OUTBOUND")]
	pub outbounds: Vec<String>,

	/// Certificate chain file (PEM), required for tls/wss/quic listeners
	#[arg(long, value_name = "PATH")]
	pub cert_chain: Option<PathBuf>,

	/// Private key file (PEM)
	#[arg(long, value_name = "PATH")]
	pub key_file: Option<PathBuf>,

	/// IP blacklist file, one literal per line
	#[arg(short = 'B', long, value_name = "PATH")]
	pub blacklist: Option<PathBuf>,

	/// Refuse targets that are not globally routable
	#[arg(long, action = ArgAction::SetTrue)]
	pub block_internal_ips: bool,

	/// Country codes separated by comma, enforced on ws/wss inbounds
	#[arg(long, value_name = "CC,CC")]
	pub block_countries: Option<String>,

	/// Config file (toml or yaml)
	#[arg(short = 'c', long, value_name = "FILE")]
	pub config: Option<PathBuf>,

	/// Increase log verbosity (-v debug, -vv trace)
	#[arg(short = 'v', long, action = ArgAction::Count)]
	pub verbose: u8,
}
