use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "boreas")]
#[command(version = "0.1.0")]
#[command(about = "Multi-protocol host alive detection", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Find out which targets answer
    Alive(AliveArgs),
}

#[derive(Args, Debug, Clone)]
pub struct AliveArgs {
    /// Targets: addresses, CIDRs or ranges. Example: 10.0.0.0/24,2001:db8::1
    #[arg(short = 't', long, required = true)]
    pub targets: String,

    /// Targets to leave out, same syntax as --targets
    #[arg(long)]
    pub exclude: Option<String>,

    /// Alive tests: names (icmp,arp,tcp-ack,tcp-syn,consider-alive) or the numeric bitmask.
    /// Defaults to the config file's alive_test, else icmp,tcp-ack
    #[arg(long)]
    pub tests: Option<String>,

    /// Destination ports for TCP pings. Examples: 80,443 or 8000-8010
    #[arg(short, long)]
    pub ports: Option<String>,

    /// Hosts per burst, 0 or less disables pacing
    #[arg(long, allow_negative_numbers = true)]
    pub burst: Option<i64>,

    /// Pause between bursts in milliseconds
    #[arg(long)]
    pub burst_timeout_ms: Option<u64>,

    /// Grace window for late replies in seconds
    #[arg(long)]
    pub wait_secs: Option<u64>,

    /// Reserved TCP source port used to recognise replies
    #[arg(long)]
    pub filter_port: Option<u16>,

    /// Report at most this many alive hosts
    #[arg(long)]
    pub max_hosts: Option<usize>,

    /// JSON configuration file, flags override its values
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Preset: default, fast, stealth
    #[arg(long, default_value = "default", value_parser = ["default", "fast", "stealth"])]
    pub preset: String,

    /// Output format: text, json, csv
    #[arg(short, long, default_value = "text")]
    pub output_format: String,
}
