use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "slotkv",
    about = "slotkv: chain-replicated key-value store with live re-partitioning",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Directory address for client commands
    #[arg(short, long, global = true, default_value = "127.0.0.1:9990")]
    pub directory: String,

    /// Connect and receive timeout for client commands
    #[arg(long, global = true, default_value_t = 1000)]
    pub timeout_ms: u64,
}

#[derive(Clone, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a storage node
    Storage(DaemonArgs),
    /// Run the directory
    Directory(DaemonArgs),
    /// Create a file
    Create(CreateArgs),
    /// Remove a file and release its blocks
    Destroy(PathArgs),
    /// Show a file's replica chains
    Status(PathArgs),
    /// Insert a key
    Put(PutArgs),
    /// Read a key
    Get(KeyArgs),
    /// Replace a key's value, printing the old one
    Update(PutArgs),
    /// Delete a key, printing its value
    Remove(KeyArgs),
    /// Check whether a key is present
    Exists(KeyArgs),
    /// List every key in a file
    Keys(PathArgs),
    /// Count the keys in a file
    NumKeys(PathArgs),
    /// Split the chain owning a slot range
    Split(RangeArgs),
    /// Merge the chain owning a slot range into its right neighbour
    Merge(RangeArgs),
    /// Split the largest chain of a file
    AddBlock(PathArgs),
    /// Write a file to its backing path and release its memory
    Dump(BackingArgs),
    /// Restore a file from a backing path
    Load(BackingArgs),
    /// Write a file to its backing path, keeping it in memory
    Sync(BackingArgs),
}

#[derive(Args)]
pub struct DaemonArgs {
    /// TOML configuration file; defaults apply when absent
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

#[derive(Args)]
pub struct CreateArgs {
    pub path: String,
    /// Where dump and sync write the file
    #[arg(short, long)]
    pub backing_path: Option<String>,
    /// Number of partitions
    #[arg(short = 'n', long, default_value_t = 1)]
    pub blocks: usize,
    /// Replicas per partition
    #[arg(short = 'r', long, default_value_t = 1)]
    pub chain_length: usize,
    /// Keep the file across lease expiry
    #[arg(long)]
    pub pinned: bool,
    /// Never re-partition automatically
    #[arg(long)]
    pub static_provisioned: bool,
    /// Write back to the backing path on lease expiry
    #[arg(long)]
    pub mapped: bool,
}

#[derive(Args)]
pub struct PathArgs {
    pub path: String,
}

#[derive(Args)]
pub struct KeyArgs {
    pub path: String,
    pub key: String,
}

#[derive(Args)]
pub struct PutArgs {
    pub path: String,
    pub key: String,
    pub value: String,
}

#[derive(Args)]
pub struct RangeArgs {
    pub path: String,
    pub begin: i32,
    pub end: i32,
}

#[derive(Args)]
pub struct BackingArgs {
    pub path: String,
    /// Defaults to the file's own backing path
    pub backing_path: Option<String>,
}
