//! Command-line interface for flexblock.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// flexblock - replicated block storage.
#[derive(Parser)]
#[command(name = "flexblock")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path (JSON)
    #[arg(short, long, env = "FLEXBLOCK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "FLEXBLOCK_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Run the metadata manager
    Mdm {
        /// Control-channel listen address
        #[arg(long)]
        control_addr: Option<String>,

        /// Admin API listen address
        #[arg(long)]
        admin_addr: Option<String>,

        /// IO token signing secret
        #[arg(long, env = "FLEXBLOCK_TOKEN_SECRET")]
        token_secret: Option<String>,
    },

    /// Run a storage node
    Sds {
        /// Node ID
        #[arg(short, long, env = "FLEXBLOCK_NODE_ID")]
        node_id: u64,

        /// Pool to join
        #[arg(short, long)]
        pool: u64,

        /// Capacity offered to the pool (e.g. 500GB)
        #[arg(long, value_parser = parse_size)]
        capacity: Option<u64>,

        /// Data-plane listen address
        #[arg(long)]
        data_addr: Option<String>,

        /// Address advertised to clients
        #[arg(long)]
        advertise_addr: Option<String>,

        /// Metadata manager control address
        #[arg(long)]
        mdm_addr: Option<String>,

        /// Failure domain tag
        #[arg(long)]
        fault_set: Option<String>,

        /// Chunk data directory
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// IO token signing secret
        #[arg(long, env = "FLEXBLOCK_TOKEN_SECRET")]
        token_secret: Option<String>,
    },

    /// Run a client node (registration and heartbeats)
    Sdc {
        /// Node ID
        #[arg(short, long, env = "FLEXBLOCK_NODE_ID")]
        node_id: u64,

        /// Metadata manager control address
        #[arg(long)]
        mdm_addr: Option<String>,
    },

    /// Cluster administration
    Admin {
        /// Admin API address
        #[arg(short, long, default_value = "127.0.0.1:6612")]
        addr: String,

        #[command(subcommand)]
        command: AdminCommands,
    },

    /// Volume IO from this host
    Io {
        /// Metadata manager control address
        #[arg(long, default_value = "127.0.0.1:6611")]
        mdm_addr: String,

        /// Client ID the volume is mapped to
        #[arg(long, env = "FLEXBLOCK_NODE_ID")]
        client_id: u64,

        #[command(subcommand)]
        command: IoCommands,
    },

    /// Show version information
    Version,
}

/// Administration subcommands.
#[derive(Subcommand)]
pub enum AdminCommands {
    /// Show the cluster snapshot
    Status {
        /// Aggregate now instead of returning the last tick
        #[arg(long)]
        fresh: bool,
    },

    /// Show recent events
    Events {
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,

        /// Only events for this pool
        #[arg(long)]
        pool: Option<u64>,
    },

    /// Protection domains
    Domain {
        #[command(subcommand)]
        command: DomainCommands,
    },

    /// Storage pools
    Pool {
        #[command(subcommand)]
        command: PoolCommands,
    },

    /// Storage nodes
    Node {
        #[command(subcommand)]
        command: NodeCommands,
    },

    /// Volumes
    Volume {
        #[command(subcommand)]
        command: VolumeCommands,
    },

    /// List client nodes
    Clients,

    /// List volume mappings
    Mappings,
}

#[derive(Subcommand)]
pub enum DomainCommands {
    Create { name: String },
    List,
    Delete { id: u64 },
}

#[derive(Subcommand)]
pub enum PoolCommands {
    Create {
        /// Protection domain ID
        #[arg(long)]
        domain: u64,

        name: String,

        /// Total capacity (e.g. 2GB)
        #[arg(long, value_parser = parse_size)]
        capacity: u64,

        /// Capacity held back from allocation
        #[arg(long, value_parser = parse_size, default_value = "0")]
        reserved: u64,

        /// Replica count
        #[arg(long)]
        copies: Option<usize>,

        /// Rebuild bandwidth in MiB/s
        #[arg(long)]
        rebuild_rate: Option<u64>,
    },
    List,
    Show { id: u64 },
    Delete { id: u64 },
    /// Start a rebuild of degraded chunks
    Rebuild { id: u64 },
    /// Cancel the running rebuild
    CancelRebuild { id: u64 },
    /// Change rebuild bandwidth (MiB/s)
    SetRebuildRate { id: u64, rate: u64 },
}

#[derive(Subcommand)]
pub enum NodeCommands {
    List,
    Remove { id: u64 },
    /// Declare a node failed
    Fail { id: u64 },
    /// Bring a failed node back
    Recover { id: u64 },
}

#[derive(Subcommand)]
pub enum VolumeCommands {
    Create {
        /// Pool ID
        #[arg(long)]
        pool: u64,

        name: String,

        /// Size (e.g. 800MB)
        #[arg(long, value_parser = parse_size)]
        size: u64,

        /// Allocate capacity on first write
        #[arg(long)]
        thin: bool,
    },
    List,
    Show { id: u64 },
    Extend {
        id: u64,
        #[arg(long, value_parser = parse_size)]
        size: u64,
    },
    Delete { id: u64 },
    Map {
        id: u64,
        #[arg(long)]
        client: u64,
        #[arg(long)]
        read_only: bool,
    },
    Unmap {
        id: u64,
        #[arg(long)]
        client: u64,
    },
}

#[derive(Subcommand)]
pub enum IoCommands {
    /// Read a byte range to stdout or a file
    Read {
        volume: u64,
        #[arg(long, value_parser = parse_size, default_value = "0")]
        offset: u64,
        #[arg(long, value_parser = parse_size)]
        length: u64,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Write a file's contents at an offset
    Write {
        volume: u64,
        #[arg(long, value_parser = parse_size, default_value = "0")]
        offset: u64,
        input: PathBuf,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

/// Parse a size with an optional unit: `KB`/`MB`/`GB`/`TB` are decimal,
/// `KiB`/`MiB`/`GiB`/`TiB` binary.
pub fn parse_size(input: &str) -> Result<u64, String> {
    let input = input.trim();
    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (digits, unit) = input.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid size '{}'", input))?;

    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "kb" | "k" => 1_000,
        "mb" | "m" => 1_000_000,
        "gb" | "g" => 1_000_000_000,
        "tb" | "t" => 1_000_000_000_000,
        "kib" => 1 << 10,
        "mib" => 1 << 20,
        "gib" => 1 << 30,
        "tib" => 1 << 40,
        other => return Err(format!("unknown size unit '{}'", other)),
    };

    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size '{}' overflows", input))
}
