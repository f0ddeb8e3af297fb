use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use mailmesh::{discovery::DiscoveryRequest, models::Protocol};

const CACHE_FILE: &str = "discovery-cache.json";

/// Command-line interface for the mailmesh connectivity core
#[derive(Parser, Debug, Clone)]
#[clap(
    name = "mailmesh",
    about = "Discovers reachable mesh relays and runs the mail client's network service",
    version
)]
pub struct Cli {
    /// Configuration file; created with defaults when missing
    #[clap(long, env("MAILMESH_CONFIG"), default_value = "mailmesh.json")]
    pub config: PathBuf,

    /// Seed directory listing candidate relays
    #[clap(long, env("MAILMESH_SEEDS"), default_value = "seeds.json")]
    pub seeds: PathBuf,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Probe the seed directory and list reachable relays, fastest first
    Discover {
        /// Protocols to probe (comma separated); all when omitted
        #[clap(long = "protocol", value_delimiter = ',')]
        protocols: Vec<Protocol>,

        /// Only probe relays in this region
        #[clap(long)]
        region: Option<String>,

        /// Drop relays slower than this many milliseconds (0 = no limit)
        #[clap(long, default_value = "0")]
        max_rtt: u64,

        /// Reuse a cached result younger than the configured TTL
        #[clap(long)]
        use_cache: bool,

        /// Write the discovered relays into the configuration as peers
        #[clap(long)]
        save: bool,
    },

    /// Inspect or clear the cached discovery result
    Cache {
        #[clap(subcommand)]
        action: CacheAction,
    },

    /// Encrypted backup and restore of configuration and storage
    Backup {
        #[clap(subcommand)]
        action: BackupAction,
    },

    /// Run the network service until interrupted
    Run,
}

#[derive(Subcommand, Debug, Clone)]
pub enum CacheAction {
    Show,
    Clear,
}

#[derive(Subcommand, Debug, Clone)]
pub enum BackupAction {
    Create {
        path: PathBuf,

        /// Also back up the mail storage file (pauses a running service)
        #[clap(long)]
        include_database: bool,

        #[clap(long, env("MAILMESH_BACKUP_PASSWORD"), hide_env_values = true)]
        password: String,
    },
    Restore {
        path: PathBuf,

        #[clap(long, env("MAILMESH_BACKUP_PASSWORD"), hide_env_values = true)]
        password: String,
    },
}

impl Cli {
    /// Discovery cache lives next to the configuration file
    pub fn cache_path(&self) -> PathBuf {
        self.config
            .parent()
            .unwrap_or_else(|| Path::new(""))
            .join(CACHE_FILE)
    }
}

/// Build a discovery request from `discover` arguments
pub fn discovery_request(
    protocols: &[Protocol],
    region: Option<&str>,
    max_rtt: u64,
) -> DiscoveryRequest {
    DiscoveryRequest {
        protocols: if protocols.is_empty() {
            Protocol::ALL.to_vec()
        } else {
            protocols.to_vec()
        },
        region: region.map(str::to_string),
        max_rtt_ms: max_rtt,
    }
}
