//! Server configuration.
//!
//! `Config` is a plain record usable without `clap` at all (library
//! embedders, tests); [`Config::from_args`] is the binary-only convenience
//! that parses `kvbus-server`'s startup flags.

use std::path::PathBuf;

use clap::Parser;

use crate::{DEFAULT_HOST, DEFAULT_PORT, DEFAULT_SNAPSHOT_PATH};

/// Injected server configuration: listen address, default TTL, snapshot
/// path, and a reserved LRU capacity field.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// TTL (seconds) applied when a client's `set_with_ttl` omits `ttl`.
    ///
    /// Unused by the wire protocol today (`set_with_ttl` without `ttl` is a
    /// validation error), but kept as an injectable value for callers
    /// embedding `kvbus` as a library.
    pub default_ttl: Option<u64>,
    pub snapshot_path: PathBuf,
    /// Reserved for future use; not read by any operation.
    pub lru_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            default_ttl: Some(3600),
            snapshot_path: PathBuf::from(DEFAULT_SNAPSHOT_PATH),
            lru_capacity: 100,
        }
    }
}

impl Config {
    /// Parse configuration from the process's command-line arguments.
    pub fn from_args() -> Config {
        Cli::parse().into()
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Command-line flags for the `kvbus-server` binary.
///
/// This is server startup configuration, not an interactive client
/// front-end: it has no subcommands and no REPL, just the handful of
/// values a running server needs.
#[derive(Parser, Debug)]
#[command(name = "kvbus-server", about = "In-memory KV store with TTL, snapshots, and pub/sub")]
struct Cli {
    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(long)]
    default_ttl: Option<u64>,

    #[arg(long, default_value = DEFAULT_SNAPSHOT_PATH)]
    snapshot_path: PathBuf,

    #[arg(long, default_value_t = 100)]
    lru_capacity: usize,
}

impl From<Cli> for Config {
    fn from(cli: Cli) -> Config {
        Config {
            host: cli.host,
            port: cli.port,
            default_ttl: cli.default_ttl,
            snapshot_path: cli.snapshot_path,
            lru_capacity: cli.lru_capacity,
        }
    }
}
