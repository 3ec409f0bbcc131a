//! Node configuration: a flat options object read from TOML and overridden
//! from the command line.

use anyhow::{bail, Context};
use clap::Args;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::fs::{ContainerOptions, PathFilter};
use crate::net::{Backoff, ReconnectPolicy, SocketTimeouts};
use crate::sync::{DeleteFlags, EngineConfig, SyncStrategy};
use crate::transfer::{BandwidthLimit, TransferSettings};

pub const DEFAULT_PORT: u16 = 3210;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Wait for parties to dial in.
    #[default]
    Listen,
    /// Dial a listening party and keep redialling.
    Connect,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mode: Mode,
    /// Address to dial in connect mode, or to bind in listen mode.
    pub host: Option<String>,
    pub port: u16,
    pub directory: Option<PathBuf>,
    /// Run on the first connection with a party.
    pub strategy: SyncStrategy,
    /// Run after a lost connection is re-established.
    pub reconnect_strategy: SyncStrategy,
    /// Extra glob excludes on top of the defaults.
    pub filter: Vec<String>,
    pub ignore_file: Option<PathBuf>,
    pub token: Option<String>,
    pub watch: bool,
    pub delete_local: bool,
    pub delete_remote: bool,
    pub meta_concurrency: usize,
    pub transfer_concurrency: usize,
    pub block_delay_ms: u64,
    pub request_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub reconnect_interval_ms: u64,
    /// 0 retries forever.
    pub reconnect_attempts: u32,
    pub transfer_host: Option<String>,
    /// Upload cap in bytes per second, 0 for none.
    pub bandwidth_limit: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Listen,
            host: None,
            port: DEFAULT_PORT,
            directory: None,
            strategy: SyncStrategy::NoOp,
            reconnect_strategy: SyncStrategy::NoOp,
            filter: Vec::new(),
            ignore_file: None,
            token: None,
            watch: true,
            delete_local: false,
            delete_remote: false,
            meta_concurrency: 4,
            transfer_concurrency: 4,
            block_delay_ms: 1000,
            request_timeout_ms: 30_000,
            handshake_timeout_ms: 10_000,
            reconnect_interval_ms: 1000,
            reconnect_attempts: 0,
            transfer_host: None,
            bandwidth_limit: 0,
        }
    }
}

/// `<config dir>/treesync/config.toml`
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("treesync").join("config.toml"))
}

impl Config {
    /// Read `path`, or the default file when it exists, or fall back to the
    /// built-in defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match default_path() {
                Some(path) if path.is_file() => path,
                _ => return Ok(Self::default()),
            },
        };
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.directory.is_none() {
            bail!("no directory to sync was given");
        }
        if self.meta_concurrency == 0 {
            bail!("meta_concurrency must be at least 1");
        }
        if self.transfer_concurrency == 0 {
            bail!("transfer_concurrency must be at least 1");
        }
        if self.mode == Mode::Connect && self.host.as_deref().map_or(true, str::is_empty) {
            bail!("connect mode needs a host");
        }
        Ok(())
    }

    /// `host:port` to bind or dial.
    pub fn address(&self) -> String {
        let host = match (&self.host, self.mode) {
            (Some(host), _) => host.as_str(),
            (None, Mode::Listen) => "0.0.0.0",
            (None, Mode::Connect) => "127.0.0.1",
        };
        format!("{}:{}", host, self.port)
    }

    pub fn path_filter(&self, root: &Path) -> crate::Result<PathFilter> {
        let mut filter = PathFilter::with_defaults();
        filter.extend(self.filter.as_slice())?;
        match &self.ignore_file {
            Some(file) => filter.with_ignore_file(root, file),
            None => Ok(filter),
        }
    }

    pub fn container_options(&self, root: &Path) -> crate::Result<ContainerOptions> {
        Ok(ContainerOptions {
            filter: self.path_filter(root)?,
            meta_concurrency: self.meta_concurrency,
            block_delay: Duration::from_millis(self.block_delay_ms),
            ..ContainerOptions::default()
        })
    }

    pub fn socket_timeouts(&self) -> SocketTimeouts {
        SocketTimeouts {
            handshake: Duration::from_millis(self.handshake_timeout_ms),
            ..SocketTimeouts::default()
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        let interval = Duration::from_millis(self.reconnect_interval_ms);
        ReconnectPolicy {
            max_attempts: (self.reconnect_attempts > 0).then_some(self.reconnect_attempts),
            interval,
            backoff: Backoff::Exponential {
                max: interval.saturating_mul(30),
            },
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            on_first_connection: self.strategy,
            on_reconnection: self.reconnect_strategy,
            delete: DeleteFlags {
                delete_local: self.delete_local,
                delete_remote: self.delete_remote,
            },
            transfer_concurrency: self.transfer_concurrency,
            bandwidth: BandwidthLimit::new(self.bandwidth_limit),
            transfer: TransferSettings {
                request_timeout: Duration::from_millis(self.request_timeout_ms),
                timeouts: self.socket_timeouts(),
                transfer_host: self.transfer_host.clone(),
            },
        }
    }
}

/// Command-line flags that take precedence over the config file.
#[derive(Debug, Clone, Default, Args)]
pub struct Overrides {
    /// Directory to keep in sync
    #[arg(short, long, value_name = "PATH")]
    pub directory: Option<PathBuf>,

    /// Host to dial, or address to bind when listening
    #[arg(long)]
    pub host: Option<String>,

    #[arg(short, long)]
    pub port: Option<u16>,

    /// Strategy for the first connection (noop, pull, push, newest)
    #[arg(short, long)]
    pub strategy: Option<SyncStrategy>,

    /// Strategy after a reconnection (noop, pull, push, newest)
    #[arg(long)]
    pub reconnect_strategy: Option<SyncStrategy>,

    /// Exclude names matching this glob (repeatable)
    #[arg(short = 'x', long = "exclude", value_name = "GLOB")]
    pub filter: Vec<String>,

    /// Gitignore-style file of excludes
    #[arg(long, value_name = "PATH")]
    pub ignore_file: Option<PathBuf>,

    /// Shared secret both parties must present
    #[arg(long)]
    pub token: Option<String>,

    /// Do not watch the directory for changes
    #[arg(long)]
    pub no_watch: bool,

    /// Let pull delete local names the other party lacks
    #[arg(long)]
    pub delete_local: bool,

    /// Let push delete remote names this party lacks
    #[arg(long)]
    pub delete_remote: bool,

    #[arg(long)]
    pub transfer_concurrency: Option<usize>,

    /// Host advertised to parties for transfer sockets
    #[arg(long)]
    pub transfer_host: Option<String>,

    /// Upload cap in bytes per second
    #[arg(long, value_name = "BYTES")]
    pub bandwidth_limit: Option<u64>,
}

impl Overrides {
    pub fn apply(self, config: &mut Config) {
        if let Some(directory) = self.directory {
            config.directory = Some(directory);
        }
        if let Some(host) = self.host {
            config.host = Some(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(strategy) = self.strategy {
            config.strategy = strategy;
        }
        if let Some(strategy) = self.reconnect_strategy {
            config.reconnect_strategy = strategy;
        }
        config.filter.extend(self.filter);
        if let Some(file) = self.ignore_file {
            config.ignore_file = Some(file);
        }
        if let Some(token) = self.token {
            config.token = Some(token);
        }
        if self.no_watch {
            config.watch = false;
        }
        config.delete_local |= self.delete_local;
        config.delete_remote |= self.delete_remote;
        if let Some(concurrency) = self.transfer_concurrency {
            config.transfer_concurrency = concurrency;
        }
        if let Some(host) = self.transfer_host {
            config.transfer_host = Some(host);
        }
        if let Some(limit) = self.bandwidth_limit {
            config.bandwidth_limit = limit;
        }
    }
}
