//! Worker configuration
//!
//! Every setting can come from a flag or an environment variable.

use crate::crypto::CipherKey;
use crate::dispatcher::{DispatcherConfig, DEFAULT_POLL_INTERVAL};
use crate::error::{DeckhandError, Result};
use crate::health::DEFAULT_PORT;
use clap::Args;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Default size of the store connection pool
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Command-line and environment settings
#[derive(Args, Clone, Default)]
pub struct WorkerArgs {
    /// Postgres connection URL
    #[arg(long, env = "DATABASE_URL", hide_env_values = true, global = true)]
    pub database_url: Option<String>,

    /// Master key protecting stored credentials
    #[arg(long, env = "ENCRYPTION_KEY", hide_env_values = true, global = true)]
    pub encryption_key: Option<String>,

    /// Port of the liveness endpoint
    #[arg(long, env = "DECKHAND_PORT", default_value_t = DEFAULT_PORT, global = true)]
    pub port: u16,

    /// Delay between task polls, in milliseconds
    #[arg(long, env = "DECKHAND_POLL_INTERVAL_MS", default_value_t = 1000, global = true)]
    pub poll_interval_ms: u64,

    /// Fail reconciliations running longer than this many seconds
    #[arg(long, env = "DECKHAND_RECONCILE_TIMEOUT_SECS", global = true)]
    pub reconcile_timeout_secs: Option<u64>,

    /// Store connection pool size
    #[arg(
        long,
        env = "DECKHAND_DB_MAX_CONNECTIONS",
        default_value_t = DEFAULT_MAX_CONNECTIONS,
        global = true
    )]
    pub max_connections: u32,
}

/// Resolved worker configuration
#[derive(Clone)]
pub struct WorkerConfig {
    /// Postgres connection URL
    pub database_url: Option<String>,
    /// Master key protecting stored credentials
    pub encryption_key: String,
    /// Port of the liveness endpoint
    pub port: u16,
    /// Delay between task polls
    pub poll_interval: Duration,
    /// Reconciliation watchdog
    pub reconcile_timeout: Option<Duration>,
    /// Store connection pool size
    pub max_connections: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            encryption_key: String::new(),
            port: DEFAULT_PORT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            reconcile_timeout: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

impl fmt::Debug for WorkerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerConfig")
            .field(
                "database_url",
                &self.database_url.as_ref().map(|_| "<redacted>"),
            )
            .field("encryption_key", &"<redacted>")
            .field("port", &self.port)
            .field("poll_interval", &self.poll_interval)
            .field("reconcile_timeout", &self.reconcile_timeout)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

impl From<WorkerArgs> for WorkerConfig {
    fn from(args: WorkerArgs) -> Self {
        Self {
            database_url: args.database_url.filter(|u| !u.trim().is_empty()),
            encryption_key: args.encryption_key.unwrap_or_default(),
            port: args.port,
            poll_interval: Duration::from_millis(args.poll_interval_ms),
            reconcile_timeout: args
                .reconcile_timeout_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            max_connections: args.max_connections,
        }
    }
}

impl WorkerConfig {
    /// Check settings every command needs
    pub fn validate(&self) -> Result<()> {
        if self.encryption_key.trim().is_empty() {
            return Err(DeckhandError::Config(
                "ENCRYPTION_KEY must be set to a non-empty value".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(DeckhandError::Config(
                "Poll interval must be greater than zero".to_string(),
            ));
        }
        if self.max_connections == 0 {
            return Err(DeckhandError::Config(
                "Connection pool size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Store URL, required by commands that touch the store
    pub fn database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .ok_or_else(|| DeckhandError::Config("DATABASE_URL must be set".to_string()))
    }

    /// Derive the credential key
    pub fn cipher_key(&self) -> Result<CipherKey> {
        CipherKey::from_master_key(&self.encryption_key)
            .map_err(|e| DeckhandError::Config(e.to_string()))
    }

    /// Dispatcher settings
    pub fn dispatcher(&self) -> DispatcherConfig {
        DispatcherConfig {
            poll_interval: self.poll_interval,
            reconcile_timeout: self.reconcile_timeout,
        }
    }

    /// Address of the liveness endpoint
    pub fn liveness_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port))
    }
}
