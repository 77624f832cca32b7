//! Server configuration.

use crate::metrics::{NullMetrics, ServerMetrics};
use iroh::SecretKey;
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// Longest TTL a registration may ask for.
pub const DEFAULT_LONGEST_TTL: Duration = Duration::from_secs(20);
/// Most records a single discover response will carry.
pub const DEFAULT_MAX_LIMIT: u64 = 10;
pub const DEFAULT_CLEANER_PERIOD: Duration = Duration::from_secs(2);

/// Everything [`crate::Server::start`] needs besides the store.
#[derive(Clone)]
pub struct ServerConfig {
    /// Socket address to bind; `None` for an OS-assigned port.
    pub bind_addr: Option<SocketAddrV4>,
    /// Server identity; a fresh key is generated when `None`.
    pub secret_key: Option<SecretKey>,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub longest_ttl: Duration,
    pub max_limit: u64,
    pub cleaner_period: Duration,
    pub metrics: Arc<dyn ServerMetrics>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: None,
            secret_key: None,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            longest_ttl: DEFAULT_LONGEST_TTL,
            max_limit: DEFAULT_MAX_LIMIT,
            cleaner_period: DEFAULT_CLEANER_PERIOD,
            metrics: Arc::new(NullMetrics),
        }
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("longest_ttl", &self.longest_ttl)
            .field("max_limit", &self.max_limit)
            .field("cleaner_period", &self.cleaner_period)
            .finish_non_exhaustive()
    }
}
