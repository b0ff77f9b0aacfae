//! Pool configuration types

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_rustls::rustls::ClientConfig;

/// Default timeout for establishing a connection
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
/// Default socket read timeout
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(3);
/// Default time after which an idle connection is reaped
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Default interval between idle sweeps
pub const DEFAULT_IDLE_CHECK_FREQUENCY: Duration = Duration::from_secs(60);
/// Default target address
pub const DEFAULT_ADDR: &str = "localhost";
/// Pool size per available CPU when no size is configured
pub const POOL_SIZE_PER_CPU: usize = 10;

/// Transport used by the built-in dialer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Tcp,
    Unix,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Unix => write!(f, "unix"),
        }
    }
}

/// Socket read or write timeout as configured.
///
/// Keeps "use the default" and "no timeout at all" apart: both would be a
/// zero duration otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoTimeout {
    /// Fall back to the default
    #[default]
    Default,
    /// Block on I/O indefinitely
    Disabled,
    /// Explicit timeout in milliseconds
    Millis(u64),
}

impl IoTimeout {
    /// Convert from the integer convention: `-1` (or any negative) disables
    /// the timeout, `0` selects the default, anything else is milliseconds.
    pub fn from_millis(ms: i64) -> Self {
        match ms {
            ms if ms < 0 => IoTimeout::Disabled,
            0 => IoTimeout::Default,
            ms => IoTimeout::Millis(ms.unsigned_abs()),
        }
    }

    /// Explicit timeout. A zero duration selects the default.
    pub fn after(timeout: Duration) -> Self {
        match u64::try_from(timeout.as_millis()) {
            Ok(0) => IoTimeout::Default,
            Ok(ms) => IoTimeout::Millis(ms),
            Err(_) => IoTimeout::Millis(u64::MAX),
        }
    }

    /// Resolve against `fallback`. `None` means no timeout.
    fn resolve(self, fallback: Option<Duration>) -> Option<Duration> {
        match self {
            IoTimeout::Default | IoTimeout::Millis(0) => fallback,
            IoTimeout::Disabled => None,
            IoTimeout::Millis(ms) => Some(Duration::from_millis(ms)),
        }
    }
}

/// Configuration for a connection pool
///
/// Every zero-valued field means "use the default"; defaults are applied once
/// by [`PoolConfig::resolve`] when the pool is built.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Transport for the built-in dialer; inferred from the address if unset
    network: Option<Network>,
    /// `host:port` or, for unix sockets, a filesystem path
    addr: Option<String>,
    /// Timeout in milliseconds for establishing a connection
    dial_timeout_ms: u64,
    /// Socket read timeout
    read_timeout: IoTimeout,
    /// Socket write timeout
    write_timeout: IoTimeout,
    /// Maximum number of open connections
    pool_size: usize,
    /// Number of idle connections kept warm
    min_idle_conns: usize,
    /// Maximum connection lifetime in milliseconds (0 = unlimited)
    max_conn_age_ms: u64,
    /// Timeout in milliseconds when waiting for pool capacity
    pool_timeout_ms: u64,
    /// Timeout in milliseconds before an idle connection is reaped
    idle_timeout_ms: u64,
    /// Interval in milliseconds between idle sweeps
    idle_check_frequency_ms: u64,
    /// Server name presented during the TLS handshake; defaults to the
    /// address host
    tls_server_name: Option<String>,
    /// TLS client configuration. When set, the built-in dialer negotiates TLS.
    #[serde(skip)]
    tls: Option<Arc<ClientConfig>>,
}

impl PoolConfig {
    /// Create an empty configuration targeting `addr`
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: Some(addr.into()),
            ..Self::default()
        }
    }

    /// Set the target address
    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = Some(addr.into());
        self
    }

    /// Set the transport for the built-in dialer
    pub fn with_network(mut self, network: Network) -> Self {
        self.network = Some(network);
        self
    }

    /// Set the dial timeout in milliseconds
    pub fn with_dial_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.dial_timeout_ms = timeout_ms;
        self
    }

    /// Set the socket read timeout
    pub fn with_read_timeout(mut self, timeout: IoTimeout) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the socket write timeout
    pub fn with_write_timeout(mut self, timeout: IoTimeout) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the maximum number of open connections
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Set the number of idle connections kept warm
    pub fn with_min_idle_conns(mut self, count: usize) -> Self {
        self.min_idle_conns = count;
        self
    }

    /// Set the maximum connection lifetime in milliseconds
    pub fn with_max_conn_age_ms(mut self, age_ms: u64) -> Self {
        self.max_conn_age_ms = age_ms;
        self
    }

    /// Set the pool-acquire timeout in milliseconds
    pub fn with_pool_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.pool_timeout_ms = timeout_ms;
        self
    }

    /// Set the idle timeout in milliseconds
    pub fn with_idle_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.idle_timeout_ms = timeout_ms;
        self
    }

    /// Set the idle sweep interval in milliseconds
    pub fn with_idle_check_frequency_ms(mut self, frequency_ms: u64) -> Self {
        self.idle_check_frequency_ms = frequency_ms;
        self
    }

    /// Enable TLS for the built-in dialer
    pub fn with_tls(mut self, tls: Arc<ClientConfig>) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Override the TLS server name
    pub fn with_tls_server_name(mut self, name: impl Into<String>) -> Self {
        self.tls_server_name = Some(name.into());
        self
    }

    /// Get the configured address, if any
    pub fn addr(&self) -> Option<&str> {
        self.addr.as_deref()
    }

    /// Get the configured read timeout
    pub fn read_timeout(&self) -> IoTimeout {
        self.read_timeout
    }

    /// Get the configured write timeout
    pub fn write_timeout(&self) -> IoTimeout {
        self.write_timeout
    }

    /// Apply defaults to every unset field.
    pub fn resolve(&self) -> ResolvedConfig {
        let addr = self
            .addr
            .clone()
            .filter(|addr| !addr.is_empty())
            .unwrap_or_else(|| DEFAULT_ADDR.to_string());

        let network = self.network.unwrap_or(if addr.starts_with('/') {
            Network::Unix
        } else {
            Network::Tcp
        });

        let read_timeout = self.read_timeout.resolve(Some(DEFAULT_READ_TIMEOUT));
        let write_timeout = self.write_timeout.resolve(read_timeout);

        let pool_timeout = non_zero_ms(self.pool_timeout_ms)
            .unwrap_or_else(|| read_timeout.unwrap_or_default() + Duration::from_secs(1));

        let pool_size = if self.pool_size == 0 {
            let cpus = std::thread::available_parallelism().map_or(1, NonZeroUsize::get);
            POOL_SIZE_PER_CPU * cpus
        } else {
            self.pool_size
        };

        ResolvedConfig {
            network,
            addr,
            dial_timeout: non_zero_ms(self.dial_timeout_ms).unwrap_or(DEFAULT_DIAL_TIMEOUT),
            read_timeout,
            write_timeout,
            pool_size,
            min_idle_conns: self.min_idle_conns,
            max_conn_age: non_zero_ms(self.max_conn_age_ms),
            pool_timeout,
            idle_timeout: non_zero_ms(self.idle_timeout_ms).unwrap_or(DEFAULT_IDLE_TIMEOUT),
            idle_check_frequency: non_zero_ms(self.idle_check_frequency_ms)
                .unwrap_or(DEFAULT_IDLE_CHECK_FREQUENCY),
            tls_server_name: self.tls_server_name.clone(),
            tls: self.tls.clone(),
        }
    }
}

fn non_zero_ms(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// Pool configuration with every default applied
///
/// Immutable once the pool is built.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    network: Network,
    addr: String,
    dial_timeout: Duration,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    pool_size: usize,
    min_idle_conns: usize,
    max_conn_age: Option<Duration>,
    pool_timeout: Duration,
    idle_timeout: Duration,
    idle_check_frequency: Duration,
    tls_server_name: Option<String>,
    tls: Option<Arc<ClientConfig>>,
}

impl ResolvedConfig {
    /// Transport for the built-in dialer
    pub fn network(&self) -> Network {
        self.network
    }

    /// Target address
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Timeout for establishing a connection
    pub fn dial_timeout(&self) -> Duration {
        self.dial_timeout
    }

    /// Socket read timeout; `None` blocks indefinitely
    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    /// Socket write timeout; `None` blocks indefinitely
    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout
    }

    /// Maximum number of open connections
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Number of idle connections kept warm
    pub fn min_idle_conns(&self) -> usize {
        self.min_idle_conns
    }

    /// Maximum connection lifetime; `None` is unlimited
    pub fn max_conn_age(&self) -> Option<Duration> {
        self.max_conn_age
    }

    /// How long an acquire waits for capacity
    pub fn pool_timeout(&self) -> Duration {
        self.pool_timeout
    }

    /// How long a connection may sit idle before it is reaped
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Interval between idle sweeps
    pub fn idle_check_frequency(&self) -> Duration {
        self.idle_check_frequency
    }

    /// TLS server name override
    pub fn tls_server_name(&self) -> Option<&str> {
        self.tls_server_name.as_deref()
    }

    /// TLS client configuration, when TLS is enabled
    pub fn tls(&self) -> Option<&Arc<ClientConfig>> {
        self.tls.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_resolve_defaults() {
        let resolved = PoolConfig::default().resolve();
        let cpus = std::thread::available_parallelism().map_or(1, NonZeroUsize::get);

        assert_eq!(resolved.addr(), "localhost");
        assert_eq!(resolved.network(), Network::Tcp);
        assert_eq!(resolved.dial_timeout(), Duration::from_secs(5));
        assert_eq!(resolved.read_timeout(), Some(Duration::from_secs(3)));
        assert_eq!(resolved.write_timeout(), Some(Duration::from_secs(3)));
        assert_eq!(resolved.pool_timeout(), Duration::from_secs(4));
        assert_eq!(resolved.idle_timeout(), Duration::from_secs(300));
        assert_eq!(resolved.idle_check_frequency(), Duration::from_secs(60));
        assert_eq!(resolved.pool_size(), 10 * cpus);
        assert_eq!(resolved.min_idle_conns(), 0);
        assert_eq!(resolved.max_conn_age(), None);
        assert!(resolved.tls().is_none());
    }

    #[test]
    fn test_zero_read_timeout_uses_default() {
        let resolved = PoolConfig::default()
            .with_read_timeout(IoTimeout::from_millis(0))
            .resolve();
        assert_eq!(resolved.read_timeout(), Some(DEFAULT_READ_TIMEOUT));
        assert_eq!(resolved.write_timeout(), Some(DEFAULT_READ_TIMEOUT));
    }

    #[test]
    fn test_negative_read_timeout_disables_timeout() {
        let resolved = PoolConfig::default()
            .with_read_timeout(IoTimeout::from_millis(-1))
            .resolve();
        assert_eq!(resolved.read_timeout(), None);
        // Write timeout follows the resolved read timeout
        assert_eq!(resolved.write_timeout(), None);
        // Acquire timeout is read timeout (none) plus one second
        assert_eq!(resolved.pool_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_write_timeout_overrides() {
        let resolved = PoolConfig::default()
            .with_read_timeout(IoTimeout::Millis(1500))
            .with_write_timeout(IoTimeout::Disabled)
            .resolve();
        assert_eq!(resolved.read_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(resolved.write_timeout(), None);
        assert_eq!(resolved.pool_timeout(), Duration::from_millis(2500));

        let resolved = PoolConfig::default()
            .with_read_timeout(IoTimeout::Disabled)
            .with_write_timeout(IoTimeout::after(Duration::from_secs(2)))
            .resolve();
        assert_eq!(resolved.write_timeout(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_io_timeout_conventions() {
        assert_eq!(IoTimeout::from_millis(-1), IoTimeout::Disabled);
        assert_eq!(IoTimeout::from_millis(-20), IoTimeout::Disabled);
        assert_eq!(IoTimeout::from_millis(0), IoTimeout::Default);
        assert_eq!(IoTimeout::from_millis(250), IoTimeout::Millis(250));
        assert_eq!(IoTimeout::after(Duration::ZERO), IoTimeout::Default);
    }

    #[test]
    fn test_explicit_values_are_kept() {
        let resolved = PoolConfig::new("10.0.0.1:7000")
            .with_dial_timeout_ms(250)
            .with_pool_size(4)
            .with_min_idle_conns(2)
            .with_max_conn_age_ms(60_000)
            .with_pool_timeout_ms(50)
            .with_idle_timeout_ms(1_000)
            .with_idle_check_frequency_ms(100)
            .resolve();

        assert_eq!(resolved.addr(), "10.0.0.1:7000");
        assert_eq!(resolved.dial_timeout(), Duration::from_millis(250));
        assert_eq!(resolved.pool_size(), 4);
        assert_eq!(resolved.min_idle_conns(), 2);
        assert_eq!(resolved.max_conn_age(), Some(Duration::from_secs(60)));
        assert_eq!(resolved.pool_timeout(), Duration::from_millis(50));
        assert_eq!(resolved.idle_timeout(), Duration::from_secs(1));
        assert_eq!(resolved.idle_check_frequency(), Duration::from_millis(100));
    }

    #[test]
    fn test_network_inferred_from_addr() {
        let resolved = PoolConfig::new("/var/run/app.sock").resolve();
        assert_eq!(resolved.network(), Network::Unix);

        let resolved = PoolConfig::new("/var/run/app.sock")
            .with_network(Network::Tcp)
            .resolve();
        assert_eq!(resolved.network(), Network::Tcp);

        let resolved = PoolConfig::new("").resolve();
        assert_eq!(resolved.addr(), DEFAULT_ADDR);
    }

    #[test]
    fn test_deserialize_partial_config() {
        let config: PoolConfig = serde_json::from_str(
            r#"{"addr":"127.0.0.1:9000","pool_size":3,"read_timeout":"disabled","write_timeout":{"millis":800}}"#,
        )
        .expect("deserialize");

        assert_eq!(config.addr(), Some("127.0.0.1:9000"));
        assert_eq!(config.read_timeout(), IoTimeout::Disabled);
        assert_eq!(config.write_timeout(), IoTimeout::Millis(800));

        let resolved = config.resolve();
        assert_eq!(resolved.pool_size(), 3);
        assert_eq!(resolved.read_timeout(), None);
        assert_eq!(resolved.write_timeout(), Some(Duration::from_millis(800)));
    }
}
