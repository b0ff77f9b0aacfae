//! Dialer synthesized from the pool configuration

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use linkpool_core::{ConnError, ConnResult, Dialer, PoolError, PoolResult};
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;

use super::stream::NetStream;
use crate::pool::{Network, ResolvedConfig};

/// TCP keep-alive idle time set on every dialed TCP socket
pub const KEEP_ALIVE: Duration = Duration::from_secs(5 * 60);

#[derive(Clone)]
struct TlsTarget {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

/// Dials the configured address over TCP, TLS or a unix socket.
///
/// Every attempt is bounded by the dial timeout. TCP sockets get keep-alive
/// probes and `TCP_NODELAY`.
#[derive(Clone)]
pub struct NetDialer {
    network: Network,
    addr: String,
    dial_timeout: Duration,
    tls: Option<TlsTarget>,
}

impl NetDialer {
    /// Build a dialer from resolved pool settings.
    ///
    /// The TLS server name defaults to the host part of the address.
    pub fn from_config(config: &ResolvedConfig) -> PoolResult<Self> {
        let tls = match config.tls() {
            Some(client_config) => {
                if config.network() != Network::Tcp {
                    return Err(PoolError::Configuration(format!(
                        "TLS requires a tcp network, got {}",
                        config.network()
                    )));
                }
                let name = config
                    .tls_server_name()
                    .unwrap_or_else(|| host_of(config.addr()))
                    .to_string();
                let server_name = ServerName::try_from(name.clone()).map_err(|_| {
                    PoolError::Configuration(format!("invalid TLS server name: {name}"))
                })?;
                Some(TlsTarget {
                    connector: TlsConnector::from(Arc::clone(client_config)),
                    server_name,
                })
            }
            None => None,
        };

        Ok(Self {
            network: config.network(),
            addr: config.addr().to_string(),
            dial_timeout: config.dial_timeout(),
            tls,
        })
    }

    /// Transport this dialer connects over
    pub fn network(&self) -> Network {
        self.network
    }

    /// Target address
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Whether dialed streams are wrapped in TLS
    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    async fn connect(&self) -> ConnResult<NetStream> {
        match self.network {
            Network::Tcp => {
                let tcp = self.connect_tcp().await?;
                let Some(tls) = &self.tls else {
                    return Ok(NetStream::Tcp(tcp));
                };
                let stream = tls
                    .connector
                    .connect(tls.server_name.clone(), tcp)
                    .await
                    .map_err(|e| ConnError::Tls(format!("handshake with {} failed: {e}", self.addr)))?;
                Ok(NetStream::Tls(Box::new(stream)))
            }
            #[cfg(unix)]
            Network::Unix => Ok(NetStream::Unix(UnixStream::connect(&self.addr).await?)),
            #[cfg(not(unix))]
            Network::Unix => Err(ConnError::Io(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix sockets are not supported on this platform",
            ))),
        }
    }

    async fn connect_tcp(&self) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(self.addr.as_str()).await?;
        stream.set_nodelay(true)?;

        let keepalive = TcpKeepalive::new().with_time(KEEP_ALIVE);
        if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
            tracing::debug!(addr = %self.addr, error = %e, "failed to enable TCP keep-alive");
        }
        Ok(stream)
    }
}

#[async_trait]
impl Dialer<NetStream> for NetDialer {
    async fn dial(&self) -> ConnResult<NetStream> {
        tokio::time::timeout(self.dial_timeout, self.connect()).await?
    }
}

/// Host part of a `host:port` address, without IPv6 brackets
fn host_of(addr: &str) -> &str {
    let host = match addr.rsplit_once(':') {
        // A bare IPv6 address has colons but no port
        Some((host, port))
            if !port.is_empty()
                && port.bytes().all(|b| b.is_ascii_digit())
                && (!host.contains(':') || host.starts_with('[')) =>
        {
            host
        }
        _ => addr,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_rustls::rustls::{ClientConfig, RootCertStore};

    fn client_tls_config() -> Arc<ClientConfig> {
        let provider = Arc::new(tokio_rustls::rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(RootCertStore::empty())
            .with_no_client_auth();
        Arc::new(config)
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("localhost:6379"), "localhost");
        assert_eq!(host_of("10.0.0.1:443"), "10.0.0.1");
        assert_eq!(host_of("[::1]:443"), "::1");
        assert_eq!(host_of("example.com"), "example.com");
        assert_eq!(host_of("::1"), "::1");
    }

    #[test]
    fn test_tls_server_name_defaults_to_host() {
        let config = PoolConfig::new("db.internal:5432")
            .with_tls(client_tls_config())
            .resolve();
        let dialer = NetDialer::from_config(&config).unwrap();
        assert!(dialer.is_tls());
        assert_eq!(dialer.addr(), "db.internal:5432");
    }

    #[test]
    fn test_invalid_tls_server_name_rejected() {
        let config = PoolConfig::new("db.internal:5432")
            .with_tls(client_tls_config())
            .with_tls_server_name("not a hostname")
            .resolve();
        let result = NetDialer::from_config(&config);
        assert!(matches!(result, Err(PoolError::Configuration(_))));
    }

    #[test]
    fn test_tls_over_unix_rejected() {
        let config = PoolConfig::new("/tmp/server.sock")
            .with_tls(client_tls_config())
            .resolve();
        let result = NetDialer::from_config(&config);
        assert!(matches!(result, Err(PoolError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_dial_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let dialer = NetDialer::from_config(&PoolConfig::new(addr.to_string()).resolve()).unwrap();
        assert_eq!(dialer.network(), Network::Tcp);

        let mut stream = dialer.dial().await.unwrap();
        assert!(!stream.is_tls());
        assert_eq!(stream.network(), Network::Tcp);
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let dialer = NetDialer::from_config(&PoolConfig::new(addr.to_string()).resolve()).unwrap();
        let err = dialer.dial().await.unwrap_err();
        assert!(matches!(err, ConnError::Io(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dial_unix() {
        let path = std::env::temp_dir().join(format!("linkpool-dialer-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let listener = tokio::net::UnixListener::bind(&path).unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });

        let config = PoolConfig::new(path.to_string_lossy().into_owned()).resolve();
        assert_eq!(config.network(), Network::Unix);
        let dialer = NetDialer::from_config(&config).unwrap();
        let stream = dialer.dial().await.unwrap();
        assert_eq!(stream.network(), Network::Unix);

        accept.await.unwrap().unwrap();
        let _ = std::fs::remove_file(&path);
    }
}
