//! linkpool CLI - drive a connection pool from the command line
//!
//! `serve` runs a small echo server to pool against; `probe` hammers an
//! address through a pool and prints the resulting pool statistics as JSON.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use linkpool::{ConnError, IoTimeout, NetStream, Pool, PoolConfig, PoolResult};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "linkpool")]
#[command(about = "Exercise a bounded connection pool against a TCP or unix socket endpoint")]
#[command(version)]
struct Cli {
    /// Emit logs as JSON instead of human-readable text
    #[arg(long, global = true, env = "LINKPOOL_JSON_LOGS")]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an echo server
    Serve {
        /// Address to bind to
        #[arg(short, long, default_value = "127.0.0.1:7000", env = "LINKPOOL_BIND")]
        bind: String,
    },

    /// Send requests through a pool and report pool statistics
    Probe(ProbeArgs),
}

#[derive(clap::Args)]
struct ProbeArgs {
    /// Target address (`host:port` or a unix socket path)
    #[arg(short, long, default_value = "127.0.0.1:7000", env = "LINKPOOL_ADDR")]
    addr: String,

    /// JSON file with a pool configuration; flags override its values
    #[arg(short, long, env = "LINKPOOL_CONFIG")]
    config: Option<PathBuf>,

    /// Maximum number of open connections
    #[arg(long)]
    pool_size: Option<usize>,

    /// Idle connections to keep warm
    #[arg(long)]
    min_idle: Option<usize>,

    /// Dial timeout in milliseconds
    #[arg(long)]
    dial_timeout_ms: Option<u64>,

    /// Read timeout in milliseconds; 0 uses the default, -1 disables it
    #[arg(long, allow_hyphen_values = true)]
    read_timeout_ms: Option<i64>,

    /// How long to wait for pool capacity, in milliseconds
    #[arg(long)]
    pool_timeout_ms: Option<u64>,

    /// Idle time in milliseconds after which connections are reaped
    #[arg(long)]
    idle_timeout_ms: Option<u64>,

    /// Total number of requests to send
    #[arg(short = 'n', long, default_value = "100")]
    requests: u64,

    /// Number of concurrent workers
    #[arg(short = 'j', long, default_value = "8")]
    concurrency: usize,
}

impl ProbeArgs {
    fn pool_config(&self) -> anyhow::Result<PoolConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                serde_json::from_str::<PoolConfig>(&raw)
                    .with_context(|| format!("invalid pool configuration in {}", path.display()))?
            }
            None => PoolConfig::default(),
        };

        if config.addr().is_none() {
            config = config.with_addr(self.addr.clone());
        }
        if let Some(size) = self.pool_size {
            config = config.with_pool_size(size);
        }
        if let Some(min_idle) = self.min_idle {
            config = config.with_min_idle_conns(min_idle);
        }
        if let Some(ms) = self.dial_timeout_ms {
            config = config.with_dial_timeout_ms(ms);
        }
        if let Some(ms) = self.read_timeout_ms {
            config = config.with_read_timeout(IoTimeout::from_millis(ms));
        }
        if let Some(ms) = self.pool_timeout_ms {
            config = config.with_pool_timeout_ms(ms);
        }
        if let Some(ms) = self.idle_timeout_ms {
            config = config.with_idle_timeout_ms(ms);
        }
        Ok(config)
    }
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json_logs);

    match cli.command {
        Commands::Serve { bind } => serve(&bind).await,
        Commands::Probe(args) => probe(args).await,
    }
}

async fn serve(bind: &str) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    tracing::info!(addr = %listener.local_addr()?, "echo server listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (mut socket, peer) = accepted?;
                tracing::debug!(%peer, "accepted connection");
                tokio::spawn(async move {
                    let (mut reader, mut writer) = socket.split();
                    match tokio::io::copy(&mut reader, &mut writer).await {
                        Ok(bytes) => tracing::debug!(%peer, bytes, "connection finished"),
                        Err(e) => tracing::debug!(%peer, error = %e, "connection failed"),
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                return Ok(());
            }
        }
    }
}

async fn probe(args: ProbeArgs) -> anyhow::Result<()> {
    let config = args.pool_config()?;
    let closed = Arc::new(AtomicU64::new(0));
    let close_counter = closed.clone();
    let pool = Pool::builder(config)
        .on_close(move |stream: &NetStream| {
            close_counter.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(?stream, "closing pooled connection");
            Ok(())
        })
        .build_net()
        .context("failed to create pool")?;

    tracing::info!(
        addr = %pool.config().addr(),
        network = %pool.config().network(),
        pool_size = pool.config().pool_size(),
        "probing"
    );

    let next = Arc::new(AtomicU64::new(0));
    let workers: Vec<_> = (0..args.concurrency.max(1))
        .map(|_| {
            let pool = pool.clone();
            let next = next.clone();
            let total = args.requests;
            tokio::spawn(async move {
                let mut failures = 0u64;
                loop {
                    let seq = next.fetch_add(1, Ordering::Relaxed);
                    if seq >= total {
                        break;
                    }
                    if let Err(e) = round_trip(&pool, seq).await {
                        tracing::warn!(seq, error = %e, "request failed");
                        failures += 1;
                    }
                }
                failures
            })
        })
        .collect();

    let mut failures = 0;
    for worker in workers {
        failures += worker.await?;
    }

    let stats = pool.stats();
    println!("{}", serde_json::to_string_pretty(&stats)?);

    if let Err(e) = pool.close().await {
        tracing::warn!(error = %e, "pool closed with errors");
    }
    tracing::info!(
        requests = args.requests,
        failures,
        closed = closed.load(Ordering::Relaxed),
        "probe finished"
    );

    if failures > 0 {
        anyhow::bail!("{failures} of {} requests failed", args.requests);
    }
    Ok(())
}

/// Send one line and wait for it to come back unchanged.
async fn round_trip(pool: &Pool<NetStream>, seq: u64) -> PoolResult<()> {
    let read_timeout = pool.config().read_timeout();
    pool.with_connection(move |conn| {
        Box::pin(async move {
            let request = format!("ping {seq}\n");
            conn.write_all(request.as_bytes()).await?;

            let mut reply = vec![0u8; request.len()];
            match read_timeout {
                Some(limit) => read_with_timeout(conn, &mut reply, limit).await?,
                None => {
                    conn.read_exact(&mut reply).await?;
                }
            }

            if reply != request.as_bytes() {
                return Err(ConnError::other(format!(
                    "unexpected reply: {:?}",
                    String::from_utf8_lossy(&reply)
                )));
            }
            Ok(())
        })
    })
    .await
}

async fn read_with_timeout(
    stream: &mut NetStream,
    buf: &mut [u8],
    limit: Duration,
) -> Result<(), ConnError> {
    match tokio::time::timeout(limit, stream.read_exact(buf)).await {
        Ok(read) => read.map(|_| ()).map_err(ConnError::from),
        Err(_) => Err(ConnError::Timeout { temporary: true }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe_args(args: &[&str]) -> ProbeArgs {
        let cli = Cli::try_parse_from(args).unwrap();
        match cli.command {
            Commands::Probe(args) => args,
            Commands::Serve { .. } => panic!("expected probe"),
        }
    }

    #[test]
    fn test_probe_flags_map_to_config() {
        let args = probe_args(&[
            "linkpool",
            "probe",
            "--addr",
            "10.0.0.5:6379",
            "--pool-size",
            "4",
            "--read-timeout-ms",
            "-1",
        ]);
        let config = args.pool_config().unwrap().resolve();
        assert_eq!(config.addr(), "10.0.0.5:6379");
        assert_eq!(config.pool_size(), 4);
        assert_eq!(config.read_timeout(), None);
        assert_eq!(config.write_timeout(), None);
    }

    #[test]
    fn test_probe_defaults() {
        let args = probe_args(&["linkpool", "probe"]);
        assert_eq!(args.requests, 100);
        assert_eq!(args.concurrency, 8);
        let config = args.pool_config().unwrap().resolve();
        assert_eq!(config.read_timeout(), Some(Duration::from_secs(3)));
    }
}
