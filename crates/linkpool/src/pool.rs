//! Bounded connection pooling
//!
//! This module provides the pool manager: a size-bounded set of reusable
//! connections with an idle queue, a health check on return, background
//! eviction of stale connections and a warm minimum of idle connections.
//!
//! # Example
//!
//! ```ignore
//! use linkpool::pool::{Pool, PoolConfig};
//!
//! let config = PoolConfig::new("127.0.0.1:6379")
//!     .with_pool_size(16)
//!     .with_min_idle_conns(2)
//!     .with_idle_timeout_ms(300_000);
//!
//! let pool = Pool::connect(config)?;
//! let conn = pool.acquire().await?;
//! // Use connection...
//! pool.release(conn, None, false);
//! pool.close().await?;
//! ```

mod config;
mod pool;
mod stats;


pub use config::{
    DEFAULT_ADDR, DEFAULT_DIAL_TIMEOUT, DEFAULT_IDLE_CHECK_FREQUENCY, DEFAULT_IDLE_TIMEOUT,
    DEFAULT_READ_TIMEOUT, IoTimeout, Network, POOL_SIZE_PER_CPU, PoolConfig, ResolvedConfig,
};
pub use pool::{Pool, PoolBuilder};
pub use stats::PoolStats;
