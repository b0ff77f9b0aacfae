//! linkpool - Bounded pooling for long-lived connections
//!
//! This crate keeps a size-limited set of connections to one target, hands
//! them out to concurrent callers, checks their health when they come back,
//! evicts stale ones in the background and keeps a minimum number warm. It
//! does not know what protocol runs over the connections: anything that
//! implements [`Connection`] can be pooled, and a built-in TCP/TLS/unix
//! dialer covers the common case.

mod conn;
pub mod health;
pub mod net;
pub mod pool;

pub use conn::Conn;
pub use health::{ConnHealth, classify, is_recoverable};
pub use net::{NetDialer, NetStream};
pub use pool::{IoTimeout, Network, Pool, PoolBuilder, PoolConfig, PoolStats, ResolvedConfig};

pub use linkpool_core::{
    CloseHook, ConnError, ConnResult, Connection, DialFn, Dialer, ExhaustReason, PoolError,
    PoolResult, dial_fn,
};
pub use tokio_util::sync::CancellationToken;
