//! Built-in network transport
//!
//! [`NetDialer`] connects to the configured address over TCP (optionally
//! wrapped in TLS) or a unix domain socket and yields [`NetStream`]s, which
//! the pool can hold like any other [`Connection`](linkpool_core::Connection).
//! Use [`PoolBuilder::build_net`](crate::PoolBuilder::build_net) or
//! [`Pool::connect`](crate::Pool::connect) to get a pool wired to it.

mod dialer;
mod stream;

pub use dialer::{KEEP_ALIVE, NetDialer};
pub use stream::NetStream;
