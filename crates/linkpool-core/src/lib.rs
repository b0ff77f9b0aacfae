//! linkpool core - Core abstractions shared by the pool and its transports
//!
//! This crate defines:
//!
//! - `Connection` - Trait for anything the pool can hold and close
//! - `Dialer` - Trait for factories that establish new connections
//! - `ConnError` / `PoolError` - Error types for connections and pool operations

mod connection;
mod error;

pub use connection::*;
pub use error::*;
