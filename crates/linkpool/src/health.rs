//! Health classification for returned connections
//!
//! When a caller gives a connection back, the pool looks at the error (if
//! any) produced by the last operation on it and decides whether the
//! connection can be reused or must be closed.
//!
//! # Example
//!
//! ```
//! use linkpool::health::{ConnHealth, classify, is_recoverable};
//! use linkpool::ConnError;
//!
//! assert!(is_recoverable(None, false));
//! assert!(!is_recoverable(Some(&ConnError::DeadlineExceeded), true));
//!
//! let timeout = ConnError::Timeout { temporary: true };
//! assert_eq!(classify(Some(&timeout), true), ConnHealth::Usable);
//! assert_eq!(classify(Some(&timeout), false), ConnHealth::Broken);
//! ```

mod classify;


pub use classify::{ConnHealth, classify, is_recoverable};
