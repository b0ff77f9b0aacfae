//! Usable-vs-broken decision for connections coming back to the pool

use linkpool_core::ConnError;
use serde::{Deserialize, Serialize};

/// Verdict on a connection returned to the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnHealth {
    /// The connection can go back to the idle queue
    Usable,
    /// The connection must be closed and replaced
    Broken,
}

impl ConnHealth {
    /// Check if the connection can be reused.
    pub fn is_usable(&self) -> bool {
        matches!(self, ConnHealth::Usable)
    }
}

/// Classify a connection from the error of its last operation.
///
/// - No error: usable.
/// - Cancellation or an elapsed deadline: broken. The operation may have been
///   cut off halfway through a request, leaving the stream in an unknown
///   state.
/// - A network timeout, when `allow_timeout` is set: usable unless the
///   transport also reports the connection as permanently broken.
/// - Anything else: broken.
pub fn classify(err: Option<&ConnError>, allow_timeout: bool) -> ConnHealth {
    let Some(err) = err else {
        return ConnHealth::Usable;
    };

    if err.is_cancellation() {
        return ConnHealth::Broken;
    }

    if allow_timeout {
        if let Some(temporary) = err.timeout_kind() {
            return if temporary {
                ConnHealth::Usable
            } else {
                ConnHealth::Broken
            };
        }
    }

    ConnHealth::Broken
}

/// Returns true when a connection that produced `err` can be reused.
///
/// See [`classify`] for the rules.
pub fn is_recoverable(err: Option<&ConnError>, allow_timeout: bool) -> bool {
    classify(err, allow_timeout).is_usable()
}
