//! Connection and dialer traits

use std::future::Future;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::ConnResult;

/// A long-lived connection that the pool can hold and close.
///
/// The pool never performs I/O on a connection itself; all it needs is a way
/// to tear it down once it leaves the pool for good.
#[async_trait]
pub trait Connection: Send + 'static {
    /// Close the connection, releasing its underlying resources.
    ///
    /// Called at most once per connection.
    async fn close(&mut self) -> ConnResult<()>;
}

#[async_trait]
impl Connection for tokio::net::TcpStream {
    async fn close(&mut self) -> ConnResult<()> {
        match self.shutdown().await {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// Factory for new connections
///
/// The pool calls `dial` whenever it needs a fresh connection, wrapping the
/// call in its configured dial timeout. Dropping the returned future must
/// abandon the attempt.
#[async_trait]
pub trait Dialer<C>: Send + Sync + 'static {
    /// Establish a new connection
    async fn dial(&self) -> ConnResult<C>;
}

#[async_trait]
impl<C, D> Dialer<C> for Arc<D>
where
    C: Send + 'static,
    D: Dialer<C> + ?Sized,
{
    async fn dial(&self) -> ConnResult<C> {
        (**self).dial().await
    }
}

/// Dialer backed by an async closure. Build one with [`dial_fn`].
#[derive(Clone)]
pub struct DialFn<F> {
    f: F,
}

/// Wrap an async closure as a [`Dialer`].
///
/// ```ignore
/// let dialer = dial_fn(|| async { Ok(TcpStream::connect("127.0.0.1:7000").await?) });
/// ```
pub fn dial_fn<F>(f: F) -> DialFn<F> {
    DialFn { f }
}

#[async_trait]
impl<C, F, Fut> Dialer<C> for DialFn<F>
where
    C: Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ConnResult<C>> + Send + 'static,
{
    async fn dial(&self) -> ConnResult<C> {
        (self.f)().await
    }
}

/// Hook invoked exactly once per physical close, with the connection that is
/// about to be closed. Its error is only logged.
pub type CloseHook<C> = Arc<dyn Fn(&C) -> ConnResult<()> + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ConnError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_dial_fn_invokes_closure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let dialer = dial_fn(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<usize, ConnError>(n) }
        });

        assert_eq!(dialer.dial().await.unwrap(), 0);
        assert_eq!(dialer.dial().await.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_arc_dialer_delegates() {
        let dialer: Arc<dyn Dialer<u8>> = Arc::new(dial_fn(|| async {
            Err::<u8, _>(ConnError::other("refused"))
        }));
        let err = dialer.dial().await.unwrap_err();
        assert_eq!(err.to_string(), "refused");
    }

    #[tokio::test]
    async fn test_tcp_stream_close() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (mut client, _server) = tokio::join!(
            async { tokio::net::TcpStream::connect(addr).await.unwrap() },
            async { listener.accept().await.unwrap() }
        );
        client.close().await.expect("close");
    }
}
