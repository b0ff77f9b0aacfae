//! Connection wrapper with pool bookkeeping

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Weak;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use linkpool_core::{CloseHook, ConnResult, Connection};
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::Instant;

/// Takes back a pooled connection whose wrapper was dropped without being
/// released.
pub(crate) trait Reclaim<C>: Send + Sync {
    /// `raw` is `None` when the connection was already closed by hand.
    fn reclaim(&self, id: u64, raw: Option<C>);
}

/// Capacity held by a pooled wrapper: its semaphore permit and the pool that
/// counts it.
pub(crate) struct Lease<C> {
    permit: OwnedSemaphorePermit,
    pool: Weak<dyn Reclaim<C>>,
}

impl<C> Lease<C> {
    pub(crate) fn new(permit: OwnedSemaphorePermit, pool: Weak<dyn Reclaim<C>>) -> Self {
        Self { permit, pool }
    }
}

/// A connection handed out by the pool.
///
/// Owns the underlying connection exclusively and records when it was created
/// and last used. Pooled wrappers also carry a lease that accounts for them
/// against the pool size. Dropping a pooled wrapper instead of releasing it
/// hands the connection back to its pool, which closes it.
///
/// `Conn` derefs to the underlying connection.
pub struct Conn<C> {
    id: u64,
    /// Always present until the wrapper is closed or dropped
    raw: Option<C>,
    created_at: Instant,
    /// Nanoseconds from `created_at` to the last use
    used_at: AtomicU64,
    lease: Option<Lease<C>>,
}

impl<C> Conn<C> {
    /// Wrap a connection that is not accounted against any pool's capacity.
    ///
    /// Releasing such a wrapper to a pool always closes it.
    pub fn new(raw: C) -> Self {
        Self::build(0, raw, None)
    }

    pub(crate) fn pooled(id: u64, raw: C, lease: Lease<C>) -> Self {
        Self::build(id, raw, Some(lease))
    }

    pub(crate) fn unpooled(id: u64, raw: C) -> Self {
        Self::build(id, raw, None)
    }

    fn build(id: u64, raw: C, lease: Option<Lease<C>>) -> Self {
        Self {
            id,
            raw: Some(raw),
            created_at: Instant::now(),
            used_at: AtomicU64::new(0),
            lease,
        }
    }

    /// Identifier assigned by the pool, unique per pool. Zero for wrappers
    /// built with [`Conn::new`].
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether this connection counts against the pool size.
    pub fn is_pooled(&self) -> bool {
        self.lease.is_some()
    }

    /// When the connection was established
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When the connection was last handed out or returned
    pub fn used_at(&self) -> Instant {
        self.created_at + Duration::from_nanos(self.used_at.load(Ordering::Acquire))
    }

    /// Stamp the current time as the last use.
    pub fn mark_used(&self) {
        let nanos = u64::try_from(self.created_at.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.used_at.store(nanos, Ordering::Release);
    }

    /// Time since the last use
    pub fn idle_duration(&self) -> Duration {
        Instant::now().saturating_duration_since(self.used_at())
    }

    /// Time since the connection was established
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Check whether the connection has outlived the idle timeout or the
    /// maximum age.
    pub(crate) fn is_stale(&self, idle_timeout: Duration, max_age: Option<Duration>) -> bool {
        if self.idle_duration() > idle_timeout {
            return true;
        }
        max_age.is_some_and(|max| self.age() > max)
    }

    /// Give up the lease once the pool has stopped counting this wrapper.
    pub(crate) fn take_permit(&mut self) -> Option<OwnedSemaphorePermit> {
        self.lease.take().map(|lease| lease.permit)
    }

    /// Get a reference to the underlying connection
    pub fn get_ref(&self) -> &C {
        self.raw.as_ref().expect("connection taken")
    }

    /// Get a mutable reference to the underlying connection
    pub fn get_mut(&mut self) -> &mut C {
        self.raw.as_mut().expect("connection taken")
    }
}

impl<C: Connection> Conn<C> {
    /// Close the underlying connection.
    ///
    /// The close hook, when given, sees the connection right before it is
    /// closed. A failing hook is logged and does not stop the close.
    ///
    /// Closing a wrapper that is still pooled also gives its capacity back to
    /// the pool.
    pub async fn close(mut self, hook: Option<&CloseHook<C>>) -> ConnResult<()> {
        let Some(mut raw) = self.raw.take() else {
            return Ok(());
        };
        if let Some(hook) = hook {
            if let Err(e) = hook(&raw) {
                tracing::warn!(conn_id = self.id, error = %e, "close hook failed");
            }
        }
        raw.close().await
    }
}

impl<C> Drop for Conn<C> {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        if let Some(pool) = lease.pool.upgrade() {
            pool.reclaim(self.id, self.raw.take());
        }
        // Capacity is freed only after the pool has stopped counting it
        drop(lease.permit);
    }
}

impl<C> Deref for Conn<C> {
    type Target = C;

    fn deref(&self) -> &Self::Target {
        self.get_ref()
    }
}

impl<C> DerefMut for Conn<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.get_mut()
    }
}

impl<C> fmt::Debug for Conn<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.id)
            .field("pooled", &self.is_pooled())
            .field("age", &self.age())
            .field("idle", &self.idle_duration())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use linkpool_core::ConnError;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Semaphore;

    struct Tracked {
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Connection for Tracked {
        async fn close(&mut self) -> ConnResult<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_conn_is_fresh() {
        let conn = Conn::new(());
        assert_eq!(conn.id(), 0);
        assert!(!conn.is_pooled());
        assert_eq!(conn.used_at(), conn.created_at());
        assert_eq!(conn.idle_duration(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_used_resets_idle_duration() {
        let conn = Conn::new(());
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(conn.idle_duration(), Duration::from_secs(10));
        assert_eq!(conn.age(), Duration::from_secs(10));

        conn.mark_used();
        assert_eq!(conn.idle_duration(), Duration::ZERO);
        assert_eq!(conn.age(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_staleness() {
        let conn = Conn::new(());
        tokio::time::advance(Duration::from_secs(5)).await;

        assert!(!conn.is_stale(Duration::from_secs(10), None));
        assert!(conn.is_stale(Duration::from_secs(4), None));

        conn.mark_used();
        assert!(!conn.is_stale(Duration::from_secs(4), None));
        assert!(conn.is_stale(Duration::from_secs(4), Some(Duration::from_secs(3))));
    }

    /// Records what pooled wrappers hand back on drop
    #[derive(Default)]
    struct Reclaimed {
        seen: parking_lot::Mutex<Vec<(u64, bool)>>,
    }

    impl Reclaim<Tracked> for Reclaimed {
        fn reclaim(&self, id: u64, raw: Option<Tracked>) {
            self.seen.lock().push((id, raw.is_some()));
        }
    }

    fn leased(id: u64, semaphore: &Arc<Semaphore>, pool: &Arc<Reclaimed>) -> Conn<Tracked> {
        let permit = semaphore.clone().try_acquire_owned().unwrap();
        let pool: Weak<dyn Reclaim<Tracked>> = Arc::downgrade(pool) as Weak<dyn Reclaim<Tracked>>;
        let raw = Tracked {
            closes: Arc::new(AtomicUsize::new(0)),
        };
        Conn::pooled(id, raw, Lease::new(permit, pool))
    }

    #[tokio::test]
    async fn test_pooled_conn_returns_permit() {
        let semaphore = Arc::new(Semaphore::new(1));
        let pool = Arc::new(Reclaimed::default());
        let mut conn = leased(7, &semaphore, &pool);
        assert!(conn.is_pooled());
        assert_eq!(semaphore.available_permits(), 0);

        drop(conn.take_permit());
        assert!(!conn.is_pooled());
        assert_eq!(semaphore.available_permits(), 1);

        drop(conn);
        assert!(pool.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_pooled_conn_is_reclaimed() {
        let semaphore = Arc::new(Semaphore::new(1));
        let pool = Arc::new(Reclaimed::default());

        drop(leased(3, &semaphore, &pool));
        assert_eq!(*pool.seen.lock(), vec![(3, true)]);
        assert_eq!(semaphore.available_permits(), 1);

        let conn = leased(4, &semaphore, &pool);
        conn.close(None).await.unwrap();
        assert_eq!(*pool.seen.lock(), vec![(3, true), (4, false)]);
        assert_eq!(semaphore.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_dropped_conn_outliving_pool_frees_permit() {
        let semaphore = Arc::new(Semaphore::new(1));
        let pool = Arc::new(Reclaimed::default());
        let conn = leased(5, &semaphore, &pool);

        drop(pool);
        drop(conn);
        assert_eq!(semaphore.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_close_runs_hook_then_closes() {
        let closes = Arc::new(AtomicUsize::new(0));
        let hooked = Arc::new(AtomicUsize::new(0));
        let seen = hooked.clone();
        let observed = closes.clone();
        let hook: CloseHook<Tracked> = Arc::new(move |tracked: &Tracked| {
            // The connection is still open when the hook runs
            assert_eq!(tracked.closes.load(Ordering::SeqCst), 0);
            seen.fetch_add(1, Ordering::SeqCst);
            Err(ConnError::other("hook failure is only logged"))
        });

        let conn = Conn::new(Tracked { closes: observed });
        conn.close(Some(&hook)).await.expect("close");

        assert_eq!(hooked.load(Ordering::SeqCst), 1);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
