//! Connection pool implementation

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, join_all};
use linkpool_core::{
    CloseHook, ConnError, ConnResult, Connection, Dialer, ExhaustReason, PoolError, PoolResult,
};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::config::{PoolConfig, ResolvedConfig};
use super::stats::{PoolCounters, PoolStats};
use crate::conn::{Conn, Lease, Reclaim};
use crate::health;
use crate::net::{NetDialer, NetStream};

/// Idle queue and counters. Mutated together under one lock so no observer
/// sees counts that disagree with the queue.
struct PoolState<C> {
    /// Back is the most recently used connection
    idle: VecDeque<Conn<C>>,
    /// Open connections plus dials in flight
    total: usize,
    /// Dials in flight
    dialing: usize,
    closed: bool,
}

struct PoolInner<C> {
    config: ResolvedConfig,
    dialer: Arc<dyn Dialer<C>>,
    on_close: Option<CloseHook<C>>,
    state: Mutex<PoolState<C>>,
    /// One permit per open pooled connection, idle or checked out
    semaphore: Arc<Semaphore>,
    /// Signalled whenever a connection is pushed onto the idle queue
    idle_available: Notify,
    /// Wakes the minimum-idle filler
    fill_requested: Arc<Notify>,
    /// Cancelled on close; stops the background tasks
    cancel: CancellationToken,
    runtime: Handle,
    /// Handed to pooled wrappers so a dropped one finds its way back
    this: Weak<PoolInner<C>>,
    next_id: AtomicU64,
    waiting: AtomicUsize,
    counters: PoolCounters,
}

impl<C> Drop for PoolInner<C> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum Slot<C> {
    Idle(Conn<C>),
    Fresh(OwnedSemaphorePermit),
}

/// A bounded pool of reusable connections to a single target.
///
/// `Pool` is a cheap handle; clones share the same connections. Callers
/// either check connections out with [`Pool::acquire`] and hand them back with
/// [`Pool::release`], or let [`Pool::with_connection`] do both.
///
/// Two background tasks run for the life of the pool: an idle reaper that
/// evicts connections past the idle timeout or max age, and a filler that
/// keeps `min_idle_conns` connections warm. Both stop on [`Pool::close`] or
/// when the last handle is dropped.
///
/// A pooled wrapper that is dropped instead of released is treated as broken:
/// it stops counting against the pool size, is closed in the background and
/// the filler is woken to replace it.
pub struct Pool<C> {
    inner: Arc<PoolInner<C>>,
}

impl<C> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C> fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("addr", &self.inner.config.addr())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Builder for a [`Pool`]
pub struct PoolBuilder<C> {
    config: PoolConfig,
    on_close: Option<CloseHook<C>>,
}

impl<C: Connection> PoolBuilder<C> {
    /// Start building a pool from `config`
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            on_close: None,
        }
    }

    /// Run `hook` on every connection right before it is closed
    pub fn on_close<F>(mut self, hook: F) -> Self
    where
        F: Fn(&C) -> ConnResult<()> + Send + Sync + 'static,
    {
        self.on_close = Some(Arc::new(hook));
        self
    }

    /// Build the pool with a caller-supplied dialer.
    ///
    /// Must be called inside a tokio runtime: the pool spawns its background
    /// tasks immediately.
    pub fn build<D: Dialer<C>>(self, dialer: D) -> PoolResult<Pool<C>> {
        Pool::start(self.config.resolve(), Arc::new(dialer), self.on_close)
    }
}

impl PoolBuilder<NetStream> {
    /// Build the pool with a dialer synthesized from the configured network,
    /// address and TLS settings.
    pub fn build_net(self) -> PoolResult<Pool<NetStream>> {
        let config = self.config.resolve();
        let dialer = NetDialer::from_config(&config)?;
        Pool::start(config, Arc::new(dialer), self.on_close)
    }
}

impl Pool<NetStream> {
    /// Create a pool of network connections to the configured address
    pub fn connect(config: PoolConfig) -> PoolResult<Self> {
        PoolBuilder::new(config).build_net()
    }
}

impl<C> Pool<C> {
    /// Get the resolved pool configuration
    pub fn config(&self) -> &ResolvedConfig {
        &self.inner.config
    }

    /// Check if the pool has been closed
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Get current pool statistics
    pub fn stats(&self) -> PoolStats {
        let (total, idle, dialing) = {
            let state = self.inner.state.lock();
            (state.total, state.idle.len(), state.dialing)
        };
        let in_use = total.saturating_sub(idle + dialing);
        let waiting = self.inner.waiting.load(Ordering::Relaxed);
        self.inner.counters.snapshot(total, idle, in_use, waiting)
    }
}

impl<C: Connection> Pool<C> {
    /// Create a new pool with the given configuration and dialer
    pub fn new<D: Dialer<C>>(config: PoolConfig, dialer: D) -> PoolResult<Self> {
        PoolBuilder::new(config).build(dialer)
    }

    /// Start building a pool, e.g. to attach a close hook
    pub fn builder(config: PoolConfig) -> PoolBuilder<C> {
        PoolBuilder::new(config)
    }

    fn start(
        config: ResolvedConfig,
        dialer: Arc<dyn Dialer<C>>,
        on_close: Option<CloseHook<C>>,
    ) -> PoolResult<Self> {
        let runtime = Handle::try_current().map_err(|_| {
            PoolError::Configuration("connection pool must be built inside a tokio runtime".into())
        })?;

        let inner = Arc::new_cyclic(|this| PoolInner {
            semaphore: Arc::new(Semaphore::new(config.pool_size())),
            state: Mutex::new(PoolState {
                idle: VecDeque::with_capacity(config.pool_size()),
                total: 0,
                dialing: 0,
                closed: false,
            }),
            config,
            dialer,
            on_close,
            idle_available: Notify::new(),
            fill_requested: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
            runtime,
            this: this.clone(),
            next_id: AtomicU64::new(0),
            waiting: AtomicUsize::new(0),
            counters: PoolCounters::default(),
        });

        tracing::debug!(
            addr = %inner.config.addr(),
            pool_size = inner.config.pool_size(),
            min_idle_conns = inner.config.min_idle_conns(),
            "created connection pool"
        );

        inner.runtime.spawn(run_reaper(
            Arc::downgrade(&inner),
            inner.cancel.child_token(),
            inner.config.idle_check_frequency(),
        ));
        inner.runtime.spawn(run_filler(
            Arc::downgrade(&inner),
            Arc::clone(&inner.fill_requested),
            inner.cancel.child_token(),
        ));
        inner.fill_requested.notify_one();

        Ok(Self { inner })
    }

    /// Check out a connection.
    ///
    /// Serves the most recently used idle connection if there is one, dials a
    /// new one if the pool is below its size, and otherwise waits up to the
    /// pool-acquire timeout for either to become possible.
    ///
    /// The whole call, dial included, is bounded by the pool-acquire timeout.
    /// Fails with [`PoolError::Exhausted`] when the wait times out, and with
    /// [`PoolError::Dial`] when the dialer fails or runs out of time.
    pub async fn acquire(&self) -> PoolResult<Conn<C>> {
        self.acquire_cancellable(&CancellationToken::new()).await
    }

    /// Check out a connection, giving up when `cancel` fires.
    ///
    /// Cancellation while waiting for capacity returns
    /// [`PoolError::Exhausted`] and leaves the pool untouched; cancellation
    /// during a dial returns [`PoolError::Dial`] and rolls the dial back.
    pub async fn acquire_cancellable(&self, cancel: &CancellationToken) -> PoolResult<Conn<C>> {
        let inner = &self.inner;
        if self.is_closed() {
            return Err(PoolError::Closed);
        }

        let started = Instant::now();
        let deadline = started + inner.config.pool_timeout();
        let slot = {
            let _waiting = WaitingGuard::enter(&inner.waiting);
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return Err(inner.exhausted(ExhaustReason::Cancelled, started));
                }
                slot = tokio::time::timeout_at(deadline, inner.wait_for_slot()) => {
                    match slot {
                        Ok(slot) => slot?,
                        Err(_) => return Err(inner.exhausted(ExhaustReason::Timeout, started)),
                    }
                }
            }
        };

        let conn = match slot {
            Slot::Idle(conn) => {
                inner.counters.record_hit();
                conn
            }
            Slot::Fresh(permit) => inner.dial_pooled(permit, cancel, deadline).await?,
        };
        conn.mark_used();
        Ok(conn)
    }

    /// Give a connection back to the pool.
    ///
    /// `err` is the error of the last operation performed on the connection,
    /// if any. Healthy connections go back to the idle queue; broken ones are
    /// closed in the background and the filler is woken to replace them. Set
    /// `allow_timeout` when a temporary network timeout leaves the connection
    /// in a reusable state.
    ///
    /// Never blocks.
    pub fn release(&self, conn: Conn<C>, err: Option<&ConnError>, allow_timeout: bool) {
        self.inner.release(conn, err, allow_timeout);
    }

    /// Run `f` with a checked-out connection and release it afterwards.
    ///
    /// The error returned by `f` decides whether the connection is reused.
    /// If `f` panics, or the returned future is dropped before `f` completes,
    /// the connection is closed instead of being reused.
    ///
    /// ```ignore
    /// let reply = pool
    ///     .with_connection(|conn| Box::pin(async move {
    ///         conn.write_all(b"PING\r\n").await?;
    ///         let mut buf = [0u8; 7];
    ///         conn.read_exact(&mut buf).await?;
    ///         Ok(buf)
    ///     }))
    ///     .await?;
    /// ```
    pub async fn with_connection<T, F>(&self, f: F) -> PoolResult<T>
    where
        F: for<'c> FnOnce(&'c mut Conn<C>) -> BoxFuture<'c, ConnResult<T>>,
    {
        self.with_connection_cancellable(&CancellationToken::new(), f)
            .await
    }

    /// Like [`Pool::with_connection`], but the acquire gives up when `cancel`
    /// fires.
    pub async fn with_connection_cancellable<T, F>(
        &self,
        cancel: &CancellationToken,
        f: F,
    ) -> PoolResult<T>
    where
        F: for<'c> FnOnce(&'c mut Conn<C>) -> BoxFuture<'c, ConnResult<T>>,
    {
        // If `f` panics or this future is dropped, `conn` is dropped unreleased
        // and the pool discards it
        let mut conn = self.acquire_cancellable(cancel).await?;
        let result = f(&mut conn).await;
        self.inner.release(conn, result.as_ref().err(), false);
        result.map_err(PoolError::Operation)
    }

    /// Dial a connection outside the pool's capacity.
    ///
    /// The connection does not count against the pool size and is closed,
    /// not requeued, when released.
    pub async fn dial_direct(&self) -> PoolResult<Conn<C>> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        let raw = self
            .inner
            .dial(&self.inner.cancel)
            .await
            .map_err(|e| self.inner.dial_failed(e))?;
        Ok(Conn::unpooled(self.inner.next_id(), raw))
    }

    /// Evict idle connections past the idle timeout or max age.
    ///
    /// The reaper calls this every `idle_check_frequency`; it is exposed for
    /// callers that want to sweep on demand. Returns the number of evicted
    /// connections.
    pub fn reap_stale(&self) -> usize {
        self.inner.reap_stale()
    }

    /// Shut the pool down.
    ///
    /// Stops the background tasks, fails pending and future acquires with
    /// [`PoolError::Closed`] and closes every idle connection. Checked-out
    /// connections are closed when they are released. Close failures are
    /// collected into [`PoolError::Close`] without stopping the other closes.
    #[tracing::instrument(skip(self), fields(addr = %self.inner.config.addr()))]
    pub async fn close(&self) -> PoolResult<()> {
        let inner = &self.inner;
        let idle: Vec<Conn<C>> = {
            let mut state = inner.state.lock();
            if state.closed {
                return Err(PoolError::Closed);
            }
            state.closed = true;
            state.total = state.total.saturating_sub(state.idle.len());
            state.idle.drain(..).collect()
        };

        inner.cancel.cancel();
        inner.semaphore.close();
        inner.idle_available.notify_waiters();

        let hook = inner.on_close.as_ref();
        let timeout = inner.config.dial_timeout();
        let results = join_all(idle.into_iter().map(|mut conn| {
            drop(conn.take_permit());
            close_conn(conn, hook, timeout)
        }))
        .await;

        let errors: Vec<ConnError> = results.into_iter().filter_map(Result::err).collect();
        if errors.is_empty() {
            tracing::info!("connection pool closed");
            Ok(())
        } else {
            tracing::warn!(failed = errors.len(), "connection pool closed with errors");
            Err(PoolError::Close(errors))
        }
    }
}

impl<C: Connection> PoolInner<C> {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Wrap a freshly dialed connection that counts against the pool size.
    fn lease(&self, raw: C, permit: OwnedSemaphorePermit) -> Conn<C> {
        let pool: Weak<dyn Reclaim<C>> = self.this.clone();
        Conn::pooled(self.next_id(), raw, Lease::new(permit, pool))
    }

    fn exhausted(&self, reason: ExhaustReason, started: Instant) -> PoolError {
        self.counters.record_timeout();
        let waited = started.elapsed();
        tracing::debug!(
            %reason,
            waited_ms = waited.as_millis() as u64,
            "gave up waiting for a connection"
        );
        PoolError::Exhausted { reason, waited }
    }

    fn dial_failed(&self, err: ConnError) -> PoolError {
        self.counters.record_dial_failure();
        tracing::warn!(addr = %self.config.addr(), error = %err, "failed to dial connection");
        PoolError::Dial(err)
    }

    /// Wait until an idle connection can be popped or a permit for a new
    /// connection is free.
    async fn wait_for_slot(&self) -> PoolResult<Slot<C>> {
        loop {
            let notified = self.idle_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(conn) = self.pop_idle()? {
                return Ok(Slot::Idle(conn));
            }

            tokio::select! {
                permit = Arc::clone(&self.semaphore).acquire_owned() => {
                    return permit.map(Slot::Fresh).map_err(|_| PoolError::Closed);
                }
                () = &mut notified => {}
            }
        }
    }

    /// Pop the most recently used idle connection, discarding stale ones on
    /// the way.
    fn pop_idle(&self) -> PoolResult<Option<Conn<C>>> {
        let idle_timeout = self.config.idle_timeout();
        let max_age = self.config.max_conn_age();
        let mut stale = Vec::new();

        let popped = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(PoolError::Closed);
            }
            loop {
                match state.idle.pop_back() {
                    Some(conn) if conn.is_stale(idle_timeout, max_age) => {
                        state.total = state.total.saturating_sub(1);
                        stale.push(conn);
                    }
                    popped => break popped,
                }
            }
        };

        if !stale.is_empty() {
            self.discard_stale(stale);
        }
        Ok(popped)
    }

    async fn dial_pooled(
        &self,
        permit: OwnedSemaphorePermit,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> PoolResult<Conn<C>> {
        let reservation = DialReservation::new(&self.state)?;
        // The dial also counts against what is left of the acquire timeout
        let dialed = match tokio::time::timeout_at(deadline, self.dial(cancel)).await {
            Ok(dialed) => dialed,
            Err(elapsed) => Err(elapsed.into()),
        };
        let raw = dialed.map_err(|e| self.dial_failed(e))?;

        let conn = self.lease(raw, permit);
        if !reservation.commit() {
            self.spawn_close(conn, "pool closed");
            return Err(PoolError::Closed);
        }

        self.counters.record_miss();
        tracing::trace!(conn_id = conn.id(), "dialed new connection");
        Ok(conn)
    }

    async fn dial(&self, cancel: &CancellationToken) -> ConnResult<C> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(ConnError::Cancelled),
            () = self.cancel.cancelled() => Err(ConnError::Cancelled),
            dialed = tokio::time::timeout(self.config.dial_timeout(), self.dialer.dial()) => dialed?,
        }
    }

    fn release(&self, conn: Conn<C>, err: Option<&ConnError>, allow_timeout: bool) {
        if !conn.is_pooled() {
            self.spawn_close(conn, "unpooled");
            return;
        }

        let health = health::classify(err, allow_timeout);
        let mut state = self.state.lock();

        if !state.closed && health.is_usable() {
            conn.mark_used();
            state.idle.push_back(conn);
            drop(state);
            self.idle_available.notify_one();
            return;
        }

        state.total = state.total.saturating_sub(1);
        let closed = state.closed;
        drop(state);

        if closed {
            self.spawn_close(conn, "pool closed");
            return;
        }
        if let Some(e) = err {
            tracing::debug!(conn_id = conn.id(), error = %e, "discarding broken connection");
        }
        self.spawn_close(conn, "broken");
        self.fill_requested.notify_one();
    }

    fn reap_stale(&self) -> usize {
        let idle_timeout = self.config.idle_timeout();
        let max_age = self.config.max_conn_age();

        let stale: Vec<Conn<C>> = {
            let mut state = self.state.lock();
            if state.closed {
                return 0;
            }
            let mut stale = Vec::new();
            // Oldest first; the front of the queue has been idle longest
            for conn in std::mem::take(&mut state.idle) {
                if conn.is_stale(idle_timeout, max_age) {
                    stale.push(conn);
                } else {
                    state.idle.push_back(conn);
                }
            }
            state.total = state.total.saturating_sub(stale.len());
            stale
        };

        let reaped = stale.len();
        if reaped > 0 {
            tracing::debug!(reaped, "reaped stale idle connections");
            self.discard_stale(stale);
        }
        reaped
    }

    fn discard_stale(&self, stale: Vec<Conn<C>>) {
        self.counters.record_stale(stale.len());
        for conn in stale {
            self.spawn_close(conn, "stale");
        }
        self.fill_requested.notify_one();
    }

    /// Dial idle connections until `min_idle_conns` are waiting or the pool
    /// is full. Best effort: the first dial failure ends the round and the next
    /// reaper tick starts another.
    async fn fill_min_idle(&self) {
        let min_idle = self.config.min_idle_conns();
        loop {
            {
                let state = self.state.lock();
                if state.closed || state.idle.len() >= min_idle {
                    return;
                }
            }

            let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
                return;
            };
            let Ok(reservation) = DialReservation::new(&self.state) else {
                return;
            };

            let raw = match self.dial(&self.cancel).await {
                Ok(raw) => raw,
                Err(e) => {
                    self.counters.record_dial_failure();
                    tracing::warn!(
                        addr = %self.config.addr(),
                        error = %e,
                        "failed to dial minimum idle connection"
                    );
                    return;
                }
            };

            let conn = self.lease(raw, permit);
            let conn_id = conn.id();
            if let Err(conn) = reservation.commit_idle(conn) {
                self.spawn_close(conn, "pool closed");
                return;
            }
            tracing::trace!(conn_id, "added idle connection");
            self.idle_available.notify_one();
        }
    }

    /// Close a connection that has already left the pool's tracking.
    fn spawn_close(&self, mut conn: Conn<C>, reason: &'static str) {
        drop(conn.take_permit());
        let hook = self.on_close.clone();
        let timeout = self.config.dial_timeout();
        self.runtime.spawn(async move {
            let conn_id = conn.id();
            if let Err(e) = close_conn(conn, hook.as_ref(), timeout).await {
                tracing::warn!(conn_id, reason, error = %e, "failed to close connection");
            }
        });
    }
}

impl<C: Connection> Reclaim<C> for PoolInner<C> {
    fn reclaim(&self, id: u64, raw: Option<C>) {
        let closed = {
            let mut state = self.state.lock();
            state.total = state.total.saturating_sub(1);
            state.closed
        };
        if std::thread::panicking() {
            tracing::warn!(conn_id = id, "connection dropped while panicking");
        } else {
            tracing::debug!(conn_id = id, "connection dropped without release");
        }
        if let Some(raw) = raw {
            self.spawn_close(Conn::unpooled(id, raw), "dropped");
        }
        if !closed {
            self.fill_requested.notify_one();
        }
    }
}

/// Close with an upper bound so an unresponsive peer cannot stall the caller.
async fn close_conn<C: Connection>(
    conn: Conn<C>,
    hook: Option<&CloseHook<C>>,
    timeout: Duration,
) -> ConnResult<()> {
    tokio::time::timeout(timeout, conn.close(hook)).await?
}

async fn run_reaper<C: Connection>(
    pool: Weak<PoolInner<C>>,
    cancel: CancellationToken,
    frequency: Duration,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + frequency, frequency);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(inner) = pool.upgrade() else { break };
        inner.reap_stale();
        // Retries a filler round cut short by a failed dial
        inner.fill_requested.notify_one();
    }
    tracing::trace!("idle reaper stopped");
}

async fn run_filler<C: Connection>(
    pool: Weak<PoolInner<C>>,
    requested: Arc<Notify>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            () = requested.notified() => {}
        }
        let Some(inner) = pool.upgrade() else { break };
        inner.fill_min_idle().await;
    }
    tracing::trace!("idle filler stopped");
}

/// Counts a dial in flight against `total` and rolls it back if the dial
/// fails or its future is dropped.
struct DialReservation<'a, C> {
    state: &'a Mutex<PoolState<C>>,
    settled: bool,
}

impl<'a, C> DialReservation<'a, C> {
    fn new(state: &'a Mutex<PoolState<C>>) -> PoolResult<Self> {
        let mut guard = state.lock();
        if guard.closed {
            return Err(PoolError::Closed);
        }
        guard.total += 1;
        guard.dialing += 1;
        Ok(Self {
            state,
            settled: false,
        })
    }

    /// Count the dialed connection as checked out. Returns false, undoing
    /// the reservation, if the pool closed during the dial.
    fn commit(mut self) -> bool {
        self.settled = true;
        let mut state = self.state.lock();
        state.dialing -= 1;
        if state.closed {
            state.total -= 1;
            return false;
        }
        true
    }

    /// Put the dialed connection straight onto the idle queue. Hands it back
    /// if the pool closed during the dial.
    fn commit_idle(mut self, conn: Conn<C>) -> Result<(), Conn<C>> {
        self.settled = true;
        let mut state = self.state.lock();
        state.dialing -= 1;
        if state.closed {
            state.total -= 1;
            return Err(conn);
        }
        state.idle.push_back(conn);
        Ok(())
    }
}

impl<C> Drop for DialReservation<'_, C> {
    fn drop(&mut self) {
        if !self.settled {
            let mut state = self.state.lock();
            state.total -= 1;
            state.dialing -= 1;
        }
    }
}

struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn enter(waiting: &'a AtomicUsize) -> Self {
        waiting.fetch_add(1, Ordering::Relaxed);
        Self(waiting)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}
