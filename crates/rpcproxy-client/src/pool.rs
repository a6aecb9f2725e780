use rpcproxy_common::error::{ProxyError, Result};
use rpcproxy_common::transport::{Endpoint, TransportFactory};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ExhaustionPolicy, PoolConfig};
use crate::evictor::Evictor;

/// A borrowed connection.
///
/// Holds the lease on one pooled connection and derefs to it. The lease ends
/// by passing the handle to [`ConnectionPool::release`] or
/// [`ConnectionPool::invalidate`]; both take the handle by value, so every
/// borrow gets exactly one disposition. A handle dropped without either is
/// treated as broken and its connection destroyed.
pub struct PooledConnection<F: TransportFactory> {
    id: u64,
    created_at: Instant,
    timeout: Duration,
    conn: Option<F::Connection>,
    pool: Arc<PoolShared<F>>,
}

impl<F: TransportFactory> PooledConnection<F> {
    /// Pool-unique id, used to correlate a borrow with its disposition.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Per-call timeout configured for the endpoint (zero means none).
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Time since the underlying connection was opened, not since this borrow.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

impl<F: TransportFactory> Deref for PooledConnection<F> {
    type Target = F::Connection;

    fn deref(&self) -> &F::Connection {
        // `conn` is only taken by `release`, `invalidate` and `drop`, all of
        // which consume the handle
        self.conn
            .as_ref()
            .expect("pooled connection is present until its handle is consumed")
    }
}

impl<F: TransportFactory> DerefMut for PooledConnection<F> {
    fn deref_mut(&mut self) -> &mut F::Connection {
        self.conn
            .as_mut()
            .expect("pooled connection is present until its handle is consumed")
    }
}

impl<F: TransportFactory> fmt::Debug for PooledConnection<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("endpoint", &self.pool.endpoint.to_string())
            .finish_non_exhaustive()
    }
}

impl<F: TransportFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            warn!(
                connection_id = self.id,
                endpoint = %self.pool.endpoint,
                "Pooled connection dropped without release, destroying it"
            );
            self.pool.discard(conn);
        }
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Connections waiting to be borrowed
    pub idle: usize,
    /// Connections currently leased to callers
    pub active: usize,
    /// Connections being created or tested by the evictor
    pub pending: usize,
    pub created: u64,
    pub destroyed: u64,
    pub borrowed: u64,
    pub returned: u64,
    pub invalidated: u64,
    /// Borrows that failed with `PoolExhausted`
    pub exhausted: u64,
}

pub(crate) struct IdleEntry<C> {
    pub(crate) id: u64,
    pub(crate) conn: C,
    pub(crate) created_at: Instant,
    pub(crate) idle_since: Instant,
}

#[derive(Default)]
struct Counters {
    created: u64,
    destroyed: u64,
    borrowed: u64,
    returned: u64,
    invalidated: u64,
    exhausted: u64,
}

struct PoolState<C> {
    /// Oldest at the front, most recently returned at the back
    idle: VecDeque<IdleEntry<C>>,
    active: usize,
    pending: usize,
    /// Share of `pending` reserved by the evictor to reach `min_idle`
    warming: usize,
    closed: bool,
    next_id: u64,
    counters: Counters,
}

impl<C> PoolState<C> {
    fn total(&self) -> usize {
        self.idle.len() + self.active + self.pending
    }
}

enum Step<C> {
    Reuse(IdleEntry<C>),
    Create,
    Wait,
}

/// State shared between the pool, its handles and the evictor.
///
/// All bookkeeping lives behind one mutex. It is only held to move entries
/// and adjust counts; connecting, validating and closing sockets all happen
/// with the lock released.
pub(crate) struct PoolShared<F: TransportFactory> {
    factory: F,
    endpoint: Endpoint,
    config: PoolConfig,
    state: Mutex<PoolState<F::Connection>>,
    available: Notify,
    pub(crate) shutdown: Notify,
}

/// Releases a `pending` slot unless the creation it guards completes.
///
/// Dropping the borrow future mid-connect goes through here, so a caller that
/// gives up never leaks pool capacity.
struct Reservation<'a, F: TransportFactory> {
    shared: &'a PoolShared<F>,
    warming: bool,
    armed: bool,
}

impl<F: TransportFactory> Drop for Reservation<'_, F> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.shared.lock();
            state.pending -= 1;
            if self.warming {
                state.warming -= 1;
            }
            drop(state);
            self.shared.available.notify_one();
        }
    }
}

/// Idle connections checked out of the pool for testing.
///
/// Every entry stays counted in `pending` until the batch is handed back to
/// [`PoolShared::restore_idle`]. Dropping the batch earlier, for instance
/// when a sweep is cancelled mid-validation, counts whatever it still holds
/// as destroyed and frees their slots.
pub(crate) struct IdleBatch<'a, F: TransportFactory> {
    shared: &'a PoolShared<F>,
    pub(crate) entries: Vec<IdleEntry<F::Connection>>,
    outstanding: usize,
}

impl<F: TransportFactory> Drop for IdleBatch<'_, F> {
    fn drop(&mut self) {
        if self.outstanding == 0 {
            return;
        }
        {
            let mut state = self.shared.lock();
            state.pending -= self.outstanding;
            state.counters.destroyed += self.outstanding as u64;
        }
        debug!(
            endpoint = %self.shared.endpoint,
            destroyed = self.outstanding,
            "Idle connections under test dropped before being restored"
        );
        self.shared.available.notify_waiters();
    }
}

impl<F: TransportFactory> PoolShared<F> {
    fn lock(&self) -> MutexGuard<'_, PoolState<F::Connection>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn next_step(&self) -> Result<Step<F::Connection>> {
        let mut state = self.lock();
        if state.closed {
            return Err(ProxyError::PoolClosed);
        }

        if let Some(entry) = state.idle.pop_back() {
            state.active += 1;
            state.counters.borrowed += 1;
            return Ok(Step::Reuse(entry));
        }

        if state.total() < self.config.max_size {
            state.pending += 1;
            return Ok(Step::Create);
        }

        match self.config.exhaustion_policy {
            ExhaustionPolicy::Grow => {
                debug!(
                    endpoint = %self.endpoint,
                    total = state.total(),
                    "Pool exhausted, growing past max_size"
                );
                state.pending += 1;
                Ok(Step::Create)
            }
            ExhaustionPolicy::Block => Ok(Step::Wait),
            ExhaustionPolicy::FailFast => {
                state.counters.exhausted += 1;
                Err(ProxyError::PoolExhausted { waited_ms: 0 })
            }
        }
    }

    fn lease(self: &Arc<Self>, entry: IdleEntry<F::Connection>) -> PooledConnection<F> {
        PooledConnection {
            id: entry.id,
            created_at: entry.created_at,
            timeout: self.endpoint.timeout,
            conn: Some(entry.conn),
            pool: Arc::clone(self),
        }
    }

    /// Opens a connection for a slot already counted in `pending`.
    ///
    /// On success the slot moves to `active` when `lease` is true and to
    /// `idle` otherwise.
    async fn create(self: &Arc<Self>, lease: bool) -> Result<Option<PooledConnection<F>>> {
        let mut reservation = Reservation {
            shared: self.as_ref(),
            warming: !lease,
            armed: true,
        };

        let conn = match self.factory.connect(&self.endpoint).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(endpoint = %self.endpoint, error = %e, "Failed to create pooled connection");
                return Err(e);
            }
        };

        let now = Instant::now();
        let mut state = self.lock();
        reservation.armed = false;
        state.pending -= 1;
        if !lease {
            state.warming -= 1;
        }

        if state.closed {
            state.counters.destroyed += 1;
            drop(state);
            drop(conn);
            self.available.notify_one();
            return Err(ProxyError::PoolClosed);
        }

        let id = state.next_id;
        state.next_id += 1;
        state.counters.created += 1;
        debug!(endpoint = %self.endpoint, connection_id = id, "Created pooled connection");

        let entry = IdleEntry {
            id,
            conn,
            created_at: now,
            idle_since: now,
        };

        if lease {
            state.active += 1;
            state.counters.borrowed += 1;
            drop(state);
            Ok(Some(self.lease(entry)))
        } else {
            state.idle.push_back(entry);
            drop(state);
            self.available.notify_one();
            Ok(None)
        }
    }

    fn accept(&self, id: u64, created_at: Instant, conn: F::Connection) {
        let mut state = self.lock();
        state.active = state.active.saturating_sub(1);
        state.counters.returned += 1;

        let surplus = if state.closed || state.idle.len() >= self.config.max_idle() {
            state.counters.destroyed += 1;
            Some(conn)
        } else {
            state.idle.push_back(IdleEntry {
                id,
                conn,
                created_at,
                idle_since: Instant::now(),
            });
            None
        };
        drop(state);

        if surplus.is_some() {
            debug!(connection_id = id, "Idle limit reached, destroying returned connection");
        }
        drop(surplus);
        self.available.notify_one();
    }

    fn discard(&self, conn: F::Connection) {
        {
            let mut state = self.lock();
            state.active = state.active.saturating_sub(1);
            state.counters.invalidated += 1;
            state.counters.destroyed += 1;
        }
        drop(conn);
        self.available.notify_one();
    }

    /// Moves up to `limit` of the oldest idle connections into `pending`.
    pub(crate) fn take_oldest_idle(&self, limit: usize) -> IdleBatch<'_, F> {
        let mut state = self.lock();
        let entries: Vec<_> = if state.closed {
            Vec::new()
        } else {
            let count = limit.min(state.idle.len());
            state.idle.drain(..count).collect()
        };
        state.pending += entries.len();
        IdleBatch {
            shared: self,
            outstanding: entries.len(),
            entries,
        }
    }

    /// Returns tested connections to the front of the idle list, oldest first.
    ///
    /// Entries that no longer fit under `max_idle` are destroyed. Returns the
    /// number destroyed.
    pub(crate) fn restore_idle(
        &self,
        mut batch: IdleBatch<'_, F>,
        survivors: Vec<IdleEntry<F::Connection>>,
    ) -> usize {
        let mut state = self.lock();
        let failed = batch.outstanding - survivors.len();
        batch.outstanding = 0;
        state.pending -= survivors.len() + failed;
        state.counters.destroyed += failed as u64;

        let mut overflow = Vec::new();
        for entry in survivors.into_iter().rev() {
            if state.closed || state.idle.len() >= self.config.max_idle() {
                state.counters.destroyed += 1;
                overflow.push(entry);
            } else {
                state.idle.push_front(entry);
            }
        }

        // Trim from the oldest end if returns raced past max_idle
        while state.idle.len() > self.config.max_idle() {
            if let Some(entry) = state.idle.pop_front() {
                state.counters.destroyed += 1;
                overflow.push(entry);
            }
        }
        drop(state);

        let destroyed = overflow.len();
        drop(overflow);
        if destroyed > 0 {
            self.available.notify_one();
        }
        destroyed
    }

    /// Reserves a slot for a new idle connection if the pool is below `min_idle`.
    pub(crate) fn reserve_for_min_idle(&self) -> bool {
        let mut state = self.lock();
        // Borrowers' in-flight creations end up active, so only count our own
        if state.closed
            || state.idle.len() + state.warming >= self.config.min_idle()
            || state.total() >= self.config.max_size
        {
            return false;
        }
        state.pending += 1;
        state.warming += 1;
        true
    }

    pub(crate) async fn create_idle(self: &Arc<Self>) -> Result<()> {
        self.create(false).await.map(|_| ())
    }

    pub(crate) fn factory(&self) -> &F {
        &self.factory
    }

    fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            idle: state.idle.len(),
            active: state.active,
            pending: state.pending,
            created: state.counters.created,
            destroyed: state.counters.destroyed,
            borrowed: state.counters.borrowed,
            returned: state.counters.returned,
            invalidated: state.counters.invalidated,
            exhausted: state.counters.exhausted,
        }
    }
}

/// Bounded, self-healing pool of connections to one endpoint.
///
/// # Strategy
///
/// - `borrow` hands out the most recently returned idle connection (LIFO)
/// - with no idle connection and fewer than `max_size` connections, a new one
///   is created through the [`TransportFactory`]
/// - at `max_size`, the configured [`ExhaustionPolicy`] decides between
///   growing, waiting up to `max_wait`, or failing
/// - returned connections beyond `max_idle` are destroyed
/// - a background evictor tests idle connections every eviction interval
///   and keeps `min_idle` connections warm
///
/// # Thread Safety
///
/// The pool can be shared across tasks; `borrow`, `release` and `invalidate`
/// may be called concurrently from any number of callers.
///
/// # Example
///
/// ```rust,no_run
/// use rpcproxy_client::{ConnectionPool, PoolConfig};
/// use rpcproxy_common::{Endpoint, TcpConnector};
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let endpoint = Endpoint::new("127.0.0.1", 9090, Duration::from_millis(500));
/// let pool = ConnectionPool::new(TcpConnector::new(), endpoint, PoolConfig::default())?;
///
/// let conn = pool.borrow().await?;
/// // Use the connection...
/// pool.release(conn)?;
/// # Ok(())
/// # }
/// ```
pub struct ConnectionPool<F: TransportFactory> {
    shared: Arc<PoolShared<F>>,
    evictor: Mutex<Option<JoinHandle<()>>>,
}

impl<F: TransportFactory> ConnectionPool<F> {
    /// Creates a pool bound to `endpoint`.
    ///
    /// No connections are opened here. When eviction is enabled the evictor
    /// task is spawned on the current tokio runtime, so this must be called
    /// from within one.
    pub fn new(factory: F, endpoint: Endpoint, config: PoolConfig) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(PoolShared {
            factory,
            endpoint,
            config,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                active: 0,
                pending: 0,
                warming: 0,
                closed: false,
                next_id: 1,
                counters: Counters::default(),
            }),
            available: Notify::new(),
            shutdown: Notify::new(),
        });

        let evictor = match shared.config.eviction_interval() {
            Some(interval) => {
                let handle = tokio::runtime::Handle::try_current().map_err(|_| {
                    ProxyError::Configuration(
                        "connection pool eviction requires a running tokio runtime".to_string(),
                    )
                })?;
                Some(Evictor::new(Arc::downgrade(&shared), interval).spawn_on(&handle))
            }
            None => None,
        };

        info!(
            endpoint = %shared.endpoint,
            max_size = shared.config.max_size,
            max_idle = shared.config.max_idle(),
            min_idle = shared.config.min_idle(),
            policy = ?shared.config.exhaustion_policy,
            "Connection pool created"
        );

        Ok(Self {
            shared,
            evictor: Mutex::new(evictor),
        })
    }

    /// Borrows a connection, creating one if needed.
    ///
    /// # Errors
    ///
    /// - [`ProxyError::PoolExhausted`] when the policy is `Block` and nothing
    ///   frees up within `max_wait`, or immediately when it is `FailFast`
    /// - [`ProxyError::Transport`] when a new connection cannot be opened
    /// - [`ProxyError::PoolClosed`] after [`close`](Self::close)
    pub async fn borrow(&self) -> Result<PooledConnection<F>> {
        let max_wait = self.shared.config.max_wait();
        let started = Instant::now();

        loop {
            match self.shared.next_step()? {
                Step::Reuse(entry) => {
                    debug!(connection_id = entry.id, "Reusing idle connection");
                    return Ok(self.shared.lease(entry));
                }
                Step::Create => {
                    return match self.shared.create(true).await? {
                        Some(conn) => Ok(conn),
                        None => Err(ProxyError::PoolClosed),
                    };
                }
                Step::Wait => {
                    let elapsed = started.elapsed();
                    if elapsed >= max_wait {
                        self.shared.lock().counters.exhausted += 1;
                        let waited_ms = elapsed.as_millis() as u64;
                        warn!(endpoint = %self.shared.endpoint, waited_ms, "Timed out waiting for a pooled connection");
                        return Err(ProxyError::PoolExhausted { waited_ms });
                    }
                    let _ = tokio::time::timeout(
                        max_wait - elapsed,
                        self.shared.available.notified(),
                    )
                    .await;
                }
            }
        }
    }

    /// Returns a healthy connection to the pool.
    pub fn release(&self, mut conn: PooledConnection<F>) -> Result<()> {
        let inner = self.take_connection(&mut conn)?;
        self.shared.accept(conn.id, conn.created_at, inner);
        Ok(())
    }

    /// Destroys a connection the caller found to be broken.
    pub fn invalidate(&self, mut conn: PooledConnection<F>) -> Result<()> {
        let inner = self.take_connection(&mut conn)?;
        debug!(connection_id = conn.id, "Invalidating pooled connection");
        self.shared.discard(inner);
        Ok(())
    }

    fn take_connection(&self, conn: &mut PooledConnection<F>) -> Result<F::Connection> {
        if !Arc::ptr_eq(&conn.pool, &self.shared) {
            // The handle's own Drop settles it with the pool that issued it
            return Err(ProxyError::InvalidHandle(format!(
                "connection {} was not borrowed from the pool for {}",
                conn.id, self.shared.endpoint
            )));
        }
        conn.conn.take().ok_or_else(|| {
            ProxyError::InvalidHandle(format!("connection {} was already disposed", conn.id))
        })
    }

    /// Stops the evictor and destroys every idle connection.
    ///
    /// Later borrows fail with [`ProxyError::PoolClosed`]. Connections still
    /// leased are destroyed when they come back.
    pub fn close(&self) {
        let idle: Vec<_> = {
            let mut state = self.shared.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let idle: Vec<_> = state.idle.drain(..).collect();
            state.counters.destroyed += idle.len() as u64;
            idle
        };

        // The evictor finishes any sweep in progress and then exits
        if self
            .evictor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
        {
            self.shared.shutdown.notify_waiters();
        }
        self.shared.available.notify_waiters();

        info!(
            endpoint = %self.shared.endpoint,
            destroyed_idle = idle.len(),
            "Connection pool closed"
        );
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn stats(&self) -> PoolStats {
        self.shared.stats()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.shared.endpoint
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Runs one eviction sweep immediately.
    pub async fn evict(&self) -> crate::evictor::SweepReport {
        Evictor::sweep(&self.shared).await
    }
}

impl<F: TransportFactory> Drop for ConnectionPool<F> {
    fn drop(&mut self) {
        self.close();
    }
}
