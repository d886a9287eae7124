//! Bounded connection pool with acquisition timeout and leak reclaim.
//!
//! Capacity is a semaphore: every lease holds one permit for as long as it is
//! outstanding. A lease that outlives `leak_timeout` has its permit taken back
//! by a watchdog task, so a caller that never releases cannot shrink the pool
//! permanently. The leaked session itself is closed when its handle finally
//! drops.

use crate::config::PoolConfig;
use crate::database::result::{QueryResult, SqlValue};
use crate::database::traits::{Backend, PoolStatus, Session};
use crate::error::{DatabaseError, DbResult};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tracing::{debug, error, info, warn};

const LEASED: u8 = 0;
const RELEASED: u8 = 1;
const RECLAIMED: u8 = 2;

struct IdleConnection<S> {
    session: S,
    idle_since: Instant,
}

struct PoolInner<B: Backend> {
    backend: B,
    config: PoolConfig,
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleConnection<B::Session>>>,
    open: AtomicU32,
    leased: AtomicU32,
    waiting: AtomicU32,
    leaks_reclaimed: AtomicU64,
    next_lease_id: AtomicU64,
    closed: AtomicBool,
}

/// Connection pool over a [`Backend`].
pub struct Pool<B: Backend> {
    inner: Arc<PoolInner<B>>,
}

impl<B: Backend> Clone for Pool<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> Pool<B> {
    pub fn new(backend: B, config: PoolConfig) -> Self {
        let max_size = config.max_size as usize;
        Self {
            inner: Arc::new(PoolInner {
                backend,
                config,
                semaphore: Arc::new(Semaphore::new(max_size)),
                idle: Mutex::new(VecDeque::new()),
                open: AtomicU32::new(0),
                leased: AtomicU32::new(0),
                waiting: AtomicU32::new(0),
                leaks_reclaimed: AtomicU64::new(0),
                next_lease_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn backend_name(&self) -> &'static str {
        self.inner.backend.name()
    }

    /// Open connections until `min_size` are idle.
    pub async fn warm_up(&self) -> DbResult<()> {
        let target = self.inner.config.min_size;
        while self.inner.open.load(Ordering::Acquire) < target {
            let session = self.inner.backend.connect().await?;
            self.inner.open.fetch_add(1, Ordering::AcqRel);
            self.inner.idle.lock().push_back(IdleConnection {
                session,
                idle_since: Instant::now(),
            });
        }
        info!(
            backend = self.backend_name(),
            connections = target,
            "Connection pool warmed up"
        );
        Ok(())
    }

    /// Lease a connection, waiting up to `acquire_timeout` for a free slot.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::PoolTimeout`] when no slot frees up in time,
    /// [`DatabaseError::PoolClosed`] after [`Pool::close`], or the backend's
    /// error when a new connection cannot be opened.
    pub async fn acquire(&self) -> DbResult<PooledConnection<B>> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(DatabaseError::PoolClosed);
        }

        let wait = inner.config.acquire_timeout;
        let permit = {
            let _waiting = WaitingGuard::enter(&inner.waiting);
            match timeout(wait, Arc::clone(&inner.semaphore).acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(DatabaseError::PoolClosed),
                Err(_) => {
                    warn!(
                        timeout_ms = wait.as_millis() as u64,
                        leased = inner.leased.load(Ordering::Relaxed),
                        "Timed out waiting for a pooled connection"
                    );
                    return Err(DatabaseError::PoolTimeout(wait.as_millis() as u64));
                }
            }
        };

        let session = match self.take_idle() {
            Some(session) => session,
            None => {
                let session = inner.backend.connect().await?;
                inner.open.fetch_add(1, Ordering::AcqRel);
                debug!(backend = inner.backend.name(), "Opened new connection");
                session
            }
        };

        inner.leased.fetch_add(1, Ordering::AcqRel);
        let id = inner.next_lease_id.fetch_add(1, Ordering::Relaxed);
        let lease = Arc::new(LeaseState {
            state: AtomicU8::new(LEASED),
            permit: Mutex::new(Some(permit)),
        });
        let watchdog = self.spawn_watchdog(id, Arc::clone(&lease));

        Ok(PooledConnection {
            id,
            session: Some(session),
            lease,
            pool: Arc::clone(inner),
            watchdog: Some(watchdog),
            in_flight: false,
            discard: false,
        })
    }

    /// Return a connection. Calling it again on the same handle is a no-op.
    pub fn release(&self, conn: &mut PooledConnection<B>) {
        conn.release();
    }

    pub fn status(&self) -> PoolStatus {
        let inner = &self.inner;
        PoolStatus {
            total: inner.open.load(Ordering::Acquire),
            idle: inner.idle.lock().len() as u32,
            waiting: inner.waiting.load(Ordering::Acquire),
            leased: inner.leased.load(Ordering::Acquire),
            max_size: inner.config.max_size,
            leaks_reclaimed: inner.leaks_reclaimed.load(Ordering::Acquire),
        }
    }

    /// Close idle connections past `idle_timeout`, keeping `min_size` open.
    /// Returns the number closed.
    pub fn reap_idle(&self) -> usize {
        let inner = &self.inner;
        let min = inner.config.min_size;
        let idle_timeout = inner.config.idle_timeout;
        let mut idle = inner.idle.lock();
        let mut closed = 0;

        idle.retain(|conn| {
            let open = inner.open.load(Ordering::Acquire);
            let expired = conn.idle_since.elapsed() >= idle_timeout && open > min;
            if expired || conn.session.is_closed() {
                inner.open.fetch_sub(1, Ordering::AcqRel);
                closed += 1;
                false
            } else {
                true
            }
        });

        if closed > 0 {
            debug!(closed, remaining = idle.len(), "Reaped idle connections");
        }
        closed
    }

    /// Periodically run [`Pool::reap_idle`] until the handle is aborted.
    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let pool = self.clone();
        let period = self.inner.config.reap_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if pool.inner.closed.load(Ordering::Acquire) {
                    break;
                }
                pool.reap_idle();
            }
        })
    }

    /// Refuse new leases and drop idle connections.
    pub fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.semaphore.close();
        let drained = {
            let mut idle = inner.idle.lock();
            let n = idle.len();
            idle.clear();
            n
        };
        inner.open.fetch_sub(drained as u32, Ordering::AcqRel);
        info!(closed_idle = drained, "Connection pool closed");
    }

    fn take_idle(&self) -> Option<B::Session> {
        let mut idle = self.inner.idle.lock();
        while let Some(conn) = idle.pop_front() {
            if conn.session.is_closed() {
                self.inner.open.fetch_sub(1, Ordering::AcqRel);
                continue;
            }
            return Some(conn.session);
        }
        None
    }

    fn spawn_watchdog(&self, id: u64, lease: Arc<LeaseState>) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let leak_timeout = inner.config.leak_timeout;
        // Measured from acquisition, not from when the task first runs.
        let deadline = Instant::now() + leak_timeout;
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if lease
                .state
                .compare_exchange(LEASED, RECLAIMED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                drop(lease.permit.lock().take());
                inner.leased.fetch_sub(1, Ordering::AcqRel);
                inner.open.fetch_sub(1, Ordering::AcqRel);
                inner.leaks_reclaimed.fetch_add(1, Ordering::AcqRel);
                error!(
                    lease_id = id,
                    held_ms = leak_timeout.as_millis() as u64,
                    "Connection lease exceeded leak timeout and was reclaimed"
                );
            }
        })
    }
}

struct LeaseState {
    state: AtomicU8,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

struct WaitingGuard<'a>(&'a AtomicU32);

impl<'a> WaitingGuard<'a> {
    fn enter(counter: &'a AtomicU32) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A leased connection. Returned to the pool when dropped.
pub struct PooledConnection<B: Backend> {
    id: u64,
    session: Option<B::Session>,
    lease: Arc<LeaseState>,
    pool: Arc<PoolInner<B>>,
    watchdog: Option<JoinHandle<()>>,
    in_flight: bool,
    discard: bool,
}

impl<B: Backend> PooledConnection<B> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_reclaimed(&self) -> bool {
        self.lease.state.load(Ordering::Acquire) == RECLAIMED
    }

    pub async fn query(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<QueryResult> {
        self.begin_operation()?;
        let result = match self.session.as_mut() {
            Some(session) => session.query(sql, params).await,
            None => Err(DatabaseError::PoolClosed),
        };
        self.in_flight = false;
        result
    }

    pub async fn simple_execute(&mut self, sql: &str) -> DbResult<()> {
        self.begin_operation()?;
        let result = match self.session.as_mut() {
            Some(session) => session.simple_execute(sql).await,
            None => Err(DatabaseError::PoolClosed),
        };
        self.in_flight = false;
        result
    }

    /// Close the session on release instead of returning it to the idle set.
    pub fn discard(&mut self) {
        self.discard = true;
    }

    /// Return the connection to the pool. Idempotent.
    ///
    /// Sessions that were interrupted mid-operation, marked for discard,
    /// closed by the server, or whose lease was reclaimed are closed instead
    /// of reused.
    pub fn release(&mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.abort();
        }
        let Some(session) = self.session.take() else {
            return;
        };

        let pool = &self.pool;
        if self
            .lease
            .state
            .compare_exchange(LEASED, RELEASED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(lease_id = self.id, "Closing connection from reclaimed lease");
            return;
        }

        pool.leased.fetch_sub(1, Ordering::AcqRel);
        let permit = self.lease.permit.lock().take();
        let reusable = !self.in_flight
            && !self.discard
            && !session.is_closed()
            && !pool.closed.load(Ordering::Acquire);

        if reusable {
            pool.idle.lock().push_back(IdleConnection {
                session,
                idle_since: Instant::now(),
            });
        } else {
            pool.open.fetch_sub(1, Ordering::AcqRel);
            debug!(
                lease_id = self.id,
                interrupted = self.in_flight,
                "Discarding connection"
            );
            drop(session);
        }
        drop(permit);
    }

    /// Whether an earlier operation on this lease was interrupted. Such a
    /// session is never returned to the idle set.
    pub fn is_interrupted(&self) -> bool {
        self.in_flight || self.discard
    }

    fn begin_operation(&mut self) -> DbResult<()> {
        self.ensure_live()?;
        if self.in_flight {
            // The previous operation's future was dropped before completing.
            self.discard = true;
        }
        self.in_flight = true;
        Ok(())
    }

    fn ensure_live(&self) -> DbResult<()> {
        if self.is_reclaimed() {
            return Err(DatabaseError::LeaseReclaimed(
                self.pool.config.leak_timeout.as_millis() as u64,
            ));
        }
        Ok(())
    }
}

impl<B: Backend> Drop for PooledConnection<B> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::mock::MemoryBackend;
    use std::time::Duration;

    async fn settle() {
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
    }

    fn config() -> PoolConfig {
        PoolConfig {
            min_size: 1,
            max_size: 2,
            acquire_timeout: Duration::from_millis(200),
            leak_timeout: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(30),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_and_release() {
        let pool = Pool::new(MemoryBackend::new(), config());

        let mut conn = pool.acquire().await.unwrap();
        assert_eq!(pool.status().leased, 1);
        assert_eq!(pool.status().total, 1);

        conn.release();
        conn.release();
        let status = pool.status();
        assert_eq!(status.leased, 0);
        assert_eq!(status.idle, 1);

        drop(conn);
        assert_eq!(pool.status().idle, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connection_is_reused() {
        let backend = MemoryBackend::new();
        let pool = Pool::new(backend.clone(), config());

        drop(pool.acquire().await.unwrap());
        drop(pool.acquire().await.unwrap());
        assert_eq!(backend.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_timeout() {
        let pool = Pool::new(MemoryBackend::new(), config());
        let _a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();

        let err = pool.acquire().await.err().unwrap();
        assert!(matches!(err, DatabaseError::PoolTimeout(200)));
        assert_eq!(pool.status().waiting, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_is_served_after_release() {
        let pool = Pool::new(MemoryBackend::new(), config());
        let a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|c| c.id()) })
        };
        settle().await;
        assert_eq!(pool.status().waiting, 1);

        drop(a);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_leaked_lease_is_reclaimed_once() {
        let pool = Pool::new(MemoryBackend::new(), config());
        let mut leaked = pool.acquire().await.unwrap();
        let other = pool.acquire().await.unwrap();
        drop(other);

        // The watchdog has not been polled yet; its deadline still counts
        // from acquisition.
        tokio::time::advance(Duration::from_secs(61)).await;
        settle().await;

        let status = pool.status();
        assert_eq!(status.leaks_reclaimed, 1);
        assert_eq!(status.leased, 0);
        assert!(leaked.is_reclaimed());

        // Both slots are usable again.
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();

        let err = leaked.query("SELECT 1", &[]).await.unwrap_err();
        assert!(matches!(err, DatabaseError::LeaseReclaimed(60_000)));

        drop((a, b));
        drop(leaked);
        tokio::time::advance(Duration::from_secs(120)).await;
        settle().await;
        assert_eq!(pool.status().leaks_reclaimed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_leaked_lease_is_reclaimed() {
        let pool = Pool::new(MemoryBackend::new(), config());
        let _a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        settle().await;

        let status = pool.status();
        assert_eq!(status.leaks_reclaimed, 2);
        assert_eq!(status.leased, 0);
        assert_eq!(status.total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_lease_is_not_reclaimed() {
        let pool = Pool::new(MemoryBackend::new(), config());
        drop(pool.acquire().await.unwrap());

        tokio::time::advance(Duration::from_secs(120)).await;
        settle().await;
        assert_eq!(pool.status().leaks_reclaimed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupted_connection_is_discarded() {
        let pool = Pool::new(MemoryBackend::new(), config());
        let mut conn = pool.acquire().await.unwrap();

        let interrupted = timeout(
            Duration::from_millis(10),
            conn.query("SELECT pg_sleep($1)", &[SqlValue::Float(5.0)]),
        )
        .await;
        assert!(interrupted.is_err());

        drop(conn);
        let status = pool.status();
        assert_eq!(status.idle, 0);
        assert_eq!(status.total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interruption_survives_later_operations() {
        let pool = Pool::new(MemoryBackend::new(), config());
        let mut conn = pool.acquire().await.unwrap();

        let interrupted = timeout(
            Duration::from_millis(10),
            conn.query("SELECT pg_sleep($1)", &[SqlValue::Float(5.0)]),
        )
        .await;
        assert!(interrupted.is_err());

        // A later successful call does not make the session reusable again.
        conn.simple_execute("ROLLBACK").await.unwrap();
        assert!(conn.is_interrupted());

        drop(conn);
        let status = pool.status();
        assert_eq!(status.idle, 0);
        assert_eq!(status.total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_warm_up_and_reap() {
        let pool = Pool::new(MemoryBackend::new(), config());
        pool.warm_up().await.unwrap();
        assert_eq!(pool.status().idle, 1);

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        drop(a);
        drop(b);
        assert_eq!(pool.status().idle, 2);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(pool.reap_idle(), 1);
        assert_eq!(pool.status().total, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_pool_rejects() {
        let pool = Pool::new(MemoryBackend::new(), config());
        pool.warm_up().await.unwrap();
        pool.close();
        assert!(matches!(
            pool.acquire().await.err().unwrap(),
            DatabaseError::PoolClosed
        ));
        assert_eq!(pool.status().total, 0);
    }
}
