use rpcproxy_common::transport::TransportFactory;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::pool::PoolShared;

/// Outcome of one eviction sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Idle connections examined
    pub tested: usize,
    /// Connections destroyed (idle too long, failed validation or over `max_idle`)
    pub evicted: usize,
    /// Connections opened to reach `min_idle`
    pub created: usize,
}

/// Background sweeper for idle pooled connections.
///
/// Holds only a weak reference to the pool so it never keeps a dropped pool
/// alive; it exits on the first tick after the pool is gone or closed.
pub(crate) struct Evictor<F: TransportFactory> {
    pool: Weak<PoolShared<F>>,
    interval: Duration,
}

impl<F: TransportFactory> Evictor<F> {
    pub(crate) fn new(pool: Weak<PoolShared<F>>, interval: Duration) -> Self {
        Self { pool, interval }
    }

    /// Starts the evictor task.
    pub(crate) fn spawn_on(self, handle: &Handle) -> JoinHandle<()> {
        handle.spawn(async move {
            self.run().await;
        })
    }

    /// Main eviction loop
    async fn run(self) {
        let mut interval = tokio::time::interval(self.interval);
        // The first tick completes immediately; a fresh pool has nothing to sweep
        interval.tick().await;

        loop {
            let shutdown = match self.pool.upgrade() {
                Some(pool) => pool,
                None => break,
            };
            if shutdown.is_closed() {
                break;
            }

            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.shutdown.notified() => break,
            }
            drop(shutdown);

            let Some(pool) = self.pool.upgrade() else {
                break;
            };
            if pool.is_closed() {
                break;
            }

            let report = Self::sweep(&pool).await;
            if report != SweepReport::default() {
                debug!(
                    tested = report.tested,
                    evicted = report.evicted,
                    created = report.created,
                    "Eviction sweep completed"
                );
            }
        }

        debug!("Evictor stopped");
    }

    /// Tests the oldest idle connections, then tops the pool up to `min_idle`.
    pub(crate) async fn sweep(pool: &Arc<PoolShared<F>>) -> SweepReport {
        let config = pool.config();
        let mut batch = pool.take_oldest_idle(config.tests_per_eviction_run);
        let candidates = std::mem::take(&mut batch.entries);
        let mut report = SweepReport {
            tested: candidates.len(),
            ..SweepReport::default()
        };

        let now = Instant::now();
        let mut survivors = Vec::with_capacity(candidates.len());
        let mut failed = 0;
        for mut entry in candidates {
            let idle_for = now.saturating_duration_since(entry.idle_since);
            let expired = config
                .min_evictable_idle()
                .is_some_and(|limit| idle_for >= limit);

            if expired {
                debug!(connection_id = entry.id, ?idle_for, "Evicting long-idle connection");
                failed += 1;
            } else if pool.factory().validate(&mut entry.conn).await {
                survivors.push(entry);
            } else {
                debug!(connection_id = entry.id, "Evicting idle connection that failed validation");
                failed += 1;
            }
        }
        report.evicted = failed + pool.restore_idle(batch, survivors);

        while pool.reserve_for_min_idle() {
            match pool.create_idle().await {
                Ok(()) => report.created += 1,
                Err(e) => {
                    warn!(error = %e, "Failed to top up idle connections");
                    break;
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use crate::{ConnectionPool, ExhaustionPolicy, PoolConfig};
    use rpcproxy_common::error::{ProxyError, Result};
    use rpcproxy_common::transport::{Endpoint, TransportFactory};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Clone)]
    struct Flaky {
        healthy: Arc<AtomicBool>,
        validate_delay_ms: u64,
    }

    impl TransportFactory for Flaky {
        type Connection = ();

        async fn connect(&self, _endpoint: &Endpoint) -> Result<()> {
            Ok(())
        }

        async fn validate(&self, _conn: &mut ()) -> bool {
            if self.validate_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.validate_delay_ms)).await;
            }
            self.healthy.load(Ordering::SeqCst)
        }
    }

    fn pool(config: PoolConfig) -> (ConnectionPool<Flaky>, Arc<AtomicBool>) {
        let healthy = Arc::new(AtomicBool::new(true));
        let factory = Flaky {
            healthy: Arc::clone(&healthy),
            validate_delay_ms: 0,
        };
        (pool_with(config, factory), healthy)
    }

    /// Pool whose idle checks take 200ms each.
    fn slow_pool(config: PoolConfig) -> ConnectionPool<Flaky> {
        let factory = Flaky {
            healthy: Arc::new(AtomicBool::new(true)),
            validate_delay_ms: 200,
        };
        pool_with(config, factory)
    }

    fn pool_with(config: PoolConfig, factory: Flaky) -> ConnectionPool<Flaky> {
        let endpoint = Endpoint::new("svc.internal", 9090, Duration::from_millis(500));
        let config = PoolConfig {
            eviction_interval_ms: 0,
            ..config
        };
        ConnectionPool::new(factory, endpoint, config).unwrap()
    }

    async fn fill_idle(pool: &ConnectionPool<Flaky>, count: usize) {
        let mut held = Vec::new();
        for _ in 0..count {
            held.push(pool.borrow().await.unwrap());
        }
        for conn in held {
            pool.release(conn).unwrap();
        }
    }

    #[tokio::test]
    async fn test_sweep_limited_to_tests_per_run() {
        let (pool, healthy) = pool(PoolConfig {
            max_size: 6,
            min_idle: Some(0),
            tests_per_eviction_run: 2,
            ..PoolConfig::default()
        });
        fill_idle(&pool, 5).await;
        healthy.store(false, Ordering::SeqCst);

        let report = pool.evict().await;
        assert_eq!(report.tested, 2);
        assert_eq!(report.evicted, 2);
        let stats = pool.stats();
        assert_eq!(stats.idle, 3);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.destroyed, 2);
    }

    #[tokio::test]
    async fn test_sweep_evicts_by_idle_time() {
        let (pool, _healthy) = pool(PoolConfig {
            min_idle: Some(0),
            min_evictable_idle_ms: 10,
            ..PoolConfig::default()
        });
        fill_idle(&pool, 2).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let report = pool.evict().await;
        assert_eq!(report.evicted, 2);
        let stats = pool.stats();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn test_sweep_keeps_healthy_and_tops_up() {
        let (pool, _healthy) = pool(PoolConfig {
            max_size: 4,
            min_idle: Some(3),
            ..PoolConfig::default()
        });
        fill_idle(&pool, 1).await;

        let report = pool.evict().await;
        assert_eq!(report.tested, 1);
        assert_eq!(report.evicted, 0);
        assert_eq!(report.created, 2);
        let stats = pool.stats();
        assert_eq!(stats.idle, 3);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn test_top_up_never_exceeds_max_size() {
        let (pool, _healthy) = pool(PoolConfig {
            max_size: 2,
            min_idle: Some(2),
            ..PoolConfig::default()
        });
        let held = pool.borrow().await.unwrap();

        let report = pool.evict().await;
        assert_eq!(report.created, 1);
        let stats = pool.stats();
        assert_eq!(stats.idle + stats.active, 2);
        assert_eq!(stats.pending, 0);
        pool.release(held).unwrap();
    }

    #[tokio::test]
    async fn test_sweep_on_closed_pool_is_noop() {
        let (pool, _healthy) = pool(PoolConfig::default());
        fill_idle(&pool, 2).await;
        pool.close();

        let report = pool.evict().await;
        assert_eq!(report, super::SweepReport::default());
    }

    #[tokio::test]
    async fn test_cancelled_sweep_frees_slots() {
        let pool = slow_pool(PoolConfig {
            max_size: 1,
            min_idle: Some(0),
            exhaustion_policy: ExhaustionPolicy::Block,
            ..PoolConfig::default()
        });
        fill_idle(&pool, 1).await;

        // Give up while the sweep is still validating
        let cancelled = tokio::time::timeout(Duration::from_millis(10), pool.evict()).await;
        assert!(cancelled.is_err());

        let stats = pool.stats();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.destroyed, 1);

        let conn = pool.borrow().await.unwrap();
        pool.release(conn).unwrap();
        assert_eq!(pool.stats().created, 2);
    }

    #[tokio::test]
    async fn test_cancelled_sweep_after_close() {
        let pool = slow_pool(PoolConfig {
            max_size: 1,
            min_idle: Some(0),
            ..PoolConfig::default()
        });
        fill_idle(&pool, 1).await;

        let mut sweep = Box::pin(pool.evict());
        assert!(tokio::time::timeout(Duration::from_millis(10), &mut sweep).await.is_err());
        pool.close();
        drop(sweep);

        assert_eq!(pool.stats().pending, 0);
        assert!(matches!(pool.borrow().await, Err(ProxyError::PoolClosed)));
    }
}
