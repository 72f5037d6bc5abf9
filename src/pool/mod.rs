/// Bounded per-endpoint connection pool
///
/// Each registered endpoint gets one `EndpointPool` that bounds and reuses
/// physical connections to that endpoint alone. Capacity control is a
/// semaphore; idle connections are kept in a LIFO stack and recycled unless
/// expired or returned in a broken state.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

use crate::core::Endpoint;
use crate::driver::{ConnectionFactory, RawConnection};
use crate::error::{PuenteError, PuenteResult};

/// Idle pool entry with recycling metadata
struct IdleConnection {
    conn: Box<dyn RawConnection>,
    created_at: Instant,
    last_used: Instant,
}

/// Sizing and expiry parameters for one endpoint pool
#[derive(Debug, Clone)]
pub struct EndpointPoolConfig {
    pub min_connections: usize,
    pub max_connections: usize,
    pub connect_timeout: Duration,
    pub max_lifetime: Duration,
    pub idle_timeout: Duration,
}

/// Bounded set of reusable physical connections to one endpoint
pub struct EndpointPool {
    endpoint: Endpoint,
    factory: Arc<dyn ConnectionFactory>,
    config: EndpointPoolConfig,
    idle: Mutex<Vec<IdleConnection>>,
    semaphore: Arc<Semaphore>,
    total: AtomicUsize,
    closed: AtomicBool,
}

impl EndpointPool {
    pub fn new(
        endpoint: Endpoint,
        factory: Arc<dyn ConnectionFactory>,
        config: EndpointPoolConfig,
    ) -> Self {
        let max = config.max_connections.max(1);
        Self {
            endpoint,
            factory,
            config,
            idle: Mutex::new(Vec::with_capacity(max)),
            semaphore: Arc::new(Semaphore::new(max)),
            total: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Pre-open `min_connections` connections
    ///
    /// A failure here is not fatal: the endpoint may recover later, and
    /// acquisition will dial on demand.
    pub async fn warm_up(&self) {
        for _ in 0..self.config.min_connections {
            match self.open_connection().await {
                Ok(conn) => {
                    let mut idle = self.idle.lock().await;
                    idle.push(IdleConnection {
                        conn,
                        created_at: Instant::now(),
                        last_used: Instant::now(),
                    });
                }
                Err(e) => {
                    warn!(endpoint = %self.endpoint.id, error = %e, "warm-up connection failed");
                    break;
                }
            }
        }
    }

    /// Borrow a connection, blocking up to `timeout` for capacity
    ///
    /// Hands back an idle connection when one is available, otherwise opens
    /// a new one under the capacity cap.
    pub async fn acquire(&self, timeout: Duration) -> PuenteResult<Box<dyn RawConnection>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PuenteError::PoolClosed);
        }

        let started = Instant::now();
        let permit = tokio::time::timeout(timeout, self.semaphore.acquire())
            .await
            .map_err(|_| PuenteError::AcquireTimeout {
                endpoint: self.endpoint.id.clone(),
                waited_ms: started.elapsed().as_millis() as u64,
            })?
            .map_err(|_| PuenteError::PoolClosed)?;

        // Prefer an idle connection, discarding expired ones
        let reused = {
            let mut idle = self.idle.lock().await;
            loop {
                match idle.pop() {
                    Some(entry) => {
                        if self.should_recycle(&entry) {
                            drop(idle);
                            self.discard(entry.conn).await;
                            idle = self.idle.lock().await;
                            continue;
                        }
                        break Some(entry.conn);
                    }
                    None => break None,
                }
            }
        };

        let conn = match reused {
            Some(conn) => conn,
            None => match self.open_connection().await {
                Ok(conn) => conn,
                Err(e) => {
                    // Permit is released on drop
                    drop(permit);
                    return Err(e);
                }
            },
        };

        // Capacity is handed back when the connection is released
        std::mem::forget(permit);
        debug!(endpoint = %self.endpoint.id, "connection acquired");
        Ok(conn)
    }

    /// Return a borrowed connection
    ///
    /// Broken or invalid connections are closed rather than recycled; so is
    /// anything returned after shutdown.
    pub async fn release(&self, conn: Box<dyn RawConnection>, broken: bool) {
        self.semaphore.add_permits(1);

        if broken || self.closed.load(Ordering::Acquire) || !conn.is_valid().await {
            self.discard(conn).await;
            return;
        }

        let mut idle = self.idle.lock().await;
        idle.push(IdleConnection {
            conn,
            created_at: Instant::now(),
            last_used: Instant::now(),
        });
    }

    /// Close every idle connection and refuse further acquisitions
    pub async fn close_all(&self) {
        self.closed.store(true, Ordering::Release);

        let drained: Vec<IdleConnection> = {
            let mut idle = self.idle.lock().await;
            idle.drain(..).collect()
        };
        for entry in drained {
            self.discard(entry.conn).await;
        }
        debug!(endpoint = %self.endpoint.id, "endpoint pool closed");
    }

    /// Total connections currently created (idle + borrowed)
    pub fn size(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn open_connection(&self) -> PuenteResult<Box<dyn RawConnection>> {
        let conn = tokio::time::timeout(
            self.config.connect_timeout,
            self.factory.connect(&self.endpoint, self.config.connect_timeout),
        )
        .await
        .map_err(|_| {
            PuenteError::connection(self.endpoint.id.as_str(), "connect timed out")
        })??;
        self.total.fetch_add(1, Ordering::Release);
        Ok(conn)
    }

    async fn discard(&self, mut conn: Box<dyn RawConnection>) {
        if let Err(e) = conn.close().await {
            debug!(endpoint = %self.endpoint.id, error = %e, "error closing connection");
        }
        self.total.fetch_sub(1, Ordering::Release);
    }

    fn should_recycle(&self, entry: &IdleConnection) -> bool {
        entry.created_at.elapsed() > self.config.max_lifetime
            || entry.last_used.elapsed() > self.config.idle_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::EndpointRole;
    use crate::driver::mock::{test_endpoint, MockFactory};

    fn pool_config(min: usize, max: usize) -> EndpointPoolConfig {
        EndpointPoolConfig {
            min_connections: min,
            max_connections: max,
            connect_timeout: Duration::from_secs(1),
            max_lifetime: Duration::from_secs(1800),
            idle_timeout: Duration::from_secs(600),
        }
    }

    #[tokio::test]
    async fn test_warm_up_opens_min_connections() {
        let (factory, behavior) = MockFactory::new();
        let pool = EndpointPool::new(
            test_endpoint("db-1", EndpointRole::Primary),
            factory,
            pool_config(2, 5),
        );

        pool.warm_up().await;
        assert_eq!(pool.size(), 2);
        assert_eq!(behavior.connects.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_acquire_reuses_idle_connection() {
        let (factory, behavior) = MockFactory::new();
        let pool = EndpointPool::new(
            test_endpoint("db-1", EndpointRole::Primary),
            factory,
            pool_config(0, 5),
        );

        let conn = pool.acquire(Duration::from_secs(1)).await.unwrap();
        pool.release(conn, false).await;
        let _conn = pool.acquire(Duration::from_secs(1)).await.unwrap();

        // Second acquire recycled the idle connection instead of dialing
        assert_eq!(behavior.connects.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(pool.size(), 1);
    }

    #[tokio::test]
    async fn test_acquire_times_out_at_capacity() {
        let (factory, _behavior) = MockFactory::new();
        let pool = EndpointPool::new(
            test_endpoint("db-1", EndpointRole::Primary),
            factory,
            pool_config(0, 1),
        );

        let held = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let result = pool.acquire(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(PuenteError::AcquireTimeout { .. })));

        pool.release(held, false).await;
        assert!(pool.acquire(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_broken_release_closes_connection() {
        let (factory, behavior) = MockFactory::new();
        let pool = EndpointPool::new(
            test_endpoint("db-1", EndpointRole::Primary),
            factory,
            pool_config(0, 5),
        );

        let conn = pool.acquire(Duration::from_secs(1)).await.unwrap();
        pool.release(conn, true).await;

        assert_eq!(pool.size(), 0);
        assert_eq!(behavior.closes.load(std::sync::atomic::Ordering::SeqCst), 1);

        // Next acquire must dial a fresh connection
        let _conn = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert_eq!(behavior.connects.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_connect_failure_releases_capacity() {
        let (factory, behavior) = MockFactory::new();
        let pool = EndpointPool::new(
            test_endpoint("db-1", EndpointRole::Primary),
            factory,
            pool_config(0, 1),
        );

        behavior.refuse_endpoint("db-1:5432");
        assert!(pool.acquire(Duration::from_secs(1)).await.is_err());

        // The failed attempt must not leak its capacity permit
        behavior.allow_endpoint("db-1:5432");
        assert!(pool.acquire(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_connection_not_recycled() {
        let (factory, behavior) = MockFactory::new();
        let pool = EndpointPool::new(
            test_endpoint("db-1", EndpointRole::Primary),
            factory,
            pool_config(0, 5),
        );

        let conn = pool.acquire(Duration::from_secs(1)).await.unwrap();
        behavior.set_invalid(true);
        pool.release(conn, false).await;

        assert_eq!(pool.size(), 0);
        assert_eq!(behavior.closes.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_all_rejects_further_acquires() {
        let (factory, behavior) = MockFactory::new();
        let pool = EndpointPool::new(
            test_endpoint("db-1", EndpointRole::Primary),
            factory,
            pool_config(1, 5),
        );

        pool.warm_up().await;
        pool.close_all().await;

        assert_eq!(pool.size(), 0);
        assert_eq!(behavior.closes.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(matches!(
            pool.acquire(Duration::from_secs(1)).await,
            Err(PuenteError::PoolClosed)
        ));
    }

    #[tokio::test]
    async fn test_release_after_close_discards() {
        let (factory, behavior) = MockFactory::new();
        let pool = EndpointPool::new(
            test_endpoint("db-1", EndpointRole::Primary),
            factory,
            pool_config(0, 5),
        );

        let conn = pool.acquire(Duration::from_secs(1)).await.unwrap();
        pool.close_all().await;
        pool.release(conn, false).await;

        assert_eq!(pool.size(), 0);
        assert_eq!(behavior.closes.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
