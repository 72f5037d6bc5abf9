/// Connection pool manager: the single entry point applications use
///
/// Composes the endpoint registry, health monitor, load balancer, and
/// per-endpoint pools into a resilient acquire/execute/release protocol.
/// The manager is an explicitly constructed instance owned by the process's
/// composition root; callers needing a shared instance pass it explicitly.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::balance::LoadBalancer;
use crate::config::Config;
use crate::core::metrics::{EndpointMetrics, EndpointMetricsSnapshot, GlobalStats};
use crate::core::{Endpoint, EndpointRegistry};
use crate::driver::{ConnectionFactory, RawConnection, Row, Value};
use crate::error::{PuenteError, PuenteResult};
use crate::health::{HealthMonitor, HealthState, ProbeConfig};
use crate::pool::{EndpointPool, EndpointPoolConfig};

/// Snapshot returned by `health_check`, suitable for liveness/readiness
/// probes
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub any_healthy: bool,
    pub all_healthy: bool,
    pub replicas_available: bool,
    pub write_primary_available: bool,
}

/// Static pool configuration reported alongside statistics
#[derive(Debug, Clone, Serialize)]
pub struct PoolConfigSummary {
    pub total_endpoints: usize,
    pub healthy_endpoints: usize,
    pub strategy: &'static str,
    pub health_check_interval_sec: u64,
}

/// Read-only aggregation of global stats, per-endpoint metrics, and static
/// configuration
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatistics {
    pub global: GlobalStats,
    pub endpoints: HashMap<String, EndpointMetricsSnapshot>,
    pub config: PoolConfigSummary,
}

struct ManagerInner {
    registry: EndpointRegistry,
    config: Config,
    factory: Arc<dyn ConnectionFactory>,
    balancer: LoadBalancer,
    health: HealthMonitor,
    pools: std::sync::RwLock<HashMap<String, Arc<EndpointPool>>>,
    metrics: std::sync::RwLock<HashMap<String, EndpointMetrics>>,
    stats: std::sync::Mutex<GlobalStats>,
    initialized: AtomicBool,
    closed: AtomicBool,
}

impl ManagerInner {
    async fn release_connection(&self, endpoint_id: &str, conn: Box<dyn RawConnection>, broken: bool) {
        let pool = self.pools.read().unwrap().get(endpoint_id).cloned();
        match pool {
            Some(pool) => pool.release(conn, broken).await,
            None => {
                // Pool map is only empty before initialize; a lease cannot
                // exist then, but don't leak the connection either way.
                let mut conn = conn;
                let _ = conn.close().await;
            }
        }
        self.balancer.update_connection_count(endpoint_id, -1);
    }

    fn record_endpoint(&self, endpoint_id: &str, success: bool, elapsed_ms: f64) {
        let mut metrics = self.metrics.write().unwrap();
        metrics
            .entry(endpoint_id.to_string())
            .or_default()
            .record(success, elapsed_ms);
    }

    fn record_global(&self, success: bool, elapsed_ms: f64, slow: bool) {
        self.stats
            .lock()
            .unwrap()
            .record_query(success, elapsed_ms, slow);
    }
}

/// One physical connection borrowed from a per-endpoint pool
///
/// Release is guaranteed on every exit path: normal flow releases
/// explicitly, and dropping an unreleased lease returns the connection in
/// the background. A lease marked broken is closed instead of recycled.
pub struct ConnectionLease {
    conn: Option<Box<dyn RawConnection>>,
    endpoint_id: String,
    acquired_at: Instant,
    broken: bool,
    inner: Arc<ManagerInner>,
}

impl ConnectionLease {
    /// Identifier of the endpoint this connection belongs to
    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    /// The underlying raw connection
    pub fn connection(&mut self) -> &mut dyn RawConnection {
        self.conn
            .as_mut()
            .expect("lease already released")
            .as_mut()
    }

    /// Condemn this connection: it will be closed on release, not recycled
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Return the connection to its pool
    pub async fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            self.inner
                .release_connection(&self.endpoint_id, conn, self.broken)
                .await;
        }
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let inner = Arc::clone(&self.inner);
            let endpoint_id = self.endpoint_id.clone();
            let broken = self.broken;
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        inner.release_connection(&endpoint_id, conn, broken).await;
                    });
                }
                Err(_) => {
                    // Dropped outside a runtime: the connection and its
                    // capacity permit cannot be returned
                    warn!(endpoint = %endpoint_id, "lease dropped outside runtime, connection leaked");
                }
            }
        }
    }
}

/// High-availability, multi-endpoint connection pool
pub struct PoolManager {
    inner: Arc<ManagerInner>,
}

impl PoolManager {
    /// Build a manager from validated configuration and a driver factory
    pub fn new(config: Config, factory: Arc<dyn ConnectionFactory>) -> PuenteResult<Self> {
        config.validate()?;
        let registry = EndpointRegistry::new(&config.endpoints)?;
        let balancer = LoadBalancer::new(config.pool.strategy);
        let health = HealthMonitor::new(
            registry.clone(),
            Arc::clone(&factory),
            ProbeConfig {
                interval: config.pool.health_check_interval(),
                timeout: config.pool.health_check_timeout(),
                degraded_latency: config.pool.degraded_latency(),
                connect_timeout: config.pool.connection_timeout(),
            },
        );

        Ok(Self {
            inner: Arc::new(ManagerInner {
                registry,
                config,
                factory,
                balancer,
                health,
                pools: std::sync::RwLock::new(HashMap::new()),
                metrics: std::sync::RwLock::new(HashMap::new()),
                stats: std::sync::Mutex::new(GlobalStats::new()),
                initialized: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Construct per-endpoint pools and start health checking
    ///
    /// Idempotent: a second call is a no-op. Returns with every endpoint
    /// already classified by an initial probe round.
    pub async fn initialize(&self) -> PuenteResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(PuenteError::PoolClosed);
        }
        if self.inner.initialized.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let settings = &self.inner.config.pool;
        let mut pools = HashMap::with_capacity(self.inner.registry.len());
        let mut metrics = HashMap::with_capacity(self.inner.registry.len());

        for endpoint in self.inner.registry.all() {
            let max = endpoint
                .max_connections
                .min(settings.max_connections_per_endpoint) as usize;
            // The endpoint's capacity cap also bounds warm-up
            let min = (settings.min_connections_per_endpoint as usize).min(max);
            let pool = Arc::new(EndpointPool::new(
                endpoint.clone(),
                Arc::clone(&self.inner.factory),
                EndpointPoolConfig {
                    min_connections: min,
                    max_connections: max,
                    connect_timeout: settings.connection_timeout(),
                    max_lifetime: settings.max_lifetime(),
                    idle_timeout: settings.idle_timeout(),
                },
            ));
            pool.warm_up().await;
            pools.insert(endpoint.id.clone(), pool);
            metrics.insert(endpoint.id.clone(), EndpointMetrics::new());
        }

        *self.inner.pools.write().unwrap() = pools;
        *self.inner.metrics.write().unwrap() = metrics;

        self.inner.health.start().await;
        info!(
            endpoints = self.inner.registry.len(),
            strategy = self.inner.balancer.strategy_name(),
            "pool manager initialized"
        );
        Ok(())
    }

    /// Acquire a connection, load-balanced over the current healthy set
    ///
    /// `preferred_endpoint` bypasses load balancing (sticky sessions,
    /// explicit replica reads). Selection and pool-acquire failures are
    /// retried with linear backoff (`retry_delay * attempt`) against a
    /// freshly re-evaluated healthy set; an empty healthy set fails fast
    /// with `NoHealthyEndpoints` so callers can tell "nothing to try" from
    /// "tried and lost".
    pub async fn acquire_connection(
        &self,
        read_only: bool,
        preferred_endpoint: Option<&str>,
    ) -> PuenteResult<ConnectionLease> {
        self.ensure_ready()?;

        let attempts = self.inner.config.pool.retry_attempts;
        let mut last_error: Option<PuenteError> = None;

        for attempt in 1..=attempts {
            match self.try_acquire(read_only, preferred_endpoint).await {
                Ok(lease) => return Ok(lease),
                Err(e @ PuenteError::NoHealthyEndpoints) => return Err(e),
                Err(e @ PuenteError::PoolClosed) => return Err(e),
                Err(e @ PuenteError::UnknownEndpoint(_)) => return Err(e),
                Err(e) => {
                    self.inner.stats.lock().unwrap().record_failover();
                    warn!(attempt, error = %e, "acquisition failed, failing over");
                    last_error = Some(e);
                    if attempt < attempts {
                        // Linear backoff; no lock is held across this sleep
                        tokio::time::sleep(self.inner.config.pool.retry_delay() * attempt).await;
                    }
                }
            }
        }

        Err(PuenteError::AllEndpointsExhausted {
            attempts,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        })
    }

    async fn try_acquire(
        &self,
        read_only: bool,
        preferred_endpoint: Option<&str>,
    ) -> PuenteResult<ConnectionLease> {
        let endpoint: Endpoint = match preferred_endpoint {
            Some(id) => self
                .inner
                .registry
                .by_id(id)
                .cloned()
                .ok_or_else(|| PuenteError::UnknownEndpoint(id.to_string()))?,
            None => {
                let healthy = self.inner.health.healthy_endpoints();
                if healthy.is_empty() {
                    return Err(PuenteError::NoHealthyEndpoints);
                }
                self.inner
                    .balancer
                    .select(&healthy, read_only)
                    .ok_or(PuenteError::NoHealthyEndpoints)?
            }
        };

        let pool = self
            .inner
            .pools
            .read()
            .unwrap()
            .get(&endpoint.id)
            .cloned()
            .ok_or_else(|| PuenteError::internal(format!("no pool for endpoint {}", endpoint.id)))?;

        let conn = pool
            .acquire(self.inner.config.pool.connection_timeout())
            .await?;
        self.inner.balancer.update_connection_count(&endpoint.id, 1);
        debug!(endpoint = %endpoint.id, read_only, "lease issued");

        Ok(ConnectionLease {
            conn: Some(conn),
            endpoint_id: endpoint.id,
            acquired_at: Instant::now(),
            broken: false,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Acquire, execute one statement, record metrics, release
    ///
    /// Statement-level errors are never retried: after a rollback attempt
    /// the original error propagates unmodified.
    pub async fn execute_query(
        &self,
        statement: &str,
        params: &[Value],
        read_only: bool,
        timeout: Option<std::time::Duration>,
    ) -> PuenteResult<Vec<Row>> {
        let mut lease = self.acquire_connection(read_only, None).await?;
        let endpoint_id = lease.endpoint_id().to_string();

        let statement_timeout = timeout.unwrap_or_else(|| self.inner.config.pool.query_timeout());
        lease.connection().set_statement_timeout(statement_timeout);

        let started = Instant::now();
        let result = lease.connection().execute(statement, params).await;
        let elapsed = started.elapsed();
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        let slow = elapsed > self.inner.config.pool.slow_query_threshold();
        if slow {
            warn!(
                endpoint = %endpoint_id,
                elapsed_ms = elapsed_ms as u64,
                "slow query"
            );
        }

        match result {
            Ok(rows) => {
                self.inner.record_endpoint(&endpoint_id, true, elapsed_ms);
                self.inner.record_global(true, elapsed_ms, slow);
                lease.release().await;
                Ok(rows)
            }
            Err(e) => {
                if let Err(rollback_err) = lease.connection().rollback().await {
                    warn!(endpoint = %endpoint_id, error = %rollback_err, "rollback failed");
                }
                self.inner.record_endpoint(&endpoint_id, false, elapsed_ms);
                self.inner.record_global(false, elapsed_ms, slow);
                lease.release().await;
                Err(e)
            }
        }
    }

    /// Run statements sequentially on one connection, commit if all succeed
    ///
    /// Returns a success boolean rather than an error so batch callers can
    /// branch on outcome; failures roll back.
    pub async fn execute_transaction(
        &self,
        statements: &[(String, Vec<Value>)],
        read_only: bool,
    ) -> bool {
        let mut lease = match self.acquire_connection(read_only, None).await {
            Ok(lease) => lease,
            Err(e) => {
                warn!(error = %e, "transaction aborted: no connection");
                return false;
            }
        };
        let endpoint_id = lease.endpoint_id().to_string();
        let slow_threshold = self.inner.config.pool.slow_query_threshold();

        for (statement, params) in statements {
            let started = Instant::now();
            let result = lease.connection().execute(statement, params).await;
            let elapsed = started.elapsed();
            let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
            let slow = elapsed > slow_threshold;

            match result {
                Ok(_) => {
                    self.inner.record_endpoint(&endpoint_id, true, elapsed_ms);
                    self.inner.record_global(true, elapsed_ms, slow);
                }
                Err(e) => {
                    warn!(endpoint = %endpoint_id, error = %e, "transaction statement failed");
                    if let Err(rollback_err) = lease.connection().rollback().await {
                        warn!(endpoint = %endpoint_id, error = %rollback_err, "rollback failed");
                    }
                    self.inner.record_endpoint(&endpoint_id, false, elapsed_ms);
                    self.inner.record_global(false, elapsed_ms, slow);
                    lease.release().await;
                    return false;
                }
            }
        }

        match lease.connection().commit().await {
            Ok(()) => {
                lease.release().await;
                true
            }
            Err(e) => {
                warn!(endpoint = %endpoint_id, error = %e, "commit failed");
                lease.mark_broken();
                lease.release().await;
                false
            }
        }
    }

    /// Snapshot of overall availability for liveness/readiness probes
    pub fn health_check(&self) -> HealthReport {
        let healthy = self.inner.health.healthy_endpoints();
        HealthReport {
            any_healthy: !healthy.is_empty(),
            all_healthy: healthy.len() == self.inner.registry.len(),
            replicas_available: healthy.iter().any(|e| e.is_replica()),
            write_primary_available: healthy.iter().any(|e| !e.is_replica()),
        }
    }

    /// Current health state of one endpoint
    pub fn endpoint_state(&self, endpoint_id: &str) -> HealthState {
        self.inner.health.state(endpoint_id)
    }

    /// Administratively exclude (or re-admit) an endpoint
    pub fn set_maintenance(&self, endpoint_id: &str, on: bool) {
        self.inner.health.set_maintenance(endpoint_id, on);
    }

    /// Read-only aggregation of global stats, per-endpoint metrics, and
    /// static configuration; safe to call concurrently with everything else
    pub fn statistics(&self) -> PoolStatistics {
        let endpoints = self
            .inner
            .metrics
            .read()
            .unwrap()
            .iter()
            .map(|(id, m)| (id.clone(), m.snapshot()))
            .collect();

        PoolStatistics {
            global: self.inner.stats.lock().unwrap().clone(),
            endpoints,
            config: PoolConfigSummary {
                total_endpoints: self.inner.registry.len(),
                healthy_endpoints: self.inner.health.healthy_endpoints().len(),
                strategy: self.inner.balancer.strategy_name(),
                health_check_interval_sec: self.inner.config.pool.health_check_interval_sec,
            },
        }
    }

    /// Stop health checking, close every per-endpoint pool
    ///
    /// Subsequent acquisitions fail fast with `PoolClosed`. Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.inner.health.stop().await;
        let pools: Vec<Arc<EndpointPool>> =
            self.inner.pools.read().unwrap().values().cloned().collect();
        for pool in pools {
            pool.close_all().await;
        }
        info!("pool manager shut down");
    }

    fn ensure_ready(&self) -> PuenteResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(PuenteError::PoolClosed);
        }
        if !self.inner.initialized.load(Ordering::Acquire) {
            return Err(PuenteError::internal("pool manager not initialized"));
        }
        Ok(())
    }
}
