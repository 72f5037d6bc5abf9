/// Background health checking for registered endpoints
///
/// One monitor per pool instance runs a single timer-driven loop that
/// probes every endpoint each interval: open a connection, run a trivial
/// statement, close, all bounded by the probe timeout. Probes against
/// different endpoints run in parallel so one slow endpoint never delays
/// the others. Probe errors are contained here; they only ever surface as
/// a health-state change.
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::{Endpoint, EndpointRegistry};
use crate::driver::ConnectionFactory;

/// Statement used for probe round-trips
const PROBE_STATEMENT: &str = "SELECT 1";

/// Bounded wait for the probe loop to exit before it is aborted
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Current health of one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// Not probed yet
    Unknown,
    /// Probe succeeded within the latency budget
    Healthy,
    /// Reachable but above the latency budget; still eligible for selection
    Degraded,
    /// Unreachable or probe error; excluded until a future probe succeeds
    Failed,
    /// Administratively excluded, overrides probe results
    Maintenance,
}

impl HealthState {
    /// Whether the endpoint may serve traffic
    pub fn is_available(&self) -> bool {
        matches!(self, HealthState::Healthy | HealthState::Degraded)
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HealthState::Unknown => "unknown",
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Failed => "failed",
            HealthState::Maintenance => "maintenance",
        };
        write!(f, "{}", name)
    }
}

/// Probe settings
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub interval: Duration,
    pub timeout: Duration,
    /// Probe latency above this marks the endpoint Degraded
    pub degraded_latency: Duration,
    pub connect_timeout: Duration,
}

/// Maintains a live `HealthState` per endpoint via periodic probes
pub struct HealthMonitor {
    registry: EndpointRegistry,
    factory: Arc<dyn ConnectionFactory>,
    config: ProbeConfig,
    states: Arc<RwLock<HashMap<String, HealthState>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
}

impl HealthMonitor {
    pub fn new(
        registry: EndpointRegistry,
        factory: Arc<dyn ConnectionFactory>,
        config: ProbeConfig,
    ) -> Self {
        let mut states = HashMap::with_capacity(registry.len());
        for endpoint in registry.all() {
            states.insert(endpoint.id.clone(), HealthState::Unknown);
        }
        Self {
            registry,
            factory,
            config,
            states: Arc::new(RwLock::new(states)),
            handle: Mutex::new(None),
            stop_tx: Mutex::new(None),
        }
    }

    /// Run one probe round, then launch the periodic loop
    ///
    /// The inline first round means callers return from startup with every
    /// endpoint already classified. A second call is a no-op.
    pub async fn start(&self) {
        let mut handle_slot = self.handle.lock().await;
        if handle_slot.is_some() {
            return;
        }

        self.probe_round().await;

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let registry = self.registry.clone();
        let factory = Arc::clone(&self.factory);
        let config = self.config.clone();
        let states = Arc::clone(&self.states);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.interval);
            // The first tick completes immediately; the inline round above
            // already covered it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_probe_round(&registry, &factory, &config, &states).await;
                    }
                    _ = stop_rx.changed() => {
                        debug!("health monitor loop stopping");
                        break;
                    }
                }
            }
        });

        *handle_slot = Some(handle);
        *self.stop_tx.lock().await = Some(stop_tx);
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            "health monitor started"
        );
    }

    /// Cancel the loop and wait for it to exit, bounded by a grace period
    pub async fn stop(&self) {
        if let Some(stop_tx) = self.stop_tx.lock().await.take() {
            let _ = stop_tx.send(true);
        }
        if let Some(mut handle) = self.handle.lock().await.take() {
            if tokio::time::timeout(STOP_GRACE, &mut handle).await.is_err() {
                warn!("health monitor did not stop within grace period, aborting");
                handle.abort();
            }
        }
        info!("health monitor stopped");
    }

    /// Endpoints currently eligible for selection (Healthy or Degraded)
    pub fn healthy_endpoints(&self) -> Vec<Endpoint> {
        let states = self.states.read().unwrap();
        self.registry
            .all()
            .iter()
            .filter(|e| {
                states
                    .get(&e.id)
                    .copied()
                    .unwrap_or(HealthState::Unknown)
                    .is_available()
            })
            .cloned()
            .collect()
    }

    /// Current state of one endpoint
    pub fn state(&self, endpoint_id: &str) -> HealthState {
        self.states
            .read()
            .unwrap()
            .get(endpoint_id)
            .copied()
            .unwrap_or(HealthState::Unknown)
    }

    /// Copy of the full health-state map
    pub fn snapshot(&self) -> HashMap<String, HealthState> {
        self.states.read().unwrap().clone()
    }

    /// Administratively exclude (or re-admit) an endpoint
    ///
    /// Maintenance overrides probe results; clearing it returns the
    /// endpoint to Unknown until the next probe round classifies it.
    pub fn set_maintenance(&self, endpoint_id: &str, on: bool) {
        let mut states = self.states.write().unwrap();
        if let Some(state) = states.get_mut(endpoint_id) {
            *state = if on {
                HealthState::Maintenance
            } else {
                HealthState::Unknown
            };
        }
    }

    /// Probe every endpoint once and update the state map
    pub async fn probe_round(&self) {
        run_probe_round(&self.registry, &self.factory, &self.config, &self.states).await;
    }

    #[cfg(test)]
    pub(crate) fn set_state(&self, endpoint_id: &str, state: HealthState) {
        self.states
            .write()
            .unwrap()
            .insert(endpoint_id.to_string(), state);
    }
}

async fn run_probe_round(
    registry: &EndpointRegistry,
    factory: &Arc<dyn ConnectionFactory>,
    config: &ProbeConfig,
    states: &Arc<RwLock<HashMap<String, HealthState>>>,
) {
    let targets: Vec<Endpoint> = {
        let current = states.read().unwrap();
        registry
            .all()
            .iter()
            .filter(|e| current.get(&e.id) != Some(&HealthState::Maintenance))
            .cloned()
            .collect()
    };

    let probes = targets.iter().map(|endpoint| {
        let factory = Arc::clone(factory);
        let config = config.clone();
        async move {
            let state = probe_endpoint(&factory, endpoint, &config).await;
            (endpoint.id.clone(), state)
        }
    });

    let results = join_all(probes).await;

    let mut current = states.write().unwrap();
    for (id, state) in results {
        // Maintenance set while the round was in flight wins
        if current.get(&id) == Some(&HealthState::Maintenance) {
            continue;
        }
        let previous = current.insert(id.clone(), state);
        if previous != Some(state) {
            info!(endpoint = %id, state = %state, "endpoint health changed");
        }
    }
}

/// One lightweight round-trip: connect, run a trivial statement, close
///
/// Every failure mode, including a panic-free timeout, maps to `Failed`;
/// nothing propagates to the loop.
async fn probe_endpoint(
    factory: &Arc<dyn ConnectionFactory>,
    endpoint: &Endpoint,
    config: &ProbeConfig,
) -> HealthState {
    let started = Instant::now();
    let outcome = tokio::time::timeout(config.timeout, async {
        let mut conn = factory.connect(endpoint, config.connect_timeout).await?;
        let result = conn.execute(PROBE_STATEMENT, &[]).await;
        let _ = conn.close().await;
        result
    })
    .await;

    match outcome {
        Ok(Ok(_)) => {
            let elapsed = started.elapsed();
            if elapsed > config.degraded_latency {
                debug!(endpoint = %endpoint.id, latency_ms = elapsed.as_millis() as u64, "probe slow");
                HealthState::Degraded
            } else {
                HealthState::Healthy
            }
        }
        Ok(Err(e)) => {
            debug!(endpoint = %endpoint.id, error = %e, "probe failed");
            HealthState::Failed
        }
        Err(_) => {
            debug!(endpoint = %endpoint.id, "probe timed out");
            HealthState::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointConfig;
    use crate::core::EndpointRole;
    use crate::driver::mock::MockFactory;

    fn registry(hosts: &[(&str, EndpointRole)]) -> EndpointRegistry {
        let configs: Vec<EndpointConfig> = hosts
            .iter()
            .map(|(host, role)| EndpointConfig {
                host: host.to_string(),
                port: 5432,
                database: "app".to_string(),
                username: "app".to_string(),
                password: "secret".to_string(),
                role: *role,
                weight: 1,
                max_connections: 10,
                priority: 100,
            })
            .collect();
        EndpointRegistry::new(&configs).unwrap()
    }

    fn probe_config() -> ProbeConfig {
        ProbeConfig {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(1),
            degraded_latency: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(1),
        }
    }

    fn monitor(
        hosts: &[(&str, EndpointRole)],
    ) -> (HealthMonitor, Arc<crate::driver::mock::MockBehavior>) {
        let (factory, behavior) = MockFactory::new();
        let monitor = HealthMonitor::new(registry(hosts), factory, probe_config());
        (monitor, behavior)
    }

    #[tokio::test]
    async fn test_probe_round_classifies_endpoints() {
        let (monitor, behavior) = monitor(&[
            ("db-1", EndpointRole::Primary),
            ("db-2", EndpointRole::ReadReplica),
        ]);

        assert_eq!(monitor.state("db-1:5432"), HealthState::Unknown);

        behavior.refuse_endpoint("db-2:5432");
        monitor.probe_round().await;

        assert_eq!(monitor.state("db-1:5432"), HealthState::Healthy);
        assert_eq!(monitor.state("db-2:5432"), HealthState::Failed);
    }

    #[tokio::test]
    async fn test_healthy_endpoints_excludes_failed_and_maintenance() {
        let (monitor, behavior) = monitor(&[
            ("db-1", EndpointRole::Primary),
            ("db-2", EndpointRole::ReadReplica),
            ("db-3", EndpointRole::ReadReplica),
        ]);

        behavior.refuse_endpoint("db-2:5432");
        monitor.set_maintenance("db-3:5432", true);
        monitor.probe_round().await;

        let healthy = monitor.healthy_endpoints();
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].id, "db-1:5432");
    }

    #[tokio::test]
    async fn test_slow_probe_marks_degraded_but_available() {
        let (monitor, behavior) = monitor(&[("db-1", EndpointRole::Primary)]);

        behavior.delay_endpoint("db-1:5432", Duration::from_millis(150));
        monitor.probe_round().await;

        assert_eq!(monitor.state("db-1:5432"), HealthState::Degraded);
        assert_eq!(monitor.healthy_endpoints().len(), 1);
    }

    #[tokio::test]
    async fn test_probe_timeout_marks_failed() {
        let (factory, behavior) = MockFactory::new();
        let monitor = HealthMonitor::new(
            registry(&[("db-1", EndpointRole::Primary)]),
            factory,
            ProbeConfig {
                interval: Duration::from_secs(10),
                timeout: Duration::from_millis(100),
                degraded_latency: Duration::from_millis(50),
                connect_timeout: Duration::from_secs(1),
            },
        );

        // Slower than the probe timeout, not just the degraded threshold
        behavior.delay_endpoint("db-1:5432", Duration::from_millis(300));
        monitor.probe_round().await;

        assert_eq!(monitor.state("db-1:5432"), HealthState::Failed);
        assert!(monitor.healthy_endpoints().is_empty());
    }

    #[tokio::test]
    async fn test_failed_endpoint_recovers_on_next_round() {
        let (monitor, behavior) = monitor(&[("db-1", EndpointRole::Primary)]);

        behavior.refuse_endpoint("db-1:5432");
        monitor.probe_round().await;
        assert_eq!(monitor.state("db-1:5432"), HealthState::Failed);

        behavior.allow_endpoint("db-1:5432");
        monitor.probe_round().await;
        assert_eq!(monitor.state("db-1:5432"), HealthState::Healthy);
    }

    #[tokio::test]
    async fn test_maintenance_survives_probe_round() {
        let (monitor, _behavior) = monitor(&[("db-1", EndpointRole::Primary)]);

        monitor.set_maintenance("db-1:5432", true);
        monitor.probe_round().await;
        assert_eq!(monitor.state("db-1:5432"), HealthState::Maintenance);

        monitor.set_maintenance("db-1:5432", false);
        assert_eq!(monitor.state("db-1:5432"), HealthState::Unknown);
        monitor.probe_round().await;
        assert_eq!(monitor.state("db-1:5432"), HealthState::Healthy);
    }

    #[tokio::test]
    async fn test_start_runs_initial_round_and_stop_joins() {
        let (monitor, behavior) = monitor(&[("db-1", EndpointRole::Primary)]);

        monitor.start().await;
        assert_eq!(monitor.state("db-1:5432"), HealthState::Healthy);
        let connects_after_start = behavior.connects.load(std::sync::atomic::Ordering::SeqCst);
        assert!(connects_after_start >= 1);

        monitor.stop().await;
        // A second stop is harmless
        monitor.stop().await;
    }

    #[tokio::test]
    async fn test_start_twice_is_noop() {
        let (monitor, _behavior) = monitor(&[("db-1", EndpointRole::Primary)]);
        monitor.start().await;
        monitor.start().await;
        monitor.stop().await;
    }
}
