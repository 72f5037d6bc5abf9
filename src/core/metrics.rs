/// Per-endpoint and process-wide operational counters
///
/// Metrics are mutated only by the pool manager after each operation and
/// read by statistics/reporting callers. Rolling averages use exponential
/// decay: 0.95 weight to history, 0.05 to the new sample.
use std::time::Instant;

use serde::Serialize;

/// Weight given to history when folding a new latency sample into the
/// rolling average.
const ROLLING_DECAY: f64 = 0.95;

/// Per-endpoint counters, one instance per registered endpoint
#[derive(Debug, Clone)]
pub struct EndpointMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Rolling average latency in milliseconds
    pub avg_latency_ms: f64,
    pub last_used: Option<Instant>,
    pub created_at: Instant,
}

impl EndpointMetrics {
    pub fn new() -> Self {
        Self {
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            avg_latency_ms: 0.0,
            last_used: None,
            created_at: Instant::now(),
        }
    }

    /// Record the outcome of one operation against this endpoint
    pub fn record(&mut self, success: bool, latency_ms: f64) {
        self.total_requests += 1;
        if success {
            self.successful_requests += 1;
        } else {
            self.failed_requests += 1;
        }
        self.fold_latency(latency_ms);
        self.last_used = Some(Instant::now());
    }

    fn fold_latency(&mut self, latency_ms: f64) {
        if self.total_requests <= 1 {
            self.avg_latency_ms = latency_ms;
        } else {
            self.avg_latency_ms =
                self.avg_latency_ms * ROLLING_DECAY + latency_ms * (1.0 - ROLLING_DECAY);
        }
    }

    /// Fraction of requests that succeeded, 1.0 when no requests were made
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            1.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64
        }
    }

    /// Seconds since this endpoint's metrics were created
    pub fn age_secs(&self) -> u64 {
        self.created_at.elapsed().as_secs()
    }

    /// Serializable copy of the current counters
    pub fn snapshot(&self) -> EndpointMetricsSnapshot {
        EndpointMetricsSnapshot {
            total_requests: self.total_requests,
            successful_requests: self.successful_requests,
            failed_requests: self.failed_requests,
            avg_latency_ms: self.avg_latency_ms,
            success_rate: self.success_rate(),
            age_secs: self.age_secs(),
            idle_secs: self.last_used.map(|t| t.elapsed().as_secs()),
        }
    }
}

impl Default for EndpointMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable view of one endpoint's metrics
#[derive(Debug, Clone, Serialize)]
pub struct EndpointMetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub avg_latency_ms: f64,
    pub success_rate: f64,
    pub age_secs: u64,
    pub idle_secs: Option<u64>,
}

/// Process-wide counters, mutated under a single mutex by the manager
#[derive(Debug, Clone, Default, Serialize)]
pub struct GlobalStats {
    pub total_queries: u64,
    pub successful_queries: u64,
    pub failed_queries: u64,
    pub slow_queries: u64,
    pub failovers: u64,
    /// Rolling average query time in milliseconds
    pub avg_query_time_ms: f64,
}

impl GlobalStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of one query
    pub fn record_query(&mut self, success: bool, elapsed_ms: f64, slow: bool) {
        self.total_queries += 1;
        if success {
            self.successful_queries += 1;
        } else {
            self.failed_queries += 1;
        }
        if slow {
            self.slow_queries += 1;
        }
        if self.total_queries <= 1 {
            self.avg_query_time_ms = elapsed_ms;
        } else {
            self.avg_query_time_ms =
                self.avg_query_time_ms * ROLLING_DECAY + elapsed_ms * (1.0 - ROLLING_DECAY);
        }
    }

    /// Record one failover (endpoint re-selection after a failure)
    pub fn record_failover(&mut self) {
        self.failovers += 1;
    }
}
