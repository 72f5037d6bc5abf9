/// Load-balancing strategies for endpoint selection
///
/// Selection is a stateless policy over the current healthy candidate set.
/// The strategy is chosen once at pool construction; each strategy is its
/// own unit behind the common [`SelectionStrategy`] trait.
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use rand::Rng;

use crate::config::Strategy;
use crate::core::Endpoint;

/// Shared table of in-flight connections per endpoint
///
/// Updated by the manager on every borrow (+1) and release (-1); counts are
/// clamped at zero to tolerate over-release from defensive cleanup paths.
#[derive(Debug, Default)]
pub struct ConnectionCounts {
    counts: Mutex<HashMap<String, u64>>,
}

impl ConnectionCounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, endpoint_id: &str) -> u64 {
        self.counts
            .lock()
            .unwrap()
            .get(endpoint_id)
            .copied()
            .unwrap_or(0)
    }

    /// Apply a delta, clamping the result at zero
    pub fn update(&self, endpoint_id: &str, delta: i64) {
        let mut counts = self.counts.lock().unwrap();
        let entry = counts.entry(endpoint_id.to_string()).or_insert(0);
        if delta >= 0 {
            *entry += delta as u64;
        } else {
            *entry = entry.saturating_sub(delta.unsigned_abs());
        }
    }
}

/// Selection policy over a candidate endpoint set
pub trait SelectionStrategy: Send + Sync {
    /// Pick an index into `candidates`, or None when the set is empty
    fn pick(&self, candidates: &[Endpoint], counts: &ConnectionCounts) -> Option<usize>;
}

/// Round-robin selection with an atomic counter
///
/// The counter increments on every call regardless of outcome, keeping
/// selection fair across repeated calls even as the candidate set changes
/// size between calls.
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionStrategy for RoundRobin {
    fn pick(&self, candidates: &[Endpoint], _counts: &ConnectionCounts) -> Option<usize> {
        let position = self.counter.fetch_add(1, Ordering::Relaxed);
        if candidates.is_empty() {
            return None;
        }
        Some(position % candidates.len())
    }
}

/// Picks the candidate with the fewest in-flight connections
///
/// Ties are broken by candidate list order.
pub struct LeastConnections;

impl SelectionStrategy for LeastConnections {
    fn pick(&self, candidates: &[Endpoint], counts: &ConnectionCounts) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }

        let mut best = 0;
        let mut best_count = counts.get(&candidates[0].id);
        for (index, candidate) in candidates.iter().enumerate().skip(1) {
            let count = counts.get(&candidate.id);
            if count < best_count {
                best = index;
                best_count = count;
            }
        }
        Some(best)
    }
}

/// Uniform random choice among candidates
pub struct Random;

impl SelectionStrategy for Random {
    fn pick(&self, candidates: &[Endpoint], _counts: &ConnectionCounts) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        Some(rand::thread_rng().gen_range(0..candidates.len()))
    }
}

/// Weighted random selection
///
/// Draws a uniform value in `[0, total_weight)` and walks the candidate
/// list accumulating weight until the draw falls within an endpoint's
/// weight band; higher weight means proportionally higher probability.
pub struct Weighted;

impl SelectionStrategy for Weighted {
    fn pick(&self, candidates: &[Endpoint], _counts: &ConnectionCounts) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }

        let total_weight: u64 = candidates.iter().map(|c| c.weight as u64).sum();
        if total_weight == 0 {
            return Some(0);
        }

        let draw = rand::thread_rng().gen_range(0..total_weight);
        let mut accumulated = 0u64;
        for (index, candidate) in candidates.iter().enumerate() {
            accumulated += candidate.weight as u64;
            if draw < accumulated {
                return Some(index);
            }
        }
        Some(candidates.len() - 1)
    }
}

/// Stateless-policy load balancer over healthy endpoint sets
pub struct LoadBalancer {
    strategy: Box<dyn SelectionStrategy>,
    strategy_name: &'static str,
    counts: ConnectionCounts,
}

impl LoadBalancer {
    /// Build a balancer for the configured strategy
    pub fn new(strategy: Strategy) -> Self {
        let boxed: Box<dyn SelectionStrategy> = match strategy {
            Strategy::RoundRobin => Box::new(RoundRobin::new()),
            Strategy::LeastConnections => Box::new(LeastConnections),
            Strategy::Random => Box::new(Random),
            Strategy::Weighted => Box::new(Weighted),
        };
        Self {
            strategy: boxed,
            strategy_name: strategy.name(),
            counts: ConnectionCounts::new(),
        }
    }

    /// Select one endpoint among `candidates`
    ///
    /// When `read_only` is requested and at least one candidate is a
    /// replica, only replicas are eligible; otherwise all candidates are,
    /// so read traffic can fall back to the primary when no replica is
    /// healthy.
    pub fn select(&self, candidates: &[Endpoint], read_only: bool) -> Option<Endpoint> {
        let replicas: Vec<&Endpoint> = candidates.iter().filter(|e| e.is_replica()).collect();
        if read_only && !replicas.is_empty() {
            let filtered: Vec<Endpoint> = replicas.into_iter().cloned().collect();
            return self
                .strategy
                .pick(&filtered, &self.counts)
                .map(|i| filtered[i].clone());
        }

        self.strategy
            .pick(candidates, &self.counts)
            .map(|i| candidates[i].clone())
    }

    /// Called by the manager on every borrow (+1) and release (-1)
    pub fn update_connection_count(&self, endpoint_id: &str, delta: i64) {
        self.counts.update(endpoint_id, delta);
    }

    pub fn connection_count(&self, endpoint_id: &str) -> u64 {
        self.counts.get(endpoint_id)
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy_name
    }
}
