pub mod config;
pub mod error;
/// Puente - High-availability connection pool for replicated relational
/// datastores
///
/// Puente maintains bounded connection pools against a primary and any
/// number of read replicas, keeps a live health state per endpoint via
/// background probing, and routes each acquisition through a configurable
/// load-balancing strategy:
/// 1. Writes always land on the primary; reads prefer healthy replicas and
///    fall back to the primary when none are available
/// 2. Acquisition failures fail over to another endpoint with linear
///    backoff until the retry budget is spent
pub mod balance;
pub mod core;
pub mod driver;
pub mod health;
pub mod manager;
pub mod pool;

pub use crate::config::{Config, EndpointConfig, PoolSettings, Strategy};
pub use crate::core::{Endpoint, EndpointRegistry, EndpointRole};
pub use crate::driver::{ConnectionFactory, RawConnection, Row, Value};
pub use crate::error::{ConfigError, ErrorSeverity, PuenteError, PuenteResult};
pub use crate::health::{HealthMonitor, HealthState, ProbeConfig};
pub use crate::manager::{ConnectionLease, HealthReport, PoolManager, PoolStatistics};
