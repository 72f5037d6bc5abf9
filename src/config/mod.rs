/// Configuration management for puente
///
/// The pool consumes a list of endpoint descriptors plus pool-level
/// parameters. Configuration is loaded from TOML, validated at load time,
/// and never mutated afterwards.
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::EndpointRole;
use crate::error::ConfigError;

/// Main puente configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Datastore endpoints (primary plus read replicas)
    pub endpoints: Vec<EndpointConfig>,
    /// Pool-level parameters
    #[serde(default)]
    pub pool: PoolSettings,
}

/// One datastore endpoint descriptor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub role: EndpointRole,
    /// Positive integer used by weighted selection
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Capacity cap for this endpoint's pool
    #[serde(default = "default_endpoint_max_connections")]
    pub max_connections: u32,
    /// Lower value means preferred
    #[serde(default = "default_priority")]
    pub priority: u32,
}

/// Load-balancing strategy, selected once per pool instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    RoundRobin,
    LeastConnections,
    Random,
    Weighted,
}

impl Strategy {
    /// Strategy name as it appears in configuration and statistics
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::LeastConnections => "least_connections",
            Strategy::Random => "random",
            Strategy::Weighted => "weighted",
        }
    }
}

/// Pool-level parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Minimum connections kept per endpoint pool
    pub min_connections_per_endpoint: u32,
    /// Maximum connections per endpoint pool (further capped by each
    /// endpoint's own max_connections)
    pub max_connections_per_endpoint: u32,
    /// Load-balancing strategy
    pub strategy: Strategy,
    /// Health check probe interval in seconds
    pub health_check_interval_sec: u64,
    /// Per-probe timeout in seconds
    pub health_check_timeout_sec: u64,
    /// Probe latency above this threshold marks the endpoint Degraded
    pub degraded_latency_ms: u64,
    /// Timeout for opening a physical connection and for pool acquisition
    pub connection_timeout_sec: u64,
    /// Default per-statement timeout in seconds
    pub query_timeout_sec: u64,
    /// Total acquisition attempts before giving up
    pub retry_attempts: u32,
    /// Base retry delay in milliseconds (multiplied by the attempt number)
    pub retry_delay_ms: u64,
    /// Queries slower than this are counted as slow
    pub slow_query_threshold_ms: u64,
    /// Connections older than this are closed instead of recycled
    pub max_lifetime_sec: u64,
    /// Connections idle longer than this are closed instead of recycled
    pub idle_timeout_sec: u64,
}

fn default_weight() -> u32 {
    1
}

fn default_endpoint_max_connections() -> u32 {
    10
}

fn default_priority() -> u32 {
    100
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_connections_per_endpoint: 1,
            max_connections_per_endpoint: 10,
            strategy: Strategy::RoundRobin,
            health_check_interval_sec: 10,
            health_check_timeout_sec: 5,
            degraded_latency_ms: 500,
            connection_timeout_sec: 5,
            query_timeout_sec: 30,
            retry_attempts: 3,
            retry_delay_ms: 100,
            slow_query_threshold_ms: 1000,
            max_lifetime_sec: 1800,
            idle_timeout_sec: 600,
        }
    }
}

impl PoolSettings {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_sec)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout_sec)
    }

    pub fn degraded_latency(&self) -> Duration {
        Duration::from_millis(self.degraded_latency_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_sec)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_sec)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn slow_query_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_query_threshold_ms)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_sec)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_sec)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoints.is_empty() {
            return Err(ConfigError::ValidationError(
                "endpoints cannot be empty".to_string(),
            ));
        }

        let mut seen = Vec::with_capacity(self.endpoints.len());
        for endpoint in &self.endpoints {
            let id = format!("{}:{}", endpoint.host, endpoint.port);
            if endpoint.host.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "endpoint host cannot be empty".to_string(),
                ));
            }
            if endpoint.weight == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "endpoint {} weight must be greater than 0",
                    id
                )));
            }
            if endpoint.max_connections == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "endpoint {} max_connections must be greater than 0",
                    id
                )));
            }
            if seen.contains(&id) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate endpoint: {}",
                    id
                )));
            }
            seen.push(id);
        }

        let pool = &self.pool;
        if pool.max_connections_per_endpoint == 0 {
            return Err(ConfigError::ValidationError(
                "max_connections_per_endpoint must be greater than 0".to_string(),
            ));
        }
        if pool.min_connections_per_endpoint > pool.max_connections_per_endpoint {
            return Err(ConfigError::ValidationError(
                "min_connections_per_endpoint cannot exceed max_connections_per_endpoint"
                    .to_string(),
            ));
        }
        if pool.health_check_interval_sec == 0 {
            return Err(ConfigError::ValidationError(
                "health_check_interval_sec must be greater than 0".to_string(),
            ));
        }
        if pool.health_check_timeout_sec >= pool.health_check_interval_sec {
            return Err(ConfigError::ValidationError(
                "health_check_timeout_sec must be less than health_check_interval_sec".to_string(),
            ));
        }
        if pool.connection_timeout_sec == 0 {
            return Err(ConfigError::ValidationError(
                "connection_timeout_sec must be greater than 0".to_string(),
            ));
        }
        if pool.retry_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "retry_attempts must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Create an example configuration file with a primary and two replicas
    pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        let example = Config {
            endpoints: vec![
                EndpointConfig {
                    host: "10.0.1.10".to_string(),
                    port: 5432,
                    database: "app".to_string(),
                    username: "app".to_string(),
                    password: "change-me".to_string(),
                    role: EndpointRole::Primary,
                    weight: 1,
                    max_connections: 20,
                    priority: 0,
                },
                EndpointConfig {
                    host: "10.0.1.11".to_string(),
                    port: 5432,
                    database: "app".to_string(),
                    username: "app".to_string(),
                    password: "change-me".to_string(),
                    role: EndpointRole::ReadReplica,
                    weight: 2,
                    max_connections: 20,
                    priority: 10,
                },
                EndpointConfig {
                    host: "10.0.1.12".to_string(),
                    port: 5432,
                    database: "app".to_string(),
                    username: "app".to_string(),
                    password: "change-me".to_string(),
                    role: EndpointRole::ReadReplica,
                    weight: 1,
                    max_connections: 20,
                    priority: 10,
                },
            ],
            pool: PoolSettings::default(),
        };

        example.save_to_file(path)
    }
}
