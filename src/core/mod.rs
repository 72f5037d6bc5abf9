/// Core data model shared across the pool: endpoints and their registry
pub mod metrics;

use serde::{Deserialize, Serialize};

use crate::config::EndpointConfig;
use crate::error::{ConfigError, PuenteResult};

/// Role of a datastore endpoint within the topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointRole {
    /// Writable primary instance
    Primary,
    /// Read-only replica instance
    ReadReplica,
}

impl std::fmt::Display for EndpointRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointRole::Primary => write!(f, "primary"),
            EndpointRole::ReadReplica => write!(f, "read_replica"),
        }
    }
}

/// One addressable datastore instance (primary or replica)
///
/// Created at startup from configuration and immutable for the process
/// lifetime. The identifier is `host:port` and is unique within the registry.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub role: EndpointRole,
    pub weight: u32,
    pub max_connections: u32,
    /// Lower value means preferred
    pub priority: u32,
}

impl Endpoint {
    /// Build an endpoint from its configuration descriptor
    pub fn from_config(config: &EndpointConfig) -> Self {
        Self {
            id: format!("{}:{}", config.host, config.port),
            host: config.host.clone(),
            port: config.port,
            database: config.database.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            role: config.role,
            weight: config.weight,
            max_connections: config.max_connections,
            priority: config.priority,
        }
    }

    /// Network address in `host:port` form
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_replica(&self) -> bool {
        self.role == EndpointRole::ReadReplica
    }
}

/// Validated, immutable list of endpoints
///
/// Construction rejects duplicate identifiers and non-positive
/// weights/capacities; afterwards the registry never changes.
#[derive(Debug, Clone)]
pub struct EndpointRegistry {
    endpoints: Vec<Endpoint>,
}

impl EndpointRegistry {
    /// Build a registry from endpoint descriptors, validating each one
    pub fn new(configs: &[EndpointConfig]) -> PuenteResult<Self> {
        if configs.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one endpoint is required".to_string(),
            )
            .into());
        }

        let mut endpoints = Vec::with_capacity(configs.len());
        for config in configs {
            let endpoint = Endpoint::from_config(config);
            if endpoint.weight == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "endpoint {} has zero weight",
                    endpoint.id
                ))
                .into());
            }
            if endpoint.max_connections == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "endpoint {} has zero max_connections",
                    endpoint.id
                ))
                .into());
            }
            if endpoints.iter().any(|e: &Endpoint| e.id == endpoint.id) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate endpoint: {}",
                    endpoint.id
                ))
                .into());
            }
            endpoints.push(endpoint);
        }

        Ok(Self { endpoints })
    }

    /// All registered endpoints, in configuration order
    pub fn all(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Look up an endpoint by its identifier
    pub fn by_id(&self, id: &str) -> Option<&Endpoint> {
        self.endpoints.iter().find(|e| e.id == id)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}
