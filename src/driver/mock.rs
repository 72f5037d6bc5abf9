/// Scriptable in-memory driver used across the crate's unit tests
///
/// Failures are scripted on the shared [`MockBehavior`]: refuse all
/// connects, refuse specific endpoints, fail the next N connects or
/// executes, or delay executes per endpoint (to simulate probe latency).
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{ConnectionFactory, RawConnection, Row, Value};
use crate::core::Endpoint;
use crate::error::{PuenteError, PuenteResult};

#[derive(Default)]
pub(crate) struct MockBehavior {
    /// Endpoints whose connects are refused
    pub refused_endpoints: Mutex<HashSet<String>>,
    /// Artificial execute delay per endpoint
    pub execute_delays: Mutex<HashMap<String, Duration>>,
    /// The next N connects fail, regardless of endpoint
    pub fail_next_connects: AtomicU32,
    /// The next N executes fail, regardless of endpoint
    pub fail_next_executes: AtomicU32,
    /// When set, every open connection reports itself invalid
    pub invalid_connections: AtomicBool,

    pub connects: AtomicU32,
    pub executes: AtomicU32,
    pub commits: AtomicU32,
    pub rollbacks: AtomicU32,
    pub closes: AtomicU32,
    /// Connects per endpoint id
    pub connects_by_endpoint: Mutex<HashMap<String, u32>>,
}

impl MockBehavior {
    pub fn refuse_endpoint(&self, id: &str) {
        self.refused_endpoints.lock().unwrap().insert(id.to_string());
    }

    pub fn allow_endpoint(&self, id: &str) {
        self.refused_endpoints.lock().unwrap().remove(id);
    }

    pub fn delay_endpoint(&self, id: &str, delay: Duration) {
        self.execute_delays
            .lock()
            .unwrap()
            .insert(id.to_string(), delay);
    }

    pub fn fail_connects(&self, n: u32) {
        self.fail_next_connects.store(n, Ordering::SeqCst);
    }

    pub fn fail_executes(&self, n: u32) {
        self.fail_next_executes.store(n, Ordering::SeqCst);
    }

    pub fn set_invalid(&self, invalid: bool) {
        self.invalid_connections.store(invalid, Ordering::SeqCst);
    }

    pub fn connects_to(&self, id: &str) -> u32 {
        self.connects_by_endpoint
            .lock()
            .unwrap()
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

pub(crate) struct MockFactory {
    pub behavior: Arc<MockBehavior>,
}

impl MockFactory {
    pub fn new() -> (Arc<Self>, Arc<MockBehavior>) {
        let behavior = Arc::new(MockBehavior::default());
        (
            Arc::new(Self {
                behavior: Arc::clone(&behavior),
            }),
            behavior,
        )
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        _timeout: Duration,
    ) -> PuenteResult<Box<dyn RawConnection>> {
        self.behavior.connects.fetch_add(1, Ordering::SeqCst);
        {
            let mut by_endpoint = self.behavior.connects_by_endpoint.lock().unwrap();
            *by_endpoint.entry(endpoint.id.clone()).or_insert(0) += 1;
        }

        if MockBehavior::take_one(&self.behavior.fail_next_connects) {
            return Err(PuenteError::connection(
                endpoint.id.as_str(),
                "simulated transient connect failure",
            ));
        }
        if self
            .behavior
            .refused_endpoints
            .lock()
            .unwrap()
            .contains(&endpoint.id)
        {
            return Err(PuenteError::connection(
                endpoint.id.as_str(),
                "connection refused",
            ));
        }

        Ok(Box::new(MockConnection {
            endpoint_id: endpoint.id.clone(),
            behavior: Arc::clone(&self.behavior),
            statement_timeout: None,
        }))
    }
}

pub(crate) struct MockConnection {
    pub endpoint_id: String,
    behavior: Arc<MockBehavior>,
    statement_timeout: Option<Duration>,
}

#[async_trait]
impl RawConnection for MockConnection {
    async fn execute(&mut self, statement: &str, _params: &[Value]) -> PuenteResult<Vec<Row>> {
        self.behavior.executes.fetch_add(1, Ordering::SeqCst);

        let delay = self
            .behavior
            .execute_delays
            .lock()
            .unwrap()
            .get(&self.endpoint_id)
            .copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if MockBehavior::take_one(&self.behavior.fail_next_executes) {
            return Err(PuenteError::query(
                self.endpoint_id.as_str(),
                "simulated statement failure",
            ));
        }

        Ok(vec![Row {
            columns: vec!["statement".to_string(), "endpoint".to_string()],
            values: vec![
                Value::Text(statement.to_string()),
                Value::Text(self.endpoint_id.clone()),
            ],
        }])
    }

    async fn commit(&mut self) -> PuenteResult<()> {
        self.behavior.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&mut self) -> PuenteResult<()> {
        self.behavior.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn set_statement_timeout(&mut self, timeout: Duration) {
        self.statement_timeout = Some(timeout);
    }

    async fn is_valid(&self) -> bool {
        !self.behavior.invalid_connections.load(Ordering::SeqCst)
    }

    async fn close(&mut self) -> PuenteResult<()> {
        self.behavior.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Endpoint fixture shared by unit tests across the crate
pub(crate) fn test_endpoint(host: &str, role: crate::core::EndpointRole) -> Endpoint {
    Endpoint::from_config(&crate::config::EndpointConfig {
        host: host.to_string(),
        port: 5432,
        database: "app".to_string(),
        username: "app".to_string(),
        password: "secret".to_string(),
        role,
        weight: 1,
        max_connections: 10,
        priority: 100,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::EndpointRole;

    #[tokio::test]
    async fn test_scripted_connect_failures() {
        let (factory, behavior) = MockFactory::new();
        let endpoint = test_endpoint("db-1", EndpointRole::Primary);

        behavior.fail_connects(1);
        assert!(factory
            .connect(&endpoint, Duration::from_secs(1))
            .await
            .is_err());
        assert!(factory
            .connect(&endpoint, Duration::from_secs(1))
            .await
            .is_ok());
        assert_eq!(behavior.connects.load(Ordering::SeqCst), 2);
        assert_eq!(behavior.connects_to("db-1:5432"), 2);
    }

    #[tokio::test]
    async fn test_refused_endpoint() {
        let (factory, behavior) = MockFactory::new();
        let endpoint = test_endpoint("db-1", EndpointRole::Primary);

        behavior.refuse_endpoint("db-1:5432");
        assert!(factory
            .connect(&endpoint, Duration::from_secs(1))
            .await
            .is_err());

        behavior.allow_endpoint("db-1:5432");
        assert!(factory
            .connect(&endpoint, Duration::from_secs(1))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_scripted_execute_failure_and_rollback_count() {
        let (factory, behavior) = MockFactory::new();
        let endpoint = test_endpoint("db-1", EndpointRole::Primary);
        let mut conn = factory
            .connect(&endpoint, Duration::from_secs(1))
            .await
            .unwrap();

        behavior.fail_executes(1);
        assert!(conn.execute("SELECT 1", &[]).await.is_err());
        assert!(conn.execute("SELECT 1", &[]).await.is_ok());

        conn.rollback().await.unwrap();
        assert_eq!(behavior.rollbacks.load(Ordering::SeqCst), 1);
    }
}
