/// Raw driver boundary
///
/// The pool treats the underlying network driver as an opaque resource: it
/// can open a physical connection to a given endpoint and run a
/// parameterized statement, returning rows or an error. Real drivers
/// implement [`ConnectionFactory`] and [`RawConnection`]; the pool never
/// speaks a wire protocol itself.
#[cfg(test)]
pub(crate) mod mock;

use std::time::Duration;

use async_trait::async_trait;

use crate::core::Endpoint;
use crate::error::PuenteResult;

/// A single parameter value for a statement
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

/// One result row returned by a statement
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub columns: Vec<String>,
    pub values: Vec<Value>,
}

impl Row {
    /// Look up a value by column name
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| &self.values[i])
    }
}

/// One physical connection to a datastore endpoint
///
/// A connection is exclusively held by one caller at a time; the pool
/// enforces this through its lease contract.
#[async_trait]
pub trait RawConnection: Send + Sync {
    /// Run a parameterized statement, returning rows or an error
    async fn execute(&mut self, statement: &str, params: &[Value]) -> PuenteResult<Vec<Row>>;

    /// Commit the transaction in progress
    async fn commit(&mut self) -> PuenteResult<()>;

    /// Roll back the transaction in progress
    async fn rollback(&mut self) -> PuenteResult<()>;

    /// Set the per-statement timeout applied to subsequent `execute` calls
    fn set_statement_timeout(&mut self, timeout: Duration);

    /// Close the physical connection
    async fn close(&mut self) -> PuenteResult<()>;

    /// Cheap liveness check used before recycling an idle connection
    async fn is_valid(&self) -> bool {
        true
    }
}

/// Opens physical connections to endpoints
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Open a connection to `endpoint`, bounded by `timeout`
    async fn connect(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> PuenteResult<Box<dyn RawConnection>>;
}
