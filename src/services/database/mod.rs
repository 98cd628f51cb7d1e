// Database abstraction layer for PostgreSQL and MySQL
pub mod adapter;
pub mod mysql;
pub mod postgresql;

pub use adapter::{DatabaseAdapter, ExecutionLimits};
pub use mysql::MySQLAdapter;
pub use postgresql::PostgreSQLAdapter;

use crate::models::{ConnectionSpec, DatabaseEngine};
use std::time::Duration;

/// Factory function to create the adapter for a connection's engine
pub fn create_adapter(spec: ConnectionSpec, connect_timeout: Duration) -> Box<dyn DatabaseAdapter> {
    match spec.engine {
        DatabaseEngine::Postgres => Box::new(PostgreSQLAdapter::new(spec, connect_timeout)),
        DatabaseEngine::MySql => Box::new(MySQLAdapter::new(spec, connect_timeout)),
    }
}

/// Builds adapters for incoming requests; swapped out in tests
pub trait AdapterFactory: Send + Sync {
    fn create(&self, spec: ConnectionSpec) -> Box<dyn DatabaseAdapter>;
}

pub struct EngineAdapterFactory {
    connect_timeout: Duration,
}

impl EngineAdapterFactory {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl AdapterFactory for EngineAdapterFactory {
    fn create(&self, spec: ConnectionSpec) -> Box<dyn DatabaseAdapter> {
        create_adapter(spec, self.connect_timeout)
    }
}
