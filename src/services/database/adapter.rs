// Database adapter trait for engine-specific query execution
use crate::api::middleware::AppError;
use crate::models::{DatabaseEngine, QueryResult};
use crate::validation::ValidatedStatement;
use std::time::Duration;

/// Per-call execution bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    pub row_limit: usize,
    pub timeout: Duration,
}

/// Database adapter trait - one implementation per engine.
///
/// An adapter is created for a single request from its `ConnectionSpec`. Every
/// call opens its own connection, runs the statement read-only within
/// `limits`, and closes the connection before returning on every path.
#[async_trait::async_trait]
pub trait DatabaseAdapter: Send + Sync {
    /// Execute a validated statement, returning at most `limits.row_limit` rows.
    /// Rows past the limit set `truncated` instead of failing.
    async fn execute_query(
        &self,
        statement: &ValidatedStatement,
        limits: ExecutionLimits,
    ) -> Result<QueryResult, AppError>;

    /// Get database engine
    fn engine(&self) -> DatabaseEngine;
}
