use crate::api::middleware::AppError;
use crate::config::{Config, ExecutorConfig};
use crate::models::{QueryMode, QueryRequest, QueryResponse};
use crate::services::database::{AdapterFactory, ExecutionLimits};
use crate::services::llm_service::{fallback_summary, SqlTranslator};
use crate::validation::SqlValidator;
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

/// Lifecycle of one query request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Received,
    Translating,
    Validating,
    Rejected,
    Executing,
    Returned,
    Failed,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestState::Rejected | RequestState::Returned | RequestState::Failed)
    }
}

/// Tracks a request through its states and refuses illegal transitions
#[derive(Debug)]
pub struct RequestTracker {
    mode: QueryMode,
    state: RequestState,
    history: Vec<RequestState>,
}

impl RequestTracker {
    pub fn new(mode: QueryMode) -> Self {
        Self {
            mode,
            state: RequestState::Received,
            history: vec![RequestState::Received],
        }
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn history(&self) -> &[RequestState] {
        &self.history
    }

    pub fn can_advance(&self, next: RequestState) -> bool {
        use RequestState::*;
        match (self.state, next) {
            (Received, Translating) => self.mode == QueryMode::NaturalLanguage,
            (Received, Validating) => self.mode == QueryMode::DirectSql,
            (Translating, Validating) | (Translating, Failed) => true,
            (Validating, Rejected) | (Validating, Executing) => true,
            (Executing, Returned) | (Executing, Failed) => true,
            _ => false,
        }
    }

    pub fn advance(&mut self, next: RequestState) -> Result<(), AppError> {
        if !self.can_advance(next) {
            return Err(AppError::Internal(format!(
                "Illegal request state transition {:?} -> {:?}",
                self.state, next
            )));
        }
        tracing::debug!("Request state {:?} -> {:?}", self.state, next);
        self.state = next;
        self.history.push(next);
        Ok(())
    }
}

/// Query service: sequences translation, validation and execution for one request
pub struct QueryService {
    translator: Arc<dyn SqlTranslator>,
    adapters: Arc<dyn AdapterFactory>,
    executor: ExecutorConfig,
    summarize: bool,
}

impl QueryService {
    pub fn new(config: &Config, translator: Arc<dyn SqlTranslator>, adapters: Arc<dyn AdapterFactory>) -> Self {
        Self {
            translator,
            adapters,
            executor: config.executor.clone(),
            summarize: config.llm.summarize,
        }
    }

    /// Run one request end to end
    pub async fn run(&self, request: QueryRequest) -> Result<QueryResponse, AppError> {
        let mode = request.mode.ok_or_else(|| {
            AppError::InvalidRequest("mode is required: natural_language or direct_sql".to_string())
        })?;
        let spec = request.connection.clone().into_spec()?;

        let request_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "query",
            %request_id,
            mode = mode.as_str(),
            engine = spec.engine.as_str()
        );

        let mut secrets = vec![spec.password.clone()];
        if let Some(key) = &request.api_key {
            secrets.push(key.clone());
        }

        self.run_pipeline(mode, request, spec)
            .instrument(span)
            .await
            .map_err(|e| {
                let secrets: Vec<&str> = secrets.iter().map(String::as_str).collect();
                e.scrubbed(&secrets)
            })
    }

    async fn run_pipeline(
        &self,
        mode: QueryMode,
        request: QueryRequest,
        spec: crate::models::ConnectionSpec,
    ) -> Result<QueryResponse, AppError> {
        let text = request.text.trim();
        if text.is_empty() {
            return Err(AppError::InvalidRequest("Query text cannot be empty".to_string()));
        }

        let credentials = match mode {
            QueryMode::NaturalLanguage => Some(request.provider_credentials()?),
            QueryMode::DirectSql => None,
        };
        let engine = spec.engine;
        let limits = ExecutionLimits {
            row_limit: self.executor.effective_row_limit(request.row_limit),
            timeout: self.executor.statement_timeout(),
        };

        tracing::info!("Query received for {}", spec.display_target());
        let mut tracker = RequestTracker::new(mode);

        let candidate = match &credentials {
            Some(credentials) => {
                tracker.advance(RequestState::Translating)?;
                match self
                    .translator
                    .translate(text, request.schema_hint.as_deref(), engine, credentials)
                    .await
                {
                    Ok(sql) => sql,
                    Err(e) => {
                        tracker.advance(RequestState::Failed)?;
                        tracing::warn!("Translation failed: {}", e);
                        return Err(e);
                    }
                }
            }
            None => text.to_string(),
        };

        tracker.advance(RequestState::Validating)?;
        let statement = match SqlValidator::approve(&candidate) {
            Ok(statement) => statement,
            Err(e) => {
                tracker.advance(RequestState::Rejected)?;
                tracing::info!("Statement rejected: {}", e);
                return Err(e);
            }
        };

        tracker.advance(RequestState::Executing)?;
        let adapter = self.adapters.create(spec);
        let start_time = Instant::now();
        let result = match adapter.execute_query(&statement, limits).await {
            Ok(result) => result,
            Err(e) => {
                tracker.advance(RequestState::Failed)?;
                tracing::warn!("Execution failed: {}", e);
                return Err(e);
            }
        };
        let execution_time_ms = start_time.elapsed().as_millis() as u64;
        tracker.advance(RequestState::Returned)?;

        tracing::info!(
            "Query returned {} rows in {}ms (truncated: {})",
            result.row_count,
            execution_time_ms,
            result.truncated
        );

        let summary = match &credentials {
            Some(credentials) if self.summarize => {
                Some(self.translator.summarize(text, &result, credentials).await)
            }
            Some(_) => Some(fallback_summary(result.row_count)),
            None => None,
        };

        let mut response = QueryResponse::new(result, statement.into_string(), execution_time_ms);
        response.summary = summary;
        Ok(response)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::config::test_config;
    use serde_json::json;

    fn request(body: serde_json::Value) -> QueryRequest {
        let mut base = json!({
            "db_engine": "postgres",
            "db_host": "db.internal",
            "db_name": "shop",
            "db_user": "reader",
            "db_password": "s3cret-pw",
        });
        if let (Some(base), Some(extra)) = (base.as_object_mut(), body.as_object()) {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }
        serde_json::from_value(base).unwrap()
    }

    fn service(translator: StubTranslator, adapters: StubAdapterFactory) -> (QueryService, Arc<StubTranslator>, Arc<std::sync::Mutex<Vec<String>>>) {
        let translator = Arc::new(translator);
        let executed = adapters.executed.clone();
        let service = QueryService::new(&test_config(), translator.clone(), Arc::new(adapters));
        (service, translator, executed)
    }

    #[test]
    fn test_tracker_direct_path() {
        let mut tracker = RequestTracker::new(QueryMode::DirectSql);
        assert!(tracker.advance(RequestState::Translating).is_err());
        tracker.advance(RequestState::Validating).unwrap();
        tracker.advance(RequestState::Executing).unwrap();
        tracker.advance(RequestState::Returned).unwrap();
        assert!(tracker.state().is_terminal());
        assert!(tracker.advance(RequestState::Failed).is_err());
        assert_eq!(
            tracker.history(),
            &[
                RequestState::Received,
                RequestState::Validating,
                RequestState::Executing,
                RequestState::Returned
            ]
        );
    }

    #[test]
    fn test_tracker_ai_path_and_illegal_moves() {
        let mut tracker = RequestTracker::new(QueryMode::NaturalLanguage);
        assert!(tracker.advance(RequestState::Validating).is_err());
        assert!(tracker.advance(RequestState::Executing).is_err());
        tracker.advance(RequestState::Translating).unwrap();
        tracker.advance(RequestState::Failed).unwrap();
        assert_eq!(tracker.state(), RequestState::Failed);

        let mut tracker = RequestTracker::new(QueryMode::NaturalLanguage);
        tracker.advance(RequestState::Translating).unwrap();
        tracker.advance(RequestState::Validating).unwrap();
        assert!(tracker.advance(RequestState::Returned).is_err());
        tracker.advance(RequestState::Rejected).unwrap();
        assert!(tracker.advance(RequestState::Executing).is_err());
    }

    #[tokio::test]
    async fn test_direct_sql_returns_rows() {
        let (service, translator, executed) = service(StubTranslator::answering("unused"), StubAdapterFactory::with_rows(3));
        let response = service
            .run(request(json!({ "mode": "direct_sql", "text": "SELECT id, label FROM orders;" })))
            .await
            .unwrap();

        assert_eq!(response.row_count, 3);
        assert!(!response.truncated);
        assert_eq!(response.sql_used, "SELECT id, label FROM orders");
        assert_eq!(response.columns, vec!["id", "label"]);
        assert!(response.summary.is_none());
        assert_eq!(*translator.calls.lock().unwrap(), 0);
        assert_eq!(executed.lock().unwrap().as_slice(), &["SELECT id, label FROM orders".to_string()]);
    }

    #[tokio::test]
    async fn test_row_limit_truncates() {
        let (service, _, _) = service(StubTranslator::answering("unused"), StubAdapterFactory::with_rows(25));
        let response = service
            .run(request(json!({ "mode": "direct_sql", "text": "SELECT * FROM orders", "row_limit": 10 })))
            .await
            .unwrap();

        assert_eq!(response.row_count, 10);
        assert_eq!(response.rows.len(), 10);
        assert!(response.truncated);
    }

    #[tokio::test]
    async fn test_repeated_query_is_stable() {
        let (service, _, _) = service(StubTranslator::answering("unused"), StubAdapterFactory::with_rows(5));
        let first = service
            .run(request(json!({ "mode": "direct_sql", "text": "SELECT * FROM orders" })))
            .await
            .unwrap();
        let second = service
            .run(request(json!({ "mode": "direct_sql", "text": "SELECT * FROM orders" })))
            .await
            .unwrap();
        assert_eq!(first.rows, second.rows);
        assert_eq!(first.columns, second.columns);
    }

    #[tokio::test]
    async fn test_rejected_statement_never_executes() {
        let (service, _, executed) = service(StubTranslator::answering("unused"), StubAdapterFactory::with_rows(3));
        let err = service
            .run(request(json!({ "mode": "direct_sql", "text": "SELECT * FROM users; DROP TABLE users;" })))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "validation_rejected");
        assert!(executed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ai_mode_translates_then_summarizes() {
        let (service, translator, executed) = service(
            StubTranslator::answering("SELECT id, label FROM orders"),
            StubAdapterFactory::with_rows(2),
        );
        let response = service
            .run(request(json!({
                "mode": "natural_language",
                "text": "list orders",
                "ai_provider": "openai",
                "api_key": "sk-abc",
            })))
            .await
            .unwrap();

        assert_eq!(*translator.calls.lock().unwrap(), 1);
        assert_eq!(executed.lock().unwrap().len(), 1);
        assert_eq!(response.sql_used, "SELECT id, label FROM orders");
        // summarization is off in the test config
        assert_eq!(response.summary.as_deref(), Some("Found 2 results."));
    }

    #[tokio::test]
    async fn test_ai_mode_with_summaries_enabled() {
        let translator = Arc::new(StubTranslator::answering("SELECT id FROM orders"));
        let mut config = test_config();
        config.llm.summarize = true;
        let service = QueryService::new(&config, translator, Arc::new(StubAdapterFactory::with_rows(4)));

        let response = service
            .run(request(json!({
                "mode": "natural_language",
                "text": "list orders",
                "ai_provider": "gemini",
                "api_key": "key",
            })))
            .await
            .unwrap();
        assert_eq!(response.summary.as_deref(), Some("stub summary of 4 rows"));
    }

    #[tokio::test]
    async fn test_provider_error_never_reaches_executor() {
        let (service, _, executed) = service(
            StubTranslator::failing(AppError::Provider("The AI provider rejected the API key".to_string())),
            StubAdapterFactory::with_rows(3),
        );
        let err = service
            .run(request(json!({
                "mode": "natural_language",
                "text": "list orders",
                "ai_provider": "openai",
                "api_key": "sk-abc",
            })))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "provider_error");
        assert!(executed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_generated_write_is_rejected() {
        let (service, _, executed) = service(
            StubTranslator::answering("DELETE FROM orders"),
            StubAdapterFactory::with_rows(3),
        );
        let err = service
            .run(request(json!({
                "mode": "natural_language",
                "text": "remove all orders",
                "ai_provider": "openai",
                "api_key": "sk-abc",
            })))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "validation_rejected");
        assert!(executed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_execution_errors_are_scrubbed() {
        let (service, _, _) = service(
            StubTranslator::answering("unused"),
            StubAdapterFactory::failing(AppError::Connection(
                "password authentication failed for password s3cret-pw".to_string(),
            )),
        );
        let err = service
            .run(request(json!({ "mode": "direct_sql", "text": "SELECT 1" })))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "connection_error");
        assert!(!err.message().contains("s3cret-pw"));
        assert!(err.message().contains("***"));
    }

    #[tokio::test]
    async fn test_invalid_inputs() {
        let (service, _, executed) = service(StubTranslator::answering("unused"), StubAdapterFactory::with_rows(1));

        let err = service.run(request(json!({ "text": "SELECT 1" }))).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_request");

        let err = service
            .run(request(json!({ "mode": "direct_sql", "text": "   " })))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_request");

        let err = service
            .run(request(json!({ "mode": "natural_language", "text": "count users" })))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_request");

        let err = service
            .run(request(json!({ "mode": "direct_sql", "text": "SELECT 1", "db_engine": "oracle" })))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_request");

        assert!(executed.lock().unwrap().is_empty());
    }
}
