pub mod query;
pub mod schema;

use axum::extract::rejection::JsonRejection;
use std::sync::Arc;

use crate::api::middleware::AppError;
use crate::config::Config;
use crate::services::database::{AdapterFactory, EngineAdapterFactory};
use crate::services::{LlmService, QueryService, SchemaService, SqlTranslator};

/// Application state
///
/// Holds services and configuration only. No credentials, connections or
/// per-user data live here.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub query_service: Arc<QueryService>,
    pub schema_service: Arc<SchemaService>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let translator: Arc<dyn SqlTranslator> = Arc::new(LlmService::new(&config.llm));
        let adapters: Arc<dyn AdapterFactory> =
            Arc::new(EngineAdapterFactory::new(config.executor.connect_timeout()));
        Self::with_services(config, translator, adapters)
    }

    pub fn with_services(
        config: Config,
        translator: Arc<dyn SqlTranslator>,
        adapters: Arc<dyn AdapterFactory>,
    ) -> Self {
        Self {
            query_service: Arc::new(QueryService::new(&config, translator, adapters.clone())),
            schema_service: Arc::new(SchemaService::new(&config.executor, adapters)),
            config,
        }
    }
}

/// Malformed bodies get the same error payload as everything else
pub(crate) fn invalid_body(rejection: JsonRejection) -> AppError {
    AppError::InvalidRequest(format!("Invalid request body: {}", rejection.body_text()))
}
