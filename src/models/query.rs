use serde::{Deserialize, Serialize};
use std::fmt;

use super::connection::ConnectionParams;
use crate::api::middleware::AppError;

/// How `text` in a request is to be interpreted
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueryMode {
    NaturalLanguage,
    DirectSql,
}

impl QueryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryMode::NaturalLanguage => "natural_language",
            QueryMode::DirectSql => "direct_sql",
        }
    }
}

/// LLM providers that can translate questions into SQL
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AiProvider {
    OpenAi,
    Gemini,
}

impl AiProvider {
    pub fn from_str(s: &str) -> Result<Self, AppError> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(AiProvider::OpenAi),
            "gemini" | "google" => Ok(AiProvider::Gemini),
            _ => Err(AppError::InvalidRequest(format!("Unsupported AI provider: {}", s))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AiProvider::OpenAi => "openai",
            AiProvider::Gemini => "gemini",
        }
    }
}

/// Provider choice plus the caller's API key for one request
#[derive(Clone)]
pub struct ProviderCredentials {
    pub provider: AiProvider,
    pub api_key: String,
}

impl fmt::Debug for ProviderCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderCredentials")
            .field("provider", &self.provider)
            .field("api_key", &"***")
            .finish()
    }
}

/// Query request body as sent by the UI
#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    #[serde(default)]
    pub mode: Option<QueryMode>,
    #[serde(alias = "query")]
    pub text: String,
    #[serde(default, alias = "aiProvider")]
    pub ai_provider: Option<String>,
    #[serde(default, alias = "apiKey")]
    pub api_key: Option<String>,
    #[serde(flatten)]
    pub connection: ConnectionParams,
    #[serde(default, alias = "schema")]
    pub schema_hint: Option<String>,
    #[serde(default)]
    pub row_limit: Option<usize>,
}

impl QueryRequest {
    /// Provider credentials, required only in natural-language mode
    pub fn provider_credentials(&self) -> Result<ProviderCredentials, AppError> {
        let provider = self
            .ai_provider
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| AppError::InvalidRequest("AI provider is required for natural language queries".to_string()))?;
        let provider = AiProvider::from_str(provider)?;

        let api_key = self
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| AppError::InvalidRequest("API key is required for natural language queries".to_string()))?;

        Ok(ProviderCredentials {
            provider,
            api_key: api_key.to_string(),
        })
    }
}

/// Normalized result set returned by every engine adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub row_count: usize,
    pub truncated: bool,
}

impl QueryResult {
    pub fn empty(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
            row_count: 0,
            truncated: false,
        }
    }
}

/// Bounded row accumulation shared by the engine adapters.
///
/// Callers push rows until `push` returns false; one row beyond the limit is
/// enough to know the result was truncated.
#[derive(Debug)]
pub struct RowCollector {
    limit: usize,
    rows: Vec<Vec<serde_json::Value>>,
    truncated: bool,
}

impl RowCollector {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            rows: Vec::with_capacity(limit.min(1024)),
            truncated: false,
        }
    }

    /// Returns whether the caller should keep fetching
    pub fn push(&mut self, row: Vec<serde_json::Value>) -> bool {
        if self.rows.len() >= self.limit {
            self.truncated = true;
            return false;
        }
        self.rows.push(row);
        true
    }

    pub fn finish(self, columns: Vec<String>) -> QueryResult {
        QueryResult {
            columns,
            row_count: self.rows.len(),
            rows: self.rows,
            truncated: self.truncated,
        }
    }
}

/// Successful response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub row_count: usize,
    pub truncated: bool,
    pub sql_used: String,
    pub execution_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl QueryResponse {
    pub fn new(result: QueryResult, sql_used: String, execution_time_ms: u64) -> Self {
        Self {
            columns: result.columns,
            rows: result.rows,
            row_count: result.row_count,
            truncated: result.truncated,
            sql_used,
            execution_time_ms,
            summary: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SchemaRequest {
    #[serde(flatten)]
    pub connection: ConnectionParams,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SchemaResponse {
    pub schema: String,
    pub truncated: bool,
}
