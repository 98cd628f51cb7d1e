use crate::api::middleware::{scrub_secrets, AppError};
use crate::config::LlmConfig;
use crate::models::{AiProvider, DatabaseEngine, ProviderCredentials, QueryResult};
use reqwest::{Client as HttpClient, StatusCode};
use serde_json::{json, Value};

/// Rows shown to the model when summarizing a result
const SUMMARY_SAMPLE_ROWS: usize = 3;

/// Turns questions into SQL and results into short answers.
///
/// Credentials are passed on every call; implementations keep none.
#[async_trait::async_trait]
pub trait SqlTranslator: Send + Sync {
    /// Produce one candidate SQL statement for `question`
    async fn translate(
        &self,
        question: &str,
        schema_hint: Option<&str>,
        engine: DatabaseEngine,
        credentials: &ProviderCredentials,
    ) -> Result<String, AppError>;

    /// One or two sentence answer for a finished query. Never fails.
    async fn summarize(
        &self,
        question: &str,
        result: &QueryResult,
        credentials: &ProviderCredentials,
    ) -> String;
}

/// LLM service backed by the OpenAI and Gemini HTTP APIs
pub struct LlmService {
    config: LlmConfig,
    http_client: HttpClient,
}

impl LlmService {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            config: config.clone(),
            http_client: HttpClient::new(),
        }
    }

    /// Build the SQL generation prompt
    pub fn build_sql_prompt(question: &str, schema_hint: Option<&str>, engine: DatabaseEngine) -> String {
        let dialect_hints = match engine {
            DatabaseEngine::MySql => r#"
- Use MySQL syntax and functions
- Use LIMIT syntax (not TOP or FETCH FIRST)
- For dates, use functions like NOW(), CURDATE(), DATE_SUB(), etc.
- String concatenation uses CONCAT() function
- Use backticks for identifier quoting if needed: `table_name`"#,
            DatabaseEngine::Postgres => r#"
- Use PostgreSQL syntax and functions
- Use LIMIT syntax (or FETCH FIRST)
- For dates, use functions like NOW(), CURRENT_DATE, interval arithmetic
- String concatenation uses || operator or CONCAT()
- Use double quotes for identifier quoting if needed: "table_name""#,
        };

        let schema = schema_hint
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or("(no schema provided; infer table names from the question)");

        format!(
            r#"You are a SQL expert. Convert the user's question into a single read-only {dialect} SELECT query.

Database Schema:
{schema}

Rules:
1. Generate exactly ONE SELECT statement (a WITH ... SELECT is fine)
2. Never modify data or schema: no INSERT, UPDATE, DELETE, DDL, or SELECT ... INTO
3. Use proper table and column names from the schema above
4. Return ONLY the SQL query, no explanations and no markdown formatting
{dialect_hints}

Question: {question}

SQL Query:"#,
            dialect = engine.dialect_name(),
            schema = schema,
            dialect_hints = dialect_hints,
            question = question.trim(),
        )
    }

    /// Build the result summary prompt
    pub fn build_summary_prompt(question: &str, result: &QueryResult) -> String {
        let sample: Vec<Value> = result
            .rows
            .iter()
            .take(SUMMARY_SAMPLE_ROWS)
            .map(|row| {
                let object: serde_json::Map<String, Value> = result
                    .columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect();
                Value::Object(object)
            })
            .collect();

        format!(
            r#"Summarize the following query results in 1-2 clear sentences.

User Question: {question}
Results Count: {count}{more}
Sample Data: {sample}

Provide a concise, helpful answer."#,
            question = question.trim(),
            count = result.row_count,
            more = if result.truncated { " (truncated; more rows exist)" } else { "" },
            sample = Value::Array(sample),
        )
    }

    /// Send one prompt to the caller's provider and return the text answer
    async fn complete(
        &self,
        prompt: &str,
        temperature: f64,
        max_tokens: u32,
        credentials: &ProviderCredentials,
    ) -> Result<String, AppError> {
        let request = match credentials.provider {
            AiProvider::OpenAi => self
                .http_client
                .post(format!(
                    "{}/v1/chat/completions",
                    self.config.openai_base_url.trim_end_matches('/')
                ))
                .bearer_auth(&credentials.api_key)
                .json(&json!({
                    "model": self.config.openai_model,
                    "messages": [{ "role": "user", "content": prompt }],
                    "temperature": temperature,
                    "max_tokens": max_tokens,
                })),
            AiProvider::Gemini => self
                .http_client
                .post(format!(
                    "{}/v1beta/models/{}:generateContent",
                    self.config.gemini_base_url.trim_end_matches('/'),
                    self.config.gemini_model
                ))
                .header("x-goog-api-key", &credentials.api_key)
                .json(&json!({
                    "contents": [{ "parts": [{ "text": prompt }] }],
                    "generationConfig": {
                        "temperature": temperature,
                        "maxOutputTokens": max_tokens,
                    },
                })),
        };

        let secrets = [credentials.api_key.as_str()];
        let response = request
            .timeout(self.config.request_timeout())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Provider(format!(
                        "AI provider did not respond within {} seconds",
                        self.config.timeout_secs
                    ))
                } else {
                    AppError::Provider(format!("Failed to reach AI provider: {}", e)).scrubbed(&secrets)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(
                "{} returned error {}: {}",
                credentials.provider.as_str(),
                status,
                scrub_secrets(&body, &secrets)
            );
            return Err(Self::status_error(status));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| AppError::Provider(format!("Failed to parse AI provider response: {}", e)))?;

        let text = match credentials.provider {
            AiProvider::OpenAi => body["choices"][0]["message"]["content"]
                .as_str()
                .map(str::to_string),
            AiProvider::Gemini => body["candidates"][0]["content"]["parts"]
                .as_array()
                .map(|parts| {
                    parts
                        .iter()
                        .filter_map(|part| part["text"].as_str())
                        .collect::<Vec<_>>()
                        .join("")
                }),
        };

        text.filter(|t| !t.trim().is_empty())
            .ok_or_else(|| AppError::Provider("AI provider response did not contain any text".to_string()))
    }

    fn status_error(status: StatusCode) -> AppError {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                AppError::Provider("The AI provider rejected the API key".to_string())
            }
            StatusCode::TOO_MANY_REQUESTS => {
                AppError::Provider("The AI provider is rate limiting requests; try again shortly".to_string())
            }
            _ => AppError::Provider(format!("The AI provider returned status {}", status.as_u16())),
        }
    }
}

#[async_trait::async_trait]
impl SqlTranslator for LlmService {
    async fn translate(
        &self,
        question: &str,
        schema_hint: Option<&str>,
        engine: DatabaseEngine,
        credentials: &ProviderCredentials,
    ) -> Result<String, AppError> {
        let prompt = Self::build_sql_prompt(question, schema_hint, engine);
        let answer = self.complete(&prompt, 0.2, 1000, credentials).await?;

        let sql = clean_sql(&answer);
        if sql.is_empty() {
            return Err(AppError::Provider("AI provider returned an empty query".to_string()));
        }

        tracing::info!("Generated SQL via {}: {}", credentials.provider.as_str(), sql);
        Ok(sql)
    }

    async fn summarize(
        &self,
        question: &str,
        result: &QueryResult,
        credentials: &ProviderCredentials,
    ) -> String {
        if result.row_count == 0 {
            return fallback_summary(0);
        }

        let prompt = Self::build_summary_prompt(question, result);
        match self.complete(&prompt, 0.3, 200, credentials).await {
            Ok(text) => text.trim().to_string(),
            Err(e) => {
                tracing::warn!("Summary generation failed, using fallback: {}", e);
                fallback_summary(result.row_count)
            }
        }
    }
}

/// Deterministic summary used when the provider is unavailable or disabled
pub fn fallback_summary(row_count: usize) -> String {
    match row_count {
        0 => "No results found.".to_string(),
        1 => "Found 1 result.".to_string(),
        n => format!("Found {} results.", n),
    }
}

/// Strip markdown fencing and leading commentary from a model answer
pub fn clean_sql(raw: &str) -> String {
    let text = raw.trim();

    let body = match text.find("```") {
        Some(start) => {
            let after = strip_fence_language(&text[start + 3..]);
            match after.find("```") {
                Some(end) => &after[..end],
                None => after,
            }
        }
        None => skip_leading_prose(text),
    };

    body.trim().to_string()
}

fn strip_fence_language(fenced: &str) -> &str {
    const TAGS: [&str; 5] = ["postgresql", "postgres", "pgsql", "mysql", "sql"];

    for tag in TAGS {
        if fenced.get(..tag.len()).is_some_and(|head| head.eq_ignore_ascii_case(tag)) {
            let rest = &fenced[tag.len()..];
            if rest.is_empty() || rest.starts_with(|c: char| c.is_whitespace()) {
                return rest;
            }
        }
    }
    fenced
}

/// Drop lines like "Here is the query:" that precede the statement
fn skip_leading_prose(text: &str) -> &str {
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        let head = line.trim_start();
        let upper: String = head.chars().take(6).collect::<String>().to_ascii_uppercase();
        if upper.starts_with("SELECT") || upper.starts_with("WITH") || head.starts_with('(') {
            return &text[offset..];
        }
        offset += line.len();
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn credentials(provider: AiProvider) -> ProviderCredentials {
        ProviderCredentials {
            provider,
            api_key: "sk-test-123".to_string(),
        }
    }

    fn service_for(server: &MockServer) -> LlmService {
        let mut config = test_config().llm;
        config.openai_base_url = server.uri();
        config.gemini_base_url = server.uri();
        LlmService::new(&config)
    }

    fn sample_result() -> QueryResult {
        QueryResult {
            columns: vec!["name".to_string(), "total".to_string()],
            rows: vec![vec![json!("alice"), json!(3)], vec![json!("bob"), json!(5)]],
            row_count: 2,
            truncated: false,
        }
    }

    #[test]
    fn test_clean_sql_strips_fences() {
        assert_eq!(clean_sql("```sql\nSELECT 1\n```"), "SELECT 1");
        assert_eq!(clean_sql("```SQL SELECT 1```"), "SELECT 1");
        assert_eq!(clean_sql("```\nSELECT * FROM t\n```"), "SELECT * FROM t");
        assert_eq!(clean_sql("  SELECT 1;  "), "SELECT 1;");
        assert_eq!(
            clean_sql("Here is the query:\n```postgresql\nSELECT id FROM users\n```\nThis lists ids."),
            "SELECT id FROM users"
        );
    }

    #[test]
    fn test_clean_sql_skips_leading_prose() {
        assert_eq!(
            clean_sql("Sure! Here is your query:\nSELECT name\nFROM users"),
            "SELECT name\nFROM users"
        );
        assert_eq!(clean_sql("with t as (select 1) select * from t"), "with t as (select 1) select * from t");
        assert_eq!(clean_sql("I cannot help with that."), "I cannot help with that.");
    }

    #[test]
    fn test_prompt_carries_dialect_and_schema() {
        let prompt = LlmService::build_sql_prompt("how many users?", Some("users (id integer)"), DatabaseEngine::MySql);
        assert!(prompt.contains("read-only MySQL SELECT"));
        assert!(prompt.contains("users (id integer)"));
        assert!(prompt.contains("backticks"));
        assert!(prompt.contains("Question: how many users?"));

        let prompt = LlmService::build_sql_prompt("how many users?", None, DatabaseEngine::Postgres);
        assert!(prompt.contains("PostgreSQL"));
        assert!(prompt.contains("no schema provided"));
    }

    #[test]
    fn test_summary_prompt_samples_rows() {
        let prompt = LlmService::build_summary_prompt("who ordered?", &sample_result());
        assert!(prompt.contains("Results Count: 2"));
        assert!(prompt.contains(r#""name":"alice""#));
    }

    #[test]
    fn test_fallback_summary() {
        assert_eq!(fallback_summary(0), "No results found.");
        assert_eq!(fallback_summary(1), "Found 1 result.");
        assert_eq!(fallback_summary(42), "Found 42 results.");
    }

    #[tokio::test]
    async fn test_openai_translate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test-123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "role": "assistant", "content": "```sql\nSELECT COUNT(*) FROM users\n```" } }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let sql = service_for(&server)
            .translate("how many users?", None, DatabaseEngine::Postgres, &credentials(AiProvider::OpenAi))
            .await
            .unwrap();
        assert_eq!(sql, "SELECT COUNT(*) FROM users");
    }

    #[tokio::test]
    async fn test_gemini_translate_joins_parts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-2.0-flash-exp:generateContent"))
            .and(header("x-goog-api-key", "sk-test-123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{ "content": { "parts": [{ "text": "SELECT name " }, { "text": "FROM users" }] } }]
            })))
            .mount(&server)
            .await;

        let sql = service_for(&server)
            .translate("list names", None, DatabaseEngine::MySql, &credentials(AiProvider::Gemini))
            .await
            .unwrap();
        assert_eq!(sql, "SELECT name FROM users");
    }

    #[tokio::test]
    async fn test_rejected_key_is_provider_error_without_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(401)
                    .set_body_string(r#"{"error":"Incorrect API key provided: sk-test-123"}"#),
            )
            .mount(&server)
            .await;

        let err = service_for(&server)
            .translate("q", None, DatabaseEngine::Postgres, &credentials(AiProvider::OpenAi))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "provider_error");
        assert_eq!(err.message(), "The AI provider rejected the API key");
        assert!(!err.message().contains("sk-test-123"));
    }

    #[tokio::test]
    async fn test_rate_limit_and_empty_answers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-2.0-flash-exp:generateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "candidates": [] })))
            .mount(&server)
            .await;

        let service = service_for(&server);
        let err = service
            .translate("q", None, DatabaseEngine::Postgres, &credentials(AiProvider::OpenAi))
            .await
            .unwrap_err();
        assert!(err.message().contains("rate limiting"));

        let err = service
            .translate("q", None, DatabaseEngine::Postgres, &credentials(AiProvider::Gemini))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "provider_error");
    }

    #[tokio::test]
    async fn test_unreachable_provider_is_provider_error() {
        let service = LlmService::new(&test_config().llm);
        let err = service
            .translate("q", None, DatabaseEngine::Postgres, &credentials(AiProvider::OpenAi))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "provider_error");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_summarize_uses_answer_or_falls_back() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "content": "  Bob placed the most orders.  " } }]
            })))
            .mount(&server)
            .await;

        let summary = service_for(&server)
            .summarize("who ordered most?", &sample_result(), &credentials(AiProvider::OpenAi))
            .await;
        assert_eq!(summary, "Bob placed the most orders.");

        let offline = LlmService::new(&test_config().llm);
        let summary = offline
            .summarize("who ordered most?", &sample_result(), &credentials(AiProvider::OpenAi))
            .await;
        assert_eq!(summary, "Found 2 results.");

        let summary = offline
            .summarize("anyone?", &QueryResult::empty(vec!["id".to_string()]), &credentials(AiProvider::OpenAi))
            .await;
        assert_eq!(summary, "No results found.");
    }
}
