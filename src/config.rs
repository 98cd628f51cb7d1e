use serde::Deserialize;
use std::env;
use std::time::Duration;

/// Process-wide settings. Holds limits and provider endpoints only; database
/// credentials and API keys always arrive with the request.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub executor: ExecutorConfig,
    pub llm: LlmConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    pub default_row_limit: usize,
    pub max_row_limit: usize,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub schema_row_limit: usize,
}

impl ExecutorConfig {
    pub fn statement_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Row cap for one request: the requested limit if any, never above the maximum
    pub fn effective_row_limit(&self, requested: Option<usize>) -> usize {
        requested
            .filter(|limit| *limit > 0)
            .unwrap_or(self.default_row_limit)
            .min(self.max_row_limit)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    pub openai_base_url: String,
    pub openai_model: String,
    pub gemini_base_url: String,
    pub gemini_model: String,
    pub timeout_secs: u64,
    pub summarize: bool,
}

impl LlmConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

/// Environment variable overrides, in the form (env var, config key)
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("HOST", "server.host"),
    ("PORT", "server.port"),
    ("QUERY_ROW_LIMIT", "executor.default_row_limit"),
    ("QUERY_MAX_ROW_LIMIT", "executor.max_row_limit"),
    ("QUERY_TIMEOUT_SECS", "executor.timeout_secs"),
    ("DB_CONNECT_TIMEOUT_SECS", "executor.connect_timeout_secs"),
    ("SCHEMA_ROW_LIMIT", "executor.schema_row_limit"),
    ("OPENAI_BASE_URL", "llm.openai_base_url"),
    ("OPENAI_MODEL", "llm.openai_model"),
    ("GEMINI_BASE_URL", "llm.gemini_base_url"),
    ("GEMINI_MODEL", "llm.gemini_model"),
    ("LLM_TIMEOUT_SECS", "llm.timeout_secs"),
    ("LLM_SUMMARIZE", "llm.summarize"),
    ("RUST_LOG", "logging.level"),
];

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        // Try to load from .env file before reading the environment
        let _ = dotenv::dotenv();

        let mut builder = Self::defaults()?;

        for (var, key) in ENV_OVERRIDES {
            if let Ok(value) = env::var(var) {
                builder = builder.set_override(*key, value)?;
            }
        }

        let config: Config = builder.build()?.try_deserialize()?;
        config.check()?;
        Ok(config)
    }

    fn defaults() -> Result<config::ConfigBuilder<config::builder::DefaultState>, config::ConfigError> {
        config::Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 3000)?
            .set_default("executor.default_row_limit", 1000)?
            .set_default("executor.max_row_limit", 10000)?
            .set_default("executor.timeout_secs", 30)?
            .set_default("executor.connect_timeout_secs", 10)?
            .set_default("executor.schema_row_limit", 5000)?
            .set_default("llm.openai_base_url", "https://api.openai.com")?
            .set_default("llm.openai_model", "gpt-4o")?
            .set_default("llm.gemini_base_url", "https://generativelanguage.googleapis.com")?
            .set_default("llm.gemini_model", "gemini-2.0-flash-exp")?
            .set_default("llm.timeout_secs", 60)?
            .set_default("llm.summarize", true)?
            .set_default("logging.level", "info")
    }

    fn check(&self) -> Result<(), config::ConfigError> {
        if self.executor.default_row_limit == 0 || self.executor.max_row_limit == 0 {
            return Err(config::ConfigError::Message("row limits must be greater than zero".to_string()));
        }
        if self.executor.timeout_secs == 0 || self.llm.timeout_secs == 0 {
            return Err(config::ConfigError::Message("timeouts must be greater than zero".to_string()));
        }
        Ok(())
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        executor: ExecutorConfig {
            default_row_limit: 1000,
            max_row_limit: 10000,
            timeout_secs: 30,
            connect_timeout_secs: 5,
            schema_row_limit: 5000,
        },
        llm: LlmConfig {
            openai_base_url: "http://127.0.0.1:9".to_string(),
            openai_model: "gpt-4o".to_string(),
            gemini_base_url: "http://127.0.0.1:9".to_string(),
            gemini_model: "gemini-2.0-flash-exp".to_string(),
            timeout_secs: 5,
            summarize: false,
        },
        logging: LoggingConfig {
            level: "info".to_string(),
        },
    }
}
