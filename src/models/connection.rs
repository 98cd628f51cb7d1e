use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

use crate::api::middleware::AppError;

/// Database engines a request may target
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseEngine {
    Postgres,
    MySql,
}

impl DatabaseEngine {
    pub fn from_str(s: &str) -> Result<Self, AppError> {
        match s.trim().to_lowercase().as_str() {
            "postgresql" | "postgres" => Ok(DatabaseEngine::Postgres),
            "mysql" => Ok(DatabaseEngine::MySql),
            _ => Err(AppError::InvalidRequest(format!("Unsupported database type: {}", s))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseEngine::Postgres => "postgres",
            DatabaseEngine::MySql => "mysql",
        }
    }

    /// Human-readable dialect name used in LLM prompts
    pub fn dialect_name(&self) -> &'static str {
        match self {
            DatabaseEngine::Postgres => "PostgreSQL",
            DatabaseEngine::MySql => "MySQL",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            DatabaseEngine::Postgres => 5432,
            DatabaseEngine::MySql => 3306,
        }
    }
}

/// Per-request database connection parameters.
///
/// Built fresh from every request body and dropped with it; never stored.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionSpec {
    pub engine: DatabaseEngine,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for ConnectionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSpec")
            .field("engine", &self.engine)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl ConnectionSpec {
    /// `user@host:port/database`, safe for logs
    pub fn display_target(&self) -> String {
        format!("{}@{}:{}/{}", self.username, self.host, self.port, self.database)
    }

    /// Secrets that must never appear in anything returned to the caller
    pub fn secrets(&self) -> Vec<&str> {
        vec![self.password.as_str()]
    }
}

/// Connection fields as they arrive on the wire.
///
/// Accepts both the snake_case names and the camelCase names the browser UI
/// stores in localStorage.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionParams {
    #[serde(alias = "dbType")]
    pub db_engine: String,
    #[serde(alias = "dbHost")]
    pub db_host: String,
    #[serde(default, alias = "dbPort", deserialize_with = "deserialize_port")]
    pub db_port: Option<u16>,
    #[serde(alias = "dbName")]
    pub db_name: String,
    #[serde(alias = "dbUser")]
    pub db_user: String,
    #[serde(default, alias = "dbPassword")]
    pub db_password: String,
}

impl ConnectionParams {
    pub fn into_spec(self) -> Result<ConnectionSpec, AppError> {
        let engine = DatabaseEngine::from_str(&self.db_engine)?;

        let host = self.db_host.trim().to_string();
        if host.is_empty() {
            return Err(AppError::InvalidRequest("Database host cannot be empty".to_string()));
        }

        let database = self.db_name.trim().to_string();
        if database.is_empty() {
            return Err(AppError::InvalidRequest("Database name cannot be empty".to_string()));
        }

        let username = self.db_user.trim().to_string();
        if username.is_empty() {
            return Err(AppError::InvalidRequest("Database user cannot be empty".to_string()));
        }

        let port = match self.db_port {
            Some(0) => {
                return Err(AppError::InvalidRequest("Database port must be between 1 and 65535".to_string()))
            }
            Some(port) => port,
            None => engine.default_port(),
        };

        Ok(ConnectionSpec {
            engine,
            host,
            port,
            database,
            username,
            password: self.db_password,
        })
    }
}

/// The UI sends the port as a string; API clients tend to send a number.
fn deserialize_port<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PortField {
        Number(u16),
        Text(String),
    }

    match Option::<PortField>::deserialize(deserializer)? {
        None => Ok(None),
        Some(PortField::Number(port)) => Ok(Some(port)),
        Some(PortField::Text(text)) if text.trim().is_empty() => Ok(None),
        Some(PortField::Text(text)) => text
            .trim()
            .parse::<u16>()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid database port: {}", text))),
    }
}
