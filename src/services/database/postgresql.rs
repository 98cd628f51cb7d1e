// PostgreSQL adapter: one short-lived connection per call, read-only transaction,
// server-side row bound through a portal
use crate::api::middleware::AppError;
use crate::models::{ConnectionSpec, DatabaseEngine, QueryResult, RowCollector};
use crate::services::database::adapter::{DatabaseAdapter, ExecutionLimits};
use crate::validation::ValidatedStatement;
use serde_json::{json, Value};
use std::fmt::Write as _;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_postgres::types::{FromSql, Type};
use tokio_postgres::{CancelToken, Client, NoTls, Row};

pub struct PostgreSQLAdapter {
    spec: ConnectionSpec,
    connect_timeout: Duration,
}

/// An open connection plus the task driving it.
///
/// Dropping the session closes the connection. If a statement is still running
/// at that point (the request was abandoned), a server-side cancel is sent.
struct PgSession {
    client: Client,
    cancel_token: CancelToken,
    connection: JoinHandle<()>,
    in_flight: bool,
}

impl Drop for PgSession {
    fn drop(&mut self) {
        if self.in_flight {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let token = self.cancel_token.clone();
                handle.spawn(async move {
                    if let Err(e) = token.cancel_query(NoTls).await {
                        tracing::debug!("Failed to cancel abandoned PostgreSQL query: {}", e);
                    }
                });
            }
        }
        self.connection.abort();
    }
}

impl PostgreSQLAdapter {
    pub fn new(spec: ConnectionSpec, connect_timeout: Duration) -> Self {
        Self { spec, connect_timeout }
    }

    async fn open(&self) -> Result<PgSession, AppError> {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.spec.host)
            .port(self.spec.port)
            .dbname(&self.spec.database)
            .user(&self.spec.username)
            .password(&self.spec.password)
            .application_name("sql-chat")
            .connect_timeout(self.connect_timeout);

        let (client, connection) = tokio::time::timeout(self.connect_timeout, config.connect(NoTls))
            .await
            .map_err(|_| {
                AppError::Connection(format!(
                    "Timed out after {} seconds connecting to PostgreSQL at {}",
                    self.connect_timeout.as_secs(),
                    self.spec.display_target()
                ))
            })?
            .map_err(|e| {
                AppError::Connection(format!(
                    "Failed to connect to PostgreSQL at {}: {}",
                    self.spec.display_target(),
                    e
                ))
                .scrubbed(&self.spec.secrets())
            })?;

        let connection = tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!("PostgreSQL connection ended with error: {}", e);
            }
        });

        tracing::debug!("Opened PostgreSQL connection to {}", self.spec.display_target());

        Ok(PgSession {
            cancel_token: client.cancel_token(),
            client,
            connection,
            in_flight: false,
        })
    }

    async fn run_read_only(
        client: &mut Client,
        sql: &str,
        limits: ExecutionLimits,
    ) -> Result<QueryResult, tokio_postgres::Error> {
        client
            .batch_execute(&format!(
                "SET statement_timeout = {}; SET standard_conforming_strings = on",
                limits.timeout.as_millis()
            ))
            .await?;

        let transaction = client.build_transaction().read_only(true).start().await?;

        // The extended protocol refuses more than one statement per prepare
        let prepared = transaction.prepare(sql).await?;
        let columns: Vec<String> = prepared
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();

        // Ask the server for one row beyond the limit so truncation is detectable
        let max_rows = i32::try_from(limits.row_limit.saturating_add(1)).unwrap_or(i32::MAX);
        let portal = transaction.bind(&prepared, &[]).await?;
        let rows = transaction.query_portal(&portal, max_rows).await?;

        let mut collector = RowCollector::new(limits.row_limit);
        for row in &rows {
            if !collector.push(Self::row_to_values(row)) {
                break;
            }
        }

        transaction.rollback().await?;
        Ok(collector.finish(columns))
    }

    fn row_to_values(row: &Row) -> Vec<Value> {
        row.columns()
            .iter()
            .enumerate()
            .map(|(idx, column)| Self::cell_to_json(row, idx, column.type_()))
            .collect()
    }

    fn cell_to_json(row: &Row, idx: usize, ty: &Type) -> Value {
        let value = match *ty {
            Type::BOOL => row.try_get::<_, Option<bool>>(idx).map(|v| json!(v)),
            Type::INT2 => row.try_get::<_, Option<i16>>(idx).map(|v| json!(v)),
            Type::INT4 => row.try_get::<_, Option<i32>>(idx).map(|v| json!(v)),
            Type::INT8 => row.try_get::<_, Option<i64>>(idx).map(|v| json!(v)),
            Type::OID => row.try_get::<_, Option<u32>>(idx).map(|v| json!(v)),
            Type::FLOAT4 => row
                .try_get::<_, Option<f32>>(idx)
                .map(|v| v.map_or(Value::Null, |f| float_to_json(f64::from(f)))),
            Type::FLOAT8 => row
                .try_get::<_, Option<f64>>(idx)
                .map(|v| v.map_or(Value::Null, float_to_json)),
            Type::NUMERIC => row
                .try_get::<_, Option<PgNumeric>>(idx)
                .map(|v| json!(v.map(|n| n.0))),
            Type::JSON | Type::JSONB => row
                .try_get::<_, Option<Value>>(idx)
                .map(|v| v.unwrap_or(Value::Null)),
            Type::UUID => row
                .try_get::<_, Option<uuid::Uuid>>(idx)
                .map(|v| json!(v.map(|u| u.to_string()))),
            Type::TIMESTAMP => row
                .try_get::<_, Option<chrono::NaiveDateTime>>(idx)
                .map(|v| json!(v.map(|t| t.format("%Y-%m-%dT%H:%M:%S%.f").to_string()))),
            Type::TIMESTAMPTZ => row
                .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)
                .map(|v| json!(v.map(|t| t.to_rfc3339()))),
            Type::DATE => row
                .try_get::<_, Option<chrono::NaiveDate>>(idx)
                .map(|v| json!(v.map(|d| d.to_string()))),
            Type::TIME => row
                .try_get::<_, Option<chrono::NaiveTime>>(idx)
                .map(|v| json!(v.map(|t| t.to_string()))),
            Type::BYTEA => row
                .try_get::<_, Option<Vec<u8>>>(idx)
                .map(|v| json!(v.map(|bytes| hex_bytes(&bytes)))),
            // TEXT, VARCHAR, NAME, citext and the like
            _ => row.try_get::<_, Option<String>>(idx).map(|v| json!(v)),
        };

        value.unwrap_or_else(|_| json!(format!("<{}>", ty.name())))
    }

    fn query_error(&self, e: tokio_postgres::Error) -> AppError {
        let error = match e.as_db_error() {
            Some(db_error) => {
                let mut message = db_error.message().to_string();
                if let Some(detail) = db_error.detail() {
                    message.push_str(&format!(" ({})", detail));
                }
                if let Some(hint) = db_error.hint() {
                    message.push_str(&format!(" Hint: {}", hint));
                }
                classify_sqlstate(db_error.code().code(), &message)
            }
            None if e.is_closed() => {
                AppError::Connection(format!("PostgreSQL connection closed unexpectedly: {}", e))
            }
            None => AppError::Execution(format!("Query execution failed: {}", e)),
        };
        error.scrubbed(&self.spec.secrets())
    }
}

#[async_trait::async_trait]
impl DatabaseAdapter for PostgreSQLAdapter {
    async fn execute_query(
        &self,
        statement: &ValidatedStatement,
        limits: ExecutionLimits,
    ) -> Result<QueryResult, AppError> {
        let mut session = self.open().await?;

        session.in_flight = true;
        let outcome = tokio::time::timeout(
            limits.timeout,
            Self::run_read_only(&mut session.client, statement.as_str(), limits),
        )
        .await;

        match outcome {
            Ok(result) => {
                session.in_flight = false;
                result.map_err(|e| self.query_error(e))
            }
            Err(_) => {
                if let Err(e) = session.cancel_token.cancel_query(NoTls).await {
                    tracing::warn!("Failed to cancel timed out PostgreSQL query: {}", e);
                }
                session.in_flight = false;
                Err(AppError::Timeout(format!(
                    "Query did not complete within {} seconds and was cancelled",
                    limits.timeout.as_secs()
                )))
            }
        }
    }

    fn engine(&self) -> DatabaseEngine {
        DatabaseEngine::Postgres
    }
}

/// Map a PostgreSQL SQLSTATE onto the error taxonomy
fn classify_sqlstate(code: &str, message: &str) -> AppError {
    match code {
        // query_canceled, raised by statement_timeout
        "57014" => AppError::Timeout(format!(
            "Query was cancelled by the server after exceeding the statement timeout: {}",
            message
        )),
        // read_only_sql_transaction
        "25006" => AppError::Execution(format!(
            "The database refused to modify data in a read-only session: {}",
            message
        )),
        "3D000" => AppError::Connection(format!("Database does not exist: {}", message)),
        _ if code.starts_with("08") || code.starts_with("28") || code.starts_with("57P") => {
            AppError::Connection(format!("Code: {}, Message: {}", code, message))
        }
        _ => AppError::Execution(format!("Code: {}, Message: {}", code, message)),
    }
}

fn float_to_json(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or_else(|| json!(value.to_string()))
}

fn hex_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("\\x");
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

/// NUMERIC decoded to its exact decimal text
struct PgNumeric(String);

impl<'a> FromSql<'a> for PgNumeric {
    fn from_sql(_: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        decode_numeric(raw).map(PgNumeric)
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

/// Binary NUMERIC layout: ndigits, weight, sign, dscale (all 16-bit), then
/// `ndigits` base-10000 digits, most significant first. Digit `i` has weight
/// `weight - i`.
fn decode_numeric(raw: &[u8]) -> Result<String, Box<dyn std::error::Error + Sync + Send>> {
    if raw.len() < 8 {
        return Err("invalid NUMERIC value: header too short".into());
    }

    let read = |at: usize| u16::from_be_bytes([raw[at], raw[at + 1]]);
    let ndigits = read(0) as usize;
    let weight = i32::from(read(2) as i16);
    let sign = read(4);
    let dscale = read(6) as usize;

    match sign {
        0xC000 => return Ok("NaN".to_string()),
        0xD000 => return Ok("Infinity".to_string()),
        0xF000 => return Ok("-Infinity".to_string()),
        0x0000 | 0x4000 => {}
        _ => return Err("invalid NUMERIC value: unknown sign".into()),
    }

    if raw.len() != 8 + ndigits * 2 {
        return Err("invalid NUMERIC value: digit count mismatch".into());
    }

    let digits: Vec<u16> = raw[8..]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    let digit_at = |idx: i32| -> u16 {
        usize::try_from(idx)
            .ok()
            .and_then(|i| digits.get(i).copied())
            .unwrap_or(0)
    };

    let mut out = String::new();
    if sign == 0x4000 {
        out.push('-');
    }

    if weight < 0 {
        out.push('0');
    } else {
        for idx in 0..=weight {
            if idx == 0 {
                let _ = write!(out, "{}", digit_at(idx));
            } else {
                let _ = write!(out, "{:04}", digit_at(idx));
            }
        }
    }

    if dscale > 0 {
        let mut fraction = String::with_capacity(dscale + 4);
        let mut idx = weight + 1;
        while fraction.len() < dscale {
            let _ = write!(fraction, "{:04}", digit_at(idx));
            idx += 1;
        }
        fraction.truncate(dscale);
        out.push('.');
        out.push_str(&fraction);
    }

    Ok(out)
}
