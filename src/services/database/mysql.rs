// MySQL adapter: one short-lived connection per call, read-only session,
// binary protocol so values keep their types
use crate::api::middleware::AppError;
use crate::models::{ConnectionSpec, DatabaseEngine, QueryResult, RowCollector};
use crate::services::database::adapter::{DatabaseAdapter, ExecutionLimits};
use crate::validation::ValidatedStatement;
use mysql_async::consts::ColumnType;
use mysql_async::{prelude::*, Column, Conn, DriverError, OptsBuilder, Row, Value as MySqlValue};
use serde_json::{json, Value};
use std::fmt::Write as _;
use std::time::Duration;

/// Upper bound on the polite disconnect after a query
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

pub struct MySQLAdapter {
    spec: ConnectionSpec,
    connect_timeout: Duration,
}

impl MySQLAdapter {
    pub fn new(spec: ConnectionSpec, connect_timeout: Duration) -> Self {
        Self { spec, connect_timeout }
    }

    async fn open(&self) -> Result<Conn, AppError> {
        let opts = OptsBuilder::default()
            .ip_or_hostname(self.spec.host.clone())
            .tcp_port(self.spec.port)
            .user(Some(self.spec.username.clone()))
            .pass(Some(self.spec.password.clone()))
            .db_name(Some(self.spec.database.clone()))
            .prefer_socket(false);

        let conn = tokio::time::timeout(self.connect_timeout, Conn::new(opts))
            .await
            .map_err(|_| {
                AppError::Connection(format!(
                    "Timed out after {} seconds connecting to MySQL at {}",
                    self.connect_timeout.as_secs(),
                    self.spec.display_target()
                ))
            })?
            .map_err(|e| {
                let error = match &e {
                    mysql_async::Error::Server(server) => {
                        classify_server_error(server.code, &server.message)
                    }
                    _ => AppError::Connection(format!(
                        "Failed to connect to MySQL at {}: {}",
                        self.spec.display_target(),
                        e
                    )),
                };
                error.scrubbed(&self.spec.secrets())
            })?;

        tracing::debug!("Opened MySQL connection to {}", self.spec.display_target());
        Ok(conn)
    }

    async fn close(conn: Conn) {
        match tokio::time::timeout(CLOSE_TIMEOUT, conn.disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!("MySQL disconnect failed: {}", e),
            Err(_) => tracing::debug!("MySQL disconnect timed out, dropping connection"),
        }
    }

    async fn run_read_only(
        conn: &mut Conn,
        sql: &str,
        limits: ExecutionLimits,
    ) -> Result<QueryResult, mysql_async::Error> {
        conn.query_drop("SET SESSION TRANSACTION READ ONLY").await?;
        Self::set_execution_time(conn, limits.timeout).await;

        // Prepared statements take exactly one statement
        let mut result = conn.exec_iter(sql, ()).await?;
        let columns: Vec<String> = result
            .columns_ref()
            .iter()
            .map(|c| c.name_str().into_owned())
            .collect();

        let mut collector = RowCollector::new(limits.row_limit);
        while let Some(row) = result.next().await? {
            if !collector.push(Self::row_to_values(row)) {
                break;
            }
        }

        Ok(collector.finish(columns))
    }

    /// Server-side cap on SELECT time. MySQL takes milliseconds, MariaDB seconds.
    async fn set_execution_time(conn: &mut Conn, timeout: Duration) {
        let mysql = format!("SET SESSION MAX_EXECUTION_TIME = {}", timeout.as_millis());
        if let Err(e) = conn.query_drop(mysql).await {
            tracing::debug!("MAX_EXECUTION_TIME not supported, trying max_statement_time: {}", e);
            let mariadb = format!("SET SESSION max_statement_time = {}", timeout.as_secs_f64());
            if let Err(e) = conn.query_drop(mariadb).await {
                tracing::warn!("Could not set a server-side statement timeout: {}", e);
            }
        }
    }

    fn row_to_values(mut row: Row) -> Vec<Value> {
        let columns = row.columns();
        (0..row.len())
            .map(|idx| {
                let value = row.take::<MySqlValue, usize>(idx).unwrap_or(MySqlValue::NULL);
                Self::mysql_value_to_json(value, &columns[idx])
            })
            .collect()
    }

    fn mysql_value_to_json(mysql_val: MySqlValue, column: &Column) -> Value {
        match mysql_val {
            MySqlValue::NULL => Value::Null,
            MySqlValue::Bytes(bytes) => bytes_to_json(bytes, column.column_type(), column.character_set()),
            MySqlValue::Int(i) => json!(i),
            MySqlValue::UInt(u) => json!(u),
            MySqlValue::Float(f) => float_to_json(f64::from(f)),
            MySqlValue::Double(d) => float_to_json(d),
            MySqlValue::Date(y, m, d, h, min, s, micros) => {
                if column.column_type() == ColumnType::MYSQL_TYPE_DATE {
                    json!(format!("{:04}-{:02}-{:02}", y, m, d))
                } else if micros > 0 {
                    json!(format!(
                        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:06}",
                        y, m, d, h, min, s, micros
                    ))
                } else {
                    json!(format!("{:04}-{:02}-{:02}T{:02}:{:02}:{:02}", y, m, d, h, min, s))
                }
            }
            MySqlValue::Time(is_neg, d, h, m, s, micros) => json!(format_time(is_neg, d, h, m, s, micros)),
        }
    }

    fn query_error(&self, e: mysql_async::Error) -> AppError {
        let error = match &e {
            mysql_async::Error::Server(server) => classify_server_error(server.code, &server.message),
            mysql_async::Error::Driver(driver) => classify_driver_error(driver),
            mysql_async::Error::Io(_) => AppError::Connection(format!("MySQL connection failed: {}", e)),
            _ => AppError::Execution(format!("Query execution failed: {}", e)),
        };
        error.scrubbed(&self.spec.secrets())
    }
}

#[async_trait::async_trait]
impl DatabaseAdapter for MySQLAdapter {
    async fn execute_query(
        &self,
        statement: &ValidatedStatement,
        limits: ExecutionLimits,
    ) -> Result<QueryResult, AppError> {
        let mut conn = self.open().await?;

        let outcome = tokio::time::timeout(
            limits.timeout,
            Self::run_read_only(&mut conn, statement.as_str(), limits),
        )
        .await;

        let result = match outcome {
            Ok(result) => result.map_err(|e| self.query_error(e)),
            Err(_) => Err(AppError::Timeout(format!(
                "Query did not complete within {} seconds and was abandoned",
                limits.timeout.as_secs()
            ))),
        };

        Self::close(conn).await;
        result
    }

    fn engine(&self) -> DatabaseEngine {
        DatabaseEngine::MySql
    }
}

/// Map a MySQL server error code onto the error taxonomy
fn classify_server_error(code: u16, message: &str) -> AppError {
    match code {
        // ER_QUERY_TIMEOUT (MySQL), ER_STATEMENT_TIMEOUT (MariaDB)
        3024 | 1969 => AppError::Timeout(format!(
            "Query was interrupted by the server after exceeding the execution time limit: {}",
            message
        )),
        // ER_CANT_EXECUTE_IN_READ_ONLY_TRANSACTION
        1792 => AppError::Execution(format!(
            "The database refused to modify data in a read-only session: {}",
            message
        )),
        // access denied, unknown database, too many connections
        1044 | 1045 | 1049 | 1040 | 1129 => {
            AppError::Connection(format!("Code: {}, Message: {}", code, message))
        }
        _ => AppError::Execution(format!("Code: {}, Message: {}", code, message)),
    }
}

/// Driver errors about the link itself are connection errors; the rest
/// (placeholder count mismatch and the like) are about the statement.
fn classify_driver_error(error: &DriverError) -> AppError {
    match error {
        DriverError::ConnectionClosed { .. }
        | DriverError::PoolDisconnected { .. }
        | DriverError::UnknownAuthPlugin { .. } => {
            AppError::Connection(format!("MySQL connection failed: {}", error))
        }
        _ => AppError::Execution(format!("Query execution failed: {}", error)),
    }
}

/// Collation id of the `binary` character set
const BINARY_CHARSET: u16 = 63;

fn is_binary_column(column_type: ColumnType, character_set: u16) -> bool {
    matches!(
        column_type,
        ColumnType::MYSQL_TYPE_TINY_BLOB
            | ColumnType::MYSQL_TYPE_MEDIUM_BLOB
            | ColumnType::MYSQL_TYPE_LONG_BLOB
            | ColumnType::MYSQL_TYPE_BLOB
            | ColumnType::MYSQL_TYPE_VAR_STRING
            | ColumnType::MYSQL_TYPE_STRING
            | ColumnType::MYSQL_TYPE_VARCHAR
            | ColumnType::MYSQL_TYPE_GEOMETRY
            | ColumnType::MYSQL_TYPE_BIT
    ) && (character_set == BINARY_CHARSET
        || matches!(column_type, ColumnType::MYSQL_TYPE_GEOMETRY | ColumnType::MYSQL_TYPE_BIT))
}

fn bytes_to_json(bytes: Vec<u8>, column_type: ColumnType, character_set: u16) -> Value {
    if column_type == ColumnType::MYSQL_TYPE_JSON {
        if let Ok(parsed) = serde_json::from_slice::<Value>(&bytes) {
            return parsed;
        }
    }
    if is_binary_column(column_type, character_set) {
        return json!(hex_bytes(&bytes));
    }
    // DECIMAL arrives as text and stays a string
    match String::from_utf8(bytes) {
        Ok(s) => json!(s),
        Err(e) => json!(hex_bytes(e.as_bytes())),
    }
}

fn format_time(is_neg: bool, days: u32, hours: u8, minutes: u8, seconds: u8, micros: u32) -> String {
    let sign = if is_neg { "-" } else { "" };
    let total_hours = days * 24 + u32::from(hours);
    if micros > 0 {
        format!("{}{:02}:{:02}:{:02}.{:06}", sign, total_hours, minutes, seconds, micros)
    } else {
        format!("{}{:02}:{:02}:{:02}", sign, total_hours, minutes, seconds)
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_server_error() {
        assert_eq!(classify_server_error(3024, "Query execution was interrupted").kind(), "timeout_error");
        assert_eq!(classify_server_error(1969, "Query execution was interrupted").kind(), "timeout_error");
        assert_eq!(classify_server_error(1045, "Access denied for user").kind(), "connection_error");
        assert_eq!(classify_server_error(1049, "Unknown database 'nope'").kind(), "connection_error");
        assert_eq!(classify_server_error(1054, "Unknown column 'nme'").kind(), "execution_error");
        assert_eq!(classify_server_error(1792, "Cannot execute statement in a READ ONLY transaction").kind(), "execution_error");
    }

    #[test]
    fn test_value_helpers() {
        assert_eq!(float_to_json(2.25), json!(2.25));
        assert_eq!(float_to_json(f64::INFINITY), json!("inf"));
        assert_eq!(hex_bytes(&[0xff, 0x00]), "\\xff00");
    }

    #[test]
    fn test_binary_columns_are_always_hex() {
        // valid UTF-8 in a VARBINARY/BLOB column still renders as hex
        assert_eq!(
            bytes_to_json(b"abc".to_vec(), ColumnType::MYSQL_TYPE_VAR_STRING, BINARY_CHARSET),
            json!("\\x616263")
        );
        assert_eq!(
            bytes_to_json(vec![0xde, 0xad], ColumnType::MYSQL_TYPE_BLOB, BINARY_CHARSET),
            json!("\\xdead")
        );
        // text columns and DECIMAL stay strings
        assert_eq!(bytes_to_json(b"abc".to_vec(), ColumnType::MYSQL_TYPE_VAR_STRING, 255), json!("abc"));
        assert_eq!(bytes_to_json(b"abc".to_vec(), ColumnType::MYSQL_TYPE_BLOB, 255), json!("abc"));
        assert_eq!(
            bytes_to_json(b"12.50".to_vec(), ColumnType::MYSQL_TYPE_NEWDECIMAL, BINARY_CHARSET),
            json!("12.50")
        );
        assert_eq!(
            bytes_to_json(br#"{"a":1}"#.to_vec(), ColumnType::MYSQL_TYPE_JSON, BINARY_CHARSET),
            json!({ "a": 1 })
        );
    }

    #[test]
    fn test_format_time_keeps_micros() {
        assert_eq!(format_time(false, 0, 10, 5, 7, 0), "10:05:07");
        assert_eq!(format_time(false, 0, 10, 5, 7, 250), "10:05:07.000250");
        assert_eq!(format_time(true, 1, 2, 0, 0, 0), "-26:00:00");
    }

    #[test]
    fn test_classify_driver_error() {
        let mismatch = DriverError::StmtParamsMismatch { required: 1, supplied: 0 };
        assert_eq!(classify_driver_error(&mismatch).kind(), "execution_error");
        assert_eq!(classify_driver_error(&DriverError::ConnectionClosed).kind(), "connection_error");
    }

    #[tokio::test]
    async fn test_unreachable_host_is_connection_error() {
        let adapter = MySQLAdapter::new(
            ConnectionSpec {
                engine: DatabaseEngine::MySql,
                host: "127.0.0.1".to_string(),
                port: 1,
                database: "app".to_string(),
                username: "reader".to_string(),
                password: "hunter2".to_string(),
            },
            Duration::from_secs(2),
        );
        let statement = crate::validation::SqlValidator::approve("SELECT 1").unwrap();
        let limits = ExecutionLimits {
            row_limit: 10,
            timeout: Duration::from_secs(2),
        };

        let err = adapter.execute_query(&statement, limits).await.unwrap_err();
        assert_eq!(err.kind(), "connection_error");
        assert!(!err.message().contains("hunter2"));
    }
}
