use crate::api::middleware::AppError;
use crate::config::ExecutorConfig;
use crate::models::{ConnectionParams, DatabaseEngine, QueryResult, SchemaResponse};
use crate::services::database::{AdapterFactory, ExecutionLimits};
use crate::validation::SqlValidator;
use serde_json::Value;
use std::sync::Arc;

const POSTGRES_COLUMNS_SQL: &str = "SELECT table_schema, table_name, column_name, data_type \
     FROM information_schema.columns \
     WHERE table_schema NOT IN ('pg_catalog', 'information_schema') \
     ORDER BY table_schema, table_name, ordinal_position";

const MYSQL_COLUMNS_SQL: &str = "SELECT table_schema, table_name, column_name, data_type \
     FROM information_schema.columns \
     WHERE table_schema = DATABASE() \
     ORDER BY table_name, ordinal_position";

/// Schema introspection: a compact table/column listing for use as a prompt hint
pub struct SchemaService {
    adapters: Arc<dyn AdapterFactory>,
    executor: ExecutorConfig,
}

impl SchemaService {
    pub fn new(executor: &ExecutorConfig, adapters: Arc<dyn AdapterFactory>) -> Self {
        Self {
            adapters,
            executor: executor.clone(),
        }
    }

    fn columns_sql(engine: DatabaseEngine) -> &'static str {
        match engine {
            DatabaseEngine::Postgres => POSTGRES_COLUMNS_SQL,
            DatabaseEngine::MySql => MYSQL_COLUMNS_SQL,
        }
    }

    pub async fn describe(&self, connection: ConnectionParams) -> Result<SchemaResponse, AppError> {
        let spec = connection.into_spec()?;
        let engine = spec.engine;
        let password = spec.password.clone();

        tracing::info!("Fetching schema for {}", spec.display_target());

        // The catalog query takes the same path as user SQL
        let statement = SqlValidator::approve(Self::columns_sql(engine))?;
        let limits = ExecutionLimits {
            row_limit: self.executor.schema_row_limit,
            timeout: self.executor.statement_timeout(),
        };

        let result = self
            .adapters
            .create(spec)
            .execute_query(&statement, limits)
            .await
            .map_err(|e| e.scrubbed(&[password.as_str()]))?;

        Ok(SchemaResponse {
            schema: format_schema(&result, engine),
            truncated: result.truncated,
        })
    }
}

/// One line per table: `table (column type, ...)`. PostgreSQL tables outside
/// `public` keep their schema prefix.
pub fn format_schema(result: &QueryResult, engine: DatabaseEngine) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut current_table: Option<String> = None;
    let mut columns: Vec<String> = Vec::new();

    let text = |value: Option<&Value>| -> String {
        match value {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    };

    for row in &result.rows {
        let schema = text(row.first());
        let table = text(row.get(1));
        let column = text(row.get(2));
        let data_type = text(row.get(3));

        let qualified = match engine {
            DatabaseEngine::Postgres if schema != "public" && !schema.is_empty() => {
                format!("{}.{}", schema, table)
            }
            _ => table,
        };

        if current_table.as_deref() != Some(qualified.as_str()) {
            if let Some(done) = current_table.take() {
                lines.push(format!("{} ({})", done, columns.join(", ")));
                columns.clear();
            }
            current_table = Some(qualified);
        }
        columns.push(format!("{} {}", column, data_type));
    }

    if let Some(done) = current_table {
        lines.push(format!("{} ({})", done, columns.join(", ")));
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::services::query_service::testing::StubAdapterFactory;
    use serde_json::json;

    fn rows(data: &[[&str; 4]]) -> QueryResult {
        QueryResult {
            columns: vec![
                "table_schema".to_string(),
                "table_name".to_string(),
                "column_name".to_string(),
                "data_type".to_string(),
            ],
            rows: data.iter().map(|r| r.iter().map(|v| json!(v)).collect()).collect(),
            row_count: data.len(),
            truncated: false,
        }
    }

    #[test]
    fn test_catalog_queries_pass_validation() {
        assert!(SqlValidator::validate(POSTGRES_COLUMNS_SQL).accepted);
        assert!(SqlValidator::validate(MYSQL_COLUMNS_SQL).accepted);
    }

    #[test]
    fn test_format_schema_postgres() {
        let result = rows(&[
            ["public", "users", "id", "integer"],
            ["public", "users", "email", "text"],
            ["billing", "invoices", "id", "bigint"],
        ]);
        assert_eq!(
            format_schema(&result, DatabaseEngine::Postgres),
            "users (id integer, email text)\nbilling.invoices (id bigint)"
        );
    }

    #[test]
    fn test_format_schema_mysql() {
        let result = rows(&[
            ["shop", "orders", "id", "int"],
            ["shop", "orders", "total", "decimal"],
            ["shop", "products", "name", "varchar"],
        ]);
        assert_eq!(
            format_schema(&result, DatabaseEngine::MySql),
            "orders (id int, total decimal)\nproducts (name varchar)"
        );
        assert_eq!(format_schema(&rows(&[]), DatabaseEngine::MySql), "");
    }

    #[tokio::test]
    async fn test_describe_runs_catalog_query() {
        let factory = StubAdapterFactory::with_rows(0);
        let executed = factory.executed.clone();
        let service = SchemaService::new(&test_config().executor, Arc::new(factory));

        let connection: ConnectionParams = serde_json::from_value(json!({
            "dbType": "mysql",
            "dbHost": "localhost",
            "dbName": "shop",
            "dbUser": "reader",
        }))
        .unwrap();

        let response = service.describe(connection).await.unwrap();
        assert_eq!(response.schema, "");
        assert!(!response.truncated);
        assert_eq!(executed.lock().unwrap().as_slice(), &[MYSQL_COLUMNS_SQL.to_string()]);
    }
}
