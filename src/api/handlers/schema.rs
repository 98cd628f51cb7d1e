use axum::{extract::rejection::JsonRejection, extract::State, Json};

use super::{invalid_body, AppState};
use crate::api::middleware::AppError;
use crate::models::{SchemaRequest, SchemaResponse};

/// Describe the tables of the caller's database
pub async fn get_schema(
    State(state): State<AppState>,
    payload: Result<Json<SchemaRequest>, JsonRejection>,
) -> Result<Json<SchemaResponse>, AppError> {
    let Json(payload) = payload.map_err(invalid_body)?;
    let response = state.schema_service.describe(payload.connection).await?;

    tracing::info!(
        "Schema described: {} tables (truncated: {})",
        response.schema.lines().count(),
        response.truncated
    );

    Ok(Json(response))
}
