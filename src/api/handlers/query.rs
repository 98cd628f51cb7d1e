use axum::{extract::rejection::JsonRejection, extract::State, Json};

use super::{invalid_body, AppState};
use crate::api::middleware::AppError;
use crate::models::{QueryMode, QueryRequest, QueryResponse};

/// Run a query; the mode comes from the body
pub async fn run_query(
    State(state): State<AppState>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<QueryResponse>, AppError> {
    let Json(payload) = payload.map_err(invalid_body)?;
    let response = state.query_service.run(payload).await?;
    Ok(Json(response))
}

/// Execute user-written SQL
pub async fn execute_sql(
    State(state): State<AppState>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<QueryResponse>, AppError> {
    let Json(mut payload) = payload.map_err(invalid_body)?;
    payload.mode = Some(QueryMode::DirectSql);
    let response = state.query_service.run(payload).await?;
    Ok(Json(response))
}

/// Translate a question to SQL, then execute it
pub async fn generate_and_execute(
    State(state): State<AppState>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<QueryResponse>, AppError> {
    let Json(mut payload) = payload.map_err(invalid_body)?;
    payload.mode = Some(QueryMode::NaturalLanguage);
    let response = state.query_service.run(payload).await?;
    Ok(Json(response))
}
