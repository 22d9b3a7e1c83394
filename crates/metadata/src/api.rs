//! Read-only HTTP access to stored image records.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::error;

use crate::store::{ImageRecord, PersistError, RecordStore};

pub const DEFAULT_LIMIT: i64 = 50;
pub const MAX_LIMIT: i64 = 1000;

type SharedStore = Arc<dyn RecordStore>;
type ApiError = (StatusCode, Json<Value>);

#[derive(Debug, Deserialize)]
pub struct RecordsQuery {
    pub limit: Option<i64>,
}

pub fn records_router(store: SharedStore) -> Router {
    Router::new()
        .route("/records", get(list_records))
        .route("/records/{id}", get(get_record))
        .with_state(store)
}

fn internal(e: PersistError) -> ApiError {
    error!(error = %e, "record query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "record query failed" })),
    )
}

/// `GET /records?limit=N`: newest first, limit clamped to `1..=MAX_LIMIT`.
async fn list_records(
    State(store): State<SharedStore>,
    Query(query): Query<RecordsQuery>,
) -> Result<Json<Vec<ImageRecord>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    store.recent(limit).await.map(Json).map_err(internal)
}

async fn get_record(
    State(store): State<SharedStore>,
    Path(id): Path<i64>,
) -> Result<Json<ImageRecord>, ApiError> {
    match store.by_id(id).await.map_err(internal)? {
        Some(record) => Ok(Json(record)),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("record {id} not found") })),
        )),
    }
}
