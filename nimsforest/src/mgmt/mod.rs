//! Management surface: REST endpoints over the forest, served on loopback
//! by the daemon. Every mutating endpoint funnels through the forest mutex,
//! so concurrent requests are safe but not parallel.

use crate::config::{self, ConfigError, ForestConfig, NimEntry, TreehouseEntry};
use crate::forest::{Forest, ForestError};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// Raised to the daemon when a reload failed and left no live instances;
/// the process exits with code 2.
#[derive(Debug, Clone, Copy)]
pub struct EmptyForestReload;

#[derive(Clone)]
pub struct MgmtState {
    pub forest: Arc<Forest>,
    pub config_path: PathBuf,
    pub fatal: mpsc::Sender<EmptyForestReload>,
}

pub fn router(state: MgmtState) -> Router {
    Router::new()
        .route("/api/v1/components", get(list_components))
        .route("/api/v1/treehouses", post(add_treehouse))
        .route("/api/v1/treehouses/{name}", delete(remove_treehouse))
        .route("/api/v1/nims", post(add_nim))
        .route("/api/v1/nims/{name}", delete(remove_nim))
        .route("/-/reload", post(reload))
        .route("/health", get(health))
        .with_state(state)
}

/// Body shape for POSTs: the configuration entry fields plus the name that
/// the file format carries as the map key.
#[derive(Debug, Deserialize)]
struct TreehousePayload {
    name: String,
    #[serde(flatten)]
    entry: TreehouseEntry,
}

#[derive(Debug, Deserialize)]
struct NimPayload {
    name: String,
    #[serde(flatten)]
    entry: NimEntry,
}

async fn health() -> &'static str {
    "ok"
}

async fn list_components(State(state): State<MgmtState>) -> Response {
    Json(state.forest.list().await).into_response()
}

async fn add_treehouse(
    State(state): State<MgmtState>,
    Json(payload): Json<TreehousePayload>,
) -> Response {
    let spec = match config::validate_treehouse(&payload.name, payload.entry) {
        Ok(spec) => spec,
        Err(err) => return validation_failure(err),
    };
    match state.forest.add_treehouse(spec).await {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(err) => forest_failure(err),
    }
}

async fn remove_treehouse(
    State(state): State<MgmtState>,
    Path(name): Path<String>,
) -> Response {
    match state.forest.remove_treehouse(&name).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => forest_failure(err),
    }
}

async fn add_nim(State(state): State<MgmtState>, Json(payload): Json<NimPayload>) -> Response {
    let spec = match config::validate_nim(&payload.name, payload.entry) {
        Ok(spec) => spec,
        Err(err) => return validation_failure(err),
    };
    match state.forest.add_nim(spec).await {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(err) => forest_failure(err),
    }
}

async fn remove_nim(State(state): State<MgmtState>, Path(name): Path<String>) -> Response {
    match state.forest.remove_nim(&name).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => forest_failure(err),
    }
}

/// Re-reads the configuration file and applies the difference.
async fn reload(State(state): State<MgmtState>) -> Response {
    let new_config = match ForestConfig::load(&state.config_path) {
        Ok(new_config) => new_config,
        Err(err) => return validation_failure(err),
    };

    match state.forest.reload(new_config).await {
        Ok(report) => {
            let status = if report.fully_applied() {
                StatusCode::OK
            } else {
                StatusCode::MULTI_STATUS
            };

            if !report.fully_applied() && state.forest.list().await.is_empty() {
                warn!("reload failed with no live instances remaining");
                let _ = state.fatal.send(EmptyForestReload).await;
            }

            let body = json!({
                "added": report.added.len(),
                "removed": report.removed.len(),
                "kept": report.kept.len(),
                "failed": report.failed,
            });
            (status, Json(body)).into_response()
        }
        Err(err) => forest_failure(err),
    }
}

fn validation_failure(err: ConfigError) -> Response {
    error_response(StatusCode::BAD_REQUEST, &err.to_string())
}

fn forest_failure(err: ForestError) -> Response {
    let status = match &err {
        ForestError::DuplicateName { .. } | ForestError::IllegalState(_) => StatusCode::CONFLICT,
        ForestError::NotFound { .. } => StatusCode::NOT_FOUND,
        ForestError::Config(_) | ForestError::Script(_) | ForestError::Prompt(_) => {
            StatusCode::BAD_REQUEST
        }
        ForestError::Bus(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, &err.to_string())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
