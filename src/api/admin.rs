//! Admin surface: key onboarding, token issuance, stats, and config
//! overrides. Loopback-only (enforced by the auth middleware).

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::json;

use crate::catalog;
use crate::error::GatewayError;

use super::routes::{error_response, gateway_error_response, AppState, CONFIG_KEY};

fn store_error(err: impl std::fmt::Display) -> Response {
    tracing::error!(error = %err, "store unavailable in admin handler");
    error_response(
        StatusCode::SERVICE_UNAVAILABLE,
        "state store unavailable".to_string(),
        "store_unavailable",
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Keys
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct AddKeyRequest {
    pub label: String,
    pub api_key: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub notes: String,
}

/// Validate a key by detecting its reachable models, then store it.
pub async fn add_key(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AddKeyRequest>,
) -> Response {
    let detected = state.upstream.detect_models(&request.api_key).await;
    if detected.is_empty() {
        return gateway_error_response(GatewayError::InvalidCredential {
            label: request.label,
            reason: "no models accessible".to_string(),
        });
    }

    let handle = match state
        .registry
        .add(
            &request.api_key,
            &request.label,
            &request.project_id,
            detected.clone(),
            &request.notes,
        )
        .await
    {
        Ok(handle) => handle,
        Err(err) => return store_error(err),
    };

    Json(json!({
        "status": "added",
        "handle": handle,
        "label": request.label,
        "available_models": detected,
    }))
    .into_response()
}

pub async fn list_keys(State(state): State<Arc<AppState>>) -> Response {
    let all = match state.registry.list_all().await {
        Ok(all) => all,
        Err(err) => return store_error(err),
    };
    let mut keys: Vec<_> = all
        .into_iter()
        .map(|(handle, record)| {
            json!({
                "handle": handle,
                "label": record.label,
                "preview": record.preview,
                "active": record.active,
                "health": record.health,
                "consecutive_errors": record.consecutive_errors,
                "available_models": record.models,
                "created_at": record.created_at,
                "last_validated": record.last_validated,
            })
        })
        .collect();
    keys.sort_by_key(|k| k["label"].as_str().unwrap_or_default().to_string());
    Json(json!({ "total": keys.len(), "keys": keys })).into_response()
}

pub async fn remove_key(
    State(state): State<Arc<AppState>>,
    Path(handle): Path<String>,
) -> Response {
    match state.registry.remove(&handle).await {
        Ok(true) => Json(json!({ "status": "removed", "handle": handle })).into_response(),
        Ok(false) => error_response(
            StatusCode::NOT_FOUND,
            "credential not found".to_string(),
            "not_found",
        ),
        Err(err) => store_error(err),
    }
}

/// Per-model quota usage for one credential.
pub async fn key_stats(
    State(state): State<Arc<AppState>>,
    Path(handle): Path<String>,
) -> Response {
    let record = match state.registry.get(&handle).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            return error_response(
                StatusCode::NOT_FOUND,
                "credential not found".to_string(),
                "not_found",
            )
        }
        Err(err) => return store_error(err),
    };

    let mut models = HashMap::new();
    for model in &record.models {
        match state.accountant.usage(&handle, model).await {
            Ok(usage) => {
                models.insert(model.clone(), usage);
            }
            Err(err) => return store_error(err),
        }
    }

    Json(json!({
        "label": record.label,
        "health": record.health,
        "active": record.active,
        "models": models,
    }))
    .into_response()
}

// ─────────────────────────────────────────────────────────────────────────────
// Stats and logs
// ─────────────────────────────────────────────────────────────────────────────

pub async fn stats(State(state): State<Arc<AppState>>) -> Response {
    let today = match state.stats.today().await {
        Ok(today) => today,
        Err(err) => return store_error(err),
    };
    let active = match state.registry.active_count().await {
        Ok(active) => active,
        Err(err) => return store_error(err),
    };
    Json(json!({
        "active_credentials": active,
        "total_requests": today.total_requests,
        "successful": today.successful,
        "failed": today.failed,
        "tokens_used": today.tokens_used,
        "success_rate": today.success_rate,
        "model_distribution": today.model_distribution,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default = "default_log_count")]
    pub count: usize,
    #[serde(default)]
    pub model: Option<String>,
}

fn default_log_count() -> usize {
    50
}

pub async fn logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogsQuery>,
) -> Response {
    match state
        .stats
        .recent(query.count.min(500), query.model.as_deref())
        .await
    {
        Ok(entries) => Json(json!({ "total": entries.len(), "logs": entries })).into_response(),
        Err(err) => store_error(err),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Access tokens
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateTokenRequest {
    #[serde(default)]
    pub name: String,
}

pub async fn create_token(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateTokenRequest>,
) -> Response {
    match state.access_tokens.issue(&request.name).await {
        Ok(issued) => Json(json!({
            "status": "created",
            // The raw token is only shown here, once.
            "token": issued.token,
            "id": issued.id,
            "name": issued.name,
            "warning": "Save this token now - it won't be shown again",
        }))
        .into_response(),
        Err(err) => store_error(err),
    }
}

pub async fn list_tokens(State(state): State<Arc<AppState>>) -> Response {
    match state.access_tokens.list().await {
        Ok(tokens) => Json(json!({ "total": tokens.len(), "tokens": tokens })).into_response(),
        Err(err) => store_error(err),
    }
}

pub async fn revoke_token(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.access_tokens.revoke(&id).await {
        Ok(true) => Json(json!({ "status": "deleted", "id": id })).into_response(),
        Ok(false) => error_response(
            StatusCode::NOT_FOUND,
            "token not found".to_string(),
            "not_found",
        ),
        Err(err) => store_error(err),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Config overrides
// ─────────────────────────────────────────────────────────────────────────────

/// Effective configuration plus the stored overrides. Weight overrides
/// apply at the next startup.
pub async fn get_config(State(state): State<Arc<AppState>>) -> Response {
    let overrides = match state.store.hash_get_all(CONFIG_KEY).await {
        Ok(map) => map,
        Err(err) => return store_error(err),
    };
    Json(json!({
        "effective": {
            "host": state.config.host,
            "port": state.config.port,
            "health_weight": state.config.health_weight,
            "capacity_weight": state.config.capacity_weight,
            "retry_attempts": state.config.retry_attempts,
            "log_level": state.config.log_level,
            "models": catalog::all_model_ids().collect::<Vec<_>>(),
        },
        "overrides": overrides,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct PutConfigRequest {
    #[serde(flatten)]
    pub values: HashMap<String, serde_json::Value>,
}

const OVERRIDABLE: &[&str] = &["health_weight", "capacity_weight", "retry_attempts"];

pub async fn put_config(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PutConfigRequest>,
) -> Response {
    let mut written = Vec::new();
    for (key, value) in &request.values {
        if !OVERRIDABLE.contains(&key.as_str()) {
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("unknown config key: {key}"),
                "invalid_request_error",
            );
        }
        let rendered = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        if let Err(err) = state.store.hash_set(CONFIG_KEY, key, &rendered).await {
            return store_error(err);
        }
        written.push(key.clone());
    }
    Json(json!({
        "status": "updated",
        "keys": written,
        "note": "weight changes take effect at the next gateway restart",
    }))
    .into_response()
}
