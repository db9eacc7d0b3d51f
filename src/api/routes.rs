//! Application state, router assembly, and the auth middleware.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router as AxumRouter;
use serde::Serialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::access_tokens::AccessTokenStore;
use crate::config::Config;
use crate::credentials::CredentialRegistry;
use crate::error::GatewayError;
use crate::fallback::FallbackExecutor;
use crate::gemini::{GeminiClient, SharedUpstream};
use crate::monitor::{BackgroundMonitor, MonitorConfig};
use crate::ratelimit::RateAccountant;
use crate::router::Router;
use crate::stats::StatsLog;
use crate::store::{RedisStore, SharedStore};

/// Store hash holding admin config overrides.
pub const CONFIG_KEY: &str = "config";

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub store: SharedStore,
    pub registry: Arc<CredentialRegistry>,
    pub accountant: Arc<RateAccountant>,
    pub executor: Arc<FallbackExecutor>,
    pub stats: Arc<StatsLog>,
    pub access_tokens: Arc<AccessTokenStore>,
    pub upstream: SharedUpstream,
    pub started_at: Instant,
}

impl AppState {
    /// Wire all services over the given store and upstream.
    pub fn build(config: Config, store: SharedStore, upstream: SharedUpstream) -> Arc<Self> {
        let registry = Arc::new(CredentialRegistry::new(store.clone()));
        let accountant = Arc::new(RateAccountant::new(store.clone()));
        let stats = Arc::new(StatsLog::new(store.clone()));
        let router = Arc::new(Router::new(
            registry.clone(),
            accountant.clone(),
            config.health_weight,
            config.capacity_weight,
        ));
        let executor = Arc::new(FallbackExecutor::new(
            router,
            registry.clone(),
            accountant.clone(),
            stats.clone(),
            upstream.clone(),
        ));
        let access_tokens = Arc::new(AccessTokenStore::new(store.clone()));

        Arc::new(Self {
            config,
            store,
            registry,
            accountant,
            executor,
            stats,
            access_tokens,
            upstream,
            started_at: Instant::now(),
        })
    }
}

/// The validated bearer token of the current request, if any. Handlers
/// use it to attribute usage to the client token.
#[derive(Clone)]
pub struct BearerToken(pub String);

// ─────────────────────────────────────────────────────────────────────────────
// Error responses
// ─────────────────────────────────────────────────────────────────────────────

/// Minimal error body matching OpenAI's format.
#[derive(Serialize)]
struct ErrorBody {
    message: String,
    r#type: String,
    code: Option<String>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

pub fn error_response(status: StatusCode, message: String, code: &str) -> Response {
    let body = ErrorResponse {
        error: ErrorBody {
            message,
            r#type: "error".to_string(),
            code: Some(code.to_string()),
        },
    };
    (status, Json(body)).into_response()
}

/// Map a gateway error onto the client-visible HTTP contract.
pub fn gateway_error_response(err: GatewayError) -> Response {
    match err {
        GatewayError::Exhausted {
            attempts,
            blocked_models,
            last_error,
        } => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": "All credentials exhausted across all models",
                "fallback_count": attempts,
                "blocked_models": blocked_models,
                "last_error": last_error.unwrap_or_else(|| "no credentials available".to_string()),
            })),
        )
            .into_response(),
        GatewayError::Store(err) => {
            tracing::error!(error = %err, "store unavailable while serving request");
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "state store unavailable".to_string(),
                "store_unavailable",
            )
        }
        GatewayError::InvalidCredential { label, reason } => error_response(
            StatusCode::BAD_REQUEST,
            format!("invalid credential for {label}: {reason}"),
            "invalid_credential",
        ),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Auth middleware
// ─────────────────────────────────────────────────────────────────────────────

/// Access rules:
/// - `/health` is always public.
/// - `/admin/*` only answers loopback clients.
/// - `/v1/*` requires a bearer access token once any token exists; with
///   no tokens issued the gateway runs in open local-only mode.
async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    if path == "/health" {
        return next.run(request).await;
    }

    if path.starts_with("/admin") {
        if !addr.ip().is_loopback() {
            return error_response(
                StatusCode::FORBIDDEN,
                "admin endpoints are only accessible from localhost".to_string(),
                "forbidden",
            );
        }
        return next.run(request).await;
    }

    if path.starts_with("/v1/") {
        let any_issued = match state.access_tokens.any_issued().await {
            Ok(v) => v,
            Err(err) => {
                tracing::error!(error = %err, "store unavailable during auth");
                return error_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "state store unavailable".to_string(),
                    "store_unavailable",
                );
            }
        };
        if any_issued {
            let token = request
                .headers()
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(str::to_string);
            let Some(token) = token else {
                return error_response(
                    StatusCode::UNAUTHORIZED,
                    "access token required; set Authorization: Bearer <token>".to_string(),
                    "authentication_error",
                );
            };
            match state.access_tokens.validate(&token).await {
                Ok(Some(_)) => {
                    request.extensions_mut().insert(BearerToken(token));
                }
                Ok(None) => {
                    return error_response(
                        StatusCode::UNAUTHORIZED,
                        "invalid or revoked access token".to_string(),
                        "authentication_error",
                    );
                }
                Err(err) => {
                    tracing::error!(error = %err, "store unavailable during auth");
                    return error_response(
                        StatusCode::SERVICE_UNAVAILABLE,
                        "state store unavailable".to_string(),
                        "store_unavailable",
                    );
                }
            }
        }
    }

    next.run(request).await
}

// ─────────────────────────────────────────────────────────────────────────────
// Router assembly and server
// ─────────────────────────────────────────────────────────────────────────────

pub fn app_router(state: Arc<AppState>) -> AxumRouter {
    AxumRouter::new()
        .route("/health", get(super::health::health_check))
        .route("/v1/models", get(super::models::list_models))
        .route("/v1/chat/completions", post(super::chat::chat_completions))
        .route("/v1/embeddings", post(super::embed::create_embeddings))
        .route("/admin/keys", post(super::admin::add_key).get(super::admin::list_keys))
        .route("/admin/keys/:handle", delete(super::admin::remove_key))
        .route("/admin/keys/:handle/stats", get(super::admin::key_stats))
        .route("/admin/stats", get(super::admin::stats))
        .route("/admin/logs", get(super::admin::logs))
        .route(
            "/admin/tokens",
            post(super::admin::create_token).get(super::admin::list_tokens),
        )
        .route("/admin/tokens/:id", delete(super::admin::revoke_token))
        .route(
            "/admin/config",
            get(super::admin::get_config).put(super::admin::put_config),
        )
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Apply overrides from the admin `config` hash on top of the env
/// configuration. Weight changes take effect at the next startup.
async fn apply_config_overrides(config: &mut Config, store: &SharedStore) {
    let overrides = match store.hash_get_all(CONFIG_KEY).await {
        Ok(map) => map,
        Err(err) => {
            tracing::warn!(error = %err, "could not read config overrides");
            return;
        }
    };
    if let Some(v) = overrides.get("health_weight").and_then(|v| v.parse().ok()) {
        config.health_weight = v;
    }
    if let Some(v) = overrides.get("capacity_weight").and_then(|v| v.parse().ok()) {
        config.capacity_weight = v;
    }
    if let Some(v) = overrides.get("retry_attempts").and_then(|v| v.parse().ok()) {
        config.retry_attempts = v;
    }
}

async fn shutdown_signal() {
    // SIGINT or SIGTERM, whichever lands first.
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Start the HTTP server and the background monitor.
pub async fn serve(mut config: Config) -> anyhow::Result<()> {
    let store: SharedStore = Arc::new(RedisStore::connect(&config.redis_url).await?);
    apply_config_overrides(&mut config, &store).await;

    let upstream: SharedUpstream = Arc::new(GeminiClient::new());
    let state = AppState::build(config.clone(), store, upstream);

    let monitor = Arc::new(BackgroundMonitor::new(
        state.registry.clone(),
        state.accountant.clone(),
        state.stats.clone(),
        state.upstream.clone(),
        MonitorConfig::default(),
    ));
    let monitor_handles = monitor.spawn();

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "gateway listening");

    axum::serve(
        listener,
        app_router(state.clone()).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    for handle in monitor_handles {
        handle.abort();
    }
    state.store.close();
    tracing::info!("gateway stopped");
    Ok(())
}
