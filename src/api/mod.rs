//! HTTP surface of the gateway.
//!
//! ## Endpoints
//!
//! - `POST /v1/chat/completions` - OpenAI-compatible chat (plain or SSE)
//! - `POST /v1/embeddings` - OpenAI-compatible embeddings
//! - `GET /v1/models` - Model catalog in OpenAI list format
//! - `GET /health` - Store and credential-pool health
//! - `POST /admin/keys` - Validate and add an upstream API key
//! - `GET /admin/keys` - List stored keys (previews only)
//! - `DELETE /admin/keys/{handle}` - Remove a key
//! - `GET /admin/keys/{handle}/stats` - Per-model quota usage for a key
//! - `GET /admin/stats` - Today's usage totals
//! - `GET /admin/logs` - Recent request log
//! - `POST /admin/tokens` - Issue a client access token
//! - `GET /admin/tokens` - List issued tokens
//! - `DELETE /admin/tokens/{id}` - Revoke a token
//! - `GET /admin/config` / `PUT /admin/config` - Runtime config overrides
//!
//! `/health` is public. `/admin/*` is loopback-only. `/v1/*` requires a
//! bearer access token once any token has been issued.

pub mod admin;
pub mod chat;
pub mod embed;
pub mod health;
pub mod models;
pub mod routes;

pub use routes::{serve, AppState};
