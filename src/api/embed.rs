//! `POST /v1/embeddings`: OpenAI-compatible embeddings.

use std::sync::Arc;

use axum::extract::{Extension, State};
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};

use crate::catalog::{self, Capability, CapabilitySet};

use super::routes::{gateway_error_response, AppState, BearerToken};

/// Single text or batch input, as OpenAI clients send it.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum EmbeddingInput {
    Single(String),
    Batch(Vec<String>),
}

#[derive(Debug, Deserialize)]
pub struct EmbeddingRequest {
    #[serde(default = "default_model")]
    pub model: String,
    pub input: EmbeddingInput,
}

fn default_model() -> String {
    catalog::EMBEDDING_MODEL.to_string()
}

#[derive(Debug, Serialize)]
struct EmbeddingData {
    object: &'static str,
    index: usize,
    embedding: Vec<f64>,
}

#[derive(Debug, Serialize)]
struct EmbeddingUsage {
    prompt_tokens: u64,
    total_tokens: u64,
}

#[derive(Debug, Serialize)]
struct EmbeddingResponse {
    object: &'static str,
    data: Vec<EmbeddingData>,
    model: String,
    usage: EmbeddingUsage,
}

pub async fn create_embeddings(
    State(state): State<Arc<AppState>>,
    bearer: Option<Extension<BearerToken>>,
    Json(request): Json<EmbeddingRequest>,
) -> Response {
    let texts = match request.input {
        EmbeddingInput::Single(text) => vec![text],
        EmbeddingInput::Batch(texts) => texts,
    };
    // The embed endpoints report no usage metadata, so accounting runs
    // on estimates throughout.
    let estimated_tokens: u64 = texts.iter().map(|t| catalog::estimate_tokens(t)).sum();
    let preferred_model = catalog::resolve_alias(&request.model).to_string();

    let outcome = match state
        .executor
        .execute_embed(
            &preferred_model,
            CapabilitySet::of(&[Capability::Embedding]),
            &texts,
            estimated_tokens,
        )
        .await
    {
        Ok(outcome) => outcome,
        Err(err) => return gateway_error_response(err),
    };

    if let Some(Extension(BearerToken(token))) = bearer {
        if let Err(err) = state
            .access_tokens
            .record_usage(&token, &outcome.model, estimated_tokens)
            .await
        {
            tracing::warn!(error = %err, "failed to record token usage");
        }
    }

    let data = outcome
        .embeddings
        .into_iter()
        .enumerate()
        .map(|(index, embedding)| EmbeddingData {
            object: "embedding",
            index,
            embedding,
        })
        .collect();

    Json(EmbeddingResponse {
        object: "list",
        data,
        model: outcome.model,
        usage: EmbeddingUsage {
            prompt_tokens: estimated_tokens,
            total_tokens: estimated_tokens,
        },
    })
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn input_accepts_string_or_batch() {
        let single: EmbeddingRequest =
            serde_json::from_value(json!({ "input": "hello" })).unwrap();
        assert!(matches!(single.input, EmbeddingInput::Single(ref s) if s == "hello"));
        assert_eq!(single.model, catalog::EMBEDDING_MODEL);

        let batch: EmbeddingRequest = serde_json::from_value(json!({
            "model": "text-embedding-3-small",
            "input": ["a", "b"],
        }))
        .unwrap();
        assert!(matches!(batch.input, EmbeddingInput::Batch(ref v) if v.len() == 2));
        assert_eq!(
            catalog::resolve_alias(&batch.model),
            catalog::EMBEDDING_MODEL
        );
    }
}
