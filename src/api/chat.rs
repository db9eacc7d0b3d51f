//! `POST /v1/chat/completions`: OpenAI-compatible chat.
//!
//! The handler infers required model capabilities from the request,
//! estimates prompt tokens, runs the fallback executor, and shapes the
//! outcome into OpenAI's response schema. Streaming is synthesized: the
//! upstream is called non-streaming and the finished content is chunked
//! into SSE `chat.completion.chunk` events.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Extension, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use chrono::Utc;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::catalog::{self, Capability, CapabilitySet};
use crate::fallback::ChatOutcome;
use crate::gemini::{self, ChatMessage, GenerateOptions};

use super::routes::{gateway_error_response, AppState, BearerToken};

/// Synthesized SSE chunk size in characters.
const STREAM_CHUNK_CHARS: usize = 30;

// ─────────────────────────────────────────────────────────────────────────────
// Request / response types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default = "default_model")]
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stream: bool,
    /// OpenAI function tools or Gemini-native tools, passed through.
    #[serde(default)]
    pub tools: Option<Vec<Value>>,
    #[serde(default)]
    pub tool_choice: Option<Value>,
    /// Gemini-native tool config; `tool_choice` wins when both are set.
    #[serde(default)]
    pub tool_config: Option<Value>,
    /// `{"thinking_budget": n}` to control reasoning depth.
    #[serde(default)]
    pub thinking: Option<Value>,
    #[serde(default)]
    pub response_format: Option<Value>,
    #[serde(default)]
    pub response_modalities: Option<Vec<String>>,
}

fn default_model() -> String {
    catalog::GEMINI_25_FLASH.to_string()
}

#[derive(Debug, Serialize)]
struct ResponseMessage {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<Value>>,
}

#[derive(Debug, Serialize)]
struct ChatChoice {
    index: u32,
    message: ResponseMessage,
    finish_reason: String,
}

#[derive(Debug, Serialize)]
struct UsageInfo {
    prompt_tokens: u64,
    completion_tokens: u64,
    total_tokens: u64,
}

#[derive(Debug, Serialize)]
struct ChatCompletionResponse {
    id: String,
    object: &'static str,
    created: i64,
    model: String,
    choices: Vec<ChatChoice>,
    usage: UsageInfo,
    /// Routing detail: label used, model used, latency, fallback depth,
    /// function calls, grounding, image count.
    #[serde(skip_serializing_if = "Option::is_none")]
    gateway_metadata: Option<Value>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Capability inference and tool conversion
// ─────────────────────────────────────────────────────────────────────────────

/// Which model capabilities the request cannot do without.
pub fn required_capabilities(request: &ChatCompletionRequest) -> CapabilitySet {
    let mut caps = CapabilitySet::EMPTY;

    if let Some(tools) = &request.tools {
        for tool in tools {
            if tool.get("function_declarations").is_some()
                || tool.get("functionDeclarations").is_some()
                || tool.get("type").and_then(Value::as_str) == Some("function")
            {
                caps.insert(Capability::FunctionCalling);
            }
            if tool.get("google_search").is_some() || tool.get("googleSearch").is_some() {
                caps.insert(Capability::SearchGrounding);
            }
            if tool.get("code_execution").is_some() || tool.get("codeExecution").is_some() {
                caps.insert(Capability::CodeExecution);
            }
            if tool.get("url_context").is_some() || tool.get("urlContext").is_some() {
                caps.insert(Capability::UrlContext);
            }
        }
    }
    if let Some(modalities) = &request.response_modalities {
        if modalities.iter().any(|m| m.eq_ignore_ascii_case("image")) {
            caps.insert(Capability::ImageGeneration);
        }
    }
    if let Some(format) = &request.response_format {
        if matches!(
            format.get("type").and_then(Value::as_str),
            Some("json_object") | Some("json") | Some("json_schema")
        ) {
            caps.insert(Capability::StructuredOutput);
        }
    }
    caps
}

/// Convert OpenAI-format tools to Gemini format. Gemini-native tools
/// pass through unchanged.
pub fn convert_tools(tools: Option<&Vec<Value>>) -> Option<Vec<Value>> {
    let tools = tools?;
    let mut gemini_tools = Vec::new();
    let mut function_declarations = Vec::new();

    for tool in tools {
        if tool.get("function_declarations").is_some()
            || tool.get("functionDeclarations").is_some()
            || tool.get("google_search").is_some()
            || tool.get("code_execution").is_some()
            || tool.get("url_context").is_some()
        {
            gemini_tools.push(tool.clone());
            continue;
        }
        if tool.get("type").and_then(Value::as_str) == Some("function") {
            if let Some(function) = tool.get("function") {
                function_declarations.push(json!({
                    "name": function.get("name"),
                    "description": function.get("description"),
                    "parameters": function.get("parameters"),
                }));
            }
        }
    }
    if !function_declarations.is_empty() {
        gemini_tools.push(json!({ "function_declarations": function_declarations }));
    }

    if gemini_tools.is_empty() {
        None
    } else {
        Some(gemini_tools)
    }
}

/// Convert OpenAI `tool_choice` to a Gemini `toolConfig`.
pub fn convert_tool_choice(tool_choice: Option<&Value>) -> Option<Value> {
    match tool_choice? {
        Value::String(mode) => match mode.as_str() {
            "auto" => Some(json!({ "function_calling_config": { "mode": "AUTO" } })),
            "none" => Some(json!({ "function_calling_config": { "mode": "NONE" } })),
            "required" => Some(json!({ "function_calling_config": { "mode": "ANY" } })),
            _ => None,
        },
        choice @ Value::Object(_) => {
            let name = choice.pointer("/function/name").and_then(Value::as_str)?;
            Some(json!({
                "function_calling_config": {
                    "mode": "ANY",
                    "allowed_function_names": [name],
                }
            }))
        }
        _ => None,
    }
}

fn thinking_budget(thinking: Option<&Value>) -> Option<i64> {
    let thinking = thinking?;
    thinking
        .get("thinking_budget")
        .or_else(|| thinking.get("thinkingBudget"))
        .and_then(Value::as_i64)
}

fn estimated_prompt_tokens(messages: &[ChatMessage]) -> u64 {
    let text: String = messages
        .iter()
        .map(|m| m.content.text())
        .collect::<Vec<_>>()
        .join(" ");
    catalog::estimate_tokens(&text)
}

// ─────────────────────────────────────────────────────────────────────────────
// Handler
// ─────────────────────────────────────────────────────────────────────────────

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    bearer: Option<Extension<BearerToken>>,
    Json(request): Json<ChatCompletionRequest>,
) -> Response {
    let preferred_model = catalog::resolve_alias(&request.model).to_string();
    let required = required_capabilities(&request);
    let estimated_tokens = estimated_prompt_tokens(&request.messages);

    let opts = GenerateOptions {
        temperature: request.temperature,
        max_tokens: request.max_tokens,
        tools: convert_tools(request.tools.as_ref()),
        tool_config: convert_tool_choice(request.tool_choice.as_ref())
            .or_else(|| request.tool_config.clone()),
        thinking_budget: thinking_budget(request.thinking.as_ref()),
        response_format: request.response_format.clone(),
        response_modalities: request.response_modalities.clone(),
    };

    let outcome = match state
        .executor
        .execute_chat(
            &preferred_model,
            required,
            estimated_tokens,
            &request.messages,
            &opts,
        )
        .await
    {
        Ok(outcome) => outcome,
        Err(err) => return gateway_error_response(err),
    };

    // Attribute usage to the client token, when one authenticated the
    // request.
    if let Some(Extension(BearerToken(token))) = bearer {
        if let Err(err) = state
            .access_tokens
            .record_usage(&token, &outcome.model, outcome.generation.usage.total_tokens)
            .await
        {
            tracing::warn!(error = %err, "failed to record token usage");
        }
    }

    let request_id = format!("chatcmpl-{}", &Uuid::new_v4().simple().to_string()[..8]);
    if request.stream {
        sse_response(request_id, outcome)
    } else {
        json_response(request_id, outcome)
    }
}

fn response_content(outcome: &ChatOutcome) -> String {
    let mut content = outcome.generation.content.clone();
    content.push_str(&gemini::images_as_markdown(&outcome.generation.images));
    content
}

fn openai_tool_calls(outcome: &ChatOutcome) -> Option<Vec<Value>> {
    if outcome.generation.function_calls.is_empty() {
        return None;
    }
    Some(
        outcome
            .generation
            .function_calls
            .iter()
            .map(|call| {
                json!({
                    "id": format!("call_{}", &Uuid::new_v4().simple().to_string()[..8]),
                    "type": "function",
                    "function": {
                        "name": call.name,
                        "arguments": call.arguments.to_string(),
                    },
                })
            })
            .collect(),
    )
}

fn metadata(outcome: &ChatOutcome) -> Value {
    let mut metadata = json!({
        "label_used": outcome.label,
        "model_used": outcome.model,
        "latency_ms": outcome.generation.latency_ms,
        "fallback_count": outcome.fallback_depth,
    });
    if !outcome.generation.function_calls.is_empty() {
        metadata["function_calls"] = Value::Array(
            outcome
                .generation
                .function_calls
                .iter()
                .map(|c| json!({ "name": c.name, "arguments": c.arguments }))
                .collect(),
        );
    }
    if let Some(grounding) = &outcome.generation.grounding {
        metadata["grounding_metadata"] = grounding.clone();
    }
    if !outcome.generation.images.is_empty() {
        metadata["image_count"] = json!(outcome.generation.images.len());
    }
    metadata
}

fn finish_reason(outcome: &ChatOutcome) -> &'static str {
    if outcome.generation.function_calls.is_empty() {
        "stop"
    } else {
        "tool_calls"
    }
}

fn json_response(request_id: String, outcome: ChatOutcome) -> Response {
    let usage = outcome.generation.usage;
    let response = ChatCompletionResponse {
        id: request_id,
        object: "chat.completion",
        created: Utc::now().timestamp(),
        model: outcome.model.clone(),
        choices: vec![ChatChoice {
            index: 0,
            message: ResponseMessage {
                role: "assistant",
                content: response_content(&outcome),
                tool_calls: openai_tool_calls(&outcome),
            },
            finish_reason: finish_reason(&outcome).to_string(),
        }],
        usage: UsageInfo {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        },
        gateway_metadata: Some(metadata(&outcome)),
    };
    Json(response).into_response()
}

/// Chunk a completed response into the SSE shape streaming clients
/// expect. The upstream call already finished; this only affects
/// presentation.
fn sse_stream(
    request_id: String,
    outcome: ChatOutcome,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let created = Utc::now().timestamp();
    let content = response_content(&outcome);
    let model = outcome.model.clone();
    let reason = finish_reason(&outcome);

    async_stream::stream! {
        let chars: Vec<char> = content.chars().collect();
        for chunk in chars.chunks(STREAM_CHUNK_CHARS) {
            let delta: String = chunk.iter().collect();
            let data = json!({
                "id": request_id,
                "object": "chat.completion.chunk",
                "created": created,
                "model": model,
                "choices": [{ "index": 0, "delta": { "content": delta }, "finish_reason": null }],
            });
            yield Ok(Event::default().data(data.to_string()));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let done = json!({
            "id": request_id,
            "object": "chat.completion.chunk",
            "created": created,
            "model": model,
            "choices": [{ "index": 0, "delta": {}, "finish_reason": reason }],
        });
        yield Ok(Event::default().data(done.to_string()));
        yield Ok(Event::default().data("[DONE]"));
    }
}

fn sse_response(request_id: String, outcome: ChatOutcome) -> Response {
    Sse::new(sse_stream(request_id, outcome))
        .keep_alive(KeepAlive::default())
        .into_response()
}
