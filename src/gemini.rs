//! Gemini REST API client.
//!
//! Wraps the upstream HTTP surface the gateway consumes: model listing,
//! content generation (text, multimodal input, function calling, search
//! grounding, code execution, image output, structured output, thinking),
//! embeddings, and a lightweight key probe. Authentication is the API key
//! as a `key` query parameter.
//!
//! The [`Upstream`] trait is the seam between the fallback executor and
//! the network; tests drive the executor with a scripted implementation.

use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use futures::future::join_all;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::catalog;

pub const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

const GENERATE_TIMEOUT: Duration = Duration::from_secs(60);
const LIST_MODELS_TIMEOUT: Duration = Duration::from_secs(15);
const EMBED_SINGLE_TIMEOUT: Duration = Duration::from_secs(30);
const EMBED_BATCH_TIMEOUT: Duration = Duration::from_secs(60);
const PROBE_TIMEOUT: Duration = Duration::from_secs(15);
const PROBE_PROMPT: &str = "Say OK";

/// Upstream error detail is truncated so a huge HTML error page never
/// lands in logs or client responses.
const ERROR_DETAIL_MAX: usize = 300;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Error from an upstream API call.
///
/// `status: None` means the request never produced an HTTP response
/// (connect failure, timeout); the fallback executor treats those as
/// credential faults, like other non-429 failures.
#[derive(Debug, Clone)]
pub struct UpstreamError {
    pub status: Option<u16>,
    pub model: String,
    pub message: String,
}

impl UpstreamError {
    pub fn http(status: u16, model: &str, body: &str) -> Self {
        let mut message = body.to_string();
        message.truncate(ERROR_DETAIL_MAX);
        Self {
            status: Some(status),
            model: model.to_string(),
            message,
        }
    }

    pub fn transport(model: &str, err: &reqwest::Error) -> Self {
        Self {
            status: None,
            model: model.to_string(),
            message: err.to_string(),
        }
    }

    /// 429 means the model/project quota is gone, not that the
    /// credential is broken.
    pub fn is_rate_limited(&self) -> bool {
        self.status == Some(429)
    }
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(code) => write!(f, "upstream error {} ({}): {}", code, self.model, self.message),
            None => write!(f, "upstream unreachable ({}): {}", self.model, self.message),
        }
    }
}

impl std::error::Error for UpstreamError {}

// ─────────────────────────────────────────────────────────────────────────────
// Request / result types
// ─────────────────────────────────────────────────────────────────────────────

/// Message content: a plain string or OpenAI-style multimodal parts.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<Value>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

impl MessageContent {
    /// The text carried by this content, for token estimation.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

/// One OpenAI-style chat message.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: MessageContent,
}

/// Generation parameters beyond the message list.
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    /// Gemini-format tools array (function declarations, google_search,
    /// code_execution, url_context).
    pub tools: Option<Vec<Value>>,
    pub tool_config: Option<Value>,
    pub thinking_budget: Option<i64>,
    /// OpenAI response_format object.
    pub response_format: Option<Value>,
    /// e.g. `["TEXT", "IMAGE"]` to request image output.
    pub response_modalities: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: Value,
}

/// Base64 image payload returned by image-generation models.
#[derive(Debug, Clone)]
pub struct InlineImage {
    pub mime_type: String,
    pub data: String,
}

/// Parsed generateContent result.
#[derive(Debug, Clone, Default)]
pub struct Generation {
    pub content: String,
    pub usage: TokenUsage,
    pub latency_ms: u64,
    pub function_calls: Vec<FunctionCall>,
    pub images: Vec<InlineImage>,
    pub grounding: Option<Value>,
}

/// Parsed embedContent / batchEmbedContents result.
#[derive(Debug, Clone)]
pub struct EmbeddingBatch {
    pub embeddings: Vec<Vec<f64>>,
    pub latency_ms: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Upstream trait
// ─────────────────────────────────────────────────────────────────────────────

/// The upstream generative API as the gateway consumes it.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn generate(
        &self,
        api_key: &str,
        model: &str,
        messages: &[ChatMessage],
        opts: &GenerateOptions,
    ) -> Result<Generation, UpstreamError>;

    async fn embed(
        &self,
        api_key: &str,
        model: &str,
        texts: &[String],
    ) -> Result<EmbeddingBatch, UpstreamError>;

    /// All model ids the key can access, via the metadata endpoint.
    /// Does not consume generation quota.
    async fn list_models(&self, api_key: &str) -> Result<Vec<String>, UpstreamError>;

    /// Minimal generation request; true when the key works on `model`.
    async fn probe(&self, api_key: &str, model: &str) -> bool;

    /// Which catalog models the key can access.
    ///
    /// Tries the model-listing endpoint up to three times (it is cheap
    /// and reliable), then falls back to probing every catalog model in
    /// parallel with real generation calls.
    async fn detect_models(&self, api_key: &str) -> Vec<String> {
        for attempt in 0..3u32 {
            match self.list_models(api_key).await {
                Ok(listed) if !listed.is_empty() => {
                    return catalog::all_model_ids()
                        .filter(|id| listed.iter().any(|l| l == id))
                        .map(str::to_string)
                        .collect();
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(attempt, error = %err, "model listing failed");
                }
            }
            if attempt < 2 {
                tokio::time::sleep(Duration::from_secs((attempt + 1) as u64)).await;
            }
        }

        tracing::warn!("model listing failed repeatedly, probing models directly");
        let probes = catalog::all_model_ids().map(|model| async move {
            if self.probe(api_key, model).await {
                Some(model.to_string())
            } else {
                None
            }
        });
        join_all(probes).await.into_iter().flatten().collect()
    }
}

pub type SharedUpstream = std::sync::Arc<dyn Upstream>;

// ─────────────────────────────────────────────────────────────────────────────
// HTTP client
// ─────────────────────────────────────────────────────────────────────────────

pub struct GeminiClient {
    http: reqwest::Client,
    base: String,
}

impl Default for GeminiClient {
    fn default() -> Self {
        Self::new()
    }
}

impl GeminiClient {
    pub fn new() -> Self {
        Self::with_base(API_BASE)
    }

    pub fn with_base(base: &str) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .expect("reqwest client with static config");
        Self {
            http,
            base: base.trim_end_matches('/').to_string(),
        }
    }

    async fn post_json(
        &self,
        url: &str,
        api_key: &str,
        model: &str,
        body: &Value,
        timeout: Duration,
    ) -> Result<Value, UpstreamError> {
        let resp = self
            .http
            .post(url)
            .query(&[("key", api_key)])
            .json(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| UpstreamError::transport(model, &e))?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(UpstreamError::http(status.as_u16(), model, &detail));
        }
        resp.json()
            .await
            .map_err(|e| UpstreamError::transport(model, &e))
    }
}

#[async_trait]
impl Upstream for GeminiClient {
    async fn generate(
        &self,
        api_key: &str,
        model: &str,
        messages: &[ChatMessage],
        opts: &GenerateOptions,
    ) -> Result<Generation, UpstreamError> {
        let url = format!("{}/models/{}:generateContent", self.base, model);
        let body = build_request_body(messages, opts);

        let started = Instant::now();
        let data = self
            .post_json(&url, api_key, model, &body, GENERATE_TIMEOUT)
            .await?;
        let latency_ms = started.elapsed().as_millis() as u64;

        Ok(parse_generation(&data, latency_ms))
    }

    async fn embed(
        &self,
        api_key: &str,
        model: &str,
        texts: &[String],
    ) -> Result<EmbeddingBatch, UpstreamError> {
        let started = Instant::now();
        let data = if let [text] = texts {
            let url = format!("{}/models/{}:embedContent", self.base, model);
            let body = json!({ "content": { "parts": [{ "text": text }] } });
            let data = self
                .post_json(&url, api_key, model, &body, EMBED_SINGLE_TIMEOUT)
                .await?;
            let values = data
                .pointer("/embedding/values")
                .and_then(Value::as_array)
                .map(|vals| vals.iter().filter_map(Value::as_f64).collect())
                .unwrap_or_default();
            vec![values]
        } else {
            let url = format!("{}/models/{}:batchEmbedContents", self.base, model);
            let requests: Vec<Value> = texts
                .iter()
                .map(|t| {
                    json!({
                        "model": format!("models/{model}"),
                        "content": { "parts": [{ "text": t }] },
                    })
                })
                .collect();
            let body = json!({ "requests": requests });
            let data = self
                .post_json(&url, api_key, model, &body, EMBED_BATCH_TIMEOUT)
                .await?;
            data.get("embeddings")
                .and_then(Value::as_array)
                .map(|embeddings| {
                    embeddings
                        .iter()
                        .map(|e| {
                            e.get("values")
                                .and_then(Value::as_array)
                                .map(|vals| vals.iter().filter_map(Value::as_f64).collect())
                                .unwrap_or_default()
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        Ok(EmbeddingBatch {
            embeddings: data,
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn list_models(&self, api_key: &str) -> Result<Vec<String>, UpstreamError> {
        let url = format!("{}/models", self.base);
        let resp = self
            .http
            .get(&url)
            .query(&[("key", api_key), ("pageSize", "1000")])
            .timeout(LIST_MODELS_TIMEOUT)
            .send()
            .await
            .map_err(|e| UpstreamError::transport("models.list", &e))?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(UpstreamError::http(status.as_u16(), "models.list", &detail));
        }

        let data: Value = resp
            .json()
            .await
            .map_err(|e| UpstreamError::transport("models.list", &e))?;
        Ok(data
            .get("models")
            .and_then(Value::as_array)
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("name").and_then(Value::as_str))
                    .map(|name| name.trim_start_matches("models/").to_string())
                    .filter(|name| !name.is_empty())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn probe(&self, api_key: &str, model: &str) -> bool {
        let url = format!("{}/models/{}:generateContent", self.base, model);
        let body = json!({
            "contents": [{ "parts": [{ "text": PROBE_PROMPT }] }],
            "generationConfig": { "maxOutputTokens": 5 },
        });
        match self
            .http
            .post(&url)
            .query(&[("key", api_key)])
            .json(&body)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Request building
// ─────────────────────────────────────────────────────────────────────────────

/// Convert OpenAI-style messages and options into a generateContent body.
///
/// System messages collapse into `systemInstruction`; assistant messages
/// become role `model`; multimodal parts are converted per
/// [`convert_parts`].
pub fn build_request_body(messages: &[ChatMessage], opts: &GenerateOptions) -> Value {
    let mut contents: Vec<Value> = Vec::new();
    let mut system_text: Option<String> = None;

    for msg in messages {
        if msg.role == "system" {
            system_text = Some(msg.content.text());
            continue;
        }
        let role = if msg.role == "assistant" { "model" } else { "user" };
        let parts = match &msg.content {
            MessageContent::Text(text) => vec![json!({ "text": text })],
            MessageContent::Parts(parts) => convert_parts(parts),
        };
        contents.push(json!({ "role": role, "parts": parts }));
    }

    let mut body = json!({ "contents": contents });

    if let Some(system) = system_text {
        body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
    }
    if let Some(tools) = &opts.tools {
        body["tools"] = json!(tools);
    }
    if let Some(tool_config) = &opts.tool_config {
        body["toolConfig"] = tool_config.clone();
    }

    let mut gen_config = serde_json::Map::new();
    if let Some(temperature) = opts.temperature {
        gen_config.insert("temperature".into(), json!(temperature));
    }
    if let Some(max_tokens) = opts.max_tokens {
        if max_tokens > 0 {
            gen_config.insert("maxOutputTokens".into(), json!(max_tokens));
        }
    }
    if let Some(budget) = opts.thinking_budget {
        gen_config.insert("thinkingConfig".into(), json!({ "thinkingBudget": budget }));
    }
    if let Some(modalities) = &opts.response_modalities {
        let upper: Vec<String> = modalities.iter().map(|m| m.to_uppercase()).collect();
        gen_config.insert("responseModalities".into(), json!(upper));
    }
    if let Some(format) = &opts.response_format {
        match format.get("type").and_then(Value::as_str) {
            Some("json_object") | Some("json") => {
                gen_config.insert("responseMimeType".into(), json!("application/json"));
            }
            Some("json_schema") => {
                gen_config.insert("responseMimeType".into(), json!("application/json"));
                if let Some(schema) = format.pointer("/json_schema/schema") {
                    gen_config.insert("responseSchema".into(), schema.clone());
                }
            }
            _ => {}
        }
    }
    if !gen_config.is_empty() {
        body["generationConfig"] = Value::Object(gen_config);
    }

    body
}

/// Convert OpenAI-style multimodal parts to Gemini parts.
///
/// Data-URI images become `inlineData`; remote URLs become `fileData`
/// (Gemini fetches them itself). Gemini-native parts pass through.
fn convert_parts(parts: &[Value]) -> Vec<Value> {
    let mut out = Vec::new();
    for part in parts {
        if let Some(text) = part.as_str() {
            out.push(json!({ "text": text }));
            continue;
        }
        match part.get("type").and_then(Value::as_str) {
            Some("text") => {
                out.push(json!({ "text": part.get("text").and_then(Value::as_str).unwrap_or("") }));
            }
            Some(kind @ ("image_url" | "audio_url" | "video_url")) => {
                let url = part
                    .get(kind)
                    .map(|v| match v {
                        Value::Object(obj) => {
                            obj.get("url").and_then(Value::as_str).unwrap_or("").to_string()
                        }
                        other => other.as_str().unwrap_or("").to_string(),
                    })
                    .unwrap_or_default();

                if let Some((header, b64_data)) = url
                    .strip_prefix("data:")
                    .and_then(|rest| rest.split_once(','))
                {
                    let mime = header.split(';').next().unwrap_or("application/octet-stream");
                    out.push(json!({
                        "inlineData": { "mimeType": mime, "data": b64_data }
                    }));
                } else if kind == "image_url" && !url.is_empty() {
                    out.push(json!({
                        "fileData": { "mimeType": "image/jpeg", "fileUri": url }
                    }));
                }
            }
            _ => {
                // Gemini-native parts pass through; anything else is
                // rendered as text.
                if part.get("text").is_some()
                    || part.get("inlineData").is_some()
                    || part.get("inline_data").is_some()
                    || part.get("fileData").is_some()
                    || part.get("file_data").is_some()
                {
                    out.push(part.clone());
                } else {
                    out.push(json!({ "text": part.to_string() }));
                }
            }
        }
    }
    out
}

// ─────────────────────────────────────────────────────────────────────────────
// Response parsing
// ─────────────────────────────────────────────────────────────────────────────

/// Extract content, images, function calls, grounding, and token counts
/// from a generateContent response.
pub fn parse_generation(data: &Value, latency_ms: u64) -> Generation {
    let mut generation = Generation {
        latency_ms,
        ..Generation::default()
    };

    if let Some(candidate) = data.pointer("/candidates/0") {
        if let Some(parts) = candidate.pointer("/content/parts").and_then(Value::as_array) {
            for part in parts {
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    generation.content.push_str(text);
                } else if let Some(inline) = part.get("inlineData") {
                    generation.images.push(InlineImage {
                        mime_type: inline
                            .get("mimeType")
                            .and_then(Value::as_str)
                            .unwrap_or("image/png")
                            .to_string(),
                        data: inline
                            .get("data")
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_string(),
                    });
                } else if let Some(call) = part.get("functionCall") {
                    generation.function_calls.push(FunctionCall {
                        name: call
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_string(),
                        arguments: call.get("args").cloned().unwrap_or(json!({})),
                    });
                } else if let Some(code) = part.get("executableCode") {
                    let language = code
                        .get("language")
                        .and_then(Value::as_str)
                        .unwrap_or("python")
                        .to_lowercase();
                    let source = code.get("code").and_then(Value::as_str).unwrap_or("");
                    generation
                        .content
                        .push_str(&format!("\n```{language}\n{source}\n```\n"));
                } else if let Some(result) = part.get("codeExecutionResult") {
                    let output = result.get("output").and_then(Value::as_str).unwrap_or("");
                    generation
                        .content
                        .push_str(&format!("\n**Execution Output:**\n```\n{output}\n```\n"));
                }
            }
        }

        if let Some(grounding) = candidate.get("groundingMetadata") {
            // Surface web sources inline so OpenAI clients that ignore
            // metadata still show them.
            if let Some(chunks) = grounding.get("groundingChunks").and_then(Value::as_array) {
                let sources: Vec<String> = chunks
                    .iter()
                    .filter_map(|chunk| chunk.get("web"))
                    .map(|web| {
                        let title = web.get("title").and_then(Value::as_str).unwrap_or("Source");
                        let uri = web.get("uri").and_then(Value::as_str).unwrap_or("");
                        format!("- [{title}]({uri})")
                    })
                    .collect();
                if !sources.is_empty() {
                    generation
                        .content
                        .push_str(&format!("\n\n---\n**Sources:**\n{}\n", sources.join("\n")));
                }
            }
            generation.grounding = Some(grounding.clone());
        }
    }

    if let Some(usage) = data.get("usageMetadata") {
        generation.usage = TokenUsage {
            prompt_tokens: usage
                .get("promptTokenCount")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            completion_tokens: usage
                .get("candidatesTokenCount")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            total_tokens: usage
                .get("totalTokenCount")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        };
    }

    generation
}

/// Render generated images as data-URI markdown appended to text content,
/// for clients that only understand text.
pub fn images_as_markdown(images: &[InlineImage]) -> String {
    images
        .iter()
        .enumerate()
        .map(|(i, img)| {
            format!(
                "\n\n![Generated Image {}](data:{};base64,{})",
                i + 1,
                img.mime_type,
                img.data
            )
        })
        .collect()
}

/// Decode an inline image payload, verifying it is valid base64.
pub fn decode_inline_image(img: &InlineImage) -> Option<Vec<u8>> {
    base64::engine::general_purpose::STANDARD.decode(&img.data).ok()
}
