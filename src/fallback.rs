//! The per-request fallback loop.
//!
//! For every inbound chat or embedding request: ask the router for the
//! best (credential, model) pair, invoke upstream, classify the outcome,
//! update accounting and health, widen the exclusion sets, and retry,
//! until the request succeeds or the combinatorial space is exhausted.
//!
//! Classification rules:
//! - HTTP 429 is a model/project quota signal, not a credential fault.
//!   The pair is excluded; after a second distinct credential 429s on the
//!   same model, that model is blocked for the rest of this request.
//! - Any other upstream outcome (non-2xx or transport failure) counts
//!   against the credential's health.
//!
//! All per-request state (exclusions, blocked models, attempt counter)
//! lives on the stack of one call; nothing is shared across requests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::catalog::CapabilitySet;
use crate::credentials::CredentialRegistry;
use crate::error::GatewayError;
use crate::gemini::{ChatMessage, GenerateOptions, Generation, SharedUpstream};
use crate::ratelimit::RateAccountant;
use crate::router::{RouteError, Router};
use crate::stats::{RequestLogEntry, StatsLog};

/// Hard bound on fallback attempts per request, so worst-case latency
/// stays bounded even with many credentials and models.
pub const MAX_ATTEMPTS: u32 = 20;

/// Distinct credentials that must 429 on one model before the model is
/// considered unusable for the rest of the request.
const MODEL_BLOCK_THRESHOLD: u32 = 2;

/// A served chat request.
#[derive(Debug)]
pub struct ChatOutcome {
    pub generation: Generation,
    pub handle: String,
    pub label: String,
    pub model: String,
    /// Failed attempts before this one succeeded; 0 on first try.
    pub fallback_depth: u32,
}

/// A served embedding request.
#[derive(Debug)]
pub struct EmbedOutcome {
    pub embeddings: Vec<Vec<f64>>,
    pub handle: String,
    pub label: String,
    pub model: String,
    pub latency_ms: u64,
    pub estimated_tokens: u64,
    pub fallback_depth: u32,
}

/// Drives the select → invoke → classify → account cycle.
pub struct FallbackExecutor {
    router: Arc<Router>,
    registry: Arc<CredentialRegistry>,
    accountant: Arc<RateAccountant>,
    stats: Arc<StatsLog>,
    upstream: SharedUpstream,
}

/// Mutable per-request retry state.
struct RetryState {
    exclude_pairs: HashSet<(String, String)>,
    rate_limited_on: HashMap<String, u32>,
    blocked_models: HashSet<String>,
    attempts: u32,
    last_error: Option<String>,
}

impl RetryState {
    fn new() -> Self {
        Self {
            exclude_pairs: HashSet::new(),
            rate_limited_on: HashMap::new(),
            blocked_models: HashSet::new(),
            attempts: 0,
            last_error: None,
        }
    }

    fn exhausted(self) -> GatewayError {
        let mut blocked: Vec<String> = self.blocked_models.into_iter().collect();
        blocked.sort();
        GatewayError::Exhausted {
            attempts: self.attempts,
            blocked_models: blocked,
            last_error: self.last_error,
        }
    }
}

impl FallbackExecutor {
    pub fn new(
        router: Arc<Router>,
        registry: Arc<CredentialRegistry>,
        accountant: Arc<RateAccountant>,
        stats: Arc<StatsLog>,
        upstream: SharedUpstream,
    ) -> Self {
        Self {
            router,
            registry,
            accountant,
            stats,
            upstream,
        }
    }

    /// Classify a failed attempt, widen the exclusion sets, and apply
    /// any credential-health penalty.
    async fn classify_failure(
        &self,
        state: &mut RetryState,
        handle: &str,
        model: &str,
        rate_limited: bool,
    ) -> Result<(), GatewayError> {
        state
            .exclude_pairs
            .insert((handle.to_string(), model.to_string()));

        if rate_limited {
            let count = state
                .rate_limited_on
                .entry(model.to_string())
                .and_modify(|c| *c += 1)
                .or_insert(1);
            if *count >= MODEL_BLOCK_THRESHOLD {
                tracing::warn!(
                    model,
                    credentials = *count,
                    "model rate-limited on multiple credentials, blocking for this request"
                );
                state.blocked_models.insert(model.to_string());
            }
            // Quota exhaustion is model-wide; the credential keeps its
            // health.
        } else {
            self.registry.record_outcome(handle, false).await?;
        }
        Ok(())
    }

    // ── chat ────────────────────────────────────────────────────────────────

    pub async fn execute_chat(
        &self,
        preferred_model: &str,
        required: CapabilitySet,
        estimated_tokens: u64,
        messages: &[ChatMessage],
        opts: &GenerateOptions,
    ) -> Result<ChatOutcome, GatewayError> {
        let mut state = RetryState::new();

        while state.attempts < MAX_ATTEMPTS {
            state.attempts += 1;

            let target = match self
                .router
                .select(
                    Some(preferred_model),
                    estimated_tokens,
                    required,
                    &state.exclude_pairs,
                    &state.blocked_models,
                )
                .await
            {
                Ok(target) => target,
                Err(RouteError::Exhausted { .. }) => break,
                Err(RouteError::Store(err)) => return Err(err.into()),
            };

            let Some(api_key) = self.registry.raw_key(&target.handle).await? else {
                tracing::error!(handle = %&target.handle[..8], "no raw key stored for credential");
                state
                    .exclude_pairs
                    .insert((target.handle.clone(), target.model.clone()));
                continue;
            };

            match self
                .upstream
                .generate(&api_key, &target.model, messages, opts)
                .await
            {
                Ok(generation) => {
                    self.accountant
                        .record(&target.handle, &target.model, generation.usage.total_tokens)
                        .await?;
                    self.registry.record_outcome(&target.handle, true).await?;
                    self.stats
                        .log(&RequestLogEntry::success(
                            &target.handle,
                            &target.label,
                            &target.model,
                            generation.usage.total_tokens,
                            estimated_tokens,
                            generation.latency_ms,
                            state.attempts - 1,
                        ))
                        .await?;
                    return Ok(ChatOutcome {
                        generation,
                        handle: target.handle,
                        label: target.label,
                        model: target.model,
                        fallback_depth: state.attempts - 1,
                    });
                }
                Err(err) => {
                    tracing::warn!(
                        attempt = state.attempts,
                        model = %target.model,
                        label = %target.label,
                        error = %err,
                        "attempt failed, trying next pair"
                    );
                    self.classify_failure(
                        &mut state,
                        &target.handle,
                        &target.model,
                        err.is_rate_limited(),
                    )
                    .await?;
                    self.stats
                        .log(&RequestLogEntry::failure(
                            &target.handle,
                            &target.label,
                            &target.model,
                            estimated_tokens,
                            &err.to_string(),
                            state.attempts - 1,
                        ))
                        .await?;
                    state.last_error = Some(err.to_string());
                }
            }
        }

        Err(state.exhausted())
    }

    // ── embeddings ──────────────────────────────────────────────────────────

    /// Embedding requests run the same loop with the embedding
    /// capability pinned. Usage is recorded from the estimated token
    /// count; the embed endpoints report no usage metadata.
    pub async fn execute_embed(
        &self,
        preferred_model: &str,
        required: CapabilitySet,
        texts: &[String],
        estimated_tokens: u64,
    ) -> Result<EmbedOutcome, GatewayError> {
        let mut state = RetryState::new();

        while state.attempts < MAX_ATTEMPTS {
            state.attempts += 1;

            let target = match self
                .router
                .select(
                    Some(preferred_model),
                    estimated_tokens,
                    required,
                    &state.exclude_pairs,
                    &state.blocked_models,
                )
                .await
            {
                Ok(target) => target,
                Err(RouteError::Exhausted { .. }) => break,
                Err(RouteError::Store(err)) => return Err(err.into()),
            };

            let Some(api_key) = self.registry.raw_key(&target.handle).await? else {
                tracing::error!(handle = %&target.handle[..8], "no raw key stored for credential");
                state
                    .exclude_pairs
                    .insert((target.handle.clone(), target.model.clone()));
                continue;
            };

            match self.upstream.embed(&api_key, &target.model, texts).await {
                Ok(batch) => {
                    self.accountant
                        .record(&target.handle, &target.model, estimated_tokens)
                        .await?;
                    self.registry.record_outcome(&target.handle, true).await?;
                    self.stats
                        .log(&RequestLogEntry::success(
                            &target.handle,
                            &target.label,
                            &target.model,
                            estimated_tokens,
                            estimated_tokens,
                            batch.latency_ms,
                            state.attempts - 1,
                        ))
                        .await?;
                    return Ok(EmbedOutcome {
                        embeddings: batch.embeddings,
                        handle: target.handle,
                        label: target.label,
                        model: target.model,
                        latency_ms: batch.latency_ms,
                        estimated_tokens,
                        fallback_depth: state.attempts - 1,
                    });
                }
                Err(err) => {
                    tracing::warn!(
                        attempt = state.attempts,
                        model = %target.model,
                        label = %target.label,
                        error = %err,
                        "embedding attempt failed, trying next pair"
                    );
                    self.classify_failure(
                        &mut state,
                        &target.handle,
                        &target.model,
                        err.is_rate_limited(),
                    )
                    .await?;
                    self.stats
                        .log(&RequestLogEntry::failure(
                            &target.handle,
                            &target.label,
                            &target.model,
                            estimated_tokens,
                            &err.to_string(),
                            state.attempts - 1,
                        ))
                        .await?;
                    state.last_error = Some(err.to_string());
                }
            }
        }

        Err(state.exhausted())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{self, Capability, GEMINI_25_FLASH, GEMINI_25_PRO, GEMINI_3_FLASH};
    use crate::gemini::{EmbeddingBatch, TokenUsage, Upstream, UpstreamError};
    use crate::router::{DEFAULT_CAPACITY_WEIGHT, DEFAULT_HEALTH_WEIGHT};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Scripted upstream: responds per (api_key, model) rule, records
    /// every invocation.
    struct ScriptedUpstream {
        /// (key, model) → status code; 0 = transport failure; absent = success.
        failures: HashMap<(String, String), u16>,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedUpstream {
        fn new(failures: &[(&str, &str, u16)]) -> Self {
            Self {
                failures: failures
                    .iter()
                    .map(|(k, m, s)| ((k.to_string(), m.to_string()), *s))
                    .collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().unwrap().clone()
        }

        fn outcome(&self, api_key: &str, model: &str) -> Result<(), UpstreamError> {
            self.calls
                .lock()
                .unwrap()
                .push((api_key.to_string(), model.to_string()));
            match self.failures.get(&(api_key.to_string(), model.to_string())) {
                None => Ok(()),
                Some(0) => Err(UpstreamError {
                    status: None,
                    model: model.to_string(),
                    message: "connection refused".into(),
                }),
                Some(status) => Err(UpstreamError::http(*status, model, "scripted failure")),
            }
        }
    }

    #[async_trait]
    impl Upstream for ScriptedUpstream {
        async fn generate(
            &self,
            api_key: &str,
            model: &str,
            _messages: &[ChatMessage],
            _opts: &GenerateOptions,
        ) -> Result<Generation, UpstreamError> {
            self.outcome(api_key, model)?;
            Ok(Generation {
                content: "ok".into(),
                usage: TokenUsage {
                    prompt_tokens: 100,
                    completion_tokens: 50,
                    total_tokens: 150,
                },
                latency_ms: 42,
                ..Generation::default()
            })
        }

        async fn embed(
            &self,
            api_key: &str,
            model: &str,
            texts: &[String],
        ) -> Result<EmbeddingBatch, UpstreamError> {
            self.outcome(api_key, model)?;
            Ok(EmbeddingBatch {
                embeddings: texts.iter().map(|_| vec![0.1, 0.2]).collect(),
                latency_ms: 21,
            })
        }

        async fn list_models(&self, _api_key: &str) -> Result<Vec<String>, UpstreamError> {
            Ok(catalog::all_model_ids().map(str::to_string).collect())
        }

        async fn probe(&self, _api_key: &str, _model: &str) -> bool {
            true
        }
    }

    struct Fixture {
        executor: FallbackExecutor,
        registry: Arc<CredentialRegistry>,
        upstream: Arc<ScriptedUpstream>,
        stats: Arc<StatsLog>,
    }

    fn fixture(upstream: ScriptedUpstream) -> Fixture {
        let store = MemoryStore::shared();
        let registry = Arc::new(CredentialRegistry::new(store.clone()));
        let accountant = Arc::new(RateAccountant::new(store.clone()));
        let stats = Arc::new(StatsLog::new(store.clone()));
        let router = Arc::new(Router::new(
            registry.clone(),
            accountant.clone(),
            DEFAULT_HEALTH_WEIGHT,
            DEFAULT_CAPACITY_WEIGHT,
        ));
        let upstream = Arc::new(upstream);
        let executor = FallbackExecutor::new(
            router,
            registry.clone(),
            accountant,
            stats.clone(),
            upstream.clone(),
        );
        Fixture {
            executor,
            registry,
            upstream,
            stats,
        }
    }

    fn user_message() -> Vec<ChatMessage> {
        vec![ChatMessage {
            role: "user".into(),
            content: crate::gemini::MessageContent::Text("hello".into()),
        }]
    }

    async fn add_credential(f: &Fixture, key: &str, label: &str, models: &[&str]) -> String {
        f.registry
            .add(
                key,
                label,
                "",
                models.iter().map(|m| m.to_string()).collect(),
                "",
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn happy_path_records_and_serves() {
        let f = fixture(ScriptedUpstream::new(&[]));
        add_credential(&f, "key-a", "a@example.com", &[GEMINI_25_FLASH]).await;

        let outcome = f
            .executor
            .execute_chat(
                GEMINI_25_FLASH,
                CapabilitySet::EMPTY,
                100,
                &user_message(),
                &GenerateOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.fallback_depth, 0);
        assert_eq!(outcome.model, GEMINI_25_FLASH);
        assert_eq!(outcome.generation.usage.total_tokens, 150);

        // One successful attempt in the log, 150 tokens accounted.
        let logs = f.stats.recent(10, None).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].success);
        assert_eq!(logs[0].tokens_used, 150);
    }

    #[tokio::test]
    async fn falls_back_to_next_model_on_429() {
        // Single credential: pro 429s, 3-flash succeeds.
        let f = fixture(ScriptedUpstream::new(&[("key-a", GEMINI_25_PRO, 429)]));
        let handle =
            add_credential(&f, "key-a", "a@example.com", &[GEMINI_25_PRO, GEMINI_3_FLASH]).await;

        let outcome = f
            .executor
            .execute_chat(
                GEMINI_25_PRO,
                CapabilitySet::EMPTY,
                100,
                &user_message(),
                &GenerateOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.fallback_depth, 1);
        assert_eq!(outcome.model, GEMINI_3_FLASH);
        // 429 is not a credential fault: health untouched.
        let record = f.registry.get(&handle).await.unwrap().unwrap();
        assert_eq!(record.health, 100);
    }

    #[tokio::test]
    async fn two_credential_429s_block_the_model() {
        let f = fixture(ScriptedUpstream::new(&[
            ("key-a", GEMINI_25_PRO, 429),
            ("key-b", GEMINI_25_PRO, 429),
        ]));
        let a = add_credential(&f, "key-a", "a@example.com", &[GEMINI_25_PRO, GEMINI_25_FLASH]).await;
        let b = add_credential(&f, "key-b", "b@example.com", &[GEMINI_25_PRO, GEMINI_25_FLASH]).await;

        let outcome = f
            .executor
            .execute_chat(
                GEMINI_25_PRO,
                CapabilitySet::EMPTY,
                100,
                &user_message(),
                &GenerateOptions::default(),
            )
            .await
            .unwrap();

        // Two failed pro attempts, then a flash success.
        assert_eq!(outcome.fallback_depth, 2);
        assert_eq!(outcome.model, GEMINI_25_FLASH);

        let calls = f.upstream.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].1, GEMINI_25_PRO);
        assert_eq!(calls[1].1, GEMINI_25_PRO);
        assert_ne!(calls[0].0, calls[1].0, "distinct credentials tried pro");
        assert_eq!(calls[2].1, GEMINI_25_FLASH);

        // Neither credential lost health.
        for handle in [&a, &b] {
            assert_eq!(f.registry.get(handle).await.unwrap().unwrap().health, 100);
        }
    }

    #[tokio::test]
    async fn no_pair_is_tried_twice() {
        // Everything fails; the loop must visit each (credential, model)
        // pair at most once and stop.
        let f = fixture(ScriptedUpstream::new(&[
            ("key-a", GEMINI_25_PRO, 500),
            ("key-a", GEMINI_3_FLASH, 500),
            ("key-a", GEMINI_25_FLASH, 500),
            ("key-a", GEMINI_25_FLASH_LITE_ID, 500),
        ]));
        add_credential(
            &f,
            "key-a",
            "a@example.com",
            &[GEMINI_25_PRO, GEMINI_3_FLASH, GEMINI_25_FLASH],
        )
        .await;

        let err = f
            .executor
            .execute_chat(
                GEMINI_25_PRO,
                CapabilitySet::EMPTY,
                100,
                &user_message(),
                &GenerateOptions::default(),
            )
            .await
            .unwrap_err();

        let calls = f.upstream.calls();
        let unique: HashSet<_> = calls.iter().collect();
        assert_eq!(calls.len(), unique.len(), "a pair was retried");
        assert!(calls.len() <= MAX_ATTEMPTS as usize);
        assert!(matches!(err, GatewayError::Exhausted { .. }));
        if let GatewayError::Exhausted { last_error, .. } = err {
            assert!(last_error.unwrap().contains("500"));
        }
    }

    const GEMINI_25_FLASH_LITE_ID: &str = "gemini-2.5-flash-lite";

    #[tokio::test]
    async fn five_server_errors_disable_the_credential() {
        // One credential advertising one model; upstream always 500s.
        // The loop retries... no: the pair is excluded after the first
        // failure, so drive five separate requests.
        let f = fixture(ScriptedUpstream::new(&[("key-a", GEMINI_25_FLASH, 500)]));
        let handle = add_credential(&f, "key-a", "a@example.com", &[GEMINI_25_FLASH]).await;

        for _ in 0..5 {
            let err = f
                .executor
                .execute_chat(
                    GEMINI_25_FLASH,
                    CapabilitySet::EMPTY,
                    100,
                    &user_message(),
                    &GenerateOptions::default(),
                )
                .await
                .unwrap_err();
            assert!(matches!(err, GatewayError::Exhausted { .. }));
        }

        let record = f.registry.get(&handle).await.unwrap().unwrap();
        assert!(!record.active);
        assert_eq!(record.consecutive_errors, 5);
        assert_eq!(f.registry.active_count().await.unwrap(), 0);

        // The next request finds nothing at all.
        let err = f
            .executor
            .execute_chat(
                GEMINI_25_FLASH,
                CapabilitySet::EMPTY,
                100,
                &user_message(),
                &GenerateOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Exhausted { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn transport_failures_count_against_health() {
        let f = fixture(ScriptedUpstream::new(&[("key-a", GEMINI_25_FLASH, 0)]));
        let handle = add_credential(&f, "key-a", "a@example.com", &[GEMINI_25_FLASH]).await;

        let _ = f
            .executor
            .execute_chat(
                GEMINI_25_FLASH,
                CapabilitySet::EMPTY,
                100,
                &user_message(),
                &GenerateOptions::default(),
            )
            .await;

        let record = f.registry.get(&handle).await.unwrap().unwrap();
        assert_eq!(record.health, 90);
        assert_eq!(record.consecutive_errors, 1);
    }

    #[tokio::test]
    async fn embeddings_route_through_the_loop() {
        let f = fixture(ScriptedUpstream::new(&[]));
        add_credential(&f, "key-a", "a@example.com", &[catalog::EMBEDDING_MODEL]).await;

        let texts = vec!["first".to_string(), "second".to_string()];
        let outcome = f
            .executor
            .execute_embed(
                catalog::EMBEDDING_MODEL,
                CapabilitySet::of(&[Capability::Embedding]),
                &texts,
                40,
            )
            .await
            .unwrap();

        assert_eq!(outcome.embeddings.len(), 2);
        assert_eq!(outcome.model, catalog::EMBEDDING_MODEL);
        assert_eq!(outcome.fallback_depth, 0);

        let logs = f.stats.recent(10, None).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].tokens_used, 40);
    }

    #[tokio::test]
    async fn exhaustion_reports_blocked_models() {
        let f = fixture(ScriptedUpstream::new(&[
            ("key-a", GEMINI_25_PRO, 429),
            ("key-b", GEMINI_25_PRO, 429),
        ]));
        add_credential(&f, "key-a", "a@example.com", &[GEMINI_25_PRO]).await;
        add_credential(&f, "key-b", "b@example.com", &[GEMINI_25_PRO]).await;

        let err = f
            .executor
            .execute_chat(
                GEMINI_25_PRO,
                CapabilitySet::EMPTY,
                100,
                &user_message(),
                &GenerateOptions::default(),
            )
            .await
            .unwrap_err();

        match err {
            GatewayError::Exhausted {
                attempts,
                blocked_models,
                last_error,
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(blocked_models, vec![GEMINI_25_PRO.to_string()]);
                assert!(last_error.unwrap().contains("429"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
