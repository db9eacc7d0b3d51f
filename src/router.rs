//! Credential/model selection.
//!
//! Given a preferred model, the capabilities a request needs, and the
//! exclusion sets accumulated by earlier attempts, the router walks the
//! priority-ordered candidate models and picks the highest-scoring
//! eligible credential. Scoring blends credential health with remaining
//! capacity so a struggling key sheds traffic gracefully while healthy
//! keys share load.

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;

use crate::catalog::{self, Capability, CapabilitySet};
use crate::credentials::CredentialRegistry;
use crate::ratelimit::{RateAccountant, UsageSnapshot};
use crate::store::StoreError;

pub const DEFAULT_HEALTH_WEIGHT: f64 = 0.4;
pub const DEFAULT_CAPACITY_WEIGHT: f64 = 0.6;

/// A selected (credential, model) pair plus display metadata.
#[derive(Debug, Clone)]
pub struct RouteTarget {
    pub handle: String,
    pub model: String,
    pub label: String,
    pub preview: String,
}

#[derive(Debug, Error)]
pub enum RouteError {
    /// Every candidate model was blocked, incapable, excluded, or
    /// rate-limited for every active credential.
    #[error("all credentials exhausted across {models_tried} models ({active} active, {excluded} excluded)")]
    Exhausted {
        models_tried: usize,
        active: usize,
        excluded: usize,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct Router {
    registry: Arc<CredentialRegistry>,
    accountant: Arc<RateAccountant>,
    health_weight: f64,
    capacity_weight: f64,
}

impl Router {
    pub fn new(
        registry: Arc<CredentialRegistry>,
        accountant: Arc<RateAccountant>,
        health_weight: f64,
        capacity_weight: f64,
    ) -> Self {
        Self {
            registry,
            accountant,
            health_weight,
            capacity_weight,
        }
    }

    /// Pick the best (credential, model) pair.
    ///
    /// `exclude_pairs` holds (handle, model) combinations that already
    /// failed within the current request; `blocked_models` holds models
    /// the caller has decided to skip entirely for this request.
    pub async fn select(
        &self,
        preferred_model: Option<&str>,
        estimated_tokens: u64,
        required: CapabilitySet,
        exclude_pairs: &HashSet<(String, String)>,
        blocked_models: &HashSet<String>,
    ) -> Result<RouteTarget, RouteError> {
        let candidates = build_model_order(preferred_model, required);
        let active = self.registry.list_active().await?;

        if active.is_empty() {
            return Err(RouteError::Exhausted {
                models_tried: candidates.len(),
                active: 0,
                excluded: exclude_pairs.len(),
            });
        }

        let mut fallbacks = 0usize;
        for model in &candidates {
            if blocked_models.contains(*model) {
                fallbacks += 1;
                continue;
            }
            let Some(spec) = catalog::model(model) else {
                fallbacks += 1;
                continue;
            };
            if !required.is_subset_of(spec.caps) {
                fallbacks += 1;
                continue;
            }

            // Score every eligible, non-rate-limited credential for this
            // model and keep the best. Ties resolve by handle order so
            // identical inputs always pick the same credential.
            let mut best: Option<(f64, &String)> = None;
            for (handle, record) in &active {
                if !record.models.iter().any(|m| m == model) {
                    continue;
                }
                if exclude_pairs.contains(&(handle.clone(), model.to_string())) {
                    continue;
                }
                if self
                    .accountant
                    .check(handle, model, estimated_tokens)
                    .await?
                    .is_some()
                {
                    continue;
                }

                let usage = self.accountant.usage(handle, model).await?;
                let score = self.score(record.health, &usage);
                let better = match &best {
                    None => true,
                    Some((best_score, best_handle)) => {
                        match score.total_cmp(best_score) {
                            std::cmp::Ordering::Greater => true,
                            std::cmp::Ordering::Less => false,
                            std::cmp::Ordering::Equal => handle.as_str() < best_handle.as_str(),
                        }
                    }
                };
                if better {
                    best = Some((score, handle));
                }
            }

            if let Some((score, handle)) = best {
                let record = &active[handle];
                tracing::info!(
                    model = %model,
                    label = %record.label,
                    score,
                    fallbacks,
                    excluded = exclude_pairs.len(),
                    "routed request"
                );
                return Ok(RouteTarget {
                    handle: handle.clone(),
                    model: model.to_string(),
                    label: record.label.clone(),
                    preview: record.preview.clone(),
                });
            }
            fallbacks += 1;
        }

        Err(RouteError::Exhausted {
            models_tried: candidates.len(),
            active: active.len(),
            excluded: exclude_pairs.len(),
        })
    }

    /// `health × hw + capacity × cw`, where capacity is 100 minus the
    /// mean utilization percentage across the three limits.
    fn score(&self, health: i32, usage: &UsageSnapshot) -> f64 {
        let rpm_pct = usage.rpm_used as f64 / (usage.rpm_limit.max(1) as f64) * 100.0;
        let rpd_pct = usage.rpd_used as f64 / (usage.rpd_limit.max(1) as f64) * 100.0;
        let tpm_pct = usage.tpm_used as f64 / (usage.tpm_limit.max(1) as f64) * 100.0;
        let capacity = 100.0 - (rpm_pct + rpd_pct + tpm_pct) / 3.0;
        health as f64 * self.health_weight + capacity * self.capacity_weight
    }
}

/// Candidate models in try-order for a request.
///
/// Image generation and embedding requests get their own priority lists;
/// everything else walks the text list. A known preferred model moves to
/// the front, keeping the rest as fallbacks.
fn build_model_order(preferred: Option<&str>, required: CapabilitySet) -> Vec<&'static str> {
    let base: Vec<&'static str> = if required.contains(Capability::ImageGeneration) {
        catalog::IMAGE_PRIORITY.to_vec()
    } else if required.contains(Capability::Embedding) {
        vec![catalog::EMBEDDING_MODEL]
    } else {
        catalog::TEXT_PRIORITY.to_vec()
    };

    match preferred.and_then(catalog::model) {
        Some(spec) => {
            let mut order = vec![spec.id];
            order.extend(base.iter().copied().filter(|m| *m != spec.id));
            order
        }
        None => base,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{
        EMBEDDING_MODEL, GEMINI_25_FLASH, GEMINI_25_FLASH_IMAGE, GEMINI_25_PRO, GEMINI_3_FLASH,
    };
    use crate::store::{MemoryStore, SharedStore};

    struct Fixture {
        router: Router,
        registry: Arc<CredentialRegistry>,
        accountant: Arc<RateAccountant>,
        #[allow(dead_code)]
        store: SharedStore,
    }

    fn fixture() -> Fixture {
        let store = MemoryStore::shared();
        let registry = Arc::new(CredentialRegistry::new(store.clone()));
        let accountant = Arc::new(RateAccountant::new(store.clone()));
        let router = Router::new(
            registry.clone(),
            accountant.clone(),
            DEFAULT_HEALTH_WEIGHT,
            DEFAULT_CAPACITY_WEIGHT,
        );
        Fixture {
            router,
            registry,
            accountant,
            store,
        }
    }

    fn all_text_models() -> Vec<String> {
        catalog::TEXT_PRIORITY.iter().map(|m| m.to_string()).collect()
    }

    #[tokio::test]
    async fn model_order_prefers_requested_model() {
        let order = build_model_order(Some(GEMINI_25_FLASH), CapabilitySet::EMPTY);
        assert_eq!(order[0], GEMINI_25_FLASH);
        assert_eq!(order.len(), catalog::TEXT_PRIORITY.len());
        // Unknown preferred models are ignored.
        let order = build_model_order(Some("gpt-nonsense"), CapabilitySet::EMPTY);
        assert_eq!(order, catalog::TEXT_PRIORITY.to_vec());
    }

    #[tokio::test]
    async fn model_order_for_capabilities() {
        let image = CapabilitySet::of(&[Capability::ImageGeneration]);
        assert_eq!(build_model_order(None, image), vec![GEMINI_25_FLASH_IMAGE]);

        let embed = CapabilitySet::of(&[Capability::Embedding]);
        assert_eq!(build_model_order(None, embed), vec![EMBEDDING_MODEL]);
    }

    #[tokio::test]
    async fn no_active_credentials_is_exhausted() {
        let f = fixture();
        let err = f
            .router
            .select(None, 0, CapabilitySet::EMPTY, &HashSet::new(), &HashSet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RouteError::Exhausted { active: 0, .. }));
    }

    #[tokio::test]
    async fn selects_highest_capacity_credential() {
        let f = fixture();
        let a = f
            .registry
            .add("key-a", "a@example.com", "", vec![GEMINI_25_FLASH.into()], "")
            .await
            .unwrap();
        let b = f
            .registry
            .add("key-b", "b@example.com", "", vec![GEMINI_25_FLASH.into()], "")
            .await
            .unwrap();

        // a has burned 10/15 RPM, b only 2/15.
        for _ in 0..10 {
            f.accountant.record(&a, GEMINI_25_FLASH, 10).await.unwrap();
        }
        for _ in 0..2 {
            f.accountant.record(&b, GEMINI_25_FLASH, 10).await.unwrap();
        }

        let target = f
            .router
            .select(
                Some(GEMINI_25_FLASH),
                100,
                CapabilitySet::EMPTY,
                &HashSet::new(),
                &HashSet::new(),
            )
            .await
            .unwrap();
        assert_eq!(target.handle, b);
        assert_eq!(target.model, GEMINI_25_FLASH);
        assert_eq!(target.label, "b@example.com");
    }

    #[tokio::test]
    async fn health_outweighs_small_capacity_differences() {
        let f = fixture();
        let a = f
            .registry
            .add("key-a", "a@example.com", "", vec![GEMINI_25_FLASH.into()], "")
            .await
            .unwrap();
        let b = f
            .registry
            .add("key-b", "b@example.com", "", vec![GEMINI_25_FLASH.into()], "")
            .await
            .unwrap();

        // b took four failures: health 60 vs 100.
        for _ in 0..4 {
            f.registry.record_outcome(&b, false).await.unwrap();
        }
        // a is slightly busier than b.
        for _ in 0..2 {
            f.accountant.record(&a, GEMINI_25_FLASH, 10).await.unwrap();
        }

        let target = f
            .router
            .select(
                Some(GEMINI_25_FLASH),
                0,
                CapabilitySet::EMPTY,
                &HashSet::new(),
                &HashSet::new(),
            )
            .await
            .unwrap();
        assert_eq!(target.handle, a);
    }

    #[tokio::test]
    async fn excluded_pairs_are_skipped_but_other_models_remain() {
        let f = fixture();
        let a = f
            .registry
            .add("key-a", "a@example.com", "", all_text_models(), "")
            .await
            .unwrap();

        let mut exclude = HashSet::new();
        exclude.insert((a.clone(), GEMINI_25_PRO.to_string()));

        let target = f
            .router
            .select(
                Some(GEMINI_25_PRO),
                0,
                CapabilitySet::EMPTY,
                &exclude,
                &HashSet::new(),
            )
            .await
            .unwrap();
        // Same credential, next model in priority order.
        assert_eq!(target.handle, a);
        assert_eq!(target.model, GEMINI_3_FLASH);
    }

    #[tokio::test]
    async fn blocked_models_are_skipped_entirely() {
        let f = fixture();
        f.registry
            .add("key-a", "a@example.com", "", all_text_models(), "")
            .await
            .unwrap();

        let mut blocked = HashSet::new();
        blocked.insert(GEMINI_25_PRO.to_string());

        let target = f
            .router
            .select(
                Some(GEMINI_25_PRO),
                0,
                CapabilitySet::EMPTY,
                &HashSet::new(),
                &blocked,
            )
            .await
            .unwrap();
        assert_ne!(target.model, GEMINI_25_PRO);
    }

    #[tokio::test]
    async fn capability_filter_rejects_incapable_models() {
        let f = fixture();
        // Credential only advertises the image model; a function-calling
        // request cannot use it.
        f.registry
            .add(
                "key-a",
                "a@example.com",
                "",
                vec![GEMINI_25_FLASH_IMAGE.into()],
                "",
            )
            .await
            .unwrap();

        let required = CapabilitySet::of(&[Capability::FunctionCalling]);
        let err = f
            .router
            .select(None, 0, required, &HashSet::new(), &HashSet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RouteError::Exhausted { .. }));
    }

    #[tokio::test]
    async fn rate_limited_credentials_are_dropped() {
        let f = fixture();
        let a = f
            .registry
            .add("key-a", "a@example.com", "", vec![GEMINI_25_PRO.into()], "")
            .await
            .unwrap();
        // Fill gemini-2.5-pro's 5 RPM.
        for _ in 0..5 {
            f.accountant.record(&a, GEMINI_25_PRO, 10).await.unwrap();
        }

        let err = f
            .router
            .select(
                Some(GEMINI_25_PRO),
                0,
                CapabilitySet::EMPTY,
                &HashSet::new(),
                &HashSet::new(),
            )
            .await
            .unwrap_err();
        // Only advertises pro, and pro is rate-limited.
        assert!(matches!(err, RouteError::Exhausted { .. }));
    }

    #[tokio::test]
    async fn equal_scores_tie_break_by_handle() {
        let f = fixture();
        let a = f
            .registry
            .add("key-a", "a@example.com", "", vec![GEMINI_25_FLASH.into()], "")
            .await
            .unwrap();
        let b = f
            .registry
            .add("key-b", "b@example.com", "", vec![GEMINI_25_FLASH.into()], "")
            .await
            .unwrap();
        let expected = if a < b { a } else { b };

        for _ in 0..5 {
            let target = f
                .router
                .select(
                    Some(GEMINI_25_FLASH),
                    0,
                    CapabilitySet::EMPTY,
                    &HashSet::new(),
                    &HashSet::new(),
                )
                .await
                .unwrap();
            assert_eq!(target.handle, expected);
        }
    }
}
