//! Credential registry: lifecycle and health scoring for upstream API keys.
//!
//! A credential is identified by the SHA-256 hash of its raw key (the
//! "handle"). Records live in the `credentials` store hash; the raw keys
//! live in a separate `credentials:raw` hash and are never logged. An
//! index set (`credentials:active`) gives a fast path for counting and
//! enumerating active handles.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::store::{BatchOp, SharedStore, StoreError};

pub const CREDENTIALS_KEY: &str = "credentials";
pub const ACTIVE_SET_KEY: &str = "credentials:active";
const RAW_KEYS_KEY: &str = "credentials:raw";

pub const HEALTH_MAX: i32 = 100;
const HEALTH_SUCCESS_DELTA: i32 = 5;
const HEALTH_FAILURE_DELTA: i32 = -10;
/// Consecutive credential-fault failures before auto-deactivation.
pub const DISABLE_AFTER_ERRORS: u32 = 5;

/// Derive the public handle for a raw API key.
pub fn handle_for(raw_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw_key.as_bytes());
    hex::encode(hasher.finalize())
}

fn preview_of(raw_key: &str) -> String {
    let tail: String = raw_key
        .chars()
        .rev()
        .take(6)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("...{tail}")
}

/// Stored representation of one upstream credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub id: String,
    /// Display label, typically the account email.
    pub label: String,
    /// Last six characters of the raw key, for dashboards.
    pub preview: String,
    #[serde(default)]
    pub project_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_validated: Option<DateTime<Utc>>,
    pub active: bool,
    /// 0..=100; adjusted after every classified request outcome.
    pub health: i32,
    pub consecutive_errors: u32,
    /// Models this credential can currently reach (subset of the catalog).
    pub models: Vec<String>,
    #[serde(default)]
    pub notes: String,
}

/// Manages credential records in the shared store.
///
/// This registry is the only writer of `credentials` records; the rate
/// accountant owns its own `rate:*` records and neither touches the
/// other's fields.
pub struct CredentialRegistry {
    store: SharedStore,
}

impl CredentialRegistry {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    async fn load(&self, handle: &str) -> Result<Option<CredentialRecord>, StoreError> {
        let raw = self.store.hash_get(CREDENTIALS_KEY, handle).await?;
        Ok(raw.and_then(|json| match serde_json::from_str(&json) {
            Ok(record) => Some(record),
            Err(err) => {
                tracing::warn!(handle = %&handle[..handle.len().min(8)], error = %err,
                    "dropping unparseable credential record");
                None
            }
        }))
    }

    async fn save(&self, handle: &str, record: &CredentialRecord) -> Result<(), StoreError> {
        let json = serde_json::to_string(record)
            .map_err(|e| StoreError::Unavailable(format!("credential encode: {e}")))?;
        self.store.hash_set(CREDENTIALS_KEY, handle, &json).await
    }

    // ── lifecycle ───────────────────────────────────────────────────────────

    /// Store and activate a credential. Returns its handle.
    ///
    /// If a record already exists under the same handle this **merges**:
    /// the detected models are unioned with the existing set, the
    /// label/preview/last-validated metadata is refreshed, and any
    /// disabled state is cleared. Health and error counters survive a
    /// merge; re-adding a key is not a health amnesty.
    pub async fn add(
        &self,
        raw_key: &str,
        label: &str,
        project_id: &str,
        detected_models: Vec<String>,
        notes: &str,
    ) -> Result<String, StoreError> {
        let handle = handle_for(raw_key);

        let record = match self.load(&handle).await? {
            Some(mut existing) => {
                let merged: BTreeSet<String> = existing
                    .models
                    .iter()
                    .cloned()
                    .chain(detected_models.iter().cloned())
                    .collect();
                tracing::info!(
                    handle = %&handle[..8],
                    merged = merged.len(),
                    had = existing.models.len(),
                    detected = detected_models.len(),
                    "merged existing credential"
                );
                existing.models = merged.into_iter().collect();
                existing.label = label.to_string();
                existing.preview = preview_of(raw_key);
                if !project_id.is_empty() {
                    existing.project_id = project_id.to_string();
                }
                if !notes.is_empty() {
                    existing.notes = notes.to_string();
                }
                existing.last_validated = Some(Utc::now());
                existing.active = true;
                existing
            }
            None => CredentialRecord {
                id: Uuid::new_v4().simple().to_string()[..12].to_string(),
                label: label.to_string(),
                preview: preview_of(raw_key),
                project_id: project_id.to_string(),
                created_at: Utc::now(),
                last_validated: Some(Utc::now()),
                active: true,
                health: HEALTH_MAX,
                consecutive_errors: 0,
                models: detected_models,
                notes: notes.to_string(),
            },
        };

        let json = serde_json::to_string(&record)
            .map_err(|e| StoreError::Unavailable(format!("credential encode: {e}")))?;
        self.store
            .batch(vec![
                BatchOp::HashSet {
                    key: CREDENTIALS_KEY.into(),
                    field: handle.clone(),
                    value: json,
                },
                BatchOp::HashSet {
                    key: RAW_KEYS_KEY.into(),
                    field: handle.clone(),
                    value: raw_key.to_string(),
                },
            ])
            .await?;
        self.store.set_add(ACTIVE_SET_KEY, &handle).await?;
        Ok(handle)
    }

    /// Remove a credential and its raw key. Idempotent: removing an
    /// unknown handle is a no-op success returning false.
    pub async fn remove(&self, handle: &str) -> Result<bool, StoreError> {
        let removed = self.store.hash_delete(CREDENTIALS_KEY, handle).await?;
        self.store.hash_delete(RAW_KEYS_KEY, handle).await?;
        self.store.set_remove(ACTIVE_SET_KEY, handle).await?;
        Ok(removed)
    }

    pub async fn get(&self, handle: &str) -> Result<Option<CredentialRecord>, StoreError> {
        self.load(handle).await
    }

    /// Fetch the raw API key for a handle. Callers must never log it.
    pub async fn raw_key(&self, handle: &str) -> Result<Option<String>, StoreError> {
        self.store.hash_get(RAW_KEYS_KEY, handle).await
    }

    pub async fn list_all(&self) -> Result<HashMap<String, CredentialRecord>, StoreError> {
        let raw = self.store.hash_get_all(CREDENTIALS_KEY).await?;
        Ok(raw
            .into_iter()
            .filter_map(|(handle, json)| {
                serde_json::from_str(&json).ok().map(|r| (handle, r))
            })
            .collect())
    }

    pub async fn list_active(&self) -> Result<HashMap<String, CredentialRecord>, StoreError> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(|(_, record)| record.active)
            .collect())
    }

    /// Active handle count via the index set, without parsing records.
    pub async fn active_count(&self) -> Result<usize, StoreError> {
        self.store.set_len(ACTIVE_SET_KEY).await
    }

    pub async fn active_handles(&self) -> Result<std::collections::HashSet<String>, StoreError> {
        self.store.set_members(ACTIVE_SET_KEY).await
    }

    // ── model re-detection ──────────────────────────────────────────────────

    /// Overwrite the advertised model set with what upstream currently
    /// reports. Unlike [`CredentialRegistry::add`] this **replaces**;
    /// background re-detection must reflect reality, not accumulate.
    /// Returns true if the set changed.
    pub async fn replace_models(
        &self,
        handle: &str,
        detected_models: Vec<String>,
    ) -> Result<bool, StoreError> {
        let Some(mut record) = self.load(handle).await? else {
            return Ok(false);
        };

        let old: BTreeSet<&String> = record.models.iter().collect();
        let new: BTreeSet<&String> = detected_models.iter().collect();
        if old == new {
            return Ok(false);
        }

        let added: Vec<_> = new.difference(&old).collect();
        let removed: Vec<_> = old.difference(&new).collect();
        if !added.is_empty() {
            tracing::info!(handle = %&handle[..8], ?added, "new models detected");
        }
        if !removed.is_empty() {
            tracing::info!(handle = %&handle[..8], ?removed, "models no longer available");
        }

        record.models = detected_models;
        record.last_validated = Some(Utc::now());
        self.save(handle, &record).await?;
        Ok(true)
    }

    // ── health scoring ──────────────────────────────────────────────────────

    /// Adjust the health score after a classified request outcome.
    ///
    /// Success: +5 capped at 100, error streak cleared. Failure: −10
    /// floored at 0; after [`DISABLE_AFTER_ERRORS`] consecutive failures
    /// the credential is deactivated and leaves the active set.
    ///
    /// Callers only invoke this for outcomes attributable to the
    /// credential itself; model-wide 429 storms bypass health scoring.
    pub async fn record_outcome(&self, handle: &str, success: bool) -> Result<(), StoreError> {
        let Some(mut record) = self.load(handle).await? else {
            return Ok(());
        };

        if success {
            record.health = (record.health + HEALTH_SUCCESS_DELTA).min(HEALTH_MAX);
            record.consecutive_errors = 0;
        } else {
            record.health = (record.health + HEALTH_FAILURE_DELTA).max(0);
            record.consecutive_errors += 1;

            if record.consecutive_errors >= DISABLE_AFTER_ERRORS {
                record.active = false;
                self.store.set_remove(ACTIVE_SET_KEY, handle).await?;
                tracing::warn!(
                    handle = %&handle[..8],
                    label = %record.label,
                    consecutive_errors = record.consecutive_errors,
                    "credential disabled after consecutive errors"
                );
            }
        }

        self.save(handle, &record).await
    }

    /// Re-enable a disabled credential with full health. Returns false
    /// for unknown handles.
    pub async fn reactivate(&self, handle: &str) -> Result<bool, StoreError> {
        let Some(mut record) = self.load(handle).await? else {
            return Ok(false);
        };
        record.active = true;
        record.health = HEALTH_MAX;
        record.consecutive_errors = 0;
        self.save(handle, &record).await?;
        self.store.set_add(ACTIVE_SET_KEY, handle).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn registry() -> CredentialRegistry {
        CredentialRegistry::new(MemoryStore::shared())
    }

    #[tokio::test]
    async fn add_creates_active_record() {
        let reg = registry();
        let handle = reg
            .add("AIza-test-key-12345", "a@example.com", "", vec!["gemini-2.5-flash".into()], "")
            .await
            .unwrap();

        assert_eq!(handle, handle_for("AIza-test-key-12345"));
        let record = reg.get(&handle).await.unwrap().unwrap();
        assert!(record.active);
        assert_eq!(record.health, 100);
        assert_eq!(record.preview, "...-12345");
        assert_eq!(reg.active_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn add_merges_models_and_clears_disabled() {
        let reg = registry();
        let handle = reg
            .add("key-one", "a@example.com", "", vec!["gemini-2.5-pro".into()], "")
            .await
            .unwrap();

        // Drive it into the disabled state.
        for _ in 0..DISABLE_AFTER_ERRORS {
            reg.record_outcome(&handle, false).await.unwrap();
        }
        assert!(!reg.get(&handle).await.unwrap().unwrap().active);
        assert_eq!(reg.active_count().await.unwrap(), 0);

        // Re-adding unions models and reactivates.
        let same = reg
            .add(
                "key-one",
                "b@example.com",
                "proj",
                vec!["gemini-2.5-flash".into()],
                "",
            )
            .await
            .unwrap();
        assert_eq!(same, handle);

        let record = reg.get(&handle).await.unwrap().unwrap();
        assert!(record.active);
        assert_eq!(record.label, "b@example.com");
        assert_eq!(
            record.models,
            vec!["gemini-2.5-flash".to_string(), "gemini-2.5-pro".to_string()]
        );
        assert_eq!(reg.active_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn replace_models_overwrites() {
        let reg = registry();
        let handle = reg
            .add(
                "key-two",
                "a@example.com",
                "",
                vec!["gemini-2.5-pro".into(), "gemini-2.5-flash".into()],
                "",
            )
            .await
            .unwrap();

        let changed = reg
            .replace_models(&handle, vec!["gemini-2.5-flash-lite".into()])
            .await
            .unwrap();
        assert!(changed);
        assert_eq!(
            reg.get(&handle).await.unwrap().unwrap().models,
            vec!["gemini-2.5-flash-lite".to_string()]
        );

        // Same set again is a no-op.
        let changed = reg
            .replace_models(&handle, vec!["gemini-2.5-flash-lite".into()])
            .await
            .unwrap();
        assert!(!changed);
    }

    #[tokio::test]
    async fn health_scoring_deltas() {
        let reg = registry();
        let handle = reg
            .add("key-three", "a@example.com", "", vec![], "")
            .await
            .unwrap();

        reg.record_outcome(&handle, false).await.unwrap();
        reg.record_outcome(&handle, false).await.unwrap();
        let record = reg.get(&handle).await.unwrap().unwrap();
        assert_eq!(record.health, 80);
        assert_eq!(record.consecutive_errors, 2);

        // A success heals +5 and clears the streak.
        reg.record_outcome(&handle, true).await.unwrap();
        let record = reg.get(&handle).await.unwrap().unwrap();
        assert_eq!(record.health, 85);
        assert_eq!(record.consecutive_errors, 0);

        // Health is capped at 100.
        for _ in 0..10 {
            reg.record_outcome(&handle, true).await.unwrap();
        }
        assert_eq!(reg.get(&handle).await.unwrap().unwrap().health, 100);
    }

    #[tokio::test]
    async fn disable_after_five_consecutive_errors_and_reactivate() {
        let reg = registry();
        let handle = reg
            .add("key-four", "a@example.com", "", vec![], "")
            .await
            .unwrap();

        for i in 0..DISABLE_AFTER_ERRORS {
            let record = reg.get(&handle).await.unwrap().unwrap();
            assert!(record.active, "still active after {i} errors");
            reg.record_outcome(&handle, false).await.unwrap();
        }

        let record = reg.get(&handle).await.unwrap().unwrap();
        assert!(!record.active);
        assert_eq!(reg.active_count().await.unwrap(), 0);

        assert!(reg.reactivate(&handle).await.unwrap());
        let record = reg.get(&handle).await.unwrap().unwrap();
        assert!(record.active);
        assert_eq!(record.health, HEALTH_MAX);
        assert_eq!(record.consecutive_errors, 0);
        assert_eq!(reg.active_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let reg = registry();
        let handle = reg
            .add("key-five", "a@example.com", "", vec![], "")
            .await
            .unwrap();

        assert!(reg.remove(&handle).await.unwrap());
        assert!(!reg.remove(&handle).await.unwrap());
        assert!(reg.get(&handle).await.unwrap().is_none());
        assert!(reg.raw_key(&handle).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn raw_key_stored_separately() {
        let reg = registry();
        let handle = reg
            .add("secret-raw-key", "a@example.com", "", vec![], "")
            .await
            .unwrap();
        assert_eq!(
            reg.raw_key(&handle).await.unwrap().as_deref(),
            Some("secret-raw-key")
        );
    }
}
