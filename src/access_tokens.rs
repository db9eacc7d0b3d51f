//! Client-facing bearer tokens.
//!
//! When the gateway is exposed beyond localhost, clients authenticate
//! with issued access tokens. Tokens are stored hashed; the raw value is
//! returned exactly once at creation. Each token carries per-model usage
//! counters for the admin surface.

use std::collections::HashMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::store::{SharedStore, StoreError};

const TOKENS_KEY: &str = "access_tokens";
const TOKEN_PREFIX: &str = "khv";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelUsage {
    pub requests: u64,
    pub tokens: u64,
}

/// Stored representation of an issued access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessTokenEntry {
    pub id: String,
    pub name: String,
    /// Last six characters of the raw token, for listings.
    pub preview: String,
    pub created_at: DateTime<Utc>,
    pub active: bool,
    #[serde(default)]
    pub usage: HashMap<String, ModelUsage>,
    #[serde(default)]
    pub total_requests: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// The raw token plus its metadata, returned once at creation.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub token: String,
    pub id: String,
    pub name: String,
}

fn token_id(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}

/// Manages issued access tokens in the shared store.
pub struct AccessTokenStore {
    store: SharedStore,
}

impl AccessTokenStore {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    async fn load(&self, id: &str) -> Result<Option<AccessTokenEntry>, StoreError> {
        let raw = self.store.hash_get(TOKENS_KEY, id).await?;
        Ok(raw.and_then(|json| serde_json::from_str(&json).ok()))
    }

    async fn save(&self, entry: &AccessTokenEntry) -> Result<(), StoreError> {
        let json = serde_json::to_string(entry)
            .map_err(|e| StoreError::Unavailable(format!("token encode: {e}")))?;
        self.store.hash_set(TOKENS_KEY, &entry.id, &json).await
    }

    /// Generate and store a new token.
    pub async fn issue(&self, name: &str) -> Result<IssuedToken, StoreError> {
        let mut material = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut material);
        let raw = format!("{TOKEN_PREFIX}-{}", URL_SAFE_NO_PAD.encode(material));
        let id = token_id(&raw);

        let entry = AccessTokenEntry {
            id: id.clone(),
            name: if name.is_empty() {
                format!("token-{}", &id[..6])
            } else {
                name.to_string()
            },
            preview: format!("...{}", &raw[raw.len() - 6..]),
            created_at: Utc::now(),
            active: true,
            usage: HashMap::new(),
            total_requests: 0,
            total_tokens: 0,
        };
        self.save(&entry).await?;

        tracing::info!(name = %entry.name, id = %id, "issued access token");
        Ok(IssuedToken {
            token: raw,
            id,
            name: entry.name,
        })
    }

    /// Validate a presented token. Returns its entry when known and
    /// active.
    pub async fn validate(&self, raw: &str) -> Result<Option<AccessTokenEntry>, StoreError> {
        let entry = self.load(&token_id(raw)).await?;
        Ok(entry.filter(|e| e.active))
    }

    /// Fold one served request into the token's usage counters.
    pub async fn record_usage(
        &self,
        raw: &str,
        model: &str,
        tokens_used: u64,
    ) -> Result<(), StoreError> {
        let Some(mut entry) = self.load(&token_id(raw)).await? else {
            return Ok(());
        };
        let usage = entry.usage.entry(model.to_string()).or_default();
        usage.requests += 1;
        usage.tokens += tokens_used;
        entry.total_requests += 1;
        entry.total_tokens += tokens_used;
        self.save(&entry).await
    }

    pub async fn list(&self) -> Result<Vec<AccessTokenEntry>, StoreError> {
        let raw = self.store.hash_get_all(TOKENS_KEY).await?;
        let mut entries: Vec<AccessTokenEntry> = raw
            .into_values()
            .filter_map(|json| serde_json::from_str(&json).ok())
            .collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(entries)
    }

    /// Delete a token by id. Returns true if it existed.
    pub async fn revoke(&self, id: &str) -> Result<bool, StoreError> {
        let removed = self.store.hash_delete(TOKENS_KEY, id).await?;
        if removed {
            tracing::info!(id = %id, "revoked access token");
        }
        Ok(removed)
    }

    /// Whether any tokens exist. When none do, the gateway runs open
    /// (local-only mode) and the API requires no bearer auth.
    pub async fn any_issued(&self) -> Result<bool, StoreError> {
        Ok(self.store.hash_len(TOKENS_KEY).await? > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn tokens() -> AccessTokenStore {
        AccessTokenStore::new(MemoryStore::shared())
    }

    #[tokio::test]
    async fn issue_validate_revoke() {
        let store = tokens();
        assert!(!store.any_issued().await.unwrap());

        let issued = store.issue("ci").await.unwrap();
        assert!(issued.token.starts_with("khv-"));
        assert!(store.any_issued().await.unwrap());

        let entry = store.validate(&issued.token).await.unwrap().unwrap();
        assert_eq!(entry.name, "ci");
        assert_eq!(entry.id, issued.id);

        assert!(store.revoke(&issued.id).await.unwrap());
        assert!(store.validate(&issued.token).await.unwrap().is_none());
        // Revoking again is a no-op.
        assert!(!store.revoke(&issued.id).await.unwrap());
    }

    #[tokio::test]
    async fn unknown_token_is_invalid() {
        let store = tokens();
        assert!(store.validate("khv-bogus").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn usage_counters_accumulate() {
        let store = tokens();
        let issued = store.issue("").await.unwrap();

        store
            .record_usage(&issued.token, "gemini-2.5-flash", 100)
            .await
            .unwrap();
        store
            .record_usage(&issued.token, "gemini-2.5-flash", 50)
            .await
            .unwrap();
        store
            .record_usage(&issued.token, "gemini-2.5-pro", 10)
            .await
            .unwrap();

        let entry = store.validate(&issued.token).await.unwrap().unwrap();
        assert_eq!(entry.total_requests, 3);
        assert_eq!(entry.total_tokens, 160);
        assert_eq!(entry.usage["gemini-2.5-flash"].requests, 2);
        assert_eq!(entry.usage["gemini-2.5-flash"].tokens, 150);
        assert_eq!(entry.usage["gemini-2.5-pro"].requests, 1);
    }

    #[tokio::test]
    async fn default_name_derived_from_id() {
        let store = tokens();
        let issued = store.issue("").await.unwrap();
        assert_eq!(issued.name, format!("token-{}", &issued.id[..6]));
    }
}
