//! Request log and usage aggregates.
//!
//! Every fallback attempt (successful or failed) appends one entry to a
//! time-ordered log in the store; hourly aggregate hashes feed the
//! dashboard and admin stats without scanning the log.

use std::collections::HashMap;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::{BatchOp, SharedStore, StoreError};

pub const LOGS_KEY: &str = "logs";
const STATS_HOURLY_PREFIX: &str = "stats:hourly";
/// Log entries are pruned after a week.
pub const LOG_TTL_SECS: i64 = 604_800;
const HOURLY_TTL_SECS: i64 = 86_400;

/// One fallback attempt, as persisted in the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLogEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub handle: String,
    pub label: String,
    pub model: String,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub estimated_tokens: u64,
    pub success: bool,
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub fallback_depth: u32,
}

impl RequestLogEntry {
    fn base(handle: &str, label: &str, model: &str) -> Self {
        Self {
            id: format!("req_{}", &Uuid::new_v4().simple().to_string()[..8]),
            timestamp: Utc::now(),
            handle: handle.to_string(),
            label: label.to_string(),
            model: model.to_string(),
            tokens_used: 0,
            estimated_tokens: 0,
            success: true,
            latency_ms: 0,
            error: None,
            fallback_depth: 0,
        }
    }

    pub fn success(
        handle: &str,
        label: &str,
        model: &str,
        tokens_used: u64,
        estimated_tokens: u64,
        latency_ms: u64,
        fallback_depth: u32,
    ) -> Self {
        Self {
            tokens_used,
            estimated_tokens,
            latency_ms,
            fallback_depth,
            ..Self::base(handle, label, model)
        }
    }

    pub fn failure(
        handle: &str,
        label: &str,
        model: &str,
        estimated_tokens: u64,
        error: &str,
        fallback_depth: u32,
    ) -> Self {
        let mut error = error.to_string();
        error.truncate(200);
        Self {
            estimated_tokens,
            success: false,
            error: Some(error),
            fallback_depth,
            ..Self::base(handle, label, model)
        }
    }
}

/// Today's totals, summed from the hourly aggregates.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TodaySummary {
    pub total_requests: u64,
    pub successful: u64,
    pub failed: u64,
    pub tokens_used: u64,
    pub model_distribution: HashMap<String, u64>,
    pub success_rate: f64,
}

/// Records request logs to the store and computes aggregates.
pub struct StatsLog {
    store: SharedStore,
}

impl StatsLog {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    fn hour_key(at: DateTime<Utc>) -> String {
        format!("{STATS_HOURLY_PREFIX}:{}", at.format("%Y-%m-%d-%H"))
    }

    /// Append an entry and fold it into the hourly aggregate.
    pub async fn log(&self, entry: &RequestLogEntry) -> Result<(), StoreError> {
        let json = serde_json::to_string(entry)
            .map_err(|e| StoreError::Unavailable(format!("log encode: {e}")))?;
        let score = entry.timestamp.timestamp_millis() as f64 / 1000.0;
        self.store.sorted_add(LOGS_KEY, score, &json).await?;

        let hour_key = Self::hour_key(entry.timestamp);
        let counter = |field: &str, delta: i64| BatchOp::HashIncrBy {
            key: hour_key.clone(),
            field: field.to_string(),
            delta,
        };
        let mut ops = vec![counter("total_requests", 1)];
        ops.push(if entry.success {
            counter("successful", 1)
        } else {
            counter("failed", 1)
        });
        ops.push(counter("tokens_used", entry.tokens_used as i64));
        ops.push(BatchOp::Expire {
            key: hour_key.clone(),
            seconds: HOURLY_TTL_SECS,
        });
        self.store.batch(ops).await?;

        // Model distribution is a JSON map inside the hourly hash;
        // read-modify-write is fine at this write rate.
        let dist_raw = self.store.hash_get(&hour_key, "model_distribution").await?;
        let mut dist: HashMap<String, u64> = dist_raw
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        *dist.entry(entry.model.clone()).or_insert(0) += 1;
        let dist_json = serde_json::to_string(&dist)
            .map_err(|e| StoreError::Unavailable(format!("log encode: {e}")))?;
        self.store
            .hash_set(&hour_key, "model_distribution", &dist_json)
            .await
    }

    /// Most recent entries, newest first, optionally filtered by model.
    pub async fn recent(
        &self,
        count: usize,
        model: Option<&str>,
    ) -> Result<Vec<RequestLogEntry>, StoreError> {
        // Over-fetch so a model filter can still fill the page.
        let raw = self
            .store
            .sorted_rev_range(LOGS_KEY, 0, (count * 2) as isize - 1)
            .await?;
        let mut entries = Vec::with_capacity(count);
        for json in raw {
            let Ok(entry) = serde_json::from_str::<RequestLogEntry>(&json) else {
                continue;
            };
            if let Some(wanted) = model {
                if entry.model != wanted {
                    continue;
                }
            }
            entries.push(entry);
            if entries.len() >= count {
                break;
            }
        }
        Ok(entries)
    }

    /// Aggregate totals for the current UTC day.
    pub async fn today(&self) -> Result<TodaySummary, StoreError> {
        let now = Utc::now();
        let mut summary = TodaySummary::default();

        for hour in 0..24u32 {
            let key = format!(
                "{STATS_HOURLY_PREFIX}:{:04}-{:02}-{:02}-{:02}",
                now.year(),
                now.month(),
                now.day(),
                hour
            );
            let raw = self.store.hash_get_all(&key).await?;
            if raw.is_empty() {
                continue;
            }
            let get = |field: &str| -> u64 {
                raw.get(field).and_then(|v| v.parse().ok()).unwrap_or(0)
            };
            summary.total_requests += get("total_requests");
            summary.successful += get("successful");
            summary.failed += get("failed");
            summary.tokens_used += get("tokens_used");

            if let Some(dist_raw) = raw.get("model_distribution") {
                if let Ok(dist) = serde_json::from_str::<HashMap<String, u64>>(dist_raw) {
                    for (model, count) in dist {
                        *summary.model_distribution.entry(model).or_insert(0) += count;
                    }
                }
            }
        }

        if summary.total_requests > 0 {
            summary.success_rate = (summary.successful as f64 / summary.total_requests as f64
                * 1000.0)
                .round()
                / 10.0;
        }
        Ok(summary)
    }

    /// Drop log entries older than the retention window. Returns count
    /// removed.
    pub async fn prune_old(&self) -> Result<usize, StoreError> {
        let cutoff = Utc::now().timestamp_millis() as f64 / 1000.0 - LOG_TTL_SECS as f64;
        self.store.sorted_remove_below(LOGS_KEY, cutoff).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{KvStore, MemoryStore, SharedStore};

    fn stats() -> (StatsLog, SharedStore) {
        let store = MemoryStore::shared();
        (StatsLog::new(store.clone()), store)
    }

    #[tokio::test]
    async fn log_and_recent_roundtrip() {
        let (stats, _) = stats();
        stats
            .log(&RequestLogEntry::success(
                "h1", "a@example.com", "gemini-2.5-flash", 150, 100, 900, 0,
            ))
            .await
            .unwrap();
        stats
            .log(&RequestLogEntry::failure(
                "h1", "a@example.com", "gemini-2.5-pro", 100, "upstream error 429", 1,
            ))
            .await
            .unwrap();

        let recent = stats.recent(10, None).await.unwrap();
        assert_eq!(recent.len(), 2);

        let only_pro = stats.recent(10, Some("gemini-2.5-pro")).await.unwrap();
        assert_eq!(only_pro.len(), 1);
        assert!(!only_pro[0].success);
        assert_eq!(only_pro[0].error.as_deref(), Some("upstream error 429"));
    }

    #[tokio::test]
    async fn today_sums_hourly_aggregates() {
        let (stats, _) = stats();
        for _ in 0..3 {
            stats
                .log(&RequestLogEntry::success(
                    "h1", "a@example.com", "gemini-2.5-flash", 100, 80, 500, 0,
                ))
                .await
                .unwrap();
        }
        stats
            .log(&RequestLogEntry::failure(
                "h1", "a@example.com", "gemini-2.5-flash", 80, "boom", 0,
            ))
            .await
            .unwrap();

        let today = stats.today().await.unwrap();
        assert_eq!(today.total_requests, 4);
        assert_eq!(today.successful, 3);
        assert_eq!(today.failed, 1);
        assert_eq!(today.tokens_used, 300);
        assert_eq!(today.model_distribution["gemini-2.5-flash"], 4);
        assert_eq!(today.success_rate, 75.0);
    }

    #[tokio::test]
    async fn prune_removes_expired_entries() {
        let (stats, store) = stats();
        // One fresh entry via the normal path...
        stats
            .log(&RequestLogEntry::success(
                "h1", "a@example.com", "gemini-2.5-flash", 10, 10, 100, 0,
            ))
            .await
            .unwrap();
        // ...and one entry written eight days in the past.
        let old_score = Utc::now().timestamp() as f64 - (8 * 86_400) as f64;
        store
            .sorted_add(LOGS_KEY, old_score, "{\"stale\":true}")
            .await
            .unwrap();

        let removed = stats.prune_old().await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(
            store.sorted_rev_range(LOGS_KEY, 0, -1).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn failure_error_is_truncated() {
        let entry = RequestLogEntry::failure("h", "l", "m", 0, &"e".repeat(500), 0);
        assert_eq!(entry.error.unwrap().len(), 200);
    }
}
