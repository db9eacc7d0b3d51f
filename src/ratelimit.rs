//! Rate accounting: sliding-window RPM/TPM plus calendar-day RPD per
//! (credential, model) pair.
//!
//! Windows are lazy: stale entries are dropped on the next read of the
//! same record and by the periodic cleanup loop, never eagerly. Each
//! record is one store hash keyed `rate:{handle}:{model}` whose
//! `requests`/`tokens` fields hold JSON arrays, so a full update is a
//! single-key atomic batch.
//!
//! The RPD boundary is midnight in the quota provider's calendar zone,
//! fixed at UTC−8 with no DST adjustment. That matches the provider's
//! published reset behavior and is a documented approximation.

use std::fmt;

use chrono::{FixedOffset, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog;
use crate::store::{BatchOp, SharedStore, StoreError};

pub const RATE_KEY_PREFIX: &str = "rate";
/// Sliding window length for RPM/TPM.
const WINDOW_SECS: f64 = 60.0;
/// Rate records expire after a day of inactivity.
pub const RATE_TTL_SECS: i64 = 86_400;

const QUOTA_ZONE_OFFSET_SECS: i32 = -8 * 3600;

fn quota_zone() -> FixedOffset {
    FixedOffset::east_opt(QUOTA_ZONE_OFFSET_SECS).expect("static UTC-8 offset")
}

/// Current date in the quota zone as `YYYY-MM-DD`.
pub fn today_in_quota_zone() -> String {
    Utc::now()
        .with_timezone(&quota_zone())
        .format("%Y-%m-%d")
        .to_string()
}

/// Current local hour and minute in the quota zone.
pub fn quota_zone_hour_minute() -> (u32, u32) {
    use chrono::Timelike;
    let now = Utc::now().with_timezone(&quota_zone());
    (now.hour(), now.minute())
}

fn now_ts() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Which of the three limits blocked a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    Rpm,
    Rpd,
    Tpm,
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitKind::Rpm => write!(f, "RPM"),
            LimitKind::Rpd => write!(f, "RPD"),
            LimitKind::Tpm => write!(f, "TPM"),
        }
    }
}

/// Current usage vs. limits for one (credential, model) pair.
#[derive(Debug, Clone, Serialize)]
pub struct UsageSnapshot {
    pub rpm_used: u32,
    pub rpm_limit: u32,
    pub rpd_used: u32,
    pub rpd_limit: u32,
    pub tpm_used: u64,
    pub tpm_limit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenEntry {
    ts: f64,
    count: u64,
}

fn parse_timestamps(raw: Option<&String>) -> Vec<f64> {
    raw.and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default()
}

fn parse_token_entries(raw: Option<&String>) -> Vec<TokenEntry> {
    raw.and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default()
}

fn limits_for(model: &str) -> (u32, u32, u64) {
    // Models outside the catalog have no quota allowance at all; their
    // zero limits block on the first check.
    catalog::model(model)
        .map(|m| (m.rpm, m.rpd, m.tpm))
        .unwrap_or((0, 0, 0))
}

/// Per-(credential, model) limit tracker backed by store hashes.
pub struct RateAccountant {
    store: SharedStore,
}

impl RateAccountant {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    fn record_key(handle: &str, model: &str) -> String {
        format!("{RATE_KEY_PREFIX}:{handle}:{model}")
    }

    // ── check ───────────────────────────────────────────────────────────────

    /// Would one more request with `estimated_tokens` fit? Returns the
    /// first exceeded limit, or `None` when the request may proceed.
    ///
    /// Checking never mutates the record; a concurrent check/record pair
    /// may overshoot by the number of in-flight requests, which the
    /// upstream's soft rate-limit edge absorbs.
    pub async fn check(
        &self,
        handle: &str,
        model: &str,
        estimated_tokens: u64,
    ) -> Result<Option<LimitKind>, StoreError> {
        let (rpm_limit, rpd_limit, tpm_limit) = limits_for(model);
        let raw = self
            .store
            .hash_get_all(&Self::record_key(handle, model))
            .await?;
        let window_start = now_ts() - WINDOW_SECS;

        let requests = parse_timestamps(raw.get("requests"));
        let recent = requests.iter().filter(|ts| **ts > window_start).count();
        if recent as u32 >= rpm_limit {
            return Ok(Some(LimitKind::Rpm));
        }

        // A stored date-stamp from another day means the counter belongs
        // to a finished quota day and reads as zero.
        let today = today_in_quota_zone();
        let mut rpd_count: u32 = raw
            .get("rpd_count")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        if raw.get("last_rpd_reset").map(String::as_str) != Some(today.as_str()) {
            rpd_count = 0;
        }
        if rpd_count >= rpd_limit {
            return Ok(Some(LimitKind::Rpd));
        }

        let token_entries = parse_token_entries(raw.get("tokens"));
        let recent_tokens: u64 = token_entries
            .iter()
            .filter(|e| e.ts > window_start)
            .map(|e| e.count)
            .sum();
        if recent_tokens + estimated_tokens > tpm_limit {
            return Ok(Some(LimitKind::Tpm));
        }

        Ok(None)
    }

    // ── record ──────────────────────────────────────────────────────────────

    /// Account for a completed request: append to both windows, bump the
    /// daily counter (resetting it on a date-stamp change), refresh the
    /// cached limit triple, and renew the record TTL, in one atomic
    /// batch.
    pub async fn record(
        &self,
        handle: &str,
        model: &str,
        tokens_used: u64,
    ) -> Result<(), StoreError> {
        let key = Self::record_key(handle, model);
        let raw = self.store.hash_get_all(&key).await?;
        let now = now_ts();
        let today = today_in_quota_zone();

        let mut requests = parse_timestamps(raw.get("requests"));
        requests.push(now);

        let mut token_entries = parse_token_entries(raw.get("tokens"));
        token_entries.push(TokenEntry {
            ts: now,
            count: tokens_used,
        });

        let mut rpd_count: u32 = raw
            .get("rpd_count")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        if raw.get("last_rpd_reset").map(String::as_str) != Some(today.as_str()) {
            rpd_count = 0;
        }
        rpd_count += 1;

        let (rpm_limit, rpd_limit, tpm_limit) = limits_for(model);
        let requests_json = serde_json::to_string(&requests)
            .map_err(|e| StoreError::Unavailable(format!("window encode: {e}")))?;
        let tokens_json = serde_json::to_string(&token_entries)
            .map_err(|e| StoreError::Unavailable(format!("window encode: {e}")))?;

        let field = |field: &str, value: String| BatchOp::HashSet {
            key: key.clone(),
            field: field.to_string(),
            value,
        };
        self.store
            .batch(vec![
                field("requests", requests_json),
                field("tokens", tokens_json),
                field("rpd_count", rpd_count.to_string()),
                field("last_rpd_reset", today),
                field("rpm_limit", rpm_limit.to_string()),
                field("rpd_limit", rpd_limit.to_string()),
                field("tpm_limit", tpm_limit.to_string()),
                BatchOp::Expire {
                    key: key.clone(),
                    seconds: RATE_TTL_SECS,
                },
            ])
            .await
    }

    // ── cleanup ─────────────────────────────────────────────────────────────

    /// Drop window entries older than 60 s. The daily counter is
    /// untouched.
    pub async fn cleanup(&self, handle: &str, model: &str) -> Result<(), StoreError> {
        let key = Self::record_key(handle, model);
        let raw = self.store.hash_get_all(&key).await?;
        if raw.is_empty() {
            return Ok(());
        }
        let cutoff = now_ts() - WINDOW_SECS;

        let requests: Vec<f64> = parse_timestamps(raw.get("requests"))
            .into_iter()
            .filter(|ts| *ts > cutoff)
            .collect();
        let token_entries: Vec<TokenEntry> = parse_token_entries(raw.get("tokens"))
            .into_iter()
            .filter(|e| e.ts > cutoff)
            .collect();

        let requests_json = serde_json::to_string(&requests)
            .map_err(|e| StoreError::Unavailable(format!("window encode: {e}")))?;
        let tokens_json = serde_json::to_string(&token_entries)
            .map_err(|e| StoreError::Unavailable(format!("window encode: {e}")))?;
        self.store
            .batch(vec![
                BatchOp::HashSet {
                    key: key.clone(),
                    field: "requests".into(),
                    value: requests_json,
                },
                BatchOp::HashSet {
                    key,
                    field: "tokens".into(),
                    value: tokens_json,
                },
            ])
            .await
    }

    // ── stats ───────────────────────────────────────────────────────────────

    /// Current usage vs. limits for a (credential, model) pair.
    pub async fn usage(&self, handle: &str, model: &str) -> Result<UsageSnapshot, StoreError> {
        let raw = self
            .store
            .hash_get_all(&Self::record_key(handle, model))
            .await?;
        let (rpm_limit, rpd_limit, tpm_limit) = limits_for(model);
        let window_start = now_ts() - WINDOW_SECS;

        let rpm_used = parse_timestamps(raw.get("requests"))
            .iter()
            .filter(|ts| **ts > window_start)
            .count() as u32;
        let tpm_used: u64 = parse_token_entries(raw.get("tokens"))
            .iter()
            .filter(|e| e.ts > window_start)
            .map(|e| e.count)
            .sum();

        let today = today_in_quota_zone();
        let rpd_used = if raw.get("last_rpd_reset").map(String::as_str) == Some(today.as_str()) {
            raw.get("rpd_count")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0)
        } else {
            0
        };

        Ok(UsageSnapshot {
            rpm_used,
            rpm_limit,
            rpd_used,
            rpd_limit,
            tpm_used,
            tpm_limit,
        })
    }

    /// Zero the daily counter of every rate record. Called at the daily
    /// boundary. Returns the number of records touched.
    pub async fn reset_daily_all(&self) -> Result<usize, StoreError> {
        let keys = self
            .store
            .scan_prefix(&format!("{RATE_KEY_PREFIX}:"))
            .await?;
        let count = keys.len();
        for key in keys {
            self.store.hash_set(&key, "rpd_count", "0").await?;
        }
        Ok(count)
    }
}
