//! Background maintenance loops.
//!
//! Four long-lived tasks keep the credential pool healthy without
//! touching the request path:
//!
//! 1. recovery - probe disabled credentials and reactivate working ones
//! 2. model re-detection - refresh each credential's advertised model set
//!    from the upstream model-listing endpoint (no generation quota cost)
//! 3. cleanup - prune stale sliding-window entries and expired log rows
//! 4. daily reset - zero RPD counters just past midnight in the quota zone
//!
//! Every iteration is independently guarded: a failing tick logs and the
//! loop keeps running. A failure in one loop never affects the others.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::catalog;
use crate::credentials::CredentialRegistry;
use crate::gemini::{SharedUpstream, Upstream};
use crate::ratelimit::{self, RateAccountant};
use crate::stats::StatsLog;
use crate::store::StoreError;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub recovery_interval: Duration,
    pub redetect_interval: Duration,
    pub cleanup_interval: Duration,
    pub daily_poll_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            recovery_interval: Duration::from_secs(300),
            redetect_interval: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
            daily_poll_interval: Duration::from_secs(60),
        }
    }
}

pub struct BackgroundMonitor {
    registry: Arc<CredentialRegistry>,
    accountant: Arc<RateAccountant>,
    stats: Arc<StatsLog>,
    upstream: SharedUpstream,
    config: MonitorConfig,
}

impl BackgroundMonitor {
    pub fn new(
        registry: Arc<CredentialRegistry>,
        accountant: Arc<RateAccountant>,
        stats: Arc<StatsLog>,
        upstream: SharedUpstream,
        config: MonitorConfig,
    ) -> Self {
        Self {
            registry,
            accountant,
            stats,
            upstream,
            config,
        }
    }

    /// Launch all four loops. Abort the returned handles at shutdown.
    pub fn spawn(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        tracing::info!(
            recovery_secs = self.config.recovery_interval.as_secs(),
            redetect_secs = self.config.redetect_interval.as_secs(),
            cleanup_secs = self.config.cleanup_interval.as_secs(),
            "background monitor started"
        );

        let recovery = {
            let monitor = self.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(monitor.config.recovery_interval).await;
                    if let Err(err) = monitor.recovery_tick().await {
                        tracing::error!(error = %err, "credential recovery iteration failed");
                    }
                }
            })
        };

        let redetect = {
            let monitor = self.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(monitor.config.redetect_interval).await;
                    if let Err(err) = monitor.redetect_tick().await {
                        tracing::error!(error = %err, "model re-detection iteration failed");
                    }
                }
            })
        };

        let cleanup = {
            let monitor = self.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(monitor.config.cleanup_interval).await;
                    if let Err(err) = monitor.cleanup_tick().await {
                        tracing::error!(error = %err, "window cleanup iteration failed");
                    }
                }
            })
        };

        let daily_reset = {
            let monitor = self.clone();
            tokio::spawn(async move {
                let mut last_reset_date = String::new();
                loop {
                    tokio::time::sleep(monitor.config.daily_poll_interval).await;
                    match monitor.daily_reset_tick(&last_reset_date).await {
                        Ok(Some(date)) => last_reset_date = date,
                        Ok(None) => {}
                        Err(err) => {
                            tracing::error!(error = %err, "daily reset iteration failed");
                        }
                    }
                }
            })
        };

        vec![recovery, redetect, cleanup, daily_reset]
    }

    /// Probe disabled credentials against any model they advertise and
    /// reactivate those that answer.
    async fn recovery_tick(&self) -> Result<(), StoreError> {
        let all = self.registry.list_all().await?;
        let disabled: Vec<_> = all.into_iter().filter(|(_, r)| !r.active).collect();
        if disabled.is_empty() {
            return Ok(());
        }
        tracing::info!(count = disabled.len(), "probing disabled credentials for recovery");

        for (handle, record) in disabled {
            let Some(api_key) = self.registry.raw_key(&handle).await? else {
                continue;
            };
            let candidates: Vec<String> = if record.models.is_empty() {
                catalog::TEXT_PRIORITY.iter().take(2).map(|m| m.to_string()).collect()
            } else {
                record.models.clone()
            };
            for model in candidates {
                if self.upstream.probe(&api_key, &model).await {
                    self.registry.reactivate(&handle).await?;
                    tracing::info!(
                        handle = %&handle[..handle.len().min(8)],
                        label = %record.label,
                        "credential reactivated"
                    );
                    break;
                }
            }
        }
        Ok(())
    }

    /// Refresh the advertised model set of every active credential from
    /// the upstream model listing. Replaces, never merges: the set must
    /// track what the key can reach right now.
    async fn redetect_tick(&self) -> Result<(), StoreError> {
        let active = self.registry.list_active().await?;
        if active.is_empty() {
            return Ok(());
        }

        for (handle, record) in active {
            let Some(api_key) = self.registry.raw_key(&handle).await? else {
                continue;
            };
            let detected = self.upstream.detect_models(&api_key).await;
            if detected.is_empty() {
                // A failed detection round says nothing about the key;
                // keep the current set.
                continue;
            }
            if self.registry.replace_models(&handle, detected).await? {
                tracing::info!(
                    handle = %&handle[..handle.len().min(8)],
                    label = %record.label,
                    "advertised models updated"
                );
            }
        }
        Ok(())
    }

    /// Prune stale window entries for every active (credential, model)
    /// pair, then drop expired request-log rows.
    async fn cleanup_tick(&self) -> Result<(), StoreError> {
        let active = self.registry.list_active().await?;
        for (handle, record) in active {
            for model in &record.models {
                self.accountant.cleanup(&handle, model).await?;
            }
        }
        let removed = self.stats.prune_old().await?;
        if removed > 0 {
            tracing::debug!(removed, "pruned expired request-log entries");
        }
        Ok(())
    }

    /// Fire `reset_daily_all` once, within the first two minutes after
    /// midnight in the quota zone. Returns the new date when a reset
    /// happened.
    async fn daily_reset_tick(&self, last_reset_date: &str) -> Result<Option<String>, StoreError> {
        let today = ratelimit::today_in_quota_zone();
        let (hour, minute) = ratelimit::quota_zone_hour_minute();
        if today != last_reset_date && hour == 0 && minute < 2 {
            let count = self.accountant.reset_daily_all().await?;
            tracing::info!(count, date = %today, "daily request counters reset");
            return Ok(Some(today));
        }
        Ok(None)
    }
}
