use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::info;

use crate::app_state::AppState;
use crate::errors::EngineError;
use crate::history;
use crate::metrics::HealthSnapshot;
use crate::models::{
    BreakerStateTag, ConfigPatch, FetchStatus, HistoryEntry, Monitor, MonitorConfig, UserRecord,
    MIN_CHECK_INTERVAL_SECS,
};
use crate::urlnorm::normalize_url;

pub const PAGE_SIZE: usize = 5;

/// Snooze windows offered by the chat layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnoozeDuration {
    OneHour,
    SixHours,
    TwentyFourHours,
}

impl SnoozeDuration {
    fn as_duration(self) -> Duration {
        match self {
            SnoozeDuration::OneHour => Duration::hours(1),
            SnoozeDuration::SixHours => Duration::hours(6),
            SnoozeDuration::TwentyFourHours => Duration::hours(24),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

/// One row of a monitor listing.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorSummary {
    pub url: String,
    pub last_status: FetchStatus,
    pub last_check_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub circuit_breaker_state: BreakerStateTag,
    pub snoozed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorPage {
    pub items: Vec<MonitorSummary>,
    pub page: usize,
    pub total_pages: usize,
    pub total: usize,
}

/// Inbound command surface. Every mutation goes through the store's write
/// queue; invalid input is rejected here and never touches state.
#[derive(Clone)]
pub struct Commander {
    state: AppState,
}

impl Commander {
    pub(crate) fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Register a URL for the user. Bare hostnames get an `https://`
    /// prefix. Returns `(ok, reason)` for direct chat rendering.
    pub async fn add_monitor(&self, chat_id: &str, url: &str) -> (bool, String) {
        let url = ensure_scheme(url.trim());
        let normalized = match normalize_url(&url) {
            Ok(normalized) => normalized,
            Err(err) => return (false, err.to_string()),
        };

        if self
            .state
            .store()
            .monitor(chat_id, &normalized)
            .is_some()
        {
            return (false, format!("{url} is already being watched"));
        }

        let chat_id = chat_id.to_string();
        let monitor = Monitor::new(url.clone(), normalized, Utc::now());
        let result = self
            .state
            .store()
            .submit_write(move |doc| {
                let user = doc.users.entry(chat_id).or_default();
                if user
                    .monitor(&monitor.normalized_url)
                    .is_none()
                {
                    user.monitors.push(monitor);
                }
            })
            .await;
        match result {
            Ok(()) => {
                info!(target: "commands", %url, "monitor added");
                (true, format!("now watching {url}"))
            }
            Err(err) => (false, err.to_string()),
        }
    }

    pub fn list_monitors(&self, chat_id: &str, page: usize) -> MonitorPage {
        let now = Utc::now();
        let user = self.state.store().user(chat_id).unwrap_or_default();
        let total = user.monitors.len();
        let total_pages = total.div_ceil(PAGE_SIZE).max(1);
        let page = page.min(total_pages - 1);
        let items = user
            .monitors
            .iter()
            .skip(page * PAGE_SIZE)
            .take(PAGE_SIZE)
            .map(|monitor| MonitorSummary {
                url: monitor.url.clone(),
                last_status: monitor.metadata.last_status,
                last_check_at: monitor.metadata.last_check_at,
                consecutive_failures: monitor.metadata.consecutive_failures,
                circuit_breaker_state: monitor.metadata.circuit_breaker_state,
                snoozed: monitor
                    .metadata
                    .snooze_until
                    .is_some_and(|until| until > now),
            })
            .collect();
        MonitorPage {
            items,
            page,
            total_pages,
            total,
        }
    }

    pub async fn remove_monitor(&self, chat_id: &str, url: &str) -> Result<(), EngineError> {
        let normalized = self.resolve(chat_id, url)?;
        let chat_id = chat_id.to_string();
        self.state
            .store()
            .submit_write(move |doc| {
                if let Some(user) = doc.users.get_mut(&chat_id) {
                    user.monitors.retain(|m| m.normalized_url != normalized);
                }
            })
            .await
    }

    /// Chat-button alias for removing a monitor from an alert.
    pub async fn stop_watching(&self, chat_id: &str, url: &str) -> Result<(), EngineError> {
        self.remove_monitor(chat_id, url).await
    }

    pub async fn snooze(
        &self,
        chat_id: &str,
        url: &str,
        duration: SnoozeDuration,
    ) -> Result<(), EngineError> {
        let normalized = self.resolve(chat_id, url)?;
        let until = Utc::now() + duration.as_duration();
        let chat_id = chat_id.to_string();
        self.state
            .store()
            .submit_write(move |doc| {
                if let Some(monitor) = doc
                    .users
                    .get_mut(&chat_id)
                    .and_then(|user| user.monitor_mut(&normalized))
                {
                    monitor.metadata.snooze_until = Some(until);
                }
            })
            .await
    }

    /// Effective config: the monitor override when `url` is given and one
    /// exists, the user defaults otherwise.
    pub fn get_config(
        &self,
        chat_id: &str,
        url: Option<&str>,
    ) -> Result<MonitorConfig, EngineError> {
        let user = self.state.store().user(chat_id).unwrap_or_default();
        match url {
            None => Ok(user.user_config.clone()),
            Some(url) => {
                let normalized = self.resolve(chat_id, url)?;
                let monitor = user
                    .monitor(&normalized)
                    .ok_or_else(|| EngineError::ConfigInvalid(format!("not watching {url}")))?;
                Ok(user.effective_config(monitor))
            }
        }
    }

    /// Apply a config patch to the user defaults or one monitor's override.
    /// Threshold clamps into (0, 1]; the interval clamps up to 30 s and
    /// absurd values are rejected outright.
    pub async fn set_config(
        &self,
        chat_id: &str,
        url: Option<&str>,
        patch: ConfigPatch,
    ) -> Result<MonitorConfig, EngineError> {
        let base = self.get_config(chat_id, url)?;
        let next = apply_patch(base, patch)?;

        let chat_id_owned = chat_id.to_string();
        let applied = next.clone();
        match url {
            None => {
                self.state
                    .store()
                    .submit_write(move |doc| {
                        doc.users.entry(chat_id_owned).or_default().user_config = applied;
                    })
                    .await?;
            }
            Some(url) => {
                let normalized = self.resolve(chat_id, url)?;
                self.state
                    .store()
                    .submit_write(move |doc| {
                        if let Some(monitor) = doc
                            .users
                            .get_mut(&chat_id_owned)
                            .and_then(|user| user.monitor_mut(&normalized))
                        {
                            monitor.config = Some(applied);
                        }
                    })
                    .await?;
            }
        }
        Ok(next)
    }

    pub fn get_history(&self, chat_id: &str, url: &str) -> Result<Vec<HistoryEntry>, EngineError> {
        let normalized = self.resolve(chat_id, url)?;
        self.state
            .store()
            .monitor(chat_id, &normalized)
            .map(|monitor| monitor.history)
            .ok_or_else(|| EngineError::ConfigInvalid(format!("not watching {url}")))
    }

    /// Serialize the user's full record (JSON) or change history (CSV).
    pub fn export(&self, chat_id: &str, format: ExportFormat) -> Result<String, EngineError> {
        let user: UserRecord = self.state.store().user(chat_id).unwrap_or_default();
        match format {
            ExportFormat::Json => history::export_json(&user),
            ExportFormat::Csv => history::export_csv(&user),
        }
    }

    pub fn health(&self) -> HealthSnapshot {
        self.state.metrics().snapshot(
            self.state.governor().queue_depth(),
            self.state.store().monitors_total(),
            self.state.store().available_disk_mb(),
        )
    }

    fn resolve(&self, _chat_id: &str, url: &str) -> Result<String, EngineError> {
        normalize_url(&ensure_scheme(url.trim()))
    }
}

fn ensure_scheme(url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("https://{url}")
    }
}

fn apply_patch(base: MonitorConfig, patch: ConfigPatch) -> Result<MonitorConfig, EngineError> {
    let mut next = base;
    if let Some(threshold) = patch.similarity_threshold {
        if threshold.is_nan() {
            return Err(EngineError::ConfigInvalid(
                "similarity threshold must be a number".into(),
            ));
        }
        next.similarity_threshold = threshold;
    }
    if let Some(interval) = patch.check_interval_seconds {
        if interval > i64::from(u32::MAX) {
            return Err(EngineError::ConfigInvalid(format!(
                "check interval {interval}s is out of range"
            )));
        }
        next.check_interval_seconds =
            u32::try_from(interval.max(i64::from(MIN_CHECK_INTERVAL_SECS)))
                .unwrap_or(MIN_CHECK_INTERVAL_SECS);
    }
    if let Some(include_diff) = patch.include_diff {
        next.include_diff = include_diff;
    }
    if let Some(selector) = patch.custom_selector {
        next.custom_selector = if selector.trim().is_empty() {
            None
        } else {
            Some(selector)
        };
    }
    Ok(next.clamped())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::test_support::RecordingNotifier;
    use crate::test_support::harness_with;
    use std::sync::Arc;

    async fn commander(dir: &std::path::Path) -> Commander {
        let harness = harness_with(dir, Arc::new(RecordingNotifier::default()), |_| {}).await;
        Commander::new(harness.state)
    }

    #[tokio::test]
    async fn add_list_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let commander = commander(dir.path()).await;

        let (ok, reason) = commander.add_monitor("7", "example.com/page").await;
        assert!(ok, "{reason}");

        let (ok, reason) = commander
            .add_monitor("7", "https://example.com/page?utm_source=x")
            .await;
        assert!(!ok, "duplicate should be refused, got: {reason}");

        let page = commander.list_monitors("7", 0);
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].url, "https://example.com/page");
        assert_eq!(page.items[0].last_status, FetchStatus::Pending);

        commander
            .remove_monitor("7", "https://example.com/page")
            .await
            .unwrap();
        assert_eq!(commander.list_monitors("7", 0).total, 0);
    }

    #[tokio::test]
    async fn listing_pages_by_five() {
        let dir = tempfile::tempdir().unwrap();
        let commander = commander(dir.path()).await;
        for i in 0..7 {
            let (ok, _) = commander
                .add_monitor("7", &format!("https://site{i}.example/"))
                .await;
            assert!(ok);
        }
        let first = commander.list_monitors("7", 0);
        assert_eq!(first.items.len(), PAGE_SIZE);
        assert_eq!(first.total_pages, 2);
        let second = commander.list_monitors("7", 1);
        assert_eq!(second.items.len(), 2);
        // Out-of-range pages clamp instead of panicking.
        assert_eq!(commander.list_monitors("7", 99).page, 1);
    }

    #[tokio::test]
    async fn invalid_url_is_rejected_with_reason() {
        let dir = tempfile::tempdir().unwrap();
        let commander = commander(dir.path()).await;
        let (ok, reason) = commander.add_monitor("7", "ht tp://???").await;
        assert!(!ok);
        assert!(!reason.is_empty());
        assert_eq!(commander.list_monitors("7", 0).total, 0);
    }

    #[tokio::test]
    async fn snooze_sets_a_future_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let commander = commander(dir.path()).await;
        commander.add_monitor("7", "https://a.example/x").await;
        commander
            .snooze("7", "https://a.example/x", SnoozeDuration::SixHours)
            .await
            .unwrap();
        let page = commander.list_monitors("7", 0);
        assert!(page.items[0].snoozed);
    }

    #[tokio::test]
    async fn config_patch_clamps_and_rejects() {
        let dir = tempfile::tempdir().unwrap();
        let commander = commander(dir.path()).await;

        let applied = commander
            .set_config(
                "7",
                None,
                ConfigPatch {
                    similarity_threshold: Some(-2.0),
                    check_interval_seconds: Some(5),
                    ..ConfigPatch::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(applied.similarity_threshold, 0.01);
        assert_eq!(applied.check_interval_seconds, 30);

        let applied = commander
            .set_config(
                "7",
                None,
                ConfigPatch {
                    similarity_threshold: Some(7.5),
                    ..ConfigPatch::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(applied.similarity_threshold, 1.0);

        let err = commander
            .set_config(
                "7",
                None,
                ConfigPatch {
                    check_interval_seconds: Some(i64::from(u32::MAX) + 1),
                    ..ConfigPatch::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ConfigInvalid(_)));

        // Rejected patches never mutate state.
        assert_eq!(
            commander.get_config("7", None).unwrap().similarity_threshold,
            1.0
        );
    }

    #[tokio::test]
    async fn monitor_override_shadows_user_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let commander = commander(dir.path()).await;
        commander.add_monitor("7", "https://a.example/x").await;

        commander
            .set_config(
                "7",
                Some("https://a.example/x"),
                ConfigPatch {
                    check_interval_seconds: Some(300),
                    ..ConfigPatch::default()
                },
            )
            .await
            .unwrap();

        let monitor_cfg = commander
            .get_config("7", Some("https://a.example/x"))
            .unwrap();
        assert_eq!(monitor_cfg.check_interval_seconds, 300);
        let user_cfg = commander.get_config("7", None).unwrap();
        assert_eq!(user_cfg.check_interval_seconds, 60);
    }

    #[tokio::test]
    async fn export_json_round_trips_through_import() {
        let dir = tempfile::tempdir().unwrap();
        let commander = commander(dir.path()).await;
        commander.add_monitor("7", "https://a.example/x").await;

        let blob = commander.export("7", ExportFormat::Json).unwrap();
        let imported: UserRecord = serde_json::from_str(&blob).unwrap();
        let live = commander.state.store().user("7").unwrap();
        assert_eq!(imported, live);

        let csv = commander.export("7", ExportFormat::Csv).unwrap();
        assert!(csv.starts_with("url,timestamp,change_type"));
    }

    #[tokio::test]
    async fn health_reports_queue_and_monitor_counts() {
        let dir = tempfile::tempdir().unwrap();
        let commander = commander(dir.path()).await;
        commander.add_monitor("7", "https://a.example/x").await;
        let health = commander.health();
        assert_eq!(health.monitors, 1);
        assert!(health.performance.success_rate_24h_percent >= 0.0);
    }

    #[tokio::test]
    async fn unknown_monitor_yields_config_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let commander = commander(dir.path()).await;
        assert!(matches!(
            commander.get_history("7", "https://nope.example/"),
            Err(EngineError::ConfigInvalid(_))
        ));
    }
}
