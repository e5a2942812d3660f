use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vigil_page::{ChangeType, SimilarityMetrics, WeightedFingerprint};

/// Current on-disk schema tag.
pub const SCHEMA_VERSION: &str = "2.0";
pub const HISTORY_RETENTION_DAYS: i64 = 30;
pub const SNAPSHOT_LIMIT: usize = 3;
pub const ARCHIVE_LIMIT: usize = 12;

pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.85;
pub const DEFAULT_CHECK_INTERVAL_SECS: u32 = 60;
pub const MIN_CHECK_INTERVAL_SECS: u32 = 30;
pub const MIN_SIMILARITY_THRESHOLD: f64 = 0.01;

/// Per-user defaults, optionally overridden whole per monitor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitorConfig {
    #[serde(default = "default_threshold")]
    pub similarity_threshold: f64,
    #[serde(default = "default_interval")]
    pub check_interval_seconds: u32,
    #[serde(default = "default_include_diff")]
    pub include_diff: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_selector: Option<String>,
}

fn default_threshold() -> f64 {
    DEFAULT_SIMILARITY_THRESHOLD
}

fn default_interval() -> u32 {
    DEFAULT_CHECK_INTERVAL_SECS
}

fn default_include_diff() -> bool {
    true
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            check_interval_seconds: DEFAULT_CHECK_INTERVAL_SECS,
            include_diff: true,
            custom_selector: None,
        }
    }
}

impl MonitorConfig {
    /// Clamp out-of-range values into the legal envelope: threshold into
    /// (0, 1] with a 0.01 floor, interval to at least 30 s.
    pub fn clamped(mut self) -> Self {
        if !self.similarity_threshold.is_finite() || self.similarity_threshold <= 0.0 {
            self.similarity_threshold = MIN_SIMILARITY_THRESHOLD;
        } else if self.similarity_threshold > 1.0 {
            self.similarity_threshold = 1.0;
        }
        if self.check_interval_seconds < MIN_CHECK_INTERVAL_SECS {
            self.check_interval_seconds = MIN_CHECK_INTERVAL_SECS;
        }
        self
    }
}

/// Partial update applied through `set_config`. Interval is widened to i64
/// so absurd inputs can be rejected instead of silently wrapping.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigPatch {
    pub similarity_threshold: Option<f64>,
    pub check_interval_seconds: Option<i64>,
    pub include_diff: Option<bool>,
    pub custom_selector: Option<String>,
}

/// Outcome of the most recent check attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    #[default]
    Pending,
    Ok,
    HttpError,
    NetworkError,
    Timeout,
    BlockPage,
    CircuitOpen,
    PolicyBlocked,
}

/// Persisted circuit-breaker position for a monitor's host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerStateTag {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitorMetadata {
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_check_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub check_count: u64,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub circuit_breaker_state: BreakerStateTag,
    #[serde(default)]
    pub snooze_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_status: FetchStatus,
}

impl MonitorMetadata {
    pub fn new(created_at: DateTime<Utc>) -> Self {
        Self {
            created_at,
            last_check_at: None,
            check_count: 0,
            consecutive_failures: 0,
            circuit_breaker_state: BreakerStateTag::Closed,
            snooze_until: None,
            last_status: FetchStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub change_type: ChangeType,
    pub similarity_final: f64,
    pub diff_summary: String,
}

/// Compressed before/after pair kept so a change decision can be recomputed
/// later. Both sides are zlib-compressed then base64-encoded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForensicSnapshot {
    pub timestamp: DateTime<Utc>,
    pub old_content_compressed: String,
    pub new_content_compressed: String,
    pub change_type: ChangeType,
    pub similarity_metrics: SimilarityMetrics,
    pub diff_summary: String,
    pub diff_truncated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Monitor {
    pub url: String,
    pub normalized_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<MonitorConfig>,
    #[serde(default)]
    pub fingerprint: Option<WeightedFingerprint>,
    pub metadata: MonitorMetadata,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub forensic_snapshots: Vec<ForensicSnapshot>,
    /// Compressed batches of history entries evicted by the 30-day prune.
    #[serde(default)]
    pub history_archive: Vec<String>,
}

impl Monitor {
    pub fn new(url: String, normalized_url: String, created_at: DateTime<Utc>) -> Self {
        Self {
            url,
            normalized_url,
            config: None,
            fingerprint: None,
            metadata: MonitorMetadata::new(created_at),
            history: Vec::new(),
            forensic_snapshots: Vec::new(),
            history_archive: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct UserRecord {
    #[serde(default)]
    pub user_config: MonitorConfig,
    #[serde(default)]
    pub monitors: Vec<Monitor>,
}

impl UserRecord {
    pub fn monitor(&self, normalized_url: &str) -> Option<&Monitor> {
        self.monitors
            .iter()
            .find(|m| m.normalized_url == normalized_url)
    }

    pub fn monitor_mut(&mut self, normalized_url: &str) -> Option<&mut Monitor> {
        self.monitors
            .iter_mut()
            .find(|m| m.normalized_url == normalized_url)
    }

    /// Resolution order: monitor override → user defaults.
    pub fn effective_config(&self, monitor: &Monitor) -> MonitorConfig {
        monitor
            .config
            .clone()
            .unwrap_or_else(|| self.user_config.clone())
    }
}

/// The whole persisted document: a schema tag plus one key per chat id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub schema_version: String,
    #[serde(flatten)]
    pub users: BTreeMap<String, UserRecord>,
}

impl Default for Document {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            users: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_clamps_threshold_and_interval() {
        let cfg = MonitorConfig {
            similarity_threshold: -0.4,
            check_interval_seconds: 5,
            include_diff: true,
            custom_selector: None,
        }
        .clamped();
        assert_eq!(cfg.similarity_threshold, MIN_SIMILARITY_THRESHOLD);
        assert_eq!(cfg.check_interval_seconds, MIN_CHECK_INTERVAL_SECS);

        let cfg = MonitorConfig {
            similarity_threshold: 3.2,
            ..MonitorConfig::default()
        }
        .clamped();
        assert_eq!(cfg.similarity_threshold, 1.0);
    }

    #[test]
    fn document_flattens_users_at_top_level() {
        let mut doc = Document::default();
        doc.users.insert("12345".into(), UserRecord::default());
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["schema_version"], SCHEMA_VERSION);
        assert!(value.get("12345").is_some());
        let back: Document = serde_json::from_value(value).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn timestamps_serialize_with_z_suffix() {
        let meta = MonitorMetadata::new(Utc::now());
        let value = serde_json::to_value(&meta).unwrap();
        let stamp = value["created_at"].as_str().unwrap();
        assert!(stamp.ends_with('Z'), "got {stamp}");
    }

    #[test]
    fn effective_config_prefers_monitor_override() {
        let mut user = UserRecord::default();
        let mut monitor = Monitor::new("https://a".into(), "https://a/".into(), Utc::now());
        assert_eq!(
            user.effective_config(&monitor).check_interval_seconds,
            DEFAULT_CHECK_INTERVAL_SECS
        );
        monitor.config = Some(MonitorConfig {
            check_interval_seconds: 300,
            ..MonitorConfig::default()
        });
        user.user_config.check_interval_seconds = 120;
        assert_eq!(user.effective_config(&monitor).check_interval_seconds, 300);
    }
}
