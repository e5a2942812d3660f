use chrono::{DateTime, Duration, Utc};
use tracing::warn;

use crate::detector::{compress_content, decompress_content};
use crate::errors::EngineError;
use crate::models::{HistoryEntry, Monitor, UserRecord, ARCHIVE_LIMIT, HISTORY_RETENTION_DAYS};

/// Append a change record and immediately enforce retention, so no write
/// ever leaves entries older than the window behind.
pub fn append_entry(monitor: &mut Monitor, entry: HistoryEntry) {
    monitor.history.push(entry);
    prune(monitor, Utc::now());
}

/// Move entries older than the retention window into the compressed
/// archive ring. Expired entries leave the live log only once their
/// archive batch is written; on archival failure they stay live so no
/// record is ever lost.
pub fn prune(monitor: &mut Monitor, now: DateTime<Utc>) {
    let cutoff = now - Duration::days(HISTORY_RETENTION_DAYS);
    let expired: Vec<_> = monitor
        .history
        .iter()
        .filter(|entry| entry.timestamp < cutoff)
        .cloned()
        .collect();
    if expired.is_empty() {
        return;
    }
    match archive_batch(&expired) {
        Ok(blob) => {
            monitor.history.retain(|entry| entry.timestamp >= cutoff);
            monitor.history_archive.push(blob);
            while monitor.history_archive.len() > ARCHIVE_LIMIT {
                monitor.history_archive.remove(0);
            }
        }
        Err(err) => {
            warn!(
                target: "history",
                url = %monitor.url,
                expired = expired.len(),
                %err,
                "archival failed, keeping expired entries in the live log"
            );
        }
    }
}

fn archive_batch(entries: &[HistoryEntry]) -> Result<String, EngineError> {
    let json = serde_json::to_string(entries)
        .map_err(|err| EngineError::Storage(format!("encoding archive batch: {err}")))?;
    compress_content(&json)
}

/// Decode one archived batch back into entries, for export tooling.
pub fn read_archive_batch(blob: &str) -> Result<Vec<HistoryEntry>, EngineError> {
    let json = decompress_content(blob)?;
    serde_json::from_str(&json)
        .map_err(|err| EngineError::Storage(format!("decoding archive batch: {err}")))
}

/// Full user record as a pretty JSON blob; re-importing the blob yields an
/// equivalent record.
pub fn export_json(user: &UserRecord) -> Result<String, EngineError> {
    serde_json::to_string_pretty(user)
        .map_err(|err| EngineError::Storage(format!("encoding export: {err}")))
}

/// Change history across the user's monitors as CSV.
pub fn export_csv(user: &UserRecord) -> Result<String, EngineError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record([
            "url",
            "timestamp",
            "change_type",
            "similarity_final",
            "diff_summary",
        ])
        .map_err(|err| EngineError::Storage(format!("writing csv header: {err}")))?;
    for monitor in &user.monitors {
        for entry in &monitor.history {
            writer
                .write_record([
                    monitor.url.as_str(),
                    &entry.timestamp.to_rfc3339(),
                    entry.change_type.as_str(),
                    &format!("{:.4}", entry.similarity_final),
                    entry.diff_summary.as_str(),
                ])
                .map_err(|err| EngineError::Storage(format!("writing csv row: {err}")))?;
        }
    }
    let bytes = writer
        .into_inner()
        .map_err(|err| EngineError::Storage(format!("flushing csv: {err}")))?;
    String::from_utf8(bytes).map_err(|err| EngineError::Storage(format!("csv not utf-8: {err}")))
}
