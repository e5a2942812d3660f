use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::metrics::Metrics;
use crate::models::{BreakerStateTag, Document, Monitor, UserRecord, SCHEMA_VERSION};
use crate::tasks::TaskHandle;
use crate::urlnorm;

const BACKUP_KEEP: usize = 5;
const WRITE_QUEUE_DEPTH: usize = 256;

pub type Mutator = Box<dyn FnOnce(&mut Document) + Send + 'static>;

struct WriteOp {
    mutate: Mutator,
    ack: oneshot::Sender<Result<(), EngineError>>,
}

/// Durable single-writer state store. All mutations flow through a FIFO
/// queue into one writer task; readers clone the in-memory document and
/// never block a write.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    db_path: PathBuf,
    state_dir: PathBuf,
    min_free_mb: u64,
    state: RwLock<Document>,
    disk_version: Mutex<String>,
    tx: mpsc::Sender<WriteOp>,
    metrics: Arc<Metrics>,
}

/// Due-check view of one monitor, small enough to scan every cycle without
/// cloning fingerprints or history.
#[derive(Debug, Clone)]
pub struct JobMeta {
    pub chat_id: String,
    pub url: String,
    pub normalized_url: String,
    pub interval_secs: u32,
    pub last_check_at: Option<DateTime<Utc>>,
    pub snooze_until: Option<DateTime<Utc>>,
    pub breaker_state: BreakerStateTag,
}

impl Store {
    /// Load (migrating if needed), persist the migrated form, and start the
    /// writer task. Fatal errors here abort startup.
    pub async fn open(
        config: &EngineConfig,
        metrics: Arc<Metrics>,
    ) -> Result<(Store, TaskHandle), EngineError> {
        tokio::fs::create_dir_all(&config.state_dir)
            .await
            .map_err(|err| EngineError::Storage(format!("creating state dir: {err}")))?;
        check_free_space(&config.state_dir, config.min_free_disk_mb)?;

        let (document, migrated, existed) = load_document(&config.db_path).await?;
        if migrated || !existed {
            let backup = if existed {
                Some(create_backup(&config.db_path).await?)
            } else {
                None
            };
            let mut value = serde_json::to_value(&document)
                .map_err(|err| EngineError::Storage(format!("serializing document: {err}")))?;
            normalize_timestamps(&mut value);
            if let Err(err) = write_atomic(&config.db_path, &value).await {
                if let Some(backup) = backup {
                    let _ = tokio::fs::copy(&backup, &config.db_path).await;
                    return Err(EngineError::MigrationFailed(format!(
                        "persisting migrated document: {err}"
                    )));
                }
                return Err(err);
            }
        }

        let (tx, rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let inner = Arc::new(StoreInner {
            db_path: config.db_path.clone(),
            state_dir: config.state_dir.clone(),
            min_free_mb: config.min_free_disk_mb,
            state: RwLock::new(document),
            disk_version: Mutex::new(SCHEMA_VERSION.to_string()),
            tx,
            metrics,
        });
        let worker = Arc::clone(&inner);
        let handle = TaskHandle::new("store.writer", tokio::spawn(writer_loop(worker, rx)));
        Ok((Store { inner }, handle))
    }

    /// Enqueue a mutation; resolves once the new document is durably on
    /// disk. Mutations execute strictly in submission order.
    pub async fn submit_write<F>(&self, mutate: F) -> Result<(), EngineError>
    where
        F: FnOnce(&mut Document) + Send + 'static,
    {
        let (ack, done) = oneshot::channel();
        let op = WriteOp {
            mutate: Box::new(mutate),
            ack,
        };
        self.inner
            .tx
            .send(op)
            .await
            .map_err(|_| EngineError::Storage("store writer stopped".into()))?;
        done.await
            .map_err(|_| EngineError::Storage("store writer dropped the write".into()))?
    }

    /// Read-only deep copy of the current state.
    pub fn snapshot(&self) -> Document {
        self.inner.state.read().expect("store lock poisoned").clone()
    }

    pub fn user(&self, chat_id: &str) -> Option<UserRecord> {
        self.inner
            .state
            .read()
            .expect("store lock poisoned")
            .users
            .get(chat_id)
            .cloned()
    }

    pub fn monitor(&self, chat_id: &str, normalized_url: &str) -> Option<Monitor> {
        self.inner
            .state
            .read()
            .expect("store lock poisoned")
            .users
            .get(chat_id)
            .and_then(|user| user.monitor(normalized_url))
            .cloned()
    }

    pub fn monitors_total(&self) -> u64 {
        self.inner
            .state
            .read()
            .expect("store lock poisoned")
            .users
            .values()
            .map(|u| u.monitors.len() as u64)
            .sum()
    }

    /// Lightweight scheduling view across every monitor.
    pub fn job_view(&self) -> Vec<JobMeta> {
        let state = self.inner.state.read().expect("store lock poisoned");
        let mut jobs = Vec::new();
        for (chat_id, user) in &state.users {
            for monitor in &user.monitors {
                jobs.push(JobMeta {
                    chat_id: chat_id.clone(),
                    url: monitor.url.clone(),
                    normalized_url: monitor.normalized_url.clone(),
                    interval_secs: user.effective_config(monitor).check_interval_seconds,
                    last_check_at: monitor.metadata.last_check_at,
                    snooze_until: monitor.metadata.snooze_until,
                    breaker_state: monitor.metadata.circuit_breaker_state,
                });
            }
        }
        jobs
    }

    /// Owners of monitors on the given host, for cooldown fan-out.
    pub fn watchers_of_host(&self, host: &str) -> Vec<(String, String)> {
        let state = self.inner.state.read().expect("store lock poisoned");
        let mut out = Vec::new();
        for (chat_id, user) in &state.users {
            for monitor in &user.monitors {
                if urlnorm::host_key(&monitor.normalized_url).as_deref() == Ok(host) {
                    out.push((chat_id.clone(), monitor.url.clone()));
                }
            }
        }
        out
    }

    pub fn available_disk_mb(&self) -> Option<u64> {
        available_disk_mb(&self.inner.state_dir)
    }
}

async fn writer_loop(inner: Arc<StoreInner>, mut rx: mpsc::Receiver<WriteOp>) {
    while let Some(op) = rx.recv().await {
        let started = Instant::now();
        let result = perform_write(&inner, op.mutate).await;
        inner.metrics.record_store_write(started.elapsed());
        if let Err(err) = &result {
            warn!(target: "store", %err, "write failed");
        }
        let _ = op.ack.send(result);
    }
    debug!(target: "store", "writer loop stopped");
}

async fn perform_write(inner: &StoreInner, mutate: Mutator) -> Result<(), EngineError> {
    check_free_space(&inner.state_dir, inner.min_free_mb)?;

    let mut next = inner.state.read().expect("store lock poisoned").clone();
    mutate(&mut next);
    next.schema_version = SCHEMA_VERSION.to_string();

    let is_migration = {
        let disk = inner.disk_version.lock().expect("store lock poisoned");
        *disk != SCHEMA_VERSION
    };
    let backup = if is_migration && tokio::fs::try_exists(&inner.db_path).await.unwrap_or(false) {
        Some(create_backup(&inner.db_path).await?)
    } else {
        None
    };

    let mut value = serde_json::to_value(&next)
        .map_err(|err| EngineError::Storage(format!("serializing document: {err}")))?;
    normalize_timestamps(&mut value);
    let next: Document = serde_json::from_value(value.clone())
        .map_err(|err| EngineError::Storage(format!("normalized document invalid: {err}")))?;

    match write_atomic(&inner.db_path, &value).await {
        Ok(()) => {
            *inner.state.write().expect("store lock poisoned") = next;
            *inner.disk_version.lock().expect("store lock poisoned") = SCHEMA_VERSION.to_string();
            Ok(())
        }
        Err(err) => {
            if let Some(backup) = backup {
                let _ = tokio::fs::copy(&backup, &inner.db_path).await;
                Err(EngineError::MigrationFailed(format!(
                    "migration write failed, backup restored: {err}"
                )))
            } else {
                Err(err)
            }
        }
    }
}

/// Shadow write then POSIX-atomic rename; the destination is never observed
/// half-written.
async fn write_atomic(path: &Path, value: &Value) -> Result<(), EngineError> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|err| EngineError::Storage(format!("encoding document: {err}")))?;
    let path = path.to_path_buf();
    let tmp = sibling(&path, ".tmp");
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.flush()?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp, &path)
    })
    .await
    .map_err(|err| EngineError::Storage(format!("write task failed: {err}")))?
    .map_err(|err| EngineError::Storage(format!("writing db: {err}")))
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "db.json".to_string());
    path.with_file_name(format!("{name}{suffix}"))
}

async fn create_backup(db_path: &Path) -> Result<PathBuf, EngineError> {
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let backup = sibling(db_path, &format!(".backup_{stamp}"));
    tokio::fs::copy(db_path, &backup)
        .await
        .map_err(|err| EngineError::Storage(format!("creating backup: {err}")))?;
    prune_backups(db_path).await;
    Ok(backup)
}

async fn prune_backups(db_path: &Path) {
    let Some(dir) = db_path.parent() else { return };
    let prefix = format!(
        "{}.backup_",
        db_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    );
    let mut backups = Vec::new();
    if let Ok(mut entries) = tokio::fs::read_dir(dir).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(&prefix) {
                backups.push(entry.path());
            }
        }
    }
    // Timestamped names sort chronologically.
    backups.sort();
    while backups.len() > BACKUP_KEEP {
        let oldest = backups.remove(0);
        if let Err(err) = tokio::fs::remove_file(&oldest).await {
            warn!(target: "store", ?oldest, %err, "failed to prune backup");
        }
    }
}

pub fn available_disk_mb(path: &Path) -> Option<u64> {
    let target = std::fs::canonicalize(path).ok()?;
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| target.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space() / (1024 * 1024))
}

fn check_free_space(dir: &Path, min_mb: u64) -> Result<(), EngineError> {
    if min_mb == 0 {
        return Ok(());
    }
    match available_disk_mb(dir) {
        Some(mb) if mb < min_mb => Err(EngineError::InsufficientStorage {
            available_mb: mb,
            required_mb: min_mb,
        }),
        Some(_) => Ok(()),
        None => {
            warn!(target: "store", ?dir, "could not determine free space; proceeding");
            Ok(())
        }
    }
}

// ---------- load & migrations ----------

async fn load_document(path: &Path) -> Result<(Document, bool, bool), EngineError> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        return Ok((Document::default(), false, false));
    }
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|err| EngineError::Storage(format!("reading db: {err}")))?;
    let value: Value = serde_json::from_str(&raw)
        .map_err(|err| EngineError::Storage(format!("db file is not valid JSON: {err}")))?;
    let (migrated_value, changed) = migrate_value(value)?;
    let document: Document = serde_json::from_value(migrated_value)
        .map_err(|err| EngineError::MigrationFailed(format!("migrated document invalid: {err}")))?;
    Ok((document, changed, true))
}

/// Append-only schema migrations. Current lineage:
///  - versionless raw `chat_id → [monitor]` maps,
///  - `data`-enveloped documents,
///  - the current flat 2.0 layout.
fn migrate_value(value: Value) -> Result<(Value, bool), EngineError> {
    let mut root = match value {
        Value::Object(map) => map,
        other => {
            return Err(EngineError::MigrationFailed(format!(
                "document root must be an object, found {other}"
            )))
        }
    };

    let version = root
        .get("schema_version")
        .and_then(Value::as_str)
        .unwrap_or("1.0")
        .to_string();
    let enveloped = root.contains_key("data");
    if version == SCHEMA_VERSION && !enveloped {
        return Ok((Value::Object(root), false));
    }

    let users: Map<String, Value> = if enveloped {
        match root.remove("data") {
            Some(Value::Object(map)) => map,
            Some(other) => {
                return Err(EngineError::MigrationFailed(format!(
                    "`data` must be an object, found {other}"
                )))
            }
            None => Map::new(),
        }
    } else {
        root.remove("schema_version");
        root.remove("updated_at");
        std::mem::take(&mut root)
    };

    let mut out = Map::new();
    out.insert(
        "schema_version".to_string(),
        Value::String(SCHEMA_VERSION.to_string()),
    );
    for (chat_id, user) in users {
        out.insert(chat_id, migrate_user(user)?);
    }
    Ok((Value::Object(out), true))
}

fn migrate_user(value: Value) -> Result<Value, EngineError> {
    match value {
        // v1 stored a bare list of monitors per chat id.
        Value::Array(monitors) => {
            let migrated: Vec<Value> = monitors
                .into_iter()
                .filter_map(|m| migrate_monitor(m).ok())
                .collect();
            Ok(serde_json::json!({
                "user_config": serde_json::to_value(crate::models::MonitorConfig::default())
                    .unwrap_or_default(),
                "monitors": migrated,
            }))
        }
        Value::Object(mut user) => {
            if let Some(config) = user.remove("user_config") {
                user.insert("user_config".into(), migrate_config(config));
            }
            let monitors = match user.remove("monitors") {
                Some(Value::Array(list)) => list
                    .into_iter()
                    .filter_map(|m| migrate_monitor(m).ok())
                    .collect(),
                _ => Vec::new(),
            };
            user.insert("monitors".into(), Value::Array(monitors));
            Ok(Value::Object(user))
        }
        other => Err(EngineError::MigrationFailed(format!(
            "user record must be an object or list, found {other}"
        ))),
    }
}

fn migrate_config(value: Value) -> Value {
    let Value::Object(mut config) = value else {
        return value;
    };
    if let Some(interval) = config.remove("check_interval") {
        config.insert("check_interval_seconds".into(), interval);
    }
    Value::Object(config)
}

fn migrate_monitor(value: Value) -> Result<Value, EngineError> {
    let Value::Object(mut monitor) = value else {
        return Err(EngineError::MigrationFailed(
            "monitor record must be an object".into(),
        ));
    };

    let url = monitor
        .get("url")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::MigrationFailed("monitor record without url".into()))?
        .to_string();
    if !monitor.contains_key("normalized_url") {
        let normalized = urlnorm::normalize_url(&url).unwrap_or_else(|_| url.clone());
        monitor.insert("normalized_url".into(), Value::String(normalized));
    }

    if let Some(history) = monitor.remove("history_log") {
        monitor.insert("history".into(), history);
    }
    if let Some(Value::Array(entries)) = monitor.remove("history") {
        let migrated: Vec<Value> = entries
            .into_iter()
            .filter_map(migrate_history_entry)
            .collect();
        monitor.insert("history".into(), Value::Array(migrated));
    }

    if let Some(config) = monitor.remove("config") {
        if !config.is_null() {
            monitor.insert("config".into(), migrate_config(config));
        }
    }

    if let Some(Value::Object(mut meta)) = monitor.remove("metadata") {
        if let Some(last_check) = meta.remove("last_check") {
            meta.insert("last_check_at".into(), last_check);
        }
        if let Some(failures) = meta.remove("failure_count") {
            meta.insert("consecutive_failures".into(), failures);
        }
        meta.remove("rate_limit_count");
        monitor.insert("metadata".into(), Value::Object(meta));
    }

    // Old fingerprints carry no diffable text; drop them so the next patrol
    // establishes a fresh baseline without alerting.
    let fingerprint_ok = monitor
        .get("fingerprint")
        .and_then(|fp| fp.get("content_text"))
        .and_then(Value::as_str)
        .is_some_and(|text| !text.is_empty());
    if !fingerprint_ok {
        monitor.remove("fingerprint");
    }

    // Single-sided legacy snapshots cannot be replayed; drop them.
    let snapshots_ok = monitor
        .get("forensic_snapshots")
        .and_then(Value::as_array)
        .is_some_and(|list| {
            list.iter()
                .all(|s| s.get("old_content_compressed").is_some())
        });
    if !snapshots_ok {
        monitor.remove("forensic_snapshots");
    }

    Ok(Value::Object(monitor))
}

fn migrate_history_entry(value: Value) -> Option<Value> {
    let Value::Object(mut entry) = value else {
        return None;
    };
    if entry.get("change_type").and_then(Value::as_str) == Some("INITIAL_BASELINE") {
        return None;
    }
    if let Some(score) = entry.remove("similarity_score") {
        entry.insert("similarity_final".into(), score);
    }
    if let Some(summary) = entry.remove("summary") {
        entry.insert("diff_summary".into(), summary);
    }
    Some(Value::Object(entry))
}

// ---------- timestamp normalisation ----------

fn is_timestamp_key(key: &str) -> bool {
    key.ends_with("_at") || key.ends_with("_time") || key == "timestamp"
}

/// Recursively rewrite every timestamp-shaped field to ISO-8601 UTC with a
/// `Z` suffix. Unparseable non-null values are replaced with current UTC.
pub(crate) fn normalize_timestamps(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, val) in map.iter_mut() {
                if is_timestamp_key(key) {
                    normalize_stamp(key, val);
                } else {
                    normalize_timestamps(val);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                normalize_timestamps(item);
            }
        }
        _ => {}
    }
}

fn normalize_stamp(key: &str, value: &mut Value) {
    if value.is_null() {
        return;
    }
    let parsed: Option<DateTime<Utc>> = match &*value {
        Value::String(s) => parse_stamp(s),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(|secs| DateTime::from_timestamp(secs, 0)),
        _ => None,
    };
    let stamp = parsed.unwrap_or_else(|| {
        warn!(target: "store", key, "unparseable timestamp replaced with current UTC");
        Utc::now()
    });
    *value = Value::String(stamp.to_rfc3339_opts(SecondsFormat::Millis, true));
}

fn parse_stamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|| {
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| naive.and_utc())
        })
}
