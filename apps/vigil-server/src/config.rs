use std::path::PathBuf;
use std::time::Duration;

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|v| *v > 0.0)
        .unwrap_or(default)
}

/// Runtime tunables, resolved once at startup. Contract variables
/// (`TELEGRAM_TOKEN`, `ADMIN_ID`, `PORT`) are read here; everything else is
/// a `VIGIL_*` knob with a production default.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub state_dir: PathBuf,
    pub db_path: PathBuf,
    pub patrol_interval: Duration,
    pub http_timeout: Duration,
    pub fetch_rps: f64,
    pub fetch_burst: u32,
    pub notify_rps: f64,
    pub notify_queue_capacity: usize,
    pub congestion_threshold: usize,
    pub jitter_min: Duration,
    pub jitter_max: Duration,
    pub result_cache_ttl: Duration,
    pub robots_ttl: Duration,
    pub breaker_failure_threshold: u32,
    pub breaker_recovery: Duration,
    pub min_free_disk_mb: u64,
    pub shutdown_grace: Duration,
    pub admin_chat_id: Option<String>,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let state_dir =
            PathBuf::from(std::env::var("VIGIL_STATE_DIR").unwrap_or_else(|_| "state".into()));
        let db_path = state_dir.join("db.json");
        Self {
            state_dir,
            db_path,
            patrol_interval: Duration::from_secs(env_u64("VIGIL_PATROL_INTERVAL_SECS", 60).max(1)),
            http_timeout: Duration::from_secs(env_u64("VIGIL_HTTP_TIMEOUT_SECS", 15).max(1)),
            fetch_rps: env_f64("VIGIL_FETCH_RPS", 5.0),
            fetch_burst: env_u64("VIGIL_FETCH_BURST", 5).max(1) as u32,
            notify_rps: env_f64("VIGIL_NOTIFY_RPS", 25.0),
            notify_queue_capacity: env_u64("VIGIL_NOTIFY_QUEUE_CAP", 1_000).max(1) as usize,
            congestion_threshold: env_u64("VIGIL_CONGESTION_THRESHOLD", 50) as usize,
            jitter_min: Duration::from_millis(env_u64("VIGIL_FETCH_JITTER_MIN_MS", 1_000)),
            jitter_max: Duration::from_millis(env_u64("VIGIL_FETCH_JITTER_MAX_MS", 5_000)),
            result_cache_ttl: Duration::from_secs(env_u64("VIGIL_FETCH_CACHE_TTL_SECS", 30).max(1)),
            robots_ttl: Duration::from_secs(env_u64("VIGIL_ROBOTS_TTL_SECS", 24 * 3_600).max(60)),
            breaker_failure_threshold: env_u64("VIGIL_BREAKER_FAILURES", 3).max(1) as u32,
            breaker_recovery: Duration::from_secs(env_u64("VIGIL_BREAKER_RECOVERY_SECS", 3_600)),
            min_free_disk_mb: env_u64("VIGIL_MIN_FREE_DISK_MB", 100),
            shutdown_grace: Duration::from_secs(env_u64("VIGIL_SHUTDOWN_GRACE_SECS", 5)),
            admin_chat_id: std::env::var("ADMIN_ID").ok().filter(|s| !s.is_empty()),
        }
    }

    /// Defaults pointed at a scratch directory, with the stealth jitter off
    /// so suites run fast.
    #[cfg(test)]
    pub fn for_tests(dir: &std::path::Path) -> Self {
        Self {
            state_dir: dir.to_path_buf(),
            db_path: dir.join("db.json"),
            patrol_interval: Duration::from_secs(60),
            http_timeout: Duration::from_secs(15),
            fetch_rps: 1_000.0,
            fetch_burst: 1_000,
            notify_rps: 1_000.0,
            notify_queue_capacity: 1_000,
            congestion_threshold: 50,
            jitter_min: Duration::ZERO,
            jitter_max: Duration::ZERO,
            result_cache_ttl: Duration::from_secs(30),
            robots_ttl: Duration::from_secs(24 * 3_600),
            breaker_failure_threshold: 3,
            breaker_recovery: Duration::from_secs(3_600),
            min_free_disk_mb: 0,
            shutdown_grace: Duration::from_secs(1),
            admin_chat_id: None,
        }
    }
}
