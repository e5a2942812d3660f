use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};
use vigil_page::{generate_fingerprint, PageError, WeightedFingerprint};

use crate::app_state::AppState;
use crate::detector;
use crate::errors::EngineError;
use crate::history;
use crate::models::{
    Document, FetchStatus, ForensicSnapshot, HistoryEntry, Monitor, MonitorConfig,
};
use crate::notifier::Notification;
use crate::store::JobMeta;
use crate::tasks::TaskHandle;
use crate::urlnorm::host_key;

/// Spawn the periodic patrol driver.
pub fn start(state: AppState) -> TaskHandle {
    let interval = state.config().patrol_interval;
    TaskHandle::new(
        "patrol.driver",
        tokio::spawn(async move {
            loop {
                match run_cycle(&state).await {
                    Ok(outcome) => debug!(
                        target: "patrol",
                        checked = outcome.checked,
                        alerts = outcome.alerts,
                        skipped = outcome.skipped_congested,
                        "cycle complete"
                    ),
                    Err(err) => warn!(target: "patrol", %err, "cycle failed"),
                }
                tokio::time::sleep(interval).await;
            }
        }),
    )
}

#[derive(Debug, Default)]
pub struct CycleOutcome {
    pub checked: usize,
    pub alerts: usize,
    pub skipped_congested: bool,
}

enum PatchKind {
    Failure {
        status: FetchStatus,
    },
    PolicySkip,
    Baseline {
        fingerprint: WeightedFingerprint,
    },
    Unchanged,
    Changed {
        fingerprint: WeightedFingerprint,
        entry: HistoryEntry,
        snapshot: ForensicSnapshot,
    },
}

struct MonitorPatch {
    chat_id: String,
    normalized_url: String,
    breaker_tag: crate::models::BreakerStateTag,
    kind: PatchKind,
}

/// One pass over every due monitor, ending in a single coalesced write.
/// Alerts enqueue only after that write has durably succeeded, so a
/// delivered notification always has its history entry on disk.
pub async fn run_cycle(state: &AppState) -> Result<CycleOutcome, EngineError> {
    if state.governor().is_congested() {
        info!(target: "patrol", depth = state.governor().queue_depth(), "congested, skipping cycle");
        return Ok(CycleOutcome {
            skipped_congested: true,
            ..CycleOutcome::default()
        });
    }

    let now = Utc::now();
    let mut outcome = CycleOutcome::default();
    let mut patches: Vec<MonitorPatch> = Vec::new();
    let mut alerts: Vec<(String, Notification)> = Vec::new();

    for job in state.store().job_view() {
        if !is_due(&job, now) {
            continue;
        }
        let Ok(host) = host_key(&job.normalized_url) else {
            continue;
        };
        if state.breakers().is_blocked(&host) {
            continue;
        }
        let Some(monitor) = state.store().monitor(&job.chat_id, &job.normalized_url) else {
            continue;
        };
        let config = state
            .store()
            .user(&job.chat_id)
            .map(|user| user.effective_config(&monitor))
            .unwrap_or_default();

        outcome.checked += 1;
        let (kind, notification) = check_monitor(state, &monitor, &config).await;
        if let Some(notification) = notification {
            alerts.push((job.chat_id.clone(), notification));
        }
        patches.push(MonitorPatch {
            chat_id: job.chat_id,
            normalized_url: job.normalized_url,
            breaker_tag: state.breakers().state_tag(&host),
            kind,
        });
    }

    if !patches.is_empty() {
        state
            .store()
            .submit_write(move |doc| apply_patches(doc, patches, now))
            .await?;
    }

    outcome.alerts = alerts.len();
    for (chat_id, notification) in alerts {
        state.governor().enqueue(chat_id, notification).await?;
    }
    Ok(outcome)
}

fn is_due(job: &JobMeta, now: DateTime<Utc>) -> bool {
    if job.snooze_until.is_some_and(|until| until > now) {
        return false;
    }
    match job.last_check_at {
        None => true,
        Some(last) => last + Duration::seconds(i64::from(job.interval_secs)) <= now,
    }
}

async fn check_monitor(
    state: &AppState,
    monitor: &Monitor,
    config: &MonitorConfig,
) -> (PatchKind, Option<Notification>) {
    let page = match state.requests().fetch(&monitor.url).await {
        Ok(page) => page,
        Err(EngineError::PolicyBlocked) => return (PatchKind::PolicySkip, None),
        Err(err) => {
            let status = failure_status(&err);
            debug!(target: "patrol", url = %monitor.url, %err, "check failed");
            return (PatchKind::Failure { status }, None);
        }
    };

    let new_fingerprint =
        match generate_fingerprint(&page.body, config.custom_selector.as_deref()) {
            Ok(fp) => fp,
            Err(PageError::BlockPage(reason)) => {
                info!(
                    target: "patrol",
                    url = %monitor.url,
                    reason = reason.as_str(),
                    "block page, no baseline update"
                );
                state
                    .requests()
                    .record_content_failure(&monitor.normalized_url);
                return (
                    PatchKind::Failure {
                        status: FetchStatus::BlockPage,
                    },
                    None,
                );
            }
        };

    let old = match &monitor.fingerprint {
        None => {
            return (
                PatchKind::Baseline {
                    fingerprint: new_fingerprint,
                },
                None,
            )
        }
        Some(old) if old.is_stale_version() => {
            debug!(
                target: "patrol",
                url = %monitor.url,
                from = %old.version,
                "algorithm version changed, resetting baseline silently"
            );
            return (
                PatchKind::Baseline {
                    fingerprint: new_fingerprint,
                },
                None,
            );
        }
        Some(old) => old,
    };

    if old.hash == new_fingerprint.hash {
        return (PatchKind::Unchanged, None);
    }
    let evaluation = detector::evaluate(old, &new_fingerprint, config.similarity_threshold);
    let Some(change_type) = evaluation.change else {
        return (PatchKind::Unchanged, None);
    };

    let diff = detector::safe_diff(&old.content_text, &new_fingerprint.content_text);
    let snapshot = match detector::create_snapshot(
        &old.content_text,
        &page.body,
        change_type,
        evaluation.metrics,
        &diff,
    ) {
        Ok(snapshot) => snapshot,
        Err(err) => {
            warn!(target: "patrol", url = %monitor.url, %err, "snapshot failed, deferring alert");
            return (PatchKind::Unchanged, None);
        }
    };
    let entry = HistoryEntry {
        timestamp: Utc::now(),
        change_type,
        similarity_final: evaluation.metrics.final_score,
        diff_summary: diff.summary.clone(),
    };
    let notification = Notification::change(
        monitor.url.clone(),
        change_type,
        evaluation.metrics.final_score,
        config.include_diff.then(|| diff.text.clone()),
    );
    (
        PatchKind::Changed {
            fingerprint: new_fingerprint,
            entry,
            snapshot,
        },
        Some(notification),
    )
}

fn failure_status(err: &EngineError) -> FetchStatus {
    match err {
        EngineError::FetchTimeout(_) => FetchStatus::Timeout,
        EngineError::HttpStatusError(_) => FetchStatus::HttpError,
        EngineError::CircuitOpen(_) => FetchStatus::CircuitOpen,
        EngineError::BlockPageDetected => FetchStatus::BlockPage,
        _ => FetchStatus::NetworkError,
    }
}

fn apply_patches(doc: &mut Document, patches: Vec<MonitorPatch>, now: DateTime<Utc>) {
    for patch in patches {
        let Some(user) = doc.users.get_mut(&patch.chat_id) else {
            continue;
        };
        let Some(monitor) = user.monitor_mut(&patch.normalized_url) else {
            continue;
        };
        monitor.metadata.circuit_breaker_state = patch.breaker_tag;
        match patch.kind {
            PatchKind::Failure { status } => {
                monitor.metadata.consecutive_failures =
                    monitor.metadata.consecutive_failures.saturating_add(1);
                monitor.metadata.last_status = status;
            }
            PatchKind::PolicySkip => {
                monitor.metadata.last_status = FetchStatus::PolicyBlocked;
                monitor.metadata.last_check_at = Some(now);
                monitor.metadata.check_count += 1;
            }
            PatchKind::Baseline { fingerprint } => {
                monitor.fingerprint = Some(fingerprint);
                monitor.metadata.last_status = FetchStatus::Ok;
                monitor.metadata.last_check_at = Some(now);
                monitor.metadata.check_count += 1;
                monitor.metadata.consecutive_failures = 0;
            }
            PatchKind::Unchanged => {
                monitor.metadata.last_status = FetchStatus::Ok;
                monitor.metadata.last_check_at = Some(now);
                monitor.metadata.check_count += 1;
                monitor.metadata.consecutive_failures = 0;
            }
            PatchKind::Changed {
                fingerprint,
                entry,
                snapshot,
            } => {
                history::append_entry(monitor, entry);
                detector::push_snapshot(monitor, snapshot);
                monitor.fingerprint = Some(fingerprint);
                monitor.metadata.last_status = FetchStatus::Ok;
                monitor.metadata.last_check_at = Some(now);
                monitor.metadata.check_count += 1;
                monitor.metadata.consecutive_failures = 0;
            }
        }
    }
}
