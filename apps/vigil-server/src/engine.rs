use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::app_state::AppState;
use crate::breaker::BreakerRegistry;
use crate::commands::Commander;
use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::governor::Governor;
use crate::metrics::Metrics;
use crate::models::BreakerStateTag;
use crate::notifier::{Notification, Notifier};
use crate::patrol;
use crate::request_manager::{CooldownEvent, RequestManager};
use crate::store::Store;
use crate::tasks::{TaskHandle, TaskManager};
use crate::urlnorm::host_key;

/// The running engine: owned state plus its background tasks. Shutdown
/// tears tasks down in order — patrol first, the store writer last so the
/// write queue drains under the grace window.
pub struct Engine {
    state: AppState,
    tasks: TaskManager,
}

impl Engine {
    pub async fn start(
        config: EngineConfig,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Engine, EngineError> {
        let (state, support_tasks) = build_state(config, notifier).await?;
        let mut tasks = TaskManager::new();
        tasks.push(patrol::start(state.clone()));
        tasks.extend(support_tasks);
        info!(
            target: "engine",
            monitors = state.store().monitors_total(),
            "engine started"
        );
        Ok(Engine { state, tasks })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Inbound command surface for the chat layer.
    pub fn commander(&self) -> Commander {
        Commander::new(self.state.clone())
    }

    pub async fn shutdown(self) {
        let grace = self.state.config().shutdown_grace;
        info!(target: "engine", ?grace, "shutting down");
        self.tasks.shutdown_with_grace(grace).await;
    }
}

/// Wire every component together. Returned support tasks are ordered for
/// shutdown: cooldown listener, notification drainer, then store writer.
pub(crate) async fn build_state(
    config: EngineConfig,
    notifier: Arc<dyn Notifier>,
) -> Result<(AppState, Vec<TaskHandle>), EngineError> {
    let config = Arc::new(config);
    let metrics = Arc::new(Metrics::default());
    let (store, store_task) = Store::open(&config, Arc::clone(&metrics)).await?;
    let (governor, drainer_task) = Governor::start(&config, notifier);
    let breakers = Arc::new(BreakerRegistry::new(
        config.breaker_failure_threshold,
        config.breaker_recovery,
    ));
    seed_breakers(&store, &breakers);
    let (requests, cooldown_rx) = RequestManager::new(
        &config,
        Arc::clone(&governor),
        Arc::clone(&breakers),
        Arc::clone(&metrics),
    );
    let state = AppState::new(config, store, governor, breakers, requests, metrics);
    let cooldown_task = start_cooldown_listener(state.clone(), cooldown_rx);
    Ok((state, vec![cooldown_task, drainer_task, store_task]))
}

/// Re-arm breakers from persisted monitor metadata so an OPEN host stays
/// suppressed across restarts.
fn seed_breakers(store: &Store, breakers: &BreakerRegistry) {
    let snapshot = store.snapshot();
    for user in snapshot.users.values() {
        for monitor in &user.monitors {
            if monitor.metadata.circuit_breaker_state == BreakerStateTag::Closed {
                continue;
            }
            if let Ok(host) = host_key(&monitor.normalized_url) {
                debug!(
                    target: "engine",
                    host,
                    state = ?monitor.metadata.circuit_breaker_state,
                    "seeding breaker from persisted state"
                );
                breakers.seed(&host, monitor.metadata.circuit_breaker_state);
            }
        }
    }
}

/// Fan a breaker-open event out to every user watching the host, plus the
/// admin when one is configured. This is the one-shot diagnostic per OPEN
/// transition.
fn start_cooldown_listener(
    state: AppState,
    mut cooldown_rx: mpsc::UnboundedReceiver<CooldownEvent>,
) -> TaskHandle {
    TaskHandle::new(
        "engine.cooldown_listener",
        tokio::spawn(async move {
            while let Some(event) = cooldown_rx.recv().await {
                let watchers = state.store().watchers_of_host(&event.host);
                for (chat_id, url) in watchers {
                    let notification = Notification::cooldown(url, &event.host);
                    if state.governor().enqueue(chat_id, notification).await.is_err() {
                        return;
                    }
                }
                if let Some(admin) = state.config().admin_chat_id.clone() {
                    let notification = Notification::diagnostic(
                        event.host.clone(),
                        format!("circuit opened for {}", event.host),
                    );
                    let _ = state.governor().enqueue(admin, notification).await;
                }
            }
        }),
    )
}
