use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::models::BreakerStateTag;

/// What a caller may do against a host right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    /// Circuit closed; go ahead.
    Allowed,
    /// Circuit half-open; this caller holds the single probe slot.
    Probe,
    /// Circuit open; fail fast.
    Denied,
}

/// State transitions worth reporting upward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Closed → open on the Nth consecutive failure.
    Opened,
    /// Half-open probe failed; the recovery clock restarts.
    Reopened,
    /// Probe succeeded; back to closed.
    Recovered,
}

struct HostState {
    state: BreakerStateTag,
    failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl HostState {
    fn new() -> Self {
        Self {
            state: BreakerStateTag::Closed,
            failures: 0,
            opened_at: None,
            probe_in_flight: false,
        }
    }
}

/// Per-host circuit breakers. Entering OPEN requires the failure threshold;
/// after the recovery window a single probe is allowed through, and its
/// outcome decides between CLOSED and another full OPEN interval.
pub struct BreakerRegistry {
    failure_threshold: u32,
    recovery: Duration,
    hosts: Mutex<HashMap<String, HostState>>,
}

impl BreakerRegistry {
    pub fn new(failure_threshold: u32, recovery: Duration) -> Self {
        Self {
            failure_threshold,
            recovery,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    /// Re-seed a breaker from persisted monitor metadata. An OPEN entry
    /// restarts its recovery clock at boot; the original open instant is
    /// not persisted.
    pub fn seed(&self, host: &str, tag: BreakerStateTag) {
        let mut hosts = self.hosts.lock().expect("breaker lock poisoned");
        let entry = hosts
            .entry(host.to_string())
            .or_insert_with(HostState::new);
        match tag {
            BreakerStateTag::Open => {
                entry.state = BreakerStateTag::Open;
                entry.failures = entry.failures.max(self.failure_threshold);
                entry.opened_at = Some(Instant::now());
            }
            BreakerStateTag::HalfOpen => {
                entry.state = BreakerStateTag::HalfOpen;
                entry.failures = entry.failures.max(self.failure_threshold);
            }
            BreakerStateTag::Closed => {}
        }
    }

    /// Consume a permit for one request. May transition OPEN → HALF_OPEN
    /// when the recovery window has elapsed.
    pub fn check(&self, host: &str) -> Permit {
        let mut hosts = self.hosts.lock().expect("breaker lock poisoned");
        let entry = hosts
            .entry(host.to_string())
            .or_insert_with(HostState::new);
        match entry.state {
            BreakerStateTag::Closed => Permit::Allowed,
            BreakerStateTag::Open => {
                let elapsed = entry
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.recovery {
                    info!(target: "breaker", host, "recovery window elapsed, probing");
                    entry.state = BreakerStateTag::HalfOpen;
                    entry.probe_in_flight = true;
                    Permit::Probe
                } else {
                    Permit::Denied
                }
            }
            BreakerStateTag::HalfOpen => {
                if entry.probe_in_flight {
                    Permit::Denied
                } else {
                    entry.probe_in_flight = true;
                    Permit::Probe
                }
            }
        }
    }

    /// Read-only view for due-list filtering; never claims the probe slot.
    pub fn is_blocked(&self, host: &str) -> bool {
        let hosts = self.hosts.lock().expect("breaker lock poisoned");
        match hosts.get(host) {
            Some(entry) if entry.state == BreakerStateTag::Open => {
                let elapsed = entry
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                elapsed < self.recovery
            }
            Some(entry) if entry.state == BreakerStateTag::HalfOpen => entry.probe_in_flight,
            _ => false,
        }
    }

    /// Release a claimed probe slot without deciding the probe (e.g. the
    /// request was skipped by robots policy before executing).
    pub fn release_probe(&self, host: &str) {
        let mut hosts = self.hosts.lock().expect("breaker lock poisoned");
        if let Some(entry) = hosts.get_mut(host) {
            entry.probe_in_flight = false;
        }
    }

    pub fn record_success(&self, host: &str) -> Option<Transition> {
        let mut hosts = self.hosts.lock().expect("breaker lock poisoned");
        let entry = hosts
            .entry(host.to_string())
            .or_insert_with(HostState::new);
        entry.probe_in_flight = false;
        entry.failures = 0;
        if entry.state != BreakerStateTag::Closed {
            info!(target: "breaker", host, "probe succeeded, closing circuit");
            entry.state = BreakerStateTag::Closed;
            entry.opened_at = None;
            return Some(Transition::Recovered);
        }
        None
    }

    pub fn record_failure(&self, host: &str) -> Option<Transition> {
        let mut hosts = self.hosts.lock().expect("breaker lock poisoned");
        let entry = hosts
            .entry(host.to_string())
            .or_insert_with(HostState::new);
        entry.failures = entry.failures.saturating_add(1);
        match entry.state {
            BreakerStateTag::HalfOpen => {
                warn!(target: "breaker", host, "probe failed, reopening circuit");
                entry.state = BreakerStateTag::Open;
                entry.opened_at = Some(Instant::now());
                entry.probe_in_flight = false;
                Some(Transition::Reopened)
            }
            BreakerStateTag::Closed if entry.failures >= self.failure_threshold => {
                warn!(
                    target: "breaker",
                    host,
                    failures = entry.failures,
                    "failure threshold reached, opening circuit"
                );
                entry.state = BreakerStateTag::Open;
                entry.opened_at = Some(Instant::now());
                Some(Transition::Opened)
            }
            _ => None,
        }
    }

    pub fn state_tag(&self, host: &str) -> BreakerStateTag {
        let hosts = self.hosts.lock().expect("breaker lock poisoned");
        hosts
            .get(host)
            .map(|entry| entry.state)
            .unwrap_or_default()
    }

    pub fn failures(&self, host: &str) -> u32 {
        let hosts = self.hosts.lock().expect("breaker lock poisoned");
        hosts.get(host).map(|entry| entry.failures).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: &str = "https://h.example";

    fn registry() -> BreakerRegistry {
        BreakerRegistry::new(3, Duration::from_secs(3_600))
    }

    #[tokio::test(start_paused = true)]
    async fn opens_on_third_consecutive_failure() {
        let reg = registry();
        assert_eq!(reg.record_failure(HOST), None);
        assert_eq!(reg.record_failure(HOST), None);
        assert_eq!(reg.record_failure(HOST), Some(Transition::Opened));
        assert_eq!(reg.state_tag(HOST), BreakerStateTag::Open);
        assert!(reg.failures(HOST) >= 3);
        assert_eq!(reg.check(HOST), Permit::Denied);
        assert!(reg.is_blocked(HOST));
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_the_failure_count() {
        let reg = registry();
        reg.record_failure(HOST);
        reg.record_failure(HOST);
        reg.record_success(HOST);
        assert_eq!(reg.failures(HOST), 0);
        assert_eq!(reg.record_failure(HOST), None);
    }

    #[tokio::test(start_paused = true)]
    async fn full_lifecycle_probe_success() {
        let reg = registry();
        for _ in 0..3 {
            reg.record_failure(HOST);
        }
        assert_eq!(reg.check(HOST), Permit::Denied);

        tokio::time::advance(Duration::from_secs(3_599)).await;
        assert_eq!(reg.check(HOST), Permit::Denied);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(reg.check(HOST), Permit::Probe);
        // The single probe slot is held; a racing caller is refused.
        assert_eq!(reg.check(HOST), Permit::Denied);

        assert_eq!(reg.record_success(HOST), Some(Transition::Recovered));
        assert_eq!(reg.state_tag(HOST), BreakerStateTag::Closed);
        assert_eq!(reg.failures(HOST), 0);
        assert_eq!(reg.check(HOST), Permit::Allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_restarts_the_recovery_clock() {
        let reg = registry();
        for _ in 0..3 {
            reg.record_failure(HOST);
        }
        tokio::time::advance(Duration::from_secs(3_601)).await;
        assert_eq!(reg.check(HOST), Permit::Probe);
        assert_eq!(reg.record_failure(HOST), Some(Transition::Reopened));

        tokio::time::advance(Duration::from_secs(1_800)).await;
        assert_eq!(reg.check(HOST), Permit::Denied);
        tokio::time::advance(Duration::from_secs(1_801)).await;
        assert_eq!(reg.check(HOST), Permit::Probe);
    }

    #[tokio::test(start_paused = true)]
    async fn released_probe_can_be_reclaimed() {
        let reg = registry();
        for _ in 0..3 {
            reg.record_failure(HOST);
        }
        tokio::time::advance(Duration::from_secs(3_601)).await;
        assert_eq!(reg.check(HOST), Permit::Probe);
        reg.release_probe(HOST);
        assert_eq!(reg.check(HOST), Permit::Probe);
    }

    #[tokio::test(start_paused = true)]
    async fn seeded_open_state_blocks_until_recovery() {
        let reg = registry();
        reg.seed(HOST, BreakerStateTag::Open);
        assert_eq!(reg.check(HOST), Permit::Denied);
        assert!(reg.failures(HOST) >= 3);
        tokio::time::advance(Duration::from_secs(3_601)).await;
        assert_eq!(reg.check(HOST), Permit::Probe);
    }
}
