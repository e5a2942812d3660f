use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::notifier::{Notification, Notifier};
use crate::tasks::TaskHandle;

/// Token bucket with uniform refill. `acquire` suspends without holding the
/// bucket lock, so an abandoned waiter never consumes a future token.
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate: f64, capacity: u32) -> Self {
        Self {
            rate,
            capacity: f64::from(capacity),
            state: Mutex::new(BucketState {
                tokens: f64::from(capacity),
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.last_refill = now;
                state.tokens = (state.tokens + elapsed * self.rate).min(self.capacity);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.rate)
            };
            sleep(wait).await;
        }
    }
}

struct Outbound {
    chat_id: String,
    notification: Notification,
}

/// System-wide rate governance: the fetch token bucket, the bounded
/// notification queue with its paced drainer, and the congestion signal the
/// patrol engine consults before each cycle.
pub struct Governor {
    fetch_bucket: TokenBucket,
    notify_tx: mpsc::Sender<Outbound>,
    congestion_threshold: usize,
}

impl Governor {
    /// Build the governor and spawn the notification drainer feeding the
    /// given notifier at the configured drain rate.
    pub fn start(config: &EngineConfig, notifier: Arc<dyn Notifier>) -> (Arc<Governor>, TaskHandle) {
        let (notify_tx, notify_rx) = mpsc::channel(config.notify_queue_capacity);
        let governor = Arc::new(Governor {
            fetch_bucket: TokenBucket::new(config.fetch_rps, config.fetch_burst),
            notify_tx,
            congestion_threshold: config.congestion_threshold,
        });
        let drain_rate = config.notify_rps;
        let handle = TaskHandle::new(
            "governor.notify_drainer",
            tokio::spawn(drain_loop(notify_rx, notifier, drain_rate)),
        );
        (governor, handle)
    }

    /// Suspend until an outbound-fetch token is available.
    pub async fn acquire_fetch(&self) {
        self.fetch_bucket.acquire().await;
    }

    /// Queue a notification for paced delivery. Suspends only when the
    /// queue is at hard capacity.
    pub async fn enqueue(
        &self,
        chat_id: String,
        notification: Notification,
    ) -> Result<(), EngineError> {
        self.notify_tx
            .send(Outbound {
                chat_id,
                notification,
            })
            .await
            .map_err(|_| EngineError::Storage("notification drainer stopped".into()))
    }

    pub fn queue_depth(&self) -> usize {
        self.notify_tx.max_capacity() - self.notify_tx.capacity()
    }

    /// True when the outbound queue is deep enough that the patrol engine
    /// should skip its next cycle.
    pub fn is_congested(&self) -> bool {
        self.queue_depth() > self.congestion_threshold
    }
}

async fn drain_loop(mut rx: mpsc::Receiver<Outbound>, notifier: Arc<dyn Notifier>, rate: f64) {
    let bucket = TokenBucket::new(rate, rate.ceil().max(1.0) as u32);
    while let Some(outbound) = rx.recv().await {
        bucket.acquire().await;
        notifier
            .deliver(&outbound.chat_id, &outbound.notification)
            .await;
        debug!(
            target: "governor",
            chat_id = %outbound.chat_id,
            kind = ?outbound.notification.kind,
            "notification delivered"
        );
    }
    warn!(target: "governor", "notification drainer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::test_support::RecordingNotifier;
    use crate::notifier::NotificationKind;

    fn test_config(dir: &std::path::Path) -> EngineConfig {
        EngineConfig::for_tests(dir)
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_refills_at_rate() {
        let bucket = TokenBucket::new(5.0, 5);
        for _ in 0..5 {
            bucket.acquire().await; // burst drains the full bucket
        }
        let start = Instant::now();
        bucket.acquire().await; // sixth must wait ~200ms for a refill
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(190), "waited {waited:?}");
        assert!(waited < Duration::from_millis(400), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_waiter_consumes_no_token() {
        let bucket = Arc::new(TokenBucket::new(1.0, 1));
        bucket.acquire().await;

        let contender = Arc::clone(&bucket);
        let waiter = tokio::spawn(async move { contender.acquire().await });
        tokio::task::yield_now().await;
        waiter.abort();
        let _ = waiter.await;

        // The cancelled waiter must not have burned the token that refills
        // next; a fresh acquire gets it after ~1s.
        let start = Instant::now();
        bucket.acquire().await;
        assert!(start.elapsed() <= Duration::from_millis(1_100));
    }

    #[tokio::test]
    async fn drainer_delivers_queued_notifications() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let (governor, _task) = Governor::start(&test_config(dir.path()), notifier.clone());

        for i in 0..3 {
            governor
                .enqueue(
                    format!("chat-{i}"),
                    Notification::diagnostic("https://a.example/x".into(), "checks failing".into()),
                )
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        let delivered = notifier.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 3);
        assert_eq!(delivered[0].1.kind, NotificationKind::Diagnostic);
    }

    #[tokio::test]
    async fn congestion_tracks_queue_depth() {
        // No drainer attached: the queue depth is exactly what was enqueued.
        let (notify_tx, _notify_rx) = mpsc::channel(10);
        let governor = Governor {
            fetch_bucket: TokenBucket::new(5.0, 5),
            notify_tx,
            congestion_threshold: 2,
        };

        assert!(!governor.is_congested());
        for i in 0..4 {
            governor
                .enqueue(
                    format!("chat-{i}"),
                    Notification::diagnostic("https://a.example".into(), "x".into()),
                )
                .await
                .unwrap();
        }
        assert_eq!(governor.queue_depth(), 4);
        assert!(governor.is_congested());
    }
}
