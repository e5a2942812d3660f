use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

/// Collapse concurrent work on one key into a single execution whose result
/// every waiter observes. The first caller for a key becomes the leader and
/// publishes a value; followers suspend until the flight completes. A
/// leader that vanishes without publishing still releases its followers,
/// who then retry on their own.
pub(crate) struct Singleflight<T> {
    flights: Mutex<HashMap<String, Arc<FlightState<T>>>>,
}

impl<T: Clone> Default for Singleflight<T> {
    fn default() -> Self {
        Self {
            flights: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Clone> Singleflight<T> {
    pub(crate) fn begin(&self, key: &str) -> FlightGuard<'_, T> {
        let mut map = self.flights.lock().expect("singleflight map lock poisoned");
        if let Some(state) = map.get(key) {
            state.add_ref();
            FlightGuard::new(self, key.to_string(), Arc::clone(state), false)
        } else {
            let state = Arc::new(FlightState::new());
            map.insert(key.to_string(), Arc::clone(&state));
            FlightGuard::new(self, key.to_string(), state, true)
        }
    }

    fn release(&self, key: &str, flight: &Arc<FlightState<T>>) {
        let mut map = self.flights.lock().expect("singleflight map lock poisoned");
        if flight.release() == 0 {
            if let Some(existing) = map.get(key) {
                if Arc::ptr_eq(existing, flight) {
                    map.remove(key);
                }
            }
        }
    }
}

struct FlightState<T> {
    notify: Notify,
    done: AtomicBool,
    slot: Mutex<Option<T>>,
    refs: AtomicUsize,
}

impl<T: Clone> FlightState<T> {
    fn new() -> Self {
        Self {
            notify: Notify::new(),
            done: AtomicBool::new(false),
            slot: Mutex::new(None),
            refs: AtomicUsize::new(1),
        }
    }

    fn add_ref(&self) {
        self.refs.fetch_add(1, Ordering::Relaxed);
    }

    fn release(&self) -> usize {
        self.refs.fetch_sub(1, Ordering::AcqRel) - 1
    }

    fn publish(&self, value: T) {
        *self.slot.lock().expect("singleflight slot lock poisoned") = Some(value);
        self.done.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    fn finish_empty(&self) {
        self.done.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    async fn wait(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            if self.done.load(Ordering::Acquire) {
                return self
                    .slot
                    .lock()
                    .expect("singleflight slot lock poisoned")
                    .clone();
            }
            notified.await;
        }
    }
}

pub(crate) struct FlightGuard<'a, T: Clone> {
    owner: &'a Singleflight<T>,
    key: String,
    flight: Arc<FlightState<T>>,
    is_leader: bool,
    published: bool,
}

impl<'a, T: Clone> FlightGuard<'a, T> {
    fn new(
        owner: &'a Singleflight<T>,
        key: String,
        flight: Arc<FlightState<T>>,
        is_leader: bool,
    ) -> Self {
        Self {
            owner,
            key,
            flight,
            is_leader,
            published: false,
        }
    }

    pub(crate) fn is_leader(&self) -> bool {
        self.is_leader
    }

    /// Leader only: hand the computed value to every waiter.
    pub(crate) fn publish(&mut self, value: T) {
        self.flight.publish(value);
        self.published = true;
    }

    /// Follower: suspend until the leader finishes. `None` means the leader
    /// disappeared without publishing.
    pub(crate) async fn wait(&self) -> Option<T> {
        self.flight.wait().await
    }
}

impl<T: Clone> Drop for FlightGuard<'_, T> {
    fn drop(&mut self) {
        if self.is_leader && !self.published {
            self.flight.finish_empty();
        }
        self.owner.release(&self.key, &self.flight);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn followers_observe_the_leader_result() {
        let flights: Arc<Singleflight<u64>> = Arc::new(Singleflight::default());

        let leader_flights = Arc::clone(&flights);
        let leader = tokio::spawn(async move {
            let mut guard = leader_flights.begin("k");
            assert!(guard.is_leader());
            tokio::time::sleep(Duration::from_millis(30)).await;
            guard.publish(42);
            42u64
        });
        tokio::time::sleep(Duration::from_millis(5)).await;

        let mut followers = Vec::new();
        for _ in 0..3 {
            let f = Arc::clone(&flights);
            followers.push(tokio::spawn(async move {
                let guard = f.begin("k");
                assert!(!guard.is_leader());
                guard.wait().await
            }));
        }

        assert_eq!(leader.await.unwrap(), 42);
        for follower in followers {
            assert_eq!(follower.await.unwrap(), Some(42));
        }
    }

    #[tokio::test]
    async fn vanished_leader_releases_followers_empty() {
        let flights: Arc<Singleflight<u64>> = Arc::new(Singleflight::default());

        let guard = flights.begin("k");
        let f = Arc::clone(&flights);
        let follower = tokio::spawn(async move {
            let guard = f.begin("k");
            guard.wait().await
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        drop(guard);

        assert_eq!(follower.await.unwrap(), None);
    }

    #[tokio::test]
    async fn key_is_reusable_after_completion() {
        let flights: Singleflight<u64> = Singleflight::default();
        {
            let mut guard = flights.begin("k");
            guard.publish(1);
        }
        let guard = flights.begin("k");
        assert!(guard.is_leader(), "a finished flight must not linger");
    }

    #[tokio::test]
    async fn late_follower_still_sees_published_value() {
        let flights: Arc<Singleflight<u64>> = Arc::new(Singleflight::default());
        let mut leader = flights.begin("k");

        let f = Arc::clone(&flights);
        let follower = tokio::spawn(async move {
            let guard = f.begin("k");
            // Join after the value is already in the slot.
            tokio::time::sleep(Duration::from_millis(20)).await;
            guard.wait().await
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        leader.publish(7);
        drop(leader);

        assert_eq!(follower.await.unwrap(), Some(7));
    }
}
