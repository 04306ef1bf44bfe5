//! Per-key debounced dispatch.
//!
//! Change notifications arrive in storms: the owning application rewrites
//! a cache file many times in quick succession. Each logical key gets one
//! callback per storm, fired a fixed window after the key's first
//! sighting. The window is not extended by later events (eviction-style,
//! not sliding), and a key whose callback is still running absorbs new
//! events entirely.
//!
//! Per-key state machine: Idle → Pending (timer armed) → Dispatching
//! (guard set, callback running) → Idle.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

type Callback<K> = dyn Fn(K) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync;

struct Inner<K> {
    window: Duration,
    /// Keys with an armed timer, and the timer task to cancel on stop.
    pending: Mutex<HashMap<K, JoinHandle<()>>>,
    /// Keys whose callback is currently running; events for them are
    /// absorbed, not re-armed.
    dispatching: Mutex<HashSet<K>>,
    callback: Box<Callback<K>>,
}

/// Coalesces bursts of events per logical key into exactly one callback.
pub struct Debouncer<K>
where
    K: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static,
{
    inner: Arc<Inner<K>>,
}

impl<K> Debouncer<K>
where
    K: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static,
{
    pub fn new<F, Fut>(window: Duration, callback: F) -> Self
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                window,
                pending: Mutex::new(HashMap::new()),
                dispatching: Mutex::new(HashSet::new()),
                callback: Box::new(move |key| Box::pin(callback(key))),
            }),
        }
    }

    /// Feed one event. Returns `true` when the event armed a new timer,
    /// `false` when it was absorbed by a pending or dispatching key.
    pub fn observe(&self, key: K) -> bool {
        if self.inner.dispatching.lock().unwrap().contains(&key) {
            debug!(?key, "event absorbed, callback in flight");
            return false;
        }

        let mut pending = self.inner.pending.lock().unwrap();
        if pending.contains_key(&key) {
            debug!(?key, "event absorbed, window already open");
            return false;
        }

        debug!(?key, window_ms = self.inner.window.as_millis() as u64, "window armed");
        let inner = Arc::clone(&self.inner);
        let timer_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(inner.window).await;
            fire(inner, timer_key).await;
        });
        pending.insert(key, handle);
        true
    }

    /// Number of keys with an open window.
    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().unwrap().len()
    }

    /// Cancel every armed timer without firing its callback. Callbacks
    /// already dispatching run to completion.
    pub fn stop(&self) {
        let mut pending = self.inner.pending.lock().unwrap();
        for (key, handle) in pending.drain() {
            debug!(?key, "cancelling pending window");
            handle.abort();
        }
    }
}

impl<K> Clone for Debouncer<K>
where
    K: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> Drop for Inner<K> {
    fn drop(&mut self) {
        for (_, handle) in self.pending.lock().unwrap().drain() {
            handle.abort();
        }
    }
}

/// Timer expiry: move the key to the dispatching guard, run the callback
/// exactly once, release the key.
async fn fire<K>(inner: Arc<Inner<K>>, key: K)
where
    K: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static,
{
    // Guard first, then drop the timer entry, so no event can slip in
    // between the two and arm a second window.
    inner.dispatching.lock().unwrap().insert(key.clone());
    inner.pending.lock().unwrap().remove(&key);

    debug!(?key, "dispatching");
    // Run the callback in its own task so a panic is contained there and
    // cannot kill the dispatch path.
    let result = tokio::spawn((inner.callback)(key.clone())).await;
    if let Err(e) = result {
        warn!(?key, error = %e, "patch callback failed");
    }

    inner.dispatching.lock().unwrap().remove(&key);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const WINDOW: Duration = Duration::from_millis(50);

    fn counting(counter: Arc<AtomicUsize>) -> Debouncer<String> {
        Debouncer::new(WINDOW, move |_key: String| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
    }

    #[tokio::test]
    async fn test_storm_fires_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let debouncer = counting(Arc::clone(&counter));

        assert!(debouncer.observe("friends.css".to_string()));
        for _ in 0..9 {
            assert!(!debouncer.observe("friends.css".to_string()));
        }

        tokio::time::sleep(WINDOW * 4).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(debouncer.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_distinct_keys_fire_independently() {
        let counter = Arc::new(AtomicUsize::new(0));
        let debouncer = counting(Arc::clone(&counter));

        debouncer.observe("friends.css".to_string());
        debouncer.observe("library.css".to_string());
        assert_eq!(debouncer.pending_len(), 2);

        tokio::time::sleep(WINDOW * 4).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_key_reusable_after_dispatch() {
        let counter = Arc::new(AtomicUsize::new(0));
        let debouncer = counting(Arc::clone(&counter));

        debouncer.observe("k".to_string());
        tokio::time::sleep(WINDOW * 4).await;
        debouncer.observe("k".to_string());
        tokio::time::sleep(WINDOW * 4).await;

        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_events_absorbed_while_dispatching() {
        let counter = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(tokio::sync::Semaphore::new(0));

        let cb_counter = Arc::clone(&counter);
        let cb_gate = Arc::clone(&gate);
        let debouncer = Debouncer::new(WINDOW, move |_key: String| {
            let counter = Arc::clone(&cb_counter);
            let gate = Arc::clone(&cb_gate);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                // Hold the dispatching state open until the test releases it.
                let _permit = gate.acquire().await.unwrap();
            }
        });

        debouncer.observe("k".to_string());
        tokio::time::sleep(WINDOW * 2).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // Callback is blocked on the gate; these must all be absorbed.
        for _ in 0..5 {
            assert!(!debouncer.observe("k".to_string()));
        }

        gate.add_permits(1);
        tokio::time::sleep(WINDOW * 4).await;
        // Nothing re-armed while the guard was held.
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_cancels_without_firing() {
        let counter = Arc::new(AtomicUsize::new(0));
        let debouncer = counting(Arc::clone(&counter));

        debouncer.observe("a".to_string());
        debouncer.observe("b".to_string());
        debouncer.stop();

        tokio::time::sleep(WINDOW * 4).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(debouncer.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_panicking_callback_releases_key() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cb_calls = Arc::clone(&calls);
        let debouncer = Debouncer::new(WINDOW, move |_key: String| {
            let calls = Arc::clone(&cb_calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                panic!("boom");
            }
        });

        debouncer.observe("k".to_string());
        tokio::time::sleep(WINDOW * 4).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // The key returned to Idle despite the panic.
        assert!(debouncer.observe("k".to_string()));
        tokio::time::sleep(WINDOW * 4).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
