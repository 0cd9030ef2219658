//! `PendingValue<T>` — a value that resolves exactly once.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::trace;

type Callback<T> = Box<dyn FnOnce(&T) + Send>;

struct Slot<T> {
    value: Option<T>,
    callbacks: Vec<Callback<T>>,
}

struct Shared<T> {
    description: String,
    slot: Mutex<Slot<T>>,
    ready: watch::Sender<bool>,
}

/// Deferred handle to a value. Clones share the same cell.
pub struct PendingValue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for PendingValue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + 'static> PendingValue<T> {
    pub fn new(description: impl Into<String>) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                description: description.into(),
                slot: Mutex::new(Slot {
                    value: None,
                    callbacks: Vec::new(),
                }),
                ready,
            }),
        }
    }

    /// A value that is already resolved.
    pub fn resolved(description: impl Into<String>, value: T) -> Self {
        let pending = Self::new(description);
        pending.try_resolve(value);
        pending
    }

    pub fn description(&self) -> &str {
        &self.shared.description
    }

    /// Non-blocking peek.
    pub fn get(&self) -> Option<T> {
        self.shared.slot.lock().value.clone()
    }

    pub fn is_resolved(&self) -> bool {
        self.shared.slot.lock().value.is_some()
    }

    /// Resolve with `value` unless already resolved. Returns whether this
    /// call won.
    ///
    /// Callbacks run on the calling thread after the slot lock is released.
    pub fn try_resolve(&self, value: T) -> bool {
        let callbacks = {
            let mut slot = self.shared.slot.lock();
            if slot.value.is_some() {
                return false;
            }
            slot.value = Some(value.clone());
            std::mem::take(&mut slot.callbacks)
        };
        trace!(pending = %self.shared.description, "resolved");
        self.shared.ready.send_replace(true);
        for callback in callbacks {
            callback(&value);
        }
        true
    }

    /// Run `f` once with the resolved value; immediately if already resolved.
    pub fn on_resolved(&self, f: impl FnOnce(&T) + Send + 'static) {
        let value = {
            let mut slot = self.shared.slot.lock();
            match &slot.value {
                Some(value) => value.clone(),
                None => {
                    slot.callbacks.push(Box::new(f));
                    return;
                }
            }
        };
        f(&value);
    }

    /// Wait for resolution.
    pub async fn wait(&self) -> T {
        let mut ready = self.shared.ready.subscribe();
        loop {
            if let Some(value) = self.get() {
                return value;
            }
            // The sender lives in `shared`, which `self` keeps alive.
            let _ = ready.changed().await;
        }
    }
}

impl<T> fmt::Debug for PendingValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PendingValue({})", self.shared.description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn resolves_once() {
        let p = PendingValue::new("url");
        assert_eq!(p.get(), None);
        assert!(p.try_resolve("a".to_string()));
        assert!(!p.try_resolve("b".to_string()));
        assert_eq!(p.get().as_deref(), Some("a"));
    }

    #[test]
    fn callbacks_run_exactly_once() {
        let p = PendingValue::new("n");
        let hits = Arc::new(AtomicUsize::new(0));
        let before = hits.clone();
        p.on_resolved(move |v: &u32| {
            assert_eq!(*v, 3);
            before.fetch_add(1, Ordering::SeqCst);
        });
        p.try_resolve(3);
        p.try_resolve(4);
        let after = hits.clone();
        p.on_resolved(move |v| {
            assert_eq!(*v, 3);
            after.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn racing_resolvers_have_one_winner() {
        let p = PendingValue::new("race");
        let threads: Vec<_> = (0..16)
            .map(|i| {
                let p = p.clone();
                std::thread::spawn(move || p.try_resolve(i))
            })
            .collect();
        let winners: Vec<bool> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        assert_eq!(winners.iter().filter(|w| **w).count(), 1);
        assert!(p.get().is_some());
    }

    #[tokio::test]
    async fn wait_returns_after_resolution() {
        let p = PendingValue::new("later");
        let waiter = {
            let p = p.clone();
            tokio::spawn(async move { p.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        p.try_resolve(42u16);
        assert_eq!(waiter.await.unwrap(), 42);
        assert_eq!(PendingValue::resolved("now", 1u8).wait().await, 1);
    }
}
