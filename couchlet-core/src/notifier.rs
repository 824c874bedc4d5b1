//! Cross-instance change notification
//!
//! A registry of listeners keyed by database name. Every commit calls
//! `notify(name)`, which invokes each listener registered under that name.
//! Delivery is best effort: a listener that panics is removed.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

/// Callback invoked with the name of the changed database
pub type ChangeListener = Arc<dyn Fn(&str) + Send + Sync>;

type Registry = HashMap<String, HashMap<String, ChangeListener>>;

/// Publish/subscribe registry mapping database name to listeners
#[derive(Default)]
pub struct ChangeNotifier {
    listeners: Mutex<Registry>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide notifier shared by every `Database` opened without an
    /// explicit one
    pub fn shared() -> Arc<ChangeNotifier> {
        static SHARED: OnceLock<Arc<ChangeNotifier>> = OnceLock::new();
        SHARED.get_or_init(|| Arc::new(ChangeNotifier::new())).clone()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        // A poisoned registry still holds consistent maps.
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a listener and return its id
    pub fn add_listener(&self, db_name: &str, listener: ChangeListener) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.registry()
            .entry(db_name.to_string())
            .or_default()
            .insert(id.clone(), listener);
        id
    }

    /// Remove a listener; returns whether it was registered
    pub fn remove_listener(&self, db_name: &str, id: &str) -> bool {
        let mut registry = self.registry();
        let Some(listeners) = registry.get_mut(db_name) else {
            return false;
        };
        let removed = listeners.remove(id).is_some();
        if listeners.is_empty() {
            registry.remove(db_name);
        }
        removed
    }

    pub fn listener_count(&self, db_name: &str) -> usize {
        self.registry().get(db_name).map_or(0, HashMap::len)
    }

    /// Signal that `db_name` changed
    ///
    /// Listeners run on the caller's thread, outside the registry lock, so a
    /// listener may add or remove listeners.
    pub fn notify(&self, db_name: &str) {
        let listeners: Vec<(String, ChangeListener)> = match self.registry().get(db_name) {
            Some(map) => map.iter().map(|(id, l)| (id.clone(), l.clone())).collect(),
            None => return,
        };
        for (id, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(db_name))).is_err() {
                tracing::warn!("Dropping change listener {} on {} after it panicked", id, db_name);
                self.remove_listener(db_name, &id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, ChangeListener) {
        let hits = Arc::new(AtomicUsize::new(0));
        let clone = hits.clone();
        (hits, Arc::new(move |_: &str| {
            clone.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[test]
    fn test_notify_reaches_only_named_database() {
        let notifier = ChangeNotifier::new();
        let (a_hits, a) = counter();
        let (b_hits, b) = counter();
        notifier.add_listener("a", a);
        notifier.add_listener("b", b);
        notifier.notify("a");
        notifier.notify("a");
        assert_eq!(a_hits.load(Ordering::SeqCst), 2);
        assert_eq!(b_hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_removed_listener_is_silent() {
        let notifier = ChangeNotifier::new();
        let (hits, listener) = counter();
        let id = notifier.add_listener("a", listener);
        assert!(notifier.remove_listener("a", &id));
        assert!(!notifier.remove_listener("a", &id));
        notifier.notify("a");
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(notifier.listener_count("a"), 0);
    }

    #[test]
    fn test_panicking_listener_is_dropped() {
        let notifier = ChangeNotifier::new();
        notifier.add_listener("a", Arc::new(|_: &str| panic!("boom")));
        let (hits, listener) = counter();
        notifier.add_listener("a", listener);
        notifier.notify("a");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(notifier.listener_count("a"), 1);
    }
}
