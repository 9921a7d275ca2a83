//! The in-memory key/value store.
//!
//! A single `Mutex<State>` guards the value map, the expiry map, and the
//! observer list together. Holding one lock for the whole call makes
//! expiration-on-read atomic: a key past its TTL becomes unobservable and
//! exactly one `expire` event fires, with no extra bookkeeping required.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Mutex;

use tokio::time::{Duration, Instant};
use tracing::{debug, instrument};

/// The kind of change an observer is notified about. `Set` and `SetWithTtl`
/// are reported separately so a `db_updates` consumer can tell a plain
/// overwrite from one that attached an expiry, even though both go through
/// `Store::set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StoreOp {
    Set,
    SetWithTtl,
    Delete,
    Expire,
}

/// `(operation, key, value?)` triple delivered to every registered observer.
#[derive(Debug, Clone)]
pub(crate) struct StoreEvent {
    pub(crate) op: StoreOp,
    pub(crate) key: String,
    pub(crate) value: Option<String>,
}

type Observer = Box<dyn Fn(&StoreEvent) + Send + Sync>;

struct Entry {
    id: u64,
    value: String,
    expires_at: Option<Instant>,
}

struct State {
    entries: HashMap<String, Entry>,
    /// `(expiry, insertion id) -> key`. Keyed by insertion id so two keys
    /// expiring at the same instant never collide. The sweep only ever walks
    /// the prefix of this map that has already elapsed, never the full value
    /// map.
    expirations: BTreeMap<(Instant, u64), String>,
    next_id: u64,
    observers: Vec<Observer>,
}

/// In-memory key/value store with per-key TTL.
///
/// Cloning a `Store` is cheap and shares the same underlying state, held
/// behind an `Arc<Mutex<State>>`.
#[derive(Clone)]
pub(crate) struct Store {
    shared: std::sync::Arc<Mutex<State>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    pub(crate) fn new() -> Store {
        Store {
            shared: std::sync::Arc::new(Mutex::new(State {
                entries: HashMap::new(),
                expirations: BTreeMap::new(),
                next_id: 0,
                observers: Vec::new(),
            })),
        }
    }

    /// Register a non-blocking observer. Called synchronously, under the
    /// store lock, on every `set`/`delete`/`get`-triggered-expiry/`sweep`.
    /// Expensive work must be dispatched elsewhere by the observer itself —
    /// the one observer this crate installs is an `mpsc::UnboundedSender`
    /// that only enqueues (see `server::run`).
    pub(crate) fn register_observer(&self, observer: Observer) {
        self.shared.lock().unwrap().observers.push(observer);
    }

    fn notify(state: &State, op: StoreOp, key: &str, value: Option<&str>) {
        let event = StoreEvent {
            op,
            key: key.to_string(),
            value: value.map(|v| v.to_string()),
        };
        for observer in &state.observers {
            observer(&event);
        }
    }

    /// Returns `(value, remaining_ttl_seconds)`. Atomically removes and
    /// reports an elapsed key as absent, emitting exactly one `expire` event.
    #[instrument(skip(self))]
    pub(crate) fn get(&self, key: &str) -> (Option<String>, Option<u64>) {
        let mut state = self.shared.lock().unwrap();

        let expired = match state.entries.get(key) {
            Some(entry) => entry.expires_at.map(|when| Instant::now() >= when).unwrap_or(false),
            None => return (None, None),
        };

        if expired {
            let entry = state.entries.remove(key).expect("checked above");
            if let Some(when) = entry.expires_at {
                state.expirations.remove(&(when, entry.id));
            }
            Store::notify(&state, StoreOp::Expire, key, None);
            return (None, None);
        }

        let entry = state.entries.get(key).expect("checked above");
        let remaining = entry
            .expires_at
            .map(|when| when.saturating_duration_since(Instant::now()).as_secs());
        (Some(entry.value.clone()), remaining)
    }

    /// Inserts or overwrites `key`. `ttl` must be positive if present; a
    /// `None` ttl clears any prior expiry.
    #[instrument(skip(self, value))]
    pub(crate) fn set(&self, key: String, value: String, ttl: Option<Duration>) {
        let mut state = self.shared.lock().unwrap();

        let id = state.next_id;
        state.next_id += 1;

        let expires_at = ttl.map(|duration| {
            let when = Instant::now() + duration;
            state.expirations.insert((when, id), key.clone());
            when
        });

        let prev = state.entries.insert(
            key.clone(),
            Entry {
                id,
                value: value.clone(),
                expires_at,
            },
        );

        if let Some(prev) = prev {
            if let Some(when) = prev.expires_at {
                state.expirations.remove(&(when, prev.id));
            }
        }

        let op = if expires_at.is_some() { StoreOp::SetWithTtl } else { StoreOp::Set };
        debug!(key = %key, has_ttl = expires_at.is_some(), "set");
        Store::notify(&state, op, &key, Some(&value));
    }

    /// Removes `key` and any expiry. Returns whether the key was present.
    #[instrument(skip(self))]
    pub(crate) fn delete(&self, key: &str) -> bool {
        let mut state = self.shared.lock().unwrap();

        match state.entries.remove(key) {
            Some(entry) => {
                if let Some(when) = entry.expires_at {
                    state.expirations.remove(&(when, entry.id));
                }
                Store::notify(&state, StoreOp::Delete, key, None);
                true
            }
            None => false,
        }
    }

    /// Sweeps expired entries, then returns the surviving key set. Order is
    /// unspecified.
    pub(crate) fn keys(&self) -> Vec<String> {
        self.sweep_locked();
        let state = self.shared.lock().unwrap();
        state.entries.keys().cloned().collect()
    }

    /// Removes every entry whose expiry has elapsed, emitting one `expire`
    /// event per removal. Invoked every second by the server's sweeper task.
    pub(crate) fn sweep(&self) {
        self.sweep_locked();
    }

    /// Returns all non-expiring entries, for the snapshotter. Keys carrying
    /// a TTL are intentionally excluded from persistence.
    pub(crate) fn persistable_entries(&self) -> HashMap<String, String> {
        self.sweep_locked();
        let state = self.shared.lock().unwrap();
        state
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at.is_none())
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect()
    }

    /// Loads entries from a snapshot without touching any existing expiry
    /// (used only at startup, before any client has connected).
    pub(crate) fn load_snapshot(&self, data: HashMap<String, String>) {
        let mut state = self.shared.lock().unwrap();
        for (key, value) in data {
            let id = state.next_id;
            state.next_id += 1;
            state.entries.insert(
                key,
                Entry {
                    id,
                    value,
                    expires_at: None,
                },
            );
        }
    }

    fn sweep_locked(&self) {
        let mut state = self.shared.lock().unwrap();
        let state = &mut *state;

        let now = Instant::now();
        let expired: Vec<(Instant, u64, String)> = state
            .expirations
            .range(..(now, u64::MAX))
            .map(|(&(when, id), key)| (when, id, key.clone()))
            .collect();

        for (when, id, key) in expired {
            state.entries.remove(&key);
            state.expirations.remove(&(when, id));
            Store::notify(&*state, StoreOp::Expire, &key, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn set_then_get_roundtrips() {
        let store = Store::new();
        store.set("foo".into(), "bar".into(), None);
        let (value, ttl) = store.get("foo");
        assert_eq!(value.as_deref(), Some("bar"));
        assert_eq!(ttl, None);
    }

    #[test]
    fn get_on_missing_key_is_absent() {
        let store = Store::new();
        assert_eq!(store.get("nope"), (None, None));
    }

    #[test]
    fn set_with_ttl_expires() {
        let store = Store::new();
        store.set("k".into(), "v".into(), Some(Duration::from_millis(0)));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(store.get("k"), (None, None));
    }

    #[test]
    fn re_set_without_ttl_clears_prior_expiry() {
        let store = Store::new();
        store.set("k".into(), "v".into(), Some(Duration::from_secs(60)));
        store.set("k".into(), "v2".into(), None);
        let (value, ttl) = store.get("k");
        assert_eq!(value.as_deref(), Some("v2"));
        assert_eq!(ttl, None);
    }

    #[test]
    fn delete_reports_presence() {
        let store = Store::new();
        assert!(!store.delete("k"));
        store.set("k".into(), "v".into(), None);
        assert!(store.delete("k"));
        assert!(!store.delete("k"));
    }

    #[test]
    fn keys_excludes_expired_entries() {
        let store = Store::new();
        store.set("a".into(), "1".into(), None);
        store.set("b".into(), "2".into(), Some(Duration::from_millis(0)));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(store.keys(), vec!["a".to_string()]);
    }

    #[test]
    fn persistable_entries_excludes_ttl_keys() {
        let store = Store::new();
        store.set("persists".into(), "1".into(), None);
        store.set("expires".into(), "2".into(), Some(Duration::from_secs(60)));
        let persisted = store.persistable_entries();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted.get("persists").map(String::as_str), Some("1"));
    }

    #[test]
    fn observer_distinguishes_set_with_ttl_from_plain_set() {
        let store = Store::new();
        let ops = Arc::new(Mutex::new(Vec::new()));
        let ops2 = ops.clone();
        store.register_observer(Box::new(move |event| {
            ops2.lock().unwrap().push(event.op);
        }));

        store.set("plain".into(), "1".into(), None);
        store.set("timed".into(), "2".into(), Some(Duration::from_secs(60)));

        assert_eq!(*ops.lock().unwrap(), vec![StoreOp::Set, StoreOp::SetWithTtl]);
    }

    #[test]
    fn observer_sees_exactly_one_expire_event() {
        let store = Store::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        store.register_observer(Box::new(move |event| {
            if event.op == StoreOp::Expire {
                count2.fetch_add(1, Ordering::SeqCst);
            }
        }));

        store.set("k".into(), "v".into(), Some(Duration::from_millis(0)));
        std::thread::sleep(Duration::from_millis(5));
        store.get("k");
        store.sweep();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
