use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;

use crate::{Action, Pattern};

/// Produces the next state from the current state and an incoming action.
pub type Reducer = Arc<dyn Fn(&Value, &Action) -> Value + Send + Sync>;

type Listener = Arc<dyn Fn(&Action) + Send + Sync>;

/// Identifies one registered store listener so it can be removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// The simulated environment a saga runs against: a minimal store with
/// owned state, a pluggable reducer, synchronous subscribers, and a queue of
/// pre-scheduled actions.
///
/// The store is the only owner of its state and listener list; everything
/// else reads state through [`get_state`](Self::get_state) or feeds it
/// through [`dispatch`](Self::dispatch). Cloning the handle shares the same
/// underlying store.
#[derive(Clone)]
pub struct SimStore {
    inner: Arc<Mutex<StoreInner>>,
}

struct StoreInner {
    state: Value,
    reducer: Reducer,
    listeners: Vec<(SubscriptionId, Listener)>,
    next_subscription: u64,
    queued: Vec<Action>,
}

impl Default for SimStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SimStore {
    /// Create a store with null state and the identity reducer.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreInner {
                state: Value::Null,
                reducer: Arc::new(|state, _| state.clone()),
                listeners: Vec::new(),
                next_subscription: 0,
                queued: Vec::new(),
            })),
        }
    }

    /// A snapshot of the current state. The store's own copy cannot be
    /// mutated through the returned value.
    pub fn get_state(&self) -> Value {
        lock(&self.inner).state.clone()
    }

    /// Replace the state wholesale.
    pub fn set_state(&self, state: Value) {
        lock(&self.inner).state = state;
    }

    /// Install a reducer. With an explicit `initial` state, that state is
    /// taken as-is; otherwise the initial state is re-derived by feeding the
    /// init action through the new reducer, discarding any prior state.
    pub fn set_reducer(&self, reducer: Reducer, initial: Option<Value>) {
        let mut inner = lock(&self.inner);
        inner.state = match initial {
            Some(state) => state,
            None => reducer(&Value::Null, &Action::init()),
        };
        inner.reducer = reducer;
    }

    /// Run the reducer over the current state and `action`, replace the
    /// state, then synchronously notify every active subscriber with the
    /// action. Returns the dispatched action.
    pub fn dispatch(&self, action: &Action) -> Action {
        let listeners: Vec<Listener> = {
            let mut inner = lock(&self.inner);
            inner.state = (inner.reducer)(&inner.state, action);
            inner.listeners.iter().map(|(_, l)| l.clone()).collect()
        };
        // Listeners run outside the lock; a listener is allowed to dispatch.
        for listener in listeners {
            listener(action);
        }
        action.clone()
    }

    /// Register a listener invoked synchronously on every dispatch.
    pub fn subscribe(&self, listener: impl Fn(&Action) + Send + Sync + 'static) -> SubscriptionId {
        let mut inner = lock(&self.inner);
        let id = SubscriptionId(inner.next_subscription);
        inner.next_subscription += 1;
        inner.listeners.push((id, Arc::new(listener)));
        id
    }

    /// Remove exactly the listener registered under `id`. Removing an
    /// already-removed listener is a no-op.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        lock(&self.inner).listeners.retain(|(sid, _)| *sid != id);
    }

    /// Append an action to the pending queue. Queued actions are only
    /// consumed when a wait-for-action effect's pattern matches them; they
    /// are never silently dropped.
    pub fn queue_action(&self, action: Action) {
        lock(&self.inner).queued.push(action);
    }

    /// The actions still waiting in the queue, in queue order.
    pub fn queued_actions(&self) -> Vec<Action> {
        lock(&self.inner).queued.clone()
    }

    /// Scan the queue for the first action whose kind matches `pattern`.
    /// When found at position `i`, remove entries `0..=i` and return the
    /// prefix `0..i` together with the matching action. When nothing
    /// matches, the queue is left untouched.
    pub(crate) fn consume_queued(&self, pattern: &Pattern) -> Option<(Vec<Action>, Action)> {
        let mut inner = lock(&self.inner);
        let index = inner.queued.iter().position(|a| pattern.matches(a))?;
        let mut consumed: Vec<Action> = inner.queued.drain(0..=index).collect();
        let matched = consumed.pop()?;
        Some((consumed, matched))
    }
}

impl std::fmt::Debug for SimStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = lock(&self.inner);
        f.debug_struct("SimStore")
            .field("state", &inner.state)
            .field("listeners", &inner.listeners.len())
            .field("queued", &inner.queued.len())
            .finish_non_exhaustive()
    }
}

/// Lock a mutex, recovering the guard if a holder panicked mid-update.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_reducer() -> Reducer {
        Arc::new(|state, action| match action.kind() {
            "INC" => json!({ "count": state["count"].as_i64().unwrap_or(0) + 1 }),
            _ => {
                if state.is_null() {
                    json!({ "count": 0 })
                } else {
                    state.clone()
                }
            }
        })
    }

    #[test]
    fn dispatch_runs_reducer_and_replaces_state() {
        let store = SimStore::new();
        store.set_reducer(counting_reducer(), None);
        assert_eq!(store.get_state(), json!({ "count": 0 }));

        store.dispatch(&Action::of("INC"));
        store.dispatch(&Action::of("INC"));
        assert_eq!(store.get_state(), json!({ "count": 2 }));
    }

    #[test]
    fn installing_reducer_without_initial_state_discards_prior_state() {
        let store = SimStore::new();
        store.set_state(json!({ "stale": true }));
        store.set_reducer(counting_reducer(), None);
        assert_eq!(store.get_state(), json!({ "count": 0 }));
    }

    #[test]
    fn installing_reducer_with_initial_state_keeps_it() {
        let store = SimStore::new();
        store.set_reducer(counting_reducer(), Some(json!({ "count": 10 })));
        assert_eq!(store.get_state(), json!({ "count": 10 }));
        store.dispatch(&Action::of("INC"));
        assert_eq!(store.get_state(), json!({ "count": 11 }));
    }

    #[test]
    fn default_reducer_is_identity() {
        let store = SimStore::new();
        store.set_state(json!({ "fixed": 1 }));
        store.dispatch(&Action::of("ANYTHING"));
        assert_eq!(store.get_state(), json!({ "fixed": 1 }));
    }

    #[test]
    fn subscribers_are_notified_synchronously_and_unsubscribe_is_idempotent() {
        let store = SimStore::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let seen2 = seen.clone();
        let id = store.subscribe(move |_| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });

        store.dispatch(&Action::of("A"));
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        store.unsubscribe(id);
        store.unsubscribe(id); // no-op
        store.dispatch(&Action::of("A"));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn consume_queued_returns_prefix_and_match() {
        let store = SimStore::new();
        store.queue_action(Action::of("A"));
        store.queue_action(Action::of("B"));
        store.queue_action(Action::of("C"));

        let (prefix, matched) = store.consume_queued(&"B".into()).unwrap();
        assert_eq!(prefix, vec![Action::of("A")]);
        assert_eq!(matched, Action::of("B"));
        assert_eq!(store.queued_actions(), vec![Action::of("C")]);
    }

    #[test]
    fn consume_queued_leaves_queue_untouched_on_miss() {
        let store = SimStore::new();
        store.queue_action(Action::of("A"));
        assert!(store.consume_queued(&"Z".into()).is_none());
        assert_eq!(store.queued_actions(), vec![Action::of("A")]);
    }
}
