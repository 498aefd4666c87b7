use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use serde::Serialize;
use tokio::sync::Notify;

use crate::{
    store::{lock, SubscriptionId},
    Action, Pattern, SimStore,
};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies an open action channel.
///
/// The id is what a wait-for-action descriptor carries when it waits on a
/// channel, keeping descriptors copyable and deeply comparable while the
/// channel instance itself holds the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ChannelId(u64);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "channel-{}", self.0)
    }
}

/// A subscription endpoint created by an open-channel effect.
///
/// From creation on, every action dispatched into the store whose kind
/// matches the channel's pattern is buffered, so a later wait on the channel
/// sees actions dispatched while the saga was busy elsewhere. Cloning shares
/// the same buffer; the store subscription is dropped with the last clone.
#[derive(Clone)]
pub struct ActionChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    id: ChannelId,
    pattern: Pattern,
    buffer: Arc<Mutex<VecDeque<Action>>>,
    notify: Arc<Notify>,
    store: SimStore,
    subscription: SubscriptionId,
}

impl ActionChannel {
    /// Open a channel on the store, buffering actions that match `pattern`.
    pub(crate) fn open(store: &SimStore, pattern: Pattern) -> Self {
        let id = ChannelId(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed));
        let buffer: Arc<Mutex<VecDeque<Action>>> = Arc::new(Mutex::new(VecDeque::new()));
        let notify = Arc::new(Notify::new());

        let subscription = {
            let pattern = pattern.clone();
            let buffer = buffer.clone();
            let notify = notify.clone();
            store.subscribe(move |action| {
                if pattern.matches(action) {
                    lock(&buffer).push_back(action.clone());
                    notify.notify_waiters();
                }
            })
        };

        Self {
            inner: Arc::new(ChannelInner {
                id,
                pattern,
                buffer,
                notify,
                store: store.clone(),
                subscription,
            }),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    /// The pattern this channel was opened for.
    pub fn pattern(&self) -> &Pattern {
        &self.inner.pattern
    }

    /// Remove and return the oldest buffered action, waiting if the buffer
    /// is empty.
    pub async fn take(&self) -> Action {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register for a wakeup before checking the buffer; notify_waiters
            // only reaches enabled waiters, so a dispatch landing between the
            // check and the await would otherwise be missed.
            notified.as_mut().enable();
            if let Some(action) = lock(&self.inner.buffer).pop_front() {
                return action;
            }
            notified.await;
        }
    }

    /// The oldest buffered action, if any, without waiting.
    pub fn try_take(&self) -> Option<Action> {
        lock(&self.inner.buffer).pop_front()
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        self.store.unsubscribe(self.subscription);
    }
}

impl std::fmt::Debug for ActionChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionChannel")
            .field("id", &self.inner.id)
            .field("pattern", &self.inner.pattern)
            .field("buffered", &lock(&self.inner.buffer).len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_buffers_matching_actions_in_order() {
        let store = SimStore::new();
        let channel = ActionChannel::open(&store, "TICK".into());

        store.dispatch(&Action::of("TICK"));
        store.dispatch(&Action::of("OTHER"));
        store.dispatch(&Action::of("TICK").with_payload(2));

        assert_eq!(channel.take().await, Action::of("TICK"));
        assert_eq!(channel.take().await, Action::of("TICK").with_payload(2));
        assert!(channel.try_take().is_none());
    }

    #[tokio::test]
    async fn take_waits_for_a_future_dispatch() {
        let store = SimStore::new();
        let channel = ActionChannel::open(&store, "TICK".into());

        let waiter = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.take().await })
        };
        tokio::task::yield_now().await;
        store.dispatch(&Action::of("TICK"));

        assert_eq!(waiter.await.unwrap(), Action::of("TICK"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dispatch_on_another_worker_always_wakes_a_waiting_taker() {
        let store = SimStore::new();
        let channel = ActionChannel::open(&store, "TICK".into());

        for _ in 0..200 {
            let taker = {
                let channel = channel.clone();
                tokio::spawn(async move { channel.take().await })
            };
            let dispatcher = {
                let store = store.clone();
                tokio::spawn(async move {
                    store.dispatch(&Action::of("TICK"));
                })
            };

            assert_eq!(taker.await.unwrap(), Action::of("TICK"));
            dispatcher.await.unwrap();
        }
    }

    #[tokio::test]
    async fn dropping_the_channel_unsubscribes_from_the_store() {
        let store = SimStore::new();
        {
            let _channel = ActionChannel::open(&store, Pattern::Any);
            assert!(format!("{store:?}").contains("listeners: 1"));
        }
        assert!(format!("{store:?}").contains("listeners: 0"));
    }
}
