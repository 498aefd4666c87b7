use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use futures_util::future::{join_all, BoxFuture};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{
    engine,
    expectation::{self, Expectation},
    multiset::EffectLog,
    store::lock,
    Action, ChannelId, Effect, EffectId, EffectKind, EffectOutcome, Error, Pattern, Reducer,
    Result, Saga, SagaContext, SagaMonitor, SimStore, TaskHandle,
};

/// Options for one run: how long to wait for the saga and all of its
/// asynchronous work to settle, and whether a timeout is logged.
///
/// A plain `Duration` (or a millisecond count) converts into options with
/// that timeout:
///
/// ```ignore
/// test.run_with(Duration::from_millis(50)).await?;
/// test.run_with(RunOptions::default().with_timeout(Duration::from_millis(50)).silent()).await?;
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub timeout: Duration,
    pub silence_timeout: bool,
}

impl RunOptions {
    /// Default settle timeout: 250ms.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(250);

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Suppress the warning emitted when the timeout forces cancellation.
    pub fn silent(mut self) -> Self {
        self.silence_timeout = true;
        self
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            timeout: Self::DEFAULT_TIMEOUT,
            silence_timeout: false,
        }
    }
}

impl From<Duration> for RunOptions {
    fn from(timeout: Duration) -> Self {
        RunOptions::default().with_timeout(timeout)
    }
}

impl From<u64> for RunOptions {
    fn from(millis: u64) -> Self {
        RunOptions::default().with_timeout(Duration::from_millis(millis))
    }
}

/// Test harness for running a saga against a simulated environment and
/// asserting on the effects it yields.
///
/// The tester intercepts every effect through the engine's monitoring
/// interface, records it in a per-kind multiset, and checks registered
/// expectations once the run settles. Configuration, scheduling, and
/// expectation methods chain; [`run`](Self::run) is terminal.
///
/// # Example
///
/// ```ignore
/// let mut test = SagaTester::new(|ctx| async move {
///     ctx.take("INCREMENT").await?;
///     ctx.put(Action::of("INCREMENTED")).await?;
///     Ok(Value::Null)
/// });
///
/// test.with_state(json!({ "count": 0 }))
///     .dispatch(Action::of("INCREMENT"))
///     .expect_take("INCREMENT")
///     .expect_put(Action::of("INCREMENTED"));
///
/// test.run().await?;
/// ```
pub struct SagaTester {
    saga: Option<Saga>,
    store: SimStore,
    shared: Arc<Mutex<Shared>>,
    expectations: Vec<Expectation>,
    main: Option<TaskHandle>,
    shutdown: Option<CancellationToken>,
}

#[derive(Default)]
struct Shared {
    log: EffectLog,
    pending_forks: HashMap<EffectId, Effect>,
    pending_channels: HashMap<EffectId, Pattern>,
    channel_patterns: HashMap<ChannelId, Pattern>,
    forked: Vec<TaskHandle>,
    open_promises: HashMap<EffectId, CancellationToken>,
    promise_latches: Vec<CancellationToken>,
    dirty: bool,
}

impl SagaTester {
    /// Create a tester for the given saga body.
    pub fn new<F, Fut>(saga: F) -> Self
    where
        F: FnOnce(SagaContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self::from_saga(Saga::new(saga))
    }

    pub fn from_saga(saga: Saga) -> Self {
        Self {
            saga: Some(saga),
            store: SimStore::new(),
            shared: Arc::new(Mutex::new(Shared::default())),
            expectations: Vec::new(),
            main: None,
            shutdown: None,
        }
    }

    // ==================== Environment Configuration ====================

    /// Set the simulated store's state wholesale.
    pub fn with_state(&mut self, state: impl Into<Value>) -> &mut Self {
        self.store.set_state(state.into());
        self
    }

    /// Install a reducer. The initial state is re-derived by feeding the
    /// init action through the reducer, discarding any previously set state.
    pub fn with_reducer<R>(&mut self, reducer: R) -> &mut Self
    where
        R: Fn(&Value, &Action) -> Value + Send + Sync + 'static,
    {
        self.store.set_reducer(Arc::new(reducer) as Reducer, None);
        self
    }

    /// Install a reducer together with an explicit initial state.
    pub fn with_reducer_and_state<R>(&mut self, reducer: R, initial: impl Into<Value>) -> &mut Self
    where
        R: Fn(&Value, &Action) -> Value + Send + Sync + 'static,
    {
        self.store
            .set_reducer(Arc::new(reducer) as Reducer, Some(initial.into()));
        self
    }

    /// Enqueue an action to be dispatched once a wait-for-action effect
    /// with a matching pattern occurs. Queued actions that never match stay
    /// in the queue; they are not dropped.
    pub fn dispatch(&mut self, action: Action) -> &mut Self {
        self.store.queue_action(action);
        self
    }

    // ==================== Expectations ====================

    /// Expect a wait for an action matching `pattern`.
    pub fn expect_take(&mut self, pattern: impl Into<Pattern>) -> &mut Self {
        self.expect(
            Effect::Take {
                pattern: Some(pattern.into()),
                channel: None,
                maybe: false,
            },
            "take",
        )
    }

    /// Expect an optional wait for an action matching `pattern`.
    pub fn expect_take_maybe(&mut self, pattern: impl Into<Pattern>) -> &mut Self {
        self.expect(
            Effect::Take {
                pattern: Some(pattern.into()),
                channel: None,
                maybe: true,
            },
            "take_maybe",
        )
    }

    /// Expect `action` to have been dispatched.
    pub fn expect_put(&mut self, action: Action) -> &mut Self {
        self.expect(
            Effect::Put {
                action,
                resolve: false,
            },
            "put",
        )
    }

    /// Expect `action` to have been dispatched with promise resolution.
    pub fn expect_put_resolve(&mut self, action: Action) -> &mut Self {
        self.expect(
            Effect::Put {
                action,
                resolve: true,
            },
            "put_resolve",
        )
    }

    /// Expect an invocation of `target` with exactly `args`.
    pub fn expect_call(&mut self, target: impl Into<String>, args: Vec<Value>) -> &mut Self {
        self.expect(
            Effect::Call {
                target: target.into(),
                args,
            },
            "call",
        )
    }

    /// Expect a callback-style invocation of `target` with exactly `args`.
    pub fn expect_cps(&mut self, target: impl Into<String>, args: Vec<Value>) -> &mut Self {
        self.expect(
            Effect::Cps {
                target: target.into(),
                args,
            },
            "cps",
        )
    }

    /// Expect a child saga forked under `target`.
    pub fn expect_fork(&mut self, target: impl Into<String>, args: Vec<Value>) -> &mut Self {
        self.expect(
            Effect::Fork {
                target: target.into(),
                args,
                detached: false,
            },
            "fork",
        )
    }

    /// Expect a detached child saga spawned under `target`.
    pub fn expect_spawn(&mut self, target: impl Into<String>, args: Vec<Value>) -> &mut Self {
        self.expect(
            Effect::Fork {
                target: target.into(),
                args,
                detached: true,
            },
            "spawn",
        )
    }

    /// Expect a state read through the selector registered as `name`.
    pub fn expect_select(&mut self, name: impl Into<String>) -> &mut Self {
        self.expect(
            Effect::Select {
                selector: name.into(),
            },
            "select",
        )
    }

    /// Expect a race over exactly these named arms, in order.
    pub fn expect_race<S: Into<String>>(&mut self, arms: Vec<(S, Effect)>) -> &mut Self {
        self.expect(
            Effect::Race {
                arms: arms.into_iter().map(|(n, e)| (n.into(), e)).collect(),
            },
            "race",
        )
    }

    /// Expect an action channel opened for `pattern`.
    pub fn expect_action_channel(&mut self, pattern: impl Into<Pattern>) -> &mut Self {
        self.expect(
            Effect::ActionChannel {
                pattern: pattern.into(),
            },
            "action_channel",
        )
    }

    fn expect(&mut self, effect: Effect, label: &str) -> &mut Self {
        self.expectations.push(Expectation::new(effect, label));
        self
    }

    // ==================== Lifecycle ====================

    /// Start the saga without waiting for it. Prefer [`run`](Self::run).
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyStarted`] on a second start.
    pub fn start(&mut self) -> Result {
        let saga = self.saga.take().ok_or(Error::AlreadyStarted)?;
        let monitor: Arc<dyn SagaMonitor> = Arc::new(EffectRecorder {
            shared: self.shared.clone(),
            store: self.store.clone(),
        });
        let handle = engine::start(saga, self.store.clone(), monitor);
        self.main = Some(handle.main);
        self.shutdown = Some(handle.shutdown);
        Ok(())
    }

    /// Start the saga, wait for it and all discovered asynchronous work to
    /// settle, then check the registered expectations.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnmetExpectation`] for the first expectation that
    /// cannot be matched, or [`Error::Timeout`] if the run had to be
    /// force-cancelled.
    pub async fn run(&mut self) -> Result {
        self.run_with(RunOptions::default()).await
    }

    /// Like [`run`](Self::run) with explicit options. Accepts a
    /// [`RunOptions`], a `Duration`, or a millisecond count.
    pub async fn run_with(&mut self, options: impl Into<RunOptions>) -> Result {
        self.start()?;
        self.stop(options).await
    }

    /// Wait for a started run to settle and check expectations.
    ///
    /// Settling is a fixed-point loop: the currently known completion
    /// futures (main task, forked tasks, external promises) are awaited
    /// together, and if new work was registered mid-wait the collection is
    /// recomputed rather than declaring completion with stale state. The
    /// whole loop races the configured timeout; if the timer fires first the
    /// main task is cancelled and the run fails with [`Error::Timeout`].
    pub async fn stop(&mut self, options: impl Into<RunOptions>) -> Result {
        let options = options.into();
        let main = self.main.clone().ok_or(Error::NotStarted)?;
        let shared = self.shared.clone();

        let settle = async {
            loop {
                let (forked, latches) = {
                    let mut shared = lock(&shared);
                    shared.dirty = false;
                    (shared.forked.clone(), shared.promise_latches.clone())
                };
                let mut waits: Vec<BoxFuture<'_, ()>> =
                    Vec::with_capacity(1 + forked.len() + latches.len());
                waits.push(Box::pin(main.finished()));
                for task in &forked {
                    waits.push(Box::pin(task.finished()));
                }
                for latch in &latches {
                    waits.push(Box::pin(latch.cancelled()));
                }
                join_all(waits).await;
                if !lock(&shared).dirty {
                    break;
                }
            }
        };

        let outcome = match tokio::time::timeout(options.timeout, settle).await {
            Ok(()) => {
                let expectations = std::mem::take(&mut self.expectations);
                expectation::check_expectations(&mut lock(&self.shared).log, expectations)
            }
            Err(_) => {
                main.cancel();
                if !options.silence_timeout {
                    tracing::warn!(
                        timeout = ?options.timeout,
                        "saga did not settle before the timeout; cancelling the main task"
                    );
                }
                Err(Error::Timeout(options.timeout))
            }
        };

        if let Some(shutdown) = &self.shutdown {
            shutdown.cancel();
        }
        outcome
    }

    // ==================== Inspection ====================

    /// The effects of `kind` recorded so far, in trigger order. Expectation
    /// checking removes matched effects, so after a successful run this is
    /// what was witnessed but never expected.
    pub fn effects_of(&self, kind: EffectKind) -> Vec<Effect> {
        lock(&self.shared).log.effects_of(kind)
    }

    /// A snapshot of the simulated store's current state.
    pub fn state(&self) -> Value {
        self.store.get_state()
    }

    /// Actions still waiting in the pre-scheduled queue.
    pub fn queued_actions(&self) -> Vec<Action> {
        self.store.queued_actions()
    }

    /// Handle to the main task, once started.
    pub fn main_task(&self) -> Option<TaskHandle> {
        self.main.clone()
    }
}

impl std::fmt::Debug for SagaTester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaTester")
            .field("started", &self.main.is_some())
            .field("expectations", &self.expectations.len())
            .finish_non_exhaustive()
    }
}

/// The harness's monitor: records every effect, maintains the correlation
/// tables, and feeds queued actions to matching waits.
struct EffectRecorder {
    shared: Arc<Mutex<Shared>>,
    store: SimStore,
}

impl EffectRecorder {
    fn settle_promise(&self, id: EffectId) {
        let mut shared = lock(&self.shared);
        shared.pending_forks.remove(&id);
        shared.pending_channels.remove(&id);
        if let Some(latch) = shared.open_promises.remove(&id) {
            latch.cancel();
        }
    }
}

impl SagaMonitor for EffectRecorder {
    fn effect_triggered(&self, id: EffectId, effect: &Effect) {
        if effect.kind() == EffectKind::None {
            return;
        }

        let take_pattern = {
            let mut shared = lock(&self.shared);
            shared.log.record(effect.clone());
            match effect {
                Effect::Fork { .. } => {
                    shared.pending_forks.insert(id, effect.clone());
                    None
                }
                Effect::ActionChannel { pattern } => {
                    shared.pending_channels.insert(id, pattern.clone());
                    None
                }
                Effect::Promise { .. } => {
                    let latch = CancellationToken::new();
                    shared.open_promises.insert(id, latch.clone());
                    shared.promise_latches.push(latch);
                    shared.dirty = true;
                    None
                }
                Effect::Take {
                    pattern, channel, ..
                } => pattern.clone().or_else(|| {
                    channel
                        .as_ref()
                        .and_then(|c| shared.channel_patterns.get(c).cloned())
                }),
                _ => None,
            }
        };

        if let Some(pattern) = take_pattern {
            if let Some((before, matched)) = self.store.consume_queued(&pattern) {
                // Earlier non-matching actions advance state immediately, as
                // side effects of other in-flight code; the matching action is
                // deliberately dispatched one scheduler turn later.
                for action in &before {
                    self.store.dispatch(action);
                }
                let store = self.store.clone();
                tokio::spawn(async move {
                    store.dispatch(&matched);
                });
            }
        }
    }

    fn effect_resolved(&self, id: EffectId, outcome: &EffectOutcome) {
        let mut shared = lock(&self.shared);
        if shared.pending_forks.remove(&id).is_some() {
            if let EffectOutcome::Task(handle) = outcome {
                shared.forked.push(handle.clone());
                shared.dirty = true;
            }
        } else if let Some(pattern) = shared.pending_channels.remove(&id) {
            if let EffectOutcome::Channel(channel) = outcome {
                shared.channel_patterns.insert(channel.id(), pattern);
            }
        }
        if let Some(latch) = shared.open_promises.remove(&id) {
            latch.cancel();
        }
    }

    fn effect_rejected(&self, id: EffectId, _error: &Error) {
        self.settle_promise(id);
    }

    fn effect_cancelled(&self, id: EffectId) {
        self.settle_promise(id);
    }
}
