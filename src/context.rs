use std::{future::Future, time::Duration};

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::{
    engine::{Msg, Op, Submit},
    Action, ActionChannel, Effect, EffectOutcome, Error, Pattern, Result, TaskHandle,
};

/// A saga body: an async closure over a [`SagaContext`].
///
/// Each awaited context call is a suspension point that yields exactly one
/// effect descriptor to the engine. Build one with [`Saga::new`], or pass a
/// closure directly to APIs that accept `impl FnOnce(SagaContext) -> Fut`.
pub struct Saga {
    body: Box<dyn FnOnce(SagaContext) -> BoxFuture<'static, Result<Value>> + Send>,
}

impl Saga {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce(SagaContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            body: Box::new(move |ctx| Box::pin(f(ctx))),
        }
    }

    pub(crate) fn run(self, ctx: SagaContext) -> BoxFuture<'static, Result<Value>> {
        (self.body)(ctx)
    }
}

impl std::fmt::Debug for Saga {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Saga").finish_non_exhaustive()
    }
}

/// Completion handle for a callback-style invocation.
///
/// The operation receives it from [`SagaContext::cps`] and calls exactly one
/// of [`succeed`](Self::succeed) or [`fail`](Self::fail) when done. Dropping
/// it without calling either leaves the effect cancelled.
#[derive(Debug)]
pub struct CpsDone {
    pub(crate) tx: oneshot::Sender<Result<Value>>,
}

impl CpsDone {
    pub fn succeed(self, value: impl Into<Value>) {
        let _ = self.tx.send(Ok(value.into()));
    }

    pub fn fail(self, error: Error) {
        let _ = self.tx.send(Err(error));
    }
}

/// One named competitor in a race effect.
///
/// Arms carry both the descriptor (pure data, what gets recorded and
/// matched) and the behavior the engine performs for that arm.
pub struct RaceArm {
    pub(crate) effect: Effect,
    pub(crate) op: Op,
}

impl RaceArm {
    /// Race arm that waits for an action matching `pattern`.
    pub fn take(pattern: impl Into<Pattern>) -> Self {
        let pattern = pattern.into();
        Self {
            effect: Effect::Take {
                pattern: Some(pattern.clone()),
                channel: None,
                maybe: false,
            },
            op: Op::Take {
                pattern: Some(pattern),
                channel: None,
                maybe: false,
            },
        }
    }

    /// Race arm that invokes a named operation.
    pub fn call<F>(target: impl Into<String>, args: Vec<Value>, operation: F) -> Self
    where
        F: Future<Output = Result<Value>> + Send + 'static,
    {
        let target = target.into();
        Self {
            effect: Effect::Call {
                target: target.clone(),
                args,
            },
            op: Op::Call {
                fut: Box::pin(operation),
            },
        }
    }

    /// Race arm that resolves after `duration`.
    pub fn delay(duration: Duration) -> Self {
        Self::call(
            "delay",
            vec![Value::from(duration.as_millis() as u64)],
            async move {
                tokio::time::sleep(duration).await;
                Ok(Value::Null)
            },
        )
    }

    /// The arm's effect descriptor, as it will be recorded inside the race.
    pub fn descriptor(&self) -> &Effect {
        &self.effect
    }
}

impl std::fmt::Debug for RaceArm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaceArm").field("effect", &self.effect).finish()
    }
}

/// Engine-provided handle a saga uses to yield effects.
///
/// Every method builds one effect descriptor, submits it to the engine, and
/// suspends until the engine resolves it. The context is cheap to clone and
/// can be moved into helper functions; clones submit on behalf of the same
/// task.
///
/// # Example
///
/// ```ignore
/// let mut test = SagaTester::new(|ctx| async move {
///     let order = ctx.take("ORDER_PLACED").await?;
///     let total = ctx
///         .call("price", vec![order.payload().clone()], async { Ok(json!(42)) })
///         .await?;
///     ctx.put(Action::of("ORDER_PRICED").with_payload(total)).await?;
///     Ok(Value::Null)
/// });
/// ```
#[derive(Clone)]
pub struct SagaContext {
    sender: mpsc::UnboundedSender<Msg>,
    token: CancellationToken,
}

impl SagaContext {
    pub(crate) fn new(sender: mpsc::UnboundedSender<Msg>, token: CancellationToken) -> Self {
        Self { sender, token }
    }

    /// Wait for an action whose kind matches `pattern`.
    pub async fn take(&self, pattern: impl Into<Pattern>) -> Result<Action> {
        let pattern = pattern.into();
        let effect = Effect::Take {
            pattern: Some(pattern.clone()),
            channel: None,
            maybe: false,
        };
        let op = Op::Take {
            pattern: Some(pattern),
            channel: None,
            maybe: false,
        };
        into_action(self.submit(effect, op).await?)
    }

    /// Like [`take`](Self::take), but resolves with [`Action::end`] instead
    /// of pending forever if the task is cancelled while the wait is
    /// outstanding.
    pub async fn take_maybe(&self, pattern: impl Into<Pattern>) -> Result<Action> {
        let pattern = pattern.into();
        let effect = Effect::Take {
            pattern: Some(pattern.clone()),
            channel: None,
            maybe: true,
        };
        let op = Op::Take {
            pattern: Some(pattern),
            channel: None,
            maybe: true,
        };
        into_action(self.submit(effect, op).await?)
    }

    /// Wait for the next action buffered by `channel`.
    pub async fn take_from(&self, channel: &ActionChannel) -> Result<Action> {
        let effect = Effect::Take {
            pattern: None,
            channel: Some(channel.id()),
            maybe: false,
        };
        let op = Op::Take {
            pattern: None,
            channel: Some(channel.clone()),
            maybe: false,
        };
        into_action(self.submit(effect, op).await?)
    }

    /// Dispatch an action into the simulated store.
    pub async fn put(&self, action: Action) -> Result<Action> {
        let effect = Effect::Put {
            action: action.clone(),
            resolve: false,
        };
        into_action(self.submit(effect, Op::Put { action }).await?)
    }

    /// Dispatch an action and wait for the dispatch result before resuming.
    pub async fn put_resolve(&self, action: Action) -> Result<Action> {
        let effect = Effect::Put {
            action: action.clone(),
            resolve: true,
        };
        into_action(self.submit(effect, Op::Put { action }).await?)
    }

    /// Invoke a named operation. The descriptor records `target` and `args`;
    /// `operation` is what actually runs.
    pub async fn call<F>(
        &self,
        target: impl Into<String>,
        args: Vec<Value>,
        operation: F,
    ) -> Result<Value>
    where
        F: Future<Output = Result<Value>> + Send + 'static,
    {
        let effect = Effect::Call {
            target: target.into(),
            args,
        };
        let op = Op::Call {
            fut: Box::pin(operation),
        };
        into_value(self.submit(effect, op).await?)
    }

    /// Suspend for `duration`. Recorded as a `call` to the `delay` target
    /// with the duration in milliseconds as its argument.
    pub async fn delay(&self, duration: Duration) -> Result<()> {
        self.call(
            "delay",
            vec![Value::from(duration.as_millis() as u64)],
            async move {
                tokio::time::sleep(duration).await;
                Ok(Value::Null)
            },
        )
        .await?;
        Ok(())
    }

    /// Invoke a named callback-style operation. `start` receives a
    /// [`CpsDone`] and reports completion through it.
    pub async fn cps<F>(
        &self,
        target: impl Into<String>,
        args: Vec<Value>,
        start: F,
    ) -> Result<Value>
    where
        F: FnOnce(CpsDone) + Send + 'static,
    {
        let effect = Effect::Cps {
            target: target.into(),
            args,
        };
        let op = Op::Cps {
            start: Box::new(start),
        };
        into_value(self.submit(effect, op).await?)
    }

    /// Start a named child saga running concurrently. The returned
    /// [`TaskHandle`] settles when the child finishes; cancelling the parent
    /// cancels the child.
    pub async fn fork<F, Fut>(
        &self,
        target: impl Into<String>,
        args: Vec<Value>,
        child: F,
    ) -> Result<TaskHandle>
    where
        F: FnOnce(SagaContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let target = target.into();
        let effect = Effect::Fork {
            target: target.clone(),
            args,
            detached: false,
        };
        let op = Op::Fork {
            name: target,
            saga: Saga::new(child),
            detached: false,
        };
        into_task(self.submit(effect, op).await?)
    }

    /// Like [`fork`](Self::fork), but the child is detached: it survives
    /// cancellation of its parent.
    pub async fn spawn<F, Fut>(
        &self,
        target: impl Into<String>,
        args: Vec<Value>,
        child: F,
    ) -> Result<TaskHandle>
    where
        F: FnOnce(SagaContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let target = target.into();
        let effect = Effect::Fork {
            target: target.clone(),
            args,
            detached: true,
        };
        let op = Op::Fork {
            name: target,
            saga: Saga::new(child),
            detached: true,
        };
        into_task(self.submit(effect, op).await?)
    }

    /// Read a value out of the simulated state. The descriptor records the
    /// selector's name; `selector` runs against a state snapshot.
    pub async fn select<F>(&self, name: impl Into<String>, selector: F) -> Result<Value>
    where
        F: FnOnce(&Value) -> Value + Send + 'static,
    {
        let effect = Effect::Select {
            selector: name.into(),
        };
        let op = Op::Select {
            select: Box::new(selector),
        };
        into_value(self.submit(effect, op).await?)
    }

    /// Open a channel buffering every action that matches `pattern` from
    /// this point on.
    pub async fn action_channel(&self, pattern: impl Into<Pattern>) -> Result<ActionChannel> {
        let pattern = pattern.into();
        let effect = Effect::ActionChannel {
            pattern: pattern.clone(),
        };
        into_channel(self.submit(effect, Op::OpenChannel { pattern }).await?)
    }

    /// Run several named sub-effects; the first to resolve wins and the
    /// rest are abandoned. Returns the winning arm's name and outcome.
    pub async fn race(
        &self,
        arms: Vec<(impl Into<String>, RaceArm)>,
    ) -> Result<(String, EffectOutcome)> {
        let mut descriptors = Vec::with_capacity(arms.len());
        let mut ops = Vec::with_capacity(arms.len());
        for (name, arm) in arms {
            let name = name.into();
            descriptors.push((name.clone(), arm.effect));
            ops.push((name, arm.op));
        }
        let effect = Effect::Race { arms: descriptors };
        match self.submit(effect, Op::Race { arms: ops }).await? {
            EffectOutcome::Race { winner, outcome } => Ok((winner, *outcome)),
            other => Err(Error::internal(format!(
                "race resolved with non-race outcome {other:?}"
            ))),
        }
    }

    /// Await an externally supplied future. Recorded as an external-promise
    /// effect under `label`; the run will not settle until it completes.
    pub async fn external<F>(&self, label: impl Into<String>, promise: F) -> Result<Value>
    where
        F: Future<Output = Result<Value>> + Send + 'static,
    {
        let effect = Effect::Promise {
            label: label.into(),
        };
        let op = Op::External {
            fut: Box::pin(promise),
        };
        into_value(self.submit(effect, op).await?)
    }

    async fn submit(&self, effect: Effect, op: Op) -> Result<EffectOutcome> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(Msg::Submit(Submit {
                effect,
                op,
                token: self.token.clone(),
                reply: reply_tx,
            }))
            .map_err(|_| Error::EngineClosed)?;
        reply_rx.await.map_err(|_| Error::Cancelled)?
    }
}

impl std::fmt::Debug for SagaContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaContext")
            .field("cancelled", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}

fn into_action(outcome: EffectOutcome) -> Result<Action> {
    match outcome {
        EffectOutcome::Action(action) => Ok(action),
        other => Err(mismatch("action", &other)),
    }
}

fn into_value(outcome: EffectOutcome) -> Result<Value> {
    match outcome {
        EffectOutcome::Value(value) => Ok(value),
        other => Err(mismatch("value", &other)),
    }
}

fn into_task(outcome: EffectOutcome) -> Result<TaskHandle> {
    match outcome {
        EffectOutcome::Task(handle) => Ok(handle),
        other => Err(mismatch("task", &other)),
    }
}

fn into_channel(outcome: EffectOutcome) -> Result<ActionChannel> {
    match outcome {
        EffectOutcome::Channel(channel) => Ok(channel),
        other => Err(mismatch("channel", &other)),
    }
}

fn mismatch(wanted: &str, got: &EffectOutcome) -> Error {
    Error::internal(format!("effect resolved with non-{wanted} outcome {got:?}"))
}
