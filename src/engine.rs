//! Minimal effect-execution engine.
//!
//! The engine drives a saga body, performing each yielded effect against the
//! simulated store and announcing every lifecycle step through a
//! [`SagaMonitor`]. A single driver loop serializes all observations:
//! effects are triggered in exactly the order they were yielded, and no two
//! monitor callbacks run concurrently for the same run.

use std::sync::{Arc, Mutex};

use futures_util::future::{select_all, BoxFuture};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::{
    store::lock, Action, ActionChannel, CpsDone, Effect, EffectId, EffectOutcome, Error, Pattern,
    Result, Saga, SagaContext, SagaMonitor, SimStore, TaskHandle,
};

/// How the engine performs one submitted effect. The pure-data descriptor
/// travels separately; `Op` carries the behavior.
pub(crate) enum Op {
    Take {
        pattern: Option<Pattern>,
        channel: Option<ActionChannel>,
        maybe: bool,
    },
    Put {
        action: Action,
    },
    Call {
        fut: BoxFuture<'static, Result<Value>>,
    },
    Cps {
        start: Box<dyn FnOnce(CpsDone) + Send>,
    },
    Fork {
        name: String,
        saga: Saga,
        detached: bool,
    },
    Select {
        select: Box<dyn FnOnce(&Value) -> Value + Send>,
    },
    OpenChannel {
        pattern: Pattern,
    },
    Race {
        arms: Vec<(String, Op)>,
    },
    External {
        fut: BoxFuture<'static, Result<Value>>,
    },
}

pub(crate) struct Submit {
    pub effect: Effect,
    pub op: Op,
    pub token: CancellationToken,
    pub reply: oneshot::Sender<Result<EffectOutcome>>,
}

pub(crate) enum Msg {
    Submit(Submit),
    Settled {
        id: EffectId,
        result: Result<EffectOutcome>,
        cancelled: bool,
        reply: oneshot::Sender<Result<EffectOutcome>>,
    },
}

/// Handle to a started run: the main task plus a shutdown token that stops
/// the driver loop and everything under it.
pub(crate) struct RunHandle {
    pub main: TaskHandle,
    pub shutdown: CancellationToken,
}

/// Start `saga` against `store`, observing its lifecycle through `monitor`.
pub(crate) fn start(saga: Saga, store: SimStore, monitor: Arc<dyn SagaMonitor>) -> RunHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let shutdown = CancellationToken::new();
    let main_token = shutdown.child_token();
    let main = TaskHandle::new("main", main_token.clone());

    let mut driver = Driver {
        rx,
        tx: tx.clone(),
        store,
        monitor,
        shutdown: shutdown.clone(),
        next_id: 1,
    };
    tokio::spawn(async move { driver.run().await });

    spawn_saga(saga, SagaContext::new(tx, main_token), main.clone());

    RunHandle { main, shutdown }
}

// Cancellation is observed at suspension points: every pending effect
// performer watches the task's token, so a cancelled task's in-flight wait
// resolves (with an error, or with the terminal action for optional waits)
// and the body runs to its own end. Racing the token against the body here
// would tear the task down before it could see that terminal resolution.
fn spawn_saga(saga: Saga, ctx: SagaContext, handle: TaskHandle) {
    tokio::spawn(async move {
        let result = saga.run(ctx).await;
        if let Err(error) = &result {
            tracing::debug!(task = handle.name(), %error, "saga task settled with error");
        }
        handle.complete(result);
    });
}

type Pending = BoxFuture<'static, (Result<EffectOutcome>, bool)>;

enum Plan {
    Immediate(Op),
    Pending(Pending),
}

struct Driver {
    rx: mpsc::UnboundedReceiver<Msg>,
    tx: mpsc::UnboundedSender<Msg>,
    store: SimStore,
    monitor: Arc<dyn SagaMonitor>,
    shutdown: CancellationToken,
    next_id: u64,
}

impl Driver {
    async fn run(&mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                msg = self.rx.recv() => match msg {
                    Some(Msg::Submit(submit)) => self.handle_submit(submit),
                    Some(Msg::Settled { id, result, cancelled, reply }) => {
                        match &result {
                            Ok(outcome) => self.monitor.effect_resolved(id, outcome),
                            Err(_) if cancelled => self.monitor.effect_cancelled(id),
                            Err(error) => self.monitor.effect_rejected(id, error),
                        }
                        let _ = reply.send(result);
                    }
                    None => break,
                },
            }
        }
    }

    fn handle_submit(&mut self, submit: Submit) {
        let Submit {
            effect,
            op,
            token,
            reply,
        } = submit;
        let id = EffectId::from(self.next_id);
        self.next_id += 1;

        // Waiters are installed before the trigger observation so that a
        // dispatch scheduled by an observer cannot slip past the wait.
        let plan = self.prepare(op, &token);
        self.monitor.effect_triggered(id, &effect);

        match plan {
            Plan::Immediate(op) => {
                let result = self.perform_immediate(op, &token);
                match &result {
                    Ok(outcome) => self.monitor.effect_resolved(id, outcome),
                    Err(error) => self.monitor.effect_rejected(id, error),
                }
                let _ = reply.send(result);
            }
            Plan::Pending(fut) => {
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let (result, cancelled) = fut.await;
                    let _ = tx.send(Msg::Settled {
                        id,
                        result,
                        cancelled,
                        reply,
                    });
                });
            }
        }
    }

    fn prepare(&self, op: Op, token: &CancellationToken) -> Plan {
        match op {
            Op::Take {
                pattern,
                channel,
                maybe,
            } => Plan::Pending(self.prepare_take(pattern, channel, maybe, token.clone())),
            Op::Call { fut } | Op::External { fut } => {
                Plan::Pending(drive_future(fut, token.clone()))
            }
            Op::Cps { start } => Plan::Pending(drive_cps(start, token.clone())),
            Op::Race { arms } => Plan::Pending(self.prepare_race(arms, token.clone())),
            immediate => Plan::Immediate(immediate),
        }
    }

    fn perform_immediate(&mut self, op: Op, token: &CancellationToken) -> Result<EffectOutcome> {
        match op {
            Op::Put { action } => Ok(EffectOutcome::Action(self.store.dispatch(&action))),
            Op::Select { select } => Ok(EffectOutcome::Value(select(&self.store.get_state()))),
            Op::OpenChannel { pattern } => Ok(EffectOutcome::Channel(ActionChannel::open(
                &self.store,
                pattern,
            ))),
            Op::Fork {
                name,
                saga,
                detached,
            } => {
                let child_token = if detached {
                    self.shutdown.child_token()
                } else {
                    token.child_token()
                };
                let handle = TaskHandle::new(name, child_token.clone());
                spawn_saga(
                    saga,
                    SagaContext::new(self.tx.clone(), child_token),
                    handle.clone(),
                );
                Ok(EffectOutcome::Task(handle))
            }
            _ => Err(Error::internal("async op routed to immediate performer")),
        }
    }

    fn prepare_take(
        &self,
        pattern: Option<Pattern>,
        channel: Option<ActionChannel>,
        maybe: bool,
        token: CancellationToken,
    ) -> Pending {
        if let Some(channel) = channel {
            return Box::pin(async move {
                tokio::select! {
                    action = channel.take() => (Ok(EffectOutcome::Action(action)), false),
                    _ = token.cancelled() => cancelled_take(maybe),
                }
            });
        }

        let pattern = pattern.unwrap_or(Pattern::Any);
        let (action_tx, action_rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(action_tx)));
        let store = self.store.clone();
        let subscription = store.subscribe(move |action| {
            if pattern.matches(action) {
                if let Some(tx) = lock(&slot).take() {
                    let _ = tx.send(action.clone());
                }
            }
        });

        Box::pin(async move {
            let result = tokio::select! {
                received = action_rx => match received {
                    Ok(action) => (Ok(EffectOutcome::Action(action)), false),
                    Err(_) => cancelled_take(maybe),
                },
                _ = token.cancelled() => cancelled_take(maybe),
            };
            store.unsubscribe(subscription);
            result
        })
    }

    fn prepare_race(&self, arms: Vec<(String, Op)>, token: CancellationToken) -> Pending {
        if arms.is_empty() {
            return Box::pin(async {
                (
                    Err(Error::internal("race requires at least one arm")),
                    false,
                )
            });
        }

        let mut competitors: Vec<BoxFuture<'static, (String, Result<EffectOutcome>, bool)>> =
            Vec::with_capacity(arms.len());
        for (name, op) in arms {
            let arm: Pending = match self.prepare(op, &token) {
                Plan::Pending(fut) => fut,
                Plan::Immediate(_) => {
                    Box::pin(async { (Err(Error::internal("unsupported race arm")), false) })
                }
            };
            competitors.push(Box::pin(async move {
                let (result, cancelled) = arm.await;
                (name, result, cancelled)
            }));
        }

        Box::pin(async move {
            let ((winner, result, cancelled), _, _rest) = select_all(competitors).await;
            (
                result.map(|outcome| EffectOutcome::Race {
                    winner,
                    outcome: Box::new(outcome),
                }),
                cancelled,
            )
        })
    }
}

fn drive_future(fut: BoxFuture<'static, Result<Value>>, token: CancellationToken) -> Pending {
    Box::pin(async move {
        tokio::select! {
            result = fut => (result.map(EffectOutcome::Value), false),
            _ = token.cancelled() => (Err(Error::Cancelled), true),
        }
    })
}

fn drive_cps(start: Box<dyn FnOnce(CpsDone) + Send>, token: CancellationToken) -> Pending {
    Box::pin(async move {
        let (tx, rx) = oneshot::channel();
        start(CpsDone { tx });
        tokio::select! {
            received = rx => match received {
                Ok(result) => (result.map(EffectOutcome::Value), false),
                Err(_) => (Err(Error::Cancelled), true),
            },
            _ = token.cancelled() => (Err(Error::Cancelled), true),
        }
    })
}

fn cancelled_take(maybe: bool) -> (Result<EffectOutcome>, bool) {
    if maybe {
        (Ok(EffectOutcome::Action(Action::end())), false)
    } else {
        (Err(Error::Cancelled), true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EffectKind;
    use serde_json::json;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingMonitor {
        triggered: Mutex<Vec<(EffectId, EffectKind)>>,
        resolved: Mutex<Vec<EffectId>>,
    }

    impl SagaMonitor for RecordingMonitor {
        fn effect_triggered(&self, id: EffectId, effect: &Effect) {
            lock(&self.triggered).push((id, effect.kind()));
        }

        fn effect_resolved(&self, id: EffectId, _outcome: &EffectOutcome) {
            lock(&self.resolved).push(id);
        }
    }

    #[tokio::test]
    async fn effects_are_triggered_in_yield_order_with_monotonic_ids() {
        let monitor = Arc::new(RecordingMonitor::default());
        let store = SimStore::new();
        let saga = Saga::new(|ctx: SagaContext| async move {
            ctx.put(Action::of("A")).await?;
            ctx.select("whole", |s| s.clone()).await?;
            ctx.call("noop", vec![], async { Ok(Value::Null) }).await?;
            Ok(Value::Null)
        });

        let handle = start(saga, store, monitor.clone());
        handle.main.finished().await;

        let triggered = lock(&monitor.triggered).clone();
        let kinds: Vec<_> = triggered.iter().map(|(_, k)| *k).collect();
        assert_eq!(kinds, [EffectKind::Put, EffectKind::Select, EffectKind::Call]);
        let ids: Vec<u64> = triggered.iter().map(|(id, _)| id.value()).collect();
        assert_eq!(ids, [1, 2, 3]);

        handle.shutdown.cancel();
    }

    #[tokio::test]
    async fn every_classified_yield_is_observed_once() {
        let monitor = Arc::new(RecordingMonitor::default());
        let store = SimStore::new();
        let saga = Saga::new(|ctx: SagaContext| async move {
            for _ in 0..3 {
                ctx.put(Action::of("TICK")).await?;
            }
            ctx.select("s", |s| s.clone()).await?;
            Ok(Value::Null)
        });

        let handle = start(saga, store, monitor.clone());
        handle.main.finished().await;

        let triggered = lock(&monitor.triggered).clone();
        let puts = triggered
            .iter()
            .filter(|(_, k)| *k == EffectKind::Put)
            .count();
        assert_eq!(puts, 3);
        assert_eq!(triggered.len(), 4);

        handle.shutdown.cancel();
    }

    #[tokio::test]
    async fn take_resolves_when_a_matching_action_is_dispatched() {
        let monitor = Arc::new(RecordingMonitor::default());
        let store = SimStore::new();
        let saga = Saga::new(|ctx: SagaContext| async move {
            let action = ctx.take("GO").await?;
            Ok(action.payload().clone())
        });

        let handle = start(saga, store.clone(), monitor);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!handle.main.is_finished());

        store.dispatch(&Action::of("GO").with_payload(json!(7)));
        handle.main.finished().await;
        assert_eq!(handle.main.result(), Some(Ok(json!(7))));

        handle.shutdown.cancel();
    }

    #[tokio::test]
    async fn cancelling_the_main_task_abandons_outstanding_effects() {
        let monitor = Arc::new(RecordingMonitor::default());
        let store = SimStore::new();
        let saga = Saga::new(|ctx: SagaContext| async move {
            ctx.take("NEVER").await?;
            Ok(Value::Null)
        });

        let handle = start(saga, store, monitor);
        tokio::time::sleep(Duration::from_millis(5)).await;

        handle.main.cancel();
        handle.main.finished().await;
        assert_eq!(handle.main.result(), Some(Err(Error::Cancelled)));

        handle.shutdown.cancel();
    }

    #[tokio::test]
    async fn saga_errors_are_captured_on_the_completion_future() {
        let monitor = Arc::new(RecordingMonitor::default());
        let saga = Saga::new(|_ctx: SagaContext| async move {
            Err(Error::internal("boom"))
        });

        let handle = start(saga, SimStore::new(), monitor);
        handle.main.finished().await;
        assert_eq!(
            handle.main.result(),
            Some(Err(Error::Internal("boom".into())))
        );

        handle.shutdown.cancel();
    }

    #[tokio::test]
    async fn race_resolves_with_the_first_arm() {
        use crate::RaceArm;

        let monitor = Arc::new(RecordingMonitor::default());
        let store = SimStore::new();
        let saga = Saga::new(|ctx: SagaContext| async move {
            let (winner, _outcome) = ctx
                .race(vec![
                    ("response", RaceArm::take("RESPONSE")),
                    ("timeout", RaceArm::delay(Duration::from_millis(5))),
                ])
                .await?;
            Ok(Value::from(winner))
        });

        let handle = start(saga, store, monitor);
        handle.main.finished().await;
        assert_eq!(handle.main.result(), Some(Ok(json!("timeout"))));

        handle.shutdown.cancel();
    }

    #[tokio::test]
    async fn cps_operation_reports_through_its_callback() {
        let monitor = Arc::new(RecordingMonitor::default());
        let saga = Saga::new(|ctx: SagaContext| async move {
            let value = ctx
                .cps("readFile", vec![json!("path")], |done| {
                    done.succeed(json!("contents"))
                })
                .await?;
            Ok(value)
        });

        let handle = start(saga, SimStore::new(), monitor);
        handle.main.finished().await;
        assert_eq!(handle.main.result(), Some(Ok(json!("contents"))));

        handle.shutdown.cancel();
    }
}
