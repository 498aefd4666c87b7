use serde_json::Value;

use crate::{Action, ActionChannel, Effect, EffectId, Error, TaskHandle};

/// The resolved value of an effect, delivered alongside the
/// [`effect_resolved`](SagaMonitor::effect_resolved) observation and back to
/// the awaiting saga.
#[derive(Debug, Clone)]
pub enum EffectOutcome {
    /// A take or put resolved with this action.
    Action(Action),
    /// A call, callback-invoke, select, or external promise produced this
    /// value.
    Value(Value),
    /// A fork produced this running task.
    Task(TaskHandle),
    /// An open-channel effect produced this channel.
    Channel(ActionChannel),
    /// A race finished; `winner` names the arm that resolved first.
    Race {
        winner: String,
        outcome: Box<EffectOutcome>,
    },
}

/// Trait for observing an effect run's lifecycle.
///
/// The engine invokes these callbacks as it processes effects. All methods
/// have default no-op implementations, so implementors only override the
/// ones they care about. Callbacks are serialized by the engine loop: for a
/// given run, no two observations run concurrently, and effects are
/// triggered in exactly the order they were yielded.
pub trait SagaMonitor: Send + Sync {
    /// Called when a saga yields an effect, before the effect is performed.
    fn effect_triggered(&self, id: EffectId, effect: &Effect) {
        let _i = id;
        let _e = effect;
    }

    /// Called when an effect resolves with a value.
    fn effect_resolved(&self, id: EffectId, outcome: &EffectOutcome) {
        let _i = id;
        let _o = outcome;
    }

    /// Called when an effect fails.
    fn effect_rejected(&self, id: EffectId, error: &Error) {
        let _i = id;
        let _e = error;
    }

    /// Called when an effect is abandoned because its task was cancelled.
    fn effect_cancelled(&self, id: EffectId) {
        let _i = id;
    }
}
