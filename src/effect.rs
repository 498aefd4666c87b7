use serde::Serialize;
use serde_json::Value;

use crate::{Action, ChannelId, Pattern};

/// A declarative description of one intended side effect, yielded by a saga
/// instead of performed directly.
///
/// Descriptors are pure data: deeply comparable, immutable once yielded, and
/// free of callables. The behavior that performs an effect (the future behind
/// a `call`, the body of a forked saga) travels separately through the
/// engine, so two descriptors built with equal arguments are equal no matter
/// where they came from. That property is what lets a recorded effect match
/// an expected one built independently by a test.
///
/// Call, callback-invoke, and fork targets are identified by caller-supplied
/// names, and selectors by a selector name, since closures have no comparable
/// identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Effect {
    /// Wait for an action matching `pattern`, or for the next action buffered
    /// by the channel identified by `channel`. `maybe` marks optional waits
    /// that resolve with [`Action::end`](crate::Action::end) when the wait is
    /// abandoned by cancellation instead of pending forever.
    Take {
        pattern: Option<Pattern>,
        channel: Option<ChannelId>,
        maybe: bool,
    },
    /// Dispatch an action into the simulated store. `resolve` marks the
    /// variant that waits for the dispatch result before resuming.
    Put { action: Action, resolve: bool },
    /// Run several named sub-effects; the first to resolve wins and the rest
    /// are abandoned. Arm order is part of the descriptor's identity.
    Race { arms: Vec<(String, Effect)> },
    /// Invoke a named operation with the given arguments.
    Call { target: String, args: Vec<Value> },
    /// Invoke a named callback-style operation with the given arguments.
    Cps { target: String, args: Vec<Value> },
    /// Start a named child saga. `detached` children outlive cancellation of
    /// their parent.
    Fork {
        target: String,
        args: Vec<Value>,
        detached: bool,
    },
    /// Read a value out of the simulated state via a named selector.
    Select { selector: String },
    /// Open a subscription channel buffering actions that match `pattern`.
    ActionChannel { pattern: Pattern },
    /// Await an externally supplied future, labelled for matching.
    Promise { label: String },
    /// Not an effect; never stored or matched.
    None,
}

impl Effect {
    /// Classify this descriptor into its [`EffectKind`].
    ///
    /// Total and side-effect-free. The match arms are listed in the fixed
    /// classification priority order: promise, take, put, race, call,
    /// callback-invoke, fork, select, action-channel, then none.
    pub fn kind(&self) -> EffectKind {
        match self {
            Effect::Promise { .. } => EffectKind::Promise,
            Effect::Take { .. } => EffectKind::Take,
            Effect::Put { .. } => EffectKind::Put,
            Effect::Race { .. } => EffectKind::Race,
            Effect::Call { .. } => EffectKind::Call,
            Effect::Cps { .. } => EffectKind::Cps,
            Effect::Fork { .. } => EffectKind::Fork,
            Effect::Select { .. } => EffectKind::Select,
            Effect::ActionChannel { .. } => EffectKind::ActionChannel,
            Effect::None => EffectKind::None,
        }
    }
}

/// The closed set of effect kinds the harness stores and matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EffectKind {
    Promise,
    Take,
    Put,
    Race,
    Call,
    Cps,
    Fork,
    Select,
    ActionChannel,
    None,
}

impl EffectKind {
    /// Every kind that gets stored; [`EffectKind::None`] is excluded.
    pub const STORED: [EffectKind; 9] = [
        EffectKind::Promise,
        EffectKind::Take,
        EffectKind::Put,
        EffectKind::Race,
        EffectKind::Call,
        EffectKind::Cps,
        EffectKind::Fork,
        EffectKind::Select,
        EffectKind::ActionChannel,
    ];

    /// Short lowercase name used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            EffectKind::Promise => "promise",
            EffectKind::Take => "take",
            EffectKind::Put => "put",
            EffectKind::Race => "race",
            EffectKind::Call => "call",
            EffectKind::Cps => "cps",
            EffectKind::Fork => "fork",
            EffectKind::Select => "select",
            EffectKind::ActionChannel => "action-channel",
            EffectKind::None => "none",
        }
    }
}

impl std::fmt::Display for EffectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classification_is_total_over_all_variants() {
        let effects = [
            Effect::Promise {
                label: "p".into(),
            },
            Effect::Take {
                pattern: Some(Pattern::Any),
                channel: None,
                maybe: false,
            },
            Effect::Put {
                action: Action::of("A"),
                resolve: false,
            },
            Effect::Race { arms: vec![] },
            Effect::Call {
                target: "api".into(),
                args: vec![],
            },
            Effect::Cps {
                target: "cb".into(),
                args: vec![],
            },
            Effect::Fork {
                target: "child".into(),
                args: vec![],
                detached: false,
            },
            Effect::Select {
                selector: "count".into(),
            },
            Effect::ActionChannel {
                pattern: Pattern::Any,
            },
            Effect::None,
        ];
        let kinds: Vec<_> = effects.iter().map(Effect::kind).collect();
        assert_eq!(
            kinds,
            [
                EffectKind::Promise,
                EffectKind::Take,
                EffectKind::Put,
                EffectKind::Race,
                EffectKind::Call,
                EffectKind::Cps,
                EffectKind::Fork,
                EffectKind::Select,
                EffectKind::ActionChannel,
                EffectKind::None,
            ]
        );
    }

    #[test]
    fn descriptors_with_equal_arguments_are_equal() {
        let a = Effect::Call {
            target: "api".into(),
            args: vec![json!("x"), json!({ "n": 1 })],
        };
        let b = Effect::Call {
            target: "api".into(),
            args: vec![json!("x"), json!({ "n": 1 })],
        };
        assert_eq!(a, b);
    }

    #[test]
    fn race_arm_order_is_part_of_identity() {
        let take = Effect::Take {
            pattern: Some("A".into()),
            channel: None,
            maybe: false,
        };
        let call = Effect::Call {
            target: "t".into(),
            args: vec![],
        };
        let ab = Effect::Race {
            arms: vec![("a".into(), take.clone()), ("b".into(), call.clone())],
        };
        let ba = Effect::Race {
            arms: vec![("b".into(), call), ("a".into(), take)],
        };
        assert_ne!(ab, ba);
    }

    #[test]
    fn stored_kinds_exclude_none() {
        assert!(!EffectKind::STORED.contains(&EffectKind::None));
        assert_eq!(EffectKind::STORED.len(), 9);
    }
}
