use std::{sync::Arc, time::Duration};

use crate::EffectKind;

/// The single error type for all karakuri operations.
///
/// Every fallible karakuri API returns `karakuri::Result<T>` (alias for
/// `Result<T, karakuri::Error>`). Errors from lower layers are mapped into
/// variants of this enum so callers only need to handle one error type.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The first registered expectation that could not be matched against the
    /// recorded effects. Carries a rendering of the expected effect and of
    /// every effect of the same kind that was witnessed during the run.
    #[error(
        "expectation '{label}' was not met\n  expected {kind} effect: {expected}\n  witnessed {kind} effects: {witnessed}"
    )]
    UnmetExpectation {
        label: String,
        kind: EffectKind,
        expected: String,
        witnessed: String,
    },

    /// The saga and its outstanding asynchronous work did not settle before
    /// the configured timeout. The main task has been cancelled.
    #[error("saga did not settle within {0:?}; main task cancelled")]
    Timeout(Duration),

    /// The task awaiting an effect was cancelled before the effect resolved.
    #[error("saga task was cancelled")]
    Cancelled,

    /// An effect was submitted after the engine stopped accepting work.
    #[error("effect engine is no longer running")]
    EngineClosed,

    #[error("saga has already been started")]
    AlreadyStarted,

    #[error("saga has not been started")]
    NotStarted,

    /// An error produced by user code (a call target, a callback-style
    /// operation) and surfaced back into the saga.
    #[error("external error: {0}")]
    External(#[source] Arc<dyn std::error::Error + Send + Sync>),

    #[error("internal karakuri error: {0}")]
    Internal(String),
}

impl Error {
    pub fn external(e: impl std::error::Error + Send + Sync + 'static) -> Self {
        Error::External(Arc::new(e))
    }

    pub(crate) fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::UnmetExpectation {
                    label: l1,
                    kind: k1,
                    expected: e1,
                    witnessed: w1,
                },
                Self::UnmetExpectation {
                    label: l2,
                    kind: k2,
                    expected: e2,
                    witnessed: w2,
                },
            ) => l1 == l2 && k1 == k2 && e1 == e2 && w1 == w2,
            (Self::Timeout(a), Self::Timeout(b)) => a == b,
            (Self::Cancelled, Self::Cancelled) => true,
            (Self::EngineClosed, Self::EngineClosed) => true,
            (Self::AlreadyStarted, Self::AlreadyStarted) => true,
            (Self::NotStarted, Self::NotStarted) => true,
            (Self::External(a), Self::External(b)) => Arc::ptr_eq(a, b),
            (Self::Internal(a), Self::Internal(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Error {}
