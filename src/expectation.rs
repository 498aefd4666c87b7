use crate::{multiset::EffectLog, Effect, EffectKind, Error, Result};

/// A pending assertion that one effect deeply equal to `expected` was
/// witnessed during the run.
///
/// Expectations are checked once, after the run settles, in registration
/// order. Each checked expectation independently removes its match from the
/// kind's multiset, so duplicate effects require duplicate expectations.
#[derive(Debug, Clone)]
pub(crate) struct Expectation {
    pub kind: EffectKind,
    pub expected: Effect,
    pub label: String,
}

impl Expectation {
    pub fn new(expected: Effect, label: impl Into<String>) -> Self {
        Self {
            kind: expected.kind(),
            expected,
            label: label.into(),
        }
    }
}

/// Validate every expectation against the recorded effects. Stops at the
/// first unmet expectation; subsequent ones are not checked.
pub(crate) fn check_expectations(log: &mut EffectLog, expectations: Vec<Expectation>) -> Result {
    for expectation in expectations {
        let bag = log.bag_mut(expectation.kind);
        if bag.remove_one_matching(&expectation.expected).is_none() {
            return Err(Error::UnmetExpectation {
                label: expectation.label,
                kind: expectation.kind,
                expected: format!("{:?}", expectation.expected),
                witnessed: format!("{:?}", bag.values()),
            });
        }
    }
    Ok(())
}
