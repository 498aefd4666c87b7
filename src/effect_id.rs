use std::fmt;

use serde::Serialize;

/// Identifier for one effect observation within a run.
///
/// Ids are assigned by the engine, monotonically from 1 in the order effects
/// are triggered. They key the correlation tables that bridge an effect's
/// `triggered` and `resolved` observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct EffectId(u64);

impl EffectId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl From<u64> for EffectId {
    fn from(value: u64) -> Self {
        EffectId(value)
    }
}

impl From<EffectId> for u64 {
    fn from(value: EffectId) -> Self {
        value.0
    }
}

impl fmt::Display for EffectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
