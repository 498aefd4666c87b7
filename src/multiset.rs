use std::collections::HashMap;

use crate::{Effect, EffectKind};

/// Insertion-ordered, duplicate-tolerant collection of effect descriptors of
/// a single kind.
///
/// Two identical effects yielded twice are both stored and can both be
/// matched independently; matching removes exactly one descriptor per call.
#[derive(Debug, Default, Clone)]
pub struct EffectBag {
    effects: Vec<Effect>,
}

impl EffectBag {
    /// Append a descriptor.
    pub fn add(&mut self, effect: Effect) {
        self.effects.push(effect);
    }

    /// Remove and return the first stored descriptor deeply equal to
    /// `expected`, or `None` if no stored descriptor matches.
    pub fn remove_one_matching(&mut self, expected: &Effect) -> Option<Effect> {
        let index = self.effects.iter().position(|e| e == expected)?;
        Some(self.effects.remove(index))
    }

    /// The current contents in insertion order, for diagnostics.
    pub fn values(&self) -> &[Effect] {
        &self.effects
    }

    pub fn len(&self) -> usize {
        self.effects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }
}

/// One [`EffectBag`] per storable effect kind.
#[derive(Debug, Default)]
pub(crate) struct EffectLog {
    bags: HashMap<EffectKind, EffectBag>,
}

impl EffectLog {
    /// Record a witnessed effect in its kind's bag. `None`-kind effects are
    /// dropped; returns whether the effect was stored.
    pub fn record(&mut self, effect: Effect) -> bool {
        let kind = effect.kind();
        if kind == EffectKind::None {
            return false;
        }
        self.bags.entry(kind).or_default().add(effect);
        true
    }

    pub fn bag_mut(&mut self, kind: EffectKind) -> &mut EffectBag {
        self.bags.entry(kind).or_default()
    }

    /// The descriptors witnessed for `kind`, in trigger order.
    pub fn effects_of(&self, kind: EffectKind) -> Vec<Effect> {
        self.bags
            .get(&kind)
            .map(|bag| bag.values().to_vec())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Action;

    fn put(kind: &str) -> Effect {
        Effect::Put {
            action: Action::of(kind),
            resolve: false,
        }
    }

    #[test]
    fn duplicates_are_stored_and_matched_independently() {
        let mut bag = EffectBag::default();
        bag.add(put("A"));
        bag.add(put("A"));
        assert_eq!(bag.len(), 2);

        assert!(bag.remove_one_matching(&put("A")).is_some());
        assert!(bag.remove_one_matching(&put("A")).is_some());
        assert!(bag.remove_one_matching(&put("A")).is_none());
    }

    #[test]
    fn remove_is_safe_to_retry_after_miss() {
        let mut bag = EffectBag::default();
        bag.add(put("A"));

        assert!(bag.remove_one_matching(&put("A")).is_some());
        assert!(bag.remove_one_matching(&put("A")).is_none());
        assert!(bag.is_empty());
    }

    #[test]
    fn values_preserve_insertion_order() {
        let mut bag = EffectBag::default();
        bag.add(put("A"));
        bag.add(put("B"));
        bag.add(put("A"));
        let kinds: Vec<_> = bag
            .values()
            .iter()
            .map(|e| match e {
                Effect::Put { action, .. } => action.kind().to_owned(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(kinds, ["A", "B", "A"]);
    }

    #[test]
    fn remove_takes_first_match_only() {
        let mut bag = EffectBag::default();
        bag.add(put("A"));
        bag.add(put("B"));
        bag.add(put("A"));
        bag.remove_one_matching(&put("A"));
        let remaining: Vec<_> = bag
            .values()
            .iter()
            .map(|e| match e {
                Effect::Put { action, .. } => action.kind().to_owned(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(remaining, ["B", "A"]);
    }

    #[test]
    fn log_drops_none_effects() {
        let mut log = EffectLog::default();
        assert!(!log.record(Effect::None));
        assert!(log.record(put("A")));
        assert_eq!(log.effects_of(EffectKind::Put).len(), 1);
    }
}
