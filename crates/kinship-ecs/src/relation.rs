//! Index from targeted component keys to the entities holding them.
//!
//! Relations (entity targets) and links (object targets) both live here. The
//! index keeps three views in step:
//! - forward: `(type, target) -> holders`
//! - by target: `target -> types` (used to cascade a target's despawn)
//! - by type: `type -> targets` (used by `collect_targets`)
//!
//! The store updates it in the same call that changes archetype membership,
//! so it always agrees with the archetype signatures.

use std::collections::{BTreeSet, HashMap};

use crate::component::{ComponentKey, ComponentTypeId};
use crate::identity::Identity;

/// Bidirectional index of targeted components.
#[derive(Debug, Default)]
pub struct RelationIndex {
    holders: HashMap<ComponentKey, BTreeSet<Identity>>,
    by_target: HashMap<Identity, BTreeSet<ComponentTypeId>>,
    by_type: HashMap<ComponentTypeId, BTreeSet<Identity>>,
}

impl RelationIndex {
    /// Record that `holder` now carries `key`. Untargeted keys are ignored.
    pub fn insert(&mut self, key: ComponentKey, holder: Identity) {
        if !key.is_targeted() {
            return;
        }
        self.holders.entry(key).or_default().insert(holder);
        self.by_target
            .entry(key.target)
            .or_default()
            .insert(key.type_id);
        self.by_type
            .entry(key.type_id)
            .or_default()
            .insert(key.target);
    }

    /// Record that `holder` no longer carries `key`, dropping empty entries.
    pub fn remove(&mut self, key: ComponentKey, holder: Identity) {
        let Some(set) = self.holders.get_mut(&key) else {
            return;
        };
        set.remove(&holder);
        if !set.is_empty() {
            return;
        }
        self.holders.remove(&key);

        if let Some(types) = self.by_target.get_mut(&key.target) {
            types.remove(&key.type_id);
            if types.is_empty() {
                self.by_target.remove(&key.target);
            }
        }
        if let Some(targets) = self.by_type.get_mut(&key.type_id) {
            targets.remove(&key.target);
            if targets.is_empty() {
                self.by_type.remove(&key.type_id);
            }
        }
    }

    /// Entities holding `key`, in identity order.
    pub fn holders(&self, key: &ComponentKey) -> impl Iterator<Item = Identity> + '_ {
        self.holders.get(key).into_iter().flatten().copied()
    }

    /// Number of entities holding `key`.
    pub fn holder_count(&self, key: &ComponentKey) -> usize {
        self.holders.get(key).map_or(0, BTreeSet::len)
    }

    /// Every key currently pointing at `target`.
    pub fn keys_targeting(&self, target: Identity) -> Vec<ComponentKey> {
        self.by_target
            .get(&target)
            .into_iter()
            .flatten()
            .map(|&type_id| ComponentKey::new(type_id, target))
            .collect()
    }

    /// Distinct targets with at least one holder of `type_id`.
    pub fn targets_of(&self, type_id: ComponentTypeId) -> Vec<Identity> {
        self.by_type
            .get(&type_id)
            .map(|targets| targets.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of distinct `(type, target)` keys with holders.
    pub fn len(&self) -> usize {
        self.holders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.holders.is_empty()
    }

    /// All indexed keys with their holders.
    pub(crate) fn entries(&self) -> impl Iterator<Item = (&ComponentKey, &BTreeSet<Identity>)> {
        self.holders.iter()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
