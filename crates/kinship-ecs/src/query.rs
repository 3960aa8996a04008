//! Live queries over archetype membership.
//!
//! A query is a [`QueryMask`]: keys an archetype must match and keys it must
//! not match. Targets in either list may be [`Identity::ANY`]. Masks are
//! registered with the store once; every archetype created afterwards is
//! checked against all registered masks and subscribed on a match, and the
//! row count is adjusted on every insert or removal in a subscribed
//! archetype. [`Query::count`] is therefore O(1).
//!
//! Identical masks share a single state, so building the same query twice is
//! cheap and yields equal handles.

use crate::archetype::ArchetypeId;
use crate::command::CommandQueue;
use crate::component::{Component, ComponentKey, Signature};
use crate::identity::Identity;
use crate::world::World;
use crate::EcsError;

// ---------------------------------------------------------------------------
// QueryId / QueryMask / QueryState
// ---------------------------------------------------------------------------

/// Index of a registered query state within a world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryId(pub(crate) u32);

impl QueryId {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Required and excluded keys. Both lists are kept sorted and deduplicated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct QueryMask {
    has: Vec<ComponentKey>,
    not: Vec<ComponentKey>,
}

impl QueryMask {
    pub fn with_has(mut self, key: ComponentKey) -> Self {
        insert_sorted(&mut self.has, key);
        self
    }

    pub fn with_not(mut self, key: ComponentKey) -> Self {
        insert_sorted(&mut self.not, key);
        self
    }

    /// Whether an archetype with `signature` belongs to this query.
    pub fn matches(&self, signature: &Signature) -> bool {
        self.has.iter().all(|key| signature.matches(key))
            && !self.not.iter().any(|key| signature.matches(key))
    }
}

fn insert_sorted(keys: &mut Vec<ComponentKey>, key: ComponentKey) {
    if let Err(pos) = keys.binary_search(&key) {
        keys.insert(pos, key);
    }
}

/// Per-mask bookkeeping held by the store.
#[derive(Debug)]
pub(crate) struct QueryState {
    pub(crate) mask: QueryMask,
    /// Matching archetypes in creation order.
    pub(crate) archetypes: Vec<ArchetypeId>,
    /// Sum of rows over `archetypes`.
    pub(crate) count: usize,
}

impl QueryState {
    pub(crate) fn new(mask: QueryMask) -> Self {
        Self {
            mask,
            archetypes: Vec::new(),
            count: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// QueryBuilder
// ---------------------------------------------------------------------------

/// Accumulates filters and registers the resulting mask with a world.
///
/// Obtained from [`World::query`].
pub struct QueryBuilder<'w> {
    world: &'w mut World,
    mask: QueryMask,
}

impl<'w> QueryBuilder<'w> {
    pub(crate) fn new(world: &'w mut World) -> Self {
        Self {
            world,
            mask: QueryMask::default(),
        }
    }

    /// Require a plain `T`.
    pub fn has<T: Component>(mut self) -> Self {
        self.mask = self.mask.with_has(ComponentKey::plain::<T>());
        self
    }

    /// Require a `T` relation to `target`, or to any target with
    /// [`Identity::ANY`].
    pub fn has_relation<T: Component>(mut self, target: Identity) -> Self {
        self.mask = self.mask.with_has(ComponentKey::targeting::<T>(target));
        self
    }

    /// Require a link to `item`.
    pub fn has_link<T: std::hash::Hash + Component>(mut self, item: &T) -> Self {
        self.mask = self
            .mask
            .with_has(ComponentKey::targeting::<T>(Identity::of(item)));
        self
    }

    /// Exclude archetypes with a plain `T`.
    pub fn not<T: Component>(mut self) -> Self {
        self.mask = self.mask.with_not(ComponentKey::plain::<T>());
        self
    }

    /// Exclude archetypes with a `T` relation to `target` (or any target).
    pub fn not_relation<T: Component>(mut self, target: Identity) -> Self {
        self.mask = self.mask.with_not(ComponentKey::targeting::<T>(target));
        self
    }

    /// Register the mask and return a handle to its live state.
    pub fn build(self) -> Query {
        Query {
            id: self.world.store_mut().register_query(self.mask),
            world: self.world.id(),
        }
    }
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

/// Handle to a live query registered with a [`World`].
///
/// A handle remembers the world that built it. Against any other world it
/// behaves as an empty query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Query {
    id: QueryId,
    world: u64,
}

impl Query {
    pub fn id(&self) -> QueryId {
        self.id
    }

    fn state<'w>(&self, world: &'w World) -> Option<&'w QueryState> {
        if world.id() != self.world {
            return None;
        }
        world.store().query_state(self.id)
    }

    fn archetype_ids<'w>(&self, world: &'w World) -> &'w [ArchetypeId] {
        self.state(world)
            .map(|state| state.archetypes.as_slice())
            .unwrap_or_default()
    }

    /// Number of entities currently matching.
    pub fn count(&self, world: &World) -> usize {
        self.state(world).map_or(0, |s| s.count)
    }

    /// Matching entities, archetype by archetype in row order.
    pub fn entities(&self, world: &World) -> Vec<Identity> {
        let store = world.store();
        self.archetype_ids(world)
            .iter()
            .filter_map(|&id| store.archetype(id))
            .flat_map(|archetype| archetype.entities().iter().copied())
            .collect()
    }

    /// Whether `entity` is alive and currently matches.
    pub fn contains(&self, world: &World, entity: Identity) -> bool {
        world
            .store()
            .archetype_of(entity)
            .is_ok_and(|id| self.archetype_ids(world).contains(&id))
    }

    /// Plain `T` values of every matching entity that has one.
    pub fn iter<'w, T: Component>(
        &self,
        world: &'w World,
    ) -> impl Iterator<Item = (Identity, &'w T)> + 'w {
        let key = ComponentKey::plain::<T>();
        let store = world.store();
        self.archetype_ids(world)
            .iter()
            .filter_map(move |&id| store.archetype(id))
            .filter_map(move |archetype| {
                let values = archetype.column::<T>(&key)?;
                Some(archetype.entities().iter().copied().zip(values.iter()))
            })
            .flatten()
    }

    /// `(holder, target, value)` for every `T` relation matching `target` on
    /// a matching entity.
    ///
    /// With [`Identity::ANY`] an entity holding several targets is yielded
    /// once per target.
    pub fn iter_relation<'w, T: Component>(
        &self,
        world: &'w World,
        target: Identity,
    ) -> impl Iterator<Item = (Identity, Identity, &'w T)> + 'w {
        let filter = ComponentKey::targeting::<T>(target);
        let store = world.store();
        self.archetype_ids(world)
            .iter()
            .filter_map(move |&id| store.archetype(id))
            .flat_map(move |archetype| {
                archetype
                    .signature()
                    .keys()
                    .iter()
                    .filter(move |key| key.is_targeted() && filter.matches(key))
                    .filter_map(move |key| {
                        let values = archetype.column::<T>(key)?;
                        Some(
                            archetype
                                .entities()
                                .iter()
                                .zip(values.iter())
                                .map(move |(&holder, value)| (holder, key.target, value)),
                        )
                    })
                    .flatten()
            })
    }

    /// Run `f` on every matching entity's plain `T`, with the world locked.
    ///
    /// Structural changes requested through the supplied [`CommandQueue`]
    /// are replayed in order when the iteration finishes. Fails with
    /// [`EcsError::AlreadyLocked`] if the world is already locked, or with the
    /// first replay failure.
    pub fn for_each_mut<T: Component>(
        &self,
        world: &mut World,
        mut f: impl FnMut(Identity, &mut T, &mut CommandQueue),
    ) -> Result<(), EcsError> {
        world.lock()?;
        let key = ComponentKey::plain::<T>();
        let archetypes = self.archetype_ids(world).to_vec();
        {
            let (store, queue) = world.iteration_parts();
            for id in archetypes {
                let Some(archetype) = store.archetype_mut(id) else {
                    continue;
                };
                if let Some((entities, values)) = archetype.column_with_entities_mut::<T>(&key) {
                    for (&entity, value) in entities.iter().zip(values.iter_mut()) {
                        f(entity, value, &mut *queue);
                    }
                }
            }
        }
        world.unlock()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
