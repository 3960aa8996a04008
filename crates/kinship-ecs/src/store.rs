//! The archetype store: entity placement, migration, and despawn cascades.
//!
//! [`ArchetypeStore`] owns every archetype, the authoritative location of
//! each placed entity, the relation index, and the live query states. All
//! structural changes funnel through [`ArchetypeStore::migrate`], which moves
//! one row between archetypes, fixes up the entity displaced by the
//! swap-remove, and adjusts query counts in the same step.
//!
//! An archetype whose signature relates to an entity can never be reached
//! again once that entity is despawned. Such archetypes are retired in the
//! same despawn and their slots are reused.

use std::collections::HashMap;

use crate::archetype::{Archetype, ArchetypeId, Column, ColumnMismatch, Payload};
use crate::component::{Component, ComponentKey, ComponentTypeId, Signature};
use crate::entity::{EntityAllocator, EntityLocation};
use crate::identity::Identity;
use crate::query::{QueryId, QueryMask, QueryState};
use crate::relation::RelationIndex;
use crate::EcsError;

impl From<ColumnMismatch> for EcsError {
    fn from(mismatch: ColumnMismatch) -> Self {
        EcsError::Inconsistent {
            details: format!("column for {} has an unexpected type", mismatch.0),
        }
    }
}

// ---------------------------------------------------------------------------
// ArchetypeStore
// ---------------------------------------------------------------------------

/// Archetype-based entity storage with a relation index and live queries.
#[derive(Debug)]
pub struct ArchetypeStore {
    allocator: EntityAllocator,
    /// Indexed by `ArchetypeId`. Slot 0 is the empty signature.
    archetypes: Vec<Archetype>,
    archetype_index: HashMap<Signature, ArchetypeId>,
    /// Live archetypes whose signature holds a relation to the keyed entity.
    related_archetypes: HashMap<Identity, Vec<ArchetypeId>>,
    /// Retired slots, reused before the vector grows.
    free_archetypes: Vec<ArchetypeId>,
    locations: HashMap<Identity, EntityLocation>,
    relations: RelationIndex,
    /// Indexed by `QueryId`.
    queries: Vec<QueryState>,
    query_index: HashMap<QueryMask, QueryId>,
}

impl ArchetypeStore {
    /// Create a store with room for `entity_capacity` entities.
    pub fn with_capacity(entity_capacity: usize) -> Self {
        let mut archetype_index = HashMap::new();
        archetype_index.insert(Signature::empty(), ArchetypeId::EMPTY);
        Self {
            allocator: EntityAllocator::with_capacity(entity_capacity),
            archetypes: vec![Archetype::empty(ArchetypeId::EMPTY)],
            archetype_index,
            related_archetypes: HashMap::new(),
            free_archetypes: Vec::new(),
            locations: HashMap::with_capacity(entity_capacity),
            relations: RelationIndex::default(),
            queries: Vec::new(),
            query_index: HashMap::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Entity lifecycle
    // -----------------------------------------------------------------------

    /// Hand out an identity without placing it. It is not alive until
    /// [`place`](Self::place) is called.
    pub fn reserve(&mut self) -> Identity {
        self.allocator.allocate()
    }

    /// Materialize a reserved identity in the empty archetype.
    pub fn place(&mut self, entity: Identity) -> Result<(), EcsError> {
        if !self.is_reserved(entity) {
            return Err(EcsError::StaleEntity { entity });
        }
        self.put_in_empty(entity);
        Ok(())
    }

    /// Allocate and place a new entity with no components.
    pub fn spawn(&mut self) -> Identity {
        let entity = self.allocator.allocate();
        self.put_in_empty(entity);
        entity
    }

    fn put_in_empty(&mut self, entity: Identity) {
        let row = self.archetypes[ArchetypeId::EMPTY.index()].push_bare(entity);
        self.locations.insert(
            entity,
            EntityLocation {
                archetype: ArchetypeId::EMPTY,
                row,
            },
        );
        self.count_in(ArchetypeId::EMPTY);
    }

    /// Whether `entity` is placed in the store.
    #[inline]
    pub fn is_alive(&self, entity: Identity) -> bool {
        self.locations.contains_key(&entity)
    }

    /// Whether `entity` has been handed out by [`reserve`](Self::reserve) but
    /// not yet placed.
    pub fn is_reserved(&self, entity: Identity) -> bool {
        self.allocator.is_current(entity) && !self.locations.contains_key(&entity)
    }

    /// Despawn `entity`.
    ///
    /// Every relation that targets `entity` is first stripped from its
    /// holders (the holders stay alive), then the archetypes keyed on those
    /// relations are retired. Returns the object identities of the links
    /// `entity` itself held, so the caller can release them.
    pub fn despawn(&mut self, entity: Identity) -> Result<Vec<Identity>, EcsError> {
        self.location(entity)?;

        let mut stripped = 0usize;
        for key in self.relations.keys_targeting(entity) {
            let holders: Vec<Identity> = self.relations.holders(&key).collect();
            for holder in holders {
                self.remove(holder, key)?;
                stripped += 1;
            }
        }
        if stripped > 0 {
            tracing::debug!(%entity, stripped, "stripped relations targeting despawned entity");
        }

        // Re-read: stripping a self-relation moves the entity.
        let loc = self.location(entity)?;
        let mut links = Vec::new();
        for key in self.archetypes[loc.archetype.index()].signature().keys() {
            if key.is_targeted() {
                self.relations.remove(*key, entity);
                if key.is_link() {
                    links.push(key.target);
                }
            }
        }

        let displaced = self.archetypes[loc.archetype.index()].swap_remove(loc.row);
        self.fix_displaced(displaced, loc.row);
        self.count_out(loc.archetype);
        self.locations.remove(&entity);
        self.allocator.deallocate(entity);
        self.retire_related(entity)?;
        Ok(links)
    }

    /// Retire every archetype with a relation to the despawned `target`.
    fn retire_related(&mut self, target: Identity) -> Result<(), EcsError> {
        let Some(ids) = self.related_archetypes.remove(&target) else {
            return Ok(());
        };
        for &id in &ids {
            if !self.archetypes[id.index()].is_empty() {
                return Err(EcsError::Inconsistent {
                    details: format!("archetype {} still relates to despawned {target}", id.0),
                });
            }
            let retired = std::mem::replace(&mut self.archetypes[id.index()], Archetype::retired(id));
            self.archetype_index.remove(retired.signature());
            for query in &retired.subscribers {
                self.queries[query.index()].archetypes.retain(|&a| a != id);
            }
            for key in retired.signature().keys() {
                if !is_relation(key) || key.target == target {
                    continue;
                }
                if let Some(list) = self.related_archetypes.get_mut(&key.target) {
                    list.retain(|&a| a != id);
                }
            }
            self.free_archetypes.push(id);
        }
        tracing::debug!(%target, retired = ids.len(), "retired archetypes of despawned entity");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Components
    // -----------------------------------------------------------------------

    /// Add `value` under `key`, migrating `entity` to the wider archetype.
    ///
    /// Targeted keys must point at an object or a live entity. Nothing is
    /// changed on error.
    pub(crate) fn add(
        &mut self,
        entity: Identity,
        key: ComponentKey,
        value: Box<dyn Payload>,
    ) -> Result<(), EcsError> {
        let loc = self.location(entity)?;
        if key.is_targeted() && !(key.is_link() || self.is_alive(key.target)) {
            return Err(EcsError::InvalidTarget { target: key.target });
        }
        let signature = self.archetypes[loc.archetype.index()].signature();
        if signature.contains(&key) {
            return Err(EcsError::ComponentAlreadyPresent {
                entity,
                component: key.to_string(),
            });
        }

        let target = signature.with(key);
        let dst = self.archetype_for(target, loc.archetype, || Some((key, value.new_column())))?;
        self.migrate(entity, loc, dst, Some((key, value)))?;
        self.relations.insert(key, entity);
        Ok(())
    }

    /// Remove `key` from `entity`, migrating it to the narrower archetype.
    pub fn remove(&mut self, entity: Identity, key: ComponentKey) -> Result<(), EcsError> {
        let loc = self.location(entity)?;
        let signature = self.archetypes[loc.archetype.index()].signature();
        if !signature.contains(&key) {
            return Err(EcsError::ComponentAbsent {
                entity,
                component: key.to_string(),
            });
        }

        let target = signature.without(key);
        let dst = self.archetype_for(target, loc.archetype, || None)?;
        self.migrate(entity, loc, dst, None)?;
        self.relations.remove(key, entity);
        Ok(())
    }

    /// Whether `entity` is alive and carries a key matching `key`.
    ///
    /// `key.target` may be [`Identity::ANY`]. Never fails.
    pub fn has(&self, entity: Identity, key: &ComponentKey) -> bool {
        self.locations
            .get(&entity)
            .is_some_and(|loc| self.archetypes[loc.archetype.index()].signature().matches(key))
    }

    pub fn get<T: Component>(&self, entity: Identity, key: &ComponentKey) -> Result<&T, EcsError> {
        let loc = self.location(entity)?;
        self.archetypes[loc.archetype.index()]
            .get::<T>(key, loc.row)
            .ok_or_else(|| EcsError::ComponentNotFound {
                entity,
                component: key.to_string(),
            })
    }

    pub fn get_mut<T: Component>(
        &mut self,
        entity: Identity,
        key: &ComponentKey,
    ) -> Result<&mut T, EcsError> {
        let loc = self.location(entity)?;
        self.archetypes[loc.archetype.index()]
            .get_mut::<T>(key, loc.row)
            .ok_or_else(|| EcsError::ComponentNotFound {
                entity,
                component: key.to_string(),
            })
    }

    /// Distinct targets with at least one holder of `type_id`.
    pub fn collect_targets(&self, type_id: ComponentTypeId) -> Vec<Identity> {
        self.relations.targets_of(type_id)
    }

    // -----------------------------------------------------------------------
    // Migration
    // -----------------------------------------------------------------------

    /// Find or create the archetype for `signature`, deriving it from `from`.
    fn archetype_for(
        &mut self,
        signature: Signature,
        from: ArchetypeId,
        extra: impl FnOnce() -> Option<(ComponentKey, Box<dyn Column>)>,
    ) -> Result<ArchetypeId, EcsError> {
        if let Some(&id) = self.archetype_index.get(&signature) {
            return Ok(id);
        }

        let id = match self.free_archetypes.last() {
            Some(&free) => free,
            None => ArchetypeId(self.archetypes.len() as u32),
        };
        let mut archetype = self.archetypes[from.index()].derive(id, signature.clone(), extra())?;
        for (index, query) in self.queries.iter_mut().enumerate() {
            if query.mask.matches(&signature) {
                query.archetypes.push(id);
                archetype.subscribers.push(QueryId(index as u32));
            }
        }
        for key in signature.keys().iter().filter(|k| is_relation(k)) {
            let list = self.related_archetypes.entry(key.target).or_default();
            if list.last() != Some(&id) {
                list.push(id);
            }
        }
        tracing::debug!(archetype = id.0, ?signature, "created archetype");
        if id.index() == self.archetypes.len() {
            self.archetypes.push(archetype);
        } else {
            self.free_archetypes.pop();
            self.archetypes[id.index()] = archetype;
        }
        self.archetype_index.insert(signature, id);
        Ok(id)
    }

    /// Move `entity` from `loc` into `dst`, appending `extra` if given.
    fn migrate(
        &mut self,
        entity: Identity,
        loc: EntityLocation,
        dst: ArchetypeId,
        extra: Option<(ComponentKey, Box<dyn Payload>)>,
    ) -> Result<(), EcsError> {
        let (src_arch, dst_arch) = pair_mut(&mut self.archetypes, loc.archetype, dst);
        let (row, displaced) = src_arch.move_row(loc.row, dst_arch, extra)?;
        self.fix_displaced(displaced, loc.row);
        self.locations.insert(
            entity,
            EntityLocation {
                archetype: dst,
                row,
            },
        );
        self.count_out(loc.archetype);
        self.count_in(dst);
        tracing::trace!(%entity, from = loc.archetype.0, to = dst.0, "migrated entity");
        Ok(())
    }

    fn fix_displaced(&mut self, displaced: Option<Identity>, row: usize) {
        if let Some(moved) = displaced {
            if let Some(loc) = self.locations.get_mut(&moved) {
                loc.row = row;
            }
        }
    }

    fn count_in(&mut self, archetype: ArchetypeId) {
        for query in &self.archetypes[archetype.index()].subscribers {
            self.queries[query.index()].count += 1;
        }
    }

    fn count_out(&mut self, archetype: ArchetypeId) {
        for query in &self.archetypes[archetype.index()].subscribers {
            self.queries[query.index()].count -= 1;
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Register `mask`, or return the existing state for an identical mask.
    pub(crate) fn register_query(&mut self, mask: QueryMask) -> QueryId {
        if let Some(&id) = self.query_index.get(&mask) {
            return id;
        }
        let id = QueryId(self.queries.len() as u32);
        let mut state = QueryState::new(mask.clone());
        for archetype in self.archetypes.iter_mut().filter(|a| !a.is_retired()) {
            if state.mask.matches(archetype.signature()) {
                state.archetypes.push(archetype.id());
                state.count += archetype.len();
                archetype.subscribers.push(id);
            }
        }
        tracing::debug!(query = id.0, archetypes = state.archetypes.len(), "registered query");
        self.queries.push(state);
        self.query_index.insert(mask, id);
        id
    }

    pub(crate) fn query_state(&self, id: QueryId) -> Option<&QueryState> {
        self.queries.get(id.index())
    }

    pub(crate) fn archetype_mut(&mut self, id: ArchetypeId) -> Option<&mut Archetype> {
        self.archetypes.get_mut(id.index()).filter(|a| !a.is_retired())
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    /// Current location of a placed entity.
    pub fn location(&self, entity: Identity) -> Result<EntityLocation, EcsError> {
        self.locations
            .get(&entity)
            .copied()
            .ok_or(EcsError::StaleEntity { entity })
    }

    pub fn archetype_of(&self, entity: Identity) -> Result<ArchetypeId, EcsError> {
        Ok(self.location(entity)?.archetype)
    }

    pub fn signature_of(&self, entity: Identity) -> Result<&Signature, EcsError> {
        let loc = self.location(entity)?;
        Ok(self.archetypes[loc.archetype.index()].signature())
    }

    pub fn archetype(&self, id: ArchetypeId) -> Option<&Archetype> {
        self.archetypes.get(id.index()).filter(|a| !a.is_retired())
    }

    /// Live archetypes in slot order.
    pub fn archetypes(&self) -> impl Iterator<Item = &Archetype> {
        self.archetypes.iter().filter(|a| !a.is_retired())
    }

    /// Number of placed entities.
    pub fn entity_count(&self) -> usize {
        self.locations.len()
    }

    /// Number of live archetypes. Retired slots are not counted.
    pub fn archetype_count(&self) -> usize {
        self.archetypes.len() - self.free_archetypes.len()
    }

    pub fn relations(&self) -> &RelationIndex {
        &self.relations
    }

    /// Check every cross-structure invariant, reporting the first violation.
    ///
    /// Intended for debug builds and tests; it walks every row.
    pub fn validate(&self) -> Result<(), EcsError> {
        let fail = |details: String| Err(EcsError::Inconsistent { details });

        let retired = self.archetypes.iter().filter(|a| a.is_retired()).count();
        if retired != self.free_archetypes.len() {
            return fail(format!(
                "{retired} retired archetypes but {} free slots",
                self.free_archetypes.len()
            ));
        }
        if self.archetype_index.len() != self.archetype_count() {
            return fail(format!(
                "{} indexed signatures for {} archetypes",
                self.archetype_index.len(),
                self.archetype_count()
            ));
        }

        let mut rows = 0usize;
        let mut indexed = 0usize;
        for archetype in self.archetypes() {
            if !archetype.is_dense() {
                return fail(format!("archetype {} has ragged columns", archetype.id().0));
            }
            if self.archetype_index.get(archetype.signature()) != Some(&archetype.id()) {
                return fail(format!("archetype {} missing from index", archetype.id().0));
            }
            for (row, &entity) in archetype.entities().iter().enumerate() {
                let expected = EntityLocation {
                    archetype: archetype.id(),
                    row,
                };
                if self.locations.get(&entity) != Some(&expected) {
                    return fail(format!("{entity} is not recorded at its row"));
                }
                if !self.allocator.is_current(entity) {
                    return fail(format!("{entity} is placed but its slot is free"));
                }
            }
            rows += archetype.len();

            for key in archetype.signature().keys().iter().filter(|k| is_relation(k)) {
                if !self.is_alive(key.target) {
                    return fail(format!("archetype {} relates to dead {}", archetype.id().0, key.target));
                }
                let listed = self
                    .related_archetypes
                    .get(&key.target)
                    .is_some_and(|ids| ids.contains(&archetype.id()));
                if !listed {
                    return fail(format!("archetype {} not listed under {}", archetype.id().0, key.target));
                }
            }
            for key in archetype.signature().keys().iter().filter(|k| k.is_targeted()) {
                for &entity in archetype.entities() {
                    if !self.relations.holders(key).any(|h| h == entity) {
                        return fail(format!("{entity} holds {key} but is not indexed"));
                    }
                }
                indexed += archetype.len();
            }
        }
        if rows != self.locations.len() {
            return fail(format!(
                "{} locations recorded for {rows} rows",
                self.locations.len()
            ));
        }
        let index_total: usize = self.relations.entries().map(|(_, set)| set.len()).sum();
        if index_total != indexed {
            return fail(format!("relation index holds {index_total} entries, expected {indexed}"));
        }

        for (index, query) in self.queries.iter().enumerate() {
            let expected: usize = self
                .archetypes()
                .filter(|a| query.mask.matches(a.signature()))
                .map(Archetype::len)
                .sum();
            if query.count != expected {
                return fail(format!("query {index} counts {} of {expected}", query.count));
            }
        }
        Ok(())
    }
}

impl Default for ArchetypeStore {
    fn default() -> Self {
        Self::with_capacity(0)
    }
}

/// A targeted key pointing at an entity rather than a pooled object.
fn is_relation(key: &ComponentKey) -> bool {
    key.is_targeted() && !key.is_link()
}

/// Borrow two distinct archetypes mutably.
fn pair_mut(
    archetypes: &mut [Archetype],
    a: ArchetypeId,
    b: ArchetypeId,
) -> (&mut Archetype, &mut Archetype) {
    let (a, b) = (a.index(), b.index());
    debug_assert_ne!(a, b, "migration within one archetype");
    if a < b {
        let (lo, hi) = archetypes.split_at_mut(b);
        (&mut lo[a], &mut hi[0])
    } else {
        let (lo, hi) = archetypes.split_at_mut(a);
        (&mut hi[0], &mut lo[b])
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
