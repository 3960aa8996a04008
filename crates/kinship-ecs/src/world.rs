//! The [`World`]: entity lifecycle, components, relations, links, locking.
//!
//! A world is either unlocked, where every mutation is applied immediately,
//! or locked, where structural mutations are queued and observers keep
//! seeing the committed state. [`World::unlock`] replays the queue in issue
//! order through the same `apply_*` paths the immediate mode uses.

use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::archetype::{ArchetypeId, Value};
use crate::command::{Command, CommandKind, CommandQueue, ReplayReport};
use crate::component::{Component, ComponentKey, ComponentTypeId, Signature};
use crate::config::WorldConfig;
use crate::identity::Identity;
use crate::query::QueryBuilder;
use crate::reference::{Link, LinkPayload, ReferenceStore};
use crate::store::ArchetypeStore;
use crate::EcsError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Unlocked,
    Locked,
}

// ---------------------------------------------------------------------------
// World
// ---------------------------------------------------------------------------

/// Source of per-process unique world ids. Query handles carry one.
static NEXT_WORLD_ID: AtomicU64 = AtomicU64::new(1);

/// Owns all entities, their components, and the shared-object pool.
pub struct World {
    id: u64,
    store: ArchetypeStore,
    references: ReferenceStore,
    phase: Phase,
    deferred: CommandQueue,
    config: WorldConfig,
    last_replay: ReplayReport,
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("entity_count", &self.store.entity_count())
            .field("archetype_count", &self.store.archetype_count())
            .field("phase", &self.phase)
            .field("deferred", &self.deferred.len())
            .finish()
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl World {
    /// Create an empty world with default settings.
    pub fn new() -> Self {
        Self::with_config(WorldConfig::default())
    }

    pub fn with_config(config: WorldConfig) -> Self {
        Self {
            id: NEXT_WORLD_ID.fetch_add(1, Ordering::Relaxed),
            store: ArchetypeStore::with_capacity(config.entity_capacity),
            references: ReferenceStore::with_capacity(config.reference_capacity),
            phase: Phase::Unlocked,
            deferred: CommandQueue::new(),
            config,
            last_replay: ReplayReport::default(),
        }
    }

    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    // -- entity lifecycle ---------------------------------------------------

    /// Spawn an entity with no components.
    ///
    /// While locked the returned identity is only reserved: it is not alive
    /// until [`unlock`](Self::unlock), but commands may already target it.
    pub fn spawn(&mut self) -> Identity {
        match self.phase {
            Phase::Unlocked => self.store.spawn(),
            Phase::Locked => {
                let entity = self.store.reserve();
                self.deferred.spawn(entity);
                entity
            }
        }
    }

    /// Despawn `entity`, stripping relations that target it from their
    /// holders and releasing the objects it links to.
    pub fn despawn(&mut self, entity: Identity) -> Result<(), EcsError> {
        if self.is_locked() {
            self.check_known(entity)?;
            self.deferred.despawn(entity);
            return Ok(());
        }
        self.apply_despawn(entity)
    }

    /// Whether `entity` is alive in committed state.
    pub fn is_alive(&self, entity: Identity) -> bool {
        self.store.is_alive(entity)
    }

    /// Number of live entities.
    pub fn count(&self) -> usize {
        self.store.entity_count()
    }

    pub fn archetype_count(&self) -> usize {
        self.store.archetype_count()
    }

    pub fn archetype_of(&self, entity: Identity) -> Result<ArchetypeId, EcsError> {
        self.store.archetype_of(entity)
    }

    pub fn signature_of(&self, entity: Identity) -> Result<&Signature, EcsError> {
        self.store.signature_of(entity)
    }

    // -- plain components ---------------------------------------------------

    /// Add a plain component. Fails if `entity` already has a `T`.
    pub fn add<T: Component>(&mut self, entity: Identity, value: T) -> Result<(), EcsError> {
        self.add_keyed(entity, ComponentKey::plain::<T>(), value)
    }

    /// Add `T::default()`.
    pub fn add_default<T: Component + Default>(&mut self, entity: Identity) -> Result<(), EcsError> {
        self.add(entity, T::default())
    }

    pub fn remove<T: Component>(&mut self, entity: Identity) -> Result<(), EcsError> {
        self.remove_keyed(entity, ComponentKey::plain::<T>())
    }

    /// Whether `entity` is alive and has a plain `T`. Never fails.
    pub fn has<T: Component>(&self, entity: Identity) -> bool {
        self.store.has(entity, &ComponentKey::plain::<T>())
    }

    pub fn get<T: Component>(&self, entity: Identity) -> Result<&T, EcsError> {
        self.store.get(entity, &ComponentKey::plain::<T>())
    }

    pub fn get_mut<T: Component>(&mut self, entity: Identity) -> Result<&mut T, EcsError> {
        self.store.get_mut(entity, &ComponentKey::plain::<T>())
    }

    // -- relations ----------------------------------------------------------

    /// Add a `T` relation from `entity` to the live entity `target`.
    ///
    /// An entity may hold one `T` per distinct target.
    pub fn add_relation<T: Component>(
        &mut self,
        entity: Identity,
        target: Identity,
        value: T,
    ) -> Result<(), EcsError> {
        if !target.is_entity() {
            return Err(EcsError::InvalidTarget { target });
        }
        self.add_keyed(entity, ComponentKey::targeting::<T>(target), value)
    }

    pub fn remove_relation<T: Component>(
        &mut self,
        entity: Identity,
        target: Identity,
    ) -> Result<(), EcsError> {
        self.remove_keyed(entity, ComponentKey::targeting::<T>(target))
    }

    /// Whether `entity` holds a `T` relation to `target` (or to anything, for
    /// [`Identity::ANY`]).
    pub fn has_relation<T: Component>(&self, entity: Identity, target: Identity) -> bool {
        self.store
            .has(entity, &ComponentKey::targeting::<T>(target))
    }

    pub fn get_relation<T: Component>(
        &self,
        entity: Identity,
        target: Identity,
    ) -> Result<&T, EcsError> {
        self.store
            .get(entity, &ComponentKey::targeting::<T>(target))
    }

    /// Every distinct target of a `T` relation or link that has at least one
    /// holder.
    pub fn collect_targets<T: Component>(&self) -> Vec<Identity> {
        self.store.collect_targets(ComponentTypeId::of::<T>())
    }

    // -- links --------------------------------------------------------------

    /// Link `entity` to the shared object `item`, tracking it in the
    /// reference pool.
    pub fn add_link<T>(&mut self, entity: Identity, item: Arc<T>) -> Result<(), EcsError>
    where
        T: Hash + Component,
    {
        if self.is_locked() {
            self.check_known(entity)?;
            self.deferred.add_link(entity, item);
            return Ok(());
        }
        self.apply_link(entity, Box::new(Link(item)))
    }

    pub fn remove_link<T: Hash + Component>(
        &mut self,
        entity: Identity,
        item: &T,
    ) -> Result<(), EcsError> {
        self.remove_keyed(entity, ComponentKey::targeting::<T>(Identity::of(item)))
    }

    pub fn has_link<T: Hash + Component>(&self, entity: Identity, item: &T) -> bool {
        self.store
            .has(entity, &ComponentKey::targeting::<T>(Identity::of(item)))
    }

    /// The shared object `entity` links to for `item`.
    pub fn get_link<T: Hash + Component>(
        &self,
        entity: Identity,
        item: &T,
    ) -> Result<&Arc<T>, EcsError> {
        self.store
            .get(entity, &ComponentKey::targeting::<T>(Identity::of(item)))
    }

    pub fn references(&self) -> &ReferenceStore {
        &self.references
    }

    // -- locking ------------------------------------------------------------

    /// Enter deferred mode.
    pub fn lock(&mut self) -> Result<(), EcsError> {
        if self.is_locked() {
            return Err(EcsError::AlreadyLocked);
        }
        self.phase = Phase::Locked;
        tracing::trace!("world locked");
        Ok(())
    }

    /// Leave deferred mode and replay every queued command in order.
    ///
    /// Replay does not stop at a failing command. The first failure is
    /// returned as [`EcsError::Deferred`]; all failures are logged and
    /// counted in [`last_replay_report`](Self::last_replay_report).
    pub fn unlock(&mut self) -> Result<(), EcsError> {
        if !self.is_locked() {
            return Err(EcsError::NotLocked);
        }
        self.phase = Phase::Unlocked;
        let commands = self.deferred.drain();
        self.replay(commands)
    }

    pub fn is_locked(&self) -> bool {
        self.phase == Phase::Locked
    }

    /// Commands waiting for [`unlock`](Self::unlock).
    pub fn pending(&self) -> &[Command] {
        self.deferred.commands()
    }

    pub fn last_replay_report(&self) -> ReplayReport {
        self.last_replay
    }

    /// Start building a live query.
    pub fn query(&mut self) -> QueryBuilder<'_> {
        QueryBuilder::new(self)
    }

    /// Full consistency check of the storage structures.
    pub fn validate(&self) -> Result<(), EcsError> {
        self.store.validate()
    }

    // -- internals ----------------------------------------------------------

    pub(crate) fn store(&self) -> &ArchetypeStore {
        &self.store
    }

    pub(crate) fn store_mut(&mut self) -> &mut ArchetypeStore {
        &mut self.store
    }

    pub(crate) fn iteration_parts(&mut self) -> (&mut ArchetypeStore, &mut CommandQueue) {
        (&mut self.store, &mut self.deferred)
    }

    /// Deferred commands may target entities reserved in the same lock.
    fn check_known(&self, entity: Identity) -> Result<(), EcsError> {
        if self.store.is_alive(entity) || self.store.is_reserved(entity) {
            Ok(())
        } else {
            Err(EcsError::StaleEntity { entity })
        }
    }

    fn add_keyed<T: Component>(
        &mut self,
        entity: Identity,
        key: ComponentKey,
        value: T,
    ) -> Result<(), EcsError> {
        if self.is_locked() {
            self.check_known(entity)?;
            self.deferred.push_add(entity, key, value);
            return Ok(());
        }
        self.store.add(entity, key, Box::new(Value(value)))
    }

    fn remove_keyed(&mut self, entity: Identity, key: ComponentKey) -> Result<(), EcsError> {
        if self.is_locked() {
            self.check_known(entity)?;
            self.deferred.push_remove(entity, key);
            return Ok(());
        }
        self.apply_remove(entity, key)
    }

    fn apply_despawn(&mut self, entity: Identity) -> Result<(), EcsError> {
        let links = self.store.despawn(entity)?;
        for object in links {
            self.references.release(object)?;
        }
        tracing::trace!(%entity, "despawned");
        Ok(())
    }

    fn apply_remove(&mut self, entity: Identity, key: ComponentKey) -> Result<(), EcsError> {
        self.store.remove(entity, key)?;
        if key.is_link() {
            self.references.release(key.target)?;
        }
        Ok(())
    }

    fn apply_link(&mut self, entity: Identity, link: Box<dyn LinkPayload>) -> Result<(), EcsError> {
        let key = link.key();
        self.store.location(entity)?;
        if self.store.has(entity, &key) {
            return Err(EcsError::ComponentAlreadyPresent {
                entity,
                component: key.to_string(),
            });
        }
        link.request(&self.references)?;
        match self.store.add(entity, key, link.into_payload()) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.references.release(key.target)?;
                Err(err)
            }
        }
    }

    fn apply(&mut self, command: Command) -> Result<(), EcsError> {
        let entity = command.entity;
        match command.kind {
            CommandKind::Spawn => self.store.place(entity),
            CommandKind::Despawn => self.apply_despawn(entity),
            CommandKind::Add { key, value } => self.store.add(entity, key, value),
            CommandKind::AddLink { link } => self.apply_link(entity, link),
            CommandKind::Remove { key } => self.apply_remove(entity, key),
        }
    }

    fn replay(&mut self, commands: Vec<Command>) -> Result<(), EcsError> {
        let mut report = ReplayReport::default();
        let mut first_failure = None;

        for (index, command) in commands.into_iter().enumerate() {
            let name = command.name();
            let entity = command.entity;
            match self.apply(command) {
                Ok(()) => report.applied += 1,
                Err(source) => {
                    report.failed += 1;
                    tracing::warn!(
                        command_index = index,
                        command = name,
                        %entity,
                        error = %source,
                        "deferred command failed"
                    );
                    first_failure.get_or_insert(EcsError::Deferred {
                        index,
                        command: name,
                        source: Box::new(source),
                    });
                }
            }
        }

        self.last_replay = report;
        if report.total() > 0 {
            tracing::debug!(applied = report.applied, failed = report.failed, "replayed deferred commands");
        }
        let validation = if self.config.validate_on_unlock {
            self.store.validate()
        } else {
            Ok(())
        };
        settle_replay(first_failure, validation)
    }
}

/// Outcome of an unlock: the first failed command wins over a validation
/// error, which is logged so it is not lost.
fn settle_replay(
    first_failure: Option<EcsError>,
    validation: Result<(), EcsError>,
) -> Result<(), EcsError> {
    match (first_failure, validation) {
        (None, validation) => validation,
        (Some(failure), Ok(())) => Err(failure),
        (Some(failure), Err(inconsistency)) => {
            tracing::error!(error = %inconsistency, "validation failed after a failed replay");
            Err(failure)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
