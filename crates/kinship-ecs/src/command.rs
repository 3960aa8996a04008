//! Deferred structural mutations recorded while a world is locked.
//!
//! A [`CommandQueue`] collects spawn, despawn, add, and remove requests
//! (including relations and links) in issue order. When the world unlocks,
//! it replays the queue strictly FIFO through the same entry points that
//! immediate mutations use, so a deferred sequence behaves exactly like the
//! same sequence issued unlocked.
//!
//! Component values travel type-erased, so a queue can hold any mix of
//! component types.
//!
//! # Example
//!
//! ```
//! use kinship_ecs::prelude::*;
//!
//! #[derive(Debug, PartialEq)]
//! struct Health(u32);
//!
//! let mut world = World::new();
//! let entity = world.spawn();
//!
//! world.lock().unwrap();
//! world.add(entity, Health(100)).unwrap();
//! assert!(!world.has::<Health>(entity));
//!
//! world.unlock().unwrap();
//! assert_eq!(world.get::<Health>(entity).unwrap(), &Health(100));
//! assert_eq!(world.last_replay_report().applied, 1);
//! ```

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use crate::archetype::{Payload, Value};
use crate::component::{Component, ComponentKey};
use crate::identity::Identity;
use crate::reference::{Link, LinkPayload};

// ---------------------------------------------------------------------------
// CommandKind
// ---------------------------------------------------------------------------

/// What a deferred command does.
pub(crate) enum CommandKind {
    /// Place an identity that was reserved while locked.
    Spawn,
    Despawn,
    /// Add a plain component or a relation (decided by the key's target).
    Add {
        key: ComponentKey,
        value: Box<dyn Payload>,
    },
    /// Track the referenced object, then add the link.
    AddLink { link: Box<dyn LinkPayload> },
    /// Remove a plain component, relation, or link.
    Remove { key: ComponentKey },
}

// ---------------------------------------------------------------------------
// Command
// ---------------------------------------------------------------------------

/// A single queued mutation against one entity.
pub struct Command {
    pub(crate) entity: Identity,
    pub(crate) kind: CommandKind,
}

impl Command {
    /// The entity the command applies to.
    pub fn entity(&self) -> Identity {
        self.entity
    }

    /// Short operation name used in errors and logs.
    pub fn name(&self) -> &'static str {
        match &self.kind {
            CommandKind::Spawn => "spawn",
            CommandKind::Despawn => "despawn",
            CommandKind::Add { key, .. } if key.is_targeted() => "add_relation",
            CommandKind::Add { .. } => "add",
            CommandKind::AddLink { .. } => "add_link",
            CommandKind::Remove { key } if key.is_link() => "remove_link",
            CommandKind::Remove { key } if key.is_targeted() => "remove_relation",
            CommandKind::Remove { .. } => "remove",
        }
    }

    /// The component key involved, if any.
    pub fn key(&self) -> Option<ComponentKey> {
        match &self.kind {
            CommandKind::Spawn | CommandKind::Despawn => None,
            CommandKind::Add { key, .. } | CommandKind::Remove { key } => Some(*key),
            CommandKind::AddLink { link } => Some(link.key()),
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Command");
        s.field("op", &self.name()).field("entity", &self.entity);
        if let Some(key) = self.key() {
            s.field("key", &key);
        }
        if let CommandKind::Add { value, .. } = &self.kind {
            s.field("value_type", &value.type_name());
        }
        s.finish()
    }
}

// ---------------------------------------------------------------------------
// ReplayReport
// ---------------------------------------------------------------------------

/// Outcome of the most recent replay of deferred commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Commands that changed the world.
    pub applied: usize,
    /// Commands that failed and were skipped.
    pub failed: usize,
}

impl ReplayReport {
    pub fn total(&self) -> usize {
        self.applied + self.failed
    }
}

// ---------------------------------------------------------------------------
// CommandQueue
// ---------------------------------------------------------------------------

/// FIFO queue of deferred mutations.
#[derive(Debug, Default)]
pub struct CommandQueue {
    commands: Vec<Command>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, entity: Identity, kind: CommandKind) {
        let command = Command { entity, kind };
        tracing::trace!(op = command.name(), %entity, "deferred command");
        self.commands.push(command);
    }

    pub(crate) fn spawn(&mut self, entity: Identity) {
        self.push(entity, CommandKind::Spawn);
    }

    pub fn despawn(&mut self, entity: Identity) {
        self.push(entity, CommandKind::Despawn);
    }

    /// Queue adding a plain component.
    pub fn add<T: Component>(&mut self, entity: Identity, value: T) {
        self.push_add(entity, ComponentKey::plain::<T>(), value);
    }

    /// Queue adding a `T` relation from `entity` to `target`.
    pub fn add_relation<T: Component>(&mut self, entity: Identity, target: Identity, value: T) {
        self.push_add(entity, ComponentKey::targeting::<T>(target), value);
    }

    pub(crate) fn push_add<T: Component>(&mut self, entity: Identity, key: ComponentKey, value: T) {
        self.push(
            entity,
            CommandKind::Add {
                key,
                value: Box::new(Value(value)),
            },
        );
    }

    /// Queue linking `entity` to the shared object `item`.
    pub fn add_link<T: Hash + Component>(&mut self, entity: Identity, item: Arc<T>) {
        self.push(
            entity,
            CommandKind::AddLink {
                link: Box::new(Link(item)),
            },
        );
    }

    /// Queue removing a plain component.
    pub fn remove<T: Component>(&mut self, entity: Identity) {
        self.push_remove(entity, ComponentKey::plain::<T>());
    }

    /// Queue removing the `T` relation from `entity` to `target`.
    pub fn remove_relation<T: Component>(&mut self, entity: Identity, target: Identity) {
        self.push_remove(entity, ComponentKey::targeting::<T>(target));
    }

    /// Queue removing the link from `entity` to `item`.
    pub fn remove_link<T: Hash + Component>(&mut self, entity: Identity, item: &T) {
        self.push_remove(entity, ComponentKey::targeting::<T>(Identity::of(item)));
    }

    pub(crate) fn push_remove(&mut self, entity: Identity, key: ComponentKey) {
        self.push(entity, CommandKind::Remove { key });
    }

    /// Queued commands in replay order.
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Take every queued command, leaving the queue empty.
    pub(crate) fn drain(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.commands)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
