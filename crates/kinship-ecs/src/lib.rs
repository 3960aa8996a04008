//! Kinship ECS -- archetype-based entity-component store with relations.
//!
//! Entities are packed 64-bit [`Identity`](identity::Identity) values with a
//! generation that is bumped on every slot reuse, so stale handles are
//! detected immediately. Components live in archetypes (one per exact set of
//! component keys) in a Structure-of-Arrays layout.
//!
//! Beyond plain components, an entity can hold:
//! - **relations**: a component parameterized by a target entity, one per
//!   target. Despawning the target strips the relation from every holder.
//! - **links**: a component pointing at a shared, reference-counted object
//!   from the world's [`ReferenceStore`](reference::ReferenceStore).
//!
//! A world can be locked; structural changes made while locked are queued and
//! replayed in order on unlock. Live [`Query`](query::Query) handles keep an
//! exact, incrementally maintained count of their matching entities.
//!
//! # Quick Start
//!
//! ```
//! use kinship_ecs::prelude::*;
//!
//! #[derive(Debug, PartialEq)]
//! struct Position { x: f32, y: f32 }
//!
//! struct ChildOf;
//!
//! let mut world = World::new();
//! let parent = world.spawn();
//! let child = world.spawn();
//! world.add(child, Position { x: 0.0, y: 1.0 }).unwrap();
//! world.add_relation(child, parent, ChildOf).unwrap();
//!
//! let children = world.query().has_relation::<ChildOf>(parent).build();
//! assert_eq!(children.count(&world), 1);
//!
//! world.despawn(parent).unwrap();
//! assert!(world.is_alive(child));
//! assert!(!world.has_relation::<ChildOf>(child, parent));
//! assert_eq!(children.count(&world), 0);
//! ```

#![deny(unsafe_code)]

pub mod archetype;
pub mod command;
pub mod component;
pub mod config;
pub mod entity;
pub mod identity;
pub mod query;
pub mod reference;
pub mod relation;
pub mod store;
pub mod world;

use identity::Identity;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by ECS operations.
#[derive(Debug, thiserror::Error)]
pub enum EcsError {
    /// The entity is not alive (stale generation or never spawned).
    #[error("entity {entity} is not alive")]
    StaleEntity { entity: Identity },

    /// An entity-only operation was applied to an object or virtual identity.
    #[error("{identity} is not an entity")]
    NotAnEntity { identity: Identity },

    /// A relation target that is neither a live entity nor an object.
    #[error("{target} is not a valid relation or link target")]
    InvalidTarget { target: Identity },

    #[error("entity {entity} already has {component}")]
    ComponentAlreadyPresent { entity: Identity, component: String },

    /// Removal of a component the entity does not have.
    #[error("entity {entity} has no {component} to remove")]
    ComponentAbsent { entity: Identity, component: String },

    #[error("component {component} not found on entity {entity}")]
    ComponentNotFound { entity: Identity, component: String },

    #[error("world is already locked")]
    AlreadyLocked,

    #[error("world is not locked")]
    NotLocked,

    /// A different object already occupies this identity in the reference
    /// pool.
    #[error("identity collision at {identity}: already tracking a different {type_name}")]
    ReferenceCollision {
        identity: Identity,
        type_name: &'static str,
    },

    #[error("no object is tracked for {identity}")]
    ReferenceNotTracked { identity: Identity },

    /// The tracked object exists but is not of the requested type.
    #[error("object {identity} is a {found}, not a {expected}")]
    ReferenceTypeMismatch {
        identity: Identity,
        expected: &'static str,
        found: &'static str,
    },

    /// The first deferred command that failed during an unlock replay.
    #[error("deferred command #{index} ({command}) failed: {source}")]
    Deferred {
        index: usize,
        command: &'static str,
        source: Box<EcsError>,
    },

    #[error("invalid configuration: {details}")]
    Config { details: String },

    /// Internal bookkeeping disagrees with itself.
    #[error("storage inconsistency: {details}")]
    Inconsistent { details: String },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::archetype::{Archetype, ArchetypeId};
    pub use crate::command::{Command, CommandQueue, ReplayReport};
    pub use crate::component::{Component, ComponentKey, ComponentTypeId, Signature, TypeRegistry};
    pub use crate::config::WorldConfig;
    pub use crate::identity::Identity;
    pub use crate::query::{Query, QueryBuilder};
    pub use crate::reference::ReferenceStore;
    pub use crate::world::World;
    pub use crate::EcsError;
}

// ---------------------------------------------------------------------------
// Integration Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::prelude::*;
    use std::sync::Arc;

    // -- test component types -----------------------------------------------

    #[derive(Debug, Clone, PartialEq)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Velocity {
        dx: f32,
        dy: f32,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Health(u32);

    #[derive(Debug, PartialEq)]
    struct ChildOf;

    fn spawn_with<T: Component>(world: &mut World, value: T) -> Identity {
        let e = world.spawn();
        world.add(e, value).unwrap();
        e
    }

    // -- spawn / despawn integration ----------------------------------------

    #[test]
    fn despawn_entity_verify_gone() {
        let mut world = World::new();
        let e = spawn_with(&mut world, Position { x: 1.0, y: 2.0 });
        assert!(world.is_alive(e));
        world.despawn(e).unwrap();
        assert!(!world.is_alive(e));
        assert_eq!(world.count(), 0);
        assert!(matches!(world.despawn(e), Err(EcsError::StaleEntity { .. })));
    }

    #[test]
    fn respawn_reuses_slot_with_new_generation() {
        let mut world = World::new();
        let a = world.spawn();
        world.despawn(a).unwrap();
        let b = world.spawn();
        assert_eq!(b.id(), a.id());
        assert_eq!(b, a.successor().unwrap());
        assert!(!world.is_alive(a));
        assert!(world.is_alive(b));
    }

    // -- migration integration ----------------------------------------------

    #[test]
    fn insert_component_triggers_migration() {
        let mut world = World::new();
        let e = spawn_with(&mut world, Position { x: 1.0, y: 2.0 });
        let before = world.archetype_of(e).unwrap();
        world.add(e, Velocity { dx: 3.0, dy: 4.0 }).unwrap();
        assert_ne!(world.archetype_of(e).unwrap(), before);
        assert_eq!(world.get::<Position>(e).unwrap(), &Position { x: 1.0, y: 2.0 });
        assert_eq!(world.get::<Velocity>(e).unwrap(), &Velocity { dx: 3.0, dy: 4.0 });
    }

    #[test]
    fn remove_component_triggers_migration() {
        let mut world = World::new();
        let e = spawn_with(&mut world, Position { x: 1.0, y: 2.0 });
        world.add(e, Velocity { dx: 3.0, dy: 4.0 }).unwrap();
        world.remove::<Velocity>(e).unwrap();
        assert!(!world.has::<Velocity>(e));
        assert_eq!(world.get::<Position>(e).unwrap(), &Position { x: 1.0, y: 2.0 });
        assert!(matches!(
            world.remove::<Velocity>(e),
            Err(EcsError::ComponentAbsent { .. })
        ));
    }

    #[test]
    fn add_existing_component_is_rejected() {
        let mut world = World::new();
        let e = spawn_with(&mut world, Position { x: 1.0, y: 2.0 });
        let err = world.add(e, Position { x: 99.0, y: 100.0 }).unwrap_err();
        assert!(matches!(err, EcsError::ComponentAlreadyPresent { .. }));
        assert_eq!(world.get::<Position>(e).unwrap(), &Position { x: 1.0, y: 2.0 });
    }

    #[test]
    fn multiple_entities_same_archetype() {
        let mut world = World::new();
        let e1 = spawn_with(&mut world, Position { x: 1.0, y: 1.0 });
        let e2 = spawn_with(&mut world, Position { x: 2.0, y: 2.0 });
        let e3 = spawn_with(&mut world, Position { x: 3.0, y: 3.0 });
        assert_eq!(world.archetype_of(e1).unwrap(), world.archetype_of(e3).unwrap());

        world.despawn(e2).unwrap();
        assert_eq!(world.count(), 2);
        assert_eq!(world.get::<Position>(e1).unwrap(), &Position { x: 1.0, y: 1.0 });
        assert_eq!(world.get::<Position>(e3).unwrap(), &Position { x: 3.0, y: 3.0 });
        world.validate().unwrap();
    }

    // -- scale test ---------------------------------------------------------

    #[test]
    fn scale_10k_entities() {
        let mut world = World::new();
        let query = world.query().has::<Position>().has::<Velocity>().build();

        let mut entities = Vec::with_capacity(10_000);
        for i in 0..10_000u32 {
            let e = spawn_with(
                &mut world,
                Position {
                    x: i as f32,
                    y: i as f32 * 2.0,
                },
            );
            world.add(e, Velocity { dx: 1.0, dy: -1.0 }).unwrap();
            entities.push(e);
        }
        assert_eq!(query.count(&world), 10_000);

        query
            .for_each_mut::<Velocity>(&mut world, |_, vel, _| {
                vel.dx *= 2.0;
                vel.dy *= 2.0;
            })
            .unwrap();
        assert_eq!(world.get::<Velocity>(entities[0]).unwrap(), &Velocity { dx: 2.0, dy: -2.0 });

        for e in entities.iter().take(5_000) {
            world.despawn(*e).unwrap();
        }
        assert_eq!(query.count(&world), 5_000);
        assert_eq!(query.entities(&world).len(), 5_000);
        assert_eq!(world.count(), 5_000);
    }

    // -- relations + locking ------------------------------------------------

    #[test]
    fn relation_holders_survive_target_despawn() {
        let mut world = World::new();
        let parent = world.spawn();
        let kids: Vec<Identity> = (0..50).map(|_| world.spawn()).collect();
        for &kid in &kids {
            world.add_relation(kid, parent, ChildOf).unwrap();
            world.add(kid, Health(1)).unwrap();
        }
        world.despawn(parent).unwrap();
        for &kid in &kids {
            assert!(world.is_alive(kid));
            assert!(!world.has_relation::<ChildOf>(kid, Identity::ANY));
            assert_eq!(world.get::<Health>(kid).unwrap(), &Health(1));
        }
        world.validate().unwrap();
    }

    #[test]
    fn locked_observers_see_committed_state() {
        let mut world = World::new();
        let e = spawn_with(&mut world, Health(5));
        let query = world.query().has::<Health>().build();

        world.lock().unwrap();
        world.remove::<Health>(e).unwrap();
        world.despawn(e).unwrap();
        assert!(world.is_alive(e));
        assert!(world.has::<Health>(e));
        assert_eq!(query.count(&world), 1);

        world.unlock().unwrap();
        assert!(!world.is_alive(e));
        assert_eq!(query.count(&world), 0);
    }

    #[test]
    fn deferred_link_is_tracked_on_unlock() {
        let mut world = World::new();
        let e = world.spawn();
        let shared = Arc::new(String::from("atlas"));

        world.lock().unwrap();
        world.add_link(e, shared.clone()).unwrap();
        assert!(world.references().is_empty());
        world.unlock().unwrap();

        assert!(world.has_link(e, &*shared));
        assert_eq!(world.references().len(), 1);
    }

    #[test]
    fn errors_render_readably() {
        let e = Identity::entity(1, 1);
        let err = EcsError::Deferred {
            index: 2,
            command: "despawn",
            source: Box::new(EcsError::StaleEntity { entity: e }),
        };
        let text = err.to_string();
        assert!(text.contains("#2"), "{text}");
        assert!(text.contains("despawn"), "{text}");
        assert!(std::error::Error::source(&err).is_some());
    }
}
