//! Component type identity, keys, and archetype signatures.
//!
//! Every Rust type stored in the world is assigned a small [`ComponentTypeId`]
//! by the process-wide [`TypeRegistry`] the first time it is seen. A
//! [`ComponentKey`] pairs a type-id with a target [`Identity`], which is how
//! relations (entity targets) and links (object targets) become distinct
//! columns. A [`Signature`] is the sorted set of keys an archetype stores.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::identity::Identity;

// ---------------------------------------------------------------------------
// Component
// ---------------------------------------------------------------------------

/// Marker for types that can be stored as component data.
///
/// Implemented for every `Send + Sync + 'static` type.
pub trait Component: Send + Sync + 'static {}

impl<T: Send + Sync + 'static> Component for T {}

// ---------------------------------------------------------------------------
// ComponentTypeId
// ---------------------------------------------------------------------------

/// Opaque, lightweight identifier for a registered type.
///
/// Ids start at 1 and stay below `i16::MAX` so they fit an [`Identity`]
/// decoration in both signs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentTypeId(pub(crate) u16);

impl ComponentTypeId {
    /// The id for `T`, registering it on first use.
    #[inline]
    pub fn of<T: ?Sized + 'static>() -> Self {
        TypeRegistry::identify::<T>()
    }

    #[inline]
    pub(crate) const fn from_index(index: u16) -> Self {
        Self(index)
    }

    /// The numeric id.
    #[inline]
    pub const fn index(self) -> u16 {
        self.0
    }

    /// Rust type name, or `"?"` for ids this process never issued.
    pub fn name(self) -> &'static str {
        TypeRegistry::resolve(self).map_or("?", |d| d.name)
    }
}

impl fmt::Debug for ComponentTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentTypeId({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// TypeRegistry
// ---------------------------------------------------------------------------

/// What the registry knows about a type.
#[derive(Debug, Clone, Copy)]
pub struct TypeDescriptor {
    /// Id assigned at registration time.
    pub id: ComponentTypeId,
    /// `std::any::type_name::<T>()`.
    pub name: &'static str,
    /// Rust `TypeId` for runtime type checking.
    pub type_id: TypeId,
}

/// Process-wide map from Rust types to [`ComponentTypeId`]s.
///
/// Ids are stable for the lifetime of the process but not across runs.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    by_type: HashMap<TypeId, ComponentTypeId>,
    /// Indexed by `ComponentTypeId.0 - 1`.
    descriptors: Vec<TypeDescriptor>,
}

static REGISTRY: OnceLock<RwLock<TypeRegistry>> = OnceLock::new();

impl TypeRegistry {
    /// Highest id the registry hands out.
    pub const MAX_TYPES: u16 = i16::MAX as u16 - 1;

    fn global() -> &'static RwLock<TypeRegistry> {
        REGISTRY.get_or_init(|| RwLock::new(TypeRegistry::default()))
    }

    /// Return the id for `T`, assigning the next free one on first sight.
    ///
    /// # Panics
    ///
    /// Panics if more than [`MAX_TYPES`](Self::MAX_TYPES) distinct types are
    /// registered.
    pub fn identify<T: ?Sized + 'static>() -> ComponentTypeId {
        let rust_type_id = TypeId::of::<T>();
        if let Some(&id) = Self::global().read().by_type.get(&rust_type_id) {
            return id;
        }

        let mut registry = Self::global().write();
        // Another thread may have won the race between the two locks.
        if let Some(&id) = registry.by_type.get(&rust_type_id) {
            return id;
        }
        let next = registry.descriptors.len() + 1;
        assert!(
            next <= Self::MAX_TYPES as usize,
            "type registry exhausted: more than {} component types",
            Self::MAX_TYPES
        );
        let id = ComponentTypeId(next as u16);
        registry.descriptors.push(TypeDescriptor {
            id,
            name: std::any::type_name::<T>(),
            type_id: rust_type_id,
        });
        registry.by_type.insert(rust_type_id, id);
        tracing::trace!(type_id = id.0, name = std::any::type_name::<T>(), "registered type");
        id
    }

    /// Look up a previously issued id.
    pub fn resolve(id: ComponentTypeId) -> Option<TypeDescriptor> {
        let index = usize::from(id.0).checked_sub(1)?;
        Self::global().read().descriptors.get(index).copied()
    }

    /// Number of types registered so far in this process.
    pub fn len() -> usize {
        Self::global().read().descriptors.len()
    }
}

// ---------------------------------------------------------------------------
// ComponentKey
// ---------------------------------------------------------------------------

/// A component type together with its target.
///
/// Plain components target [`Identity::NONE`]; relations target an entity;
/// links target an object identity. In query filters the target may also be
/// [`Identity::ANY`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentKey {
    /// The stored type.
    pub type_id: ComponentTypeId,
    /// What the component points at.
    pub target: Identity,
}

impl ComponentKey {
    /// Key for a plain, untargeted `T`.
    pub fn plain<T: ?Sized + 'static>() -> Self {
        Self::new(ComponentTypeId::of::<T>(), Identity::NONE)
    }

    /// Key for a `T` that targets `target`.
    pub fn targeting<T: ?Sized + 'static>(target: Identity) -> Self {
        Self::new(ComponentTypeId::of::<T>(), target)
    }

    #[inline]
    pub const fn new(type_id: ComponentTypeId, target: Identity) -> Self {
        Self { type_id, target }
    }

    /// Whether the key carries a target and therefore lives in the relation
    /// index.
    #[inline]
    pub fn is_targeted(&self) -> bool {
        self.target != Identity::NONE
    }

    /// Whether the target is a pooled object rather than an entity.
    ///
    /// Entities past generation `i16::MAX` also read as objects, so the
    /// entity check comes first.
    #[inline]
    pub fn is_link(&self) -> bool {
        self.target.is_object() && !self.target.is_entity()
    }

    /// Filter matching: `self` may use [`Identity::ANY`] as a wildcard target.
    ///
    /// The wildcard stands for any entity target, so it matches neither plain
    /// components nor links.
    #[inline]
    pub fn matches(&self, stored: &ComponentKey) -> bool {
        if self.type_id != stored.type_id {
            return false;
        }
        if self.target == Identity::ANY {
            stored.is_targeted() && !stored.is_link()
        } else {
            self.target == stored.target
        }
    }
}

impl fmt::Display for ComponentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_targeted() {
            write!(f, "{}\u{2192}{}", self.type_id.name(), self.target)
        } else {
            f.write_str(self.type_id.name())
        }
    }
}

impl fmt::Debug for ComponentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentKey({self})")
    }
}

// ---------------------------------------------------------------------------
// Signature
// ---------------------------------------------------------------------------

/// The sorted, duplicate-free set of keys that defines an archetype.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Signature(Vec<ComponentKey>);

impl Signature {
    /// The empty signature.
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Build from arbitrary keys (sorted and deduplicated).
    pub fn from_keys(mut keys: Vec<ComponentKey>) -> Self {
        keys.sort();
        keys.dedup();
        Self(keys)
    }

    /// A copy with `key` added.
    pub fn with(&self, key: ComponentKey) -> Self {
        let mut keys = self.0.clone();
        if let Err(pos) = keys.binary_search(&key) {
            keys.insert(pos, key);
        }
        Self(keys)
    }

    /// A copy with `key` removed.
    pub fn without(&self, key: ComponentKey) -> Self {
        let mut keys = self.0.clone();
        if let Ok(pos) = keys.binary_search(&key) {
            keys.remove(pos);
        }
        Self(keys)
    }

    #[inline]
    pub fn position(&self, key: &ComponentKey) -> Option<usize> {
        self.0.binary_search(key).ok()
    }

    #[inline]
    pub fn contains(&self, key: &ComponentKey) -> bool {
        self.position(key).is_some()
    }

    /// Whether any key matches `filter` (which may use a wildcard target).
    pub fn matches(&self, filter: &ComponentKey) -> bool {
        if filter.target == Identity::ANY {
            self.0.iter().any(|key| filter.matches(key))
        } else {
            self.contains(filter)
        }
    }

    pub fn keys(&self) -> &[ComponentKey] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.iter()).finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
