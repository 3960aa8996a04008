//! Packed 64-bit identities for entities, tracked objects and virtual concepts.
//!
//! An [`Identity`] is a single `u64` that is read three different ways
//! depending on the sign and range of its two logical halves:
//!
//! ```text
//!  63        48 47        32 31                     0
//! +------------+------------+------------------------+
//! |  reserved  | generation |           id           |
//! |   (zero)   | decoration |          (i32)         |
//! +------------+------------+------------------------+
//! ```
//!
//! - **Entity**: `id > 0` and `generation > 0`. The generation is bumped every
//!   time the slot is recycled, so stale copies never compare equal to the new
//!   occupant.
//! - **Object**: the 16-bit field read as a signed `decoration` is negative. The
//!   magnitude is the type-id of the tracked item and `id` is its content hash
//!   with the sign bit forced on, so an object never also reads as an entity.
//! - **Virtual**: `decoration >= 0` and `id <= 0`, e.g. [`Identity::NONE`],
//!   [`Identity::ANY`], or a type tag produced by [`Identity::of_type`].
//!
//! Equality and hashing only consider `(id, generation)`; ordering uses the
//! raw value.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::component::{ComponentTypeId, TypeRegistry};
use crate::EcsError;

const ID_MASK: u64 = 0x0000_0000_FFFF_FFFF;
const GENERATION_SHIFT: u32 = 32;
const PAYLOAD_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;
const OBJECT_ID_BIT: u32 = 0x8000_0000;

/// Highest generation an entity slot can carry before wrapping back to 1.
pub(crate) const MAX_GENERATION: u16 = u16::MAX - 1;

/// Generation that follows `generation`, wrapping around but never yielding 0.
#[inline]
pub(crate) const fn next_generation(generation: u16) -> u16 {
    generation % MAX_GENERATION + 1
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Refers to an entity, a tracked object, or a virtual concept such as the
/// `Any` wildcard.
#[derive(Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(u64);

impl Identity {
    /// The empty identity. Also the target of every plain (untargeted)
    /// component.
    pub const NONE: Identity = Identity(0);

    /// Wildcard that matches any target in query filters.
    pub const ANY: Identity = Identity((i16::MAX as u16 as u64) << GENERATION_SHIFT);

    /// Reconstruct from a raw value. The reserved upper 16 bits are cleared.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw & PAYLOAD_MASK)
    }

    /// Build an identity from an `id` and a signed decoration.
    #[inline]
    pub const fn new(id: i32, decoration: i16) -> Self {
        Self((id as u32 as u64) | ((decoration as u16 as u64) << GENERATION_SHIFT))
    }

    /// Build an entity identity from its slot id and generation.
    #[inline]
    pub const fn entity(id: i32, generation: u16) -> Self {
        Self((id as u32 as u64) | ((generation as u64) << GENERATION_SHIFT))
    }

    /// Virtual identity tagging the type `T` via the process-wide type
    /// registry.
    pub fn of_type<T: ?Sized + 'static>() -> Self {
        Self::from_type_id(ComponentTypeId::of::<T>())
    }

    /// Virtual identity tagging an already-registered type.
    #[inline]
    pub const fn from_type_id(type_id: ComponentTypeId) -> Self {
        Self::new(0, type_id.index() as i16)
    }

    /// Object identity derived from the content hash of `item`.
    ///
    /// The id always has its sign bit set, so an object identity never reads
    /// as an entity. Two distinct items of the same type may still derive the
    /// same identity; the [`ReferenceStore`](crate::reference::ReferenceStore)
    /// detects and rejects that case instead of aliasing them.
    pub fn of<T: Hash + ?Sized + 'static>(item: &T) -> Self {
        let mut hasher = ContentHasher::default();
        item.hash(&mut hasher);
        let type_id = ComponentTypeId::of::<T>();
        let id = (hasher.finish() as u32 | OBJECT_ID_BIT) as i32;
        Self::new(id, -(type_id.index() as i16))
    }

    /// Raw `u64` representation.
    #[inline]
    pub const fn to_raw(self) -> u64 {
        self.0
    }

    /// The low 32 bits, read as a signed id.
    #[inline]
    pub const fn id(self) -> i32 {
        (self.0 & ID_MASK) as u32 as i32
    }

    /// The 16-bit field read as an entity generation.
    #[inline]
    pub const fn generation(self) -> u16 {
        (self.0 >> GENERATION_SHIFT) as u16
    }

    /// The 16-bit field read as a signed decoration.
    #[inline]
    pub const fn decoration(self) -> i16 {
        self.generation() as i16
    }

    /// A live-entity reference.
    #[inline]
    pub const fn is_entity(self) -> bool {
        self.id() > 0 && self.generation() > 0
    }

    /// A tracked object reference.
    #[inline]
    pub const fn is_object(self) -> bool {
        self.decoration() < 0
    }

    /// A virtual concept such as `None`, `Any` or a type tag.
    #[inline]
    pub const fn is_virtual(self) -> bool {
        self.decoration() >= 0 && self.id() <= 0
    }

    /// The identity that reoccupies this entity's slot after it is freed.
    ///
    /// Fails with [`EcsError::NotAnEntity`] for objects and virtual
    /// identities.
    pub fn successor(self) -> Result<Identity, EcsError> {
        if !self.is_entity() {
            return Err(EcsError::NotAnEntity { identity: self });
        }
        Ok(Self::entity(self.id(), next_generation(self.generation())))
    }

    /// The registered type an object or virtual identity refers to.
    ///
    /// Entities have no associated type and return `None`.
    pub fn resolve_type(self) -> Option<crate::component::TypeDescriptor> {
        let decoration = self.decoration();
        if self.is_entity() {
            None
        } else if self.is_object() {
            TypeRegistry::resolve(ComponentTypeId::from_index(decoration.unsigned_abs()))
        } else if self.id() <= 0 && decoration > 0 && decoration < i16::MAX {
            TypeRegistry::resolve(ComponentTypeId::from_index(decoration as u16))
        } else {
            None
        }
    }
}

impl PartialEq for Identity {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id() && self.generation() == other.generation()
    }
}

impl Eq for Identity {}

impl PartialOrd for Identity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Identity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl Hash for Identity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Mix both halves so that id and generation do not collide in lockstep.
        let low = self.0 & ID_MASK;
        let high = self.0 >> GENERATION_SHIFT;
        let mixed = 0x811C_9DC5u64
            .wrapping_mul(low)
            .wrapping_add(0x0100_0193u64.wrapping_mul(high))
            .wrapping_add(0xc4ce_b9fe_1a85_ec53);
        state.write_u64(mixed);
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self::NONE
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::NONE {
            return f.write_str("None");
        }
        if *self == Self::ANY {
            return f.write_str("Any");
        }
        if self.is_entity() {
            return write!(f, "\u{2756}{:08x}:{:05}", self.id(), self.generation());
        }
        match self.resolve_type() {
            Some(descriptor) if self.is_object() => {
                write!(f, "{}#{:08x}", descriptor.name, self.id())
            }
            Some(descriptor) => f.write_str(descriptor.name),
            None => write!(f, "\u{2756}{:08x}:{:05}", self.id(), self.generation()),
        }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({self})")
    }
}

// ---------------------------------------------------------------------------
// ContentHasher
// ---------------------------------------------------------------------------

/// `std::hash::Hasher` adapter over blake3 so object identities are stable for
/// equal content regardless of the std hasher's per-process seed.
#[derive(Default)]
struct ContentHasher(blake3::Hasher);

impl Hasher for ContentHasher {
    fn write(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    fn finish(&self) -> u64 {
        let digest = self.0.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest.as_bytes()[..8]);
        u64::from_le_bytes(head)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
