//! Reference-counted pool of shared objects targeted by links.
//!
//! A link is a component whose target is an object [`Identity`] derived from
//! the content hash of a shared value. The [`ReferenceStore`] keeps one
//! `Arc` per such identity and counts how many links hold it; the entry is
//! dropped when the last link is released.
//!
//! An identity names one allocation. A second `Arc` that derives the same
//! identity, whether it holds an equal value or a hash collision, fails with
//! [`EcsError::ReferenceCollision`] instead of silently aliasing the first.

use std::any::Any;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::archetype::{Payload, Value};
use crate::component::{Component, ComponentKey};
use crate::identity::Identity;
use crate::EcsError;

/// Default number of identities the pool reserves room for.
pub const DEFAULT_REFERENCE_CAPACITY: usize = 4096;

struct StoredReference {
    item: Arc<dyn Any + Send + Sync>,
    count: usize,
    type_name: &'static str,
}

/// Thread-safe pool of shared objects keyed by their content identity.
pub struct ReferenceStore {
    storage: Mutex<HashMap<Identity, StoredReference>>,
}

impl ReferenceStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_REFERENCE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            storage: Mutex::new(HashMap::with_capacity(capacity)),
        }
    }

    /// Start tracking `item`, or add one more holder if this same allocation
    /// is already tracked.
    ///
    /// Any other `Arc` at the same identity is rejected, even one holding an
    /// equal value.
    pub fn request<T>(&self, item: Arc<T>) -> Result<Identity, EcsError>
    where
        T: Hash + Send + Sync + 'static,
    {
        let identity = Identity::of(&*item);
        let mut storage = self.storage.lock();
        match storage.entry(identity) {
            Entry::Occupied(mut entry) => {
                let stored = entry.get_mut();
                let same = stored
                    .item
                    .downcast_ref::<T>()
                    .is_some_and(|existing| std::ptr::eq(existing, Arc::as_ptr(&item)));
                if !same {
                    return Err(EcsError::ReferenceCollision {
                        identity,
                        type_name: stored.type_name,
                    });
                }
                stored.count += 1;
            }
            Entry::Vacant(entry) => {
                entry.insert(StoredReference {
                    item,
                    count: 1,
                    type_name: std::any::type_name::<T>(),
                });
            }
        }
        Ok(identity)
    }

    /// The tracked object for `identity`.
    pub fn get<T: Send + Sync + 'static>(&self, identity: Identity) -> Result<Arc<T>, EcsError> {
        let storage = self.storage.lock();
        let stored = storage
            .get(&identity)
            .ok_or(EcsError::ReferenceNotTracked { identity })?;
        Arc::clone(&stored.item)
            .downcast::<T>()
            .map_err(|_| EcsError::ReferenceTypeMismatch {
                identity,
                expected: std::any::type_name::<T>(),
                found: stored.type_name,
            })
    }

    /// Drop one holder of `identity`, forgetting the object at zero.
    pub fn release(&self, identity: Identity) -> Result<(), EcsError> {
        let mut storage = self.storage.lock();
        let Entry::Occupied(mut entry) = storage.entry(identity) else {
            return Err(EcsError::ReferenceNotTracked { identity });
        };
        entry.get_mut().count -= 1;
        if entry.get().count == 0 {
            entry.remove();
        }
        Ok(())
    }

    /// Current holder count, 0 if untracked.
    pub fn ref_count(&self, identity: Identity) -> usize {
        self.storage.lock().get(&identity).map_or(0, |s| s.count)
    }

    /// Number of tracked objects.
    pub fn len(&self) -> usize {
        self.storage.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.lock().is_empty()
    }
}

impl Default for ReferenceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ReferenceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceStore")
            .field("tracked", &self.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Links
// ---------------------------------------------------------------------------

/// A pending link value whose object type has been erased.
pub(crate) trait LinkPayload: Send + Sync {
    /// Key the link is stored under: the object's type, targeting its identity.
    fn key(&self) -> ComponentKey;

    /// Register the object with `references`.
    fn request(&self, references: &ReferenceStore) -> Result<Identity, EcsError>;

    /// The column value (`Arc<T>`).
    fn into_payload(self: Box<Self>) -> Box<dyn Payload>;
}

pub(crate) struct Link<T>(pub(crate) Arc<T>);

impl<T: Hash + Component> LinkPayload for Link<T> {
    fn key(&self) -> ComponentKey {
        ComponentKey::targeting::<T>(Identity::of(&*self.0))
    }

    fn request(&self, references: &ReferenceStore) -> Result<Identity, EcsError> {
        references.request(Arc::clone(&self.0))
    }

    fn into_payload(self: Box<Self>) -> Box<dyn Payload> {
        Box::new(Value(self.0))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
