//! Entity slot allocation and placement records.
//!
//! Slots are numbered from 1 so that every handed-out [`Identity`] has a
//! positive id. A fresh slot starts at generation 1; each release bumps the
//! generation with wrap-around that skips 0, so outstanding handles to the old
//! occupant become stale immediately.

use std::collections::VecDeque;

use crate::archetype::ArchetypeId;
use crate::identity::{next_generation, Identity};

// ---------------------------------------------------------------------------
// EntityLocation
// ---------------------------------------------------------------------------

/// Where a placed entity's row currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityLocation {
    /// Archetype holding the entity.
    pub archetype: ArchetypeId,
    /// Row within that archetype's columns.
    pub row: usize,
}

// ---------------------------------------------------------------------------
// EntityAllocator
// ---------------------------------------------------------------------------

/// Hands out entity identities and recycles freed slots.
///
/// Free slots are kept in a FIFO queue so generations are spread over all
/// recycled slots instead of wearing out one hot slot.
#[derive(Debug, Default)]
pub struct EntityAllocator {
    /// Current generation per slot (index = id - 1).
    generations: Vec<u16>,
    /// Whether the slot is handed out (reserved or placed).
    occupied: Vec<bool>,
    free_indices: VecDeque<u32>,
}

impl EntityAllocator {
    /// Create an allocator with room for `capacity` slots before reallocating.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            generations: Vec::with_capacity(capacity),
            occupied: Vec::with_capacity(capacity),
            free_indices: VecDeque::new(),
        }
    }

    /// Hand out a slot, preferring the oldest freed one.
    ///
    /// # Panics
    ///
    /// Panics if more than `i32::MAX` slots are ever created.
    pub fn allocate(&mut self) -> Identity {
        if let Some(index) = self.free_indices.pop_front() {
            // Generation was already bumped on release.
            self.occupied[index as usize] = true;
            return Identity::entity(index as i32 + 1, self.generations[index as usize]);
        }
        let index = self.generations.len();
        assert!(index < i32::MAX as usize, "entity slots exhausted");
        self.generations.push(1);
        self.occupied.push(true);
        Identity::entity(index as i32 + 1, 1)
    }

    /// Release `entity`'s slot and bump its generation.
    ///
    /// Returns `false` if the identity is stale or was never handed out.
    pub fn deallocate(&mut self, entity: Identity) -> bool {
        let Some(index) = self.current_index(entity) else {
            return false;
        };
        self.occupied[index] = false;
        self.generations[index] = next_generation(self.generations[index]);
        self.free_indices.push_back(index as u32);
        true
    }

    /// Whether `entity` is the current occupant of its slot.
    pub fn is_current(&self, entity: Identity) -> bool {
        self.current_index(entity).is_some()
    }

    fn current_index(&self, entity: Identity) -> Option<usize> {
        if !entity.is_entity() {
            return None;
        }
        let index = entity.id() as usize - 1;
        let generation = *self.generations.get(index)?;
        (self.occupied[index] && generation == entity.generation()).then_some(index)
    }

    /// Number of slots currently handed out.
    pub fn occupied_count(&self) -> usize {
        self.generations.len() - self.free_indices.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
