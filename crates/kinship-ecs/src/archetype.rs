//! Archetype storage.
//!
//! An [`Archetype`] stores all entities that share the exact same
//! [`Signature`]. Components are laid out Structure-of-Arrays: one column per
//! [`ComponentKey`], plus a parallel `Vec<Identity>` mapping row to entity.
//!
//! Columns are type-erased behind the [`Column`] trait and recovered with
//! `Any` downcasts, so no raw byte handling is needed. Every row removal is a
//! swap-remove that reports which entity was moved into the vacated row; the
//! store uses that to fix up locations in the same step.

use std::any::Any;

use crate::component::{Component, ComponentKey, Signature};
use crate::identity::Identity;
use crate::query::QueryId;

// ---------------------------------------------------------------------------
// ArchetypeId
// ---------------------------------------------------------------------------

/// Identifies an archetype within a store. Indexes `ArchetypeStore::archetypes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArchetypeId(pub(crate) u32);

impl ArchetypeId {
    /// The archetype with the empty signature. Every store creates it first.
    pub const EMPTY: ArchetypeId = ArchetypeId(0);

    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

// ---------------------------------------------------------------------------
// Column
// ---------------------------------------------------------------------------

/// Type-erased dense column of component values.
pub(crate) trait Column: Any + Send + Sync {
    fn len(&self) -> usize;

    /// Drop the value at `row`, moving the last value into its place.
    fn swap_remove(&mut self, row: usize);

    /// Move the value at `row` onto the end of `dst`, filling the hole with
    /// the last value. Returns `false` (and leaves both columns untouched) if
    /// `dst` stores a different type.
    fn swap_remove_into(&mut self, row: usize, dst: &mut dyn Column) -> bool;

    /// A new, empty column of the same type.
    fn empty_clone(&self) -> Box<dyn Column>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

pub(crate) struct TypedColumn<T>(pub(crate) Vec<T>);

impl<T: Component> Column for TypedColumn<T> {
    fn len(&self) -> usize {
        self.0.len()
    }

    fn swap_remove(&mut self, row: usize) {
        self.0.swap_remove(row);
    }

    fn swap_remove_into(&mut self, row: usize, dst: &mut dyn Column) -> bool {
        let Some(dst) = dst.as_any_mut().downcast_mut::<TypedColumn<T>>() else {
            return false;
        };
        dst.0.push(self.0.swap_remove(row));
        true
    }

    fn empty_clone(&self) -> Box<dyn Column> {
        Box::new(TypedColumn::<T>(Vec::new()))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// A single owned component value whose concrete type has been erased.
///
/// This is what travels through the store (and through the deferred command
/// queue) when a component is added.
pub(crate) trait Payload: Send + Sync {
    /// An empty column able to hold this value.
    fn new_column(&self) -> Box<dyn Column>;

    /// Append to `column`. Returns `false` on a type mismatch.
    fn push_into(self: Box<Self>, column: &mut dyn Column) -> bool;

    fn type_name(&self) -> &'static str;
}

pub(crate) struct Value<T>(pub(crate) T);

impl<T: Component> Payload for Value<T> {
    fn new_column(&self) -> Box<dyn Column> {
        Box::new(TypedColumn::<T>(Vec::new()))
    }

    fn push_into(self: Box<Self>, column: &mut dyn Column) -> bool {
        match column.as_any_mut().downcast_mut::<TypedColumn<T>>() {
            Some(column) => {
                column.0.push(self.0);
                true
            }
            None => false,
        }
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

// ---------------------------------------------------------------------------
// ColumnMismatch
// ---------------------------------------------------------------------------

/// A column in the destination archetype did not have the expected type.
///
/// Only reachable if signatures and columns fall out of step, which the store
/// reports as an internal inconsistency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ColumnMismatch(pub(crate) ComponentKey);

// ---------------------------------------------------------------------------
// Archetype
// ---------------------------------------------------------------------------

/// All entities sharing one signature, stored column-wise.
pub struct Archetype {
    id: ArchetypeId,
    signature: Signature,
    /// `columns[i]` stores the values for `signature.keys()[i]`.
    columns: Vec<Box<dyn Column>>,
    entities: Vec<Identity>,
    /// Queries whose mask matches this signature.
    pub(crate) subscribers: Vec<QueryId>,
    retired: bool,
}

impl Archetype {
    /// The empty-signature archetype.
    pub(crate) fn empty(id: ArchetypeId) -> Self {
        Self {
            id,
            signature: Signature::empty(),
            columns: Vec::new(),
            entities: Vec::new(),
            subscribers: Vec::new(),
            retired: false,
        }
    }

    /// Placeholder for a slot whose archetype can never be reached again.
    /// The slot is reused by the next archetype created.
    pub(crate) fn retired(id: ArchetypeId) -> Self {
        Self {
            retired: true,
            ..Self::empty(id)
        }
    }

    #[inline]
    pub(crate) fn is_retired(&self) -> bool {
        self.retired
    }

    /// Derive a neighbour archetype for `signature`.
    ///
    /// Columns shared with `self` are cloned empty; `extra` supplies the one
    /// column `self` lacks when the neighbour is reached by an add.
    pub(crate) fn derive(
        &self,
        id: ArchetypeId,
        signature: Signature,
        mut extra: Option<(ComponentKey, Box<dyn Column>)>,
    ) -> Result<Self, ColumnMismatch> {
        let mut columns = Vec::with_capacity(signature.len());
        for key in signature.keys() {
            if let Some(pos) = self.signature.position(key) {
                columns.push(self.columns[pos].empty_clone());
            } else {
                match extra.take() {
                    Some((extra_key, column)) if extra_key == *key => columns.push(column),
                    _ => return Err(ColumnMismatch(*key)),
                }
            }
        }
        Ok(Self {
            id,
            signature,
            columns,
            entities: Vec::new(),
            subscribers: Vec::new(),
            retired: false,
        })
    }

    #[inline]
    pub fn id(&self) -> ArchetypeId {
        self.id
    }

    #[inline]
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Number of entities (rows) stored.
    #[inline]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Entities in row order.
    #[inline]
    pub fn entities(&self) -> &[Identity] {
        &self.entities
    }

    /// Append an entity to a column-less archetype. Returns its row.
    pub(crate) fn push_bare(&mut self, entity: Identity) -> usize {
        debug_assert!(self.columns.is_empty(), "push_bare on archetype with columns");
        self.entities.push(entity);
        self.entities.len() - 1
    }

    /// Drop the row at `row`.
    ///
    /// Returns the entity that was moved into `row`, or `None` if `row` was
    /// the last one.
    pub(crate) fn swap_remove(&mut self, row: usize) -> Option<Identity> {
        for column in &mut self.columns {
            column.swap_remove(row);
        }
        self.entities.swap_remove(row);
        self.entities.get(row).copied()
    }

    /// Move the row at `row` into `dst`, dropping values for keys `dst` does
    /// not have and appending `extra` for the one key `self` does not have.
    ///
    /// Returns the entity's new row in `dst` and the entity displaced into
    /// `row` here, if any.
    pub(crate) fn move_row(
        &mut self,
        row: usize,
        dst: &mut Archetype,
        extra: Option<(ComponentKey, Box<dyn Payload>)>,
    ) -> Result<(usize, Option<Identity>), ColumnMismatch> {
        for (key, column) in self.signature.keys().iter().zip(self.columns.iter_mut()) {
            match dst.signature.position(key) {
                Some(pos) => {
                    if !column.swap_remove_into(row, dst.columns[pos].as_mut()) {
                        return Err(ColumnMismatch(*key));
                    }
                }
                None => column.swap_remove(row),
            }
        }
        if let Some((key, payload)) = extra {
            let pos = dst.signature.position(&key).ok_or(ColumnMismatch(key))?;
            if !payload.push_into(dst.columns[pos].as_mut()) {
                return Err(ColumnMismatch(key));
            }
        }

        let entity = self.entities.swap_remove(row);
        dst.entities.push(entity);
        Ok((dst.entities.len() - 1, self.entities.get(row).copied()))
    }

    // -----------------------------------------------------------------------
    // Typed access
    // -----------------------------------------------------------------------

    fn typed<T: Component>(&self, key: &ComponentKey) -> Option<&TypedColumn<T>> {
        let pos = self.signature.position(key)?;
        self.columns[pos].as_any().downcast_ref::<TypedColumn<T>>()
    }

    fn typed_mut<T: Component>(&mut self, key: &ComponentKey) -> Option<&mut TypedColumn<T>> {
        let pos = self.signature.position(key)?;
        self.columns[pos].as_any_mut().downcast_mut::<TypedColumn<T>>()
    }

    /// The value for `key` at `row`.
    pub fn get<T: Component>(&self, key: &ComponentKey, row: usize) -> Option<&T> {
        self.typed::<T>(key)?.0.get(row)
    }

    pub fn get_mut<T: Component>(&mut self, key: &ComponentKey, row: usize) -> Option<&mut T> {
        self.typed_mut::<T>(key)?.0.get_mut(row)
    }

    /// The whole column for `key`, row-aligned with [`entities`](Self::entities).
    pub fn column<T: Component>(&self, key: &ComponentKey) -> Option<&[T]> {
        self.typed::<T>(key).map(|c| c.0.as_slice())
    }

    /// Entity list and a mutable column, borrowed together.
    pub(crate) fn column_with_entities_mut<T: Component>(
        &mut self,
        key: &ComponentKey,
    ) -> Option<(&[Identity], &mut [T])> {
        let pos = self.signature.position(key)?;
        let column = self.columns[pos]
            .as_any_mut()
            .downcast_mut::<TypedColumn<T>>()?;
        Some((&self.entities, column.0.as_mut_slice()))
    }

    /// Whether every column has exactly one value per entity.
    pub(crate) fn is_dense(&self) -> bool {
        self.columns.len() == self.signature.len()
            && self.columns.iter().all(|c| c.len() == self.entities.len())
    }
}

impl std::fmt::Debug for Archetype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Archetype")
            .field("id", &self.id)
            .field("signature", &self.signature)
            .field("len", &self.entities.len())
            .field("retired", &self.retired)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Pos(i32);
    #[derive(Debug, PartialEq)]
    struct Vel(i32);

    fn e(id: i32) -> Identity {
        Identity::entity(id, 1)
    }

    fn pos_key() -> ComponentKey {
        ComponentKey::plain::<Pos>()
    }

    fn vel_key() -> ComponentKey {
        ComponentKey::plain::<Vel>()
    }

    /// Archetype with a single `Pos` column holding `n` rows.
    fn pos_archetype(n: i32) -> (Archetype, Archetype) {
        let mut empty = Archetype::empty(ArchetypeId(0));
        let mut pos = empty
            .derive(
                ArchetypeId(1),
                Signature::empty().with(pos_key()),
                Some((pos_key(), Value(Pos(0)).new_column())),
            )
            .unwrap();
        for i in 1..=n {
            let row = empty.push_bare(e(i));
            empty
                .move_row(row, &mut pos, Some((pos_key(), Box::new(Value(Pos(i))) as Box<dyn Payload>)))
                .unwrap();
        }
        (empty, pos)
    }

    #[test]
    fn swap_remove_middle_reports_displaced() {
        let (_, mut arch) = pos_archetype(3);
        let displaced = arch.swap_remove(0);
        assert_eq!(displaced, Some(e(3)));
        assert_eq!(arch.entities(), &[e(3), e(2)]);
        assert_eq!(arch.get::<Pos>(&pos_key(), 0), Some(&Pos(3)));
        assert!(arch.is_dense());
    }

    #[test]
    fn swap_remove_last_row_displaces_nothing() {
        let (_, mut arch) = pos_archetype(3);
        assert_eq!(arch.swap_remove(2), None);
        assert_eq!(arch.len(), 2);
    }

    #[test]
    fn swap_remove_only_row() {
        let (_, mut arch) = pos_archetype(1);
        assert_eq!(arch.swap_remove(0), None);
        assert!(arch.is_empty());
        assert!(arch.is_dense());
    }

    #[test]
    fn move_row_carries_values_and_appends_extra() {
        let (_, mut pos) = pos_archetype(2);
        let sig = pos.signature().with(vel_key());
        let mut both = pos
            .derive(ArchetypeId(2), sig, Some((vel_key(), Value(Vel(0)).new_column())))
            .unwrap();

        let (new_row, displaced) = pos
            .move_row(0, &mut both, Some((vel_key(), Box::new(Value(Vel(9))) as Box<dyn Payload>)))
            .unwrap();
        assert_eq!(new_row, 0);
        assert_eq!(displaced, Some(e(2)));
        assert_eq!(both.get::<Pos>(&pos_key(), 0), Some(&Pos(1)));
        assert_eq!(both.get::<Vel>(&vel_key(), 0), Some(&Vel(9)));
        assert_eq!(pos.get::<Pos>(&pos_key(), 0), Some(&Pos(2)));
        assert!(pos.is_dense() && both.is_dense());
    }

    #[test]
    fn move_row_drops_missing_columns() {
        let (mut empty, mut pos) = pos_archetype(1);
        let (row, displaced) = pos.move_row(0, &mut empty, None).unwrap();
        assert_eq!(displaced, None);
        assert_eq!(empty.entities()[row], e(1));
        assert!(pos.is_empty());
    }

    #[test]
    fn move_row_rejects_wrong_payload_type() {
        let (_, mut pos) = pos_archetype(1);
        let sig = pos.signature().with(vel_key());
        let mut both = pos
            .derive(ArchetypeId(2), sig, Some((vel_key(), Value(Vel(0)).new_column())))
            .unwrap();
        let err = pos
            .move_row(0, &mut both, Some((vel_key(), Box::new(Value(Pos(5))) as Box<dyn Payload>)))
            .unwrap_err();
        assert_eq!(err, ColumnMismatch(vel_key()));
    }

    #[test]
    fn derive_requires_column_for_new_key() {
        let empty = Archetype::empty(ArchetypeId(0));
        let err = empty
            .derive(ArchetypeId(1), Signature::empty().with(pos_key()), None)
            .unwrap_err();
        assert_eq!(err, ColumnMismatch(pos_key()));
    }

    #[test]
    fn typed_access_rejects_wrong_type() {
        let (_, arch) = pos_archetype(1);
        assert!(arch.get::<Vel>(&pos_key(), 0).is_none());
        assert!(arch.get::<Pos>(&pos_key(), 5).is_none());
        assert_eq!(arch.column::<Pos>(&pos_key()).map(<[Pos]>::len), Some(1));
    }

    #[test]
    fn column_with_entities_mut_is_row_aligned() {
        let (_, mut arch) = pos_archetype(3);
        let (entities, values) = arch.column_with_entities_mut::<Pos>(&pos_key()).unwrap();
        for (entity, value) in entities.iter().zip(values.iter_mut()) {
            assert_eq!(entity.id(), value.0);
            value.0 *= 10;
        }
        assert_eq!(arch.get::<Pos>(&pos_key(), 2), Some(&Pos(30)));
    }
}
