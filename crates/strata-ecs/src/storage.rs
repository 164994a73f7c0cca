//! Sparse-to-dense component storage with per-tick change stages.
//!
//! A [`StagedStorage<T>`] keeps three index maps in lockstep: a sparse array
//! from entity to dense slot, the dense entity array, and the dense payload
//! array. The dense arrays are partitioned into three contiguous regions:
//!
//! ```text
//! [ settled | added this tick | removed this tick ]
//!   0         added_start       removed_start        len
//! ```
//!
//! Entities move between regions with O(1) swaps. A removed component keeps
//! its value until [`ComponentStore::promote`] runs at the tick boundary, so
//! `on_remove` consumers can still read the last value. Promotion folds the
//! added region into the settled one and truncates the removed region, which
//! keeps the dense arrays free of holes.
//!
//! Zero-sized components are tags. Their payload vector never allocates, so a
//! tag store records membership only.

use std::any::Any;

use crate::component::{ComponentDescriptor, ComponentKey, Component};
use crate::entity::Entity;
use crate::pack::{ErasedColumn, TypedColumn};
use crate::EcsError;

const VACANT: u32 = u32::MAX;

// ---------------------------------------------------------------------------
// StageRange
// ---------------------------------------------------------------------------

/// Which dense regions an entity listing covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageRange {
    /// Settled and added: every entity that currently has the component.
    Alive,
    /// Added since the last tick boundary.
    Added,
    /// Removed since the last tick boundary.
    Removed,
    /// All three regions.
    All,
}

// ---------------------------------------------------------------------------
// ComponentStore
// ---------------------------------------------------------------------------

/// Type-erased interface over a [`StagedStorage<T>`].
///
/// The world holds one store per component key behind this trait; typed
/// access downcasts through [`as_any`](Self::as_any).
pub trait ComponentStore: Send + Sync {
    /// Key this store was created for.
    fn key(&self) -> ComponentKey;
    /// Registered display name.
    fn name(&self) -> &str;
    /// Descriptor of the stored type.
    fn descriptor(&self) -> ComponentDescriptor;
    /// Whether the stored type is a zero-sized tag.
    fn is_tag(&self) -> bool;

    /// The entity currently has the component (settled or added).
    fn has(&self, entity: Entity) -> bool;
    /// The component was added since the last tick boundary.
    fn has_added(&self, entity: Entity) -> bool;
    /// The component was removed since the last tick boundary.
    fn has_removed(&self, entity: Entity) -> bool;
    /// The entity has a slot in any region.
    fn has_storage_for(&self, entity: Entity) -> bool;

    /// Dense entity listing for a region range.
    fn entities(&self, stage: StageRange) -> &[Entity];
    /// Number of entities in a region range.
    fn len(&self, stage: StageRange) -> usize {
        self.entities(stage).len()
    }

    /// Move the entity's component into the removed region.
    ///
    /// Returns `false` when the entity had no live component.
    fn remove(&mut self, entity: Entity) -> bool;
    /// Fold added into settled and drop removed values.
    fn promote(&mut self);
    /// Drop everything.
    fn clear(&mut self);

    /// Copy the values of `entities` (any region) into a column, index-aligned.
    fn gather(&self, entities: &[Entity]) -> Result<Box<dyn ErasedColumn>, EcsError>;

    /// Move every live value of this store into `target`, translating entities
    /// through `remap`. Entities mapped to `None` are dropped.
    ///
    /// Returns the target-side entities that were inserted. This store is
    /// left empty.
    fn drain_into(
        &mut self,
        target: &mut dyn ComponentStore,
        remap: &dyn Fn(Entity) -> Option<Entity>,
    ) -> Result<Vec<Entity>, EcsError>;

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

// ---------------------------------------------------------------------------
// StagedStorage
// ---------------------------------------------------------------------------

/// Dense storage for one component type. See the module docs for the layout.
#[derive(Debug, Clone)]
pub struct StagedStorage<T> {
    key: ComponentKey,
    name: String,
    /// Entity index -> dense slot, [`VACANT`] when absent.
    sparse: Vec<u32>,
    dense: Vec<Entity>,
    values: Vec<T>,
    added_start: usize,
    removed_start: usize,
}

impl<T: Component> StagedStorage<T> {
    /// Create an empty store.
    pub fn new(key: ComponentKey, name: &str) -> Self {
        Self {
            key,
            name: name.to_owned(),
            sparse: Vec::new(),
            dense: Vec::new(),
            values: Vec::new(),
            added_start: 0,
            removed_start: 0,
        }
    }

    #[inline]
    fn slot(&self, entity: Entity) -> Option<usize> {
        match self.sparse.get(entity.index()) {
            Some(&slot) if slot != VACANT => Some(slot as usize),
            _ => None,
        }
    }

    fn swap_slots(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.dense.swap(a, b);
        self.values.swap(a, b);
        self.sparse[self.dense[a].index()] = a as u32;
        self.sparse[self.dense[b].index()] = b as u32;
    }

    /// Insert a component into the added region.
    ///
    /// Returns `Ok(false)` for a tag that is already present. A non-tag that
    /// is already live is a [`EcsError::DuplicateComponent`]. A component
    /// removed earlier in the same tick is moved back into the added region
    /// with the new value.
    pub fn insert(&mut self, entity: Entity, value: T) -> Result<bool, EcsError> {
        match self.slot(entity) {
            Some(slot) if slot < self.removed_start => {
                if self.is_tag() {
                    Ok(false)
                } else {
                    Err(EcsError::DuplicateComponent {
                        entity,
                        component: self.name.clone(),
                    })
                }
            }
            Some(slot) => {
                let target = self.removed_start;
                self.swap_slots(slot, target);
                self.values[target] = value;
                self.removed_start += 1;
                Ok(true)
            }
            None => {
                if self.sparse.len() <= entity.index() {
                    self.sparse.resize(entity.index() + 1, VACANT);
                }
                let slot = self.dense.len();
                self.dense.push(entity);
                self.values.push(value);
                self.sparse[entity.index()] = slot as u32;
                let target = self.removed_start;
                self.swap_slots(slot, target);
                self.removed_start += 1;
                Ok(true)
            }
        }
    }

    /// Live value of `entity`.
    pub fn get(&self, entity: Entity) -> Option<&T> {
        self.slot(entity)
            .filter(|&slot| slot < self.removed_start)
            .map(|slot| &self.values[slot])
    }

    /// Mutable live value of `entity`.
    pub fn get_mut(&mut self, entity: Entity) -> Option<&mut T> {
        let slot = self.slot(entity).filter(|&slot| slot < self.removed_start)?;
        Some(&mut self.values[slot])
    }

    /// Value of `entity` in any region, including one removed this tick.
    pub fn get_any_stage(&self, entity: Entity) -> Option<&T> {
        self.slot(entity).map(|slot| &self.values[slot])
    }

    /// Overwrite the value of `entity` in any region.
    pub fn set_any_stage(&mut self, entity: Entity, value: T) -> bool {
        match self.slot(entity) {
            Some(slot) => {
                self.values[slot] = value;
                true
            }
            None => false,
        }
    }

    /// Live values, index-aligned with `entities(StageRange::Alive)`.
    pub fn values(&self) -> &[T] {
        &self.values[..self.removed_start]
    }

    /// Mutable live values. Writing does not change membership.
    pub fn values_mut(&mut self) -> &mut [T] {
        &mut self.values[..self.removed_start]
    }

    fn range(&self, stage: StageRange) -> std::ops::Range<usize> {
        match stage {
            StageRange::Alive => 0..self.removed_start,
            StageRange::Added => self.added_start..self.removed_start,
            StageRange::Removed => self.removed_start..self.dense.len(),
            StageRange::All => 0..self.dense.len(),
        }
    }

    fn mismatch(&self) -> EcsError {
        EcsError::TypeMismatch {
            component: self.name.clone(),
        }
    }
}

impl<T: Component> ComponentStore for StagedStorage<T> {
    fn key(&self) -> ComponentKey {
        self.key
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn descriptor(&self) -> ComponentDescriptor {
        ComponentDescriptor::of::<T>()
    }

    fn is_tag(&self) -> bool {
        std::mem::size_of::<T>() == 0
    }

    fn has(&self, entity: Entity) -> bool {
        matches!(self.slot(entity), Some(slot) if slot < self.removed_start)
    }

    fn has_added(&self, entity: Entity) -> bool {
        matches!(self.slot(entity), Some(slot) if slot >= self.added_start && slot < self.removed_start)
    }

    fn has_removed(&self, entity: Entity) -> bool {
        matches!(self.slot(entity), Some(slot) if slot >= self.removed_start)
    }

    fn has_storage_for(&self, entity: Entity) -> bool {
        self.slot(entity).is_some()
    }

    fn entities(&self, stage: StageRange) -> &[Entity] {
        &self.dense[self.range(stage)]
    }

    fn remove(&mut self, entity: Entity) -> bool {
        let Some(mut slot) = self.slot(entity) else {
            return false;
        };
        if slot >= self.removed_start {
            return false;
        }
        if slot < self.added_start {
            let last_settled = self.added_start - 1;
            self.swap_slots(slot, last_settled);
            slot = last_settled;
            self.added_start -= 1;
        }
        let last_alive = self.removed_start - 1;
        self.swap_slots(slot, last_alive);
        self.removed_start -= 1;
        true
    }

    fn promote(&mut self) {
        for entity in &self.dense[self.removed_start..] {
            self.sparse[entity.index()] = VACANT;
        }
        self.dense.truncate(self.removed_start);
        self.values.truncate(self.removed_start);
        self.added_start = self.removed_start;
    }

    fn clear(&mut self) {
        self.sparse.clear();
        self.dense.clear();
        self.values.clear();
        self.added_start = 0;
        self.removed_start = 0;
    }

    fn gather(&self, entities: &[Entity]) -> Result<Box<dyn ErasedColumn>, EcsError> {
        let mut column = Vec::with_capacity(entities.len());
        for &entity in entities {
            let value = self
                .get_any_stage(entity)
                .ok_or_else(|| EcsError::MissingComponent {
                    entity,
                    component: self.name.clone(),
                })?;
            column.push(value.clone());
        }
        Ok(Box::new(TypedColumn(column)))
    }

    fn drain_into(
        &mut self,
        target: &mut dyn ComponentStore,
        remap: &dyn Fn(Entity) -> Option<Entity>,
    ) -> Result<Vec<Entity>, EcsError> {
        let mismatch = self.mismatch();
        let target = target
            .as_any_mut()
            .downcast_mut::<StagedStorage<T>>()
            .ok_or(mismatch)?;

        let live = self.removed_start;
        let dense = std::mem::take(&mut self.dense);
        let values = std::mem::take(&mut self.values);
        self.clear();

        let mut inserted = Vec::with_capacity(live);
        for (entity, value) in dense.into_iter().zip(values).take(live) {
            let Some(mapped) = remap(entity) else {
                continue;
            };
            if target.insert(mapped, value)? {
                inserted.push(mapped);
            }
        }
        Ok(inserted)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Hp(u32);

    #[derive(Debug, Clone, PartialEq)]
    struct Marker;

    fn e(raw: u32) -> Entity {
        Entity::from_raw(raw)
    }

    fn store() -> StagedStorage<Hp> {
        StagedStorage::new(ComponentKey(0), "hp")
    }

    /// Every dense slot must be reachable through the sparse index.
    fn assert_consistent<T: Component>(s: &StagedStorage<T>) {
        assert_eq!(s.dense.len(), s.values.len());
        assert!(s.added_start <= s.removed_start);
        assert!(s.removed_start <= s.dense.len());
        for (slot, entity) in s.dense.iter().enumerate() {
            assert_eq!(s.sparse[entity.index()] as usize, slot);
        }
    }

    #[test]
    fn insert_lands_in_added_region() {
        let mut s = store();
        assert!(s.insert(e(3), Hp(30)).unwrap());
        assert!(s.insert(e(1), Hp(10)).unwrap());
        assert!(s.has(e(3)));
        assert!(s.has_added(e(1)));
        assert_eq!(s.len(StageRange::Added), 2);
        assert_eq!(s.get(e(3)), Some(&Hp(30)));
        assert_consistent(&s);
    }

    #[test]
    fn promote_settles_added() {
        let mut s = store();
        s.insert(e(1), Hp(1)).unwrap();
        s.promote();
        assert!(s.has(e(1)));
        assert!(!s.has_added(e(1)));
        assert_eq!(s.len(StageRange::Added), 0);
        assert_eq!(s.len(StageRange::Alive), 1);
        assert_consistent(&s);
    }

    #[test]
    fn remove_keeps_value_until_promote() {
        let mut s = store();
        for i in 1..=4 {
            s.insert(e(i), Hp(i * 10)).unwrap();
        }
        s.promote();
        assert!(s.remove(e(2)));
        assert!(!s.has(e(2)));
        assert!(s.has_removed(e(2)));
        assert_eq!(s.get(e(2)), None);
        assert_eq!(s.get_any_stage(e(2)), Some(&Hp(20)));
        assert_consistent(&s);

        s.promote();
        assert!(!s.has_storage_for(e(2)));
        assert_eq!(s.len(StageRange::All), 3);
        assert_consistent(&s);
    }

    #[test]
    fn remove_from_added_region() {
        let mut s = store();
        s.insert(e(1), Hp(1)).unwrap();
        s.promote();
        s.insert(e(2), Hp(2)).unwrap();
        s.insert(e(3), Hp(3)).unwrap();
        assert!(s.remove(e(2)));
        assert_eq!(s.entities(StageRange::Added), &[e(3)]);
        assert_eq!(s.entities(StageRange::Removed), &[e(2)]);
        assert_eq!(s.entities(StageRange::Alive).len(), 2);
        assert_consistent(&s);
    }

    #[test]
    fn swap_removal_has_no_holes() {
        let mut s = store();
        for i in 1..=100 {
            s.insert(e(i), Hp(i)).unwrap();
        }
        s.promote();
        for i in (1..=100).step_by(3) {
            s.remove(e(i));
        }
        s.promote();
        assert_eq!(s.len(StageRange::All), s.len(StageRange::Alive));
        for entity in s.entities(StageRange::Alive) {
            assert_eq!(s.get(*entity), Some(&Hp(entity.to_raw())));
        }
        assert_consistent(&s);
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let mut s = store();
        s.insert(e(1), Hp(1)).unwrap();
        let err = s.insert(e(1), Hp(2)).unwrap_err();
        assert!(matches!(err, EcsError::DuplicateComponent { .. }));
        assert_eq!(s.get(e(1)), Some(&Hp(1)));
    }

    #[test]
    fn duplicate_tag_is_idempotent() {
        let mut s: StagedStorage<Marker> = StagedStorage::new(ComponentKey(1), "marker");
        assert!(s.is_tag());
        assert!(s.insert(e(5), Marker).unwrap());
        assert!(!s.insert(e(5), Marker).unwrap());
        assert_eq!(s.len(StageRange::Alive), 1);
    }

    #[test]
    fn readd_after_remove_moves_back_to_added() {
        let mut s = store();
        s.insert(e(1), Hp(1)).unwrap();
        s.insert(e(2), Hp(2)).unwrap();
        s.promote();
        s.remove(e(1));
        s.remove(e(2));
        assert!(s.insert(e(1), Hp(100)).unwrap());
        assert!(s.has_added(e(1)));
        assert!(!s.has_removed(e(1)));
        assert!(s.has_removed(e(2)));
        assert_eq!(s.get(e(1)), Some(&Hp(100)));
        assert_consistent(&s);
    }

    #[test]
    fn remove_missing_returns_false() {
        let mut s = store();
        assert!(!s.remove(e(9)));
        s.insert(e(9), Hp(9)).unwrap();
        assert!(s.remove(e(9)));
        assert!(!s.remove(e(9)));
    }

    #[test]
    fn gather_reads_removed_values() {
        let mut s = store();
        s.insert(e(1), Hp(1)).unwrap();
        s.insert(e(2), Hp(2)).unwrap();
        s.remove(e(1));
        let column = s.gather(&[e(2), e(1)]).unwrap();
        let typed = column.as_any().downcast_ref::<TypedColumn<Hp>>().unwrap();
        assert_eq!(typed.0, vec![Hp(2), Hp(1)]);
        assert!(s.gather(&[e(7)]).is_err());
    }

    #[test]
    fn drain_into_remaps_and_empties_source() {
        let mut src = store();
        let mut dst = store();
        src.insert(e(100), Hp(7)).unwrap();
        src.insert(e(101), Hp(8)).unwrap();
        src.remove(e(101));
        let inserted = src
            .drain_into(&mut dst, &|entity| Some(Entity::from_raw(entity.to_raw() - 99)))
            .unwrap();
        assert_eq!(inserted, vec![e(1)]);
        assert_eq!(dst.get(e(1)), Some(&Hp(7)));
        assert!(!dst.has(e(2)));
        assert_eq!(src.len(StageRange::All), 0);
        assert_consistent(&dst);
    }
}
