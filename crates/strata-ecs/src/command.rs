//! Command buffer for deferred structural mutation.
//!
//! Systems never change which entities exist or which components they carry
//! while iterating. They record the change in a [`CommandBuffer`] instead,
//! and the scheduler merges every buffer into the [`World`] after the last
//! system of the tick has run.
//!
//! A buffer keeps two stores with the same shape as the world's:
//!
//! - the **new-entity store** holds components of entities created through
//!   this buffer. Those entities get buffer-local handles, and later calls on
//!   the same buffer see them immediately (`get`, `has`, further adds and
//!   removes).
//! - the **modify store** holds components added to entities that already
//!   exist in the world. Those adds stay invisible until the merge.
//!
//! Removes and destroys of existing entities are kept as plain lists.
//!
//! # Merge
//!
//! [`CommandBuffer::apply`] validates the whole buffer against the world
//! before touching it, then allocates real handles for the local entities,
//! and finally applies removes, destroys and adds in that order. A buffer is
//! therefore applied entirely or not at all.
//!
//! ```
//! use strata_ecs::prelude::*;
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct Health(u32);
//!
//! let mut world = World::new();
//! let existing = world.create_one();
//!
//! let mut cmds = CommandBuffer::new();
//! let spawned = cmds.create_with(1, Health(10)).unwrap();
//! cmds.add(&[existing], Health(50)).unwrap();
//! assert_eq!(cmds.get::<Health>(spawned[0]), Some(&Health(10)));
//! assert!(!world.has::<Health>(existing));
//!
//! let report = cmds.apply(&mut world).unwrap();
//! assert_eq!(report.created, 1);
//! assert_eq!(world.get::<Health>(existing).unwrap(), &Health(50));
//! ```

use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::{debug, warn};

use crate::component::{Component, ComponentDescriptor, ComponentKey};
use crate::entity::{Entity, LOCAL_BASE};
use crate::storage::{ComponentStore, StageRange, StagedStorage};
use crate::world::World;
use crate::EcsError;

/// Local handle layout below the [`LOCAL_BASE`] bit: a per-buffer stamp in
/// the high bits, the local index in the low bits.
const INDEX_BITS: u32 = 19;
const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;
const STAMP_MASK: u32 = (LOCAL_BASE - 1) >> INDEX_BITS;

/// Source of buffer stamps. Wraps after `STAMP_MASK + 1` buffers.
static NEXT_STAMP: AtomicU32 = AtomicU32::new(0);

fn next_stamp() -> u32 {
    NEXT_STAMP.fetch_add(1, Ordering::Relaxed) & STAMP_MASK
}

// ---------------------------------------------------------------------------
// MergeReport
// ---------------------------------------------------------------------------

/// Summary of one or more [`CommandBuffer::apply`] calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Local entities that became real entities.
    pub created: usize,
    /// Existing entities destroyed.
    pub destroyed: usize,
    /// Components added, on new and existing entities.
    pub added: usize,
    /// Components removed from existing entities.
    pub removed: usize,
    /// Recorded operations dropped because their target no longer existed.
    pub skipped: usize,
}

impl MergeReport {
    /// Fold another report into this one.
    pub fn absorb(&mut self, other: MergeReport) {
        self.created += other.created;
        self.destroyed += other.destroyed;
        self.added += other.added;
        self.removed += other.removed;
        self.skipped += other.skipped;
    }

    /// Whether the merge changed nothing.
    pub fn is_empty(&self) -> bool {
        self.created == 0 && self.destroyed == 0 && self.added == 0 && self.removed == 0
    }
}

// ---------------------------------------------------------------------------
// StoreSet
// ---------------------------------------------------------------------------

/// Typed stores keyed by `TypeId`, created on first use.
#[derive(Default)]
struct StoreSet {
    stores: Vec<Box<dyn ComponentStore>>,
    by_type: HashMap<TypeId, usize>,
}

impl StoreSet {
    fn typed<T: Component>(&self) -> Option<&StagedStorage<T>> {
        let index = *self.by_type.get(&TypeId::of::<T>())?;
        self.stores[index].as_any().downcast_ref::<StagedStorage<T>>()
    }

    fn typed_mut<T: Component>(&mut self) -> Result<&mut StagedStorage<T>, EcsError> {
        let descriptor = ComponentDescriptor::of::<T>();
        let index = match self.by_type.get(&descriptor.type_id()) {
            Some(&index) => index,
            None => {
                let index = self.stores.len();
                let key = ComponentKey(index as u32);
                self.stores.push(descriptor.make_store(key, descriptor.type_name()));
                self.by_type.insert(descriptor.type_id(), index);
                index
            }
        };
        self.stores[index]
            .as_any_mut()
            .downcast_mut::<StagedStorage<T>>()
            .ok_or_else(|| EcsError::TypeMismatch {
                component: descriptor.type_name().to_owned(),
            })
    }

    fn stores_of(&mut self, descriptor: &ComponentDescriptor) -> Option<&mut Box<dyn ComponentStore>> {
        let index = *self.by_type.get(&descriptor.type_id())?;
        self.stores.get_mut(index)
    }

    fn remove_entity(&mut self, entity: Entity) {
        for store in &mut self.stores {
            store.remove(entity);
        }
    }

    fn live_len(&self) -> usize {
        self.stores.iter().map(|s| s.len(StageRange::Alive)).sum()
    }

    fn clear(&mut self) {
        self.stores.clear();
        self.by_type.clear();
    }
}

// ---------------------------------------------------------------------------
// CommandBuffer
// ---------------------------------------------------------------------------

/// Records structural changes for one system invocation.
pub struct CommandBuffer {
    /// Stamp carried by every local handle of this buffer. Renewed by
    /// [`clear`](Self::clear), so handles issued before a merge go stale.
    stamp: u32,
    /// Buffer-local entities issued so far.
    local_count: u32,
    /// Locals destroyed through this buffer; they are never allocated.
    local_destroyed: HashSet<Entity>,
    /// Components of local entities, keyed by the local's slot (`i + 1`).
    created: StoreSet,
    /// Components added to existing entities.
    modified: StoreSet,
    /// Component removals on existing entities.
    removes: Vec<(ComponentDescriptor, Vec<Entity>)>,
    removes_by_type: HashMap<TypeId, usize>,
    /// Existing entities to destroy.
    destroys: Vec<Entity>,
    last_merge_report: MergeReport,
}

impl CommandBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self {
            stamp: next_stamp(),
            local_count: 0,
            local_destroyed: HashSet::new(),
            created: StoreSet::default(),
            modified: StoreSet::default(),
            removes: Vec::new(),
            removes_by_type: HashMap::new(),
            destroys: Vec::new(),
            last_merge_report: MergeReport::default(),
        }
    }

    // -- local handles -----------------------------------------------------

    /// Whether `entity` was created by this buffer since its last clear.
    pub fn is_local(&self, entity: Entity) -> bool {
        let raw = entity.to_raw();
        raw >= LOCAL_BASE
            && (raw - LOCAL_BASE) >> INDEX_BITS == self.stamp
            && raw & INDEX_MASK < self.local_count
    }

    fn local_handle(&self, index: u32) -> Entity {
        Entity::from_raw(LOCAL_BASE | (self.stamp << INDEX_BITS) | index)
    }

    /// Storage slot of a local handle in the new-entity store.
    fn slot(local: Entity) -> Entity {
        Entity::from_raw((local.to_raw() & INDEX_MASK) + 1)
    }

    /// Reject handles that look local but were not issued here.
    fn check_target(&self, entity: Entity) -> Result<(), EcsError> {
        if entity.to_raw() >= LOCAL_BASE && !self.is_local(entity) {
            return Err(EcsError::UnmappedLocalEntity { entity });
        }
        Ok(())
    }

    // -- recording ---------------------------------------------------------

    /// Create `count` buffer-local entities with no components.
    ///
    /// # Panics
    ///
    /// Panics if the buffer would hold more than `2^19` local entities.
    pub fn create(&mut self, count: usize) -> Vec<Entity> {
        let start = self.local_count;
        assert!(
            start as usize + count <= INDEX_MASK as usize + 1,
            "command buffer local entity space exhausted: {start} issued, {count} more requested"
        );
        self.local_count += count as u32;
        (start..self.local_count).map(|i| self.local_handle(i)).collect()
    }

    /// Create `count` local entities, each with a clone of `prototype`.
    pub fn create_with<T: Component>(&mut self, count: usize, prototype: T) -> Result<Vec<Entity>, EcsError> {
        let entities = self.create(count);
        self.add(&entities, prototype)?;
        Ok(entities)
    }

    /// Create one local entity per value.
    pub fn create_each<T: Component>(&mut self, values: Vec<T>) -> Result<Vec<Entity>, EcsError> {
        let entities = self.create(values.len());
        self.add_each(&entities, values)?;
        Ok(entities)
    }

    /// Add a clone of `prototype` to every entity.
    pub fn add<T: Component>(&mut self, entities: &[Entity], prototype: T) -> Result<(), EcsError> {
        self.add_with(entities, |_| prototype.clone())
    }

    /// Add one value per entity, index-aligned.
    pub fn add_each<T: Component>(&mut self, entities: &[Entity], values: Vec<T>) -> Result<(), EcsError> {
        if entities.len() != values.len() {
            return Err(EcsError::LengthMismatch {
                expected: entities.len(),
                actual: values.len(),
            });
        }
        for &entity in entities {
            self.check_target(entity)?;
        }
        for (&entity, value) in entities.iter().zip(values) {
            self.record(entity, value)?;
        }
        Ok(())
    }

    /// Add `make(entity)` to every entity.
    ///
    /// Adding a non-tag component twice through the same buffer is a
    /// [`EcsError::DuplicateComponent`]. Whether an existing entity already
    /// has the component is checked at merge time.
    pub fn add_with<T, F>(&mut self, entities: &[Entity], mut make: F) -> Result<(), EcsError>
    where
        T: Component,
        F: FnMut(Entity) -> T,
    {
        for &entity in entities {
            self.check_target(entity)?;
        }
        for &entity in entities {
            let value = make(entity);
            self.record(entity, value)?;
        }
        Ok(())
    }

    fn record<T: Component>(&mut self, entity: Entity, value: T) -> Result<(), EcsError> {
        if !self.is_local(entity) {
            self.modified.typed_mut::<T>()?.insert(entity, value)?;
            return Ok(());
        }
        if self.local_destroyed.contains(&entity) {
            return Ok(());
        }
        self.created
            .typed_mut::<T>()?
            .insert(Self::slot(entity), value)
            .map_err(|_| EcsError::DuplicateComponent {
                entity,
                component: std::any::type_name::<T>().to_owned(),
            })?;
        Ok(())
    }

    /// Remove `T` from every entity.
    ///
    /// On local entities the removal is immediate. On existing entities it
    /// also cancels an add of `T` recorded earlier in this buffer.
    pub fn remove<T: Component>(&mut self, entities: &[Entity]) -> Result<(), EcsError> {
        for &entity in entities {
            self.check_target(entity)?;
        }
        let descriptor = ComponentDescriptor::of::<T>();
        for &entity in entities {
            if self.is_local(entity) {
                if let Some(store) = self.created.stores_of(&descriptor) {
                    store.remove(Self::slot(entity));
                }
                continue;
            }
            if let Some(store) = self.modified.stores_of(&descriptor) {
                store.remove(entity);
            }
            let index = match self.removes_by_type.get(&descriptor.type_id()) {
                Some(&index) => index,
                None => {
                    self.removes.push((descriptor, Vec::new()));
                    self.removes_by_type
                        .insert(descriptor.type_id(), self.removes.len() - 1);
                    self.removes.len() - 1
                }
            };
            self.removes[index].1.push(entity);
        }
        Ok(())
    }

    /// Destroy every entity. Local entities are simply never created.
    pub fn destroy(&mut self, entities: &[Entity]) -> Result<(), EcsError> {
        for &entity in entities {
            self.check_target(entity)?;
        }
        for &entity in entities {
            if self.is_local(entity) {
                self.created.remove_entity(Self::slot(entity));
                self.local_destroyed.insert(entity);
            } else {
                self.modified.remove_entity(entity);
                self.destroys.push(entity);
            }
        }
        Ok(())
    }

    // -- local reads -------------------------------------------------------

    /// Component `T` of a local entity, as recorded so far.
    pub fn get<T: Component>(&self, local: Entity) -> Option<&T> {
        if !self.is_local(local) {
            return None;
        }
        self.created.typed::<T>()?.get(Self::slot(local))
    }

    /// Whether a local entity currently has `T` in this buffer.
    pub fn has<T: Component>(&self, local: Entity) -> bool {
        self.get::<T>(local).is_some()
    }

    /// Number of local entities that will be created on merge.
    pub fn pending_creates(&self) -> usize {
        self.local_count as usize - self.local_destroyed.len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.pending_creates() == 0
            && self.destroys.is_empty()
            && self.removes.iter().all(|(_, e)| e.is_empty())
            && self.modified.live_len() == 0
    }

    /// Report from the last [`apply`](Self::apply) call.
    pub fn last_merge_report(&self) -> &MergeReport {
        &self.last_merge_report
    }

    /// Drop everything recorded so far.
    pub fn clear(&mut self) {
        self.stamp = next_stamp();
        self.local_count = 0;
        self.local_destroyed.clear();
        self.created.clear();
        self.modified.clear();
        self.removes.clear();
        self.removes_by_type.clear();
        self.destroys.clear();
    }

    // -- merge -------------------------------------------------------------

    /// Merge the buffer into `world` and clear it.
    ///
    /// Operations whose target entity is no longer alive are skipped with a
    /// warning. Adding a non-tag component to an entity that already has it
    /// (and does not lose it through this same buffer) fails the whole merge
    /// with [`EcsError::DuplicateComponent`] before anything is applied; the
    /// buffer is left untouched in that case.
    pub fn apply(&mut self, world: &mut World) -> Result<MergeReport, EcsError> {
        if self.is_empty() {
            self.clear();
            self.last_merge_report = MergeReport::default();
            return Ok(MergeReport::default());
        }

        // --- Validation (no mutation) ---
        let mut report = MergeReport::default();
        let destroyed: HashSet<Entity> = self
            .destroys
            .iter()
            .copied()
            .filter(|&e| world.is_valid(e))
            .collect();
        let removed: HashSet<(TypeId, Entity)> = self
            .removes
            .iter()
            .flat_map(|(d, entities)| entities.iter().map(move |&e| (d.type_id(), e)))
            .collect();

        let mut dropped: HashSet<Entity> = HashSet::new();
        for store in &self.modified.stores {
            let descriptor = store.descriptor();
            let key = world.registry().lookup(descriptor.type_id());
            for &entity in store.entities(StageRange::Alive) {
                if !world.is_valid(entity) || destroyed.contains(&entity) {
                    warn!(entity = %entity, component = store.name(), "add skipped: target no longer exists");
                    dropped.insert(entity);
                    report.skipped += 1;
                    continue;
                }
                let Some(key) = key else {
                    continue;
                };
                if world.has_key(key, entity)
                    && !store.is_tag()
                    && !removed.contains(&(descriptor.type_id(), entity))
                {
                    return Err(EcsError::DuplicateComponent {
                        entity,
                        component: world.registry().name(key).to_owned(),
                    });
                }
            }
        }

        // --- Allocation and remap ---
        let locals: Vec<Entity> = (0..self.local_count)
            .map(|i| self.local_handle(i))
            .filter(|e| !self.local_destroyed.contains(e))
            .collect();
        let real = world.create(locals.len());
        let remap: HashMap<Entity, Entity> = locals
            .iter()
            .map(|&local| Self::slot(local))
            .zip(real.iter().copied())
            .collect();
        report.created = real.len();

        // --- Removes, then destroys ---
        for (descriptor, entities) in &self.removes {
            let live: Vec<Entity> = entities
                .iter()
                .copied()
                .filter(|&e| {
                    let alive = world.is_valid(e);
                    if !alive {
                        warn!(entity = %e, component = descriptor.type_name(), "remove skipped: target no longer exists");
                    }
                    alive
                })
                .collect();
            report.skipped += entities.len() - live.len();
            if let Some(key) = world.registry().lookup(descriptor.type_id()) {
                report.removed += world.remove_key(key, &live);
            }
        }
        report.skipped += self.destroys.len() - destroyed.len();
        report.destroyed = world.destroy(&self.destroys);

        // --- Adds ---
        for store in &mut self.modified.stores {
            let keep = |e: Entity| (!dropped.contains(&e)).then_some(e);
            report.added += world.absorb(&mut **store, &keep)?;
        }
        for store in &mut self.created.stores {
            let to_real = |slot: Entity| remap.get(&slot).copied();
            report.added += world.absorb(&mut **store, &to_real)?;
        }

        debug!(
            created = report.created,
            destroyed = report.destroyed,
            added = report.added,
            removed = report.removed,
            skipped = report.skipped,
            "command buffer merged"
        );
        self.clear();
        self.last_merge_report = report;
        Ok(report)
    }
}

impl Default for CommandBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("pending_creates", &self.pending_creates())
            .field("pending_adds", &self.modified.live_len())
            .field("destroys", &self.destroys.len())
            .field("removes", &self.removes.iter().map(|(_, e)| e.len()).sum::<usize>())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
