//! The [`World`] is the top-level container for the ECS. It owns the entity
//! allocator, the component registry, one staged store per component key and
//! the shared filter cache.
//!
//! Structural changes made directly on the world (`create`, `add`, `remove`,
//! `destroy`, `reset`) take effect immediately and are recorded as
//! modifications for the next [`begin_tick`](World::begin_tick). Value writes
//! (`set`, `get_mut`, `view_mut`) do not change composition and are not
//! tracked.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::component::{Component, ComponentDescriptor, ComponentKey, ComponentRegistry};
use crate::entity::{Entity, EntityAllocator};
use crate::filter::{Access, CompiledQuery, FilterGroup, FilterSets, Query};
use crate::pack::{Column, Pack};
use crate::resolve::{self, FilterCache};
use crate::storage::{ComponentStore, StageRange, StagedStorage};
use crate::EcsError;

// ---------------------------------------------------------------------------
// WorldConfig
// ---------------------------------------------------------------------------

/// Tunables for a [`World`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    /// `order_by` ranges longer than this use a parallel merge sort.
    pub parallel_sort_threshold: usize,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            parallel_sort_threshold: 4096,
        }
    }
}

// ---------------------------------------------------------------------------
// World
// ---------------------------------------------------------------------------

/// The central ECS container.
pub struct World {
    config: WorldConfig,
    entities: EntityAllocator,
    registry: ComponentRegistry,
    /// Indexed by `ComponentKey`.
    stores: Vec<Box<dyn ComponentStore>>,
    cache: FilterCache,
    /// Entities whose composition changed since the last `begin_tick`.
    modified: BTreeSet<Entity>,
    /// Cached results match the current stores.
    cache_fresh: bool,
}

impl World {
    /// Create an empty world with default configuration.
    pub fn new() -> Self {
        Self::with_config(WorldConfig::default())
    }

    pub fn with_config(config: WorldConfig) -> Self {
        Self {
            config,
            entities: EntityAllocator::new(),
            registry: ComponentRegistry::new(),
            stores: Vec::new(),
            cache: FilterCache::new(),
            modified: BTreeSet::new(),
            cache_fresh: true,
        }
    }

    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    // -- registration ------------------------------------------------------

    /// Access the component registry.
    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    /// Register `T` under its type name. Idempotent.
    pub fn register<T: Component>(&mut self) -> ComponentKey {
        self.register_descriptor(&ComponentDescriptor::of::<T>())
    }

    /// Register `T` under an explicit display name.
    pub fn register_named<T: Component>(&mut self, name: &str) -> Result<ComponentKey, EcsError> {
        let descriptor = ComponentDescriptor::of::<T>();
        let (key, fresh) = self.registry.register(&descriptor, Some(name))?;
        if fresh {
            self.stores.push(descriptor.make_store(key, name));
        }
        Ok(key)
    }

    /// Register a described type, creating its store on first sight.
    pub fn register_descriptor(&mut self, descriptor: &ComponentDescriptor) -> ComponentKey {
        let (key, fresh) = self.registry.register_default(descriptor);
        if fresh {
            let store = descriptor.make_store(key, self.registry.name(key));
            self.stores.push(store);
        }
        key
    }

    /// Key of `T`, if registered.
    pub fn key_of<T: Component>(&self) -> Option<ComponentKey> {
        self.registry.key_of::<T>()
    }

    /// Type-erased store of a key.
    pub fn store(&self, key: ComponentKey) -> Option<&dyn ComponentStore> {
        self.stores.get(key.index()).map(|s| s.as_ref())
    }

    fn storage<T: Component>(&self) -> Option<&StagedStorage<T>> {
        let key = self.registry.key_of::<T>()?;
        self.stores[key.index()].as_any().downcast_ref()
    }

    fn storage_mut<T: Component>(&mut self) -> Option<&mut StagedStorage<T>> {
        let key = self.registry.key_of::<T>()?;
        self.stores[key.index()].as_any_mut().downcast_mut()
    }

    fn storage_or_register<T: Component>(&mut self) -> Result<&mut StagedStorage<T>, EcsError> {
        let key = self.register::<T>();
        let name = self.registry.name(key).to_owned();
        self.stores[key.index()]
            .as_any_mut()
            .downcast_mut()
            .ok_or(EcsError::TypeMismatch { component: name })
    }

    fn name_of<T: Component>(&self) -> String {
        match self.registry.key_of::<T>() {
            Some(key) => self.registry.name(key).to_owned(),
            None => std::any::type_name::<T>().to_owned(),
        }
    }

    fn mark_modified(&mut self, entities: impl IntoIterator<Item = Entity>) {
        let before = self.modified.len();
        self.modified.extend(entities);
        if self.modified.len() != before {
            self.cache_fresh = false;
        }
    }

    // -- entities ----------------------------------------------------------

    /// Create `count` entities with no components.
    pub fn create(&mut self, count: usize) -> Vec<Entity> {
        let entities = self.entities.create(count);
        self.mark_modified(entities.iter().copied());
        entities
    }

    pub fn create_one(&mut self) -> Entity {
        let entity = self.entities.create_one();
        self.mark_modified([entity]);
        entity
    }

    /// Create `count` entities, each with a clone of `prototype`.
    pub fn create_with<T: Component>(&mut self, count: usize, prototype: T) -> Result<Vec<Entity>, EcsError> {
        let entities = self.create(count);
        self.add(&entities, prototype)?;
        Ok(entities)
    }

    /// Create one entity per value.
    pub fn create_each<T: Component>(&mut self, values: Vec<T>) -> Result<Vec<Entity>, EcsError> {
        let entities = self.create(values.len());
        self.add_each(&entities, values)?;
        Ok(entities)
    }

    /// Create `count` entities with `make(entity)`.
    pub fn create_from<T, F>(&mut self, count: usize, make: F) -> Result<Vec<Entity>, EcsError>
    where
        T: Component,
        F: FnMut(Entity) -> T,
    {
        let entities = self.create(count);
        self.add_with(&entities, make)?;
        Ok(entities)
    }

    /// Destroy entities, moving all their components to the removed stage.
    ///
    /// Invalid or already destroyed handles are ignored. Returns how many
    /// entities were destroyed. The handles become reusable after the next
    /// [`end_tick`](Self::end_tick).
    pub fn destroy(&mut self, entities: &[Entity]) -> usize {
        let destroyed = self.entities.destroy(entities);
        for store in &mut self.stores {
            for &entity in &destroyed {
                store.remove(entity);
            }
        }
        let count = destroyed.len();
        self.mark_modified(destroyed);
        count
    }

    /// Whether `entity` is alive.
    pub fn is_valid(&self, entity: Entity) -> bool {
        self.entities.is_alive(entity)
    }

    /// Number of alive entities.
    pub fn len(&self) -> usize {
        self.entities.alive_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One past the highest raw entity value ever issued.
    pub fn capacity(&self) -> usize {
        self.entities.capacity()
    }

    /// All alive entities in ascending order.
    pub fn all_entities(&self) -> Vec<Entity> {
        self.entities.all_entities()
    }

    // -- structural component changes ---------------------------------------

    /// Add a clone of `prototype` to every entity.
    ///
    /// Fails with `InvalidEntity` or `DuplicateComponent` without adding
    /// anything.
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
        self.insert_all(entities, values)
    }

    /// Add `make(entity)` to every entity.
    pub fn add_with<T, F>(&mut self, entities: &[Entity], mut make: F) -> Result<(), EcsError>
    where
        T: Component,
        F: FnMut(Entity) -> T,
    {
        self.insert_all(entities, entities.iter().map(|&e| make(e)))
    }

    /// Every entity must be alive and, unless `T` is a tag, must not have
    /// `T` yet. The whole slice is checked before anything is inserted and
    /// `values` is only consumed once the checks pass. `set` is the way to
    /// overwrite an existing value.
    fn insert_all<T: Component>(
        &mut self,
        entities: &[Entity],
        values: impl IntoIterator<Item = T>,
    ) -> Result<(), EcsError> {
        for &entity in entities {
            if !self.is_valid(entity) {
                return Err(EcsError::InvalidEntity { entity });
            }
        }
        self.register::<T>();
        let name = self.name_of::<T>();
        let store = self.storage_or_register::<T>()?;
        if !store.is_tag() {
            let mut seen = BTreeSet::new();
            for &entity in entities {
                if store.has(entity) || !seen.insert(entity) {
                    return Err(EcsError::DuplicateComponent {
                        entity,
                        component: name,
                    });
                }
            }
        }
        let mut inserted = Vec::with_capacity(entities.len());
        for (&entity, value) in entities.iter().zip(values) {
            if store.insert(entity, value)? {
                inserted.push(entity);
            }
        }
        self.mark_modified(inserted);
        Ok(())
    }

    /// Remove `T` from every entity that has it. Returns how many lost it.
    pub fn remove<T: Component>(&mut self, entities: &[Entity]) -> usize {
        match self.registry.key_of::<T>() {
            Some(key) => self.remove_key(key, entities),
            None => 0,
        }
    }

    /// Type-erased [`remove`](Self::remove).
    pub fn remove_key(&mut self, key: ComponentKey, entities: &[Entity]) -> usize {
        let Some(store) = self.stores.get_mut(key.index()) else {
            return 0;
        };
        let removed: Vec<Entity> = entities.iter().copied().filter(|&e| store.remove(e)).collect();
        let count = removed.len();
        self.mark_modified(removed);
        count
    }

    /// Strip every component from the entities. They stay alive.
    pub fn reset(&mut self, entities: &[Entity]) -> usize {
        let mut count = 0;
        let mut touched = Vec::new();
        for store in &mut self.stores {
            for &entity in entities {
                if store.remove(entity) {
                    count += 1;
                    touched.push(entity);
                }
            }
        }
        self.mark_modified(touched);
        count
    }

    /// Move every live value of a foreign store into the matching world store.
    ///
    /// Used by command buffer merges. Returns how many components were added.
    pub(crate) fn absorb(
        &mut self,
        source: &mut dyn ComponentStore,
        remap: &dyn Fn(Entity) -> Option<Entity>,
    ) -> Result<usize, EcsError> {
        let key = self.register_descriptor(&source.descriptor());
        let inserted = source.drain_into(self.stores[key.index()].as_mut(), remap)?;
        let count = inserted.len();
        self.mark_modified(inserted);
        Ok(count)
    }

    /// Drop every entity, component and tracked result.
    pub fn clear(&mut self) {
        self.entities.clear();
        for store in &mut self.stores {
            store.clear();
        }
        self.modified.clear();
        self.cache.rebuild(&self.stores, &self.entities);
        self.cache_fresh = true;
    }

    // -- component access (no change tracking) ------------------------------

    /// Whether `entity` currently has `T`.
    pub fn has<T: Component>(&self, entity: Entity) -> bool {
        self.storage::<T>().is_some_and(|s| s.has(entity))
    }

    /// Type-erased [`has`](Self::has).
    pub fn has_key(&self, key: ComponentKey, entity: Entity) -> bool {
        self.store(key).is_some_and(|s| s.has(entity))
    }

    /// Current value of `T` on `entity`.
    pub fn get<T: Component>(&self, entity: Entity) -> Result<&T, EcsError> {
        self.try_get::<T>(entity).ok_or_else(|| EcsError::MissingComponent {
            entity,
            component: self.name_of::<T>(),
        })
    }

    pub fn try_get<T: Component>(&self, entity: Entity) -> Option<&T> {
        self.storage::<T>()?.get(entity)
    }

    /// Value of `T` including one removed since the last tick boundary.
    pub fn get_any_stage<T: Component>(&self, entity: Entity) -> Option<&T> {
        self.storage::<T>()?.get_any_stage(entity)
    }

    pub fn get_mut<T: Component>(&mut self, entity: Entity) -> Result<&mut T, EcsError> {
        let name = self.name_of::<T>();
        self.storage_mut::<T>()
            .and_then(|s| s.get_mut(entity))
            .ok_or(EcsError::MissingComponent {
                entity,
                component: name,
            })
    }

    /// Overwrite the existing value of `T` on `entity`.
    pub fn set<T: Component>(&mut self, entity: Entity, value: T) -> Result<(), EcsError> {
        *self.get_mut::<T>(entity)? = value;
        Ok(())
    }

    /// Live values of `T`, aligned with [`entities_of`](Self::entities_of).
    pub fn view<T: Component>(&self) -> &[T] {
        self.storage::<T>().map_or(&[][..], |s| s.values())
    }

    pub fn view_mut<T: Component>(&mut self) -> &mut [T] {
        match self.storage_mut::<T>() {
            Some(s) => s.values_mut(),
            None => &mut [],
        }
    }

    /// Entities that currently have `T`, in storage order.
    pub fn entities_of<T: Component>(&self) -> &[Entity] {
        self.storage::<T>()
            .map_or(&[][..], |s| s.entities(StageRange::Alive))
    }

    /// Number of entities that currently have `T`.
    pub fn count<T: Component>(&self) -> usize {
        self.entities_of::<T>().len()
    }

    // -- queries -----------------------------------------------------------

    /// Compile a query against this world, registering every type it names.
    pub fn compile(&mut self, query: &Query) -> Result<CompiledQuery, EcsError> {
        if query.order_by.len() > 1 {
            return Err(EcsError::MultipleOrderBy {
                count: query.order_by.len(),
            });
        }
        let descriptors: Vec<ComponentDescriptor> = query.descriptors().copied().collect();
        for descriptor in &descriptors {
            self.register_descriptor(descriptor);
        }
        let keys = |world: &Self, set: &[ComponentDescriptor]| -> Vec<ComponentKey> {
            set.iter()
                .filter_map(|d| world.registry.lookup(d.type_id()))
                .collect()
        };
        let group = FilterGroup::new(FilterSets {
            required: keys(self, &query.required),
            on_add: keys(self, &query.on_add),
            on_remove: keys(self, &query.on_remove),
            on_combine: keys(self, &query.on_combine),
            on_break: keys(self, &query.on_break),
            except: keys(self, &query.except),
        });

        let mut bindings: Vec<crate::filter::Binding> = Vec::with_capacity(query.bindings.len());
        for (descriptor, access) in &query.bindings {
            let key = self.register_descriptor(descriptor);
            let name = || self.registry.name(key).to_owned();
            if group.except().contains(&key) {
                return Err(EcsError::ConflictingBinding { component: name() });
            }
            if bindings.iter().any(|b| b.key == key) {
                return Err(EcsError::AliasedAccess { component: name() });
            }
            bindings.push(crate::filter::Binding {
                key,
                type_id: descriptor.type_id(),
                access: *access,
            });
        }

        let mut conditions = Vec::with_capacity(query.conditions.len());
        for clause in &query.conditions {
            let key = self.register_descriptor(&clause.descriptor);
            if group.except().contains(&key) {
                return Err(EcsError::ConflictingBinding {
                    component: self.registry.name(key).to_owned(),
                });
            }
            conditions.push((key, Arc::clone(&clause.predicate)));
        }
        let order_by = query.order_by.first().map(|clause| {
            (
                self.register_descriptor(&clause.descriptor),
                Arc::clone(&clause.compare),
            )
        });

        Ok(CompiledQuery {
            group: Arc::new(group),
            bindings,
            order_by,
            conditions,
            policy: query.policy,
        })
    }

    /// Resolve a query from scratch, outside the system mechanism.
    pub fn entities_matching(&mut self, query: &Query) -> Result<Vec<Entity>, EcsError> {
        let compiled = self.compile(query)?;
        let mut entities = resolve::resolve(&compiled.group, &self.stores, &self.entities);
        resolve::apply_transforms(
            &compiled,
            &self.stores,
            &mut entities,
            self.config.parallel_sort_threshold,
        );
        Ok(entities)
    }

    /// Entities matching a compiled query, with its transforms applied.
    pub fn filter(&self, query: &CompiledQuery) -> Vec<Entity> {
        self.resolve_for(query, false)
    }

    /// Like [`filter`](Self::filter). With `seed_existing`, `on_add` and
    /// `on_combine` act as plain requirements.
    ///
    /// Tracked groups are served from the cache. If the world changed since
    /// the cache was refreshed, the cached result is updated on a copy.
    pub fn resolve_for(&self, query: &CompiledQuery, seed_existing: bool) -> Vec<Entity> {
        let group = &query.group;
        let mut entities = if seed_existing {
            resolve::resolve(&group.as_existing(), &self.stores, &self.entities)
        } else {
            match self.cache.get(group) {
                Some(cached) if self.cache_fresh => cached.to_vec(),
                Some(cached) if !group.is_event_driven() => {
                    let modified: Vec<Entity> = self.modified.iter().copied().collect();
                    resolve::reseed(cached, &modified, |e| {
                        self.entities.is_alive(e) && resolve::matches(group, &self.stores, e)
                    })
                }
                _ => resolve::resolve(group, &self.stores, &self.entities),
            }
        };
        resolve::apply_transforms(
            query,
            &self.stores,
            &mut entities,
            self.config.parallel_sort_threshold,
        );
        entities
    }

    /// Resolve and materialize a pack in one go.
    pub fn pack(&self, query: &CompiledQuery) -> Result<Pack, EcsError> {
        self.materialize(query, self.filter(query))
    }

    /// Bind `entities` to the query's columns.
    pub fn materialize(&self, query: &CompiledQuery, entities: Vec<Entity>) -> Result<Pack, EcsError> {
        let mut columns = Vec::with_capacity(query.bindings.len());
        for binding in &query.bindings {
            let store = self
                .store(binding.key)
                .ok_or_else(|| EcsError::UnboundComponent {
                    component: self.registry.name(binding.key).to_owned(),
                })?;
            columns.push(Column {
                key: binding.key,
                type_id: binding.type_id,
                name: store.name().to_owned(),
                access: binding.access,
                data: store.gather(&entities)?,
            });
        }
        Ok(Pack::new(entities, columns, query.policy))
    }

    /// Write the read-write columns of a pack back to the stores.
    pub fn write_back(&mut self, pack: Pack) -> Result<(), EcsError> {
        let Pack {
            entities, columns, ..
        } = pack;
        for column in columns {
            if column.access != Access::Write {
                continue;
            }
            let store = self
                .stores
                .get_mut(column.key.index())
                .ok_or(EcsError::UnboundComponent {
                    component: column.name,
                })?;
            column.data.scatter(&entities, store.as_mut())?;
        }
        Ok(())
    }

    // -- cache and tick boundaries ------------------------------------------

    /// Share the query's group with the cache. Equal groups end up with one
    /// `Arc` and one cached result.
    pub fn track(&mut self, query: &mut CompiledQuery) {
        query.group = self
            .cache
            .track(Arc::clone(&query.group), &self.stores, &self.entities);
    }

    /// Release a group previously passed to [`track`](Self::track).
    pub fn untrack(&mut self, query: &CompiledQuery) -> bool {
        self.cache.untrack(&query.group)
    }

    pub fn cache(&self) -> &FilterCache {
        &self.cache
    }

    /// Entities whose composition changed since the last `begin_tick`.
    pub fn modified(&self) -> &BTreeSet<Entity> {
        &self.modified
    }

    /// Refresh every tracked filter and start a new modification window.
    pub fn begin_tick(&mut self) {
        let modified: Vec<Entity> = std::mem::take(&mut self.modified).into_iter().collect();
        self.cache.refresh(&self.stores, &self.entities, &modified);
        self.cache_fresh = true;
    }

    /// Tick boundary: settle added components, drop removed ones, and make
    /// handles destroyed before this point reusable.
    pub fn end_tick(&mut self) {
        for store in &mut self.stores {
            store.promote();
        }
        self.entities.recycle_pending();
        self.cache_fresh = false;
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("entities", &self.len())
            .field("components", &self.registry.len())
            .field("tracked_filters", &self.cache.len())
            .field("modified", &self.modified.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
