//! Filter resolution, per-query transforms and the shared result cache.
//!
//! Resolution picks the smallest candidate population among the group's
//! sets (a required key's live entities, or a change stage for the event
//! markers), sorts it, and narrows it with O(1) membership probes against
//! the sparse index of every other key.
//!
//! The [`FilterCache`] keeps one sorted result per distinct [`FilterGroup`].
//! At the start of each tick, groups without event markers are updated
//! incrementally from the set of entities whose composition changed since the
//! previous refresh. Event-driven groups depend on stage transitions that
//! happen for every entity at the tick boundary, so they are re-resolved from
//! their (small) change-stage seeds instead.

use std::collections::HashMap;
use std::sync::Arc;

use rayon::slice::ParallelSliceMut;
use tracing::debug;

use crate::component::ComponentKey;
use crate::entity::{Entity, EntityAllocator};
use crate::filter::{CompiledQuery, FilterGroup};
use crate::storage::{ComponentStore, StageRange};

type Stores = [Box<dyn ComponentStore>];

fn store(stores: &Stores, key: ComponentKey) -> Option<&dyn ComponentStore> {
    stores.get(key.index()).map(|s| s.as_ref())
}

// ---------------------------------------------------------------------------
// Membership
// ---------------------------------------------------------------------------

/// Whether `entity` satisfies every set of `group`.
///
/// Does not check liveness: entities destroyed this tick still match
/// `on_remove` and `on_break` groups through their removed-stage data.
pub fn matches(group: &FilterGroup, stores: &Stores, entity: Entity) -> bool {
    let all = |keys: &[ComponentKey], test: &dyn Fn(&dyn ComponentStore) -> bool| {
        keys.iter()
            .all(|&key| store(stores, key).is_some_and(|s| test(s)))
    };
    let any = |keys: &[ComponentKey], test: &dyn Fn(&dyn ComponentStore) -> bool| {
        keys.iter()
            .any(|&key| store(stores, key).is_some_and(|s| test(s)))
    };

    if !all(group.on_remove(), &|s| s.has_removed(entity)) {
        return false;
    }
    if !group.on_break().is_empty()
        && !(any(group.on_break(), &|s| s.has_removed(entity))
            && all(group.on_break(), &|s| s.has_storage_for(entity)))
    {
        return false;
    }
    if !all(group.on_add(), &|s| s.has_added(entity)) {
        return false;
    }
    if !group.on_combine().is_empty()
        && !(any(group.on_combine(), &|s| s.has_added(entity))
            && all(group.on_combine(), &|s| s.has(entity)))
    {
        return false;
    }
    if !all(group.required(), &|s| s.has(entity)) {
        return false;
    }
    !any(group.except(), &|s| s.has(entity))
}

// ---------------------------------------------------------------------------
// Full resolution
// ---------------------------------------------------------------------------

/// A candidate population: one dense region, or the union of several.
enum Seed<'a> {
    Slice(&'a [Entity]),
    Union(Vec<&'a [Entity]>),
}

impl Seed<'_> {
    fn len(&self) -> usize {
        match self {
            Seed::Slice(s) => s.len(),
            Seed::Union(parts) => parts.iter().map(|p| p.len()).sum(),
        }
    }

    fn collect(self) -> Vec<Entity> {
        let mut out = match self {
            Seed::Slice(s) => s.to_vec(),
            Seed::Union(parts) => parts.concat(),
        };
        out.sort_unstable();
        out.dedup();
        out
    }
}

/// Resolve `group` from scratch. The result is sorted by entity.
pub fn resolve(group: &FilterGroup, stores: &Stores, entities: &EntityAllocator) -> Vec<Entity> {
    if group.is_unconstrained() {
        return entities.all_entities();
    }

    let mut candidates: Vec<Seed<'_>> = Vec::new();
    let single = |key: ComponentKey, stage: StageRange| store(stores, key).map(|s| s.entities(stage));

    for (keys, stage) in [
        (group.required(), StageRange::Alive),
        (group.on_add(), StageRange::Added),
        (group.on_remove(), StageRange::Removed),
    ] {
        for &key in keys {
            match single(key, stage) {
                Some(slice) => candidates.push(Seed::Slice(slice)),
                None => return Vec::new(),
            }
        }
    }
    for (keys, stage) in [
        (group.on_combine(), StageRange::Added),
        (group.on_break(), StageRange::Removed),
    ] {
        if keys.is_empty() {
            continue;
        }
        let mut parts = Vec::with_capacity(keys.len());
        for &key in keys {
            match single(key, stage) {
                Some(slice) => parts.push(slice),
                None => return Vec::new(),
            }
        }
        candidates.push(Seed::Union(parts));
    }

    let seed = match candidates.into_iter().min_by_key(Seed::len) {
        Some(seed) => seed.collect(),
        // Only `except` sets: start from every alive entity.
        None => entities.all_entities(),
    };

    seed.into_iter()
        .filter(|&entity| matches(group, stores, entity))
        .collect()
}

/// Merge a sorted cached result with a sorted set of modified entities.
///
/// Entities outside `modified` keep their cached membership; entities inside
/// it are re-tested with `keep`.
pub fn reseed(cached: &[Entity], modified: &[Entity], keep: impl Fn(Entity) -> bool) -> Vec<Entity> {
    let mut out = Vec::with_capacity(cached.len() + modified.len());
    let (mut i, mut j) = (0, 0);
    loop {
        match (cached.get(i), modified.get(j)) {
            (Some(&c), Some(&m)) if c < m => {
                out.push(c);
                i += 1;
            }
            (Some(&c), Some(&m)) if c == m => {
                if keep(m) {
                    out.push(m);
                }
                i += 1;
                j += 1;
            }
            (_, Some(&m)) => {
                if keep(m) {
                    out.push(m);
                }
                j += 1;
            }
            (Some(&c), None) => {
                out.push(c);
                i += 1;
            }
            (None, None) => break,
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Transforms
// ---------------------------------------------------------------------------

/// Apply the query's `on_condition` filters and `order_by` sort in place.
///
/// Conditions preserve relative order. The sort is stable; ranges longer
/// than `parallel_threshold` are sorted with a parallel merge sort.
pub fn apply_transforms(
    query: &CompiledQuery,
    stores: &Stores,
    entities: &mut Vec<Entity>,
    parallel_threshold: usize,
) {
    for (key, predicate) in &query.conditions {
        match store(stores, *key) {
            Some(s) => entities.retain(|&e| predicate(s, e)),
            None => entities.clear(),
        }
    }

    if let Some((key, compare)) = &query.order_by {
        let Some(s) = store(stores, *key) else {
            return;
        };
        if entities.len() > parallel_threshold {
            entities.par_sort_by(|&a, &b| compare(s, a, b));
        } else {
            entities.sort_by(|&a, &b| compare(s, a, b));
        }
    }
}

// ---------------------------------------------------------------------------
// FilterCache
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct CacheEntry {
    refs: usize,
    /// Sorted by entity.
    entities: Vec<Entity>,
}

/// Shared, reference-counted results for tracked filter groups.
#[derive(Debug, Default)]
pub struct FilterCache {
    entries: HashMap<Arc<FilterGroup>, CacheEntry>,
}

impl FilterCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `group`, resolving it if no equal group is tracked yet.
    ///
    /// Returns the shared handle for the group, which may be an `Arc` created
    /// by an earlier, structurally equal query.
    pub fn track(
        &mut self,
        group: Arc<FilterGroup>,
        stores: &Stores,
        entities: &EntityAllocator,
    ) -> Arc<FilterGroup> {
        let existing = self
            .entries
            .get_key_value(&*group)
            .map(|(shared, _)| Arc::clone(shared));
        if let Some(shared) = existing {
            if let Some(entry) = self.entries.get_mut(&*shared) {
                entry.refs += 1;
            }
            return shared;
        }
        let resolved = resolve(&group, stores, entities);
        debug!(
            keys = group.keys().len(),
            matched = resolved.len(),
            "filter group tracked"
        );
        self.entries.insert(
            Arc::clone(&group),
            CacheEntry {
                refs: 1,
                entities: resolved,
            },
        );
        group
    }

    /// Drop one reference to `group`. Returns `true` when the entry was evicted.
    pub fn untrack(&mut self, group: &FilterGroup) -> bool {
        let Some(entry) = self.entries.get_mut(group) else {
            return false;
        };
        entry.refs -= 1;
        if entry.refs == 0 {
            self.entries.remove(group);
            debug!("filter group evicted");
            true
        } else {
            false
        }
    }

    /// Cached result of a tracked group, sorted by entity.
    pub fn get(&self, group: &FilterGroup) -> Option<&[Entity]> {
        self.entries.get(group).map(|e| e.entities.as_slice())
    }

    /// Number of systems or callers sharing `group`.
    pub fn refs(&self, group: &FilterGroup) -> usize {
        self.entries.get(group).map_or(0, |e| e.refs)
    }

    /// Bring every tracked result up to date.
    ///
    /// `modified` must be sorted and hold every entity whose composition
    /// changed since the previous refresh.
    pub fn refresh(&mut self, stores: &Stores, entities: &EntityAllocator, modified: &[Entity]) {
        for (group, entry) in self.entries.iter_mut() {
            if group.is_event_driven() {
                entry.entities = resolve(group, stores, entities);
            } else if !modified.is_empty() {
                entry.entities = reseed(&entry.entities, modified, |e| {
                    entities.is_alive(e) && matches(group, stores, e)
                });
            }
        }
    }

    /// Re-resolve every tracked group from scratch.
    pub fn rebuild(&mut self, stores: &Stores, entities: &EntityAllocator) {
        for (group, entry) in self.entries.iter_mut() {
            entry.entities = resolve(group, stores, entities);
        }
    }

    /// Number of distinct tracked groups.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
