//! Query descriptions and their canonical filter groups.
//!
//! A [`Query`] is the builder a system author fills in: which components the
//! pack binds (read or read-write) and which change-tracking markers narrow
//! the entity set. [`World::compile`](crate::world::World::compile) turns it
//! into a [`CompiledQuery`], whose [`FilterGroup`] is the canonical, hashable
//! set description shared by every query with the same shape.
//!
//! | Builder call         | Set            | Matches an entity that ...                         |
//! |----------------------|----------------|----------------------------------------------------|
//! | `read` / `write`     | `required`     | has the component                                  |
//! | `on_add`             | `on_add`       | got the component since the last tick boundary     |
//! | `on_remove`          | `on_remove`    | lost the component since the last tick boundary    |
//! | `on_combine`         | `on_combine`   | has all of them, at least one of them newly added  |
//! | `on_break`           | `on_break`     | had all of them, at least one newly removed        |
//! | `except`             | `except`       | does not have the component                        |
//!
//! `order_by` and `on_condition` are per-query transforms applied after the
//! shared group is resolved; they do not take part in group equality.

use std::any::TypeId;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::component::{Component, ComponentDescriptor, ComponentKey};
use crate::entity::Entity;
use crate::storage::{ComponentStore, StagedStorage};

// ---------------------------------------------------------------------------
// Access and pack policy
// ---------------------------------------------------------------------------

/// How a pack column may be used by the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    /// Read-only view.
    Read,
    /// Read-write view, written back after the system returns.
    Write,
}

/// Whether a parallel system may subdivide a pack across workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PackPolicy {
    /// The entity range may be split into disjoint chunks.
    #[default]
    Partial,
    /// The pack is always handed out whole.
    Full,
}

// ---------------------------------------------------------------------------
// ComponentSet
// ---------------------------------------------------------------------------

/// A tuple of component types, used by the multi-key markers.
pub trait ComponentSet {
    /// Descriptors of every member, in tuple order.
    fn descriptors() -> Vec<ComponentDescriptor>;
}

macro_rules! impl_component_set {
    ($($name:ident),+) => {
        impl<$($name: Component),+> ComponentSet for ($($name,)+) {
            fn descriptors() -> Vec<ComponentDescriptor> {
                vec![$(ComponentDescriptor::of::<$name>()),+]
            }
        }
    };
}

impl_component_set!(A);
impl_component_set!(A, B);
impl_component_set!(A, B, C);
impl_component_set!(A, B, C, D);
impl_component_set!(A, B, C, D, E);
impl_component_set!(A, B, C, D, E, F);

// ---------------------------------------------------------------------------
// Erased predicates
// ---------------------------------------------------------------------------

/// Comparison over two entities' values of one component. Values are read
/// from any stage; `None` means the entity has no value at all.
pub(crate) type ErasedOrder =
    Arc<dyn Fn(&dyn ComponentStore, Entity, Entity) -> Ordering + Send + Sync>;

/// Predicate over one entity's value of one component.
pub(crate) type ErasedCondition = Arc<dyn Fn(&dyn ComponentStore, Entity) -> bool + Send + Sync>;

#[derive(Clone)]
pub(crate) struct OrderClause {
    pub(crate) descriptor: ComponentDescriptor,
    pub(crate) compare: ErasedOrder,
}

#[derive(Clone)]
pub(crate) struct ConditionClause {
    pub(crate) descriptor: ComponentDescriptor,
    pub(crate) predicate: ErasedCondition,
}

fn typed<T: Component>(store: &dyn ComponentStore) -> Option<&StagedStorage<T>> {
    store.as_any().downcast_ref::<StagedStorage<T>>()
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

/// Declarative description of one dependency pack.
///
/// ```
/// use strata_ecs::prelude::*;
///
/// #[derive(Clone)]
/// struct Position(f32);
/// #[derive(Clone)]
/// struct Velocity(f32);
/// #[derive(Clone)]
/// struct Frozen;
///
/// let query = Query::new()
///     .write::<Position>()
///     .read::<Velocity>()
///     .except::<Frozen>();
/// assert_eq!(query.binding_count(), 2);
/// ```
#[derive(Clone, Default)]
pub struct Query {
    pub(crate) bindings: Vec<(ComponentDescriptor, Access)>,
    pub(crate) required: Vec<ComponentDescriptor>,
    pub(crate) on_add: Vec<ComponentDescriptor>,
    pub(crate) on_remove: Vec<ComponentDescriptor>,
    pub(crate) on_combine: Vec<ComponentDescriptor>,
    pub(crate) on_break: Vec<ComponentDescriptor>,
    pub(crate) except: Vec<ComponentDescriptor>,
    pub(crate) order_by: Vec<OrderClause>,
    pub(crate) conditions: Vec<ConditionClause>,
    pub(crate) policy: PackPolicy,
}

impl Query {
    /// Empty query. Resolves to every alive entity.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `T` read-only. The entity must have `T`.
    pub fn read<T: Component>(self) -> Self {
        self.bind::<T>(Access::Read)
    }

    /// Bind `T` read-write. The entity must have `T`.
    pub fn write<T: Component>(self) -> Self {
        self.bind::<T>(Access::Write)
    }

    fn bind<T: Component>(mut self, access: Access) -> Self {
        let descriptor = ComponentDescriptor::of::<T>();
        self.bindings.push((descriptor, access));
        self.required.push(descriptor);
        self
    }

    /// Require `T` without binding a column.
    pub fn with<T: Component>(mut self) -> Self {
        self.required.push(ComponentDescriptor::of::<T>());
        self
    }

    /// Match entities that received `T` since the last tick boundary.
    pub fn on_add<T: Component>(mut self) -> Self {
        self.on_add.push(ComponentDescriptor::of::<T>());
        self
    }

    /// Match entities that lost `T` since the last tick boundary.
    ///
    /// A bound `T` is still readable: the removed value stays in the store
    /// until the boundary.
    pub fn on_remove<T: Component>(mut self) -> Self {
        self.on_remove.push(ComponentDescriptor::of::<T>());
        self
    }

    /// Match entities on which every member of `S` co-occurs for the first time.
    pub fn on_combine<S: ComponentSet>(mut self) -> Self {
        self.on_combine.extend(S::descriptors());
        self
    }

    /// Match entities on which the members of `S` stopped co-occurring.
    pub fn on_break<S: ComponentSet>(mut self) -> Self {
        self.on_break.extend(S::descriptors());
        self
    }

    /// Reject entities that have `T`.
    pub fn except<T: Component>(mut self) -> Self {
        self.except.push(ComponentDescriptor::of::<T>());
        self
    }

    /// Sort the resolved range by `compare` applied to `T`.
    ///
    /// The sort is stable. Entities without a `T` value sort last. Only one
    /// `order_by` is allowed per query; a second one is rejected when the
    /// query is compiled.
    pub fn order_by<T, F>(mut self, compare: F) -> Self
    where
        T: Component,
        F: Fn(&T, &T) -> Ordering + Send + Sync + 'static,
    {
        let compare: ErasedOrder = Arc::new(move |store: &dyn ComponentStore, a: Entity, b: Entity| {
            let Some(store) = typed::<T>(store) else {
                return Ordering::Equal;
            };
            match (store.get_any_stage(a), store.get_any_stage(b)) {
                (Some(a), Some(b)) => compare(a, b),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        });
        self.order_by.push(OrderClause {
            descriptor: ComponentDescriptor::of::<T>(),
            compare,
        });
        self
    }

    /// Keep only entities whose `T` satisfies `predicate`. Implies `T` is required.
    pub fn on_condition<T, F>(mut self, predicate: F) -> Self
    where
        T: Component,
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let predicate: ErasedCondition = Arc::new(move |store: &dyn ComponentStore, entity: Entity| {
            typed::<T>(store)
                .and_then(|store| store.get_any_stage(entity))
                .is_some_and(&predicate)
        });
        let descriptor = ComponentDescriptor::of::<T>();
        self.required.push(descriptor);
        self.conditions.push(ConditionClause {
            descriptor,
            predicate,
        });
        self
    }

    /// Allow a parallel system to split this pack (the default).
    pub fn partial(mut self) -> Self {
        self.policy = PackPolicy::Partial;
        self
    }

    /// Never split this pack across workers.
    pub fn full(mut self) -> Self {
        self.policy = PackPolicy::Full;
        self
    }

    /// Number of bound columns.
    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    /// Subdivision policy.
    pub fn policy(&self) -> PackPolicy {
        self.policy
    }

    /// Whether no column is bound read-write.
    pub fn is_read_only(&self) -> bool {
        self.bindings.iter().all(|(_, access)| *access == Access::Read)
    }

    /// Every descriptor the query mentions, for registration.
    pub(crate) fn descriptors(&self) -> impl Iterator<Item = &ComponentDescriptor> {
        self.required
            .iter()
            .chain(&self.on_add)
            .chain(&self.on_remove)
            .chain(&self.on_combine)
            .chain(&self.on_break)
            .chain(&self.except)
            .chain(self.order_by.iter().map(|o| &o.descriptor))
            .chain(self.conditions.iter().map(|c| &c.descriptor))
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = |set: &[ComponentDescriptor]| -> Vec<&'static str> {
            set.iter().map(|d| d.type_name()).collect()
        };
        f.debug_struct("Query")
            .field("required", &names(&self.required))
            .field("on_add", &names(&self.on_add))
            .field("on_remove", &names(&self.on_remove))
            .field("on_combine", &names(&self.on_combine))
            .field("on_break", &names(&self.on_break))
            .field("except", &names(&self.except))
            .field("order_by", &self.order_by.len())
            .field("conditions", &self.conditions.len())
            .field("policy", &self.policy)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// FilterGroup
// ---------------------------------------------------------------------------

/// Raw key sets before canonicalization.
#[derive(Debug, Clone, Default)]
pub struct FilterSets {
    pub required: Vec<ComponentKey>,
    pub on_add: Vec<ComponentKey>,
    pub on_remove: Vec<ComponentKey>,
    pub on_combine: Vec<ComponentKey>,
    pub on_break: Vec<ComponentKey>,
    pub except: Vec<ComponentKey>,
}

/// Canonical set description of a query.
///
/// Every set is sorted and deduplicated, and `required` never shares a key
/// with any other set. Two groups compare equal exactly when their sets do,
/// which is what lets structurally identical queries share one cached result.
///
/// `order_by` and `on_condition` are not part of the group. Closures have no
/// meaningful equality, so queries that differ only in their predicates share
/// the unordered, unconditioned entity list, and each [`CompiledQuery`]
/// applies its own transforms to a copy on every resolve.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct FilterGroup {
    required: Vec<ComponentKey>,
    on_add: Vec<ComponentKey>,
    on_remove: Vec<ComponentKey>,
    on_combine: Vec<ComponentKey>,
    on_break: Vec<ComponentKey>,
    except: Vec<ComponentKey>,
}

fn canonical(mut keys: Vec<ComponentKey>) -> Vec<ComponentKey> {
    keys.sort_unstable();
    keys.dedup();
    keys
}

/// `a ⊆ b` for sorted, deduplicated slices.
fn sorted_subset(a: &[ComponentKey], b: &[ComponentKey]) -> bool {
    let mut rest = b.iter();
    a.iter().all(|key| rest.any(|other| other == key))
}

impl FilterGroup {
    /// Canonicalize raw sets.
    pub fn new(sets: FilterSets) -> Self {
        let on_add = canonical(sets.on_add);
        let on_remove = canonical(sets.on_remove);
        let on_combine = canonical(sets.on_combine);
        let on_break = canonical(sets.on_break);
        let except = canonical(sets.except);
        let mut required = canonical(sets.required);
        required.retain(|key| {
            !(on_add.binary_search(key).is_ok()
                || on_remove.binary_search(key).is_ok()
                || on_combine.binary_search(key).is_ok()
                || on_break.binary_search(key).is_ok()
                || except.binary_search(key).is_ok())
        });
        Self {
            required,
            on_add,
            on_remove,
            on_combine,
            on_break,
            except,
        }
    }

    pub fn required(&self) -> &[ComponentKey] {
        &self.required
    }

    pub fn on_add(&self) -> &[ComponentKey] {
        &self.on_add
    }

    pub fn on_remove(&self) -> &[ComponentKey] {
        &self.on_remove
    }

    pub fn on_combine(&self) -> &[ComponentKey] {
        &self.on_combine
    }

    pub fn on_break(&self) -> &[ComponentKey] {
        &self.on_break
    }

    pub fn except(&self) -> &[ComponentKey] {
        &self.except
    }

    /// Whether membership depends on per-tick change stages.
    pub fn is_event_driven(&self) -> bool {
        !(self.on_add.is_empty()
            && self.on_remove.is_empty()
            && self.on_combine.is_empty()
            && self.on_break.is_empty())
    }

    /// Whether the group has no set at all (matches every alive entity).
    pub fn is_unconstrained(&self) -> bool {
        !self.is_event_driven() && self.required.is_empty() && self.except.is_empty()
    }

    /// Every set of `self` is a subset of the matching set of `other`.
    pub fn is_subset_of(&self, other: &FilterGroup) -> bool {
        sorted_subset(&self.required, &other.required)
            && sorted_subset(&self.on_add, &other.on_add)
            && sorted_subset(&self.on_remove, &other.on_remove)
            && sorted_subset(&self.on_combine, &other.on_combine)
            && sorted_subset(&self.on_break, &other.on_break)
            && sorted_subset(&self.except, &other.except)
    }

    pub fn is_superset_of(&self, other: &FilterGroup) -> bool {
        other.is_subset_of(self)
    }

    /// The group with `on_add` and `on_combine` demoted to plain requirements,
    /// so entities that already had the components match too.
    pub fn as_existing(&self) -> FilterGroup {
        if self.on_add.is_empty() && self.on_combine.is_empty() {
            return self.clone();
        }
        let mut required = self.required.clone();
        required.extend(&self.on_add);
        required.extend(&self.on_combine);
        FilterGroup::new(FilterSets {
            required,
            on_add: Vec::new(),
            on_remove: self.on_remove.clone(),
            on_combine: Vec::new(),
            on_break: self.on_break.clone(),
            except: self.except.clone(),
        })
    }

    /// Every key the group mentions, sorted.
    pub fn keys(&self) -> Vec<ComponentKey> {
        canonical(
            self.required
                .iter()
                .chain(&self.on_add)
                .chain(&self.on_remove)
                .chain(&self.on_combine)
                .chain(&self.on_break)
                .chain(&self.except)
                .copied()
                .collect(),
        )
    }
}

// ---------------------------------------------------------------------------
// CompiledQuery
// ---------------------------------------------------------------------------

/// One bound column of a compiled query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub key: ComponentKey,
    pub type_id: TypeId,
    pub access: Access,
}

/// A [`Query`] resolved against one world's key registry.
#[derive(Clone)]
pub struct CompiledQuery {
    pub(crate) group: Arc<FilterGroup>,
    pub(crate) bindings: Vec<Binding>,
    pub(crate) order_by: Option<(ComponentKey, ErasedOrder)>,
    pub(crate) conditions: Vec<(ComponentKey, ErasedCondition)>,
    pub(crate) policy: PackPolicy,
}

impl CompiledQuery {
    pub fn group(&self) -> &Arc<FilterGroup> {
        &self.group
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    pub fn policy(&self) -> PackPolicy {
        self.policy
    }

    pub fn is_read_only(&self) -> bool {
        self.bindings.iter().all(|b| b.access == Access::Read)
    }

    /// Whether resolution must be followed by a per-query transform.
    pub fn has_transforms(&self) -> bool {
        self.order_by.is_some() || !self.conditions.is_empty()
    }
}

impl fmt::Debug for CompiledQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledQuery")
            .field("group", &self.group)
            .field("bindings", &self.bindings)
            .field("order_by", &self.order_by.as_ref().map(|(key, _)| *key))
            .field("conditions", &self.conditions.len())
            .field("policy", &self.policy)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn k(raw: u32) -> ComponentKey {
        ComponentKey(raw)
    }

    fn keys(raw: &[u32]) -> Vec<ComponentKey> {
        raw.iter().copied().map(k).collect()
    }

    #[derive(Clone)]
    struct A;
    #[derive(Clone)]
    struct B;

    #[test]
    fn sets_are_sorted_and_deduplicated() {
        let group = FilterGroup::new(FilterSets {
            required: keys(&[3, 1, 3, 2]),
            except: keys(&[9, 7, 9]),
            ..Default::default()
        });
        assert_eq!(group.required(), keys(&[1, 2, 3]).as_slice());
        assert_eq!(group.except(), keys(&[7, 9]).as_slice());
    }

    #[test]
    fn required_loses_keys_claimed_elsewhere() {
        let group = FilterGroup::new(FilterSets {
            required: keys(&[1, 2, 3, 4, 5, 6]),
            on_add: keys(&[2]),
            on_remove: keys(&[3]),
            on_combine: keys(&[4]),
            on_break: keys(&[5]),
            except: keys(&[6]),
        });
        assert_eq!(group.required(), keys(&[1]).as_slice());
        assert_eq!(group.keys(), keys(&[1, 2, 3, 4, 5, 6]));
    }

    #[test]
    fn equal_shapes_compare_equal() {
        let a = FilterGroup::new(FilterSets {
            required: keys(&[2, 1]),
            on_add: keys(&[5]),
            ..Default::default()
        });
        let b = FilterGroup::new(FilterSets {
            required: keys(&[1, 2, 5]),
            on_add: keys(&[5, 5]),
            ..Default::default()
        });
        assert_eq!(a, b);
    }

    #[test]
    fn subset_and_superset() {
        let small = FilterGroup::new(FilterSets {
            required: keys(&[1]),
            ..Default::default()
        });
        let big = FilterGroup::new(FilterSets {
            required: keys(&[1, 2]),
            except: keys(&[3]),
            ..Default::default()
        });
        assert!(small.is_subset_of(&big));
        assert!(big.is_superset_of(&small));
        assert!(!big.is_subset_of(&small));
        assert!(small.is_subset_of(&small));
    }

    #[test]
    fn as_existing_demotes_event_markers() {
        let group = FilterGroup::new(FilterSets {
            required: keys(&[1]),
            on_add: keys(&[2]),
            on_combine: keys(&[3, 4]),
            except: keys(&[5]),
            ..Default::default()
        });
        let existing = group.as_existing();
        assert_eq!(existing.required(), keys(&[1, 2, 3, 4]).as_slice());
        assert!(existing.on_add().is_empty());
        assert!(existing.on_combine().is_empty());
        assert!(!existing.is_event_driven());
        assert_eq!(existing.except(), keys(&[5]).as_slice());
    }

    #[test]
    fn unconstrained_group() {
        assert!(FilterGroup::default().is_unconstrained());
        let group = FilterGroup::new(FilterSets {
            on_remove: keys(&[1]),
            ..Default::default()
        });
        assert!(group.is_event_driven());
        assert!(!group.is_unconstrained());
    }

    #[test]
    fn query_builder_tracks_bindings() {
        let query = Query::new()
            .write::<A>()
            .read::<B>()
            .on_combine::<(A, B)>()
            .full();
        assert_eq!(query.binding_count(), 2);
        assert!(!query.is_read_only());
        assert_eq!(query.policy(), PackPolicy::Full);
        assert_eq!(query.on_combine.len(), 2);
        assert_eq!(query.required.len(), 2);
    }

    #[test]
    fn condition_implies_required() {
        let query = Query::new().on_condition::<A, _>(|_| true);
        assert_eq!(query.required.len(), 1);
        assert_eq!(query.binding_count(), 0);
        assert!(query.is_read_only());
    }
}
