//! Dependency packs: a resolved entity list bound to component columns.
//!
//! A [`Pack`] owns an entity list plus one column per bound component,
//! index-aligned with the entity list. Columns are gathered from the stores
//! when the pack is materialized and read-write columns are scattered back
//! when the system returns, so a running system never holds a borrow into
//! the world and the stores are never resized under it.
//!
//! Partial packs can be [`split`](Pack::split) into disjoint chunks for
//! parallel workers. Each chunk is written back independently.
//!
//! ```
//! use strata_ecs::prelude::*;
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct Position(f32);
//! #[derive(Debug, Clone, PartialEq)]
//! struct Velocity(f32);
//!
//! let mut world = World::new();
//! let e = world.create_with(1, Velocity(2.0)).unwrap()[0];
//! world.add(&[e], Position(1.0)).unwrap();
//!
//! let query = world.compile(&Query::new().write::<Position>().read::<Velocity>()).unwrap();
//! let mut pack = world.pack(&query).unwrap();
//! let (pos, vel) = pack.fetch::<(&mut Position, &Velocity)>().unwrap();
//! for (p, v) in pos.iter_mut().zip(vel) {
//!     p.0 += v.0;
//! }
//! world.write_back(pack).unwrap();
//! assert_eq!(world.get::<Position>(e).unwrap(), &Position(3.0));
//! ```

use std::any::{Any, TypeId};
use std::fmt;

use crate::component::{Component, ComponentKey};
use crate::entity::Entity;
use crate::filter::{Access, PackPolicy};
use crate::storage::{ComponentStore, StagedStorage};
use crate::EcsError;

// ---------------------------------------------------------------------------
// ErasedColumn
// ---------------------------------------------------------------------------

/// Type-erased, owned column of component values.
pub trait ErasedColumn: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Split off the values at `at..`, keeping `..at`.
    fn split_off(&mut self, at: usize) -> Box<dyn ErasedColumn>;
    fn clone_box(&self) -> Box<dyn ErasedColumn>;
    /// An empty column of the same type.
    fn empty(&self) -> Box<dyn ErasedColumn>;
    /// Write every value back to `store`, index-aligned with `entities`.
    ///
    /// Values land in whichever stage the entity currently occupies.
    fn scatter(self: Box<Self>, entities: &[Entity], store: &mut dyn ComponentStore) -> Result<(), EcsError>;
}

/// Concrete column behind [`ErasedColumn`].
#[derive(Debug, Clone)]
pub struct TypedColumn<T>(pub Vec<T>);

impl<T: Component> ErasedColumn for TypedColumn<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn len(&self) -> usize {
        self.0.len()
    }

    fn split_off(&mut self, at: usize) -> Box<dyn ErasedColumn> {
        Box::new(TypedColumn(self.0.split_off(at)))
    }

    fn clone_box(&self) -> Box<dyn ErasedColumn> {
        Box::new(self.clone())
    }

    fn empty(&self) -> Box<dyn ErasedColumn> {
        Box::new(TypedColumn::<T>(Vec::new()))
    }

    fn scatter(self: Box<Self>, entities: &[Entity], store: &mut dyn ComponentStore) -> Result<(), EcsError> {
        if entities.len() != self.0.len() {
            return Err(EcsError::LengthMismatch {
                expected: entities.len(),
                actual: self.0.len(),
            });
        }
        let name = store.name().to_owned();
        let typed = store
            .as_any_mut()
            .downcast_mut::<StagedStorage<T>>()
            .ok_or_else(|| EcsError::TypeMismatch {
                component: name.clone(),
            })?;
        for (&entity, value) in entities.iter().zip(self.0) {
            if !typed.set_any_stage(entity, value) {
                return Err(EcsError::MissingComponent {
                    entity,
                    component: name,
                });
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Column
// ---------------------------------------------------------------------------

/// One bound component column of a [`Pack`].
pub struct Column {
    pub(crate) key: ComponentKey,
    pub(crate) type_id: TypeId,
    pub(crate) name: String,
    pub(crate) access: Access,
    pub(crate) data: Box<dyn ErasedColumn>,
}

impl Column {
    pub fn key(&self) -> ComponentKey {
        self.key
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn slice<T: Component>(&self) -> Result<&[T], EcsError> {
        self.data
            .as_any()
            .downcast_ref::<TypedColumn<T>>()
            .map(|c| c.0.as_slice())
            .ok_or_else(|| EcsError::TypeMismatch {
                component: self.name.clone(),
            })
    }

    fn slice_mut<T: Component>(&mut self) -> Result<&mut [T], EcsError> {
        if self.access != Access::Write {
            return Err(EcsError::ReadOnlyBinding {
                component: self.name.clone(),
            });
        }
        let name = &self.name;
        self.data
            .as_any_mut()
            .downcast_mut::<TypedColumn<T>>()
            .map(|c| c.0.as_mut_slice())
            .ok_or_else(|| EcsError::TypeMismatch {
                component: name.clone(),
            })
    }

    fn duplicate(&self) -> Column {
        self.with_data(self.data.clone_box())
    }

    fn with_data(&self, data: Box<dyn ErasedColumn>) -> Column {
        Column {
            key: self.key,
            type_id: self.type_id,
            name: self.name.clone(),
            access: self.access,
            data,
        }
    }
}

impl fmt::Debug for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Column")
            .field("key", &self.key)
            .field("name", &self.name)
            .field("access", &self.access)
            .field("len", &self.data.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Pack
// ---------------------------------------------------------------------------

/// Materialized query result for one system invocation.
#[derive(Debug)]
pub struct Pack {
    pub(crate) entities: Vec<Entity>,
    pub(crate) columns: Vec<Column>,
    pub(crate) policy: PackPolicy,
}

impl Pack {
    pub(crate) fn new(entities: Vec<Entity>, columns: Vec<Column>, policy: PackPolicy) -> Self {
        Self {
            entities,
            columns,
            policy,
        }
    }

    /// Entities in pack order.
    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn policy(&self) -> PackPolicy {
        self.policy
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Whether no column is read-write.
    pub fn is_read_only(&self) -> bool {
        self.columns.iter().all(|c| c.access == Access::Read)
    }

    fn column(&self, type_id: TypeId, name: &str) -> Result<&Column, EcsError> {
        self.columns
            .iter()
            .find(|c| c.type_id == type_id)
            .ok_or_else(|| EcsError::UnboundComponent {
                component: name.to_owned(),
            })
    }

    /// Read-only slice of `T`, aligned with [`entities`](Self::entities).
    pub fn read<T: Component>(&self) -> Result<&[T], EcsError> {
        self.column(TypeId::of::<T>(), std::any::type_name::<T>())?
            .slice::<T>()
    }

    /// Mutable slice of `T`. The column must be bound with `write`.
    pub fn write<T: Component>(&mut self) -> Result<&mut [T], EcsError> {
        let type_id = TypeId::of::<T>();
        self.columns
            .iter_mut()
            .find(|c| c.type_id == type_id)
            .ok_or_else(|| EcsError::UnboundComponent {
                component: std::any::type_name::<T>().to_owned(),
            })?
            .slice_mut::<T>()
    }

    /// Borrow several columns at once, e.g. `(&mut Position, &Velocity)`.
    ///
    /// Each component may appear once; asking for the same column twice is
    /// an [`EcsError::AliasedAccess`].
    pub fn fetch<'p, Q: PackFetch<'p>>(&'p mut self) -> Result<Q::Output, EcsError> {
        Q::fetch(&mut self.columns)
    }

    /// Like [`fetch`](Self::fetch), also returning the entity list.
    pub fn fetch_with_entities<'p, Q: PackFetch<'p>>(
        &'p mut self,
    ) -> Result<(&'p [Entity], Q::Output), EcsError> {
        let output = Q::fetch(&mut self.columns)?;
        Ok((&self.entities, output))
    }

    /// Split into at most `chunks` contiguous, disjoint packs.
    ///
    /// Chunk sizes differ by at most one. An empty pack yields one empty chunk.
    pub fn split(mut self, chunks: usize) -> Vec<Pack> {
        let chunks = chunks.clamp(1, self.entities.len().max(1));
        let base = self.entities.len() / chunks;
        let extra = self.entities.len() % chunks;

        let mut tail = Vec::with_capacity(chunks);
        for i in (1..chunks).rev() {
            let start = i * base + i.min(extra);
            let entities = self.entities.split_off(start);
            let columns = self
                .columns
                .iter_mut()
                .map(|c| Column {
                    key: c.key,
                    type_id: c.type_id,
                    name: c.name.clone(),
                    access: c.access,
                    data: c.data.split_off(start),
                })
                .collect();
            tail.push(Pack::new(entities, columns, self.policy));
        }
        tail.push(self);
        tail.reverse();
        tail
    }

    /// A pack with the same columns and no entities.
    pub fn empty_like(&self) -> Pack {
        Pack {
            entities: Vec::new(),
            columns: self.columns.iter().map(|c| c.with_data(c.data.empty())).collect(),
            policy: self.policy,
        }
    }

    /// Deep copy, for handing a read-only full pack to several workers.
    pub fn duplicate(&self) -> Pack {
        Pack {
            entities: self.entities.clone(),
            columns: self.columns.iter().map(Column::duplicate).collect(),
            policy: self.policy,
        }
    }
}

// ---------------------------------------------------------------------------
// PackItem / PackFetch
// ---------------------------------------------------------------------------

/// One element of a [`Pack::fetch`] tuple: `&T` or `&mut T`.
pub trait PackItem<'p> {
    type Slice;
    fn type_id() -> TypeId;
    fn type_name() -> &'static str;
    fn borrow(column: &'p mut Column) -> Result<Self::Slice, EcsError>;
}

impl<'p, T: Component> PackItem<'p> for &T {
    type Slice = &'p [T];

    fn type_id() -> TypeId {
        TypeId::of::<T>()
    }

    fn type_name() -> &'static str {
        std::any::type_name::<T>()
    }

    fn borrow(column: &'p mut Column) -> Result<Self::Slice, EcsError> {
        let column: &'p Column = column;
        column.slice::<T>()
    }
}

impl<'p, T: Component> PackItem<'p> for &mut T {
    type Slice = &'p mut [T];

    fn type_id() -> TypeId {
        TypeId::of::<T>()
    }

    fn type_name() -> &'static str {
        std::any::type_name::<T>()
    }

    fn borrow(column: &'p mut Column) -> Result<Self::Slice, EcsError> {
        column.slice_mut::<T>()
    }
}

/// A tuple of [`PackItem`]s borrowed together.
pub trait PackFetch<'p> {
    type Output;
    fn fetch(columns: &'p mut [Column]) -> Result<Self::Output, EcsError>;
}

/// Hand out the column of `type_id` exactly once.
fn take<'p>(
    type_ids: &[TypeId],
    slots: &mut [Option<&'p mut Column>],
    type_id: TypeId,
    type_name: &str,
) -> Result<&'p mut Column, EcsError> {
    let index = type_ids
        .iter()
        .position(|&id| id == type_id)
        .ok_or_else(|| EcsError::UnboundComponent {
            component: type_name.to_owned(),
        })?;
    slots[index].take().ok_or_else(|| EcsError::AliasedAccess {
        component: type_name.to_owned(),
    })
}

macro_rules! impl_pack_fetch {
    ($($item:ident),+) => {
        impl<'p, $($item: PackItem<'p>),+> PackFetch<'p> for ($($item,)+) {
            type Output = ($($item::Slice,)+);

            fn fetch(columns: &'p mut [Column]) -> Result<Self::Output, EcsError> {
                let type_ids: Vec<TypeId> = columns.iter().map(|c| c.type_id).collect();
                let mut slots: Vec<Option<&'p mut Column>> = columns.iter_mut().map(Some).collect();
                Ok(($(
                    $item::borrow(take(&type_ids, &mut slots, $item::type_id(), $item::type_name())?)?,
                )+))
            }
        }
    };
}

impl_pack_fetch!(A);
impl_pack_fetch!(A, B);
impl_pack_fetch!(A, B, C);
impl_pack_fetch!(A, B, C, D);
impl_pack_fetch!(A, B, C, D, E);
impl_pack_fetch!(A, B, C, D, E, F);

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Pos(i32);
    #[derive(Debug, Clone, PartialEq)]
    struct Vel(i32);

    fn column<T: Component>(key: u32, access: Access, values: Vec<T>) -> Column {
        Column {
            key: ComponentKey(key),
            type_id: TypeId::of::<T>(),
            name: std::any::type_name::<T>().to_owned(),
            access,
            data: Box::new(TypedColumn(values)),
        }
    }

    fn sample_pack(n: i32) -> Pack {
        let entities = (1..=n as u32).map(Entity::from_raw).collect();
        Pack::new(
            entities,
            vec![
                column(0, Access::Write, (0..n).map(Pos).collect()),
                column(1, Access::Read, (0..n).map(|i| Vel(i * 10)).collect()),
            ],
            PackPolicy::Partial,
        )
    }

    #[test]
    fn fetch_disjoint_columns() {
        let mut pack = sample_pack(3);
        let (pos, vel) = pack.fetch::<(&mut Pos, &Vel)>().unwrap();
        for (p, v) in pos.iter_mut().zip(vel) {
            p.0 += v.0;
        }
        assert_eq!(pack.read::<Pos>().unwrap(), &[Pos(0), Pos(11), Pos(22)]);
    }

    #[test]
    fn fetch_same_column_twice_is_aliased() {
        let mut pack = sample_pack(1);
        let err = pack.fetch::<(&mut Pos, &Pos)>().unwrap_err();
        assert!(matches!(err, EcsError::AliasedAccess { .. }));
    }

    #[test]
    fn write_on_read_binding_rejected() {
        let mut pack = sample_pack(1);
        assert!(matches!(
            pack.write::<Vel>().unwrap_err(),
            EcsError::ReadOnlyBinding { .. }
        ));
        assert!(matches!(
            pack.fetch::<(&mut Vel,)>().unwrap_err(),
            EcsError::ReadOnlyBinding { .. }
        ));
    }

    #[test]
    fn unbound_component_rejected() {
        #[derive(Clone, Debug)]
        struct Other;
        let pack = sample_pack(1);
        assert!(matches!(
            pack.read::<Other>().unwrap_err(),
            EcsError::UnboundComponent { .. }
        ));
    }

    #[test]
    fn fetch_with_entities_aligned() {
        let mut pack = sample_pack(2);
        let (entities, (vel,)) = pack.fetch_with_entities::<(&Vel,)>().unwrap();
        assert_eq!(entities.len(), vel.len());
        assert_eq!(entities[1], Entity::from_raw(2));
        assert_eq!(vel[1], Vel(10));
    }

    #[test]
    fn split_is_disjoint_and_complete() {
        let pack = sample_pack(10);
        let chunks = pack.split(4);
        assert_eq!(chunks.len(), 4);
        let sizes: Vec<usize> = chunks.iter().map(Pack::len).collect();
        assert_eq!(sizes, vec![3, 3, 2, 2]);

        let mut seen = Vec::new();
        for chunk in &chunks {
            let pos = chunk.read::<Pos>().unwrap();
            assert_eq!(pos.len(), chunk.len());
            for (e, p) in chunk.entities().iter().zip(pos) {
                assert_eq!(e.to_raw() as i32 - 1, p.0);
                seen.push(*e);
            }
        }
        assert_eq!(seen, (1..=10).map(Entity::from_raw).collect::<Vec<_>>());
    }

    #[test]
    fn split_more_chunks_than_entities() {
        assert_eq!(sample_pack(2).split(8).len(), 2);
        let empty = sample_pack(0).split(4);
        assert_eq!(empty.len(), 1);
        assert!(empty[0].is_empty());
    }

    #[test]
    fn empty_like_keeps_shape() {
        let pack = sample_pack(3);
        let empty = pack.empty_like();
        assert!(empty.is_empty());
        assert_eq!(empty.columns().len(), pack.columns().len());
        assert!(empty.read::<Pos>().unwrap().is_empty());
    }

    #[test]
    fn duplicate_is_independent() {
        let mut pack = sample_pack(2);
        let copy = pack.duplicate();
        pack.write::<Pos>().unwrap()[0] = Pos(99);
        assert_eq!(copy.read::<Pos>().unwrap()[0], Pos(0));
    }

    #[test]
    fn scatter_writes_any_stage() {
        let mut store = StagedStorage::<Pos>::new(ComponentKey(0), "pos");
        let a = Entity::from_raw(1);
        let b = Entity::from_raw(2);
        store.insert(a, Pos(1)).unwrap();
        store.insert(b, Pos(2)).unwrap();
        store.remove(b);

        let column: Box<dyn ErasedColumn> = Box::new(TypedColumn(vec![Pos(10), Pos(20)]));
        column.scatter(&[a, b], &mut store).unwrap();
        assert_eq!(store.get(a), Some(&Pos(10)));
        assert_eq!(store.get_any_stage(b), Some(&Pos(20)));

        let short: Box<dyn ErasedColumn> = Box::new(TypedColumn(vec![Pos(0)]));
        assert!(matches!(
            short.scatter(&[a, b], &mut store).unwrap_err(),
            EcsError::LengthMismatch { .. }
        ));
    }
}
