//! Strata ECS -- sparse-set Entity Component System with staged storage.
//!
//! Entities are plain `u32` handles. Every component type gets its own dense
//! store partitioned into settled, added and removed regions, so a query can
//! ask not only "which entities have `Position`" but also "which entities
//! gained `Position` this tick" or "which lost it".
//!
//! Queries ([`Query`](filter::Query)) compile to a canonical
//! [`FilterGroup`](filter::FilterGroup). Equal groups share one cached result
//! which is refreshed incrementally at each tick boundary. A resolved query
//! is handed to user code as a [`Pack`](pack::Pack) of index-aligned columns.
//!
//! Structural changes made while systems run go through a
//! [`CommandBuffer`](command::CommandBuffer) and become visible when the
//! buffer is merged.
//!
//! # Quick Start
//!
//! ```
//! use strata_ecs::prelude::*;
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct Position { x: f32, y: f32 }
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct Velocity { dx: f32, dy: f32 }
//!
//! let mut world = World::new();
//! let movers = world.create_with(2, Position { x: 0.0, y: 0.0 }).unwrap();
//! world.add(&movers, Velocity { dx: 1.0, dy: 0.5 }).unwrap();
//!
//! let query = world
//!     .compile(&Query::new().write::<Position>().read::<Velocity>())
//!     .unwrap();
//! let mut pack = world.pack(&query).unwrap();
//! let (pos, vel) = pack.fetch::<(&mut Position, &Velocity)>().unwrap();
//! for (p, v) in pos.iter_mut().zip(vel) {
//!     p.x += v.dx;
//!     p.y += v.dy;
//! }
//! world.write_back(pack).unwrap();
//!
//! assert_eq!(world.get::<Position>(movers[1]).unwrap(), &Position { x: 1.0, y: 0.5 });
//! ```

#![deny(unsafe_code)]

pub mod command;
pub mod component;
pub mod entity;
pub mod filter;
pub mod pack;
pub mod resolve;
pub mod storage;
pub mod world;

use entity::Entity;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by ECS operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EcsError {
    /// The entity has no value for the component.
    #[error("entity {entity} has no component '{component}'")]
    MissingComponent { entity: Entity, component: String },

    /// A non-tag component was added to an entity that already has it.
    #[error("entity {entity} already has component '{component}' (use set to overwrite)")]
    DuplicateComponent { entity: Entity, component: String },

    /// The entity is not alive.
    #[error("entity {entity} is not alive")]
    InvalidEntity { entity: Entity },

    /// A display name was claimed by two component types, or a registered
    /// type was given a second name.
    #[error("component name '{name}' conflicts with an existing registration")]
    DuplicateName { name: String },

    /// A type-erased store or column did not hold the expected type.
    #[error("type mismatch for component '{component}'")]
    TypeMismatch { component: String },

    /// More than one `order_by` in a single query.
    #[error("a query may have at most one order_by, found {count}")]
    MultipleOrderBy { count: usize },

    /// A bound or conditioned component is also excluded.
    #[error("component '{component}' is both bound and excluded")]
    ConflictingBinding { component: String },

    /// The same column was bound or fetched twice.
    #[error("component '{component}' is bound more than once")]
    AliasedAccess { component: String },

    /// Mutable access to a read-only column.
    #[error("component '{component}' is bound read-only")]
    ReadOnlyBinding { component: String },

    /// The pack has no column for the component.
    #[error("component '{component}' is not bound in this pack")]
    UnboundComponent { component: String },

    /// A per-entity value list did not match the entity list.
    #[error("expected {expected} values, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    /// A local entity handle from another command buffer.
    #[error("local entity {entity} does not belong to this command buffer")]
    UnmappedLocalEntity { entity: Entity },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::command::{CommandBuffer, MergeReport};
    pub use crate::component::{Component, ComponentDescriptor, ComponentInfo, ComponentKey, ComponentRegistry};
    pub use crate::entity::{Entity, EntityAllocator};
    pub use crate::filter::{Access, CompiledQuery, ComponentSet, FilterGroup, FilterSets, PackPolicy, Query};
    pub use crate::pack::{Column, Pack, PackFetch};
    pub use crate::resolve::FilterCache;
    pub use crate::storage::{ComponentStore, StageRange, StagedStorage};
    pub use crate::world::{World, WorldConfig};
    pub use crate::EcsError;
}

// ---------------------------------------------------------------------------
// Integration Tests
// ---------------------------------------------------------------------------
