//! Entity handles and allocation.
//!
//! An [`Entity`] is a plain 32-bit handle. There is no generation counter:
//! validity is decided by the [`EntityAllocator`] alone, so a handle is valid
//! exactly while its slot is marked alive. The raw value `0` is reserved as
//! [`Entity::INVALID`] and is never issued.
//!
//! Destroyed handles are not recycled straight away. They are parked until
//! [`EntityAllocator::recycle_pending`] runs at the tick boundary, after every
//! component store has dropped the removed-stage data of those entities.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// Raw values at or above this are reserved for command-buffer local
/// handles. The allocator never issues them.
pub const LOCAL_BASE: u32 = 0x8000_0000;

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// An opaque, trivially copyable entity handle.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Entity(u32);

impl Entity {
    /// The reserved "no entity" value.
    pub const INVALID: Entity = Entity(0);

    /// Reconstruct a handle from its raw value.
    #[inline]
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw `u32` representation.
    #[inline]
    pub fn to_raw(self) -> u32 {
        self.0
    }

    /// The handle as a sparse-array index.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Whether this is the reserved [`Entity::INVALID`] value.
    #[inline]
    pub fn is_invalid(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({})", self.0)
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// EntityAllocator
// ---------------------------------------------------------------------------

/// Issues, invalidates and recycles [`Entity`] handles.
///
/// Handles are issued from a monotonic counter, except that recycled handles
/// are always handed out before the counter advances. No ordering of the
/// returned handles is promised, only that they are unique and unused.
#[derive(Debug)]
pub struct EntityAllocator {
    /// Liveness per raw value. Slot 0 is the reserved invalid handle.
    alive: Vec<bool>,
    /// Destroyed handles that may be issued again (FIFO).
    orphans: VecDeque<Entity>,
    /// Destroyed this tick; become orphans at the next tick boundary.
    pending: Vec<Entity>,
    alive_count: usize,
    /// Exclusive upper bound on issued raw values.
    limit: u32,
}

impl EntityAllocator {
    /// Create an empty allocator.
    pub fn new() -> Self {
        Self {
            alive: vec![false],
            orphans: VecDeque::new(),
            pending: Vec::new(),
            alive_count: 0,
            limit: LOCAL_BASE,
        }
    }

    /// Allocator that never issues a raw value at or above `limit`.
    pub(crate) fn with_limit(limit: u32) -> Self {
        Self {
            limit: limit.min(LOCAL_BASE),
            ..Self::new()
        }
    }

    /// Issue `count` currently unused handles, recycled ones first.
    ///
    /// # Panics
    ///
    /// Panics if the fresh handles needed would reach [`LOCAL_BASE`].
    pub fn create(&mut self, count: usize) -> Vec<Entity> {
        let recycled = count.min(self.orphans.len());
        let fresh = count - recycled;
        assert!(
            self.alive.len() + fresh <= self.limit as usize,
            "entity handle space exhausted: {} slots issued, {} more requested",
            self.alive.len(),
            fresh
        );

        let mut entities: Vec<Entity> = self.orphans.drain(..recycled).collect();
        for entity in &entities {
            self.alive[entity.index()] = true;
        }
        self.alive.reserve(fresh);
        for _ in 0..fresh {
            let entity = Entity(self.alive.len() as u32);
            self.alive.push(true);
            entities.push(entity);
        }
        self.alive_count += count;
        entities
    }

    /// Issue a single handle.
    pub fn create_one(&mut self) -> Entity {
        self.create(1)[0]
    }

    /// Invalidate the given handles.
    ///
    /// Returns the handles that were actually alive; everything else
    /// (already destroyed, never issued, [`Entity::INVALID`], repeated in the
    /// input) is ignored.
    pub fn destroy(&mut self, entities: &[Entity]) -> Vec<Entity> {
        let mut destroyed = Vec::with_capacity(entities.len());
        for &entity in entities {
            if !self.is_alive(entity) {
                continue;
            }
            self.alive[entity.index()] = false;
            self.pending.push(entity);
            destroyed.push(entity);
        }
        self.alive_count -= destroyed.len();
        destroyed
    }

    /// Whether `entity` is currently alive.
    #[inline]
    pub fn is_alive(&self, entity: Entity) -> bool {
        self.alive.get(entity.index()).copied().unwrap_or(false)
    }

    /// Number of alive entities.
    pub fn alive_count(&self) -> usize {
        self.alive_count
    }

    /// One past the highest raw value ever issued.
    pub fn capacity(&self) -> usize {
        self.alive.len()
    }

    /// Handles destroyed since the last [`recycle_pending`](Self::recycle_pending).
    pub fn pending(&self) -> &[Entity] {
        &self.pending
    }

    /// Move every pending handle into the recycle pool.
    ///
    /// Returns how many handles became reusable.
    pub fn recycle_pending(&mut self) -> usize {
        let count = self.pending.len();
        self.orphans.extend(self.pending.drain(..));
        count
    }

    /// All alive entities in ascending order.
    pub fn all_entities(&self) -> Vec<Entity> {
        self.alive
            .iter()
            .enumerate()
            .filter(|(_, &alive)| alive)
            .map(|(raw, _)| Entity(raw as u32))
            .collect()
    }

    /// Forget every handle, as if freshly constructed.
    pub fn clear(&mut self) {
        *self = Self::with_limit(self.limit);
    }
}

impl Default for EntityAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
