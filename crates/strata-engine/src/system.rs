//! System declarations and the per-invocation tick context.
//!
//! A system is a named closure plus the queries it wants resolved each tick.
//! Queries are described with the [`Query`] builder and compiled once, when
//! the system is declared on a [`TickLoop`](crate::tick::TickLoop).
//!
//! ```
//! use strata_engine::prelude::*;
//!
//! #[derive(Clone)]
//! struct Position(f32);
//! #[derive(Clone)]
//! struct Velocity(f32);
//!
//! let movement = System::builder("movement")
//!     .query(Query::new().write::<Position>().read::<Velocity>())
//!     .parallel()
//!     .run(|info, packs| {
//!         let dt = info.dt() as f32;
//!         if let Ok((pos, vel)) = packs[0].fetch::<(&mut Position, &Velocity)>() {
//!             for (p, v) in pos.iter_mut().zip(vel) {
//!                 p.0 += v.0 * dt;
//!             }
//!         }
//!     });
//! assert_eq!(movement.name(), "movement");
//! ```

use std::fmt;
use std::sync::Arc;

use strata_ecs::command::CommandBuffer;
use strata_ecs::filter::Query;
use strata_ecs::pack::Pack;
use strata_ecs::world::World;

// ---------------------------------------------------------------------------
// Threading
// ---------------------------------------------------------------------------

/// How a system's packs are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Threading {
    /// The whole pack runs on the calling thread.
    #[default]
    Sequential,
    /// Partial packs are split into disjoint ranges across the worker pool.
    Parallel,
}

// ---------------------------------------------------------------------------
// SystemToken
// ---------------------------------------------------------------------------

/// Handle returned by [`TickLoop::declare`](crate::tick::TickLoop::declare),
/// used to revoke the system later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SystemToken(pub(crate) u64);

impl fmt::Display for SystemToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "system#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Info
// ---------------------------------------------------------------------------

/// Context handed to a system invocation.
///
/// Each invocation (each worker, for a parallel system) gets its own command
/// buffer. Buffers are merged in declaration order once every system of the
/// tick has run.
pub struct Info<'w> {
    world: &'w World,
    commands: CommandBuffer,
    dt: f64,
    elapsed: f64,
    tick: u64,
    token: SystemToken,
    worker: usize,
    revoked: Vec<SystemToken>,
}

impl<'w> Info<'w> {
    pub(crate) fn new(world: &'w World, frame: Frame, token: SystemToken, worker: usize) -> Self {
        Self {
            world,
            commands: CommandBuffer::new(),
            dt: frame.dt,
            elapsed: frame.elapsed,
            tick: frame.tick,
            token,
            worker,
            revoked: Vec::new(),
        }
    }

    /// Read access to the world, for lookups outside the packs.
    pub fn world(&self) -> &World {
        self.world
    }

    /// This invocation's command buffer.
    pub fn commands(&mut self) -> &mut CommandBuffer {
        &mut self.commands
    }

    /// Delta time of the current tick, in seconds.
    pub fn dt(&self) -> f64 {
        self.dt
    }

    /// Sum of all deltas up to and including this tick.
    pub fn elapsed(&self) -> f64 {
        self.elapsed
    }

    /// Zero-based number of the current tick.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Token of the running system.
    pub fn token(&self) -> SystemToken {
        self.token
    }

    /// Index of the worker running this invocation (0 when sequential).
    pub fn worker(&self) -> usize {
        self.worker
    }

    /// Revoke a system. The scheduler is iterating, so the revocation is
    /// queued and applied once the current tick has finished.
    pub fn revoke(&mut self, token: SystemToken) {
        self.revoked.push(token);
    }

    pub(crate) fn into_parts(self) -> (CommandBuffer, Vec<SystemToken>) {
        (self.commands, self.revoked)
    }
}

/// Per-tick timing shared by every invocation of the tick.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Frame {
    pub(crate) dt: f64,
    pub(crate) elapsed: f64,
    pub(crate) tick: u64,
}

// ---------------------------------------------------------------------------
// System
// ---------------------------------------------------------------------------

/// The body of a system: tick context plus one pack per declared query, in
/// declaration order.
pub type SystemFn = dyn Fn(&mut Info<'_>, &mut [Pack]) + Send + Sync;

/// A fully described system, ready to be declared.
#[derive(Clone)]
pub struct System {
    pub(crate) name: String,
    pub(crate) threading: Threading,
    pub(crate) queries: Vec<Query>,
    pub(crate) seed_existing: bool,
    pub(crate) run: Arc<SystemFn>,
}

impl System {
    /// Start describing a system.
    pub fn builder(name: impl Into<String>) -> SystemBuilder {
        SystemBuilder {
            name: name.into(),
            threading: Threading::Sequential,
            queries: Vec::new(),
            seed_existing: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn threading(&self) -> Threading {
        self.threading
    }

    pub fn queries(&self) -> &[Query] {
        &self.queries
    }
}

impl fmt::Debug for System {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("System")
            .field("name", &self.name)
            .field("threading", &self.threading)
            .field("queries", &self.queries)
            .field("seed_existing", &self.seed_existing)
            .finish()
    }
}

/// Builder for [`System`].
#[derive(Debug, Clone)]
pub struct SystemBuilder {
    name: String,
    threading: Threading,
    queries: Vec<Query>,
    seed_existing: bool,
}

impl SystemBuilder {
    /// Add a query; the system receives one pack per query, in this order.
    pub fn query(mut self, query: Query) -> Self {
        self.queries.push(query);
        self
    }

    pub fn parallel(mut self) -> Self {
        self.threading = Threading::Parallel;
        self
    }

    pub fn sequential(mut self) -> Self {
        self.threading = Threading::Sequential;
        self
    }

    /// On the first run, treat `on_add` and `on_combine` as plain
    /// requirements so entities that existed before the declaration are seen.
    pub fn seed_with_existing(mut self) -> Self {
        self.seed_existing = true;
        self
    }

    /// Finish the description with the system body.
    pub fn run<F>(self, f: F) -> System
    where
        F: Fn(&mut Info<'_>, &mut [Pack]) + Send + Sync + 'static,
    {
        System {
            name: self.name,
            threading: self.threading,
            queries: self.queries,
            seed_existing: self.seed_existing,
            run: Arc::new(f),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
