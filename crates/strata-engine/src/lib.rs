//! Strata Engine -- system scheduler on top of [`strata_ecs`].
//!
//! This crate provides the simulation driver: a [`TickLoop`](tick::TickLoop)
//! that runs declared systems in order each tick, fans parallel systems out
//! over a worker pool, merges their command buffers and advances change
//! tracking. It also carries configuration loading and tracing setup.
//!
//! # Quick Start
//!
//! ```
//! use strata_engine::prelude::*;
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct Score(u32);
//!
//! let mut tick_loop = TickLoop::new(World::new(), TickConfig::default());
//! tick_loop
//!     .declare(System::builder("spawner").run(|info, _packs| {
//!         if info.tick() == 0 {
//!             info.commands().create_with(5, Score(0)).unwrap();
//!         }
//!     }))
//!     .unwrap();
//!
//! tick_loop.run_ticks(100).unwrap();
//! assert_eq!(tick_loop.tick_count(), 100);
//! assert_eq!(tick_loop.world().count::<Score>(), 5);
//! ```

#![deny(unsafe_code)]

pub mod config;
pub mod system;
pub mod tick;

use strata_ecs::EcsError;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

/// Re-export the ECS crate for convenience.
pub use strata_ecs;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by the scheduler.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// An ECS operation failed while declaring, running or merging.
    #[error(transparent)]
    Ecs(#[from] EcsError),

    /// A system with this name is already declared.
    #[error("duplicate system name: {name:?}")]
    DuplicateSystem { name: String },

    /// A parallel system asked for a read-write pack that cannot be split.
    #[error("parallel system {name:?} binds a read-write full pack")]
    ParallelFullWrite { name: String },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common engine usage.
pub mod prelude {
    // Re-export everything from the ECS prelude.
    pub use strata_ecs::prelude::*;

    // Engine-specific exports.
    pub use crate::config::{init_tracing, EngineConfig};
    pub use crate::system::{Info, System, SystemBuilder, SystemFn, SystemToken, Threading};
    pub use crate::tick::{TickConfig, TickDiagnostics, TickLoop};
    pub use crate::EngineError;
}
