//! The system scheduler.
//!
//! The [`TickLoop`] owns the [`World`] and the declared systems. Each call to
//! [`tick`](TickLoop::tick):
//!
//! 1. Refreshes every tracked filter from the entities modified since the
//!    previous tick.
//! 2. Runs every live system in declaration order. Each system gets one pack
//!    per query and a fresh command buffer; read-write columns are written
//!    back before the next system runs, so later systems see the values.
//! 3. Closes the tick on the world: added components settle, removed ones
//!    are dropped and destroyed handles become reusable.
//! 4. Merges the command buffers in the order they were produced. Their
//!    effects become the added and removed sets seen by the next tick.
//! 5. Applies revocations requested by systems during the tick.
//!
//! ```
//! use strata_engine::prelude::*;
//!
//! #[derive(Clone)]
//! struct Counter(u32);
//!
//! let mut world = World::new();
//! world.create_with(3, Counter(0)).unwrap();
//!
//! let mut tick_loop = TickLoop::new(world, TickConfig { workers: 2, ..Default::default() });
//! tick_loop
//!     .declare(
//!         System::builder("count")
//!             .query(Query::new().write::<Counter>())
//!             .run(|_info, packs| {
//!                 for c in packs[0].write::<Counter>().unwrap() {
//!                     c.0 += 1;
//!                 }
//!             }),
//!     )
//!     .unwrap();
//!
//! tick_loop.run_ticks(10).unwrap();
//! assert_eq!(tick_loop.tick_count(), 10);
//! assert!(tick_loop.world().view::<Counter>().iter().all(|c| c.0 == 10));
//! ```

use std::time::{Duration, Instant};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, debug_span, trace, warn};

use strata_ecs::command::{CommandBuffer, MergeReport};
use strata_ecs::component::ComponentKey;
use strata_ecs::filter::{Access, CompiledQuery, PackPolicy};
use strata_ecs::pack::Pack;
use strata_ecs::world::World;
use strata_ecs::EcsError;

use crate::system::{Frame, Info, System, SystemFn, SystemToken, Threading};
use crate::EngineError;

// ---------------------------------------------------------------------------
// TickConfig
// ---------------------------------------------------------------------------

/// Scheduler configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TickConfig {
    /// Seconds per tick for [`step`](TickLoop::step). Must be positive and finite.
    pub fixed_dt: f64,
    /// Size of the worker pool for parallel systems. Must be at least 1.
    pub workers: usize,
    /// A partial pack is split into at most `len / min_entities_per_worker`
    /// chunks.
    pub min_entities_per_worker: usize,
}

impl Default for TickConfig {
    /// 60 Hz, one worker per available core.
    fn default() -> Self {
        Self {
            fixed_dt: 1.0 / 60.0,
            workers: std::thread::available_parallelism().map_or(1, |n| n.get()),
            min_entities_per_worker: 1024,
        }
    }
}

// ---------------------------------------------------------------------------
// TickDiagnostics
// ---------------------------------------------------------------------------

/// Timing and merge statistics for the last tick.
#[derive(Debug, Clone, Default)]
pub struct TickDiagnostics {
    /// Wall-clock time per system (in order of execution).
    pub system_times: Vec<(String, Duration)>,
    /// Total time for the tick (systems + merge).
    pub total_time: Duration,
    /// Time spent merging command buffers.
    pub merge_time: Duration,
    /// Combined report of every buffer merged this tick.
    pub merge: MergeReport,
}

// ---------------------------------------------------------------------------
// DeclaredSystem
// ---------------------------------------------------------------------------

struct DeclaredSystem {
    token: SystemToken,
    name: String,
    threading: Threading,
    queries: Vec<CompiledQuery>,
    /// Resolve with `on_add`/`on_combine` relaxed on the next run.
    seed_existing: bool,
    run: std::sync::Arc<SystemFn>,
}

/// What one system invocation leaves behind.
struct Outcome {
    packs: Vec<Pack>,
    commands: CommandBuffer,
    revoked: Vec<SystemToken>,
}

// ---------------------------------------------------------------------------
// TickLoop
// ---------------------------------------------------------------------------

/// Runs declared systems against a [`World`], one tick at a time.
///
/// Systems never overlap in time: a parallel system fans out over the worker
/// pool and joins before the next system starts.
pub struct TickLoop {
    world: World,
    systems: Vec<DeclaredSystem>,
    next_token: u64,
    config: TickConfig,
    /// `None` when the dedicated pool could not be built; rayon's global
    /// pool is used instead.
    pool: Option<rayon::ThreadPool>,
    /// Set while systems are iterating.
    locked: bool,
    pending_revokes: Vec<SystemToken>,
    tick_counter: u64,
    elapsed: f64,
    last_diagnostics: TickDiagnostics,
}

impl TickLoop {
    /// Create a scheduler owning `world`.
    ///
    /// # Panics
    ///
    /// Panics if `fixed_dt` is not positive and finite, or if `workers` is 0.
    pub fn new(world: World, config: TickConfig) -> Self {
        assert!(
            config.fixed_dt > 0.0 && config.fixed_dt.is_finite(),
            "fixed_dt must be positive and finite, got {}",
            config.fixed_dt
        );
        assert!(config.workers >= 1, "workers must be at least 1");

        let pool = match rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers)
            .thread_name(|i| format!("strata-worker-{i}"))
            .build()
        {
            Ok(pool) => Some(pool),
            Err(err) => {
                warn!(error = %err, "worker pool unavailable, using the global pool");
                None
            }
        };

        Self {
            world,
            systems: Vec::new(),
            next_token: 0,
            config,
            pool,
            locked: false,
            pending_revokes: Vec::new(),
            tick_counter: 0,
            elapsed: 0.0,
            last_diagnostics: TickDiagnostics::default(),
        }
    }

    // -- declaration -------------------------------------------------------

    /// Declare a system. It runs after every system declared before it.
    ///
    /// Queries are compiled and their filter groups tracked here, so
    /// configuration errors surface before the system is ever scheduled.
    pub fn declare(&mut self, system: System) -> Result<SystemToken, EngineError> {
        if self.systems.iter().any(|s| s.name == system.name) {
            return Err(EngineError::DuplicateSystem { name: system.name });
        }

        let mut compiled = Vec::with_capacity(system.queries.len());
        for query in &system.queries {
            let query = self.world.compile(query)?;
            if system.threading == Threading::Parallel
                && query.policy() == PackPolicy::Full
                && !query.is_read_only()
            {
                return Err(EngineError::ParallelFullWrite { name: system.name });
            }
            compiled.push(query);
        }
        self.check_cross_pack_access(&compiled)?;
        for query in &mut compiled {
            self.world.track(query);
        }

        let token = SystemToken(self.next_token);
        self.next_token += 1;
        debug!(
            system = %system.name,
            token = %token,
            queries = compiled.len(),
            threading = ?system.threading,
            "system declared"
        );
        self.systems.push(DeclaredSystem {
            token,
            name: system.name,
            threading: system.threading,
            queries: compiled,
            seed_existing: system.seed_existing,
            run: system.run,
        });
        Ok(token)
    }

    /// Each pack holds its own copy of the values it binds, so a component
    /// bound by two packs of one system may only be read by both.
    fn check_cross_pack_access(&self, compiled: &[CompiledQuery]) -> Result<(), EngineError> {
        let mut seen: Vec<(ComponentKey, usize, Access)> = Vec::new();
        for (pack, query) in compiled.iter().enumerate() {
            for binding in query.bindings() {
                let clash = seen.iter().any(|&(key, other, access)| {
                    key == binding.key
                        && other != pack
                        && (access == Access::Write || binding.access == Access::Write)
                });
                if clash {
                    return Err(EcsError::AliasedAccess {
                        component: self.world.registry().name(binding.key).to_owned(),
                    }
                    .into());
                }
                seen.push((binding.key, pack, binding.access));
            }
        }
        Ok(())
    }

    /// Remove a system.
    ///
    /// While systems are iterating the revocation is queued and applied when
    /// the tick completes. Returns `false` for an unknown token.
    pub fn revoke(&mut self, token: SystemToken) -> bool {
        if self.locked {
            self.pending_revokes.push(token);
            return self.systems.iter().any(|s| s.token == token);
        }
        let Some(index) = self.systems.iter().position(|s| s.token == token) else {
            warn!(token = %token, "revoke of unknown system");
            return false;
        };
        let system = self.systems.remove(index);
        for query in &system.queries {
            self.world.untrack(query);
        }
        debug!(system = %system.name, token = %token, "system revoked");
        true
    }

    // -- ticking -----------------------------------------------------------

    /// Run one tick with the given delta time.
    ///
    /// A failing system or merge aborts the tick with the error. Buffers
    /// merged before the failing one stay applied; the failing buffer is not
    /// applied at all.
    pub fn tick(&mut self, dt: f64) -> Result<MergeReport, EngineError> {
        let span = debug_span!("tick", tick = self.tick_counter);
        let _enter = span.enter();
        let tick_start = Instant::now();

        self.elapsed += dt;
        let frame = Frame {
            dt,
            elapsed: self.elapsed,
            tick: self.tick_counter,
        };

        self.world.begin_tick();
        self.locked = true;
        let result = self.run_systems(frame);
        self.locked = false;
        let (buffers, system_times) = match result {
            Ok(done) => done,
            Err(err) => {
                self.apply_pending_revokes();
                return Err(err);
            }
        };

        self.world.end_tick();

        let merge_start = Instant::now();
        let merged = self.merge(buffers);
        let merge_time = merge_start.elapsed();

        self.apply_pending_revokes();
        self.tick_counter += 1;
        let merge = merged?;

        self.last_diagnostics = TickDiagnostics {
            system_times,
            total_time: tick_start.elapsed(),
            merge_time,
            merge,
        };
        Ok(merge)
    }

    /// Run one tick of `fixed_dt`.
    pub fn step(&mut self) -> Result<MergeReport, EngineError> {
        self.tick(self.config.fixed_dt)
    }

    /// Run `count` ticks of `fixed_dt`, returning the combined merge report.
    pub fn run_ticks(&mut self, count: u64) -> Result<MergeReport, EngineError> {
        let mut total = MergeReport::default();
        for _ in 0..count {
            total.absorb(self.step()?);
        }
        Ok(total)
    }

    // -- execution ---------------------------------------------------------

    fn run_systems(
        &mut self,
        frame: Frame,
    ) -> Result<(Vec<CommandBuffer>, Vec<(String, Duration)>), EngineError> {
        let mut buffers = Vec::new();
        let mut system_times = Vec::with_capacity(self.systems.len());

        for index in 0..self.systems.len() {
            let sys_start = Instant::now();
            let system = &self.systems[index];
            trace!(system = %system.name, "system running");

            let packs = system
                .queries
                .iter()
                .map(|q| {
                    let entities = self.world.resolve_for(q, system.seed_existing);
                    self.world.materialize(q, entities)
                })
                .collect::<Result<Vec<Pack>, _>>()?;

            let outcomes = match system.threading {
                Threading::Sequential => vec![run_one(&self.world, system, frame, 0, packs)],
                Threading::Parallel => self.run_parallel(system, frame, packs),
            };

            for outcome in outcomes {
                for pack in outcome.packs {
                    self.world.write_back(pack)?;
                }
                self.pending_revokes.extend(outcome.revoked);
                if !outcome.commands.is_empty() {
                    buffers.push(outcome.commands);
                }
            }

            let system = &mut self.systems[index];
            system.seed_existing = false;
            system_times.push((system.name.clone(), sys_start.elapsed()));
        }
        Ok((buffers, system_times))
    }

    /// Split partial packs across workers and run the body once per chunk.
    ///
    /// Read-only full packs are copied to every worker. Outcomes come back in
    /// worker order.
    fn run_parallel(&self, system: &DeclaredSystem, frame: Frame, packs: Vec<Pack>) -> Vec<Outcome> {
        let largest = packs
            .iter()
            .filter(|p| p.policy() == PackPolicy::Partial)
            .map(Pack::len)
            .max()
            .unwrap_or(0);
        let per_worker = self.config.min_entities_per_worker.max(1);
        let workers = (largest / per_worker).clamp(1, self.config.workers);
        if workers == 1 {
            return vec![run_one(&self.world, system, frame, 0, packs)];
        }

        // One column of chunks per pack, transposed into one row per worker.
        let mut per_worker_packs: Vec<Vec<Pack>> = (0..workers).map(|_| Vec::with_capacity(packs.len())).collect();
        for pack in packs {
            match pack.policy() {
                PackPolicy::Partial => {
                    let empty = pack.empty_like();
                    let mut chunks = pack.split(workers).into_iter();
                    for row in &mut per_worker_packs {
                        row.push(chunks.next().unwrap_or_else(|| empty.duplicate()));
                    }
                }
                PackPolicy::Full => {
                    for row in &mut per_worker_packs {
                        row.push(pack.duplicate());
                    }
                }
            }
        }

        let world = &self.world;
        let job = || {
            per_worker_packs
                .into_par_iter()
                .enumerate()
                .map(|(worker, packs)| run_one(world, system, frame, worker, packs))
                .collect::<Vec<Outcome>>()
        };
        match &self.pool {
            Some(pool) => pool.install(job),
            None => job(),
        }
    }

    /// Merge buffers in production order, stopping at the first failure.
    fn merge(&mut self, buffers: Vec<CommandBuffer>) -> Result<MergeReport, EngineError> {
        let mut merge = MergeReport::default();
        for mut buffer in buffers {
            merge.absorb(buffer.apply(&mut self.world)?);
        }
        debug!(
            created = merge.created,
            destroyed = merge.destroyed,
            added = merge.added,
            removed = merge.removed,
            "tick merged"
        );
        Ok(merge)
    }

    fn apply_pending_revokes(&mut self) {
        for token in std::mem::take(&mut self.pending_revokes) {
            self.revoke(token);
        }
    }

    // -- accessors ----------------------------------------------------------

    /// Number of completed ticks.
    pub fn tick_count(&self) -> u64 {
        self.tick_counter
    }

    /// Sum of the delta times of all ticks run so far.
    pub fn elapsed(&self) -> f64 {
        self.elapsed
    }

    pub fn config(&self) -> &TickConfig {
        &self.config
    }

    /// Read-only access to the ECS world.
    pub fn world(&self) -> &World {
        &self.world
    }

    /// Mutable access to the ECS world.
    ///
    /// For setup and tests. Structural changes made here show up in the
    /// next tick's event filters just like merged ones.
    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    /// Number of declared systems.
    pub fn system_count(&self) -> usize {
        self.systems.len()
    }

    /// Names of all declared systems, in execution order.
    pub fn system_names(&self) -> Vec<&str> {
        self.systems.iter().map(|s| s.name.as_str()).collect()
    }

    /// Whether `token` refers to a declared system.
    pub fn is_declared(&self, token: SystemToken) -> bool {
        self.systems.iter().any(|s| s.token == token)
    }

    /// Diagnostics from the last completed tick.
    pub fn last_diagnostics(&self) -> &TickDiagnostics {
        &self.last_diagnostics
    }

    /// Take the world back, dropping the systems.
    pub fn into_world(self) -> World {
        self.world
    }
}

fn run_one(world: &World, system: &DeclaredSystem, frame: Frame, worker: usize, mut packs: Vec<Pack>) -> Outcome {
    let mut info = Info::new(world, frame, system.token, worker);
    (system.run)(&mut info, &mut packs);
    let (commands, revoked) = info.into_parts();
    Outcome {
        packs,
        commands,
        revoked,
    }
}

impl std::fmt::Debug for TickLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickLoop")
            .field("systems", &self.system_names())
            .field("tick", &self.tick_counter)
            .field("elapsed", &self.elapsed)
            .field("config", &self.config)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
