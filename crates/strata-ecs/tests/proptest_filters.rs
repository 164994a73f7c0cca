//! Property tests for filter resolution.
//!
//! Random sequences of structural changes and tick boundaries are applied to
//! a world and to a naive per-entity model. After every step each query must
//! resolve to exactly the entities the model predicts, both when resolved
//! from scratch and when served from the filter cache.

use std::collections::BTreeMap;

use proptest::prelude::*;
use strata_ecs::prelude::*;

#[derive(Debug, Clone, PartialEq)]
struct A(u32);

#[derive(Debug, Clone, PartialEq)]
struct B(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Settled,
    Added,
    Removed,
}

#[derive(Debug, Clone, Copy)]
enum Kind {
    A,
    B,
}

#[derive(Debug, Clone)]
enum Op {
    Create(usize),
    Destroy(usize),
    Add(usize, Kind, u32),
    Remove(usize, Kind),
    EndTick,
    BeginTick,
}

fn kind_strategy() -> impl Strategy<Value = Kind> {
    prop_oneof![Just(Kind::A), Just(Kind::B)]
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        1 => (1..4usize).prop_map(Op::Create),
        1 => (0..32usize).prop_map(Op::Destroy),
        3 => (0..32usize, kind_strategy(), any::<u32>()).prop_map(|(i, k, v)| Op::Add(i, k, v)),
        2 => (0..32usize, kind_strategy()).prop_map(|(i, k)| Op::Remove(i, k)),
        1 => Just(Op::EndTick),
        1 => Just(Op::BeginTick),
    ]
}

// ---------------------------------------------------------------------------
// Naive model
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone)]
struct Record {
    alive: bool,
    a: Option<Stage>,
    b: Option<Stage>,
}

impl Record {
    fn slot(&mut self, kind: Kind) -> &mut Option<Stage> {
        match kind {
            Kind::A => &mut self.a,
            Kind::B => &mut self.b,
        }
    }
}

fn has(stage: Option<Stage>) -> bool {
    matches!(stage, Some(Stage::Settled | Stage::Added))
}

fn added(stage: Option<Stage>) -> bool {
    stage == Some(Stage::Added)
}

fn removed(stage: Option<Stage>) -> bool {
    stage == Some(Stage::Removed)
}

struct ModelQuery {
    name: &'static str,
    query: Query,
    /// Only alive entities can match (no positive component constraint).
    alive_only: bool,
    predicate: fn(&Record) -> bool,
}

fn model_queries() -> Vec<ModelQuery> {
    vec![
        ModelQuery {
            name: "all",
            query: Query::new(),
            alive_only: true,
            predicate: |_| true,
        },
        ModelQuery {
            name: "read A",
            query: Query::new().read::<A>(),
            alive_only: false,
            predicate: |r| has(r.a),
        },
        ModelQuery {
            name: "read A except B",
            query: Query::new().read::<A>().except::<B>(),
            alive_only: false,
            predicate: |r| has(r.a) && !has(r.b),
        },
        ModelQuery {
            name: "except B",
            query: Query::new().except::<B>(),
            alive_only: true,
            predicate: |r| !has(r.b),
        },
        ModelQuery {
            name: "on_add A",
            query: Query::new().on_add::<A>(),
            alive_only: false,
            predicate: |r| added(r.a),
        },
        ModelQuery {
            name: "on_remove A",
            query: Query::new().on_remove::<A>(),
            alive_only: false,
            predicate: |r| removed(r.a),
        },
        ModelQuery {
            name: "on_add A with B",
            query: Query::new().on_add::<A>().read::<B>(),
            alive_only: false,
            predicate: |r| added(r.a) && has(r.b),
        },
        ModelQuery {
            name: "on_combine A B",
            query: Query::new().on_combine::<(A, B)>(),
            alive_only: false,
            predicate: |r| (added(r.a) || added(r.b)) && has(r.a) && has(r.b),
        },
        ModelQuery {
            name: "on_break A B",
            query: Query::new().on_break::<(A, B)>(),
            alive_only: false,
            predicate: |r| (removed(r.a) || removed(r.b)) && r.a.is_some() && r.b.is_some(),
        },
    ]
}

fn expected(model: &BTreeMap<Entity, Record>, q: &ModelQuery) -> Vec<Entity> {
    model
        .iter()
        .filter(|(_, r)| (r.alive || !q.alive_only) && (q.predicate)(r))
        .map(|(&e, _)| e)
        .collect()
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

fn pick(model: &BTreeMap<Entity, Record>, index: usize) -> Option<Entity> {
    let alive: Vec<Entity> = model
        .iter()
        .filter(|(_, r)| r.alive)
        .map(|(&e, _)| e)
        .collect();
    if alive.is_empty() {
        None
    } else {
        Some(alive[index % alive.len()])
    }
}

fn apply(world: &mut World, model: &mut BTreeMap<Entity, Record>, op: &Op) {
    match *op {
        Op::Create(count) => {
            for e in world.create(count) {
                let record = model.entry(e).or_default();
                assert!(record.a.is_none() && record.b.is_none(), "recycled {e} still has data");
                record.alive = true;
            }
        }
        Op::Destroy(index) => {
            if let Some(e) = pick(model, index) {
                assert_eq!(world.destroy(&[e]), 1);
                let record = model.entry(e).or_default();
                record.alive = false;
                for kind in [Kind::A, Kind::B] {
                    let slot = record.slot(kind);
                    if has(*slot) {
                        *slot = Some(Stage::Removed);
                    }
                }
            }
        }
        Op::Add(index, kind, value) => {
            if let Some(e) = pick(model, index) {
                let result = match kind {
                    Kind::A => world.add(&[e], A(value)),
                    Kind::B => world.add(&[e], B(value)),
                };
                let slot = model.entry(e).or_default().slot(kind);
                if has(*slot) {
                    assert!(matches!(result, Err(EcsError::DuplicateComponent { .. })));
                } else {
                    assert!(result.is_ok());
                    *slot = Some(Stage::Added);
                }
            }
        }
        Op::Remove(index, kind) => {
            if let Some(e) = pick(model, index) {
                let count = match kind {
                    Kind::A => world.remove::<A>(&[e]),
                    Kind::B => world.remove::<B>(&[e]),
                };
                let slot = model.entry(e).or_default().slot(kind);
                if has(*slot) {
                    assert_eq!(count, 1);
                    *slot = Some(Stage::Removed);
                } else {
                    assert_eq!(count, 0);
                }
            }
        }
        Op::EndTick => {
            world.end_tick();
            for record in model.values_mut() {
                for kind in [Kind::A, Kind::B] {
                    let slot = record.slot(kind);
                    *slot = match *slot {
                        Some(Stage::Added) | Some(Stage::Settled) => Some(Stage::Settled),
                        Some(Stage::Removed) | None => None,
                    };
                }
            }
        }
        Op::BeginTick => world.begin_tick(),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    /// Fresh resolution and cached resolution agree with the model after
    /// every step.
    #[test]
    fn filters_match_naive_model(ops in prop::collection::vec(op_strategy(), 1..60)) {
        let mut world = World::new();
        let mut model: BTreeMap<Entity, Record> = BTreeMap::new();
        let queries = model_queries();

        let mut tracked: Vec<CompiledQuery> = Vec::new();
        for q in &queries {
            let mut compiled = world.compile(&q.query).unwrap();
            world.track(&mut compiled);
            tracked.push(compiled);
        }

        for op in &ops {
            apply(&mut world, &mut model, op);
            for (q, compiled) in queries.iter().zip(&tracked) {
                let want = expected(&model, q);
                let fresh = world.entities_matching(&q.query).unwrap();
                prop_assert_eq!(&fresh, &want, "fresh {} after {:?}", q.name, op);
                let cached = world.filter(compiled);
                prop_assert_eq!(&cached, &want, "cached {} after {:?}", q.name, op);
            }
        }
    }

    /// Values written with `add` are read back unchanged, including through
    /// the removed stage until the next boundary.
    #[test]
    fn removed_values_stay_readable_until_boundary(values in prop::collection::vec(any::<u32>(), 1..40)) {
        let mut world = World::new();
        let ids = world.create(values.len());
        world.add_each(&ids, values.iter().copied().map(A).collect()).unwrap();
        world.end_tick();

        let half = ids.len() / 2;
        world.remove::<A>(&ids[..half]);
        for (e, v) in ids.iter().zip(&values) {
            prop_assert_eq!(world.get_any_stage::<A>(*e), Some(&A(*v)));
        }
        world.end_tick();
        for e in &ids[..half] {
            prop_assert!(world.get_any_stage::<A>(*e).is_none());
        }
        for (e, v) in ids[half..].iter().zip(&values[half..]) {
            prop_assert_eq!(world.get::<A>(*e).unwrap(), &A(*v));
        }
    }
}
