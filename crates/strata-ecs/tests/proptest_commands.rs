//! Property tests for command buffer recording and merging.
//!
//! Random sequences of buffered operations are recorded against a small
//! world and merged. The merged world and the merge report must agree with a
//! simple model of what the buffer asked for.

use proptest::prelude::*;
use strata_ecs::prelude::*;

#[derive(Debug, Clone, PartialEq)]
struct Hp(u32);

#[derive(Debug, Clone, PartialEq)]
struct Score(i64);

const INITIAL: usize = 6;

#[derive(Debug, Clone)]
enum CmdOp {
    AddScore(usize, i64),
    RemoveHp(usize),
    Destroy(usize),
    Spawn(i64),
}

fn cmd_op_strategy() -> impl Strategy<Value = CmdOp> {
    prop_oneof![
        3 => (0..INITIAL, any::<i64>()).prop_map(|(i, v)| CmdOp::AddScore(i, v)),
        2 => (0..INITIAL).prop_map(CmdOp::RemoveHp),
        1 => (0..INITIAL).prop_map(CmdOp::Destroy),
        2 => any::<i64>().prop_map(CmdOp::Spawn),
    ]
}

/// Six entities; the even ones carry `Hp`. Everything is settled.
fn setup_world_and_entities() -> (World, Vec<Entity>) {
    let mut world = World::new();
    let entities = world.create(INITIAL);
    let even: Vec<Entity> = entities.iter().copied().step_by(2).collect();
    world.add(&even, Hp(100)).unwrap();
    world.end_tick();
    world.begin_tick();
    (world, entities)
}

#[derive(Debug, Default, Clone)]
struct Expect {
    destroyed: bool,
    hp_removed: bool,
    score: Option<i64>,
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(2_000))]

    /// The merged world matches the model and the report counts match what
    /// actually changed.
    #[test]
    fn merge_matches_model(ops in prop::collection::vec(cmd_op_strategy(), 1..30)) {
        let (mut world, entities) = setup_world_and_entities();
        let mut buf = CommandBuffer::new();
        let mut model = vec![Expect::default(); INITIAL];
        let mut spawned: Vec<(Entity, i64)> = Vec::new();

        for op in &ops {
            match *op {
                CmdOp::AddScore(i, v) => {
                    let result = buf.add(&[entities[i]], Score(v));
                    if model[i].score.is_some() {
                        prop_assert!(matches!(result, Err(EcsError::DuplicateComponent { .. })), "expected DuplicateComponent, got {:?}", result);
                    } else {
                        prop_assert!(result.is_ok());
                        model[i].score = Some(v);
                    }
                }
                CmdOp::RemoveHp(i) => {
                    buf.remove::<Hp>(&[entities[i]]).unwrap();
                    model[i].hp_removed = true;
                }
                CmdOp::Destroy(i) => {
                    buf.destroy(&[entities[i]]).unwrap();
                    model[i].destroyed = true;
                    model[i].score = None;
                }
                CmdOp::Spawn(v) => {
                    let local = buf.create_with(1, Score(v)).unwrap()[0];
                    prop_assert!(buf.is_local(local));
                    spawned.push((local, v));
                }
            }
        }

        // Recording never touches the world.
        prop_assert_eq!(world.len(), INITIAL);
        prop_assert_eq!(world.count::<Score>(), 0);
        prop_assert!(world.modified().is_empty());

        let report = buf.apply(&mut world).unwrap();
        prop_assert!(buf.is_empty());

        let mut expected = MergeReport::default();
        for (i, (&e, m)) in entities.iter().zip(&model).enumerate() {
            let had_hp = i % 2 == 0;
            if m.hp_removed && had_hp {
                expected.removed += 1;
            }
            if m.destroyed {
                expected.destroyed += 1;
                prop_assert!(!world.is_valid(e));
                if m.score.is_some() {
                    expected.skipped += 1;
                }
                continue;
            }
            prop_assert!(world.is_valid(e));
            prop_assert_eq!(world.has::<Hp>(e), had_hp && !m.hp_removed);
            prop_assert_eq!(world.try_get::<Score>(e).cloned(), m.score.map(Score));
            if m.score.is_some() {
                expected.added += 1;
            }
        }
        expected.created = spawned.len();
        expected.added += spawned.len();

        // Destroys listed more than once count the repeats as skipped.
        let destroy_calls = ops.iter().filter(|op| matches!(op, CmdOp::Destroy(_))).count();
        expected.skipped += destroy_calls - expected.destroyed;

        prop_assert_eq!(report, expected);
        prop_assert_eq!(world.len(), INITIAL - expected.destroyed + spawned.len());

        let mut spawned_scores: Vec<i64> = spawned.iter().map(|&(_, v)| v).collect();
        let mut alive_scores: Vec<i64> = world
            .entities_of::<Score>()
            .iter()
            .filter(|e| !entities.contains(e))
            .map(|&e| world.get::<Score>(e).unwrap().0)
            .collect();
        spawned_scores.sort_unstable();
        alive_scores.sort_unstable();
        prop_assert_eq!(alive_scores, spawned_scores);
    }

    /// A merge that fails validation leaves both the world and the buffer
    /// untouched.
    #[test]
    fn failed_merge_is_all_or_nothing(
        spawns in 0..5usize,
        victim in 0..INITIAL,
        value in any::<u32>(),
    ) {
        let (mut world, entities) = setup_world_and_entities();
        let mut buf = CommandBuffer::new();
        buf.create_with(spawns, Score(1)).unwrap();
        buf.destroy(&[entities[victim]]).unwrap();
        // Entity 0 already has Hp.
        buf.add(&[entities[0]], Hp(value)).unwrap();

        let hp_before: Vec<Option<Hp>> = entities.iter().map(|&e| world.try_get::<Hp>(e).cloned()).collect();
        let result = buf.apply(&mut world);

        if victim == 0 {
            // The conflicting add is dropped along with its target.
            let report = result.unwrap();
            prop_assert_eq!(report.created, spawns);
            prop_assert_eq!(report.skipped, 1);
            prop_assert!(!world.is_valid(entities[0]));
        } else {
            prop_assert!(matches!(result, Err(EcsError::DuplicateComponent { .. })), "expected DuplicateComponent, got {:?}", result);
            prop_assert_eq!(world.len(), INITIAL);
            prop_assert!(world.is_valid(entities[victim]));
            prop_assert_eq!(world.count::<Score>(), 0);
            let hp_after: Vec<Option<Hp>> = entities.iter().map(|&e| world.try_get::<Hp>(e).cloned()).collect();
            prop_assert_eq!(hp_after, hp_before);
            prop_assert!(world.modified().is_empty());
            prop_assert!(!buf.is_empty());
        }
    }

    /// Merging an empty buffer changes nothing, however often it is done.
    #[test]
    fn empty_merge_is_noop(repeats in 1..5usize) {
        let (mut world, entities) = setup_world_and_entities();
        let mut buf = CommandBuffer::new();
        for _ in 0..repeats {
            let report = buf.apply(&mut world).unwrap();
            prop_assert!(report.is_empty());
        }
        prop_assert_eq!(world.len(), INITIAL);
        prop_assert!(world.modified().is_empty());
        prop_assert_eq!(world.all_entities(), entities);
    }
}
