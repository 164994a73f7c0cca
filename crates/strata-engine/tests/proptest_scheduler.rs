//! Property tests for parallel system execution.
//!
//! Whatever the entity count and worker configuration, a parallel system
//! must see every entity exactly once per tick, and the buffers its workers
//! record must merge into the same world a sequential run would produce.

use proptest::prelude::*;
use strata_engine::prelude::*;

#[derive(Debug, Clone, PartialEq)]
struct Counter(u32);

#[derive(Debug, Clone, PartialEq)]
struct Seen;

#[derive(Debug, Clone, PartialEq)]
struct Team(u8);

fn build(count: usize, workers: usize, min_per_worker: usize, threading: Threading) -> TickLoop {
    let mut tl = TickLoop::new(
        World::new(),
        TickConfig {
            workers,
            min_entities_per_worker: min_per_worker,
            ..Default::default()
        },
    );
    let ids = tl.world_mut().create_with(count, Counter(0)).unwrap();
    tl.world_mut().add_with(&ids, |e| Team((e.to_raw() % 3) as u8)).unwrap();
    let builder = System::builder("visit")
        .query(Query::new().write::<Counter>())
        .query(Query::new().read::<Team>().full());
    let builder = match threading {
        Threading::Parallel => builder.parallel(),
        Threading::Sequential => builder.sequential(),
    };
    tl.declare(builder.run(move |info, packs| {
        assert_eq!(packs[1].len(), count);
        let (entities, (counters,)) = packs[0].fetch_with_entities::<(&mut Counter,)>().unwrap();
        let fresh: Vec<Entity> = entities
            .iter()
            .zip(counters.iter_mut())
            .filter_map(|(&e, c)| {
                c.0 += 1;
                (c.0 == 1).then_some(e)
            })
            .collect();
        info.commands().add(&fresh, Seen).unwrap();
    }))
    .unwrap();
    tl
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn every_entity_visited_once_per_tick(
        count in 0..600usize,
        workers in 1..6usize,
        min_per_worker in 1..64usize,
        ticks in 1..4u64,
    ) {
        let mut tl = build(count, workers, min_per_worker, Threading::Parallel);
        let first = tl.tick(1.0).unwrap();
        prop_assert_eq!(first.added, count);
        if ticks > 1 {
            tl.run_ticks(ticks - 1).unwrap();
        }

        let world = tl.world();
        prop_assert_eq!(world.count::<Seen>(), count);
        for &e in world.entities_of::<Counter>() {
            prop_assert_eq!(world.get::<Counter>(e).unwrap(), &Counter(ticks as u32));
        }
    }

    #[test]
    fn parallel_matches_sequential(
        count in 0..300usize,
        workers in 2..6usize,
        min_per_worker in 1..32usize,
    ) {
        let mut parallel = build(count, workers, min_per_worker, Threading::Parallel);
        let mut sequential = build(count, workers, min_per_worker, Threading::Sequential);
        parallel.run_ticks(2).unwrap();
        sequential.run_ticks(2).unwrap();

        let mut p = parallel.world().entities_of::<Seen>().to_vec();
        let mut s = sequential.world().entities_of::<Seen>().to_vec();
        p.sort_unstable();
        s.sort_unstable();
        prop_assert_eq!(p, s);
        prop_assert_eq!(parallel.world().view::<Counter>(), sequential.world().view::<Counter>());
    }
}
