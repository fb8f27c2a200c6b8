//! End-to-end thread squad tests: single task, fixed number of tasks,
//! no-deadlock repetition, varying concurrency, pinning, and the reduction
//! scenarios.

#![cfg(not(feature = "shuttle"))]

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use thread_squad::{Params, SquadError, ThreadSquad};

fn squad(num_threads: usize) -> ThreadSquad {
    ThreadSquad::new(Params {
        num_threads,
        ..Params::default()
    })
    .unwrap()
}

// -----------------------------------------------------------------------------
// Dispatch

#[test]
fn single_task_covers_every_thread_index() {
    for num_threads in [1, 2, 3, 4, 7, 8, 13] {
        let mut squad = squad(num_threads);
        let counts: Vec<AtomicUsize> = (0..num_threads).map(|_| AtomicUsize::new(0)).collect();

        squad.run(|ctx| {
            assert_eq!(ctx.num_threads(), num_threads);
            counts[ctx.thread_index()].fetch_add(1, Ordering::Relaxed);
        });

        for (index, count) in counts.iter().enumerate() {
            assert_eq!(
                count.load(Ordering::Relaxed),
                1,
                "num_threads = {num_threads}, index = {index}"
            );
        }
    }
}

#[test]
fn fixed_number_of_tasks() {
    for num_tasks in [0, 1, 2, 5, 10, 20] {
        let mut squad = squad(4);
        let counts: Vec<AtomicUsize> = (0..4).map(|_| AtomicUsize::new(0)).collect();

        for _ in 0..num_tasks {
            squad.run(|ctx| {
                counts[ctx.thread_index()].fetch_add(1, Ordering::Relaxed);
            });
        }

        for count in &counts {
            assert_eq!(count.load(Ordering::Relaxed), num_tasks);
        }
    }
}

#[test]
fn no_deadlocks_across_many_rounds() {
    let mut squad = squad(50);
    let counts: Vec<AtomicUsize> = (0..50).map(|_| AtomicUsize::new(0)).collect();

    for _ in 0..20 {
        squad.run(|ctx| {
            counts[ctx.thread_index()].fetch_add(1, Ordering::Relaxed);
        });
    }

    let total: usize = counts.iter().map(|c| c.load(Ordering::Relaxed)).sum();
    assert_eq!(total, 50 * 20);
}

#[test]
fn varying_concurrency() {
    let num_threads = 8;
    let mut squad = squad(num_threads);
    let count = AtomicUsize::new(0);

    for concurrency in 1..=num_threads {
        squad.run_on(concurrency, |ctx| {
            assert!(ctx.thread_index() < concurrency);
            assert_eq!(ctx.num_threads(), concurrency);
            count.fetch_add(1, Ordering::Relaxed);
        });
    }

    assert_eq!(
        count.load(Ordering::Relaxed),
        num_threads * (num_threads + 1) / 2
    );
}

#[test]
fn concurrency_zero_is_a_quiet_round() {
    let mut squad = squad(4);
    let count = AtomicUsize::new(0);

    squad.run_on(0, |_| {
        count.fetch_add(1, Ordering::Relaxed);
    });
    squad.run(|_| {
        count.fetch_add(1, Ordering::Relaxed);
    });

    assert_eq!(count.load(Ordering::Relaxed), 4);
}

#[test]
fn default_params_use_hardware_concurrency() {
    let reported = thread::available_parallelism().map(usize::from).unwrap_or(0);
    let mut squad = squad(0);
    assert_eq!(squad.num_threads(), reported);

    let count = AtomicUsize::new(0);
    squad.run(|_| {
        count.fetch_add(1, Ordering::Relaxed);
    });
    assert_eq!(count.load(Ordering::Relaxed), reported);
}

#[test]
fn spin_waiting_workers_complete_rounds() {
    let mut squad = ThreadSquad::new(Params {
        num_threads: 4,
        spin_wait: true,
        ..Params::default()
    })
    .unwrap();

    let count = AtomicUsize::new(0);
    for _ in 0..10 {
        squad.run(|_| {
            count.fetch_add(1, Ordering::Relaxed);
        });
    }
    assert_eq!(count.load(Ordering::Relaxed), 40);

    let sum = squad.transform_reduce(|ctx| ctx.thread_index(), 0, |a, b| a + b);
    assert_eq!(sum, 6);
}

#[test]
fn squad_dropped_right_after_construction() {
    for num_threads in [1, 4, 50] {
        let squad = squad(num_threads);
        drop(squad);
    }
}

// -----------------------------------------------------------------------------
// Reductions

#[test]
fn transform_reduce_of_thread_indices() {
    let mut squad = squad(4);
    let total = squad.transform_reduce(|ctx| ctx.thread_index() + 1, 0, |a, b| a + b);
    assert_eq!(total, 10);
}

#[test]
fn partitioned_sum() {
    const LAST: usize = 10_000;

    let mut squad = squad(8);
    for concurrency in 1..=8 {
        let total = squad.transform_reduce_on(
            concurrency,
            |ctx| {
                let partition = (LAST + 1).div_ceil(ctx.num_threads());
                let first = ctx.thread_index() * partition;
                let last = usize::min(first + partition, LAST + 1);
                (first..last).sum::<usize>()
            },
            0,
            |a, b| a + b,
        );
        assert_eq!(total, 50_005_000, "concurrency = {concurrency}");
    }
}

#[test]
fn in_task_reduce_agrees_on_every_thread() {
    const LAST: usize = 10_000;

    let mut squad = squad(8);
    for concurrency in 1..=8 {
        let all_correct = squad.transform_reduce_first_on(
            concurrency,
            |ctx| {
                let partition = (LAST + 1).div_ceil(ctx.num_threads());
                let first = ctx.thread_index() * partition;
                let last = usize::min(first + partition, LAST + 1);
                let partial: usize = (first..last).sum();

                let total = ctx.reduce(partial, |a, b| a + b);
                total == 50_005_000
            },
            |a, b| a && b,
        );
        assert!(all_correct, "concurrency = {concurrency}");
    }
}

#[test]
fn transform_reduce_first_picks_minimum() {
    let mut squad = squad(4);
    let min = squad.transform_reduce_first(|ctx| ctx.thread_index() + 5, usize::min);
    assert_eq!(min, 5);
}

// -----------------------------------------------------------------------------
// Pinning

#[test]
fn pinned_workers_are_distinct_threads() {
    let params = Params {
        num_threads: 10,
        pin_to_hardware_threads: true,
        ..Params::default()
    };
    let mut squad = match ThreadSquad::new(params) {
        Ok(squad) => squad,
        Err(SquadError::PinningNotSupported) => return,
    };

    let seen = Mutex::new(HashSet::new());
    squad.run(|_| {
        seen.lock().unwrap().insert(thread::current().id());
    });

    assert_eq!(seen.lock().unwrap().len(), 10);
}

// -----------------------------------------------------------------------------
// Consuming variants

#[test]
fn run_and_join_completes_and_destroys() {
    let squad = squad(4);
    let count = AtomicUsize::new(0);
    squad.run_and_join(|_| {
        count.fetch_add(1, Ordering::Relaxed);
    });
    assert_eq!(count.load(Ordering::Relaxed), 4);
}

#[test]
fn run_on_and_join_respects_concurrency() {
    let squad = squad(4);
    let count = AtomicUsize::new(0);
    squad.run_on_and_join(2, |_| {
        count.fetch_add(1, Ordering::Relaxed);
    });
    assert_eq!(count.load(Ordering::Relaxed), 2);
}

#[test]
fn transform_reduce_and_join_returns_the_total() {
    let squad = squad(4);
    let total = squad.transform_reduce_and_join(|ctx| ctx.thread_index() + 1, 0, |a, b| a + b);
    assert_eq!(total, 10);
}

#[test]
fn squad_reusable_after_warm_rounds_then_joins() {
    let mut squad = squad(6);
    let count = AtomicUsize::new(0);

    // Warm up a prefix of the workers only; the rest are forked by the
    // terminal round.
    squad.run_on(2, |_| {
        count.fetch_add(1, Ordering::Relaxed);
    });
    squad.run_on(4, |_| {
        count.fetch_add(1, Ordering::Relaxed);
    });
    drop(squad);

    assert_eq!(count.load(Ordering::Relaxed), 6);
}
