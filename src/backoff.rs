//! Waiting on a sense toggle with exponential backoff.
//!
//! Every signal in the squad is a 1-bit sense stored in an atomic, paired
//! with a mutex and condition variable for the sleeping fallback. A waiter
//! first polls the atomic through a bounded spin → pause → yield escalation;
//! only if the toggle still has not arrived does it take the mutex and block
//! on the condvar. Short rounds therefore complete without a single syscall.
//!
//! Sense toggles are the *only* synchronization variables between a parent
//! and a child of the wake/join tree: any data published alongside a toggle
//! becomes visible through the release store in [`toggle_and_notify`] paired
//! with the acquire load at the end of the wait functions.

use crate::platform::*;

// -----------------------------------------------------------------------------
// Backoff tuning

/// Doublings of the innermost spin loop (`n = 1, 2, 4, ..., 2^SPIN_COUNT`).
#[cfg(not(loom))]
const SPIN_COUNT: u32 = 4;

/// Repetitions of each innermost spin loop before `n` doubles.
#[cfg(not(loom))]
const SPIN_REP: u32 = 2;

/// log2 of the number of pause-hint iterations.
#[cfg(all(not(loom), not(feature = "shuttle")))]
const PAUSE_COUNT: u32 = 9;

/// log2 of the number of yield iterations.
#[cfg(all(not(loom), not(feature = "shuttle")))]
const YIELD_COUNT: u32 = 6;

// Shuttle treats every atomic load as a scheduling decision, so the full poll
// counts would drag the model checker through thousands of no-op steps.
#[cfg(all(not(loom), feature = "shuttle"))]
const PAUSE_COUNT: u32 = 1;
#[cfg(all(not(loom), feature = "shuttle"))]
const YIELD_COUNT: u32 = 1;

// -----------------------------------------------------------------------------
// Bounded polling

/// Polls `a` until it differs from `old`, with three phases of escalation:
/// a geometric spin-pause phase, then a bounded yield phase. Returns `true`
/// as soon as a differing value is observed and `false` once both phases are
/// exhausted. Loads are relaxed; callers that need the usual publication
/// guarantee must re-load with acquire ordering afterwards.
///
/// `allow_spin` is false on the controller thread, which shortens the inner
/// spin loop to a single step so the controller does not burn a core while
/// the workers do the actual work.
#[cfg(not(loom))]
pub(crate) fn wait_while_equal(a: &AtomicUsize, old: usize, allow_spin: bool) -> bool {
    let spin_count = if allow_spin { SPIN_COUNT } else { 1 };
    if a.load(Ordering::Relaxed) != old {
        return true;
    }
    for _ in 0..(1u32 << PAUSE_COUNT) {
        let mut n = 1u32;
        for j in 0..spin_count {
            for _ in 0..SPIN_REP {
                for k in 0..n {
                    // Stands in for the dummy volatile read of a classic
                    // spin-wait body; keeps the loop from being optimized out.
                    core::hint::black_box(j + k);
                }
                if a.load(Ordering::Relaxed) != old {
                    return true;
                }
            }
            n *= 2;
        }
        core::hint::spin_loop();
    }
    for _ in 0..(1u32 << YIELD_COUNT) {
        if a.load(Ordering::Relaxed) != old {
            return true;
        }
        yield_now();
    }
    false
}

// Loom explores every relaxed load as a distinct execution, so polling loops
// blow up the state space without testing anything new. Check once and let
// the caller escalate.
#[cfg(loom)]
pub(crate) fn wait_while_equal(a: &AtomicUsize, old: usize, _allow_spin: bool) -> bool {
    a.load(Ordering::Relaxed) != old
}

// -----------------------------------------------------------------------------
// Waiting without a mutex

/// Waits until `a` differs from `old` without ever suspending: after the
/// bounded backoff phases it degrades to a cooperative yield loop. Returns
/// the new value, loaded with acquire ordering.
///
/// Used for the in-task collective signals, where the peer being waited on is
/// by construction actively executing the same task.
pub(crate) fn atomic_wait_while_equal(a: &AtomicUsize, old: usize, allow_spin: bool) -> usize {
    if !wait_while_equal(a, old, allow_spin) {
        while a.load(Ordering::Relaxed) == old {
            yield_now();
        }
    }
    a.load(Ordering::Acquire)
}

// -----------------------------------------------------------------------------
// Waiting with a mutex

/// Waits until `a` differs from `old`, suspending on `cv` once the backoff
/// phases are exhausted. Returns the new value, loaded with acquire ordering.
///
/// The condvar check re-loads `a` under the mutex: the signaler stores the
/// toggle while holding the same mutex, so the waiter cannot slip back to
/// sleep between its relaxed check and the `cv` wait.
pub(crate) fn wait_and_load(
    mutex: &Mutex<()>,
    cv: &Condvar,
    a: &AtomicUsize,
    old: usize,
    allow_spin: bool,
) -> usize {
    if !wait_while_equal(a, old, allow_spin) {
        let mut guard = mutex.lock().unwrap();
        while a.load(Ordering::Relaxed) == old {
            guard = cv.wait(guard).unwrap();
        }
    }
    a.load(Ordering::Acquire)
}

/// Toggles the sense stored in `a` and wakes its (single) waiter. Returns the
/// old value.
///
/// The release fence before the lock is deliberate: a waiter still in the
/// spin phase observes the toggle without ever acquiring the mutex, and must
/// still see everything the signaler published beforehand. The mutex's own
/// acquire/release does not cover that path.
pub(crate) fn toggle_and_notify(mutex: &Mutex<()>, cv: &Condvar, a: &AtomicUsize) -> usize {
    fence(Ordering::Release);

    let old = a.load(Ordering::Relaxed);
    {
        let _guard = mutex.lock().unwrap();
        a.store(1 ^ old, Ordering::Release);
    }
    cv.notify_one();
    old
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(all(test, not(loom), not(feature = "shuttle")))]
mod tests {
    use alloc::sync::Arc;
    use core::time::Duration;
    use std::thread;

    use super::*;

    #[test]
    fn wait_while_equal_observes_prior_change() {
        let a = AtomicUsize::new(1);
        assert!(wait_while_equal(&a, 0, true));
        assert!(wait_while_equal(&a, 0, false));
    }

    #[test]
    fn wait_while_equal_gives_up_eventually() {
        let a = AtomicUsize::new(0);
        assert!(!wait_while_equal(&a, 0, true));
        assert!(!wait_while_equal(&a, 0, false));
    }

    #[test]
    fn atomic_wait_returns_new_value() {
        let a = Arc::new(AtomicUsize::new(0));
        let signaler = {
            let a = Arc::clone(&a);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                a.store(1, Ordering::Release);
            })
        };
        assert_eq!(atomic_wait_while_equal(&a, 0, true), 1);
        signaler.join().unwrap();
    }

    #[test]
    fn wait_and_load_wakes_from_condvar() {
        struct Shared {
            mutex: Mutex<()>,
            cv: Condvar,
            a: AtomicUsize,
        }

        let shared = Arc::new(Shared {
            mutex: Mutex::new(()),
            cv: Condvar::new(),
            a: AtomicUsize::new(0),
        });

        let signaler = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                // Long enough that the waiter has exhausted its spin phases
                // and is asleep on the condvar.
                thread::sleep(Duration::from_millis(50));
                toggle_and_notify(&shared.mutex, &shared.cv, &shared.a);
            })
        };

        let new = wait_and_load(&shared.mutex, &shared.cv, &shared.a, 0, false);
        assert_eq!(new, 1);
        signaler.join().unwrap();
    }

    #[test]
    fn toggle_flips_and_returns_old() {
        let mutex = Mutex::new(());
        let cv = Condvar::new();
        let a = AtomicUsize::new(0);

        assert_eq!(toggle_and_notify(&mutex, &cv, &a), 0);
        assert_eq!(a.load(Ordering::Relaxed), 1);
        assert_eq!(toggle_and_notify(&mutex, &cv, &a), 1);
        assert_eq!(a.load(Ordering::Relaxed), 0);
    }
}
