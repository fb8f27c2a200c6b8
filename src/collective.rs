//! The per-task context handed to actions, and the in-task collectives.
//!
//! Collectives reuse the wake/join tree of the current round: the collect
//! phase moves per-thread payloads up the tree (each parent merging its
//! children in a fixed order), and the broadcast phase moves the final value
//! back down. Both phases ride on the same sense bits as the round itself:
//! a collective toggles each tree edge exactly once in each direction, so
//! the parity the round-completion waits expect is preserved.
//!
//! Within one task, collective calls must be made by *every* participating
//! thread, in the same order. The tree walk pairs operations positionally;
//! each slot publishes a sequence number and a payload type tag next to its
//! payload pointer, and a mismatch observed by the parent aborts the process
//! rather than corrupting memory.

use core::any::TypeId;
use core::cell::Cell;
use core::ptr;

use tracing::trace;

use crate::backoff;
use crate::platform::*;
use crate::squad::SquadCore;
use crate::tree;

// -----------------------------------------------------------------------------
// Payload rendezvous

/// What a slot publishes for its parent before signaling in a collective.
///
/// Written only by the owning worker; read by its tree parent after the
/// acquire load of the owner's collect signal.
#[derive(Clone, Copy)]
pub(crate) struct CollectivePost {
    /// Index of this collective within the current task.
    seq: usize,
    /// Type of the payload cell behind `payload`.
    tag: TypeId,
    /// Points into the synchronizer on the owning worker's stack. Kept alive
    /// for the whole collective by the tree barrier: the owner cannot leave
    /// the collective before its parent has both read and written through it.
    payload: *mut (),
}

impl CollectivePost {
    pub(crate) fn empty() -> CollectivePost {
        CollectivePost {
            seq: usize::MAX,
            tag: TypeId::of::<()>(),
            payload: ptr::null_mut(),
        }
    }
}

// -----------------------------------------------------------------------------
// Synchronizers

/// Capability interface of one collective, implemented over a payload cell on
/// the calling thread's stack. Peers access each other's payloads only
/// through the erased pointers exchanged via [`CollectivePost`].
trait Synchronizer {
    /// Tag identifying the payload type; must match across all peers of one
    /// collective call.
    fn tag(&self) -> TypeId;

    /// Pointer to this thread's payload cell.
    fn sync_data(&mut self) -> *mut ();

    /// Merges a child's payload into this thread's own.
    ///
    /// # Safety
    ///
    /// `src` must point at a live payload cell of the same synchronizer type,
    /// published for the same collective call.
    unsafe fn collect(&mut self, src: *mut ());

    /// Writes the final value into a child's payload.
    ///
    /// # Safety
    ///
    /// Same requirements as [`Synchronizer::collect`], and this thread's own
    /// payload must already hold the final value.
    unsafe fn broadcast(&mut self, dst: *mut ());

    /// Runs on slot 0 only, between the collect and broadcast phases.
    fn finish(&mut self) {}
}

/// Payload-free synchronizer backing [`TaskContext::synchronize`].
struct BarrierSync {
    payload: (),
}

impl Synchronizer for BarrierSync {
    fn tag(&self) -> TypeId {
        TypeId::of::<()>()
    }

    fn sync_data(&mut self) -> *mut () {
        &raw mut self.payload
    }

    unsafe fn collect(&mut self, _src: *mut ()) {}

    unsafe fn broadcast(&mut self, _dst: *mut ()) {}
}

/// Synchronizer backing [`TaskContext::reduce`]. The payload starts as this
/// thread's contribution, absorbs the children during collect, and ends up
/// holding the final value for every participant after broadcast.
struct ReduceSync<T, Op> {
    value: Option<T>,
    op: Op,
}

impl<T, Op> Synchronizer for ReduceSync<T, Op>
where
    T: Clone + Send + 'static,
    Op: Fn(T, T) -> T,
{
    fn tag(&self) -> TypeId {
        TypeId::of::<Option<T>>()
    }

    fn sync_data(&mut self) -> *mut () {
        (&raw mut self.value).cast()
    }

    unsafe fn collect(&mut self, src: *mut ()) {
        let src = src.cast::<Option<T>>();
        // SAFETY: The tag check upstream guarantees `src` is an `Option<T>`,
        // and the child that owns it is blocked until we signal it in the
        // broadcast phase, so we have exclusive access.
        let contributed = unsafe { (*src).take() }.expect("collective peer published no value");
        let merged = self.value.take().expect("collective payload missing");
        self.value = Some((self.op)(merged, contributed));
    }

    unsafe fn broadcast(&mut self, dst: *mut ()) {
        let dst = dst.cast::<Option<T>>();
        let result = self.value.clone();
        // SAFETY: As in `collect`: the cell is an `Option<T>` and its owner
        // is blocked waiting for the wake we issue after this write.
        unsafe { *dst = result };
    }
}

/// Payload of [`TransformSync`]: contributions travel up in `input`, the
/// transformed result travels down in `result`.
struct Exchange<T, R> {
    input: Option<T>,
    result: Option<R>,
}

/// Synchronizer backing [`TaskContext::reduce_transform`].
struct TransformSync<T, R, Op, Tf> {
    data: Exchange<T, R>,
    op: Op,
    transform: Option<Tf>,
}

impl<T, R, Op, Tf> Synchronizer for TransformSync<T, R, Op, Tf>
where
    T: Send + 'static,
    R: Clone + Send + 'static,
    Op: Fn(T, T) -> T,
    Tf: FnOnce(T) -> R,
{
    fn tag(&self) -> TypeId {
        TypeId::of::<Exchange<T, R>>()
    }

    fn sync_data(&mut self) -> *mut () {
        (&raw mut self.data).cast()
    }

    unsafe fn collect(&mut self, src: *mut ()) {
        let src = src.cast::<Exchange<T, R>>();
        // SAFETY: See `ReduceSync::collect`.
        let contributed = unsafe { (*src).input.take() }.expect("collective peer published no value");
        let merged = self.data.input.take().expect("collective payload missing");
        self.data.input = Some((self.op)(merged, contributed));
    }

    unsafe fn broadcast(&mut self, dst: *mut ()) {
        let dst = dst.cast::<Exchange<T, R>>();
        let result = self.data.result.clone();
        // SAFETY: See `ReduceSync::broadcast`.
        unsafe { (*dst).result = result };
    }

    fn finish(&mut self) {
        let reduced = self.data.input.take().expect("collective payload missing");
        let transform = self.transform.take().expect("transform already applied");
        self.data.result = Some(transform(reduced));
    }
}

// -----------------------------------------------------------------------------
// Task context

/// State passed to actions executed in a thread squad.
///
/// Besides identifying the calling worker, the context exposes the in-task
/// collectives. Collective calls must be made unconditionally by every
/// participating thread of the round and in the same order on each; a
/// detected divergence terminates the process, an undetected one (same types,
/// different call sites) yields unspecified values.
pub struct TaskContext<'squad> {
    core: &'squad SquadCore,
    thread_index: usize,
    concurrency: usize,
    collectives_issued: Cell<usize>,
}

impl<'squad> TaskContext<'squad> {
    pub(crate) fn new(
        core: &'squad SquadCore,
        thread_index: usize,
        concurrency: usize,
    ) -> TaskContext<'squad> {
        TaskContext {
            core,
            thread_index,
            concurrency,
            collectives_issued: Cell::new(0),
        }
    }

    /// The current thread index, in `[0, num_threads)`.
    #[inline]
    pub fn thread_index(&self) -> usize {
        self.thread_index
    }

    /// The number of threads participating in this round.
    #[inline]
    pub fn num_threads(&self) -> usize {
        self.concurrency
    }

    /// Blocks until every participating thread of this round has reached the
    /// matching `synchronize` call.
    ///
    /// Everything sequenced before the call on any participant is visible to
    /// everything sequenced after it on any participant.
    pub fn synchronize(&self) {
        let mut sync = BarrierSync { payload: () };
        self.run_collective(&mut sync);
    }

    /// Combines every participant's `value` with `op` and returns the result
    /// on *every* participant.
    ///
    /// `op` must be associative; the combination order is fixed by the tree
    /// shape (ascending thread index), not by scheduling, so the result is
    /// deterministic for a given squad size and concurrency.
    pub fn reduce<T, Op>(&self, value: T, op: Op) -> T
    where
        T: Clone + Send + 'static,
        Op: Fn(T, T) -> T,
    {
        let mut sync = ReduceSync {
            value: Some(value),
            op,
        };
        self.run_collective(&mut sync);
        sync.value.expect("reduction produced no value")
    }

    /// Like [`TaskContext::reduce`], but thread 0 applies `transform` to the
    /// reduced value before it is handed back to the participants. Exactly
    /// one `transform` call happens per collective, on thread 0.
    pub fn reduce_transform<T, R, Op, Tf>(&self, value: T, op: Op, transform: Tf) -> R
    where
        T: Send + 'static,
        R: Clone + Send + 'static,
        Op: Fn(T, T) -> T,
        Tf: FnOnce(T) -> R,
    {
        let mut sync = TransformSync {
            data: Exchange {
                input: Some(value),
                result: None,
            },
            op,
            transform: Some(transform),
        };
        self.run_collective(&mut sync);
        sync.data.result.expect("reduction produced no value")
    }

    // -------------------------------------------------------------------------
    // Collective mini-round

    /// Runs one collective over the active prefix, as a mini-round on the
    /// wake/join tree: publish payload, collect children bottom-up, signal
    /// the parent, wait for the broadcast wake, propagate downward.
    ///
    /// Slot 0 is the root of every collective: it never signals upward (the
    /// controller is not a participant and its wait on slot 0's completion
    /// sense must not be disturbed mid-task) and it initiates the broadcast.
    fn run_collective<S: Synchronizer>(&self, sync: &mut S) {
        let core = self.core;
        let index = self.thread_index;
        let seq = self.collectives_issued.get();
        self.collectives_issued.set(seq + 1);
        trace!(thread = index, seq, "entering collective");

        let slot = core.slot(index);
        let post = CollectivePost {
            seq,
            tag: sync.tag(),
            payload: sync.sync_data(),
        };
        // SAFETY: The post cell is written only by the owning worker; the
        // parent reads it after the acquire load of our collect signal below.
        unsafe { *slot.collective.get_mut().deref() = post };

        let stride = slot.num_subthreads;
        let last = usize::min(index + stride, self.concurrency);
        self.collect_subtree(index, last, stride, sync, seq);

        if index == 0 {
            sync.finish();
        } else {
            core.signal_completion(index);
            // Wait for the parent to hand down the final payload.
            let old = slot.sense.load(Ordering::Relaxed);
            backoff::atomic_wait_while_equal(&slot.new_sense, old, core.spin_wait());
        }

        self.broadcast_subtree(index, last, stride, sync);
        trace!(thread = index, seq, "leaving collective");
    }

    /// Waits for each direct child and merges its payload, deepest slice
    /// first, then the children of the current level in ascending order.
    /// This is the same order the round-completion walk uses, and it makes
    /// the merge sequence ascend by thread index.
    fn collect_subtree<S: Synchronizer>(
        &self,
        first: usize,
        last: usize,
        stride: usize,
        sync: &mut S,
        seq: usize,
    ) {
        let core = self.core;
        let substride = tree::next_substride(stride);
        if stride != 1 {
            self.collect_subtree(first, usize::min(first + substride, last), substride, sync, seq);
        }
        let mut child = first + substride;
        while child < last {
            let child_slot = core.slot(child);
            let old = 1 ^ child_slot.new_sense.load(Ordering::Relaxed);
            backoff::atomic_wait_while_equal(&child_slot.sense, old, core.spin_wait());
            // SAFETY: The child published its post before the collect signal
            // we just acquired, and it is now blocked until we wake it.
            let post = unsafe { *child_slot.collective.get_mut().deref() };
            assert!(
                post.seq == seq && post.tag == sync.tag(),
                "thread {child} diverged from thread {first} in collective {seq}"
            );
            // SAFETY: Tag verified above; the payload is live until the wake
            // we issue in the broadcast phase.
            unsafe { sync.collect(post.payload) };
            child += substride;
        }
    }

    /// Writes the final payload into each direct child and wakes it, one
    /// tree level at a time; the children recurse into their own subtrees.
    fn broadcast_subtree<S: Synchronizer>(
        &self,
        first: usize,
        mut last: usize,
        mut stride: usize,
        sync: &mut S,
    ) {
        let core = self.core;
        while stride != 1 {
            let substride = tree::next_substride(stride);
            let mut child = first + substride;
            while child < last {
                let child_slot = core.slot(child);
                // SAFETY: The child is still blocked on the wake below; its
                // post was verified during the collect phase.
                let post = unsafe { *child_slot.collective.get_mut().deref() };
                // SAFETY: Same cell the collect phase verified.
                unsafe { sync.broadcast(post.payload) };
                core.wake_thread(child);
                child += substride;
            }
            last = usize::min(first + substride, last);
            stride = substride;
        }
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(all(test, not(loom), not(feature = "shuttle")))]
mod tests {
    use alloc::string::String;
    use alloc::string::ToString;
    use alloc::vec::Vec;
    use core::sync::atomic::AtomicUsize;
    use core::sync::atomic::Ordering;

    use crate::Params;
    use crate::ThreadSquad;

    fn squad(num_threads: usize) -> ThreadSquad {
        ThreadSquad::new(Params {
            num_threads,
            ..Params::default()
        })
        .unwrap()
    }

    #[test]
    fn reduce_hands_the_sum_to_everyone() {
        let mut squad = squad(4);
        let results: Vec<AtomicUsize> = (0..4).map(|_| AtomicUsize::new(0)).collect();

        squad.run(|ctx| {
            let sum = ctx.reduce(ctx.thread_index() + 1, |a, b| a + b);
            results[ctx.thread_index()].store(sum, Ordering::Relaxed);
        });

        for result in &results {
            assert_eq!(result.load(Ordering::Relaxed), 10);
        }
    }

    #[test]
    fn reduce_combines_in_index_order() {
        // Concatenation is associative but not commutative, so this pins the
        // combination order down to ascending thread index.
        for num_threads in [1, 2, 5, 9, 13] {
            let mut squad = squad(num_threads);
            let expected: String = (0..num_threads).map(|i| i.to_string()).collect();
            let all_ordered = squad.transform_reduce_first(
                |ctx| {
                    let joined =
                        ctx.reduce(ctx.thread_index().to_string(), |a, b| a + &b);
                    joined == expected
                },
                |a, b| a && b,
            );
            assert!(all_ordered, "num_threads = {num_threads}");
        }
    }

    #[test]
    fn consecutive_reduces_are_independent() {
        let mut squad = squad(4);
        let ok = squad.transform_reduce_first(
            |ctx| {
                let first = ctx.reduce(1usize, |a, b| a + b);
                let second = ctx.reduce(10usize, |a, b| a + b);
                first == 4 && second == 40
            },
            |a, b| a && b,
        );
        assert!(ok);
    }

    #[test]
    fn synchronize_publishes_prior_writes() {
        let mut squad = squad(4);
        let written: Vec<AtomicUsize> = (0..4).map(|_| AtomicUsize::new(0)).collect();

        let all_visible = squad.transform_reduce_first(
            |ctx| {
                written[ctx.thread_index()].store(ctx.thread_index() + 1, Ordering::Relaxed);
                ctx.synchronize();
                written.iter().all(|w| w.load(Ordering::Relaxed) != 0)
            },
            |a, b| a && b,
        );
        assert!(all_visible);
    }

    #[test]
    fn reduce_transform_runs_transform_once() {
        let mut squad = squad(4);
        let transform_calls = AtomicUsize::new(0);
        let results: Vec<AtomicUsize> = (0..4).map(|_| AtomicUsize::new(0)).collect();

        squad.run(|ctx| {
            let doubled = ctx.reduce_transform(
                ctx.thread_index() + 1,
                |a, b| a + b,
                |sum| {
                    transform_calls.fetch_add(1, Ordering::Relaxed);
                    sum * 2
                },
            );
            results[ctx.thread_index()].store(doubled, Ordering::Relaxed);
        });

        assert_eq!(transform_calls.load(Ordering::Relaxed), 1);
        for result in &results {
            assert_eq!(result.load(Ordering::Relaxed), 20);
        }
    }

    #[test]
    fn reduce_on_a_prefix_covers_only_participants() {
        let mut squad = squad(4);
        let results: Vec<AtomicUsize> = (0..4).map(|_| AtomicUsize::new(0)).collect();

        squad.run_on(2, |ctx| {
            let sum = ctx.reduce(ctx.thread_index() + 1, |a, b| a + b);
            results[ctx.thread_index()].store(sum, Ordering::Relaxed);
        });

        assert_eq!(results[0].load(Ordering::Relaxed), 3);
        assert_eq!(results[1].load(Ordering::Relaxed), 3);
        assert_eq!(results[2].load(Ordering::Relaxed), 0);
        assert_eq!(results[3].load(Ordering::Relaxed), 0);
    }

    #[test]
    fn single_participant_collectives() {
        let mut squad = squad(3);
        let results: Vec<AtomicUsize> = (0..3).map(|_| AtomicUsize::new(0)).collect();

        squad.run_on(1, |ctx| {
            ctx.synchronize();
            let sum = ctx.reduce(7usize, |a, b| a + b);
            let tripled = ctx.reduce_transform(sum, |a, b| a + b, |v| v * 3);
            results[ctx.thread_index()].store(tripled, Ordering::Relaxed);
        });

        assert_eq!(results[0].load(Ordering::Relaxed), 21);
    }
}
