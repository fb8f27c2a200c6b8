//! Squad construction, the round controller, and the worker loop.
//!
//! A [`ThreadSquad`] owns one [`SquadCore`]: the slot array, the shared task
//! descriptor, and the tree-walk routines that move wake and completion
//! signals through it. The calling thread acts as the parent of slot 0:
//! it publishes a task, toggles slot 0's wake sense, and blocks until
//! slot 0's completion sense toggles back. Everything in between happens on
//! the workers, which wake and join their own subtrees.
//!
//! Workers are forked lazily: a slot's OS thread is created the first time a
//! wake is delivered to it. The terminal round (triggered by drop or one of
//! the `*_and_join` variants) wakes every slot, which forks any still-unforked
//! stragglers so that all of them can observe the termination request and be
//! joined, bottom-up, as the completion signals climb back to the controller.

use alloc::boxed::Box;
use alloc::format;
use alloc::vec::Vec;
use core::mem;
use core::mem::MaybeUninit;
use core::ptr::NonNull;

use crossbeam_utils::CachePadded;
use thiserror::Error;
use tracing::debug;
use tracing::trace;
use tracing::trace_span;

use crate::backoff;
use crate::collective::CollectivePost;
use crate::collective::TaskContext;
use crate::os;
use crate::platform::*;
use crate::task::ActionRef;
use crate::task::StackAction;
use crate::task::Task;
use crate::tree;
use crate::unwind;

// -----------------------------------------------------------------------------
// Parameters and errors

/// Thread squad parameters.
#[derive(Clone, Debug, Default)]
pub struct Params {
    /// How many threads to fork. A value of 0 indicates "as many as hardware
    /// threads are available".
    pub num_threads: usize,

    /// Whether workers are pinned to hardware threads, i.e. whether each
    /// worker has a core affinity. Helps maintain data locality.
    pub pin_to_hardware_threads: bool,

    /// Whether worker-side waits use spin waiting with exponential backoff.
    /// The controller's wait on slot 0 never spins.
    pub spin_wait: bool,

    /// Maximal number of distinct hardware threads to pin workers to. A value
    /// of 0 indicates "as many as possible"; if `hardware_thread_mappings` is
    /// non-empty its length is used instead. Lowering this runs several
    /// workers on the same hardware thread, which helps reproduce
    /// synchronization and data race bugs.
    pub max_num_hardware_threads: usize,

    /// Maps thread indices to hardware thread ids. If empty, thread indices
    /// are used as hardware thread ids directly.
    pub hardware_thread_mappings: Vec<usize>,
}

impl Params {
    /// Caller bugs are fatal, not recoverable errors.
    fn validate(&self) {
        assert!(
            self.num_threads == 0 || self.max_num_hardware_threads <= self.num_threads,
            "max_num_hardware_threads must not exceed num_threads"
        );
        if !self.hardware_thread_mappings.is_empty() {
            let len = self.hardware_thread_mappings.len();
            assert!(
                self.max_num_hardware_threads <= len,
                "hardware_thread_mappings must cover max_num_hardware_threads"
            );
            assert!(
                self.num_threads <= len,
                "hardware_thread_mappings must cover num_threads"
            );
        }
    }
}

/// Errors reported at squad construction.
#[derive(Debug, Error)]
pub enum SquadError {
    /// Pinning was requested but the host OS exposes no affinity control.
    #[error("pinning to hardware threads is not supported on this operating system")]
    PinningNotSupported,
}

// -----------------------------------------------------------------------------
// Per-worker slot

/// Synchronization record of one worker. Each slot is kept on its own cache
/// line by the `CachePadded` wrapper in the slot array.
pub(crate) struct Slot {
    /// Size of the wake/join subtree rooted at this slot. Nominal: the ragged
    /// tail slice keeps the full stride, and every walk clamps with
    /// `min(first + stride, limit)`.
    pub(crate) num_subthreads: usize,

    /// Toggled by this slot's tree parent to deliver a wake.
    pub(crate) new_sense: AtomicUsize,

    /// Toggled by this slot to signal that its subtree has completed.
    pub(crate) sense: AtomicUsize,

    /// Paired with both senses for the sleeping side of the backoff waiter.
    mutex: Mutex<()>,
    cv: Condvar,

    /// Present from first fork until terminal join. Touched only by this
    /// slot's tree parent (the controller, for slot 0).
    os_thread: UnsafeCell<Option<JoinHandle<()>>>,

    /// Hardware thread to pin to; applied by the worker at thread start.
    core_affinity: Option<usize>,

    /// Rendezvous cell for in-task collectives; written only by the owning
    /// worker, read by its tree parent.
    pub(crate) collective: UnsafeCell<CollectivePost>,
}

impl Slot {
    fn new(num_subthreads: usize, core_affinity: Option<usize>) -> Slot {
        Slot {
            num_subthreads,
            new_sense: AtomicUsize::new(0),
            sense: AtomicUsize::new(0),
            mutex: Mutex::new(()),
            cv: Condvar::new(),
            os_thread: UnsafeCell::new(None),
            core_affinity,
            collective: UnsafeCell::new(CollectivePost::empty()),
        }
    }
}

// -----------------------------------------------------------------------------
// Squad core

/// Monotonically increasing squad id, for debugging and worker thread names.
/// A plain `core` atomic even under model checking.
static SQUAD_COUNTER: core::sync::atomic::AtomicU32 = core::sync::atomic::AtomicU32::new(0);

/// The shared state of a squad: slot array, task descriptor, and the tree
/// walks over them. Workers hold a raw pointer to this for their entire
/// lifetime; see [`SquadCore::fork_thread`].
pub(crate) struct SquadCore {
    num_threads: usize,
    spin_wait: bool,
    squad_id: u32,
    slots: Box<[CachePadded<Slot>]>,
    /// Single-writer: the controller stores a descriptor before signaling
    /// slot 0 and does not touch it again until the round has completed.
    task: UnsafeCell<Task>,
}

// SAFETY: Every interior-mutable field follows a single-writer discipline
// synchronized by the sense toggles: the task descriptor is written by the
// controller before the wake release and read by workers after the acquire;
// each `os_thread` handle is touched only by the slot's tree parent; each
// `collective` cell is written only by its owning worker and read by its
// parent between the matching collect and broadcast signals.
unsafe impl Send for SquadCore {}
unsafe impl Sync for SquadCore {}

impl SquadCore {
    pub(crate) fn new(
        num_threads: usize,
        spin_wait: bool,
        affinities: Option<Vec<usize>>,
    ) -> SquadCore {
        let squad_id = SQUAD_COUNTER.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
        let sizes = tree::subtree_sizes(num_threads);
        let slots = (0..num_threads)
            .map(|i| {
                let affinity = affinities.as_ref().map(|ids| ids[i]);
                CachePadded::new(Slot::new(sizes[i], affinity))
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        debug!(squad = squad_id, num_threads, "created thread squad");

        SquadCore {
            num_threads,
            spin_wait,
            squad_id,
            slots,
            task: UnsafeCell::new(Task::idle()),
        }
    }

    #[inline]
    pub(crate) fn num_threads(&self) -> usize {
        self.num_threads
    }

    #[inline]
    pub(crate) fn spin_wait(&self) -> bool {
        self.spin_wait
    }

    #[inline]
    pub(crate) fn slot(&self, index: usize) -> &Slot {
        &self.slots[index]
    }

    /// Whether any OS thread is alive. Slot 0 is forked first and joined
    /// last, so its handle decides.
    fn is_running(&self) -> bool {
        if self.slots.is_empty() {
            return false;
        }
        // SAFETY: Only the slot's parent (the controller, here) inspects
        // the handle.
        unsafe { self.slot(0).os_thread.get_mut().deref().is_some() }
    }

    // -------------------------------------------------------------------------
    // Round controller

    /// Runs one round: publishes the task, signals slot 0, and blocks until
    /// slot 0 signals completion. With `join`, this is the terminal round:
    /// every worker wakes, exits after its final signal, and is joined.
    pub(crate) fn run_round(&self, action: Option<ActionRef>, concurrency: usize, join: bool) {
        debug_assert!(action.is_some() || join);
        debug_assert!(concurrency <= self.num_threads);

        if self.num_threads == 0 {
            return;
        }

        trace!(squad = self.squad_id, concurrency, join, "publishing task");
        // SAFETY: The controller is the descriptor's only writer, and no
        // worker reads it outside a round.
        unsafe {
            *self.task.get_mut().deref() = Task {
                action,
                concurrency,
                termination_requested: join,
            };
        }

        self.notify_thread(0);
        self.wait_for_thread(0, false, join);

        // Drop the borrow of the caller's action eagerly.
        //
        // SAFETY: The round has completed; the controller has exclusive
        // access again.
        unsafe { self.task.get_mut().deref().action = None };
        trace!(squad = self.squad_id, "round complete");
    }

    // -------------------------------------------------------------------------
    // Signals along tree edges

    /// Delivers a wake to `target`, forking its OS thread on first use.
    fn notify_thread(&self, target: usize) {
        trace!(thread = target, "notifying");
        self.wake_thread(target);

        // SAFETY: The handle is touched only by the slot's parent, which is
        // the thread running this.
        let running = unsafe { self.slot(target).os_thread.get_mut().deref().is_some() };
        if !running {
            self.fork_thread(target);
        }
    }

    /// Toggles `target`'s wake sense. Also used for the downward signals of
    /// in-task collectives, where the target is guaranteed to be running.
    pub(crate) fn wake_thread(&self, target: usize) {
        let slot = self.slot(target);
        backoff::toggle_and_notify(&slot.mutex, &slot.cv, &slot.new_sense);
    }

    /// Toggles `index`'s completion sense, waking its parent. Also used for
    /// the upward signals of in-task collectives.
    pub(crate) fn signal_completion(&self, index: usize) {
        let slot = self.slot(index);
        trace!(thread = index, "signaling");
        backoff::toggle_and_notify(&slot.mutex, &slot.cv, &slot.sense);
    }

    /// Waits until `target`'s completion sense has toggled. On a terminating
    /// round the OS-level join is consumed first: the thread exits right
    /// after its final signal, so joining subsumes the toggle.
    fn wait_for_thread(&self, target: usize, allow_spin: bool, terminating: bool) {
        if terminating {
            self.join_thread(target);
        }

        let slot = self.slot(target);
        let old = 1 ^ slot.new_sense.load(Ordering::Relaxed);
        backoff::wait_and_load(&slot.mutex, &slot.cv, &slot.sense, old, allow_spin);
        trace!(thread = target, "awaited");
    }

    /// Joins `target`'s OS thread if it was ever forked.
    fn join_thread(&self, target: usize) {
        // SAFETY: The handle is touched only by the slot's parent, which is
        // the thread running this.
        let handle = unsafe { self.slot(target).os_thread.get_mut().deref().take() };
        if let Some(handle) = handle {
            let _ = handle.join();
            trace!(thread = target, "joined");
        }
    }

    /// Forks the OS thread for `target` with its configured affinity.
    fn fork_thread(&self, target: usize) {
        debug!(squad = self.squad_id, thread = target, "forking worker");

        let ptr = CorePtr(NonNull::from(self));
        let handle = ThreadBuilder::new()
            .name(format!("squad{}.{}", self.squad_id, target))
            .spawn(move || {
                // Force capture of the whole `CorePtr` (not just its `.0`
                // field) so the closure relies on `CorePtr`'s `Send` impl.
                let ptr = ptr;
                // SAFETY: Every forked worker is joined before the core is
                // released (terminal round), so the pointer outlives the
                // thread.
                let core = unsafe { ptr.0.as_ref() };
                worker_main(core, target);
            })
            .expect("failed to fork thread squad worker");

        // SAFETY: Written once per squad lifetime, by the slot's parent.
        unsafe { *self.slot(target).os_thread.get_mut().deref() = Some(handle) };
    }

    // -------------------------------------------------------------------------
    // Subtree walks

    /// Wakes the direct children of `caller`'s subtree that lie below
    /// `limit`, one tree level at a time, widest stride first so the deeper
    /// subtree roots start propagating as early as possible.
    fn notify_subthreads(&self, caller: usize, limit: usize) {
        let mut stride = self.slot(caller).num_subthreads;
        let mut last = usize::min(caller + stride, limit);
        while stride != 1 {
            let substride = tree::next_substride(stride);
            let mut child = caller + substride;
            while child < last {
                self.notify_thread(child);
                child += substride;
            }
            last = usize::min(caller + substride, last);
            stride = substride;
        }
    }

    /// Waits for the direct children of `caller`'s subtree below `limit`,
    /// deepest slice first so that threads forked for the terminal round are
    /// joined bottom-up.
    fn wait_for_subthreads(&self, caller: usize, limit: usize, terminating: bool) {
        let stride = self.slot(caller).num_subthreads;
        let last = usize::min(caller + stride, limit);
        self.wait_for_subthreads_impl(caller, last, stride, terminating);
    }

    fn wait_for_subthreads_impl(&self, first: usize, last: usize, stride: usize, terminating: bool) {
        let substride = tree::next_substride(stride);
        if stride != 1 {
            self.wait_for_subthreads_impl(
                first,
                usize::min(first + substride, last),
                substride,
                terminating,
            );
        }
        if terminating {
            // Consume one level's OS threads before their final signals; the
            // per-child join in `wait_for_thread` then finds the handles gone.
            let mut child = first + substride;
            while child < last {
                self.join_thread(child);
                child += substride;
            }
        }
        let mut child = first + substride;
        while child < last {
            self.wait_for_thread(child, self.spin_wait, terminating);
            child += substride;
        }
    }

    // -------------------------------------------------------------------------
    // Worker side

    /// Blocks until the next wake and copies out the task descriptor.
    fn wait_for_task(&self, index: usize) -> Task {
        let slot = self.slot(index);
        let old = slot.sense.load(Ordering::Relaxed);
        backoff::wait_and_load(&slot.mutex, &slot.cv, &slot.new_sense, old, self.spin_wait);
        trace!(thread = index, "task received");
        // SAFETY: The wake was observed with acquire ordering, so the
        // controller's descriptor write is visible; the copy is taken before
        // this worker signals anything back.
        unsafe { *self.task.get_mut().deref() }
    }
}

/// Hands the core pointer to a freshly forked worker.
struct CorePtr(NonNull<SquadCore>);

// SAFETY: `SquadCore` is `Sync`, and the squad joins every worker before the
// core is released, so the pointee outlives every holder.
unsafe impl Send for CorePtr {}

/// The worker loop. Wake, propagate the wake down the subtree, run the
/// action when participating, wait for the subtree, signal the parent;
/// repeat until a task requests termination.
fn worker_main(core: &SquadCore, index: usize) {
    let span = trace_span!("worker", squad = core.squad_id, thread = index);
    let _entered = span.enter();

    if let Some(id) = core.slot(index).core_affinity {
        os::pin_current_thread(id);
    }
    trace!("worker started");

    let abort_guard = unwind::AbortOnDrop;
    loop {
        let task = core.wait_for_task(index);
        let limit = if task.termination_requested {
            core.num_threads
        } else {
            task.concurrency
        };

        core.notify_subthreads(index, limit);
        if let Some(action) = task.action {
            if index < task.concurrency {
                action.invoke(TaskContext::new(core, index, task.concurrency));
            }
        }
        core.wait_for_subthreads(index, limit, task.termination_requested);
        core.signal_completion(index);

        if task.termination_requested {
            break;
        }
    }
    mem::forget(abort_guard);

    trace!("worker exiting");
}

// -----------------------------------------------------------------------------
// Per-worker result cells

/// One worker's return value for the squad-level reductions. The worker
/// writes it during the round; the controller reads it afterwards, under the
/// happens-before established by the completion chain.
struct ResultCell<T> {
    value: UnsafeCell<MaybeUninit<T>>,
}

// SAFETY: Workers write disjoint cells, exactly once per round, and the
// controller reads them only after the round has completed.
unsafe impl<T: Send> Sync for ResultCell<T> {}

impl<T: Send> ResultCell<T> {
    fn empty() -> ResultCell<T> {
        ResultCell {
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Stores the worker's value.
    ///
    /// # Safety
    ///
    /// May be called at most once, by the worker the cell belongs to.
    unsafe fn put(&self, value: T) {
        // SAFETY: Exclusive access per the function contract.
        unsafe { self.value.get_mut().deref().write(value) };
    }

    /// Unwraps the cell into the stored value.
    ///
    /// # Safety
    ///
    /// The owning worker must have called `put`, and the round it happened in
    /// must have completed.
    unsafe fn take(self) -> T {
        // SAFETY: Initialized per the function contract; consuming `self`
        // makes duplication impossible.
        unsafe { self.value.get_mut().deref().assume_init_read() }
    }
}

// -----------------------------------------------------------------------------
// Public handle

/// A fixed-size squad of worker threads executing bulk-synchronous rounds.
///
/// Worker threads are forked lazily on the first round and joined when the
/// squad is dropped or consumed by one of the `*_and_join` methods. All
/// round-running methods take `&mut self`: the calling thread is the round's
/// controller, and there is exactly one controller at a time.
pub struct ThreadSquad {
    core: Box<SquadCore>,
}

impl ThreadSquad {
    /// Creates a squad from the given parameters.
    ///
    /// No OS threads are forked yet. Fails if pinning is requested on a host
    /// without affinity control; invalid parameter combinations panic.
    pub fn new(params: Params) -> Result<ThreadSquad, SquadError> {
        params.validate();

        let num_threads = if params.num_threads == 0 {
            os::hardware_concurrency()
        } else {
            params.num_threads
        };

        let affinities = if params.pin_to_hardware_threads {
            let core_ids = os::core_ids().ok_or(SquadError::PinningNotSupported)?;
            let hardware_threads = os::hardware_concurrency();
            let mut max_hardware_threads = params.max_num_hardware_threads;
            if max_hardware_threads == 0 {
                max_hardware_threads = if params.hardware_thread_mappings.is_empty() {
                    hardware_threads
                } else {
                    params.hardware_thread_mappings.len()
                };
            }
            let max_hardware_threads = max_hardware_threads.max(hardware_threads).max(1);

            let ids = (0..num_threads)
                .map(|i| {
                    let subindex = i % max_hardware_threads;
                    params
                        .hardware_thread_mappings
                        .get(subindex)
                        .copied()
                        .unwrap_or_else(|| core_ids[subindex % core_ids.len()])
                })
                .collect::<Vec<_>>();
            Some(ids)
        } else {
            None
        };

        Ok(ThreadSquad {
            core: Box::new(SquadCore::new(num_threads, params.spin_wait, affinities)),
        })
    }

    /// The number of threads in the squad.
    #[inline]
    pub fn num_threads(&self) -> usize {
        self.core.num_threads()
    }

    /// Runs `action` once on every thread of the squad and returns when all
    /// of them have completed it.
    ///
    /// The action is invoked concurrently through a shared reference, which
    /// is why it must be `Sync`. A panic in the action aborts the process.
    pub fn run<F>(&mut self, action: F)
    where
        F: Fn(TaskContext<'_>) + Sync,
    {
        let concurrency = self.num_threads();
        self.run_on(concurrency, action);
    }

    /// Runs `action` once on each of the first `concurrency` threads.
    ///
    /// `concurrency` must not exceed [`ThreadSquad::num_threads`]. A value of
    /// 0 still completes a (actionless) barrier round.
    pub fn run_on<F>(&mut self, concurrency: usize, action: F)
    where
        F: Fn(TaskContext<'_>) + Sync,
    {
        assert!(
            concurrency <= self.num_threads(),
            "concurrency exceeds squad size"
        );
        self.round(action, concurrency, false);
    }

    /// Like [`ThreadSquad::run`], but folds the termination request into the
    /// same round: the squad is joined and destroyed when this returns.
    pub fn run_and_join<F>(self, action: F)
    where
        F: Fn(TaskContext<'_>) + Sync,
    {
        let concurrency = self.num_threads();
        self.run_on_and_join(concurrency, action);
    }

    /// Like [`ThreadSquad::run_on`], but the squad is joined and destroyed
    /// when this returns.
    pub fn run_on_and_join<F>(self, concurrency: usize, action: F)
    where
        F: Fn(TaskContext<'_>) + Sync,
    {
        assert!(
            concurrency <= self.num_threads(),
            "concurrency exceeds squad size"
        );
        self.round(action, concurrency, true);
    }

    /// Runs `f` on every thread, then folds `init` and the per-thread values
    /// with `op` on the calling thread, in ascending thread order.
    pub fn transform_reduce<T, F, Op>(&mut self, f: F, init: T, op: Op) -> T
    where
        T: Send,
        F: Fn(TaskContext<'_>) -> T + Sync,
        Op: Fn(T, T) -> T,
    {
        let concurrency = self.num_threads();
        self.transform_reduce_on(concurrency, f, init, op)
    }

    /// Runs `f` on the first `concurrency` threads, then folds `init` and
    /// the per-thread values with `op` on the calling thread, in ascending
    /// thread order. With `concurrency == 0` no round runs and `init` is
    /// returned unchanged.
    pub fn transform_reduce_on<T, F, Op>(&mut self, concurrency: usize, f: F, init: T, op: Op) -> T
    where
        T: Send,
        F: Fn(TaskContext<'_>) -> T + Sync,
        Op: Fn(T, T) -> T,
    {
        assert!(
            concurrency <= self.num_threads(),
            "concurrency exceeds squad size"
        );
        if concurrency == 0 {
            return init;
        }

        let results = self.collect_results(concurrency, &f, false);
        results.into_iter().fold(init, |merged, cell| {
            // SAFETY: The round has completed and every participant stored
            // its value.
            op(merged, unsafe { cell.into_inner().take() })
        })
    }

    /// Like [`ThreadSquad::transform_reduce`], but the squad is joined and
    /// destroyed when this returns.
    pub fn transform_reduce_and_join<T, F, Op>(self, f: F, init: T, op: Op) -> T
    where
        T: Send,
        F: Fn(TaskContext<'_>) -> T + Sync,
        Op: Fn(T, T) -> T,
    {
        let concurrency = self.num_threads();
        if concurrency == 0 {
            return init;
        }

        let results = self.collect_results(concurrency, &f, true);
        results.into_iter().fold(init, |merged, cell| {
            // SAFETY: The round has completed and every participant stored
            // its value.
            op(merged, unsafe { cell.into_inner().take() })
        })
    }

    /// Like [`ThreadSquad::transform_reduce`], but the starting value is
    /// worker 0's result instead of a caller-provided `init`.
    pub fn transform_reduce_first<T, F, Op>(&mut self, f: F, op: Op) -> T
    where
        T: Send,
        F: Fn(TaskContext<'_>) -> T + Sync,
        Op: Fn(T, T) -> T,
    {
        let concurrency = self.num_threads();
        self.transform_reduce_first_on(concurrency, f, op)
    }

    /// Like [`ThreadSquad::transform_reduce_on`], but the starting value is
    /// worker 0's result. `concurrency` must be at least 1.
    pub fn transform_reduce_first_on<T, F, Op>(&mut self, concurrency: usize, f: F, op: Op) -> T
    where
        T: Send,
        F: Fn(TaskContext<'_>) -> T + Sync,
        Op: Fn(T, T) -> T,
    {
        assert!(
            concurrency >= 1,
            "transform_reduce_first requires at least one participating thread"
        );
        assert!(
            concurrency <= self.num_threads(),
            "concurrency exceeds squad size"
        );

        let results = self.collect_results(concurrency, &f, false);
        let mut cells = results.into_iter();
        let first = cells.next().expect("at least one participant");
        // SAFETY: The round has completed and every participant stored its
        // value.
        let first = unsafe { first.into_inner().take() };
        cells.fold(first, |merged, cell| {
            // SAFETY: As above.
            op(merged, unsafe { cell.into_inner().take() })
        })
    }

    // -------------------------------------------------------------------------
    // Round plumbing

    /// Runs one round with a stack-erased action.
    fn round<F>(&self, action: F, concurrency: usize, join: bool)
    where
        F: Fn(TaskContext<'_>) + Sync,
    {
        let adaptor = StackAction::new(action);
        // SAFETY: `run_round` blocks until every participant has signaled
        // completion, so the adaptor outlives every invocation of the ref.
        let action_ref = unsafe { adaptor.as_action_ref() };
        self.core.run_round(Some(action_ref), concurrency, join);
    }

    /// Runs `f` on the first `concurrency` workers and returns their results,
    /// one cache-padded cell per worker.
    fn collect_results<T, F>(
        &self,
        concurrency: usize,
        f: &F,
        join: bool,
    ) -> Vec<CachePadded<ResultCell<T>>>
    where
        T: Send,
        F: Fn(TaskContext<'_>) -> T + Sync,
    {
        let results: Vec<CachePadded<ResultCell<T>>> = (0..concurrency)
            .map(|_| CachePadded::new(ResultCell::empty()))
            .collect();

        self.round(
            |ctx: TaskContext<'_>| {
                let index = ctx.thread_index();
                let value = f(ctx);
                // SAFETY: Each participating worker writes its own cell,
                // exactly once per round.
                unsafe { results[index].put(value) };
            },
            concurrency,
            join,
        );

        results
    }
}

impl Drop for ThreadSquad {
    /// Publishes the terminal task and joins all forked threads. A squad
    /// whose threads were never forked has nothing to wake or join.
    fn drop(&mut self) {
        if self.core.is_running() {
            debug!(squad = self.core.squad_id, "joining thread squad");
            self.core.run_round(None, 0, true);
        }
    }
}

// -----------------------------------------------------------------------------
// Tests
