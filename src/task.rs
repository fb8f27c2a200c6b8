//! The shared task descriptor and the type-erased action it carries.
//!
//! One `Task` value is published by the controller before each round and read
//! by every woken worker. The action inside it is a raw pointer to a
//! [`StackAction`] adaptor living on the controller's stack, paired with a
//! function that knows how to invoke it; no closed-world polymorphism and no
//! allocation per round.
//!
//! When handling an [`ActionRef`] one must be careful to ensure that the
//! adaptor it points to outlives the round: the controller guarantees this by
//! blocking until every participant has signaled completion.

use core::ptr::NonNull;

use crate::collective::TaskContext;

// -----------------------------------------------------------------------------
// Task descriptor

/// The record the controller publishes before signaling slot 0.
///
/// Single-writer (the controller), copied out once per worker per round after
/// the acquire load of the wake toggle.
#[derive(Clone, Copy)]
pub(crate) struct Task {
    /// The action to run, or `None` on the terminal round.
    pub(crate) action: Option<ActionRef>,
    /// How many workers participate; workers `>= concurrency` propagate the
    /// barrier without running the action.
    pub(crate) concurrency: usize,
    /// When set, every worker wakes regardless of `concurrency` and exits
    /// after this round.
    pub(crate) termination_requested: bool,
}

impl Task {
    pub(crate) fn idle() -> Task {
        Task {
            action: None,
            concurrency: 0,
            termination_requested: false,
        }
    }
}

// -----------------------------------------------------------------------------
// Type-erased action reference

/// Effectively an `&dyn Fn(TaskContext)` flattened into a data pointer and an
/// invoke function, so the descriptor stays `Copy` and lifetime-free.
#[derive(Clone, Copy)]
pub(crate) struct ActionRef {
    /// Points at the [`StackAction`] adaptor on the controller's stack.
    action_pointer: NonNull<()>,
    /// Invokes the adaptor behind `action_pointer`.
    invoke_fn: unsafe fn(NonNull<()>, TaskContext<'_>),
}

impl ActionRef {
    /// Creates a new `ActionRef` from raw parts.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `action_pointer` remains valid to pass to
    /// `invoke_fn`, from any thread, until the round that consumes this ref
    /// has completed.
    #[inline(always)]
    pub(crate) unsafe fn new_raw(
        action_pointer: NonNull<()>,
        invoke_fn: unsafe fn(NonNull<()>, TaskContext<'_>),
    ) -> ActionRef {
        ActionRef {
            action_pointer,
            invoke_fn,
        }
    }

    /// Invokes the action with the given context.
    #[inline(always)]
    pub(crate) fn invoke(self, ctx: TaskContext<'_>) {
        // SAFETY: The constructor of `ActionRef` is required to ensure the
        // pointer stays valid for the duration of the round, and rounds are
        // the only place refs are invoked.
        unsafe { (self.invoke_fn)(self.action_pointer, ctx) }
    }
}

// SAFETY: The pointee is a `StackAction` whose callable is `Sync`, so the
// erased pointer may be copied to and invoked from any worker thread.
unsafe impl Send for ActionRef {}
unsafe impl Sync for ActionRef {}

// -----------------------------------------------------------------------------
// Stack allocated action adaptor

/// Wraps the user's callable for the duration of one round. The adaptor lives
/// on the controller's stack; all participating workers invoke the callable
/// concurrently through a shared reference, which is why `F` must be `Sync`.
pub(crate) struct StackAction<F> {
    f: F,
}

impl<F> StackAction<F>
where
    F: Fn(TaskContext<'_>) + Sync,
{
    #[inline(always)]
    pub(crate) fn new(f: F) -> StackAction<F> {
        StackAction { f }
    }

    /// Creates an `ActionRef` pointing to this adaptor.
    ///
    /// # Safety
    ///
    /// The caller must keep the `StackAction` alive, and unmoved, until the
    /// round that consumes the returned ref has completed.
    #[inline(always)]
    pub(crate) unsafe fn as_action_ref(&self) -> ActionRef {
        let action_pointer = NonNull::from(self).cast();
        // SAFETY: The caller ensures the adaptor outlives the ref, so it
        // remains valid to convert the pointer back into a reference inside
        // `Self::invoke`.
        unsafe { ActionRef::new_raw(action_pointer, Self::invoke) }
    }

    /// Invokes a `StackAction` from an erased pointer.
    ///
    /// # Safety
    ///
    /// `this` must have been produced by `as_action_ref` on an adaptor that
    /// is still alive.
    #[inline(always)]
    unsafe fn invoke(this: NonNull<()>, ctx: TaskContext<'_>) {
        // SAFETY: `as_action_ref` guarantees `this` points at a live Self,
        // and `F: Sync` allows calling it from any thread.
        let this = unsafe { this.cast::<Self>().as_ref() };
        (this.f)(ctx);
    }
}
