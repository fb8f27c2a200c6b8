//! A fixed-size **thread squad** for bulk-synchronous parallelism.
//!
//! A squad owns a fixed set of worker threads and repeatedly dispatches
//! fork-join *rounds* to them: every round publishes one task, wakes a prefix
//! of the workers through a tree-structured barrier, runs the caller's action
//! once per participating thread, and returns to the caller only when every
//! participant has signaled completion back up the tree. There is no work
//! stealing and no queueing; the squad is built for the "same action on all
//! threads, many times in a row" shape, where the thing that matters is the
//! latency of waking and joining the whole group.
//!
//! Wake and join signals travel along a static tree with branching factor 8,
//! using one cache-line-aligned slot per worker. Each signal is a 1-bit sense
//! toggle paired with a per-slot mutex and condition variable; waiters go
//! through an exponential-backoff spin/pause/yield prelude before touching
//! the mutex, so short rounds complete without any syscalls.
//!
//! Worker threads are forked lazily on the first round and joined when the
//! squad is dropped (or consumed by one of the `*_and_join` variants).
//! Optionally, each worker can be pinned to a hardware thread.
//!
//! # Example
//!
//! ```
//! use thread_squad::{Params, ThreadSquad};
//!
//! let mut squad = ThreadSquad::new(Params {
//!     num_threads: 4,
//!     ..Params::default()
//! })
//! .unwrap();
//!
//! // Each worker contributes its (index + 1); the controller folds the values.
//! let total = squad.transform_reduce(|ctx| ctx.thread_index() + 1, 0, |a, b| a + b);
//! assert_eq!(total, 10);
//!
//! // Inside a round, workers can reduce among themselves: every participant
//! // receives the combined value.
//! let all_agree = squad.transform_reduce_first(
//!     |ctx| ctx.reduce(1usize, |a, b| a + b) == ctx.num_threads(),
//!     |a, b| a && b,
//! );
//! assert!(all_agree);
//! ```

// -----------------------------------------------------------------------------
// Boilerplate for building without the standard library

#![no_std]

extern crate alloc;
extern crate std;

// -----------------------------------------------------------------------------
// Modules

mod backoff;
mod collective;
mod os;
mod squad;
mod task;
mod tree;
mod unwind;

// -----------------------------------------------------------------------------
// Top-level exports

pub use collective::TaskContext;
pub use squad::Params;
pub use squad::SquadError;
pub use squad::ThreadSquad;

// -----------------------------------------------------------------------------
// Platform Support

// This crate can be tested with `loom` and `shuttle`, both of which require
// mocking the core threading primitives (`Mutex`, `Condvar`, atomics, thread
// spawning). To keep the rest of the crate oblivious, the important types are
// re-exported through the `platform` module. Where necessary the `std`
// implementation is wrapped to match up with `loom`.

#[cfg(not(any(loom, feature = "shuttle")))]
mod platform {

    // Core exports

    pub use core::sync::atomic::AtomicUsize;
    pub use core::sync::atomic::Ordering;
    pub use core::sync::atomic::fence;
    pub use std::sync::Condvar;
    pub use std::sync::Mutex;
    pub use std::thread::Builder as ThreadBuilder;
    pub use std::thread::JoinHandle;
    pub use std::thread::available_parallelism;
    pub use std::thread::yield_now;

    pub use super::cell::UnsafeCell;
}

#[cfg(all(not(loom), feature = "shuttle"))]
mod platform {

    // Core exports

    pub use shuttle::sync::Condvar;
    pub use shuttle::sync::Mutex;
    pub use shuttle::sync::atomic::AtomicUsize;
    pub use shuttle::sync::atomic::Ordering;
    pub use shuttle::sync::atomic::fence;
    pub use shuttle::thread::Builder as ThreadBuilder;
    pub use shuttle::thread::JoinHandle;
    pub use shuttle::thread::yield_now;

    pub use super::cell::UnsafeCell;

    // Available parallelism

    pub fn available_parallelism() -> std::io::Result<core::num::NonZero<usize>> {
        panic!("available_parallelism is not available under shuttle");
    }
}

#[cfg(loom)]
mod platform {

    // Core exports

    pub use loom::cell::UnsafeCell;
    pub use loom::sync::Condvar;
    pub use loom::sync::Mutex;
    pub use loom::sync::atomic::AtomicUsize;
    pub use loom::sync::atomic::Ordering;
    pub use loom::sync::atomic::fence;
    pub use loom::thread::Builder as ThreadBuilder;
    pub use loom::thread::JoinHandle;
    pub use loom::thread::yield_now;

    // Available parallelism

    pub fn available_parallelism() -> std::io::Result<core::num::NonZero<usize>> {
        panic!("available_parallelism does not work on loom");
    }
}

#[cfg(not(loom))]
mod cell {

    // Unsafe Cell
    //
    // The API mirrors `loom::cell::UnsafeCell` so that the `platform` module
    // can swap between the two.

    pub struct UnsafeCell<T> {
        data: core::cell::UnsafeCell<T>,
    }

    impl<T> UnsafeCell<T> {
        #[inline(always)]
        pub const fn new(data: T) -> Self {
            UnsafeCell {
                data: core::cell::UnsafeCell::new(data),
            }
        }

        #[inline(always)]
        pub fn get_mut(&self) -> MutPtr<T> {
            MutPtr {
                ptr: self.data.get(),
            }
        }
    }

    pub struct MutPtr<T: ?Sized> {
        ptr: *mut T,
    }

    #[allow(clippy::mut_from_ref)]
    impl<T: ?Sized> MutPtr<T> {
        /// Dereferences the pointer.
        ///
        /// # Safety
        ///
        /// This is equivalent to dereferencing a *mut T pointer, so all the
        /// same safety considerations apply here.
        ///
        /// Because the `MutPtr` type can only be created by calling
        /// `UnsafeCell::get_mut` on a valid `UnsafeCell`, we know the pointer
        /// will never be null.
        #[inline(always)]
        pub unsafe fn deref(&self) -> &mut T {
            // SAFETY: The safety requirements of this pointer dereference are
            // identical to those of the function.
            unsafe { &mut *self.ptr }
        }
    }
}
