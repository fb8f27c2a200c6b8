//! Thin shims over what the host OS reports and controls.

use alloc::vec::Vec;
use core::num::NonZero;

use crate::platform::available_parallelism;

/// Number of hardware threads the OS reports, or 0 when it reports nothing.
///
/// A squad constructed with `num_threads = 0` on such a host ends up with
/// zero slots and runs every round as a no-op.
pub(crate) fn hardware_concurrency() -> usize {
    available_parallelism().map(NonZero::get).unwrap_or(0)
}

/// The hardware thread ids usable for pinning, or `None` when the host OS
/// offers no affinity control.
#[cfg(not(any(loom, feature = "shuttle")))]
pub(crate) fn core_ids() -> Option<Vec<usize>> {
    let ids = core_affinity::get_core_ids()?;
    if ids.is_empty() {
        return None;
    }
    Some(ids.into_iter().map(|core| core.id).collect())
}

#[cfg(any(loom, feature = "shuttle"))]
pub(crate) fn core_ids() -> Option<Vec<usize>> {
    None
}

/// Pins the calling thread to the given hardware thread.
///
/// Called by each worker first thing after spawn, before any action can run.
/// Failure is fatal: the squad has promised a pinned topology it cannot
/// deliver.
#[cfg(not(any(loom, feature = "shuttle")))]
pub(crate) fn pin_current_thread(id: usize) {
    if !core_affinity::set_for_current(core_affinity::CoreId { id }) {
        panic!("failed to pin worker thread to hardware thread {id}");
    }
}

#[cfg(any(loom, feature = "shuttle"))]
pub(crate) fn pin_current_thread(_id: usize) {
    unreachable!("thread pinning is not supported under model checking");
}
