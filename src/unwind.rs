//! Panic containment for worker threads.

use std::eprintln;
use std::process::abort;

/// Aborts the program when dropped.
///
/// Armed around the whole worker loop: a panic that unwinds out of a worker
/// (from the user action, a reduction operator, or a failed fork) would leave
/// its tree peers blocked on signals that never arrive, so the process is
/// taken down instead.
pub(crate) struct AbortOnDrop;

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        eprintln!("thread-squad: worker terminated abnormally; aborting");
        abort();
    }
}
