//! Isolated execution units for guest calls.
//!
//! A job runs on a freshly spawned scoped thread whose stack is sized by the
//! caller. The job's captures are handed over once when the thread starts and
//! its output comes back once over a oneshot channel; the caller blocks until
//! it arrives.

use std::io;
use std::panic;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use tokio::sync::oneshot;

use crate::config::DEFAULT_THREAD_STACK_BUDGET;

static THREAD_STACK_BUDGET: AtomicUsize = AtomicUsize::new(DEFAULT_THREAD_STACK_BUDGET);

/// Host-side stack reserved for each isolated call, on top of the guest budget.
pub fn thread_stack_budget() -> usize {
    THREAD_STACK_BUDGET.load(Ordering::Relaxed)
}

/// Set the host-side stack reserved for each isolated call. Process-wide.
pub fn set_thread_stack_budget(bytes: usize) {
    THREAD_STACK_BUDGET.store(bytes, Ordering::Relaxed);
}

/// Run `job` on a new thread with `stack_size` bytes of stack and wait for it.
///
/// Fails only if the thread cannot be spawned, in which case `job` never
/// runs. A panic inside `job` is resumed on the calling thread.
///
/// Must not be called from within an async runtime's worker thread.
pub(crate) fn run_isolated<F, T>(stack_size: usize, job: F) -> io::Result<T>
where
    F: FnOnce() -> T + Send,
    T: Send,
{
    thread::scope(|scope| {
        let (tx, rx) = oneshot::channel();
        let worker = thread::Builder::new()
            .name("wasm-call".to_string())
            .stack_size(stack_size)
            .spawn_scoped(scope, move || {
                // The receiver outlives the worker; a send error cannot happen.
                let _ = tx.send(job());
            })?;

        match rx.blocking_recv() {
            Ok(output) => Ok(output),
            Err(_) => match worker.join() {
                Err(payload) => panic::resume_unwind(payload),
                Ok(()) => Err(io::Error::other("call thread exited without a result")),
            },
        }
    })
}
