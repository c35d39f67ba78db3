//! Worker threads — the compute side of the hand-off.
//!
//! Each worker owns one `SignalQueue` and loops: dequeue, run the
//! task's op chain until it reaches an IO-bound or NOOP boundary,
//! repeat. An empty queue earns a short sleep, not a spin. Workers
//! observe the force-exit flag every iteration and a `Stop` sentinel
//! unwinds them cleanly on graceful shutdown.
//!
//! A chain that reaches READ/WRITE on a worker re-registers the fd
//! with the shared multiplexer from the worker thread. That cannot
//! race the dispatcher: registration syscalls are thread-safe, and the
//! ownership discipline means no other thread touches this fd until
//! the registration makes the dispatcher its owner again.

use std::sync::Arc;
use std::thread;

use zrpc_core::zdebug;
use zrpc_module::slot_pool::TaskId;

use crate::dispatch;
use crate::service::ServiceShared;

/// A worker queue entry.
#[derive(Clone, Copy)]
pub(crate) enum WorkerMsg {
    /// Run this task's op chain from its current op.
    Run(TaskId),
    /// Termination sentinel: unwind the worker.
    Stop,
}

pub(crate) fn spawn(shared: &Arc<ServiceShared>) -> Vec<thread::JoinHandle<()>> {
    (0..shared.info.worker_queues as usize)
        .map(|idx| {
            let shared = Arc::clone(shared);
            thread::Builder::new()
                .name(format!("zrpc-worker-{}", idx))
                .spawn(move || worker_loop(shared, idx))
                .expect("failed to spawn worker thread")
        })
        .collect()
}

fn worker_loop(shared: Arc<ServiceShared>, idx: usize) {
    let queue = &shared.queues[idx];
    loop {
        if shared.flags.force_exit_requested() {
            break;
        }

        match queue.dequeue() {
            Some(WorkerMsg::Stop) => break,
            Some(WorkerMsg::Run(id)) => dispatch::drive_chain(&shared, id),
            None => {}
        }

        if queue.is_empty() {
            thread::sleep(shared.worker_idle_wait);
        }
    }
    zdebug!("zrpc-worker-{}: exit", idx);
}
