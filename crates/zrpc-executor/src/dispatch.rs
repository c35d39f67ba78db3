//! The op-chain state machine.
//!
//! `drive_chain` runs a connection's operations back-to-back while
//! they are CPU-bound, stopping only when the chain parks on socket
//! readiness (READ/WRITE), ends at NOOP, hands the task to a worker
//! queue (SCHED), or destroys it (CLOSE). The same code runs on the
//! dispatcher thread and on workers; exclusive task ownership makes
//! that safe.
//!
//! On every transition the CPU/IO classification of the previous and
//! next op decides the multiplexer change:
//!
//! | prev → next | action                                   |
//! |-------------|------------------------------------------|
//! | CPU → CPU   | none                                     |
//! | CPU → IO    | register (READ→read, WRITE→write, CLOSE→none, run now) |
//! | IO  → CPU   | deregister                               |
//! | IO  → IO    | deregister, then register the new kind   |

use zrpc_core::ops::{NextOp, OpClass, OpId};
use zrpc_core::task::ConnTask;
use zrpc_core::{zdebug, zerror, zwarn};

use zrpc_module::backoff::RepeatCounter;
use zrpc_module::slot_pool::TaskId;

use crate::service::ServiceShared;
use crate::worker::WorkerMsg;

/// Where a single op step left the task.
enum Step {
    /// The op ran; the chain may continue with `next`.
    Advance { ran: OpId, next: OpId },
    /// The task now belongs to a worker queue.
    HandedOff,
    /// The task is gone (slot released) or was stale to begin with.
    Destroyed,
}

/// Run the task's op chain until it parks, hands off, or dies.
pub(crate) fn drive_chain(shared: &ServiceShared, id: TaskId) {
    let mut err_repeat = RepeatCounter::new(shared.err_repeat_limit);
    loop {
        match step(shared, id) {
            Step::HandedOff | Step::Destroyed => return,
            Step::Advance { ran, next } => {
                if ran == OpId::Err && next == OpId::Err {
                    if err_repeat.repeat() {
                        zwarn!(
                            "task {}: repeated ERR->ERR transitions, pausing the chain",
                            id.slot()
                        );
                        shared.err_backoff.pause();
                    }
                } else {
                    err_repeat.reset();
                }

                match next.class() {
                    OpClass::Cpu => continue,
                    // CLOSE runs immediately; READ/WRITE parked on readiness.
                    OpClass::Io => {
                        if next == OpId::Close {
                            continue;
                        }
                        return;
                    }
                    OpClass::Neutral => return,
                }
            }
        }
    }
}

/// Resolve and destroy a task (used by the loop for teardown paths
/// that bypass the chain, e.g. the listening task).
pub(crate) fn destroy(shared: &ServiceShared, id: TaskId) {
    // Safety: caller owns the task.
    if let Some(task) = unsafe { shared.pool.get(id) } {
        destroy_task(shared, id, task);
    }
}

/// Run exactly one op through the table and apply the transition.
fn step(shared: &ServiceShared, id: TaskId) -> Step {
    // Safety: the calling thread owns this task (dispatcher before a
    // hand-off, the worker that dequeued it after).
    let task = match unsafe { shared.pool.get(id) } {
        Some(task) => task,
        None => {
            zdebug!("stale task handle dropped [slot: {}]", id.slot());
            return Step::Destroyed;
        }
    };

    let op = task.op_next;
    task.op_prev = op;
    let ret = shared.ops.run(op, task, &shared.info);

    if op == OpId::Close {
        // Terminal: the handler was the protocol's cleanup hook; its
        // return value is irrelevant once the task is gone.
        destroy_task(shared, id, task);
        return Step::Destroyed;
    }

    match ret {
        NextOp::Handoff(queue) => hand_off(shared, id, task, op, queue),
        NextOp::Op(next) => {
            task.op_next = next;
            if let Err(e) = switch_interest(shared, id, task) {
                zerror!(
                    "task {}: readiness switch failed ({}), forcing error path [fd: {}] [prev: {}] [next: {}]",
                    id.slot(),
                    e,
                    task.fd,
                    op.name(),
                    next.name()
                );
                force_deregister(shared, task);
                task.op_next = OpId::Err;
                return Step::Advance {
                    ran: op,
                    next: OpId::Err,
                };
            }
            Step::Advance { ran: op, next }
        }
    }
}

/// SCHED hand-off: validate the queue index, deregister, enqueue.
///
/// Deregistering before the enqueue is what guarantees the mutual
/// exclusion invariant: once a worker can see the task, the
/// multiplexer cannot.
fn hand_off(
    shared: &ServiceShared,
    id: TaskId,
    task: &mut ConnTask,
    op: OpId,
    queue: u32,
) -> Step {
    if op != OpId::Sched {
        zerror!(
            "task {}: hand-off returned by {}, only SCHED may hand off",
            id.slot(),
            op.name()
        );
        task.op_next = OpId::Err;
        return Step::Advance {
            ran: op,
            next: OpId::Err,
        };
    }

    if queue >= shared.info.worker_queues {
        zerror!(
            "task {}: {}",
            id.slot(),
            zrpc_core::error::RpcError::BadQueueIndex {
                index: queue,
                limit: shared.info.worker_queues,
            }
        );
        task.op_next = OpId::Err;
        return Step::Advance {
            ran: op,
            next: OpId::Err,
        };
    }

    task.op_next = OpId::Calc;
    force_deregister(shared, task);

    let mut attempts = 0;
    while !shared.queues[queue as usize].enqueue(WorkerMsg::Run(id)) {
        attempts += 1;
        if attempts > shared.enqueue_retries {
            zwarn!(
                "{} on worker queue {}, failing the connection [fd: {}]",
                zrpc_core::error::RpcError::QueueFull,
                queue,
                task.fd
            );
            task.op_next = OpId::Err;
            return Step::Advance {
                ran: op,
                next: OpId::Err,
            };
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
    }

    Step::HandedOff
}

/// Bring the multiplexer registration in line with `task.op_next`.
fn switch_interest(
    shared: &ServiceShared,
    id: TaskId,
    task: &mut ConnTask,
) -> zrpc_core::error::Result<()> {
    let want = task.op_next.interest();
    if task.registered == want {
        return Ok(());
    }
    match (task.registered, want) {
        (None, Some(interest)) => {
            shared.poller.register(task.fd, id.token(), interest)?;
            task.registered = Some(interest);
        }
        (Some(_), None) => {
            force_deregister(shared, task);
        }
        (Some(_), Some(interest)) => {
            force_deregister(shared, task);
            shared.poller.register(task.fd, id.token(), interest)?;
            task.registered = Some(interest);
        }
        (None, None) => {}
    }
    Ok(())
}

/// Drop the task's registration if it has one. Removal failures are
/// logged and swallowed: the fd is on its way out either way.
fn force_deregister(shared: &ServiceShared, task: &mut ConnTask) {
    if task.registered.is_some() {
        if let Err(e) = shared.poller.deregister(task.fd) {
            zdebug!("deregister failed [fd: {}]: {}", task.fd, e);
        }
        task.registered = None;
    }
}

/// Deregister, close the fd, warn about leaked payload, release the slot.
fn destroy_task(shared: &ServiceShared, id: TaskId, task: &mut ConnTask) {
    force_deregister(shared, task);

    if task.fd >= 0 {
        unsafe {
            libc::close(task.fd);
        }
    }

    if task.has_user_data() {
        zwarn!(
            "user payload not released before task teardown [fd: {}] [udata: {}]",
            task.fd,
            task.udata
        );
        task.uptr = None;
        task.udata = 0;
    }

    shared.pool.release(id);
}
