//! The operation table: one handler per operation identifier.
//!
//! A protocol fills in the ops it uses; every unset entry keeps a
//! documented default so a half-configured table misbehaves loudly
//! instead of silently:
//!
//! | op                      | default                                  |
//! |-------------------------|------------------------------------------|
//! | ERR                     | advance to CLOSE (task gets destroyed)   |
//! | CLOSE                   | no-op; the dispatcher destroys the task  |
//! | BEGIN / END / NOOP      | advance to NOOP                          |
//! | READ / SCHED / CALC / WRITE | transition to ERR (configuration bug) |
//!
//! Handlers must not block and must not assume ownership of the task
//! beyond the current call.

use crate::ops::{NextOp, OpId};
use crate::service::ServiceInfo;
use crate::task::ConnTask;

/// A single operation step. Runs on the dispatcher thread or on a
/// worker thread, but never concurrently for the same task.
pub trait OpHandler: Send + Sync {
    fn run(&self, task: &mut ConnTask, svc: &ServiceInfo) -> NextOp;
}

impl<F> OpHandler for F
where
    F: Fn(&mut ConnTask, &ServiceInfo) -> NextOp + Send + Sync,
{
    fn run(&self, task: &mut ConnTask, svc: &ServiceInfo) -> NextOp {
        self(task, svc)
    }
}

/// Fixed mapping from operation identifier to handler. Defaults are
/// installed at construction; `set` replaces individual entries.
pub struct OpTable {
    handlers: [Box<dyn OpHandler>; OpId::COUNT],
    custom: [bool; OpId::COUNT],
}

impl OpTable {
    pub fn new() -> Self {
        Self {
            handlers: std::array::from_fn(|i| default_handler(OpId::ALL[i])),
            custom: [false; OpId::COUNT],
        }
    }

    /// Install a protocol handler for `op`.
    pub fn set(&mut self, op: OpId, handler: impl OpHandler + 'static) -> &mut Self {
        self.handlers[op.index()] = Box::new(handler);
        self.custom[op.index()] = true;
        self
    }

    /// True if `op` has a protocol handler rather than the default.
    pub fn is_custom(&self, op: OpId) -> bool {
        self.custom[op.index()]
    }

    /// Run the handler for `op`.
    pub fn run(&self, op: OpId, task: &mut ConnTask, svc: &ServiceInfo) -> NextOp {
        self.handlers[op.index()].run(task, svc)
    }
}

impl Default for OpTable {
    fn default() -> Self {
        Self::new()
    }
}

fn default_handler(op: OpId) -> Box<dyn OpHandler> {
    match op {
        OpId::Err => Box::new(default_err),
        OpId::Noop => Box::new(default_noop),
        OpId::Begin => Box::new(default_begin),
        OpId::Read => Box::new(default_step_unset),
        OpId::Sched => Box::new(default_step_unset),
        OpId::Calc => Box::new(default_step_unset),
        OpId::Write => Box::new(default_step_unset),
        OpId::End => Box::new(default_end),
        OpId::Close => Box::new(default_close),
    }
}

fn default_err(_task: &mut ConnTask, _svc: &ServiceInfo) -> NextOp {
    NextOp::Op(OpId::Close)
}

fn default_noop(_task: &mut ConnTask, _svc: &ServiceInfo) -> NextOp {
    NextOp::Op(OpId::Noop)
}

fn default_begin(_task: &mut ConnTask, _svc: &ServiceInfo) -> NextOp {
    NextOp::Op(OpId::Noop)
}

fn default_end(_task: &mut ConnTask, _svc: &ServiceInfo) -> NextOp {
    NextOp::Op(OpId::Noop)
}

fn default_close(_task: &mut ConnTask, _svc: &ServiceInfo) -> NextOp {
    NextOp::Op(OpId::Noop)
}

// A protocol that reaches a step it never implemented is a
// configuration bug: surface it through the error path immediately.
fn default_step_unset(_task: &mut ConnTask, _svc: &ServiceInfo) -> NextOp {
    NextOp::Op(OpId::Err)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> ServiceInfo {
        ServiceInfo {
            worker_queues: 2,
            queue_capacity: 4,
            max_connections: 8,
        }
    }

    fn run(table: &OpTable, op: OpId) -> NextOp {
        let mut task = ConnTask::vacant();
        table.run(op, &mut task, &info())
    }

    #[test]
    fn documented_defaults() {
        let table = OpTable::new();

        assert_eq!(run(&table, OpId::Err), NextOp::Op(OpId::Close));
        assert_eq!(run(&table, OpId::Noop), NextOp::Op(OpId::Noop));
        assert_eq!(run(&table, OpId::Begin), NextOp::Op(OpId::Noop));
        assert_eq!(run(&table, OpId::End), NextOp::Op(OpId::Noop));
        assert_eq!(run(&table, OpId::Close), NextOp::Op(OpId::Noop));

        assert_eq!(run(&table, OpId::Read), NextOp::Op(OpId::Err));
        assert_eq!(run(&table, OpId::Sched), NextOp::Op(OpId::Err));
        assert_eq!(run(&table, OpId::Calc), NextOp::Op(OpId::Err));
        assert_eq!(run(&table, OpId::Write), NextOp::Op(OpId::Err));
    }

    #[test]
    fn subset_override_leaves_others_default() {
        let mut table = OpTable::new();
        table.set(OpId::Begin, |_t: &mut ConnTask, _s: &ServiceInfo| {
            NextOp::Op(OpId::Read)
        });

        assert!(table.is_custom(OpId::Begin));
        assert!(!table.is_custom(OpId::Read));

        assert_eq!(run(&table, OpId::Begin), NextOp::Op(OpId::Read));
        // Untouched entries keep their defaults.
        assert_eq!(run(&table, OpId::Read), NextOp::Op(OpId::Err));
        assert_eq!(run(&table, OpId::Err), NextOp::Op(OpId::Close));
    }

    #[test]
    fn handler_sees_task_state() {
        let mut table = OpTable::new();
        table.set(OpId::Calc, |t: &mut ConnTask, _s: &ServiceInfo| {
            t.udata += 1;
            NextOp::Op(OpId::Write)
        });

        let mut task = ConnTask::vacant();
        let next = table.run(OpId::Calc, &mut task, &info());
        assert_eq!(next, NextOp::Op(OpId::Write));
        assert_eq!(task.udata, 1);
    }

    #[test]
    fn sched_can_return_handoff() {
        let mut table = OpTable::new();
        table.set(OpId::Sched, |t: &mut ConnTask, s: &ServiceInfo| {
            NextOp::Handoff(t.fd as u32 % s.worker_queues)
        });

        let mut task = ConnTask::vacant();
        task.fd = 5;
        let next = table.run(OpId::Sched, &mut task, &info());
        assert_eq!(next, NextOp::Handoff(1));
    }
}
