//! zrpc echo server
//!
//! Keep-alive TCP line echo driven by the op-table dispatcher: READ
//! collects a line on the I/O thread, SCHED hands the connection to a
//! worker, CALC/WRITE send it back, then the chain returns to READ.
//!
//! Usage:
//!     cargo run --release -p zrpc-echo [port] [workers] [max_conns]
//!
//! Test with:
//!     printf 'hello\n' | nc -q1 localhost 9999

use std::sync::OnceLock;

use zrpc_core::ops::{NextOp, OpId};
use zrpc_core::service::ServiceInfo;
use zrpc_core::table::OpTable;
use zrpc_core::task::ConnTask;
use zrpc_core::{zinfo, zlog, zwarn};

use zrpc_executor::{Service, ServiceConfig, ServiceControl};
use zrpc_module::net::{self, IoStep};

const LINE_LIMIT: usize = 64 * 1024;

struct EchoState {
    line: Vec<u8>,
    wpos: usize,
}

fn op_begin(task: &mut ConnTask, _svc: &ServiceInfo) -> NextOp {
    task.uptr = Some(Box::new(EchoState {
        line: Vec::new(),
        wpos: 0,
    }));
    NextOp::Op(OpId::Read)
}

fn op_read(task: &mut ConnTask, _svc: &ServiceInfo) -> NextOp {
    let fd = task.fd;
    let mut chunk = [0u8; 4096];
    match net::tcp_read(fd, &mut chunk) {
        IoStep::Data(n) => {
            let Some(state) = task.user_mut::<EchoState>() else {
                return NextOp::Op(OpId::Err);
            };
            state.line.extend_from_slice(&chunk[..n]);
            if state.line.contains(&b'\n') {
                NextOp::Op(OpId::Sched)
            } else if state.line.len() > LINE_LIMIT {
                zwarn!("line too long, dropping client [fd: {}]", fd);
                NextOp::Op(OpId::Err)
            } else {
                NextOp::Op(OpId::Read)
            }
        }
        IoStep::WouldBlock => NextOp::Op(OpId::Read),
        IoStep::Closed => NextOp::Op(OpId::End),
        IoStep::Error(_) => NextOp::Op(OpId::Err),
    }
}

fn op_sched(task: &mut ConnTask, svc: &ServiceInfo) -> NextOp {
    NextOp::Handoff(task.fd as u32 % svc.worker_queues)
}

fn op_calc(task: &mut ConnTask, _svc: &ServiceInfo) -> NextOp {
    match task.user_mut::<EchoState>() {
        Some(state) => {
            state.wpos = 0;
            NextOp::Op(OpId::Write)
        }
        None => NextOp::Op(OpId::Err),
    }
}

fn op_write(task: &mut ConnTask, _svc: &ServiceInfo) -> NextOp {
    let fd = task.fd;
    let Some(state) = task.user_mut::<EchoState>() else {
        return NextOp::Op(OpId::Err);
    };
    match net::tcp_write(fd, &state.line[state.wpos..]) {
        IoStep::Data(n) => {
            state.wpos += n;
            if state.wpos >= state.line.len() {
                state.line.clear();
                state.wpos = 0;
                NextOp::Op(OpId::Read)
            } else {
                NextOp::Op(OpId::Write)
            }
        }
        IoStep::WouldBlock => NextOp::Op(OpId::Write),
        IoStep::Closed | IoStep::Error(_) => NextOp::Op(OpId::Err),
    }
}

fn op_err(_task: &mut ConnTask, _svc: &ServiceInfo) -> NextOp {
    NextOp::Op(OpId::End)
}

fn op_end(task: &mut ConnTask, _svc: &ServiceInfo) -> NextOp {
    task.uptr = None;
    NextOp::Op(OpId::Close)
}

static CONTROL: OnceLock<ServiceControl> = OnceLock::new();

extern "C" fn handle_signal(_sig: libc::c_int) {
    if let Some(control) = CONTROL.get() {
        control.request_force_exit();
    }
}

fn main() -> zrpc_core::error::Result<()> {
    zlog::init();

    let args: Vec<String> = std::env::args().collect();
    let port: u16 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(9999);
    let workers: u32 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(2);
    let max_conns: u32 = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(1024);

    let listen_fd = net::tcp_listen(port, 4096)?;

    let mut table = OpTable::new();
    table
        .set(OpId::Begin, op_begin)
        .set(OpId::Read, op_read)
        .set(OpId::Sched, op_sched)
        .set(OpId::Calc, op_calc)
        .set(OpId::Write, op_write)
        .set(OpId::Err, op_err)
        .set(OpId::End, op_end);

    let mut config = ServiceConfig::new(listen_fd);
    config.workers = workers;
    config.max_connections = max_conns;

    let service = Service::new(config, table)?;
    let _ = CONTROL.set(service.control());
    unsafe {
        libc::signal(libc::SIGINT, handle_signal as usize);
        libc::signal(libc::SIGTERM, handle_signal as usize);
    }

    zinfo!("zrpc-echo: listening on 0.0.0.0:{}", port);
    service.run()
}
