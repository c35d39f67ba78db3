//! zrpc httpd
//!
//! A deliberately small GET-only HTTP service showing the full op
//! chain: request bytes accumulate in READ, the response is built in
//! CALC on a worker thread, WRITE streams it out, and the connection
//! closes after one exchange. The body just echoes the request URI;
//! this demo exists to exercise the dispatcher, not to speak real HTTP.
//!
//! Usage:
//!     cargo run --release -p zrpc-httpd [port] [workers]
//!
//! Test with:
//!     curl -s http://localhost:8080/some/path

use std::sync::OnceLock;

use zrpc_core::ops::{NextOp, OpId};
use zrpc_core::service::ServiceInfo;
use zrpc_core::table::OpTable;
use zrpc_core::task::ConnTask;
use zrpc_core::{zdebug, zinfo, zlog};

use zrpc_executor::{Service, ServiceConfig, ServiceControl};
use zrpc_module::net::{self, IoStep};

const REQUEST_LIMIT: usize = 16 * 1024;

struct HttpExchange {
    request: Vec<u8>,
    uri: String,
    response: Vec<u8>,
    wpos: usize,
}

/// Pull the URI out of `GET <uri> ...`. `None` until the header block
/// is complete; `Some(None)` for anything that is not a plain GET.
fn parse_request(request: &[u8]) -> Option<Option<String>> {
    if !request.windows(4).any(|w| w == b"\r\n\r\n") {
        if request.len() > REQUEST_LIMIT {
            return Some(None);
        }
        return None;
    }
    if !request.starts_with(b"GET ") {
        return Some(None);
    }
    let rest = &request[4..];
    match rest.iter().position(|&b| b == b' ') {
        Some(end) => Some(Some(String::from_utf8_lossy(&rest[..end]).into_owned())),
        None => Some(None),
    }
}

fn op_begin(task: &mut ConnTask, _svc: &ServiceInfo) -> NextOp {
    task.uptr = Some(Box::new(HttpExchange {
        request: Vec::new(),
        uri: String::new(),
        response: Vec::new(),
        wpos: 0,
    }));
    NextOp::Op(OpId::Read)
}

fn op_read(task: &mut ConnTask, _svc: &ServiceInfo) -> NextOp {
    let fd = task.fd;
    let mut chunk = [0u8; 4096];
    match net::tcp_read(fd, &mut chunk) {
        IoStep::Data(n) => {
            let Some(rr) = task.user_mut::<HttpExchange>() else {
                return NextOp::Op(OpId::Err);
            };
            rr.request.extend_from_slice(&chunk[..n]);
            match parse_request(&rr.request) {
                None => NextOp::Op(OpId::Read),
                Some(None) => NextOp::Op(OpId::End),
                Some(Some(uri)) => {
                    rr.uri = uri;
                    NextOp::Op(OpId::Sched)
                }
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
    let Some(rr) = task.user_mut::<HttpExchange>() else {
        return NextOp::Op(OpId::Err);
    };
    let body = format!("URI: {}", rr.uri);
    rr.response = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        body.len(),
        body
    )
    .into_bytes();
    rr.wpos = 0;
    NextOp::Op(OpId::Write)
}

fn op_write(task: &mut ConnTask, _svc: &ServiceInfo) -> NextOp {
    let fd = task.fd;
    let Some(rr) = task.user_mut::<HttpExchange>() else {
        return NextOp::Op(OpId::Err);
    };
    match net::tcp_write(fd, &rr.response[rr.wpos..]) {
        IoStep::Data(n) => {
            rr.wpos += n;
            if rr.wpos >= rr.response.len() {
                NextOp::Op(OpId::End)
            } else {
                NextOp::Op(OpId::Write)
            }
        }
        IoStep::WouldBlock => NextOp::Op(OpId::Write),
        IoStep::Closed | IoStep::Error(_) => NextOp::Op(OpId::Err),
    }
}

fn op_err(task: &mut ConnTask, _svc: &ServiceInfo) -> NextOp {
    zdebug!("request failed [fd: {}]", task.fd);
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
    let port: u16 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(8080);
    let workers: u32 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(2);

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

    let service = Service::new(config, table)?;
    let _ = CONTROL.set(service.control());
    unsafe {
        libc::signal(libc::SIGINT, handle_signal as usize);
        libc::signal(libc::SIGTERM, handle_signal as usize);
    }

    zinfo!("zrpc-httpd: listening on 0.0.0.0:{}", port);
    service.run()
}
