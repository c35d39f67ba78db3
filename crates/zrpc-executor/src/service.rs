//! The service: shared context, main event loop, lifecycle.

use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use zrpc_core::error::{Result, RpcError};
use zrpc_core::ops::{Interest, OpId};
use zrpc_core::service::{ServiceFlags, ServiceInfo};
use zrpc_core::table::OpTable;
use zrpc_core::task::TaskKind;
use zrpc_core::{zdebug, zerror, zinfo, zwarn};

use zrpc_module::backoff::Backoff;
use zrpc_module::net;
use zrpc_module::poller::{PollEvent, Poller};
use zrpc_module::signal_queue::SignalQueue;
use zrpc_module::slot_pool::{SlotPool, TaskId};

use crate::config::ServiceConfig;
use crate::dispatch;
use crate::worker::{self, WorkerMsg};

/// State shared by the dispatcher thread and the workers. Built once
/// by `Service::new` and passed around explicitly; the framework keeps
/// no process-wide mutable state.
pub(crate) struct ServiceShared {
    pub(crate) poller: Poller,
    pub(crate) pool: SlotPool,
    pub(crate) queues: Vec<SignalQueue<WorkerMsg>>,
    pub(crate) ops: OpTable,
    pub(crate) info: ServiceInfo,
    pub(crate) flags: ServiceFlags,
    pub(crate) err_repeat_limit: u32,
    pub(crate) enqueue_retries: u32,
    pub(crate) worker_idle_wait: Duration,
    pub(crate) err_backoff: Arc<dyn Backoff>,
}

/// Cloneable handle for requesting exit from outside the loop (signal
/// handler, admin thread).
#[derive(Clone)]
pub struct ServiceControl {
    shared: Arc<ServiceShared>,
}

impl ServiceControl {
    /// Graceful exit: the loop stops once only the listening task
    /// remains live.
    pub fn request_exit(&self) {
        self.shared.flags.request_exit();
    }

    /// Immediate exit: the loop stops between readiness batches.
    pub fn request_force_exit(&self) {
        self.shared.flags.request_force_exit();
    }

    /// Live task count, the listening task included.
    pub fn live_tasks(&self) -> u32 {
        self.shared.pool.live()
    }
}

/// A configured service instance. `run` consumes it and blocks on the
/// event loop until an exit flag is honored.
pub struct Service {
    shared: Arc<ServiceShared>,
    workers: Vec<thread::JoinHandle<()>>,
    listen_fd: RawFd,
    poll_timeout_ms: i32,
    wait_batch: usize,
    accept_batch: u32,
    wait_err_trigger: u32,
    wait_backoff: Arc<dyn Backoff>,
}

impl Service {
    pub fn new(config: ServiceConfig, ops: OpTable) -> Result<Self> {
        if config.listen_fd < 0 {
            zerror!("cannot run service [listen fd: {}]", config.listen_fd);
            return Err(RpcError::BadListenSocket(config.listen_fd));
        }

        let worker_count = config.workers.max(1);
        let queue_capacity = config.queue_capacity.max(1);
        let info = ServiceInfo {
            worker_queues: worker_count,
            queue_capacity,
            max_connections: config.max_connections,
        };

        for op in OpId::ALL {
            if !ops.is_custom(op) {
                zinfo!("[service op: {}] is not set, using the default", op.name());
            }
        }

        let poller = Poller::new()?;
        let pool = SlotPool::new(1 + config.max_connections as usize);
        let mut queues = Vec::with_capacity(worker_count as usize);
        for _ in 0..worker_count {
            queues.push(SignalQueue::new(queue_capacity as usize)?);
        }

        let shared = Arc::new(ServiceShared {
            poller,
            pool,
            queues,
            ops,
            info,
            flags: ServiceFlags::new(),
            err_repeat_limit: config.err_repeat_limit,
            enqueue_retries: config.enqueue_retries,
            worker_idle_wait: config.worker_idle_wait,
            err_backoff: config.err_backoff,
        });

        let workers = worker::spawn(&shared);

        Ok(Self {
            shared,
            workers,
            listen_fd: config.listen_fd,
            poll_timeout_ms: config.poll_timeout_ms,
            wait_batch: config.wait_batch,
            accept_batch: config.accept_batch,
            wait_err_trigger: config.wait_err_trigger,
            wait_backoff: config.wait_backoff,
        })
    }

    pub fn control(&self) -> ServiceControl {
        ServiceControl {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Run the event loop until an exit flag is honored. Tears down
    /// the listening task and the workers before returning.
    pub fn run(self) -> Result<()> {
        let listen_id = self
            .shared
            .pool
            .allocate(self.listen_fd, TaskKind::Listen)
            .ok_or(RpcError::PoolExhausted)?;
        // Safety: the dispatcher owns the freshly allocated listen task.
        if let Some(task) = unsafe { self.shared.pool.get(listen_id) } {
            self.shared
                .poller
                .register(self.listen_fd, listen_id.token(), Interest::Read)?;
            task.registered = Some(Interest::Read);
        }

        zinfo!(
            "service: running [listen fd: {}] [workers: {}] [max links: {}]",
            self.listen_fd,
            self.shared.info.worker_queues,
            self.shared.info.max_connections
        );

        let mut events: Vec<PollEvent> = Vec::with_capacity(self.wait_batch);
        let mut wait_errs = 0u32;

        loop {
            let flags = &self.shared.flags;
            if flags.force_exit_requested()
                || (flags.exit_requested() && self.shared.pool.live() <= 1)
            {
                break;
            }

            match self
                .shared
                .poller
                .wait(&mut events, self.wait_batch, self.poll_timeout_ms)
            {
                Err(e) => {
                    zwarn!("multiplexer wait error: {}", e);
                    wait_errs += 1;
                    if wait_errs > self.wait_err_trigger {
                        zerror!(
                            "{} consecutive multiplexer errors, pausing the loop",
                            wait_errs
                        );
                        self.wait_backoff.pause();
                        wait_errs = 0;
                    }
                    continue;
                }
                Ok(0) => continue,
                Ok(_) => {}
            }

            for i in 0..events.len() {
                let ev = events[i];
                self.dispatch_event(ev);
            }
        }

        self.teardown(listen_id)
    }

    fn dispatch_event(&self, ev: PollEvent) {
        let id = TaskId::from_token(ev.token);
        // Safety: registered tasks are dispatcher-owned (a handed-off
        // task is never registered).
        let kind = match unsafe { self.shared.pool.get(id) } {
            Some(task) => task.kind,
            None => {
                zdebug!("stale readiness event dropped [token: {:#x}]", ev.token);
                return;
            }
        };

        match kind {
            TaskKind::Listen => self.on_listen(ev),
            TaskKind::Io => self.on_io(ev, id),
            TaskKind::Unknown => {
                zwarn!("readiness event for unknown task kind [token: {:#x}]", ev.token);
            }
        }
    }

    /// Listen readiness: drain pending connections, bounded so one
    /// busy notification cannot starve other fds.
    fn on_listen(&self, ev: PollEvent) {
        if !ev.readable {
            zerror!(
                "listening socket error, requesting service exit [fd: {}]",
                self.listen_fd
            );
            self.shared.flags.request_exit();
            return;
        }

        for _ in 0..self.accept_batch {
            match net::tcp_accept(self.listen_fd) {
                Ok(Some(fd)) => match self.shared.pool.allocate(fd, TaskKind::Io) {
                    Some(conn) => dispatch::drive_chain(&self.shared, conn),
                    None => {
                        zwarn!(
                            "connection limit reached, rejecting [fd: {}] [live: {}] [max: {}]",
                            fd,
                            self.shared.pool.live(),
                            self.shared.info.max_connections
                        );
                        unsafe {
                            libc::close(fd);
                        }
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    zwarn!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    fn on_io(&self, ev: PollEvent, id: TaskId) {
        // Safety: this task is registered, hence dispatcher-owned.
        let Some(task) = (unsafe { self.shared.pool.get(id) }) else {
            return;
        };

        if ev.hangup && task.op_next != OpId::Close {
            zdebug!("peer gone [fd: {}]", task.fd);
            task.op_next = OpId::Err;
        }
        if task.op_next == OpId::Read && !ev.readable {
            zwarn!(
                "read readiness expected but not present [fd: {}]",
                task.fd
            );
            task.op_next = OpId::Err;
        }
        if task.op_next == OpId::Write && !ev.writable {
            zwarn!(
                "write readiness expected but not present [fd: {}]",
                task.fd
            );
            task.op_next = OpId::Err;
        }

        dispatch::drive_chain(&self.shared, id);
    }

    fn teardown(mut self, listen_id: TaskId) -> Result<()> {
        dispatch::destroy(&self.shared, listen_id);

        let leftover = self.shared.pool.live();
        if leftover > 0 {
            zdebug!("exiting with {} live tasks", leftover);
        }

        for queue in &self.shared.queues {
            while !queue.enqueue(WorkerMsg::Stop) {
                if self.shared.flags.force_exit_requested() {
                    break;
                }
                thread::sleep(Duration::from_millis(1));
            }
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }

        zinfo!("service: stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{ErrorKind, Read, Write};
    use std::net::TcpStream;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    use zrpc_core::ops::NextOp;
    use zrpc_core::task::ConnTask;
    use zrpc_module::net::IoStep;

    struct EchoState {
        line: Vec<u8>,
        wpos: usize,
    }

    /// Keep-alive line echo: read until '\n', hand off, write the line
    /// back, read the next line; client close ends the connection.
    fn echo_table() -> OpTable {
        let mut table = OpTable::new();
        table.set(OpId::Begin, |t: &mut ConnTask, _s: &ServiceInfo| {
            t.uptr = Some(Box::new(EchoState {
                line: Vec::new(),
                wpos: 0,
            }));
            NextOp::Op(OpId::Read)
        });
        table.set(OpId::Read, |t: &mut ConnTask, _s: &ServiceInfo| {
            let fd = t.fd;
            let mut chunk = [0u8; 4096];
            match net::tcp_read(fd, &mut chunk) {
                IoStep::Data(n) => {
                    let Some(state) = t.user_mut::<EchoState>() else {
                        return NextOp::Op(OpId::Err);
                    };
                    state.line.extend_from_slice(&chunk[..n]);
                    if state.line.contains(&b'\n') {
                        NextOp::Op(OpId::Sched)
                    } else {
                        NextOp::Op(OpId::Read)
                    }
                }
                IoStep::WouldBlock => NextOp::Op(OpId::Read),
                IoStep::Closed => NextOp::Op(OpId::End),
                IoStep::Error(_) => NextOp::Op(OpId::Err),
            }
        });
        table.set(OpId::Sched, |t: &mut ConnTask, s: &ServiceInfo| {
            NextOp::Handoff(t.fd as u32 % s.worker_queues)
        });
        table.set(OpId::Calc, |t: &mut ConnTask, _s: &ServiceInfo| {
            match t.user_mut::<EchoState>() {
                Some(state) => {
                    state.wpos = 0;
                    NextOp::Op(OpId::Write)
                }
                None => NextOp::Op(OpId::Err),
            }
        });
        table.set(OpId::Write, |t: &mut ConnTask, _s: &ServiceInfo| {
            let fd = t.fd;
            let Some(state) = t.user_mut::<EchoState>() else {
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
        });
        table.set(OpId::Err, |_t: &mut ConnTask, _s: &ServiceInfo| {
            NextOp::Op(OpId::End)
        });
        table.set(OpId::End, |t: &mut ConnTask, _s: &ServiceInfo| {
            t.uptr = None;
            NextOp::Op(OpId::Close)
        });
        table
    }

    fn test_config(max_connections: u32, workers: u32, queue_capacity: u32) -> ServiceConfig {
        let listen_fd = net::tcp_listen(0, 128).unwrap();
        let mut config = ServiceConfig::new(listen_fd);
        config.max_connections = max_connections;
        config.workers = workers;
        config.queue_capacity = queue_capacity;
        config.poll_timeout_ms = 50;
        config
    }

    fn start(
        config: ServiceConfig,
        table: OpTable,
    ) -> (ServiceControl, thread::JoinHandle<Result<()>>, u16) {
        let port = net::local_port(config.listen_fd).unwrap();
        let service = Service::new(config, table).unwrap();
        let control = service.control();
        let handle = thread::spawn(move || service.run());
        (control, handle, port)
    }

    fn wait_for_live(control: &ServiceControl, want: u32) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while control.live_tasks() != want {
            assert!(
                Instant::now() < deadline,
                "live tasks stuck at {} (want {})",
                control.live_tasks(),
                want
            );
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn connect(port: u16) -> TcpStream {
        let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    #[test]
    fn echo_round_trip_with_partial_reads() {
        let (control, handle, port) = start(test_config(8, 2, 8), echo_table());

        let mut client = connect(port);
        // Two partial writes: the server's READ op must run twice.
        client.write_all(b"hel").unwrap();
        thread::sleep(Duration::from_millis(50));
        client.write_all(b"lo\n").unwrap();

        let mut reply = [0u8; 6];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"hello\n");

        // Keep-alive: a second line on the same connection.
        client.write_all(b"again\n").unwrap();
        let mut reply = [0u8; 6];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"again\n");

        // Closing the client releases exactly the one slot it held.
        drop(client);
        wait_for_live(&control, 1);

        control.request_exit();
        assert!(handle.join().unwrap().is_ok());
    }

    #[test]
    fn pool_exhaustion_rejects_excess_connections() {
        let (control, handle, port) = start(test_config(8, 2, 4), echo_table());

        let mut clients: Vec<TcpStream> = (0..10).map(|_| connect(port)).collect();
        // Let the dispatcher accept (and reject) everything first.
        thread::sleep(Duration::from_millis(300));

        let mut open = Vec::new();
        let mut rejected = 0;
        for client in clients.drain(..) {
            client.set_nonblocking(true).unwrap();
            let mut probe = [0u8; 1];
            let mut c = client;
            match c.read(&mut probe) {
                // Rejected connections were closed without any data.
                Ok(0) => rejected += 1,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    c.set_nonblocking(false).unwrap();
                    open.push(c);
                }
                Ok(_) => panic!("unexpected data before any request"),
                Err(e) => panic!("unexpected probe error: {}", e),
            }
        }
        assert_eq!(rejected, 2);
        assert_eq!(open.len(), 8);
        assert_eq!(control.live_tasks(), 9);

        // Every accepted connection completes a full cycle independently.
        for (i, client) in open.iter_mut().enumerate() {
            let line = format!("conn {}\n", i);
            client.write_all(line.as_bytes()).unwrap();
            let mut reply = vec![0u8; line.len()];
            client.read_exact(&mut reply).unwrap();
            assert_eq!(reply, line.as_bytes());
        }

        drop(open);
        wait_for_live(&control, 1);

        control.request_exit();
        assert!(handle.join().unwrap().is_ok());
    }

    #[test]
    fn invalid_sched_index_fails_the_connection_only() {
        let mut table = OpTable::new();
        table.set(OpId::Begin, |_t: &mut ConnTask, _s: &ServiceInfo| {
            NextOp::Op(OpId::Sched)
        });
        table.set(OpId::Sched, |_t: &mut ConnTask, _s: &ServiceInfo| {
            NextOp::Handoff(99)
        });

        let (control, handle, port) = start(test_config(4, 2, 4), table);

        // The bad hand-off routes the connection to ERR -> CLOSE: the
        // client sees a clean close, the service stays up.
        for _ in 0..2 {
            let mut client = connect(port);
            let mut probe = [0u8; 1];
            assert_eq!(client.read(&mut probe).unwrap(), 0);
            wait_for_live(&control, 1);
        }

        control.request_exit();
        assert!(handle.join().unwrap().is_ok());
    }

    struct CountingBackoff(AtomicU32);

    impl Backoff for CountingBackoff {
        fn pause(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn repeated_err_transitions_trigger_backoff_then_continue() {
        let pauses = Arc::new(CountingBackoff(AtomicU32::new(0)));

        let mut table = OpTable::new();
        table.set(OpId::Begin, |_t: &mut ConnTask, _s: &ServiceInfo| {
            NextOp::Op(OpId::Err)
        });
        // Three consecutive ERR->ERR transitions, then recover.
        table.set(OpId::Err, |t: &mut ConnTask, _s: &ServiceInfo| {
            if t.udata < 3 {
                t.udata += 1;
                NextOp::Op(OpId::Err)
            } else {
                t.udata = 0;
                NextOp::Op(OpId::End)
            }
        });
        table.set(OpId::End, |_t: &mut ConnTask, _s: &ServiceInfo| {
            NextOp::Op(OpId::Close)
        });

        let mut config = test_config(4, 1, 4);
        config.err_repeat_limit = 2;
        config.err_backoff = pauses.clone();
        let (control, handle, port) = start(config, table);

        let mut client = connect(port);
        let mut probe = [0u8; 1];
        assert_eq!(client.read(&mut probe).unwrap(), 0);
        wait_for_live(&control, 1);
        assert_eq!(pauses.0.load(Ordering::SeqCst), 1);

        // The loop keeps serving other connections afterwards.
        let mut client = connect(port);
        assert_eq!(client.read(&mut probe).unwrap(), 0);
        wait_for_live(&control, 1);

        control.request_exit();
        assert!(handle.join().unwrap().is_ok());
    }

    #[test]
    fn force_exit_stops_with_connections_open() {
        let (control, handle, port) = start(test_config(8, 2, 8), echo_table());

        let _client = connect(port);
        wait_for_live(&control, 2);

        control.request_force_exit();
        assert!(handle.join().unwrap().is_ok());
    }
}
