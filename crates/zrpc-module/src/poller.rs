//! Readiness multiplexer behind a small register/deregister/wait
//! surface, so the dispatcher's CPU/IO switch table is the only place
//! that decides registration changes. The implementation is epoll,
//! level-triggered; nothing outside this file touches it directly.

use std::os::unix::io::RawFd;

use zrpc_core::error::{Result, RpcError};
use zrpc_core::ops::Interest;

use crate::last_errno;

/// Upper bound on events fetched by a single `wait`.
const MAX_WAIT_EVENTS: usize = 64;

/// One readiness notification.
#[derive(Debug, Clone, Copy)]
pub struct PollEvent {
    /// The token the fd was registered under.
    pub token: u64,
    pub readable: bool,
    pub writable: bool,
    /// Error or hangup on the fd.
    pub hangup: bool,
}

pub struct Poller {
    epfd: RawFd,
}

impl Poller {
    pub fn new() -> Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(RpcError::MultiplexerCreate(last_errno()));
        }
        Ok(Self { epfd })
    }

    /// Start watching `fd` for `interest`, delivering `token` with its
    /// events. The fd must not already be registered.
    pub fn register(&self, fd: RawFd, token: u64, interest: Interest) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, interest_bits(interest))
            .map_err(|e| RpcError::Register(e))
    }

    /// Change the interest of an already-registered fd.
    pub fn rearm(&self, fd: RawFd, token: u64, interest: Interest) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, interest_bits(interest))
            .map_err(|e| RpcError::Register(e))
    }

    /// Stop watching `fd`.
    pub fn deregister(&self, fd: RawFd) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0, 0)
            .map_err(|e| RpcError::Deregister(e))
    }

    /// Wait up to `timeout_ms` for readiness, filling `out` with at
    /// most `max` events. Interruption and timeout both surface as
    /// zero events, never as an error.
    pub fn wait(&self, out: &mut Vec<PollEvent>, max: usize, timeout_ms: i32) -> Result<usize> {
        out.clear();
        let max = max.clamp(1, MAX_WAIT_EVENTS);
        let mut raw: [libc::epoll_event; MAX_WAIT_EVENTS] = unsafe { std::mem::zeroed() };
        let n = unsafe { libc::epoll_wait(self.epfd, raw.as_mut_ptr(), max as i32, timeout_ms) };
        if n < 0 {
            let e = last_errno();
            if e == libc::EINTR {
                return Ok(0);
            }
            return Err(RpcError::Wait(e));
        }
        for ev in raw.iter().take(n as usize) {
            let bits = ev.events;
            out.push(PollEvent {
                token: ev.u64,
                readable: bits & (libc::EPOLLIN | libc::EPOLLPRI) as u32 != 0,
                writable: bits & libc::EPOLLOUT as u32 != 0,
                hangup: bits & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0,
            });
        }
        Ok(n as usize)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, token: u64, events: u32) -> std::result::Result<(), i32> {
        let mut ev = libc::epoll_event { events, u64: token };
        let r = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if r != 0 {
            return Err(last_errno());
        }
        Ok(())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

fn interest_bits(interest: Interest) -> u32 {
    match interest {
        Interest::Read => libc::EPOLLIN as u32,
        Interest::Write => libc::EPOLLOUT as u32,
    }
}
