//! Non-blocking TCP socket helpers.
//!
//! The collaborator surface the dispatcher and protocols consume:
//! listen/accept on the framework side, read/write on the protocol
//! side. Everything is non-blocking; transient conditions (would-block,
//! interrupted) are distinguished from real errors in the return types
//! so callers never have to look at errno themselves.

use std::os::unix::io::RawFd;

use zrpc_core::error::{Result, RpcError};

use crate::last_errno;

/// Outcome of a single non-blocking read/write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStep {
    /// Bytes transferred.
    Data(usize),
    /// Not ready; retry after the next readiness notification.
    WouldBlock,
    /// Peer closed the connection (reads only).
    Closed,
    /// Hard error with errno.
    Error(i32),
}

/// Create a non-blocking listening socket on `0.0.0.0:port`.
pub fn tcp_listen(port: u16, backlog: i32) -> Result<RawFd> {
    unsafe {
        let fd = libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            0,
        );
        if fd < 0 {
            return Err(RpcError::Os(last_errno()));
        }

        let opt: i32 = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &opt as *const _ as *const _,
            std::mem::size_of::<i32>() as u32,
        );
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &opt as *const _ as *const _,
            std::mem::size_of::<i32>() as u32,
        );

        let mut addr: libc::sockaddr_in = std::mem::zeroed();
        addr.sin_family = libc::AF_INET as u16;
        addr.sin_addr.s_addr = 0; // INADDR_ANY
        addr.sin_port = port.to_be();

        let r = libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            std::mem::size_of_val(&addr) as u32,
        );
        if r != 0 {
            let e = last_errno();
            libc::close(fd);
            return Err(RpcError::Os(e));
        }

        if libc::listen(fd, backlog) != 0 {
            let e = last_errno();
            libc::close(fd);
            return Err(RpcError::Os(e));
        }

        Ok(fd)
    }
}

/// Accept one pending connection. `Ok(None)` means the backlog is
/// drained. Accepted sockets come back non-blocking with TCP_NODELAY
/// set.
pub fn tcp_accept(listen_fd: RawFd) -> Result<Option<RawFd>> {
    loop {
        let fd = unsafe {
            libc::accept4(
                listen_fd,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if fd >= 0 {
            unsafe {
                let opt: i32 = 1;
                libc::setsockopt(
                    fd,
                    libc::IPPROTO_TCP,
                    libc::TCP_NODELAY,
                    &opt as *const _ as *const _,
                    std::mem::size_of::<i32>() as u32,
                );
            }
            return Ok(Some(fd));
        }
        match last_errno() {
            libc::EINTR => continue,
            libc::EAGAIN => return Ok(None),
            e => return Err(RpcError::Os(e)),
        }
    }
}

/// Put an existing fd into non-blocking mode.
pub fn set_nonblocking(fd: RawFd) -> Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(RpcError::Os(last_errno()));
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(RpcError::Os(last_errno()));
        }
    }
    Ok(())
}

/// The locally bound port of a socket (useful after binding port 0).
pub fn local_port(fd: RawFd) -> Result<u16> {
    unsafe {
        let mut addr: libc::sockaddr_in = std::mem::zeroed();
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let r = libc::getsockname(fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len);
        if r != 0 {
            return Err(RpcError::Os(last_errno()));
        }
        Ok(u16::from_be(addr.sin_port))
    }
}

/// One non-blocking read attempt.
pub fn tcp_read(fd: RawFd, buf: &mut [u8]) -> IoStep {
    loop {
        let r = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if r > 0 {
            return IoStep::Data(r as usize);
        }
        if r == 0 {
            return IoStep::Closed;
        }
        match last_errno() {
            libc::EINTR => continue,
            libc::EAGAIN => return IoStep::WouldBlock,
            e => return IoStep::Error(e),
        }
    }
}

/// One non-blocking write attempt.
pub fn tcp_write(fd: RawFd, buf: &[u8]) -> IoStep {
    loop {
        let r = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if r > 0 {
            return IoStep::Data(r as usize);
        }
        if r == 0 {
            return IoStep::WouldBlock;
        }
        match last_errno() {
            libc::EINTR => continue,
            libc::EAGAIN => return IoStep::WouldBlock,
            e => return IoStep::Error(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::Duration;

    fn close(fd: RawFd) {
        unsafe {
            libc::close(fd);
        }
    }

    #[test]
    fn listen_on_ephemeral_port() {
        let fd = tcp_listen(0, 16).unwrap();
        let port = local_port(fd).unwrap();
        assert!(port > 0);
        close(fd);
    }

    #[test]
    fn accept_drains_to_none() {
        let fd = tcp_listen(0, 16).unwrap();
        assert_eq!(tcp_accept(fd).unwrap(), None);
        close(fd);
    }

    #[test]
    fn loopback_round_trip() {
        let listen = tcp_listen(0, 16).unwrap();
        let port = local_port(listen).unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        // Accept may observe the connection a beat after connect returns.
        let conn = {
            let mut conn = None;
            for _ in 0..100 {
                if let Some(fd) = tcp_accept(listen).unwrap() {
                    conn = Some(fd);
                    break;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            conn.expect("no connection accepted")
        };

        // Nothing sent yet: the non-blocking read reports would-block.
        let mut buf = [0u8; 64];
        assert_eq!(tcp_read(conn, &mut buf), IoStep::WouldBlock);

        client.write_all(b"ping").unwrap();
        let got = loop {
            match tcp_read(conn, &mut buf) {
                IoStep::Data(n) => break n,
                IoStep::WouldBlock => std::thread::sleep(Duration::from_millis(5)),
                other => panic!("unexpected read outcome: {:?}", other),
            }
        };
        assert_eq!(&buf[..got], b"ping");

        assert_eq!(tcp_write(conn, b"pong"), IoStep::Data(4));
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"pong");

        // Client hangup surfaces as Closed.
        drop(client);
        let closed = loop {
            match tcp_read(conn, &mut buf) {
                IoStep::Closed => break true,
                IoStep::WouldBlock => std::thread::sleep(Duration::from_millis(5)),
                IoStep::Data(_) => continue,
                IoStep::Error(_) => break true,
            }
        };
        assert!(closed);

        close(conn);
        close(listen);
    }
}
