// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Datagram (UDP) sockets.
//!
//! Stateless: one send or recv maps to one syscall. Sends are
//! fire-and-forget; a full kernel buffer silently drops the datagram,
//! which is what UDP promises anyway. Receives block through `fd_wait`
//! with the usual deadline contract.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::fd::RawFd;

use thiserror::Error;
use weft::{fd_clean, fd_wait, Events};

use crate::sock::{local_port, set_nonblocking, sockaddr_from_std, sockaddr_to_std, SEND_FLAGS};

#[derive(Debug, Error)]
pub enum DgramError {
    #[error("datagram receive timed out")]
    TimedOut,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A bound UDP socket.
pub struct DgramSock {
    fd: RawFd,
    port: u16,
}

impl DgramSock {
    /// Bind a datagram socket to `addr`. Port 0 picks an ephemeral
    /// port, readable through [`DgramSock::port`].
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let family = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        let fd = unsafe { libc::socket(family, libc::SOCK_DGRAM, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        if let Err(e) = set_nonblocking(fd) {
            unsafe { libc::close(fd) };
            return Err(e);
        }
        let (storage, len) = sockaddr_from_std(&addr);
        let rc = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) };
        if rc != 0 {
            let e = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(e);
        }
        let port = match local_port(fd) {
            Ok(p) => p,
            Err(e) => {
                fd_clean(fd);
                unsafe { libc::close(fd) };
                return Err(e);
            }
        };
        Ok(Self { fd, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Send one datagram to `addr`. A datagram the kernel has no room
    /// for is dropped silently.
    pub fn send(&self, addr: SocketAddr, buf: &[u8]) -> io::Result<()> {
        let (storage, len) = sockaddr_from_std(&addr);
        let rc = unsafe {
            libc::sendto(
                self.fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                SEND_FLAGS,
                &storage as *const _ as *const libc::sockaddr,
                len,
            )
        };
        if rc == buf.len() as isize {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(());
        }
        Err(err)
    }

    /// Receive one datagram, waiting up to `deadline`. Returns the
    /// payload length and the sender's address.
    pub fn recv(&self, buf: &mut [u8], deadline: i64) -> Result<(usize, SocketAddr), DgramError> {
        loop {
            let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
            let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let n = unsafe {
                libc::recvfrom(
                    self.fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    0,
                    &mut storage as *mut _ as *mut libc::sockaddr,
                    &mut len,
                )
            };
            if n >= 0 {
                return Ok((n as usize, sockaddr_to_std(&storage)));
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(DgramError::Io(err));
            }
            if fd_wait(self.fd, Events::IN, deadline).is_empty() {
                return Err(DgramError::TimedOut);
            }
        }
    }
}

impl Drop for DgramSock {
    fn drop(&mut self) {
        fd_clean(self.fd);
        unsafe {
            libc::close(self.fd);
        }
    }
}
