// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Buffered byte-stream sockets.
//!
//! A [`StreamSock`] wraps a connected, non-blocking fd with an input
//! and an output buffer. Writes land in the output buffer until it is
//! flushed; reads are served from the input buffer, which is refilled
//! in buffer-sized chunks to keep the syscall count down. Every
//! blocking step goes through `fd_wait`, so a deadline bounds the whole
//! operation and partial progress is reported when it strikes.

use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;

use thiserror::Error;
use weft::{fd_clean, fd_wait, Events};

use crate::sock::{
    local_port, set_nonblocking, sockaddr_from_std, sockaddr_to_std, SEND_FLAGS,
};

/// Size of the input and output buffers; one ethernet MTU's worth.
const BUFLEN: usize = 1500;

const LISTEN_BACKLOG: libc::c_int = 10;

#[derive(Debug, Error)]
pub enum StreamError {
    /// The deadline passed; `done` bytes were transferred before it.
    #[error("stream operation timed out after {done} bytes")]
    TimedOut { done: usize },
    /// The peer closed the connection; `done` bytes were transferred.
    #[error("connection reset by peer after {done} bytes")]
    Reset { done: usize },
    /// The destination buffer filled up before a delimiter was seen.
    #[error("no buffer space left after {done} bytes")]
    NoBufs { done: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A connected stream socket with line-/length-framed buffered I/O.
pub struct StreamSock {
    fd: RawFd,
    /// Offset of the first unread byte in `ibuf`.
    ifirst: usize,
    /// Unread bytes in `ibuf`.
    ilen: usize,
    /// Pending bytes in `obuf`.
    olen: usize,
    ibuf: Box<[u8; BUFLEN]>,
    obuf: Box<[u8; BUFLEN]>,
}

impl StreamSock {
    /// Wrap a connected fd. Takes ownership: the fd is switched to
    /// non-blocking mode and closed on drop.
    ///
    /// # Safety
    /// `fd` must be a valid, connected stream socket that nothing else
    /// closes or reads concurrently.
    pub unsafe fn from_raw_fd(fd: RawFd) -> io::Result<Self> {
        set_nonblocking(fd)?;
        Ok(Self {
            fd,
            ifirst: 0,
            ilen: 0,
            olen: 0,
            ibuf: Box::new([0; BUFLEN]),
            obuf: Box::new([0; BUFLEN]),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Queue `buf` for sending. Data is copied into the output buffer
    /// when it fits; otherwise the buffer is flushed first and payloads
    /// larger than the buffer go straight to the OS.
    pub fn send(&mut self, buf: &[u8], deadline: i64) -> Result<(), StreamError> {
        if self.olen + buf.len() <= BUFLEN {
            self.obuf[self.olen..self.olen + buf.len()].copy_from_slice(buf);
            self.olen += buf.len();
            return Ok(());
        }
        self.flush(deadline)?;
        if buf.len() <= BUFLEN {
            self.obuf[..buf.len()].copy_from_slice(buf);
            self.olen = buf.len();
            return Ok(());
        }
        // Payload longer than the buffer: send in place.
        let mut done = 0;
        while done < buf.len() {
            done += self.raw_send(&buf[done..], deadline, done)?;
        }
        Ok(())
    }

    /// Drain the output buffer to the OS.
    pub fn flush(&mut self, deadline: i64) -> Result<(), StreamError> {
        let mut pos = 0;
        while pos < self.olen {
            let chunk = unsafe {
                libc::send(
                    self.fd,
                    self.obuf[pos..].as_ptr() as *const libc::c_void,
                    self.olen - pos,
                    SEND_FLAGS,
                )
            };
            if chunk >= 0 {
                pos += chunk as usize;
                continue;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(self.reset_or_io(err, pos));
            }
            if fd_wait(self.fd, Events::OUT, deadline).is_empty() {
                // Keep whatever was not written for the next flush.
                self.obuf.copy_within(pos..self.olen, 0);
                self.olen -= pos;
                return Err(StreamError::TimedOut { done: pos });
            }
        }
        self.olen = 0;
        Ok(())
    }

    /// One raw send of the unbuffered path, waiting out EAGAIN.
    fn raw_send(
        &mut self,
        buf: &[u8],
        deadline: i64,
        done: usize,
    ) -> Result<usize, StreamError> {
        loop {
            let n = unsafe {
                libc::send(
                    self.fd,
                    buf.as_ptr() as *const libc::c_void,
                    buf.len(),
                    SEND_FLAGS,
                )
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(self.reset_or_io(err, done));
            }
            if fd_wait(self.fd, Events::OUT, deadline).is_empty() {
                return Err(StreamError::TimedOut { done });
            }
        }
    }

    fn reset_or_io(&self, err: io::Error, done: usize) -> StreamError {
        match err.raw_os_error() {
            Some(libc::ECONNRESET) | Some(libc::EPIPE) => StreamError::Reset { done },
            _ => StreamError::Io(err),
        }
    }

    /// Receive exactly `buf.len()` bytes. On deadline or peer close the
    /// error carries how many bytes made it into `buf`.
    pub fn recv(&mut self, buf: &mut [u8], deadline: i64) -> Result<(), StreamError> {
        // Served straight from the input buffer if possible.
        if self.ilen >= buf.len() {
            buf.copy_from_slice(&self.ibuf[self.ifirst..self.ifirst + buf.len()]);
            self.ifirst += buf.len();
            self.ilen -= buf.len();
            return Ok(());
        }
        // Move out whatever the buffer holds.
        let mut pos = self.ilen;
        buf[..pos].copy_from_slice(&self.ibuf[self.ifirst..self.ifirst + pos]);
        self.ifirst = 0;
        self.ilen = 0;

        loop {
            let remaining = buf.len() - pos;
            if remaining > BUFLEN {
                // Large remainder: read directly into the destination.
                let n = unsafe {
                    libc::recv(
                        self.fd,
                        buf[pos..].as_mut_ptr() as *mut libc::c_void,
                        remaining,
                        0,
                    )
                };
                match self.recv_outcome(n, pos)? {
                    Some(n) => {
                        pos += n;
                        if pos == buf.len() {
                            return Ok(());
                        }
                        continue;
                    }
                    None => {}
                }
            } else {
                // Small remainder: fill the whole input buffer so later
                // reads come for free.
                let n = unsafe {
                    libc::recv(
                        self.fd,
                        self.ibuf.as_mut_ptr() as *mut libc::c_void,
                        BUFLEN,
                        0,
                    )
                };
                match self.recv_outcome(n, pos)? {
                    Some(n) => {
                        if n < remaining {
                            buf[pos..pos + n].copy_from_slice(&self.ibuf[..n]);
                            pos += n;
                            continue;
                        }
                        buf[pos..].copy_from_slice(&self.ibuf[..remaining]);
                        self.ifirst = remaining;
                        self.ilen = n - remaining;
                        return Ok(());
                    }
                    None => {}
                }
            }
            if fd_wait(self.fd, Events::IN, deadline).is_empty() {
                return Err(StreamError::TimedOut { done: pos });
            }
        }
    }

    /// Map a recv(2) return value: `Ok(Some(n))` bytes read, `Ok(None)`
    /// would-block, errors otherwise.
    fn recv_outcome(&self, n: isize, done: usize) -> Result<Option<usize>, StreamError> {
        if n > 0 {
            return Ok(Some(n as usize));
        }
        if n == 0 {
            return Err(StreamError::Reset { done });
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(None);
        }
        Err(self.reset_or_io(err, done))
    }

    /// Receive until one of `delims` shows up; returns the number of
    /// bytes placed into `buf`, delimiter included.
    pub fn recv_until(
        &mut self,
        buf: &mut [u8],
        delims: &[u8],
        deadline: i64,
    ) -> Result<usize, StreamError> {
        for i in 0..buf.len() {
            self.recv_byte(i, buf, deadline)?;
            if delims.contains(&buf[i]) {
                return Ok(i + 1);
            }
        }
        Err(StreamError::NoBufs { done: buf.len() })
    }

    fn recv_byte(&mut self, i: usize, buf: &mut [u8], deadline: i64) -> Result<(), StreamError> {
        self.recv(&mut buf[i..i + 1], deadline).map_err(|e| match e {
            StreamError::TimedOut { .. } => StreamError::TimedOut { done: i },
            StreamError::Reset { .. } => StreamError::Reset { done: i },
            other => other,
        })
    }
}

impl Drop for StreamSock {
    fn drop(&mut self) {
        fd_clean(self.fd);
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// A listening TCP socket.
pub struct TcpListener {
    fd: RawFd,
    port: u16,
}

impl TcpListener {
    /// Bind and listen on `addr`. Port 0 picks an ephemeral port, which
    /// [`TcpListener::port`] reads back.
    pub fn listen(addr: SocketAddr) -> io::Result<Self> {
        let family = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        let fd = unsafe { libc::socket(family, libc::SOCK_STREAM, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let guard = FdGuard(fd);
        set_nonblocking(fd)?;
        let one: libc::c_int = 1;
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &one as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
        let (storage, len) = sockaddr_from_std(&addr);
        let rc = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        let rc = unsafe { libc::listen(fd, LISTEN_BACKLOG) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        let port = local_port(fd)?;
        std::mem::forget(guard);
        Ok(Self { fd, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Accept one connection, waiting up to `deadline`.
    pub fn accept(&self, deadline: i64) -> Result<(StreamSock, SocketAddr), StreamError> {
        loop {
            let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let s = unsafe {
                libc::accept(
                    self.fd,
                    &mut storage as *mut _ as *mut libc::sockaddr,
                    &mut len,
                )
            };
            if s >= 0 {
                let sock = unsafe { StreamSock::from_raw_fd(s)? };
                return Ok((sock, sockaddr_to_std(&storage)));
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(StreamError::Io(err));
            }
            if fd_wait(self.fd, Events::IN, deadline).is_empty() {
                return Err(StreamError::TimedOut { done: 0 });
            }
        }
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        fd_clean(self.fd);
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Open a TCP connection to `addr`, waiting up to `deadline` for the
/// handshake.
pub fn tcp_connect(addr: SocketAddr, deadline: i64) -> Result<StreamSock, StreamError> {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = unsafe { libc::socket(family, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(StreamError::Io(io::Error::last_os_error()));
    }
    let guard = FdGuard(fd);
    set_nonblocking(fd)?;
    let (storage, len) = sockaddr_from_std(&addr);
    let rc = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            return Err(StreamError::Io(err));
        }
        if fd_wait(fd, Events::OUT, deadline).is_empty() {
            return Err(StreamError::TimedOut { done: 0 });
        }
        // The handshake finished one way or the other; fetch the verdict.
        let mut soerr: libc::c_int = 0;
        let mut solen = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut soerr as *mut _ as *mut libc::c_void,
                &mut solen,
            )
        };
        if rc != 0 {
            return Err(StreamError::Io(io::Error::last_os_error()));
        }
        if soerr != 0 {
            return Err(StreamError::Io(io::Error::from_raw_os_error(soerr)));
        }
    }
    std::mem::forget(guard);
    unsafe { Ok(StreamSock::from_raw_fd(fd)?) }
}

/// Closes an fd unless defused; keeps the error paths above leak-free.
struct FdGuard(RawFd);

impl Drop for FdGuard {
    fn drop(&mut self) {
        fd_clean(self.0);
        unsafe {
            libc::close(self.0);
        }
    }
}
