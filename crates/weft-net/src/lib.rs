// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Blocking-style network I/O on top of the `weft` runtime.
//!
//! These types look synchronous but never block the thread: every wait
//! goes through the runtime's `fd_wait`, so other tasks keep running.
//!
//! Components:
//! - `stream` — buffered byte-stream sockets + TCP listen/connect glue
//! - `dgram`  — UDP datagram sockets
//! - `sock`   — non-blocking tuning and sockaddr conversions

pub mod dgram;
pub mod sock;
pub mod stream;

pub use dgram::{DgramError, DgramSock};
pub use stream::{tcp_connect, StreamError, StreamSock, TcpListener};
