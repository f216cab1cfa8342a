// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Single-threaded cooperative concurrency runtime.
//!
//! Go-style stackful tasks, typed channels with a multi-way `choose`,
//! and a poller that folds timers and fd readiness into task
//! resumptions. One runtime per OS thread; everything on it is
//! cooperative and nothing in it is thread-safe by design.
//!
//! Components:
//! - `sched`  — ready queue, spawn/yield, context switching, fork
//! - `chan`   — typed channels: send/recv/done, refcounted handles
//! - `choose` — multi-way selection with otherwise/deadline branches
//! - `poller` — fd readiness (`fd_wait`), sleeping, backend selection
//! - `timer`  — deadline list and the monotonic clock
//!
//! ```no_run
//! use weft::{spawn, Chan};
//!
//! let ch: Chan<i32> = Chan::new(0);
//! let tx = ch.clone();
//! spawn(move || {
//!     let v = tx.recv();
//!     tx.send(v + 1);
//! })
//! .unwrap();
//! ch.send(1);
//! assert_eq!(ch.recv(), 2);
//! ```

pub mod chan;
pub mod choose;
mod ctx;
mod error;
mod list;
pub mod poller;
pub mod sched;
mod stack;
mod task;
pub mod timer;

pub use chan::Chan;
pub use choose::Choose;
pub use error::Error;
pub use poller::{fd_clean, fd_wait, msleep, Events};
pub use sched::{fork, prepare, set_task_local, spawn, task_local, yield_now, ForkResult};
pub use task::TaskId;
pub use timer::now;
