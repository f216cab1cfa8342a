// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Operational errors of the runtime core.
//!
//! Contract violations (double fd waiters, sends to a done channel and
//! the like) are not errors: they panic with a diagnostic instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A task stack could not be allocated.
    #[error("not enough memory to allocate a task stack")]
    OutOfMemory,
    /// The operation needs a quiescent runtime but tasks are running.
    #[error("tasks are already running")]
    Busy,
    /// An operating system call failed.
    #[error(transparent)]
    Os(#[from] std::io::Error),
}
