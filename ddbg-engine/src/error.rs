/*
    ddbg  -  a native process debugging engine
    Copyright (C) 2026  ddbg contributors

    This program is free software: you can redistribute it and/or modify it
    under the terms of the GNU General Public License as published by the
    Free Software Foundation, either version 3 of the License, or (at your
    option) any later version.

    This program is distributed in the hope that it will be useful, but
    WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License
    for more details.

    You should have received a copy of the GNU General Public License along
    with this program. If not, see <https://www.gnu.org/licenses/>.
*/

use std::io;

/// The error taxonomy for every request-enqueue command the engine exposes.
///
/// Variants correspond one-to-one with the kinds named in the engine's
/// error-handling design: each is surfaced through the request-completion
/// path rather than aborting the event loop.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to attach to pid {pid}: {reason}")]
    AttachFailed { pid: u32, reason: String },

    #[error("no free slots of the requested kind")]
    OutOfSlots,

    #[error("no breakpoint or watchpoint armed at address {0:#x}")]
    NotFound(u64),

    #[error("thread {0} is not in a break state")]
    NotInBreakState(u32),

    #[error("thread {0} is not stopped")]
    NotStopped(u32),

    #[error("unknown register name {0:?}")]
    UnknownRegister(String),

    #[error("memory access at {address:#x} ({len} bytes) faulted")]
    MemoryFault { address: u64, len: usize },

    #[error("timed out waiting for in-flight hit handlers on slot {0}")]
    Timeout(usize),

    #[error("the operation was cancelled")]
    Cancelled,

    #[error("the engine is detached")]
    Detached,

    #[error("OS error: {0}")]
    OsError(#[from] io::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    /// Build an `OsError` from the current value of `errno`, the same
    /// convention the teacher's `ptrace` module uses via `strerror`, but
    /// surfaced as a typed `io::Error` rather than a formatted string.
    pub fn from_errno() -> EngineError {
        EngineError::OsError(io::Error::last_os_error())
    }
}
