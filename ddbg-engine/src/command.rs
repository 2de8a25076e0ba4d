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

//! The request-enqueue command queue (§5, §6). Every public engine
//! operation is a command pushed onto a bounded FIFO; the event-loop
//! thread drains it between stop events and replies on a per-request
//! completion channel.

use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Mutex;

use crate::error::{EngineError, EngineResult};
use crate::signal_policy::SignalDisposition;
use crate::slots::WatchpointKind;

#[derive(Debug, Clone)]
pub enum Command {
    Attach { pid: u32 },
    Detach,
    SetHwBreakpoint { addr: u64, target_count: u64, end_addr: u64 },
    SetSwBreakpoint { addr: u64, target_count: u64 },
    RemoveBreakpoint { addr: u64 },
    SetWatchpoint { addr: u64, size: u8, kind: WatchpointKind },
    RemoveWatchpoint { addr: u64 },
    Pause { tid: u32 },
    Continue { tid: u32 },
    SingleStep { tid: u32 },
    ReadRegister { tid: u32, name: String },
    WriteRegister { tid: u32, name: String, value: u64 },
    ReadMemory { addr: u64, len: usize },
    WriteMemory { addr: u64, bytes: Vec<u8> },
    EnableTraceFile { path: String },
    DisableTraceFile,
    EnableFullMemoryCache { dump_path: String, log_path: String },
    DisableFullMemoryCache,
    RequestTraceStop { notify_ui: bool },
    SetSignalPolicy { signal: i32, disposition: SignalDisposition },
    GetSignalPolicy { signal: i32 },
    RemoveSignalPolicy { signal: i32 },
    Shutdown,
}

#[derive(Debug, Clone)]
pub enum CommandResponse {
    Ok,
    Slot(usize),
    Value(u64),
    Bytes(Vec<u8>),
    Disposition(SignalDisposition),
}

struct CommandRequest {
    command: Command,
    reply: mpsc::Sender<EngineResult<CommandResponse>>,
}

/// The producer side handed to every external caller; cheap to clone
/// (wraps a `SyncSender`, per std's own guidance for multi-producer use).
#[derive(Clone)]
pub struct CommandSender {
    sender: SyncSender<CommandRequest>,
}

impl CommandSender {
    /// Enqueue `command` and block until the event loop replies (§5:
    /// "the caller pushes a request onto a bounded FIFO, blocks on a
    /// per-request completion condition").
    pub fn submit(&self, command: Command) -> EngineResult<CommandResponse> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.sender
            .send(CommandRequest { command, reply: reply_tx })
            .map_err(|_| EngineError::Detached)?;
        reply_rx.recv().map_err(|_| EngineError::Cancelled)?
    }
}

pub struct QueuedRequest {
    pub command: Command,
    reply: mpsc::Sender<EngineResult<CommandResponse>>,
}

impl QueuedRequest {
    pub fn complete(self, result: EngineResult<CommandResponse>) {
        let _ = self.reply.send(result);
    }
}

/// The consumer side, owned by the event-loop thread.
pub struct CommandQueue {
    receiver: Mutex<Receiver<CommandRequest>>,
}

impl CommandQueue {
    /// `depth` bounds the FIFO (§5); a full queue blocks the submitting
    /// caller rather than growing without limit.
    pub fn new(depth: usize) -> (CommandSender, CommandQueue) {
        let (sender, receiver) = mpsc::sync_channel(depth.max(1));
        (CommandSender { sender }, CommandQueue { receiver: Mutex::new(receiver) })
    }

    /// Drain one request without blocking, for use between stop events.
    pub fn try_recv(&self) -> Option<QueuedRequest> {
        let receiver = self.receiver.lock().unwrap();
        receiver.try_recv().ok().map(|r| QueuedRequest { command: r.command, reply: r.reply })
    }
}
