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

//! The OS bridge (§4.A): a capability set, not a class hierarchy. A tagged
//! enum over the two supported platforms stands in for virtual dispatch
//! (§9 "collapses to a tagged `OsBridge` variant").

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(target_os = "macos")]
pub mod darwin;

use crate::arch::{Architecture, GprSnapshot};
use crate::error::EngineResult;

/// Debug-register state, architecture-tagged (§4.A `get_debug_regs`).
#[derive(Debug, Clone)]
pub enum DebugRegs {
    Aarch64 {
        bp_control: [u64; 16],
        bp_value: [u64; 16],
        wp_control: [u64; 16],
        wp_value: [u64; 16],
        mdscr: u64,
    },
    X86_64 {
        dr0: u64,
        dr1: u64,
        dr2: u64,
        dr3: u64,
        dr6: u64,
        dr7: u64,
    },
}

/// The decoded result of one `wait_event` call (§4.A).
#[derive(Debug, Clone)]
pub enum StopEvent {
    Stopped { signal: i32, extra: StopExtra },
    SingleStepped,
    Clone { new_tid: u32 },
    GroupStoppedByInterrupt,
    Exited { status: i32 },
    Signalled { signal: i32 },
}

/// Additional detail carried alongside a `Stopped` event that the
/// dispatcher needs to disambiguate a `SIGTRAP` (§4.D).
#[derive(Debug, Clone, Default)]
pub struct StopExtra {
    pub fault_address: Option<u64>,
    pub dr6: Option<u64>,
    /// Exception Class bits extracted from `ESR` on the Darwin path
    /// (§4.D: `0x3C` BRK, `0x30`/`0x31` hardware BP, `0x34`/`0x35`
    /// watchpoint, `0x32`/`0x33` software step).
    pub exception_class: Option<u32>,
}

/// A process/task handle owned exclusively by the engine between attach
/// and detach (§3 "Process handle").
pub struct ProcessHandle {
    pub pid: u32,
    #[cfg(target_os = "macos")]
    pub task_port: darwin::TaskPort,
}

/// The tagged OS-bridge variant (§9).
pub enum OsBridge {
    #[cfg(target_os = "linux")]
    Linux(linux::LinuxBridge),
    #[cfg(target_os = "macos")]
    Darwin(darwin::DarwinBridge),
}

impl OsBridge {
    pub fn for_host() -> OsBridge {
        #[cfg(target_os = "linux")]
        {
            OsBridge::Linux(linux::LinuxBridge::new())
        }
        #[cfg(target_os = "macos")]
        {
            OsBridge::Darwin(darwin::DarwinBridge::new())
        }
        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        {
            compile_error!("ddbg-engine supports only Linux and Darwin targets");
        }
    }

    pub fn attach(&mut self, pid: u32) -> EngineResult<ProcessHandle> {
        match self {
            #[cfg(target_os = "linux")]
            OsBridge::Linux(b) => b.attach(pid),
            #[cfg(target_os = "macos")]
            OsBridge::Darwin(b) => b.attach(pid),
        }
    }

    pub fn detach(&mut self, handle: &ProcessHandle) -> EngineResult<()> {
        match self {
            #[cfg(target_os = "linux")]
            OsBridge::Linux(b) => b.detach(handle),
            #[cfg(target_os = "macos")]
            OsBridge::Darwin(b) => b.detach(handle),
        }
    }

    pub fn suspend(&self, tid: u32) -> EngineResult<()> {
        match self {
            #[cfg(target_os = "linux")]
            OsBridge::Linux(b) => b.suspend(tid),
            #[cfg(target_os = "macos")]
            OsBridge::Darwin(b) => b.suspend(tid),
        }
    }

    pub fn resume(&self, tid: u32, signal: i32) -> EngineResult<()> {
        match self {
            #[cfg(target_os = "linux")]
            OsBridge::Linux(b) => b.resume(tid, signal),
            #[cfg(target_os = "macos")]
            OsBridge::Darwin(b) => b.resume(tid, signal),
        }
    }

    pub fn single_step(&self, tid: u32, signal: i32) -> EngineResult<()> {
        match self {
            #[cfg(target_os = "linux")]
            OsBridge::Linux(b) => b.single_step(tid, signal),
            #[cfg(target_os = "macos")]
            OsBridge::Darwin(b) => b.single_step(tid, signal),
        }
    }

    pub fn read_memory(&self, pid: u32, addr: u64, len: usize) -> EngineResult<Vec<u8>> {
        match self {
            #[cfg(target_os = "linux")]
            OsBridge::Linux(b) => b.read_memory(pid, addr, len),
            #[cfg(target_os = "macos")]
            OsBridge::Darwin(b) => b.read_memory(pid, addr, len),
        }
    }

    pub fn write_memory(&self, pid: u32, addr: u64, bytes: &[u8]) -> EngineResult<()> {
        match self {
            #[cfg(target_os = "linux")]
            OsBridge::Linux(b) => b.write_memory(pid, addr, bytes),
            #[cfg(target_os = "macos")]
            OsBridge::Darwin(b) => b.write_memory(pid, addr, bytes),
        }
    }

    pub fn get_gprs(&self, tid: u32, architecture: Architecture) -> EngineResult<GprSnapshot> {
        match self {
            #[cfg(target_os = "linux")]
            OsBridge::Linux(b) => b.get_gprs(tid, architecture),
            #[cfg(target_os = "macos")]
            OsBridge::Darwin(b) => b.get_gprs(tid, architecture),
        }
    }

    pub fn set_gprs(&self, tid: u32, regs: &GprSnapshot) -> EngineResult<()> {
        match self {
            #[cfg(target_os = "linux")]
            OsBridge::Linux(b) => b.set_gprs(tid, regs),
            #[cfg(target_os = "macos")]
            OsBridge::Darwin(b) => b.set_gprs(tid, regs),
        }
    }

    pub fn get_debug_regs(&self, tid: u32, architecture: Architecture) -> EngineResult<DebugRegs> {
        match self {
            #[cfg(target_os = "linux")]
            OsBridge::Linux(b) => b.get_debug_regs(tid, architecture),
            #[cfg(target_os = "macos")]
            OsBridge::Darwin(b) => b.get_debug_regs(tid, architecture),
        }
    }

    pub fn set_debug_regs(&self, tid: u32, regs: &DebugRegs) -> EngineResult<()> {
        match self {
            #[cfg(target_os = "linux")]
            OsBridge::Linux(b) => b.set_debug_regs(tid, regs),
            #[cfg(target_os = "macos")]
            OsBridge::Darwin(b) => b.set_debug_regs(tid, regs),
        }
    }

    pub fn wait_event(&self) -> EngineResult<Option<(u32, StopEvent)>> {
        match self {
            #[cfg(target_os = "linux")]
            OsBridge::Linux(b) => b.wait_event(),
            #[cfg(target_os = "macos")]
            OsBridge::Darwin(b) => b.wait_event(),
        }
    }
}
