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

//! Per-thread state and the process-wide debug state derived from it (§3).

use std::collections::HashMap;
use std::sync::Mutex;

use crate::arch::GprSnapshot;

/// Which sub-mode a single-step is being driven for (§3, §4.D). Distinct
/// from a bare user-requested single step: these variants tell the
/// dispatcher what to do when the step-complete `SIGTRAP` arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SingleStepMode {
    None,
    Watchpoint,
    Breakpoint,
    HardwareBreakpointContinue,
    SoftwareBreakpoint,
    SoftwareBreakpointContinue,
}

/// Everything the engine tracks about one traced thread.
#[derive(Debug, Clone)]
pub struct ThreadState {
    pub is_attached: bool,
    pub is_stopped: bool,
    /// Set when the thread was stopped by an explicit user request
    /// (`SIGSTOP`/group-stop) rather than hitting a breakpoint or
    /// watchpoint, so resuming it does not re-trigger break handling.
    pub stopped_by_user: bool,
    pub pending_signal: Option<i32>,
    pub single_step_mode: SingleStepMode,
    pub current_breakpoint_index: Option<usize>,
    pub current_watchpoint_index: Option<usize>,
    pub current_software_breakpoint_index: Option<usize>,
    /// The hardware-breakpoint slot index temporarily disabled on this
    /// thread while it single-steps off of it (§4.D step-over).
    pub disabled_resource_index: Option<usize>,
    pub registers: Option<GprSnapshot>,
}

impl ThreadState {
    fn new() -> ThreadState {
        ThreadState {
            is_attached: true,
            is_stopped: false,
            stopped_by_user: false,
            pending_signal: None,
            single_step_mode: SingleStepMode::None,
            current_breakpoint_index: None,
            current_watchpoint_index: None,
            current_software_breakpoint_index: None,
            disabled_resource_index: None,
            registers: None,
        }
    }

    fn clear_break_context(&mut self) {
        self.current_breakpoint_index = None;
        self.current_watchpoint_index = None;
        self.current_software_breakpoint_index = None;
        self.disabled_resource_index = None;
        self.single_step_mode = SingleStepMode::None;
    }
}

/// The process-wide state a caller observes (§3): derived from, not
/// stored alongside, the per-thread map, so it can never drift out of
/// sync with the threads it summarizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugState {
    Running,
    BreakpointHit,
    WatchpointHit,
    SingleStepping,
    Paused,
    Detached,
}

/// `tid -> ThreadState`, guarded by a single mutex held only briefly per
/// access (§3: "a single mutex, held briefly, guards the map").
pub struct ThreadStateMap {
    threads: Mutex<HashMap<u32, ThreadState>>,
}

impl ThreadStateMap {
    pub fn new() -> ThreadStateMap {
        ThreadStateMap {
            threads: Mutex::new(HashMap::new()),
        }
    }

    pub fn ensure(&self, tid: u32) {
        let mut threads = self.threads.lock().unwrap();
        threads.entry(tid).or_insert_with(ThreadState::new);
    }

    pub fn remove(&self, tid: u32) {
        self.threads.lock().unwrap().remove(&tid);
    }

    pub fn with<R>(&self, tid: u32, f: impl FnOnce(&ThreadState) -> R) -> Option<R> {
        let threads = self.threads.lock().unwrap();
        threads.get(&tid).map(f)
    }

    pub fn with_mut<R>(&self, tid: u32, f: impl FnOnce(&mut ThreadState) -> R) -> Option<R> {
        let mut threads = self.threads.lock().unwrap();
        threads.get_mut(&tid).map(f)
    }

    pub fn clear_break_context(&self, tid: u32) {
        self.with_mut(tid, |state| state.clear_break_context());
    }

    pub fn thread_ids(&self) -> Vec<u32> {
        self.threads.lock().unwrap().keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.lock().unwrap().is_empty()
    }

    /// Derive the process-wide [`DebugState`] by scanning the thread map
    /// once (§3). Breakpoint hits take priority over watchpoint hits,
    /// which take priority over a generic single-step, matching the
    /// dispatcher's own break-path precedence (§4.D).
    pub fn debug_state(&self) -> DebugState {
        let threads = self.threads.lock().unwrap();
        if threads.is_empty() {
            return DebugState::Detached;
        }

        let mut any_stopped = false;
        let mut any_single_stepping = false;
        let mut any_user_paused = false;

        for state in threads.values() {
            if !state.is_stopped {
                continue;
            }
            any_stopped = true;

            if state.current_breakpoint_index.is_some() || state.current_software_breakpoint_index.is_some() {
                return DebugState::BreakpointHit;
            }
            if state.current_watchpoint_index.is_some() {
                return DebugState::WatchpointHit;
            }
            if state.single_step_mode != SingleStepMode::None {
                any_single_stepping = true;
            }
            if state.stopped_by_user {
                any_user_paused = true;
            }
        }

        if any_single_stepping {
            DebugState::SingleStepping
        } else if any_user_paused {
            DebugState::Paused
        } else if any_stopped {
            DebugState::Paused
        } else {
            DebugState::Running
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_state_is_running_with_no_stopped_threads() {
        let map = ThreadStateMap::new();
        map.ensure(100);
        assert_eq!(map.debug_state(), DebugState::Running);
    }

    #[test]
    fn debug_state_prioritizes_breakpoint_over_watchpoint() {
        let map = ThreadStateMap::new();
        map.ensure(100);
        map.with_mut(100, |s| {
            s.is_stopped = true;
            s.current_watchpoint_index = Some(0);
        });
        assert_eq!(map.debug_state(), DebugState::WatchpointHit);

        map.with_mut(100, |s| s.current_breakpoint_index = Some(2));
        assert_eq!(map.debug_state(), DebugState::BreakpointHit);
    }

    #[test]
    fn debug_state_is_detached_once_empty() {
        let map = ThreadStateMap::new();
        map.ensure(1);
        map.remove(1);
        assert_eq!(map.debug_state(), DebugState::Detached);
    }

    #[test]
    fn clear_break_context_resets_single_step_mode() {
        let map = ThreadStateMap::new();
        map.ensure(7);
        map.with_mut(7, |s| {
            s.single_step_mode = SingleStepMode::Breakpoint;
            s.current_breakpoint_index = Some(3);
        });
        map.clear_break_context(7);
        map.with(7, |s| {
            assert_eq!(s.single_step_mode, SingleStepMode::None);
            assert_eq!(s.current_breakpoint_index, None);
        });
    }
}
