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

//! The top-level engine (§2, §5, §6): owns every table, spawns the
//! dedicated event-loop thread, and exposes the public command set
//! through a [`CommandSender`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};

use crate::arch::{Architecture, GprSnapshot};
use crate::command::{Command, CommandQueue, CommandResponse, CommandSender, QueuedRequest};
use crate::disasm::{InstructionDecoder, NoopDecoder};
use crate::dispatcher;
use crate::error::{EngineError, EngineResult};
use crate::os::{OsBridge, ProcessHandle};
use crate::signal_policy::{SignalDisposition, SignalPolicyTable};
use crate::slots::{self, HwBreakpointTable, SwBreakpointTable, WatchpointKind, WatchpointTable};
use crate::state::ThreadStateMap;
use crate::trace::TraceRecorder;

/// Configuration fixed at construction time (§9: "two function pointers
/// held in a single configuration object, set once at engine
/// construction; no run-time search needed").
pub struct EngineConfig {
    /// Returns `true` to report a hit to the caller, `false` to take the
    /// silent-continue path (§4.D, §1.e).
    pub should_break: Box<dyn Fn(&GprSnapshot) -> bool + Send + Sync>,
    pub disassembler: Box<dyn InstructionDecoder>,
    /// Enumerates readable memory regions for a pid as `(start, length,
    /// protection)`. Region enumeration itself is out of scope (§1); this
    /// is the same single-function plug-in shape as `disassembler`.
    pub region_provider: Box<dyn Fn(u32) -> Vec<(u64, u64, u32)> + Send + Sync>,
    pub initial_signal_policy: Vec<(i32, SignalDisposition)>,
    pub queue_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> EngineConfig {
        EngineConfig {
            should_break: Box::new(|_| true),
            disassembler: Box::new(NoopDecoder),
            region_provider: Box::new(|_| Vec::new()),
            initial_signal_policy: Vec::new(),
            queue_depth: 64,
        }
    }
}

pub(crate) struct Engine {
    pub(crate) os: OsBridge,
    pub(crate) process: Option<ProcessHandle>,
    pub(crate) architecture: Architecture,
    pub(crate) hw_table: HwBreakpointTable,
    pub(crate) sw_table: SwBreakpointTable,
    pub(crate) wp_table: WatchpointTable,
    /// `(hit_count, target_count)` per software-breakpoint slot; kept
    /// outside `SwBreakpointSlot` because §3 only lists `original_bytes`
    /// as slot data, but §4.B's trace-mode behavior still needs counts.
    pub(crate) sw_counters: Mutex<HashMap<usize, (u64, u64)>>,
    pub(crate) threads: ThreadStateMap,
    pub(crate) signals: SignalPolicyTable,
    pub(crate) trace: TraceRecorder,
    pub(crate) config: EngineConfig,
    /// 0 = unclaimed; otherwise `tid + 1` (§4.D "tracked-trace-thread").
    pub(crate) tracked_trace_thread: AtomicU32,
    pub(crate) trace_ended_by_end_address: AtomicBool,
    /// Set by an explicit pause request, consumed (take-semantics) by the
    /// next `SIGSTOP`/`SIGTSTP` the dispatcher observes (§4.D).
    pub(crate) user_suspend_pending: AtomicBool,
    shutdown: AtomicBool,
}

impl Engine {
    fn new(config: EngineConfig) -> Engine {
        let signals = SignalPolicyTable::new();
        for (signal, disposition) in &config.initial_signal_policy {
            signals.set(*signal, *disposition);
        }

        Engine {
            os: OsBridge::for_host(),
            process: None,
            architecture: Architecture::host(),
            hw_table: HwBreakpointTable::new(),
            sw_table: SwBreakpointTable::new(),
            wp_table: WatchpointTable::new(),
            sw_counters: Mutex::new(HashMap::new()),
            threads: ThreadStateMap::new(),
            signals,
            trace: TraceRecorder::new(),
            config,
            tracked_trace_thread: AtomicU32::new(0),
            trace_ended_by_end_address: AtomicBool::new(false),
            user_suspend_pending: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        }
    }

    fn handle_command(&mut self, request: QueuedRequest) {
        let result = self.dispatch_command(request.command.clone());
        if matches!(request.command, Command::Shutdown) {
            self.shutdown.store(true, Ordering::SeqCst);
        }
        request.complete(result);
    }

    fn dispatch_command(&mut self, command: Command) -> EngineResult<CommandResponse> {
        match command {
            Command::Attach { pid } => {
                self.attach(pid)?;
                Ok(CommandResponse::Ok)
            }
            Command::Detach => {
                self.detach()?;
                Ok(CommandResponse::Ok)
            }
            Command::SetHwBreakpoint { addr, target_count, end_addr } => {
                Ok(CommandResponse::Slot(self.set_hw_breakpoint(addr, target_count, end_addr)?))
            }
            Command::SetSwBreakpoint { addr, target_count } => {
                Ok(CommandResponse::Slot(self.set_sw_breakpoint(addr, target_count)?))
            }
            Command::RemoveBreakpoint { addr } => {
                self.remove_breakpoint(addr)?;
                Ok(CommandResponse::Ok)
            }
            Command::SetWatchpoint { addr, size, kind } => {
                Ok(CommandResponse::Slot(self.set_watchpoint(addr, size, kind)?))
            }
            Command::RemoveWatchpoint { addr } => {
                self.remove_watchpoint(addr)?;
                Ok(CommandResponse::Ok)
            }
            Command::Pause { tid } => {
                self.pause(tid)?;
                Ok(CommandResponse::Ok)
            }
            Command::Continue { tid } => {
                self.continue_execution(tid)?;
                Ok(CommandResponse::Ok)
            }
            Command::SingleStep { tid } => {
                self.single_step(tid)?;
                Ok(CommandResponse::Ok)
            }
            Command::ReadRegister { tid, name } => Ok(CommandResponse::Value(self.read_register(tid, &name)?)),
            Command::WriteRegister { tid, name, value } => {
                self.write_register(tid, &name, value)?;
                Ok(CommandResponse::Ok)
            }
            Command::ReadMemory { addr, len } => Ok(CommandResponse::Bytes(self.read_memory(addr, len)?)),
            Command::WriteMemory { addr, bytes } => {
                self.write_memory(addr, &bytes)?;
                Ok(CommandResponse::Ok)
            }
            Command::EnableTraceFile { path } => {
                self.trace.enable(&path, self.architecture)?;
                Ok(CommandResponse::Ok)
            }
            Command::DisableTraceFile => {
                self.trace.disable();
                Ok(CommandResponse::Ok)
            }
            Command::EnableFullMemoryCache { dump_path, log_path } => {
                self.trace.enable_full_memory_cache(&dump_path, &log_path)?;
                Ok(CommandResponse::Ok)
            }
            Command::DisableFullMemoryCache => {
                self.trace.disable_full_memory_cache();
                Ok(CommandResponse::Ok)
            }
            Command::RequestTraceStop { notify_ui } => {
                self.trace.request_stop(notify_ui);
                Ok(CommandResponse::Ok)
            }
            Command::SetSignalPolicy { signal, disposition } => {
                self.signals.set(signal, disposition);
                Ok(CommandResponse::Ok)
            }
            Command::GetSignalPolicy { signal } => Ok(CommandResponse::Disposition(self.signals.get(signal))),
            Command::RemoveSignalPolicy { signal } => {
                self.signals.remove(signal);
                Ok(CommandResponse::Ok)
            }
            Command::Shutdown => Ok(CommandResponse::Ok),
        }
    }

    fn attach(&mut self, pid: u32) -> EngineResult<()> {
        let handle = self.os.attach(pid)?;
        self.threads.ensure(pid);
        self.process = Some(handle);
        Ok(())
    }

    fn detach(&mut self) -> EngineResult<()> {
        if let Some(handle) = self.process.take() {
            self.os.detach(&handle)?;
        }
        for tid in self.threads.thread_ids() {
            self.threads.remove(tid);
        }
        Ok(())
    }

    pub(crate) fn pid(&self) -> EngineResult<u32> {
        self.process.as_ref().map(|h| h.pid).ok_or(EngineError::Detached)
    }

    /// Request that `tid` stop (§4.D: "if `user_suspend_pending` is set,
    /// mark `stopped_by_user=true`"). The flag is consumed by the next
    /// `SIGSTOP`/`SIGTSTP` the dispatcher observes for any thread.
    fn pause(&mut self, tid: u32) -> EngineResult<()> {
        self.user_suspend_pending.store(true, Ordering::SeqCst);
        self.os.suspend(tid)
    }

    /// Arm every currently-armed hardware breakpoint on a freshly cloned
    /// thread (§8 scenario S6).
    pub(crate) fn arm_existing_breakpoints_on_new_thread(&self, tid: u32) {
        for (index, slot) in self.hw_table.in_use_slots() {
            if let Err(err) = self.arm_hw_slot_on_thread(tid, index, slot.address) {
                log::warn!("failed to arm hardware breakpoint {index} on new thread {tid}: {err}");
            }
        }
        if let Err(err) = self.rearm_watchpoint_bank_on_thread(tid) {
            log::warn!("failed to arm watchpoints on new thread {tid}: {err}");
        }
    }

    /// Arming an address already armed elsewhere first clears the
    /// existing slot, which keeps invariant 1 (slot-uniqueness, §3)
    /// without inventing an error kind the taxonomy in §7 doesn't name.
    fn clear_any_existing_slot(&mut self, addr: u64) -> EngineResult<()> {
        if slots::address_is_armed(&self.hw_table, &self.sw_table, &self.wp_table, addr) {
            self.remove_breakpoint(addr).or_else(|_| self.remove_watchpoint(addr))?;
        }
        Ok(())
    }

    fn set_hw_breakpoint(&mut self, addr: u64, target_count: u64, end_addr: u64) -> EngineResult<usize> {
        self.clear_any_existing_slot(addr)?;
        let index = self.hw_table.allocate(addr, target_count, end_addr)?;
        for tid in self.threads.thread_ids() {
            self.arm_hw_slot_on_thread(tid, index, addr)?;
        }
        self.tracked_trace_thread.store(0, Ordering::SeqCst);
        self.trace_ended_by_end_address.store(false, Ordering::SeqCst);
        Ok(index)
    }

    pub(crate) fn arm_hw_slot_on_thread(&self, tid: u32, index: usize, addr: u64) -> EngineResult<()> {
        if self.architecture == Architecture::X86_64 && index >= 4 {
            return Err(EngineError::OutOfSlots);
        }
        let mut regs = self.os.get_debug_regs(tid, self.architecture)?;
        match &mut regs {
            crate::os::DebugRegs::Aarch64 { bp_control, bp_value, .. } => {
                bp_value[index] = addr;
                bp_control[index] = crate::arch::aarch64::HW_BP_CONTROL_WORD;
            }
            crate::os::DebugRegs::X86_64 { dr0, dr1, dr2, dr3, dr7, .. } => {
                let slot_addr = match index {
                    0 => dr0,
                    1 => dr1,
                    2 => dr2,
                    _ => dr3,
                };
                *slot_addr = addr;
                *dr7 = crate::arch::x86_64::dr7_set_slot(*dr7, index, 1, crate::arch::x86_64::DrCondition::Execute);
            }
        }
        self.os.set_debug_regs(tid, &regs)
    }

    pub(crate) fn clear_hw_slot_on_thread(&self, tid: u32, index: usize) -> EngineResult<()> {
        let mut regs = self.os.get_debug_regs(tid, self.architecture)?;
        match &mut regs {
            crate::os::DebugRegs::Aarch64 { bp_control, bp_value, .. } => {
                bp_control[index] = 0;
                bp_value[index] = 0;
            }
            crate::os::DebugRegs::X86_64 { dr7, .. } => {
                *dr7 = crate::arch::x86_64::dr7_clear_slot(*dr7, index);
            }
        }
        self.os.set_debug_regs(tid, &regs)
    }

    fn set_sw_breakpoint(&mut self, addr: u64, target_count: u64) -> EngineResult<usize> {
        self.clear_any_existing_slot(addr)?;
        let pid = self.pid()?;
        let original = self.os.read_memory(pid, addr, 4)?;
        let mut original_bytes = [0u8; 4];
        original_bytes[..original.len().min(4)].copy_from_slice(&original[..original.len().min(4)]);

        let trap = self.architecture.trap_instruction();
        self.os.write_memory(pid, addr, trap)?;

        let index = self.sw_table.allocate(addr, original_bytes)?;
        self.sw_counters.lock().unwrap().insert(index, (0, target_count));
        Ok(index)
    }

    fn remove_breakpoint(&mut self, addr: u64) -> EngineResult<()> {
        if let Some(index) = self.sw_table.find_by_address(addr) {
            let slot = self.sw_table.get(index);
            let pid = self.pid()?;
            let trap_len = self.architecture.trap_instruction().len();
            self.os.write_memory(pid, addr, &slot.original_bytes[..trap_len])?;
            self.sw_table.clear(index);
            self.sw_counters.lock().unwrap().remove(&index);
            return Ok(());
        }

        if let Some(index) = self.hw_table.find_by_address(addr) {
            self.hw_table.remove(index);
            for tid in self.threads.thread_ids() {
                self.clear_hw_slot_on_thread(tid, index)?;
            }
            return Ok(());
        }

        Err(EngineError::NotFound(addr))
    }

    pub(crate) fn running_thread_ids(&self) -> Vec<u32> {
        self.threads
            .thread_ids()
            .into_iter()
            .filter(|&tid| self.threads.with(tid, |s| !s.is_stopped).unwrap_or(true))
            .collect()
    }

    /// Re-derive the full watchpoint bank from every in-use slot and push
    /// it to `tid` (§4.B: the bank is reprogrammed as a whole).
    pub(crate) fn rearm_watchpoint_bank_on_thread(&self, tid: u32) -> EngineResult<()> {
        let mut regs = self.os.get_debug_regs(tid, self.architecture)?;
        match &mut regs {
            crate::os::DebugRegs::Aarch64 { wp_control, wp_value, .. } => {
                *wp_control = [0; 16];
                *wp_value = [0; 16];
                for (index, slot) in self.wp_table.in_use_slots() {
                    wp_value[index] = slot.address;
                    wp_control[index] = crate::arch::aarch64::encode_watchpoint_control(
                        slot.size,
                        slot.kind.catches_read(),
                        slot.kind.catches_write(),
                    );
                }
            }
            crate::os::DebugRegs::X86_64 { dr0, dr1, dr2, dr3, dr7, .. } => {
                *dr7 = 0;
                for (index, slot) in self.wp_table.in_use_slots() {
                    let target = match index {
                        0 => dr0,
                        1 => dr1,
                        2 => dr2,
                        _ => dr3,
                    };
                    *target = slot.address;
                    let condition = if slot.kind.catches_write() {
                        crate::arch::x86_64::DrCondition::Write
                    } else {
                        crate::arch::x86_64::DrCondition::ReadWrite
                    };
                    *dr7 = crate::arch::x86_64::dr7_set_slot(*dr7, index, slot.size, condition);
                }
            }
        }
        self.os.set_debug_regs(tid, &regs)
    }

    fn set_watchpoint(&mut self, addr: u64, size: u8, kind: WatchpointKind) -> EngineResult<usize> {
        self.clear_any_existing_slot(addr)?;
        let running = self.running_thread_ids();
        for tid in self.threads.thread_ids() {
            self.os.suspend(tid)?;
        }

        let index = self.wp_table.allocate(addr, size, kind)?;
        for tid in self.threads.thread_ids() {
            self.rearm_watchpoint_bank_on_thread(tid)?;
        }

        for tid in running {
            self.os.resume(tid, 0)?;
        }
        Ok(index)
    }

    fn remove_watchpoint(&mut self, addr: u64) -> EngineResult<()> {
        let index = self.wp_table.find_by_address(addr).ok_or(EngineError::NotFound(addr))?;
        let running = self.running_thread_ids();
        for tid in self.threads.thread_ids() {
            self.os.suspend(tid)?;
        }

        self.wp_table.remove(index);
        for tid in self.threads.thread_ids() {
            self.rearm_watchpoint_bank_on_thread(tid)?;
        }

        for tid in running {
            self.os.resume(tid, 0)?;
        }
        Ok(())
    }

    /// External `continue_execution` (§4.D): may require the step-over
    /// dance if a software BP sits at the thread's current PC.
    fn continue_execution(&mut self, tid: u32) -> EngineResult<()> {
        let is_stopped = self.threads.with(tid, |s| s.is_stopped).unwrap_or(false);
        if !is_stopped {
            return Err(EngineError::NotInBreakState(tid));
        }

        let sw_index = self.threads.with(tid, |s| s.current_software_breakpoint_index).flatten();
        let pending_signal = self.threads.with(tid, |s| s.pending_signal).flatten().unwrap_or(0);

        if let Some(index) = sw_index {
            dispatcher::step_over_software_breakpoint(self, tid, index)?;
        } else {
            self.threads.clear_break_context(tid);
            self.os.resume(tid, pending_signal)?;
        }
        Ok(())
    }

    /// External `single_step` (§4.D): temporarily disables any BP at the
    /// current PC, enables the CPU step bit, passes any pending signal.
    fn single_step(&mut self, tid: u32) -> EngineResult<()> {
        let is_stopped = self.threads.with(tid, |s| s.is_stopped).unwrap_or(false);
        if !is_stopped {
            return Err(EngineError::NotStopped(tid));
        }

        let pending_signal = self.threads.with(tid, |s| s.pending_signal).flatten().unwrap_or(0);
        let sw_index = self.threads.with(tid, |s| s.current_software_breakpoint_index).flatten();

        if let Some(index) = sw_index {
            let slot = self.sw_table.get(index);
            let pid = self.pid()?;
            let trap_len = self.architecture.trap_instruction().len();
            self.os.write_memory(pid, slot.address, &slot.original_bytes[..trap_len])?;
            self.threads.with_mut(tid, |s| s.single_step_mode = crate::state::SingleStepMode::SoftwareBreakpoint);
        }

        self.os.single_step(tid, pending_signal)
    }

    fn read_register(&self, tid: u32, name: &str) -> EngineResult<u64> {
        let snapshot = self
            .threads
            .with(tid, |s| s.registers.clone())
            .flatten()
            .ok_or(EngineError::NotStopped(tid))?;
        snapshot.read_register(name)
    }

    fn write_register(&self, tid: u32, name: &str, value: u64) -> EngineResult<()> {
        let is_stopped = self.threads.with(tid, |s| s.is_stopped).unwrap_or(false);
        if !is_stopped {
            return Err(EngineError::NotStopped(tid));
        }
        let mut snapshot = self
            .threads
            .with(tid, |s| s.registers.clone())
            .flatten()
            .ok_or(EngineError::NotStopped(tid))?;
        snapshot.write_register(name, value)?;
        self.os.set_gprs(tid, &snapshot)?;
        self.threads.with_mut(tid, |s| s.registers = Some(snapshot));
        Ok(())
    }

    fn read_memory(&self, addr: u64, len: usize) -> EngineResult<Vec<u8>> {
        let pid = self.pid()?;
        self.os.read_memory(pid, addr, len)
    }

    fn write_memory(&self, addr: u64, bytes: &[u8]) -> EngineResult<()> {
        let pid = self.pid()?;
        self.os.write_memory(pid, addr, bytes)
    }

    /// The dedicated event-loop thread body (§2, §5): alternates between
    /// the OS wait primitive and draining the command queue.
    fn run(&mut self, queue: CommandQueue) {
        while !self.shutdown.load(Ordering::SeqCst) {
            match self.os.wait_event() {
                Ok(Some((tid, event))) => dispatcher::handle_event(self, tid, event),
                Ok(None) => {}
                Err(err) => log::error!("OS bridge wait_event failed: {err}"),
            }

            while let Some(request) = queue.try_recv() {
                self.handle_command(request);
            }

            if self.process.is_none() && self.threads.is_empty() {
                // Nothing to wait on; avoid busy-spinning while detached.
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
        }
    }
}

/// Spawn the event-loop thread and return the handle external callers
/// use to submit commands (§2, §5).
pub fn spawn(config: EngineConfig) -> (CommandSender, JoinHandle<()>) {
    let queue_depth = config.queue_depth;
    let (sender, queue) = CommandQueue::new(queue_depth);
    let mut engine = Engine::new(config);
    let handle = thread::spawn(move || engine.run(queue));
    (sender, handle)
}
