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

//! The exception dispatcher (§4.D): turns one `StopEvent` into thread-state
//! updates, hit-counting, trace entries, and the step-over/resume dance.
//! Linux funnels every `SIGTRAP`-class stop through `StopEvent::Stopped`;
//! Darwin funnels every Mach exception through the same variant with
//! `extra.exception_class` set. The split below is keyed on that field,
//! not on the `StopEvent` variant.

use std::sync::atomic::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::arch::aarch64::decode_ldst_access;
use crate::arch::{Architecture, GprSnapshot};
use crate::engine::Engine;
use crate::error::EngineResult;
use crate::os::{StopEvent, StopExtra};
use crate::state::SingleStepMode;
use crate::trace::{MemoryAccessRecord, MemoryDumpRegion, TraceEntry};

pub(crate) fn handle_event(engine: &mut Engine, tid: u32, event: StopEvent) {
    match event {
        StopEvent::Clone { new_tid } => handle_clone(engine, tid, new_tid),
        StopEvent::Exited { .. } | StopEvent::Signalled { .. } => {
            engine.threads.remove(tid);
        }
        StopEvent::GroupStoppedByInterrupt => handle_group_stop(engine, tid),
        StopEvent::SingleStepped => handle_single_step_complete(engine, tid),
        StopEvent::Stopped { signal, extra } => handle_stopped(engine, tid, signal, extra),
    }
}

fn handle_clone(engine: &mut Engine, tid: u32, new_tid: u32) {
    engine.threads.ensure(new_tid);
    engine.arm_existing_breakpoints_on_new_thread(new_tid);
    let _ = engine.os.resume(tid, 0);
}

/// A group-stop triggered by `PTRACE_INTERRUPT` (§4.D): consumes
/// `user_suspend_pending` if set, otherwise is just a spurious interrupt.
fn handle_group_stop(engine: &mut Engine, tid: u32) {
    let requested = engine.user_suspend_pending.swap(false, Ordering::SeqCst);
    engine.threads.with_mut(tid, |s| {
        s.is_stopped = true;
        s.stopped_by_user = requested;
    });
    refresh_registers(engine, tid);
}

fn handle_stopped(engine: &mut Engine, tid: u32, signal: i32, extra: StopExtra) {
    engine.threads.ensure(tid);

    if let Some(exception_class) = extra.exception_class {
        handle_darwin_stop(engine, tid, exception_class, extra.fault_address);
        return;
    }

    handle_linux_stop(engine, tid, signal, extra);
}

/// Linux path (§4.D): `SIGTRAP` covers breakpoint hits, watchpoint hits,
/// single-step completion and synthetic traps alike; the only way to tell
/// them apart is the thread's own recorded `single_step_mode` and a PC/fault
/// address lookup against the slot tables.
fn handle_linux_stop(engine: &mut Engine, tid: u32, signal: i32, extra: StopExtra) {
    if signal == libc::SIGSTOP || signal == libc::SIGTSTP {
        handle_group_stop(engine, tid);
        return;
    }

    if signal == libc::SIGCONT {
        handle_sigcont(engine, tid);
        return;
    }

    if signal != libc::SIGTRAP {
        handle_other_signal(engine, tid, signal);
        return;
    }

    let driving_mode = engine.threads.with(tid, |s| s.single_step_mode).unwrap_or(SingleStepMode::None);
    if driving_mode != SingleStepMode::None {
        handle_single_step_complete(engine, tid);
        return;
    }

    if let Some(fault_address) = extra.fault_address {
        if let Some(index) = engine.wp_table.find_containing(fault_address) {
            handle_watchpoint_hit(engine, tid, index);
            return;
        }
    }

    // x86-64 hardware watchpoint traps don't reliably populate
    // `si_addr`; DR6 bits 0-3 (B0-B3) name which DR slot triggered, and
    // slot index maps directly onto DR0-DR3 (§4.A rearm).
    if let Some(dr6) = extra.dr6 {
        if let Some(index) = watchpoint_index_from_dr6(engine, dr6) {
            handle_watchpoint_hit(engine, tid, index);
            return;
        }
    }

    let pc = match current_pc(engine, tid) {
        Some(pc) => pc,
        None => return,
    };
    if let Some(addr) = resolve_breakpoint_hit_address(engine, tid, pc) {
        handle_breakpoint_hit(engine, tid, addr);
    }
}

fn watchpoint_index_from_dr6(engine: &Engine, dr6: u64) -> Option<usize> {
    (0..4).find(|&index| dr6 & (1 << index) != 0 && engine.wp_table.get(index).in_use)
}

/// Darwin path (§4.D): the Mach exception class already tells us which
/// kind of stop this is, no PC-vs-single-step-mode guessing required.
fn handle_darwin_stop(engine: &mut Engine, tid: u32, exception_class: u32, fault_address: Option<u64>) {
    match exception_class {
        0x3C => {
            if let Some(pc) = current_pc(engine, tid) {
                if let Some(addr) = resolve_breakpoint_hit_address(engine, tid, pc) {
                    handle_breakpoint_hit(engine, tid, addr);
                }
            }
        }
        0x30 | 0x31 => {
            if let Some(pc) = current_pc(engine, tid) {
                if engine.hw_table.find_by_address(pc).is_some() {
                    handle_breakpoint_hit(engine, tid, pc);
                }
            }
        }
        0x34 | 0x35 => {
            if let Some(addr) = fault_address {
                if let Some(index) = engine.wp_table.find_containing(addr) {
                    handle_watchpoint_hit(engine, tid, index);
                }
            }
        }
        0x32 | 0x33 => handle_single_step_complete(engine, tid),
        _ => log::warn!("unhandled Darwin exception class {exception_class:#x} on thread {tid}"),
    }
}

/// `SIGCONT` (§4.D): resume iff the thread was parked by an explicit
/// user suspend, otherwise it's just the kernel notifying us of a
/// continuation nobody here asked for.
fn handle_sigcont(engine: &mut Engine, tid: u32) {
    let stopped_by_user = engine.threads.with(tid, |s| s.stopped_by_user).unwrap_or(false);
    if stopped_by_user {
        engine.threads.with_mut(tid, |s| {
            s.is_stopped = false;
            s.stopped_by_user = false;
        });
        let _ = engine.os.resume(tid, 0);
    }
}

fn handle_other_signal(engine: &mut Engine, tid: u32, signal: i32) {
    let disposition = engine.signals.get(signal);

    if !disposition.catch {
        let deliver = if disposition.pass { signal } else { 0 };
        let _ = engine.os.resume(tid, deliver);
        return;
    }

    engine.threads.with_mut(tid, |s| {
        s.is_stopped = true;
        s.pending_signal = if disposition.pass { Some(signal) } else { None };
    });
    refresh_registers(engine, tid);
}

fn current_pc(engine: &mut Engine, tid: u32) -> Option<u64> {
    let regs = engine.os.get_gprs(tid, engine.architecture).ok()?;
    let pc = regs.pc();
    engine.threads.with_mut(tid, |s| s.registers = Some(regs));
    Some(pc)
}

fn refresh_registers(engine: &mut Engine, tid: u32) {
    if let Ok(regs) = engine.os.get_gprs(tid, engine.architecture) {
        engine.threads.with_mut(tid, |s| s.registers = Some(regs));
    }
}

/// On x86-64, `INT3` leaves `PC` one byte past the trap; rewind and write
/// it back before anything else looks at the thread's registers (§4.D).
fn resolve_breakpoint_hit_address(engine: &mut Engine, tid: u32, pc: u64) -> Option<u64> {
    if engine.architecture == Architecture::X86_64 {
        if engine.sw_table.find_by_address(pc.wrapping_sub(1)).is_some() {
            let rewound = pc - 1;
            if let Ok(mut regs) = engine.os.get_gprs(tid, engine.architecture) {
                regs.set_pc(rewound);
                let _ = engine.os.set_gprs(tid, &regs);
                engine.threads.with_mut(tid, |s| s.registers = Some(regs));
            }
            return Some(rewound);
        }
    }

    if engine.hw_table.find_by_address(pc).is_some() || engine.sw_table.find_by_address(pc).is_some() {
        return Some(pc);
    }
    None
}

fn handle_breakpoint_hit(engine: &mut Engine, tid: u32, addr: u64) {
    if let Some(index) = engine.sw_table.find_by_address(addr) {
        handle_sw_breakpoint_hit(engine, tid, index);
    } else if let Some(index) = engine.hw_table.find_by_address(addr) {
        handle_hw_breakpoint_hit(engine, tid, index);
    }
}

fn handle_hw_breakpoint_hit(engine: &mut Engine, tid: u32, index: usize) {
    let hit_count = engine.hw_table.increment_hit_count(index);
    let slot = engine.hw_table.get(index);

    let regs = match engine.os.get_gprs(tid, engine.architecture) {
        Ok(r) => r,
        Err(err) => {
            log::error!("failed to read registers for thread {tid}: {err}");
            return;
        }
    };
    engine.threads.with_mut(tid, |s| {
        s.registers = Some(regs.clone());
        s.is_stopped = true;
    });

    let should_break = (engine.config.should_break)(&regs);
    if !should_break {
        step_over_hardware_breakpoint(engine, tid, index);
        return;
    }

    engine.threads.with_mut(tid, |s| s.current_breakpoint_index = Some(index));

    if slot.target_count > 0 {
        enter_hw_breakpoint_trace_mode(engine, tid, index, hit_count, &regs);
    }
}

fn handle_sw_breakpoint_hit(engine: &mut Engine, tid: u32, index: usize) {
    let (hit_count, target_count) = {
        let mut counters = engine.sw_counters.lock().unwrap();
        let entry = counters.entry(index).or_insert((0, 0));
        entry.0 += 1;
        *entry
    };

    let regs = match engine.os.get_gprs(tid, engine.architecture) {
        Ok(r) => r,
        Err(err) => {
            log::error!("failed to read registers for thread {tid}: {err}");
            return;
        }
    };
    engine.threads.with_mut(tid, |s| {
        s.registers = Some(regs.clone());
        s.is_stopped = true;
    });

    let should_break = (engine.config.should_break)(&regs);
    if !should_break {
        let _ = step_over_software_breakpoint(engine, tid, index);
        return;
    }

    engine.threads.with_mut(tid, |s| s.current_software_breakpoint_index = Some(index));

    if target_count > 0 {
        enter_sw_breakpoint_trace_mode(engine, tid, index, hit_count, &regs);
    }
}

/// True if this thread owns the tracked-trace-thread claim, or becomes the
/// owner now (§4.D "if no other thread has claimed it, claim it; a
/// non-tracked thread is silently resumed").
fn claim_tracked_trace_thread(engine: &Engine, tid: u32) -> bool {
    let token = tid.wrapping_add(1);
    match engine.tracked_trace_thread.compare_exchange(0, token, Ordering::SeqCst, Ordering::SeqCst) {
        Ok(_) => true,
        Err(current) => current == token,
    }
}

fn enter_hw_breakpoint_trace_mode(engine: &mut Engine, tid: u32, index: usize, hit_count: u64, regs: &GprSnapshot) {
    if !claim_tracked_trace_thread(engine, tid) {
        let _ = engine.os.resume(tid, 0);
        return;
    }

    let slot = engine.hw_table.get(index);
    if check_trace_terminator(engine, index, hit_count, slot.target_count, slot.end_address, regs.pc()) {
        finish_hw_trace(engine, tid, index);
        return;
    }

    record_trace_entry(engine, tid, regs);
    let _ = engine.clear_hw_slot_on_thread(tid, index);
    engine.threads.with_mut(tid, |s| {
        s.single_step_mode = SingleStepMode::Breakpoint;
        s.disabled_resource_index = Some(index);
    });
    let _ = engine.os.single_step(tid, 0);
}

fn enter_sw_breakpoint_trace_mode(engine: &mut Engine, tid: u32, index: usize, hit_count: u64, regs: &GprSnapshot) {
    if !claim_tracked_trace_thread(engine, tid) {
        let _ = engine.os.resume(tid, 0);
        return;
    }

    let slot = engine.sw_table.get(index);
    if check_trace_terminator(engine, index, hit_count, sw_target_count(engine, index), 0, regs.pc()) {
        finish_sw_trace(engine, tid, index);
        return;
    }

    record_trace_entry(engine, tid, regs);
    let pid = match engine.pid() {
        Ok(pid) => pid,
        Err(_) => return,
    };
    let trap_len = engine.architecture.trap_instruction().len();
    let _ = engine.os.write_memory(pid, slot.address, &slot.original_bytes[..trap_len]);
    engine.threads.with_mut(tid, |s| {
        s.single_step_mode = SingleStepMode::Breakpoint;
        s.disabled_resource_index = Some(index);
    });
    let _ = engine.os.single_step(tid, 0);
}

fn sw_target_count(engine: &Engine, index: usize) -> u64 {
    engine.sw_counters.lock().unwrap().get(&index).map(|(_, target)| *target).unwrap_or(0)
}

fn check_trace_terminator(
    engine: &Engine,
    index: usize,
    hit_count: u64,
    target_count: u64,
    end_address: u64,
    pc: u64,
) -> bool {
    let reached_target = target_count > 0 && hit_count >= target_count;
    let reached_end = end_address != 0 && pc == end_address;
    if reached_end && !reached_target {
        engine.trace_ended_by_end_address.store(true, Ordering::SeqCst);
    }
    reached_target || reached_end || engine.trace.is_stop_requested()
}

fn finish_hw_trace(engine: &mut Engine, tid: u32, index: usize) {
    engine.trace.disable();
    for t in engine.threads.thread_ids() {
        let _ = engine.clear_hw_slot_on_thread(t, index);
    }
    engine.hw_table.remove(index);
    engine.threads.clear_break_context(tid);
    engine.tracked_trace_thread.store(0, Ordering::SeqCst);
    let _ = engine.os.resume(tid, 0);
}

fn finish_sw_trace(engine: &mut Engine, tid: u32, index: usize) {
    engine.trace.disable();
    engine.sw_table.clear(index);
    engine.sw_counters.lock().unwrap().remove(&index);
    engine.threads.clear_break_context(tid);
    engine.tracked_trace_thread.store(0, Ordering::SeqCst);
    let _ = engine.os.resume(tid, 0);
}

/// Assemble and write one trace entry (§4.E): instruction bytes at PC, the
/// optional disassembly, and up to 6 argument-register memory windows. The
/// first hit also triggers a one-time full-memory dump if configured.
fn record_trace_entry(engine: &mut Engine, tid: u32, regs: &GprSnapshot) {
    let pid = match engine.pid() {
        Ok(pid) => pid,
        Err(_) => return,
    };

    if engine.trace.full_memory_cache_enabled() {
        let regions = (engine.config.region_provider)(pid)
            .into_iter()
            .map(|(start, length, protection)| {
                let bytes = engine.os.read_memory(pid, start, length as usize).unwrap_or_default();
                MemoryDumpRegion { start, length, protection, bytes }
            })
            .collect::<Vec<_>>();
        let _ = engine.trace.dump_regions_if_first_hit(&regions);
    }

    if !engine.trace.is_enabled() {
        return;
    }

    let pc = regs.pc();
    let raw = engine.os.read_memory(pid, pc, 4).unwrap_or_default();
    let mut instruction_bytes = [0u8; 4];
    instruction_bytes[..raw.len().min(4)].copy_from_slice(&raw[..raw.len().min(4)]);
    let instruction_text = engine.config.disassembler.decode(engine.architecture, pc, instruction_bytes);

    let memory_windows = regs
        .argument_registers()
        .iter()
        .map(|&addr| engine.os.read_memory(pid, addr, 64).unwrap_or_default())
        .collect::<Vec<_>>();

    let entry = TraceEntry {
        timestamp_micros: SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_micros() as u64).unwrap_or(0),
        registers: regs.clone(),
        instruction_bytes,
        instruction_text,
        memory_windows,
    };
    let entry_index = engine.trace.write_entry(&entry).unwrap_or(0);

    if engine.architecture == Architecture::Aarch64 {
        log_arm_memory_access(engine, pid, entry_index, regs, instruction_bytes);
    }
}

/// Decode an ARM64 load/store instruction and append its accessed range(s)
/// to the memory-access-log side file (§4.E, §10.6). A no-op when the
/// instruction isn't a load/store this decoder recognizes, or when the
/// log side file isn't open (`log_memory_access` itself no-ops then).
fn log_arm_memory_access(engine: &mut Engine, pid: u32, entry_index: u64, regs: &GprSnapshot, instruction_bytes: [u8; 4]) {
    let access = match decode_ldst_access(u32::from_le_bytes(instruction_bytes)) {
        Some(access) => access,
        None => return,
    };

    let base_name = if access.base_register == 31 { "sp".to_string() } else { format!("x{}", access.base_register) };
    let base_value = match regs.read_register(&base_name) {
        Ok(value) => value,
        Err(_) => return,
    };

    let primary_address = (base_value as i64).wrapping_add(access.offset) as u64;
    let primary_bytes = engine.os.read_memory(pid, primary_address, access.length as usize).unwrap_or_default();
    let _ = engine.trace.log_memory_access(&MemoryAccessRecord {
        entry_index,
        address: primary_address,
        length: access.length,
        is_write: access.is_write,
        bytes: primary_bytes,
    });

    if let Some(second_offset) = access.second_offset {
        let second_address = (primary_address as i64).wrapping_add(second_offset) as u64;
        let second_bytes = engine.os.read_memory(pid, second_address, access.length as usize).unwrap_or_default();
        let _ = engine.trace.log_memory_access(&MemoryAccessRecord {
            entry_index,
            address: second_address,
            length: access.length,
            is_write: access.is_write,
            bytes: second_bytes,
        });
    }
}

/// Silently resume past a breakpoint the `should_break` callback declined
/// (§4.D). Distinct from [`step_over_software_breakpoint`]: this path
/// re-arms the hardware slot rather than rewriting memory.
fn step_over_hardware_breakpoint(engine: &mut Engine, tid: u32, index: usize) {
    let _ = engine.clear_hw_slot_on_thread(tid, index);
    engine.threads.with_mut(tid, |s| {
        s.single_step_mode = SingleStepMode::HardwareBreakpointContinue;
        s.disabled_resource_index = Some(index);
        s.is_stopped = false;
    });
    let _ = engine.os.single_step(tid, 0);
}

/// Step a thread off a software breakpoint's trap byte(s) and back onto the
/// original instruction (§4.D "step-over dance"). Called both for the
/// silent-continue path and from `Engine::continue_execution` when the
/// caller resumes a thread sitting on a software breakpoint.
pub(crate) fn step_over_software_breakpoint(engine: &mut Engine, tid: u32, index: usize) -> EngineResult<()> {
    let slot = engine.sw_table.get(index);
    let pid = engine.pid()?;
    let trap_len = engine.architecture.trap_instruction().len();
    engine.os.write_memory(pid, slot.address, &slot.original_bytes[..trap_len])?;

    engine.threads.with_mut(tid, |s| {
        s.single_step_mode = SingleStepMode::SoftwareBreakpointContinue;
        s.disabled_resource_index = Some(index);
        s.is_stopped = false;
    });
    engine.os.single_step(tid, 0)
}

fn handle_watchpoint_hit(engine: &mut Engine, tid: u32, index: usize) {
    let guard = match engine.wp_table.enter_hit_handler(index) {
        Some(guard) => guard,
        None => return,
    };
    engine.wp_table.adjust_in_flight(index, 1);

    let regs = match engine.os.get_gprs(tid, engine.architecture) {
        Ok(r) => r,
        Err(err) => {
            log::error!("failed to read registers for thread {tid}: {err}");
            engine.wp_table.adjust_in_flight(index, -1);
            drop(guard);
            return;
        }
    };
    engine.threads.with_mut(tid, |s| {
        s.registers = Some(regs.clone());
        s.is_stopped = true;
        s.current_watchpoint_index = Some(index);
    });

    let _ = (engine.config.should_break)(&regs);

    engine.wp_table.adjust_in_flight(index, -1);
    drop(guard);

    let _ = disable_watchpoints_on_thread(engine, tid);
    engine.threads.with_mut(tid, |s| s.single_step_mode = SingleStepMode::Watchpoint);
    let _ = engine.os.single_step(tid, 0);
}

fn disable_watchpoints_on_thread(engine: &Engine, tid: u32) -> EngineResult<()> {
    let mut regs = engine.os.get_debug_regs(tid, engine.architecture)?;
    match &mut regs {
        crate::os::DebugRegs::Aarch64 { wp_control, wp_value, .. } => {
            *wp_control = [0; 16];
            *wp_value = [0; 16];
        }
        crate::os::DebugRegs::X86_64 { dr7, .. } => {
            *dr7 &= !0xFFFF_0000u64;
        }
    }
    engine.os.set_debug_regs(tid, &regs)
}

/// Stop-all/reprogram/resume-only-those-running the full watchpoint bank
/// across every thread (§4.D watchpoint step-complete, §4.B reprogram).
fn reapply_all_watchpoints(engine: &mut Engine) {
    let running = engine.running_thread_ids();
    for t in engine.threads.thread_ids() {
        let _ = engine.os.suspend(t);
    }
    for t in engine.threads.thread_ids() {
        let _ = engine.rearm_watchpoint_bank_on_thread(t);
    }
    for t in running {
        let _ = engine.os.resume(t, 0);
    }
}

fn handle_single_step_complete(engine: &mut Engine, tid: u32) {
    let mode = engine.threads.with(tid, |s| s.single_step_mode).unwrap_or(SingleStepMode::None);

    match mode {
        SingleStepMode::None => {
            engine.threads.with_mut(tid, |s| s.is_stopped = true);
            refresh_registers(engine, tid);
        }
        SingleStepMode::HardwareBreakpointContinue => {
            if let Some(index) = engine.threads.with(tid, |s| s.disabled_resource_index).flatten() {
                let addr = engine.hw_table.get(index).address;
                let _ = engine.arm_hw_slot_on_thread(tid, index, addr);
            }
            let pending = engine.threads.with(tid, |s| s.pending_signal).flatten().unwrap_or(0);
            engine.threads.clear_break_context(tid);
            let _ = engine.os.resume(tid, pending);
        }
        SingleStepMode::SoftwareBreakpointContinue => {
            if let Some(index) = engine.threads.with(tid, |s| s.disabled_resource_index).flatten() {
                reinsert_software_trap(engine, index);
            }
            let pending = engine.threads.with(tid, |s| s.pending_signal).flatten().unwrap_or(0);
            engine.threads.clear_break_context(tid);
            let _ = engine.os.resume(tid, pending);
        }
        SingleStepMode::Breakpoint => continue_breakpoint_trace_step(engine, tid),
        SingleStepMode::SoftwareBreakpoint => {
            if let Some(index) = engine.threads.with(tid, |s| s.current_software_breakpoint_index).flatten() {
                reinsert_software_trap(engine, index);
            }
            engine.threads.with_mut(tid, |s| {
                s.single_step_mode = SingleStepMode::None;
                s.is_stopped = true;
            });
            refresh_registers(engine, tid);
        }
        SingleStepMode::Watchpoint => {
            engine.threads.with_mut(tid, |s| {
                s.single_step_mode = SingleStepMode::None;
                s.current_watchpoint_index = None;
                s.is_stopped = false;
            });
            reapply_all_watchpoints(engine);
        }
    }
}

fn reinsert_software_trap(engine: &mut Engine, index: usize) {
    let slot = engine.sw_table.get(index);
    let pid = match engine.pid() {
        Ok(pid) => pid,
        Err(_) => return,
    };
    let trap = engine.architecture.trap_instruction();
    let _ = engine.os.write_memory(pid, slot.address, trap);
}

/// The per-step continuation of a counted breakpoint's trace mode (§4.D):
/// re-arm whichever resource drove the step, check terminators again, and
/// either emit another entry + step, or close the trace out.
fn continue_breakpoint_trace_step(engine: &mut Engine, tid: u32) {
    let hw_index = engine.threads.with(tid, |s| s.current_breakpoint_index).flatten();
    let sw_index = engine.threads.with(tid, |s| s.current_software_breakpoint_index).flatten();

    let regs = match engine.os.get_gprs(tid, engine.architecture) {
        Ok(r) => r,
        Err(err) => {
            log::error!("failed to read registers for thread {tid}: {err}");
            return;
        }
    };
    engine.threads.with_mut(tid, |s| s.registers = Some(regs.clone()));

    if let Some(index) = hw_index {
        let hit_count = engine.hw_table.increment_hit_count(index);
        let slot = engine.hw_table.get(index);
        if check_trace_terminator(engine, index, hit_count, slot.target_count, slot.end_address, regs.pc()) {
            finish_hw_trace(engine, tid, index);
            return;
        }
        record_trace_entry(engine, tid, &regs);
        let _ = engine.os.single_step(tid, 0);
        return;
    }

    if let Some(index) = sw_index {
        let (hit_count, target_count) = {
            let mut counters = engine.sw_counters.lock().unwrap();
            let entry = counters.entry(index).or_insert((0, 0));
            entry.0 += 1;
            *entry
        };
        if check_trace_terminator(engine, index, hit_count, target_count, 0, regs.pc()) {
            // Original bytes are already in place (restored on trace-mode
            // entry); tearing the slot down here just drops the bookkeeping.
            finish_sw_trace(engine, tid, index);
            return;
        }
        record_trace_entry(engine, tid, &regs);
        let _ = engine.os.single_step(tid, 0);
    }
}
