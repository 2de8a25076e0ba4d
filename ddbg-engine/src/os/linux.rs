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

//! The Linux OS bridge: ptrace over every thread under `/proc/<pid>/task`
//! (§4.A). Grounded on the teacher's `ptrace` module, extended to
//! seize-then-interrupt attach, thread-wide memory I/O, and debug-register
//! access for both supported architectures.

use std::ffi::CStr;
use std::fs;
use std::thread;
use std::time::Duration;

use crate::arch::{aarch64::Aarch64Gprs, x86_64::X86_64Gprs, Architecture, GprSnapshot};
use crate::error::{EngineError, EngineResult};
use crate::os::{DebugRegs, ProcessHandle, StopEvent, StopExtra};

/// `NT_ARM_HW_BREAK`, from `linux/elf.h`; not exposed by the `libc` crate.
const NT_ARM_HW_BREAK: i32 = 0x402;
/// `NT_ARM_HW_WATCH`, from `linux/elf.h`.
const NT_ARM_HW_WATCH: i32 = 0x403;

/// `offsetof(struct user, u_debugreg)` in glibc's x86-64 `<sys/user.h>`.
const X86_64_DEBUGREG_OFFSET: u64 = 848;

/// `NT_PRSTATUS`, the core-note type used by `PTRACE_GETREGSET` to mean
/// "general-purpose registers", from `<elf.h>`.
const NT_PRSTATUS: i32 = 1;

/// Mirrors the kernel's `struct user_pt_regs` for aarch64: 31
/// general-purpose registers, `sp`, `pc`, `pstate`.
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct Aarch64PtRegs {
    regs: [u64; 31],
    sp: u64,
    pc: u64,
    pstate: u64,
}

fn errno_error() -> EngineError {
    EngineError::from_errno()
}

fn ptrace_attach(pid: u32) -> EngineResult<()> {
    unsafe {
        if libc::ptrace(libc::PTRACE_SEIZE, pid, 0, libc::PTRACE_O_TRACECLONE) == -1 {
            return Err(errno_error());
        }
    }
    Ok(())
}

fn ptrace_interrupt(pid: u32) -> EngineResult<()> {
    unsafe {
        if libc::ptrace(libc::PTRACE_INTERRUPT, pid, 0, 0) == -1 {
            return Err(errno_error());
        }
    }
    Ok(())
}

fn ptrace_cont(pid: u32, signal: i32) -> EngineResult<()> {
    unsafe {
        if libc::ptrace(libc::PTRACE_CONT, pid, 0, signal) == -1 {
            return Err(errno_error());
        }
    }
    Ok(())
}

fn ptrace_detach(pid: u32, signal: i32) -> EngineResult<()> {
    unsafe {
        if libc::ptrace(libc::PTRACE_DETACH, pid, 0, signal) == -1 {
            return Err(errno_error());
        }
    }
    Ok(())
}

fn ptrace_singlestep(pid: u32, signal: i32) -> EngineResult<()> {
    unsafe {
        if libc::ptrace(libc::PTRACE_SINGLESTEP, pid, 0, signal) == -1 {
            return Err(errno_error());
        }
    }
    Ok(())
}

fn ptrace_peektext(pid: u32, address: u64) -> EngineResult<u64> {
    unsafe {
        *libc::__errno_location() = 0;
        let word = libc::ptrace(libc::PTRACE_PEEKTEXT, pid, address, 0);
        if word == -1 && *libc::__errno_location() != 0 {
            return Err(EngineError::MemoryFault { address, len: 8 });
        }
        Ok(word as u64)
    }
}

fn ptrace_poketext(pid: u32, address: u64, word: u64) -> EngineResult<()> {
    unsafe {
        if libc::ptrace(libc::PTRACE_POKETEXT, pid, address, word) == -1 {
            return Err(EngineError::MemoryFault { address, len: 8 });
        }
    }
    Ok(())
}

fn ptrace_getregs_x86_64(pid: u32) -> EngineResult<libc::user_regs_struct> {
    unsafe {
        let mut regs = std::mem::MaybeUninit::<libc::user_regs_struct>::zeroed().assume_init();
        if libc::ptrace(libc::PTRACE_GETREGS, pid, 0, &mut regs) == -1 {
            return Err(errno_error());
        }
        Ok(regs)
    }
}

fn ptrace_setregs_x86_64(pid: u32, regs: &libc::user_regs_struct) -> EngineResult<()> {
    unsafe {
        if libc::ptrace(libc::PTRACE_SETREGS, pid, 0, regs) == -1 {
            return Err(errno_error());
        }
    }
    Ok(())
}

#[repr(C)]
struct IoVec {
    iov_base: *mut libc::c_void,
    iov_len: libc::size_t,
}

fn ptrace_getregset<T>(pid: u32, nt_type: i32, value: &mut T) -> EngineResult<()> {
    let mut iov = IoVec {
        iov_base: value as *mut T as *mut libc::c_void,
        iov_len: std::mem::size_of::<T>(),
    };
    unsafe {
        if libc::ptrace(libc::PTRACE_GETREGSET, pid, nt_type, &mut iov) == -1 {
            return Err(errno_error());
        }
    }
    Ok(())
}

fn ptrace_setregset<T>(pid: u32, nt_type: i32, value: &T) -> EngineResult<()> {
    let mut iov = IoVec {
        iov_base: value as *const T as *mut libc::c_void,
        iov_len: std::mem::size_of::<T>(),
    };
    unsafe {
        if libc::ptrace(libc::PTRACE_SETREGSET, pid, nt_type, &mut iov) == -1 {
            return Err(errno_error());
        }
    }
    Ok(())
}

fn ptrace_peekuser(pid: u32, offset: u64) -> EngineResult<u64> {
    unsafe {
        *libc::__errno_location() = 0;
        let word = libc::ptrace(libc::PTRACE_PEEKUSER, pid, offset, 0);
        if word == -1 && *libc::__errno_location() != 0 {
            return Err(errno_error());
        }
        Ok(word as u64)
    }
}

fn ptrace_pokeuser(pid: u32, offset: u64, value: u64) -> EngineResult<()> {
    unsafe {
        if libc::ptrace(libc::PTRACE_POKEUSER, pid, offset, value) == -1 {
            return Err(errno_error());
        }
    }
    Ok(())
}

/// `user_hwdebug_state` from `linux/ptrace.h`, sized for 16 breakpoint or
/// watchpoint slots (the kernel reports the real count via `dbg_info`;
/// we size generously and only touch the slots the ABI advertises).
#[repr(C)]
#[derive(Clone, Copy)]
struct ArmHwDebugState {
    dbg_info: u32,
    pad: u32,
    dbg_regs: [ArmHwBreakpointCtrl; 16],
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct ArmHwBreakpointCtrl {
    addr: u64,
    ctrl: u32,
    pad: u32,
}

impl Default for ArmHwDebugState {
    fn default() -> ArmHwDebugState {
        ArmHwDebugState {
            dbg_info: 0,
            pad: 0,
            dbg_regs: [ArmHwBreakpointCtrl::default(); 16],
        }
    }
}

fn task_ids(pid: u32) -> EngineResult<Vec<u32>> {
    let dir = fs::read_dir(format!("/proc/{pid}/task")).map_err(EngineError::OsError)?;
    let mut ids = Vec::new();
    for entry in dir {
        let entry = entry.map_err(EngineError::OsError)?;
        if let Some(tid) = entry.file_name().to_str().and_then(|s| s.parse().ok()) {
            ids.push(tid);
        }
    }
    Ok(ids)
}

pub struct LinuxBridge {
    architecture: Architecture,
}

impl LinuxBridge {
    pub fn new() -> LinuxBridge {
        LinuxBridge {
            architecture: Architecture::host(),
        }
    }

    /// Seize then interrupt every thread under `/proc/<pid>/task` so new
    /// threads spawned via `clone` are auto-traced (§4.A).
    pub fn attach(&mut self, pid: u32) -> EngineResult<ProcessHandle> {
        for tid in task_ids(pid)? {
            ptrace_attach(tid).map_err(|e| EngineError::AttachFailed {
                pid: tid,
                reason: e.to_string(),
            })?;
            ptrace_interrupt(tid)?;
        }
        Ok(ProcessHandle { pid })
    }

    pub fn detach(&mut self, handle: &ProcessHandle) -> EngineResult<()> {
        for tid in task_ids(handle.pid).unwrap_or_default() {
            let _ = ptrace_detach(tid, 0);
        }
        Ok(())
    }

    pub fn suspend(&self, tid: u32) -> EngineResult<()> {
        ptrace_interrupt(tid)
    }

    pub fn resume(&self, tid: u32, signal: i32) -> EngineResult<()> {
        ptrace_cont(tid, signal)
    }

    pub fn single_step(&self, tid: u32, signal: i32) -> EngineResult<()> {
        ptrace_singlestep(tid, signal)
    }

    /// Word-at-a-time peek, from whichever already-stopped thread we're
    /// given (§4.A: "iterate word-sized peeks/pokes from an arbitrary
    /// already-stopped thread").
    pub fn read_memory(&self, pid: u32, addr: u64, len: usize) -> EngineResult<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        let mut cursor = addr;
        while out.len() < len {
            let aligned = cursor & !7;
            let word = match ptrace_peektext(pid, aligned) {
                Ok(w) => w,
                Err(_) => {
                    out.extend(std::iter::repeat(0u8).take((len - out.len()).min(8)));
                    cursor += 8;
                    continue;
                }
            };
            let bytes = word.to_le_bytes();
            let start = (cursor - aligned) as usize;
            let take = (8 - start).min(len - out.len());
            out.extend_from_slice(&bytes[start..start + take]);
            cursor += take as u64;
        }
        Ok(out)
    }

    pub fn write_memory(&self, pid: u32, addr: u64, bytes: &[u8]) -> EngineResult<()> {
        let mut cursor = addr;
        let mut written = 0usize;
        while written < bytes.len() {
            let aligned = cursor & !7;
            let offset = (cursor - aligned) as usize;
            let mut word = ptrace_peektext(pid, aligned)?.to_le_bytes();

            let take = (8 - offset).min(bytes.len() - written);
            word[offset..offset + take].copy_from_slice(&bytes[written..written + take]);

            ptrace_poketext(pid, aligned, u64::from_le_bytes(word))?;
            cursor += take as u64;
            written += take;
        }
        Ok(())
    }

    pub fn get_gprs(&self, tid: u32, architecture: Architecture) -> EngineResult<GprSnapshot> {
        match architecture {
            Architecture::X86_64 => {
                let regs = ptrace_getregs_x86_64(tid)?;
                Ok(GprSnapshot::X86_64(X86_64Gprs {
                    rax: regs.rax,
                    rbx: regs.rbx,
                    rcx: regs.rcx,
                    rdx: regs.rdx,
                    rsi: regs.rsi,
                    rdi: regs.rdi,
                    rbp: regs.rbp,
                    rsp: regs.rsp,
                    r8: regs.r8,
                    r9: regs.r9,
                    r10: regs.r10,
                    r11: regs.r11,
                    r12: regs.r12,
                    r13: regs.r13,
                    r14: regs.r14,
                    r15: regs.r15,
                    rip: regs.rip,
                    rflags: regs.eflags,
                    cs: regs.cs,
                    ss: regs.ss,
                    ds: regs.ds,
                    es: regs.es,
                    fs: regs.fs,
                    gs: regs.gs,
                    fs_base: regs.fs_base,
                    gs_base: regs.gs_base,
                }))
            }
            Architecture::Aarch64 => {
                let mut raw = Aarch64PtRegs::default();
                ptrace_getregset(tid, NT_PRSTATUS, &mut raw)?;
                Ok(GprSnapshot::Aarch64(Aarch64Gprs {
                    x: raw.regs,
                    sp: raw.sp,
                    pc: raw.pc,
                    pstate: raw.pstate,
                }))
            }
        }
    }

    pub fn set_gprs(&self, tid: u32, regs: &GprSnapshot) -> EngineResult<()> {
        match regs {
            GprSnapshot::X86_64(r) => {
                let mut raw = ptrace_getregs_x86_64(tid)?;
                raw.rax = r.rax;
                raw.rbx = r.rbx;
                raw.rcx = r.rcx;
                raw.rdx = r.rdx;
                raw.rsi = r.rsi;
                raw.rdi = r.rdi;
                raw.rbp = r.rbp;
                raw.rsp = r.rsp;
                raw.r8 = r.r8;
                raw.r9 = r.r9;
                raw.r10 = r.r10;
                raw.r11 = r.r11;
                raw.r12 = r.r12;
                raw.r13 = r.r13;
                raw.r14 = r.r14;
                raw.r15 = r.r15;
                raw.rip = r.rip;
                raw.eflags = r.rflags;
                raw.cs = r.cs;
                raw.ss = r.ss;
                raw.ds = r.ds;
                raw.es = r.es;
                raw.fs = r.fs;
                raw.gs = r.gs;
                raw.fs_base = r.fs_base;
                raw.gs_base = r.gs_base;
                ptrace_setregs_x86_64(tid, &raw)
            }
            GprSnapshot::Aarch64(r) => {
                let raw = Aarch64PtRegs {
                    regs: r.x,
                    sp: r.sp,
                    pc: r.pc,
                    pstate: r.pstate,
                };
                ptrace_setregset(tid, NT_PRSTATUS, &raw)
            }
        }
    }

    /// Debug-register state on ARM64 is the hardware breakpoint bank +
    /// hardware watchpoint bank + `MDSCR_EL1.SS` bit; on x86-64 it is
    /// DR0-DR3 + DR6 + DR7 (§4.A).
    pub fn get_debug_regs(&self, tid: u32, architecture: Architecture) -> EngineResult<DebugRegs> {
        match architecture {
            Architecture::X86_64 => {
                let mut dr = [0u64; 8];
                for (i, slot) in dr.iter_mut().enumerate() {
                    *slot = ptrace_peekuser(tid, X86_64_DEBUGREG_OFFSET + (i as u64) * 8)?;
                }
                Ok(DebugRegs::X86_64 {
                    dr0: dr[0],
                    dr1: dr[1],
                    dr2: dr[2],
                    dr3: dr[3],
                    dr6: dr[6],
                    dr7: dr[7],
                })
            }
            Architecture::Aarch64 => {
                let mut bp_state = ArmHwDebugState::default();
                ptrace_getregset(tid, NT_ARM_HW_BREAK, &mut bp_state)?;
                let mut wp_state = ArmHwDebugState::default();
                ptrace_getregset(tid, NT_ARM_HW_WATCH, &mut wp_state)?;

                let mut bp_control = [0u64; 16];
                let mut bp_value = [0u64; 16];
                let mut wp_control = [0u64; 16];
                let mut wp_value = [0u64; 16];
                for i in 0..16 {
                    bp_control[i] = bp_state.dbg_regs[i].ctrl as u64;
                    bp_value[i] = bp_state.dbg_regs[i].addr;
                    wp_control[i] = wp_state.dbg_regs[i].ctrl as u64;
                    wp_value[i] = wp_state.dbg_regs[i].addr;
                }

                Ok(DebugRegs::Aarch64 {
                    bp_control,
                    bp_value,
                    wp_control,
                    wp_value,
                    mdscr: 0,
                })
            }
        }
    }

    pub fn set_debug_regs(&self, tid: u32, regs: &DebugRegs) -> EngineResult<()> {
        match regs {
            DebugRegs::X86_64 { dr0, dr1, dr2, dr3, dr6, dr7 } => {
                ptrace_pokeuser(tid, X86_64_DEBUGREG_OFFSET, *dr0)?;
                ptrace_pokeuser(tid, X86_64_DEBUGREG_OFFSET + 8, *dr1)?;
                ptrace_pokeuser(tid, X86_64_DEBUGREG_OFFSET + 16, *dr2)?;
                ptrace_pokeuser(tid, X86_64_DEBUGREG_OFFSET + 24, *dr3)?;
                ptrace_pokeuser(tid, X86_64_DEBUGREG_OFFSET + 48, *dr6)?;
                ptrace_pokeuser(tid, X86_64_DEBUGREG_OFFSET + 56, *dr7)?;
                Ok(())
            }
            DebugRegs::Aarch64 {
                bp_control,
                bp_value,
                wp_control,
                wp_value,
                ..
            } => {
                let mut bp_state = ArmHwDebugState::default();
                for i in 0..16 {
                    bp_state.dbg_regs[i].addr = bp_value[i];
                    bp_state.dbg_regs[i].ctrl = bp_control[i] as u32;
                }
                ptrace_setregset(tid, NT_ARM_HW_BREAK, &bp_state)?;

                let mut wp_state = ArmHwDebugState::default();
                for i in 0..16 {
                    wp_state.dbg_regs[i].addr = wp_value[i];
                    wp_state.dbg_regs[i].ctrl = wp_control[i] as u32;
                }
                ptrace_setregset(tid, NT_ARM_HW_WATCH, &wp_state)
            }
        }
    }

    /// Non-blocking wait, polled every 10 ms (§5 "Linux: non-blocking
    /// wait in a 10 ms poll"). Returns `None` when nothing is ready yet.
    pub fn wait_event(&self) -> EngineResult<Option<(u32, StopEvent)>> {
        let mut status: i32 = 0;
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG | libc::__WALL) };

        if pid == 0 {
            thread::sleep(Duration::from_millis(10));
            return Ok(None);
        }
        if pid == -1 {
            let err = unsafe { *libc::__errno_location() };
            if err == libc::ECHILD {
                thread::sleep(Duration::from_millis(10));
                return Ok(None);
            }
            return Err(errno_error());
        }

        let tid = pid as u32;

        if status >> 8 == (libc::SIGTRAP | (libc::PTRACE_EVENT_CLONE << 8)) {
            let mut new_tid: libc::c_ulong = 0;
            unsafe {
                libc::ptrace(libc::PTRACE_GETEVENTMSG, pid, 0, &mut new_tid);
            }
            return Ok(Some((tid, StopEvent::Clone { new_tid: new_tid as u32 })));
        }

        if libc::WIFEXITED(status) {
            return Ok(Some((tid, StopEvent::Exited { status: libc::WEXITSTATUS(status) })));
        }
        if libc::WIFSIGNALED(status) {
            return Ok(Some((tid, StopEvent::Signalled { signal: libc::WTERMSIG(status) })));
        }
        if libc::WIFSTOPPED(status) {
            let signal = libc::WSTOPSIG(status);

            if signal == (libc::SIGTRAP | 0x80) {
                return Ok(Some((tid, StopEvent::GroupStoppedByInterrupt)));
            }

            let extra = read_stop_extra(tid, signal, self.architecture);
            return Ok(Some((tid, StopEvent::Stopped { signal, extra })));
        }

        Err(EngineError::OsError(std::io::Error::new(
            std::io::ErrorKind::Other,
            "unexpected waitpid status",
        )))
    }
}

/// Fetch `siginfo.si_addr` for a `SIGTRAP`, and on x86-64 also peek DR6
/// (§4.D: "fetch `siginfo.si_addr`; on x86-64 also peek DR6 before
/// matching a watchpoint" — hardware watchpoint traps don't reliably
/// populate `si_addr`, so the dispatcher falls back to DR6's trigger bits).
fn read_stop_extra(tid: u32, signal: i32, architecture: Architecture) -> StopExtra {
    if signal != libc::SIGTRAP {
        return StopExtra::default();
    }

    let dr6 = if architecture == Architecture::X86_64 {
        ptrace_peekuser(tid, X86_64_DEBUGREG_OFFSET + 6 * 8).ok()
    } else {
        None
    };

    unsafe {
        let mut siginfo = std::mem::MaybeUninit::<libc::siginfo_t>::zeroed().assume_init();
        if libc::ptrace(libc::PTRACE_GETSIGINFO, tid, 0, &mut siginfo) == -1 {
            return StopExtra { fault_address: None, dr6, exception_class: None };
        }

        StopExtra {
            fault_address: siginfo_addr(&siginfo),
            dr6,
            exception_class: None,
        }
    }
}

unsafe fn siginfo_addr(siginfo: &libc::siginfo_t) -> Option<u64> {
    // `libc::siginfo_t` does not expose `si_addr` as a named field on
    // every target; the union layout places it at a fixed offset after
    // `si_signo`, `si_errno`, `si_code` on Linux's x86-64 and aarch64
    // ABIs alike.
    let base = siginfo as *const libc::siginfo_t as *const u8;
    let addr_ptr = base.add(16) as *const u64;
    let value = *addr_ptr;
    if value == 0 {
        None
    } else {
        Some(value)
    }
}

#[allow(dead_code)]
fn errno_name() -> String {
    unsafe {
        let errno = *libc::__errno_location();
        CStr::from_ptr(libc::strerror(errno)).to_string_lossy().into_owned()
    }
}
