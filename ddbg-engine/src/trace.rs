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

//! The trace recorder (§4.E, §6): a binary file writer with a typed
//! header and fixed-size entries, plus two optional side files.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::arch::{Architecture, GprSnapshot};
use crate::error::{EngineError, EngineResult};

const MAGIC: [u8; 4] = *b"DDBG";
const VERSION: u32 = 1;
const INSTRUCTION_TEXT_LEN: usize = 64;
const MEMORY_WINDOW_COUNT: usize = 6;
const MEMORY_WINDOW_LEN: usize = 64;

#[repr(C)]
struct TraceHeader {
    magic: [u8; 4],
    version: u32,
    architecture: u8,
    entry_size: u32,
}

impl TraceHeader {
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + 4 + 1 + 4);
        out.extend_from_slice(&self.magic);
        out.extend_from_slice(&self.version.to_le_bytes());
        out.push(self.architecture);
        out.extend_from_slice(&self.entry_size.to_le_bytes());
        out
    }
}

fn architecture_tag(architecture: Architecture) -> u8 {
    match architecture {
        Architecture::Aarch64 => 0,
        Architecture::X86_64 => 1,
    }
}

/// One trace record (§6: "timestamp, all GPRs, PC, SP, LR (ARM)/RBP
/// (x86), CPSR/RFLAGS, 4 instruction bytes, optional disassembly text,
/// and up to 6 x 64-byte memory windows").
pub struct TraceEntry {
    pub timestamp_micros: u64,
    pub registers: GprSnapshot,
    pub instruction_bytes: [u8; 4],
    pub instruction_text: Option<String>,
    pub memory_windows: Vec<Vec<u8>>,
}

impl TraceEntry {
    fn entry_size() -> usize {
        8 + 8 * 33 + 4 + INSTRUCTION_TEXT_LEN + 1 + MEMORY_WINDOW_COUNT * MEMORY_WINDOW_LEN
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::entry_size());
        out.extend_from_slice(&self.timestamp_micros.to_le_bytes());

        match &self.registers {
            GprSnapshot::Aarch64(r) => {
                for x in r.x.iter() {
                    out.extend_from_slice(&x.to_le_bytes());
                }
                out.extend_from_slice(&r.pc.to_le_bytes());
                out.extend_from_slice(&r.sp.to_le_bytes());
                out.extend_from_slice(&r.pstate.to_le_bytes());
            }
            GprSnapshot::X86_64(r) => {
                let fields = [
                    r.rax, r.rbx, r.rcx, r.rdx, r.rsi, r.rdi, r.rbp, r.rsp, r.r8, r.r9, r.r10, r.r11, r.r12, r.r13,
                    r.r14, r.r15, r.rip, r.rflags, r.cs, r.ss, r.ds, r.es, r.fs, r.gs, r.fs_base, r.gs_base,
                ];
                for field in fields {
                    out.extend_from_slice(&field.to_le_bytes());
                }
                // Pad to the same per-entry width as the ARM variant so
                // `entry_size` is architecture-independent within a file.
                for _ in fields.len()..33 {
                    out.extend_from_slice(&0u64.to_le_bytes());
                }
            }
        }

        out.extend_from_slice(&self.instruction_bytes);

        let mut text_buf = [0u8; INSTRUCTION_TEXT_LEN];
        let text_len = if let Some(text) = &self.instruction_text {
            let bytes = text.as_bytes();
            let n = bytes.len().min(INSTRUCTION_TEXT_LEN);
            text_buf[..n].copy_from_slice(&bytes[..n]);
            n as u8
        } else {
            0
        };
        out.extend_from_slice(&text_buf);
        out.push(text_len);

        for i in 0..MEMORY_WINDOW_COUNT {
            let mut window = [0u8; MEMORY_WINDOW_LEN];
            if let Some(data) = self.memory_windows.get(i) {
                let n = data.len().min(MEMORY_WINDOW_LEN);
                window[..n].copy_from_slice(&data[..n]);
            }
            out.extend_from_slice(&window);
        }

        out
    }
}

/// One dumped memory region in the optional full-memory-dump side file.
pub struct MemoryDumpRegion {
    pub start: u64,
    pub length: u64,
    pub protection: u32,
    pub bytes: Vec<u8>,
}

/// One record in the optional per-step memory-access-log side file.
pub struct MemoryAccessRecord {
    pub entry_index: u64,
    pub address: u64,
    pub length: u64,
    pub is_write: bool,
    pub bytes: Vec<u8>,
}

struct MemoryCacheWriters {
    dump_writer: Option<File>,
    log_writer: Option<File>,
    dumped_once: bool,
}

pub struct TraceRecorder {
    writer: Mutex<Option<File>>,
    memory_cache: Mutex<MemoryCacheWriters>,
    entry_counter: AtomicU64,
    stop_requested: AtomicBool,
    notify_ui_on_stop: AtomicBool,
}

impl TraceRecorder {
    pub fn new() -> TraceRecorder {
        TraceRecorder {
            writer: Mutex::new(None),
            memory_cache: Mutex::new(MemoryCacheWriters {
                dump_writer: None,
                log_writer: None,
                dumped_once: false,
            }),
            entry_counter: AtomicU64::new(0),
            stop_requested: AtomicBool::new(false),
            notify_ui_on_stop: AtomicBool::new(false),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.writer.lock().unwrap().is_some()
    }

    pub fn enable(&self, path: &str, architecture: Architecture) -> EngineResult<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(EngineError::OsError)?;

        let header = TraceHeader {
            magic: MAGIC,
            version: VERSION,
            architecture: architecture_tag(architecture),
            entry_size: TraceEntry::entry_size() as u32,
        };
        file.write_all(&header.to_bytes()).map_err(EngineError::OsError)?;

        *self.writer.lock().unwrap() = Some(file);
        self.entry_counter.store(0, Ordering::SeqCst);
        self.stop_requested.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Closes the file immediately; one pending entry may race and be
    /// dropped (§5: "may race with one pending entry, which is dropped").
    pub fn disable(&self) {
        *self.writer.lock().unwrap() = None;
    }

    pub fn write_entry(&self, entry: &TraceEntry) -> EngineResult<u64> {
        let mut guard = self.writer.lock().unwrap();
        let file = match guard.as_mut() {
            Some(f) => f,
            None => return Ok(self.entry_counter.load(Ordering::SeqCst)),
        };
        file.write_all(&entry.to_bytes()).map_err(EngineError::OsError)?;
        Ok(self.entry_counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn enable_full_memory_cache(&self, dump_path: &str, log_path: &str) -> EngineResult<()> {
        let dump_writer = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(dump_path)
            .map_err(EngineError::OsError)?;
        let log_writer = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(log_path)
            .map_err(EngineError::OsError)?;

        let mut cache = self.memory_cache.lock().unwrap();
        cache.dump_writer = Some(dump_writer);
        cache.log_writer = Some(log_writer);
        cache.dumped_once = false;
        Ok(())
    }

    pub fn disable_full_memory_cache(&self) {
        let mut cache = self.memory_cache.lock().unwrap();
        cache.dump_writer = None;
        cache.log_writer = None;
        cache.dumped_once = false;
    }

    pub fn full_memory_cache_enabled(&self) -> bool {
        self.memory_cache.lock().unwrap().dump_writer.is_some()
    }

    /// Dumps every readable region once per enabled session (§4.D "if
    /// `full_memory_cache` is enabled and this is the first hit").
    pub fn dump_regions_if_first_hit(&self, regions: &[MemoryDumpRegion]) -> EngineResult<bool> {
        let mut cache = self.memory_cache.lock().unwrap();
        if cache.dumped_once {
            return Ok(false);
        }
        let writer = match cache.dump_writer.as_mut() {
            Some(w) => w,
            None => return Ok(false),
        };

        for region in regions {
            writer.write_all(&region.start.to_le_bytes()).map_err(EngineError::OsError)?;
            writer.write_all(&region.length.to_le_bytes()).map_err(EngineError::OsError)?;
            writer.write_all(&region.protection.to_le_bytes()).map_err(EngineError::OsError)?;
            writer.write_all(&region.bytes).map_err(EngineError::OsError)?;
        }
        cache.dumped_once = true;
        Ok(true)
    }

    pub fn log_memory_access(&self, record: &MemoryAccessRecord) -> EngineResult<()> {
        let mut cache = self.memory_cache.lock().unwrap();
        let writer = match cache.log_writer.as_mut() {
            Some(w) => w,
            None => return Ok(()),
        };
        writer.write_all(&record.entry_index.to_le_bytes()).map_err(EngineError::OsError)?;
        writer.write_all(&record.address.to_le_bytes()).map_err(EngineError::OsError)?;
        writer.write_all(&record.length.to_le_bytes()).map_err(EngineError::OsError)?;
        writer.write_all(&[record.is_write as u8]).map_err(EngineError::OsError)?;
        writer.write_all(&record.bytes).map_err(EngineError::OsError)?;
        Ok(())
    }

    /// Request a clean stop at the next step boundary (§4.E, §5).
    pub fn request_stop(&self, notify_ui: bool) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.notify_ui_on_stop.store(notify_ui, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub fn take_notify_ui_on_stop(&self) -> bool {
        self.stop_requested.store(false, Ordering::SeqCst);
        self.notify_ui_on_stop.swap(false, Ordering::SeqCst)
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_counter.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::x86_64::X86_64Gprs;
    use std::io::Read;

    #[test]
    fn header_and_entry_round_trip_to_a_real_file() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("ddbg-trace-test-{}.bin", std::process::id()));
        let path_str = path.to_str().unwrap();

        let recorder = TraceRecorder::new();
        recorder.enable(path_str, Architecture::X86_64).unwrap();

        let entry = TraceEntry {
            timestamp_micros: 42,
            registers: GprSnapshot::X86_64(X86_64Gprs::default()),
            instruction_bytes: [0x90, 0x90, 0x90, 0x90],
            instruction_text: Some("nop".to_string()),
            memory_windows: vec![],
        };
        let count = recorder.write_entry(&entry).unwrap();
        assert_eq!(count, 1);
        recorder.disable();

        let mut file = File::open(&path).unwrap();
        let mut contents = Vec::new();
        file.read_to_end(&mut contents).unwrap();
        assert_eq!(&contents[0..4], b"DDBG");
        assert!(contents.len() > 13);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn stop_request_clears_after_being_observed() {
        let recorder = TraceRecorder::new();
        recorder.request_stop(true);
        assert!(recorder.is_stop_requested());
        assert!(recorder.take_notify_ui_on_stop());
        assert!(!recorder.is_stop_requested());
    }

    #[test]
    fn full_memory_dump_only_happens_once() {
        let dir = std::env::temp_dir();
        let dump_path = dir.join(format!("ddbg-dump-test-{}.bin", std::process::id()));
        let log_path = dir.join(format!("ddbg-log-test-{}.bin", std::process::id()));

        let recorder = TraceRecorder::new();
        recorder
            .enable_full_memory_cache(dump_path.to_str().unwrap(), log_path.to_str().unwrap())
            .unwrap();

        let region = MemoryDumpRegion {
            start: 0x1000,
            length: 4,
            protection: 0b101,
            bytes: vec![1, 2, 3, 4],
        };
        assert!(recorder.dump_regions_if_first_hit(&[region]).unwrap());

        let region_again = MemoryDumpRegion {
            start: 0x2000,
            length: 4,
            protection: 0b101,
            bytes: vec![5, 6, 7, 8],
        };
        assert!(!recorder.dump_regions_if_first_hit(&[region_again]).unwrap());

        std::fs::remove_file(&dump_path).ok();
        std::fs::remove_file(&log_path).ok();
    }
}
