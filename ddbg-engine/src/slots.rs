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

//! Fixed-capacity breakpoint and watchpoint tables (§3, §4.B).
//!
//! Each table guards its slot *data* with one mutex; per-slot *removal*
//! is interlocked separately through [`RemovalInterlock`], an atomic-bit
//! pair plus a condition variable, so that a hit handler already in
//! flight for a slot can finish observing it even while a concurrent
//! `remove` call is waiting for that to happen (invariant 5 in §3).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::error::{EngineError, EngineResult};

/// How long `remove` waits for in-flight hit handlers before forcing the
/// interlock open and logging a warning (§3, §7 `Timeout`).
pub const REMOVAL_WAIT_TIMEOUT: Duration = Duration::from_secs(1);

pub const MAX_HW_BREAKPOINTS: usize = 16;
pub const MAX_SW_BREAKPOINTS: usize = 64;
pub const MAX_WATCHPOINTS: usize = 4;

struct InterlockState {
    is_removing: bool,
    in_flight: usize,
}

/// Per-slot removal interlock: an `is_removing` flag plus a count of
/// in-flight hit handlers (§3).
pub struct RemovalInterlock {
    state: Mutex<InterlockState>,
    became_idle: Condvar,
}

impl RemovalInterlock {
    fn new() -> RemovalInterlock {
        RemovalInterlock {
            state: Mutex::new(InterlockState {
                is_removing: false,
                in_flight: 0,
            }),
            became_idle: Condvar::new(),
        }
    }

    /// Register a hit handler about to observe this slot. Returns `None`
    /// if the slot is mid-removal, in which case the caller must not
    /// treat the slot as live (invariant 5).
    pub fn try_enter(&self) -> Option<HandlerGuard<'_>> {
        let mut state = self.state.lock().unwrap();
        if state.is_removing {
            return None;
        }
        state.in_flight += 1;
        Some(HandlerGuard { interlock: self })
    }

    /// Mark the slot as removing, then wait (bounded) for any in-flight
    /// handlers to drain. Returns `true` if the wait completed cleanly,
    /// `false` if the bound was hit and the counter was force-reset.
    pub fn begin_and_wait_for_drain(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        state.is_removing = true;

        let (mut state, timeout_result) = self
            .became_idle
            .wait_timeout_while(state, REMOVAL_WAIT_TIMEOUT, |s| s.in_flight != 0)
            .unwrap();

        let clean = !timeout_result.timed_out();
        if !clean {
            state.in_flight = 0;
        }
        clean
    }

    /// Reset the interlock after a slot has been cleared, ready for reuse.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.is_removing = false;
        state.in_flight = 0;
    }
}

pub struct HandlerGuard<'a> {
    interlock: &'a RemovalInterlock,
}

impl<'a> Drop for HandlerGuard<'a> {
    fn drop(&mut self) {
        let mut state = self.interlock.state.lock().unwrap();
        state.in_flight -= 1;
        if state.in_flight == 0 {
            self.interlock.became_idle.notify_all();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointKind {
    Hardware,
    SoftwareWrapped,
}

#[derive(Debug, Clone, Copy)]
pub struct HwBreakpointSlot {
    pub in_use: bool,
    pub address: u64,
    pub hit_count: u64,
    pub target_count: u64,
    /// 0 = unlimited (§3).
    pub end_address: u64,
    pub kind: BreakpointKind,
}

impl Default for HwBreakpointSlot {
    fn default() -> HwBreakpointSlot {
        HwBreakpointSlot {
            in_use: false,
            address: 0,
            hit_count: 0,
            target_count: 0,
            end_address: 0,
            kind: BreakpointKind::Hardware,
        }
    }
}

pub struct HwBreakpointTable {
    slots: Mutex<[HwBreakpointSlot; MAX_HW_BREAKPOINTS]>,
    interlocks: Vec<RemovalInterlock>,
}

impl HwBreakpointTable {
    pub fn new() -> HwBreakpointTable {
        HwBreakpointTable {
            slots: Mutex::new([HwBreakpointSlot::default(); MAX_HW_BREAKPOINTS]),
            interlocks: (0..MAX_HW_BREAKPOINTS).map(|_| RemovalInterlock::new()).collect(),
        }
    }

    /// Insert invariant 1 (slot-uniqueness) is enforced by the caller,
    /// which must check all three tables before calling `allocate`.
    pub fn allocate(&self, address: u64, target_count: u64, end_address: u64) -> EngineResult<usize> {
        let mut slots = self.slots.lock().unwrap();
        let index = slots
            .iter()
            .position(|s| !s.in_use)
            .ok_or(EngineError::OutOfSlots)?;

        slots[index] = HwBreakpointSlot {
            in_use: true,
            address,
            hit_count: 0,
            target_count,
            end_address,
            kind: BreakpointKind::Hardware,
        };
        self.interlocks[index].reset();
        Ok(index)
    }

    pub fn find_by_address(&self, address: u64) -> Option<usize> {
        let slots = self.slots.lock().unwrap();
        slots.iter().position(|s| s.in_use && s.address == address)
    }

    pub fn get(&self, index: usize) -> HwBreakpointSlot {
        self.slots.lock().unwrap()[index]
    }

    pub fn increment_hit_count(&self, index: usize) -> u64 {
        let mut slots = self.slots.lock().unwrap();
        slots[index].hit_count += 1;
        slots[index].hit_count
    }

    pub fn enter_hit_handler(&self, index: usize) -> Option<HandlerGuard<'_>> {
        self.interlocks[index].try_enter()
    }

    /// Clear a slot, waiting for in-flight handlers to drain first
    /// (§4.B `remove_bp`, §7 `Timeout`). Returns `false` if the bounded
    /// wait was exceeded and the interlock had to be force-reset.
    pub fn remove(&self, index: usize) -> bool {
        let clean = self.interlocks[index].begin_and_wait_for_drain();
        if !clean {
            log::warn!(
                "hardware breakpoint slot {index} removal timed out waiting for in-flight handlers; forcing reset"
            );
        }

        let mut slots = self.slots.lock().unwrap();
        slots[index] = HwBreakpointSlot::default();
        drop(slots);

        self.interlocks[index].reset();
        clean
    }

    pub fn in_use_slots(&self) -> Vec<(usize, HwBreakpointSlot)> {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .enumerate()
            .filter(|(_, s)| s.in_use)
            .map(|(i, s)| (i, *s))
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SwBreakpointSlot {
    pub in_use: bool,
    pub address: u64,
    /// First byte meaningful on x86-64; all four on aarch64 (§3).
    pub original_bytes: [u8; 4],
}

impl Default for SwBreakpointSlot {
    fn default() -> SwBreakpointSlot {
        SwBreakpointSlot {
            in_use: false,
            address: 0,
            original_bytes: [0; 4],
        }
    }
}

pub struct SwBreakpointTable {
    slots: Mutex<[SwBreakpointSlot; MAX_SW_BREAKPOINTS]>,
}

impl SwBreakpointTable {
    pub fn new() -> SwBreakpointTable {
        SwBreakpointTable {
            slots: Mutex::new([SwBreakpointSlot::default(); MAX_SW_BREAKPOINTS]),
        }
    }

    pub fn allocate(&self, address: u64, original_bytes: [u8; 4]) -> EngineResult<usize> {
        let mut slots = self.slots.lock().unwrap();
        let index = slots
            .iter()
            .position(|s| !s.in_use)
            .ok_or(EngineError::OutOfSlots)?;

        slots[index] = SwBreakpointSlot {
            in_use: true,
            address,
            original_bytes,
        };
        Ok(index)
    }

    pub fn find_by_address(&self, address: u64) -> Option<usize> {
        let slots = self.slots.lock().unwrap();
        slots.iter().position(|s| s.in_use && s.address == address)
    }

    pub fn get(&self, index: usize) -> SwBreakpointSlot {
        self.slots.lock().unwrap()[index]
    }

    pub fn clear(&self, index: usize) {
        let mut slots = self.slots.lock().unwrap();
        slots[index] = SwBreakpointSlot::default();
    }

    pub fn in_use_slots(&self) -> Vec<(usize, SwBreakpointSlot)> {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .enumerate()
            .filter(|(_, s)| s.in_use)
            .map(|(i, s)| (i, *s))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchpointKind {
    Read,
    Write,
    ReadWrite,
}

impl WatchpointKind {
    pub fn catches_read(self) -> bool {
        matches!(self, WatchpointKind::Read | WatchpointKind::ReadWrite)
    }

    pub fn catches_write(self) -> bool {
        matches!(self, WatchpointKind::Write | WatchpointKind::ReadWrite)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WatchpointSlot {
    pub in_use: bool,
    pub address: u64,
    pub size: u8,
    pub kind: WatchpointKind,
    /// Incremented while a hit handler is reprogramming this watchpoint;
    /// decremented on completion, mirroring the hardware-breakpoint
    /// interlock but tracked inline since a watchpoint hit touches every
    /// thread's debug registers rather than a single slot's.
    pub in_flight: u32,
}

impl Default for WatchpointSlot {
    fn default() -> WatchpointSlot {
        WatchpointSlot {
            in_use: false,
            address: 0,
            size: 0,
            kind: WatchpointKind::Write,
            in_flight: 0,
        }
    }
}

pub struct WatchpointTable {
    slots: Mutex<[WatchpointSlot; MAX_WATCHPOINTS]>,
    interlocks: Vec<RemovalInterlock>,
}

impl WatchpointTable {
    pub fn new() -> WatchpointTable {
        WatchpointTable {
            slots: Mutex::new([WatchpointSlot::default(); MAX_WATCHPOINTS]),
            interlocks: (0..MAX_WATCHPOINTS).map(|_| RemovalInterlock::new()).collect(),
        }
    }

    pub fn allocate(&self, address: u64, size: u8, kind: WatchpointKind) -> EngineResult<usize> {
        let mut slots = self.slots.lock().unwrap();
        let index = slots
            .iter()
            .position(|s| !s.in_use)
            .ok_or(EngineError::OutOfSlots)?;

        slots[index] = WatchpointSlot {
            in_use: true,
            address,
            size,
            kind,
            in_flight: 0,
        };
        self.interlocks[index].reset();
        Ok(index)
    }

    /// Find the slot whose range includes `address`, falling back to an
    /// 8-byte-aligned comparison (§4.D "locate a matching watchpoint by
    /// interval inclusion, falling back to 8-byte-aligned compare").
    pub fn find_containing(&self, address: u64) -> Option<usize> {
        let slots = self.slots.lock().unwrap();
        if let Some(index) = slots
            .iter()
            .position(|s| s.in_use && address >= s.address && address < s.address + s.size as u64)
        {
            return Some(index);
        }

        let aligned = address & !7;
        slots
            .iter()
            .position(|s| s.in_use && (s.address & !7) == aligned)
    }

    pub fn find_by_address(&self, address: u64) -> Option<usize> {
        let slots = self.slots.lock().unwrap();
        slots.iter().position(|s| s.in_use && s.address == address)
    }

    pub fn get(&self, index: usize) -> WatchpointSlot {
        self.slots.lock().unwrap()[index]
    }

    pub fn enter_hit_handler(&self, index: usize) -> Option<HandlerGuard<'_>> {
        self.interlocks[index].try_enter()
    }

    /// Adjust the slot's own in-flight counter (§3: "decrement/increment
    /// the in-flight counter on the slot" while a hit is being handled).
    /// Distinct from the removal interlock's counter, which tracks
    /// [`RemovalInterlock`] guards rather than this bookkeeping field.
    pub fn adjust_in_flight(&self, index: usize, delta: i32) {
        let mut slots = self.slots.lock().unwrap();
        slots[index].in_flight = (slots[index].in_flight as i32 + delta).max(0) as u32;
    }

    pub fn remove(&self, index: usize) -> bool {
        let clean = self.interlocks[index].begin_and_wait_for_drain();
        if !clean {
            log::warn!(
                "watchpoint slot {index} removal timed out waiting for in-flight handlers; forcing reset"
            );
        }

        let mut slots = self.slots.lock().unwrap();
        slots[index] = WatchpointSlot::default();
        drop(slots);

        self.interlocks[index].reset();
        clean
    }

    pub fn in_use_slots(&self) -> Vec<(usize, WatchpointSlot)> {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .enumerate()
            .filter(|(_, s)| s.in_use)
            .map(|(i, s)| (i, *s))
            .collect()
    }

    /// True while any non-removing watchpoint is armed (§4.D watchpoint
    /// step-complete handling: "reapply every non-removing watchpoint").
    pub fn is_removing(&self, index: usize) -> bool {
        self.interlocks[index].try_enter().is_none()
    }
}

/// Check all three tables for an existing slot at `address` (invariant
///1: "at most one slot in any of the three tables has a given target
/// address").
pub fn address_is_armed(
    hw: &HwBreakpointTable,
    sw: &SwBreakpointTable,
    wp: &WatchpointTable,
    address: u64,
) -> bool {
    hw.find_by_address(address).is_some()
        || sw.find_by_address(address).is_some()
        || wp.find_by_address(address).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn allocate_and_find_round_trip() {
        let table = HwBreakpointTable::new();
        let index = table.allocate(0x1000, 0, 0).unwrap();
        assert_eq!(table.find_by_address(0x1000), Some(index));
        assert_eq!(table.get(index).address, 0x1000);
    }

    #[test]
    fn out_of_slots_is_reported() {
        let table = HwBreakpointTable::new();
        for i in 0..MAX_HW_BREAKPOINTS {
            table.allocate((i as u64) * 4, 0, 0).unwrap();
        }
        assert!(matches!(table.allocate(0xFFFF, 0, 0), Err(EngineError::OutOfSlots)));
    }

    #[test]
    fn sw_breakpoint_preserves_original_bytes_slot() {
        let table = SwBreakpointTable::new();
        let index = table.allocate(0x2000, [0x55, 0x48, 0x89, 0xE5]).unwrap();
        assert_eq!(table.get(index).original_bytes, [0x55, 0x48, 0x89, 0xE5]);
        table.clear(index);
        assert!(!table.get(index).in_use);
    }

    #[test]
    fn watchpoint_interval_inclusion_then_aligned_fallback() {
        let table = WatchpointTable::new();
        let index = table.allocate(0x3000, 4, WatchpointKind::Write).unwrap();
        assert_eq!(table.find_containing(0x3001), Some(index));
        assert_eq!(table.find_containing(0x3007), Some(index));
        assert_eq!(table.find_containing(0x3008), None);
    }

    #[test]
    fn removal_waits_for_in_flight_handler_then_clears() {
        let table = Arc::new(HwBreakpointTable::new());
        let index = table.allocate(0x4000, 0, 0).unwrap();

        let guard = table.enter_hit_handler(index).unwrap();
        let table_clone = table.clone();
        let remover = thread::spawn(move || {
            table_clone.remove(index);
        });

        // Give the remover a moment to observe is_removing before we
        // release the handler; not required for correctness, only to
        // exercise the interleaving.
        thread::sleep(Duration::from_millis(20));
        drop(guard);

        remover.join().unwrap();
        assert!(!table.get(index).in_use);
    }

    #[test]
    fn removal_interlock_blocks_new_handlers_while_removing() {
        let interlock = RemovalInterlock::new();
        let guard = interlock.try_enter().unwrap();
        interlock.state.lock().unwrap().is_removing = true;
        assert!(interlock.try_enter().is_none());
        drop(guard);
    }
}
