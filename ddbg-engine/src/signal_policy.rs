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

//! The process-wide signal disposition table (§3, §4.D).

use std::collections::HashMap;
use std::sync::Mutex;

/// Independent catch/pass bits (§3: "mapping from signal number →
/// `{catch: bool, pass: bool}`"). The four combinations are distinct
/// (§8 property 6): neither bit implies the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalDisposition {
    /// Stop the process and report the signal to the caller.
    pub catch: bool,
    /// Deliver the signal to the tracee on the next continue.
    pub pass: bool,
}

/// Signals that are never subject to the table: the tracer always lets
/// these pass through undisturbed (§3). `SIGPWR` is used by some init
/// systems for power-event notification and `SIGXCPU` by batch job
/// schedulers enforcing CPU-time limits; neither should ever be
/// swallowed by a debugger sitting in the delivery path.
const ALWAYS_PASS: &[i32] = &[libc::SIGPWR, libc::SIGXCPU];
const ALWAYS_PASS_DISPOSITION: SignalDisposition = SignalDisposition { catch: false, pass: true };

/// Default disposition for signals absent from the table: stop-worthy
/// signals (e.g. `SIGSEGV`, `SIGABRT`) are caught by default so a crash
/// isn't silently swallowed before the caller can observe it, and not
/// redelivered until the caller says so.
const DEFAULT_DISPOSITION: SignalDisposition = SignalDisposition { catch: true, pass: false };

/// Persists across detach/reattach (§3: "process-wide, independent of the
/// event loop"), so a caller's signal policy survives a `detach` +
/// `attach` cycle against the same target.
pub struct SignalPolicyTable {
    dispositions: Mutex<HashMap<i32, SignalDisposition>>,
}

impl SignalPolicyTable {
    pub fn new() -> SignalPolicyTable {
        SignalPolicyTable {
            dispositions: Mutex::new(HashMap::new()),
        }
    }

    pub fn set(&self, signal: i32, disposition: SignalDisposition) {
        if ALWAYS_PASS.contains(&signal) {
            log::warn!("signal {signal} always passes through and cannot be overridden");
            return;
        }
        self.dispositions.lock().unwrap().insert(signal, disposition);
    }

    pub fn get(&self, signal: i32) -> SignalDisposition {
        if ALWAYS_PASS.contains(&signal) {
            return ALWAYS_PASS_DISPOSITION;
        }
        self.dispositions
            .lock()
            .unwrap()
            .get(&signal)
            .copied()
            .unwrap_or(DEFAULT_DISPOSITION)
    }

    pub fn remove(&self, signal: i32) {
        self.dispositions.lock().unwrap().remove(&signal);
    }

    pub fn snapshot(&self) -> HashMap<i32, SignalDisposition> {
        self.dispositions.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_signal_defaults_to_catch_without_pass() {
        let table = SignalPolicyTable::new();
        assert_eq!(table.get(libc::SIGSEGV), DEFAULT_DISPOSITION);
    }

    #[test]
    fn explicit_disposition_is_honored() {
        let table = SignalPolicyTable::new();
        table.set(libc::SIGUSR1, SignalDisposition { catch: false, pass: true });
        assert_eq!(table.get(libc::SIGUSR1), SignalDisposition { catch: false, pass: true });
    }

    #[test]
    fn sigpwr_and_sigxcpu_always_pass_regardless_of_table() {
        let table = SignalPolicyTable::new();
        table.set(libc::SIGPWR, SignalDisposition { catch: true, pass: false });
        assert_eq!(table.get(libc::SIGPWR), ALWAYS_PASS_DISPOSITION);
        assert_eq!(table.get(libc::SIGXCPU), ALWAYS_PASS_DISPOSITION);
    }

    #[test]
    fn remove_reverts_to_default() {
        let table = SignalPolicyTable::new();
        table.set(libc::SIGTERM, SignalDisposition { catch: false, pass: true });
        table.remove(libc::SIGTERM);
        assert_eq!(table.get(libc::SIGTERM), DEFAULT_DISPOSITION);
    }
}
