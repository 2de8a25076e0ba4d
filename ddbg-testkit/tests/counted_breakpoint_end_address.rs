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

use std::time::Duration;

use ddbg_engine::command::{Command, CommandResponse};
use ddbg_testkit::{compile_tracee, parse_hex_address, read_line, spawn_and_attach, wait_for_stop};

/// S4: a counted hardware breakpoint whose count is reached long before
/// the function at `end_addr` is ever called. The count terminator must
/// win the race and tear the trace down on its own, well before the
/// single call to `func_ret` could possibly supply the other terminator.
#[test]
fn counted_breakpoint_terminates_on_count_before_end_address() {
    let binary = compile_tracee("counted_with_end.c").expect("compile fixture");
    let mut tracee = spawn_and_attach(&binary).expect("attach");
    let pid = tracee.child.id();

    wait_for_stop(&tracee, pid, "rip", Duration::from_secs(2)).expect("initial attach stop");

    let stdout = tracee.child.stdout.as_mut().expect("piped stdout");
    let entry_addr = parse_hex_address(&read_line(stdout).expect("func_entry address line")).expect("parse address");
    let ret_addr = parse_hex_address(&read_line(stdout).expect("func_ret address line")).expect("parse address");

    match tracee.submit(Command::SetHwBreakpoint { addr: entry_addr, target_count: 1000, end_addr: ret_addr }) {
        Ok(CommandResponse::Slot(_)) => {}
        other => panic!("unexpected response setting breakpoint: {other:?}"),
    }

    tracee.submit(Command::Continue { tid: pid }).expect("continue past attach stop");

    // func_entry is called 2000 times before func_ret is ever reached, so
    // the count terminator fires at call 1000 and the breakpoint tears
    // itself down; the remaining 1000 calls and the single func_ret call
    // run completely untrapped.
    let stdout = tracee.child.stdout.as_mut().expect("piped stdout");
    assert_eq!(read_line(stdout).expect("done line"), "done");

    let status = tracee.child.wait().expect("wait for exit");
    assert!(status.success());
}
