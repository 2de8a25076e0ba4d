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

/// S1: a hardware breakpoint with no target count stops the thread once
/// and leaves it parked in wait mode rather than trace mode.
#[test]
fn hardware_breakpoint_stops_thread_once() {
    let binary = compile_tracee("hw_breakpoint.c").expect("compile fixture");
    let mut tracee = spawn_and_attach(&binary).expect("attach");
    let pid = tracee.child.id();

    wait_for_stop(&tracee, pid, "rip", Duration::from_secs(2)).expect("initial attach stop");

    let stdout = tracee.child.stdout.as_mut().expect("piped stdout");
    let target_addr = parse_hex_address(&read_line(stdout).expect("target address line")).expect("parse address");

    match tracee.submit(Command::SetHwBreakpoint { addr: target_addr, target_count: 0, end_addr: 0 }) {
        Ok(CommandResponse::Slot(_)) => {}
        other => panic!("unexpected response setting breakpoint: {other:?}"),
    }

    tracee.submit(Command::Continue { tid: pid }).expect("continue past attach stop");

    let rip = wait_for_stop(&tracee, pid, "rip", Duration::from_secs(2)).expect("breakpoint stop");
    assert_eq!(rip, target_addr, "thread should be parked exactly at the breakpoint address");

    tracee.submit(Command::RemoveBreakpoint { addr: target_addr }).expect("remove breakpoint");
    tracee.submit(Command::Continue { tid: pid }).expect("continue to exit");

    let stdout = tracee.child.stdout.as_mut().expect("piped stdout");
    assert_eq!(read_line(stdout).expect("in-target line"), "in-target");
    assert_eq!(read_line(stdout).expect("done line"), "done");

    let status = tracee.child.wait().expect("wait for exit");
    assert!(status.success());
}
