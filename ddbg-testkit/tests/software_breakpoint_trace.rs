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

use std::fs;
use std::time::Duration;

use ddbg_engine::command::{Command, CommandResponse};
use ddbg_testkit::{compile_tracee, parse_hex_address, read_line, spawn_and_attach, wait_for_stop};

/// S2: a software breakpoint with a target count of 5 against a function
/// called 6 times records exactly one trace pass, restores the original
/// bytes once the count is reached, and leaves the 6th call unaffected.
#[test]
fn software_breakpoint_trace_runs_for_target_count_then_self_removes() {
    let binary = compile_tracee("sw_breakpoint_trace.c").expect("compile fixture");
    let mut tracee = spawn_and_attach(&binary).expect("attach");
    let pid = tracee.child.id();

    wait_for_stop(&tracee, pid, "rip", Duration::from_secs(2)).expect("initial attach stop");

    let stdout = tracee.child.stdout.as_mut().expect("piped stdout");
    let leaf_addr = parse_hex_address(&read_line(stdout).expect("leaf address line")).expect("parse address");

    let trace_path = format!("/tmp/ddbg-trace-{}.bin", std::process::id());
    tracee.submit(Command::EnableTraceFile { path: trace_path.clone() }).expect("enable trace");

    match tracee.submit(Command::SetSwBreakpoint { addr: leaf_addr, target_count: 5 }) {
        Ok(CommandResponse::Slot(_)) => {}
        other => panic!("unexpected response setting breakpoint: {other:?}"),
    }

    tracee.submit(Command::Continue { tid: pid }).expect("continue past attach stop");

    // The engine single-steps through all 5 hits internally and tears the
    // slot down without handing control back. If the original bytes were
    // not restored, the 6th call would trap into a torn-down slot with
    // nothing left to resolve it; reaching "done" is proof they were.
    let stdout = tracee.child.stdout.as_mut().expect("piped stdout");
    assert_eq!(read_line(stdout).expect("done line"), "done");

    let status = tracee.child.wait().expect("wait for exit");
    assert!(status.success());

    let trace_bytes = fs::read(&trace_path).expect("trace file written");
    assert!(trace_bytes.len() > 4, "trace file should contain a header plus recorded entries");
    assert_eq!(&trace_bytes[0..4], b"DDBG");

    let _ = fs::remove_file(&trace_path);
}
