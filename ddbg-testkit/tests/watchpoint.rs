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
use ddbg_engine::slots::WatchpointKind;
use ddbg_testkit::{compile_tracee, parse_hex_address, read_line, spawn_and_attach, wait_for_stop};

/// S3: a write watchpoint retriggers on every write to the watched word,
/// since the engine disarms only for the single step past each hit and
/// reapplies the whole bank immediately after.
#[test]
fn watchpoint_retriggers_on_every_write() {
    let binary = compile_tracee("watchpoint.c").expect("compile fixture");
    let mut tracee = spawn_and_attach(&binary).expect("attach");
    let pid = tracee.child.id();

    wait_for_stop(&tracee, pid, "rip", Duration::from_secs(2)).expect("initial attach stop");

    let stdout = tracee.child.stdout.as_mut().expect("piped stdout");
    let counter_addr = parse_hex_address(&read_line(stdout).expect("counter address line")).expect("parse address");

    match tracee.submit(Command::SetWatchpoint { addr: counter_addr, size: 4, kind: WatchpointKind::Write }) {
        Ok(CommandResponse::Slot(_)) => {}
        other => panic!("unexpected response setting watchpoint: {other:?}"),
    }

    tracee.submit(Command::Continue { tid: pid }).expect("continue past attach stop");

    for _ in 0..3 {
        wait_for_stop(&tracee, pid, "rip", Duration::from_secs(2)).expect("watchpoint hit");
        tracee.submit(Command::Continue { tid: pid }).expect("continue past watchpoint hit");
    }

    tracee.submit(Command::RemoveWatchpoint { addr: counter_addr }).expect("remove watchpoint");

    let stdout = tracee.child.stdout.as_mut().expect("piped stdout");
    assert_eq!(read_line(stdout).expect("done line"), "done");

    let status = tracee.child.wait().expect("wait for exit");
    assert!(status.success());
}
