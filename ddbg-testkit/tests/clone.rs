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

/// S6: a breakpoint set before a thread spawns is armed on the new thread
/// too, by way of `PTRACE_EVENT_CLONE`/the clone dispatch path re-arming
/// every existing slot on the freshly observed tid.
#[test]
fn breakpoint_propagates_to_spawned_thread() {
    let binary = compile_tracee("clone.c").expect("compile fixture");
    let mut tracee = spawn_and_attach(&binary).expect("attach");
    let pid = tracee.child.id();

    wait_for_stop(&tracee, pid, "rip", Duration::from_secs(2)).expect("initial attach stop");

    let stdout = tracee.child.stdout.as_mut().expect("piped stdout");
    let worker_addr = parse_hex_address(&read_line(stdout).expect("worker address line")).expect("parse address");

    match tracee.submit(Command::SetHwBreakpoint { addr: worker_addr, target_count: 0, end_addr: 0 }) {
        Ok(CommandResponse::Slot(_)) => {}
        other => panic!("unexpected response setting breakpoint: {other:?}"),
    }

    tracee.submit(Command::Continue { tid: pid }).expect("continue past attach stop");

    // The breakpoint fires on the spawned worker thread, not the main
    // thread, so poll every known tid rather than assuming pid itself.
    let mut hit_tid = None;
    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    while hit_tid.is_none() && std::time::Instant::now() < deadline {
        for candidate in std::fs::read_dir(format!("/proc/{pid}/task"))
            .expect("read task dir")
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().and_then(|s| s.parse::<u32>().ok()))
        {
            if let Ok(CommandResponse::Value(rip)) =
                tracee.submit(Command::ReadRegister { tid: candidate, name: "rip".to_string() })
            {
                if rip == worker_addr {
                    hit_tid = Some(candidate);
                    break;
                }
            }
        }
        if hit_tid.is_none() {
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    let hit_tid = hit_tid.expect("breakpoint should fire on the worker thread");
    tracee.submit(Command::RemoveBreakpoint { addr: worker_addr }).expect("remove breakpoint");
    tracee.submit(Command::Continue { tid: hit_tid }).expect("continue worker thread");

    let stdout = tracee.child.stdout.as_mut().expect("piped stdout");
    assert_eq!(read_line(stdout).expect("done line"), "done");

    let status = tracee.child.wait().expect("wait for exit");
    assert!(status.success());
}
