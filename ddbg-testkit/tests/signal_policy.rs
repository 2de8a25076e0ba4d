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
use ddbg_engine::SignalDisposition;
use ddbg_testkit::{compile_tracee, read_line, spawn_and_attach, wait_for_stop};

/// S5: catch=true, pass=false on SIGSEGV notifies the caller but swallows
/// the signal on continue, so the raise(2) call returns normally instead
/// of the process dying to the default disposition.
#[test]
fn sigsegv_caught_and_swallowed_lets_process_continue() {
    let binary = compile_tracee("signal_sigsegv.c").expect("compile fixture");
    let mut tracee = spawn_and_attach(&binary).expect("attach");
    let pid = tracee.child.id();

    wait_for_stop(&tracee, pid, "rip", Duration::from_secs(2)).expect("initial attach stop");

    let stdout = tracee.child.stdout.as_mut().expect("piped stdout");
    assert_eq!(read_line(stdout).expect("ready line"), "ready");

    match tracee.submit(Command::SetSignalPolicy {
        signal: libc::SIGSEGV,
        disposition: SignalDisposition { catch: true, pass: false },
    }) {
        Ok(CommandResponse::Ok) => {}
        other => panic!("unexpected response setting signal policy: {other:?}"),
    }

    tracee.submit(Command::Continue { tid: pid }).expect("continue past attach stop");

    wait_for_stop(&tracee, pid, "rip", Duration::from_secs(2)).expect("SIGSEGV stop");

    match tracee.submit(Command::GetSignalPolicy { signal: libc::SIGSEGV }) {
        Ok(CommandResponse::Disposition(disposition)) => {
            assert!(disposition.catch);
            assert!(!disposition.pass);
        }
        other => panic!("unexpected response reading signal policy: {other:?}"),
    }

    tracee.submit(Command::Continue { tid: pid }).expect("continue past SIGSEGV");

    let stdout = tracee.child.stdout.as_mut().expect("piped stdout");
    assert_eq!(read_line(stdout).expect("done line"), "done");

    let status = tracee.child.wait().expect("wait for exit");
    assert!(status.success());
}
