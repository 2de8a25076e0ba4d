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

//! Black-box test helpers: compile a C tracee, spawn it stopped, attach an
//! engine, and synchronize with it over a pipe the way the teacher's own
//! integration tests synchronize over the tracee's stdout.

use std::error::Error;
use std::io::Read;
use std::process::{Child, Command as ProcessCommand, Stdio};
use std::time::{Duration, Instant};

use ddbg_engine::command::{Command, CommandResponse, CommandSender};
use ddbg_engine::engine::{self, EngineConfig};
use ddbg_engine::error::EngineResult;

/// Compile a C fixture from `ddbg-testkit/tracee/` into `/tmp`, mirroring
/// `integration_test::compile_source` but narrowed to the one language this
/// engine's tests need (the target process itself, not the host build).
pub fn compile_tracee(filename: &str) -> Result<String, Box<dyn Error>> {
    let source_path = format!("{}/tracee/{}", env!("CARGO_MANIFEST_DIR"), filename);
    let binary_path = format!("/tmp/ddbg-tracee-{}-{}", filename.replace('.', "-"), std::process::id());

    let cc = std::env::var("CC").unwrap_or_else(|_| "cc".to_string());
    let status = ProcessCommand::new(cc)
        .args([&source_path, "-O0", "-g", "-lpthread", "-o", &binary_path])
        .spawn()?
        .wait()?;
    assert_eq!(status.code(), Some(0));

    Ok(binary_path)
}

/// One line of stdout from a tracee that announces readiness or a target
/// address (the fixtures `printf` these so tests never need symbol lookup,
/// which is explicitly out of scope for the engine itself).
pub fn read_line(stdout: &mut impl Read) -> Result<String, Box<dyn Error>> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stdout.read(&mut byte)?;
        if n == 0 || byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
    }
    Ok(String::from_utf8(line)?)
}

pub fn parse_hex_address(line: &str) -> Result<u64, Box<dyn Error>> {
    let trimmed = line.trim().trim_start_matches("0x");
    Ok(u64::from_str_radix(trimmed, 16)?)
}

/// A running tracee plus the engine attached to it.
pub struct AttachedTracee {
    pub child: Child,
    pub sender: CommandSender,
}

impl AttachedTracee {
    pub fn submit(&self, command: Command) -> EngineResult<CommandResponse> {
        self.sender.submit(command)
    }
}

impl Drop for AttachedTracee {
    fn drop(&mut self) {
        let _ = self.sender.submit(Command::Detach);
        let _ = self.sender.submit(Command::Shutdown);
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Spawn `binary_path` with its stdout piped, attach the engine to it, and
/// return both. The fixture itself is responsible for announcing readiness
/// on stdout before doing anything interesting.
pub fn spawn_and_attach(binary_path: &str) -> Result<AttachedTracee, Box<dyn Error>> {
    let child = ProcessCommand::new(binary_path).stdout(Stdio::piped()).spawn()?;
    let pid = child.id();

    let (sender, _handle) = engine::spawn(EngineConfig::default());
    sender.submit(Command::Attach { pid })?;

    Ok(AttachedTracee { child, sender })
}

/// Poll `read_register` on `tid` until the thread reports stopped, bounded
/// by `timeout` (the engine's own stop detection is async to the caller).
pub fn wait_for_stop(
    tracee: &AttachedTracee,
    tid: u32,
    name: &str,
    timeout: Duration,
) -> Result<u64, Box<dyn Error>> {
    let deadline = Instant::now() + timeout;
    loop {
        match tracee.submit(Command::ReadRegister { tid, name: name.to_string() }) {
            Ok(CommandResponse::Value(value)) => return Ok(value),
            _ => {
                if Instant::now() >= deadline {
                    return Err("timed out waiting for thread to stop".into());
                }
                std::thread::sleep(Duration::from_millis(5));
            }
        }
    }
}
