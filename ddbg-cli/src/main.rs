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

mod commandline;

use std::error::Error;
use std::io::{self, BufRead, Write};

use clap::Parser;
use ddbg_engine::command::{Command, CommandResponse};
use ddbg_engine::engine::{self, EngineConfig};
use ddbg_engine::signal_policy::SignalDisposition;
use ddbg_engine::slots::WatchpointKind;

fn parse_u64(text: &str) -> Result<u64, Box<dyn Error>> {
    let text = text.trim();
    let (digits, radix) = match text.strip_prefix("0x") {
        Some(hex) => (hex, 16),
        None => (text, 10),
    };
    Ok(u64::from_str_radix(digits, radix)?)
}

fn watchpoint_kind(text: &str) -> Result<WatchpointKind, Box<dyn Error>> {
    match text {
        "r" => Ok(WatchpointKind::Read),
        "w" => Ok(WatchpointKind::Write),
        "rw" => Ok(WatchpointKind::ReadWrite),
        other => Err(format!("unknown watchpoint kind {other:?}, expected r/w/rw").into()),
    }
}

fn print_response(response: CommandResponse) {
    match response {
        CommandResponse::Ok => println!("ok"),
        CommandResponse::Slot(index) => println!("slot {index}"),
        CommandResponse::Value(value) => println!("{value:#x}"),
        CommandResponse::Bytes(bytes) => println!("{}", bytes.iter().map(|b| format!("{b:02x}")).collect::<String>()),
        CommandResponse::Disposition(disposition) => {
            println!("catch={} pass={}", disposition.catch, disposition.pass)
        }
    }
}

/// Translate one REPL line into a `Command`. Returns `None` for blank
/// lines and the literal `quit`/`detach` terminators.
fn parse_line(line: &str) -> Result<Option<Command>, Box<dyn Error>> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let command = match words.as_slice() {
        [] => return Ok(None),
        ["quit"] | ["exit"] => return Ok(None),
        ["detach"] => Command::Detach,
        ["break", "hw", addr] => Command::SetHwBreakpoint { addr: parse_u64(addr)?, target_count: 0, end_addr: 0 },
        ["break", "hw", addr, count] => {
            Command::SetHwBreakpoint { addr: parse_u64(addr)?, target_count: parse_u64(count)?, end_addr: 0 }
        }
        ["break", "hw", addr, count, end] => Command::SetHwBreakpoint {
            addr: parse_u64(addr)?,
            target_count: parse_u64(count)?,
            end_addr: parse_u64(end)?,
        },
        ["break", "sw", addr] => Command::SetSwBreakpoint { addr: parse_u64(addr)?, target_count: 0 },
        ["break", "sw", addr, count] => {
            Command::SetSwBreakpoint { addr: parse_u64(addr)?, target_count: parse_u64(count)? }
        }
        ["rmbreak", addr] => Command::RemoveBreakpoint { addr: parse_u64(addr)? },
        ["watch", addr, size, kind] => Command::SetWatchpoint {
            addr: parse_u64(addr)?,
            size: size.parse()?,
            kind: watchpoint_kind(kind)?,
        },
        ["rmwatch", addr] => Command::RemoveWatchpoint { addr: parse_u64(addr)? },
        ["pause", tid] => Command::Pause { tid: tid.parse()? },
        ["continue", tid] => Command::Continue { tid: tid.parse()? },
        ["step", tid] => Command::SingleStep { tid: tid.parse()? },
        ["reg", "get", tid, name] => Command::ReadRegister { tid: tid.parse()?, name: (*name).to_string() },
        ["reg", "set", tid, name, value] => {
            Command::WriteRegister { tid: tid.parse()?, name: (*name).to_string(), value: parse_u64(value)? }
        }
        ["mem", "read", addr, len] => Command::ReadMemory { addr: parse_u64(addr)?, len: len.parse()? },
        ["mem", "write", addr, hexbytes] => {
            let bytes = (0..hexbytes.len())
                .step_by(2)
                .map(|i| u8::from_str_radix(&hexbytes[i..i + 2], 16))
                .collect::<Result<Vec<u8>, _>>()?;
            Command::WriteMemory { addr: parse_u64(addr)?, bytes }
        }
        ["trace", "on", path] => Command::EnableTraceFile { path: (*path).to_string() },
        ["trace", "off"] => Command::DisableTraceFile,
        ["trace", "stop"] => Command::RequestTraceStop { notify_ui: true },
        ["memcache", "on", dump, log] => {
            Command::EnableFullMemoryCache { dump_path: (*dump).to_string(), log_path: (*log).to_string() }
        }
        ["memcache", "off"] => Command::DisableFullMemoryCache,
        ["signal", "set", signal, catch, pass] => Command::SetSignalPolicy {
            signal: signal.parse()?,
            disposition: SignalDisposition { catch: catch.parse()?, pass: pass.parse()? },
        },
        ["signal", "get", signal] => Command::GetSignalPolicy { signal: signal.parse()? },
        ["signal", "remove", signal] => Command::RemoveSignalPolicy { signal: signal.parse()? },
        other => return Err(format!("unrecognized command: {}", other.join(" ")).into()),
    };
    Ok(Some(command))
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = commandline::CommandLineArguments::parse();

    let (sender, _handle) = engine::spawn(EngineConfig::default());
    sender.submit(Command::Attach { pid: args.pid })?;
    println!("attached to pid {}", args.pid);

    if let Some(path) = &args.trace_file {
        sender.submit(Command::EnableTraceFile { path: path.clone() })?;
    }

    let stdin = io::stdin();
    print!("ddbg> ");
    io::stdout().flush()?;
    for line in stdin.lock().lines() {
        let line = line?;
        match parse_line(&line) {
            Ok(None) if line.trim() == "quit" || line.trim() == "exit" => {
                sender.submit(Command::Detach)?;
                break;
            }
            Ok(None) => {}
            Ok(Some(command)) => match sender.submit(command) {
                Ok(response) => print_response(response),
                Err(err) => eprintln!("error: {err}"),
            },
            Err(err) => eprintln!("error: {err}"),
        }
        print!("ddbg> ");
        io::stdout().flush()?;
    }

    sender.submit(Command::Shutdown).ok();
    Ok(())
}
