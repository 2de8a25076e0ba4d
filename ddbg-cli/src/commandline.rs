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

use clap::Parser;

/// Attach ddbg to a running process and drive it from an interactive
/// command loop.
#[derive(Parser, Debug)]
#[command(name = "ddbg", version, about = "A native process debugger")]
pub struct CommandLineArguments {
    /// Process id to attach to.
    #[arg(short, long)]
    pub pid: u32,

    /// Record an execution trace to this file as breakpoints fire.
    #[arg(short = 'o', long)]
    pub trace_file: Option<String>,
}
