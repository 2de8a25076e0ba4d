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

//! The disassembler plug-in contract (§1: "consumed via a single function
//! that turns 4 bytes + address into a textual instruction"). The actual
//! disassembler lives outside this crate; callers supply one through
//! [`EngineConfig`](crate::engine::EngineConfig).

use crate::arch::Architecture;

/// Turns a fixed-width instruction window into a textual mnemonic. The
/// default implementation declines to decode anything, which keeps trace
/// entries valid (an empty `instruction_text`) without requiring every
/// caller to bring a real disassembler.
pub trait InstructionDecoder: Send + Sync {
    fn decode(&self, architecture: Architecture, address: u64, bytes: [u8; 4]) -> Option<String>;
}

pub struct NoopDecoder;

impl InstructionDecoder for NoopDecoder {
    fn decode(&self, _architecture: Architecture, _address: u64, _bytes: [u8; 4]) -> Option<String> {
        None
    }
}
