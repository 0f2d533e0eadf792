/*
    callscope  -  a library call tracing tool
    Copyright (C) 2023  Matt Kimball

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

// The x86_64 instruction 'int3' is encoded as 0xCC.
pub const BREAKPOINT_INSN: u8 = 0xCC;

// How far the instruction pointer has advanced past the breakpoint address
// when an int3 trap is reported.
pub const DECR_PC_AFTER_BREAK: u64 = 1;

// On x86_64 a PLT entry is 16 bytes, and slot zero is the shared resolver
// trampoline, so the entry for relocation index n sits at base + 16*(n+1).
pub const PLT_ENTRY_SIZE: u64 = 16;
pub const PLT_FIRST_ENTRY: u64 = 1;

// Upper bound on the scratch breakpoints a software single-step may plant:
// the fall-through address plus one branch target.
pub const SW_SINGLESTEP_MAX: usize = 2;

// Address of the PLT entry for the n-th PLT relocation.
pub fn plt_entry_address(plt_base: u64, index: u64) -> u64 {
    plt_base + PLT_ENTRY_SIZE * (index + PLT_FIRST_ENTRY)
}
