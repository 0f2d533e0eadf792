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

use crate::arch;
use crate::backend::TraceBackend;
use log::debug;
use object::{Object, ObjectSection, ObjectSymbol, ObjectSymbolTable, RelocationTarget};
use std::error::Error;

// ELF relocation type for a PLT jump slot on x86_64.
const R_X86_64_JUMP_SLOT: u32 = 7;

// The lazy-binding lifecycle of a PLT symbol.  A symbol moves from
// Unresolved to Resolved at most once per process lifetime, when the
// dynamic resolver is observed writing the real target into the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PltState {
    Unresolved,
    Resolved(u64),
}

// One dynamically-bound function reachable through the PLT.
#[derive(Debug, Clone)]
pub struct PltSymbol {
    // The name of the function.
    pub name: String,

    // The PLT entry the caller jumps through; the breakpoint site.
    pub plt_addr: u64,

    // The GOT slot the lazy resolver rewrites.
    pub slot_addr: u64,

    // The slot value routing through the resolver, kept so the slot can
    // be restored after resolution and other threads keep tripping the
    // breakpoint.  Zero when the slot was still empty at attach.
    pub trampoline: u64,

    pub state: PltState,
}

// The PLT surface of one executable, as mapped into one thread group.
#[derive(Clone)]
pub struct SymbolTable {
    pub symbols: Vec<PltSymbol>,

    // Address range of the .plt section, relocated.
    plt_start: u64,
    plt_end: u64,
}

impl SymbolTable {
    // Walk the dynamic relocations of an executable and derive one
    // PltSymbol per jump slot.  The n-th jump-slot relocation binds the
    // n-th PLT entry.  `load_base` is where the file is mapped; it only
    // biases addresses for position-independent executables.
    pub fn from_executable(path: &str, load_base: u64) -> Result<SymbolTable, Box<dyn Error>> {
        let data = std::fs::read(path)?;
        let elf = object::File::parse(&*data)?;
        let load_bias = match elf.kind() {
            object::ObjectKind::Dynamic => load_base,
            _ => 0,
        };

        let plt = elf.section_by_name(".plt").ok_or("no .plt section")?;
        let plt_start = plt.address() + load_bias;
        let plt_end = plt_start + plt.size();

        let mut symbols = Vec::new();
        let mut slot_index: u64 = 0;
        for (offset, relocation) in elf.dynamic_relocations().ok_or("no dynamic relocations")? {
            if relocation.kind() != object::RelocationKind::Elf(R_X86_64_JUMP_SLOT) {
                continue;
            }
            let index = slot_index;
            slot_index += 1;

            let symbol_index = match relocation.target() {
                RelocationTarget::Symbol(symbol_index) => symbol_index,
                _ => continue,
            };
            let name = match elf
                .dynamic_symbol_table()
                .and_then(|table| table.symbol_by_index(symbol_index).ok())
                .and_then(|symbol| symbol.name().ok().map(|name| name.to_string()))
            {
                Some(name) if !name.is_empty() => name,
                _ => continue,
            };

            symbols.push(PltSymbol {
                name,
                plt_addr: arch::plt_entry_address(plt_start, index),
                slot_addr: offset + load_bias,
                trampoline: 0,
                state: PltState::Unresolved,
            });
        }

        debug!("indexed {} PLT symbols from {}", symbols.len(), path);
        Ok(SymbolTable {
            symbols,
            plt_start,
            plt_end,
        })
    }

    // Build a table from already-known slot layout.  The test harness
    // uses this to describe its simulated address space.
    pub fn from_raw(symbols: Vec<PltSymbol>, plt_start: u64, plt_end: u64) -> SymbolTable {
        SymbolTable {
            symbols,
            plt_start,
            plt_end,
        }
    }

    // Read every slot and set the initial lazy-binding state.  A slot
    // holding zero or an address inside the PLT still routes through the
    // resolver; anything else was resolved before we attached (a running
    // process, or a prelinked binary).
    pub fn classify(&mut self, backend: &mut dyn TraceBackend, pid: u32) {
        for symbol in &mut self.symbols {
            let value = match backend.peek_word(pid, symbol.slot_addr) {
                Ok(value) => value,
                Err(_) => continue,
            };
            if value == 0 {
                symbol.trampoline = 0;
                symbol.state = PltState::Unresolved;
            } else if value >= self.plt_start && value < self.plt_end {
                symbol.trampoline = value;
                symbol.state = PltState::Unresolved;
            } else {
                symbol.state = PltState::Resolved(value);
            }
        }
    }

    // The symbol owning a particular PLT entry address.
    pub fn symbol_at(&self, plt_addr: u64) -> Option<usize> {
        self.symbols
            .iter()
            .position(|symbol| symbol.plt_addr == plt_addr)
    }
}
