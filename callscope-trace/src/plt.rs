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

// Lazy binding means a PLT slot changes under us exactly once: the first
// call runs the dynamic resolver, which overwrites the slot with the real
// target.  The first hit therefore rides the stop coordinator with a
// policy that single-steps until the slot changes, restores the slot so
// other threads keep tripping our breakpoint, and caches the real target.
// Every later hit just jumps straight there.

use crate::breakpoint::BreakpointCallbacks;
use crate::context::TraceContext;
use crate::stopping;
use crate::stopping::{Decision, StopPolicy, StoppingHandler};
use crate::symbols::PltState;
use log::{debug, warn};
use std::error::Error;

// Plant a breakpoint on every PLT symbol of a leader.
pub fn insert_plt_breakpoints(ctx: &mut TraceContext, leader: u32, pid: u32) {
    let sites: Vec<(usize, u64)> = match ctx.symbols.get(&leader) {
        Some(table) => table
            .symbols
            .iter()
            .enumerate()
            .map(|(index, symbol)| (index, symbol.plt_addr))
            .collect(),
        None => return,
    };

    let callbacks = BreakpointCallbacks {
        on_hit: Some(plt_on_hit),
        on_continue: Some(plt_on_continue),
        on_retract: None,
    };
    for (index, address) in sites {
        if let Err(err) = ctx.bp_insert(leader, pid, address, Some(index), false, callbacks) {
            warn!("inserting PLT breakpoint at {:#x} failed: {}", address, err);
            continue;
        }
        if let Err(err) = ctx.bp_enable(leader, pid, address) {
            warn!("enabling PLT breakpoint at {:#x} failed: {}", address, err);
        }
    }
}

// Report the call.  This is the tracer's actual product: one line per
// library call entering the PLT.
fn plt_on_hit(ctx: &mut TraceContext, pid: u32, address: u64) -> Result<(), Box<dyn Error>> {
    let leader = ctx.registry.leader_of(pid).unwrap_or(pid);
    let name = ctx
        .breakpoints
        .get(&leader)
        .and_then(|set| set.get(address))
        .and_then(|bp| bp.symbol)
        .and_then(|index| {
            ctx.symbols
                .get(&leader)
                .and_then(|table| table.symbols.get(index))
        })
        .map(|symbol| symbol.name.clone());

    if let Some(name) = name {
        ctx.report_call(pid, &name)?;
    }
    Ok(())
}

// Resume after a PLT hit.  A resolved symbol is bypassed by jumping the
// thread straight at the cached target; an unresolved one starts a
// stop-the-world cycle that chases the resolver.
fn plt_on_continue(ctx: &mut TraceContext, pid: u32, address: u64) -> Result<(), Box<dyn Error>> {
    let leader = ctx.registry.leader_of(pid).unwrap_or(pid);
    let symbol_index = ctx
        .breakpoints
        .get(&leader)
        .and_then(|set| set.get(address))
        .and_then(|bp| bp.symbol);
    let index = match symbol_index {
        Some(index) => index,
        None => {
            ctx.continue_process(pid);
            return Ok(());
        }
    };

    let state = ctx
        .symbols
        .get(&leader)
        .and_then(|table| table.symbols.get(index))
        .map(|symbol| symbol.state);

    match state {
        Some(PltState::Resolved(target)) => {
            ctx.backend.set_ip(pid, target)?;
            ctx.continue_process(pid);
        }
        Some(PltState::Unresolved) => {
            if !stopping::install(ctx, pid, address, Box::new(PltResolvePolicy { index })) {
                // Mid-shutdown; leave the thread where it is.
            }
        }
        None => ctx.continue_process(pid),
    }
    Ok(())
}

// The keep_stepping policy for resolver chasing.
struct PltResolvePolicy {
    index: usize,
}

impl StopPolicy for PltResolvePolicy {
    fn keep_stepping(&mut self, ctx: &mut TraceContext, handler: &mut StoppingHandler) -> Decision {
        let (slot_addr, old_value) = {
            let symbol = match ctx
                .symbols
                .get(&handler.leader)
                .and_then(|table| table.symbols.get(self.index))
            {
                Some(symbol) => symbol,
                None => return Decision::Fail,
            };
            if let PltState::Resolved(_) = symbol.state {
                // Resolution already observed; a stray extra poll must
                // not restart the chase.
                return Decision::Stop;
            }
            (symbol.slot_addr, symbol.trampoline)
        };

        let value = match ctx.backend.peek_word(handler.teb, slot_addr) {
            Ok(value) => value,
            Err(err) => {
                warn!("reading PLT slot {:#x} failed: {}", slot_addr, err);
                return Decision::Fail;
            }
        };

        if value == old_value {
            return Decision::Cont;
        }

        // The resolver finished.  Point the slot back at the resolver
        // trampoline so every other thread still enters through our
        // breakpoint, and remember where calls really go.
        if old_value != 0 {
            if let Err(err) = ctx.backend.poke_word(handler.teb, slot_addr, old_value) {
                warn!("restoring PLT slot {:#x} failed: {}", slot_addr, err);
            }
        }
        if let Some(symbol) = ctx
            .symbols
            .get_mut(&handler.leader)
            .and_then(|table| table.symbols.get_mut(self.index))
        {
            debug!("{} resolved to {:#x}", symbol.name, value);
            symbol.state = PltState::Resolved(value);
        }
        Decision::Stop
    }
}
