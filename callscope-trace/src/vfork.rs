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

// Between vfork and the child's exec (or exit), parent and child share one
// address space and the kernel holds the parent.  The child is folded into
// the parent's thread group for that window, so breakpoint accounting sees
// one address space with one extra thread; the stop coordinator recognizes
// the held parent through is_vfork_parent and leaves it unsignalled.

use crate::context::{EventHandler, HandlerOutcome, TraceContext};
use crate::events::{Event, EventKind};
use log::{debug, warn};

pub struct VforkHandler {
    // The thread that vforked; kernel-held until the child lets go.
    pub parent: u32,

    pub child: u32,

    // A breakpoint the child tripped in the shared address space.  It is
    // lifted so the child can run, and planted again for the parent once
    // the spaces split.
    pub bp_addr: Option<u64>,
}

// Entry point on a VFORK notification.
pub fn continue_after_vfork(ctx: &mut TraceContext, parent: u32, child: u32) {
    let leader = ctx.registry.leader_of(parent).unwrap_or(parent);
    debug!("vfork: child {} joins group {} until exec", child, leader);

    if !ctx.registry.contains(child) {
        ctx.registry.add(child, Some(parent), child, true);
    }
    ctx.registry.change_leader(child, leader);

    ctx.handlers.insert(
        child,
        EventHandler::Vfork(VforkHandler {
            parent,
            child,
            bp_addr: None,
        }),
    );

    // The parent sits blocked in the kernel until the child execs or
    // exits, but it still has to be restarted as usual.
    ctx.continue_process(parent);
}

impl VforkHandler {
    pub fn on_event(&mut self, ctx: &mut TraceContext, event: Event) -> HandlerOutcome {
        match event.kind {
            EventKind::Breakpoint(addr) => {
                // The child hit a breakpoint in the shared space, usually
                // the one at the vfork return site.  Lift it so the child
                // can proceed; the parent gets it back afterwards.
                self.bp_addr = Some(addr);
                let leader = ctx.registry.leader_of(self.child).unwrap_or(self.child);
                if let Err(err) = ctx.bp_disable(leader, self.child, addr) {
                    warn!("lifting breakpoint at {:#x} for vfork child failed: {}", addr, err);
                }
                let _ = ctx.backend.set_ip(self.child, addr);
                ctx.continue_process(self.child);
                HandlerOutcome::Keep(None)
            }
            EventKind::Exec | EventKind::Exit(_) | EventKind::ExitSignal(_) => {
                // Address spaces are separate again.  Restore the lifted
                // breakpoint for the parent and give the child back its
                // own identity.
                let leader = ctx.registry.leader_of(self.parent).unwrap_or(self.parent);
                if let Some(addr) = self.bp_addr {
                    if let Err(err) = ctx.bp_enable(leader, self.parent, addr) {
                        warn!(
                            "restoring breakpoint at {:#x} after vfork failed: {}",
                            addr, err
                        );
                    }
                }
                ctx.registry.change_leader(self.child, self.child);
                debug!("vfork window for {} closed", self.child);

                // The event itself still needs its ordinary handling.
                HandlerOutcome::Done(Some(event))
            }
            _ => HandlerOutcome::Keep(Some(event)),
        }
    }
}
