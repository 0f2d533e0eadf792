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

// Shutdown uses the same SIGSTOP handshake as breakpoint re-enabling, but
// the cycle ends in a whole-group detach: breakpoints out, original bytes
// back, threads released with the leader last.

use crate::context::{EventHandler, HandlerOutcome, TraceContext};
use crate::events::{Event, EventKind};
use crate::stopping::{send_sigstop, PidSet};
use crate::trace;
use log::{debug, warn};

pub struct ExitingHandler {
    pub leader: u32,
    pub pids: PidSet,
}

// Begin tracer shutdown: every leader gets an exit coordinator.  A leader
// already mid-cycle keeps its stop handler and inherits the obligation to
// detach when that cycle completes.
pub fn request_shutdown(ctx: &mut TraceContext) {
    if ctx.shutting_down {
        return;
    }
    ctx.shutting_down = true;
    debug!("shutdown requested, detaching all tracees");

    for leader in ctx.registry.leaders() {
        match ctx.handlers.get_mut(&leader) {
            Some(EventHandler::Stopping(handler)) => {
                handler.exiting = true;
            }
            Some(_) => {}
            None => install(ctx, leader),
        }
    }
}

// Install an exit coordinator on one leader.
pub fn install(ctx: &mut TraceContext, leader: u32) {
    if ctx.handlers.contains_key(&leader) {
        return;
    }

    let mut handler = ExitingHandler {
        leader,
        pids: PidSet::new(),
    };
    for tid in ctx.registry.tasks_of(leader) {
        send_sigstop(ctx, &mut handler.pids, leader, tid);
    }
    ctx.handlers.insert(leader, EventHandler::Exiting(handler));

    trace::dispatch_event(
        ctx,
        Event {
            pid: leader,
            kind: EventKind::None,
        },
    );
}

impl ExitingHandler {
    pub fn on_event(&mut self, ctx: &mut TraceContext, event: Event) -> HandlerOutcome {
        self.absorb(ctx, &event);

        if self.all_quiet(ctx) {
            detach_group(ctx, self.leader);
            return HandlerOutcome::Done(None);
        }
        HandlerOutcome::Keep(None)
    }

    // The same sink-and-record filter as the stop handler, minus the
    // single-step machinery: expected SIGSTOPs are consumed, exits zero
    // their task, breakpoint hits are queued so their instruction
    // pointers can be rewound before the detach.
    fn absorb(&mut self, ctx: &mut TraceContext, event: &Event) {
        if event.kind == EventKind::None {
            return;
        }

        if event.kind == EventKind::Signal(libc::SIGSTOP) {
            if let Some(task) = self.pids.get_mut(event.pid) {
                if task.sigstopped && !task.delivered {
                    task.delivered = true;
                    task.got_event = true;
                    return;
                }
            }
        }

        match self.pids.get_mut(event.pid) {
            Some(task) => {
                task.got_event = true;
                match event.kind {
                    EventKind::Exit(_) | EventKind::ExitSignal(_) => {
                        task.pid = 0;
                        if ctx.registry.remove(event.pid).is_some() {
                            debug!("{} exited during shutdown", event.pid);
                        }
                        return;
                    }
                    EventKind::Sysret(_) | EventKind::SyscallEntry(_) => {}
                    _ => ctx.queue.enqueue(*event),
                }
                // The thread stopped for something else while our SIGSTOP
                // is still queued; let it run so the stop can land.
                if task.sigstopped && !task.delivered {
                    let pid = task.pid;
                    let _ = ctx.backend.cont_syscall(pid, 0);
                }
            }
            None => warn!("shutdown event from {} outside the pid set", event.pid),
        }
    }

    // Done once every task has either stopped under us or gone away.
    fn all_quiet(&self, _ctx: &TraceContext) -> bool {
        !self
            .pids
            .iter()
            .any(|task| task.pid != 0 && task.sigstopped && !task.delivered)
    }
}

// Tear one group out of the trace: rewind queued breakpoint hits, restore
// every original byte, detach every thread with the leader last, and drop
// all bookkeeping for the group.
pub fn detach_group(ctx: &mut TraceContext, leader: u32) {
    let tasks = ctx.registry.tasks_of(leader);
    debug!("detaching group {} ({} threads)", leader, tasks.len());

    // Threads stopped on a breakpoint they never got to report have
    // already executed the trap; their instruction pointer must move back
    // onto the breakpoint address, where the original instruction is
    // about to be restored.
    for tid in &tasks {
        let rewind = ctx.queue.scan(|event| {
            event.pid == *tid && matches!(event.kind, EventKind::Breakpoint(_))
        });
        if let Some(event) = rewind {
            if let EventKind::Breakpoint(addr) = event.kind {
                let _ = ctx.backend.set_ip(*tid, addr);
            }
        }
    }

    // Restore original bytes through any thread that is still around.
    if let Some(mut set) = ctx.breakpoints.remove(&leader) {
        let mut retracted = Vec::new();
        for tid in &tasks {
            match set.retract_all(ctx.backend.as_mut(), *tid) {
                Ok(addresses) => {
                    retracted = addresses;
                    break;
                }
                Err(err) if err.vanished() => continue,
                Err(err) => {
                    warn!("retracting breakpoints for {} failed: {}", leader, err);
                    break;
                }
            }
        }
        for address in retracted {
            if let Some(on_retract) = set.get(address).and_then(|bp| bp.callbacks.on_retract) {
                on_retract(ctx, leader, address);
            }
        }
    }

    for tid in &tasks {
        if *tid != leader {
            if let Err(err) = ctx.backend.detach(*tid) {
                if !err.vanished() {
                    warn!("detach of {} failed: {}", tid, err);
                }
            }
            ctx.registry.remove(*tid);
        }
    }
    if let Err(err) = ctx.backend.detach(leader) {
        if !err.vanished() {
            warn!("detach of {} failed: {}", leader, err);
        }
    }
    ctx.registry.remove(leader);

    ctx.symbols.remove(&leader);
    ctx.queue.purge(&tasks);
}
