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
use crate::backend::LinuxBackend;
use crate::context::{HandlerOutcome, TraceContext};
use crate::events::{Event, EventKind};
use crate::exiting;
use crate::ptrace;
use crate::ptrace::{ChildEventKind, RawStatus};
use crate::vfork;
use log::{debug, warn};
use std::error::Error;
use std::io::Write;

// Turn one raw waitpid status into a canonical event, or handle it on the
// spot when no event needs dispatching.
fn canonicalize(ctx: &mut TraceContext, pid: u32, raw: RawStatus) -> Option<Event> {
    // A new thread can report its first stop before the clone event that
    // names it has been processed.  Give it a placeholder identity; the
    // clone replay will claim it into the right group.
    if !ctx.registry.contains(pid) {
        debug!("first sight of {}", pid);
        ctx.registry.add(pid, None, pid, true);
    }

    let kind = match raw {
        RawStatus::Exited(code) => EventKind::Exit(code),
        RawStatus::Signaled(signal) => EventKind::ExitSignal(signal),
        RawStatus::SyscallStop => {
            let entering = ctx.registry.get(pid).map(|p| !p.in_syscall).unwrap_or(true);
            if entering {
                let number = ctx.backend.syscall_number(pid).unwrap_or(0);
                if let Some(proc) = ctx.registry.get_mut(pid) {
                    proc.in_syscall = true;
                    proc.last_syscall = number;
                }
                EventKind::SyscallEntry(number)
            } else {
                let number = ctx.registry.get(pid).map(|p| p.last_syscall).unwrap_or(0);
                if let Some(proc) = ctx.registry.get_mut(pid) {
                    proc.in_syscall = false;
                }
                EventKind::Sysret(number)
            }
        }
        RawStatus::ChildEvent(kind, child) => match kind {
            ChildEventKind::Fork => EventKind::Fork(child),
            ChildEventKind::Vfork => EventKind::Vfork(child),
            ChildEventKind::Clone => EventKind::Clone(child),
            ChildEventKind::Exec => EventKind::Exec,
            ChildEventKind::VforkDone => EventKind::VforkDone,
        },
        RawStatus::Stopped(signal) => {
            let being_created = ctx
                .registry
                .get(pid)
                .map(|p| p.being_created)
                .unwrap_or(false);
            if signal == libc::SIGTRAP && !being_created {
                // A trap is either one of our breakpoints (the pc has
                // moved past the trap byte) or a single-step completion.
                match ctx.backend.get_ip(pid) {
                    Ok(ip) => {
                        let leader = ctx.registry.leader_of(pid).unwrap_or(pid);
                        let site = ip.wrapping_sub(arch::DECR_PC_AFTER_BREAK);
                        let planted = ctx
                            .breakpoints
                            .get(&leader)
                            .and_then(|set| set.get(site))
                            .map(|bp| bp.enabled)
                            .unwrap_or(false);
                        EventKind::Breakpoint(if planted { site } else { ip })
                    }
                    Err(_) => EventKind::Signal(signal),
                }
            } else {
                EventKind::Signal(signal)
            }
        }
    };

    Some(Event { pid, kind })
}

// Hand one event to the handler responsible for it, falling back to the
// default policy when no handler is installed (or when the handler passes
// the event along).
pub fn dispatch_event(ctx: &mut TraceContext, event: Event) {
    let target = ctx.handler_target(event.pid);
    if let Some(mut handler) = ctx.handlers.remove(&target) {
        match handler.on_event(ctx, event) {
            HandlerOutcome::Keep(passed) => {
                ctx.handlers.insert(target, handler);
                if let Some(event) = passed {
                    default_handle(ctx, event);
                }
            }
            HandlerOutcome::Done(passed) => {
                debug!("handler on {} destroyed", target);
                if let Some(event) = passed {
                    default_handle(ctx, event);
                }
            }
        }
    } else {
        default_handle(ctx, event);
    }
}

// The default event policy, applied when no coordinator owns the process.
fn default_handle(ctx: &mut TraceContext, event: Event) {
    let pid = event.pid;
    match event.kind {
        EventKind::Breakpoint(address) => {
            let leader = ctx.registry.leader_of(pid).unwrap_or(pid);
            let info = ctx
                .breakpoints
                .get(&leader)
                .and_then(|set| set.get(address))
                .map(|bp| (bp.enabled, bp.one_shot, bp.callbacks.on_hit));
            match info {
                Some((enabled, one_shot, on_hit)) => {
                    if enabled {
                        // The processor has executed the trap byte; move
                        // back onto the breakpoint address.
                        let _ = ctx.backend.set_ip(pid, address);
                    }
                    if let Some(on_hit) = on_hit {
                        if let Err(err) = on_hit(ctx, pid, address) {
                            warn!("breakpoint callback at {:#x} failed: {}", address, err);
                        }
                    }
                    if one_shot {
                        let _ = ctx.bp_delete(leader, pid, address);
                        ctx.continue_process(pid);
                    } else {
                        ctx.continue_after_breakpoint(pid, address);
                    }
                }
                None => {
                    // Not our trap; nothing to step over.
                    ctx.continue_process(pid);
                }
            }
        }
        EventKind::Signal(signal) => {
            let being_created = ctx
                .registry
                .get(pid)
                .map(|p| p.being_created)
                .unwrap_or(false);
            if being_created && (signal == libc::SIGSTOP || signal == libc::SIGTRAP) {
                initialize_process(ctx, pid);
            } else {
                ctx.continue_after_signal(pid, signal);
            }
        }
        EventKind::SyscallEntry(number) => ctx.continue_after_syscall(pid, number, false),
        EventKind::Sysret(number) => ctx.continue_after_syscall(pid, number, true),
        EventKind::Exit(code) => {
            debug!("{} exited with status {}", pid, code);
            retire_thread(ctx, pid);
        }
        EventKind::ExitSignal(signal) => {
            debug!("{} killed by signal {}", pid, signal);
            retire_thread(ctx, pid);
        }
        EventKind::Clone(child) => {
            let leader = ctx.registry.leader_of(pid).unwrap_or(pid);
            if !ctx.registry.contains(child) {
                ctx.registry.add(child, Some(pid), leader, true);
            } else {
                ctx.registry.change_leader(child, leader);
            }
            ctx.continue_process(pid);
        }
        EventKind::Fork(child) => {
            if !ctx.registry.contains(child) {
                ctx.registry.add(child, Some(pid), child, true);
            }
            // The child's address space is a copy of the parent's,
            // planted traps included, so it needs a matching table.
            let leader = ctx.registry.leader_of(pid).unwrap_or(pid);
            if let Some(set) = ctx.breakpoints.get(&leader) {
                ctx.breakpoints.insert(child, set.clone());
            }
            if let Some(table) = ctx.symbols.get(&leader) {
                ctx.symbols.insert(child, table.clone());
            }
            ctx.continue_process(pid);
        }
        EventKind::Vfork(child) => vfork::continue_after_vfork(ctx, pid, child),
        EventKind::VforkDone => ctx.continue_process(pid),
        EventKind::Exec => ctx.continue_after_exec(pid),
        EventKind::None => {}
    }
}

// First stop of a new thread: from here on it is a full group member.
// Leaders get their PLT indexed and breakpoints planted before they run.
fn initialize_process(ctx: &mut TraceContext, pid: u32) {
    if let Some(proc) = ctx.registry.get_mut(pid) {
        proc.being_created = false;
    }
    if let Err(err) = ctx.backend.set_trace_options(pid) {
        warn!("setting trace options on {} failed: {}", pid, err);
    }

    let leader = ctx.registry.leader_of(pid).unwrap_or(pid);
    if pid == leader && !ctx.symbols.contains_key(&leader) {
        ctx.init_symbols(leader);
    }
    ctx.continue_process(pid);
}

// A thread is gone; once the last thread of a group is gone, so is the
// group's bookkeeping.
fn retire_thread(ctx: &mut TraceContext, pid: u32) {
    let leader = ctx.registry.leader_of(pid).unwrap_or(pid);
    ctx.registry.remove(pid);
    ctx.queue.purge(&[pid]);
    if ctx.registry.tasks_of(leader).is_empty() {
        ctx.breakpoints.remove(&leader);
        ctx.symbols.remove(&leader);
        ctx.handlers.remove(&leader);
    }
}

// The main loop: replay parked events when their coordinator is gone,
// otherwise wait on the kernel; stop once nothing is traced anymore.
pub fn run(ctx: &mut TraceContext) -> Result<(), Box<dyn Error>> {
    while !ctx.registry.is_empty() {
        if ctx.backend.shutdown_requested() && !ctx.shutting_down {
            exiting::request_shutdown(ctx);
            continue;
        }

        if let Some(event) = ctx.next_replay() {
            dispatch_event(ctx, event);
            continue;
        }

        match ctx.backend.wait() {
            Ok(Some((pid, raw))) => {
                if let Some(event) = canonicalize(ctx, pid, raw) {
                    dispatch_event(ctx, event);
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!("wait failed: {}", err);
                break;
            }
        }
    }
    Ok(())
}

// Attach to one or more running processes and trace them until the tracer
// is asked to stop, then detach them unharmed.
pub fn trace_pids(pids: &[u32], output: Box<dyn Write>) -> Result<(), Box<dyn Error>> {
    ptrace::block_term_signals()?;

    let mut ctx = TraceContext::new(Box::new(LinuxBackend), output);
    ctx.attached_pids = pids.to_vec();
    for &pid in pids {
        let tids = ctx.backend.list_threads(pid)?;
        for tid in tids {
            ctx.backend.attach(tid)?;
            ctx.registry.add(tid, None, pid, true);
        }
    }

    run(&mut ctx)
}

// Spawn a command under trace and follow it to completion.
pub fn trace_command(command: &[String], output: Box<dyn Write>) -> Result<(), Box<dyn Error>> {
    ptrace::block_term_signals()?;

    let pid = ptrace::spawn_traced(command)?;
    let mut ctx = TraceContext::new(Box::new(LinuxBackend), output);
    ctx.registry.add(pid, None, pid, true);

    run(&mut ctx)
}
