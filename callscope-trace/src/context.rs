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

use crate::backend::TraceBackend;
use crate::breakpoint::{BreakpointCallbacks, BreakpointSet};
use crate::events::{Event, EventQueue};
use crate::exiting::ExitingHandler;
use crate::plt;
use crate::process::ProcessRegistry;
use crate::process_map::ProcessMap;
use crate::ptrace::TraceError;
use crate::stopping;
use crate::stopping::{DefaultPolicy, StoppingHandler};
use crate::symbols::SymbolTable;
use crate::vfork::VforkHandler;
use log::{debug, warn};
use std::collections::HashMap;
use std::error::Error;
use std::io::Write;

// The event handler installed on a process.  Stop and exit coordinators
// live on thread-group leaders; vfork handlers live on the vforked child.
// Which kind a process carries decides how its events are interpreted, so
// the kinds are an explicit tagged choice rather than anything cleverer.
pub enum EventHandler {
    Stopping(StoppingHandler),
    Exiting(ExitingHandler),
    Vfork(VforkHandler),
}

// What the dispatcher should do once a handler has seen an event: keep
// the handler or drop it, and optionally hand the event on to the default
// handling.
pub enum HandlerOutcome {
    Keep(Option<Event>),
    Done(Option<Event>),
}

impl EventHandler {
    pub fn on_event(&mut self, ctx: &mut TraceContext, event: Event) -> HandlerOutcome {
        match self {
            EventHandler::Stopping(handler) => handler.on_event(ctx, event),
            EventHandler::Exiting(handler) => handler.on_event(ctx, event),
            EventHandler::Vfork(handler) => handler.on_event(ctx, event),
        }
    }
}

// Context relevant to an entire trace run: every process being traced,
// their breakpoints and symbols, the pending-event queue, and the trace
// backend everything talks through.
pub struct TraceContext {
    pub backend: Box<dyn TraceBackend>,

    // All threads under trace.
    pub registry: ProcessRegistry,

    // Events parked for replay while a coordinator holds their group.
    pub queue: EventQueue,

    // Active event handlers, keyed by the pid they are installed on.
    pub handlers: HashMap<u32, EventHandler>,

    // Breakpoints and PLT symbols, keyed by thread-group leader.
    pub breakpoints: HashMap<u32, BreakpointSet>,
    pub symbols: HashMap<u32, SymbolTable>,

    // Where the per-call trace lines go.
    pub output: Box<dyn Write>,

    // Pids named with -p on the commandline; consumed read-only.  These
    // are detached, never killed, at shutdown.
    pub attached_pids: Vec<u32>,

    pub shutting_down: bool,
}

impl TraceContext {
    pub fn new(backend: Box<dyn TraceBackend>, output: Box<dyn Write>) -> TraceContext {
        TraceContext {
            backend,
            registry: ProcessRegistry::new(),
            queue: EventQueue::new(),
            handlers: HashMap::new(),
            breakpoints: HashMap::new(),
            symbols: HashMap::new(),
            output,
            attached_pids: Vec::new(),
            shutting_down: false,
        }
    }

    // The pid whose handler should see an event from `pid`: the thread
    // itself if it carries one (vfork children do), else its leader.
    pub fn handler_target(&self, pid: u32) -> u32 {
        if self.handlers.contains_key(&pid) {
            return pid;
        }
        self.registry.leader_of(pid).unwrap_or(pid)
    }

    // Take the first queued event whose handler is gone, so it can be
    // replayed through the ordinary dispatch.
    pub fn next_replay(&mut self) -> Option<Event> {
        let registry = &self.registry;
        let handlers = &self.handlers;
        self.queue.dequeue_if(|event| {
            let target = if handlers.contains_key(&event.pid) {
                event.pid
            } else {
                registry.leader_of(event.pid).unwrap_or(event.pid)
            };
            !handlers.contains_key(&target)
        })
    }

    // Standard resume: run to the next syscall boundary so syscall stops
    // keep flowing.  A vanished tracee is not an error here.
    pub fn continue_process(&mut self, pid: u32) {
        if let Err(err) = self.backend.cont_syscall(pid, 0) {
            if err.vanished() {
                debug!("{} vanished on resume", pid);
            } else {
                warn!("resuming {} failed: {}", pid, err);
            }
        }
    }

    // Breakpoint-table operations, routed through the leader's table.

    pub fn bp_insert(
        &mut self,
        leader: u32,
        pid: u32,
        address: u64,
        symbol: Option<usize>,
        one_shot: bool,
        callbacks: BreakpointCallbacks,
    ) -> Result<(), TraceError> {
        self.breakpoints
            .entry(leader)
            .or_insert_with(BreakpointSet::new)
            .insert(self.backend.as_mut(), pid, address, symbol, one_shot, callbacks)
    }

    pub fn bp_enable(&mut self, leader: u32, pid: u32, address: u64) -> Result<(), TraceError> {
        match self.breakpoints.get_mut(&leader) {
            Some(set) => set.enable(self.backend.as_mut(), pid, address),
            None => Ok(()),
        }
    }

    pub fn bp_disable(&mut self, leader: u32, pid: u32, address: u64) -> Result<(), TraceError> {
        match self.breakpoints.get_mut(&leader) {
            Some(set) => set.disable(self.backend.as_mut(), pid, address),
            None => Ok(()),
        }
    }

    pub fn bp_delete(&mut self, leader: u32, pid: u32, address: u64) -> Result<(), TraceError> {
        match self.breakpoints.get_mut(&leader) {
            Some(set) => set.delete(self.backend.as_mut(), pid, address),
            None => Ok(()),
        }
    }

    // One line of trace output per library call.
    pub fn report_call(&mut self, pid: u32, name: &str) -> Result<(), Box<dyn Error>> {
        writeln!(self.output, "[{}] {}()", pid, name)?;
        self.output.flush()?;
        Ok(())
    }

    // Resume after a breakpoint hit.  A disabled breakpoint needs no
    // ceremony.  An enabled one either has its own continuation (PLT
    // symbols do) or goes through a full stop-the-world cycle to be
    // stepped over and re-armed.  Architectures that cannot single-step
    // over a planted site get a plain resume.
    pub fn continue_after_breakpoint(&mut self, pid: u32, address: u64) {
        if !self.backend.can_singlestep_safely() {
            self.continue_process(pid);
            return;
        }

        let leader = self.registry.leader_of(pid).unwrap_or(pid);
        let info = self
            .breakpoints
            .get(&leader)
            .and_then(|set| set.get(address))
            .map(|bp| (bp.enabled, bp.callbacks.on_continue));

        match info {
            Some((true, Some(on_continue))) => {
                if let Err(err) = on_continue(self, pid, address) {
                    warn!("continue callback at {:#x} failed: {}", address, err);
                    self.continue_process(pid);
                }
            }
            Some((true, None)) => {
                if !stopping::install(self, pid, address, Box::new(DefaultPolicy)) {
                    // A coordinator already owns the group; the thread
                    // stays stopped until that cycle finishes.
                }
            }
            _ => self.continue_process(pid),
        }
    }

    // Forward a signal that is not ours to eat.
    pub fn continue_after_signal(&mut self, pid: u32, signal: i32) {
        if let Err(err) = self.backend.cont_syscall(pid, signal) {
            if !err.vanished() {
                warn!("delivering signal {} to {} failed: {}", signal, pid, err);
            }
        }
    }

    // Resume after a syscall stop, unless a coordinator holds the group
    // mid-cycle, in which case the resume belongs to it.
    pub fn continue_after_syscall(&mut self, pid: u32, _number: u64, _is_return: bool) {
        let target = self.handler_target(pid);
        match self.handlers.get(&target) {
            Some(EventHandler::Stopping(_)) | Some(EventHandler::Exiting(_)) => {}
            _ => self.continue_process(pid),
        }
    }

    // Resume after an exec: the old image's breakpoints and symbols are
    // meaningless in the new address space, and any sibling threads are
    // gone.
    pub fn continue_after_exec(&mut self, pid: u32) {
        let old_leader = self.registry.leader_of(pid).unwrap_or(pid);
        for tid in self.registry.tasks_of(old_leader) {
            if tid != pid {
                self.registry.remove(tid);
            }
        }
        self.queue.purge(&[old_leader]);
        self.breakpoints.remove(&old_leader);
        self.symbols.remove(&old_leader);

        if let Some(proc) = self.registry.get_mut(pid) {
            proc.leader = pid;
            proc.in_syscall = false;
            proc.being_created = false;
        }

        self.init_symbols(pid);
        self.continue_process(pid);
    }

    // Index the PLT of a leader's executable and plant a breakpoint on
    // every stub.  Failure leaves the process traced but silent, which is
    // better than refusing to run it.
    pub fn init_symbols(&mut self, leader: u32) {
        let exe = match std::fs::read_link(format!("/proc/{}/exe", leader)) {
            Ok(path) => path.to_string_lossy().into_owned(),
            Err(err) => {
                warn!("cannot resolve executable of {}: {}", leader, err);
                return;
            }
        };

        let bias = ProcessMap::new(leader)
            .ok()
            .and_then(|map| map.base_for_file(&exe))
            .unwrap_or(0);

        let mut table = match SymbolTable::from_executable(&exe, bias) {
            Ok(table) => table,
            Err(err) => {
                warn!("no PLT symbols for {}: {}", exe, err);
                return;
            }
        };
        table.classify(self.backend.as_mut(), leader);
        self.symbols.insert(leader, table);

        plt::insert_plt_breakpoints(self, leader, leader);
    }
}
