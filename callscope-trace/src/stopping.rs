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

// Re-enabling a software breakpoint is a three-step window: restore the
// original byte, single-step the thread that hit it, write the trap back.
// Any sibling thread running through the site inside that window would
// escape unobserved.  The handler here closes the window by stopping every
// sibling first, single-stepping the one thread, and only then letting the
// group go again.  The same machinery, parameterized by a policy, also
// drives lazy-binding resolution and the shutdown path.

use crate::arch;
use crate::context::{EventHandler, HandlerOutcome, TraceContext};
use crate::events::{Event, EventKind};
use crate::exiting;
use crate::process::TaskVisit;
use crate::ptrace::ThreadState;
use crate::trace;
use log::{debug, warn};

// Per-thread bookkeeping within one stop-the-world cycle.
#[derive(Debug, Default, Clone, Copy)]
pub struct PidTask {
    // The thread id; zeroed when the thread exits mid-cycle.
    pub pid: u32,

    // We sent SIGSTOP and expect its delivery.
    pub sigstopped: bool,

    // That SIGSTOP has been observed and consumed.
    pub delivered: bool,

    // At least one event from this thread since the cycle began.
    pub got_event: bool,

    // Thread is a vfork parent, held by the kernel; do not SIGSTOP it.
    pub vforked: bool,

    // The last observed event was a syscall return.
    pub sysret: bool,
}

// The per-cycle task collection, keyed by pid.
pub struct PidSet {
    tasks: Vec<PidTask>,
}

impl PidSet {
    pub fn new() -> PidSet {
        PidSet { tasks: Vec::new() }
    }

    pub fn get(&self, pid: u32) -> Option<&PidTask> {
        if pid == 0 {
            return None;
        }
        self.tasks.iter().find(|task| task.pid == pid)
    }

    pub fn get_mut(&mut self, pid: u32) -> Option<&mut PidTask> {
        if pid == 0 {
            return None;
        }
        self.tasks.iter_mut().find(|task| task.pid == pid)
    }

    pub fn ensure(&mut self, pid: u32) -> &mut PidTask {
        if let Some(index) = self.tasks.iter().position(|task| task.pid == pid) {
            return &mut self.tasks[index];
        }
        self.tasks.push(PidTask {
            pid,
            ..Default::default()
        });
        self.tasks.last_mut().unwrap()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PidTask> {
        self.tasks.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PidTask> {
        self.tasks.iter_mut()
    }
}

// Verdict from a policy callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Cont,
    Stop,
    Fail,
}

// Whether the handler survives the event it just processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Keep,
    Done,
}

// The pluggable behavior of one stop-the-world cycle, fixed at
// installation.  The defaults re-enable a breakpoint and nothing more;
// the PLT extension substitutes its own keep_stepping to chase the
// dynamic resolver.
pub trait StopPolicy {
    // The group is quiescent; act on the one interesting thread.
    fn on_all_stopped(&mut self, ctx: &mut TraceContext, handler: &mut StoppingHandler) -> Flow {
        handler.disable_and_singlestep(ctx)
    }

    // After each completed single-step: keep going, stop here, or give up.
    fn keep_stepping(&mut self, ctx: &mut TraceContext, handler: &mut StoppingHandler) -> Decision {
        let _ = (ctx, handler);
        Decision::Stop
    }

    // Whether to run the detach-after-singlestep workaround even when not
    // exiting.
    fn ugly_workaround(&mut self, ctx: &mut TraceContext, handler: &mut StoppingHandler) -> Decision {
        let _ = (ctx, handler);
        Decision::Stop
    }
}

pub struct DefaultPolicy;

impl StopPolicy for DefaultPolicy {}

// The protocol state.  STOPPING collects the group; SINGLESTEP watches the
// one stepping thread; SINKING drains the SIGSTOPs that are still in
// flight; UGLY_WORKAROUND parks the stepped thread on a scratch breakpoint
// so a detach cannot race the kernel's trap delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopState {
    Stopping,
    Singlestep,
    Sinking,
    UglyWorkaround,
}

pub struct StoppingHandler {
    pub leader: u32,

    // The one thread allowed to move: the task enabling the breakpoint.
    pub teb: u32,

    // The breakpoint being re-enabled, and whether it was enabled when
    // the cycle began.
    pub bp_addr: u64,
    pub bp_was_enabled: bool,

    pub state: StopState,
    pub pids: PidSet,

    // Set when the tracer is shutting down; the cycle then ends in a
    // whole-group detach instead of a resume.
    pub exiting: bool,

    policy: Option<Box<dyn StopPolicy>>,

    // Scratch one-shot breakpoints planted for a software single-step.
    scratch: Vec<u64>,

    // The workaround breakpoint, and whether teb has tripped it.
    ugly_bp: Option<u64>,
    teb_done: bool,
}

// Install a stop-the-world cycle for a breakpoint hit by `pid` at
// `bp_addr`.  Returns false when the leader already has a handler (the
// cycle cannot be started; during shutdown the thread simply stays
// stopped).
pub fn install(
    ctx: &mut TraceContext,
    pid: u32,
    bp_addr: u64,
    policy: Box<dyn StopPolicy>,
) -> bool {
    let leader = ctx.registry.leader_of(pid).unwrap_or(pid);
    if ctx.handlers.contains_key(&leader) {
        debug!("stop handler on {} rejected, one already present", leader);
        return false;
    }

    let bp_was_enabled = ctx
        .breakpoints
        .get(&leader)
        .and_then(|set| set.get(bp_addr))
        .map(|breakpoint| breakpoint.enabled)
        .unwrap_or(false);

    let mut handler = StoppingHandler {
        leader,
        teb: pid,
        bp_addr,
        bp_was_enabled,
        state: StopState::Stopping,
        pids: PidSet::new(),
        exiting: false,
        policy: Some(policy),
        scratch: Vec::new(),
        ugly_bp: None,
        teb_done: false,
    };

    debug!("installing stop handler on {} for teb {}", leader, pid);
    for tid in ctx.registry.tasks_of(leader) {
        send_sigstop(ctx, &mut handler.pids, leader, tid);
    }

    ctx.handlers.insert(leader, EventHandler::Stopping(handler));

    // If the group was already quiescent the protocol must advance
    // without waiting for a real event.
    trace::dispatch_event(
        ctx,
        Event {
            pid,
            kind: EventKind::None,
        },
    );
    true
}

// Ask one thread of the group to stop.  Threads still being created will
// be stopped by the kernel on their own; vfork parents are already held
// by the kernel and must not be signalled.
pub fn send_sigstop(ctx: &mut TraceContext, pids: &mut PidSet, leader: u32, tid: u32) {
    let being_created = ctx
        .registry
        .get(tid)
        .map(|proc| proc.being_created)
        .unwrap_or(false);

    let task = pids.ensure(tid);
    if being_created {
        return;
    }

    match ctx.backend.thread_state(tid) {
        ThreadState::TracedStop | ThreadState::Stopped => {
            // Already stopped in a traced way; nothing to record.
        }
        ThreadState::Zombie | ThreadState::Gone => {
            task.pid = 0;
        }
        ThreadState::Sleeping if is_vfork_parent(ctx, leader, tid) => {
            task.vforked = true;
        }
        _ => match ctx.backend.send_sigstop(tid) {
            Ok(()) => task.sigstopped = true,
            Err(err) if err.vanished() => task.pid = 0,
            Err(err) => warn!("SIGSTOP to {} failed: {}", tid, err),
        },
    }
}

// A thread is a vfork parent if some thread of the group carries a vfork
// handler naming it as the parent.
pub fn is_vfork_parent(ctx: &TraceContext, leader: u32, tid: u32) -> bool {
    ctx.registry.tasks_of(leader).iter().any(|other| {
        matches!(ctx.handlers.get(other),
            Some(EventHandler::Vfork(vfork)) if vfork.parent == tid)
    })
}

impl StoppingHandler {
    pub fn on_event(&mut self, ctx: &mut TraceContext, event: Event) -> HandlerOutcome {
        let flow = match self.state {
            StopState::Stopping => self.on_event_stopping(ctx, event),
            StopState::Singlestep => self.on_event_singlestep(ctx, event),
            StopState::Sinking => self.on_event_sinking(ctx, event),
            StopState::UglyWorkaround => self.on_event_ugly(ctx, event),
        };
        match flow {
            Flow::Keep => HandlerOutcome::Keep(None),
            Flow::Done => HandlerOutcome::Done(None),
        }
    }

    // Universal pre-filter: sink the expected SIGSTOP exactly once per
    // thread, mark event arrival, and park everything else for replay
    // after the cycle.
    fn absorb(&mut self, ctx: &mut TraceContext, event: &Event) {
        if event.kind == EventKind::None {
            return;
        }

        if event.kind == EventKind::Signal(libc::SIGSTOP) {
            if let Some(task) = self.pids.get_mut(event.pid) {
                if task.sigstopped && !task.delivered {
                    task.delivered = true;
                    task.got_event = true;
                    task.sysret = false;
                    return;
                }
                if task.delivered {
                    warn!("duplicate SIGSTOP from {}", event.pid);
                }
            }
        }

        match self.pids.get_mut(event.pid) {
            Some(task) => {
                task.got_event = true;
                task.sysret = false;
                match event.kind {
                    EventKind::Exit(_) | EventKind::ExitSignal(_) => {
                        task.pid = 0;
                        ctx.queue.enqueue(*event);
                    }
                    EventKind::Sysret(_) => {
                        // The thread sits at a syscall boundary; nothing to
                        // replay, it just needs resuming at cycle end.
                        task.sysret = true;
                    }
                    _ => ctx.queue.enqueue(*event),
                }
            }
            None => {
                warn!("event from {} outside the pid set", event.pid);
                ctx.queue.enqueue(*event);
            }
        }
    }

    // True when every task of the group is held: stopped, a held vfork
    // parent, or gone.
    fn all_tasks_blocked(&self, ctx: &TraceContext) -> bool {
        ctx.registry
            .each_task(self.leader, |proc| {
                match self.pids.get(proc.pid) {
                    Some(task) => {
                        if task.vforked || !task.sigstopped || task.got_event {
                            TaskVisit::Cont
                        } else {
                            TaskVisit::Stop
                        }
                    }
                    // Zeroed entry (dead) or a thread mid-creation that the
                    // kernel will stop on its own.
                    None if proc.being_created => TaskVisit::Cont,
                    None => {
                        if self.pids.iter().any(|t| t.pid == 0) {
                            TaskVisit::Cont
                        } else {
                            TaskVisit::Stop
                        }
                    }
                }
            })
            .is_none()
    }

    fn on_event_stopping(&mut self, ctx: &mut TraceContext, event: Event) -> Flow {
        self.absorb(ctx, &event);
        if !self.all_tasks_blocked(ctx) {
            return Flow::Keep;
        }

        debug!("group {} quiescent, acting on teb {}", self.leader, self.teb);
        self.poll(ctx, |policy, ctx, handler| policy.on_all_stopped(ctx, handler))
    }

    fn on_event_singlestep(&mut self, ctx: &mut TraceContext, event: Event) -> Flow {
        if event.pid != self.teb {
            self.absorb(ctx, &event);
            return Flow::Keep;
        }

        if let Some(task) = self.pids.get_mut(self.teb) {
            task.got_event = true;
        }
        match event.kind {
            EventKind::Breakpoint(addr) => {
                // A trap from a scratch breakpoint means the pc sits one
                // byte past the instruction it still has to execute.
                let was_scratch = self.scratch.contains(&addr);
                self.clear_scratch(ctx);
                if was_scratch {
                    let _ = ctx.backend.set_ip(self.teb, addr);
                }

                // A registered breakpoint at the stop site is a real hit
                // that happened under our feet; honor its callback first.
                let enabled_hit = ctx
                    .breakpoints
                    .get(&self.leader)
                    .and_then(|set| set.get(addr))
                    .map(|bp| (bp.enabled, bp.callbacks.on_hit));
                if let Some((enabled, on_hit)) = enabled_hit {
                    if enabled {
                        let _ = ctx.backend.set_ip(self.teb, addr);
                    }
                    if let Some(on_hit) = on_hit {
                        if let Err(err) = on_hit(ctx, self.teb, addr) {
                            warn!("breakpoint callback failed: {}", err);
                        }
                    }
                }

                let decision =
                    self.poll_decision(ctx, |policy, ctx, handler| policy.keep_stepping(ctx, handler));
                match decision {
                    Decision::Cont => {
                        if self.singlestep(ctx).is_err() {
                            return self.singlestep_error(ctx);
                        }
                        Flow::Keep
                    }
                    Decision::Stop => self.finish_singlestep(ctx),
                    Decision::Fail => {
                        // Give up on this site for good; the breakpoint is
                        // deleted and never re-enabled.
                        let _ = ctx.bp_delete(self.leader, self.teb, self.bp_addr);
                        self.bp_was_enabled = false;
                        self.enter_sinking(ctx)
                    }
                }
            }
            EventKind::Signal(signal) => {
                // A real signal landed instead of the step trap.  The
                // thread may not be at an instruction boundary, so step
                // again unconditionally, delivering the signal.
                if self.restep_with_signal(ctx, signal).is_err() {
                    return self.singlestep_error(ctx);
                }
                Flow::Keep
            }
            EventKind::Exit(_) | EventKind::ExitSignal(_) => {
                // teb died mid-step; nothing left to re-enable for it.
                self.absorb(ctx, &event);
                self.enter_sinking(ctx)
            }
            _ => {
                self.absorb(ctx, &event);
                Flow::Keep
            }
        }
    }

    fn on_event_sinking(&mut self, ctx: &mut TraceContext, event: Event) -> Flow {
        self.absorb(ctx, &event);
        if self.await_sigstop_delivery() {
            self.process_stopping_done(ctx)
        } else {
            Flow::Keep
        }
    }

    fn on_event_ugly(&mut self, ctx: &mut TraceContext, event: Event) -> Flow {
        if event.pid == self.teb && !self.teb_done {
            if let EventKind::Breakpoint(addr) = event.kind {
                if Some(addr) == self.ugly_bp {
                    if let Some(task) = self.pids.get_mut(self.teb) {
                        task.got_event = true;
                    }
                    let _ = ctx.backend.set_ip(self.teb, addr);
                    let _ = ctx.bp_delete(self.leader, self.teb, addr);
                    self.teb_done = true;
                    return self.maybe_finish_ugly(ctx);
                }
            }
        }

        self.absorb(ctx, &event);
        self.maybe_finish_ugly(ctx)
    }

    fn maybe_finish_ugly(&mut self, ctx: &mut TraceContext) -> Flow {
        if !self.teb_done || !self.all_stops_accountable(ctx) {
            return Flow::Keep;
        }
        if self.exiting {
            exiting::detach_group(ctx, self.leader);
        } else {
            self.resume_pending(ctx);
            ctx.continue_process(self.teb);
        }
        Flow::Done
    }

    // The default on_all_stopped: pin the siblings, lift the trap, and
    // step teb across the restored instruction.
    pub fn disable_and_singlestep(&mut self, ctx: &mut TraceContext) -> Flow {
        for tid in ctx.registry.tasks_of(self.leader) {
            if tid != self.teb {
                let _ = ctx.backend.suspend_thread(tid);
            }
        }
        if let Some(proc) = ctx.registry.get_mut(self.teb) {
            proc.onstep = true;
        }

        if let Err(err) = ctx.bp_disable(self.leader, self.teb, self.bp_addr) {
            warn!("disabling breakpoint at {:#x} failed: {}", self.bp_addr, err);
            return self.singlestep_error(ctx);
        }

        self.state = StopState::Singlestep;
        if self.singlestep(ctx).is_err() {
            return self.singlestep_error(ctx);
        }
        Flow::Keep
    }

    // One single-step of teb: hardware when the backend can, otherwise
    // one-shot scratch breakpoints at every possible next instruction.
    fn singlestep(&mut self, ctx: &mut TraceContext) -> Result<(), ()> {
        let targets = match ctx.backend.sw_singlestep_targets(self.teb) {
            Ok(targets) => targets,
            Err(_) => return Err(()),
        };
        match targets {
            None => ctx.backend.step(self.teb, 0).map_err(|_| ()),
            Some(addrs) => {
                for addr in addrs.into_iter().take(arch::SW_SINGLESTEP_MAX) {
                    if ctx
                        .bp_insert(self.leader, self.teb, addr, None, true, Default::default())
                        .is_err()
                        || ctx.bp_enable(self.leader, self.teb, addr).is_err()
                    {
                        return Err(());
                    }
                    self.scratch.push(addr);
                }
                ctx.backend.cont(self.teb, 0).map_err(|_| ())
            }
        }
    }

    fn restep_with_signal(&mut self, ctx: &mut TraceContext, signal: i32) -> Result<(), ()> {
        if self.scratch.is_empty() {
            ctx.backend.step(self.teb, signal).map_err(|_| ())
        } else {
            // Scratch breakpoints are still planted; just let the thread
            // run into one of them.
            ctx.backend.cont(self.teb, signal).map_err(|_| ())
        }
    }

    fn clear_scratch(&mut self, ctx: &mut TraceContext) {
        let scratch = std::mem::take(&mut self.scratch);
        for addr in scratch {
            let _ = ctx.bp_delete(self.leader, self.teb, addr);
        }
    }

    // Step done (or given up): restore the trap if it belongs there, then
    // drain the stragglers.
    fn finish_singlestep(&mut self, ctx: &mut TraceContext) -> Flow {
        if self.bp_was_enabled {
            if let Err(err) = ctx.bp_enable(self.leader, self.teb, self.bp_addr) {
                warn!("re-enabling breakpoint at {:#x} failed: {}", self.bp_addr, err);
            }
        }
        self.enter_sinking(ctx)
    }

    fn singlestep_error(&mut self, ctx: &mut TraceContext) -> Flow {
        warn!(
            "single-step of {} failed, abandoning breakpoint at {:#x}",
            self.teb, self.bp_addr
        );
        self.clear_scratch(ctx);
        let _ = ctx.bp_delete(self.leader, self.teb, self.bp_addr);
        self.bp_was_enabled = false;
        self.enter_sinking(ctx)
    }

    fn enter_sinking(&mut self, ctx: &mut TraceContext) -> Flow {
        self.state = StopState::Sinking;
        self.release_siblings(ctx);
        self.continue_for_sigstop_delivery(ctx);
        if self.await_sigstop_delivery() {
            self.process_stopping_done(ctx)
        } else {
            Flow::Keep
        }
    }

    fn release_siblings(&mut self, ctx: &mut TraceContext) {
        let onstep = ctx
            .registry
            .get(self.teb)
            .map(|proc| proc.onstep)
            .unwrap_or(false);
        if !onstep {
            return;
        }
        for tid in ctx.registry.tasks_of(self.leader) {
            if tid != self.teb {
                let _ = ctx.backend.resume_thread(tid);
            }
        }
        if let Some(proc) = ctx.registry.get_mut(self.teb) {
            proc.onstep = false;
        }
    }

    // Threads that stopped for some other event still have our SIGSTOP
    // queued; let them run so the kernel can deliver it.
    fn continue_for_sigstop_delivery(&mut self, ctx: &mut TraceContext) {
        let pending: Vec<u32> = self
            .pids
            .iter()
            .filter(|task| task.pid != 0 && task.sigstopped && !task.delivered && task.got_event)
            .map(|task| task.pid)
            .collect();
        for pid in pending {
            if let Err(err) = ctx.backend.cont_syscall(pid, 0) {
                if err.vanished() {
                    if let Some(task) = self.pids.get_mut(pid) {
                        task.pid = 0;
                    }
                }
            }
        }
    }

    fn await_sigstop_delivery(&self) -> bool {
        !self
            .pids
            .iter()
            .any(|task| task.pid != 0 && task.sigstopped && !task.delivered)
    }

    // Every recorded task has been heard from, one way or another.
    fn all_stops_accountable(&self, ctx: &TraceContext) -> bool {
        !self.pids.iter().any(|task| {
            task.pid != 0
                && !task.vforked
                && !task.got_event
                && ctx.queue.scan(|event| event.pid == task.pid).is_none()
        })
    }

    // All SIGSTOPs are in.  Resume the world, or hand over to the
    // workaround / detach paths.
    fn process_stopping_done(&mut self, ctx: &mut TraceContext) -> Flow {
        debug!("stop cycle done for teb {}", self.teb);

        if self.exiting {
            return self.begin_ugly_workaround(ctx);
        }

        let decision =
            self.poll_decision(ctx, |policy, ctx, handler| policy.ugly_workaround(ctx, handler));
        match decision {
            Decision::Cont => {
                self.resume_pending(ctx);
                self.begin_ugly_workaround(ctx)
            }
            Decision::Stop | Decision::Fail => {
                self.resume_pending(ctx);
                self.resume_teb(ctx);
                Flow::Done
            }
        }
    }

    // Resume every task holding a pending stop from this cycle.  Tasks
    // with a queued event are left alone: the replay of that event is
    // what resumes them, possibly with a signal to deliver.
    fn resume_pending(&mut self, ctx: &mut TraceContext) {
        let pending: Vec<u32> = self
            .pids
            .iter()
            .filter(|task| {
                task.pid != 0
                    && task.pid != self.teb
                    && (task.delivered || task.sysret)
                    && ctx.queue.scan(|event| event.pid == task.pid).is_none()
            })
            .map(|task| task.pid)
            .collect();
        for pid in pending {
            ctx.continue_process(pid);
            if let Some(task) = self.pids.get_mut(pid) {
                task.sigstopped = false;
                task.delivered = false;
                task.sysret = false;
            }
        }
    }

    fn resume_teb(&mut self, ctx: &mut TraceContext) {
        let alive = self.pids.get(self.teb).is_some();
        if alive {
            ctx.continue_process(self.teb);
        }
    }

    // Plant a scratch breakpoint at teb's current position and let it
    // run.  Some kernels kill a tracee detached straight after a
    // single-step with the pending trap; parking the thread on a real
    // breakpoint first puts the detach on a safe boundary.
    fn begin_ugly_workaround(&mut self, ctx: &mut TraceContext) -> Flow {
        if self.pids.get(self.teb).is_none() {
            // teb is gone; there is no step to cover for.
            self.teb_done = true;
            return self.maybe_finish_ugly(ctx);
        }

        let ip = match ctx.backend.get_ip(self.teb) {
            Ok(ip) => ip,
            Err(_) => {
                self.teb_done = true;
                return self.maybe_finish_ugly(ctx);
            }
        };

        if ctx
            .bp_insert(self.leader, self.teb, ip, None, true, Default::default())
            .is_err()
            || ctx.bp_enable(self.leader, self.teb, ip).is_err()
            || ctx.backend.cont(self.teb, 0).is_err()
        {
            let _ = ctx.bp_delete(self.leader, self.teb, ip);
            self.teb_done = true;
            return self.maybe_finish_ugly(ctx);
        }

        self.ugly_bp = Some(ip);
        self.state = StopState::UglyWorkaround;
        debug!("workaround breakpoint for {} at {:#x}", self.teb, ip);
        Flow::Keep
    }

    // Run a policy callback with the policy temporarily taken out of the
    // handler, so both sides can be borrowed mutably.
    fn poll(
        &mut self,
        ctx: &mut TraceContext,
        call: impl FnOnce(&mut dyn StopPolicy, &mut TraceContext, &mut StoppingHandler) -> Flow,
    ) -> Flow {
        match self.policy.take() {
            Some(mut policy) => {
                let flow = call(policy.as_mut(), ctx, self);
                self.policy = Some(policy);
                flow
            }
            None => Flow::Keep,
        }
    }

    fn poll_decision(
        &mut self,
        ctx: &mut TraceContext,
        call: impl FnOnce(&mut dyn StopPolicy, &mut TraceContext, &mut StoppingHandler) -> Decision,
    ) -> Decision {
        match self.policy.take() {
            Some(mut policy) => {
                let decision = call(policy.as_mut(), ctx, self);
                self.policy = Some(policy);
                decision
            }
            None => Decision::Stop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_set_ensure_is_idempotent() {
        let mut pids = PidSet::new();
        pids.ensure(100).sigstopped = true;
        pids.ensure(100).delivered = true;
        pids.ensure(101);

        assert_eq!(pids.iter().count(), 2);
        let task = pids.get(100).unwrap();
        assert!(task.sigstopped && task.delivered);
    }

    #[test]
    fn zeroed_tasks_are_unreachable_by_pid() {
        let mut pids = PidSet::new();
        pids.ensure(100);
        pids.get_mut(100).unwrap().pid = 0;

        assert!(pids.get(100).is_none());
        assert_eq!(pids.iter().count(), 1);
    }

    #[test]
    fn delivered_implies_sigstopped_in_protocol_updates() {
        // The sinking filter only marks delivery on tasks it signalled.
        let mut pids = PidSet::new();
        pids.ensure(100).sigstopped = true;
        pids.ensure(101);

        for task in pids.iter_mut() {
            if task.sigstopped && !task.delivered {
                task.delivered = true;
            }
        }
        assert!(pids.get(100).unwrap().delivered);
        assert!(!pids.get(101).unwrap().delivered);
        for task in pids.iter() {
            assert!(!task.delivered || task.sigstopped);
        }
    }
}
