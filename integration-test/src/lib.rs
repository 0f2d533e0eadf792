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

// A scripted stand-in for the kernel trace interface.  It simulates just
// enough of ptrace semantics to drive the stop-the-world coordinator and
// the PLT resolution machinery end to end through the real event loop:
// threads with run states and signal queues, an 8-byte-word memory image,
// and a FIFO of wait statuses.  Tests inspect the recorded operations and
// the byte history of patched addresses afterwards.

use callscope_trace::backend::TraceBackend;
use callscope_trace::context::TraceContext;
use callscope_trace::ptrace::{RawStatus, ThreadState, TraceError, TraceErrorKind};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::Write;
use std::rc::Rc;

// The simulated run state of one thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimState {
    Running,
    Stopped,
    KernelBlocked,
}

// Every state-changing call a component makes against the backend, in
// order.  Assertions about protocol behavior are made against this log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Attach(u32),
    Detach(u32),
    SetOptions(u32),
    Cont(u32, i32),
    ContSyscall(u32, i32),
    Step(u32, i32),
    Poke(u32, u64, u64),
    SetIp(u32, u64),
    Sigstop(u32),
    Suspend(u32),
    Resume(u32),
}

// What happens when a thread actually gets to run after a resume.
pub struct ResumeAction {
    pub status: RawStatus,
    pub new_ip: Option<u64>,
}

// The effect of one single-step: where the pc lands and which words the
// stepped instruction writes.
pub struct StepAction {
    pub new_ip: u64,
    pub writes: Vec<(u64, u64)>,
}

struct SimThread {
    leader: u32,
    state: SimState,
    ip: u64,

    // Signals queued while the thread was already stopped; delivered one
    // per resume, like the kernel does.
    pending: VecDeque<i32>,

    // Scripted events that fire when the thread is resumed for real.
    on_resume: VecDeque<ResumeAction>,

    // Scripted effects of successive single-steps.
    steps: VecDeque<StepAction>,

    sw_targets: Option<Vec<u64>>,
    detached: bool,
}

struct Inner {
    threads: BTreeMap<u32, SimThread>,
    mem: HashMap<u64, u64>,
    wait_queue: VecDeque<(u32, RawStatus)>,
    ops: Vec<Op>,
    byte_history: HashMap<u64, Vec<u8>>,
    waits_until_shutdown: Option<usize>,
    shutdown: bool,
    steps_taken: usize,
}

#[derive(Clone)]
pub struct ScriptedBackend {
    inner: Rc<RefCell<Inner>>,
}

fn err(kind: TraceErrorKind, op: &'static str, pid: u32) -> TraceError {
    TraceError { kind, op, pid }
}

impl ScriptedBackend {
    pub fn new() -> ScriptedBackend {
        ScriptedBackend {
            inner: Rc::new(RefCell::new(Inner {
                threads: BTreeMap::new(),
                mem: HashMap::new(),
                wait_queue: VecDeque::new(),
                ops: Vec::new(),
                byte_history: HashMap::new(),
                waits_until_shutdown: None,
                shutdown: false,
                steps_taken: 0,
            })),
        }
    }

    pub fn add_thread(&self, pid: u32, leader: u32, state: SimState, ip: u64) {
        self.inner.borrow_mut().threads.insert(
            pid,
            SimThread {
                leader,
                state,
                ip,
                pending: VecDeque::new(),
                on_resume: VecDeque::new(),
                steps: VecDeque::new(),
                sw_targets: None,
                detached: false,
            },
        );
    }

    pub fn write_word(&self, address: u64, word: u64) {
        self.inner.borrow_mut().mem.insert(address, word);
    }

    pub fn word(&self, address: u64) -> u64 {
        self.inner.borrow().mem.get(&address).copied().unwrap_or(0)
    }

    pub fn byte(&self, address: u64) -> u8 {
        let word = self.word(address & !7);
        ((word >> ((address & 7) * 8)) & 0xFF) as u8
    }

    // Every distinct value the byte at `address` has held, in order,
    // first value included.
    pub fn byte_values(&self, address: u64) -> Vec<u8> {
        self.inner
            .borrow()
            .byte_history
            .get(&address)
            .cloned()
            .unwrap_or_default()
    }

    pub fn queue_status(&self, pid: u32, status: RawStatus) {
        self.inner.borrow_mut().wait_queue.push_back((pid, status));
    }

    pub fn script_resume(&self, pid: u32, action: ResumeAction) {
        if let Some(thread) = self.inner.borrow_mut().threads.get_mut(&pid) {
            thread.on_resume.push_back(action);
        }
    }

    pub fn script_step(&self, pid: u32, action: StepAction) {
        if let Some(thread) = self.inner.borrow_mut().threads.get_mut(&pid) {
            thread.steps.push_back(action);
        }
    }

    pub fn script_sw_targets(&self, pid: u32, targets: Vec<u64>) {
        if let Some(thread) = self.inner.borrow_mut().threads.get_mut(&pid) {
            thread.sw_targets = Some(targets);
        }
    }

    pub fn set_state(&self, pid: u32, state: SimState) {
        if let Some(thread) = self.inner.borrow_mut().threads.get_mut(&pid) {
            thread.state = state;
        }
    }

    pub fn arm_shutdown_after_waits(&self, waits: usize) {
        self.inner.borrow_mut().waits_until_shutdown = Some(waits);
    }

    pub fn set_shutdown(&self) {
        self.inner.borrow_mut().shutdown = true;
    }

    pub fn ops(&self) -> Vec<Op> {
        self.inner.borrow().ops.clone()
    }

    pub fn ip(&self, pid: u32) -> u64 {
        self.inner
            .borrow()
            .threads
            .get(&pid)
            .map(|t| t.ip)
            .unwrap_or(0)
    }

    pub fn detached(&self, pid: u32) -> bool {
        self.inner
            .borrow()
            .threads
            .get(&pid)
            .map(|t| t.detached)
            .unwrap_or(false)
    }

    fn record_poke(inner: &mut Inner, address: u64, word: u64) {
        let old = inner.mem.get(&address).copied().unwrap_or(0);
        for i in 0..8 {
            let old_byte = ((old >> (i * 8)) & 0xFF) as u8;
            let new_byte = ((word >> (i * 8)) & 0xFF) as u8;
            let history = inner.byte_history.entry(address + i).or_default();
            if history.is_empty() {
                history.push(old_byte);
            }
            if new_byte != *history.last().unwrap() {
                history.push(new_byte);
            }
        }
        inner.mem.insert(address, word);
    }

    // Resume semantics shared by cont and cont_syscall: queued signals
    // deliver first, then scripted events, then the thread just runs.
    fn resume(&self, pid: u32, op: Op) -> Result<(), TraceError> {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;
        inner.ops.push(op);
        let thread = inner
            .threads
            .get_mut(&pid)
            .ok_or_else(|| err(TraceErrorKind::Esrch, "cont", pid))?;
        if thread.detached {
            return Err(err(TraceErrorKind::Esrch, "cont", pid));
        }

        if let Some(signal) = thread.pending.pop_front() {
            inner.wait_queue.push_back((pid, RawStatus::Stopped(signal)));
            return Ok(());
        }
        if let Some(action) = inner
            .threads
            .get_mut(&pid)
            .and_then(|thread| thread.on_resume.pop_front())
        {
            if let Some(ip) = action.new_ip {
                inner.threads.get_mut(&pid).unwrap().ip = ip;
            }
            inner.wait_queue.push_back((pid, action.status));
            return Ok(());
        }
        inner.threads.get_mut(&pid).unwrap().state = SimState::Running;
        Ok(())
    }
}

impl TraceBackend for ScriptedBackend {
    fn attach(&mut self, pid: u32) -> Result<(), TraceError> {
        self.inner.borrow_mut().ops.push(Op::Attach(pid));
        Ok(())
    }

    fn detach(&mut self, pid: u32) -> Result<(), TraceError> {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;
        inner.ops.push(Op::Detach(pid));
        match inner.threads.get_mut(&pid) {
            Some(thread) => {
                thread.detached = true;
                Ok(())
            }
            None => Err(err(TraceErrorKind::Esrch, "detach", pid)),
        }
    }

    fn set_trace_options(&mut self, pid: u32) -> Result<(), TraceError> {
        self.inner.borrow_mut().ops.push(Op::SetOptions(pid));
        Ok(())
    }

    fn cont(&mut self, pid: u32, signal: i32) -> Result<(), TraceError> {
        self.resume(pid, Op::Cont(pid, signal))
    }

    fn cont_syscall(&mut self, pid: u32, signal: i32) -> Result<(), TraceError> {
        self.resume(pid, Op::ContSyscall(pid, signal))
    }

    fn step(&mut self, pid: u32, signal: i32) -> Result<(), TraceError> {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;
        inner.ops.push(Op::Step(pid, signal));
        inner.steps_taken += 1;
        if inner.steps_taken > 10_000 {
            return Err(err(TraceErrorKind::Eio, "step", pid));
        }

        let action = match inner.threads.get_mut(&pid) {
            Some(thread) => thread.steps.pop_front(),
            None => return Err(err(TraceErrorKind::Esrch, "step", pid)),
        };
        match action {
            Some(action) => {
                for (address, word) in &action.writes {
                    Self::record_poke(inner, *address, *word);
                }
                inner.threads.get_mut(&pid).unwrap().ip = action.new_ip;
            }
            None => {
                inner.threads.get_mut(&pid).unwrap().ip += 1;
            }
        }
        inner
            .wait_queue
            .push_back((pid, RawStatus::Stopped(libc::SIGTRAP)));
        Ok(())
    }

    fn peek_word(&mut self, pid: u32, address: u64) -> Result<u64, TraceError> {
        let inner = self.inner.borrow();
        if !inner.threads.contains_key(&pid) {
            return Err(err(TraceErrorKind::Esrch, "peek", pid));
        }
        Ok(inner.mem.get(&address).copied().unwrap_or(0))
    }

    fn poke_word(&mut self, pid: u32, address: u64, word: u64) -> Result<(), TraceError> {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;
        inner.ops.push(Op::Poke(pid, address, word));
        if !inner.threads.contains_key(&pid) {
            return Err(err(TraceErrorKind::Esrch, "poke", pid));
        }
        Self::record_poke(inner, address, word);
        Ok(())
    }

    fn get_ip(&mut self, pid: u32) -> Result<u64, TraceError> {
        self.inner
            .borrow()
            .threads
            .get(&pid)
            .map(|thread| thread.ip)
            .ok_or_else(|| err(TraceErrorKind::Esrch, "get_ip", pid))
    }

    fn set_ip(&mut self, pid: u32, ip: u64) -> Result<(), TraceError> {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;
        inner.ops.push(Op::SetIp(pid, ip));
        match inner.threads.get_mut(&pid) {
            Some(thread) => {
                thread.ip = ip;
                Ok(())
            }
            None => Err(err(TraceErrorKind::Esrch, "set_ip", pid)),
        }
    }

    fn syscall_number(&mut self, _pid: u32) -> Result<u64, TraceError> {
        Ok(0)
    }

    fn list_threads(&mut self, pid: u32) -> Result<Vec<u32>, TraceError> {
        let inner = self.inner.borrow();
        Ok(inner
            .threads
            .iter()
            .filter(|(_, thread)| thread.leader == pid && !thread.detached)
            .map(|(tid, _)| *tid)
            .collect())
    }

    fn thread_state(&mut self, tid: u32) -> ThreadState {
        let inner = self.inner.borrow();
        match inner.threads.get(&tid) {
            Some(thread) if thread.detached => ThreadState::Gone,
            Some(thread) => match thread.state {
                SimState::Running => ThreadState::Running,
                SimState::Stopped => ThreadState::TracedStop,
                SimState::KernelBlocked => ThreadState::Sleeping,
            },
            None => ThreadState::Gone,
        }
    }

    fn send_sigstop(&mut self, tid: u32) -> Result<(), TraceError> {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;
        inner.ops.push(Op::Sigstop(tid));
        let already_en_route = inner.wait_queue.iter().any(|(pid, _)| *pid == tid);
        match inner.threads.get_mut(&tid) {
            Some(thread) => {
                if thread.state == SimState::Running && !already_en_route {
                    thread.state = SimState::Stopped;
                    inner
                        .wait_queue
                        .push_back((tid, RawStatus::Stopped(libc::SIGSTOP)));
                } else {
                    // The thread is stopped, or about to stop for another
                    // event; the SIGSTOP stays queued until it next runs.
                    thread.pending.push_back(libc::SIGSTOP);
                }
                Ok(())
            }
            None => Err(err(TraceErrorKind::Esrch, "tgkill", tid)),
        }
    }

    fn suspend_thread(&mut self, tid: u32) -> Result<(), TraceError> {
        self.inner.borrow_mut().ops.push(Op::Suspend(tid));
        Ok(())
    }

    fn resume_thread(&mut self, tid: u32) -> Result<(), TraceError> {
        self.inner.borrow_mut().ops.push(Op::Resume(tid));
        Ok(())
    }

    fn wait(&mut self) -> Result<Option<(u32, RawStatus)>, TraceError> {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;
        if let Some(waits) = inner.waits_until_shutdown {
            if waits <= 1 {
                inner.shutdown = true;
                inner.waits_until_shutdown = None;
            } else {
                inner.waits_until_shutdown = Some(waits - 1);
            }
        }

        match inner.wait_queue.pop_front() {
            Some((pid, status)) => {
                if let Some(thread) = inner.threads.get_mut(&pid) {
                    if matches!(status, RawStatus::Stopped(_) | RawStatus::SyscallStop) {
                        thread.state = SimState::Stopped;
                    }
                }
                Ok(Some((pid, status)))
            }
            None => Ok(None),
        }
    }

    fn sw_singlestep_targets(&mut self, pid: u32) -> Result<Option<Vec<u64>>, TraceError> {
        Ok(self
            .inner
            .borrow()
            .threads
            .get(&pid)
            .and_then(|thread| thread.sw_targets.clone()))
    }

    fn shutdown_requested(&mut self) -> bool {
        self.inner.borrow().shutdown
    }
}

// A Write sink shared with the test so trace output can be asserted on.
#[derive(Clone)]
pub struct SharedOutput {
    buffer: Rc<RefCell<Vec<u8>>>,
}

impl SharedOutput {
    pub fn new() -> SharedOutput {
        SharedOutput {
            buffer: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.buffer.borrow()).into_owned()
    }
}

impl Write for SharedOutput {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.buffer.borrow_mut().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

// A TraceContext over a scripted backend, with handles kept by the test
// for inspection after the run.
pub fn make_context(backend: &ScriptedBackend, output: &SharedOutput) -> TraceContext {
    TraceContext::new(Box::new(backend.clone()), Box::new(output.clone()))
}
