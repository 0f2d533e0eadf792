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

use crate::ptrace;
use crate::ptrace::{RawStatus, ThreadState, TraceError};

// The kernel trace interface as the tracer core consumes it.  Every
// operation is synchronous and errors are returned, never latched.  The
// production implementation below delegates to the ptrace wrappers; the
// test harness substitutes a scripted implementation so the coordination
// protocol can be driven without real processes.
pub trait TraceBackend {
    // Request tracing of a thread.  The attach-induced stop arrives
    // through wait() like any other event.
    fn attach(&mut self, pid: u32) -> Result<(), TraceError>;

    // Release a thread with pending signal 0.
    fn detach(&mut self, pid: u32) -> Result<(), TraceError>;

    // Set the child-following and syscall-marking trace options.
    fn set_trace_options(&mut self, pid: u32) -> Result<(), TraceError>;

    // Resume until the next stop, delivering a signal.
    fn cont(&mut self, pid: u32, signal: i32) -> Result<(), TraceError>;

    // Resume until the next syscall boundary, delivering a signal.
    fn cont_syscall(&mut self, pid: u32, signal: i32) -> Result<(), TraceError>;

    // Hardware single-step one instruction, delivering a signal.
    fn step(&mut self, pid: u32, signal: i32) -> Result<(), TraceError>;

    // Read one aligned 8-byte word of tracee memory.
    fn peek_word(&mut self, pid: u32, address: u64) -> Result<u64, TraceError>;

    // Write one aligned 8-byte word of tracee memory.
    fn poke_word(&mut self, pid: u32, address: u64, word: u64) -> Result<(), TraceError>;

    // Read and write the instruction pointer of a stopped thread.
    fn get_ip(&mut self, pid: u32) -> Result<u64, TraceError>;
    fn set_ip(&mut self, pid: u32, ip: u64) -> Result<(), TraceError>;

    // The number of the syscall a thread is stopped at.
    fn syscall_number(&mut self, pid: u32) -> Result<u64, TraceError>;

    // All thread ids of the process, from the kernel's point of view.
    fn list_threads(&mut self, pid: u32) -> Result<Vec<u32>, TraceError>;

    // The run state of one thread.
    fn thread_state(&mut self, tid: u32) -> ThreadState;

    // Queue SIGSTOP for one thread.
    fn send_sigstop(&mut self, tid: u32) -> Result<(), TraceError>;

    // Pin one thread so that resuming a sibling cannot wake it.  A thread
    // in ptrace-stop stays stopped until explicitly continued, so on
    // Linux these are bookkeeping points rather than kernel calls; the
    // coordinator still brackets every single-step with them.
    fn suspend_thread(&mut self, tid: u32) -> Result<(), TraceError> {
        let _ = tid;
        Ok(())
    }
    fn resume_thread(&mut self, tid: u32) -> Result<(), TraceError> {
        let _ = tid;
        Ok(())
    }

    // Wait for the next raw event from any traced thread.  None means no
    // traced children remain.
    fn wait(&mut self) -> Result<Option<(u32, RawStatus)>, TraceError>;

    // When the architecture cannot hardware-single-step cleanly, return
    // the set of possible next instruction addresses so the coordinator
    // can plant one-shot breakpoints there instead.  None selects the
    // hardware step.
    fn sw_singlestep_targets(&mut self, pid: u32) -> Result<Option<Vec<u64>>, TraceError> {
        let _ = pid;
        Ok(None)
    }

    // Whether a breakpoint may be stepped over on this architecture at
    // all.  Architectures that cannot resume directly after a hit.
    fn can_singlestep_safely(&mut self) -> bool {
        true
    }

    // True once the operator has asked the tracer to shut down.
    fn shutdown_requested(&mut self) -> bool {
        false
    }
}

// The production backend: ptrace plus /proc.
pub struct LinuxBackend;

impl TraceBackend for LinuxBackend {
    fn attach(&mut self, pid: u32) -> Result<(), TraceError> {
        ptrace::attach(pid)
    }

    fn detach(&mut self, pid: u32) -> Result<(), TraceError> {
        ptrace::detach(pid)
    }

    fn set_trace_options(&mut self, pid: u32) -> Result<(), TraceError> {
        ptrace::set_trace_options(pid)
    }

    fn cont(&mut self, pid: u32, signal: i32) -> Result<(), TraceError> {
        ptrace::cont(pid, signal)
    }

    fn cont_syscall(&mut self, pid: u32, signal: i32) -> Result<(), TraceError> {
        ptrace::cont_syscall(pid, signal)
    }

    fn step(&mut self, pid: u32, signal: i32) -> Result<(), TraceError> {
        ptrace::singlestep(pid, signal)
    }

    fn peek_word(&mut self, pid: u32, address: u64) -> Result<u64, TraceError> {
        ptrace::peektext(pid, address)
    }

    fn poke_word(&mut self, pid: u32, address: u64, word: u64) -> Result<(), TraceError> {
        ptrace::poketext(pid, address, word)
    }

    fn get_ip(&mut self, pid: u32) -> Result<u64, TraceError> {
        ptrace::getregs(pid).map(|regs| regs.rip)
    }

    fn set_ip(&mut self, pid: u32, ip: u64) -> Result<(), TraceError> {
        let mut regs = ptrace::getregs(pid)?;
        regs.rip = ip;
        ptrace::setregs(pid, &regs)
    }

    fn syscall_number(&mut self, pid: u32) -> Result<u64, TraceError> {
        ptrace::getregs(pid).map(|regs| regs.orig_rax)
    }

    fn list_threads(&mut self, pid: u32) -> Result<Vec<u32>, TraceError> {
        ptrace::list_threads(pid)
    }

    fn thread_state(&mut self, tid: u32) -> ThreadState {
        ptrace::thread_state(tid)
    }

    fn send_sigstop(&mut self, tid: u32) -> Result<(), TraceError> {
        ptrace::kill_thread(tid, libc::SIGSTOP)
    }

    fn wait(&mut self) -> Result<Option<(u32, RawStatus)>, TraceError> {
        ptrace::waitpid_any()
    }

    fn shutdown_requested(&mut self) -> bool {
        ptrace::is_term_signal_pending()
    }
}

// Read one byte of tracee memory through the word operations.
pub fn peek_byte(
    backend: &mut dyn TraceBackend,
    pid: u32,
    address: u64,
) -> Result<u8, TraceError> {
    let word = backend.peek_word(pid, address & !7)?;
    Ok(((word >> ((address & 7) * 8)) & 0xFF) as u8)
}
