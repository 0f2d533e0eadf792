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

use std::error::Error;
use std::fmt;
use std::ptr;

// Classification of an errno returned by the kernel trace interface.
// ESRCH usually means the tracee vanished in a race with its own exit,
// which callers treat as the thread being gone rather than as a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceErrorKind {
    Esrch,
    Eperm,
    Eio,
    Einval,
    Other(i32),
}

// An error from one of the trace primitives, carrying the operation name
// and the thread it was aimed at.
#[derive(Debug, Clone)]
pub struct TraceError {
    pub kind: TraceErrorKind,
    pub op: &'static str,
    pub pid: u32,
}

impl Error for TraceError {}

impl fmt::Display for TraceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} on {}: {:?}", self.op, self.pid, self.kind)
    }
}

impl TraceError {
    // Build a TraceError from the current value of C's errno.
    fn from_errno(op: &'static str, pid: u32) -> TraceError {
        let errno = unsafe { *libc::__errno_location() };
        let kind = match errno {
            libc::ESRCH => TraceErrorKind::Esrch,
            libc::EPERM => TraceErrorKind::Eperm,
            libc::EIO => TraceErrorKind::Eio,
            libc::EINVAL => TraceErrorKind::Einval,
            other => TraceErrorKind::Other(other),
        };
        TraceError { kind, op, pid }
    }

    // True if the error indicates the tracee no longer exists.
    pub fn vanished(&self) -> bool {
        self.kind == TraceErrorKind::Esrch
    }
}

// A ptrace-event stop carries which life-cycle event fired.  The child
// pid (from PTRACE_GETEVENTMSG) is attached for the spawn events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildEventKind {
    Fork,
    Vfork,
    Clone,
    Exec,
    VforkDone,
}

// A decoded result from the waitpid system call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawStatus {
    // The thread exited.  Included is the exit value.
    Exited(i32),

    // The thread was terminated by a signal.
    Signaled(i32),

    // The thread stopped with a signal.
    Stopped(i32),

    // The thread stopped at a syscall boundary (PTRACE_O_TRACESYSGOOD).
    SyscallStop,

    // A ptrace life-cycle event stop (fork, vfork, clone, exec).
    ChildEvent(ChildEventKind, u32),
}

// The run state of a thread, read from /proc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Running,
    Sleeping,
    Stopped,
    TracedStop,
    Zombie,
    Gone,
}

type PtraceResult<T> = Result<T, TraceError>;

fn ptrace_raw(
    request: libc::c_uint,
    pid: u32,
    addr: u64,
    data: u64,
    op: &'static str,
) -> PtraceResult<i64> {
    unsafe {
        *libc::__errno_location() = 0;
        let result = libc::ptrace(request, pid, addr, data);
        if result == -1 && *libc::__errno_location() != 0 {
            Err(TraceError::from_errno(op, pid))
        } else {
            Ok(result)
        }
    }
}

// Attach a trace to an existing thread.  The caller must wait for the
// attach-induced stop before touching the thread.
pub fn attach(pid: u32) -> PtraceResult<()> {
    ptrace_raw(libc::PTRACE_ATTACH, pid, 0, 0, "attach").map(|_| ())
}

// Detach from a thread which is currently being traced, delivering no
// pending signal.
pub fn detach(pid: u32) -> PtraceResult<()> {
    ptrace_raw(libc::PTRACE_DETACH, pid, 0, 0, "detach").map(|_| ())
}

// Continue a traced thread until its next stop, delivering a signal.
pub fn cont(pid: u32, signal: i32) -> PtraceResult<()> {
    ptrace_raw(libc::PTRACE_CONT, pid, 0, signal as u64, "cont").map(|_| ())
}

// Continue a traced thread, stopping at the next syscall boundary.
pub fn cont_syscall(pid: u32, signal: i32) -> PtraceResult<()> {
    ptrace_raw(libc::PTRACE_SYSCALL, pid, 0, signal as u64, "cont_syscall").map(|_| ())
}

// Step a traced thread through a single instruction.
pub fn singlestep(pid: u32, signal: i32) -> PtraceResult<()> {
    ptrace_raw(libc::PTRACE_SINGLESTEP, pid, 0, signal as u64, "singlestep").map(|_| ())
}

// Read an 8-byte word of memory from a stopped traced thread.
pub fn peektext(pid: u32, address: u64) -> PtraceResult<u64> {
    ptrace_raw(libc::PTRACE_PEEKTEXT, pid, address, 0, "peektext").map(|word| word as u64)
}

// Write an 8-byte word of memory to a stopped traced thread.
pub fn poketext(pid: u32, address: u64, word: u64) -> PtraceResult<()> {
    ptrace_raw(libc::PTRACE_POKETEXT, pid, address, word, "poketext").map(|_| ())
}

// Get the CPU register contents of a stopped traced thread.
pub fn getregs(pid: u32) -> PtraceResult<libc::user_regs_struct> {
    unsafe {
        let mut regs = std::mem::MaybeUninit::<libc::user_regs_struct>::zeroed().assume_init();
        if libc::ptrace(libc::PTRACE_GETREGS, pid, 0, &mut regs) == -1 {
            Err(TraceError::from_errno("getregs", pid))
        } else {
            Ok(regs)
        }
    }
}

// Set the CPU register contents of a stopped traced thread.
pub fn setregs(pid: u32, regs: &libc::user_regs_struct) -> PtraceResult<()> {
    unsafe {
        if libc::ptrace(libc::PTRACE_SETREGS, pid, 0, regs) == -1 {
            Err(TraceError::from_errno("setregs", pid))
        } else {
            Ok(())
        }
    }
}

// Set the ptrace options used for following a thread group: report
// clone/fork/vfork children and execs, and mark syscall stops so they
// can be told apart from breakpoint traps.
pub fn set_trace_options(pid: u32) -> PtraceResult<()> {
    let options = libc::PTRACE_O_TRACECLONE
        | libc::PTRACE_O_TRACEFORK
        | libc::PTRACE_O_TRACEVFORK
        | libc::PTRACE_O_TRACEVFORKDONE
        | libc::PTRACE_O_TRACEEXEC
        | libc::PTRACE_O_TRACESYSGOOD;
    ptrace_raw(libc::PTRACE_SETOPTIONS, pid, 0, options as u64, "setoptions").map(|_| ())
}

// Get the ptrace event message for a stopped thread.  Used to get the pid
// of a newly spawned child after a clone/fork/vfork event.
pub fn geteventmsg(pid: u32) -> PtraceResult<u32> {
    let mut result: libc::c_ulong = 0;
    unsafe {
        if libc::ptrace(libc::PTRACE_GETEVENTMSG, pid, 0, &mut result) == -1 {
            Err(TraceError::from_errno("geteventmsg", pid))
        } else {
            Ok(result as u32)
        }
    }
}

// Send a signal to one specific thread.
pub fn kill_thread(tid: u32, signal: i32) -> PtraceResult<()> {
    unsafe {
        if libc::syscall(libc::SYS_tgkill, tgid_of(tid), tid, signal) == -1 {
            Err(TraceError::from_errno("tgkill", tid))
        } else {
            Ok(())
        }
    }
}

// The thread-group id of a thread, from /proc.  Falls back to the tid
// itself when the stat file is gone (the thread died already).
fn tgid_of(tid: u32) -> u32 {
    match std::fs::read_to_string(format!("/proc/{}/status", tid)) {
        Ok(text) => text
            .lines()
            .find(|line| line.starts_with("Tgid:"))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|field| field.parse().ok())
            .unwrap_or(tid),
        Err(_) => tid,
    }
}

// The run state of a thread, from the third field of /proc/<tid>/stat.
pub fn thread_state(tid: u32) -> ThreadState {
    let text = match std::fs::read_to_string(format!("/proc/{}/stat", tid)) {
        Ok(text) => text,
        Err(_) => return ThreadState::Gone,
    };

    // The state field follows the parenthesized command name, which may
    // itself contain spaces.
    let state = text
        .rfind(')')
        .and_then(|close| text[close..].split_whitespace().nth(1))
        .and_then(|field| field.chars().next());
    match state {
        Some('R') => ThreadState::Running,
        Some('S') | Some('D') => ThreadState::Sleeping,
        Some('T') => ThreadState::Stopped,
        Some('t') => ThreadState::TracedStop,
        Some('Z') | Some('X') => ThreadState::Zombie,
        _ => ThreadState::Gone,
    }
}

// List the thread ids of a process from /proc/<pid>/task.
pub fn list_threads(pid: u32) -> PtraceResult<Vec<u32>> {
    let entries = std::fs::read_dir(format!("/proc/{}/task", pid)).map_err(|_| TraceError {
        kind: TraceErrorKind::Esrch,
        op: "list_threads",
        pid,
    })?;

    let mut tids: Vec<u32> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str().and_then(|s| s.parse().ok()))
        .collect();
    tids.sort_unstable();
    Ok(tids)
}

// Wait for an event from any traced thread.  Returns None once no traced
// children remain.
pub fn waitpid_any() -> PtraceResult<Option<(u32, RawStatus)>> {
    unsafe {
        let mut status: i32 = 0;
        let result = libc::waitpid(-1, &mut status, libc::__WALL);
        if result == -1 {
            let errno = *libc::__errno_location();
            if errno == libc::ECHILD {
                return Ok(None);
            }
            return Err(TraceError::from_errno("waitpid", 0));
        }

        let pid = result as u32;
        Ok(Some((pid, decode_status(pid, status)?)))
    }
}

// Decode a raw waitpid status word into a RawStatus.
fn decode_status(pid: u32, status: i32) -> PtraceResult<RawStatus> {
    let event = status >> 16;
    if event != 0 {
        let kind = match event {
            libc::PTRACE_EVENT_FORK => ChildEventKind::Fork,
            libc::PTRACE_EVENT_VFORK => ChildEventKind::Vfork,
            libc::PTRACE_EVENT_CLONE => ChildEventKind::Clone,
            libc::PTRACE_EVENT_EXEC => ChildEventKind::Exec,
            libc::PTRACE_EVENT_VFORK_DONE => ChildEventKind::VforkDone,
            _ => {
                return Err(TraceError {
                    kind: TraceErrorKind::Einval,
                    op: "waitpid",
                    pid,
                })
            }
        };
        let msg = match kind {
            ChildEventKind::Exec => 0,
            _ => geteventmsg(pid).unwrap_or(0),
        };
        return Ok(RawStatus::ChildEvent(kind, msg));
    }

    if libc::WIFEXITED(status) {
        Ok(RawStatus::Exited(libc::WEXITSTATUS(status)))
    } else if libc::WIFSIGNALED(status) {
        Ok(RawStatus::Signaled(libc::WTERMSIG(status)))
    } else if libc::WIFSTOPPED(status) {
        let sig = libc::WSTOPSIG(status);
        if sig == libc::SIGTRAP | 0x80 {
            Ok(RawStatus::SyscallStop)
        } else {
            Ok(RawStatus::Stopped(sig))
        }
    } else {
        Err(TraceError {
            kind: TraceErrorKind::Einval,
            op: "waitpid",
            pid,
        })
    }
}

// Block signals which request termination of the tracer: SIGTERM, SIGINT.
// The event loop polls for pending termination signals before each wait,
// so the tracer still reacts, but only at a point where the tracees can
// be detached cleanly.
pub fn block_term_signals() -> Result<(), Box<dyn Error>> {
    unsafe {
        let mut sigset = std::mem::MaybeUninit::<libc::sigset_t>::zeroed().assume_init();

        if libc::sigemptyset(&mut sigset) == -1 {
            Err("sigemptyset failed")?
        }
        if libc::sigaddset(&mut sigset, libc::SIGTERM) == -1 {
            Err("sigaddset failed")?
        }
        if libc::sigaddset(&mut sigset, libc::SIGINT) == -1 {
            Err("sigaddset failed")?
        }
        if libc::sigprocmask(libc::SIG_BLOCK, &mut sigset, ptr::null_mut()) == -1 {
            Err("sigprocmask failed")?
        }
    }

    Ok(())
}

// Returns true if a blocked termination signal is pending for the tracer
// process, false otherwise.
pub fn is_term_signal_pending() -> bool {
    unsafe {
        let mut sigset = std::mem::MaybeUninit::<libc::sigset_t>::zeroed().assume_init();

        if libc::sigpending(&mut sigset) == -1 {
            return false;
        }

        libc::sigismember(&sigset, libc::SIGTERM) != 0
            || libc::sigismember(&sigset, libc::SIGINT) != 0
    }
}

// Fork off a new child and exec a given command.  The new process declares
// itself traceable before exec, so the tracer sees it stop at the exec
// trap before the first instruction of the target runs.
//
// Returns the pid of the new process.
pub fn spawn_traced(command: &[String]) -> Result<u32, Box<dyn Error>> {
    let mut cstrings: Vec<std::ffi::CString> = Vec::new();
    let mut args: Vec<*const libc::c_char> = Vec::new();
    for arg in command {
        let cstring = std::ffi::CString::new(arg.clone())?;
        args.push(cstring.as_ptr());
        cstrings.push(cstring);
    }
    args.push(ptr::null());

    let pid;
    unsafe {
        pid = libc::fork();
        if pid == 0 {
            libc::ptrace(libc::PTRACE_TRACEME, 0, 0, 0);
            libc::execvp(args[0], args.as_ptr());
            libc::exit(1);
        }
    }
    if pid == -1 {
        Err("fork failed")?
    }

    Ok(pid as u32)
}
