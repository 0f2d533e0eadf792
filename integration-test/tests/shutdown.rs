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

// Shutdown paths: the exit coordinator, the merge into a running stop
// cycle, and the detach-after-singlestep workaround.

use callscope_trace::breakpoint::BreakpointCallbacks;
use callscope_trace::ptrace::RawStatus;
use callscope_trace::trace;
use integration_test::{Op, ResumeAction, ScriptedBackend, SharedOutput, SimState};
use std::error::Error;

fn index_of(ops: &[Op], op: &Op) -> Option<usize> {
    ops.iter().position(|other| other == op)
}

// Shutdown lands while a stop cycle is mid-flight: the cycle must finish,
// park the stepped thread on a scratch breakpoint, and only then detach.
// If the tracee were detached straight off the single-step, some kernels
// would kill it with the pending trap.
#[test]
fn test_detach_after_singlestep_workaround() -> Result<(), Box<dyn Error>> {
    let backend = ScriptedBackend::new();
    let output = SharedOutput::new();
    backend.add_thread(6000, 6000, SimState::Running, 0x7001);
    backend.write_word(0x7000, 0x9090909090906766);
    backend.queue_status(6000, RawStatus::Stopped(libc::SIGTRAP));
    // Shutdown becomes visible right after the breakpoint hit is waited.
    backend.arm_shutdown_after_waits(1);
    // The workaround resume trips the scratch breakpoint.
    backend.script_resume(
        6000,
        ResumeAction {
            status: RawStatus::Stopped(libc::SIGTRAP),
            new_ip: Some(0x7002),
        },
    );

    let mut ctx = integration_test::make_context(&backend, &output);
    ctx.registry.add(6000, None, 6000, false);
    ctx.bp_insert(6000, 6000, 0x7000, None, false, BreakpointCallbacks::default())?;
    ctx.bp_enable(6000, 6000, 0x7000)?;

    trace::run(&mut ctx)?;

    let ops = backend.ops();
    // The workaround: a plain continue onto the scratch trap, then the
    // detach, in that order.
    let workaround_resume = index_of(&ops, &Op::Cont(6000, 0)).unwrap();
    let detach = index_of(&ops, &Op::Detach(6000)).unwrap();
    assert!(workaround_resume < detach);

    // Left running untraced: both the breakpoint byte and the scratch
    // byte are back to the original instructions.
    assert_eq!(backend.byte(0x7000), 0x66);
    assert_eq!(backend.byte(0x7001), 0x67);
    assert!(backend.detached(6000));
    assert!(ctx.registry.is_empty());
    Ok(())
}

// Plain shutdown of an idle group: SIGSTOP everyone, retract every
// breakpoint, detach with the leader last.
#[test]
fn test_exit_coordinator_detaches_leader_last() -> Result<(), Box<dyn Error>> {
    let backend = ScriptedBackend::new();
    let output = SharedOutput::new();
    backend.add_thread(7000, 7000, SimState::Running, 0x100);
    backend.add_thread(7001, 7000, SimState::Running, 0x200);
    backend.write_word(0x8000, 0x90909090909090D4);
    backend.set_shutdown();

    let mut ctx = integration_test::make_context(&backend, &output);
    ctx.registry.add(7000, None, 7000, false);
    ctx.registry.add(7001, Some(7000), 7000, false);
    ctx.bp_insert(7000, 7000, 0x8000, None, false, BreakpointCallbacks::default())?;
    ctx.bp_enable(7000, 7000, 0x8000)?;

    trace::run(&mut ctx)?;

    let ops = backend.ops();
    assert!(ops.contains(&Op::Sigstop(7000)));
    assert!(ops.contains(&Op::Sigstop(7001)));

    let detach_thread = index_of(&ops, &Op::Detach(7001)).unwrap();
    let detach_leader = index_of(&ops, &Op::Detach(7000)).unwrap();
    assert!(detach_thread < detach_leader);

    // Round-trip retract: the original byte is back.
    assert_eq!(backend.byte(0x8000), 0xD4);
    assert!(ctx.registry.is_empty());
    assert!(ctx.handlers.is_empty());
    Ok(())
}

// A thread that hit a breakpoint just as shutdown began has already
// executed the trap byte; its pc must be rewound onto the breakpoint
// address before the detach, or it resumes mid-instruction.
#[test]
fn test_pre_detach_ip_fixup() -> Result<(), Box<dyn Error>> {
    let backend = ScriptedBackend::new();
    let output = SharedOutput::new();
    backend.add_thread(7100, 7100, SimState::Running, 0x300);
    backend.add_thread(7101, 7100, SimState::Running, 0x8801);
    backend.write_word(0x8800, 0x90909090909090E2);
    backend.set_shutdown();
    backend.queue_status(7101, RawStatus::Stopped(libc::SIGTRAP));

    let mut ctx = integration_test::make_context(&backend, &output);
    ctx.registry.add(7100, None, 7100, false);
    ctx.registry.add(7101, Some(7100), 7100, false);
    ctx.bp_insert(7100, 7100, 0x8800, None, false, BreakpointCallbacks::default())?;
    ctx.bp_enable(7100, 7100, 0x8800)?;

    trace::run(&mut ctx)?;

    let ops = backend.ops();
    let fixup = index_of(&ops, &Op::SetIp(7101, 0x8800)).unwrap();
    let detach = index_of(&ops, &Op::Detach(7101)).unwrap();
    assert!(fixup < detach);

    assert_eq!(backend.byte(0x8800), 0xE2);
    assert_eq!(backend.ip(7101), 0x8800);
    assert!(ctx.registry.is_empty());
    Ok(())
}
