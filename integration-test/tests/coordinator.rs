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

// Stop-the-world coordination, driven end to end through the real event
// loop against the scripted kernel.

use callscope_trace::breakpoint::BreakpointCallbacks;
use callscope_trace::ptrace::RawStatus;
use callscope_trace::stopping;
use callscope_trace::stopping::{Decision, DefaultPolicy, StopPolicy, StoppingHandler};
use callscope_trace::trace;
use integration_test::{Op, ResumeAction, ScriptedBackend, SharedOutput, SimState};
use std::error::Error;

const TRAP: u8 = 0xCC;

fn index_of(ops: &[Op], op: &Op) -> Option<usize> {
    ops.iter().position(|other| other == op)
}

// Last occurrence; pokes repeat (the arming write at setup, the re-arming
// write at cycle end), and order assertions want the latter.
fn rindex_of(ops: &[Op], op: &Op) -> Option<usize> {
    ops.iter().rposition(|other| other == op)
}

// Trace a single-threaded process through one breakpoint hit.  The trap
// byte must come out, the original instruction must be stepped, and the
// trap must go back in, with no SIGSTOP ever sent.
#[test]
fn test_single_threaded_hit() -> Result<(), Box<dyn Error>> {
    let backend = ScriptedBackend::new();
    let output = SharedOutput::new();
    backend.add_thread(1000, 1000, SimState::Running, 0x4001);
    backend.write_word(0x4000, 0x9090909090909055);
    backend.queue_status(1000, RawStatus::Stopped(libc::SIGTRAP));

    let mut ctx = integration_test::make_context(&backend, &output);
    ctx.registry.add(1000, None, 1000, false);
    ctx.bp_insert(1000, 1000, 0x4000, None, false, BreakpointCallbacks::default())?;
    ctx.bp_enable(1000, 1000, 0x4000)?;

    trace::run(&mut ctx)?;

    // Trap before, original during the step, trap after; no other value.
    assert_eq!(backend.byte_values(0x4000), vec![0x55, TRAP, 0x55, TRAP]);
    assert_eq!(backend.byte(0x4000), TRAP);

    let ops = backend.ops();
    assert!(!ops.iter().any(|op| matches!(op, Op::Sigstop(_))));
    let disable = index_of(&ops, &Op::Poke(1000, 0x4000, 0x9090909090909055)).unwrap();
    let step = index_of(&ops, &Op::Step(1000, 0)).unwrap();
    let reenable = rindex_of(&ops, &Op::Poke(1000, 0x4000, 0x90909090909090CC)).unwrap();
    let resume = index_of(&ops, &Op::ContSyscall(1000, 0)).unwrap();
    assert!(disable < step && step < reenable && reenable < resume);

    // The thread moved past the breakpoint address.
    assert_ne!(backend.ip(1000), 0x4000);
    Ok(())
}

// Two threads: the sibling must be SIGSTOP-ed, its stop sunk, and both
// resumed after the re-enable.
#[test]
fn test_two_thread_race() -> Result<(), Box<dyn Error>> {
    let backend = ScriptedBackend::new();
    let output = SharedOutput::new();
    backend.add_thread(2000, 2000, SimState::Running, 0x5001);
    backend.add_thread(2001, 2000, SimState::Running, 0x9999);
    backend.write_word(0x5000, 0x9090909090909042);
    backend.queue_status(2000, RawStatus::Stopped(libc::SIGTRAP));

    let mut ctx = integration_test::make_context(&backend, &output);
    ctx.registry.add(2000, None, 2000, false);
    ctx.registry.add(2001, Some(2000), 2000, false);
    ctx.bp_insert(2000, 2000, 0x5000, None, false, BreakpointCallbacks::default())?;
    ctx.bp_enable(2000, 2000, 0x5000)?;

    trace::run(&mut ctx)?;

    let ops = backend.ops();
    let sigstop = index_of(&ops, &Op::Sigstop(2001)).unwrap();
    let reenable = rindex_of(&ops, &Op::Poke(2000, 0x5000, 0x90909090909090CC)).unwrap();
    let resume_sibling = index_of(&ops, &Op::ContSyscall(2001, 0)).unwrap();
    let resume_teb = index_of(&ops, &Op::ContSyscall(2000, 0)).unwrap();
    assert!(sigstop < reenable);
    assert!(reenable < resume_sibling && reenable < resume_teb);

    assert_eq!(backend.byte_values(0x5000), vec![0x42, TRAP, 0x42, TRAP]);
    assert!(ctx.handlers.is_empty());
    Ok(())
}

// A real signal beats our SIGSTOP to a sibling.  The signal must be
// parked, the SIGSTOP sunk, and the signal re-delivered on resume.
#[test]
fn test_sigstop_and_signal_interleaved() -> Result<(), Box<dyn Error>> {
    let backend = ScriptedBackend::new();
    let output = SharedOutput::new();
    backend.add_thread(3000, 3000, SimState::Running, 0x6001);
    backend.add_thread(3001, 3000, SimState::Running, 0x8888);
    backend.write_word(0x6000, 0x9090909090909011);
    backend.queue_status(3000, RawStatus::Stopped(libc::SIGTRAP));
    backend.queue_status(3001, RawStatus::Stopped(libc::SIGUSR1));

    let mut ctx = integration_test::make_context(&backend, &output);
    ctx.registry.add(3000, None, 3000, false);
    ctx.registry.add(3001, Some(3000), 3000, false);
    ctx.bp_insert(3000, 3000, 0x6000, None, false, BreakpointCallbacks::default())?;
    ctx.bp_enable(3000, 3000, 0x6000)?;

    trace::run(&mut ctx)?;

    let ops = backend.ops();
    // SIGUSR1 is signum 10; it must come back exactly once, after the
    // cycle is over.
    let redelivery: Vec<usize> = ops
        .iter()
        .enumerate()
        .filter(|(_, op)| **op == Op::ContSyscall(3001, libc::SIGUSR1))
        .map(|(index, _)| index)
        .collect();
    assert_eq!(redelivery.len(), 1);
    let reenable = rindex_of(&ops, &Op::Poke(3000, 0x6000, 0x90909090909090CC)).unwrap();
    assert!(reenable < redelivery[0]);

    // The flush that let the pending SIGSTOP land.
    assert!(index_of(&ops, &Op::ContSyscall(3001, 0)).is_some());
    assert!(ctx.queue.is_empty());
    Ok(())
}

// A vfork parent is kernel-held: it must be recognized, not signalled,
// and the cycle must complete without hearing from it.
#[test]
fn test_vfork_parent_skipped() -> Result<(), Box<dyn Error>> {
    let backend = ScriptedBackend::new();
    let output = SharedOutput::new();
    backend.add_thread(4000, 4000, SimState::Running, 0x100);
    backend.add_thread(4002, 4000, SimState::Running, 0x200);
    backend.add_thread(4003, 4000, SimState::Running, 0x9001);
    backend.write_word(0x9000, 0x9090909090909077);

    let mut ctx = integration_test::make_context(&backend, &output);
    ctx.registry.add(4000, None, 4000, false);
    ctx.registry.add(4002, Some(4000), 4000, false);
    ctx.registry.add(4003, Some(4000), 4000, false);
    ctx.bp_insert(4000, 4000, 0x9000, None, false, BreakpointCallbacks::default())?;
    ctx.bp_enable(4000, 4000, 0x9000)?;

    // A vfork of child 4001 is in flight: the handler is on the child and
    // the parent sits blocked in the kernel.
    callscope_trace::vfork::continue_after_vfork(&mut ctx, 4000, 4001);
    backend.set_state(4000, SimState::KernelBlocked);

    backend.queue_status(4003, RawStatus::Stopped(libc::SIGTRAP));
    trace::run(&mut ctx)?;

    let ops = backend.ops();
    assert!(!ops.contains(&Op::Sigstop(4000)));
    assert!(ops.contains(&Op::Sigstop(4002)));
    assert!(ops.contains(&Op::Step(4003, 0)));
    // The cycle completed: teb resumed, trap back in place.
    assert!(ops.contains(&Op::ContSyscall(4003, 0)));
    assert_eq!(backend.byte(0x9000), TRAP);

    // Siblings were pinned for the step and released afterwards.
    let suspends = ops.iter().filter(|op| matches!(op, Op::Suspend(_))).count();
    let resumes = ops.iter().filter(|op| matches!(op, Op::Resume(_))).count();
    assert_eq!(suspends, resumes);
    assert!(suspends > 0);
    Ok(())
}

// At most one coordinator per leader.
#[test]
fn test_second_install_is_rejected() -> Result<(), Box<dyn Error>> {
    let backend = ScriptedBackend::new();
    let output = SharedOutput::new();
    backend.add_thread(1500, 1500, SimState::Stopped, 0x4000);
    backend.add_thread(1501, 1500, SimState::Running, 0x5000);
    backend.write_word(0x4000, 0x90909090909090AB);

    let mut ctx = integration_test::make_context(&backend, &output);
    ctx.registry.add(1500, None, 1500, false);
    ctx.registry.add(1501, Some(1500), 1500, false);
    ctx.bp_insert(1500, 1500, 0x4000, None, false, BreakpointCallbacks::default())?;
    ctx.bp_enable(1500, 1500, 0x4000)?;

    // With a running sibling, the first cycle parks in STOPPING.
    assert!(stopping::install(&mut ctx, 1500, 0x4000, Box::new(DefaultPolicy)));
    assert!(!stopping::install(&mut ctx, 1501, 0x4000, Box::new(DefaultPolicy)));

    let sigstops = backend
        .ops()
        .iter()
        .filter(|op| matches!(op, Op::Sigstop(_)))
        .count();
    assert_eq!(sigstops, 1);
    Ok(())
}

// A keep_stepping failure deletes the breakpoint for good and still
// leaves the process running.
struct FailPolicy;

impl StopPolicy for FailPolicy {
    fn keep_stepping(
        &mut self,
        _ctx: &mut callscope_trace::context::TraceContext,
        _handler: &mut StoppingHandler,
    ) -> Decision {
        Decision::Fail
    }
}

#[test]
fn test_keep_stepping_failure_deletes_breakpoint() -> Result<(), Box<dyn Error>> {
    let backend = ScriptedBackend::new();
    let output = SharedOutput::new();
    backend.add_thread(1600, 1600, SimState::Stopped, 0x4400);
    backend.write_word(0x4400, 0x90909090909090EE);

    let mut ctx = integration_test::make_context(&backend, &output);
    ctx.registry.add(1600, None, 1600, false);
    ctx.bp_insert(1600, 1600, 0x4400, None, false, BreakpointCallbacks::default())?;
    ctx.bp_enable(1600, 1600, 0x4400)?;

    // The install immediately disables and steps; the step trap then
    // polls the failing policy.
    assert!(stopping::install(&mut ctx, 1600, 0x4400, Box::new(FailPolicy)));
    trace::run(&mut ctx)?;

    assert!(ctx
        .breakpoints
        .get(&1600)
        .map(|set| set.get(0x4400).is_none())
        .unwrap_or(true));
    assert_eq!(backend.byte(0x4400), 0xEE);
    assert!(backend.ops().contains(&Op::ContSyscall(1600, 0)));
    assert!(ctx.handlers.is_empty());
    Ok(())
}

// Software single-step: with no hardware step available, one-shot scratch
// traps cover the possible next instructions and are cleaned up after.
#[test]
fn test_software_singlestep_uses_scratch_breakpoints() -> Result<(), Box<dyn Error>> {
    let backend = ScriptedBackend::new();
    let output = SharedOutput::new();
    backend.add_thread(8000, 8000, SimState::Running, 0xA001);
    backend.write_word(0xA000, 0x909090909090907F);
    backend.write_word(0xB000, 0x9090909090909031);
    backend.script_sw_targets(8000, vec![0xA005, 0xB000]);
    backend.queue_status(8000, RawStatus::Stopped(libc::SIGTRAP));
    // The resume lands on the fall-through scratch trap.
    backend.script_resume(
        8000,
        ResumeAction {
            status: RawStatus::Stopped(libc::SIGTRAP),
            new_ip: Some(0xA006),
        },
    );

    let mut ctx = integration_test::make_context(&backend, &output);
    ctx.registry.add(8000, None, 8000, false);
    ctx.bp_insert(8000, 8000, 0xA000, None, false, BreakpointCallbacks::default())?;
    ctx.bp_enable(8000, 8000, 0xA000)?;

    trace::run(&mut ctx)?;

    let ops = backend.ops();
    // No hardware step; the thread was resumed onto the scratch traps.
    assert!(!ops.iter().any(|op| matches!(op, Op::Step(_, _))));
    assert!(ops.contains(&Op::Cont(8000, 0)));

    // Scratch traps are gone, original bytes intact, real trap restored.
    assert_eq!(backend.byte(0xA005), 0x90);
    assert_eq!(backend.byte(0xB000), 0x31);
    assert_eq!(backend.byte(0xA000), TRAP);
    // The pc was moved back onto the not-yet-executed instruction.
    assert_eq!(backend.ip(8000), 0xA005);
    assert!(ctx.handlers.is_empty());
    Ok(())
}
