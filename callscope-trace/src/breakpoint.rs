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
use crate::backend::TraceBackend;
use crate::context;
use crate::ptrace::TraceError;
use std::collections::HashMap;
use std::error::Error;

// A callback invoked when a breakpoint trap arrives at this address.
pub type HitCallback =
    fn(context: &mut context::TraceContext, pid: u32, address: u64) -> Result<(), Box<dyn Error>>;

// A callback deciding how to resume the thread after a hit.  When absent,
// the stop-the-world coordinator re-enables the breakpoint the slow way.
pub type ContinueCallback =
    fn(context: &mut context::TraceContext, pid: u32, address: u64) -> Result<(), Box<dyn Error>>;

// A callback invoked when the breakpoint is retracted at detach time.
pub type RetractCallback = fn(context: &mut context::TraceContext, leader: u32, address: u64);

// The callback vector attached to one breakpoint.
#[derive(Clone, Copy, Default)]
pub struct BreakpointCallbacks {
    pub on_hit: Option<HitCallback>,
    pub on_continue: Option<ContinueCallback>,
    pub on_retract: Option<RetractCallback>,
}

// Tracking data for a breakpoint.
#[derive(Clone)]
pub struct Breakpoint {
    // The instruction address at which the breakpoint was inserted.
    pub address: u64,

    // The original instruction word at the 8-byte aligned address where
    // the breakpoint was inserted.  Only one byte of it is ever patched.
    orig: u64,

    // True while the trap instruction is actually in tracee memory.  A
    // breakpoint is either fully enabled or fully disabled; the word
    // above holds whatever is needed to restore it exactly.
    pub enabled: bool,

    // How many insertions share this address.  Shared libraries mapped by
    // several symbols land on the same stub.
    pub refs: usize,

    // Index into the leader's PLT symbol table, for symbol breakpoints.
    pub symbol: Option<usize>,

    // One-shot breakpoints remove themselves after the first hit.  Used
    // for software single-step scratch traps and the detach workaround.
    pub one_shot: bool,

    pub callbacks: BreakpointCallbacks,
}

impl Breakpoint {
    // Patch the trap instruction into the breakpoint's byte of the
    // original word.  The peek/poke granularity is an aligned 8-byte
    // word, but instruction addresses are not aligned, so the right byte
    // has to be shifted into place.
    fn trap_word(&self, current: u64) -> u64 {
        let shift = (self.address & 7) * 8;
        ((arch::BREAKPOINT_INSN as u64) << shift) | (current & !(0xFF << shift))
    }

    // Restore the breakpoint's byte from the saved original word.  Only
    // that one byte is restored, because other breakpoints may live in
    // the same word.
    fn restore_word(&self, current: u64) -> u64 {
        let shift = (self.address & 7) * 8;
        (self.orig & (0xFF << shift)) | (current & !(0xFF << shift))
    }
}

// The set of breakpoints planted in one thread group, keyed by address.
#[derive(Clone)]
pub struct BreakpointSet {
    pub breakpoints: HashMap<u64, Breakpoint>,
}

impl BreakpointSet {
    pub fn new() -> BreakpointSet {
        BreakpointSet {
            breakpoints: HashMap::new(),
        }
    }

    pub fn get(&self, address: u64) -> Option<&Breakpoint> {
        self.breakpoints.get(&address)
    }

    pub fn get_mut(&mut self, address: u64) -> Option<&mut Breakpoint> {
        self.breakpoints.get_mut(&address)
    }

    // Insert a breakpoint, without writing the trap yet.  Inserting at an
    // existing address only bumps the reference count; the original
    // instruction word saved by the first insert stays authoritative.
    pub fn insert(
        &mut self,
        backend: &mut dyn TraceBackend,
        pid: u32,
        address: u64,
        symbol: Option<usize>,
        one_shot: bool,
        callbacks: BreakpointCallbacks,
    ) -> Result<(), TraceError> {
        if let Some(breakpoint) = self.breakpoints.get_mut(&address) {
            breakpoint.refs += 1;
            return Ok(());
        }

        let orig = backend.peek_word(pid, address & !7)?;
        self.breakpoints.insert(
            address,
            Breakpoint {
                address,
                orig,
                enabled: false,
                refs: 1,
                symbol,
                one_shot,
                callbacks,
            },
        );
        Ok(())
    }

    // Write the trap instruction.  Re-reads the containing word so that
    // neighboring breakpoints planted after insert are not clobbered.
    pub fn enable(
        &mut self,
        backend: &mut dyn TraceBackend,
        pid: u32,
        address: u64,
    ) -> Result<(), TraceError> {
        let breakpoint = match self.breakpoints.get_mut(&address) {
            Some(breakpoint) => breakpoint,
            None => return Ok(()),
        };
        if breakpoint.enabled {
            return Ok(());
        }

        let current = backend.peek_word(pid, address & !7)?;
        backend.poke_word(pid, address & !7, breakpoint.trap_word(current))?;
        breakpoint.enabled = true;
        Ok(())
    }

    // Restore the original byte at the breakpoint address.
    pub fn disable(
        &mut self,
        backend: &mut dyn TraceBackend,
        pid: u32,
        address: u64,
    ) -> Result<(), TraceError> {
        let breakpoint = match self.breakpoints.get_mut(&address) {
            Some(breakpoint) => breakpoint,
            None => return Ok(()),
        };
        if !breakpoint.enabled {
            return Ok(());
        }

        let current = backend.peek_word(pid, address & !7)?;
        backend.poke_word(pid, address & !7, breakpoint.restore_word(current))?;
        breakpoint.enabled = false;
        Ok(())
    }

    // Drop one reference; the breakpoint is removed, restoring the
    // original byte if needed, once the last reference is gone.
    pub fn delete(
        &mut self,
        backend: &mut dyn TraceBackend,
        pid: u32,
        address: u64,
    ) -> Result<(), TraceError> {
        let remove = match self.breakpoints.get_mut(&address) {
            Some(breakpoint) => {
                breakpoint.refs = breakpoint.refs.saturating_sub(1);
                breakpoint.refs == 0
            }
            None => false,
        };
        if remove {
            self.disable(backend, pid, address)?;
            self.breakpoints.remove(&address);
        }
        Ok(())
    }

    // Restore the original bytes of every enabled breakpoint.  Used when
    // detaching from a process to leave it runnable untraced.  Addresses
    // are returned so the caller can run the retract callbacks.
    pub fn retract_all(
        &mut self,
        backend: &mut dyn TraceBackend,
        pid: u32,
    ) -> Result<Vec<u64>, TraceError> {
        let mut addresses: Vec<u64> = self.breakpoints.keys().copied().collect();
        addresses.sort_unstable();
        for address in &addresses {
            self.disable(backend, pid, *address)?;
        }
        Ok(addresses)
    }

    pub fn addresses(&self) -> Vec<u64> {
        let mut addresses: Vec<u64> = self.breakpoints.keys().copied().collect();
        addresses.sort_unstable();
        addresses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ptrace::{RawStatus, ThreadState};
    use std::collections::HashMap;

    // A trace backend over a plain word map, enough to exercise the
    // byte-in-word patching.
    struct WordBackend {
        words: HashMap<u64, u64>,
    }

    impl WordBackend {
        fn new() -> WordBackend {
            WordBackend {
                words: HashMap::new(),
            }
        }

        fn byte_at(&self, address: u64) -> u8 {
            let word = self.words.get(&(address & !7)).copied().unwrap_or(0);
            ((word >> ((address & 7) * 8)) & 0xFF) as u8
        }
    }

    impl TraceBackend for WordBackend {
        fn attach(&mut self, _pid: u32) -> Result<(), TraceError> {
            Ok(())
        }
        fn detach(&mut self, _pid: u32) -> Result<(), TraceError> {
            Ok(())
        }
        fn set_trace_options(&mut self, _pid: u32) -> Result<(), TraceError> {
            Ok(())
        }
        fn cont(&mut self, _pid: u32, _signal: i32) -> Result<(), TraceError> {
            Ok(())
        }
        fn cont_syscall(&mut self, _pid: u32, _signal: i32) -> Result<(), TraceError> {
            Ok(())
        }
        fn step(&mut self, _pid: u32, _signal: i32) -> Result<(), TraceError> {
            Ok(())
        }
        fn peek_word(&mut self, _pid: u32, address: u64) -> Result<u64, TraceError> {
            Ok(self.words.get(&address).copied().unwrap_or(0))
        }
        fn poke_word(&mut self, _pid: u32, address: u64, word: u64) -> Result<(), TraceError> {
            self.words.insert(address, word);
            Ok(())
        }
        fn get_ip(&mut self, _pid: u32) -> Result<u64, TraceError> {
            Ok(0)
        }
        fn set_ip(&mut self, _pid: u32, _ip: u64) -> Result<(), TraceError> {
            Ok(())
        }
        fn syscall_number(&mut self, _pid: u32) -> Result<u64, TraceError> {
            Ok(0)
        }
        fn list_threads(&mut self, pid: u32) -> Result<Vec<u32>, TraceError> {
            Ok(vec![pid])
        }
        fn thread_state(&mut self, _tid: u32) -> ThreadState {
            ThreadState::TracedStop
        }
        fn send_sigstop(&mut self, _tid: u32) -> Result<(), TraceError> {
            Ok(())
        }
        fn wait(&mut self) -> Result<Option<(u32, RawStatus)>, TraceError> {
            Ok(None)
        }
    }

    #[test]
    fn enable_patches_one_byte_and_disable_restores_it() {
        let mut backend = WordBackend::new();
        backend.words.insert(0x4000, 0x1122334455667788);

        let mut set = BreakpointSet::new();
        set.insert(&mut backend, 1000, 0x4003, None, false, Default::default())
            .unwrap();
        set.enable(&mut backend, 1000, 0x4003).unwrap();

        assert_eq!(backend.byte_at(0x4003), arch::BREAKPOINT_INSN);
        // Neighboring bytes unchanged.
        assert_eq!(backend.byte_at(0x4002), 0x66);
        assert_eq!(backend.byte_at(0x4004), 0x44);

        set.disable(&mut backend, 1000, 0x4003).unwrap();
        assert_eq!(backend.byte_at(0x4003), 0x55);
        assert_eq!(backend.words[&0x4000], 0x1122334455667788);
    }

    #[test]
    fn two_breakpoints_in_one_word_do_not_clobber_each_other() {
        let mut backend = WordBackend::new();
        backend.words.insert(0x4000, 0x1122334455667788);

        let mut set = BreakpointSet::new();
        set.insert(&mut backend, 1000, 0x4001, None, false, Default::default())
            .unwrap();
        set.insert(&mut backend, 1000, 0x4006, None, false, Default::default())
            .unwrap();
        set.enable(&mut backend, 1000, 0x4001).unwrap();
        set.enable(&mut backend, 1000, 0x4006).unwrap();

        assert_eq!(backend.byte_at(0x4001), arch::BREAKPOINT_INSN);
        assert_eq!(backend.byte_at(0x4006), arch::BREAKPOINT_INSN);

        // Disabling one restores only its own byte.
        set.disable(&mut backend, 1000, 0x4001).unwrap();
        assert_eq!(backend.byte_at(0x4001), 0x77);
        assert_eq!(backend.byte_at(0x4006), arch::BREAKPOINT_INSN);
    }

    #[test]
    fn insert_is_idempotent_and_refcounted() {
        let mut backend = WordBackend::new();
        backend.words.insert(0x4000, 0xAABBCCDDEEFF0011);

        let mut set = BreakpointSet::new();
        set.insert(&mut backend, 1000, 0x4000, None, false, Default::default())
            .unwrap();
        set.enable(&mut backend, 1000, 0x4000).unwrap();
        set.insert(&mut backend, 1000, 0x4000, None, false, Default::default())
            .unwrap();
        assert_eq!(set.get(0x4000).unwrap().refs, 2);
        // The saved original is from before the trap was written.
        assert_eq!(set.get(0x4000).unwrap().orig, 0xAABBCCDDEEFF0011);

        set.delete(&mut backend, 1000, 0x4000).unwrap();
        assert!(set.get(0x4000).is_some());
        set.delete(&mut backend, 1000, 0x4000).unwrap();
        assert!(set.get(0x4000).is_none());
        assert_eq!(backend.byte_at(0x4000), 0x11);
    }

    #[test]
    fn retract_all_restores_every_original_byte() {
        let mut backend = WordBackend::new();
        backend.words.insert(0x4000, 0x00000000000000AA);
        backend.words.insert(0x5000, 0x00000000000000BB);

        let mut set = BreakpointSet::new();
        for address in [0x4000u64, 0x5000] {
            set.insert(&mut backend, 1000, address, None, false, Default::default())
                .unwrap();
            set.enable(&mut backend, 1000, address).unwrap();
        }
        assert_eq!(backend.byte_at(0x4000), arch::BREAKPOINT_INSN);

        set.retract_all(&mut backend, 1000).unwrap();
        assert_eq!(backend.byte_at(0x4000), 0xAA);
        assert_eq!(backend.byte_at(0x5000), 0xBB);
    }
}
