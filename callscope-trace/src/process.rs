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

use std::collections::HashMap;

// Bookkeeping for one OS-level task (thread) under trace.
#[derive(Debug)]
pub struct Process {
    pub pid: u32,

    // The thread that created this one, if we saw the creation.
    pub parent: Option<u32>,

    // The thread-group leader.  A leader's leader is itself.
    pub leader: u32,

    // Set between the clone/fork/attach notification and the first stop
    // we observe on the new thread.
    pub being_created: bool,

    // True while sibling threads are held suspended so this thread can
    // single-step across a disabled breakpoint.
    pub onstep: bool,

    // Whether the thread is between syscall-entry and syscall-return, and
    // the number of that syscall.  Needed to split the two stop flavors.
    pub in_syscall: bool,
    pub last_syscall: u64,
}

// Verdict from an each_task visitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskVisit {
    Stop,
    Cont,
}

// All threads known to the tracer, keyed by pid.  Pids double as the
// process handles; leader and parent links are pids into this same map,
// which keeps the sibling/leader cycles free of ownership knots.
pub struct ProcessRegistry {
    procs: HashMap<u32, Process>,
}

impl ProcessRegistry {
    pub fn new() -> ProcessRegistry {
        ProcessRegistry {
            procs: HashMap::new(),
        }
    }

    // Record a new thread.  A thread with no known parent becomes its own
    // leader unless the caller says otherwise.
    pub fn add(&mut self, pid: u32, parent: Option<u32>, leader: u32, being_created: bool) {
        self.procs.insert(
            pid,
            Process {
                pid,
                parent,
                leader,
                being_created,
                onstep: false,
                in_syscall: false,
                last_syscall: 0,
            },
        );
    }

    pub fn remove(&mut self, pid: u32) -> Option<Process> {
        self.procs.remove(&pid)
    }

    pub fn get(&self, pid: u32) -> Option<&Process> {
        self.procs.get(&pid)
    }

    pub fn get_mut(&mut self, pid: u32) -> Option<&mut Process> {
        self.procs.get_mut(&pid)
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.procs.contains_key(&pid)
    }

    pub fn leader_of(&self, pid: u32) -> Option<u32> {
        self.procs.get(&pid).map(|proc| proc.leader)
    }

    // Every thread of a group, in pid order so walks are deterministic.
    pub fn tasks_of(&self, leader: u32) -> Vec<u32> {
        let mut tasks: Vec<u32> = self
            .procs
            .values()
            .filter(|proc| proc.leader == leader)
            .map(|proc| proc.pid)
            .collect();
        tasks.sort_unstable();
        tasks
    }

    // Visit every thread in a group; an early Stop ends the walk and
    // returns the stopping thread's pid.
    pub fn each_task(
        &self,
        leader: u32,
        mut visit: impl FnMut(&Process) -> TaskVisit,
    ) -> Option<u32> {
        for pid in self.tasks_of(leader) {
            if let Some(proc) = self.procs.get(&pid) {
                if visit(proc) == TaskVisit::Stop {
                    return Some(pid);
                }
            }
        }
        None
    }

    // Move a thread into another group.  Used only by the vfork handler,
    // which makes the vforked child a pseudo-thread of its parent's group
    // while the two share an address space.
    pub fn change_leader(&mut self, pid: u32, new_leader: u32) {
        if let Some(proc) = self.procs.get_mut(&pid) {
            proc.leader = new_leader;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }

    pub fn all_pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.procs.keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    // Every distinct leader currently known.
    pub fn leaders(&self) -> Vec<u32> {
        let mut leaders: Vec<u32> = self.procs.values().map(|proc| proc.leader).collect();
        leaders.sort_unstable();
        leaders.dedup();
        leaders
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_group() -> ProcessRegistry {
        let mut registry = ProcessRegistry::new();
        registry.add(2000, None, 2000, false);
        registry.add(2001, Some(2000), 2000, false);
        registry.add(2002, Some(2000), 2000, false);
        registry.add(3000, None, 3000, false);
        registry
    }

    #[test]
    fn tasks_of_only_includes_group() {
        let registry = registry_with_group();
        assert_eq!(registry.tasks_of(2000), vec![2000, 2001, 2002]);
        assert_eq!(registry.tasks_of(3000), vec![3000]);
    }

    #[test]
    fn each_task_early_exit_returns_stopping_pid() {
        let registry = registry_with_group();
        let found = registry.each_task(2000, |proc| {
            if proc.pid == 2001 {
                TaskVisit::Stop
            } else {
                TaskVisit::Cont
            }
        });
        assert_eq!(found, Some(2001));

        let none = registry.each_task(2000, |_| TaskVisit::Cont);
        assert_eq!(none, None);
    }

    #[test]
    fn change_leader_moves_thread_between_groups() {
        let mut registry = registry_with_group();
        registry.change_leader(3000, 2000);
        assert_eq!(registry.leader_of(3000), Some(2000));
        assert_eq!(registry.tasks_of(2000), vec![2000, 2001, 2002, 3000]);

        registry.change_leader(3000, 3000);
        assert_eq!(registry.tasks_of(3000), vec![3000]);
    }

    #[test]
    fn leaders_are_deduplicated() {
        let registry = registry_with_group();
        assert_eq!(registry.leaders(), vec![2000, 3000]);
    }
}
