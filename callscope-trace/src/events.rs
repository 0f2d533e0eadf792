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

use std::collections::VecDeque;

// A canonicalized trace event, as dispatched to event handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // A breakpoint trap, with the breakpoint address.
    Breakpoint(u64),

    // Delivery of a signal to the thread.
    Signal(i32),

    // Entry to and return from a system call, with the syscall number.
    SyscallEntry(u64),
    Sysret(u64),

    // Thread exit, by status or by fatal signal.
    Exit(i32),
    ExitSignal(i32),

    // Process replaced its image.
    Exec,

    // New children, with the child pid.
    Fork(u32),
    Vfork(u32),
    VforkDone,
    Clone(u32),

    // A synthetic no-op event, fed to a freshly installed handler so it
    // can act immediately if its process group is already quiescent.
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    // The thread the event originated from.
    pub pid: u32,

    pub kind: EventKind,
}

// Verdict from a scanning callback: stop the scan here or keep going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scan {
    Yield,
    Cont,
}

// FIFO of events pending replay.  Event handlers park events here while a
// stop-the-world cycle is in flight; the outer loop replays them once the
// handler is gone.  Order is strict FIFO per originating thread.
pub struct EventQueue {
    events: VecDeque<Event>,
}

impl EventQueue {
    pub fn new() -> EventQueue {
        EventQueue {
            events: VecDeque::new(),
        }
    }

    pub fn enqueue(&mut self, event: Event) {
        self.events.push_back(event);
    }

    // Find the first queued event matching a predicate without removing it.
    pub fn scan(&self, pred: impl Fn(&Event) -> bool) -> Option<&Event> {
        self.events.iter().find(|event| pred(event))
    }

    // Visit queued events in order, returning the first one the callback
    // yields on.
    pub fn each(&self, mut visit: impl FnMut(&Event) -> Scan) -> Option<&Event> {
        self.events.iter().find(|event| visit(event) == Scan::Yield)
    }

    // Remove and return the first queued event matching a predicate,
    // preserving the order of the rest.
    pub fn dequeue_if(&mut self, pred: impl Fn(&Event) -> bool) -> Option<Event> {
        let index = self.events.iter().position(|event| pred(event))?;
        self.events.remove(index)
    }

    // Drop every queued event from the given set of threads.  Used when a
    // process group is detached or destroyed.
    pub fn purge(&mut self, pids: &[u32]) {
        self.events.retain(|event| !pids.contains(&event.pid));
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(pid: u32, kind: EventKind) -> Event {
        Event { pid, kind }
    }

    #[test]
    fn queue_is_fifo() {
        let mut queue = EventQueue::new();
        queue.enqueue(ev(10, EventKind::Signal(10)));
        queue.enqueue(ev(11, EventKind::Exec));
        queue.enqueue(ev(10, EventKind::Signal(12)));

        assert_eq!(queue.dequeue_if(|_| true), Some(ev(10, EventKind::Signal(10))));
        assert_eq!(queue.dequeue_if(|_| true), Some(ev(11, EventKind::Exec)));
        assert_eq!(queue.dequeue_if(|_| true), Some(ev(10, EventKind::Signal(12))));
        assert!(queue.is_empty());
    }

    #[test]
    fn scan_does_not_dequeue() {
        let mut queue = EventQueue::new();
        queue.enqueue(ev(10, EventKind::Breakpoint(0x4000)));

        assert!(queue.scan(|e| e.pid == 10).is_some());
        assert!(queue.scan(|e| e.pid == 99).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn dequeue_if_skips_nonmatching() {
        let mut queue = EventQueue::new();
        queue.enqueue(ev(10, EventKind::Signal(10)));
        queue.enqueue(ev(11, EventKind::Signal(11)));

        assert_eq!(
            queue.dequeue_if(|e| e.pid == 11),
            Some(ev(11, EventKind::Signal(11)))
        );
        // The earlier event from thread 10 is still first in line.
        assert_eq!(queue.dequeue_if(|_| true), Some(ev(10, EventKind::Signal(10))));
    }

    #[test]
    fn each_yields_first_match() {
        let mut queue = EventQueue::new();
        queue.enqueue(ev(10, EventKind::Signal(2)));
        queue.enqueue(ev(11, EventKind::Breakpoint(0x1000)));

        let mut seen = 0;
        let found = queue.each(|event| {
            seen += 1;
            match event.kind {
                EventKind::Breakpoint(_) => Scan::Yield,
                _ => Scan::Cont,
            }
        });
        assert_eq!(found.map(|e| e.pid), Some(11));
        assert_eq!(seen, 2);
    }

    #[test]
    fn purge_removes_only_named_pids() {
        let mut queue = EventQueue::new();
        queue.enqueue(ev(10, EventKind::Signal(10)));
        queue.enqueue(ev(11, EventKind::Signal(11)));
        queue.enqueue(ev(12, EventKind::Signal(12)));

        queue.purge(&[10, 12]);
        assert_eq!(queue.len(), 1);
        assert!(queue.scan(|e| e.pid == 11).is_some());
    }
}
