// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

/// Two schedulers feed the reactor: a FIFO of deferred tasks processed
/// every tick, and a min-ordered set of timers keyed by deadline.
/// Both are safe to feed from any thread.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use time;

use global::ToMillis;
use loop_msg::Task;
use runtime::Runtime;

pub fn now_ns() -> u64 {
    time::precise_time_ns()
}

pub struct DeferFifo {
    queue: Mutex<VecDeque<Task>>,
    ready: Condvar
}

impl DeferFifo {
    pub fn new() -> DeferFifo {
        DeferFifo {
            queue: Mutex::new(VecDeque::new()),
            ready: Condvar::new()
        }
    }

    pub fn push(&self, task: Task) {
        self.queue.lock().unwrap().push_back(task);
        self.ready.notify_one();
    }

    pub fn pop(&self) -> Option<Task> {
        self.queue.lock().unwrap().pop_front()
    }

    /// Blocking pop for helper threads; wakes up empty-handed after the
    /// timeout so the caller can check the running flag.
    pub fn pop_wait(&self, timeout: Duration) -> Option<Task> {
        let mut queue = self.queue.lock().unwrap();

        if queue.is_empty() {
            let (guard, _) = self.ready.wait_timeout(queue, timeout).unwrap();

            queue = guard;
        }

        queue.pop_front()
    }

    pub fn notify_all(&self) {
        self.ready.notify_all();
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }

    /// Forgets every queued task. A forked worker must not run work
    /// inherited from its parent.
    pub fn clear(&self) {
        self.queue.lock().unwrap().clear();
    }
}

pub struct TimerEntry {
    pub deadline: u64,
    pub interval: u64,
    /// Runs left, zero meaning forever.
    pub repetitions: usize,
    pub task: Box<FnMut(&Runtime) + Send>,
    pub on_finish: Option<Box<FnMut(&Runtime) + Send>>
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &TimerEntry) -> bool {
        self.deadline == other.deadline
    }
}

impl Eq for TimerEntry {
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &TimerEntry) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &TimerEntry) -> Ordering {
        // reversed: BinaryHeap is a max-heap, the nearest deadline wins
        other.deadline.cmp(&self.deadline)
    }
}

pub struct TimerSet {
    heap: Mutex<BinaryHeap<TimerEntry>>
}

impl TimerSet {
    pub fn new() -> TimerSet {
        TimerSet { heap: Mutex::new(BinaryHeap::new()) }
    }

    pub fn schedule_every(&self,
                          interval: Duration,
                          repetitions: usize,
                          task: Box<FnMut(&Runtime) + Send>,
                          on_finish: Option<Box<FnMut(&Runtime) + Send>>) {
        let interval_ns = interval.to_millis() * 1_000_000;

        self.push(TimerEntry {
            deadline: now_ns() + interval_ns,
            interval: interval_ns,
            repetitions: repetitions,
            task: task,
            on_finish: on_finish
        });
    }

    pub fn schedule_after(&self, delay: Duration, task: Box<FnMut(&Runtime) + Send>) {
        self.schedule_every(delay, 1, task, None);
    }

    pub fn push(&self, entry: TimerEntry) {
        self.heap.lock().unwrap().push(entry);
    }

    /// Nanoseconds until the nearest deadline, if any.
    pub fn next_delay(&self, now: u64) -> Option<u64> {
        self.heap.lock().unwrap().peek().map(|e| e.deadline.saturating_sub(now))
    }

    /// Removes every entry whose deadline has passed. Each timer comes
    /// out at most once per call, so one tick fires one run per timer.
    pub fn pop_expired(&self, now: u64, out: &mut Vec<TimerEntry>) {
        let mut heap = self.heap.lock().unwrap();

        while heap.peek().map(|e| e.deadline <= now).unwrap_or(false) {
            out.push(heap.pop().unwrap());
        }
    }

    /// Empties the set; the reactor runs the `on_finish` hooks when it
    /// stops.
    pub fn drain(&self) -> Vec<TimerEntry> {
        let mut heap = self.heap.lock().unwrap();
        let mut out = Vec::with_capacity(heap.len());

        while let Some(entry) = heap.pop() {
            out.push(entry);
        }
        out
    }

    pub fn clear(&self) {
        self.heap.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Box<FnMut(&::runtime::Runtime) + Send> {
        Box::new(|_: &::runtime::Runtime| {})
    }

    #[test]
    fn nearest_deadline_comes_out_first() {
        let timers = TimerSet::new();

        timers.push(TimerEntry {
            deadline: 300, interval: 0, repetitions: 1, task: noop(), on_finish: None
        });
        timers.push(TimerEntry {
            deadline: 100, interval: 0, repetitions: 1, task: noop(), on_finish: None
        });
        timers.push(TimerEntry {
            deadline: 200, interval: 0, repetitions: 1, task: noop(), on_finish: None
        });

        let mut expired = Vec::new();

        timers.pop_expired(250, &mut expired);
        assert_eq!(2, expired.len());
        assert_eq!(100, expired[0].deadline);
        assert_eq!(200, expired[1].deadline);
        assert_eq!(Some(50), timers.next_delay(250));
    }

    #[test]
    fn fifo_keeps_order() {
        use loop_msg::Task;

        let fifo = DeferFifo::new();

        fifo.push(Task::Flush(::global::Uuid::compose(1, 0)));
        fifo.push(Task::Close(::global::Uuid::compose(2, 0)));

        match fifo.pop() {
            Some(Task::Flush(uuid)) => assert_eq!(1, uuid.fd()),
            _ => panic!("expected the flush first")
        }
        match fifo.pop() {
            Some(Task::Close(uuid)) => assert_eq!(2, uuid.fd()),
            _ => panic!("expected the close second")
        }
        assert!(fifo.pop().is_none());
    }
}
