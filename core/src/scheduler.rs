/*
    WangMux
    https://github.com/wangmux/wangmux

    Copyright 2025 The WangMux Authors

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------

    scheduler.rs

    Single-threaded discrete-event scheduler. Virtual time is counted in
    nanoseconds; timers fire exactly once, in deadline order, with ties
    broken by creation order.

    Callbacks do not capture emulator state. They receive the driven context
    (the MXD card) and the scheduler itself, so a firing timer may mutate the
    card and arm further timers without any shared-ownership gymnastics.
*/

use std::{cmp::Ordering, collections::BinaryHeap};

use fxhash::FxHashSet;

/// Convert microseconds to scheduler (nanosecond) units.
pub const fn timer_us(us: u64) -> u64 {
    us * 1_000
}

/// Convert milliseconds to scheduler (nanosecond) units.
pub const fn timer_ms(ms: u64) -> u64 {
    ms * 1_000_000
}

pub type TimerCallback<C> = Box<dyn FnOnce(&mut C, &mut Scheduler<C>)>;

/// Handle returned by [`Scheduler::create_timer`]. Cancelling a timer that
/// has already fired is a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerHandle {
    id: u64,
}

struct TimerEntry<C> {
    deadline_ns: u64,
    seq: u64,
    id: u64,
    callback: TimerCallback<C>,
}

impl<C> PartialEq for TimerEntry<C> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline_ns == other.deadline_ns && self.seq == other.seq
    }
}

impl<C> Eq for TimerEntry<C> {}

impl<C> PartialOrd for TimerEntry<C> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<C> Ord for TimerEntry<C> {
    // Reversed so that BinaryHeap (a max-heap) pops the earliest deadline;
    // equal deadlines pop in creation order.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline_ns
            .cmp(&self.deadline_ns)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub struct Scheduler<C> {
    now_ns: u64,
    next_seq: u64,
    next_id: u64,
    queue: BinaryHeap<TimerEntry<C>>,
    pending: FxHashSet<u64>,
    cancelled: FxHashSet<u64>,
}

impl<C> Scheduler<C> {
    pub fn new() -> Self {
        Self {
            now_ns: 0,
            next_seq: 0,
            next_id: 0,
            queue: BinaryHeap::new(),
            pending: FxHashSet::default(),
            cancelled: FxHashSet::default(),
        }
    }

    /// Current virtual time in nanoseconds. Monotonic non-decreasing.
    pub fn now_ns(&self) -> u64 {
        self.now_ns
    }

    /// Schedule `callback` to run when virtual time reaches `now + delay_ns`.
    pub fn create_timer<F>(&mut self, delay_ns: u64, callback: F) -> TimerHandle
    where
        F: FnOnce(&mut C, &mut Scheduler<C>) + 'static,
    {
        let id = self.next_id;
        self.next_id += 1;
        let seq = self.next_seq;
        self.next_seq += 1;

        self.pending.insert(id);
        self.queue.push(TimerEntry {
            deadline_ns: self.now_ns + delay_ns,
            seq,
            id,
            callback: Box::new(callback),
        });
        TimerHandle { id }
    }

    /// Cancel a pending timer. No-op if the timer has already fired.
    pub fn cancel_timer(&mut self, handle: &TimerHandle) {
        if self.pending.remove(&handle.id) {
            self.cancelled.insert(handle.id);
        }
    }

    /// Drop cancelled entries sitting at the head of the queue.
    fn discard_cancelled_head(&mut self) {
        while let Some(entry) = self.queue.peek() {
            if self.cancelled.remove(&entry.id) {
                self.queue.pop();
            } else {
                break;
            }
        }
    }

    /// Nanoseconds until the soonest pending deadline, or `None` if the
    /// queue is empty. Zero if a timer is already due.
    pub fn ns_until_next(&mut self) -> Option<u64> {
        self.discard_cancelled_head();
        self.queue
            .peek()
            .map(|entry| entry.deadline_ns.saturating_sub(self.now_ns))
    }

    /// Milliseconds until the soonest pending deadline, rounded up.
    pub fn ms_until_next(&mut self) -> Option<u64> {
        self.ns_until_next().map(|ns| ns.div_ceil(1_000_000))
    }

    pub fn has_pending_timers(&mut self) -> bool {
        self.discard_cancelled_head();
        !self.queue.is_empty()
    }

    /// Advance virtual time by `delta_ns`, firing every timer whose deadline
    /// falls within the interval, in deadline order. Callbacks may create
    /// (and cancel) further timers; a timer created inside a callback with a
    /// small enough delay fires within the same advance.
    pub fn advance(&mut self, delta_ns: u64, ctx: &mut C) {
        let target_ns = self.now_ns + delta_ns;

        loop {
            self.discard_cancelled_head();
            let due = match self.queue.peek() {
                Some(entry) if entry.deadline_ns <= target_ns => true,
                _ => false,
            };
            if !due {
                break;
            }

            let entry = self.queue.pop().unwrap();
            self.pending.remove(&entry.id);
            // No callback ever observes a deadline earlier than the one firing.
            self.now_ns = self.now_ns.max(entry.deadline_ns);
            (entry.callback)(ctx, self);
        }

        self.now_ns = target_ns;
    }
}

impl<C> Default for Scheduler<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_deadline_order() {
        let mut sched: Scheduler<Vec<u32>> = Scheduler::new();
        let mut fired = Vec::new();

        sched.create_timer(300, |log, _| log.push(3));
        sched.create_timer(100, |log, _| log.push(1));
        sched.create_timer(200, |log, _| log.push(2));

        sched.advance(1_000, &mut fired);
        assert_eq!(fired, vec![1, 2, 3]);
        assert_eq!(sched.now_ns(), 1_000);
    }

    #[test]
    fn ties_break_in_creation_order() {
        let mut sched: Scheduler<Vec<u32>> = Scheduler::new();
        let mut fired = Vec::new();

        for n in 0..4 {
            sched.create_timer(500, move |log, _| log.push(n));
        }
        sched.advance(500, &mut fired);
        assert_eq!(fired, vec![0, 1, 2, 3]);
    }

    #[test]
    fn cancelled_timer_does_not_fire() {
        let mut sched: Scheduler<Vec<u32>> = Scheduler::new();
        let mut fired = Vec::new();

        let keep = sched.create_timer(100, |log, _| log.push(1));
        let drop = sched.create_timer(200, |log, _| log.push(2));
        sched.cancel_timer(&drop);

        sched.advance(1_000, &mut fired);
        assert_eq!(fired, vec![1]);

        // Cancelling after the fact is a no-op.
        sched.cancel_timer(&keep);
        assert!(!sched.has_pending_timers());
    }

    #[test]
    fn callback_may_rearm() {
        let mut sched: Scheduler<Vec<u64>> = Scheduler::new();
        let mut fired = Vec::new();

        sched.create_timer(100, |log: &mut Vec<u64>, sched: &mut Scheduler<Vec<u64>>| {
            log.push(sched.now_ns());
            sched.create_timer(50, |log, sched| log.push(sched.now_ns()));
        });

        sched.advance(1_000, &mut fired);
        // The nested timer fires within the same advance, at 150ns.
        assert_eq!(fired, vec![100, 150]);
    }

    #[test]
    fn ms_until_next_rounds_up() {
        let mut sched: Scheduler<()> = Scheduler::new();
        assert_eq!(sched.ms_until_next(), None);

        sched.create_timer(timer_us(1500), |_, _| {});
        assert_eq!(sched.ms_until_next(), Some(2));

        let mut ctx = ();
        sched.advance(timer_us(1500), &mut ctx);
        assert_eq!(sched.ms_until_next(), None);
    }

    #[test]
    fn time_is_monotonic_across_callbacks() {
        let mut sched: Scheduler<Vec<u64>> = Scheduler::new();
        let mut stamps = Vec::new();

        sched.create_timer(10, |log: &mut Vec<u64>, sched: &mut Scheduler<Vec<u64>>| {
            log.push(sched.now_ns())
        });
        sched.create_timer(10, |log: &mut Vec<u64>, sched: &mut Scheduler<Vec<u64>>| {
            log.push(sched.now_ns())
        });
        sched.create_timer(5, |log: &mut Vec<u64>, sched: &mut Scheduler<Vec<u64>>| {
            log.push(sched.now_ns())
        });

        sched.advance(20, &mut stamps);
        assert_eq!(stamps, vec![5, 10, 10]);
    }
}
