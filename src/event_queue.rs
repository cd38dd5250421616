/* Copyright © 2018 Gianmarco Garrisi

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU General Public License for more details.

You should have received a copy of the GNU General Public License
along with this program.  If not, see <http://www.gnu.org/licenses/>. */

//! The min-heap that defines the total order of the simulated timeline.
//!
//! Orders entries by `(time, priority, seq)` so that ties are broken
//! deterministically by push order rather than by heap internals.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::error::{SimError, ValidationError};
use crate::process::ProcessId;

/// Opaque handle returned by [`EventQueue::push`], usable to [`EventQueue::cancel`]
/// a still-pending event.
pub type EventId = u64;

pub(crate) type Callback = Box<dyn FnOnce(&mut crate::scheduler::Simulation) + Send>;

/// A single scheduled callback, ordered by `(time, priority, seq)`.
pub(crate) struct ScheduledEvent {
    pub id: EventId,
    pub time: f64,
    pub priority: i64,
    pub seq: u64,
    pub callback: Callback,
    /// The process this event will resume, if any; used only for tracing.
    pub owner: Option<ProcessId>,
}

impl PartialEq for ScheduledEvent {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}
impl Eq for ScheduledEvent {}

impl ScheduledEvent {
    fn key(&self) -> (f64, i64, u64) {
        (self.time, self.priority, self.seq)
    }
}

impl PartialOrd for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the least (time, priority, seq)
        // triple pops first.
        match self.time.partial_cmp(&other.time) {
            Some(Ordering::Equal) | None => {}
            Some(o) => return o.reverse(),
        }
        match self.priority.cmp(&other.priority) {
            Ordering::Equal => {}
            o => return o.reverse(),
        }
        self.seq.cmp(&other.seq).reverse()
    }
}

/// Public, read-only view of a dispatched event, kept in the processed-events
/// log for debugging and the `trace:event` observer channel.
#[derive(Debug, Clone, Copy)]
pub struct DispatchedEvent {
    pub id: EventId,
    pub time: f64,
    pub priority: i64,
    pub seq: u64,
}

/// Binary min-heap of `(time, priority, seq, callback)`.
pub(crate) struct EventQueue {
    heap: BinaryHeap<ScheduledEvent>,
    next_id: EventId,
    next_seq: u64,
    cancelled: std::collections::HashSet<EventId>,
}

impl EventQueue {
    pub fn new() -> Self {
        EventQueue {
            heap: BinaryHeap::new(),
            next_id: 0,
            next_seq: 0,
            cancelled: std::collections::HashSet::new(),
        }
    }

    /// O(log n). Assigns a fresh `seq` and opaque id.
    pub fn push(
        &mut self,
        time: f64,
        priority: i64,
        owner: Option<ProcessId>,
        callback: Callback,
    ) -> Result<EventId, SimError> {
        if time.is_nan() || time.is_infinite() {
            return Err(SimError::Validation(
                ValidationError::with("event time must be finite", "time", time),
            ));
        }
        let id = self.next_id;
        self.next_id += 1;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(ScheduledEvent {
            id,
            time,
            priority,
            seq,
            callback,
            owner,
        });
        Ok(id)
    }

    /// O(log n). Removes and returns the least element, skipping tombstoned
    /// (cancelled) entries lazily.
    pub fn pop(&mut self) -> Option<ScheduledEvent> {
        loop {
            let ev = self.heap.pop()?;
            if self.cancelled.remove(&ev.id) {
                continue;
            }
            return Some(ev);
        }
    }

    /// O(1) amortized; may still be sitting behind tombstoned entries.
    pub fn peek_time(&self) -> Option<f64> {
        self.heap
            .iter()
            .filter(|e| !self.cancelled.contains(&e.id))
            .map(|e| e.time)
            .fold(None, |acc, t| match acc {
                None => Some(t),
                Some(a) if t < a => Some(t),
                Some(a) => Some(a),
            })
    }

    /// Marks `id` as cancelled. Returns `true` if `id` was a live, still
    /// pending event. Uses a lazy tombstone set rather than an eager
    /// re-heapify, so cancellation is O(1) and `pop`/`peek_time` simply
    /// skip tombstoned entries as they're encountered.
    pub fn cancel(&mut self, id: EventId) -> bool {
        if self.cancelled.contains(&id) {
            return false;
        }
        let present = self.heap.iter().any(|e| e.id == id);
        if present {
            self.cancelled.insert(id);
        }
        present
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.cancelled.clear();
    }

    pub fn len(&self) -> usize {
        self.heap.len() - self.cancelled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn push(q: &mut EventQueue, time: f64, priority: i64) -> EventId {
        q.push(time, priority, None, Box::new(|_| {})).unwrap()
    }

    #[test]
    fn pops_in_time_then_priority_then_seq_order() {
        let mut q = EventQueue::new();
        push(&mut q, 5.0, 0);
        push(&mut q, 1.0, 0);
        push(&mut q, 1.0, -1);
        push(&mut q, 1.0, -1);
        let mut order = Vec::new();
        while let Some(ev) = q.pop() {
            order.push((ev.time, ev.priority));
        }
        assert_eq!(order, vec![(1.0, -1), (1.0, -1), (1.0, 0), (5.0, 0)]);
    }

    #[test]
    fn cancel_removes_without_disturbing_order() {
        let mut q = EventQueue::new();
        let a = push(&mut q, 1.0, 0);
        push(&mut q, 2.0, 0);
        assert!(q.cancel(a));
        assert!(!q.cancel(a));
        assert_eq!(q.pop().unwrap().time, 2.0);
        assert!(q.pop().is_none());
    }

    #[test]
    fn rejects_non_finite_time() {
        let mut q = EventQueue::new();
        assert!(q.push(f64::NAN, 0, None, Box::new(|_| {})).is_err());
        assert!(q.push(f64::INFINITY, 0, None, Box::new(|_| {})).is_err());
    }

    #[test]
    fn len_excludes_cancelled_entries() {
        let mut q = EventQueue::new();
        let a = push(&mut q, 1.0, 0);
        push(&mut q, 2.0, 0);
        assert_eq!(q.len(), 2);
        q.cancel(a);
        assert_eq!(q.len(), 1);
    }

    proptest::proptest! {
        /// For any push history, the pop order is a total, deterministic
        /// function of `(time, priority, seq)` — popping the whole queue
        /// yields a lexicographically non-decreasing sequence of keys, and
        /// `seq` (push order) is what breaks ties at equal `(time, priority)`.
        #[test]
        fn pop_order_is_sorted_by_time_priority_seq(
            entries in proptest::collection::vec(
                (0.0f64..1000.0, -10i64..10i64), 0..64,
            )
        ) {
            let mut q = EventQueue::new();
            let mut pushed = Vec::new();
            for (i, (time, priority)) in entries.iter().enumerate() {
                push(&mut q, *time, *priority);
                pushed.push((*time, *priority, i as u64));
            }
            let mut popped = Vec::new();
            while let Some(ev) = q.pop() {
                popped.push((ev.time, ev.priority, ev.seq));
            }
            let mut expected = pushed.clone();
            expected.sort_by(|a, b| {
                a.0.partial_cmp(&b.0).unwrap()
                    .then(a.1.cmp(&b.1))
                    .then(a.2.cmp(&b.2))
            });
            prop_assert_eq!(popped, expected);
        }

        /// Cancelling any subset of pushed events removes exactly those from
        /// the pop sequence and leaves the rest in their original relative
        /// order.
        #[test]
        fn cancelling_a_subset_removes_exactly_that_subset(
            times in proptest::collection::vec(0.0f64..100.0, 1..32),
            cancel_mask in proptest::collection::vec(any::<bool>(), 1..32),
        ) {
            let mut q = EventQueue::new();
            let n = times.len();
            let ids: Vec<EventId> = times.iter().map(|t| push(&mut q, *t, 0)).collect();
            let mut survivors = Vec::new();
            for i in 0..n {
                let cancel = cancel_mask.get(i).copied().unwrap_or(false);
                if cancel {
                    prop_assert!(q.cancel(ids[i]));
                } else {
                    survivors.push(times[i]);
                }
            }
            let mut popped = Vec::new();
            while let Some(ev) = q.pop() {
                popped.push(ev.time);
            }
            survivors.sort_by(|a, b| a.partial_cmp(b).unwrap());
            prop_assert_eq!(popped, survivors);
        }
    }
}
