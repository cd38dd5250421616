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

//! Queue discipline polymorphism shared by [`crate::resource::Resource`] and
//! [`crate::buffer::Buffer`]. A tagged enum rather than inheritance/trait
//! objects: insertion is a branch per kind.

/// Tie-breaker used among entries of equal priority in a [`Discipline::Priority`]
/// queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tie {
    Fifo,
    Lifo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discipline {
    Fifo,
    Lifo,
    Priority(Tie),
}

impl Default for Discipline {
    fn default() -> Self {
        Discipline::Fifo
    }
}

/// Inserts `entry` into `queue` according to `discipline`, where `priority_of`
/// extracts the comparison key (lower value = higher priority) and `seq_of`
/// is the insertion-order tiebreaker recorded at enqueue time.
pub(crate) fn insert_by_discipline<T>(
    queue: &mut std::collections::VecDeque<T>,
    entry: T,
    discipline: Discipline,
    priority_of: impl Fn(&T) -> i64,
    seq_of: impl Fn(&T) -> u64,
) {
    match discipline {
        Discipline::Fifo => queue.push_back(entry),
        Discipline::Lifo => queue.push_front(entry),
        Discipline::Priority(tie) => {
            let p = priority_of(&entry);
            let s = seq_of(&entry);
            let pos = queue.iter().position(|existing| {
                let ep = priority_of(existing);
                if ep != p {
                    p < ep
                } else {
                    match tie {
                        Tie::Fifo => s < seq_of(existing),
                        Tie::Lifo => s > seq_of(existing),
                    }
                }
            });
            match pos {
                Some(idx) => queue.insert(idx, entry),
                None => queue.push_back(entry),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;

    #[test]
    fn priority_insertion_orders_by_priority_then_fifo() {
        let mut q: VecDeque<(i64, u64)> = VecDeque::new();
        let entries = [(5, 0), (1, 1), (3, 2), (1, 3)];
        for e in entries {
            insert_by_discipline(&mut q, e, Discipline::Priority(Tie::Fifo), |e| e.0, |e| e.1);
        }
        assert_eq!(Vec::from(q), vec![(1, 1), (1, 3), (3, 2), (5, 0)]);
    }

    #[test]
    fn lifo_prepends() {
        let mut q: VecDeque<i32> = VecDeque::new();
        insert_by_discipline(&mut q, 1, Discipline::Lifo, |_| 0, |_| 0);
        insert_by_discipline(&mut q, 2, Discipline::Lifo, |_| 0, |_| 0);
        assert_eq!(Vec::from(q), vec![2, 1]);
    }

    proptest::proptest! {
        /// Whatever order `(priority, seq)` pairs are inserted in, a
        /// `Priority(Fifo)` queue always ends up sorted by priority
        /// ascending, with equal-priority entries in push order.
        #[test]
        fn priority_fifo_queue_is_always_sorted_after_arbitrary_insertions(
            priorities in proptest::collection::vec(-5i64..5i64, 0..64)
        ) {
            let mut q: VecDeque<(i64, u64)> = VecDeque::new();
            for (seq, p) in priorities.iter().enumerate() {
                insert_by_discipline(&mut q, (*p, seq as u64), Discipline::Priority(Tie::Fifo), |e| e.0, |e| e.1);
            }
            let got: Vec<(i64, u64)> = q.into_iter().collect();
            let mut expected = got.clone();
            expected.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
            prop_assert_eq!(got, expected);
        }
    }
}
