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

//! Typed item store: capacity-limited, FIFO among items, with a filtered
//! `get`. Generic over the stored item type via type erasure — each
//! `Store<T>` handle is an index into `Simulation::stores`, and the actual
//! `StoreState<T>` lives behind `Box<dyn Any + Send>`, downcast on access.

use std::any::Any;
use std::collections::VecDeque;
use std::marker::PhantomData;

use crate::error::{SimError, ValidationError};
use crate::process::{AskResult, ProcHandle, ProcessId, Suspension};
use crate::scheduler::Simulation;

type Filter<T> = Box<dyn Fn(&T) -> bool + Send>;

struct PutWaiter<T> {
    pid: ProcessId,
    item: T,
    request_time: f64,
    susp: Suspension<()>,
}

struct GetWaiter<T> {
    pid: ProcessId,
    filter: Option<Filter<T>>,
    request_time: f64,
    susp: Suspension<T>,
}

struct StoreState<T> {
    capacity: usize,
    items: VecDeque<T>,
    put_queue: VecDeque<PutWaiter<T>>,
    get_queue: VecDeque<GetWaiter<T>>,
    total_puts: u64,
    total_gets: u64,
    total_put_wait_time: f64,
    total_get_wait_time: f64,
}

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub name: Option<String>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions { name: None }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StoreSnapshot {
    pub capacity: usize,
    pub size: usize,
    pub put_queue_length: usize,
    pub get_queue_length: usize,
    pub total_puts: u64,
    pub total_gets: u64,
    pub total_put_wait_time: f64,
    pub total_get_wait_time: f64,
}

pub struct Store<T> {
    pub(crate) id: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Store<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Store<T> {}

impl Simulation {
    pub fn create_store<T: Send + 'static>(&mut self, capacity: usize, _options: StoreOptions) -> Result<Store<T>, SimError> {
        if capacity < 1 {
            return Err(SimError::Validation(ValidationError::with(
                "store capacity must be >= 1",
                "capacity",
                capacity,
            )));
        }
        let id = self.stores.len();
        let state: StoreState<T> = StoreState {
            capacity,
            items: VecDeque::new(),
            put_queue: VecDeque::new(),
            get_queue: VecDeque::new(),
            total_puts: 0,
            total_gets: 0,
            total_put_wait_time: 0.0,
            total_get_wait_time: 0.0,
        };
        self.stores.push(Box::new(state));
        Ok(Store { id, _marker: PhantomData })
    }

    pub fn store_snapshot<T: Send + 'static>(&self, s: Store<T>) -> StoreSnapshot {
        let state = downcast_ref::<T>(&self.stores[s.id]);
        StoreSnapshot {
            capacity: state.capacity,
            size: state.items.len(),
            put_queue_length: state.put_queue.len(),
            get_queue_length: state.get_queue.len(),
            total_puts: state.total_puts,
            total_gets: state.total_gets,
            total_put_wait_time: state.total_put_wait_time,
            total_get_wait_time: state.total_get_wait_time,
        }
    }
}

fn downcast_ref<T: Send + 'static>(b: &Box<dyn Any + Send>) -> &StoreState<T> {
    b.downcast_ref::<StoreState<T>>().expect("store handle used against wrong store slot")
}

fn downcast_mut<T: Send + 'static>(b: &mut Box<dyn Any + Send>) -> &mut StoreState<T> {
    b.downcast_mut::<StoreState<T>>().expect("store handle used against wrong store slot")
}

impl ProcHandle {
    /// `StorePut{store, item}`. *ValidationError* semantics for a "null"
    /// item don't translate to owned Rust values; any `T` is accepted.
    pub fn store_put<T: Send + 'static>(&self, store: Store<T>, item: T) -> Result<(), SimError> {
        self.perform(move |pid, respond| Box::new(move |sim: &mut Simulation| do_put(sim, store, pid, item, respond)))
    }

    /// `StoreGet{store, filter?}`. Without a filter, retrieves the oldest
    /// item.
    pub fn store_get<T: Send + 'static>(&self, store: Store<T>) -> Result<T, SimError> {
        self.perform(move |pid, respond| Box::new(move |sim: &mut Simulation| do_get(sim, store, pid, None, respond)))
    }

    pub fn store_get_filtered<T: Send + 'static>(
        &self,
        store: Store<T>,
        filter: impl Fn(&T) -> bool + Send + 'static,
    ) -> Result<T, SimError> {
        self.perform(move |pid, respond| {
            Box::new(move |sim: &mut Simulation| do_get(sim, store, pid, Some(Box::new(filter)), respond))
        })
    }
}

fn record_stats<T: Send + 'static>(sim: &mut Simulation, s: Store<T>) {
    let (size, put_len, get_len) = {
        let state = downcast_ref::<T>(&sim.stores[s.id]);
        (state.items.len() as f64, state.put_queue.len() as f64, state.get_queue.len() as f64)
    };
    let now = sim.time();
    sim.stats.record(&format!("store:{}:size", s.id), size, now);
    sim.stats.record(&format!("store:{}:put_queue_length", s.id), put_len, now);
    sim.stats.record(&format!("store:{}:get_queue_length", s.id), get_len, now);
}

fn do_put<T: Send + 'static>(
    sim: &mut Simulation,
    s: Store<T>,
    pid: ProcessId,
    item: T,
    respond: Box<dyn FnOnce(Result<(), SimError>) + Send>,
) -> AskResult {
    let has_room = {
        let state = downcast_ref::<T>(&sim.stores[s.id]);
        state.items.len() < state.capacity
    };
    if has_room {
        {
            let state = downcast_mut::<T>(&mut sim.stores[s.id]);
            state.items.push_back(item);
            state.total_puts += 1;
        }
        record_stats(sim, s);
        respond(Ok(()));
        try_fulfill_gets(sim, s);
        AskResult::ResolvedNow
    } else {
        let susp = Suspension::new(respond);
        sim.set_current_cancel(pid, susp.cancel_handle(pid));
        let now = sim.time();
        let state = downcast_mut::<T>(&mut sim.stores[s.id]);
        state.put_queue.push_back(PutWaiter { pid, item, request_time: now, susp });
        record_stats(sim, s);
        AskResult::Suspended
    }
}

fn do_get<T: Send + 'static>(
    sim: &mut Simulation,
    s: Store<T>,
    pid: ProcessId,
    filter: Option<Filter<T>>,
    respond: Box<dyn FnOnce(Result<T, SimError>) + Send>,
) -> AskResult {
    let found_idx = {
        let state = downcast_ref::<T>(&sim.stores[s.id]);
        match &filter {
            Some(f) => state.items.iter().position(|it| f(it)),
            None => {
                if state.items.is_empty() {
                    None
                } else {
                    Some(0)
                }
            }
        }
    };
    match found_idx {
        Some(idx) => {
            let item = {
                let state = downcast_mut::<T>(&mut sim.stores[s.id]);
                let item = state.items.remove(idx).expect("index came from this deque");
                state.total_gets += 1;
                item
            };
            record_stats(sim, s);
            respond(Ok(item));
            try_fulfill_puts(sim, s);
            AskResult::ResolvedNow
        }
        None => {
            let susp = Suspension::new(respond);
            sim.set_current_cancel(pid, susp.cancel_handle(pid));
            let now = sim.time();
            let state = downcast_mut::<T>(&mut sim.stores[s.id]);
            state.get_queue.push_back(GetWaiter { pid, filter, request_time: now, susp });
            record_stats(sim, s);
            AskResult::Suspended
        }
    }
}

/// Scans the get queue in push order; for each waiter, searches items with
/// its filter. A match is popped and resolved at delay 0; a non-matching
/// waiter does not block scanning of waiters *after* it — an earlier
/// waiter whose filter doesn't match anything present can be skipped over
/// by a later waiter whose filter does. This is intentional: the ordering
/// guarantee is FIFO over *matching opportunities*, not strict arrival
/// order regardless of filter.
///
/// A waiter whose process was interrupted while queued (its suspension
/// already claimed) is removed at its cursor position the moment it's
/// seen, without consuming an item and without advancing the cursor — the
/// deque shifted under it, so the same cursor index now holds the next
/// waiter.
fn try_fulfill_gets<T: Send + 'static>(sim: &mut Simulation, s: Store<T>) {
    let mut cursor = 0usize;
    loop {
        enum Outcome {
            Dead,
            NoMatch,
            Match(usize),
        }
        let outcome = {
            let state = downcast_mut::<T>(&mut sim.stores[s.id]);
            if cursor >= state.get_queue.len() {
                return;
            }
            let waiter = &state.get_queue[cursor];
            if !waiter.susp.is_pending() {
                Outcome::Dead
            } else {
                let item_idx = match &waiter.filter {
                    Some(f) => state.items.iter().position(|it| f(it)),
                    None => {
                        if state.items.is_empty() {
                            None
                        } else {
                            Some(0)
                        }
                    }
                };
                match item_idx {
                    Some(idx) => Outcome::Match(idx),
                    None => Outcome::NoMatch,
                }
            }
        };
        let item_idx = match outcome {
            Outcome::Dead => {
                let state = downcast_mut::<T>(&mut sim.stores[s.id]);
                state.get_queue.remove(cursor);
                continue;
            }
            Outcome::NoMatch => {
                cursor += 1;
                continue;
            }
            Outcome::Match(idx) => idx,
        };
        let (pid, susp, item) = {
            let state = downcast_mut::<T>(&mut sim.stores[s.id]);
            let waiter = state.get_queue.remove(cursor).expect("index from this deque");
            let item = state.items.remove(item_idx).expect("index from this deque");
            state.total_gets += 1;
            let now_for_wait = waiter.request_time;
            (waiter.pid, waiter.susp, (item, now_for_wait))
        };
        let (item, request_time) = item;
        let now = sim.time();
        {
            let state = downcast_mut::<T>(&mut sim.stores[s.id]);
            state.total_get_wait_time += now - request_time;
        }
        record_stats(sim, s);
        let _ = sim.schedule_internal(0.0, 0, Some(pid), move |sim| {
            crate::process::resolve(sim, pid, &susp, Ok(item));
        });
        // A waiter was removed, so re-scan from the same cursor position.
    }
}

/// While there is space, pop the head of `put_queue`, append its item, and
/// resolve its resumption at delay 0; each fulfilled put also retries
/// `try_fulfill_gets` since it may unblock a waiting get. A head waiter
/// whose process was interrupted while queued is dropped without
/// consuming capacity.
fn try_fulfill_puts<T: Send + 'static>(sim: &mut Simulation, s: Store<T>) {
    loop {
        let head_pending = {
            let state = downcast_ref::<T>(&sim.stores[s.id]);
            state.put_queue.front().map(|w| w.susp.is_pending())
        };
        match head_pending {
            None => return,
            Some(false) => {
                let state = downcast_mut::<T>(&mut sim.stores[s.id]);
                state.put_queue.pop_front();
                continue;
            }
            Some(true) => {}
        }
        let has_room = {
            let state = downcast_ref::<T>(&sim.stores[s.id]);
            state.items.len() < state.capacity
        };
        if !has_room {
            return;
        }
        let (pid, susp, item, request_time) = {
            let state = downcast_mut::<T>(&mut sim.stores[s.id]);
            let waiter = state.put_queue.pop_front().unwrap();
            (waiter.pid, waiter.susp, waiter.item, waiter.request_time)
        };
        {
            let state = downcast_mut::<T>(&mut sim.stores[s.id]);
            state.items.push_back(item);
            state.total_puts += 1;
        }
        let now = sim.time();
        {
            let state = downcast_mut::<T>(&mut sim.stores[s.id]);
            state.total_put_wait_time += now - request_time;
        }
        record_stats(sim, s);
        let _ = sim.schedule_internal(0.0, 0, Some(pid), move |sim| {
            crate::process::resolve(sim, pid, &susp, Ok(()));
        });
        try_fulfill_gets(sim, s);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::SimulationOptions;

    #[derive(Clone, Debug, PartialEq)]
    struct Parcel {
        id: &'static str,
        dest: &'static str,
    }

    #[test]
    fn filtered_get_retrieves_in_fifo_order_among_matches() {
        let mut sim = Simulation::new(SimulationOptions::default());
        let store: Store<Parcel> = sim.create_store(100, StoreOptions::default()).unwrap();
        sim.process(move |h| {
            h.store_put(store, Parcel { id: "P1", dest: "NYC" })?;
            h.store_put(store, Parcel { id: "P2", dest: "LA" })?;
            h.store_put(store, Parcel { id: "P3", dest: "NYC" })?;
            Ok(())
        });
        let retrieved = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        for _ in 0..2 {
            let retrieved = retrieved.clone();
            sim.process(move |h| {
                h.timeout(2.0)?;
                let p = h.store_get_filtered(store, |p: &Parcel| p.dest == "NYC")?;
                retrieved.lock().unwrap().push(p.id);
                Ok(())
            });
        }
        sim.run(None).unwrap();
        let got = retrieved.lock().unwrap().clone();
        assert_eq!(got, vec!["P1", "P3"]);
        assert_eq!(sim.store_snapshot(store).size, 1);
    }

    #[test]
    fn unfiltered_get_returns_oldest_item_fifo() {
        let mut sim = Simulation::new(SimulationOptions::default());
        let store: Store<i32> = sim.create_store(10, StoreOptions::default()).unwrap();
        sim.process(move |h| {
            h.store_put(store, 1)?;
            h.store_put(store, 2)?;
            h.store_put(store, 3)?;
            Ok(())
        });
        let order = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let order2 = order.clone();
        sim.process(move |h| {
            for _ in 0..3 {
                let v = h.store_get(store)?;
                order2.lock().unwrap().push(v);
            }
            Ok(())
        });
        sim.run(None).unwrap();
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn put_blocks_when_full_and_resumes_on_space() {
        let mut sim = Simulation::new(SimulationOptions::default());
        let store: Store<i32> = sim.create_store(1, StoreOptions::default()).unwrap();
        let put_completed_at = std::sync::Arc::new(std::sync::Mutex::new(None));
        let put_completed_at2 = put_completed_at.clone();
        sim.process(move |h| {
            h.store_put(store, 1)?;
            h.store_put(store, 2)?;
            *put_completed_at2.lock().unwrap() = Some(h.time()?);
            Ok(())
        });
        sim.process(move |h| {
            h.timeout(3.0)?;
            h.store_get(store)?;
            Ok(())
        });
        sim.run(None).unwrap();
        assert_eq!(*put_completed_at.lock().unwrap(), Some(3.0));
    }
}
