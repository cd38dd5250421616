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

//! Quantity buffer: a numeric level in `[0, capacity]`. `put`/`get` block
//! on space/tokens and run their own try-fulfill loops on every mutation.

use std::collections::VecDeque;

use crate::discipline::{insert_by_discipline, Discipline};
use crate::error::{SimError, ValidationError};
use crate::process::{AskResult, ProcHandle, ProcessId, Suspension};
use crate::scheduler::Simulation;

type Respond = Box<dyn FnOnce(Result<(), SimError>) + Send>;

struct Waiter {
    pid: ProcessId,
    amount: f64,
    priority: i64,
    seq: u64,
    request_time: f64,
    susp: Suspension<()>,
}

#[derive(Debug, Clone)]
pub struct BufferOptions {
    pub name: Option<String>,
    pub initial_level: f64,
    pub put_discipline: Discipline,
    pub get_discipline: Discipline,
}

impl Default for BufferOptions {
    fn default() -> Self {
        BufferOptions {
            name: None,
            initial_level: 0.0,
            put_discipline: Discipline::Fifo,
            get_discipline: Discipline::Fifo,
        }
    }
}

pub(crate) struct BufferInner {
    pub capacity: f64,
    pub level: f64,
    pub put_discipline: Discipline,
    pub get_discipline: Discipline,
    #[allow(dead_code)]
    pub name: Option<String>,
    put_queue: VecDeque<Waiter>,
    get_queue: VecDeque<Waiter>,
    next_seq: u64,
    pub total_puts: u64,
    pub total_gets: u64,
    pub total_amount_put: f64,
    pub total_amount_got: f64,
    pub total_put_wait_time: f64,
    pub total_get_wait_time: f64,
    initial_level: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct BufferSnapshot {
    pub capacity: f64,
    pub level: f64,
    pub put_queue_length: usize,
    pub get_queue_length: usize,
    pub total_puts: u64,
    pub total_gets: u64,
    pub total_amount_put: f64,
    pub total_amount_got: f64,
    pub total_put_wait_time: f64,
    pub total_get_wait_time: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Buffer {
    pub(crate) id: usize,
}

impl Simulation {
    pub fn create_buffer(&mut self, capacity: f64, options: BufferOptions) -> Result<Buffer, SimError> {
        if !(capacity > 0.0) || !capacity.is_finite() {
            return Err(SimError::Validation(ValidationError::with(
                "buffer capacity must be finite and > 0",
                "capacity",
                capacity,
            )));
        }
        if options.initial_level < 0.0 || options.initial_level > capacity {
            return Err(SimError::Validation(ValidationError::with(
                "initial_level must be within [0, capacity]",
                "initial_level",
                options.initial_level,
            )));
        }
        let id = self.buffers.len();
        self.buffers.push(BufferInner {
            capacity,
            level: options.initial_level,
            put_discipline: options.put_discipline,
            get_discipline: options.get_discipline,
            name: options.name,
            put_queue: VecDeque::new(),
            get_queue: VecDeque::new(),
            next_seq: 0,
            total_puts: 0,
            total_gets: 0,
            total_amount_put: 0.0,
            total_amount_got: 0.0,
            total_put_wait_time: 0.0,
            total_get_wait_time: 0.0,
            initial_level: options.initial_level,
        });
        Ok(Buffer { id })
    }

    pub fn buffer_snapshot(&self, b: Buffer) -> BufferSnapshot {
        let buf = &self.buffers[b.id];
        BufferSnapshot {
            capacity: buf.capacity,
            level: buf.level,
            put_queue_length: buf.put_queue.len(),
            get_queue_length: buf.get_queue.len(),
            total_puts: buf.total_puts,
            total_gets: buf.total_gets,
            total_amount_put: buf.total_amount_put,
            total_amount_got: buf.total_amount_got,
            total_put_wait_time: buf.total_put_wait_time,
            total_get_wait_time: buf.total_get_wait_time,
        }
    }

    /// `initial_level + fulfilled puts - fulfilled gets`, independent of the
    /// live `level` field — used by conservation tests.
    pub fn buffer_conserved_level(&self, b: Buffer) -> f64 {
        let buf = &self.buffers[b.id];
        buf.initial_level + buf.total_amount_put - buf.total_amount_got
    }
}

impl ProcHandle {
    /// `BufferPut{buffer, amount, priority}`.
    pub fn put(&self, buffer: Buffer, amount: f64, priority: i64) -> Result<(), SimError> {
        if !(amount > 0.0) || !amount.is_finite() {
            return Err(SimError::validation("put amount must be finite and > 0"));
        }
        self.perform(move |pid, respond| Box::new(move |sim: &mut Simulation| do_put(sim, buffer, pid, amount, priority, respond)))
    }

    /// `BufferGet{buffer, amount, priority}`.
    pub fn get(&self, buffer: Buffer, amount: f64, priority: i64) -> Result<(), SimError> {
        if !(amount > 0.0) || !amount.is_finite() {
            return Err(SimError::validation("get amount must be finite and > 0"));
        }
        self.perform(move |pid, respond| Box::new(move |sim: &mut Simulation| do_get(sim, buffer, pid, amount, priority, respond)))
    }
}

fn record_stats(sim: &mut Simulation, b: Buffer) {
    let (level, put_len, get_len) = {
        let buf = &sim.buffers[b.id];
        (buf.level, buf.put_queue.len() as f64, buf.get_queue.len() as f64)
    };
    let now = sim.time();
    sim.stats.record(&format!("buffer:{}:level", b.id), level, now);
    sim.stats.record(&format!("buffer:{}:put_queue_length", b.id), put_len, now);
    sim.stats.record(&format!("buffer:{}:get_queue_length", b.id), get_len, now);
}

fn do_put(sim: &mut Simulation, b: Buffer, pid: ProcessId, amount: f64, priority: i64, respond: Respond) -> AskResult {
    if amount > sim.buffers[b.id].capacity {
        respond(Err(SimError::validation("put amount exceeds buffer capacity")));
        return AskResult::ResolvedNow;
    }
    let (level, capacity) = {
        let buf = &sim.buffers[b.id];
        (buf.level, buf.capacity)
    };
    if level + amount <= capacity {
        sim.buffers[b.id].level += amount;
        sim.buffers[b.id].total_puts += 1;
        sim.buffers[b.id].total_amount_put += amount;
        record_stats(sim, b);
        respond(Ok(()));
        try_fulfill_gets(sim, b);
        AskResult::ResolvedNow
    } else {
        let susp = Suspension::new(respond);
        sim.set_current_cancel(pid, susp.cancel_handle(pid));
        let now = sim.time();
        let discipline = sim.buffers[b.id].put_discipline;
        let buf = &mut sim.buffers[b.id];
        let seq = buf.next_seq;
        buf.next_seq += 1;
        let waiter = Waiter { pid, amount, priority, seq, request_time: now, susp };
        insert_by_discipline(&mut buf.put_queue, waiter, discipline, |w| w.priority, |w| w.seq);
        record_stats(sim, b);
        AskResult::Suspended
    }
}

fn do_get(sim: &mut Simulation, b: Buffer, pid: ProcessId, amount: f64, priority: i64, respond: Respond) -> AskResult {
    let level = sim.buffers[b.id].level;
    if level >= amount {
        sim.buffers[b.id].level -= amount;
        sim.buffers[b.id].total_gets += 1;
        sim.buffers[b.id].total_amount_got += amount;
        record_stats(sim, b);
        respond(Ok(()));
        try_fulfill_puts(sim, b);
        AskResult::ResolvedNow
    } else {
        let susp = Suspension::new(respond);
        sim.set_current_cancel(pid, susp.cancel_handle(pid));
        let now = sim.time();
        let discipline = sim.buffers[b.id].get_discipline;
        let buf = &mut sim.buffers[b.id];
        let seq = buf.next_seq;
        buf.next_seq += 1;
        let waiter = Waiter { pid, amount, priority, seq, request_time: now, susp };
        insert_by_discipline(&mut buf.get_queue, waiter, discipline, |w| w.priority, |w| w.seq);
        record_stats(sim, b);
        AskResult::Suspended
    }
}

/// While the head of `get_queue` can be served from the current level, pop
/// it, drain its amount, and schedule its resumption at delay 0. Stops on
/// the first *live* request it cannot serve, preserving discipline order.
/// A head waiter whose process was interrupted while queued (its
/// suspension already claimed) is dropped unconditionally rather than
/// treated as blocking — it is dead demand, not a live one the discipline
/// needs to preserve the order of.
fn try_fulfill_gets(sim: &mut Simulation, b: Buffer) {
    loop {
        let level = sim.buffers[b.id].level;
        let head = sim.buffers[b.id].get_queue.front().map(|w| (w.susp.is_pending(), w.amount));
        match head {
            None => return,
            Some((false, _)) => {
                sim.buffers[b.id].get_queue.pop_front();
                continue;
            }
            Some((true, amount)) if amount > level => return,
            Some((true, amount)) => {
                let waiter = sim.buffers[b.id].get_queue.pop_front().unwrap();
                sim.buffers[b.id].level -= amount;
                sim.buffers[b.id].total_gets += 1;
                sim.buffers[b.id].total_amount_got += amount;
                let now = sim.time();
                sim.buffers[b.id].total_get_wait_time += now - waiter.request_time;
                record_stats(sim, b);
                let pid = waiter.pid;
                let susp = waiter.susp;
                let _ = sim.schedule_internal(0.0, 0, Some(pid), move |sim| {
                    crate::process::resolve(sim, pid, &susp, Ok(()));
                });
            }
        }
    }
}

/// Symmetric on `put_queue`; after each fulfilled put, retries
/// `try_fulfill_gets` since a put may unblock waiting gets. Dead waiters at
/// the head are dropped the same way `try_fulfill_gets` drops them.
fn try_fulfill_puts(sim: &mut Simulation, b: Buffer) {
    loop {
        let (level, capacity) = {
            let buf = &sim.buffers[b.id];
            (buf.level, buf.capacity)
        };
        let head = sim.buffers[b.id].put_queue.front().map(|w| (w.susp.is_pending(), w.amount));
        match head {
            None => return,
            Some((false, _)) => {
                sim.buffers[b.id].put_queue.pop_front();
                continue;
            }
            Some((true, amount)) if level + amount > capacity => return,
            Some((true, amount)) => {
                let waiter = sim.buffers[b.id].put_queue.pop_front().unwrap();
                sim.buffers[b.id].level += amount;
                sim.buffers[b.id].total_puts += 1;
                sim.buffers[b.id].total_amount_put += amount;
                let now = sim.time();
                sim.buffers[b.id].total_put_wait_time += now - waiter.request_time;
                record_stats(sim, b);
                let pid = waiter.pid;
                let susp = waiter.susp;
                let _ = sim.schedule_internal(0.0, 0, Some(pid), move |sim| {
                    crate::process::resolve(sim, pid, &susp, Ok(()));
                });
                try_fulfill_gets(sim, b);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::SimulationOptions;

    #[test]
    fn producer_consumer_conserves_level() {
        let mut sim = Simulation::new(SimulationOptions::default());
        let buf = sim.create_buffer(100.0, BufferOptions { initial_level: 50.0, ..Default::default() }).unwrap();
        sim.process(move |h| {
            for _ in 0..5 {
                h.put(buf, 10.0, 0)?;
                h.timeout(2.0)?;
            }
            Ok(())
        });
        sim.process(move |h| {
            for _ in 0..5 {
                h.get(buf, 10.0, 0)?;
                h.timeout(3.0)?;
            }
            Ok(())
        });
        sim.run(Some(20.0)).unwrap();
        let snap = sim.buffer_snapshot(buf);
        assert_eq!(snap.level, 50.0);
        assert_eq!(snap.total_puts, 5);
        assert_eq!(snap.total_gets, 5);
        assert_eq!(sim.buffer_conserved_level(buf), 50.0);
    }

    #[test]
    fn put_amount_exceeding_capacity_is_rejected() {
        let mut sim = Simulation::new(SimulationOptions::default());
        let buf = sim.create_buffer(10.0, BufferOptions::default()).unwrap();
        let saw_err = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let saw_err2 = saw_err.clone();
        sim.process(move |h| {
            if h.put(buf, 20.0, 0).is_err() {
                saw_err2.store(true, std::sync::atomic::Ordering::SeqCst);
            }
            Ok(())
        });
        sim.run(None).unwrap();
        assert!(saw_err.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn get_blocks_until_level_available_preserving_fifo_discipline() {
        let mut sim = Simulation::new(SimulationOptions::default());
        let buf = sim.create_buffer(10.0, BufferOptions::default()).unwrap();
        let order = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 0..2 {
            let order = order.clone();
            sim.process(move |h| {
                h.get(buf, 5.0, 0)?;
                order.lock().unwrap().push(i);
                Ok(())
            });
        }
        sim.process(move |h| {
            h.timeout(1.0)?;
            h.put(buf, 5.0, 0)?;
            h.timeout(1.0)?;
            h.put(buf, 5.0, 0)?;
            Ok(())
        });
        sim.run(None).unwrap();
        assert_eq!(*order.lock().unwrap(), vec![0, 1]);
    }
}
