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

//! Counted resource: capacity-limited, optional preemption, pluggable queue
//! discipline. `ResourceInner` lives inside `Simulation::resources`; the
//! `Resource` handle a caller holds is just an index into that vector.

use std::collections::VecDeque;

use crate::discipline::{insert_by_discipline, Discipline, Tie};
use crate::error::{PreemptionError, SimError, ValidationError};
use crate::process::{AskResult, ProcHandle, ProcessId, ProcessState, Suspension};
use crate::scheduler::Simulation;

#[derive(Debug, Clone, Copy)]
pub(crate) struct ActiveUser {
    pid: ProcessId,
    priority: i64,
    #[allow(dead_code)]
    acquired_at: f64,
}

pub(crate) struct Waiter {
    pid: ProcessId,
    priority: i64,
    seq: u64,
    request_time: f64,
    susp: Suspension<()>,
}

#[derive(Debug, Clone)]
pub struct ResourceOptions {
    pub name: Option<String>,
    pub preemptive: bool,
    pub discipline: Option<Discipline>,
}

impl Default for ResourceOptions {
    fn default() -> Self {
        ResourceOptions { name: None, preemptive: false, discipline: None }
    }
}

pub(crate) struct ResourceInner {
    pub capacity: u64,
    pub in_use: u64,
    pub preemptive: bool,
    pub discipline: Discipline,
    #[allow(dead_code)]
    pub name: Option<String>,
    pub(crate) active_users: Vec<ActiveUser>,
    pub(crate) wait_queue: VecDeque<Waiter>,
    pub total_requests: u64,
    pub total_releases: u64,
    pub total_wait_time: f64,
    pub total_preemptions: u64,
    next_seq: u64,
}

/// Read-only view of a resource's current state and cumulative counters.
#[derive(Debug, Clone, Copy)]
pub struct ResourceSnapshot {
    pub capacity: u64,
    pub in_use: u64,
    pub available: u64,
    pub queue_length: usize,
    pub utilization: f64,
    pub total_requests: u64,
    pub total_releases: u64,
    pub total_wait_time: f64,
    pub total_preemptions: u64,
}

/// Index into `Simulation::resources`. Cheap to copy and pass around; all
/// real state lives on the `Simulation` that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resource {
    pub(crate) id: usize,
}

impl Simulation {
    pub fn create_resource(&mut self, capacity: u64, options: ResourceOptions) -> Result<Resource, SimError> {
        if capacity < 1 {
            return Err(SimError::Validation(ValidationError::with(
                "resource capacity must be >= 1",
                "capacity",
                capacity,
            )));
        }
        let discipline = options.discipline.unwrap_or(if options.preemptive {
            Discipline::Priority(Tie::Fifo)
        } else {
            Discipline::Fifo
        });
        let id = self.resources.len();
        self.resources.push(ResourceInner {
            capacity,
            in_use: 0,
            preemptive: options.preemptive,
            discipline,
            name: options.name,
            active_users: Vec::new(),
            wait_queue: VecDeque::new(),
            total_requests: 0,
            total_releases: 0,
            total_wait_time: 0.0,
            total_preemptions: 0,
            next_seq: 0,
        });
        Ok(Resource { id })
    }

    pub fn resource_snapshot(&self, r: Resource) -> ResourceSnapshot {
        let res = &self.resources[r.id];
        ResourceSnapshot {
            capacity: res.capacity,
            in_use: res.in_use,
            available: res.capacity - res.in_use,
            queue_length: res.wait_queue.len(),
            utilization: res.in_use as f64 / res.capacity as f64,
            total_requests: res.total_requests,
            total_releases: res.total_releases,
            total_wait_time: res.total_wait_time,
            total_preemptions: res.total_preemptions,
        }
    }

    /// Time-weighted average utilization over the run so far (folds in the
    /// currently open interval), as opposed to `resource_snapshot`'s
    /// instantaneous `in_use / capacity` — the two differ whenever the
    /// resource is idle at the moment of the read but was busy earlier.
    pub fn resource_average_utilization(&mut self, r: Resource) -> f64 {
        let now = self.now;
        self.stats.average(&format!("resource:{}:utilization", r.id), now)
    }

    pub fn resource_average_queue_length(&mut self, r: Resource) -> f64 {
        let now = self.now;
        self.stats.average(&format!("resource:{}:queue_length", r.id), now)
    }
}

impl ProcHandle {
    /// `ResourceRequest{resource, priority}`. Blocks until a unit is
    /// granted (synchronously if free now, else after queueing or, on a
    /// preemptive resource, after displacing a lower-priority holder).
    pub fn request(&self, resource: Resource, priority: i64) -> Result<(), SimError> {
        self.perform(move |pid, respond| {
            Box::new(move |sim: &mut Simulation| acquire(sim, resource, pid, priority, respond))
        })
    }

    /// Releases the caller's unit of `resource`. *ValidationError* if no
    /// units are in use.
    pub fn release(&self, resource: Resource) -> Result<(), SimError> {
        self.perform(move |pid, respond| {
            Box::new(move |sim: &mut Simulation| {
                respond(release(sim, resource, pid));
                AskResult::ResolvedNow
            })
        })
    }
}

fn record_stats(sim: &mut Simulation, r: Resource) {
    let (queue_len, util) = {
        let res = &sim.resources[r.id];
        (res.wait_queue.len() as f64, res.in_use as f64 / res.capacity as f64)
    };
    let now = sim.time();
    sim.stats.record(&format!("resource:{}:queue_length", r.id), queue_len, now);
    sim.stats.record(&format!("resource:{}:utilization", r.id), util, now);
}

fn enqueue(sim: &mut Simulation, r: Resource, pid: ProcessId, priority: i64, respond: Box<dyn FnOnce(Result<(), SimError>) + Send>) {
    let susp = Suspension::new(respond);
    sim.set_current_cancel(pid, susp.cancel_handle(pid));
    let now = sim.time();
    let discipline = sim.resources[r.id].discipline;
    let res = &mut sim.resources[r.id];
    let seq = res.next_seq;
    res.next_seq += 1;
    let waiter = Waiter { pid, priority, seq, request_time: now, susp };
    insert_by_discipline(&mut res.wait_queue, waiter, discipline, |w| w.priority, |w| w.seq);
    sim.trace_resource(r.id, "enqueue");
    record_stats(sim, r);
}

/// Grants a unit immediately if capacity allows; otherwise, on a
/// preemptive resource, displaces the lowest-priority active user if it is
/// less important than the requester; otherwise queues by discipline.
pub(crate) fn acquire(
    sim: &mut Simulation,
    r: Resource,
    pid: ProcessId,
    priority: i64,
    respond: Box<dyn FnOnce(Result<(), SimError>) + Send>,
) -> AskResult {
    sim.resources[r.id].total_requests += 1;
    loop {
        let capacity = sim.resources[r.id].capacity;
        let in_use = sim.resources[r.id].in_use;
        if in_use < capacity {
            let now = sim.time();
            sim.resources[r.id].in_use += 1;
            sim.resources[r.id].active_users.push(ActiveUser { pid, priority, acquired_at: now });
            sim.trace_resource(r.id, "grant");
            record_stats(sim, r);
            respond(Ok(()));
            return AskResult::ResolvedNow;
        }
        if !sim.resources[r.id].preemptive {
            enqueue(sim, r, pid, priority, respond);
            return AskResult::Suspended;
        }
        let victim = sim.resources[r.id]
            .active_users
            .iter()
            .enumerate()
            .max_by_key(|(_, u)| u.priority)
            .map(|(i, u)| (i, u.pid, u.priority));
        let (idx, victim_pid, victim_priority) = match victim {
            Some(v) => v,
            None => {
                enqueue(sim, r, pid, priority, respond);
                return AskResult::Suspended;
            }
        };
        if victim_priority <= priority {
            enqueue(sim, r, pid, priority, respond);
            return AskResult::Suspended;
        }
        if sim.process_state(victim_pid) != ProcessState::Running {
            // Already finished without releasing; reclaim without counting
            // it as a preemption, then retry the grant check.
            sim.resources[r.id].active_users.remove(idx);
            sim.resources[r.id].in_use -= 1;
            continue;
        }
        sim.resources[r.id].active_users.remove(idx);
        sim.resources[r.id].in_use -= 1;
        sim.resources[r.id].total_preemptions += 1;
        let now = sim.time();
        sim.trace_resource(r.id, "preempt");
        record_stats(sim, r);
        let _ = sim.interrupt(victim_pid, SimError::Preemption(PreemptionError { preempted_at: now }));
        continue;
    }
}

/// Releases one unit, then wakes the head of the wait queue if any.
pub(crate) fn release(sim: &mut Simulation, r: Resource, pid: ProcessId) -> Result<(), SimError> {
    if sim.resources[r.id].in_use == 0 {
        return Err(SimError::validation("release called with no units in use"));
    }
    let removed_by_identity = {
        let res = &mut sim.resources[r.id];
        match res.active_users.iter().position(|u| u.pid == pid) {
            Some(idx) => {
                res.active_users.remove(idx);
                true
            }
            None => false,
        }
    };
    if !removed_by_identity {
        let candidates: Vec<(usize, ProcessId)> =
            sim.resources[r.id].active_users.iter().enumerate().map(|(i, u)| (i, u.pid)).collect();
        let stale: Vec<usize> = candidates
            .into_iter()
            .filter(|(_, p)| sim.process_state(*p) != ProcessState::Running)
            .map(|(i, _)| i)
            .collect();
        let res = &mut sim.resources[r.id];
        for idx in stale.into_iter().rev() {
            res.active_users.remove(idx);
        }
    }
    {
        let res = &mut sim.resources[r.id];
        res.in_use -= 1;
        res.total_releases += 1;
    }
    sim.trace_resource(r.id, "release");
    record_stats(sim, r);
    try_fulfill(sim, r);
    Ok(())
}

/// Grants the unit to the first *still-live* waiter at the head of the
/// queue. A waiter whose process was interrupted while queued (its
/// suspension already claimed by `interrupt()`) is passively dropped here
/// rather than granted — granting it would inflate `in_use` with nobody
/// able to release it, since `resolve` would find the suspension already
/// fired and silently do nothing.
fn try_fulfill(sim: &mut Simulation, r: Resource) {
    loop {
        let capacity = sim.resources[r.id].capacity;
        if sim.resources[r.id].in_use >= capacity {
            return;
        }
        let waiter = match sim.resources[r.id].wait_queue.pop_front() {
            Some(w) => w,
            None => return,
        };
        if !waiter.susp.is_pending() {
            continue;
        }
        let now = sim.time();
        sim.resources[r.id].in_use += 1;
        sim.resources[r.id].active_users.push(ActiveUser { pid: waiter.pid, priority: waiter.priority, acquired_at: now });
        sim.resources[r.id].total_wait_time += now - waiter.request_time;
        sim.trace_resource(r.id, "grant-from-queue");
        record_stats(sim, r);
        let pid = waiter.pid;
        let susp = waiter.susp;
        let _ = sim.schedule_internal(0.0, 0, Some(pid), move |sim| {
            crate::process::resolve(sim, pid, &susp, Ok(()));
        });
        return;
    }
}
