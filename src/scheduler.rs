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

//! The Scheduler/Clock: owns virtual time, the sequence counter, the event
//! dispatch loop, and run-until/step/reset. This is the `Simulation` type
//! users construct; every other primitive in the crate is created through
//! it and mutated only while it is driving the event queue.

use std::any::Any;
use std::collections::HashMap;
use std::sync::mpsc;
use std::thread;

use tracing::{debug, trace};

use crate::buffer::BufferInner;
use crate::error::{SimError, ValidationError};
use crate::event_queue::{Callback, DispatchedEvent, EventId, EventQueue};
use crate::process::{AskFn, AskResult, CancelHandle, ProcHandle, ProcessId, ProcessState, ProcessSlot};
use crate::resource::ResourceInner;
use crate::rng::Rng;
use crate::stats::Statistics;

/// Construction options for a [`Simulation`]: the starting clock value, an
/// optional RNG seed for reproducible runs, and whether to emit trace
/// events through `tracing`.
#[derive(Debug, Clone, Default)]
pub struct SimulationOptions {
    pub initial_time: f64,
    pub random_seed: Option<u64>,
    pub enable_logging: bool,
}

/// Convenience wrapper over `run(until)`; sugar, not a replacement for it.
pub enum EndCondition {
    Time(f64),
    NoEvents,
    NSteps(u64),
}

#[derive(Debug, Clone, Copy)]
pub struct RunSummary {
    pub end_time: f64,
    pub events_processed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObserverKind {
    Step,
    Complete,
    Error,
    TraceResource,
    TraceProcess,
    TraceEvent,
}

#[derive(Debug, Clone)]
pub enum Observation {
    Step { time: f64, events_processed: u64 },
    Complete { time: f64, events_processed: u64 },
    Error { message: String },
    TraceResource { resource: usize, what: String, time: f64 },
    TraceProcess { process: ProcessId, what: String, time: f64 },
    TraceEvent { event: EventId, time: f64 },
}

type Observer = Box<dyn FnMut(&Observation)>;

/// Owns virtual time, the event queue, the process registry, and every
/// resource/buffer/store/event created against it. Everything else in the
/// crate is a small handle (an index or two) into one of these vectors.
pub struct Simulation {
    pub(crate) now: f64,
    pub(crate) events_processed: u64,
    pub(crate) is_running: bool,
    pub(crate) initial_time: f64,
    pub(crate) queue: EventQueue,
    pub(crate) processes: Vec<ProcessSlot>,
    pub(crate) resources: Vec<ResourceInner>,
    pub(crate) buffers: Vec<BufferInner>,
    pub(crate) stores: Vec<Box<dyn Any + Send>>,
    pub(crate) sim_events: Vec<Box<dyn Any + Send>>,
    pub(crate) rng: Rng,
    pub(crate) stats: Statistics,
    pub(crate) enable_logging: bool,
    next_observer_id: u64,
    observers: HashMap<ObserverKind, Vec<(u64, Observer)>>,
    processed_log: std::collections::VecDeque<DispatchedEvent>,
}

const PROCESSED_LOG_CAP: usize = 10_000;

impl Simulation {
    pub fn new(options: SimulationOptions) -> Self {
        let rng = match options.random_seed {
            Some(seed) => Rng::new(seed),
            None => Rng::from_entropy(),
        };
        Simulation {
            now: options.initial_time,
            events_processed: 0,
            is_running: false,
            initial_time: options.initial_time,
            queue: EventQueue::new(),
            processes: Vec::new(),
            resources: Vec::new(),
            buffers: Vec::new(),
            stores: Vec::new(),
            sim_events: Vec::new(),
            rng,
            stats: Statistics::new(),
            enable_logging: options.enable_logging,
            next_observer_id: 0,
            observers: HashMap::new(),
            processed_log: std::collections::VecDeque::new(),
        }
    }

    pub fn time(&self) -> f64 {
        self.now
    }

    pub fn events_processed(&self) -> u64 {
        self.events_processed
    }

    pub fn is_running(&self) -> bool {
        self.is_running
    }

    pub fn statistics(&mut self) -> &mut Statistics {
        &mut self.stats
    }

    pub fn rng(&mut self) -> &mut Rng {
        &mut self.rng
    }

    pub fn processed_events(&self) -> impl Iterator<Item = DispatchedEvent> + '_ {
        self.processed_log.iter().copied()
    }

    // ---- observers -------------------------------------------------

    pub fn on(&mut self, kind: ObserverKind, handler: impl FnMut(&Observation) + 'static) -> u64 {
        let id = self.next_observer_id;
        self.next_observer_id += 1;
        self.observers.entry(kind).or_default().push((id, Box::new(handler)));
        id
    }

    pub fn off(&mut self, kind: ObserverKind, id: u64) -> bool {
        if let Some(v) = self.observers.get_mut(&kind) {
            let len_before = v.len();
            v.retain(|(i, _)| *i != id);
            return v.len() != len_before;
        }
        false
    }

    fn notify(&mut self, kind: ObserverKind, obs: Observation) {
        if let Some(handlers) = self.observers.get_mut(&kind) {
            for (_, h) in handlers.iter_mut() {
                h(&obs);
            }
        }
    }

    pub(crate) fn trace_resource(&mut self, resource: usize, what: &str) {
        if !self.enable_logging {
            return;
        }
        trace!(target: "simcore::resource", resource, what, time = self.now);
        self.notify(
            ObserverKind::TraceResource,
            Observation::TraceResource { resource, what: what.to_string(), time: self.now },
        );
    }

    pub(crate) fn trace_process(&mut self, process: ProcessId, what: &str) {
        if !self.enable_logging {
            return;
        }
        trace!(target: "simcore::process", process, what, time = self.now);
        self.notify(
            ObserverKind::TraceProcess,
            Observation::TraceProcess { process, what: what.to_string(), time: self.now },
        );
    }

    fn trace_event(&mut self, event: EventId) {
        if self.enable_logging {
            trace!(target: "simcore::event", event, time = self.now);
        }
        self.notify(ObserverKind::TraceEvent, Observation::TraceEvent { event, time: self.now });
    }

    fn emit_step(&mut self) {
        let obs = Observation::Step { time: self.now, events_processed: self.events_processed };
        self.notify(ObserverKind::Step, obs);
    }

    fn emit_complete(&mut self) {
        let obs = Observation::Complete { time: self.now, events_processed: self.events_processed };
        self.notify(ObserverKind::Complete, obs);
    }

    fn emit_error(&mut self, message: &str) {
        debug!(target: "simcore::scheduler", message, "engine error escaped a callback");
        self.notify(ObserverKind::Error, Observation::Error { message: message.to_string() });
    }

    // ---- event queue -------------------------------------------------

    /// Schedules `cb` to run after `delay`, ordered by `(time, priority,
    /// push order)` against every other pending event. `cb` runs with no
    /// special context — a plain zero-argument closure.
    pub fn schedule(&mut self, delay: f64, priority: i64, cb: impl FnOnce() + Send + 'static) -> Result<EventId, SimError> {
        self.schedule_internal(delay, priority, None, move |_sim| cb())
    }

    pub(crate) fn schedule_internal(
        &mut self,
        delay: f64,
        priority: i64,
        owner: Option<ProcessId>,
        cb: impl FnOnce(&mut Simulation) + Send + 'static,
    ) -> Result<EventId, SimError> {
        if delay < 0.0 || !delay.is_finite() {
            return Err(SimError::Validation(ValidationError::with(
                "schedule delay must be finite and >= 0",
                "delay",
                delay,
            )));
        }
        let time = self.now + delay;
        let callback: Callback = Box::new(cb);
        self.queue.push(time, priority, owner, callback)
    }

    pub fn cancel(&mut self, id: EventId) -> bool {
        self.queue.cancel(id)
    }

    pub fn step(&mut self) -> Result<bool, SimError> {
        let ev = match self.queue.pop() {
            Some(e) => e,
            None => return Ok(false),
        };
        self.now = ev.time;
        self.events_processed += 1;
        self.trace_event(ev.id);
        self.processed_log.push_back(DispatchedEvent { id: ev.id, time: ev.time, priority: ev.priority, seq: ev.seq });
        if self.processed_log.len() > PROCESSED_LOG_CAP {
            self.processed_log.pop_front();
        }
        let callback = ev.callback;
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(self)));
        match outcome {
            Ok(()) => {
                self.emit_step();
                Ok(true)
            }
            Err(payload) => {
                let msg = panic_message(&payload);
                self.emit_error(&msg);
                Err(SimError::Engine(msg))
            }
        }
    }

    /// `sim.run(until?)`. Loops `step()` while the next event's time is
    /// `<= until` (or forever if `until` is `None`). If the queue empties
    /// before `until` is reached, advances `now` to `until`.
    pub fn run(&mut self, until: Option<f64>) -> Result<RunSummary, SimError> {
        if self.is_running {
            return Err(SimError::validation("simulation is already running"));
        }
        if let Some(u) = until {
            if u.is_nan() || u.is_infinite() || u < 0.0 {
                return Err(SimError::Validation(ValidationError::with(
                    "run(until) must be finite and >= 0",
                    "until",
                    u,
                )));
            }
        }
        self.is_running = true;
        let outcome = self.run_loop(until);
        self.is_running = false;
        outcome?;
        self.emit_complete();
        Ok(RunSummary { end_time: self.now, events_processed: self.events_processed })
    }

    fn run_loop(&mut self, until: Option<f64>) -> Result<(), SimError> {
        loop {
            let should_step = match self.queue.peek_time() {
                Some(t) => until.map_or(true, |u| t <= u),
                None => false,
            };
            if !should_step {
                break;
            }
            self.step()?;
        }
        if let Some(u) = until {
            if self.now < u {
                self.now = u;
            }
        }
        Ok(())
    }

    pub fn run_until(&mut self, condition: EndCondition) -> Result<RunSummary, SimError> {
        match condition {
            EndCondition::Time(t) => self.run(Some(t)),
            EndCondition::NoEvents => self.run(None),
            EndCondition::NSteps(n) => {
                if self.is_running {
                    return Err(SimError::validation("simulation is already running"));
                }
                self.is_running = true;
                let outcome = (|| {
                    let mut done = 0u64;
                    while done < n {
                        if !self.step()? {
                            break;
                        }
                        done += 1;
                    }
                    Ok(())
                })();
                self.is_running = false;
                outcome?;
                self.emit_complete();
                Ok(RunSummary { end_time: self.now, events_processed: self.events_processed })
            }
        }
    }

    /// Forbidden while running. Interrupts every still-running process with
    /// a canonical `SimError::EngineReset`, then clears the event queue and
    /// every primitive. Observer registrations and `enable_logging` survive.
    pub fn reset(&mut self) -> Result<(), SimError> {
        if self.is_running {
            return Err(SimError::validation("cannot reset while running"));
        }
        let running: Vec<ProcessId> = (0..self.processes.len())
            .filter(|&p| self.processes[p].state == ProcessState::Running)
            .collect();
        for pid in running {
            let _ = self.interrupt(pid, SimError::EngineReset);
        }
        self.queue.clear();
        self.processes.clear();
        self.resources.clear();
        self.buffers.clear();
        self.stores.clear();
        self.sim_events.clear();
        self.stats.reset();
        self.now = self.initial_time;
        self.events_processed = 0;
        self.processed_log.clear();
        Ok(())
    }

    // ---- processes -----------------------------------------------------

    pub fn process_state(&self, pid: ProcessId) -> ProcessState {
        self.processes[pid].state
    }

    /// Constructs a process from `body` and starts it: it runs
    /// synchronously until its first suspension, exactly as if the caller
    /// had called `start()` on a freshly constructed `Process`.
    pub fn process<F>(&mut self, body: F) -> ProcessId
    where
        F: FnOnce(ProcHandle) -> Result<(), SimError> + Send + 'static,
    {
        let pid = self.processes.len();
        let (ask_tx, ask_rx) = mpsc::channel::<AskFn>();
        let handle = ProcHandle { pid, ask_tx };
        let join = thread::Builder::new()
            .name(format!("simcore-process-{pid}"))
            .spawn(move || body(handle))
            .expect("failed to spawn process thread");
        self.processes.push(ProcessSlot {
            state: ProcessState::Running,
            ask_rx,
            current_cancel: None,
            join: Some(join),
            name: None,
        });
        self.trace_process(pid, "start");
        self.drive(pid);
        pid
    }

    pub(crate) fn set_current_cancel(&mut self, pid: ProcessId, handle: CancelHandle) {
        self.processes[pid].current_cancel = Some(handle);
    }

    pub(crate) fn clear_current_cancel(&mut self, pid: ProcessId) {
        self.processes[pid].current_cancel = None;
    }

    /// Drives `pid`'s thread: receives its next `Ask`, dispatches it, and
    /// loops immediately if it resolved synchronously, or returns control
    /// to the caller (ultimately back to `step()`) once it suspends.
    pub(crate) fn drive(&mut self, pid: ProcessId) {
        loop {
            let received = self.processes[pid].ask_rx.recv();
            match received {
                Ok(ask) => {
                    if self.processes[pid].state == ProcessState::Interrupted {
                        // It caught the thrown error and kept going.
                        self.processes[pid].state = ProcessState::Running;
                    }
                    match ask(self) {
                        AskResult::ResolvedNow => continue,
                        AskResult::Suspended => return,
                    }
                }
                Err(_) => {
                    self.finish_process(pid);
                    return;
                }
            }
        }
    }

    fn finish_process(&mut self, pid: ProcessId) {
        let join = self.processes[pid].join.take();
        let result = join.map(|j| {
            j.join()
                .unwrap_or_else(|_| Err(SimError::Engine("process thread panicked".into())))
        });
        let was_interrupted = self.processes[pid].state == ProcessState::Interrupted;
        match (was_interrupted, result) {
            (true, Some(Err(_))) | (true, None) => {
                // Propagated out without being caught: stays Interrupted.
            }
            (true, Some(Ok(()))) => {
                // Caught the interrupt and ran to completion.
                self.processes[pid].state = ProcessState::Completed;
            }
            (false, Some(Err(e))) => {
                self.processes[pid].state = ProcessState::Completed;
                self.emit_error(&e.to_string());
            }
            (false, _) => {
                self.processes[pid].state = ProcessState::Completed;
            }
        }
        self.trace_process(pid, "complete");
    }

    /// Requires `Running`. Stores the reason, flips state to `Interrupted`,
    /// and throws it into whatever the process is currently suspended on.
    pub fn interrupt(&mut self, pid: ProcessId, reason: SimError) -> Result<(), SimError> {
        if self.processes[pid].state != ProcessState::Running {
            return Err(SimError::validation("cannot interrupt a non-running process"));
        }
        self.processes[pid].state = ProcessState::Interrupted;
        self.trace_process(pid, "interrupt");
        if let Some(handle) = self.processes[pid].current_cancel.take() {
            handle.invoke(self, reason);
        }
        Ok(())
    }
}

fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "process callback panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_then_cancel_never_invokes_callback() {
        let mut sim = Simulation::new(SimulationOptions::default());
        let called = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let called2 = called.clone();
        let id = sim.schedule(5.0, 0, move || called2.store(true, std::sync::atomic::Ordering::SeqCst)).unwrap();
        assert!(sim.cancel(id));
        assert!(!sim.cancel(id));
        sim.run(None).unwrap();
        assert!(!called.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn same_time_same_priority_runs_in_push_order() {
        let mut sim = Simulation::new(SimulationOptions::default());
        let order = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 0..5 {
            let order2 = order.clone();
            sim.schedule(0.0, 0, move || order2.lock().unwrap().push(i)).unwrap();
        }
        sim.run(None).unwrap();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn run_until_advances_now_even_with_empty_queue() {
        let mut sim = Simulation::new(SimulationOptions::default());
        sim.run(Some(10.0)).unwrap();
        assert_eq!(sim.time(), 10.0);
    }

    #[test]
    fn reentry_into_run_is_rejected() {
        let mut sim = Simulation::new(SimulationOptions::default());
        sim.schedule(0.0, 0, move || {}).unwrap();
        // Can't easily re-enter from inside a callback with this API shape,
        // so this test documents the direct double-call case instead.
        sim.is_running = true;
        assert!(sim.run(None).is_err());
        sim.is_running = false;
    }
}
