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

//! Broadcast event: a latching one-shot, optionally carrying a value, with
//! N waiters released together on `trigger`. Generic over the carried
//! value type via the same type-erasure trick as `Store<T>`.

use std::any::Any;
use std::marker::PhantomData;

use crate::error::SimError;
use crate::process::{AskResult, ProcHandle, ProcessId, Suspension};
use crate::scheduler::Simulation;

struct Waiter<V> {
    pid: ProcessId,
    susp: Suspension<V>,
}

struct SimEventState<V> {
    triggered: bool,
    value: Option<V>,
    waiters: Vec<Waiter<V>>,
}

#[derive(Debug, Clone, Copy)]
pub struct SimEventSnapshot {
    pub triggered: bool,
    pub waiting_count: usize,
}

pub struct SimEvent<V> {
    pub(crate) id: usize,
    _marker: PhantomData<fn() -> V>,
}

impl<V> Clone for SimEvent<V> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<V> Copy for SimEvent<V> {}

impl Simulation {
    pub fn create_event<V: Clone + Send + 'static>(&mut self) -> SimEvent<V> {
        let id = self.sim_events.len();
        let state: SimEventState<V> = SimEventState { triggered: false, value: None, waiters: Vec::new() };
        self.sim_events.push(Box::new(state));
        SimEvent { id, _marker: PhantomData }
    }

    pub fn event_snapshot<V: Clone + Send + 'static>(&self, e: SimEvent<V>) -> SimEventSnapshot {
        let state = downcast_ref::<V>(&self.sim_events[e.id]);
        SimEventSnapshot { triggered: state.triggered, waiting_count: state.waiters.len() }
    }

    /// `trigger(value?)`: idempotent. No-op if already triggered.
    pub fn trigger<V: Clone + Send + 'static>(&mut self, e: SimEvent<V>, value: V) {
        let already = downcast_ref::<V>(&self.sim_events[e.id]).triggered;
        if already {
            return;
        }
        let waiters = {
            let state = downcast_mut::<V>(&mut self.sim_events[e.id]);
            state.triggered = true;
            state.value = Some(value.clone());
            std::mem::take(&mut state.waiters)
        };
        if self.enable_logging {
            tracing::trace!(target: "simcore::sim_event", event = e.id, waiters = waiters.len(), "trigger");
        }
        for w in waiters {
            let v = value.clone();
            let susp = w.susp;
            let pid = w.pid;
            let _ = self.schedule_internal(0.0, 0, Some(pid), move |sim| {
                crate::process::resolve(sim, pid, &susp, Ok(v));
            });
        }
    }

    /// Clears `triggered`/`value`; does not touch already-released waiters
    /// (there are none left in the list at that point; `reset` on an
    /// untriggered event is a no-op).
    pub fn reset_event<V: Clone + Send + 'static>(&mut self, e: SimEvent<V>) {
        let state = downcast_mut::<V>(&mut self.sim_events[e.id]);
        state.triggered = false;
        state.value = None;
    }

}

fn downcast_ref<V: Send + 'static>(b: &Box<dyn Any + Send>) -> &SimEventState<V> {
    b.downcast_ref::<SimEventState<V>>().expect("event handle used against wrong event slot")
}

fn downcast_mut<V: Send + 'static>(b: &mut Box<dyn Any + Send>) -> &mut SimEventState<V> {
    b.downcast_mut::<SimEventState<V>>().expect("event handle used against wrong event slot")
}

impl ProcHandle {
    /// `EventWait(event)`. If already triggered, resolves immediately with
    /// the latched value; otherwise joins the waiter list.
    pub fn wait<V: Clone + Send + 'static>(&self, event: SimEvent<V>) -> Result<V, SimError> {
        self.perform(move |pid, respond| Box::new(move |sim: &mut Simulation| add_waiter(sim, event, pid, respond)))
    }

    /// Round trips into `Simulation::trigger` from inside a process body,
    /// the same pattern `ProcHandle::spawn` uses for `Simulation::process`.
    pub fn trigger<V: Clone + Send + 'static>(&self, event: SimEvent<V>, value: V) -> Result<(), SimError> {
        self.perform(move |_pid, respond| {
            Box::new(move |sim: &mut Simulation| {
                sim.trigger(event, value);
                respond(Ok(()));
                AskResult::ResolvedNow
            })
        })
    }

    /// Round trips into `Simulation::reset_event`.
    pub fn reset_event<V: Clone + Send + 'static>(&self, event: SimEvent<V>) -> Result<(), SimError> {
        self.perform(move |_pid, respond| {
            Box::new(move |sim: &mut Simulation| {
                sim.reset_event(event);
                respond(Ok(()));
                AskResult::ResolvedNow
            })
        })
    }
}

fn add_waiter<V: Clone + Send + 'static>(
    sim: &mut Simulation,
    e: SimEvent<V>,
    pid: ProcessId,
    respond: Box<dyn FnOnce(Result<V, SimError>) + Send>,
) -> AskResult {
    let snapshot = {
        let state = downcast_ref::<V>(&sim.sim_events[e.id]);
        state.triggered.then(|| state.value.clone().expect("triggered implies a stored value"))
    };
    match snapshot {
        Some(value) => {
            respond(Ok(value));
            AskResult::ResolvedNow
        }
        None => {
            let susp = Suspension::new(respond);
            sim.set_current_cancel(pid, susp.cancel_handle(pid));
            let state = downcast_mut::<V>(&mut sim.sim_events[e.id]);
            state.waiters.push(Waiter { pid, susp });
            AskResult::Suspended
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::SimulationOptions;
    use std::sync::Mutex;

    #[test]
    fn broadcast_wakes_all_waiters_with_the_same_value() {
        let mut sim = Simulation::new(SimulationOptions::default());
        let event: SimEvent<&'static str> = sim.create_event();
        let results = std::sync::Arc::new(Mutex::new(Vec::new()));
        for _ in 0..3 {
            let results = results.clone();
            sim.process(move |h| {
                let v = h.wait(event)?;
                results.lock().unwrap().push((h.time()?, v));
                Ok(())
            });
        }
        sim.process(move |h| {
            h.timeout(10.0)?;
            h.trigger(event, "go")?;
            Ok(())
        });
        sim.run(None).unwrap();
        let results = results.lock().unwrap();
        assert_eq!(results.len(), 3);
        for (t, v) in results.iter() {
            assert_eq!(*t, 10.0);
            assert_eq!(*v, "go");
        }
        assert_eq!(sim.event_snapshot(event).waiting_count, 0);
    }

    #[test]
    fn trigger_is_idempotent_and_reset_on_untriggered_is_noop() {
        let mut sim = Simulation::new(SimulationOptions::default());
        let event: SimEvent<i32> = sim.create_event();
        sim.trigger(event, 1);
        sim.trigger(event, 2);
        assert!(sim.event_snapshot(event).triggered);
        sim.reset_event(event);
        assert!(!sim.event_snapshot(event).triggered);
        sim.reset_event(event);
        assert!(!sim.event_snapshot(event).triggered);
    }

    #[test]
    fn wait_after_trigger_resolves_with_latched_value() {
        let mut sim = Simulation::new(SimulationOptions::default());
        let event: SimEvent<i32> = sim.create_event();
        sim.trigger(event, 42);
        let seen = std::sync::Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        sim.process(move |h| {
            let v = h.wait(event)?;
            *seen2.lock().unwrap() = Some(v);
            Ok(())
        });
        sim.run(None).unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(42));
    }
}
