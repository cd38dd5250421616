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

//! Cooperative coroutines with suspend/resume on four yield kinds
//! (timeout, resource request, polled condition, interrupt), realized on
//! stable Rust as one OS thread per process rendezvousing with the
//! scheduler thread over a pair of channels — generators are nightly-only,
//! so each process body is an ordinary closure that blocks at every
//! suspension point instead of yielding a sum type.
//!
//! At most one outstanding scheduled resumption exists per process, and
//! exactly one process is ever executing at any instant: the scheduler
//! thread only ever does one of two things — drive the event queue, or
//! block waiting for the single process thread it just woke to make its
//! next request.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::error::SimError;
use crate::scheduler::Simulation;

/// Identifies a process. Stable for the lifetime of the `Simulation` that
/// created it (process slots are never compacted, only marked completed).
pub type ProcessId = usize;

/// Lifecycle state of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Pending,
    Running,
    Completed,
    Interrupted,
}

/// What happened when the scheduler handed a pending request to the
/// primitive it targets.
pub(crate) enum AskResult {
    /// The request was granted (or otherwise answered) synchronously; the
    /// process is still logically running and the scheduler should
    /// immediately wait for its *next* request rather than returning to
    /// the event queue.
    ResolvedNow,
    /// The request was enqueued or scheduled for later; the scheduler
    /// returns control to its own `step()` loop.
    Suspended,
}

pub(crate) type AskFn = Box<dyn FnOnce(&mut Simulation) -> AskResult + Send>;

type Respond<T> = Box<dyn FnOnce(Result<T, SimError>) + Send>;

/// A single outstanding suspension: a one-shot slot that either the normal
/// fulfillment path or an `interrupt()` may fire, whichever happens first.
pub(crate) struct Suspension<T> {
    cell: Arc<Mutex<Option<Respond<T>>>>,
}

impl<T> Clone for Suspension<T> {
    fn clone(&self) -> Self {
        Suspension { cell: self.cell.clone() }
    }
}

impl<T: Send + 'static> Suspension<T> {
    pub fn new(respond: Respond<T>) -> Self {
        Suspension { cell: Arc::new(Mutex::new(Some(respond))) }
    }

    /// Delivers `value` if nobody has claimed this suspension yet. Returns
    /// `true` if this call was the one that fired it.
    pub fn fire(&self, value: Result<T, SimError>) -> bool {
        if let Some(f) = self.cell.lock().unwrap().take() {
            f(value);
            true
        } else {
            false
        }
    }

    /// Non-destructive check used by condition polling to stop rescheduling
    /// rechecks once an interrupt has already claimed this suspension.
    pub fn is_pending(&self) -> bool {
        self.cell.lock().unwrap().is_some()
    }

    /// A type-erased cancellation capability: calling it delivers `err` to
    /// this suspension (if still pending) and resumes driving the process.
    pub fn cancel_handle(&self, pid: ProcessId) -> CancelHandle {
        let cell = self.cell.clone();
        CancelHandle(Box::new(move |sim: &mut Simulation, err: SimError| {
            let fired = if let Some(f) = cell.lock().unwrap().take() {
                f(Err(err));
                true
            } else {
                false
            };
            if fired {
                sim.drive(pid);
            }
        }))
    }
}

/// Resolves `susp` with `value`, clearing the process's current
/// cancellation slot and, if this call actually fired it (i.e. it wasn't
/// already claimed by an `interrupt()`), resumes driving the process.
pub(crate) fn resolve<T: Send + 'static>(
    sim: &mut Simulation,
    pid: ProcessId,
    susp: &Suspension<T>,
    value: Result<T, SimError>,
) {
    if susp.fire(value) {
        sim.clear_current_cancel(pid);
        sim.drive(pid);
    }
}

pub(crate) struct CancelHandle(pub Box<dyn FnOnce(&mut Simulation, SimError) + Send>);

impl CancelHandle {
    pub fn invoke(self, sim: &mut Simulation, err: SimError) {
        (self.0)(sim, err)
    }
}

pub(crate) struct ProcessSlot {
    pub state: ProcessState,
    pub ask_rx: Receiver<AskFn>,
    pub current_cancel: Option<CancelHandle>,
    pub join: Option<thread::JoinHandle<Result<(), SimError>>>,
    pub name: Option<String>,
}

/// The handle a process body receives. All of its methods block the
/// calling (process) thread until the scheduler thread answers; this is
/// the stand-in for a generator's `yield`.
#[derive(Clone)]
pub struct ProcHandle {
    pub(crate) pid: ProcessId,
    pub(crate) ask_tx: Sender<AskFn>,
}

impl ProcHandle {
    pub fn id(&self) -> ProcessId {
        self.pid
    }

    /// Sends `make_ask` to the scheduler and blocks for its typed reply.
    /// This is the one primitive every other `ProcHandle` method (in this
    /// module and in `resource`/`buffer`/`store`/`sim_event`) is built on.
    pub(crate) fn perform<T: Send + 'static>(
        &self,
        make_ask: impl FnOnce(ProcessId, Respond<T>) -> AskFn,
    ) -> Result<T, SimError> {
        let (reply_tx, reply_rx) = mpsc::channel::<Result<T, SimError>>();
        let respond: Respond<T> = Box::new(move |v| {
            let _ = reply_tx.send(v);
        });
        let ask = make_ask(self.pid, respond);
        self.ask_tx
            .send(ask)
            .map_err(|_| SimError::Engine("scheduler is no longer running".into()))?;
        reply_rx
            .recv()
            .map_err(|_| SimError::Engine("scheduler dropped the process without a reply".into()))?
    }

    /// Current simulation time. A quick round trip to the scheduler thread
    /// since only it owns the clock.
    pub fn time(&self) -> Result<f64, SimError> {
        self.perform(|_pid, respond| {
            Box::new(move |sim: &mut Simulation| {
                respond(Ok(sim.time()));
                AskResult::ResolvedNow
            })
        })
    }

    /// `Timeout(delay)`: the scheduler wakes this process after `delay`.
    pub fn timeout(&self, delay: f64) -> Result<(), SimError> {
        if delay < 0.0 || !delay.is_finite() {
            return Err(SimError::validation("timeout delay must be finite and >= 0"));
        }
        self.perform(move |pid, respond| {
            Box::new(move |sim: &mut Simulation| {
                let susp = Suspension::new(respond);
                sim.set_current_cancel(pid, susp.cancel_handle(pid));
                let susp_for_wake = susp.clone();
                sim.schedule_internal(delay, 0, Some(pid), move |sim| {
                    resolve(sim, pid, &susp_for_wake, Ok(()));
                })
                .expect("delay validated finite and non-negative above");
                AskResult::Suspended
            })
        })
    }

    /// `Condition{predicate, interval, max_iterations}`: poll until true or
    /// give up with a `ConditionTimeoutError`.
    pub fn wait_for(
        &self,
        mut predicate: impl FnMut() -> bool + Send + 'static,
        interval: f64,
        max_iterations: Option<u64>,
    ) -> Result<(), SimError> {
        if interval <= 0.0 || !interval.is_finite() {
            return Err(SimError::validation("condition poll interval must be finite and > 0"));
        }
        self.perform(move |pid, respond| {
            Box::new(move |sim: &mut Simulation| {
                if predicate() {
                    respond(Ok(()));
                    return AskResult::ResolvedNow;
                }
                let susp = Suspension::new(respond);
                sim.set_current_cancel(pid, susp.cancel_handle(pid));
                poll_condition(sim, pid, predicate, interval, max_iterations, 1, susp);
                AskResult::Suspended
            })
        })
    }

    /// Throws `reason` into another process's current suspension, the same
    /// delivery mechanism preemption uses internally. Exposed for user
    /// processes that want to cancel siblings they hold a handle to.
    pub fn interrupt(&self, target: ProcessId, reason: SimError) -> Result<(), SimError> {
        self.perform(move |_pid, respond| {
            Box::new(move |sim: &mut Simulation| {
                respond(sim.interrupt(target, reason));
                AskResult::ResolvedNow
            })
        })
    }

    /// Starts a new, independent process from within a running one — the
    /// common "arrival generator spawns a service process per arrival"
    /// pattern. Equivalent to `Simulation::process`, just reachable from
    /// inside a process body, which otherwise has no access to `Simulation`.
    /// The child runs synchronously until its own first suspension, exactly
    /// as a top-level `sim.process(...)` would, before this call returns.
    pub fn spawn<F>(&self, body: F) -> Result<ProcessId, SimError>
    where
        F: FnOnce(ProcHandle) -> Result<(), SimError> + Send + 'static,
    {
        self.perform(move |_pid, respond| {
            Box::new(move |sim: &mut Simulation| {
                let child = sim.process(body);
                respond(Ok(child));
                AskResult::ResolvedNow
            })
        })
    }
}

fn poll_condition(
    sim: &mut Simulation,
    pid: ProcessId,
    mut predicate: impl FnMut() -> bool + Send + 'static,
    interval: f64,
    max_iterations: Option<u64>,
    iteration: u64,
    susp: Suspension<()>,
) {
    sim.schedule_internal(interval, 0, Some(pid), move |sim| {
        if !susp.is_pending() {
            // Already claimed by an interrupt; stop polling.
            return;
        }
        if predicate() {
            resolve(sim, pid, &susp, Ok(()));
            return;
        }
        match max_iterations {
            Some(max) if iteration >= max => {
                resolve(sim, pid, &susp, Err(crate::error::ConditionTimeoutError { iterations: iteration }.into()));
            }
            _ => poll_condition(sim, pid, predicate, interval, max_iterations, iteration + 1, susp),
        }
    })
    .ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceOptions;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[test]
    fn start_runs_synchronously_until_first_suspension() {
        let mut sim = Simulation::new(Default::default());
        let started = Arc::new(AtomicU64::new(0));
        let started2 = started.clone();
        sim.process(move |h| {
            started2.store(1, Ordering::SeqCst);
            h.timeout(5.0)?;
            Ok(())
        });
        assert_eq!(started.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn process_completes_and_state_reflects_it() {
        let mut sim = Simulation::new(Default::default());
        let pid = sim.process(|h| {
            h.timeout(1.0)?;
            Ok(())
        });
        sim.run(None).unwrap();
        assert_eq!(sim.process_state(pid), ProcessState::Completed);
    }

    #[test]
    fn interrupt_delivers_preemption_error() {
        let mut sim = Simulation::new(Default::default());
        let r = sim.create_resource(1, ResourceOptions { preemptive: true, ..Default::default() }).unwrap();
        let caught = Arc::new(AtomicU64::new(0));
        let caught2 = caught.clone();
        let _low = sim.process(move |h| {
            h.request(r, 10)?;
            match h.timeout(100.0) {
                Err(SimError::Preemption(_)) => {
                    caught2.store(1, Ordering::SeqCst);
                }
                other => other?,
            }
            Ok(())
        });
        let _high = sim.process(move |h| {
            h.timeout(10.0)?;
            h.request(r, 0)?;
            h.timeout(5.0)?;
            h.release(r)?;
            Ok(())
        });
        sim.run(None).unwrap();
        assert_eq!(caught.load(Ordering::SeqCst), 1);
    }
}
