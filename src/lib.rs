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

//! A discrete-event simulation engine for queuing systems, production
//! lines, and other stochastic processes that advance in virtual time
//! rather than wall-clock time.
//!
//! # Simulation
//! A [`Simulation`] owns virtual time, the event queue, and every resource,
//! buffer, store, and broadcast event created against it. You build a model
//! by starting one or more processes on it and giving them access to the
//! primitives they coordinate through, then driving the clock forward with
//! [`Simulation::step`] or [`Simulation::run`].
//!
//! # Process
//! A process is an ordinary Rust closure run on its own thread, given a
//! [`ProcHandle`](process::ProcHandle) it blocks on at every suspension
//! point (`timeout`, `request`, `wait_for`, buffer/store `put`/`get`,
//! event `wait`). Only one process thread is ever unblocked at a time —
//! the scheduler thread hands control to it and waits for its next request
//! before doing anything else, so process bodies can use ordinary loops,
//! `?`, and borrows instead of a hand-written state machine, while the
//! simulation's timeline stays strictly single-threaded-logical.
//!
//! # Resource
//! A [`Resource`](resource::Resource) is a capacity-limited pool of
//! identical units. A process that can't get a unit immediately queues by
//! [`Discipline`](discipline::Discipline); a preemptive resource may
//! instead displace a lower-priority holder, delivering it a
//! [`PreemptionError`](error::PreemptionError) it can catch and clean up
//! from.
//!
//! # Buffer, Store, SimEvent
//! [`Buffer`](buffer::Buffer) holds a numeric level; [`Store<T>`](store::Store)
//! holds distinct typed items with an optional filter on `get`;
//! [`SimEvent<V>`](sim_event::SimEvent) is a latching broadcast with any
//! number of waiters released together on `trigger`.
//!
//! # Statistics
//! [`Statistics`](stats::Statistics) tracks time-weighted averages,
//! counters, and (opt-in) online sample moments via Welford's algorithm,
//! exportable as JSON or labeled CSV sections.

pub mod buffer;
pub mod discipline;
pub mod error;
pub(crate) mod event_queue;
pub mod process;
pub mod prelude;
pub mod resource;
pub mod rng;
pub mod scheduler;
pub mod sim_event;
pub mod stats;
pub mod store;

pub use buffer::{Buffer, BufferOptions, BufferSnapshot};
pub use discipline::{Discipline, Tie};
pub use error::{ConditionTimeoutError, Context, PreemptionError, SimError, SimResult, ValidationError};
pub use event_queue::{DispatchedEvent, EventId};
pub use process::{ProcHandle, ProcessId, ProcessState};
pub use resource::{Resource, ResourceOptions, ResourceSnapshot};
pub use rng::Rng;
pub use scheduler::{EndCondition, Observation, ObserverKind, RunSummary, Simulation, SimulationOptions};
pub use sim_event::{SimEvent, SimEventSnapshot};
pub use stats::{SampleSummary, Statistics, TimeseriesPoint};
pub use store::{Store, StoreOptions, StoreSnapshot};
