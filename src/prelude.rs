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

//! A single `use simcore::prelude::*;` pulls in the types that show up in
//! almost every simulation: the engine itself, process handles, and the
//! four coordination primitives.

pub use crate::buffer::{Buffer, BufferOptions, BufferSnapshot};
pub use crate::discipline::{Discipline, Tie};
pub use crate::error::{ConditionTimeoutError, PreemptionError, SimError, SimResult, ValidationError};
pub use crate::process::{ProcHandle, ProcessId, ProcessState};
pub use crate::resource::{Resource, ResourceOptions, ResourceSnapshot};
pub use crate::scheduler::{EndCondition, RunSummary, Simulation, SimulationOptions};
pub use crate::sim_event::{SimEvent, SimEventSnapshot};
pub use crate::stats::{SampleSummary, Statistics};
pub use crate::store::{Store, StoreOptions, StoreSnapshot};
