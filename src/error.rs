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

//! Shared error vocabulary for contract violations and recoverable
//! simulation-level interrupts.
//!
//! `ValidationError` covers fail-fast contract checks at API boundaries.
//! `SimError` is the union delivered *into* a running process: a resource
//! preemption, a condition-wait timeout, or an engine reset. All three are
//! recoverable by user code (the process may catch them and keep going);
//! `ValidationError` on its own is never recovered by the engine.

use std::collections::HashMap;
use std::fmt;

/// A named bag of extra context attached to a [`ValidationError`].
pub type Context = HashMap<String, String>;

/// A contract violation detected at an API boundary (bad arguments, illegal
/// state transitions, malformed yields). Always fatal to the call that
/// raised it; never recovered by the engine itself.
#[derive(Debug, Clone, thiserror::Error)]
#[error("validation error: {message}")]
pub struct ValidationError {
    pub message: String,
    pub context: Context,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        ValidationError {
            message: message.into(),
            context: Context::new(),
        }
    }

    pub fn with(message: impl Into<String>, key: impl Into<String>, value: impl fmt::Display) -> Self {
        let mut context = Context::new();
        context.insert(key.into(), value.to_string());
        ValidationError {
            message: message.into(),
            context,
        }
    }

    pub fn context(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.context.insert(key.into(), value.to_string());
        self
    }
}

/// Delivered into a process whose resource grant was preempted by a
/// higher-priority request. Catching it is how a process performs cleanup
/// before giving up its unit of the resource.
#[derive(Debug, Clone, thiserror::Error)]
#[error("resource preempted at t={preempted_at}")]
pub struct PreemptionError {
    pub preempted_at: f64,
}

/// Delivered into a process polling a condition that exceeded its
/// `max_iterations` budget.
#[derive(Debug, Clone, thiserror::Error)]
#[error("condition wait timed out after {iterations} iterations")]
pub struct ConditionTimeoutError {
    pub iterations: u64,
}

/// The union of everything that can arrive at a suspended process, plus the
/// boundary-contract failures raised synchronously from API calls.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SimError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Preemption(#[from] PreemptionError),
    #[error(transparent)]
    ConditionTimeout(#[from] ConditionTimeoutError),
    /// Delivered to every still-running process when [`crate::Simulation::reset`]
    /// is called. Distinct from a generic error so user code can match on it
    /// specifically.
    #[error("simulation engine was reset")]
    EngineReset,
    /// An exception escaped a scheduled callback or a process body without
    /// being caught. Fatal to the current `run`/`step` call.
    #[error("engine error: {0}")]
    Engine(String),
}

impl SimError {
    pub fn validation(message: impl Into<String>) -> Self {
        SimError::Validation(ValidationError::new(message))
    }
}

pub type SimResult<T> = Result<T, SimError>;
