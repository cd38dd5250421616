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

//! Seedable, reproducible random stream with a fixed set of named
//! distributions. Backed by `rand`/`rand_distr`, promoted here from a
//! dev-only to a normal dependency since the RNG is core to the engine,
//! not just its demos.

use rand::distributions::uniform::SampleUniform;
use rand::prelude::*;
use rand::rngs::SmallRng;
use rand_distr::{Distribution, Exp, Normal, Poisson, Triangular};

use crate::error::{SimError, ValidationError};

/// A seeded, reproducible source of randomness. Two `Rng`s constructed with
/// the same seed and driven with the same call sequence produce identical
/// output, which is what the engine's determinism invariant requires of
/// inter-arrival times, service times, and routing decisions.
pub struct Rng {
    inner: SmallRng,
}

impl Rng {
    /// `seed` must fit in a `u32` (values are bounded to `2^32 - 1`).
    pub fn new(seed: u64) -> Self {
        Rng {
            inner: SmallRng::seed_from_u64(seed),
        }
    }

    pub fn from_entropy() -> Self {
        Rng {
            inner: SmallRng::from_entropy(),
        }
    }

    pub fn uniform(&mut self, a: f64, b: f64) -> Result<f64, SimError> {
        if !(a < b) {
            return Err(SimError::Validation(ValidationError::with(
                "uniform requires a < b",
                "a",
                a,
            )));
        }
        Ok(self.inner.gen_range(a..b))
    }

    pub fn exponential(&mut self, mean: f64) -> Result<f64, SimError> {
        if !(mean > 0.0) {
            return Err(SimError::Validation(ValidationError::with(
                "exponential requires mean > 0",
                "mean",
                mean,
            )));
        }
        let dist = Exp::new(1.0 / mean).map_err(|e| SimError::validation(e.to_string()))?;
        Ok(dist.sample(&mut self.inner))
    }

    pub fn normal(&mut self, mean: f64, stddev: f64) -> Result<f64, SimError> {
        if stddev < 0.0 {
            return Err(SimError::Validation(ValidationError::with(
                "normal requires stddev >= 0",
                "stddev",
                stddev,
            )));
        }
        let dist = Normal::new(mean, stddev.max(f64::MIN_POSITIVE))
            .map_err(|e| SimError::validation(e.to_string()))?;
        Ok(if stddev == 0.0 { mean } else { dist.sample(&mut self.inner) })
    }

    pub fn triangular(&mut self, min: f64, max: f64, mode: f64) -> Result<f64, SimError> {
        if !(min < max) || !(mode >= min && mode <= max) {
            return Err(SimError::validation(
                "triangular requires min < max and mode in [min, max]",
            ));
        }
        let dist = Triangular::new(min, max, mode).map_err(|e| SimError::validation(e.to_string()))?;
        Ok(dist.sample(&mut self.inner))
    }

    pub fn poisson(&mut self, lambda: f64) -> Result<f64, SimError> {
        if !(lambda > 0.0) {
            return Err(SimError::validation("poisson requires lambda > 0"));
        }
        let dist = Poisson::new(lambda).map_err(|e| SimError::validation(e.to_string()))?;
        Ok(dist.sample(&mut self.inner))
    }

    pub fn randint(&mut self, a: i64, b: i64) -> Result<i64, SimError> {
        if a > b {
            return Err(SimError::validation("randint requires a <= b"));
        }
        Ok(self.inner.gen_range(a..=b))
    }

    pub fn choice<'a, T>(&mut self, items: &'a [T]) -> Result<&'a T, SimError> {
        items
            .choose(&mut self.inner)
            .ok_or_else(|| SimError::validation("choice requires a non-empty sequence"))
    }

    /// Fisher-Yates, in place.
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        items.shuffle(&mut self.inner);
    }

    pub fn gen_range<T: SampleUniform + PartialOrd>(&mut self, range: std::ops::Range<T>) -> T {
        self.inner.gen_range(range)
    }
}

/// Round trips into the scheduler's `Rng` from inside a process body, since
/// only the scheduler thread owns it. Mirrors `ProcHandle::time` — a process
/// sampling an inter-arrival time or a service duration does so through the
/// same single-threaded-logical owner as everything else in the engine.
impl crate::process::ProcHandle {
    pub fn uniform(&self, a: f64, b: f64) -> Result<f64, SimError> {
        self.perform(move |_pid, respond| {
            Box::new(move |sim: &mut crate::scheduler::Simulation| {
                respond(sim.rng().uniform(a, b));
                crate::process::AskResult::ResolvedNow
            })
        })
    }

    pub fn exponential(&self, mean: f64) -> Result<f64, SimError> {
        self.perform(move |_pid, respond| {
            Box::new(move |sim: &mut crate::scheduler::Simulation| {
                respond(sim.rng().exponential(mean));
                crate::process::AskResult::ResolvedNow
            })
        })
    }

    pub fn normal(&self, mean: f64, stddev: f64) -> Result<f64, SimError> {
        self.perform(move |_pid, respond| {
            Box::new(move |sim: &mut crate::scheduler::Simulation| {
                respond(sim.rng().normal(mean, stddev));
                crate::process::AskResult::ResolvedNow
            })
        })
    }

    pub fn triangular(&self, min: f64, max: f64, mode: f64) -> Result<f64, SimError> {
        self.perform(move |_pid, respond| {
            Box::new(move |sim: &mut crate::scheduler::Simulation| {
                respond(sim.rng().triangular(min, max, mode));
                crate::process::AskResult::ResolvedNow
            })
        })
    }

    pub fn poisson(&self, lambda: f64) -> Result<f64, SimError> {
        self.perform(move |_pid, respond| {
            Box::new(move |sim: &mut crate::scheduler::Simulation| {
                respond(sim.rng().poisson(lambda));
                crate::process::AskResult::ResolvedNow
            })
        })
    }

    pub fn randint(&self, a: i64, b: i64) -> Result<i64, SimError> {
        self.perform(move |_pid, respond| {
            Box::new(move |sim: &mut crate::scheduler::Simulation| {
                respond(sim.rng().randint(a, b));
                crate::process::AskResult::ResolvedNow
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_sequence() {
        let mut a = Rng::new(42);
        let mut b = Rng::new(42);
        for _ in 0..10 {
            assert_eq!(a.exponential(1.0).unwrap(), b.exponential(1.0).unwrap());
        }
    }

    #[test]
    fn uniform_rejects_bad_range() {
        let mut r = Rng::new(1);
        assert!(r.uniform(5.0, 1.0).is_err());
    }

    #[test]
    fn shuffle_is_a_permutation() {
        let mut r = Rng::new(7);
        let mut items = vec![1, 2, 3, 4, 5];
        r.shuffle(&mut items);
        let mut sorted = items.clone();
        sorted.sort();
        assert_eq!(sorted, vec![1, 2, 3, 4, 5]);
    }
}
