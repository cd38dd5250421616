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

//! Time-weighted averages, counters, and online sample moments (Welford).
//!
//! Three independent metric kinds, each keyed by name. Correctness here is
//! load-bearing: resource/buffer queue-length and utilization averages must
//! be snapshotted at exactly the moment of each state transition, so the
//! primitives call into this module on every mutation rather than
//! recomputing averages lazily from raw history.

use std::collections::HashMap;

use serde::Serialize;

use crate::error::{SimError, ValidationError};

#[derive(Debug, Clone, Default)]
struct TimeWeighted {
    current_value: f64,
    accumulated: f64,
    last_update_time: f64,
}

impl TimeWeighted {
    fn record(&mut self, value: f64, now: f64, warmup_end: f64) {
        let window_start = self.last_update_time.max(warmup_end);
        if now > window_start {
            self.accumulated += self.current_value * (now - window_start);
        }
        self.current_value = value;
        self.last_update_time = now;
    }

    fn average(&self, now: f64, warmup_end: f64) -> f64 {
        let window_start = self.last_update_time.max(warmup_end);
        let open_interval = if now > window_start { self.current_value * (now - window_start) } else { 0.0 };
        let folded = self.accumulated + open_interval;
        let duration = (now - warmup_end).max(0.0);
        if duration <= 0.0 {
            self.current_value
        } else {
            folded / duration
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Samples {
    n: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
    raw: Vec<f64>,
    sorted_cache: Option<Vec<f64>>,
}

impl Samples {
    fn record(&mut self, x: f64) {
        self.n += 1;
        let delta = x - self.mean;
        self.mean += delta / self.n as f64;
        let delta2 = x - self.mean;
        self.m2 += delta * delta2;
        if self.n == 1 {
            self.min = x;
            self.max = x;
        } else {
            self.min = self.min.min(x);
            self.max = self.max.max(x);
        }
        self.raw.push(x);
        self.sorted_cache = None;
    }

    fn variance(&self) -> f64 {
        if self.n == 0 {
            0.0
        } else {
            self.m2 / self.n as f64
        }
    }

    fn sorted(&mut self) -> &[f64] {
        if self.sorted_cache.is_none() {
            let mut v = self.raw.clone();
            v.sort_by(|a, b| a.total_cmp(b));
            self.sorted_cache = Some(v);
        }
        self.sorted_cache.as_deref().unwrap()
    }

    fn percentile(&mut self, p: f64) -> Option<f64> {
        if self.raw.is_empty() {
            return None;
        }
        let sorted = self.sorted();
        if sorted.len() == 1 {
            return Some(sorted[0]);
        }
        let rank = p / 100.0 * (sorted.len() - 1) as f64;
        let lo = rank.floor() as usize;
        let hi = rank.ceil() as usize;
        if lo == hi {
            Some(sorted[lo])
        } else {
            let frac = rank - lo as f64;
            Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
        }
    }

    fn histogram(&mut self, bins: usize) -> Vec<u64> {
        if self.raw.is_empty() || bins == 0 {
            return Vec::new();
        }
        let (min, max) = (self.min, self.max);
        let mut counts = vec![0u64; bins];
        if (max - min).abs() < f64::EPSILON {
            counts[0] = self.raw.len() as u64;
            return counts;
        }
        let width = (max - min) / bins as f64;
        for &x in &self.raw {
            let mut idx = ((x - min) / width) as usize;
            if idx >= bins {
                idx = bins - 1;
            }
            counts[idx] += 1;
        }
        counts
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SampleSummary {
    pub count: u64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub variance: f64,
    pub std_dev: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// A timestamped data point recorded under [`Statistics::record_value`].
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TimeseriesPoint {
    pub time: f64,
    pub value: f64,
}

/// A per-simulation registry of named time-weighted averages, counters, and
/// (opt-in) sample series, plus the global warm-up boundary that gates all
/// of them except counters.
#[derive(Debug, Default)]
pub struct Statistics {
    averages: HashMap<String, TimeWeighted>,
    counters: HashMap<String, u64>,
    samples: HashMap<String, Samples>,
    sample_enabled: std::collections::HashSet<String>,
    timeseries: HashMap<String, Vec<TimeseriesPoint>>,
    timeseries_enabled: std::collections::HashSet<String>,
    warmup_end_time: f64,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_warmup_period(&mut self, t: f64) -> Result<(), SimError> {
        if t < 0.0 || t.is_nan() {
            return Err(SimError::Validation(ValidationError::with(
                "warmup period must be >= 0",
                "warmup",
                t,
            )));
        }
        self.warmup_end_time = t;
        Ok(())
    }

    pub fn warmup_end_time(&self) -> f64 {
        self.warmup_end_time
    }

    /// Updates a time-weighted average's current value, folding the closed
    /// interval `[last_update, now]` into the accumulator first.
    pub fn record(&mut self, name: &str, value: f64, now: f64) {
        self.averages
            .entry(name.to_string())
            .or_default()
            .record(value, now, self.warmup_end_time);
        if self.timeseries_enabled.contains(name) && now >= self.warmup_end_time {
            self.timeseries
                .entry(name.to_string())
                .or_default()
                .push(TimeseriesPoint { time: now, value });
        }
    }

    pub fn average(&self, name: &str, now: f64) -> f64 {
        self.averages
            .get(name)
            .map(|a| a.average(now, self.warmup_end_time))
            .unwrap_or(0.0)
    }

    pub fn increment(&mut self, name: &str, amount: u64) {
        *self.counters.entry(name.to_string()).or_insert(0) += amount;
    }

    pub fn count(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    pub fn enable_sample_tracking(&mut self, name: &str) {
        self.sample_enabled.insert(name.to_string());
        self.samples.entry(name.to_string()).or_default();
    }

    pub fn enable_timeseries(&mut self, name: &str) {
        self.timeseries_enabled.insert(name.to_string());
        self.timeseries.entry(name.to_string()).or_default();
    }

    pub fn record_sample(&mut self, name: &str, x: f64, now: f64) {
        if now < self.warmup_end_time {
            return;
        }
        if self.sample_enabled.contains(name) {
            self.samples.entry(name.to_string()).or_default().record(x);
        }
    }

    pub fn percentile(&mut self, name: &str, p: f64) -> Result<Option<f64>, SimError> {
        if !(0.0..=100.0).contains(&p) {
            return Err(SimError::Validation(ValidationError::with(
                "percentile must be within [0, 100]",
                "p",
                p,
            )));
        }
        Ok(self.samples.get_mut(name).and_then(|s| s.percentile(p)))
    }

    pub fn histogram(&mut self, name: &str, bins: usize) -> Vec<u64> {
        self.samples
            .get_mut(name)
            .map(|s| s.histogram(bins))
            .unwrap_or_default()
    }

    pub fn sample_summary(&mut self, name: &str) -> Option<SampleSummary> {
        let s = self.samples.get_mut(name)?;
        if s.n == 0 {
            return None;
        }
        let variance = s.variance();
        Some(SampleSummary {
            count: s.n,
            mean: s.mean,
            min: s.min,
            max: s.max,
            variance,
            std_dev: variance.sqrt(),
            p50: s.percentile(50.0).unwrap_or(0.0),
            p95: s.percentile(95.0).unwrap_or(0.0),
            p99: s.percentile(99.0).unwrap_or(0.0),
        })
    }

    pub fn get_timeseries(&self, name: &str) -> &[TimeseriesPoint] {
        self.timeseries.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Clears all per-name state; enablement (samples/timeseries opt-ins)
    /// survives the reset.
    pub fn reset(&mut self) {
        self.averages.clear();
        self.counters.clear();
        for s in self.samples.values_mut() {
            *s = Samples::default();
        }
        self.timeseries.clear();
    }

    pub fn to_json(&mut self, now: f64) -> serde_json::Value {
        let averages: HashMap<_, _> = self
            .averages
            .keys()
            .cloned()
            .map(|k| {
                let v = self.average(&k, now);
                (k, v)
            })
            .collect();
        let counters: HashMap<_, _> = self.counters.clone().into_iter().collect();
        let timeseries: HashMap<_, _> = self
            .timeseries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let names: Vec<String> = self.samples.keys().cloned().collect();
        let samples: HashMap<_, _> = names
            .into_iter()
            .filter_map(|k| {
                let summary = self.sample_summary(&k)?;
                Some((k, summary))
            })
            .collect();
        serde_json::json!({
            "simulation_time": now,
            "averages": averages,
            "counters": counters,
            "timeseries": timeseries,
            "samples": samples,
        })
    }

    pub fn to_csv(&mut self, now: f64) -> String {
        let mut out = String::new();
        out.push_str("# Time-Weighted Averages\n");
        out.push_str("Metric,Average\n");
        let mut names: Vec<String> = self.averages.keys().cloned().collect();
        names.sort();
        for name in &names {
            out.push_str(&format!("{},{}\n", name, self.average(name, now)));
        }

        out.push_str("# Counters\n");
        out.push_str("Metric,Count\n");
        let mut cnames: Vec<String> = self.counters.keys().cloned().collect();
        cnames.sort();
        for name in &cnames {
            out.push_str(&format!("{},{}\n", name, self.count(name)));
        }

        out.push_str("# Sample Statistics\n");
        out.push_str("Metric,Count,Mean,Min,Max,Variance,StdDev,P50,P95,P99\n");
        let mut snames: Vec<String> = self.samples.keys().cloned().collect();
        snames.sort();
        for name in &snames {
            if let Some(s) = self.sample_summary(name) {
                out.push_str(&format!(
                    "{},{},{},{},{},{},{},{},{},{}\n",
                    name, s.count, s.mean, s.min, s.max, s.variance, s.std_dev, s.p50, s.p95, s.p99
                ));
            }
        }

        let mut tnames: Vec<String> = self.timeseries.keys().cloned().collect();
        tnames.sort();
        for name in &tnames {
            out.push_str(&format!("# Timeseries: {}\n", name));
            out.push_str("Time,Value\n");
            for point in self.get_timeseries(name) {
                out.push_str(&format!("{},{}\n", point.time, point.value));
            }
        }
        out
    }
}
