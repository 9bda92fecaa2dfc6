//! # stats
//!
//! Named server statistics. Each statistic is a list of timestamped samples
//! of one of four types: integer, float, duration, or string. The type is
//! fixed by the first sample; recording a different type afterwards is an
//! error. Retention is bounded by sample count.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::{
    collections::{BTreeMap, VecDeque},
    sync::Mutex,
    time::Duration,
};

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::json;
use thiserror::Error;

pub mod commands;

/// default number of samples retained per statistic
pub const DEFAULT_MAX_SAMPLES: usize = 20;

#[derive(Debug, Error)]
pub enum StatsError {
    /// a statistic was recorded with a type other than the one that
    /// created it
    #[error("statistic {name} is {expected}, not {got}")]
    InvalidStatType {
        name: String,
        expected: &'static str,
        got: &'static str,
    },
    /// age-bounded retention is not supported; count bounds are
    #[error("{0} not implemented")]
    NotImplemented(&'static str),
}

/// a single observed value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Integer(u64),
    Float(f64),
    Duration(Duration),
    String(String),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::Duration(_) => "duration",
            Value::String(_) => "string",
        }
    }

    fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Integer(v) => json!(v),
            Value::Float(v) => json!(v),
            // durations are exported as microseconds, matching lease
            // timestamp resolution
            Value::Duration(v) => json!(v.as_micros() as u64),
            Value::String(v) => json!(v),
        }
    }

    fn zero_of_same_type(&self) -> Value {
        match self {
            Value::Integer(_) => Value::Integer(0),
            Value::Float(_) => Value::Float(0.0),
            Value::Duration(_) => Value::Duration(Duration::ZERO),
            Value::String(_) => Value::String(String::new()),
        }
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Integer(v)
    }
}
impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}
impl From<Duration> for Value {
    fn from(v: Duration) -> Self {
        Value::Duration(v)
    }
}
impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}
impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

/// samples for one named statistic, newest first
#[derive(Debug, Clone)]
struct Observation {
    samples: VecDeque<(Value, DateTime<Utc>)>,
    max_samples: usize,
}

impl Observation {
    fn new(value: Value, now: DateTime<Utc>) -> Self {
        let mut samples = VecDeque::with_capacity(4);
        samples.push_front((value, now));
        Observation {
            samples,
            max_samples: DEFAULT_MAX_SAMPLES,
        }
    }

    fn latest(&self) -> &Value {
        // an observation always holds at least one sample
        &self.samples[0].0
    }

    fn push(&mut self, value: Value, now: DateTime<Utc>) {
        self.samples.push_front((value, now));
        while self.samples.len() > self.max_samples {
            self.samples.pop_back();
        }
    }

    fn check_type(&self, name: &str, value: &Value) -> Result<(), StatsError> {
        let expected = self.latest().type_name();
        if expected != value.type_name() {
            return Err(StatsError::InvalidStatType {
                name: name.to_owned(),
                expected,
                got: value.type_name(),
            });
        }
        Ok(())
    }

    fn reset(&mut self, now: DateTime<Utc>) {
        let zero = self.latest().zero_of_same_type();
        self.samples.clear();
        self.samples.push_front((zero, now));
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Array(
            self.samples
                .iter()
                .map(|(value, ts)| {
                    json!([
                        value.to_json(),
                        ts.to_rfc3339_opts(SecondsFormat::Micros, true)
                    ])
                })
                .collect(),
        )
    }
}

/// Holds every named statistic behind one lock. Shared by `Arc` between
/// the transaction engine, the allocation path, and the control channel.
#[derive(Debug, Default)]
pub struct StatsMgr {
    stats: Mutex<BTreeMap<String, Observation>>,
}

impl StatsMgr {
    pub fn new() -> Self {
        Self::default()
    }

    /// overwrite the latest sample (recording a new one)
    pub fn set_value<V: Into<Value>>(&self, name: &str, value: V) -> Result<(), StatsError> {
        let value = value.into();
        let now = Utc::now();
        let mut stats = self.stats.lock().expect("stats lock poisoned");
        match stats.get_mut(name) {
            Some(obs) => {
                obs.check_type(name, &value)?;
                obs.push(value, now);
            }
            None => {
                stats.insert(name.to_owned(), Observation::new(value, now));
            }
        }
        Ok(())
    }

    /// increment (numeric/duration) or append (string) onto the latest
    /// sample
    pub fn add_value<V: Into<Value>>(&self, name: &str, value: V) -> Result<(), StatsError> {
        let value = value.into();
        let now = Utc::now();
        let mut stats = self.stats.lock().expect("stats lock poisoned");
        match stats.get_mut(name) {
            Some(obs) => {
                obs.check_type(name, &value)?;
                let combined = match (obs.latest(), &value) {
                    (Value::Integer(a), Value::Integer(b)) => Value::Integer(a.wrapping_add(*b)),
                    (Value::Float(a), Value::Float(b)) => Value::Float(a + b),
                    (Value::Duration(a), Value::Duration(b)) => Value::Duration(*a + *b),
                    (Value::String(a), Value::String(b)) => {
                        Value::String(format!("{a}{b}"))
                    }
                    // check_type has already rejected mismatches
                    _ => unreachable!(),
                };
                obs.push(combined, now);
            }
            None => {
                stats.insert(name.to_owned(), Observation::new(value, now));
            }
        }
        Ok(())
    }

    /// shorthand for the counters the engine bumps on the hot path. A
    /// type error here means a programming bug, so it is logged by the
    /// caller's tracing layer rather than propagated.
    pub fn inc(&self, name: &str) {
        let _ = self.add_value(name, 1u64);
    }

    pub fn inc_by(&self, name: &str, n: u64) {
        let _ = self.add_value(name, n);
    }

    /// latest integer sample, zero when absent or non-integer.
    pub fn get_integer(&self, name: &str) -> u64 {
        let stats = self.stats.lock().expect("stats lock poisoned");
        match stats.get(name).map(|obs| obs.latest().clone()) {
            Some(Value::Integer(v)) => v,
            _ => 0,
        }
    }

    /// JSON for one statistic: `{name: [[value, timestamp], …]}`. An
    /// unknown name yields an empty map.
    pub fn get(&self, name: &str) -> serde_json::Value {
        let stats = self.stats.lock().expect("stats lock poisoned");
        let mut map = serde_json::Map::new();
        if let Some(obs) = stats.get(name) {
            map.insert(name.to_owned(), obs.to_json());
        }
        serde_json::Value::Object(map)
    }

    /// JSON for every statistic
    pub fn get_all(&self) -> serde_json::Value {
        let stats = self.stats.lock().expect("stats lock poisoned");
        serde_json::Value::Object(
            stats
                .iter()
                .map(|(name, obs)| (name.clone(), obs.to_json()))
                .collect(),
        )
    }

    /// reset a statistic to the neutral value of its type. Returns false
    /// when the name is unknown.
    pub fn reset(&self, name: &str) -> bool {
        let now = Utc::now();
        let mut stats = self.stats.lock().expect("stats lock poisoned");
        match stats.get_mut(name) {
            Some(obs) => {
                obs.reset(now);
                true
            }
            None => false,
        }
    }

    pub fn reset_all(&self) {
        let now = Utc::now();
        let mut stats = self.stats.lock().expect("stats lock poisoned");
        for obs in stats.values_mut() {
            obs.reset(now);
        }
    }

    /// remove a statistic entirely. Returns false when the name is unknown.
    pub fn del(&self, name: &str) -> bool {
        let mut stats = self.stats.lock().expect("stats lock poisoned");
        stats.remove(name).is_some()
    }

    pub fn remove_all(&self) {
        let mut stats = self.stats.lock().expect("stats lock poisoned");
        stats.clear();
    }

    pub fn count(&self) -> usize {
        let stats = self.stats.lock().expect("stats lock poisoned");
        stats.len()
    }

    /// bound retention for one statistic by sample count
    pub fn set_max_sample_count(&self, name: &str, max: usize) -> Result<(), StatsError> {
        let mut stats = self.stats.lock().expect("stats lock poisoned");
        if let Some(obs) = stats.get_mut(name) {
            obs.max_samples = max.max(1);
            while obs.samples.len() > obs.max_samples {
                obs.samples.pop_back();
            }
        }
        Ok(())
    }

    /// age-bounded retention is not supported
    pub fn set_max_sample_age(&self, _name: &str, _age: Duration) -> Result<(), StatsError> {
        Err(StatsError::NotImplemented("set_max_sample_age"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_fixes_the_type() {
        let mgr = StatsMgr::new();
        mgr.set_value("pkt4-received", 1u64).unwrap();
        assert!(matches!(
            mgr.set_value("pkt4-received", 2.5f64),
            Err(StatsError::InvalidStatType { .. })
        ));
        // same type still fine
        mgr.set_value("pkt4-received", 7u64).unwrap();
        assert_eq!(mgr.get_integer("pkt4-received"), 7);
    }

    #[test]
    fn add_value_accumulates() {
        let mgr = StatsMgr::new();
        mgr.add_value("pkt4-received", 1u64).unwrap();
        mgr.add_value("pkt4-received", 2u64).unwrap();
        assert_eq!(mgr.get_integer("pkt4-received"), 3);

        mgr.add_value("last-error", "disk ").unwrap();
        mgr.add_value("last-error", "full").unwrap();
        let exported = mgr.get("last-error");
        assert_eq!(exported["last-error"][0][0], "disk full");
    }

    #[test]
    fn retention_is_count_bounded() {
        let mgr = StatsMgr::new();
        for i in 0..50u64 {
            mgr.set_value("cycles", i).unwrap();
        }
        let exported = mgr.get("cycles");
        assert_eq!(
            exported["cycles"].as_array().unwrap().len(),
            DEFAULT_MAX_SAMPLES
        );

        mgr.set_max_sample_count("cycles", 3).unwrap();
        let exported = mgr.get("cycles");
        assert_eq!(exported["cycles"].as_array().unwrap().len(), 3);
        // newest first
        assert_eq!(exported["cycles"][0][0], 49);
    }

    #[test]
    fn age_bound_reports_not_implemented() {
        let mgr = StatsMgr::new();
        assert!(matches!(
            mgr.set_max_sample_age("cycles", Duration::from_secs(60)),
            Err(StatsError::NotImplemented(_))
        ));
    }

    #[test]
    fn reset_keeps_type_remove_forgets() {
        let mgr = StatsMgr::new();
        mgr.set_value("pkt4-received", 9u64).unwrap();
        assert!(mgr.reset("pkt4-received"));
        assert_eq!(mgr.get_integer("pkt4-received"), 0);
        // still typed integer
        assert!(mgr.set_value("pkt4-received", 1.0f64).is_err());

        assert!(mgr.del("pkt4-received"));
        assert!(!mgr.del("pkt4-received"));
        // gone entirely, so a float is fine now
        mgr.set_value("pkt4-received", 1.0f64).unwrap();
    }

    #[test]
    fn export_shape() {
        let mgr = StatsMgr::new();
        mgr.set_value("uptime", Duration::from_millis(1500)).unwrap();
        let all = mgr.get_all();
        let entry = &all["uptime"][0];
        assert_eq!(entry[0], 1_500_000); // microseconds
        assert!(entry[1].as_str().unwrap().ends_with('Z'));
    }
}
