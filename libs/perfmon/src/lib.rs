//! # perfmon
//!
//! Rolling per-transaction timing. Each monitored duration is keyed by
//! (family, query type, response type, start event, end event, subnet) and
//! aggregates samples into a current and a previous interval. When a sample
//! lands past the end of the current interval the intervals rotate and the
//! caller is told a report is due.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::{collections::BTreeMap, fmt, sync::Mutex};

use chrono::{DateTime, TimeDelta, Utc};
use proto::{v4, v6};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PerfmonError {
    /// caller misuse: invalid key or interval
    #[error("bad value: {0}")]
    BadValue(String),
    /// a duration already exists for this key
    #[error("duration already exists for: {0}")]
    Duplicate(String),
    /// updating a duration that is not in the store
    #[error("duration not found: {0}")]
    InvalidOperation(String),
    #[error("{0} not implemented")]
    NotImplemented(&'static str),
}

/// protocol family a store serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Family {
    V4,
    V6,
}

/// message-type value meaning "either side of the pair unconstrained"
pub const NO_TYPE: u8 = 0;

/// Identifies one monitored duration. Ordering is lexicographic over
/// (family, query type, response type, start event, end event, subnet).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DurationKey {
    family: Family,
    query_type: u8,
    response_type: u8,
    start_event: String,
    end_event: String,
    subnet_id: u32,
}

impl DurationKey {
    pub fn new(
        family: Family,
        query_type: u8,
        response_type: u8,
        start_event: &str,
        end_event: &str,
        subnet_id: u32,
    ) -> Result<Self, PerfmonError> {
        validate_message_pair(family, query_type, response_type)?;
        Ok(DurationKey {
            family,
            query_type,
            response_type,
            start_event: start_event.to_owned(),
            end_event: end_event.to_owned(),
            subnet_id,
        })
    }

    pub fn family(&self) -> Family {
        self.family
    }
    pub fn query_type(&self) -> u8 {
        self.query_type
    }
    pub fn response_type(&self) -> u8 {
        self.response_type
    }
    pub fn start_event(&self) -> &str {
        &self.start_event
    }
    pub fn end_event(&self) -> &str {
        &self.end_event
    }
    pub fn subnet_id(&self) -> u32 {
        self.subnet_id
    }
}

impl fmt::Display for DurationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.family {
            Family::V4 => write!(
                f,
                "{}-{}",
                name_v4(self.query_type),
                name_v4(self.response_type)
            )?,
            Family::V6 => write!(
                f,
                "{}-{}",
                name_v6(self.query_type),
                name_v6(self.response_type)
            )?,
        }
        write!(
            f,
            ".{}-{}.{}",
            self.start_event, self.end_event, self.subnet_id
        )
    }
}

fn name_v4(t: u8) -> String {
    if t == NO_TYPE {
        "NONE".to_owned()
    } else {
        format!("{}", v4::MessageType::from(t))
    }
}

fn name_v6(t: u8) -> String {
    if t == NO_TYPE {
        "NONE".to_owned()
    } else {
        format!("{}", v6::MessageType::from(t))
    }
}

/// reject (query, response) pairs the protocol cannot produce, so a
/// mis-wired caller fails at key construction rather than polluting the
/// store
fn validate_message_pair(
    family: Family,
    query_type: u8,
    response_type: u8,
) -> Result<(), PerfmonError> {
    match family {
        Family::V4 => {
            use v4::MessageType::*;
            let resp = v4::MessageType::from(response_type);
            let ok = match v4::MessageType::from(query_type) {
                _ if query_type == NO_TYPE => {
                    response_type == NO_TYPE || matches!(resp, Offer | Ack | Nak)
                }
                Discover => response_type == NO_TYPE || matches!(resp, Offer | Nak),
                Request => response_type == NO_TYPE || matches!(resp, Ack | Nak),
                Inform => response_type == NO_TYPE || matches!(resp, Ack),
                other => {
                    return Err(PerfmonError::BadValue(format!(
                        "query type not supported by monitoring: {other}"
                    )));
                }
            };
            if ok {
                Ok(())
            } else {
                Err(PerfmonError::BadValue(format!(
                    "response type {} not valid for query type {}",
                    name_v4(response_type),
                    name_v4(query_type)
                )))
            }
        }
        Family::V6 => {
            use v6::MessageType::*;
            let resp = v6::MessageType::from(response_type);
            let ok = match v6::MessageType::from(query_type) {
                _ if query_type == NO_TYPE => {
                    response_type == NO_TYPE || matches!(resp, Advertise | Reply)
                }
                Solicit => response_type == NO_TYPE || matches!(resp, Advertise | Reply),
                Request | Renew | Rebind | Confirm => {
                    response_type == NO_TYPE || matches!(resp, Reply)
                }
                other => {
                    return Err(PerfmonError::BadValue(format!(
                        "query type not supported by monitoring: {other}"
                    )));
                }
            };
            if ok {
                Ok(())
            } else {
                Err(PerfmonError::BadValue(format!(
                    "response type {} not valid for query type {}",
                    name_v6(response_type),
                    name_v6(query_type)
                )))
            }
        }
    }
}

/// accumulated samples over one reporting interval
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationDataInterval {
    start_time: DateTime<Utc>,
    occurrences: u64,
    min: TimeDelta,
    max: TimeDelta,
    total: TimeDelta,
}

impl DurationDataInterval {
    pub fn new(start_time: DateTime<Utc>) -> Self {
        DurationDataInterval {
            start_time,
            occurrences: 0,
            min: TimeDelta::MAX,
            max: TimeDelta::MIN,
            total: TimeDelta::zero(),
        }
    }

    pub fn add_duration(&mut self, duration: TimeDelta) {
        self.occurrences += 1;
        if duration < self.min {
            self.min = duration;
        }
        if duration > self.max {
            self.max = duration;
        }
        self.total += duration;
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }
    pub fn occurrences(&self) -> u64 {
        self.occurrences
    }
    pub fn min(&self) -> TimeDelta {
        self.min
    }
    pub fn max(&self) -> TimeDelta {
        self.max
    }
    pub fn total(&self) -> TimeDelta {
        self.total
    }

    /// total / occurrences, or zero before the first sample
    pub fn average(&self) -> TimeDelta {
        if self.occurrences == 0 {
            return TimeDelta::zero();
        }
        self.total / self.occurrences as i32
    }
}

/// a duration key plus its current and previous intervals
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoredDuration {
    key: DurationKey,
    interval_duration: TimeDelta,
    current: Option<DurationDataInterval>,
    previous: Option<DurationDataInterval>,
}

impl MonitoredDuration {
    pub fn new(key: DurationKey, interval_duration: TimeDelta) -> Result<Self, PerfmonError> {
        if interval_duration <= TimeDelta::zero() {
            return Err(PerfmonError::BadValue(format!(
                "interval duration {interval_duration} is invalid, it must be greater than 0"
            )));
        }
        Ok(MonitoredDuration {
            key,
            interval_duration,
            current: None,
            previous: None,
        })
    }

    pub fn key(&self) -> &DurationKey {
        &self.key
    }
    pub fn interval_duration(&self) -> TimeDelta {
        self.interval_duration
    }
    pub fn current_interval(&self) -> Option<&DurationDataInterval> {
        self.current.as_ref()
    }
    pub fn previous_interval(&self) -> Option<&DurationDataInterval> {
        self.previous.as_ref()
    }

    /// record one sample at `now`. Returns true when the current interval
    /// elapsed and rotated out, meaning the previous interval is ready to
    /// report.
    pub fn add_sample_at(&mut self, now: DateTime<Utc>, sample: TimeDelta) -> bool {
        let mut report_due = false;
        match self.current {
            None => self.current = Some(DurationDataInterval::new(now)),
            Some(current) if (now - current.start_time()) > self.interval_duration => {
                self.previous = Some(current);
                report_due = true;
                self.current = Some(DurationDataInterval::new(now));
            }
            Some(_) => {}
        }
        // just set above when it was None
        self.current
            .as_mut()
            .expect("current interval exists")
            .add_duration(sample);
        report_due
    }

    /// record one sample at the current time
    pub fn add_sample(&mut self, sample: TimeDelta) -> bool {
        self.add_sample_at(Utc::now(), sample)
    }

    pub fn clear(&mut self) {
        self.current = None;
        self.previous = None;
    }
}

/// All monitored durations for one protocol family. Mutations serialize
/// on an internal lock; retrieval copies the record.
#[derive(Debug)]
pub struct MonitoredDurationStore {
    family: Family,
    interval_duration: TimeDelta,
    durations: Mutex<BTreeMap<DurationKey, MonitoredDuration>>,
}

impl MonitoredDurationStore {
    pub fn new(family: Family, interval_duration: TimeDelta) -> Result<Self, PerfmonError> {
        if interval_duration <= TimeDelta::zero() {
            return Err(PerfmonError::BadValue(format!(
                "invalid interval duration {interval_duration}, must be greater than zero"
            )));
        }
        Ok(MonitoredDurationStore {
            family,
            interval_duration,
            durations: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn family(&self) -> Family {
        self.family
    }

    fn check_family(&self, key: &DurationKey) -> Result<(), PerfmonError> {
        if key.family() != self.family {
            return Err(PerfmonError::BadValue(match self.family {
                Family::V4 => "cannot add v6 key to v4 store".to_owned(),
                Family::V6 => "cannot add v4 key to v6 store".to_owned(),
            }));
        }
        Ok(())
    }

    /// insert a new duration, optionally seeded with a first sample.
    /// Returns a copy of the stored record.
    pub fn add_duration(
        &self,
        key: DurationKey,
        sample: Option<TimeDelta>,
    ) -> Result<MonitoredDuration, PerfmonError> {
        self.check_family(&key)?;
        let mut mond = MonitoredDuration::new(key, self.interval_duration)?;
        if let Some(sample) = sample {
            mond.add_sample(sample);
        }
        let mut durations = self.durations.lock().expect("perfmon lock poisoned");
        if durations.contains_key(mond.key()) {
            return Err(PerfmonError::Duplicate(mond.key().to_string()));
        }
        durations.insert(mond.key().clone(), mond.clone());
        Ok(mond)
    }

    /// snapshot copy of one duration
    pub fn get_duration(&self, key: &DurationKey) -> Option<MonitoredDuration> {
        let durations = self.durations.lock().expect("perfmon lock poisoned");
        durations.get(key).cloned()
    }

    /// replace a stored duration with the caller's copy
    pub fn update_duration(&self, duration: &MonitoredDuration) -> Result<(), PerfmonError> {
        let mut durations = self.durations.lock().expect("perfmon lock poisoned");
        match durations.get_mut(duration.key()) {
            Some(existing) => {
                *existing = duration.clone();
                Ok(())
            }
            None => Err(PerfmonError::InvalidOperation(duration.key().to_string())),
        }
    }

    /// record a sample against a key, creating the duration lazily.
    /// Returns a snapshot when the sample caused a rotation (report due).
    pub fn add_duration_sample(
        &self,
        key: DurationKey,
        now: DateTime<Utc>,
        sample: TimeDelta,
    ) -> Result<Option<MonitoredDuration>, PerfmonError> {
        use std::collections::btree_map::Entry;
        self.check_family(&key)?;
        let mut durations = self.durations.lock().expect("perfmon lock poisoned");
        let mond = match durations.entry(key) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let mond = MonitoredDuration::new(entry.key().clone(), self.interval_duration)?;
                entry.insert(mond)
            }
        };
        if mond.add_sample_at(now, sample) {
            Ok(Some(mond.clone()))
        } else {
            Ok(None)
        }
    }

    pub fn delete_duration(&self, key: &DurationKey) {
        let mut durations = self.durations.lock().expect("perfmon lock poisoned");
        durations.remove(key);
    }

    /// snapshot copies of every duration, in key order
    pub fn get_all(&self) -> Vec<MonitoredDuration> {
        let durations = self.durations.lock().expect("perfmon lock poisoned");
        durations.values().cloned().collect()
    }

    /// retained from the original interface; callers use
    /// [`MonitoredDurationStore::delete_duration`] and
    /// [`MonitoredDurationStore::get_all`] instead
    pub fn clear(&self) -> Result<(), PerfmonError> {
        Err(PerfmonError::NotImplemented("clear"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(subnet: u32) -> DurationKey {
        DurationKey::new(
            Family::V4,
            u8::from(v4::MessageType::Discover),
            u8::from(v4::MessageType::Offer),
            "socket_received",
            "buffer_read",
            subnet,
        )
        .unwrap()
    }

    #[test]
    fn invalid_message_pairs_are_rejected() {
        // DISCOVER cannot produce ACK
        assert!(DurationKey::new(
            Family::V4,
            u8::from(v4::MessageType::Discover),
            u8::from(v4::MessageType::Ack),
            "a",
            "b",
            1
        )
        .is_err());
        // RELEASE is not monitored at all
        assert!(DurationKey::new(
            Family::V4,
            u8::from(v4::MessageType::Release),
            NO_TYPE,
            "a",
            "b",
            1
        )
        .is_err());
        // SOLICIT-REPLY is a valid v6 pair (rapid commit)
        assert!(DurationKey::new(
            Family::V6,
            u8::from(v6::MessageType::Solicit),
            u8::from(v6::MessageType::Reply),
            "a",
            "b",
            1
        )
        .is_ok());
    }

    #[test]
    fn interval_statistics() {
        let t0 = Utc::now();
        let mut interval = DurationDataInterval::new(t0);
        assert_eq!(interval.average(), TimeDelta::zero());
        interval.add_duration(TimeDelta::milliseconds(10));
        interval.add_duration(TimeDelta::milliseconds(30));
        assert_eq!(interval.occurrences(), 2);
        assert_eq!(interval.min(), TimeDelta::milliseconds(10));
        assert_eq!(interval.max(), TimeDelta::milliseconds(30));
        assert_eq!(interval.total(), TimeDelta::milliseconds(40));
        assert_eq!(interval.average(), TimeDelta::milliseconds(20));
    }

    #[test]
    fn rotation_summarizes_previous_interval() {
        // samples at t0+0.1s, t0+0.5s, t0+1.2s with a 1s interval: the
        // third sample rotates and the previous interval holds the first
        // two
        let t0 = Utc::now();
        let mut mond = MonitoredDuration::new(key(1), TimeDelta::seconds(1)).unwrap();

        let sample = TimeDelta::milliseconds(5);
        assert!(!mond.add_sample_at(t0 + TimeDelta::milliseconds(100), sample));
        assert!(!mond.add_sample_at(t0 + TimeDelta::milliseconds(500), sample));
        assert!(mond.add_sample_at(t0 + TimeDelta::milliseconds(1200), sample));

        assert_eq!(mond.previous_interval().unwrap().occurrences(), 2);
        assert_eq!(mond.current_interval().unwrap().occurrences(), 1);
    }

    #[test]
    fn store_rejects_duplicates_and_wrong_family() {
        let store = MonitoredDurationStore::new(Family::V4, TimeDelta::seconds(60)).unwrap();
        store.add_duration(key(1), None).unwrap();
        assert!(matches!(
            store.add_duration(key(1), None),
            Err(PerfmonError::Duplicate(_))
        ));

        let v6_key = DurationKey::new(
            Family::V6,
            u8::from(v6::MessageType::Solicit),
            u8::from(v6::MessageType::Advertise),
            "a",
            "b",
            1,
        )
        .unwrap();
        assert!(matches!(
            store.add_duration(v6_key, None),
            Err(PerfmonError::BadValue(_))
        ));
    }

    #[test]
    fn retrieval_is_a_snapshot() {
        let store = MonitoredDurationStore::new(Family::V4, TimeDelta::seconds(60)).unwrap();
        store
            .add_duration(key(1), Some(TimeDelta::milliseconds(3)))
            .unwrap();
        let snap = store.get_duration(&key(1)).unwrap();
        // mutate through the sampling path; snapshot must not change
        store
            .add_duration_sample(key(1), Utc::now(), TimeDelta::milliseconds(9))
            .unwrap();
        assert_eq!(snap.current_interval().unwrap().occurrences(), 1);
        let fresh = store.get_duration(&key(1)).unwrap();
        assert_eq!(fresh.current_interval().unwrap().occurrences(), 2);
    }

    #[test]
    fn lazy_sample_path_reports_rotation() {
        let store = MonitoredDurationStore::new(Family::V4, TimeDelta::seconds(1)).unwrap();
        let t0 = Utc::now();
        assert!(store
            .add_duration_sample(key(2), t0, TimeDelta::milliseconds(1))
            .unwrap()
            .is_none());
        let due = store
            .add_duration_sample(key(2), t0 + TimeDelta::seconds(2), TimeDelta::milliseconds(1))
            .unwrap();
        assert!(due.is_some());
        assert_eq!(due.unwrap().previous_interval().unwrap().occurrences(), 1);
    }

    #[test]
    fn clear_is_not_implemented() {
        let store = MonitoredDurationStore::new(Family::V4, TimeDelta::seconds(60)).unwrap();
        assert!(matches!(
            store.clear(),
            Err(PerfmonError::NotImplemented("clear"))
        ));
    }
}
