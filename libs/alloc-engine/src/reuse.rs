//! Lease reuse window. A renewal that arrives within a configured
//! fraction of the granted lease time is answered from this cache with
//! the remaining lifetime, skipping the store write entirely.
use std::{borrow::Borrow, hash::Hash, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;

#[derive(Debug)]
pub struct RenewThreshold<K: Eq + Hash> {
    percentage: u64,
    cache: DashMap<K, RenewExpiry>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RenewExpiry {
    /// when the lease was granted
    created: DateTime<Utc>,
    /// % * lease_time: how long the grant stays reusable
    window: Duration,
    /// full lease time granted
    lease_time: Duration,
}

impl RenewExpiry {
    fn new(now: DateTime<Utc>, lease_time: Duration, percentage: u64) -> Self {
        Self {
            window: Duration::from_secs((lease_time.as_secs() * percentage) / 100),
            created: now,
            lease_time,
        }
    }

    /// if the renewal falls inside the window, the lease time remaining
    fn get_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        if self.window.is_zero() {
            return None;
        }
        let elapsed = (now - self.created).to_std().ok()?;
        if elapsed <= self.window {
            Some(self.lease_time.saturating_sub(elapsed))
        } else {
            None
        }
    }
}

impl<K: Eq + Hash + Clone> RenewThreshold<K> {
    pub fn new(percentage: u32) -> Self {
        Self {
            percentage: u64::from(percentage),
            cache: DashMap::new(),
        }
    }

    /// record a fresh grant, replacing any existing entry
    pub fn insert(&self, id: K, lease_time: Duration, now: DateTime<Utc>) -> Option<RenewExpiry> {
        self.cache
            .insert(id, RenewExpiry::new(now, lease_time, self.percentage))
    }

    /// remaining lease time when the id is still inside its window
    pub fn threshold<Q>(&self, id: &Q, now: DateTime<Utc>) -> Option<Duration>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.cache
            .get(id)
            .map(|entry| *entry)
            .and_then(|entry| entry.get_remaining(now))
    }

    pub fn remove(&self, id: &K) -> Option<(K, RenewExpiry)> {
        self.cache.remove(id)
    }
}
