//! The in-memory lease table.
//!
//! One primary map per family plus explicit secondary index maps, all kept
//! in sync under a single writer lock. Reads clone the row out under a
//! shared lock, so callers never hold the lock across other work; writers
//! prove they saw the latest row by presenting their prior snapshot
//! (compare-and-replace).
use std::{
    collections::{BTreeMap, HashMap},
    net::{Ipv4Addr, Ipv6Addr},
    ops::Bound,
    path::Path,
    sync::{Mutex, RwLock},
};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::{
    Lease4, Lease6, LeaseState, LeaseType6, StoreError, SubnetId,
    memfile::{self, LeaseFile4, LeaseFile6},
};

#[derive(Debug, Default)]
struct Store4 {
    by_addr: BTreeMap<Ipv4Addr, Lease4>,
    by_client: HashMap<(Vec<u8>, SubnetId), Ipv4Addr>,
    by_hwaddr: HashMap<(Vec<u8>, SubnetId), Ipv4Addr>,
}

impl Store4 {
    fn index(&mut self, lease: &Lease4) {
        if let Some(id) = &lease.client_id {
            self.by_client
                .insert((id.clone(), lease.subnet_id), lease.addr);
        }
        if !lease.hwaddr.is_empty() {
            self.by_hwaddr
                .insert((lease.hwaddr.clone(), lease.subnet_id), lease.addr);
        }
    }

    fn unindex(&mut self, lease: &Lease4) {
        if let Some(id) = &lease.client_id {
            let key = (id.clone(), lease.subnet_id);
            if self.by_client.get(&key) == Some(&lease.addr) {
                self.by_client.remove(&key);
            }
        }
        if !lease.hwaddr.is_empty() {
            let key = (lease.hwaddr.clone(), lease.subnet_id);
            if self.by_hwaddr.get(&key) == Some(&lease.addr) {
                self.by_hwaddr.remove(&key);
            }
        }
    }
}

type Key6 = (LeaseType6, Ipv6Addr);

#[derive(Debug, Default)]
struct Store6 {
    by_addr: BTreeMap<Key6, Lease6>,
    by_duid: HashMap<(Vec<u8>, u32, SubnetId), Vec<Key6>>,
    by_subnet: HashMap<SubnetId, Vec<Key6>>,
}

impl Store6 {
    fn index(&mut self, lease: &Lease6) {
        let key = (lease.lease_type, lease.addr);
        let duid_key = (lease.duid.clone(), lease.iaid, lease.subnet_id);
        let keys = self.by_duid.entry(duid_key).or_default();
        if !keys.contains(&key) {
            keys.push(key);
        }
        let keys = self.by_subnet.entry(lease.subnet_id).or_default();
        if !keys.contains(&key) {
            keys.push(key);
        }
    }

    fn unindex(&mut self, lease: &Lease6) {
        let key = (lease.lease_type, lease.addr);
        let duid_key = (lease.duid.clone(), lease.iaid, lease.subnet_id);
        if let Some(keys) = self.by_duid.get_mut(&duid_key) {
            keys.retain(|k| k != &key);
            if keys.is_empty() {
                self.by_duid.remove(&duid_key);
            }
        }
        if let Some(keys) = self.by_subnet.get_mut(&lease.subnet_id) {
            keys.retain(|k| k != &key);
            if keys.is_empty() {
                self.by_subnet.remove(&lease.subnet_id);
            }
        }
    }
}

/// outcome of one reclamation sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimStats {
    /// v4 leases moved to EXPIRED_RECLAIMED this sweep
    pub reclaimed4: usize,
    /// v6 leases moved to EXPIRED_RECLAIMED this sweep
    pub reclaimed6: usize,
    /// expired leases left over after the batch limit was hit
    pub remaining: usize,
}

/// Concurrent lease table for both families, optionally journaled to
/// memfile CSVs.
#[derive(Debug, Default)]
pub struct LeaseStore {
    v4: RwLock<Store4>,
    v6: RwLock<Store6>,
    journal4: Option<Mutex<LeaseFile4>>,
    journal6: Option<Mutex<LeaseFile6>>,
}

impl LeaseStore {
    /// a purely in-memory store (tests, ephemeral servers)
    pub fn new() -> Self {
        Self::default()
    }

    /// open (or create) memfile journals and replay them into memory
    pub fn with_memfile<P: AsRef<Path>>(
        path4: P,
        path6: P,
    ) -> Result<Self, memfile::MemfileError> {
        let (file4, leases4) = LeaseFile4::open(path4.as_ref())?;
        let (file6, leases6) = LeaseFile6::open(path6.as_ref())?;
        let store = LeaseStore {
            v4: RwLock::default(),
            v6: RwLock::default(),
            journal4: Some(Mutex::new(file4)),
            journal6: Some(Mutex::new(file6)),
        };
        {
            let mut v4 = store.v4.write().expect("lease store lock poisoned");
            for lease in leases4 {
                v4.index(&lease);
                v4.by_addr.insert(lease.addr, lease);
            }
            let mut v6 = store.v6.write().expect("lease store lock poisoned");
            for lease in leases6 {
                v6.index(&lease);
                v6.by_addr.insert((lease.lease_type, lease.addr), lease);
            }
        }
        debug!("lease store loaded from memfile");
        Ok(store)
    }

    fn journal4(&self, lease: &Lease4) {
        if let Some(journal) = &self.journal4 {
            let mut journal = journal.lock().expect("journal lock poisoned");
            if let Err(err) = journal.append(lease) {
                warn!(?err, addr = %lease.addr, "failed to journal v4 lease");
            }
        }
    }

    fn journal6(&self, lease: &Lease6) {
        if let Some(journal) = &self.journal6 {
            let mut journal = journal.lock().expect("journal lock poisoned");
            if let Err(err) = journal.append(lease) {
                warn!(?err, addr = %lease.addr, "failed to journal v6 lease");
            }
        }
    }

    // ---- v4 ----

    /// insert a new lease. The primary key (address) must be free.
    pub fn add(&self, lease: Lease4) -> Result<(), StoreError> {
        let mut v4 = self.v4.write().expect("lease store lock poisoned");
        if v4.by_addr.contains_key(&lease.addr) {
            return Err(StoreError::Duplicate(lease.addr.into()));
        }
        v4.index(&lease);
        self.journal4(&lease);
        v4.by_addr.insert(lease.addr, lease);
        Ok(())
    }

    pub fn get_by_address(&self, addr: Ipv4Addr) -> Option<Lease4> {
        let v4 = self.v4.read().expect("lease store lock poisoned");
        v4.by_addr.get(&addr).cloned()
    }

    pub fn get_by_client_id(&self, client_id: &[u8], subnet_id: SubnetId) -> Option<Lease4> {
        let v4 = self.v4.read().expect("lease store lock poisoned");
        let addr = v4.by_client.get(&(client_id.to_vec(), subnet_id))?;
        v4.by_addr.get(addr).cloned()
    }

    pub fn get_by_hwaddr(&self, hwaddr: &[u8], subnet_id: SubnetId) -> Option<Lease4> {
        let v4 = self.v4.read().expect("lease store lock poisoned");
        let addr = v4.by_hwaddr.get(&(hwaddr.to_vec(), subnet_id))?;
        v4.by_addr.get(addr).cloned()
    }

    /// compare-and-replace. The caller presents the snapshot it read; if
    /// the stored row has changed since, the update is refused with
    /// `Conflict` and the caller re-reads. This is what makes a re-read
    /// after a hook callout safe.
    pub fn update(&self, prior: &Lease4, new: Lease4) -> Result<(), StoreError> {
        if prior.addr != new.addr {
            return Err(StoreError::BadValue(
                "update cannot change the lease address".into(),
            ));
        }
        if new.cltt < prior.cltt {
            return Err(StoreError::BadValue("cltt must not move backwards".into()));
        }
        let mut v4 = self.v4.write().expect("lease store lock poisoned");
        let current = v4
            .by_addr
            .get(&new.addr)
            .ok_or(StoreError::NotFound(new.addr.into()))?;
        if current != prior {
            return Err(StoreError::Conflict(new.addr.into()));
        }
        let old = current.clone();
        v4.unindex(&old);
        v4.index(&new);
        self.journal4(&new);
        v4.by_addr.insert(new.addr, new);
        Ok(())
    }

    pub fn delete_by_address(&self, addr: Ipv4Addr) -> Result<Lease4, StoreError> {
        let mut v4 = self.v4.write().expect("lease store lock poisoned");
        let lease = v4
            .by_addr
            .remove(&addr)
            .ok_or(StoreError::NotFound(addr.into()))?;
        v4.unindex(&lease);
        if let Some(journal) = &self.journal4 {
            let mut journal = journal.lock().expect("journal lock poisoned");
            if let Err(err) = journal.append_delete(&lease) {
                warn!(?err, %addr, "failed to journal v4 lease delete");
            }
        }
        Ok(lease)
    }

    /// bound leases whose expire time is at or before `before`, ascending
    /// by expire time
    pub fn expired_leases(&self, before: DateTime<Utc>, limit: usize) -> Vec<Lease4> {
        let v4 = self.v4.read().expect("lease store lock poisoned");
        let mut expired: Vec<Lease4> = v4
            .by_addr
            .values()
            .filter(|l| l.state == LeaseState::Default && l.expire_time() <= before)
            .cloned()
            .collect();
        expired.sort_by_key(Lease4::expire_time);
        expired.truncate(limit);
        expired
    }

    /// page through the address index. `last` is the final key of the
    /// previous page, `None` for the first page.
    pub fn iter_page(&self, last: Option<Ipv4Addr>, limit: usize) -> Vec<Lease4> {
        let v4 = self.v4.read().expect("lease store lock poisoned");
        let lower = match last {
            Some(addr) => Bound::Excluded(addr),
            None => Bound::Unbounded,
        };
        v4.by_addr
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(_, l)| l.clone())
            .collect()
    }

    /// Move up to `batch` expired leases (both families) to
    /// EXPIRED_RECLAIMED. Invoked by a periodic timer; the caller feeds
    /// the returned counts into statistics and decides whether the
    /// remaining backlog warrants declined-lease recovery.
    pub fn reclaim_expired(&self, now: DateTime<Utc>, batch: usize) -> ReclaimStats {
        let mut stats = ReclaimStats::default();
        {
            let mut v4 = self.v4.write().expect("lease store lock poisoned");
            let mut expired: Vec<Ipv4Addr> = v4
                .by_addr
                .values()
                .filter(|l| l.state == LeaseState::Default && l.is_expired(now))
                .map(|l| (l.expire_time(), l.addr))
                .collect::<std::collections::BTreeSet<_>>()
                .into_iter()
                .map(|(_, addr)| addr)
                .collect();
            if expired.len() > batch {
                stats.remaining += expired.len() - batch;
                expired.truncate(batch);
            }
            for addr in expired {
                if let Some(lease) = v4.by_addr.get_mut(&addr) {
                    lease.state = LeaseState::ExpiredReclaimed;
                    let snapshot = lease.clone();
                    self.journal4(&snapshot);
                    stats.reclaimed4 += 1;
                }
            }
        }
        {
            let mut v6 = self.v6.write().expect("lease store lock poisoned");
            let mut expired: Vec<Key6> = v6
                .by_addr
                .values()
                .filter(|l| l.state == LeaseState::Default && l.is_expired(now))
                .map(|l| (l.expire_time(), (l.lease_type, l.addr)))
                .collect::<std::collections::BTreeSet<_>>()
                .into_iter()
                .map(|(_, key)| key)
                .collect();
            if expired.len() > batch.saturating_sub(stats.reclaimed4) {
                let keep = batch.saturating_sub(stats.reclaimed4);
                stats.remaining += expired.len() - keep;
                expired.truncate(keep);
            }
            for key in expired {
                if let Some(lease) = v6.by_addr.get_mut(&key) {
                    lease.state = LeaseState::ExpiredReclaimed;
                    let snapshot = lease.clone();
                    self.journal6(&snapshot);
                    stats.reclaimed6 += 1;
                }
            }
        }
        stats
    }

    /// free declined leases whose probation has elapsed. Returns how many
    /// were recovered.
    pub fn recover_declined(&self, now: DateTime<Utc>) -> usize {
        let mut recovered = 0;
        let mut v4 = self.v4.write().expect("lease store lock poisoned");
        let done: Vec<Ipv4Addr> = v4
            .by_addr
            .values()
            .filter(|l| l.state == LeaseState::Declined && l.is_expired(now))
            .map(|l| l.addr)
            .collect();
        for addr in done {
            if let Some(lease) = v4.by_addr.get_mut(&addr) {
                lease.state = LeaseState::ExpiredReclaimed;
                // a decline wiped the client binding; make sure no index
                // entry outlives it
                let snapshot = lease.clone();
                v4.unindex(&snapshot);
                self.journal4(&snapshot);
                recovered += 1;
            }
        }
        recovered
    }

    pub fn len4(&self) -> usize {
        let v4 = self.v4.read().expect("lease store lock poisoned");
        v4.by_addr.len()
    }

    // ---- v6 ----

    pub fn add6(&self, lease: Lease6) -> Result<(), StoreError> {
        let mut v6 = self.v6.write().expect("lease store lock poisoned");
        let key = (lease.lease_type, lease.addr);
        if v6.by_addr.contains_key(&key) {
            return Err(StoreError::Duplicate(lease.addr.into()));
        }
        v6.index(&lease);
        self.journal6(&lease);
        v6.by_addr.insert(key, lease);
        Ok(())
    }

    pub fn get_by_address6(&self, lease_type: LeaseType6, addr: Ipv6Addr) -> Option<Lease6> {
        let v6 = self.v6.read().expect("lease store lock poisoned");
        v6.by_addr.get(&(lease_type, addr)).cloned()
    }

    /// every lease bound to (duid, iaid) within a subnet
    pub fn get_by_duid(&self, duid: &[u8], iaid: u32, subnet_id: SubnetId) -> Vec<Lease6> {
        let v6 = self.v6.read().expect("lease store lock poisoned");
        match v6.by_duid.get(&(duid.to_vec(), iaid, subnet_id)) {
            Some(keys) => keys
                .iter()
                .filter_map(|k| v6.by_addr.get(k).cloned())
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn leases_by_subnet6(&self, subnet_id: SubnetId) -> Vec<Lease6> {
        let v6 = self.v6.read().expect("lease store lock poisoned");
        match v6.by_subnet.get(&subnet_id) {
            Some(keys) => keys
                .iter()
                .filter_map(|k| v6.by_addr.get(k).cloned())
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn update6(&self, prior: &Lease6, new: Lease6) -> Result<(), StoreError> {
        if prior.addr != new.addr || prior.lease_type != new.lease_type {
            return Err(StoreError::BadValue(
                "update cannot change the lease address".into(),
            ));
        }
        if new.cltt < prior.cltt {
            return Err(StoreError::BadValue("cltt must not move backwards".into()));
        }
        let mut v6 = self.v6.write().expect("lease store lock poisoned");
        let key = (new.lease_type, new.addr);
        let current = v6
            .by_addr
            .get(&key)
            .ok_or(StoreError::NotFound(new.addr.into()))?;
        if current != prior {
            return Err(StoreError::Conflict(new.addr.into()));
        }
        let old = current.clone();
        v6.unindex(&old);
        v6.index(&new);
        self.journal6(&new);
        v6.by_addr.insert(key, new);
        Ok(())
    }

    pub fn delete6(&self, lease_type: LeaseType6, addr: Ipv6Addr) -> Result<Lease6, StoreError> {
        let mut v6 = self.v6.write().expect("lease store lock poisoned");
        let lease = v6
            .by_addr
            .remove(&(lease_type, addr))
            .ok_or(StoreError::NotFound(addr.into()))?;
        v6.unindex(&lease);
        if let Some(journal) = &self.journal6 {
            let mut journal = journal.lock().expect("journal lock poisoned");
            if let Err(err) = journal.append_delete(&lease) {
                warn!(?err, %addr, "failed to journal v6 lease delete");
            }
        }
        Ok(lease)
    }

    pub fn len6(&self) -> usize {
        let v6 = self.v6.read().expect("lease store lock poisoned");
        v6.by_addr.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn lease(addr: [u8; 4], client: &[u8]) -> Lease4 {
        Lease4::new(addr.into(), &[0xaa, 0xbb, 0xcc, 0, 0, 1], Some(client), 1, 4000, Utc::now())
    }

    #[test]
    fn add_then_lookup_by_every_index() {
        let store = LeaseStore::new();
        store.add(lease([192, 0, 2, 100], &[1, 2, 3])).unwrap();

        assert!(store.get_by_address([192, 0, 2, 100].into()).is_some());
        assert!(store.get_by_client_id(&[1, 2, 3], 1).is_some());
        assert!(store.get_by_hwaddr(&[0xaa, 0xbb, 0xcc, 0, 0, 1], 1).is_some());
        // wrong subnet misses
        assert!(store.get_by_client_id(&[1, 2, 3], 2).is_none());
    }

    #[test]
    fn duplicate_address_is_refused() {
        let store = LeaseStore::new();
        store.add(lease([192, 0, 2, 100], &[1])).unwrap();
        assert!(matches!(
            store.add(lease([192, 0, 2, 100], &[2])),
            Err(StoreError::Duplicate(_))
        ));
        assert_eq!(store.len4(), 1);
    }

    #[test]
    fn stale_snapshot_conflicts() {
        let store = LeaseStore::new();
        store.add(lease([192, 0, 2, 100], &[1])).unwrap();

        let snap_a = store.get_by_address([192, 0, 2, 100].into()).unwrap();
        let snap_b = snap_a.clone();

        let mut renewed = snap_a.clone();
        renewed.cltt += TimeDelta::seconds(10);
        store.update(&snap_a, renewed).unwrap();

        // second writer's snapshot is stale now
        let mut renewed = snap_b.clone();
        renewed.cltt += TimeDelta::seconds(20);
        assert!(matches!(
            store.update(&snap_b, renewed),
            Err(StoreError::Conflict(_))
        ));
    }

    #[test]
    fn cltt_never_moves_backwards() {
        let store = LeaseStore::new();
        store.add(lease([192, 0, 2, 100], &[1])).unwrap();
        let snap = store.get_by_address([192, 0, 2, 100].into()).unwrap();
        let mut rewound = snap.clone();
        rewound.cltt -= TimeDelta::seconds(5);
        assert!(matches!(
            store.update(&snap, rewound),
            Err(StoreError::BadValue(_))
        ));
    }

    #[test]
    fn update_moves_secondary_indexes() {
        let store = LeaseStore::new();
        store.add(lease([192, 0, 2, 100], &[1])).unwrap();
        let snap = store.get_by_address([192, 0, 2, 100].into()).unwrap();
        let mut reassigned = snap.clone();
        reassigned.client_id = Some(vec![9, 9]);
        reassigned.cltt += TimeDelta::seconds(1);
        store.update(&snap, reassigned).unwrap();

        assert!(store.get_by_client_id(&[1], 1).is_none());
        assert!(store.get_by_client_id(&[9, 9], 1).is_some());
    }

    #[test]
    fn expired_leases_ordered_and_limited() {
        let store = LeaseStore::new();
        let now = Utc::now();
        for (i, age) in [40u32, 10, 30].iter().enumerate() {
            let mut l = lease([192, 0, 2, 100 + i as u8], &[i as u8]);
            l.valid_lifetime = 1;
            l.cltt = now - TimeDelta::seconds(i64::from(*age));
            store.add(l).unwrap();
        }
        let expired = store.expired_leases(now, 2);
        assert_eq!(expired.len(), 2);
        // oldest expiry first: ages 40 then 30
        assert_eq!(expired[0].addr, Ipv4Addr::from([192, 0, 2, 100]));
        assert_eq!(expired[1].addr, Ipv4Addr::from([192, 0, 2, 102]));
    }

    #[test]
    fn iter_page_walks_the_address_index() {
        let store = LeaseStore::new();
        for i in 0..5u8 {
            store.add(lease([192, 0, 2, 100 + i], &[i])).unwrap();
        }
        let page1 = store.iter_page(None, 2);
        assert_eq!(page1.len(), 2);
        let page2 = store.iter_page(Some(page1[1].addr), 2);
        assert_eq!(page2[0].addr, Ipv4Addr::from([192, 0, 2, 102]));
        let page3 = store.iter_page(Some(page2[1].addr), 10);
        assert_eq!(page3.len(), 1);
    }

    #[test]
    fn reclaim_respects_batch_and_reports_backlog() {
        let store = LeaseStore::new();
        let now = Utc::now();
        for i in 0..4u8 {
            let mut l = lease([192, 0, 2, 100 + i], &[i]);
            l.valid_lifetime = 1;
            l.cltt = now - TimeDelta::seconds(60);
            store.add(l).unwrap();
        }
        let stats = store.reclaim_expired(now, 3);
        assert_eq!(stats.reclaimed4, 3);
        assert_eq!(stats.remaining, 1);

        let stats = store.reclaim_expired(now, 10);
        assert_eq!(stats.reclaimed4, 1);
        assert_eq!(stats.remaining, 0);
    }

    #[test]
    fn declined_recovery_waits_for_probation() {
        let store = LeaseStore::new();
        let now = Utc::now();
        let mut declined = lease([192, 0, 2, 100], &[1]);
        declined.state = LeaseState::Declined;
        declined.valid_lifetime = 60; // probation window
        declined.cltt = now;
        store.add(declined).unwrap();

        assert_eq!(store.recover_declined(now), 0);
        assert_eq!(
            store.recover_declined(now + TimeDelta::seconds(61)),
            1
        );
        let lease = store.get_by_address([192, 0, 2, 100].into()).unwrap();
        assert_eq!(lease.state, LeaseState::ExpiredReclaimed);
    }

    #[test]
    fn v6_duid_index_holds_multiple_leases() {
        let store = LeaseStore::new();
        let duid = [0, 3, 0, 1, 1, 2, 3, 4, 5, 6];
        store
            .add6(Lease6::new_addr(
                "2001:db8::100".parse().unwrap(),
                &duid,
                1,
                7,
                3000,
                4000,
                Utc::now(),
            ))
            .unwrap();
        let mut pd = Lease6::new_addr("2001:db8:100::".parse().unwrap(), &duid, 1, 7, 3000, 4000, Utc::now());
        pd.lease_type = LeaseType6::IaPd;
        pd.prefix_len = 56;
        store.add6(pd).unwrap();

        let bound = store.get_by_duid(&duid, 1, 7);
        assert_eq!(bound.len(), 2);
        assert_eq!(store.leases_by_subnet6(7).len(), 2);

        store
            .delete6(LeaseType6::IaNa, "2001:db8::100".parse().unwrap())
            .unwrap();
        assert_eq!(store.get_by_duid(&duid, 1, 7).len(), 1);
    }
}
