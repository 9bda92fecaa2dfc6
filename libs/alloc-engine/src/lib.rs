//! # alloc-engine
//!
//! Chooses an address for a client within a subnet. The order of
//! preference: a host reservation, the client's existing lease, the
//! client's requested address, then the first free address found by
//! scanning the subnet's pools in declared order from a last-allocated
//! cursor. Declined addresses stay quarantined until their probation
//! elapses; allocation failures surface as `NoAddressAvailable`, never as
//! a dropped packet.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::too_many_arguments)]

use std::{net::Ipv4Addr, net::Ipv6Addr, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, trace};

use config::{LeaseTime, v4::Network, v6::Network as Network6};
use hosts::Reservation;
use lease_store::{Lease4, Lease6, LeaseState, LeaseStore, StoreError, SubnetId};

mod reuse;
pub use reuse::RenewThreshold;

/// how long an un-acked offer holds its address
pub const OFFER_TIME: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum AllocError {
    /// every pool the client may use is exhausted
    #[error("no address available in subnet {0}")]
    NoAddressAvailable(SubnetId),
    /// the specific address asked for cannot be granted
    #[error("address {0} is not available")]
    AddressUnavailable(Ipv4Addr),
    /// the specific v6 address asked for cannot be granted
    #[error("address {0} is not available")]
    AddressUnavailable6(Ipv6Addr),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// the identifiers a v4 query presents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client4 {
    pub hwaddr: Vec<u8>,
    pub client_id: Option<Vec<u8>>,
}

impl Client4 {
    pub fn new(hwaddr: &[u8], client_id: Option<&[u8]>) -> Self {
        Client4 {
            hwaddr: hwaddr.to_vec(),
            client_id: client_id.map(<[u8]>::to_vec),
        }
    }

    /// the bytes clients are keyed on: client id when present, chaddr
    /// otherwise
    pub fn key(&self) -> &[u8] {
        self.client_id.as_deref().unwrap_or(&self.hwaddr)
    }
}

/// a granted (or reused) binding
#[derive(Debug, Clone, PartialEq)]
pub struct Grant {
    pub addr: Ipv4Addr,
    /// (lease, renew, rebind) to put on the wire
    pub times: (Duration, Duration, Duration),
    /// true when the grant was served from the reuse window with no
    /// store write
    pub reused: bool,
}

#[derive(Debug)]
pub struct AllocEngine {
    store: Arc<LeaseStore>,
    renew_cache: Option<RenewThreshold<Vec<u8>>>,
    /// last allocated address per (subnet, pool index); a scan hint, not
    /// a guarantee
    cursors: DashMap<(SubnetId, usize), Ipv4Addr>,
    cursors6: DashMap<(SubnetId, usize), Ipv6Addr>,
}

impl AllocEngine {
    pub fn new(store: Arc<LeaseStore>, cache_threshold: Option<u32>) -> Self {
        AllocEngine {
            store,
            renew_cache: cache_threshold.map(RenewThreshold::new),
            cursors: DashMap::new(),
            cursors6: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<LeaseStore> {
        &self.store
    }

    fn cache_threshold(&self, key: &[u8], now: DateTime<Utc>) -> Option<Duration> {
        self.renew_cache
            .as_ref()
            .and_then(|cache| cache.threshold(key, now))
    }

    fn cache_insert(&self, key: &[u8], lease_time: Duration, now: DateTime<Utc>) {
        if let Some(cache) = &self.renew_cache {
            let old = cache.insert(key.to_vec(), lease_time, now);
            trace!(?old, "replacing old renewal window entry");
        }
    }

    fn cache_remove(&self, key: &[u8]) {
        if let Some(cache) = &self.renew_cache {
            cache.remove(&key.to_vec());
        }
    }

    /// can this client take `addr` right now?
    fn addr_usable(&self, addr: Ipv4Addr, client: &Client4, now: DateTime<Utc>) -> bool {
        match self.store.get_by_address(addr) {
            None => true,
            Some(lease) => lease.matches_client(&client.hwaddr, client.client_id.as_deref())
                || lease.is_available(now),
        }
    }

    /// the anti-flap rule: when reusing a lapsed lease, skip it if its
    /// prior holder still has an address in active decline quarantine in
    /// this subnet
    fn prior_holder_declined(&self, prior: &Lease4, now: DateTime<Utc>) -> bool {
        let held = match &prior.client_id {
            Some(id) => self.store.get_by_client_id(id, prior.subnet_id),
            None if !prior.hwaddr.is_empty() => {
                self.store.get_by_hwaddr(&prior.hwaddr, prior.subnet_id)
            }
            None => None,
        };
        matches!(held, Some(other) if other.state == LeaseState::Declined && !other.is_expired(now))
    }

    /// write (or overwrite) the binding for `addr`
    fn grant(
        &self,
        network: &Network,
        client: &Client4,
        addr: Ipv4Addr,
        lease_time: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), AllocError> {
        let mut fresh = Lease4::new(
            addr,
            &client.hwaddr,
            client.client_id.as_deref(),
            network.subnet_id(),
            lease_time.as_secs() as u32,
            now,
        );
        match self.store.get_by_address(addr) {
            None => Ok(self.store.add(fresh)?),
            Some(prior) => {
                // cltt only moves forward
                if fresh.cltt < prior.cltt {
                    fresh.cltt = prior.cltt;
                }
                Ok(self.store.update(&prior, fresh)?)
            }
        }
    }

    /// Find and hold an address for a DISCOVER. `commit` grants the full
    /// lease time (rapid commit); otherwise the address is held for
    /// [`OFFER_TIME`] pending the REQUEST.
    pub fn offer(
        &self,
        network: &Network,
        client: &Client4,
        requested: Option<Ipv4Addr>,
        classes: Option<&[String]>,
        reservation: Option<&Reservation>,
        requested_lease: Option<Duration>,
        commit: bool,
        now: DateTime<Utc>,
    ) -> Result<Grant, AllocError> {
        self.offer_inner(
            network,
            client,
            requested,
            classes,
            reservation,
            requested_lease,
            commit,
            true,
            now,
        )
    }

    /// Candidate selection only: everything [`AllocEngine::offer`] does
    /// except the store write. Used when a callout gets to veto the write
    /// after seeing the candidate.
    pub fn select_candidate(
        &self,
        network: &Network,
        client: &Client4,
        requested: Option<Ipv4Addr>,
        classes: Option<&[String]>,
        reservation: Option<&Reservation>,
        requested_lease: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<Grant, AllocError> {
        self.offer_inner(
            network,
            client,
            requested,
            classes,
            reservation,
            requested_lease,
            false,
            false,
            now,
        )
    }

    fn offer_inner(
        &self,
        network: &Network,
        client: &Client4,
        requested: Option<Ipv4Addr>,
        classes: Option<&[String]>,
        reservation: Option<&Reservation>,
        requested_lease: Option<Duration>,
        commit: bool,
        write: bool,
        now: DateTime<Utc>,
    ) -> Result<Grant, AllocError> {
        // the times advertised on the wire are the full lease; without
        // rapid commit the store only holds the address for OFFER_TIME
        // pending the REQUEST
        let granted = |lease: &LeaseTime| -> (Duration, Duration, Duration) {
            lease.determine_lease(requested_lease)
        };
        let hold = |times: (Duration, Duration, Duration)| -> Duration {
            if commit { times.0 } else { OFFER_TIME }
        };

        // 1. a reservation wins when its address is free or already this
        //    client's
        if let Some(addr) = reservation.and_then(Reservation::v4_address) {
            if self.addr_usable(addr, client, now) {
                let lease = network
                    .pool_for(addr, classes)
                    .map(|pool| *pool.lease())
                    .unwrap_or_default();
                let times = granted(&lease);
                if write {
                    self.grant(network, client, addr, hold(times), now)?;
                }
                debug!(%addr, "offering reserved address");
                return Ok(Grant { addr, times, reused: false });
            }
            debug!(%addr, "reserved address is held by another client");
        }

        // 2. the client's existing lease in this subnet is renewable
        let existing = client
            .client_id
            .as_deref()
            .and_then(|id| self.store.get_by_client_id(id, network.subnet_id()))
            .or_else(|| self.store.get_by_hwaddr(&client.hwaddr, network.subnet_id()));
        if let Some(lease) = existing {
            if lease.state != LeaseState::Declined && network.pool_for(lease.addr, classes).is_some()
            {
                let addr = lease.addr;
                let pool = network.pool_for(addr, classes).expect("pool checked above");
                let times = granted(pool.lease());
                if write {
                    self.grant(network, client, addr, hold(times), now)?;
                }
                debug!(%addr, "offering the client its existing lease");
                return Ok(Grant { addr, times, reused: false });
            }
        }

        // 3. the requested address, when in pool and free
        if let Some(addr) = requested {
            if let Some(pool) = network.pool_for(addr, classes) {
                if self.addr_usable(addr, client, now) {
                    let times = granted(pool.lease());
                    if write {
                        self.grant(network, client, addr, hold(times), now)?;
                    }
                    debug!(%addr, "offering the requested address");
                    return Ok(Grant { addr, times, reused: false });
                }
            }
        }

        // 4. scan pools in declared order from the cursor hint
        for (pool_idx, pool) in network.pools().iter().enumerate() {
            if !network
                .pools_with_class(classes)
                .any(|candidate| std::ptr::eq(candidate, pool))
            {
                continue;
            }
            let cursor_key = (network.subnet_id(), pool_idx);
            let hint = self.cursors.get(&cursor_key).map(|cursor| *cursor);
            if let Some(addr) = self.scan_pool(pool, hint, client, now) {
                let times = granted(pool.lease());
                if write {
                    self.grant(network, client, addr, hold(times), now)?;
                    self.cursors.insert(cursor_key, addr);
                }
                debug!(%addr, pool = ?pool.addrs(), "offering first free address");
                return Ok(Grant { addr, times, reused: false });
            }
        }

        debug!(subnet = %network.subnet(), "pool exhaustion");
        Err(AllocError::NoAddressAvailable(network.subnet_id()))
    }

    /// linear scan starting past the hint, wrapping to the pool start
    fn scan_pool(
        &self,
        pool: &config::v4::Pool,
        hint: Option<Ipv4Addr>,
        client: &Client4,
        now: DateTime<Utc>,
    ) -> Option<Ipv4Addr> {
        let usable = |addr: Ipv4Addr| -> bool {
            match self.store.get_by_address(addr) {
                None => true,
                Some(lease) => {
                    lease.is_available(now) && !self.prior_holder_declined(&lease, now)
                }
            }
        };
        if let Some(hint) = hint.filter(|hint| pool.contains(*hint)) {
            let found = pool
                .iter()
                .skip_while(|addr| *addr <= hint)
                .find(|addr| usable(*addr));
            if found.is_some() {
                return found;
            }
        }
        pool.iter().find(|addr| usable(*addr))
    }

    /// Commit a full lease for a REQUEST (or renewal). A renewal inside
    /// the reuse window comes back with `reused` set and writes nothing.
    pub fn commit(
        &self,
        network: &Network,
        client: &Client4,
        addr: Ipv4Addr,
        classes: Option<&[String]>,
        requested_lease: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<Grant, AllocError> {
        let pool = network
            .pool_for(addr, classes)
            .ok_or(AllocError::AddressUnavailable(addr))?;

        if let Some(remaining) = self.cache_threshold(client.key(), now) {
            debug!(%addr, "renewal inside the reuse window, serving cached lease");
            return Ok(Grant {
                addr,
                times: (remaining, config::renew(remaining), config::rebind(remaining)),
                reused: true,
            });
        }

        let times = pool.lease().determine_lease(requested_lease);
        match self.store.get_by_address(addr) {
            Some(lease)
                if lease.matches_client(&client.hwaddr, client.client_id.as_deref())
                    || lease.is_available(now) =>
            {
                self.grant(network, client, addr, times.0, now)?;
            }
            Some(_) => return Err(AllocError::AddressUnavailable(addr)),
            // no prior offer. An authoritative server takes the client
            // at its word; anyone else stays silent.
            None if network.authoritative() => {
                self.grant(network, client, addr, times.0, now)?;
            }
            None => return Err(AllocError::AddressUnavailable(addr)),
        }
        self.cache_insert(client.key(), times.0, now);
        Ok(Grant {
            addr,
            times,
            reused: false,
        })
    }

    /// RELEASE: mark the binding released when it belongs to this client.
    /// Returns the prior lease when one was released.
    pub fn release(
        &self,
        client: &Client4,
        addr: Ipv4Addr,
        now: DateTime<Utc>,
    ) -> Result<Option<Lease4>, AllocError> {
        let prior = match self.store.get_by_address(addr) {
            Some(lease) if lease.matches_client(&client.hwaddr, client.client_id.as_deref()) => {
                lease
            }
            _ => return Ok(None),
        };
        let mut released = prior.clone();
        released.state = LeaseState::Released;
        released.cltt = released.cltt.max(now);
        self.store.update(&prior, released)?;
        self.cache_remove(client.key());
        Ok(Some(prior))
    }

    /// DECLINE: quarantine the address for `probation`. The client
    /// binding is wiped; the address is unavailable until the probation
    /// elapses.
    pub fn decline(
        &self,
        client: &Client4,
        addr: Ipv4Addr,
        probation: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), AllocError> {
        let prior = match self.store.get_by_address(addr) {
            Some(lease) if lease.matches_client(&client.hwaddr, client.client_id.as_deref()) => {
                lease
            }
            Some(_) | None => return Err(AllocError::AddressUnavailable(addr)),
        };
        // the identifiers stay on the record for the anti-flap check, but
        // a declined lease never matches a client again
        let mut declined = prior.clone();
        declined.state = LeaseState::Declined;
        declined.valid_lifetime = probation.as_secs() as u32;
        declined.cltt = prior.cltt.max(now);
        self.store.update(&prior, declined)?;
        self.cache_remove(client.key());
        debug!(%addr, ?probation, "address declined, probation set");
        Ok(())
    }

    // ---- v6 ----

    /// can this (duid, iaid) take `addr` right now?
    fn addr_usable6(&self, addr: Ipv6Addr, duid: &[u8], iaid: u32, now: DateTime<Utc>) -> bool {
        match self
            .store
            .get_by_address6(lease_store::LeaseType6::IaNa, addr)
        {
            None => true,
            Some(lease) => lease.matches_client(duid, iaid) || lease.is_available(now),
        }
    }

    /// write the binding. The stored row holds only [`OFFER_TIME`] when
    /// the grant is advisory (SOLICIT without rapid commit); the returned
    /// lease always carries the lifetimes to advertise.
    fn grant6(
        &self,
        network: &Network6,
        duid: &[u8],
        iaid: u32,
        addr: Ipv6Addr,
        commit: bool,
        now: DateTime<Utc>,
    ) -> Result<Lease6, AllocError> {
        let mut fresh = Lease6::new_addr(
            addr,
            duid,
            iaid,
            network.subnet_id(),
            network.preferred_lifetime(),
            network.valid_lifetime(),
            now,
        );
        let mut stored = fresh.clone();
        if !commit {
            stored.valid_lifetime = OFFER_TIME.as_secs() as u32;
            stored.preferred_lifetime = stored.preferred_lifetime.min(stored.valid_lifetime);
        }
        match self
            .store
            .get_by_address6(lease_store::LeaseType6::IaNa, addr)
        {
            None => self.store.add6(stored)?,
            Some(prior) => {
                if stored.cltt < prior.cltt {
                    stored.cltt = prior.cltt;
                    fresh.cltt = prior.cltt;
                }
                self.store.update6(&prior, stored)?;
            }
        }
        Ok(fresh)
    }

    /// allocate (SOLICIT/REQUEST) or extend (RENEW/REBIND) an IA_NA
    /// address. `commit` is false only for a SOLICIT without rapid
    /// commit, where the address is held but not yet leased.
    pub fn allocate6(
        &self,
        network: &Network6,
        duid: &[u8],
        iaid: u32,
        requested: Option<Ipv6Addr>,
        reservation: Option<&Reservation>,
        commit: bool,
        now: DateTime<Utc>,
    ) -> Result<Lease6, AllocError> {
        // reservation first
        if let Some(addr) = reservation.and_then(Reservation::v6_address) {
            if self.addr_usable6(addr, duid, iaid, now) {
                debug!(%addr, "granting reserved v6 address");
                return self.grant6(network, duid, iaid, addr, commit, now);
            }
        }

        // the client's existing binding
        let existing = self
            .store
            .get_by_duid(duid, iaid, network.subnet_id())
            .into_iter()
            .find(|lease| {
                lease.lease_type == lease_store::LeaseType6::IaNa
                    && lease.state != LeaseState::Declined
            });
        if let Some(lease) = existing {
            debug!(addr = %lease.addr, "extending the client's existing v6 lease");
            return self.grant6(network, duid, iaid, lease.addr, commit, now);
        }

        // the requested address
        if let Some(addr) = requested {
            if network.pools().iter().any(|pool| pool.contains(addr))
                && self.addr_usable6(addr, duid, iaid, now)
            {
                debug!(%addr, "granting the requested v6 address");
                return self.grant6(network, duid, iaid, addr, commit, now);
            }
        }

        // pool scan
        for (pool_idx, pool) in network.pools().iter().enumerate() {
            let cursor_key = (network.subnet_id(), pool_idx);
            let hint = self.cursors6.get(&cursor_key).map(|cursor| *cursor);
            let usable = |addr: Ipv6Addr| self.addr_usable6(addr, duid, iaid, now);
            let found = match hint.filter(|hint| pool.contains(*hint)) {
                Some(hint) => pool
                    .iter()
                    .skip_while(|addr| *addr <= hint)
                    .find(|addr| usable(*addr))
                    .or_else(|| pool.iter().find(|addr| usable(*addr))),
                None => pool.iter().find(|addr| usable(*addr)),
            };
            if let Some(addr) = found {
                self.cursors6.insert(cursor_key, addr);
                debug!(%addr, "granting first free v6 address");
                return self.grant6(network, duid, iaid, addr, commit, now);
            }
        }

        Err(AllocError::NoAddressAvailable(network.subnet_id()))
    }

    /// RELEASE: mark the binding released when it belongs to this client
    pub fn release6(
        &self,
        duid: &[u8],
        iaid: u32,
        addr: Ipv6Addr,
        now: DateTime<Utc>,
    ) -> Result<Option<Lease6>, AllocError> {
        let prior = match self
            .store
            .get_by_address6(lease_store::LeaseType6::IaNa, addr)
        {
            Some(lease) if lease.matches_client(duid, iaid) => lease,
            _ => return Ok(None),
        };
        let mut released = prior.clone();
        released.state = LeaseState::Released;
        released.cltt = released.cltt.max(now);
        self.store.update6(&prior, released)?;
        Ok(Some(prior))
    }

    /// DECLINE: quarantine a v6 address
    pub fn decline6(
        &self,
        duid: &[u8],
        iaid: u32,
        addr: Ipv6Addr,
        probation: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), AllocError> {
        let prior = match self
            .store
            .get_by_address6(lease_store::LeaseType6::IaNa, addr)
        {
            Some(lease) if lease.matches_client(duid, iaid) => lease,
            _ => return Err(AllocError::AddressUnavailable6(addr)),
        };
        let mut declined = prior.clone();
        declined.state = LeaseState::Declined;
        declined.valid_lifetime = probation.as_secs() as u32;
        declined.cltt = prior.cltt.max(now);
        self.store.update6(&prior, declined)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::DhcpConfig;
    use hosts::{ClientIdentifier, Reservation};

    const YAML: &str = r#"
cache_threshold: 25
networks:
  - subnet: 192.0.2.0/24
    authoritative: true
    probation_period: 86400
    pools:
      - start: 192.0.2.100
        end: 192.0.2.103
        lease_time:
          default: 4000
"#;

    fn engine() -> (AllocEngine, DhcpConfig) {
        let cfg = DhcpConfig::parse_str(YAML).unwrap();
        let engine = AllocEngine::new(Arc::new(LeaseStore::new()), cfg.v4().cache_threshold());
        (engine, cfg)
    }

    fn client(n: u8) -> Client4 {
        Client4::new(&[0xaa, 0xbb, 0xcc, 0, 0, n], Some(&[1, 0, n]))
    }

    #[test]
    fn pool_scan_hands_out_sequential_addresses() {
        let (engine, cfg) = engine();
        let net = cfg.v4().network([192, 0, 2, 1]).unwrap();
        let now = Utc::now();

        for n in 0..4u8 {
            let grant = engine
                .offer(net, &client(n), None, None, None, None, false, now)
                .unwrap();
            assert_eq!(grant.addr, Ipv4Addr::from([192, 0, 2, 100 + n]));
        }
        // pool of 4 is now full
        assert!(matches!(
            engine.offer(net, &client(9), None, None, None, None, false, now),
            Err(AllocError::NoAddressAvailable(_))
        ));
    }

    #[test]
    fn repeat_discover_is_idempotent() {
        let (engine, cfg) = engine();
        let net = cfg.v4().network([192, 0, 2, 1]).unwrap();
        let now = Utc::now();

        let first = engine
            .offer(net, &client(1), None, None, None, None, false, now)
            .unwrap();
        let second = engine
            .offer(net, &client(1), None, None, None, None, false, now)
            .unwrap();
        assert_eq!(first.addr, second.addr);
        assert_eq!(engine.store().len4(), 1);
    }

    #[test]
    fn reservation_beats_the_pool() {
        let (engine, cfg) = engine();
        let net = cfg.v4().network([192, 0, 2, 1]).unwrap();
        let now = Utc::now();

        let mut res = Reservation::new(ClientIdentifier::HwAddress {
            hwtype: 1,
            bytes: client(1).hwaddr.clone(),
        });
        res.addresses.push([192, 0, 2, 102].into());

        let grant = engine
            .offer(net, &client(1), None, None, Some(&res), None, false, now)
            .unwrap();
        assert_eq!(grant.addr, Ipv4Addr::from([192, 0, 2, 102]));
    }

    #[test]
    fn requested_address_honored_when_free() {
        let (engine, cfg) = engine();
        let net = cfg.v4().network([192, 0, 2, 1]).unwrap();
        let now = Utc::now();

        let grant = engine
            .offer(net, &client(1), Some([192, 0, 2, 103].into()), None, None, None, false, now)
            .unwrap();
        assert_eq!(grant.addr, Ipv4Addr::from([192, 0, 2, 103]));

        // second client asking for the same address falls back to the scan
        let grant = engine
            .offer(net, &client(2), Some([192, 0, 2, 103].into()), None, None, None, false, now)
            .unwrap();
        assert_eq!(grant.addr, Ipv4Addr::from([192, 0, 2, 100]));
    }

    #[test]
    fn commit_then_renew_inside_reuse_window() {
        let (engine, cfg) = engine();
        let net = cfg.v4().network([192, 0, 2, 1]).unwrap();
        let now = Utc::now();

        let offered = engine
            .offer(net, &client(1), None, None, None, None, false, now)
            .unwrap();
        let committed = engine
            .commit(net, &client(1), offered.addr, None, None, now)
            .unwrap();
        assert!(!committed.reused);
        assert_eq!(committed.times.0, Duration::from_secs(4000));

        // renewal right away: inside the 25% window, no store write
        let snapshot = engine.store().get_by_address(offered.addr).unwrap();
        let renewed = engine
            .commit(net, &client(1), offered.addr, None, None, now + chrono::TimeDelta::seconds(10))
            .unwrap();
        assert!(renewed.reused);
        assert_eq!(
            engine.store().get_by_address(offered.addr).unwrap(),
            snapshot
        );
    }

    #[test]
    fn decline_quarantines_until_probation_elapses() {
        let (engine, cfg) = engine();
        let net = cfg.v4().network([192, 0, 2, 1]).unwrap();
        let now = Utc::now();
        let probation = net.probation_period();

        let grant = engine
            .offer(net, &client(1), None, None, None, None, true, now)
            .unwrap();
        assert_eq!(grant.addr, Ipv4Addr::from([192, 0, 2, 100]));
        engine
            .decline(&client(1), grant.addr, probation, now)
            .unwrap();

        // another client must skip the quarantined .100
        let grant = engine
            .offer(net, &client(2), None, None, None, None, false, now)
            .unwrap();
        assert_eq!(grant.addr, Ipv4Addr::from([192, 0, 2, 101]));

        // after probation the address can be asked for again
        let later = now + chrono::TimeDelta::seconds(probation.as_secs() as i64 + 1);
        let grant = engine
            .offer(net, &client(3), Some([192, 0, 2, 100].into()), None, None, None, false, later)
            .unwrap();
        assert_eq!(grant.addr, Ipv4Addr::from([192, 0, 2, 100]));
    }

    #[test]
    fn release_frees_the_address_for_the_next_client() {
        let (engine, cfg) = engine();
        let net = cfg.v4().network([192, 0, 2, 1]).unwrap();
        let now = Utc::now();

        let grant = engine
            .offer(net, &client(1), None, None, None, None, true, now)
            .unwrap();
        // wrong client cannot release it
        assert!(engine.release(&client(2), grant.addr, now).unwrap().is_none());
        assert!(engine.release(&client(1), grant.addr, now).unwrap().is_some());

        let next = engine
            .offer(net, &client(2), None, None, None, None, false, now)
            .unwrap();
        assert_eq!(next.addr, grant.addr);
    }

    #[test]
    fn non_authoritative_commit_without_offer_is_refused() {
        const YAML: &str = r#"
networks:
  - subnet: 192.0.2.0/24
    pools:
      - start: 192.0.2.100
        end: 192.0.2.103
"#;
        let cfg = DhcpConfig::parse_str(YAML).unwrap();
        let engine = AllocEngine::new(Arc::new(LeaseStore::new()), None);
        let net = cfg.v4().network([192, 0, 2, 1]).unwrap();
        assert!(matches!(
            engine.commit(net, &client(1), [192, 0, 2, 100].into(), None, None, Utc::now()),
            Err(AllocError::AddressUnavailable(_))
        ));
    }
}
