//! # lease-store
//!
//! The server's record of address bindings. One keyed table per family with
//! secondary indexes, a writer lock for mutation and shared reads, optimistic
//! compare-and-replace updates, batched expiry reclamation, and an
//! append-only CSV journal ("memfile") for durability.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;

pub mod memfile;
mod store;

pub use store::{LeaseStore, ReclaimStats};

/// subnet identifier assigned at configuration time
pub type SubnetId = u32;

#[derive(Debug, Error)]
pub enum StoreError {
    /// a lease already exists for this address
    #[error("lease already exists for {0}")]
    Duplicate(IpAddr),
    /// no lease for this address
    #[error("no lease for {0}")]
    NotFound(IpAddr),
    /// the stored lease no longer matches the snapshot the caller read
    #[error("lease for {0} changed since it was read")]
    Conflict(IpAddr),
    /// caller misuse
    #[error("bad value: {0}")]
    BadValue(String),
}

/// lifecycle state of a lease
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    /// bound to a client
    Default,
    /// the client reported the address in use elsewhere; unavailable
    /// until the probation period elapses
    Declined,
    /// expired and reclaimed; the address may be reassigned
    ExpiredReclaimed,
    /// the client gave the address back
    Released,
}

impl LeaseState {
    pub fn as_u8(self) -> u8 {
        match self {
            LeaseState::Default => 0,
            LeaseState::Declined => 1,
            LeaseState::ExpiredReclaimed => 2,
            LeaseState::Released => 3,
        }
    }

    pub fn from_u8(n: u8) -> Option<Self> {
        match n {
            0 => Some(LeaseState::Default),
            1 => Some(LeaseState::Declined),
            2 => Some(LeaseState::ExpiredReclaimed),
            3 => Some(LeaseState::Released),
            _ => None,
        }
    }
}

/// a DHCPv4 address binding
#[derive(Debug, Clone, PartialEq)]
pub struct Lease4 {
    pub addr: Ipv4Addr,
    pub hwaddr: Vec<u8>,
    pub client_id: Option<Vec<u8>>,
    pub subnet_id: SubnetId,
    /// seconds the binding stays valid past `cltt`
    pub valid_lifetime: u32,
    /// client last transmission time
    pub cltt: DateTime<Utc>,
    pub state: LeaseState,
    pub hostname: String,
    pub fqdn_fwd: bool,
    pub fqdn_rev: bool,
    pub user_context: Option<serde_json::Value>,
}

impl Lease4 {
    pub fn new(
        addr: Ipv4Addr,
        hwaddr: &[u8],
        client_id: Option<&[u8]>,
        subnet_id: SubnetId,
        valid_lifetime: u32,
        cltt: DateTime<Utc>,
    ) -> Self {
        Lease4 {
            addr,
            hwaddr: hwaddr.to_vec(),
            client_id: client_id.map(<[u8]>::to_vec),
            subnet_id,
            valid_lifetime,
            cltt,
            state: LeaseState::Default,
            hostname: String::new(),
            fqdn_fwd: false,
            fqdn_rev: false,
            user_context: None,
        }
    }

    /// derived: the instant the binding lapses
    pub fn expire_time(&self) -> DateTime<Utc> {
        self.cltt + TimeDelta::seconds(i64::from(self.valid_lifetime))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire_time() <= now
    }

    /// whether the address can be handed to a new client
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            LeaseState::Declined => self.is_expired(now),
            LeaseState::ExpiredReclaimed | LeaseState::Released => true,
            LeaseState::Default => self.is_expired(now),
        }
    }

    /// whether this lease binds the given client
    pub fn matches_client(&self, hwaddr: &[u8], client_id: Option<&[u8]>) -> bool {
        if self.state == LeaseState::Declined {
            // a declined lease has no valid client binding
            return false;
        }
        match (client_id, self.client_id.as_deref()) {
            (Some(a), Some(b)) => a == b,
            _ => !self.hwaddr.is_empty() && self.hwaddr == hwaddr,
        }
    }
}

/// kind of v6 binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LeaseType6 {
    IaNa,
    IaTa,
    IaPd,
}

impl LeaseType6 {
    pub fn as_u8(self) -> u8 {
        match self {
            LeaseType6::IaNa => 0,
            LeaseType6::IaTa => 1,
            LeaseType6::IaPd => 2,
        }
    }

    pub fn from_u8(n: u8) -> Option<Self> {
        match n {
            0 => Some(LeaseType6::IaNa),
            1 => Some(LeaseType6::IaTa),
            2 => Some(LeaseType6::IaPd),
            _ => None,
        }
    }
}

/// a DHCPv6 address or delegated-prefix binding
#[derive(Debug, Clone, PartialEq)]
pub struct Lease6 {
    pub addr: Ipv6Addr,
    /// 128 for plain addresses, shorter for delegated prefixes
    pub prefix_len: u8,
    pub duid: Vec<u8>,
    pub iaid: u32,
    pub lease_type: LeaseType6,
    pub subnet_id: SubnetId,
    pub preferred_lifetime: u32,
    pub valid_lifetime: u32,
    pub cltt: DateTime<Utc>,
    pub state: LeaseState,
}

impl Lease6 {
    pub fn new_addr(
        addr: Ipv6Addr,
        duid: &[u8],
        iaid: u32,
        subnet_id: SubnetId,
        preferred_lifetime: u32,
        valid_lifetime: u32,
        cltt: DateTime<Utc>,
    ) -> Self {
        Lease6 {
            addr,
            prefix_len: 128,
            duid: duid.to_vec(),
            iaid,
            lease_type: LeaseType6::IaNa,
            subnet_id,
            preferred_lifetime,
            valid_lifetime,
            cltt,
            state: LeaseState::Default,
        }
    }

    pub fn expire_time(&self) -> DateTime<Utc> {
        self.cltt + TimeDelta::seconds(i64::from(self.valid_lifetime))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire_time() <= now
    }

    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            LeaseState::Declined => self.is_expired(now),
            LeaseState::ExpiredReclaimed | LeaseState::Released => true,
            LeaseState::Default => self.is_expired(now),
        }
    }

    pub fn matches_client(&self, duid: &[u8], iaid: u32) -> bool {
        self.state != LeaseState::Declined && self.duid == duid && self.iaid == iaid
    }
}
