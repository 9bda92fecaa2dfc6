//! # hosts
//!
//! Static host reservations. The table is built when a configuration
//! generation commits and never mutated afterwards; a reconfiguration
//! replaces the whole store. Lookup is by (scope, identifier kind,
//! identifier bytes); when a client matches more than one identifier
//! class within a subnet, insertion order breaks the tie.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};

use proto::v4;

/// subnet identifier assigned at configuration time
pub type SubnetId = u32;

/// where a reservation applies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostScope {
    Global,
    Subnet(SubnetId),
}

/// which identifier class a reservation keys on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentKind {
    HwAddress,
    Duid,
    ClientId,
    FlexId,
}

/// a client identifier as presented by a query. Equality is structural;
/// identifier bytes are opaque.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClientIdentifier {
    HwAddress { hwtype: u8, bytes: Vec<u8> },
    Duid(Vec<u8>),
    ClientId(Vec<u8>),
    FlexId(Vec<u8>),
}

impl ClientIdentifier {
    pub fn kind(&self) -> IdentKind {
        match self {
            ClientIdentifier::HwAddress { .. } => IdentKind::HwAddress,
            ClientIdentifier::Duid(_) => IdentKind::Duid,
            ClientIdentifier::ClientId(_) => IdentKind::ClientId,
            ClientIdentifier::FlexId(_) => IdentKind::FlexId,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        match self {
            ClientIdentifier::HwAddress { bytes, .. } => bytes,
            ClientIdentifier::Duid(bytes)
            | ClientIdentifier::ClientId(bytes)
            | ClientIdentifier::FlexId(bytes) => bytes,
        }
    }
}

/// a static binding of one client identifier to addresses and options
#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    pub identifier: ClientIdentifier,
    pub addresses: Vec<IpAddr>,
    /// delegated prefixes, v6 only
    pub prefixes: Vec<(Ipv6Addr, u8)>,
    pub hostname: Option<String>,
    /// options served alongside the reserved address
    pub opts: v4::DhcpOptions,
    /// classes the client must match for the reservation to apply; empty
    /// means unconditional
    pub client_classes: Vec<String>,
}

impl Reservation {
    pub fn new(identifier: ClientIdentifier) -> Self {
        Reservation {
            identifier,
            addresses: Vec::new(),
            prefixes: Vec::new(),
            hostname: None,
            opts: v4::DhcpOptions::new(),
            client_classes: Vec::new(),
        }
    }

    /// the first reserved v4 address, if any
    pub fn v4_address(&self) -> Option<Ipv4Addr> {
        self.addresses.iter().find_map(|addr| match addr {
            IpAddr::V4(ip) => Some(*ip),
            _ => None,
        })
    }

    /// the first reserved v6 address, if any
    pub fn v6_address(&self) -> Option<Ipv6Addr> {
        self.addresses.iter().find_map(|addr| match addr {
            IpAddr::V6(ip) => Some(*ip),
            _ => None,
        })
    }

    fn matches(&self, ident: &ClientIdentifier, classes: Option<&[String]>) -> bool {
        if &self.identifier != ident {
            return false;
        }
        if self.client_classes.is_empty() {
            return true;
        }
        match classes {
            Some(classes) => self
                .client_classes
                .iter()
                .any(|required| classes.contains(required)),
            None => false,
        }
    }
}

/// Reservations for one configuration generation. Wrapped in an `Arc`
/// once built; a new generation replaces the whole table.
#[derive(Debug, Clone, Default)]
pub struct HostStore {
    scopes: HashMap<HostScope, Vec<Reservation>>,
}

impl HostStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// record a reservation. Within a scope, reservations keep insertion
    /// order.
    pub fn add(&mut self, scope: HostScope, reservation: Reservation) {
        self.scopes.entry(scope).or_default().push(reservation);
    }

    /// lookup by the exact (scope, identifier kind, identifier bytes)
    /// triple
    pub fn find(&self, scope: HostScope, kind: IdentKind, bytes: &[u8]) -> Option<&Reservation> {
        self.scopes.get(&scope)?.iter().find(|res| {
            res.identifier.kind() == kind && res.identifier.bytes() == bytes
        })
    }

    /// first reservation in insertion order matching any of the client's
    /// identifiers. This is the tie-break when a client matches more than
    /// one identifier class.
    pub fn find_first(
        &self,
        scope: HostScope,
        idents: &[ClientIdentifier],
        classes: Option<&[String]>,
    ) -> Option<&Reservation> {
        self.scopes
            .get(&scope)?
            .iter()
            .find(|res| idents.iter().any(|ident| res.matches(ident, classes)))
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.values().all(Vec::is_empty)
    }

    pub fn len(&self) -> usize {
        self.scopes.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hw(bytes: &[u8]) -> ClientIdentifier {
        ClientIdentifier::HwAddress {
            hwtype: 1,
            bytes: bytes.to_vec(),
        }
    }

    #[test]
    fn lookup_by_scope_and_kind() {
        let mut store = HostStore::new();
        let mut res = Reservation::new(hw(&[1, 2, 3, 4, 5, 6]));
        res.addresses.push(IpAddr::V4([192, 0, 2, 10].into()));
        store.add(HostScope::Subnet(1), res);

        assert!(store
            .find(HostScope::Subnet(1), IdentKind::HwAddress, &[1, 2, 3, 4, 5, 6])
            .is_some());
        // wrong subnet, wrong kind, wrong bytes all miss
        assert!(store
            .find(HostScope::Subnet(2), IdentKind::HwAddress, &[1, 2, 3, 4, 5, 6])
            .is_none());
        assert!(store
            .find(HostScope::Subnet(1), IdentKind::ClientId, &[1, 2, 3, 4, 5, 6])
            .is_none());
        assert!(store
            .find(HostScope::Subnet(1), IdentKind::HwAddress, &[9])
            .is_none());
    }

    #[test]
    fn insertion_order_breaks_ties() {
        let mut store = HostStore::new();
        let mut by_client_id = Reservation::new(ClientIdentifier::ClientId(vec![7, 7]));
        by_client_id.addresses.push(IpAddr::V4([192, 0, 2, 20].into()));
        let mut by_hw = Reservation::new(hw(&[1, 2, 3, 4, 5, 6]));
        by_hw.addresses.push(IpAddr::V4([192, 0, 2, 21].into()));
        store.add(HostScope::Subnet(1), by_client_id);
        store.add(HostScope::Subnet(1), by_hw);

        // this client matches both identifier classes; first inserted wins
        let idents = [hw(&[1, 2, 3, 4, 5, 6]), ClientIdentifier::ClientId(vec![7, 7])];
        let res = store
            .find_first(HostScope::Subnet(1), &idents, None)
            .unwrap();
        assert_eq!(res.v4_address(), Some([192, 0, 2, 20].into()));
    }

    #[test]
    fn class_guard_applies() {
        let mut store = HostStore::new();
        let mut res = Reservation::new(hw(&[1, 2, 3, 4, 5, 6]));
        res.client_classes.push("printers".to_owned());
        store.add(HostScope::Global, res);

        let idents = [hw(&[1, 2, 3, 4, 5, 6])];
        assert!(store.find_first(HostScope::Global, &idents, None).is_none());
        assert!(store
            .find_first(
                HostScope::Global,
                &idents,
                Some(&["printers".to_owned()])
            )
            .is_some());
    }
}
