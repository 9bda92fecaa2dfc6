//! The YAML wire format, exactly as the operator writes it. Everything
//! here is serde structs; the runtime forms live in [`crate::v4`] and
//! [`crate::v6`].
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use anyhow::{Context, Result, bail};
use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};

use hosts::{ClientIdentifier, HostScope, HostStore, Reservation};
use proto::v4::DhcpOption;

use crate::{parse_hex_colon, subnet_id_for};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// interfaces to bind; all up v4-capable interfaces when omitted
    #[serde(default)]
    pub interfaces: Option<Vec<String>>,
    /// ignore client id (option 61) and key clients on chaddr only
    #[serde(default)]
    pub chaddr_only: bool,
    /// try a global reservation match before subnet selection
    #[serde(default)]
    pub reservations_lookup_first: bool,
    /// % of the lease time within which a renewal is served from cache
    /// without a store write
    #[serde(default)]
    pub cache_threshold: Option<u32>,
    /// option codes whose payload is only interpreted after the client
    /// class is known
    #[serde(default)]
    pub deferred_options: Vec<u8>,
    #[serde(default)]
    pub client_classes: Vec<ClientClass>,
    /// declared order is allocation/selection order
    #[serde(default)]
    pub networks: Vec<Net>,
    #[serde(default)]
    pub v6: Option<V6>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ClientClass {
    pub name: String,
    /// match when the vendor class identifier (option 60) contains this
    /// substring
    #[serde(default)]
    pub vendor_class_substring: Option<String>,
}

fn default_probation() -> u64 {
    86_400
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Net {
    pub subnet: Ipv4Net,
    #[serde(default)]
    pub authoritative: bool,
    /// seconds a declined address stays quarantined
    #[serde(default = "default_probation")]
    pub probation_period: u64,
    #[serde(default)]
    pub server_id: Option<Ipv4Addr>,
    /// relay agents whose giaddr selects this subnet
    #[serde(default)]
    pub relay_addrs: Vec<Ipv4Addr>,
    /// restrict the subnet to clients in one of these classes
    #[serde(default)]
    pub classes: Vec<String>,
    #[serde(default)]
    pub pools: Vec<Pool>,
    #[serde(default)]
    pub options: Options,
    #[serde(default)]
    pub reservations: Vec<HostReservation>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Pool {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
    #[serde(default)]
    pub exclusions: Vec<Ipv4Addr>,
    #[serde(default)]
    pub lease_time: Option<LeaseTime>,
    #[serde(default)]
    pub classes: Vec<String>,
    #[serde(default)]
    pub options: Options,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LeaseTime {
    pub default: u64,
    #[serde(default)]
    pub min: Option<u64>,
    #[serde(default)]
    pub max: Option<u64>,
}

/// options the server can be configured to serve
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Options {
    #[serde(default)]
    pub routers: Vec<Ipv4Addr>,
    #[serde(default)]
    pub domain_servers: Vec<Ipv4Addr>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub subnet_mask: Option<Ipv4Addr>,
    #[serde(default)]
    pub broadcast: Option<Ipv4Addr>,
}

impl Options {
    pub(crate) fn to_opts(&self) -> proto::v4::DhcpOptions {
        let mut opts = proto::v4::DhcpOptions::new();
        if !self.routers.is_empty() {
            opts.insert(DhcpOption::Router(self.routers.clone()));
        }
        if !self.domain_servers.is_empty() {
            opts.insert(DhcpOption::DomainNameServer(self.domain_servers.clone()));
        }
        if let Some(domain) = &self.domain {
            opts.insert(DhcpOption::DomainName(domain.clone()));
        }
        if let Some(mask) = self.subnet_mask {
            opts.insert(DhcpOption::SubnetMask(mask));
        }
        if let Some(broadcast) = self.broadcast {
            opts.insert(DhcpOption::BroadcastAddr(broadcast));
        }
        opts
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HostReservation {
    /// exactly one of mac/client_id/flex_id identifies the client
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub flex_id: Option<String>,
    #[serde(default)]
    pub ip: Option<IpAddr>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub classes: Vec<String>,
    #[serde(default)]
    pub options: Options,
    /// reservation applies in any subnet
    #[serde(default)]
    pub global: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct V6 {
    #[serde(default)]
    pub interfaces: Option<Vec<String>>,
    /// server DUID as colon hex
    pub server_duid: String,
    #[serde(default)]
    pub networks: Vec<Net6>,
}

fn default_preferred() -> u32 {
    3000
}
fn default_valid() -> u32 {
    4000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Net6 {
    pub subnet: Ipv6Net,
    #[serde(default)]
    pub pools: Vec<Pool6>,
    #[serde(default = "default_preferred")]
    pub preferred_lifetime: u32,
    #[serde(default = "default_valid")]
    pub valid_lifetime: u32,
    /// honor solicit rapid-commit (option 14)
    #[serde(default)]
    pub rapid_commit: bool,
    /// relay interface-id (option 18) that selects this subnet
    #[serde(default)]
    pub interface_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Pool6 {
    pub start: Ipv6Addr,
    pub end: Ipv6Addr,
}

/// build the reservation store for this configuration generation
pub(crate) fn build_host_store(cfg: &Config) -> Result<HostStore> {
    let mut store = HostStore::new();
    for net in &cfg.networks {
        let subnet_id = subnet_id_for(&net.subnet.to_string());
        for wire_res in &net.reservations {
            let identifier = match (&wire_res.mac, &wire_res.client_id, &wire_res.flex_id) {
                (Some(mac), None, None) => ClientIdentifier::HwAddress {
                    hwtype: 1,
                    bytes: parse_hex_colon(mac)?,
                },
                (None, Some(id), None) => ClientIdentifier::ClientId(parse_hex_colon(id)?),
                (None, None, Some(id)) => ClientIdentifier::FlexId(parse_hex_colon(id)?),
                _ => bail!(
                    "reservation in {} must set exactly one of mac/client_id/flex_id",
                    net.subnet
                ),
            };
            let mut res = Reservation::new(identifier);
            if let Some(ip) = wire_res.ip {
                res.addresses.push(ip);
            }
            res.hostname = wire_res.hostname.clone();
            res.opts = wire_res.options.to_opts();
            res.client_classes = wire_res.classes.clone();
            let scope = if wire_res.global {
                HostScope::Global
            } else {
                HostScope::Subnet(subnet_id)
            };
            if let Some(IpAddr::V4(ip)) = wire_res.ip {
                if !wire_res.global && !net.subnet.contains(&ip) {
                    bail!("reserved address {ip} is outside subnet {}", net.subnet);
                }
            }
            store.add(scope, res);
        }
    }
    Ok(store)
}

impl Config {
    /// sanity checks that should fail a reload before anything is built
    pub(crate) fn validate(&self) -> Result<()> {
        for net in &self.networks {
            for pool in &net.pools {
                if u32::from(pool.end) < u32::from(pool.start) {
                    bail!("pool {}-{} is inverted", pool.start, pool.end);
                }
                if !net.subnet.contains(&pool.start) || !net.subnet.contains(&pool.end) {
                    bail!(
                        "pool {}-{} is outside subnet {}",
                        pool.start,
                        pool.end,
                        net.subnet
                    );
                }
            }
        }
        if let Some(v6) = &self.v6 {
            parse_hex_colon(&v6.server_duid).context("invalid server_duid")?;
            for net in &v6.networks {
                for pool in &net.pools {
                    if u128::from(pool.end) < u128::from(pool.start) {
                        bail!("pool {}-{} is inverted", pool.start, pool.end);
                    }
                }
            }
        }
        Ok(())
    }
}
