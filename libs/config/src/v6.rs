//! Runtime DHCPv6 configuration.
use std::net::Ipv6Addr;

use anyhow::{Context, Result};
use ipnet::Ipv6Net;
use pnet::{
    datalink::NetworkInterface,
    ipnetwork::{IpNetwork, Ipv6Network},
};
use tracing::debug;

use crate::{parse_hex_colon, subnet_id_for, wire};

/// server config for dhcpv6
#[derive(Debug, Clone)]
pub struct Config {
    interfaces: Vec<NetworkInterface>,
    /// the server DUID
    server_id: Vec<u8>,
    /// declared order is selection/allocation order
    networks: Vec<Network>,
}

impl Config {
    pub(crate) fn from_wire(cfg: wire::V6) -> Result<Self> {
        let interfaces = crate::v6_find_interfaces(cfg.interfaces.clone())?;
        debug!(?interfaces, "v6 interfaces that will be used");
        let server_id = parse_hex_colon(&cfg.server_duid).context("invalid server_duid")?;
        let networks = cfg.networks.iter().map(Network::from_wire).collect();
        Ok(Config {
            interfaces,
            server_id,
            networks,
        })
    }

    pub fn server_id(&self) -> &[u8] {
        &self.server_id
    }

    pub fn interfaces(&self) -> &[NetworkInterface] {
        self.interfaces.as_slice()
    }

    pub fn networks(&self) -> &[Network] {
        &self.networks
    }

    /// link-local network of the interface at `iface_index`
    pub fn get_interface_link_local(&self, iface_index: u32) -> Option<Ipv6Network> {
        self.find_interface(iface_index).and_then(|int| {
            int.ips.iter().find_map(|ip| match ip {
                IpNetwork::V6(net) if is_link_local(net.ip()) => Some(*net),
                _ => None,
            })
        })
    }

    /// global unicast network of the interface at `iface_index`
    pub fn get_interface_global(&self, iface_index: u32) -> Option<Ipv6Network> {
        self.find_interface(iface_index).and_then(|int| {
            int.ips.iter().find_map(|ip| match ip {
                IpNetwork::V6(net) if !is_link_local(net.ip()) && !net.ip().is_loopback() => {
                    Some(*net)
                }
                _ => None,
            })
        })
    }

    fn find_interface(&self, iface_index: u32) -> Option<&NetworkInterface> {
        self.interfaces.iter().find(|int| int.index == iface_index)
    }

    /// first network whose prefix contains `ip`
    pub fn network(&self, ip: Ipv6Addr) -> Option<&Network> {
        self.networks.iter().find(|net| net.subnet.contains(&ip))
    }

    /// Subnet selection. Precedence: the relay chain's link address, then
    /// the relay interface-id option, then the arrival interface.
    pub fn select_network(
        &self,
        link_addr: Option<Ipv6Addr>,
        interface_id: Option<&[u8]>,
        iface_addr: Option<Ipv6Addr>,
    ) -> Option<&Network> {
        if let Some(link) = link_addr.filter(|ip| !ip.is_unspecified()) {
            return self.network(link);
        }
        if let Some(id) = interface_id {
            if let Some(net) = self
                .networks
                .iter()
                .find(|net| net.interface_id.as_deref() == Some(id))
            {
                return Some(net);
            }
        }
        self.network(iface_addr?)
    }
}

/// one configured v6 subnet
#[derive(Debug, Clone)]
pub struct Network {
    subnet_id: u32,
    subnet: Ipv6Net,
    pools: Vec<Pool>,
    preferred_lifetime: u32,
    valid_lifetime: u32,
    rapid_commit: bool,
    interface_id: Option<Vec<u8>>,
}

impl Network {
    fn from_wire(net: &wire::Net6) -> Self {
        Network {
            subnet_id: subnet_id_for(&net.subnet.to_string()),
            subnet: net.subnet,
            pools: net
                .pools
                .iter()
                .map(|pool| Pool {
                    start: pool.start,
                    end: pool.end,
                })
                .collect(),
            preferred_lifetime: net.preferred_lifetime,
            valid_lifetime: net.valid_lifetime,
            rapid_commit: net.rapid_commit,
            interface_id: net.interface_id.as_ref().map(|s| s.as_bytes().to_vec()),
        }
    }

    pub fn subnet_id(&self) -> u32 {
        self.subnet_id
    }
    pub fn subnet(&self) -> Ipv6Net {
        self.subnet
    }
    pub fn pools(&self) -> &[Pool] {
        &self.pools
    }
    pub fn preferred_lifetime(&self) -> u32 {
        self.preferred_lifetime
    }
    pub fn valid_lifetime(&self) -> u32 {
        self.valid_lifetime
    }
    pub fn rapid_commit(&self) -> bool {
        self.rapid_commit
    }
    pub fn interface_id(&self) -> Option<&[u8]> {
        self.interface_id.as_deref()
    }

    pub fn contains(&self, ip: Ipv6Addr) -> bool {
        self.subnet.contains(&ip)
    }
}

fn is_link_local(ip: Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

/// a contiguous v6 address range
#[derive(Debug, Clone, Copy)]
pub struct Pool {
    start: Ipv6Addr,
    end: Ipv6Addr,
}

impl Pool {
    pub fn new(start: Ipv6Addr, end: Ipv6Addr) -> Self {
        Pool { start, end }
    }

    pub fn start(&self) -> Ipv6Addr {
        self.start
    }
    pub fn end(&self) -> Ipv6Addr {
        self.end
    }

    pub fn contains(&self, ip: Ipv6Addr) -> bool {
        u128::from(self.start) <= u128::from(ip) && u128::from(ip) <= u128::from(self.end)
    }

    /// iterate the pool in address order
    pub fn iter(&self) -> impl Iterator<Item = Ipv6Addr> {
        (u128::from(self.start)..=u128::from(self.end)).map(Ipv6Addr::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net6(subnet: &str, interface_id: Option<&str>) -> Network {
        Network::from_wire(&wire::Net6 {
            subnet: subnet.parse().unwrap(),
            pools: vec![wire::Pool6 {
                start: "2001:db8::100".parse().unwrap(),
                end: "2001:db8::1ff".parse().unwrap(),
            }],
            preferred_lifetime: 3000,
            valid_lifetime: 4000,
            rapid_commit: true,
            interface_id: interface_id.map(str::to_owned),
        })
    }

    #[test]
    fn selection_precedence() {
        let cfg = Config {
            interfaces: Vec::new(),
            server_id: vec![0, 1, 2, 3],
            networks: vec![net6("2001:db8::/64", Some("eth1"))],
        };

        // relay link address first
        let net = cfg
            .select_network(Some("2001:db8::1".parse().unwrap()), None, None)
            .unwrap();
        assert_eq!(net.subnet().to_string(), "2001:db8::/64");

        // then interface id
        assert!(cfg.select_network(None, Some(b"eth1"), None).is_some());
        assert!(cfg.select_network(None, Some(b"eth9"), None).is_none());

        // then arrival interface
        assert!(cfg
            .select_network(None, None, Some("2001:db8::9".parse().unwrap()))
            .is_some());
        assert!(cfg
            .select_network(None, None, Some("2001:dead::9".parse().unwrap()))
            .is_none());
    }

    #[test]
    fn pool_bounds() {
        let net = net6("2001:db8::/64", None);
        let pool = &net.pools()[0];
        assert!(pool.contains("2001:db8::100".parse().unwrap()));
        assert!(pool.contains("2001:db8::1ff".parse().unwrap()));
        assert!(!pool.contains("2001:db8::200".parse().unwrap()));
        assert_eq!(pool.iter().next().unwrap(), "2001:db8::100".parse::<Ipv6Addr>().unwrap());
    }
}
