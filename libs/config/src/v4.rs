//! Runtime DHCPv4 configuration: ordered subnet list, pools, selection
//! helpers.
use std::{collections::HashSet, net::Ipv4Addr, time::Duration};

use anyhow::Result;
use ipnet::Ipv4Net;
use pnet::{
    datalink::NetworkInterface,
    ipnetwork::{IpNetwork, Ipv4Network},
};
use tracing::debug;

use proto::v4::{DhcpOption, DhcpOptions, Message, OptionCode};

use crate::{LeaseTime, client_classes::ClassDef, subnet_id_for, wire};

pub const DEFAULT_LEASE_TIME: Duration = Duration::from_secs(86_400);

/// how a query identifies the subnet it belongs to; inputs for
/// [`Config::select_network`]
#[derive(Debug, Clone, Copy)]
pub struct SubnetSelect {
    /// explicit selection: link-selection suboption or option 118
    pub subnet_select: Option<Ipv4Addr>,
    /// relay agent address from the header, unspecified when not relayed
    pub giaddr: Ipv4Addr,
    /// address of the arrival interface
    pub iface_ip: Option<Ipv4Addr>,
}

impl Default for SubnetSelect {
    fn default() -> Self {
        SubnetSelect {
            subnet_select: None,
            giaddr: Ipv4Addr::UNSPECIFIED,
            iface_ip: None,
        }
    }
}

impl SubnetSelect {
    pub fn new(subnet_select: Option<Ipv4Addr>, giaddr: Ipv4Addr, iface_ip: Option<Ipv4Addr>) -> Self {
        SubnetSelect {
            subnet_select,
            giaddr,
            iface_ip,
        }
    }
}

/// server config for dhcpv4
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// interfaces that are either explicitly bound by the config or are
    /// up & ipv4
    interfaces: Vec<NetworkInterface>,
    chaddr_only: bool,
    reservations_lookup_first: bool,
    cache_threshold: Option<u32>,
    deferred_options: Vec<u8>,
    classes: Vec<ClassDef>,
    /// declared order is selection/allocation order
    networks: Vec<Network>,
    v6: Option<crate::v6::Config>,
}

impl Config {
    pub fn v6(&self) -> Option<&crate::v6::Config> {
        self.v6.as_ref()
    }

    /// return the explicitly bound interfaces if there are any
    pub fn interfaces(&self) -> &[NetworkInterface] {
        self.interfaces.as_slice()
    }

    /// the v4 network of the interface at `iface_index`
    pub fn get_interface(&self, iface_index: u32) -> Option<Ipv4Network> {
        self.interfaces
            .iter()
            .find(|int| int.index == iface_index)
            .and_then(|int| {
                int.ips.iter().find_map(|ip| match ip {
                    IpNetwork::V4(ip) => Some(*ip),
                    _ => None,
                })
            })
    }

    /// Returns:
    ///     - `server_id` of the `Network` belonging to `ip`
    ///     - OR the address of the interface at `iface`
    pub fn server_id(&self, iface: u32, ip: Ipv4Addr) -> Option<Ipv4Addr> {
        self.network(ip)
            .and_then(|net| net.server_id)
            .or_else(|| self.get_interface(iface).map(|int| int.ip()))
    }

    /// whether the server keys clients on `chaddr` only
    pub fn chaddr_only(&self) -> bool {
        self.chaddr_only
    }

    /// whether a global reservation match runs before subnet selection
    pub fn reservations_lookup_first(&self) -> bool {
        self.reservations_lookup_first
    }

    /// % of lease time within which renewals are served without a store
    /// write
    pub fn cache_threshold(&self) -> Option<u32> {
        self.cache_threshold
    }

    /// option codes whose payload is re-parsed after classification
    pub fn deferred_options(&self) -> &[u8] {
        &self.deferred_options
    }

    pub fn classes(&self) -> &[ClassDef] {
        &self.classes
    }

    /// If opt 61 (client id) exists return that, otherwise return
    /// `chaddr` from the message header.
    pub fn client_id<'a>(&self, msg: &'a Message) -> &'a [u8] {
        if self.chaddr_only {
            msg.chaddr()
        } else if let Some(DhcpOption::ClientIdentifier(id)) =
            msg.opts().get(OptionCode::ClientIdentifier)
        {
            id
        } else {
            msg.chaddr()
        }
    }

    pub fn networks(&self) -> &[Network] {
        &self.networks
    }

    /// first network whose prefix contains `ip`, ignoring class guards
    pub fn network<I: Into<Ipv4Addr>>(&self, ip: I) -> Option<&Network> {
        let ip = ip.into();
        self.networks.iter().find(|net| net.subnet.contains(&ip))
    }

    fn network_for(&self, ip: Ipv4Addr, classes: Option<&[String]>) -> Option<&Network> {
        // unrestricted subnets first, then fall through the
        // class-restricted ones; first match wins
        self.networks
            .iter()
            .find(|net| net.subnet.contains(&ip) && net.classes.is_empty())
            .or_else(|| {
                self.networks
                    .iter()
                    .find(|net| net.subnet.contains(&ip) && net.class_match(classes))
            })
    }

    /// Subnet selection. Precedence: explicit subnet selection (option
    /// 118 / link-selection), then giaddr against relay addresses and
    /// prefixes, then the arrival interface.
    pub fn select_network(
        &self,
        select: SubnetSelect,
        classes: Option<&[String]>,
    ) -> Option<&Network> {
        if let Some(ip) = select.subnet_select {
            return self.network_for(ip, classes);
        }
        if !select.giaddr.is_unspecified() {
            if let Some(net) = self
                .networks
                .iter()
                .find(|net| net.relay_addrs.contains(&select.giaddr) && net.class_match_or_open(classes))
            {
                return Some(net);
            }
            return self.network_for(select.giaddr, classes);
        }
        let iface_ip = select.iface_ip?;
        self.network_for(iface_ip, classes)
    }

    /// transform the wire config into the runtime form
    pub fn from_wire(cfg: wire::Config) -> Result<Self> {
        let interfaces = crate::v4_find_interfaces(cfg.interfaces.clone())?;
        debug!(?interfaces, "v4 interfaces that will be used");

        let networks = cfg
            .networks
            .iter()
            .map(Network::from_wire)
            .collect::<Result<Vec<_>>>()?;
        let classes = cfg
            .client_classes
            .iter()
            .map(ClassDef::from_wire)
            .collect();
        let v6 = match cfg.v6 {
            Some(v6) => Some(crate::v6::Config::from_wire(v6)?),
            None => None,
        };
        Ok(Config {
            interfaces,
            chaddr_only: cfg.chaddr_only,
            reservations_lookup_first: cfg.reservations_lookup_first,
            cache_threshold: cfg.cache_threshold,
            deferred_options: cfg.deferred_options,
            classes,
            networks,
            v6,
        })
    }
}

/// one configured v4 subnet
#[derive(Debug, Clone)]
pub struct Network {
    subnet_id: u32,
    subnet: Ipv4Net,
    authoritative: bool,
    probation_period: Duration,
    server_id: Option<Ipv4Addr>,
    relay_addrs: Vec<Ipv4Addr>,
    classes: Vec<String>,
    opts: DhcpOptions,
    /// declared order is allocation order
    pools: Vec<Pool>,
}

impl Network {
    fn from_wire(net: &wire::Net) -> Result<Self> {
        let subnet_id = subnet_id_for(&net.subnet.to_string());
        let pools = net.pools.iter().map(Pool::from_wire).collect();
        Ok(Network {
            subnet_id,
            subnet: net.subnet,
            authoritative: net.authoritative,
            probation_period: Duration::from_secs(net.probation_period),
            server_id: net.server_id,
            relay_addrs: net.relay_addrs.clone(),
            classes: net.classes.clone(),
            opts: net.options.to_opts(),
            pools,
        })
    }

    pub fn subnet_id(&self) -> u32 {
        self.subnet_id
    }
    pub fn subnet(&self) -> Ipv4Net {
        self.subnet
    }
    pub fn authoritative(&self) -> bool {
        self.authoritative
    }
    pub fn probation_period(&self) -> Duration {
        self.probation_period
    }
    pub fn server_id(&self) -> Option<Ipv4Addr> {
        self.server_id
    }
    pub fn opts(&self) -> &DhcpOptions {
        &self.opts
    }
    pub fn pools(&self) -> &[Pool] {
        &self.pools
    }

    fn class_match(&self, classes: Option<&[String]>) -> bool {
        match classes {
            Some(classes) => self.classes.iter().any(|c| classes.contains(c)),
            None => false,
        }
    }

    fn class_match_or_open(&self, classes: Option<&[String]>) -> bool {
        self.classes.is_empty() || self.class_match(classes)
    }

    /// the pool containing `ip` that the client's classes admit
    pub fn pool_for(&self, ip: Ipv4Addr, classes: Option<&[String]>) -> Option<&Pool> {
        self.pools
            .iter()
            .find(|pool| pool.contains(ip) && pool.class_match_or_open(classes))
    }

    /// pools this client may allocate from, in declared order
    pub fn pools_with_class<'a>(
        &'a self,
        classes: Option<&'a [String]>,
    ) -> impl Iterator<Item = &'a Pool> {
        self.pools
            .iter()
            .filter(move |pool| pool.class_match_or_open(classes))
    }

    /// merged option set for a response: network options overlaid with
    /// pool options
    pub fn collect_opts(&self, pool: &Pool) -> DhcpOptions {
        let mut opts = self.opts.clone();
        for (_, opt) in pool.opts.iter() {
            opts.insert(opt.clone());
        }
        opts
    }

    pub fn total_addrs(&self) -> usize {
        self.pools.iter().map(Pool::size).sum()
    }
}

/// a contiguous address range inside a subnet
#[derive(Debug, Clone)]
pub struct Pool {
    start: Ipv4Addr,
    end: Ipv4Addr,
    exclusions: HashSet<Ipv4Addr>,
    lease: LeaseTime,
    classes: Vec<String>,
    opts: DhcpOptions,
}

impl Pool {
    pub fn new(start: Ipv4Addr, end: Ipv4Addr, lease: LeaseTime) -> Self {
        Pool {
            start,
            end,
            exclusions: HashSet::new(),
            lease,
            classes: Vec::new(),
            opts: DhcpOptions::new(),
        }
    }

    fn from_wire(pool: &wire::Pool) -> Self {
        let lease = match pool.lease_time {
            Some(lt) => {
                let default = Duration::from_secs(lt.default);
                LeaseTime::new(
                    default,
                    lt.min.map(Duration::from_secs).unwrap_or(default),
                    lt.max.map(Duration::from_secs).unwrap_or(default),
                )
            }
            None => LeaseTime::default(),
        };
        Pool {
            start: pool.start,
            end: pool.end,
            exclusions: pool.exclusions.iter().copied().collect(),
            lease,
            classes: pool.classes.clone(),
            opts: pool.options.to_opts(),
        }
    }

    pub fn start(&self) -> Ipv4Addr {
        self.start
    }
    pub fn end(&self) -> Ipv4Addr {
        self.end
    }
    pub fn addrs(&self) -> (Ipv4Addr, Ipv4Addr) {
        (self.start, self.end)
    }
    pub fn lease(&self) -> &LeaseTime {
        &self.lease
    }
    pub fn opts(&self) -> &DhcpOptions {
        &self.opts
    }
    pub fn exclusions(&self) -> &HashSet<Ipv4Addr> {
        &self.exclusions
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(self.start) <= u32::from(ip)
            && u32::from(ip) <= u32::from(self.end)
            && !self.exclusions.contains(&ip)
    }

    fn class_match_or_open(&self, classes: Option<&[String]>) -> bool {
        if self.classes.is_empty() {
            return true;
        }
        match classes {
            Some(classes) => self.classes.iter().any(|c| classes.contains(c)),
            None => false,
        }
    }

    /// usable addresses in the pool
    pub fn size(&self) -> usize {
        (u32::from(self.end) - u32::from(self.start) + 1) as usize - self.exclusions.len()
    }

    /// iterate the pool in address order, skipping exclusions
    pub fn iter(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        (u32::from(self.start)..=u32::from(self.end))
            .map(Ipv4Addr::from)
            .filter(move |ip| !self.exclusions.contains(ip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DhcpConfig;

    pub(crate) const SAMPLE_YAML: &str = r#"
chaddr_only: false
cache_threshold: 25
networks:
  - subnet: 192.0.2.0/24
    authoritative: true
    probation_period: 86400
    server_id: 192.0.2.1
    relay_addrs:
      - 10.9.9.1
    pools:
      - start: 192.0.2.100
        end: 192.0.2.199
        lease_time:
          default: 4000
          min: 3600
          max: 7200
    options:
      routers: [192.0.2.1]
      domain_servers: [192.0.2.1]
  - subnet: 10.50.0.0/16
    classes: [printers]
    pools:
      - start: 10.50.0.10
        end: 10.50.0.20
client_classes:
  - name: printers
    vendor_class_substring: PRNT
"#;

    fn cfg() -> DhcpConfig {
        DhcpConfig::parse_str(SAMPLE_YAML).unwrap()
    }

    #[test]
    fn selection_precedence() {
        let cfg = cfg();
        let v4 = cfg.v4();

        // explicit subnet selection wins
        let net = v4
            .select_network(
                SubnetSelect::new(
                    Some([192, 0, 2, 7].into()),
                    [10, 9, 9, 1].into(),
                    Some([10, 50, 0, 1].into()),
                ),
                None,
            )
            .unwrap();
        assert_eq!(net.subnet().to_string(), "192.0.2.0/24");

        // relay address list matches before prefixes
        let net = v4
            .select_network(
                SubnetSelect::new(None, [10, 9, 9, 1].into(), None),
                None,
            )
            .unwrap();
        assert_eq!(net.subnet().to_string(), "192.0.2.0/24");

        // interface fallback
        let net = v4
            .select_network(
                SubnetSelect::new(None, Ipv4Addr::UNSPECIFIED, Some([192, 0, 2, 1].into())),
                None,
            )
            .unwrap();
        assert_eq!(net.subnet().to_string(), "192.0.2.0/24");

        // nothing matches
        assert!(v4
            .select_network(
                SubnetSelect::new(None, Ipv4Addr::UNSPECIFIED, Some([172, 16, 0, 1].into())),
                None
            )
            .is_none());
    }

    #[test]
    fn class_restricted_subnet_needs_the_class() {
        let cfg = cfg();
        let v4 = cfg.v4();
        let select = SubnetSelect::new(None, Ipv4Addr::UNSPECIFIED, Some([10, 50, 0, 1].into()));

        assert!(v4.select_network(select, None).is_none());
        let net = v4
            .select_network(select, Some(&["printers".to_owned()]))
            .unwrap();
        assert_eq!(net.subnet().to_string(), "10.50.0.0/16");
    }

    #[test]
    fn pool_membership_and_exclusions() {
        let lease = LeaseTime::default();
        let mut pool = Pool::new([192, 0, 2, 100].into(), [192, 0, 2, 110].into(), lease);
        pool.exclusions.insert([192, 0, 2, 105].into());

        assert!(pool.contains([192, 0, 2, 100].into()));
        assert!(pool.contains([192, 0, 2, 110].into()));
        assert!(!pool.contains([192, 0, 2, 105].into()));
        assert!(!pool.contains([192, 0, 2, 111].into()));
        assert_eq!(pool.size(), 10);
        assert_eq!(pool.iter().count(), 10);
    }

    #[test]
    fn network_collects_pool_opts_over_its_own() {
        let cfg = cfg();
        let net = cfg.v4().network([192, 0, 2, 150]).unwrap();
        let pool = net.pool_for([192, 0, 2, 150].into(), None).unwrap();
        let opts = net.collect_opts(pool);
        assert!(opts.get(proto::v4::OptionCode::Router).is_some());
    }
}
