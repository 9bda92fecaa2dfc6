//! # config
//!
//! Wire (YAML) and runtime server configuration. The wire form is what the
//! operator writes; parsing transforms it into an optimized runtime form
//! (ordered subnet list, reservation store, classifier) that the plugins
//! read. A configuration generation is immutable once built; reloading
//! produces a whole new generation.
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use hosts::HostStore;

pub mod client_classes;
pub mod v4;
pub mod v6;
pub mod wire;

/// server config
#[derive(Debug, Clone)]
pub struct DhcpConfig {
    v4: v4::Config,
    hosts: Arc<HostStore>,
    path: Option<PathBuf>,
}

impl DhcpConfig {
    pub fn v4(&self) -> &v4::Config {
        &self.v4
    }
    pub fn has_v6(&self) -> bool {
        self.v4.v6().is_some()
    }
    pub fn v6(&self) -> &v6::Config {
        // v6 existence is checked before the v6 server starts
        self.v4.v6().expect("v6 config present")
    }
    pub fn hosts(&self) -> &Arc<HostStore> {
        &self.hosts
    }
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// parse the YAML wire format from a file
    pub fn parse(path: &Path) -> Result<Self> {
        let input = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        let mut cfg = Self::parse_str(&input)?;
        cfg.path = Some(path.to_path_buf());
        Ok(cfg)
    }

    /// parse the YAML wire format from a string
    pub fn parse_str(input: &str) -> Result<Self> {
        let wire: wire::Config = serde_yaml::from_str(input).context("invalid config yaml")?;
        wire.validate().context("invalid configuration")?;
        let hosts = Arc::new(wire::build_host_store(&wire)?);
        let v4 = v4::Config::from_wire(wire)?;
        Ok(DhcpConfig {
            v4,
            hosts,
            path: None,
        })
    }
}

/// lease timing for one pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseTime {
    default: Duration,
    min: Duration,
    max: Duration,
}

impl LeaseTime {
    pub fn new(default: Duration, min: Duration, max: Duration) -> Self {
        LeaseTime { default, min, max }
    }

    /// pick the lease to grant given what the client asked for, clamped
    /// to the pool's bounds. Returns (lease, renew, rebind).
    pub fn determine_lease(&self, requested: Option<Duration>) -> (Duration, Duration, Duration) {
        let lease = match requested {
            Some(req) => req.clamp(self.min, self.max),
            None => self.default,
        };
        (lease, renew(lease), rebind(lease))
    }

    pub fn default_time(&self) -> Duration {
        self.default
    }
}

impl Default for LeaseTime {
    fn default() -> Self {
        LeaseTime {
            default: v4::DEFAULT_LEASE_TIME,
            min: v4::DEFAULT_LEASE_TIME,
            max: v4::DEFAULT_LEASE_TIME,
        }
    }
}

/// T1: when the client should start renewing
pub fn renew(lease: Duration) -> Duration {
    lease / 2
}

/// T2: when the client should start rebinding
pub fn rebind(lease: Duration) -> Duration {
    (lease / 8) * 7
}

/// Stable subnet id derived from the textual prefix (FNV-1a), so an
/// unchanged prefix keeps its id across reconfigurations.
pub fn subnet_id_for(prefix: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in prefix.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    // id 0 is reserved for "no subnet"
    hash.max(1)
}

/// interfaces to serve v4 on: the named ones, or every up interface with
/// a v4 address
pub(crate) fn v4_find_interfaces(
    names: Option<Vec<String>>,
) -> Result<Vec<pnet::datalink::NetworkInterface>> {
    find_interfaces(names, |int| {
        int.ips
            .iter()
            .any(|ip| matches!(ip, pnet::ipnetwork::IpNetwork::V4(_)))
    })
}

/// interfaces to serve v6 on: the named ones, or every up interface with
/// a v6 address
pub(crate) fn v6_find_interfaces(
    names: Option<Vec<String>>,
) -> Result<Vec<pnet::datalink::NetworkInterface>> {
    find_interfaces(names, |int| {
        int.ips
            .iter()
            .any(|ip| matches!(ip, pnet::ipnetwork::IpNetwork::V6(_)))
    })
}

fn find_interfaces<F>(
    names: Option<Vec<String>>,
    family_ok: F,
) -> Result<Vec<pnet::datalink::NetworkInterface>>
where
    F: Fn(&pnet::datalink::NetworkInterface) -> bool,
{
    let all = pnet::datalink::interfaces();
    match names {
        Some(names) => names
            .iter()
            .map(|name| {
                all.iter()
                    .find(|int| &int.name == name)
                    .cloned()
                    .with_context(|| format!("configured interface {name} does not exist"))
            })
            .collect(),
        None => Ok(all
            .into_iter()
            .filter(|int| int.is_up() && !int.is_loopback() && family_ok(int))
            .collect()),
    }
}

pub(crate) fn parse_hex_colon(s: &str) -> Result<Vec<u8>> {
    s.split(':')
        .map(|part| {
            u8::from_str_radix(part, 16)
                .with_context(|| format!("invalid hex identifier byte {part:?}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_time_clamps_requests() {
        let lt = LeaseTime::new(
            Duration::from_secs(4000),
            Duration::from_secs(3600),
            Duration::from_secs(7200),
        );
        assert_eq!(lt.determine_lease(None).0, Duration::from_secs(4000));
        assert_eq!(
            lt.determine_lease(Some(Duration::from_secs(60))).0,
            Duration::from_secs(3600)
        );
        assert_eq!(
            lt.determine_lease(Some(Duration::from_secs(100_000))).0,
            Duration::from_secs(7200)
        );
        let (lease, t1, t2) = lt.determine_lease(Some(Duration::from_secs(4800)));
        assert_eq!(lease, Duration::from_secs(4800));
        assert_eq!(t1, Duration::from_secs(2400));
        assert_eq!(t2, Duration::from_secs(4200));
    }

    #[test]
    fn subnet_ids_are_stable_and_distinct() {
        assert_eq!(subnet_id_for("192.0.2.0/24"), subnet_id_for("192.0.2.0/24"));
        assert_ne!(subnet_id_for("192.0.2.0/24"), subnet_id_for("10.0.0.0/8"));
    }
}
