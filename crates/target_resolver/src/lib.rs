//! Target Resolver - expansion of target strings into a target list
//!
//! Takes a comma-separated target string and expands it into a deduplicated
//! list of addresses. Supported token forms:
//! - single address: "1.2.3.4", "2001:db8::1"
//! - CIDR: "192.168.1.0/24", "2001:db8::/120"
//! - range: "192.168.1.1-192.168.1.10", "2001:db8::1-2001:db8::ff"
//! - short IPv4 range on the last octet: "192.168.1.1-10"
//!
//! Host names are rejected: the alive detection engine never resolves DNS.

use anyhow::{bail, Context, Result};
use ipnet::IpNet;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::debug;

use boreas_common::TargetList;

/// Default expansion limit for a single target string.
pub const MAX_HOSTS: u128 = 4096;

pub struct TargetResolver {
    max_hosts: u128,
}

impl TargetResolver {
    pub fn new() -> Self {
        Self {
            max_hosts: MAX_HOSTS,
        }
    }

    /// Raise (or lower) the expansion limit.
    pub fn with_max_hosts(mut self, max_hosts: u128) -> Self {
        self.max_hosts = max_hosts;
        self
    }

    /// Expand `targets` into unique addresses, in first-seen order.
    pub fn resolve(&self, targets: &str) -> Result<Vec<IpAddr>> {
        if targets.trim().is_empty() {
            bail!("No targets specified");
        }

        let mut seen = HashSet::new();
        let mut ips = Vec::new();

        for token in targets.split(',') {
            let t = token.trim();
            if t.is_empty() {
                continue;
            }
            for ip in self.expand(t)? {
                if seen.insert(ip) {
                    ips.push(ip);
                }
                if ips.len() as u128 > self.max_hosts {
                    bail!(
                        "Targets expand to more than the allowed limit of {} hosts",
                        self.max_hosts
                    );
                }
            }
        }

        if ips.is_empty() {
            bail!("No valid addresses found in targets");
        }
        Ok(ips)
    }

    /// Expand `targets`, drop everything in `exclude` and build the target
    /// arena handed to the engine.
    pub fn resolve_list(&self, targets: &str, exclude: Option<&str>) -> Result<TargetList> {
        let ips = self.resolve(targets)?;
        let excluded: HashSet<IpAddr> = match exclude {
            Some(ex) if !ex.trim().is_empty() => self.resolve(ex)?.into_iter().collect(),
            _ => HashSet::new(),
        };

        let list: TargetList = ips.into_iter().filter(|ip| !excluded.contains(ip)).collect();
        debug!(targets = list.len(), excluded = excluded.len(), "targets resolved");
        if list.is_empty() {
            bail!("Every target is excluded");
        }
        Ok(list)
    }

    fn expand(&self, token: &str) -> Result<Vec<IpAddr>> {
        // CIDR
        if token.contains('/') {
            let net: IpNet = token
                .parse()
                .with_context(|| format!("Invalid CIDR: {}", token))?;
            let count = host_count(&net);
            if count > self.max_hosts {
                bail!(
                    "CIDR {} expands to {} hosts which exceeds the allowed limit of {}",
                    net,
                    count,
                    self.max_hosts
                );
            }
            return Ok(net.hosts().collect());
        }

        // Range
        if let Some((start, end)) = token.split_once('-') {
            if start.trim().parse::<IpAddr>().is_ok() {
                return self.parse_range(start.trim(), end.trim());
            }
        }

        match token.parse::<IpAddr>() {
            Ok(ip) => Ok(vec![ip]),
            Err(_) => bail!("Invalid target {:?}: host names are not resolved", token),
        }
    }

    fn parse_range(&self, start: &str, end: &str) -> Result<Vec<IpAddr>> {
        let first: IpAddr = start
            .parse()
            .with_context(|| format!("Invalid start IP: {}", start))?;

        match first {
            IpAddr::V4(first) => {
                let last = match end.parse::<Ipv4Addr>() {
                    Ok(last) => last,
                    // "10.0.0.1-20" keeps the first three octets
                    Err(_) => {
                        let octet: u8 = end
                            .parse()
                            .with_context(|| format!("Invalid end IP: {}", end))?;
                        let [a, b, c, _] = first.octets();
                        Ipv4Addr::new(a, b, c, octet)
                    }
                };
                let (lo, hi) = (u32::from(first), u32::from(last));
                self.check_range(lo as u128, hi as u128)?;
                Ok((lo..=hi).map(|v| IpAddr::V4(Ipv4Addr::from(v))).collect())
            }
            IpAddr::V6(first) => {
                let last: Ipv6Addr = end
                    .parse()
                    .with_context(|| format!("Invalid end IP: {}", end))?;
                let (lo, hi) = (u128::from(first), u128::from(last));
                self.check_range(lo, hi)?;
                Ok((lo..=hi).map(|v| IpAddr::V6(Ipv6Addr::from(v))).collect())
            }
        }
    }

    fn check_range(&self, lo: u128, hi: u128) -> Result<()> {
        if lo > hi {
            bail!("Invalid IP range: start > end");
        }
        if hi - lo >= self.max_hosts {
            bail!(
                "Range expands to {} hosts which exceeds the allowed limit of {}",
                hi - lo + 1,
                self.max_hosts
            );
        }
        Ok(())
    }
}

/// Host count of a network, computed from the prefix without iterating.
fn host_count(net: &IpNet) -> u128 {
    let bits = net.max_prefix_len() - net.prefix_len();
    if bits >= 127 {
        u128::MAX
    } else {
        1u128 << bits
    }
}

impl Default for TargetResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn test_resolve_single_ip() {
        let ips = TargetResolver::new().resolve("8.8.8.8").unwrap();
        assert_eq!(ips, vec![v4(8, 8, 8, 8)]);

        let ips = TargetResolver::new().resolve("2001:db8::1").unwrap();
        assert_eq!(ips, vec!["2001:db8::1".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn test_resolve_cidr() {
        // hosts() skips network and broadcast
        let ips = TargetResolver::new().resolve("192.168.1.0/30").unwrap();
        assert_eq!(ips, vec![v4(192, 168, 1, 1), v4(192, 168, 1, 2)]);

        let ips = TargetResolver::new().resolve("2001:db8::/126").unwrap();
        assert_eq!(ips.len(), 4);
    }

    #[test]
    fn test_resolve_range() {
        let r = TargetResolver::new();
        assert_eq!(r.resolve("192.168.1.1-192.168.1.3").unwrap().len(), 3);
        assert_eq!(r.resolve("192.168.1.1-3").unwrap().len(), 3);
        assert_eq!(r.resolve("2001:db8::1-2001:db8::10").unwrap().len(), 16);
        assert!(r.resolve("192.168.1.5-192.168.1.1").is_err());
    }

    #[test]
    fn test_duplicates_removed_in_order() {
        let ips = TargetResolver::new()
            .resolve("10.0.0.2, 10.0.0.1-10.0.0.3, 10.0.0.2")
            .unwrap();
        assert_eq!(ips, vec![v4(10, 0, 0, 2), v4(10, 0, 0, 1), v4(10, 0, 0, 3)]);
    }

    #[test]
    fn test_large_cidr_rejected() {
        // /16 is 65536 hosts - rejected by default
        assert!(TargetResolver::new().resolve("10.0.0.0/16").is_err());
        assert!(TargetResolver::new().resolve("2001:db8::/64").is_err());

        let r = TargetResolver::new().with_max_hosts(70_000);
        assert!(r.resolve("10.0.0.0/16").is_ok());
    }

    #[test]
    fn test_hostnames_rejected() {
        let err = TargetResolver::new().resolve("example.com").unwrap_err();
        assert!(err.to_string().contains("host names"));
    }

    #[test]
    fn test_hyphenated_hostnames_rejected() {
        let resolver = TargetResolver::new();
        for name in ["db-01", "db-01.example.com", "-10.0.0.1"] {
            let err = resolver.resolve(name).unwrap_err();
            assert!(err.to_string().contains("host names"), "{}: {}", name, err);
        }
        assert!(resolver.resolve("10.0.0.1-x").is_err());
    }

    #[test]
    fn test_resolve_list_with_exclude() {
        let list = TargetResolver::new()
            .resolve_list("10.0.0.1-10.0.0.4", Some("10.0.0.2,10.0.0.3"))
            .unwrap();
        let ips: Vec<IpAddr> = list.iter().map(|(_, h)| h.ip).collect();
        assert_eq!(ips, vec![v4(10, 0, 0, 1), v4(10, 0, 0, 4)]);

        assert!(TargetResolver::new()
            .resolve_list("10.0.0.1", Some("10.0.0.1"))
            .is_err());
    }
}
