//! Core data types for the Boreas alive-detection engine
//!
//! Target hosts live in a caller-owned [`TargetList`]; the engine only refers to
//! them through [`HostId`] handles and address-string keys.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::BoreasError;

/// Canonical address-string key used by every keyed set in the engine.
#[inline]
#[must_use]
pub fn addr_key(ip: &IpAddr) -> String {
    ip.to_string()
}

/// One alive test type.
///
/// The discriminants are the values the scan manager stores in its database,
/// so they must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum AliveTest {
    TcpAck = 1,
    Icmp = 2,
    Arp = 4,
    ConsiderAlive = 8,
    TcpSyn = 16,
}

impl AliveTest {
    pub const ALL: [AliveTest; 5] = [
        AliveTest::TcpAck,
        AliveTest::Icmp,
        AliveTest::Arp,
        AliveTest::ConsiderAlive,
        AliveTest::TcpSyn,
    ];

    #[inline]
    #[must_use]
    pub const fn bit(self) -> u8 {
        self as u8
    }

    #[inline]
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            AliveTest::TcpAck => "tcp-ack",
            AliveTest::Icmp => "icmp",
            AliveTest::Arp => "arp",
            AliveTest::ConsiderAlive => "consider-alive",
            AliveTest::TcpSyn => "tcp-syn",
        }
    }
}

impl fmt::Display for AliveTest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AliveTest {
    type Err = BoreasError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp-ack" | "tcp_ack" | "ack" => Ok(AliveTest::TcpAck),
            "icmp" | "ping" => Ok(AliveTest::Icmp),
            "arp" => Ok(AliveTest::Arp),
            "consider-alive" | "consider_alive" | "none" => Ok(AliveTest::ConsiderAlive),
            "tcp-syn" | "tcp_syn" | "syn" => Ok(AliveTest::TcpSyn),
            other => Err(BoreasError::Config(format!("unknown alive test '{}'", other))),
        }
    }
}

/// The alive test selector: an immutable set of [`AliveTest`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct AliveTestSet(u8);

impl AliveTestSet {
    const MASK: u8 = 0x1f;

    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Build a selector from the numeric bitmask used by the scan manager.
    pub fn from_bits(bits: u32) -> Result<Self, BoreasError> {
        if bits == 0 || bits & !(Self::MASK as u32) != 0 {
            return Err(BoreasError::Config(format!(
                "invalid alive test bitmask {}",
                bits
            )));
        }
        Ok(Self(bits as u8))
    }

    #[inline]
    #[must_use]
    pub const fn bits(&self) -> u8 {
        self.0
    }

    #[inline]
    #[must_use]
    pub fn with(mut self, test: AliveTest) -> Self {
        self.0 |= test.bit();
        self
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, test: AliveTest) -> bool {
        self.0 & test.bit() != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Whether any TCP ping (ACK or SYN) is selected.
    #[inline]
    #[must_use]
    pub const fn has_tcp(&self) -> bool {
        self.contains(AliveTest::TcpAck) || self.contains(AliveTest::TcpSyn)
    }

    /// Whether packets are sent at all. Consider-alive short-circuits every
    /// other test.
    #[inline]
    #[must_use]
    pub const fn sends_probes(&self) -> bool {
        !self.contains(AliveTest::ConsiderAlive) && !self.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = AliveTest> + '_ {
        AliveTest::ALL.into_iter().filter(move |t| self.contains(*t))
    }
}

impl TryFrom<u32> for AliveTestSet {
    type Error = BoreasError;

    fn try_from(bits: u32) -> Result<Self, Self::Error> {
        Self::from_bits(bits)
    }
}

impl From<AliveTestSet> for u32 {
    fn from(set: AliveTestSet) -> u32 {
        set.0 as u32
    }
}

impl FromIterator<AliveTest> for AliveTestSet {
    fn from_iter<I: IntoIterator<Item = AliveTest>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), AliveTestSet::with)
    }
}

impl fmt::Display for AliveTestSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(|t| t.as_str()).collect();
        f.write_str(&names.join(","))
    }
}

impl FromStr for AliveTestSet {
    type Err = BoreasError;

    /// Accepts either the numeric bitmask (`"18"`) or a comma list of names
    /// (`"icmp,tcp-syn"`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(bits) = s.parse::<u32>() {
            return Self::from_bits(bits);
        }
        let set: AliveTestSet = s
            .split(',')
            .filter(|t| !t.trim().is_empty())
            .map(AliveTest::from_str)
            .collect::<Result<_, _>>()?;
        if set.is_empty() {
            return Err(BoreasError::Config("no alive test selected".to_string()));
        }
        Ok(set)
    }
}

/// Stable handle of a host inside a [`TargetList`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostId(pub usize);

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A single scan target, owned by the caller.
#[derive(Debug)]
pub struct TargetHost {
    pub ip: IpAddr,
    /// Optional name the caller associated with the address. Opaque to the engine.
    pub name: Option<String>,
    alive: AtomicBool,
}

impl TargetHost {
    #[must_use]
    pub fn new(ip: IpAddr) -> Self {
        Self {
            ip,
            name: None,
            alive: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    #[inline]
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Mark the host alive. Never reverses.
    #[inline]
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Release);
    }
}

impl fmt::Display for TargetHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", self.ip, name),
            None => write!(f, "{}", self.ip),
        }
    }
}

/// Caller-owned arena of target hosts. Duplicate addresses collapse onto the
/// first inserted host.
#[derive(Debug, Default)]
pub struct TargetList {
    hosts: Vec<TargetHost>,
    index: HashMap<IpAddr, HostId>,
}

impl TargetList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, host: TargetHost) -> HostId {
        if let Some(id) = self.index.get(&host.ip) {
            return *id;
        }
        let id = HostId(self.hosts.len());
        self.index.insert(host.ip, id);
        self.hosts.push(host);
        id
    }

    #[inline]
    #[must_use]
    pub fn get(&self, id: HostId) -> Option<&TargetHost> {
        self.hosts.get(id.0)
    }

    #[must_use]
    pub fn id_of(&self, ip: &IpAddr) -> Option<HostId> {
        self.index.get(ip).copied()
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (HostId, &TargetHost)> {
        self.hosts.iter().enumerate().map(|(i, h)| (HostId(i), h))
    }
}

impl FromIterator<IpAddr> for TargetList {
    fn from_iter<I: IntoIterator<Item = IpAddr>>(iter: I) -> Self {
        let mut list = TargetList::new();
        for ip in iter {
            list.insert(TargetHost::new(ip));
        }
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn alive_test_set_from_bitmask() {
        let set = AliveTestSet::from_bits(18).unwrap();
        assert!(set.contains(AliveTest::Icmp));
        assert!(set.contains(AliveTest::TcpSyn));
        assert!(!set.contains(AliveTest::Arp));
        assert!(set.sends_probes());

        assert!(AliveTestSet::from_bits(0).is_err());
        assert!(AliveTestSet::from_bits(32).is_err());
    }

    #[test]
    fn alive_test_set_from_names() {
        let set: AliveTestSet = "icmp, arp".parse().unwrap();
        assert_eq!(set.bits(), 6);
        assert_eq!(set.to_string(), "icmp,arp");

        let numeric: AliveTestSet = "8".parse().unwrap();
        assert!(!numeric.sends_probes());

        assert!("icmp,bogus".parse::<AliveTestSet>().is_err());
        assert!(" , ".parse::<AliveTestSet>().is_err());
    }

    #[test]
    fn target_list_deduplicates() {
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let mut list = TargetList::new();
        let a = list.insert(TargetHost::new(ip).with_name("gw"));
        let b = list.insert(TargetHost::new(ip));
        assert_eq!(a, b);
        assert_eq!(list.len(), 1);
        assert_eq!(list.get(a).unwrap().name.as_deref(), Some("gw"));
        assert_eq!(list.id_of(&ip), Some(a));
    }

    #[test]
    fn mark_alive_is_sticky() {
        let host = TargetHost::new(IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert!(!host.is_alive());
        host.mark_alive();
        host.mark_alive();
        assert!(host.is_alive());
    }
}
