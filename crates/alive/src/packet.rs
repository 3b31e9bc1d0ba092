//! Probe building
//!
//! Every probe is assembled in a fixed-size stack buffer sized for the worst
//! case of its family, so building never fails for lack of room.
//! - TCP pings carry a full IPv4/IPv6 header (sent on header-included raw sockets)
//! - ICMP echo requests are sent without IP header, the kernel adds it
//! - ARP requests are complete Ethernet frames

use bytes::Bytes;
use pnet::packet::arp::{ArpHardwareTypes, ArpOperations, MutableArpPacket};
use pnet::packet::ethernet::{EtherTypes, MutableEthernetPacket};
use pnet::util::MacAddr;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicU16, Ordering};

use boreas_common::{AliveTest, AliveTestSet};

use crate::error::AliveError;
use crate::socket::SocketKind;

/// TCP flag constants
pub mod tcp_flags {
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const ACK: u8 = 0x10;
}

pub const ETH_HDR_LEN: usize = 14;
pub const ARP_LEN: usize = 28;
pub const IPV4_HDR_LEN: usize = 20;
pub const IPV6_HDR_LEN: usize = 40;
pub const TCP_HDR_LEN: usize = 20;
pub const ICMP_ECHO_LEN: usize = 8;

const PROTO_TCP: u8 = 6;
const PROTO_ICMPV6: u8 = 58;
const ICMP_ECHO_REQUEST: u8 = 8;
const ICMPV6_ECHO_REQUEST: u8 = 128;

/// Protocol/family of one probe. Each kind goes out on exactly one socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeKind {
    TcpV4,
    TcpV6,
    IcmpV4,
    IcmpV6,
    ArpV4,
}

impl ProbeKind {
    #[must_use]
    pub const fn socket(&self) -> SocketKind {
        match self {
            ProbeKind::TcpV4 => SocketKind::TcpV4,
            ProbeKind::TcpV6 => SocketKind::TcpV6,
            ProbeKind::IcmpV4 => SocketKind::IcmpV4,
            ProbeKind::IcmpV6 => SocketKind::IcmpV6,
            ProbeKind::ArpV4 => SocketKind::ArpV4,
        }
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProbeKind::TcpV4 => "tcp/v4",
            ProbeKind::TcpV6 => "tcp/v6",
            ProbeKind::IcmpV4 => "icmp/v4",
            ProbeKind::IcmpV6 => "icmp/v6",
            ProbeKind::ArpV4 => "arp",
        };
        f.write_str(s)
    }
}

/// A ready-to-send probe.
#[derive(Debug, Clone)]
pub struct Probe {
    pub kind: ProbeKind,
    pub dst: IpAddr,
    pub bytes: Bytes,
    /// Egress interface, set for link-layer probes.
    pub ifindex: Option<u32>,
}

/// Layer-2 identity of the interface an ARP request leaves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSource {
    pub ip: Ipv4Addr,
    pub mac: MacAddr,
    pub ifindex: u32,
}

/// Builds the probes of one run. The TCP flag, the reserved source port and
/// the ICMP identifier are fixed for the run's lifetime.
#[derive(Debug)]
pub struct ProbeBuilder {
    tcp_flag: u8,
    filter_port: u16,
    icmp_id: u16,
    icmp_seq: AtomicU16,
}

impl ProbeBuilder {
    #[must_use]
    pub fn new(tcp_flag: u8, filter_port: u16) -> Self {
        Self {
            tcp_flag,
            filter_port,
            icmp_id: rand::random(),
            icmp_seq: AtomicU16::new(0),
        }
    }

    /// SYN wins when both TCP tests are selected.
    #[must_use]
    pub fn for_selector(selector: AliveTestSet, filter_port: u16) -> Self {
        let flag = if selector.contains(AliveTest::TcpSyn) {
            tcp_flags::SYN
        } else {
            tcp_flags::ACK
        };
        Self::new(flag, filter_port)
    }

    #[inline]
    #[must_use]
    pub fn tcp_flag(&self) -> u8 {
        self.tcp_flag
    }

    #[inline]
    #[must_use]
    pub fn icmp_identifier(&self) -> u16 {
        self.icmp_id
    }

    /// TCP ping from `src` (the reserved filter port) to `dst:dst_port`.
    pub fn tcp(&self, src: IpAddr, dst: IpAddr, dst_port: u16) -> Result<Probe, AliveError> {
        let seq = rand::random::<u32>();
        let (kind, bytes) = match (src, dst) {
            (IpAddr::V4(s), IpAddr::V4(d)) => {
                let mut buf = [0u8; IPV4_HDR_LEN + TCP_HDR_LEN];
                build_ipv4_tcp(&mut buf, &s, &d, self.filter_port, dst_port, seq, self.tcp_flag);
                (ProbeKind::TcpV4, Bytes::copy_from_slice(&buf))
            }
            (IpAddr::V6(s), IpAddr::V6(d)) => {
                let mut buf = [0u8; IPV6_HDR_LEN + TCP_HDR_LEN];
                build_ipv6_tcp(&mut buf, &s, &d, self.filter_port, dst_port, seq, self.tcp_flag);
                (ProbeKind::TcpV6, Bytes::copy_from_slice(&buf))
            }
            _ => {
                return Err(AliveError::AddressFormat(format!(
                    "source {} and destination {} differ in address family",
                    src, dst
                )))
            }
        };
        Ok(Probe {
            kind,
            dst,
            bytes,
            ifindex: None,
        })
    }

    /// ICMP / ICMPv6 echo request. The reply is attributed by source address,
    /// so identifier and sequence only need to be well-formed.
    pub fn icmp(&self, src: IpAddr, dst: IpAddr) -> Result<Probe, AliveError> {
        let seq = self.icmp_seq.fetch_add(1, Ordering::Relaxed);
        let mut buf = [0u8; ICMP_ECHO_LEN];
        let kind = match (src, dst) {
            (IpAddr::V4(_), IpAddr::V4(_)) => {
                build_icmp_echo(&mut buf, ICMP_ECHO_REQUEST, self.icmp_id, seq);
                let csum = checksum(&buf);
                buf[2..4].copy_from_slice(&csum.to_be_bytes());
                ProbeKind::IcmpV4
            }
            (IpAddr::V6(s), IpAddr::V6(d)) => {
                build_icmp_echo(&mut buf, ICMPV6_ECHO_REQUEST, self.icmp_id, seq);
                let csum = pseudo_checksum_v6(&s, &d, PROTO_ICMPV6, &buf);
                buf[2..4].copy_from_slice(&csum.to_be_bytes());
                ProbeKind::IcmpV6
            }
            _ => {
                return Err(AliveError::AddressFormat(format!(
                    "source {} and destination {} differ in address family",
                    src, dst
                )))
            }
        };
        Ok(Probe {
            kind,
            dst,
            bytes: Bytes::copy_from_slice(&buf),
            ifindex: None,
        })
    }

    /// Broadcast ARP request for `dst`. Only directly attached IPv4 neighbours
    /// can answer.
    pub fn arp(&self, src: &LinkSource, dst: IpAddr) -> Result<Probe, AliveError> {
        let IpAddr::V4(target) = dst else {
            return Err(AliveError::AddressFormat(format!(
                "ARP needs an IPv4 destination, got {}",
                dst
            )));
        };
        let mut buf = [0u8; ETH_HDR_LEN + ARP_LEN];
        build_arp_request(&mut buf, src.mac, src.ip, target);
        Ok(Probe {
            kind: ProbeKind::ArpV4,
            dst,
            bytes: Bytes::copy_from_slice(&buf),
            ifindex: Some(src.ifindex),
        })
    }
}

fn build_ipv4_tcp(
    buf: &mut [u8; IPV4_HDR_LEN + TCP_HDR_LEN],
    src: &Ipv4Addr,
    dst: &Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    flags: u8,
) {
    // IPv4 Header (20 bytes)
    buf[0] = 0x45; // Version 4, IHL 5
    buf[1] = 0x00;
    buf[2..4].copy_from_slice(&((IPV4_HDR_LEN + TCP_HDR_LEN) as u16).to_be_bytes());
    buf[4..6].copy_from_slice(&rand::random::<u16>().to_be_bytes());
    buf[6..8].copy_from_slice(&0x4000u16.to_be_bytes()); // DF
    buf[8] = 64;
    buf[9] = PROTO_TCP;
    buf[12..16].copy_from_slice(&src.octets());
    buf[16..20].copy_from_slice(&dst.octets());
    let ip_checksum = checksum(&buf[..IPV4_HDR_LEN]);
    buf[10..12].copy_from_slice(&ip_checksum.to_be_bytes());

    write_tcp_header(&mut buf[IPV4_HDR_LEN..], src_port, dst_port, seq, flags);
    let tcp_checksum = pseudo_checksum_v4(src, dst, PROTO_TCP, &buf[IPV4_HDR_LEN..]);
    buf[IPV4_HDR_LEN + 16..IPV4_HDR_LEN + 18].copy_from_slice(&tcp_checksum.to_be_bytes());
}

fn build_ipv6_tcp(
    buf: &mut [u8; IPV6_HDR_LEN + TCP_HDR_LEN],
    src: &Ipv6Addr,
    dst: &Ipv6Addr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    flags: u8,
) {
    // IPv6 Header (40 bytes)
    buf[0..4].copy_from_slice(&0x6000_0000u32.to_be_bytes());
    buf[4..6].copy_from_slice(&(TCP_HDR_LEN as u16).to_be_bytes());
    buf[6] = PROTO_TCP;
    buf[7] = 64;
    buf[8..24].copy_from_slice(&src.octets());
    buf[24..40].copy_from_slice(&dst.octets());

    write_tcp_header(&mut buf[IPV6_HDR_LEN..], src_port, dst_port, seq, flags);
    let tcp_checksum = pseudo_checksum_v6(src, dst, PROTO_TCP, &buf[IPV6_HDR_LEN..]);
    buf[IPV6_HDR_LEN + 16..IPV6_HDR_LEN + 18].copy_from_slice(&tcp_checksum.to_be_bytes());
}

/// Fills a 20-byte TCP header with a zero checksum.
fn write_tcp_header(tcp: &mut [u8], src_port: u16, dst_port: u16, seq: u32, flags: u8) {
    tcp[0..2].copy_from_slice(&src_port.to_be_bytes());
    tcp[2..4].copy_from_slice(&dst_port.to_be_bytes());
    tcp[4..8].copy_from_slice(&seq.to_be_bytes());
    // an ACK ping needs a non-zero acknowledgment number to look plausible
    let ack = if flags & tcp_flags::ACK != 0 {
        rand::random::<u32>()
    } else {
        0
    };
    tcp[8..12].copy_from_slice(&ack.to_be_bytes());
    tcp[12] = 0x50; // Data offset: 5 (20 bytes)
    tcp[13] = flags;
    tcp[14..16].copy_from_slice(&65535u16.to_be_bytes());
    tcp[16..18].copy_from_slice(&[0, 0]);
    tcp[18..20].copy_from_slice(&[0, 0]);
}

fn build_icmp_echo(buf: &mut [u8; ICMP_ECHO_LEN], icmp_type: u8, id: u16, seq: u16) {
    buf[0] = icmp_type;
    buf[1] = 0;
    buf[2..4].copy_from_slice(&[0, 0]);
    buf[4..6].copy_from_slice(&id.to_be_bytes());
    buf[6..8].copy_from_slice(&seq.to_be_bytes());
}

fn build_arp_request(
    buf: &mut [u8; ETH_HDR_LEN + ARP_LEN],
    src_mac: MacAddr,
    src_ip: Ipv4Addr,
    target: Ipv4Addr,
) {
    {
        let (eth_hdr, _) = buf.split_at_mut(ETH_HDR_LEN);
        // both slices are sized exactly for their packet types
        if let Some(mut eth) = MutableEthernetPacket::new(eth_hdr) {
            eth.set_destination(MacAddr::broadcast());
            eth.set_source(src_mac);
            eth.set_ethertype(EtherTypes::Arp);
        }
    }
    if let Some(mut arp) = MutableArpPacket::new(&mut buf[ETH_HDR_LEN..]) {
        arp.set_hardware_type(ArpHardwareTypes::Ethernet);
        arp.set_protocol_type(EtherTypes::Ipv4);
        arp.set_hw_addr_len(6);
        arp.set_proto_addr_len(4);
        arp.set_operation(ArpOperations::Request);
        arp.set_sender_hw_addr(src_mac);
        arp.set_sender_proto_addr(src_ip);
        arp.set_target_hw_addr(MacAddr::zero());
        arp.set_target_proto_addr(target);
    }
}

/// Sums big-endian 16-bit words, padding an odd trailing byte.
#[inline(always)]
fn sum_words(data: &[u8], mut sum: u32) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u16::from_be_bytes([pair[0], pair[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    sum
}

#[inline(always)]
fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Internet checksum (RFC 1071)
#[inline(always)]
pub fn checksum(data: &[u8]) -> u16 {
    fold(sum_words(data, 0))
}

/// Checksum over the IPv4 pseudo-header followed by `segment`.
#[inline(always)]
fn pseudo_checksum_v4(src: &Ipv4Addr, dst: &Ipv4Addr, proto: u8, segment: &[u8]) -> u16 {
    let mut sum = sum_words(&src.octets(), 0);
    sum = sum_words(&dst.octets(), sum);
    sum += proto as u32;
    sum += segment.len() as u32;
    fold(sum_words(segment, sum))
}

/// Checksum over the IPv6 pseudo-header followed by `segment`.
#[inline(always)]
fn pseudo_checksum_v6(src: &Ipv6Addr, dst: &Ipv6Addr, proto: u8, segment: &[u8]) -> u16 {
    let mut sum = sum_words(&src.octets(), 0);
    sum = sum_words(&dst.octets(), sum);
    sum += segment.len() as u32;
    sum += proto as u32;
    fold(sum_words(segment, sum))
}
