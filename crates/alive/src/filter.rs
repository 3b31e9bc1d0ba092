//! Capture filter
//!
//! One clause per enabled test family. The composed filter renders a
//! pcap-style expression for the logs and classifies frames in user space:
//! a matching frame yields the address of the host that answered.

use pnet::packet::arp::{ArpOperations, ArpPacket};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::icmp::{IcmpPacket, IcmpTypes};
use pnet::packet::icmpv6::{Icmpv6Packet, Icmpv6Types};
use pnet::packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::Packet;
use std::fmt;
use std::net::IpAddr;

use boreas_common::{AliveTest, AliveTestSet};
use boreas_orchestrator::EventSource;

use crate::packet::tcp_flags;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterClause {
    /// ARP opcode 2, attributed to the advertised sender address.
    ArpReply,
    IcmpEchoReply,
    Icmpv6EchoReply,
    /// SYN+ACK or RST sent back to the reserved source port.
    TcpReply { port: u16 },
}

impl FilterClause {
    pub fn expression(&self) -> String {
        match self {
            FilterClause::ArpReply => "arp and arp[6:2] = 2".to_string(),
            FilterClause::IcmpEchoReply => "icmp and icmp[icmptype] = icmp-echoreply".to_string(),
            FilterClause::Icmpv6EchoReply => "icmp6 and ip6[40] = 129".to_string(),
            FilterClause::TcpReply { port } => format!(
                "tcp dst port {} and (tcp[13] & 0x12 = 0x12 or tcp[13] & 0x04 != 0)",
                port
            ),
        }
    }

}

/// Framing of a captured packet, from the hardware type of the interface it
/// arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkType {
    #[default]
    Ethernet,
    /// tun, WireGuard, PPP and IP tunnels hand over bare IP packets.
    RawIp,
    Unsupported,
}

impl LinkType {
    /// Map an `ARPHRD_*` hardware type.
    #[must_use]
    pub fn from_hatype(hatype: u16) -> Self {
        match hatype {
            // ether, loopback
            1 | 772 => LinkType::Ethernet,
            // ppp, rawip, tunnel, tunnel6, sit, ipgre, none
            512 | 519 | 768 | 769 | 776 | 778 | 0xfffe => LinkType::RawIp,
            _ => LinkType::Unsupported,
        }
    }
}

/// Result of inspecting one captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameVerdict {
    Reply { addr: IpAddr, source: EventSource },
    /// Well-formed but not a reply to this run.
    Unrelated,
    /// Truncated or inconsistent headers.
    Malformed,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CaptureFilter {
    clauses: Vec<FilterClause>,
}

impl CaptureFilter {
    /// Compose the clauses for the tests in `selector`. Consider-alive sends
    /// nothing and therefore captures nothing.
    pub fn for_selector(selector: AliveTestSet, filter_port: u16) -> Self {
        let mut clauses = Vec::new();
        if !selector.sends_probes() {
            return Self { clauses };
        }
        if selector.contains(AliveTest::Arp) {
            clauses.push(FilterClause::ArpReply);
        }
        if selector.contains(AliveTest::Icmp) {
            clauses.push(FilterClause::IcmpEchoReply);
            clauses.push(FilterClause::Icmpv6EchoReply);
        }
        if selector.has_tcp() {
            clauses.push(FilterClause::TcpReply { port: filter_port });
        }
        Self { clauses }
    }

    pub fn clauses(&self) -> &[FilterClause] {
        &self.clauses
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn expression(&self) -> String {
        self.clauses
            .iter()
            .map(|c| format!("({})", c.expression()))
            .collect::<Vec<_>>()
            .join(" or ")
    }

    /// Origin address of `frame` if it answers one of this run's probes.
    pub fn classify(&self, link: LinkType, frame: &[u8]) -> Option<IpAddr> {
        match self.inspect(link, frame) {
            FrameVerdict::Reply { addr, .. } => Some(addr),
            _ => None,
        }
    }

    pub fn inspect(&self, link: LinkType, frame: &[u8]) -> FrameVerdict {
        match link {
            LinkType::Ethernet => self.inspect_ethernet(frame),
            LinkType::RawIp => self.inspect_ip(frame),
            LinkType::Unsupported => FrameVerdict::Unrelated,
        }
    }

    fn inspect_ethernet(&self, frame: &[u8]) -> FrameVerdict {
        let Some(eth) = EthernetPacket::new(frame) else {
            return FrameVerdict::Malformed;
        };
        match eth.get_ethertype() {
            EtherTypes::Arp => self.inspect_arp(eth.payload()),
            EtherTypes::Ipv4 => self.inspect_ipv4(eth.payload()),
            EtherTypes::Ipv6 => self.inspect_ipv6(eth.payload()),
            _ => FrameVerdict::Unrelated,
        }
    }

    /// Bare IP packet: the version nibble picks the family.
    fn inspect_ip(&self, packet: &[u8]) -> FrameVerdict {
        match packet.first().map(|b| b >> 4) {
            Some(4) => self.inspect_ipv4(packet),
            Some(6) => self.inspect_ipv6(packet),
            _ => FrameVerdict::Malformed,
        }
    }

    fn has(&self, clause: FilterClause) -> bool {
        self.clauses.contains(&clause)
    }

    fn tcp_port(&self) -> Option<u16> {
        self.clauses.iter().find_map(|c| match c {
            FilterClause::TcpReply { port } => Some(*port),
            _ => None,
        })
    }

    fn inspect_arp(&self, payload: &[u8]) -> FrameVerdict {
        if !self.has(FilterClause::ArpReply) {
            return FrameVerdict::Unrelated;
        }
        let Some(arp) = ArpPacket::new(payload) else {
            return FrameVerdict::Malformed;
        };
        if arp.get_operation() != ArpOperations::Reply {
            return FrameVerdict::Unrelated;
        }
        FrameVerdict::Reply {
            addr: IpAddr::V4(arp.get_sender_proto_addr()),
            source: EventSource::ArpReply,
        }
    }

    fn inspect_ipv4(&self, payload: &[u8]) -> FrameVerdict {
        let Some(ip) = Ipv4Packet::new(payload) else {
            return FrameVerdict::Malformed;
        };
        let header_len = ip.get_header_length() as usize * 4;
        if header_len < 20 || (ip.get_total_length() as usize) < header_len {
            return FrameVerdict::Malformed;
        }
        let addr = IpAddr::V4(ip.get_source());
        match ip.get_next_level_protocol() {
            IpNextHeaderProtocols::Icmp => {
                if !self.has(FilterClause::IcmpEchoReply) {
                    return FrameVerdict::Unrelated;
                }
                let Some(icmp) = IcmpPacket::new(ip.payload()) else {
                    return FrameVerdict::Malformed;
                };
                if icmp.get_icmp_type() == IcmpTypes::EchoReply {
                    FrameVerdict::Reply {
                        addr,
                        source: EventSource::IcmpEchoReply,
                    }
                } else {
                    FrameVerdict::Unrelated
                }
            }
            proto => self.inspect_transport(proto, ip.payload(), addr),
        }
    }

    fn inspect_ipv6(&self, payload: &[u8]) -> FrameVerdict {
        let Some(ip) = Ipv6Packet::new(payload) else {
            return FrameVerdict::Malformed;
        };
        let addr = IpAddr::V6(ip.get_source());
        match ip.get_next_header() {
            IpNextHeaderProtocols::Icmpv6 => {
                if !self.has(FilterClause::Icmpv6EchoReply) {
                    return FrameVerdict::Unrelated;
                }
                let Some(icmp) = Icmpv6Packet::new(ip.payload()) else {
                    return FrameVerdict::Malformed;
                };
                if icmp.get_icmpv6_type() == Icmpv6Types::EchoReply {
                    FrameVerdict::Reply {
                        addr,
                        source: EventSource::Icmpv6EchoReply,
                    }
                } else {
                    FrameVerdict::Unrelated
                }
            }
            proto => self.inspect_transport(proto, ip.payload(), addr),
        }
    }

    fn inspect_transport(
        &self,
        proto: IpNextHeaderProtocol,
        segment: &[u8],
        addr: IpAddr,
    ) -> FrameVerdict {
        if proto != IpNextHeaderProtocols::Tcp {
            return FrameVerdict::Unrelated;
        }
        let Some(port) = self.tcp_port() else {
            return FrameVerdict::Unrelated;
        };
        let Some(tcp) = TcpPacket::new(segment) else {
            return FrameVerdict::Malformed;
        };
        if tcp.get_destination() != port {
            return FrameVerdict::Unrelated;
        }
        if is_probe_reply(tcp.get_flags() as u8) {
            FrameVerdict::Reply {
                addr,
                source: EventSource::TcpReply,
            }
        } else {
            FrameVerdict::Unrelated
        }
    }
}

impl fmt::Display for CaptureFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression())
    }
}

/// SYN+ACK answers a SYN ping, RST answers either ping.
#[inline(always)]
fn is_probe_reply(flags: u8) -> bool {
    let syn_ack = tcp_flags::SYN | tcp_flags::ACK;
    flags & syn_ack == syn_ack || flags & tcp_flags::RST != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::frames;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn filter(tests: &[AliveTest]) -> CaptureFilter {
        CaptureFilter::for_selector(tests.iter().copied().collect(), 9910)
    }

    const TARGET: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const LOCAL: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 100);

    #[test]
    fn clauses_follow_selector() {
        let f = filter(&[AliveTest::Icmp, AliveTest::TcpSyn]);
        assert_eq!(
            f.clauses(),
            &[
                FilterClause::IcmpEchoReply,
                FilterClause::Icmpv6EchoReply,
                FilterClause::TcpReply { port: 9910 }
            ]
        );
        assert!(f.expression().contains("tcp dst port 9910"));
        assert!(f.expression().contains(" or "));

        assert!(filter(&[AliveTest::ConsiderAlive, AliveTest::Icmp]).is_empty());
    }

    #[test]
    fn echo_replies_classified_by_source() {
        let f = filter(&[AliveTest::Icmp]);
        let reply = frames::icmp_echo_reply(TARGET, LOCAL);
        assert_eq!(f.classify(LinkType::Ethernet, &reply), Some(IpAddr::V4(TARGET)));

        let request = frames::icmp_echo_request(LOCAL, TARGET);
        assert_eq!(f.classify(LinkType::Ethernet, &request), None);

        let v6_src: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let v6 = frames::icmpv6_echo_reply(v6_src, "2001:db8::64".parse().unwrap());
        assert_eq!(
            f.inspect(LinkType::Ethernet, &v6),
            FrameVerdict::Reply {
                addr: IpAddr::V6(v6_src),
                source: EventSource::Icmpv6EchoReply
            }
        );
    }

    #[test]
    fn tcp_reply_needs_reserved_port_and_reply_flags() {
        let f = filter(&[AliveTest::TcpAck]);
        let rst = frames::tcp_v4(TARGET, LOCAL, 80, 9910, tcp_flags::RST);
        assert_eq!(f.classify(LinkType::Ethernet, &rst), Some(IpAddr::V4(TARGET)));

        let syn_ack = frames::tcp_v4(TARGET, LOCAL, 80, 9910, tcp_flags::SYN | tcp_flags::ACK);
        assert_eq!(f.classify(LinkType::Ethernet, &syn_ack), Some(IpAddr::V4(TARGET)));

        // another port: unrelated traffic
        let other = frames::tcp_v4(TARGET, LOCAL, 80, 40000, tcp_flags::RST);
        assert_eq!(f.inspect(LinkType::Ethernet, &other), FrameVerdict::Unrelated);

        // our own outgoing ACK ping
        let own = frames::tcp_v4(LOCAL, TARGET, 9910, 80, tcp_flags::ACK);
        assert_eq!(f.classify(LinkType::Ethernet, &own), None);

        let bare_ack = frames::tcp_v4(TARGET, LOCAL, 80, 9910, tcp_flags::ACK);
        assert_eq!(f.classify(LinkType::Ethernet, &bare_ack), None);
    }

    #[test]
    fn arp_reply_uses_advertised_sender() {
        let f = filter(&[AliveTest::Arp]);
        let reply = frames::arp_reply(TARGET, LOCAL);
        assert_eq!(
            f.inspect(LinkType::Ethernet, &reply),
            FrameVerdict::Reply {
                addr: IpAddr::V4(TARGET),
                source: EventSource::ArpReply
            }
        );
        // disabled family is ignored
        assert_eq!(filter(&[AliveTest::Icmp]).classify(LinkType::Ethernet, &reply), None);
    }

    #[test]
    fn truncated_frames_are_malformed() {
        let f = filter(&[AliveTest::Icmp]);
        assert_eq!(f.inspect(LinkType::Ethernet, &[0u8; 6]), FrameVerdict::Malformed);

        let mut reply = frames::icmp_echo_reply(TARGET, LOCAL);
        reply.truncate(20);
        assert_eq!(f.inspect(LinkType::Ethernet, &reply), FrameVerdict::Malformed);
    }

    #[test]
    fn bare_ip_replies_on_tunnel_links() {
        let f = filter(&[AliveTest::Icmp, AliveTest::TcpAck]);
        let reply = frames::icmp_echo_reply(TARGET, LOCAL);
        let bare = &reply[14..];
        assert_eq!(f.classify(LinkType::RawIp, bare), Some(IpAddr::V4(TARGET)));

        let v6_src: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let v6 = frames::icmpv6_echo_reply(v6_src, "2001:db8::64".parse().unwrap());
        assert_eq!(f.classify(LinkType::RawIp, &v6[14..]), Some(IpAddr::V6(v6_src)));

        let rst = frames::tcp_v4(TARGET, LOCAL, 80, 9910, tcp_flags::RST);
        assert_eq!(f.classify(LinkType::RawIp, &rst[14..]), Some(IpAddr::V4(TARGET)));

        // the Ethernet parse of the same bytes finds nothing
        assert_eq!(f.classify(LinkType::Ethernet, bare), None);
        assert_eq!(f.inspect(LinkType::RawIp, &[]), FrameVerdict::Malformed);
        assert_eq!(f.inspect(LinkType::Unsupported, &reply), FrameVerdict::Unrelated);
    }

    #[test]
    fn link_type_from_hardware_type() {
        assert_eq!(LinkType::from_hatype(1), LinkType::Ethernet);
        assert_eq!(LinkType::from_hatype(772), LinkType::Ethernet);
        assert_eq!(LinkType::from_hatype(0xfffe), LinkType::RawIp);
        assert_eq!(LinkType::from_hatype(512), LinkType::RawIp);
        assert_eq!(LinkType::from_hatype(824), LinkType::Unsupported);
    }
}
