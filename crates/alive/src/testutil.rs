//! In-memory network for engine tests.

use parking_lot::Mutex;
use pnet::util::MacAddr;
use std::collections::{HashSet, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use crate::capture::{CapturedFrame, FrameSource};
use crate::error::AliveError;
use crate::filter::LinkType;
use crate::packet::{tcp_flags, LinkSource, Probe, ProbeKind};
use crate::socket::ProbeTransport;

pub const LOCAL_V4: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 100);
pub const LOCAL_V6: Ipv6Addr = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0x64);
pub const LOCAL_MAC: MacAddr = MacAddr(0x02, 0, 0, 0, 0, 0x64);

/// Hand-built reply frames.
pub mod frames {
    use super::*;

    fn ethernet(ethertype: u16, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(14 + payload.len());
        frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x64]);
        frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x01]);
        frame.extend_from_slice(&ethertype.to_be_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    fn ipv4(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, payload: &[u8]) -> Vec<u8> {
        let mut ip = vec![0u8; 20];
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&((20 + payload.len()) as u16).to_be_bytes());
        ip[8] = 64;
        ip[9] = proto;
        ip[12..16].copy_from_slice(&src.octets());
        ip[16..20].copy_from_slice(&dst.octets());
        ip.extend_from_slice(payload);
        ethernet(0x0800, &ip)
    }

    fn ipv6(src: Ipv6Addr, dst: Ipv6Addr, next: u8, payload: &[u8]) -> Vec<u8> {
        let mut ip = vec![0u8; 40];
        ip[0] = 0x60;
        ip[4..6].copy_from_slice(&(payload.len() as u16).to_be_bytes());
        ip[6] = next;
        ip[7] = 64;
        ip[8..24].copy_from_slice(&src.octets());
        ip[24..40].copy_from_slice(&dst.octets());
        ip.extend_from_slice(payload);
        ethernet(0x86dd, &ip)
    }

    fn tcp(sport: u16, dport: u16, flags: u8) -> [u8; 20] {
        let mut tcp = [0u8; 20];
        tcp[0..2].copy_from_slice(&sport.to_be_bytes());
        tcp[2..4].copy_from_slice(&dport.to_be_bytes());
        tcp[12] = 0x50;
        tcp[13] = flags;
        tcp
    }

    pub fn icmp_echo_reply(src: Ipv4Addr, dst: Ipv4Addr) -> Vec<u8> {
        ipv4(src, dst, 1, &[0, 0, 0, 0, 0, 1, 0, 1])
    }

    pub fn icmp_echo_request(src: Ipv4Addr, dst: Ipv4Addr) -> Vec<u8> {
        ipv4(src, dst, 1, &[8, 0, 0, 0, 0, 1, 0, 1])
    }

    pub fn icmpv6_echo_reply(src: Ipv6Addr, dst: Ipv6Addr) -> Vec<u8> {
        ipv6(src, dst, 58, &[129, 0, 0, 0, 0, 1, 0, 1])
    }

    pub fn tcp_v4(src: Ipv4Addr, dst: Ipv4Addr, sport: u16, dport: u16, flags: u8) -> Vec<u8> {
        ipv4(src, dst, 6, &tcp(sport, dport, flags))
    }

    pub fn tcp_v6(src: Ipv6Addr, dst: Ipv6Addr, sport: u16, dport: u16, flags: u8) -> Vec<u8> {
        ipv6(src, dst, 6, &tcp(sport, dport, flags))
    }

    pub fn arp_reply(sender: Ipv4Addr, target: Ipv4Addr) -> Vec<u8> {
        let mut arp = Vec::with_capacity(28);
        arp.extend_from_slice(&[0, 1, 0x08, 0x00, 6, 4, 0, 2]);
        arp.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x01]);
        arp.extend_from_slice(&sender.octets());
        arp.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x64]);
        arp.extend_from_slice(&target.octets());
        ethernet(0x0806, &arp)
    }
}

/// Frame source replaying a fixed list, then idling.
pub struct ScriptedFrames {
    frames: VecDeque<Vec<u8>>,
    link: LinkType,
}

impl ScriptedFrames {
    pub fn new(frames: Vec<Vec<u8>>) -> Self {
        Self {
            frames: frames.into(),
            link: LinkType::Ethernet,
        }
    }

    /// Replay as if captured on a tun-style interface.
    pub fn raw_ip(frames: Vec<Vec<u8>>) -> Self {
        Self {
            link: LinkType::RawIp,
            ..Self::new(frames)
        }
    }
}

impl FrameSource for ScriptedFrames {
    fn next_frame(&mut self, buf: &mut [u8]) -> io::Result<Option<CapturedFrame>> {
        match self.frames.pop_front() {
            Some(frame) => {
                buf[..frame.len()].copy_from_slice(&frame);
                Ok(Some(CapturedFrame {
                    len: frame.len(),
                    link: self.link,
                }))
            }
            None => {
                std::thread::sleep(Duration::from_millis(2));
                Ok(None)
            }
        }
    }
}

#[derive(Default)]
struct Wire {
    pending: VecDeque<Vec<u8>>,
    sent: Vec<(ProbeKind, IpAddr)>,
}

/// Loopback network: hosts in `responders` answer every probe they receive.
#[derive(Clone)]
pub struct LoopbackNetwork {
    responders: Arc<HashSet<IpAddr>>,
    unreachable: Arc<HashSet<IpAddr>>,
    wire: Arc<Mutex<Wire>>,
}

impl LoopbackNetwork {
    pub fn new(responders: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            responders: Arc::new(responders.into_iter().collect()),
            unreachable: Arc::new(HashSet::new()),
            wire: Arc::new(Mutex::new(Wire::default())),
        }
    }

    /// Sends toward these hosts fail.
    pub fn with_unreachable(mut self, hosts: impl IntoIterator<Item = IpAddr>) -> Self {
        self.unreachable = Arc::new(hosts.into_iter().collect());
        self
    }

    pub fn frames(&self) -> LoopbackFrames {
        LoopbackFrames { net: self.clone() }
    }

    pub fn sent(&self) -> Vec<(ProbeKind, IpAddr)> {
        self.wire.lock().sent.clone()
    }

    fn reply_to(&self, probe: &Probe) -> Option<Vec<u8>> {
        if !self.responders.contains(&probe.dst) {
            return None;
        }
        let reply = match (probe.kind, probe.dst) {
            (ProbeKind::IcmpV4, IpAddr::V4(dst)) => frames::icmp_echo_reply(dst, LOCAL_V4),
            (ProbeKind::IcmpV6, IpAddr::V6(dst)) => frames::icmpv6_echo_reply(dst, LOCAL_V6),
            (ProbeKind::ArpV4, IpAddr::V4(dst)) => frames::arp_reply(dst, LOCAL_V4),
            (ProbeKind::TcpV4, IpAddr::V4(dst)) => {
                let (sport, dport) = ports(&probe.bytes[20..]);
                frames::tcp_v4(dst, LOCAL_V4, dport, sport, tcp_flags::RST)
            }
            (ProbeKind::TcpV6, IpAddr::V6(dst)) => {
                let (sport, dport) = ports(&probe.bytes[40..]);
                frames::tcp_v6(dst, LOCAL_V6, dport, sport, tcp_flags::RST)
            }
            _ => return None,
        };
        Some(reply)
    }
}

fn ports(tcp: &[u8]) -> (u16, u16) {
    (
        u16::from_be_bytes([tcp[0], tcp[1]]),
        u16::from_be_bytes([tcp[2], tcp[3]]),
    )
}

impl ProbeTransport for LoopbackNetwork {
    fn source_addr(&self, dst: &IpAddr) -> Result<IpAddr, AliveError> {
        Ok(match dst {
            IpAddr::V4(_) => IpAddr::V4(LOCAL_V4),
            IpAddr::V6(_) => IpAddr::V6(LOCAL_V6),
        })
    }

    fn link_source(&self, _dst: &Ipv4Addr) -> Result<LinkSource, AliveError> {
        Ok(LinkSource {
            ip: LOCAL_V4,
            mac: LOCAL_MAC,
            ifindex: 1,
        })
    }

    fn send(&self, probe: &Probe) -> Result<(), AliveError> {
        if self.unreachable.contains(&probe.dst) {
            return Err(AliveError::Io(io::Error::new(
                io::ErrorKind::Other,
                "network unreachable",
            )));
        }
        let reply = self.reply_to(probe);
        let mut wire = self.wire.lock();
        wire.sent.push((probe.kind, probe.dst));
        if let Some(frame) = reply {
            wire.pending.push_back(frame);
        }
        Ok(())
    }
}

/// Receiving end of a [`LoopbackNetwork`].
pub struct LoopbackFrames {
    net: LoopbackNetwork,
}

impl FrameSource for LoopbackFrames {
    fn next_frame(&mut self, buf: &mut [u8]) -> io::Result<Option<CapturedFrame>> {
        let frame = self.net.wire.lock().pending.pop_front();
        match frame {
            Some(frame) => {
                buf[..frame.len()].copy_from_slice(&frame);
                Ok(Some(CapturedFrame::ethernet(frame.len())))
            }
            None => {
                std::thread::sleep(Duration::from_millis(2));
                Ok(None)
            }
        }
    }
}
