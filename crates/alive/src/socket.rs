//! Socket pool
//!
//! One raw socket per (protocol, family) the selector needs, opened once at
//! run start and closed when the pool is dropped. Two auxiliary UDP sockets
//! are only ever connected, never written to: the kernel's choice of local
//! address for a connected datagram socket gives the source address for the
//! TCP header without walking the routing table ourselves.

use dashmap::DashMap;
use parking_lot::Mutex;
use pnet::datalink;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tracing::{debug, info};

use boreas_common::{AliveTest, AliveTestSet, TargetList};

use crate::error::AliveError;
use crate::packet::{LinkSource, Probe, ProbeKind};

const SEND_BUFFER_SIZE: usize = 8 * 1024 * 1024;
/// Destination port used for the connect() source lookup. Nothing is sent.
const DISCARD_PORT: u16 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketKind {
    TcpV4,
    TcpV6,
    IcmpV4,
    IcmpV6,
    ArpV4,
    UdpV4,
    UdpV6,
}

impl fmt::Display for SocketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SocketKind::TcpV4 => "raw tcp/v4",
            SocketKind::TcpV6 => "raw tcp/v6",
            SocketKind::IcmpV4 => "raw icmp/v4",
            SocketKind::IcmpV6 => "raw icmp/v6",
            SocketKind::ArpV4 => "packet arp",
            SocketKind::UdpV4 => "udp/v4",
            SocketKind::UdpV6 => "udp/v6",
        };
        f.write_str(s)
    }
}

/// Address families present in a target set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddressFamilies {
    pub v4: bool,
    pub v6: bool,
}

impl AddressFamilies {
    pub fn of(targets: &TargetList) -> Self {
        let mut families = Self::default();
        for (_, host) in targets.iter() {
            match host.ip {
                IpAddr::V4(_) => families.v4 = true,
                IpAddr::V6(_) => families.v6 = true,
            }
        }
        families
    }
}

/// Socket kinds needed for `selector` over targets of `families`.
pub fn required_sockets(selector: AliveTestSet, families: AddressFamilies) -> Vec<SocketKind> {
    if !selector.sends_probes() {
        return Vec::new();
    }
    let mut kinds = Vec::new();
    if families.v4 {
        if selector.has_tcp() {
            kinds.push(SocketKind::TcpV4);
        }
        if selector.contains(AliveTest::Icmp) {
            kinds.push(SocketKind::IcmpV4);
        }
        if selector.contains(AliveTest::Arp) {
            kinds.push(SocketKind::ArpV4);
        }
        kinds.push(SocketKind::UdpV4);
    }
    if families.v6 {
        if selector.has_tcp() {
            kinds.push(SocketKind::TcpV6);
        }
        if selector.contains(AliveTest::Icmp) {
            kinds.push(SocketKind::IcmpV6);
        }
        // no ARP over IPv6
        if selector.has_tcp() || selector.contains(AliveTest::Icmp) {
            kinds.push(SocketKind::UdpV6);
        }
    }
    kinds
}

/// Outbound side of the engine. The raw-socket pool implements it for real
/// runs; tests substitute an in-memory network.
pub trait ProbeTransport: Send + Sync {
    /// Local address the kernel would use to reach `dst`.
    fn source_addr(&self, dst: &IpAddr) -> Result<IpAddr, AliveError>;

    /// Interface identity for ARP requests toward `dst`.
    fn link_source(&self, dst: &Ipv4Addr) -> Result<LinkSource, AliveError>;

    fn send(&self, probe: &Probe) -> Result<(), AliveError>;
}

pub struct SocketPool {
    raw: HashMap<SocketKind, Socket>,
    udp_v4: Option<Mutex<Socket>>,
    udp_v6: Option<Mutex<Socket>>,
    links: DashMap<Ipv4Addr, LinkSource>,
}

impl SocketPool {
    /// Open every socket the run needs. Any failure is fatal for the run.
    pub fn open(selector: AliveTestSet, families: AddressFamilies) -> Result<Self, AliveError> {
        Self::open_with(selector, families, open_socket)
    }

    /// [`open`](Self::open) with a caller-supplied socket constructor.
    pub fn open_with<F>(
        selector: AliveTestSet,
        families: AddressFamilies,
        mut opener: F,
    ) -> Result<Self, AliveError>
    where
        F: FnMut(SocketKind) -> std::io::Result<Socket>,
    {
        let mut pool = Self {
            raw: HashMap::new(),
            udp_v4: None,
            udp_v6: None,
            links: DashMap::new(),
        };

        for kind in required_sockets(selector, families) {
            let socket = opener(kind)
                .map_err(|source| AliveError::SocketUnavailable { socket: kind, source })?;
            debug!(socket = %kind, "socket opened");
            match kind {
                SocketKind::UdpV4 => pool.udp_v4 = Some(Mutex::new(socket)),
                SocketKind::UdpV6 => pool.udp_v6 = Some(Mutex::new(socket)),
                _ => {
                    pool.raw.insert(kind, socket);
                }
            }
        }

        info!(sockets = pool.raw.len(), "socket pool ready");
        Ok(pool)
    }

    #[must_use]
    pub fn is_open(&self, kind: SocketKind) -> bool {
        match kind {
            SocketKind::UdpV4 => self.udp_v4.is_some(),
            SocketKind::UdpV6 => self.udp_v6.is_some(),
            _ => self.raw.contains_key(&kind),
        }
    }

    fn raw_socket(&self, kind: SocketKind) -> Result<&Socket, AliveError> {
        self.raw.get(&kind).ok_or(AliveError::SocketNotOpen(kind))
    }
}

impl ProbeTransport for SocketPool {
    fn source_addr(&self, dst: &IpAddr) -> Result<IpAddr, AliveError> {
        let (udp, kind) = match dst {
            IpAddr::V4(_) => (&self.udp_v4, SocketKind::UdpV4),
            IpAddr::V6(_) => (&self.udp_v6, SocketKind::UdpV6),
        };
        let socket = udp.as_ref().ok_or(AliveError::SocketNotOpen(kind))?.lock();
        socket.connect(&SockAddr::from(SocketAddr::new(*dst, DISCARD_PORT)))?;
        let local = socket
            .local_addr()?
            .as_socket()
            .ok_or_else(|| AliveError::AddressFormat(format!("no local address toward {}", dst)))?;
        Ok(local.ip())
    }

    fn link_source(&self, dst: &Ipv4Addr) -> Result<LinkSource, AliveError> {
        let IpAddr::V4(ip) = self.source_addr(&IpAddr::V4(*dst))? else {
            return Err(AliveError::AddressFormat(format!(
                "IPv6 source chosen for {}",
                dst
            )));
        };
        if let Some(link) = self.links.get(&ip) {
            return Ok(*link);
        }

        let iface = datalink::interfaces()
            .into_iter()
            .find(|iface| iface.ips.iter().any(|net| net.ip() == IpAddr::V4(ip)))
            .ok_or_else(|| AliveError::AddressFormat(format!("no interface carries {}", ip)))?;
        let mac = iface
            .mac
            .ok_or_else(|| AliveError::AddressFormat(format!("{} has no MAC address", iface.name)))?;

        let link = LinkSource {
            ip,
            mac,
            ifindex: iface.index,
        };
        debug!(interface = %iface.name, %mac, "ARP source resolved");
        self.links.insert(ip, link);
        Ok(link)
    }

    fn send(&self, probe: &Probe) -> Result<(), AliveError> {
        let socket = self.raw_socket(probe.kind.socket())?;
        match probe.kind {
            ProbeKind::ArpV4 => send_link_broadcast(socket, probe),
            _ => {
                let dst = SockAddr::from(SocketAddr::new(probe.dst, 0));
                socket.send_to(&probe.bytes, &dst)?;
                Ok(())
            }
        }
    }
}

impl Drop for SocketPool {
    fn drop(&mut self) {
        debug!(sockets = self.raw.len(), "closing socket pool");
    }
}

/// Create the socket for `kind` with the options the pool relies on.
pub fn open_socket(kind: SocketKind) -> std::io::Result<Socket> {
    let socket = match kind {
        SocketKind::TcpV4 => {
            let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::from(libc::IPPROTO_RAW)))?;
            set_header_included(&socket)?;
            socket
        }
        // IPPROTO_RAW on an IPv6 socket implies a caller-built header
        SocketKind::TcpV6 => {
            Socket::new(Domain::IPV6, Type::RAW, Some(Protocol::from(libc::IPPROTO_RAW)))?
        }
        SocketKind::IcmpV4 => Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))?,
        SocketKind::IcmpV6 => Socket::new(Domain::IPV6, Type::RAW, Some(Protocol::ICMPV6))?,
        SocketKind::ArpV4 => open_packet_socket()?,
        SocketKind::UdpV4 => return Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)),
        SocketKind::UdpV6 => return Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP)),
    };
    socket.set_send_buffer_size(SEND_BUFFER_SIZE)?;
    Ok(socket)
}

#[cfg(target_os = "linux")]
fn set_header_included(socket: &Socket) -> std::io::Result<()> {
    use std::os::fd::AsRawFd;

    let one: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_HDRINCL,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_header_included(_socket: &Socket) -> std::io::Result<()> {
    Ok(())
}

#[cfg(target_os = "linux")]
fn open_packet_socket() -> std::io::Result<Socket> {
    let protocol = (libc::ETH_P_ARP as u16).to_be() as libc::c_int;
    Socket::new(Domain::PACKET, Type::RAW, Some(Protocol::from(protocol)))
}

#[cfg(not(target_os = "linux"))]
fn open_packet_socket() -> std::io::Result<Socket> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "packet sockets need Linux",
    ))
}

#[cfg(target_os = "linux")]
fn send_link_broadcast(socket: &Socket, probe: &Probe) -> Result<(), AliveError> {
    use std::os::fd::AsRawFd;

    let ifindex = probe
        .ifindex
        .ok_or_else(|| AliveError::AddressFormat("ARP probe without interface".to_string()))?;
    let mut sll: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
    sll.sll_family = libc::AF_PACKET as u16;
    sll.sll_protocol = (libc::ETH_P_ARP as u16).to_be();
    sll.sll_ifindex = ifindex as i32;
    sll.sll_halen = 6;
    sll.sll_addr[..6].copy_from_slice(&[0xff; 6]);

    let sent = unsafe {
        libc::sendto(
            socket.as_raw_fd(),
            probe.bytes.as_ptr() as *const libc::c_void,
            probe.bytes.len(),
            0,
            &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if sent < 0 {
        return Err(AliveError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn send_link_broadcast(_socket: &Socket, _probe: &Probe) -> Result<(), AliveError> {
    Err(AliveError::NotImplemented)
}
