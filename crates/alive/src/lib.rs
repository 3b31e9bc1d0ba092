//! Alive detection engine
//!
//! Finds out which targets answer before the expensive part of a scan runs.
//! Probes (TCP ACK/SYN ping, ICMP echo, ARP) leave through one raw socket per
//! protocol and family; replies are read from a packet capture, attributed to
//! the host that sent them and fed to the host state task, which enforces the
//! scan cap and finally publishes the alive hosts.
//!
//! - [`packet`]: probe construction
//! - [`socket`]: socket pool and the [`ProbeTransport`] seam
//! - [`filter`] / [`capture`]: reply classification and the capture thread
//! - [`scheduler`]: burst-paced sending
//! - [`detection`]: run wiring, [`start_alive_detection`]

pub mod capture;
pub mod detection;
pub mod error;
pub mod filter;
pub mod packet;
pub mod scheduler;
pub mod socket;

#[cfg(test)]
mod testutil;

pub use capture::{CaptureCounts, CaptureListener, CapturedFrame, FrameSource, PacketCapture};
pub use detection::{start_alive_detection, AliveDetection, DetectionReport, ShutdownSignal};
pub use error::AliveError;
pub use filter::{CaptureFilter, FilterClause, FrameVerdict, LinkType};
pub use packet::{tcp_flags, LinkSource, Probe, ProbeBuilder, ProbeKind};
pub use socket::{ProbeTransport, SocketKind, SocketPool};
