//! Sender scheduler
//!
//! Walks the target list once, sending every enabled probe to each host and
//! pausing between bursts. It never waits for replies.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use boreas_common::{AliveTest, AliveTestSet, ScanRestrictions, TargetList};
use boreas_orchestrator::{
    AliveEvent, AliveEventSender, BurstLimiter, EventSource, ProgressTracker,
};

use crate::error::AliveError;
use crate::packet::{Probe, ProbeBuilder};
use crate::socket::ProbeTransport;

pub struct SenderScheduler {
    transport: Arc<dyn ProbeTransport>,
    builder: ProbeBuilder,
    selector: AliveTestSet,
    tcp_ports: Vec<u16>,
    limiter: BurstLimiter,
    progress: Arc<ProgressTracker>,
    shutdown: Arc<AtomicBool>,
}

impl SenderScheduler {
    pub fn new(
        transport: Arc<dyn ProbeTransport>,
        builder: ProbeBuilder,
        selector: AliveTestSet,
        tcp_ports: Vec<u16>,
        limiter: BurstLimiter,
        progress: Arc<ProgressTracker>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            transport,
            builder,
            selector,
            tcp_ports,
            limiter,
            progress,
            shutdown,
        }
    }

    /// Offer every enabled probe to every target. Returns the number of
    /// hosts probed, which is short of the target count only after shutdown.
    pub async fn run(mut self, targets: &TargetList) -> usize {
        let mut probed = 0;
        for (_, host) in targets.iter() {
            if self.shutdown.load(Ordering::Acquire) {
                info!(probed, remaining = targets.len() - probed, "sender stopped early");
                break;
            }
            self.limiter.acquire().await;
            self.probe_host(host.ip);
            self.progress.increment_hosts();
            probed += 1;
        }
        debug!(probed, pauses = self.limiter.pauses(), "sender finished");
        probed
    }

    fn probe_host(&self, dst: IpAddr) {
        if self.selector.has_tcp() {
            match self.transport.source_addr(&dst) {
                Ok(src) => {
                    for port in &self.tcp_ports {
                        self.send(self.builder.tcp(src, dst, *port));
                    }
                }
                Err(e) => self.failed(&dst, &e, self.tcp_ports.len() as u64),
            }
        }

        if self.selector.contains(AliveTest::Icmp) {
            let probe = self
                .transport
                .source_addr(&dst)
                .and_then(|src| self.builder.icmp(src, dst));
            self.send(probe);
        }

        if self.selector.contains(AliveTest::Arp) {
            // ARP only reaches IPv4 neighbours
            if let IpAddr::V4(v4) = dst {
                let probe = self
                    .transport
                    .link_source(&v4)
                    .and_then(|link| self.builder.arp(&link, dst));
                self.send(probe);
            }
        }
    }

    fn send(&self, probe: Result<Probe, AliveError>) {
        let result = probe.and_then(|p| self.transport.send(&p).map(|_| p));
        match result {
            Ok(_) => self.progress.increment_sent(),
            Err(e) => {
                warn!(error = %e, "probe not sent");
                self.progress.increment_failed();
            }
        }
    }

    fn failed(&self, dst: &IpAddr, err: &AliveError, probes: u64) {
        warn!(%dst, error = %err, "no source address, probes skipped");
        for _ in 0..probes {
            self.progress.increment_failed();
        }
    }
}

/// Consider-alive: report every target without sending a packet, bounded by
/// the restriction's own consider-alive counter.
pub async fn consider_alive(
    targets: &TargetList,
    restrictions: &ScanRestrictions,
    events: &AliveEventSender,
    shutdown: &AtomicBool,
) -> usize {
    let mut considered = 0;
    for (_, host) in targets.iter() {
        if shutdown.load(Ordering::Acquire) {
            break;
        }
        if !restrictions.try_consider_alive() {
            debug!(considered, "consider-alive bound reached");
            break;
        }
        if events
            .send(AliveEvent::new(host.ip, EventSource::ConsiderAlive))
            .await
            .is_err()
        {
            break;
        }
        considered += 1;
    }
    considered
}
