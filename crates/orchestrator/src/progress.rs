//! Send progress tracking

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

#[derive(Default)]
pub struct ProgressTracker {
    hosts_probed: AtomicU64,
    probes_sent: AtomicU64,
    probes_failed: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SendStats {
    pub hosts_probed: u64,
    pub probes_sent: u64,
    pub probes_failed: u64,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_hosts(&self) {
        self.hosts_probed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_sent(&self) {
        self.probes_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_failed(&self) {
        self.probes_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SendStats {
        SendStats {
            hosts_probed: self.hosts_probed.load(Ordering::Relaxed),
            probes_sent: self.probes_sent.load(Ordering::Relaxed),
            probes_failed: self.probes_failed.load(Ordering::Relaxed),
        }
    }

    pub fn print_summary(&self, total_hosts: usize) {
        let stats = self.snapshot();

        info!("Send Summary:");
        info!("  Target hosts: {}", total_hosts);
        info!("  Hosts probed: {}", stats.hosts_probed);
        info!("  Probes sent: {}", stats.probes_sent);
        info!("  Send failures: {}", stats.probes_failed);
        let attempted = stats.probes_sent + stats.probes_failed;
        if attempted > 0 {
            info!(
                "  Send success rate: {:.1}%",
                (stats.probes_sent as f64 / attempted as f64) * 100.0
            );
        }
    }
}
