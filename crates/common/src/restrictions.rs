//! Scan restrictions: the alive-host counter and the scan cap.
//!
//! One instance is shared (behind an `Arc`) between the engine and its caller.
//! Readers may poll the accessors at any time while a run is in progress.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Debug)]
pub struct ScanRestrictions {
    alive_hosts_count: AtomicUsize,
    considered_alive: AtomicUsize,
    max_scan_hosts: usize,
    max_scan_hosts_reached: AtomicBool,
}

impl ScanRestrictions {
    /// `max_scan_hosts == None` means no cap.
    #[must_use]
    pub fn new(max_scan_hosts: Option<usize>) -> Self {
        Self {
            alive_hosts_count: AtomicUsize::new(0),
            considered_alive: AtomicUsize::new(0),
            max_scan_hosts: max_scan_hosts.unwrap_or(usize::MAX),
            max_scan_hosts_reached: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn unlimited() -> Self {
        Self::new(None)
    }

    /// Claim one slot under the cap. Check and increment are a single atomic
    /// step, so concurrent callers can never push the count past the maximum.
    pub fn try_claim_alive(&self) -> bool {
        let max = self.max_scan_hosts;
        let claimed = self
            .alive_hosts_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            });
        match claimed {
            Ok(prev) => {
                if prev + 1 >= max {
                    self.max_scan_hosts_reached.store(true, Ordering::Release);
                }
                true
            }
            Err(_) => {
                self.max_scan_hosts_reached.store(true, Ordering::Release);
                false
            }
        }
    }

    /// Claim a slot for a host short-circuited by the consider-alive test.
    /// Bounded by the same maximum so that consider-alive alone cannot exceed it.
    pub fn try_consider_alive(&self) -> bool {
        let max = self.max_scan_hosts;
        self.considered_alive
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .is_ok()
    }

    #[inline]
    #[must_use]
    pub fn max_scan_hosts_reached(&self) -> bool {
        self.max_scan_hosts_reached.load(Ordering::Acquire)
    }

    #[inline]
    #[must_use]
    pub fn get_alive_hosts_count(&self) -> usize {
        self.alive_hosts_count.load(Ordering::Acquire)
    }

    #[inline]
    #[must_use]
    pub fn get_max_scan_hosts(&self) -> usize {
        self.max_scan_hosts
    }

    #[inline]
    #[must_use]
    pub fn get_considered_alive_count(&self) -> usize {
        self.considered_alive.load(Ordering::Acquire)
    }
}

impl Default for ScanRestrictions {
    fn default() -> Self {
        Self::unlimited()
    }
}
