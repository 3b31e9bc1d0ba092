//! Host state store and the task that owns it.
//!
//! Every mutation arrives as an [`AliveEvent`] over a bounded channel and is
//! applied by a single task, so a transition never races another transition.
//! Per address:
//!
//! ```text
//! unknown --capture--> observed --target, cap free--> emitted
//!                               \-target, cap full--> capped
//! ```
//!
//! Addresses outside the target set stay observed. Nothing is ever removed.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use boreas_common::{addr_key, AliveRecord, HostId, ScanRestrictions, TargetList};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// What produced an alive event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventSource {
    ArpReply,
    IcmpEchoReply,
    Icmpv6EchoReply,
    TcpReply,
    ConsiderAlive,
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventSource::ArpReply => "arp",
            EventSource::IcmpEchoReply => "icmp",
            EventSource::Icmpv6EchoReply => "icmpv6",
            EventSource::TcpReply => "tcp",
            EventSource::ConsiderAlive => "consider-alive",
        };
        f.write_str(s)
    }
}

/// "Host confirmed alive" message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AliveEvent {
    pub addr: IpAddr,
    pub source: EventSource,
}

impl AliveEvent {
    #[inline]
    #[must_use]
    pub fn new(addr: IpAddr, source: EventSource) -> Self {
        Self { addr, source }
    }
}

/// Terminal state of a target address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Emitted,
    Capped,
}

/// Outcome of applying one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Emitted(HostId),
    Capped(HostId),
    /// Address replied but is not a target. Kept for diagnostics only.
    ObservedOnly,
    Duplicate,
}

pub struct HostStateStore {
    targets: HashMap<String, HostId>,
    observed: HashSet<String>,
    states: HashMap<String, HostState>,
    emitted: Vec<AliveRecord>,
    capped: Vec<String>,
    target_list: Arc<TargetList>,
    restrictions: Arc<ScanRestrictions>,
}

impl HostStateStore {
    #[must_use]
    pub fn new(target_list: Arc<TargetList>, restrictions: Arc<ScanRestrictions>) -> Self {
        let targets = target_list
            .iter()
            .map(|(id, host)| (addr_key(&host.ip), id))
            .collect();
        Self {
            targets,
            observed: HashSet::new(),
            states: HashMap::new(),
            emitted: Vec::new(),
            capped: Vec::new(),
            target_list,
            restrictions,
        }
    }

    /// Apply the update rule to one captured (or short-circuited) address.
    pub fn apply(&mut self, addr: &IpAddr) -> Transition {
        let key = addr_key(addr);
        if !self.observed.insert(key.clone()) {
            return Transition::Duplicate;
        }

        let Some(&id) = self.targets.get(&key) else {
            return Transition::ObservedOnly;
        };

        if let Some(host) = self.target_list.get(id) {
            host.mark_alive();
        }

        if self.restrictions.try_claim_alive() {
            self.states.insert(key.clone(), HostState::Emitted);
            self.emitted.push(AliveRecord { host: id, addr: key });
            Transition::Emitted(id)
        } else {
            self.states.insert(key.clone(), HostState::Capped);
            self.capped.push(key);
            Transition::Capped(id)
        }
    }

    #[must_use]
    pub fn state_of(&self, addr: &IpAddr) -> Option<HostState> {
        self.states.get(&addr_key(addr)).copied()
    }

    #[inline]
    #[must_use]
    pub fn is_observed(&self, addr: &IpAddr) -> bool {
        self.observed.contains(&addr_key(addr))
    }

    #[inline]
    #[must_use]
    pub fn is_target(&self, addr: &IpAddr) -> bool {
        self.targets.contains_key(&addr_key(addr))
    }

    /// Emitted hosts in confirmation order.
    #[must_use]
    pub fn emitted(&self) -> &[AliveRecord] {
        &self.emitted
    }

    #[must_use]
    pub fn capped(&self) -> &[String] {
        &self.capped
    }

    /// Addresses that replied but were never targets.
    pub fn observed_non_targets(&self) -> impl Iterator<Item = &String> {
        self.observed.iter().filter(|k| !self.targets.contains_key(*k))
    }
}

/// Sending half handed to producers of alive events.
pub type AliveEventSender = mpsc::Sender<AliveEvent>;

/// Background task owning the [`HostStateStore`].
///
/// The task ends once every [`AliveEventSender`] has been dropped.
pub struct StateTask {
    handle: JoinHandle<HostStateStore>,
}

impl StateTask {
    pub fn spawn(store: HostStateStore, buffer: usize) -> (AliveEventSender, StateTask) {
        let (tx, rx) = mpsc::channel(buffer);
        let handle = tokio::spawn(run_state_task(store, rx));
        (tx, StateTask { handle })
    }

    /// Wait for the task to drain its channel and return the final store.
    pub async fn finish(self) -> Result<HostStateStore, tokio::task::JoinError> {
        self.handle.await
    }
}

async fn run_state_task(
    mut store: HostStateStore,
    mut rx: mpsc::Receiver<AliveEvent>,
) -> HostStateStore {
    while let Some(event) = rx.recv().await {
        match store.apply(&event.addr) {
            Transition::Emitted(id) => {
                debug!(addr = %event.addr, host = %id, source = %event.source, "host alive")
            }
            Transition::Capped(id) => {
                info!(addr = %event.addr, host = %id, "host alive but max_scan_hosts reached")
            }
            Transition::ObservedOnly => {
                debug!(addr = %event.addr, source = %event.source, "reply from non-target")
            }
            Transition::Duplicate => {}
        }
    }
    store
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn store_with(targets: &[u8], max: Option<usize>) -> (HostStateStore, Arc<ScanRestrictions>) {
        let list: TargetList = targets.iter().map(|l| ip(*l)).collect();
        let restrictions = Arc::new(ScanRestrictions::new(max));
        (
            HostStateStore::new(Arc::new(list), restrictions.clone()),
            restrictions,
        )
    }

    #[test]
    fn first_reply_emits_then_duplicates_are_noops() {
        let (mut store, restrictions) = store_with(&[1, 2], None);
        assert_eq!(store.apply(&ip(1)), Transition::Emitted(HostId(0)));
        assert_eq!(store.apply(&ip(1)), Transition::Duplicate);
        assert_eq!(store.apply(&ip(1)), Transition::Duplicate);
        assert_eq!(store.emitted().len(), 1);
        assert_eq!(restrictions.get_alive_hosts_count(), 1);
        assert_eq!(store.state_of(&ip(1)), Some(HostState::Emitted));
        assert_eq!(store.state_of(&ip(2)), None);
    }

    #[test]
    fn cap_moves_later_hosts_to_capped() {
        let (mut store, restrictions) = store_with(&[1, 2, 3], Some(1));
        assert!(matches!(store.apply(&ip(2)), Transition::Emitted(_)));
        assert!(matches!(store.apply(&ip(1)), Transition::Capped(_)));
        assert!(matches!(store.apply(&ip(3)), Transition::Capped(_)));
        assert_eq!(restrictions.get_alive_hosts_count(), 1);
        assert!(restrictions.max_scan_hosts_reached());
        assert_eq!(store.capped(), &["10.0.0.1".to_string(), "10.0.0.3".to_string()]);

        // capped ⊆ observed ∩ target
        for key in store.capped() {
            let addr: IpAddr = key.parse().unwrap();
            assert!(store.is_observed(&addr));
            assert!(store.is_target(&addr));
        }
    }

    #[test]
    fn non_targets_only_observed() {
        let (mut store, restrictions) = store_with(&[1], None);
        assert_eq!(store.apply(&ip(9)), Transition::ObservedOnly);
        assert!(store.is_observed(&ip(9)));
        assert_eq!(store.state_of(&ip(9)), None);
        assert_eq!(store.observed_non_targets().count(), 1);
        assert_eq!(restrictions.get_alive_hosts_count(), 0);
    }

    #[test]
    fn emission_marks_caller_host_alive() {
        let list: TargetList = [ip(1), ip(2)].into_iter().collect();
        let list = Arc::new(list);
        let mut store = HostStateStore::new(list.clone(), Arc::new(ScanRestrictions::unlimited()));
        store.apply(&ip(2));
        assert!(!list.get(HostId(0)).unwrap().is_alive());
        assert!(list.get(HostId(1)).unwrap().is_alive());
    }

    #[tokio::test]
    async fn state_task_serialises_interleaved_producers() {
        let targets: Vec<u8> = (1..=40).collect();
        let (store, restrictions) = store_with(&targets, Some(10));
        let (tx, task) = StateTask::spawn(store, 8);

        let mut producers = Vec::new();
        for p in 0..4u8 {
            let tx = tx.clone();
            producers.push(tokio::spawn(async move {
                // overlapping address sets, different order per producer
                for i in 0..40u8 {
                    let last = ((i + p * 7) % 40) + 1;
                    tx.send(AliveEvent::new(ip(last), EventSource::TcpReply))
                        .await
                        .unwrap();
                }
            }));
        }
        drop(tx);
        for p in producers {
            p.await.unwrap();
        }

        let store = task.finish().await.unwrap();
        assert_eq!(store.emitted().len(), 10);
        assert_eq!(store.capped().len(), 30);
        assert_eq!(restrictions.get_alive_hosts_count(), 10);

        let unique: HashSet<_> = store.emitted().iter().map(|r| r.addr.clone()).collect();
        assert_eq!(unique.len(), 10);
    }
}
