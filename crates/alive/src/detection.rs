//! Alive detection run: wiring and lifecycle
//!
//! ```text
//! scheduler --probes--> transport ~~wire~~> frame source --> listener
//!                                                               |
//!                                     AliveEvent (bounded channel)
//!                                                               v
//!                                  state task --complete--> results queue
//! ```
//!
//! The listener starts before the first probe leaves. Once the scheduler is
//! done the run waits out the grace window, stops the listener, drops every
//! socket and only then publishes.

use chrono::{DateTime, Utc};
use serde::Serialize;
use socket2::Socket;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use boreas_common::{AliveConfig, AliveRecord, AliveTestSet, ResultsQueue, ScanRestrictions, TargetList};
use boreas_orchestrator::{BurstLimiter, Orchestrator, SendStats};

use crate::capture::{CaptureCounts, CaptureListener, FrameSource, PacketCapture};
use crate::error::AliveError;
use crate::filter::CaptureFilter;
use crate::packet::ProbeBuilder;
use crate::scheduler::{consider_alive, SenderScheduler};
use crate::socket::{open_socket, AddressFamilies, ProbeTransport, SocketKind, SocketPool};

/// Final state of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionReport {
    pub run_id: Uuid,
    pub selector: AliveTestSet,
    /// Published hosts in confirmation order.
    pub emitted: Vec<AliveRecord>,
    /// Alive targets held back by the scan cap.
    pub capped: Vec<String>,
    /// Replies from addresses outside the target set.
    pub observed_non_targets: usize,
    pub considered_alive: usize,
    pub send: SendStats,
    pub capture: CaptureCounts,
    /// Set when a shutdown stopped the run before every target was probed.
    /// A shutdown during the grace window leaves it unset.
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

type ProbeIo = (Arc<dyn ProbeTransport>, Box<dyn FrameSource>);

/// Cloneable trigger for [`AliveDetection::shutdown`], usable after the
/// handle itself has been moved into `wait`.
#[derive(Clone)]
pub struct ShutdownSignal(Arc<AtomicBool>);

impl ShutdownSignal {
    pub fn trigger(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Handle to a running detection.
pub struct AliveDetection {
    run_id: Uuid,
    shutdown: Arc<AtomicBool>,
    handle: JoinHandle<Result<DetectionReport, AliveError>>,
}

/// Open the sockets and capture the selector needs, then start the run in
/// the background. Setup failures are returned before anything is sent.
pub fn start_alive_detection(
    targets: Arc<TargetList>,
    selector: AliveTestSet,
    restrictions: Arc<ScanRestrictions>,
    config: AliveConfig,
    queue: Arc<dyn ResultsQueue>,
) -> Result<AliveDetection, AliveError> {
    start_with_opener(targets, selector, restrictions, config, queue, open_socket)
}

fn start_with_opener<F>(
    targets: Arc<TargetList>,
    selector: AliveTestSet,
    restrictions: Arc<ScanRestrictions>,
    config: AliveConfig,
    queue: Arc<dyn ResultsQueue>,
    opener: F,
) -> Result<AliveDetection, AliveError>
where
    F: FnMut(SocketKind) -> io::Result<Socket>,
{
    config.validate()?;

    let io = if selector.sends_probes() {
        let pool = SocketPool::open_with(selector, AddressFamilies::of(&targets), opener)?;
        let capture = PacketCapture::open(config.capture_read_timeout)?;
        let transport: Arc<dyn ProbeTransport> = Arc::new(pool);
        let source: Box<dyn FrameSource> = Box::new(capture);
        Some((transport, source))
    } else {
        None
    };

    Ok(AliveDetection::spawn(io, targets, selector, restrictions, config, queue))
}

impl AliveDetection {
    /// Same pipeline as [`start_alive_detection`] over caller-supplied IO.
    pub fn spawn_with<S>(
        transport: Arc<dyn ProbeTransport>,
        capture: S,
        targets: Arc<TargetList>,
        selector: AliveTestSet,
        restrictions: Arc<ScanRestrictions>,
        config: AliveConfig,
        queue: Arc<dyn ResultsQueue>,
    ) -> Result<Self, AliveError>
    where
        S: FrameSource + 'static,
    {
        config.validate()?;
        let source: Box<dyn FrameSource> = Box::new(capture);
        Ok(Self::spawn(
            Some((transport, source)),
            targets,
            selector,
            restrictions,
            config,
            queue,
        ))
    }

    fn spawn(
        io: Option<ProbeIo>,
        targets: Arc<TargetList>,
        selector: AliveTestSet,
        restrictions: Arc<ScanRestrictions>,
        config: AliveConfig,
        queue: Arc<dyn ResultsQueue>,
    ) -> Self {
        let run_id = Uuid::new_v4();
        let shutdown = Arc::new(AtomicBool::new(false));
        let run = Run {
            run_id,
            targets,
            selector,
            restrictions,
            config,
            queue,
            shutdown: shutdown.clone(),
        };
        let handle = tokio::spawn(run.execute(io));
        Self {
            run_id,
            shutdown,
            handle,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Stop issuing probes. The grace window still runs and whatever was
    /// confirmed so far is published.
    pub fn shutdown(&self) {
        info!(run_id = %self.run_id, "shutdown requested");
        self.shutdown_signal().trigger();
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        ShutdownSignal(self.shutdown.clone())
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn wait(self) -> Result<DetectionReport, AliveError> {
        self.handle
            .await
            .map_err(|e| AliveError::Task(e.to_string()))?
    }
}

struct Run {
    run_id: Uuid,
    targets: Arc<TargetList>,
    selector: AliveTestSet,
    restrictions: Arc<ScanRestrictions>,
    config: AliveConfig,
    queue: Arc<dyn ResultsQueue>,
    shutdown: Arc<AtomicBool>,
}

impl Run {
    #[instrument(skip_all, fields(run_id = %self.run_id, selector = %self.selector))]
    async fn execute(self, io: Option<ProbeIo>) -> Result<DetectionReport, AliveError> {
        let started_at = Utc::now();
        info!(targets = self.targets.len(), "alive detection started");

        let orchestrator = Orchestrator::new(
            self.targets.clone(),
            self.restrictions.clone(),
            self.queue.clone(),
        );
        let (events, state_task) = orchestrator.start_state_task(self.config.event_buffer);

        let (capture, cancelled) = match io {
            Some((transport, source)) if self.selector.sends_probes() => {
                let filter = CaptureFilter::for_selector(self.selector, self.config.filter_port);
                let listener = CaptureListener::spawn(source, filter, events)?;
                let stats = listener.stats().clone();

                let scheduler = SenderScheduler::new(
                    transport.clone(),
                    ProbeBuilder::for_selector(self.selector, self.config.filter_port),
                    self.selector,
                    self.config.tcp_ports.clone(),
                    BurstLimiter::new(self.config.burst_size(), self.config.burst_timeout),
                    orchestrator.progress().clone(),
                    self.shutdown.clone(),
                );
                let probed = scheduler.run(&self.targets).await;

                info!(
                    wait_ms = self.config.wait_for_replies.as_millis() as u64,
                    "probes sent, waiting for late replies"
                );
                tokio::time::sleep(self.config.wait_for_replies).await;

                let counts = match listener.stop().await {
                    Ok(counts) => counts,
                    Err(e) => {
                        warn!(error = %e, "capture ended with an error, publishing partial results");
                        stats.snapshot()
                    }
                };
                // sockets close only once the listener is done
                drop(transport);
                (counts, probed < self.targets.len())
            }
            _ => {
                let considered =
                    consider_alive(&self.targets, &self.restrictions, &events, &self.shutdown)
                        .await;
                info!(considered, "targets considered alive without probing");
                drop(events);
                let stopped = self.shutdown.load(Ordering::Acquire);
                (CaptureCounts::default(), stopped && considered < self.targets.len())
            }
        };

        let store = orchestrator
            .complete(state_task)
            .await
            .map_err(|e| AliveError::Queue(format!("{:#}", e)))?;
        orchestrator.progress().print_summary(self.targets.len());

        Ok(DetectionReport {
            run_id: self.run_id,
            selector: self.selector,
            emitted: store.emitted().to_vec(),
            capped: store.capped().to_vec(),
            observed_non_targets: store.observed_non_targets().count(),
            considered_alive: self.restrictions.get_considered_alive_count(),
            send: orchestrator.progress().snapshot(),
            capture,
            cancelled,
            started_at,
            finished_at: Utc::now(),
        })
    }
}
