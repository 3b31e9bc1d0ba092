//! Capture listener
//!
//! A dedicated thread reads link-layer frames, runs them through the
//! [`CaptureFilter`] and forwards every match to the state task as an
//! [`AliveEvent`]. The thread polls its shutdown flag between reads, so a
//! stop request takes effect within one read timeout.

use serde::Serialize;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use boreas_orchestrator::{AliveEvent, AliveEventSender};

use crate::error::AliveError;
use crate::filter::{CaptureFilter, FrameVerdict, LinkType};

const RECV_BUFFER_SIZE: usize = 32 * 1024 * 1024;
const MAX_FRAME: usize = 65536;

/// Length and framing of one frame read into the caller's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapturedFrame {
    pub len: usize,
    pub link: LinkType,
}

impl CapturedFrame {
    #[must_use]
    pub fn ethernet(len: usize) -> Self {
        Self {
            len,
            link: LinkType::Ethernet,
        }
    }
}

/// Inbound side of the engine.
pub trait FrameSource: Send {
    /// Read one frame into `buf`. `Ok(None)` means nothing arrived within the
    /// source's read timeout.
    fn next_frame(&mut self, buf: &mut [u8]) -> io::Result<Option<CapturedFrame>>;
}

impl<F: FrameSource + ?Sized> FrameSource for Box<F> {
    fn next_frame(&mut self, buf: &mut [u8]) -> io::Result<Option<CapturedFrame>> {
        (**self).next_frame(buf)
    }
}

/// AF_PACKET capture of every frame on every interface. The hardware type in
/// each frame's link-layer address tells Ethernet from bare-IP interfaces.
pub struct PacketCapture {
    socket: Socket,
}

impl PacketCapture {
    pub fn open(read_timeout: Duration) -> Result<Self, AliveError> {
        let socket = open_capture_socket().map_err(|e| match e.kind() {
            io::ErrorKind::Unsupported => AliveError::NotImplemented,
            _ => AliveError::Capture(format!("cannot open capture socket: {}", e)),
        })?;
        socket.set_read_timeout(Some(read_timeout))?;
        if let Err(e) = socket.set_recv_buffer_size(RECV_BUFFER_SIZE) {
            debug!(error = %e, "could not enlarge capture buffer");
        }
        Ok(Self { socket })
    }
}

impl FrameSource for PacketCapture {
    fn next_frame(&mut self, buf: &mut [u8]) -> io::Result<Option<CapturedFrame>> {
        match recv_frame(&self.socket, buf) {
            Ok(frame) => Ok(Some(frame)),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(target_os = "linux")]
fn recv_frame(socket: &Socket, buf: &mut [u8]) -> io::Result<CapturedFrame> {
    use std::os::fd::AsRawFd;

    let mut sll: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
    let mut addr_len = std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
    let n = unsafe {
        libc::recvfrom(
            socket.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            0,
            &mut sll as *mut libc::sockaddr_ll as *mut libc::sockaddr,
            &mut addr_len,
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(CapturedFrame {
        len: n as usize,
        link: LinkType::from_hatype(sll.sll_hatype),
    })
}

#[cfg(not(target_os = "linux"))]
fn recv_frame(socket: &Socket, buf: &mut [u8]) -> io::Result<CapturedFrame> {
    use std::io::Read;

    let mut socket = socket;
    socket.read(buf).map(CapturedFrame::ethernet)
}

#[cfg(target_os = "linux")]
fn open_capture_socket() -> io::Result<Socket> {
    let protocol = (libc::ETH_P_ALL as u16).to_be() as libc::c_int;
    Socket::new(Domain::PACKET, Type::RAW, Some(Protocol::from(protocol)))
}

#[cfg(not(target_os = "linux"))]
fn open_capture_socket() -> io::Result<Socket> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "packet capture needs Linux",
    ))
}

#[derive(Default)]
pub struct CaptureStats {
    pub frames_read: AtomicU64,
    pub frames_matched: AtomicU64,
    pub frames_malformed: AtomicU64,
}

/// Point-in-time copy of [`CaptureStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CaptureCounts {
    pub frames_read: u64,
    pub frames_matched: u64,
    pub frames_malformed: u64,
}

impl CaptureStats {
    pub fn snapshot(&self) -> CaptureCounts {
        CaptureCounts {
            frames_read: self.frames_read.load(Ordering::Relaxed),
            frames_matched: self.frames_matched.load(Ordering::Relaxed),
            frames_malformed: self.frames_malformed.load(Ordering::Relaxed),
        }
    }
}

pub struct CaptureListener {
    handle: JoinHandle<Result<(), AliveError>>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<CaptureStats>,
}

impl CaptureListener {
    /// Start the capture thread. It owns `source` until [`stop`](Self::stop).
    pub fn spawn<S>(
        source: S,
        filter: CaptureFilter,
        events: AliveEventSender,
    ) -> Result<Self, AliveError>
    where
        S: FrameSource + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(CaptureStats::default());
        info!(filter = %filter, "capture listener starting");

        let handle = std::thread::Builder::new()
            .name("alive-capture".to_string())
            .spawn({
                let shutdown = shutdown.clone();
                let stats = stats.clone();
                move || run_capture_loop(source, &filter, &events, &shutdown, &stats)
            })?;

        Ok(Self {
            handle,
            shutdown,
            stats,
        })
    }

    pub fn stats(&self) -> &Arc<CaptureStats> {
        &self.stats
    }

    /// Signal the thread and wait for it to exit. Dropping the thread's event
    /// sender is what lets the state task finish.
    pub async fn stop(self) -> Result<CaptureCounts, AliveError> {
        self.shutdown.store(true, Ordering::Release);
        let handle = self.handle;
        let joined = tokio::task::spawn_blocking(move || handle.join())
            .await
            .map_err(|e| AliveError::Capture(format!("capture join failed: {}", e)))?;
        match joined {
            Ok(result) => result?,
            Err(_) => return Err(AliveError::Capture("capture thread panicked".to_string())),
        }

        let counts = self.stats.snapshot();
        debug!(
            read = counts.frames_read,
            matched = counts.frames_matched,
            malformed = counts.frames_malformed,
            "capture listener stopped"
        );
        Ok(counts)
    }
}

fn run_capture_loop<S: FrameSource>(
    mut source: S,
    filter: &CaptureFilter,
    events: &AliveEventSender,
    shutdown: &AtomicBool,
    stats: &CaptureStats,
) -> Result<(), AliveError> {
    let mut buf = vec![0u8; MAX_FRAME];

    while !shutdown.load(Ordering::Acquire) {
        let frame = match source.next_frame(&mut buf) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "capture read failed");
                return Err(AliveError::Capture(e.to_string()));
            }
        };
        stats.frames_read.fetch_add(1, Ordering::Relaxed);

        let len = frame.len.min(buf.len());
        match filter.inspect(frame.link, &buf[..len]) {
            FrameVerdict::Reply { addr, source: origin } => {
                stats.frames_matched.fetch_add(1, Ordering::Relaxed);
                trace!(%addr, %origin, "reply captured");
                if events.blocking_send(AliveEvent::new(addr, origin)).is_err() {
                    // state task gone, nothing left to report to
                    break;
                }
            }
            FrameVerdict::Malformed => {
                stats.frames_malformed.fetch_add(1, Ordering::Relaxed);
                trace!(len, "malformed frame skipped");
            }
            FrameVerdict::Unrelated => {}
        }
    }

    Ok(())
}
