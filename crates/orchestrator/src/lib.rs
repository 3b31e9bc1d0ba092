//! Orchestrator - host state bookkeeping, pacing and result handoff

mod orchestrator;
mod progress;
mod rate_limiter;
pub mod state;

pub use orchestrator::{publish, Orchestrator};
pub use progress::{ProgressTracker, SendStats};
pub use rate_limiter::BurstLimiter;
pub use state::{
    AliveEvent, AliveEventSender, EventSource, HostState, HostStateStore, StateTask, Transition,
};
