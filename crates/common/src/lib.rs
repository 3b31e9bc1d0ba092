//! Boreas Common - Shared types and traits
//!
//! This crate provides the types, traits, and configuration shared by the
//! Boreas alive-detection crates.

pub mod config;
pub mod error;
pub mod restrictions;
pub mod traits;
pub mod types;

// Re-export commonly used types
pub use config::AliveConfig;
pub use error::{BoreasError, BoreasResult};
pub use restrictions::ScanRestrictions;
pub use traits::{
    AliveRecord, ChannelQueue, MemoryQueue, QueueItem, ResultsQueue, ALIVE_DETECTION_FINISHED,
    ALIVE_DETECTION_QUEUE,
};
pub use types::{addr_key, AliveTest, AliveTestSet, HostId, TargetHost, TargetList};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
