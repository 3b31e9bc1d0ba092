//! Error types for the Boreas alive-detection engine
//!
//! Fatal setup errors abort a run before probing starts. Per-probe failures are
//! never represented here; they are logged and counted by the engine.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BoreasError {
    #[error("Address format error: {0}")]
    AddressFormat(String),

    #[error("Socket unavailable ({socket}): {reason}")]
    SocketUnavailable { socket: String, reason: String },

    #[error("Capture error: {0}")]
    Capture(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Results queue closed")]
    QueueClosed,

    #[error("Operation cancelled")]
    Cancelled,
}

/// Result type alias for Boreas operations
pub type BoreasResult<T> = Result<T, BoreasError>;
