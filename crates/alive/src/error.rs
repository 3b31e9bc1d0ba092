use boreas_common::BoreasError;
use thiserror::Error;

use crate::socket::SocketKind;

#[derive(Error, Debug)]
pub enum AliveError {
    #[error("address format error: {0}")]
    AddressFormat(String),

    #[error("{socket} socket unavailable (need root/CAP_NET_RAW): {source}")]
    SocketUnavailable {
        socket: SocketKind,
        #[source]
        source: std::io::Error,
    },

    #[error("required {0} socket is not open")]
    SocketNotOpen(SocketKind),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("capture error: {0}")]
    Capture(String),

    #[error("not implemented on this platform")]
    NotImplemented,

    #[error("results queue error: {0}")]
    Queue(String),

    #[error("detection task failed: {0}")]
    Task(String),

    #[error("configuration error: {0}")]
    Config(#[from] BoreasError),
}

impl From<AliveError> for BoreasError {
    fn from(err: AliveError) -> Self {
        match err {
            AliveError::AddressFormat(msg) => BoreasError::AddressFormat(msg),
            AliveError::SocketUnavailable { socket, source } => BoreasError::SocketUnavailable {
                socket: socket.to_string(),
                reason: source.to_string(),
            },
            AliveError::SocketNotOpen(socket) => BoreasError::SocketUnavailable {
                socket: socket.to_string(),
                reason: "not open".to_string(),
            },
            AliveError::Io(e) => BoreasError::Io(e),
            AliveError::Capture(msg) => BoreasError::Capture(msg),
            AliveError::NotImplemented => {
                BoreasError::Capture("not implemented on this platform".to_string())
            }
            AliveError::Queue(_) => BoreasError::QueueClosed,
            AliveError::Task(_) => BoreasError::Cancelled,
            AliveError::Config(e) => e,
        }
    }
}
