//! Error taxonomy for the relay.
//!
//! Only [`RelayError::Bind`] and [`RelayError::Connect`] are surfaced as hard
//! failures; everything that happens on an established connection is handled
//! by dropping that connection.

use std::io;
use std::net::SocketAddr;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("relay is not running")]
    NotRunning,

    #[error("i/o error on {peer}: {source}")]
    Io {
        peer: SocketAddr,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("empty line")]
    Empty,

    #[error("line is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("state contains a non-finite number")]
    NonFinite,

    #[error("failed to serialize message: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("line exceeds {limit} bytes without a terminator")]
    LineTooLong { limit: usize },
}

impl From<FrameError> for io::Error {
    fn from(err: FrameError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }
}
