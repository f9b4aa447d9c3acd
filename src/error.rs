//! Client error taxonomy.
//!
//! Codec errors reject or degrade a single message; connection errors feed
//! the state machine, which decides recovery vs. failure; completion handles
//! always resolve with a specific kind, never a catch-all.

use aw_codec::CodecError;
use aw_protocol::{ErrorInfo, WireError};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
    #[error("wire: {0}")]
    Wire(#[from] WireError),
    #[error("transport: {0}")]
    Transport(String),
    #[error("operation timed out")]
    Timeout,
    #[error("connection refused: {0}")]
    ConnectRefused(String),
    #[error("authentication failed: {0}")]
    AuthFailure(ErrorInfo),
    #[error("channel failed: {0}")]
    ChannelFailed(ErrorInfo),
    #[error("channel is not attached; attach it first")]
    ChannelNotAttached,
    #[error("channel is suspended; operations resume when the connection recovers")]
    ChannelSuspended,
    #[error("send queue overflow")]
    QueueOverflow,
    #[error("connection is closed or was lost")]
    Disconnected,
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("broker rejected the request: {0}")]
    Remote(ErrorInfo),
    #[error("unexpected response from the broker: {0}")]
    BadResponse(String),
    #[error("invalid client options: {0}")]
    BadOptions(String),
}

impl Error {
    /// Wrap a broker `ErrorInfo`, routing auth-class codes to `AuthFailure`.
    pub fn from_error_info(info: ErrorInfo) -> Self {
        if (40100..40200).contains(&info.code) || info.status_code == Some(401) {
            Error::AuthFailure(info)
        } else {
            Error::Remote(info)
        }
    }

    /// Map the error a connect attempt failed with onto the specific kind a
    /// waiting `connect()` handle should resolve with.
    pub(crate) fn from_connection_failure(info: ErrorInfo) -> Self {
        if info.code == 80014 {
            Error::Timeout
        } else if info.status_code == Some(503) {
            Error::ConnectRefused(info.message)
        } else {
            Error::from_error_info(info)
        }
    }

    /// The `ErrorInfo` carried by this error, when there is one.
    pub fn error_info(&self) -> Option<&ErrorInfo> {
        match self {
            Error::AuthFailure(info) | Error::ChannelFailed(info) | Error::Remote(info) => {
                Some(info)
            }
            _ => None,
        }
    }
}
