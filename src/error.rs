//! Error taxonomy per the gateway's error-handling design: one variant per
//! named failure class, each carrying the information its recovery path
//! needs. Decode/I/O/adapter boundaries all funnel into this enum instead of
//! the teacher's flat `anyhow::Result` — the surface here is wide enough
//! that callers need to match on failure kind, not just log a string.

use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("client timed out")]
    ClientTimeout,

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("adapter error: {0}")]
    AdapterError(String),

    #[error("registry error: {0}")]
    RegistryError(String),

    #[error("usage log I/O error: {0}")]
    LogIoError(#[from] std::io::Error),

    #[error("notification delivery error: {0}")]
    NotificationError(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

/// The four player-visible Login Disconnect reasons named in the spec.
/// Kept as an enum rather than free-form strings so call sites can't typo
/// the wire text.
#[derive(Debug, Clone, Copy)]
pub enum DisconnectReason {
    Starting,
    FailedToStart,
    NoServerConfigured,
    InvalidLoginPacket,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DisconnectReason::Starting => "Server is starting, please try again.",
            DisconnectReason::FailedToStart => "Server failed to start. Please try again.",
            DisconnectReason::NoServerConfigured => "No server configured for this port.",
            DisconnectReason::InvalidLoginPacket => "Invalid login packet.",
        };
        f.write_str(text)
    }
}
