// Tripbeacon Error Types
//
// Every failure in the sharing subsystem maps onto one of these variants.
// None of them are fatal to the process: each degrades to a status the UI can
// display plus a retry entry point (`ensure_connected`, `join` or `start`).

use std::fmt;

/// Top-level error type for the location-sharing subsystem
#[derive(Debug, Clone)]
pub enum BeaconError {
    /// Foreground location permission was refused by the user
    PermissionDenied,

    /// Transport-level failure (connect failure, timeout, socket error)
    Transport { reason: String },

    /// The server rejected a join request; carries the server message verbatim
    JoinRejected { message: String },

    /// An operation requiring a live connection was attempted while offline.
    /// No wire message was sent.
    NotConnected,

    /// A join/leave was already in flight; the second call is rejected
    /// rather than raced
    SessionBusy { operation: String },

    /// A pending request was invalidated by a disconnect before its
    /// acknowledgement arrived
    Disconnected { reason: String },

    /// A live session context already exists for this process
    ContextInUse,

    /// Malformed or unexpected wire frame
    Protocol { reason: String },
}

impl fmt::Display for BeaconError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PermissionDenied => write!(f, "location permission denied"),
            Self::Transport { reason } => write!(f, "transport error: {}", reason),
            Self::JoinRejected { message } => write!(f, "join rejected: {}", message),
            Self::NotConnected => write!(f, "connection not ready"),
            Self::SessionBusy { operation } => {
                write!(f, "another {} is already in flight", operation)
            }
            Self::Disconnected { reason } => write!(f, "disconnected: {}", reason),
            Self::ContextInUse => write!(f, "a live session context already exists"),
            Self::Protocol { reason } => write!(f, "protocol error: {}", reason),
        }
    }
}

impl std::error::Error for BeaconError {}

impl BeaconError {
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }

    pub fn disconnected(reason: impl Into<String>) -> Self {
        Self::Disconnected {
            reason: reason.into(),
        }
    }

    /// Whether retrying the same entry point can succeed without user action
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::NotConnected | Self::Disconnected { .. }
        )
    }
}

impl From<serde_json::Error> for BeaconError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol {
            reason: err.to_string(),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for BeaconError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport {
            reason: err.to_string(),
        }
    }
}
