use std::fmt;

/// Error kinds raised by [`crate::client::DuplexClient`] (spec.md §4.2, §7).
/// Distinguishable by variant, never by string matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// `Connect()` called while not in the `DISCONNECTED` state.
    NotDisconnected,
    DialFailed(String),
    HandshakeTimeout,
    LoginRejected(String),
    /// `SendAction` called while not `CONNECTED`.
    NotConnected,
    WriteFailed(String),
    ReadFailed(String),
    /// Reconnection exhausted `max_reconnect_tries`; the client has settled
    /// into `DISCONNECTED` and needs a fresh `Connect()`.
    BackoffExhausted,
    DecodeFailed(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::NotDisconnected => write!(f, "client is not in the DISCONNECTED state"),
            ClientError::DialFailed(reason) => write!(f, "dial failed: {reason}"),
            ClientError::HandshakeTimeout => write!(f, "login handshake timed out"),
            ClientError::LoginRejected(reason) => write!(f, "login rejected: {reason}"),
            ClientError::NotConnected => write!(f, "client is not CONNECTED"),
            ClientError::WriteFailed(reason) => write!(f, "write failed: {reason}"),
            ClientError::ReadFailed(reason) => write!(f, "read failed: {reason}"),
            ClientError::BackoffExhausted => {
                write!(f, "reconnect backoff exhausted max_reconnect_tries")
            }
            ClientError::DecodeFailed(reason) => write!(f, "frame decode failed: {reason}"),
        }
    }
}

impl std::error::Error for ClientError {}
