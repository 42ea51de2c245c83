use thiserror::Error;

use crate::transport::TransportError;

/// Failure taxonomy surfaced to callers of the request driver.  Every pending request
/// resolves with either a response packet or exactly one of these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// The peer answered with a Reset message; terminal for the exchange.
    #[error("rejected by peer")]
    Rejected,

    /// The retransmission budget was exhausted, or the Non-confirmable lifetime elapsed,
    /// without any reply from the peer.
    #[error("no response from peer")]
    TimedOut,

    /// The caller withdrew the request before it resolved.
    #[error("request canceled")]
    Canceled,

    /// The peer's datagram could not be decoded.
    #[error("malformed message: {0}")]
    Decode(String),

    /// A socket error occurred while this exchange's datagram was being sent.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The request could not be constructed, e.g. a bad URI or unresolvable host.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl From<TransportError> for ClientError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::MalformedPacket(inner) => ClientError::Decode(inner.to_string()),
            other => ClientError::Transport(other.to_string()),
        }
    }
}
