//! Error taxonomy for the transit core. Three layers, matching the three
//! places a caller can observe failure: negotiating a single candidate
//! connection, running an established one, and the overall `connect()` race.

use std::borrow::Cow;

/// Failure of a single connection's negotiation (handshake, relay preamble,
/// go/nevermind exchange). These are expected and routine: in a race most
/// contenders fail this way and only the race arbiter's first recorded
/// failure is ever surfaced to the application.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TransitHandshakeError {
    #[error("handshake failed: {0}")]
    BadHandshake(Cow<'static, str>),
    #[error("negotiation was cancelled")]
    Cancelled,
    #[error("timed out waiting for the peer")]
    Timeout,
    #[error("i/o error during handshake: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransitHandshakeError {
    fn from(err: std::io::Error) -> Self {
        TransitHandshakeError::Io(err.to_string())
    }
}

/// Failure of an established [`crate::connection::Connection`].
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum TransitError {
    #[error("received out-of-order record: got nonce {got}, expected {expected}")]
    BadNonce { got: String, expected: String },
    #[error("message authentication failed; the channel may be compromised")]
    Crypto,
    #[error("api misuse: {0}")]
    UsageError(Cow<'static, str>),
    #[error("connection was closed")]
    ConnectionClosed,
    #[error("i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransitError {
    fn from(err: std::io::Error) -> Self {
        TransitError::Io(err.to_string())
    }
}

/// Outcome of the top-level `Transit::connect()` race.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TransitConnectError {
    #[error("no contender produced a working connection: {0}")]
    AllContendersFailed(#[source] TransitHandshakeError),
    #[error("connect() was cancelled")]
    Cancelled,
    #[error("no contenders were offered (no hints, no listener)")]
    NoContenders,
}
