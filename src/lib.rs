//! Peer-to-peer authenticated, encrypted, record-oriented bulk data channel,
//! with connection racing over direct and relayed TCP.
//!
//! [`Transit`] negotiates a shared secret supplied by an outer protocol
//! (rendezvous, PAKE — neither of which live in this crate) into an
//! authenticated [`Connection`] by racing every viable way to reach the
//! peer: our own listener, the peer's direct hints, and (staggered, as a
//! fallback) the peer's relay hints. First successful handshake wins;
//! everything else is cancelled.

#![forbid(unsafe_code)]

pub mod clock;
mod connection;
mod dialer;
pub mod error;
mod handshake;
pub mod hints;
pub mod key;
mod listener;
mod race;
mod record;
mod transit;

pub use clock::{AsyncStdClock, Clock};
pub use connection::{Connection, Consumer};
pub use error::{TransitConnectError, TransitError, TransitHandshakeError};
pub use hints::{DirectHint, Hint};
pub use key::{GenericKey, Key, KeyPurpose, RelayToken, TransitKey, TransitRxKey, TransitTxKey};
pub use transit::{
    IfAddrsLocalAddresses, LocalAddresses, Role, Transit, TransitConfig,
    DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_RELAY_DELAY, DEFAULT_RELAY_SERVER,
};
