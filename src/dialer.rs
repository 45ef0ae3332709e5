//! Outbound side: one dial task per viable peer hint, each racing
//! independently. Relay dials share a single flat `relay_delay`, gated on
//! whether any direct hint looked viable, so a direct connection gets a head
//! start when one exists and relays fire immediately when none does.

use std::sync::Arc;
use std::time::Duration;

use async_std::net::TcpStream;
use async_std::task::JoinHandle;

use crate::clock::Clock;
use crate::connection::{self, Connection, Socket, Winner};
use crate::error::TransitHandshakeError;
use crate::handshake;
use crate::hints::DirectHint;
use crate::key::{Key, TransitKey};
use crate::transit::Role;

#[allow(clippy::too_many_arguments)]
pub(crate) fn dial_direct(
    hint: DirectHint,
    role: Role,
    key: Arc<Key<TransitKey>>,
    clock: Arc<dyn Clock>,
    winner: Arc<Winner>,
    handshake_timeout: Duration,
) -> JoinHandle<Result<Connection, TransitHandshakeError>> {
    async_std::task::spawn(async move {
        let description = format!("direct -> {hint}");
        tracing::trace!(%description, "dialing");
        let stream = match TcpStream::connect((hint.host.as_str(), hint.port)).await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::debug!(%description, error = %err, "direct dial failed");
                return Err(err.into());
            }
        };
        let socket: Socket = Box::new(stream);
        let result = connection::negotiate(
            socket,
            role,
            key,
            None,
            description.clone(),
            clock,
            winner,
            handshake_timeout,
            None,
        )
        .await;
        match &result {
            Ok(_) => tracing::debug!(%description, "direct dial negotiated"),
            Err(err) => tracing::debug!(%description, error = %err, "direct dial negotiation failed"),
        }
        result
    })
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn dial_relay(
    hint: DirectHint,
    role: Role,
    key: Arc<Key<TransitKey>>,
    side: String,
    clock: Arc<dyn Clock>,
    winner: Arc<Winner>,
    handshake_timeout: Duration,
    stagger: Duration,
) -> JoinHandle<Result<Connection, TransitHandshakeError>> {
    async_std::task::spawn(async move {
        let description = format!("relay -> {hint}");
        if !stagger.is_zero() {
            tracing::trace!(%description, delay = ?stagger, "delaying relay dial behind direct hints");
            clock.sleep(stagger).await;
        }
        tracing::trace!(%description, "dialing");
        let stream = match TcpStream::connect((hint.host.as_str(), hint.port)).await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::debug!(%description, error = %err, "relay dial failed");
                return Err(err.into());
            }
        };
        let socket: Socket = Box::new(stream);
        let preamble = handshake::relay_handshake(&key, &side);
        let result = connection::negotiate(
            socket,
            role,
            key,
            Some(preamble),
            description.clone(),
            clock,
            winner,
            handshake_timeout,
            None,
        )
        .await;
        match &result {
            Ok(_) => tracing::debug!(%description, "relay dial negotiated"),
            Err(err) => tracing::debug!(%description, error = %err, "relay dial negotiation failed"),
        }
        result
    })
}
