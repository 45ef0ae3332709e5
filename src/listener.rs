//! Inbound side: bind a reusable port, accept connections, and race their
//! negotiations against each other the same way the top-level `connect()`
//! races dial attempts. Binding via `socket2` with `SO_REUSEADDR`/
//! `SO_REUSEPORT` mirrors `src/transit/transport.rs::set_socket_opts` — it
//! matters here because the port we bind is the same one reported in our
//! direct hints, and tests rebind it quickly across runs.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_std::net::TcpListener;
use async_std::task::JoinHandle;
use futures::stream::{FuturesUnordered, StreamExt};

use crate::clock::Clock;
use crate::connection::{self, Connection, Socket, Winner};
use crate::error::TransitHandshakeError;
use crate::key::{Key, TransitKey};
use crate::transit::Role;

/// Bind a TCP listener with `SO_REUSEADDR`/`SO_REUSEPORT` set before handing
/// it to `async-std`. Returns the listener and the port the OS picked (or
/// confirmed, if `addr` pinned one).
pub(crate) fn bind(addr: SocketAddr) -> std::io::Result<(TcpListener, u16)> {
    use socket2::{Domain, Socket as Socket2, Type};

    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket2::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    socket.set_nonblocking(true)?;

    let std_listener: std::net::TcpListener = socket.into();
    let port = std_listener.local_addr()?.port();
    Ok((TcpListener::from(std_listener), port))
}

/// Accept connections on `listener` forever, negotiating each one
/// concurrently, until one completes successfully (cancelling the rest) or
/// the listener itself is closed with nothing left pending.
pub(crate) async fn accept_race(
    listener: TcpListener,
    role: Role,
    key: Arc<Key<TransitKey>>,
    description_prefix: String,
    clock: Arc<dyn Clock>,
    winner: Arc<Winner>,
    handshake_timeout: Duration,
) -> Result<Connection, TransitHandshakeError> {
    let mut incoming = listener.incoming();
    let mut listener_done = false;
    let mut pending: FuturesUnordered<JoinHandle<Result<Connection, TransitHandshakeError>>> =
        FuturesUnordered::new();
    let mut first_failure = None;

    loop {
        let accept_next = async {
            if listener_done {
                futures::future::pending().await
            } else {
                incoming.next().await
            }
        };
        let pending_next = async {
            if pending.is_empty() {
                futures::future::pending().await
            } else {
                pending.next().await
            }
        };
        futures::pin_mut!(accept_next);
        futures::pin_mut!(pending_next);

        match futures::future::select(accept_next, pending_next).await {
            futures::future::Either::Left((accepted, _)) => match accepted {
                Some(Ok(stream)) => {
                    let peer = stream.peer_addr().ok();
                    let description = match peer {
                        Some(addr) => format!("{description_prefix} <- {addr}"),
                        None => description_prefix.clone(),
                    };
                    let socket: Socket = Box::new(stream);
                    let handle = async_std::task::spawn(connection::negotiate(
                        socket,
                        role,
                        key.clone(),
                        None,
                        description,
                        clock.clone(),
                        winner.clone(),
                        handshake_timeout,
                        None,
                    ));
                    pending.push(handle);
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "accept() failed on transit listener");
                }
                None => {
                    listener_done = true;
                    if pending.is_empty() {
                        return Err(first_failure.unwrap_or_else(|| {
                            TransitHandshakeError::BadHandshake(
                                "listener closed with no inbound contenders".into(),
                            )
                        }));
                    }
                }
            },
            futures::future::Either::Right((done, _)) => match done {
                Some(Ok(conn)) => {
                    let description = conn.description().to_string();
                    tracing::debug!(%description, "inbound negotiation won; cancelling the rest");
                    crate::race::spawn_cancel_all(pending.into_iter().collect());
                    return Ok(conn);
                }
                Some(Err(err)) => {
                    if first_failure.is_none() {
                        first_failure = Some(err);
                    }
                    if listener_done && pending.is_empty() {
                        return Err(first_failure.unwrap());
                    }
                }
                None => unreachable!("pending_next is only polled while non-empty"),
            },
        }
    }
}
