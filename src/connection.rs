//! The connection FSM and the established-connection handle applications
//! actually talk to. Negotiation (`negotiate`) is written as a straight-line
//! sequential async function rather than the Python original's
//! `dataReceived`-driven incremental parser: a real `TcpStream` already
//! buffers bytes that arrive ahead of when we read them, so there is nothing
//! a hand-rolled byte accumulator buys us here. This mirrors how
//! `src/transit/crypto.rs`'s `handshake_leader`/`handshake_follower` and
//! `src/transit/transport.rs`'s `read_expect` are written: read exactly what's
//! expected, compare, move on.
//! `ConnectionState` is kept as a plain enum for tracing/observability.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::channel::oneshot;
use futures::io::{AsyncReadExt, AsyncWriteExt};
use futures::{AsyncRead, AsyncWrite};

use crate::clock::Clock;
use crate::error::{TransitError, TransitHandshakeError};
use crate::handshake;
use crate::key::{Key, TransitKey, TransitRxKey, TransitTxKey};
use crate::record::{RecordReceiver, RecordSender};
use crate::transit::Role;

/// A socket this crate can negotiate and frame records over: a direct TCP
/// connection or one fronted by a relay preamble. Boxed so the dialer,
/// listener, and relay code paths can all produce the same concrete type.
pub type Socket = Box<dyn TransitSocket>;

pub trait TransitSocket: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> TransitSocket for T {}

/// Coarse phase of a negotiation or established connection, exposed for
/// tracing and tests. Not driven by a callback re-entered per TCP segment;
/// see the module doc comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Relay,
    Handshake,
    WaitForDecision,
    Go,
    Nevermind,
    Records,
    HungUp,
}

/// Tracks which negotiating contender (if any) has already been told "go".
/// Shared by every contender spawned for one `Transit::connect()` call; see
/// `src/transit.rs::TransitConnector`'s race loop for the `select_all` +
/// cancel-the-losers pattern this composes with.
pub(crate) struct Winner(async_std::sync::Mutex<Option<String>>);

impl Winner {
    pub(crate) fn new() -> Self {
        Winner(async_std::sync::Mutex::new(None))
    }

    async fn try_claim(&self, description: &str) -> bool {
        let mut guard = self.0.lock().await;
        if guard.is_some() {
            false
        } else {
            *guard = Some(description.to_string());
            true
        }
    }
}

/// Negotiate one candidate socket to completion, returning a live
/// [`Connection`] or the reason this contender dropped out of the race.
///
/// `fault` is a test-only escape hatch (see `crate::connection::test`) that
/// lets tests make a contender fail deterministically without having to
/// actually misbehave a socket.
pub(crate) async fn negotiate(
    mut socket: Socket,
    role: Role,
    key: Arc<Key<TransitKey>>,
    relay_preamble: Option<Vec<u8>>,
    description: String,
    clock: Arc<dyn Clock>,
    winner: Arc<Winner>,
    per_step_timeout: std::time::Duration,
    fault: Option<TransitHandshakeError>,
) -> Result<Connection, TransitHandshakeError> {
    if let Some(err) = fault {
        return Err(err);
    }

    if let Some(preamble) = relay_preamble {
        tracing::trace!(%description, "sending relay preamble");
        write_timed(&mut socket, &clock, per_step_timeout, &preamble).await?;
        read_expect(&mut socket, &clock, per_step_timeout, handshake::OK).await?;
    }

    let own = handshake::own_handshake(role, &key);
    write_timed(&mut socket, &clock, per_step_timeout, &own).await?;

    let expected = handshake::expected_handshake(role, &key);
    read_expect(&mut socket, &clock, per_step_timeout, &expected).await?;

    let decision = match role {
        Role::Receiver => None,
        Role::Sender => Some(winner.try_claim(&description).await),
    };

    match decision {
        None => {
            // Receiver: wait to be told go or nevermind.
            read_expect(&mut socket, &clock, per_step_timeout, handshake::GO).await?;
        }
        Some(true) => {
            write_timed(&mut socket, &clock, per_step_timeout, handshake::GO).await?;
        }
        Some(false) => {
            let _ = socket.write_all(handshake::NEVERMIND).await;
            return Err(TransitHandshakeError::BadHandshake(
                "abandoned: another contender already won".into(),
            ));
        }
    }

    tracing::debug!(%description, "transit negotiation succeeded");
    let tx_key = key.derive_subkey_from_purpose::<TransitTxKey>(tx_purpose(role));
    let rx_key = key.derive_subkey_from_purpose::<TransitRxKey>(rx_purpose(role));
    Ok(Connection::spawn(socket, description, tx_key, rx_key))
}

fn tx_purpose(role: Role) -> &'static str {
    match role {
        Role::Sender => "transit_record_sender_key",
        Role::Receiver => "transit_record_receiver_key",
    }
}

fn rx_purpose(role: Role) -> &'static str {
    match role {
        Role::Sender => "transit_record_receiver_key",
        Role::Receiver => "transit_record_sender_key",
    }
}

async fn write_timed(
    socket: &mut Socket,
    clock: &Arc<dyn Clock>,
    per_step_timeout: std::time::Duration,
    data: &[u8],
) -> Result<(), TransitHandshakeError> {
    crate::clock::timeout(clock.as_ref(), per_step_timeout, socket.write_all(data))
        .await
        .map_err(|_| TransitHandshakeError::Timeout)??;
    Ok(())
}

/// Read exactly `expected.len()` bytes and compare them against `expected`,
/// mirroring `src/transit/transport.rs::read_expect`.
async fn read_expect(
    socket: &mut Socket,
    clock: &Arc<dyn Clock>,
    per_step_timeout: std::time::Duration,
    expected: &[u8],
) -> Result<(), TransitHandshakeError> {
    let mut buf = vec![0u8; expected.len()];
    crate::clock::timeout(clock.as_ref(), per_step_timeout, socket.read_exact(&mut buf))
        .await
        .map_err(|_| TransitHandshakeError::Timeout)??;
    if buf != expected {
        return Err(TransitHandshakeError::BadHandshake(format!(
            "expected {:?}, got {:?}",
            String::from_utf8_lossy(expected),
            String::from_utf8_lossy(&buf)
        ).into()));
    }
    Ok(())
}

/// A single record delivered to whatever consumer is attached, or queued.
#[async_trait]
pub trait Consumer: Send {
    async fn write_record(&mut self, record: Box<[u8]>);
}

enum Command {
    Send(Vec<u8>, oneshot::Sender<Result<(), TransitError>>),
    Receive(oneshot::Sender<Result<Box<[u8]>, TransitError>>),
    ConnectConsumer(Box<dyn Consumer>, oneshot::Sender<Result<(), TransitError>>),
    DisconnectConsumer,
    Close,
}

/// An established, authenticated, encrypted record channel. Cheap to clone
/// the handle around (it's just a command channel); the actual socket and
/// framing state live in a background task.
#[derive(Clone)]
pub struct Connection {
    description: Arc<str>,
    commands: async_std::channel::Sender<Command>,
    hung_up: Arc<AtomicBool>,
}

impl Connection {
    fn spawn(
        socket: Socket,
        description: String,
        tx_key: Key<TransitTxKey>,
        rx_key: Key<TransitRxKey>,
    ) -> Self {
        let (reader, writer) = socket.split();
        let (commands_tx, commands_rx) = async_std::channel::unbounded();
        let hung_up = Arc::new(AtomicBool::new(false));
        async_std::task::spawn(run_actor(
            reader,
            writer,
            RecordSender::new(tx_key),
            RecordReceiver::new(rx_key),
            commands_rx,
            hung_up.clone(),
        ));
        Connection {
            description: description.into(),
            commands: commands_tx,
            hung_up,
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Coarse lifecycle state for logging. Always [`ConnectionState::Records`]
    /// until the socket closes or `close()` is called, then
    /// [`ConnectionState::HungUp`] forever after.
    pub fn state(&self) -> ConnectionState {
        if self.hung_up.load(Ordering::SeqCst) {
            ConnectionState::HungUp
        } else {
            ConnectionState::Records
        }
    }

    pub async fn send_record(&self, record: impl Into<Vec<u8>>) -> Result<(), TransitError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Send(record.into(), tx))
            .await
            .map_err(|_| TransitError::ConnectionClosed)?;
        rx.await.map_err(|_| TransitError::ConnectionClosed)?
    }

    /// Pull the next record. Note the inbound queue this backs is unbounded:
    /// a peer that sends far faster than this side reads will grow memory
    /// use without bound. Callers that need backpressure should attach a
    /// [`Consumer`] via [`Connection::connect_consumer`] instead, which
    /// still doesn't throttle the peer but at least avoids buffering twice.
    pub async fn receive_record(&self) -> Result<Box<[u8]>, TransitError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Receive(tx))
            .await
            .map_err(|_| TransitError::ConnectionClosed)?;
        rx.await.map_err(|_| TransitError::ConnectionClosed)?
    }

    pub async fn connect_consumer(&self, consumer: impl Consumer + 'static) -> Result<(), TransitError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::ConnectConsumer(Box::new(consumer), tx))
            .await
            .map_err(|_| TransitError::ConnectionClosed)?;
        rx.await.map_err(|_| TransitError::ConnectionClosed)?
    }

    pub async fn disconnect_consumer(&self) {
        let _ = self.commands.send(Command::DisconnectConsumer).await;
    }

    /// Idempotent: closing an already-closed connection is a no-op.
    pub async fn close(&self) {
        let _ = self.commands.send(Command::Close).await;
    }
}

async fn run_actor(
    mut reader: impl AsyncRead + Unpin,
    mut writer: impl AsyncWrite + Unpin,
    mut sender: RecordSender,
    mut receiver: RecordReceiver,
    commands: async_std::channel::Receiver<Command>,
    hung_up: Arc<AtomicBool>,
) {
    let mut queue: VecDeque<Box<[u8]>> = VecDeque::new();
    let mut waiters: VecDeque<oneshot::Sender<Result<Box<[u8]>, TransitError>>> = VecDeque::new();
    let mut consumer: Option<Box<dyn Consumer>> = None;
    let mut read_buf = [0u8; 4096];
    let mut closed_err: Option<TransitError> = None;

    'outer: loop {
        let next_command = commands.recv();
        let next_bytes = reader.read(&mut read_buf);
        futures::pin_mut!(next_command);
        futures::pin_mut!(next_bytes);

        match futures::future::select(next_command, next_bytes).await {
            futures::future::Either::Left((cmd, _)) => match cmd {
                Ok(Command::Send(data, reply)) => {
                    let res = match sender.encode(&data) {
                        Ok(framed) => writer
                            .write_all(&framed)
                            .await
                            .map_err(TransitError::from),
                        Err(e) => Err(e),
                    };
                    let _ = reply.send(res);
                }
                Ok(Command::Receive(reply)) => {
                    if let Some(record) = queue.pop_front() {
                        let _ = reply.send(Ok(record));
                    } else if let Some(err) = &closed_err {
                        let _ = reply.send(Err(err.clone()));
                    } else {
                        waiters.push_back(reply);
                    }
                }
                Ok(Command::ConnectConsumer(mut new_consumer, reply)) => {
                    if consumer.is_some() {
                        let _ = reply.send(Err(TransitError::UsageError(
                            "a consumer is already attached".into(),
                        )));
                    } else {
                        while let Some(record) = queue.pop_front() {
                            new_consumer.write_record(record).await;
                        }
                        consumer = Some(new_consumer);
                        let _ = reply.send(Ok(()));
                    }
                }
                Ok(Command::DisconnectConsumer) => {
                    consumer = None;
                }
                Ok(Command::Close) | Err(_) => {
                    break 'outer;
                }
            },
            futures::future::Either::Right((n, _)) => match n {
                Ok(0) => {
                    closed_err = Some(TransitError::ConnectionClosed);
                    break 'outer;
                }
                Ok(n) => {
                    receiver.feed(&read_buf[..n]);
                    match receiver.drain() {
                        Ok(records) => {
                            for record in records {
                                if let Some(c) = &mut consumer {
                                    c.write_record(record).await;
                                } else if let Some(w) = waiters.pop_front() {
                                    let _ = w.send(Ok(record));
                                } else {
                                    queue.push_back(record);
                                }
                            }
                        }
                        Err(e) => {
                            closed_err = Some(e);
                            break 'outer;
                        }
                    }
                }
                Err(e) => {
                    closed_err = Some(TransitError::from(e));
                    break 'outer;
                }
            },
        }
    }

    hung_up.store(true, Ordering::SeqCst);
    let err = closed_err.unwrap_or(TransitError::ConnectionClosed);
    for w in waiters {
        let _ = w.send(Err(err.clone()));
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use async_std::net::{TcpListener, TcpStream};

    /// A connected pair of loopback TCP sockets, boxed as [`Socket`]s.
    pub(crate) async fn loopback_pair() -> (Socket, Socket) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let accept = listener.accept();
        let (client, accepted) = futures::join!(connect, accept);
        let (server, _) = accepted.unwrap();
        (Box::new(client.unwrap()), Box::new(server))
    }
}
