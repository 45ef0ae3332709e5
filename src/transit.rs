//! The transit core: hint bookkeeping, the transit-key rendezvous, and the
//! `connect()` race that ties the listener and dialer together. Pipeline and
//! timing constants follow the original's `Common.connect`/`_connect`
//! (`RELAY_DELAY = 2.0`, `TIMEOUT = 15`, overall deadline `2 * TIMEOUT`);
//! `Transit` is generic over an injected [`Clock`] instead of assuming
//! `async-std`'s global reactor, so the whole race can run on a
//! [`crate::clock::manual::ManualClock`] in tests.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::channel::oneshot;

use crate::clock::{AsyncStdClock, Clock};
use crate::connection::{Connection, Winner};
use crate::dialer;
use crate::error::TransitConnectError;
use crate::handshake;
use crate::hints::Hint;
use crate::key::{Key, TransitKey};
use crate::listener;
use crate::race;

pub const DEFAULT_RELAY_SERVER: &str = "tcp:transit.magic-wormhole.io:4001";
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_RELAY_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

/// Enumerates this host's local IP addresses for direct hints. Injectable so
/// tests don't depend on the machine's actual network interfaces.
pub trait LocalAddresses: Send + Sync {
    fn addresses(&self) -> Vec<IpAddr>;
}

#[derive(Default)]
pub struct IfAddrsLocalAddresses;

impl LocalAddresses for IfAddrsLocalAddresses {
    fn addresses(&self) -> Vec<IpAddr> {
        if_addrs::get_if_addrs()
            .map(|addrs| {
                addrs
                    .into_iter()
                    .filter(|a| !a.is_loopback())
                    .map(|a| a.ip())
                    .collect()
            })
            .unwrap_or_default()
    }
}

pub struct TransitConfig {
    pub relay_url: Option<String>,
    pub handshake_timeout: Duration,
    pub relay_delay: Duration,
    pub clock: Arc<dyn Clock>,
    pub local_addresses: Arc<dyn LocalAddresses>,
}

impl Default for TransitConfig {
    fn default() -> Self {
        TransitConfig {
            relay_url: Some(DEFAULT_RELAY_SERVER.to_string()),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            relay_delay: DEFAULT_RELAY_DELAY,
            clock: Arc::new(AsyncStdClock),
            local_addresses: Arc::new(IfAddrsLocalAddresses),
        }
    }
}

struct State {
    key: Option<Arc<Key<TransitKey>>>,
    key_waiters: Vec<oneshot::Sender<()>>,
    listener: Option<(async_std::net::TcpListener, u16)>,
    their_direct_hints: Vec<Hint>,
    their_relay_hints: Vec<Hint>,
    winning_description: Option<String>,
}

/// One side of a transit negotiation. Not `Clone`; share it behind an `Arc`
/// if multiple tasks need to feed it hints concurrently (the internal state
/// is already behind a lock either way).
pub struct Transit {
    role: Role,
    config: TransitConfig,
    state: async_std::sync::Mutex<State>,
}

impl Transit {
    pub fn new(role: Role, config: TransitConfig) -> Self {
        Transit {
            role,
            config,
            state: async_std::sync::Mutex::new(State {
                key: None,
                key_waiters: Vec::new(),
                listener: None,
                their_direct_hints: Vec::new(),
                their_relay_hints: Vec::new(),
                winning_description: None,
            }),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Supplies the shared secret negotiated by the outer protocol. Wakes
    /// anything blocked in [`Transit::connect`] waiting for it. Set once: a
    /// second call is a programming error, since a `connect()` already under
    /// way may have captured the old key via `wait_for_key()` and would
    /// otherwise race against callers who see the new one.
    pub async fn set_transit_key(&self, key: Key<TransitKey>) {
        let mut state = self.state.lock().await;
        debug_assert!(state.key.is_none(), "set_transit_key called more than once");
        state.key = Some(Arc::new(key));
        for waiter in state.key_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    async fn wait_for_key(&self) -> Arc<Key<TransitKey>> {
        loop {
            let rx = {
                let mut state = self.state.lock().await;
                if let Some(key) = &state.key {
                    return key.clone();
                }
                let (tx, rx) = oneshot::channel();
                state.key_waiters.push(tx);
                rx
            };
            let _ = rx.await;
        }
    }

    /// Binds the inbound listener (if not already bound) and returns one
    /// direct hint per local address. Awaits the bind, rather than merely
    /// spawning the accept loop, so the port reported here is guaranteed
    /// already listening by the time this returns.
    ///
    /// Call this before [`Transit::connect`]: `connect()` takes ownership of
    /// the bound listener, and a second call afterwards binds a fresh
    /// (different) port.
    pub async fn get_direct_hints(&self) -> std::io::Result<Vec<Hint>> {
        let mut state = self.state.lock().await;
        if state.listener.is_none() {
            let (listener, port) = listener::bind("0.0.0.0:0".parse().unwrap())?;
            state.listener = Some((listener, port));
        }
        let port = state.listener.as_ref().expect("just bound above").1;
        Ok(self
            .config
            .local_addresses
            .addresses()
            .into_iter()
            .map(|ip| Hint::direct(ip.to_string(), port))
            .collect())
    }

    pub fn get_relay_hints(&self) -> Vec<Hint> {
        self.config
            .relay_url
            .as_deref()
            .map(|url| url.parse().expect("Hint::from_str is infallible"))
            .into_iter()
            .collect()
    }

    pub async fn add_their_direct_hints(&self, hints: impl IntoIterator<Item = Hint>) {
        self.state.lock().await.their_direct_hints.extend(hints);
    }

    pub async fn add_their_relay_hints(&self, hints: impl IntoIterator<Item = Hint>) {
        self.state.lock().await.their_relay_hints.extend(hints);
    }

    /// The winning contender's description once `connect()` has succeeded,
    /// or `"not yet established"` before that.
    pub async fn describe(&self) -> String {
        match &self.state.lock().await.winning_description {
            Some(description) => description.clone(),
            None => "not yet established".to_string(),
        }
    }

    /// Race every viable way to reach the peer and return the first one that
    /// completes a full handshake. Direct hints and our own listener start
    /// immediately; relay hints are delayed by one flat `relay_delay` (not
    /// per-hint) so a direct path gets a head start, matching the original's
    /// rationale that relays are a fallback of last resort. The delay only
    /// applies if at least one direct hint was viable; otherwise relays fire
    /// immediately too, since there is nothing left to prefer over them.
    pub async fn connect(&self) -> Result<Connection, TransitConnectError> {
        let key = self.wait_for_key().await;
        let side = handshake::generate_side();
        let winner = Arc::new(Winner::new());

        let listener = {
            let mut state = self.state.lock().await;
            if state.listener.is_none() {
                let (listener, port) = listener::bind("0.0.0.0:0".parse().unwrap())
                    .map_err(|_| TransitConnectError::NoContenders)?;
                state.listener = Some((listener, port));
            }
            state.listener.take().map(|(listener, _)| listener)
        };

        let (their_direct, their_relay) = {
            let state = self.state.lock().await;
            (state.their_direct_hints.clone(), state.their_relay_hints.clone())
        };

        let mut contenders = Vec::new();

        if let Some(listener) = listener {
            contenders.push(async_std::task::spawn(listener::accept_race(
                listener,
                self.role,
                key.clone(),
                "listener".into(),
                self.config.clock.clone(),
                winner.clone(),
                self.config.handshake_timeout,
            )));
        }

        // relay_delay stays zero unless at least one direct hint was viable;
        // every relay hint shares that one flat delay (not `delay * index`),
        // matching the original's `relay_delay` local in `Common._connect`.
        let mut relay_delay = Duration::ZERO;
        for hint in &their_direct {
            if let Some(direct) = hint.as_direct() {
                contenders.push(dialer::dial_direct(
                    direct.clone(),
                    self.role,
                    key.clone(),
                    self.config.clock.clone(),
                    winner.clone(),
                    self.config.handshake_timeout,
                ));
                relay_delay = self.config.relay_delay;
            }
        }

        // Only the peer's relay hints are dialed, not ours too; this is the
        // observed behavior rather than the stricter dial-both alternative.
        for hint in &their_relay {
            if let Some(relay) = hint.as_direct() {
                contenders.push(dialer::dial_relay(
                    relay.clone(),
                    self.role,
                    key.clone(),
                    side.clone(),
                    self.config.clock.clone(),
                    winner.clone(),
                    self.config.handshake_timeout,
                    relay_delay,
                ));
            }
        }

        if contenders.is_empty() {
            return Err(TransitConnectError::NoContenders);
        }

        let overall_timeout = self.config.handshake_timeout * 2;
        match crate::clock::timeout(
            self.config.clock.as_ref(),
            overall_timeout,
            race::there_can_be_only_one(contenders),
        )
        .await
        {
            Ok(Ok(conn)) => {
                self.state.lock().await.winning_description = Some(conn.description().to_string());
                Ok(conn)
            }
            Ok(Err(err)) => Err(TransitConnectError::AllContendersFailed(err)),
            Err(_) => Err(TransitConnectError::Cancelled),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::connection::ConnectionState;
    use std::net::Ipv4Addr;

    struct LoopbackOnly;
    impl LocalAddresses for LoopbackOnly {
        fn addresses(&self) -> Vec<IpAddr> {
            vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]
        }
    }

    fn test_config() -> TransitConfig {
        TransitConfig {
            relay_url: None,
            handshake_timeout: Duration::from_secs(5),
            relay_delay: Duration::from_millis(10),
            clock: Arc::new(AsyncStdClock),
            local_addresses: Arc::new(LoopbackOnly),
        }
    }

    #[async_std::test]
    async fn direct_hint_round_trip_establishes_a_connection() {
        let sender = Transit::new(Role::Sender, test_config());
        let receiver = Transit::new(Role::Receiver, test_config());

        let key = Key::<TransitKey>::new(*b"0123456789abcdef0123456789abcdef");
        sender.set_transit_key(Key::new(key.as_bytes().to_vec())).await;
        receiver.set_transit_key(Key::new(key.as_bytes().to_vec())).await;

        let receiver_hints = receiver.get_direct_hints().await.unwrap();
        sender.add_their_direct_hints(receiver_hints).await;

        let (sender_conn, receiver_conn) = futures::join!(sender.connect(), receiver.connect());
        let sender_conn = sender_conn.unwrap();
        let receiver_conn = receiver_conn.unwrap();

        sender_conn.send_record(b"ping".to_vec()).await.unwrap();
        let got = receiver_conn.receive_record().await.unwrap();
        assert_eq!(&*got, b"ping");
    }

    #[async_std::test]
    async fn loopback_race_picks_exactly_one_winner_when_both_sides_dial() {
        let sender = Transit::new(Role::Sender, test_config());
        let receiver = Transit::new(Role::Receiver, test_config());

        let key = Key::<TransitKey>::new(*b"0123456789abcdef0123456789abcdef");
        sender.set_transit_key(Key::new(key.as_bytes().to_vec())).await;
        receiver.set_transit_key(Key::new(key.as_bytes().to_vec())).await;

        let sender_hints = sender.get_direct_hints().await.unwrap();
        let receiver_hints = receiver.get_direct_hints().await.unwrap();
        sender.add_their_direct_hints(receiver_hints).await;
        receiver.add_their_direct_hints(sender_hints).await;

        let (sender_conn, receiver_conn) = futures::join!(sender.connect(), receiver.connect());
        let sender_conn = sender_conn.unwrap();
        let receiver_conn = receiver_conn.unwrap();

        // Whichever contender won, exactly one working channel exists on each
        // side and it actually carries records end to end.
        sender_conn.send_record(b"ping".to_vec()).await.unwrap();
        let got = receiver_conn.receive_record().await.unwrap();
        assert_eq!(&*got, b"ping");
        assert_eq!(sender_conn.state(), ConnectionState::Records);
        assert_eq!(receiver_conn.state(), ConnectionState::Records);
    }

    #[async_std::test]
    async fn cancelling_connect_while_waiting_for_the_key_is_safe() {
        let transit = Transit::new(Role::Sender, test_config());

        let connect = transit.connect();
        futures::pin_mut!(connect);
        let timed_out = crate::clock::timeout(
            transit.config.clock.as_ref(),
            Duration::from_millis(20),
            &mut connect,
        )
        .await;
        assert!(timed_out.is_err());
        drop(connect);

        // Supplying the key after the waiting connect() was dropped must not
        // panic or deadlock; the waiter list it registered is simply gone.
        transit
            .set_transit_key(Key::new(*b"0123456789abcdef0123456789abcdef"))
            .await;
    }

    /// Plays the far end of a relay dial by hand: read the relay preamble,
    /// answer `ok\n`, swap handshake lines, then tell the dialer it won (it's
    /// the only contender that ever reaches this point). Mirrors what a
    /// cooperating relay plus the actual peer would produce together, since
    /// this test has neither.
    async fn answer_relay_handshake(stream: &mut async_std::net::TcpStream, key: &Key<TransitKey>) {
        use futures::io::{AsyncReadExt, AsyncWriteExt};

        let preamble_len = handshake::relay_handshake(key, &"0".repeat(16)).len();
        let mut buf = vec![0u8; preamble_len];
        stream.read_exact(&mut buf).await.unwrap();
        stream.write_all(handshake::OK).await.unwrap();

        let own_len = handshake::sender_handshake(key).len();
        let mut buf = vec![0u8; own_len];
        stream.read_exact(&mut buf).await.unwrap();
        stream
            .write_all(&handshake::expected_handshake(Role::Sender, key))
            .await
            .unwrap();

        let mut go = [0u8; 3];
        stream.read_exact(&mut go).await.unwrap();
        assert_eq!(&go, handshake::GO);
    }

    #[async_std::test]
    async fn relay_dial_waits_for_relay_delay_behind_a_viable_direct_hint() {
        use crate::clock::manual::ManualClock;
        use std::sync::atomic::{AtomicBool, Ordering};

        let key_bytes = *b"0123456789abcdef0123456789abcdef";
        let key = Key::<TransitKey>::new(key_bytes);

        // Never accepted: stands in for a direct hint that hangs instead of
        // completing a handshake, so the direct contender never wins.
        let (direct_listener, direct_port) = listener::bind("127.0.0.1:0".parse().unwrap()).unwrap();

        let (relay_listener, relay_port) = listener::bind("127.0.0.1:0".parse().unwrap()).unwrap();

        let clock = ManualClock::new();
        let config = TransitConfig {
            relay_url: Some(format!("tcp:127.0.0.1:{relay_port}")),
            handshake_timeout: Duration::from_secs(5),
            relay_delay: Duration::from_secs(2),
            clock: Arc::new(clock.clone()),
            local_addresses: Arc::new(LoopbackOnly),
        };
        let sender = Transit::new(Role::Sender, config);
        sender.set_transit_key(Key::new(key_bytes)).await;
        sender
            .add_their_direct_hints([Hint::direct("127.0.0.1", direct_port)])
            .await;

        let connect = async_std::task::spawn(async move {
            let result = sender.connect().await;
            drop(direct_listener);
            result
        });

        let accepted = Arc::new(AtomicBool::new(false));
        let accepted2 = accepted.clone();
        let relay_task = async_std::task::spawn(async move {
            let (mut stream, _) = relay_listener.accept().await.unwrap();
            accepted2.store(true, Ordering::SeqCst);
            answer_relay_handshake(&mut stream, &key).await;
        });

        async_std::task::sleep(Duration::from_millis(30)).await;
        assert!(
            !accepted.load(Ordering::SeqCst),
            "relay dial must not start before relay_delay elapses while a direct hint is viable"
        );

        clock.advance(Duration::from_secs(2)).await;
        relay_task.await;
        assert!(accepted.load(Ordering::SeqCst));
        assert!(connect.await.is_ok());
    }

    #[async_std::test]
    async fn relay_dial_fires_immediately_with_no_viable_direct_hint() {
        use crate::clock::manual::ManualClock;

        let key_bytes = *b"0123456789abcdef0123456789abcdef";
        let key = Key::<TransitKey>::new(key_bytes);

        let (relay_listener, relay_port) = listener::bind("127.0.0.1:0".parse().unwrap()).unwrap();

        let clock = ManualClock::new();
        let config = TransitConfig {
            relay_url: Some(format!("tcp:127.0.0.1:{relay_port}")),
            handshake_timeout: Duration::from_secs(5),
            relay_delay: Duration::from_secs(2),
            clock: Arc::new(clock),
            local_addresses: Arc::new(LoopbackOnly),
        };
        let sender = Transit::new(Role::Sender, config);
        sender.set_transit_key(Key::new(key_bytes)).await;
        // No direct hints added: relay_delay must stay zero.

        let connect = async_std::task::spawn(async move { sender.connect().await });
        let relay_task = async_std::task::spawn(async move {
            let (mut stream, _) = relay_listener.accept().await.unwrap();
            answer_relay_handshake(&mut stream, &key).await;
        });

        // The clock is never advanced; success without it proves the dial
        // wasn't waiting on relay_delay.
        relay_task.await;
        assert!(connect.await.is_ok());
    }

    #[async_std::test]
    async fn connect_with_no_hints_and_no_relay_fails_fast() {
        let mut config = test_config();
        config.relay_url = None;
        let transit = Transit::new(Role::Sender, config);
        transit
            .set_transit_key(Key::new(*b"0123456789abcdef0123456789abcdef"))
            .await;
        // No listener bound (get_direct_hints was never called on the peer
        // side, so we never add_their_direct_hints), and no relay hints:
        // only our own listener is a contender, which will simply wait for
        // an inbound connection that never arrives. Cancel it explicitly by
        // racing against a short timeout to keep the test fast.
        let result = crate::clock::timeout(
            transit.config.clock.as_ref(),
            Duration::from_millis(50),
            transit.connect(),
        )
        .await;
        assert!(result.is_err());
    }
}
