//! Pure handshake line construction. No I/O here; `connection.rs` does the
//! actual reading and writing. Byte layout follows the original
//! `transit_sender`/`transit_receiver` handshake lines observed in
//! `original_source/src/wormhole/twisted/transit.py` and the legacy
//! `src/transit.rs::{leader_handshake_exchange, follower_handshake_exchange,
//! make_relay_handshake}`.

use rand::RngCore;

use crate::key::{GenericKey, Key, RelayToken, TransitKey};
use crate::transit::Role;

pub const OK: &[u8] = b"ok\n";
pub const GO: &[u8] = b"go\n";
pub const NEVERMIND: &[u8] = b"nevermind\n";

/// The handshake line this side sends, keyed by its role.
pub fn own_handshake(role: Role, key: &Key<TransitKey>) -> Vec<u8> {
    match role {
        Role::Sender => sender_handshake(key),
        Role::Receiver => receiver_handshake(key),
    }
}

/// The handshake line this side expects from the peer, keyed by its role
/// (a sender expects the receiver's line, and vice versa).
pub fn expected_handshake(role: Role, key: &Key<TransitKey>) -> Vec<u8> {
    match role {
        Role::Sender => receiver_handshake(key),
        Role::Receiver => sender_handshake(key),
    }
}

pub fn sender_handshake(key: &Key<TransitKey>) -> Vec<u8> {
    let fingerprint = key.derive_subkey_from_purpose::<GenericKey>("transit_sender");
    format!("transit sender {} ready\n\n", fingerprint.to_hex()).into_bytes()
}

pub fn receiver_handshake(key: &Key<TransitKey>) -> Vec<u8> {
    let fingerprint = key.derive_subkey_from_purpose::<GenericKey>("transit_receiver");
    format!("transit receiver {} ready\n\n", fingerprint.to_hex()).into_bytes()
}

/// The preamble sent to a relay server asking it to pair this socket with
/// the peer's matching token.
pub fn relay_handshake(key: &Key<TransitKey>, side: &str) -> Vec<u8> {
    let token = key.derive_subkey_from_purpose::<RelayToken>("transit_relay_token");
    format!("please relay {} for side {}\n", token.to_hex(), side).into_bytes()
}

/// A random 8-byte hex identifier, used only to disambiguate this
/// connection's relay handshake line; it has no bearing on winner
/// selection.
pub fn generate_side() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod test {
    use super::*;

    fn key() -> Key<TransitKey> {
        Key::new(*b"0123456789abcdef0123456789abcdef")
    }

    #[test]
    fn sender_and_receiver_lines_differ() {
        let k = key();
        assert_ne!(sender_handshake(&k), receiver_handshake(&k));
        assert!(String::from_utf8(sender_handshake(&k))
            .unwrap()
            .starts_with("transit sender "));
        assert!(String::from_utf8(receiver_handshake(&k))
            .unwrap()
            .starts_with("transit receiver "));
    }

    #[test]
    fn own_and_expected_are_reciprocal() {
        let k = key();
        assert_eq!(own_handshake(Role::Sender, &k), expected_handshake(Role::Receiver, &k));
        assert_eq!(own_handshake(Role::Receiver, &k), expected_handshake(Role::Sender, &k));
    }

    #[test]
    fn side_is_distinct_each_time() {
        assert_ne!(generate_side(), generate_side());
        assert_eq!(generate_side().len(), 16);
    }
}
