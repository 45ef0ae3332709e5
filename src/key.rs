//! Typed wrapper around the shared secret the rendezvous/PAKE layer hands us,
//! plus the subkeys we derive from it. Keeping the purpose tagged in the type
//! makes it impossible to e.g. accidentally use the relay token as a record
//! key; see `src/transit/crypto.rs` for the pattern this is lifted from.

use std::marker::PhantomData;

use hkdf::Hkdf;
use sha2::Sha256;

/// Marker trait for what a [`Key`] may be used for. Has no methods; it only
/// exists to keep `Key<SenderRecord>` and `Key<RelayToken>` from being
/// interchangeable at the type level.
pub trait KeyPurpose {}

/// The key `set_transit_key` receives from the outer protocol.
pub struct TransitKey;
impl KeyPurpose for TransitKey {}

/// Record key for data this side sends.
pub struct TransitTxKey;
impl KeyPurpose for TransitTxKey {}

/// Record key for data this side receives.
pub struct TransitRxKey;
impl KeyPurpose for TransitRxKey {}

/// Relay handshake authentication token.
pub struct RelayToken;
impl KeyPurpose for RelayToken {}

/// A fingerprint-style subkey, hex-printed straight into handshake lines.
pub struct GenericKey;
impl KeyPurpose for GenericKey {}

/// A byte string tagged with what it's allowed to be used for.
pub struct Key<P: KeyPurpose> {
    bytes: Box<[u8]>,
    _purpose: PhantomData<P>,
}

impl<P: KeyPurpose> Key<P> {
    pub fn new(bytes: impl Into<Box<[u8]>>) -> Self {
        Key {
            bytes: bytes.into(),
            _purpose: PhantomData,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }

    /// HKDF-SHA256 expand this key into a differently-purposed 32-byte subkey,
    /// using `info` as the HKDF "info" parameter. This is the only place a
    /// new [`Key`] value is ever minted from an existing one.
    pub fn derive_subkey_from_purpose<Q: KeyPurpose>(&self, info: &str) -> Key<Q> {
        let hk = Hkdf::<Sha256>::new(None, &self.bytes);
        let mut okm = [0u8; 32];
        hk.expand(info.as_bytes(), &mut okm)
            .expect("32 is a valid output length for HKDF-SHA256");
        Key::new(okm)
    }
}
