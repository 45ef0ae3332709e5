//! Record framing: `[4-byte BE length][24-byte BE nonce][ciphertext]`, one
//! AEAD box per record, nonces incrementing monotonically per direction.
//! Grounded on the legacy `src/transit.rs::{send_record_inner,
//! receive_record_inner}`, re-expressed against the `crypto_secretbox` AEAD
//! this workspace depends on instead of `sodiumoxide`.

use crypto_secretbox::aead::{Aead, KeyInit};
use crypto_secretbox::{Nonce as SecretboxNonce, XSalsa20Poly1305};

use crate::error::TransitError;
use crate::key::{Key, TransitRxKey, TransitTxKey};

pub const NONCE_LEN: usize = 24;
type NonceBytes = [u8; NONCE_LEN];

/// Increment a big-endian counter in place, matching the wire's nonce byte
/// order (`sodium_increment_be` does the same for the legacy secretbox code
/// path).
fn increment_be(nonce: &mut NonceBytes) {
    let mut carry: u16 = 1;
    for byte in nonce.iter_mut().rev() {
        carry += *byte as u16;
        *byte = carry as u8;
        carry >>= 8;
    }
}

pub struct RecordSender {
    cipher: XSalsa20Poly1305,
    next_nonce: NonceBytes,
}

impl RecordSender {
    pub fn new(key: Key<TransitTxKey>) -> Self {
        RecordSender {
            cipher: XSalsa20Poly1305::new_from_slice(key.as_bytes())
                .expect("record keys are always 32 bytes"),
            next_nonce: [0; NONCE_LEN],
        }
    }

    /// Encode one record for the wire, consuming the next nonce.
    pub fn encode(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, TransitError> {
        if plaintext.len() > (u32::MAX as usize) - NONCE_LEN {
            return Err(TransitError::UsageError("record too large to frame".into()));
        }
        let nonce = self.next_nonce;
        let ciphertext = self
            .cipher
            .encrypt(SecretboxNonce::from_slice(&nonce), plaintext)
            .map_err(|_| TransitError::Crypto)?;
        increment_be(&mut self.next_nonce);

        let mut out = Vec::with_capacity(4 + NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&((NONCE_LEN + ciphertext.len()) as u32).to_be_bytes());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }
}

pub struct RecordReceiver {
    cipher: XSalsa20Poly1305,
    next_nonce: NonceBytes,
    buf: Vec<u8>,
}

impl RecordReceiver {
    pub fn new(key: Key<TransitRxKey>) -> Self {
        RecordReceiver {
            cipher: XSalsa20Poly1305::new_from_slice(key.as_bytes())
                .expect("record keys are always 32 bytes"),
            next_nonce: [0; NONCE_LEN],
            buf: Vec::new(),
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Decode and return every complete record currently buffered, in
    /// arrival order. A bad nonce or failed authentication is fatal: the
    /// caller must tear down the connection, since the stream position is
    /// no longer trustworthy.
    pub fn drain(&mut self) -> Result<Vec<Box<[u8]>>, TransitError> {
        let mut out = Vec::new();
        loop {
            if self.buf.len() < 4 {
                break;
            }
            let len = u32::from_be_bytes(self.buf[..4].try_into().unwrap()) as usize;
            if self.buf.len() < 4 + len {
                break;
            }
            if len < NONCE_LEN {
                return Err(TransitError::UsageError("record shorter than a nonce".into()));
            }
            self.buf.drain(..4);
            let body: Vec<u8> = self.buf.drain(..len).collect();
            let (nonce_bytes, ciphertext) = body.split_at(NONCE_LEN);
            if nonce_bytes != self.next_nonce {
                return Err(TransitError::BadNonce {
                    got: hex::encode(nonce_bytes),
                    expected: hex::encode(self.next_nonce),
                });
            }
            let plaintext = self
                .cipher
                .decrypt(SecretboxNonce::from_slice(nonce_bytes), ciphertext)
                .map_err(|_| TransitError::Crypto)?;
            increment_be(&mut self.next_nonce);
            out.push(plaintext.into_boxed_slice());
        }
        Ok(out)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn keys() -> (Key<TransitTxKey>, Key<TransitRxKey>) {
        let bytes = *b"0123456789abcdef0123456789abcdef";
        (Key::new(bytes), Key::new(bytes))
    }

    #[test]
    fn round_trips_a_single_record() {
        let (tx_key, rx_key) = keys();
        let mut sender = RecordSender::new(tx_key);
        let mut receiver = RecordReceiver::new(rx_key);

        let framed = sender.encode(b"hello wormhole").unwrap();
        receiver.feed(&framed);
        let records = receiver.drain().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(&*records[0], b"hello wormhole");
    }

    #[test]
    fn nonces_increment_and_are_checked() {
        let (tx_key, rx_key) = keys();
        let mut sender = RecordSender::new(tx_key);
        let mut receiver = RecordReceiver::new(rx_key);

        for i in 0..3 {
            let framed = sender.encode(format!("record {i}").as_bytes()).unwrap();
            receiver.feed(&framed);
        }
        let records = receiver.drain().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(&*records[1], b"record 1");
    }

    #[test]
    fn partial_reads_are_buffered_until_a_full_record_arrives() {
        let (tx_key, rx_key) = keys();
        let mut sender = RecordSender::new(tx_key);
        let mut receiver = RecordReceiver::new(rx_key);

        let framed = sender.encode(b"split across reads").unwrap();
        let (first, second) = framed.split_at(5);
        receiver.feed(first);
        assert!(receiver.drain().unwrap().is_empty());
        receiver.feed(second);
        let records = receiver.drain().unwrap();
        assert_eq!(&*records[0], b"split across reads");
    }

    #[test]
    fn tampering_with_ciphertext_is_rejected() {
        let (tx_key, rx_key) = keys();
        let mut sender = RecordSender::new(tx_key);
        let mut receiver = RecordReceiver::new(rx_key);

        let mut framed = sender.encode(b"integrity matters").unwrap();
        let last = framed.len() - 1;
        framed[last] ^= 0xff;
        receiver.feed(&framed);
        assert!(matches!(receiver.drain(), Err(TransitError::Crypto)));
    }

    #[test]
    fn out_of_order_nonce_is_rejected() {
        let (tx_key, rx_key) = keys();
        let mut sender = RecordSender::new(tx_key);
        let mut receiver = RecordReceiver::new(rx_key);

        let first = sender.encode(b"one").unwrap();
        let second = sender.encode(b"two").unwrap();
        receiver.feed(&second);
        receiver.feed(&first);
        let err = receiver.drain().unwrap_err();
        assert!(matches!(err, TransitError::BadNonce { .. }));
    }
}
