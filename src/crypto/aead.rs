//! AEAD record framing.
//!
//! One record on the wire is `seal(n, len_be2) || seal(n+1, payload)`
//! where `seal` appends the 16-byte tag and `n` is a 12-byte
//! little-endian counter, incremented per seal, per direction, starting
//! at zero. Payload plaintext is capped at `MAX_PAYLOAD` bytes.

use aes_gcm::{Aes128Gcm, Aes256Gcm};
use bytes::{Buf, BytesMut};
use chacha20poly1305::ChaCha20Poly1305;
use chacha20poly1305::aead::generic_array::GenericArray;
use chacha20poly1305::aead::{Aead, KeyInit};

use crate::crypto::kind::CipherKind;
use crate::error::{ProxyError, Result};

/// Largest plaintext a single record may carry (0x3FFF).
pub const MAX_PAYLOAD: usize = 0x3FFF;

pub(crate) enum AeadAlgo {
    ChaCha(Box<ChaCha20Poly1305>),
    Aes256(Box<Aes256Gcm>),
    Aes128(Box<Aes128Gcm>),
}

impl AeadAlgo {
    pub(crate) fn new(kind: CipherKind, subkey: &[u8]) -> Self {
        match kind {
            CipherKind::Chacha20IetfPoly1305 => AeadAlgo::ChaCha(Box::new(
                ChaCha20Poly1305::new(GenericArray::from_slice(subkey)),
            )),
            CipherKind::Aes256Gcm => {
                AeadAlgo::Aes256(Box::new(Aes256Gcm::new(GenericArray::from_slice(subkey))))
            }
            CipherKind::Aes128Gcm => {
                AeadAlgo::Aes128(Box::new(Aes128Gcm::new(GenericArray::from_slice(subkey))))
            }
            _ => unreachable!("stream cipher handed to aead framing"),
        }
    }

    pub(crate) fn seal(&self, nonce: &[u8; 12], plaintext: &[u8]) -> Vec<u8> {
        let nonce = GenericArray::from_slice(nonce);
        let sealed = match self {
            AeadAlgo::ChaCha(c) => c.encrypt(nonce, plaintext),
            AeadAlgo::Aes256(c) => c.encrypt(nonce, plaintext),
            AeadAlgo::Aes128(c) => c.encrypt(nonce, plaintext),
        };
        sealed.expect("aead seal is infallible for in-range lengths")
    }

    pub(crate) fn open(&self, nonce: &[u8; 12], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = GenericArray::from_slice(nonce);
        let opened = match self {
            AeadAlgo::ChaCha(c) => c.decrypt(nonce, ciphertext),
            AeadAlgo::Aes256(c) => c.decrypt(nonce, ciphertext),
            AeadAlgo::Aes128(c) => c.decrypt(nonce, ciphertext),
        };
        opened.map_err(|_| ProxyError::Crypto("record authentication failed".into()))
    }
}

fn bump_nonce(nonce: &mut [u8; 12]) {
    for b in nonce.iter_mut() {
        *b = b.wrapping_add(1);
        if *b != 0 {
            break;
        }
    }
}

/// Sealing half of one direction.
pub struct AeadSealer {
    algo: AeadAlgo,
    nonce: [u8; 12],
}

impl AeadSealer {
    pub fn new(kind: CipherKind, subkey: &[u8]) -> Self {
        Self {
            algo: AeadAlgo::new(kind, subkey),
            nonce: [0u8; 12],
        }
    }

    /// Append one sealed record for `payload` (≤ `MAX_PAYLOAD` bytes).
    pub fn seal_record(&mut self, payload: &[u8], out: &mut Vec<u8>) {
        debug_assert!(payload.len() <= MAX_PAYLOAD);
        let len_be = (payload.len() as u16).to_be_bytes();
        out.extend_from_slice(&self.algo.seal(&self.nonce, &len_be));
        bump_nonce(&mut self.nonce);
        out.extend_from_slice(&self.algo.seal(&self.nonce, payload));
        bump_nonce(&mut self.nonce);
    }
}

/// Opening half of one direction. Keeps the already-authenticated length
/// of a record whose payload has not arrived yet, so a record split
/// across reads never costs a nonce twice.
pub struct AeadOpener {
    algo: AeadAlgo,
    nonce: [u8; 12],
    tag_len: usize,
    awaiting_payload: Option<usize>,
}

impl AeadOpener {
    pub fn new(kind: CipherKind, subkey: &[u8]) -> Self {
        Self {
            algo: AeadAlgo::new(kind, subkey),
            nonce: [0u8; 12],
            tag_len: kind.tag_len(),
            awaiting_payload: None,
        }
    }

    /// Drain every complete record from `input` into `out`. Bytes of a
    /// partial record stay in `input`; the caller accumulates and calls
    /// again. A tag mismatch poisons the session.
    pub fn open_records(&mut self, input: &mut BytesMut, out: &mut Vec<u8>) -> Result<()> {
        loop {
            let need = match self.awaiting_payload {
                None => 2 + self.tag_len,
                Some(len) => len + self.tag_len,
            };
            if input.len() < need {
                return Ok(());
            }
            let sealed = &input[..need];
            match self.awaiting_payload {
                None => {
                    let len_pt = self.algo.open(&self.nonce, sealed)?;
                    bump_nonce(&mut self.nonce);
                    let len = u16::from_be_bytes([len_pt[0], len_pt[1]]) as usize;
                    if len > MAX_PAYLOAD {
                        return Err(ProxyError::Crypto(format!(
                            "record length {len} out of range"
                        )));
                    }
                    self.awaiting_payload = Some(len);
                }
                Some(_) => {
                    let payload = self.algo.open(&self.nonce, sealed)?;
                    bump_nonce(&mut self.nonce);
                    out.extend_from_slice(&payload);
                    self.awaiting_payload = None;
                }
            }
            input.advance(need);
        }
    }
}
