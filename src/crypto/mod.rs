//! Session crypto: per-direction encrypt/decrypt over the relay stream.
//!
//! Both halves are lazy. The encryptor generates its salt and derives
//! the session subkey on the first call, prepending the salt to that
//! call's ciphertext; the decryptor consumes the peer salt from the
//! first incoming bytes. Neither half performs I/O — they transform
//! buffers handed in by the connection mediator.

pub mod aead;
pub mod kdf;
pub mod kind;
pub mod stream;

use bytes::BytesMut;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::buffer::StreamBuf;
use crate::crypto::aead::{AeadOpener, AeadSealer, MAX_PAYLOAD};
use crate::crypto::stream::StreamCrypter;
use crate::error::Result;

pub use crate::crypto::kind::CipherKind;

#[derive(Debug, PartialEq, Eq)]
pub enum DecryptStep {
    /// Plaintext was produced into the buffer.
    Ok,
    /// Not enough ciphertext to authenticate the next record; the bytes
    /// were retained, feed more.
    NeedMore,
}

enum EncState {
    Aead(AeadSealer),
    Stream(StreamCrypter),
}

pub struct TcpEncryptor {
    kind: CipherKind,
    master: Zeroizing<Vec<u8>>,
    state: Option<EncState>,
}

impl TcpEncryptor {
    pub fn new(kind: CipherKind, master: Zeroizing<Vec<u8>>) -> Self {
        Self {
            kind,
            master,
            state: None,
        }
    }

    /// Encrypt the pending region in place: the buffer content is
    /// replaced with `salt? || records…` (AEAD) or `salt? || keystream
    /// bytes` (stream family).
    pub fn encrypt(&mut self, buf: &mut StreamBuf) -> Result<()> {
        if buf.is_empty() && self.state.is_some() {
            return Ok(());
        }
        let plaintext = buf.unsent().to_vec();
        let mut out = Vec::with_capacity(plaintext.len() + self.kind.salt_len() + 64);

        if self.state.is_none() {
            let mut salt = vec![0u8; self.kind.salt_len()];
            rand::rng().fill_bytes(&mut salt);
            out.extend_from_slice(&salt);
            self.state = Some(if self.kind.is_aead() {
                let subkey = kdf::derive_subkey(&self.master, &salt, self.kind.key_len());
                EncState::Aead(AeadSealer::new(self.kind, &subkey))
            } else {
                EncState::Stream(StreamCrypter::new(self.kind, &self.master, &salt))
            });
        }

        match self.state.as_mut().expect("state initialized above") {
            EncState::Aead(sealer) => {
                for chunk in plaintext.chunks(MAX_PAYLOAD) {
                    sealer.seal_record(chunk, &mut out);
                }
            }
            EncState::Stream(crypter) => {
                let mut data = plaintext;
                crypter.apply(&mut data);
                out.extend_from_slice(&data);
            }
        }
        buf.set_content(&out)
    }
}

enum DecState {
    Aead(AeadOpener),
    Stream(StreamCrypter),
}

pub struct TcpDecryptor {
    kind: CipherKind,
    master: Zeroizing<Vec<u8>>,
    state: Option<DecState>,
    pending: BytesMut,
}

impl TcpDecryptor {
    pub fn new(kind: CipherKind, master: Zeroizing<Vec<u8>>) -> Self {
        Self {
            kind,
            master,
            state: None,
            pending: BytesMut::new(),
        }
    }

    /// Whether the peer salt has been seen yet.
    pub fn salt_received(&self) -> bool {
        self.state.is_some()
    }

    /// Absorb the pending ciphertext from `buf` and replace its content
    /// with whatever plaintext is ready. `NeedMore` leaves the buffer
    /// empty with the ciphertext retained internally.
    pub fn decrypt(&mut self, buf: &mut StreamBuf) -> Result<DecryptStep> {
        self.pending.extend_from_slice(buf.unsent());
        buf.clear();

        if self.state.is_none() {
            if self.pending.len() < self.kind.salt_len() {
                return Ok(DecryptStep::NeedMore);
            }
            let salt = self.pending.split_to(self.kind.salt_len());
            self.state = Some(if self.kind.is_aead() {
                let subkey = kdf::derive_subkey(&self.master, &salt, self.kind.key_len());
                DecState::Aead(AeadOpener::new(self.kind, &subkey))
            } else {
                DecState::Stream(StreamCrypter::new(self.kind, &self.master, &salt))
            });
        }

        match self.state.as_mut().expect("state initialized above") {
            DecState::Aead(opener) => {
                let mut out = Vec::new();
                opener.open_records(&mut self.pending, &mut out)?;
                if out.is_empty() {
                    return Ok(DecryptStep::NeedMore);
                }
                buf.set_content(&out)?;
            }
            DecState::Stream(crypter) => {
                if self.pending.is_empty() {
                    return Ok(DecryptStep::NeedMore);
                }
                let mut data = self.pending.split().to_vec();
                crypter.apply(&mut data);
                buf.set_content(&data)?;
            }
        }
        Ok(DecryptStep::Ok)
    }
}
