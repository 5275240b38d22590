//! CTR stream sessions: the salt is the IV, sent once, then input is
//! transformed 1:1 against the keystream. No per-record authentication.

use aes::{Aes128, Aes192, Aes256};
use ctr::Ctr128BE;
use ctr::cipher::{KeyIvInit, StreamCipher};

use crate::crypto::kind::CipherKind;

type Aes128Ctr = Ctr128BE<Aes128>;
type Aes192Ctr = Ctr128BE<Aes192>;
type Aes256Ctr = Ctr128BE<Aes256>;

pub struct StreamCrypter {
    algo: StreamAlgo,
}

enum StreamAlgo {
    Aes128(Box<Aes128Ctr>),
    Aes192(Box<Aes192Ctr>),
    Aes256(Box<Aes256Ctr>),
}

impl StreamCrypter {
    pub fn new(kind: CipherKind, key: &[u8], iv: &[u8]) -> Self {
        let algo = match kind {
            CipherKind::Aes128Ctr => StreamAlgo::Aes128(Box::new(
                Aes128Ctr::new_from_slices(key, iv).expect("checked key/iv lengths"),
            )),
            CipherKind::Aes192Ctr => StreamAlgo::Aes192(Box::new(
                Aes192Ctr::new_from_slices(key, iv).expect("checked key/iv lengths"),
            )),
            CipherKind::Aes256Ctr => StreamAlgo::Aes256(Box::new(
                Aes256Ctr::new_from_slices(key, iv).expect("checked key/iv lengths"),
            )),
            _ => unreachable!("aead cipher handed to stream session"),
        };
        Self { algo }
    }

    pub fn apply(&mut self, data: &mut [u8]) {
        match &mut self.algo {
            StreamAlgo::Aes128(c) => c.apply_keystream(data),
            StreamAlgo::Aes192(c) => c.apply_keystream(data),
            StreamAlgo::Aes256(c) => c.apply_keystream(data),
        }
    }
}
