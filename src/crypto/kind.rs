//! Cipher method table.

use std::fmt;
use std::str::FromStr;

use crate::error::ProxyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    // AEAD families: length-sealed records, per-record tags.
    Chacha20IetfPoly1305,
    Aes256Gcm,
    Aes128Gcm,
    // Stream families: salt-as-IV once, then continuous keystream.
    Aes256Ctr,
    Aes192Ctr,
    Aes128Ctr,
}

impl CipherKind {
    pub fn is_aead(self) -> bool {
        matches!(
            self,
            CipherKind::Chacha20IetfPoly1305 | CipherKind::Aes256Gcm | CipherKind::Aes128Gcm
        )
    }

    pub fn key_len(self) -> usize {
        match self {
            CipherKind::Chacha20IetfPoly1305 | CipherKind::Aes256Gcm | CipherKind::Aes256Ctr => 32,
            CipherKind::Aes192Ctr => 24,
            CipherKind::Aes128Gcm | CipherKind::Aes128Ctr => 16,
        }
    }

    /// Per-direction salt sent ahead of the body. AEAD families salt the
    /// subkey derivation with a key-sized value; stream families send
    /// their IV.
    pub fn salt_len(self) -> usize {
        if self.is_aead() { self.key_len() } else { 16 }
    }

    pub fn tag_len(self) -> usize {
        if self.is_aead() { 16 } else { 0 }
    }

    pub fn nonce_len(self) -> usize {
        12
    }
}

impl FromStr for CipherKind {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chacha20-ietf-poly1305" => Ok(CipherKind::Chacha20IetfPoly1305),
            "aes-256-gcm" => Ok(CipherKind::Aes256Gcm),
            "aes-128-gcm" => Ok(CipherKind::Aes128Gcm),
            "aes-256-ctr" => Ok(CipherKind::Aes256Ctr),
            "aes-192-ctr" => Ok(CipherKind::Aes192Ctr),
            "aes-128-ctr" => Ok(CipherKind::Aes128Ctr),
            other => Err(ProxyError::Config(format!("unknown cipher method: {other}"))),
        }
    }
}

impl fmt::Display for CipherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CipherKind::Chacha20IetfPoly1305 => "chacha20-ietf-poly1305",
            CipherKind::Aes256Gcm => "aes-256-gcm",
            CipherKind::Aes128Gcm => "aes-128-gcm",
            CipherKind::Aes256Ctr => "aes-256-ctr",
            CipherKind::Aes192Ctr => "aes-192-ctr",
            CipherKind::Aes128Ctr => "aes-128-ctr",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_roundtrip() {
        for name in [
            "chacha20-ietf-poly1305",
            "aes-256-gcm",
            "aes-128-gcm",
            "aes-256-ctr",
            "aes-192-ctr",
            "aes-128-ctr",
        ] {
            let kind: CipherKind = name.parse().unwrap();
            assert_eq!(kind.to_string(), name);
        }
        assert!("rc4-md5".parse::<CipherKind>().is_err());
    }

    #[test]
    fn aead_salt_matches_key() {
        assert_eq!(CipherKind::Chacha20IetfPoly1305.salt_len(), 32);
        assert_eq!(CipherKind::Aes128Gcm.salt_len(), 16);
        assert_eq!(CipherKind::Aes256Ctr.salt_len(), 16);
        assert_eq!(CipherKind::Aes256Ctr.tag_len(), 0);
    }
}
