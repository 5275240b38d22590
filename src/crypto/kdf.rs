//! Key derivation: password → master key, (master key, salt) → session
//! subkey.

use hkdf::Hkdf;
use md5::{Digest, Md5};
use sha1::Sha1;
use zeroize::Zeroizing;

use crate::error::{ProxyError, Result};

const SUBKEY_INFO: &[u8] = b"ss-subkey";

/// OpenSSL `EVP_BytesToKey` with MD5 and no salt: the classic password
/// to master-key mapping every relay implementation agrees on.
pub fn evp_bytes_to_key(password: &[u8], key_len: usize) -> Zeroizing<Vec<u8>> {
    let mut key = Zeroizing::new(Vec::with_capacity(key_len));
    let mut last: Option<[u8; 16]> = None;
    while key.len() < key_len {
        let mut h = Md5::new();
        if let Some(prev) = last {
            h.update(prev);
        }
        h.update(password);
        let digest: [u8; 16] = h.finalize().into();
        let take = (key_len - key.len()).min(16);
        key.extend_from_slice(&digest[..take]);
        last = Some(digest);
    }
    key
}

/// HKDF-SHA1 session subkey for the AEAD families.
pub fn derive_subkey(master: &[u8], salt: &[u8], key_len: usize) -> Zeroizing<Vec<u8>> {
    let hk = Hkdf::<Sha1>::new(Some(salt), master);
    let mut okm = Zeroizing::new(vec![0u8; key_len]);
    hk.expand(SUBKEY_INFO, &mut okm)
        .expect("subkey length within hkdf bounds");
    okm
}

/// A `key = "<hex>"` config entry bypasses the password KDF entirely.
pub fn parse_raw_key(hex_key: &str, key_len: usize) -> Result<Zeroizing<Vec<u8>>> {
    let raw = hex::decode(hex_key.trim())
        .map_err(|e| ProxyError::Config(format!("key is not valid hex: {e}")))?;
    if raw.len() != key_len {
        return Err(ProxyError::Config(format!(
            "key is {} bytes, cipher needs {}",
            raw.len(),
            key_len
        )));
    }
    Ok(Zeroizing::new(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evp_known_vector() {
        // MD5("p") || MD5(MD5("p") || "p"), truncated to 32 bytes.
        let key = evp_bytes_to_key(b"p", 32);
        assert_eq!(
            hex::encode(&key[..16]),
            "83878c91171338902e0fe0fb97a8c47a"
        );
        assert_eq!(key.len(), 32);
        // Deterministic.
        assert_eq!(*key, *evp_bytes_to_key(b"p", 32));
    }

    #[test]
    fn evp_short_key() {
        let key = evp_bytes_to_key(b"barfoo!", 16);
        assert_eq!(key.len(), 16);
    }

    #[test]
    fn subkey_depends_on_salt() {
        let master = evp_bytes_to_key(b"secret", 32);
        let a = derive_subkey(&master, &[1u8; 32], 32);
        let b = derive_subkey(&master, &[2u8; 32], 32);
        assert_ne!(*a, *b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn raw_key_length_checked() {
        assert!(parse_raw_key(&"ab".repeat(32), 32).is_ok());
        assert!(parse_raw_key(&"ab".repeat(16), 32).is_err());
        assert!(parse_raw_key("zz", 32).is_err());
    }
}
