use std::fmt;

use hmac::{Hmac, Mac as _};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// A 32-byte keyed MAC acting as both content address and integrity tag.
///
/// Computed as HMAC-SHA-256 over the plaintext. The key is either derived
/// from the repository passphrase or, for unencrypted repositories, the
/// repository UUID bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Mac(pub [u8; 32]);

impl Mac {
    pub const SIZE: usize = 32;

    /// Compute the MAC of `data` under `key`.
    pub fn compute(key: &[u8], data: &[u8]) -> Self {
        let mut hasher = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
        hasher.update(data);
        let result = hasher.finalize().into_bytes();
        let mut out = [0u8; 32];
        out.copy_from_slice(&result);
        Mac(out)
    }

    /// Incremental MAC computation over several input slices.
    pub fn hasher(key: &[u8]) -> MacHasher {
        MacHasher {
            inner: HmacSha256::new_from_slice(key).expect("HMAC accepts any key length"),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Mac(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex-encode the full MAC for use as a storage key.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        Self::from_bytes(&bytes)
    }

    /// First byte as a two-char hex string, used for shard directories.
    pub fn shard_prefix(&self) -> String {
        hex::encode(&self.0[..1])
    }
}

/// Streaming HMAC-SHA-256 wrapper with a `Mac`-typed result.
pub struct MacHasher {
    inner: HmacSha256,
}

impl MacHasher {
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finalize(self) -> Mac {
        let result = self.inner.finalize().into_bytes();
        let mut out = [0u8; 32];
        out.copy_from_slice(&result);
        Mac(out)
    }
}

impl fmt::Debug for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mac({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; 32] {
        [0xAA; 32]
    }

    #[test]
    fn compute_deterministic() {
        let key = test_key();
        let m1 = Mac::compute(&key, b"hello world");
        let m2 = Mac::compute(&key, b"hello world");
        assert_eq!(m1, m2);
    }

    #[test]
    fn compute_different_data_different_mac() {
        let key = test_key();
        assert_ne!(Mac::compute(&key, b"hello"), Mac::compute(&key, b"world"));
    }

    #[test]
    fn compute_different_key_different_mac() {
        let data = b"same data";
        assert_ne!(Mac::compute(&[0xAA; 32], data), Mac::compute(&[0xBB; 32], data));
    }

    #[test]
    fn incremental_matches_one_shot() {
        let key = test_key();
        let mut hasher = Mac::hasher(&key);
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(hasher.finalize(), Mac::compute(&key, b"hello world"));
    }

    #[test]
    fn hex_roundtrip() {
        let mac = Mac::compute(&test_key(), b"roundtrip");
        assert_eq!(mac.to_hex().len(), 64);
        assert_eq!(Mac::from_hex(&mac.to_hex()), Some(mac));
    }

    #[test]
    fn shard_prefix_is_first_byte() {
        let mac = Mac([0xAB; 32]);
        assert_eq!(mac.shard_prefix(), "ab");
    }

    #[test]
    fn serde_roundtrip() {
        let mac = Mac::compute(&test_key(), b"serde");
        let bytes = rmp_serde::to_vec(&mac).unwrap();
        let back: Mac = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(mac, back);
    }
}
