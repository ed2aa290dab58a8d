pub mod aes_gcm_siv;
pub mod chacha20_poly1305;
pub mod stream;

use argon2::Argon2;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use cairn_types::error::{CairnError, Result};

use crate::config::{EncryptionAlgorithm, EncryptionConfig};

/// Nonce and tag sizes shared by both supported AEAD ciphers.
pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;

/// Known plaintext sealed into the configuration at create time and
/// re-opened on every open to validate the passphrase without touching
/// user data.
const CANARY_PLAINTEXT: &[u8] = b"canary v1";

/// Authenticated encryption over whole buffers.
///
/// `seal` returns `[12-byte nonce][ciphertext + 16-byte tag]`; `open`
/// reverses it. `aad` is authenticated but not encrypted.
pub trait CipherEngine: Send + Sync {
    fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>>;
    fn open(&self, data: &[u8], aad: &[u8]) -> Result<Vec<u8>>;
}

/// Build the configured cipher engine from a derived key.
pub fn engine_for(algorithm: EncryptionAlgorithm, key: &[u8; 32]) -> Box<dyn CipherEngine> {
    match algorithm {
        EncryptionAlgorithm::Aes256GcmSiv => Box::new(aes_gcm_siv::Aes256GcmSivEngine::new(key)),
        EncryptionAlgorithm::Chacha20Poly1305 => {
            Box::new(chacha20_poly1305::ChaCha20Poly1305Engine::new(key))
        }
    }
}

/// KDF parameters stored in the repository configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KdfParams {
    pub algorithm: String,
    pub time_cost: u32,
    pub memory_cost: u32,
    pub parallelism: u32,
    pub salt: Vec<u8>,
}

// KDF parameter bounds to reject maliciously crafted configurations.
const MAX_TIME_COST: u32 = 10;
const MAX_PARALLELISM: u32 = 16;
const MAX_MEMORY_KIB: u32 = 524_288; // 512 MiB
const MIN_SALT_LEN: usize = 16;
const MAX_SALT_LEN: usize = 64;

impl KdfParams {
    pub fn generate() -> Self {
        let mut salt = vec![0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        Self {
            algorithm: "argon2id".into(),
            time_cost: 3,
            memory_cost: 65536, // 64 MiB
            parallelism: 4,
            salt,
        }
    }

    /// Validate that the parameters are within safe bounds.
    pub fn validate(&self) -> Result<()> {
        if self.algorithm != "argon2id" {
            return Err(CairnError::AuthFailed);
        }
        if self.time_cost == 0 || self.time_cost > MAX_TIME_COST {
            return Err(CairnError::AuthFailed);
        }
        if self.parallelism == 0 || self.parallelism > MAX_PARALLELISM {
            return Err(CairnError::AuthFailed);
        }
        if self.memory_cost == 0 || self.memory_cost > MAX_MEMORY_KIB {
            return Err(CairnError::AuthFailed);
        }
        if self.salt.len() < MIN_SALT_LEN || self.salt.len() > MAX_SALT_LEN {
            return Err(CairnError::AuthFailed);
        }
        Ok(())
    }
}

/// Derive a 32-byte key from a passphrase using Argon2id.
/// The passphrase buffer is the caller's responsibility; the derived key is
/// zeroized when the returned guard drops.
pub fn derive_key(passphrase: &str, kdf: &KdfParams) -> Result<Zeroizing<[u8; 32]>> {
    kdf.validate()?;

    let params = argon2::Params::new(kdf.memory_cost, kdf.time_cost, kdf.parallelism, Some(32))
        .map_err(|e| CairnError::KeyDerivation(format!("argon2 params: {e}")))?;
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

    let mut output = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(passphrase.as_bytes(), &kdf.salt, output.as_mut())
        .map_err(|e| CairnError::KeyDerivation(format!("argon2 hash: {e}")))?;
    Ok(output)
}

/// Produce the canary ciphertext for a fresh encryption configuration.
pub fn make_canary(engine: &dyn CipherEngine) -> Result<Vec<u8>> {
    engine.seal(CANARY_PLAINTEXT, b"canary")
}

/// Check a derived key against the configuration's canary.
/// Failure means the passphrase is wrong (or the configuration corrupt).
pub fn verify_canary(config: &EncryptionConfig, engine: &dyn CipherEngine) -> Result<()> {
    let plaintext = engine
        .open(&config.canary, b"canary")
        .map_err(|_| CairnError::AuthFailed)?;
    if plaintext != CANARY_PLAINTEXT {
        return Err(CairnError::AuthFailed);
    }
    Ok(())
}
