use aes_gcm_siv::aead::{Aead, KeyInit, Payload};
use aes_gcm_siv::{Aes256GcmSiv, Nonce};
use rand::RngCore;

use cairn_types::error::{CairnError, Result};

use super::{CipherEngine, NONCE_SIZE, TAG_SIZE};

/// AES-256-GCM-SIV authenticated encryption engine (the default cipher).
/// Nonce-misuse resistant, which matters for a tool that seals many small
/// objects under one long-lived key.
pub struct Aes256GcmSivEngine {
    cipher: Aes256GcmSiv,
}

impl Aes256GcmSivEngine {
    pub fn new(key: &[u8; 32]) -> Self {
        let cipher = Aes256GcmSiv::new_from_slice(key).expect("valid 32-byte key for AES-256-GCM-SIV");
        Self { cipher }
    }
}

impl CipherEngine for Aes256GcmSivEngine {
    fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|e| CairnError::Other(format!("AES-256-GCM-SIV encrypt: {e}")))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn open(&self, data: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CairnError::AuthFailed);
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(
                nonce,
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| CairnError::AuthFailed)
    }
}
