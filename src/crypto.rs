use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::Sha256;

/// Fixed KDF salt. Changing it (or the iteration count) invalidates every
/// stored credential blob, same as rotating the master key.
const KDF_SALT: &[u8] = b"email-credentials-salt";
const KDF_ITERATIONS: u32 = 100_000;
const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("ciphertext is not valid base64")]
    MalformedBase64,
    #[error("ciphertext is truncated")]
    Truncated,
    #[error("decryption failed (wrong key or tampered ciphertext)")]
    AuthenticationFailed,
    #[error("credential payload is not valid JSON")]
    InvalidPayload,
    #[error("encryption failed")]
    EncryptionFailed,
}

/// Symmetric vault for provider credentials at rest.
///
/// The master secret comes from deployment configuration and is injected
/// once at startup; the AES-256-GCM key is derived from it with
/// PBKDF2-HMAC-SHA256. Ciphertext layout is `nonce(12) || aead`, base64.
pub struct CredentialVault {
    cipher: Aes256Gcm,
}

impl CredentialVault {
    pub fn new(master_key: &str) -> Self {
        let mut key = [0u8; 32];
        pbkdf2_hmac::<Sha256>(master_key.as_bytes(), KDF_SALT, KDF_ITERATIONS, &mut key);
        Self {
            cipher: Aes256Gcm::new(&key.into()),
        }
    }

    /// Encrypt a credential object. A fresh random 96-bit nonce is drawn
    /// per call, so encrypting the same plaintext twice yields different
    /// ciphertexts.
    pub fn encrypt<T: Serialize>(&self, value: &T) -> Result<String, CryptoError> {
        let plaintext = serde_json::to_vec(value).map_err(|_| CryptoError::InvalidPayload)?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(BASE64.encode(combined))
    }

    /// Decrypt and authenticate a credential blob. Any failure here means
    /// the account needs reconnection; it is never transient.
    pub fn decrypt<T: DeserializeOwned>(&self, encrypted: &str) -> Result<T, CryptoError> {
        let combined = BASE64
            .decode(encrypted)
            .map_err(|_| CryptoError::MalformedBase64)?;

        if combined.len() <= NONCE_LEN {
            return Err(CryptoError::Truncated);
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CryptoError::AuthenticationFailed)?;

        serde_json::from_slice(&plaintext).map_err(|_| CryptoError::InvalidPayload)
    }
}
