//! Agent secret encryption.
//!
//! Agent shared secrets are stored as a `(key_id, nonce, ciphertext)` triple.
//! The core only ever talks to [`SecretCipher`]; [`AesGcmCipher`] is the
//! default implementation backed by AES-256-GCM.

use std::collections::HashMap;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::Rng;

const NONCE_LEN: usize = 12;

/// Encrypted secret as persisted on the agent row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedSecret {
    pub key_id: String,
    /// Base64 nonce.
    pub nonce: String,
    /// Base64 ciphertext including the GCM tag.
    pub ciphertext: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("unknown secret key id {0}")]
    UnknownKey(String),
    #[error("secret payload is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("secret nonce has invalid length {0}")]
    NonceLength(usize),
    #[error("secret encryption failed")]
    Encrypt,
    #[error("secret decryption failed")]
    Decrypt,
}

pub trait SecretCipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<SealedSecret, SecretError>;
    fn decrypt(&self, sealed: &SealedSecret) -> Result<Vec<u8>, SecretError>;
}

pub struct AesGcmCipher {
    active_key_id: String,
    keys: HashMap<String, Aes256Gcm>,
}

impl std::fmt::Debug for AesGcmCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesGcmCipher")
            .field("active_key_id", &self.active_key_id)
            .field("keys", &self.keys.len())
            .finish()
    }
}

impl AesGcmCipher {
    pub fn new(key_id: impl Into<String>, key: &[u8; 32]) -> Self {
        let key_id = key_id.into();
        let mut keys = HashMap::new();
        keys.insert(key_id.clone(), Aes256Gcm::new(key.into()));
        Self {
            active_key_id: key_id,
            keys,
        }
    }

    pub fn from_config(cfg: &crate::config::SecretsConfig) -> anyhow::Result<Self> {
        let key = decode_master_key(&cfg.master_key)?;
        Ok(Self::new(cfg.key_id.clone(), &key))
    }

    /// Keep decrypting secrets sealed under a retired key.
    pub fn with_retired_key(mut self, key_id: impl Into<String>, key: &[u8; 32]) -> Self {
        self.keys
            .entry(key_id.into())
            .or_insert_with(|| Aes256Gcm::new(key.into()));
        self
    }
}

impl SecretCipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<SealedSecret, SecretError> {
        let cipher = self
            .keys
            .get(&self.active_key_id)
            .ok_or_else(|| SecretError::UnknownKey(self.active_key_id.clone()))?;
        let mut nonce = [0_u8; NONCE_LEN];
        rand::rng().fill(&mut nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| SecretError::Encrypt)?;
        Ok(SealedSecret {
            key_id: self.active_key_id.clone(),
            nonce: BASE64.encode(nonce),
            ciphertext: BASE64.encode(ciphertext),
        })
    }

    fn decrypt(&self, sealed: &SealedSecret) -> Result<Vec<u8>, SecretError> {
        let cipher = self
            .keys
            .get(&sealed.key_id)
            .ok_or_else(|| SecretError::UnknownKey(sealed.key_id.clone()))?;
        let nonce = BASE64.decode(&sealed.nonce)?;
        if nonce.len() != NONCE_LEN {
            return Err(SecretError::NonceLength(nonce.len()));
        }
        let ciphertext = BASE64.decode(&sealed.ciphertext)?;
        cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|_| SecretError::Decrypt)
    }
}

pub fn decode_master_key(encoded: &str) -> anyhow::Result<[u8; 32]> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|err| anyhow::anyhow!("secrets.master_key is not valid base64: {err}"))?;
    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| {
        anyhow::anyhow!(
            "secrets.master_key must decode to 32 bytes, got {}",
            bytes.len()
        )
    })
}

/// Random shared secret handed to a newly registered agent.
pub fn generate_agent_secret() -> String {
    let mut bytes = [0_u8; 32];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}
