//! Third-party credentials: sealing and decryption.
//!
//! Credentials travel sealed with AES-256-GCM. A sealed value looks like
//! `{aes-gcm:1}BASE64(nonce||ciphertext)`; values without the marker are
//! treated as plaintext and pass through unchanged.
//!
//! The launcher only ever calls `Decrypter::decrypt`; how the key reaches the
//! node is up to whoever constructs the decrypter.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use std::collections::BTreeMap;
use std::path::Path;

/// Key length in bytes (AES-256)
pub const KEY_LENGTH: usize = 32;

const NONCE_LENGTH: usize = 12;

/// Environment variable holding the node's credential key (hex or base64).
pub const CREDENTIALS_KEY_ENV: &str = "TASK_NODE_CREDENTIALS_KEY";

const SEALED_MARKER: &str = "{aes-gcm:1}";

pub type CredentialKey = [u8; KEY_LENGTH];

pub fn is_sealed(value: &str) -> bool {
    value.trim_start().starts_with(SEALED_MARKER)
}

/// Seal `plaintext` under `key` with a fresh random nonce.
pub fn seal(key: &CredentialKey, plaintext: &str) -> Result<String> {
    if is_sealed(plaintext) {
        return Ok(plaintext.to_string());
    }

    let mut nonce = [0u8; NONCE_LENGTH];
    rand::thread_rng().fill_bytes(&mut nonce);

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| anyhow!("Invalid key: {}", e))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
        .map_err(|e| anyhow!("Sealing credential failed: {}", e))?;

    let mut payload = nonce.to_vec();
    payload.extend_from_slice(&ciphertext);
    Ok(format!("{}{}", SEALED_MARKER, BASE64.encode(payload)))
}

/// Open a sealed value; plaintext passes through.
pub fn open(key: &CredentialKey, value: &str) -> Result<String> {
    let Some(encoded) = value.trim().strip_prefix(SEALED_MARKER) else {
        return Ok(value.to_string());
    };

    let payload = BASE64
        .decode(encoded)
        .context("Sealed credential is not valid base64")?;
    if payload.len() < NONCE_LENGTH {
        bail!("Sealed credential too short");
    }
    let (nonce, ciphertext) = payload.split_at(NONCE_LENGTH);

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| anyhow!("Invalid key: {}", e))?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| anyhow!("Decryption failed: invalid key or corrupted data"))?;

    String::from_utf8(plaintext).context("Decrypted credential is not valid UTF-8")
}

/// Parse a key given as 64 hex characters or as base64 of 32 bytes.
pub fn parse_key(raw: &str) -> Result<CredentialKey> {
    let trimmed = raw.trim();
    let bytes = if trimmed.len() == KEY_LENGTH * 2 && trimmed.chars().all(|c| c.is_ascii_hexdigit())
    {
        hex::decode(trimmed).context("Invalid hex key")?
    } else {
        BASE64
            .decode(trimmed)
            .context("Key is neither valid hex nor base64")?
    };

    bytes
        .try_into()
        .map_err(|b: Vec<u8>| anyhow!("Key must be {} bytes, got {}", KEY_LENGTH, b.len()))
}

pub fn generate_key() -> CredentialKey {
    let mut key = [0u8; KEY_LENGTH];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

pub fn encode_key(key: &CredentialKey) -> String {
    hex::encode(key)
}

/// Decrypts the task's credential blob.
pub trait Decrypter: Send + Sync {
    fn decrypt(&self, value: &str) -> Result<String>;

    fn decrypt_all(&self, sealed: &BTreeMap<String, String>) -> Result<BTreeMap<String, String>> {
        sealed
            .iter()
            .map(|(name, value)| {
                self.decrypt(value)
                    .with_context(|| format!("Cannot decrypt credential '{}'", name))
                    .map(|plain| (name.clone(), plain))
            })
            .collect()
    }
}

/// AES-256-GCM decrypter holding the node's credential key.
#[derive(Clone)]
pub struct AesDecrypter {
    key: CredentialKey,
}

impl AesDecrypter {
    pub fn new(key: CredentialKey) -> Self {
        Self { key }
    }

    /// Load the key from `TASK_NODE_CREDENTIALS_KEY`; `None` when unset.
    pub fn from_env() -> Result<Option<Self>> {
        match std::env::var(CREDENTIALS_KEY_ENV) {
            Ok(raw) if !raw.trim().is_empty() => parse_key(&raw)
                .map(|key| Some(Self::new(key)))
                .with_context(|| format!("Invalid {} format", CREDENTIALS_KEY_ENV)),
            _ => Ok(None),
        }
    }

    pub fn from_key_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read key file {}", path.display()))?;
        Ok(Self::new(parse_key(&raw)?))
    }

    pub fn key(&self) -> &CredentialKey {
        &self.key
    }
}

impl std::fmt::Debug for AesDecrypter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AesDecrypter { key: <redacted> }")
    }
}

impl Decrypter for AesDecrypter {
    fn decrypt(&self, value: &str) -> Result<String> {
        open(&self.key, value)
    }
}

/// Decrypter for nodes without a key: plaintext passes, sealed values fail.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaintextDecrypter;

impl Decrypter for PlaintextDecrypter {
    fn decrypt(&self, value: &str) -> Result<String> {
        if is_sealed(value) {
            bail!("Credential is sealed but no credential key is configured");
        }
        Ok(value.to_string())
    }
}
