use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::codec::{b64_decode, b64_encode};
use crate::crypto::{
    self, aes_gcm_decrypt, aes_gcm_encrypt, derive_wrapping_key, sha256, KEY_LEN, NONCE_LEN,
    SALT_LEN,
};
use crate::errors::SyncError;

pub const LOCK_ALGO: &str = "PBKDF2-SHA256-100k-AES-GCM-256";

/// Inner lock-file payload: the master key wrapped under a PBKDF2-derived key.
#[derive(Debug, Serialize, Deserialize)]
struct LockEnvelope {
    salt: String,
    #[serde(rename = "wrappedMasterKey")]
    wrapped_master_key: String,
    iv: String,
    algo: String,
}

/// Holds the in-memory master content key and drives its lifecycle.
///
/// The raw key never leaves this type except through
/// `export_recovery_code`. The on-remote lock file is double-wrapped: the
/// inner JSON wraps the master key under PBKDF2(password, salt); the whole
/// JSON is then sealed under SHA-256(SHA-256(password)). The two keys are
/// independent derivations of the password, so neither layer reveals the
/// other.
#[derive(Default)]
pub struct Keychain {
    master: Option<[u8; KEY_LEN]>,
}

impl Keychain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_unlocked(&self) -> bool {
        self.master.is_some()
    }

    /// Drop the in-memory key.
    pub fn lock(&mut self) {
        self.master = None;
    }

    /// Create a fresh master key and return the lock-file blob for it.
    pub fn initialize_new_vault(&mut self, password: &str) -> Result<String> {
        let master: [u8; KEY_LEN] = crypto::random_bytes();
        self.master = Some(master);
        build_lock_blob(&master, password)
    }

    /// Reconstitute the master key from a lock-file blob.
    ///
    /// Both a failed outer decryption and a failed inner unwrap surface as
    /// `InvalidPassword`; the two cases are indistinguishable on purpose.
    pub fn unlock_vault(&mut self, blob: &str, password: &str) -> Result<()> {
        let sealed = b64_decode(blob).context("decode lock file")?;
        let outer_key = outer_key(password);
        let inner_json = crypto::open(&outer_key, &sealed).map_err(|_| SyncError::InvalidPassword)?;
        let envelope: LockEnvelope =
            serde_json::from_slice(&inner_json).context("parse lock envelope")?;

        let salt = b64_decode(&envelope.salt)?;
        let iv = b64_decode(&envelope.iv)?;
        let wrapped = b64_decode(&envelope.wrapped_master_key)?;
        let wrapping_key = derive_wrapping_key(password, &salt);
        let raw =
            aes_gcm_decrypt(&wrapping_key, &iv, &wrapped).map_err(|_| SyncError::InvalidPassword)?;
        if raw.len() != KEY_LEN {
            return Err(SyncError::InvalidPassword.into());
        }

        let mut master = [0u8; KEY_LEN];
        master.copy_from_slice(&raw);
        self.master = Some(master);
        Ok(())
    }

    /// AES-GCM under the master key with a fresh IV; output is `iv || ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let master = self.master.ok_or(SyncError::Locked)?;
        crypto::seal(&master, plaintext)
    }

    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>> {
        let master = self.master.ok_or(SyncError::Locked)?;
        crypto::open(&master, blob)
    }

    /// Rewrap the unchanged master key under a new password. Existing
    /// encrypted objects stay valid; only the lock file changes.
    pub fn update_password(&self, new_password: &str) -> Result<String> {
        let master = self.master.ok_or(SyncError::Locked)?;
        build_lock_blob(&master, new_password)
    }

    /// Base64 of the raw master key. The only way key material leaves.
    pub fn export_recovery_code(&self) -> Result<String> {
        let master = self.master.ok_or(SyncError::Locked)?;
        Ok(b64_encode(&master))
    }

    /// Import a recovery code as the master key and produce a fresh lock
    /// file under `new_password`.
    pub fn recover_from_code(&mut self, code: &str, new_password: &str) -> Result<String> {
        let raw = b64_decode(code).context("decode recovery code")?;
        if raw.len() != KEY_LEN {
            anyhow::bail!("recovery code must decode to {KEY_LEN} bytes, got {}", raw.len());
        }
        let mut master = [0u8; KEY_LEN];
        master.copy_from_slice(&raw);
        self.master = Some(master);
        self.update_password(new_password)
    }

    /// First 4 bytes of SHA-256 over the raw master key, hex.
    pub fn key_fingerprint(&self) -> Result<String> {
        let master = self.master.ok_or(SyncError::Locked)?;
        Ok(hex::encode(&sha256(&master)[..4]))
    }
}

/// The byte-transformation boundary the pipeline routes transfers through.
/// Disabled boundaries pass bytes through untouched; enabled boundaries
/// require an unlocked keychain and fail with `Locked` otherwise.
#[derive(Clone, Default)]
pub struct CipherBoundary {
    keychain: Option<std::sync::Arc<std::sync::Mutex<Keychain>>>,
}

impl CipherBoundary {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn enabled(keychain: std::sync::Arc<std::sync::Mutex<Keychain>>) -> Self {
        Self {
            keychain: Some(keychain),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.keychain.is_some()
    }

    /// Transform plaintext into what the remote stores.
    pub fn outgoing(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        match &self.keychain {
            Some(kc) => kc.lock().unwrap().encrypt(bytes),
            None => Ok(bytes.to_vec()),
        }
    }

    /// Transform stored remote bytes back into plaintext.
    pub fn incoming(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        match &self.keychain {
            Some(kc) => kc.lock().unwrap().decrypt(bytes),
            None => Ok(bytes.to_vec()),
        }
    }
}

/// The outer seal key: SHA-256 of the hashed password, so it shares no
/// bits with the PBKDF2-derived inner wrapping key.
fn outer_key(password: &str) -> [u8; KEY_LEN] {
    sha256(&sha256(password.as_bytes()))
}

fn build_lock_blob(master: &[u8; KEY_LEN], password: &str) -> Result<String> {
    let salt: [u8; SALT_LEN] = crypto::random_bytes();
    let iv: [u8; NONCE_LEN] = crypto::random_bytes();
    let wrapping_key = derive_wrapping_key(password, &salt);
    let wrapped = aes_gcm_encrypt(&wrapping_key, &iv, master)?;

    let envelope = LockEnvelope {
        salt: b64_encode(&salt),
        wrapped_master_key: b64_encode(&wrapped),
        iv: b64_encode(&iv),
        algo: LOCK_ALGO.to_string(),
    };
    let inner_json = serde_json::to_vec(&envelope).context("encode lock envelope")?;
    let sealed = crypto::seal(&outer_key(password), &inner_json)?;
    Ok(b64_encode(&sealed))
}
