use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{anyhow, Result};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const SALT_LEN: usize = 16;
pub const PBKDF2_ROUNDS: u32 = 100_000;

pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}

pub fn sha256(bytes: &[u8]) -> [u8; KEY_LEN] {
    let digest = Sha256::digest(bytes);
    let mut out = [0u8; KEY_LEN];
    out.copy_from_slice(&digest);
    out
}

/// PBKDF2-SHA256 with the fixed round count used by the lock-file format.
pub fn derive_wrapping_key(password: &str, salt: &[u8]) -> [u8; KEY_LEN] {
    let mut out = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ROUNDS, &mut out);
    out
}

/// AES-GCM-256 with an explicit nonce. Fails on tampered ciphertext.
pub fn aes_gcm_encrypt(key: &[u8; KEY_LEN], nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    if nonce.len() != NONCE_LEN {
        return Err(anyhow!("bad nonce length: {}", nonce.len()));
    }
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| anyhow!("bad aes key length"))?;
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| anyhow!("aes-gcm encrypt failed"))
}

pub fn aes_gcm_decrypt(key: &[u8; KEY_LEN], nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if nonce.len() != NONCE_LEN {
        return Err(anyhow!("bad nonce length: {}", nonce.len()));
    }
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| anyhow!("bad aes key length"))?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| anyhow!("aes-gcm decrypt failed"))
}

/// Encrypt with a fresh random nonce; output is `nonce || ciphertext`.
pub fn seal(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
    let nonce: [u8; NONCE_LEN] = random_bytes();
    let ct = aes_gcm_encrypt(key, &nonce, plaintext)?;
    let mut out = Vec::with_capacity(NONCE_LEN + ct.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ct);
    Ok(out)
}

/// Inverse of `seal`: split the leading nonce and decrypt.
pub fn open(key: &[u8; KEY_LEN], blob: &[u8]) -> Result<Vec<u8>> {
    if blob.len() <= NONCE_LEN {
        return Err(anyhow!("sealed blob too short"));
    }
    aes_gcm_decrypt(key, &blob[..NONCE_LEN], &blob[NONCE_LEN..])
}
