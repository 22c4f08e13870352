// src/gateway/crypto.rs
// Config token generation and password-based encryption

use aes_gcm::Aes256Gcm;
use aes_gcm::aead::{Aead, KeyInit, generic_array::GenericArray};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use sha2::Sha256;
use thiserror::Error;

const PBKDF2_ROUNDS: u32 = 100_000;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("ciphertext is too short")]
    Truncated,

    #[error("decryption failed (wrong password or corrupted token)")]
    Decrypt,

    #[error("encryption failed")]
    Encrypt,

    #[error("decrypted token is not UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Fresh random config token (32 bytes, URL-safe base64).
pub fn generate_config_token() -> String {
    let bytes: [u8; 32] = rand::random();
    URL_SAFE_NO_PAD.encode(bytes)
}

fn cipher(password: &str, salt: &[u8]) -> Aes256Gcm {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ROUNDS, &mut key);
    Aes256Gcm::new(GenericArray::from_slice(&key))
}

/// Encrypt a config token with the user's password.
///
/// Output is `base64(salt ‖ nonce ‖ ciphertext)`.
pub fn encrypt_config_token(token: &str, password: &str) -> Result<String, CryptoError> {
    let salt: [u8; SALT_LEN] = rand::random();
    let nonce: [u8; NONCE_LEN] = rand::random();

    let ciphertext = cipher(password, &salt)
        .encrypt(GenericArray::from_slice(&nonce), token.as_bytes())
        .map_err(|_| CryptoError::Encrypt)?;

    let mut out = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(STANDARD.encode(out))
}

pub fn decrypt_config_token(encrypted: &str, password: &str) -> Result<String, CryptoError> {
    let raw = STANDARD.decode(encrypted.trim())?;
    if raw.len() <= SALT_LEN + NONCE_LEN {
        return Err(CryptoError::Truncated);
    }
    let (salt, rest) = raw.split_at(SALT_LEN);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

    let plaintext = cipher(password, salt)
        .decrypt(GenericArray::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Decrypt)?;
    Ok(String::from_utf8(plaintext)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_survives_encryption_with_the_right_password() {
        let token = generate_config_token();
        let encrypted = encrypt_config_token(&token, "hunter2").unwrap();
        assert!(!encrypted.contains(&token));
        assert_eq!(decrypt_config_token(&encrypted, "hunter2").unwrap(), token);
    }

    #[test]
    fn wrong_password_fails() {
        let encrypted = encrypt_config_token("token", "right").unwrap();
        assert!(matches!(
            decrypt_config_token(&encrypted, "wrong"),
            Err(CryptoError::Decrypt)
        ));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(decrypt_config_token("!!!", "pw"), Err(CryptoError::Encoding(_))));
        assert!(matches!(
            decrypt_config_token(&STANDARD.encode([0u8; 8]), "pw"),
            Err(CryptoError::Truncated)
        ));
    }

    #[test]
    fn generated_tokens_are_distinct_and_url_safe() {
        let a = generate_config_token();
        let b = generate_config_token();
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }
}
