//! Passphrase envelopes
//!
//! Wire format is the OpenSSL salted layout produced by the partners'
//! CryptoJS clients: `base64("Salted__" || salt[8] || AES-256-CBC(PKCS7))`,
//! with key and IV derived by `EVP_BytesToKey` (MD5, one round).

use super::key::EnvelopeKey;
use crate::error::{Error, Result};
use aes::Aes256;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use md5::{Digest, Md5};
use rand::RngCore;
use serde::{de::DeserializeOwned, Serialize};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

const SALT_MAGIC: &[u8; 8] = b"Salted__";
const SALT_LEN: usize = 8;
const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;
const BLOCK_LEN: usize = 16;

/// Stateless envelope operations
#[derive(Debug, Clone, Copy, Default)]
pub struct Envelope;

impl Envelope {
    /// Encrypt `plaintext` under `key` with a fresh random salt
    pub fn seal(plaintext: &str, key: &EnvelopeKey) -> Result<String> {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        Self::seal_with_salt(plaintext, key, salt)
    }

    /// Encrypt with a caller-chosen salt; deterministic output
    pub fn seal_with_salt(plaintext: &str, key: &EnvelopeKey, salt: [u8; SALT_LEN]) -> Result<String> {
        let (cipher_key, iv) = evp_bytes_to_key(key.as_bytes(), &salt);
        let cipher = Aes256CbcEnc::new_from_slices(&cipher_key, &iv)
            .map_err(|e| Error::InvalidKey(e.to_string()))?;
        let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

        let mut framed = Vec::with_capacity(SALT_MAGIC.len() + SALT_LEN + ciphertext.len());
        framed.extend_from_slice(SALT_MAGIC);
        framed.extend_from_slice(&salt);
        framed.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(framed))
    }

    /// Decrypt an envelope.
    ///
    /// Returns `None` for malformed base64, a missing salt header, a wrong
    /// key, bad padding, non-UTF-8 output or an empty plaintext. Callers
    /// must answer `None` with the generic invalid-encryption response.
    pub fn open(ciphertext: &str, key: &EnvelopeKey) -> Option<String> {
        let raw = STANDARD.decode(ciphertext.trim()).ok()?;
        let header_len = SALT_MAGIC.len() + SALT_LEN;
        if raw.len() < header_len + BLOCK_LEN || &raw[..SALT_MAGIC.len()] != SALT_MAGIC {
            return None;
        }
        let body = &raw[header_len..];
        if body.len() % BLOCK_LEN != 0 {
            return None;
        }

        let (cipher_key, iv) = evp_bytes_to_key(key.as_bytes(), &raw[SALT_MAGIC.len()..header_len]);
        let cipher = Aes256CbcDec::new_from_slices(&cipher_key, &iv).ok()?;
        let plain = cipher.decrypt_padded_vec_mut::<Pkcs7>(body).ok()?;
        let text = String::from_utf8(plain).ok()?;
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }

    /// Serialize to JSON then seal
    pub fn seal_json<T: Serialize + ?Sized>(value: &T, key: &EnvelopeKey) -> Result<String> {
        let json = serde_json::to_string(value)?;
        Self::seal(&json, key)
    }

    /// Open then parse JSON; any failure yields `None`
    pub fn open_json<T: DeserializeOwned>(ciphertext: &str, key: &EnvelopeKey) -> Option<T> {
        let text = Self::open(ciphertext, key)?;
        serde_json::from_str(&text).ok()
    }
}

/// OpenSSL `EVP_BytesToKey` with MD5 and a single iteration
fn evp_bytes_to_key(passphrase: &[u8], salt: &[u8]) -> ([u8; KEY_LEN], [u8; IV_LEN]) {
    let mut derived = Vec::with_capacity(KEY_LEN + IV_LEN + 16);
    let mut previous: Vec<u8> = Vec::new();
    while derived.len() < KEY_LEN + IV_LEN {
        let mut hasher = Md5::new();
        hasher.update(&previous);
        hasher.update(passphrase);
        hasher.update(salt);
        previous = hasher.finalize().to_vec();
        derived.extend_from_slice(&previous);
    }

    let mut key = [0u8; KEY_LEN];
    let mut iv = [0u8; IV_LEN];
    key.copy_from_slice(&derived[..KEY_LEN]);
    iv.copy_from_slice(&derived[KEY_LEN..KEY_LEN + IV_LEN]);
    (key, iv)
}
