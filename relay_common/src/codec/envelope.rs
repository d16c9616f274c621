use std::fmt;
use std::io::{Read, Write};

use aes::{Aes128, Aes192, Aes256};
use base64::{engine::general_purpose, Engine as _};
use cbc::{Decryptor, Encryptor};
use cipher::block_padding::{NoPadding, Pkcs7};
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rand::{rng, RngCore};

use crate::codec::padding::strip_pkcs7;
use crate::errors::{DecodeError, RelayError, RelayResult};

/// Length of the IV prefix of every envelope.
pub const IV_LEN: usize = 16;
/// AES block size.
pub const BLOCK_LEN: usize = 16;

/// Upper bound on a decompressed payload; larger streams are rejected.
const MAX_PLAINTEXT_LEN: u64 = 256 * 1024 * 1024;

#[derive(Clone)]
enum CipherKey {
    Aes128([u8; 16]),
    Aes192([u8; 24]),
    Aes256([u8; 32]),
}

/// Symmetric envelope codec shared by both sides of the relay.
///
/// The key is never defaulted: it has to come from configuration, and a key
/// that does not decode to 16, 24 or 32 bytes is a fatal configuration error.
#[derive(Clone)]
pub struct EnvelopeCodec {
    key: CipherKey,
}

impl fmt::Debug for EnvelopeCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvelopeCodec")
            .field("key_bits", &self.key_bits())
            .finish_non_exhaustive()
    }
}

impl EnvelopeCodec {
    /// Builds a codec from a base64-encoded key.
    ///
    /// # Errors
    /// `RelayError::FatalConfig` if the text is not base64 or the decoded key
    /// is not a valid AES key length.
    pub fn from_base64_key(key_b64: &str) -> RelayResult<Self> {
        let key = general_purpose::STANDARD
            .decode(key_b64.trim())
            .map_err(|e| RelayError::FatalConfig(format!("AES key is not valid base64: {}", e)))?;
        Self::from_key_bytes(&key)
    }

    /// Builds a codec from raw key bytes (16, 24 or 32 bytes).
    pub fn from_key_bytes(key: &[u8]) -> RelayResult<Self> {
        let key = match key.len() {
            16 => CipherKey::Aes128(key.try_into().map_err(|_| bad_key_len(16))?),
            24 => CipherKey::Aes192(key.try_into().map_err(|_| bad_key_len(24))?),
            32 => CipherKey::Aes256(key.try_into().map_err(|_| bad_key_len(32))?),
            other => return Err(bad_key_len(other)),
        };
        Ok(Self { key })
    }

    /// Key size in bits (128, 192 or 256).
    pub fn key_bits(&self) -> usize {
        match self.key {
            CipherKey::Aes128(_) => 128,
            CipherKey::Aes192(_) => 192,
            CipherKey::Aes256(_) => 256,
        }
    }

    /// Compresses, encrypts and base64-encodes `plaintext` under a fresh IV.
    pub fn encrypt(&self, plaintext: &str) -> RelayResult<String> {
        let mut iv = [0u8; IV_LEN];
        rng().fill_bytes(&mut iv);
        self.encrypt_with_iv(plaintext, &iv)
    }

    /// Same as [`encrypt`](Self::encrypt) with a caller-supplied IV.
    ///
    /// Only meant for reproducible fixtures; reusing an IV under one key
    /// leaks plaintext structure.
    pub fn encrypt_with_iv(&self, plaintext: &str, iv: &[u8; IV_LEN]) -> RelayResult<String> {
        let compressed = gzip(plaintext.as_bytes())?;

        let ciphertext = match &self.key {
            CipherKey::Aes128(k) => {
                Encryptor::<Aes128>::new(k.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(&compressed)
            }
            CipherKey::Aes192(k) => {
                Encryptor::<Aes192>::new(k.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(&compressed)
            }
            CipherKey::Aes256(k) => {
                Encryptor::<Aes256>::new(k.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(&compressed)
            }
        };

        let mut combined = Vec::with_capacity(IV_LEN + ciphertext.len());
        combined.extend_from_slice(iv);
        combined.extend_from_slice(&ciphertext);
        Ok(general_purpose::STANDARD.encode(combined))
    }

    /// Reverses [`encrypt`](Self::encrypt).
    ///
    /// Every failure collapses into a single [`DecodeError`]; the specific
    /// step is only visible in debug logs.
    pub fn decrypt(&self, text: &str) -> Result<String, DecodeError> {
        let combined = general_purpose::STANDARD.decode(text.trim()).map_err(|e| {
            tracing::debug!("Envelope is not base64: {}", e);
            DecodeError
        })?;

        if combined.len() < IV_LEN {
            tracing::debug!(len = combined.len(), "Envelope shorter than the IV");
            return Err(DecodeError);
        }
        let (iv, ciphertext) = combined.split_at(IV_LEN);
        if ciphertext.is_empty() || ciphertext.len() % BLOCK_LEN != 0 {
            tracing::debug!(len = ciphertext.len(), "Ciphertext is not a whole number of blocks");
            return Err(DecodeError);
        }
        let iv: [u8; IV_LEN] = iv.try_into().map_err(|_| DecodeError)?;

        let decrypted = match &self.key {
            CipherKey::Aes128(k) => Decryptor::<Aes128>::new(k.into(), (&iv).into())
                .decrypt_padded_vec_mut::<NoPadding>(ciphertext),
            CipherKey::Aes192(k) => Decryptor::<Aes192>::new(k.into(), (&iv).into())
                .decrypt_padded_vec_mut::<NoPadding>(ciphertext),
            CipherKey::Aes256(k) => Decryptor::<Aes256>::new(k.into(), (&iv).into())
                .decrypt_padded_vec_mut::<NoPadding>(ciphertext),
        }
        .map_err(|e| {
            tracing::debug!("Block decryption failed: {:?}", e);
            DecodeError
        })?;

        let compressed = strip_pkcs7(&decrypted, BLOCK_LEN).ok_or_else(|| {
            tracing::debug!("Invalid PKCS#7 padding");
            DecodeError
        })?;

        let plain = gunzip(compressed)?;
        String::from_utf8(plain).map_err(|e| {
            tracing::debug!("Decrypted payload is not UTF-8: {}", e);
            DecodeError
        })
    }
}

/// Generates a random AES key of `bits` (128, 192 or 256) as base64 text.
pub fn generate_key(bits: usize) -> RelayResult<String> {
    let len = match bits {
        128 | 192 | 256 => bits / 8,
        other => {
            return Err(RelayError::FatalConfig(format!(
                "Unsupported key size {} (expected 128, 192 or 256)",
                other
            )))
        }
    };
    let mut key = vec![0u8; len];
    rng().fill_bytes(&mut key);
    Ok(general_purpose::STANDARD.encode(key))
}

fn bad_key_len(len: usize) -> RelayError {
    RelayError::FatalConfig(format!(
        "AES key must decode to 16, 24 or 32 bytes, found {}",
        len
    ))
}

fn gzip(bytes: &[u8]) -> RelayResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(bytes)
        .map_err(|e| RelayError::Encode(format!("gzip failed: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| RelayError::Encode(format!("gzip failed: {}", e)))
}

fn gunzip(bytes: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::new();
    GzDecoder::new(bytes)
        .take(MAX_PLAINTEXT_LEN + 1)
        .read_to_end(&mut out)
        .map_err(|e| {
            tracing::debug!("gunzip failed: {}", e);
            DecodeError
        })?;
    if out.len() as u64 > MAX_PLAINTEXT_LEN {
        tracing::debug!("Decompressed payload exceeds limit");
        return Err(DecodeError);
    }
    Ok(out)
}
