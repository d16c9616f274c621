//! # Envelope Codec
//!
//! Payloads cross the edge/internal boundary as an envelope: the UTF-8 text is
//! gzip-compressed, encrypted with AES-CBC under a shared key and a fresh
//! random IV, and the `iv || ciphertext` bytes are base64-encoded.
//!
//! - **`envelope`**: the `EnvelopeCodec` itself plus key generation.
//! - **`padding`**: constant-time PKCS#7 validation used on the decrypt path.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Encrypt/decrypt of the transport envelope.
pub mod envelope;
/// PKCS#7 padding removal without data-dependent branches.
pub mod padding;

pub use envelope::{generate_key, EnvelopeCodec, BLOCK_LEN, IV_LEN};
