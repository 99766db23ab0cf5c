//! # JWE Compact Envelope
//!
//! Hybrid encryption: a fresh AES-128-GCM content-encryption key per message,
//! wrapped to the recipient with RSA-OAEP-256.
//!
//! Wire form (RFC 7516 compact serialization):
//!
//! ```text
//! b64u(header) . b64u(wrapped_cek) . b64u(iv) . b64u(ciphertext) . b64u(tag)
//! ```
//!
//! The ASCII of the encoded header is the GCM additional authenticated data.

use super::rsa::RsaKeyPair;
use crate::error::{EncrypterError, Result};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Nonce};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64_URL, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Key management algorithm identifier
pub const KEY_ALGORITHM: &str = "RSA-OAEP-256";

/// Content encryption algorithm identifier
pub const CONTENT_ALGORITHM: &str = "A128GCM";

const CEK_LEN: usize = 16;
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, Serialize, Deserialize)]
struct JweHeader {
    alg: String,
    enc: String,
}

/// Encrypt `plaintext` into a JWE compact string for the key pair's public key.
pub fn seal(keys: &RsaKeyPair, plaintext: &[u8]) -> Result<String> {
    let header = JweHeader {
        alg: KEY_ALGORITHM.to_string(),
        enc: CONTENT_ALGORITHM.to_string(),
    };
    let header_json = serde_json::to_vec(&header).map_err(|e| {
        EncrypterError::envelope_error(format!("Failed to encode JWE header: {e}"), Some(Box::new(e)))
    })?;
    let encoded_header = BASE64_URL.encode(header_json);

    let mut rng = rand::thread_rng();
    let mut cek = [0u8; CEK_LEN];
    rng.fill_bytes(&mut cek);
    let mut iv = [0u8; IV_LEN];
    rng.fill_bytes(&mut iv);

    let wrapped_cek = keys.wrap_key(&cek)?;

    let cipher = Aes128Gcm::new_from_slice(&cek)
        .map_err(|e| EncrypterError::cipher_error(format!("Invalid content key: {e}"), None))?;
    let mut sealed = cipher
        .encrypt(
            Nonce::from_slice(&iv),
            Payload {
                msg: plaintext,
                aad: encoded_header.as_bytes(),
            },
        )
        .map_err(|e| EncrypterError::cipher_error(format!("AES-GCM encryption failed: {e}"), None))?;

    // aes-gcm appends the tag to the ciphertext
    let tag = sealed.split_off(sealed.len() - TAG_LEN);

    Ok(format!(
        "{}.{}.{}.{}.{}",
        encoded_header,
        BASE64_URL.encode(wrapped_cek),
        BASE64_URL.encode(iv),
        BASE64_URL.encode(sealed),
        BASE64_URL.encode(tag),
    ))
}

/// Decrypt a JWE compact string produced by [`seal`].
pub fn open(keys: &RsaKeyPair, envelope: &str) -> Result<Vec<u8>> {
    let parts: Vec<&str> = envelope.split('.').collect();
    let [encoded_header, wrapped_cek, iv, ciphertext, tag] = parts.as_slice() else {
        return Err(EncrypterError::envelope_error(
            format!("JWE compact form needs 5 segments, got {}", parts.len()),
            None,
        ));
    };

    let header: JweHeader = serde_json::from_slice(&decode_segment("header", encoded_header)?)
        .map_err(|e| {
            EncrypterError::envelope_error(format!("Invalid JWE header: {e}"), Some(Box::new(e)))
        })?;
    if header.alg != KEY_ALGORITHM || header.enc != CONTENT_ALGORITHM {
        return Err(EncrypterError::envelope_error(
            format!("Unsupported JWE algorithms {}/{}", header.alg, header.enc),
            None,
        ));
    }

    let iv = decode_segment("iv", iv)?;
    if iv.len() != IV_LEN {
        return Err(EncrypterError::envelope_error(
            format!("Invalid IV length: {}", iv.len()),
            None,
        ));
    }
    let tag = decode_segment("tag", tag)?;
    if tag.len() != TAG_LEN {
        return Err(EncrypterError::envelope_error(
            format!("Invalid tag length: {}", tag.len()),
            None,
        ));
    }

    let cek = keys.unwrap_key(&decode_segment("encrypted key", wrapped_cek)?)?;
    let cipher = Aes128Gcm::new_from_slice(&cek).map_err(|e| {
        EncrypterError::cipher_error(format!("Invalid content key length {}: {e}", cek.len()), None)
    })?;

    let mut sealed = decode_segment("ciphertext", ciphertext)?;
    sealed.extend_from_slice(&tag);

    cipher
        .decrypt(
            Nonce::from_slice(&iv),
            Payload {
                msg: &sealed,
                aad: encoded_header.as_bytes(),
            },
        )
        .map_err(|e| EncrypterError::cipher_error(format!("AES-GCM decryption failed: {e}"), None))
}

fn decode_segment(name: &str, segment: &str) -> Result<Vec<u8>> {
    BASE64_URL.decode(segment).map_err(|e| {
        EncrypterError::envelope_error(format!("Invalid base64 in JWE {name}: {e}"), Some(Box::new(e)))
    })
}
