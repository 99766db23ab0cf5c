//! # JWS Compact Signature
//!
//! PS256 (RSASSA-PSS, SHA-256) signatures over an arbitrary payload, in RFC
//! 7515 compact form: `b64u(header) . b64u(payload) . b64u(signature)`.

use super::rsa::RsaKeyPair;
use crate::error::{EncrypterError, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64_URL, Engine};
use serde::{Deserialize, Serialize};

/// Signature algorithm identifier
pub const SIGNATURE_ALGORITHM: &str = "PS256";

#[derive(Debug, Serialize, Deserialize)]
struct JwsHeader {
    alg: String,
}

/// Sign `payload`, returning the JWS compact string.
pub fn sign(keys: &RsaKeyPair, payload: &[u8]) -> Result<String> {
    let header = JwsHeader {
        alg: SIGNATURE_ALGORITHM.to_string(),
    };
    let header_json = serde_json::to_vec(&header).map_err(|e| {
        EncrypterError::envelope_error(format!("Failed to encode JWS header: {e}"), Some(Box::new(e)))
    })?;

    let signing_input = format!("{}.{}", BASE64_URL.encode(header_json), BASE64_URL.encode(payload));
    let signature = keys.sign(signing_input.as_bytes())?;

    Ok(format!("{signing_input}.{}", BASE64_URL.encode(signature)))
}

/// Verify a JWS compact string and return its payload.
pub fn verify(keys: &RsaKeyPair, token: &str) -> Result<Vec<u8>> {
    let mut segments = token.rsplitn(2, '.');
    let (Some(signature), Some(signing_input)) = (segments.next(), segments.next()) else {
        return Err(EncrypterError::envelope_error("JWS has no signature segment", None));
    };
    let Some((encoded_header, encoded_payload)) = signing_input.split_once('.') else {
        return Err(EncrypterError::envelope_error("JWS has no payload segment", None));
    };

    let header: JwsHeader = serde_json::from_slice(&decode_segment("header", encoded_header)?)
        .map_err(|e| {
            EncrypterError::envelope_error(format!("Invalid JWS header: {e}"), Some(Box::new(e)))
        })?;
    if header.alg != SIGNATURE_ALGORITHM {
        return Err(EncrypterError::envelope_error(
            format!("Unsupported JWS algorithm {}", header.alg),
            None,
        ));
    }

    let signature = decode_segment("signature", signature)?;
    keys.verify(signing_input.as_bytes(), &signature)?;

    decode_segment("payload", encoded_payload)
}

fn decode_segment(name: &str, segment: &str) -> Result<Vec<u8>> {
    BASE64_URL.decode(segment).map_err(|e| {
        EncrypterError::envelope_error(format!("Invalid base64 in JWS {name}: {e}"), Some(Box::new(e)))
    })
}
