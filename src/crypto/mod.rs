//! # Encryption Capability Module
//!
//! The unit of work each dispatched task runs: encrypt a plaintext, then sign
//! the resulting envelope.
//!
//! - [`JoseEncrypter`] - RSA-OAEP-256 + A128GCM JWE, signed with PS256 JWS
//! - [`MockEncrypter`] - fixed-latency placeholder for exercising the pipeline
//!
//! The dispatcher only sees `Arc<dyn Encrypter>`, so the variant is picked once
//! at start-up and never inspected afterwards.

pub mod jwe;
pub mod jws;
pub mod mock;
pub mod rsa;

pub use mock::{MockEncrypter, MockFailure};
pub use rsa::RsaKeyPair;

use crate::error::{EncrypterError, Result};
use crate::types::MessageResult;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Encrypt-then-sign capability invoked once per message.
///
/// Failures are reported inside the returned [`MessageResult`], never as a
/// panic or early return, so a bad item cannot affect its siblings. The
/// `index` of the returned result is left for the dispatcher to stamp.
#[async_trait]
pub trait Encrypter: Send + Sync + std::fmt::Debug {
    /// Encrypt `plaintext`, then sign the serialized ciphertext envelope.
    async fn encrypt_and_sign(&self, plaintext: Vec<u8>) -> MessageResult;

    /// Short name for logs and health output.
    fn name(&self) -> &'static str;

    /// PEM public key consumers need to verify signatures, if any.
    fn public_key_pem(&self) -> Option<&str> {
        None
    }
}

/// Real capability backed by a shared RSA key pair.
///
/// RSA work is CPU-bound, so each call runs on Tokio's blocking pool.
#[derive(Debug, Clone)]
pub struct JoseEncrypter {
    keys: Arc<RsaKeyPair>,
}

impl JoseEncrypter {
    /// Wrap an existing key pair.
    #[must_use]
    pub fn new(keys: Arc<RsaKeyPair>) -> Self {
        Self { keys }
    }

    /// Generate a key pair of `bits` and wrap it.
    ///
    /// ## Errors
    /// Key setup failures are fatal start-up errors, never per-item ones.
    pub fn generate(bits: usize) -> Result<Self> {
        Ok(Self::new(Arc::new(RsaKeyPair::generate(bits)?)))
    }

    /// The key pair this capability encrypts to and signs with.
    #[must_use]
    pub fn keys(&self) -> &Arc<RsaKeyPair> {
        &self.keys
    }

    /// Synchronous encrypt-then-sign used by the async entry point.
    #[must_use]
    pub fn seal(&self, plaintext: &[u8]) -> MessageResult {
        let encrypted_message = match jwe::seal(&self.keys, plaintext) {
            Ok(envelope) => envelope,
            Err(e) => return MessageResult::encrypt_failed(e),
        };

        match jws::sign(&self.keys, encrypted_message.as_bytes()) {
            Ok(signed_message) => MessageResult::sealed(encrypted_message, signed_message),
            Err(e) => MessageResult::sign_failed(encrypted_message, e),
        }
    }

    /// Decrypt an envelope produced by this capability.
    pub fn decrypt(&self, encrypted_message: &str) -> Result<Vec<u8>> {
        jwe::open(&self.keys, encrypted_message)
    }

    /// Verify a signature envelope and return the signed ciphertext envelope.
    pub fn verify(&self, signed_message: &str) -> Result<String> {
        let payload = jws::verify(&self.keys, signed_message)?;
        String::from_utf8(payload).map_err(|e| {
            EncrypterError::envelope_error(
                format!("Signed payload is not UTF-8: {e}"),
                Some(Box::new(e)),
            )
        })
    }
}

#[async_trait]
impl Encrypter for JoseEncrypter {
    async fn encrypt_and_sign(&self, plaintext: Vec<u8>) -> MessageResult {
        let this = self.clone();
        let len = plaintext.len();

        match tokio::task::spawn_blocking(move || this.seal(&plaintext)).await {
            Ok(result) => {
                debug!(
                    bytes = len,
                    ok = result.is_success(),
                    "Encrypted and signed message"
                );
                result
            }
            Err(e) => MessageResult::encrypt_failed(EncrypterError::task_error(format!(
                "Encryption worker failed: {e}"
            ))),
        }
    }

    fn name(&self) -> &'static str {
        "jose"
    }

    fn public_key_pem(&self) -> Option<&str> {
        Some(self.keys.public_key_pem())
    }
}

/// Shared 2048-bit key pair for unit tests; generated once per test binary.
#[cfg(test)]
pub(crate) fn test_key_pair() -> &'static Arc<RsaKeyPair> {
    static KEYS: std::sync::OnceLock<Arc<RsaKeyPair>> = std::sync::OnceLock::new();
    KEYS.get_or_init(|| {
        Arc::new(RsaKeyPair::generate(crate::MIN_RSA_KEY_SIZE).expect("test key generation"))
    })
}
