//! Batch input and per-item output shapes.

use crate::error::EncrypterError;
use serde::{Deserialize, Serialize};

/// One plaintext unit submitted for processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IncomingMessage {
    /// Plaintext to encrypt and sign
    pub content: String,
}

impl IncomingMessage {
    /// Wrap a plaintext string.
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

/// Outcome of encrypting and signing exactly one [`IncomingMessage`].
///
/// `encrypted_message` is only populated when `encrypt_error` is `None`, and
/// `signed_message` only when both errors are `None`.
#[derive(Debug, Default)]
pub struct MessageResult {
    /// Position of the originating message in the submitted batch
    pub index: usize,
    /// Serialized encryption envelope
    pub encrypted_message: String,
    /// Set when encryption failed; signing is then skipped
    pub encrypt_error: Option<EncrypterError>,
    /// Serialized signature envelope over `encrypted_message`
    pub signed_message: String,
    /// Set when signing failed after a successful encryption
    pub sign_error: Option<EncrypterError>,
}

impl MessageResult {
    /// Successful result carrying both envelopes.
    #[must_use]
    pub fn sealed(encrypted_message: String, signed_message: String) -> Self {
        Self {
            encrypted_message,
            signed_message,
            ..Self::default()
        }
    }

    /// Encryption failed; nothing else is populated.
    #[must_use]
    pub fn encrypt_failed(error: EncrypterError) -> Self {
        Self {
            encrypt_error: Some(error),
            ..Self::default()
        }
    }

    /// Encryption succeeded but signing failed.
    #[must_use]
    pub fn sign_failed(encrypted_message: String, error: EncrypterError) -> Self {
        Self {
            encrypted_message,
            sign_error: Some(error),
            ..Self::default()
        }
    }

    /// Stamp the batch position this result belongs to.
    #[must_use]
    pub fn with_index(mut self, index: usize) -> Self {
        self.index = index;
        self
    }

    /// True when both encryption and signing succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.encrypt_error.is_none() && self.sign_error.is_none()
    }
}

/// Body of a `POST /log` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogRequest {
    /// User id the caller is acting as
    pub user: String,
}
