//! # Mock Encryption Capability
//!
//! Stands in for [`JoseEncrypter`](super::JoseEncrypter) when exercising the
//! dispatcher: waits a fixed delay, then returns placeholder envelopes. No
//! cryptography is performed and the plaintext is ignored.

use super::Encrypter;
use crate::error::EncrypterError;
use crate::types::MessageResult;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Placeholder envelope size in bytes
pub const MOCK_PAYLOAD_SIZE: usize = 5000;

/// Default simulated latency per call
pub const DEFAULT_MOCK_DELAY: Duration = Duration::from_secs(1);

/// Failure the mock injects into every result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MockFailure {
    /// Every call succeeds
    #[default]
    None,
    /// Every call reports an encryption error
    Encrypt,
    /// Every call encrypts, then reports a signing error
    Sign,
}

/// Fixed-latency capability with placeholder output.
#[derive(Debug)]
pub struct MockEncrypter {
    delay: Duration,
    failure: MockFailure,
    calls: AtomicU64,
}

impl MockEncrypter {
    /// Mock with the given per-call delay and no injected failures.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            failure: MockFailure::None,
            calls: AtomicU64::new(0),
        }
    }

    /// Inject a failure into every result.
    #[must_use]
    pub fn with_failure(mut self, failure: MockFailure) -> Self {
        self.failure = failure;
        self
    }

    /// Configured per-call delay.
    #[must_use]
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Number of calls made so far.
    #[must_use]
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    fn placeholder() -> String {
        "\0".repeat(MOCK_PAYLOAD_SIZE)
    }
}

impl Default for MockEncrypter {
    fn default() -> Self {
        Self::new(DEFAULT_MOCK_DELAY)
    }
}

#[async_trait]
impl Encrypter for MockEncrypter {
    async fn encrypt_and_sign(&self, _plaintext: Vec<u8>) -> MessageResult {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match self.failure {
            MockFailure::None => MessageResult::sealed(Self::placeholder(), Self::placeholder()),
            MockFailure::Encrypt => MessageResult::encrypt_failed(EncrypterError::cipher_error(
                "mock encryption failure",
                None,
            )),
            MockFailure::Sign => MessageResult::sign_failed(
                Self::placeholder(),
                EncrypterError::rsa_error("mock signing failure", None),
            ),
        }
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
