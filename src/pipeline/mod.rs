//! # Batch Pipeline
//!
//! Bounded fan-out/fan-in over an injected [`Encrypter`](crate::crypto::Encrypter):
//!
//! ```text
//! batch ─▶ Dispatcher ─▶ N tasks (≤ limit running) ─▶ completion channel ─▶ Collector ─▶ ordered results
//! ```
//!
//! - [`Dispatcher`] spawns one task per message, gated by a counting semaphore
//! - [`Collector`] places each result by its stamped index
//! - [`PipelineMetrics`] counts batches and per-item failures

pub mod collector;
pub mod dispatcher;

pub use collector::Collector;
pub use dispatcher::{process, Dispatcher};

use crate::error::EncrypterError;
use crate::types::MessageResult;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Lock-free counters updated once per processed batch.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    batches: AtomicU64,
    messages: AtomicU64,
    encrypt_errors: AtomicU64,
    sign_errors: AtomicU64,
    timeouts: AtomicU64,
    total_latency_ms: AtomicU64,
}

impl PipelineMetrics {
    /// Fold one finished batch into the counters.
    pub fn record_batch(&self, results: &[MessageResult], elapsed: Duration) {
        let mut encrypt_errors = 0;
        let mut sign_errors = 0;
        let mut timeouts = 0;
        for result in results {
            match &result.encrypt_error {
                Some(EncrypterError::TimeoutError { .. }) => {
                    encrypt_errors += 1;
                    timeouts += 1;
                }
                Some(_) => encrypt_errors += 1,
                None => {}
            }
            if result.sign_error.is_some() {
                sign_errors += 1;
            }
        }

        self.batches.fetch_add(1, Ordering::Relaxed);
        self.messages.fetch_add(results.len() as u64, Ordering::Relaxed);
        self.encrypt_errors.fetch_add(encrypt_errors, Ordering::Relaxed);
        self.sign_errors.fetch_add(sign_errors, Ordering::Relaxed);
        self.timeouts.fetch_add(timeouts, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(
            u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
    }

    /// Point-in-time copy of the counters.
    #[must_use]
    pub fn snapshot(&self) -> DispatchMetrics {
        DispatchMetrics {
            batches: self.batches.load(Ordering::Relaxed),
            messages: self.messages.load(Ordering::Relaxed),
            encrypt_errors: self.encrypt_errors.load(Ordering::Relaxed),
            sign_errors: self.sign_errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            total_latency_ms: self.total_latency_ms.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`PipelineMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchMetrics {
    /// Number of batches processed
    pub batches: u64,
    /// Number of messages processed across all batches
    pub messages: u64,
    /// Results carrying an encryption error (timeouts included)
    pub encrypt_errors: u64,
    /// Results carrying a signing error
    pub sign_errors: u64,
    /// Capability calls cut off by the per-task timeout
    pub timeouts: u64,
    /// Sum of batch wall-clock times in milliseconds
    pub total_latency_ms: u64,
}

impl DispatchMetrics {
    /// Returns the average wall-clock time per batch in milliseconds
    #[must_use]
    pub fn average_batch_latency_ms(&self) -> f64 {
        if self.batches == 0 {
            0.0
        } else {
            self.total_latency_ms as f64 / self.batches as f64
        }
    }

    /// Returns failed messages as a percentage of all messages
    #[must_use]
    pub fn error_rate_percent(&self) -> f64 {
        if self.messages == 0 {
            0.0
        } else {
            ((self.encrypt_errors + self.sign_errors) as f64 / self.messages as f64) * 100.0
        }
    }
}
