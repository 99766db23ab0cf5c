//! Fan-out side of the pipeline.

use super::collector::Collector;
use super::PipelineMetrics;
use crate::crypto::Encrypter;
use crate::error::{EncrypterError, Result};
use crate::types::{IncomingMessage, MessageResult};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, instrument, warn};

/// Runs one capability call per message with bounded concurrency.
///
/// Task creation is unbounded (one Tokio task per message); execution is
/// bounded by a counting semaphore of `concurrency_limit` permits. The
/// semaphore and completion channel are created per batch and dropped when
/// [`Dispatcher::process`] returns.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    encrypter: Arc<dyn Encrypter>,
    concurrency_limit: usize,
    task_timeout: Option<Duration>,
    metrics: Arc<PipelineMetrics>,
}

impl Dispatcher {
    /// Build a dispatcher around an already-constructed capability.
    ///
    /// ## Errors
    /// - `EncrypterError::ConfigError`: if `concurrency_limit` is zero
    pub fn new(encrypter: Arc<dyn Encrypter>, concurrency_limit: usize) -> Result<Self> {
        if concurrency_limit == 0 {
            return Err(EncrypterError::config_error(
                "Concurrency limit must be at least 1",
                None,
            ));
        }

        Ok(Self {
            encrypter,
            concurrency_limit,
            task_timeout: None,
            metrics: Arc::new(PipelineMetrics::default()),
        })
    }

    /// Bound each capability call; an expired call becomes a timeout error
    /// in that item's result.
    ///
    /// Expiry does not free the call's concurrency slot: work that cannot be
    /// cancelled, such as a blocking RSA operation, keeps its permit until it
    /// ends. A timed-out call may therefore still be running when
    /// [`Dispatcher::process`] returns.
    #[must_use]
    pub fn with_task_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.task_timeout = timeout;
        self
    }

    /// Record into a shared metrics instance.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Maximum number of simultaneous capability calls.
    #[must_use]
    pub fn concurrency_limit(&self) -> usize {
        self.concurrency_limit
    }

    /// Per-task timeout, if any.
    #[must_use]
    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout
    }

    /// The injected capability.
    #[must_use]
    pub fn encrypter(&self) -> &Arc<dyn Encrypter> {
        &self.encrypter
    }

    /// Metrics this dispatcher records into.
    #[must_use]
    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// Encrypt and sign every message in `batch`.
    ///
    /// Returns exactly `batch.len()` results; result `i` belongs to message
    /// `i` regardless of completion order. Per-item failures are carried in
    /// the results and never cut the batch short. There is no cancellation:
    /// the call runs until every task has reported.
    #[instrument(
        level = "debug",
        name = "dispatch",
        skip(self, batch),
        fields(batch_size = batch.len(), limit = self.concurrency_limit)
    )]
    pub async fn process(&self, batch: Vec<IncomingMessage>) -> Vec<MessageResult> {
        if batch.is_empty() {
            debug!("Empty batch; nothing to dispatch");
            return Vec::new();
        }

        let started = Instant::now();
        let expected = batch.len();
        let semaphore = Arc::new(Semaphore::new(self.concurrency_limit));
        let (tx, rx) = mpsc::unbounded_channel();

        for (index, message) in batch.into_iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let encrypter = Arc::clone(&self.encrypter);
            let tx = tx.clone();
            let task_timeout = self.task_timeout;

            tokio::spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(permit) => {
                        run_capability(encrypter, message.content, permit, task_timeout).await
                    }
                    Err(e) => MessageResult::encrypt_failed(EncrypterError::task_error(format!(
                        "Concurrency gate closed: {e}"
                    ))),
                };

                if tx.send(result.with_index(index)).is_err() {
                    warn!(index, "Collector dropped before result was delivered");
                }
            });
        }
        // Only the tasks hold senders now, so a closed channel means every task ended.
        drop(tx);

        let results = Collector::new(expected).collect(rx).await;

        let elapsed = started.elapsed();
        self.metrics.record_batch(&results, elapsed);
        info!(
            messages = results.len(),
            failures = results.iter().filter(|r| !r.is_success()).count(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Batch processed"
        );

        results
    }
}

/// Run one capability call while holding `permit`.
///
/// With a timeout the call runs in its own task that owns the permit. An
/// expired call is reported at once, but the permit is only returned when the
/// underlying work (possibly on a blocking thread) has actually finished.
async fn run_capability(
    encrypter: Arc<dyn Encrypter>,
    content: String,
    permit: OwnedSemaphorePermit,
    task_timeout: Option<Duration>,
) -> MessageResult {
    let Some(limit) = task_timeout else {
        let result = encrypter.encrypt_and_sign(content.into_bytes()).await;
        drop(permit);
        return result;
    };

    let work = tokio::spawn(async move {
        let result = encrypter.encrypt_and_sign(content.into_bytes()).await;
        drop(permit);
        result
    });

    match tokio::time::timeout(limit, work).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => MessageResult::encrypt_failed(EncrypterError::task_error(format!(
            "Capability task failed: {e}"
        ))),
        Err(_) => {
            let timeout_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
            warn!(timeout_ms, "Capability call timed out");
            MessageResult::encrypt_failed(EncrypterError::timeout_error(timeout_ms))
        }
    }
}

/// Encrypt and sign `batch` with `encrypter`, at most `concurrency_limit` at
/// a time.
///
/// Convenience wrapper over [`Dispatcher`] for one-off batches.
///
/// ## Errors
/// - `EncrypterError::ConfigError`: if `concurrency_limit` is zero
pub async fn process(
    batch: Vec<IncomingMessage>,
    encrypter: Arc<dyn Encrypter>,
    concurrency_limit: usize,
) -> Result<Vec<MessageResult>> {
    let dispatcher = Dispatcher::new(encrypter, concurrency_limit)?;
    Ok(dispatcher.process(batch).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{MockEncrypter, MockFailure};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Echoes the plaintext back, sleeping longer for earlier messages so
    /// completion order is the reverse of submission order.
    #[derive(Debug)]
    struct ReverseDelayEncrypter {
        batch_size: u64,
    }

    #[async_trait]
    impl Encrypter for ReverseDelayEncrypter {
        async fn encrypt_and_sign(&self, plaintext: Vec<u8>) -> MessageResult {
            let content = String::from_utf8(plaintext).unwrap();
            let position: u64 = content.parse().unwrap();
            let delay = (self.batch_size - position) * 10;
            tokio::time::sleep(Duration::from_millis(delay)).await;
            MessageResult::sealed(content.clone(), format!("sig-{content}"))
        }

        fn name(&self) -> &'static str {
            "reverse-delay"
        }
    }

    fn numbered_batch(n: usize) -> Vec<IncomingMessage> {
        (0..n).map(|i| IncomingMessage::new(i.to_string())).collect()
    }

    #[test]
    fn test_zero_limit_rejected() {
        let mock: Arc<dyn Encrypter> = Arc::new(MockEncrypter::new(Duration::ZERO));
        let err = Dispatcher::new(mock, 0).unwrap_err();
        assert!(matches!(err, EncrypterError::ConfigError { .. }));
    }

    #[tokio::test]
    async fn test_empty_batch_returns_immediately() {
        let mock = Arc::new(MockEncrypter::new(Duration::from_secs(3600)));
        let dispatcher = Dispatcher::new(mock.clone(), 4).unwrap();

        let results = dispatcher.process(Vec::new()).await;

        assert!(results.is_empty());
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_follow_input_order_not_completion_order() {
        let encrypter = Arc::new(ReverseDelayEncrypter { batch_size: 8 });
        let dispatcher = Dispatcher::new(encrypter, 8).unwrap();

        let results = dispatcher.process(numbered_batch(8)).await;

        assert_eq!(results.len(), 8);
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result.index, i);
            assert_eq!(result.encrypted_message, i.to_string());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_abc_scenario_limit_one() {
        let dispatcher = Dispatcher::new(Arc::new(MockEncrypter::new(Duration::from_millis(5))), 1)
            .unwrap();
        let batch = vec![
            IncomingMessage::new("a"),
            IncomingMessage::new("b"),
            IncomingMessage::new("c"),
        ];

        let results = dispatcher.process(batch).await;

        assert_eq!(results.len(), 3);
        let mut indices: Vec<usize> = results.iter().map(|r| r.index).collect();
        indices.sort_unstable();
        assert_eq!(indices, [0, 1, 2]);
        assert!(results.iter().all(MessageResult::is_success));
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_timeout_reports_error_instead_of_stalling() {
        let slow = Arc::new(MockEncrypter::new(Duration::from_secs(60)));
        let dispatcher = Dispatcher::new(slow, 2)
            .unwrap()
            .with_task_timeout(Some(Duration::from_millis(100)));

        let start = tokio::time::Instant::now();
        let results = dispatcher.process(numbered_batch(3)).await;

        // The third call only starts once one of the first two really ends.
        assert!(start.elapsed() >= Duration::from_secs(60));
        assert_eq!(results.len(), 3);
        for result in &results {
            assert!(matches!(
                result.encrypt_error,
                Some(EncrypterError::TimeoutError { timeout_ms: 100 })
            ));
        }
        assert_eq!(dispatcher.metrics().snapshot().timeouts, 3);
    }

    /// Does its work on a blocking thread and records peak overlap.
    #[derive(Debug, Default)]
    struct BlockingEncrypter {
        active: Arc<AtomicUsize>,
        max_active: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Encrypter for BlockingEncrypter {
        async fn encrypt_and_sign(&self, plaintext: Vec<u8>) -> MessageResult {
            let active = Arc::clone(&self.active);
            let max_active = Arc::clone(&self.max_active);
            tokio::task::spawn_blocking(move || {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_active.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(150));
                active.fetch_sub(1, Ordering::SeqCst);
                let text = String::from_utf8_lossy(&plaintext).into_owned();
                MessageResult::sealed(text.clone(), text)
            })
            .await
            .unwrap()
        }

        fn name(&self) -> &'static str {
            "blocking"
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timed_out_blocking_work_keeps_its_permit() {
        let encrypter = Arc::new(BlockingEncrypter::default());
        let dispatcher = Dispatcher::new(encrypter.clone(), 1)
            .unwrap()
            .with_task_timeout(Some(Duration::from_millis(20)));

        let results = dispatcher.process(numbered_batch(4)).await;

        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| matches!(
            r.encrypt_error,
            Some(EncrypterError::TimeoutError { timeout_ms: 20 })
        )));

        // Let the last detached call drain before reading the peak.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(encrypter.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(encrypter.active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_free_function_matches_dispatcher() {
        let mock: Arc<dyn Encrypter> =
            Arc::new(MockEncrypter::new(Duration::ZERO).with_failure(MockFailure::Sign));

        let results = process(numbered_batch(4), mock.clone(), 2).await.unwrap();
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| r.sign_error.is_some()));

        assert!(process(numbered_batch(1), mock, 0).await.is_err());
    }
}
