//! Fan-in side of the pipeline.

use crate::error::EncrypterError;
use crate::types::MessageResult;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{error, warn};

/// Gathers one result per dispatched task and orders them by stamped index.
///
/// Placement uses [`MessageResult::index`], never arrival order, so output
/// position `i` always belongs to input message `i`.
#[derive(Debug)]
pub struct Collector {
    slots: Vec<Option<MessageResult>>,
    received: usize,
}

impl Collector {
    /// Collector expecting exactly `expected` results.
    #[must_use]
    pub fn new(expected: usize) -> Self {
        Self {
            slots: std::iter::repeat_with(|| None).take(expected).collect(),
            received: 0,
        }
    }

    /// Number of results still outstanding.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.slots.len() - self.received
    }

    /// Place one result at its stamped position.
    ///
    /// Returns `false` if the index is out of range or already filled.
    pub fn accept(&mut self, result: MessageResult) -> bool {
        let index = result.index;
        let batch_size = self.slots.len();
        let Some(slot) = self.slots.get_mut(index) else {
            warn!(index, batch_size, "Result index outside batch");
            return false;
        };
        if slot.is_some() {
            warn!(index, "Duplicate result for batch position; keeping the first");
            return false;
        }

        *slot = Some(result);
        self.received += 1;
        true
    }

    /// Receive until every expected result arrived, then return them in
    /// batch order.
    ///
    /// Waits without a deadline. If all senders are dropped first (a task
    /// panicked or was aborted), the missing positions are reported as
    /// aborted tasks instead of blocking forever.
    pub async fn collect(mut self, mut rx: UnboundedReceiver<MessageResult>) -> Vec<MessageResult> {
        while self.pending() > 0 {
            match rx.recv().await {
                Some(result) => {
                    self.accept(result);
                }
                None => {
                    error!(
                        missing = self.pending(),
                        "Completion channel closed before all results arrived"
                    );
                    break;
                }
            }
        }
        self.finish()
    }

    /// Assemble the output, filling any unfilled position with an aborted
    /// task result.
    #[must_use]
    pub fn finish(self) -> Vec<MessageResult> {
        self.slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    MessageResult::encrypt_failed(EncrypterError::task_error(
                        "task ended without delivering a result",
                    ))
                    .with_index(index)
                })
            })
            .collect()
    }
}
