//! Shared retry and bandwidth plumbing for backends.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::error::StorageError;
use crate::transfer::{Attempt, Governor, Retryer};

/// Runs backend calls under the session [`Retryer`] and feeds each attempt's
/// outcome back to the [`Governor`].
///
/// Only transport-level failures count against the adaptive ceiling; a
/// missing object or a rejected credential says nothing about the network.
#[derive(Debug, Clone, Default)]
pub struct OperationRunner {
    retryer: Arc<Retryer>,
    governor: Governor,
}

impl OperationRunner {
    #[must_use]
    pub fn new(retryer: Arc<Retryer>, governor: Governor) -> Self {
        Self { retryer, governor }
    }

    #[must_use]
    pub fn retryer(&self) -> &Retryer {
        &self.retryer
    }

    #[must_use]
    pub fn governor(&self) -> &Governor {
        &self.governor
    }

    /// Runs `op` with retries, labelling logs and errors with `operation`.
    ///
    /// Each attempt is raced against `cancel`, so a cancelled token also
    /// interrupts a request that is already in flight.
    ///
    /// # Errors
    ///
    /// Returns the permanent error as-is, [`StorageError::RetriesExhausted`]
    /// after the last retryable failure, or [`StorageError::Cancelled`].
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        operation: &str,
        mut op: F,
    ) -> Result<T, StorageError>
    where
        F: FnMut(Attempt) -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let retryer = self.retryer.as_ref();
        let governor = &self.governor;

        self.retryer
            .run(cancel, operation, |attempt| {
                let pending = op(attempt);
                async move {
                    let result = tokio::select! {
                        biased;
                        () = cancel.cancelled() => Err(StorageError::cancelled(operation)),
                        result = pending => result,
                    };
                    match &result {
                        Ok(_) => governor.record_success(),
                        Err(error) => {
                            let failure = retryer.classify(error);
                            trace!(attempt = attempt.number, ?failure, "attempt failed");
                            if failure.is_retryable() {
                                governor.record_error();
                            }
                        }
                    }
                    result
                }
            })
            .await
            .map_err(StorageError::from)
    }
}
