//! Caller-level retry.
//!
//! Each attempt is a fresh unit of work, so the precondition is re-checked
//! against current state. Only errors classified retryable are retried; a
//! commit that may have landed never is.

use std::time::Duration;

use tracing::{info, warn};

use crate::coordinator::Coordinator;
use crate::error::TxError;
use crate::store::Store;
use crate::workflow::Workflow;

/// Capped exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Single attempt
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// `retries` extra attempts on top of the first
    pub fn with_retries(retries: u32) -> Self {
        Self {
            max_attempts: retries.saturating_add(1),
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(2u32.pow(exp))
            .min(self.max_delay)
    }
}

/// Run `work` until it succeeds, fails permanently, or attempts run out
pub async fn run_with_retry<S: Store, W: Workflow>(
    coordinator: &Coordinator<S>,
    work: &W,
    policy: RetryPolicy,
) -> Result<W::Output, TxError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match coordinator.run(work).await {
            Ok(output) => {
                if attempt > 1 {
                    info!(workflow = work.name(), attempt, "succeeded after retry");
                }
                return Ok(output);
            }
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    workflow = work.name(),
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying unit of work"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::model::{AlbumId, OrderRequest};
    use crate::store::{Fault, MemoryStore, StatementKind};
    use crate::workflow::PlaceOrder;
    use crate::TxSettings;

    fn order(album: i64, quantity: i64) -> PlaceOrder {
        PlaceOrder::new(OrderRequest::new(AlbumId(album), quantity, None).unwrap())
    }

    #[test]
    fn delays_grow_and_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for(40), Duration::from_millis(350));
    }

    #[tokio::test(start_paused = true)]
    async fn conflict_is_retried_with_fresh_check() {
        let store = MemoryStore::demo();
        store.inject(Fault::FailStatement(
            StatementKind::DecrementInventory,
            StoreError::conflict("40001", "could not serialize access"),
        ));
        let coordinator = Coordinator::new(store.clone(), TxSettings::default());

        let receipt = run_with_retry(&coordinator, &order(1, 3), RetryPolicy::with_retries(2))
            .await
            .unwrap();
        assert_eq!(receipt.remaining, 2);
        assert_eq!(store.begun_with().len(), 2);
        assert_eq!(store.orders().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn violation_is_not_retried() {
        let store = MemoryStore::demo();
        let coordinator = Coordinator::new(store.clone(), TxSettings::default());

        let err = run_with_retry(&coordinator, &order(2, 3), RetryPolicy::with_retries(5))
            .await
            .unwrap_err();
        assert!(matches!(err, TxError::PreconditionViolated { .. }));
        assert_eq!(store.begun_with().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let store = MemoryStore::demo();
        store.set_available(false);
        let coordinator = Coordinator::new(store.clone(), TxSettings::default());

        let err = run_with_retry(&coordinator, &order(1, 1), RetryPolicy::with_retries(2))
            .await
            .unwrap_err();
        assert!(matches!(err, TxError::ConnectionUnavailable { .. }));
    }
}
