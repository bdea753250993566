use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, warn};

use super::repository::{FlaggingDatabase, FlaggingTransaction, RepositoryError};
use super::service::ApplicationServiceError;

/// Bounded exponential backoff applied to serialization conflicts and code collisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, first try included.
    pub max_attempts: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            min_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_millis(5_000),
            jitter: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    /// Deterministic part of the delay before retry number `retry_index` (zero based).
    pub fn base_backoff(&self, retry_index: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry_index.min(16));
        self.min_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
            .max(self.min_backoff)
    }

    pub fn backoff_for(&self, retry_index: u32) -> Duration {
        let base = self.base_backoff(retry_index);
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

/// One body of work executed inside a single serializable transaction.
///
/// The body may run several times; it must not keep side effects outside `tx`.
#[async_trait]
pub trait UnitOfWork<Tx: Send>: Send + Sync {
    type Output: Send;

    async fn run(&self, tx: &mut Tx) -> Result<Self::Output, ApplicationServiceError>;
}

/// Runs units of work under SERIALIZABLE isolation and retries transient conflicts.
pub struct TransactionCoordinator<D> {
    database: Arc<D>,
    policy: RetryPolicy,
}

impl<D> Clone for TransactionCoordinator<D> {
    fn clone(&self) -> Self {
        Self {
            database: Arc::clone(&self.database),
            policy: self.policy,
        }
    }
}

impl<D: FlaggingDatabase> TransactionCoordinator<D> {
    pub fn new(database: Arc<D>, policy: RetryPolicy) -> Self {
        Self { database, policy }
    }

    pub async fn run_in_serializable_transaction<W>(
        &self,
        work: &W,
    ) -> Result<W::Output, ApplicationServiceError>
    where
        W: UnitOfWork<D::Transaction>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let error = match self.attempt(work).await {
                Ok(output) => {
                    if attempt > 1 {
                        debug!(attempt, "serializable transaction succeeded after retry");
                    }
                    return Ok(output);
                }
                Err(error) => error,
            };

            let retryable = match &error {
                ApplicationServiceError::Repository(RepositoryError::SerializationFailure) => true,
                ApplicationServiceError::Repository(err) => err.is_confirmation_code_collision(),
                _ => false,
            };
            if !retryable {
                return Err(error);
            }

            if attempt >= max_attempts {
                warn!(attempts = attempt, error = %error, "serializable transaction retries exhausted");
                return Err(match error {
                    ApplicationServiceError::Repository(err)
                        if err.is_confirmation_code_collision() =>
                    {
                        ApplicationServiceError::ConfirmationCodeExhausted { attempts: attempt }
                    }
                    _ => ApplicationServiceError::RateLimited { attempts: attempt },
                });
            }

            let delay = self.policy.backoff_for(attempt - 1);
            warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying serializable transaction"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn attempt<W>(&self, work: &W) -> Result<W::Output, ApplicationServiceError>
    where
        W: UnitOfWork<D::Transaction>,
    {
        let mut tx = self.database.begin_serializable().await?;
        match work.run(&mut tx).await {
            Ok(output) => {
                tx.commit().await?;
                Ok(output)
            }
            Err(error) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "rollback failed");
                }
                Err(error)
            }
        }
    }
}
