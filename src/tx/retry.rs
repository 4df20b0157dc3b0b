//! Exponential-backoff retry around the dispatch pipeline
//!
//! Only the steps up to and including dispatch are retried. Each attempt is
//! rebuilt from scratch by the caller's closure, so nonce and fee are fresh
//! every time.

use super::classify::{ErrorCategory, ErrorClassifier};
use super::nonce::NonceManager;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Backoff parameters
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.base_retry_delay(),
            max_delay: config.max_retry_delay(),
            backoff_multiplier: config.backoff_multiplier,
        }
    }

    /// `min(base * multiplier^attempt, max)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt as i32);
        let millis = self.base_delay.as_millis() as f64 * factor;
        let max = self.max_delay.as_millis() as f64;
        Duration::from_millis(millis.min(max) as u64)
    }
}

/// Context handed to each attempt
#[derive(Debug, Clone)]
pub struct Attempt {
    /// Zero-based attempt number; equals the retries spent so far
    pub number: u32,
    /// Failure of the previous attempt
    pub previous: Option<EngineError>,
}

pub struct RetryCoordinator {
    chain: String,
    policy: RetryPolicy,
    nonces: Arc<NonceManager>,
}

impl RetryCoordinator {
    pub fn new(chain: &str, policy: RetryPolicy, nonces: Arc<NonceManager>) -> Self {
        Self {
            chain: chain.to_string(),
            policy,
            nonces,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `attempt` until it succeeds, fails terminally, or `max_retries`
    /// retries are spent. Returns the value and the number of retries used.
    pub async fn submit_with_retry<T, F, Fut>(
        &self,
        address: &str,
        max_retries: u32,
        cancel: &CancellationToken,
        mut attempt: F,
    ) -> EngineResult<(T, u32)>
    where
        F: FnMut(Attempt) -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        let mut previous: Option<EngineError> = None;
        let mut number = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled { tx_hash: None });
            }

            let error = match attempt(Attempt {
                number,
                previous: previous.clone(),
            })
            .await
            {
                Ok(value) => {
                    if number > 0 {
                        info!(chain = %self.chain, address, attempt = number + 1, "Submission succeeded after retry");
                    }
                    return Ok((value, number));
                }
                Err(error) => error,
            };

            let classification = ErrorClassifier::classify(&error);
            if !classification.retryable {
                debug!(chain = %self.chain, address, category = %classification.category, "Terminal failure: {}", error);
                return Err(error);
            }

            // Transaction-class failures get one refreshed retry, not more
            let repeated_transaction_error = classification.category == ErrorCategory::Transaction
                && previous
                    .as_ref()
                    .is_some_and(|p| p.category() == ErrorCategory::Transaction);

            if repeated_transaction_error || number >= max_retries {
                warn!(chain = %self.chain, address, attempts = number + 1, "Giving up: {}", error);
                return Err(EngineError::RetriesExhausted {
                    attempts: number + 1,
                    last: Box::new(error),
                });
            }

            if ErrorClassifier::is_nonce_conflict(&error.to_string()) {
                self.nonces.reset(address);
            }

            let delay = self.policy.delay_for(number);
            crate::metrics::record_retry(&self.chain, &classification.category.to_string());
            warn!(
                chain = %self.chain,
                address,
                attempt = number + 1,
                category = %classification.category,
                "Retrying in {:?}: {}",
                delay,
                error
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled { tx_hash: None }),
                _ = tokio::time::sleep(delay) => {}
            }

            previous = Some(error);
            number += 1;
        }
    }
}
