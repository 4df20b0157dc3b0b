//! Transaction submitter: the engine's entry point
//!
//! Orchestrates one logical operation end to end:
//! validate -> [reserve nonce -> estimate fee -> sign -> dispatch] -> track
//!
//! The bracketed part runs under the retry coordinator and is rebuilt from
//! scratch on every attempt. Once a payload is accepted by the node it is
//! never dispatched again; tracking failures surface as errors instead.

use super::classify::ErrorClassifier;
use super::confirmation::ConfirmationTracker;
use super::fee::{FeeEstimator, FEE_BUMP_PERCENT};
use super::nonce::NonceManager;
use super::progress::{ProgressCallback, ProgressReporter, ProgressStage};
use super::retry::{Attempt, RetryCoordinator, RetryPolicy};
use super::signer::TxSigner;
use super::types::{
    Call, ChainFamily, FeeEstimate, PendingTransaction, SignParams, TransactionRequest,
    TransactionResult, TxHash, TxStatus,
};
use crate::chain::{ChainClient, Submission, SubmissionStrategy};
use crate::config::{ChainConfig, EngineConfig};
use crate::error::{EngineError, EngineResult};

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Per-call options
#[derive(Clone)]
pub struct SubmitOptions {
    /// When false, return right after dispatch with status `Pending`
    pub wait_for_confirmation: bool,
    /// Overrides the engine's retry budget
    pub max_retries: Option<u32>,
    /// Overrides the engine's confirmation budget
    pub confirmation_timeout: Option<Duration>,
    pub on_progress: Option<ProgressCallback>,
    pub cancel: CancellationToken,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            wait_for_confirmation: true,
            max_retries: None,
            confirmation_timeout: None,
            on_progress: None,
            cancel: CancellationToken::new(),
        }
    }
}

impl SubmitOptions {
    pub fn no_wait(mut self) -> Self {
        self.wait_for_confirmation = false;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.confirmation_timeout = Some(timeout);
        self
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Output of one successful dispatch attempt
struct Dispatched {
    submission: Submission,
    fee: FeeEstimate,
}

/// Removes an in-flight entry when the operation returns
struct InFlightGuard<'a> {
    map: &'a DashMap<Uuid, PendingTransaction>,
    key: Uuid,
}

impl<'a> InFlightGuard<'a> {
    fn new(map: &'a DashMap<Uuid, PendingTransaction>, pending: &PendingTransaction) -> Self {
        map.insert(pending.operation_id, pending.clone());
        Self {
            map,
            key: pending.operation_id,
        }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.key);
    }
}

/// Submits transactions to one chain
pub struct TransactionSubmitter {
    chain: String,
    family: ChainFamily,
    chain_id: Option<u64>,
    client: Arc<dyn ChainClient>,
    strategy: Arc<dyn SubmissionStrategy>,
    nonces: Arc<NonceManager>,
    fees: FeeEstimator,
    retry: RetryCoordinator,
    tracker: ConfirmationTracker,
    confirmation_timeout: Duration,
    in_flight: DashMap<Uuid, PendingTransaction>,
}

impl TransactionSubmitter {
    pub fn new(
        chain: &str,
        chain_config: &ChainConfig,
        engine: &EngineConfig,
        client: Arc<dyn ChainClient>,
        strategy: Arc<dyn SubmissionStrategy>,
    ) -> Self {
        let nonces = Arc::new(NonceManager::new(chain, client.clone()));

        Self {
            chain: chain.to_string(),
            family: chain_config.family,
            chain_id: chain_config.chain_id,
            fees: FeeEstimator::new(chain, chain_config, engine, client.clone()),
            retry: RetryCoordinator::new(chain, RetryPolicy::from_config(engine), nonces.clone()),
            tracker: ConfirmationTracker::new(chain, chain_config, engine, client.clone()),
            confirmation_timeout: engine.confirmation_timeout(),
            in_flight: DashMap::new(),
            client,
            strategy,
            nonces,
        }
    }

    pub fn chain(&self) -> &str {
        &self.chain
    }

    pub fn family(&self) -> ChainFamily {
        self.family
    }

    pub fn strategy(&self) -> &Arc<dyn SubmissionStrategy> {
        &self.strategy
    }

    pub fn nonces(&self) -> &Arc<NonceManager> {
        &self.nonces
    }

    /// Snapshot of operations currently in flight
    pub fn in_flight(&self) -> Vec<PendingTransaction> {
        self.in_flight.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn pending(&self, operation_id: &Uuid) -> Option<PendingTransaction> {
        self.in_flight.get(operation_id).map(|entry| entry.value().clone())
    }

    /// Fee estimate for a request; falls back instead of failing
    pub async fn estimate(&self, request: &TransactionRequest, address: &str) -> FeeEstimate {
        self.fees.estimate(request, address).await
    }

    /// Compose several calls into one atomic request and submit it.
    ///
    /// Every call must have been built successfully; a single failure rejects
    /// the whole batch before any network interaction.
    pub async fn submit_calls(
        &self,
        address: &str,
        calls: Vec<EngineResult<Call>>,
        signer: &dyn TxSigner,
        options: SubmitOptions,
    ) -> EngineResult<TransactionResult> {
        let calls = calls
            .into_iter()
            .enumerate()
            .map(|(index, call)| {
                call.map_err(|e| EngineError::BatchConstruction {
                    index,
                    message: e.to_string(),
                })
            })
            .collect::<EngineResult<Vec<_>>>()?;

        let request = self.strategy.compose(address, calls)?;
        self.submit(request, signer, options).await
    }

    /// Submit a request and, unless told otherwise, wait for a terminal status
    pub async fn submit(
        &self,
        request: TransactionRequest,
        signer: &dyn TxSigner,
        options: SubmitOptions,
    ) -> EngineResult<TransactionResult> {
        let progress = ProgressReporter::new(options.on_progress.clone());
        progress.report(ProgressStage::Preparing, format!("Preparing {}", request.label()), None);

        match self.execute(&request, signer, &options, &progress).await {
            Ok(result) => {
                match result.status {
                    TxStatus::Confirmed => {
                        crate::metrics::record_tx_confirmed(&self.chain);
                        progress.report(ProgressStage::Done, "Transaction confirmed", Some(&result.tx_hash));
                    }
                    TxStatus::Pending => {
                        progress.report(ProgressStage::Done, "Transaction submitted", Some(&result.tx_hash));
                    }
                    _ => {
                        crate::metrics::record_tx_failed(&self.chain, "execution");
                        progress.report(
                            ProgressStage::Failed,
                            result.failure_reason.clone().unwrap_or_default(),
                            Some(&result.tx_hash),
                        );
                    }
                }
                Ok(result)
            }
            Err(e) => {
                match &e {
                    EngineError::ConfirmationTimeout { .. } => crate::metrics::record_tx_timeout(&self.chain),
                    other => crate::metrics::record_tx_failed(&self.chain, &other.category().to_string()),
                }
                error!(
                    chain = %self.chain,
                    address = request.address(),
                    code = e.code(),
                    "{} failed: {}",
                    request.label(),
                    e
                );
                progress.report(ProgressStage::Failed, e.user_message(), e.tx_hash());
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        request: &TransactionRequest,
        signer: &dyn TxSigner,
        options: &SubmitOptions,
        progress: &ProgressReporter,
    ) -> EngineResult<TransactionResult> {
        if request.family() != self.family {
            return Err(EngineError::Validation(format!(
                "{} request sent to {} chain {}",
                request.family(),
                self.family,
                self.chain
            )));
        }
        request.validate()?;

        let max_retries = options.max_retries.unwrap_or(self.retry.policy().max_retries);
        let (dispatched, retry_count) = self
            .retry
            .submit_with_retry(request.address(), max_retries, &options.cancel, |attempt| {
                self.attempt(request, signer, progress, attempt)
            })
            .await?;

        let tx_hash = dispatched.submission.hash().clone();
        let mut pending = PendingTransaction::new(request.id(), retry_count);
        pending.set_id(tx_hash.clone());
        let _guard = InFlightGuard::new(&self.in_flight, &pending);

        if !options.wait_for_confirmation {
            return Ok(self.result(&pending, tx_hash, dispatched.fee));
        }

        progress.report(ProgressStage::Confirming, "Waiting for confirmation", Some(&tx_hash));
        let started = Instant::now();
        let timeout = options.confirmation_timeout.unwrap_or(self.confirmation_timeout);
        let observe = |pending: &PendingTransaction| {
            self.in_flight.insert(pending.operation_id, pending.clone());
        };

        let tracked = self
            .tracker
            .track(&mut pending, dispatched.submission, timeout, &options.cancel, &observe)
            .await;
        crate::metrics::record_tx_latency(&self.chain, started.elapsed().as_secs_f64());
        tracked?;

        Ok(self.result(&pending, tx_hash, dispatched.fee))
    }

    /// One dispatch attempt with fresh nonce and fee
    async fn attempt(
        &self,
        request: &TransactionRequest,
        signer: &dyn TxSigner,
        progress: &ProgressReporter,
        attempt: Attempt,
    ) -> EngineResult<Dispatched> {
        let address = request.address();

        progress.report(ProgressStage::Estimating, "Estimating fees", None);
        let nonce = self.nonces.reserve(address).await?;
        let mut fee = self.fees.estimate(request, address).await;
        if attempt
            .previous
            .as_ref()
            .is_some_and(|e| ErrorClassifier::is_fee_conflict(&e.to_string()))
        {
            fee = FeeEstimator::bump(&fee, FEE_BUMP_PERCENT);
            warn!(chain = %self.chain, address, nonce, "Raising fee after underpriced rejection");
        }

        let params = SignParams {
            nonce,
            fee: fee.clone(),
            chain_id: self.chain_id,
            era: self.strategy.era(),
        };
        let signed = match signer.sign(request, &params).await {
            Ok(signed) => signed,
            Err(e) => {
                self.nonces.release(address, nonce);
                return Err(e);
            }
        };

        progress.report(ProgressStage::Dispatching, "Submitting transaction", Some(&signed.hash));
        let submission = match self.client.submit(&signed).await {
            Ok(submission) => submission,
            Err(e) => {
                self.nonces.release(address, nonce);
                return Err(e);
            }
        };

        self.nonces.commit(address, nonce);
        crate::metrics::record_tx_submitted(&self.chain);
        info!(
            chain = %self.chain,
            address,
            nonce,
            attempt = attempt.number + 1,
            tx_hash = %submission.hash(),
            "Dispatched {}",
            request.label()
        );

        Ok(Dispatched { submission, fee })
    }

    fn result(&self, pending: &PendingTransaction, tx_hash: TxHash, fee: FeeEstimate) -> TransactionResult {
        TransactionResult {
            success: pending.status == TxStatus::Confirmed,
            status: pending.status,
            tx_hash,
            block_number: pending.block_number,
            block_hash: pending.block_hash,
            events: pending.events.clone(),
            fee,
            retry_count: pending.retry_count,
            failure_reason: pending.error.clone(),
            timestamp: Utc::now(),
        }
    }
}
