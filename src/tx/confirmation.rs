//! Confirmation tracking for dispatched transactions
//!
//! Drives a [`PendingTransaction`] from `Pending` to a terminal status using
//! two sources at once: the node's push stream (when the submission was
//! watched) and periodic polling. Polling walks a bounded window of recent
//! blocks back from the best head, so inclusion is seen before finality, and
//! settles once the finality head has caught up with the including block.
//!
//! Finality models:
//! - Substrate: the finalized head is final, no extra confirmations
//! - EVM: the latest head plus a confirmation-count threshold
//!
//! Either way the block is re-verified by number before settling, and a
//! reorg sends the search back to the best head.

use crate::chain::{BlockId, ChainBlock, ChainClient, StatusStream, StatusUpdate, Submission};
use crate::config::{ChainConfig, EngineConfig};
use crate::error::{EngineError, EngineResult};
use crate::events::EventExtractor;
use crate::tx::types::{ChainFamily, PendingTransaction, TxHash};

use ethers::types::H256;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Callback fired whenever a tracked transaction changes status
pub type StatusObserver<'a> = &'a (dyn Fn(&PendingTransaction) + Send + Sync);

/// Consecutive event-log read failures tolerated on a final block before
/// confirming without events
const MAX_EVENT_READ_FAILURES: u32 = 3;

/// Scan progress kept between polls
#[derive(Debug, Default)]
struct SearchState {
    /// Block the transaction was seen in, awaiting finality
    included: Option<ChainBlock>,
    /// Best head of the last scan without a hit; walks stop there
    scanned_tip: Option<H256>,
    /// Blocks examined so far
    searched: u64,
    /// Consecutive polls with the transaction unknown to the node
    absent_polls: u32,
    /// Consecutive failed event-log reads on a final block
    event_failures: u32,
}

enum Wake {
    Update(Option<EngineResult<StatusUpdate>>),
    Tick,
}

enum Outcome {
    Finished(EngineResult<()>),
    TimedOut,
    Cancelled,
}

/// Tracks dispatched transactions through to finality on one chain
pub struct ConfirmationTracker {
    chain: String,
    family: ChainFamily,
    client: Arc<dyn ChainClient>,
    /// Blocks required on top of the including block
    required_confirmations: u64,
    poll_interval: Duration,
    search_window: u64,
    drop_grace_polls: u32,
}

impl ConfirmationTracker {
    pub fn new(
        chain: &str,
        chain_config: &ChainConfig,
        engine: &EngineConfig,
        client: Arc<dyn ChainClient>,
    ) -> Self {
        let required_confirmations = match chain_config.family {
            ChainFamily::Evm => chain_config.required_confirmations,
            ChainFamily::Substrate => 0,
        };

        Self {
            chain: chain.to_string(),
            family: chain_config.family,
            client,
            required_confirmations,
            poll_interval: engine.poll_interval(),
            search_window: engine.search_window,
            drop_grace_polls: engine.drop_grace_polls.max(1),
        }
    }

    /// Track a submission until it is terminal, the budget elapses or the
    /// caller cancels. Dropping out early releases the status stream and
    /// stops all polling.
    ///
    /// `Ok(())` means `pending` reached `Confirmed`, or `Failed` with block
    /// context (included but failed execution). Every other outcome is an
    /// error, with `pending` updated to match.
    pub async fn track(
        &self,
        pending: &mut PendingTransaction,
        submission: Submission,
        timeout: Duration,
        cancel: &CancellationToken,
        observe: StatusObserver<'_>,
    ) -> EngineResult<()> {
        let tx_hash = submission.hash().clone();
        pending.set_id(tx_hash.clone());

        let outcome = {
            let run = self.run(pending, submission, observe);
            tokio::select! {
                _ = cancel.cancelled() => Outcome::Cancelled,
                finished = tokio::time::timeout(timeout, run) => match finished {
                    Ok(result) => Outcome::Finished(result),
                    Err(_) => Outcome::TimedOut,
                },
            }
        };

        match outcome {
            Outcome::Finished(result) => result,
            Outcome::TimedOut => {
                warn!(chain = %self.chain, tx_hash = %tx_hash, "Confirmation timed out after {:?}", timeout);
                pending.time_out(format!("not confirmed within {:?}", timeout));
                Err(EngineError::ConfirmationTimeout {
                    tx_hash,
                    block_hash: pending.block_hash,
                    waited: timeout,
                })
            }
            Outcome::Cancelled => {
                info!(chain = %self.chain, tx_hash = %tx_hash, "Confirmation tracking cancelled");
                Err(EngineError::Cancelled {
                    tx_hash: Some(tx_hash),
                })
            }
        }
    }

    async fn run(
        &self,
        pending: &mut PendingTransaction,
        submission: Submission,
        observe: StatusObserver<'_>,
    ) -> EngineResult<()> {
        let (tx_hash, mut updates): (TxHash, Option<StatusStream>) = match submission {
            Submission::Watched { hash, updates } => (hash, Some(updates)),
            Submission::Submitted { hash } => (hash, None),
        };

        let mut state = SearchState::default();
        let mut ticker = tokio::time::interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let wake = {
                let next_update = async {
                    match updates.as_mut() {
                        Some(stream) => stream.next().await,
                        None => std::future::pending().await,
                    }
                };
                tokio::select! {
                    update = next_update => Wake::Update(update),
                    _ = ticker.tick() => Wake::Tick,
                }
            };

            let resolved = match wake {
                Wake::Update(Some(Ok(update))) => {
                    self.on_update(pending, &tx_hash, update, &mut state, &mut updates, observe)
                        .await?
                }
                Wake::Update(Some(Err(e))) => {
                    warn!(chain = %self.chain, tx_hash = %tx_hash, "Status stream failed, falling back to polling: {}", e);
                    updates = None;
                    false
                }
                Wake::Update(None) => {
                    updates = None;
                    self.on_stream_lost(pending, &tx_hash, &mut state, observe).await?
                }
                Wake::Tick => {
                    self.poll(pending, &tx_hash, &mut state, updates.is_some(), observe)
                        .await?
                }
            };

            if resolved {
                return Ok(());
            }
        }
    }

    async fn on_update(
        &self,
        pending: &mut PendingTransaction,
        tx_hash: &TxHash,
        update: StatusUpdate,
        state: &mut SearchState,
        updates: &mut Option<StatusStream>,
        observe: StatusObserver<'_>,
    ) -> EngineResult<bool> {
        debug!(chain = %self.chain, tx_hash = %tx_hash, "Status update: {:?}", update);

        match update {
            StatusUpdate::Ready | StatusUpdate::Broadcast => Ok(false),
            StatusUpdate::InBlock(block_hash) => {
                if pending.mark_in_block(block_hash) {
                    observe(pending);
                }
                match self.client.block(BlockId::Hash(block_hash)).await {
                    Ok(Some(block)) => state.included = Some(block),
                    Ok(None) => debug!("Block {:?} not yet available", block_hash),
                    Err(e) => warn!(chain = %self.chain, "Failed to fetch block {:?}: {}", block_hash, e),
                }
                Ok(false)
            }
            StatusUpdate::Retracted(block_hash) => {
                if state.included.as_ref().is_some_and(|b| b.hash == block_hash) {
                    warn!(chain = %self.chain, tx_hash = %tx_hash, "Including block {:?} retracted", block_hash);
                    state.included = None;
                    state.scanned_tip = None;
                }
                if pending.retract(block_hash) {
                    observe(pending);
                }
                Ok(false)
            }
            StatusUpdate::Finalized(block_hash) => match self.client.block(BlockId::Hash(block_hash)).await {
                Ok(Some(block)) => {
                    state.included = Some(block.clone());
                    self.settle(pending, tx_hash, &block, state).await
                }
                Ok(None) => Ok(false),
                Err(e) => {
                    // The poll path retries through `state.included`
                    warn!(chain = %self.chain, "Failed to fetch finalized block {:?}: {}", block_hash, e);
                    Ok(false)
                }
            },
            StatusUpdate::Invalid(reason) => {
                warn!(chain = %self.chain, tx_hash = %tx_hash, "Transaction rejected: {}", reason);
                pending.fail(reason.clone());
                Err(EngineError::Rejected {
                    tx_hash: tx_hash.clone(),
                    reason,
                })
            }
            StatusUpdate::Usurped(_) | StatusUpdate::Dropped => {
                *updates = None;
                self.on_stream_lost(pending, tx_hash, state, observe).await
            }
        }
    }

    /// The stream ended without a terminal signal. Unless the transaction
    /// was already seen in a block, one fresh search decides its fate.
    async fn on_stream_lost(
        &self,
        pending: &mut PendingTransaction,
        tx_hash: &TxHash,
        state: &mut SearchState,
        observe: StatusObserver<'_>,
    ) -> EngineResult<bool> {
        if state.included.is_some() {
            debug!(chain = %self.chain, tx_hash = %tx_hash, "Status stream ended after inclusion, polling for finality");
            return Ok(false);
        }

        let best = self.client.best_head().await?;
        let finalized = self.client.finalized_head().await?;
        let (found, examined) = self.search(&best, tx_hash, None).await?;
        state.searched += examined;

        match found {
            Some(block) => self.on_found(pending, tx_hash, block, &finalized, state, observe).await,
            None => Err(self.not_found(pending, tx_hash, state.searched)),
        }
    }

    async fn poll(
        &self,
        pending: &mut PendingTransaction,
        tx_hash: &TxHash,
        state: &mut SearchState,
        stream_active: bool,
        observe: StatusObserver<'_>,
    ) -> EngineResult<bool> {
        let (best, finalized) = match tokio::try_join!(self.client.best_head(), self.client.finalized_head()) {
            Ok(heads) => heads,
            Err(e) => {
                warn!(chain = %self.chain, tx_hash = %tx_hash, "Failed to fetch head: {}", e);
                return Ok(false);
            }
        };
        crate::metrics::record_finalized_head(&self.chain, finalized.number);

        if let Some(block) = state.included.clone() {
            if !self.is_final(&finalized, &block) {
                debug!(
                    chain = %self.chain,
                    tx_hash = %tx_hash,
                    "Block {} awaiting finality ({} of {} confirmations)",
                    block.number,
                    finalized.number.saturating_sub(block.number),
                    self.required_confirmations
                );
                return Ok(false);
            }

            match self.client.block(BlockId::Number(block.number)).await {
                Ok(Some(canonical)) if canonical.hash == block.hash => {
                    return self.settle(pending, tx_hash, &canonical, state).await;
                }
                Ok(_) => {
                    warn!(chain = %self.chain, tx_hash = %tx_hash, "Block {} reorganized, searching again", block.number);
                    state.included = None;
                    state.scanned_tip = None;
                    if pending.retract(block.hash) {
                        observe(pending);
                    }
                }
                Err(e) => {
                    warn!(chain = %self.chain, "Failed to verify block {}: {}", block.number, e);
                    return Ok(false);
                }
            }
        }

        let (found, examined) = match self.search(&best, tx_hash, state.scanned_tip).await {
            Ok(result) => result,
            Err(e) => {
                warn!(chain = %self.chain, tx_hash = %tx_hash, "Block search failed: {}", e);
                return Ok(false);
            }
        };
        state.searched += examined;

        if let Some(block) = found {
            state.absent_polls = 0;
            return self.on_found(pending, tx_hash, block, &finalized, state, observe).await;
        }
        state.scanned_tip = Some(best.hash);

        // A live stream reports drops itself
        if stream_active {
            return Ok(false);
        }

        match self.client.is_known(tx_hash).await {
            Ok(true) => {
                state.absent_polls = 0;
                Ok(false)
            }
            Ok(false) => {
                state.absent_polls += 1;
                debug!(
                    chain = %self.chain,
                    tx_hash = %tx_hash,
                    "Unknown to the node and not in recent blocks ({} of {} polls)",
                    state.absent_polls,
                    self.drop_grace_polls
                );
                if state.absent_polls >= self.drop_grace_polls {
                    Err(self.not_found(pending, tx_hash, state.searched))
                } else {
                    Ok(false)
                }
            }
            Err(e) => {
                warn!(chain = %self.chain, "Failed to look up transaction: {}", e);
                Ok(false)
            }
        }
    }

    /// Record a search hit: settle right away when already final, otherwise
    /// hold the block until the finality head reaches it
    async fn on_found(
        &self,
        pending: &mut PendingTransaction,
        tx_hash: &TxHash,
        block: ChainBlock,
        finalized: &ChainBlock,
        state: &mut SearchState,
        observe: StatusObserver<'_>,
    ) -> EngineResult<bool> {
        if pending.mark_in_block(block.hash) {
            observe(pending);
        }
        if self.is_final(finalized, &block) {
            return self.settle(pending, tx_hash, &block, state).await;
        }
        state.included = Some(block);
        Ok(false)
    }

    fn is_final(&self, head: &ChainBlock, block: &ChainBlock) -> bool {
        head.number >= block.number + self.required_confirmations
    }

    /// Walk back from `head` through at most `search_window` blocks, stopping
    /// early at the tip of the previous scan. Returns the hit and the blocks
    /// examined.
    async fn search(
        &self,
        head: &ChainBlock,
        tx_hash: &TxHash,
        scanned_tip: Option<H256>,
    ) -> EngineResult<(Option<ChainBlock>, u64)> {
        let mut block = head.clone();
        let mut examined = 0u64;

        loop {
            if scanned_tip == Some(block.hash) {
                break;
            }
            examined += 1;
            if block.contains(tx_hash) {
                debug!(chain = %self.chain, tx_hash = %tx_hash, "Found in block {}", block.number);
                return Ok((Some(block), examined));
            }
            if examined >= self.search_window || block.number == 0 {
                break;
            }
            match self.client.block(BlockId::Hash(block.parent_hash)).await? {
                Some(parent) => block = parent,
                None => break,
            }
        }

        Ok((None, examined))
    }

    /// Resolve from the including block's execution log. A log that stays
    /// unreadable does not hold back a final block forever: after
    /// `MAX_EVENT_READ_FAILURES` attempts the transaction confirms with no
    /// events.
    async fn settle(
        &self,
        pending: &mut PendingTransaction,
        tx_hash: &TxHash,
        block: &ChainBlock,
        state: &mut SearchState,
    ) -> EngineResult<bool> {
        let log = match self.client.block_events(block, tx_hash).await {
            Ok(log) => log,
            Err(e) => {
                state.event_failures += 1;
                if state.event_failures < MAX_EVENT_READ_FAILURES {
                    warn!(chain = %self.chain, "Failed to read events of block {}: {}", block.number, e);
                    return Ok(false);
                }
                warn!(
                    chain = %self.chain,
                    tx_hash = %tx_hash,
                    "Events of block {} unreadable after {} attempts, confirming without events: {}",
                    block.number,
                    state.event_failures,
                    e
                );
                pending.confirm(block.number, block.hash, Vec::new());
                return Ok(true);
            }
        };
        state.event_failures = 0;
        let events = EventExtractor::extract(block, &log, tx_hash);

        match EventExtractor::failure_reason(&events) {
            Some(reason) => {
                warn!(
                    chain = %self.chain,
                    tx_hash = %tx_hash,
                    "Included in block {} but failed: {}",
                    block.number,
                    reason
                );
                pending.fail_in_block(block.number, block.hash, events, reason);
            }
            None => {
                info!(
                    chain = %self.chain,
                    tx_hash = %tx_hash,
                    "Confirmed in block {} ({} events)",
                    block.number,
                    events.len()
                );
                pending.confirm(block.number, block.hash, events);
            }
        }
        Ok(true)
    }

    fn not_found(&self, pending: &mut PendingTransaction, tx_hash: &TxHash, searched: u64) -> EngineError {
        let error = EngineError::NotFound {
            tx_hash: tx_hash.clone(),
            searched,
        };
        warn!(chain = %self.chain, family = %self.family, "{}", error);
        pending.fail(error.to_string());
        error
    }
}
