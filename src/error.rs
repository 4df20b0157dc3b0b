//! Error types for the transaction engine

use crate::tx::classify::{ErrorCategory, ErrorClassifier};
use crate::tx::types::TxHash;

use ethers::types::H256;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the engine
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Batch rejected: sub-call {index} failed to build: {message}")]
    BatchConstruction { index: usize, message: String },

    #[error("RPC error on chain {chain}: {message}")]
    Rpc { chain: String, message: String },

    #[error("Dispatch rejected by {chain}: {message}")]
    Dispatch { chain: String, message: String },

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Fee estimation error: {0}")]
    FeeEstimation(String),

    #[error("Transaction {tx_hash} rejected by the pool: {reason}")]
    Rejected { tx_hash: TxHash, reason: String },

    #[error("Transaction {tx_hash} not found in recent blocks ({searched} searched) - may have been dropped")]
    NotFound { tx_hash: TxHash, searched: u64 },

    #[error("Timed out after {waited:?} waiting for confirmation of {tx_hash}; it may still confirm")]
    ConfirmationTimeout {
        tx_hash: TxHash,
        block_hash: Option<H256>,
        waited: Duration,
    },

    #[error("Operation cancelled")]
    Cancelled { tx_hash: Option<TxHash> },

    #[error("Giving up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<EngineError>,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn rpc(chain: &str, message: impl ToString) -> Self {
        EngineError::Rpc {
            chain: chain.to_string(),
            message: message.to_string(),
        }
    }

    pub fn dispatch(chain: &str, message: impl ToString) -> Self {
        EngineError::Dispatch {
            chain: chain.to_string(),
            message: message.to_string(),
        }
    }

    /// Category assigned by the classifier
    pub fn category(&self) -> ErrorCategory {
        ErrorClassifier::classify(self).category
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        ErrorClassifier::classify(self).retryable
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Config(_) => "config",
            EngineError::Validation(_) => "validation",
            EngineError::BatchConstruction { .. } => "batch_construction",
            EngineError::Rpc { .. } => "rpc",
            EngineError::Dispatch { .. } => "dispatch",
            EngineError::Signing(_) => "signing",
            EngineError::FeeEstimation(_) => "fee_estimation",
            EngineError::Rejected { .. } => "rejected",
            EngineError::NotFound { .. } => "not_found",
            EngineError::ConfirmationTimeout { .. } => "confirmation_timeout",
            EngineError::Cancelled { .. } => "cancelled",
            EngineError::RetriesExhausted { .. } => "retries_exhausted",
            EngineError::Internal(_) => "internal",
        }
    }

    /// Message suitable for showing to an end user, as opposed to `Display`
    /// which carries the diagnostic detail.
    pub fn user_message(&self) -> String {
        match self {
            EngineError::RetriesExhausted { attempts, last } => format!(
                "{} (gave up after {} attempts)",
                last.user_message(),
                attempts
            ),
            EngineError::ConfirmationTimeout { .. } => {
                "The transaction was sent but not confirmed in time. It may still confirm; check its status before retrying.".to_string()
            }
            EngineError::NotFound { .. } => {
                "The transaction was not found on chain and may have been dropped.".to_string()
            }
            EngineError::Cancelled { .. } => "The operation was cancelled.".to_string(),
            _ => match self.category() {
                ErrorCategory::Network => {
                    "The network is unreachable right now. Please try again later.".to_string()
                }
                ErrorCategory::Transaction => {
                    "The transaction could not be accepted. Please try again.".to_string()
                }
                ErrorCategory::User => ErrorClassifier::user_hint(&self.to_string()),
                ErrorCategory::Validation => "The request is invalid.".to_string(),
                ErrorCategory::Timeout | ErrorCategory::Unknown => {
                    "The transaction failed.".to_string()
                }
            },
        }
    }

    /// Transaction id, when the failure happened after signing
    pub fn tx_hash(&self) -> Option<&TxHash> {
        match self {
            EngineError::Rejected { tx_hash, .. }
            | EngineError::NotFound { tx_hash, .. }
            | EngineError::ConfirmationTimeout { tx_hash, .. } => Some(tx_hash),
            EngineError::Cancelled { tx_hash } => tx_hash.as_ref(),
            EngineError::RetriesExhausted { last, .. } => last.tx_hash(),
            _ => None,
        }
    }

    /// Block context, when the transaction was seen in a block
    pub fn block_hash(&self) -> Option<H256> {
        match self {
            EngineError::ConfirmationTimeout { block_hash, .. } => *block_hash,
            _ => None,
        }
    }
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
