//! Error classification for retry decisions
//!
//! Chain clients rarely return structured error codes, so classification is
//! pattern based over the failure message. Only messages matching a known
//! retryable pattern are retried; anything unrecognised is terminal.

use crate::error::EngineError;

use lazy_static::lazy_static;
use regex::RegexSet;
use serde::Serialize;
use std::fmt;

/// Error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Connection or transport trouble talking to the node
    Network,
    /// Transient nonce / fee rejection
    Transaction,
    /// Caller-side problem: funds, signer, revert, duplicate resource
    User,
    /// Malformed request, caught before any network call
    Validation,
    /// Dispatch succeeded but confirmation did not arrive within budget
    Timeout,
    /// Unmatched message
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Transaction => "transaction",
            ErrorCategory::User => "user",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub retryable: bool,
    pub category: ErrorCategory,
}

impl Classification {
    const fn terminal(category: ErrorCategory) -> Self {
        Self {
            retryable: false,
            category,
        }
    }

    const fn retryable(category: ErrorCategory) -> Self {
        Self {
            retryable: true,
            category,
        }
    }
}

lazy_static! {
    static ref USER_PATTERNS: RegexSet = RegexSet::new([
        r"insufficient (funds|balance)",
        r"inability to pay some fees",
        r"balance too low",
        r"(bad|invalid) signature",
        r"unauthori[sz]ed",
        r"not (the )?owner",
        r"execution reverted",
        r"\breverted?\b",
        r"already (exists|registered|claimed|minted)",
        r"duplicate",
    ])
    .expect("valid user patterns");

    static ref VALIDATION_PATTERNS: RegexSet = RegexSet::new([
        r"invalid address",
        r"malformed",
        r"invalid (params|argument|input)",
        r"could not decode",
        r"failed to decode",
    ])
    .expect("valid validation patterns");

    static ref NETWORK_PATTERNS: RegexSet = RegexSet::new([
        r"network",
        r"connection",
        r"timed? ?out",
        r"econnrefused",
        r"econnreset",
        r"socket hang up",
        r"disconnected",
        r"rate limit",
        r"too many requests",
        r"\b(429|502|503|504)\b",
    ])
    .expect("valid network patterns");

    static ref TRANSACTION_PATTERNS: RegexSet = RegexSet::new([
        r"nonce too (low|high)",
        r"nonce has already been used",
        r"(replacement )?transaction underpriced",
        r"fee too low",
        r"max fee per gas less than block base fee",
        r"priority is too low",
        r"transaction is outdated",
        r"already known",
        r"temporarily banned",
    ])
    .expect("valid transaction patterns");
}

/// Maps raw failures into the retry taxonomy
pub struct ErrorClassifier;

impl ErrorClassifier {
    /// Classify an engine error
    pub fn classify(error: &EngineError) -> Classification {
        match error {
            EngineError::Config(_)
            | EngineError::Validation(_)
            | EngineError::BatchConstruction { .. } => {
                Classification::terminal(ErrorCategory::Validation)
            }
            EngineError::ConfirmationTimeout { .. } => {
                Classification::terminal(ErrorCategory::Timeout)
            }
            EngineError::NotFound { .. } => Classification::terminal(ErrorCategory::Transaction),
            EngineError::Cancelled { .. } => Classification::terminal(ErrorCategory::Unknown),
            EngineError::RetriesExhausted { last, .. } => {
                Classification::terminal(Self::classify(last).category)
            }
            EngineError::Signing(message) => {
                let classification = Self::classify_message(message);
                if classification.category == ErrorCategory::Unknown {
                    Classification::terminal(ErrorCategory::User)
                } else {
                    classification
                }
            }
            EngineError::Rejected { reason, .. } => {
                Classification::terminal(Self::classify_message(reason).category)
            }
            EngineError::Rpc { message, .. }
            | EngineError::Dispatch { message, .. }
            | EngineError::FeeEstimation(message)
            | EngineError::Internal(message) => Self::classify_message(message),
        }
    }

    /// Classify a raw failure message.
    ///
    /// User and validation patterns win over retryable ones so that e.g.
    /// "insufficient funds (request timed out)" is never retried.
    pub fn classify_message(message: &str) -> Classification {
        let message = message.to_lowercase();

        if USER_PATTERNS.is_match(&message) {
            return Classification::terminal(ErrorCategory::User);
        }
        if VALIDATION_PATTERNS.is_match(&message) {
            return Classification::terminal(ErrorCategory::Validation);
        }
        if NETWORK_PATTERNS.is_match(&message) {
            return Classification::retryable(ErrorCategory::Network);
        }
        if TRANSACTION_PATTERNS.is_match(&message) {
            return Classification::retryable(ErrorCategory::Transaction);
        }

        Classification::terminal(ErrorCategory::Unknown)
    }

    /// True when the message indicates the nonce used was stale
    pub fn is_nonce_conflict(message: &str) -> bool {
        let message = message.to_lowercase();
        message.contains("nonce")
            || message.contains("outdated")
            || message.contains("priority is too low")
            || message.contains("already known")
    }

    /// True when the node refused the fee or tip as too low
    pub fn is_fee_conflict(message: &str) -> bool {
        let message = message.to_lowercase();
        message.contains("underpriced")
            || message.contains("fee too low")
            || message.contains("less than block base fee")
            || message.contains("priority is too low")
    }

    /// User-facing text for a User-category failure
    pub fn user_hint(message: &str) -> String {
        let message = message.to_lowercase();
        let hint = if message.contains("insufficient")
            || message.contains("inability to pay")
            || message.contains("balance too low")
        {
            "Insufficient balance to pay for this transaction."
        } else if message.contains("signature") || message.contains("unauthori") || message.contains("owner") {
            "The signing account is not authorized for this operation."
        } else if message.contains("revert") {
            "The transaction was reverted by the chain."
        } else if message.contains("already") || message.contains("duplicate") {
            "This identifier or token already exists."
        } else {
            "The transaction was refused."
        };
        hint.to_string()
    }
}
