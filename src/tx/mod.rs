//! Transaction submission with nonce management, fee estimation, retries
//! and confirmation tracking

pub mod classify;
pub mod confirmation;
pub mod fee;
pub mod nonce;
pub mod progress;
pub mod retry;
pub mod signer;
pub mod submitter;
pub mod types;

pub use classify::{Classification, ErrorCategory, ErrorClassifier};
pub use confirmation::ConfirmationTracker;
pub use fee::FeeEstimator;
pub use nonce::NonceManager;
pub use progress::{Progress, ProgressCallback, ProgressStage};
pub use retry::{RetryCoordinator, RetryPolicy};
pub use signer::{LocalEvmSigner, TxSigner};
pub use submitter::{SubmitOptions, TransactionSubmitter};
pub use types::{
    Call, ChainFamily, FeeEstimate, PendingTransaction, TransactionRequest, TransactionResult, TxHash,
    TxStatus,
};
