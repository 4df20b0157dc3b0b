//! Identity transaction engine
//!
//! Submits DID and SBT issuance transactions to substrate and EVM chains and
//! tracks them to finality: nonce reservation, fee estimation, classified
//! retries, confirmation tracking and event extraction.

pub mod chain;
pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod tx;

#[cfg(test)]
mod testing;

pub use error::{EngineError, EngineResult};
