//! Chain module - the narrow client capability the engine depends on
//!
//! This module provides:
//! - The `ChainClient` trait: nonce, fee quote, submit, block lookup,
//!   finalized head, pending pool and execution log
//! - EVM and substrate adapters implementing it
//! - Runtime variant detection and per-chain submission strategies
//! - `ChainManager`, which connects every configured chain once at startup

pub mod evm;
pub mod runtime;
pub mod scale;
pub mod substrate;

pub use evm::EvmClient;
pub use runtime::{RuntimeVariant, SubmissionStrategy};
pub use substrate::{EventDecoder, SubstrateClient};

use crate::config::{ChainConfig, EngineConfig, Settings};
use crate::error::{EngineError, EngineResult};
use crate::tx::types::{ChainFamily, FeeFields, SignedPayload, TransactionRequest, TxHash};
use crate::tx::TransactionSubmitter;

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::{H256, U256};
use futures::stream::BoxStream;
use std::sync::Arc;
use tracing::{error, info};

/// Block selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockId {
    Number(u64),
    Hash(H256),
}

/// A block reduced to what the engine needs
#[derive(Debug, Clone, PartialEq)]
pub struct ChainBlock {
    pub number: u64,
    pub hash: H256,
    pub parent_hash: H256,
    /// Identifying hashes of the included transactions, in block order
    pub transactions: Vec<TxHash>,
}

impl ChainBlock {
    /// Position of a transaction within the block
    pub fn position_of(&self, tx_hash: &TxHash) -> Option<u32> {
        self.transactions
            .iter()
            .position(|candidate| candidate == tx_hash)
            .map(|position| position as u32)
    }

    pub fn contains(&self, tx_hash: &TxHash) -> bool {
        self.position_of(tx_hash).is_some()
    }
}

/// One entry of a block's execution log, as reported by an adapter
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    /// Position in the block's log
    pub index: u32,
    /// Position of the emitting transaction, `None` for block-level events
    pub tx_index: Option<u32>,
    pub section: String,
    pub method: String,
    pub payload: serde_json::Value,
}

/// Unpadded fee quote from the node
#[derive(Debug, Clone, PartialEq)]
pub struct FeeQuote {
    pub compute_limit: U256,
    pub fields: FeeFields,
}

/// Push status reported for a watched submission
#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate {
    Ready,
    Broadcast,
    InBlock(H256),
    Retracted(H256),
    Finalized(H256),
    Usurped(TxHash),
    Dropped,
    Invalid(String),
}

pub type StatusStream = BoxStream<'static, EngineResult<StatusUpdate>>;

/// Result of handing a signed payload to the node
pub enum Submission {
    /// The node pushes status updates until finality
    Watched { hash: TxHash, updates: StatusStream },
    /// Fire-and-forget; confirmation must be polled
    Submitted { hash: TxHash },
}

impl Submission {
    pub fn hash(&self) -> &TxHash {
        match self {
            Submission::Watched { hash, .. } | Submission::Submitted { hash } => hash,
        }
    }
}

impl std::fmt::Debug for Submission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Submission::Watched { hash, .. } => f.debug_struct("Watched").field("hash", hash).finish(),
            Submission::Submitted { hash } => f.debug_struct("Submitted").field("hash", hash).finish(),
        }
    }
}

/// Capability interface over a chain node
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Next usable nonce, counting transactions still in the pool
    async fn next_nonce(&self, address: &str) -> EngineResult<u64>;

    /// Raw fee quote for an unsigned request
    async fn estimate_fee(&self, request: &TransactionRequest) -> EngineResult<FeeQuote>;

    /// Hand a signed payload to the node
    async fn submit(&self, payload: &SignedPayload) -> EngineResult<Submission>;

    async fn block(&self, id: BlockId) -> EngineResult<Option<ChainBlock>>;

    /// Tip of the best chain; inclusion is detected here, before finality
    async fn best_head(&self) -> EngineResult<ChainBlock>;

    /// Head used for finality decisions: the finalized head on substrate,
    /// the latest head on EVM chains (confirmation counting)
    async fn finalized_head(&self) -> EngineResult<ChainBlock>;

    /// Hashes currently waiting in the transaction pool
    async fn pending_transactions(&self) -> EngineResult<Vec<TxHash>>;

    /// Whether the node still knows the transaction, pooled or mined.
    /// `false` means it was dropped or never arrived.
    async fn is_known(&self, tx_hash: &TxHash) -> EngineResult<bool> {
        Ok(self.pending_transactions().await?.contains(tx_hash))
    }

    /// Execution log of a block. Adapters unable to read the whole log may
    /// return only the entries of `tx_hash`.
    async fn block_events(&self, block: &ChainBlock, tx_hash: &TxHash) -> EngineResult<Vec<RawEvent>>;
}

/// Connect to a chain: build its adapter, probe the runtime once, and return
/// the client together with the submission strategy for that runtime.
pub async fn connect(
    name: &str,
    config: &ChainConfig,
) -> EngineResult<(Arc<dyn ChainClient>, Arc<dyn SubmissionStrategy>)> {
    match config.family {
        ChainFamily::Evm => {
            let client = EvmClient::new(name, config.clone())?;
            Ok((Arc::new(client), Arc::new(runtime::EvmStrategy)))
        }
        ChainFamily::Substrate => {
            let client = SubstrateClient::new(name, config.clone(), None)?;
            let spec_version = client.runtime_spec_version().await?;
            let strategy = runtime::substrate_strategy(config, spec_version);
            info!(
                "Chain {} runtime spec {} detected as {:?}",
                name,
                spec_version,
                strategy.variant()
            );
            Ok((Arc::new(client), Arc::new(strategy)))
        }
    }
}

/// A connected chain
pub struct ChainHandle {
    pub name: String,
    pub client: Arc<dyn ChainClient>,
    pub submitter: Arc<TransactionSubmitter>,
}

/// Manages connections to all configured chains
pub struct ChainManager {
    chains: DashMap<String, Arc<ChainHandle>>,
}

impl ChainManager {
    /// Connect every enabled chain
    pub async fn connect(settings: &Settings) -> EngineResult<Self> {
        let chains = DashMap::new();

        for (name, chain_config) in settings.enabled_chains() {
            info!("Initializing chain {} ({})", name, chain_config.family);

            let (client, strategy) = connect(name, chain_config).await?;
            let handle = Self::handle(name, chain_config, &settings.engine, client, strategy);
            chains.insert(name.clone(), Arc::new(handle));

            info!("Chain {} initialized successfully", name);
        }

        Ok(Self { chains })
    }

    fn handle(
        name: &str,
        chain_config: &ChainConfig,
        engine: &EngineConfig,
        client: Arc<dyn ChainClient>,
        strategy: Arc<dyn SubmissionStrategy>,
    ) -> ChainHandle {
        let submitter = TransactionSubmitter::new(name, chain_config, engine, client.clone(), strategy);
        ChainHandle {
            name: name.to_string(),
            client,
            submitter: Arc::new(submitter),
        }
    }

    /// Submitter for a named chain
    pub fn submitter(&self, name: &str) -> EngineResult<Arc<TransactionSubmitter>> {
        self.chains
            .get(name)
            .map(|handle| handle.submitter.clone())
            .ok_or_else(|| EngineError::Config(format!("Chain {} not configured", name)))
    }

    /// Get all connected chain names
    pub fn connected_chains(&self) -> Vec<String> {
        self.chains.iter().map(|e| e.key().clone()).collect()
    }

    /// Health check for all chains: reachable and reporting a head
    pub async fn health_check(&self) -> Vec<(String, bool)> {
        let handles: Vec<Arc<ChainHandle>> = self.chains.iter().map(|e| e.value().clone()).collect();
        let mut results = Vec::new();

        for handle in handles {
            let healthy = match handle.client.finalized_head().await {
                Ok(head) => {
                    crate::metrics::record_finalized_head(&handle.name, head.number);
                    true
                }
                Err(e) => {
                    error!("Health check failed for chain {}: {}", handle.name, e);
                    false
                }
            };
            crate::metrics::record_chain_health(&handle.name, healthy);
            results.push((handle.name.clone(), healthy));
        }

        results
    }
}
