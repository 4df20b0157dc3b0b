//! EVM chain client with multi-RPC support and automatic failover

use super::{BlockId, ChainBlock, ChainClient, FeeQuote, RawEvent, Submission};
use crate::config::{ChainConfig, GasPriceStrategy};
use crate::error::{EngineError, EngineResult};
use crate::events::{EXTRINSIC_FAILED, EXTRINSIC_SUCCESS, SYSTEM_SECTION};
use crate::tx::types::{CallPayload, FeeFields, SignedPayload, TransactionRequest, TxHash};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, JsonRpcClient, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use serde_json::json;
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Default priority fee: 2 gwei
const DEFAULT_PRIORITY_FEE: u64 = 2_000_000_000;

/// Multi-provider EVM client
pub struct EvmClient<P = Http> {
    name: String,
    config: ChainConfig,
    /// Providers (multiple for failover)
    http_providers: Vec<Provider<P>>,
    /// Current active provider index
    current_provider: AtomicUsize,
}

impl EvmClient<Http> {
    /// Create a new EVM client
    pub fn new(name: &str, config: ChainConfig) -> EngineResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", name, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        Self::with_providers(name, config, http_providers)
    }
}

impl<P> EvmClient<P>
where
    P: JsonRpcClient + Clone + 'static,
{
    /// Build a client over already constructed providers
    pub fn with_providers(name: &str, config: ChainConfig, http_providers: Vec<Provider<P>>) -> EngineResult<Self> {
        if http_providers.is_empty() {
            return Err(EngineError::Config(format!(
                "Chain {} has no valid RPC providers",
                name
            )));
        }

        Ok(Self {
            name: name.to_string(),
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
        })
    }

    /// Get the active provider
    fn http(&self) -> &Provider<P> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.name, next);
    }

    /// Run a read-only call, failing over across providers
    async fn read<T, F, Fut>(&self, operation: &str, call: F) -> EngineResult<T>
    where
        F: Fn(Provider<P>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut last_error = None;

        for _ in 0..self.http_providers.len() {
            match call(self.http().clone()).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!("Failed to {} on chain {}: {}", operation, self.name, e);
                    last_error = Some(e.to_string());
                    self.failover();
                }
            }
        }

        Err(EngineError::rpc(
            &self.name,
            last_error.unwrap_or_else(|| "all providers failed".to_string()),
        ))
    }

    fn parse_address(address: &str) -> EngineResult<Address> {
        Address::from_str(address)
            .map_err(|_| EngineError::Validation(format!("invalid address format: {}", address)))
    }

    fn parse_tx_hash(hash: &TxHash) -> EngineResult<H256> {
        H256::from_str(hash.as_str())
            .map_err(|_| EngineError::Validation(format!("invalid transaction hash: {}", hash)))
    }

    async fn latest_block(&self) -> EngineResult<ChainBlock> {
        self.read("get latest block", |p| async move {
            p.get_block(BlockNumber::Latest).await
        })
        .await?
        .and_then(to_chain_block)
        .ok_or_else(|| EngineError::rpc(&self.name, "latest block unavailable"))
    }

    /// Get current gas price based on chain strategy
    async fn gas_price(&self) -> EngineResult<FeeFields> {
        match self.config.gas_price_strategy {
            GasPriceStrategy::Legacy => {
                let price = self
                    .read("get gas price", |p| async move { p.get_gas_price().await })
                    .await?;
                Ok(FeeFields::Legacy { gas_price: price })
            }
            GasPriceStrategy::Eip1559 => {
                let (max_fee, priority_fee) = self.estimate_eip1559_fees().await?;
                Ok(FeeFields::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: priority_fee,
                })
            }
        }
    }

    /// Estimate EIP-1559 fees
    async fn estimate_eip1559_fees(&self) -> EngineResult<(U256, U256)> {
        let block = self
            .read("get latest block", |p| async move {
                p.get_block(BlockNumber::Latest).await
            })
            .await?
            .ok_or_else(|| EngineError::FeeEstimation("No latest block".to_string()))?;

        let base_fee = block
            .base_fee_per_gas
            .ok_or_else(|| EngineError::FeeEstimation("No base fee in block".to_string()))?;

        let priority_fee = U256::from(DEFAULT_PRIORITY_FEE);

        // Max fee = 2 * base_fee + priority_fee (buffer for block variability)
        let max_fee = base_fee * 2 + priority_fee;

        // Cap at configured max
        let max_gwei = U256::from(self.config.max_gas_price_gwei) * U256::from(1_000_000_000u64);
        let max_fee = std::cmp::min(max_fee, max_gwei);

        Ok((max_fee, std::cmp::min(priority_fee, max_fee)))
    }
}

fn to_chain_block(block: Block<H256>) -> Option<ChainBlock> {
    Some(ChainBlock {
        number: block.number?.as_u64(),
        hash: block.hash?,
        parent_hash: block.parent_hash,
        transactions: block.transactions.into_iter().map(TxHash::from).collect(),
    })
}

/// Flatten receipts into the block log: each receipt's logs, then a system
/// entry carrying the execution outcome
fn receipt_events(mut receipts: Vec<TransactionReceipt>) -> Vec<RawEvent> {
    receipts.sort_by_key(|receipt| receipt.transaction_index);

    let mut events = Vec::new();
    let mut index = 0u32;

    for receipt in receipts {
        let tx_index = receipt.transaction_index.as_u32();

        for log in &receipt.logs {
            events.push(RawEvent {
                index,
                tx_index: Some(tx_index),
                section: format!("{:?}", log.address),
                method: log
                    .topics
                    .first()
                    .map(|topic| format!("{:?}", topic))
                    .unwrap_or_else(|| "anonymous".to_string()),
                payload: json!({
                    "topics": log.topics,
                    "data": log.data,
                }),
            });
            index += 1;
        }

        let succeeded = receipt.status == Some(1u64.into());
        let payload = if succeeded {
            json!({ "gas_used": receipt.gas_used })
        } else {
            json!({ "gas_used": receipt.gas_used, "error": "execution reverted" })
        };
        events.push(RawEvent {
            index,
            tx_index: Some(tx_index),
            section: SYSTEM_SECTION.to_string(),
            method: if succeeded { EXTRINSIC_SUCCESS } else { EXTRINSIC_FAILED }.to_string(),
            payload,
        });
        index += 1;
    }

    events
}

#[async_trait]
impl<P> ChainClient for EvmClient<P>
where
    P: JsonRpcClient + Clone + 'static,
{
    async fn next_nonce(&self, address: &str) -> EngineResult<u64> {
        let address = Self::parse_address(address)?;
        let nonce = self
            .read("get transaction count", |p| async move {
                p.get_transaction_count(address, Some(BlockNumber::Pending.into()))
                    .await
            })
            .await?;
        Ok(nonce.as_u64())
    }

    async fn estimate_fee(&self, request: &TransactionRequest) -> EngineResult<FeeQuote> {
        let (to, data, value) = match request.payload() {
            CallPayload::Evm { to, data, value } => (*to, data.clone(), *value),
            CallPayload::Substrate { .. } => {
                return Err(EngineError::Validation(
                    "substrate payload sent to EVM chain".to_string(),
                ))
            }
        };
        let from = Self::parse_address(request.address())?;

        let tx: TypedTransaction = Eip1559TransactionRequest::new()
            .from(from)
            .to(to)
            .data(data)
            .value(value)
            .into();

        let gas_limit = self
            .http()
            .estimate_gas(&tx, None)
            .await
            .map_err(|e| EngineError::FeeEstimation(e.to_string()))?;
        let fields = self.gas_price().await?;

        Ok(FeeQuote {
            compute_limit: gas_limit,
            fields,
        })
    }

    async fn submit(&self, payload: &SignedPayload) -> EngineResult<Submission> {
        let pending = self
            .http()
            .send_raw_transaction(payload.bytes.clone())
            .await
            .map_err(|e| EngineError::dispatch(&self.name, e))?;

        let hash = TxHash::from(pending.tx_hash());
        if hash != payload.hash {
            warn!(
                "Chain {} reported hash {} for payload hashed as {}",
                self.name, hash, payload.hash
            );
        }

        Ok(Submission::Submitted { hash })
    }

    async fn block(&self, id: BlockId) -> EngineResult<Option<ChainBlock>> {
        let block = match id {
            BlockId::Number(number) => {
                self.read("get block", |p| async move {
                    p.get_block(BlockNumber::Number(number.into())).await
                })
                .await?
            }
            BlockId::Hash(hash) => {
                self.read("get block", |p| async move { p.get_block(hash).await })
                    .await?
            }
        };
        Ok(block.and_then(to_chain_block))
    }

    async fn best_head(&self) -> EngineResult<ChainBlock> {
        self.latest_block().await
    }

    /// Finality is counted in confirmations on top of the latest block
    async fn finalized_head(&self) -> EngineResult<ChainBlock> {
        self.latest_block().await
    }

    async fn pending_transactions(&self) -> EngineResult<Vec<TxHash>> {
        let block = self
            .read("get pending block", |p| async move {
                p.get_block(BlockNumber::Pending).await
            })
            .await?;
        Ok(block
            .map(|b| b.transactions.into_iter().map(TxHash::from).collect())
            .unwrap_or_default())
    }

    /// A node answers `eth_getTransactionByHash` for pooled and mined
    /// transactions alike, and `null` once it has forgotten the hash
    async fn is_known(&self, tx_hash: &TxHash) -> EngineResult<bool> {
        let hash = Self::parse_tx_hash(tx_hash)?;
        let tx = self
            .read("get transaction", |p| async move { p.get_transaction(hash).await })
            .await?;
        Ok(tx.is_some())
    }

    async fn block_events(&self, block: &ChainBlock, tx_hash: &TxHash) -> EngineResult<Vec<RawEvent>> {
        let number = block.number;
        let receipts = self
            .read("get block receipts", |p| async move {
                p.get_block_receipts(BlockNumber::Number(number.into())).await
            })
            .await;

        match receipts {
            Ok(receipts) => Ok(receipt_events(receipts)),
            Err(e) => {
                warn!(
                    "Block receipts unavailable on chain {} ({}), reading receipt of {} only",
                    self.name, e, tx_hash
                );
                let hash = Self::parse_tx_hash(tx_hash)?;
                let receipt = self
                    .read("get transaction receipt", |p| async move {
                        p.get_transaction_receipt(hash).await
                    })
                    .await?
                    .ok_or_else(|| EngineError::rpc(&self.name, format!("no receipt for {}", tx_hash)))?;
                Ok(receipt_events(vec![receipt]))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::types::ChainFamily;
    use ethers::providers::{JsonRpcError, MockProvider, MockResponse};

    fn config(urls: Vec<&str>) -> ChainConfig {
        ChainConfig {
            family: ChainFamily::Evm,
            rpc_urls: urls.into_iter().map(String::from).collect(),
            chain_id: Some(1287),
            required_confirmations: 3,
            gas_price_strategy: GasPriceStrategy::Eip1559,
            max_gas_price_gwei: 100,
            current_runtime_spec_version: None,
            utility_pallet_index: 26,
            mortal_era_period: 64,
            enabled: true,
        }
    }

    #[test]
    fn test_requires_a_valid_provider() {
        assert!(EvmClient::new("evm", config(vec!["not a url"])).is_err());
        assert!(EvmClient::new("evm", config(vec!["http://localhost:8545"])).is_ok());
    }

    #[test]
    fn test_failover_rotates_providers() {
        let client = EvmClient::new(
            "evm",
            config(vec!["http://localhost:8545", "http://localhost:8546"]),
        )
        .unwrap();
        assert_eq!(client.current_provider.load(Ordering::Relaxed), 0);
        client.failover();
        assert_eq!(client.current_provider.load(Ordering::Relaxed), 1);
        client.failover();
        assert_eq!(client.current_provider.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_pending_blocks_are_skipped() {
        let block = Block::<H256> {
            number: None,
            hash: None,
            ..Default::default()
        };
        assert!(to_chain_block(block).is_none());

        let block = Block::<H256> {
            number: Some(9u64.into()),
            hash: Some(H256::repeat_byte(9)),
            transactions: vec![H256::repeat_byte(1)],
            ..Default::default()
        };
        let block = to_chain_block(block).unwrap();
        assert_eq!(block.number, 9);
        assert!(block.contains(&TxHash::from(H256::repeat_byte(1))));
    }

    fn mocked() -> (EvmClient<MockProvider>, MockProvider) {
        let (provider, mock) = Provider::mocked();
        let client = EvmClient::with_providers("evm", config(vec!["http://localhost:8545"]), vec![provider]).unwrap();
        (client, mock)
    }

    fn tx_hash() -> TxHash {
        TxHash::from(H256::repeat_byte(0xab))
    }

    #[tokio::test]
    async fn test_pooled_transaction_is_known() {
        let (client, mock) = mocked();
        let pooled = Transaction {
            hash: H256::repeat_byte(0xab),
            block_number: None,
            ..Default::default()
        };
        mock.push::<Transaction, _>(pooled).unwrap();

        assert!(client.is_known(&tx_hash()).await.unwrap());
    }

    #[tokio::test]
    async fn test_forgotten_transaction_is_unknown() {
        let (client, mock) = mocked();
        mock.push::<Option<Transaction>, _>(None).unwrap();

        assert!(!client.is_known(&tx_hash()).await.unwrap());
    }

    #[tokio::test]
    async fn test_block_events_fall_back_to_transaction_receipt() {
        let (client, mock) = mocked();
        let receipt = TransactionReceipt {
            transaction_hash: H256::repeat_byte(0xab),
            transaction_index: 0u64.into(),
            block_number: Some(9u64.into()),
            status: Some(0u64.into()),
            ..Default::default()
        };
        // Responses pop from the back: block receipts fail first, then the
        // single receipt answers
        mock.push::<TransactionReceipt, _>(receipt).unwrap();
        mock.push_response(MockResponse::Error(JsonRpcError {
            code: -32601,
            message: "the method eth_getBlockReceipts does not exist".to_string(),
            data: None,
        }));

        let block = ChainBlock {
            number: 9,
            hash: H256::repeat_byte(9),
            parent_hash: H256::repeat_byte(8),
            transactions: vec![tx_hash()],
        };
        let events = client.block_events(&block, &tx_hash()).await.unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tx_index, Some(0));
        assert_eq!(events[0].section, SYSTEM_SECTION);
        assert_eq!(events[0].method, EXTRINSIC_FAILED);
    }

    #[tokio::test]
    async fn test_block_events_use_block_receipts_when_served() {
        let (client, mock) = mocked();
        let receipts = vec![
            TransactionReceipt {
                transaction_index: 1u64.into(),
                status: Some(1u64.into()),
                ..Default::default()
            },
            TransactionReceipt {
                transaction_index: 0u64.into(),
                status: Some(1u64.into()),
                ..Default::default()
            },
        ];
        mock.push::<Vec<TransactionReceipt>, _>(receipts).unwrap();

        let block = ChainBlock {
            number: 9,
            hash: H256::repeat_byte(9),
            parent_hash: H256::repeat_byte(8),
            transactions: Vec::new(),
        };
        let events = client.block_events(&block, &tx_hash()).await.unwrap();

        let order: Vec<_> = events.iter().map(|e| (e.index, e.tx_index)).collect();
        assert_eq!(order, vec![(0, Some(0)), (1, Some(1))]);
        assert!(events.iter().all(|e| e.method == EXTRINSIC_SUCCESS));
    }
}
