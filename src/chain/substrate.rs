//! Substrate chain client over JSON-RPC (HTTP)
//!
//! Extrinsics are identified by the blake2b-256 hash of their encoding.
//! Execution events live in the `System.Events` storage item; decoding them
//! needs runtime metadata, so it is delegated to an injected
//! [`EventDecoder`]. Without one, blocks report no events.

use super::scale::unsigned_extrinsic;
use super::{BlockId, ChainBlock, ChainClient, FeeQuote, RawEvent, Submission};
use crate::config::ChainConfig;
use crate::error::{EngineError, EngineResult};
use crate::tx::types::{extrinsic_hash, CallPayload, FeeFields, SignedPayload, TransactionRequest, TxHash};

use async_trait::async_trait;
use ethers::types::{H256, U256};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// twox128("System") ++ twox128("Events")
const SYSTEM_EVENTS_KEY: &str =
    "0x26aa394eea5630e07c48ae0c9558cef780d41e5e16056765bc8461851072c9d7";

/// Decodes the raw `System.Events` storage value of a block
pub trait EventDecoder: Send + Sync {
    fn decode(&self, raw: &[u8]) -> EngineResult<Vec<RawEvent>>;
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
    data: Option<Value>,
}

impl RpcErrorObject {
    fn describe(&self) -> String {
        match &self.data {
            Some(Value::String(data)) => format!("{} ({}): {}", self.message, self.code, data),
            Some(data) => format!("{} ({}): {}", self.message, self.code, data),
            None => format!("{} ({})", self.message, self.code),
        }
    }
}

enum RpcFailure {
    /// Node unreachable or response unreadable
    Transport(String),
    /// Node answered with an error object
    Node(String),
}

#[derive(Debug, Deserialize)]
struct SignedBlock {
    block: RawBlock,
}

#[derive(Debug, Deserialize)]
struct RawBlock {
    header: RawHeader,
    extrinsics: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawHeader {
    parent_hash: String,
    number: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RuntimeVersion {
    spec_version: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DispatchInfo {
    weight: Value,
    partial_fee: Value,
}

/// JSON-RPC substrate client
pub struct SubstrateClient {
    name: String,
    config: ChainConfig,
    http: reqwest::Client,
    current_url: AtomicUsize,
    next_id: AtomicU64,
    decoder: Option<Arc<dyn EventDecoder>>,
}

impl SubstrateClient {
    pub fn new(
        name: &str,
        config: ChainConfig,
        decoder: Option<Arc<dyn EventDecoder>>,
    ) -> EngineResult<Self> {
        if config.rpc_urls.is_empty() {
            return Err(EngineError::Config(format!("Chain {} has no RPC URLs", name)));
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| EngineError::Config(e.to_string()))?;

        Ok(Self {
            name: name.to_string(),
            config,
            http,
            current_url: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            decoder,
        })
    }

    /// Attach a decoder for the execution log
    pub fn with_event_decoder(mut self, decoder: Arc<dyn EventDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    fn url(&self) -> &str {
        let idx = self.current_url.load(Ordering::Relaxed);
        &self.config.rpc_urls[idx % self.config.rpc_urls.len()]
    }

    fn failover(&self) {
        let current = self.current_url.load(Ordering::Relaxed);
        let next = (current + 1) % self.config.rpc_urls.len();
        self.current_url.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to endpoint {}", self.name, next);
    }

    async fn call_once<T: DeserializeOwned>(&self, method: &str, params: &Value) -> Result<Option<T>, RpcFailure> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
            "method": method,
            "params": params,
        });

        let response = self
            .http
            .post(self.url())
            .json(&body)
            .send()
            .await
            .map_err(|e| RpcFailure::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RpcFailure::Transport(format!("HTTP {}", status.as_u16())));
        }

        let response: RpcResponse<T> = response
            .json()
            .await
            .map_err(|e| RpcFailure::Transport(format!("could not decode response: {}", e)))?;

        match response.error {
            Some(error) => Err(RpcFailure::Node(error.describe())),
            None => Ok(response.result),
        }
    }

    /// JSON-RPC call with endpoint failover on transport errors
    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<Option<T>, RpcFailure> {
        let mut last = None;

        for _ in 0..self.config.rpc_urls.len() {
            match self.call_once(method, &params).await {
                Err(RpcFailure::Transport(message)) => {
                    warn!("{} failed on chain {}: {}", method, self.name, message);
                    last = Some(message);
                    self.failover();
                }
                other => return other,
            }
        }

        Err(RpcFailure::Transport(
            last.unwrap_or_else(|| "all endpoints failed".to_string()),
        ))
    }

    /// Call where a node error is an RPC error and `null` is not allowed
    async fn query<T: DeserializeOwned>(&self, method: &str, params: Value) -> EngineResult<T> {
        self.query_optional(method, params)
            .await?
            .ok_or_else(|| EngineError::rpc(&self.name, format!("{} returned null", method)))
    }

    async fn query_optional<T: DeserializeOwned>(&self, method: &str, params: Value) -> EngineResult<Option<T>> {
        self.call(method, params).await.map_err(|failure| match failure {
            RpcFailure::Transport(message) | RpcFailure::Node(message) => {
                EngineError::rpc(&self.name, message)
            }
        })
    }

    /// Runtime spec version, used to pick the runtime variant
    pub async fn runtime_spec_version(&self) -> EngineResult<u32> {
        let version: RuntimeVersion = self.query("state_getRuntimeVersion", json!([])).await?;
        Ok(version.spec_version)
    }

    async fn block_by_hash(&self, hash: H256) -> EngineResult<Option<ChainBlock>> {
        let signed: Option<SignedBlock> = self
            .query_optional("chain_getBlock", json!([format!("{:?}", hash)]))
            .await?;

        signed
            .map(|signed| {
                let header = signed.block.header;
                let transactions = signed
                    .block
                    .extrinsics
                    .iter()
                    .map(|xt| decode_hex(xt).map(|bytes| extrinsic_hash(&bytes)))
                    .collect::<EngineResult<Vec<_>>>()?;

                Ok(ChainBlock {
                    number: parse_number(&header.number)?,
                    hash,
                    parent_hash: parse_hash(&header.parent_hash)?,
                    transactions,
                })
            })
            .transpose()
    }
}

#[async_trait]
impl ChainClient for SubstrateClient {
    async fn next_nonce(&self, address: &str) -> EngineResult<u64> {
        self.query("system_accountNextIndex", json!([address])).await
    }

    async fn estimate_fee(&self, request: &TransactionRequest) -> EngineResult<FeeQuote> {
        let call = match request.payload() {
            CallPayload::Substrate { call } => call,
            CallPayload::Evm { .. } => {
                return Err(EngineError::Validation(
                    "EVM payload sent to substrate chain".to_string(),
                ))
            }
        };

        let extrinsic = format!("0x{}", hex::encode(unsigned_extrinsic(call)));
        let info: DispatchInfo = self
            .query("payment_queryInfo", json!([extrinsic]))
            .await
            .map_err(|e| EngineError::FeeEstimation(e.to_string()))?;

        Ok(FeeQuote {
            compute_limit: parse_weight(&info.weight)?,
            fields: FeeFields::Substrate {
                partial_fee: parse_amount(&info.partial_fee)?,
                tip: U256::zero(),
            },
        })
    }

    async fn submit(&self, payload: &SignedPayload) -> EngineResult<Submission> {
        let extrinsic = format!("0x{}", hex::encode(&payload.bytes));
        let hash: Option<String> = self
            .call("author_submitExtrinsic", json!([extrinsic]))
            .await
            .map_err(|failure| match failure {
                RpcFailure::Transport(message) => EngineError::rpc(&self.name, message),
                RpcFailure::Node(message) => EngineError::dispatch(&self.name, message),
            })?;

        let hash = hash.map(|h| TxHash::new(&h)).unwrap_or_else(|| payload.hash.clone());
        debug!("Submitted extrinsic {} to chain {}", hash, self.name);
        Ok(Submission::Submitted { hash })
    }

    async fn block(&self, id: BlockId) -> EngineResult<Option<ChainBlock>> {
        match id {
            BlockId::Hash(hash) => self.block_by_hash(hash).await,
            BlockId::Number(number) => {
                let hash: Option<String> = self
                    .query_optional("chain_getBlockHash", json!([number]))
                    .await?;
                match hash {
                    Some(hash) => self.block_by_hash(parse_hash(&hash)?).await,
                    None => Ok(None),
                }
            }
        }
    }

    async fn best_head(&self) -> EngineResult<ChainBlock> {
        let hash: String = self.query("chain_getBlockHash", json!([])).await?;
        self.block_by_hash(parse_hash(&hash)?)
            .await?
            .ok_or_else(|| EngineError::rpc(&self.name, "best block unavailable"))
    }

    async fn finalized_head(&self) -> EngineResult<ChainBlock> {
        let hash: String = self.query("chain_getFinalizedHead", json!([])).await?;
        self.block_by_hash(parse_hash(&hash)?)
            .await?
            .ok_or_else(|| EngineError::rpc(&self.name, "finalized block unavailable"))
    }

    async fn pending_transactions(&self) -> EngineResult<Vec<TxHash>> {
        let pending: Vec<String> = self.query("author_pendingExtrinsics", json!([])).await?;
        pending
            .iter()
            .map(|xt| decode_hex(xt).map(|bytes| extrinsic_hash(&bytes)))
            .collect()
    }

    async fn block_events(&self, block: &ChainBlock, _tx_hash: &TxHash) -> EngineResult<Vec<RawEvent>> {
        let Some(decoder) = &self.decoder else {
            debug!("No event decoder for chain {}, skipping events", self.name);
            return Ok(Vec::new());
        };

        let raw: Option<String> = self
            .query_optional(
                "state_getStorage",
                json!([SYSTEM_EVENTS_KEY, format!("{:?}", block.hash)]),
            )
            .await?;

        match raw {
            Some(raw) => decoder.decode(&decode_hex(&raw)?),
            None => Ok(Vec::new()),
        }
    }
}

fn decode_hex(value: &str) -> EngineResult<Vec<u8>> {
    hex::decode(value.trim_start_matches("0x"))
        .map_err(|e| EngineError::Internal(format!("malformed hex from node: {}", e)))
}

fn parse_hash(value: &str) -> EngineResult<H256> {
    H256::from_str(value).map_err(|e| EngineError::Internal(format!("malformed hash {}: {}", value, e)))
}

fn parse_number(value: &str) -> EngineResult<u64> {
    u64::from_str_radix(value.trim_start_matches("0x"), 16)
        .map_err(|e| EngineError::Internal(format!("malformed block number {}: {}", value, e)))
}

/// Amounts arrive as decimal strings, hex strings or plain numbers
fn parse_amount(value: &Value) -> EngineResult<U256> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .map(U256::from)
            .ok_or_else(|| EngineError::Internal(format!("malformed amount {}", n))),
        Value::String(s) if s.starts_with("0x") => U256::from_str_radix(&s[2..], 16)
            .map_err(|e| EngineError::Internal(format!("malformed amount {}: {}", s, e))),
        Value::String(s) => U256::from_dec_str(s)
            .map_err(|e| EngineError::Internal(format!("malformed amount {}: {}", s, e))),
        other => Err(EngineError::Internal(format!("malformed amount {}", other))),
    }
}

/// Weight is a plain number on older runtimes, `{refTime, proofSize}` on newer
fn parse_weight(value: &Value) -> EngineResult<U256> {
    match value {
        Value::Object(map) => map
            .get("refTime")
            .or_else(|| map.get("ref_time"))
            .map(parse_amount)
            .unwrap_or_else(|| Err(EngineError::Internal(format!("malformed weight {}", value)))),
        other => parse_amount(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_amount_variants() {
        assert_eq!(parse_amount(&json!(42)).unwrap(), U256::from(42));
        assert_eq!(parse_amount(&json!("1000")).unwrap(), U256::from(1000));
        assert_eq!(parse_amount(&json!("0xff")).unwrap(), U256::from(255));
        assert!(parse_amount(&json!(null)).is_err());
    }

    #[test]
    fn test_parse_weight_layouts() {
        assert_eq!(parse_weight(&json!(125_000_000)).unwrap(), U256::from(125_000_000u64));
        assert_eq!(
            parse_weight(&json!({ "refTime": 9000, "proofSize": 3593 })).unwrap(),
            U256::from(9000)
        );
    }

    #[test]
    fn test_parse_header_fields() {
        assert_eq!(parse_number("0x1a").unwrap(), 26);
        assert!(parse_hash("0x1234").is_err());
        assert_eq!(
            parse_hash(&format!("{:?}", H256::repeat_byte(3))).unwrap(),
            H256::repeat_byte(3)
        );
    }

    #[test]
    fn test_rpc_error_description() {
        let error = RpcErrorObject {
            code: 1010,
            message: "Invalid Transaction".to_string(),
            data: Some(json!("Inability to pay some fees (e.g. account balance too low)")),
        };
        let described = error.describe();
        assert!(described.contains("1010"));
        assert!(described.contains("Inability to pay some fees"));
    }
}
