//! Transaction data model shared by every engine component

use crate::error::{EngineError, EngineResult};
use crate::events::ChainEvent;

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use chrono::{DateTime, Utc};
use ethers::types::{Address, Bytes, H256, U256};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha3::Keccak256;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

type Blake2b256 = Blake2b<U32>;

lazy_static! {
    static ref SS58_ADDRESS: Regex = Regex::new(r"^[1-9A-HJ-NP-Za-km-z]{46,48}$").unwrap();
}

/// The two supported chain families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainFamily {
    Substrate,
    Evm,
}

impl fmt::Display for ChainFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainFamily::Substrate => f.write_str("substrate"),
            ChainFamily::Evm => f.write_str("evm"),
        }
    }
}

/// Chain-defined transaction identifying hash, lowercase and `0x` prefixed
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxHash(String);

impl TxHash {
    pub fn new(hash: &str) -> Self {
        let hash = hash.trim().to_lowercase();
        if hash.starts_with("0x") {
            Self(hash)
        } else {
            Self(format!("0x{}", hash))
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(format!("0x{}", hex::encode(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<H256> for TxHash {
    fn from(hash: H256) -> Self {
        Self::from_bytes(hash.as_bytes())
    }
}

/// Hash of a substrate extrinsic
pub fn extrinsic_hash(encoded: &[u8]) -> TxHash {
    TxHash::from_bytes(&Blake2b256::digest(encoded))
}

/// Hash of a signed EVM transaction
pub fn evm_tx_hash(rlp: &[u8]) -> TxHash {
    TxHash::from_bytes(&Keccak256::digest(rlp))
}

/// A single encoded chain call, the unit batches are built from
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    /// Human-readable name used in logs, e.g. `did.create`
    pub label: String,
    /// SCALE-encoded call on substrate, ABI calldata on EVM
    pub data: Bytes,
    /// Contract target (EVM only)
    pub to: Option<Address>,
    /// Value attached (EVM only)
    pub value: U256,
}

impl Call {
    pub fn substrate(label: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            label: label.into(),
            data: data.into(),
            to: None,
            value: U256::zero(),
        }
    }

    pub fn evm(label: impl Into<String>, to: Address, data: impl Into<Bytes>) -> Self {
        Self {
            label: label.into(),
            data: data.into(),
            to: Some(to),
            value: U256::zero(),
        }
    }

    pub fn with_value(mut self, value: U256) -> Self {
        self.value = value;
        self
    }
}

/// Chain-specific prepared payload
#[derive(Debug, Clone, PartialEq)]
pub enum CallPayload {
    Substrate { call: Bytes },
    Evm { to: Address, data: Bytes, value: U256 },
}

/// A prepared call plus the account that will sign it. Immutable once built.
#[derive(Debug, Clone)]
pub struct TransactionRequest {
    id: Uuid,
    family: ChainFamily,
    address: String,
    label: String,
    payload: CallPayload,
}

impl TransactionRequest {
    pub fn new(family: ChainFamily, address: impl Into<String>, label: impl Into<String>, payload: CallPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            family,
            address: address.into(),
            label: label.into(),
            payload,
        }
    }

    /// Build a request from a single call
    pub fn from_call(family: ChainFamily, address: impl Into<String>, call: Call) -> EngineResult<Self> {
        let payload = match family {
            ChainFamily::Substrate => CallPayload::Substrate { call: call.data },
            ChainFamily::Evm => CallPayload::Evm {
                to: call.to.ok_or_else(|| {
                    EngineError::Validation(format!("EVM call {} has no target address", call.label))
                })?,
                data: call.data,
                value: call.value,
            },
        };
        Ok(Self::new(family, address, call.label, payload))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn family(&self) -> ChainFamily {
        self.family
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn payload(&self) -> &CallPayload {
        &self.payload
    }

    /// Key used by the nonce cache
    pub fn account_key(&self) -> String {
        self.address.to_lowercase()
    }

    /// Reject malformed requests before any network interaction
    pub fn validate(&self) -> EngineResult<()> {
        match (self.family, &self.payload) {
            (ChainFamily::Evm, CallPayload::Evm { .. }) => {
                Address::from_str(&self.address).map_err(|_| {
                    EngineError::Validation(format!("invalid address format: {}", self.address))
                })?;
            }
            (ChainFamily::Substrate, CallPayload::Substrate { call }) => {
                if !SS58_ADDRESS.is_match(&self.address) {
                    return Err(EngineError::Validation(format!(
                        "invalid address format: {}",
                        self.address
                    )));
                }
                if call.is_empty() {
                    return Err(EngineError::Validation("empty call data".to_string()));
                }
            }
            (family, _) => {
                return Err(EngineError::Validation(format!(
                    "payload does not match chain family {}",
                    family
                )))
            }
        }
        Ok(())
    }
}

/// Status of an in-flight transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Pending,
    InBlock,
    Confirmed,
    Failed,
    Timeout,
}

impl TxStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxStatus::Confirmed | TxStatus::Failed | TxStatus::Timeout)
    }

    fn rank(&self) -> u8 {
        match self {
            TxStatus::Pending => 0,
            TxStatus::InBlock => 1,
            TxStatus::Confirmed | TxStatus::Failed | TxStatus::Timeout => 2,
        }
    }
}

/// Mutable record for one in-flight transaction.
///
/// Status only moves forward. Once terminal, every further transition is a
/// no-op, so whichever of the push stream or the fallback search resolves the
/// transaction first wins.
#[derive(Debug, Clone)]
pub struct PendingTransaction {
    pub operation_id: Uuid,
    pub id: Option<TxHash>,
    pub status: TxStatus,
    pub block_number: Option<u64>,
    pub block_hash: Option<H256>,
    pub events: Vec<ChainEvent>,
    pub retry_count: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PendingTransaction {
    pub fn new(operation_id: Uuid, retry_count: u32) -> Self {
        Self {
            operation_id,
            id: None,
            status: TxStatus::Pending,
            block_number: None,
            block_hash: None,
            events: Vec::new(),
            retry_count,
            error: None,
            created_at: Utc::now(),
        }
    }

    /// Record the id obtained from signing
    pub fn set_id(&mut self, id: TxHash) {
        if self.id.is_none() {
            self.id = Some(id);
        }
    }

    fn advance(&mut self, next: TxStatus) -> bool {
        if self.status.is_terminal() || next.rank() <= self.status.rank() {
            return false;
        }
        self.status = next;
        true
    }

    /// Seen in a block, finality pending. `block_number` stays unset until
    /// the transaction is confirmed together with its events.
    ///
    /// An `InBlock` record follows the transaction into a new block after a
    /// reorg; returns whether anything changed.
    pub fn mark_in_block(&mut self, block_hash: H256) -> bool {
        if self.status == TxStatus::InBlock {
            if self.block_hash == Some(block_hash) {
                return false;
            }
            self.block_hash = Some(block_hash);
            return true;
        }
        if self.advance(TxStatus::InBlock) {
            self.block_hash = Some(block_hash);
            true
        } else {
            false
        }
    }

    /// The including block left the canonical chain. Status stays `InBlock`
    /// but the stale block hash is dropped.
    pub fn retract(&mut self, block_hash: H256) -> bool {
        if self.status == TxStatus::InBlock && self.block_hash == Some(block_hash) {
            self.block_hash = None;
            true
        } else {
            false
        }
    }

    pub fn confirm(&mut self, block_number: u64, block_hash: H256, events: Vec<ChainEvent>) -> bool {
        if self.advance(TxStatus::Confirmed) {
            self.block_number = Some(block_number);
            self.block_hash = Some(block_hash);
            self.events = events;
            true
        } else {
            false
        }
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> bool {
        if self.advance(TxStatus::Failed) {
            self.error = Some(reason.into());
            true
        } else {
            false
        }
    }

    /// Included but failed during execution
    pub fn fail_in_block(
        &mut self,
        block_number: u64,
        block_hash: H256,
        events: Vec<ChainEvent>,
        reason: impl Into<String>,
    ) -> bool {
        if self.advance(TxStatus::Failed) {
            self.block_number = Some(block_number);
            self.block_hash = Some(block_hash);
            self.events = events;
            self.error = Some(reason.into());
            true
        } else {
            false
        }
    }

    pub fn time_out(&mut self, reason: impl Into<String>) -> bool {
        if self.advance(TxStatus::Timeout) {
            self.error = Some(reason.into());
            true
        } else {
            false
        }
    }
}

/// Quality of a fee estimate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    /// A fallback constant was used instead of a live estimate
    Low,
}

/// Chain-specific price fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeeFields {
    Legacy {
        gas_price: U256,
    },
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
    Substrate {
        partial_fee: U256,
        tip: U256,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeEstimate {
    /// Gas limit on EVM, weight on substrate
    pub compute_limit: U256,
    pub fields: FeeFields,
    pub total_cost: U256,
    pub confidence: Confidence,
}

/// Transaction mortality used by substrate signers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Era {
    Immortal,
    Mortal { period: u64 },
}

/// Parameters handed to the signer; fresh for every attempt
#[derive(Debug, Clone, PartialEq)]
pub struct SignParams {
    pub nonce: u64,
    pub fee: FeeEstimate,
    pub chain_id: Option<u64>,
    pub era: Era,
}

/// Opaque signed transaction plus its identifying hash
#[derive(Debug, Clone, PartialEq)]
pub struct SignedPayload {
    pub bytes: Bytes,
    pub hash: TxHash,
}

impl SignedPayload {
    pub fn evm(bytes: Bytes) -> Self {
        let hash = evm_tx_hash(&bytes);
        Self { bytes, hash }
    }

    pub fn substrate(bytes: Bytes) -> Self {
        let hash = extrinsic_hash(&bytes);
        Self { bytes, hash }
    }
}

/// Terminal outcome returned to the caller
#[derive(Debug, Clone, Serialize)]
pub struct TransactionResult {
    pub success: bool,
    pub status: TxStatus,
    pub tx_hash: TxHash,
    pub block_number: Option<u64>,
    pub block_hash: Option<H256>,
    pub events: Vec<ChainEvent>,
    pub fee: FeeEstimate,
    pub retry_count: u32,
    pub failure_reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}
