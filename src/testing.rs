//! Scripted in-memory chain and signer for multi-step tests

use crate::chain::{BlockId, ChainBlock, ChainClient, FeeQuote, RawEvent, StatusUpdate, Submission};
use crate::config::{ChainConfig, GasPriceStrategy};
use crate::error::{EngineError, EngineResult};
use crate::events::{EXTRINSIC_FAILED, EXTRINSIC_SUCCESS, SYSTEM_SECTION};
use crate::tx::signer::TxSigner;
use crate::tx::types::{ChainFamily, FeeFields, SignParams, SignedPayload, TransactionRequest, TxHash};

use async_trait::async_trait;
use ethers::types::{H256, U256};
use futures::{stream, StreamExt};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub const ALICE: &str = "5GrwvaEF5zXb26Fz9rcQpDWS57CtERHpNehXCPcNoHGKutQY";
pub const EVM_ACCOUNT: &str = "0x00000000000000000000000000000000000000a1";

/// What the fake node does with an accepted payload
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OnSubmit {
    /// Mine it into a new finalized block right away
    Include,
    /// Keep it in the pool forever
    Pool,
    /// Accept it, then lose it
    Drop,
}

/// Push-status script replayed for watched submissions
#[derive(Debug, Clone)]
pub enum Script {
    Ready,
    /// In the block the payload was mined into
    InBlock,
    Finalized,
    Invalid(String),
    Dropped,
    /// Close the stream
    End,
}

struct FakeState {
    blocks: Vec<ChainBlock>,
    finalized: u64,
    pool: Vec<TxHash>,
    events: HashMap<H256, Vec<RawEvent>>,
    nonce: u64,
    nonce_latency: Option<Duration>,
    fee_available: bool,
    submit_errors: VecDeque<EngineError>,
    on_submit: OnSubmit,
    execution_failure: Option<String>,
    watch: Option<Vec<Script>>,
    grow_on_head: bool,
    hold_finality: bool,
    hide_pending_listing: bool,
    events_unavailable: bool,
    submitted: Vec<SignedPayload>,
}

pub struct FakeChain {
    family: ChainFamily,
    state: Mutex<FakeState>,
}

impl FakeChain {
    /// A chain of empty blocks `0..=height`, all finalized
    pub fn new(family: ChainFamily, height: u64) -> Self {
        let blocks = (0..=height)
            .map(|number| ChainBlock {
                number,
                hash: Self::block_hash(number),
                parent_hash: if number == 0 { H256::zero() } else { Self::block_hash(number - 1) },
                transactions: Vec::new(),
            })
            .collect();

        Self {
            family,
            state: Mutex::new(FakeState {
                blocks,
                finalized: height,
                pool: Vec::new(),
                events: HashMap::new(),
                nonce: 0,
                nonce_latency: None,
                fee_available: true,
                submit_errors: VecDeque::new(),
                on_submit: OnSubmit::Include,
                execution_failure: None,
                watch: None,
                grow_on_head: false,
                hold_finality: false,
                hide_pending_listing: false,
                events_unavailable: false,
                submitted: Vec::new(),
            }),
        }
    }

    pub fn block_hash(number: u64) -> H256 {
        H256::from_low_u64_be(number + 1)
    }

    pub fn chain_config(family: ChainFamily) -> ChainConfig {
        ChainConfig {
            family,
            rpc_urls: vec!["http://localhost:9933".to_string()],
            chain_id: Some(1287),
            required_confirmations: 0,
            gas_price_strategy: GasPriceStrategy::Legacy,
            max_gas_price_gwei: 500,
            current_runtime_spec_version: None,
            utility_pallet_index: 26,
            mortal_era_period: 64,
            enabled: true,
        }
    }

    pub fn on_submit(&self, behaviour: OnSubmit) {
        self.state.lock().unwrap().on_submit = behaviour;
    }

    pub fn fail_submits(&self, errors: Vec<EngineError>) {
        self.state.lock().unwrap().submit_errors = errors.into();
    }

    pub fn fail_execution(&self, reason: &str) {
        self.state.lock().unwrap().execution_failure = Some(reason.to_string());
    }

    pub fn watch(&self, script: Vec<Script>) {
        self.state.lock().unwrap().watch = Some(script);
    }

    /// Every best-head query appends an empty block first
    pub fn grow_on_head(&self) {
        self.state.lock().unwrap().grow_on_head = true;
    }

    /// New blocks stay unfinalized until `finalize` is called
    pub fn hold_finality(&self) {
        self.state.lock().unwrap().hold_finality = true;
    }

    pub fn finalize(&self, number: u64) {
        self.state.lock().unwrap().finalized = number;
    }

    /// Pool entries stay known by hash but are left out of the listing
    pub fn hide_pending_listing(&self) {
        self.state.lock().unwrap().hide_pending_listing = true;
    }

    /// Every event-log read fails
    pub fn events_unavailable(&self) {
        self.state.lock().unwrap().events_unavailable = true;
    }

    pub fn fee_unavailable(&self) {
        self.state.lock().unwrap().fee_available = false;
    }

    pub fn set_pool(&self, pool: Vec<TxHash>) {
        self.state.lock().unwrap().pool = pool;
    }

    pub fn set_nonce(&self, nonce: u64) {
        self.state.lock().unwrap().nonce = nonce;
    }

    /// Nonce queries wait this long before answering
    pub fn nonce_latency(&self, latency: Duration) {
        self.state.lock().unwrap().nonce_latency = Some(latency);
    }

    /// Mine `txs` into a new block, finalized unless finality is held
    pub fn mine(&self, txs: Vec<TxHash>) -> ChainBlock {
        Self::mine_locked(&mut self.state.lock().unwrap(), txs)
    }

    pub fn height(&self) -> u64 {
        self.state.lock().unwrap().blocks.len() as u64 - 1
    }

    pub fn submitted_count(&self) -> usize {
        self.state.lock().unwrap().submitted.len()
    }

    pub fn submitted_nonces(&self) -> Vec<u64> {
        self.state
            .lock()
            .unwrap()
            .submitted
            .iter()
            .map(|payload| u64::from_le_bytes(payload.bytes[16..24].try_into().unwrap()))
            .collect()
    }

    fn mine_locked(state: &mut FakeState, txs: Vec<TxHash>) -> ChainBlock {
        let parent = state.blocks.last().cloned().unwrap();
        let number = parent.number + 1;
        let block = ChainBlock {
            number,
            hash: Self::block_hash(number),
            parent_hash: parent.hash,
            transactions: txs.clone(),
        };

        let mut log = Vec::new();
        for (position, _) in txs.iter().enumerate() {
            let tx_index = Some(position as u32);
            log.push(RawEvent {
                index: log.len() as u32,
                tx_index,
                section: "did".to_string(),
                method: "DidCreated".to_string(),
                payload: json!({ "position": position }),
            });
            let (method, payload) = match &state.execution_failure {
                Some(reason) => (EXTRINSIC_FAILED, json!({ "error": reason })),
                None => (EXTRINSIC_SUCCESS, json!({})),
            };
            log.push(RawEvent {
                index: log.len() as u32,
                tx_index,
                section: SYSTEM_SECTION.to_string(),
                method: method.to_string(),
                payload,
            });
        }

        state.pool.retain(|hash| !txs.contains(hash));
        state.events.insert(block.hash, log);
        state.blocks.push(block.clone());
        if !state.hold_finality {
            state.finalized = number;
        }
        block
    }

    fn status_stream(script: &[Script], block: Option<H256>) -> crate::chain::StatusStream {
        let block = block.unwrap_or_else(H256::zero);
        let mut updates = Vec::new();
        let mut close = false;
        for step in script {
            updates.push(Ok(match step {
                Script::Ready => StatusUpdate::Ready,
                Script::InBlock => StatusUpdate::InBlock(block),
                Script::Finalized => StatusUpdate::Finalized(block),
                Script::Invalid(reason) => StatusUpdate::Invalid(reason.clone()),
                Script::Dropped => StatusUpdate::Dropped,
                Script::End => {
                    close = true;
                    break;
                }
            }));
        }

        if close {
            stream::iter(updates).boxed()
        } else {
            stream::iter(updates).chain(stream::pending()).boxed()
        }
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    async fn next_nonce(&self, _address: &str) -> EngineResult<u64> {
        let latency = self.state.lock().unwrap().nonce_latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        Ok(self.state.lock().unwrap().nonce)
    }

    async fn estimate_fee(&self, _request: &TransactionRequest) -> EngineResult<FeeQuote> {
        if !self.state.lock().unwrap().fee_available {
            return Err(EngineError::FeeEstimation("estimation unavailable".to_string()));
        }
        let fields = match self.family {
            ChainFamily::Substrate => FeeFields::Substrate {
                partial_fee: U256::from(1_000u64),
                tip: U256::zero(),
            },
            ChainFamily::Evm => FeeFields::Legacy {
                gas_price: U256::from(1_000_000_000u64),
            },
        };
        Ok(FeeQuote {
            compute_limit: U256::from(50_000u64),
            fields,
        })
    }

    async fn submit(&self, payload: &SignedPayload) -> EngineResult<Submission> {
        let mut state = self.state.lock().unwrap();
        state.submitted.push(payload.clone());

        if let Some(error) = state.submit_errors.pop_front() {
            return Err(error);
        }
        state.nonce += 1;

        let hash = payload.hash.clone();
        let included = match state.on_submit {
            OnSubmit::Include => Some(Self::mine_locked(&mut state, vec![hash.clone()]).hash),
            OnSubmit::Pool => {
                state.pool.push(hash.clone());
                None
            }
            OnSubmit::Drop => None,
        };

        Ok(match &state.watch {
            Some(script) => Submission::Watched {
                hash,
                updates: Self::status_stream(script, included),
            },
            None => Submission::Submitted { hash },
        })
    }

    async fn block(&self, id: BlockId) -> EngineResult<Option<ChainBlock>> {
        let state = self.state.lock().unwrap();
        Ok(match id {
            BlockId::Number(number) => state.blocks.get(number as usize).cloned(),
            BlockId::Hash(hash) => state.blocks.iter().find(|b| b.hash == hash).cloned(),
        })
    }

    async fn best_head(&self) -> EngineResult<ChainBlock> {
        let mut state = self.state.lock().unwrap();
        if state.grow_on_head {
            Self::mine_locked(&mut state, Vec::new());
        }
        Ok(state.blocks.last().cloned().unwrap())
    }

    async fn finalized_head(&self) -> EngineResult<ChainBlock> {
        let state = self.state.lock().unwrap();
        Ok(state.blocks[state.finalized as usize].clone())
    }

    async fn pending_transactions(&self) -> EngineResult<Vec<TxHash>> {
        let state = self.state.lock().unwrap();
        if state.hide_pending_listing {
            return Ok(Vec::new());
        }
        Ok(state.pool.clone())
    }

    async fn is_known(&self, tx_hash: &TxHash) -> EngineResult<bool> {
        let state = self.state.lock().unwrap();
        Ok(state.pool.contains(tx_hash) || state.blocks.iter().any(|b| b.transactions.contains(tx_hash)))
    }

    async fn block_events(&self, block: &ChainBlock, _tx_hash: &TxHash) -> EngineResult<Vec<RawEvent>> {
        let state = self.state.lock().unwrap();
        if state.events_unavailable {
            return Err(EngineError::rpc("fake", "block receipts unavailable"));
        }
        Ok(state.events.get(&block.hash).cloned().unwrap_or_default())
    }
}

/// Deterministic signer: payload = request id ++ nonce, unique per attempt
#[derive(Default)]
pub struct FakeSigner {
    pub signed: AtomicUsize,
    errors: Mutex<VecDeque<EngineError>>,
}

impl FakeSigner {
    pub fn failing(errors: Vec<EngineError>) -> Self {
        Self {
            signed: AtomicUsize::new(0),
            errors: Mutex::new(errors.into()),
        }
    }
}

#[async_trait]
impl TxSigner for FakeSigner {
    async fn sign(&self, request: &TransactionRequest, params: &SignParams) -> EngineResult<SignedPayload> {
        if let Some(error) = self.errors.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.signed.fetch_add(1, Ordering::SeqCst);

        let mut bytes = request.id().as_bytes().to_vec();
        bytes.extend_from_slice(&params.nonce.to_le_bytes());
        Ok(match request.family() {
            ChainFamily::Substrate => SignedPayload::substrate(bytes.into()),
            ChainFamily::Evm => SignedPayload::evm(bytes.into()),
        })
    }
}
