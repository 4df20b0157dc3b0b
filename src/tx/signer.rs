//! Signer capability
//!
//! The engine never holds keys itself; it hands an unsigned request and the
//! per-attempt parameters to a [`TxSigner`] and gets opaque bytes back.

use crate::error::{EngineError, EngineResult};
use crate::tx::types::{CallPayload, FeeFields, SignParams, SignedPayload, TransactionRequest};

use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Eip1559TransactionRequest, TransactionRequest as LegacyTransactionRequest};
use std::str::FromStr;
use tracing::debug;

#[async_trait]
pub trait TxSigner: Send + Sync {
    async fn sign(&self, request: &TransactionRequest, params: &SignParams) -> EngineResult<SignedPayload>;
}

/// Signs EVM transactions with an in-process private key
pub struct LocalEvmSigner {
    wallet: LocalWallet,
}

impl LocalEvmSigner {
    pub fn from_private_key(key: &str) -> EngineResult<Self> {
        let wallet = key
            .parse::<LocalWallet>()
            .map_err(|e| EngineError::Config(format!("Invalid private key: {}", e)))?;
        Ok(Self { wallet })
    }

    /// Load the key from an environment variable
    pub fn from_env(var: &str) -> EngineResult<Self> {
        let key = std::env::var(var)
            .map_err(|_| EngineError::Config(format!("No signing key configured. Set {}", var)))?;
        Self::from_private_key(&key)
    }

    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    fn build(request: &TransactionRequest, params: &SignParams, from: Address) -> EngineResult<TypedTransaction> {
        let (to, data, value) = match request.payload() {
            CallPayload::Evm { to, data, value } => (*to, data.clone(), *value),
            CallPayload::Substrate { .. } => {
                return Err(EngineError::Signing(
                    "substrate payload given to an EVM signer".to_string(),
                ))
            }
        };
        let chain_id = params
            .chain_id
            .ok_or_else(|| EngineError::Signing("missing chain id".to_string()))?;

        let tx = match &params.fee.fields {
            FeeFields::Legacy { gas_price } => TypedTransaction::Legacy(
                LegacyTransactionRequest::new()
                    .from(from)
                    .to(to)
                    .data(data)
                    .value(value)
                    .nonce(params.nonce)
                    .gas(params.fee.compute_limit)
                    .gas_price(*gas_price)
                    .chain_id(chain_id),
            ),
            FeeFields::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => TypedTransaction::Eip1559(
                Eip1559TransactionRequest::new()
                    .from(from)
                    .to(to)
                    .data(data)
                    .value(value)
                    .nonce(params.nonce)
                    .gas(params.fee.compute_limit)
                    .max_fee_per_gas(*max_fee_per_gas)
                    .max_priority_fee_per_gas(*max_priority_fee_per_gas)
                    .chain_id(chain_id),
            ),
            FeeFields::Substrate { .. } => {
                return Err(EngineError::Signing(
                    "substrate fee fields given to an EVM signer".to_string(),
                ))
            }
        };
        Ok(tx)
    }
}

#[async_trait]
impl TxSigner for LocalEvmSigner {
    async fn sign(&self, request: &TransactionRequest, params: &SignParams) -> EngineResult<SignedPayload> {
        let requested = Address::from_str(request.address())
            .map_err(|_| EngineError::Validation(format!("invalid address format: {}", request.address())))?;
        if requested != self.wallet.address() {
            return Err(EngineError::Signing(format!(
                "unauthorized: signer holds {:?}, request is for {:?}",
                self.wallet.address(),
                requested
            )));
        }

        let tx = Self::build(request, params, requested)?;
        let chain_id = tx.chain_id().map(|id| id.as_u64()).unwrap_or_default();
        let wallet = self.wallet.clone().with_chain_id(chain_id);

        let signature = wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| EngineError::Signing(e.to_string()))?;
        let payload = SignedPayload::evm(tx.rlp_signed(&signature));

        debug!(nonce = params.nonce, tx_hash = %payload.hash, "Signed {}", request.label());
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::types::{evm_tx_hash, Call, ChainFamily, Confidence, Era, FeeEstimate};
    use ethers::types::U256;

    // Well-known development key
    const DEV_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const DEV_ADDR: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";

    fn params(fields: FeeFields) -> SignParams {
        SignParams {
            nonce: 7,
            fee: FeeEstimate {
                compute_limit: U256::from(100_000u64),
                total_cost: U256::zero(),
                fields,
                confidence: Confidence::High,
            },
            chain_id: Some(1287),
            era: Era::Immortal,
        }
    }

    fn request(address: &str) -> TransactionRequest {
        TransactionRequest::from_call(
            ChainFamily::Evm,
            address,
            Call::evm("sbt.mint", Address::repeat_byte(0x11), vec![0xde, 0xad]),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_signs_eip1559_transaction() {
        let signer = LocalEvmSigner::from_private_key(DEV_KEY).unwrap();
        assert_eq!(signer.address(), Address::from_str(DEV_ADDR).unwrap());

        let payload = signer
            .sign(
                &request(DEV_ADDR),
                &params(FeeFields::Eip1559 {
                    max_fee_per_gas: U256::from(2_000_000_000u64),
                    max_priority_fee_per_gas: U256::from(1_000_000_000u64),
                }),
            )
            .await
            .unwrap();

        assert_eq!(payload.bytes[0], 0x02);
        assert_eq!(payload.hash, evm_tx_hash(&payload.bytes));
    }

    #[tokio::test]
    async fn test_signs_legacy_transaction() {
        let signer = LocalEvmSigner::from_private_key(DEV_KEY).unwrap();
        let payload = signer
            .sign(
                &request(DEV_ADDR),
                &params(FeeFields::Legacy {
                    gas_price: U256::from(1_000_000_000u64),
                }),
            )
            .await
            .unwrap();

        // Legacy RLP is a list, not a typed envelope
        assert!(payload.bytes[0] >= 0xc0);
    }

    #[tokio::test]
    async fn test_rejects_foreign_account() {
        let signer = LocalEvmSigner::from_private_key(DEV_KEY).unwrap();
        let err = signer
            .sign(
                &request("0x0000000000000000000000000000000000000001"),
                &params(FeeFields::Legacy {
                    gas_price: U256::one(),
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Signing(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_invalid_key_is_config_error() {
        assert!(matches!(
            LocalEvmSigner::from_private_key("not-a-key"),
            Err(EngineError::Config(_))
        ));
    }
}
