//! Runtime variants and submission strategies
//!
//! A substrate runtime is probed once at connection time and resolved to one
//! of two call layouts. Everything downstream talks to the resulting
//! [`SubmissionStrategy`] and never inspects the runtime again.

use super::scale::encode_compact;
use crate::config::ChainConfig;
use crate::error::{EngineError, EngineResult};
use crate::tx::types::{Call, ChainFamily, Era, TransactionRequest};

use tracing::debug;

/// `utility.batch_all` call index within the utility pallet
const BATCH_ALL_CALL_INDEX: u8 = 2;

/// Substrate runtime generations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeVariant {
    /// Older runtime: immortal transactions
    Legacy,
    /// Current runtime: mortal transactions
    Current,
}

impl RuntimeVariant {
    /// Resolve the variant from the runtime spec version
    pub fn detect(spec_version: u32, current_from: Option<u32>) -> Self {
        match current_from {
            Some(threshold) if spec_version < threshold => RuntimeVariant::Legacy,
            _ => RuntimeVariant::Current,
        }
    }
}

/// Chain-specific request composition shared by every submission
pub trait SubmissionStrategy: Send + Sync {
    fn family(&self) -> ChainFamily;

    fn variant(&self) -> Option<RuntimeVariant>;

    /// Mortality the signer should use
    fn era(&self) -> Era;

    /// Compose one or more calls into a single atomic request
    fn compose(&self, address: &str, calls: Vec<Call>) -> EngineResult<TransactionRequest>;
}

/// Build the substrate strategy for a probed runtime
pub fn substrate_strategy(config: &ChainConfig, spec_version: u32) -> SubstrateStrategy {
    SubstrateStrategy {
        variant: RuntimeVariant::detect(spec_version, config.current_runtime_spec_version),
        utility_pallet_index: config.utility_pallet_index,
        mortal_era_period: config.mortal_era_period,
    }
}

pub struct SubstrateStrategy {
    variant: RuntimeVariant,
    utility_pallet_index: u8,
    mortal_era_period: u64,
}

impl SubstrateStrategy {
    pub fn new(variant: RuntimeVariant, utility_pallet_index: u8, mortal_era_period: u64) -> Self {
        Self {
            variant,
            utility_pallet_index,
            mortal_era_period,
        }
    }

    fn batch_all(&self, calls: &[Call]) -> Vec<u8> {
        let mut data = vec![self.utility_pallet_index, BATCH_ALL_CALL_INDEX];
        encode_compact(calls.len() as u64, &mut data);
        for call in calls {
            data.extend_from_slice(&call.data);
        }
        data
    }
}

impl SubmissionStrategy for SubstrateStrategy {
    fn family(&self) -> ChainFamily {
        ChainFamily::Substrate
    }

    fn variant(&self) -> Option<RuntimeVariant> {
        Some(self.variant)
    }

    fn era(&self) -> Era {
        match self.variant {
            RuntimeVariant::Legacy => Era::Immortal,
            RuntimeVariant::Current => Era::Mortal {
                period: self.mortal_era_period,
            },
        }
    }

    fn compose(&self, address: &str, mut calls: Vec<Call>) -> EngineResult<TransactionRequest> {
        match calls.len() {
            0 => Err(EngineError::Validation("nothing to submit".to_string())),
            1 => {
                let call = calls.remove(0);
                TransactionRequest::from_call(ChainFamily::Substrate, address, call)
            }
            count => {
                let label = calls
                    .iter()
                    .map(|call| call.label.as_str())
                    .collect::<Vec<_>>()
                    .join("+");
                debug!("Composing {} calls into utility.batch_all: {}", count, label);
                let data = self.batch_all(&calls);
                TransactionRequest::from_call(
                    ChainFamily::Substrate,
                    address,
                    Call::substrate(format!("utility.batch_all({})", label), data),
                )
            }
        }
    }
}

/// EVM chains have no native batching; one call per transaction
pub struct EvmStrategy;

impl SubmissionStrategy for EvmStrategy {
    fn family(&self) -> ChainFamily {
        ChainFamily::Evm
    }

    fn variant(&self) -> Option<RuntimeVariant> {
        None
    }

    fn era(&self) -> Era {
        Era::Immortal
    }

    fn compose(&self, address: &str, mut calls: Vec<Call>) -> EngineResult<TransactionRequest> {
        match calls.len() {
            0 => Err(EngineError::Validation("nothing to submit".to_string())),
            1 => TransactionRequest::from_call(ChainFamily::Evm, address, calls.remove(0)),
            count => Err(EngineError::Validation(format!(
                "EVM chains do not batch natively ({} calls given)",
                count
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::types::CallPayload;
    use ethers::types::Address;

    const ALICE: &str = "5GrwvaEF5zXb26Fz9rcQpDWS57CtERHpNehXCPcNoHGKutQY";

    #[test]
    fn test_variant_detection() {
        assert_eq!(RuntimeVariant::detect(900, Some(1000)), RuntimeVariant::Legacy);
        assert_eq!(RuntimeVariant::detect(1000, Some(1000)), RuntimeVariant::Current);
        assert_eq!(RuntimeVariant::detect(1, None), RuntimeVariant::Current);
    }

    #[test]
    fn test_era_per_variant() {
        let legacy = SubstrateStrategy::new(RuntimeVariant::Legacy, 26, 64);
        let current = SubstrateStrategy::new(RuntimeVariant::Current, 26, 64);
        assert_eq!(legacy.era(), Era::Immortal);
        assert_eq!(current.era(), Era::Mortal { period: 64 });
    }

    #[test]
    fn test_batch_all_encoding() {
        let strategy = SubstrateStrategy::new(RuntimeVariant::Current, 26, 64);
        let request = strategy
            .compose(
                ALICE,
                vec![
                    Call::substrate("did.create", vec![0x40, 0x00]),
                    Call::substrate("did.add_key", vec![0x40, 0x01, 0xff]),
                ],
            )
            .unwrap();

        match request.payload() {
            CallPayload::Substrate { call } => {
                assert_eq!(call.to_vec(), vec![26, 2, 0x08, 0x40, 0x00, 0x40, 0x01, 0xff]);
            }
            other => panic!("unexpected payload {:?}", other),
        }
        assert!(request.label().starts_with("utility.batch_all"));
    }

    #[test]
    fn test_single_call_is_not_wrapped() {
        let strategy = SubstrateStrategy::new(RuntimeVariant::Legacy, 26, 64);
        let request = strategy
            .compose(ALICE, vec![Call::substrate("did.create", vec![0x40, 0x00])])
            .unwrap();
        assert_eq!(
            request.payload(),
            &CallPayload::Substrate {
                call: vec![0x40, 0x00].into()
            }
        );
    }

    #[test]
    fn test_evm_rejects_multi_call_batches() {
        let calls = vec![
            Call::evm("sbt.mint", Address::zero(), vec![1u8]),
            Call::evm("sbt.mint", Address::zero(), vec![2u8]),
        ];
        let err = EvmStrategy
            .compose("0x0000000000000000000000000000000000000001", calls)
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }
}
