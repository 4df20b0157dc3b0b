//! Fee and gas estimation with a conservative fallback

use crate::chain::{ChainClient, FeeQuote};
use crate::config::{ChainConfig, EngineConfig, GasPriceStrategy};
use crate::tx::types::{ChainFamily, Confidence, FeeEstimate, FeeFields, TransactionRequest};

use ethers::types::U256;
use std::sync::Arc;
use tracing::{debug, warn};

/// Fee bump applied after a fee-class rejection, in percent
pub const FEE_BUMP_PERCENT: u64 = 125;

/// Fee estimator for one chain
pub struct FeeEstimator {
    chain: String,
    family: ChainFamily,
    client: Arc<dyn ChainClient>,
    gas_price_strategy: GasPriceStrategy,
    /// Padding applied to live estimates, in percent (120 = 1.2x)
    padding_percent: u64,
    fallback_compute_limit: u64,
    fallback_fee_per_unit: u64,
}

impl FeeEstimator {
    pub fn new(
        chain: &str,
        chain_config: &ChainConfig,
        engine: &EngineConfig,
        client: Arc<dyn ChainClient>,
    ) -> Self {
        Self {
            chain: chain.to_string(),
            family: chain_config.family,
            client,
            gas_price_strategy: chain_config.gas_price_strategy,
            padding_percent: (engine.fee_multiplier * 100.0).round() as u64,
            fallback_compute_limit: engine.fallback_compute_limit,
            fallback_fee_per_unit: engine.fallback_fee_per_unit,
        }
    }

    /// Estimate fees for an unsigned request. Never fails: when the node
    /// cannot quote, configured constants are returned with low confidence.
    pub async fn estimate(&self, request: &TransactionRequest, address: &str) -> FeeEstimate {
        match self.client.estimate_fee(request).await {
            Ok(quote) => {
                let estimate = self.pad(quote);
                debug!(
                    chain = %self.chain,
                    address,
                    compute_limit = %estimate.compute_limit,
                    total_cost = %estimate.total_cost,
                    "Fee estimated"
                );
                estimate
            }
            Err(e) => {
                warn!(
                    chain = %self.chain,
                    address,
                    "Fee estimation failed, using fallback: {}",
                    e
                );
                crate::metrics::record_fee_fallback(&self.chain);
                self.fallback()
            }
        }
    }

    fn padded(&self, value: U256) -> U256 {
        value * U256::from(self.padding_percent) / U256::from(100u64)
    }

    fn pad(&self, quote: FeeQuote) -> FeeEstimate {
        let compute_limit = self.padded(quote.compute_limit);
        let fields = match quote.fields {
            FeeFields::Substrate { partial_fee, tip } => FeeFields::Substrate {
                partial_fee: self.padded(partial_fee),
                tip,
            },
            other => other,
        };
        build(compute_limit, fields, Confidence::High)
    }

    /// Conservative constants used when the node cannot quote
    pub fn fallback(&self) -> FeeEstimate {
        let compute_limit = U256::from(self.fallback_compute_limit);
        let per_unit = U256::from(self.fallback_fee_per_unit);

        let fields = match (self.family, self.gas_price_strategy) {
            (ChainFamily::Substrate, _) => FeeFields::Substrate {
                partial_fee: per_unit,
                tip: U256::zero(),
            },
            (ChainFamily::Evm, GasPriceStrategy::Legacy) => FeeFields::Legacy { gas_price: per_unit },
            (ChainFamily::Evm, GasPriceStrategy::Eip1559) => FeeFields::Eip1559 {
                max_fee_per_gas: per_unit,
                max_priority_fee_per_gas: per_unit / 10,
            },
        };
        build(compute_limit, fields, Confidence::Low)
    }

    /// Raise the price fields of an estimate, e.g. after an underpriced rejection
    pub fn bump(estimate: &FeeEstimate, factor_percent: u64) -> FeeEstimate {
        let factor = U256::from(factor_percent);
        let hundred = U256::from(100u64);

        let fields = match &estimate.fields {
            FeeFields::Legacy { gas_price } => FeeFields::Legacy {
                gas_price: *gas_price * factor / hundred,
            },
            FeeFields::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => FeeFields::Eip1559 {
                max_fee_per_gas: *max_fee_per_gas * factor / hundred,
                max_priority_fee_per_gas: *max_priority_fee_per_gas * factor / hundred,
            },
            // Substrate priority comes from the tip
            FeeFields::Substrate { partial_fee, tip } => FeeFields::Substrate {
                partial_fee: *partial_fee,
                tip: *tip * factor / hundred
                    + *partial_fee * U256::from(factor_percent.saturating_sub(100)) / hundred,
            },
        };
        build(estimate.compute_limit, fields, estimate.confidence)
    }
}

fn build(compute_limit: U256, fields: FeeFields, confidence: Confidence) -> FeeEstimate {
    FeeEstimate {
        total_cost: total_cost(compute_limit, &fields),
        compute_limit,
        fields,
        confidence,
    }
}

/// Calculate the maximum total cost of a transaction
pub fn total_cost(compute_limit: U256, fields: &FeeFields) -> U256 {
    match fields {
        FeeFields::Legacy { gas_price } => compute_limit * *gas_price,
        FeeFields::Eip1559 { max_fee_per_gas, .. } => compute_limit * *max_fee_per_gas,
        FeeFields::Substrate { partial_fee, tip } => *partial_fee + *tip,
    }
}
