//! Execution event extraction
//!
//! Maps a block's execution log onto the events emitted by one transaction,
//! normalized to a `{kind, section, payload, index}` shape for both chain
//! families. Substrate events are tied to an extrinsic through their
//! `ApplyExtrinsic` phase; EVM logs through their transaction index.

use crate::chain::{ChainBlock, RawEvent};
use crate::tx::types::TxHash;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Section under which adapters report per-transaction outcome events
pub const SYSTEM_SECTION: &str = "system";
pub const EXTRINSIC_SUCCESS: &str = "ExtrinsicSuccess";
pub const EXTRINSIC_FAILED: &str = "ExtrinsicFailed";

/// Normalized execution event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainEvent {
    /// Event name, e.g. `DidCreated` or an EVM topic
    pub kind: String,
    /// Pallet name on substrate, emitting contract on EVM
    pub section: String,
    pub payload: serde_json::Value,
    /// Position of the event in the block's execution log
    pub index: u32,
}

impl ChainEvent {
    pub fn is_failure(&self) -> bool {
        self.section.eq_ignore_ascii_case(SYSTEM_SECTION) && self.kind == EXTRINSIC_FAILED
    }

    /// Name for metrics and logs
    pub fn name(&self) -> String {
        format!("{}.{}", self.section, self.kind)
    }
}

impl From<&RawEvent> for ChainEvent {
    fn from(raw: &RawEvent) -> Self {
        Self {
            kind: raw.method.clone(),
            section: raw.section.clone(),
            payload: raw.payload.clone(),
            index: raw.index,
        }
    }
}

/// Parses execution logs into per-transaction events
pub struct EventExtractor;

impl EventExtractor {
    /// Events emitted by `tx_hash` within `block`.
    ///
    /// A transaction missing from the block's transaction list yields an empty
    /// list: finality already decided success, so missing events mean the
    /// picture is incomplete, not that the transaction failed.
    pub fn extract(block: &ChainBlock, log: &[RawEvent], tx_hash: &TxHash) -> Vec<ChainEvent> {
        let Some(position) = block.position_of(tx_hash) else {
            debug!(
                "Transaction {} not in block {} ({}), no events extracted",
                tx_hash, block.number, block.hash
            );
            return Vec::new();
        };

        Self::extract_at(log, position)
    }

    /// Events emitted by the transaction at `position` within its block
    pub fn extract_at(log: &[RawEvent], position: u32) -> Vec<ChainEvent> {
        let mut events: Vec<ChainEvent> = log
            .iter()
            .filter(|event| event.tx_index == Some(position))
            .map(ChainEvent::from)
            .collect();
        events.sort_by_key(|event| event.index);
        events
    }

    /// Failure reason, if the outcome events report a failed dispatch
    pub fn failure_reason(events: &[ChainEvent]) -> Option<String> {
        events.iter().find(|event| event.is_failure()).map(|event| {
            event
                .payload
                .get("error")
                .map(|error| match error {
                    serde_json::Value::String(message) => message.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_else(|| "dispatch failed".to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::H256;
    use serde_json::json;

    fn raw(index: u32, tx_index: Option<u32>, section: &str, method: &str) -> RawEvent {
        RawEvent {
            index,
            tx_index,
            section: section.to_string(),
            method: method.to_string(),
            payload: json!({ "index": index }),
        }
    }

    fn block() -> ChainBlock {
        ChainBlock {
            number: 7,
            hash: H256::repeat_byte(7),
            parent_hash: H256::repeat_byte(6),
            transactions: vec![TxHash::new("0x01"), TxHash::new("0x02")],
        }
    }

    fn log() -> Vec<RawEvent> {
        vec![
            raw(0, None, "timestamp", "Set"),
            raw(3, Some(1), SYSTEM_SECTION, EXTRINSIC_SUCCESS),
            raw(1, Some(0), SYSTEM_SECTION, EXTRINSIC_SUCCESS),
            raw(2, Some(1), "did", "DidCreated"),
        ]
    }

    #[test]
    fn test_extracts_events_for_transaction_position() {
        let events = EventExtractor::extract(&block(), &log(), &TxHash::new("0x02"));
        let names: Vec<_> = events.iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["did.DidCreated", "system.ExtrinsicSuccess"]);
        assert_eq!(events[0].index, 2);
    }

    #[test]
    fn test_missing_transaction_yields_empty_list() {
        let events = EventExtractor::extract(&block(), &log(), &TxHash::new("0x99"));
        assert!(events.is_empty());
    }

    #[test]
    fn test_extraction_is_idempotent() {
        let first = EventExtractor::extract(&block(), &log(), &TxHash::new("0x02"));
        let second = EventExtractor::extract(&block(), &log(), &TxHash::new("0x02"));
        assert_eq!(first, second);
    }

    #[test]
    fn test_failure_reason() {
        let mut failed = raw(4, Some(0), SYSTEM_SECTION, EXTRINSIC_FAILED);
        failed.payload = json!({ "error": "Did.AlreadyExists" });
        let events = EventExtractor::extract_at(&[failed], 0);
        assert_eq!(
            EventExtractor::failure_reason(&events).as_deref(),
            Some("Did.AlreadyExists")
        );
        assert!(EventExtractor::failure_reason(&EventExtractor::extract_at(&log(), 0)).is_none());
    }
}
