//! ABI-based event/call decoder. Signatures are compiled once
//! at startup into selector-keyed lookup tables; a decode failure is
//! logged and counted, never escalated.

use std::collections::HashMap;

use alloy_dyn_abi::{DynSolValue, EventExt};
use alloy_json_abi::Event as AbiEvent;
use alloy_primitives::B256;
use tracing::debug;

use crate::types::{ChainId, RawLog};

/// Compiled decoder: one `alloy_json_abi::Event` per `(chain_id, topic0)`,
/// built at startup from each source's `event_signatures`.
#[derive(Debug, Default)]
pub struct EventDecoder {
    by_topic0: HashMap<(ChainId, B256), AbiEvent>,
}

impl EventDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a human-readable event signature (e.g.
    /// `"Transfer(address indexed from, address indexed to, uint256 value)"`)
    /// for a chain. Returns an error string on unparseable signatures,
    /// these are configuration errors, surfaced at startup, not at decode
    /// time.
    pub fn register(&mut self, chain_id: ChainId, signature: &str) -> Result<(), String> {
        let event: AbiEvent = signature.parse().map_err(|e| format!("invalid event signature `{signature}`: {e}"))?;
        let topic0 = event.selector();
        self.by_topic0.insert((chain_id, topic0), event);
        Ok(())
    }

    /// Decode a raw log's topics/data into a JSON object keyed by
    /// parameter name. Returns `None` (never an error) if no signature is
    /// registered for this topic0 or decoding otherwise fails: a decode
    /// failure is skip-on-error, never fatal.
    pub fn decode_log(&self, chain_id: ChainId, log: &RawLog, source_name: &str) -> Option<serde_json::Value> {
        let topic0 = *log.topics.first()?;
        let event = self.by_topic0.get(&(chain_id, topic0))?;

        match event.decode_log_parts(log.topics.iter().copied(), &log.data) {
            Ok(decoded) => {
                let mut obj = serde_json::Map::new();
                for (param, value) in event.inputs.iter().zip(decoded.indexed.iter().chain(decoded.body.iter())) {
                    obj.insert(param.name.clone(), sol_value_to_json(value));
                }
                Some(serde_json::Value::Object(obj))
            }
            Err(err) => {
                debug!(source = source_name, %err, "log decode failed, skipping");
                crate::metrics::increment_decode_errors(source_name);
                None
            }
        }
    }
}

fn sol_value_to_json(value: &DynSolValue) -> serde_json::Value {
    match value {
        DynSolValue::Bool(b) => serde_json::Value::Bool(*b),
        DynSolValue::Address(a) => serde_json::Value::String(a.to_string()),
        DynSolValue::Uint(v, _) | DynSolValue::Int(v, _) => serde_json::Value::String(v.to_string()),
        DynSolValue::FixedBytes(b, _) | DynSolValue::Bytes(b) => serde_json::Value::String(format!("0x{}", hex::encode(b))),
        DynSolValue::String(s) => serde_json::Value::String(s.clone()),
        DynSolValue::Array(items) | DynSolValue::FixedArray(items) => {
            serde_json::Value::Array(items.iter().map(sol_value_to_json).collect())
        }
        DynSolValue::Tuple(items) => serde_json::Value::Array(items.iter().map(sol_value_to_json).collect()),
        other => serde_json::Value::String(format!("{other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Address, B256};

    #[test]
    fn unregistered_topic_returns_none_without_panicking() {
        let decoder = EventDecoder::new();
        let log = RawLog {
            chain_id: 1,
            block_number: 1,
            transaction_index: 0,
            log_index: 0,
            address: Address::ZERO,
            topics: vec![B256::repeat_byte(0xFF)],
            data: vec![],
        };
        assert!(decoder.decode_log(1, &log, "unknown").is_none());
    }

    #[test]
    fn register_rejects_malformed_signatures() {
        let mut decoder = EventDecoder::new();
        assert!(decoder.register(1, "not an event signature").is_err());
    }

    #[test]
    fn register_accepts_a_well_formed_signature() {
        let mut decoder = EventDecoder::new();
        assert!(decoder
            .register(1, "Transfer(address indexed from, address indexed to, uint256 value)")
            .is_ok());
    }
}
