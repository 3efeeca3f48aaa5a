//! Receipt log decoding

use super::abi::{named_values, signature};
use crate::contracts::ContractStore;
use crate::error::{ClientError, ClientResult};

use ethers::abi::{Abi, Event, Param, RawLog};
use ethers::types::{Address, Log, H256, U256};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{trace, warn};

/// A receipt log matched to an ABI event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecodedTransactionLog {
    pub signature: String,
    pub event: String,
    pub address: Address,
    pub topics: Vec<H256>,
    /// Indexed and data fields keyed by parameter name
    pub fields: BTreeMap<String, String>,
    pub block_number: Option<u64>,
    pub index: Option<U256>,
    pub tx_hash: Option<H256>,
    pub tx_index: Option<u64>,
    /// Dropped by a chain reorganisation
    pub removed: bool,
}

/// Decode every log of a receipt that matches a known event
///
/// ABIs are tried in order: the emitting contract, the called contract,
/// then every ABI of the store. Unmatched logs are skipped.
pub fn decode_logs(
    logs: &[Log],
    called_abi: Option<&Arc<Abi>>,
    store: &dyn ContractStore,
) -> Vec<DecodedTransactionLog> {
    let all_abis = store.abis();
    let mut decoded = Vec::new();

    for log in logs {
        let topic = match log.topics.first() {
            Some(topic) => *topic,
            None => continue,
        };

        let emitter_abi = store.find_abi(&log.address).map(|(_, abi)| abi);
        let event = emitter_abi
            .iter()
            .chain(called_abi)
            .chain(all_abis.iter().map(|(_, abi)| abi))
            .find_map(|abi| abi.events().find(|e| e.signature() == topic).cloned());

        let Some(event) = event else {
            trace!(?topic, address = ?log.address, "No ABI event matches log, skipping");
            continue;
        };

        match decode_log(&event, log) {
            Ok(entry) => {
                trace!(event = %entry.event, "Decoded log");
                decoded.push(entry);
            }
            Err(e) => warn!(error = %e, event = %event.name, "Skipping log"),
        }
    }

    decoded
}

/// Unpack topics and data of `log` and merge its metadata
fn decode_log(event: &Event, log: &Log) -> ClientResult<DecodedTransactionLog> {
    let raw = RawLog {
        topics: log.topics.clone(),
        data: log.data.to_vec(),
    };
    let parsed = event
        .parse_log(raw)
        .map_err(|e| ClientError::LogDecode(format!("{}: {}", event.name, e)))?;

    let (names, tokens): (Vec<String>, Vec<_>) =
        parsed.params.into_iter().map(|p| (p.name, p.value)).unzip();

    Ok(DecodedTransactionLog {
        signature: signature(&event.name, &event_params(event)),
        event: event.name.clone(),
        address: log.address,
        topics: log.topics.clone(),
        fields: named_values(names.iter().map(String::as_str), tokens),
        block_number: log.block_number.map(|b| b.as_u64()),
        index: log.log_index,
        tx_hash: log.transaction_hash,
        tx_index: log.transaction_index.map(|i| i.as_u64()),
        removed: log.removed.unwrap_or(false),
    })
}

fn event_params(event: &Event) -> Vec<Param> {
    event
        .inputs
        .iter()
        .map(|input| Param {
            name: input.name.clone(),
            kind: input.kind.clone(),
            internal_type: None,
        })
        .collect()
}
