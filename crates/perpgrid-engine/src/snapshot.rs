/*
[INPUT]:  The slot map deep copy plus coordinator envelope fields
[OUTPUT]: The persisted ledger snapshot with its integrity digest
[POS]:    Persistence layer - the one shape that crosses the store boundary
[UPDATE]: When the envelope grows a field (bump nothing; serde tolerates adds)
*/

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::slot::PersistedSlot;

/// The persisted ledger envelope. Slots are keyed by the canonical
/// decimal-string price so snapshots diff and compare stably.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub slots: BTreeMap<String, PersistedSlot>,
    #[serde(with = "rust_decimal::serde::str")]
    pub last_price: Decimal,
    /// Nanoseconds since the Unix epoch.
    pub last_update_time: i64,
    pub is_risk_triggered: bool,
    /// Hex SHA-256 over the serialized slot map.
    pub checksum: String,
}

impl LedgerSnapshot {
    pub fn new(
        slots: BTreeMap<String, PersistedSlot>,
        last_price: Decimal,
        last_update_time: i64,
        is_risk_triggered: bool,
    ) -> Self {
        let checksum = slots_digest(&slots);
        Self {
            slots,
            last_price,
            last_update_time,
            is_risk_triggered,
            checksum,
        }
    }

    /// True when the embedded checksum matches the slot map.
    pub fn verify(&self) -> bool {
        slots_digest(&self.slots) == self.checksum
    }
}

fn slots_digest(slots: &BTreeMap<String, PersistedSlot>) -> String {
    // BTreeMap iteration is ordered, so the serialization is canonical.
    let serialized = serde_json::to_vec(slots).expect("slot map serializes");
    let mut hasher = Sha256::new();
    hasher.update(&serialized);
    hex::encode(hasher.finalize())
}
