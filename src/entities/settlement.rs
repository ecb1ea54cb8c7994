// 🧾 Settlement Entities - what a processor reports it paid out

use super::Processor;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One line/entry of a processor report, normalized to a canonical shape.
///
/// `wakala_transaction_id` is `None` until the match step links it. Once set
/// it is never cleared (the store only writes the link while it is NULL).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementRecord {
    /// Deterministic: derived from processor reference + row position
    pub id: String,
    pub report_id: String,
    pub processor: Processor,
    pub processor_transaction_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wakala_transaction_id: Option<String>,

    pub gross_amount: f64,
    pub fee_amount: f64,
    pub net_amount: f64,
    pub currency: String,
    pub usd_gross_amount: f64,
    pub usd_net_amount: f64,
    pub settlement_date: DateTime<Utc>,
    pub batch_id: String,
}

impl SettlementRecord {
    pub fn is_matched(&self) -> bool {
        self.wakala_transaction_id.is_some()
    }
}

/// Metadata for one ingested file. `file_hash` is the idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementReport {
    pub id: String,
    pub processor: Processor,
    pub report_date: DateTime<Utc>,
    pub batch_id: String,
    pub file_hash: String,
    pub record_count: usize,
    pub ingested_at: DateTime<Utc>,
}
