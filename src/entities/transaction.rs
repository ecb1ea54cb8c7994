// 💳 Transaction Entity - internally recorded payment
//
// Identity (id, processor, processor_reference) never changes after seeding.
// Only the reconciliation engine moves status to `settled`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// PROCESSOR
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Processor {
    /// Kenya, KES, comma CSV
    AfriPay,

    /// Nigeria, NGN, JSON
    NairaGateway,

    /// South Africa, ZAR, pipe-delimited CSV
    CapePay,
}

impl Processor {
    pub const ALL: [Processor; 3] = [
        Processor::AfriPay,
        Processor::NairaGateway,
        Processor::CapePay,
    ];

    /// Code used in storage and on the command line
    pub fn as_str(&self) -> &'static str {
        match self {
            Processor::AfriPay => "afripay",
            Processor::NairaGateway => "nairagateway",
            Processor::CapePay => "capepay",
        }
    }

    /// Currency the processor reports in
    pub fn currency(&self) -> &'static str {
        match self {
            Processor::AfriPay => "KES",
            Processor::NairaGateway => "NGN",
            Processor::CapePay => "ZAR",
        }
    }
}

impl fmt::Display for Processor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Processor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Processor::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| s.to_string())
    }
}

// ============================================================================
// TRANSACTION STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Authorized,
    Captured,
    Settled,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Authorized => "authorized",
            TransactionStatus::Captured => "captured",
            TransactionStatus::Settled => "settled",
            TransactionStatus::Failed => "failed",
        }
    }
}

impl FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "authorized" => Ok(TransactionStatus::Authorized),
            "captured" => Ok(TransactionStatus::Captured),
            "settled" => Ok(TransactionStatus::Settled),
            "failed" => Ok(TransactionStatus::Failed),
            other => Err(other.to_string()),
        }
    }
}

// ============================================================================
// TRANSACTION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub processor: Processor,
    pub processor_reference: String,

    #[serde(default)]
    pub merchant_id: String,

    /// Local amount in `currency`
    pub amount: f64,
    pub currency: String,

    /// Canonical amount used for every comparison
    pub usd_amount: f64,

    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captured_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settled_at: Option<DateTime<Utc>>,
}

impl Transaction {
    /// A captured transaction awaiting settlement
    pub fn captured(
        id: &str,
        processor: Processor,
        processor_reference: &str,
        amount: f64,
        usd_amount: f64,
        captured_at: DateTime<Utc>,
    ) -> Self {
        Transaction {
            id: id.to_string(),
            processor,
            processor_reference: processor_reference.to_string(),
            merchant_id: String::new(),
            amount,
            currency: processor.currency().to_string(),
            usd_amount,
            status: TransactionStatus::Captured,
            created_at: captured_at,
            captured_at: Some(captured_at),
            settled_at: None,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.status == TransactionStatus::Settled
    }
}
