// ⚠️ Discrepancy Entity - derived inconsistency between books and processor
//
// The whole set is destroyed and recomputed on every reconciliation run.
// Ids are deterministic from the linked record so reruns reproduce them.

use super::Processor;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscrepancyType {
    /// Captured transaction with no settlement after the window
    MissingSettlement,

    /// Settled gross differs from transaction beyond tolerance
    AmountMismatch,

    /// Settlement with no known transaction
    OrphanedSettlement,
}

impl DiscrepancyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscrepancyType::MissingSettlement => "MISSING_SETTLEMENT",
            DiscrepancyType::AmountMismatch => "AMOUNT_MISMATCH",
            DiscrepancyType::OrphanedSettlement => "ORPHANED_SETTLEMENT",
        }
    }

    /// Prefix of the deterministic discrepancy id
    pub fn id_prefix(&self) -> &'static str {
        match self {
            DiscrepancyType::MissingSettlement => "DISC-MS",
            DiscrepancyType::AmountMismatch => "DISC-AM",
            DiscrepancyType::OrphanedSettlement => "DISC-OS",
        }
    }
}

impl FromStr for DiscrepancyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MISSING_SETTLEMENT" => Ok(DiscrepancyType::MissingSettlement),
            "AMOUNT_MISMATCH" => Ok(DiscrepancyType::AmountMismatch),
            "ORPHANED_SETTLEMENT" => Ok(DiscrepancyType::OrphanedSettlement),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOW" => Ok(Severity::Low),
            "MEDIUM" => Ok(Severity::Medium),
            "HIGH" => Ok(Severity::High),
            "CRITICAL" => Ok(Severity::Critical),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discrepancy {
    pub id: String,
    #[serde(rename = "type")]
    pub discrepancy_type: DiscrepancyType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settlement_id: Option<String>,

    pub processor: Processor,
    pub expected_usd: f64,
    pub actual_usd: f64,

    /// Signed
    pub difference_usd: f64,
    pub currency: String,
    pub severity: Severity,
    pub description: String,
    pub detected_at: DateTime<Utc>,
}

impl Discrepancy {
    /// Deterministic id: `<prefix>-<linked record id>`
    pub fn make_id(discrepancy_type: DiscrepancyType, linked_id: &str) -> String {
        format!("{}-{}", discrepancy_type.id_prefix(), linked_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_codes() {
        for t in [
            DiscrepancyType::MissingSettlement,
            DiscrepancyType::AmountMismatch,
            DiscrepancyType::OrphanedSettlement,
        ] {
            assert_eq!(t.as_str().parse::<DiscrepancyType>().unwrap(), t);
            assert_eq!(
                serde_json::to_value(t).unwrap(),
                serde_json::json!(t.as_str())
            );
        }
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
        assert_eq!("CRITICAL".parse::<Severity>().unwrap(), Severity::Critical);
    }

    #[test]
    fn test_make_id() {
        assert_eq!(
            Discrepancy::make_id(DiscrepancyType::OrphanedSettlement, "SR-AP-X-2"),
            "DISC-OS-SR-AP-X-2"
        );
    }
}
