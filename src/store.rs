// Persistence interfaces consumed by ingestion and reconciliation.
//
// Invariants that live here rather than in the engine:
// - a settlement's transaction link is only ever written while it is NULL
// - the discrepancy table is a cache, cleared wholesale before each rebuild
// - one reconciliation run at a time per database, through a lock row

use crate::entities::{
    Discrepancy, DiscrepancyType, Processor, SettlementRecord, SettlementReport, Severity,
    Transaction, TransactionStatus,
};
use crate::error::StoreResult;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

pub trait TransactionStore {
    /// Insert-or-ignore by id. Returns how many rows were new.
    fn insert_transactions(&self, transactions: &[Transaction]) -> StoreResult<usize>;

    fn transaction_by_id(&self, id: &str) -> StoreResult<Option<Transaction>>;

    /// Exact (processor, reference) lookup.
    /// More than one hit is `StoreError::AmbiguousReference`.
    fn transaction_by_processor_ref(
        &self,
        processor: Processor,
        reference: &str,
    ) -> StoreResult<Option<Transaction>>;

    fn mark_transaction_settled(&self, id: &str, settled_at: DateTime<Utc>) -> StoreResult<()>;

    /// Captured before `cutoff` and not linked from any settlement record.
    fn captured_without_settlement(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<Transaction>>;

    fn transaction_count(&self) -> StoreResult<usize>;

    fn transaction_stats(&self) -> StoreResult<TransactionStats>;

    /// Newest first, one page of `filter`
    fn list_transactions(&self, filter: &TransactionFilter) -> StoreResult<Vec<Transaction>>;

    /// Rows matching `filter`, ignoring paging
    fn count_transactions(&self, filter: &TransactionFilter) -> StoreResult<usize>;

    /// Settled USD per processor
    fn volume_by_processor(&self) -> StoreResult<Vec<ProcessorVolume>>;

    /// Total and settled USD per local currency
    fn volume_by_currency(&self) -> StoreResult<Vec<CurrencyVolume>>;
}

pub trait SettlementStore {
    fn report_exists_by_hash(&self, file_hash: &str) -> StoreResult<bool>;

    /// Atomic: the report row and its records commit together.
    /// Records are insert-or-ignore by id; returns how many were new.
    fn insert_report_with_records(
        &self,
        report: &SettlementReport,
        records: &[SettlementRecord],
    ) -> StoreResult<usize>;

    fn unmatched_records(&self) -> StoreResult<Vec<SettlementRecord>>;

    fn matched_records(&self) -> StoreResult<Vec<SettlementRecord>>;

    /// Sets the transaction link if it is still unset. Returns whether it linked.
    fn link_record(&self, record_id: &str, transaction_id: &str) -> StoreResult<bool>;

    fn records_for_transaction(&self, transaction_id: &str) -> StoreResult<Vec<SettlementRecord>>;

    /// Latest settlement date first, one page of `filter`
    fn list_records(&self, filter: &SettlementFilter) -> StoreResult<Vec<SettlementRecord>>;

    fn count_records(&self, filter: &SettlementFilter) -> StoreResult<usize>;

    fn list_reports(&self) -> StoreResult<Vec<SettlementReport>>;
}

pub trait DiscrepancyStore {
    /// Returns how many rows were removed.
    fn clear_discrepancies(&self) -> StoreResult<usize>;

    /// Insert-or-ignore by id, in one batch transaction.
    fn insert_discrepancies(&self, discrepancies: &[Discrepancy]) -> StoreResult<usize>;

    fn list_discrepancies(&self, filter: &DiscrepancyFilter) -> StoreResult<Vec<Discrepancy>>;

    fn count_discrepancies(&self, filter: &DiscrepancyFilter) -> StoreResult<usize>;

    fn discrepancies_for_transaction(&self, transaction_id: &str) -> StoreResult<Vec<Discrepancy>>;

    fn discrepancy_summary(&self) -> StoreResult<DiscrepancySummary>;

    fn discrepancy_stats_by_processor(&self) -> StoreResult<Vec<ProcessorDiscrepancyStat>>;

    fn discrepancy_count(&self) -> StoreResult<usize>;
}

/// Named advisory lock shared by every handle on the same database.
///
/// A holder that crashed leaves its row behind; rows older than
/// `stale_before` are taken over.
pub trait RunLockStore {
    /// Returns whether `owner` now holds `name`.
    fn try_acquire_lock(
        &self,
        name: &str,
        owner: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// `StoreError::LockLost` when `owner` no longer holds `name`.
    fn release_lock(&self, name: &str, owner: &str) -> StoreResult<()>;
}

/// Everything a reconciliation run touches.
pub trait ReconciliationStore:
    TransactionStore + SettlementStore + DiscrepancyStore + RunLockStore
{
}

impl<T> ReconciliationStore for T where
    T: TransactionStore + SettlementStore + DiscrepancyStore + RunLockStore + ?Sized
{
}

// ============================================================================
// QUERY TYPES
// ============================================================================

pub const DEFAULT_PAGE_LIMIT: usize = 50;

fn page_limit(limit: Option<usize>) -> usize {
    match limit {
        Some(0) | None => DEFAULT_PAGE_LIMIT,
        Some(n) => n,
    }
}

/// `from`/`to` bound `detected_at`, both inclusive
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscrepancyFilter {
    pub discrepancy_type: Option<DiscrepancyType>,
    pub severity: Option<Severity>,
    pub processor: Option<Processor>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,

    /// Default 50
    pub limit: Option<usize>,
    pub offset: usize,
}

impl DiscrepancyFilter {
    pub fn effective_limit(&self) -> usize {
        page_limit(self.limit)
    }
}

/// `from`/`to` bound `created_at`, both inclusive
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionFilter {
    pub processor: Option<Processor>,
    pub status: Option<TransactionStatus>,
    pub currency: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl TransactionFilter {
    pub fn effective_limit(&self) -> usize {
        page_limit(self.limit)
    }
}

/// `from`/`to` bound `settlement_date`, both inclusive
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettlementFilter {
    pub processor: Option<Processor>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl SettlementFilter {
    pub fn effective_limit(&self) -> usize {
        page_limit(self.limit)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiscrepancySummary {
    pub total_count: usize,

    /// Sum of |difference_usd|
    pub total_impact_usd: f64,
    pub by_type: BTreeMap<String, usize>,
    pub by_severity: BTreeMap<String, usize>,
    pub by_processor: BTreeMap<String, usize>,
    pub impact_by_processor: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessorVolume {
    pub processor: String,
    pub settled_usd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrencyVolume {
    pub currency: String,
    pub volume_usd: f64,
    pub settled_volume_usd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessorDiscrepancyStat {
    pub processor: String,
    pub discrepancy_count: usize,
    pub impact_usd: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransactionStats {
    pub total: usize,
    pub captured: usize,
    pub settled: usize,

    /// authorized + captured
    pub pending_settlement: usize,
    pub total_usd: f64,
    pub settled_usd: f64,
    pub unsettled_usd: f64,
}
