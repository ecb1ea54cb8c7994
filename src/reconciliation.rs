// ⚖️ Reconciliation Engine - settlement records vs. recorded transactions
//
// A full run is a fixed pipeline, each step completing before the next:
//   1. clear      - discrepancies are a derived view, dropped wholesale
//   2. match      - link unmatched settlements by (processor, reference)
//   3. missing    - captured transactions past the settlement window
//   4. mismatch   - matched pairs whose gross USD differs beyond tolerance
//   5. orphaned   - settlements still unmatched after step 2
//
// Steps 3-5 rebuild the same set from unchanged state. Step 2 only touches
// records that are still unmatched, so earlier links are never revisited.
//
// The whole pipeline runs under the `reconciliation` lock row, so runs from
// different handles or processes on one database never interleave.

use crate::config::ReconciliationConfig;
use crate::entities::{Discrepancy, DiscrepancyType, SettlementRecord, Severity, Transaction};
use crate::error::{ReconciliationError, StoreError, StoreResult};
use crate::store::{ReconciliationStore, RunLockStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::{Duration as StdDuration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lock row held for the duration of a full run
pub const RUN_LOCK_NAME: &str = "reconciliation";

const LOCK_POLL_INTERVAL: StdDuration = StdDuration::from_millis(25);

/// Relative gross difference at or under which a pair is a clean match
pub const RELATIVE_TOLERANCE: f64 = 0.005;

/// Absolute USD difference under which a pair is a clean match
pub const ABSOLUTE_TOLERANCE_USD: f64 = 0.10;

// ============================================================================
// RECONCILIATION RESULT
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationResult {
    pub matched_count: usize,

    /// Records left unmatched because several transactions share their reference
    pub ambiguous_references: usize,
    pub missing_settlements: usize,
    pub amount_mismatches: usize,
    pub orphaned_settlements: usize,
    pub total_discrepancies: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct MatchOutcome {
    matched: usize,
    ambiguous: usize,
}

/// Gross difference between a settlement and its transaction
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AmountGap {
    /// Signed: actual - expected
    pub difference: f64,
    pub absolute: f64,
    pub relative: f64,
}

impl AmountGap {
    pub fn between(expected_usd: f64, actual_usd: f64) -> Self {
        let difference = actual_usd - expected_usd;
        let absolute = difference.abs();
        let relative = if expected_usd > 0.0 {
            absolute / expected_usd
        } else if absolute > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        AmountGap {
            difference,
            absolute,
            relative,
        }
    }

    /// Either tolerance gate suppresses the mismatch
    pub fn within_tolerance(&self) -> bool {
        self.relative <= RELATIVE_TOLERANCE || self.absolute < ABSOLUTE_TOLERANCE_USD
    }
}

// ============================================================================
// SCORING
// ============================================================================

/// How closely a settlement's gross matches its transaction (0.0 - 1.0).
/// Gross, not net: fee deduction is expected and costs no confidence.
pub fn confidence_score(expected_usd: f64, gross_usd: f64) -> f64 {
    if expected_usd == 0.0 {
        return 0.5;
    }
    let pct = (expected_usd - gross_usd).abs() / expected_usd;

    if pct <= 0.001 {
        1.0
    } else if pct <= 0.01 {
        0.95
    } else if pct <= 0.02 {
        0.90
    } else if pct <= 0.05 {
        0.80
    } else {
        0.60
    }
}

pub fn missing_settlement_severity(usd_amount: f64) -> Severity {
    if usd_amount > 500.0 {
        Severity::High
    } else if usd_amount >= 100.0 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

pub fn mismatch_severity(gap: &AmountGap) -> Severity {
    if gap.absolute >= 500.0 {
        Severity::Critical
    } else if gap.relative > 0.02 {
        Severity::High
    } else {
        Severity::Medium
    }
}

// ============================================================================
// RECONCILIATION ENGINE
// ============================================================================

/// Held run lock, released on drop
struct RunLock<'s, S: RunLockStore + ?Sized> {
    store: &'s S,
    owner: String,
}

impl<S: RunLockStore + ?Sized> Drop for RunLock<'_, S> {
    fn drop(&mut self) {
        if let Err(err) = self.store.release_lock(RUN_LOCK_NAME, &self.owner) {
            warn!(owner = %self.owner, error = %err, "failed to release run lock");
        }
    }
}

/// Stateless between runs; all state lives in the store.
///
/// A second caller on the same database waits up to `lock_timeout` for the
/// running pass to finish its clear-then-rebuild.
pub struct ReconciliationEngine<'a, S: ReconciliationStore + ?Sized> {
    store: &'a S,
    config: ReconciliationConfig,
}

impl<'a, S: ReconciliationStore + ?Sized> ReconciliationEngine<'a, S> {
    pub fn new(store: &'a S, config: ReconciliationConfig) -> Self {
        ReconciliationEngine { store, config }
    }

    pub fn config(&self) -> &ReconciliationConfig {
        &self.config
    }

    pub fn run_full_reconciliation(&self) -> Result<ReconciliationResult, ReconciliationError> {
        self.run_full_reconciliation_at(Utc::now())
    }

    /// Full pass with an explicit clock
    pub fn run_full_reconciliation_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<ReconciliationResult, ReconciliationError> {
        let _lock = self.acquire_run_lock()?;

        let cleared = self
            .store
            .clear_discrepancies()
            .map_err(ReconciliationError::Clear)?;
        debug!(cleared, "cleared previous discrepancies");

        let outcome = self
            .match_settlements()
            .map_err(ReconciliationError::Match)?;
        let missing = self
            .detect_missing_settlements(now)
            .map_err(ReconciliationError::DetectMissing)?;
        let mismatches = self
            .detect_amount_mismatches(now)
            .map_err(ReconciliationError::DetectMismatches)?;
        let orphaned = self
            .detect_orphaned_settlements(now)
            .map_err(ReconciliationError::DetectOrphaned)?;

        let result = ReconciliationResult {
            matched_count: outcome.matched,
            ambiguous_references: outcome.ambiguous,
            missing_settlements: missing,
            amount_mismatches: mismatches,
            orphaned_settlements: orphaned,
            total_discrepancies: missing + mismatches + orphaned,
        };

        info!(
            matched = result.matched_count,
            ambiguous = result.ambiguous_references,
            missing = result.missing_settlements,
            mismatches = result.amount_mismatches,
            orphaned = result.orphaned_settlements,
            "reconciliation complete"
        );

        Ok(result)
    }

    fn acquire_run_lock(&self) -> Result<RunLock<'a, S>, ReconciliationError> {
        let owner = Uuid::new_v4().simple().to_string();
        let started = Instant::now();

        loop {
            // Wall clock, not the injected `now`: staleness is about real time
            let wall = Utc::now();
            let acquired = self
                .store
                .try_acquire_lock(
                    RUN_LOCK_NAME,
                    &owner,
                    wall,
                    wall - self.config.stale_lock_after,
                )
                .map_err(ReconciliationError::Lock)?;

            if acquired {
                debug!(%owner, "acquired run lock");
                return Ok(RunLock {
                    store: self.store,
                    owner,
                });
            }

            let waited = started.elapsed();
            if waited >= self.config.lock_timeout {
                return Err(ReconciliationError::Busy { waited });
            }
            thread::sleep(LOCK_POLL_INTERVAL);
        }
    }

    fn match_settlements(&self) -> StoreResult<MatchOutcome> {
        let mut outcome = MatchOutcome::default();

        for rec in self.store.unmatched_records()? {
            let txn = match self
                .store
                .transaction_by_processor_ref(rec.processor, &rec.processor_transaction_id)
            {
                Ok(Some(txn)) => txn,
                Ok(None) => continue,
                Err(err @ StoreError::AmbiguousReference { .. }) => {
                    warn!(record = %rec.id, error = %err, "leaving settlement unmatched");
                    outcome.ambiguous += 1;
                    continue;
                }
                Err(err) => return Err(err),
            };

            if !self.store.link_record(&rec.id, &txn.id)? {
                continue;
            }
            self.store
                .mark_transaction_settled(&txn.id, rec.settlement_date)?;

            debug!(
                reference = %rec.processor_transaction_id,
                transaction = %txn.id,
                confidence = confidence_score(txn.usd_amount, rec.usd_gross_amount),
                gross_usd_diff = (txn.usd_amount - rec.usd_gross_amount).abs(),
                "matched settlement"
            );
            outcome.matched += 1;
        }

        Ok(outcome)
    }

    fn detect_missing_settlements(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let cutoff = now - self.config.settlement_window;

        let discrepancies: Vec<_> = self
            .store
            .captured_without_settlement(cutoff)?
            .iter()
            .map(|txn| missing_settlement(txn, now))
            .collect();

        self.persist(DiscrepancyType::MissingSettlement, &discrepancies)
    }

    fn detect_amount_mismatches(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let mut discrepancies = Vec::new();

        for rec in self.store.matched_records()? {
            let Some(txn_id) = rec.wakala_transaction_id.as_deref() else {
                continue;
            };
            let Some(txn) = self.store.transaction_by_id(txn_id)? else {
                warn!(record = %rec.id, transaction = txn_id, "linked transaction not found");
                continue;
            };

            let gap = AmountGap::between(txn.usd_amount, rec.usd_gross_amount);
            if gap.within_tolerance() {
                continue;
            }
            discrepancies.push(amount_mismatch(&txn, &rec, &gap, now));
        }

        self.persist(DiscrepancyType::AmountMismatch, &discrepancies)
    }

    fn detect_orphaned_settlements(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let discrepancies: Vec<_> = self
            .store
            .unmatched_records()?
            .iter()
            .map(|rec| orphaned_settlement(rec, now))
            .collect();

        self.persist(DiscrepancyType::OrphanedSettlement, &discrepancies)
    }

    fn persist(&self, kind: DiscrepancyType, discrepancies: &[Discrepancy]) -> StoreResult<usize> {
        if discrepancies.is_empty() {
            return Ok(0);
        }
        let inserted = self.store.insert_discrepancies(discrepancies)?;
        info!(kind = kind.as_str(), count = inserted, "detected discrepancies");
        Ok(inserted)
    }
}

// ============================================================================
// DISCREPANCY BUILDERS
// ============================================================================

fn missing_settlement(txn: &Transaction, now: DateTime<Utc>) -> Discrepancy {
    Discrepancy {
        id: Discrepancy::make_id(DiscrepancyType::MissingSettlement, &txn.id),
        discrepancy_type: DiscrepancyType::MissingSettlement,
        transaction_id: Some(txn.id.clone()),
        settlement_id: None,
        processor: txn.processor,
        expected_usd: txn.usd_amount,
        actual_usd: 0.0,
        difference_usd: txn.usd_amount,
        currency: txn.currency.clone(),
        severity: missing_settlement_severity(txn.usd_amount),
        description: format!(
            "Transaction {} ({:.2} USD) captured but no settlement found from {}",
            txn.id, txn.usd_amount, txn.processor
        ),
        detected_at: now,
    }
}

fn amount_mismatch(
    txn: &Transaction,
    rec: &SettlementRecord,
    gap: &AmountGap,
    now: DateTime<Utc>,
) -> Discrepancy {
    Discrepancy {
        id: Discrepancy::make_id(DiscrepancyType::AmountMismatch, &rec.id),
        discrepancy_type: DiscrepancyType::AmountMismatch,
        transaction_id: Some(txn.id.clone()),
        settlement_id: Some(rec.id.clone()),
        processor: rec.processor,
        expected_usd: txn.usd_amount,
        actual_usd: rec.usd_gross_amount,
        difference_usd: gap.difference,
        currency: rec.currency.clone(),
        severity: mismatch_severity(gap),
        description: format!(
            "Gross amount mismatch for {}: expected {:.2} USD, reported gross {:.2} USD ({:.1}% diff)",
            txn.id,
            txn.usd_amount,
            rec.usd_gross_amount,
            gap.relative * 100.0
        ),
        detected_at: now,
    }
}

fn orphaned_settlement(rec: &SettlementRecord, now: DateTime<Utc>) -> Discrepancy {
    Discrepancy {
        id: Discrepancy::make_id(DiscrepancyType::OrphanedSettlement, &rec.id),
        discrepancy_type: DiscrepancyType::OrphanedSettlement,
        transaction_id: None,
        settlement_id: Some(rec.id.clone()),
        processor: rec.processor,
        expected_usd: 0.0,
        actual_usd: rec.usd_net_amount,
        difference_usd: rec.usd_net_amount,
        currency: rec.currency.clone(),
        severity: Severity::High,
        description: format!(
            "Orphaned settlement {} from {}: {:.2} USD with no matching transaction (proc_ref={})",
            rec.id, rec.processor, rec.usd_net_amount, rec.processor_transaction_id
        ),
        detected_at: now,
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::entities::{Processor, SettlementReport, TransactionStatus};
    use crate::store::{DiscrepancyFilter, DiscrepancyStore, SettlementStore, TransactionStore};
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 20, 12, 0, 0).unwrap()
    }

    fn seed_report(db: &Database, records: &[SettlementRecord]) {
        let report = SettlementReport {
            id: "RPT-T".to_string(),
            processor: Processor::AfriPay,
            report_date: now(),
            batch_id: "B".to_string(),
            file_hash: format!("hash-{}", records.len()),
            record_count: records.len(),
            ingested_at: now(),
        };
        db.insert_report_with_records(&report, records).unwrap();
    }

    fn settlement(id: &str, reference: &str, usd_gross: f64, usd_net: f64) -> SettlementRecord {
        SettlementRecord {
            id: id.to_string(),
            report_id: "RPT-T".to_string(),
            processor: Processor::AfriPay,
            processor_transaction_id: reference.to_string(),
            wakala_transaction_id: None,
            gross_amount: usd_gross * 129.5,
            fee_amount: (usd_gross - usd_net) * 129.5,
            net_amount: usd_net * 129.5,
            currency: "KES".to_string(),
            usd_gross_amount: usd_gross,
            usd_net_amount: usd_net,
            settlement_date: now() - Duration::hours(6),
            batch_id: "B".to_string(),
        }
    }

    fn captured(id: &str, reference: &str, usd: f64, hours_ago: i64) -> Transaction {
        Transaction::captured(
            id,
            Processor::AfriPay,
            reference,
            usd * 129.5,
            usd,
            now() - Duration::hours(hours_ago),
        )
    }

    fn all_discrepancies(db: &Database) -> Vec<Discrepancy> {
        db.list_discrepancies(&DiscrepancyFilter {
            limit: Some(1000),
            ..Default::default()
        })
        .unwrap()
    }

    // ------------------------------------------------------------------
    // Pure scoring
    // ------------------------------------------------------------------

    #[test]
    fn test_confidence_bands() {
        assert_eq!(confidence_score(100.0, 100.05), 1.0);
        assert_eq!(confidence_score(100.0, 100.9), 0.95);
        assert_eq!(confidence_score(100.0, 98.5), 0.90);
        assert_eq!(confidence_score(100.0, 104.0), 0.80);
        assert_eq!(confidence_score(100.0, 120.0), 0.60);
        assert_eq!(confidence_score(0.0, 10.0), 0.5);
    }

    #[test]
    fn test_tolerance_gates() {
        // 0.4% relative: suppressed even though absolute is large
        assert!(AmountGap::between(1000.0, 1004.0).within_tolerance());
        // 10% relative but under 10 cents: suppressed
        assert!(AmountGap::between(0.50, 0.55).within_tolerance());
        // Exactly 0.5%: suppressed
        assert!(AmountGap::between(100.0, 100.5).within_tolerance());
        // Beyond both gates
        assert!(!AmountGap::between(100.0, 101.0).within_tolerance());
        // Zero expected amount with a real difference
        assert!(!AmountGap::between(0.0, 5.0).within_tolerance());
    }

    #[test]
    fn test_mismatch_severity_boundaries() {
        let exactly_500 = AmountGap::between(10_000.0, 10_500.0);
        assert_eq!(mismatch_severity(&exactly_500), Severity::Critical);

        let high = AmountGap::between(23_809.05, 23_809.05 + 499.99);
        assert!(high.relative > 0.02);
        assert_eq!(mismatch_severity(&high), Severity::High);

        let medium = AmountGap::between(1000.0, 1019.0);
        assert_eq!(mismatch_severity(&medium), Severity::Medium);

        let negative = AmountGap::between(1000.0, 400.0);
        assert_eq!(negative.difference, -600.0);
        assert_eq!(mismatch_severity(&negative), Severity::Critical);
    }

    #[test]
    fn test_missing_severity_boundaries() {
        assert_eq!(missing_settlement_severity(500.01), Severity::High);
        assert_eq!(missing_settlement_severity(500.00), Severity::Medium);
        assert_eq!(missing_settlement_severity(100.00), Severity::Medium);
        assert_eq!(missing_settlement_severity(99.99), Severity::Low);
    }

    // ------------------------------------------------------------------
    // Pipeline against an in-memory store
    // ------------------------------------------------------------------

    #[test]
    fn test_match_links_and_settles() {
        let db = Database::open_in_memory().unwrap();
        db.insert_transactions(&[captured("TXN-1", "AP-1", 100.0, 10)]).unwrap();
        seed_report(&db, &[settlement("SR-1", "AP-1", 100.0, 98.5)]);

        let engine = ReconciliationEngine::new(&db, ReconciliationConfig::default());
        let result = engine.run_full_reconciliation_at(now()).unwrap();

        assert_eq!(result.matched_count, 1);
        assert_eq!(result.total_discrepancies, 0);

        let txn = db.transaction_by_id("TXN-1").unwrap().unwrap();
        assert_eq!(txn.status, TransactionStatus::Settled);
        assert_eq!(txn.settled_at, Some(now() - Duration::hours(6)));

        let linked = db.records_for_transaction("TXN-1").unwrap();
        assert_eq!(linked.len(), 1);
        assert_eq!(linked[0].id, "SR-1");
    }

    #[test]
    fn test_fee_deduction_is_not_a_mismatch() {
        let db = Database::open_in_memory().unwrap();
        db.insert_transactions(&[captured("TXN-1", "AP-1", 200.0, 10)]).unwrap();
        // Net is 5% lower than the transaction, gross matches
        seed_report(&db, &[settlement("SR-1", "AP-1", 200.0, 190.0)]);

        let engine = ReconciliationEngine::new(&db, ReconciliationConfig::default());
        let result = engine.run_full_reconciliation_at(now()).unwrap();

        assert_eq!(result.amount_mismatches, 0);
        assert_eq!(db.discrepancy_count().unwrap(), 0);
    }

    #[test]
    fn test_amount_mismatch_recorded() {
        let db = Database::open_in_memory().unwrap();
        db.insert_transactions(&[captured("TXN-1", "AP-1", 353.72, 10)]).unwrap();
        seed_report(&db, &[settlement("SR-1", "AP-1", 368.12, 362.60)]);

        let engine = ReconciliationEngine::new(&db, ReconciliationConfig::default());
        let result = engine.run_full_reconciliation_at(now()).unwrap();
        assert_eq!(result.amount_mismatches, 1);
        assert_eq!(result.total_discrepancies, 1);

        let d = &all_discrepancies(&db)[0];
        assert_eq!(d.id, "DISC-AM-SR-1");
        assert_eq!(d.discrepancy_type, DiscrepancyType::AmountMismatch);
        assert_eq!(d.severity, Severity::High);
        assert_eq!(d.transaction_id.as_deref(), Some("TXN-1"));
        assert_eq!(d.settlement_id.as_deref(), Some("SR-1"));
        assert_eq!(d.expected_usd, 353.72);
        assert_eq!(d.actual_usd, 368.12);
        assert!((d.difference_usd - 14.40).abs() < 1e-9);
        assert_eq!(d.detected_at, now());
    }

    #[test]
    fn test_missing_settlement_window() {
        let db = Database::open_in_memory().unwrap();
        db.insert_transactions(&[
            captured("TXN-OLD", "AP-1", 750.0, 72),
            captured("TXN-FRESH", "AP-2", 750.0, 12),
        ])
        .unwrap();

        let engine = ReconciliationEngine::new(&db, ReconciliationConfig::default());
        let result = engine.run_full_reconciliation_at(now()).unwrap();
        assert_eq!(result.missing_settlements, 1);

        let d = &all_discrepancies(&db)[0];
        assert_eq!(d.id, "DISC-MS-TXN-OLD");
        assert_eq!(d.severity, Severity::High);
        assert_eq!(d.expected_usd, 750.0);
        assert_eq!(d.actual_usd, 0.0);
        assert_eq!(d.settlement_id, None);

        // A shorter window also catches the fresh one
        let engine = ReconciliationEngine::new(&db, ReconciliationConfig::with_window_hours(6));
        let result = engine.run_full_reconciliation_at(now()).unwrap();
        assert_eq!(result.missing_settlements, 2);
        assert_eq!(db.discrepancy_count().unwrap(), 2);
    }

    #[test]
    fn test_orphaned_settlement() {
        let db = Database::open_in_memory().unwrap();
        seed_report(&db, &[settlement("SR-X", "AP-UNKNOWN", 80.0, 78.8)]);

        let engine = ReconciliationEngine::new(&db, ReconciliationConfig::default());
        let result = engine.run_full_reconciliation_at(now()).unwrap();

        assert_eq!(result.matched_count, 0);
        assert_eq!(result.orphaned_settlements, 1);

        let d = &all_discrepancies(&db)[0];
        assert_eq!(d.id, "DISC-OS-SR-X");
        assert_eq!(d.severity, Severity::High);
        assert_eq!(d.expected_usd, 0.0);
        assert_eq!(d.actual_usd, 78.8);
        assert_eq!(d.difference_usd, 78.8);
        assert!(d.description.contains("AP-UNKNOWN"));
    }

    #[test]
    fn test_ambiguous_reference_becomes_orphan() {
        let db = Database::open_in_memory().unwrap();
        db.insert_transactions(&[
            captured("TXN-A", "AP-DUP", 50.0, 1),
            captured("TXN-B", "AP-DUP", 50.0, 1),
        ])
        .unwrap();
        seed_report(&db, &[settlement("SR-1", "AP-DUP", 50.0, 49.0)]);

        let engine = ReconciliationEngine::new(&db, ReconciliationConfig::default());
        let result = engine.run_full_reconciliation_at(now()).unwrap();

        assert_eq!(result.matched_count, 0);
        assert_eq!(result.ambiguous_references, 1);
        assert_eq!(result.orphaned_settlements, 1);
        assert!(db.matched_records().unwrap().is_empty());
    }

    #[test]
    fn test_rerun_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.insert_transactions(&[
            captured("TXN-1", "AP-1", 353.72, 10),
            captured("TXN-2", "AP-MISSING", 120.0, 96),
        ])
        .unwrap();
        seed_report(
            &db,
            &[
                settlement("SR-1", "AP-1", 368.12, 362.60),
                settlement("SR-2", "AP-NOBODY", 15.0, 14.7),
            ],
        );

        let engine = ReconciliationEngine::new(&db, ReconciliationConfig::default());
        let first = engine.run_full_reconciliation_at(now()).unwrap();
        let first_set = all_discrepancies(&db);

        let second = engine.run_full_reconciliation_at(now()).unwrap();
        let second_set = all_discrepancies(&db);

        assert_eq!(first.matched_count, 1);
        // Already-matched pairs are not re-matched
        assert_eq!(second.matched_count, 0);
        assert_eq!(first.total_discrepancies, 3);
        assert_eq!(second.total_discrepancies, first.total_discrepancies);
        assert_eq!(first_set, second_set);

        for result in [&first, &second] {
            assert_eq!(
                result.missing_settlements + result.amount_mismatches + result.orphaned_settlements,
                result.total_discrepancies
            );
        }
    }

    #[test]
    fn test_run_waits_for_held_lock() {
        let db = Database::open_in_memory().unwrap();
        let wall = Utc::now();
        assert!(db
            .try_acquire_lock(RUN_LOCK_NAME, "other-run", wall, wall - Duration::minutes(10))
            .unwrap());

        let config = ReconciliationConfig {
            lock_timeout: StdDuration::from_millis(100),
            ..Default::default()
        };
        let engine = ReconciliationEngine::new(&db, config);
        let err = engine.run_full_reconciliation_at(now()).unwrap_err();
        assert!(matches!(err, ReconciliationError::Busy { .. }));

        db.release_lock(RUN_LOCK_NAME, "other-run").unwrap();
        engine.run_full_reconciliation_at(now()).unwrap();

        // Released after the run
        assert!(db
            .try_acquire_lock(RUN_LOCK_NAME, "next", wall, wall - Duration::minutes(10))
            .unwrap());
    }

    #[test]
    fn test_stale_discrepancies_are_cleared() {
        let db = Database::open_in_memory().unwrap();
        seed_report(&db, &[settlement("SR-1", "AP-LATE", 100.0, 99.0)]);

        let engine = ReconciliationEngine::new(&db, ReconciliationConfig::default());
        assert_eq!(engine.run_full_reconciliation_at(now()).unwrap().orphaned_settlements, 1);

        // The transaction shows up later; the orphan disappears on the next run
        db.insert_transactions(&[captured("TXN-1", "AP-LATE", 100.0, 1)]).unwrap();
        let result = engine.run_full_reconciliation_at(now()).unwrap();

        assert_eq!(result.matched_count, 1);
        assert_eq!(result.total_discrepancies, 0);
        assert_eq!(db.discrepancy_count().unwrap(), 0);
    }
}
