// 📥 Ingestion - store a processor report, then reconcile
//
// ingest() = hash -> dedupe -> check tags -> parse -> persist -> reconcile
//
// Storage is what makes an ingestion succeed. A failed reconciliation pass is
// reported in the result, never as an error.

use crate::config::ReconciliationConfig;
use crate::currency::CurrencyNormalizer;
use crate::entities::{Processor, SettlementReport};
use crate::error::IngestError;
use crate::parser::{get_parser, ReportFormat};
use crate::reconciliation::{ReconciliationEngine, ReconciliationResult};
use crate::store::ReconciliationStore;
use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

/// Report id returned when the exact same bytes were ingested before
pub const ALREADY_INGESTED: &str = "already-ingested";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReconciliationStatus {
    Completed(ReconciliationResult),
    Failed { error: String },
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestResult {
    pub report_id: String,
    pub records_ingested: usize,
    pub duplicates_skipped: usize,
    pub discrepancies_detected: usize,
    pub reconciliation: ReconciliationStatus,
}

impl IngestResult {
    fn already_ingested() -> Self {
        IngestResult {
            report_id: ALREADY_INGESTED.to_string(),
            records_ingested: 0,
            duplicates_skipped: 0,
            discrepancies_detected: 0,
            reconciliation: ReconciliationStatus::Skipped,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        self.report_id == ALREADY_INGESTED
    }
}

/// SHA-256 of the raw bytes, lowercase hex
pub fn content_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// INGESTION SERVICE
// ============================================================================

pub struct IngestionService<'a, S: ReconciliationStore + ?Sized> {
    store: &'a S,
    normalizer: CurrencyNormalizer,
    engine: ReconciliationEngine<'a, S>,
}

impl<'a, S: ReconciliationStore + ?Sized> IngestionService<'a, S> {
    pub fn new(store: &'a S, normalizer: CurrencyNormalizer, config: ReconciliationConfig) -> Self {
        IngestionService {
            store,
            normalizer,
            engine: ReconciliationEngine::new(store, config),
        }
    }

    pub fn engine(&self) -> &ReconciliationEngine<'a, S> {
        &self.engine
    }

    /// Ingest with string codes, as received from a caller.
    ///
    /// Already-ingested bytes get the sentinel before any tag is looked at.
    pub fn ingest_tagged(
        &self,
        data: &[u8],
        processor: &str,
        format: &str,
    ) -> Result<IngestResult, IngestError> {
        let file_hash = content_hash(data);
        if let Some(skipped) = self.skip_if_ingested(&file_hash)? {
            return Ok(skipped);
        }

        let format: ReportFormat = format.parse().map_err(IngestError::UnknownFormat)?;
        let processor: Processor = processor.parse().map_err(IngestError::UnknownProcessor)?;
        self.store_and_reconcile(data, file_hash, processor, format)
    }

    pub fn ingest(
        &self,
        data: &[u8],
        processor: Processor,
        format: ReportFormat,
    ) -> Result<IngestResult, IngestError> {
        let file_hash = content_hash(data);
        if let Some(skipped) = self.skip_if_ingested(&file_hash)? {
            return Ok(skipped);
        }

        self.store_and_reconcile(data, file_hash, processor, format)
    }

    fn skip_if_ingested(&self, file_hash: &str) -> Result<Option<IngestResult>, IngestError> {
        if self.store.report_exists_by_hash(file_hash)? {
            info!(hash = %file_hash, "report already ingested, skipping");
            return Ok(Some(IngestResult::already_ingested()));
        }
        Ok(None)
    }

    fn store_and_reconcile(
        &self,
        data: &[u8],
        file_hash: String,
        processor: Processor,
        format: ReportFormat,
    ) -> Result<IngestResult, IngestError> {
        // Report and records must agree on the processor
        if format.processor() != processor {
            return Err(IngestError::ProcessorMismatch {
                processor: processor.to_string(),
                format: format.tag(),
            });
        }

        let report_id = format!("RPT-{}-{}", processor, Uuid::new_v4().simple());
        let parser = get_parser(format, &self.normalizer);
        let parsed = parser
            .parse(data, &report_id)
            .map_err(|source| IngestError::Parse {
                format: format.tag(),
                source,
            })?;

        let now = Utc::now();
        let batch_id = if parsed.batch_id.is_empty() {
            format!("BATCH-{}", now.timestamp_nanos_opt().unwrap_or_default())
        } else {
            parsed.batch_id
        };

        let report = SettlementReport {
            id: report_id.clone(),
            processor,
            report_date: parsed.report_date.unwrap_or(now),
            batch_id,
            file_hash,
            record_count: parsed.records.len(),
            ingested_at: now,
        };

        let inserted = self
            .store
            .insert_report_with_records(&report, &parsed.records)?;
        let duplicates = parsed.records.len() - inserted;

        info!(
            report = %report_id,
            parser = parser.version(),
            records = inserted,
            duplicates,
            "settlement report stored"
        );

        let (discrepancies, reconciliation) = match self.engine.run_full_reconciliation() {
            Ok(result) => (result.total_discrepancies, ReconciliationStatus::Completed(result)),
            Err(err) => {
                warn!(report = %report_id, error = %err, "reconciliation after ingest failed");
                (
                    0,
                    ReconciliationStatus::Failed {
                        error: err.to_string(),
                    },
                )
            }
        };

        Ok(IngestResult {
            report_id,
            records_ingested: inserted,
            duplicates_skipped: duplicates,
            discrepancies_detected: discrepancies,
            reconciliation,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::entities::{
        Discrepancy, DiscrepancyType, SettlementRecord, Severity, Transaction, TransactionStatus,
    };
    use crate::error::{StoreError, StoreResult};
    use crate::store::{
        CurrencyVolume, DiscrepancyFilter, DiscrepancyStore, DiscrepancySummary,
        ProcessorDiscrepancyStat, ProcessorVolume, RunLockStore, SettlementFilter,
        SettlementStore, TransactionFilter, TransactionStats, TransactionStore,
    };
    use chrono::{DateTime, Duration};

    const AFRIPAY_CSV: &str = "transaction_id,merchant_ref,settlement_date,gross_amount_kes,fee_kes,net_kes,batch_id
AP-REF-001,M-001,2024-03-15,47671.03,715.07,46955.96,AP-BATCH-7
";

    fn service(db: &Database) -> IngestionService<'_, Database> {
        IngestionService::new(db, CurrencyNormalizer::default(), ReconciliationConfig::default())
    }

    fn seed_afripay_txn(db: &Database) {
        let txn = Transaction::captured(
            "TXN-001",
            Processor::AfriPay,
            "AP-REF-001",
            45_806.74,
            353.72,
            Utc::now() - Duration::hours(2),
        );
        db.insert_transactions(&[txn]).unwrap();
    }

    #[test]
    fn test_content_hash() {
        let hash = content_hash(b"abc");
        assert_eq!(
            hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_ingest_end_to_end_mismatch() {
        let db = Database::open_in_memory().unwrap();
        seed_afripay_txn(&db);

        let result = service(&db)
            .ingest(AFRIPAY_CSV.as_bytes(), Processor::AfriPay, ReportFormat::CsvA)
            .unwrap();

        assert!(result.report_id.starts_with("RPT-afripay-"));
        assert_eq!(result.records_ingested, 1);
        assert_eq!(result.duplicates_skipped, 0);
        assert_eq!(result.discrepancies_detected, 1);
        let ReconciliationStatus::Completed(run) = &result.reconciliation else {
            panic!("expected completed reconciliation, got {:?}", result.reconciliation);
        };
        assert_eq!(run.matched_count, 1);
        assert_eq!(run.amount_mismatches, 1);

        let found = db.list_discrepancies(&DiscrepancyFilter::default()).unwrap();
        assert_eq!(found.len(), 1);
        let d = &found[0];
        assert_eq!(d.discrepancy_type, DiscrepancyType::AmountMismatch);
        assert_eq!(d.severity, Severity::High);
        assert!((d.actual_usd - 368.12).abs() < 0.01);
        assert!((d.difference_usd - 14.40).abs() < 0.01);
        assert!(d.description.contains("4.1% diff"));

        let txn = db.transaction_by_id("TXN-001").unwrap().unwrap();
        assert_eq!(txn.status, TransactionStatus::Settled);

        let reports = db.list_reports().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].batch_id, "AP-BATCH-7");
        assert_eq!(reports[0].record_count, 1);
        assert_eq!(reports[0].file_hash, content_hash(AFRIPAY_CSV.as_bytes()));
    }

    #[test]
    fn test_ingest_same_bytes_twice() {
        let db = Database::open_in_memory().unwrap();
        let svc = service(&db);

        let first = svc
            .ingest(AFRIPAY_CSV.as_bytes(), Processor::AfriPay, ReportFormat::CsvA)
            .unwrap();
        assert!(!first.is_duplicate());
        assert_eq!(first.records_ingested, 1);

        let second = svc
            .ingest(AFRIPAY_CSV.as_bytes(), Processor::AfriPay, ReportFormat::CsvA)
            .unwrap();
        assert!(second.is_duplicate());
        assert_eq!(second.report_id, ALREADY_INGESTED);
        assert_eq!(second.records_ingested, 0);
        assert_eq!(second.reconciliation, ReconciliationStatus::Skipped);
        assert_eq!(db.list_reports().unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_rows_across_files_are_skipped() {
        let db = Database::open_in_memory().unwrap();
        let svc = service(&db);
        svc.ingest(AFRIPAY_CSV.as_bytes(), Processor::AfriPay, ReportFormat::CsvA)
            .unwrap();

        // Different bytes (extra short row), same data row at the same position
        let retried = format!("{AFRIPAY_CSV}AP-TRUNCATED,M-9\n");
        let result = svc
            .ingest(retried.as_bytes(), Processor::AfriPay, ReportFormat::CsvA)
            .unwrap();

        assert!(!result.is_duplicate());
        assert_eq!(result.records_ingested, 0);
        assert_eq!(result.duplicates_skipped, 1);
    }

    #[test]
    fn test_orphan_after_ingest() {
        let db = Database::open_in_memory().unwrap();

        let result = service(&db)
            .ingest(AFRIPAY_CSV.as_bytes(), Processor::AfriPay, ReportFormat::CsvA)
            .unwrap();
        assert_eq!(result.discrepancies_detected, 1);

        let d = &db.list_discrepancies(&DiscrepancyFilter::default()).unwrap()[0];
        assert_eq!(d.discrepancy_type, DiscrepancyType::OrphanedSettlement);
        assert_eq!(d.severity, Severity::High);
        assert!((d.actual_usd - 46_955.96 / 129.5).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_tags() {
        let db = Database::open_in_memory().unwrap();
        let svc = service(&db);

        let err = svc
            .ingest_tagged(AFRIPAY_CSV.as_bytes(), "afripay", "xml_z")
            .unwrap_err();
        assert!(matches!(err, IngestError::UnknownFormat(tag) if tag == "xml_z"));

        let err = svc
            .ingest_tagged(AFRIPAY_CSV.as_bytes(), "paypal", "csv_a")
            .unwrap_err();
        assert!(matches!(err, IngestError::UnknownProcessor(_)));

        assert!(db.list_reports().unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_bytes_win_over_bad_tags() {
        let db = Database::open_in_memory().unwrap();
        let svc = service(&db);
        svc.ingest(AFRIPAY_CSV.as_bytes(), Processor::AfriPay, ReportFormat::CsvA)
            .unwrap();

        // Known bytes short-circuit before the tags are read
        let again = svc
            .ingest_tagged(AFRIPAY_CSV.as_bytes(), "paypal", "xml_z")
            .unwrap();
        assert!(again.is_duplicate());
        assert_eq!(again.reconciliation, ReconciliationStatus::Skipped);

        let again = svc
            .ingest_tagged(AFRIPAY_CSV.as_bytes(), "capepay", "csv_a")
            .unwrap();
        assert!(again.is_duplicate());
        assert_eq!(db.list_reports().unwrap().len(), 1);
    }

    #[test]
    fn test_processor_format_mismatch_is_rejected() {
        let db = Database::open_in_memory().unwrap();
        let svc = service(&db);

        let err = svc
            .ingest(AFRIPAY_CSV.as_bytes(), Processor::CapePay, ReportFormat::CsvA)
            .unwrap_err();
        assert!(matches!(
            &err,
            IngestError::ProcessorMismatch { processor, format: "csv_a" } if processor == "capepay"
        ));

        let err = svc
            .ingest_tagged(AFRIPAY_CSV.as_bytes(), "nairagateway", "csv_a")
            .unwrap_err();
        assert!(matches!(err, IngestError::ProcessorMismatch { .. }));

        assert!(db.list_reports().unwrap().is_empty());
        assert!(db.list_records(&SettlementFilter::default()).unwrap().is_empty());

        // The correct pairing still goes through afterwards
        let ok = svc
            .ingest(AFRIPAY_CSV.as_bytes(), Processor::AfriPay, ReportFormat::CsvA)
            .unwrap();
        assert_eq!(ok.records_ingested, 1);
    }

    #[test]
    fn test_parse_failure_persists_nothing() {
        let db = Database::open_in_memory().unwrap();
        let bad = "transaction_id,merchant_ref,settlement_date,gross_amount_kes,fee_kes,net_kes,batch_id
AP-1,M-1,2024-03-15,not-a-number,1.00,2.00,B1
";
        let err = service(&db)
            .ingest(bad.as_bytes(), Processor::AfriPay, ReportFormat::CsvA)
            .unwrap_err();

        assert!(matches!(err, IngestError::Parse { format: "csv_a", .. }));
        assert!(db.list_reports().unwrap().is_empty());
        assert!(!db.report_exists_by_hash(&content_hash(bad.as_bytes())).unwrap());
    }

    // ------------------------------------------------------------------
    // Reconciliation failure must not fail the ingest
    // ------------------------------------------------------------------

    /// Delegates to a real database but cannot clear discrepancies
    struct BrokenClear(Database);

    impl TransactionStore for BrokenClear {
        fn insert_transactions(&self, t: &[Transaction]) -> StoreResult<usize> {
            self.0.insert_transactions(t)
        }
        fn transaction_by_id(&self, id: &str) -> StoreResult<Option<Transaction>> {
            self.0.transaction_by_id(id)
        }
        fn transaction_by_processor_ref(
            &self,
            p: Processor,
            r: &str,
        ) -> StoreResult<Option<Transaction>> {
            self.0.transaction_by_processor_ref(p, r)
        }
        fn mark_transaction_settled(&self, id: &str, at: DateTime<Utc>) -> StoreResult<()> {
            self.0.mark_transaction_settled(id, at)
        }
        fn captured_without_settlement(&self, c: DateTime<Utc>) -> StoreResult<Vec<Transaction>> {
            self.0.captured_without_settlement(c)
        }
        fn transaction_count(&self) -> StoreResult<usize> {
            self.0.transaction_count()
        }
        fn transaction_stats(&self) -> StoreResult<TransactionStats> {
            self.0.transaction_stats()
        }
        fn list_transactions(&self, f: &TransactionFilter) -> StoreResult<Vec<Transaction>> {
            self.0.list_transactions(f)
        }
        fn count_transactions(&self, f: &TransactionFilter) -> StoreResult<usize> {
            self.0.count_transactions(f)
        }
        fn volume_by_processor(&self) -> StoreResult<Vec<ProcessorVolume>> {
            self.0.volume_by_processor()
        }
        fn volume_by_currency(&self) -> StoreResult<Vec<CurrencyVolume>> {
            self.0.volume_by_currency()
        }
    }

    impl SettlementStore for BrokenClear {
        fn report_exists_by_hash(&self, h: &str) -> StoreResult<bool> {
            self.0.report_exists_by_hash(h)
        }
        fn insert_report_with_records(
            &self,
            r: &SettlementReport,
            recs: &[SettlementRecord],
        ) -> StoreResult<usize> {
            self.0.insert_report_with_records(r, recs)
        }
        fn unmatched_records(&self) -> StoreResult<Vec<SettlementRecord>> {
            self.0.unmatched_records()
        }
        fn matched_records(&self) -> StoreResult<Vec<SettlementRecord>> {
            self.0.matched_records()
        }
        fn link_record(&self, rec: &str, txn: &str) -> StoreResult<bool> {
            self.0.link_record(rec, txn)
        }
        fn records_for_transaction(&self, txn: &str) -> StoreResult<Vec<SettlementRecord>> {
            self.0.records_for_transaction(txn)
        }
        fn list_records(&self, f: &SettlementFilter) -> StoreResult<Vec<SettlementRecord>> {
            self.0.list_records(f)
        }
        fn count_records(&self, f: &SettlementFilter) -> StoreResult<usize> {
            self.0.count_records(f)
        }
        fn list_reports(&self) -> StoreResult<Vec<SettlementReport>> {
            self.0.list_reports()
        }
    }

    impl DiscrepancyStore for BrokenClear {
        fn clear_discrepancies(&self) -> StoreResult<usize> {
            Err(StoreError::Database(rusqlite::Error::InvalidQuery))
        }
        fn insert_discrepancies(&self, d: &[Discrepancy]) -> StoreResult<usize> {
            self.0.insert_discrepancies(d)
        }
        fn list_discrepancies(&self, f: &DiscrepancyFilter) -> StoreResult<Vec<Discrepancy>> {
            self.0.list_discrepancies(f)
        }
        fn count_discrepancies(&self, f: &DiscrepancyFilter) -> StoreResult<usize> {
            self.0.count_discrepancies(f)
        }
        fn discrepancies_for_transaction(&self, txn: &str) -> StoreResult<Vec<Discrepancy>> {
            self.0.discrepancies_for_transaction(txn)
        }
        fn discrepancy_summary(&self) -> StoreResult<DiscrepancySummary> {
            self.0.discrepancy_summary()
        }
        fn discrepancy_stats_by_processor(&self) -> StoreResult<Vec<ProcessorDiscrepancyStat>> {
            self.0.discrepancy_stats_by_processor()
        }
        fn discrepancy_count(&self) -> StoreResult<usize> {
            self.0.discrepancy_count()
        }
    }

    impl RunLockStore for BrokenClear {
        fn try_acquire_lock(
            &self,
            name: &str,
            owner: &str,
            now: DateTime<Utc>,
            stale_before: DateTime<Utc>,
        ) -> StoreResult<bool> {
            self.0.try_acquire_lock(name, owner, now, stale_before)
        }
        fn release_lock(&self, name: &str, owner: &str) -> StoreResult<()> {
            self.0.release_lock(name, owner)
        }
    }

    #[test]
    fn test_reconciliation_failure_is_not_fatal() {
        let store = BrokenClear(Database::open_in_memory().unwrap());
        let svc = IngestionService::new(
            &store,
            CurrencyNormalizer::default(),
            ReconciliationConfig::default(),
        );

        let result = svc
            .ingest(AFRIPAY_CSV.as_bytes(), Processor::AfriPay, ReportFormat::CsvA)
            .unwrap();

        assert_eq!(result.records_ingested, 1);
        assert_eq!(result.discrepancies_detected, 0);
        let ReconciliationStatus::Failed { error } = &result.reconciliation else {
            panic!("expected failed reconciliation");
        };
        assert!(error.starts_with("clear discrepancies"));
        assert_eq!(store.list_reports().unwrap().len(), 1);
    }
}
