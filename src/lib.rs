// Settlement Reconciler - Core Library
// Exposes all modules for use in the CLI and tests

pub mod config;
pub mod currency;
pub mod db;
pub mod entities;
pub mod error;
pub mod ingestion;
pub mod parser;
pub mod reconciliation;
pub mod store;
pub mod views;

// Re-export commonly used types
pub use config::{Config, ReconciliationConfig};
pub use currency::{CurrencyNormalizer, RateTable};
pub use db::{setup_database, Database};
pub use entities::{
    Discrepancy, DiscrepancyType, Processor, SettlementRecord, SettlementReport, Severity,
    Transaction, TransactionStatus,
};
pub use error::{
    CurrencyError, IngestError, ParseError, ReconciliationError, StoreError, StoreResult,
};
pub use ingestion::{
    content_hash, IngestResult, IngestionService, ReconciliationStatus, ALREADY_INGESTED,
};
pub use parser::{
    detect_format, get_parser, AfriPayParser, CapePayParser, NairaGatewayParser, ParsedReport,
    ReportFormat, SettlementParser,
};
pub use reconciliation::{
    confidence_score, mismatch_severity, missing_settlement_severity, AmountGap,
    ReconciliationEngine, ReconciliationResult, RUN_LOCK_NAME,
};
pub use store::{
    CurrencyVolume, DiscrepancyFilter, DiscrepancyStore, DiscrepancySummary,
    ProcessorDiscrepancyStat, ProcessorVolume, ReconciliationStore, RunLockStore,
    SettlementFilter, SettlementStore, TransactionFilter, TransactionStats, TransactionStore,
    DEFAULT_PAGE_LIMIT,
};
pub use views::{dashboard, settlement_status, Dashboard, ProcessorOverview, SettlementStatusView};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
