// Entity Models
// The four records the reconciliation pipeline reads and writes:
// - Transaction: internally originated payment (seeded externally)
// - SettlementRecord / SettlementReport: what a processor says it paid out
// - Discrepancy: derived, rebuilt from scratch on every reconciliation run

pub mod transaction;
pub mod settlement;
pub mod discrepancy;

pub use transaction::{Processor, Transaction, TransactionStatus};
pub use settlement::{SettlementRecord, SettlementReport};
pub use discrepancy::{Discrepancy, DiscrepancyType, Severity};
