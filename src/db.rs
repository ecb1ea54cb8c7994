// 🗄️ SQLite store - transactions, settlement reports/records, discrepancies
//
// Timestamps are written as fixed-width RFC3339 UTC strings so that string
// comparison in SQL matches chronological order.

use crate::entities::{
    Discrepancy, DiscrepancyType, Processor, SettlementRecord, SettlementReport, Severity,
    Transaction, TransactionStatus,
};
use crate::error::{StoreError, StoreResult};
use crate::store::{
    CurrencyVolume, DiscrepancyFilter, DiscrepancyStore, DiscrepancySummary,
    ProcessorDiscrepancyStat, ProcessorVolume, RunLockStore, SettlementFilter, SettlementStore,
    TransactionFilter, TransactionStats, TransactionStore,
};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, Type, ValueRef};
use rusqlite::{
    params, params_from_iter, Connection, OptionalExtension, Row, ToSql, Transaction as SqlTransaction,
    TransactionBehavior,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration as StdDuration;
use tracing::debug;

/// How long a statement waits on another connection's write lock
const BUSY_TIMEOUT: StdDuration = StdDuration::from_secs(5);

// ============================================================================
// DATABASE
// ============================================================================

pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) a file-backed database in WAL mode
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(path = %path.as_ref().display(), journal_mode = %mode, "opened database");

        setup_database(&conn)?;
        Ok(Database { conn })
    }

    /// In-memory database (tests, dry runs)
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        setup_database(&conn)?;
        Ok(Database { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

pub fn setup_database(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS transactions (
            id TEXT PRIMARY KEY,
            processor_reference TEXT NOT NULL,
            processor TEXT NOT NULL,
            merchant_id TEXT NOT NULL DEFAULT '',
            amount REAL NOT NULL,
            currency TEXT NOT NULL,
            usd_amount REAL NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            captured_at TEXT,
            settled_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_transactions_status ON transactions(status);
        CREATE INDEX IF NOT EXISTS idx_transactions_processor_ref
            ON transactions(processor, processor_reference);

        CREATE TABLE IF NOT EXISTS settlement_reports (
            id TEXT PRIMARY KEY,
            processor TEXT NOT NULL,
            report_date TEXT NOT NULL,
            batch_id TEXT NOT NULL,
            file_hash TEXT UNIQUE NOT NULL,
            record_count INTEGER NOT NULL,
            ingested_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS settlement_records (
            id TEXT PRIMARY KEY,
            report_id TEXT NOT NULL,
            processor TEXT NOT NULL,
            processor_transaction_id TEXT NOT NULL,
            wakala_transaction_id TEXT,
            gross_amount REAL NOT NULL,
            fee_amount REAL NOT NULL,
            net_amount REAL NOT NULL,
            currency TEXT NOT NULL,
            usd_gross_amount REAL NOT NULL,
            usd_net_amount REAL NOT NULL,
            settlement_date TEXT NOT NULL,
            batch_id TEXT NOT NULL,
            FOREIGN KEY (report_id) REFERENCES settlement_reports(id)
        );
        CREATE INDEX IF NOT EXISTS idx_settlement_records_report
            ON settlement_records(report_id);
        CREATE INDEX IF NOT EXISTS idx_settlement_records_wakala_txn
            ON settlement_records(wakala_transaction_id);

        CREATE TABLE IF NOT EXISTS discrepancies (
            id TEXT PRIMARY KEY,
            type TEXT NOT NULL,
            transaction_id TEXT,
            settlement_id TEXT,
            processor TEXT NOT NULL,
            expected_usd REAL NOT NULL,
            actual_usd REAL NOT NULL,
            difference_usd REAL NOT NULL,
            currency TEXT NOT NULL,
            severity TEXT NOT NULL,
            description TEXT NOT NULL,
            detected_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_discrepancies_type ON discrepancies(type);
        CREATE INDEX IF NOT EXISTS idx_discrepancies_severity ON discrepancies(severity);
        CREATE INDEX IF NOT EXISTS idx_discrepancies_processor ON discrepancies(processor);
        CREATE INDEX IF NOT EXISTS idx_discrepancies_transaction ON discrepancies(transaction_id);

        CREATE TABLE IF NOT EXISTS run_locks (
            name TEXT PRIMARY KEY,
            owner TEXT NOT NULL,
            acquired_at TEXT NOT NULL
        );",
    )?;

    Ok(())
}

// ============================================================================
// SQL CONVERSIONS
// ============================================================================

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn get_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(idx, &raw)
}

fn get_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| parse_ts(idx, &s)).transpose()
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Enums are stored by their string code
macro_rules! sql_code {
    ($ty:ty) => {
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let code = value.as_str()?;
                <$ty>::from_str(code).map_err(|bad| {
                    FromSqlError::Other(format!("unknown {} code: {}", stringify!($ty), bad).into())
                })
            }
        }
    };
}

sql_code!(Processor);
sql_code!(TransactionStatus);
sql_code!(DiscrepancyType);
sql_code!(Severity);

fn to_count(n: i64) -> usize {
    usize::try_from(n).unwrap_or(0)
}

// ============================================================================
// FILTERS
// ============================================================================

/// `WHERE a = ? AND b >= ? ...` with positional text arguments
#[derive(Default)]
struct SqlFilter {
    clauses: Vec<&'static str>,
    args: Vec<String>,
}

impl SqlFilter {
    fn push(&mut self, clause: &'static str, value: Option<String>) {
        if let Some(value) = value {
            self.clauses.push(clause);
            self.args.push(value);
        }
    }

    fn range(&mut self, column: Column, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) {
        self.push(column.from_clause, from.as_ref().map(ts));
        self.push(column.to_clause, to.as_ref().map(ts));
    }

    fn where_clause(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", self.clauses.join(" AND "))
        }
    }
}

/// Inclusive bounds on one timestamp column
struct Column {
    from_clause: &'static str,
    to_clause: &'static str,
}

const DETECTED_AT: Column = Column {
    from_clause: "detected_at >= ?",
    to_clause: "detected_at <= ?",
};
const CREATED_AT: Column = Column {
    from_clause: "created_at >= ?",
    to_clause: "created_at <= ?",
};
const SETTLEMENT_DATE: Column = Column {
    from_clause: "settlement_date >= ?",
    to_clause: "settlement_date <= ?",
};

fn discrepancy_filter(filter: &DiscrepancyFilter) -> SqlFilter {
    let mut sql = SqlFilter::default();
    sql.push("type = ?", filter.discrepancy_type.map(|t| t.as_str().to_string()));
    sql.push("severity = ?", filter.severity.map(|s| s.as_str().to_string()));
    sql.push("processor = ?", filter.processor.map(|p| p.as_str().to_string()));
    sql.range(DETECTED_AT, filter.from, filter.to);
    sql
}

fn transaction_filter(filter: &TransactionFilter) -> SqlFilter {
    let mut sql = SqlFilter::default();
    sql.push("processor = ?", filter.processor.map(|p| p.as_str().to_string()));
    sql.push("status = ?", filter.status.map(|s| s.as_str().to_string()));
    sql.push("currency = ?", filter.currency.clone());
    sql.range(CREATED_AT, filter.from, filter.to);
    sql
}

fn settlement_filter(filter: &SettlementFilter) -> SqlFilter {
    let mut sql = SqlFilter::default();
    sql.push("processor = ?", filter.processor.map(|p| p.as_str().to_string()));
    sql.range(SETTLEMENT_DATE, filter.from, filter.to);
    sql
}

// ============================================================================
// ROW MAPPERS
// ============================================================================

const TRANSACTION_COLUMNS: &str = "id, processor, processor_reference, merchant_id, amount, currency,
     usd_amount, status, created_at, captured_at, settled_at";

fn transaction_from_row(row: &Row<'_>) -> rusqlite::Result<Transaction> {
    Ok(Transaction {
        id: row.get(0)?,
        processor: row.get(1)?,
        processor_reference: row.get(2)?,
        merchant_id: row.get(3)?,
        amount: row.get(4)?,
        currency: row.get(5)?,
        usd_amount: row.get(6)?,
        status: row.get(7)?,
        created_at: get_ts(row, 8)?,
        captured_at: get_opt_ts(row, 9)?,
        settled_at: get_opt_ts(row, 10)?,
    })
}

const RECORD_COLUMNS: &str = "id, report_id, processor, processor_transaction_id, wakala_transaction_id,
     gross_amount, fee_amount, net_amount, currency, usd_gross_amount, usd_net_amount,
     settlement_date, batch_id";

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<SettlementRecord> {
    Ok(SettlementRecord {
        id: row.get(0)?,
        report_id: row.get(1)?,
        processor: row.get(2)?,
        processor_transaction_id: row.get(3)?,
        wakala_transaction_id: row.get(4)?,
        gross_amount: row.get(5)?,
        fee_amount: row.get(6)?,
        net_amount: row.get(7)?,
        currency: row.get(8)?,
        usd_gross_amount: row.get(9)?,
        usd_net_amount: row.get(10)?,
        settlement_date: get_ts(row, 11)?,
        batch_id: row.get(12)?,
    })
}

const REPORT_COLUMNS: &str =
    "id, processor, report_date, batch_id, file_hash, record_count, ingested_at";

fn report_from_row(row: &Row<'_>) -> rusqlite::Result<SettlementReport> {
    let record_count: i64 = row.get(5)?;
    Ok(SettlementReport {
        id: row.get(0)?,
        processor: row.get(1)?,
        report_date: get_ts(row, 2)?,
        batch_id: row.get(3)?,
        file_hash: row.get(4)?,
        record_count: to_count(record_count),
        ingested_at: get_ts(row, 6)?,
    })
}

const DISCREPANCY_COLUMNS: &str = "id, type, transaction_id, settlement_id, processor, expected_usd,
     actual_usd, difference_usd, currency, severity, description, detected_at";

fn discrepancy_from_row(row: &Row<'_>) -> rusqlite::Result<Discrepancy> {
    Ok(Discrepancy {
        id: row.get(0)?,
        discrepancy_type: row.get(1)?,
        transaction_id: row.get(2)?,
        settlement_id: row.get(3)?,
        processor: row.get(4)?,
        expected_usd: row.get(5)?,
        actual_usd: row.get(6)?,
        difference_usd: row.get(7)?,
        currency: row.get(8)?,
        severity: row.get(9)?,
        description: row.get(10)?,
        detected_at: get_ts(row, 11)?,
    })
}

impl Database {
    fn query_records(&self, where_clause: &str, args: &[&dyn ToSql]) -> StoreResult<Vec<SettlementRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM settlement_records {where_clause} ORDER BY settlement_date, id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let records = stmt
            .query_map(args, record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn count_where(&self, table: &str, filter: &SqlFilter) -> StoreResult<usize> {
        let sql = format!("SELECT COUNT(*) FROM {table} {}", filter.where_clause());
        let count: i64 = self
            .conn
            .query_row(&sql, params_from_iter(&filter.args), |row| row.get(0))?;
        Ok(to_count(count))
    }

    fn group_counts(&self, column: &str) -> StoreResult<BTreeMap<String, usize>> {
        let sql = format!("SELECT {column}, COUNT(*) FROM discrepancies GROUP BY {column}");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| {
                let key: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                Ok((key, to_count(count)))
            })?
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        Ok(rows)
    }
}

// ============================================================================
// TRANSACTIONS
// ============================================================================

impl TransactionStore for Database {
    fn insert_transactions(&self, transactions: &[Transaction]) -> StoreResult<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let mut inserted = 0;

        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO transactions (
                    id, processor, processor_reference, merchant_id, amount, currency,
                    usd_amount, status, created_at, captured_at, settled_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;

            for t in transactions {
                inserted += stmt.execute(params![
                    t.id,
                    t.processor,
                    t.processor_reference,
                    t.merchant_id,
                    t.amount,
                    t.currency,
                    t.usd_amount,
                    t.status,
                    ts(&t.created_at),
                    t.captured_at.as_ref().map(ts),
                    t.settled_at.as_ref().map(ts),
                ])?;
            }
        }

        tx.commit()?;
        Ok(inserted)
    }

    fn transaction_by_id(&self, id: &str) -> StoreResult<Option<Transaction>> {
        let sql = format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = ?1");
        let tx = self
            .conn
            .query_row(&sql, [id], transaction_from_row)
            .optional()?;
        Ok(tx)
    }

    fn transaction_by_processor_ref(
        &self,
        processor: Processor,
        reference: &str,
    ) -> StoreResult<Option<Transaction>> {
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions
             WHERE processor = ?1 AND processor_reference = ?2"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut hits = stmt
            .query_map(params![processor, reference], transaction_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        match hits.len() {
            0 => Ok(None),
            1 => Ok(hits.pop()),
            count => Err(StoreError::AmbiguousReference {
                processor: processor.to_string(),
                reference: reference.to_string(),
                count,
            }),
        }
    }

    fn mark_transaction_settled(&self, id: &str, settled_at: DateTime<Utc>) -> StoreResult<()> {
        self.conn.execute(
            "UPDATE transactions SET status = ?1, settled_at = ?2 WHERE id = ?3",
            params![TransactionStatus::Settled, ts(&settled_at), id],
        )?;
        Ok(())
    }

    fn captured_without_settlement(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<Transaction>> {
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions t
             WHERE t.status = ?1
               AND t.captured_at IS NOT NULL
               AND t.captured_at < ?2
               AND NOT EXISTS (
                   SELECT 1 FROM settlement_records sr WHERE sr.wakala_transaction_id = t.id
               )
             ORDER BY t.created_at, t.id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let txns = stmt
            .query_map(
                params![TransactionStatus::Captured, ts(&cutoff)],
                transaction_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(txns)
    }

    fn transaction_count(&self) -> StoreResult<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM transactions", [], |row| row.get(0))?;
        Ok(to_count(count))
    }

    fn transaction_stats(&self) -> StoreResult<TransactionStats> {
        let stats = self.conn.query_row(
            "SELECT
                COUNT(*),
                COALESCE(SUM(CASE WHEN status = 'captured' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'settled' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status IN ('authorized', 'captured') THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(usd_amount), 0.0),
                COALESCE(SUM(CASE WHEN status = 'settled' THEN usd_amount ELSE 0.0 END), 0.0),
                COALESCE(SUM(CASE WHEN status IN ('authorized', 'captured') THEN usd_amount ELSE 0.0 END), 0.0)
             FROM transactions",
            [],
            |row| {
                Ok(TransactionStats {
                    total: to_count(row.get(0)?),
                    captured: to_count(row.get(1)?),
                    settled: to_count(row.get(2)?),
                    pending_settlement: to_count(row.get(3)?),
                    total_usd: row.get(4)?,
                    settled_usd: row.get(5)?,
                    unsettled_usd: row.get(6)?,
                })
            },
        )?;
        Ok(stats)
    }

    fn list_transactions(&self, filter: &TransactionFilter) -> StoreResult<Vec<Transaction>> {
        let sql_filter = transaction_filter(filter);
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions {}
             ORDER BY created_at DESC, id LIMIT {} OFFSET {}",
            sql_filter.where_clause(),
            filter.effective_limit(),
            filter.offset
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let txns = stmt
            .query_map(params_from_iter(&sql_filter.args), transaction_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(txns)
    }

    fn count_transactions(&self, filter: &TransactionFilter) -> StoreResult<usize> {
        self.count_where("transactions", &transaction_filter(filter))
    }

    fn volume_by_processor(&self) -> StoreResult<Vec<ProcessorVolume>> {
        let mut stmt = self.conn.prepare(
            "SELECT processor,
                    COALESCE(SUM(CASE WHEN status = 'settled' THEN usd_amount ELSE 0.0 END), 0.0)
             FROM transactions GROUP BY processor ORDER BY processor",
        )?;
        let volumes = stmt
            .query_map([], |row| {
                Ok(ProcessorVolume {
                    processor: row.get(0)?,
                    settled_usd: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(volumes)
    }

    fn volume_by_currency(&self) -> StoreResult<Vec<CurrencyVolume>> {
        let mut stmt = self.conn.prepare(
            "SELECT currency,
                    COALESCE(SUM(usd_amount), 0.0),
                    COALESCE(SUM(CASE WHEN status = 'settled' THEN usd_amount ELSE 0.0 END), 0.0)
             FROM transactions GROUP BY currency ORDER BY currency",
        )?;
        let volumes = stmt
            .query_map([], |row| {
                Ok(CurrencyVolume {
                    currency: row.get(0)?,
                    volume_usd: row.get(1)?,
                    settled_volume_usd: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(volumes)
    }
}

// ============================================================================
// SETTLEMENTS
// ============================================================================

impl SettlementStore for Database {
    fn report_exists_by_hash(&self, file_hash: &str) -> StoreResult<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM settlement_reports WHERE file_hash = ?1",
            [file_hash],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn insert_report_with_records(
        &self,
        report: &SettlementReport,
        records: &[SettlementRecord],
    ) -> StoreResult<usize> {
        let tx = self.conn.unchecked_transaction()?;

        tx.execute(
            "INSERT INTO settlement_reports
                (id, processor, report_date, batch_id, file_hash, record_count, ingested_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                report.id,
                report.processor,
                ts(&report.report_date),
                report.batch_id,
                report.file_hash,
                report.record_count as i64,
                ts(&report.ingested_at),
            ],
        )?;

        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO settlement_records (
                    id, report_id, processor, processor_transaction_id, wakala_transaction_id,
                    gross_amount, fee_amount, net_amount, currency, usd_gross_amount,
                    usd_net_amount, settlement_date, batch_id
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            )?;

            for rec in records {
                inserted += stmt.execute(params![
                    rec.id,
                    rec.report_id,
                    rec.processor,
                    rec.processor_transaction_id,
                    rec.wakala_transaction_id,
                    rec.gross_amount,
                    rec.fee_amount,
                    rec.net_amount,
                    rec.currency,
                    rec.usd_gross_amount,
                    rec.usd_net_amount,
                    ts(&rec.settlement_date),
                    rec.batch_id,
                ])?;
            }
        }

        tx.commit()?;
        Ok(inserted)
    }

    fn unmatched_records(&self) -> StoreResult<Vec<SettlementRecord>> {
        self.query_records("WHERE wakala_transaction_id IS NULL", &[])
    }

    fn matched_records(&self) -> StoreResult<Vec<SettlementRecord>> {
        self.query_records("WHERE wakala_transaction_id IS NOT NULL", &[])
    }

    fn link_record(&self, record_id: &str, transaction_id: &str) -> StoreResult<bool> {
        let changed = self.conn.execute(
            "UPDATE settlement_records SET wakala_transaction_id = ?1
             WHERE id = ?2 AND wakala_transaction_id IS NULL",
            params![transaction_id, record_id],
        )?;
        Ok(changed == 1)
    }

    fn records_for_transaction(&self, transaction_id: &str) -> StoreResult<Vec<SettlementRecord>> {
        self.query_records("WHERE wakala_transaction_id = ?1", &[&transaction_id])
    }

    fn list_records(&self, filter: &SettlementFilter) -> StoreResult<Vec<SettlementRecord>> {
        let sql_filter = settlement_filter(filter);
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM settlement_records {}
             ORDER BY settlement_date DESC, id LIMIT {} OFFSET {}",
            sql_filter.where_clause(),
            filter.effective_limit(),
            filter.offset
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let records = stmt
            .query_map(params_from_iter(&sql_filter.args), record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn count_records(&self, filter: &SettlementFilter) -> StoreResult<usize> {
        self.count_where("settlement_records", &settlement_filter(filter))
    }

    fn list_reports(&self) -> StoreResult<Vec<SettlementReport>> {
        let sql = format!("SELECT {REPORT_COLUMNS} FROM settlement_reports ORDER BY ingested_at DESC");
        let mut stmt = self.conn.prepare(&sql)?;
        let reports = stmt
            .query_map([], report_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(reports)
    }
}

// ============================================================================
// DISCREPANCIES
// ============================================================================

impl DiscrepancyStore for Database {
    fn clear_discrepancies(&self) -> StoreResult<usize> {
        Ok(self.conn.execute("DELETE FROM discrepancies", [])?)
    }

    fn insert_discrepancies(&self, discrepancies: &[Discrepancy]) -> StoreResult<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let mut inserted = 0;

        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO discrepancies (
                    id, type, transaction_id, settlement_id, processor, expected_usd,
                    actual_usd, difference_usd, currency, severity, description, detected_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;

            for d in discrepancies {
                inserted += stmt.execute(params![
                    d.id,
                    d.discrepancy_type,
                    d.transaction_id,
                    d.settlement_id,
                    d.processor,
                    d.expected_usd,
                    d.actual_usd,
                    d.difference_usd,
                    d.currency,
                    d.severity,
                    d.description,
                    ts(&d.detected_at),
                ])?;
            }
        }

        tx.commit()?;
        Ok(inserted)
    }

    fn list_discrepancies(&self, filter: &DiscrepancyFilter) -> StoreResult<Vec<Discrepancy>> {
        let sql_filter = discrepancy_filter(filter);
        let sql = format!(
            "SELECT {DISCREPANCY_COLUMNS} FROM discrepancies {}
             ORDER BY detected_at DESC, id LIMIT {} OFFSET {}",
            sql_filter.where_clause(),
            filter.effective_limit(),
            filter.offset
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let discrepancies = stmt
            .query_map(params_from_iter(&sql_filter.args), discrepancy_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(discrepancies)
    }

    fn count_discrepancies(&self, filter: &DiscrepancyFilter) -> StoreResult<usize> {
        self.count_where("discrepancies", &discrepancy_filter(filter))
    }

    fn discrepancies_for_transaction(&self, transaction_id: &str) -> StoreResult<Vec<Discrepancy>> {
        let sql = format!(
            "SELECT {DISCREPANCY_COLUMNS} FROM discrepancies
             WHERE transaction_id = ?1 ORDER BY detected_at DESC, id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let discrepancies = stmt
            .query_map([transaction_id], discrepancy_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(discrepancies)
    }

    fn discrepancy_summary(&self) -> StoreResult<DiscrepancySummary> {
        let (total, impact): (i64, f64) = self.conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(ABS(difference_usd)), 0.0) FROM discrepancies",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let mut stmt = self.conn.prepare(
            "SELECT processor, COALESCE(SUM(ABS(difference_usd)), 0.0)
             FROM discrepancies GROUP BY processor",
        )?;
        let impact_by_processor = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)))?
            .collect::<Result<BTreeMap<_, _>, _>>()?;

        Ok(DiscrepancySummary {
            total_count: to_count(total),
            total_impact_usd: impact,
            by_type: self.group_counts("type")?,
            by_severity: self.group_counts("severity")?,
            by_processor: self.group_counts("processor")?,
            impact_by_processor,
        })
    }

    fn discrepancy_stats_by_processor(&self) -> StoreResult<Vec<ProcessorDiscrepancyStat>> {
        let mut stmt = self.conn.prepare(
            "SELECT processor, COUNT(*), COALESCE(SUM(ABS(difference_usd)), 0.0)
             FROM discrepancies GROUP BY processor ORDER BY processor",
        )?;
        let stats = stmt
            .query_map([], |row| {
                Ok(ProcessorDiscrepancyStat {
                    processor: row.get(0)?,
                    discrepancy_count: to_count(row.get(1)?),
                    impact_usd: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(stats)
    }

    fn discrepancy_count(&self) -> StoreResult<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM discrepancies", [], |row| row.get(0))?;
        Ok(to_count(count))
    }
}

// ============================================================================
// RUN LOCKS
// ============================================================================

impl RunLockStore for Database {
    fn try_acquire_lock(
        &self,
        name: &str,
        owner: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> StoreResult<bool> {
        // IMMEDIATE: take the write lock up front so two handles never both
        // read "free" before either inserts.
        let tx = SqlTransaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;

        let taken_over = tx.execute(
            "DELETE FROM run_locks WHERE name = ?1 AND acquired_at < ?2",
            params![name, ts(&stale_before)],
        )?;
        if taken_over > 0 {
            debug!(lock = name, "removed stale lock");
        }

        let acquired = tx.execute(
            "INSERT OR IGNORE INTO run_locks (name, owner, acquired_at) VALUES (?1, ?2, ?3)",
            params![name, owner, ts(&now)],
        )?;

        tx.commit()?;
        Ok(acquired == 1)
    }

    fn release_lock(&self, name: &str, owner: &str) -> StoreResult<()> {
        let removed = self.conn.execute(
            "DELETE FROM run_locks WHERE name = ?1 AND owner = ?2",
            params![name, owner],
        )?;
        if removed == 1 {
            Ok(())
        } else {
            Err(StoreError::LockLost {
                name: name.to_string(),
                owner: owner.to_string(),
            })
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
