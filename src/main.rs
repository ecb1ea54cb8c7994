// Settlement Reconciler - CLI
// Thin shell over the library: config from env, output as pretty JSON

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

use settlement_reconciler::{
    dashboard, detect_format, settlement_status, Config, CurrencyNormalizer, Database,
    DiscrepancyFilter, DiscrepancyStore, DiscrepancyType, IngestionService, Processor,
    ReportFormat, SettlementFilter, SettlementStore, Severity, Transaction, TransactionFilter,
    TransactionStatus, TransactionStore, DEFAULT_PAGE_LIMIT, VERSION,
};

#[derive(Parser)]
#[command(name = "reconciler")]
#[command(about = "Settlement report ingestion and reconciliation", long_about = None)]
#[command(version = VERSION)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest a processor settlement report, then reconcile
    Ingest {
        file: PathBuf,

        /// afripay | nairagateway | capepay (defaults to, and must match, the format's processor)
        #[arg(long, value_parser = parse_processor)]
        processor: Option<Processor>,

        /// csv_a | json_b | csv_c (sniffed from the file when omitted)
        #[arg(long, value_parser = parse_format)]
        format: Option<ReportFormat>,
    },

    /// Seed transactions from a JSON array
    ImportTransactions { file: PathBuf },

    /// Run a full reconciliation pass
    Reconcile,

    /// Dashboard: totals, per-processor and per-currency volumes
    Summary,

    /// List transactions, newest first
    Transactions {
        #[arg(long, value_parser = parse_processor)]
        processor: Option<Processor>,

        #[arg(long, value_parser = parse_status)]
        status: Option<TransactionStatus>,

        /// ISO code, e.g. KES
        #[arg(long)]
        currency: Option<String>,

        #[command(flatten)]
        range: DateRange,

        #[command(flatten)]
        page: Page,
    },

    /// One transaction with its settlements and discrepancies
    Status { transaction_id: String },

    /// List settlement records, newest settlement date first
    Settlements {
        #[arg(long, value_parser = parse_processor)]
        processor: Option<Processor>,

        #[command(flatten)]
        range: DateRange,

        #[command(flatten)]
        page: Page,
    },

    /// List detected discrepancies, newest first
    Discrepancies {
        #[arg(long = "type", value_parser = parse_type)]
        discrepancy_type: Option<DiscrepancyType>,

        #[arg(long, value_parser = parse_severity)]
        severity: Option<Severity>,

        #[arg(long, value_parser = parse_processor)]
        processor: Option<Processor>,

        #[command(flatten)]
        range: DateRange,

        #[command(flatten)]
        page: Page,
    },

    /// List ingested settlement reports
    Reports,
}

/// RFC3339 or YYYY-MM-DD (midnight UTC), both bounds inclusive
#[derive(clap::Args)]
struct DateRange {
    #[arg(long, value_parser = parse_time)]
    from: Option<DateTime<Utc>>,

    #[arg(long, value_parser = parse_time)]
    to: Option<DateTime<Utc>>,
}

#[derive(clap::Args)]
struct Page {
    #[arg(long, default_value_t = DEFAULT_PAGE_LIMIT)]
    limit: usize,

    /// 1-based
    #[arg(long, default_value_t = 1)]
    page: usize,
}

impl Page {
    fn offset(&self) -> usize {
        self.page.saturating_sub(1) * self.limit
    }
}

/// One page of a listing plus the unpaged total
#[derive(Serialize)]
struct Listing<T: Serialize> {
    items: Vec<T>,
    total: usize,
    limit: usize,
    page: usize,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    let db = Database::open(&config.database_path)
        .with_context(|| format!("open database {}", config.database_path))?;
    info!(path = %config.database_path, "database ready");

    let service = IngestionService::new(&db, CurrencyNormalizer::default(), config.reconciliation.clone());

    match cli.cmd {
        Commands::Ingest {
            file,
            processor,
            format,
        } => {
            let data = read_file(&file)?;
            let format = match format {
                Some(format) => format,
                None => match detect_format(&data) {
                    Some(format) => format,
                    None => bail!("cannot detect report format of {}, pass --format", file.display()),
                },
            };
            let processor = processor.unwrap_or_else(|| format.processor());

            let result = service.ingest(&data, processor, format)?;
            print_json(&result)?;
        }

        Commands::ImportTransactions { file } => {
            let data = read_file(&file)?;
            let transactions: Vec<Transaction> = serde_json::from_slice(&data)
                .with_context(|| format!("parse transactions from {}", file.display()))?;

            let inserted = db.insert_transactions(&transactions)?;
            print_json(&json!({
                "read": transactions.len(),
                "inserted": inserted,
                "duplicates_skipped": transactions.len() - inserted,
            }))?;
        }

        Commands::Reconcile => {
            let result = service.engine().run_full_reconciliation()?;
            print_json(&result)?;
        }

        Commands::Summary => {
            print_json(&dashboard(&db)?)?;
        }

        Commands::Transactions {
            processor,
            status,
            currency,
            range,
            page,
        } => {
            let filter = TransactionFilter {
                processor,
                status,
                currency: currency.map(|c| c.to_uppercase()),
                from: range.from,
                to: range.to,
                limit: Some(page.limit),
                offset: page.offset(),
            };
            print_json(&Listing {
                items: db.list_transactions(&filter)?,
                total: db.count_transactions(&filter)?,
                limit: filter.effective_limit(),
                page: page.page,
            })?;
        }

        Commands::Status { transaction_id } => match settlement_status(&db, &transaction_id)? {
            Some(view) => print_json(&view)?,
            None => bail!("transaction {transaction_id} not found"),
        },

        Commands::Settlements {
            processor,
            range,
            page,
        } => {
            let filter = SettlementFilter {
                processor,
                from: range.from,
                to: range.to,
                limit: Some(page.limit),
                offset: page.offset(),
            };
            print_json(&Listing {
                items: db.list_records(&filter)?,
                total: db.count_records(&filter)?,
                limit: filter.effective_limit(),
                page: page.page,
            })?;
        }

        Commands::Discrepancies {
            discrepancy_type,
            severity,
            processor,
            range,
            page,
        } => {
            let filter = DiscrepancyFilter {
                discrepancy_type,
                severity,
                processor,
                from: range.from,
                to: range.to,
                limit: Some(page.limit),
                offset: page.offset(),
            };
            print_json(&json!({
                "discrepancies": db.list_discrepancies(&filter)?,
                "total": db.count_discrepancies(&filter)?,
                "limit": filter.effective_limit(),
                "page": page.page,
                "total_impact_usd": db.discrepancy_summary()?.total_impact_usd,
            }))?;
        }

        Commands::Reports => {
            print_json(&db.list_reports()?)?;
        }
    }

    Ok(())
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("read {}", path.display()))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ============================================================================
// ARGUMENT PARSERS
// ============================================================================

fn parse_processor(s: &str) -> Result<Processor, String> {
    s.to_lowercase()
        .parse()
        .map_err(|bad| format!("unknown processor {bad:?} (afripay, nairagateway, capepay)"))
}

fn parse_format(s: &str) -> Result<ReportFormat, String> {
    s.to_lowercase()
        .parse()
        .map_err(|bad| format!("unknown format {bad:?} (csv_a, json_b, csv_c)"))
}

fn parse_status(s: &str) -> Result<TransactionStatus, String> {
    s.to_lowercase().parse().map_err(|bad| {
        format!("unknown status {bad:?} (authorized, captured, settled, failed)")
    })
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(at) = DateTime::parse_from_rfc3339(s) {
        return Ok(at.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|midnight| midnight.and_utc())
        .ok_or_else(|| format!("invalid time {s:?} (RFC3339 or YYYY-MM-DD)"))
}

fn parse_type(s: &str) -> Result<DiscrepancyType, String> {
    s.to_uppercase().parse().map_err(|bad| {
        format!("unknown type {bad:?} (MISSING_SETTLEMENT, AMOUNT_MISMATCH, ORPHANED_SETTLEMENT)")
    })
}

fn parse_severity(s: &str) -> Result<Severity, String> {
    s.to_uppercase()
        .parse()
        .map_err(|bad| format!("unknown severity {bad:?} (LOW, MEDIUM, HIGH, CRITICAL)"))
}
