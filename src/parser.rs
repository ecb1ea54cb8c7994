// 🏗️ Parser Framework - Settlement report formats
// One parser per processor, all producing canonical SettlementRecords

use crate::currency::CurrencyNormalizer;
use crate::entities::{Processor, SettlementRecord};
use crate::error::ParseError;
use chrono::{DateTime, NaiveDate, Utc};
use csv::{ReaderBuilder, Trim};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Header row width shared by both CSV layouts
const CSV_COLUMNS: usize = 7;

// ============================================================================
// CORE TYPES
// ============================================================================

/// ReportFormat - closed set of wire formats, selected by tag at ingestion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReportFormat {
    /// AfriPay comma CSV (KES)
    #[serde(rename = "csv_a")]
    CsvA,

    /// NairaGateway JSON (NGN)
    #[serde(rename = "json_b")]
    JsonB,

    /// CapePay pipe-delimited CSV (ZAR)
    #[serde(rename = "csv_c")]
    CsvC,
}

impl ReportFormat {
    pub const ALL: [ReportFormat; 3] = [ReportFormat::CsvA, ReportFormat::JsonB, ReportFormat::CsvC];

    pub fn tag(&self) -> &'static str {
        match self {
            ReportFormat::CsvA => "csv_a",
            ReportFormat::JsonB => "json_b",
            ReportFormat::CsvC => "csv_c",
        }
    }

    /// Processor whose reports use this format
    pub fn processor(&self) -> Processor {
        match self {
            ReportFormat::CsvA => Processor::AfriPay,
            ReportFormat::JsonB => Processor::NairaGateway,
            ReportFormat::CsvC => Processor::CapePay,
        }
    }
}

impl fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for ReportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ReportFormat::ALL
            .into_iter()
            .find(|f| f.tag() == s)
            .ok_or_else(|| s.to_string())
    }
}

/// Output of parser.parse()
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedReport {
    pub records: Vec<SettlementRecord>,

    /// Empty when the file carried no batch id
    pub batch_id: String,

    /// Report-level date, when the format carries one
    pub report_date: Option<DateTime<Utc>>,
}

/// SettlementParser - the one capability every format implements
///
/// Parsing is all-or-nothing: a bad number or date aborts the whole file.
/// Rows with too few fields are skipped.
pub trait SettlementParser: Send + Sync {
    fn parse(&self, data: &[u8], report_id: &str) -> Result<ParsedReport, ParseError>;

    fn format(&self) -> ReportFormat;

    /// Parser version (for provenance in logs)
    fn version(&self) -> &str {
        "1.0.0"
    }
}

// ============================================================================
// FACTORY FUNCTIONS
// ============================================================================

/// Get the parser for a format tag
pub fn get_parser(format: ReportFormat, normalizer: &CurrencyNormalizer) -> Box<dyn SettlementParser> {
    match format {
        ReportFormat::CsvA => Box::new(AfriPayParser::new(normalizer.clone())),
        ReportFormat::JsonB => Box::new(NairaGatewayParser::new(normalizer.clone())),
        ReportFormat::CsvC => Box::new(CapePayParser::new(normalizer.clone())),
    }
}

/// Guess the format from the first bytes of a file.
///
/// Only the CLI uses this; ingestion always takes an explicit tag.
pub fn detect_format(data: &[u8]) -> Option<ReportFormat> {
    let text = std::str::from_utf8(data).ok()?;
    let trimmed = text.trim_start_matches('\u{feff}').trim_start();

    if trimmed.starts_with('{') {
        return Some(ReportFormat::JsonB);
    }

    let header = trimmed.lines().next()?.to_lowercase();
    if header.starts_with("txref|") {
        return Some(ReportFormat::CsvC);
    }
    if header.starts_with("transaction_id,") {
        return Some(ReportFormat::CsvA);
    }

    None
}

// ============================================================================
// DATE HELPERS
// ============================================================================

/// `YYYY-MM-DD` (midnight UTC), falling back to RFC3339
fn parse_day_or_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(day) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return day.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
    }

    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// RFC3339, falling back to a fixed numeric offset (`+0100` or `+01:00`)
fn parse_rfc3339_or_offset(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .or_else(|_| DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%z"))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_amount(line: usize, field: &'static str, value: &str) -> Result<f64, ParseError> {
    value.parse::<f64>().map_err(|_| ParseError::InvalidNumber {
        line,
        field,
        value: value.to_string(),
    })
}

// ============================================================================
// DELIMITED CSV (Formats A and C)
// ============================================================================

/// Everything that differs between the two CSV layouts.
/// Column order is the same: ref, merchant, date, gross, fee, net, batch.
struct CsvLayout {
    delimiter: u8,
    processor: Processor,
    id_prefix: &'static str,
    field_names: [&'static str; 3],
}

fn parse_delimited(
    data: &[u8],
    report_id: &str,
    layout: &CsvLayout,
    normalizer: &CurrencyNormalizer,
) -> Result<ParsedReport, ParseError> {
    let mut reader = ReaderBuilder::new()
        .delimiter(layout.delimiter)
        .has_headers(false)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(data);

    let mut rows = reader.records();

    let header = match rows.next() {
        Some(Ok(header)) => header,
        Some(Err(e)) => return Err(ParseError::Header(e.to_string())),
        None => return Err(ParseError::Header("empty file".to_string())),
    };
    if header.len() < CSV_COLUMNS {
        return Err(ParseError::ColumnCount {
            expected: CSV_COLUMNS,
            found: header.len(),
        });
    }

    let currency = layout.processor.currency();
    let [gross_name, fee_name, net_name] = layout.field_names;
    let mut records = Vec::new();
    let mut batch_id = String::new();

    for (idx, result) in rows.enumerate() {
        let line = idx + 2; // 1-indexed + header row
        let row = result.map_err(|source| ParseError::Csv { line, source })?;

        if row.len() < CSV_COLUMNS {
            continue;
        }

        let reference = &row[0];
        let date_str = &row[2];
        batch_id = row[6].to_string();

        let gross = parse_amount(line, gross_name, &row[3])?;
        let fee = parse_amount(line, fee_name, &row[4])?;
        let net = parse_amount(line, net_name, &row[5])?;

        let settlement_date = parse_day_or_rfc3339(date_str).ok_or_else(|| ParseError::InvalidDate {
            line,
            value: date_str.to_string(),
        })?;

        let usd_gross = normalizer
            .to_usd(gross, currency)
            .map_err(|source| ParseError::Currency { line, source })?;
        let usd_net = normalizer
            .to_usd(net, currency)
            .map_err(|source| ParseError::Currency { line, source })?;

        records.push(SettlementRecord {
            id: format!("{}-{}-{}", layout.id_prefix, reference, line),
            report_id: report_id.to_string(),
            processor: layout.processor,
            processor_transaction_id: reference.to_string(),
            wakala_transaction_id: None,
            gross_amount: gross,
            fee_amount: fee,
            net_amount: net,
            currency: currency.to_string(),
            usd_gross_amount: usd_gross,
            usd_net_amount: usd_net,
            settlement_date,
            batch_id: batch_id.clone(),
        });
    }

    Ok(ParsedReport {
        records,
        batch_id,
        report_date: None,
    })
}

// ============================================================================
// PARSERS
// ============================================================================

/// AfriPay Kenya CSV
///
/// Header: `transaction_id,merchant_ref,settlement_date,gross_amount_kes,fee_kes,net_kes,batch_id`
pub struct AfriPayParser {
    normalizer: CurrencyNormalizer,
}

impl AfriPayParser {
    const LAYOUT: CsvLayout = CsvLayout {
        delimiter: b',',
        processor: Processor::AfriPay,
        id_prefix: "SR-AP",
        field_names: ["gross", "fee", "net"],
    };

    pub fn new(normalizer: CurrencyNormalizer) -> Self {
        AfriPayParser { normalizer }
    }
}

impl SettlementParser for AfriPayParser {
    fn parse(&self, data: &[u8], report_id: &str) -> Result<ParsedReport, ParseError> {
        parse_delimited(data, report_id, &Self::LAYOUT, &self.normalizer)
    }

    fn format(&self) -> ReportFormat {
        ReportFormat::CsvA
    }
}

/// CapePay South Africa pipe-delimited CSV
///
/// Header: `TXREF|MERCHANT|SETTLE_DATE|AMOUNT_ZAR|DEDUCTIONS_ZAR|NET_ZAR|BATCH`
pub struct CapePayParser {
    normalizer: CurrencyNormalizer,
}

impl CapePayParser {
    const LAYOUT: CsvLayout = CsvLayout {
        delimiter: b'|',
        processor: Processor::CapePay,
        id_prefix: "SR-CP",
        field_names: ["amount", "deductions", "net"],
    };

    pub fn new(normalizer: CurrencyNormalizer) -> Self {
        CapePayParser { normalizer }
    }
}

impl SettlementParser for CapePayParser {
    fn parse(&self, data: &[u8], report_id: &str) -> Result<ParsedReport, ParseError> {
        parse_delimited(data, report_id, &Self::LAYOUT, &self.normalizer)
    }

    fn format(&self) -> ReportFormat {
        ReportFormat::CsvC
    }
}

/// NairaGateway Nigeria JSON
///
/// ```json
/// {"batch_id": "...", "settlement_date": "...",
///  "records": [{"ref", "merchant_id", "amount_ngn", "processing_fee_ngn", "payout_ngn", "settled_at"}]}
/// ```
pub struct NairaGatewayParser {
    normalizer: CurrencyNormalizer,
}

#[derive(Debug, Deserialize)]
struct NairaGatewayFile {
    #[serde(default)]
    batch_id: String,
    #[serde(default)]
    settlement_date: String,
    #[serde(default)]
    records: Vec<NairaGatewayEntry>,
}

#[derive(Debug, Deserialize)]
struct NairaGatewayEntry {
    #[serde(default, rename = "ref")]
    reference: String,
    #[serde(default)]
    amount_ngn: f64,
    #[serde(default)]
    processing_fee_ngn: f64,
    #[serde(default)]
    payout_ngn: f64,
    #[serde(default)]
    settled_at: String,
}

impl NairaGatewayParser {
    pub fn new(normalizer: CurrencyNormalizer) -> Self {
        NairaGatewayParser { normalizer }
    }
}

impl SettlementParser for NairaGatewayParser {
    fn parse(&self, data: &[u8], report_id: &str) -> Result<ParsedReport, ParseError> {
        let file: NairaGatewayFile = serde_json::from_slice(data)?;
        let processor = Processor::NairaGateway;
        let currency = processor.currency();

        let mut records = Vec::with_capacity(file.records.len());

        for (i, entry) in file.records.iter().enumerate() {
            let settlement_date =
                parse_rfc3339_or_offset(&entry.settled_at).ok_or_else(|| ParseError::InvalidDate {
                    line: i,
                    value: entry.settled_at.clone(),
                })?;

            let usd_gross = self
                .normalizer
                .to_usd(entry.amount_ngn, currency)
                .map_err(|source| ParseError::Currency { line: i, source })?;
            let usd_net = self
                .normalizer
                .to_usd(entry.payout_ngn, currency)
                .map_err(|source| ParseError::Currency { line: i, source })?;

            records.push(SettlementRecord {
                id: format!("SR-NG-{}-{}", entry.reference, i),
                report_id: report_id.to_string(),
                processor,
                processor_transaction_id: entry.reference.clone(),
                wakala_transaction_id: None,
                gross_amount: entry.amount_ngn,
                fee_amount: entry.processing_fee_ngn,
                net_amount: entry.payout_ngn,
                currency: currency.to_string(),
                usd_gross_amount: usd_gross,
                usd_net_amount: usd_net,
                settlement_date,
                batch_id: file.batch_id.clone(),
            });
        }

        let report_date = parse_rfc3339_or_offset(&file.settlement_date)
            .or_else(|| parse_day_or_rfc3339(&file.settlement_date));

        Ok(ParsedReport {
            records,
            batch_id: file.batch_id,
            report_date,
        })
    }

    fn format(&self) -> ReportFormat {
        ReportFormat::JsonB
    }
}

// ============================================================================
// TESTS
// ============================================================================
