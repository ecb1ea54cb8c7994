// 💱 Currency Normalizer
// Converts processor-local amounts to USD (and back) from a fixed rate table.

use crate::error::CurrencyError;
use std::collections::HashMap;

/// Units of local currency per 1 USD.
#[derive(Debug, Clone, PartialEq)]
pub struct RateTable {
    rates: HashMap<String, f64>,
}

impl RateTable {
    /// Approximate 2024 rates for the three processor corridors.
    pub fn standard() -> Self {
        RateTable::from_pairs([
            ("USD", 1.0),
            ("KES", 129.5),  // Kenyan Shilling
            ("NGN", 1580.0), // Nigerian Naira
            ("ZAR", 18.6),   // South African Rand
        ])
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, f64)>) -> Self {
        RateTable {
            rates: pairs
                .into_iter()
                .map(|(code, rate)| (code.to_string(), rate))
                .collect(),
        }
    }

    pub fn get(&self, code: &str) -> Option<f64> {
        self.rates.get(code).copied()
    }
}

impl Default for RateTable {
    fn default() -> Self {
        Self::standard()
    }
}

/// Pure converter over an injected [`RateTable`].
#[derive(Debug, Clone, Default)]
pub struct CurrencyNormalizer {
    table: RateTable,
}

impl CurrencyNormalizer {
    pub fn new(table: RateTable) -> Self {
        CurrencyNormalizer { table }
    }

    pub fn rate(&self, code: &str) -> Result<f64, CurrencyError> {
        self.table
            .get(code)
            .ok_or_else(|| CurrencyError::Unsupported(code.to_string()))
    }

    pub fn to_usd(&self, amount: f64, code: &str) -> Result<f64, CurrencyError> {
        Ok(amount / self.rate(code)?)
    }

    pub fn from_usd(&self, usd_amount: f64, code: &str) -> Result<f64, CurrencyError> {
        Ok(usd_amount * self.rate(code)?)
    }
}
