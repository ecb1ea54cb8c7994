// 📊 Read views - composed answers over the stores
//
// Nothing here writes. Each view is a handful of store reads stitched
// into one serializable shape for the CLI.

use crate::entities::{Discrepancy, SettlementRecord, Transaction};
use crate::error::StoreResult;
use crate::store::{
    CurrencyVolume, DiscrepancyStore, DiscrepancySummary, SettlementStore, TransactionStats,
    TransactionStore,
};
use serde::Serialize;
use std::collections::BTreeMap;

// ============================================================================
// SETTLEMENT STATUS
// ============================================================================

/// One transaction with everything reconciliation knows about it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SettlementStatusView {
    pub transaction: Transaction,
    pub settlements: Vec<SettlementRecord>,
    pub discrepancies: Vec<Discrepancy>,
}

/// `None` when no transaction has this id
pub fn settlement_status<S>(store: &S, transaction_id: &str) -> StoreResult<Option<SettlementStatusView>>
where
    S: TransactionStore + SettlementStore + DiscrepancyStore + ?Sized,
{
    let Some(transaction) = store.transaction_by_id(transaction_id)? else {
        return Ok(None);
    };

    Ok(Some(SettlementStatusView {
        settlements: store.records_for_transaction(&transaction.id)?,
        discrepancies: store.discrepancies_for_transaction(&transaction.id)?,
        transaction,
    }))
}

// ============================================================================
// DASHBOARD
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessorOverview {
    pub processor: String,
    pub settled_usd: f64,
    pub discrepancy_count: usize,
    pub discrepancy_impact_usd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dashboard {
    pub transactions: TransactionStats,
    pub discrepancies: DiscrepancySummary,
    pub by_processor: Vec<ProcessorOverview>,
    pub by_currency: Vec<CurrencyVolume>,
}

/// Processors appear if they have transactions or discrepancies
pub fn dashboard<S>(store: &S) -> StoreResult<Dashboard>
where
    S: TransactionStore + DiscrepancyStore + ?Sized,
{
    let mut by_processor: BTreeMap<String, ProcessorOverview> = BTreeMap::new();

    for volume in store.volume_by_processor()? {
        let entry = by_processor
            .entry(volume.processor.clone())
            .or_insert_with(|| ProcessorOverview {
                processor: volume.processor.clone(),
                ..Default::default()
            });
        entry.settled_usd = volume.settled_usd;
    }

    for stat in store.discrepancy_stats_by_processor()? {
        let entry = by_processor
            .entry(stat.processor.clone())
            .or_insert_with(|| ProcessorOverview {
                processor: stat.processor.clone(),
                ..Default::default()
            });
        entry.discrepancy_count = stat.discrepancy_count;
        entry.discrepancy_impact_usd = stat.impact_usd;
    }

    Ok(Dashboard {
        transactions: store.transaction_stats()?,
        discrepancies: store.discrepancy_summary()?,
        by_processor: by_processor.into_values().collect(),
        by_currency: store.volume_by_currency()?,
    })
}

// ============================================================================
// TESTS
// ============================================================================
