//! Read-only summary over the gold layer, for presentation.

use std::cmp::Ordering;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::aggregate::AggregateRecord;
use crate::store::{Layer, LayerStore, StoreError};

/// Entities listed in each ranking unless asked otherwise.
pub const DEFAULT_RANKING_LIMIT: usize = 10;

/// One entity in the mortality ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MortalityRow {
    pub entity: String,
    pub max_confirmed: i64,
    pub max_deaths: i64,
    /// `max_deaths / max_confirmed * 100`, or 0 without confirmed cases.
    pub mortality_pct: f64,
}

/// Headline metrics and rankings computed from gold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoldSummary {
    pub entities: usize,
    pub total_confirmed: i64,
    pub total_deaths: i64,
    pub total_recovered: i64,
    pub mortality_pct: f64,
    pub top_by_confirmed: Vec<AggregateRecord>,
    pub top_by_mortality: Vec<MortalityRow>,
}

/// What a presentation layer has to show.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SummaryView {
    /// No gold snapshot yet; the pipeline has to run first.
    Missing { path: PathBuf },
    Ready(GoldSummary),
}

fn percent(part: i64, whole: i64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

impl GoldSummary {
    /// Load gold from `store`. A missing gold layer is a view, not an error.
    pub fn load(store: &LayerStore, limit: usize) -> Result<SummaryView, StoreError> {
        match store.read(Layer::Gold) {
            Ok(table) => {
                let records = AggregateRecord::from_table(&table).map_err(|e| StoreError::Read {
                    layer: Layer::Gold,
                    message: e.to_string(),
                })?;
                Ok(SummaryView::Ready(Self::from_records(records, limit)))
            }
            Err(StoreError::LayerNotFound { path, .. }) => Ok(SummaryView::Missing { path }),
            Err(e) => Err(e),
        }
    }

    pub fn from_records(records: Vec<AggregateRecord>, limit: usize) -> Self {
        let total_confirmed: i64 = records.iter().map(|r| r.max_confirmed).sum();
        let total_deaths: i64 = records.iter().map(|r| r.max_deaths).sum();
        let total_recovered: i64 = records.iter().map(|r| r.max_recovered).sum();

        let mut top_by_confirmed = records.clone();
        top_by_confirmed.sort_by(|a, b| {
            b.max_confirmed
                .cmp(&a.max_confirmed)
                .then_with(|| a.entity.cmp(&b.entity))
        });
        top_by_confirmed.truncate(limit);

        let mut top_by_mortality: Vec<MortalityRow> = records
            .iter()
            .map(|r| MortalityRow {
                entity: r.entity.clone(),
                max_confirmed: r.max_confirmed,
                max_deaths: r.max_deaths,
                mortality_pct: percent(r.max_deaths, r.max_confirmed),
            })
            .collect();
        top_by_mortality.sort_by(|a, b| {
            b.mortality_pct
                .partial_cmp(&a.mortality_pct)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.entity.cmp(&b.entity))
        });
        top_by_mortality.truncate(limit);

        Self {
            entities: records.len(),
            total_confirmed,
            total_deaths,
            total_recovered,
            mortality_pct: percent(total_deaths, total_confirmed),
            top_by_confirmed,
            top_by_mortality,
        }
    }
}
