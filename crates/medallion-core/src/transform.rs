//! Bronze to silver transforms.
//!
//! Every transform is pure: it borrows its input and returns a new table.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::aggregate::group_maxima;
use crate::table::{
    Column, Table, TableError, ACTIVE, CONFIRMED, DEATHS, ENTITY, FATALITY_RATE, MONTH, RECOVERED,
    TIMESTAMP,
};

/// Which derivation produces the silver layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformMode {
    /// Input columns plus a `month` period.
    #[default]
    Basic,
    /// One row per entity: column maxima plus `fatality_rate`.
    Enriched,
    /// Input columns plus `active` cases.
    Active,
}

impl TransformMode {
    pub fn name(&self) -> &'static str {
        match self {
            TransformMode::Basic => "basic",
            TransformMode::Enriched => "enriched",
            TransformMode::Active => "active",
        }
    }
}

impl std::fmt::Display for TransformMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TransformMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" => Ok(TransformMode::Basic),
            "enriched" => Ok(TransformMode::Enriched),
            "active" => Ok(TransformMode::Active),
            other => Err(format!(
                "unknown transform mode '{other}' (expected basic, enriched or active)"
            )),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum TransformError {
    #[error("transform input is missing column '{0}'")]
    MissingColumn(String),

    #[error(transparent)]
    Table(TableError),
}

impl From<TableError> for TransformError {
    fn from(e: TableError) -> Self {
        match e {
            TableError::MissingColumn(column) => TransformError::MissingColumn(column),
            other => TransformError::Table(other),
        }
    }
}

/// Apply `mode` to `table`.
pub fn transform(table: &Table, mode: TransformMode) -> Result<Table, TransformError> {
    match mode {
        TransformMode::Basic => add_month(table),
        TransformMode::Enriched => enrich(table),
        TransformMode::Active => add_active(table),
    }
}

fn add_month(table: &Table) -> Result<Table, TransformError> {
    let months = table
        .dates(TIMESTAMP)?
        .iter()
        .map(|d| d.map(|d| d.format("%Y-%m").to_string()))
        .collect();
    Ok(table.with_column(Column::utf8(MONTH, months))?)
}

fn add_active(table: &Table) -> Result<Table, TransformError> {
    let confirmed = table.ints(CONFIRMED)?;
    let recovered = table.ints(RECOVERED)?;
    let deaths = table.ints(DEATHS)?;
    let active = (0..table.num_rows())
        .map(|row| Some(confirmed[row]? - recovered[row]? - deaths[row]?))
        .collect();
    Ok(table.with_column(Column::int64(ACTIVE, active))?)
}

fn enrich(table: &Table) -> Result<Table, TransformError> {
    let groups = group_maxima(table)?;

    let mut entity = Vec::with_capacity(groups.len());
    let mut confirmed = Vec::with_capacity(groups.len());
    let mut recovered = Vec::with_capacity(groups.len());
    let mut deaths = Vec::with_capacity(groups.len());
    let mut rate = Vec::with_capacity(groups.len());

    for (key, maxima) in groups {
        entity.push(key);
        confirmed.push(maxima.confirmed);
        recovered.push(maxima.recovered);
        deaths.push(maxima.deaths);
        rate.push(Some(fatality_rate(maxima.confirmed, maxima.deaths)));
    }

    Ok(Table::new(vec![
        Column::utf8(ENTITY, entity),
        Column::int64(CONFIRMED, confirmed),
        Column::int64(RECOVERED, recovered),
        Column::int64(DEATHS, deaths),
        Column::float64(FATALITY_RATE, rate),
    ])?)
}

/// `deaths / confirmed` rounded to three decimals; `0.0` when there are no
/// confirmed cases.
pub fn fatality_rate(confirmed: Option<i64>, deaths: Option<i64>) -> f64 {
    match confirmed {
        Some(c) if c != 0 => {
            let raw = deaths.unwrap_or(0) as f64 / c as f64;
            (raw * 1000.0).round() / 1000.0
        }
        _ => 0.0,
    }
}
