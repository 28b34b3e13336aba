//! Gold aggregation: per-entity maxima, ranked by confirmed count.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::table::{Column, Table, TableError, CONFIRMED, DEATHS, ENTITY, RECOVERED};

pub const MAX_CONFIRMED: &str = "max_confirmed";
pub const MAX_DEATHS: &str = "max_deaths";
pub const MAX_RECOVERED: &str = "max_recovered";

/// Number of rows kept in the gold layer unless configured otherwise.
pub const DEFAULT_TOP_N: usize = 10;

#[derive(Debug, Error, PartialEq)]
pub enum AggregationError {
    #[error("malformed aggregation input: {0}")]
    Malformed(String),
}

impl From<TableError> for AggregationError {
    fn from(e: TableError) -> Self {
        AggregationError::Malformed(e.to_string())
    }
}

/// Column maxima for one entity. Null cells are skipped, so a maximum is
/// `None` only when every cell of that column was null.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Maxima {
    pub confirmed: Option<i64>,
    pub recovered: Option<i64>,
    pub deaths: Option<i64>,
}

fn fold_max(acc: &mut Option<i64>, value: Option<i64>) {
    if let Some(v) = value {
        *acc = Some(acc.map_or(v, |current| current.max(v)));
    }
}

/// Group rows by entity and fold each numeric column to its maximum.
///
/// Groups come back ordered by entity, with the null-entity group first.
pub(crate) fn group_maxima(table: &Table) -> Result<Vec<(Option<String>, Maxima)>, TableError> {
    let entities = table.strings(ENTITY)?;
    let confirmed = table.ints(CONFIRMED)?;
    let recovered = table.ints(RECOVERED)?;
    let deaths = table.ints(DEATHS)?;

    let mut groups: BTreeMap<Option<String>, Maxima> = BTreeMap::new();
    for row in 0..table.num_rows() {
        let key = entities[row]
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let entry = groups.entry(key).or_default();
        fold_max(&mut entry.confirmed, confirmed[row]);
        fold_max(&mut entry.recovered, recovered[row]);
        fold_max(&mut entry.deaths, deaths[row]);
    }
    Ok(groups.into_iter().collect())
}

/// One gold-layer row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateRecord {
    pub entity: String,
    pub max_confirmed: i64,
    pub max_deaths: i64,
    pub max_recovered: i64,
}

impl AggregateRecord {
    /// Build the gold table, columns in contract order.
    pub fn into_table(records: &[AggregateRecord]) -> Result<Table, TableError> {
        Table::new(vec![
            Column::utf8(ENTITY, records.iter().map(|r| Some(r.entity.clone())).collect()),
            Column::int64(MAX_CONFIRMED, records.iter().map(|r| Some(r.max_confirmed)).collect()),
            Column::int64(MAX_DEATHS, records.iter().map(|r| Some(r.max_deaths)).collect()),
            Column::int64(MAX_RECOVERED, records.iter().map(|r| Some(r.max_recovered)).collect()),
        ])
    }

    /// Read records back from a gold table. Null counts read as zero.
    pub fn from_table(table: &Table) -> Result<Vec<AggregateRecord>, TableError> {
        let entities = table.strings(ENTITY)?;
        let confirmed = table.ints(MAX_CONFIRMED)?;
        let deaths = table.ints(MAX_DEATHS)?;
        let recovered = table.ints(MAX_RECOVERED)?;
        Ok((0..table.num_rows())
            .map(|row| AggregateRecord {
                entity: entities[row].clone().unwrap_or_default(),
                max_confirmed: confirmed[row].unwrap_or(0),
                max_deaths: deaths[row].unwrap_or(0),
                max_recovered: recovered[row].unwrap_or(0),
            })
            .collect())
    }
}

/// Reduce `table` to the top `top_n` entities by maximum confirmed count.
///
/// Ties on `max_confirmed` are broken by entity name so the output is stable.
pub fn aggregate(table: &Table, top_n: usize) -> Result<Table, AggregationError> {
    let groups = group_maxima(table)?;

    let mut records = Vec::with_capacity(groups.len());
    for (entity, maxima) in groups {
        let entity = entity.ok_or_else(|| {
            AggregationError::Malformed("entity column contains null values".to_string())
        })?;
        records.push(AggregateRecord {
            entity,
            max_confirmed: maxima.confirmed.unwrap_or(0),
            max_deaths: maxima.deaths.unwrap_or(0),
            max_recovered: maxima.recovered.unwrap_or(0),
        });
    }

    records.sort_by(|a, b| {
        b.max_confirmed
            .cmp(&a.max_confirmed)
            .then_with(|| a.entity.cmp(&b.entity))
    });
    records.truncate(top_n);

    Ok(AggregateRecord::into_table(&records)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(rows: &[(Option<&str>, Option<i64>, Option<i64>, Option<i64>)]) -> Table {
        Table::new(vec![
            Column::utf8(ENTITY, rows.iter().map(|r| r.0.map(str::to_string)).collect()),
            Column::int64(CONFIRMED, rows.iter().map(|r| r.1).collect()),
            Column::int64(RECOVERED, rows.iter().map(|r| r.2).collect()),
            Column::int64(DEATHS, rows.iter().map(|r| r.3).collect()),
        ])
        .unwrap()
    }

    #[test]
    fn test_takes_maximum_per_entity() {
        let table = input(&[
            (Some("A"), Some(5), Some(1), Some(0)),
            (Some("A"), Some(20), Some(2), Some(1)),
            (Some("A"), Some(10), Some(4), Some(3)),
        ]);
        let gold = AggregateRecord::from_table(&aggregate(&table, DEFAULT_TOP_N).unwrap()).unwrap();
        assert_eq!(
            gold,
            vec![AggregateRecord {
                entity: "A".into(),
                max_confirmed: 20,
                max_deaths: 3,
                max_recovered: 4,
            }]
        );
    }

    #[test]
    fn test_keeps_top_n_descending() {
        let rows: Vec<_> = (0..15)
            .map(|i| (format!("E{i:02}"), i as i64 * 10))
            .collect();
        let table = input(
            &rows
                .iter()
                .map(|(e, c)| (Some(e.as_str()), Some(*c), Some(0), Some(0)))
                .collect::<Vec<_>>(),
        );

        let gold = aggregate(&table, 10).unwrap();
        assert_eq!(gold.num_rows(), 10);
        let confirmed: Vec<i64> = gold
            .ints(MAX_CONFIRMED)
            .unwrap()
            .iter()
            .map(|v| v.unwrap())
            .collect();
        assert_eq!(confirmed, vec![140, 130, 120, 110, 100, 90, 80, 70, 60, 50]);
    }

    #[test]
    fn test_ties_broken_by_entity() {
        let table = input(&[
            (Some("Zed"), Some(7), Some(0), Some(0)),
            (Some("Amy"), Some(7), Some(0), Some(0)),
        ]);
        let gold = aggregate(&table, 10).unwrap();
        assert_eq!(
            gold.strings(ENTITY).unwrap(),
            &[Some("Amy".to_string()), Some("Zed".to_string())]
        );
    }

    #[test]
    fn test_all_null_column_counts_as_zero() {
        let table = input(&[(Some("A"), Some(4), None, None)]);
        let gold = AggregateRecord::from_table(&aggregate(&table, 10).unwrap()).unwrap();
        assert_eq!(gold[0].max_deaths, 0);
        assert_eq!(gold[0].max_recovered, 0);
    }

    #[test]
    fn test_null_entity_is_malformed() {
        let table = input(&[(None, Some(1), Some(0), Some(0))]);
        assert!(matches!(
            aggregate(&table, 10),
            Err(AggregationError::Malformed(_))
        ));
    }

    #[test]
    fn test_missing_column_is_malformed() {
        let table = input(&[(Some("A"), Some(1), Some(0), Some(0))])
            .select(&[ENTITY, CONFIRMED])
            .unwrap();
        let err = aggregate(&table, 10).unwrap_err();
        assert!(err.to_string().contains("recovered"));
    }

    #[test]
    fn test_empty_input_gives_empty_gold() {
        let table = input(&[]);
        let gold = aggregate(&table, 10).unwrap();
        assert_eq!(gold.num_rows(), 0);
        assert_eq!(
            gold.column_names(),
            vec![ENTITY, MAX_CONFIRMED, MAX_DEATHS, MAX_RECOVERED]
        );
    }
}
