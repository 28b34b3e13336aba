//! Validation gate: data-quality predicates evaluated before aggregation.

use serde::{Deserialize, Serialize};

use crate::table::{ColumnValues, Table, CONFIRMED, DEATHS, ENTITY, RECOVERED};

/// How many offending row indices a failure message lists.
const SAMPLE_ROWS: usize = 5;

/// A single data-quality rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Predicate {
    /// Every row has a non-blank entity.
    EntityNotNull,

    /// No confirmed count is negative. Nulls are ignored.
    ConfirmedNonNegative,

    ColumnNotNull { column: String },

    ColumnNonNegative { column: String },

    /// The table has at least one row.
    NotEmpty,

    /// `confirmed >= recovered + deaths` wherever all three are present.
    ConfirmedCoversOutcomes,
}

impl Predicate {
    pub fn name(&self) -> String {
        match self {
            Predicate::EntityNotNull => "entity_not_null".to_string(),
            Predicate::ConfirmedNonNegative => "confirmed_non_negative".to_string(),
            Predicate::ColumnNotNull { column } => format!("column_not_null({column})"),
            Predicate::ColumnNonNegative { column } => format!("column_non_negative({column})"),
            Predicate::NotEmpty => "not_empty".to_string(),
            Predicate::ConfirmedCoversOutcomes => "confirmed_covers_outcomes".to_string(),
        }
    }

    /// Evaluate against `table`. `None` means the predicate holds.
    pub fn check(&self, table: &Table) -> Option<PredicateFailure> {
        let message = match self {
            Predicate::EntityNotNull => not_null(table, ENTITY),
            Predicate::ConfirmedNonNegative => non_negative(table, CONFIRMED),
            Predicate::ColumnNotNull { column } => not_null(table, column),
            Predicate::ColumnNonNegative { column } => non_negative(table, column),
            Predicate::NotEmpty => table.is_empty().then(|| "table has no rows".to_string()),
            Predicate::ConfirmedCoversOutcomes => covers_outcomes(table),
        }?;
        Some(PredicateFailure {
            predicate_name: self.name(),
            message,
        })
    }
}

fn describe(count: usize, rows: &[usize], what: &str) -> String {
    let sample: Vec<String> = rows.iter().take(SAMPLE_ROWS).map(usize::to_string).collect();
    let more = if rows.len() > SAMPLE_ROWS { ", ..." } else { "" };
    format!("{count} row(s) {what} (rows {}{more})", sample.join(", "))
}

fn not_null(table: &Table, column: &str) -> Option<String> {
    let Some(col) = table.column(column) else {
        return Some(format!("column '{column}' is missing"));
    };
    let rows = col.values().null_indices();
    (!rows.is_empty()).then(|| describe(rows.len(), &rows, &format!("have null {column}")))
}

fn non_negative(table: &Table, column: &str) -> Option<String> {
    let Some(col) = table.column(column) else {
        return Some(format!("column '{column}' is missing"));
    };
    let rows: Vec<usize> = match col.values() {
        ColumnValues::Int64(v) => v
            .iter()
            .enumerate()
            .filter(|(_, x)| x.is_some_and(|x| x < 0))
            .map(|(i, _)| i)
            .collect(),
        ColumnValues::Float64(v) => v
            .iter()
            .enumerate()
            .filter(|(_, x)| x.is_some_and(|x| x < 0.0))
            .map(|(i, _)| i)
            .collect(),
        other => {
            return Some(format!(
                "column '{column}' has type {}, expected a numeric column",
                other.data_type()
            ))
        }
    };
    (!rows.is_empty()).then(|| describe(rows.len(), &rows, &format!("have negative {column}")))
}

fn covers_outcomes(table: &Table) -> Option<String> {
    let (confirmed, recovered, deaths) =
        match (table.ints(CONFIRMED), table.ints(RECOVERED), table.ints(DEATHS)) {
            (Ok(c), Ok(r), Ok(d)) => (c, r, d),
            (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => return Some(e.to_string()),
        };
    let rows: Vec<usize> = (0..table.num_rows())
        .filter(|&i| match (confirmed[i], recovered[i], deaths[i]) {
            (Some(c), Some(r), Some(d)) => c < r.saturating_add(d),
            _ => false,
        })
        .collect();
    (!rows.is_empty()).then(|| {
        describe(
            rows.len(),
            &rows,
            "have recovered + deaths exceeding confirmed",
        )
    })
}

/// One violated predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredicateFailure {
    pub predicate_name: String,
    pub message: String,
}

/// Gate evaluation verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationVerdict {
    /// Whether every predicate held.
    pub success: bool,

    /// Violated predicates, in evaluation order (empty if passed).
    pub failures: Vec<PredicateFailure>,

    /// Number of predicates evaluated.
    pub evaluated: usize,
}

impl ValidationVerdict {
    pub fn passed(&self) -> bool {
        self.success
    }

    pub fn summary(&self) -> String {
        if self.success {
            format!("All {} predicate(s) passed", self.evaluated)
        } else {
            let names: Vec<&str> = self
                .failures
                .iter()
                .map(|f| f.predicate_name.as_str())
                .collect();
            format!(
                "Gate failed with {} of {} predicate(s) violated: {}",
                self.failures.len(),
                self.evaluated,
                names.join(", ")
            )
        }
    }
}

/// Ordered predicate list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateConfig {
    pub predicates: Vec<Predicate>,
}

impl GateConfig {
    /// Entity present and confirmed non-negative.
    pub fn standard() -> Self {
        Self {
            predicates: vec![Predicate::EntityNotNull, Predicate::ConfirmedNonNegative],
        }
    }

    /// [`standard`](Self::standard) plus the outcome consistency check.
    pub fn strict() -> Self {
        Self::standard().with(Predicate::ConfirmedCoversOutcomes)
    }

    pub fn with(mut self, predicate: Predicate) -> Self {
        if !self.predicates.contains(&predicate) {
            self.predicates.push(predicate);
        }
        self
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self::standard()
    }
}

/// Evaluates every configured predicate; never short-circuits.
#[derive(Debug, Clone, Default)]
pub struct ValidationGate {
    config: GateConfig,
}

impl ValidationGate {
    pub fn new(config: GateConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn validate(&self, table: &Table) -> ValidationVerdict {
        let failures: Vec<PredicateFailure> = self
            .config
            .predicates
            .iter()
            .filter_map(|p| p.check(table))
            .collect();

        ValidationVerdict {
            success: failures.is_empty(),
            failures,
            evaluated: self.config.predicates.len(),
        }
    }
}
