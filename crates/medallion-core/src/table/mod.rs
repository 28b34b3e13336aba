//! Typed, column-major tables passed between pipeline stages.
//!
//! A [`Table`] is immutable once built: stages read from a borrowed input and
//! return a new table. Columns carry one of four value types, and every cell
//! is nullable so gaps in the source survive until the validation gate sees
//! them.

pub mod batch;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use medallion_sink::SinkTable;

/// Grouping key column.
pub const ENTITY: &str = "entity";
/// Observation date column.
pub const TIMESTAMP: &str = "timestamp";
pub const CONFIRMED: &str = "confirmed";
pub const RECOVERED: &str = "recovered";
pub const DEATHS: &str = "deaths";
/// `YYYY-MM` period derived from [`TIMESTAMP`].
pub const MONTH: &str = "month";
/// `confirmed - recovered - deaths`.
pub const ACTIVE: &str = "active";
/// `deaths / confirmed`, rounded to three decimals.
pub const FATALITY_RATE: &str = "fatality_rate";

/// Logical column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Utf8,
    Date,
    Int64,
    Float64,
}

impl DataType {
    pub fn name(&self) -> &'static str {
        match self {
            DataType::Utf8 => "utf8",
            DataType::Date => "date",
            DataType::Int64 => "int64",
            DataType::Float64 => "float64",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors raised while building or querying a [`Table`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TableError {
    #[error("column '{column}' has {actual} rows, expected {expected}")]
    LengthMismatch {
        column: String,
        expected: usize,
        actual: usize,
    },

    #[error("duplicate column: {0}")]
    DuplicateColumn(String),

    #[error("missing column: {0}")]
    MissingColumn(String),

    #[error("column '{column}' has type {actual}, expected {expected}")]
    TypeMismatch {
        column: String,
        expected: DataType,
        actual: DataType,
    },

    #[error("column '{column}' has unsupported storage type {data_type}")]
    UnsupportedType { column: String, data_type: String },

    #[error("row index {index} out of bounds for table of {rows} rows")]
    RowOutOfBounds { index: usize, rows: usize },
}

/// The cells of one column.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValues {
    Utf8(Vec<Option<String>>),
    Date(Vec<Option<NaiveDate>>),
    Int64(Vec<Option<i64>>),
    Float64(Vec<Option<f64>>),
}

impl ColumnValues {
    /// An empty column of the given type.
    pub fn empty(data_type: DataType) -> Self {
        match data_type {
            DataType::Utf8 => ColumnValues::Utf8(Vec::new()),
            DataType::Date => ColumnValues::Date(Vec::new()),
            DataType::Int64 => ColumnValues::Int64(Vec::new()),
            DataType::Float64 => ColumnValues::Float64(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ColumnValues::Utf8(v) => v.len(),
            ColumnValues::Date(v) => v.len(),
            ColumnValues::Int64(v) => v.len(),
            ColumnValues::Float64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn data_type(&self) -> DataType {
        match self {
            ColumnValues::Utf8(_) => DataType::Utf8,
            ColumnValues::Date(_) => DataType::Date,
            ColumnValues::Int64(_) => DataType::Int64,
            ColumnValues::Float64(_) => DataType::Float64,
        }
    }

    /// Whether the cell at `index` is null. Blank strings count as null.
    pub fn is_null(&self, index: usize) -> bool {
        match self {
            ColumnValues::Utf8(v) => v[index]
                .as_deref()
                .map_or(true, |s| s.trim().is_empty()),
            ColumnValues::Date(v) => v[index].is_none(),
            ColumnValues::Int64(v) => v[index].is_none(),
            ColumnValues::Float64(v) => v[index].is_none(),
        }
    }

    /// Row indices whose cell is null.
    pub fn null_indices(&self) -> Vec<usize> {
        (0..self.len()).filter(|&i| self.is_null(i)).collect()
    }

    /// Append the cells of `other`, which must have the same type.
    pub fn append(&mut self, other: ColumnValues) -> Result<(), DataType> {
        match (self, other) {
            (ColumnValues::Utf8(a), ColumnValues::Utf8(b)) => a.extend(b),
            (ColumnValues::Date(a), ColumnValues::Date(b)) => a.extend(b),
            (ColumnValues::Int64(a), ColumnValues::Int64(b)) => a.extend(b),
            (ColumnValues::Float64(a), ColumnValues::Float64(b)) => a.extend(b),
            (_, other) => return Err(other.data_type()),
        }
        Ok(())
    }

    /// Cells at `indices`, in that order.
    fn take(&self, indices: &[usize]) -> ColumnValues {
        match self {
            ColumnValues::Utf8(v) => ColumnValues::Utf8(indices.iter().map(|&i| v[i].clone()).collect()),
            ColumnValues::Date(v) => ColumnValues::Date(indices.iter().map(|&i| v[i]).collect()),
            ColumnValues::Int64(v) => ColumnValues::Int64(indices.iter().map(|&i| v[i]).collect()),
            ColumnValues::Float64(v) => {
                ColumnValues::Float64(indices.iter().map(|&i| v[i]).collect())
            }
        }
    }

    /// JSON rendering of one cell.
    pub fn json_value(&self, index: usize) -> Value {
        match self {
            ColumnValues::Utf8(v) => v[index].clone().map_or(Value::Null, Value::String),
            ColumnValues::Date(v) => v[index]
                .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
                .unwrap_or(Value::Null),
            ColumnValues::Int64(v) => v[index].map_or(Value::Null, Value::from),
            ColumnValues::Float64(v) => v[index]
                .and_then(serde_json::Number::from_f64)
                .map_or(Value::Null, Value::Number),
        }
    }
}

/// A named column.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    name: String,
    values: ColumnValues,
}

impl Column {
    pub fn new(name: impl Into<String>, values: ColumnValues) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    pub fn utf8(name: impl Into<String>, values: Vec<Option<String>>) -> Self {
        Self::new(name, ColumnValues::Utf8(values))
    }

    pub fn date(name: impl Into<String>, values: Vec<Option<NaiveDate>>) -> Self {
        Self::new(name, ColumnValues::Date(values))
    }

    pub fn int64(name: impl Into<String>, values: Vec<Option<i64>>) -> Self {
        Self::new(name, ColumnValues::Int64(values))
    }

    pub fn float64(name: impl Into<String>, values: Vec<Option<f64>>) -> Self {
        Self::new(name, ColumnValues::Float64(values))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn values(&self) -> &ColumnValues {
        &self.values
    }

    pub fn data_type(&self) -> DataType {
        self.values.data_type()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// An ordered sequence of rows with a fixed, named column schema.
///
/// # Invariants
///
/// - Every column has exactly `num_rows` cells.
/// - Column names are unique.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    columns: Vec<Column>,
    num_rows: usize,
}

impl Table {
    /// Build a table, checking column lengths and name uniqueness.
    pub fn new(columns: Vec<Column>) -> Result<Self, TableError> {
        let num_rows = columns.first().map_or(0, Column::len);
        for (i, column) in columns.iter().enumerate() {
            if column.len() != num_rows {
                return Err(TableError::LengthMismatch {
                    column: column.name.clone(),
                    expected: num_rows,
                    actual: column.len(),
                });
            }
            if columns[..i].iter().any(|c| c.name == column.name) {
                return Err(TableError::DuplicateColumn(column.name.clone()));
            }
        }
        Ok(Self { columns, num_rows })
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows == 0
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Look up a column and check its type.
    pub fn require(&self, name: &str, expected: DataType) -> Result<&ColumnValues, TableError> {
        let column = self
            .column(name)
            .ok_or_else(|| TableError::MissingColumn(name.to_string()))?;
        if column.data_type() != expected {
            return Err(TableError::TypeMismatch {
                column: name.to_string(),
                expected,
                actual: column.data_type(),
            });
        }
        Ok(&column.values)
    }

    pub fn strings(&self, name: &str) -> Result<&[Option<String>], TableError> {
        match self.require(name, DataType::Utf8)? {
            ColumnValues::Utf8(v) => Ok(v),
            _ => unreachable!("type checked by require"),
        }
    }

    pub fn dates(&self, name: &str) -> Result<&[Option<NaiveDate>], TableError> {
        match self.require(name, DataType::Date)? {
            ColumnValues::Date(v) => Ok(v),
            _ => unreachable!("type checked by require"),
        }
    }

    pub fn ints(&self, name: &str) -> Result<&[Option<i64>], TableError> {
        match self.require(name, DataType::Int64)? {
            ColumnValues::Int64(v) => Ok(v),
            _ => unreachable!("type checked by require"),
        }
    }

    pub fn floats(&self, name: &str) -> Result<&[Option<f64>], TableError> {
        match self.require(name, DataType::Float64)? {
            ColumnValues::Float64(v) => Ok(v),
            _ => unreachable!("type checked by require"),
        }
    }

    /// Return a new table with `column` added, or replacing a column of the
    /// same name in place.
    pub fn with_column(&self, column: Column) -> Result<Table, TableError> {
        let mut columns = self.columns.clone();
        match columns.iter_mut().find(|c| c.name == column.name) {
            Some(existing) => *existing = column,
            None => columns.push(column),
        }
        Table::new(columns)
    }

    /// Return a new table holding only `names`, in that order.
    pub fn select(&self, names: &[&str]) -> Result<Table, TableError> {
        let columns = names
            .iter()
            .map(|name| {
                self.column(name)
                    .cloned()
                    .ok_or_else(|| TableError::MissingColumn((*name).to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Table::new(columns)
    }

    /// Return a new table holding the rows at `indices`, in that order.
    pub fn take(&self, indices: &[usize]) -> Result<Table, TableError> {
        if let Some(&index) = indices.iter().find(|&&i| i >= self.num_rows) {
            return Err(TableError::RowOutOfBounds {
                index,
                rows: self.num_rows,
            });
        }
        let columns = self
            .columns
            .iter()
            .map(|c| Column::new(c.name.clone(), c.values.take(indices)))
            .collect();
        Table::new(columns)
    }

    /// One JSON object per row, keyed by column name.
    pub fn to_json_rows(&self) -> Vec<Map<String, Value>> {
        (0..self.num_rows)
            .map(|row| {
                self.columns
                    .iter()
                    .map(|c| (c.name.clone(), c.values.json_value(row)))
                    .collect()
            })
            .collect()
    }

    /// Dataset handed to a relational sink.
    pub fn to_sink_table(&self) -> SinkTable {
        SinkTable {
            columns: self.column_names().into_iter().map(str::to_string).collect(),
            rows: self.to_json_rows(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Table {
        Table::new(vec![
            Column::utf8(ENTITY, vec![Some("A".into()), None, Some("B".into())]),
            Column::int64(CONFIRMED, vec![Some(5), Some(7), None]),
        ])
        .unwrap()
    }

    #[test]
    fn test_new_rejects_length_mismatch() {
        let err = Table::new(vec![
            Column::utf8(ENTITY, vec![Some("A".into())]),
            Column::int64(CONFIRMED, vec![Some(1), Some(2)]),
        ])
        .unwrap_err();
        assert!(matches!(err, TableError::LengthMismatch { expected: 1, actual: 2, .. }));
    }

    #[test]
    fn test_new_rejects_duplicate_column() {
        let err = Table::new(vec![
            Column::int64(CONFIRMED, vec![Some(1)]),
            Column::int64(CONFIRMED, vec![Some(2)]),
        ])
        .unwrap_err();
        assert_eq!(err, TableError::DuplicateColumn(CONFIRMED.to_string()));
    }

    #[test]
    fn test_typed_accessors() {
        let table = sample();
        assert_eq!(table.num_rows(), 3);
        assert_eq!(table.ints(CONFIRMED).unwrap(), &[Some(5), Some(7), None]);
        assert!(matches!(
            table.dates(CONFIRMED),
            Err(TableError::TypeMismatch { .. })
        ));
        assert!(matches!(
            table.ints("missing"),
            Err(TableError::MissingColumn(_))
        ));
    }

    #[test]
    fn test_with_column_does_not_touch_input() {
        let table = sample();
        let extended = table
            .with_column(Column::float64("ratio", vec![Some(0.5), None, Some(1.0)]))
            .unwrap();
        assert_eq!(table.num_columns(), 2);
        assert_eq!(extended.column_names(), vec![ENTITY, CONFIRMED, "ratio"]);

        let replaced = extended
            .with_column(Column::int64(CONFIRMED, vec![Some(0), Some(0), Some(0)]))
            .unwrap();
        assert_eq!(replaced.column_names(), vec![ENTITY, CONFIRMED, "ratio"]);
        assert_eq!(replaced.ints(CONFIRMED).unwrap(), &[Some(0), Some(0), Some(0)]);
    }

    #[test]
    fn test_blank_strings_count_as_null() {
        let values = ColumnValues::Utf8(vec![Some("x".into()), Some("  ".into()), None]);
        assert_eq!(values.null_indices(), vec![1, 2]);
    }

    #[test]
    fn test_take_and_select() {
        let table = sample();
        let picked = table.take(&[2, 0]).unwrap();
        assert_eq!(picked.strings(ENTITY).unwrap(), &[Some("B".into()), Some("A".into())]);
        assert!(table.take(&[3]).is_err());

        let narrowed = table.select(&[CONFIRMED]).unwrap();
        assert_eq!(narrowed.column_names(), vec![CONFIRMED]);
    }

    #[test]
    fn test_json_rows() {
        let rows = sample().to_json_rows();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["entity"], Value::String("A".into()));
        assert_eq!(rows[1]["entity"], Value::Null);
        assert_eq!(rows[2]["confirmed"], Value::Null);
    }
}
