//! Conversion between [`Table`] and Arrow record batches.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Date32Array, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType as ArrowType, Field, Schema, SchemaRef};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use chrono::{Datelike, NaiveDate};

use super::{Column, ColumnValues, DataType, Table, TableError};

/// `NaiveDate::num_days_from_ce` of 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// Days since the Unix epoch, as stored in an Arrow `Date32` column.
pub fn date_to_days(date: NaiveDate) -> i32 {
    date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE
}

/// Inverse of [`date_to_days`].
pub fn days_to_date(days: i32) -> Option<NaiveDate> {
    NaiveDate::from_num_days_from_ce_opt(days.checked_add(UNIX_EPOCH_DAYS_FROM_CE)?)
}

impl DataType {
    pub fn to_arrow(self) -> ArrowType {
        match self {
            DataType::Utf8 => ArrowType::Utf8,
            DataType::Date => ArrowType::Date32,
            DataType::Int64 => ArrowType::Int64,
            DataType::Float64 => ArrowType::Float64,
        }
    }

    pub fn from_arrow(data_type: &ArrowType) -> Option<Self> {
        match data_type {
            ArrowType::Utf8 => Some(DataType::Utf8),
            ArrowType::Date32 => Some(DataType::Date),
            ArrowType::Int64 => Some(DataType::Int64),
            ArrowType::Float64 => Some(DataType::Float64),
            _ => None,
        }
    }
}

impl ColumnValues {
    fn to_array(&self) -> ArrayRef {
        match self {
            ColumnValues::Utf8(v) => Arc::new(StringArray::from(v.clone())),
            ColumnValues::Date(v) => Arc::new(Date32Array::from(
                v.iter().map(|d| d.map(date_to_days)).collect::<Vec<_>>(),
            )),
            ColumnValues::Int64(v) => Arc::new(Int64Array::from(v.clone())),
            ColumnValues::Float64(v) => Arc::new(Float64Array::from(v.clone())),
        }
    }

    fn from_array(name: &str, array: &dyn Array) -> Result<Self, TableError> {
        let unsupported = || TableError::UnsupportedType {
            column: name.to_string(),
            data_type: array.data_type().to_string(),
        };
        let data_type = DataType::from_arrow(array.data_type()).ok_or_else(unsupported)?;
        let any = array.as_any();
        let values = match data_type {
            DataType::Utf8 => ColumnValues::Utf8(
                any.downcast_ref::<StringArray>()
                    .ok_or_else(unsupported)?
                    .iter()
                    .map(|v| v.map(str::to_string))
                    .collect(),
            ),
            DataType::Date => ColumnValues::Date(
                any.downcast_ref::<Date32Array>()
                    .ok_or_else(unsupported)?
                    .iter()
                    .map(|v| v.and_then(days_to_date))
                    .collect(),
            ),
            DataType::Int64 => ColumnValues::Int64(
                any.downcast_ref::<Int64Array>()
                    .ok_or_else(unsupported)?
                    .iter()
                    .collect(),
            ),
            DataType::Float64 => ColumnValues::Float64(
                any.downcast_ref::<Float64Array>()
                    .ok_or_else(unsupported)?
                    .iter()
                    .collect(),
            ),
        };
        Ok(values)
    }
}

impl Table {
    /// Arrow schema for this table; every field is nullable.
    pub fn arrow_schema(&self) -> SchemaRef {
        let fields: Vec<Field> = self
            .columns()
            .iter()
            .map(|c| Field::new(c.name(), c.data_type().to_arrow(), true))
            .collect();
        Arc::new(Schema::new(fields))
    }

    pub fn to_record_batch(&self) -> Result<RecordBatch, ArrowError> {
        let arrays = self.columns().iter().map(|c| c.values().to_array()).collect();
        RecordBatch::try_new(self.arrow_schema(), arrays)
    }

    pub fn from_record_batch(batch: &RecordBatch) -> Result<Table, TableError> {
        Self::from_record_batches(batch.schema().as_ref(), std::slice::from_ref(batch))
    }

    /// Concatenate `batches`, all sharing `schema`, into one table. An empty
    /// slice yields an empty table with the schema's columns.
    pub fn from_record_batches(
        schema: &Schema,
        batches: &[RecordBatch],
    ) -> Result<Table, TableError> {
        let mut columns = Vec::with_capacity(schema.fields().len());
        for (index, field) in schema.fields().iter().enumerate() {
            let data_type =
                DataType::from_arrow(field.data_type()).ok_or_else(|| {
                    TableError::UnsupportedType {
                        column: field.name().clone(),
                        data_type: field.data_type().to_string(),
                    }
                })?;
            let mut values = ColumnValues::empty(data_type);
            for batch in batches {
                let chunk = ColumnValues::from_array(field.name(), batch.column(index).as_ref())?;
                values
                    .append(chunk)
                    .map_err(|actual| TableError::TypeMismatch {
                        column: field.name().clone(),
                        expected: data_type,
                        actual,
                    })?;
            }
            columns.push(Column::new(field.name().clone(), values));
        }
        Table::new(columns)
    }
}
