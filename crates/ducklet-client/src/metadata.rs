//! Column metadata and row shaping

use duckdb::arrow::datatypes::{DataType, Schema, TimeUnit};
use ducklet_common::RowFormat;
use indexmap::IndexMap;
use serde::Serialize;

use crate::value::Value;

/// Name and engine type label of one result column
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub type_label: String,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, type_label: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_label: type_label.into(),
        }
    }
}

/// Ordered column descriptors of one result
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultMetadata {
    columns: Vec<ColumnDescriptor>,
}

impl ResultMetadata {
    pub fn new(columns: Vec<ColumnDescriptor>) -> Self {
        Self { columns }
    }

    /// Derive descriptors from an Arrow result schema, labelling types the way DuckDB names them
    pub fn from_schema(schema: &Schema) -> Self {
        let columns = schema
            .fields()
            .iter()
            .map(|f| ColumnDescriptor::new(f.name().clone(), type_label(f.data_type())))
            .collect();
        Self { columns }
    }

    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// `(name, type label)` pairs in column order
    pub fn describe(&self) -> Vec<(String, String)> {
        self.columns
            .iter()
            .map(|c| (c.name.clone(), c.type_label.clone()))
            .collect()
    }

    /// Arrange converted values into the requested row shape
    pub fn shape_row(&self, values: Vec<Value>, format: RowFormat) -> Row {
        match format {
            RowFormat::Array => Row::Array(values),
            RowFormat::Object => {
                let mut fields = IndexMap::with_capacity(values.len());
                for (column, value) in self.columns.iter().zip(values) {
                    fields.insert(column.name.clone(), value);
                }
                Row::Object(fields)
            }
        }
    }
}

/// One result row
///
/// `Object` rows map column names to values. When a result has duplicate column names the
/// last column wins and the key keeps the position of its first occurrence; use
/// [`RowFormat::Array`] to keep every column.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Row {
    Array(Vec<Value>),
    Object(IndexMap<String, Value>),
}

impl Row {
    pub fn len(&self) -> usize {
        match self {
            Row::Array(values) => values.len(),
            Row::Object(fields) => fields.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Value at a position.
    ///
    /// On `Object` rows this is the position among distinct names, so with duplicate column
    /// names it no longer matches the result's column index.
    pub fn get(&self, index: usize) -> Option<&Value> {
        match self {
            Row::Array(values) => values.get(index),
            Row::Object(fields) => fields.get_index(index).map(|(_, v)| v),
        }
    }

    /// Value by column name; only available on `Object` rows
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        match self {
            Row::Array(_) => None,
            Row::Object(fields) => fields.get(name),
        }
    }
}

/// DuckDB SQL name for an Arrow type produced by the engine
pub fn type_label(data_type: &DataType) -> String {
    match data_type {
        DataType::Null => "NULL".into(),
        DataType::Boolean => "BOOLEAN".into(),
        DataType::Int8 => "TINYINT".into(),
        DataType::Int16 => "SMALLINT".into(),
        DataType::Int32 => "INTEGER".into(),
        DataType::Int64 => "BIGINT".into(),
        DataType::UInt8 => "UTINYINT".into(),
        DataType::UInt16 => "USMALLINT".into(),
        DataType::UInt32 => "UINTEGER".into(),
        DataType::UInt64 => "UBIGINT".into(),
        DataType::Float32 => "FLOAT".into(),
        DataType::Float64 => "DOUBLE".into(),
        DataType::Decimal128(precision, scale) => format!("DECIMAL({},{})", precision, scale),
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => "VARCHAR".into(),
        DataType::Binary | DataType::LargeBinary | DataType::BinaryView => "BLOB".into(),
        DataType::Date32 | DataType::Date64 => "DATE".into(),
        DataType::Time32(_) | DataType::Time64(_) => "TIME".into(),
        DataType::Timestamp(unit, tz) => {
            let base = match unit {
                TimeUnit::Second => "TIMESTAMP_S",
                TimeUnit::Millisecond => "TIMESTAMP_MS",
                TimeUnit::Microsecond => "TIMESTAMP",
                TimeUnit::Nanosecond => "TIMESTAMP_NS",
            };
            if tz.is_some() {
                format!("{} WITH TIME ZONE", base)
            } else {
                base.to_string()
            }
        }
        DataType::Interval(_) | DataType::Duration(_) => "INTERVAL".into(),
        DataType::Dictionary(_, _) => "ENUM".into(),
        DataType::List(field) | DataType::LargeList(field) => {
            format!("{}[]", type_label(field.data_type()))
        }
        DataType::FixedSizeList(field, size) => {
            format!("{}[{}]", type_label(field.data_type()), size)
        }
        DataType::Struct(fields) => {
            let members: Vec<String> = fields
                .iter()
                .map(|f| format!("{} {}", f.name(), type_label(f.data_type())))
                .collect();
            format!("STRUCT({})", members.join(", "))
        }
        other => other.to_string(),
    }
}
