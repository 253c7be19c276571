//! DuckDB-backed query engine
//!
//! Each engine owns one DuckDB connection. Statements run through DuckDB's Arrow interface and
//! their record batches are held in a result table keyed by handle id; tuples are cut out of the
//! batches one row at a time on fetch.
//!
//! DuckDB allows one pending streaming result per connection, so executing any new statement
//! invalidates the streaming results still registered on this engine.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use duckdb::arrow::array::*;
use duckdb::arrow::datatypes::{DataType, TimeUnit};
use duckdb::arrow::util::display::{ArrayFormatter, FormatOptions};
use duckdb::{params, Connection};
use ducklet_common::{DuckletError, Result};
use parking_lot::Mutex;
use tracing::{debug, instrument, warn};

use crate::engine::{NativeResultHandle, QueryEngine, ResultKind};
use crate::metadata::{type_label, ColumnDescriptor, ResultMetadata};
use crate::value::NativeValue;

/// Buffered record batches of one executed statement
struct NativeResult {
    kind: ResultKind,
    columns: Vec<ColumnDescriptor>,
    batches: Vec<RecordBatch>,
    /// Current position in the batches
    batch_index: usize,
    /// Current row within the current batch
    row_index: usize,
    /// Set once a newer statement ran on the same connection
    superseded: bool,
}

impl NativeResult {
    fn next_row(&mut self) -> Result<Option<Vec<NativeValue>>> {
        while self.batch_index < self.batches.len() {
            let batch = &self.batches[self.batch_index];
            if self.row_index < batch.num_rows() {
                let row = extract_row(batch, self.row_index)?;
                self.row_index += 1;
                return Ok(Some(row));
            }
            self.batch_index += 1;
            self.row_index = 0;
        }
        Ok(None)
    }
}

/// Query engine over a single DuckDB connection
pub struct DuckDbEngine {
    connection: Mutex<Connection>,
    results: DashMap<u64, NativeResult>,
    next_id: AtomicU64,
}

impl DuckDbEngine {
    pub fn new(connection: Connection) -> Self {
        Self {
            connection: Mutex::new(connection),
            results: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Number of results not yet released
    pub fn open_results(&self) -> usize {
        self.results.len()
    }

    fn supersede_streams(&self) {
        for mut entry in self.results.iter_mut() {
            let result = entry.value_mut();
            if result.kind == ResultKind::Streaming && !result.superseded {
                result.superseded = true;
                result.batches.clear();
                debug!(handle = *entry.key(), "Streaming result superseded by new statement");
            }
        }
    }
}

impl QueryEngine for DuckDbEngine {
    #[instrument(skip(self))]
    fn execute_statement(&self, sql: &str, kind: ResultKind) -> Result<NativeResultHandle> {
        let connection = self.connection.lock();

        let mut stmt = connection.prepare(sql).map_err(DuckletError::engine)?;
        let arrow_result = stmt.query_arrow(params![]).map_err(DuckletError::engine)?;

        // Get schema before consuming iterator
        let schema = arrow_result.get_schema();
        let batches: Vec<RecordBatch> = arrow_result.filter(|b| b.num_rows() > 0).collect();
        drop(stmt);
        drop(connection);

        self.supersede_streams();

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let total_rows: usize = batches.iter().map(|b| b.num_rows()).sum();
        debug!(
            handle = id,
            %kind,
            batches = batches.len(),
            total_rows,
            "Statement executed"
        );

        self.results.insert(
            id,
            NativeResult {
                kind,
                columns: ResultMetadata::from_schema(&schema).columns().to_vec(),
                batches,
                batch_index: 0,
                row_index: 0,
                superseded: false,
            },
        );
        Ok(NativeResultHandle::new(id))
    }

    fn fetch_next(&self, handle: &NativeResultHandle) -> Result<Option<Vec<NativeValue>>> {
        let mut result = self
            .results
            .get_mut(&handle.id())
            .ok_or(DuckletError::ResultClosed)?;
        if result.superseded {
            return Err(DuckletError::StreamSuperseded);
        }
        result.next_row()
    }

    fn describe_result(&self, handle: &NativeResultHandle) -> Result<Vec<ColumnDescriptor>> {
        self.results
            .get(&handle.id())
            .map(|result| result.columns.clone())
            .ok_or(DuckletError::ResultClosed)
    }

    fn release_result(&self, handle: &NativeResultHandle) {
        if self.results.remove(&handle.id()).is_none() {
            warn!(handle = handle.id(), "Release of unknown or already released result");
        }
    }
}

/// Extract a single row from a RecordBatch as tagged values
fn extract_row(batch: &RecordBatch, row_idx: usize) -> Result<Vec<NativeValue>> {
    batch
        .columns()
        .iter()
        .map(|col| native_value(col, row_idx))
        .collect()
}

fn downcast<T: Array + 'static>(col: &ArrayRef) -> Result<&T> {
    col.as_any().downcast_ref::<T>().ok_or_else(|| {
        DuckletError::internal(format!(
            "{} column is not a {}",
            col.data_type(),
            std::any::type_name::<T>()
        ))
    })
}

fn to_micros(unit: &TimeUnit, value: i64) -> i64 {
    match unit {
        TimeUnit::Second => value.saturating_mul(1_000_000),
        TimeUnit::Millisecond => value.saturating_mul(1_000),
        TimeUnit::Microsecond => value,
        TimeUnit::Nanosecond => value / 1_000,
    }
}

fn native_value(col: &ArrayRef, row_idx: usize) -> Result<NativeValue> {
    if col.is_null(row_idx) {
        return Ok(NativeValue::Null);
    }

    let value = match col.data_type() {
        DataType::Null => NativeValue::Null,
        DataType::Boolean => NativeValue::Boolean(downcast::<BooleanArray>(col)?.value(row_idx)),
        DataType::Int8 => NativeValue::TinyInt(downcast::<Int8Array>(col)?.value(row_idx)),
        DataType::Int16 => NativeValue::SmallInt(downcast::<Int16Array>(col)?.value(row_idx)),
        DataType::Int32 => NativeValue::Integer(downcast::<Int32Array>(col)?.value(row_idx)),
        DataType::Int64 => NativeValue::BigInt(downcast::<Int64Array>(col)?.value(row_idx)),
        // Unsigned widths widen into the next signed tag
        DataType::UInt8 => {
            NativeValue::SmallInt(i16::from(downcast::<UInt8Array>(col)?.value(row_idx)))
        }
        DataType::UInt16 => {
            NativeValue::Integer(i32::from(downcast::<UInt16Array>(col)?.value(row_idx)))
        }
        DataType::UInt32 => {
            NativeValue::BigInt(i64::from(downcast::<UInt32Array>(col)?.value(row_idx)))
        }
        DataType::UInt64 => NativeValue::Decimal {
            unscaled: i128::from(downcast::<UInt64Array>(col)?.value(row_idx)),
            scale: 0,
        },
        DataType::Float32 => {
            NativeValue::Double(f64::from(downcast::<Float32Array>(col)?.value(row_idx)))
        }
        DataType::Float64 => NativeValue::Double(downcast::<Float64Array>(col)?.value(row_idx)),
        DataType::Decimal128(_, scale) => NativeValue::Decimal {
            unscaled: downcast::<Decimal128Array>(col)?.value(row_idx),
            scale: *scale,
        },
        DataType::Utf8 => {
            NativeValue::Varchar(downcast::<StringArray>(col)?.value(row_idx).to_string())
        }
        DataType::LargeUtf8 => {
            NativeValue::Varchar(downcast::<LargeStringArray>(col)?.value(row_idx).to_string())
        }
        DataType::Utf8View => {
            NativeValue::Varchar(downcast::<StringViewArray>(col)?.value(row_idx).to_string())
        }
        DataType::Date32 => NativeValue::Date(downcast::<Date32Array>(col)?.value(row_idx)),
        DataType::Date64 => NativeValue::Timestamp(to_micros(
            &TimeUnit::Millisecond,
            downcast::<Date64Array>(col)?.value(row_idx),
        )),
        DataType::Timestamp(unit, _) => {
            let raw = match unit {
                TimeUnit::Second => downcast::<TimestampSecondArray>(col)?.value(row_idx),
                TimeUnit::Millisecond => {
                    downcast::<TimestampMillisecondArray>(col)?.value(row_idx)
                }
                TimeUnit::Microsecond => {
                    downcast::<TimestampMicrosecondArray>(col)?.value(row_idx)
                }
                TimeUnit::Nanosecond => downcast::<TimestampNanosecondArray>(col)?.value(row_idx),
            };
            NativeValue::Timestamp(to_micros(unit, raw))
        }
        DataType::Time32(unit) => {
            let raw = match unit {
                TimeUnit::Second => i64::from(downcast::<Time32SecondArray>(col)?.value(row_idx)),
                _ => i64::from(downcast::<Time32MillisecondArray>(col)?.value(row_idx)),
            };
            NativeValue::Time(to_micros(unit, raw))
        }
        DataType::Time64(unit) => {
            let raw = match unit {
                TimeUnit::Nanosecond => downcast::<Time64NanosecondArray>(col)?.value(row_idx),
                _ => downcast::<Time64MicrosecondArray>(col)?.value(row_idx),
            };
            NativeValue::Time(to_micros(unit, raw))
        }
        // ENUM columns arrive dictionary encoded
        DataType::Dictionary(_, _) => {
            let formatter = ArrayFormatter::try_new(col.as_ref(), &FormatOptions::default())
                .map_err(DuckletError::internal)?;
            NativeValue::Varchar(formatter.value(row_idx).to_string())
        }
        other => return Err(DuckletError::UnsupportedType(type_label(other))),
    };

    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> DuckDbEngine {
        DuckDbEngine::new(Connection::open_in_memory().unwrap())
    }

    fn drain(engine: &DuckDbEngine, handle: &NativeResultHandle) -> Vec<Vec<NativeValue>> {
        let mut rows = Vec::new();
        while let Some(row) = engine.fetch_next(handle).unwrap() {
            rows.push(row);
        }
        rows
    }

    #[test]
    fn test_record_with_all_types() {
        let engine = engine();
        let handle = engine
            .execute_statement(
                "SELECT
                    NULL,
                    true,
                    0,
                    CAST(1 AS TINYINT),
                    CAST(8 AS SMALLINT),
                    10000,
                    9223372036854775807,
                    1.1,
                    CAST(1.1 AS DOUBLE),
                    'stringy',
                    TIMESTAMP '1971-02-02 01:01:01.001',
                    DATE '1971-02-02',
                    TIME '01:01:01.001'",
                ResultKind::Materialized,
            )
            .unwrap();

        let row = engine.fetch_next(&handle).unwrap().unwrap();
        assert_eq!(
            row,
            vec![
                NativeValue::Null,
                NativeValue::Boolean(true),
                NativeValue::Integer(0),
                NativeValue::TinyInt(1),
                NativeValue::SmallInt(8),
                NativeValue::Integer(10_000),
                NativeValue::BigInt(i64::MAX),
                NativeValue::Decimal { unscaled: 11, scale: 1 },
                NativeValue::Double(1.1),
                NativeValue::Varchar("stringy".into()),
                NativeValue::Timestamp(34_304_461_001_000),
                NativeValue::Date(397),
                NativeValue::Time(3_661_001_000),
            ]
        );
        assert_eq!(engine.fetch_next(&handle).unwrap(), None);
        assert_eq!(engine.fetch_next(&handle).unwrap(), None);
    }

    #[test]
    fn test_describe_column_names() {
        let engine = engine();
        let handle = engine
            .execute_statement(
                "SELECT 0 AS zero, 'something' AS something, 'other' AS something",
                ResultKind::Materialized,
            )
            .unwrap();
        let columns = engine.describe_result(&handle).unwrap();
        let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names.len(), 3);
        assert_eq!(names[0], "zero");
        assert_eq!(columns[0].type_label, "INTEGER");
        assert_eq!(columns[1].type_label, "VARCHAR");
    }

    #[test]
    fn test_rows_span_batches() {
        let engine = engine();
        let handle = engine
            .execute_statement("SELECT range AS i FROM range(5000)", ResultKind::Streaming)
            .unwrap();
        let rows = drain(&engine, &handle);
        assert_eq!(rows.len(), 5000);
        assert_eq!(rows[0], vec![NativeValue::BigInt(0)]);
        assert_eq!(rows[4999], vec![NativeValue::BigInt(4999)]);
    }

    #[test]
    fn test_engine_error_message_preserved() {
        let engine = engine();
        let err = engine
            .execute_statement("SELECT * FROM missing_table", ResultKind::Streaming)
            .unwrap_err();
        assert!(matches!(err, DuckletError::Engine(_)));
        assert!(err.to_string().contains("missing_table"));
        assert_eq!(engine.open_results(), 0);
    }

    #[test]
    fn test_new_statement_supersedes_stream() {
        let engine = engine();
        let first = engine
            .execute_statement("SELECT 1", ResultKind::Streaming)
            .unwrap();
        let second = engine
            .execute_statement("SELECT 2", ResultKind::Materialized)
            .unwrap();

        assert_eq!(
            engine.fetch_next(&first).unwrap_err(),
            DuckletError::StreamSuperseded
        );
        assert_eq!(
            engine.fetch_next(&second).unwrap(),
            Some(vec![NativeValue::Integer(2)])
        );
    }

    #[test]
    fn test_release_is_idempotent() {
        let engine = engine();
        let handle = engine
            .execute_statement("SELECT 1", ResultKind::Streaming)
            .unwrap();
        engine.release_result(&handle);
        engine.release_result(&handle);
        assert_eq!(engine.open_results(), 0);
        assert_eq!(
            engine.fetch_next(&handle).unwrap_err(),
            DuckletError::ResultClosed
        );
    }

    #[test]
    fn test_parquet_round_trip() {
        let engine = engine();
        let path = std::env::temp_dir().join(format!(
            "ducklet-parquet-{}-{}.parquet",
            std::process::id(),
            engine.next_id.load(Ordering::Relaxed)
        ));
        let path = path.to_string_lossy().replace('\'', "''");

        let copy = engine
            .execute_statement(
                &format!(
                    "COPY (SELECT range AS id, 'row_' || range AS name FROM range(3)) \
                     TO '{}' (FORMAT PARQUET)",
                    path
                ),
                ResultKind::Materialized,
            )
            .unwrap();
        engine.release_result(&copy);

        let handle = engine
            .execute_statement(
                &format!("SELECT id, name FROM read_parquet('{}') ORDER BY id", path),
                ResultKind::Materialized,
            )
            .unwrap();
        let rows = drain(&engine, &handle);
        assert_eq!(rows.len(), 3);
        assert_eq!(
            rows[2],
            vec![NativeValue::BigInt(2), NativeValue::Varchar("row_2".into())]
        );

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_enum_and_unsigned_values() {
        let engine = engine();
        let handle = engine
            .execute_statement(
                "SELECT 'sad'::ENUM('sad', 'happy') AS mood, CAST(200 AS UTINYINT) AS small",
                ResultKind::Materialized,
            )
            .unwrap();
        let rows = drain(&engine, &handle);
        assert_eq!(
            rows,
            vec![vec![
                NativeValue::Varchar("sad".into()),
                NativeValue::SmallInt(200),
            ]]
        );
    }
}
