//! Narrow interface onto the embedded query engine
//!
//! A session only ever talks to the engine through [`QueryEngine`]: execute a statement, pull
//! tuples from the resulting handle, describe it and release it.

use std::fmt;

use ducklet_common::Result;

use crate::metadata::ColumnDescriptor;
use crate::value::NativeValue;

/// Whether a result is buffered up front or fetched on demand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultKind {
    Materialized,
    Streaming,
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultKind::Materialized => write!(f, "Materialized"),
            ResultKind::Streaming => write!(f, "Streaming"),
        }
    }
}

/// Engine-owned result of one executed statement.
///
/// Deliberately neither `Clone` nor `Copy`: the cursor that receives it is its only owner.
#[derive(Debug, PartialEq, Eq)]
pub struct NativeResultHandle {
    id: u64,
}

impl NativeResultHandle {
    pub fn new(id: u64) -> Self {
        Self { id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Operations consumed from the query engine, per executed statement
pub trait QueryEngine: Send + Sync {
    /// Run `sql` and register its result
    fn execute_statement(&self, sql: &str, kind: ResultKind) -> Result<NativeResultHandle>;

    /// Next tuple, or `None` once the result is exhausted
    fn fetch_next(&self, handle: &NativeResultHandle) -> Result<Option<Vec<NativeValue>>>;

    fn describe_result(&self, handle: &NativeResultHandle) -> Result<Vec<ColumnDescriptor>>;

    /// Free the result; calling it again for the same handle is a no-op
    fn release_result(&self, handle: &NativeResultHandle);
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted engine for exercising cursor and stream lifecycles without DuckDB

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::time::Duration;

    use ducklet_common::DuckletError;
    use parking_lot::Mutex;

    use super::*;

    struct ScriptedResult {
        kind: ResultKind,
        position: usize,
        superseded: bool,
    }

    /// Serves the same scripted rows for every statement
    pub(crate) struct ScriptedEngine {
        columns: Vec<ColumnDescriptor>,
        rows: Vec<Vec<NativeValue>>,
        /// Fail the fetch of this row index with an engine error
        fail_at: Option<usize>,
        /// Sleep inside every fetch, outside the result table lock
        fetch_delay: Option<Duration>,
        results: Mutex<HashMap<u64, ScriptedResult>>,
        next_id: AtomicU64,
        pub(crate) release_calls: AtomicUsize,
        pub(crate) fetch_calls: AtomicUsize,
    }

    impl ScriptedEngine {
        pub(crate) fn with_rows(count: i32) -> Self {
            Self {
                columns: vec![
                    ColumnDescriptor::new("id", "INTEGER"),
                    ColumnDescriptor::new("name", "VARCHAR"),
                ],
                rows: (0..count)
                    .map(|i| {
                        vec![
                            NativeValue::Integer(i),
                            NativeValue::Varchar(format!("row_{}", i)),
                        ]
                    })
                    .collect(),
                fail_at: None,
                fetch_delay: None,
                results: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                release_calls: AtomicUsize::new(0),
                fetch_calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn failing_at(mut self, row: usize) -> Self {
            self.fail_at = Some(row);
            self
        }

        pub(crate) fn with_fetch_delay(mut self, delay: Duration) -> Self {
            self.fetch_delay = Some(delay);
            self
        }

        pub(crate) fn releases(&self) -> usize {
            self.release_calls.load(Ordering::SeqCst)
        }

        pub(crate) fn fetches(&self) -> usize {
            self.fetch_calls.load(Ordering::SeqCst)
        }

        pub(crate) fn live_results(&self) -> usize {
            self.results.lock().len()
        }
    }

    impl QueryEngine for ScriptedEngine {
        fn execute_statement(&self, sql: &str, kind: ResultKind) -> Result<NativeResultHandle> {
            if sql.starts_with("FAIL") {
                return Err(DuckletError::engine("Parser Error: syntax error at or near \"FAIL\""));
            }
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let mut results = self.results.lock();
            for result in results.values_mut() {
                if result.kind == ResultKind::Streaming {
                    result.superseded = true;
                }
            }
            results.insert(
                id,
                ScriptedResult {
                    kind,
                    position: 0,
                    superseded: false,
                },
            );
            Ok(NativeResultHandle::new(id))
        }

        fn fetch_next(&self, handle: &NativeResultHandle) -> Result<Option<Vec<NativeValue>>> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.fetch_delay {
                std::thread::sleep(delay);
            }
            let mut results = self.results.lock();
            let result = results
                .get_mut(&handle.id())
                .ok_or(DuckletError::ResultClosed)?;
            if result.superseded {
                return Err(DuckletError::StreamSuperseded);
            }
            if self.fail_at == Some(result.position) {
                return Err(DuckletError::engine("IO Error: scripted failure"));
            }
            let row = self.rows.get(result.position).cloned();
            if row.is_some() {
                result.position += 1;
            }
            Ok(row)
        }

        fn describe_result(&self, handle: &NativeResultHandle) -> Result<Vec<ColumnDescriptor>> {
            if self.results.lock().contains_key(&handle.id()) {
                Ok(self.columns.clone())
            } else {
                Err(DuckletError::ResultClosed)
            }
        }

        fn release_result(&self, handle: &NativeResultHandle) {
            self.release_calls.fetch_add(1, Ordering::SeqCst);
            self.results.lock().remove(&handle.id());
        }
    }
}
