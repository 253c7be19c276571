//! Ducklet Client
//!
//! Result cursors and backpressured row streams over an embedded DuckDB database.
//!
//! ```no_run
//! # async fn run() -> ducklet_common::Result<()> {
//! use ducklet_client::{Database, ExecuteOptions};
//! use ducklet_common::DatabaseConfig;
//! use futures::StreamExt;
//!
//! let db = Database::open(&DatabaseConfig::in_memory())?;
//! let session = db.connect()?;
//! let mut rows = session
//!     .execute_stream("SELECT * FROM range(10)", ExecuteOptions::streaming())
//!     .await?;
//! while let Some(row) = rows.next().await {
//!     println!("{:?}", row?);
//! }
//! # Ok(())
//! # }
//! ```

pub mod cursor;
pub mod database;
pub mod duckdb_engine;
pub mod engine;
pub mod metadata;
pub mod session;
pub mod stream;
pub mod value;

pub use cursor::{ResultCursor, RowShape};
pub use database::Database;
pub use duckdb_engine::DuckDbEngine;
pub use engine::{NativeResultHandle, QueryEngine, ResultKind};
pub use metadata::{ColumnDescriptor, ResultMetadata, Row};
pub use session::{ExecuteOptions, PendingQuery, QueryResult, Session};
pub use stream::RowStream;
pub use value::{coerce, coerce_row, NativeValue, Value};
