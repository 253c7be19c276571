//! Ducklet
//!
//! Runs one SQL statement against an embedded DuckDB database and prints the result rows to
//! stdout as JSON lines.
//!
//! Rows are pulled through a cursor by default, or pushed through a backpressured stream with
//! `--stream`.

mod telemetry;

use std::time::Instant;

use clap::Parser;
use ducklet_client::{Database, ExecuteOptions, QueryResult, Row};
use ducklet_common::config::{load_from_env, AccessMode};
use ducklet_common::{BigIntMode, ClientConfig, DatabaseConfig, RowFormat};
use futures::StreamExt;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "ducklet")]
#[command(about = "Run one query against an embedded DuckDB database")]
struct Args {
    /// SQL statement to execute
    #[arg(env = "DUCKLET_SQL")]
    sql: String,

    /// Database file; in-memory when omitted
    #[arg(long, env = "DUCKLET_DATABASE")]
    database: Option<String>,

    /// Open the database read-only
    #[arg(long, default_value = "false")]
    read_only: bool,

    /// Deliver rows through a push stream
    #[arg(long, default_value = "false")]
    stream: bool,

    /// Buffer the whole result before printing
    #[arg(long, default_value = "false")]
    materialized: bool,

    /// Print rows as objects keyed by column name
    #[arg(long, default_value = "false")]
    objects: bool,

    /// Keep BIGINT values exact instead of widening them to doubles
    #[arg(long, default_value = "false")]
    exact_bigints: bool,

    /// Print the column names and types before the rows
    #[arg(long, default_value = "false")]
    describe: bool,

    /// Rows a stream may buffer ahead of the output
    #[arg(long)]
    high_water_mark: Option<usize>,

    /// Number of threads for DuckDB
    #[arg(long, env = "THREADS")]
    threads: Option<u32>,

    /// DuckDB memory limit, e.g. "4GB"
    #[arg(long, env = "MAX_MEMORY")]
    max_memory: Option<String>,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    let args = Args::parse();
    telemetry::init(&args.log_level)?;

    let (db_config, client_config) = build_config(&args);
    let options = ExecuteOptions {
        streaming: args.stream,
        force_materialized: args.materialized,
        high_water_mark: args.high_water_mark,
        ..ExecuteOptions::default()
    };

    let start = Instant::now();
    match run(&args.sql, &db_config, client_config, options, args.describe).await {
        Ok(rows) => {
            info!(
                rows,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Query completed"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Query failed");
            let code = e
                .downcast_ref::<ducklet_common::DuckletError>()
                .map(|e| e.code())
                .unwrap_or("INTERNAL_ERROR");
            println!(
                "{}",
                serde_json::json!({ "status": "error", "code": code, "message": e.to_string() })
            );
            Err(e)
        }
    }
}

/// Environment settings first, command line flags on top
fn build_config(args: &Args) -> (DatabaseConfig, ClientConfig) {
    let mut db_config: DatabaseConfig = load_from_env("DUCKLET").unwrap_or_else(|e| {
        warn!(error = %e, "Ignoring invalid DUCKLET_* database settings");
        DatabaseConfig::default()
    });
    let mut client_config: ClientConfig = load_from_env("DUCKLET").unwrap_or_else(|e| {
        warn!(error = %e, "Ignoring invalid DUCKLET_* client settings");
        ClientConfig::default()
    });

    if let Some(path) = &args.database {
        db_config.path = Some(path.clone());
    }
    if args.read_only {
        db_config.access_mode = AccessMode::ReadOnly;
    }
    if let Some(threads) = args.threads {
        db_config.threads = threads;
    }
    if let Some(memory) = &args.max_memory {
        db_config.maximum_memory = Some(memory.clone());
    }
    if args.objects {
        client_config.default_row_format = RowFormat::Object;
    }
    if args.exact_bigints {
        client_config.bigint_mode = BigIntMode::Exact;
    }

    (db_config, client_config)
}

/// Execute `sql` and print every row; returns the number of rows printed
async fn run(
    sql: &str,
    db_config: &DatabaseConfig,
    client_config: ClientConfig,
    options: ExecuteOptions,
    describe: bool,
) -> anyhow::Result<usize> {
    let db = Database::open_with_client_config(db_config, client_config)?;
    let session = db.connect()?;

    let mut printed = 0usize;
    match session.execute(sql, options).await? {
        QueryResult::Cursor(cursor) => {
            if describe && !cursor.metadata().is_empty() {
                print_columns(cursor.describe()?)?;
            }
            while let Some(row) = cursor.fetch_row()? {
                print_row(&row)?;
                printed += 1;
            }
            cursor.close();
        }
        QueryResult::Stream(mut stream) => {
            if describe {
                print_columns(stream.describe())?;
            }
            while let Some(row) = stream.next().await {
                print_row(&row?)?;
                printed += 1;
            }
        }
    }

    session.close();
    db.close();
    Ok(printed)
}

fn print_columns(columns: Vec<(String, String)>) -> anyhow::Result<()> {
    let columns: Vec<_> = columns
        .into_iter()
        .map(|(name, type_label)| serde_json::json!({ "name": name, "type": type_label }))
        .collect();
    println!("{}", serde_json::json!({ "columns": columns }));
    Ok(())
}

fn print_row(row: &Row) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(row)?);
    Ok(())
}
