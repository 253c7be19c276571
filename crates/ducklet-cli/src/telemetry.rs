//! Log output for the ducklet binary
//!
//! Human-readable lines by default, JSON lines when `JSON_LOGS=true`. `RUST_LOG` overrides the
//! level passed on the command line. Logs go to stderr so stdout carries only result rows.

use anyhow::Result;
use ducklet_common::config::env_or_default;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber
pub fn init(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let json_logs = env_or_default("JSON_LOGS", "false") == "true";

    let subscriber = tracing_subscriber::registry().with(filter);

    if json_logs {
        subscriber
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()?;
    } else {
        subscriber
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()?;
    }

    Ok(())
}
