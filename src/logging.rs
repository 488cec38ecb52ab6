//! Process-level tracing setup.

use std::fs::OpenOptions;
use std::sync::{Mutex, Once};

use tracing_subscriber::EnvFilter;

use crate::error::{P2pError, P2pResult};

/// Installs the global subscriber once per process.
///
/// `RUST_LOG` takes precedence over `level`. With a `log_file` other than `-`
/// the output is appended to that file as JSON lines.
pub fn init_tracing(level: &str, log_file: &str) -> P2pResult<()> {
    static INIT: Once = Once::new();
    let mut result = Ok(());
    INIT.call_once(|| {
        result = install(level, log_file);
    });
    result
}

fn install(level: &str, log_file: &str) -> P2pResult<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| filter_for(level));

    if log_file.is_empty() || log_file == "-" {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
        return Ok(());
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .map_err(|e| P2pError::Config(format!("invalid log file {log_file}: {e}")))?;
    let _ = tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .try_init();
    Ok(())
}

/// Also accepts the `warning`, `fatal` and `panic` level names.
fn filter_for(level: &str) -> EnvFilter {
    let normalized = match level.to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" | "fatal" | "panic" => "error",
        _ => "info",
    };
    EnvFilter::new(normalized)
}
