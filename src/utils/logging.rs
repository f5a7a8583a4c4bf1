//! Console logging setup.

use std::io::{self, IsTerminal};

use tracing::debug;
use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};

/// Install the global `tracing` subscriber.
///
/// The level comes from `config`, unless `RUST_LOG` is set. Returns `Ok(false)` when a
/// subscriber was already installed (e.g. by a test harness), which is not an error.
pub fn init_logging(config: &LoggingConfig) -> Result<bool> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(config.log_level.as_str().to_lowercase())
            .map_err(|e| ProtocolError::ConfigError(format!("invalid log filter: {e}")))?,
    };

    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal());

    let installed = if config.json_format {
        builder.json().flatten_event(true).try_init().is_ok()
    } else {
        builder.compact().try_init().is_ok()
    };

    if installed {
        debug!(app = %config.app_name, level = %config.log_level, "Logging initialised");
    }
    Ok(installed)
}
