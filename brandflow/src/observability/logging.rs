//! Process-wide `tracing` subscriber.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};
use crate::errors::BrandflowError;

/// Installs the global subscriber.
///
/// `RUST_LOG` wins over `config.filter`. Output goes to stderr. Returns a
/// config error if a subscriber is already installed or the filter does
/// not parse.
pub fn init_logging(config: &LoggingConfig) -> Result<(), BrandflowError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.filter)
            .map_err(|e| BrandflowError::Config(format!("invalid log filter: {e}")))?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match config.format {
        LogFormat::Compact => registry
            .with(fmt::layer().with_writer(std::io::stderr).compact())
            .try_init(),
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .json()
                    .with_current_span(true),
            )
            .try_init(),
    };
    installed.map_err(|e| BrandflowError::Config(format!("logging already initialised: {e}")))
}
