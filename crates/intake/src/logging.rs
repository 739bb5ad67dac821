//! Process-wide tracing setup.

use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};

/// Installs the global subscriber and bridges `log` records into it.
///
/// `RUST_LOG` takes precedence over `config.level`. Returns false when a
/// subscriber was already installed, so calling it twice is harmless.
pub fn init_tracing(config: &LoggingConfig) -> bool {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true);

    let installed = match config.format {
        LogFormat::Text => tracing::subscriber::set_global_default(builder.finish()).is_ok(),
        LogFormat::Json => {
            tracing::subscriber::set_global_default(builder.json().flatten_event(true).finish())
                .is_ok()
        }
    };

    if installed {
        // The persistence layer logs through the `log` facade.
        let _ = tracing_log::LogTracer::init();
    }
    installed
}
