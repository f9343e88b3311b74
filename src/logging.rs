use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_DIRECTIVES: &str = "sheet_engine=info,warn";

/// Installs the global subscriber. `RUST_LOG` overrides the default filter.
/// Returns `Ok(false)` when a subscriber was already installed.
pub fn init_logging() -> Result<bool> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(DEFAULT_DIRECTIVES))?;
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .is_ok();

    Ok(installed)
}
