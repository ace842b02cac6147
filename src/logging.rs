//! `tracing` subscriber setup for hosts and tests.

use tracing_subscriber::EnvFilter;

use crate::types::{Result, StoreError};

/// Default directives when neither `filter` nor `RUST_LOG` is given.
pub const DEFAULT_FILTER: &str = "relay_store=info";

/// Installs a global `fmt` subscriber writing to stderr.
///
/// `filter` takes `EnvFilter` directives (`"relay_store::gc=debug"`); `None`
/// reads `RUST_LOG` and falls back to [`DEFAULT_FILTER`]. Fails when the
/// directives do not parse or a global subscriber is already installed.
pub fn init_logging(filter: Option<&str>) -> Result<()> {
    let filter = match filter {
        Some(directives) => EnvFilter::try_new(directives)
            .map_err(|err| StoreError::InvalidArgument(format!("log filter `{directives}`: {err}")))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_ansi(false)
        .try_init()
        .map_err(|err| StoreError::InvalidArgument(format!("logging already initialized: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_directives() {
        assert!(matches!(
            init_logging(Some("relay_store=notalevel")),
            Err(StoreError::InvalidArgument(_))
        ));
    }
}
