//! Log subscriber installation.
//!
//! weft logs through `tracing`. Applications that already install their own
//! subscriber can ignore this module entirely; [`init`] is a convenience for
//! the common case and is also what [`Server::new`](crate::Server::new) calls
//! when a `log_output` file is configured.

use std::fs::OpenOptions;
use std::sync::Arc;

use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::config::ServerConfig;
use crate::error::Error;

/// Installs a global `fmt` subscriber.
///
/// Output goes to stderr, or is appended to `config.log_output` when set.
/// The filter comes from `RUST_LOG` and defaults to `info`. If a global
/// subscriber is already installed it is left in place.
pub fn init(config: &ServerConfig) -> Result<(), Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let installed = match &config.log_output {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| Error::LogOutput { path: path.clone(), source })?;
            builder.with_ansi(false).with_writer(Arc::new(file)).try_init()
        }
        None => builder.try_init(),
    };

    if let Err(e) = installed {
        debug!("keeping existing subscriber: {e}");
    }
    Ok(())
}
