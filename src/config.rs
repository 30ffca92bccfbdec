//! Server construction options.
//!
//! A [`ServerConfig`] is built once, handed to [`Server::new`](crate::Server::new)
//! and never mutated afterwards. Groups receive copies of the parts they need
//! (the error-code table); the listener and log destination are consumed by
//! the root server only.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::error::Error;
use crate::outcome::ErrorCodes;

/// Port used when neither an address, a listener nor `PORT` is supplied.
pub const DEFAULT_PORT: u16 = 8091;

const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Options consulted when a [`Server`](crate::Server) is constructed.
#[derive(Debug)]
pub struct ServerConfig {
    /// Listen address: `"8080"`, `":8080"` or `"127.0.0.1:8080"`.
    pub addr: Option<String>,
    /// File that log output is appended to. `None` keeps stderr.
    pub log_output: Option<PathBuf>,
    /// How long in-flight connections may run after shutdown is requested.
    pub shutdown_grace: Duration,
    /// An already-bound listener. Takes precedence over every address source.
    pub listener: Option<std::net::TcpListener>,
    /// Machine-readable codes used by the `wrap_*` error helpers.
    pub error_codes: ErrorCodes,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: None,
            log_output: None,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            listener: None,
            error_codes: ErrorCodes::default(),
        }
    }
}

impl ServerConfig {
    /// Reads options from a string-keyed map.
    ///
    /// Recognized keys: `addr`, `log_output`, `shutdown_grace_secs`.
    /// Anything else is ignored.
    pub fn from_map(map: &HashMap<String, String>) -> Self {
        let mut config = Self::default();
        for (key, value) in map {
            match key.as_str() {
                "addr" => config.addr = Some(value.clone()),
                "log_output" => config.log_output = Some(PathBuf::from(value)),
                "shutdown_grace_secs" => match value.parse::<u64>() {
                    Ok(secs) => config.shutdown_grace = Duration::from_secs(secs),
                    Err(e) => warn!(key = %key, value = %value, "ignoring config value: {e}"),
                },
                _ => {}
            }
        }
        config
    }

    pub fn addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = Some(addr.into());
        self
    }

    pub fn log_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_output = Some(path.into());
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn listener(mut self, listener: std::net::TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn error_codes(mut self, codes: ErrorCodes) -> Self {
        self.error_codes = codes;
        self
    }
}

/// Picks the address to bind: `explicit`, then `configured`, then the `PORT`
/// environment variable, then [`DEFAULT_PORT`].
pub(crate) fn resolve_addr(
    explicit: Option<&str>,
    configured: Option<&str>,
) -> Result<SocketAddr, Error> {
    let raw = match explicit.or(configured) {
        Some(addr) => addr.to_owned(),
        None => std::env::var("PORT").unwrap_or_else(|_| DEFAULT_PORT.to_string()),
    };
    parse_addr(&raw)
}

fn parse_addr(raw: &str) -> Result<SocketAddr, Error> {
    let raw = raw.trim();
    let full = if let Some(port) = raw.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else if !raw.contains(':') {
        format!("0.0.0.0:{raw}")
    } else {
        raw.to_owned()
    };
    full.parse().map_err(|_| Error::InvalidAddr { addr: raw.to_owned() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_port_and_colon_port_bind_all_interfaces() {
        assert_eq!(parse_addr("8080").unwrap(), "0.0.0.0:8080".parse().unwrap());
        assert_eq!(parse_addr(":9000").unwrap(), "0.0.0.0:9000".parse().unwrap());
        assert_eq!(parse_addr("127.0.0.1:1").unwrap(), "127.0.0.1:1".parse().unwrap());
    }

    #[test]
    fn garbage_address_is_rejected() {
        assert!(matches!(parse_addr("not-a-port"), Err(Error::InvalidAddr { .. })));
    }

    #[test]
    fn explicit_address_wins_over_configured() {
        let addr = resolve_addr(Some("1234"), Some("5678")).unwrap();
        assert_eq!(addr.port(), 1234);
        let addr = resolve_addr(None, Some("5678")).unwrap();
        assert_eq!(addr.port(), 5678);
    }

    #[test]
    fn from_map_ignores_unknown_keys() {
        let map = HashMap::from([
            ("addr".to_owned(), ":7000".to_owned()),
            ("shutdown_grace_secs".to_owned(), "5".to_owned()),
            ("mongo_url".to_owned(), "mongodb://x".to_owned()),
        ]);
        let config = ServerConfig::from_map(&map);
        assert_eq!(config.addr.as_deref(), Some(":7000"));
        assert_eq!(config.shutdown_grace, Duration::from_secs(5));
        assert!(config.log_output.is_none());
    }

    #[test]
    fn from_map_keeps_default_on_bad_value() {
        let map = HashMap::from([("shutdown_grace_secs".to_owned(), "soon".to_owned())]);
        assert_eq!(ServerConfig::from_map(&map).shutdown_grace, DEFAULT_SHUTDOWN_GRACE);
    }
}
