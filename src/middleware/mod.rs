//! Built-in wrappers.
//!
//! Wrappers intercept a request before and after the handler they enclose and
//! are the right place for cross-cutting concerns. Register them with a
//! priority; lower numbers run further out:
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use weft::{middleware, Server, ServerConfig};
//!
//! let mut server = Server::new(ServerConfig::default()).unwrap();
//! server
//!     .wrap_handler(-100, middleware::recover())
//!     .wrap_handler(-50, middleware::monitor())
//!     .wrap_handler(0, middleware::dos_limiter(100, Duration::from_secs(1)));
//! ```
//!
//! - [`recover`] / [`panic_handler`]: turn panics and aborts into outcomes
//! - [`rate_limiter`] / [`dos_limiter`]: sliding-window admission control
//! - [`cors`]: permissive CORS headers, `OPTIONS` answered with 204
//! - [`monitor`]: one access-log event per request

mod cors;
mod limiter;
mod monitor;
pub(crate) mod recover;

pub use cors::cors;
pub use limiter::{SlidingWindow, dos_limiter, rate_limiter, rate_limiter_with, window_limiter};
pub use monitor::monitor;
pub use recover::{panic_handler, panic_message, recover};
