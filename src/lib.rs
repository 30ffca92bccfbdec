//! # weft
//!
//! An HTTP dispatch pipeline for services that want their cross-cutting
//! behavior in one place.
//!
//! ## The model
//!
//! Every route is one handler wrapped in layers. Layers come from the server,
//! from each group the route sits in, and from the route itself; each one is
//! registered with an integer priority and the lower number is the outer
//! layer. All of it is folded once at registration, so serving a request is a
//! router lookup and a chain of calls.
//!
//! A handler answers with an [`Outcome`]: a body, a status, and optionally a
//! fully written response. It can also bail out from deep inside helper code
//! with an [`Abort`], either returned through `?` or raised with [`abort`]
//! (a real unwind, so the panic hook still reports it).
//! Both land in the same finalization step, and so does a panic.
//!
//! What weft handles:
//!
//! - Radix-tree routing via [`matchit`], plus an exact-match override table
//! - Priority-ordered wrappers, inherited by groups by copy
//! - Declared body shapes, decoded before the handler runs
//! - Pluggable per-request context types via [`Injector`]
//! - Sliding-window rate limiting, panic recovery, CORS, access logs
//! - Multipart form parsing and static files served from a root directory
//! - Graceful shutdown: SIGTERM / Ctrl-C, drains in-flight requests
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use serde::Deserialize;
//! use weft::{middleware, BodyShape, Context, HandlerResult, Json, Server, ServerConfig};
//!
//! #[derive(Deserialize)]
//! struct NewUser {
//!     name: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), weft::Error> {
//!     let mut server = Server::new(ServerConfig::default())?;
//!     server.wrap_handler(-100, middleware::recover());
//!
//!     let users = server.group("/users");
//!     users.get("/:id", get_user, BodyShape::None);
//!     users.post("/", create_user, BodyShape::json::<NewUser>());
//!
//!     server.run(Some(":3000")).await
//! }
//!
//! async fn get_user(ctx: Context) -> HandlerResult {
//!     let id = ctx.path_param("id").unwrap_or_default().to_owned();
//!     if id == "0" {
//!         return Err(ctx.wrap_not_found("no such user").into());
//!     }
//!     Ok(ctx.wrap_ok(serde_json::json!({ "id": id })))
//! }
//!
//! async fn create_user(ctx: Context) -> HandlerResult {
//!     let input = ctx.body::<NewUser>()?;
//!     Ok(ctx.wrap(Json(serde_json::json!({ "name": input.name })), http::StatusCode::CREATED))
//! }
//! ```

mod codec;
mod config;
mod context;
mod error;
mod files;
mod form;
mod handler;
mod outcome;
mod pipeline;
mod router;
mod server;

pub mod logging;
pub mod middleware;

pub use codec::{Codec, CodecError, JsonCodec, decode_as};
pub use config::{DEFAULT_PORT, ServerConfig};
pub use context::{Context, Cookie, Injector};
pub use error::Error;
pub use form::{FormFile, MultipartForm};
pub use handler::{
    Abort, BoxFuture, BoxedHandler, ErasedHandler, Handler, HandlerResult, IntoHandlerResult, Wrapper, abort,
    from_fn, handler_fn,
};
pub use outcome::{Body, ContentType, ErrorBody, ErrorCodes, IntoBody, Json, Outcome, WireResponse};
pub use pipeline::{BodyShape, Middleware};
pub use server::{App, Server};
