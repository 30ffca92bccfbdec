//! Wrapper composition and per-request execution.
//!
//! # Build phase
//!
//! A [`Middleware`] pairs one handler with a table of wrappers keyed by
//! integer priority. At registration the table is folded into a single
//! composed handler:
//!
//! - a lower priority number is an outer layer: the wrapper at priority 1
//!   sees the result of the wrapper at priority 2 and everything inside it;
//! - within one priority, the wrapper inserted first is the outer one.
//!
//! Groups copy their parent's table before adding their own entries, and
//! handler-level entries are appended last, so at equal priority the server's
//! wrappers enclose the group's, which enclose the handler's.
//!
//! # Dispatch phase
//!
//! Per request: read the body when the route declares one, build the
//! context, decode the body into its declared [`BodyShape`] (a failure
//! short-circuits with 400 and the handler never runs), invoke the composed
//! handler, fold aborts and panics into an [`Outcome`], and finalize it
//! unless it is terminated.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use http::{HeaderMap, StatusCode};
use http_body_util::BodyExt;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span};

use crate::codec::{self, Codec, CodecError};
use crate::context::{Context, Injector, RouteEnv};
use crate::handler::{Abort, BoxedHandler, Handler, Wrapper};
use crate::middleware::recover;
use crate::outcome::{Outcome, WireResponse};

pub(crate) type DecodedBody = Arc<dyn Any + Send + Sync>;

type DecodeFn = dyn Fn(&dyn Codec, &[u8]) -> Result<DecodedBody, CodecError> + Send + Sync;

// ── BodyShape ─────────────────────────────────────────────────────────────────

/// How a route's request body is read, chosen at registration.
///
/// | shape | read as | `ctx.body::<T>()` |
/// |---|---|---|
/// | `None` | not read | |
/// | `Raw` | bytes, verbatim | `Bytes` |
/// | `Text` | UTF-8 text, verbatim | `String` |
/// | `json::<T>()` | codec decode | `T` |
#[derive(Clone, Default)]
pub enum BodyShape {
    #[default]
    None,
    Raw,
    Text,
    Json(JsonShape),
}

/// A typed decoder registered through [`BodyShape::json`].
#[derive(Clone)]
pub struct JsonShape {
    type_name: &'static str,
    decode: Arc<DecodeFn>,
}

impl fmt::Debug for BodyShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Raw => f.write_str("Raw"),
            Self::Text => f.write_str("Text"),
            Self::Json(shape) => write!(f, "Json<{}>", shape.type_name),
        }
    }
}

impl BodyShape {
    /// Decode the body as JSON into `T`.
    pub fn json<T: DeserializeOwned + Send + Sync + 'static>() -> Self {
        let decode = |codec: &dyn Codec, raw: &[u8]| -> Result<DecodedBody, CodecError> {
            let value: T = codec::decode_as(codec, raw)?;
            Ok(Arc::new(value))
        };
        Self::Json(JsonShape { type_name: std::any::type_name::<T>(), decode: Arc::new(decode) })
    }

    pub fn reads_body(&self) -> bool {
        !matches!(self, Self::None)
    }

    pub(crate) fn decode(&self, codec: &dyn Codec, raw: &[u8]) -> Result<DecodedBody, CodecError> {
        match self {
            Self::None => Ok(Arc::new(())),
            Self::Raw => Ok(Arc::new(Bytes::copy_from_slice(raw))),
            Self::Text => match std::str::from_utf8(raw) {
                Ok(text) => Ok(Arc::new(text.to_owned())),
                Err(e) => Err(CodecError::Message(format!("body is not valid utf-8: {e}"))),
            },
            Self::Json(shape) => (shape.decode)(codec, raw),
        }
    }
}

// ── Middleware ────────────────────────────────────────────────────────────────

/// A handler plus its priority-ordered wrapper table.
///
/// ```rust
/// use weft::{middleware, Context, Middleware, Outcome};
///
/// async fn export(ctx: Context) -> Outcome { ctx.wrap_ok("csv…") }
///
/// let mw = Middleware::new(export)
///     .wrap_handler(0, middleware::recover())
///     .wrap_handler(10, middleware::cors());
/// # let _ = mw;
/// ```
///
/// Cloning copies the table by value: entries added to the clone are not
/// seen by the original.
pub struct Middleware<C> {
    handler: Option<BoxedHandler<C>>,
    wrappers: BTreeMap<i32, Vec<Wrapper<C>>>,
}

impl<C> Clone for Middleware<C> {
    fn clone(&self) -> Self {
        Self { handler: self.handler.clone(), wrappers: self.wrappers.clone() }
    }
}

impl<C> Default for Middleware<C> {
    fn default() -> Self {
        Self { handler: None, wrappers: BTreeMap::new() }
    }
}

impl<C: 'static> Middleware<C> {
    pub fn new(handler: impl Handler<C>) -> Self {
        Self { handler: Some(handler.into_boxed_handler()), wrappers: BTreeMap::new() }
    }

    /// Adds a wrapper at `priority`. Returns `self` for chaining.
    pub fn wrap_handler(mut self, priority: i32, wrapper: Wrapper<C>) -> Self {
        self.push(priority, wrapper);
        self
    }

    pub(crate) fn push(&mut self, priority: i32, wrapper: Wrapper<C>) {
        self.wrappers.entry(priority).or_default().push(wrapper);
    }

    #[cfg(test)]
    pub(crate) fn set_handler(&mut self, handler: BoxedHandler<C>) {
        self.handler = Some(handler);
    }

    /// Unions `other` into `self`: its wrappers go after the existing ones at
    /// each priority, and its handler, if any, replaces the current one.
    pub fn merge(&mut self, other: Middleware<C>) {
        for (priority, wrappers) in other.wrappers {
            self.wrappers.entry(priority).or_default().extend(wrappers);
        }
        if other.handler.is_some() {
            self.handler = other.handler;
        }
    }

    /// Number of wrappers across all priorities.
    pub fn wrapper_count(&self) -> usize {
        self.wrappers.values().map(Vec::len).sum()
    }

    /// Folds the wrapper table around the handler. `None` without a handler.
    pub fn compose(&self) -> Option<BoxedHandler<C>> {
        let mut handler = self.handler.clone()?;
        for wrappers in self.wrappers.values().rev() {
            for wrapper in wrappers.iter().rev() {
                handler = wrapper(handler);
            }
        }
        Some(handler)
    }
}

// ── Dispatch ──────────────────────────────────────────────────────────────────

/// Builds the server's context type from the base context.
pub(crate) type Factory<C> = Arc<dyn Fn(Context) -> C + Send + Sync>;

/// Everything stored in the router for one registered route.
pub(crate) struct Route<C> {
    pub(crate) handler: BoxedHandler<C>,
    pub(crate) env: RouteEnv,
    pub(crate) factory: Factory<C>,
}

impl<C> Clone for Route<C> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
            env: self.env.clone(),
            factory: Arc::clone(&self.factory),
        }
    }
}

/// Runs one request through `route` and produces the wire response.
pub(crate) async fn dispatch<C, B>(
    route: Route<C>,
    req: http::Request<B>,
    params: HashMap<String, String>,
    remote_addr: SocketAddr,
    cancel: CancellationToken,
) -> WireResponse
where
    C: Injector,
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: fmt::Display,
{
    let span = debug_span!("request", method = %req.method(), route = %route.env.route);
    run(route, req, params, remote_addr, cancel).instrument(span).await
}

async fn run<C, B>(
    route: Route<C>,
    req: http::Request<B>,
    params: HashMap<String, String>,
    remote_addr: SocketAddr,
    cancel: CancellationToken,
) -> WireResponse
where
    C: Injector,
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: fmt::Display,
{
    let Route { handler, env, factory } = route;
    let (parts, body) = req.into_parts();

    let raw = if env.shape.reads_body() {
        match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                debug!("could not read body: {e}");
                let outcome = Outcome::error(
                    format!("could not read body, err={e}"),
                    env.codes.bad_request.clone(),
                    StatusCode::BAD_REQUEST,
                );
                return outcome.finalize(HeaderMap::new(), env.codec.as_ref(), &env.codes);
            }
        }
    } else {
        Bytes::new()
    };

    let ctx = Context::new(parts, raw, params, remote_addr, env.clone(), cancel);

    let rejected = if env.shape.reads_body() { ctx.materialize_body().err() } else { None };
    let outcome = match rejected {
        Some(Abort(outcome)) => outcome,
        None => {
            let injected = factory(ctx.clone());
            let result = AssertUnwindSafe(async move { handler.call(injected).await })
                .catch_unwind()
                .await;
            match result {
                Ok(Ok(outcome)) | Ok(Err(Abort(outcome))) => outcome,
                Err(payload) => recover::payload_to_outcome(&ctx, payload),
            }
        }
    };

    debug!(status = outcome.status().as_u16(), terminated = outcome.is_terminated(), "handled");
    outcome.finalize(ctx.take_response_headers(), env.codec.as_ref(), &env.codes)
}
