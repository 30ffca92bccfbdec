//! The per-request context.
//!
//! One [`Context`] is built for every routed request and handed, by value, to
//! the composed handler. Cloning is cheap (one `Arc`), which is what lets a
//! wrapper pass the context inward and still inspect or decorate it after
//! the inner handler returns. A context serves exactly one request on one
//! task; the locks inside only exist so the handle can be `Send + Sync`.
//!
//! Servers may run with their own context type. Anything implementing
//! [`Injector`] works: typically a struct holding a `Context` next to shared
//! application state, built by the factory given to
//! [`Server::with_injector`](crate::Server::with_injector).

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{self, AsHeaderName, IntoHeaderName};
use http::request::Parts;
use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::codec::{self, Codec};
use crate::files;
use crate::form::{self, FormFile, MultipartForm};
use crate::handler::Abort;
use crate::outcome::{ContentType, ErrorCodes, IntoBody, Outcome};
use crate::pipeline::BodyShape;

/// Capability every per-request context type provides: access to the base
/// [`Context`] carrying request data, scratch space and the `wrap_*` builders.
///
/// ```rust
/// use std::sync::Arc;
/// use weft::{Context, Injector};
///
/// #[derive(Clone)]
/// struct AppCtx {
///     base: Context,
///     greeting: Arc<String>,
/// }
///
/// impl Injector for AppCtx {
///     fn context(&self) -> &Context { &self.base }
/// }
/// ```
pub trait Injector: Clone + Send + Sync + 'static {
    fn context(&self) -> &Context;
}

impl Injector for Context {
    fn context(&self) -> &Context {
        self
    }
}

/// Collaborators a context borrows from the route it was dispatched on.
#[derive(Clone)]
pub(crate) struct RouteEnv {
    pub(crate) codec: Arc<dyn Codec>,
    pub(crate) codes: Arc<ErrorCodes>,
    pub(crate) shape: BodyShape,
    pub(crate) route: Arc<str>,
}

type ScratchValue = Arc<dyn Any + Send + Sync>;

#[derive(Default)]
struct BodyState {
    raw: Bytes,
    decoded: Option<ScratchValue>,
    multipart: Option<Arc<MultipartForm>>,
}

struct Inner {
    parts: Parts,
    params: HashMap<String, String>,
    remote_addr: SocketAddr,
    env: RouteEnv,
    cancel: CancellationToken,
    body: Mutex<BodyState>,
    scratch: Mutex<HashMap<String, ScratchValue>>,
    response_headers: Mutex<HeaderMap>,
}

/// Request data, decoded body, scratch space and response builders for one
/// in-flight request.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("method", self.method())
            .field("uri", self.uri())
            .field("route", &self.raw_path())
            .field("remote_addr", &self.remote_addr())
            .finish_non_exhaustive()
    }
}

impl Context {
    pub(crate) fn new(
        parts: Parts,
        raw_body: Bytes,
        params: HashMap<String, String>,
        remote_addr: SocketAddr,
        env: RouteEnv,
        cancel: CancellationToken,
    ) -> Self {
        let inner = Inner {
            parts,
            params,
            remote_addr,
            env,
            cancel,
            body: Mutex::new(BodyState { raw: raw_body, ..BodyState::default() }),
            scratch: Mutex::new(HashMap::new()),
            response_headers: Mutex::new(HeaderMap::new()),
        };
        Self { inner: Arc::new(inner) }
    }

    // ── Request metadata ──────────────────────────────────────────────────────

    pub fn method(&self) -> &Method {
        &self.inner.parts.method
    }

    pub fn uri(&self) -> &Uri {
        &self.inner.parts.uri
    }

    /// The `Host` header, falling back to the URI authority.
    pub fn host(&self) -> Option<&str> {
        self.header(header::HOST)
            .or_else(|| self.uri().authority().map(|a| a.as_str()))
    }

    /// Request path without a trailing `/` (the root stays `/`).
    pub fn path(&self) -> &str {
        let path = self.uri().path();
        match path.strip_suffix('/') {
            Some(trimmed) if !trimmed.is_empty() => trimmed,
            _ => path,
        }
    }

    /// The route pattern this request matched, group prefix included.
    pub fn raw_path(&self) -> &str {
        &self.inner.env.route
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.inner.parts.headers
    }

    /// Header value as text. Values that are not visible ASCII read as absent.
    pub fn header<K: AsHeaderName>(&self, name: K) -> Option<&str> {
        self.headers().get(name).and_then(|v| v.to_str().ok())
    }

    pub fn has_header<K: AsHeaderName>(&self, name: K) -> bool {
        self.headers().contains_key(name)
    }

    /// `true` when the header is absent or equals `expected`.
    pub fn header_equals_if_present<K: AsHeaderName + Copy>(&self, name: K, expected: &str) -> bool {
        !self.has_header(name) || self.header(name) == Some(expected)
    }

    /// `true` when the header is absent or contains `needle`.
    pub fn header_contains_if_present<K: AsHeaderName + Copy>(&self, name: K, needle: &str) -> bool {
        !self.has_header(name) || self.header(name).is_some_and(|v| v.contains(needle))
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header(header::CONTENT_LENGTH)?.parse().ok()
    }

    /// The peer address of the connection.
    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    /// The client address as reported by a fronting proxy.
    ///
    /// Prefers the first `X-Forwarded-For` entry, then `X-Real-Ip`, then the
    /// connection peer. Brackets and surrounding whitespace are stripped.
    pub fn real_ip(&self) -> String {
        if let Some(forwarded) = self.header("x-forwarded-for").filter(|v| !v.is_empty()) {
            let first = forwarded.split(',').next().unwrap_or(forwarded);
            return strip_ip(first).to_owned();
        }
        if let Some(real) = self.header("x-real-ip").filter(|v| !v.is_empty()) {
            return strip_ip(real).to_owned();
        }
        self.remote_addr().ip().to_string()
    }

    /// A named path parameter: `/users/:id` on `/users/42` gives `"42"` for `"id"`.
    pub fn path_param(&self, key: &str) -> Option<&str> {
        self.inner.params.get(key).map(String::as_str)
    }

    pub fn path_params(&self) -> &HashMap<String, String> {
        &self.inner.params
    }

    /// First value of a query-string parameter, percent-decoded.
    pub fn query(&self, key: &str) -> Option<String> {
        let query = self.uri().query()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    pub fn default_query(&self, key: &str, default: &str) -> String {
        self.query(key).unwrap_or_else(|| default.to_owned())
    }

    pub fn has_query(&self, key: &str) -> bool {
        self.query(key).is_some_and(|v| !v.is_empty())
    }

    /// Token cancelled when the server begins shutting down.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    // ── Body ──────────────────────────────────────────────────────────────────

    /// The request body bytes as read off the wire.
    ///
    /// Empty for routes registered with [`BodyShape::None`], whose bodies are
    /// never read.
    pub fn raw_body(&self) -> Bytes {
        self.inner.body.lock().raw.clone()
    }

    /// The body decoded into the route's declared shape.
    ///
    /// Decoding happens on first access and the value is cached. `T` is
    /// `Bytes` for [`BodyShape::Raw`], `String` for [`BodyShape::Text`] and the
    /// declared type for [`BodyShape::json`]. A body that cannot be decoded
    /// aborts with a bad-request outcome.
    pub fn body<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, Abort> {
        let decoded = self.materialize_body()?;
        decoded.downcast::<T>().map_err(|_| {
            Abort(self.wrap_internal(format_args!(
                "route `{}` does not declare a `{}` body",
                self.raw_path(),
                std::any::type_name::<T>()
            )))
        })
    }

    /// Decodes a JSON body into any `T`, regardless of the declared shape.
    /// Not cached.
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T, Abort> {
        let raw = self.raw_body();
        codec::decode_as(self.inner.env.codec.as_ref(), &raw).map_err(|e| {
            Abort(self.wrap_bad_request(format_args!("could not read body as a valid json, err={e}")))
        })
    }

    pub(crate) fn materialize_body(&self) -> Result<ScratchValue, Abort> {
        let mut state = self.inner.body.lock();
        if let Some(decoded) = &state.decoded {
            return Ok(Arc::clone(decoded));
        }
        let decoded = self
            .inner
            .env
            .shape
            .decode(self.inner.env.codec.as_ref(), &state.raw)
            .map_err(|e| Abort(self.wrap_bad_request(format_args!("could not read body as desired schema, err={e}"))))?;
        state.decoded = Some(Arc::clone(&decoded));
        Ok(decoded)
    }

    // ── Scratch space ─────────────────────────────────────────────────────────

    /// Stores a value for later wrappers or the handler to pick up.
    pub fn set_value<T: Send + Sync + 'static>(&self, key: impl Into<String>, value: T) {
        self.inner.scratch.lock().insert(key.into(), Arc::new(value));
    }

    /// The value stored under `key`, if present and of type `T`.
    pub fn value<T: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.inner.scratch.lock().get(key).cloned()?;
        value.downcast::<T>().ok()
    }

    /// Whether anything is stored under `key`, whatever its type.
    pub fn contains_value(&self, key: &str) -> bool {
        self.inner.scratch.lock().contains_key(key)
    }

    pub fn remove_value(&self, key: &str) -> bool {
        self.inner.scratch.lock().remove(key).is_some()
    }

    // ── Response headers ──────────────────────────────────────────────────────

    pub fn set_response_header<K: IntoHeaderName>(&self, name: K, value: HeaderValue) {
        self.inner.response_headers.lock().insert(name, value);
    }

    pub fn add_response_header<K: IntoHeaderName>(&self, name: K, value: HeaderValue) {
        self.inner.response_headers.lock().append(name, value);
    }

    pub fn set_content_type(&self, content_type: ContentType) {
        self.set_response_header(header::CONTENT_TYPE, content_type.header_value());
    }

    /// A snapshot of the response headers set so far.
    pub fn response_headers(&self) -> HeaderMap {
        self.inner.response_headers.lock().clone()
    }

    pub(crate) fn take_response_headers(&self) -> HeaderMap {
        std::mem::take(&mut *self.inner.response_headers.lock())
    }

    // ── Cookies ───────────────────────────────────────────────────────────────

    /// All `name=value` pairs from the request's `Cookie` headers.
    pub fn cookies(&self) -> Vec<(String, String)> {
        self.headers()
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| {
                let (name, value) = pair.split_once('=')?;
                let name = name.trim();
                (!name.is_empty()).then(|| (name.to_owned(), value.trim().trim_matches('"').to_owned()))
            })
            .collect()
    }

    pub fn cookie(&self, name: &str) -> Option<String> {
        self.cookies().into_iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Appends a `Set-Cookie` response header.
    pub fn set_cookie(&self, cookie: &Cookie) {
        match HeaderValue::try_from(cookie.to_string()) {
            Ok(value) => self.add_response_header(header::SET_COOKIE, value),
            Err(e) => warn!(cookie = %cookie.name, "dropping unencodable cookie: {e}"),
        }
    }

    // ── Forms ─────────────────────────────────────────────────────────────────

    /// Query-string pairs followed by the body's form fields.
    ///
    /// The body is only consulted on routes that read it, and only for
    /// `application/x-www-form-urlencoded` or `multipart/form-data` requests.
    /// Multipart file parts are left out; see [`form_file`](Self::form_file).
    pub async fn form_params(&self) -> Result<Vec<(String, String)>, Abort> {
        let mut params: Vec<(String, String)> = self
            .uri()
            .query()
            .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default();

        let content_type = self.header(header::CONTENT_TYPE).unwrap_or_default();
        if form::is_multipart(content_type) {
            params.extend(self.multipart_form().await?.fields.iter().cloned());
        } else if content_type.starts_with(ContentType::FormData.as_str()) {
            let raw = self.raw_body();
            params.extend(url::form_urlencoded::parse(&raw).into_owned());
        }
        Ok(params)
    }

    pub async fn form_value(&self, key: &str) -> Option<String> {
        self.form_params().await.ok()?.into_iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// The body parsed as `multipart/form-data`, cached after the first call.
    ///
    /// Aborts with a bad-request outcome when the request is not multipart or
    /// the body is malformed.
    pub async fn multipart_form(&self) -> Result<Arc<MultipartForm>, Abort> {
        let cached = self.inner.body.lock().multipart.clone();
        if let Some(form) = cached {
            return Ok(form);
        }

        let content_type = self.header(header::CONTENT_TYPE).unwrap_or_default();
        if !form::is_multipart(content_type) {
            return Err(Abort(self.wrap_bad_request("request is not multipart/form-data")));
        }
        let parsed = form::parse_multipart(content_type, self.raw_body())
            .await
            .map_err(|e| Abort(self.wrap_bad_request(format_args!("could not read multipart body, err={e}"))))?;

        let parsed = Arc::new(parsed);
        self.inner.body.lock().multipart = Some(Arc::clone(&parsed));
        Ok(parsed)
    }

    /// The first file uploaded under `name`. A missing file is a bad request.
    pub async fn form_file(&self, name: &str) -> Result<FormFile, Abort> {
        let form = self.multipart_form().await?;
        form.file(name)
            .cloned()
            .ok_or_else(|| Abort(self.wrap_bad_request(format_args!("missing form file `{name}`"))))
    }

    // ── Files ─────────────────────────────────────────────────────────────────

    /// Responds with the file at `path` and `status`, typed by its extension.
    ///
    /// The response carries the headers set on the context so far and is sent
    /// as built. A missing file gives a 404 outcome, any other read failure a
    /// 500.
    pub async fn serve_file(&self, path: impl AsRef<Path>, status: StatusCode) -> Outcome {
        let path = path.as_ref();
        match files::file_response(path, status, self.response_headers()).await {
            Ok(response) => Outcome::written(response),
            Err(e) => files::failure(self, &path.display().to_string(), &e),
        }
    }

    // ── Outcome builders ──────────────────────────────────────────────────────

    pub fn error_codes(&self) -> &ErrorCodes {
        &self.inner.env.codes
    }

    pub fn wrap(&self, body: impl IntoBody, status: StatusCode) -> Outcome {
        Outcome::new(body, status)
    }

    pub fn wrap_ok(&self, body: impl IntoBody) -> Outcome {
        Outcome::ok(body)
    }

    pub fn wrap_no_content(&self) -> Outcome {
        Outcome::no_content()
    }

    /// Sets the response content type now and wraps `body` with `status`.
    pub fn wrap_with_content_type(&self, body: impl IntoBody, status: StatusCode, content_type: ContentType) -> Outcome {
        self.set_content_type(content_type);
        Outcome::new(body, status)
    }

    pub fn wrap_text(&self, body: impl fmt::Display, status: StatusCode) -> Outcome {
        self.wrap_with_content_type(body.to_string(), status, ContentType::Text)
    }

    /// `{"error": message, "code": code}` with `status`.
    pub fn wrap_error(&self, message: impl fmt::Display, code: impl Into<String>, status: StatusCode) -> Outcome {
        Outcome::error(message.to_string(), code, status)
    }

    fn wrap_default_error(&self, message: impl fmt::Display, status: StatusCode) -> Outcome {
        let code = self.error_codes().for_status(status).unwrap_or_default().to_owned();
        self.wrap_error(message, code, status)
    }

    pub fn wrap_bad_request(&self, message: impl fmt::Display) -> Outcome {
        self.wrap_default_error(message, StatusCode::BAD_REQUEST)
    }

    pub fn wrap_not_found(&self, message: impl fmt::Display) -> Outcome {
        self.wrap_default_error(message, StatusCode::NOT_FOUND)
    }

    pub fn wrap_forbidden(&self, message: impl fmt::Display) -> Outcome {
        self.wrap_default_error(message, StatusCode::FORBIDDEN)
    }

    pub fn wrap_conflict(&self, message: impl fmt::Display) -> Outcome {
        self.wrap_default_error(message, StatusCode::CONFLICT)
    }

    pub fn wrap_internal(&self, message: impl fmt::Display) -> Outcome {
        self.wrap_default_error(message, StatusCode::INTERNAL_SERVER_ERROR)
    }

    pub fn wrap_too_many_requests(&self, message: impl fmt::Display) -> Outcome {
        self.wrap_default_error(message, StatusCode::TOO_MANY_REQUESTS)
    }

    pub fn wrap_not_acceptable(&self, message: impl fmt::Display) -> Outcome {
        self.wrap_default_error(message, StatusCode::NOT_ACCEPTABLE)
    }

    pub fn wrap_not_implemented(&self, message: impl fmt::Display) -> Outcome {
        self.wrap_default_error(message, StatusCode::NOT_IMPLEMENTED)
    }
}

fn strip_ip(raw: &str) -> &str {
    let raw = raw.trim();
    let raw = raw.strip_prefix('[').unwrap_or(raw);
    raw.strip_suffix(']').unwrap_or(raw)
}

// ── Cookie ────────────────────────────────────────────────────────────────────

/// A `Set-Cookie` value.
#[derive(Clone, Debug, Default)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub path: Option<String>,
    pub domain: Option<String>,
    pub max_age: Option<Duration>,
    pub http_only: bool,
    pub secure: bool,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), value: value.into(), ..Self::default() }
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn http_only(mut self) -> Self {
        self.http_only = true;
        self
    }

    pub fn secure(mut self) -> Self {
        self.secure = true;
        self
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)?;
        if let Some(path) = &self.path {
            write!(f, "; Path={path}")?;
        }
        if let Some(domain) = &self.domain {
            write!(f, "; Domain={domain}")?;
        }
        if let Some(max_age) = self.max_age {
            write!(f, "; Max-Age={}", max_age.as_secs())?;
        }
        if self.http_only {
            f.write_str("; HttpOnly")?;
        }
        if self.secure {
            f.write_str("; Secure")?;
        }
        Ok(())
    }
}
