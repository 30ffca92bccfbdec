//! Route registration, the group tree, and the serving loop.
//!
//! # Registration
//!
//! A [`Server`] owns the shared router and a base wrapper table. Each
//! [`group`](Server::group) is a child `Server` with a longer path prefix
//! whose wrapper table starts as a copy of its parent's. Routes registered on
//! any node land in the one shared router with their wrappers already folded
//! in. Wrappers added to a parent after a group was created are not seen by
//! that group.
//!
//! # Serving
//!
//! [`Server::build`] freezes the router into an [`App`]. [`App::run`] accepts
//! connections until SIGTERM, Ctrl-C, or [`App::shutdown_token`] is cancelled,
//! then:
//! 1. stops `listener.accept()`, so no new connections are made;
//! 2. cancels every in-flight request's [`Context::cancellation`] token and
//!    asks each connection to close after its current request;
//! 3. waits up to `shutdown_grace` for connections to finish, then aborts
//!    the rest;
//! 4. runs the [`on_shutdown`](Server::on_shutdown) hooks, exactly once.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::convert::Infallible;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::{Codec, JsonCodec};
use crate::config::{ServerConfig, resolve_addr};
use crate::context::{Context, Injector, RouteEnv};
use crate::error::Error;
use crate::files;
use crate::handler::{Handler, Wrapper};
use crate::logging;
use crate::outcome::{ErrorCodes, Outcome, WireResponse};
use crate::pipeline::{self, BodyShape, Factory, Middleware, Route};
use crate::router::{Router, join_path};

type Hook = Box<dyn FnOnce() + Send>;

/// Cleanup callbacks, drained exactly once.
#[derive(Default)]
struct ShutdownHooks(Mutex<Vec<Hook>>);

impl ShutdownHooks {
    fn push(&self, hook: Hook) {
        self.0.lock().push(hook);
    }

    fn take(&self) -> Vec<Hook> {
        std::mem::take(&mut *self.0.lock())
    }

    fn run(&self) {
        let hooks = self.take();
        if !hooks.is_empty() {
            debug!(count = hooks.len(), "running shutdown hooks");
        }
        for hook in hooks {
            hook();
        }
    }
}

/// State every node of one group tree points at.
struct Shared<C> {
    router: Mutex<Router<Route<C>>>,
    hooks: ShutdownHooks,
    factory: Factory<C>,
}

/// Options only the root server consumes.
struct Listen {
    addr: Option<String>,
    listener: Option<std::net::TcpListener>,
    grace: Duration,
}

/// A node of the group tree: a path prefix plus a wrapper table.
///
/// `C` is the context type handlers receive; [`Context`] unless the server
/// was built with [`with_injector`](Server::with_injector).
///
/// ```rust,no_run
/// use weft::{middleware, BodyShape, Context, Outcome, Server, ServerConfig};
///
/// async fn hello(ctx: Context) -> Outcome {
///     ctx.wrap_ok(format!("hello, {}", ctx.path_param("name").unwrap_or("world")))
/// }
///
/// # async fn run() -> Result<(), weft::Error> {
/// let mut server = Server::new(ServerConfig::default())?;
/// server.wrap_handler(-100, middleware::recover());
/// server.group("/api").get("/hello/:name", hello, BodyShape::None);
/// server.run(None).await
/// # }
/// ```
pub struct Server<C = Context> {
    shared: Arc<Shared<C>>,
    root_path: String,
    middleware: Middleware<C>,
    groups: HashMap<String, Server<C>>,
    codes: Arc<ErrorCodes>,
    codec: Arc<dyn Codec>,
    listen: Option<Listen>,
}

impl Server<Context> {
    /// Creates a root server whose handlers receive a plain [`Context`].
    pub fn new(config: ServerConfig) -> Result<Self, Error> {
        Self::with_injector(config, |ctx| ctx)
    }
}

impl<C: Injector> Server<C> {
    /// Creates a root server whose handlers receive `factory(ctx)` for every
    /// request.
    pub fn with_injector<F>(config: ServerConfig, factory: F) -> Result<Self, Error>
    where
        F: Fn(Context) -> C + Send + Sync + 'static,
    {
        if config.log_output.is_some() {
            logging::init(&config)?;
        }
        let ServerConfig { addr, log_output: _, shutdown_grace, listener, error_codes } = config;

        Ok(Self {
            shared: Arc::new(Shared {
                router: Mutex::new(Router::new()),
                hooks: ShutdownHooks::default(),
                factory: Arc::new(factory),
            }),
            root_path: String::new(),
            middleware: Middleware::default(),
            groups: HashMap::new(),
            codes: Arc::new(error_codes),
            codec: Arc::new(JsonCodec),
            listen: Some(Listen { addr, listener, grace: shutdown_grace }),
        })
    }

    /// Replaces the body codec for routes registered on this node and on
    /// groups created from it afterwards.
    pub fn set_codec(&mut self, codec: impl Codec) -> &mut Self {
        self.codec = Arc::new(codec);
        self
    }

    /// This node's absolute path prefix; empty for the root.
    pub fn root_path(&self) -> &str {
        &self.root_path
    }

    /// The sub-server for `prefix`, created on first use and cached.
    pub fn group(&mut self, prefix: &str) -> &mut Server<C> {
        let full = join_path(&self.root_path, prefix).trim_end_matches('/').to_owned();
        match self.groups.entry(full) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let child = Server {
                    shared: Arc::clone(&self.shared),
                    root_path: entry.key().clone(),
                    middleware: self.middleware.clone(),
                    groups: HashMap::new(),
                    codes: Arc::clone(&self.codes),
                    codec: Arc::clone(&self.codec),
                    listen: None,
                };
                entry.insert(child)
            }
        }
    }

    /// Adds a wrapper to this node's table. Routes registered afterwards, and
    /// groups created afterwards, include it.
    pub fn wrap_handler(&mut self, priority: i32, wrapper: Wrapper<C>) -> &mut Self {
        self.middleware.push(priority, wrapper);
        self
    }

    pub fn handle<H: Handler<C>>(&mut self, method: Method, path: &str, handler: H, shape: BodyShape) -> &mut Self {
        self.handle_middleware(method, path, Middleware::new(handler), shape)
    }

    /// Registers a pre-built [`Middleware`]. Its wrappers are merged after
    /// this node's at each priority.
    ///
    /// # Panics
    ///
    /// Panics if the middleware has no handler, or the route is malformed or
    /// already registered.
    pub fn handle_middleware(&mut self, method: Method, path: &str, middleware: Middleware<C>, shape: BodyShape) -> &mut Self {
        let full = join_path(&self.root_path, path);
        let route = self.route(&method, &full, middleware, shape);
        self.shared.router.lock().insert(method.clone(), &full, route);
        debug!(%method, path = %full, "route registered");
        self
    }

    /// Registers a handler in the exact-match table, which is consulted before
    /// pattern routes and accepts paths the pattern syntax cannot express.
    pub fn handle_exact<H: Handler<C>>(&mut self, method: Method, path: &str, handler: H, shape: BodyShape) -> &mut Self {
        let full = join_path(&self.root_path, path);
        let route = self.route(&method, &full, Middleware::new(handler), shape);
        self.shared.router.lock().insert_exact(method.clone(), &full, route);
        debug!(%method, path = %full, exact = true, "route registered");
        self
    }

    pub fn get<H: Handler<C>>(&mut self, path: &str, handler: H, shape: BodyShape) -> &mut Self {
        self.handle(Method::GET, path, handler, shape)
    }

    pub fn post<H: Handler<C>>(&mut self, path: &str, handler: H, shape: BodyShape) -> &mut Self {
        self.handle(Method::POST, path, handler, shape)
    }

    pub fn put<H: Handler<C>>(&mut self, path: &str, handler: H, shape: BodyShape) -> &mut Self {
        self.handle(Method::PUT, path, handler, shape)
    }

    pub fn delete<H: Handler<C>>(&mut self, path: &str, handler: H, shape: BodyShape) -> &mut Self {
        self.handle(Method::DELETE, path, handler, shape)
    }

    pub fn patch<H: Handler<C>>(&mut self, path: &str, handler: H, shape: BodyShape) -> &mut Self {
        self.handle(Method::PATCH, path, handler, shape)
    }

    pub fn head<H: Handler<C>>(&mut self, path: &str, handler: H, shape: BodyShape) -> &mut Self {
        self.handle(Method::HEAD, path, handler, shape)
    }

    pub fn options<H: Handler<C>>(&mut self, path: &str, handler: H, shape: BodyShape) -> &mut Self {
        self.handle(Method::OPTIONS, path, handler, shape)
    }

    /// Serves the files under `root` at `GET {path}/*file`.
    ///
    /// A directory answers with its `index.html`. Paths that climb out of
    /// `root`, directly or through a symlink, are forbidden.
    pub fn file_server(&mut self, path: &str, root: impl Into<PathBuf>) -> &mut Self {
        let pattern = join_path(path, "*file");
        self.get(&pattern, files::serve_dir::<C>(root.into()), BodyShape::None)
    }

    /// Every registered `(method, path)` pair across the whole tree.
    pub fn routes(&self) -> Vec<(Method, String)> {
        self.shared.router.lock().routes().to_vec()
    }

    /// Registers a callback run once after the server has drained, e.g. to
    /// close a database client.
    pub fn on_shutdown(&mut self, hook: impl FnOnce() + Send + 'static) -> &mut Self {
        self.shared.hooks.push(Box::new(hook));
        self
    }

    fn route(&self, method: &Method, full: &str, middleware: Middleware<C>, shape: BodyShape) -> Route<C> {
        let mut table = self.middleware.clone();
        table.merge(middleware);
        let Some(handler) = table.compose() else {
            panic!("route `{method} {full}` has no handler");
        };
        Route {
            handler,
            env: RouteEnv {
                codec: Arc::clone(&self.codec),
                codes: Arc::clone(&self.codes),
                shape,
                route: Arc::from(full),
            },
            factory: Arc::clone(&self.shared.factory),
        }
    }

    /// Freezes the routing table. Call on the root server.
    pub fn build(self) -> App<C> {
        let router = std::mem::replace(&mut *self.shared.router.lock(), Router::new());
        let hooks = ShutdownHooks(Mutex::new(self.shared.hooks.take()));
        let listen = self.listen.unwrap_or(Listen { addr: None, listener: None, grace: Duration::from_secs(30) });

        App {
            core: Arc::new(Core {
                router,
                codes: self.codes,
                codec: self.codec,
                shutdown: CancellationToken::new(),
            }),
            hooks,
            listen,
        }
    }

    /// Builds and runs. `addr` takes precedence over the configured address.
    pub async fn run(self, addr: Option<&str>) -> Result<(), Error> {
        self.build().run(addr).await
    }
}

impl<C: 'static> fmt::Debug for Server<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("root_path", &self.root_path)
            .field("wrappers", &self.middleware.wrapper_count())
            .field("groups", &self.groups.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

// ── App ───────────────────────────────────────────────────────────────────────

struct Core<C> {
    router: Router<Route<C>>,
    codes: Arc<ErrorCodes>,
    codec: Arc<dyn Codec>,
    shutdown: CancellationToken,
}

impl<C: Injector> Core<C> {
    async fn dispatch<B>(&self, req: http::Request<B>, remote_addr: SocketAddr) -> WireResponse
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: fmt::Display,
    {
        match self.router.lookup(req.method(), req.uri().path()) {
            Some((route, params)) => {
                pipeline::dispatch(route, req, params, remote_addr, self.shutdown.child_token()).await
            }
            None => self.unrouted(req.method(), req.uri().path()),
        }
    }

    /// 405 with an `Allow` header when another method has the path, else 404.
    fn unrouted(&self, method: &Method, path: &str) -> WireResponse {
        let allowed = self.router.allowed_methods(path);
        if allowed.is_empty() {
            debug!(%method, path, "no route");
            return Outcome::error(format!("no route for {method} {path}"), self.codes.not_found.clone(), StatusCode::NOT_FOUND)
                .finalize(HeaderMap::new(), self.codec.as_ref(), &self.codes);
        }

        let allow = allowed.iter().map(Method::as_str).collect::<Vec<_>>().join(", ");
        debug!(%method, path, allow = %allow, "method not allowed");
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&allow) {
            headers.insert(header::ALLOW, value);
        }
        Outcome::error(
            format!("method {method} not allowed for {path}"),
            self.codes.method_not_allowed.clone(),
            StatusCode::METHOD_NOT_ALLOWED,
        )
        .finalize(headers, self.codec.as_ref(), &self.codes)
    }
}

/// A server with a frozen routing table, ready to serve.
pub struct App<C = Context> {
    core: Arc<Core<C>>,
    hooks: ShutdownHooks,
    listen: Listen,
}

impl<C: Injector> App<C> {
    /// Runs one request through routing and the pipeline without a socket.
    pub async fn dispatch<B>(&self, req: http::Request<B>, remote_addr: SocketAddr) -> WireResponse
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: fmt::Display,
    {
        self.core.dispatch(req, remote_addr).await
    }

    /// Cancelling this token starts a graceful shutdown of [`run`](App::run).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.core.shutdown.clone()
    }

    pub fn routes(&self) -> &[(Method, String)] {
        self.core.router.routes()
    }

    /// Binds and serves until shutdown, then drains and runs shutdown hooks.
    ///
    /// The listener comes from, in order: the configured
    /// [`listener`](ServerConfig::listener), `addr`, the configured address,
    /// the `PORT` environment variable, port [`DEFAULT_PORT`](crate::DEFAULT_PORT).
    pub async fn run(mut self, addr: Option<&str>) -> Result<(), Error> {
        let listener = match self.listen.listener.take() {
            Some(std_listener) => {
                std_listener.set_nonblocking(true)?;
                TcpListener::from_std(std_listener)?
            }
            None => {
                let addr = resolve_addr(addr, self.listen.addr.as_deref())?;
                TcpListener::bind(addr)
                    .await
                    .map_err(|source| Error::Bind { addr: addr.to_string(), source })?
            }
        };
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, routes = self.core.router.routes().len(), "weft listening");

        let shutdown = self.core.shutdown.clone();
        let mut tasks = tokio::task::JoinSet::new();

        let signal = shutdown_signal();
        tokio::pin!(signal);

        loop {
            tokio::select! {
                biased;

                () = &mut signal => {
                    info!(in_flight = tasks.len(), "shutdown signal received, draining connections");
                    break;
                }

                () = shutdown.cancelled() => {
                    info!(in_flight = tasks.len(), "shutdown requested, draining connections");
                    break;
                }

                res = listener.accept() => {
                    let (stream, remote_addr) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };

                    let core = Arc::clone(&self.core);
                    let closing = shutdown.clone();
                    let io = TokioIo::new(stream);

                    tasks.spawn(async move {
                        let svc = service_fn(move |req: http::Request<hyper::body::Incoming>| {
                            let core = Arc::clone(&core);
                            async move { Ok::<_, Infallible>(core.dispatch(req, remote_addr).await) }
                        });

                        let builder = ConnBuilder::new(TokioExecutor::new());
                        let conn = builder.serve_connection(io, svc);
                        tokio::pin!(conn);

                        let res = tokio::select! {
                            res = conn.as_mut() => res,
                            () = closing.cancelled() => {
                                conn.as_mut().graceful_shutdown();
                                conn.as_mut().await
                            }
                        };
                        if let Err(e) = res {
                            error!(peer = %remote_addr, "connection error: {e}");
                        }
                    });
                }

                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        shutdown.cancel();
        drop(listener);

        let grace = self.listen.grace;
        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = tasks.len(), grace = ?grace, "grace period elapsed, aborting connections");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        self.hooks.run();
        info!("weft stopped");
        Ok(())
    }
}

impl<C> Drop for App<C> {
    fn drop(&mut self) {
        self.hooks.run();
    }
}

/// Resolves on the first SIGTERM or Ctrl-C the process receives. A signal
/// whose handler cannot be installed never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl-C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = sigterm => {}
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use http_body_util::{BodyExt, Full};

    use super::*;

    fn peer() -> SocketAddr {
        "192.0.2.1:4000".parse().unwrap()
    }

    async fn get(app: &App, path: &str) -> (StatusCode, Bytes) {
        let req = http::Request::get(path).body(Full::new(Bytes::new())).unwrap();
        let res = app.dispatch(req, peer()).await;
        let status = res.status();
        (status, res.into_body().collect().await.unwrap().to_bytes())
    }

    #[test]
    fn groups_are_cached_by_full_prefix() {
        let mut server = Server::new(ServerConfig::default()).unwrap();
        server.group("/api").wrap_handler(0, crate::middleware::cors());
        assert_eq!(server.group("/api/").root_path(), "/api");
        assert_eq!(server.group("/api").middleware.wrapper_count(), 1);
        assert_eq!(server.group("api").group("v1").root_path(), "/api/v1");
    }

    #[test]
    fn group_wrappers_do_not_leak_to_parent() {
        let mut server = Server::new(ServerConfig::default()).unwrap();
        server.wrap_handler(0, crate::middleware::recover());
        server.group("/a").wrap_handler(0, crate::middleware::cors());
        assert_eq!(server.middleware.wrapper_count(), 1);
        assert_eq!(server.group("/a").middleware.wrapper_count(), 2);
        assert_eq!(server.group("/b").middleware.wrapper_count(), 1);
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let mut server = Server::new(ServerConfig::default()).unwrap();
        server.get("/known", |ctx: Context| async move { ctx.wrap_ok("yes") }, BodyShape::None);
        let app = server.build();

        let (status, body) = get(&app, "/unknown").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["code"], "ERR_NOT_FOUND");
    }

    #[tokio::test]
    async fn other_method_on_known_path_is_not_allowed() {
        let mut server = Server::new(ServerConfig::default()).unwrap();
        server.get("/items/:id", |ctx: Context| async move { ctx.wrap_ok("item") }, BodyShape::None);
        server.delete("/items/:id", |ctx: Context| async move { ctx.wrap_no_content() }, BodyShape::None);
        let app = server.build();

        let req = http::Request::post("/items/3").body(Full::new(Bytes::new())).unwrap();
        let res = app.dispatch(req, peer()).await;
        assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(res.headers()[header::ALLOW], "DELETE, GET");
        let body = res.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["code"], "ERR_METHOD_NOT_ALLOWED");
    }

    #[test]
    fn debug_lists_prefix_wrappers_and_groups() {
        let mut server = Server::new(ServerConfig::default()).unwrap();
        server.wrap_handler(0, crate::middleware::cors());
        server.group("/api");
        let shown = format!("{server:?}");
        assert!(shown.contains("wrappers: 1"), "{shown}");
        assert!(shown.contains("\"/api\""), "{shown}");
    }

    #[tokio::test]
    async fn routes_lists_the_whole_tree() {
        let mut server = Server::new(ServerConfig::default()).unwrap();
        server.get("/", |ctx: Context| async move { ctx.wrap_no_content() }, BodyShape::None);
        server.group("/v1").post("/items", |ctx: Context| async move { ctx.wrap_no_content() }, BodyShape::Raw);
        assert_eq!(
            server.routes(),
            vec![(Method::GET, "/".to_owned()), (Method::POST, "/v1/items".to_owned())]
        );
    }

    #[test]
    #[should_panic(expected = "has no handler")]
    fn middleware_without_handler_is_fatal() {
        let mut server = Server::new(ServerConfig::default()).unwrap();
        server.handle_middleware(Method::GET, "/", Middleware::default(), BodyShape::None);
    }

    #[test]
    fn hooks_run_once_when_app_is_dropped() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut server = Server::new(ServerConfig::default()).unwrap();
        let seen = Arc::clone(&count);
        server.group("/x").on_shutdown(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let app = server.build();
        app.hooks.run();
        drop(app);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_drains_and_runs_hooks_on_cancel() {
        let count = Arc::new(AtomicUsize::new(0));
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut server = Server::new(ServerConfig::default().listener(listener)).unwrap();
        let seen = Arc::clone(&count);
        server.on_shutdown(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let app = server.build();
        let token = app.shutdown_token();
        let running = tokio::spawn(app.run(None));
        token.cancel();
        running.await.unwrap().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
