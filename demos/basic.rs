//! Minimal weft example: a JSON API with groups, wrappers and a rate limit.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example basic
//!
//! Try:
//!   curl http://localhost:3000/users/42
//!   curl -X POST http://localhost:3000/users \
//!        -H 'content-type: application/json' \
//!        -d '{"name":"alice"}'
//!   curl -X DELETE http://localhost:3000/users/42
//!   curl -H 'x-role: admin' http://localhost:3000/admin/stats

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use http::StatusCode;
use serde::Deserialize;
use serde_json::json;
use weft::{Abort, BodyShape, Context, HandlerResult, Injector, Outcome, Server, ServerConfig, from_fn, middleware};

/// Handlers receive this instead of a bare [`Context`].
#[derive(Clone)]
struct AppCtx {
    base: Context,
    next_id: Arc<AtomicU64>,
}

impl Injector for AppCtx {
    fn context(&self) -> &Context {
        &self.base
    }
}

#[derive(Deserialize)]
struct NewUser {
    name: String,
}

#[tokio::main]
async fn main() -> Result<(), weft::Error> {
    tracing_subscriber::fmt::init();

    let next_id = Arc::new(AtomicU64::new(100));
    let mut server = Server::with_injector(ServerConfig::default().addr(":3000"), move |base| AppCtx {
        base,
        next_id: Arc::clone(&next_id),
    })?;

    server
        .wrap_handler(-100, middleware::recover())
        .wrap_handler(-50, middleware::monitor())
        .wrap_handler(-40, middleware::cors())
        .wrap_handler(0, middleware::dos_limiter(50, Duration::from_secs(1)));

    server
        .group("/users")
        .get("/:id", get_user, BodyShape::None)
        .post("/", create_user, BodyShape::json::<NewUser>())
        .delete("/:id", delete_user, BodyShape::None);

    server
        .group("/admin")
        .wrap_handler(10, from_fn(|ctx: AppCtx, next| async move {
            require_admin(ctx.context())?;
            next.call(ctx).await
        }))
        .get("/stats", stats, BodyShape::None);

    server.on_shutdown(|| tracing::info!("closing connections to the user store"));

    server.run(None).await
}

// GET /users/:id
async fn get_user(ctx: AppCtx) -> HandlerResult {
    let ctx = ctx.context();
    let id: u64 = match ctx.path_param("id").and_then(|id| id.parse().ok()) {
        Some(id) => id,
        None => return Err(ctx.wrap_bad_request("id must be a number").into()),
    };
    Ok(ctx.wrap_ok(json!({ "id": id, "name": "alice" })))
}

// POST /users
//
// The body was decoded before this runs; a malformed one never gets here.
async fn create_user(ctx: AppCtx) -> HandlerResult {
    let input = ctx.base.body::<NewUser>()?;
    let id = ctx.next_id.fetch_add(1, Ordering::Relaxed);
    ctx.base.set_response_header(http::header::LOCATION, http::HeaderValue::from(id));
    Ok(ctx.base.wrap(json!({ "id": id, "name": input.name }), StatusCode::CREATED))
}

// DELETE /users/:id → 204 No Content
async fn delete_user(ctx: AppCtx) -> Outcome {
    ctx.base.wrap_no_content()
}

// GET /admin/stats
async fn stats(ctx: AppCtx) -> Outcome {
    ctx.base.wrap_ok(json!({ "issued_ids": ctx.next_id.load(Ordering::Relaxed) - 100 }))
}

/// Rejects the request unless the caller claims the admin role.
fn require_admin(ctx: &Context) -> Result<(), Abort> {
    if ctx.header("x-role") != Some("admin") {
        return Err(Abort(ctx.wrap_forbidden("admin role required")));
    }
    Ok(())
}
