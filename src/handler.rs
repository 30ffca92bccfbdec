//! Handler trait, type erasure, and the abort channel.
//!
//! # How async handlers are stored
//!
//! The router holds handlers of *different* closure types in one table, and a
//! wrapper must be able to take any handler and return another. Both need a
//! single concrete type, so handlers are erased behind `dyn ErasedHandler<C>`
//! where `C` is the per-request context type the server was built with.
//!
//! ```text
//! async fn show(ctx: Context) -> Outcome { … }      ← user writes this
//!        ↓ server.get("/", show, BodyShape::None)
//! show.into_boxed_handler()                         ← Handler blanket impl
//!        ↓
//! Arc::new(FnHandler(show))                         ← heap-allocated wrapper
//!        ↓  stored as BoxedHandler<C> = Arc<dyn ErasedHandler<C>>
//! wrappers fold over it at registration             ← Arc<dyn Fn(h) -> h>
//!        ↓
//! handler.call(ctx) at request time                 ← one vtable dispatch per layer
//! ```
//!
//! # Aborting
//!
//! A handler returns either an [`Outcome`] or a [`HandlerResult`]. The `Err`
//! side carries an [`Abort`]: an outcome that short-circuits every caller up
//! to the recovery point, so deep helper code can bail out with `?`.
//! The pipeline treats an abort exactly like a returned outcome.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::outcome::Outcome;

/// A heap-allocated, type-erased future.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// An outcome delivered through the short-circuit channel.
#[derive(Debug)]
pub struct Abort(pub Outcome);

impl Abort {
    pub fn into_outcome(self) -> Outcome {
        self.0
    }
}

impl From<Outcome> for Abort {
    fn from(outcome: Outcome) -> Self {
        Self(outcome)
    }
}

/// What every handler and wrapper layer resolves to.
pub type HandlerResult = Result<Outcome, Abort>;

/// Aborts the current request from arbitrarily deep synchronous code.
///
/// Unwinds with `outcome` as the panic payload; the recovery layer sends that
/// outcome as the response. Because this is a real panic, the process panic
/// hook still runs first, and the default hook prints a `panicked at` line to
/// stderr for every abort. It also needs `panic = "unwind"`.
///
/// Where a `Result` can be threaded through, return `Err(Abort)` instead:
///
/// ```rust
/// use weft::{Abort, Context};
///
/// fn require_admin(ctx: &Context) -> Result<(), Abort> {
///     if ctx.header("x-role") != Some("admin") {
///         return Err(Abort(ctx.wrap_forbidden("admin role required")));
///     }
///     Ok(())
/// }
/// ```
pub fn abort(outcome: Outcome) -> ! {
    std::panic::panic_any(outcome)
}

/// Return types a handler may produce.
pub trait IntoHandlerResult {
    fn into_handler_result(self) -> HandlerResult;
}

impl IntoHandlerResult for Outcome {
    fn into_handler_result(self) -> HandlerResult { Ok(self) }
}

impl IntoHandlerResult for HandlerResult {
    fn into_handler_result(self) -> HandlerResult { self }
}

// ── Internal types ────────────────────────────────────────────────────────────

/// Dispatch interface behind [`BoxedHandler`].
pub trait ErasedHandler<C>: Send + Sync + 'static {
    fn call(&self, ctx: C) -> BoxFuture<HandlerResult>;
}

/// A type-erased handler shared across concurrent requests.
///
/// This is also what a wrapper receives and returns: the handler it encloses,
/// and the handler that encloses it.
pub type BoxedHandler<C> = Arc<dyn ErasedHandler<C>>;

/// A composable transform around a handler.
pub type Wrapper<C> = Arc<dyn Fn(BoxedHandler<C>) -> BoxedHandler<C> + Send + Sync + 'static>;

// ── Public Handler trait ──────────────────────────────────────────────────────

/// Implemented for every valid route handler.
///
/// You never implement this yourself. It is satisfied by any function or
/// closure with the signature:
///
/// ```text
/// async fn name(ctx: C) -> Outcome
/// async fn name(ctx: C) -> HandlerResult
/// ```
///
/// The trait is sealed so the blanket impl stays the only one.
pub trait Handler<C>: private::Sealed<C> + Send + Sync + 'static {
    fn into_boxed_handler(self) -> BoxedHandler<C>;
}

mod private {
    pub trait Sealed<C> {}
}

impl<C, F, Fut, R> private::Sealed<C> for F
where
    F: Fn(C) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoHandlerResult + Send + 'static,
{
}

impl<C, F, Fut, R> Handler<C> for F
where
    C: 'static,
    F: Fn(C) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoHandlerResult + Send + 'static,
{
    fn into_boxed_handler(self) -> BoxedHandler<C> {
        Arc::new(FnHandler(self))
    }
}

/// Newtype holding a concrete handler `F`, bridging it to [`ErasedHandler`].
struct FnHandler<F>(F);

impl<C, F, Fut, R> ErasedHandler<C> for FnHandler<F>
where
    F: Fn(C) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoHandlerResult + Send + 'static,
{
    fn call(&self, ctx: C) -> BoxFuture<HandlerResult> {
        let fut = (self.0)(ctx);
        Box::pin(async move { fut.await.into_handler_result() })
    }
}

/// Boxes a handler. Handy inside wrappers, which must return a [`BoxedHandler`].
pub fn handler_fn<C: 'static>(handler: impl Handler<C>) -> BoxedHandler<C> {
    handler.into_boxed_handler()
}

/// Builds a [`Wrapper`] from an async function receiving the context and the
/// enclosed handler.
///
/// ```rust
/// use weft::{from_fn, Context};
///
/// let timing = from_fn(|ctx: Context, next| async move {
///     let started = std::time::Instant::now();
///     let result = next.call(ctx).await;
///     tracing::debug!(elapsed = ?started.elapsed(), "done");
///     result
/// });
/// # let _ = timing;
/// ```
pub fn from_fn<C, F, Fut, R>(f: F) -> Wrapper<C>
where
    C: Send + 'static,
    F: Fn(C, BoxedHandler<C>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoHandlerResult + Send + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |next: BoxedHandler<C>| {
        let f = Arc::clone(&f);
        handler_fn(move |ctx: C| f(ctx, Arc::clone(&next)))
    })
}

#[cfg(test)]
mod tests {
    use http::StatusCode;

    use super::*;

    #[tokio::test]
    async fn outcome_and_result_handlers_both_erase() {
        let plain = handler_fn(|n: u32| async move { Outcome::ok(n.to_string()) });
        let fallible = handler_fn(|n: u32| async move {
            if n == 0 {
                return Err(Abort::from(Outcome::no_content()));
            }
            Ok(Outcome::ok("nonzero"))
        });

        assert!(plain.call(1).await.is_ok());
        let aborted = fallible.call(0).await.unwrap_err();
        assert_eq!(aborted.into_outcome().status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn from_fn_sees_the_inner_result() {
        let inner = handler_fn(|_: ()| async { Outcome::ok("inner") });
        let wrapper = from_fn(|ctx: (), next: BoxedHandler<()>| async move {
            let result = next.call(ctx).await?;
            Ok::<_, Abort>(result.with_status(StatusCode::CREATED))
        });
        let outcome = wrapper(inner).call(()).await.unwrap();
        assert_eq!(outcome.status(), StatusCode::CREATED);
    }
}
