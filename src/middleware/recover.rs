//! Panic and abort recovery.
//!
//! The dispatcher already refuses to let a panic escape a request, so these
//! wrappers are about *where* recovery happens and *what* it produces. Placed
//! near the outside of the stack, they let outer wrappers (access logs, CORS)
//! observe the recovered outcome instead of being unwound through.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::error;

use crate::context::{Context, Injector};
use crate::handler::{Abort, BoxedHandler, Wrapper, handler_fn};
use crate::outcome::Outcome;

/// Renders a panic payload as text: the message for `&str` / `String`
/// payloads, a placeholder for anything else.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

/// An [`Outcome`] payload is the response itself; anything else is a 500
/// whose error message is the rendered payload.
pub(crate) fn payload_to_outcome(ctx: &Context, payload: Box<dyn Any + Send>) -> Outcome {
    match payload.downcast::<Outcome>() {
        Ok(outcome) => *outcome,
        Err(other) => {
            let message = panic_message(other.as_ref());
            error!(path = %ctx.path(), panic = %message, "handler panicked");
            ctx.wrap_internal(message)
        }
    }
}

/// Recovers panics into outcomes and converts aborts into normal returns.
pub fn recover<C: Injector>() -> Wrapper<C> {
    panic_handler(|ctx: &C, payload: Box<dyn Any + Send>| payload_to_outcome(ctx.context(), payload))
}

/// Like [`recover`], with a custom mapping for panic payloads that are not
/// outcomes. Outcome payloads are always sent as they are.
pub fn panic_handler<C, F>(on_panic: F) -> Wrapper<C>
where
    C: Injector,
    F: Fn(&C, Box<dyn Any + Send>) -> Outcome + Send + Sync + 'static,
{
    let on_panic = Arc::new(on_panic);
    Arc::new(move |next: BoxedHandler<C>| {
        let on_panic = Arc::clone(&on_panic);
        handler_fn(move |ctx: C| {
            let next = Arc::clone(&next);
            let on_panic = Arc::clone(&on_panic);
            async move {
                let probe = ctx.clone();
                let result = AssertUnwindSafe(async move { next.call(ctx).await })
                    .catch_unwind()
                    .await;
                match result {
                    Ok(Ok(outcome)) | Ok(Err(Abort(outcome))) => outcome,
                    Err(payload) => match payload.downcast::<Outcome>() {
                        Ok(outcome) => *outcome,
                        Err(other) => on_panic(&probe, other),
                    },
                }
            }
        })
    })
}
