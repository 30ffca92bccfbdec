use tokio::time::Instant;
use tracing::info;

use crate::context::Injector;
use crate::handler::{Abort, Wrapper, from_fn};

/// Emits one `info` event per request on the `weft::access` target, after
/// the enclosed handler has produced its outcome.
pub fn monitor<C: Injector>() -> Wrapper<C> {
    from_fn(|ctx: C, next| async move {
        let started = Instant::now();
        let result = next.call(ctx.clone()).await;

        let base = ctx.context();
        let status = match &result {
            Ok(outcome) | Err(Abort(outcome)) => outcome.status().as_u16(),
        };
        info!(
            target: "weft::access",
            duration = ?started.elapsed(),
            client = %base.real_ip(),
            peer = %base.remote_addr(),
            forwarded = base.header("x-forwarded-for").unwrap_or(""),
            url = %base.uri(),
            host = base.host().unwrap_or(""),
            method = %base.method(),
            content_len = base.content_length().unwrap_or(0),
            status,
        );
        result
    })
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::StatusCode;

    use super::*;
    use crate::context::Context;
    use crate::context::tests::context_for;
    use crate::handler::handler_fn;
    use crate::pipeline::BodyShape;

    #[tokio::test]
    async fn passes_the_outcome_through() {
        let inner = handler_fn(|ctx: Context| async move { ctx.wrap_conflict("taken") });
        let ctx = context_for(http::Request::new(Bytes::new()), BodyShape::None);
        let outcome = monitor::<Context>()(inner).call(ctx).await.unwrap();
        assert_eq!(outcome.status(), StatusCode::CONFLICT);
    }
}
