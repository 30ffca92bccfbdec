use http::{HeaderValue, Method, header};

use crate::context::Injector;
use crate::handler::{Wrapper, from_fn};

/// Permissive CORS: any origin, the common verbs, `Content-Type` and
/// `Authorization` request headers, credentials allowed.
///
/// The inner handler always runs; for `OPTIONS` requests its outcome is then
/// replaced with a 204.
pub fn cors<C: Injector>() -> Wrapper<C> {
    from_fn(|ctx: C, next| async move {
        let result = next.call(ctx.clone()).await;

        let base = ctx.context();
        base.set_response_header(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
        base.set_response_header(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET,POST,PUT,DELETE,OPTIONS"),
        );
        base.set_response_header(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("Content-Type,Authorization"),
        );
        base.set_response_header(header::ACCESS_CONTROL_ALLOW_CREDENTIALS, HeaderValue::from_static("true"));

        if base.method() == Method::OPTIONS {
            return Ok(base.wrap_no_content());
        }
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
    async fn headers_are_added_after_the_handler() {
        let inner = handler_fn(|ctx: Context| async move { ctx.wrap_ok("hello") });
        let ctx = context_for(http::Request::new(Bytes::new()), BodyShape::None);
        let outcome = cors::<Context>()(inner).call(ctx.clone()).await.unwrap();

        assert_eq!(outcome.status(), StatusCode::OK);
        let headers = ctx.response_headers();
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
    }

    #[tokio::test]
    async fn preflight_gets_no_content() {
        let inner = handler_fn(|ctx: Context| async move { ctx.wrap_not_found("no options route") });
        let request = http::Request::builder().method(Method::OPTIONS).body(Bytes::new()).unwrap();
        let ctx = context_for(request, BodyShape::None);
        let outcome = cors::<Context>()(inner).call(ctx).await.unwrap();
        assert_eq!(outcome.status(), StatusCode::NO_CONTENT);
    }
}
