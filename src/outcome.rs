//! Handler outcomes and their conversion into wire responses.
//!
//! A handler never touches the connection. It produces an [`Outcome`]: a body,
//! an optional status and an optional content type. After the composed
//! handler returns, the pipeline finalizes the outcome into an
//! `http::Response`, encoding structured values through the server's
//! [`Codec`]. An outcome marked *terminated* already carries its complete
//! response and bypasses finalization.

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, StatusCode};
use http_body_util::Full;
use serde::Serialize;
use serde_json::Value;

use crate::codec::Codec;

/// The wire response type produced by the pipeline.
pub type WireResponse = http::Response<Full<Bytes>>;

// ── ContentType ───────────────────────────────────────────────────────────────

/// Common content-type values for [`Outcome::with_content_type`] and
/// [`Context::set_content_type`](crate::Context::set_content_type).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ContentType {
    Csv,          // text/csv
    EventStream,  // text/event-stream  (SSE)
    FormData,     // application/x-www-form-urlencoded
    Html,         // text/html; charset=utf-8
    Json,         // application/json
    OctetStream,  // application/octet-stream  (binary / file download)
    Text,         // text/plain; charset=utf-8
    Xml,          // application/xml
    Yaml,         // text/yaml
}

impl ContentType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Csv         => "text/csv",
            Self::EventStream => "text/event-stream",
            Self::FormData    => "application/x-www-form-urlencoded",
            Self::Html        => "text/html; charset=utf-8",
            Self::Json        => "application/json",
            Self::OctetStream => "application/octet-stream",
            Self::Text        => "text/plain; charset=utf-8",
            Self::Xml         => "application/xml",
            Self::Yaml        => "text/yaml",
        }
    }

    pub(crate) fn header_value(self) -> HeaderValue {
        HeaderValue::from_static(self.as_str())
    }
}

// ── Error codes ───────────────────────────────────────────────────────────────

/// Machine-readable codes placed in the `code` field of error bodies.
///
/// Built once with the server configuration and copied into every group.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ErrorCodes {
    pub bad_request: String,
    pub internal: String,
    pub too_many_requests: String,
    pub not_found: String,
    pub method_not_allowed: String,
    pub conflict: String,
    pub forbidden: String,
    pub not_implemented: String,
    pub not_acceptable: String,
}

impl Default for ErrorCodes {
    fn default() -> Self {
        Self {
            bad_request: "ERR_BAD_REQUEST".to_owned(),
            internal: "ERR_INTERNAL_SERVER".to_owned(),
            too_many_requests: "ERR_TOO_MANY_REQUESTS".to_owned(),
            not_found: "ERR_NOT_FOUND".to_owned(),
            method_not_allowed: "ERR_METHOD_NOT_ALLOWED".to_owned(),
            conflict: "ERR_ALREADY_EXIST".to_owned(),
            forbidden: "ERR_FORBIDDEN".to_owned(),
            not_implemented: "ERR_NOT_IMPLEMENTED".to_owned(),
            not_acceptable: "ERR_NOT_ACCEPTABLE".to_owned(),
        }
    }
}

impl ErrorCodes {
    /// The code registered for `status`, if any.
    pub fn for_status(&self, status: StatusCode) -> Option<&str> {
        let code = match status {
            StatusCode::BAD_REQUEST => &self.bad_request,
            StatusCode::INTERNAL_SERVER_ERROR => &self.internal,
            StatusCode::TOO_MANY_REQUESTS => &self.too_many_requests,
            StatusCode::NOT_FOUND => &self.not_found,
            StatusCode::METHOD_NOT_ALLOWED => &self.method_not_allowed,
            StatusCode::CONFLICT => &self.conflict,
            StatusCode::FORBIDDEN => &self.forbidden,
            StatusCode::NOT_IMPLEMENTED => &self.not_implemented,
            StatusCode::NOT_ACCEPTABLE => &self.not_acceptable,
            _ => return None,
        };
        Some(code)
    }
}

/// The JSON error body: `{"error": …, "code": …}`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
}

// ── Body ──────────────────────────────────────────────────────────────────────

/// What an [`Outcome`] carries as its payload.
///
/// `Bytes`, `Text` and `Error` are sent as they are. `Value` goes through the
/// codec at finalization. `Unencodable` records a value that could not be
/// turned into JSON when the outcome was built; it finalizes as a 500.
#[derive(Debug, Default)]
pub enum Body {
    #[default]
    Empty,
    Bytes(Bytes),
    Text(String),
    Error(ErrorBody),
    Value(Value),
    Unencodable(String),
}

/// Typed JSON body: `ctx.wrap_ok(Json(user))`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Json<T>(pub T);

/// Conversion into a response [`Body`].
pub trait IntoBody {
    fn into_body(self) -> Body;
}

impl IntoBody for Body {
    fn into_body(self) -> Body { self }
}

impl IntoBody for () {
    fn into_body(self) -> Body { Body::Empty }
}

impl IntoBody for Bytes {
    fn into_body(self) -> Body { Body::Bytes(self) }
}

impl IntoBody for Vec<u8> {
    fn into_body(self) -> Body { Body::Bytes(Bytes::from(self)) }
}

impl IntoBody for &'static [u8] {
    fn into_body(self) -> Body { Body::Bytes(Bytes::from_static(self)) }
}

impl IntoBody for String {
    fn into_body(self) -> Body { Body::Text(self) }
}

impl IntoBody for &'static str {
    fn into_body(self) -> Body { Body::Text(self.to_owned()) }
}

impl IntoBody for Value {
    fn into_body(self) -> Body { Body::Value(self) }
}

impl IntoBody for ErrorBody {
    fn into_body(self) -> Body { Body::Error(self) }
}

impl<T: Serialize> IntoBody for Json<T> {
    fn into_body(self) -> Body {
        match serde_json::to_value(&self.0) {
            Ok(value) => Body::Value(value),
            Err(e) => Body::Unencodable(e.to_string()),
        }
    }
}

// ── Outcome ───────────────────────────────────────────────────────────────────

/// The structured result of handling one request.
///
/// ```rust
/// use weft::{ContentType, Outcome};
/// use http::StatusCode;
///
/// Outcome::ok("hello");
/// Outcome::new(serde_json::json!({"id": 7}), StatusCode::CREATED);
/// Outcome::ok("<ok/>").with_content_type(ContentType::Xml);
/// ```
#[derive(Debug, Default)]
pub struct Outcome {
    body: Body,
    status: Option<StatusCode>,
    content_type: Option<HeaderValue>,
    terminated: bool,
    written: Option<WireResponse>,
}

impl Outcome {
    pub fn new(body: impl IntoBody, status: StatusCode) -> Self {
        Self { body: body.into_body(), status: Some(status), ..Self::default() }
    }

    /// Outcome with the default status (200).
    pub fn ok(body: impl IntoBody) -> Self {
        Self { body: body.into_body(), ..Self::default() }
    }

    pub fn no_content() -> Self {
        Self::new(Body::Empty, StatusCode::NO_CONTENT)
    }

    /// A JSON error body with an explicit code.
    pub fn error(message: impl Into<String>, code: impl Into<String>, status: StatusCode) -> Self {
        let body = ErrorBody { error: message.into(), code: code.into() };
        Self::new(Body::Error(body), status).with_content_type(ContentType::Json)
    }

    /// A response the handler produced in full. It is sent exactly as given.
    pub fn written(response: WireResponse) -> Self {
        Self { terminated: true, written: Some(response), ..Self::default() }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_content_type(mut self, content_type: ContentType) -> Self {
        self.content_type = Some(content_type.header_value());
        self
    }

    /// Status as sent: the explicit one, or 200.
    pub fn status(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::OK)
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn is_successful(&self) -> bool {
        self.status().is_success()
    }

    /// Turns this outcome into the wire response.
    ///
    /// `headers` are the response headers the handler and its wrappers set on
    /// the context. Terminated outcomes skip every step here.
    pub(crate) fn finalize(self, headers: HeaderMap, codec: &dyn Codec, codes: &ErrorCodes) -> WireResponse {
        if self.terminated {
            return self.written.unwrap_or_default();
        }

        let status = self.status();
        let bytes = match self.body {
            Body::Empty => Bytes::new(),
            Body::Bytes(bytes) => bytes,
            Body::Text(text) => Bytes::from(text),
            Body::Error(err) => Bytes::from(serde_json::to_vec(&err).unwrap_or_default()),
            Body::Value(value) => match codec.encode(&value) {
                Ok(encoded) => Bytes::from(encoded),
                Err(e) => return encode_failure(e.to_string(), headers, codec, codes),
            },
            Body::Unencodable(reason) => return encode_failure(reason, headers, codec, codes),
        };

        let mut response = WireResponse::new(Full::new(bytes));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        if let Some(content_type) = self.content_type {
            response.headers_mut().insert(CONTENT_TYPE, content_type);
        }
        if !response.headers().contains_key(CONTENT_TYPE) {
            response.headers_mut().insert(CONTENT_TYPE, ContentType::Json.header_value());
        }
        response
    }
}

fn encode_failure(reason: String, headers: HeaderMap, codec: &dyn Codec, codes: &ErrorCodes) -> WireResponse {
    tracing::error!(error = %reason, "response body could not be encoded");
    Outcome::error(
        format!("error in json encoding, err={reason}"),
        codes.internal.clone(),
        StatusCode::INTERNAL_SERVER_ERROR,
    )
    .finalize(headers, codec, codes)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use http_body_util::BodyExt;
    use serde_json::json;

    use super::*;
    use crate::codec::{CodecError, JsonCodec};

    async fn body_bytes(response: WireResponse) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    fn finalize(outcome: Outcome) -> WireResponse {
        outcome.finalize(HeaderMap::new(), &JsonCodec, &ErrorCodes::default())
    }

    struct FailingCodec;

    impl Codec for FailingCodec {
        fn encode(&self, _: &Value) -> Result<Vec<u8>, CodecError> {
            Err(CodecError::Message("boom".to_owned()))
        }
        fn decode(&self, _: &[u8]) -> Result<Value, CodecError> {
            Err(CodecError::Message("boom".to_owned()))
        }
    }

    #[tokio::test]
    async fn values_are_encoded_with_json_defaults() {
        let response = finalize(Outcome::ok(json!({"a": 1})));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
        assert_eq!(body_bytes(response).await, Bytes::from_static(br#"{"a":1}"#));
    }

    #[tokio::test]
    async fn text_and_bytes_pass_through_unchanged() {
        let response = finalize(Outcome::ok("plain"));
        assert_eq!(body_bytes(response).await, Bytes::from_static(b"plain"));

        let response = finalize(Outcome::new(vec![0u8, 159, 146], StatusCode::ACCEPTED));
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(body_bytes(response).await, Bytes::from_static(&[0, 159, 146]));
    }

    #[tokio::test]
    async fn handler_content_type_is_kept() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/csv"));
        let response = Outcome::ok("a,b").finalize(headers, &JsonCodec, &ErrorCodes::default());
        assert_eq!(response.headers()[CONTENT_TYPE], "text/csv");
    }

    #[tokio::test]
    async fn error_body_keeps_field_order() {
        let response = finalize(Outcome::error("nope", "ERR_FORBIDDEN", StatusCode::FORBIDDEN));
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            body_bytes(response).await,
            Bytes::from_static(br#"{"error":"nope","code":"ERR_FORBIDDEN"}"#)
        );
    }

    #[tokio::test]
    async fn encode_failure_becomes_internal_error() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        let response = Outcome::ok(json!([1, 2])).finalize(headers, &FailingCodec, &ErrorCodes::default());
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
        let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(body["code"], "ERR_INTERNAL_SERVER");
    }

    #[tokio::test]
    async fn unserializable_json_becomes_internal_error() {
        // Non-string map keys cannot become a JSON object.
        let bad: HashMap<(i32, i32), i32> = HashMap::from([((1, 2), 3)]);
        let response = finalize(Outcome::ok(Json(bad)));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn terminated_outcome_skips_finalization() {
        let mut written = WireResponse::new(Full::new(Bytes::from_static(b"raw")));
        *written.status_mut() = StatusCode::PARTIAL_CONTENT;
        let response = finalize(Outcome::written(written));
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert!(!response.headers().contains_key(CONTENT_TYPE));
        assert_eq!(body_bytes(response).await, Bytes::from_static(b"raw"));
    }

    #[test]
    fn codes_follow_status() {
        let codes = ErrorCodes::default();
        assert_eq!(codes.for_status(StatusCode::CONFLICT), Some("ERR_ALREADY_EXIST"));
        assert_eq!(codes.for_status(StatusCode::NOT_ACCEPTABLE), Some("ERR_NOT_ACCEPTABLE"));
        assert_eq!(codes.for_status(StatusCode::METHOD_NOT_ALLOWED), Some("ERR_METHOD_NOT_ALLOWED"));
        assert_eq!(codes.for_status(StatusCode::OK), None);
    }
}
