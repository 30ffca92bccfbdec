//! Static files served from a root directory.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, StatusCode, header};
use http_body_util::Full;
use tracing::warn;

use crate::context::{Context, Injector};
use crate::handler::Handler;
use crate::outcome::{Outcome, WireResponse};

/// Served when a request names a directory.
const INDEX_FILE: &str = "index.html";

/// Maps a request path onto a file under `root`.
///
/// The path is percent-decoded and split on `/`. `..` segments and anything
/// that is not a plain name fail with `PermissionDenied`, as does a resolved
/// file (symlinks followed) that lands outside `root`. A missing file fails
/// with `NotFound`.
pub(crate) async fn resolve(root: &Path, requested: &str) -> io::Result<PathBuf> {
    let decoded = urlencoding::decode(requested).map_err(|_| denied("path is not valid UTF-8"))?;

    let mut relative = PathBuf::new();
    for segment in decoded.split('/') {
        let mut parts = Path::new(segment).components();
        match (parts.next(), parts.next()) {
            (None, _) | (Some(Component::CurDir), None) => {}
            (Some(Component::Normal(part)), None) => relative.push(part),
            _ => return Err(denied("path leaves the root")),
        }
    }

    let root = tokio::fs::canonicalize(root).await?;
    let mut path = tokio::fs::canonicalize(root.join(&relative)).await?;
    if tokio::fs::metadata(&path).await?.is_dir() {
        path = tokio::fs::canonicalize(path.join(INDEX_FILE)).await?;
    }
    if !path.starts_with(&root) {
        return Err(denied("path leaves the root"));
    }
    Ok(path)
}

fn denied(reason: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::PermissionDenied, reason)
}

/// Reads `path` into a finished response. `headers` go out with it; a
/// content type is guessed from the extension unless one is already set.
pub(crate) async fn file_response(path: &Path, status: StatusCode, mut headers: HeaderMap) -> io::Result<WireResponse> {
    let data = tokio::fs::read(path).await?;
    if !headers.contains_key(header::CONTENT_TYPE) {
        let mime = mime_guess::from_path(path).first_or_octet_stream();
        if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
            headers.insert(header::CONTENT_TYPE, value);
        }
    }

    let mut response = WireResponse::new(Full::new(Bytes::from(data)));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

/// The error outcome for a file that could not be served. `shown` is the
/// path as the client should see it.
pub(crate) fn failure(ctx: &Context, shown: &str, e: &io::Error) -> Outcome {
    match e.kind() {
        io::ErrorKind::NotFound => ctx.wrap_not_found(format_args!("file not found: {shown}")),
        io::ErrorKind::PermissionDenied => {
            warn!(path = shown, peer = %ctx.remote_addr(), "refusing file outside the served root");
            ctx.wrap_forbidden(format_args!("access denied: {shown}"))
        }
        _ => ctx.wrap_internal(format_args!("while serving static file, err={e}")),
    }
}

/// A handler serving the `file` path parameter from `root`.
pub(crate) fn serve_dir<C: Injector>(root: PathBuf) -> impl Handler<C> {
    let root = Arc::new(root);
    move |c: C| {
        let root = Arc::clone(&root);
        async move {
            let ctx = c.context();
            let requested = ctx.path_param("file").unwrap_or_default();
            match resolve(&root, requested).await {
                Ok(path) => ctx.serve_file(&path, StatusCode::OK).await,
                Err(e) => failure(ctx, requested, &e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("css")).unwrap();
        std::fs::write(dir.path().join("css/site.css"), "body{}").unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>home</h1>").unwrap();
        dir
    }

    #[tokio::test]
    async fn resolves_nested_files_and_directory_indexes() {
        let dir = site();
        let root = std::fs::canonicalize(dir.path()).unwrap();

        assert_eq!(resolve(dir.path(), "css/site.css").await.unwrap(), root.join("css/site.css"));
        assert_eq!(resolve(dir.path(), "./css//site%2Ecss").await.unwrap(), root.join("css/site.css"));
        assert_eq!(resolve(dir.path(), "").await.unwrap(), root.join("index.html"));
    }

    #[tokio::test]
    async fn parent_segments_are_denied() {
        let dir = site();
        for requested in ["../secret", "css/../../secret", "%2E%2E/secret", "css/..%2F..%2Fsecret"] {
            let err = resolve(&dir.path().join("css"), requested).await.unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::PermissionDenied, "{requested}");
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinks_out_of_the_root_are_denied() {
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "hidden").unwrap();
        let dir = site();
        std::os::unix::fs::symlink(outside.path().join("secret.txt"), dir.path().join("link.txt")).unwrap();

        let err = resolve(dir.path(), "link.txt").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn missing_files_are_not_found() {
        let dir = site();
        let err = resolve(dir.path(), "nope.js").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn content_type_is_guessed_unless_set() {
        let dir = site();
        let path = dir.path().join("css/site.css");

        let response = file_response(&path, StatusCode::OK, HeaderMap::new()).await.unwrap();
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/css");

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        let response = file_response(&path, StatusCode::ACCEPTED, headers).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
    }
}
