//! `multipart/form-data` bodies.
//!
//! The body is already in memory by the time a handler asks for it, so it is
//! fed to [`multer`] as a single chunk and collected field by field.

use std::convert::Infallible;

use bytes::Bytes;

/// An uploaded file part.
#[derive(Clone, Debug)]
pub struct FormFile {
    /// The form field the file was sent under.
    pub field: String,
    pub file_name: String,
    /// The part's own `Content-Type`, when the client sent one.
    pub content_type: Option<String>,
    pub data: Bytes,
}

impl FormFile {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A parsed multipart body: text fields and file parts, in wire order.
#[derive(Clone, Debug, Default)]
pub struct MultipartForm {
    pub fields: Vec<(String, String)>,
    pub files: Vec<FormFile>,
}

impl MultipartForm {
    /// First text field named `name`.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    /// First file part sent under `name`.
    pub fn file(&self, name: &str) -> Option<&FormFile> {
        self.files.iter().find(|f| f.field == name)
    }
}

/// Whether `content_type` announces a multipart form.
pub(crate) fn is_multipart(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .is_some_and(|essence| essence.trim().eq_ignore_ascii_case("multipart/form-data"))
}

/// Parses `body` using the boundary from `content_type`. Parts without a
/// name are skipped.
pub(crate) async fn parse_multipart(content_type: &str, body: Bytes) -> Result<MultipartForm, multer::Error> {
    let boundary = multer::parse_boundary(content_type)?;
    let stream = futures::stream::once(async move { Ok::<_, Infallible>(body) });
    let mut multipart = multer::Multipart::new(stream, boundary);

    let mut form = MultipartForm::default();
    while let Some(field) = multipart.next_field().await? {
        let Some(name) = field.name().map(str::to_owned) else {
            continue;
        };
        match field.file_name().map(str::to_owned) {
            Some(file_name) => {
                let content_type = field.content_type().map(ToString::to_string);
                let data = field.bytes().await?;
                form.files.push(FormFile { field: name, file_name, content_type, data });
            }
            None => {
                let text = field.text().await?;
                form.fields.push((name, text));
            }
        }
    }
    Ok(form)
}
