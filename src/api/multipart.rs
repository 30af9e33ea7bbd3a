//! multipart/form-data uploads, parsed with `multer` over an already-read body.

use anyhow::{anyhow, Result};
use futures::executor::block_on;
use multer::Multipart;
use std::convert::Infallible;

const DEFAULT_PART_CONTENT_TYPE: &str = "application/octet-stream";

/// One decoded form part.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FormPart {
    pub name: Option<String>,
    pub filename: Option<String>,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// Boundary of a `multipart/form-data` Content-Type header.
pub fn boundary_from_content_type(content_type: &str) -> Result<String> {
    multer::parse_boundary(content_type)
        .map_err(|e| anyhow!("invalid multipart content type '{}': {}", content_type.trim(), e))
}

/// Read every part of a complete multipart body.
///
/// The server has already buffered the body, so the stream handed to
/// `multer` yields it as a single chunk and the future never parks.
pub fn parse_form(body: Vec<u8>, boundary: &str) -> Result<Vec<FormPart>> {
    let stream = futures::stream::once(async move { Ok::<_, Infallible>(body) });
    let mut multipart = Multipart::new(stream, boundary);

    block_on(async move {
        let mut parts = Vec::new();
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| anyhow!("malformed multipart body: {}", e))?
        {
            let name = field.name().map(str::to_string);
            let filename = field.file_name().map(str::to_string);
            let content_type = field
                .content_type()
                .map(|mime| mime.to_string())
                .unwrap_or_else(|| DEFAULT_PART_CONTENT_TYPE.to_string());
            let data = field
                .bytes()
                .await
                .map_err(|e| anyhow!("malformed multipart field: {}", e))?;
            parts.push(FormPart {
                name,
                filename,
                content_type,
                data: data.to_vec(),
            });
        }
        Ok(parts)
    })
}

/// The uploaded file: the part named `file`, else the first part with a filename.
pub fn select_upload(parts: Vec<FormPart>) -> Option<FormPart> {
    let named = parts
        .iter()
        .position(|p| p.name.as_deref() == Some("file"));
    let index = named.or_else(|| parts.iter().position(|p| p.filename.is_some()))?;
    parts.into_iter().nth(index)
}
