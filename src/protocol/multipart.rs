//! `multipart/form-data` decoding.
//!
//! The decoder works on a fully buffered body: it scans for `--boundary`
//! delimiters, splits each part at its first blank line into headers and
//! payload, and stops at the closing `--boundary--`.

use bytes::Bytes;
use memchr::memmem;
use thiserror::Error;

use crate::http::Headers;

/// Errors produced while decoding a multipart body.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MultipartError {
    #[error("Content-Type has no multipart boundary")]
    MissingBoundary,

    #[error("multipart body does not start with its boundary")]
    NoDelimiter,

    #[error("multipart part {index} has no header terminator")]
    MissingHeaderEnd { index: usize },

    #[error("multipart body ends without a closing boundary")]
    Unterminated,
}

/// One decoded part of a multipart body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    /// `name` from `Content-Disposition`.
    pub name: Option<String>,
    /// `filename` from `Content-Disposition`, for file uploads.
    pub filename: Option<String>,
    /// The part's own `Content-Type`, if given.
    pub content_type: Option<String>,
    pub headers: Headers,
    pub data: Bytes,
}

/// Extracts the `boundary` parameter from a `multipart/*` Content-Type.
pub fn boundary(content_type: &str) -> Option<&str> {
    let mut params = content_type.split(';');
    let essence = params.next()?.trim();
    if !essence.to_ascii_lowercase().starts_with("multipart/") {
        return None;
    }
    params.find_map(|p| {
        let (key, value) = p.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("boundary") {
            return None;
        }
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value);
        (!value.is_empty()).then_some(value)
    })
}

/// Decodes `body` using the boundary from `content_type`.
///
/// # Examples
///
/// ```
/// use wharf::protocol::multipart::decode;
///
/// let body = "--XyZ\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\n1\r\n--XyZ--\r\n";
/// let parts = decode("multipart/form-data; boundary=XyZ", body.as_bytes().into()).unwrap();
/// assert_eq!(parts[0].name.as_deref(), Some("a"));
/// assert_eq!(&parts[0].data[..], b"1");
/// ```
pub fn decode(content_type: &str, body: Bytes) -> Result<Vec<Part>, MultipartError> {
    let boundary = boundary(content_type).ok_or(MultipartError::MissingBoundary)?;
    let delimiter = format!("--{boundary}");
    let delimiter = delimiter.as_bytes();
    // Every delimiter after the first is preceded by the CRLF that ends the
    // previous part's payload.
    let next_delimiter = [b"\r\n".as_slice(), delimiter].concat();
    let finder = memmem::Finder::new(&next_delimiter);

    let start = memmem::find(&body, delimiter).ok_or(MultipartError::NoDelimiter)?;
    let mut cursor = start + delimiter.len();
    let mut parts = Vec::new();

    loop {
        let rest = &body[cursor..];
        if rest.starts_with(b"--") {
            return Ok(parts);
        }
        // Skip transport padding and the CRLF that follows a delimiter.
        let line_end = memmem::find(rest, b"\r\n").ok_or(MultipartError::Unterminated)?;
        let part_start = cursor + line_end + 2;

        let part_len = finder
            .find(&body[part_start..])
            .ok_or(MultipartError::Unterminated)?;
        let part = body.slice(part_start..part_start + part_len);
        parts.push(parse_part(part, parts.len())?);

        cursor = part_start + part_len + next_delimiter.len();
    }
}

fn parse_part(raw: Bytes, index: usize) -> Result<Part, MultipartError> {
    let (header_block, data) = if raw.starts_with(b"\r\n") {
        (&raw[..0], raw.slice(2..))
    } else {
        let split = memmem::find(&raw, b"\r\n\r\n").ok_or(MultipartError::MissingHeaderEnd { index })?;
        (&raw[..split], raw.slice(split + 4..))
    };

    let mut headers = Headers::new();
    for line in String::from_utf8_lossy(header_block).split("\r\n") {
        if let Some((name, value)) = line.split_once(':') {
            headers.append(name.trim(), value.trim());
        }
    }

    let (name, filename) = headers
        .get("content-disposition")
        .map(disposition_params)
        .unwrap_or_default();
    let content_type = headers.get("content-type").map(str::to_owned);

    Ok(Part {
        name,
        filename,
        content_type,
        headers,
        data,
    })
}

/// Pulls `name` and `filename` out of a `Content-Disposition` value.
fn disposition_params(value: &str) -> (Option<String>, Option<String>) {
    let mut name = None;
    let mut filename = None;
    for param in value.split(';').skip(1) {
        let Some((key, raw)) = param.split_once('=') else {
            continue;
        };
        let raw = raw.trim();
        let value = raw
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(raw)
            .replace("\\\"", "\"");
        match key.trim().to_ascii_lowercase().as_str() {
            "name" => name = Some(value),
            "filename" => filename = Some(value),
            _ => {}
        }
    }
    (name, filename)
}
