//! S3 API handlers and the request plumbing they share.

pub mod bucket;
pub mod multipart;
pub mod object;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use std::io;

use crate::chunked;
use crate::errors::S3Error;
use crate::metadata::store::ObjectRecord;
use crate::metrics;
use crate::storage::backend::ByteStream;
use crate::store::ObjectAttributes;

/// Header prefix for user metadata.
const META_PREFIX: &str = "x-amz-meta-";

/// An XML response with the given status.
pub(crate) fn xml_response(status: StatusCode, body: String) -> Response {
    (status, [("content-type", "application/xml")], body).into_response()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Whether the body uses `aws-chunked` framing.
fn is_aws_chunked(headers: &HeaderMap) -> bool {
    let encoded = header_str(headers, "content-encoding")
        .is_some_and(|v| v.split(',').any(|e| e.trim() == "aws-chunked"));
    let streaming = header_str(headers, "x-amz-content-sha256")
        .is_some_and(|v| v.starts_with("STREAMING-"));
    encoded || streaming
}

/// The payload length the client declared, enforcing `max_size`.
///
/// For `aws-chunked` bodies this is `x-amz-decoded-content-length`.
pub(crate) fn declared_length(headers: &HeaderMap, max_size: u64) -> Result<u64, S3Error> {
    let raw = header_str(headers, "x-amz-decoded-content-length")
        .or_else(|| header_str(headers, "content-length"))
        .ok_or(S3Error::MissingContentLength)?;
    let len: u64 = raw.trim().parse().map_err(|_| S3Error::InvalidArgument {
        message: format!("invalid content length: {raw}"),
    })?;
    if len > max_size {
        return Err(S3Error::EntityTooLarge);
    }
    Ok(len)
}

/// Turn a request body into a payload stream.
///
/// Strips `aws-chunked` framing when present. The stream fails once it
/// yields more than `limit` bytes, and fails with `UnexpectedEof` if it
/// ends short of `limit`, so a truncated upload is never committed.
pub(crate) fn body_stream(headers: &HeaderMap, body: Body, limit: u64) -> ByteStream {
    let raw: ByteStream = Box::pin(body.into_data_stream().map(|chunk| chunk.map_err(io::Error::other)));
    let payload = if is_aws_chunked(headers) {
        chunked::decode(raw)
    } else {
        raw
    };
    Box::pin(futures::stream::try_unfold(
        (payload, 0u64),
        move |(mut payload, received)| async move {
            let Some(chunk) = payload.next().await else {
                if received < limit {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("body ended after {received} of {limit} declared bytes"),
                    ));
                }
                return Ok(None);
            };
            let chunk = chunk?;
            let received = received + chunk.len() as u64;
            if received > limit {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "body exceeds its declared length",
                ));
            }
            metrics::add_bytes_received(chunk.len() as u64);
            Ok(Some((chunk, (payload, received))))
        },
    ))
}

/// Content type and `x-amz-meta-*` headers of a request.
pub(crate) fn extract_attributes(headers: &HeaderMap) -> ObjectAttributes {
    let user_metadata = headers
        .iter()
        .filter_map(|(name, value)| {
            let name = name.as_str().to_ascii_lowercase();
            let field = name.strip_prefix(META_PREFIX)?.to_string();
            Some((field, value.to_str().ok()?.to_string()))
        })
        .collect();
    ObjectAttributes {
        content_type: header_str(headers, "content-type").map(str::to_string),
        user_metadata,
    }
}

/// Headers describing a stored object, as sent on GET and HEAD.
pub(crate) fn object_headers(record: &ObjectRecord, headers: &mut HeaderMap) {
    if let Ok(value) = HeaderValue::from_str(&record.content_type) {
        headers.insert("content-type", value);
    }
    if let Ok(value) = HeaderValue::from_str(&record.etag) {
        headers.insert("etag", value);
    }
    let modified = httpdate::fmt_http_date(record.last_modified.into());
    if let Ok(value) = HeaderValue::from_str(&modified) {
        headers.insert("last-modified", value);
    }
    headers.insert("accept-ranges", HeaderValue::from_static("bytes"));
    for (field, value) in &record.user_metadata {
        let name = HeaderName::from_bytes(format!("{META_PREFIX}{field}").as_bytes());
        if let (Ok(name), Ok(value)) = (name, HeaderValue::from_str(value)) {
            headers.insert(name, value);
        }
    }
}

/// Strip the body from an error response, for HEAD requests.
pub(crate) fn without_body(err: S3Error) -> Response {
    let response = err.into_response();
    let (mut parts, _) = response.into_parts();
    parts.headers.remove("content-type");
    Response::from_parts(parts, Body::empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::backend::collect_stream;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_static(v));
        }
        map
    }

    #[test]
    fn test_declared_length() {
        assert!(matches!(
            declared_length(&HeaderMap::new(), 100),
            Err(S3Error::MissingContentLength)
        ));
        assert_eq!(declared_length(&headers(&[("content-length", "18")]), 100).unwrap(), 18);
        assert!(matches!(
            declared_length(&headers(&[("content-length", "101")]), 100),
            Err(S3Error::EntityTooLarge)
        ));
        let chunked = headers(&[
            ("content-length", "200"),
            ("x-amz-decoded-content-length", "18"),
        ]);
        assert_eq!(declared_length(&chunked, 100).unwrap(), 18);
    }

    #[test]
    fn test_extract_attributes() {
        let attrs = extract_attributes(&headers(&[
            ("content-type", "text/plain"),
            ("x-amz-meta-author", "ada"),
            ("x-amz-date", "ignored"),
        ]));
        assert_eq!(attrs.content_type.as_deref(), Some("text/plain"));
        assert_eq!(attrs.user_metadata.len(), 1);
        assert_eq!(attrs.user_metadata["author"], "ada");
    }

    #[tokio::test]
    async fn test_body_stream_decodes_aws_chunked() {
        let framed = "5;chunk-signature=x\r\nHello\r\n0;chunk-signature=y\r\n\r\n";
        let h = headers(&[("x-amz-content-sha256", "STREAMING-AWS4-HMAC-SHA256-PAYLOAD")]);
        let body = collect_stream(body_stream(&h, Body::from(framed), 5)).await.unwrap();
        assert_eq!(&body[..], b"Hello");
    }

    #[tokio::test]
    async fn test_body_stream_enforces_limit() {
        let err = collect_stream(body_stream(&HeaderMap::new(), Body::from("too long"), 3))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_body_stream_rejects_short_body() {
        let err = collect_stream(body_stream(&HeaderMap::new(), Body::from("Hello"), 100))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        let framed = "5;chunk-signature=x\r\nHello\r\n0;chunk-signature=y\r\n\r\n";
        let h = headers(&[
            ("x-amz-content-sha256", "STREAMING-AWS4-HMAC-SHA256-PAYLOAD"),
            ("x-amz-decoded-content-length", "100"),
        ]);
        let err = collect_stream(body_stream(&h, Body::from(framed), 100))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_body_stream_accepts_empty_body() {
        let body = collect_stream(body_stream(&HeaderMap::new(), Body::empty(), 0))
            .await
            .unwrap();
        assert!(body.is_empty());
    }
}
