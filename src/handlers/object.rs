//! Object-level S3 API handlers.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::{TimeZone, Utc};
use futures::StreamExt;
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::errors::S3Error;
use crate::handlers::{body_stream, declared_length, extract_attributes, object_headers, xml_response};
use crate::metrics;
use crate::presign::PresignOperation;
use crate::store::RangeRequest;
use crate::xml::{self, DeleteFailure};
use crate::AppState;

/// Most keys a single DeleteObjects request may name.
const MAX_DELETE_KEYS: usize = 1000;

/// Parse a `Range` header like `bytes=0-4`, `bytes=5-` or `bytes=-3`.
///
/// Returns `None` for anything other than a single bytes range, in which
/// case the header is ignored and the whole object is served.
fn parse_range_header(value: &str) -> Option<RangeRequest> {
    let spec = value.trim().strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }
    match spec.split_once('-')? {
        ("", suffix) => Some(RangeRequest::Suffix(suffix.parse().ok()?)),
        (start, "") => Some(RangeRequest::StartOpen(start.parse().ok()?)),
        (start, end) => {
            let (start, end): (u64, u64) = (start.parse().ok()?, end.parse().ok()?);
            (start <= end).then_some(RangeRequest::StartEnd(start, end))
        }
    }
}

/// `PUT /{bucket}/{key}`: PutObject.
pub async fn put_object(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    headers: &HeaderMap,
    body: Body,
) -> Result<Response, S3Error> {
    let length = declared_length(headers, state.config.server.max_object_size)?;
    let stream = body_stream(headers, body, length);
    let record = state
        .store
        .put_object(bucket, key, stream, extract_attributes(headers))
        .await;
    metrics::record_operation("PutObject", record.is_ok());
    let record = record?;

    let mut response = StatusCode::OK.into_response();
    if let Ok(etag) = HeaderValue::from_str(&record.etag) {
        response.headers_mut().insert("etag", etag);
    }
    Ok(response)
}

/// `GET /{bucket}/{key}`: GetObject, honouring a single `Range`.
///
/// The body streams from the version that was current when the request
/// arrived, even if the key is replaced or deleted meanwhile.
pub async fn get_object(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    headers: &HeaderMap,
) -> Result<Response, S3Error> {
    let range = headers
        .get("range")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_range_header);
    let opened = state.store.get_object(bucket, key, range).await;
    metrics::record_operation("GetObject", opened.is_ok());
    let opened = opened?;

    let len = opened.reader.len;
    let stream = opened.reader.stream.inspect(|chunk| {
        if let Ok(chunk) = chunk {
            metrics::add_bytes_sent(chunk.len() as u64);
        }
    });
    let status = if opened.range.is_some() {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };
    let mut response = (status, Body::from_stream(stream)).into_response();
    let out = response.headers_mut();
    object_headers(&opened.record, out);
    out.insert("content-length", HeaderValue::from(len));
    if let Some((start, end)) = opened.range {
        let content_range = format!("bytes {start}-{end}/{}", opened.record.size);
        if let Ok(value) = HeaderValue::from_str(&content_range) {
            out.insert("content-range", value);
        }
    }
    Ok(response)
}

/// `HEAD /{bucket}/{key}`: HeadObject.
pub async fn head_object(state: Arc<AppState>, bucket: &str, key: &str) -> Result<Response, S3Error> {
    let record = state.store.head_object(bucket, key)?;
    let mut response = StatusCode::OK.into_response();
    let out = response.headers_mut();
    object_headers(&record, out);
    out.insert("content-length", HeaderValue::from(record.size));
    Ok(response)
}

/// `DELETE /{bucket}/{key}`: DeleteObject. Deleting an absent key is a
/// success.
pub async fn delete_object(state: Arc<AppState>, bucket: &str, key: &str) -> Result<Response, S3Error> {
    let result = state.store.delete_object(bucket, key).await;
    metrics::record_operation("DeleteObject", result.is_ok());
    result?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// `POST /{bucket}?delete`: DeleteObjects.
pub async fn delete_objects(state: Arc<AppState>, bucket: &str, body: &[u8]) -> Result<Response, S3Error> {
    let (keys, quiet) = parse_delete_xml(body)?;
    if keys.len() > MAX_DELETE_KEYS {
        return Err(S3Error::MalformedXML);
    }
    let outcomes = state.store.delete_objects(bucket, keys).await?;

    let mut deleted = Vec::new();
    let mut failures = Vec::new();
    for (key, result) in &outcomes {
        match result {
            Ok(()) => deleted.push(key.as_str()),
            Err(err) => failures.push(DeleteFailure {
                key,
                code: err.code(),
                message: err.to_string(),
            }),
        }
    }
    metrics::record_operation("DeleteObjects", failures.is_empty());
    Ok(xml_response(
        StatusCode::OK,
        xml::render_delete_result(&deleted, &failures, quiet),
    ))
}

/// Parse a `<Delete>` body into its keys and the quiet flag.
fn parse_delete_xml(body: &[u8]) -> Result<(Vec<String>, bool), S3Error> {
    let mut reader = Reader::from_reader(body);
    reader.trim_text(true);

    let mut keys = Vec::new();
    let mut quiet = false;
    let mut saw_root = false;
    let mut path: Vec<Vec<u8>> = Vec::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = e.local_name().as_ref().to_vec();
                if path.is_empty() {
                    saw_root = name == b"Delete";
                }
                path.push(name);
            }
            Ok(Event::End(_)) => {
                path.pop();
            }
            Ok(Event::Text(e)) => {
                let text = e.unescape().map_err(|_| S3Error::MalformedXML)?;
                match path.iter().map(Vec::as_slice).collect::<Vec<_>>().as_slice() {
                    [b"Delete", b"Object", b"Key"] => keys.push(text.into_owned()),
                    [b"Delete", b"Quiet"] => quiet = text.trim().eq_ignore_ascii_case("true"),
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => return Err(S3Error::MalformedXML),
            _ => {}
        }
        buf.clear();
    }

    if !saw_root || !path.is_empty() {
        return Err(S3Error::MalformedXML);
    }
    Ok((keys, quiet))
}

/// `GET /{bucket}/{key}?presign[&method=PUT][&expires=N]`: issue a
/// presigned URL for the object.
pub async fn presign_object(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> Result<Response, S3Error> {
    state.registry.get(bucket)?;
    crate::store::validate_key(key)?;

    let operation = match query.get("method") {
        None => PresignOperation::Get,
        Some(method) => PresignOperation::parse(method).ok_or_else(|| S3Error::InvalidArgument {
            message: format!("cannot presign method {method}"),
        })?,
    };
    let expires_in = match query.get("expires") {
        None => state.config.presign.default_expires,
        Some(raw) => raw.parse().map_err(|_| S3Error::InvalidArgument {
            message: format!("expires must be a number of seconds, got {raw}"),
        })?,
    };

    let now = Utc::now().timestamp();
    let grant = state.signer.issue(bucket, key, operation, expires_in, now);
    let host = headers
        .get("host")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}:{}", state.config.server.host, state.config.server.port));
    let url = grant.url(&format!("http://{host}"));
    let expires = Utc
        .timestamp_opt(grant.expires, 0)
        .single()
        .ok_or_else(|| anyhow::anyhow!("presign expiry out of range"))?;

    Ok(xml_response(
        StatusCode::OK,
        xml::render_presigned_url(&url, operation.as_str(), &expires),
    ))
}

/// A request body small enough to buffer (XML documents).
pub(crate) async fn read_small_body(body: Body) -> Result<Bytes, S3Error> {
    const MAX_XML_BODY: usize = 2 * 1024 * 1024;
    axum::body::to_bytes(body, MAX_XML_BODY)
        .await
        .map_err(|_| S3Error::MalformedXML)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range_header() {
        assert_eq!(parse_range_header("bytes=0-4"), Some(RangeRequest::StartEnd(0, 4)));
        assert_eq!(parse_range_header("bytes=5-"), Some(RangeRequest::StartOpen(5)));
        assert_eq!(parse_range_header("bytes=-3"), Some(RangeRequest::Suffix(3)));
        assert_eq!(parse_range_header("bytes=4-2"), None);
        assert_eq!(parse_range_header("bytes=0-1,3-4"), None);
        assert_eq!(parse_range_header("items=0-4"), None);
        assert_eq!(parse_range_header("bytes=x-4"), None);
    }

    #[test]
    fn test_parse_delete_xml() {
        let body = br#"<?xml version="1.0" encoding="UTF-8"?>
            <Delete xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
              <Quiet>true</Quiet>
              <Object><Key>a.txt</Key></Object>
              <Object><Key>dir/b &amp; c.txt</Key><VersionId>ignored</VersionId></Object>
            </Delete>"#;
        let (keys, quiet) = parse_delete_xml(body).unwrap();
        assert_eq!(keys, vec!["a.txt", "dir/b & c.txt"]);
        assert!(quiet);
    }

    #[test]
    fn test_parse_delete_xml_rejects_garbage() {
        assert!(matches!(parse_delete_xml(b"not xml <"), Err(S3Error::MalformedXML)));
        assert!(matches!(
            parse_delete_xml(b"<Other><Object><Key>a</Key></Object></Other>"),
            Err(S3Error::MalformedXML)
        ));
        assert!(matches!(parse_delete_xml(b""), Err(S3Error::MalformedXML)));
    }
}
