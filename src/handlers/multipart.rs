//! Multipart-upload S3 API handlers.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::errors::S3Error;
use crate::handlers::{body_stream, declared_length, extract_attributes, xml_response};
use crate::metrics;
use crate::uploads::CompletedPart;
use crate::xml;
use crate::AppState;

fn upload_id(query: &HashMap<String, String>) -> Result<&str, S3Error> {
    query
        .get("uploadId")
        .map(String::as_str)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| S3Error::InvalidArgument {
            message: "uploadId must not be empty".into(),
        })
}

/// `POST /{bucket}/{key}?uploads`: CreateMultipartUpload.
pub async fn create_multipart_upload(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    headers: &HeaderMap,
) -> Result<Response, S3Error> {
    let upload = state
        .uploads
        .initiate(bucket, key, extract_attributes(headers))
        .await;
    metrics::record_operation("CreateMultipartUpload", upload.is_ok());
    let upload = upload?;
    metrics::set_open_uploads(state.uploads.len());
    Ok(xml_response(
        StatusCode::OK,
        xml::render_initiate_upload(bucket, key, &upload.id),
    ))
}

/// `PUT /{bucket}/{key}?partNumber=N&uploadId=ID`: UploadPart.
pub async fn upload_part(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    query: &HashMap<String, String>,
    headers: &HeaderMap,
    body: Body,
) -> Result<Response, S3Error> {
    let upload_id = upload_id(query)?;
    let raw_number = query.get("partNumber").map(String::as_str).unwrap_or("");
    let part_number: u32 = raw_number.parse().map_err(|_| S3Error::InvalidArgument {
        message: format!("invalid partNumber: {raw_number}"),
    })?;
    let length = declared_length(headers, state.config.server.max_object_size)?;
    let stream = body_stream(headers, body, length);

    let part = state
        .uploads
        .upload_part(bucket, key, upload_id, part_number, stream)
        .await;
    metrics::record_operation("UploadPart", part.is_ok());
    let part = part?;

    let mut response = StatusCode::OK.into_response();
    if let Ok(etag) = HeaderValue::from_str(&part.etag) {
        response.headers_mut().insert("etag", etag);
    }
    Ok(response)
}

/// `POST /{bucket}/{key}?uploadId=ID`: CompleteMultipartUpload.
pub async fn complete_multipart_upload(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    query: &HashMap<String, String>,
    body: &[u8],
) -> Result<Response, S3Error> {
    let upload_id = upload_id(query)?;
    let parts = parse_complete_xml(body)?;
    let record = state.uploads.complete(bucket, key, upload_id, &parts).await;
    metrics::record_operation("CompleteMultipartUpload", record.is_ok());
    let record = record?;
    metrics::set_open_uploads(state.uploads.len());

    let location = format!("/{bucket}/{key}");
    Ok(xml_response(
        StatusCode::OK,
        xml::render_complete_upload(&location, bucket, key, &record.etag),
    ))
}

/// `DELETE /{bucket}/{key}?uploadId=ID`: AbortMultipartUpload.
pub async fn abort_multipart_upload(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    query: &HashMap<String, String>,
) -> Result<Response, S3Error> {
    let upload_id = upload_id(query)?;
    let result = state.uploads.abort(bucket, key, upload_id).await;
    metrics::record_operation("AbortMultipartUpload", result.is_ok());
    result?;
    metrics::set_open_uploads(state.uploads.len());
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// `GET /{bucket}/{key}?uploadId=ID`: ListParts.
pub async fn list_parts(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    query: &HashMap<String, String>,
) -> Result<Response, S3Error> {
    let upload = state.uploads.get(bucket, key, upload_id(query)?)?;
    let parts = upload.parts();
    Ok(xml_response(
        StatusCode::OK,
        xml::render_list_parts(bucket, &upload, &parts),
    ))
}

/// `GET /{bucket}?uploads`: ListMultipartUploads.
pub async fn list_multipart_uploads(
    state: Arc<AppState>,
    bucket: &str,
    query: &HashMap<String, String>,
) -> Result<Response, S3Error> {
    let prefix = query.get("prefix").map(String::as_str).unwrap_or("");
    let uploads = state.uploads.list_uploads(bucket, prefix)?;
    Ok(xml_response(
        StatusCode::OK,
        xml::render_list_uploads(bucket, prefix, &uploads),
    ))
}

/// Parse a `<CompleteMultipartUpload>` body into its part list, in
/// document order.
fn parse_complete_xml(body: &[u8]) -> Result<Vec<CompletedPart>, S3Error> {
    let mut reader = Reader::from_reader(body);
    reader.trim_text(true);

    let mut parts = Vec::new();
    let mut part_number: Option<u32> = None;
    let mut etag: Option<String> = None;
    let mut current = Vec::new();
    let mut in_part = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                current = e.local_name().as_ref().to_vec();
                if current == b"Part" {
                    in_part = true;
                    part_number = None;
                    etag = None;
                }
            }
            Ok(Event::Text(e)) if in_part => {
                let text = e.unescape().map_err(|_| S3Error::MalformedXML)?;
                match current.as_slice() {
                    b"PartNumber" => part_number = text.trim().parse().ok(),
                    b"ETag" => etag = Some(text.trim().to_string()),
                    _ => {}
                }
            }
            Ok(Event::End(e)) => {
                if e.local_name().as_ref() == b"Part" {
                    in_part = false;
                    match (part_number.take(), etag.take()) {
                        (Some(part_number), Some(etag)) => parts.push(CompletedPart { part_number, etag }),
                        _ => return Err(S3Error::MalformedXML),
                    }
                }
                current.clear();
            }
            Ok(Event::Eof) => break,
            Err(_) => return Err(S3Error::MalformedXML),
            _ => {}
        }
        buf.clear();
    }

    if parts.is_empty() {
        return Err(S3Error::MalformedXML);
    }
    Ok(parts)
}
