//! S3-compatible error types.
//!
//! Every variant maps to a well-known S3 error code.  The enum
//! implements [`axum::response::IntoResponse`] so handlers can simply
//! return `Err(S3Error::NoSuchBucket { .. })`.  The storage core uses the
//! same enum, so the kind of failure survives all the way to the client.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::xml::render_error;

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

/// S3 error codes expressed as a Rust enum.
#[derive(Debug, Error)]
pub enum S3Error {
    /// The specified bucket does not exist.
    #[error("The specified bucket does not exist")]
    NoSuchBucket { bucket: String },

    /// The specified key does not exist.
    #[error("The specified key does not exist.")]
    NoSuchKey { key: String },

    /// The specified multipart upload does not exist.
    #[error("The specified upload does not exist. The upload ID may be invalid, or the upload may have been aborted or completed.")]
    NoSuchUpload { upload_id: String },

    /// A live bucket with the requested name already exists.
    #[error("Your previous request to create the named bucket succeeded and you already own it.")]
    AlreadyExists { bucket: String },

    /// The bucket still holds objects or has writes in flight.
    #[error("The bucket you tried to delete is not empty")]
    NotEmpty { bucket: String },

    /// A continuation token that this server did not produce.
    #[error("The continuation token provided is incorrect")]
    InvalidToken { token: String },

    /// CompleteMultipartUpload named parts that are not 1..=N in order.
    #[error("The list of parts was not in ascending order or is not contiguous from part 1.")]
    InvalidPartSequence,

    /// CompleteMultipartUpload referenced a part that was never uploaded.
    #[error("Part {part_number} was never uploaded.")]
    IncompleteUpload { part_number: u32 },

    /// A part's ETag does not match the one supplied by the client.
    #[error("{message}")]
    InvalidPart { message: String },

    /// A presigned grant was used after its expiry.
    #[error("Request has expired")]
    Expired,

    /// The request signature does not match.
    #[error("The request signature we calculated does not match the signature you provided.")]
    SignatureMismatch,

    /// A presigned grant was used for a different bucket, key or operation.
    #[error("The presigned URL does not grant access to this resource")]
    ScopeMismatch,

    /// Access denied (read-only mode, missing credentials).
    #[error("{message}")]
    AccessDenied { message: String },

    /// Invalid access key ID.
    #[error("The AWS Access Key Id you provided does not exist in our records.")]
    InvalidAccessKeyId,

    /// An invalid bucket name was provided.
    #[error("The specified bucket is not valid.")]
    InvalidBucketName { name: String },

    /// A request argument is invalid.
    #[error("{message}")]
    InvalidArgument { message: String },

    /// Malformed XML in request body.
    #[error("The XML you provided was not well-formed or did not validate against our published schema.")]
    MalformedXML,

    /// Content-Length header is required but missing.
    #[error("You must provide the Content-Length HTTP header.")]
    MissingContentLength,

    /// The body ended before the declared number of bytes arrived.
    #[error("You did not provide the number of bytes specified by the Content-Length HTTP header.")]
    IncompleteBody,

    /// The entity is too large.
    #[error("Your proposed upload exceeds the maximum allowed object size.")]
    EntityTooLarge,

    /// The object key is too long (> 1024 bytes).
    #[error("Your key is too long")]
    KeyTooLong,

    /// Invalid range request.
    #[error("The requested range is not satisfiable")]
    InvalidRange,

    /// Feature not implemented.
    #[error("A header you provided implies functionality that is not implemented")]
    NotImplemented,

    /// Catch-all for unexpected internal errors.
    #[error("We encountered an internal error, please try again.")]
    InternalError(#[from] anyhow::Error),
}

impl S3Error {
    /// Classify a failure while receiving a request body.
    ///
    /// A body that ended early is the client's fault; anything else is ours.
    pub fn from_transfer(err: anyhow::Error) -> Self {
        let truncated = err
            .chain()
            .filter_map(|cause| cause.downcast_ref::<std::io::Error>())
            .any(|io| io.kind() == std::io::ErrorKind::UnexpectedEof);
        if truncated {
            S3Error::IncompleteBody
        } else {
            S3Error::InternalError(err)
        }
    }

    /// Return the S3 XML error code string.
    pub fn code(&self) -> &'static str {
        match self {
            S3Error::NoSuchBucket { .. } => "NoSuchBucket",
            S3Error::NoSuchKey { .. } => "NoSuchKey",
            S3Error::NoSuchUpload { .. } => "NoSuchUpload",
            S3Error::AlreadyExists { .. } => "BucketAlreadyOwnedByYou",
            S3Error::NotEmpty { .. } => "BucketNotEmpty",
            S3Error::InvalidToken { .. } => "InvalidToken",
            S3Error::InvalidPartSequence => "InvalidPartOrder",
            S3Error::IncompleteUpload { .. } => "InvalidPart",
            S3Error::InvalidPart { .. } => "InvalidPart",
            S3Error::Expired => "ExpiredToken",
            S3Error::SignatureMismatch => "SignatureDoesNotMatch",
            S3Error::ScopeMismatch => "AccessDenied",
            S3Error::AccessDenied { .. } => "AccessDenied",
            S3Error::InvalidAccessKeyId => "InvalidAccessKeyId",
            S3Error::InvalidBucketName { .. } => "InvalidBucketName",
            S3Error::InvalidArgument { .. } => "InvalidArgument",
            S3Error::MalformedXML => "MalformedXML",
            S3Error::MissingContentLength => "MissingContentLength",
            S3Error::IncompleteBody => "IncompleteBody",
            S3Error::EntityTooLarge => "EntityTooLarge",
            S3Error::KeyTooLong => "KeyTooLongError",
            S3Error::InvalidRange => "InvalidRange",
            S3Error::NotImplemented => "NotImplemented",
            S3Error::InternalError(_) => "InternalError",
        }
    }

    /// Return the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            S3Error::NoSuchBucket { .. }
            | S3Error::NoSuchKey { .. }
            | S3Error::NoSuchUpload { .. } => StatusCode::NOT_FOUND,
            S3Error::AlreadyExists { .. } | S3Error::NotEmpty { .. } => StatusCode::CONFLICT,
            S3Error::Expired
            | S3Error::SignatureMismatch
            | S3Error::ScopeMismatch
            | S3Error::AccessDenied { .. }
            | S3Error::InvalidAccessKeyId => StatusCode::FORBIDDEN,
            S3Error::InvalidToken { .. }
            | S3Error::InvalidPartSequence
            | S3Error::IncompleteUpload { .. }
            | S3Error::InvalidPart { .. }
            | S3Error::InvalidBucketName { .. }
            | S3Error::InvalidArgument { .. }
            | S3Error::MalformedXML
            | S3Error::IncompleteBody
            | S3Error::EntityTooLarge
            | S3Error::KeyTooLong => StatusCode::BAD_REQUEST,
            S3Error::MissingContentLength => StatusCode::LENGTH_REQUIRED,
            S3Error::InvalidRange => StatusCode::RANGE_NOT_SATISFIABLE,
            S3Error::NotImplemented => StatusCode::NOT_IMPLEMENTED,
            S3Error::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The resource the error refers to, echoed in `<Resource>`.
    fn resource(&self) -> String {
        match self {
            S3Error::NoSuchBucket { bucket }
            | S3Error::AlreadyExists { bucket }
            | S3Error::NotEmpty { bucket } => format!("/{bucket}"),
            S3Error::InvalidBucketName { name } => format!("/{name}"),
            S3Error::NoSuchKey { key } => key.clone(),
            S3Error::NoSuchUpload { upload_id } => upload_id.clone(),
            _ => String::new(),
        }
    }
}

impl IntoResponse for S3Error {
    fn into_response(self) -> Response {
        let request_id = generate_request_id();
        let status = self.status_code();

        if let S3Error::InternalError(ref err) = self {
            tracing::error!(request_id = %request_id, "internal error: {err:#}");
        }

        let body = render_error(self.code(), &self.to_string(), &self.resource(), &request_id);

        (
            status,
            [
                ("content-type", "application/xml".to_string()),
                ("x-amz-request-id", request_id),
            ],
            body,
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy_codes_are_distinct() {
        let errors = [
            S3Error::NoSuchBucket { bucket: "b".into() },
            S3Error::NoSuchKey { key: "k".into() },
            S3Error::AlreadyExists { bucket: "b".into() },
            S3Error::NotEmpty { bucket: "b".into() },
            S3Error::InvalidToken { token: "t".into() },
            S3Error::InvalidPartSequence,
            S3Error::Expired,
            S3Error::SignatureMismatch,
            S3Error::ScopeMismatch,
            S3Error::InternalError(anyhow::anyhow!("disk full")),
        ];
        let mut codes: Vec<&str> = errors.iter().map(|e| e.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            S3Error::NoSuchKey { key: "k".into() }.status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            S3Error::NotEmpty { bucket: "b".into() }.status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(S3Error::Expired.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            S3Error::MissingContentLength.status_code(),
            StatusCode::LENGTH_REQUIRED
        );
        assert_eq!(
            S3Error::InternalError(anyhow::anyhow!("boom")).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_from_transfer() {
        let cut = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short");
        let err = S3Error::from_transfer(anyhow::Error::new(cut).context("staging body"));
        assert!(matches!(err, S3Error::IncompleteBody));
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);

        let disk = std::io::Error::other("disk full");
        let err = S3Error::from_transfer(disk.into());
        assert!(matches!(err, S3Error::InternalError(_)));
    }

    #[test]
    fn test_error_response_has_xml_body_and_request_id() {
        let resp = S3Error::NoSuchBucket {
            bucket: "missing".into(),
        }
        .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "application/xml"
        );
        let id = resp.headers().get("x-amz-request-id").unwrap();
        assert_eq!(id.len(), 16);
    }

    #[test]
    fn test_request_id_format() {
        let id = generate_request_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }
}
