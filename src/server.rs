//! Axum router construction and S3 route mapping.
//!
//! S3 distinguishes operations by query parameters, not just path and
//! method: `GET /:bucket` is ListObjectsV2 with `?list-type=2`,
//! ListMultipartUploads with `?uploads`, and ListObjects (v1) otherwise.
//! Each method+path therefore gets one handler that dispatches on the
//! parsed query.

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Path, RawQuery, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, HttpMakeClassifier, TraceLayer};
use tracing::{debug, Level};

use crate::auth;
use crate::errors::{generate_request_id, S3Error};
use crate::handlers::{bucket, multipart, object, without_body};
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::presign::{PresignOperation, PresignedGrant};
use crate::AppState;

/// Build the axum [`Router`] with all S3-compatible routes.
pub fn app(state: Arc<AppState>) -> Router {
    let mut router = Router::new();
    if state.config.observability.health_check {
        router = router.route("/health", get(health_check));
    }
    if state.config.observability.metrics {
        router = router.route("/metrics", get(metrics_handler));
    }

    let router = router
        .route("/", get(handle_get_service))
        .route(
            "/:bucket",
            get(handle_get_bucket)
                .put(handle_put_bucket)
                .delete(handle_delete_bucket)
                .head(handle_head_bucket)
                .post(handle_post_bucket),
        )
        .route(
            "/:bucket/*key",
            get(handle_get_object)
                .put(handle_put_object)
                .delete(handle_delete_object)
                .head(handle_head_object)
                .post(handle_post_object),
        )
        .with_state(state.clone())
        // Innermost first: auth runs after the presign check has had a
        // chance to mark the request as already authorized.
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(middleware::from_fn_with_state(state.clone(), presign_middleware))
        .layer(middleware::from_fn_with_state(state.clone(), read_only_middleware))
        .layer(middleware::from_fn(common_headers_middleware))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(trace_layer(state.config.server.verbose));

    let router = if state.config.server.cors {
        router.layer(cors_layer())
    } else {
        router
    };

    // Objects can be far larger than axum's 2 MB default.
    router.layer(DefaultBodyLimit::disable())
}

fn trace_layer(verbose: bool) -> TraceLayer<HttpMakeClassifier> {
    let level = if verbose { Level::INFO } else { Level::DEBUG };
    TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(level))
        .on_response(DefaultOnResponse::new().level(level))
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::PUT,
            Method::POST,
            Method::DELETE,
            Method::HEAD,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::CONTENT_LENGTH,
            HeaderName::from_static("x-amz-date"),
            HeaderName::from_static("x-amz-content-sha256"),
        ])
        .expose_headers([header::ETAG, header::LAST_MODIFIED])
}

// -- Middleware --------------------------------------------------------------

/// Adds `x-amz-request-id`, `Date` and `Server` to every response.
async fn common_headers_middleware(req: Request<Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    // Error responses already carry the id they rendered into the body.
    if !headers.contains_key("x-amz-request-id") {
        if let Ok(id) = HeaderValue::from_str(&generate_request_id()) {
            headers.insert("x-amz-request-id", id);
        }
    }
    let date = httpdate::fmt_http_date(std::time::SystemTime::now());
    if let Ok(date) = HeaderValue::from_str(&date) {
        headers.insert("date", date);
    }
    headers.insert("server", HeaderValue::from_static("S3Dir"));
    response
}

/// Rejects mutating requests when the server is read-only.
async fn read_only_middleware(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, S3Error> {
    if state.config.server.read_only
        && matches!(*req.method(), Method::PUT | Method::POST | Method::DELETE)
    {
        return Err(S3Error::AccessDenied {
            message: "The server is in read-only mode".into(),
        });
    }
    Ok(next.run(req).await)
}

/// Marks a request authorized by a presigned grant.
#[derive(Debug, Clone, Copy)]
struct PresignedAccess;

/// Query parameters that select an operation a grant never covers.
const NON_PRESIGNABLE: &[&str] = &["presign", "uploads", "uploadId", "partNumber", "delete"];

/// Checks presigned grants. A valid grant lets the request skip SigV4;
/// a present but invalid one fails the request.
async fn presign_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, S3Error> {
    let query = parse_query(req.uri().query().map(str::to_string));
    let Some(grant) = PresignedGrant::from_query(&query) else {
        return Ok(next.run(req).await);
    };
    let grant = grant?;
    if NON_PRESIGNABLE.iter().any(|p| query.contains_key(*p)) {
        return Err(S3Error::AccessDenied {
            message: "Presigned URLs only cover plain object reads and writes".into(),
        });
    }

    let (bucket, key) = split_target(req.uri().path());
    let operation = PresignOperation::for_method(req.method());
    state
        .signer
        .verify(&grant, &bucket, &key, operation, Utc::now().timestamp())?;
    debug!(bucket = %bucket, key = %key, operation = %grant.operation, "presigned grant accepted");

    req.extensions_mut().insert(PresignedAccess);
    Ok(next.run(req).await)
}

/// Split a raw request path into percent-decoded bucket and key.
fn split_target(path: &str) -> (String, String) {
    let decode = |s: &str| {
        percent_encoding::percent_decode_str(s)
            .decode_utf8_lossy()
            .into_owned()
    };
    let trimmed = path.trim_start_matches('/');
    match trimmed.split_once('/') {
        Some((bucket, key)) => (decode(bucket), decode(key)),
        None => (decode(trimmed), String::new()),
    }
}

/// Paths that bypass authentication.
const AUTH_SKIP_PATHS: &[&str] = &["/health", "/metrics"];

/// SigV4 authentication, when credentials are configured.
async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, S3Error> {
    let Some(credentials) = state.credentials.as_ref() else {
        return Ok(next.run(req).await);
    };
    if req.extensions().get::<PresignedAccess>().is_some()
        || AUTH_SKIP_PATHS.contains(&req.uri().path())
    {
        return Ok(next.run(req).await);
    }

    auth::verify_request(
        credentials,
        req.method().as_str(),
        req.uri().path(),
        req.uri().query().unwrap_or(""),
        req.headers(),
        Utc::now(),
    )
    .inspect_err(|err| debug!(code = err.code(), "request authentication failed"))?;
    Ok(next.run(req).await)
}

// -- Health check ------------------------------------------------------------

/// `GET /health`: returns `{"status":"ok"}`.
async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        r#"{"status":"ok"}"#,
    )
}

// -- Query parameter parsing helper ------------------------------------------

/// Parse a raw query string into percent-decoded pairs. Flags without a
/// value (`?uploads`, `?delete`) map to the empty string.
fn parse_query(raw: Option<String>) -> HashMap<String, String> {
    let decode = |s: &str| {
        percent_encoding::percent_decode_str(s)
            .decode_utf8_lossy()
            .into_owned()
    };
    let mut map = HashMap::new();
    for part in raw.as_deref().unwrap_or("").split('&') {
        match part.split_once('=') {
            Some((k, v)) => {
                map.insert(decode(k), decode(v));
            }
            None if !part.is_empty() => {
                map.insert(decode(part), String::new());
            }
            None => {}
        }
    }
    map
}

// -- Service-level dispatch --------------------------------------------------

/// `GET /`: ListBuckets.
async fn handle_get_service(State(state): State<Arc<AppState>>) -> Result<Response, S3Error> {
    bucket::list_buckets(state).await
}

// -- Bucket-level dispatch ---------------------------------------------------

/// `GET /:bucket`:
/// - `?uploads` -> ListMultipartUploads
/// - `?list-type=2` -> ListObjectsV2
/// - default -> ListObjects (v1)
async fn handle_get_bucket(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    RawQuery(raw_query): RawQuery,
) -> Result<Response, S3Error> {
    let query = parse_query(raw_query);
    if query.contains_key("uploads") {
        multipart::list_multipart_uploads(state, &name, &query).await
    } else if query.get("list-type").is_some_and(|v| v == "2") {
        bucket::list_objects_v2(state, &name, &query).await
    } else {
        bucket::list_objects_v1(state, &name, &query).await
    }
}

/// `PUT /:bucket`: CreateBucket.
async fn handle_put_bucket(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Response, S3Error> {
    bucket::create_bucket(state, &name).await
}

/// `DELETE /:bucket`: DeleteBucket.
async fn handle_delete_bucket(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Response, S3Error> {
    bucket::delete_bucket(state, &name).await
}

/// `HEAD /:bucket`: HeadBucket.
async fn handle_head_bucket(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    bucket::head_bucket(state, &name)
        .await
        .unwrap_or_else(without_body)
}

/// `POST /:bucket?delete`: DeleteObjects.
async fn handle_post_bucket(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    RawQuery(raw_query): RawQuery,
    body: Body,
) -> Result<Response, S3Error> {
    let query = parse_query(raw_query);
    if query.contains_key("delete") {
        let body = object::read_small_body(body).await?;
        object::delete_objects(state, &name, &body).await
    } else {
        Err(S3Error::NotImplemented)
    }
}

// -- Object-level dispatch ---------------------------------------------------

/// `GET /:bucket/*key`:
/// - `?presign` -> issue a presigned URL
/// - `?uploadId=...` -> ListParts
/// - default -> GetObject
async fn handle_get_object(
    State(state): State<Arc<AppState>>,
    Path((name, key)): Path<(String, String)>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
) -> Result<Response, S3Error> {
    let query = parse_query(raw_query);
    if query.contains_key("presign") {
        object::presign_object(state, &name, &key, &headers, &query).await
    } else if query.contains_key("uploadId") {
        multipart::list_parts(state, &name, &key, &query).await
    } else {
        object::get_object(state, &name, &key, &headers).await
    }
}

/// `PUT /:bucket/*key`:
/// - `?partNumber=...&uploadId=...` -> UploadPart
/// - default -> PutObject
///
/// The body is streamed straight through, never buffered.
async fn handle_put_object(
    State(state): State<Arc<AppState>>,
    Path((name, key)): Path<(String, String)>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, S3Error> {
    let query = parse_query(raw_query);
    if query.contains_key("partNumber") && query.contains_key("uploadId") {
        multipart::upload_part(state, &name, &key, &query, &headers, body).await
    } else {
        object::put_object(state, &name, &key, &headers, body).await
    }
}

/// `DELETE /:bucket/*key`:
/// - `?uploadId=...` -> AbortMultipartUpload
/// - default -> DeleteObject
async fn handle_delete_object(
    State(state): State<Arc<AppState>>,
    Path((name, key)): Path<(String, String)>,
    RawQuery(raw_query): RawQuery,
) -> Result<Response, S3Error> {
    let query = parse_query(raw_query);
    if query.contains_key("uploadId") {
        multipart::abort_multipart_upload(state, &name, &key, &query).await
    } else {
        object::delete_object(state, &name, &key).await
    }
}

/// `HEAD /:bucket/*key`: HeadObject.
async fn handle_head_object(
    State(state): State<Arc<AppState>>,
    Path((name, key)): Path<(String, String)>,
) -> Response {
    object::head_object(state, &name, &key)
        .await
        .unwrap_or_else(without_body)
}

/// `POST /:bucket/*key`:
/// - `?uploads` -> CreateMultipartUpload
/// - `?uploadId=...` -> CompleteMultipartUpload
async fn handle_post_object(
    State(state): State<Arc<AppState>>,
    Path((name, key)): Path<(String, String)>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, S3Error> {
    let query = parse_query(raw_query);
    if query.contains_key("uploads") {
        multipart::create_multipart_upload(state, &name, &key, &headers).await
    } else if query.contains_key("uploadId") {
        let body = object::read_small_body(body).await?;
        multipart::complete_multipart_upload(state, &name, &key, &query, &body).await
    } else {
        Err(S3Error::NotImplemented)
    }
}
