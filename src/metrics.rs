//! Prometheus metrics.
//!
//! Installs a global recorder via `metrics-exporter-prometheus`, records
//! HTTP RED metrics from a middleware, and serves `/metrics`.

use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use parking_lot::Mutex;
use std::sync::OnceLock;
use std::time::Instant;

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "s3dir_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "s3dir_http_request_duration_seconds";

/// S3 operations (counter). Labels: operation, status.
pub const S3_OPERATIONS_TOTAL: &str = "s3dir_s3_operations_total";

/// Live buckets (gauge).
pub const BUCKETS_TOTAL: &str = "s3dir_buckets_total";

/// Open multipart uploads (gauge).
pub const UPLOADS_OPEN: &str = "s3dir_multipart_uploads_open";

/// Object body bytes received (counter).
pub const BYTES_RECEIVED_TOTAL: &str = "s3dir_bytes_received_total";

/// Object body bytes sent (counter).
pub const BYTES_SENT_TOTAL: &str = "s3dir_bytes_sent_total";

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static INSTALL: Mutex<()> = parking_lot::const_mutex(());

/// Install the global Prometheus recorder. Idempotent.
pub fn init_metrics() -> anyhow::Result<&'static PrometheusHandle> {
    let _guard = INSTALL.lock();
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle);
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("failed to install Prometheus recorder: {e}"))?;
    describe_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle))
}

fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(S3_OPERATIONS_TOTAL, "S3 operations by type and outcome");
    describe_gauge!(BUCKETS_TOTAL, "Live buckets");
    describe_gauge!(UPLOADS_OPEN, "Open multipart uploads");
    describe_counter!(BYTES_RECEIVED_TOTAL, "Object body bytes received");
    describe_counter!(BYTES_SENT_TOTAL, "Object body bytes sent");
}

/// Count one S3 operation by outcome.
pub fn record_operation(operation: &'static str, ok: bool) {
    let status = if ok { "ok" } else { "error" };
    counter!(S3_OPERATIONS_TOTAL, "operation" => operation, "status" => status).increment(1);
}

pub fn set_bucket_count(n: usize) {
    gauge!(BUCKETS_TOTAL).set(n as f64);
}

pub fn set_open_uploads(n: usize) {
    gauge!(UPLOADS_OPEN).set(n as f64);
}

pub fn add_bytes_received(n: u64) {
    counter!(BYTES_RECEIVED_TOTAL).increment(n);
}

pub fn add_bytes_sent(n: u64) {
    counter!(BYTES_SENT_TOTAL).increment(n);
}

/// Records HTTP RED metrics for every request except `/metrics` itself.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    if req.uri().path() == "/metrics" {
        return next.run(req).await;
    }
    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path, "status" => status)
        .increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

/// Collapse a request path to its route template so bucket and key names
/// never become label values.
fn normalize_path(path: &str) -> &'static str {
    match path.trim_start_matches('/') {
        "" => "/",
        "health" => "/health",
        "metrics" => "/metrics",
        rest if rest.trim_end_matches('/').contains('/') => "/{bucket}/{key}",
        _ => "/{bucket}",
    }
}

/// `GET /metrics`: Prometheus text exposition.
pub async fn metrics_handler() -> Response {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("/health"), "/health");
        assert_eq!(normalize_path("/my-bucket"), "/{bucket}");
        assert_eq!(normalize_path("/my-bucket/"), "/{bucket}");
        assert_eq!(normalize_path("/my-bucket/key"), "/{bucket}/{key}");
        assert_eq!(normalize_path("/b/path/to/object.txt"), "/{bucket}/{key}");
    }

    #[test]
    fn test_init_is_idempotent() {
        let a = init_metrics().unwrap() as *const PrometheusHandle;
        let b = init_metrics().unwrap() as *const PrometheusHandle;
        assert_eq!(a, b);
        record_operation("PutObject", true);
        assert!(init_metrics().unwrap().render().contains(S3_OPERATIONS_TOTAL));
    }
}
