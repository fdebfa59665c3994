//! Bucket-level S3 API handlers.

use std::collections::HashMap;
use std::sync::Arc;

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::errors::S3Error;
use crate::handlers::xml_response;
use crate::listing::{decode_token, encode_token, ListQuery};
use crate::metrics;
use crate::xml::{self, ListingHeader};
use crate::AppState;

/// `GET /`: ListBuckets.
pub async fn list_buckets(state: Arc<AppState>) -> Result<Response, S3Error> {
    let buckets = state.registry.list();
    Ok(xml_response(StatusCode::OK, xml::render_list_buckets(&buckets)))
}

/// `PUT /{bucket}`: CreateBucket.
///
/// Re-creating a bucket that already exists succeeds in `us-east-1` and
/// is `BucketAlreadyOwnedByYou` elsewhere.
pub async fn create_bucket(state: Arc<AppState>, bucket: &str) -> Result<Response, S3Error> {
    match state.registry.create_bucket(bucket).await {
        Ok(_) => metrics::set_bucket_count(state.registry.len()),
        Err(S3Error::AlreadyExists { .. }) if state.config.server.region == "us-east-1" => {}
        Err(err) => return Err(err),
    }
    let mut response = StatusCode::OK.into_response();
    if let Ok(location) = HeaderValue::from_str(&format!("/{bucket}")) {
        response.headers_mut().insert("location", location);
    }
    Ok(response)
}

/// `DELETE /{bucket}`: DeleteBucket. Fails with `BucketNotEmpty` while the
/// bucket holds objects, writes in flight or open multipart uploads.
pub async fn delete_bucket(state: Arc<AppState>, bucket: &str) -> Result<Response, S3Error> {
    state.registry.delete_bucket(bucket).await?;
    metrics::set_bucket_count(state.registry.len());
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// `HEAD /{bucket}`: HeadBucket.
pub async fn head_bucket(state: Arc<AppState>, bucket: &str) -> Result<Response, S3Error> {
    state.registry.get(bucket)?;
    let mut response = StatusCode::OK.into_response();
    if let Ok(region) = HeaderValue::from_str(&state.config.server.region) {
        response.headers_mut().insert("x-amz-bucket-region", region);
    }
    Ok(response)
}

/// Parse `max-keys`, rejecting non-numeric values and clamping to 1000.
fn parse_max_keys(query: &HashMap<String, String>) -> Result<usize, S3Error> {
    let requested = match query.get("max-keys") {
        None => None,
        Some(raw) => Some(raw.parse::<usize>().map_err(|_| S3Error::InvalidArgument {
            message: format!("max-keys must be a non-negative integer, got {raw}"),
        })?),
    };
    Ok(ListQuery::clamp_max_keys(requested))
}

fn param<'a>(query: &'a HashMap<String, String>, name: &str) -> &'a str {
    query.get(name).map(String::as_str).unwrap_or("")
}

/// `GET /{bucket}?list-type=2`: ListObjectsV2.
///
/// A continuation token takes precedence over `start-after`.
pub async fn list_objects_v2(
    state: Arc<AppState>,
    bucket: &str,
    query: &HashMap<String, String>,
) -> Result<Response, S3Error> {
    let continuation = query.get("continuation-token").map(String::as_str);
    let start_after = query.get("start-after").map(String::as_str);
    let after = match continuation {
        Some(token) => Some(decode_token(token)?),
        None => start_after.filter(|s| !s.is_empty()).map(str::to_string),
    };
    let list_query = ListQuery {
        prefix: param(query, "prefix").to_string(),
        delimiter: param(query, "delimiter").to_string(),
        after,
        max_keys: parse_max_keys(query)?,
    };
    let page = state.store.list_objects(bucket, &list_query)?;
    let next_token = page.next_cursor.as_deref().map(encode_token);

    let head = ListingHeader {
        bucket,
        prefix: &list_query.prefix,
        delimiter: &list_query.delimiter,
        max_keys: list_query.max_keys,
    };
    let body = xml::render_list_objects_v2(
        &head,
        &page,
        continuation,
        next_token.as_deref(),
        start_after,
    );
    Ok(xml_response(StatusCode::OK, body))
}

/// `GET /{bucket}`: ListObjects (v1), paginated by `marker`.
pub async fn list_objects_v1(
    state: Arc<AppState>,
    bucket: &str,
    query: &HashMap<String, String>,
) -> Result<Response, S3Error> {
    let marker = param(query, "marker");
    let list_query = ListQuery {
        prefix: param(query, "prefix").to_string(),
        delimiter: param(query, "delimiter").to_string(),
        after: Some(marker.to_string()).filter(|m| !m.is_empty()),
        max_keys: parse_max_keys(query)?,
    };
    let page = state.store.list_objects(bucket, &list_query)?;

    let head = ListingHeader {
        bucket,
        prefix: &list_query.prefix,
        delimiter: &list_query.delimiter,
        max_keys: list_query.max_keys,
    };
    Ok(xml_response(
        StatusCode::OK,
        xml::render_list_objects_v1(&head, &page, marker),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::body::to_bytes;

    fn state_in(region: &str) -> Arc<AppState> {
        let mut config = Config::default();
        config.server.region = region.to_string();
        Arc::new(AppState::in_memory(config))
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    /// Collects the message of every event logged while installed.
    #[derive(Clone, Default)]
    struct Messages(Arc<parking_lot::Mutex<Vec<String>>>);

    struct MessageVisitor<'a>(&'a mut String);

    impl tracing::field::Visit for MessageVisitor<'_> {
        fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
            if field.name() == "message" {
                *self.0 = format!("{value:?}");
            }
        }
    }

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for Messages {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            let mut message = String::new();
            event.record(&mut MessageVisitor(&mut message));
            self.0.lock().push(message);
        }
    }

    #[tokio::test]
    async fn test_bucket_lifecycle_logged_once() {
        use tracing_subscriber::layer::SubscriberExt;

        let messages = Messages::default();
        let subscriber = tracing_subscriber::registry().with(messages.clone());
        let _guard = tracing::subscriber::set_default(subscriber);

        let state = state_in("us-east-1");
        create_bucket(state.clone(), "photos").await.unwrap();
        delete_bucket(state, "photos").await.unwrap();

        let logged = messages.0.lock().clone();
        let count = |text: &str| logged.iter().filter(|m| m.as_str() == text).count();
        assert_eq!(count("bucket created"), 1);
        assert_eq!(count("bucket deleted"), 1);
    }

    #[tokio::test]
    async fn test_create_twice_in_us_east_1_is_ok() {
        let state = state_in("us-east-1");
        let first = create_bucket(state.clone(), "photos").await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.headers()["location"], "/photos");
        let second = create_bucket(state.clone(), "photos").await.unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(state.registry.len(), 1);
    }

    #[tokio::test]
    async fn test_create_twice_elsewhere_conflicts() {
        let state = state_in("eu-west-1");
        create_bucket(state.clone(), "photos").await.unwrap();
        let err = create_bucket(state, "photos").await.err().unwrap();
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert_eq!(err.code(), "BucketAlreadyOwnedByYou");
    }

    #[tokio::test]
    async fn test_head_and_delete() {
        let state = state_in("us-east-1");
        assert!(matches!(
            head_bucket(state.clone(), "nope").await,
            Err(S3Error::NoSuchBucket { .. })
        ));
        create_bucket(state.clone(), "photos").await.unwrap();
        let head = head_bucket(state.clone(), "photos").await.unwrap();
        assert_eq!(head.headers()["x-amz-bucket-region"], "us-east-1");
        let deleted = delete_bucket(state.clone(), "photos").await.unwrap();
        assert_eq!(deleted.status(), StatusCode::NO_CONTENT);
        assert!(!state.registry.exists("photos"));
    }

    #[tokio::test]
    async fn test_list_buckets_xml() {
        let state = state_in("us-east-1");
        create_bucket(state.clone(), "beta").await.unwrap();
        create_bucket(state.clone(), "alpha").await.unwrap();
        let xml = body_text(list_buckets(state).await.unwrap()).await;
        let alpha = xml.find("<Name>alpha</Name>").unwrap();
        let beta = xml.find("<Name>beta</Name>").unwrap();
        assert!(alpha < beta);
    }

    #[tokio::test]
    async fn test_bad_max_keys_and_token() {
        let state = state_in("us-east-1");
        create_bucket(state.clone(), "photos").await.unwrap();
        let mut query = HashMap::new();
        query.insert("max-keys".to_string(), "lots".to_string());
        assert!(matches!(
            list_objects_v2(state.clone(), "photos", &query).await,
            Err(S3Error::InvalidArgument { .. })
        ));

        let mut query = HashMap::new();
        query.insert("continuation-token".to_string(), "garbage!".to_string());
        assert!(matches!(
            list_objects_v2(state, "photos", &query).await,
            Err(S3Error::InvalidToken { .. })
        ));
    }
}
