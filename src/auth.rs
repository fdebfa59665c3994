//! AWS Signature Version 4 verification.
//!
//! Accepts requests signed with either an `Authorization: AWS4-HMAC-SHA256`
//! header or `X-Amz-*` query parameters, against the single credential
//! pair from the `auth` config section.
//!
//! 1. Build a canonical request
//! 2. Build a string-to-sign
//! 3. Derive a signing key via HMAC chain
//! 4. Compute and compare the signature
//!
//! The payload hash is taken from `x-amz-content-sha256` as sent; bodies are
//! streamed to storage and never buffered for hashing.

use axum::http::HeaderMap;
use chrono::{DateTime, NaiveDateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::percent_decode_str;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use subtle::ConstantTimeEq;

use crate::errors::S3Error;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// Clock skew tolerance for header-based auth (15 minutes).
const CLOCK_SKEW_SECONDS: i64 = 900;

/// Maximum presigned URL expiration (7 days).
const MAX_PRESIGNED_EXPIRES: i64 = 604_800;

const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

/// The one access key / secret key pair the server accepts.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
}

/// Signature parameters, from either the header or the query string.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SignedScope {
    access_key_id: String,
    date_stamp: String,
    region: String,
    service: String,
    signed_headers: String,
    signature: String,
}

impl SignedScope {
    fn credential_scope(&self) -> String {
        format!(
            "{}/{}/{}/aws4_request",
            self.date_stamp, self.region, self.service
        )
    }

    fn from_credential(
        credential: &str,
        signed_headers: String,
        signature: String,
    ) -> Result<Self, S3Error> {
        let parts: Vec<&str> = credential.splitn(5, '/').collect();
        if parts.len() != 5 || parts[4] != "aws4_request" {
            return Err(malformed("invalid Credential"));
        }
        Ok(SignedScope {
            access_key_id: parts[0].to_string(),
            date_stamp: parts[1].to_string(),
            region: parts[2].to_string(),
            service: parts[3].to_string(),
            signed_headers,
            signature,
        })
    }
}

fn malformed(what: &str) -> S3Error {
    S3Error::AccessDenied {
        message: format!("Malformed authorization: {what}"),
    }
}

/// Verify a request against `creds` at time `now`.
///
/// `raw_path` and `raw_query` are the request target exactly as received.
pub fn verify_request(
    creds: &Credentials,
    method: &str,
    raw_path: &str,
    raw_query: &str,
    headers: &HeaderMap,
    now: DateTime<Utc>,
) -> Result<(), S3Error> {
    let header_value = headers.get("authorization").and_then(|v| v.to_str().ok());
    let query = parse_query_string(raw_query);
    let presigned = query.contains_key("X-Amz-Algorithm");

    let (scope, timestamp, payload_hash) = match (header_value, presigned) {
        (Some(_), true) => return Err(malformed("both header and query signature present")),
        (Some(h), false) => {
            let scope = parse_authorization_header(h)?;
            let timestamp = header_str(headers, "x-amz-date")
                .ok_or_else(|| malformed("missing x-amz-date"))?
                .to_string();
            let signed_at = parse_amz_date(&timestamp).ok_or_else(|| malformed("bad x-amz-date"))?;
            if (now - signed_at).num_seconds().abs() > CLOCK_SKEW_SECONDS {
                return Err(S3Error::AccessDenied {
                    message: "The difference between the request time and the server's time is too large".into(),
                });
            }
            let payload = header_str(headers, "x-amz-content-sha256")
                .unwrap_or(UNSIGNED_PAYLOAD)
                .to_string();
            (scope, timestamp, payload)
        }
        (None, true) => {
            let (scope, timestamp, expires) = parse_presigned_params(&query)?;
            let signed_at = parse_amz_date(&timestamp).ok_or_else(|| malformed("bad X-Amz-Date"))?;
            if (now - signed_at).num_seconds() > expires {
                return Err(S3Error::Expired);
            }
            (scope, timestamp, UNSIGNED_PAYLOAD.to_string())
        }
        (None, false) => {
            return Err(S3Error::AccessDenied {
                message: "Access Denied".into(),
            })
        }
    };

    if !constant_time_eq(&scope.access_key_id, &creds.access_key) {
        return Err(S3Error::InvalidAccessKeyId);
    }

    let canonical = build_canonical_request(
        method,
        raw_path,
        raw_query,
        &extract_headers_for_signing(headers),
        &scope.signed_headers,
        &payload_hash,
    );
    let string_to_sign = build_string_to_sign(&timestamp, &scope.credential_scope(), &canonical);
    let key = derive_signing_key(
        &creds.secret_key,
        &scope.date_stamp,
        &scope.region,
        &scope.service,
    );
    let computed = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes()));
    if constant_time_eq(&computed, &scope.signature) {
        Ok(())
    } else {
        Err(S3Error::SignatureMismatch)
    }
}

/// Parse `AWS4-HMAC-SHA256 Credential=..., SignedHeaders=..., Signature=...`.
fn parse_authorization_header(header: &str) -> Result<SignedScope, S3Error> {
    let rest = header
        .trim()
        .strip_prefix(ALGORITHM)
        .ok_or_else(|| malformed("unsupported algorithm"))?;

    let mut credential = None;
    let mut signed_headers = None;
    let mut signature = None;
    for part in rest.split(',') {
        let part = part.trim();
        if let Some(val) = part.strip_prefix("Credential=") {
            credential = Some(val.trim());
        } else if let Some(val) = part.strip_prefix("SignedHeaders=") {
            signed_headers = Some(val.trim().to_string());
        } else if let Some(val) = part.strip_prefix("Signature=") {
            signature = Some(val.trim().to_string());
        }
    }

    SignedScope::from_credential(
        credential.ok_or_else(|| malformed("missing Credential"))?,
        signed_headers.ok_or_else(|| malformed("missing SignedHeaders"))?,
        signature.ok_or_else(|| malformed("missing Signature"))?,
    )
}

fn parse_presigned_params(
    params: &BTreeMap<String, String>,
) -> Result<(SignedScope, String, i64), S3Error> {
    let get = |name: &str| {
        params
            .get(name)
            .map(|v| percent_decode(v))
            .ok_or_else(|| malformed(&format!("missing {name}")))
    };
    if get("X-Amz-Algorithm")? != ALGORITHM {
        return Err(malformed("unsupported algorithm"));
    }
    let amz_date = get("X-Amz-Date")?;
    let expires: i64 = get("X-Amz-Expires")?
        .parse()
        .map_err(|_| malformed("invalid X-Amz-Expires"))?;
    if !(1..=MAX_PRESIGNED_EXPIRES).contains(&expires) {
        return Err(malformed("X-Amz-Expires out of range"));
    }
    let scope = SignedScope::from_credential(
        &get("X-Amz-Credential")?,
        get("X-Amz-SignedHeaders")?,
        get("X-Amz-Signature")?,
    )?;
    if !amz_date.starts_with(&scope.date_stamp) {
        return Err(malformed("credential date does not match X-Amz-Date"));
    }
    Ok((scope, amz_date, expires))
}

/// Build the canonical request string.
///
/// ```text
/// HTTPMethod \n CanonicalURI \n CanonicalQueryString \n
/// CanonicalHeaders \n SignedHeaders \n HashedPayload
/// ```
///
/// S3 uses the raw path without normalization.
pub fn build_canonical_request(
    method: &str,
    uri: &str,
    query_string: &str,
    headers: &[(String, String)],
    signed_headers: &str,
    payload_hash: &str,
) -> String {
    let canonical_uri = if uri.is_empty() { "/" } else { uri };
    let canonical_query = build_canonical_query_string(query_string);

    let mut canonical_headers = String::new();
    for name in signed_headers.split(';') {
        if let Some((_, value)) = headers.iter().find(|(n, _)| n == name) {
            canonical_headers.push_str(name);
            canonical_headers.push(':');
            canonical_headers.push_str(&collapse_whitespace(value));
            canonical_headers.push('\n');
        }
    }

    format!(
        "{method}\n{canonical_uri}\n{canonical_query}\n{canonical_headers}\n{signed_headers}\n{payload_hash}"
    )
}

/// Sorted, re-encoded query string without `X-Amz-Signature`.
///
/// Names and values are decoded before re-encoding so an already-encoded
/// query is not encoded twice.
pub fn build_canonical_query_string(query_string: &str) -> String {
    let mut params: Vec<(String, String)> = query_string
        .split('&')
        .filter(|part| !part.is_empty())
        .map(|part| part.split_once('=').unwrap_or((part, "")))
        .filter(|(k, _)| *k != "X-Amz-Signature")
        .map(|(k, v)| {
            (
                s3_uri_encode(&percent_decode(k), true),
                s3_uri_encode(&percent_decode(v), true),
            )
        })
        .collect();
    params.sort();

    params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

pub fn build_string_to_sign(
    timestamp: &str,
    credential_scope: &str,
    canonical_request: &str,
) -> String {
    let hash = hex::encode(Sha256::digest(canonical_request.as_bytes()));
    format!("{ALGORITHM}\n{timestamp}\n{credential_scope}\n{hash}")
}

/// ```text
/// kDate    = HMAC-SHA256("AWS4" + secret, dateStamp)
/// kRegion  = HMAC-SHA256(kDate, region)
/// kService = HMAC-SHA256(kRegion, service)
/// kSigning = HMAC-SHA256(kService, "aws4_request")
/// ```
pub fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{secret_key}").as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Compare two strings in constant time.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// S3-compatible URI encoding: unreserved characters pass through, all
/// other bytes become uppercase `%XX`. `/` is kept when `encode_slash` is
/// false (paths) and encoded otherwise (query components).
pub fn s3_uri_encode(input: &str, encode_slash: bool) -> String {
    let mut encoded = String::with_capacity(input.len() * 2);
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            b'/' if !encode_slash => encoded.push('/'),
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

/// Split a raw query string into (raw name, raw value) pairs.
pub fn parse_query_string(query: &str) -> BTreeMap<String, String> {
    query
        .split('&')
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (part.to_string(), String::new()),
        })
        .collect()
}

fn percent_decode(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// `YYYYMMDDTHHMMSSZ` to a UTC timestamp.
fn parse_amz_date(date: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(date, "%Y%m%dT%H%M%SZ")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Headers as (lowercase name, value) pairs, repeated names joined by `,`.
fn extract_headers_for_signing(header_map: &HeaderMap) -> Vec<(String, String)> {
    let mut grouped: BTreeMap<String, Vec<&str>> = BTreeMap::new();
    for (name, value) in header_map {
        grouped
            .entry(name.as_str().to_lowercase())
            .or_default()
            .push(value.to_str().unwrap_or(""));
    }
    grouped
        .into_iter()
        .map(|(name, values)| (name, values.join(",")))
        .collect()
}
