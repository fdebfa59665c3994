//! Presigned URL capabilities.
//!
//! A presigned grant is a stateless capability: the URL's query string
//! carries the bucket/key scope, the operation, an absolute expiry and an
//! HMAC-SHA256 over all three, keyed with a server-held secret.  Nothing
//! is stored server-side; any holder of the URL may use it until it
//! expires.
//!
//! ```text
//! ?X-S3Dir-Operation=GET
//! &X-S3Dir-Expires=1767225600
//! &X-S3Dir-Scope=<base64url(bucket "/" key)>
//! &X-S3Dir-Signature=<hex hmac>
//! ```

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use std::fmt;

use crate::auth::{constant_time_eq, s3_uri_encode};
use crate::errors::S3Error;

type HmacSha256 = Hmac<Sha256>;

pub const PARAM_OPERATION: &str = "X-S3Dir-Operation";
pub const PARAM_EXPIRES: &str = "X-S3Dir-Expires";
pub const PARAM_SCOPE: &str = "X-S3Dir-Scope";
pub const PARAM_SIGNATURE: &str = "X-S3Dir-Signature";

/// Longest lifetime a grant may be issued with (7 days).
pub const MAX_EXPIRES_SECS: u64 = 7 * 24 * 60 * 60;

const ALGORITHM: &str = "S3DIR-HMAC-SHA256";

/// What a grant allows its holder to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresignOperation {
    /// Read the object (GET or HEAD).
    Get,
    /// Write the object (PUT).
    Put,
}

impl PresignOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresignOperation::Get => "GET",
            PresignOperation::Put => "PUT",
        }
    }

    /// Parse an operation name, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Some(PresignOperation::Get),
            "PUT" => Some(PresignOperation::Put),
            _ => None,
        }
    }

    /// The operation an HTTP method needs, if any grant can cover it.
    pub fn for_method(method: &http::Method) -> Option<Self> {
        match *method {
            http::Method::GET | http::Method::HEAD => Some(PresignOperation::Get),
            http::Method::PUT => Some(PresignOperation::Put),
            _ => None,
        }
    }
}

impl fmt::Display for PresignOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A signed capability for one object and one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresignedGrant {
    pub bucket: String,
    pub key: String,
    pub operation: PresignOperation,
    /// Expiry as unix seconds.
    pub expires: i64,
    /// Hex HMAC-SHA256 over the canonical descriptor.
    pub signature: String,
}

impl PresignedGrant {
    /// The grant's query string (without the leading `?`).
    pub fn query_string(&self) -> String {
        let scope = URL_SAFE_NO_PAD.encode(format!("{}/{}", self.bucket, self.key));
        format!(
            "{PARAM_OPERATION}={}&{PARAM_EXPIRES}={}&{PARAM_SCOPE}={scope}&{PARAM_SIGNATURE}={}",
            self.operation, self.expires, self.signature
        )
    }

    /// Full URL for the grant under `endpoint` (e.g. `http://localhost:8000`).
    pub fn url(&self, endpoint: &str) -> String {
        format!(
            "{}/{}/{}?{}",
            endpoint.trim_end_matches('/'),
            self.bucket,
            s3_uri_encode(&self.key, false),
            self.query_string()
        )
    }

    /// Extract a grant from decoded query parameters.
    ///
    /// Returns `None` when the request carries no grant at all, and
    /// `AccessDenied` when it carries a malformed one.
    pub fn from_query(params: &HashMap<String, String>) -> Option<Result<Self, S3Error>> {
        let signature = params.get(PARAM_SIGNATURE)?;
        Some(Self::parse(params, signature))
    }

    fn parse(params: &HashMap<String, String>, signature: &str) -> Result<Self, S3Error> {
        let malformed = |what: &str| S3Error::AccessDenied {
            message: format!("Malformed presigned URL: {what}"),
        };
        let operation = params
            .get(PARAM_OPERATION)
            .and_then(|op| PresignOperation::parse(op))
            .ok_or_else(|| malformed("bad operation"))?;
        let expires = params
            .get(PARAM_EXPIRES)
            .and_then(|e| e.parse::<i64>().ok())
            .ok_or_else(|| malformed("bad expiry"))?;
        let scope = params
            .get(PARAM_SCOPE)
            .and_then(|s| URL_SAFE_NO_PAD.decode(s).ok())
            .and_then(|raw| String::from_utf8(raw).ok())
            .ok_or_else(|| malformed("bad scope"))?;
        let (bucket, key) = scope
            .split_once('/')
            .ok_or_else(|| malformed("bad scope"))?;
        Ok(PresignedGrant {
            bucket: bucket.to_string(),
            key: key.to_string(),
            operation,
            expires,
            signature: signature.to_string(),
        })
    }
}

/// Issues and verifies presigned grants with one secret.
#[derive(Clone)]
pub struct PresignSigner {
    secret: Vec<u8>,
}

impl PresignSigner {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    /// A signer with a fresh random secret. Grants it issues die with the
    /// process.
    pub fn random() -> Self {
        let secret: [u8; 32] = rand::random();
        Self::new(secret)
    }

    /// Length-prefixed canonical descriptor, so no two distinct
    /// (bucket, key) pairs share a signing input.
    fn canonical(bucket: &str, key: &str, operation: PresignOperation, expires: i64) -> String {
        format!(
            "{ALGORITHM}\n{operation}\n{expires}\n{}:{bucket}\n{}:{key}",
            bucket.len(),
            key.len()
        )
    }

    fn mac(&self, canonical: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC can take key of any size");
        mac.update(canonical.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Sign a grant expiring at the absolute unix time `expires`.
    pub fn sign(
        &self,
        bucket: &str,
        key: &str,
        operation: PresignOperation,
        expires: i64,
    ) -> PresignedGrant {
        let signature = self.mac(&Self::canonical(bucket, key, operation, expires));
        PresignedGrant {
            bucket: bucket.to_string(),
            key: key.to_string(),
            operation,
            expires,
            signature,
        }
    }

    /// Sign a grant valid for `expires_in` seconds from `now`, capped at
    /// [`MAX_EXPIRES_SECS`].
    pub fn issue(
        &self,
        bucket: &str,
        key: &str,
        operation: PresignOperation,
        expires_in: u64,
        now: i64,
    ) -> PresignedGrant {
        let ttl = expires_in.min(MAX_EXPIRES_SECS) as i64;
        self.sign(bucket, key, operation, now.saturating_add(ttl))
    }

    /// Check `grant` authorizes `operation` on `bucket`/`key` at `now`.
    ///
    /// The signature is checked first, then expiry, then scope.
    pub fn verify(
        &self,
        grant: &PresignedGrant,
        bucket: &str,
        key: &str,
        operation: Option<PresignOperation>,
        now: i64,
    ) -> Result<(), S3Error> {
        let expected = self.mac(&Self::canonical(
            &grant.bucket,
            &grant.key,
            grant.operation,
            grant.expires,
        ));
        if !constant_time_eq(&expected, &grant.signature.to_ascii_lowercase()) {
            return Err(S3Error::SignatureMismatch);
        }
        if now > grant.expires {
            return Err(S3Error::Expired);
        }
        if grant.bucket != bucket || grant.key != key || Some(grant.operation) != operation {
            return Err(S3Error::ScopeMismatch);
        }
        Ok(())
    }
}
