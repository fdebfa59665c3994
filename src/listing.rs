//! Prefix/delimiter listing over a key index snapshot.
//!
//! A page is computed entirely from one [`KeyIndex`] snapshot, so it is
//! internally consistent even while writers install new versions.  Pages
//! are chained by a cursor: the last entry (key or common prefix) a page
//! emitted.  The next page resumes strictly after it and never re-emits a
//! common prefix that sorts at or before it, which is what makes the
//! concatenation of all pages duplicate-free.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use std::ops::Bound;
use std::sync::Arc;

use crate::errors::S3Error;
use crate::metadata::index::KeyIndex;
use crate::metadata::store::ObjectRecord;

/// Upper bound (and default) for `max-keys`.
pub const MAX_KEYS: usize = 1000;

/// Leading byte of every continuation token this engine issues.
const TOKEN_VERSION: u8 = 1;

/// Parameters of one listing request.
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    pub prefix: String,
    /// Empty means no grouping.
    pub delimiter: String,
    /// Resume strictly after this entry.
    pub after: Option<String>,
    pub max_keys: usize,
}

impl ListQuery {
    /// Clamp a client-supplied `max-keys` into range.
    pub fn clamp_max_keys(requested: Option<usize>) -> usize {
        requested.unwrap_or(MAX_KEYS).min(MAX_KEYS)
    }
}

/// One page of results.
#[derive(Debug, Clone, Default)]
pub struct ListingPage {
    pub objects: Vec<Arc<ObjectRecord>>,
    pub common_prefixes: Vec<String>,
    pub is_truncated: bool,
    /// Last entry emitted, set when the page is truncated.
    pub next_cursor: Option<String>,
}

impl ListingPage {
    /// Number of entries (objects plus common prefixes) in the page.
    pub fn key_count(&self) -> usize {
        self.objects.len() + self.common_prefixes.len()
    }
}

/// Encode a cursor as an opaque continuation token.
pub fn encode_token(cursor: &str) -> String {
    let mut raw = Vec::with_capacity(cursor.len() + 1);
    raw.push(TOKEN_VERSION);
    raw.extend_from_slice(cursor.as_bytes());
    URL_SAFE_NO_PAD.encode(raw)
}

/// Decode a continuation token produced by [`encode_token`].
pub fn decode_token(token: &str) -> Result<String, S3Error> {
    let invalid = || S3Error::InvalidToken {
        token: token.to_string(),
    };
    let raw = URL_SAFE_NO_PAD.decode(token).map_err(|_| invalid())?;
    match raw.split_first() {
        Some((&TOKEN_VERSION, cursor)) => String::from_utf8(cursor.to_vec()).map_err(|_| invalid()),
        _ => Err(invalid()),
    }
}

enum Entry<'a> {
    Object(&'a Arc<ObjectRecord>),
    Prefix(String),
}

/// Walk the index in key order, yielding what a listing would emit after
/// `after`: objects, and each common prefix once.
fn entries<'a>(index: &'a KeyIndex, query: &'a ListQuery) -> impl Iterator<Item = Entry<'a>> + 'a {
    let start = match query.after.as_deref() {
        Some(after) if after >= query.prefix.as_str() => Bound::Excluded(after),
        _ => Bound::Included(query.prefix.as_str()),
    };
    let mut last_prefix: Option<String> = None;

    index
        .range_from(start)
        .take_while(move |(key, _)| key.starts_with(query.prefix.as_str()))
        .filter_map(move |(key, record)| {
            if !query.delimiter.is_empty() {
                let rest = &key[query.prefix.len()..];
                if let Some(pos) = rest.find(query.delimiter.as_str()) {
                    let end = query.prefix.len() + pos + query.delimiter.len();
                    let common = &key[..end];
                    let already_emitted = last_prefix.as_deref() == Some(common)
                        || query.after.as_deref().is_some_and(|after| common <= after);
                    if already_emitted {
                        return None;
                    }
                    last_prefix = Some(common.to_string());
                    return Some(Entry::Prefix(common.to_string()));
                }
            }
            Some(Entry::Object(record))
        })
}

/// Compute one page of `query` over `index`.
pub fn list(index: &KeyIndex, query: &ListQuery) -> ListingPage {
    let mut page = ListingPage::default();
    if query.max_keys == 0 {
        return page;
    }

    let mut last: Option<String> = None;
    let mut entries = entries(index, query);
    for entry in entries.by_ref() {
        match entry {
            Entry::Object(record) => {
                last = Some(record.key.clone());
                page.objects.push(Arc::clone(record));
            }
            Entry::Prefix(prefix) => {
                last = Some(prefix.clone());
                page.common_prefixes.push(prefix);
            }
        }
        if page.key_count() == query.max_keys {
            break;
        }
    }

    if entries.next().is_some() {
        page.is_truncated = true;
        page.next_cursor = last;
    }
    page
}
