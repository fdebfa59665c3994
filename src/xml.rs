//! S3 XML response rendering.
//!
//! Every document is produced with `quick-xml` through the small [`XmlDoc`]
//! builder, which handles the declaration, the 2006-03-01 namespace on the
//! root element, and text escaping.

use chrono::{DateTime, Utc};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use std::io::Cursor;
use std::sync::Arc;

use crate::listing::ListingPage;
use crate::registry::Bucket;
use crate::uploads::{PartInfo, Upload};

const S3_NAMESPACE: &str = "http://s3.amazonaws.com/doc/2006-03-01/";

/// Owner reported on listings. There is a single tenant.
const OWNER_ID: &str = "s3dir";

const STORAGE_CLASS: &str = "STANDARD";

/// S3 timestamp format, e.g. `2026-01-01T00:00:00.000Z`.
pub fn iso8601(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

struct XmlDoc {
    writer: Writer<Cursor<Vec<u8>>>,
}

impl XmlDoc {
    fn new() -> Self {
        let mut doc = XmlDoc {
            writer: Writer::new(Cursor::new(Vec::new())),
        };
        doc.event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)));
        doc
    }

    /// Start a document whose root element carries the S3 namespace.
    fn with_root(root: &str) -> Self {
        let mut doc = Self::new();
        doc.event(Event::Start(
            BytesStart::new(root).with_attributes([("xmlns", S3_NAMESPACE)]),
        ));
        doc
    }

    fn event(&mut self, event: Event<'_>) {
        // Writing into a Vec cannot fail.
        self.writer
            .write_event(event)
            .expect("xml write to memory buffer");
    }

    fn open(&mut self, tag: &str) -> &mut Self {
        self.event(Event::Start(BytesStart::new(tag)));
        self
    }

    fn close(&mut self, tag: &str) -> &mut Self {
        self.event(Event::End(BytesEnd::new(tag)));
        self
    }

    fn text(&mut self, tag: &str, value: &str) -> &mut Self {
        self.open(tag);
        self.event(Event::Text(BytesText::new(value)));
        self.close(tag)
    }

    fn group(&mut self, tag: &str, children: &[(&str, &str)]) -> &mut Self {
        self.open(tag);
        for (child, value) in children {
            self.text(child, value);
        }
        self.close(tag)
    }

    fn flag(&mut self, tag: &str, value: bool) -> &mut Self {
        self.text(tag, if value { "true" } else { "false" })
    }

    fn finish(self) -> String {
        String::from_utf8_lossy(&self.writer.into_inner().into_inner()).into_owned()
    }
}

/// `<Error>` document.
pub fn render_error(code: &str, message: &str, resource: &str, request_id: &str) -> String {
    let mut doc = XmlDoc::new();
    doc.group(
        "Error",
        &[
            ("Code", code),
            ("Message", message),
            ("Resource", resource),
            ("RequestId", request_id),
        ],
    );
    doc.finish()
}

/// `<ListAllMyBucketsResult>` for `GET /`.
pub fn render_list_buckets(buckets: &[Arc<Bucket>]) -> String {
    let mut doc = XmlDoc::with_root("ListAllMyBucketsResult");
    doc.group("Owner", &[("ID", OWNER_ID), ("DisplayName", OWNER_ID)]);
    doc.open("Buckets");
    for bucket in buckets {
        doc.group(
            "Bucket",
            &[
                ("Name", bucket.name()),
                ("CreationDate", &iso8601(&bucket.created_at())),
            ],
        );
    }
    doc.close("Buckets").close("ListAllMyBucketsResult");
    doc.finish()
}

/// Request parameters echoed back in both listing versions.
pub struct ListingHeader<'a> {
    pub bucket: &'a str,
    pub prefix: &'a str,
    pub delimiter: &'a str,
    pub max_keys: usize,
}

fn write_listing_header(doc: &mut XmlDoc, head: &ListingHeader<'_>) {
    doc.text("Name", head.bucket).text("Prefix", head.prefix);
    if !head.delimiter.is_empty() {
        doc.text("Delimiter", head.delimiter);
    }
    doc.text("MaxKeys", &head.max_keys.to_string());
}

fn write_listing_entries(doc: &mut XmlDoc, page: &ListingPage) {
    for record in &page.objects {
        doc.open("Contents")
            .text("Key", &record.key)
            .text("LastModified", &iso8601(&record.last_modified))
            .text("ETag", &record.etag)
            .text("Size", &record.size.to_string())
            .text("StorageClass", STORAGE_CLASS)
            .close("Contents");
    }
    for prefix in &page.common_prefixes {
        doc.group("CommonPrefixes", &[("Prefix", prefix)]);
    }
}

/// `<ListBucketResult>` for ListObjectsV2.
pub fn render_list_objects_v2(
    head: &ListingHeader<'_>,
    page: &ListingPage,
    continuation_token: Option<&str>,
    next_continuation_token: Option<&str>,
    start_after: Option<&str>,
) -> String {
    let mut doc = XmlDoc::with_root("ListBucketResult");
    write_listing_header(&mut doc, head);
    doc.text("KeyCount", &page.key_count().to_string())
        .flag("IsTruncated", page.is_truncated);
    if let Some(token) = continuation_token {
        doc.text("ContinuationToken", token);
    }
    if let Some(token) = next_continuation_token {
        doc.text("NextContinuationToken", token);
    }
    if let Some(start_after) = start_after.filter(|s| !s.is_empty()) {
        doc.text("StartAfter", start_after);
    }
    write_listing_entries(&mut doc, page);
    doc.close("ListBucketResult");
    doc.finish()
}

/// `<ListBucketResult>` for ListObjects (v1). `NextMarker` is emitted
/// whenever the page is truncated.
pub fn render_list_objects_v1(head: &ListingHeader<'_>, page: &ListingPage, marker: &str) -> String {
    let mut doc = XmlDoc::with_root("ListBucketResult");
    write_listing_header(&mut doc, head);
    doc.text("Marker", marker).flag("IsTruncated", page.is_truncated);
    if let Some(next) = page.next_cursor.as_deref().filter(|_| page.is_truncated) {
        doc.text("NextMarker", next);
    }
    write_listing_entries(&mut doc, page);
    doc.close("ListBucketResult");
    doc.finish()
}

/// One failed key in a `<DeleteResult>`.
pub struct DeleteFailure<'a> {
    pub key: &'a str,
    pub code: &'a str,
    pub message: String,
}

/// `<DeleteResult>` for DeleteObjects. Quiet mode reports failures only.
pub fn render_delete_result(deleted: &[&str], failures: &[DeleteFailure<'_>], quiet: bool) -> String {
    let mut doc = XmlDoc::with_root("DeleteResult");
    if !quiet {
        for key in deleted {
            doc.group("Deleted", &[("Key", key)]);
        }
    }
    for failure in failures {
        doc.group(
            "Error",
            &[
                ("Key", failure.key),
                ("Code", failure.code),
                ("Message", &failure.message),
            ],
        );
    }
    doc.close("DeleteResult");
    doc.finish()
}

pub fn render_initiate_upload(bucket: &str, key: &str, upload_id: &str) -> String {
    let mut doc = XmlDoc::with_root("InitiateMultipartUploadResult");
    doc.text("Bucket", bucket)
        .text("Key", key)
        .text("UploadId", upload_id)
        .close("InitiateMultipartUploadResult");
    doc.finish()
}

pub fn render_complete_upload(location: &str, bucket: &str, key: &str, etag: &str) -> String {
    let mut doc = XmlDoc::with_root("CompleteMultipartUploadResult");
    doc.text("Location", location)
        .text("Bucket", bucket)
        .text("Key", key)
        .text("ETag", etag)
        .close("CompleteMultipartUploadResult");
    doc.finish()
}

/// `<ListPartsResult>`; all parts are returned in one page.
pub fn render_list_parts(bucket: &str, upload: &Upload, parts: &[PartInfo]) -> String {
    let mut doc = XmlDoc::with_root("ListPartsResult");
    doc.text("Bucket", bucket)
        .text("Key", &upload.key)
        .text("UploadId", &upload.id)
        .group("Initiator", &[("ID", OWNER_ID), ("DisplayName", OWNER_ID)])
        .group("Owner", &[("ID", OWNER_ID), ("DisplayName", OWNER_ID)])
        .text("StorageClass", STORAGE_CLASS)
        .text("PartNumberMarker", "0")
        .text("MaxParts", &crate::uploads::MAX_PART_NUMBER.to_string())
        .flag("IsTruncated", false);
    for part in parts {
        doc.open("Part")
            .text("PartNumber", &part.part_number.to_string())
            .text("LastModified", &iso8601(&part.last_modified))
            .text("ETag", &part.etag)
            .text("Size", &part.size.to_string())
            .close("Part");
    }
    doc.close("ListPartsResult");
    doc.finish()
}

/// `<ListMultipartUploadsResult>`; all open uploads in one page.
pub fn render_list_uploads(bucket: &str, prefix: &str, uploads: &[Arc<Upload>]) -> String {
    let mut doc = XmlDoc::with_root("ListMultipartUploadsResult");
    doc.text("Bucket", bucket)
        .text("KeyMarker", "")
        .text("UploadIdMarker", "")
        .text("Prefix", prefix)
        .text("MaxUploads", "1000")
        .flag("IsTruncated", false);
    for upload in uploads {
        doc.open("Upload")
            .text("Key", &upload.key)
            .text("UploadId", &upload.id)
            .group("Initiator", &[("ID", OWNER_ID), ("DisplayName", OWNER_ID)])
            .group("Owner", &[("ID", OWNER_ID), ("DisplayName", OWNER_ID)])
            .text("StorageClass", STORAGE_CLASS)
            .text("Initiated", &iso8601(&upload.initiated))
            .close("Upload");
    }
    doc.close("ListMultipartUploadsResult");
    doc.finish()
}

/// `<PresignedUrl>` returned by `GET /{bucket}/{key}?presign`.
pub fn render_presigned_url(url: &str, method: &str, expires: &DateTime<Utc>) -> String {
    let mut doc = XmlDoc::with_root("PresignedUrl");
    doc.text("Url", url)
        .text("Method", method)
        .text("Expires", &iso8601(expires))
        .close("PresignedUrl");
    doc.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::store::ObjectRecord;
    use chrono::TimeZone;

    fn record(key: &str) -> Arc<ObjectRecord> {
        Arc::new(ObjectRecord {
            bucket: "b".into(),
            key: key.into(),
            size: 18,
            etag: "\"abc\"".into(),
            content_type: "text/plain".into(),
            user_metadata: Default::default(),
            last_modified: Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap(),
            blob: "0".repeat(32),
        })
    }

    #[test]
    fn test_iso8601() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(iso8601(&ts), "2026-01-02T03:04:05.000Z");
    }

    #[test]
    fn test_render_error() {
        let xml = render_error("NoSuchKey", "missing", "/b/k", "REQ1");
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains("<Error><Code>NoSuchKey</Code><Message>missing</Message>"));
        assert!(xml.contains("<Resource>/b/k</Resource><RequestId>REQ1</RequestId></Error>"));
    }

    #[test]
    fn test_render_list_v2_escapes_and_paginates() {
        let page = ListingPage {
            objects: vec![record("a&b<c>")],
            common_prefixes: vec!["dir/".into()],
            is_truncated: true,
            next_cursor: Some("dir/".into()),
        };
        let head = ListingHeader {
            bucket: "b",
            prefix: "",
            delimiter: "/",
            max_keys: 2,
        };
        let xml = render_list_objects_v2(&head, &page, None, Some("TOKEN"), None);
        assert!(xml.contains(&format!("<ListBucketResult xmlns=\"{S3_NAMESPACE}\">")));
        assert!(xml.contains("<Key>a&amp;b&lt;c&gt;</Key>"));
        assert!(xml.contains("<KeyCount>2</KeyCount><IsTruncated>true</IsTruncated>"));
        assert!(xml.contains("<NextContinuationToken>TOKEN</NextContinuationToken>"));
        assert!(xml.contains("<CommonPrefixes><Prefix>dir/</Prefix></CommonPrefixes>"));
        assert!(xml.contains("<Delimiter>/</Delimiter>"));
        assert!(!xml.contains("<StartAfter>"));
    }

    #[test]
    fn test_render_list_v1_next_marker() {
        let head = ListingHeader {
            bucket: "b",
            prefix: "p",
            delimiter: "",
            max_keys: 1,
        };
        let mut page = ListingPage {
            objects: vec![record("p1")],
            common_prefixes: vec![],
            is_truncated: true,
            next_cursor: Some("p1".into()),
        };
        let xml = render_list_objects_v1(&head, &page, "");
        assert!(xml.contains("<Marker></Marker><IsTruncated>true</IsTruncated><NextMarker>p1</NextMarker>"));
        assert!(!xml.contains("<Delimiter>"));

        page.is_truncated = false;
        page.next_cursor = None;
        assert!(!render_list_objects_v1(&head, &page, "").contains("NextMarker"));
    }

    #[test]
    fn test_render_delete_result_quiet() {
        let failures = [DeleteFailure {
            key: "bad",
            code: "InternalError",
            message: "boom".into(),
        }];
        let loud = render_delete_result(&["ok"], &failures, false);
        assert!(loud.contains("<Deleted><Key>ok</Key></Deleted>"));
        assert!(loud.contains("<Error><Key>bad</Key><Code>InternalError</Code>"));
        let quiet = render_delete_result(&["ok"], &failures, true);
        assert!(!quiet.contains("<Deleted>"));
        assert!(quiet.contains("<Key>bad</Key>"));
    }

    #[test]
    fn test_render_multipart_documents() {
        let xml = render_initiate_upload("b", "k", "u1");
        assert!(xml.contains("<Bucket>b</Bucket><Key>k</Key><UploadId>u1</UploadId>"));
        let xml = render_complete_upload("/b/k", "b", "k", "\"e-2\"");
        assert!(xml.contains("<ETag>&quot;e-2&quot;</ETag>"));
    }

    #[test]
    fn test_render_presigned_url() {
        let expires = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let xml = render_presigned_url("http://h/b/k?x=1&y=2", "GET", &expires);
        assert!(xml.contains("<Url>http://h/b/k?x=1&amp;y=2</Url>"));
        assert!(xml.contains("<Expires>2026-01-01T00:00:00.000Z</Expires>"));
    }
}
