use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Opaque reference to a blob, assigned by the blob store on write
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(String);

impl FileId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name of the lookup field in a collection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeyField {
    /// Source images, keyed by normalized request path
    Path,
    /// Rendered results, keyed by the request-derived cache key
    Key,
}

impl KeyField {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyField::Path => "path",
            KeyField::Key => "key",
        }
    }

    /// The `(key ASC, created_at DESC)` index every storage needs
    pub fn lookup_index(&self) -> IndexSpec {
        IndexSpec::new(vec![
            (self.as_str().to_string(), IndexDirection::Ascending),
            ("created_at".to_string(), IndexDirection::Descending),
        ])
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexDirection {
    Ascending,
    Descending,
}

impl IndexDirection {
    pub fn as_i32(&self) -> i32 {
        match self {
            IndexDirection::Ascending => 1,
            IndexDirection::Descending => -1,
        }
    }
}

/// A named, ordered index definition
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: String,
    pub fields: Vec<(String, IndexDirection)>,
}

impl IndexSpec {
    /// Build an index named the way MongoDB names it by default, e.g. `path_1_created_at_-1`
    pub fn new(fields: Vec<(String, IndexDirection)>) -> Self {
        let name = fields
            .iter()
            .map(|(field, direction)| format!("{}_{}", field, direction.as_i32()))
            .collect::<Vec<_>>()
            .join("_");

        Self { name, fields }
    }
}

/// One cached item: descriptive fields plus the reference to its blob
#[derive(Clone, Debug, PartialEq)]
pub struct MetadataDocument {
    pub key: String,
    pub created_at: DateTime<Utc>,
    pub file_id: FileId,
    pub crypto: Option<String>,
    pub detector_data: Option<Value>,
    pub metadata: Option<HashMap<String, String>>,
}

impl MetadataDocument {
    pub fn new(key: impl Into<String>, created_at: DateTime<Utc>, file_id: FileId) -> Self {
        Self {
            key: key.into(),
            created_at,
            file_id,
            crypto: None,
            detector_data: None,
            metadata: None,
        }
    }
}

/// Selection of metadata documents for a single key
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentQuery {
    pub key: String,
    /// Only documents with `created_at >= created_since`
    pub created_since: Option<DateTime<Utc>>,
    /// Only documents carrying non-null detector data
    pub with_detector_data: bool,
}

impl DocumentQuery {
    pub fn for_key(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            created_since: None,
            with_detector_data: false,
        }
    }

    pub fn created_since(mut self, since: DateTime<Utc>) -> Self {
        self.created_since = Some(since);
        self
    }

    pub fn with_detector_data(mut self) -> Self {
        self.with_detector_data = true;
        self
    }

    pub fn matches(&self, doc: &MetadataDocument) -> bool {
        doc.key == self.key
            && self.created_since.is_none_or(|since| doc.created_at >= since)
            && (!self.with_detector_data
                || doc.detector_data.as_ref().is_some_and(|data| !data.is_null()))
    }
}

/// Field change applied to every document of a key
#[derive(Clone, Debug, PartialEq)]
pub enum DocumentUpdate {
    Crypto(String),
    DetectorData(Value),
}

/// Key fields copied onto a blob so it can be traced back without its document
#[derive(Clone, Debug, PartialEq)]
pub struct BlobAttributes {
    pub key_field: KeyField,
    pub key: String,
    pub created_at: DateTime<Utc>,
}

/// Listing entry for a stored blob
#[derive(Clone, Debug, PartialEq)]
pub struct BlobInfo {
    pub file_id: FileId,
    pub key: Option<String>,
    pub uploaded_at: DateTime<Utc>,
}

/// The parts of the host's request the storages look at
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RequestContext {
    pub url: String,
    pub accepts_webp: bool,
    /// Per-request max-age override. `Some(0)` forces everything to read as expired.
    pub max_age: Option<u64>,
}

impl RequestContext {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn accepting_webp(mut self) -> Self {
        self.accepts_webp = true;
        self
    }

    pub fn with_max_age(mut self, max_age: u64) -> Self {
        self.max_age = Some(max_age);
        self
    }
}

/// Answer to "when did this result last change"
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LastUpdated {
    /// Expiration is off; the storage start time is the stable anchor
    Unbounded(DateTime<Utc>),
    /// Derived from the age of the stored document
    Stored(DateTime<Utc>),
    /// No document backs the key, or the store could not be read. Carries the current time.
    Degraded(DateTime<Utc>),
}

impl LastUpdated {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            LastUpdated::Unbounded(at) | LastUpdated::Stored(at) | LastUpdated::Degraded(at) => *at,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, LastUpdated::Degraded(_))
    }
}

pub mod response {
    use super::FileId;
    use bytes::Bytes;
    use chrono::{DateTime, Utc};
    use std::collections::HashMap;

    pub const LAST_MODIFIED: &str = "LastModified";
    pub const CONTENT_LENGTH: &str = "ContentLength";
    pub const CONTENT_TYPE: &str = "ContentType";

    #[derive(Clone, Debug, PartialEq)]
    pub struct PutResponse {
        pub key: String,
        pub file_id: FileId,
        pub created_at: DateTime<Utc>,
    }

    impl PutResponse {
        pub fn new(key: impl Into<String>, file_id: FileId, created_at: DateTime<Utc>) -> Self {
            Self {
                key: key.into(),
                file_id,
                created_at,
            }
        }
    }

    #[derive(Clone, Debug, Default, PartialEq, Eq)]
    pub struct RemoveResponse {
        pub documents_removed: u64,
        pub blobs_removed: u64,
    }

    impl RemoveResponse {
        pub fn new(documents_removed: u64, blobs_removed: u64) -> Self {
            Self {
                documents_removed,
                blobs_removed,
            }
        }
    }

    /// A result storage hit with its synthesized response metadata
    #[derive(Clone, Debug, PartialEq)]
    pub struct ResultEntry {
        pub bytes: Bytes,
        pub last_modified: DateTime<Utc>,
        pub content_length: usize,
        pub content_type: String,
        /// Stored headers merged with `LastModified`, `ContentLength` and `ContentType`
        pub metadata: HashMap<String, String>,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_lookup_index_names() {
        assert_eq!(KeyField::Path.lookup_index().name, "path_1_created_at_-1");
        assert_eq!(KeyField::Key.lookup_index().name, "key_1_created_at_-1");
        assert_eq!(
            KeyField::Key.lookup_index().fields,
            vec![
                ("key".to_string(), IndexDirection::Ascending),
                ("created_at".to_string(), IndexDirection::Descending),
            ]
        );
    }

    #[test]
    fn test_query_matches_key_and_freshness() {
        let doc = MetadataDocument::new("/a.jpg", at(10), FileId::new("f1"));

        assert!(DocumentQuery::for_key("/a.jpg").matches(&doc));
        assert!(!DocumentQuery::for_key("/b.jpg").matches(&doc));
        assert!(DocumentQuery::for_key("/a.jpg").created_since(at(10)).matches(&doc));
        assert!(!DocumentQuery::for_key("/a.jpg").created_since(at(11)).matches(&doc));
    }

    #[test]
    fn test_query_detector_data_requires_non_null() {
        let mut doc = MetadataDocument::new("/a.jpg", at(0), FileId::new("f1"));
        let query = DocumentQuery::for_key("/a.jpg").with_detector_data();
        assert!(!query.matches(&doc));

        doc.detector_data = Some(Value::Null);
        assert!(!query.matches(&doc));

        doc.detector_data = Some(json!([{"x": 1, "y": 2}]));
        assert!(query.matches(&doc));
    }

    #[test]
    fn test_last_updated_accessors() {
        assert!(LastUpdated::Degraded(at(0)).is_degraded());
        assert!(!LastUpdated::Stored(at(0)).is_degraded());
        assert_eq!(LastUpdated::Unbounded(at(5)).timestamp(), at(5));
    }

    #[test]
    fn test_request_context_builders() {
        let request = RequestContext::new("/unsafe/300x200/a.jpg")
            .accepting_webp()
            .with_max_age(0);
        assert_eq!(request.url, "/unsafe/300x200/a.jpg");
        assert!(request.accepts_webp);
        assert_eq!(request.max_age, Some(0));
    }
}
