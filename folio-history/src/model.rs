//! Core data model: document identifiers, version records and document metadata.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

/// Title given to a document the first time it is touched.
pub const DEFAULT_TITLE: &str = "Untitled";

/// Longest accepted document identifier, in bytes.
pub const MAX_DOC_ID_LEN: usize = 256;

/// Opaque, stable external identifier of a document.
///
/// Identifiers are used as RocksDB key prefixes followed by a NUL separator,
/// so control characters are rejected. Surrounding whitespace is rejected rather
/// than trimmed, so two distinct external ids never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    /// Validate and wrap a raw identifier.
    pub fn parse(raw: impl AsRef<str>) -> Option<Self> {
        let raw = raw.as_ref();
        if raw.is_empty()
            || raw.len() > MAX_DOC_ID_LEN
            || raw.chars().any(char::is_control)
            || raw.trim() != raw
        {
            return None;
        }
        Some(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of the user who saved a version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub name: String,
}

impl Author {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// An author is valid when its display name has visible characters.
    pub fn is_valid(&self) -> bool {
        !self.name.trim().is_empty()
    }
}

/// Immutable save-point of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub doc_id: DocumentId,
    /// Positive, gapless, strictly increasing per document
    pub version: u64,
    /// Full document state as a Yjs v1 update
    pub full_state: Vec<u8>,
    /// Causal frontier (state vector + delete set) as a Yjs v1 snapshot
    pub snapshot: Vec<u8>,
    pub author: Author,
    /// Milliseconds since the Unix epoch
    pub created_at: u64,
}

/// Per-document metadata: version counter and title.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMeta {
    pub doc_id: DocumentId,
    /// Mirrors the highest stored `VersionRecord::version` (0 when none)
    pub current_version: u64,
    pub title: String,
    pub created_at: u64,
    pub updated_at: u64,
    /// `created_at` of the latest version record; keeps record timestamps monotonic
    pub last_saved_at: u64,
}

impl DocumentMeta {
    pub fn new(doc_id: DocumentId) -> Self {
        let now = now_millis();
        Self {
            doc_id,
            current_version: 0,
            title: DEFAULT_TITLE.to_string(),
            created_at: now,
            updated_at: now,
            last_saved_at: 0,
        }
    }
}

/// Transport shape of a version: binary state rendered as base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionSummary {
    pub version: u64,
    #[serde(rename = "user")]
    pub author: Author,
    #[serde(rename = "createTime")]
    pub created_at: u64,
    pub content: String,
}

impl VersionSummary {
    pub fn from_record(record: &VersionRecord) -> Self {
        use base64::Engine as _;
        Self {
            version: record.version,
            author: record.author.clone(),
            created_at: record.created_at,
            content: base64::engine::general_purpose::STANDARD.encode(&record.full_state),
        }
    }
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
