//! Value types shared by the transports, output streams and client facade.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};

use crate::errors::BlobError;

/// Page blobs are addressed in 512-byte pages.
pub const PAGE_BYTES: u64 = 512;

/// Largest page range a single Put Page call may carry (4 MiB).
pub const MAX_PUT_PAGES_BYTES: u64 = 4 * 1024 * 1024;

/// Largest block a single Append Block call may carry (4 MiB).
pub const MAX_APPEND_BLOCK_BYTES: u64 = 4 * 1024 * 1024;

/// Maximum number of committed blocks in a block blob.
pub const MAX_BLOCKS: usize = 50_000;

/// Largest block a single Put Block call may carry (4,000 MiB).
pub const MAX_STAGE_BLOCK_BYTES: u64 = 4_000 * 1024 * 1024;

/// Default chunk size used by output streams (4 MiB).
pub const DEFAULT_BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Kind of blob stored at a URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobType {
    BlockBlob,
    AppendBlob,
    PageBlob,
}

impl BlobType {
    /// Value of the `x-ms-blob-type` header.
    pub fn as_str(&self) -> &'static str {
        match self {
            BlobType::BlockBlob => "BlockBlob",
            BlobType::AppendBlob => "AppendBlob",
            BlobType::PageBlob => "PageBlob",
        }
    }

    /// Parse an `x-ms-blob-type` header value.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "BlockBlob" => Some(BlobType::BlockBlob),
            "AppendBlob" => Some(BlobType::AppendBlob),
            "PageBlob" => Some(BlobType::PageBlob),
            _ => None,
        }
    }
}

// ── Page ranges ─────────────────────────────────────────────────────

/// An inclusive byte range inside a page blob.
///
/// `start` is page aligned and `end + 1` is page aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRange {
    start: u64,
    end: u64,
}

impl PageRange {
    /// Build a validated range.
    pub fn new(start: u64, end: u64) -> Result<Self, BlobError> {
        if start % PAGE_BYTES != 0 {
            return Err(BlobError::invalid_argument(format!(
                "PageRange's start value must be a multiple of {PAGE_BYTES}: {start}"
            )));
        }
        if end <= start {
            return Err(BlobError::invalid_argument(format!(
                "PageRange's end value must be after the start: start={start} end={end}"
            )));
        }
        if end % PAGE_BYTES != PAGE_BYTES - 1 {
            return Err(BlobError::invalid_argument(format!(
                "PageRange's end value must be 1 less than a multiple of {PAGE_BYTES}: {end}"
            )));
        }
        Ok(Self { start, end })
    }

    /// Range covering `length` bytes starting at `offset`.
    pub fn from_offset(offset: u64, length: u64) -> Result<Self, BlobError> {
        if length == 0 {
            return Err(BlobError::invalid_argument("PageRange length must be positive"));
        }
        let end = offset.checked_add(length - 1).ok_or_else(|| {
            BlobError::invalid_argument(format!(
                "PageRange overflows: offset={offset} length={length}"
            ))
        })?;
        Self::new(offset, end)
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    /// Number of bytes covered (always a multiple of [`PAGE_BYTES`]).
    pub fn length(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Header form: `bytes=start-end`.
    pub fn to_header_value(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bytes={}-{}", self.start, self.end)
    }
}

// ── Properties and results ─────────────────────────────────────────

/// Subset of Get Blob Properties used by the upload path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobProperties {
    pub blob_type: BlobType,
    pub content_length: u64,
    pub etag: String,
    pub last_modified: Option<DateTime<Utc>>,
    pub content_type: Option<String>,
    pub committed_block_count: Option<u32>,
    pub sequence_number: Option<u64>,
    pub metadata: BTreeMap<String, String>,
}

/// Result of an Append Block call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendBlockResult {
    /// Offset at which the block was written.
    pub blob_append_offset: u64,
    /// Number of committed blocks after the append.
    pub blob_committed_block_count: u32,
    pub etag: String,
}

/// Result of a Put Page call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageUploadResult {
    pub etag: String,
    pub sequence_number: u64,
}

/// Result of a Put Block List call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBlobCommitResult {
    pub etag: String,
    pub last_modified: Option<DateTime<Utc>>,
}

// ── Headers ─────────────────────────────────────────────────────────

/// Standard HTTP properties stored with a blob.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobHttpHeaders {
    pub cache_control: Option<String>,
    pub content_disposition: Option<String>,
    pub content_encoding: Option<String>,
    pub content_language: Option<String>,
    pub content_type: Option<String>,
}

impl BlobHttpHeaders {
    /// `x-ms-blob-*` request headers for the set fields.
    pub fn to_headers(&self) -> Vec<(String, String)> {
        let fields = [
            ("x-ms-blob-cache-control", &self.cache_control),
            ("x-ms-blob-content-disposition", &self.content_disposition),
            ("x-ms-blob-content-encoding", &self.content_encoding),
            ("x-ms-blob-content-language", &self.content_language),
            ("x-ms-blob-content-type", &self.content_type),
        ];
        fields
            .into_iter()
            .filter_map(|(name, value)| value.as_ref().map(|v| (name.to_string(), v.clone())))
            .collect()
    }
}

/// `x-ms-meta-*` headers for user metadata.
pub fn metadata_headers(metadata: &BTreeMap<String, String>) -> Vec<(String, String)> {
    metadata
        .iter()
        .map(|(k, v)| (format!("x-ms-meta-{k}"), v.clone()))
        .collect()
}

// ── Access conditions ──────────────────────────────────────────────

/// Lease precondition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaseAccessConditions {
    pub lease_id: Option<String>,
}

/// ETag / time preconditions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModifiedAccessConditions {
    pub if_match: Option<String>,
    pub if_none_match: Option<String>,
    pub if_modified_since: Option<DateTime<Utc>>,
    pub if_unmodified_since: Option<DateTime<Utc>>,
}

/// Lease and modification preconditions applied to a whole blob.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobAccessConditions {
    pub lease: LeaseAccessConditions,
    pub modified: ModifiedAccessConditions,
}

/// Append-specific preconditions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppendPositionAccessConditions {
    /// The blob length the caller expects before this append.
    pub append_position: Option<u64>,
    /// Fail if the append would grow the blob beyond this size.
    pub max_size: Option<u64>,
}

/// Preconditions for Append Block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppendBlobAccessConditions {
    pub append_position: AppendPositionAccessConditions,
    pub blob: BlobAccessConditions,
}

/// Sequence-number preconditions for page writes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceNumberAccessConditions {
    pub if_sequence_number_less_than_or_equal: Option<u64>,
    pub if_sequence_number_less_than: Option<u64>,
    pub if_sequence_number_equal: Option<u64>,
}

/// Preconditions for Put Page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageBlobAccessConditions {
    pub sequence_number: SequenceNumberAccessConditions,
    pub blob: BlobAccessConditions,
}

fn http_date(time: &DateTime<Utc>) -> String {
    httpdate::fmt_http_date(std::time::SystemTime::from(*time))
}

impl LeaseAccessConditions {
    pub fn to_headers(&self) -> Vec<(String, String)> {
        self.lease_id
            .iter()
            .map(|id| ("x-ms-lease-id".to_string(), id.clone()))
            .collect()
    }
}

impl ModifiedAccessConditions {
    pub fn to_headers(&self) -> Vec<(String, String)> {
        let mut headers = Vec::new();
        if let Some(etag) = &self.if_match {
            headers.push(("If-Match".to_string(), etag.clone()));
        }
        if let Some(etag) = &self.if_none_match {
            headers.push(("If-None-Match".to_string(), etag.clone()));
        }
        if let Some(time) = &self.if_modified_since {
            headers.push(("If-Modified-Since".to_string(), http_date(time)));
        }
        if let Some(time) = &self.if_unmodified_since {
            headers.push(("If-Unmodified-Since".to_string(), http_date(time)));
        }
        headers
    }
}

impl BlobAccessConditions {
    pub fn to_headers(&self) -> Vec<(String, String)> {
        let mut headers = self.lease.to_headers();
        headers.extend(self.modified.to_headers());
        headers
    }
}

impl AppendBlobAccessConditions {
    pub fn to_headers(&self) -> Vec<(String, String)> {
        let mut headers = self.blob.to_headers();
        if let Some(pos) = self.append_position.append_position {
            headers.push(("x-ms-blob-condition-appendpos".to_string(), pos.to_string()));
        }
        if let Some(max) = self.append_position.max_size {
            headers.push(("x-ms-blob-condition-maxsize".to_string(), max.to_string()));
        }
        headers
    }
}

impl PageBlobAccessConditions {
    pub fn to_headers(&self) -> Vec<(String, String)> {
        let mut headers = self.blob.to_headers();
        let seq = &self.sequence_number;
        if let Some(n) = seq.if_sequence_number_less_than_or_equal {
            headers.push(("x-ms-if-sequence-number-le".to_string(), n.to_string()));
        }
        if let Some(n) = seq.if_sequence_number_less_than {
            headers.push(("x-ms-if-sequence-number-lt".to_string(), n.to_string()));
        }
        if let Some(n) = seq.if_sequence_number_equal {
            headers.push(("x-ms-if-sequence-number-eq".to_string(), n.to_string()));
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_range_to_string() {
        let range = PageRange::new(0, 511).unwrap();
        assert_eq!(range.to_header_value(), "bytes=0-511");
        assert_eq!(range.length(), 512);

        let range = PageRange::new(1024, 4095).unwrap();
        assert_eq!(range.to_string(), "bytes=1024-4095");
        assert_eq!(range.length(), 3072);
    }

    #[test]
    fn test_page_range_misaligned_start() {
        let err = PageRange::new(1, 512).unwrap_err();
        assert!(err.is_argument_error());
    }

    #[test]
    fn test_page_range_misaligned_end() {
        assert!(PageRange::new(0, 512).unwrap_err().is_argument_error());
        assert!(PageRange::new(0, 1000).unwrap_err().is_argument_error());
    }

    #[test]
    fn test_page_range_end_before_start() {
        assert!(PageRange::new(1024, 511).unwrap_err().is_argument_error());
        assert!(PageRange::new(512, 512).unwrap_err().is_argument_error());
    }

    #[test]
    fn test_page_range_from_offset() {
        let range = PageRange::from_offset(512, 1024).unwrap();
        assert_eq!((range.start(), range.end()), (512, 1535));
        assert!(PageRange::from_offset(0, 0).is_err());
        assert!(PageRange::from_offset(0, 100).is_err());
    }

    #[test]
    fn test_blob_type_parse() {
        for t in [BlobType::BlockBlob, BlobType::AppendBlob, BlobType::PageBlob] {
            assert_eq!(BlobType::parse(t.as_str()), Some(t));
        }
        assert_eq!(BlobType::parse("Directory"), None);
    }

    #[test]
    fn test_append_conditions_headers() {
        let conditions = AppendBlobAccessConditions {
            append_position: AppendPositionAccessConditions {
                append_position: Some(1024),
                max_size: Some(4096),
            },
            blob: BlobAccessConditions {
                lease: LeaseAccessConditions {
                    lease_id: Some("lease-1".to_string()),
                },
                modified: ModifiedAccessConditions::default(),
            },
        };
        let headers = conditions.to_headers();
        assert!(headers.contains(&("x-ms-lease-id".to_string(), "lease-1".to_string())));
        assert!(headers.contains(&(
            "x-ms-blob-condition-appendpos".to_string(),
            "1024".to_string()
        )));
        assert!(headers.contains(&(
            "x-ms-blob-condition-maxsize".to_string(),
            "4096".to_string()
        )));
    }

    #[test]
    fn test_http_headers_skip_unset() {
        let headers = BlobHttpHeaders {
            content_type: Some("text/plain".to_string()),
            ..Default::default()
        };
        assert_eq!(
            headers.to_headers(),
            vec![(
                "x-ms-blob-content-type".to_string(),
                "text/plain".to_string()
            )]
        );
    }
}
