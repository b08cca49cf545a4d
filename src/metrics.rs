//! Upload metrics.
//!
//! Counters are emitted through the `metrics` facade; installing a
//! recorder (Prometheus, statsd, ...) is left to the embedding
//! application.  Without a recorder every call is a no-op.

use metrics::{counter, describe_counter};

// -- Metric name constants ----------------------------------------------------

/// Chunks dispatched to the blob service (counter). Labels: blob_type.
pub const UPLOAD_CHUNKS_TOTAL: &str = "azblob_upload_chunks_total";

/// Bytes accepted by the blob service (counter). Labels: blob_type.
pub const UPLOAD_BYTES_TOTAL: &str = "azblob_upload_bytes_total";

/// Chunk dispatches or commits that failed (counter). Labels: blob_type.
pub const UPLOAD_FAILURES_TOTAL: &str = "azblob_upload_failures_total";

/// Output streams closed successfully (counter). Labels: blob_type.
pub const UPLOAD_COMMITS_TOTAL: &str = "azblob_upload_commits_total";

/// Register metric descriptions with the global recorder.  Call once after
/// installing a recorder.
pub fn describe_metrics() {
    describe_counter!(UPLOAD_CHUNKS_TOTAL, "Chunks dispatched by blob output streams");
    describe_counter!(UPLOAD_BYTES_TOTAL, "Bytes uploaded by blob output streams");
    describe_counter!(UPLOAD_FAILURES_TOTAL, "Failed chunk dispatches and commits");
    describe_counter!(UPLOAD_COMMITS_TOTAL, "Blob output streams committed");
}

/// Record one successfully dispatched chunk of `bytes` bytes.
pub fn record_chunk(blob_type: &'static str, bytes: usize) {
    counter!(UPLOAD_CHUNKS_TOTAL, "blob_type" => blob_type).increment(1);
    counter!(UPLOAD_BYTES_TOTAL, "blob_type" => blob_type).increment(bytes as u64);
}

/// Record a failed dispatch or commit.
pub fn record_failure(blob_type: &'static str) {
    counter!(UPLOAD_FAILURES_TOTAL, "blob_type" => blob_type).increment(1);
}

/// Record a committed stream.
pub fn record_commit(blob_type: &'static str) {
    counter!(UPLOAD_COMMITS_TOTAL, "blob_type" => blob_type).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names_are_prefixed() {
        for name in [
            UPLOAD_CHUNKS_TOTAL,
            UPLOAD_BYTES_TOTAL,
            UPLOAD_FAILURES_TOTAL,
            UPLOAD_COMMITS_TOTAL,
        ] {
            assert!(name.starts_with("azblob_"));
            assert!(name.ends_with("_total"));
        }
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        describe_metrics();
        record_chunk("BlockBlob", 1024);
        record_failure("AppendBlob");
        record_commit("PageBlob");
    }
}
