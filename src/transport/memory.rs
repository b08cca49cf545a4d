//! In-memory blob transport.
//!
//! Emulates the blob service for a single blob: block staging and
//! commit, append-position and max-size preconditions, page alignment
//! and bounds, sequence numbers, leases and ETag conditions.  Every call
//! is recorded, failures can be injected per operation, and the blob can
//! be modified out of band to simulate a concurrent writer.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use http::StatusCode;
use md5::{Digest, Md5};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use super::backend::{BlobTransport, TransportFuture};
use crate::errors::{BlobError, APPEND_POSITION_CONDITION_NOT_MET, MAX_BLOB_SIZE_CONDITION_NOT_MET};
use crate::models::{
    AppendBlobAccessConditions, AppendBlockResult, BlobAccessConditions, BlobHttpHeaders,
    BlobProperties, BlobType, BlockBlobCommitResult, LeaseAccessConditions,
    ModifiedAccessConditions, PageBlobAccessConditions, PageRange, PageUploadResult,
    SequenceNumberAccessConditions, MAX_APPEND_BLOCK_BYTES, MAX_BLOCKS, MAX_PUT_PAGES_BYTES,
    MAX_STAGE_BLOCK_BYTES, PAGE_BYTES,
};

/// Largest decoded block ID the service accepts.
const MAX_BLOCK_ID_BYTES: usize = 64;

/// Transport operations, used to target injected failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportOp {
    GetProperties,
    StageBlock,
    AppendBlock,
    UploadPages,
    CommitBlockList,
}

/// A call observed by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    GetProperties,
    StageBlock { block_id: String, len: usize },
    AppendBlock { len: usize, append_position: Option<u64> },
    UploadPages { range: PageRange, len: usize },
    CommitBlockList { block_ids: Vec<String> },
}

/// Server-side state of the emulated blob.
#[derive(Debug, Clone)]
struct MemoryBlob {
    blob_type: BlobType,
    data: Vec<u8>,
    /// Committed block IDs with their lengths, in blob order.
    committed: Vec<(String, usize)>,
    /// Append blobs count appended blocks here.
    committed_block_count: u32,
    sequence_number: u64,
    etag: String,
    last_modified: DateTime<Utc>,
    headers: BlobHttpHeaders,
    metadata: BTreeMap<String, String>,
    lease_id: Option<String>,
}

impl MemoryBlob {
    fn new(blob_type: BlobType, data: Vec<u8>) -> Self {
        let etag = compute_etag(&data);
        Self {
            blob_type,
            data,
            committed: Vec::new(),
            committed_block_count: 0,
            sequence_number: 0,
            etag,
            last_modified: Utc::now(),
            headers: BlobHttpHeaders::default(),
            metadata: BTreeMap::new(),
            lease_id: None,
        }
    }

    fn touch(&mut self) {
        self.etag = compute_etag(&self.data);
        self.last_modified = Utc::now();
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    blob: Option<MemoryBlob>,
    /// Uncommitted blocks keyed by block ID.
    staged: HashMap<String, Vec<u8>>,
}

/// In-process stand-in for one blob on the blob service.
pub struct MemoryBlobTransport {
    state: RwLock<MemoryState>,
    failures: Mutex<VecDeque<(TransportOp, BlobError)>>,
    calls: Mutex<Vec<TransportCall>>,
    latency: Option<Duration>,
}

impl Default for MemoryBlobTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBlobTransport {
    /// A transport whose blob does not exist yet.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            failures: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            latency: None,
        }
    }

    /// A transport holding an empty append blob.
    pub fn append_blob() -> Self {
        Self::with_blob(MemoryBlob::new(BlobType::AppendBlob, Vec::new()))
    }

    /// A transport holding a zero-filled page blob of `size` bytes.
    pub fn page_blob(size: u64) -> Result<Self, BlobError> {
        if size % PAGE_BYTES != 0 {
            return Err(BlobError::invalid_argument(format!(
                "Page blob size must be a multiple of 512: {size}"
            )));
        }
        let len = usize::try_from(size)
            .map_err(|_| BlobError::invalid_argument(format!("Page blob too large: {size}")))?;
        Ok(Self::with_blob(MemoryBlob::new(BlobType::PageBlob, vec![0; len])))
    }

    /// A transport holding a block blob with `data` committed as one block.
    pub fn block_blob(data: &[u8]) -> Self {
        let mut blob = MemoryBlob::new(BlobType::BlockBlob, data.to_vec());
        if !data.is_empty() {
            blob.committed.push((BASE64_STANDARD.encode("initial"), data.len()));
        }
        Self::with_blob(blob)
    }

    fn with_blob(blob: MemoryBlob) -> Self {
        Self {
            state: RwLock::new(MemoryState {
                blob: Some(blob),
                staged: HashMap::new(),
            }),
            ..Self::new()
        }
    }

    /// Delay every call by `latency` before it is served.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    // ── Test controls ───────────────────────────────────────────────

    /// Make the next call to `op` fail with `error` instead of being served.
    pub async fn fail_next(&self, op: TransportOp, error: BlobError) {
        self.failures.lock().await.push_back((op, error));
    }

    /// Append `data` to the blob as another writer would.
    pub async fn append_out_of_band(&self, data: &[u8]) -> Result<(), BlobError> {
        let mut state = self.state.write().await;
        let blob = existing_blob(&mut state.blob)?;
        blob.data.extend_from_slice(data);
        blob.committed_block_count += 1;
        blob.touch();
        Ok(())
    }

    /// Put a lease on the blob; later writes must present `lease_id`.
    pub async fn acquire_lease(&self, lease_id: &str) -> Result<(), BlobError> {
        let mut state = self.state.write().await;
        existing_blob(&mut state.blob)?.lease_id = Some(lease_id.to_string());
        Ok(())
    }

    /// Every call served or rejected so far, in order.
    pub async fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().await.clone()
    }

    /// Current committed content of the blob, if it exists.
    pub async fn contents(&self) -> Option<Vec<u8>> {
        self.state.read().await.blob.as_ref().map(|b| b.data.clone())
    }

    /// Committed block IDs in blob order.
    pub async fn committed_block_ids(&self) -> Vec<String> {
        self.state
            .read()
            .await
            .blob
            .as_ref()
            .map(|b| b.committed.iter().map(|(id, _)| id.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of staged, not yet committed blocks.
    pub async fn staged_block_count(&self) -> usize {
        self.state.read().await.staged.len()
    }

    /// HTTP headers stored by the last commit.
    pub async fn http_headers(&self) -> Option<BlobHttpHeaders> {
        self.state.read().await.blob.as_ref().map(|b| b.headers.clone())
    }

    // ── Call plumbing ───────────────────────────────────────────────

    async fn begin(&self, op: TransportOp, call: TransportCall) -> Result<(), BlobError> {
        self.calls.lock().await.push(call);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let mut failures = self.failures.lock().await;
        if let Some(pos) = failures.iter().position(|(o, _)| *o == op) {
            if let Some((_, err)) = failures.remove(pos) {
                debug!("Memory transport: injected failure for {:?}: {}", op, err);
                return Err(err);
            }
        }
        Ok(())
    }

    async fn serve_get_properties(&self) -> Result<BlobProperties, BlobError> {
        self.begin(TransportOp::GetProperties, TransportCall::GetProperties)
            .await?;
        let state = self.state.read().await;
        let blob = state.blob.as_ref().ok_or_else(blob_not_found)?;
        Ok(BlobProperties {
            blob_type: blob.blob_type,
            content_length: blob.data.len() as u64,
            etag: blob.etag.clone(),
            last_modified: Some(blob.last_modified),
            content_type: blob.headers.content_type.clone(),
            committed_block_count: match blob.blob_type {
                BlobType::AppendBlob => Some(blob.committed_block_count),
                _ => None,
            },
            sequence_number: match blob.blob_type {
                BlobType::PageBlob => Some(blob.sequence_number),
                _ => None,
            },
            metadata: blob.metadata.clone(),
        })
    }

    async fn serve_stage_block(
        &self,
        block_id: &str,
        data: &[u8],
        lease: &LeaseAccessConditions,
    ) -> Result<(), BlobError> {
        self.begin(
            TransportOp::StageBlock,
            TransportCall::StageBlock {
                block_id: block_id.to_string(),
                len: data.len(),
            },
        )
        .await?;

        let decoded = BASE64_STANDARD
            .decode(block_id)
            .map_err(|_| invalid_block_id(block_id))?;
        if decoded.is_empty() || decoded.len() > MAX_BLOCK_ID_BYTES {
            return Err(invalid_block_id(block_id));
        }
        if data.len() as u64 > MAX_STAGE_BLOCK_BYTES {
            return Err(body_too_large(data.len()));
        }

        let mut state = self.state.write().await;
        if let Some(blob) = &state.blob {
            check_lease(blob, lease)?;
            if blob.blob_type != BlobType::BlockBlob {
                return Err(invalid_blob_type());
            }
        }
        // All block IDs of one blob must have the same length.
        if let Some(other) = state.staged.keys().next() {
            if other.len() != block_id.len() {
                return Err(service_error(
                    StatusCode::BAD_REQUEST,
                    "InvalidBlobOrBlock",
                    "The specified blob or block content is invalid.",
                ));
            }
        }
        state.staged.insert(block_id.to_string(), data.to_vec());
        Ok(())
    }

    async fn serve_append_block(
        &self,
        data: &[u8],
        conditions: &AppendBlobAccessConditions,
    ) -> Result<AppendBlockResult, BlobError> {
        self.begin(
            TransportOp::AppendBlock,
            TransportCall::AppendBlock {
                len: data.len(),
                append_position: conditions.append_position.append_position,
            },
        )
        .await?;

        if data.len() as u64 > MAX_APPEND_BLOCK_BYTES {
            return Err(body_too_large(data.len()));
        }

        let mut state = self.state.write().await;
        let blob = existing_blob(&mut state.blob)?;
        if blob.blob_type != BlobType::AppendBlob {
            return Err(invalid_blob_type());
        }
        check_blob_conditions(blob, &conditions.blob)?;

        let current = blob.data.len() as u64;
        if let Some(expected) = conditions.append_position.append_position {
            if expected != current {
                return Err(service_error(
                    StatusCode::PRECONDITION_FAILED,
                    APPEND_POSITION_CONDITION_NOT_MET,
                    "The append position condition specified was not met.",
                ));
            }
        }
        if let Some(max) = conditions.append_position.max_size {
            if current + data.len() as u64 > max {
                return Err(service_error(
                    StatusCode::PRECONDITION_FAILED,
                    MAX_BLOB_SIZE_CONDITION_NOT_MET,
                    "The max blob size condition specified was not met.",
                ));
            }
        }
        if blob.committed_block_count as usize >= MAX_BLOCKS {
            return Err(service_error(
                StatusCode::CONFLICT,
                "BlockCountExceedsLimit",
                "The committed block count cannot exceed the maximum limit of 50,000 blocks.",
            ));
        }

        blob.data.extend_from_slice(data);
        blob.committed_block_count += 1;
        blob.touch();
        Ok(AppendBlockResult {
            blob_append_offset: current,
            blob_committed_block_count: blob.committed_block_count,
            etag: blob.etag.clone(),
        })
    }

    async fn serve_upload_pages(
        &self,
        range: PageRange,
        data: &[u8],
        conditions: &PageBlobAccessConditions,
    ) -> Result<PageUploadResult, BlobError> {
        self.begin(
            TransportOp::UploadPages,
            TransportCall::UploadPages {
                range,
                len: data.len(),
            },
        )
        .await?;

        if data.len() as u64 != range.length() {
            return Err(service_error(
                StatusCode::BAD_REQUEST,
                "InvalidHeaderValue",
                "The Content-Length does not match the page range.",
            ));
        }
        if range.length() > MAX_PUT_PAGES_BYTES {
            return Err(body_too_large(data.len()));
        }

        let mut state = self.state.write().await;
        let blob = existing_blob(&mut state.blob)?;
        if blob.blob_type != BlobType::PageBlob {
            return Err(invalid_blob_type());
        }
        check_blob_conditions(blob, &conditions.blob)?;
        check_sequence_number(blob.sequence_number, &conditions.sequence_number)?;

        let start = range.start() as usize;
        let end = range.end() as usize;
        if end >= blob.data.len() {
            return Err(service_error(
                StatusCode::RANGE_NOT_SATISFIABLE,
                "InvalidPageRange",
                "The page range specified is invalid.",
            ));
        }
        blob.data[start..=end].copy_from_slice(data);
        blob.touch();
        Ok(PageUploadResult {
            etag: blob.etag.clone(),
            sequence_number: blob.sequence_number,
        })
    }

    async fn serve_commit_block_list(
        &self,
        block_ids: &[String],
        headers: &BlobHttpHeaders,
        metadata: &BTreeMap<String, String>,
        conditions: &BlobAccessConditions,
    ) -> Result<BlockBlobCommitResult, BlobError> {
        self.begin(
            TransportOp::CommitBlockList,
            TransportCall::CommitBlockList {
                block_ids: block_ids.to_vec(),
            },
        )
        .await?;

        if block_ids.len() > MAX_BLOCKS {
            return Err(service_error(
                StatusCode::BAD_REQUEST,
                "BlockListTooLong",
                "The block list may not contain more than 50,000 blocks.",
            ));
        }

        let mut state = self.state.write().await;
        if let Some(blob) = &state.blob {
            if blob.blob_type != BlobType::BlockBlob {
                return Err(invalid_blob_type());
            }
            check_blob_conditions(blob, conditions)?;
        } else {
            check_missing_blob_conditions(&conditions.modified)?;
        }

        let previous: HashMap<String, Vec<u8>> = match &state.blob {
            Some(blob) => {
                let mut offset = 0;
                blob.committed
                    .iter()
                    .map(|(id, len)| {
                        let chunk = blob.data[offset..offset + len].to_vec();
                        offset += len;
                        (id.clone(), chunk)
                    })
                    .collect()
            }
            None => HashMap::new(),
        };

        let mut data = Vec::new();
        let mut committed = Vec::with_capacity(block_ids.len());
        for id in block_ids {
            let chunk = state
                .staged
                .get(id)
                .or_else(|| previous.get(id))
                .ok_or_else(|| {
                    service_error(
                        StatusCode::BAD_REQUEST,
                        "InvalidBlockList",
                        "The specified block list is invalid.",
                    )
                })?;
            data.extend_from_slice(chunk);
            committed.push((id.clone(), chunk.len()));
        }

        let lease_id = state.blob.as_ref().and_then(|b| b.lease_id.clone());
        let mut blob = MemoryBlob::new(BlobType::BlockBlob, data);
        blob.committed = committed;
        blob.headers = headers.clone();
        blob.metadata = metadata.clone();
        blob.lease_id = lease_id;
        let result = BlockBlobCommitResult {
            etag: blob.etag.clone(),
            last_modified: Some(blob.last_modified),
        };
        state.blob = Some(blob);
        state.staged.clear();
        Ok(result)
    }
}

impl BlobTransport for MemoryBlobTransport {
    fn get_properties(&self) -> TransportFuture<'_, BlobProperties> {
        Box::pin(self.serve_get_properties())
    }

    fn stage_block<'a>(
        &'a self,
        block_id: &'a str,
        data: &'a [u8],
        lease: &'a LeaseAccessConditions,
    ) -> TransportFuture<'a, ()> {
        Box::pin(self.serve_stage_block(block_id, data, lease))
    }

    fn append_block<'a>(
        &'a self,
        data: &'a [u8],
        conditions: &'a AppendBlobAccessConditions,
    ) -> TransportFuture<'a, AppendBlockResult> {
        Box::pin(self.serve_append_block(data, conditions))
    }

    fn upload_pages<'a>(
        &'a self,
        range: PageRange,
        data: &'a [u8],
        conditions: &'a PageBlobAccessConditions,
    ) -> TransportFuture<'a, PageUploadResult> {
        Box::pin(self.serve_upload_pages(range, data, conditions))
    }

    fn commit_block_list<'a>(
        &'a self,
        block_ids: &'a [String],
        headers: &'a BlobHttpHeaders,
        metadata: &'a BTreeMap<String, String>,
        conditions: &'a BlobAccessConditions,
    ) -> TransportFuture<'a, BlockBlobCommitResult> {
        Box::pin(self.serve_commit_block_list(block_ids, headers, metadata, conditions))
    }
}

// ── Emulation helpers ───────────────────────────────────────────────

/// Compute the quoted MD5-hex ETag for a byte slice.
fn compute_etag(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    format!("\"{}\"", hex::encode(hasher.finalize()))
}

fn service_error(status: StatusCode, code: &str, message: &str) -> BlobError {
    BlobError::Service {
        status,
        code: code.to_string(),
        message: message.to_string(),
    }
}

fn invalid_block_id(block_id: &str) -> BlobError {
    service_error(
        StatusCode::BAD_REQUEST,
        "InvalidQueryParameterValue",
        &format!("Invalid block ID: {block_id}"),
    )
}

fn invalid_blob_type() -> BlobError {
    service_error(
        StatusCode::CONFLICT,
        "InvalidBlobType",
        "The blob type is invalid for this operation.",
    )
}

fn body_too_large(len: usize) -> BlobError {
    service_error(
        StatusCode::PAYLOAD_TOO_LARGE,
        "RequestBodyTooLarge",
        &format!("The request body of {len} bytes is too large."),
    )
}

fn condition_not_met() -> BlobError {
    service_error(
        StatusCode::PRECONDITION_FAILED,
        "ConditionNotMet",
        "The condition specified using HTTP conditional header(s) is not met.",
    )
}

fn blob_not_found() -> BlobError {
    service_error(
        StatusCode::NOT_FOUND,
        "BlobNotFound",
        "The specified blob does not exist.",
    )
}

fn existing_blob(blob: &mut Option<MemoryBlob>) -> Result<&mut MemoryBlob, BlobError> {
    blob.as_mut().ok_or_else(blob_not_found)
}

fn check_lease(blob: &MemoryBlob, lease: &LeaseAccessConditions) -> Result<(), BlobError> {
    match (&blob.lease_id, &lease.lease_id) {
        (None, None) => Ok(()),
        (Some(_), None) => Err(service_error(
            StatusCode::PRECONDITION_FAILED,
            "LeaseIdMissing",
            "There is currently a lease on the blob and no lease ID was specified in the request.",
        )),
        (Some(held), Some(given)) if held == given => Ok(()),
        (Some(_), Some(_)) => Err(service_error(
            StatusCode::PRECONDITION_FAILED,
            "LeaseIdMismatchWithBlobOperation",
            "The lease ID specified did not match the lease ID for the blob.",
        )),
        (None, Some(_)) => Err(service_error(
            StatusCode::PRECONDITION_FAILED,
            "LeaseNotPresentWithBlobOperation",
            "There is currently no lease on the blob.",
        )),
    }
}

fn check_blob_conditions(
    blob: &MemoryBlob,
    conditions: &BlobAccessConditions,
) -> Result<(), BlobError> {
    check_lease(blob, &conditions.lease)?;
    let modified = &conditions.modified;
    if let Some(etag) = &modified.if_match {
        if etag != "*" && *etag != blob.etag {
            return Err(condition_not_met());
        }
    }
    if let Some(etag) = &modified.if_none_match {
        if etag == "*" || *etag == blob.etag {
            return Err(condition_not_met());
        }
    }
    if let Some(since) = modified.if_modified_since {
        if blob.last_modified <= since {
            return Err(condition_not_met());
        }
    }
    if let Some(since) = modified.if_unmodified_since {
        if blob.last_modified > since {
            return Err(condition_not_met());
        }
    }
    Ok(())
}

fn check_missing_blob_conditions(modified: &ModifiedAccessConditions) -> Result<(), BlobError> {
    if modified.if_match.is_some() {
        return Err(condition_not_met());
    }
    Ok(())
}

fn check_sequence_number(
    current: u64,
    conditions: &SequenceNumberAccessConditions,
) -> Result<(), BlobError> {
    let met = conditions
        .if_sequence_number_less_than_or_equal
        .map_or(true, |n| current <= n)
        && conditions
            .if_sequence_number_less_than
            .map_or(true, |n| current < n)
        && conditions
            .if_sequence_number_equal
            .map_or(true, |n| current == n);
    if met {
        Ok(())
    } else {
        Err(service_error(
            StatusCode::PRECONDITION_FAILED,
            "SequenceNumberConditionNotMet",
            "The sequence number condition specified was not met.",
        ))
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn block_id(n: u32) -> String {
        BASE64_STANDARD.encode(format!("block-{n:06}"))
    }

    #[tokio::test]
    async fn test_get_properties_missing_blob() {
        let transport = MemoryBlobTransport::new();
        let err = transport.get_properties().await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(err.service_code(), Some("BlobNotFound"));
    }

    #[tokio::test]
    async fn test_stage_and_commit_in_order() {
        let transport = MemoryBlobTransport::new();
        let lease = LeaseAccessConditions::default();
        transport.stage_block(&block_id(1), b"world", &lease).await.unwrap();
        transport.stage_block(&block_id(0), b"hello ", &lease).await.unwrap();
        assert_eq!(transport.staged_block_count().await, 2);

        let ids = vec![block_id(0), block_id(1)];
        let headers = BlobHttpHeaders {
            content_type: Some("text/plain".to_string()),
            ..Default::default()
        };
        let result = transport
            .commit_block_list(&ids, &headers, &BTreeMap::new(), &BlobAccessConditions::default())
            .await
            .unwrap();

        assert_eq!(transport.contents().await.unwrap(), b"hello world");
        assert_eq!(transport.committed_block_ids().await, ids);
        assert_eq!(transport.staged_block_count().await, 0);
        let props = transport.get_properties().await.unwrap();
        assert_eq!(props.etag, result.etag);
        assert_eq!(props.content_type.as_deref(), Some("text/plain"));
        assert_eq!(props.blob_type, BlobType::BlockBlob);
    }

    #[tokio::test]
    async fn test_commit_unknown_block_rejected() {
        let transport = MemoryBlobTransport::new();
        let err = transport
            .commit_block_list(
                &[block_id(7)],
                &BlobHttpHeaders::default(),
                &BTreeMap::new(),
                &BlobAccessConditions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.service_code(), Some("InvalidBlockList"));
        assert!(transport.contents().await.is_none());
    }

    #[tokio::test]
    async fn test_recommit_keeps_previous_blocks() {
        let transport = MemoryBlobTransport::block_blob(b"abc");
        let existing = transport.committed_block_ids().await;
        let lease = LeaseAccessConditions::default();
        let new_id = BASE64_STANDARD.encode("initia2");
        transport.stage_block(&new_id, b"def", &lease).await.unwrap();

        let mut ids = existing.clone();
        ids.push(new_id);
        transport
            .commit_block_list(
                &ids,
                &BlobHttpHeaders::default(),
                &BTreeMap::new(),
                &BlobAccessConditions::default(),
            )
            .await
            .unwrap();
        assert_eq!(transport.contents().await.unwrap(), b"abcdef");
    }

    #[tokio::test]
    async fn test_invalid_block_id() {
        let transport = MemoryBlobTransport::new();
        let err = transport
            .stage_block("not base64!", b"x", &LeaseAccessConditions::default())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_append_position_enforced() {
        let transport = MemoryBlobTransport::append_blob();
        let mut conditions = AppendBlobAccessConditions::default();
        conditions.append_position.append_position = Some(0);
        let result = transport.append_block(b"12345", &conditions).await.unwrap();
        assert_eq!(result.blob_append_offset, 0);
        assert_eq!(result.blob_committed_block_count, 1);

        // Still expecting offset 0, but the blob is now 5 bytes long.
        let err = transport.append_block(b"678", &conditions).await.unwrap_err();
        assert!(err.is_precondition_failed());
        assert_eq!(err.service_code(), Some(APPEND_POSITION_CONDITION_NOT_MET));
        assert_eq!(transport.contents().await.unwrap(), b"12345");
    }

    #[tokio::test]
    async fn test_append_max_size_enforced() {
        let transport = MemoryBlobTransport::append_blob();
        let mut conditions = AppendBlobAccessConditions::default();
        conditions.append_position.max_size = Some(4);
        let err = transport.append_block(b"12345", &conditions).await.unwrap_err();
        assert_eq!(err.service_code(), Some(MAX_BLOB_SIZE_CONDITION_NOT_MET));
    }

    #[tokio::test]
    async fn test_append_to_block_blob_rejected() {
        let transport = MemoryBlobTransport::block_blob(b"");
        let err = transport
            .append_block(b"x", &AppendBlobAccessConditions::default())
            .await
            .unwrap_err();
        assert_eq!(err.service_code(), Some("InvalidBlobType"));
    }

    #[tokio::test]
    async fn test_upload_pages_bounds() {
        let transport = MemoryBlobTransport::page_blob(1024).unwrap();
        let conditions = PageBlobAccessConditions::default();
        let range = PageRange::new(512, 1023).unwrap();
        transport.upload_pages(range, &[7u8; 512], &conditions).await.unwrap();

        let data = transport.contents().await.unwrap();
        assert!(data[..512].iter().all(|b| *b == 0));
        assert!(data[512..].iter().all(|b| *b == 7));

        let beyond = PageRange::new(1024, 1535).unwrap();
        let err = transport
            .upload_pages(beyond, &[1u8; 512], &conditions)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::RANGE_NOT_SATISFIABLE);
    }

    #[tokio::test]
    async fn test_sequence_number_condition() {
        let transport = MemoryBlobTransport::page_blob(512).unwrap();
        let mut conditions = PageBlobAccessConditions::default();
        conditions.sequence_number.if_sequence_number_less_than = Some(0);
        let err = transport
            .upload_pages(PageRange::new(0, 511).unwrap(), &[0u8; 512], &conditions)
            .await
            .unwrap_err();
        assert_eq!(err.service_code(), Some("SequenceNumberConditionNotMet"));
    }

    #[tokio::test]
    async fn test_lease_required_once_acquired() {
        let transport = MemoryBlobTransport::block_blob(b"");
        transport.acquire_lease("lease-1").await.unwrap();

        let err = transport
            .stage_block(&block_id(0), b"x", &LeaseAccessConditions::default())
            .await
            .unwrap_err();
        assert_eq!(err.service_code(), Some("LeaseIdMissing"));

        let lease = LeaseAccessConditions {
            lease_id: Some("lease-1".to_string()),
        };
        transport.stage_block(&block_id(0), b"x", &lease).await.unwrap();
    }

    #[tokio::test]
    async fn test_if_match_condition() {
        let transport = MemoryBlobTransport::append_blob();
        let mut conditions = AppendBlobAccessConditions::default();
        conditions.blob.modified.if_match = Some("\"stale\"".to_string());
        let err = transport.append_block(b"x", &conditions).await.unwrap_err();
        assert_eq!(err.service_code(), Some("ConditionNotMet"));
    }

    #[tokio::test]
    async fn test_injected_failure_is_consumed_once() {
        let transport = MemoryBlobTransport::append_blob();
        transport
            .fail_next(TransportOp::AppendBlock, BlobError::io("connection reset"))
            .await;

        let conditions = AppendBlobAccessConditions::default();
        let err = transport.append_block(b"a", &conditions).await.unwrap_err();
        assert!(matches!(err, BlobError::Io { .. }));
        transport.append_block(b"a", &conditions).await.unwrap();
        assert_eq!(transport.calls().await.len(), 2);
    }

    #[tokio::test]
    async fn test_out_of_band_append() {
        let transport = MemoryBlobTransport::append_blob();
        transport.append_out_of_band(b"xyz").await.unwrap();
        let props = transport.get_properties().await.unwrap();
        assert_eq!(props.content_length, 3);
        assert_eq!(props.committed_block_count, Some(1));
    }
}
