//! Chunked blob output streams.
//!
//! A [`BlobOutputStream`] accepts arbitrary writes, re-chunks them through
//! an [`UploadBufferPool`] and dispatches each full chunk to the service
//! before accepting more input.  What a dispatch and a commit mean depends
//! on the blob type:
//!
//!   Append: `append_block` guarded by the expected append position;
//!           commit is a no-op.
//!   Block:  `stage_block` under a generated block ID recorded by offset;
//!           commit uploads the ordered block list.
//!   Page:   `upload_pages` for the next 512-aligned range;
//!           commit is a no-op.
//!
//! The first transport failure is recorded and returned by every later
//! call.  A stream is single use: after `close` every `write` and `close`
//! fails with [`BlobError::StreamClosed`].

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::buffer_pool::{PooledBuffer, UploadBufferPool};
use crate::errors::BlobError;
use crate::metrics;
use crate::models::{
    AppendBlobAccessConditions, BlobAccessConditions, BlobHttpHeaders, BlobType,
    BlockBlobCommitResult, PageBlobAccessConditions, PageRange, DEFAULT_BLOCK_SIZE,
    MAX_APPEND_BLOCK_BYTES, MAX_BLOCKS, MAX_PUT_PAGES_BYTES, MAX_STAGE_BLOCK_BYTES, PAGE_BYTES,
};
use crate::transport::BlobTransport;

/// Minimum number of pool buffers per stream.
pub const MIN_BUFFERS: usize = 2;

fn default_block_size() -> usize {
    DEFAULT_BLOCK_SIZE
}

fn default_max_buffers() -> usize {
    MIN_BUFFERS
}

// ── Options ─────────────────────────────────────────────────────────

/// Options for an append blob stream.
#[derive(Debug, Clone)]
pub struct AppendStreamOptions {
    /// Chunk size; capped at the 4 MiB Append Block limit.
    pub block_size: usize,
    pub max_buffers: usize,
    /// Upper bound on each `write` / `close` call.
    pub timeout: Option<Duration>,
    /// `append_position` seeds the expected blob length; when unset the
    /// current length is read from the service.
    pub conditions: AppendBlobAccessConditions,
}

impl Default for AppendStreamOptions {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            max_buffers: default_max_buffers(),
            timeout: None,
            conditions: AppendBlobAccessConditions::default(),
        }
    }
}

/// Options for a block blob stream.
#[derive(Debug, Clone)]
pub struct BlockStreamOptions {
    pub block_size: usize,
    pub max_buffers: usize,
    pub timeout: Option<Duration>,
    /// Headers stored by the final Put Block List.
    pub headers: BlobHttpHeaders,
    pub metadata: BTreeMap<String, String>,
    /// Conditions for the final commit.  The lease is also sent with every
    /// staged block.
    pub conditions: BlobAccessConditions,
}

impl Default for BlockStreamOptions {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            max_buffers: default_max_buffers(),
            timeout: None,
            headers: BlobHttpHeaders::default(),
            metadata: BTreeMap::new(),
            conditions: BlobAccessConditions::default(),
        }
    }
}

/// Options for a page blob stream.
#[derive(Debug, Clone)]
pub struct PageStreamOptions {
    /// Chunk size; must be a multiple of 512 and is capped at 4 MiB.
    pub block_size: usize,
    pub max_buffers: usize,
    pub timeout: Option<Duration>,
    pub conditions: PageBlobAccessConditions,
}

impl Default for PageStreamOptions {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            max_buffers: default_max_buffers(),
            timeout: None,
            conditions: PageBlobAccessConditions::default(),
        }
    }
}

// ── Strategies ──────────────────────────────────────────────────────

struct AppendState {
    /// Blob length when the stream was opened.
    initial_offset: u64,
    /// Bytes the service has accepted through this stream.
    written: u64,
    conditions: AppendBlobAccessConditions,
}

impl AppendState {
    async fn dispatch(
        &mut self,
        transport: &dyn BlobTransport,
        chunk: &[u8],
    ) -> Result<(), BlobError> {
        let mut conditions = self.conditions.clone();
        let position = self.initial_offset + self.written;
        conditions.append_position.append_position = Some(position);

        let result = transport.append_block(chunk, &conditions).await?;
        debug!(
            "Appended {} bytes at offset {} (committed blocks: {})",
            chunk.len(),
            result.blob_append_offset,
            result.blob_committed_block_count
        );
        self.written += chunk.len() as u64;
        Ok(())
    }
}

struct BlockState {
    /// Random per-stream prefix so concurrent uploads never share IDs.
    id_prefix: String,
    /// Stream offset of each staged block -> block ID.
    block_list: BTreeMap<u64, String>,
    written: u64,
    headers: BlobHttpHeaders,
    metadata: BTreeMap<String, String>,
    conditions: BlobAccessConditions,
    commit_result: Option<BlockBlobCommitResult>,
}

impl BlockState {
    /// `base64("{prefix}{sequence:06}")`; every ID of one stream has the
    /// same length.
    fn block_id(&self, sequence: usize) -> String {
        BASE64_STANDARD.encode(format!("{}{:06}", self.id_prefix, sequence))
    }

    async fn dispatch(
        &mut self,
        transport: &dyn BlobTransport,
        chunk: &[u8],
    ) -> Result<(), BlobError> {
        if self.block_list.len() >= MAX_BLOCKS {
            return Err(BlobError::invalid_argument(format!(
                "A block blob cannot hold more than {MAX_BLOCKS} blocks"
            )));
        }
        let block_id = self.block_id(self.block_list.len());
        transport
            .stage_block(&block_id, chunk, &self.conditions.lease)
            .await?;
        debug!(
            "Staged block {} ({} bytes) at stream offset {}",
            block_id,
            chunk.len(),
            self.written
        );
        self.block_list.insert(self.written, block_id);
        self.written += chunk.len() as u64;
        Ok(())
    }

    async fn commit(&mut self, transport: &dyn BlobTransport) -> Result<(), BlobError> {
        let block_ids: Vec<String> = self.block_list.values().cloned().collect();
        let result = transport
            .commit_block_list(&block_ids, &self.headers, &self.metadata, &self.conditions)
            .await?;
        info!(
            "Committed {} blocks ({} bytes), etag={}",
            block_ids.len(),
            self.written,
            result.etag
        );
        self.commit_result = Some(result);
        Ok(())
    }
}

struct PageState {
    range: PageRange,
    written: u64,
    conditions: PageBlobAccessConditions,
}

impl PageState {
    async fn dispatch(
        &mut self,
        transport: &dyn BlobTransport,
        chunk: &[u8],
    ) -> Result<(), BlobError> {
        let len = chunk.len() as u64;
        if len % PAGE_BYTES != 0 {
            return Err(BlobError::invalid_argument(format!(
                "Page blob writes must be a multiple of {PAGE_BYTES} bytes; got a final chunk of {len}"
            )));
        }
        let range = PageRange::from_offset(self.range.start() + self.written, len)?;
        transport
            .upload_pages(range, chunk, &self.conditions)
            .await?;
        debug!("Uploaded pages {}", range);
        self.written += len;
        Ok(())
    }
}

enum StreamKind {
    Append(AppendState),
    Block(BlockState),
    Page(PageState),
}

impl StreamKind {
    fn blob_type(&self) -> BlobType {
        match self {
            StreamKind::Append(_) => BlobType::AppendBlob,
            StreamKind::Block(_) => BlobType::BlockBlob,
            StreamKind::Page(_) => BlobType::PageBlob,
        }
    }
}

// ── Stream ──────────────────────────────────────────────────────────

/// Buffered writer that uploads to one blob.  Single writer: calls take
/// `&mut self` and each chunk is dispatched only after the previous one
/// completed.
pub struct BlobOutputStream {
    transport: Arc<dyn BlobTransport>,
    kind: StreamKind,
    pool: UploadBufferPool,
    /// Chunk size handed to the pool.
    write_threshold: usize,
    timeout: Option<Duration>,
    /// First error recorded; every later call returns it.
    fault: OnceLock<BlobError>,
    /// Bytes accepted through `write`, dispatched or still pooled.
    accepted: u64,
    closed: bool,
}

impl std::fmt::Debug for BlobOutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobOutputStream")
            .field("blob_type", &self.kind.blob_type())
            .field("write_threshold", &self.write_threshold)
            .field("accepted", &self.accepted)
            .field("faulted", &self.fault.get().is_some())
            .field("closed", &self.closed)
            .finish()
    }
}

impl BlobOutputStream {
    /// Open a stream that appends to an existing append blob.
    ///
    /// When `options.conditions` carries no append position the current
    /// blob length is fetched with `get_properties`.
    pub async fn append(
        transport: Arc<dyn BlobTransport>,
        options: AppendStreamOptions,
    ) -> Result<Self, BlobError> {
        let threshold = options.block_size.min(MAX_APPEND_BLOCK_BYTES as usize);
        let initial_offset = match options.conditions.append_position.append_position {
            Some(position) => position,
            None => transport.get_properties().await?.content_length,
        };
        debug!(
            "Opening append stream at offset {} (chunk size {})",
            initial_offset, threshold
        );
        let kind = StreamKind::Append(AppendState {
            initial_offset,
            written: 0,
            conditions: options.conditions,
        });
        Self::open(transport, kind, threshold, options.max_buffers, options.timeout)
    }

    /// Open a stream that stages blocks and commits them on close,
    /// replacing the blob's content.
    pub fn block(
        transport: Arc<dyn BlobTransport>,
        options: BlockStreamOptions,
    ) -> Result<Self, BlobError> {
        if options.block_size as u64 > MAX_STAGE_BLOCK_BYTES {
            return Err(BlobError::invalid_argument(format!(
                "Block size {} exceeds the maximum of {} bytes",
                options.block_size, MAX_STAGE_BLOCK_BYTES
            )));
        }
        let kind = StreamKind::Block(BlockState {
            id_prefix: format!("{}-", Uuid::new_v4()),
            block_list: BTreeMap::new(),
            written: 0,
            headers: options.headers,
            metadata: options.metadata,
            conditions: options.conditions,
            commit_result: None,
        });
        Self::open(transport, kind, options.block_size, options.max_buffers, options.timeout)
    }

    /// Open a stream that writes sequentially into `range` of a page blob.
    pub fn page(
        transport: Arc<dyn BlobTransport>,
        range: PageRange,
        options: PageStreamOptions,
    ) -> Result<Self, BlobError> {
        if options.block_size as u64 % PAGE_BYTES != 0 {
            return Err(BlobError::invalid_argument(format!(
                "Page stream block size must be a multiple of {PAGE_BYTES}: {}",
                options.block_size
            )));
        }
        let threshold = (options.block_size as u64)
            .min(MAX_PUT_PAGES_BYTES)
            .min(range.length()) as usize;
        let kind = StreamKind::Page(PageState {
            range,
            written: 0,
            conditions: options.conditions,
        });
        Self::open(transport, kind, threshold, options.max_buffers, options.timeout)
    }

    fn open(
        transport: Arc<dyn BlobTransport>,
        kind: StreamKind,
        write_threshold: usize,
        max_buffers: usize,
        timeout: Option<Duration>,
    ) -> Result<Self, BlobError> {
        let pool = UploadBufferPool::new(max_buffers, write_threshold)?;
        Ok(Self {
            transport,
            kind,
            pool,
            write_threshold,
            timeout,
            fault: OnceLock::new(),
            accepted: 0,
            closed: false,
        })
    }

    pub fn blob_type(&self) -> BlobType {
        self.kind.blob_type()
    }

    /// Size of each dispatched chunk (the last one may be shorter).
    pub fn write_threshold(&self) -> usize {
        self.write_threshold
    }

    /// Total bytes accepted by `write` so far.
    pub fn bytes_written(&self) -> u64 {
        self.accepted
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Block IDs staged so far, in stream order.  Empty for other blob types.
    pub fn block_ids(&self) -> Vec<String> {
        match &self.kind {
            StreamKind::Block(state) => state.block_list.values().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Result of the final Put Block List, once a block stream is closed.
    pub fn commit_result(&self) -> Option<&BlockBlobCommitResult> {
        match &self.kind {
            StreamKind::Block(state) => state.commit_result.as_ref(),
            _ => None,
        }
    }

    /// Write all of `data`.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), BlobError> {
        self.write_at(data, 0, data.len()).await
    }

    /// Write `length` bytes of `data` starting at `offset`.
    pub async fn write_at(
        &mut self,
        data: &[u8],
        offset: usize,
        length: usize,
    ) -> Result<(), BlobError> {
        if self.closed {
            return Err(BlobError::StreamClosed);
        }
        self.check_fault()?;

        let end = offset
            .checked_add(length)
            .filter(|end| *end <= data.len())
            .ok_or_else(|| {
                BlobError::invalid_argument(format!(
                    "Write range offset={offset} length={length} is outside a buffer of {} bytes",
                    data.len()
                ))
            })?;
        if length == 0 {
            return Ok(());
        }
        if let StreamKind::Page(state) = &self.kind {
            let capacity = state.range.length();
            if self.accepted + length as u64 > capacity {
                return Err(BlobError::invalid_argument(format!(
                    "Write of {length} bytes would exceed the page range {} ({} bytes already written)",
                    state.range, self.accepted
                )));
            }
        }

        self.accepted += length as u64;
        let data = &data[offset..end];
        match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, self.write_chunks(data)).await {
                Ok(result) => result,
                Err(_) => Err(self.timed_out(limit)),
            },
            None => self.write_chunks(data).await,
        }
    }

    /// Surface a recorded fault.  Chunks are dispatched as they fill, so
    /// there is nothing else to push.
    pub fn flush(&self) -> Result<(), BlobError> {
        self.check_fault()
    }

    /// Dispatch any buffered remainder and commit.  The stream is closed
    /// afterwards whether or not this succeeds.
    pub async fn close(&mut self) -> Result<(), BlobError> {
        if self.closed {
            return Err(BlobError::StreamClosed);
        }
        self.closed = true;
        self.check_fault()?;

        match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, self.finish()).await {
                Ok(result) => result?,
                Err(_) => return Err(self.timed_out(limit)),
            },
            None => self.finish().await?,
        }

        let blob_type = self.kind.blob_type().as_str();
        metrics::record_commit(blob_type);
        debug!("Closed {} output stream after {} bytes", blob_type, self.accepted);
        Ok(())
    }

    // ── Internals ───────────────────────────────────────────────────

    fn check_fault(&self) -> Result<(), BlobError> {
        match self.fault.get() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Record `err` as the stream's fault (unless one is already set) and
    /// return the fault that is now in effect.
    fn record_fault(&self, err: BlobError) -> BlobError {
        let fault = match err {
            BlobError::InvalidArgument { .. } | BlobError::StreamFault(_) => err,
            other => BlobError::StreamFault(Box::new(other)),
        };
        if self.fault.set(fault.clone()).is_ok() {
            warn!("Blob output stream faulted: {}", fault);
            metrics::record_failure(self.kind.blob_type().as_str());
        }
        self.fault.get().cloned().unwrap_or(fault)
    }

    /// Fault recorded when a call outlives the stream timeout.  The
    /// in-flight request may or may not have reached the service.
    fn timed_out(&self, limit: Duration) -> BlobError {
        self.record_fault(BlobError::Timeout(limit))
    }

    async fn write_chunks(&mut self, data: &[u8]) -> Result<(), BlobError> {
        for chunk in data.chunks(self.write_threshold) {
            let ready = self.pool.write(chunk).await?;
            for buffer in ready {
                self.dispatch(buffer).await?;
            }
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), BlobError> {
        if let Some(buffer) = self.pool.flush() {
            self.dispatch(buffer).await?;
        }
        let result = match &mut self.kind {
            StreamKind::Block(state) => state.commit(self.transport.as_ref()).await,
            StreamKind::Append(_) | StreamKind::Page(_) => Ok(()),
        };
        result.map_err(|err| self.record_fault(err))
    }

    /// Send one chunk.  The buffer goes back to the pool when this returns,
    /// on success and on failure.
    async fn dispatch(&mut self, buffer: PooledBuffer) -> Result<(), BlobError> {
        let transport = self.transport.as_ref();
        let result = match &mut self.kind {
            StreamKind::Append(state) => state.dispatch(transport, &buffer).await,
            StreamKind::Block(state) => state.dispatch(transport, &buffer).await,
            StreamKind::Page(state) => state.dispatch(transport, &buffer).await,
        };
        let len = buffer.len();
        self.pool.return_buffer(buffer);

        match result {
            Ok(()) => {
                metrics::record_chunk(self.kind.blob_type().as_str(), len);
                Ok(())
            }
            Err(err) => Err(self.record_fault(err)),
        }
    }
}

impl Drop for BlobOutputStream {
    fn drop(&mut self) {
        if !self.closed {
            warn!(
                "{} output stream dropped without close; {} buffered bytes discarded",
                self.kind.blob_type().as_str(),
                self.pool.pending()
            );
        }
    }
}
