//! Abstract blob transport trait.
//!
//! A [`BlobTransport`] is bound to a single blob and exposes exactly the
//! service calls the output streams need.  Implementations report service
//! rejections as [`BlobError::Service`] and network failures as
//! [`BlobError::Io`] so the two stay distinguishable.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use crate::errors::BlobError;
use crate::models::{
    AppendBlobAccessConditions, AppendBlockResult, BlobAccessConditions, BlobHttpHeaders,
    BlobProperties, BlockBlobCommitResult, LeaseAccessConditions, PageBlobAccessConditions,
    PageRange, PageUploadResult,
};

/// Boxed future returned by every transport call.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BlobError>> + Send + 'a>>;

/// Async blob service contract used by the upload path.
pub trait BlobTransport: Send + Sync + 'static {
    /// Read the blob's system properties and metadata.
    fn get_properties(&self) -> TransportFuture<'_, BlobProperties>;

    /// Upload `data` as an uncommitted block named `block_id` (base64).
    fn stage_block<'a>(
        &'a self,
        block_id: &'a str,
        data: &'a [u8],
        lease: &'a LeaseAccessConditions,
    ) -> TransportFuture<'a, ()>;

    /// Append `data` to the end of an append blob.
    fn append_block<'a>(
        &'a self,
        data: &'a [u8],
        conditions: &'a AppendBlobAccessConditions,
    ) -> TransportFuture<'a, AppendBlockResult>;

    /// Write `data` into `range` of a page blob.  `data.len()` must equal
    /// `range.length()`.
    fn upload_pages<'a>(
        &'a self,
        range: PageRange,
        data: &'a [u8],
        conditions: &'a PageBlobAccessConditions,
    ) -> TransportFuture<'a, PageUploadResult>;

    /// Commit the staged blocks named by `block_ids`, in order, as the
    /// blob's content.
    fn commit_block_list<'a>(
        &'a self,
        block_ids: &'a [String],
        headers: &'a BlobHttpHeaders,
        metadata: &'a BTreeMap<String, String>,
        conditions: &'a BlobAccessConditions,
    ) -> TransportFuture<'a, BlockBlobCommitResult>;
}
