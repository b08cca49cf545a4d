//! Chunked uploads: the buffer pool and the blob output streams built on it.

pub mod buffer_pool;
pub mod output_stream;

pub use buffer_pool::{PooledBuffer, UploadBufferPool};
pub use output_stream::{
    AppendStreamOptions, BlobOutputStream, BlockStreamOptions, PageStreamOptions,
};
