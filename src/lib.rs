//! azblob library: Azure Blob Storage client.
//!
//! This crate provides Shared Key and SAS request signing, blob URL
//! handling, and output streams that upload append, block and page blobs
//! in bounded chunks through a pluggable [`BlobTransport`].

pub mod auth;
pub mod client;
pub mod config;
pub mod errors;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod sas;
pub mod transport;
pub mod upload;
pub mod url_parts;
pub mod xml;

pub use auth::{ConnectionString, SharedKeyCredential, StorageCredential};
pub use client::{BlobClient, BlobContainerClient, BlobServiceClient};
pub use config::{load_config, ClientConfig};
pub use errors::BlobError;
pub use transport::http::{HttpBlobTransport, HttpPipeline};
pub use transport::memory::MemoryBlobTransport;
pub use transport::{BlobTransport, TransportFuture};
pub use upload::{
    AppendStreamOptions, BlobOutputStream, BlockStreamOptions, PageStreamOptions,
    UploadBufferPool,
};
pub use url_parts::BlobUrlParts;
