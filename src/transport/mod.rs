//! Blob transports.
//!
//! The [`BlobTransport`] trait is the boundary between the upload streams
//! and the service.  [`http::HttpBlobTransport`] talks to the REST API;
//! [`memory::MemoryBlobTransport`] emulates it in process.

pub mod backend;
pub mod http;
pub mod memory;

pub use backend::{BlobTransport, TransportFuture};
