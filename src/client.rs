//! Service, container and blob clients.
//!
//! A thin layer over [`HttpPipeline`] that composes resource URLs and hands
//! out [`BlobOutputStream`]s bound to an [`HttpBlobTransport`].  Stream
//! options start from the `upload` section of the client configuration.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use reqwest::Method;
use tracing::{debug, info};
use url::Url;

use crate::auth::{SharedKeyCredential, StorageCredential};
use crate::config::{ClientConfig, UploadConfig};
use crate::errors::BlobError;
use crate::models::{
    metadata_headers, AppendBlobAccessConditions, BlobAccessConditions, BlobHttpHeaders,
    BlobProperties, PageRange,
};
use crate::sas::{AccountSasSignatureValues, BlobSasSignatureValues, SasQueryParameters};
use crate::transport::http::{HttpBlobTransport, HttpPipeline, DEFAULT_HTTP_TIMEOUT};
use crate::transport::BlobTransport;
use crate::upload::{AppendStreamOptions, BlobOutputStream, BlockStreamOptions, PageStreamOptions};
use crate::url_parts::BlobUrlParts;

fn shared_key(pipeline: &HttpPipeline) -> Result<&SharedKeyCredential, BlobError> {
    match pipeline.credential() {
        StorageCredential::SharedKey(key) => Ok(key),
        _ => Err(BlobError::invalid_argument(
            "Generating a SAS requires a Shared Key credential",
        )),
    }
}

// ── Service ─────────────────────────────────────────────────────────

/// Entry point for one storage account's blob service.
#[derive(Debug, Clone)]
pub struct BlobServiceClient {
    parts: BlobUrlParts,
    url: Url,
    pipeline: HttpPipeline,
    upload: UploadConfig,
}

impl BlobServiceClient {
    /// Client for `endpoint` (e.g. `https://acct.blob.core.windows.net` or
    /// `http://127.0.0.1:10000/devstoreaccount1`).
    pub fn new(endpoint: &str, credential: StorageCredential) -> Result<Self, BlobError> {
        let pipeline = HttpPipeline::new(credential, DEFAULT_HTTP_TIMEOUT)?;
        Self::with_pipeline(endpoint, pipeline, UploadConfig::default())
    }

    /// Client built from a loaded configuration.
    pub fn from_config(config: &ClientConfig) -> Result<Self, BlobError> {
        config.validate()?;
        let endpoint = config.resolve_endpoint()?;
        let credential = config.resolve_credential()?;
        let pipeline = HttpPipeline::new(credential, config.http.timeout())?
            .with_compute_md5(config.upload.compute_md5);
        let client = Self::with_pipeline(&endpoint, pipeline, config.upload.clone())?;
        info!("Blob service client for {}", client.url);
        Ok(client)
    }

    /// Client sharing an existing pipeline.
    pub fn with_pipeline(
        endpoint: &str,
        pipeline: HttpPipeline,
        upload: UploadConfig,
    ) -> Result<Self, BlobError> {
        let mut parts = BlobUrlParts::parse(endpoint)?;
        parts.container_name = None;
        parts.blob_name = None;
        let url = parts.to_url()?;
        Ok(Self {
            parts,
            url,
            pipeline,
            upload,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn account_name(&self) -> Option<&str> {
        self.parts.account_name.as_deref()
    }

    pub fn pipeline(&self) -> &HttpPipeline {
        &self.pipeline
    }

    pub fn container_client(&self, container_name: &str) -> Result<BlobContainerClient, BlobError> {
        if container_name.is_empty() {
            return Err(BlobError::invalid_argument("Container name must not be empty"));
        }
        let mut parts = self.parts.clone();
        parts.container_name = Some(container_name.to_string());
        let url = parts.to_url()?;
        Ok(BlobContainerClient {
            parts,
            url,
            pipeline: self.pipeline.clone(),
            upload: self.upload.clone(),
        })
    }

    /// Sign an account SAS with this client's Shared Key.
    pub fn generate_account_sas(
        &self,
        values: &AccountSasSignatureValues,
    ) -> Result<SasQueryParameters, BlobError> {
        values.sign(shared_key(&self.pipeline)?)
    }
}

// ── Container ───────────────────────────────────────────────────────

/// Client for one container.
#[derive(Debug, Clone)]
pub struct BlobContainerClient {
    parts: BlobUrlParts,
    url: Url,
    pipeline: HttpPipeline,
    upload: UploadConfig,
}

impl BlobContainerClient {
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn name(&self) -> &str {
        self.parts.container_name.as_deref().unwrap_or_default()
    }

    /// Create the container.  Fails with `ContainerAlreadyExists` if present.
    pub async fn create(&self, metadata: &BTreeMap<String, String>) -> Result<(), BlobError> {
        let headers = metadata_headers(metadata);
        self.pipeline
            .send(
                Method::PUT,
                &self.url,
                &[("restype", "container")],
                headers,
                Some(Vec::new()),
            )
            .await?;
        info!("Created container {}", self.name());
        Ok(())
    }

    /// Mark the container and its blobs for deletion.
    pub async fn delete(&self) -> Result<(), BlobError> {
        self.pipeline
            .send(
                Method::DELETE,
                &self.url,
                &[("restype", "container")],
                Vec::new(),
                None,
            )
            .await?;
        info!("Deleted container {}", self.name());
        Ok(())
    }

    pub fn blob_client(&self, blob_name: &str) -> Result<BlobClient, BlobError> {
        if blob_name.is_empty() {
            return Err(BlobError::invalid_argument("Blob name must not be empty"));
        }
        let mut parts = self.parts.clone();
        parts.blob_name = Some(blob_name.to_string());
        let url = parts.to_url()?;
        Ok(BlobClient {
            parts,
            transport: Arc::new(HttpBlobTransport::new(self.pipeline.clone(), url)),
            upload: self.upload.clone(),
        })
    }
}

// ── Blob ────────────────────────────────────────────────────────────

/// Client for one blob.
#[derive(Debug, Clone)]
pub struct BlobClient {
    parts: BlobUrlParts,
    transport: Arc<HttpBlobTransport>,
    upload: UploadConfig,
}

impl BlobClient {
    pub fn url(&self) -> &Url {
        self.transport.url()
    }

    pub fn container_name(&self) -> &str {
        self.parts.container_name.as_deref().unwrap_or_default()
    }

    pub fn name(&self) -> &str {
        self.parts.blob_name.as_deref().unwrap_or_default()
    }

    /// The transport the output streams of this blob write through.
    pub fn transport(&self) -> Arc<HttpBlobTransport> {
        Arc::clone(&self.transport)
    }

    pub async fn create_append_blob(
        &self,
        headers: &BlobHttpHeaders,
        metadata: &BTreeMap<String, String>,
        conditions: &BlobAccessConditions,
    ) -> Result<String, BlobError> {
        self.transport
            .create_append_blob(headers, metadata, conditions)
            .await
    }

    /// Create a zero-filled page blob; `size` must be a multiple of 512.
    pub async fn create_page_blob(
        &self,
        size: u64,
        headers: &BlobHttpHeaders,
        metadata: &BTreeMap<String, String>,
        conditions: &BlobAccessConditions,
    ) -> Result<String, BlobError> {
        self.transport
            .create_page_blob(size, headers, metadata, conditions)
            .await
    }

    pub async fn delete(&self, conditions: &BlobAccessConditions) -> Result<(), BlobError> {
        self.transport.delete(conditions).await
    }

    pub async fn download(&self, conditions: &BlobAccessConditions) -> Result<Bytes, BlobError> {
        self.transport.download(conditions).await
    }

    pub async fn get_properties(&self) -> Result<BlobProperties, BlobError> {
        self.transport.get_properties().await
    }

    // -- Output streams -------------------------------------------------

    /// Append stream options seeded from the client's upload settings.
    pub fn append_stream_options(
        &self,
        conditions: AppendBlobAccessConditions,
    ) -> AppendStreamOptions {
        AppendStreamOptions {
            block_size: self.upload.block_size,
            max_buffers: self.upload.max_buffers,
            timeout: self.upload.timeout(),
            conditions,
        }
    }

    /// Block stream options seeded from the client's upload settings.
    pub fn block_stream_options(&self) -> BlockStreamOptions {
        BlockStreamOptions {
            block_size: self.upload.block_size,
            max_buffers: self.upload.max_buffers,
            timeout: self.upload.timeout(),
            ..Default::default()
        }
    }

    /// Page stream options seeded from the client's upload settings.
    pub fn page_stream_options(&self) -> PageStreamOptions {
        PageStreamOptions {
            block_size: self.upload.block_size,
            max_buffers: self.upload.max_buffers,
            timeout: self.upload.timeout(),
            ..Default::default()
        }
    }

    /// Stream appending to this (existing) append blob.
    pub async fn append_output_stream(
        &self,
        options: AppendStreamOptions,
    ) -> Result<BlobOutputStream, BlobError> {
        debug!("Append stream for {}", self.url().path());
        BlobOutputStream::append(self.transport.clone(), options).await
    }

    /// Stream replacing this blob's content with a committed block list.
    pub fn block_output_stream(
        &self,
        options: BlockStreamOptions,
    ) -> Result<BlobOutputStream, BlobError> {
        debug!("Block stream for {}", self.url().path());
        BlobOutputStream::block(self.transport.clone(), options)
    }

    /// Stream writing `range` of this (existing) page blob.
    pub fn page_output_stream(
        &self,
        range: PageRange,
        options: PageStreamOptions,
    ) -> Result<BlobOutputStream, BlobError> {
        debug!("Page stream for {} over {}", self.url().path(), range);
        BlobOutputStream::page(self.transport.clone(), range, options)
    }

    /// Sign a SAS for this blob.  Container and blob names in `values` are
    /// replaced by this blob's.
    pub fn generate_sas(
        &self,
        values: &BlobSasSignatureValues,
    ) -> Result<SasQueryParameters, BlobError> {
        let key = shared_key(self.transport.pipeline())?;
        let mut values = values.clone();
        values.container_name = Some(self.container_name().to_string());
        values.blob_name = Some(self.name().to_string());
        values.sign_with_shared_key(key)
    }

    /// This blob's URL with `sas` as its query.
    pub fn sas_url(&self, sas: &SasQueryParameters) -> Result<Url, BlobError> {
        let mut parts = self.parts.clone();
        parts.sas_query_parameters = sas.clone();
        parts.to_url()
    }
}
