//! Blob transport over the Azure Blob REST API.
//!
//! Requests are built with `reqwest`, stamped with `x-ms-date` and
//! `x-ms-version`, and authorised either with a Shared Key signature or by
//! appending a SAS token to the query string.
//!
//! Operation mapping:
//!   `get_properties()`    -> HEAD  {blob}
//!   `stage_block()`       -> PUT   {blob}?comp=block&blockid=...
//!   `append_block()`      -> PUT   {blob}?comp=appendblock
//!   `upload_pages()`      -> PUT   {blob}?comp=page  (x-ms-page-write: update)
//!   `commit_block_list()` -> PUT   {blob}?comp=blocklist
//!
//! Non-2xx responses become [`BlobError::Service`] carrying the
//! `x-ms-error-code` header, or the `<Code>` of the XML error body when
//! the header is absent.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use reqwest::header::HeaderMap;
use reqwest::{Method, Response};
use tracing::{debug, warn};
use url::Url;

use super::backend::{BlobTransport, TransportFuture};
use crate::auth::{StorageCredential, STORAGE_API_VERSION};
use crate::errors::BlobError;
use crate::models::{
    metadata_headers, AppendBlobAccessConditions, AppendBlockResult, BlobAccessConditions,
    BlobHttpHeaders, BlobProperties, BlobType, BlockBlobCommitResult, LeaseAccessConditions,
    PageBlobAccessConditions, PageRange, PageUploadResult, PAGE_BYTES,
};
use crate::xml;

/// Default whole-request timeout for the HTTP client.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(300);

// ── Pipeline ────────────────────────────────────────────────────────

/// Shared HTTP plumbing: client, credential and per-request policies.
#[derive(Debug, Clone)]
pub struct HttpPipeline {
    client: reqwest::Client,
    credential: StorageCredential,
    /// Send a transactional `Content-MD5` with every request body.
    compute_md5: bool,
}

impl HttpPipeline {
    /// Build a pipeline with its own `reqwest` client.
    pub fn new(credential: StorageCredential, timeout: Duration) -> Result<Self, BlobError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BlobError::Config {
                message: format!("Failed to create HTTP client: {e}"),
            })?;
        Ok(Self::with_client(client, credential))
    }

    /// Build a pipeline around an existing client.
    pub fn with_client(client: reqwest::Client, credential: StorageCredential) -> Self {
        Self {
            client,
            credential,
            compute_md5: false,
        }
    }

    pub fn with_compute_md5(mut self, compute_md5: bool) -> Self {
        self.compute_md5 = compute_md5;
        self
    }

    pub fn credential(&self) -> &StorageCredential {
        &self.credential
    }

    /// Get the current UTC date in RFC 1123 format for `x-ms-date`.
    fn rfc1123_date() -> String {
        httpdate::fmt_http_date(SystemTime::now())
    }

    /// Base64 MD5 digest, as sent in `Content-MD5`.
    fn compute_md5(data: &[u8]) -> String {
        let mut hasher = Md5::new();
        hasher.update(data);
        BASE64_STANDARD.encode(hasher.finalize())
    }

    /// Append the SAS token to the query string when using SAS auth.
    fn maybe_append_sas(&self, url: &mut Url) {
        if let StorageCredential::SasToken(token) = &self.credential {
            let query = match url.query() {
                Some(existing) if !existing.is_empty() => format!("{existing}&{token}"),
                _ => token.clone(),
            };
            url.set_query(Some(&query));
        }
    }

    /// Send one request and map non-success statuses to [`BlobError::Service`].
    ///
    /// `query` is appended to `base` (values are percent-encoded); `headers`
    /// are sent as-is and participate in the Shared Key signature.
    pub async fn send(
        &self,
        method: Method,
        base: &Url,
        query: &[(&str, &str)],
        mut headers: Vec<(String, String)>,
        body: Option<Vec<u8>>,
    ) -> Result<Response, BlobError> {
        let mut url = base.clone();
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in query {
                pairs.append_pair(k, v);
            }
        }

        headers.push(("x-ms-date".to_string(), Self::rfc1123_date()));
        headers.push(("x-ms-version".to_string(), STORAGE_API_VERSION.to_string()));
        if let Some(body) = &body {
            if self.compute_md5 && !body.is_empty() {
                headers.push(("Content-MD5".to_string(), Self::compute_md5(body)));
            }
        }

        let authorization = match &self.credential {
            StorageCredential::SharedKey(key) => {
                // reqwest derives Content-Length from the body; the signature
                // still has to cover it.
                let mut signed = headers.clone();
                let length = body.as_ref().map_or(0, Vec::len);
                signed.push(("Content-Length".to_string(), length.to_string()));
                Some(key.sign_request(method.as_str(), &url, &signed)?)
            }
            StorageCredential::SasToken(_) | StorageCredential::Anonymous => None,
        };
        self.maybe_append_sas(&mut url);

        debug!("Blob request: {} {}", method, url.path());

        let mut req = self.client.request(method.clone(), url.as_str());
        for (name, value) in &headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if let Some(auth) = authorization {
            req = req.header("Authorization", auth);
        }
        if let Some(body) = body {
            req = req.body(body);
        }

        let resp = req.send().await?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        Err(Self::map_error(method.as_str(), resp).await)
    }

    /// Map an error response to a service error with its storage code.
    async fn map_error(context: &str, resp: Response) -> BlobError {
        let status = resp.status();
        let header_code = header_string(resp.headers(), "x-ms-error-code");
        let body = resp.text().await.unwrap_or_default();

        let parsed = if body.is_empty() {
            xml::StorageErrorBody::default()
        } else {
            xml::parse_storage_error(&body).unwrap_or_else(|e| {
                warn!("Unparseable error body for {}: {}", context, e);
                xml::StorageErrorBody::default()
            })
        };
        let code = header_code
            .or(parsed.code)
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("Unknown").to_string());
        let message = parsed.message.unwrap_or_else(|| {
            if body.is_empty() {
                format!("{context} failed with HTTP {status}")
            } else {
                body
            }
        });
        debug!("Blob {} failed: HTTP {} {}", context, status, code);
        BlobError::Service {
            status,
            code,
            message,
        }
    }
}

// ── Response helpers ────────────────────────────────────────────────

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    header_string(headers, name).and_then(|v| v.parse().ok())
}

fn header_date(headers: &HeaderMap, name: &str) -> Option<DateTime<Utc>> {
    header_string(headers, name)
        .and_then(|v| httpdate::parse_http_date(&v).ok())
        .map(DateTime::<Utc>::from)
}

fn etag(headers: &HeaderMap) -> String {
    header_string(headers, "ETag").unwrap_or_default()
}

/// Collect `x-ms-meta-*` response headers.
fn metadata(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let key = name.as_str().strip_prefix("x-ms-meta-")?;
            Some((key.to_string(), value.to_str().ok()?.to_string()))
        })
        .collect()
}

/// Build [`BlobProperties`] from Get Blob Properties response headers.
pub fn parse_properties(headers: &HeaderMap) -> Result<BlobProperties, BlobError> {
    let blob_type = header_string(headers, "x-ms-blob-type")
        .and_then(|v| BlobType::parse(&v))
        .ok_or_else(|| BlobError::io("Blob properties response is missing x-ms-blob-type"))?;
    Ok(BlobProperties {
        blob_type,
        content_length: header_u64(headers, "Content-Length").unwrap_or(0),
        etag: etag(headers),
        last_modified: header_date(headers, "Last-Modified"),
        content_type: header_string(headers, "Content-Type"),
        committed_block_count: header_u64(headers, "x-ms-blob-committed-block-count")
            .map(|n| n as u32),
        sequence_number: header_u64(headers, "x-ms-blob-sequence-number"),
        metadata: metadata(headers),
    })
}

// ── Transport ───────────────────────────────────────────────────────

/// [`BlobTransport`] for one blob URL.
#[derive(Debug, Clone)]
pub struct HttpBlobTransport {
    pipeline: HttpPipeline,
    /// Blob URL without SAS parameters.
    url: Url,
}

impl HttpBlobTransport {
    pub fn new(pipeline: HttpPipeline, url: Url) -> Self {
        Self { pipeline, url }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn pipeline(&self) -> &HttpPipeline {
        &self.pipeline
    }

    /// Create (or replace) an empty append blob.
    pub async fn create_append_blob(
        &self,
        headers: &BlobHttpHeaders,
        meta: &BTreeMap<String, String>,
        conditions: &BlobAccessConditions,
    ) -> Result<String, BlobError> {
        let mut request_headers = vec![("x-ms-blob-type".to_string(), "AppendBlob".to_string())];
        request_headers.extend(headers.to_headers());
        request_headers.extend(metadata_headers(meta));
        request_headers.extend(conditions.to_headers());

        let resp = self
            .pipeline
            .send(Method::PUT, &self.url, &[], request_headers, Some(Vec::new()))
            .await?;
        debug!("Created append blob {}", self.url.path());
        Ok(etag(resp.headers()))
    }

    /// Create (or replace) a zero-filled page blob of `size` bytes.
    pub async fn create_page_blob(
        &self,
        size: u64,
        headers: &BlobHttpHeaders,
        meta: &BTreeMap<String, String>,
        conditions: &BlobAccessConditions,
    ) -> Result<String, BlobError> {
        if size % PAGE_BYTES != 0 {
            return Err(BlobError::invalid_argument(format!(
                "Page blob size must be a multiple of 512: {size}"
            )));
        }
        let mut request_headers = vec![
            ("x-ms-blob-type".to_string(), "PageBlob".to_string()),
            ("x-ms-blob-content-length".to_string(), size.to_string()),
        ];
        request_headers.extend(headers.to_headers());
        request_headers.extend(metadata_headers(meta));
        request_headers.extend(conditions.to_headers());

        let resp = self
            .pipeline
            .send(Method::PUT, &self.url, &[], request_headers, Some(Vec::new()))
            .await?;
        debug!("Created page blob {} ({} bytes)", self.url.path(), size);
        Ok(etag(resp.headers()))
    }

    /// Download the whole blob.
    pub async fn download(&self, conditions: &BlobAccessConditions) -> Result<Bytes, BlobError> {
        let resp = self
            .pipeline
            .send(Method::GET, &self.url, &[], conditions.to_headers(), None)
            .await?;
        Ok(resp.bytes().await?)
    }

    /// Delete the blob and its snapshots.
    pub async fn delete(&self, conditions: &BlobAccessConditions) -> Result<(), BlobError> {
        let mut headers = vec![("x-ms-delete-snapshots".to_string(), "include".to_string())];
        headers.extend(conditions.to_headers());
        self.pipeline
            .send(Method::DELETE, &self.url, &[], headers, None)
            .await?;
        debug!("Deleted blob {}", self.url.path());
        Ok(())
    }

    async fn http_get_properties(&self) -> Result<BlobProperties, BlobError> {
        let resp = self
            .pipeline
            .send(Method::HEAD, &self.url, &[], Vec::new(), None)
            .await?;
        parse_properties(resp.headers())
    }

    async fn http_stage_block(
        &self,
        block_id: &str,
        data: &[u8],
        lease: &LeaseAccessConditions,
    ) -> Result<(), BlobError> {
        let query = [("comp", "block"), ("blockid", block_id)];
        self.pipeline
            .send(Method::PUT, &self.url, &query, lease.to_headers(), Some(data.to_vec()))
            .await?;
        Ok(())
    }

    async fn http_append_block(
        &self,
        data: &[u8],
        conditions: &AppendBlobAccessConditions,
    ) -> Result<AppendBlockResult, BlobError> {
        let query = [("comp", "appendblock")];
        let resp = self
            .pipeline
            .send(Method::PUT, &self.url, &query, conditions.to_headers(), Some(data.to_vec()))
            .await?;
        let headers = resp.headers();
        Ok(AppendBlockResult {
            blob_append_offset: header_u64(headers, "x-ms-blob-append-offset").unwrap_or(0),
            blob_committed_block_count: header_u64(headers, "x-ms-blob-committed-block-count")
                .unwrap_or(0) as u32,
            etag: etag(headers),
        })
    }

    async fn http_upload_pages(
        &self,
        range: PageRange,
        data: &[u8],
        conditions: &PageBlobAccessConditions,
    ) -> Result<PageUploadResult, BlobError> {
        if data.len() as u64 != range.length() {
            return Err(BlobError::invalid_argument(format!(
                "Page data of {} bytes does not match range {}",
                data.len(),
                range
            )));
        }
        let query = [("comp", "page")];
        let mut headers = vec![
            ("x-ms-page-write".to_string(), "update".to_string()),
            ("x-ms-range".to_string(), range.to_header_value()),
        ];
        headers.extend(conditions.to_headers());
        let resp = self
            .pipeline
            .send(Method::PUT, &self.url, &query, headers, Some(data.to_vec()))
            .await?;
        let headers = resp.headers();
        Ok(PageUploadResult {
            etag: etag(headers),
            sequence_number: header_u64(headers, "x-ms-blob-sequence-number").unwrap_or(0),
        })
    }

    async fn http_commit_block_list(
        &self,
        block_ids: &[String],
        http_headers: &BlobHttpHeaders,
        meta: &BTreeMap<String, String>,
        conditions: &BlobAccessConditions,
    ) -> Result<BlockBlobCommitResult, BlobError> {
        let body = xml::render_block_list(block_ids)?.into_bytes();
        let query = [("comp", "blocklist")];
        let mut headers = vec![("Content-Type".to_string(), "application/xml".to_string())];
        headers.extend(http_headers.to_headers());
        headers.extend(metadata_headers(meta));
        headers.extend(conditions.to_headers());

        let resp = self
            .pipeline
            .send(Method::PUT, &self.url, &query, headers, Some(body))
            .await?;
        let headers = resp.headers();
        Ok(BlockBlobCommitResult {
            etag: etag(headers),
            last_modified: header_date(headers, "Last-Modified"),
        })
    }
}

impl BlobTransport for HttpBlobTransport {
    fn get_properties(&self) -> TransportFuture<'_, BlobProperties> {
        Box::pin(async move {
            debug!("Blob get_properties: {}", self.url.path());
            self.http_get_properties().await
        })
    }

    fn stage_block<'a>(
        &'a self,
        block_id: &'a str,
        data: &'a [u8],
        lease: &'a LeaseAccessConditions,
    ) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            debug!(
                "Blob stage_block: blob={} block_id={} size={}",
                self.url.path(),
                block_id,
                data.len()
            );
            self.http_stage_block(block_id, data, lease).await
        })
    }

    fn append_block<'a>(
        &'a self,
        data: &'a [u8],
        conditions: &'a AppendBlobAccessConditions,
    ) -> TransportFuture<'a, AppendBlockResult> {
        Box::pin(async move {
            debug!(
                "Blob append_block: blob={} size={} appendpos={:?}",
                self.url.path(),
                data.len(),
                conditions.append_position.append_position
            );
            self.http_append_block(data, conditions).await
        })
    }

    fn upload_pages<'a>(
        &'a self,
        range: PageRange,
        data: &'a [u8],
        conditions: &'a PageBlobAccessConditions,
    ) -> TransportFuture<'a, PageUploadResult> {
        Box::pin(async move {
            debug!("Blob upload_pages: blob={} range={}", self.url.path(), range);
            self.http_upload_pages(range, data, conditions).await
        })
    }

    fn commit_block_list<'a>(
        &'a self,
        block_ids: &'a [String],
        headers: &'a BlobHttpHeaders,
        metadata: &'a BTreeMap<String, String>,
        conditions: &'a BlobAccessConditions,
    ) -> TransportFuture<'a, BlockBlobCommitResult> {
        Box::pin(async move {
            debug!(
                "Blob commit_block_list: blob={} blocks={}",
                self.url.path(),
                block_ids.len()
            );
            self.http_commit_block_list(block_ids, headers, metadata, conditions)
                .await
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderName, HeaderValue};

    fn header_map(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    fn anonymous_pipeline() -> HttpPipeline {
        HttpPipeline::with_client(reqwest::Client::new(), StorageCredential::Anonymous)
    }

    #[test]
    fn test_compute_md5_hello() {
        assert_eq!(HttpPipeline::compute_md5(b"hello"), "XUFAKrxLKna5cZ2REBfFkg==");
    }

    #[test]
    fn test_rfc1123_date_format() {
        let date = HttpPipeline::rfc1123_date();
        assert!(date.ends_with(" GMT"));
        assert!(httpdate::parse_http_date(&date).is_ok());
    }

    #[test]
    fn test_sas_appended_to_query() {
        let pipeline = HttpPipeline::with_client(
            reqwest::Client::new(),
            StorageCredential::sas_token("?sv=2019-02-02&sig=abc"),
        );
        let mut url = Url::parse("https://acct.blob.core.windows.net/c/b?comp=block").unwrap();
        pipeline.maybe_append_sas(&mut url);
        assert_eq!(url.query(), Some("comp=block&sv=2019-02-02&sig=abc"));

        let mut bare = Url::parse("https://acct.blob.core.windows.net/c/b").unwrap();
        pipeline.maybe_append_sas(&mut bare);
        assert_eq!(bare.query(), Some("sv=2019-02-02&sig=abc"));
    }

    #[test]
    fn test_shared_key_leaves_url_alone() {
        let pipeline = anonymous_pipeline();
        let mut url = Url::parse("https://acct.blob.core.windows.net/c/b").unwrap();
        pipeline.maybe_append_sas(&mut url);
        assert_eq!(url.query(), None);
    }

    #[test]
    fn test_parse_properties() {
        let headers = header_map(&[
            ("x-ms-blob-type", "AppendBlob"),
            ("content-length", "1024"),
            ("etag", "\"0x8D\""),
            ("last-modified", "Sun, 06 Nov 1994 08:49:37 GMT"),
            ("content-type", "text/plain"),
            ("x-ms-blob-committed-block-count", "3"),
            ("x-ms-meta-owner", "alice"),
        ]);
        let props = parse_properties(&headers).unwrap();
        assert_eq!(props.blob_type, BlobType::AppendBlob);
        assert_eq!(props.content_length, 1024);
        assert_eq!(props.etag, "\"0x8D\"");
        assert_eq!(
            props.last_modified.unwrap().to_rfc3339(),
            "1994-11-06T08:49:37+00:00"
        );
        assert_eq!(props.committed_block_count, Some(3));
        assert_eq!(props.metadata.get("owner").map(String::as_str), Some("alice"));
    }

    #[test]
    fn test_parse_properties_requires_blob_type() {
        let headers = header_map(&[("content-length", "1")]);
        assert!(parse_properties(&headers).is_err());
    }

    #[tokio::test]
    async fn test_upload_pages_rejects_length_mismatch_locally() {
        let transport = HttpBlobTransport::new(
            anonymous_pipeline(),
            Url::parse("http://127.0.0.1:9/acct/c/b").unwrap(),
        );
        let err = transport
            .upload_pages(
                PageRange::new(0, 511).unwrap(),
                &[0u8; 100],
                &PageBlobAccessConditions::default(),
            )
            .await
            .unwrap_err();
        assert!(err.is_argument_error());
    }

    #[tokio::test]
    async fn test_create_page_blob_rejects_unaligned_size() {
        let transport = HttpBlobTransport::new(
            anonymous_pipeline(),
            Url::parse("http://127.0.0.1:9/acct/c/b").unwrap(),
        );
        let err = transport
            .create_page_blob(
                1000,
                &BlobHttpHeaders::default(),
                &BTreeMap::new(),
                &BlobAccessConditions::default(),
            )
            .await
            .unwrap_err();
        assert!(err.is_argument_error());
    }
}
