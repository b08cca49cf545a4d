//! Azure Storage Shared Key authentication.
//!
//! Requests authorised with the account key carry
//! `Authorization: SharedKey {account}:{signature}` where the signature is
//! the base64 HMAC-SHA256 of a canonical string built from the request:
//!
//! ```text
//! VERB\n
//! Content-Encoding\n
//! Content-Language\n
//! Content-Length\n
//! Content-MD5\n
//! Content-Type\n
//! Date\n
//! If-Modified-Since\n
//! If-Match\n
//! If-None-Match\n
//! If-Unmodified-Since\n
//! Range\n
//! CanonicalizedHeaders
//! CanonicalizedResource
//! ```
//!
//! The same HMAC helper signs SAS tokens (see [`crate::sas`]).

use std::collections::BTreeMap;
use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use url::Url;

use crate::errors::BlobError;

type HmacSha256 = Hmac<Sha256>;

/// Storage service REST version sent as `x-ms-version`.
pub const STORAGE_API_VERSION: &str = "2019-02-02";

/// Default DNS suffix of the public cloud.
pub const DEFAULT_ENDPOINT_SUFFIX: &str = "core.windows.net";

// ── HMAC ────────────────────────────────────────────────────────────

/// Compute HMAC-SHA256.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, BlobError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| BlobError::invalid_argument(format!("HMAC key error: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Base64 HMAC-SHA256 of `string_to_sign` under `key`.
pub fn compute_hmac_sha256(key: &[u8], string_to_sign: &str) -> Result<String, BlobError> {
    Ok(BASE64_STANDARD.encode(hmac_sha256(key, string_to_sign.as_bytes())?))
}

// ── Shared key credential ──────────────────────────────────────────

/// Account name plus decoded account key.
#[derive(Clone)]
pub struct SharedKeyCredential {
    account_name: String,
    account_key: Vec<u8>,
}

impl fmt::Debug for SharedKeyCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedKeyCredential")
            .field("account_name", &self.account_name)
            .field("account_key", &"<redacted>")
            .finish()
    }
}

impl SharedKeyCredential {
    /// Build a credential from the base64 account key shown in the portal.
    pub fn new(account_name: impl Into<String>, account_key: &str) -> Result<Self, BlobError> {
        let account_key = BASE64_STANDARD.decode(account_key.trim()).map_err(|e| {
            BlobError::invalid_argument(format!("Account key is not valid base64: {e}"))
        })?;
        Ok(Self {
            account_name: account_name.into(),
            account_key,
        })
    }

    pub fn account_name(&self) -> &str {
        &self.account_name
    }

    /// Sign `string_to_sign` with the account key.
    pub fn compute_hmac_sha256(&self, string_to_sign: &str) -> Result<String, BlobError> {
        compute_hmac_sha256(&self.account_key, string_to_sign)
    }

    /// Build the Shared Key string-to-sign for a request.
    ///
    /// `headers` are `(name, value)` pairs; names are matched
    /// case-insensitively.
    pub fn string_to_sign(&self, method: &str, url: &Url, headers: &[(String, String)]) -> String {
        let verb = method.to_uppercase();
        let header = |name: &str| find_header_value(headers, name).unwrap_or_default();

        // Since 2015-02-21 a zero Content-Length is signed as the empty string.
        let content_length = match header("Content-Length") {
            "0" => "",
            other => other,
        };

        // x-ms-date supersedes Date.
        let date = if find_header_value(headers, "x-ms-date").is_some() {
            ""
        } else {
            header("Date")
        };

        let fields = [
            verb.as_str(),
            header("Content-Encoding"),
            header("Content-Language"),
            content_length,
            header("Content-MD5"),
            header("Content-Type"),
            date,
            header("If-Modified-Since"),
            header("If-Match"),
            header("If-None-Match"),
            header("If-Unmodified-Since"),
            header("Range"),
        ];

        let mut string_to_sign: String = fields.iter().map(|f| format!("{f}\n")).collect();
        string_to_sign.push_str(&canonicalized_headers(headers));
        string_to_sign.push_str(&self.canonicalized_resource(url));
        string_to_sign
    }

    /// Compute the `Authorization` header value for a request.
    pub fn sign_request(
        &self,
        method: &str,
        url: &Url,
        headers: &[(String, String)],
    ) -> Result<String, BlobError> {
        let string_to_sign = self.string_to_sign(method, url, headers);
        let signature = self.compute_hmac_sha256(&string_to_sign)?;
        Ok(format!("SharedKey {}:{}", self.account_name, signature))
    }

    /// `/{account}{path}` followed by one `\nname:values` line per query
    /// parameter, names lowercased and sorted, repeated values joined by `,`.
    fn canonicalized_resource(&self, url: &Url) -> String {
        let path = if url.path().is_empty() { "/" } else { url.path() };
        let mut resource = format!("/{}{}", self.account_name, path);

        let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (k, v) in url.query_pairs() {
            params
                .entry(k.to_lowercase())
                .or_default()
                .push(v.into_owned());
        }
        for (name, mut values) in params {
            values.sort();
            resource.push('\n');
            resource.push_str(&name);
            resource.push(':');
            resource.push_str(&values.join(","));
        }
        resource
    }
}

/// Sorted `x-ms-*` headers, one `name:value\n` line each.
fn canonicalized_headers(headers: &[(String, String)]) -> String {
    let mut ms_headers: Vec<(String, String)> = headers
        .iter()
        .map(|(k, v)| (k.to_lowercase(), v.trim().to_string()))
        .filter(|(k, _)| k.starts_with("x-ms-"))
        .collect();
    ms_headers.sort_by(|a, b| a.0.cmp(&b.0));

    ms_headers
        .iter()
        .map(|(k, v)| format!("{k}:{v}\n"))
        .collect()
}

/// Find a header value by case-insensitive name.
fn find_header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

// ── Credentials ────────────────────────────────────────────────────

/// How requests are authorised.
#[derive(Debug, Clone)]
pub enum StorageCredential {
    /// Shared Key authentication using the storage account key.
    SharedKey(SharedKeyCredential),
    /// SAS token appended to every request URL (no leading `?`).
    SasToken(String),
    /// Public access.
    Anonymous,
}

impl StorageCredential {
    /// SAS token credential, tolerating a leading `?`.
    pub fn sas_token(token: &str) -> Self {
        StorageCredential::SasToken(token.strip_prefix('?').unwrap_or(token).to_string())
    }
}

// ── Connection strings ─────────────────────────────────────────────

/// Parsed `Key=Value;...` storage connection string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionString {
    pub account_name: Option<String>,
    pub account_key: Option<String>,
    pub blob_endpoint: Option<String>,
    pub default_endpoints_protocol: Option<String>,
    pub endpoint_suffix: Option<String>,
    pub shared_access_signature: Option<String>,
}

impl ConnectionString {
    /// Parse a connection string.  Unknown keys are ignored.
    pub fn parse(conn_str: &str) -> Result<Self, BlobError> {
        let mut parsed = ConnectionString::default();
        for part in conn_str.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (key, value) = part.split_once('=').ok_or_else(|| {
                BlobError::invalid_argument(format!(
                    "Connection string segment is not Key=Value: {part}"
                ))
            })?;
            let value = Some(value.to_string());
            match key {
                "AccountName" => parsed.account_name = value,
                "AccountKey" => parsed.account_key = value,
                "BlobEndpoint" => parsed.blob_endpoint = value,
                "DefaultEndpointsProtocol" => parsed.default_endpoints_protocol = value,
                "EndpointSuffix" => parsed.endpoint_suffix = value,
                "SharedAccessSignature" => parsed.shared_access_signature = value,
                _ => {}
            }
        }
        if parsed.account_name.is_none() && parsed.blob_endpoint.is_none() {
            return Err(BlobError::invalid_argument(
                "Connection string needs AccountName or BlobEndpoint",
            ));
        }
        Ok(parsed)
    }

    /// Blob service endpoint, derived from the account name when
    /// `BlobEndpoint` is absent.
    pub fn blob_endpoint(&self) -> Result<String, BlobError> {
        if let Some(endpoint) = &self.blob_endpoint {
            return Ok(endpoint.trim_end_matches('/').to_string());
        }
        let account = self.account_name.as_deref().ok_or_else(|| {
            BlobError::invalid_argument("Connection string is missing AccountName")
        })?;
        let protocol = self.default_endpoints_protocol.as_deref().unwrap_or("https");
        let suffix = self
            .endpoint_suffix
            .as_deref()
            .unwrap_or(DEFAULT_ENDPOINT_SUFFIX);
        Ok(format!("{protocol}://{account}.blob.{suffix}"))
    }

    /// Credential described by the connection string.
    pub fn credential(&self) -> Result<StorageCredential, BlobError> {
        match (&self.account_name, &self.account_key, &self.shared_access_signature) {
            (Some(name), Some(key), _) => Ok(StorageCredential::SharedKey(
                SharedKeyCredential::new(name.clone(), key)?,
            )),
            (_, _, Some(sas)) => Ok(StorageCredential::sas_token(sas)),
            _ => Ok(StorageCredential::Anonymous),
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────
