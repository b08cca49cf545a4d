//! Configuration loading and types for the blob client.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`ClientConfig`] struct.  Each subsection governs a different part of
//! the client: the storage account, chunked uploads, the HTTP client and
//! logging.  Every field has a default, so an empty file is valid.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::auth::{
    ConnectionString, SharedKeyCredential, StorageCredential, DEFAULT_ENDPOINT_SUFFIX,
};
use crate::errors::BlobError;
use crate::models::DEFAULT_BLOCK_SIZE;
use crate::upload::output_stream::MIN_BUFFERS;

/// Environment variable holding the account key.
pub const ENV_STORAGE_KEY: &str = "AZURE_STORAGE_KEY";
/// Environment variable holding a full connection string.
pub const ENV_CONNECTION_STRING: &str = "AZURE_STORAGE_CONNECTION_STRING";
/// Environment variable holding a SAS token.
pub const ENV_SAS_TOKEN: &str = "AZURE_STORAGE_SAS_TOKEN";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientConfig {
    /// Storage account and credentials.
    #[serde(default)]
    pub account: AccountConfig,

    /// Chunked upload settings.
    #[serde(default)]
    pub upload: UploadConfig,

    /// HTTP client settings.
    #[serde(default)]
    pub http: HttpConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Storage account configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccountConfig {
    /// Storage account name.
    #[serde(default)]
    pub name: Option<String>,

    /// Base64 account key (Shared Key auth).
    #[serde(default)]
    pub key: Option<String>,

    /// SAS token, with or without the leading `?`.
    #[serde(default)]
    pub sas_token: Option<String>,

    /// Connection string; supplies name, key, endpoint or SAS when the
    /// fields above are absent.
    #[serde(default)]
    pub connection_string: Option<String>,

    /// Blob service endpoint, e.g. `http://127.0.0.1:10000/devstoreaccount1`.
    /// Derived from the account name when unset.
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Chunked upload configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Bytes per dispatched chunk.
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    /// Buffers per output stream (at least 2).
    #[serde(default = "default_max_buffers")]
    pub max_buffers: usize,

    /// Upper bound in seconds on each stream write/close.  0 disables it.
    #[serde(default)]
    pub timeout_seconds: u64,

    /// Send a transactional Content-MD5 with every chunk.
    #[serde(default)]
    pub compute_md5: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            max_buffers: default_max_buffers(),
            timeout_seconds: 0,
            compute_md5: false,
        }
    }
}

impl UploadConfig {
    /// The per-call stream timeout, if any.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_seconds > 0).then(|| Duration::from_secs(self.timeout_seconds))
    }
}

/// HTTP client configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Whole-request timeout in seconds.
    #[serde(default = "default_http_timeout")]
    pub timeout_seconds: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_http_timeout(),
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_block_size() -> usize {
    DEFAULT_BLOCK_SIZE
}

fn default_max_buffers() -> usize {
    MIN_BUFFERS
}

fn default_http_timeout() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Resolution --------------------------------------------------------------

impl ClientConfig {
    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<(), BlobError> {
        if self.upload.max_buffers < MIN_BUFFERS {
            return Err(BlobError::Config {
                message: format!(
                    "upload.max_buffers must be at least {MIN_BUFFERS}, got {}",
                    self.upload.max_buffers
                ),
            });
        }
        if self.upload.block_size == 0 {
            return Err(BlobError::Config {
                message: "upload.block_size must be positive".to_string(),
            });
        }
        if self.account.key.is_some() && self.account_name().is_none() {
            return Err(BlobError::Config {
                message: "account.key requires account.name".to_string(),
            });
        }
        Ok(())
    }

    fn connection_string(&self) -> Result<Option<ConnectionString>, BlobError> {
        self.account
            .connection_string
            .as_deref()
            .map(ConnectionString::parse)
            .transpose()
    }

    /// Account name from `account.name`, else from the connection string.
    pub fn account_name(&self) -> Option<String> {
        self.account.name.clone().or_else(|| {
            self.connection_string()
                .ok()
                .flatten()
                .and_then(|cs| cs.account_name)
        })
    }

    /// Blob service endpoint without a trailing slash.
    pub fn resolve_endpoint(&self) -> Result<String, BlobError> {
        if let Some(endpoint) = &self.account.endpoint {
            return Ok(endpoint.trim_end_matches('/').to_string());
        }
        if let Some(cs) = self.connection_string()? {
            return cs.blob_endpoint();
        }
        match &self.account.name {
            Some(name) => Ok(format!("https://{name}.blob.{DEFAULT_ENDPOINT_SUFFIX}")),
            None => Err(BlobError::Config {
                message: "Set account.endpoint, account.name or account.connection_string"
                    .to_string(),
            }),
        }
    }

    /// Resolve credentials from the config, then the environment.
    ///
    /// Order: `account.key`, `account.connection_string`,
    /// `account.sas_token`, then `AZURE_STORAGE_KEY`,
    /// `AZURE_STORAGE_CONNECTION_STRING`, `AZURE_STORAGE_SAS_TOKEN`.
    /// Falls back to anonymous access.
    pub fn resolve_credential(&self) -> Result<StorageCredential, BlobError> {
        self.resolve_credential_with(|name| std::env::var(name).ok())
    }

    /// [`resolve_credential`](Self::resolve_credential) with an explicit
    /// environment lookup.
    pub fn resolve_credential_with<F>(&self, env: F) -> Result<StorageCredential, BlobError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let account_name = self.account_name();

        if let (Some(name), Some(key)) = (&account_name, &self.account.key) {
            return Ok(StorageCredential::SharedKey(SharedKeyCredential::new(
                name.clone(),
                key,
            )?));
        }
        if let Some(cs) = self.connection_string()? {
            if let credential @ (StorageCredential::SharedKey(_) | StorageCredential::SasToken(_)) =
                cs.credential()?
            {
                return Ok(credential);
            }
        }
        if let Some(token) = &self.account.sas_token {
            return Ok(StorageCredential::sas_token(token));
        }

        if let (Some(name), Some(key)) = (&account_name, env(ENV_STORAGE_KEY)) {
            return Ok(StorageCredential::SharedKey(SharedKeyCredential::new(
                name.clone(),
                &key,
            )?));
        }
        if let Some(conn_str) = env(ENV_CONNECTION_STRING) {
            return ConnectionString::parse(&conn_str)?.credential();
        }
        if let Some(token) = env(ENV_SAS_TOKEN) {
            return Ok(StorageCredential::sas_token(&token));
        }
        Ok(StorageCredential::Anonymous)
    }
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<ClientConfig> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: ClientConfig = serde_yaml::from_str(&contents)?;
    config.validate()?;
    Ok(config)
}
