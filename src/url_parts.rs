//! Parsing and composing blob URLs.
//!
//! Two authority styles are recognised:
//!   DNS style: `https://{account}.blob.core.windows.net/{container}/{blob}`
//!   IP style:  `http://127.0.0.1:10000/{account}/{container}/{blob}`
//!
//! `snapshot` and `versionid` are lifted out of the query string, SAS
//! parameters are parsed into [`SasQueryParameters`], and whatever is left
//! is kept verbatim in `unparsed_parameters`.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use url::Url;

use crate::errors::BlobError;
use crate::sas::SasQueryParameters;

/// Percent-encoding set for blob names in URL paths: encode everything
/// except unreserved characters and '/'.
pub const BLOB_PATH_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// Percent-encoding set for individual query values.
const QUERY_VALUE_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Name of the implicit root container.
pub const ROOT_CONTAINER_NAME: &str = "$root";

const SNAPSHOT_PARAM: &str = "snapshot";
const VERSION_ID_PARAM: &str = "versionid";

/// The components of a blob service URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobUrlParts {
    pub scheme: String,
    /// Host, including the port when one was given.
    pub host: String,
    pub account_name: Option<String>,
    pub container_name: Option<String>,
    pub blob_name: Option<String>,
    pub snapshot: Option<String>,
    pub version_id: Option<String>,
    pub sas_query_parameters: SasQueryParameters,
    pub unparsed_parameters: BTreeMap<String, String>,
}

/// Whether `host` (optionally with `:port`) addresses the account in the
/// first path segment rather than in the DNS name.
pub fn is_ip_style_host(host: &str) -> bool {
    if host.starts_with('[') {
        return true;
    }
    let name = host.split_once(':').map(|(h, _)| h).unwrap_or(host);
    name.parse::<Ipv4Addr>().is_ok() || name.eq_ignore_ascii_case("localhost")
}

fn decode(value: &str) -> String {
    percent_decode_str(value).decode_utf8_lossy().into_owned()
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn take_param(params: &mut BTreeMap<String, String>, name: &str) -> Option<String> {
    let key = params.keys().find(|k| k.eq_ignore_ascii_case(name))?.clone();
    params.remove(&key)
}

impl BlobUrlParts {
    /// Split a URL into its blob service components.
    pub fn parse(url: &str) -> Result<Self, BlobError> {
        let parsed = Url::parse(url)
            .map_err(|e| BlobError::invalid_argument(format!("Invalid blob URL '{url}': {e}")))?;

        let host_name = parsed
            .host_str()
            .ok_or_else(|| BlobError::invalid_argument(format!("Blob URL has no host: {url}")))?;
        let host = match parsed.port() {
            Some(port) => format!("{host_name}:{port}"),
            None => host_name.to_string(),
        };

        let mut path = parsed.path().trim_start_matches('/');
        let account_name = if is_ip_style_host(&host) {
            let (account, rest) = path.split_once('/').unwrap_or((path, ""));
            path = rest;
            non_empty(&decode(account))
        } else {
            host_name.split('.').next().and_then(non_empty)
        };

        let (container_name, blob_name) = match path.split_once('/') {
            Some((container, blob)) => (non_empty(&decode(container)), non_empty(&decode(blob))),
            None => (non_empty(&decode(path)), None),
        };

        let mut params: BTreeMap<String, String> = BTreeMap::new();
        for (k, v) in parsed.query_pairs() {
            params
                .entry(k.into_owned())
                .and_modify(|existing| {
                    existing.push(',');
                    existing.push_str(&v);
                })
                .or_insert_with(|| v.to_string());
        }
        let snapshot = take_param(&mut params, SNAPSHOT_PARAM);
        let version_id = take_param(&mut params, VERSION_ID_PARAM);
        let sas_query_parameters = SasQueryParameters::from_query(&mut params);

        Ok(Self {
            scheme: parsed.scheme().to_string(),
            host,
            account_name,
            container_name,
            blob_name,
            snapshot,
            version_id,
            sas_query_parameters,
            unparsed_parameters: params,
        })
    }

    /// Compose the URL back from its parts.
    ///
    /// A blob without a container is addressed through the root container.
    pub fn to_url(&self) -> Result<Url, BlobError> {
        let mut path = String::new();
        if is_ip_style_host(&self.host) {
            if let Some(account) = &self.account_name {
                path.push('/');
                path.push_str(account);
            }
        }

        let container = self
            .container_name
            .as_deref()
            .or(self.blob_name.as_ref().map(|_| ROOT_CONTAINER_NAME));
        if let Some(container) = container {
            // Container names are restricted to [a-z0-9-] plus `$root`-style names.
            path.push('/');
            path.push_str(container);
            if let Some(blob) = &self.blob_name {
                // URL parsers collapse dot segments, encoded or not.
                if blob.split('/').any(|seg| seg == "." || seg == "..") {
                    return Err(BlobError::invalid_argument(format!(
                        "Blob name '{blob}' contains a '.' or '..' path segment"
                    )));
                }
                path.push('/');
                path.push_str(&utf8_percent_encode(blob, BLOB_PATH_ENCODE_SET).to_string());
            }
        }

        let mut query = Vec::new();
        let encode_value = |v: &str| utf8_percent_encode(v, QUERY_VALUE_ENCODE_SET).to_string();
        if let Some(snapshot) = &self.snapshot {
            query.push(format!("{SNAPSHOT_PARAM}={}", encode_value(snapshot)));
        }
        if let Some(version_id) = &self.version_id {
            query.push(format!("{VERSION_ID_PARAM}={}", encode_value(version_id)));
        }
        let sas = self.sas_query_parameters.encode();
        if !sas.is_empty() {
            query.push(sas);
        }
        for (k, v) in &self.unparsed_parameters {
            query.push(format!("{}={}", encode_value(k), encode_value(v)));
        }

        let mut url = format!("{}://{}{}", self.scheme, self.host, path);
        if !query.is_empty() {
            url.push('?');
            url.push_str(&query.join("&"));
        }
        Url::parse(&url)
            .map_err(|e| BlobError::invalid_argument(format!("Cannot build blob URL '{url}': {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dns_style_with_snapshot() {
        let parts = BlobUrlParts::parse(
            "https://acct.blob.core.windows.net/container/blob?snapshot=2020-01-01T00:00:00.0000000Z",
        )
        .unwrap();
        assert_eq!(parts.scheme, "https");
        assert_eq!(parts.host, "acct.blob.core.windows.net");
        assert_eq!(parts.account_name.as_deref(), Some("acct"));
        assert_eq!(parts.container_name.as_deref(), Some("container"));
        assert_eq!(parts.blob_name.as_deref(), Some("blob"));
        assert_eq!(
            parts.snapshot.as_deref(),
            Some("2020-01-01T00:00:00.0000000Z")
        );
        assert!(parts.sas_query_parameters.is_empty());

        let url = parts.to_url().unwrap();
        assert_eq!(url.host_str(), Some("acct.blob.core.windows.net"));
        assert_eq!(url.path(), "/container/blob");
        assert_eq!(BlobUrlParts::parse(url.as_str()).unwrap(), parts);
    }

    #[test]
    fn test_parse_ip_style() {
        let parts =
            BlobUrlParts::parse("http://127.0.0.1:10000/devstoreaccount1/container/dir/blob.txt")
                .unwrap();
        assert_eq!(parts.host, "127.0.0.1:10000");
        assert_eq!(parts.account_name.as_deref(), Some("devstoreaccount1"));
        assert_eq!(parts.container_name.as_deref(), Some("container"));
        assert_eq!(parts.blob_name.as_deref(), Some("dir/blob.txt"));
        assert_eq!(
            parts.to_url().unwrap().as_str(),
            "http://127.0.0.1:10000/devstoreaccount1/container/dir/blob.txt"
        );
    }

    #[test]
    fn test_parse_account_only() {
        let parts = BlobUrlParts::parse("https://acct.blob.core.windows.net").unwrap();
        assert_eq!(parts.account_name.as_deref(), Some("acct"));
        assert!(parts.container_name.is_none());
        assert!(parts.blob_name.is_none());

        let container = BlobUrlParts::parse("https://acct.blob.core.windows.net/container").unwrap();
        assert_eq!(container.container_name.as_deref(), Some("container"));
        assert!(container.blob_name.is_none());
    }

    #[test]
    fn test_parse_sas_and_unparsed_params() {
        let parts = BlobUrlParts::parse(
            "https://acct.blob.core.windows.net/c/b?sv=2019-02-02&sr=b&sp=r&se=2025-01-01T00%3A00%3A00Z&sig=a%2Bb%3D&timeout=30&versionid=v1",
        )
        .unwrap();
        let sas = &parts.sas_query_parameters;
        assert_eq!(sas.version.as_deref(), Some("2019-02-02"));
        assert_eq!(sas.expiry_time.as_deref(), Some("2025-01-01T00:00:00Z"));
        assert_eq!(sas.signature.as_deref(), Some("a+b="));
        assert_eq!(parts.version_id.as_deref(), Some("v1"));
        assert_eq!(
            parts.unparsed_parameters.get("timeout").map(String::as_str),
            Some("30")
        );

        let again = BlobUrlParts::parse(parts.to_url().unwrap().as_str()).unwrap();
        assert_eq!(again, parts);
    }

    #[test]
    fn test_special_characters_roundtrip() {
        let parts = BlobUrlParts {
            scheme: "https".to_string(),
            host: "acct.blob.core.windows.net".to_string(),
            account_name: Some("acct".to_string()),
            container_name: Some("container".to_string()),
            blob_name: Some("folder/my blob+ü?.txt".to_string()),
            ..Default::default()
        };
        let url = parts.to_url().unwrap();
        assert!(url.as_str().contains("my%20blob%2B"));
        assert_eq!(BlobUrlParts::parse(url.as_str()).unwrap(), parts);
    }

    #[test]
    fn test_dot_segments_rejected() {
        for name in ["dir/../secret.txt", "a/./b", "..", "."] {
            let parts = BlobUrlParts {
                scheme: "https".to_string(),
                host: "acct.blob.core.windows.net".to_string(),
                account_name: Some("acct".to_string()),
                container_name: Some("container".to_string()),
                blob_name: Some(name.to_string()),
                ..Default::default()
            };
            assert!(parts.to_url().unwrap_err().is_argument_error(), "{name}");
        }
    }

    #[test]
    fn test_dots_inside_segments_roundtrip() {
        let parts = BlobUrlParts {
            scheme: "http".to_string(),
            host: "127.0.0.1:10000".to_string(),
            account_name: Some("devstoreaccount1".to_string()),
            container_name: Some("container".to_string()),
            blob_name: Some("dir/..hidden/a.b./.../x..".to_string()),
            ..Default::default()
        };
        let url = parts.to_url().unwrap();
        assert_eq!(
            url.path(),
            "/devstoreaccount1/container/dir/..hidden/a.b./.../x.."
        );
        assert_eq!(BlobUrlParts::parse(url.as_str()).unwrap(), parts);
    }

    #[test]
    fn test_root_container_implied() {
        let parts = BlobUrlParts {
            scheme: "https".to_string(),
            host: "acct.blob.core.windows.net".to_string(),
            account_name: Some("acct".to_string()),
            blob_name: Some("blob".to_string()),
            ..Default::default()
        };
        let url = parts.to_url().unwrap();
        assert_eq!(url.path(), "/$root/blob");
        let parsed = BlobUrlParts::parse(url.as_str()).unwrap();
        assert_eq!(parsed.container_name.as_deref(), Some(ROOT_CONTAINER_NAME));
        assert_eq!(parsed.blob_name, parts.blob_name);
    }

    #[test]
    fn test_ip_style_detection() {
        assert!(is_ip_style_host("127.0.0.1"));
        assert!(is_ip_style_host("127.0.0.1:10000"));
        assert!(is_ip_style_host("localhost:10000"));
        assert!(is_ip_style_host("[::1]:10000"));
        assert!(!is_ip_style_host("acct.blob.core.windows.net"));
    }

    #[test]
    fn test_invalid_url() {
        assert!(BlobUrlParts::parse("not a url").unwrap_err().is_argument_error());
    }
}
