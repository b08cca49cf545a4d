//! Shared Access Signatures.
//!
//! A SAS is a set of query parameters granting scoped, time-boxed access
//! to a resource.  The signature is the HMAC-SHA256 of a newline-joined
//! string-to-sign whose field order is fixed by the service version; unset
//! fields contribute an empty line rather than being left out.
//!
//! Blob service SAS (15 fields):
//!
//! ```text
//! permissions \n start \n expiry \n canonicalName \n identifier \n ipRange \n
//! protocol \n version \n resource \n snapshot \n cacheControl \n
//! contentDisposition \n contentEncoding \n contentLanguage \n contentType
//! ```
//!
//! A user delegation SAS inserts the key's oid, tid, start, expiry, service
//! and version after the canonical name (in place of the identifier).

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::auth::{compute_hmac_sha256, SharedKeyCredential, STORAGE_API_VERSION};
use crate::errors::BlobError;

/// Characters left unescaped in SAS query values.
const SAS_QUERY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Format a SAS time as `YYYY-MM-DDTHH:MM:SSZ`.
pub fn format_sas_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse a SAS time.  Accepts full RFC 3339 and the short `YYYY-MM-DD`
/// form the portal produces.
pub fn parse_sas_time(value: &str) -> Result<DateTime<Utc>, BlobError> {
    if let Ok(time) = DateTime::parse_from_rfc3339(value) {
        return Ok(time.with_timezone(&Utc));
    }
    if let Ok(date) = chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        let midnight: NaiveDateTime = date.and_hms_opt(0, 0, 0).unwrap_or_default();
        return Ok(midnight.and_utc());
    }
    Err(BlobError::invalid_argument(format!("Invalid SAS time: {value}")))
}

// ── Permissions ─────────────────────────────────────────────────────

/// Generates a permission flag set that renders and parses in a fixed
/// canonical character order.
macro_rules! sas_flags {
    ($(#[$meta:meta])* $name:ident { $($field:ident => $ch:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct $name {
            $(pub $field: bool,)+
        }

        impl $name {
            /// Parse a flag string; characters may come in any order.
            pub fn parse(value: &str) -> Result<Self, BlobError> {
                let mut flags = Self::default();
                for ch in value.chars() {
                    match ch {
                        $($ch => flags.$field = true,)+
                        other => {
                            return Err(BlobError::invalid_argument(format!(
                                concat!("Unexpected character '{}' in ", stringify!($name), ": {}"),
                                other, value
                            )))
                        }
                    }
                }
                Ok(flags)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                $(if self.$field {
                    write!(f, "{}", $ch)?;
                })+
                Ok(())
            }
        }

        impl FromStr for $name {
            type Err = BlobError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                Self::parse(value)
            }
        }
    };
}

sas_flags!(
    /// Permissions of a blob SAS (`racwd`).
    BlobSasPermissions {
        read => 'r',
        add => 'a',
        create => 'c',
        write => 'w',
        delete => 'd',
    }
);

sas_flags!(
    /// Permissions of a container SAS (`racwdl`).
    ContainerSasPermissions {
        read => 'r',
        add => 'a',
        create => 'c',
        write => 'w',
        delete => 'd',
        list => 'l',
    }
);

sas_flags!(
    /// Permissions of an account SAS (`rwdlacup`).
    AccountSasPermissions {
        read => 'r',
        write => 'w',
        delete => 'd',
        list => 'l',
        add => 'a',
        create => 'c',
        update => 'u',
        process => 'p',
    }
);

sas_flags!(
    /// Services reachable through an account SAS (`bfqt`).
    AccountSasServices {
        blob => 'b',
        file => 'f',
        queue => 'q',
        table => 't',
    }
);

sas_flags!(
    /// Resource types reachable through an account SAS (`sco`).
    AccountSasResourceTypes {
        service => 's',
        container => 'c',
        object => 'o',
    }
);

// ── Protocol / IP range ─────────────────────────────────────────────

/// Protocols a SAS may be used over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SasProtocol {
    HttpsOnly,
    HttpsHttp,
}

impl fmt::Display for SasProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SasProtocol::HttpsOnly => write!(f, "https"),
            SasProtocol::HttpsHttp => write!(f, "https,http"),
        }
    }
}

impl FromStr for SasProtocol {
    type Err = BlobError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "https" => Ok(SasProtocol::HttpsOnly),
            "https,http" => Ok(SasProtocol::HttpsHttp),
            other => Err(BlobError::invalid_argument(format!(
                "Unknown SAS protocol: {other}"
            ))),
        }
    }
}

/// An address or inclusive address range a SAS is restricted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SasIpRange {
    pub ip_min: IpAddr,
    pub ip_max: Option<IpAddr>,
}

impl fmt::Display for SasIpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip_max {
            Some(max) => write!(f, "{}-{}", self.ip_min, max),
            None => write!(f, "{}", self.ip_min),
        }
    }
}

impl FromStr for SasIpRange {
    type Err = BlobError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parse_ip = |s: &str| {
            s.parse::<IpAddr>()
                .map_err(|e| BlobError::invalid_argument(format!("Invalid SAS IP '{s}': {e}")))
        };
        match value.split_once('-') {
            Some((min, max)) => Ok(SasIpRange {
                ip_min: parse_ip(min)?,
                ip_max: Some(parse_ip(max)?),
            }),
            None => Ok(SasIpRange {
                ip_min: parse_ip(value)?,
                ip_max: None,
            }),
        }
    }
}

// ── User delegation key ─────────────────────────────────────────────

/// A time-boxed key issued by the service to an AAD principal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserDelegationKey {
    pub signed_oid: String,
    pub signed_tid: String,
    pub signed_start: DateTime<Utc>,
    pub signed_expiry: DateTime<Utc>,
    pub signed_service: String,
    pub signed_version: String,
    /// Base64 key material.
    pub value: String,
}

// ── Blob service SAS ────────────────────────────────────────────────

/// Inputs of a blob or container service SAS.
///
/// The canonical name is taken from `canonical_name` when set, otherwise
/// derived as `/blob/{account}/{container}[/{blob}]`.  The signed resource
/// is taken from `resource` when set, otherwise `c` for a container,
/// `bs` for a blob snapshot and `b` for a blob.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobSasSignatureValues {
    pub version: Option<String>,
    pub protocol: Option<SasProtocol>,
    pub start_time: Option<DateTime<Utc>>,
    pub expiry_time: Option<DateTime<Utc>>,
    pub permissions: Option<String>,
    pub ip_range: Option<SasIpRange>,
    pub identifier: Option<String>,
    pub container_name: Option<String>,
    pub blob_name: Option<String>,
    pub snapshot_id: Option<String>,
    pub canonical_name: Option<String>,
    pub resource: Option<String>,
    pub cache_control: Option<String>,
    pub content_disposition: Option<String>,
    pub content_encoding: Option<String>,
    pub content_language: Option<String>,
    pub content_type: Option<String>,
}

fn opt_str(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or_default()
}

fn opt_time(value: &Option<DateTime<Utc>>) -> String {
    value.as_ref().map(format_sas_time).unwrap_or_default()
}

fn opt_display<T: fmt::Display>(value: &Option<T>) -> String {
    value.as_ref().map(|v| v.to_string()).unwrap_or_default()
}

impl BlobSasSignatureValues {
    /// SAS over a single blob, valid until `expiry_time`.
    pub fn for_blob(
        container_name: impl Into<String>,
        blob_name: impl Into<String>,
        permissions: BlobSasPermissions,
        expiry_time: DateTime<Utc>,
    ) -> Self {
        Self {
            container_name: Some(container_name.into()),
            blob_name: Some(blob_name.into()),
            permissions: Some(permissions.to_string()),
            expiry_time: Some(expiry_time),
            ..Default::default()
        }
    }

    /// SAS over a container, valid until `expiry_time`.
    pub fn for_container(
        container_name: impl Into<String>,
        permissions: ContainerSasPermissions,
        expiry_time: DateTime<Utc>,
    ) -> Self {
        Self {
            container_name: Some(container_name.into()),
            permissions: Some(permissions.to_string()),
            expiry_time: Some(expiry_time),
            ..Default::default()
        }
    }

    fn version(&self) -> &str {
        self.version.as_deref().unwrap_or(STORAGE_API_VERSION)
    }

    fn canonical_name(&self, account_name: &str) -> Result<String, BlobError> {
        if let Some(name) = &self.canonical_name {
            return Ok(name.clone());
        }
        let container = self
            .container_name
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| BlobError::invalid_argument("canonicalName cannot be empty"))?;
        Ok(match self.blob_name.as_deref().filter(|b| !b.is_empty()) {
            Some(blob) => format!("/blob/{account_name}/{container}/{blob}"),
            None => format!("/blob/{account_name}/{container}"),
        })
    }

    fn resolved_resource(&self, canonical_name: &str) -> String {
        if let Some(resource) = &self.resource {
            return resource.clone();
        }
        // "/blob/{account}/{container}" names a container.
        let is_container = canonical_name.trim_matches('/').split('/').count() <= 3;
        if is_container {
            "c".to_string()
        } else if self.snapshot_id.is_some() {
            "bs".to_string()
        } else {
            "b".to_string()
        }
    }

    fn validate(&self, resource: &str) -> Result<(), BlobError> {
        if resource == "c" && self.snapshot_id.is_some() {
            return Err(BlobError::invalid_argument(
                "Cannot set a snapshotId on a container SAS",
            ));
        }
        if self.identifier.is_none() {
            if self.expiry_time.is_none() {
                return Err(BlobError::invalid_argument(
                    "expiryTime is required when no identifier is set",
                ));
            }
            if self.permissions.is_none() {
                return Err(BlobError::invalid_argument(
                    "permissions are required when no identifier is set",
                ));
            }
        }
        Ok(())
    }

    fn common_tail(&self, resource: &str) -> [String; 7] {
        [
            resource.to_string(),
            opt_str(&self.snapshot_id).to_string(),
            opt_str(&self.cache_control).to_string(),
            opt_str(&self.content_disposition).to_string(),
            opt_str(&self.content_encoding).to_string(),
            opt_str(&self.content_language).to_string(),
            opt_str(&self.content_type).to_string(),
        ]
    }

    /// String-to-sign for an account-key SAS.
    pub fn string_to_sign(&self, account_name: &str) -> Result<String, BlobError> {
        let canonical_name = self.canonical_name(account_name)?;
        let resource = self.resolved_resource(&canonical_name);
        self.validate(&resource)?;

        let mut fields = vec![
            opt_str(&self.permissions).to_string(),
            opt_time(&self.start_time),
            opt_time(&self.expiry_time),
            canonical_name,
            opt_str(&self.identifier).to_string(),
            opt_display(&self.ip_range),
            opt_display(&self.protocol),
            self.version().to_string(),
        ];
        fields.extend(self.common_tail(&resource));
        Ok(fields.join("\n"))
    }

    /// String-to-sign for a user delegation SAS.
    pub fn string_to_sign_with_user_delegation_key(
        &self,
        key: &UserDelegationKey,
        account_name: &str,
    ) -> Result<String, BlobError> {
        let canonical_name = self.canonical_name(account_name)?;
        let resource = self.resolved_resource(&canonical_name);
        self.validate(&resource)?;

        let mut fields = vec![
            opt_str(&self.permissions).to_string(),
            opt_time(&self.start_time),
            opt_time(&self.expiry_time),
            canonical_name,
            key.signed_oid.clone(),
            key.signed_tid.clone(),
            format_sas_time(&key.signed_start),
            format_sas_time(&key.signed_expiry),
            key.signed_service.clone(),
            key.signed_version.clone(),
            opt_display(&self.ip_range),
            opt_display(&self.protocol),
            self.version().to_string(),
        ];
        fields.extend(self.common_tail(&resource));
        Ok(fields.join("\n"))
    }

    /// Sign with the account key.
    pub fn sign_with_shared_key(
        &self,
        credential: &SharedKeyCredential,
    ) -> Result<SasQueryParameters, BlobError> {
        let string_to_sign = self.string_to_sign(credential.account_name())?;
        let signature = credential.compute_hmac_sha256(&string_to_sign)?;
        let canonical_name = self.canonical_name(credential.account_name())?;

        let mut params = self.base_query_parameters(&canonical_name);
        params.identifier = self.identifier.clone();
        params.signature = Some(signature);
        Ok(params)
    }

    /// Sign with a user delegation key.
    pub fn sign_with_user_delegation_key(
        &self,
        key: &UserDelegationKey,
        account_name: &str,
    ) -> Result<SasQueryParameters, BlobError> {
        let string_to_sign = self.string_to_sign_with_user_delegation_key(key, account_name)?;
        let key_bytes = BASE64_STANDARD.decode(&key.value).map_err(|e| {
            BlobError::invalid_argument(format!("User delegation key is not valid base64: {e}"))
        })?;
        let signature = compute_hmac_sha256(&key_bytes, &string_to_sign)?;
        let canonical_name = self.canonical_name(account_name)?;

        let mut params = self.base_query_parameters(&canonical_name);
        params.key_object_id = Some(key.signed_oid.clone());
        params.key_tenant_id = Some(key.signed_tid.clone());
        params.key_start = Some(format_sas_time(&key.signed_start));
        params.key_expiry = Some(format_sas_time(&key.signed_expiry));
        params.key_service = Some(key.signed_service.clone());
        params.key_version = Some(key.signed_version.clone());
        params.signature = Some(signature);
        Ok(params)
    }

    fn base_query_parameters(&self, canonical_name: &str) -> SasQueryParameters {
        SasQueryParameters {
            version: Some(self.version().to_string()),
            protocol: self.protocol.map(|p| p.to_string()),
            start_time: self.start_time.as_ref().map(format_sas_time),
            expiry_time: self.expiry_time.as_ref().map(format_sas_time),
            ip_range: self.ip_range.map(|r| r.to_string()),
            resource: Some(self.resolved_resource(canonical_name)),
            permissions: self.permissions.clone(),
            cache_control: self.cache_control.clone(),
            content_disposition: self.content_disposition.clone(),
            content_encoding: self.content_encoding.clone(),
            content_language: self.content_language.clone(),
            content_type: self.content_type.clone(),
            ..Default::default()
        }
    }
}

// ── Account SAS ─────────────────────────────────────────────────────

/// Inputs of an account SAS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountSasSignatureValues {
    pub version: Option<String>,
    pub protocol: Option<SasProtocol>,
    pub start_time: Option<DateTime<Utc>>,
    pub expiry_time: DateTime<Utc>,
    pub permissions: AccountSasPermissions,
    pub ip_range: Option<SasIpRange>,
    pub services: AccountSasServices,
    pub resource_types: AccountSasResourceTypes,
}

impl AccountSasSignatureValues {
    pub fn new(
        expiry_time: DateTime<Utc>,
        permissions: AccountSasPermissions,
        services: AccountSasServices,
        resource_types: AccountSasResourceTypes,
    ) -> Self {
        Self {
            version: None,
            protocol: None,
            start_time: None,
            expiry_time,
            permissions,
            ip_range: None,
            services,
            resource_types,
        }
    }

    fn version(&self) -> &str {
        self.version.as_deref().unwrap_or(STORAGE_API_VERSION)
    }

    /// `account\npermissions\nservices\nresourceTypes\nstart\nexpiry\nip\nprotocol\nversion\n`
    pub fn string_to_sign(&self, account_name: &str) -> Result<String, BlobError> {
        let permissions = self.permissions.to_string();
        let services = self.services.to_string();
        let resource_types = self.resource_types.to_string();
        if permissions.is_empty() || services.is_empty() || resource_types.is_empty() {
            return Err(BlobError::invalid_argument(
                "Account SAS needs permissions, services and resource types",
            ));
        }
        let fields = [
            account_name.to_string(),
            permissions,
            services,
            resource_types,
            opt_time(&self.start_time),
            format_sas_time(&self.expiry_time),
            opt_display(&self.ip_range),
            opt_display(&self.protocol),
            self.version().to_string(),
        ];
        Ok(fields.iter().map(|f| format!("{f}\n")).collect())
    }

    /// Sign with the account key.
    pub fn sign(&self, credential: &SharedKeyCredential) -> Result<SasQueryParameters, BlobError> {
        let string_to_sign = self.string_to_sign(credential.account_name())?;
        let signature = credential.compute_hmac_sha256(&string_to_sign)?;
        Ok(SasQueryParameters {
            version: Some(self.version().to_string()),
            services: Some(self.services.to_string()),
            resource_types: Some(self.resource_types.to_string()),
            protocol: self.protocol.map(|p| p.to_string()),
            start_time: self.start_time.as_ref().map(format_sas_time),
            expiry_time: Some(format_sas_time(&self.expiry_time)),
            ip_range: self.ip_range.map(|r| r.to_string()),
            permissions: Some(self.permissions.to_string()),
            signature: Some(signature),
            ..Default::default()
        })
    }
}

// ── Query parameters ────────────────────────────────────────────────

/// The signed query parameters of a SAS.  Values are kept as the exact
/// strings that were signed so encode/parse is lossless.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SasQueryParameters {
    pub version: Option<String>,
    pub services: Option<String>,
    pub resource_types: Option<String>,
    pub protocol: Option<String>,
    pub start_time: Option<String>,
    pub expiry_time: Option<String>,
    pub ip_range: Option<String>,
    pub identifier: Option<String>,
    pub resource: Option<String>,
    pub permissions: Option<String>,
    pub signature: Option<String>,
    pub cache_control: Option<String>,
    pub content_disposition: Option<String>,
    pub content_encoding: Option<String>,
    pub content_language: Option<String>,
    pub content_type: Option<String>,
    pub key_object_id: Option<String>,
    pub key_tenant_id: Option<String>,
    pub key_start: Option<String>,
    pub key_expiry: Option<String>,
    pub key_service: Option<String>,
    pub key_version: Option<String>,
}

impl SasQueryParameters {
    fn fields(&self) -> [(&'static str, &Option<String>); 22] {
        [
            ("sv", &self.version),
            ("ss", &self.services),
            ("srt", &self.resource_types),
            ("spr", &self.protocol),
            ("st", &self.start_time),
            ("se", &self.expiry_time),
            ("sip", &self.ip_range),
            ("si", &self.identifier),
            ("sr", &self.resource),
            ("sp", &self.permissions),
            ("sig", &self.signature),
            ("rscc", &self.cache_control),
            ("rscd", &self.content_disposition),
            ("rsce", &self.content_encoding),
            ("rscl", &self.content_language),
            ("rsct", &self.content_type),
            ("skoid", &self.key_object_id),
            ("sktid", &self.key_tenant_id),
            ("skt", &self.key_start),
            ("ske", &self.key_expiry),
            ("sks", &self.key_service),
            ("skv", &self.key_version),
        ]
    }

    fn field_mut(&mut self, code: &str) -> Option<&mut Option<String>> {
        let field = match code {
            "sv" => &mut self.version,
            "ss" => &mut self.services,
            "srt" => &mut self.resource_types,
            "spr" => &mut self.protocol,
            "st" => &mut self.start_time,
            "se" => &mut self.expiry_time,
            "sip" => &mut self.ip_range,
            "si" => &mut self.identifier,
            "sr" => &mut self.resource,
            "sp" => &mut self.permissions,
            "sig" => &mut self.signature,
            "rscc" => &mut self.cache_control,
            "rscd" => &mut self.content_disposition,
            "rsce" => &mut self.content_encoding,
            "rscl" => &mut self.content_language,
            "rsct" => &mut self.content_type,
            "skoid" => &mut self.key_object_id,
            "sktid" => &mut self.key_tenant_id,
            "skt" => &mut self.key_start,
            "ske" => &mut self.key_expiry,
            "sks" => &mut self.key_service,
            "skv" => &mut self.key_version,
            _ => return None,
        };
        Some(field)
    }

    /// Take the SAS parameters out of a decoded query map.  Keys are
    /// matched case-insensitively; everything else stays in `params`.
    pub fn from_query(params: &mut BTreeMap<String, String>) -> Self {
        let mut sas = SasQueryParameters::default();
        let keys: Vec<String> = params.keys().cloned().collect();
        for key in keys {
            let code = key.to_lowercase();
            if let Some(field) = sas.field_mut(&code) {
                *field = params.remove(&key);
            }
        }
        sas
    }

    /// True when no parameter is set.
    pub fn is_empty(&self) -> bool {
        self.fields().iter().all(|(_, v)| v.is_none())
    }

    /// Expiry time, parsed.
    pub fn expiry(&self) -> Result<Option<DateTime<Utc>>, BlobError> {
        self.expiry_time.as_deref().map(parse_sas_time).transpose()
    }

    /// Start time, parsed.
    pub fn start(&self) -> Result<Option<DateTime<Utc>>, BlobError> {
        self.start_time.as_deref().map(parse_sas_time).transpose()
    }

    /// Encode as a query string (no leading `?`).
    pub fn encode(&self) -> String {
        self.fields()
            .iter()
            .filter_map(|(code, value)| {
                value.as_ref().map(|v| {
                    format!("{code}={}", utf8_percent_encode(v, SAS_QUERY_ENCODE_SET))
                })
            })
            .collect::<Vec<_>>()
            .join("&")
    }
}

impl fmt::Display for SasQueryParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const TEST_KEY: &str = "dGVzdC1hY2NvdW50LWtleS0wMTIzNDU2Nzg5YWJjZGVm";

    fn expiry() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    fn credential() -> SharedKeyCredential {
        SharedKeyCredential::new("acct", TEST_KEY).unwrap()
    }

    fn delegation_key() -> UserDelegationKey {
        UserDelegationKey {
            signed_oid: "oid-1".to_string(),
            signed_tid: "tid-1".to_string(),
            signed_start: Utc.with_ymd_and_hms(2024, 12, 31, 0, 0, 0).unwrap(),
            signed_expiry: Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap(),
            signed_service: "b".to_string(),
            signed_version: "2019-02-02".to_string(),
            value: BASE64_STANDARD.encode(b"delegation-key-bytes"),
        }
    }

    #[test]
    fn test_blob_string_to_sign_exact() {
        let values = BlobSasSignatureValues {
            version: Some("2018-11-09".to_string()),
            canonical_name: Some("/blob/acct/container/blob".to_string()),
            permissions: Some("r".to_string()),
            expiry_time: Some(expiry()),
            ..Default::default()
        };
        let sts = values.string_to_sign("acct").unwrap();
        assert_eq!(
            sts,
            "r\n\n2025-01-01T00:00:00Z\n/blob/acct/container/blob\n\n\n\n2018-11-09\nb\n\n\n\n\n\n"
        );
        assert_eq!(sts.split('\n').count(), 15);
        assert!(sts.ends_with("\nb\n\n\n\n\n\n"));
    }

    #[test]
    fn test_blob_string_to_sign_all_fields() {
        let values = BlobSasSignatureValues {
            version: Some("2019-02-02".to_string()),
            protocol: Some(SasProtocol::HttpsHttp),
            start_time: Some(Utc.with_ymd_and_hms(2024, 6, 1, 8, 30, 0).unwrap()),
            expiry_time: Some(expiry()),
            permissions: Some(BlobSasPermissions::parse("wr").unwrap().to_string()),
            ip_range: Some("10.0.0.1-10.0.0.9".parse().unwrap()),
            identifier: Some("policy".to_string()),
            container_name: Some("container".to_string()),
            blob_name: Some("dir/blob.txt".to_string()),
            snapshot_id: Some("2020-01-01T00:00:00.0000000Z".to_string()),
            cache_control: Some("no-cache".to_string()),
            content_disposition: Some("inline".to_string()),
            content_encoding: Some("gzip".to_string()),
            content_language: Some("en".to_string()),
            content_type: Some("text/plain".to_string()),
            ..Default::default()
        };
        let sts = values.string_to_sign("acct").unwrap();
        let fields: Vec<&str> = sts.split('\n').collect();
        assert_eq!(
            fields,
            vec![
                "rw",
                "2024-06-01T08:30:00Z",
                "2025-01-01T00:00:00Z",
                "/blob/acct/container/dir/blob.txt",
                "policy",
                "10.0.0.1-10.0.0.9",
                "https,http",
                "2019-02-02",
                "bs",
                "2020-01-01T00:00:00.0000000Z",
                "no-cache",
                "inline",
                "gzip",
                "en",
                "text/plain",
            ]
        );
    }

    #[test]
    fn test_user_delegation_string_to_sign() {
        let values = BlobSasSignatureValues::for_blob(
            "container",
            "blob",
            BlobSasPermissions {
                read: true,
                ..Default::default()
            },
            expiry(),
        );
        let sts = values
            .string_to_sign_with_user_delegation_key(&delegation_key(), "acct")
            .unwrap();
        let fields: Vec<&str> = sts.split('\n').collect();
        assert_eq!(fields.len(), 20);
        assert_eq!(
            &fields[3..10],
            &[
                "/blob/acct/container/blob",
                "oid-1",
                "tid-1",
                "2024-12-31T00:00:00Z",
                "2025-01-02T00:00:00Z",
                "b",
                "2019-02-02",
            ]
        );
        assert_eq!(fields[12], STORAGE_API_VERSION);
        assert_eq!(fields[13], "b");
    }

    #[test]
    fn test_container_sas_rejects_snapshot() {
        let mut values = BlobSasSignatureValues::for_container(
            "container",
            ContainerSasPermissions::parse("rl").unwrap(),
            expiry(),
        );
        values.snapshot_id = Some("2020-01-01T00:00:00.0000000Z".to_string());
        let err = values.sign_with_shared_key(&credential()).unwrap_err();
        assert!(err.is_argument_error());
    }

    #[test]
    fn test_missing_expiry_or_permissions_without_identifier() {
        let mut values = BlobSasSignatureValues::for_blob(
            "c",
            "b",
            BlobSasPermissions::parse("r").unwrap(),
            expiry(),
        );
        values.expiry_time = None;
        assert!(values.string_to_sign("acct").unwrap_err().is_argument_error());

        values.expiry_time = Some(expiry());
        values.permissions = None;
        assert!(values.string_to_sign("acct").unwrap_err().is_argument_error());

        // A stored access policy supplies both.
        values.expiry_time = None;
        values.identifier = Some("policy".to_string());
        assert!(values.string_to_sign("acct").is_ok());
    }

    #[test]
    fn test_missing_canonical_name() {
        let values = BlobSasSignatureValues {
            permissions: Some("r".to_string()),
            expiry_time: Some(expiry()),
            ..Default::default()
        };
        assert!(values.string_to_sign("acct").unwrap_err().is_argument_error());
    }

    #[test]
    fn test_sign_with_shared_key_matches_hmac() {
        let values = BlobSasSignatureValues::for_blob(
            "container",
            "blob",
            BlobSasPermissions::parse("rw").unwrap(),
            expiry(),
        );
        let params = values.sign_with_shared_key(&credential()).unwrap();
        let expected = credential()
            .compute_hmac_sha256(&values.string_to_sign("acct").unwrap())
            .unwrap();
        assert_eq!(params.signature.as_deref(), Some(expected.as_str()));
        assert_eq!(params.resource.as_deref(), Some("b"));
        assert_eq!(params.permissions.as_deref(), Some("rw"));
        assert_eq!(params.expiry_time.as_deref(), Some("2025-01-01T00:00:00Z"));
    }

    #[test]
    fn test_sign_with_user_delegation_key_sets_key_fields() {
        let values = BlobSasSignatureValues::for_container(
            "container",
            ContainerSasPermissions::parse("r").unwrap(),
            expiry(),
        );
        let params = values
            .sign_with_user_delegation_key(&delegation_key(), "acct")
            .unwrap();
        assert_eq!(params.resource.as_deref(), Some("c"));
        assert_eq!(params.key_object_id.as_deref(), Some("oid-1"));
        assert_eq!(params.key_start.as_deref(), Some("2024-12-31T00:00:00Z"));
        assert_eq!(params.key_service.as_deref(), Some("b"));
        assert!(params.signature.is_some());
        assert!(params.identifier.is_none());
    }

    #[test]
    fn test_encode_order_and_escaping() {
        let params = SasQueryParameters {
            version: Some("2019-02-02".to_string()),
            expiry_time: Some("2025-01-01T00:00:00Z".to_string()),
            resource: Some("b".to_string()),
            permissions: Some("r".to_string()),
            signature: Some("a+b/c=".to_string()),
            ..Default::default()
        };
        assert_eq!(
            params.encode(),
            "sv=2019-02-02&se=2025-01-01T00%3A00%3A00Z&sr=b&sp=r&sig=a%2Bb%2Fc%3D"
        );
    }

    #[test]
    fn test_from_query_takes_only_sas_keys() {
        let mut query: BTreeMap<String, String> = [
            ("SV", "2019-02-02"),
            ("sig", "abc="),
            ("sp", "r"),
            ("comp", "block"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let params = SasQueryParameters::from_query(&mut query);
        assert_eq!(params.version.as_deref(), Some("2019-02-02"));
        assert_eq!(params.signature.as_deref(), Some("abc="));
        assert_eq!(query.len(), 1);
        assert_eq!(query.get("comp").map(String::as_str), Some("block"));
    }

    #[test]
    fn test_empty_parameters() {
        let params = SasQueryParameters::default();
        assert!(params.is_empty());
        assert_eq!(params.encode(), "");
    }

    #[test]
    fn test_account_sas_string_to_sign() {
        let values = AccountSasSignatureValues::new(
            expiry(),
            AccountSasPermissions::parse("rwl").unwrap(),
            AccountSasServices::parse("b").unwrap(),
            AccountSasResourceTypes::parse("sco").unwrap(),
        );
        let sts = values.string_to_sign("acct").unwrap();
        assert_eq!(
            sts,
            "acct\nrwl\nb\nsco\n\n2025-01-01T00:00:00Z\n\n\n2019-02-02\n"
        );

        let params = values.sign(&credential()).unwrap();
        let encoded = params.encode();
        assert!(encoded.starts_with("sv=2019-02-02&ss=b&srt=sco&se="));
        assert!(encoded.contains("&sp=rwl&sig="));
    }

    #[test]
    fn test_account_sas_requires_services() {
        let values = AccountSasSignatureValues::new(
            expiry(),
            AccountSasPermissions::parse("r").unwrap(),
            AccountSasServices::default(),
            AccountSasResourceTypes::parse("o").unwrap(),
        );
        assert!(values.sign(&credential()).unwrap_err().is_argument_error());
    }

    #[test]
    fn test_permissions_canonical_order() {
        assert_eq!(BlobSasPermissions::parse("dwcar").unwrap().to_string(), "racwd");
        assert_eq!(
            ContainerSasPermissions::parse("lr").unwrap().to_string(),
            "rl"
        );
        assert_eq!(
            AccountSasPermissions::parse("pucaldwr").unwrap().to_string(),
            "rwdlacup"
        );
        assert!(BlobSasPermissions::parse("rx").unwrap_err().is_argument_error());
    }

    #[test]
    fn test_ip_range_parse() {
        let single: SasIpRange = "168.1.5.60".parse().unwrap();
        assert_eq!(single.to_string(), "168.1.5.60");
        let range: SasIpRange = "168.1.5.60-168.1.5.70".parse().unwrap();
        assert_eq!(range.to_string(), "168.1.5.60-168.1.5.70");
        assert!("not-an-ip".parse::<SasIpRange>().is_err());
    }

    #[test]
    fn test_protocol_roundtrip() {
        for p in [SasProtocol::HttpsOnly, SasProtocol::HttpsHttp] {
            assert_eq!(p.to_string().parse::<SasProtocol>().unwrap(), p);
        }
        assert!("ftp".parse::<SasProtocol>().is_err());
    }

    #[test]
    fn test_parse_sas_time_forms() {
        assert_eq!(parse_sas_time("2025-01-01T00:00:00Z").unwrap(), expiry());
        assert_eq!(parse_sas_time("2025-01-01").unwrap(), expiry());
        assert!(parse_sas_time("tomorrow").is_err());
    }
}
