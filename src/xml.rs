//! Blob service XML payloads.
//!
//! Request bodies are produced with the `quick-xml` writer and responses
//! (error documents, user delegation keys) are read with the pull reader.

use chrono::{DateTime, Utc};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::collections::HashMap;
use std::io::Cursor;

use crate::errors::BlobError;
use crate::sas::{format_sas_time, parse_sas_time, UserDelegationKey};

// ── Put Block List ──────────────────────────────────────────────────

/// Render the Put Block List body.  Every ID is committed from the latest
/// uploaded version of that block.
///
/// ```xml
/// <?xml version="1.0" encoding="utf-8"?>
/// <BlockList>
///   <Latest>MDAwMDAx</Latest>
/// </BlockList>
/// ```
pub fn render_block_list(block_ids: &[String]) -> Result<String, BlobError> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));

    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
    writer.write_event(Event::Start(BytesStart::new("BlockList")))?;
    for id in block_ids {
        write_text_element(&mut writer, "Latest", id)?;
    }
    writer.write_event(Event::End(BytesEnd::new("BlockList")))?;

    String::from_utf8(writer.into_inner().into_inner()).map_err(|e| BlobError::Xml {
        message: e.to_string(),
    })
}

/// Block IDs listed in a Put Block List body, in document order.
pub fn parse_block_list(body: &str) -> Result<Vec<String>, BlobError> {
    let mut reader = Reader::from_str(body);
    reader.trim_text(true);

    let mut ids = Vec::new();
    let mut in_block = false;
    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                in_block = matches!(e.name().as_ref(), b"Latest" | b"Committed" | b"Uncommitted");
            }
            Event::Text(t) if in_block => ids.push(t.unescape()?.into_owned()),
            Event::End(_) => in_block = false,
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(ids)
}

// ── Error bodies ────────────────────────────────────────────────────

/// `<Code>` and `<Message>` of a storage `<Error>` document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageErrorBody {
    pub code: Option<String>,
    pub message: Option<String>,
}

/// Parse a storage error document.
///
/// ```xml
/// <?xml version="1.0" encoding="utf-8"?>
/// <Error>
///   <Code>AppendPositionConditionNotMet</Code>
///   <Message>The append position condition specified was not met.</Message>
/// </Error>
/// ```
pub fn parse_storage_error(body: &str) -> Result<StorageErrorBody, BlobError> {
    let mut reader = Reader::from_str(body);
    reader.trim_text(true);

    let mut parsed = StorageErrorBody::default();
    let mut current: Option<&'static str> = None;
    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                current = match e.name().as_ref() {
                    b"Code" => Some("Code"),
                    b"Message" => Some("Message"),
                    _ => None,
                };
            }
            Event::Text(t) => {
                let text = t.unescape()?.into_owned();
                match current {
                    Some("Code") => parsed.code = Some(text),
                    Some("Message") => parsed.message = Some(text),
                    _ => {}
                }
            }
            Event::End(_) => current = None,
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(parsed)
}

/// Render a storage error document (used by the in-memory transport and
/// in tests).
pub fn render_storage_error(code: &str, message: &str) -> Result<String, BlobError> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));

    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
    writer.write_event(Event::Start(BytesStart::new("Error")))?;
    write_text_element(&mut writer, "Code", code)?;
    write_text_element(&mut writer, "Message", message)?;
    writer.write_event(Event::End(BytesEnd::new("Error")))?;

    String::from_utf8(writer.into_inner().into_inner()).map_err(|e| BlobError::Xml {
        message: e.to_string(),
    })
}

// ── User delegation keys ────────────────────────────────────────────

/// Render the Get User Delegation Key request body.
pub fn render_key_info(start: &DateTime<Utc>, expiry: &DateTime<Utc>) -> Result<String, BlobError> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));

    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
    writer.write_event(Event::Start(BytesStart::new("KeyInfo")))?;
    write_text_element(&mut writer, "Start", &format_sas_time(start))?;
    write_text_element(&mut writer, "Expiry", &format_sas_time(expiry))?;
    writer.write_event(Event::End(BytesEnd::new("KeyInfo")))?;

    String::from_utf8(writer.into_inner().into_inner()).map_err(|e| BlobError::Xml {
        message: e.to_string(),
    })
}

/// Parse a `<UserDelegationKey>` response body.  Every field is required.
pub fn parse_user_delegation_key(body: &str) -> Result<UserDelegationKey, BlobError> {
    let mut reader = Reader::from_str(body);
    reader.trim_text(true);

    let mut fields: HashMap<String, String> = HashMap::new();
    let mut current: Option<String> = None;
    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                current = Some(String::from_utf8_lossy(e.name().as_ref()).into_owned());
            }
            Event::Text(t) => {
                if let Some(name) = &current {
                    fields.insert(name.clone(), t.unescape()?.into_owned());
                }
            }
            Event::End(_) => current = None,
            Event::Eof => break,
            _ => {}
        }
    }

    let mut take = |name: &str| {
        fields.remove(name).ok_or_else(|| BlobError::Xml {
            message: format!("UserDelegationKey is missing <{name}>"),
        })
    };
    Ok(UserDelegationKey {
        signed_oid: take("SignedOid")?,
        signed_tid: take("SignedTid")?,
        signed_start: parse_sas_time(&take("SignedStart")?)?,
        signed_expiry: parse_sas_time(&take("SignedExpiry")?)?,
        signed_service: take("SignedService")?,
        signed_version: take("SignedVersion")?,
        value: take("Value")?,
    })
}

fn write_text_element(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    tag: &str,
    text: &str,
) -> Result<(), BlobError> {
    writer.write_event(Event::Start(BytesStart::new(tag)))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new(tag)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_list_xml_format() {
        let ids = vec!["MDAwMDAw".to_string(), "MDAwMDAx".to_string()];
        let xml = render_block_list(&ids).unwrap();
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"utf-8\"?>"));
        assert!(xml.contains("<BlockList><Latest>MDAwMDAw</Latest><Latest>MDAwMDAx</Latest></BlockList>"));
        assert_eq!(parse_block_list(&xml).unwrap(), ids);
    }

    #[test]
    fn test_empty_block_list() {
        let xml = render_block_list(&[]).unwrap();
        assert!(xml.contains("<BlockList></BlockList>"));
        assert!(parse_block_list(&xml).unwrap().is_empty());
    }

    #[test]
    fn test_parse_block_list_mixed_kinds() {
        let body = "<BlockList><Committed>a</Committed><Uncommitted>b</Uncommitted><Latest>c</Latest></BlockList>";
        assert_eq!(parse_block_list(body).unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_parse_storage_error() {
        let body = "<?xml version=\"1.0\" encoding=\"utf-8\"?>\
            <Error><Code>AppendPositionConditionNotMet</Code>\
            <Message>The append position condition specified was not met.\nRequestId:1</Message></Error>";
        let parsed = parse_storage_error(body).unwrap();
        assert_eq!(parsed.code.as_deref(), Some("AppendPositionConditionNotMet"));
        assert!(parsed
            .message
            .as_deref()
            .unwrap()
            .starts_with("The append position"));
    }

    #[test]
    fn test_storage_error_roundtrip_escapes() {
        let xml = render_storage_error("InvalidInput", "a < b & c").unwrap();
        assert!(xml.contains("a &lt; b &amp; c"));
        let parsed = parse_storage_error(&xml).unwrap();
        assert_eq!(parsed.message.as_deref(), Some("a < b & c"));
    }

    #[test]
    fn test_parse_error_without_code() {
        let parsed = parse_storage_error("<Error></Error>").unwrap();
        assert_eq!(parsed, StorageErrorBody::default());
    }
    #[test]
    fn test_key_info_body() {
        let start = chrono::TimeZone::with_ymd_and_hms(&Utc, 2025, 1, 1, 0, 0, 0).unwrap();
        let expiry = chrono::TimeZone::with_ymd_and_hms(&Utc, 2025, 1, 2, 0, 0, 0).unwrap();
        let xml = render_key_info(&start, &expiry).unwrap();
        assert!(xml.contains(
            "<KeyInfo><Start>2025-01-01T00:00:00Z</Start><Expiry>2025-01-02T00:00:00Z</Expiry></KeyInfo>"
        ));
    }

    #[test]
    fn test_parse_user_delegation_key() {
        let body = "<?xml version=\"1.0\" encoding=\"utf-8\"?><UserDelegationKey>\
            <SignedOid>oid</SignedOid><SignedTid>tid</SignedTid>\
            <SignedStart>2025-01-01T00:00:00Z</SignedStart><SignedExpiry>2025-01-02T00:00:00Z</SignedExpiry>\
            <SignedService>b</SignedService><SignedVersion>2019-02-02</SignedVersion>\
            <Value>a2V5</Value></UserDelegationKey>";
        let key = parse_user_delegation_key(body).unwrap();
        assert_eq!(key.signed_oid, "oid");
        assert_eq!(key.signed_service, "b");
        assert_eq!(format_sas_time(&key.signed_expiry), "2025-01-02T00:00:00Z");
        assert_eq!(key.value, "a2V5");
    }

    #[test]
    fn test_user_delegation_key_missing_field() {
        let err = parse_user_delegation_key("<UserDelegationKey><SignedOid>o</SignedOid></UserDelegationKey>")
            .unwrap_err();
        assert!(err.to_string().contains("SignedTid"));
    }
}
