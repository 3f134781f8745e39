//! Mail documents and their EML encoding.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use mail_builder::headers::address::Address;
use mail_builder::headers::raw::Raw;
use mail_builder::headers::text::Text;
use mail_builder::mime::MimePart;
use mail_builder::MessageBuilder;
use serde_json::Value;
use tracing::{debug, warn};

use crate::archive::ArchiveMessage;
use crate::error::{Error, Result};
use crate::stream::{read_all, DEFAULT_CHUNK_SIZE};

/// Headers the encoder writes itself and never copies from the transport
/// headers.
const MANAGED_HEADERS: &[&str] = &[
    "from",
    "to",
    "subject",
    "date",
    "mime-version",
    "content-type",
    "content-transfer-encoding",
    "content-disposition",
];

/// Headers that describe the message's transit rather than its content.
/// Only these are prepended when raw headers are requested.
const TRANSPORT_HEADERS: &[&str] = &[
    "received",
    "return-path",
    "delivered-to",
    "authentication-results",
    "received-spf",
    "dkim-signature",
];

/// Line length of base64 attachment bodies.
const BASE64_LINE_LEN: usize = 76;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mailbox {
    pub name: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// Portable representation of one migrated message, before encoding.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MailDocument {
    pub from: Mailbox,
    /// Pre-rendered recipient summary.
    pub to: String,
    pub subject: String,
    pub text: String,
    pub html: String,
    pub headers: BTreeMap<String, Value>,
    pub attachments: Vec<Attachment>,
    pub date: Option<DateTime<Utc>>,
}

/// Turns archive messages into mail documents and encoded EML bytes.
#[derive(Debug, Clone)]
pub struct MailBuilder {
    chunk_size: usize,
    prepend_raw_headers: bool,
}

impl Default for MailBuilder {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            prepend_raw_headers: false,
        }
    }
}

impl MailBuilder {
    pub fn new(chunk_size: usize, prepend_raw_headers: bool) -> Self {
        Self {
            chunk_size,
            prepend_raw_headers,
        }
    }

    /// Build the document for `message` and encode it.
    ///
    /// Unnamed or unreadable attachments are skipped. An encoding failure
    /// fails the whole message.
    pub fn build<M: ArchiveMessage + ?Sized>(&self, message: &M) -> Result<(MailDocument, Vec<u8>)> {
        let descriptor_id = message.descriptor_id();

        let mut document = MailDocument {
            from: Mailbox {
                name: message.sender_name().trim().to_string(),
                address: message.sender_address().trim().to_string(),
            },
            to: message.display_to().to_string(),
            subject: message.subject().to_string(),
            text: message.plain_body().to_string(),
            html: message.html_body().to_string(),
            headers: message.raw_headers().map(parse_headers).unwrap_or_default(),
            attachments: Vec::with_capacity(message.attachment_count()),
            date: message.delivery_time().or_else(|| message.creation_time()),
        };

        for index in 0..message.attachment_count() {
            match self.read_attachment(message, index) {
                Ok(Some(attachment)) => document.attachments.push(attachment),
                Ok(None) => {}
                Err(e) => warn!(descriptor_id, index, error = %e, "Skipping attachment"),
            }
        }

        let mut encoded = encode(&document).map_err(|source| Error::Encoding {
            descriptor_id,
            source,
        })?;

        if self.prepend_raw_headers {
            let transport = message.raw_headers().map(transport_headers).unwrap_or_default();
            if !transport.is_empty() {
                let mut prefixed = Vec::with_capacity(transport.len() + encoded.len());
                prefixed.extend_from_slice(transport.as_bytes());
                prefixed.append(&mut encoded);
                encoded = prefixed;
            }
        }

        Ok((document, encoded))
    }

    fn read_attachment<M: ArchiveMessage + ?Sized>(
        &self,
        message: &M,
        index: usize,
    ) -> Result<Option<Attachment>> {
        let attachment = message.attachment(index)?;

        let Some(name) = attachment.filename.filter(|n| !n.is_empty()) else {
            debug!(descriptor_id = message.descriptor_id(), index, "Attachment has no filename");
            return Ok(None);
        };
        let Some(mut source) = attachment.source else {
            debug!(descriptor_id = message.descriptor_id(), index, "Attachment has no byte source");
            return Ok(None);
        };

        let data = read_all(&mut source, self.chunk_size).map_err(|source| Error::StreamRead {
            name: name.clone(),
            source,
        })?;

        Ok(Some(Attachment {
            name,
            mime_type: attachment
                .mime_type
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            data,
        }))
    }
}

/// Parse a raw header block into a name -> value map. Repeated headers
/// become arrays, in order of appearance.
pub fn parse_headers(raw: &str) -> BTreeMap<String, Value> {
    let mut headers = BTreeMap::new();
    let block = format!("{}\r\n\r\n", raw.trim_end());
    let Ok((parsed, _)) = mailparse::parse_headers(block.as_bytes()) else {
        return headers;
    };

    for header in parsed {
        let value = Value::String(header.get_value());
        match headers.entry(header.get_key()) {
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(value);
            }
            std::collections::btree_map::Entry::Occupied(mut slot) => match slot.get_mut() {
                Value::Array(values) => values.push(value),
                existing => {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, value]);
                }
            },
        }
    }
    headers
}

/// The transit headers of a raw header block, folding kept, CRLF
/// terminated.
fn transport_headers(raw: &str) -> String {
    let block = format!("{}\r\n\r\n", raw.trim_end());
    let Ok((parsed, _)) = mailparse::parse_headers(block.as_bytes()) else {
        return String::new();
    };

    parsed
        .iter()
        .filter(|header| {
            let key = header.get_key().to_ascii_lowercase();
            key.starts_with("x-") || TRANSPORT_HEADERS.contains(&key.as_str())
        })
        .map(|header| {
            format!(
                "{}: {}\r\n",
                header.get_key(),
                String::from_utf8_lossy(header.get_value_raw())
            )
        })
        .collect()
}

fn encode(document: &MailDocument) -> std::io::Result<Vec<u8>> {
    let mut builder = MessageBuilder::new()
        .header("To", Raw::new(document.to.as_str()))
        .subject(document.subject.as_str());

    let name = document.from.name.as_str();
    let address = document.from.address.as_str();
    if !address.is_empty() {
        let name = (!name.is_empty() && name != address).then_some(name);
        builder = builder.from(Address::new_address(name, address));
    } else if !name.is_empty() {
        builder = builder.header("From", Text::new(name));
    }

    if let Some(date) = document.date {
        builder = builder.date(date.timestamp());
    }

    for (name, value) in &document.headers {
        if MANAGED_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
            continue;
        }
        let name = canonical_header_name(name);
        match value {
            Value::Array(values) => {
                for value in values.iter().filter_map(Value::as_str) {
                    builder = builder.header(name.clone(), Raw::new(value));
                }
            }
            Value::String(value) => builder = builder.header(name, Raw::new(value.as_str())),
            _ => {}
        }
    }

    builder.body(body_part(document)).write_to_vec()
}

/// MIME tree of the document: the text alternatives, then one part per
/// attachment.
fn body_part(document: &MailDocument) -> MimePart<'_> {
    let text = document.text.as_str();
    let html = document.html.as_str();

    let mut parts = Vec::with_capacity(document.attachments.len() + 1);
    match (text.is_empty(), html.is_empty()) {
        (false, false) => parts.push(MimePart::new(
            "multipart/alternative",
            vec![MimePart::new("text/plain", text), MimePart::new("text/html", html)],
        )),
        (false, true) => parts.push(MimePart::new("text/plain", text)),
        (true, false) => parts.push(MimePart::new("text/html", html)),
        (true, true) => {}
    }
    parts.extend(document.attachments.iter().map(attachment_part));

    match parts.len() {
        0 => MimePart::new("text/plain", ""),
        1 => parts.remove(0),
        _ => MimePart::new("multipart/mixed", parts),
    }
}

/// Attachments are always sent as base64 so their bytes survive
/// unchanged, whatever their content type.
fn attachment_part(attachment: &Attachment) -> MimePart<'_> {
    MimePart::new(attachment.mime_type.as_str(), wrap_base64(&attachment.data))
        .attachment(attachment.name.as_str())
        .header("Content-Transfer-Encoding", Raw::new("base64"))
}

fn wrap_base64(data: &[u8]) -> String {
    let encoded = STANDARD.encode(data);
    encoded
        .as_bytes()
        .chunks(BASE64_LINE_LEN)
        .map(String::from_utf8_lossy)
        .collect::<Vec<_>>()
        .join("\r\n")
}

fn canonical_header_name(name: &str) -> String {
    if name.eq_ignore_ascii_case("message-id") {
        return "Message-ID".to_string();
    }
    name.to_string()
}
