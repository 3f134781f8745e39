//! Archive reader over a `readpst -e` extraction tree.
//!
//! Each directory is a folder and each `*.eml` file is a message. Attachments
//! are the MIME leaf parts that carry an attachment disposition or a file
//! name.

use std::collections::VecDeque;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use mailparse::{DispositionType, MailAddr, MailHeaderMap, ParsedMail};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::{ArchiveFolder, ArchiveMessage, AttachmentRef};
use crate::error::{Error, Result};

/// A directory of the extraction tree.
#[derive(Debug)]
pub struct ExtractedFolder {
    root: Arc<PathBuf>,
    dir: PathBuf,
    name: String,
    pending: Option<VecDeque<PathBuf>>,
}

impl ExtractedFolder {
    /// Open the extraction root as the archive's root folder.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(Error::archive(&root, "not a directory"));
        }
        Ok(Self {
            dir: root.clone(),
            root: Arc::new(root),
            name: String::new(),
            pending: None,
        })
    }

    fn child(&self, dir: PathBuf) -> Self {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            root: self.root.clone(),
            dir,
            name,
            pending: None,
        }
    }

    fn list_messages(&self) -> Result<VecDeque<PathBuf>> {
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.dir).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| Error::archive(&self.dir, e))?;
            let path = entry.path();
            if entry.file_type().is_file()
                && path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("eml"))
            {
                files.push(path.to_path_buf());
            }
        }
        // readpst numbers messages 1, 2, ... 10: sort numerically first.
        files.sort_by_key(|path| (message_number(path), path.clone()));
        Ok(files.into())
    }
}

impl ArchiveFolder for ExtractedFolder {
    type Message = ExtractedMessage;

    fn display_name(&self) -> &str {
        &self.name
    }

    fn subfolders(&self) -> Result<Vec<Self>> {
        let mut folders = Vec::new();
        for entry in WalkDir::new(&self.dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| Error::archive(&self.dir, e))?;
            if entry.file_type().is_dir() {
                folders.push(self.child(entry.into_path()));
            }
        }
        Ok(folders)
    }

    fn next_message(&mut self) -> Result<Option<ExtractedMessage>> {
        if self.pending.is_none() {
            self.pending = Some(self.list_messages()?);
        }
        let Some(pending) = self.pending.as_mut() else {
            return Ok(None);
        };

        while let Some(path) = pending.pop_front() {
            match ExtractedMessage::load(&self.root, &path) {
                Ok(message) => return Ok(Some(message)),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable message"),
            }
        }
        Ok(None)
    }
}

/// An attachment part decoded from an extracted message.
#[derive(Debug, Clone)]
struct ExtractedAttachment {
    filename: Option<String>,
    mime_type: String,
    data: Option<Vec<u8>>,
}

/// A message file of the extraction tree, fully parsed into owned fields.
#[derive(Debug, Clone)]
pub struct ExtractedMessage {
    descriptor_id: u64,
    sender_name: String,
    sender_address: String,
    display_to: String,
    subject: String,
    plain_body: String,
    html_body: String,
    raw_headers: String,
    delivery_time: Option<DateTime<Utc>>,
    creation_time: Option<DateTime<Utc>>,
    attachments: Vec<ExtractedAttachment>,
}

impl ExtractedMessage {
    /// Parse the message file at `path`.
    pub fn load(root: &Path, path: &Path) -> Result<Self> {
        let buf = std::fs::read(path).map_err(|e| Error::io(path, e))?;
        let mail = mailparse::parse_mail(&buf).map_err(|e| Error::archive(path, e))?;
        let (_, header_len) = mailparse::parse_headers(&buf).map_err(|e| Error::archive(path, e))?;

        let (sender_name, sender_address) = sender(&mail);
        let delivery_time = header_first(&mail, "Date")
            .and_then(|date| mailparse::dateparse(&date).ok())
            .and_then(|ts| DateTime::from_timestamp(ts, 0));
        let creation_time = std::fs::metadata(path)
            .and_then(|meta| meta.modified())
            .ok()
            .map(DateTime::<Utc>::from);

        let mut attachments = Vec::new();
        collect_attachments(&mail, &mut attachments);

        let message = Self {
            descriptor_id: descriptor_id_for(root, path),
            sender_name,
            sender_address,
            display_to: header_first(&mail, "To").unwrap_or_default(),
            subject: header_first(&mail, "Subject").unwrap_or_default(),
            plain_body: best_body_part(&mail, "text/plain").unwrap_or_default(),
            html_body: best_body_part(&mail, "text/html").unwrap_or_default(),
            raw_headers: String::from_utf8_lossy(&buf[..header_len]).trim_end().to_string(),
            delivery_time,
            creation_time,
            attachments,
        };
        debug!(
            path = %path.display(),
            descriptor_id = message.descriptor_id,
            attachments = message.attachments.len(),
            "Loaded message"
        );
        Ok(message)
    }
}

impl ArchiveMessage for ExtractedMessage {
    fn descriptor_id(&self) -> u64 {
        self.descriptor_id
    }

    fn sender_name(&self) -> &str {
        &self.sender_name
    }

    fn sender_address(&self) -> &str {
        &self.sender_address
    }

    fn display_to(&self) -> &str {
        &self.display_to
    }

    fn subject(&self) -> &str {
        &self.subject
    }

    fn plain_body(&self) -> &str {
        &self.plain_body
    }

    fn html_body(&self) -> &str {
        &self.html_body
    }

    fn raw_headers(&self) -> Option<&str> {
        Some(self.raw_headers.as_str()).filter(|h| !h.is_empty())
    }

    fn delivery_time(&self) -> Option<DateTime<Utc>> {
        self.delivery_time
    }

    fn creation_time(&self) -> Option<DateTime<Utc>> {
        self.creation_time
    }

    fn attachment_count(&self) -> usize {
        self.attachments.len()
    }

    fn attachment(&self, index: usize) -> Result<AttachmentRef> {
        let attachment = self.attachments.get(index).ok_or_else(|| Error::Archive {
            path: PathBuf::new(),
            reason: format!(
                "message {} has no attachment {index}",
                self.descriptor_id
            ),
        })?;
        Ok(AttachmentRef {
            filename: attachment.filename.clone(),
            mime_type: Some(attachment.mime_type.clone()),
            source: attachment
                .data
                .clone()
                .map(|data| Box::new(Cursor::new(data)) as Box<dyn std::io::Read + Send>),
        })
    }
}

/// Stable id derived from the message path relative to the extraction root.
///
/// Masked to 63 bits so it stays a positive signed integer downstream.
pub fn descriptor_id_for(root: &Path, path: &Path) -> u64 {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let key = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes) & (i64::MAX as u64)
}

fn message_number(path: &Path) -> u64 {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .and_then(|stem| stem.parse().ok())
        .unwrap_or(u64::MAX)
}

fn header_first(mail: &ParsedMail, name: &str) -> Option<String> {
    mail.headers
        .get_first_value(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn sender(mail: &ParsedMail) -> (String, String) {
    let single = mail
        .headers
        .get_first_header("From")
        .and_then(|header| mailparse::addrparse_header(header).ok())
        .and_then(|list| {
            list.iter().find_map(|addr| match addr {
                MailAddr::Single(info) => Some(info.clone()),
                MailAddr::Group(group) => group.addrs.first().cloned(),
            })
        });

    match single {
        Some(info) => (info.display_name.unwrap_or_default(), info.addr),
        None => (header_first(mail, "From").unwrap_or_default(), String::new()),
    }
}

fn attachment_name(part: &ParsedMail) -> Option<String> {
    part.get_content_disposition()
        .params
        .get("filename")
        .or_else(|| part.ctype.params.get("name"))
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}

fn is_attachment(part: &ParsedMail) -> bool {
    part.get_content_disposition().disposition == DispositionType::Attachment
        || attachment_name(part).is_some()
}

fn best_body_part(mail: &ParsedMail, mimetype: &str) -> Option<String> {
    if mail.subparts.is_empty() {
        if is_attachment(mail) || !mail.ctype.mimetype.eq_ignore_ascii_case(mimetype) {
            return None;
        }
        return mail.get_body().ok().filter(|body| !body.trim().is_empty());
    }
    mail.subparts
        .iter()
        .find_map(|part| best_body_part(part, mimetype))
}

fn collect_attachments(mail: &ParsedMail, out: &mut Vec<ExtractedAttachment>) {
    if !mail.subparts.is_empty() {
        for part in &mail.subparts {
            collect_attachments(part, out);
        }
        return;
    }
    if is_attachment(mail) {
        out.push(ExtractedAttachment {
            filename: attachment_name(mail),
            mime_type: mail.ctype.mimetype.clone(),
            data: mail.get_body_raw().ok(),
        });
    }
}
