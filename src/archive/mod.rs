//! Read-only view over a message-store archive.
//!
//! The pipeline never parses the archive container itself. It only walks
//! folders, drains each folder's message cursor and reads attachment bytes
//! through the traits below.

pub mod extracted;

use std::io::Read;

use chrono::{DateTime, Utc};

use crate::error::Result;

/// A folder of the archive tree.
pub trait ArchiveFolder: Sized {
    type Message: ArchiveMessage;

    /// Display name of the folder (empty for the root).
    fn display_name(&self) -> &str;

    /// Child folders, in the archive's listing order.
    fn subfolders(&self) -> Result<Vec<Self>>;

    /// Advance the folder's message cursor.
    ///
    /// Returns `None` once the folder is exhausted.
    fn next_message(&mut self) -> Result<Option<Self::Message>>;
}

/// A single archived message.
pub trait ArchiveMessage {
    /// Stable unique identifier of the message within the archive.
    fn descriptor_id(&self) -> u64;

    fn sender_name(&self) -> &str;

    fn sender_address(&self) -> &str;

    /// Pre-rendered recipient summary.
    fn display_to(&self) -> &str;

    fn subject(&self) -> &str;

    fn plain_body(&self) -> &str;

    fn html_body(&self) -> &str;

    /// Raw transport headers, when the archive kept them.
    fn raw_headers(&self) -> Option<&str>;

    fn delivery_time(&self) -> Option<DateTime<Utc>>;

    fn creation_time(&self) -> Option<DateTime<Utc>>;

    fn attachment_count(&self) -> usize;

    /// Open the attachment at `index`.
    fn attachment(&self, index: usize) -> Result<AttachmentRef>;
}

/// An attachment handle. The byte source can be consumed once.
pub struct AttachmentRef {
    pub filename: Option<String>,
    pub mime_type: Option<String>,
    pub source: Option<Box<dyn Read + Send>>,
}

impl std::fmt::Debug for AttachmentRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachmentRef")
            .field("filename", &self.filename)
            .field("mime_type", &self.mime_type)
            .field("source", &self.source.is_some())
            .finish()
    }
}
