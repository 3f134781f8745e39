//! In-memory collaborators for pipeline tests.

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use futures::lock::Mutex as AsyncMutex;

use pst_migrate::archive::{ArchiveFolder, ArchiveMessage, AttachmentRef};
use pst_migrate::config::PipelineConfig;
use pst_migrate::dedup::{DedupCache, DedupOracle};
use pst_migrate::dispatch::Dispatcher;
use pst_migrate::index::{IndexQuery, IndexRecord, RemoteIndex};
use pst_migrate::progress::ProgressLog;
use pst_migrate::sink::{DeliverySink, Metadata};
use pst_migrate::{Error, Result};

#[derive(Debug, Clone)]
pub struct MemoryMessage {
    pub id: u64,
    pub sender: String,
    pub subject: String,
    pub attachments: Vec<(String, Vec<u8>)>,
}

impl MemoryMessage {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            sender: "alice@example.com".into(),
            subject: format!("Message {id}"),
            attachments: Vec::new(),
        }
    }

    pub fn with_attachment(mut self, name: &str, data: &[u8]) -> Self {
        self.attachments.push((name.to_string(), data.to_vec()));
        self
    }
}

impl ArchiveMessage for MemoryMessage {
    fn descriptor_id(&self) -> u64 {
        self.id
    }
    fn sender_name(&self) -> &str {
        "Alice"
    }
    fn sender_address(&self) -> &str {
        &self.sender
    }
    fn display_to(&self) -> &str {
        "Bob"
    }
    fn subject(&self) -> &str {
        &self.subject
    }
    fn plain_body(&self) -> &str {
        "body"
    }
    fn html_body(&self) -> &str {
        ""
    }
    fn raw_headers(&self) -> Option<&str> {
        None
    }
    fn delivery_time(&self) -> Option<DateTime<Utc>> {
        Utc.with_ymd_and_hms(2021, 6, 15, 12, 0, 0).single()
    }
    fn creation_time(&self) -> Option<DateTime<Utc>> {
        None
    }
    fn attachment_count(&self) -> usize {
        self.attachments.len()
    }
    fn attachment(&self, index: usize) -> Result<AttachmentRef> {
        let (name, data) = &self.attachments[index];
        Ok(AttachmentRef {
            filename: Some(name.clone()),
            mime_type: Some("application/octet-stream".into()),
            source: Some(Box::new(Cursor::new(data.clone())) as Box<dyn Read + Send>),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryFolder {
    pub name: String,
    pub children: Vec<MemoryFolder>,
    pub messages: VecDeque<MemoryMessage>,
}

impl MemoryFolder {
    pub fn new(name: &str, ids: &[u64], children: Vec<MemoryFolder>) -> Self {
        Self {
            name: name.to_string(),
            children,
            messages: ids.iter().copied().map(MemoryMessage::new).collect(),
        }
    }

    pub fn with_messages(name: &str, messages: Vec<MemoryMessage>) -> Self {
        Self {
            name: name.to_string(),
            children: Vec::new(),
            messages: messages.into(),
        }
    }
}

impl ArchiveFolder for MemoryFolder {
    type Message = MemoryMessage;

    fn display_name(&self) -> &str {
        &self.name
    }

    fn subfolders(&self) -> Result<Vec<Self>> {
        Ok(self.children.clone())
    }

    fn next_message(&mut self) -> Result<Option<MemoryMessage>> {
        Ok(self.messages.pop_front())
    }
}

/// Records every delivered path, in completion order.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    pub delivered: Arc<Mutex<Vec<(String, Vec<u8>, Metadata)>>>,
    pub reject: HashSet<String>,
}

impl MemorySink {
    pub fn paths(&self) -> Vec<String> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .map(|(path, _, _)| path.clone())
            .collect()
    }
}

#[async_trait]
impl DeliverySink for MemorySink {
    async fn put(&self, path: &str, body: Bytes, metadata: &Metadata) -> Result<String> {
        if self.reject.contains(path) {
            return Err(Error::Delivery {
                path: path.to_string(),
                reason: "access denied".into(),
            });
        }
        self.delivered
            .lock()
            .unwrap()
            .push((path.to_string(), body.to_vec(), metadata.clone()));
        Ok(format!("mem://{path}"))
    }
}

/// Accepts every delivery after a short pause, tracking how many `put`
/// calls overlap.
#[derive(Debug, Clone, Default)]
pub struct GaugeSink {
    pub in_flight: Arc<AtomicUsize>,
    pub peak: Arc<AtomicUsize>,
    pub delivered: Arc<AtomicUsize>,
}

#[async_trait]
impl DeliverySink for GaugeSink {
    async fn put(&self, path: &str, _body: Bytes, _metadata: &Metadata) -> Result<String> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.delivered.fetch_add(1, Ordering::SeqCst);
        Ok(format!("gauge://{path}"))
    }
}

/// Answers every query with fixed object keys and records the queries.
#[derive(Debug, Clone, Default)]
pub struct RecordingIndex {
    pub keys: Vec<String>,
    pub calls: Arc<Mutex<Vec<Vec<IndexQuery>>>>,
    pub fail: bool,
}

#[async_trait]
impl RemoteIndex for RecordingIndex {
    async fn query(&self, queries: &[IndexQuery]) -> Result<Vec<IndexRecord>> {
        self.calls.lock().unwrap().push(queries.to_vec());
        if self.fail {
            return Err(Error::Index("index unavailable".into()));
        }
        Ok(self
            .keys
            .iter()
            .map(|key| IndexRecord {
                key: key.clone(),
                bucket: None,
            })
            .collect())
    }
}

pub fn config(insert_size: usize, concurrency: usize) -> PipelineConfig {
    PipelineConfig {
        insert_size,
        concurrency,
        throttle: Duration::ZERO,
        ..PipelineConfig::default()
    }
}

pub fn load_cache(dir: &Path) -> Arc<AsyncMutex<DedupCache>> {
    Arc::new(AsyncMutex::new(DedupCache::load(dir.join("ids.cache")).unwrap()))
}

/// Dispatcher using the local cache in `dir` for dedup.
pub fn cache_dispatcher(
    dir: &Path,
    config: PipelineConfig,
    sink: impl DeliverySink + 'static,
) -> Dispatcher {
    let cache = load_cache(dir);
    Dispatcher::new(
        config,
        DedupOracle::LocalCache(cache.clone()),
        Box::new(sink),
        cache,
        ProgressLog::new(dir.join("progress.log")),
    )
}

/// Dispatcher asking `index` for duplicates.
pub fn index_dispatcher(
    dir: &Path,
    config: PipelineConfig,
    sink: MemorySink,
    index: RecordingIndex,
) -> Dispatcher {
    Dispatcher::new(
        config,
        DedupOracle::RemoteIndex(Box::new(index)),
        Box::new(sink),
        load_cache(dir),
        ProgressLog::new(dir.join("progress.log")),
    )
}

pub fn log_lines(dir: &Path) -> Vec<String> {
    std::fs::read_to_string(dir.join("progress.log"))
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

pub fn count_entries(lines: &[String], kind: &str) -> usize {
    let marker = format!(" - {kind} ");
    lines.iter().filter(|line| line.contains(&marker)).count()
}

/// Descriptor id of a `yyyy-mm-dd/{id}.eml` path.
pub fn id_of(path: &str) -> u64 {
    pst_migrate::path::DestinationPath::parse_key(path)
        .unwrap()
        .descriptor_id()
}
