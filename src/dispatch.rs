//! Batch dispatcher: classify a full batch, deliver the new messages with
//! bounded concurrency, log every outcome and throttle.

use std::sync::Arc;

use bytes::Bytes;
use futures::lock::Mutex;
use futures::{stream, StreamExt};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::archive::ArchiveMessage;
use crate::config::PipelineConfig;
use crate::dedup::{DedupCache, DedupOracle};
use crate::error::Result;
use crate::mail::MailBuilder;
use crate::path::DestinationPath;
use crate::progress::ProgressLog;
use crate::sink::{DeliverySink, Metadata};

/// Outcome counts of one flushed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub delivered: usize,
    pub failed: usize,
    pub duplicates: usize,
}

impl BatchReport {
    pub fn attempted(&self) -> usize {
        self.delivered + self.failed
    }
}

pub struct Dispatcher {
    config: PipelineConfig,
    builder: MailBuilder,
    oracle: DedupOracle,
    sink: Box<dyn DeliverySink>,
    cache: Arc<Mutex<DedupCache>>,
    progress: ProgressLog,
    metadata: Metadata,
}

impl Dispatcher {
    pub fn new(
        config: PipelineConfig,
        oracle: DedupOracle,
        sink: Box<dyn DeliverySink>,
        cache: Arc<Mutex<DedupCache>>,
        progress: ProgressLog,
    ) -> Self {
        Self {
            builder: MailBuilder::new(config.chunk_size, config.prepend_raw_headers),
            config,
            oracle,
            sink,
            cache,
            progress,
            metadata: Metadata::new(),
        }
    }

    /// Metadata attached to every delivered object, besides the
    /// per-message `descriptor_id` and `sha256` entries.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn progress(&self) -> &ProgressLog {
        &self.progress
    }

    /// Classify and deliver `batch`, leaving it empty.
    ///
    /// Only a classification failure is returned; per-message failures are
    /// logged and counted.
    pub async fn flush<M: ArchiveMessage>(&self, batch: &mut Vec<M>) -> Result<BatchReport> {
        let messages = std::mem::take(batch);
        let size = messages.len();

        let classified = match self.oracle.classify(messages).await {
            Ok(classified) => classified,
            Err(e) => {
                self.progress.record(format!("classification failed: {e}")).await;
                return Err(e);
            }
        };

        let outcomes: Vec<bool> = stream::iter(classified.fresh)
            .map(|message| self.deliver(message))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        for message in &classified.duplicates {
            self.progress
                .record(format!(
                    "duplicate {} - {}",
                    message.descriptor_id(),
                    message.subject()
                ))
                .await;
        }

        let delivered = outcomes.iter().filter(|ok| **ok).count();
        let report = BatchReport {
            delivered,
            failed: outcomes.len() - delivered,
            duplicates: classified.duplicates.len(),
        };
        info!(
            size,
            delivered = report.delivered,
            failed = report.failed,
            duplicates = report.duplicates,
            "Flushed batch"
        );

        if report.attempted() > 0 && !self.config.throttle.is_zero() {
            debug!(seconds = self.config.throttle.as_secs_f64(), "Throttling");
            tokio::time::sleep(self.config.throttle).await;
        }

        Ok(report)
    }

    /// Build, deliver, cache and log one message. Returns whether the
    /// delivery succeeded.
    async fn deliver<M: ArchiveMessage>(&self, message: M) -> bool {
        let descriptor_id = message.descriptor_id();
        let destination =
            DestinationPath::for_message(&message, self.config.path_suffix.as_deref());
        let path = destination.to_string();

        let result = async {
            let (_, encoded) = self.builder.build(&message)?;
            drop(message);
            let metadata = self.metadata_for(descriptor_id, &encoded);
            self.sink.put(&path, Bytes::from(encoded), &metadata).await
        }
        .await;

        match result {
            Ok(location) => {
                let cached = self.cache.lock().await.insert(&destination).await;
                if let Err(e) = cached {
                    warn!(descriptor_id, error = %e, "Delivered message not cached");
                    self.progress
                        .record(format!("cache write failed {descriptor_id}: {e}"))
                        .await;
                }
                self.progress
                    .record(format!("delivered {descriptor_id} to {location}"))
                    .await;
                true
            }
            Err(e) => {
                warn!(descriptor_id, error = %e, "Delivery failed");
                self.progress
                    .record(format!("failed {descriptor_id} ({path}): {e}"))
                    .await;
                false
            }
        }
    }

    fn metadata_for(&self, descriptor_id: u64, encoded: &[u8]) -> Metadata {
        let mut metadata = self.metadata.clone();
        metadata.insert("descriptor_id".into(), descriptor_id.to_string());
        metadata.insert("sha256".into(), format!("{:x}", Sha256::digest(encoded)));
        metadata
    }
}
