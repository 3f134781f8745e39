//! Decides which messages of a batch were already migrated.
//!
//! Two strategies share one contract: the local cache knows exactly what
//! this process (or an earlier run sharing the cache file) delivered; the
//! remote index matches by sender and subject and recovers descriptor ids
//! from the destination paths of prior deliveries. Sender and subject
//! matching can miss copies whose subject was edited, and will not look at
//! messages whose sender was rendered differently downstream.
//!
//! The index is assumed to store the bare sender address in `from`, not the
//! `Name <address>` form written into the From header, so queries match on
//! the address alone. A sender without an address is queried by display
//! name, which only matches if the index stored the same name.

pub mod cache;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use futures::lock::Mutex;
use tracing::debug;

use crate::archive::ArchiveMessage;
use crate::error::{Error, Result};
use crate::index::{IndexQuery, RemoteIndex};
use crate::path::DestinationPath;

pub use cache::DedupCache;

/// A batch split into messages to deliver and already-migrated ones, each
/// in original order.
#[derive(Debug)]
pub struct Classified<M> {
    pub fresh: Vec<M>,
    pub duplicates: Vec<M>,
}

pub enum DedupOracle {
    LocalCache(Arc<Mutex<DedupCache>>),
    RemoteIndex(Box<dyn RemoteIndex>),
}

impl DedupOracle {
    /// Partition `batch`. Nothing is mutated; any failure is a
    /// classification error.
    pub async fn classify<M: ArchiveMessage>(&self, batch: Vec<M>) -> Result<Classified<M>> {
        let migrated = self.migrated_ids(&batch).await.map_err(Error::classification)?;

        let (duplicates, fresh): (Vec<M>, Vec<M>) = batch
            .into_iter()
            .partition(|message| migrated.contains(&message.descriptor_id()));
        Ok(Classified { fresh, duplicates })
    }

    async fn migrated_ids<M: ArchiveMessage>(&self, batch: &[M]) -> Result<HashSet<u64>> {
        if batch.is_empty() {
            return Ok(HashSet::new());
        }

        match self {
            Self::LocalCache(cache) => {
                let cache = cache.lock().await;
                Ok(batch
                    .iter()
                    .map(ArchiveMessage::descriptor_id)
                    .filter(|id| cache.contains(*id))
                    .collect())
            }
            Self::RemoteIndex(index) => {
                let records = index.query(&index_queries(batch)).await?;
                let mut ids = HashSet::new();
                for record in records {
                    match DestinationPath::parse_key(&record.key) {
                        Some(path) => {
                            ids.insert(path.descriptor_id());
                        }
                        None => debug!(key = %record.key, "Ignoring unrecognised object key"),
                    }
                }
                Ok(ids)
            }
        }
    }
}

/// One query per distinct sender, covering every subject that sender has in
/// the batch.
pub fn index_queries<M: ArchiveMessage>(batch: &[M]) -> Vec<IndexQuery> {
    let mut by_sender: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for message in batch {
        by_sender
            .entry(index_sender(message))
            .or_default()
            .insert(message.subject().to_string());
    }

    by_sender
        .into_iter()
        .map(|(sender, subjects)| IndexQuery {
            sender,
            subjects: subjects.into_iter().collect(),
        })
        .collect()
}

/// Sender as the index stores it: the address, or the name when the archive
/// has no address.
fn index_sender<M: ArchiveMessage + ?Sized>(message: &M) -> String {
    let address = message.sender_address().trim();
    if address.is_empty() {
        message.sender_name().trim().to_string()
    } else {
        address.to_string()
    }
}
