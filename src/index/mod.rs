//! Remote index of already-migrated messages.

pub mod graphql;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::Result;

/// Messages of one sender whose subject is in `subjects`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexQuery {
    pub sender: String,
    pub subjects: Vec<String>,
}

/// A migrated object known to the index.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IndexRecord {
    pub key: String,
    #[serde(default)]
    pub bucket: Option<String>,
}

#[async_trait]
pub trait RemoteIndex: Send + Sync {
    /// Return every record matching any of `queries`, in a single round
    /// trip.
    async fn query(&self, queries: &[IndexQuery]) -> Result<Vec<IndexRecord>>;
}
