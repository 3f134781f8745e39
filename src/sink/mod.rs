//! Destination stores for encoded messages.

pub mod fs;
pub mod s3;

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

pub use fs::FsSink;
pub use s3::S3Sink;

/// Object metadata attached to each delivery.
pub type Metadata = BTreeMap<String, String>;

#[async_trait]
pub trait DeliverySink: Send + Sync {
    /// Store `body` under `path` and return a descriptor of where it landed.
    ///
    /// Failures are not retried by the caller.
    async fn put(&self, path: &str, body: Bytes, metadata: &Metadata) -> Result<String>;
}
