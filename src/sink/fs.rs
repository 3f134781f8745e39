use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;

use super::{DeliverySink, Metadata};
use crate::error::{Error, Result};

/// Writes messages below a local directory. Used by the dev stage.
#[derive(Debug, Clone)]
pub struct FsSink {
    root: PathBuf,
}

impl FsSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl DeliverySink for FsSink {
    async fn put(&self, path: &str, body: Bytes, _metadata: &Metadata) -> Result<String> {
        let target = self.root.join(path.trim_start_matches('/'));
        let delivery = |e: std::io::Error| Error::Delivery {
            path: path.to_string(),
            reason: e.to_string(),
        };

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(delivery)?;
        }
        tokio::fs::write(&target, &body).await.map_err(delivery)?;
        Ok(target.display().to_string())
    }
}
