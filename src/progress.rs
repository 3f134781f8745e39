//! Append-only progress log.
//!
//! Each record is a `{timestamp} - {message}` line. The file is for humans
//! auditing or resuming a run; nothing reads it back.

use std::path::{Path, PathBuf};

use chrono::Local;
use futures::lock::Mutex;
use tokio::io::AsyncWriteExt;
use tracing::{error, info};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub struct ProgressLog {
    path: PathBuf,
    // Serializes appends from concurrent deliveries.
    lock: Mutex<()>,
}

impl ProgressLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `message` to the log. Write failures are reported and
    /// swallowed.
    pub async fn record(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        info!(target: "progress", "{message}");

        let line = format!("{} - {message}\n", Local::now().format(TIMESTAMP_FORMAT));
        let _guard = self.lock.lock().await;
        if let Err(e) = self.append(line.as_bytes()).await {
            error!(path = %self.path.display(), error = %e, "Cannot write progress log");
        }
    }

    async fn append(&self, line: &[u8]) -> std::io::Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line).await?;
        file.flush().await
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[tokio::test]
    async fn test_record_appends_lines() {
        let dir = tempdir().unwrap();
        let log = ProgressLog::new(dir.path().join("progress.log"));
        log.record("first").await;
        log.record(String::from("second")).await;

        let content = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" - first"));
        assert!(lines[1].ends_with(" - second"));
        // "YYYY-mm-dd HH:MM:SS"
        assert_eq!(lines[0].find(" - "), Some(19));
    }

    #[tokio::test]
    async fn test_record_survives_unwritable_path() {
        let dir = tempdir().unwrap();
        let log = ProgressLog::new(dir.path());
        log.record("lost").await;
    }
}
