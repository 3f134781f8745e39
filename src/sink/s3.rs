use async_trait::async_trait;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;

use super::{DeliverySink, Metadata};
use crate::error::{Error, Result};

const CONTENT_TYPE: &str = "message/rfc822";

/// Uploads messages to an S3 bucket under a fixed key prefix.
#[derive(Debug, Clone)]
pub struct S3Sink {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: String,
}

impl S3Sink {
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>, prefix: &str) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            prefix: normalize_prefix(prefix),
        }
    }

    pub fn key(&self, path: &str) -> String {
        format!("{}{}", self.prefix, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl DeliverySink for S3Sink {
    async fn put(&self, path: &str, body: Bytes, metadata: &Metadata) -> Result<String> {
        let key = self.key(path);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .content_type(CONTENT_TYPE)
            .set_metadata(Some(metadata.clone().into_iter().collect()))
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| Error::Delivery {
                path: path.to_string(),
                reason: DisplayErrorContext(e).to_string(),
            })?;
        Ok(format!("s3://{}/{}", self.bucket, key))
    }
}

/// `a/b` and `/a/b/` both become `a/b/`; an empty prefix stays empty.
fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}
