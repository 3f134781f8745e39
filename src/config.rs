//! Run configuration.
//!
//! Every option can be passed as a flag or through the environment variable
//! named next to it, so the same binary runs from a shell or as a batch job.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::error::{Error, Result};
use crate::stream::DEFAULT_CHUNK_SIZE;

pub const DEFAULT_INSERT_SIZE: usize = 10;
pub const DEFAULT_CONCURRENCY: usize = 5;
pub const DEFAULT_THROTTLE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Stage {
    /// Write EML files below the output directory.
    Dev,
    /// Upload EML objects to S3.
    Prod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DedupStrategy {
    /// Skip ids recorded in the local cache file.
    Cache,
    /// Ask the remote email index by sender and subject.
    Remote,
}

/// Knobs of the batch pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Messages per batch.
    pub insert_size: usize,
    /// Bytes requested per attachment read.
    pub chunk_size: usize,
    /// Deliveries in flight at once.
    pub concurrency: usize,
    /// Pause after each batch that delivered something.
    pub throttle: Duration,
    /// Put the archive's transit headers in front of the encoded message.
    /// Content headers such as Content-Type are never prepended.
    pub prepend_raw_headers: bool,
    /// Disambiguator appended to destination file names.
    pub path_suffix: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            insert_size: DEFAULT_INSERT_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            throttle: DEFAULT_THROTTLE,
            prepend_raw_headers: false,
            path_suffix: None,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.insert_size == 0 {
            return Err(Error::Config("insert size must be at least 1".into()));
        }
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk size must be at least 1".into()));
        }
        if self.concurrency == 0 {
            return Err(Error::Config("concurrency must be at least 1".into()));
        }
        if let Some(suffix) = &self.path_suffix {
            if suffix.contains(['/', '.']) {
                return Err(Error::Config(format!(
                    "path suffix '{suffix}' may not contain '/' or '.'"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Migrate a PST archive into individual EML objects")]
pub struct Args {
    /// Local PST file to migrate.
    #[arg(long, env = "PST_FILE")]
    pub archive: Option<PathBuf>,

    /// Bucket holding the PST file, when it must be downloaded first.
    #[arg(long, env = "SOURCE_BUCKET", requires = "source_key")]
    pub source_bucket: Option<String>,

    #[arg(long, env = "SOURCE_KEY", requires = "source_bucket")]
    pub source_key: Option<String>,

    /// Already-extracted `readpst` output; skips download and extraction.
    #[arg(long, env = "EXTRACTED_DIR")]
    pub extracted_dir: Option<PathBuf>,

    #[arg(long, env = "WORK_DIR", default_value = "/scratch")]
    pub work_dir: PathBuf,

    #[arg(long, env = "READPST_PATH", default_value = "readpst")]
    pub readpst_path: String,

    #[arg(long, env = "STAGE", value_enum, default_value_t = Stage::Dev)]
    pub stage: Stage,

    /// Destination directory for the dev stage (defaults to `<work-dir>/output`).
    #[arg(long, env = "OUTPUT_DIR")]
    pub output_dir: Option<PathBuf>,

    /// Destination bucket for the prod stage.
    #[arg(long, env = "BUCKET")]
    pub bucket: Option<String>,

    #[arg(long, env = "REGION")]
    pub region: Option<String>,

    #[arg(long, env = "COMPANY_ID", default_value = "")]
    pub company_id: String,

    #[arg(long, env = "COMPANY_EMAIL", default_value = "")]
    pub company_email: String,

    #[arg(long, env = "GROUP_ID", default_value = "")]
    pub group_id: String,

    #[arg(long, env = "INSERT_SIZE", default_value_t = DEFAULT_INSERT_SIZE)]
    pub insert_size: usize,

    #[arg(long, env = "CHUNK_SIZE", default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,

    #[arg(long, env = "CONCURRENCY", default_value_t = DEFAULT_CONCURRENCY)]
    pub concurrency: usize,

    /// Seconds to wait between batches that delivered messages.
    #[arg(long, env = "THROTTLE_SECS", default_value_t = DEFAULT_THROTTLE.as_secs())]
    pub throttle_secs: u64,

    /// Copy the archived transit headers (Received, Return-Path, X-* and
    /// similar) in front of each encoded message
    #[arg(long, env = "PREPEND_RAW_HEADERS")]
    pub prepend_raw_headers: bool,

    #[arg(long, env = "PATH_SUFFIX")]
    pub path_suffix: Option<String>,

    #[arg(long, env = "DEDUP_STRATEGY", value_enum, default_value_t = DedupStrategy::Cache)]
    pub dedup: DedupStrategy,

    #[arg(long, env = "CACHE_FILE", default_value = "migrated.cache")]
    pub cache_file: PathBuf,

    #[arg(long, env = "LOG_FILE", default_value = "migration.log")]
    pub log_file: PathBuf,

    #[arg(long, env = "HASURA_ENDPOINT")]
    pub hasura_endpoint: Option<String>,

    #[arg(long, env = "ID_URL")]
    pub id_url: Option<String>,

    #[arg(long, env = "SERVICE_ID")]
    pub service_id: Option<String>,

    #[arg(long, env = "SERVICE_SECRET", hide_env_values = true)]
    pub service_secret: Option<String>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Credentials and endpoint of the remote email index.
#[derive(Debug, Clone)]
pub struct IndexConfig {
    pub endpoint: String,
    pub id_url: String,
    pub service_id: String,
    pub service_secret: String,
}

impl Args {
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            insert_size: self.insert_size,
            chunk_size: self.chunk_size,
            concurrency: self.concurrency,
            throttle: Duration::from_secs(self.throttle_secs),
            prepend_raw_headers: self.prepend_raw_headers,
            path_suffix: self.path_suffix.clone().filter(|s| !s.is_empty()),
        }
    }

    /// Key prefix of delivered objects: `{company_id}/{company_email}`.
    pub fn destination_prefix(&self) -> String {
        [self.company_id.as_str(), self.company_email.as_str()]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.output_dir
            .clone()
            .unwrap_or_else(|| self.work_dir.join("output"))
    }

    pub fn index_config(&self) -> Result<IndexConfig> {
        let missing = |name: &str| Error::Config(format!("remote dedup requires --{name}"));
        Ok(IndexConfig {
            endpoint: self.hasura_endpoint.clone().ok_or_else(|| missing("hasura-endpoint"))?,
            id_url: self.id_url.clone().ok_or_else(|| missing("id-url"))?,
            service_id: self.service_id.clone().ok_or_else(|| missing("service-id"))?,
            service_secret: self
                .service_secret
                .clone()
                .ok_or_else(|| missing("service-secret"))?,
        })
    }

    /// Check that the options describe a runnable migration.
    pub fn validate(&self) -> Result<()> {
        self.pipeline_config().validate()?;

        let sources = [
            self.archive.is_some(),
            self.source_bucket.is_some(),
            self.extracted_dir.is_some(),
        ];
        match sources.iter().filter(|s| **s).count() {
            0 => {
                return Err(Error::Config(
                    "one of --archive, --source-bucket or --extracted-dir is required".into(),
                ))
            }
            1 => {}
            _ => {
                return Err(Error::Config(
                    "--archive, --source-bucket and --extracted-dir are exclusive".into(),
                ))
            }
        }

        if self.stage == Stage::Prod && self.bucket.is_none() {
            return Err(Error::Config("the prod stage requires --bucket".into()));
        }
        if self.dedup == DedupStrategy::Remote {
            self.index_config()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("pst-migrate").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        let args = parse(&["--archive", "backup.pst"]);
        assert_eq!(args.pipeline_config(), PipelineConfig::default());
        assert_eq!(args.stage, Stage::Dev);
        assert_eq!(args.dedup, DedupStrategy::Cache);
        assert_eq!(args.output_dir(), PathBuf::from("/scratch/output"));
        args.validate().unwrap();
    }

    #[test]
    fn test_destination_prefix() {
        let args = parse(&["--archive", "a.pst", "--company-id", "acme", "--company-email", "ops@acme.test"]);
        assert_eq!(args.destination_prefix(), "acme/ops@acme.test");
        assert_eq!(parse(&["--archive", "a.pst"]).destination_prefix(), "");
    }

    #[test]
    fn test_validate_rejects_bad_options() {
        assert!(parse(&[]).validate().is_err());
        assert!(parse(&["--archive", "a.pst", "--extracted-dir", "x"]).validate().is_err());
        assert!(parse(&["--archive", "a.pst", "--stage", "prod"]).validate().is_err());
        assert!(parse(&["--archive", "a.pst", "--insert-size", "0"]).validate().is_err());
        assert!(parse(&["--archive", "a.pst", "--path-suffix", "a/b"]).validate().is_err());
        assert!(parse(&["--archive", "a.pst", "--dedup", "remote"]).validate().is_err());
    }

    #[test]
    fn test_remote_dedup_with_credentials() {
        let args = parse(&[
            "--archive",
            "a.pst",
            "--dedup",
            "remote",
            "--hasura-endpoint",
            "https://index.test",
            "--id-url",
            "https://id.test/token",
            "--service-id",
            "svc",
            "--service-secret",
            "s3cret",
        ]);
        args.validate().unwrap();
        assert_eq!(args.index_config().unwrap().service_id, "svc");
    }
}
