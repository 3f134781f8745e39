use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use futures::lock::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use pst_migrate::archive::extracted::ExtractedFolder;
use pst_migrate::config::{Args, DedupStrategy, Stage};
use pst_migrate::dedup::{DedupCache, DedupOracle};
use pst_migrate::dispatch::Dispatcher;
use pst_migrate::index::graphql::{GraphqlIndex, ServiceTokens};
use pst_migrate::progress::ProgressLog;
use pst_migrate::sink::{DeliverySink, FsSink, Metadata, S3Sink};
use pst_migrate::walk::Walker;

fn setup_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,pst_migrate={level},progress={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn s3_client(region: Option<&str>) -> aws_sdk_s3::Client {
    let cfg = match region {
        Some(region) => {
            aws_config::defaults(aws_config::BehaviorVersion::latest())
                .region(aws_config::Region::new(region.to_string()))
                .load()
                .await
        }
        None => aws_config::load_from_env().await,
    };
    aws_sdk_s3::Client::new(&cfg)
}

async fn download_file(s3: &aws_sdk_s3::Client, bucket: &str, key: &str, path: &Path) -> Result<()> {
    let obj = s3
        .get_object()
        .bucket(bucket)
        .key(key)
        .send()
        .await
        .with_context(|| format!("download s3://{}/{}", bucket, key))?;
    let mut reader = obj.body.into_async_read();
    let mut file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("create {}", path.display()))?;
    tokio::io::copy(&mut reader, &mut file)
        .await
        .with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

fn run_readpst(readpst_path: &str, pst_path: &Path, out_dir: &Path) -> Result<()> {
    let status = Command::new(readpst_path)
        .args([
            "-e",
            "-o",
            out_dir
                .to_str()
                .ok_or_else(|| anyhow!("invalid out_dir"))?,
            pst_path
                .to_str()
                .ok_or_else(|| anyhow!("invalid pst_path"))?,
        ])
        .status()
        .with_context(|| format!("spawn {}", readpst_path))?;
    if !status.success() {
        return Err(anyhow!("readpst failed with status {}", status));
    }
    Ok(())
}

/// Locate (downloading and extracting when needed) the extraction tree.
async fn prepare_archive(args: &Args) -> Result<PathBuf> {
    if let Some(dir) = &args.extracted_dir {
        return Ok(dir.clone());
    }

    let extract_dir = args.work_dir.join("extract");
    std::fs::create_dir_all(&extract_dir).context("create extract dir")?;

    let pst_path = match (&args.archive, &args.source_bucket, &args.source_key) {
        (Some(path), _, _) => path.clone(),
        (None, Some(bucket), Some(key)) => {
            let s3 = s3_client(args.region.as_deref()).await;
            let path = args.work_dir.join("input.pst");
            download_file(&s3, bucket, key, &path).await?;
            path
        }
        _ => return Err(anyhow!("no archive source given")),
    };

    info!(pst = %pst_path.display(), out = %extract_dir.display(), "Extracting archive");
    run_readpst(&args.readpst_path, &pst_path, &extract_dir)?;
    Ok(extract_dir)
}

async fn delivery_sink(args: &Args) -> Result<Box<dyn DeliverySink>> {
    Ok(match args.stage {
        Stage::Dev => {
            let root = args.output_dir().join(args.destination_prefix());
            Box::new(FsSink::new(root))
        }
        Stage::Prod => {
            let bucket = args
                .bucket
                .clone()
                .ok_or_else(|| anyhow!("the prod stage requires --bucket"))?;
            let s3 = s3_client(args.region.as_deref()).await;
            Box::new(S3Sink::new(s3, bucket, &args.destination_prefix()))
        }
    })
}

fn dedup_oracle(args: &Args, cache: &Arc<Mutex<DedupCache>>) -> Result<DedupOracle> {
    Ok(match args.dedup {
        DedupStrategy::Cache => DedupOracle::LocalCache(cache.clone()),
        DedupStrategy::Remote => {
            let index = args.index_config()?;
            let client = reqwest::Client::new();
            let tokens = ServiceTokens::new(
                client.clone(),
                index.id_url,
                index.service_id,
                index.service_secret,
            );
            DedupOracle::RemoteIndex(Box::new(GraphqlIndex::new(
                client,
                index.endpoint,
                args.company_id.clone(),
                tokens,
            )))
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.verbose);
    args.validate()?;
    let started = Instant::now();

    std::fs::create_dir_all(&args.work_dir).context("create work dir")?;
    let extract_dir = prepare_archive(&args).await?;
    let root = ExtractedFolder::open(&extract_dir)?;

    let cache = Arc::new(Mutex::new(
        DedupCache::load(&args.cache_file).context("load dedup cache")?,
    ));
    let run_id = Uuid::new_v4().to_string();
    let metadata = Metadata::from([
        ("group_id".to_string(), args.group_id.clone()),
        ("company_id".to_string(), args.company_id.clone()),
        ("run_id".to_string(), run_id.clone()),
    ]);

    let dispatcher = Dispatcher::new(
        args.pipeline_config(),
        dedup_oracle(&args, &cache)?,
        delivery_sink(&args).await?,
        cache.clone(),
        ProgressLog::new(&args.log_file),
    )
    .with_metadata(metadata);

    dispatcher
        .progress()
        .record(format!("run {run_id} started on {}", extract_dir.display()))
        .await;
    let report = Walker::new(&dispatcher).run(root).await?;
    dispatcher
        .progress()
        .record(format!(
            "run {run_id} finished: delivered={} duplicates={} failed={}",
            report.delivered, report.duplicates, report.failed
        ))
        .await;

    println!(
        "OK folders={} messages={} batches={} delivered={} duplicates={} failed={} duration_s={:.2}",
        report.folders,
        report.messages,
        report.batches,
        report.delivered,
        report.duplicates,
        report.failed,
        started.elapsed().as_secs_f64()
    );

    Ok(())
}
