use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use tallyd::agent::codec;
use tallyd::agent::{Agent, CompressedBucket, MemoryBucketCache, Transport};
use tallyd::aggregator::clickhouse::ClickHouseSink;
use tallyd::aggregator::{Aggregator, AggregatorBucket};
use tallyd::config::Config;
use tallyd::env::listen_env_file;
use tallyd::format::{StaticMetaProvider, TAG_VALUE_ID_COMPONENT_AGGREGATOR};

/// Metrics collection agent and aggregator.
#[derive(Parser)]
#[command(name = "tallyd", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("tallyd {}", version::full());
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;
    fmt().with_env_filter(filter).with_target(true).init();

    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;
    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting tallyd",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;
    rt.block_on(async { run(cfg).await })
}

/// In-process transport: shipped buckets go straight to the aggregator
/// task. The networked transport between separate agent and aggregator
/// deployments is an external collaborator.
struct LoopbackTransport {
    tx: tokio::sync::mpsc::UnboundedSender<CompressedBucket>,
}

impl Transport for LoopbackTransport {
    fn ship(&self, bucket: &CompressedBucket) -> Result<()> {
        self.tx
            .send(bucket.clone())
            .map_err(|_| anyhow::anyhow!("aggregator loop stopped"))
    }
}

async fn run(cfg: Config) -> Result<()> {
    let cancel = tokio_util::sync::CancellationToken::new();

    let env_loader = listen_env_file(&cfg.env_file_path, cancel.clone());
    let environment = env_loader.load();
    if !environment.hostname.is_empty() {
        tracing::info!(hostname = %environment.hostname, env = %environment.env, "host environment");
    }

    let meta = Arc::new(StaticMetaProvider::new());
    meta.set_journal(1, "0000000000000000");

    let (bucket_tx, mut bucket_rx) = tokio::sync::mpsc::unbounded_channel::<CompressedBucket>();
    let transport = Arc::new(LoopbackTransport { tx: bucket_tx });
    let cache = Arc::new(MemoryBucketCache::default());

    let mut agent = Agent::new(
        cfg.agent.clone(),
        Arc::clone(&meta) as Arc<dyn tallyd::format::MetaProvider>,
        transport,
        cache,
        version::RELEASE,
    )?;
    agent.start()?;

    let aggregator = Arc::new(Aggregator::new(
        cfg.aggregator.clone(),
        Arc::clone(&meta) as Arc<dyn tallyd::format::MetaProvider>,
        TAG_VALUE_ID_COMPONENT_AGGREGATOR,
    ));
    let sink = ClickHouseSink::new(
        &cfg.aggregator.insert_addr,
        &cfg.aggregator.insert_table,
        cfg.aggregator.insert_timeout,
    )?;
    let compression = cfg.agent.compression.clone();
    let agg_cancel = cancel.clone();
    let agg_task = tokio::spawn(async move {
        loop {
            let compressed = tokio::select! {
                _ = agg_cancel.cancelled() => return,
                received = bucket_rx.recv() => match received {
                    Some(b) => b,
                    None => return,
                },
            };
            let payload = match codec::decompress_frame(&compressed.data, &compression) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(error = %e, "dropping undecodable bucket frame");
                    continue;
                }
            };
            let bucket = match codec::decode_bucket(&payload) {
                Ok(b) => b,
                Err(e) => {
                    tracing::warn!(error = %e, "dropping unparsable bucket payload");
                    continue;
                }
            };
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs() as u32;
            let time = aggregator.clamp_bucket_time(bucket.time, now);
            let mut agg_bucket = AggregatorBucket::new(time);
            agg_bucket.merge_contributor(&bucket, false);
            let mut batch = [agg_bucket];
            if let Err(e) = aggregator.insert_buckets(&sink, &mut batch).await {
                if e.is_permanent() {
                    tracing::error!(error = %e, "batch dropped");
                }
            }
        }
    });

    // Shut down on SIGINT/SIGTERM.
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;
    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
        _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
    }

    agent.stop().await;
    cancel.cancel();
    let _ = agg_task.await;

    tracing::info!("tallyd stopped");
    Ok(())
}
