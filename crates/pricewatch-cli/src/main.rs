use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use pricewatch_adapters::{FixtureSource, HttpClientConfig, HttpWorkerSource, SearchSource, WorkerRegistry};
use pricewatch_batch::BatchResult;
use pricewatch_catalog::render_markdown_report;
use pricewatch_cli::{collect_keywords, parse_since, WatchConfig};
use pricewatch_core::Platform;
use pricewatch_web::AppState;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pricewatch")]
#[command(about = "Marketplace price watch: batch search, canonical catalog, change monitor")]
struct Cli {
    /// Overrides PRICEWATCH_DATA_DIR.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run or resume a keyword x platform search batch.
    Batch(BatchArgs),
    /// Fold unimported result artifacts into the canonical catalog.
    Import {
        /// Re-feed artifacts that were already imported.
        #[arg(long)]
        force: bool,
    },
    /// Catalog totals and per-platform breakdown.
    Stats,
    /// Recorded price changes, newest first.
    Changes {
        /// RFC 3339 timestamp or look-back such as `24h` or `7d`.
        #[arg(long)]
        since: Option<String>,
        /// Minimum absolute move in percent.
        #[arg(long)]
        min_pct: Option<f64>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// One canonical product with its full price history, as JSON.
    Product { id: String },
    /// Markdown summary of the catalog and its latest changes.
    Report {
        #[arg(long, default_value_t = 20)]
        recent: usize,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Serve the read-only monitor API.
    Serve {
        /// Overrides PRICEWATCH_BIND.
        #[arg(long)]
        bind: Option<std::net::SocketAddr>,
    },
}

#[derive(Debug, Args)]
struct BatchArgs {
    /// Keyword to search; repeatable.
    #[arg(long = "keyword", short = 'k')]
    keywords: Vec<String>,
    /// `.txt` (one per line) or `.csv` (first column) keyword file.
    #[arg(long)]
    keywords_file: Option<PathBuf>,
    /// Comma-separated platforms; all platforms when omitted.
    #[arg(long, value_delimiter = ',')]
    platforms: Vec<Platform>,
    /// Results kept per keyword and platform.
    #[arg(long, default_value_t = 20)]
    limit: usize,
    #[arg(long)]
    concurrency: Option<usize>,
    /// Pause before each search, in milliseconds.
    #[arg(long)]
    delay_ms: Option<u64>,
    /// Continue a previous job after its checkpoint.
    #[arg(long)]
    resume: Option<String>,
    /// With --resume, search previously failed pairs again.
    #[arg(long, requires = "resume")]
    retry_failed: bool,
    /// Read canned results from this directory instead of calling workers.
    #[arg(long)]
    fixtures: Option<PathBuf>,
    /// Import the new artifacts once the batch finishes.
    #[arg(long)]
    import: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = WatchConfig::from_env();
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }

    match cli.command {
        Commands::Batch(args) => run_batch(config, args).await?,
        Commands::Import { force } => {
            let summary = config.importer().import_all(force).await?;
            println!(
                "import complete: artifacts={} imported={} skipped={} new_products={} updated_products={} price_changes={} rejected={} replayed={} failed_artifacts={} version={}",
                summary.artifacts_seen,
                summary.artifacts_imported,
                summary.artifacts_skipped,
                summary.new_products,
                summary.updated_products,
                summary.price_changes,
                summary.rejected,
                summary.replayed,
                summary.failed_artifacts.len(),
                summary.catalog_version
            );
        }
        Commands::Stats => {
            let stats = config.catalog_store().load().await?.get_stats();
            println!(
                "catalog v{}: products={} price_points={} changes={}",
                stats.version, stats.total_products, stats.total_price_points, stats.total_changes
            );
            for (platform, count) in &stats.platform_breakdown {
                println!("  {platform}: {count}");
            }
        }
        Commands::Changes { since, min_pct, limit } => {
            let since = since.as_deref().map(|s| parse_since(s, Utc::now())).transpose()?;
            let catalog = config.catalog_store().load().await?;
            let changes = catalog.get_price_changes(since, min_pct.map(|pct| pct / 100.0));
            if changes.is_empty() {
                println!("no price changes");
            }
            for change in changes.iter().take(limit) {
                let title = catalog
                    .get_product(&change.canonical_id)
                    .map(|p| p.display_title.as_str())
                    .unwrap_or("unknown product");
                println!(
                    "{} {:<14} {:>+7.1}%  ¥{} -> ¥{}  {} [{}]",
                    change.detected_at.format("%Y-%m-%d %H:%M"),
                    change.platform,
                    change.pct_change * 100.0,
                    change.old_price,
                    change.new_price,
                    title,
                    change.canonical_id
                );
            }
        }
        Commands::Product { id } => {
            let catalog = config.catalog_store().load().await?;
            let Some(product) = catalog.get_product(&id) else {
                bail!("product `{id}` not found");
            };
            println!("{}", serde_json::to_string_pretty(product)?);
        }
        Commands::Report { recent, out } => {
            let catalog = config.catalog_store().load().await?;
            let markdown = render_markdown_report(&catalog, recent);
            match out {
                Some(path) => {
                    std::fs::write(&path, &markdown)
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("report written: {}", path.display());
                }
                None => println!("{markdown}"),
            }
        }
        Commands::Serve { bind } => {
            let shutdown = shutdown_on_ctrl_c();
            let addr = bind.unwrap_or(config.bind);
            pricewatch_web::serve(addr, AppState::new(config.catalog_store()), shutdown).await?;
        }
    }

    Ok(())
}

async fn run_batch(mut config: WatchConfig, args: BatchArgs) -> Result<()> {
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency.max(1);
    }
    if let Some(delay_ms) = args.delay_ms {
        config.request_delay = Duration::from_millis(delay_ms);
    }

    let source: Arc<dyn SearchSource> = match &args.fixtures {
        Some(dir) => Arc::new(FixtureSource::new(dir)),
        None => {
            let registry = WorkerRegistry::load(&config.workers_file)?;
            Arc::new(HttpWorkerSource::new(&registry, HttpClientConfig::default())?)
        }
    };
    let orchestrator = config
        .orchestrator(source)
        .with_cancellation(shutdown_on_ctrl_c());

    let result = match &args.resume {
        Some(job_id) => orchestrator.resume(job_id, args.retry_failed).await?,
        None => {
            let keywords = collect_keywords(&args.keywords, args.keywords_file.as_deref())?;
            let platforms: BTreeSet<Platform> = if args.platforms.is_empty() {
                Platform::ALL.into_iter().collect()
            } else {
                args.platforms.iter().copied().collect()
            };
            orchestrator.run(keywords, platforms, args.limit).await?
        }
    };
    print_batch(&result);

    if args.import {
        let summary = config.importer().import_all(false).await?;
        println!(
            "import complete: imported={} new_products={} updated_products={} price_changes={} rejected={}",
            summary.artifacts_imported,
            summary.new_products,
            summary.updated_products,
            summary.price_changes,
            summary.rejected
        );
    }
    Ok(())
}

fn print_batch(result: &BatchResult) {
    let summary = &result.summary;
    println!(
        "batch {}: status={:?} succeeded={} failed={} products={} checkpoint={} elapsed={:.1}s{}",
        summary.job_id,
        summary.status,
        summary.tasks_succeeded,
        summary.tasks_failed,
        summary.products_found,
        summary
            .checkpoint
            .map(|c| c.to_string())
            .unwrap_or_else(|| "none".to_string()),
        summary.elapsed_secs,
        if summary.cancelled { " (cancelled; resume with --resume)" } else { "" }
    );
    for item in &summary.failed_items {
        println!(
            "  failed: {} on {} after {} attempt(s): {}",
            item.keyword, item.platform, item.attempts, item.last_error
        );
    }
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("ctrl-c received; shutting down");
                trigger.cancel();
            }
            Err(err) => warn!(error = %err, "could not listen for ctrl-c"),
        }
    });
    token
}
