use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use chrono::Utc;
use chrono_tz::Tz;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use epg_scrape::config::{AppConfig, InputMode};
use epg_scrape::fetch::{Fetcher, ScrapeContext};
use epg_scrape::manifest::{self, RefreshOptions, RefreshOutcome};
use epg_scrape::orchestrator::{Orchestrator, scrape_one};
use epg_scrape::registry::default_registry;
use epg_scrape::store::{GuideStore, PostgrestStore, PublishOptions, publish};
use epg_scrape::{Source, live_channels, rows, sources};

#[derive(Parser)]
#[command(name = "epg-scrape", about = "Scrapes TV guide sites into a normalized programme table")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scrape every listed source and publish the rows.
    Scrape {
        /// Read sources from this CSV instead of the hosted table.
        #[arg(long)]
        csv: Option<PathBuf>,
        /// Print rows as JSON lines instead of publishing them.
        #[arg(long)]
        print: bool,
        /// Upsert without purging first.
        #[arg(long)]
        dry_run_purge: bool,
    },
    /// Scrape one URL and print its programmes.
    Parse {
        url: String,
        /// IANA zone of the listing; defaults to LOCAL_TZ.
        #[arg(long)]
        tz: Option<String>,
        #[arg(long)]
        hours_ahead: Option<i64>,
    },
    /// Sync the live channel table from iptv-org.
    LiveSync {
        /// Comma separated ISO country codes; defaults to LIVE_COUNTRIES.
        #[arg(long, value_delimiter = ',')]
        countries: Option<Vec<String>>,
    },
    /// Replace an expiring signed HLS manifest URL on a source row.
    RefreshManifest {
        #[arg(long, default_value = manifest::DEFAULT_PAGE)]
        page: String,
        #[arg(long, default_value = manifest::DEFAULT_PAGE)]
        source_link: String,
        #[arg(long)]
        channel_name: Option<String>,
        #[arg(long, default_value_t = manifest::DEFAULT_THRESHOLD_SECONDS)]
        threshold_seconds: i64,
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "epg_scrape=info".into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env()?;

    match cli.command {
        Command::Scrape {
            csv,
            print,
            dry_run_purge,
        } => run_scrape(config, csv, print, dry_run_purge).await,
        Command::Parse { url, tz, hours_ahead } => run_parse(config, url, tz, hours_ahead).await,
        Command::LiveSync { countries } => {
            let store = connect(&config)?;
            let fetcher = Fetcher::new(&config)?;
            let countries = countries.unwrap_or_else(|| config.live_countries.clone());
            let written = live_channels::sync(&fetcher, &store, &countries, Utc::now()).await?;
            info!("live sync done: {written} rows");
            Ok(())
        }
        Command::RefreshManifest {
            page,
            source_link,
            channel_name,
            threshold_seconds,
            force,
        } => {
            let store = connect(&config)?;
            let fetcher = Fetcher::new(&config)?;
            let options = RefreshOptions {
                page,
                source_link: Some(source_link).filter(|s| !s.is_empty()),
                channel_name,
                threshold_seconds,
                force,
            };
            match manifest::refresh_manifest(&store, &fetcher, &options, Utc::now()).await? {
                RefreshOutcome::StillFresh { seconds_left } => info!("manifest still fresh ({seconds_left}s left)"),
                RefreshOutcome::Updated { url, .. } => info!("manifest updated to {url}"),
            }
            Ok(())
        }
    }
}

fn connect(config: &AppConfig) -> anyhow::Result<PostgrestStore> {
    let credentials = config.store_credentials()?;
    let client = Fetcher::new(config)?.client().clone();
    Ok(PostgrestStore::new(credentials, client))
}

async fn run_scrape(mut config: AppConfig, csv: Option<PathBuf>, print: bool, dry_run_purge: bool) -> anyhow::Result<()> {
    if let Some(path) = &csv {
        config.input_mode = InputMode::Csv;
        config.csv_path = path.display().to_string();
    }
    config.dry_run_purge |= dry_run_purge;
    let fallback_tz = config.local_tz()?;

    // credentials are checked before any page is fetched
    let needs_store = !print || config.input_mode == InputMode::Supabase;
    let store = if needs_store { Some(connect(&config)?) } else { None };

    let entries = match (config.input_mode, &store) {
        (InputMode::Csv, _) => sources::read_csv(&config.csv_path)
            .with_context(|| format!("reading sources from {}", config.csv_path))?,
        (InputMode::Supabase, Some(store)) => store.read_sources().await.context("reading source table")?,
        (InputMode::Supabase, None) => bail!("no store configured"),
    };
    let sources = sources::into_sources(entries, fallback_tz, config.hours_ahead);
    info!("{} sources", sources.len());

    let now = Utc::now();
    let ctx = Arc::new(ScrapeContext::new(&config, now)?);
    let orchestrator = Orchestrator::new(default_registry(&ctx.options), ctx, config.scrape_concurrency);
    let report = orchestrator.scrape_all(sources).await;

    for url in &report.unmatched {
        warn!("unmatched source: {url}");
    }
    info!(
        "{} programmes from {} sources ({} failed, {} unmatched)",
        report.total_programmes(),
        report.results.len(),
        report.failed.len(),
        report.unmatched.len()
    );

    if print {
        for row in rows::dedupe_rows(rows::to_rows(&report.results)) {
            println!("{}", serde_json::to_string(&row)?);
        }
        return Ok(());
    }

    let Some(store) = store else {
        bail!("no store configured");
    };
    let options = PublishOptions {
        purge_hours_back: config.purge_hours_back,
        hours_ahead: config.hours_ahead,
        dry_run_purge: config.dry_run_purge,
    };
    let summary = publish(&store, &report.results, options, now).await?;
    info!(
        "published {} rows; purged {} sources; {} sources empty",
        summary.upserted,
        summary.purged_sources,
        summary.empty_sources.len()
    );
    Ok(())
}

async fn run_parse(config: AppConfig, url: String, tz: Option<String>, hours_ahead: Option<i64>) -> anyhow::Result<()> {
    let timezone = match tz {
        Some(name) => name.parse::<Tz>().map_err(|_| anyhow::anyhow!("not an IANA zone: {name}"))?,
        None => config.local_tz()?,
    };
    let ctx = ScrapeContext::new(&config, Utc::now())?;
    let registry = default_registry(&ctx.options);
    let Some(adapter) = registry.select(&url) else {
        bail!("no adapter handles {url}; known: {:?}", registry.names());
    };
    let source = Source {
        url,
        timezone,
        hours_ahead: hours_ahead.unwrap_or(config.hours_ahead),
    };
    let programmes = scrape_one(adapter.as_ref(), &ctx, &source).await?;
    info!("{}: {} programmes", adapter.name(), programmes.len());
    for programme in &programmes {
        println!("{}", serde_json::to_string(programme)?);
    }
    Ok(())
}
