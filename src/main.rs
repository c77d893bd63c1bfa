//! # top500_harvest
//!
//! Acquires the TOP500 ranked lists of supercomputers together with the site
//! and system detail pages they reference, extracts structured records from
//! the HTML, and persists the resulting graph into SQLite.
//!
//! ## Usage
//!
//! ```sh
//! top500_harvest -d ./data harvest --all --details
//! ```
//!
//! ## Architecture
//!
//! 1. **Fetching**: list pages and detail pages land in an on-disk cache that
//!    makes reruns resumable
//! 2. **Extraction**: fixed structural positions in each page become records
//! 3. **Persistence**: one transaction per list, sites and items before rankings
//!
//! The [`orchestrator`] drives these stages per list id.

use std::error::Error;
use std::time::Instant;

use chrono::Utc;
use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod cli;
mod config;
mod error;
mod extract;
mod fetch;
mod models;
mod orchestrator;
mod store;
mod utils;

use cli::{Cli, Command};
use config::HarvestConfig;
use error::{HarvestError, Result};
use extract::item::{DISPATCH, attribute_labels, parse_item};
use extract::site::parse_site;
use fetch::{DetailKind, FetchCache, Fetcher, load_document};
use models::ListId;
use orchestrator::{Orchestrator, RunMode};
use store::Store;
use utils::ensure_writable_dir;

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = Instant::now();
    let cli = Cli::parse();
    let config = HarvestConfig::from(&cli);
    debug!(?config, "Resolved configuration");

    match &cli.command {
        Command::Harvest(args) => {
            let (ids, mode) = match args.list {
                Some(id) => (vec![id], RunMode::Single),
                None => (ListId::all(config.start_year, Utc::now().date_naive()), RunMode::Batch),
            };
            harvest(config, &ids, mode).await?;
        }
        Command::ShowSite { id } => {
            let html = load_cached(&config, DetailKind::Site, *id).await?;
            println!("{}", serde_json::to_string_pretty(&parse_site(&html, *id)?)?);
        }
        Command::ShowItem { id } => {
            let html = load_cached(&config, DetailKind::Item, *id).await?;
            println!("{}", serde_json::to_string_pretty(&parse_item(&html, *id)?)?);
        }
        Command::Survey => survey(&config).await?,
        Command::Import => import(&config).await?,
    }

    let elapsed = start_time.elapsed();
    info!(secs = elapsed.as_secs(), millis = elapsed.subsec_millis(), "Execution complete");
    Ok(())
}

async fn harvest(config: HarvestConfig, ids: &[ListId], mode: RunMode) -> Result<()> {
    ensure_writable_dir(&config.datadir).await?;
    let store = Store::open(&config.database, config.conflict_policy).await?;
    if config.init_db {
        store.reset().await?;
    }
    let fetcher = Fetcher::new(&config)?;
    info!(
        lists = ids.len(),
        network = config.network,
        details = config.details,
        workers = config.workers,
        "Harvest starting"
    );

    let orchestrator = Orchestrator::new(config, fetcher, store);
    let result = orchestrator.run(ids, mode).await;
    orchestrator.store().close().await;

    let summary = result?;
    for (id, reason) in &summary.failures {
        warn!(list = %id, %reason, "List not stored");
    }
    Ok(())
}

async fn load_cached(config: &HarvestConfig, kind: DetailKind, id: u64) -> Result<String> {
    let path = FetchCache::new(&config.datadir).detail_path(kind, id);
    if !FetchCache::is_fetched(&path).await {
        return Err(HarvestError::CacheMiss(path));
    }
    load_document(&path).await
}

/// Count attribute labels across every cached system page.
async fn survey(config: &HarvestConfig) -> Result<()> {
    let cache = FetchCache::new(&config.datadir);
    let store = Store::open(&config.database, config.conflict_policy).await?;

    let ids = cache.cached_ids(DetailKind::Item).await?;
    let mut labels = Vec::new();
    for &id in &ids {
        let html = load_document(&cache.detail_path(DetailKind::Item, id)).await?;
        match attribute_labels(&html, id) {
            Ok(found) => labels.extend(found),
            Err(e) => warn!(item = id, error = %e, "Skipping page"),
        }
    }

    store.clear_labels().await?;
    store.record_labels(&labels).await?;
    let counts = store.label_counts().await?;
    info!(pages = ids.len(), labels = counts.len(), "Survey complete");

    for (label, count) in &counts {
        let known = if DISPATCH.contains_key(label.as_str()) { "" } else { "  (unknown)" };
        println!("{count:>8}  {label}{known}");
    }
    store.close().await;
    Ok(())
}

/// Store every cached site and system page, independent of any list.
async fn import(config: &HarvestConfig) -> Result<()> {
    let cache = FetchCache::new(&config.datadir);
    let store = Store::open(&config.database, config.conflict_policy).await?;

    let mut sites = Vec::new();
    for id in cache.cached_ids(DetailKind::Site).await? {
        let html = load_document(&cache.detail_path(DetailKind::Site, id)).await?;
        match parse_site(&html, id) {
            Ok(site) => sites.push(site),
            Err(e) => warn!(site = id, error = %e, "Skipping page"),
        }
    }
    let mut items = Vec::new();
    for id in cache.cached_ids(DetailKind::Item).await? {
        let html = load_document(&cache.detail_path(DetailKind::Item, id)).await?;
        match parse_item(&html, id) {
            Ok(item) => items.push(item),
            Err(e) => warn!(item = id, error = %e, "Skipping page"),
        }
    }

    let counts = store.write_records(&sites, &items).await?;
    info!(sites = counts.sites, items = counts.items, "Import complete");
    store.close().await;
    Ok(())
}
