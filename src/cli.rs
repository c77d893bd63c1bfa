//! Command-line interface definitions for top500_harvest.
//!
//! Data directory, database path and source URL can also come from the
//! environment (`HARVEST_DATADIR`, `HARVEST_DATABASE`, `HARVEST_BASE_URL`).

use std::path::PathBuf;

use clap::{ArgGroup, Args, Parser, Subcommand};

use crate::config::{DEFAULT_BASE_URL, DEFAULT_DATADIR};
use crate::models::{FIRST_YEAR, ListId};
use crate::store::ConflictPolicy;

/// Command-line arguments.
///
/// # Examples
///
/// ```sh
/// # Every published list, cache only
/// top500_harvest -d ./data harvest --all --no-fetch
///
/// # One list with its site and system pages; errors exit non-zero
/// top500_harvest -d ./data harvest --list 202306 --details
///
/// # Inspect one cached system page
/// top500_harvest -d ./data show-item 179807
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Directory holding the fetch cache
    #[arg(short, long, env = "HARVEST_DATADIR", default_value = DEFAULT_DATADIR)]
    pub datadir: PathBuf,

    /// SQLite database file [default: <datadir>/top500.sqlite3]
    #[arg(long, env = "HARVEST_DATABASE")]
    pub database: Option<PathBuf>,

    /// Base URL of the list publisher
    #[arg(long, env = "HARVEST_BASE_URL", default_value = DEFAULT_BASE_URL)]
    pub base_url: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fetch, parse and store lists
    Harvest(HarvestArgs),
    /// Parse one cached site page and print it as JSON
    ShowSite { id: u64 },
    /// Parse one cached system page and print it as JSON
    ShowItem { id: u64 },
    /// Count attribute labels across all cached system pages
    Survey,
    /// Store every cached site and system page
    Import,
}

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("target").required(true).args(["list", "all"])))]
pub struct HarvestArgs {
    /// Process a single list (YYYYMM); any failure exits non-zero
    #[arg(short, long)]
    pub list: Option<ListId>,

    /// Process every list from --start-year to now, continuing past failures
    #[arg(short, long)]
    pub all: bool,

    /// First year for --all
    #[arg(long, default_value_t = FIRST_YEAR)]
    pub start_year: u32,

    /// Use the fetch cache only; missing documents are errors
    #[arg(long)]
    pub no_fetch: bool,

    /// Also fetch and store site and system pages
    #[arg(long)]
    pub details: bool,

    /// Concurrent detail downloads
    #[arg(short, long, default_value_t = 8)]
    pub workers: usize,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 30)]
    pub request_timeout: u64,

    /// Timeout in seconds for downloading the pages of one list
    #[arg(long, default_value_t = 120)]
    pub batch_timeout: u64,

    /// What to do with a site or system that is already stored
    #[arg(long, value_enum, default_value_t = ConflictPolicy::Update)]
    pub on_conflict: ConflictPolicy,

    /// Drop and recreate the tables first
    #[arg(long)]
    pub init_db: bool,
}
