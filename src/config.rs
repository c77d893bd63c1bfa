//! Runtime configuration handed to the fetcher, store and orchestrator.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cli::{Cli, Command};
use crate::models::FIRST_YEAR;
use crate::store::ConflictPolicy;

pub const DEFAULT_BASE_URL: &str = "https://www.top500.org";
pub const DEFAULT_DATADIR: &str = "/tmp/top500";
pub const DATABASE_FILE: &str = "top500.sqlite3";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestConfig {
    /// Root of the fetch cache.
    pub datadir: PathBuf,
    pub database: PathBuf,
    pub base_url: String,
    /// `false` restricts every fetch to the cache.
    pub network: bool,
    /// Fetch and parse site and system pages for every list.
    pub details: bool,
    /// Concurrent detail downloads.
    pub workers: usize,
    pub request_timeout: Duration,
    /// Budget for the concurrent download of one list's pages.
    pub batch_timeout: Duration,
    pub conflict_policy: ConflictPolicy,
    pub start_year: u32,
    pub init_db: bool,
    pub user_agent: String,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        let datadir = PathBuf::from(DEFAULT_DATADIR);
        Self {
            database: datadir.join(DATABASE_FILE),
            datadir,
            base_url: DEFAULT_BASE_URL.to_string(),
            network: true,
            details: false,
            workers: 8,
            request_timeout: Duration::from_secs(30),
            batch_timeout: Duration::from_secs(120),
            conflict_policy: ConflictPolicy::default(),
            start_year: FIRST_YEAR,
            init_db: false,
            user_agent: concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl HarvestConfig {
    /// Config rooted at `datadir`, with the database inside it.
    pub fn with_datadir(datadir: impl Into<PathBuf>) -> Self {
        let datadir = datadir.into();
        Self {
            database: datadir.join(DATABASE_FILE),
            datadir,
            ..Self::default()
        }
    }
}

impl From<&Cli> for HarvestConfig {
    fn from(cli: &Cli) -> Self {
        let mut config = HarvestConfig::with_datadir(&cli.datadir);
        if let Some(database) = &cli.database {
            config.database = database.clone();
        }
        config.base_url = cli.base_url.clone();

        if let Command::Harvest(args) = &cli.command {
            config.network = !args.no_fetch;
            config.details = args.details;
            config.workers = args.workers.max(1);
            config.request_timeout = Duration::from_secs(args.request_timeout);
            config.batch_timeout = Duration::from_secs(args.batch_timeout);
            config.conflict_policy = args.on_conflict;
            config.start_year = args.start_year;
            config.init_db = args.init_db;
        } else {
            config.network = false;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_defaults() {
        let config = HarvestConfig::default();
        assert_eq!(config.database, PathBuf::from("/tmp/top500/top500.sqlite3"));
        assert!(config.network);
        assert!(!config.details);
        assert_eq!(config.conflict_policy, ConflictPolicy::Update);
        assert_eq!(config.start_year, 1993);
    }

    #[test]
    fn test_from_cli_harvest() {
        let cli = Cli::parse_from([
            "top500_harvest",
            "--datadir",
            "/srv/top500",
            "harvest",
            "--list",
            "202306",
            "--no-fetch",
            "--details",
            "--workers",
            "0",
            "--on-conflict",
            "ignore",
        ]);
        let config = HarvestConfig::from(&cli);
        assert_eq!(config.datadir, PathBuf::from("/srv/top500"));
        assert_eq!(config.database, PathBuf::from("/srv/top500/top500.sqlite3"));
        assert!(!config.network);
        assert!(config.details);
        assert_eq!(config.workers, 1);
        assert_eq!(config.conflict_policy, ConflictPolicy::Ignore);
    }

    #[test]
    fn test_inspection_commands_stay_offline() {
        let cli = Cli::parse_from(["top500_harvest", "--database", "/tmp/x.db", "survey"]);
        let config = HarvestConfig::from(&cli);
        assert!(!config.network);
        assert_eq!(config.database, PathBuf::from("/tmp/x.db"));
    }

    #[test]
    fn test_config_serializes() {
        let json = serde_json::to_string(&HarvestConfig::default()).unwrap();
        assert!(json.contains("\"conflict_policy\":\"update\""));
    }
}
