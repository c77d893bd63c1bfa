//! Drives fetch, extract and persist for a set of list ids.
//!
//! Each list id moves through
//!
//! ```text
//! Pending -> FetchingList -> ParsingList
//!         -> FetchingDetails -> ParsingDetails -> Persisting -> Done
//! ```
//!
//! and any stage failure ends in `Failed(reason)`. The detail stages are passed
//! through without work when details are disabled. Lists are processed one at
//! a time so no two list transactions overlap.

use std::fmt;
use std::path::PathBuf;

use itertools::Itertools;
use tracing::{debug, error, info, instrument};

use crate::config::HarvestConfig;
use crate::error::{HarvestError, Result};
use crate::extract::{item::parse_item, list::parse_list, site::parse_site};
use crate::fetch::{DetailKind, Fetcher, load_document};
use crate::models::{Item, List, ListId, Site};
use crate::store::{Store, WriteCounts};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListState {
    Pending,
    FetchingList,
    ParsingList,
    FetchingDetails,
    ParsingDetails,
    Persisting,
    Done,
    Failed(String),
}

impl fmt::Display for ListState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::FetchingList => f.write_str("fetching list"),
            Self::ParsingList => f.write_str("parsing list"),
            Self::FetchingDetails => f.write_str("fetching details"),
            Self::ParsingDetails => f.write_str("parsing details"),
            Self::Persisting => f.write_str("persisting"),
            Self::Done => f.write_str("done"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Progress of one list id through the pipeline.
#[derive(Debug, Clone)]
pub struct ListProgress {
    pub id: ListId,
    pub state: ListState,
}

impl ListProgress {
    pub fn new(id: ListId) -> Self {
        Self {
            id,
            state: ListState::Pending,
        }
    }

    fn advance(&mut self, next: ListState) {
        debug!(list = %self.id, from = %self.state, to = %next, "List state");
        self.state = next;
    }

    fn fail(&mut self, error: &HarvestError) {
        error!(list = %self.id, stage = %self.state, error = %error, "List failed");
        self.state = ListState::Failed(error.to_string());
    }
}

/// `Batch` continues past a failed list; `Single` returns its error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Batch,
    Single,
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub rankings_written: u64,
    pub sites_written: u64,
    pub items_written: u64,
    pub failures: Vec<(ListId, String)>,
}

impl RunSummary {
    fn record(&mut self, counts: WriteCounts) {
        self.succeeded += 1;
        self.rankings_written += counts.rankings;
        self.sites_written += counts.sites;
        self.items_written += counts.items;
    }
}

pub struct Orchestrator {
    config: HarvestConfig,
    fetcher: Fetcher,
    store: Store,
}

impl Orchestrator {
    pub fn new(config: HarvestConfig, fetcher: Fetcher, store: Store) -> Self {
        Self {
            config,
            fetcher,
            store,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Process `ids` in order.
    ///
    /// In [`RunMode::Single`] the first failure is returned as the error; in
    /// [`RunMode::Batch`] it is recorded in the summary and the run moves on.
    #[instrument(level = "info", skip_all, fields(lists = ids.len(), ?mode))]
    pub async fn run(&self, ids: &[ListId], mode: RunMode) -> Result<RunSummary> {
        self.fetcher.cache().prepare().await?;

        let mut summary = RunSummary::default();
        for &id in ids {
            let mut progress = ListProgress::new(id);
            match self.process(&mut progress).await {
                Ok(counts) => summary.record(counts),
                Err(e) => {
                    summary.failed += 1;
                    summary.failures.push((id, e.to_string()));
                    if mode == RunMode::Single {
                        return Err(e);
                    }
                }
            }
            info!(
                list = %id,
                succeeded = summary.succeeded,
                failed = summary.failed,
                "Progress"
            );
        }

        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            rankings = summary.rankings_written,
            sites = summary.sites_written,
            items = summary.items_written,
            "Run complete"
        );
        Ok(summary)
    }

    /// Run one list through every stage, leaving `progress` in a terminal state.
    pub async fn process(&self, progress: &mut ListProgress) -> Result<WriteCounts> {
        match self.stages(progress).await {
            Ok(counts) => {
                progress.advance(ListState::Done);
                Ok(counts)
            }
            Err(e) => {
                progress.fail(&e);
                Err(e)
            }
        }
    }

    #[instrument(level = "info", skip_all, fields(list = %progress.id))]
    async fn stages(&self, progress: &mut ListProgress) -> Result<WriteCounts> {
        let id = progress.id;

        progress.advance(ListState::FetchingList);
        let paths = self.fetcher.fetch_list(id).await?;

        progress.advance(ListState::ParsingList);
        let mut pages = Vec::with_capacity(paths.len());
        for path in &paths {
            pages.push(load_document(path).await?);
        }
        let list = parse_list(id, &pages)?;

        progress.advance(ListState::FetchingDetails);
        let (site_ids, item_ids) = referenced_ids(&list);
        if self.config.details {
            self.fetcher.fetch_details(DetailKind::Site, &site_ids).await?;
            self.fetcher.fetch_details(DetailKind::Item, &item_ids).await?;
        }

        progress.advance(ListState::ParsingDetails);
        let (sites, items) = if self.config.details {
            (self.parse_sites(&site_ids).await?, self.parse_items(&item_ids).await?)
        } else {
            (Vec::new(), Vec::new())
        };

        progress.advance(ListState::Persisting);
        self.store.write_list(&list, &sites, &items).await
    }

    async fn parse_sites(&self, ids: &[u64]) -> Result<Vec<Site>> {
        let mut sites = Vec::with_capacity(ids.len());
        for &id in ids {
            let html = load_document(&self.detail_path(DetailKind::Site, id)).await?;
            sites.push(parse_site(&html, id)?);
        }
        Ok(sites)
    }

    async fn parse_items(&self, ids: &[u64]) -> Result<Vec<Item>> {
        let mut items = Vec::with_capacity(ids.len());
        for &id in ids {
            let html = load_document(&self.detail_path(DetailKind::Item, id)).await?;
            items.push(parse_item(&html, id)?);
        }
        Ok(items)
    }

    fn detail_path(&self, kind: DetailKind, id: u64) -> PathBuf {
        self.fetcher.cache().detail_path(kind, id)
    }
}

/// Distinct site and item ids in rank order.
fn referenced_ids(list: &List) -> (Vec<u64>, Vec<u64>) {
    let sites = list.entries().iter().map(|e| e.site_id).unique().collect();
    let items = list.entries().iter().map(|e| e.item_id).unique().collect();
    (sites, items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::item::item_page_fixture;
    use crate::extract::list::list_fixture_pages;
    use crate::extract::site::site_page_fixture;
    use crate::fetch::FetchCache;
    use crate::store::ConflictPolicy;
    use tempfile::{TempDir, tempdir};
    use tokio::fs;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn site_of(rank: u32) -> u64 {
        1000 + u64::from(rank % 20)
    }

    fn item_of(rank: u32) -> u64 {
        5000 + u64::from(rank)
    }

    async fn orchestrator(
        dir: &TempDir,
        configure: impl FnOnce(&mut HarvestConfig),
    ) -> Orchestrator {
        let mut config = HarvestConfig::with_datadir(dir.path());
        configure(&mut config);
        let fetcher = Fetcher::new(&config).unwrap();
        fetcher.cache().prepare().await.unwrap();
        let store = Store::open(&config.database, ConflictPolicy::Update).await.unwrap();
        Orchestrator::new(config, fetcher, store)
    }

    async fn seed_list(cache: &FetchCache, id: ListId) {
        for (i, page) in list_fixture_pages(site_of, item_of).iter().enumerate() {
            fs::write(cache.list_page_path(id, i as u8 + 1), page).await.unwrap();
        }
    }

    async fn seed_details(cache: &FetchCache) {
        for rank in 1..=500 {
            fs::write(
                cache.detail_path(DetailKind::Item, item_of(rank)),
                item_page_fixture(item_of(rank), site_of(rank)),
            )
            .await
            .unwrap();
        }
        for site in 1000..1020 {
            fs::write(cache.detail_path(DetailKind::Site, site), site_page_fixture(site))
                .await
                .unwrap();
        }
    }

    async fn scalar(store: &Store, sql: &str) -> i64 {
        sqlx::query_scalar(sql).fetch_one(store.pool()).await.unwrap()
    }

    #[tokio::test]
    async fn test_cached_list_end_to_end() {
        let dir = tempdir().unwrap();
        let orch = orchestrator(&dir, |c| {
            c.network = false;
            c.details = true;
        })
        .await;
        let id: ListId = "202306".parse().unwrap();
        seed_list(orch.fetcher.cache(), id).await;
        seed_details(orch.fetcher.cache()).await;

        let summary = orch.run(&[id], RunMode::Single).await.unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.rankings_written, 500);

        let store = orch.store();
        assert_eq!(store.count("ranking").await.unwrap(), 500);
        assert_eq!(store.count("site").await.unwrap(), 20);
        assert_eq!(store.count("item").await.unwrap(), 500);
        let dangling = "SELECT COUNT(*) FROM ranking WHERE item_id IS NULL OR site_id IS NULL";
        assert_eq!(scalar(store, dangling).await, 0);
        let hpe = "SELECT COUNT(*) FROM item WHERE manufacturer = 'HPE'";
        assert_eq!(scalar(store, hpe).await, 500);

        let site = store.load_site(1003).await.unwrap().unwrap();
        assert_eq!(site.city.as_deref(), Some("Oak Ridge"));

        // Idempotent on a second pass.
        orch.run(&[id], RunMode::Single).await.unwrap();
        assert_eq!(store.count("ranking").await.unwrap(), 500);
        assert_eq!(store.count("item").await.unwrap(), 500);
    }

    #[tokio::test]
    async fn test_without_details_stores_id_rows() {
        let dir = tempdir().unwrap();
        let orch = orchestrator(&dir, |c| c.network = false).await;
        let id: ListId = "201911".parse().unwrap();
        seed_list(orch.fetcher.cache(), id).await;

        let mut progress = ListProgress::new(id);
        let counts = orch.process(&mut progress).await.unwrap();
        assert_eq!(progress.state, ListState::Done);
        assert_eq!(counts.rankings, 500);
        assert_eq!(orch.store().count("site").await.unwrap(), 20);
        let named = "SELECT COUNT(*) FROM item WHERE name IS NOT NULL";
        assert_eq!(scalar(orch.store(), named).await, 0);
    }

    #[tokio::test]
    async fn test_failed_page_persists_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/list/2023/06/"))
            .and(query_param("page", "3"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let pages = list_fixture_pages(site_of, item_of);
        for (i, body) in pages.into_iter().enumerate().filter(|(i, _)| *i != 2) {
            Mock::given(method("GET"))
                .and(path("/list/2023/06/"))
                .and(query_param("page", (i + 1).to_string()))
                .respond_with(ResponseTemplate::new(200).set_body_string(body))
                .mount(&server)
                .await;
        }

        let dir = tempdir().unwrap();
        let uri = server.uri();
        let orch = orchestrator(&dir, |c| c.base_url = uri).await;
        let id: ListId = "202306".parse().unwrap();

        let mut progress = ListProgress::new(id);
        let err = orch.process(&mut progress).await.unwrap_err();
        assert!(matches!(err, HarvestError::Transfer { status: 500, .. }));
        assert!(matches!(&progress.state, ListState::Failed(reason) if reason.contains("500")));
        assert_eq!(orch.store().count("ranking").await.unwrap(), 0);

        let err = orch.run(&[id], RunMode::Single).await.unwrap_err();
        assert!(matches!(err, HarvestError::Transfer { .. }));
    }

    #[tokio::test]
    async fn test_batch_mode_continues_after_failure() {
        let dir = tempdir().unwrap();
        let orch = orchestrator(&dir, |c| c.network = false).await;
        let missing: ListId = "202211".parse().unwrap();
        let cached: ListId = "202306".parse().unwrap();
        seed_list(orch.fetcher.cache(), cached).await;

        let summary = orch.run(&[missing, cached], RunMode::Batch).await.unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failures[0].0, missing);
        assert!(summary.failures[0].1.contains("not cached"));
        assert_eq!(orch.store().count("ranking").await.unwrap(), 500);

        assert!(orch.run(&[missing, cached], RunMode::Single).await.is_err());
    }

    #[tokio::test]
    async fn test_schema_drift_fails_list() {
        let dir = tempdir().unwrap();
        let orch = orchestrator(&dir, |c| {
            c.network = false;
            c.details = true;
        })
        .await;
        let id: ListId = "202306".parse().unwrap();
        seed_list(orch.fetcher.cache(), id).await;
        seed_details(orch.fetcher.cache()).await;
        let drifted = item_page_fixture(item_of(7), site_of(7))
            .replace("<th>Manufacturer:</th>", "<th>Vendor:</th>");
        fs::write(orch.fetcher.cache().detail_path(DetailKind::Item, item_of(7)), drifted)
            .await
            .unwrap();

        let err = orch.run(&[id], RunMode::Single).await.unwrap_err();
        assert!(matches!(err, HarvestError::SchemaDrift { ref label } if label == "vendor"));
        assert_eq!(orch.store().count("ranking").await.unwrap(), 0);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ListState::FetchingDetails.to_string(), "fetching details");
        assert_eq!(ListState::Failed("timeout".into()).to_string(), "failed: timeout");
    }
}
