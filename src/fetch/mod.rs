//! HTTP retrieval into the fetch cache.
//!
//! | Document | Source URL | Cache file |
//! |----------|------------|------------|
//! | List page | `{base}/list/{year}/{slot}/?page={n}` | `list/{YYYYMM}.{n}.html` |
//! | Site page | `{base}/site/{id}` | `site/{id}.html` |
//! | System page | `{base}/system/{id}` | `item/{id}.html` |
//!
//! The cache is consulted first for every document. With networking disabled a
//! missing document is a [`HarvestError::CacheMiss`].

pub mod cache;

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::future::join_all;
use futures::stream::{self, StreamExt, TryStreamExt};
use reqwest::{Client, Response};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use crate::config::HarvestConfig;
use crate::error::{HarvestError, Result};
use crate::models::{ListId, PAGES_PER_LIST};

use cache::Scratch;
pub use cache::{DetailKind, FetchCache};

/// Tally of one detail batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchReport {
    pub fetched: usize,
    pub cached: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DetailOutcome {
    Cached,
    Fetched(u64),
}

#[derive(Debug, Clone)]
pub struct Fetcher {
    client: Client,
    cache: FetchCache,
    base_url: String,
    network: bool,
    workers: usize,
    batch_timeout: Duration,
    /// Age after which another run's download lock is considered dead.
    stale_claim: Duration,
}

impl Fetcher {
    pub fn new(config: &HarvestConfig) -> Result<Self> {
        // Reject a malformed base before any request is built from it.
        Url::parse(&config.base_url)?;
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            client,
            cache: FetchCache::new(&config.datadir),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            network: config.network,
            workers: config.workers.max(1),
            batch_timeout: config.batch_timeout,
            stale_claim: config.request_timeout * 2,
        })
    }

    pub fn cache(&self) -> &FetchCache {
        &self.cache
    }

    pub fn list_page_url(&self, id: ListId, page: u8) -> String {
        format!(
            "{}/list/{}/{:02}/?page={}",
            self.base_url,
            id.year(),
            id.slot(),
            page
        )
    }

    pub fn detail_url(&self, kind: DetailKind, id: u64) -> String {
        format!("{}/{}/{}", self.base_url, kind.url_segment(), id)
    }

    /// Make all pages of list `id` available in the cache and return their
    /// paths in page order.
    ///
    /// Missing pages are downloaded concurrently under the batch timeout.
    /// Pages that completed stay cached even when a sibling fails.
    #[instrument(level = "info", skip(self), fields(list = %id))]
    pub async fn fetch_list(&self, id: ListId) -> Result<Vec<PathBuf>> {
        let pages: Vec<(u8, PathBuf)> = (1..=PAGES_PER_LIST)
            .map(|page| (page, self.cache.list_page_path(id, page)))
            .collect();

        let mut missing = Vec::new();
        for (page, path) in &pages {
            if FetchCache::is_fetched(path).await {
                debug!(page = *page, "List page cached");
            } else if !self.network {
                return Err(HarvestError::CacheMiss(path.clone()));
            } else {
                missing.push((*page, path.clone()));
            }
        }

        if !missing.is_empty() {
            info!(pages = missing.len(), "Fetching list pages");
            let downloads = missing.iter().map(|(page, path)| {
                let url = self.list_page_url(id, *page);
                async move {
                    let result = self.download(&url, path).await;
                    if let Err(e) = &result {
                        error!(page = *page, %url, error = %e, "List page fetch failed");
                    }
                    result
                }
            });

            // Downloads dropped by the timeout remove their own `.part` files.
            let results = timeout(self.batch_timeout, join_all(downloads))
                .await
                .map_err(|_| HarvestError::Timeout {
                    list: id,
                    secs: self.batch_timeout.as_secs(),
                })?;
            if let Some(e) = results.into_iter().find_map(|r| r.err()) {
                return Err(e);
            }
        }

        Ok(pages.into_iter().map(|(_, path)| path).collect())
    }

    /// Make the detail documents for `ids` available in the cache, at most
    /// `workers` downloads at a time.
    ///
    /// Stops at the first failure. Downloads still in flight are dropped and
    /// release their locks.
    #[instrument(
        level = "info",
        skip(self, ids),
        fields(kind = kind.dir_name(), count = ids.len())
    )]
    pub async fn fetch_details(&self, kind: DetailKind, ids: &[u64]) -> Result<FetchReport> {
        let report = stream::iter(ids.iter().copied())
            .map(|id| async move {
                self.fetch_detail(kind, id)
                    .await
                    .inspect_err(|e| error!(id, error = %e, "Detail fetch failed"))
            })
            .buffer_unordered(self.workers)
            .try_fold(FetchReport::default(), |mut report, outcome| async move {
                match outcome {
                    DetailOutcome::Cached => report.cached += 1,
                    DetailOutcome::Fetched(bytes) => {
                        report.fetched += 1;
                        report.bytes += bytes;
                    }
                }
                Ok::<_, HarvestError>(report)
            })
            .await?;

        info!(
            fetched = report.fetched,
            cached = report.cached,
            bytes = report.bytes,
            "Details ready"
        );
        Ok(report)
    }

    async fn fetch_detail(&self, kind: DetailKind, id: u64) -> Result<DetailOutcome> {
        let path = self.cache.detail_path(kind, id);
        if FetchCache::is_fetched(&path).await {
            return Ok(DetailOutcome::Cached);
        }
        if !self.network {
            return Err(HarvestError::CacheMiss(path));
        }

        let Some(lock) = FetchCache::claim(&path, self.stale_claim).await? else {
            let conflict = HarvestError::CacheConflict(path);
            warn!(error = %conflict, "Treating as cache hit");
            return Ok(DetailOutcome::Cached);
        };
        // The previous owner may have finished between the check and the claim.
        if FetchCache::is_fetched(&path).await {
            return Ok(DetailOutcome::Cached);
        }

        let url = self.detail_url(kind, id);
        let bytes = self.download(&url, &path).await?;
        drop(lock);
        Ok(DetailOutcome::Fetched(bytes))
    }

    /// Stream `url` into a `.part` sibling of `dest`, then rename it into place.
    ///
    /// `dest` is only ever replaced by a complete document.
    #[instrument(level = "debug", skip(self, dest), fields(dest = %dest.display()))]
    async fn download(&self, url: &str, dest: &Path) -> Result<u64> {
        let mut response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(HarvestError::Transfer {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let part = Scratch::new(FetchCache::part_path(dest));
        let bytes = write_body(&mut response, part.path()).await?;
        fs::rename(part.path(), dest).await?;
        part.keep();
        debug!(bytes, "Downloaded");
        Ok(bytes)
    }
}

async fn write_body(response: &mut Response, part: &Path) -> Result<u64> {
    let mut file = fs::File::create(part).await?;
    let mut bytes = 0u64;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
        bytes += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(bytes)
}

/// Read a cached document, replacing invalid UTF-8.
pub async fn load_document(path: &Path) -> Result<String> {
    let bytes = fs::read(path).await?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{TempDir, tempdir};
    use wiremock::matchers::{method, path, path_regex, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn fetcher(dir: &TempDir, server: &MockServer) -> Fetcher {
        let mut config = HarvestConfig::with_datadir(dir.path());
        config.base_url = server.uri();
        config.batch_timeout = Duration::from_secs(10);
        let fetcher = Fetcher::new(&config).unwrap();
        fetcher.cache().prepare().await.unwrap();
        fetcher
    }

    fn list_id() -> ListId {
        "202306".parse().unwrap()
    }

    async fn file_names(dir: &Path) -> Vec<String> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(dir).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        names
    }

    #[test]
    fn test_urls() {
        let mut config = HarvestConfig::default();
        config.base_url = "https://example.org/".to_string();
        let fetcher = Fetcher::new(&config).unwrap();
        assert_eq!(
            fetcher.list_page_url(list_id(), 2),
            "https://example.org/list/2023/06/?page=2"
        );
        assert_eq!(
            fetcher.detail_url(DetailKind::Item, 179807),
            "https://example.org/system/179807"
        );
        assert_eq!(fetcher.detail_url(DetailKind::Site, 48553), "https://example.org/site/48553");
    }

    #[test]
    fn test_rejects_malformed_base_url() {
        let mut config = HarvestConfig::default();
        config.base_url = "not a url".to_string();
        assert!(matches!(Fetcher::new(&config), Err(HarvestError::Url(_))));
    }

    #[tokio::test]
    async fn test_fetch_list_downloads_all_pages() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/list/2023/06/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>page</html>"))
            .expect(5)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let fetcher = fetcher(&dir, &server).await;
        let paths = fetcher.fetch_list(list_id()).await.unwrap();

        assert_eq!(paths.len(), 5);
        for (i, p) in paths.iter().enumerate() {
            assert!(p.ends_with(format!("list/202306.{}.html", i + 1)));
            assert_eq!(load_document(p).await.unwrap(), "<html>page</html>");
        }
    }

    #[tokio::test]
    async fn test_fetch_list_skips_cached_pages() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/list/2023/06/"))
            .and(query_param("page", "5"))
            .respond_with(ResponseTemplate::new(200).set_body_string("fresh"))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let fetcher = fetcher(&dir, &server).await;
        for page in 1..=4 {
            fs::write(fetcher.cache().list_page_path(list_id(), page), "cached").await.unwrap();
        }
        // Zero-byte means "not fetched".
        fs::write(fetcher.cache().list_page_path(list_id(), 5), "").await.unwrap();

        let paths = fetcher.fetch_list(list_id()).await.unwrap();
        assert_eq!(load_document(&paths[0]).await.unwrap(), "cached");
        assert_eq!(load_document(&paths[4]).await.unwrap(), "fresh");
    }

    #[tokio::test]
    async fn test_fetch_list_failed_page_keeps_siblings() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/list/2023/06/"))
            .and(query_param("page", "3"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/list/2023/06/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let fetcher = fetcher(&dir, &server).await;
        let err = fetcher.fetch_list(list_id()).await.unwrap_err();

        assert!(matches!(err, HarvestError::Transfer { status: 500, .. }));
        for page in [1, 2, 4, 5] {
            let page = fetcher.cache().list_page_path(list_id(), page);
            assert!(FetchCache::is_fetched(&page).await);
        }
        // Only the four completed pages, no `.part` leftovers.
        assert_eq!(file_names(&dir.path().join("list")).await.len(), 4);
    }

    #[tokio::test]
    async fn test_fetch_list_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("slow")
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let mut config = HarvestConfig::with_datadir(dir.path());
        config.base_url = server.uri();
        config.batch_timeout = Duration::from_millis(200);
        let fetcher = Fetcher::new(&config).unwrap();
        fetcher.cache().prepare().await.unwrap();

        let err = fetcher.fetch_list(list_id()).await.unwrap_err();
        assert!(matches!(err, HarvestError::Timeout { .. }));

        assert!(file_names(&dir.path().join("list")).await.is_empty());
    }

    #[tokio::test]
    async fn test_no_fetch_mode_reports_cache_miss() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let mut config = HarvestConfig::with_datadir(dir.path());
        config.base_url = server.uri();
        config.network = false;
        let fetcher = Fetcher::new(&config).unwrap();
        fetcher.cache().prepare().await.unwrap();

        let err = fetcher.fetch_list(list_id()).await.unwrap_err();
        assert!(matches!(err, HarvestError::CacheMiss(p) if p.ends_with("list/202306.1.html")));

        let err = fetcher.fetch_details(DetailKind::Site, &[9]).await.unwrap_err();
        assert!(matches!(err, HarvestError::CacheMiss(_)));
    }

    #[tokio::test]
    async fn test_fetch_details_resumes_from_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/system/[123]$"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/system/4"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>4</html>"))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let fetcher = fetcher(&dir, &server).await;
        for id in 1..=3 {
            let path = fetcher.cache().detail_path(DetailKind::Item, id);
            fs::write(path, "cached").await.unwrap();
        }

        let report = fetcher.fetch_details(DetailKind::Item, &[1, 2, 3, 4]).await.unwrap();
        assert_eq!(report.cached, 3);
        assert_eq!(report.fetched, 1);
        assert_eq!(report.bytes, "<html>4</html>".len() as u64);

        // Second pass is fully cached.
        let report = fetcher.fetch_details(DetailKind::Item, &[1, 2, 3, 4]).await.unwrap();
        assert_eq!(report, FetchReport { fetched: 0, cached: 4, bytes: 0 });
    }

    #[tokio::test]
    async fn test_failed_detail_leaves_no_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/site/7"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let fetcher = fetcher(&dir, &server).await;
        let err = fetcher.fetch_details(DetailKind::Site, &[7]).await.unwrap_err();

        assert!(matches!(err, HarvestError::Transfer { status: 404, .. }));
        // The failed claim leaves the directory empty.
        assert!(file_names(&dir.path().join("site")).await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_runs_transfer_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/site/1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("site 1")
                    .set_delay(Duration::from_millis(500)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let first = fetcher(&dir, &server).await;
        let second = fetcher(&dir, &server).await;

        let (a, b) = tokio::join!(
            first.fetch_details(DetailKind::Site, &[1]),
            second.fetch_details(DetailKind::Site, &[1]),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.fetched + b.fetched, 1);
        assert_eq!(a.cached + b.cached, 1);
        let doc = first.cache().detail_path(DetailKind::Site, 1);
        assert_eq!(load_document(&doc).await.unwrap(), "site 1");
        assert_eq!(file_names(&dir.path().join("site")).await, vec!["1.html".to_string()]);
    }

    #[tokio::test]
    async fn test_detail_batch_stops_at_first_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let mut config = HarvestConfig::with_datadir(dir.path());
        config.base_url = server.uri();
        config.workers = 1;
        let fetcher = Fetcher::new(&config).unwrap();
        fetcher.cache().prepare().await.unwrap();

        let ids: Vec<u64> = (1..=50).collect();
        let err = fetcher.fetch_details(DetailKind::Site, &ids).await.unwrap_err();

        assert!(matches!(err, HarvestError::Transfer { status: 503, .. }));
        let requests = server.received_requests().await.unwrap();
        assert!(requests.len() < ids.len(), "sent {} requests", requests.len());
        assert!(file_names(&dir.path().join("site")).await.is_empty());
    }

    #[tokio::test]
    async fn test_zero_byte_detail_is_refetched() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/site/5"))
            .respond_with(ResponseTemplate::new(200).set_body_string("site 5"))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let fetcher = fetcher(&dir, &server).await;
        let target = fetcher.cache().detail_path(DetailKind::Site, 5);
        fs::write(&target, "").await.unwrap();

        let report = fetcher.fetch_details(DetailKind::Site, &[5]).await.unwrap();
        assert_eq!(report.fetched, 1);
        assert_eq!(load_document(&target).await.unwrap(), "site 5");
    }

    #[tokio::test]
    async fn test_load_document_is_lossy() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("bad.html");
        fs::write(&file, [b'a', 0xff, b'b']).await.unwrap();
        assert_eq!(load_document(&file).await.unwrap(), "a\u{fffd}b");
    }
}
