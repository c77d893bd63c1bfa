//! On-disk fetch cache.
//!
//! ```text
//! {datadir}/list/{YYYYMM}.{page}.html
//! {datadir}/site/{site_id}.html
//! {datadir}/item/{item_id}.html
//! ```
//!
//! A non-empty file is the only signal that a document was fetched; a missing
//! or zero-byte file means it was not. Downloads go to a `.part` sibling and
//! are renamed into place once complete, so a crash never leaves a partial
//! document under the final name.
//!
//! A detail download is claimed by creating `{name}.lock` next to the
//! document. Whoever creates the lock downloads; everyone else treats the
//! document as a hit. A lock older than the stale window is left over from a
//! dead run and is reclaimed.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::fs;
use tracing::{debug, info, instrument, warn};

use crate::models::ListId;

/// Detail document kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DetailKind {
    Site,
    Item,
}

impl DetailKind {
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Site => "site",
            Self::Item => "item",
        }
    }

    /// Path segment of the source URL for this kind.
    pub fn url_segment(self) -> &'static str {
        match self {
            Self::Site => "site",
            Self::Item => "system",
        }
    }
}

/// Outcome of [`FetchCache::create_if_absent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSlot {
    /// This caller created the file and owns filling it.
    Created,
    /// The file already existed.
    AlreadyExisted,
}

#[derive(Debug, Clone)]
pub struct FetchCache {
    root: PathBuf,
}

impl FetchCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the kind directories below the root.
    #[instrument(level = "info", skip_all, fields(root = %self.root.display()))]
    pub async fn prepare(&self) -> std::io::Result<()> {
        for dir in ["list", DetailKind::Site.dir_name(), DetailKind::Item.dir_name()] {
            fs::create_dir_all(self.root.join(dir)).await?;
        }
        info!("Fetch cache ready");
        Ok(())
    }

    pub fn list_page_path(&self, id: ListId, page: u8) -> PathBuf {
        self.root.join("list").join(format!("{id}.{page}.html"))
    }

    pub fn detail_path(&self, kind: DetailKind, id: u64) -> PathBuf {
        self.root.join(kind.dir_name()).join(format!("{id}.html"))
    }

    pub fn detail_dir(&self, kind: DetailKind) -> PathBuf {
        self.root.join(kind.dir_name())
    }

    /// True when `path` holds a non-empty document.
    pub async fn is_fetched(path: &Path) -> bool {
        matches!(fs::metadata(path).await, Ok(meta) if meta.is_file() && meta.len() > 0)
    }

    /// Atomically create `path` unless it exists.
    pub async fn create_if_absent(path: &Path) -> std::io::Result<CacheSlot> {
        match fs::OpenOptions::new().write(true).create_new(true).open(path).await {
            Ok(_) => Ok(CacheSlot::Created),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(CacheSlot::AlreadyExisted),
            Err(e) => Err(e),
        }
    }

    /// Remove `path`, treating "already gone" as success.
    pub async fn discard(path: &Path) -> std::io::Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => {
                debug!(path = %path.display(), "Discarded cache file");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Sibling path a download is streamed into before the final rename.
    ///
    /// Unique per call: tagged with the process id and a per-process counter.
    pub fn part_path(path: &Path) -> PathBuf {
        static SEQ: AtomicU64 = AtomicU64::new(0);
        let seq = SEQ.fetch_add(1, Ordering::Relaxed);
        with_suffix(path, &format!(".{}-{seq}.part", std::process::id()))
    }

    pub fn lock_path(path: &Path) -> PathBuf {
        with_suffix(path, ".lock")
    }

    /// Claim the download of `path`.
    ///
    /// `Some` holds the lock until dropped. `None` means a live owner holds it.
    pub async fn claim(path: &Path, stale_after: Duration) -> std::io::Result<Option<Scratch>> {
        let lock = Self::lock_path(path);
        if Self::create_if_absent(&lock).await? == CacheSlot::Created {
            return Ok(Some(Scratch::new(lock)));
        }
        if !is_stale(&lock, stale_after).await {
            return Ok(None);
        }

        debug!(lock = %lock.display(), "Reclaiming stale lock");
        Self::discard(&lock).await?;
        Ok(match Self::create_if_absent(&lock).await? {
            CacheSlot::Created => Some(Scratch::new(lock)),
            CacheSlot::AlreadyExisted => None,
        })
    }

    /// Numeric ids of the cached documents of `kind`, ascending.
    pub async fn cached_ids(&self, kind: DetailKind) -> std::io::Result<Vec<u64>> {
        let mut ids = Vec::new();
        let mut dir = match fs::read_dir(self.detail_dir(kind)).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e),
        };
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("html") {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            else {
                continue;
            };
            if Self::is_fetched(&path).await {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

async fn is_stale(path: &Path, stale_after: Duration) -> bool {
    match fs::metadata(path).await.and_then(|meta| meta.modified()) {
        Ok(modified) => modified.elapsed().is_ok_and(|age| age > stale_after),
        Err(_) => false,
    }
}

/// A file removed when dropped, unless [`Scratch::keep`] was called.
///
/// Covers every exit of a download, including a future dropped mid-flight.
#[derive(Debug)]
pub struct Scratch {
    path: PathBuf,
    armed: bool,
}

impl Scratch {
    pub fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The file has been moved away or should stay.
    pub fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed scratch file"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Cannot remove scratch file"),
        }
    }
}
