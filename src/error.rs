//! Error kinds raised while fetching, extracting and storing lists.
//!
//! Two kinds are absorbed where they happen and only logged:
//! [`HarvestError::NumericConversion`] (the attribute is skipped) and
//! [`HarvestError::CacheConflict`] (another writer created the cache file
//! first, which counts as a hit). Everything else fails the enclosing page,
//! detail record or list.

use std::path::PathBuf;

use thiserror::Error;

use crate::models::ListId;

#[derive(Error, Debug)]
pub enum HarvestError {
    /// An expected HTML container is missing: the page format changed or the
    /// document is truncated.
    #[error("structural parse error: {0}")]
    StructuralParse(String),

    /// The item page carries an attribute label the dispatch table does not know.
    #[error("unknown attribute label {label:?} (source page format changed?)")]
    SchemaDrift { label: String },

    #[error("cannot convert {value:?} to a number for attribute {field}")]
    NumericConversion { field: &'static str, value: String },

    #[error("HTTP status {status} for {url}")]
    Transfer { url: String, status: u16 },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("fetch batch for list {list} exceeded {secs}s")]
    Timeout { list: ListId, secs: u64 },

    #[error("cache file {0} was created concurrently")]
    CacheConflict(PathBuf),

    #[error("{0} is not cached and fetching is disabled")]
    CacheMiss(PathBuf),

    #[error("persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("invalid list id {0:?}")]
    InvalidListId(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

impl HarvestError {
    pub fn structural(msg: impl Into<String>) -> Self {
        Self::StructuralParse(msg.into())
    }

    /// True for the kinds that are logged and absorbed instead of propagated.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::NumericConversion { .. } | Self::CacheConflict(_))
    }
}

pub type Result<T> = std::result::Result<T, HarvestError>;
