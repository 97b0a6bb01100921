use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use time::OffsetDateTime;

use crate::error::CatalogError;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, CatalogError>> + Send>>;

/// Remote-reported identity of an item's content.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Fingerprint {
    Checksum(String),
    Size(u64),
}

impl Fingerprint {
    pub fn encode(&self) -> String {
        match self {
            Fingerprint::Checksum(sum) => format!("sha:{}", sum.to_ascii_lowercase()),
            Fingerprint::Size(size) => format!("size:{size}"),
        }
    }

    pub fn decode(value: &str) -> Option<Self> {
        if let Some(sum) = value.strip_prefix("sha:") {
            return (!sum.is_empty()).then(|| Fingerprint::Checksum(sum.to_string()));
        }
        value
            .strip_prefix("size:")
            .and_then(|size| size.parse::<u64>().ok())
            .map(Fingerprint::Size)
    }

    pub fn expected_size(&self) -> Option<u64> {
        match self {
            Fingerprint::Size(size) => Some(*size),
            Fingerprint::Checksum(_) => None,
        }
    }
}

/// True only when both sides are known, comparable and different.
pub fn fingerprint_changed(old: Option<&Fingerprint>, new: Option<&Fingerprint>) -> bool {
    match (old, new) {
        (Some(Fingerprint::Checksum(a)), Some(Fingerprint::Checksum(b))) => {
            !a.eq_ignore_ascii_case(b)
        }
        (Some(Fingerprint::Size(a)), Some(Fingerprint::Size(b))) => a != b,
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaEntry {
    pub id: String,
    pub filename: String,
    pub created_at: OffsetDateTime,
    pub fingerprint: Option<Fingerprint>,
    /// Short-lived URL the bytes can be fetched from.
    pub locator: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlbumEntry {
    pub id: String,
    pub title: String,
    pub member_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
    pub is_last: bool,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_cursor: None,
            is_last: true,
        }
    }

    pub fn more(items: Vec<T>, next_cursor: impl Into<String>) -> Self {
        Self {
            items,
            next_cursor: Some(next_cursor.into()),
            is_last: false,
        }
    }
}

/// Paginated view of a remote media library.
#[async_trait]
pub trait RemoteCatalog: Send + Sync {
    async fn list_media_items(
        &self,
        cursor: Option<&str>,
    ) -> Result<Page<MediaEntry>, CatalogError>;

    async fn list_albums(&self, cursor: Option<&str>) -> Result<Page<AlbumEntry>, CatalogError>;

    /// Fresh metadata for one item, including a new download locator.
    async fn get_media_item(&self, id: &str) -> Result<MediaEntry, CatalogError>;

    async fn fetch_bytes(&self, locator: &str) -> Result<ByteStream, CatalogError>;
}
