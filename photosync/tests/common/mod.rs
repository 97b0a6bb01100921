#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream;
use photosync::config::IdentityConfig;
use photosync::sync::{IndexStore, SyncEngine};
use photosync_remote::{
    AlbumEntry, ByteStream, CatalogError, Fingerprint, MediaEntry, Page, RemoteCatalog,
};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

#[derive(Default)]
struct State {
    items: BTreeMap<String, MediaEntry>,
    albums: BTreeMap<String, AlbumEntry>,
    blobs: HashMap<String, Vec<u8>>,
    versions: HashMap<String, u32>,
    interrupt_media_at: Option<usize>,
    failing_fetches: HashMap<String, usize>,
    fetches: usize,
}

/// In-memory remote library with paged listings and failure injection.
pub struct FakeCatalog {
    page_size: usize,
    state: Mutex<State>,
}

impl FakeCatalog {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            state: Mutex::new(State::default()),
        }
    }

    /// Adds or replaces an item; new content gets a new locator and checksum.
    pub fn put_item(&self, id: &str, filename: &str, created_at: OffsetDateTime, body: &[u8]) {
        let mut state = self.state.lock().unwrap();
        let version = state.versions.entry(id.to_string()).or_default();
        *version += 1;
        let locator = format!("mem://{id}/{version}");
        state.blobs.insert(locator.clone(), body.to_vec());
        state.items.insert(
            id.to_string(),
            MediaEntry {
                id: id.to_string(),
                filename: filename.to_string(),
                created_at,
                fingerprint: Some(Fingerprint::Checksum(format!("{:x}", Sha256::digest(body)))),
                locator: Some(locator),
            },
        );
    }

    pub fn remove_item(&self, id: &str) {
        self.state.lock().unwrap().items.remove(id);
    }

    pub fn put_album(&self, id: &str, title: &str, members: &[&str]) {
        self.state.lock().unwrap().albums.insert(
            id.to_string(),
            AlbumEntry {
                id: id.to_string(),
                title: title.to_string(),
                member_ids: members.iter().map(|m| m.to_string()).collect(),
            },
        );
    }

    pub fn remove_album(&self, id: &str) {
        self.state.lock().unwrap().albums.remove(id);
    }

    /// The next media listing request starting at `offset` fails once.
    pub fn interrupt_media_listing_at(&self, offset: usize) {
        self.state.lock().unwrap().interrupt_media_at = Some(offset);
    }

    /// The next `times` byte fetches for `id` fail permanently.
    pub fn fail_fetches(&self, id: &str, times: usize) {
        self.state
            .lock()
            .unwrap()
            .failing_fetches
            .insert(id.to_string(), times);
    }

    pub fn fetches(&self) -> usize {
        self.state.lock().unwrap().fetches
    }

    fn page<T: Clone>(&self, all: Vec<T>, cursor: Option<&str>) -> Page<T> {
        let start = cursor.and_then(|c| c.parse::<usize>().ok()).unwrap_or(0);
        let end = (start + self.page_size).min(all.len());
        let items = all.get(start..end).map(<[T]>::to_vec).unwrap_or_default();
        if end >= all.len() {
            Page::last(items)
        } else {
            Page::more(items, end.to_string())
        }
    }
}

#[async_trait]
impl RemoteCatalog for FakeCatalog {
    async fn list_media_items(&self, cursor: Option<&str>) -> Result<Page<MediaEntry>, CatalogError> {
        let all = {
            let mut state = self.state.lock().unwrap();
            let offset = cursor.and_then(|c| c.parse::<usize>().ok()).unwrap_or(0);
            if state.interrupt_media_at == Some(offset) {
                state.interrupt_media_at = None;
                return Err(CatalogError::Rejected("listing interrupted".into()));
            }
            state.items.values().cloned().collect::<Vec<_>>()
        };
        Ok(self.page(all, cursor))
    }

    async fn list_albums(&self, cursor: Option<&str>) -> Result<Page<AlbumEntry>, CatalogError> {
        let all = self.state.lock().unwrap().albums.values().cloned().collect();
        Ok(self.page(all, cursor))
    }

    async fn get_media_item(&self, id: &str) -> Result<MediaEntry, CatalogError> {
        self.state
            .lock()
            .unwrap()
            .items
            .get(id)
            .cloned()
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))
    }

    async fn fetch_bytes(&self, locator: &str) -> Result<ByteStream, CatalogError> {
        let mut state = self.state.lock().unwrap();
        state.fetches += 1;
        let id = locator
            .trim_start_matches("mem://")
            .split('/')
            .next()
            .unwrap_or_default()
            .to_string();
        if let Some(remaining) = state.failing_fetches.get_mut(&id)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(CatalogError::Rejected(format!("fetch of {id} refused")));
        }
        let body = state
            .blobs
            .get(locator)
            .cloned()
            .ok_or_else(|| CatalogError::NotFound(locator.to_string()))?;
        // Two chunks, so installs see a real stream.
        let split = body.len() / 2;
        let chunks = vec![
            Ok::<_, CatalogError>(Bytes::copy_from_slice(&body[..split])),
            Ok(Bytes::copy_from_slice(&body[split..])),
        ];
        Ok(Box::pin(stream::iter(chunks)))
    }
}

pub fn identity(dir: &Path) -> IdentityConfig {
    let mut config = IdentityConfig::new("test", dir);
    config.retry_base = Duration::ZERO;
    config.retry_max = Duration::ZERO;
    config
}

pub async fn engine(dir: &Path, catalog: Arc<FakeCatalog>) -> SyncEngine {
    let store = IndexStore::open(dir).await.unwrap();
    SyncEngine::new(identity(dir), store).with_catalog(catalog)
}

/// Files and links under the managed trees, keyed by relative path. Files map
/// to their content, symlinks to `-> target`.
pub fn snapshot(dir: &Path) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for root in ["items", "albums"] {
        walk(dir, &dir.join(root), &mut out);
    }
    out
}

fn walk(base: &Path, dir: &Path, out: &mut BTreeMap<String, String>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries {
        let entry = entry.unwrap();
        let path = entry.path();
        let rel = path.strip_prefix(base).unwrap().to_string_lossy().into_owned();
        let file_type = entry.file_type().unwrap();
        if file_type.is_dir() {
            walk(base, &path, out);
        } else if file_type.is_symlink() {
            out.insert(rel, format!("-> {}", fs::read_link(&path).unwrap().display()));
        } else {
            out.insert(rel, String::from_utf8_lossy(&fs::read(&path).unwrap()).into_owned());
        }
    }
}
