use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::albums::remove_tree;
use super::engine::SyncError;
use super::paths::{ALBUMS_DIR, ITEMS_DIR, album_dir, partial_path, resolve};
use super::stats::RunSummary;
use super::store::{IndexStore, ListingKind, MediaRecord};

/// Why a record is up for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reason {
    /// Missing from the last completed media pass.
    Stale,
    Ignored,
}

/// An entry somewhere under `albums/` and what it points at.
struct AlbumLink {
    path: PathBuf,
    target: Option<PathBuf>,
    inode: Option<(u64, u64)>,
}

/// Removes local files whose record is gone from the remote or ignored, and
/// anything under the managed trees that no record claims.
///
/// This is the only phase that deletes canonical files.
pub struct ObsoleteReconciler<'a> {
    identity: &'a str,
    store: &'a IndexStore,
    data_dir: &'a Path,
}

impl<'a> ObsoleteReconciler<'a> {
    pub fn new(identity: &'a str, store: &'a IndexStore, data_dir: &'a Path) -> Self {
        Self {
            identity,
            store,
            data_dir,
        }
    }

    pub async fn run(&self, force: bool, summary: &mut RunSummary) -> Result<(), SyncError> {
        let media_cursor = self.store.get_cursor(ListingKind::MediaItems).await?;
        let album_cursor = self.store.get_cursor(ListingKind::Albums).await?;
        if !force && !(media_cursor.complete && album_cursor.complete) {
            warn!(
                identity = %self.identity,
                media_complete = media_cursor.complete,
                albums_complete = album_cursor.complete,
                "latest index pass is incomplete, skipping deletions"
            );
            summary.warn("obsolete reconciliation skipped: latest index pass is incomplete");
            return Ok(());
        }
        if force {
            info!(identity = %self.identity, "reconciling with caller override");
        }

        // Staleness is only ever measured against a pass that reached the end.
        if album_cursor.completed_epoch > 0 {
            self.remove_stale_albums(album_cursor.completed_epoch, summary).await?;
        }

        let mut candidates: BTreeMap<String, (MediaRecord, Reason)> = BTreeMap::new();
        if media_cursor.completed_epoch > 0 {
            for record in self.store.list_stale_media(media_cursor.completed_epoch).await? {
                candidates.insert(record.remote_id.clone(), (record, Reason::Stale));
            }
        }
        for record in self.store.list_ignored_media().await? {
            candidates
                .entry(record.remote_id.clone())
                .or_insert((record, Reason::Ignored));
        }

        if !candidates.is_empty() {
            let links = self.scan_album_links()?;
            for (remote_id, (record, reason)) in candidates {
                if let Err(err) = self.remove_item(&record, reason, &links, summary).await {
                    warn!(identity = %self.identity, remote_id = %remote_id, error = %err, "failed to remove obsolete item");
                    match err {
                        SyncError::Store(_) => summary.warn(format!("{remote_id}: {err}")),
                        _ => summary.fail(&remote_id, err.to_string()),
                    }
                }
            }
        }

        self.sweep_items(summary).await?;
        self.sweep_albums(summary).await?;
        for root in [ITEMS_DIR, ALBUMS_DIR] {
            let root = self.data_dir.join(root);
            if root.is_dir() {
                prune_empty(&root)?;
            }
        }
        Ok(())
    }

    async fn remove_stale_albums(&self, epoch: i64, summary: &mut RunSummary) -> Result<(), SyncError> {
        for album in self.store.list_albums().await? {
            if album.last_seen_epoch >= epoch {
                continue;
            }
            let dir_rel = album
                .materialized_dir
                .clone()
                .unwrap_or_else(|| album_dir(&album.dir_name));
            let dir = resolve(self.data_dir, &dir_rel)?;
            if remove_tree(&dir)? {
                summary.album_dirs_removed += 1;
            }
            self.store.delete_album(album.id).await?;
            summary.deleted_albums += 1;
            info!(identity = %self.identity, album = %album.title, "removed album no longer reported by the remote");
        }
        Ok(())
    }

    async fn remove_item(
        &self,
        record: &MediaRecord,
        reason: Reason,
        links: &[AlbumLink],
        summary: &mut RunSummary,
    ) -> Result<(), SyncError> {
        if let Some(rel) = record.canonical_path.as_deref() {
            let canonical = resolve(self.data_dir, rel)?;
            if let Ok(meta) = fs::metadata(&canonical) {
                let target = fs::canonicalize(&canonical).ok();
                let inode = (meta.dev(), meta.ino());
                for link in links {
                    let points_here = (link.target.is_some() && link.target == target)
                        || link.inode == Some(inode);
                    if points_here && remove_file_if_present(&link.path)? {
                        summary.links_removed += 1;
                    }
                }
                if remove_file_if_present(&canonical)? {
                    summary.deleted_files += 1;
                }
            }
            if remove_file_if_present(&partial_path(&canonical))? {
                summary.swept += 1;
            }
        }

        match reason {
            Reason::Stale => {
                self.store.delete_media(&record.remote_id).await?;
                summary.deleted_items += 1;
                info!(identity = %self.identity, remote_id = %record.remote_id, "removed item no longer reported by the remote");
            }
            Reason::Ignored => {
                if record.canonical_path.is_some() {
                    self.store.reset_media(&record.remote_id).await?;
                    debug!(identity = %self.identity, remote_id = %record.remote_id, "released local copy of ignored item");
                }
            }
        }
        Ok(())
    }

    fn scan_album_links(&self) -> io::Result<Vec<AlbumLink>> {
        let root = self.data_dir.join(ALBUMS_DIR);
        let mut links = Vec::new();
        let Ok(albums) = fs::read_dir(&root) else {
            return Ok(links);
        };
        for album in albums {
            let album = album?;
            if !album.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(album.path())? {
                let entry = entry?;
                let path = entry.path();
                let file_type = entry.file_type()?;
                let (target, inode) = if file_type.is_symlink() {
                    (fs::canonicalize(&path).ok(), None)
                } else if file_type.is_file() {
                    let meta = entry.metadata()?;
                    (None, Some((meta.dev(), meta.ino())))
                } else {
                    continue;
                };
                links.push(AlbumLink { path, target, inode });
            }
        }
        Ok(links)
    }

    async fn sweep_items(&self, summary: &mut RunSummary) -> Result<(), SyncError> {
        let root = self.data_dir.join(ITEMS_DIR);
        if !root.is_dir() {
            return Ok(());
        }
        let claimed = self.store.claimed_paths().await?;
        let mut files = Vec::new();
        collect_files(&root, &mut files)?;
        for file in files {
            let Ok(rel) = file.strip_prefix(self.data_dir) else {
                continue;
            };
            let rel = rel.to_string_lossy();
            if claimed.contains(rel.as_ref()) {
                continue;
            }
            fs::remove_file(&file)?;
            summary.swept += 1;
            debug!(identity = %self.identity, path = %rel, "removed unclaimed file");
        }
        Ok(())
    }

    async fn sweep_albums(&self, summary: &mut RunSummary) -> Result<(), SyncError> {
        let root = self.data_dir.join(ALBUMS_DIR);
        let Ok(entries) = fs::read_dir(&root) else {
            return Ok(());
        };
        let claimed: HashSet<String> = self
            .store
            .list_albums()
            .await?
            .into_iter()
            .flat_map(|album| {
                let current = album_dir(&album.dir_name);
                album.materialized_dir.into_iter().chain(Some(current))
            })
            .collect();

        for entry in entries {
            let entry = entry?;
            let rel = format!("{ALBUMS_DIR}/{}", entry.file_name().to_string_lossy());
            if claimed.contains(&rel) {
                continue;
            }
            let is_dir = entry.file_type()?.is_dir();
            if remove_tree(&entry.path())? {
                if is_dir {
                    summary.album_dirs_removed += 1;
                } else {
                    summary.swept += 1;
                }
                debug!(identity = %self.identity, path = %rel, "removed unclaimed album entry");
            }
        }
        Ok(())
    }
}

fn remove_file_if_present(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            collect_files(&entry.path(), out)?;
        } else {
            out.push(entry.path());
        }
    }
    Ok(())
}

/// Removes empty directories below `dir`; `dir` itself stays.
fn prune_empty(dir: &Path) -> io::Result<bool> {
    let mut empty = true;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() && prune_empty(&path)? {
            fs::remove_dir(&path)?;
        } else {
            empty = false;
        }
    }
    Ok(empty)
}
