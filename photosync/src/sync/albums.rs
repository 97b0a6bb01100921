use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;
use tracing::{debug, info, warn};

use super::engine::SyncError;
use super::paths::{album_dir, id_suffix, resolve, with_suffix};
use super::stats::RunSummary;
use super::store::{AlbumRecord, IndexStore, MediaRecord};

/// How album entries refer to canonical files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkMode {
    /// Relative symbolic link into `items/`.
    #[default]
    Symlink,
    Hardlink,
    Copy,
}

impl LinkMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkMode::Symlink => "symlink",
            LinkMode::Hardlink => "hardlink",
            LinkMode::Copy => "copy",
        }
    }
}

impl FromStr for LinkMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "symlink" | "link" => Ok(LinkMode::Symlink),
            "hardlink" => Ok(LinkMode::Hardlink),
            "copy" => Ok(LinkMode::Copy),
            other => Err(format!("unknown link mode: {other}")),
        }
    }
}

/// One wanted album entry: its name inside the album directory and the
/// canonical file it stands for.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Desired {
    canonical_rel: String,
    canonical: PathBuf,
}

/// Projects album membership onto `albums/<dir>/` as links or copies.
pub struct AlbumMaterializer<'a> {
    identity: &'a str,
    store: &'a IndexStore,
    data_dir: &'a Path,
    mode: LinkMode,
}

impl<'a> AlbumMaterializer<'a> {
    pub fn new(identity: &'a str, store: &'a IndexStore, data_dir: &'a Path, mode: LinkMode) -> Self {
        Self {
            identity,
            store,
            data_dir,
            mode,
        }
    }

    pub async fn run(&self, summary: &mut RunSummary) -> Result<(), SyncError> {
        let albums = self.store.list_albums().await?;
        let media: HashMap<String, MediaRecord> = self
            .store
            .list_media()
            .await?
            .into_iter()
            .map(|record| (record.remote_id.clone(), record))
            .collect();
        let current: HashSet<String> = albums.iter().map(|album| album_dir(&album.dir_name)).collect();

        for album in &albums {
            if let Err(err) = self.materialize(album, &media, &current, summary).await {
                match err {
                    SyncError::Store(_) => return Err(err),
                    other => {
                        warn!(identity = %self.identity, album = %album.title, error = %other, "failed to materialize album");
                        summary.fail(&album.remote_id, format!("album {}: {other}", album.title));
                    }
                }
            }
        }
        Ok(())
    }

    async fn materialize(
        &self,
        album: &AlbumRecord,
        media: &HashMap<String, MediaRecord>,
        current: &HashSet<String>,
        summary: &mut RunSummary,
    ) -> Result<(), SyncError> {
        let dir_rel = album_dir(&album.dir_name);
        let dir = resolve(self.data_dir, &dir_rel)?;

        // A renamed album gets a fresh directory. The old one goes away whole
        // unless another album now owns that name; its own diff cleans it up.
        if let Some(previous) = album.materialized_dir.as_deref()
            && previous != dir_rel
        {
            if current.contains(previous) {
                debug!(identity = %self.identity, album = %album.title, from = previous, "previous directory taken over by another album");
            } else {
                let old = resolve(self.data_dir, previous)?;
                if remove_tree(&old)? {
                    info!(identity = %self.identity, album = %album.title, from = previous, "removed directory of renamed album");
                    summary.album_dirs_removed += 1;
                }
            }
            self.store.set_materialized_dir(album.id, None).await?;
        }

        let desired = self.desired_entries(album, media)?;
        if desired.is_empty() {
            if remove_tree(&dir)? {
                debug!(identity = %self.identity, album = %album.title, "removed empty album directory");
                summary.album_dirs_removed += 1;
            }
            if album.materialized_dir.is_some() {
                self.store.set_materialized_dir(album.id, None).await?;
            }
            return Ok(());
        }

        fs::create_dir_all(&dir)?;
        let mut satisfied = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let keep = entry
                .file_name()
                .to_str()
                .and_then(|name| desired.get(name).map(|want| (name.to_string(), want)))
                .filter(|(_, want)| self.entry_matches(&path, want).unwrap_or(false));
            match keep {
                Some((name, _)) => satisfied.push(name),
                None => {
                    remove_entry(&path)?;
                    summary.links_removed += 1;
                }
            }
        }

        for (name, want) in &desired {
            if satisfied.contains(name) {
                continue;
            }
            self.create_entry(&dir.join(name), want)?;
            summary.links_created += 1;
        }

        if album.materialized_dir.as_deref() != Some(dir_rel.as_str()) {
            self.store.set_materialized_dir(album.id, Some(&dir_rel)).await?;
        }
        Ok(())
    }

    /// Non-ignored members whose canonical file is installed, keyed by entry
    /// name. Duplicate names get an id suffix in membership order.
    fn desired_entries(
        &self,
        album: &AlbumRecord,
        media: &HashMap<String, MediaRecord>,
    ) -> Result<BTreeMap<String, Desired>, SyncError> {
        let mut desired = BTreeMap::new();
        for member in &album.member_ids {
            let Some(record) = media.get(member) else {
                continue;
            };
            if record.ignored {
                continue;
            }
            // A record awaiting a replacement download keeps its installed file.
            let Some(canonical_rel) = record.canonical_path.as_deref() else {
                continue;
            };
            let canonical = resolve(self.data_dir, canonical_rel)?;
            if !canonical.is_file() {
                continue;
            }

            let base = Path::new(canonical_rel)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| member.clone());
            let name = if desired.contains_key(&base) {
                with_suffix(&base, &id_suffix(member))
            } else {
                base
            };
            desired.insert(
                name,
                Desired {
                    canonical_rel: canonical_rel.to_string(),
                    canonical,
                },
            );
        }
        Ok(desired)
    }

    fn entry_matches(&self, path: &Path, want: &Desired) -> io::Result<bool> {
        let meta = fs::symlink_metadata(path)?;
        match self.mode {
            LinkMode::Symlink => {
                Ok(meta.file_type().is_symlink() && fs::read_link(path)? == symlink_target(&want.canonical_rel))
            }
            LinkMode::Hardlink => {
                let canonical = fs::metadata(&want.canonical)?;
                Ok(meta.is_file() && meta.dev() == canonical.dev() && meta.ino() == canonical.ino())
            }
            LinkMode::Copy => {
                let canonical = fs::metadata(&want.canonical)?;
                Ok(meta.is_file()
                    && meta.ino() != canonical.ino()
                    && meta.len() == canonical.len()
                    && meta.modified()? >= canonical.modified()?)
            }
        }
    }

    fn create_entry(&self, path: &Path, want: &Desired) -> io::Result<()> {
        match self.mode {
            LinkMode::Symlink => std::os::unix::fs::symlink(symlink_target(&want.canonical_rel), path),
            LinkMode::Hardlink => fs::hard_link(&want.canonical, path),
            LinkMode::Copy => fs::copy(&want.canonical, path).map(|_| ()),
        }
    }
}

/// Album entries sit two levels below the data directory.
fn symlink_target(canonical_rel: &str) -> PathBuf {
    Path::new("..").join("..").join(canonical_rel)
}

fn remove_entry(path: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Removes a directory tree; `false` when there was nothing to remove.
pub(crate) fn remove_tree(path: &Path) -> io::Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(_) => {
            remove_entry(path)?;
            Ok(true)
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}
