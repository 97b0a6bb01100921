use std::collections::BTreeMap;
use std::fmt;

use super::store::{IndexCursor, MediaStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    pub remote_id: String,
    pub reason: String,
}

/// End-of-run report for one identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub indexed_items: usize,
    pub indexed_albums: usize,
    pub new_items: usize,
    pub replaced_items: usize,
    pub placeholders: usize,
    pub repaired: usize,
    pub downloaded: usize,
    pub deferred: usize,
    pub failed: usize,
    pub links_created: usize,
    pub links_removed: usize,
    pub album_dirs_removed: usize,
    pub deleted_files: usize,
    pub deleted_items: usize,
    pub deleted_albums: usize,
    pub swept: usize,
    pub failures: Vec<ItemFailure>,
    pub warnings: Vec<String>,
}

impl RunSummary {
    pub fn fail(&mut self, remote_id: impl Into<String>, reason: impl Into<String>) {
        self.failures.push(ItemFailure {
            remote_id: remote_id.into(),
            reason: reason.into(),
        });
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    /// Filesystem mutations performed during the run.
    pub fn fs_writes(&self) -> usize {
        self.downloaded
            + self.links_created
            + self.links_removed
            + self.album_dirs_removed
            + self.deleted_files
            + self.swept
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "indexed {} items ({} new, {} replaced) and {} albums",
            self.indexed_items, self.new_items, self.replaced_items, self.indexed_albums
        )?;
        writeln!(
            f,
            "downloaded {}, deferred {}, failed {}",
            self.downloaded, self.deferred, self.failed
        )?;
        writeln!(
            f,
            "album links created {}, removed {}",
            self.links_created, self.links_removed
        )?;
        write!(
            f,
            "deleted {} items, {} files, {} albums; swept {}",
            self.deleted_items, self.deleted_files, self.deleted_albums, self.swept
        )?;
        for failure in &self.failures {
            write!(f, "\n  failed {}: {}", failure.remote_id, failure.reason)?;
        }
        for warning in &self.warnings {
            write!(f, "\n  warning: {warning}")?;
        }
        Ok(())
    }
}

/// Snapshot of the metadata store, reported by the `stats` command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub media: BTreeMap<MediaStatus, u64>,
    pub albums: u64,
    pub ignore_entries: u64,
    pub media_cursor: IndexCursor,
    pub album_cursor: IndexCursor,
}

impl StoreStats {
    pub fn count(&self, status: MediaStatus) -> u64 {
        self.media.get(&status).copied().unwrap_or(0)
    }

    pub fn total_media(&self) -> u64 {
        self.media.values().sum()
    }
}

fn cursor_state(cursor: &IndexCursor) -> String {
    if cursor.pass_epoch == 0 {
        "never indexed".to_string()
    } else if cursor.complete {
        format!("complete (pass {})", cursor.completed_epoch)
    } else if cursor.token.is_some() {
        format!("in progress (pass {})", cursor.pass_epoch)
    } else {
        format!("incomplete (pass {})", cursor.pass_epoch)
    }
}

impl fmt::Display for StoreStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "media items: {}", self.total_media())?;
        for status in [
            MediaStatus::Pending,
            MediaStatus::Downloaded,
            MediaStatus::Failed,
            MediaStatus::Ignored,
        ] {
            writeln!(f, "  {:<10} {}", status.as_str(), self.count(status))?;
        }
        writeln!(f, "albums: {}", self.albums)?;
        writeln!(f, "ignore entries: {}", self.ignore_entries)?;
        writeln!(f, "media index: {}", cursor_state(&self.media_cursor))?;
        write!(f, "album index: {}", cursor_state(&self.album_cursor))
    }
}
