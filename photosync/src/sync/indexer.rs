use std::future::Future;

use photosync_remote::{AlbumEntry, CatalogError, MediaEntry, Page, RemoteCatalog};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use super::backoff::RetryPolicy;
use super::engine::SyncError;
use super::stats::RunSummary;
use super::store::{IndexCursor, IndexStore, ListingKind, MediaChange};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IndexMode {
    /// Resume an interrupted pass from its stored cursor.
    #[default]
    Incremental,
    /// Discard any stored cursor and walk the listing from the start.
    Rescan,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IndexScope {
    #[default]
    All,
    ItemsOnly,
    AlbumsOnly,
}

impl IndexScope {
    fn includes(&self, kind: ListingKind) -> bool {
        match (self, kind) {
            (IndexScope::All, _) => true,
            (IndexScope::ItemsOnly, ListingKind::MediaItems) => true,
            (IndexScope::AlbumsOnly, ListingKind::Albums) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexOptions {
    pub mode: IndexMode,
    pub scope: IndexScope,
    /// Only refresh albums with exactly this title; the album cursor is untouched.
    pub album_title: Option<String>,
}

fn now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// Reconciles the metadata store with the remote listings.
pub struct Indexer<'a> {
    identity: &'a str,
    store: &'a IndexStore,
    catalog: &'a dyn RemoteCatalog,
    retry: RetryPolicy,
}

impl<'a> Indexer<'a> {
    pub fn new(
        identity: &'a str,
        store: &'a IndexStore,
        catalog: &'a dyn RemoteCatalog,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            identity,
            store,
            catalog,
            retry,
        }
    }

    pub async fn run(
        &self,
        options: &IndexOptions,
        summary: &mut RunSummary,
    ) -> Result<(), SyncError> {
        if options.scope.includes(ListingKind::MediaItems) {
            self.index_media(options.mode, summary).await?;
        }
        if options.scope.includes(ListingKind::Albums) {
            match options.album_title.as_deref() {
                Some(title) => self.index_albums_titled(title, summary).await?,
                None => self.index_albums(options.mode, summary).await?,
            }
        }
        Ok(())
    }

    async fn index_media(&self, mode: IndexMode, summary: &mut RunSummary) -> Result<(), SyncError> {
        let kind = ListingKind::MediaItems;
        let mut cursor = self.start_pass(kind, mode).await?;
        let epoch = cursor.pass_epoch;

        loop {
            let mut errors = 0usize;
            let token = cursor.token.clone();
            let token = token.as_deref();
            let page: Page<MediaEntry> = self
                .fetch_page(kind, move || self.catalog.list_media_items(token))
                .await?;

            for entry in &page.items {
                if entry.id.is_empty() {
                    errors += 1;
                    summary.warn(format!("media listing returned an entry without id ({})", entry.filename));
                    continue;
                }
                match self.store.apply_media_entry(entry, epoch).await {
                    Ok(change) => {
                        summary.indexed_items += 1;
                        match change {
                            MediaChange::Inserted => summary.new_items += 1,
                            MediaChange::Replaced => {
                                summary.replaced_items += 1;
                                info!(identity = %self.identity, remote_id = %entry.id, "remote content changed, scheduling replacement");
                            }
                            MediaChange::Hydrated | MediaChange::Refreshed => {}
                        }
                    }
                    Err(err) => {
                        errors += 1;
                        warn!(identity = %self.identity, remote_id = %entry.id, error = %err, "failed to record media item");
                        summary.warn(format!("failed to record media item {}: {err}", entry.id));
                    }
                }
            }

            if self.finish_page(kind, &mut cursor, page.next_cursor, page.is_last, errors).await? {
                break;
            }
        }

        info!(identity = %self.identity, epoch, complete = cursor.complete, "media listing indexed");
        Ok(())
    }

    async fn index_albums(&self, mode: IndexMode, summary: &mut RunSummary) -> Result<(), SyncError> {
        let kind = ListingKind::Albums;
        let mut cursor = self.start_pass(kind, mode).await?;
        let epoch = cursor.pass_epoch;

        loop {
            let mut errors = 0usize;
            let token = cursor.token.clone();
            let token = token.as_deref();
            let page: Page<AlbumEntry> = self
                .fetch_page(kind, move || self.catalog.list_albums(token))
                .await?;

            for entry in &page.items {
                if !self.apply_album(entry, epoch, summary).await {
                    errors += 1;
                }
            }

            if self.finish_page(kind, &mut cursor, page.next_cursor, page.is_last, errors).await? {
                break;
            }
        }

        info!(identity = %self.identity, epoch, complete = cursor.complete, "album listing indexed");
        Ok(())
    }

    /// Walks the whole album listing but records only albums titled `title`,
    /// stamped with the current album pass so they are not seen as stale.
    async fn index_albums_titled(&self, title: &str, summary: &mut RunSummary) -> Result<(), SyncError> {
        let epoch = self.store.get_cursor(ListingKind::Albums).await?.pass_epoch;
        let mut token: Option<String> = None;
        let mut matched = 0usize;

        loop {
            let current = token.clone();
            let current = current.as_deref();
            let page = self
                .fetch_page(ListingKind::Albums, move || self.catalog.list_albums(current))
                .await?;

            for entry in page.items.iter().filter(|entry| entry.title == title) {
                matched += 1;
                self.apply_album(entry, epoch, summary).await;
            }

            match page.next_cursor {
                Some(next) if !page.is_last => token = Some(next),
                _ => break,
            }
        }

        if matched == 0 {
            warn!(identity = %self.identity, title, "no remote album has this title");
            summary.warn(format!("no remote album titled {title:?}"));
        }
        Ok(())
    }

    async fn apply_album(&self, entry: &AlbumEntry, epoch: i64, summary: &mut RunSummary) -> bool {
        match self.store.apply_album_entry(entry, epoch).await {
            Ok(change) => {
                summary.indexed_albums += 1;
                summary.placeholders += change.placeholders;
                if change.renamed {
                    info!(identity = %self.identity, remote_id = %entry.id, title = %entry.title, "album renamed");
                }
                debug!(identity = %self.identity, remote_id = %entry.id, members = entry.member_ids.len(), "album indexed");
                true
            }
            Err(err) => {
                warn!(identity = %self.identity, remote_id = %entry.id, error = %err, "failed to record album");
                summary.warn(format!("failed to record album {}: {err}", entry.id));
                false
            }
        }
    }

    async fn start_pass(&self, kind: ListingKind, mode: IndexMode) -> Result<IndexCursor, SyncError> {
        let mut cursor = self.store.get_cursor(kind).await?;
        if mode == IndexMode::Incremental && cursor.is_resumable() {
            info!(identity = %self.identity, kind = kind.as_str(), epoch = cursor.pass_epoch, "resuming interrupted index pass");
        } else {
            cursor.begin_pass(now());
            self.store.save_cursor(kind, &cursor).await?;
            debug!(identity = %self.identity, kind = kind.as_str(), epoch = cursor.pass_epoch, "starting index pass");
        }
        Ok(cursor)
    }

    /// Persists the cursor after a page was applied; returns whether the pass ended.
    ///
    /// A pass with unrecorded entries ends without completion, so its absences
    /// are never trusted. The count lives on the cursor, so a resumed pass
    /// still knows about pages recorded before the interruption.
    async fn finish_page(
        &self,
        kind: ListingKind,
        cursor: &mut IndexCursor,
        next: Option<String>,
        is_last: bool,
        errors: usize,
    ) -> Result<bool, SyncError> {
        cursor.add_unrecorded(errors);
        let done = match next {
            Some(token) if !is_last => {
                cursor.advance(token, now());
                false
            }
            _ if cursor.unrecorded == 0 => {
                cursor.finish(now());
                true
            }
            _ => {
                let errors = cursor.unrecorded;
                warn!(identity = %self.identity, kind = kind.as_str(), errors, "index pass finished with errors, not marking it complete");
                cursor.abandon(now());
                true
            }
        };
        self.store.save_cursor(kind, cursor).await?;
        Ok(done)
    }

    async fn fetch_page<T, F, Fut>(&self, kind: ListingKind, mut fetch: F) -> Result<Page<T>, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Page<T>, CatalogError>>,
    {
        let mut attempt = 0;
        loop {
            match fetch().await {
                Ok(page) => return Ok(page),
                Err(err) if err.is_retryable() && self.retry.allows_retry(attempt) => {
                    warn!(identity = %self.identity, kind = kind.as_str(), attempt, error = %err, "listing page failed, retrying");
                    self.retry.pause(attempt).await;
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}
