use std::collections::{HashMap, HashSet};
use std::path::Path;

use photosync_remote::{AlbumEntry, Fingerprint, MediaEntry, fingerprint_changed};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool, migrate::Migrator};
use thiserror::Error;
use time::OffsetDateTime;

use super::paths::{album_dir_name, id_digest, id_suffix};
use super::stats::StoreStats;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

pub const DB_FILE: &str = "photosync.db";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid media status: {0}")]
    InvalidStatus(String),
    #[error("invalid listing kind: {0}")]
    InvalidKind(String),
    #[error("invalid stored timestamp: {0}")]
    InvalidTimestamp(i64),
    #[error("no media record for {0}")]
    MissingRecord(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MediaStatus {
    Pending,
    Downloaded,
    Failed,
    /// Never persisted; derived from the ignore list.
    Ignored,
}

impl MediaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaStatus::Pending => "pending",
            MediaStatus::Downloaded => "downloaded",
            MediaStatus::Failed => "failed",
            MediaStatus::Ignored => "ignored",
        }
    }

    fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "pending" => Ok(MediaStatus::Pending),
            "downloaded" => Ok(MediaStatus::Downloaded),
            "failed" => Ok(MediaStatus::Failed),
            "ignored" => Ok(MediaStatus::Ignored),
            other => Err(StoreError::InvalidStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListingKind {
    MediaItems,
    Albums,
}

impl ListingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingKind::MediaItems => "media_items",
            ListingKind::Albums => "albums",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "media_items" => Ok(ListingKind::MediaItems),
            "albums" => Ok(ListingKind::Albums),
            other => Err(StoreError::InvalidKind(other.to_string())),
        }
    }
}

/// Resumption state of one listing kind.
///
/// Every walk of a listing is a numbered pass. `completed_epoch` is the last
/// pass that reached the end of the listing, `0` when none did.
/// `unrecorded` counts entries of the current pass the store failed to
/// record, across resumes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexCursor {
    pub token: Option<String>,
    pub complete: bool,
    pub pass_epoch: i64,
    pub completed_epoch: i64,
    pub unrecorded: i64,
    pub updated_at: Option<i64>,
}

impl IndexCursor {
    pub fn is_resumable(&self) -> bool {
        !self.complete && self.token.is_some()
    }

    pub fn begin_pass(&mut self, now: i64) {
        self.token = None;
        self.complete = false;
        self.pass_epoch += 1;
        self.unrecorded = 0;
        self.updated_at = Some(now);
    }

    pub fn advance(&mut self, token: String, now: i64) {
        self.token = Some(token);
        self.updated_at = Some(now);
    }

    pub fn add_unrecorded(&mut self, count: usize) {
        self.unrecorded += count as i64;
    }

    pub fn finish(&mut self, now: i64) {
        self.token = None;
        self.complete = true;
        self.completed_epoch = self.pass_epoch;
        self.updated_at = Some(now);
    }

    /// Drops the token so the next run starts over, without claiming completion.
    pub fn abandon(&mut self, now: i64) {
        self.token = None;
        self.complete = false;
        self.updated_at = Some(now);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRecord {
    pub id: i64,
    pub remote_id: String,
    pub filename: String,
    pub created_at: OffsetDateTime,
    pub fingerprint: Option<Fingerprint>,
    pub locator: Option<String>,
    pub status: MediaStatus,
    /// Relative to the identity's data directory.
    pub canonical_path: Option<String>,
    pub failures: u32,
    pub last_error: Option<String>,
    pub last_seen_epoch: i64,
    pub placeholder: bool,
    pub ignored: bool,
}

impl MediaRecord {
    pub fn effective_status(&self) -> MediaStatus {
        if self.ignored {
            MediaStatus::Ignored
        } else {
            self.status
        }
    }
}

/// What an index upsert did to a media record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaChange {
    Inserted,
    Refreshed,
    /// A placeholder got its real metadata.
    Hydrated,
    /// Content changed remotely; the record is pending again.
    Replaced,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlbumRecord {
    pub id: i64,
    pub remote_id: String,
    pub title: String,
    pub dir_name: String,
    pub materialized_dir: Option<String>,
    pub last_seen_epoch: i64,
    pub member_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlbumChange {
    pub inserted: bool,
    pub renamed: bool,
    pub placeholders: usize,
}

const MEDIA_SELECT: &str = "SELECT m.id, m.remote_id, m.filename, m.created_at, m.fingerprint, m.locator, m.status, m.canonical_path, m.failures, m.last_error, m.last_seen_epoch, m.placeholder, CASE WHEN i.remote_id IS NULL THEN 0 ELSE 1 END AS ignored
     FROM media_items m
     LEFT JOIN ignored_items i ON i.remote_id = m.remote_id";

fn media_from_row(row: &SqliteRow) -> Result<MediaRecord, StoreError> {
    let created_at: i64 = row.try_get("created_at")?;
    let status: String = row.try_get("status")?;
    let fingerprint: Option<String> = row.try_get("fingerprint")?;
    let failures: i64 = row.try_get("failures")?;
    let placeholder: i64 = row.try_get("placeholder")?;
    let ignored: i64 = row.try_get("ignored")?;
    Ok(MediaRecord {
        id: row.try_get("id")?,
        remote_id: row.try_get("remote_id")?,
        filename: row.try_get("filename")?,
        created_at: OffsetDateTime::from_unix_timestamp(created_at)
            .map_err(|_| StoreError::InvalidTimestamp(created_at))?,
        fingerprint: fingerprint.as_deref().and_then(Fingerprint::decode),
        locator: row.try_get("locator")?,
        status: MediaStatus::parse(&status)?,
        canonical_path: row.try_get("canonical_path")?,
        failures: u32::try_from(failures).unwrap_or(u32::MAX),
        last_error: row.try_get("last_error")?,
        last_seen_epoch: row.try_get("last_seen_epoch")?,
        placeholder: placeholder != 0,
        ignored: ignored != 0,
    })
}

fn now_epoch() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// Durable per-identity record of the remote library.
///
/// File-backed stores hold a single pooled connection, so every statement for
/// an identity is serialised; multi-statement mutations run in a transaction.
#[derive(Clone)]
pub struct IndexStore {
    pool: SqlitePool,
}

impl IndexStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(data_dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(data_dir)?;
        let options = SqliteConnectOptions::new()
            .filename(data_dir.join(DB_FILE))
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn in_memory() -> Result<Self, StoreError> {
        // An in-memory database lives exactly as long as its connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn get_cursor(&self, kind: ListingKind) -> Result<IndexCursor, StoreError> {
        let row = sqlx::query(
            "SELECT token, complete, pass_epoch, completed_epoch, unrecorded, updated_at FROM index_cursors WHERE kind = ?1",
        )
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(IndexCursor::default());
        };
        let complete: i64 = row.try_get("complete")?;
        Ok(IndexCursor {
            token: row.try_get("token")?,
            complete: complete != 0,
            pass_epoch: row.try_get("pass_epoch")?,
            completed_epoch: row.try_get("completed_epoch")?,
            unrecorded: row.try_get("unrecorded")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    pub async fn save_cursor(
        &self,
        kind: ListingKind,
        cursor: &IndexCursor,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO index_cursors (kind, token, complete, pass_epoch, completed_epoch, unrecorded, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(kind) DO UPDATE SET
                token = excluded.token,
                complete = excluded.complete,
                pass_epoch = excluded.pass_epoch,
                completed_epoch = excluded.completed_epoch,
                unrecorded = excluded.unrecorded,
                updated_at = excluded.updated_at",
        )
        .bind(kind.as_str())
        .bind(&cursor.token)
        .bind(if cursor.complete { 1 } else { 0 })
        .bind(cursor.pass_epoch)
        .bind(cursor.completed_epoch)
        .bind(cursor.unrecorded)
        .bind(cursor.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Records one observation of a remote media item in pass `epoch`.
    pub async fn apply_media_entry(
        &self,
        entry: &MediaEntry,
        epoch: i64,
    ) -> Result<MediaChange, StoreError> {
        let fingerprint = entry.fingerprint.as_ref().map(Fingerprint::encode);
        let mut tx = self.pool.begin().await?;
        let existing =
            sqlx::query("SELECT status, fingerprint, placeholder FROM media_items WHERE remote_id = ?1")
                .bind(&entry.id)
                .fetch_optional(&mut *tx)
                .await?;

        let change = match existing {
            None => {
                sqlx::query(
                    "INSERT INTO media_items (remote_id, filename, created_at, fingerprint, locator, status, last_seen_epoch)
                     VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6)",
                )
                .bind(&entry.id)
                .bind(&entry.filename)
                .bind(entry.created_at.unix_timestamp())
                .bind(&fingerprint)
                .bind(&entry.locator)
                .bind(epoch)
                .execute(&mut *tx)
                .await?;
                MediaChange::Inserted
            }
            Some(row) => {
                let status: String = row.try_get("status")?;
                let status = MediaStatus::parse(&status)?;
                let stored: Option<String> = row.try_get("fingerprint")?;
                let placeholder: i64 = row.try_get("placeholder")?;
                let stored = stored.as_deref().and_then(Fingerprint::decode);
                let replaced = status == MediaStatus::Downloaded
                    && fingerprint_changed(stored.as_ref(), entry.fingerprint.as_ref());
                let next_status = if replaced {
                    MediaStatus::Pending
                } else {
                    status
                };

                // canonical_path is left alone: a replacement is renamed over it.
                sqlx::query(
                    "UPDATE media_items SET
                        filename = ?2,
                        created_at = ?3,
                        fingerprint = COALESCE(?4, fingerprint),
                        locator = ?5,
                        status = ?6,
                        failures = CASE WHEN ?7 THEN 0 ELSE failures END,
                        last_seen_epoch = ?8,
                        placeholder = 0
                     WHERE remote_id = ?1",
                )
                .bind(&entry.id)
                .bind(&entry.filename)
                .bind(entry.created_at.unix_timestamp())
                .bind(&fingerprint)
                .bind(&entry.locator)
                .bind(next_status.as_str())
                .bind(replaced)
                .bind(epoch)
                .execute(&mut *tx)
                .await?;

                if replaced {
                    MediaChange::Replaced
                } else if placeholder != 0 {
                    MediaChange::Hydrated
                } else {
                    MediaChange::Refreshed
                }
            }
        };

        tx.commit().await?;
        Ok(change)
    }

    /// Refreshes metadata from a single-item lookup without touching pass stamps.
    pub async fn hydrate_media(&self, entry: &MediaEntry) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE media_items SET
                filename = ?2,
                created_at = ?3,
                fingerprint = COALESCE(?4, fingerprint),
                locator = ?5,
                placeholder = 0
             WHERE remote_id = ?1",
        )
        .bind(&entry.id)
        .bind(&entry.filename)
        .bind(entry.created_at.unix_timestamp())
        .bind(entry.fingerprint.as_ref().map(Fingerprint::encode))
        .bind(&entry.locator)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::MissingRecord(entry.id.clone()));
        }
        Ok(())
    }

    pub async fn get_media(&self, remote_id: &str) -> Result<Option<MediaRecord>, StoreError> {
        let row = sqlx::query(&format!("{MEDIA_SELECT} WHERE m.remote_id = ?1"))
            .bind(remote_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(media_from_row).transpose()
    }

    pub async fn list_media(&self) -> Result<Vec<MediaRecord>, StoreError> {
        let rows = sqlx::query(&format!("{MEDIA_SELECT} ORDER BY m.remote_id ASC"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(media_from_row).collect()
    }

    /// Records whose persisted status is `status`, ignored or not.
    pub async fn list_media_with_status(
        &self,
        status: MediaStatus,
    ) -> Result<Vec<MediaRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "{MEDIA_SELECT} WHERE m.status = ?1 ORDER BY m.remote_id ASC"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(media_from_row).collect()
    }

    /// Pending and failed records that are not ignored.
    pub async fn list_download_candidates(&self) -> Result<Vec<MediaRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "{MEDIA_SELECT}
             WHERE m.status IN ('pending', 'failed') AND i.remote_id IS NULL
             ORDER BY m.remote_id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(media_from_row).collect()
    }

    pub async fn list_ignored_media(&self) -> Result<Vec<MediaRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "{MEDIA_SELECT} WHERE i.remote_id IS NOT NULL ORDER BY m.remote_id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(media_from_row).collect()
    }

    /// Records last seen before `epoch` that no album references.
    pub async fn list_stale_media(&self, epoch: i64) -> Result<Vec<MediaRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "{MEDIA_SELECT}
             WHERE m.last_seen_epoch < ?1
                AND NOT EXISTS (SELECT 1 FROM album_members am WHERE am.remote_id = m.remote_id)
             ORDER BY m.remote_id ASC"
        ))
        .bind(epoch)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(media_from_row).collect()
    }

    pub async fn claimed_paths(&self) -> Result<HashSet<String>, StoreError> {
        let rows =
            sqlx::query("SELECT canonical_path FROM media_items WHERE canonical_path IS NOT NULL")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|row| {
                row.try_get::<String, _>("canonical_path")
                    .map_err(StoreError::from)
            })
            .collect()
    }

    /// Assigns a canonical path to a record that has none yet.
    ///
    /// Returns `false` when the record already had a path.
    pub async fn reserve_canonical_path(
        &self,
        remote_id: &str,
        path: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE media_items SET canonical_path = ?2 WHERE remote_id = ?1 AND canonical_path IS NULL",
        )
        .bind(remote_id)
        .bind(path)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn mark_downloaded(&self, remote_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE media_items SET status = 'downloaded', failures = 0, last_error = NULL
             WHERE remote_id = ?1 AND canonical_path IS NOT NULL",
        )
        .bind(remote_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::MissingRecord(remote_id.to_string()));
        }
        Ok(())
    }

    /// Counts one more consecutive failure; the record turns `failed` once the
    /// count reaches `max_failures`.
    pub async fn record_failure(
        &self,
        remote_id: &str,
        reason: &str,
        max_failures: u32,
    ) -> Result<MediaStatus, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE media_items SET
                failures = failures + 1,
                last_error = ?2,
                status = CASE WHEN failures + 1 >= ?3 THEN 'failed' ELSE status END
             WHERE remote_id = ?1 AND status != 'downloaded'",
        )
        .bind(remote_id)
        .bind(reason)
        .bind(i64::from(max_failures.max(1)))
        .execute(&mut *tx)
        .await?;
        let row = sqlx::query("SELECT status FROM media_items WHERE remote_id = ?1")
            .bind(remote_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::MissingRecord(remote_id.to_string()))?;
        let status: String = row.try_get("status")?;
        tx.commit().await?;
        MediaStatus::parse(&status)
    }

    pub async fn revert_to_pending(&self, remote_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE media_items SET status = 'pending' WHERE remote_id = ?1 AND status = 'downloaded'",
        )
        .bind(remote_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Forgets the local copy of a record the remote still reports.
    pub async fn reset_media(&self, remote_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE media_items SET status = 'pending', canonical_path = NULL, failures = 0, last_error = NULL
             WHERE remote_id = ?1",
        )
        .bind(remote_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_media(&self, remote_id: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM album_members WHERE remote_id = ?1")
            .bind(remote_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM media_items WHERE remote_id = ?1")
            .bind(remote_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Records one observation of a remote album in pass `epoch`, replacing its
    /// membership and creating placeholder records for unknown members.
    pub async fn apply_album_entry(
        &self,
        entry: &AlbumEntry,
        epoch: i64,
    ) -> Result<AlbumChange, StoreError> {
        let mut change = AlbumChange::default();
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query("SELECT title, dir_name FROM albums WHERE remote_id = ?1")
            .bind(&entry.id)
            .fetch_optional(&mut *tx)
            .await?;
        let dir_name = match existing {
            Some(row) => {
                let title: String = row.try_get("title")?;
                let dir_name: String = row.try_get("dir_name")?;
                if title == entry.title {
                    dir_name
                } else {
                    let next = free_dir_name(&mut tx, &entry.title, &entry.id).await?;
                    change.renamed = next != dir_name;
                    next
                }
            }
            None => {
                change.inserted = true;
                free_dir_name(&mut tx, &entry.title, &entry.id).await?
            }
        };

        sqlx::query(
            "INSERT INTO albums (remote_id, title, dir_name, last_seen_epoch)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(remote_id) DO UPDATE SET
                title = excluded.title,
                dir_name = excluded.dir_name,
                last_seen_epoch = excluded.last_seen_epoch",
        )
        .bind(&entry.id)
        .bind(&entry.title)
        .bind(&dir_name)
        .bind(epoch)
        .execute(&mut *tx)
        .await?;
        let album_id: i64 = sqlx::query("SELECT id FROM albums WHERE remote_id = ?1")
            .bind(&entry.id)
            .fetch_one(&mut *tx)
            .await?
            .try_get("id")?;

        sqlx::query("DELETE FROM album_members WHERE album_id = ?1")
            .bind(album_id)
            .execute(&mut *tx)
            .await?;
        let mut seen = HashSet::new();
        let members: Vec<&String> = entry
            .member_ids
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .collect();
        for (position, member) in members.into_iter().enumerate() {
            sqlx::query("INSERT INTO album_members (album_id, remote_id, position) VALUES (?1, ?2, ?3)")
                .bind(album_id)
                .bind(member)
                .bind(position as i64)
                .execute(&mut *tx)
                .await?;
            let inserted = sqlx::query(
                "INSERT INTO media_items (remote_id, filename, created_at, status, placeholder, last_seen_epoch)
                 VALUES (?1, ?1, 0, 'pending', 1, 0)
                 ON CONFLICT(remote_id) DO NOTHING",
            )
            .bind(member)
            .execute(&mut *tx)
            .await?;
            change.placeholders += inserted.rows_affected() as usize;
        }

        tx.commit().await?;
        Ok(change)
    }

    pub async fn list_albums(&self) -> Result<Vec<AlbumRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, remote_id, title, dir_name, materialized_dir, last_seen_epoch FROM albums ORDER BY remote_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        let member_rows = sqlx::query(
            "SELECT album_id, remote_id FROM album_members ORDER BY album_id ASC, position ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut members: HashMap<i64, Vec<String>> = HashMap::new();
        for row in member_rows {
            members
                .entry(row.try_get("album_id")?)
                .or_default()
                .push(row.try_get("remote_id")?);
        }

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("id")?;
            out.push(AlbumRecord {
                id,
                remote_id: row.try_get("remote_id")?,
                title: row.try_get("title")?,
                dir_name: row.try_get("dir_name")?,
                materialized_dir: row.try_get("materialized_dir")?,
                last_seen_epoch: row.try_get("last_seen_epoch")?,
                member_ids: members.remove(&id).unwrap_or_default(),
            });
        }
        Ok(out)
    }

    pub async fn set_materialized_dir(
        &self,
        album_id: i64,
        dir: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE albums SET materialized_dir = ?2 WHERE id = ?1")
            .bind(album_id)
            .bind(dir)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Deletes an album. The first album (by remote id) whose title wants the
    /// freed directory name, but had to settle for a suffixed one, takes it over.
    pub async fn delete_album(&self, album_id: i64) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let freed: Option<String> = sqlx::query("SELECT dir_name FROM albums WHERE id = ?1")
            .bind(album_id)
            .fetch_optional(&mut *tx)
            .await?
            .map(|row| row.try_get("dir_name"))
            .transpose()?;
        sqlx::query("DELETE FROM album_members WHERE album_id = ?1")
            .bind(album_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM albums WHERE id = ?1")
            .bind(album_id)
            .execute(&mut *tx)
            .await?;

        if let Some(freed) = freed {
            let rows = sqlx::query("SELECT id, title, dir_name FROM albums ORDER BY remote_id ASC")
                .fetch_all(&mut *tx)
                .await?;
            for row in rows {
                let title: String = row.try_get("title")?;
                let dir_name: String = row.try_get("dir_name")?;
                if dir_name != freed && album_dir_name(&title) == freed {
                    let id: i64 = row.try_get("id")?;
                    sqlx::query("UPDATE albums SET dir_name = ?2 WHERE id = ?1")
                        .bind(id)
                        .bind(&freed)
                        .execute(&mut *tx)
                        .await?;
                    break;
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }

    /// Adds ignore entries; returns how many were new.
    pub async fn add_ignored(&self, remote_ids: &[String]) -> Result<usize, StoreError> {
        let now = now_epoch();
        let mut tx = self.pool.begin().await?;
        let mut added = 0;
        for remote_id in remote_ids {
            let result = sqlx::query(
                "INSERT INTO ignored_items (remote_id, created_at) VALUES (?1, ?2)
                 ON CONFLICT(remote_id) DO NOTHING",
            )
            .bind(remote_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            added += result.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(added)
    }

    pub async fn clear_ignored(&self) -> Result<usize, StoreError> {
        let result = sqlx::query("DELETE FROM ignored_items")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    pub async fn list_ignored(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT remote_id FROM ignored_items ORDER BY remote_id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| row.try_get::<String, _>("remote_id").map_err(StoreError::from))
            .collect()
    }

    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        let mut stats = StoreStats {
            media_cursor: self.get_cursor(ListingKind::MediaItems).await?,
            album_cursor: self.get_cursor(ListingKind::Albums).await?,
            ..StoreStats::default()
        };

        let rows = sqlx::query(
            "SELECT CASE WHEN i.remote_id IS NULL THEN m.status ELSE 'ignored' END AS effective, COUNT(*) AS n
             FROM media_items m
             LEFT JOIN ignored_items i ON i.remote_id = m.remote_id
             GROUP BY effective",
        )
        .fetch_all(&self.pool)
        .await?;
        for row in rows {
            let status: String = row.try_get("effective")?;
            let count: i64 = row.try_get("n")?;
            stats.media.insert(MediaStatus::parse(&status)?, count as u64);
        }

        stats.albums = sqlx::query("SELECT COUNT(*) AS n FROM albums")
            .fetch_one(&self.pool)
            .await?
            .try_get::<i64, _>("n")? as u64;
        stats.ignore_entries = sqlx::query("SELECT COUNT(*) AS n FROM ignored_items")
            .fetch_one(&self.pool)
            .await?
            .try_get::<i64, _>("n")? as u64;
        Ok(stats)
    }
}

/// Picks a directory name for an album title that no other album holds.
async fn free_dir_name(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    title: &str,
    remote_id: &str,
) -> Result<String, StoreError> {
    let base = album_dir_name(title);
    let candidates = [
        base.clone(),
        format!("{base}_{}", id_suffix(remote_id)),
        format!("{base}_{}", id_digest(remote_id)),
    ];
    for candidate in &candidates {
        let taken = sqlx::query("SELECT 1 FROM albums WHERE dir_name = ?1 AND remote_id != ?2")
            .bind(candidate)
            .bind(remote_id)
            .fetch_optional(&mut **tx)
            .await?;
        if taken.is_none() {
            return Ok(candidate.clone());
        }
    }
    // The full digest is unique per remote id.
    Ok(candidates[2].clone())
}
