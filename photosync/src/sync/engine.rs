use std::sync::Arc;

use photosync_remote::{CatalogError, RemoteCatalog};
use thiserror::Error;
use tracing::{info, warn};

use super::albums::AlbumMaterializer;
use super::download::DownloadScheduler;
use super::ignore::IgnoreManager;
use super::indexer::{IndexOptions, Indexer};
use super::obsolete::ObsoleteReconciler;
use super::paths::PathError;
use super::stats::{RunSummary, StoreStats};
use super::store::{IndexStore, StoreError};
use crate::config::IdentityConfig;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no remote catalog configured for this identity")]
    NoCatalog,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOptions {
    pub index: IndexOptions,
    /// Reuse whatever the store already knows instead of listing the remote.
    pub skip_index: bool,
    /// Reconcile even when the latest index passes are incomplete.
    pub force_delete: bool,
}

/// Runs the sync phases of one identity against its store and data directory.
pub struct SyncEngine {
    config: IdentityConfig,
    store: IndexStore,
    catalog: Option<Arc<dyn RemoteCatalog>>,
}

impl SyncEngine {
    pub fn new(config: IdentityConfig, store: IndexStore) -> Self {
        Self {
            config,
            store,
            catalog: None,
        }
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn RemoteCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn config(&self) -> &IdentityConfig {
        &self.config
    }

    pub fn store(&self) -> &IndexStore {
        &self.store
    }

    fn catalog(&self) -> Result<&dyn RemoteCatalog, SyncError> {
        self.catalog.as_deref().ok_or(SyncError::NoCatalog)
    }

    pub async fn index(
        &self,
        options: &IndexOptions,
        summary: &mut RunSummary,
    ) -> Result<(), SyncError> {
        let indexer = Indexer::new(
            &self.config.name,
            &self.store,
            self.catalog()?,
            self.config.retry_policy(),
        );
        indexer.run(options, summary).await?;
        info!(
            identity = %self.config.name,
            items = summary.indexed_items,
            albums = summary.indexed_albums,
            new = summary.new_items,
            replaced = summary.replaced_items,
            "index phase finished"
        );
        Ok(())
    }

    pub async fn download(&self, summary: &mut RunSummary) -> Result<(), SyncError> {
        DownloadScheduler::new(&self.config, &self.store, self.catalog()?)
            .run(summary)
            .await?;
        info!(
            identity = %self.config.name,
            downloaded = summary.downloaded,
            deferred = summary.deferred,
            failed = summary.failed,
            "download phase finished"
        );
        Ok(())
    }

    pub async fn materialize_albums(&self, summary: &mut RunSummary) -> Result<(), SyncError> {
        AlbumMaterializer::new(
            &self.config.name,
            &self.store,
            &self.config.data_dir,
            self.config.link_mode,
        )
        .run(summary)
        .await?;
        info!(
            identity = %self.config.name,
            created = summary.links_created,
            removed = summary.links_removed,
            mode = self.config.link_mode.as_str(),
            "album phase finished"
        );
        Ok(())
    }

    pub async fn delete_obsolete(
        &self,
        force: bool,
        summary: &mut RunSummary,
    ) -> Result<(), SyncError> {
        ObsoleteReconciler::new(&self.config.name, &self.store, &self.config.data_dir)
            .run(force, summary)
            .await?;
        info!(
            identity = %self.config.name,
            files = summary.deleted_files,
            items = summary.deleted_items,
            albums = summary.deleted_albums,
            swept = summary.swept,
            "reconcile phase finished"
        );
        Ok(())
    }

    /// Index, download, materialize, reconcile. The first phase error stops
    /// the remaining phases; per-item failures land in `summary`.
    pub async fn sync(&self, options: &SyncOptions, summary: &mut RunSummary) -> Result<(), SyncError> {
        if options.skip_index {
            info!(identity = %self.config.name, "index phase skipped");
        } else {
            self.index(&options.index, summary).await?;
        }
        self.download(summary).await?;
        self.materialize_albums(summary).await?;
        self.delete_obsolete(options.force_delete, summary).await?;

        if !summary.failures.is_empty() {
            warn!(identity = %self.config.name, failed = summary.failures.len(), "sync finished with item failures");
        }
        Ok(())
    }

    pub async fn stats(&self) -> Result<StoreStats, SyncError> {
        Ok(self.store.stats().await?)
    }

    pub async fn ignore_set(&self, remote_ids: &[String]) -> Result<usize, SyncError> {
        Ok(IgnoreManager::new(&self.store).set(remote_ids).await?)
    }

    pub async fn ignore_reset(&self) -> Result<usize, SyncError> {
        Ok(IgnoreManager::new(&self.store).reset().await?)
    }
}
