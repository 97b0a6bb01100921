use tracing::info;

use super::store::{IndexStore, StoreError};

/// Maintains the per-identity set of remote ids excluded from sync.
///
/// Ignoring only changes what later phases select; files already on disk are
/// reclaimed by the obsolete reconciler.
pub struct IgnoreManager<'a> {
    store: &'a IndexStore,
}

impl<'a> IgnoreManager<'a> {
    pub fn new(store: &'a IndexStore) -> Self {
        Self { store }
    }

    /// Returns how many ids were not ignored before.
    pub async fn set(&self, remote_ids: &[String]) -> Result<usize, StoreError> {
        let ids: Vec<String> = remote_ids
            .iter()
            .map(|id| id.trim())
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect();
        let added = self.store.add_ignored(&ids).await?;
        info!(requested = ids.len(), added, "updated ignore list");
        Ok(added)
    }

    pub async fn reset(&self) -> Result<usize, StoreError> {
        let removed = self.store.clear_ignored().await?;
        info!(removed, "cleared ignore list");
        Ok(removed)
    }

    pub async fn list(&self) -> Result<Vec<String>, StoreError> {
        self.store.list_ignored().await
    }
}
