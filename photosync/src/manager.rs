use std::fmt;
use std::sync::Arc;

use anyhow::{Context, bail};
use async_trait::async_trait;
use futures_util::future::join_all;
use photosync_remote::RemoteCatalog;
use tracing::{error, info};

use crate::config::{AppConfig, IdentityConfig};
use crate::lock::{PidFileLock, RunLock};
use crate::sync::indexer::IndexOptions;
use crate::sync::{IndexStore, RunSummary, StoreStats, SyncEngine, SyncOptions};

/// Supplies the remote catalog client for an identity.
#[async_trait]
pub trait CatalogFactory: Send + Sync {
    async fn catalog(&self, identity: &IdentityConfig) -> anyhow::Result<Arc<dyn RemoteCatalog>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Sync(SyncOptions),
    Index(IndexOptions),
    Download,
    Materialize,
    DeleteObsolete { force: bool },
    IgnoreSet(Vec<String>),
    IgnoreReset,
    Stats,
}

impl Action {
    fn needs_catalog(&self) -> bool {
        matches!(self, Action::Sync(_) | Action::Index(_) | Action::Download)
    }

    /// Read-only actions may run next to a sync of the same identity.
    fn needs_lock(&self) -> bool {
        !matches!(self, Action::Stats)
    }

    fn name(&self) -> &'static str {
        match self {
            Action::Sync(_) => "sync",
            Action::Index(_) => "index",
            Action::Download => "download",
            Action::Materialize => "materialize",
            Action::DeleteObsolete { .. } => "delete",
            Action::IgnoreSet(_) => "ignore-set",
            Action::IgnoreReset => "ignore-reset",
            Action::Stats => "stats",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutput {
    Summary(RunSummary),
    Stats(StoreStats),
    /// Ignore entries added or removed.
    Ignore(usize),
}

impl fmt::Display for ActionOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionOutput::Summary(summary) => write!(f, "{summary}"),
            ActionOutput::Stats(stats) => write!(f, "{stats}"),
            ActionOutput::Ignore(changed) => write!(f, "{changed} ignore entries changed"),
        }
    }
}

#[derive(Debug)]
pub struct IdentityOutcome {
    pub identity: String,
    pub result: anyhow::Result<ActionOutput>,
}

/// Runs one action across identities in parallel. Each identity has its own
/// lock, store and data directory, so one failing never affects the others.
pub struct Manager {
    config: AppConfig,
    lock: Arc<dyn RunLock>,
    catalogs: Option<Arc<dyn CatalogFactory>>,
}

impl Manager {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            lock: Arc::new(PidFileLock),
            catalogs: None,
        }
    }

    pub fn with_lock(mut self, lock: Arc<dyn RunLock>) -> Self {
        self.lock = lock;
        self
    }

    pub fn with_catalogs(mut self, catalogs: Arc<dyn CatalogFactory>) -> Self {
        self.catalogs = Some(catalogs);
        self
    }

    pub async fn run(
        &self,
        selected: Option<&str>,
        action: &Action,
    ) -> anyhow::Result<Vec<IdentityOutcome>> {
        let identities = self.config.select(selected)?;
        let runs = identities.into_iter().map(|identity| async move {
            let result = self.run_identity(&identity, action).await;
            match &result {
                Ok(output) => info!(identity = %identity.name, action = action.name(), "{output}"),
                Err(err) => {
                    let message = format!("{err:#}");
                    error!(identity = %identity.name, action = action.name(), error = %message, "identity run failed");
                }
            }
            IdentityOutcome {
                identity: identity.name,
                result,
            }
        });
        Ok(join_all(runs).await)
    }

    async fn run_identity(
        &self,
        identity: &IdentityConfig,
        action: &Action,
    ) -> anyhow::Result<ActionOutput> {
        let _guard = if action.needs_lock() {
            Some(self.lock.acquire(identity)?)
        } else {
            None
        };

        let store = IndexStore::open(&identity.data_dir)
            .await
            .with_context(|| format!("failed to open store in {}", identity.data_dir.display()))?;
        let mut engine = SyncEngine::new(identity.clone(), store.clone());
        if action.needs_catalog() {
            let Some(catalogs) = &self.catalogs else {
                bail!("action {} needs a remote catalog, none is configured", action.name());
            };
            let catalog = catalogs
                .catalog(identity)
                .await
                .context("failed to build remote catalog")?;
            engine = engine.with_catalog(catalog);
        }

        let output = run_action(&engine, action).await;
        store.close().await;
        output
    }
}

async fn run_action(engine: &SyncEngine, action: &Action) -> anyhow::Result<ActionOutput> {
    let mut summary = RunSummary::default();
    match action {
        Action::Sync(options) => engine.sync(options, &mut summary).await?,
        Action::Index(options) => engine.index(options, &mut summary).await?,
        Action::Download => engine.download(&mut summary).await?,
        Action::Materialize => engine.materialize_albums(&mut summary).await?,
        Action::DeleteObsolete { force } => engine.delete_obsolete(*force, &mut summary).await?,
        Action::IgnoreSet(ids) => return Ok(ActionOutput::Ignore(engine.ignore_set(ids).await?)),
        Action::IgnoreReset => return Ok(ActionOutput::Ignore(engine.ignore_reset().await?)),
        Action::Stats => return Ok(ActionOutput::Stats(engine.stats().await?)),
    }
    Ok(ActionOutput::Summary(summary))
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use tempfile::tempdir;

    use super::*;
    use crate::lock::LockError;

    fn config(root: &Path, names: &[&str]) -> AppConfig {
        AppConfig {
            identities: names
                .iter()
                .map(|name| IdentityConfig::new(*name, root.join(name)))
                .collect(),
        }
    }

    #[tokio::test]
    async fn local_actions_run_for_every_identity() {
        let dir = tempdir().unwrap();
        let manager = Manager::new(config(dir.path(), &["a", "b"]));

        let outcomes = manager
            .run(None, &Action::IgnoreSet(vec!["x".into()]))
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 2);
        for outcome in &outcomes {
            assert!(matches!(outcome.result, Ok(ActionOutput::Ignore(1))));
        }

        let outcomes = manager.run(Some("b"), &Action::Stats).await.unwrap();
        match &outcomes[0].result {
            Ok(ActionOutput::Stats(stats)) => assert_eq!(stats.ignore_entries, 1),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(!dir.path().join("a").join(crate::lock::LOCK_FILE).exists());
    }

    #[tokio::test]
    async fn one_failing_identity_does_not_stop_the_others() {
        let dir = tempdir().unwrap();
        let manager = Manager::new(config(dir.path(), &["busy", "free"]));
        let _held = PidFileLock
            .acquire(&IdentityConfig::new("busy", dir.path().join("busy")))
            .unwrap();

        let outcomes = manager.run(None, &Action::Materialize).await.unwrap();
        let busy = outcomes.iter().find(|o| o.identity == "busy").unwrap();
        let free = outcomes.iter().find(|o| o.identity == "free").unwrap();
        let err = busy.result.as_ref().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LockError>(),
            Some(LockError::AlreadyRunning { .. })
        ));
        assert!(free.result.is_ok());
    }

    #[tokio::test]
    async fn remote_actions_need_a_catalog_factory() {
        let dir = tempdir().unwrap();
        let manager = Manager::new(config(dir.path(), &["a"]));
        let outcomes = manager.run(None, &Action::Download).await.unwrap();
        assert!(outcomes[0].result.is_err());
        assert!(manager.run(Some("nope"), &Action::Stats).await.is_err());
    }
}
