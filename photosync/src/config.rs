use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::sync::albums::LinkMode;
use crate::sync::backoff::RetryPolicy;

const DEFAULT_CONCURRENCY: usize = 4;
const DEFAULT_MAX_FAILURES: u32 = 5;
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_BASE_MS: u64 = 500;
const DEFAULT_RETRY_MAX_MS: u64 = 30_000;
const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 6 * 60 * 60;
const SYSTEM_CONFIG: &str = "/etc/photosync/config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("no configuration file found (looked in {0:?})")]
    NotFound(Vec<PathBuf>),
    #[error("configuration defines no identities")]
    NoIdentities,
    #[error("identity {0} has no data_dir")]
    MissingDataDir(String),
    #[error("unknown identity: {0}")]
    UnknownIdentity(String),
}

/// Settings of one independently synced identity.
///
/// Passed explicitly into every component; nothing reads global state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityConfig {
    pub name: String,
    pub data_dir: PathBuf,
    pub concurrency: usize,
    pub link_mode: LinkMode,
    pub max_failures: u32,
    pub retry_attempts: u32,
    pub retry_base: Duration,
    pub retry_max: Duration,
    pub lock_timeout: Duration,
}

impl IdentityConfig {
    pub fn new(name: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            data_dir: data_dir.into(),
            concurrency: DEFAULT_CONCURRENCY,
            link_mode: LinkMode::default(),
            max_failures: DEFAULT_MAX_FAILURES,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_base: Duration::from_millis(DEFAULT_RETRY_BASE_MS),
            retry_max: Duration::from_millis(DEFAULT_RETRY_MAX_MS),
            lock_timeout: Duration::from_secs(DEFAULT_LOCK_TIMEOUT_SECS),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_base, self.retry_max, self.retry_attempts)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct Settings {
    data_dir: Option<String>,
    concurrency: Option<usize>,
    link_mode: Option<LinkMode>,
    max_failures: Option<u32>,
    retry_attempts: Option<u32>,
    retry_base_ms: Option<u64>,
    retry_max_ms: Option<u64>,
    lock_timeout_secs: Option<u64>,
}

impl Settings {
    fn or(self, fallback: &Settings) -> Settings {
        Settings {
            data_dir: self.data_dir,
            concurrency: self.concurrency.or(fallback.concurrency),
            link_mode: self.link_mode.or(fallback.link_mode),
            max_failures: self.max_failures.or(fallback.max_failures),
            retry_attempts: self.retry_attempts.or(fallback.retry_attempts),
            retry_base_ms: self.retry_base_ms.or(fallback.retry_base_ms),
            retry_max_ms: self.retry_max_ms.or(fallback.retry_max_ms),
            lock_timeout_secs: self.lock_timeout_secs.or(fallback.lock_timeout_secs),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    defaults: Settings,
    #[serde(default)]
    identities: BTreeMap<String, Settings>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub identities: Vec<IdentityConfig>,
}

impl AppConfig {
    /// Parses a configuration document.
    ///
    /// An identity without `data_dir` lives in `<defaults.data_dir>/<name>`.
    pub fn parse(text: &str, source: &Path, home: Option<&Path>) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(text).map_err(|source_err| ConfigError::Parse {
            path: source.to_path_buf(),
            source: source_err,
        })?;
        if raw.identities.is_empty() {
            return Err(ConfigError::NoIdentities);
        }

        let mut identities = Vec::with_capacity(raw.identities.len());
        for (name, settings) in raw.identities {
            let settings = settings.or(&raw.defaults);
            let data_dir = match (&settings.data_dir, &raw.defaults.data_dir) {
                (Some(dir), _) => expand_with_home(dir, home),
                (None, Some(root)) => expand_with_home(root, home).join(&name),
                (None, None) => return Err(ConfigError::MissingDataDir(name)),
            };

            let mut identity = IdentityConfig::new(name, data_dir);
            if let Some(value) = settings.concurrency.filter(|v| *v > 0) {
                identity.concurrency = value;
            }
            if let Some(value) = settings.link_mode {
                identity.link_mode = value;
            }
            if let Some(value) = settings.max_failures.filter(|v| *v > 0) {
                identity.max_failures = value;
            }
            if let Some(value) = settings.retry_attempts.filter(|v| *v > 0) {
                identity.retry_attempts = value;
            }
            if let Some(value) = settings.retry_base_ms {
                identity.retry_base = Duration::from_millis(value);
            }
            if let Some(value) = settings.retry_max_ms {
                identity.retry_max = Duration::from_millis(value);
            }
            if let Some(value) = settings.lock_timeout_secs.filter(|v| *v > 0) {
                identity.lock_timeout = Duration::from_secs(value);
            }
            identities.push(identity);
        }

        Ok(Self { identities })
    }

    /// Loads `path`, or the first existing file of the default search list,
    /// then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let home = dirs::home_dir();
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let candidates = search_paths();
                candidates
                    .iter()
                    .find(|candidate| candidate.is_file())
                    .cloned()
                    .ok_or(ConfigError::NotFound(candidates))?
            }
        };
        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;

        let mut config = Self::parse(&text, &path, home.as_deref())?;
        config.apply_overrides(
            read_usize_env("PHOTOSYNC_CONCURRENCY"),
            std::env::var("PHOTOSYNC_LINK_MODE")
                .ok()
                .and_then(|value| value.parse().ok()),
        );
        Ok(config)
    }

    pub fn apply_overrides(&mut self, concurrency: Option<usize>, link_mode: Option<LinkMode>) {
        for identity in &mut self.identities {
            if let Some(concurrency) = concurrency {
                identity.concurrency = concurrency;
            }
            if let Some(link_mode) = link_mode {
                identity.link_mode = link_mode;
            }
        }
    }

    /// All identities, or the one named.
    pub fn select(&self, name: Option<&str>) -> Result<Vec<IdentityConfig>, ConfigError> {
        match name {
            None => Ok(self.identities.clone()),
            Some(name) => self
                .identities
                .iter()
                .find(|identity| identity.name == name)
                .cloned()
                .map(|identity| vec![identity])
                .ok_or_else(|| ConfigError::UnknownIdentity(name.to_string())),
        }
    }
}

pub fn search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(SYSTEM_CONFIG)];
    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("photosync").join("config.toml"));
    }
    paths
}

pub fn expand_with_home(value: &str, home: Option<&Path>) -> PathBuf {
    match home {
        Some(home) if value == "~" => home.to_path_buf(),
        Some(home) => match value.strip_prefix("~/") {
            Some(rest) => home.join(rest),
            None => PathBuf::from(value),
        },
        None => PathBuf::from(value),
    }
}

fn read_usize_env(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .filter(|value| *value > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[defaults]
data_dir = "~/Pictures/photosync"
concurrency = 6

[identities.personal]
link_mode = "hardlink"

[identities.work]
data_dir = "/srv/work-photos"
concurrency = 2
retry_attempts = 5
"#;

    fn parse(text: &str) -> Result<AppConfig, ConfigError> {
        AppConfig::parse(text, Path::new("config.toml"), Some(Path::new("/home/u")))
    }

    #[test]
    fn identities_inherit_defaults() {
        let config = parse(SAMPLE).unwrap();
        assert_eq!(config.identities.len(), 2);

        let personal = &config.identities[0];
        assert_eq!(personal.name, "personal");
        assert_eq!(
            personal.data_dir,
            PathBuf::from("/home/u/Pictures/photosync/personal")
        );
        assert_eq!(personal.concurrency, 6);
        assert_eq!(personal.link_mode, LinkMode::Hardlink);

        let work = &config.identities[1];
        assert_eq!(work.data_dir, PathBuf::from("/srv/work-photos"));
        assert_eq!(work.concurrency, 2);
        assert_eq!(work.retry_attempts, 5);
        assert_eq!(work.link_mode, LinkMode::Symlink);
        assert_eq!(work.max_failures, DEFAULT_MAX_FAILURES);
    }

    #[test]
    fn identity_without_any_data_dir_is_rejected() {
        let err = parse("[identities.a]\nconcurrency = 1\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingDataDir(name) if name == "a"));
    }

    #[test]
    fn empty_config_is_rejected() {
        assert!(matches!(parse(""), Err(ConfigError::NoIdentities)));
        assert!(matches!(
            parse("[identities.a]\ndata_dir = \"/x\"\nbogus = 1\n"),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn select_filters_by_name() {
        let config = parse(SAMPLE).unwrap();
        assert_eq!(config.select(None).unwrap().len(), 2);
        assert_eq!(config.select(Some("work")).unwrap()[0].name, "work");
        assert!(matches!(
            config.select(Some("nope")),
            Err(ConfigError::UnknownIdentity(_))
        ));
    }

    #[test]
    fn overrides_apply_to_every_identity() {
        let mut config = parse(SAMPLE).unwrap();
        config.apply_overrides(Some(9), Some(LinkMode::Copy));
        assert!(
            config
                .identities
                .iter()
                .all(|i| i.concurrency == 9 && i.link_mode == LinkMode::Copy)
        );
    }

    #[test]
    fn load_reads_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[identities.main]\ndata_dir = \"/data/main\"\n").unwrap();
        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.identities[0].data_dir, PathBuf::from("/data/main"));
    }

    #[test]
    fn expands_home_prefix() {
        let home = Path::new("/home/u");
        assert_eq!(expand_with_home("~", Some(home)), PathBuf::from("/home/u"));
        assert_eq!(
            expand_with_home("~/a/b", Some(home)),
            PathBuf::from("/home/u/a/b")
        );
        assert_eq!(expand_with_home("~/a", None), PathBuf::from("~/a"));
        assert_eq!(expand_with_home("/abs", Some(home)), PathBuf::from("/abs"));
    }
}
