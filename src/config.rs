use std::{collections::HashMap, path::PathBuf};

use anyhow::bail;
use config::{Config, ConfigError, Environment, File};
use log::{debug, trace};
use serde::Deserialize;

/// Settings for one fetcher instance. There are no ambient globals:
/// everything that influences fetching is plumbed through this record.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Root directory holding the bare mirror repositories and the store.
    pub cache_dir: PathBuf,
    /// Seconds a cached ref or HEAD resolution stays fresh before
    /// revalidation against the remote.
    pub cache_ttl: u64,
    /// Parallelism forwarded to child `git` via `--jobs`.
    pub max_fetch_jobs: u32,
    /// Whether fetching a dirty working tree is an error or a warning.
    pub allow_dirty: bool,
    pub warn_dirty: bool,
}

pub const DEFAULT_CACHE_TTL: u64 = 3600;

impl FetchConfig {
    pub fn load() -> anyhow::Result<Self> {
        let raw = RawConfig::load(config_dir(), None)?;

        let config = Self {
            cache_dir: match raw.cache.dir {
                Some(dir) => dir,
                None => default_cache_dir()?,
            },
            cache_ttl: raw.cache.ttl.unwrap_or(DEFAULT_CACHE_TTL),
            max_fetch_jobs: raw.fetch.jobs.unwrap_or(1),
            allow_dirty: raw.fetch.allow_dirty.unwrap_or(true),
            warn_dirty: raw.fetch.warn_dirty.unwrap_or(true),
        };
        trace!("loaded configuration: {:?}", config);

        Ok(config)
    }

    /// Value for `git fetch --jobs`; git rejects 0.
    pub fn num_jobs(&self) -> String {
        self.max_fetch_jobs.max(1).to_string()
    }
}

#[derive(Default, Debug, Deserialize, PartialEq, Eq)]
struct RawConfig {
    #[serde(default)]
    cache: CacheSection,
    #[serde(default)]
    fetch: FetchSection,
}

#[derive(Default, Debug, Deserialize, PartialEq, Eq)]
struct CacheSection {
    dir: Option<PathBuf>,
    ttl: Option<u64>,
}

#[derive(Default, Debug, Deserialize, PartialEq, Eq)]
struct FetchSection {
    jobs: Option<u32>,
    allow_dirty: Option<bool>,
    warn_dirty: Option<bool>,
}

impl RawConfig {
    fn load(
        config_dir: Option<PathBuf>,
        env_override: Option<HashMap<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        if let Some(mut path) = config_dir {
            path.push("config.toml");
            debug!("loading configuration from {}", path.display());
            builder = builder.add_source(File::from(path).required(false));
        }

        builder
            .add_source(
                Environment::with_prefix("GITFETCH")
                    .separator("_")
                    .source(env_override),
            )
            .build()?
            .try_deserialize()
    }
}

fn config_dir() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("GITFETCH_CONFIG_DIR") {
        return Some(PathBuf::from(path));
    }
    if let Ok(path) = std::env::var("XDG_CONFIG_HOME") {
        let mut path = PathBuf::from(path);
        path.push("gitfetch");
        return Some(path);
    }
    if let Some(mut path) = home::home_dir() {
        path.push(".config");
        path.push("gitfetch");
        return Some(path);
    }
    None
}

fn default_cache_dir() -> anyhow::Result<PathBuf> {
    if let Some(mut path) = home::home_dir() {
        path.push(".gitfetch");
        path.push("cache");
        return Ok(path);
    }
    bail!("could not find home dir; please define the $HOME env variable")
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn load_empty() {
        let env = HashMap::new();
        let config = RawConfig::load(None, Some(env)).unwrap();
        assert_eq!(config, RawConfig::default());
    }

    #[test]
    fn load_environment() {
        let env = HashMap::from([
            ("GITFETCH_CACHE_DIR".to_owned(), "/cache".to_owned()),
            ("GITFETCH_CACHE_TTL".to_owned(), "60".to_owned()),
            ("GITFETCH_FETCH_JOBS".to_owned(), "4".to_owned()),
        ]);
        let config = RawConfig::load(None, Some(env)).unwrap();
        assert_eq!(
            config,
            RawConfig {
                cache: CacheSection {
                    dir: Some("/cache".into()),
                    ttl: Some(60),
                },
                fetch: FetchSection {
                    jobs: Some(4),
                    ..Default::default()
                },
            }
        );
    }
}
