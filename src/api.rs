use std::{error::Error, path::{Path, PathBuf}};

use crate::accessor::InputAccessor;
use crate::config::FetchConfig;
use crate::fetch::{self, FetchError};
use crate::input::Input;
use crate::store::LocalStore;

/// The assembled fetcher: configuration plus the store living under
/// the cache root.
pub struct GitFetcher {
    config: FetchConfig,
    store: LocalStore,
}

impl GitFetcher {
    pub fn builder() -> GitFetcherBuilder {
        GitFetcherBuilder::default()
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Materialize the snapshot `input` describes and return an
    /// accessor over it together with the locked input.
    pub fn fetch(&self, input: Input) -> Result<(Box<dyn InputAccessor>, Input), FetchError> {
        fetch::get_accessor(&self.config, &self.store, input)
    }

    /// `git clone` the input into `dest`.
    pub fn clone_to(&self, input: &Input, dest: &Path) -> Result<(), FetchError> {
        fetch::clone_to(input, dest)
    }

    /// Write a file into a local working tree input and register it
    /// with git, optionally committing.
    pub fn put_file(
        &self,
        input: &Input,
        rel_path: &str,
        contents: &[u8],
        commit_msg: Option<&str>,
    ) -> Result<(), FetchError> {
        fetch::put_file(input, rel_path, contents, commit_msg)
    }
}

#[derive(Default)]
pub struct GitFetcherBuilder {
    cache_directory: Option<PathBuf>,
    cache_ttl: Option<u64>,
    max_fetch_jobs: Option<u32>,
    allow_dirty: Option<bool>,
    warn_dirty: Option<bool>,
}

impl GitFetcherBuilder {
    /// Cache root holding mirrors and the store.
    ///
    /// Defaults to the configured or platform cache directory.
    pub fn cache_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_directory = Some(path.into());
        self
    }

    /// Seconds a cached ref stays fresh before revalidation.
    pub fn cache_ttl(mut self, ttl: u64) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    /// Parallelism forwarded to child `git` processes.
    pub fn max_fetch_jobs(mut self, jobs: u32) -> Self {
        self.max_fetch_jobs = Some(jobs);
        self
    }

    /// Whether a dirty local working tree is fetchable (with a
    /// warning) or an error.
    pub fn allow_dirty(mut self, allow: bool) -> Self {
        self.allow_dirty = Some(allow);
        self
    }

    pub fn warn_dirty(mut self, warn: bool) -> Self {
        self.warn_dirty = Some(warn);
        self
    }

    pub fn try_build(self) -> Result<GitFetcher, Box<dyn Error>> {
        let mut config = FetchConfig::load()?;
        if let Some(dir) = self.cache_directory {
            config.cache_dir = dir;
        }
        if let Some(ttl) = self.cache_ttl {
            config.cache_ttl = ttl;
        }
        if let Some(jobs) = self.max_fetch_jobs {
            config.max_fetch_jobs = jobs;
        }
        if let Some(allow) = self.allow_dirty {
            config.allow_dirty = allow;
        }
        if let Some(warn) = self.warn_dirty {
            config.warn_dirty = warn;
        }

        let store = LocalStore::open(config.cache_dir.join("store"), config.cache_ttl)?;
        Ok(GitFetcher { config, store })
    }
}
