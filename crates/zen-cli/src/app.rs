use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use serde_json::Value;
use tracing::warn;

use zen_core::cache::{CacheOptions, FsCache};
use zen_core::config::Config;
use zen_core::store::FileTaskStore;
use zen_core::Context;
use zen_sync::SyncEngine;

use crate::output::OutputFormat;
use crate::providers;

/// Everything a command needs: where the workspace is, the effective
/// config, how to render, and the root cancellation context.
pub struct App {
    pub root: PathBuf,
    pub config: Config,
    pub format: OutputFormat,
    pub ctx: Context,
}

impl App {
    pub fn cache_dir(&self) -> PathBuf {
        self.config.cache.resolved_path(&self.root)
    }

    /// The general-purpose cache at the configured base path.
    pub fn open_cache(&self) -> anyhow::Result<FsCache<Value>> {
        let opts = CacheOptions::new(self.cache_dir())
            .size_limit_mb(self.config.cache.size_limit_mb)
            .default_ttl(self.config.cache.default_ttl());
        FsCache::json(opts)
            .with_context(|| format!("cannot open cache at {}", self.cache_dir().display()))
    }

    /// Open the sync engine over the workspace's task store, without
    /// providers. Enough for record and conflict bookkeeping.
    pub fn open_engine(&self) -> anyhow::Result<SyncEngine> {
        let store = Arc::new(FileTaskStore::new(&self.root));
        SyncEngine::new(self.config.integration.clone(), &self.cache_dir(), store)
            .context("cannot open sync engine")
    }

    /// [`App::open_engine`] with every buildable provider registered.
    pub fn connect_engine(&self) -> anyhow::Result<Arc<SyncEngine>> {
        let engine = self.open_engine()?;
        let skipped = providers::register_all(&engine, &self.config.integration, &self.root);
        for (name, err) in skipped {
            let task_system = name == self.config.integration.task_system;
            warn!(provider = %name, task_system, error = %err, "provider skipped");
        }
        Ok(Arc::new(engine))
    }
}
