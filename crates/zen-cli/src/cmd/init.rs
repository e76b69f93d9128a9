use anyhow::Context;
use std::path::Path;

use zen_core::config::Config;
use zen_core::{io, paths};

/// Ignore rules written into `.zen/` so caches never get committed.
const GITIGNORE: &str = "cache/\n";

pub fn run(root: &Path) -> anyhow::Result<()> {
    println!("Initializing zen in: {}", root.display());

    for dir in [paths::ZEN_DIR, paths::TASKS_DIR] {
        let p = root.join(dir);
        io::ensure_dir(&p).with_context(|| format!("failed to create {}", p.display()))?;
    }

    let config_path = paths::config_path(root);
    let config = if config_path.exists() {
        println!("  exists:  {}", paths::CONFIG_FILE);
        Config::load(root).context("failed to load config.yaml")?
    } else {
        let cfg = Config::default();
        cfg.save(root).context("failed to write config.yaml")?;
        println!("  created: {}", paths::CONFIG_FILE);
        cfg
    };

    let cache = config.cache.resolved_path(root);
    let cache_existed = cache.is_dir();
    io::ensure_dir(&cache).with_context(|| format!("failed to create {}", cache.display()))?;
    let label = cache
        .strip_prefix(root)
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| cache.display().to_string());
    if cache_existed {
        println!("  exists:  {label}");
    } else {
        println!("  created: {label}");
    }

    let ignore = paths::zen_dir(root).join(".gitignore");
    if io::write_if_missing(&ignore, GITIGNORE.as_bytes())? {
        println!("  created: {}/.gitignore", paths::ZEN_DIR);
    }

    println!("\nNext: set integration.task_system in {}", paths::CONFIG_FILE);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        run(dir.path()).unwrap();
        assert!(paths::config_path(dir.path()).is_file());
        assert!(paths::tasks_dir(dir.path()).is_dir());
        assert!(dir.path().join(paths::DEFAULT_CACHE_DIR).is_dir());

        std::fs::write(
            paths::config_path(dir.path()),
            "log_level: debug\nintegration:\n  task_system: jira\n",
        )
        .unwrap();
        run(dir.path()).unwrap();
        let cfg = Config::load(dir.path()).unwrap();
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.integration.task_system, "jira");
    }
}
