use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const ZEN_DIR: &str = ".zen";
pub const CONFIG_FILE: &str = ".zen/config.yaml";
pub const TASKS_DIR: &str = ".zen/tasks";
pub const DEFAULT_CACHE_DIR: &str = ".zen/cache";

/// Sub-directory of the cache base that holds sync records.
pub const SYNC_RECORDS_DIR: &str = "sync";

pub const CACHE_METADATA_DIR: &str = "metadata";
pub const CACHE_INDEX_FILE: &str = "index.json";
pub const CACHE_DATA_DIR: &str = "data";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn zen_dir(root: &Path) -> PathBuf {
    root.join(ZEN_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn tasks_dir(root: &Path) -> PathBuf {
    root.join(TASKS_DIR)
}

pub fn cache_index_path(base: &Path) -> PathBuf {
    base.join(CACHE_METADATA_DIR).join(CACHE_INDEX_FILE)
}

pub fn cache_data_dir(base: &Path) -> PathBuf {
    base.join(CACHE_DATA_DIR)
}

/// Expand a leading `~` to the user's home directory. Paths without a
/// leading tilde, or when no home directory can be determined, are returned
/// unchanged.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let Some(s) = path.to_str() else {
        return path.to_path_buf();
    };
    if s == "~" || s.starts_with("~/") {
        if let Some(home) = home::home_dir() {
            return if s == "~" {
                home
            } else {
                home.join(&s[2..])
            };
        }
    }
    path.to_path_buf()
}

/// Resolve a configured path: expand `~`, then anchor relative paths at
/// `root`.
pub fn resolve_under(root: &Path, configured: &Path) -> PathBuf {
    let expanded = expand_tilde(configured);
    if expanded.is_absolute() {
        expanded
    } else {
        root.join(expanded)
    }
}

// ---------------------------------------------------------------------------
// Key sanitization
// ---------------------------------------------------------------------------

const UNSAFE_KEY_CHARS: &[char] = &['/', ':', '*', '?', '"', '<', '>', '|'];

/// Make an opaque cache key usable as a file name.
pub fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| if UNSAFE_KEY_CHARS.contains(&c) { '_' } else { c })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_reserved_characters() {
        assert_eq!(sanitize_key(r#"a/b:c*d?e"f<g>h|i"#), "a_b_c_d_e_f_g_h_i");
        assert_eq!(sanitize_key("plain-key.1"), "plain-key.1");
    }

    #[test]
    fn tilde_expands_to_home() {
        let Some(home) = home::home_dir() else {
            return;
        };
        assert_eq!(expand_tilde(Path::new("~/cache")), home.join("cache"));
        assert_eq!(expand_tilde(Path::new("~")), home);
        assert_eq!(expand_tilde(Path::new("/abs/~x")), PathBuf::from("/abs/~x"));
    }

    #[test]
    fn relative_paths_anchor_at_root() {
        let root = Path::new("/tmp/proj");
        assert_eq!(
            resolve_under(root, Path::new(".zen/cache")),
            PathBuf::from("/tmp/proj/.zen/cache")
        );
        assert_eq!(
            resolve_under(root, Path::new("/var/cache/zen")),
            PathBuf::from("/var/cache/zen")
        );
    }

    #[test]
    fn path_helpers() {
        let root = Path::new("/tmp/proj");
        assert_eq!(
            config_path(root),
            PathBuf::from("/tmp/proj/.zen/config.yaml")
        );
        assert_eq!(
            cache_index_path(Path::new("/c")),
            PathBuf::from("/c/metadata/index.json")
        );
    }
}
