//! Binary discovery: PATH lookup, version probing and minimum-version checks.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::debug;

use zen_core::types::{ProviderInfo, ProviderKind};
use zen_core::{Context, ErrorCode, Result, ZenError};

use crate::executor::{ExecOptions, Executor};

pub const DEFAULT_MEMO_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_VERSION_TIMEOUT: Duration = Duration::from_secs(5);

/// Finds binaries and reports whether they are usable.
///
/// Lookups (hits and misses) are memoized per name for `ttl`; a zero TTL
/// disables the memo.
#[derive(Debug)]
pub struct Discovery {
    search_path: Option<OsString>,
    ttl: Duration,
    memo: Mutex<HashMap<String, (Instant, Option<PathBuf>)>>,
    executor: Executor,
}

impl Default for Discovery {
    fn default() -> Self {
        Self::new()
    }
}

impl Discovery {
    /// Search the process `PATH`, memoizing for [`DEFAULT_MEMO_TTL`].
    pub fn new() -> Self {
        Self {
            search_path: None,
            ttl: DEFAULT_MEMO_TTL,
            memo: Mutex::new(HashMap::new()),
            executor: Executor::new(),
        }
    }

    /// Search only `dirs`, in order.
    pub fn with_search_path<I, P>(mut self, dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let dirs: Vec<PathBuf> = dirs.into_iter().map(Into::into).collect();
        self.search_path = std::env::join_paths(dirs).ok();
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Absolute path of `name`, or `not_found`.
    pub fn find_binary(&self, name: &str) -> Result<PathBuf> {
        if self.ttl > Duration::ZERO {
            let memo = self.memo.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((at, found)) = memo.get(name) {
                if at.elapsed() < self.ttl {
                    return found.clone().ok_or_else(|| not_installed(name));
                }
            }
        }

        let found = self.lookup(name)?;
        if self.ttl > Duration::ZERO {
            self.memo
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(name.to_string(), (Instant::now(), found.clone()));
        }
        found.ok_or_else(|| not_installed(name))
    }

    fn lookup(&self, name: &str) -> Result<Option<PathBuf>> {
        let search = self
            .search_path
            .clone()
            .or_else(|| std::env::var_os("PATH"))
            .unwrap_or_default();
        let cwd = std::env::current_dir()?;
        match which::which_in(name, Some(search), cwd) {
            Ok(path) => {
                debug!(binary = name, path = %path.display(), "found binary");
                Ok(Some(path))
            }
            Err(which::Error::CannotFindBinaryPath) => Ok(None),
            Err(e) => Err(ZenError::new(
                ErrorCode::ExecutionFailed,
                format!("lookup of '{name}' failed: {e}"),
            )),
        }
    }

    /// Run `path version_args...` and parse a version out of its combined
    /// output.
    pub async fn get_version(
        &self,
        ctx: &Context,
        path: &Path,
        version_args: &[&str],
        timeout: Duration,
    ) -> Result<String> {
        let ctx = ctx.with_timeout(timeout);
        let args: Vec<String> = version_args.iter().map(|s| s.to_string()).collect();
        let res = self
            .executor
            .execute(&ctx, path, &args, &ExecOptions::default())
            .await?;
        let combined = format!("{}\n{}", res.stdout, res.stderr);
        parse_version(&combined)
    }

    /// Compose lookup, version probe and minimum-version check.
    ///
    /// A missing binary, an unparseable version or a version below
    /// `min_version` yields `available = false` with a reason. Only
    /// cancellation and unexpected lookup failures are errors.
    pub async fn discover(
        &self,
        ctx: &Context,
        name: &str,
        version_args: &[&str],
        min_version: Option<&str>,
    ) -> Result<ProviderInfo> {
        let info = ProviderInfo::new(name, ProviderKind::Cli);
        let path = match self.find_binary(name) {
            Ok(p) => p,
            Err(e) if e.is(ErrorCode::NotFound) => {
                return Ok(info.unavailable(format!("'{name}' not found in PATH")));
            }
            Err(e) => return Err(e),
        };
        let mut info = ProviderInfo {
            binary_path: Some(path.clone()),
            ..info
        };

        let version = match self
            .get_version(ctx, &path, version_args, DEFAULT_VERSION_TIMEOUT)
            .await
        {
            Ok(v) => Some(v),
            Err(e) if e.is(ErrorCode::Canceled) => return Err(e),
            Err(e) => {
                debug!(binary = name, error = %e, "version probe failed");
                None
            }
        };
        info.version = version.clone();

        if let Some(min) = min_version {
            let Some(current) = version else {
                return Ok(info.unavailable(format!("cannot determine version of '{name}'")));
            };
            if !validate_version(&current, min)? {
                return Ok(info.unavailable(format!("version {current} is below required {min}")));
            }
        }
        info.available = true;
        Ok(info)
    }

    /// Forget memoized lookups.
    pub fn clear(&self) {
        self.memo.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

fn not_installed(name: &str) -> ZenError {
    ZenError::not_found(format!("binary '{name}' not found")).retryable(false)
}

// ---------------------------------------------------------------------------
// Version parsing
// ---------------------------------------------------------------------------

fn version_patterns() -> &'static [Regex; 3] {
    static PATTERNS: OnceLock<[Regex; 3]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            Regex::new(r"v?\d+\.\d+\.\d+(-[0-9A-Za-z.-]+)?").expect("valid regex"),
            Regex::new(r"v?\d+\.\d+").expect("valid regex"),
            Regex::new(r"v?\d+").expect("valid regex"),
        ]
    })
}

/// First version-looking token in `output`, without a leading `v`.
/// Pre-release text is kept (`1.2.3-beta.1`).
pub fn parse_version(output: &str) -> Result<String> {
    for re in version_patterns() {
        if let Some(m) = re.find(output) {
            return Ok(m.as_str().trim_start_matches('v').to_string());
        }
    }
    Err(ZenError::parse(format!(
        "no version found in '{}'",
        output.trim()
    )))
}

fn numeric_parts(version: &str) -> Result<Vec<u64>> {
    let canonical = parse_version(version)?;
    let core = canonical
        .split(['-', '+'])
        .next()
        .unwrap_or(canonical.as_str());
    core.split('.')
        .map(|p| {
            p.parse::<u64>()
                .map_err(|_| ZenError::parse(format!("invalid version component '{p}'")))
        })
        .collect()
}

/// True when `current >= required`, comparing numeric parts left to right.
/// Pre-release text is ignored; a part missing from `current` compares as
/// less than the corresponding part of `required`.
pub fn validate_version(current: &str, required: &str) -> Result<bool> {
    let cur = numeric_parts(current)?;
    let req = numeric_parts(required)?;
    for (i, r) in req.iter().enumerate() {
        let Some(c) = cur.get(i) else {
            return Ok(false);
        };
        if c > r {
            return Ok(true);
        }
        if c < r {
            return Ok(false);
        }
    }
    Ok(true)
}
