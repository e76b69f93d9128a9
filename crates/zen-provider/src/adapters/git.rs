use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use zen_core::types::{ProviderInfo, ProviderKind};
use zen_core::{Context, ExecResult, Result, ZenError};

use crate::discovery::{self, Discovery, DEFAULT_VERSION_TIMEOUT};
use crate::executor::{ExecOptions, Executor};
use crate::provider::{CliProvider, Params, Provider};
use crate::stream::OutputStream;

pub const NAME: &str = "git";
pub const MIN_VERSION: &str = "2.0.0";

pub const OPERATIONS: &[&str] = &[
    "git.status",
    "git.branch",
    "git.log",
    "git.remote",
    "git.version",
    "git.diff",
];

/// Read-only wrapper around the `git` binary.
#[derive(Debug, Clone)]
pub struct GitProvider {
    binary: PathBuf,
    work_dir: Option<PathBuf>,
    env: BTreeMap<String, String>,
    executor: Executor,
}

impl GitProvider {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            work_dir: None,
            env: BTreeMap::new(),
            executor: Executor::with_allowlist(["HOME"]),
        }
    }

    /// Locate `git` through `discovery`.
    pub fn discover(discovery: &Discovery) -> Result<Self> {
        Ok(Self::new(discovery.find_binary(NAME)?))
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    fn options(&self) -> ExecOptions {
        ExecOptions {
            work_dir: self.work_dir.clone(),
            env: self.env.clone(),
            allow_env: Vec::new(),
        }
    }
}

#[async_trait]
impl Provider for GitProvider {
    fn name(&self) -> &str {
        NAME
    }

    async fn info(&self, ctx: &Context) -> Result<ProviderInfo> {
        let mut info = ProviderInfo::new(NAME, ProviderKind::Cli).with_capabilities(OPERATIONS);
        info.binary_path = Some(self.binary.clone());
        let probe = ctx.with_timeout(DEFAULT_VERSION_TIMEOUT);
        let res = match self
            .executor
            .execute(&probe, &self.binary, &["--version".to_string()], &self.options())
            .await
        {
            Ok(r) => r,
            Err(e) if e.is(zen_core::ErrorCode::Canceled) => return Err(e),
            Err(e) => return Ok(info.unavailable(e.to_string())),
        };
        match discovery::parse_version(&res.stdout) {
            Ok(v) => {
                let ok = discovery::validate_version(&v, MIN_VERSION)?;
                info.version = Some(v.clone());
                if ok {
                    info.available = true;
                } else {
                    info = info.unavailable(format!("version {v} is below required {MIN_VERSION}"));
                }
            }
            Err(_) => info = info.unavailable("cannot determine git version"),
        }
        Ok(info)
    }

    async fn execute(&self, ctx: &Context, op: &str, params: &Params) -> Result<ExecResult> {
        let args = self.exec_args_for(op, params)?;
        self.executor
            .execute(ctx, &self.binary, &args, &self.options())
            .await
            .map_err(|e| e.with_provider(NAME).with_operation(op))
    }

    async fn stream(&self, ctx: &Context, op: &str, params: &Params) -> Result<OutputStream> {
        let args = self.exec_args_for(op, params)?;
        self.executor
            .stream(ctx, &self.binary, &args, &self.options())
            .await
            .map_err(|e| e.with_provider(NAME).with_operation(op))
    }
}

impl CliProvider for GitProvider {
    fn binary_path(&self) -> &Path {
        &self.binary
    }

    fn work_dir(&self) -> Option<&Path> {
        self.work_dir.as_deref()
    }

    fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    fn exec_args_for(&self, op: &str, params: &Params) -> Result<Vec<String>> {
        let mut args: Vec<String> = match op {
            "git.status" => vec!["status".into(), "--porcelain".into()],
            "git.branch" => vec!["rev-parse".into(), "--abbrev-ref".into(), "HEAD".into()],
            "git.log" => {
                let limit = params.get("limit").map(String::as_str).unwrap_or("10");
                if limit.parse::<u32>().is_err() {
                    return Err(ZenError::invalid_operation(format!("invalid limit '{limit}'"))
                        .with_provider(NAME)
                        .with_operation(op));
                }
                vec!["log".into(), "--oneline".into(), "-n".into(), limit.into()]
            }
            "git.remote" => vec!["remote".into(), "-v".into()],
            "git.version" => vec!["--version".into()],
            "git.diff" => vec!["diff".into(), "--stat".into()],
            _ => {
                return Err(ZenError::invalid_operation(format!("unsupported operation '{op}'"))
                    .with_provider(NAME)
                    .with_operation(op))
            }
        };
        if op == "git.diff" {
            if let Some(path) = params.get("path") {
                args.push("--".into());
                args.push(path.clone());
            }
        }
        Ok(args)
    }
}
