//! GitHub issues as a task system, driven through the `gh` CLI.
//!
//! All issue calls go through `gh api`, so payloads use the REST shape
//! (`number`, `body`, `created_at`, ...). Without an explicit repo the
//! `{owner}/{repo}` placeholders are resolved by `gh` from the work dir.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use zen_core::credentials::Credentials;
use zen_core::mapper::{self, FieldMapping};
use zen_core::types::{
    ExternalTaskData, FieldMap, InternalTaskData, ProviderHealth, ProviderInfo, ProviderKind,
    RateLimitInfo,
};
use zen_core::{Context, ErrorCode, ExecResult, Result, ZenError};

use super::{classify_cli_failure, task_from_payload, to_external, to_internal, value_to_string};
use crate::discovery::{self, Discovery, DEFAULT_VERSION_TIMEOUT};
use crate::executor::{ExecOptions, Executor};
use crate::provider::{require, CliProvider, Params, Provider, TaskProvider};
use crate::stream::OutputStream;

pub const NAME: &str = "github";
pub const BINARY: &str = "gh";

pub const OPERATIONS: &[&str] = &[
    "github.issue.view",
    "github.issue.create",
    "github.issue.edit",
    "github.issue.list",
    "github.auth.status",
    "github.rate_limit",
];

/// Parent variables `gh` needs to find its own config and auth.
const GH_ALLOWLIST: &[&str] = &["HOME", "XDG_CONFIG_HOME", "GH_CONFIG_DIR", "GH_HOST"];

pub struct GithubProvider {
    binary: PathBuf,
    repo: Option<String>,
    work_dir: Option<PathBuf>,
    env: BTreeMap<String, String>,
    mapping: FieldMapping,
    executor: Executor,
}

impl std::fmt::Debug for GithubProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GithubProvider")
            .field("binary", &self.binary)
            .field("repo", &self.repo)
            .field("work_dir", &self.work_dir)
            .finish_non_exhaustive()
    }
}

impl GithubProvider {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            repo: None,
            work_dir: None,
            env: BTreeMap::new(),
            mapping: mapper::get_default_mapping(NAME),
            executor: Executor::with_allowlist(GH_ALLOWLIST.iter().copied()),
        }
    }

    pub fn discover(discovery: &Discovery) -> Result<Self> {
        Ok(Self::new(discovery.find_binary(BINARY)?))
    }

    /// `owner/name`. When unset `gh` infers the repo from the work dir.
    pub fn with_repo(mut self, repo: impl Into<String>) -> Self {
        self.repo = Some(repo.into());
        self
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    /// Pass the token from `creds` to `gh` as `GH_TOKEN`, when one exists.
    pub fn with_credentials(mut self, creds: Arc<dyn Credentials>) -> Self {
        if let Ok(token) = creds.get(NAME) {
            self.env.insert("GH_TOKEN".into(), token);
        }
        self
    }

    /// Replace the default mapping. Invalid mappings are rejected.
    pub fn with_mapping(mut self, mapping: FieldMapping) -> Result<Self> {
        mapper::validate_mapping(&mapping)?;
        self.mapping = mapping;
        Ok(self)
    }

    fn repo_path(&self) -> String {
        match &self.repo {
            Some(r) => format!("repos/{r}"),
            None => "repos/{owner}/{repo}".to_string(),
        }
    }

    fn options(&self) -> ExecOptions {
        ExecOptions {
            work_dir: self.work_dir.clone(),
            env: self.env.clone(),
            allow_env: Vec::new(),
        }
    }

    /// Run `op` and parse stdout as JSON; a non-zero exit is classified
    /// from stderr.
    async fn call_json(&self, ctx: &Context, op: &str, params: &Params) -> Result<Value> {
        let res = self.execute(ctx, op, params).await?;
        if !res.success() {
            return Err(classify_cli_failure(NAME, op, res.exit_code, &res.stderr));
        }
        serde_json::from_str(&res.stdout).map_err(|e| {
            ZenError::parse("gh returned invalid JSON")
                .with_provider(NAME)
                .with_operation(op)
                .with_source(e)
        })
    }

    fn issue_from_value(&self, v: Value) -> Result<ExternalTaskData> {
        let Value::Object(map) = v else {
            return Err(ZenError::invalid_data("issue payload is not an object").with_provider(NAME));
        };
        let mut ext = task_from_payload(&map, &self.mapping)?;
        if ext.priority.is_empty() {
            ext.priority = priority_from_labels(&map).unwrap_or_default();
        }
        Ok(ext)
    }

    fn edit_params(&self, id: &str, task: &ExternalTaskData) -> Params {
        let mut p = Params::new();
        if !id.is_empty() {
            p.insert("id".into(), id.to_string());
        }
        p.insert("title".into(), task.title.clone());
        p.insert("body".into(), task.description.clone());
        if !task.status.is_empty() {
            p.insert("state".into(), task.status.clone());
        }
        p
    }
}

/// `P1` from a `priority:P1` / `P1` label, if any.
fn priority_from_labels(issue: &FieldMap) -> Option<String> {
    let labels = issue.get("labels")?.as_array()?;
    labels.iter().find_map(|l| {
        let name = match l {
            Value::Object(o) => o.get("name").map(value_to_string)?,
            other => value_to_string(other),
        };
        let p = name.strip_prefix("priority:").unwrap_or(&name).trim();
        matches!(p, "P0" | "P1" | "P2" | "P3").then(|| p.to_string())
    })
}

#[async_trait]
impl Provider for GithubProvider {
    fn name(&self) -> &str {
        NAME
    }

    async fn info(&self, ctx: &Context) -> Result<ProviderInfo> {
        let mut info = ProviderInfo::new(NAME, ProviderKind::Cli).with_capabilities(OPERATIONS);
        info.binary_path = Some(self.binary.clone());
        let probe = ctx.with_timeout(DEFAULT_VERSION_TIMEOUT);
        match self
            .executor
            .execute(&probe, &self.binary, &["--version".to_string()], &self.options())
            .await
        {
            Ok(res) => {
                info.version = discovery::parse_version(&res.stdout).ok();
                info.available = res.success();
                if !info.available {
                    info.reason = Some(format!("gh --version exited with {}", res.exit_code));
                }
            }
            Err(e) if e.is(ErrorCode::Canceled) => return Err(e),
            Err(e) => info = info.unavailable(e.to_string()),
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

    fn as_task_provider(&self) -> Option<&dyn TaskProvider> {
        Some(self)
    }
}

impl CliProvider for GithubProvider {
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
        let issues = format!("{}/issues", self.repo_path());
        let mut args: Vec<String> = vec!["api".into()];
        match op {
            "github.issue.view" => {
                let id = require(params, "id", op)?;
                check_issue_number(id, op)?;
                args.push(format!("{issues}/{id}"));
            }
            "github.issue.create" => {
                args.extend(["--method".into(), "POST".into(), issues]);
                args.extend(["-f".into(), format!("title={}", require(params, "title", op)?)]);
                if let Some(body) = params.get("body") {
                    args.extend(["-f".into(), format!("body={body}")]);
                }
            }
            "github.issue.edit" => {
                let id = require(params, "id", op)?;
                check_issue_number(id, op)?;
                args.extend(["--method".into(), "PATCH".into(), format!("{issues}/{id}")]);
                for key in ["title", "body", "state"] {
                    if let Some(v) = params.get(key) {
                        args.extend(["-f".into(), format!("{key}={v}")]);
                    }
                }
            }
            "github.issue.list" => {
                args.extend(["--method".into(), "GET".into(), issues]);
                let state = params.get("state").map(String::as_str).unwrap_or("all");
                args.extend(["-f".into(), format!("state={state}")]);
                let limit = params.get("limit").map(String::as_str).unwrap_or("30");
                args.extend(["-f".into(), format!("per_page={limit}")]);
                if let Some(labels) = params.get("labels") {
                    args.extend(["-f".into(), format!("labels={labels}")]);
                }
            }
            "github.auth.status" => {
                args = vec!["auth".into(), "status".into()];
            }
            "github.rate_limit" => args.push("rate_limit".into()),
            _ => {
                return Err(ZenError::invalid_operation(format!("unsupported operation '{op}'"))
                    .with_provider(NAME)
                    .with_operation(op))
            }
        }
        Ok(args)
    }
}

fn check_issue_number(id: &str, op: &str) -> Result<()> {
    if id.chars().all(|c| c.is_ascii_digit()) {
        Ok(())
    } else {
        Err(ZenError::invalid_data(format!("'{id}' is not an issue number"))
            .with_provider(NAME)
            .with_operation(op))
    }
}

#[async_trait]
impl TaskProvider for GithubProvider {
    async fn get_task(&self, ctx: &Context, id: &str) -> Result<ExternalTaskData> {
        let id = id.trim_start_matches('#');
        let v = self
            .call_json(ctx, "github.issue.view", &crate::provider::params([("id", id)]))
            .await
            .map_err(|e| e.with_task(id))?;
        self.issue_from_value(v)
    }

    async fn create_task(&self, ctx: &Context, task: &ExternalTaskData) -> Result<ExternalTaskData> {
        let v = self
            .call_json(ctx, "github.issue.create", &self.edit_params("", task))
            .await?;
        let created = self.issue_from_value(v)?;
        debug!(provider = NAME, external_id = %created.id, "created issue");
        Ok(created)
    }

    async fn update_task(
        &self,
        ctx: &Context,
        id: &str,
        task: &ExternalTaskData,
    ) -> Result<ExternalTaskData> {
        let id = id.trim_start_matches('#');
        let v = self
            .call_json(ctx, "github.issue.edit", &self.edit_params(id, task))
            .await
            .map_err(|e| e.with_task(id))?;
        self.issue_from_value(v)
    }

    async fn search_tasks(&self, ctx: &Context, query: &Params) -> Result<Vec<ExternalTaskData>> {
        let v = self.call_json(ctx, "github.issue.list", query).await?;
        let Value::Array(items) = v else {
            return Err(ZenError::invalid_data("issue list is not an array").with_provider(NAME));
        };
        items
            .into_iter()
            // the issues endpoint also returns pull requests
            .filter(|i| i.get("pull_request").is_none())
            .map(|i| self.issue_from_value(i))
            .collect()
    }

    async fn validate_connection(&self, ctx: &Context) -> Result<()> {
        let res = self.execute(ctx, "github.auth.status", &Params::new()).await?;
        if res.success() {
            Ok(())
        } else {
            Err(ZenError::new(ErrorCode::AuthFailed, "gh is not authenticated")
                .with_provider(NAME)
                .with_hint("run `gh auth login` or set ZEN_GITHUB_TOKEN"))
        }
    }

    fn get_field_mapping(&self) -> FieldMapping {
        self.mapping.clone()
    }

    fn map_to_internal(&self, task: &ExternalTaskData) -> Result<InternalTaskData> {
        Ok(to_internal(NAME, task))
    }

    fn map_to_external(&self, task: &InternalTaskData) -> Result<ExternalTaskData> {
        Ok(to_external(NAME, task))
    }

    async fn health_check(&self, ctx: &Context) -> Result<ProviderHealth> {
        let start = Instant::now();
        let error = match self.validate_connection(ctx).await {
            Ok(()) => None,
            Err(e) if e.is(ErrorCode::Canceled) => return Err(e),
            Err(e) => Some(e.to_string()),
        };
        Ok(ProviderHealth {
            provider: NAME.to_string(),
            healthy: error.is_none(),
            last_check: Utc::now(),
            latency_ms: start.elapsed().as_millis() as u64,
            error,
            consecutive_failures: 0,
        })
    }

    async fn get_rate_limit_info(&self, ctx: &Context) -> Result<RateLimitInfo> {
        let v = self.call_json(ctx, "github.rate_limit", &Params::new()).await?;
        let core = v
            .get("resources")
            .and_then(|r| r.get("core"))
            .or_else(|| v.get("rate"))
            .ok_or_else(|| ZenError::invalid_data("rate_limit response has no core bucket"))?;
        Ok(RateLimitInfo {
            limit: core.get("limit").and_then(Value::as_u64),
            remaining: core.get("remaining").and_then(Value::as_u64),
            reset_at: core
                .get("reset")
                .and_then(Value::as_i64)
                .and_then(|s| DateTime::from_timestamp(s, 0)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::params;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;
    use zen_core::credentials::StaticCredentials;

    const ISSUE: &str = r#"{"number": 7, "title": "Fix login", "body": "details", "state": "open",
        "assignee": {"login": "ana"}, "labels": [{"name": "priority:P1"}],
        "created_at": "2024-01-01T00:00:00Z", "updated_at": "2024-02-01T00:00:00Z"}"#;

    /// A fake `gh` that prints `stdout_json` for `api` calls, logs its argv
    /// and GH_TOKEN, and handles `auth status` with `auth_exit`.
    fn fake_gh(dir: &Path, stdout_json: &str, auth_exit: i32) -> PathBuf {
        let path = dir.join("gh");
        let payload = dir.join("payload.json");
        std::fs::write(&payload, stdout_json).unwrap();
        let log = dir.join("argv.log");
        let script = format!(
            "#!/bin/sh\n\
             echo \"$* token=$GH_TOKEN\" >> '{log}'\n\
             case \"$1\" in\n\
               --version) echo 'gh version 2.40.1 (2023-12-13)';;\n\
               auth) exit {auth_exit};;\n\
               api) cat '{payload}';;\n\
               *) echo 'unknown' >&2; exit 1;;\n\
             esac\n",
            log = log.display(),
            payload = payload.display(),
        );
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn argv_log(dir: &Path) -> String {
        std::fs::read_to_string(dir.join("argv.log")).unwrap_or_default()
    }

    #[test]
    fn args_use_rest_paths() {
        let gh = GithubProvider::new("/bin/gh").with_repo("acme/app");
        assert_eq!(
            gh.exec_args_for("github.issue.view", &params([("id", "7")])).unwrap(),
            vec!["api", "repos/acme/app/issues/7"]
        );
        let edit = gh
            .exec_args_for("github.issue.edit", &params([("id", "7"), ("state", "closed")]))
            .unwrap();
        assert_eq!(
            edit,
            vec!["api", "--method", "PATCH", "repos/acme/app/issues/7", "-f", "state=closed"]
        );
        let default_repo = GithubProvider::new("/bin/gh");
        assert_eq!(
            default_repo
                .exec_args_for("github.issue.view", &params([("id", "1")]))
                .unwrap()[1],
            "repos/{owner}/{repo}/issues/1"
        );
    }

    #[test]
    fn args_reject_bad_input() {
        let gh = GithubProvider::new("/bin/gh");
        assert!(gh
            .exec_args_for("github.issue.view", &params([("id", "7; rm")]))
            .unwrap_err()
            .is(ErrorCode::InvalidData));
        assert!(gh
            .exec_args_for("github.issue.view", &Params::new())
            .unwrap_err()
            .is(ErrorCode::InvalidOperation));
        assert!(gh.exec_args_for("github.pr.merge", &Params::new()).is_err());
    }

    #[tokio::test]
    async fn get_task_maps_issue_payload() {
        let dir = TempDir::new().unwrap();
        let gh = GithubProvider::new(fake_gh(dir.path(), ISSUE, 0));
        let ext = gh.get_task(&Context::background(), "#7").await.unwrap();
        assert_eq!(ext.id, "7");
        assert_eq!(ext.title, "Fix login");
        assert_eq!(ext.priority, "P1");
        let internal = gh.map_to_internal(&ext).unwrap();
        assert_eq!(internal.status, "not_started");
        assert_eq!(internal.priority, "P1");
        assert_eq!(internal.owner, "ana");
        assert!(argv_log(dir.path()).contains("api repos/{owner}/{repo}/issues/7"));
    }

    #[tokio::test]
    async fn credentials_are_passed_as_gh_token() {
        let dir = TempDir::new().unwrap();
        let creds = Arc::new(StaticCredentials::new().with_token("github", "ghp_secret"));
        let gh = GithubProvider::new(fake_gh(dir.path(), ISSUE, 0)).with_credentials(creds);
        gh.get_task(&Context::background(), "7").await.unwrap();
        assert!(argv_log(dir.path()).contains("token=ghp_secret"));
    }

    #[tokio::test]
    async fn update_sends_closed_state() {
        let dir = TempDir::new().unwrap();
        let gh = GithubProvider::new(fake_gh(dir.path(), ISSUE, 0)).with_repo("acme/app");
        let mut task = InternalTaskData::new("T1", "Fix login");
        task.status = "completed".into();
        let ext = gh.map_to_external(&task).unwrap();
        gh.update_task(&Context::background(), "7", &ext).await.unwrap();
        let log = argv_log(dir.path());
        assert!(log.contains("--method PATCH repos/acme/app/issues/7"));
        assert!(log.contains("state=closed"));
    }

    #[tokio::test]
    async fn search_skips_pull_requests() {
        let dir = TempDir::new().unwrap();
        let list = format!(r#"[{ISSUE}, {{"number": 8, "title": "PR", "pull_request": {{}}}}]"#);
        let gh = GithubProvider::new(fake_gh(dir.path(), &list, 0));
        let found = gh
            .search_tasks(&Context::background(), &params([("state", "open")]))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "7");
    }

    #[tokio::test]
    async fn unauthenticated_gh_is_unhealthy() {
        let dir = TempDir::new().unwrap();
        let gh = GithubProvider::new(fake_gh(dir.path(), ISSUE, 1));
        let ctx = Context::background();
        assert!(gh
            .validate_connection(&ctx)
            .await
            .unwrap_err()
            .is(ErrorCode::AuthFailed));
        let health = gh.health_check(&ctx).await.unwrap();
        assert!(!health.healthy);
        assert!(health.error.is_some());
    }

    #[tokio::test]
    async fn rate_limit_reads_core_bucket() {
        let dir = TempDir::new().unwrap();
        let body = r#"{"resources": {"core": {"limit": 5000, "remaining": 4999, "reset": 1700000000}}}"#;
        let gh = GithubProvider::new(fake_gh(dir.path(), body, 0));
        let rl = gh.get_rate_limit_info(&Context::background()).await.unwrap();
        assert_eq!(rl.limit, Some(5000));
        assert_eq!(rl.remaining, Some(4999));
        assert!(rl.reset_at.is_some());
    }

    #[tokio::test]
    async fn info_reports_gh_version() {
        let dir = TempDir::new().unwrap();
        let gh = GithubProvider::new(fake_gh(dir.path(), ISSUE, 0));
        let info = gh.info(&Context::background()).await.unwrap();
        assert!(info.available);
        assert_eq!(info.version.as_deref(), Some("2.40.1"));
        assert!(gh.as_task_provider().is_some());
    }
}
