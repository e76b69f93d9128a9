//! Jira issues as a task system, over the REST v2 API.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use tracing::debug;

use zen_core::credentials::Credentials;
use zen_core::mapper::{self, FieldMapping};
use zen_core::types::{
    ExternalTaskData, InternalTaskData, ProviderHealth, ProviderInfo, ProviderKind, RateLimitInfo,
};
use zen_core::{Context, ErrorCode, ExecResult, Result, ZenError};

use super::{task_from_payload, to_external, to_internal, vocab};
use crate::provider::{require, Params, Provider, TaskProvider};
use crate::stream::OutputStream;

pub const NAME: &str = "jira";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub const OPERATIONS: &[&str] = &[
    "jira.issue.get",
    "jira.issue.create",
    "jira.issue.update",
    "jira.issue.transitions",
    "jira.issue.transition",
    "jira.search",
    "jira.myself",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthType {
    Bearer,
    Basic,
}

impl AuthType {
    pub fn parse(s: Option<&str>) -> Self {
        match s {
            Some("basic") => AuthType::Basic,
            _ => AuthType::Bearer,
        }
    }
}

/// One REST call relative to the server URL.
struct Route {
    method: Method,
    path: String,
    query: Vec<(&'static str, String)>,
    body: Option<Value>,
}

impl Route {
    fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    fn query(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.query.push((key, value.into()));
        self
    }

    fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

pub struct JiraProvider {
    base_url: String,
    project_key: Option<String>,
    auth: AuthType,
    credentials: Arc<dyn Credentials>,
    client: reqwest::Client,
    mapping: FieldMapping,
    rate_limit: Mutex<RateLimitInfo>,
}

impl std::fmt::Debug for JiraProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JiraProvider")
            .field("base_url", &self.base_url)
            .field("project_key", &self.project_key)
            .field("auth", &self.auth)
            .finish_non_exhaustive()
    }
}

impl JiraProvider {
    pub fn new(base_url: &str, credentials: Arc<dyn Credentials>) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ZenError::config(format!("invalid jira server_url '{base_url}'"))
                .with_provider(NAME));
        }
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .user_agent(concat!("zen/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ZenError::config("cannot build HTTP client").with_source(e))?;
        Ok(Self {
            base_url,
            project_key: None,
            auth: AuthType::Bearer,
            credentials,
            client,
            mapping: mapper::get_default_mapping(NAME),
            rate_limit: Mutex::new(RateLimitInfo::default()),
        })
    }

    pub fn with_project(mut self, key: impl Into<String>) -> Self {
        self.project_key = Some(key.into());
        self
    }

    pub fn with_auth(mut self, auth: AuthType) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_mapping(mut self, mapping: FieldMapping) -> Result<Self> {
        mapper::validate_mapping(&mapping)?;
        self.mapping = mapping;
        Ok(self)
    }

    /// The REST call behind an operation.
    fn route(&self, op: &str, params: &Params) -> Result<Route> {
        let json_body = |op: &str| -> Result<Value> {
            Ok(serde_json::from_str::<Value>(require(params, "body", op)?)?)
        };
        let route = match op {
            "jira.issue.get" => {
                let key = issue_key(require(params, "id", op)?, op)?;
                let mut route = Route::new(Method::GET, format!("/rest/api/2/issue/{key}"));
                if let Some(fields) = params.get("fields") {
                    route = route.query("fields", fields.as_str());
                }
                route
            }
            "jira.issue.create" => {
                Route::new(Method::POST, "/rest/api/2/issue").body(json_body(op)?)
            }
            "jira.issue.update" => {
                let key = issue_key(require(params, "id", op)?, op)?;
                Route::new(Method::PUT, format!("/rest/api/2/issue/{key}")).body(json_body(op)?)
            }
            "jira.issue.transitions" => {
                let key = issue_key(require(params, "id", op)?, op)?;
                Route::new(Method::GET, format!("/rest/api/2/issue/{key}/transitions"))
            }
            "jira.issue.transition" => {
                let key = issue_key(require(params, "id", op)?, op)?;
                Route::new(Method::POST, format!("/rest/api/2/issue/{key}/transitions"))
                    .body(json_body(op)?)
            }
            "jira.search" => {
                let jql = match (params.get("jql"), &self.project_key) {
                    (Some(j), _) => j.clone(),
                    (None, Some(p)) => format!("project = {p} ORDER BY updated DESC"),
                    (None, None) => "ORDER BY updated DESC".to_string(),
                };
                let limit = number_param(params, "limit", 50)?;
                let start = number_param(params, "start", 0)?;
                Route::new(Method::GET, "/rest/api/2/search")
                    .query("jql", jql)
                    .query("startAt", start.to_string())
                    .query("maxResults", limit.to_string())
            }
            "jira.myself" => Route::new(Method::GET, "/rest/api/2/myself"),
            _ => {
                return Err(ZenError::invalid_operation(format!("unsupported operation '{op}'")))
            }
        };
        Ok(route)
    }

    /// Issue one request. Any HTTP status is returned in the result; only
    /// transport failures, cancellation and missing credentials are errors.
    async fn request(&self, ctx: &Context, route: &Route) -> Result<ExecResult> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        let token = self.credentials.get(NAME)?;
        let url = format!("{}{}", self.base_url, route.path);
        let mut req = self
            .client
            .request(route.method.clone(), &url)
            .header("Accept", "application/json");
        if !route.query.is_empty() {
            req = req.query(&route.query);
        }
        req = match self.auth {
            AuthType::Bearer => req.bearer_auth(&token),
            AuthType::Basic => {
                let user = self.credentials.user(NAME).ok_or_else(|| {
                    ZenError::new(ErrorCode::AuthFailed, "basic auth requires a user")
                        .with_provider(NAME)
                        .with_hint("set ZEN_JIRA_USER")
                })?;
                req.basic_auth(user, Some(&token))
            }
        };
        if let Some(b) = &route.body {
            req = req.json(b);
        }
        if let Some(remaining) = ctx.remaining() {
            req = req.timeout(remaining);
        }

        debug!(provider = NAME, method = %route.method, path = %route.path, "request");
        let start = Instant::now();
        let resp = tokio::select! {
            r = req.send() => r.map_err(transport_error)?,
            _ = ctx.done() => {
                return Err(ctx.err().unwrap_or_else(|| ZenError::canceled("request canceled")));
            }
        };
        let status = resp.status();
        let headers: BTreeMap<String, String> = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect();
        self.record_rate_limit(&headers);
        let text = resp.text().await.map_err(transport_error)?;
        Ok(ExecResult {
            exit_code: i32::from(status.as_u16()),
            body: text,
            headers,
            duration: start.elapsed(),
            ..Default::default()
        })
    }

    fn record_rate_limit(&self, headers: &BTreeMap<String, String>) {
        let num = |k: &str| headers.get(k).and_then(|v| v.trim().parse::<u64>().ok());
        let limit = num("x-ratelimit-limit");
        let remaining = num("x-ratelimit-remaining");
        if limit.is_none() && remaining.is_none() {
            return;
        }
        let reset_at = headers.get("x-ratelimit-reset").and_then(|v| {
            v.trim()
                .parse::<i64>()
                .ok()
                .and_then(|s| DateTime::from_timestamp(s, 0))
                .or_else(|| super::parse_timestamp(v.trim()))
        });
        let mut rl = self.rate_limit.lock().unwrap_or_else(|e| e.into_inner());
        *rl = RateLimitInfo {
            limit,
            remaining,
            reset_at,
        };
    }

    /// Run `op` and require a 2xx status; returns the parsed body (or
    /// `Null` for empty bodies).
    async fn call(&self, ctx: &Context, op: &str, params: &Params) -> Result<Value> {
        let res = self.execute(ctx, op, params).await?;
        if !res.success() {
            return Err(status_error(op, res.exit_code, &res.body));
        }
        if res.body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&res.body).map_err(|e| {
            ZenError::parse("jira returned invalid JSON")
                .with_provider(NAME)
                .with_operation(op)
                .with_source(e)
        })
    }

    fn issue_from_value(&self, v: Value) -> Result<ExternalTaskData> {
        match v {
            Value::Object(map) => task_from_payload(&map, &self.mapping),
            _ => Err(ZenError::invalid_data("issue payload is not an object").with_provider(NAME)),
        }
    }

    /// Move an issue to `target` through a workflow transition. An issue
    /// already in that status is left alone.
    async fn transition_to(&self, ctx: &Context, key: &str, target: &str) -> Result<()> {
        let issue = self
            .call(ctx, "jira.issue.get", &crate::provider::params([("id", key), ("fields", "status")]))
            .await?;
        let current = issue
            .pointer("/fields/status/name")
            .and_then(Value::as_str)
            .unwrap_or("");
        if same_status(current, target) {
            return Ok(());
        }
        let op = "jira.issue.transition";
        let listed = self
            .call(ctx, "jira.issue.transitions", &crate::provider::params([("id", key)]))
            .await?;
        let transition = listed
            .get("transitions")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .find(|t| {
                t.pointer("/to/name")
                    .and_then(Value::as_str)
                    .is_some_and(|to| same_status(to, target))
            })
            .and_then(|t| t.get("id").and_then(Value::as_str));
        let Some(id) = transition else {
            return Err(ZenError::invalid_operation(format!(
                "no jira transition from '{current}' to '{target}'"
            ))
            .with_provider(NAME)
            .with_operation(op)
            .retryable(false));
        };
        let body = json!({ "transition": { "id": id } }).to_string();
        self.call(ctx, op, &crate::provider::params([("id", key), ("body", body.as_str())]))
            .await?;
        debug!(provider = NAME, external_id = key, from = current, to = target, "transitioned issue");
        Ok(())
    }

    fn issue_fields(&self, task: &ExternalTaskData) -> Value {
        let mut fields = json!({
            "summary": task.title,
            "description": task.description,
        });
        if !task.priority.is_empty() {
            fields["priority"] = json!({ "name": task.priority });
        }
        fields
    }
}

fn issue_key<'a>(key: &'a str, op: &str) -> Result<&'a str> {
    if !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        Ok(key)
    } else {
        Err(ZenError::invalid_data(format!("'{key}' is not an issue key"))
            .with_provider(NAME)
            .with_operation(op))
    }
}

fn number_param(params: &Params, key: &str, default: u32) -> Result<u32> {
    match params.get(key) {
        Some(v) => v
            .parse()
            .map_err(|_| ZenError::invalid_operation(format!("invalid {key} '{v}'"))),
        None => Ok(default),
    }
}

/// Jira status names compare case-insensitively, and two names that
/// normalize to the same internal status are the same status.
fn same_status(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b) || vocab::normalize_status(a) == vocab::normalize_status(b)
}

fn transport_error(e: reqwest::Error) -> ZenError {
    let code = if e.is_timeout() {
        ErrorCode::Timeout
    } else {
        ErrorCode::NetworkError
    };
    ZenError::new(code, "request to jira failed")
        .with_provider(NAME)
        .with_source(e)
}

/// Non-2xx responses: retryable for 5xx and 429 only.
fn status_error(op: &str, status: i32, body: &str) -> ZenError {
    let retryable = status == 429 || (500..600).contains(&status);
    let reason = u16::try_from(status)
        .ok()
        .and_then(|s| StatusCode::from_u16(s).ok())
        .and_then(|s| s.canonical_reason())
        .unwrap_or("unexpected status");
    let detail = body.trim();
    let mut message = format!("HTTP {status} {reason}");
    if !detail.is_empty() {
        let snippet: String = detail.chars().take(200).collect();
        message.push_str(": ");
        message.push_str(&snippet);
    }
    ZenError::provider(message)
        .with_provider(NAME)
        .with_operation(op)
        .retryable(retryable)
}

#[async_trait]
impl Provider for JiraProvider {
    fn name(&self) -> &str {
        NAME
    }

    async fn info(&self, ctx: &Context) -> Result<ProviderInfo> {
        let mut info = ProviderInfo::new(NAME, ProviderKind::Api).with_capabilities(OPERATIONS);
        info.base_url = Some(self.base_url.clone());
        if let Err(e) = self.credentials.validate(NAME) {
            return Ok(info.unavailable(e.message));
        }
        match self.call(ctx, "jira.myself", &Params::new()).await {
            Ok(_) => info.available = true,
            Err(e) if e.is(ErrorCode::Canceled) => return Err(e),
            Err(e) => info = info.unavailable(e.to_string()),
        }
        Ok(info)
    }

    async fn execute(&self, ctx: &Context, op: &str, params: &Params) -> Result<ExecResult> {
        let route = self
            .route(op, params)
            .map_err(|e| e.with_provider(NAME).with_operation(op))?;
        self.request(ctx, &route)
            .await
            .map_err(|e| e.with_operation(op))
    }

    /// HTTP responses are complete when they arrive; the stream replays
    /// the body line by line.
    async fn stream(&self, ctx: &Context, op: &str, params: &Params) -> Result<OutputStream> {
        let res = self.execute(ctx, op, params).await?;
        Ok(OutputStream::from_text(res.output(), res.exit_code))
    }

    fn as_task_provider(&self) -> Option<&dyn TaskProvider> {
        Some(self)
    }
}

#[async_trait]
impl TaskProvider for JiraProvider {
    async fn get_task(&self, ctx: &Context, id: &str) -> Result<ExternalTaskData> {
        let v = self
            .call(ctx, "jira.issue.get", &crate::provider::params([("id", id)]))
            .await
            .map_err(|e| e.with_task(id))?;
        self.issue_from_value(v)
    }

    async fn create_task(&self, ctx: &Context, task: &ExternalTaskData) -> Result<ExternalTaskData> {
        let project = self.project_key.as_deref().ok_or_else(|| {
            ZenError::config("creating jira issues requires a project_key").with_provider(NAME)
        })?;
        let mut fields = self.issue_fields(task);
        fields["project"] = json!({ "key": project });
        fields["issuetype"] = json!({ "name": "Task" });
        let body = json!({ "fields": fields }).to_string();
        let v = self
            .call(ctx, "jira.issue.create", &crate::provider::params([("body", body.as_str())]))
            .await?;
        let key = v
            .get("key")
            .and_then(Value::as_str)
            .ok_or_else(|| ZenError::invalid_data("create response has no issue key"))?;
        debug!(provider = NAME, external_id = key, "created issue");
        Ok(ExternalTaskData {
            id: key.to_string(),
            ..task.clone()
        })
    }

    /// Fields are written in place; a status change goes through the
    /// issue's workflow transitions.
    async fn update_task(
        &self,
        ctx: &Context,
        id: &str,
        task: &ExternalTaskData,
    ) -> Result<ExternalTaskData> {
        let body = json!({ "fields": self.issue_fields(task) }).to_string();
        self.call(
            ctx,
            "jira.issue.update",
            &crate::provider::params([("id", id), ("body", body.as_str())]),
        )
        .await
        .map_err(|e| e.with_task(id))?;
        if !task.status.is_empty() {
            self.transition_to(ctx, id, &task.status)
                .await
                .map_err(|e| e.with_task(id))?;
        }
        Ok(ExternalTaskData {
            id: id.to_string(),
            ..task.clone()
        })
    }

    async fn search_tasks(&self, ctx: &Context, query: &Params) -> Result<Vec<ExternalTaskData>> {
        let v = self.call(ctx, "jira.search", query).await?;
        let issues = v
            .get("issues")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        issues
            .into_iter()
            .map(|i| self.issue_from_value(i))
            .collect()
    }

    async fn validate_connection(&self, ctx: &Context) -> Result<()> {
        self.credentials.validate(NAME)?;
        let op = "jira.myself";
        let res = self.execute(ctx, op, &Params::new()).await?;
        match res.exit_code {
            401 | 403 => Err(ZenError::new(
                ErrorCode::AuthFailed,
                format!("jira rejected the credentials (HTTP {})", res.exit_code),
            )
            .with_provider(NAME)
            .with_operation(op)
            .with_hint("check ZEN_JIRA_TOKEN")),
            _ if res.success() => Ok(()),
            status => Err(status_error(op, status, &res.body)),
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
        let cached = self
            .rate_limit
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if cached.limit.is_some() || cached.remaining.is_some() {
            return Ok(cached);
        }
        self.call(ctx, "jira.myself", &Params::new()).await?;
        Ok(self
            .rate_limit
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }
}
