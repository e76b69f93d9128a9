use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;

use zen_core::mapper::FieldMapping;
use zen_core::types::{
    ExternalTaskData, InternalTaskData, ProviderHealth, ProviderInfo, RateLimitInfo,
};
use zen_core::{Context, ExecResult, Result};

use crate::stream::OutputStream;

/// Operation parameters. Keys are operation-specific (`id`, `limit`, ...).
pub type Params = BTreeMap<String, String>;

/// Base capability set shared by every provider.
///
/// Operations are named `<provider>.<action>` (`git.status`,
/// `jira.issue.get`). A non-success exit code or HTTP status is reported in
/// the returned [`ExecResult`], not as an error.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn info(&self, ctx: &Context) -> Result<ProviderInfo>;

    async fn execute(&self, ctx: &Context, op: &str, params: &Params) -> Result<ExecResult>;

    async fn stream(&self, ctx: &Context, op: &str, params: &Params) -> Result<OutputStream>;

    /// The task capability set, for providers that have one.
    fn as_task_provider(&self) -> Option<&dyn TaskProvider> {
        None
    }
}

/// Extensions for providers that wrap an external binary.
pub trait CliProvider: Provider {
    fn binary_path(&self) -> &Path;

    fn work_dir(&self) -> Option<&Path>;

    fn env(&self) -> &BTreeMap<String, String>;

    /// Translate an operation name into the argv passed to the binary.
    /// Unknown operations are `invalid_operation`.
    fn exec_args_for(&self, op: &str, params: &Params) -> Result<Vec<String>>;
}

/// Extensions for providers that act as an external system of record.
#[async_trait]
pub trait TaskProvider: Provider {
    async fn get_task(&self, ctx: &Context, id: &str) -> Result<ExternalTaskData>;

    /// Returns the created task; its `id` is the new external id.
    async fn create_task(&self, ctx: &Context, task: &ExternalTaskData) -> Result<ExternalTaskData>;

    async fn update_task(
        &self,
        ctx: &Context,
        id: &str,
        task: &ExternalTaskData,
    ) -> Result<ExternalTaskData>;

    async fn search_tasks(&self, ctx: &Context, query: &Params) -> Result<Vec<ExternalTaskData>>;

    async fn validate_connection(&self, ctx: &Context) -> Result<()>;

    fn get_field_mapping(&self) -> FieldMapping;

    fn map_to_internal(&self, task: &ExternalTaskData) -> Result<InternalTaskData>;

    fn map_to_external(&self, task: &InternalTaskData) -> Result<ExternalTaskData>;

    /// Probe the provider. Probe failures are reported as an unhealthy
    /// record; only unexpected errors (cancellation) are returned as `Err`.
    async fn health_check(&self, ctx: &Context) -> Result<ProviderHealth>;

    async fn get_rate_limit_info(&self, ctx: &Context) -> Result<RateLimitInfo>;
}

/// Required parameter lookup shared by adapters.
pub(crate) fn require<'a>(params: &'a Params, key: &str, op: &str) -> Result<&'a str> {
    params
        .get(key)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            zen_core::ZenError::invalid_operation(format!("operation '{op}' requires '{key}'"))
                .with_operation(op)
        })
}

pub fn params<const N: usize>(pairs: [(&str, &str); N]) -> Params {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
