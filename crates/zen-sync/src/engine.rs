//! Orchestration of pull, push and bidirectional synchronization.
//!
//! Lock layering: `state` guards the provider table, breakers, limiters,
//! health and conflict maps. It is only ever held to snapshot or swap
//! entries and is never held across an `.await`. Breakers and buckets carry
//! their own mutexes. The record and conflict caches have their own locks;
//! `record_write` serializes the read-compare-write of a sync record.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use zen_core::cache::{CacheOptions, FsCache, PutOptions};
use zen_core::config::IntegrationConfig;
use zen_core::mapper;
use zen_core::store::TaskStore;
use zen_core::types::{
    ConflictRecord, ConflictStatus, ConflictStrategy, FieldConflict, InternalTaskData,
    ProviderHealth, SyncDirection, SyncRecord, SYNC_FIELDS,
};
use zen_core::{Context, ErrorCode, Result, ZenError};
use zen_provider::adapters::vocab;
use zen_provider::{Provider, TaskProvider};

use crate::breaker::{CircuitBreaker, CircuitState};
use crate::conflict;
use crate::health::{self, HealthMonitor};
use crate::metrics::{MetricsRecorder, SyncMetrics};
use crate::ratelimit::TokenBucket;
use crate::retry::{self, RetryPolicy, DEFAULT_RETRIES};

pub const RECORDS_DIR: &str = "sync";
pub const CONFLICTS_DIR: &str = "conflicts";

// ---------------------------------------------------------------------------
// Options and results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Defaults to the record's direction.
    pub direction: Option<SyncDirection>,
    /// Defaults to the record's strategy.
    pub conflict_strategy: Option<ConflictStrategy>,
    pub dry_run: bool,
    pub force_sync: bool,
    pub timeout: Option<Duration>,
    /// Retries after the first attempt; 3 when unset.
    pub retry_count: Option<u32>,
    pub batch_size: usize,
    /// Concurrent tasks in `sync_all_tasks`; 1 when unset.
    pub parallel: usize,
    pub user_id: Option<String>,
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub success: bool,
    pub task_id: String,
    pub external_id: String,
    pub direction: Option<SyncDirection>,
    pub changed_fields: Vec<String>,
    pub conflicts: Vec<FieldConflict>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    pub retryable: bool,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: String,
    pub metadata: BTreeMap<String, Value>,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl SyncResult {
    fn new(task_id: &str, correlation_id: String) -> Self {
        Self {
            success: false,
            task_id: task_id.to_string(),
            external_id: String::new(),
            direction: None,
            changed_fields: Vec::new(),
            conflicts: Vec::new(),
            error: None,
            error_code: None,
            retryable: false,
            duration: Duration::ZERO,
            timestamp: Utc::now(),
            correlation_id,
            metadata: BTreeMap::new(),
        }
    }

    fn fail(&mut self, err: &ZenError) {
        self.success = false;
        self.error = Some(err.message.clone());
        self.error_code = Some(err.code);
        self.retryable = err.retryable;
    }
}

fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// What a sync attempt would change, computed before anything is written
/// locally.
#[derive(Debug, Default)]
struct Plan {
    local: Option<InternalTaskData>,
    local_changed: bool,
    changed_fields: Vec<String>,
    conflicts: Vec<FieldConflict>,
    needs_review: bool,
    created_external_id: Option<String>,
    pushed: bool,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Default)]
struct State {
    providers: BTreeMap<String, Arc<dyn Provider>>,
    breakers: BTreeMap<String, Arc<CircuitBreaker>>,
    limiters: BTreeMap<String, Arc<TokenBucket>>,
    health: BTreeMap<String, ProviderHealth>,
    conflicts: BTreeMap<String, ConflictRecord>,
}

struct Handles {
    provider: Arc<dyn Provider>,
    breaker: Arc<CircuitBreaker>,
    limiter: Arc<TokenBucket>,
}

pub struct SyncEngine {
    config: IntegrationConfig,
    store: Arc<dyn TaskStore>,
    records: FsCache<SyncRecord>,
    conflict_cache: FsCache<ConflictRecord>,
    record_write: Mutex<()>,
    state: RwLock<State>,
    metrics: MetricsRecorder,
    monitor: Mutex<Option<HealthMonitor>>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("task_system", &self.config.task_system)
            .field("records", &self.records.base_path())
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    /// Open the engine over `cache_base`. Sync records live in
    /// `<cache_base>/sync` and parked conflicts in `<cache_base>/conflicts`;
    /// neither expires.
    pub fn new(
        config: IntegrationConfig,
        cache_base: &Path,
        store: Arc<dyn TaskStore>,
    ) -> Result<Self> {
        let records = FsCache::json(CacheOptions::new(cache_base.join(RECORDS_DIR)))?;
        let conflict_cache: FsCache<ConflictRecord> =
            FsCache::json(CacheOptions::new(cache_base.join(CONFLICTS_DIR)))?;

        let mut state = State::default();
        for key in conflict_cache.keys() {
            match conflict_cache.get(&key) {
                Ok(c) => {
                    state.conflicts.insert(key, c.data);
                }
                Err(e) => warn!(task_id = %key, error = %e, "skipping unreadable conflict record"),
            }
        }

        Ok(Self {
            config,
            store,
            records,
            conflict_cache,
            record_write: Mutex::new(()),
            state: RwLock::new(state),
            metrics: MetricsRecorder::default(),
            monitor: Mutex::new(None),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    // ─── Providers ───────────────────────────────────────────────────

    /// Register `provider` with its own breaker and bucket, configured from
    /// the provider's config section when present.
    pub fn register_provider(&self, provider: Arc<dyn Provider>) -> Result<()> {
        let name = provider.name().to_string();
        if name.trim().is_empty() {
            return Err(ZenError::invalid_operation("provider name is empty"));
        }
        let section = self.config.provider(&name);
        let breaker = section
            .and_then(|p| p.circuit.as_ref())
            .map(CircuitBreaker::from_config)
            .unwrap_or_default();
        let limiter = section
            .and_then(|p| p.rate_limit.as_ref())
            .map(TokenBucket::from_config)
            .unwrap_or_default();

        let mut state = self.write();
        if state.providers.contains_key(&name) {
            return Err(ZenError::new(
                ErrorCode::AlreadyExists,
                format!("provider '{name}' is already registered"),
            )
            .with_provider(&name));
        }
        state.providers.insert(name.clone(), provider);
        state.breakers.insert(name.clone(), Arc::new(breaker));
        state.limiters.insert(name.clone(), Arc::new(limiter));
        drop(state);
        debug!(provider = %name, "registered provider");
        Ok(())
    }

    pub fn get_provider(&self, name: &str) -> Result<Arc<dyn Provider>> {
        self.read()
            .providers
            .get(name)
            .cloned()
            .ok_or_else(|| ZenError::not_found(format!("provider '{name}' is not registered")))
    }

    pub fn list_providers(&self) -> Vec<String> {
        self.read().providers.keys().cloned().collect()
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_configured()
    }

    pub fn get_task_system(&self) -> &str {
        &self.config.task_system
    }

    pub fn is_sync_enabled(&self) -> bool {
        self.config.sync_enabled
    }

    pub fn circuit_state(&self, provider: &str) -> Option<CircuitState> {
        self.read().breakers.get(provider).map(|b| b.state())
    }

    fn handles(&self, name: &str) -> Option<Handles> {
        let state = self.read();
        Some(Handles {
            provider: state.providers.get(name)?.clone(),
            breaker: state.breakers.get(name)?.clone(),
            limiter: state.limiters.get(name)?.clone(),
        })
    }

    // ─── Sync records ────────────────────────────────────────────────

    pub fn get_sync_record(&self, task_id: &str) -> Result<SyncRecord> {
        match self.records.get(task_id) {
            Ok(c) => Ok(c.data),
            Err(e) if e.is_not_found() => Err(ZenError::not_found(format!(
                "no sync record for task '{task_id}'"
            ))
            .with_task(task_id)),
            Err(e) => Err(ZenError::from(e).with_task(task_id)),
        }
    }

    pub fn create_sync_record(&self, record: &SyncRecord) -> Result<()> {
        if record.task_id.is_empty() {
            return Err(ZenError::invalid_data("sync record has an empty task id"));
        }
        let _guard = self.record_write.lock().unwrap_or_else(|e| e.into_inner());
        if self.records.contains(&record.task_id) {
            return Err(ZenError::new(
                ErrorCode::AlreadyExists,
                format!("task '{}' already has a sync record", record.task_id),
            )
            .with_task(&record.task_id));
        }
        self.records
            .put(&record.task_id, record, PutOptions::default())
            .map_err(|e| ZenError::from(e).with_task(&record.task_id))
    }

    /// Persist `record`, which must carry the version currently stored.
    /// Returns the stored record with its version advanced.
    pub fn update_sync_record(&self, record: &SyncRecord) -> Result<SyncRecord> {
        let mut next = record.clone();
        next.touch();
        self.persist(&next, record.version)?;
        Ok(next)
    }

    pub fn delete_sync_record(&self, task_id: &str) -> Result<()> {
        let _guard = self.record_write.lock().unwrap_or_else(|e| e.into_inner());
        if !self.records.contains(task_id) {
            return Err(ZenError::not_found(format!("no sync record for task '{task_id}'"))
                .with_task(task_id));
        }
        self.records
            .delete(task_id)
            .map_err(|e| ZenError::from(e).with_task(task_id))
    }

    /// Every stored record, ordered by task id.
    pub fn list_sync_records(&self) -> Result<Vec<SyncRecord>> {
        let mut keys = self.records.keys();
        keys.sort();
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            match self.records.get(&key) {
                Ok(c) => out.push(c.data),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(ZenError::from(e).with_task(key)),
            }
        }
        Ok(out)
    }

    /// Write `record` only if the stored version is still `read_version`
    /// and `record` moves it strictly forward.
    fn persist(&self, record: &SyncRecord, read_version: u64) -> Result<()> {
        self.persist_with(record, read_version, || Ok(()))
    }

    /// `persist`, running `apply` after the version check and before the
    /// record is written. Nothing runs when the check fails, and the
    /// record stays put when `apply` fails.
    fn persist_with(
        &self,
        record: &SyncRecord,
        read_version: u64,
        apply: impl FnOnce() -> Result<()>,
    ) -> Result<()> {
        let _guard = self.record_write.lock().unwrap_or_else(|e| e.into_inner());
        let stored = self.get_sync_record(&record.task_id)?;
        if stored.version != read_version || record.version <= read_version {
            return Err(ZenError::new(
                ErrorCode::VersionMismatch,
                format!(
                    "sync record is at version {}, update was based on {read_version}",
                    stored.version
                ),
            )
            .with_task(&record.task_id));
        }
        apply()?;
        self.records
            .put(&record.task_id, record, PutOptions::default())
            .map_err(|e| ZenError::from(e).with_task(&record.task_id))
    }

    // ─── Sync ────────────────────────────────────────────────────────

    /// Synchronize one task. Failures are reported in the result, never
    /// returned as `Err`.
    pub async fn sync_task(&self, ctx: &Context, task_id: &str, opts: &SyncOptions) -> SyncResult {
        let start = Instant::now();
        let correlation_id = opts.correlation_id.clone().unwrap_or_else(new_correlation_id);
        let mut result = SyncResult::new(task_id, correlation_id);
        let ctx = match opts.timeout {
            Some(t) => ctx.with_timeout(t),
            None => ctx.child(),
        };

        match self.run_sync(&ctx, task_id, opts, &mut result).await {
            Ok(()) => result.success = true,
            Err(e) => result.fail(&e),
        }
        result.duration = start.elapsed();
        result.timestamp = Utc::now();
        if opts.dry_run {
            result.metadata.insert("dry_run".into(), Value::Bool(true));
        }
        self.metrics
            .record(result.success, result.duration, result.conflicts.len());

        if result.success {
            info!(
                task_id,
                correlation_id = %result.correlation_id,
                changed = result.changed_fields.len(),
                duration_ms = result.duration.as_millis() as u64,
                "sync completed"
            );
        } else {
            warn!(
                task_id,
                correlation_id = %result.correlation_id,
                code = ?result.error_code,
                error = result.error.as_deref().unwrap_or(""),
                "sync failed"
            );
        }
        result
    }

    async fn run_sync(
        &self,
        ctx: &Context,
        task_id: &str,
        opts: &SyncOptions,
        result: &mut SyncResult,
    ) -> Result<()> {
        if !self.is_configured() {
            return Err(ZenError::config("integration not configured")
                .with_task(task_id)
                .with_hint("set integration.task_system in .zen/config.yaml"));
        }
        let record = self.get_sync_record(task_id)?;
        let direction = opts.direction.unwrap_or(record.sync_direction);
        let strategy = opts.conflict_strategy.unwrap_or(record.conflict_strategy);
        result.external_id = record.external_id.clone();
        result.direction = Some(direction);

        let system = if record.external_system.is_empty() {
            self.config.task_system.clone()
        } else {
            record.external_system.clone()
        };
        let handles = self.handles(&system).ok_or_else(|| {
            ZenError::provider(format!("provider '{system}' is not registered"))
                .with_provider(&system)
                .with_task(task_id)
                .retryable(false)
        })?;
        let tasks = handles.provider.as_task_provider().ok_or_else(|| {
            ZenError::provider(format!("provider '{system}' does not manage tasks"))
                .with_provider(&system)
                .retryable(false)
        })?;

        if !handles.breaker.allow() {
            return Err(ZenError::provider("circuit breaker open")
                .with_provider(&system)
                .with_task(task_id)
                .retryable(true));
        }
        if !handles.limiter.allow() {
            handles.breaker.release();
            return Err(ZenError::new(ErrorCode::RateLimited, "rate limit exceeded")
                .with_provider(&system)
                .with_task(task_id));
        }

        let policy = RetryPolicy::with_retries(opts.retry_count.unwrap_or(DEFAULT_RETRIES));
        let attempt = retry::retry(ctx, policy, "sync_task", |_| {
            self.dispatch(ctx, tasks, &record, direction, strategy, opts)
        })
        .await;

        let plan = match attempt {
            Ok(plan) => {
                handles.breaker.record_success();
                plan
            }
            Err(e) => {
                if e.is(ErrorCode::Canceled) {
                    handles.breaker.release();
                } else {
                    handles.breaker.record_failure();
                }
                let e = e.with_task(task_id);
                if !opts.dry_run {
                    self.record_failure(&record, &e);
                }
                return Err(e);
            }
        };

        result.changed_fields = plan.changed_fields.clone();
        result.conflicts = plan.conflicts.clone();
        if let Some(id) = &plan.created_external_id {
            result.external_id = id.clone();
        }
        result
            .metadata
            .insert("pushed".into(), Value::Bool(plan.pushed));

        if plan.needs_review {
            let err = ZenError::new(
                ErrorCode::SyncConflict,
                format!("{} field(s) need manual review", plan.conflicts.len()),
            )
            .with_provider(&system)
            .with_task(task_id)
            .with_hint("run `zen conflicts list`")
            .retryable(false);
            if !opts.dry_run {
                self.park_conflicts(task_id, plan.conflicts)?;
                let mut next = record.clone();
                next.mark_conflict();
                self.persist(&next, record.version)?;
            }
            return Err(err);
        }

        if opts.dry_run {
            return Ok(());
        }

        let mut next = record.clone();
        if let Some(id) = plan.created_external_id {
            next.external_id = id;
        }
        next.mark_success(plan.local.as_ref().map(InternalTaskData::content_hash));
        let local_write = plan.local.as_ref().filter(|_| plan.local_changed);
        self.persist_with(&next, record.version, || match local_write {
            Some(local) => self.store.put(task_id, local),
            None => Ok(()),
        })
    }

    /// One attempt against the provider. Nothing local is written here, so
    /// a failed attempt can be retried from scratch.
    async fn dispatch(
        &self,
        ctx: &Context,
        tasks: &dyn TaskProvider,
        record: &SyncRecord,
        direction: SyncDirection,
        strategy: ConflictStrategy,
        opts: &SyncOptions,
    ) -> Result<Plan> {
        let local = match self.store.get(&record.task_id) {
            Ok(t) => Some(t),
            Err(e) if e.is(ErrorCode::NotFound) => None,
            Err(e) => return Err(e),
        };
        let mut plan = Plan {
            local,
            ..Plan::default()
        };

        if matches!(direction, SyncDirection::Pull | SyncDirection::Bidirectional) {
            self.pull(ctx, tasks, record, strategy, &mut plan).await?;
        }
        if plan.needs_review {
            return Ok(plan);
        }
        if matches!(direction, SyncDirection::Push | SyncDirection::Bidirectional) {
            self.push(ctx, tasks, record, opts, &mut plan).await?;
        }
        Ok(plan)
    }

    async fn pull(
        &self,
        ctx: &Context,
        tasks: &dyn TaskProvider,
        record: &SyncRecord,
        strategy: ConflictStrategy,
        plan: &mut Plan,
    ) -> Result<()> {
        if record.external_id.is_empty() {
            return Err(ZenError::invalid_data(format!(
                "task '{}' is not linked to an external id",
                record.task_id
            )));
        }
        let external = tasks.get_task(ctx, &record.external_id).await?;
        let mut remote = tasks.map_to_internal(&external)?;
        apply_record_mappings(&mut remote, &external.fields, &record.field_mappings)?;
        let external_ts = external.updated.unwrap_or(remote.updated);

        match plan.local.as_mut() {
            None => {
                remote.id = record.task_id.clone();
                plan.changed_fields = SYNC_FIELDS
                    .iter()
                    .filter(|f| remote.field(f).is_some_and(|v| !v.is_empty()))
                    .map(|f| f.to_string())
                    .collect();
                remote.fill_defaults();
                plan.local = Some(remote);
                plan.local_changed = true;
            }
            Some(local) => {
                let local_ts = self.store.updated_at(&record.task_id)?;
                let mut conflicts = conflict::detect(local, local_ts, &remote, external_ts);
                if strategy == ConflictStrategy::ManualReview && !conflicts.is_empty() {
                    plan.needs_review = true;
                } else {
                    let changed = conflict::resolve(strategy, local, &mut conflicts);
                    if !changed.is_empty() {
                        local.updated = external_ts;
                        plan.local_changed = true;
                    }
                    plan.changed_fields = changed;
                }
                for key in ["external_system", "external_id"] {
                    if let Some(v) = remote.metadata.get(key) {
                        if local.metadata.get(key) != Some(v) {
                            local.metadata.insert(key.to_string(), v.clone());
                            plan.local_changed = true;
                        }
                    }
                }
                plan.conflicts = conflicts;
            }
        }
        debug!(
            task_id = %record.task_id,
            changed = plan.changed_fields.len(),
            conflicts = plan.conflicts.len(),
            "pull leg done"
        );
        Ok(())
    }

    async fn push(
        &self,
        ctx: &Context,
        tasks: &dyn TaskProvider,
        record: &SyncRecord,
        opts: &SyncOptions,
        plan: &mut Plan,
    ) -> Result<()> {
        let Some(local) = plan.local.as_ref() else {
            return Err(ZenError::not_found(format!(
                "task '{}' has no local content to push",
                record.task_id
            )));
        };
        let hash = local.content_hash();
        if !opts.force_sync && !plan.local_changed && record.data_hash.as_deref() == Some(hash.as_str()) {
            debug!(task_id = %record.task_id, "local content unchanged, skipping push");
            return Ok(());
        }

        let mut outbound = tasks.map_to_external(local)?;
        outbound.id = record.external_id.clone();
        if plan.changed_fields.is_empty() {
            plan.changed_fields = ["title", "description", "status", "priority", "owner"]
                .into_iter()
                .filter(|f| local.field(f).is_some_and(|v| !v.is_empty()))
                .map(String::from)
                .collect();
        }
        if opts.dry_run {
            return Ok(());
        }

        if record.external_id.is_empty() {
            let created = tasks.create_task(ctx, &outbound).await?;
            debug!(task_id = %record.task_id, external_id = %created.id, "created external task");
            plan.created_external_id = Some(created.id);
        } else {
            tasks
                .update_task(ctx, &record.external_id, &outbound)
                .await?;
        }
        plan.pushed = true;
        Ok(())
    }

    fn record_failure(&self, record: &SyncRecord, err: &ZenError) {
        let policy = RetryPolicy::default();
        let backoff = policy.delay(record.error_count.saturating_add(1));
        let retry_after = Utc::now()
            + chrono::Duration::from_std(backoff).unwrap_or_else(|_| chrono::Duration::seconds(5));
        let mut next = record.clone();
        next.mark_failure(&err.to_string(), retry_after);
        if let Err(e) = self.persist(&next, record.version) {
            warn!(task_id = %record.task_id, error = %e, "could not record sync failure");
        }
    }

    /// Sync every linked task, continuing past failures. `opts.parallel`
    /// tasks run at once; results keep record order.
    pub async fn sync_all_tasks(&self, ctx: &Context, opts: &SyncOptions) -> Result<Vec<SyncResult>> {
        let records = self.list_sync_records()?;
        let parallel = opts.parallel.max(1);
        let batch = if opts.batch_size == 0 {
            records.len().max(1)
        } else {
            opts.batch_size
        };
        info!(tasks = records.len(), parallel, "syncing all tasks");

        let mut results = Vec::with_capacity(records.len());
        for chunk in records.chunks(batch) {
            if ctx.is_done() {
                break;
            }
            let batch_results: Vec<SyncResult> = stream::iter(chunk.iter())
                .map(|r| self.sync_task(ctx, &r.task_id, opts))
                .buffered(parallel)
                .collect()
                .await;
            results.extend(batch_results);
        }
        Ok(results)
    }

    // ─── Conflicts ───────────────────────────────────────────────────

    fn park_conflicts(&self, task_id: &str, conflicts: Vec<FieldConflict>) -> Result<()> {
        let record = ConflictRecord::pending(task_id, conflicts);
        self.conflict_cache
            .put(task_id, &record, PutOptions::default())
            .map_err(|e| ZenError::from(e).with_task(task_id))?;
        self.write().conflicts.insert(task_id.to_string(), record);
        Ok(())
    }

    pub fn list_conflicts(&self) -> Vec<ConflictRecord> {
        let mut out: Vec<ConflictRecord> = self.read().conflicts.values().cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    pub fn get_conflict(&self, task_id: &str) -> Result<ConflictRecord> {
        self.read()
            .conflicts
            .get(task_id)
            .cloned()
            .ok_or_else(|| {
                ZenError::not_found(format!("no conflict recorded for task '{task_id}'"))
                    .with_task(task_id)
            })
    }

    /// Close a pending conflict as resolved or ignored. The task's sync
    /// record leaves the `conflict` status.
    pub fn resolve_conflict(
        &self,
        task_id: &str,
        resolved_by: &str,
        status: ConflictStatus,
    ) -> Result<ConflictRecord> {
        if status == ConflictStatus::Pending {
            return Err(ZenError::invalid_operation(
                "a conflict can only be resolved or ignored",
            ));
        }
        let mut conflict = self.get_conflict(task_id)?;
        if conflict.status != ConflictStatus::Pending {
            return Err(ZenError::invalid_operation(format!(
                "conflict for task '{task_id}' is already {}",
                conflict.status
            ))
            .with_task(task_id));
        }
        conflict.status = status;
        conflict.resolved_by = Some(resolved_by.to_string());
        conflict.resolved_at = Some(Utc::now());
        self.conflict_cache
            .put(task_id, &conflict, PutOptions::default())
            .map_err(|e| ZenError::from(e).with_task(task_id))?;
        self.write()
            .conflicts
            .insert(task_id.to_string(), conflict.clone());

        if let Ok(record) = self.get_sync_record(task_id) {
            if record.status == zen_core::types::SyncStatus::Conflict {
                let mut next = record.clone();
                next.status = zen_core::types::SyncStatus::Active;
                next.touch();
                self.persist(&next, record.version)?;
            }
        }
        info!(task_id, status = %status, by = resolved_by, "conflict closed");
        Ok(conflict)
    }

    // ─── Health & metrics ────────────────────────────────────────────

    pub fn metrics(&self) -> SyncMetrics {
        self.metrics.snapshot()
    }

    pub fn get_provider_health(&self, name: &str) -> Option<ProviderHealth> {
        self.read().health.get(name).cloned()
    }

    pub fn get_all_provider_health(&self) -> Vec<ProviderHealth> {
        self.read().health.values().cloned().collect()
    }

    /// Probe every registered provider once. Probes bypass the breaker but
    /// only run when the provider's bucket has spare capacity; skipped
    /// providers keep their previous record.
    pub async fn check_all_health(&self, ctx: &Context) -> Vec<ProviderHealth> {
        let targets: Vec<(String, Arc<dyn Provider>, Arc<TokenBucket>)> = {
            let state = self.read();
            state
                .providers
                .iter()
                .filter_map(|(name, p)| {
                    state
                        .limiters
                        .get(name)
                        .map(|l| (name.clone(), p.clone(), l.clone()))
                })
                .collect()
        };

        let mut out = Vec::with_capacity(targets.len());
        for (name, provider, limiter) in targets {
            if !limiter.allow_spare() {
                debug!(provider = %name, "skipping health probe, no spare rate capacity");
                if let Some(prev) = self.get_provider_health(&name) {
                    out.push(prev);
                }
                continue;
            }
            let probe = match probe_provider(ctx, &name, provider.as_ref()).await {
                Some(p) => p,
                None => break,
            };
            let folded = {
                let mut state = self.write();
                let folded = health::fold(state.health.get(&name), probe);
                state.health.insert(name.clone(), folded.clone());
                folded
            };
            if !folded.healthy {
                warn!(
                    provider = %name,
                    failures = folded.consecutive_failures,
                    error = folded.error.as_deref().unwrap_or(""),
                    "provider unhealthy"
                );
            }
            out.push(folded);
        }
        out
    }

    /// Start probing every `interval`. A running monitor is replaced.
    pub async fn start_health_monitor(self: &Arc<Self>, interval: Duration) {
        let previous = {
            let mut slot = self.monitor.lock().unwrap_or_else(|e| e.into_inner());
            slot.replace(HealthMonitor::spawn(Arc::downgrade(self), interval))
        };
        if let Some(m) = previous {
            m.stop().await;
        }
    }

    /// Stop the health monitor and flush the caches.
    pub async fn close(&self) -> Result<()> {
        let monitor = self
            .monitor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(m) = monitor {
            m.stop().await;
        }
        self.records.close()?;
        self.conflict_cache.close()?;
        Ok(())
    }
}

/// Health of one provider. `None` when the context was cancelled.
async fn probe_provider(ctx: &Context, name: &str, provider: &dyn Provider) -> Option<ProviderHealth> {
    if let Some(tasks) = provider.as_task_provider() {
        return match tasks.health_check(ctx).await {
            Ok(h) => Some(h),
            Err(e) if e.is(ErrorCode::Canceled) => None,
            Err(e) => Some(unhealthy(name, e.to_string(), 0)),
        };
    }
    let start = Instant::now();
    match provider.info(ctx).await {
        Ok(info) => Some(ProviderHealth {
            provider: name.to_string(),
            healthy: info.available,
            last_check: Utc::now(),
            latency_ms: start.elapsed().as_millis() as u64,
            error: info.reason,
            consecutive_failures: 0,
        }),
        Err(e) if e.is(ErrorCode::Canceled) => None,
        Err(e) => Some(unhealthy(name, e.to_string(), start.elapsed().as_millis() as u64)),
    }
}

fn unhealthy(name: &str, error: String, latency_ms: u64) -> ProviderHealth {
    ProviderHealth {
        provider: name.to_string(),
        healthy: false,
        last_check: Utc::now(),
        latency_ms,
        error: Some(error),
        consecutive_failures: 0,
    }
}

/// Overlay fields projected through a record's own mapping onto the
/// adapter's conversion.
fn apply_record_mappings(
    remote: &mut InternalTaskData,
    payload: &zen_core::types::FieldMap,
    mappings: &BTreeMap<String, String>,
) -> Result<()> {
    if mappings.is_empty() {
        return Ok(());
    }
    let projected = mapper::map_fields(Some(payload), Some(mappings))?;
    for field in SYNC_FIELDS {
        let Some(value) = projected.get(*field) else {
            continue;
        };
        let text = match value {
            Value::String(s) => s.clone(),
            Value::Null => continue,
            other => other.to_string(),
        };
        let text = match *field {
            "status" => vocab::normalize_status(&text),
            "priority" => vocab::normalize_priority(&text),
            _ => text,
        };
        remote.set_field(field, &text);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;
    use zen_core::mapper::FieldMapping;
    use zen_core::store::MemoryTaskStore;
    use zen_core::types::{
        ExternalTaskData, ProviderInfo, ProviderKind, RateLimitInfo, SyncStatus,
    };
    use zen_core::ExecResult;
    use zen_provider::adapters::{to_external, to_internal};
    use zen_provider::{OutputStream, Params};

    /// Task provider whose `get_task` answers come from a script.
    #[derive(Default)]
    struct Scripted {
        remote: Mutex<ExternalTaskData>,
        failures: Mutex<VecDeque<ZenError>>,
        get_calls: AtomicU32,
        create_calls: AtomicU32,
        update_calls: AtomicU32,
        healthy: bool,
        on_get: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    }

    impl Scripted {
        fn with_remote(title: &str, updated: DateTime<Utc>) -> Self {
            Self {
                remote: Mutex::new(ExternalTaskData {
                    id: "X1".into(),
                    title: title.into(),
                    status: "open".into(),
                    updated: Some(updated),
                    ..Default::default()
                }),
                healthy: true,
                ..Default::default()
            }
        }

        fn fail_next(self, errors: impl IntoIterator<Item = ZenError>) -> Self {
            self.failures.lock().unwrap().extend(errors);
            self
        }

        fn next_failure(&self) -> Option<ZenError> {
            self.failures.lock().unwrap().pop_front()
        }
    }

    #[async_trait]
    impl Provider for Scripted {
        fn name(&self) -> &str {
            "tracker"
        }

        async fn info(&self, _ctx: &Context) -> Result<ProviderInfo> {
            Ok(ProviderInfo::new("tracker", ProviderKind::Api))
        }

        async fn execute(&self, _ctx: &Context, _op: &str, _params: &Params) -> Result<ExecResult> {
            Ok(ExecResult::default())
        }

        async fn stream(&self, _ctx: &Context, _op: &str, _params: &Params) -> Result<OutputStream> {
            Ok(OutputStream::from_text("", 0))
        }

        fn as_task_provider(&self) -> Option<&dyn TaskProvider> {
            Some(self)
        }
    }

    #[async_trait]
    impl TaskProvider for Scripted {
        async fn get_task(&self, _ctx: &Context, id: &str) -> Result<ExternalTaskData> {
            self.get_calls.fetch_add(1, Ordering::SeqCst);
            let hook = self.on_get.lock().unwrap().take();
            if let Some(hook) = hook {
                hook();
            }
            if let Some(e) = self.next_failure() {
                return Err(e);
            }
            let mut t = self.remote.lock().unwrap().clone();
            t.id = id.to_string();
            Ok(t)
        }

        async fn create_task(&self, _ctx: &Context, task: &ExternalTaskData) -> Result<ExternalTaskData> {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            Ok(ExternalTaskData {
                id: "NEW-1".into(),
                ..task.clone()
            })
        }

        async fn update_task(
            &self,
            _ctx: &Context,
            id: &str,
            task: &ExternalTaskData,
        ) -> Result<ExternalTaskData> {
            self.update_calls.fetch_add(1, Ordering::SeqCst);
            *self.remote.lock().unwrap() = task.clone();
            Ok(ExternalTaskData {
                id: id.to_string(),
                ..task.clone()
            })
        }

        async fn search_tasks(&self, _ctx: &Context, _q: &Params) -> Result<Vec<ExternalTaskData>> {
            Ok(Vec::new())
        }

        async fn validate_connection(&self, _ctx: &Context) -> Result<()> {
            Ok(())
        }

        fn get_field_mapping(&self) -> FieldMapping {
            mapper::get_default_mapping("tracker")
        }

        fn map_to_internal(&self, task: &ExternalTaskData) -> Result<InternalTaskData> {
            Ok(to_internal("tracker", task))
        }

        fn map_to_external(&self, task: &InternalTaskData) -> Result<ExternalTaskData> {
            Ok(to_external("tracker", task))
        }

        async fn health_check(&self, _ctx: &Context) -> Result<ProviderHealth> {
            Ok(ProviderHealth {
                provider: "tracker".into(),
                healthy: self.healthy,
                last_check: Utc::now(),
                latency_ms: 1,
                error: (!self.healthy).then(|| "down".into()),
                consecutive_failures: 0,
            })
        }

        async fn get_rate_limit_info(&self, _ctx: &Context) -> Result<RateLimitInfo> {
            Ok(RateLimitInfo::default())
        }
    }

    struct Fixture {
        _dir: TempDir,
        engine: Arc<SyncEngine>,
        store: Arc<MemoryTaskStore>,
        provider: Arc<Scripted>,
    }

    fn config() -> IntegrationConfig {
        IntegrationConfig {
            task_system: "tracker".into(),
            sync_enabled: true,
            ..Default::default()
        }
    }

    fn fixture(provider: Scripted, local: Option<InternalTaskData>) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryTaskStore::with_tasks(local));
        let engine = SyncEngine::new(config(), dir.path(), store.clone()).unwrap();
        let provider = Arc::new(provider);
        engine.register_provider(provider.clone()).unwrap();
        Fixture {
            _dir: dir,
            engine: Arc::new(engine),
            store,
            provider,
        }
    }

    fn local_task(title: &str, updated: DateTime<Utc>) -> InternalTaskData {
        let mut t = InternalTaskData::new("T1", title);
        t.updated = updated;
        t
    }

    fn link(engine: &SyncEngine, external_id: &str) {
        engine
            .create_sync_record(&SyncRecord::new("T1", external_id, "tracker"))
            .unwrap();
    }

    fn opts(direction: SyncDirection, strategy: ConflictStrategy) -> SyncOptions {
        SyncOptions {
            direction: Some(direction),
            conflict_strategy: Some(strategy),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn pull_with_newer_remote_updates_local_and_bumps_version() {
        let now = Utc::now();
        let f = fixture(
            Scripted::with_remote("New", now),
            Some(local_task("Old", now - chrono::Duration::hours(1))),
        );
        link(&f.engine, "X1");

        let res = f
            .engine
            .sync_task(
                &Context::background(),
                "T1",
                &opts(SyncDirection::Pull, ConflictStrategy::Timestamp),
            )
            .await;
        assert!(res.success, "{:?}", res.error);
        assert_eq!(res.changed_fields, vec!["title"]);
        assert_eq!(f.store.get("T1").unwrap().title, "New");
        let record = f.engine.get_sync_record("T1").unwrap();
        assert_eq!(record.version, 2);
        assert_eq!(record.status, SyncStatus::Active);
        assert!(record.last_sync_time.is_some());
        assert_eq!(
            record.data_hash.as_deref(),
            Some(f.store.get("T1").unwrap().content_hash().as_str())
        );
        assert_eq!(res.correlation_id.len(), 32);
    }

    #[tokio::test]
    async fn unreported_remote_fields_keep_local_values() {
        let now = Utc::now();
        let provider = Scripted::with_remote("New", now);
        provider.remote.lock().unwrap().status = String::new();
        let mut local = local_task("Old", now - chrono::Duration::hours(1));
        local.priority = "P0".into();
        local.status = "in_progress".into();
        let f = fixture(provider, Some(local));
        link(&f.engine, "X1");

        let res = f
            .engine
            .sync_task(
                &Context::background(),
                "T1",
                &opts(SyncDirection::Pull, ConflictStrategy::Timestamp),
            )
            .await;
        assert!(res.success, "{:?}", res.error);
        assert_eq!(res.changed_fields, vec!["title"]);
        let stored = f.store.get("T1").unwrap();
        assert_eq!(stored.title, "New");
        assert_eq!(stored.priority, "P0");
        assert_eq!(stored.status, "in_progress");
    }

    #[tokio::test]
    async fn pull_into_missing_local_task_applies_defaults() {
        let provider = Scripted::with_remote("Fresh", Utc::now());
        provider.remote.lock().unwrap().status = String::new();
        let f = fixture(provider, None);
        link(&f.engine, "X1");

        let res = f
            .engine
            .sync_task(
                &Context::background(),
                "T1",
                &opts(SyncDirection::Pull, ConflictStrategy::Timestamp),
            )
            .await;
        assert!(res.success, "{:?}", res.error);
        assert_eq!(res.changed_fields, vec!["title"]);
        let stored = f.store.get("T1").unwrap();
        assert_eq!(stored.status, "not_started");
        assert_eq!(stored.priority, "P2");
    }

    #[tokio::test]
    async fn record_bumped_mid_sync_leaves_local_task_untouched() {
        let now = Utc::now();
        let f = fixture(
            Scripted::with_remote("New", now),
            Some(local_task("Old", now - chrono::Duration::hours(1))),
        );
        link(&f.engine, "X1");
        let engine = f.engine.clone();
        *f.provider.on_get.lock().unwrap() = Some(Box::new(move || {
            let record = engine.get_sync_record("T1").unwrap();
            engine.update_sync_record(&record).unwrap();
        }));

        let result = f
            .engine
            .sync_task(
                &Context::background(),
                "T1",
                &opts(SyncDirection::Pull, ConflictStrategy::Timestamp),
            )
            .await;

        assert!(!result.success);
        assert_eq!(result.error_code, Some(ErrorCode::VersionMismatch));
        assert_eq!(f.store.get("T1").unwrap().title, "Old");
        let record = f.engine.get_sync_record("T1").unwrap();
        assert_eq!(record.version, 2);
        assert!(record.last_sync_time.is_none());
    }

    #[tokio::test]
    async fn transient_timeouts_are_retried() {
        let now = Utc::now();
        let provider = Scripted::with_remote("New", now).fail_next([
            ZenError::timeout("slow"),
            ZenError::timeout("slow"),
        ]);
        let f = fixture(provider, Some(local_task("Old", now - chrono::Duration::hours(1))));
        link(&f.engine, "X1");
        let mut o = opts(SyncDirection::Pull, ConflictStrategy::Timestamp);
        o.retry_count = Some(3);

        let res = f.engine.sync_task(&Context::background(), "T1", &o).await;
        assert!(res.success, "{:?}", res.error);
        assert_eq!(f.provider.get_calls.load(Ordering::SeqCst), 3);
        assert_eq!(f.engine.circuit_state("tracker"), Some(CircuitState::Closed));
    }

    #[tokio::test]
    async fn breaker_opens_after_five_failures_and_short_circuits() {
        let provider = Scripted::with_remote("x", Utc::now())
            .fail_next((0..5).map(|_| ZenError::provider("HTTP 503")));
        let f = fixture(provider, Some(local_task("x", Utc::now())));
        link(&f.engine, "X1");
        let mut o = opts(SyncDirection::Pull, ConflictStrategy::Timestamp);
        o.retry_count = Some(0);
        let ctx = Context::background();

        for _ in 0..5 {
            let r = f.engine.sync_task(&ctx, "T1", &o).await;
            assert!(!r.success);
        }
        assert_eq!(f.provider.get_calls.load(Ordering::SeqCst), 5);

        let r = f.engine.sync_task(&ctx, "T1", &o).await;
        assert!(!r.success);
        assert_eq!(r.error_code, Some(ErrorCode::ProviderError));
        assert!(r.retryable);
        assert_eq!(r.error.as_deref(), Some("circuit breaker open"));
        assert_eq!(f.provider.get_calls.load(Ordering::SeqCst), 5);

        let record = f.engine.get_sync_record("T1").unwrap();
        assert_eq!(record.status, SyncStatus::Error);
        assert_eq!(record.error_count, 5);
        assert!(record.retry_after.is_some());
    }

    #[tokio::test]
    async fn manual_review_parks_conflict_without_writes() {
        let now = Utc::now();
        let f = fixture(
            Scripted::with_remote("Remote title", now),
            Some(local_task("Local title", now - chrono::Duration::hours(1))),
        );
        link(&f.engine, "X1");

        let res = f
            .engine
            .sync_task(
                &Context::background(),
                "T1",
                &opts(SyncDirection::Bidirectional, ConflictStrategy::ManualReview),
            )
            .await;
        assert!(!res.success);
        assert_eq!(res.error_code, Some(ErrorCode::SyncConflict));
        assert!(!res.retryable);
        assert_eq!(res.conflicts.len(), 1);
        assert_eq!(res.conflicts[0].field, "title");
        assert_eq!(f.provider.update_calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.store.get("T1").unwrap().title, "Local title");

        let parked = f.engine.get_conflict("T1").unwrap();
        assert_eq!(parked.status, ConflictStatus::Pending);
        assert_eq!(
            f.engine.get_sync_record("T1").unwrap().status,
            SyncStatus::Conflict
        );

        let closed = f
            .engine
            .resolve_conflict("T1", "ana", ConflictStatus::Resolved)
            .unwrap();
        assert_eq!(closed.resolved_by.as_deref(), Some("ana"));
        assert_eq!(
            f.engine.get_sync_record("T1").unwrap().status,
            SyncStatus::Active
        );
        assert!(f
            .engine
            .resolve_conflict("T1", "ana", ConflictStatus::Ignored)
            .is_err());
    }

    #[tokio::test]
    async fn conflicts_survive_reopen() {
        let now = Utc::now();
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryTaskStore::with_tasks([local_task(
            "Mine",
            now - chrono::Duration::hours(1),
        )]));
        {
            let engine = SyncEngine::new(config(), dir.path(), store.clone()).unwrap();
            engine
                .register_provider(Arc::new(Scripted::with_remote("Theirs", now)))
                .unwrap();
            engine
                .create_sync_record(&SyncRecord::new("T1", "X1", "tracker"))
                .unwrap();
            let o = opts(SyncDirection::Pull, ConflictStrategy::ManualReview);
            engine.sync_task(&Context::background(), "T1", &o).await;
            engine.close().await.unwrap();
        }
        let engine = SyncEngine::new(config(), dir.path(), store).unwrap();
        assert_eq!(engine.list_conflicts().len(), 1);
    }

    #[tokio::test]
    async fn local_wins_keeps_local_content() {
        let now = Utc::now();
        let f = fixture(
            Scripted::with_remote("B", now),
            Some(local_task("A", now - chrono::Duration::hours(1))),
        );
        link(&f.engine, "X1");
        let res = f
            .engine
            .sync_task(
                &Context::background(),
                "T1",
                &opts(SyncDirection::Pull, ConflictStrategy::LocalWins),
            )
            .await;
        assert!(res.success);
        assert!(res.changed_fields.is_empty());
        assert_eq!(res.conflicts.len(), 1);
        assert_eq!(f.store.get("T1").unwrap().title, "A");
    }

    #[tokio::test]
    async fn push_creates_and_records_external_id() {
        let f = fixture(
            Scripted::with_remote("unused", Utc::now()),
            Some(local_task("Ship it", Utc::now())),
        );
        link(&f.engine, "");
        let res = f
            .engine
            .sync_task(
                &Context::background(),
                "T1",
                &opts(SyncDirection::Push, ConflictStrategy::LocalWins),
            )
            .await;
        assert!(res.success, "{:?}", res.error);
        assert_eq!(res.external_id, "NEW-1");
        assert_eq!(f.provider.create_calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.engine.get_sync_record("T1").unwrap().external_id, "NEW-1");
    }

    #[tokio::test]
    async fn unchanged_push_is_skipped_unless_forced() {
        let f = fixture(
            Scripted::with_remote("unused", Utc::now()),
            Some(local_task("Same", Utc::now())),
        );
        let mut record = SyncRecord::new("T1", "X1", "tracker");
        record.data_hash = Some(f.store.get("T1").unwrap().content_hash());
        f.engine.create_sync_record(&record).unwrap();
        let ctx = Context::background();

        let mut o = opts(SyncDirection::Push, ConflictStrategy::LocalWins);
        let res = f.engine.sync_task(&ctx, "T1", &o).await;
        assert!(res.success);
        assert_eq!(f.provider.update_calls.load(Ordering::SeqCst), 0);

        o.force_sync = true;
        let res = f.engine.sync_task(&ctx, "T1", &o).await;
        assert!(res.success);
        assert_eq!(f.provider.update_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dry_run_writes_nothing() {
        let now = Utc::now();
        let f = fixture(
            Scripted::with_remote("New", now),
            Some(local_task("Old", now - chrono::Duration::hours(1))),
        );
        link(&f.engine, "X1");
        let mut o = opts(SyncDirection::Bidirectional, ConflictStrategy::RemoteWins);
        o.dry_run = true;
        let res = f.engine.sync_task(&Context::background(), "T1", &o).await;
        assert!(res.success);
        assert_eq!(res.changed_fields, vec!["title"]);
        assert_eq!(res.metadata["dry_run"], Value::Bool(true));
        assert_eq!(f.store.get("T1").unwrap().title, "Old");
        assert_eq!(f.provider.update_calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.engine.get_sync_record("T1").unwrap().version, 1);
    }

    #[tokio::test]
    async fn guards_report_configuration_and_missing_records() {
        let dir = TempDir::new().unwrap();
        let engine = SyncEngine::new(
            IntegrationConfig::default(),
            dir.path(),
            Arc::new(MemoryTaskStore::new()),
        )
        .unwrap();
        let ctx = Context::background();
        let r = engine.sync_task(&ctx, "T1", &SyncOptions::default()).await;
        assert_eq!(r.error_code, Some(ErrorCode::ConfigError));
        assert_eq!(r.error.as_deref(), Some("integration not configured"));

        let f = fixture(Scripted::with_remote("x", Utc::now()), None);
        let r = f.engine.sync_task(&ctx, "missing", &SyncOptions::default()).await;
        assert_eq!(r.error_code, Some(ErrorCode::NotFound));

        let mut record = SyncRecord::new("T2", "X2", "elsewhere");
        record.sync_direction = SyncDirection::Pull;
        f.engine.create_sync_record(&record).unwrap();
        let r = f.engine.sync_task(&ctx, "T2", &SyncOptions::default()).await;
        assert_eq!(r.error_code, Some(ErrorCode::ProviderError));
        assert!(!r.retryable);
    }

    #[tokio::test]
    async fn pull_into_missing_local_task_creates_it() {
        let f = fixture(Scripted::with_remote("Fresh", Utc::now()), None);
        link(&f.engine, "X1");
        let res = f
            .engine
            .sync_task(
                &Context::background(),
                "T1",
                &opts(SyncDirection::Pull, ConflictStrategy::Timestamp),
            )
            .await;
        assert!(res.success, "{:?}", res.error);
        let local = f.store.get("T1").unwrap();
        assert_eq!(local.title, "Fresh");
        assert_eq!(local.metadata["external_id"], Value::String("X1".into()));
        assert!(res.changed_fields.contains(&"title".to_string()));
    }

    #[tokio::test]
    async fn record_crud_and_version_check() {
        let f = fixture(Scripted::with_remote("x", Utc::now()), None);
        link(&f.engine, "X1");
        let err = f
            .engine
            .create_sync_record(&SyncRecord::new("T1", "X9", "tracker"))
            .unwrap_err();
        assert!(err.is(ErrorCode::AlreadyExists));

        let stale = f.engine.get_sync_record("T1").unwrap();
        let updated = f.engine.update_sync_record(&stale).unwrap();
        assert_eq!(updated.version, 2);
        let err = f.engine.update_sync_record(&stale).unwrap_err();
        assert!(err.is(ErrorCode::VersionMismatch));

        assert_eq!(f.engine.list_sync_records().unwrap().len(), 1);
        f.engine.delete_sync_record("T1").unwrap();
        assert!(f.engine.get_sync_record("T1").unwrap_err().is(ErrorCode::NotFound));
        assert!(f.engine.list_sync_records().unwrap().is_empty());
    }

    #[tokio::test]
    async fn sync_all_continues_past_failures() {
        let now = Utc::now();
        let f = fixture(
            Scripted::with_remote("New", now),
            Some(local_task("Old", now - chrono::Duration::hours(1))),
        );
        link(&f.engine, "X1");
        let mut broken = SyncRecord::new("T0", "X0", "nowhere");
        broken.sync_direction = SyncDirection::Pull;
        f.engine.create_sync_record(&broken).unwrap();

        let mut o = opts(SyncDirection::Pull, ConflictStrategy::Timestamp);
        o.parallel = 2;
        let results = f.engine.sync_all_tasks(&Context::background(), &o).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].task_id, "T0");
        assert!(!results[0].success);
        assert!(results[1].success);
        let m = f.engine.metrics();
        assert_eq!(m.sync_operations, 2);
        assert_eq!(m.failed_syncs, 1);
    }

    #[tokio::test]
    async fn registration_rules() {
        let f = fixture(Scripted::with_remote("x", Utc::now()), None);
        let err = f
            .engine
            .register_provider(Arc::new(Scripted::default()))
            .unwrap_err();
        assert!(err.is(ErrorCode::AlreadyExists));
        assert_eq!(f.engine.list_providers(), vec!["tracker"]);
        assert!(f.engine.get_provider("tracker").is_ok());
        assert!(f.engine.get_provider("nope").is_err());
        assert!(f.engine.is_configured());
        assert_eq!(f.engine.get_task_system(), "tracker");
        assert!(f.engine.is_sync_enabled());
    }

    #[tokio::test]
    async fn health_checks_are_stored_and_monitor_stops() {
        let f = fixture(Scripted::with_remote("x", Utc::now()), None);
        let checked = f.engine.check_all_health(&Context::background()).await;
        assert_eq!(checked.len(), 1);
        assert!(checked[0].healthy);
        assert!(f.engine.get_provider_health("tracker").is_some());
        assert_eq!(f.engine.get_all_provider_health().len(), 1);

        f.engine.start_health_monitor(Duration::from_millis(10)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        f.engine.close().await.unwrap();
    }
}
