use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Subcommand;

use zen_core::cache::FsCache;
use zen_core::types::{ConflictStrategy, SyncDirection, SyncRecord};
use zen_core::{ErrorCode, ZenError};
use zen_sync::{SyncEngine, SyncOptions, SyncResult};

use crate::app::App;
use crate::output::{print_structured, print_table, Reported};

// ---------------------------------------------------------------------------
// Subcommand types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum SyncSubcommand {
    /// Synchronize one linked task with its external counterpart
    Task {
        /// Local task id
        id: String,
        /// pull, push or bidirectional (defaults to the link's direction)
        #[arg(long)]
        direction: Option<SyncDirection>,
        /// local_wins, remote_wins, manual_review or timestamp
        #[arg(long)]
        strategy: Option<ConflictStrategy>,
        /// Compute changes without writing anything
        #[arg(long)]
        dry_run: bool,
        /// Push even when the local content hash is unchanged
        #[arg(long)]
        force: bool,
        /// Overall deadline in seconds
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
        /// Retries after the first attempt
        #[arg(long, value_name = "N")]
        retries: Option<u32>,
    },

    /// Synchronize every linked task
    All {
        #[arg(long)]
        direction: Option<SyncDirection>,
        #[arg(long)]
        strategy: Option<ConflictStrategy>,
        #[arg(long)]
        dry_run: bool,
        /// Tasks synchronized concurrently
        #[arg(long, default_value_t = 1)]
        parallel: usize,
        /// Tasks per batch (0 = all at once)
        #[arg(long, default_value_t = 0)]
        batch_size: usize,
    },

    /// Show every sync link and its state
    Status,

    /// Link a local task to an external one
    Link {
        task_id: String,
        external_id: String,
        /// External system (defaults to integration.task_system)
        #[arg(long)]
        system: Option<String>,
        #[arg(long)]
        direction: Option<SyncDirection>,
        #[arg(long)]
        strategy: Option<ConflictStrategy>,
    },

    /// Remove a task's sync link
    Unlink { task_id: String },
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run(app: &App, subcmd: SyncSubcommand) -> anyhow::Result<()> {
    match subcmd {
        SyncSubcommand::Task {
            id,
            direction,
            strategy,
            dry_run,
            force,
            timeout,
            retries,
        } => {
            let opts = SyncOptions {
                direction,
                conflict_strategy: strategy,
                dry_run,
                force_sync: force,
                timeout: timeout.map(Duration::from_secs),
                retry_count: retries,
                ..Default::default()
            };
            sync_one(app, &id, &opts).await
        }
        SyncSubcommand::All {
            direction,
            strategy,
            dry_run,
            parallel,
            batch_size,
        } => {
            let opts = SyncOptions {
                direction,
                conflict_strategy: strategy,
                dry_run,
                parallel,
                batch_size,
                ..Default::default()
            };
            sync_all(app, &opts).await
        }
        SyncSubcommand::Status => status(app),
        SyncSubcommand::Link {
            task_id,
            external_id,
            system,
            direction,
            strategy,
        } => link(app, &task_id, &external_id, system, direction, strategy),
        SyncSubcommand::Unlink { task_id } => unlink(app, &task_id),
    }
}

/// Refuse to talk to providers unless integration is set up and enabled.
fn require_sync(engine: &SyncEngine) -> Result<(), ZenError> {
    if !engine.is_configured() {
        return Err(ZenError::config("integration not configured")
            .with_hint("set integration.task_system in .zen/config.yaml"));
    }
    if !engine.is_sync_enabled() {
        return Err(ZenError::config("sync is disabled")
            .with_hint("set integration.sync_enabled: true in .zen/config.yaml"));
    }
    Ok(())
}

fn result_error(r: &SyncResult) -> ZenError {
    let code = r.error_code.unwrap_or(ErrorCode::ExecutionFailed);
    let message = r.error.clone().unwrap_or_else(|| "sync failed".to_string());
    let err = ZenError::new(code, message)
        .with_task(&r.task_id)
        .retryable(r.retryable);
    if code == ErrorCode::SyncConflict {
        err.with_hint("run `zen conflicts list`")
    } else {
        err
    }
}

// ---------------------------------------------------------------------------
// sync task
// ---------------------------------------------------------------------------

async fn sync_one(app: &App, id: &str, opts: &SyncOptions) -> anyhow::Result<()> {
    let engine = app.connect_engine()?;
    require_sync(&engine)?;

    let result = engine.sync_task(&app.ctx, id, opts).await;
    engine.close().await.context("failed to flush sync state")?;

    if app.format.is_structured() {
        print_structured(app.format, &result)?;
        if !result.success {
            return Err(Reported(result_error(&result)).into());
        }
        return Ok(());
    }

    if !result.conflicts.is_empty() {
        print_conflicts(&result);
    }
    if !result.success {
        return Err(result_error(&result).into());
    }

    let verb = if opts.dry_run { "would sync" } else { "synced" };
    let direction = result.direction.map(|d| d.to_string()).unwrap_or_default();
    println!(
        "{verb} {} <-> {} ({direction}, {} ms)",
        result.task_id,
        result.external_id,
        result.duration.as_millis()
    );
    if result.changed_fields.is_empty() {
        println!("  no changes");
    } else {
        println!("  changed: {}", result.changed_fields.join(", "));
    }
    Ok(())
}

fn print_conflicts(result: &SyncResult) {
    let rows = result
        .conflicts
        .iter()
        .map(|c| {
            vec![
                c.field.clone(),
                c.local_value.clone(),
                c.external_value.clone(),
                c.resolution
                    .map(|r| format!("{r:?}").to_lowercase())
                    .unwrap_or_else(|| "pending".to_string()),
            ]
        })
        .collect();
    print_table(&["FIELD", "LOCAL", "EXTERNAL", "RESOLUTION"], rows);
    println!();
}

// ---------------------------------------------------------------------------
// sync all
// ---------------------------------------------------------------------------

async fn sync_all(app: &App, opts: &SyncOptions) -> anyhow::Result<()> {
    let engine = app.connect_engine()?;
    require_sync(&engine)?;

    let interval = app.config.integration.health_interval();
    if !interval.is_zero() {
        engine.start_health_monitor(interval).await;
    }
    let sweep = app.ctx.child();
    let cleanup = match app.config.cache.cleanup_interval() {
        d if d.is_zero() => None,
        d => Some(FsCache::spawn_cleanup(Arc::new(app.open_cache()?), d, sweep.clone())),
    };

    let results = engine.sync_all_tasks(&app.ctx, opts).await;
    sweep.cancel();
    if let Some(handle) = cleanup {
        let _ = handle.await;
    }
    engine.close().await.context("failed to flush sync state")?;
    let results = results?;

    let failed: Vec<&SyncResult> = results.iter().filter(|r| !r.success).collect();

    if app.format.is_structured() {
        let value = serde_json::json!({
            "results": results,
            "metrics": engine.metrics(),
        });
        print_structured(app.format, &value)?;
    } else if results.is_empty() {
        println!("No linked tasks. Use `zen sync link <task-id> <external-id>`.");
    } else {
        let rows = results
            .iter()
            .map(|r| {
                vec![
                    r.task_id.clone(),
                    r.external_id.clone(),
                    if r.success { "ok" } else { "failed" }.to_string(),
                    r.changed_fields.join(","),
                    r.error.clone().unwrap_or_default(),
                ]
            })
            .collect();
        print_table(&["TASK", "EXTERNAL", "RESULT", "CHANGED", "ERROR"], rows);
        println!(
            "\n{} synced, {} failed",
            results.len() - failed.len(),
            failed.len()
        );
    }

    if failed.is_empty() {
        return Ok(());
    }
    let code = if failed
        .iter()
        .any(|r| r.error_code == Some(ErrorCode::SyncConflict))
    {
        ErrorCode::SyncConflict
    } else {
        failed[0].error_code.unwrap_or(ErrorCode::ExecutionFailed)
    };
    let err = ZenError::new(
        code,
        format!("{} of {} tasks failed to sync", failed.len(), results.len()),
    );
    if app.format.is_structured() {
        Err(Reported(err).into())
    } else {
        Err(err.into())
    }
}

// ---------------------------------------------------------------------------
// status / link / unlink
// ---------------------------------------------------------------------------

fn status(app: &App) -> anyhow::Result<()> {
    let engine = app.open_engine()?;
    let records = engine.list_sync_records()?;

    if app.format.is_structured() {
        let value = serde_json::json!({
            "task_system": engine.get_task_system(),
            "sync_enabled": engine.is_sync_enabled(),
            "records": records,
        });
        return print_structured(app.format, &value);
    }

    println!(
        "task system: {}  sync: {}",
        engine.get_task_system(),
        if engine.is_sync_enabled() { "enabled" } else { "disabled" }
    );
    if records.is_empty() {
        println!("No linked tasks.");
        return Ok(());
    }
    println!();
    let rows = records
        .iter()
        .map(|r| {
            vec![
                r.task_id.clone(),
                r.external_id.clone(),
                r.external_system.clone(),
                r.sync_direction.to_string(),
                r.status.to_string(),
                r.last_sync_time
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "never".to_string()),
                r.last_error.clone().unwrap_or_default(),
            ]
        })
        .collect();
    print_table(
        &["TASK", "EXTERNAL", "SYSTEM", "DIRECTION", "STATUS", "LAST SYNC", "ERROR"],
        rows,
    );
    Ok(())
}

fn link(
    app: &App,
    task_id: &str,
    external_id: &str,
    system: Option<String>,
    direction: Option<SyncDirection>,
    strategy: Option<ConflictStrategy>,
) -> anyhow::Result<()> {
    let engine = app.open_engine()?;
    let system = match system {
        Some(s) => s,
        None if engine.is_configured() => engine.get_task_system().to_string(),
        None => {
            return Err(ZenError::config("no external system given and no task_system configured")
                .with_hint("pass --system or set integration.task_system")
                .into())
        }
    };

    let mut record = SyncRecord::new(task_id, external_id, &system);
    if let Some(d) = direction {
        record.sync_direction = d;
    }
    if let Some(s) = strategy {
        record.conflict_strategy = s;
    }
    if let Some(section) = app.config.integration.provider(&system) {
        record.field_mappings = section.field_mappings.clone();
    }
    engine.create_sync_record(&record)?;

    if app.format.is_structured() {
        return print_structured(app.format, &record);
    }
    println!(
        "linked {task_id} -> {external_id} ({system}, {}, {})",
        record.sync_direction, record.conflict_strategy
    );
    Ok(())
}

fn unlink(app: &App, task_id: &str) -> anyhow::Result<()> {
    let engine = app.open_engine()?;
    engine.delete_sync_record(task_id)?;
    if app.format.is_structured() {
        return print_structured(app.format, &serde_json::json!({ "unlinked": task_id }));
    }
    println!("unlinked {task_id}");
    Ok(())
}
