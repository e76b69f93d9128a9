use std::time::Duration;

use clap::Subcommand;
use tracing::debug;

use zen_core::cache::PutOptions;
use zen_core::types::{ProviderHealth, ProviderInfo, ProviderKind};
use zen_core::{ErrorCode, ZenError};
use zen_provider::adapters::jira;
use zen_provider::discovery::DEFAULT_MEMO_TTL;

use crate::app::App;
use crate::output::{print_structured, print_table, Reported};
use crate::providers;

/// Upper bound for one provider's info or health probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Subcommand)]
pub enum ProvidersSubcommand {
    /// Show every known provider and whether it is usable
    List {
        /// Ignore cached provider info
        #[arg(long)]
        refresh: bool,
    },

    /// Probe every usable provider once
    Health,
}

pub async fn run(app: &App, subcmd: ProvidersSubcommand) -> anyhow::Result<()> {
    match subcmd {
        ProvidersSubcommand::List { refresh } => list(app, refresh).await,
        ProvidersSubcommand::Health => health(app).await,
    }
}

fn kind_of(name: &str) -> ProviderKind {
    if name == jira::NAME {
        ProviderKind::Api
    } else {
        ProviderKind::Cli
    }
}

fn cache_key(name: &str) -> String {
    format!("providers.{name}")
}

// ---------------------------------------------------------------------------
// list
// ---------------------------------------------------------------------------

async fn list(app: &App, refresh: bool) -> anyhow::Result<()> {
    let engine = app.open_engine()?;
    let skipped = providers::register_all(&engine, &app.config.integration, &app.root);
    let cache = app.open_cache()?;

    let mut infos: Vec<ProviderInfo> = skipped
        .into_iter()
        .map(|(name, e)| ProviderInfo::new(&name, kind_of(&name)).unavailable(e.message))
        .collect();

    for name in engine.list_providers() {
        let key = cache_key(&name);
        if !refresh {
            let cached = cache
                .get(&key)
                .ok()
                .and_then(|c| serde_json::from_value::<ProviderInfo>(c.data).ok());
            if let Some(info) = cached {
                debug!(provider = %name, "provider info from cache");
                infos.push(info);
                continue;
            }
        }

        let provider = engine.get_provider(&name)?;
        let ctx = app.ctx.with_timeout(PROBE_TIMEOUT);
        let info = match provider.info(&ctx).await {
            Ok(info) => info,
            Err(e) if e.is(ErrorCode::Canceled) => return Err(e.into()),
            Err(e) => ProviderInfo::new(&name, kind_of(&name)).unavailable(e.message),
        };
        cache.put(&key, &serde_json::to_value(&info)?, PutOptions::ttl(DEFAULT_MEMO_TTL))?;
        infos.push(info);
    }
    infos.sort_by(|a, b| a.name.cmp(&b.name));

    if app.format.is_structured() {
        return print_structured(app.format, &infos);
    }
    let rows = infos
        .iter()
        .map(|i| {
            let detail = i
                .reason
                .clone()
                .or_else(|| i.base_url.clone())
                .or_else(|| i.binary_path.as_ref().map(|p| p.display().to_string()))
                .unwrap_or_default();
            vec![
                i.name.clone(),
                i.kind.to_string(),
                i.version.clone().unwrap_or_else(|| "-".to_string()),
                if i.available { "yes" } else { "no" }.to_string(),
                detail,
            ]
        })
        .collect();
    print_table(&["NAME", "KIND", "VERSION", "AVAILABLE", "DETAIL"], rows);
    Ok(())
}

// ---------------------------------------------------------------------------
// health
// ---------------------------------------------------------------------------

async fn health(app: &App) -> anyhow::Result<()> {
    let engine = app.open_engine()?;
    let integration = &app.config.integration;
    let skipped = providers::register_all(&engine, integration, &app.root);

    let ctx = app.ctx.with_timeout(PROBE_TIMEOUT);
    let mut report: Vec<ProviderHealth> = engine.check_all_health(&ctx).await;
    // Providers the user asked for but that could not be built count as down.
    for (name, e) in skipped {
        if integration.providers.contains_key(&name) || name == integration.task_system {
            report.push(ProviderHealth {
                provider: name,
                healthy: false,
                last_check: chrono::Utc::now(),
                latency_ms: 0,
                error: Some(e.message),
                consecutive_failures: 1,
            });
        }
    }
    report.sort_by(|a, b| a.provider.cmp(&b.provider));

    if app.format.is_structured() {
        print_structured(app.format, &report)?;
    } else if report.is_empty() {
        println!("No providers to probe.");
    } else {
        let rows = report
            .iter()
            .map(|h| {
                vec![
                    h.provider.clone(),
                    if h.healthy { "healthy" } else { "unhealthy" }.to_string(),
                    format!("{} ms", h.latency_ms),
                    h.error.clone().unwrap_or_default(),
                ]
            })
            .collect();
        print_table(&["PROVIDER", "STATUS", "LATENCY", "ERROR"], rows);
    }

    let down: Vec<&str> = report
        .iter()
        .filter(|h| !h.healthy)
        .map(|h| h.provider.as_str())
        .collect();
    if down.is_empty() {
        return Ok(());
    }
    let err = ZenError::provider(format!("unhealthy: {}", down.join(", "))).retryable(false);
    if app.format.is_structured() {
        Err(Reported(err).into())
    } else {
        Err(err.into())
    }
}
