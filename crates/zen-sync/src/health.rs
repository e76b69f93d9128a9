//! Periodic provider health probing.

use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use zen_core::types::ProviderHealth;
use zen_core::Context;

use crate::engine::SyncEngine;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// Fold a fresh probe into the previous record for the same provider.
pub(crate) fn fold(previous: Option<&ProviderHealth>, mut probe: ProviderHealth) -> ProviderHealth {
    probe.consecutive_failures = if probe.healthy {
        0
    } else {
        previous.map_or(0, |p| p.consecutive_failures) + 1
    };
    probe
}

/// Background task probing every registered provider on an interval.
/// Holds only a weak reference, so dropping the engine ends the loop too.
#[derive(Debug)]
pub(crate) struct HealthMonitor {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl HealthMonitor {
    pub(crate) fn spawn(engine: Weak<SyncEngine>, interval: Duration) -> Self {
        let token = CancellationToken::new();
        let stop = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(engine) = engine.upgrade() else { break };
                        let ctx = Context::background().with_timeout(interval);
                        let checked = engine.check_all_health(&ctx).await;
                        debug!(providers = checked.len(), "health probe round finished");
                    }
                }
            }
        });
        Self { token, handle }
    }

    pub(crate) async fn stop(self) {
        self.token.cancel();
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn probe(healthy: bool) -> ProviderHealth {
        ProviderHealth {
            provider: "jira".into(),
            healthy,
            last_check: Utc::now(),
            latency_ms: 3,
            error: (!healthy).then(|| "down".to_string()),
            consecutive_failures: 0,
        }
    }

    #[test]
    fn failures_accumulate_and_reset() {
        let first = fold(None, probe(false));
        assert_eq!(first.consecutive_failures, 1);
        let second = fold(Some(&first), probe(false));
        assert_eq!(second.consecutive_failures, 2);
        let ok = fold(Some(&second), probe(true));
        assert_eq!(ok.consecutive_failures, 0);
    }
}
