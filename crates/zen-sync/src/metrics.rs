use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Weight of the newest sample in `average_latency_ms`.
pub const LATENCY_ALPHA: f64 = 0.2;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncMetrics {
    pub sync_operations: u64,
    pub successful_syncs: u64,
    pub failed_syncs: u64,
    pub conflicts_detected: u64,
    pub average_latency_ms: f64,
}

impl SyncMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.sync_operations == 0 {
            0.0
        } else {
            self.successful_syncs as f64 / self.sync_operations as f64
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct MetricsRecorder {
    inner: Mutex<SyncMetrics>,
}

impl MetricsRecorder {
    pub(crate) fn record(&self, success: bool, latency: Duration, conflicts: usize) {
        let mut m = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let sample = latency.as_micros() as f64 / 1000.0;
        m.average_latency_ms = if m.sync_operations == 0 {
            sample
        } else {
            LATENCY_ALPHA * sample + (1.0 - LATENCY_ALPHA) * m.average_latency_ms
        };
        m.sync_operations += 1;
        if success {
            m.successful_syncs += 1;
        } else {
            m.failed_syncs += 1;
        }
        m.conflicts_detected += conflicts as u64;
    }

    pub(crate) fn snapshot(&self) -> SyncMetrics {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
