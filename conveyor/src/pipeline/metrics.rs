use crate::pipeline::StageMode;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone)]
pub struct StageMetrics {
    pub index: usize,
    pub name: String,
    pub mode: StageMode,
    pub workers: usize,
    /// Jobs taken from the upstream hand-off channel (invocations, for stage 0).
    pub jobs_received: u64,
    /// Results forwarded downstream, or discarded by the last stage.
    pub jobs_emitted: u64,
    pub failures: u64,
}

#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    pub total_duration_ms: u128,
    pub stages: Vec<StageMetrics>,
}

impl PipelineMetrics {
    pub fn stage(&self, name: &str) -> Option<&StageMetrics> {
        self.stages.iter().find(|stage| stage.name == name)
    }

    pub fn total_failures(&self) -> u64 {
        self.stages.iter().map(|stage| stage.failures).sum()
    }
}

/// Lock-free counters updated by stage workers.
#[derive(Debug, Default)]
pub(crate) struct StageMetricsStorage {
    jobs_received: AtomicU64,
    jobs_emitted: AtomicU64,
    failures: AtomicU64,
}

impl StageMetricsStorage {
    pub(crate) fn record_received(&self) {
        self.jobs_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_emitted(&self) {
        self.jobs_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(
        &self,
        index: usize,
        name: &str,
        mode: StageMode,
        workers: usize,
    ) -> StageMetrics {
        StageMetrics {
            index,
            name: name.to_string(),
            mode,
            workers,
            jobs_received: self.jobs_received.load(Ordering::Relaxed),
            jobs_emitted: self.jobs_emitted.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}
