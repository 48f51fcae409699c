use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub stages: BTreeMap<String, StageMetrics>,
    pub total_duration_ms: f64,
    pub files_copied: u64,
    pub files_stripped: u64,
    pub builds_succeeded: u64,
    pub builds_failed: u64,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct StageMetrics {
    pub calls: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsSnapshot::default())),
        }
    }

    pub fn start_stage(&self, stage_name: &str) -> StageTimer {
        StageTimer {
            stage: stage_name.to_string(),
            started_at: Instant::now(),
            collector: self.inner.clone(),
            recorded: false,
        }
    }

    pub fn record_total_duration(&self, duration: Duration) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.total_duration_ms = duration.as_secs_f64() * 1_000.0;
        }
    }

    pub fn record_files(&self, copied: usize, stripped: usize) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.files_copied += copied as u64;
            guard.files_stripped += stripped as u64;
        }
    }

    pub fn record_success(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.builds_succeeded += 1;
        }
    }

    pub fn record_failure(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.builds_failed += 1;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn reset(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            *guard = MetricsSnapshot::default();
        }
    }
}

/// Records the elapsed time of one stage when dropped, including when the
/// stage returns early with an error.
pub struct StageTimer {
    stage: String,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
    recorded: bool,
}

impl StageTimer {
    fn record(&mut self) {
        if self.recorded {
            return;
        }
        let duration = self.started_at.elapsed();
        if let Ok(mut guard) = self.collector.lock() {
            let metrics = guard.stages.entry(self.stage.clone()).or_default();
            metrics.calls += 1;
            let duration_ms = duration.as_secs_f64() * 1_000.0;
            metrics.total_duration_ms += duration_ms;
            if duration_ms > metrics.max_duration_ms {
                metrics.max_duration_ms = duration_ms;
            }
        }
        debug!(
            stage = self.stage.as_str(),
            duration_ms = duration.as_secs_f64() * 1_000.0,
            "Stage duration recorded"
        );
        self.recorded = true;
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        self.record();
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        total_duration_ms = snapshot.total_duration_ms,
        stage_count = snapshot.stages.len(),
        files_copied = snapshot.files_copied,
        files_stripped = snapshot.files_stripped,
        "Build metrics summary"
    );
    for (stage, metrics) in &snapshot.stages {
        info!(
            stage = stage.as_str(),
            calls = metrics.calls,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Stage metrics"
        );
    }
}

impl MetricsSnapshot {
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        push_counter(
            &mut output,
            "slimstage_builds_succeeded_total",
            "Builds that produced an artifact",
            self.builds_succeeded,
        );
        push_counter(
            &mut output,
            "slimstage_builds_failed_total",
            "Builds that failed without promoting an artifact",
            self.builds_failed,
        );
        push_counter(
            &mut output,
            "slimstage_files_copied_total",
            "Files copied into final stages",
            self.files_copied,
        );
        push_counter(
            &mut output,
            "slimstage_files_stripped_total",
            "Environment paths removed by the strip policy",
            self.files_stripped,
        );
        output.push_str("# HELP slimstage_stage_calls_total Stage invocation count\n");
        output.push_str("# TYPE slimstage_stage_calls_total counter\n");
        output.push_str(
            "# HELP slimstage_stage_duration_seconds_total Accumulated stage duration in seconds\n",
        );
        output.push_str("# TYPE slimstage_stage_duration_seconds_total counter\n");
        output.push_str(
            "# HELP slimstage_stage_duration_seconds_max Maximum stage duration in seconds\n",
        );
        output.push_str("# TYPE slimstage_stage_duration_seconds_max gauge\n");
        for (stage, metrics) in &self.stages {
            output.push_str(&format!(
                "slimstage_stage_calls_total{{stage=\"{}\"}} {}\n",
                stage, metrics.calls
            ));
            output.push_str(&format!(
                "slimstage_stage_duration_seconds_total{{stage=\"{}\"}} {:.6}\n",
                stage,
                metrics.total_duration_ms / 1_000.0
            ));
            output.push_str(&format!(
                "slimstage_stage_duration_seconds_max{{stage=\"{}\"}} {:.6}\n",
                stage,
                metrics.max_duration_ms / 1_000.0
            ));
        }
        output.push_str("# HELP slimstage_build_duration_seconds Total build duration\n");
        output.push_str("# TYPE slimstage_build_duration_seconds gauge\n");
        output.push_str(&format!(
            "slimstage_build_duration_seconds {:.6}\n",
            self.total_duration_ms / 1_000.0
        ));
        output
    }
}

fn push_counter(output: &mut String, name: &str, help: &str, value: u64) {
    output.push_str(&format!("# HELP {name} {help}\n"));
    output.push_str(&format!("# TYPE {name} counter\n"));
    output.push_str(&format!("{name} {value}\n"));
}
