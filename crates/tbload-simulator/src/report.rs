//! Run report generation.

use crate::aggregator::Metrics;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tbload_core::{ConnectionMode, DeviceCategory, EnvelopeKind, PhaseState};

/// Latency statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub count: u64,
    pub min_us: u64,
    pub max_us: u64,
    pub mean_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
}

impl LatencyStats {
    /// Formats latency as a human-readable string.
    pub fn format_ms(&self) -> String {
        if self.count == 0 {
            "N/A".to_string()
        } else {
            format!(
                "p50={:.1}ms p95={:.1}ms p99={:.1}ms max={:.1}ms",
                self.p50_us as f64 / 1000.0,
                self.p95_us as f64 / 1000.0,
                self.p99_us as f64 / 1000.0,
                self.max_us as f64 / 1000.0
            )
        }
    }
}

/// How a phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Completed,
    /// Disabled by the plan, or not reached after a cancellation
    Skipped,
    Cancelled,
    Failed,
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PhaseStatus::Completed => "completed",
            PhaseStatus::Skipped => "skipped",
            PhaseStatus::Cancelled => "cancelled",
            PhaseStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseReport {
    pub phase: PhaseState,
    pub status: PhaseStatus,
    pub duration: Duration,
    /// Attempts made, counting bounded phase retries
    pub attempts: u32,
    pub error: Option<String>,
    /// Snapshot taken when the phase ended
    pub metrics: Metrics,
}

/// Complete load test report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    // Plan
    pub mode: ConnectionMode,
    pub payload: String,
    pub device_count: usize,
    pub client_count: usize,
    pub duration: Duration,
    pub target_rate: f64,
    pub tolerance: f64,
    pub alarm_rate: f64,
    pub categories: BTreeMap<DeviceCategory, usize>,

    // Outcome
    pub final_state: PhaseState,
    pub error: Option<String>,
    pub phases: Vec<PhaseReport>,
    pub excluded_clients: Vec<String>,
    /// Time spent in RUN
    pub run_elapsed: Duration,
    pub total_duration: Duration,
    pub metrics: Metrics,
}

impl RunReport {
    /// Telemetry messages a perfect run would publish (R·D).
    pub fn expected_messages(&self) -> f64 {
        self.target_rate * self.duration.as_secs_f64()
    }

    /// Acknowledged telemetry per second of planned run time.
    pub fn achieved_rate(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.metrics.acked_of(EnvelopeKind::Telemetry) as f64 / secs
        } else {
            0.0
        }
    }

    /// `actual / R·D`
    pub fn rate_ratio(&self) -> f64 {
        let expected = self.expected_messages();
        if expected > 0.0 {
            self.metrics.acked_of(EnvelopeKind::Telemetry) as f64 / expected
        } else {
            0.0
        }
    }

    pub fn within_tolerance(&self) -> bool {
        (self.rate_ratio() - 1.0).abs() <= self.tolerance
    }

    pub fn phase(&self, phase: PhaseState) -> Option<&PhaseReport> {
        self.phases.iter().find(|p| p.phase == phase)
    }

    pub fn is_success(&self) -> bool {
        self.final_state == PhaseState::Done
    }

    /// Process exit code: 0 on DONE, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }

    /// Generates a markdown report.
    pub fn to_markdown(&self) -> String {
        let m = &self.metrics;
        let mut md = String::new();

        md.push_str("# Telemetry Load Test Report\n\n");

        md.push_str("## Configuration\n\n");
        md.push_str("| Setting | Value |\n");
        md.push_str("|---------|-------|\n");
        md.push_str(&format!("| Mode | {} |\n", self.mode));
        md.push_str(&format!("| Payload | {} |\n", self.payload));
        md.push_str(&format!("| Devices | {} |\n", format_number(self.device_count as u64)));
        md.push_str(&format!("| Connections | {} |\n", self.client_count));
        md.push_str(&format!("| Duration | {:.1}s |\n", self.duration.as_secs_f64()));
        md.push_str(&format!("| Target Rate | {:.1} msg/s |\n", self.target_rate));
        md.push_str(&format!("| Alarm Rate | {:.2}/s |\n", self.alarm_rate));
        md.push_str(&format!("| Tolerance | {:.0}% |\n", self.tolerance * 100.0));
        md.push('\n');

        if !self.categories.is_empty() {
            md.push_str("### Device Categories\n\n");
            md.push_str("| Category | Devices |\n");
            md.push_str("|----------|---------|\n");
            for (category, count) in &self.categories {
                md.push_str(&format!("| {} | {} |\n", category, count));
            }
            md.push('\n');
        }

        md.push_str("## Phases\n\n");
        md.push_str("| Phase | Status | Duration | Attempts | Error |\n");
        md.push_str("|-------|--------|----------|----------|-------|\n");
        for phase in &self.phases {
            md.push_str(&format!(
                "| {} | {} | {:.2}s | {} | {} |\n",
                phase.phase.as_str().to_uppercase(),
                phase.status,
                phase.duration.as_secs_f64(),
                phase.attempts,
                phase.error.as_deref().unwrap_or("-")
            ));
        }
        md.push('\n');

        md.push_str("## Publishing\n\n");
        md.push_str("| Metric | Value |\n");
        md.push_str("|--------|-------|\n");
        md.push_str(&format!("| Sent | {} |\n", format_number(m.sent)));
        md.push_str(&format!("| Acked | {} |\n", format_number(m.acked)));
        md.push_str(&format!("| Failed | {} |\n", format_number(m.failed)));
        for (kind, count) in &m.failed_by_kind {
            md.push_str(&format!("| Failed ({}) | {} |\n", kind.as_str(), count));
        }
        md.push_str(&format!("| Retries | {} |\n", m.retries));
        md.push_str(&format!("| Dropped | {} |\n", m.dropped));
        if m.throttled > 0 {
            md.push_str(&format!("| Throttled | {} |\n", m.throttled));
        }
        md.push_str(&format!("| Alarms Injected | {} |\n", m.alarms_injected));
        for (kind, count) in &m.acked_by_envelope {
            md.push_str(&format!("| {} Envelopes | {} |\n", kind, format_number(*count)));
        }
        md.push_str(&format!(
            "| Achieved Rate | {:.1} msg/s ({:.1}% of target) |\n",
            self.achieved_rate(),
            self.rate_ratio() * 100.0
        ));
        md.push('\n');

        md.push_str("### Publish Latency\n\n");
        md.push_str("| Percentile | Latency |\n");
        md.push_str("|------------|--------|\n");
        if m.latency.count > 0 {
            md.push_str(&format!("| p50 | {:.2}ms |\n", m.latency.p50_us as f64 / 1000.0));
            md.push_str(&format!("| p95 | {:.2}ms |\n", m.latency.p95_us as f64 / 1000.0));
            md.push_str(&format!("| p99 | {:.2}ms |\n", m.latency.p99_us as f64 / 1000.0));
            md.push_str(&format!("| max | {:.2}ms |\n", m.latency.max_us as f64 / 1000.0));
        } else {
            md.push_str("| N/A | No data |\n");
        }
        md.push('\n');

        md.push_str("## Connections\n\n");
        md.push_str("| Metric | Value |\n");
        md.push_str("|--------|-------|\n");
        md.push_str(&format!("| Entities Provisioned | {} |\n", m.entities_provisioned));
        md.push_str(&format!("| Relations Created | {} |\n", m.relations_created));
        md.push_str(&format!("| Relation Failures | {} |\n", m.relations_failed));
        md.push_str(&format!("| Connections Opened | {} |\n", m.connections_opened));
        md.push_str(&format!("| Connect Retries | {} |\n", m.connect_retries));
        md.push_str(&format!("| Connect Failures | {} |\n", m.connect_failures));
        md.push_str(&format!("| Cleanup Failures | {} |\n", m.cleanup_failures));
        md.push('\n');

        if !self.excluded_clients.is_empty() {
            md.push_str(&format!(
                "Excluded clients: {}\n\n",
                self.excluded_clients.join(", ")
            ));
        }

        md.push_str("## Summary\n\n");
        md.push_str(&format!(
            "Final state: **{}** after {:.1}s\n\n",
            self.final_state.as_str().to_uppercase(),
            self.total_duration.as_secs_f64()
        ));
        if let Some(error) = &self.error {
            md.push_str(&format!("Error: {}\n\n", error));
        }
        if self.is_success() && self.within_tolerance() && m.failed == 0 {
            md.push_str("✅ **Target rate reached without errors**\n");
        } else if self.is_success() {
            md.push_str("⚠️ **Run completed with failures or outside rate tolerance**\n");
        } else {
            md.push_str("❌ **Run failed**\n");
        }

        md
    }

    /// Generates a JSON report.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Write the markdown report, and the JSON one when asked, for the
    /// output base `output`. Returns the paths written.
    pub fn save(&self, output: &Path, json: bool) -> std::io::Result<Vec<PathBuf>> {
        let (markdown_path, json_path) = output_paths(output);
        std::fs::write(&markdown_path, self.to_markdown())?;
        let mut written = vec![markdown_path];
        if json {
            std::fs::write(&json_path, self.to_json())?;
            written.push(json_path);
        }
        Ok(written)
    }

    /// Prints a summary to stdout.
    pub fn print_summary(&self) {
        let m = &self.metrics;
        println!("\n{}", "=".repeat(60));
        println!("LOAD TEST RESULTS");
        println!("{}", "=".repeat(60));

        println!(
            "\nMode: {} | Devices: {} | Connections: {} | Duration: {:.1}s",
            self.mode,
            self.device_count,
            self.client_count,
            self.duration.as_secs_f64()
        );

        println!("\nPHASES:");
        for phase in &self.phases {
            match &phase.error {
                Some(error) => println!(
                    "   {:<10} {:<10} {:>8.2}s  {}",
                    phase.phase.as_str().to_uppercase(),
                    phase.status,
                    phase.duration.as_secs_f64(),
                    error
                ),
                None => println!(
                    "   {:<10} {:<10} {:>8.2}s",
                    phase.phase.as_str().to_uppercase(),
                    phase.status,
                    phase.duration.as_secs_f64()
                ),
            }
        }

        println!("\nPUBLISHING:");
        println!(
            "   Sent: {} | Acked: {} | Failed: {} | Dropped: {}",
            format_number(m.sent),
            format_number(m.acked),
            format_number(m.failed),
            format_number(m.dropped)
        );
        if m.throttled > 0 {
            println!("   Throttled: {} (rate budget no target could take)", format_number(m.throttled));
        }
        println!(
            "   Rate: {:.1}/{:.1} msg/s ({:.1}%{})",
            self.achieved_rate(),
            self.target_rate,
            self.rate_ratio() * 100.0,
            if self.within_tolerance() { "" } else { ", outside tolerance" }
        );
        println!("   Latency: {}", m.latency.format_ms());
        println!("   Alarms injected: {}", m.alarms_injected);

        println!("\nCONNECTIONS:");
        println!(
            "   Opened: {} | Retries: {} | Failures: {}",
            m.connections_opened, m.connect_retries, m.connect_failures
        );

        println!("\nFinal state: {}", self.final_state.as_str().to_uppercase());
        if let Some(error) = &self.error {
            println!("Error: {}", error);
        }
        println!("{}", "=".repeat(60));
    }
}

/// Markdown and JSON paths for an output base: `run` and `run.md` both give
/// `run.md` and `run.json`.
pub fn output_paths(output: &Path) -> (PathBuf, PathBuf) {
    let markdown = if output.extension().is_some_and(|ext| ext == "md") {
        output.to_path_buf()
    } else {
        let mut name = output.as_os_str().to_owned();
        name.push(".md");
        PathBuf::from(name)
    };
    let json = markdown.with_extension("json");
    (markdown, json)
}

/// Formats a number with thousand separators.
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::new();
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(acked: u64, final_state: PhaseState) -> RunReport {
        let mut metrics = Metrics::default();
        metrics.acked_by_envelope.insert(EnvelopeKind::Telemetry, acked);
        metrics.acked = acked;
        metrics.sent = acked;

        RunReport {
            mode: ConnectionMode::Direct,
            payload: "ffu".to_string(),
            device_count: 10,
            client_count: 10,
            duration: Duration::from_secs(5),
            target_rate: 10.0,
            tolerance: 0.1,
            alarm_rate: 0.0,
            categories: BTreeMap::new(),
            final_state,
            error: None,
            phases: vec![PhaseReport {
                phase: PhaseState::Run,
                status: PhaseStatus::Completed,
                duration: Duration::from_secs(5),
                attempts: 1,
                error: None,
                metrics: Metrics::default(),
            }],
            excluded_clients: Vec::new(),
            run_elapsed: Duration::from_secs(5),
            total_duration: Duration::from_secs(6),
            metrics,
        }
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(123), "123");
        assert_eq!(format_number(1234), "1,234");
        assert_eq!(format_number(1234567), "1,234,567");
    }

    #[test]
    fn test_rate_tolerance() {
        let exact = report(50, PhaseState::Done);
        assert_eq!(exact.expected_messages(), 50.0);
        assert_eq!(exact.achieved_rate(), 10.0);
        assert!(exact.within_tolerance());

        assert!(report(46, PhaseState::Done).within_tolerance());
        assert!(!report(44, PhaseState::Done).within_tolerance());
    }

    #[test]
    fn test_exit_code() {
        assert_eq!(report(50, PhaseState::Done).exit_code(), 0);
        assert_eq!(report(50, PhaseState::Failed).exit_code(), 1);
    }

    #[test]
    fn test_markdown_and_json() {
        let report = report(50, PhaseState::Done);
        let md = report.to_markdown();
        assert!(md.contains("| RUN | completed |"));
        assert!(md.contains("Final state: **DONE**"));

        let json: serde_json::Value = serde_json::from_str(&report.to_json()).unwrap();
        assert_eq!(json["final_state"], "done");
        assert_eq!(json["metrics"]["acked"], 50);
    }

    #[test]
    fn test_output_paths() {
        let paths = |s: &str| {
            let (md, json) = output_paths(Path::new(s));
            (md.display().to_string(), json.display().to_string())
        };
        assert_eq!(paths("report"), ("report.md".into(), "report.json".into()));
        assert_eq!(paths("out/run.md"), ("out/run.md".into(), "out/run.json".into()));
        assert_eq!(paths("run.v2"), ("run.v2.md".into(), "run.v2.json".into()));
        // only the file name's extension is touched
        assert_eq!(
            paths("notes.md.d/run"),
            ("notes.md.d/run.md".into(), "notes.md.d/run.json".into())
        );
    }

    #[test]
    fn test_save_writes_requested_formats() {
        let dir = tempfile::tempdir().unwrap();
        let report = report(50, PhaseState::Done);

        let written = report.save(&dir.path().join("nightly"), false).unwrap();
        assert_eq!(written, vec![dir.path().join("nightly.md")]);
        assert!(!dir.path().join("nightly.json").exists());

        let written = report.save(&dir.path().join("nightly.md"), true).unwrap();
        assert_eq!(written.len(), 2);
        let json = std::fs::read_to_string(dir.path().join("nightly.json")).unwrap();
        assert!(json.contains("\"final_state\": \"done\""));
        let md = std::fs::read_to_string(&written[0]).unwrap();
        assert!(md.contains("Final state: **DONE**"));
    }
}
