//! The progress tracker.
//!
//! The pipeline takes tens of minutes and prints a banner when it enters
//! each stage. We tail the child's output line by line, match the banners
//! against an ordered marker table, and keep a monotone percent estimate
//! plus a bounded preview of recent log lines. The estimate is advisory;
//! only the child's exit code decides success.

use std::collections::VecDeque;
use std::sync::{Mutex, OnceLock};

use regex::Regex;

use argpipe_common::db::Pool;
use argpipe_common::prelude::*;
use tracing::warn;

/// How many log lines the preview ring retains.
const PREVIEW_LINES: usize = 200;

/// A stage banner we recognize in the pipeline's output.
pub struct PhaseMarker {
    pattern: Regex,
    /// Phase name from the closed vocabulary exposed in `current_step`.
    pub phase: &'static str,
    /// Cumulative percent when the pipeline enters this phase.
    pub percent: i32,
}

/// The marker table, in pipeline order. The first marker (in this order)
/// that matches a line wins; later stages naturally overtake earlier ones
/// because the percent estimate only ever grows.
pub fn phase_markers() -> &'static [PhaseMarker] {
    static MARKERS: OnceLock<Vec<PhaseMarker>> = OnceLock::new();
    MARKERS.get_or_init(|| {
        let marker = |pattern: &str, phase, percent| PhaseMarker {
            pattern: Regex::new(pattern).unwrap(),
            phase,
            percent,
        };
        vec![
            marker(
                r"(?i)\b(prefetch|fasterq-dump|sra download|downloading)\b",
                "downloading",
                10,
            ),
            marker(
                r"(?i)\b(fastqc|fastp|quality control)\b",
                "quality_control",
                20,
            ),
            marker(r"(?i)\b(spades|assembly|assembling)\b", "assembly", 40),
            marker(r"(?i)\b(prokka|annotation|annotating)\b", "annotation", 60),
            marker(
                r"(?i)\b(amrfinder|abricate|rgi|arg detection|resistance screening)\b",
                "arg_detection",
                80,
            ),
            marker(
                r"(?i)\b(snippy|variant calling)\b",
                "variant_calling",
                85,
            ),
            marker(
                r"(?i)\b(generating reports?|report generation)\b",
                "reporting",
                90,
            ),
            marker(r"(?i)\bfinalizing\b", "finalizing", 95),
            marker(
                r"(?i)\bpipeline completed successfully\b",
                "finalizing",
                100,
            ),
        ]
    })
}

/// The in-memory progress state of one running job.
pub struct ProgressEstimate {
    ring: VecDeque<String>,
    percent: i32,
    step: &'static str,
}

impl ProgressEstimate {
    /// A fresh estimate: nothing seen yet.
    pub fn new() -> ProgressEstimate {
        ProgressEstimate {
            ring: VecDeque::with_capacity(PREVIEW_LINES),
            percent: 0,
            step: "initializing",
        }
    }

    /// Consume one log line. Returns true when a marker advanced the
    /// phase or percent.
    pub fn observe_line(&mut self, line: &str) -> bool {
        if self.ring.len() == PREVIEW_LINES {
            self.ring.pop_front();
        }
        self.ring.push_back(line.to_string());

        for marker in phase_markers() {
            if marker.pattern.is_match(line) {
                let advanced =
                    marker.percent > self.percent || marker.phase != self.step;
                self.step = marker.phase;
                self.percent = self.percent.max(marker.percent);
                return advanced;
            }
        }
        false
    }

    /// The current percent estimate.
    pub fn percent(&self) -> i32 {
        self.percent
    }

    /// The phase the estimate is currently in.
    pub fn step(&self) -> &'static str {
        self.step
    }

    /// The retained log tail, newline-joined.
    pub fn preview(&self) -> String {
        let lines: Vec<&str> = self.ring.iter().map(String::as_str).collect();
        lines.join("\n")
    }
}

impl Default for ProgressEstimate {
    fn default() -> Self {
        ProgressEstimate::new()
    }
}

/// Feeds a job's log lines into the store.
///
/// Shared by the stdout and stderr reader threads of one child; the
/// mutex keeps their interleaved lines consistent. Store failures are
/// logged and swallowed so a transient database hiccup never kills the
/// readers mid-run.
pub struct ProgressTracker {
    job_id: String,
    pool: Pool,
    state: Mutex<ProgressEstimate>,
}

impl ProgressTracker {
    /// Create a tracker for `job_id`.
    pub fn new(job_id: String, pool: Pool) -> ProgressTracker {
        ProgressTracker {
            job_id,
            pool,
            state: Mutex::new(ProgressEstimate::new()),
        }
    }

    /// Consume one log line and merge the updated estimate into the
    /// job row.
    pub fn observe_line(&self, line: &str) {
        let (percent, step, preview) = {
            let mut state = self.state.lock().expect("progress state poisoned");
            state.observe_line(line);
            (state.percent(), state.step(), state.preview())
        };

        let result = self.pool.get().map_err(anyhow::Error::new).and_then(|mut conn| {
            Job::update_progress(&self.job_id, percent, step, &preview, &mut conn)
                .map_err(anyhow::Error::new)
        });
        if let Err(err) = result {
            warn!(
                "could not record progress for job {}: {}",
                self.job_id, err
            );
        }
    }

    /// The current log tail.
    pub fn preview(&self) -> String {
        self.state.lock().expect("progress state poisoned").preview()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_initializing_at_zero() {
        let estimate = ProgressEstimate::new();
        assert_eq!(estimate.percent(), 0);
        assert_eq!(estimate.step(), "initializing");
    }

    #[test]
    fn markers_advance_phase_and_percent() {
        let mut estimate = ProgressEstimate::new();
        assert!(estimate.observe_line("[INFO] Downloading SRR28083254 with prefetch"));
        assert_eq!(estimate.step(), "downloading");
        assert_eq!(estimate.percent(), 10);

        assert!(estimate.observe_line("[INFO] Running SPAdes assembly"));
        assert_eq!(estimate.step(), "assembly");
        assert_eq!(estimate.percent(), 40);
    }

    #[test]
    fn percent_never_regresses() {
        let mut estimate = ProgressEstimate::new();
        estimate.observe_line("Prokka annotation started");
        assert_eq!(estimate.percent(), 60);

        // A late quality-control line moves the phase but not the percent.
        estimate.observe_line("fastp re-run on trimmed reads");
        assert_eq!(estimate.step(), "quality_control");
        assert_eq!(estimate.percent(), 60);
    }

    #[test]
    fn first_marker_in_table_order_wins() {
        let mut estimate = ProgressEstimate::new();
        // Mentions both fastp (20) and SPAdes (40); the table orders
        // quality_control first.
        estimate.observe_line("handing fastp output to SPAdes");
        assert_eq!(estimate.step(), "quality_control");
        assert_eq!(estimate.percent(), 20);
    }

    #[test]
    fn unmatched_lines_only_feed_the_preview() {
        let mut estimate = ProgressEstimate::new();
        assert!(!estimate.observe_line("plain chatter"));
        assert_eq!(estimate.step(), "initializing");
        assert_eq!(estimate.percent(), 0);
        assert_eq!(estimate.preview(), "plain chatter");
    }

    #[test]
    fn preview_ring_is_bounded() {
        let mut estimate = ProgressEstimate::new();
        for i in 0..(PREVIEW_LINES + 50) {
            estimate.observe_line(&format!("line {}", i));
        }
        let preview = estimate.preview();
        let lines: Vec<&str> = preview.lines().collect();
        assert_eq!(lines.len(), PREVIEW_LINES);
        assert_eq!(lines[0], "line 50");
        assert_eq!(lines[lines.len() - 1], format!("line {}", PREVIEW_LINES + 49));
    }

    #[test]
    fn success_banner_reaches_one_hundred() {
        let mut estimate = ProgressEstimate::new();
        estimate.observe_line("Pipeline completed successfully in 42m");
        assert_eq!(estimate.step(), "finalizing");
        assert_eq!(estimate.percent(), 100);
    }
}
