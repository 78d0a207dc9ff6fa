//! Snapshot spacing diagnostics

use log::debug;
use shared::mean_and_stdev;
use std::collections::VecDeque;

const MAX_SAMPLES: usize = 80;
const REPORT_INTERVAL_MS: f64 = 4000.0;
/// Fewer samples than this are not worth reporting.
const MIN_REPORT_SAMPLES: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpacingReport {
    pub avg_ms: f64,
    pub stdev_ms: f64,
    pub samples: usize,
}

/// Rolling window of inter-snapshot spacing
#[derive(Debug, Clone)]
pub struct SpacingStats {
    // Historical data storage
    history: VecDeque<f64>,
    max_samples: usize,
    report_interval_ms: f64,
    last_report_at: Option<f64>,
}

impl SpacingStats {
    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(MAX_SAMPLES),
            max_samples: MAX_SAMPLES,
            report_interval_ms: REPORT_INTERVAL_MS,
            last_report_at: None,
        }
    }

    /// Record the spacing between two consecutive snapshots
    pub fn record(&mut self, spacing_ms: f64) {
        self.history.push_back(spacing_ms);

        // Maintain max samples
        while self.history.len() > self.max_samples {
            self.history.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn summary(&self) -> Option<SpacingReport> {
        let samples: Vec<f64> = self.history.iter().copied().collect();
        let (avg_ms, stdev_ms) = mean_and_stdev(&samples)?;
        Some(SpacingReport {
            avg_ms,
            stdev_ms,
            samples: samples.len(),
        })
    }

    /// Returns (and logs) a summary at most once per report interval.
    pub fn maybe_report(&mut self, now_ms: f64) -> Option<SpacingReport> {
        if let Some(last) = self.last_report_at {
            if now_ms - last < self.report_interval_ms {
                return None;
            }
        }
        if self.history.len() < MIN_REPORT_SAMPLES {
            return None;
        }

        let report = self.summary()?;
        self.last_report_at = Some(now_ms);
        debug!(
            "[diag] snapshot spacing avg={:.2}ms stdev={:.2}ms samples={}",
            report.avg_ms, report.stdev_ms, report.samples
        );
        Some(report)
    }
}

impl Default for SpacingStats {
    fn default() -> Self {
        Self::new()
    }
}
