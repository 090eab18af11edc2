//! Aggregation and operator-facing summary

use std::process::ExitCode;

use crate::verifier::Mismatch;
use crate::worker::WorkerReport;

/// Process exit statuses
pub mod exit {
    pub const CLEAN: u8 = 0;
    pub const MISMATCHES: u8 = 1;
    pub const WORKERS_FAILED: u8 = 2;
    pub const CONFIG: u8 = 3;
}

/// First worker that failed to connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerFailure {
    pub worker_id: usize,
    pub reason: String,
}

/// Sum of all worker reports, built after every worker has finished
#[derive(Debug, Clone, Default)]
pub struct AggregateResult {
    pub workers: usize,
    pub failed_workers: usize,
    pub assigned: u64,
    pub completed: u64,
    pub matches: u64,
    pub mismatches: u64,
    pub transient_errors: u64,
    pub other_errors: u64,
    /// Queries lost to the floor-division partition
    pub dropped_by_partition: u64,
    pub first_failure: Option<WorkerFailure>,
    pub mismatch_samples: Vec<(usize, Mismatch)>,
}

impl AggregateResult {
    pub fn from_reports<I>(reports: I) -> Self
    where
        I: IntoIterator<Item = WorkerReport>,
    {
        let mut agg = AggregateResult::default();
        for r in reports {
            agg.add(r);
        }
        agg
    }

    pub fn add(&mut self, report: WorkerReport) {
        self.workers += 1;
        self.assigned += report.assigned;
        self.completed += report.completed;
        self.matches += report.matches;
        self.mismatches += report.mismatches;
        self.transient_errors += report.transient_errors;
        self.other_errors += report.other_errors;

        if let Some(reason) = report.connect_error {
            self.failed_workers += 1;
            let is_first = self
                .first_failure
                .as_ref()
                .is_none_or(|f| report.worker_id < f.worker_id);
            if is_first {
                self.first_failure = Some(WorkerFailure {
                    worker_id: report.worker_id,
                    reason,
                });
            }
        }

        let worker_id = report.worker_id;
        self.mismatch_samples
            .extend(report.mismatch_samples.into_iter().map(|m| (worker_id, m)));
    }

    /// Round-trips actually judged match/mismatch
    pub fn evaluated(&self) -> u64 {
        self.matches + self.mismatches
    }

    /// Share of assigned round-trips that were judged; skipped round-trips
    /// and unconnected workers lower it.
    pub fn coverage(&self) -> f64 {
        if self.assigned == 0 {
            return 0.0;
        }
        self.evaluated() as f64 / self.assigned as f64
    }

    pub fn is_clean(&self) -> bool {
        self.mismatches == 0 && self.failed_workers == 0
    }

    /// Mismatches take precedence over connection failures.
    pub fn exit_status(&self) -> u8 {
        if self.mismatches > 0 {
            exit::MISMATCHES
        } else if self.failed_workers > 0 {
            exit::WORKERS_FAILED
        } else {
            exit::CLEAN
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.exit_status())
    }

    pub fn summary(&self) -> String {
        let mut out = String::new();
        out.push_str("=== Crosstalk Probe Summary ===\n");
        out.push_str(&format!(
            "Workers:            {} ({} failed to connect)\n",
            self.workers, self.failed_workers
        ));
        out.push_str(&format!(
            "Queries:            {} assigned, {} attempted, {} evaluated\n",
            self.assigned,
            self.completed,
            self.evaluated()
        ));
        if self.dropped_by_partition > 0 {
            out.push_str(&format!(
                "Partition:          {} queries dropped (remainder)\n",
                self.dropped_by_partition
            ));
        }
        out.push_str(&format!(
            "Skipped:            {} transient, {} other errors\n",
            self.transient_errors, self.other_errors
        ));
        out.push_str(&format!(
            "Coverage:           {:.2}%\n",
            self.coverage() * 100.0
        ));
        if let Some(f) = &self.first_failure {
            out.push_str(&format!(
                "First failure:      worker {}: {}\n",
                f.worker_id, f.reason
            ));
        }
        out.push_str(&format!("Total different results: {}", self.mismatches));
        out
    }
}
