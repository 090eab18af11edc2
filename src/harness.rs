//! Harness - static partition, concurrent launch, join barrier
//!
//! One tokio task per worker. There is no shared queue and no work
//! stealing; the partition is decided once at launch. Results are only
//! aggregated after every task has been joined.

use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::RunConfig;
use crate::report::AggregateResult;
use crate::session::Connector;
use crate::worker::{WorkerPlan, WorkerReport, run_worker};

/// Per-worker share of the total volume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub per_worker: u64,
    /// Remainder of the floor division, never run
    pub dropped: u64,
}

pub fn partition(total: u64, workers: usize) -> Partition {
    if workers == 0 {
        return Partition {
            per_worker: 0,
            dropped: total,
        };
    }
    let workers = workers as u64;
    Partition {
        per_worker: total / workers,
        dropped: total % workers,
    }
}

pub struct Harness {
    run: RunConfig,
}

impl Harness {
    pub fn new(run: RunConfig) -> Self {
        Self { run }
    }

    pub fn partition(&self) -> Partition {
        partition(self.run.total_queries, self.run.workers)
    }

    /// Run every worker against sessions opened by `connector`.
    pub async fn run<C>(&self, connector: Arc<C>) -> AggregateResult
    where
        C: Connector,
    {
        let token_length = self.run.token_length;
        let progress_every = self.run.progress_every;

        self.run_with(move |worker_id, queries| {
            let connector = Arc::clone(&connector);
            let plan = WorkerPlan {
                queries,
                token_length,
                progress_every,
            };
            run_worker(worker_id, connector, plan)
        })
        .await
    }

    /// Launch `spawn_worker(worker_id, queries)` for every worker, wait for
    /// all of them and aggregate.
    pub async fn run_with<F, Fut>(&self, spawn_worker: F) -> AggregateResult
    where
        F: Fn(usize, u64) -> Fut,
        Fut: Future<Output = WorkerReport> + Send + 'static,
    {
        let Partition {
            per_worker,
            dropped,
        } = self.partition();
        let workers = self.run.workers;

        info!(
            "Launching {} workers x {} queries ({} requested)",
            workers, per_worker, self.run.total_queries
        );
        if dropped > 0 {
            warn!(
                "{} queries dropped: {} does not divide evenly across {} workers",
                dropped, self.run.total_queries, workers
            );
        }

        let mut set = JoinSet::new();
        for worker_id in 0..workers {
            set.spawn(spawn_worker(worker_id, per_worker));
        }

        let mut reports = Vec::with_capacity(workers);
        let mut panicked = 0usize;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(report) => {
                    if let Some(reason) = &report.connect_error
                        && reports.iter().all(|r: &WorkerReport| !r.is_failed())
                    {
                        error!("First worker failure (worker {}): {}", report.worker_id, reason);
                    }
                    reports.push(report);
                }
                Err(e) => {
                    error!("Worker task failed: {}", e);
                    panicked += 1;
                }
            }
        }
        // Reports arrive in completion order.
        reports.sort_by_key(|r| r.worker_id);

        let mut result = AggregateResult::from_reports(reports);
        result.workers += panicked;
        result.failed_workers += panicked;
        result.assigned += panicked as u64 * per_worker;
        result.dropped_by_partition = dropped;

        info!(
            "All {} workers done: {} mismatches over {} evaluated round-trips",
            result.workers,
            result.mismatches,
            result.evaluated()
        );
        result
    }
}
