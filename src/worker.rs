//! Worker - one connection, sequential round-trips
//!
//! ```text
//! Connecting ──ok──▶ Running(0..n) ──▶ Closing ──▶ Done
//!      │                                            ▲
//!      └──────────── connect failed ────────────────┘
//! ```
//!
//! A worker shares nothing mutable with other workers. Its tally is returned
//! by value as a [`WorkerReport`] once it reaches `Done`.

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::ProbeError;
use crate::session::{Connector, EchoSession};
use crate::token::TokenGenerator;
use crate::verifier::{Mismatch, Outcome, verify};

/// Mismatches kept verbatim per worker for the final report
pub const MAX_MISMATCH_SAMPLES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Connecting,
    Running,
    Closing,
    Done,
}

/// What one worker is asked to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPlan {
    pub queries: u64,
    pub token_length: usize,
    pub progress_every: u64,
}

/// Tally of one worker, owned by it until it finishes
#[derive(Debug, Clone, Default)]
pub struct WorkerReport {
    pub worker_id: usize,
    /// Round-trips assigned by the partition
    pub assigned: u64,
    /// Round-trips attempted (0 when the connection never came up)
    pub completed: u64,
    pub matches: u64,
    pub mismatches: u64,
    /// Skipped round-trips caused by connection churn
    pub transient_errors: u64,
    /// Skipped round-trips caused by anything else
    pub other_errors: u64,
    pub mismatch_samples: Vec<Mismatch>,
    /// Set when the worker never got a connection
    pub connect_error: Option<String>,
}

impl WorkerReport {
    pub fn new(worker_id: usize, assigned: u64) -> Self {
        Self {
            worker_id,
            assigned,
            ..Default::default()
        }
    }

    /// Report for a worker that could not connect
    pub fn connect_failed(worker_id: usize, assigned: u64, err: &ProbeError) -> Self {
        Self {
            connect_error: Some(err.to_string()),
            ..Self::new(worker_id, assigned)
        }
    }

    pub fn record(&mut self, outcome: Outcome) {
        self.completed += 1;
        match outcome {
            Outcome::Match => self.matches += 1,
            Outcome::Mismatch(m) => {
                self.mismatches += 1;
                if self.mismatch_samples.len() < MAX_MISMATCH_SAMPLES {
                    self.mismatch_samples.push(m);
                }
            }
            Outcome::Skipped(class) if class.is_transient() => self.transient_errors += 1,
            Outcome::Skipped(_) => self.other_errors += 1,
        }
    }

    /// Round-trips whose outcome was actually judged
    pub fn evaluated(&self) -> u64 {
        self.matches + self.mismatches
    }

    pub fn is_failed(&self) -> bool {
        self.connect_error.is_some()
    }
}

fn transition(worker_id: usize, state: WorkerState) {
    debug!("Worker {}: -> {:?}", worker_id, state);
}

/// Open one session and run `plan.queries` round-trips on it.
pub async fn run_worker<C>(worker_id: usize, connector: Arc<C>, plan: WorkerPlan) -> WorkerReport
where
    C: Connector,
{
    let mut report = WorkerReport::new(worker_id, plan.queries);

    transition(worker_id, WorkerState::Connecting);
    let mut session = match connector.connect(worker_id).await {
        Ok(session) => session,
        Err(source) => {
            let err = ProbeError::Connect { worker_id, source };
            error!("Connection to database failed: {}", err);
            transition(worker_id, WorkerState::Done);
            return WorkerReport::connect_failed(worker_id, plan.queries, &err);
        }
    };

    transition(worker_id, WorkerState::Running);
    let mut tokens = TokenGenerator::for_worker(worker_id);
    let progress_every = plan.progress_every.max(1);
    for i in 0..plan.queries {
        let token = tokens.generate(plan.token_length);
        let outcome = verify(&mut session, &token).await;
        report.record(outcome);

        if i % progress_every == 0 {
            info!("Worker {}: {} queries completed", worker_id, i);
        }
    }

    transition(worker_id, WorkerState::Closing);
    if let Err(e) = session.close().await {
        warn!("Worker {}: close failed: {}", worker_id, e);
    }

    transition(worker_id, WorkerState::Done);
    report
}
