//! Crosstalk Probe - session isolation checker for PostgreSQL middleware
//!
//! Hammers a connection pooler/proxy with many concurrent sessions and
//! counts responses that come back on the wrong session.
//!
//! # Modules
//!
//! - [`token`] - Unique alphanumeric correctness markers
//! - [`verifier`] - Parameter/literal round-trip and three-way comparison
//! - [`session`] - Connection seam (sqlx `PgConnection` implementation)
//! - [`worker`] - One connection, sequential round-trips, tally
//! - [`harness`] - Static partition, concurrent launch, join barrier
//! - [`report`] - Aggregate result, summary, exit status
//! - [`error`] - Error taxonomy and classification
//! - [`config`] - YAML/env configuration and connection descriptor
//! - [`logging`] - tracing subscriber setup
//! - [`stub`] - In-memory echo backends (feature `stub-backend`)

pub mod config;
pub mod error;
pub mod harness;
pub mod logging;
pub mod report;
pub mod session;
pub mod token;
pub mod verifier;
pub mod worker;

#[cfg(feature = "stub-backend")]
pub mod stub;

// Convenient re-exports at crate root
pub use config::{ConnectionDescriptor, ProbeConfig, RunConfig, SslMode};
pub use error::{ErrorClass, ProbeError};
pub use harness::{Harness, Partition, partition};
pub use report::AggregateResult;
pub use session::{Connector, EchoRow, EchoSession, PgConnector};
pub use token::{Token, TokenGenerator};
pub use verifier::{Mismatch, Outcome, verify};
pub use worker::{WorkerPlan, WorkerReport, run_worker};
