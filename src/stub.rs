//! In-memory echo backend
//!
//! Stands in for a database behind a proxy. A correctly isolated backend
//! echoes the bound parameter and the SQL literal of the same request.
//! Faults can be switched on to emulate a broken multiplexer:
//!
//! - `with_crosstalk_every(n)`: every n-th call (counted across all sessions)
//!   answers with the literal most recently stored by a *different* session.
//!   The parameter echo stays correct, so only the literal channel diverges.
//! - `with_error_every(n, make)`: every n-th call fails with `make()`.
//! - `refuse_workers(ids)`: those workers cannot connect.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::session::{Connector, EchoRow, EchoSession};

#[derive(Default)]
struct BackendState {
    calls: AtomicU64,
    sessions_opened: AtomicU64,
    /// Last literal received per session
    last_literal: DashMap<usize, String>,
    /// Every bound token seen, with its count
    tokens: DashMap<String, u32>,
}

#[derive(Default)]
pub struct EchoBackend {
    crosstalk_every: Option<u64>,
    error_every: Option<(u64, fn() -> sqlx::Error)>,
    refused: HashSet<usize>,
    state: Arc<BackendState>,
}

impl EchoBackend {
    /// Correctly isolated backend
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_crosstalk_every(mut self, n: u64) -> Self {
        self.crosstalk_every = Some(n.max(1));
        self
    }

    pub fn with_error_every(mut self, n: u64, make: fn() -> sqlx::Error) -> Self {
        self.error_every = Some((n.max(1), make));
        self
    }

    pub fn refuse_workers(mut self, ids: impl IntoIterator<Item = usize>) -> Self {
        self.refused.extend(ids);
        self
    }

    /// Calls received across all sessions, failed ones included
    pub fn total_calls(&self) -> u64 {
        self.state.calls.load(Ordering::Relaxed)
    }

    pub fn sessions_opened(&self) -> u64 {
        self.state.sessions_opened.load(Ordering::Relaxed)
    }

    pub fn distinct_tokens(&self) -> usize {
        self.state.tokens.len()
    }

    /// Tokens that were bound more than once
    pub fn duplicate_tokens(&self) -> usize {
        self.state.tokens.iter().filter(|e| *e.value() > 1).count()
    }
}

#[async_trait]
impl Connector for EchoBackend {
    type Session = StubSession;

    async fn connect(&self, worker_id: usize) -> Result<StubSession, sqlx::Error> {
        if self.refused.contains(&worker_id) {
            return Err(sqlx::Error::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "stub backend refused connection",
            )));
        }
        self.state.sessions_opened.fetch_add(1, Ordering::Relaxed);
        Ok(StubSession {
            id: worker_id,
            crosstalk_every: self.crosstalk_every,
            error_every: self.error_every,
            prev_literal: None,
            state: Arc::clone(&self.state),
        })
    }
}

pub struct StubSession {
    id: usize,
    crosstalk_every: Option<u64>,
    error_every: Option<(u64, fn() -> sqlx::Error)>,
    prev_literal: Option<String>,
    state: Arc<BackendState>,
}

/// First single-quoted literal in `sql`
fn extract_literal(sql: &str) -> Option<&str> {
    let start = sql.find('\'')? + 1;
    let len = sql[start..].find('\'')?;
    Some(&sql[start..start + len])
}

impl StubSession {
    /// Literal stored by another session, or failing that this session's
    /// previous one: in both cases a response that belongs to another request.
    fn leaked_literal(&self) -> Option<String> {
        self.state
            .last_literal
            .iter()
            .find(|e| *e.key() != self.id)
            .map(|e| e.value().clone())
            .or_else(|| self.prev_literal.clone())
    }
}

#[async_trait]
impl EchoSession for StubSession {
    async fn query_echo(&mut self, sql: &str, params: &[&str]) -> Result<EchoRow, sqlx::Error> {
        // Let other sessions interleave with this one.
        tokio::task::yield_now().await;

        let n = self.state.calls.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some((every, make)) = self.error_every
            && n % every == 0
        {
            return Err(make());
        }

        let literal = extract_literal(sql)
            .ok_or_else(|| sqlx::Error::Protocol("statement has no literal".to_string()))?
            .to_string();
        let parameter = params
            .first()
            .ok_or_else(|| sqlx::Error::Protocol("statement has no bound parameter".to_string()))?
            .to_string();

        *self.state.tokens.entry(parameter.clone()).or_insert(0) += 1;

        let leak = match self.crosstalk_every {
            Some(every) if n % every == 0 => self.leaked_literal(),
            _ => None,
        };
        let literal_echo = leak.unwrap_or_else(|| literal.clone());

        self.state.last_literal.insert(self.id, literal.clone());
        self.prev_literal = Some(literal);

        Ok(EchoRow {
            parameter_echo: parameter,
            literal_echo,
        })
    }

    async fn close(self) -> Result<(), sqlx::Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::Token;
    use crate::verifier::{DivergedChannel, Outcome, echo_sql, verify};
    use crate::worker::{WorkerPlan, run_worker};

    fn plan(queries: u64) -> WorkerPlan {
        WorkerPlan {
            queries,
            token_length: 22,
            progress_every: 500,
        }
    }

    #[test]
    fn test_extract_literal() {
        let token = Token::parse("abc123").unwrap();
        assert_eq!(extract_literal(&echo_sql(&token)), Some("abc123"));
        assert_eq!(extract_literal("select 1"), None);
        assert_eq!(extract_literal("select 'open"), None);
    }

    #[tokio::test]
    async fn test_clean_backend_always_matches() {
        let backend = EchoBackend::new();
        let mut session = backend.connect(0).await.unwrap();
        for s in ["a1", "b2", "c3"] {
            let outcome = verify(&mut session, &Token::parse(s).unwrap()).await;
            assert_eq!(outcome, Outcome::Match);
        }
        assert_eq!(backend.total_calls(), 3);
        assert_eq!(backend.distinct_tokens(), 3);
    }

    #[tokio::test]
    async fn test_crosstalk_leaks_other_session_literal() {
        let backend = EchoBackend::new().with_crosstalk_every(2);
        let mut a = backend.connect(0).await.unwrap();
        let mut b = backend.connect(1).await.unwrap();

        assert_eq!(
            verify(&mut a, &Token::parse("fromA").unwrap()).await,
            Outcome::Match
        );
        let outcome = verify(&mut b, &Token::parse("fromB").unwrap()).await;

        let Outcome::Mismatch(m) = outcome else {
            panic!("expected mismatch on second call");
        };
        assert_eq!(m.parameter_echo, "fromB");
        assert_eq!(m.literal_echo, "fromA");
        assert_eq!(m.diverged_channel(), DivergedChannel::Literal);
    }

    #[tokio::test]
    async fn test_run_worker_against_clean_backend() {
        let backend = Arc::new(EchoBackend::new());
        let report = run_worker(0, Arc::clone(&backend), plan(250)).await;

        assert_eq!(report.completed, 250);
        assert_eq!(report.matches, 250);
        assert_eq!(report.mismatches, 0);
        assert!(!report.is_failed());
        assert_eq!(backend.sessions_opened(), 1);
        assert_eq!(backend.distinct_tokens(), 250);
    }

    #[tokio::test]
    async fn test_run_worker_zero_progress_interval() {
        let backend = Arc::new(EchoBackend::new());
        let plan = WorkerPlan {
            progress_every: 0,
            ..plan(20)
        };
        let report = run_worker(0, backend, plan).await;

        assert!(!report.is_failed());
        assert_eq!(report.completed, 20);
        assert_eq!(report.matches, 20);
    }

    #[tokio::test]
    async fn test_run_worker_connect_refused() {
        let backend = Arc::new(EchoBackend::new().refuse_workers([5]));
        let report = run_worker(5, Arc::clone(&backend), plan(100)).await;

        assert!(report.is_failed());
        assert_eq!(report.completed, 0);
        assert_eq!(report.mismatches, 0);
        assert_eq!(backend.total_calls(), 0);
        assert_eq!(backend.sessions_opened(), 0);
    }

    #[tokio::test]
    async fn test_run_worker_errors_are_not_mismatches() {
        let backend = Arc::new(EchoBackend::new().with_error_every(10, || {
            sqlx::Error::Io(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"))
        }));
        let report = run_worker(0, backend, plan(100)).await;

        assert_eq!(report.completed, 100);
        assert_eq!(report.transient_errors, 10);
        assert_eq!(report.other_errors, 0);
        assert_eq!(report.matches, 90);
        assert_eq!(report.mismatches, 0);
    }
}
