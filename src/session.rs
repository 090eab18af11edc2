//! Session seam
//!
//! A worker talks to the backend through exactly one [`EchoSession`] that it
//! owns for its whole lifetime. [`Connector`] opens those sessions; it is the
//! only thing shared between workers and holds configuration, never a live
//! connection.

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{Connection, Row};

use crate::config::ConnectionDescriptor;

/// The two columns echoed back by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoRow {
    /// Column 1: value that travelled through parameter binding
    pub parameter_echo: String,
    /// Column 2: value that travelled inside the SQL text
    pub literal_echo: String,
}

/// One stateful, ordered channel to the backend
#[async_trait]
pub trait EchoSession: Send {
    /// Execute `sql` with `params` bound through the extended-query protocol
    /// and return the first row's two columns.
    async fn query_echo(&mut self, sql: &str, params: &[&str]) -> Result<EchoRow, sqlx::Error>;

    /// Whether the session is known to run over TLS
    fn is_encrypted(&self) -> bool {
        false
    }

    /// Terminate the session
    async fn close(self) -> Result<(), sqlx::Error>;
}

/// Opens one independent session per worker
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Session: EchoSession + 'static;

    async fn connect(&self, worker_id: usize) -> Result<Self::Session, sqlx::Error>;
}

/// Opens a dedicated PostgreSQL connection per worker (no client-side pool:
/// the middleware under test must be the only multiplexing layer).
#[derive(Debug, Clone)]
pub struct PgConnector {
    options: PgConnectOptions,
    encrypted: bool,
}

impl PgConnector {
    pub fn new(descriptor: &ConnectionDescriptor) -> Self {
        Self {
            options: descriptor.connect_options(),
            encrypted: descriptor.sslmode.requires_tls(),
        }
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Session = PgSession;

    async fn connect(&self, worker_id: usize) -> Result<PgSession, sqlx::Error> {
        let conn = PgConnection::connect_with(&self.options).await?;
        tracing::debug!("Worker {}: PostgreSQL connection established", worker_id);
        Ok(PgSession {
            conn,
            encrypted: self.encrypted,
        })
    }
}

pub struct PgSession {
    conn: PgConnection,
    encrypted: bool,
}

#[async_trait]
impl EchoSession for PgSession {
    async fn query_echo(&mut self, sql: &str, params: &[&str]) -> Result<EchoRow, sqlx::Error> {
        // Unnamed statement; named ones pin the session in a transaction pooler.
        let mut query = sqlx::query(sql).persistent(false);
        for param in params {
            query = query.bind(*param);
        }
        let row = query.fetch_one(&mut self.conn).await?;

        Ok(EchoRow {
            parameter_echo: row.try_get(0)?,
            literal_echo: row.try_get(1)?,
        })
    }

    fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    async fn close(self) -> Result<(), sqlx::Error> {
        self.conn.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionDescriptor, SslMode};

    // Note: requires a running PostgreSQL (or a proxy in front of one)
    // Run with: docker run -e POSTGRES_PASSWORD=postgres -p 5432:5432 postgres

    fn local_descriptor() -> ConnectionDescriptor {
        ConnectionDescriptor {
            host: "localhost".to_string(),
            port: 5432,
            dbname: "postgres".to_string(),
            user: "postgres".to_string(),
            password: "postgres".to_string(),
            sslmode: SslMode::Disable,
        }
    }

    #[tokio::test]
    #[ignore] // Requires PostgreSQL running
    async fn test_pg_session_echoes_both_channels() {
        let connector = PgConnector::new(&local_descriptor());
        let mut session = connector.connect(0).await.expect("Failed to connect");

        let row = session
            .query_echo(
                r#"select $1 as "parameterizedId", 'abc' as "literalId" where ('true' = 'true' or $2 = $3)"#,
                &["abc", "abc", "abc"],
            )
            .await
            .expect("Query failed");

        assert_eq!(row.parameter_echo, "abc");
        assert_eq!(row.literal_echo, "abc");
        session.close().await.expect("Close failed");
    }

    #[tokio::test]
    #[ignore]
    async fn test_pg_session_many_distinct_statements() {
        let connector = PgConnector::new(&local_descriptor());
        let mut session = connector.connect(0).await.expect("Failed to connect");

        for i in 0..150 {
            let token = format!("tok{}", i);
            let sql = format!(
                r#"select $1 as "parameterizedId", '{}' as "literalId" where ('true' = 'true' or $2 = $3)"#,
                token
            );
            let row = session
                .query_echo(&sql, &[token.as_str(); 3])
                .await
                .expect("Query failed");
            assert_eq!(row.parameter_echo, token);
            assert_eq!(row.literal_echo, token);
        }
        session.close().await.expect("Close failed");
    }

    #[tokio::test]
    #[ignore]
    async fn test_pg_connector_invalid_port() {
        let mut descriptor = local_descriptor();
        descriptor.port = 1;
        let connector = PgConnector::new(&descriptor);
        assert!(connector.connect(0).await.is_err());
    }
}
