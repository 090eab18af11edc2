//! Round-Trip Verifier
//!
//! Carries one token to the server through two independent channels in a
//! single statement and checks that both come back unchanged:
//!
//! ```text
//! select $1 as "parameterizedId", '<token>' as "literalId"
//! where ('true' = 'true' or $2 = $3)
//!
//!  $1        parameter channel  (bound through the extended-query protocol)
//!  '<token>' literal channel    (part of the SQL text)
//!  $2, $3    tautology          (extra bound params, never decide the result)
//! ```
//!
//! Three observation points (client-held token, parameter echo, literal echo)
//! let a reader of a mismatch tell which channel diverged.

use tracing::{debug, error, warn};

use crate::error::{ErrorClass, classify};
use crate::session::EchoSession;
use crate::token::Token;

/// Result of one round-trip
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// token == parameter echo == literal echo
    Match,
    /// At least one pair differs
    Mismatch(Mismatch),
    /// Execution failed; nothing could be evaluated
    Skipped(ErrorClass),
}

/// The three values observed for a diverging round-trip
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    pub token: String,
    pub parameter_echo: String,
    pub literal_echo: String,
}

/// Which channel(s) disagree with the client-held token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DivergedChannel {
    Parameter,
    Literal,
    Both,
    /// Both echoes equal the token but not each other; unreachable for
    /// well-formed strings, kept so classification is total.
    Neither,
}

impl Mismatch {
    pub fn diverged_channel(&self) -> DivergedChannel {
        match (
            self.parameter_echo == self.token,
            self.literal_echo == self.token,
        ) {
            (false, true) => DivergedChannel::Parameter,
            (true, false) => DivergedChannel::Literal,
            (false, false) => DivergedChannel::Both,
            (true, true) => DivergedChannel::Neither,
        }
    }
}

impl std::fmt::Display for DivergedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DivergedChannel::Parameter => write!(f, "parameter"),
            DivergedChannel::Literal => write!(f, "literal"),
            DivergedChannel::Both => write!(f, "parameter+literal"),
            DivergedChannel::Neither => write!(f, "none"),
        }
    }
}

impl std::fmt::Display for Mismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "MISMATCH DETECTED!")?;
        writeln!(f, "expectedId: {}", self.token)?;
        writeln!(f, "parameterizedId: {}", self.parameter_echo)?;
        writeln!(f, "literalId: {}", self.literal_echo)?;
        write!(f, "diverged: {}", self.diverged_channel())
    }
}

/// Build the echo statement with the token embedded as the literal column.
pub fn echo_sql(token: &Token) -> String {
    // Token is alphanumeric by construction, so no quoting is needed.
    format!(
        r#"select $1 as "parameterizedId", '{}' as "literalId" where ('true' = 'true' or $2 = $3)"#,
        token.as_str()
    )
}

/// Pure three-way comparison
pub fn compare(token: &Token, parameter_echo: String, literal_echo: String) -> Outcome {
    let expected = token.as_str();
    if parameter_echo == expected && literal_echo == expected && parameter_echo == literal_echo {
        Outcome::Match
    } else {
        Outcome::Mismatch(Mismatch {
            token: expected.to_string(),
            parameter_echo,
            literal_echo,
        })
    }
}

/// Run one round-trip on `session` and judge it.
///
/// Execution failures are never counted as mismatches and never retried.
/// Transient connection churn is only visible at debug level; every other
/// failure is reported.
pub async fn verify<S>(session: &mut S, token: &Token) -> Outcome
where
    S: EchoSession,
{
    let sql = echo_sql(token);
    let t = token.as_str();

    let row = match session.query_echo(&sql, &[t, t, t]).await {
        Ok(row) => row,
        Err(e) => {
            let class = classify(&e, session.is_encrypted());
            if class.is_transient() {
                debug!("Round-trip skipped ({}): {}", class, e);
            } else {
                error!("SELECT failed: {}", e);
            }
            return Outcome::Skipped(class);
        }
    };

    let outcome = compare(token, row.parameter_echo, row.literal_echo);
    if let Outcome::Mismatch(m) = &outcome {
        warn!(
            expected = %m.token,
            parameterized = %m.parameter_echo,
            literal = %m.literal_echo,
            diverged = %m.diverged_channel(),
            "\n{}",
            m
        );
    }
    outcome
}
