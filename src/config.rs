use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use std::fs;

use crate::error::ProbeError;
use crate::token::{DEFAULT_TOKEN_LENGTH, is_collision_safe};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProbeConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    pub database: ConnectionDescriptor,
    #[serde(default)]
    pub run: RunConfig,
}

/// Where every worker opens its own connection.
///
/// Shared read-only between workers and copied by value into each connect
/// call; it is never a live connection.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub sslmode: SslMode,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    Disable,
    Allow,
    #[default]
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

/// Run volume and cadence
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RunConfig {
    /// Total round-trips across all workers (split with floor division)
    pub total_queries: u64,
    pub workers: usize,
    #[serde(default = "default_token_length")]
    pub token_length: usize,
    /// Liveness line every N iterations per worker
    #[serde(default = "default_progress_every")]
    pub progress_every: u64,
}

fn default_token_length() -> usize {
    DEFAULT_TOKEN_LENGTH
}

fn default_progress_every() -> u64 {
    500
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            total_queries: 1_000_000,
            workers: 600,
            token_length: DEFAULT_TOKEN_LENGTH,
            progress_every: default_progress_every(),
        }
    }
}

impl std::str::FromStr for SslMode {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disable" => Ok(SslMode::Disable),
            "allow" => Ok(SslMode::Allow),
            "prefer" => Ok(SslMode::Prefer),
            "require" => Ok(SslMode::Require),
            "verify-ca" => Ok(SslMode::VerifyCa),
            "verify-full" => Ok(SslMode::VerifyFull),
            other => Err(ProbeError::Config(format!("unknown sslmode '{}'", other))),
        }
    }
}

impl SslMode {
    /// Modes under which a connection never falls back to plaintext
    pub fn requires_tls(self) -> bool {
        matches!(self, SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull)
    }
}

impl From<SslMode> for PgSslMode {
    fn from(mode: SslMode) -> Self {
        match mode {
            SslMode::Disable => PgSslMode::Disable,
            SslMode::Allow => PgSslMode::Allow,
            SslMode::Prefer => PgSslMode::Prefer,
            SslMode::Require => PgSslMode::Require,
            SslMode::VerifyCa => PgSslMode::VerifyCa,
            SslMode::VerifyFull => PgSslMode::VerifyFull,
        }
    }
}

impl ConnectionDescriptor {
    /// Parse a libpq-style `key=value` connection string, e.g.
    /// `host=localhost port=5432 dbname=app user=root password='p w' sslmode=require`.
    ///
    /// Unknown keys are rejected. Values may be single-quoted; `\'` and `\\`
    /// escape inside quotes.
    pub fn from_conninfo(conninfo: &str) -> Result<Self, ProbeError> {
        let mut descriptor = ConnectionDescriptor {
            host: "localhost".to_string(),
            port: 5432,
            dbname: String::new(),
            user: String::new(),
            password: String::new(),
            sslmode: SslMode::default(),
        };

        for (key, value) in parse_conninfo_pairs(conninfo)? {
            descriptor.set(&key, &value)?;
        }

        if descriptor.dbname.is_empty() {
            descriptor.dbname = descriptor.user.clone();
        }
        Ok(descriptor)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), ProbeError> {
        match key {
            "host" => self.host = value.to_string(),
            "port" => {
                self.port = value
                    .parse()
                    .map_err(|_| ProbeError::Config(format!("invalid port '{}'", value)))?
            }
            "dbname" => self.dbname = value.to_string(),
            "user" => self.user = value.to_string(),
            "password" => self.password = value.to_string(),
            "sslmode" => self.sslmode = value.parse()?,
            other => {
                return Err(ProbeError::Config(format!(
                    "unsupported connection key '{}'",
                    other
                )));
            }
        }
        Ok(())
    }

    /// Options for a single dedicated connection
    pub fn connect_options(&self) -> PgConnectOptions {
        let mut options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.dbname)
            .username(&self.user)
            .ssl_mode(self.sslmode.into());
        if !self.password.is_empty() {
            options = options.password(&self.password);
        }
        options
    }

    /// Same descriptor with the password masked, for logs
    pub fn redacted(&self) -> String {
        format!(
            "host={} port={} dbname={} user={} sslmode={:?}",
            self.host, self.port, self.dbname, self.user, self.sslmode
        )
    }
}

fn parse_conninfo_pairs(conninfo: &str) -> Result<Vec<(String, String)>, ProbeError> {
    let mut pairs = Vec::new();
    let mut chars = conninfo.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        while let Some(c) = chars.next_if(|c| *c != '=' && !c.is_whitespace()) {
            key.push(c);
        }
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.next() != Some('=') {
            return Err(ProbeError::Config(format!(
                "missing '=' after '{}' in connection string",
                key
            )));
        }
        while chars.next_if(|c| c.is_whitespace()).is_some() {}

        let mut value = String::new();
        if chars.next_if_eq(&'\'').is_some() {
            loop {
                match chars.next() {
                    Some('\\') => match chars.next() {
                        Some(escaped) => value.push(escaped),
                        None => break,
                    },
                    Some('\'') => break,
                    Some(c) => value.push(c),
                    None => {
                        return Err(ProbeError::Config(format!(
                            "unterminated quoted value for '{}'",
                            key
                        )));
                    }
                }
            }
        } else {
            while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                value.push(c);
            }
        }

        pairs.push((key, value));
    }

    Ok(pairs)
}

impl ProbeConfig {
    /// Load `config/<env>.yaml`
    pub fn load(env: &str) -> Result<Self, ProbeError> {
        Self::from_file(&format!("config/{}.yaml", env))
    }

    pub fn from_file(path: &str) -> Result<Self, ProbeError> {
        let content = fs::read_to_string(path)?;
        serde_yaml::from_str(&content)
            .map_err(|e| ProbeError::Config(format!("{}: {}", path, e)))
    }

    /// Apply `PROBE_*` overrides from the process environment
    pub fn apply_env(&mut self) -> Result<(), ProbeError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `PROBE_*` overrides from an arbitrary lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ProbeError>
    where
        F: Fn(&str) -> Option<String>,
    {
        const DB_KEYS: [(&str, &str); 6] = [
            ("PROBE_DB_HOST", "host"),
            ("PROBE_DB_PORT", "port"),
            ("PROBE_DB_NAME", "dbname"),
            ("PROBE_DB_USER", "user"),
            ("PROBE_DB_PASSWORD", "password"),
            ("PROBE_DB_SSLMODE", "sslmode"),
        ];

        for (var, key) in DB_KEYS {
            if let Some(value) = lookup(var) {
                self.database.set(key, &value)?;
            }
        }
        if let Some(value) = lookup("PROBE_TOTAL_QUERIES") {
            self.run.total_queries = parse_number("PROBE_TOTAL_QUERIES", &value)?;
        }
        if let Some(value) = lookup("PROBE_WORKERS") {
            self.run.workers = parse_number("PROBE_WORKERS", &value)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ProbeError> {
        let run = &self.run;
        if run.workers == 0 {
            return Err(ProbeError::Config("workers must be at least 1".to_string()));
        }
        if run.total_queries < run.workers as u64 {
            return Err(ProbeError::Config(format!(
                "total_queries ({}) is smaller than workers ({}): every worker would get zero queries",
                run.total_queries, run.workers
            )));
        }
        if run.progress_every == 0 {
            return Err(ProbeError::Config("progress_every must be at least 1".to_string()));
        }
        if !is_collision_safe(run.token_length, run.total_queries) {
            return Err(ProbeError::Config(format!(
                "token_length {} is too short for {} queries: collisions become likely",
                run.token_length, run.total_queries
            )));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ProbeError> {
    value
        .trim()
        .parse()
        .map_err(|_| ProbeError::Config(format!("{} is not a valid number: '{}'", name, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const YAML: &str = r#"
log_level: "info"
log_dir: "./logs"
log_file: "probe.log"
use_json: false
rotation: "daily"
database:
  host: "proxy.internal"
  port: 6432
  dbname: "app"
  user: "probe"
  sslmode: "require"
run:
  total_queries: 10000
  workers: 8
"#;

    #[test]
    fn test_yaml_config_deserialize() {
        let config: ProbeConfig = serde_yaml::from_str(YAML).unwrap();

        assert_eq!(config.database.host, "proxy.internal");
        assert_eq!(config.database.port, 6432);
        assert_eq!(config.database.password, "");
        assert_eq!(config.database.sslmode, SslMode::Require);
        assert_eq!(config.run.workers, 8);
        assert_eq!(config.run.token_length, DEFAULT_TOKEN_LENGTH);
        assert_eq!(config.run.progress_every, 500);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_run_section_defaults() {
        let yaml = YAML.split("run:").next().unwrap();
        let config: ProbeConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.run, RunConfig::default());
    }

    #[test]
    fn test_env_overrides() {
        let mut config: ProbeConfig = serde_yaml::from_str(YAML).unwrap();
        let env: HashMap<&str, &str> = [
            ("PROBE_DB_PASSWORD", "s3cret"),
            ("PROBE_DB_PORT", "5433"),
            ("PROBE_DB_SSLMODE", "verify-full"),
            ("PROBE_WORKERS", "4"),
        ]
        .into_iter()
        .collect();

        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.database.password, "s3cret");
        assert_eq!(config.database.port, 5433);
        assert_eq!(config.database.sslmode, SslMode::VerifyFull);
        assert_eq!(config.run.workers, 4);
        assert_eq!(config.run.total_queries, 10000);
    }

    #[test]
    fn test_env_override_rejects_bad_number() {
        let mut config: ProbeConfig = serde_yaml::from_str(YAML).unwrap();
        let result = config.apply_overrides(|k| (k == "PROBE_WORKERS").then(|| "many".to_string()));
        assert!(matches!(result, Err(ProbeError::Config(_))));
    }

    #[test]
    fn test_conninfo_parse() {
        let d = ConnectionDescriptor::from_conninfo(
            "host=proxy.example.com port=5432 dbname=XXX user=root password=root sslmode=require",
        )
        .unwrap();

        assert_eq!(d.host, "proxy.example.com");
        assert_eq!(d.port, 5432);
        assert_eq!(d.dbname, "XXX");
        assert_eq!(d.user, "root");
        assert_eq!(d.password, "root");
        assert_eq!(d.sslmode, SslMode::Require);
    }

    #[test]
    fn test_conninfo_quoted_values() {
        let d = ConnectionDescriptor::from_conninfo(r"user = probe password='it\'s a secret'").unwrap();
        assert_eq!(d.password, "it's a secret");
        assert_eq!(d.host, "localhost");
        assert_eq!(d.dbname, "probe");
    }

    #[test]
    fn test_conninfo_errors() {
        assert!(ConnectionDescriptor::from_conninfo("host").is_err());
        assert!(ConnectionDescriptor::from_conninfo("port=abc").is_err());
        assert!(ConnectionDescriptor::from_conninfo("sslmode=sometimes").is_err());
        assert!(ConnectionDescriptor::from_conninfo("password='open").is_err());
        assert!(ConnectionDescriptor::from_conninfo("application_name=x").is_err());
    }

    #[test]
    fn test_validate_rejects_bad_runs() {
        let mut config: ProbeConfig = serde_yaml::from_str(YAML).unwrap();

        config.run.workers = 0;
        assert!(config.validate().is_err());

        config.run.workers = 20_000;
        assert!(config.validate().is_err());

        config.run.workers = 8;
        config.run.token_length = 4;
        assert!(config.validate().is_err());

        config.run.token_length = DEFAULT_TOKEN_LENGTH;
        config.run.progress_every = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_requires_tls() {
        assert!(SslMode::Require.requires_tls());
        assert!(SslMode::VerifyFull.requires_tls());
        assert!(!SslMode::Prefer.requires_tls());
        assert!(!SslMode::Disable.requires_tls());
    }

    #[test]
    fn test_redacted_hides_password() {
        let d = ConnectionDescriptor::from_conninfo("user=probe password=hunter2").unwrap();
        assert!(!d.redacted().contains("hunter2"));
    }
}
