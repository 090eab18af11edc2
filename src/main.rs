//! Crosstalk Probe
//!
//! ```text
//! ┌──────────┐    ┌──────────┐    ┌──────────────┐    ┌──────────┐
//! │  Config  │───▶│ Harness  │───▶│ N x Worker   │───▶│ Summary  │
//! │(YAML+env)│    │(partition│    │ (1 conn each)│    │(exit code│
//! └──────────┘    │ + join)  │    └──────┬───────┘    └──────────┘
//!                 └──────────┘           ▼
//!                              proxy / pooler under test
//! ```
//!
//! Usage:
//!
//! ```text
//! crosstalk_probe [--env dev] [--config path.yaml] [--conninfo "host=.. port=.."]
//!                 [--workers N] [--queries N] [--stub] [--stub-crosstalk N]
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};

use crosstalk_probe::config::{ConnectionDescriptor, ProbeConfig};
use crosstalk_probe::harness::Harness;
use crosstalk_probe::report::{AggregateResult, exit};
use crosstalk_probe::session::PgConnector;

// ============================================================
// COMMAND LINE
// ============================================================

fn get_arg(names: &[&str]) -> Option<String> {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if names.contains(&args[i].as_str()) && i + 1 < args.len() {
            return Some(args[i + 1].clone());
        }
    }
    None
}

fn has_flag(name: &str) -> bool {
    std::env::args().any(|a| a == name)
}

fn get_env() -> String {
    get_arg(&["--env", "-e"]).unwrap_or_else(|| "dev".to_string())
}

fn parse_arg<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    get_arg(&[name])
        .map(|v| v.parse::<T>().with_context(|| format!("invalid value for {}: '{}'", name, v)))
        .transpose()
}

/// Stub modes, used for dry runs without a database
#[derive(Debug, Clone, Copy)]
enum Backend {
    Postgres,
    #[cfg(feature = "stub-backend")]
    Stub { crosstalk_every: Option<u64> },
}

fn get_backend() -> Result<Backend> {
    #[cfg(feature = "stub-backend")]
    {
        let crosstalk_every = parse_arg::<u64>("--stub-crosstalk")?;
        if has_flag("--stub") || crosstalk_every.is_some() {
            return Ok(Backend::Stub { crosstalk_every });
        }
    }
    Ok(Backend::Postgres)
}

// ============================================================
// CONFIG
// ============================================================

fn load_config() -> Result<ProbeConfig> {
    let mut config = match get_arg(&["--config", "-c"]) {
        Some(path) => ProbeConfig::from_file(&path)
            .with_context(|| format!("failed to load config file {}", path))?,
        None => {
            let env = get_env();
            ProbeConfig::load(&env)
                .with_context(|| format!("failed to load config/{}.yaml", env))?
        }
    };

    if let Some(conninfo) = get_arg(&["--conninfo"]) {
        config.database =
            ConnectionDescriptor::from_conninfo(&conninfo).context("invalid --conninfo")?;
    }
    config.apply_env().context("invalid PROBE_* environment override")?;

    if let Some(workers) = parse_arg::<usize>("--workers")? {
        config.run.workers = workers;
    }
    if let Some(total) = parse_arg::<u64>("--queries")? {
        config.run.total_queries = total;
    }

    config.validate()?;
    Ok(config)
}

// ============================================================
// MAIN
// ============================================================

async fn run(config: &ProbeConfig, backend: Backend) -> AggregateResult {
    let harness = Harness::new(config.run.clone());

    match backend {
        Backend::Postgres => {
            tracing::info!("Target: {}", config.database.redacted());
            harness.run(Arc::new(PgConnector::new(&config.database))).await
        }
        #[cfg(feature = "stub-backend")]
        Backend::Stub { crosstalk_every } => {
            use crosstalk_probe::stub::EchoBackend;

            let mut stub = EchoBackend::new();
            if let Some(n) = crosstalk_every {
                stub = stub.with_crosstalk_every(n);
            }
            tracing::info!("Target: in-memory echo stub (crosstalk every {:?})", crosstalk_every);
            harness.run(Arc::new(stub)).await
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let (config, backend) = match load_config().and_then(|c| Ok((c, get_backend()?))) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("❌ {:#}", e);
            return ExitCode::from(exit::CONFIG);
        }
    };
    let _log_guard = crosstalk_probe::logging::init_logging(&config);

    println!(
        "=== Crosstalk Probe {} ({}) ===",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH")
    );
    println!(
        "Workers: {}, total queries: {}, token length: {}",
        config.run.workers, config.run.total_queries, config.run.token_length
    );

    let result = run(&config, backend).await;

    for (worker_id, m) in &result.mismatch_samples {
        println!("\n[worker {}]\n{}", worker_id, m);
    }
    println!("\n{}", result.summary());

    if result.is_clean() {
        println!("✅ No cross-session responses observed");
    } else if result.mismatches > 0 {
        println!("❌ Cross-session responses observed");
    } else {
        println!("⚠️ Some workers never connected");
    }

    result.exit_code()
}
