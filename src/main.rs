use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use futures::StreamExt;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio_stream::wrappers::LinesStream;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::config::{LogFormat, LoggingConfig, TurnstileConfig};
use turnstile::error::TurnstileError;
use turnstile::ratelimit::{AdmissionGuard, AdmissionVerdict};
use turnstile::store::MemoryStore;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Admission decisions for identities read from stdin, one per line"
)]
struct Cli {
    /// Path to configuration YAML file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Maximum decisions evaluated at once
    #[arg(long, default_value_t = 64)]
    concurrency: usize,
}

/// One line of output.
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Output {
    Decision {
        identity: String,
        now: i64,
        verdict: AdmissionVerdict,
        retry_after: Option<i64>,
    },
    Error {
        input: String,
        error: String,
        rejected: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = TurnstileConfig::load(cli.config.as_deref())
        .context("failed to load configuration")?;
    init_tracing(&config.logging);

    info!("Starting Turnstile");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        minute_limit = config.limits.minute_limit,
        day_limit = config.limits.day_limit,
        abuse_threshold = config.limits.abuse_threshold,
        block_duration_seconds = config.limits.block_duration_seconds,
        "Configuration loaded"
    );

    let store = Arc::new(MemoryStore::new());
    let guard = Arc::new(AdmissionGuard::new(config.limits, store)?);

    tokio::select! {
        result = run(guard, cli.concurrency) => result?,
        _ = shutdown_signal() => {}
    }

    info!("Turnstile stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

/// Decide every request on stdin, printing results in input order.
async fn run(guard: Arc<AdmissionGuard>, concurrency: usize) -> anyhow::Result<()> {
    let lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
    let mut outputs = lines
        .map(|line| {
            let guard = guard.clone();
            async move { evaluate(&guard, line).await }
        })
        .buffered(concurrency.max(1));

    let mut stdout = tokio::io::stdout();
    while let Some(output) = outputs.next().await {
        let Some(output) = output? else {
            continue;
        };
        let mut encoded = serde_json::to_vec(&output)?;
        encoded.push(b'\n');
        stdout.write_all(&encoded).await?;
    }
    stdout.flush().await?;

    let removed = guard.compact(Utc::now().timestamp()).await?;
    info!(removed, "Input exhausted");
    Ok(())
}

async fn evaluate(
    guard: &AdmissionGuard,
    line: std::io::Result<String>,
) -> std::io::Result<Option<Output>> {
    let line = line?;
    let (identity, now) = match parse_request(&line) {
        Ok(Some(request)) => request,
        Ok(None) => return Ok(None),
        Err(reason) => {
            warn!(input = %line, %reason, "Skipping malformed line");
            return Ok(Some(Output::Error {
                input: line,
                error: reason,
                rejected: true,
            }));
        }
    };
    let now = now.unwrap_or_else(|| Utc::now().timestamp());

    let output = match guard.decide(&identity, now).await {
        Ok(verdict) => Output::Decision {
            retry_after: guard.retry_after(&verdict, now),
            identity,
            now,
            verdict,
        },
        // Fail safe: a store fault rejects the request, loudly.
        Err(err @ TurnstileError::StoreUnavailable(_)) => {
            error!(%err, identity = %identity, "Store unavailable, rejecting request");
            Output::Error {
                input: line,
                error: err.to_string(),
                rejected: true,
            }
        }
        Err(err) => Output::Error {
            input: line,
            error: err.to_string(),
            rejected: true,
        },
    };
    Ok(Some(output))
}

/// Split `<identity> [<epoch_seconds>]`. Blank lines and `#` comments yield `None`.
fn parse_request(line: &str) -> Result<Option<(String, Option<i64>)>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let mut parts = line.split_whitespace();
    let identity = parts.next().map(str::to_string).unwrap_or_default();
    let now = match parts.next() {
        Some(raw) => Some(
            raw.parse::<i64>()
                .map_err(|e| format!("invalid timestamp '{}': {}", raw, e))?,
        ),
        None => None,
    };
    if parts.next().is_some() {
        return Err("expected '<identity> [<epoch_seconds>]'".to_string());
    }

    Ok(Some((identity, now)))
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(%err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(%err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping");
        }
    }
}
