//! drivesync daemon: keeps a local folder and a mirror directory in sync.

use clap::Parser;
use derive_more::{Display, Error};
use drivesync_config::Config;
use drivesync_engine::{CycleReport, Engine, EngineOptions};
use drivesync_snapshot::BaselineStore;
use drivesync_storage::StaticCredentials;
use drivesync_storage::backend::LocalBackend;
use exn::ResultExt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Longest pause between cycles while cycles keep failing.
const MAX_BACKOFF: Duration = Duration::from_secs(30 * 60);

#[derive(Parser)]
#[command(name = "drivesync", version, about = "Periodic local-folder to cloud-drive synchronizer")]
struct Cli {
    /// Configuration file [default: ~/.drivesync/configuration.toml]
    #[arg(long)]
    config: Option<PathBuf>,
    /// Run a single cycle and exit.
    #[arg(long)]
    once: bool,
    /// Report what would change without touching either side.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Display, Error)]
enum ErrorKind {
    #[display("configuration error")]
    Config,
    #[display("could not open the sync roots")]
    Setup,
    #[display("synchronization stopped")]
    Sync,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = ?err, "Exiting");
            ExitCode::FAILURE
        },
    }
}

async fn run(cli: Cli) -> Result<(), exn::Exn<ErrorKind>> {
    let mut config = Config::load(cli.config.as_deref()).or_raise(|| ErrorKind::Config)?;
    config.dry_run |= cli.dry_run;
    config.ensure_directories().or_raise(|| ErrorKind::Config)?;
    tracing::info!(
        local = %config.local_root.display(),
        remote = %config.remote.root.display(),
        interval_s = config.sync_interval_seconds,
        dry_run = config.dry_run,
        "Starting"
    );

    let local = LocalBackend::new("local", &config.local_root)
        .or_raise(|| ErrorKind::Setup)?
        .with_fingerprint(config.fingerprint);
    let mirror = LocalBackend::new("mirror", &config.remote.root)
        .or_raise(|| ErrorKind::Setup)?
        .with_page_size(config.remote.page_size);
    let token = CancellationToken::new();
    let engine = Engine::new(
        local,
        Arc::new(mirror),
        Arc::new(StaticCredentials::default()),
        BaselineStore::new(&config.baseline_path),
        EngineOptions {
            concurrency: config.concurrency,
            retry: config.retry_policy(),
            orphan_policy: config.orphan_policy,
            cycle_timeout: config.cycle_timeout(),
            dry_run: config.dry_run,
        },
    )
    .with_cancellation(token.clone());

    tokio::spawn({
        let token = token.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupted; finishing running operations");
                token.cancel();
            }
        }
    });

    let interval = config.sync_interval();
    let mut failures = 0;
    loop {
        let pause = match engine.run_one_cycle().await {
            Ok(report) => {
                failures = 0;
                let took = report.duration();
                match report.has_problems() {
                    true => tracing::warn!(%report, ?took, "{}", summary(&report)),
                    false => tracing::info!(%report, ?took, "{}", summary(&report)),
                }
                for conflict in &report.conflicts {
                    tracing::warn!(%conflict, "Unresolved conflict");
                }
                interval
            },
            Err(err) if err.is_fatal() || cli.once => return Err(err).or_raise(|| ErrorKind::Sync),
            Err(err) => {
                failures += 1;
                let pause = backoff(interval, failures);
                tracing::warn!(error = ?err, failures, retry_in_s = pause.as_secs(), "Cycle failed");
                pause
            },
        };
        if cli.once || token.is_cancelled() {
            break;
        }
        tokio::select! {
            () = token.cancelled() => break,
            () = tokio::time::sleep(pause) => {},
        }
    }
    tracing::info!("Stopped");
    Ok(())
}

/// Headline for a finished cycle.
fn summary(report: &CycleReport) -> &'static str {
    match (report.has_problems(), report.changed()) {
        (true, _) => "Synchronized with problems",
        (false, true) => "Synchronized",
        (false, false) => "Nothing changed",
    }
}

/// Pause after `failures` consecutive failed cycles: the interval, doubled
/// for each further failure, capped at [`MAX_BACKOFF`].
fn backoff(interval: Duration, failures: u32) -> Duration {
    let factor = 2u32.saturating_pow(failures.saturating_sub(1));
    interval.saturating_mul(factor).min(MAX_BACKOFF.max(interval))
}
