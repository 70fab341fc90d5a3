//! `replverify run`: one verification batch.
//!
//! # Exit Codes
//!
//! - 0: the run passed
//! - 1: the run failed, or could not start

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use prometheus::Registry;
use replverify_core::{
    FixedPayload, InfluxEndpoint, PayloadSource, PrimaryStore, ReplicaStore, RunReport,
    SimulatedCluster, VerificationEngine, VerifierConfig, VerifierMetrics,
};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{OutputFormat, load_config};
use crate::host::HostMetricsSource;

/// Exit codes for `run`.
pub mod exit_codes {
    /// The run passed.
    pub const PASSED: u8 = 0;
    /// The run failed.
    pub const FAILED: u8 = 1;
}

/// Arguments for `replverify run`.
#[derive(Debug, Args)]
pub struct RunArgs {
    /// Verify against an in-process simulated replica with this lag
    /// (e.g. `150ms`) instead of the configured endpoints.
    #[arg(long, value_parser = humantime::parse_duration)]
    pub simulate: Option<Duration>,

    /// Report format.
    #[arg(long, value_enum, default_value_t)]
    pub format: OutputFormat,

    /// Write Prometheus metrics in text format to this file after the run.
    #[arg(long)]
    pub metrics_out: Option<PathBuf>,
}

type Stores = (Arc<dyn PrimaryStore>, Arc<dyn ReplicaStore>);

/// Runs one batch and returns the process exit code.
pub async fn run(config_path: &Path, args: &RunArgs) -> Result<u8> {
    let config = load_config(config_path)?;

    let ((primary, replica), payloads): (Stores, Arc<dyn PayloadSource>) = match args.simulate {
        Some(lag) => {
            info!(lag = ?lag, "using simulated cluster");
            let cluster = SimulatedCluster::new(lag);
            (
                (Arc::new(cluster.primary()), Arc::new(cluster.replica())),
                Arc::new(FixedPayload::default()),
            )
        },
        None => (connect(&config)?, Arc::new(HostMetricsSource::new())),
    };

    let registry = Registry::new();
    let metrics = VerifierMetrics::new(&registry).context("failed to register metrics")?;
    let mut engine = VerificationEngine::new(config.run.clone(), primary, replica, payloads)?
        .with_metrics(metrics.clone());

    let cancel = CancellationToken::new();
    let signals = tokio::spawn(cancel_on_signal(cancel.clone()));
    let report = engine.run(cancel).await;
    signals.abort();

    print_report(&report, args.format)?;
    if let Some(path) = &args.metrics_out {
        let text = metrics.encode_text()?;
        std::fs::write(path, text)
            .with_context(|| format!("failed to write metrics to {}", path.display()))?;
    }

    Ok(if report.passed {
        exit_codes::PASSED
    } else {
        exit_codes::FAILED
    })
}

fn connect(config: &VerifierConfig) -> Result<Stores> {
    let (primary, replica) = config.endpoints()?;
    let primary = InfluxEndpoint::new(
        primary,
        &config.probe,
        primary.resolve_token()?,
        config.run.write_timeout,
    )
    .context("failed to set up primary endpoint")?;
    let replica = InfluxEndpoint::new(
        replica,
        &config.probe,
        replica.resolve_token()?,
        config.run.poll_timeout,
    )
    .context("failed to set up replica endpoint")?;
    info!(primary = primary.url(), replica = replica.url(), "verifying endpoints");
    Ok((Arc::new(primary), Arc::new(replica)))
}

fn print_report(report: &RunReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => print!("{report}"),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
    }
    Ok(())
}

/// Cancels `cancel` on the first SIGINT or SIGTERM.
async fn cancel_on_signal(cancel: CancellationToken) {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(error) => {
            warn!(error = %error, "failed to register SIGTERM handler");
            return;
        },
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
    }
    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const CONFIG: &str = r#"
        [run]
        sample_count = 3
        write_interval = "100ms"
        replica_deadline = "1s"
        max_lag = "300ms"
        poll_interval = "50ms"
        max_concurrency = 4
    "#;

    fn config_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CONFIG.as_bytes()).unwrap();
        file
    }

    #[tokio::test(start_paused = true)]
    async fn simulated_run_passes_and_writes_metrics() {
        let config = config_file();
        let metrics_dir = tempfile::tempdir().unwrap();
        let metrics_path = metrics_dir.path().join("metrics.prom");
        let args = RunArgs {
            simulate: Some(Duration::from_millis(20)),
            format: OutputFormat::Json,
            metrics_out: Some(metrics_path.clone()),
        };

        let code = run(config.path(), &args).await.unwrap();

        assert_eq!(code, exit_codes::PASSED);
        let metrics = std::fs::read_to_string(metrics_path).unwrap();
        assert!(metrics.contains("replverify_samples_total{status=\"observed\"} 3"));
        assert!(metrics.contains("replverify_run_passed 1"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_simulated_replica_fails() {
        let config = config_file();
        let args = RunArgs {
            simulate: Some(Duration::from_millis(500)),
            format: OutputFormat::Text,
            metrics_out: None,
        };

        let code = run(config.path(), &args).await.unwrap();

        assert_eq!(code, exit_codes::FAILED);
    }

    #[tokio::test]
    async fn real_endpoints_require_sections() {
        let config = config_file();
        let args = RunArgs {
            simulate: None,
            format: OutputFormat::Text,
            metrics_out: None,
        };

        let error = run(config.path(), &args).await.unwrap_err();

        assert!(format!("{error:#}").contains("missing [primary] section"));
    }
}
