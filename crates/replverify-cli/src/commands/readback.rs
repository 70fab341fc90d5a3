//! `replverify readback`: recent probe rows from both endpoints.
//!
//! A quick manual check that the primary holds recent probe records and
//! that they made it to the replica.

use std::path::Path;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::Args;
use replverify_core::store::RecentRow;
use replverify_core::{EndpointConfig, InfluxEndpoint, ProbeConfig};

use super::load_config;

/// Bound on a single read-back query.
const READBACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on `--limit`.
pub const MAX_READBACK_ROWS: usize = 1000;

/// Arguments for `replverify readback`.
#[derive(Debug, Args)]
pub struct ReadbackArgs {
    /// How far back to look.
    #[arg(long, default_value = "5m", value_parser = humantime::parse_duration)]
    pub window: Duration,

    /// Rows to show per endpoint (max 1000).
    #[arg(long, default_value_t = 5)]
    pub limit: usize,
}

/// Queries both endpoints and prints what they return.
pub async fn run(config_path: &Path, args: &ReadbackArgs) -> Result<()> {
    let config = load_config(config_path)?;
    let (primary, replica) = config.endpoints()?;
    let limit = args.limit.min(MAX_READBACK_ROWS);

    let (primary_rows, replica_rows) = tokio::join!(
        read_recent(primary, &config.probe, args.window, limit),
        read_recent(replica, &config.probe, args.window, limit),
    );

    let mut failures = 0;
    for (label, endpoint, rows) in [
        ("primary", primary, primary_rows),
        ("replica", replica, replica_rows),
    ] {
        println!(
            "{label} {} (last {})",
            endpoint.url,
            humantime::format_duration(args.window)
        );
        match rows {
            Ok(rows) if rows.is_empty() => println!("  no probe rows"),
            Ok(rows) => {
                for row in &rows {
                    println!("  {}", format_row(row));
                }
            },
            Err(error) => {
                failures += 1;
                println!("  error: {error:#}");
            },
        }
    }

    if failures > 0 {
        bail!("read-back failed on {failures} endpoint(s)");
    }
    Ok(())
}

async fn read_recent(
    endpoint: &EndpointConfig,
    probe: &ProbeConfig,
    window: Duration,
    limit: usize,
) -> Result<Vec<RecentRow>> {
    let client = InfluxEndpoint::new(endpoint, probe, endpoint.resolve_token()?, READBACK_TIMEOUT)?;
    Ok(client.recent(window, limit).await?)
}

fn format_row(row: &RecentRow) -> String {
    let mut line = format!(
        "{} {}={}",
        row.time.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        row.field,
        row.value
    );
    if let Some(probe_id) = &row.probe_id {
        line.push_str(" probe_id=");
        line.push_str(probe_id);
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_render_on_one_line() {
        let row = RecentRow {
            time: "2024-05-01T12:00:00.250Z".parse().unwrap(),
            field: "cpu_percent".to_string(),
            value: "3.5".to_string(),
            probe_id: Some("0000000001-1714564800250-0000beef".to_string()),
        };

        assert_eq!(
            format_row(&row),
            "2024-05-01T12:00:00.250Z cpu_percent=3.5 probe_id=0000000001-1714564800250-0000beef"
        );
    }

    #[test]
    fn rows_without_probe_id() {
        let row = RecentRow {
            time: "2024-05-01T12:00:00Z".parse().unwrap(),
            field: "memory_percent".to_string(),
            value: "41".to_string(),
            probe_id: None,
        };

        assert_eq!(format_row(&row), "2024-05-01T12:00:00.000Z memory_percent=41");
    }
}
