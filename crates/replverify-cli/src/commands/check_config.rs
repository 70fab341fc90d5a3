//! `replverify check-config`: validate and print the configuration.

use std::path::Path;

use anyhow::Result;

use super::load_config;

/// Loads the file, reports on token availability, and prints the
/// normalised configuration (defaults filled in) to stdout.
pub fn run(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;

    for (label, endpoint) in [("primary", &config.primary), ("replica", &config.replica)] {
        match endpoint {
            Some(endpoint) => match endpoint.resolve_token() {
                Ok(_) => eprintln!("{label}: {} (token from ${})", endpoint.url, endpoint.token_env),
                Err(error) => eprintln!("{label}: {} ({error})", endpoint.url),
            },
            None => eprintln!("{label}: not configured; only `run --simulate` is available"),
        }
    }

    print!("{}", config.to_toml()?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn accepts_a_minimal_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            br#"
            [run]
            sample_count = 1
            write_interval = "1s"
            replica_deadline = "2s"
            max_lag = "1s"
            poll_interval = "200ms"
            max_concurrency = 1
            "#,
        )
        .unwrap();

        run(file.path()).unwrap();
    }

    #[test]
    fn rejects_invalid_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            br#"
            [run]
            sample_count = 1
            write_interval = "1s"
            replica_deadline = "100ms"
            max_lag = "1s"
            poll_interval = "200ms"
            max_concurrency = 1
            "#,
        )
        .unwrap();

        let error = run(file.path()).unwrap_err();
        assert!(format!("{error:#}").contains("poll_interval"));
    }
}
