//! Configuration parsing and validation.
//!
//! A run is configured from a TOML file:
//!
//! ```toml
//! [primary]
//! url = "https://primary.example.com:8086"
//! org = "ops"
//! bucket = "metrics"
//! token_env = "INFLUX_TOKEN"
//!
//! [replica]
//! url = "https://replica.example.com:8086"
//! org = "ops"
//! bucket = "metrics"
//! token_env = "INFLUX_TOKEN"
//!
//! [run]
//! sample_count = 5
//! write_interval = "1s"
//! replica_deadline = "10s"
//! max_lag = "2s"
//! poll_interval = "200ms"
//! max_concurrency = 16
//! ```
//!
//! The six core `[run]` keys are required. Everything else has a
//! documented default.

use std::path::Path;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

/// Largest accepted `sample_count`.
pub const MAX_SAMPLE_COUNT: u32 = 100_000;

/// Top-level configuration.
///
/// `[primary]` and `[replica]` may be left out of the file. A simulated
/// run needs neither; anything that talks to real endpoints goes through
/// [`VerifierConfig::endpoints`], which rejects a missing section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VerifierConfig {
    /// Primary (write) endpoint.
    #[serde(default)]
    pub primary: Option<EndpointConfig>,

    /// Replica (read) endpoint.
    #[serde(default)]
    pub replica: Option<EndpointConfig>,

    /// How probe records are labelled.
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Run parameters.
    pub run: RunConfig,
}

impl VerifierConfig {
    /// Loads and validates a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses and validates a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] describing the first problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.run.validate()?;
        self.probe.validate()?;
        if let Some(primary) = &self.primary {
            primary.validate("primary")?;
        }
        if let Some(replica) = &self.replica {
            replica.validate("replica")?;
        }
        Ok(())
    }

    /// Both endpoints, or an error naming the missing one.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if a section is absent.
    pub fn endpoints(&self) -> Result<(&EndpointConfig, &EndpointConfig), ConfigError> {
        let primary = self
            .primary
            .as_ref()
            .ok_or_else(|| ConfigError::Validation("missing [primary] section".to_string()))?;
        let replica = self
            .replica
            .as_ref()
            .ok_or_else(|| ConfigError::Validation("missing [replica] section".to_string()))?;
        Ok((primary, replica))
    }
}

/// One InfluxDB v2 endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EndpointConfig {
    /// Base URL, e.g. `https://host:8086`.
    pub url: String,

    /// Organisation name.
    pub org: String,

    /// Bucket name.
    pub bucket: String,

    /// Name of the environment variable holding the API token.
    ///
    /// The token itself never lives in the config file.
    pub token_env: String,
}

impl EndpointConfig {
    fn validate(&self, section: &str) -> Result<(), ConfigError> {
        for (field, value) in [
            ("url", &self.url),
            ("org", &self.org),
            ("bucket", &self.bucket),
            ("token_env", &self.token_env),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "{section}.{field} must not be empty"
                )));
            }
        }
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Err(ConfigError::Validation(format!(
                "{section}.url must be an http(s) URL, got {:?}",
                self.url
            )));
        }
        Ok(())
    }

    /// Reads the API token from the configured environment variable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingToken`] if the variable is unset or
    /// blank.
    pub fn resolve_token(&self) -> Result<SecretString, ConfigError> {
        match std::env::var(&self.token_env) {
            Ok(token) if !token.trim().is_empty() => Ok(SecretString::from(token)),
            _ => Err(ConfigError::MissingToken(self.token_env.clone())),
        }
    }
}

/// Labels applied to probe records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ProbeConfig {
    /// Measurement name.
    #[serde(default = "default_measurement")]
    pub measurement: String,

    /// Value of the `host` tag.
    #[serde(default = "default_host")]
    pub host: String,
}

impl ProbeConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.measurement.trim().is_empty() {
            return Err(ConfigError::Validation(
                "probe.measurement must not be empty".to_string(),
            ));
        }
        if self.host.trim().is_empty() {
            return Err(ConfigError::Validation(
                "probe.host must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            measurement: default_measurement(),
            host: default_host(),
        }
    }
}

fn default_measurement() -> String {
    "system_metrics".to_string()
}

fn default_host() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|host| !host.trim().is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Parameters of one verification run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    /// Number of write/observe cycles.
    pub sample_count: u32,

    /// Spacing between successive writes.
    #[serde(with = "humantime_serde")]
    pub write_interval: Duration,

    /// Longest wait for one sample to appear on the replica.
    #[serde(with = "humantime_serde")]
    pub replica_deadline: Duration,

    /// Lag above which an observed sample still fails the run.
    #[serde(with = "humantime_serde")]
    pub max_lag: Duration,

    /// Spacing between replica lookups for one sample.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Observation tasks allowed to poll at the same time.
    pub max_concurrency: usize,

    /// Bound on a single primary write.
    #[serde(default = "default_write_timeout", with = "humantime_serde")]
    pub write_timeout: Duration,

    /// Bound on a single replica lookup.
    #[serde(default = "default_poll_timeout", with = "humantime_serde")]
    pub poll_timeout: Duration,

    /// Consecutive transient lookup errors before an observation is
    /// abandoned.
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,

    /// Extra time granted to the drain phase beyond `replica_deadline`.
    #[serde(default = "default_drain_slack", with = "humantime_serde")]
    pub drain_slack: Duration,

    /// Trailing time range searched by replica lookups.
    #[serde(default = "default_lookup_window", with = "humantime_serde")]
    pub lookup_window: Duration,
}

const fn default_write_timeout() -> Duration {
    Duration::from_secs(5)
}

const fn default_poll_timeout() -> Duration {
    Duration::from_secs(1)
}

const fn default_max_consecutive_errors() -> u32 {
    5
}

const fn default_drain_slack() -> Duration {
    Duration::from_secs(2)
}

const fn default_lookup_window() -> Duration {
    Duration::from_secs(300)
}

impl RunConfig {
    /// Creates a run configuration from the six core options; ancillary
    /// settings take their defaults.
    #[must_use]
    pub const fn new(
        sample_count: u32,
        write_interval: Duration,
        replica_deadline: Duration,
        max_lag: Duration,
        poll_interval: Duration,
        max_concurrency: usize,
    ) -> Self {
        Self {
            sample_count,
            write_interval,
            replica_deadline,
            max_lag,
            poll_interval,
            max_concurrency,
            write_timeout: default_write_timeout(),
            poll_timeout: default_poll_timeout(),
            max_consecutive_errors: default_max_consecutive_errors(),
            drain_slack: default_drain_slack(),
            lookup_window: default_lookup_window(),
        }
    }

    /// Checks ranges and cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] describing the first problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Validation(msg));

        if self.sample_count > MAX_SAMPLE_COUNT {
            return invalid(format!(
                "run.sample_count too large: {} > {MAX_SAMPLE_COUNT}",
                self.sample_count
            ));
        }
        if self.max_concurrency == 0 {
            return invalid("run.max_concurrency must be at least 1".to_string());
        }
        for (field, value) in [
            ("poll_interval", self.poll_interval),
            ("write_timeout", self.write_timeout),
            ("poll_timeout", self.poll_timeout),
        ] {
            if value.is_zero() {
                return invalid(format!("run.{field} must be non-zero"));
            }
        }
        if self.poll_interval > self.replica_deadline {
            return invalid(format!(
                "run.poll_interval ({}) exceeds run.replica_deadline ({})",
                humantime::format_duration(self.poll_interval),
                humantime::format_duration(self.replica_deadline)
            ));
        }
        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// I/O error reading the configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// The token environment variable is unset or empty.
    #[error("API token environment variable {0} is not set")]
    MissingToken(String),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

pub(crate) mod humantime_serde {
    //! Durations as human-readable strings (`"200ms"`, `"2s"`).

    use std::borrow::Cow;
    use std::time::Duration;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = Cow::<'de, str>::deserialize(deserializer)?;
        humantime::parse_duration(text.trim())
            .map_err(|error| D::Error::custom(format!("invalid duration {text:?}: {error}")))
    }
}
