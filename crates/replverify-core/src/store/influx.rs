//! InfluxDB v2 HTTP adapter.
//!
//! One [`InfluxEndpoint`] talks to one instance (primary or replica) and
//! implements both store seams, so the same type serves either role.
//!
//! # Wire format
//!
//! Writes go to `POST /api/v2/write` as a single line-protocol record:
//!
//! ```text
//! system_metrics,host=web-1,probe_id=0000000003-1700000000000-1a2b3c4d cpu_percent=12.5 1700000000000000000
//! ```
//!
//! Lookups go to `POST /api/v2/query` as Flux and come back as annotated
//! CSV (`#datatype`, `#group` and `#default` rows ahead of each table's
//! header). [`parse_flux_csv`] skips the annotations and turns that body
//! into rows keyed by column name.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use super::{PrimaryStore, ProbeRecord, ReplicaStore, StoreError, StoredRecord};
use crate::config::{EndpointConfig, ProbeConfig};
use crate::identity::SampleId;

/// Tag carrying the sample identity.
pub const PROBE_TAG: &str = "probe_id";

/// Tag carrying the host name.
pub const HOST_TAG: &str = "host";

/// Upper bound on a response body we are willing to parse.
const MAX_RESPONSE_BYTES: usize = 4 * 1024 * 1024;

/// Connect timeout for every request.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// One parsed CSV row, keyed by column name.
pub type FluxRow = BTreeMap<String, String>;

/// A row returned by [`InfluxEndpoint::recent`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecentRow {
    /// Record timestamp.
    pub time: DateTime<Utc>,
    /// Field name.
    pub field: String,
    /// Field value, as rendered by the store.
    pub value: String,
    /// Probe identity tag, if the record carries one.
    pub probe_id: Option<String>,
}

/// HTTP client bound to one InfluxDB v2 instance.
pub struct InfluxEndpoint {
    client: reqwest::Client,
    base_url: String,
    org: String,
    bucket: String,
    measurement: String,
    host: String,
    token: SecretString,
}

impl InfluxEndpoint {
    /// Builds an endpoint.
    ///
    /// `request_timeout` bounds every request end to end, on top of the
    /// caller's own timeouts.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Configuration`] if the HTTP client cannot be
    /// built.
    pub fn new(
        endpoint: &EndpointConfig,
        probe: &ProbeConfig,
        token: SecretString,
        request_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(request_timeout)
            .user_agent(concat!("replverify/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|error| StoreError::Configuration(error.to_string()))?;

        Ok(Self {
            client,
            base_url: endpoint.url.trim_end_matches('/').to_string(),
            org: endpoint.org.clone(),
            bucket: endpoint.bucket.clone(),
            measurement: probe.measurement.clone(),
            host: probe.host.clone(),
            token,
        })
    }

    /// Base URL of this endpoint.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.base_url
    }

    fn authorization(&self) -> String {
        format!("Token {}", self.token.expose_secret())
    }

    async fn query(&self, flux: String) -> Result<Vec<FluxRow>, StoreError> {
        let body = query_body(&flux);

        let response = self
            .client
            .post(format!("{}/api/v2/query", self.base_url))
            .query(&[("org", self.org.as_str())])
            .header(reqwest::header::AUTHORIZATION, self.authorization())
            .header(reqwest::header::ACCEPT, "application/csv")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(api_error(status, &text));
        }
        if text.len() > MAX_RESPONSE_BYTES {
            return Err(StoreError::Parse(format!(
                "response body too large ({} > {MAX_RESPONSE_BYTES} bytes)",
                text.len()
            )));
        }
        parse_flux_csv(&text)
    }

    /// Reads up to `limit` rows of the probe measurement written within
    /// the trailing `window`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails or the response cannot
    /// be parsed.
    pub async fn recent(
        &self,
        window: Duration,
        limit: usize,
    ) -> Result<Vec<RecentRow>, StoreError> {
        let rows = self
            .query(recent_query(&self.bucket, &self.measurement, window, limit))
            .await?;

        rows.iter()
            .filter_map(|row| {
                let time = row.get("_time")?;
                Some(parse_time(time).map(|time| RecentRow {
                    time,
                    field: row.get("_field").cloned().unwrap_or_default(),
                    value: row.get("_value").cloned().unwrap_or_default(),
                    probe_id: row.get(PROBE_TAG).filter(|v| !v.is_empty()).cloned(),
                }))
            })
            .collect()
    }
}

impl std::fmt::Debug for InfluxEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfluxEndpoint")
            .field("base_url", &self.base_url)
            .field("org", &self.org)
            .field("bucket", &self.bucket)
            .field("measurement", &self.measurement)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl PrimaryStore for InfluxEndpoint {
    async fn write(&self, record: &ProbeRecord) -> Result<(), StoreError> {
        let line = encode_line(&self.measurement, &self.host, record)?;
        debug!(url = %self.base_url, identity = %record.identity, "writing probe record");

        let response = self
            .client
            .post(format!("{}/api/v2/write", self.base_url))
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "ns"),
            ])
            .header(reqwest::header::AUTHORIZATION, self.authorization())
            .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(line)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        Err(api_error(status, &text))
    }
}

#[async_trait]
impl ReplicaStore for InfluxEndpoint {
    async fn lookup(
        &self,
        identity: &SampleId,
        window: Duration,
    ) -> Result<Option<StoredRecord>, StoreError> {
        let rows = self
            .query(point_query(&self.bucket, &self.measurement, identity, window))
            .await?;
        Ok(earliest_time(&rows, identity)?.map(|stored_at| StoredRecord {
            identity: identity.clone(),
            stored_at,
        }))
    }
}

fn api_error(status: StatusCode, body: &str) -> StoreError {
    let message: String = body.chars().take(512).collect();
    StoreError::Api {
        status: status.as_u16(),
        message: if message.is_empty() {
            status.to_string()
        } else {
            message
        },
    }
}

fn parse_time(text: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(text)
        .map(|time| time.with_timezone(&Utc))
        .map_err(|error| StoreError::Parse(format!("bad _time {text:?}: {error}")))
}

/// Picks the earliest `_time` among rows tagged with `identity`.
fn earliest_time(
    rows: &[FluxRow],
    identity: &SampleId,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    let wanted = identity.to_string();
    let mut earliest: Option<DateTime<Utc>> = None;
    for row in rows {
        if row.get(PROBE_TAG).is_some_and(|tag| *tag != wanted) {
            continue;
        }
        let Some(text) = row.get("_time") else {
            return Err(StoreError::Parse("row without _time column".to_string()));
        };
        let time = parse_time(text)?;
        earliest = Some(earliest.map_or(time, |seen| seen.min(time)));
    }
    Ok(earliest)
}

// =============================================================================
// Line protocol
// =============================================================================

fn escape_measurement(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, ',' | ' ') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn escape_key(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, ',' | '=' | ' ') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Encodes `record` as one line-protocol line.
///
/// # Errors
///
/// Returns [`StoreError::Rejected`] for records without fields, with
/// non-finite values, or with a timestamp outside the nanosecond range.
pub fn encode_line(
    measurement: &str,
    host: &str,
    record: &ProbeRecord,
) -> Result<String, StoreError> {
    if record.payload.is_empty() {
        return Err(StoreError::Rejected("record has no fields".to_string()));
    }
    let nanos = record.timestamp.timestamp_nanos_opt().ok_or_else(|| {
        StoreError::Rejected(format!("timestamp out of range: {}", record.timestamp))
    })?;

    let mut line = escape_measurement(measurement);
    let _ = write!(
        line,
        ",{HOST_TAG}={},{PROBE_TAG}={}",
        escape_key(host),
        escape_key(&record.identity.to_string())
    );

    let mut separator = ' ';
    for (name, value) in &record.payload {
        if !value.is_finite() {
            return Err(StoreError::Rejected(format!(
                "field {name} is not finite: {value}"
            )));
        }
        let _ = write!(line, "{separator}{}={value}", escape_key(name));
        separator = ',';
    }
    let _ = write!(line, " {nanos}");
    Ok(line)
}

// =============================================================================
// Flux
// =============================================================================

fn flux_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if matches!(c, '"' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

fn flux_window(window: Duration) -> String {
    format!("-{}s", window.as_secs().max(1))
}

/// Flux for a point lookup of one probe record.
#[must_use]
pub fn point_query(
    bucket: &str,
    measurement: &str,
    identity: &SampleId,
    window: Duration,
) -> String {
    format!(
        "from(bucket: {bucket})\n  |> range(start: {start})\n  |> filter(fn: (r) => r._measurement == {measurement} and r.{PROBE_TAG} == {identity})\n  |> limit(n: 1)",
        bucket = flux_string(bucket),
        start = flux_window(window),
        measurement = flux_string(measurement),
        identity = flux_string(&identity.to_string()),
    )
}

/// Flux for the trailing-window read-back.
#[must_use]
pub fn recent_query(bucket: &str, measurement: &str, window: Duration, limit: usize) -> String {
    format!(
        "from(bucket: {bucket})\n  |> range(start: {start})\n  |> filter(fn: (r) => r._measurement == {measurement})\n  |> limit(n: {limit})",
        bucket = flux_string(bucket),
        start = flux_window(window),
        measurement = flux_string(measurement),
    )
}

// =============================================================================
// CSV
// =============================================================================

fn split_csv_line(line: &str) -> Vec<String> {
    let mut cells = Vec::new();
    let mut cell = String::new();
    let mut chars = line.chars().peekable();
    let mut quoted = false;

    while let Some(c) = chars.next() {
        match (c, quoted) {
            ('"', true) if chars.peek() == Some(&'"') => {
                chars.next();
                cell.push('"');
            },
            ('"', _) => quoted = !quoted,
            (',', false) => cells.push(std::mem::take(&mut cell)),
            _ => cell.push(c),
        }
    }
    cells.push(cell);
    cells
}

/// Parses a Flux CSV response into rows keyed by column name.
///
/// Tables are separated by blank lines and each starts with its own
/// header row. Annotation rows (leading `#`) are skipped. A table whose
/// header has an `error` column is the server reporting a failed query.
///
/// # Errors
///
/// Returns [`StoreError::Parse`] when the server embedded an error table.
pub fn parse_flux_csv(body: &str) -> Result<Vec<FluxRow>, StoreError> {
    let mut rows = Vec::new();
    let mut header: Option<Vec<String>> = None;

    for raw in body.lines() {
        let line = raw.trim_end_matches('\r');
        if line.trim().is_empty() {
            header = None;
            continue;
        }
        if line.starts_with('#') {
            continue;
        }

        let cells = split_csv_line(line);
        let Some(columns) = header.as_ref() else {
            header = Some(cells);
            continue;
        };

        let row: FluxRow = columns
            .iter()
            .zip(cells)
            .filter(|(name, _)| !name.is_empty())
            .map(|(name, value)| (name.clone(), value))
            .collect();

        if columns.iter().any(|name| name == "error") {
            let message = row.get("error").cloned().unwrap_or_default();
            return Err(StoreError::Parse(format!("query error: {message}")));
        }
        rows.push(row);
    }
    Ok(rows)
}

/// Request body for a Flux query answered as annotated CSV.
fn query_body(flux: &str) -> serde_json::Value {
    json!({
        "query": flux,
        "type": "flux",
        "dialect": {
            "header": true,
            "annotations": ["datatype", "group", "default"],
            "delimiter": ",",
        },
    })
}
