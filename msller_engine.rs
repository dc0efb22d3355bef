//! # Msller Engine - Max Stable Line Estimator
//!
//! Tracks the lowest sustained IOPS rate a storage cluster has exhibited and
//! publishes it, clamped below by an administrator floor, as the cluster's
//! Max Stable Line (MSL).
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                              MSLLER ENGINE                               │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  STAT SOURCE → RATE SAMPLER → SAMPLE LOG → STABLE-LINE ANALYZER → STORE  │
//! │       └────────────────→ QUERY RESPONDER ←──────────────────────────┘    │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! - **Rate Sampler**: converts one delta snapshot per cycle into an IOPS
//!   record appended to the durable sample log.
//! - **Stable-Line Analyzer**: scans the log, takes the rolling minimum total
//!   IOPS, clamps it to `msl_threshold` and publishes `msl_value`.
//! - **Threshold Initializer**: seeds the floor at startup.
//! - **Query Responder**: answers the `msller` command with live rates and
//!   the published MSL.

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

#![allow(dead_code)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::collections::BTreeMap;
use std::fmt::{self, Debug, Display, Formatter};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader as TokioBufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal;
use tokio::task::JoinHandle as TokioJoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

// ----------------------------------------------------------------------------
// Concurrency Primitives
// ----------------------------------------------------------------------------
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

// ----------------------------------------------------------------------------
// String Optimization
// ----------------------------------------------------------------------------
use compact_str::CompactString;

// ----------------------------------------------------------------------------
// Filesystem
// ----------------------------------------------------------------------------
use tempfile::NamedTempFile;

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{anyhow, Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, trace, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt as tracing_fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

// ----------------------------------------------------------------------------
// Time & Timestamps
// ----------------------------------------------------------------------------
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

// ----------------------------------------------------------------------------
// Networking
// ----------------------------------------------------------------------------
use reqwest::Client as HttpClient;

// ----------------------------------------------------------------------------
// Async Traits
// ----------------------------------------------------------------------------
use async_trait::async_trait;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};

// ----------------------------------------------------------------------------
// CLI
// ----------------------------------------------------------------------------
use clap::{Parser, Subcommand};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "msller-engine";
pub const ENGINE_FULL_NAME: &str = "Msller Max Stable Line Engine";

/// Command identifier answered by the query responder
pub const COMMAND_PREFIX: &str = "msller";

// ----------------------------------------------------------------------------
// Durable State Keys
// ----------------------------------------------------------------------------

/// Administrator floor below which the published MSL never falls
pub const KEY_MSL_THRESHOLD: &str = "msl_threshold";

/// Published Max Stable Line
pub const KEY_MSL_VALUE: &str = "msl_value";

/// Floor seeded when no threshold has been configured yet
pub const DEFAULT_MSL_THRESHOLD: f64 = 100.0;

/// Namespace applied to every key in the state store
pub const DEFAULT_STORE_PREFIX: &str = "mgr/msller/";

// ----------------------------------------------------------------------------
// Timing & Intervals
// ----------------------------------------------------------------------------

/// Default sampling period (milliseconds)
pub const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 1000;

/// One-time pause before the first sample (milliseconds)
pub const DEFAULT_SAMPLE_INITIAL_DELAY_MS: u64 = 1000;

/// Minimum allowed sampling period (milliseconds)
pub const MIN_SAMPLE_INTERVAL_MS: u64 = 100;

/// Default analysis period (seconds)
pub const DEFAULT_ANALYZE_INTERVAL_SECS: u64 = 60;

/// One-time pause before the first analysis (seconds)
pub const DEFAULT_ANALYZE_INITIAL_DELAY_SECS: u64 = 2;

/// Default timeout for HTTP stat requests (seconds)
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 5;

/// Timeout for a client waiting on the command socket (seconds)
pub const COMMAND_TIMEOUT_SECS: u64 = 10;

/// Grace period for shutdown (seconds)
pub const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 10;

// ----------------------------------------------------------------------------
// Paths & Endpoints
// ----------------------------------------------------------------------------

/// Directory holding the durable sample log
pub const DEFAULT_LOG_DIR: &str = "/var/log/ceph";

/// Durable state store file
pub const DEFAULT_STATE_PATH: &str = "/var/lib/msller/state.json";

/// Command socket served by the daemon
pub const DEFAULT_UNIX_SOCKET_PATH: &str = "/run/msller/msller.sock";

/// Endpoint returning the cluster `io_rate` report
pub const DEFAULT_STAT_URL: &str = "http://127.0.0.1:9283/api/io_rate";

// ----------------------------------------------------------------------------
// Sample Log Format
// ----------------------------------------------------------------------------

/// Separates the timestamp from the rate values
pub const LOG_FIELD_SEPARATOR: char = '|';

/// Separates the read, write and total values
pub const LOG_VALUE_SEPARATOR: char = ',';

/// Timestamp layout written by the sampler (UTC, millisecond precision)
pub const LOG_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Timestamp layouts accepted by the analyzer
const LOG_TIMESTAMP_PARSE_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

// ----------------------------------------------------------------------------
// Rendering
// ----------------------------------------------------------------------------

/// Default render width of the query table
pub const DEFAULT_RENDER_WIDTH: usize = 90;

/// Column names of the query table
pub const MSL_COLUMNS: [&str; 7] = [
    "Read",
    "Write",
    "Total",
    "Read IOPS",
    "Write IOPS",
    "Total IOPS",
    "MSL",
];

/// Stat counters are reported in kB
pub const BYTES_PER_KB: f64 = 1024.0;

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Timestamp Types
// ----------------------------------------------------------------------------

/// Timestamp in nanoseconds since Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Create a new timestamp from nanoseconds since Unix epoch
    #[inline]
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    /// Create a new timestamp from milliseconds since Unix epoch
    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis * 1_000_000)
    }

    /// Get the current timestamp
    #[inline]
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_nanos() as i64)
    }

    #[inline]
    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn as_millis(&self) -> i64 {
        self.0 / 1_000_000
    }

    /// Calculate duration between two timestamps
    #[inline]
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        let nanos = self.0.saturating_sub(earlier.0);
        Duration::from_nanos(nanos.max(0) as u64)
    }

    /// Convert to chrono DateTime<Utc>
    pub fn to_datetime(&self) -> DateTime<Utc> {
        let secs = self.0.div_euclid(1_000_000_000);
        let nanos = self.0.rem_euclid(1_000_000_000) as u32;
        DateTime::from_timestamp(secs, nanos).unwrap_or_default()
    }

    /// Create from chrono DateTime<Utc>
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp_nanos_opt().unwrap_or(0))
    }

    /// Render for the sample log (millisecond precision).
    pub fn to_log_string(&self) -> String {
        self.to_datetime().format(LOG_TIMESTAMP_FORMAT).to_string()
    }

    /// Parse a sample log timestamp.
    ///
    /// Accepts the sampler's own layout, ISO-8601 with a `T` separator,
    /// RFC 3339, and the legacy `2024-01-01 12:00:00,123.123` layout written
    /// by older samplers.
    ///
    /// Timestamps without an offset are read as UTC. Legacy lines were
    /// stamped in the writer's local time, so they may be shifted by that
    /// host's offset; analysis only uses the IOPS fields.
    pub fn parse_log(text: &str) -> Option<Self> {
        let text = text.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
            return Some(Self::from_datetime(dt.with_timezone(&Utc)));
        }
        for format in LOG_TIMESTAMP_PARSE_FORMATS {
            if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
                return Some(Self::from_datetime(Utc.from_utc_datetime(&naive)));
            }
        }

        let (head, tail) = text.split_once(',')?;
        let naive = NaiveDateTime::parse_from_str(head, "%Y-%m-%d %H:%M:%S").ok()?;
        let millis: String = tail.chars().take_while(|c| c.is_ascii_digit()).collect();
        let millis: i64 = millis.parse().ok()?;
        let base = Utc.from_utc_datetime(&naive).timestamp_millis();
        Some(Self::from_millis(base + millis))
    }

    /// Zero timestamp (Unix epoch)
    pub const EPOCH: Timestamp = Timestamp(0);
}

impl Default for Timestamp {
    #[inline]
    fn default() -> Self {
        Self::now()
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_log_string())
    }
}

impl From<SystemTime> for Timestamp {
    fn from(st: SystemTime) -> Self {
        let duration = st.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self(duration.as_nanos() as i64)
    }
}

// ----------------------------------------------------------------------------
// 3.2 Atomic Float
// ----------------------------------------------------------------------------

/// An atomic f64 value using bit casting to AtomicU64.
#[derive(Debug)]
#[repr(transparent)]
pub struct AtomicF64 {
    bits: AtomicU64,
}

impl AtomicF64 {
    #[inline]
    pub const fn new(val: f64) -> Self {
        Self {
            bits: AtomicU64::new(val.to_bits()),
        }
    }

    #[inline]
    pub fn load(&self, ordering: AtomicOrdering) -> f64 {
        f64::from_bits(self.bits.load(ordering))
    }

    #[inline]
    pub fn store(&self, val: f64, ordering: AtomicOrdering) {
        self.bits.store(val.to_bits(), ordering);
    }
}

impl Default for AtomicF64 {
    fn default() -> Self {
        Self::new(0.0)
    }
}

// ----------------------------------------------------------------------------
// 3.3 Delta Snapshot - Raw Activity Since The Previous Report
// ----------------------------------------------------------------------------

/// Cumulative cluster activity since the previous snapshot.
///
/// Counters come straight from the host's `io_rate` report. A negative
/// counter (the host's delta regressed, e.g. after placement groups were
/// removed) is kept as reported and counts as zero activity when rates are
/// derived.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DeltaSnapshot {
    /// Seconds covered by the counters
    pub elapsed_seconds: f64,
    /// kB read
    pub read_kb: i64,
    /// kB written
    pub write_kb: i64,
    /// Read operations
    pub read_ops: i64,
    /// Write operations
    pub write_ops: i64,
}

impl DeltaSnapshot {
    /// Every field the `io_rate` report must carry.
    pub const REQUIRED_FIELDS: [&'static str; 7] = [
        "pg_stats_delta",
        "pg_stats_delta.stamp_delta",
        "pg_stats_delta.stat_sum",
        "pg_stats_delta.stat_sum.num_read_kb",
        "pg_stats_delta.stat_sum.num_write_kb",
        "pg_stats_delta.stat_sum.num_read",
        "pg_stats_delta.stat_sum.num_write",
    ];

    /// Extract a snapshot from an `io_rate` report.
    ///
    /// ```text
    /// { "pg_stats_delta": { "stamp_delta": "2.0",
    ///                       "stat_sum": { "num_read_kb": 20, "num_write_kb": 10,
    ///                                     "num_read": 10, "num_write": 5 } } }
    /// ```
    pub fn from_io_rate(report: &JsonValue) -> StatResult<Self> {
        let delta = lookup(report, &["pg_stats_delta"])?;
        let elapsed = lookup(delta, &["pg_stats_delta", "stamp_delta"])?;
        let elapsed_seconds = json_f64(elapsed)
            .filter(|v| !v.is_nan())
            .ok_or_else(|| StatError::malformed("pg_stats_delta.stamp_delta", "not a number"))?;

        let sum = lookup(delta, &["pg_stats_delta", "stat_sum"])?;
        let counter = |name: &str| -> StatResult<i64> {
            let path = format!("pg_stats_delta.stat_sum.{}", name);
            let value = sum
                .get(name)
                .ok_or_else(|| StatError::malformed(path.clone(), "missing"))?;
            json_i64(value).ok_or_else(|| StatError::malformed(path, "not an integer"))
        };

        Ok(Self {
            elapsed_seconds,
            read_kb: counter("num_read_kb")?,
            write_kb: counter("num_write_kb")?,
            read_ops: counter("num_read")?,
            write_ops: counter("num_write")?,
        })
    }

    /// Whether a rate can be derived from this snapshot.
    #[inline]
    pub fn has_elapsed(&self) -> bool {
        self.elapsed_seconds > 0.0
    }
}

/// Walk one level down `parent`, naming the full path on failure.
fn lookup<'a>(parent: &'a JsonValue, path: &[&str]) -> StatResult<&'a JsonValue> {
    let key = path.last().copied().unwrap_or_default();
    parent
        .get(key)
        .ok_or_else(|| StatError::malformed(path.join("."), "missing"))
}

/// Hosts report numbers either as JSON numbers or as numeric strings.
fn json_f64(value: &JsonValue) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

fn json_i64(value: &JsonValue) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_u64().map(|v| v.min(i64::MAX as u64) as i64))
        .or_else(|| {
            value
                .as_f64()
                .filter(|f| f.is_finite() && f.fract() == 0.0)
                .map(|f| f as i64)
        })
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

// ----------------------------------------------------------------------------
// 3.4 Rate Sample - Instantaneous Rates
// ----------------------------------------------------------------------------

/// Instantaneous rates derived from one delta snapshot.
///
/// Byte rates are for display only; only the IOPS values reach the log.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RateSample {
    pub read_iops: f64,
    pub write_iops: f64,
    pub total_iops: f64,
    pub read_bytes_per_sec: f64,
    pub write_bytes_per_sec: f64,
    pub total_bytes_per_sec: f64,
}

impl RateSample {
    /// Derive rates; every rate is zero when no time has elapsed.
    pub fn from_snapshot(snapshot: &DeltaSnapshot) -> Self {
        if !snapshot.has_elapsed() {
            return Self::default();
        }

        let elapsed = snapshot.elapsed_seconds;
        let read_iops = per_second(snapshot.read_ops, elapsed);
        let write_iops = per_second(snapshot.write_ops, elapsed);
        let read_bytes_per_sec = per_second(snapshot.read_kb, elapsed) * BYTES_PER_KB;
        let write_bytes_per_sec = per_second(snapshot.write_kb, elapsed) * BYTES_PER_KB;

        Self {
            read_iops,
            write_iops,
            total_iops: read_iops + write_iops,
            read_bytes_per_sec,
            write_bytes_per_sec,
            total_bytes_per_sec: read_bytes_per_sec + write_bytes_per_sec,
        }
    }
}

#[inline]
fn per_second(count: i64, elapsed_seconds: f64) -> f64 {
    if elapsed_seconds > 0.0 {
        count.max(0) as f64 / elapsed_seconds
    } else {
        0.0
    }
}

// ----------------------------------------------------------------------------
// 3.5 Log Record - One Line Of The Sample Log
// ----------------------------------------------------------------------------

/// A timestamped IOPS record, immutable once appended.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: Timestamp,
    pub read_iops: f64,
    pub write_iops: f64,
    pub total_iops: f64,
}

impl LogRecord {
    pub fn from_sample(timestamp: Timestamp, sample: &RateSample) -> Self {
        Self {
            timestamp,
            read_iops: sample.read_iops,
            write_iops: sample.write_iops,
            total_iops: sample.total_iops,
        }
    }

    /// Render as `<timestamp>|<read_iops>,<write_iops>,<total_iops>`.
    ///
    /// `f64` Display is the shortest representation that parses back to the
    /// same value, so a record survives the log unchanged.
    pub fn to_line(&self) -> String {
        format!(
            "{}{}{}{}{}{}{}",
            self.timestamp.to_log_string(),
            LOG_FIELD_SEPARATOR,
            self.read_iops,
            LOG_VALUE_SEPARATOR,
            self.write_iops,
            LOG_VALUE_SEPARATOR,
            self.total_iops,
        )
    }

    /// Parse one log line.
    pub fn parse_line(line: &str) -> Result<Self, LogLineError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (stamp, data) = line
            .split_once(LOG_FIELD_SEPARATOR)
            .ok_or(LogLineError::MissingSeparator)?;

        let timestamp = Timestamp::parse_log(stamp).ok_or_else(|| LogLineError::InvalidTimestamp {
            value: stamp.to_string(),
        })?;

        let fields: Vec<&str> = data.split(LOG_VALUE_SEPARATOR).collect();
        if fields.len() != 3 {
            return Err(LogLineError::FieldCount { found: fields.len() });
        }

        let mut values = [0.0f64; 3];
        for (index, (slot, raw)) in values.iter_mut().zip(fields.iter()).enumerate() {
            let value: f64 = raw.trim().parse().map_err(|_| LogLineError::InvalidNumber {
                index,
                value: raw.trim().to_string(),
            })?;
            if !value.is_finite() || value < 0.0 {
                return Err(LogLineError::InvalidNumber {
                    index,
                    value: raw.trim().to_string(),
                });
            }
            *slot = value;
        }

        Ok(Self {
            timestamp,
            read_iops: values[0],
            write_iops: values[1],
            total_iops: values[2],
        })
    }
}

// ----------------------------------------------------------------------------
// 3.6 Display Helpers
// ----------------------------------------------------------------------------

/// Scale a byte quantity with binary prefixes, two decimals (`12.30 MiB/s`).
pub fn format_iec(value: f64, suffix: &str) -> String {
    const UNITS: [&str; 7] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];

    let mut scaled = if value.is_finite() { value.max(0.0) } else { 0.0 };
    let mut unit = 0;
    while scaled >= 1024.0 && unit < UNITS.len() - 1 {
        scaled /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}{}", scaled, UNITS[unit], suffix)
}

/// Truncate toward zero for integer display.
#[inline]
pub fn truncate_rate(value: f64) -> i64 {
    if value.is_finite() {
        value.trunc() as i64
    } else {
        0
    }
}

/// Render one row: every cell right-aligned in an equal share of `width`,
/// the row padded to `width`. Cells wider than their share overflow rather
/// than being cut.
pub fn render_row<S: AsRef<str>>(cells: &[S], width: usize) -> String {
    let columns = cells.len().max(1);
    let cell_width = (width / columns).max(1);

    let mut line = String::with_capacity(width);
    for cell in cells {
        let cell = cell.as_ref();
        if cell.chars().count() >= cell_width && !line.is_empty() {
            line.push(' ');
        }
        line.push_str(&format!("{:>w$}", cell, w = cell_width));
    }
    format!("{:<w$}", line, w = width)
}

/// Values are persisted as decimal strings; `{:?}` keeps a trailing `.0`.
pub fn format_store_value(value: f64) -> String {
    format!("{:?}", value)
}

/// Parse a persisted value, rejecting anything non-finite.
pub fn parse_store_value(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// Layered error types, one per subsystem, converging on `MsllerError`.
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Engine Errors
// ----------------------------------------------------------------------------

/// The main error type for the Msller engine.
/// All subsystem errors can be converted to this type.
#[derive(Error, Debug)]
pub enum MsllerError {
    // ---- Configuration Errors ----
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    // ---- Stat Source Errors ----
    #[error("Stat source error: {0}")]
    Stat(#[from] StatError),

    // ---- Storage Errors ----
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    // ---- Command Channel Errors ----
    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    // ---- IO Errors ----
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ---- Generic Errors ----
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl MsllerError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            MsllerError::Config(_) => false,
            MsllerError::Stat(e) => e.is_recoverable(),
            MsllerError::Storage(e) => e.is_recoverable(),
            MsllerError::Command(e) => e.is_recoverable(),
            MsllerError::Io(_) => true,
            MsllerError::Internal(_) => false,
            MsllerError::ShuttingDown => false,
        }
    }

    /// Get the error category for statistics/logging
    pub fn category(&self) -> &'static str {
        match self {
            MsllerError::Config(_) => "config",
            MsllerError::Stat(e) => e.category(),
            MsllerError::Storage(_) => "storage",
            MsllerError::Command(_) => "command",
            MsllerError::Io(_) => "io",
            MsllerError::Internal(_) => "internal",
            MsllerError::ShuttingDown => "shutdown",
        }
    }

    /// Negative errno reported on the command result channel.
    pub fn errno(&self) -> i32 {
        match self {
            MsllerError::Config(_) => -libc::EINVAL,
            MsllerError::Stat(e) => e.errno(),
            MsllerError::Storage(_) => -libc::EIO,
            MsllerError::Command(CommandError::InvalidRequest { .. }) => -libc::EINVAL,
            MsllerError::Command(CommandError::Timeout { .. }) => -libc::ETIMEDOUT,
            MsllerError::Command(_) => -libc::EIO,
            MsllerError::Io(_) => -libc::EIO,
            MsllerError::Internal(_) => -libc::EIO,
            MsllerError::ShuttingDown => -libc::ESHUTDOWN,
        }
    }
}

/// Result type alias for engine operations
pub type MsllerResult<T> = Result<T, MsllerError>;

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Stat Source Errors
// ----------------------------------------------------------------------------

/// Errors from the host statistics facility
#[derive(Error, Debug)]
pub enum StatError {
    #[error("Stat source '{endpoint}' unavailable: {message}")]
    Unavailable { endpoint: String, message: String },

    #[error("Timeout waiting for '{endpoint}' (waited {timeout_ms}ms)")]
    Timeout { endpoint: String, timeout_ms: u64 },

    #[error("Malformed io_rate snapshot: field '{field}' {message}")]
    MalformedSnapshot { field: String, message: String },
}

impl StatError {
    pub fn unavailable(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        StatError::Unavailable {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    pub fn malformed(field: impl Into<String>, message: impl Into<String>) -> Self {
        StatError::MalformedSnapshot {
            field: field.into(),
            message: message.into(),
        }
    }

    /// A missing host is transient; a malformed report will not fix itself.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, StatError::MalformedSnapshot { .. })
    }

    pub fn category(&self) -> &'static str {
        match self {
            StatError::Unavailable { .. } | StatError::Timeout { .. } => "stat_unavailable",
            StatError::MalformedSnapshot { .. } => "stat_malformed",
        }
    }

    pub fn errno(&self) -> i32 {
        match self {
            StatError::Unavailable { .. } => -libc::EAGAIN,
            StatError::Timeout { .. } => -libc::ETIMEDOUT,
            StatError::MalformedSnapshot { .. } => -libc::EIO,
        }
    }
}

/// Result type alias for stat source operations
pub type StatResult<T> = Result<T, StatError>;

// ----------------------------------------------------------------------------
// 4.4 Storage Errors
// ----------------------------------------------------------------------------

/// Errors from the sample log and the state store
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Write to {path} failed: {source}")]
    WriteFailed { path: PathBuf, source: io::Error },

    #[error("Read of {path} failed: {source}")]
    ReadFailed { path: PathBuf, source: io::Error },

    #[error("Serialization failed: {message}")]
    SerializationFailed { message: String },

    #[error("Data corruption detected in {path}: {message}")]
    DataCorruption { path: PathBuf, message: String },
}

impl StorageError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, StorageError::DataCorruption { .. })
    }

    pub fn write_failed(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StorageError::WriteFailed {
            path: path.into(),
            source,
        }
    }

    pub fn read_failed(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StorageError::ReadFailed {
            path: path.into(),
            source,
        }
    }
}

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

// ----------------------------------------------------------------------------
// 4.5 Command Channel Errors
// ----------------------------------------------------------------------------

/// Errors on the command socket
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Failed to bind {path}: {source}")]
    BindFailed { path: PathBuf, source: io::Error },

    #[error("Connection to {path} failed: {source}")]
    ConnectionFailed { path: PathBuf, source: io::Error },

    #[error("Invalid command request: {message}")]
    InvalidRequest { message: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("No reply within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

impl CommandError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, CommandError::BindFailed { .. })
    }
}

// ----------------------------------------------------------------------------
// 4.6 Sample Log Line Errors
// ----------------------------------------------------------------------------

/// Why one sample log line could not be parsed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogLineError {
    #[error("missing '|' separator")]
    MissingSeparator,

    #[error("invalid timestamp '{value}'")]
    InvalidTimestamp { value: String },

    #[error("expected 3 values, found {found}")]
    FieldCount { found: usize },

    #[error("value {index} is not a non-negative number: '{value}'")]
    InvalidNumber { index: usize, value: String },
}

// ----------------------------------------------------------------------------
// 4.7 Error Statistics Tracking
// ----------------------------------------------------------------------------

/// Tracks error statistics for monitoring
#[derive(Debug, Default)]
pub struct ErrorStats {
    /// Total errors by category
    pub by_category: DashMap<&'static str, AtomicU64>,
    /// Recoverable vs non-recoverable
    pub recoverable_count: AtomicU64,
    pub non_recoverable_count: AtomicU64,
    /// Last error timestamp (nanos, 0 = never)
    pub last_error_time: AtomicI64,
}

impl ErrorStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error
    pub fn record(&self, error: &MsllerError) {
        self.by_category
            .entry(error.category())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, AtomicOrdering::Relaxed);

        if error.is_recoverable() {
            self.recoverable_count.fetch_add(1, AtomicOrdering::Relaxed);
        } else {
            self.non_recoverable_count.fetch_add(1, AtomicOrdering::Relaxed);
        }

        self.last_error_time
            .store(Timestamp::now().as_nanos(), AtomicOrdering::Release);
    }

    pub fn total_errors(&self) -> u64 {
        self.recoverable_count.load(AtomicOrdering::Relaxed)
            + self.non_recoverable_count.load(AtomicOrdering::Relaxed)
    }

    pub fn count_by_category(&self, category: &str) -> u64 {
        self.by_category
            .get(category)
            .map(|v| v.load(AtomicOrdering::Relaxed))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> ErrorStatsSnapshot {
        let by_category = self
            .by_category
            .iter()
            .map(|entry| {
                (
                    entry.key().to_string(),
                    entry.value().load(AtomicOrdering::Relaxed),
                )
            })
            .collect();
        let last = self.last_error_time.load(AtomicOrdering::Acquire);

        ErrorStatsSnapshot {
            total: self.total_errors(),
            recoverable: self.recoverable_count.load(AtomicOrdering::Relaxed),
            non_recoverable: self.non_recoverable_count.load(AtomicOrdering::Relaxed),
            by_category,
            last_error: (last != 0).then(|| Timestamp::from_nanos(last)),
        }
    }
}

/// Point-in-time copy of [`ErrorStats`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorStatsSnapshot {
    pub total: u64,
    pub recoverable: u64,
    pub non_recoverable: u64,
    pub by_category: BTreeMap<String, u64>,
    pub last_error: Option<Timestamp>,
}

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// TOML file merged with MSLLER_ environment overrides (MSLLER_SAMPLER__INTERVAL=2s).
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the Msller engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// General engine settings
    #[serde(default)]
    pub engine: GeneralConfig,

    /// Where delta snapshots come from
    #[serde(default)]
    pub source: StatSourceConfig,

    #[serde(default)]
    pub sampler: SamplerConfig,

    #[serde(default)]
    pub analyzer: AnalyzerConfig,

    #[serde(default)]
    pub threshold: ThresholdConfig,

    /// Sample log and state store
    #[serde(default)]
    pub storage: StorageConfig,

    /// Command socket
    #[serde(default)]
    pub command: CommandConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        Self::extract(Figment::new().merge(Toml::file(path)))
    }

    /// Defaults plus environment overrides, for running without a file
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::extract(Figment::new())
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment
            .merge(Env::prefixed("MSLLER_").split("__"))
            .extract()
            .map_err(|e| ConfigError::ParseError {
                message: e.to_string(),
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from string (for testing)
    pub fn from_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let min_interval = Duration::from_millis(MIN_SAMPLE_INTERVAL_MS);
        if self.sampler.interval < min_interval {
            return Err(ConfigError::invalid_value(
                "sampler.interval",
                format!("Sampling interval must be at least {}ms", MIN_SAMPLE_INTERVAL_MS),
            ));
        }

        if self.analyzer.interval.is_zero() {
            return Err(ConfigError::invalid_value(
                "analyzer.interval",
                "Analysis interval must be non-zero",
            ));
        }

        let floor = self.threshold.default_floor;
        if !floor.is_finite() || floor < 0.0 {
            return Err(ConfigError::invalid_value(
                "threshold.default_floor",
                format!("Threshold must be a finite non-negative number, got {}", floor),
            ));
        }

        if self.command.default_width < MSL_COLUMNS.len() {
            return Err(ConfigError::invalid_value(
                "command.default_width",
                format!("Render width must be at least {}", MSL_COLUMNS.len()),
            ));
        }

        match &self.source {
            StatSourceConfig::Http { url, timeout } => {
                if url.trim().is_empty() {
                    return Err(ConfigError::invalid_value("source.url", "URL must not be empty"));
                }
                if timeout.is_zero() {
                    return Err(ConfigError::invalid_value(
                        "source.timeout",
                        "Timeout must be non-zero",
                    ));
                }
            }
            StatSourceConfig::File { path } => {
                if path.as_os_str().is_empty() {
                    return Err(ConfigError::invalid_value("source.path", "Path must not be empty"));
                }
            }
        }

        Ok(())
    }

    /// Create a default config file
    pub fn generate_default_config() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// 5.2 General Engine Configuration
// ----------------------------------------------------------------------------

/// General engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Engine instance name (for identification)
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Host name used in the sample log file name (auto-detected if unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    /// Graceful shutdown timeout (seconds)
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            hostname: None,
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl GeneralConfig {
    /// Configured host name, else the kernel's.
    pub fn resolve_hostname(&self) -> String {
        match &self.hostname {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => system_hostname().unwrap_or_else(|| "localhost".to_string()),
        }
    }
}

fn system_hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    // SAFETY: the buffer is valid for `buf.len()` bytes for the whole call.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return None;
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let name = String::from_utf8_lossy(&buf[..end]).trim().to_string();
    (!name.is_empty()).then_some(name)
}

fn default_instance_name() -> String {
    ENGINE_NAME.into()
}

fn default_shutdown_timeout() -> u64 {
    SHUTDOWN_GRACE_PERIOD_SECS
}

fn default_true() -> bool {
    true
}

// ----------------------------------------------------------------------------
// 5.3 Stat Source Configuration
// ----------------------------------------------------------------------------

/// Where `io_rate` reports are fetched from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatSourceConfig {
    /// GET a JSON report over HTTP
    Http {
        #[serde(default = "default_stat_url")]
        url: String,
        #[serde(default = "default_http_timeout", with = "humantime_serde")]
        timeout: Duration,
    },
    /// Read a JSON report a host agent keeps refreshed on disk
    File { path: PathBuf },
}

impl Default for StatSourceConfig {
    fn default() -> Self {
        StatSourceConfig::Http {
            url: default_stat_url(),
            timeout: default_http_timeout(),
        }
    }
}

fn default_stat_url() -> String {
    DEFAULT_STAT_URL.into()
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS)
}

// ----------------------------------------------------------------------------
// 5.4 Periodic Task Configuration
// ----------------------------------------------------------------------------

/// Rate sampler cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// Pause between the end of one cycle and the start of the next
    #[serde(default = "default_sample_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// One-time pause before the first cycle
    #[serde(default = "default_sample_initial_delay", with = "humantime_serde")]
    pub initial_delay: Duration,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval: default_sample_interval(),
            initial_delay: default_sample_initial_delay(),
        }
    }
}

fn default_sample_interval() -> Duration {
    Duration::from_millis(DEFAULT_SAMPLE_INTERVAL_MS)
}

fn default_sample_initial_delay() -> Duration {
    Duration::from_millis(DEFAULT_SAMPLE_INITIAL_DELAY_MS)
}

/// Stable-line analyzer cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    #[serde(default = "default_analyze_interval", with = "humantime_serde")]
    pub interval: Duration,

    #[serde(default = "default_analyze_initial_delay", with = "humantime_serde")]
    pub initial_delay: Duration,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            interval: default_analyze_interval(),
            initial_delay: default_analyze_initial_delay(),
        }
    }
}

fn default_analyze_interval() -> Duration {
    Duration::from_secs(DEFAULT_ANALYZE_INTERVAL_SECS)
}

fn default_analyze_initial_delay() -> Duration {
    Duration::from_secs(DEFAULT_ANALYZE_INITIAL_DELAY_SECS)
}

/// Administrator floor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdConfig {
    /// Seeded into `msl_threshold` when the store has none
    #[serde(default = "default_floor")]
    pub default_floor: f64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            default_floor: default_floor(),
        }
    }
}

fn default_floor() -> f64 {
    DEFAULT_MSL_THRESHOLD
}

// ----------------------------------------------------------------------------
// 5.5 Storage Configuration
// ----------------------------------------------------------------------------

/// Sample log and state store locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory of the sample log when `log_path` is unset
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Explicit sample log path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,

    /// JSON file backing the state store
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,

    /// Namespace prepended to every state key
    #[serde(default = "default_store_prefix")]
    pub key_prefix: String,

    /// fsync after every append / state write
    #[serde(default = "default_true")]
    pub sync_writes: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            log_path: None,
            state_path: default_state_path(),
            key_prefix: default_store_prefix(),
            sync_writes: true,
        }
    }
}

impl StorageConfig {
    /// `<log_dir>/ceph-mgr.msller.<hostname>.log` unless overridden.
    pub fn resolved_log_path(&self, hostname: &str) -> PathBuf {
        match &self.log_path {
            Some(path) => path.clone(),
            None => self
                .log_dir
                .join(format!("ceph-mgr.{}.{}.log", COMMAND_PREFIX, hostname)),
        }
    }
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(DEFAULT_LOG_DIR)
}

fn default_state_path() -> PathBuf {
    PathBuf::from(DEFAULT_STATE_PATH)
}

fn default_store_prefix() -> String {
    DEFAULT_STORE_PREFIX.into()
}

// ----------------------------------------------------------------------------
// 5.6 Command Channel Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConfig {
    /// Serve the command socket
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Render width when a request names none
    #[serde(default = "default_render_width")]
    pub default_width: usize,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            socket_path: default_socket_path(),
            default_width: default_render_width(),
        }
    }
}

fn default_socket_path() -> PathBuf {
    PathBuf::from(DEFAULT_UNIX_SOCKET_PATH)
}

fn default_render_width() -> usize {
    DEFAULT_RENDER_WIDTH
}

// ----------------------------------------------------------------------------
// 5.7 Logging Configuration
// ----------------------------------------------------------------------------

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Daily-rolling diagnostic log file, in addition to stderr
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "compact".into()
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// Diagnostics go to stderr so `msller query` output on stdout stays clean.
// ============================================================================

/// Initialize the logging system based on configuration.
///
/// The returned guard flushes the file appender; hold it for the life of
/// the process.
pub fn init_logging(config: &LoggingConfig) -> MsllerResult<Option<WorkerGuard>> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "info" => tracing::level_filters::LevelFilter::INFO,
        "warn" | "warning" => tracing::level_filters::LevelFilter::WARN,
        "error" => tracing::level_filters::LevelFilter::ERROR,
        _ => tracing::level_filters::LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    let mut layers: Vec<Box<dyn Layer<tracing_subscriber::Registry> + Send + Sync>> = Vec::new();

    let console = match config.format.as_str() {
        "json" => tracing_fmt::layer()
            .json()
            .with_writer(io::stderr)
            .with_target(true)
            .with_file(config.source_location)
            .with_line_number(config.source_location)
            .boxed(),
        "pretty" => tracing_fmt::layer()
            .pretty()
            .with_writer(io::stderr)
            .with_ansi(config.colors)
            .with_target(true)
            .with_file(config.source_location)
            .with_line_number(config.source_location)
            .boxed(),
        _ => tracing_fmt::layer()
            .compact()
            .with_writer(io::stderr)
            .with_ansi(config.colors)
            .with_target(true)
            .boxed(),
    };
    layers.push(console);

    let mut guard = None;
    if let Some(file) = &config.file {
        let dir = file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let prefix = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}.log", ENGINE_NAME));

        fs::create_dir_all(dir)?;
        let appender = tracing_appender::rolling::daily(dir, prefix);
        let (writer, worker_guard) = tracing_appender::non_blocking(appender);
        layers.push(
            tracing_fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .boxed(),
        );
        guard = Some(worker_guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()
        .map_err(|e| MsllerError::Internal(format!("Failed to set logger: {}", e)))?;

    info!(
        target: "msller::init",
        level = %config.level,
        format = %config.format,
        file = ?config.file,
        "Logging initialized"
    );

    Ok(guard)
}

/// Measures one operation and logs its duration on drop.
#[derive(Debug)]
pub struct PerfTimer {
    name: &'static str,
    start: Instant,
}

impl PerfTimer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for PerfTimer {
    fn drop(&mut self) {
        trace!(
            target: "msller::perf",
            operation = self.name,
            elapsed_us = self.start.elapsed().as_micros() as u64,
            "Operation timing"
        );
    }
}

// ============================================================================
// SECTION 7: DURABLE STORAGE
// ============================================================================
// Two stores survive restarts:
// - the sample log: append-only text, one LogRecord per line
// - the state store: a small key/value map holding the MSL state
// ============================================================================

// ----------------------------------------------------------------------------
// 7.1 Storage Traits
// ----------------------------------------------------------------------------

/// Append-only line store behind the sampler and the analyzer.
pub trait SampleLog: Send + Sync + Debug {
    /// Append one line; the store adds the terminator.
    fn append_line(&self, line: &str) -> StorageResult<()>;

    /// Every line currently in the log, oldest first.
    fn read_all_lines(&self) -> StorageResult<Vec<String>>;
}

/// Durable key/value store for the MSL state.
pub trait ConfigStore: Send + Sync + Debug {
    fn get_config(&self, key: &str) -> StorageResult<Option<String>>;

    fn set_config(&self, key: &str, value: &str) -> StorageResult<()>;
}

// ----------------------------------------------------------------------------
// 7.2 File-Backed Sample Log
// ----------------------------------------------------------------------------

/// Open append handle plus the inode it was opened on.
#[derive(Debug)]
struct LogWriter {
    file: File,
    inode: u64,
}

/// Sample log on the local filesystem.
///
/// Writes go through a single append handle. When the path is rotated away
/// (its inode changes or it disappears) the next append reopens it.
#[derive(Debug)]
pub struct FileSampleLog {
    path: PathBuf,
    sync_writes: bool,
    writer: Mutex<Option<LogWriter>>,
}

impl FileSampleLog {
    pub fn new(path: impl Into<PathBuf>, sync_writes: bool) -> Self {
        Self {
            path: path.into(),
            sync_writes,
            writer: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn current_inode(&self) -> Option<u64> {
        fs::metadata(&self.path).ok().map(|m| m.ino())
    }

    fn open_writer(&self) -> StorageResult<LogWriter> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| StorageError::write_failed(parent, e))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| StorageError::write_failed(&self.path, e))?;
        let inode = file
            .metadata()
            .map_err(|e| StorageError::write_failed(&self.path, e))?
            .ino();

        debug!(target: "msller::store", path = %self.path.display(), inode, "Opened sample log");
        Ok(LogWriter { file, inode })
    }
}

impl SampleLog for FileSampleLog {
    fn append_line(&self, line: &str) -> StorageResult<()> {
        let mut guard = self.writer.lock();

        let rotated = match (guard.as_ref(), self.current_inode()) {
            (Some(writer), Some(inode)) => writer.inode != inode,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if rotated {
            info!(target: "msller::store", path = %self.path.display(), "Sample log rotated, reopening");
            *guard = None;
        }

        if guard.is_none() {
            *guard = Some(self.open_writer()?);
        }

        if let Some(writer) = guard.as_mut() {
            let mut buf = String::with_capacity(line.len() + 1);
            buf.push_str(line);
            buf.push('\n');

            let written = writer
                .file
                .write_all(buf.as_bytes())
                .and_then(|_| {
                    if self.sync_writes {
                        writer.file.sync_data()
                    } else {
                        Ok(())
                    }
                });

            if let Err(e) = written {
                // Drop the handle so the next cycle starts from a fresh open.
                *guard = None;
                return Err(StorageError::write_failed(&self.path, e));
            }
        }

        Ok(())
    }

    fn read_all_lines(&self) -> StorageResult<Vec<String>> {
        let mut bytes = Vec::new();
        match File::open(&self.path) {
            Ok(mut file) => {
                file.read_to_end(&mut bytes)
                    .map_err(|e| StorageError::read_failed(&self.path, e))?;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::read_failed(&self.path, e)),
        }

        Ok(String::from_utf8_lossy(&bytes)
            .lines()
            .map(str::to_string)
            .collect())
    }
}

// ----------------------------------------------------------------------------
// 7.3 In-Memory Sample Log
// ----------------------------------------------------------------------------

/// Sample log kept in memory, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemorySampleLog {
    lines: Mutex<Vec<String>>,
}

impl MemorySampleLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: Mutex::new(lines.into_iter().map(Into::into).collect()),
        }
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }
}

impl SampleLog for MemorySampleLog {
    fn append_line(&self, line: &str) -> StorageResult<()> {
        self.lines.lock().push(line.to_string());
        Ok(())
    }

    fn read_all_lines(&self) -> StorageResult<Vec<String>> {
        Ok(self.lines.lock().clone())
    }
}

// ----------------------------------------------------------------------------
// 7.4 File-Backed State Store
// ----------------------------------------------------------------------------

/// JSON map on disk, keys namespaced by a prefix (`mgr/msller/msl_value`).
///
/// Every read goes to disk so edits made by another process (an operator
/// running `msller set-threshold`) are seen on the next access. Writes hold
/// an exclusive `flock` on `<state>.lock` across read-modify-write and
/// replace the file through a uniquely named temporary sibling.
#[derive(Debug)]
pub struct FileConfigStore {
    path: PathBuf,
    prefix: String,
    sync_writes: bool,
    write_lock: Mutex<()>,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>, prefix: impl Into<String>, sync_writes: bool) -> Self {
        Self {
            path: path.into(),
            prefix: prefix.into(),
            sync_writes,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn dir(&self) -> &Path {
        self.path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    fn read_map(&self) -> StorageResult<BTreeMap<String, String>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(StorageError::read_failed(&self.path, e)),
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(BTreeMap::new());
        }

        serde_json::from_slice(&bytes).map_err(|e| StorageError::DataCorruption {
            path: self.path.clone(),
            message: e.to_string(),
        })
    }

    fn write_map(&self, map: &BTreeMap<String, String>) -> StorageResult<()> {
        let body = serde_json::to_vec_pretty(map).map_err(|e| StorageError::SerializationFailed {
            message: e.to_string(),
        })?;

        let dir = self.dir();
        let mut tmp = NamedTempFile::new_in(dir).map_err(|e| StorageError::write_failed(dir, e))?;
        tmp.write_all(&body)
            .map_err(|e| StorageError::write_failed(tmp.path(), e))?;
        if self.sync_writes {
            tmp.as_file()
                .sync_all()
                .map_err(|e| StorageError::write_failed(tmp.path(), e))?;
        }

        tmp.persist(&self.path)
            .map_err(|e| StorageError::write_failed(&self.path, e.error))?;
        Ok(())
    }
}

/// Exclusive advisory lock, released on drop.
///
/// Taken on a sibling file: the state file itself is replaced on every
/// write, and a lock on a renamed-away inode excludes nobody.
#[derive(Debug)]
struct StateFileLock {
    file: File,
}

impl StateFileLock {
    fn acquire(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| StorageError::write_failed(path, e))?;

        loop {
            // SAFETY: the descriptor belongs to `file`, which outlives the call.
            if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) } == 0 {
                break;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(StorageError::write_failed(path, err));
            }
        }

        Ok(Self { file })
    }
}

impl Drop for StateFileLock {
    fn drop(&mut self) {
        // SAFETY: same descriptor as in `acquire`; closing it would also unlock.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

impl ConfigStore for FileConfigStore {
    fn get_config(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.read_map()?.remove(&self.full_key(key)))
    }

    fn set_config(&self, key: &str, value: &str) -> StorageResult<()> {
        let _guard = self.write_lock.lock();
        let dir = self.dir();
        fs::create_dir_all(dir).map_err(|e| StorageError::write_failed(dir, e))?;
        let _flock = StateFileLock::acquire(&self.lock_path())?;

        let mut map = self.read_map()?;
        map.insert(self.full_key(key), value.to_string());
        self.write_map(&map)?;

        debug!(target: "msller::store", key, value, "State updated");
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 7.5 In-Memory State Store
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    values: DashMap<String, String>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn get_config(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.values.get(key).map(|v| v.value().clone()))
    }

    fn set_config(&self, key: &str, value: &str) -> StorageResult<()> {
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 7.6 Numeric State Helpers
// ----------------------------------------------------------------------------

/// A numeric state entry as found in the store.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredNumber {
    Missing,
    /// Present but not a finite number; carries the raw text.
    Invalid(String),
    Valid(f64),
}

impl StoredNumber {
    pub fn valid(&self) -> Option<f64> {
        match self {
            StoredNumber::Valid(v) => Some(*v),
            _ => None,
        }
    }
}

pub fn read_stored_number(store: &dyn ConfigStore, key: &str) -> StorageResult<StoredNumber> {
    Ok(match store.get_config(key)? {
        None => StoredNumber::Missing,
        Some(raw) => match parse_store_value(&raw) {
            Some(value) => StoredNumber::Valid(value),
            None => StoredNumber::Invalid(raw),
        },
    })
}

pub fn write_stored_number(store: &dyn ConfigStore, key: &str, value: f64) -> StorageResult<()> {
    store.set_config(key, &format_store_value(value))
}

// ============================================================================
// SECTION 8: STAT SOURCE ADAPTER
// ============================================================================
// The only component that talks to the host statistics facility.
// ============================================================================

// ----------------------------------------------------------------------------
// 8.1 Stat Source Trait
// ----------------------------------------------------------------------------

/// Provider of the host's raw `io_rate` report.
#[async_trait]
pub trait StatSource: Send + Sync + Debug {
    /// Name used in logs and errors
    fn name(&self) -> &str;

    /// Fetch the current `io_rate` report.
    async fn fetch_io_rate(&self) -> StatResult<JsonValue>;
}

// ----------------------------------------------------------------------------
// 8.2 HTTP Stat Source
// ----------------------------------------------------------------------------

/// Fetches the report with a GET returning JSON.
#[derive(Debug, Clone)]
pub struct HttpStatSource {
    url: String,
    timeout: Duration,
    client: HttpClient,
}

impl HttpStatSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> MsllerResult<Self> {
        let client = HttpClient::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(2)
            .build()
            .map_err(|e| MsllerError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            url: url.into(),
            timeout,
            client,
        })
    }
}

#[async_trait]
impl StatSource for HttpStatSource {
    fn name(&self) -> &str {
        &self.url
    }

    async fn fetch_io_rate(&self) -> StatResult<JsonValue> {
        let response = self.client.get(&self.url).send().await.map_err(|e| {
            if e.is_timeout() {
                StatError::Timeout {
                    endpoint: self.url.clone(),
                    timeout_ms: self.timeout.as_millis() as u64,
                }
            } else {
                StatError::unavailable(&self.url, format!("HTTP request failed: {}", e))
            }
        })?;

        if !response.status().is_success() {
            return Err(StatError::unavailable(
                &self.url,
                format!("returned status {}", response.status()),
            ));
        }

        response
            .json::<JsonValue>()
            .await
            .map_err(|e| StatError::malformed("io_rate", format!("is not valid JSON: {}", e)))
    }
}

// ----------------------------------------------------------------------------
// 8.3 File Stat Source
// ----------------------------------------------------------------------------

/// Reads the report from a JSON file kept current by a host agent.
#[derive(Debug, Clone)]
pub struct FileStatSource {
    path: PathBuf,
    name: CompactString,
}

impl FileStatSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = CompactString::from(path.to_string_lossy().as_ref());
        Self { path, name }
    }
}

#[async_trait]
impl StatSource for FileStatSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_io_rate(&self) -> StatResult<JsonValue> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|e| StatError::unavailable(self.name.as_str(), e.to_string()))?;

        serde_json::from_slice(&bytes)
            .map_err(|e| StatError::malformed("io_rate", format!("is not valid JSON: {}", e)))
    }
}

pub fn build_stat_source(config: &StatSourceConfig) -> MsllerResult<Arc<dyn StatSource>> {
    Ok(match config {
        StatSourceConfig::Http { url, timeout } => Arc::new(HttpStatSource::new(url, *timeout)?),
        StatSourceConfig::File { path } => Arc::new(FileStatSource::new(path)),
    })
}

// ----------------------------------------------------------------------------
// 8.4 Adapter - Shape Validation
// ----------------------------------------------------------------------------

/// Outcome of the stat-source self check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelfTestReport {
    pub source: String,
    pub missing_fields: Vec<String>,
    pub snapshot: Option<DeltaSnapshot>,
}

impl SelfTestReport {
    pub fn passed(&self) -> bool {
        self.missing_fields.is_empty() && self.snapshot.is_some()
    }
}

/// Wraps a [`StatSource`] and turns its reports into [`DeltaSnapshot`]s.
#[derive(Debug, Clone)]
pub struct StatSourceAdapter {
    source: Arc<dyn StatSource>,
}

impl StatSourceAdapter {
    pub fn new(source: Arc<dyn StatSource>) -> Self {
        Self { source }
    }

    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    /// Fetch and validate one snapshot.
    pub async fn get_stat_snapshot(&self) -> StatResult<DeltaSnapshot> {
        let report = self.source.fetch_io_rate().await?;
        let snapshot = DeltaSnapshot::from_io_rate(&report)?;

        trace!(
            target: "msller::stats",
            source = self.source.name(),
            elapsed = snapshot.elapsed_seconds,
            read_ops = snapshot.read_ops,
            write_ops = snapshot.write_ops,
            "Fetched delta snapshot"
        );
        Ok(snapshot)
    }

    /// Check the report carries every required field, naming each one
    /// that is absent. Fails only when the source itself cannot answer.
    pub async fn self_test(&self) -> StatResult<SelfTestReport> {
        let report = self.source.fetch_io_rate().await?;

        let missing_fields = DeltaSnapshot::REQUIRED_FIELDS
            .iter()
            .filter(|path| json_path(&report, path).is_none())
            .map(|path| path.to_string())
            .collect();

        Ok(SelfTestReport {
            source: self.source.name().to_string(),
            missing_fields,
            snapshot: DeltaSnapshot::from_io_rate(&report).ok(),
        })
    }
}

fn json_path<'a>(value: &'a JsonValue, dotted: &str) -> Option<&'a JsonValue> {
    dotted
        .split('.')
        .try_fold(value, |node, key| node.get(key))
}

// ============================================================================
// SECTION 9: SHARED ENGINE CONTEXT
// ============================================================================

/// Everything the components share, handed out as `Arc<MslContext>`.
#[derive(Debug)]
pub struct MslContext {
    pub stats: StatSourceAdapter,
    pub log: Arc<dyn SampleLog>,
    pub store: Arc<dyn ConfigStore>,
    /// Floor seeded when the store has none
    pub default_threshold: f64,
    /// Render width used when a request names none
    pub default_width: usize,
    /// Last threshold seen in the store
    pub threshold: AtomicF64,
    /// Last value published or loaded
    pub msl_value: AtomicF64,
    pub errors: ErrorStats,
}

impl MslContext {
    pub fn new(
        stats: StatSourceAdapter,
        log: Arc<dyn SampleLog>,
        store: Arc<dyn ConfigStore>,
    ) -> Self {
        Self {
            stats,
            log,
            store,
            default_threshold: DEFAULT_MSL_THRESHOLD,
            default_width: DEFAULT_RENDER_WIDTH,
            threshold: AtomicF64::new(DEFAULT_MSL_THRESHOLD),
            msl_value: AtomicF64::new(f64::NAN),
            errors: ErrorStats::new(),
        }
    }

    pub fn with_default_threshold(mut self, threshold: f64) -> Self {
        self.default_threshold = threshold;
        self.threshold = AtomicF64::new(threshold);
        self
    }

    pub fn with_default_width(mut self, width: usize) -> Self {
        self.default_width = width;
        self
    }

    /// Wire the file-backed stores and the configured stat source.
    pub fn from_config(config: &EngineConfig) -> MsllerResult<Self> {
        let hostname = config.engine.resolve_hostname();
        let log_path = config.storage.resolved_log_path(&hostname);

        info!(
            target: "msller::init",
            source = ?config.source,
            log = %log_path.display(),
            state = %config.storage.state_path.display(),
            "Wiring engine context"
        );

        let stats = StatSourceAdapter::new(build_stat_source(&config.source)?);
        let log = Arc::new(FileSampleLog::new(log_path, config.storage.sync_writes));
        let store = Arc::new(FileConfigStore::new(
            &config.storage.state_path,
            &config.storage.key_prefix,
            config.storage.sync_writes,
        ));

        Ok(Self::new(stats, log, store)
            .with_default_threshold(config.threshold.default_floor)
            .with_default_width(config.command.default_width))
    }

    pub fn cached_threshold(&self) -> f64 {
        self.threshold.load(AtomicOrdering::Acquire)
    }

    /// NaN until a value has been loaded or published.
    pub fn cached_msl_value(&self) -> f64 {
        self.msl_value.load(AtomicOrdering::Acquire)
    }

    /// Count a failed cycle.
    pub fn record_error(&self, error: &MsllerError) {
        self.errors.record(error);
    }
}

// ============================================================================
// SECTION 10: MSL COMPONENTS
// ============================================================================
// Threshold initializer, rate sampler, stable-line analyzer, query responder.
// ============================================================================

// ----------------------------------------------------------------------------
// 10.1 Threshold Initializer
// ----------------------------------------------------------------------------

/// What the startup seeding changed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InitOutcome {
    pub threshold: f64,
    pub msl_value: f64,
    /// `msl_threshold` was absent or unreadable and got the default
    pub seeded_threshold: bool,
    /// `msl_value` was absent, unreadable or below the floor
    pub raised_value: bool,
}

/// Seeds the MSL state before the periodic tasks start.
#[derive(Debug, Clone)]
pub struct ThresholdInitializer {
    ctx: Arc<MslContext>,
}

impl ThresholdInitializer {
    pub fn new(ctx: Arc<MslContext>) -> Self {
        Self { ctx }
    }

    /// Ensure `msl_threshold` exists and `msl_value >= msl_threshold`.
    ///
    /// A valid `msl_value` at or above the floor is never lowered, so
    /// running this twice changes nothing the second time.
    pub fn run_once_at_startup(&self) -> MsllerResult<InitOutcome> {
        let store = self.ctx.store.as_ref();

        let (threshold, seeded_threshold) = match read_stored_number(store, KEY_MSL_THRESHOLD)? {
            StoredNumber::Valid(threshold) => (threshold, false),
            StoredNumber::Missing => {
                write_stored_number(store, KEY_MSL_THRESHOLD, self.ctx.default_threshold)?;
                (self.ctx.default_threshold, true)
            }
            StoredNumber::Invalid(raw) => {
                warn!(
                    target: "msller::init",
                    key = KEY_MSL_THRESHOLD,
                    value = %raw,
                    "Stored threshold is not a number, reseeding default"
                );
                write_stored_number(store, KEY_MSL_THRESHOLD, self.ctx.default_threshold)?;
                (self.ctx.default_threshold, true)
            }
        };

        let (msl_value, raised_value) = raise_value_to_threshold(store, threshold)?;

        self.ctx.threshold.store(threshold, AtomicOrdering::Release);
        self.ctx.msl_value.store(msl_value, AtomicOrdering::Release);

        info!(
            target: "msller::init",
            threshold,
            msl_value,
            seeded_threshold,
            raised_value,
            "MSL state initialized"
        );

        Ok(InitOutcome {
            threshold,
            msl_value,
            seeded_threshold,
            raised_value,
        })
    }
}

/// Bring a missing, unparseable or low `msl_value` up to `threshold`.
///
/// Returns the value now stored and whether it was rewritten.
fn raise_value_to_threshold(store: &dyn ConfigStore, threshold: f64) -> StorageResult<(f64, bool)> {
    match read_stored_number(store, KEY_MSL_VALUE)? {
        StoredNumber::Valid(value) if value >= threshold => Ok((value, false)),
        current => {
            debug!(
                target: "msller::init",
                current = ?current,
                threshold,
                "Raising msl_value to the threshold"
            );
            write_stored_number(store, KEY_MSL_VALUE, threshold)?;
            Ok((threshold, true))
        }
    }
}

/// Operator update of `msl_threshold`.
///
/// `msl_value` is raised in the same step, so it never sits below the new
/// floor while waiting for the next analysis pass.
pub fn apply_threshold(store: &dyn ConfigStore, threshold: f64) -> MsllerResult<InitOutcome> {
    if !threshold.is_finite() || threshold < 0.0 {
        return Err(ConfigError::invalid_value(
            KEY_MSL_THRESHOLD,
            format!("must be a finite non-negative number, got {}", threshold),
        )
        .into());
    }

    write_stored_number(store, KEY_MSL_THRESHOLD, threshold)?;
    let (msl_value, raised_value) = raise_value_to_threshold(store, threshold)?;

    info!(
        target: "msller::init",
        threshold,
        msl_value,
        raised_value,
        "Threshold updated"
    );

    Ok(InitOutcome {
        threshold,
        msl_value,
        seeded_threshold: false,
        raised_value,
    })
}

// ----------------------------------------------------------------------------
// 10.2 Rate Sampler
// ----------------------------------------------------------------------------

/// Appends one IOPS record per cycle to the sample log.
#[derive(Debug, Clone)]
pub struct RateSampler {
    ctx: Arc<MslContext>,
    interval: Duration,
    initial_delay: Duration,
}

impl RateSampler {
    pub fn new(ctx: Arc<MslContext>) -> Self {
        Self {
            ctx,
            interval: default_sample_interval(),
            initial_delay: default_sample_initial_delay(),
        }
    }

    pub fn with_schedule(mut self, interval: Duration, initial_delay: Duration) -> Self {
        self.interval = interval;
        self.initial_delay = initial_delay;
        self
    }

    /// One snapshot, one appended line. On failure the log is untouched.
    pub async fn run_once(&self) -> MsllerResult<LogRecord> {
        self.run_once_at(Timestamp::now()).await
    }

    /// Like [`run_once`](Self::run_once) with an explicit record time.
    pub async fn run_once_at(&self, timestamp: Timestamp) -> MsllerResult<LogRecord> {
        let result = self.sample(timestamp).await;
        if let Err(e) = &result {
            self.ctx.record_error(e);
        }
        result
    }

    async fn sample(&self, timestamp: Timestamp) -> MsllerResult<LogRecord> {
        let snapshot = self.ctx.stats.get_stat_snapshot().await?;
        if !snapshot.has_elapsed() {
            debug!(
                target: "msller::sampler",
                elapsed = snapshot.elapsed_seconds,
                "No elapsed time in snapshot, recording zero rates"
            );
        }

        let sample = RateSample::from_snapshot(&snapshot);
        let record = LogRecord::from_sample(timestamp, &sample);
        self.ctx.log.append_line(&record.to_line())?;

        trace!(
            target: "msller::sampler",
            read_iops = record.read_iops,
            write_iops = record.write_iops,
            total_iops = record.total_iops,
            "Sample recorded"
        );
        Ok(record)
    }
}

#[async_trait]
impl PeriodicTask for RateSampler {
    fn name(&self) -> &'static str {
        "sampler"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    async fn tick(&self) -> MsllerResult<()> {
        self.run_once().await.map(|_| ())
    }
}

// ----------------------------------------------------------------------------
// 10.3 Stable-Line Analyzer
// ----------------------------------------------------------------------------

/// Result of one analysis pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    /// Valid records scanned
    pub records: usize,
    /// Lines skipped as unparseable
    pub malformed: usize,
    /// Minimum total IOPS across the valid records
    pub rolling_minimum: Option<f64>,
    /// Floor in effect for this pass
    pub threshold: f64,
    /// Value written to `msl_value`, if any
    pub published: Option<f64>,
}

/// Publishes `max(min(total_iops), msl_threshold)` as the MSL.
#[derive(Debug, Clone)]
pub struct StableLineAnalyzer {
    ctx: Arc<MslContext>,
    interval: Duration,
    initial_delay: Duration,
}

impl StableLineAnalyzer {
    pub fn new(ctx: Arc<MslContext>) -> Self {
        Self {
            ctx,
            interval: default_analyze_interval(),
            initial_delay: default_analyze_initial_delay(),
        }
    }

    pub fn with_schedule(mut self, interval: Duration, initial_delay: Duration) -> Self {
        self.interval = interval;
        self.initial_delay = initial_delay;
        self
    }

    /// Scan the whole log and publish the clamped rolling minimum.
    ///
    /// A log with no valid records leaves `msl_value` untouched.
    pub fn run_once(&self) -> MsllerResult<AnalysisReport> {
        let result = self.analyze();
        if let Err(e) = &result {
            self.ctx.record_error(e);
        }
        result
    }

    fn analyze(&self) -> MsllerResult<AnalysisReport> {
        let _timer = PerfTimer::new("analyzer.scan");
        let lines = self.ctx.log.read_all_lines()?;
        let last_index = lines.len().saturating_sub(1);

        let mut records = 0usize;
        let mut malformed = 0usize;
        let mut rolling_minimum: Option<f64> = None;

        for (index, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match LogRecord::parse_line(line) {
                Ok(record) => {
                    records += 1;
                    rolling_minimum = Some(match rolling_minimum {
                        Some(current) => current.min(record.total_iops),
                        None => record.total_iops,
                    });
                }
                Err(e) if index == last_index => {
                    malformed += 1;
                    debug!(target: "msller::analyzer", line = index + 1, error = %e, "Skipping partial trailing line");
                }
                Err(e) => {
                    malformed += 1;
                    warn!(target: "msller::analyzer", line = index + 1, error = %e, "Skipping malformed log line");
                }
            }
        }

        let threshold = self.current_threshold();

        let published = match rolling_minimum {
            Some(minimum) => {
                let msl = minimum.max(threshold);
                write_stored_number(self.ctx.store.as_ref(), KEY_MSL_VALUE, msl)?;
                self.ctx.msl_value.store(msl, AtomicOrdering::Release);
                Some(msl)
            }
            None => None,
        };

        info!(
            target: "msller::analyzer",
            records,
            malformed,
            rolling_minimum = ?rolling_minimum,
            threshold,
            published = ?published,
            "Analysis complete"
        );

        Ok(AnalysisReport {
            records,
            malformed,
            rolling_minimum,
            threshold,
            published,
        })
    }

    /// The store's threshold, else the last one seen.
    fn current_threshold(&self) -> f64 {
        match read_stored_number(self.ctx.store.as_ref(), KEY_MSL_THRESHOLD) {
            Ok(StoredNumber::Valid(threshold)) => {
                self.ctx.threshold.store(threshold, AtomicOrdering::Release);
                threshold
            }
            Ok(other) => {
                let cached = self.ctx.cached_threshold();
                warn!(target: "msller::analyzer", stored = ?other, cached, "No usable threshold in store, using cached");
                cached
            }
            Err(e) => {
                let cached = self.ctx.cached_threshold();
                warn!(target: "msller::analyzer", error = %e, cached, "Threshold read failed, using cached");
                cached
            }
        }
    }
}

#[async_trait]
impl PeriodicTask for StableLineAnalyzer {
    fn name(&self) -> &'static str {
        "analyzer"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    /// Full-log scan and fsync are blocking; keep them off the runtime workers.
    async fn tick(&self) -> MsllerResult<()> {
        let analyzer = self.clone();
        tokio::task::spawn_blocking(move || analyzer.run_once())
            .await
            .map_err(|e| MsllerError::Internal(format!("analyzer pass aborted: {}", e)))?
            .map(|_| ())
    }
}

// ----------------------------------------------------------------------------
// 10.4 Query Responder
// ----------------------------------------------------------------------------

/// Answers the `msller` command. Never writes state.
#[derive(Debug, Clone)]
pub struct QueryResponder {
    ctx: Arc<MslContext>,
}

impl QueryResponder {
    pub fn new(ctx: Arc<MslContext>) -> Self {
        Self { ctx }
    }

    pub async fn handle_command(&self, request: &CommandRequest) -> CommandResult {
        if request.prefix != COMMAND_PREFIX {
            trace!(target: "msller::command", prefix = %request.prefix, "Ignoring foreign command");
            return CommandResult::ok(String::new());
        }

        let width = request.width.unwrap_or(self.ctx.default_width);

        let snapshot = match self.ctx.stats.get_stat_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                let error = MsllerError::from(e);
                warn!(target: "msller::command", error = %error, "Query failed to fetch stats");
                return CommandResult::error(error.errno(), error.to_string());
            }
        };

        let sample = RateSample::from_snapshot(&snapshot);
        let msl = self.published_msl();
        debug!(target: "msller::command", width, header = request.print_header, msl = ?msl, "Rendering query");

        CommandResult::ok(render_table(&sample, msl, width, request.print_header))
    }

    fn published_msl(&self) -> Option<f64> {
        match read_stored_number(self.ctx.store.as_ref(), KEY_MSL_VALUE) {
            Ok(stored) => stored.valid(),
            Err(e) => {
                warn!(target: "msller::command", error = %e, "msl_value read failed, using cached");
                Some(self.ctx.cached_msl_value()).filter(|v| v.is_finite())
            }
        }
    }
}

/// Render the data row, optionally preceded by the header row.
pub fn render_table(sample: &RateSample, msl: Option<f64>, width: usize, header: bool) -> String {
    let cells = [
        format_iec(sample.read_bytes_per_sec, "/s"),
        format_iec(sample.write_bytes_per_sec, "/s"),
        format_iec(sample.total_bytes_per_sec, "/s"),
        truncate_rate(sample.read_iops).to_string(),
        truncate_rate(sample.write_iops).to_string(),
        truncate_rate(sample.total_iops).to_string(),
        msl.map(|v| truncate_rate(v).to_string())
            .unwrap_or_else(|| "-".to_string()),
    ];

    let mut out = String::new();
    if header {
        out.push_str(&render_row(&MSL_COLUMNS, width));
        out.push('\n');
    }
    out.push_str(&render_row(&cells, width));
    out.push('\n');
    out
}

// ============================================================================
// SECTION 11: PERIODIC TASK RUNTIME
// ============================================================================
// Fire-and-reschedule loops: run a cycle, then sleep `interval` racing the
// cancellation token. A cycle already running is never interrupted.
// ============================================================================

// ----------------------------------------------------------------------------
// 11.1 Task Trait
// ----------------------------------------------------------------------------

#[async_trait]
pub trait PeriodicTask: Send + Sync + Debug + 'static {
    fn name(&self) -> &'static str;

    /// Pause after each cycle
    fn interval(&self) -> Duration;

    /// Pause before the first cycle
    fn initial_delay(&self) -> Duration {
        Duration::ZERO
    }

    async fn tick(&self) -> MsllerResult<()>;
}

// ----------------------------------------------------------------------------
// 11.2 Task Health
// ----------------------------------------------------------------------------

/// Periodic task operational status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Not yet through its first cycle
    Initializing,
    /// Last cycle succeeded
    Healthy,
    /// Recent cycles failed
    Degraded,
    /// Three or more consecutive failures
    Failed,
    /// Loop has exited
    Stopped,
}

/// Health of one periodic task, as reported by [`TaskHealth::snapshot`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskHealthSnapshot {
    pub name: String,
    pub status: TaskStatus,
    pub cycles: u64,
    pub errors: u64,
    pub consecutive_failures: u32,
    pub last_success: Option<Timestamp>,
    pub last_error: Option<Timestamp>,
    pub last_error_message: Option<String>,
    /// Average cycle duration in microseconds
    pub avg_cycle_us: u64,
}

#[derive(Debug)]
pub struct TaskHealth {
    name: &'static str,
    state: RwLock<TaskHealthSnapshot>,
    total_cycle_us: AtomicU64,
}

impl TaskHealth {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: RwLock::new(TaskHealthSnapshot {
                name: name.to_string(),
                status: TaskStatus::Initializing,
                cycles: 0,
                errors: 0,
                consecutive_failures: 0,
                last_success: None,
                last_error: None,
                last_error_message: None,
                avg_cycle_us: 0,
            }),
            total_cycle_us: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn status(&self) -> TaskStatus {
        self.state.read().status
    }

    pub fn snapshot(&self) -> TaskHealthSnapshot {
        self.state.read().clone()
    }

    fn record_cycle(&self, state: &mut TaskHealthSnapshot, duration: Duration) {
        state.cycles += 1;
        let total = self
            .total_cycle_us
            .fetch_add(duration.as_micros() as u64, AtomicOrdering::Relaxed)
            + duration.as_micros() as u64;
        state.avg_cycle_us = total / state.cycles;
    }

    /// Record a successful cycle.
    pub fn record_success(&self, duration: Duration) {
        let mut state = self.state.write();
        self.record_cycle(&mut state, duration);
        state.status = TaskStatus::Healthy;
        state.last_success = Some(Timestamp::now());
        state.consecutive_failures = 0;
    }

    /// Record a failed cycle.
    pub fn record_error(&self, error: &str, duration: Duration) {
        let mut state = self.state.write();
        self.record_cycle(&mut state, duration);
        state.errors += 1;
        state.last_error = Some(Timestamp::now());
        state.last_error_message = Some(error.to_string());
        state.consecutive_failures += 1;

        state.status = if state.consecutive_failures >= 3 {
            TaskStatus::Failed
        } else {
            TaskStatus::Degraded
        };
    }

    pub fn mark_stopped(&self) {
        self.state.write().status = TaskStatus::Stopped;
    }
}

// ----------------------------------------------------------------------------
// 11.3 Runner
// ----------------------------------------------------------------------------

/// Drive `task` until `token` is cancelled.
pub fn spawn_periodic<T: PeriodicTask>(
    task: Arc<T>,
    health: Arc<TaskHealth>,
    token: CancellationToken,
) -> TokioJoinHandle<()> {
    tokio::spawn(async move {
        let name = task.name();
        let delay = task.initial_delay();

        info!(
            target: "msller::scheduler",
            task = name,
            interval_ms = task.interval().as_millis() as u64,
            initial_delay_ms = delay.as_millis() as u64,
            "Periodic task started"
        );

        if !delay.is_zero() {
            tokio::select! {
                _ = token.cancelled() => {
                    health.mark_stopped();
                    info!(target: "msller::scheduler", task = name, "Periodic task cancelled before first cycle");
                    return;
                }
                _ = sleep(delay) => {}
            }
        }

        loop {
            let started = Instant::now();
            match task.tick().await {
                Ok(()) => health.record_success(started.elapsed()),
                Err(e) => {
                    health.record_error(&e.to_string(), started.elapsed());
                    warn!(
                        target: "msller::scheduler",
                        task = name,
                        error = %e,
                        category = e.category(),
                        recoverable = e.is_recoverable(),
                        "Cycle failed"
                    );
                }
            }

            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = sleep(task.interval()) => {}
            }
        }

        health.mark_stopped();
        info!(target: "msller::scheduler", task = name, "Periodic task stopped");
    })
}

// ============================================================================
// SECTION 12: COMMAND CHANNEL
// ============================================================================
// Unix socket, newline-delimited JSON: one CommandRequest in, one
// CommandResult out, repeatable on the same connection.
// ============================================================================

// ----------------------------------------------------------------------------
// 12.1 Wire Types
// ----------------------------------------------------------------------------

/// A command invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<usize>,
    #[serde(default)]
    pub print_header: bool,
}

impl CommandRequest {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            width: None,
            print_header: false,
        }
    }

    /// The `msller` query with default options
    pub fn msller() -> Self {
        Self::new(COMMAND_PREFIX)
    }

    pub fn with_width(mut self, width: usize) -> Self {
        self.width = Some(width);
        self
    }

    pub fn with_header(mut self, print_header: bool) -> Self {
        self.print_header = print_header;
        self
    }
}

/// `(retval, stderr, stdout)` triple returned for every command
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommandResult {
    pub retval: i32,
    pub stderr: String,
    pub stdout: String,
}

impl CommandResult {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            retval: 0,
            stderr: String::new(),
            stdout: stdout.into(),
        }
    }

    pub fn error(retval: i32, stderr: impl Into<String>) -> Self {
        Self {
            retval,
            stderr: stderr.into(),
            stdout: String::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.retval == 0
    }
}

// ----------------------------------------------------------------------------
// 12.2 Server
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct CommandServer {
    path: PathBuf,
    listener: UnixListener,
    responder: QueryResponder,
}

impl CommandServer {
    /// Bind `path`, replacing a stale socket left by a previous run.
    pub fn bind(path: impl Into<PathBuf>, responder: QueryResponder) -> MsllerResult<Self> {
        let path = path.into();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| CommandError::BindFailed {
                path: path.clone(),
                source,
            })?;
        }
        match fs::remove_file(&path) {
            Ok(()) => debug!(target: "msller::command", path = %path.display(), "Removed stale socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => return Err(CommandError::BindFailed { path, source }.into()),
        }

        let listener = UnixListener::bind(&path).map_err(|source| CommandError::BindFailed {
            path: path.clone(),
            source,
        })?;

        info!(target: "msller::command", path = %path.display(), "Command socket listening");
        Ok(Self {
            path,
            listener,
            responder,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until cancelled, then remove the socket file.
    pub async fn run(self, token: CancellationToken) -> MsllerResult<()> {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let responder = self.responder.clone();
                        let token = token.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, responder, token).await {
                                debug!(target: "msller::command", error = %e, "Connection closed with error");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(target: "msller::command", error = %e, "Accept failed");
                    }
                }
            }
        }

        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(target: "msller::command", path = %self.path.display(), error = %e, "Failed to remove socket");
            }
        }
        info!(target: "msller::command", "Command socket closed");
        Ok(())
    }
}

/// Answer requests on one connection until the peer hangs up or shutdown
/// begins. A request already read is still answered.
async fn serve_connection(
    stream: UnixStream,
    responder: QueryResponder,
    token: CancellationToken,
) -> io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = TokioBufReader::new(reader).lines();

    loop {
        let line = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => break,
            },
        };
        if line.trim().is_empty() {
            continue;
        }

        let result = match serde_json::from_str::<CommandRequest>(&line) {
            Ok(request) => responder.handle_command(&request).await,
            Err(e) => {
                let error = MsllerError::from(CommandError::InvalidRequest {
                    message: e.to_string(),
                });
                CommandResult::error(error.errno(), error.to_string())
            }
        };

        let mut reply = serde_json::to_string(&result)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        reply.push('\n');
        writer.write_all(reply.as_bytes()).await?;
        writer.flush().await?;
    }

    Ok(())
}

// ----------------------------------------------------------------------------
// 12.3 Client
// ----------------------------------------------------------------------------

/// Send one request to a running daemon and wait for its reply.
pub async fn send_command(
    path: &Path,
    request: &CommandRequest,
    limit: Duration,
) -> MsllerResult<CommandResult> {
    let exchange = async {
        let stream = UnixStream::connect(path)
            .await
            .map_err(|source| CommandError::ConnectionFailed {
                path: path.to_path_buf(),
                source,
            })?;
        let (reader, mut writer) = stream.into_split();

        let mut line = serde_json::to_string(request).map_err(|e| CommandError::Protocol {
            message: e.to_string(),
        })?;
        line.push('\n');
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|source| CommandError::ConnectionFailed {
                path: path.to_path_buf(),
                source,
            })?;

        let reply = TokioBufReader::new(reader)
            .lines()
            .next_line()
            .await
            .map_err(|source| CommandError::ConnectionFailed {
                path: path.to_path_buf(),
                source,
            })?
            .ok_or_else(|| CommandError::Protocol {
                message: "connection closed before reply".into(),
            })?;

        let result = serde_json::from_str::<CommandResult>(&reply).map_err(|e| {
            CommandError::Protocol {
                message: e.to_string(),
            }
        })?;
        Ok::<_, CommandError>(result)
    };

    let result = timeout(limit, exchange)
        .await
        .map_err(|_| CommandError::Timeout {
            timeout_ms: limit.as_millis() as u64,
        })??;
    Ok(result)
}

// ============================================================================
// SECTION 13: ENGINE ORCHESTRATION
// ============================================================================
// serve() is the startup hook, shutdown() the shutdown hook.
// ============================================================================

/// The running MSL daemon.
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    ctx: Arc<MslContext>,
    shutdown: CancellationToken,
    running: AtomicBool,
    started_at: Instant,
    sampler_health: Arc<TaskHealth>,
    analyzer_health: Arc<TaskHealth>,
}

impl Engine {
    /// Build an engine over the file-backed stores named in `config`.
    pub fn from_config(config: EngineConfig) -> MsllerResult<Self> {
        let ctx = Arc::new(MslContext::from_config(&config)?);
        Ok(Self::with_context(config, ctx))
    }

    /// Build an engine over an existing context.
    pub fn with_context(config: EngineConfig, ctx: Arc<MslContext>) -> Self {
        Self {
            config,
            ctx,
            shutdown: CancellationToken::new(),
            running: AtomicBool::new(false),
            started_at: Instant::now(),
            sampler_health: Arc::new(TaskHealth::new("sampler")),
            analyzer_health: Arc::new(TaskHealth::new("analyzer")),
        }
    }

    pub fn context(&self) -> &Arc<MslContext> {
        &self.ctx
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(AtomicOrdering::Acquire)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Seed the MSL state, start both periodic tasks and the command
    /// socket, then wait for [`shutdown`](Self::shutdown).
    pub async fn serve(&self) -> MsllerResult<()> {
        if self.running.swap(true, AtomicOrdering::AcqRel) {
            return Err(MsllerError::Internal("Engine is already running".into()));
        }

        let result = self.serve_until_shutdown().await;
        self.running.store(false, AtomicOrdering::Release);
        result
    }

    async fn serve_until_shutdown(&self) -> MsllerResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(MsllerError::ShuttingDown);
        }

        info!(
            target: "msller::engine",
            instance = %self.config.engine.instance_name,
            version = ENGINE_VERSION,
            "Engine starting"
        );

        ThresholdInitializer::new(self.ctx.clone()).run_once_at_startup()?;

        let server = if self.config.command.enabled {
            Some(CommandServer::bind(
                &self.config.command.socket_path,
                QueryResponder::new(self.ctx.clone()),
            )?)
        } else {
            None
        };

        let sampler = Arc::new(
            RateSampler::new(self.ctx.clone())
                .with_schedule(self.config.sampler.interval, self.config.sampler.initial_delay),
        );
        let analyzer = Arc::new(
            StableLineAnalyzer::new(self.ctx.clone())
                .with_schedule(self.config.analyzer.interval, self.config.analyzer.initial_delay),
        );

        let mut tasks: Vec<(&'static str, TokioJoinHandle<()>)> = vec![
            (
                "sampler",
                spawn_periodic(sampler, self.sampler_health.clone(), self.shutdown.child_token()),
            ),
            (
                "analyzer",
                spawn_periodic(analyzer, self.analyzer_health.clone(), self.shutdown.child_token()),
            ),
        ];

        if let Some(server) = server {
            let token = self.shutdown.child_token();
            tasks.push((
                "command",
                tokio::spawn(async move {
                    if let Err(e) = server.run(token).await {
                        error!(target: "msller::command", error = %e, "Command server failed");
                    }
                }),
            ));
        }

        info!(target: "msller::engine", tasks = tasks.len(), "Engine started");
        self.shutdown.cancelled().await;

        info!(target: "msller::engine", "Starting graceful shutdown");
        let shutdown_start = Instant::now();
        let grace = Duration::from_secs(self.config.engine.shutdown_timeout_secs);

        for (name, mut handle) in tasks {
            let remaining = grace.saturating_sub(shutdown_start.elapsed());
            match timeout(remaining, &mut handle).await {
                Ok(Ok(())) => debug!(target: "msller::engine", task = name, "Task joined"),
                Ok(Err(e)) => warn!(target: "msller::engine", task = name, error = %e, "Task ended abnormally"),
                Err(_) => {
                    warn!(target: "msller::engine", task = name, "Task missed the grace period, aborting");
                    handle.abort();
                }
            }
        }

        info!(
            target: "msller::engine",
            duration_ms = shutdown_start.elapsed().as_millis() as u64,
            "Engine shutdown complete"
        );
        Ok(())
    }

    /// Stop re-arming the periodic tasks and close the command socket.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!(target: "msller::engine", "Shutdown requested");
        }
        self.shutdown.cancel();
    }

    /// Check the stat source's report shape.
    pub async fn self_test(&self) -> MsllerResult<SelfTestReport> {
        Ok(self.ctx.stats.self_test().await?)
    }

    /// Get engine statistics
    pub fn stats(&self) -> EngineStats {
        let msl_value = self.ctx.cached_msl_value();
        EngineStats {
            uptime_secs: self.uptime().as_secs(),
            is_running: self.is_running(),
            sampler: self.sampler_health.snapshot(),
            analyzer: self.analyzer_health.snapshot(),
            errors: self.ctx.errors.snapshot(),
            threshold: self.ctx.cached_threshold(),
            msl_value: msl_value.is_finite().then_some(msl_value),
        }
    }
}

/// Engine statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStats {
    pub uptime_secs: u64,
    pub is_running: bool,
    pub sampler: TaskHealthSnapshot,
    pub analyzer: TaskHealthSnapshot,
    pub errors: ErrorStatsSnapshot,
    pub threshold: f64,
    pub msl_value: Option<f64>,
}

/// Resolve on SIGTERM or SIGINT.
pub async fn wait_for_shutdown_signal() -> io::Result<()> {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!(target: "msller::engine", "Received SIGTERM");
        }
        _ = sigint.recv() => {
            info!(target: "msller::engine", "Received SIGINT");
        }
    }
    Ok(())
}

// ============================================================================
// SECTION 14: CLI INTERFACE & MAIN ENTRY POINT
// ============================================================================

// ----------------------------------------------------------------------------
// 14.1 CLI Arguments
// ----------------------------------------------------------------------------

/// Msller CLI
#[derive(Parser, Debug)]
#[command(
    name = "msller",
    author = "AIOps Team",
    version,
    about = "Max Stable Line estimator for storage cluster IOPS",
    long_about = "Msller samples cluster-wide read/write IOPS once per second, keeps \
                  the samples in an append-only log and publishes the lowest sustained \
                  total IOPS, clamped below by an operator floor, as the Max Stable Line."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "msller.toml", env = "MSLLER_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "MSLLER_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long, env = "MSLLER_DEBUG")]
    pub debug: bool,

    /// Subcommand to run (default: serve)
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the sampler, the analyzer and the command socket
    Serve,

    /// Show current rates and the published MSL
    Query {
        /// Render width
        #[arg(short, long)]
        width: Option<usize>,

        /// Print the column header row
        #[arg(long)]
        print_header: bool,

        /// Compute in-process instead of asking the daemon
        #[arg(long)]
        direct: bool,

        /// Daemon socket (default: command.socket_path)
        #[arg(short, long)]
        socket: Option<PathBuf>,
    },

    /// Check the stat source returns every required field
    SelfTest,

    /// Set the administrator floor `msl_threshold`
    SetThreshold {
        /// New floor in IOPS
        value: f64,
    },

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version and build info
    Version,
}

// ----------------------------------------------------------------------------
// 14.2 CLI Handler Functions
// ----------------------------------------------------------------------------

/// Handle the validate subcommand
fn handle_validate(config_path: &Path, verbose: bool) -> MsllerResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    match EngineConfig::load(config_path) {
        Ok(config) => {
            println!("✅ Configuration is valid!");

            if verbose {
                println!("\n📋 Parsed configuration:");
                println!("{}", "=".repeat(60));
                match toml::to_string_pretty(&config) {
                    Ok(s) => println!("{}", s),
                    Err(e) => println!("Failed to serialize: {}", e),
                }
            }

            let hostname = config.engine.resolve_hostname();
            println!("\n📊 Configuration Summary:");
            println!("  • Instance name: {}", config.engine.instance_name);
            println!("  • Stat source: {:?}", config.source);
            println!("  • Sample interval: {}", humantime::format_duration(config.sampler.interval));
            println!("  • Analysis interval: {}", humantime::format_duration(config.analyzer.interval));
            println!("  • Default threshold: {}", config.threshold.default_floor);
            println!("  • Sample log: {}", config.storage.resolved_log_path(&hostname).display());
            println!("  • State store: {}", config.storage.state_path.display());
            if config.command.enabled {
                println!("  • Command socket: {}", config.command.socket_path.display());
            }

            Ok(())
        }
        Err(e) => {
            println!("❌ Configuration validation failed!");
            println!("Error: {}", e);
            Err(MsllerError::Config(e))
        }
    }
}

/// Handle the generate-config subcommand
fn handle_generate_config(output: Option<&Path>) -> MsllerResult<()> {
    let config_str = EngineConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("✅ Default configuration written to: {}", path.display());
        }
        None => {
            println!("{}", config_str);
        }
    }

    Ok(())
}

/// Handle the version subcommand
fn handle_version() {
    println!("📈 {} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!("  • Family: {}", std::env::consts::FAMILY);
    println!();
    println!("Command: {}", COMMAND_PREFIX);
    println!("License: MIT");
}

/// Handle the query subcommand
async fn handle_query(
    config: &EngineConfig,
    width: Option<usize>,
    print_header: bool,
    direct: bool,
    socket: Option<PathBuf>,
) -> AnyhowResult<()> {
    let mut request = CommandRequest::msller().with_header(print_header);
    if let Some(width) = width {
        request = request.with_width(width);
    }

    let result = if direct {
        let ctx = Arc::new(MslContext::from_config(config)?);
        QueryResponder::new(ctx).handle_command(&request).await
    } else {
        let socket = socket.unwrap_or_else(|| config.command.socket_path.clone());
        send_command(&socket, &request, Duration::from_secs(COMMAND_TIMEOUT_SECS))
            .await
            .with_context(|| format!("Failed to query daemon at {}", socket.display()))?
    };

    print!("{}", result.stdout);
    if !result.is_success() {
        return Err(anyhow!("query failed ({}): {}", result.retval, result.stderr));
    }
    Ok(())
}

/// Handle the self-test subcommand
async fn handle_self_test(config: &EngineConfig) -> AnyhowResult<()> {
    let ctx = MslContext::from_config(config)?;
    let report = ctx
        .stats
        .self_test()
        .await
        .context("Stat source did not answer")?;

    println!("Stat source: {}", report.source);
    if report.passed() {
        println!("✅ io_rate report carries every required field");
        if let Some(snapshot) = report.snapshot {
            let sample = RateSample::from_snapshot(&snapshot);
            println!(
                "  • {:.2}s elapsed, {:.1} read IOPS, {:.1} write IOPS",
                snapshot.elapsed_seconds, sample.read_iops, sample.write_iops
            );
        }
        return Ok(());
    }

    println!("❌ io_rate report is incomplete");
    for field in &report.missing_fields {
        println!("  • missing: {}", field);
    }
    if report.missing_fields.is_empty() {
        println!("  • every field is present but at least one is not numeric");
    }
    Err(anyhow!("self-test failed for {}", report.source))
}

/// Handle the set-threshold subcommand
fn handle_set_threshold(config: &EngineConfig, value: f64) -> AnyhowResult<InitOutcome> {
    let store = FileConfigStore::new(
        &config.storage.state_path,
        &config.storage.key_prefix,
        config.storage.sync_writes,
    );
    let outcome = apply_threshold(&store, value)
        .with_context(|| format!("Failed to update {}", store.path().display()))?;

    println!("✅ {} set to {}", KEY_MSL_THRESHOLD, format_store_value(outcome.threshold));
    if outcome.raised_value {
        println!("   {} raised to {}", KEY_MSL_VALUE, format_store_value(outcome.msl_value));
    }
    Ok(outcome)
}

/// Run the daemon until SIGTERM/SIGINT
async fn run_daemon(config: EngineConfig) -> AnyhowResult<()> {
    let engine = Arc::new(Engine::from_config(config).context("Failed to build engine")?);

    let signal_engine = engine.clone();
    tokio::spawn(async move {
        match wait_for_shutdown_signal().await {
            Ok(()) => signal_engine.shutdown(),
            Err(e) => error!(target: "msller::engine", error = %e, "Failed to install signal handlers"),
        }
    });

    engine.serve().await.context("Engine failed")?;

    let stats = engine.stats();
    info!(
        target: "msller::engine",
        uptime_secs = stats.uptime_secs,
        samples = stats.sampler.cycles,
        analyses = stats.analyzer.cycles,
        errors = stats.errors.total,
        msl_value = ?stats.msl_value,
        "Final engine statistics"
    );
    Ok(())
}

// ----------------------------------------------------------------------------
// 14.3 Main
// ----------------------------------------------------------------------------

/// Main entry point for the Msller engine
#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Subcommands that don't need full initialization
    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        _ => {}
    }

    let from_file = cli.config.exists();
    let config = if from_file {
        EngineConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    } else {
        EngineConfig::from_env().context("Failed to load config from environment")?
    };

    let command = cli.command.clone().unwrap_or(Commands::Serve);

    let mut logging_config = config.logging.clone();
    if !matches!(command, Commands::Serve) {
        // One-shot commands print results on stdout; keep stderr quiet.
        logging_config.level = "warn".into();
        logging_config.file = None;
    }
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }

    let _log_guard = init_logging(&logging_config)?;
    if !from_file {
        warn!(target: "msller::init", path = %cli.config.display(), "Config file not found, using defaults");
    }

    match command {
        Commands::Serve => {
            info!("📈 {} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
            run_daemon(config).await?;
        }
        Commands::Query {
            width,
            print_header,
            direct,
            socket,
        } => handle_query(&config, width, print_header, direct, socket).await?,
        Commands::SelfTest => handle_self_test(&config).await?,
        Commands::SetThreshold { value } => {
            handle_set_threshold(&config, value)?;
        }
        Commands::Version | Commands::Validate { .. } | Commands::GenerateConfig { .. } => {}
    }

    Ok(())
}

// ============================================================================
// SECTION 15: TESTS
// ============================================================================

#[cfg(test)]
mod test_support {
    use super::*;
    use std::collections::VecDeque;

    /// An `io_rate` report as the host returns it.
    pub(crate) fn io_rate(elapsed: f64, read_kb: i64, write_kb: i64, reads: i64, writes: i64) -> JsonValue {
        serde_json::json!({
            "pg_stats_delta": {
                "stamp_delta": elapsed.to_string(),
                "stat_sum": {
                    "num_read_kb": read_kb,
                    "num_write_kb": write_kb,
                    "num_read": reads,
                    "num_write": writes,
                }
            }
        })
    }

    /// Stat source replaying queued replies, then a fixed report.
    #[derive(Debug, Default)]
    pub(crate) struct ScriptedSource {
        queue: Mutex<VecDeque<StatResult<JsonValue>>>,
        fallback: Mutex<Option<JsonValue>>,
        pub(crate) fetches: AtomicU64,
    }

    impl ScriptedSource {
        pub(crate) fn always(report: JsonValue) -> Arc<Self> {
            let source = Self::default();
            *source.fallback.lock() = Some(report);
            Arc::new(source)
        }

        pub(crate) fn unavailable() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub(crate) fn push(&self, reply: StatResult<JsonValue>) {
            self.queue.lock().push_back(reply);
        }

        pub(crate) fn fetch_count(&self) -> u64 {
            self.fetches.load(AtomicOrdering::SeqCst)
        }
    }

    #[async_trait]
    impl StatSource for ScriptedSource {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn fetch_io_rate(&self) -> StatResult<JsonValue> {
            self.fetches.fetch_add(1, AtomicOrdering::SeqCst);
            if let Some(reply) = self.queue.lock().pop_front() {
                return reply;
            }
            match self.fallback.lock().clone() {
                Some(report) => Ok(report),
                None => Err(StatError::unavailable("scripted", "no report")),
            }
        }
    }

    #[derive(Debug)]
    pub(crate) struct Harness {
        pub(crate) ctx: Arc<MslContext>,
        pub(crate) log: Arc<MemorySampleLog>,
        pub(crate) store: Arc<MemoryConfigStore>,
        pub(crate) source: Arc<ScriptedSource>,
    }

    pub(crate) fn harness(source: Arc<ScriptedSource>) -> Harness {
        harness_with_log(source, MemorySampleLog::new())
    }

    pub(crate) fn harness_with_log(source: Arc<ScriptedSource>, log: MemorySampleLog) -> Harness {
        let log = Arc::new(log);
        let store = Arc::new(MemoryConfigStore::new());
        let ctx = Arc::new(MslContext::new(
            StatSourceAdapter::new(source.clone()),
            log.clone(),
            store.clone(),
        ));
        Harness {
            ctx,
            log,
            store,
            source,
        }
    }

    /// Log lines holding one record per total, one second apart.
    pub(crate) fn log_with_totals(totals: &[f64]) -> MemorySampleLog {
        MemorySampleLog::with_lines(totals.iter().enumerate().map(|(i, total)| {
            LogRecord {
                timestamp: Timestamp::from_millis(1_700_000_000_000 + i as i64 * 1000),
                read_iops: total / 2.0,
                write_iops: total / 2.0,
                total_iops: *total,
            }
            .to_line()
        }))
    }

    pub(crate) fn stored(store: &MemoryConfigStore, key: &str) -> Option<String> {
        store.get_config(key).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test]
    fn test_timestamp_log_format() {
        let ts = Timestamp::from_millis(1_700_000_000_123);
        assert_eq!(ts.to_log_string(), "2023-11-14 22:13:20.123");
        assert_eq!(Timestamp::parse_log(&ts.to_log_string()), Some(ts));
    }

    #[test]
    fn test_timestamp_accepts_other_layouts() {
        let expected = Timestamp::from_millis(1_700_000_000_123);
        assert_eq!(Timestamp::parse_log("2023-11-14T22:13:20.123"), Some(expected));
        assert_eq!(Timestamp::parse_log("2023-11-14T22:13:20.123Z"), Some(expected));
        // Older samplers wrote "<asctime>,<msecs>.<msecs>"
        assert_eq!(Timestamp::parse_log("2023-11-14 22:13:20,123.123"), Some(expected));
        assert_eq!(Timestamp::parse_log("yesterday"), None);
    }

    #[test]
    fn test_timestamp_ordering() {
        let ts1 = Timestamp::now();
        std::thread::sleep(Duration::from_millis(10));
        let ts2 = Timestamp::now();

        assert!(ts2 > ts1);
        assert!(ts2.duration_since(ts1).as_millis() >= 10);
        assert_eq!(ts1.duration_since(ts2), Duration::ZERO);
    }

    #[test]
    fn test_atomic_f64() {
        let value = AtomicF64::new(1.5);
        assert_eq!(value.load(AtomicOrdering::Relaxed), 1.5);
        value.store(-2.25, AtomicOrdering::Relaxed);
        assert_eq!(value.load(AtomicOrdering::Relaxed), -2.25);
    }

    #[test]
    fn test_snapshot_from_io_rate() {
        let report = test_support::io_rate(2.0, 20, 10, 10, 5);
        let snapshot = DeltaSnapshot::from_io_rate(&report).unwrap();

        assert_eq!(
            snapshot,
            DeltaSnapshot {
                elapsed_seconds: 2.0,
                read_kb: 20,
                write_kb: 10,
                read_ops: 10,
                write_ops: 5,
            }
        );
    }

    #[test]
    fn test_snapshot_accepts_numeric_strings() {
        let report = serde_json::json!({
            "pg_stats_delta": {
                "stamp_delta": 1.5,
                "stat_sum": {
                    "num_read_kb": "4",
                    "num_write_kb": 8.0,
                    "num_read": 3,
                    "num_write": "0",
                }
            }
        });
        let snapshot = DeltaSnapshot::from_io_rate(&report).unwrap();
        assert_eq!(snapshot.elapsed_seconds, 1.5);
        assert_eq!(snapshot.read_kb, 4);
        assert_eq!(snapshot.write_kb, 8);
    }

    #[test]
    fn test_snapshot_names_missing_field() {
        let mut report = test_support::io_rate(1.0, 1, 1, 1, 1);
        report["pg_stats_delta"]["stat_sum"]
            .as_object_mut()
            .unwrap()
            .remove("num_write");

        match DeltaSnapshot::from_io_rate(&report) {
            Err(StatError::MalformedSnapshot { field, .. }) => {
                assert_eq!(field, "pg_stats_delta.stat_sum.num_write");
            }
            other => panic!("expected malformed snapshot, got {:?}", other),
        }

        match DeltaSnapshot::from_io_rate(&serde_json::json!({})) {
            Err(StatError::MalformedSnapshot { field, .. }) => assert_eq!(field, "pg_stats_delta"),
            other => panic!("expected malformed snapshot, got {:?}", other),
        }
    }

    #[test]
    fn test_snapshot_rejects_non_numeric() {
        let mut report = test_support::io_rate(1.0, 1, 1, 1, 1);
        report["pg_stats_delta"]["stamp_delta"] = serde_json::json!("soon");
        assert!(matches!(
            DeltaSnapshot::from_io_rate(&report),
            Err(StatError::MalformedSnapshot { ref field, .. }) if field == "pg_stats_delta.stamp_delta"
        ));
    }

    #[test]
    fn test_rate_sample_from_snapshot() {
        let snapshot = DeltaSnapshot {
            elapsed_seconds: 2.0,
            read_kb: 20,
            write_kb: 10,
            read_ops: 10,
            write_ops: 5,
        };
        let sample = RateSample::from_snapshot(&snapshot);

        assert_eq!(sample.read_iops, 5.0);
        assert_eq!(sample.write_iops, 2.5);
        assert_eq!(sample.total_iops, 7.5);
        assert_eq!(sample.read_bytes_per_sec, 10240.0);
        assert_eq!(sample.write_bytes_per_sec, 5120.0);
        assert_eq!(sample.total_bytes_per_sec, 15360.0);
    }

    #[test_case(0.0 ; "zero elapsed")]
    #[test_case(-1.0 ; "negative elapsed")]
    fn test_rate_sample_without_elapsed_time(elapsed: f64) {
        let snapshot = DeltaSnapshot {
            elapsed_seconds: elapsed,
            read_kb: 100,
            write_kb: 100,
            read_ops: 100,
            write_ops: 100,
        };
        assert_eq!(RateSample::from_snapshot(&snapshot), RateSample::default());
    }

    #[test]
    fn test_rate_sample_negative_counters_count_as_idle() {
        let snapshot = DeltaSnapshot {
            elapsed_seconds: 1.0,
            read_kb: -50,
            write_kb: 4,
            read_ops: -10,
            write_ops: 4,
        };
        let sample = RateSample::from_snapshot(&snapshot);
        assert_eq!(sample.read_iops, 0.0);
        assert_eq!(sample.total_iops, 4.0);
        assert_eq!(sample.read_bytes_per_sec, 0.0);
    }

    #[test_case(0.0, "0.00 B/s")]
    #[test_case(1023.0, "1023.00 B/s")]
    #[test_case(1024.0, "1.00 KiB/s")]
    #[test_case(15360.0, "15.00 KiB/s")]
    #[test_case(12.3 * 1024.0 * 1024.0, "12.30 MiB/s")]
    #[test_case(f64::NAN, "0.00 B/s")]
    fn test_format_iec(value: f64, expected: &str) {
        assert_eq!(format_iec(value, "/s"), expected);
    }

    #[test]
    fn test_render_row_layout() {
        let row = render_row(&["a", "bb", "ccc"], 30);
        assert_eq!(row, format!("{:>10}{:>10}{:>10}", "a", "bb", "ccc"));

        let padded = render_row(&["x"; 7], 90);
        assert_eq!(padded.len(), 90);
        assert!(padded.ends_with(' '));
    }

    #[test]
    fn test_render_row_overflow_keeps_cells() {
        let row = render_row(&["1234567", "89"], 10);
        assert!(row.contains("1234567"));
        assert!(row.contains("89"));
    }

    #[test]
    fn test_log_record_line() {
        let record = LogRecord {
            timestamp: Timestamp::from_millis(1_700_000_000_123),
            read_iops: 5.0,
            write_iops: 2.5,
            total_iops: 7.5,
        };
        assert_eq!(record.to_line(), "2023-11-14 22:13:20.123|5,2.5,7.5");
        assert_eq!(LogRecord::parse_line(&record.to_line()), Ok(record));
        assert_eq!(LogRecord::parse_line(&format!("{}\r\n", record.to_line())), Ok(record));
    }

    #[test_case("garbage", LogLineError::MissingSeparator ; "no separator")]
    #[test_case("2024-01-01 00:00:00.000|1,2", LogLineError::FieldCount { found: 2 } ; "too few values")]
    #[test_case("2024-01-01 00:00:00.000|1,2,3,4", LogLineError::FieldCount { found: 4 } ; "too many values")]
    #[test_case("not a time|1,2,3", LogLineError::InvalidTimestamp { value: "not a time".into() } ; "bad timestamp")]
    #[test_case("2024-01-01 00:00:00.000|1,x,3", LogLineError::InvalidNumber { index: 1, value: "x".into() } ; "not a number")]
    #[test_case("2024-01-01 00:00:00.000|1,2,-3", LogLineError::InvalidNumber { index: 2, value: "-3".into() } ; "negative")]
    #[test_case("2024-01-01 00:00:00.000|1,2,inf", LogLineError::InvalidNumber { index: 2, value: "inf".into() } ; "infinite")]
    #[test_case("2024-01-01 00:00:00.000|NaN,2,3", LogLineError::InvalidNumber { index: 0, value: "NaN".into() } ; "nan")]
    fn test_malformed_log_lines(line: &str, expected: LogLineError) {
        assert_eq!(LogRecord::parse_line(line), Err(expected));
    }

    #[test]
    fn test_store_value_format() {
        assert_eq!(format_store_value(100.0), "100.0");
        assert_eq!(format_store_value(30.5), "30.5");
        assert_eq!(parse_store_value(" 42 "), Some(42.0));
        assert_eq!(parse_store_value("NaN"), None);
        assert_eq!(parse_store_value("inf"), None);
        assert_eq!(parse_store_value("abc"), None);
    }

    #[test]
    fn test_error_codes() {
        let unavailable = MsllerError::from(StatError::unavailable("x", "down"));
        assert_eq!(unavailable.errno(), -libc::EAGAIN);
        assert!(unavailable.is_recoverable());
        assert_eq!(unavailable.category(), "stat_unavailable");

        let malformed = MsllerError::from(StatError::malformed("pg_stats_delta", "missing"));
        assert_eq!(malformed.errno(), -libc::EIO);
        assert!(!malformed.is_recoverable());

        let bad_request = MsllerError::from(CommandError::InvalidRequest { message: "x".into() });
        assert_eq!(bad_request.errno(), -libc::EINVAL);
        assert_eq!(MsllerError::ShuttingDown.errno(), -libc::ESHUTDOWN);
    }

    #[test]
    fn test_error_stats() {
        let stats = ErrorStats::new();
        stats.record(&StatError::unavailable("x", "down").into());
        stats.record(&StatError::unavailable("x", "down").into());
        stats.record(&ConfigError::invalid_value("a", "b").into());

        assert_eq!(stats.total_errors(), 3);
        assert_eq!(stats.count_by_category("stat_unavailable"), 2);
        assert_eq!(stats.count_by_category("config"), 1);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.recoverable, 2);
        assert_eq!(snapshot.non_recoverable, 1);
        assert!(snapshot.last_error.is_some());
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sampler.interval, Duration::from_secs(1));
        assert_eq!(config.analyzer.interval, Duration::from_secs(60));
        assert_eq!(config.threshold.default_floor, 100.0);
        assert_eq!(config.command.default_width, 90);
    }

    #[test]
    fn test_generated_config_parses_back() {
        let generated = EngineConfig::generate_default_config();
        let config = EngineConfig::from_str(&generated).unwrap();
        assert_eq!(config.source, StatSourceConfig::default());
        assert_eq!(config.sampler.interval, Duration::from_secs(1));
        assert_eq!(config.storage.key_prefix, DEFAULT_STORE_PREFIX);
    }

    #[test]
    fn test_config_from_toml() {
        let config = EngineConfig::from_str(
            r#"
            [source]
            kind = "file"
            path = "/run/ceph/io_rate.json"

            [sampler]
            interval = "2s"
            initial_delay = "0s"

            [threshold]
            default_floor = 250.0
            "#,
        )
        .unwrap();

        assert_eq!(
            config.source,
            StatSourceConfig::File {
                path: PathBuf::from("/run/ceph/io_rate.json")
            }
        );
        assert_eq!(config.sampler.interval, Duration::from_secs(2));
        assert_eq!(config.sampler.initial_delay, Duration::ZERO);
        assert_eq!(config.threshold.default_floor, 250.0);
        assert_eq!(config.analyzer.interval, Duration::from_secs(60));
    }

    #[test_case("[sampler]\ninterval = \"50ms\"", "sampler.interval" ; "sampler too fast")]
    #[test_case("[analyzer]\ninterval = \"0s\"", "analyzer.interval" ; "analyzer zero")]
    #[test_case("[threshold]\ndefault_floor = -1.0", "threshold.default_floor" ; "negative floor")]
    #[test_case("[command]\ndefault_width = 3", "command.default_width" ; "narrow width")]
    #[test_case("[source]\nkind = \"http\"\nurl = \"\"", "source.url" ; "empty url")]
    fn test_config_validation(toml_str: &str, field_name: &str) {
        match EngineConfig::from_str(toml_str) {
            Err(ConfigError::InvalidValue { field, .. }) => assert_eq!(field, field_name),
            other => panic!("expected invalid {}, got {:?}", field_name, other),
        }
    }

    #[test]
    fn test_config_load_missing_file() {
        assert!(matches!(
            EngineConfig::load("/nonexistent/msller.toml"),
            Err(ConfigError::FileNotFound { .. })
        ));
    }

    #[test]
    fn test_resolved_log_path() {
        let storage = StorageConfig::default();
        assert_eq!(
            storage.resolved_log_path("node1"),
            PathBuf::from("/var/log/ceph/ceph-mgr.msller.node1.log")
        );

        let storage = StorageConfig {
            log_path: Some(PathBuf::from("/tmp/samples.log")),
            ..StorageConfig::default()
        };
        assert_eq!(storage.resolved_log_path("node1"), PathBuf::from("/tmp/samples.log"));
    }

    #[test]
    fn test_hostname_override() {
        let general = GeneralConfig {
            hostname: Some("mgr-a".into()),
            ..GeneralConfig::default()
        };
        assert_eq!(general.resolve_hostname(), "mgr-a");
        assert!(!GeneralConfig::default().resolve_hostname().is_empty());
    }
}

#[cfg(test)]
mod storage_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn test_file_sample_log_append_and_read() {
        let dir = tempdir().unwrap();
        let log = FileSampleLog::new(dir.path().join("nested/samples.log"), false);

        assert!(log.read_all_lines().unwrap().is_empty());

        log.append_line("first").unwrap();
        log.append_line("second").unwrap();
        assert_eq!(log.read_all_lines().unwrap(), vec!["first", "second"]);

        let raw = fs::read_to_string(log.path()).unwrap();
        assert_eq!(raw, "first\nsecond\n");
    }

    #[test]
    fn test_file_sample_log_reopens_after_rotation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("samples.log");
        let log = FileSampleLog::new(&path, true);

        log.append_line("before").unwrap();
        let rotated = dir.path().join("samples.log.1");
        fs::rename(&path, &rotated).unwrap();

        log.append_line("after").unwrap();
        assert_eq!(log.read_all_lines().unwrap(), vec!["after"]);
        assert_eq!(fs::read_to_string(&rotated).unwrap(), "before\n");
    }

    #[test]
    fn test_file_sample_log_tolerates_invalid_utf8() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("samples.log");
        fs::write(&path, b"good\n\xff\xfe\nalso good\n").unwrap();

        let lines = FileSampleLog::new(&path, false).read_all_lines().unwrap();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "good");
        assert_eq!(lines[2], "also good");
    }

    #[test]
    fn test_memory_sample_log() {
        let log = MemorySampleLog::with_lines(["a"]);
        log.append_line("b").unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log.read_all_lines().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_file_config_store_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state/state.json");
        let store = FileConfigStore::new(&path, DEFAULT_STORE_PREFIX, true);

        assert_eq!(store.get_config(KEY_MSL_VALUE).unwrap(), None);
        store.set_config(KEY_MSL_VALUE, "42.0").unwrap();
        store.set_config(KEY_MSL_THRESHOLD, "10.0").unwrap();
        assert_eq!(store.get_config(KEY_MSL_VALUE).unwrap().as_deref(), Some("42.0"));

        let on_disk: BTreeMap<String, String> =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk.get("mgr/msller/msl_value").map(String::as_str), Some("42.0"));
        assert_eq!(on_disk.len(), 2);
    }

    #[test]
    fn test_file_config_store_sees_external_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let daemon = FileConfigStore::new(&path, DEFAULT_STORE_PREFIX, false);
        let operator = FileConfigStore::new(&path, DEFAULT_STORE_PREFIX, false);

        daemon.set_config(KEY_MSL_THRESHOLD, "100.0").unwrap();
        operator.set_config(KEY_MSL_THRESHOLD, "250.0").unwrap();
        assert_eq!(daemon.get_config(KEY_MSL_THRESHOLD).unwrap().as_deref(), Some("250.0"));
    }

    #[test]
    fn test_file_config_store_concurrent_writers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let daemon = FileConfigStore::new(&path, DEFAULT_STORE_PREFIX, false);
        let operator = FileConfigStore::new(&path, DEFAULT_STORE_PREFIX, false);

        let rounds = 300;
        std::thread::scope(|scope| {
            let value_writer = scope.spawn(|| {
                (0..rounds)
                    .filter(|i| daemon.set_config(KEY_MSL_VALUE, &format!("{}.0", i)).is_err())
                    .count()
            });
            let threshold_writer = scope.spawn(|| {
                (0..rounds)
                    .filter(|i| operator.set_config(KEY_MSL_THRESHOLD, &format!("{}.0", i)).is_err())
                    .count()
            });
            assert_eq!(value_writer.join().unwrap(), 0);
            assert_eq!(threshold_writer.join().unwrap(), 0);
        });

        // Neither writer clobbered the other's key with a stale copy.
        let last = format!("{}.0", rounds - 1);
        assert_eq!(daemon.get_config(KEY_MSL_VALUE).unwrap(), Some(last.clone()));
        assert_eq!(daemon.get_config(KEY_MSL_THRESHOLD).unwrap(), Some(last));

        let mut names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["state.json", "state.json.lock"]);
    }

    #[test]
    fn test_file_config_store_detects_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{not json").unwrap();

        let store = FileConfigStore::new(&path, DEFAULT_STORE_PREFIX, false);
        assert!(matches!(
            store.get_config(KEY_MSL_VALUE),
            Err(StorageError::DataCorruption { .. })
        ));
    }

    #[test]
    fn test_stored_numbers() {
        let store = MemoryConfigStore::new();
        assert_eq!(read_stored_number(&store, "k").unwrap(), StoredNumber::Missing);

        store.set_config("k", "abc").unwrap();
        assert_eq!(
            read_stored_number(&store, "k").unwrap(),
            StoredNumber::Invalid("abc".into())
        );

        write_stored_number(&store, "k", 12.5).unwrap();
        assert_eq!(store.get_config("k").unwrap().as_deref(), Some("12.5"));
        assert_eq!(read_stored_number(&store, "k").unwrap().valid(), Some(12.5));
    }

    #[tokio::test]
    async fn test_file_stat_source() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("io_rate.json");
        fs::write(&path, test_support::io_rate(2.0, 20, 10, 10, 5).to_string()).unwrap();

        let adapter = StatSourceAdapter::new(Arc::new(FileStatSource::new(&path)));
        let snapshot = adapter.get_stat_snapshot().await.unwrap();
        assert_eq!(snapshot.read_ops, 10);

        fs::write(&path, "{").unwrap();
        assert!(matches!(
            adapter.get_stat_snapshot().await,
            Err(StatError::MalformedSnapshot { .. })
        ));

        fs::remove_file(&path).unwrap();
        assert!(matches!(
            adapter.get_stat_snapshot().await,
            Err(StatError::Unavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_http_stat_source_unreachable() {
        let source = HttpStatSource::new("http://127.0.0.1:1/api/io_rate", Duration::from_secs(2)).unwrap();
        let err = source.fetch_io_rate().await.unwrap_err();
        assert!(err.is_recoverable());
    }
}



#[cfg(test)]
mod property_tests {
    use super::test_support::*;
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_total_is_sum_of_parts(
            elapsed in 0.001f64..1_000.0,
            reads in 0i64..10_000_000,
            writes in 0i64..10_000_000,
        ) {
            let sample = RateSample::from_snapshot(&DeltaSnapshot {
                elapsed_seconds: elapsed,
                read_kb: reads,
                write_kb: writes,
                read_ops: reads,
                write_ops: writes,
            });
            prop_assert_eq!(sample.total_iops, sample.read_iops + sample.write_iops);
            prop_assert_eq!(sample.total_bytes_per_sec, sample.read_bytes_per_sec + sample.write_bytes_per_sec);
            prop_assert!(sample.total_iops >= 0.0);
        }

        #[test]
        fn prop_no_elapsed_time_means_zero_rates(
            elapsed in -1_000.0f64..=0.0,
            reads in any::<i64>(),
            writes in any::<i64>(),
        ) {
            let sample = RateSample::from_snapshot(&DeltaSnapshot {
                elapsed_seconds: elapsed,
                read_kb: reads,
                write_kb: writes,
                read_ops: reads,
                write_ops: writes,
            });
            prop_assert_eq!(sample, RateSample::default());
        }

        #[test]
        fn prop_published_value_is_clamped_minimum(
            totals in prop::collection::vec(0.0f64..1_000_000.0, 1..40),
            threshold in 0.0f64..1_000_000.0,
        ) {
            let h = harness_with_log(ScriptedSource::unavailable(), log_with_totals(&totals));
            write_stored_number(&*h.store, KEY_MSL_THRESHOLD, threshold).unwrap();

            let report = StableLineAnalyzer::new(h.ctx.clone()).run_once().unwrap();
            let minimum = totals.iter().copied().fold(f64::INFINITY, f64::min);
            let published = report.published.unwrap();

            prop_assert_eq!(published, minimum.max(threshold));
            prop_assert!(published >= threshold);
            let stored_value = read_stored_number(&*h.store, KEY_MSL_VALUE).unwrap().valid();
            prop_assert_eq!(stored_value, Some(published));
        }

        #[test]
        fn prop_log_line_round_trip(
            millis in 0i64..4_000_000_000_000,
            read in 0.0f64..1e9,
            write in 0.0f64..1e9,
        ) {
            let record = LogRecord {
                timestamp: Timestamp::from_millis(millis),
                read_iops: read,
                write_iops: write,
                total_iops: read + write,
            };
            prop_assert_eq!(LogRecord::parse_line(&record.to_line()), Ok(record));
        }
    }
}
