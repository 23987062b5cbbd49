//! # MassAffect Engine - Telemetry Ingestion & Live Fan-Out
//!
//! The controller side of the MassAffect monitoring platform. Remote agents
//! push signed batches of metric events; the engine authenticates them, keeps
//! a bounded recent history per reporting scope, persists to a cold store on
//! a best-effort basis and pushes every event to live viewers in real time.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                           MASSAFFECT ENGINE                                  │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  AGENT → AUTHENTICATOR → INGESTION PIPELINE ─┬→ HISTORY STORE               │
//! │                                              ├→ COLD STORE WRITER (async)   │
//! │                                              └→ DISPATCHER → SSE VIEWERS    │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Authenticated ingestion**: address allow-list plus HMAC-SHA256 over the
//!   exact received bytes, compared in constant time
//! - **Bounded history**: most-recent-first per `(host, collector)` scope with
//!   FIFO eviction
//! - **Lossy cold tier**: SQLite persistence on background workers, never on
//!   the acknowledgement path
//! - **Live fan-out**: Server-Sent Events for the global firehose or a single
//!   scope
//!
//! ## Author
//!
//! MassAffect Team

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================
// External crate imports organized by functionality.
// ============================================================================

#![allow(dead_code)]
#![warn(rust_2018_idioms)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::convert::Infallible;
use std::fmt::{self, Debug, Display, Formatter};
use std::fs;
use std::io::{self, Read};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::signal;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio::task::JoinHandle as TokioJoinHandle;
use tokio::time::timeout;

use futures::stream::{self, Stream, StreamExt};

// ----------------------------------------------------------------------------
// Concurrency Primitives
// ----------------------------------------------------------------------------
use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize};
use serde_json::{json, Map as JsonMap, Value as JsonValue};

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, trace, warn, Level};
use tracing_subscriber::{fmt as tracing_fmt, layer::SubscriberExt, EnvFilter};

// ----------------------------------------------------------------------------
// Time & Timestamps
// ----------------------------------------------------------------------------
use chrono::{DateTime, Utc};

// ----------------------------------------------------------------------------
// Cryptography
// ----------------------------------------------------------------------------
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

// ----------------------------------------------------------------------------
// Compression
// ----------------------------------------------------------------------------
use flate2::read::GzDecoder;

// ----------------------------------------------------------------------------
// HTTP Server
// ----------------------------------------------------------------------------
use axum::body::Bytes;
use axum::extract::{ConnectInfo, DefaultBodyLimit, Path as UrlPath, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self as axum_middleware, Next};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use tower_http::trace::TraceLayer;

// ----------------------------------------------------------------------------
// Cold Storage
// ----------------------------------------------------------------------------
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

// ----------------------------------------------------------------------------
// Async Traits
// ----------------------------------------------------------------------------
use async_trait::async_trait;

// ----------------------------------------------------------------------------
// UUID & Identifiers
// ----------------------------------------------------------------------------
use uuid::Uuid;

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

// ----------------------------------------------------------------------------
// Prometheus
// ----------------------------------------------------------------------------
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry as PrometheusRegistry, TextEncoder};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================
// Global constants that define the behavior and limits of the engine.
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "massaffect-engine";
pub const ENGINE_FULL_NAME: &str = "MassAffect Telemetry Engine";

// ----------------------------------------------------------------------------
// History & Buffers
// ----------------------------------------------------------------------------

/// Events retained per `(host, collector)` scope
pub const DEFAULT_HISTORY_CAPACITY: usize = 2000;

/// Queue depth between ingestion and the cold-store workers
pub const DEFAULT_COLD_STORE_QUEUE_CAPACITY: usize = 10_000;

/// Number of background cold-store writers
pub const DEFAULT_COLD_STORE_WORKERS: usize = 4;

// ----------------------------------------------------------------------------
// Timing & Intervals
// ----------------------------------------------------------------------------

/// Upper bound for a single cold-store insert (milliseconds)
pub const DEFAULT_COLD_STORE_WRITE_TIMEOUT_MS: u64 = 5_000;

/// Interval between SSE keep-alive comments (seconds, 0 disables)
pub const DEFAULT_SSE_KEEPALIVE_SECS: u64 = 15;

/// Grace period for shutdown (seconds)
pub const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 10;

// ----------------------------------------------------------------------------
// Network & Protocol
// ----------------------------------------------------------------------------

/// Default listen address for the HTTP API
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:3000";

/// Maximum accepted request body on the wire (bytes)
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

/// Maximum body size after gzip decoding (bytes)
pub const DEFAULT_MAX_DECOMPRESSED_BYTES: usize = 8 * 1024 * 1024;

/// Header carrying the hex HMAC-SHA256 of the request body
pub const SIGNATURE_HEADER: &str = "x-agent-signature";

/// Length of a hex-encoded HMAC-SHA256 digest
pub const SIGNATURE_HEX_LEN: usize = 64;

/// First message written to every live stream
pub const CONNECTED_HANDSHAKE: &str = r#"{"status":"connected"}"#;

/// Separator used in the canonical `host:collector` scope key
pub const SCOPE_KEY_SEPARATOR: char = ':';

// ----------------------------------------------------------------------------
// Configuration Sources
// ----------------------------------------------------------------------------

/// Prefix for environment overrides (`MASSAFFECT_AUTH__SECRET`, ...)
pub const ENV_PREFIX: &str = "MASSAFFECT_";

/// Pre-prefix variable still honoured for the shared secret
pub const LEGACY_SECRET_ENV: &str = "AGENT_SECRET";

/// Default configuration file
pub const DEFAULT_CONFIG_PATH: &str = "massaffect.toml";

/// Default cold-store location
pub const DEFAULT_COLD_STORE_URL: &str = "sqlite://massaffect.db";

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// The data that flows through the engine: who sent it (Agent), where it is
// routed (Scope) and what it carries (Event).
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Agent - An Authenticated Producer
// ----------------------------------------------------------------------------

/// A remote producer of events, identified by its source address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Agent {
    /// Normalized source address the agent connected from
    pub address: IpAddr,
    /// Hostname the address maps to in the agent table
    pub host: String,
}

impl Agent {
    pub fn new(address: IpAddr, host: impl Into<String>) -> Self {
        Self {
            address,
            host: host.into(),
        }
    }
}

impl Display for Agent {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.host, self.address)
    }
}

// ----------------------------------------------------------------------------
// 3.2 Scope - Routing Unit for History and Broadcast
// ----------------------------------------------------------------------------

/// A concrete `(host, collector)` pair.
///
/// Kept as two fields so that a `:` inside a host or collector name can never
/// alias another scope; the joined form only exists at the edges.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopeKey {
    pub host: String,
    pub collector: String,
}

impl ScopeKey {
    pub fn new(host: impl Into<String>, collector: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            collector: collector.into(),
        }
    }

    /// Canonical `host:collector` form.
    pub fn canonical(&self) -> String {
        format!("{}{}{}", self.host, SCOPE_KEY_SEPARATOR, self.collector)
    }
}

impl Display for ScopeKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.host, SCOPE_KEY_SEPARATOR, self.collector)
    }
}

/// Where an event is routed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Scope {
    /// Every event from every agent. Broadcast only, never stored.
    Global,
    /// Exactly one host/collector pair
    Specific(ScopeKey),
}

impl Scope {
    pub fn specific(host: impl Into<String>, collector: impl Into<String>) -> Self {
        Scope::Specific(ScopeKey::new(host, collector))
    }

    pub fn is_global(&self) -> bool {
        matches!(self, Scope::Global)
    }

    /// Label used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Scope::Global => "global",
            Scope::Specific(_) => "specific",
        }
    }
}

impl Display for Scope {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Global => write!(f, "*"),
            Scope::Specific(key) => write!(f, "{}", key),
        }
    }
}

// ----------------------------------------------------------------------------
// 3.3 Event Timestamp
// ----------------------------------------------------------------------------

/// The `ts` field as the agent sent it.
///
/// Python agents send integer unix seconds, the PHP hook sends fractional
/// seconds and hand-written producers send RFC 3339 strings. The value is
/// kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventTimestamp {
    Unix(i64),
    Fractional(f64),
    Text(String),
}

impl EventTimestamp {
    fn from_value(value: &JsonValue) -> Option<Self> {
        match value {
            JsonValue::String(s) if !s.is_empty() => Some(EventTimestamp::Text(s.clone())),
            JsonValue::Number(n) => n
                .as_i64()
                .map(EventTimestamp::Unix)
                .or_else(|| n.as_f64().map(EventTimestamp::Fractional)),
            _ => None,
        }
    }
}

impl Display for EventTimestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            EventTimestamp::Unix(secs) => write!(f, "{}", secs),
            EventTimestamp::Fractional(secs) => write!(f, "{}", secs),
            EventTimestamp::Text(s) => write!(f, "{}", s),
        }
    }
}

// ----------------------------------------------------------------------------
// 3.4 Event - A Single Telemetry Record
// ----------------------------------------------------------------------------

/// One metric event. Immutable once validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Name of the collector that produced the event
    pub collector: String,
    /// Producer-side timestamp
    pub ts: EventTimestamp,
    /// Opaque metric tree; only the envelope is validated
    pub metrics: JsonMap<String, JsonValue>,
}

impl Event {
    pub fn new(
        collector: impl Into<String>,
        ts: EventTimestamp,
        metrics: JsonMap<String, JsonValue>,
    ) -> Self {
        Self {
            collector: collector.into(),
            ts,
            metrics,
        }
    }

    /// Validate a decoded JSON value as an event envelope.
    pub fn from_value(value: JsonValue) -> Result<Self, ValidationError> {
        let mut object = match value {
            JsonValue::Object(object) => object,
            _ => return Err(ValidationError::NotAnObject),
        };

        let collector = match object.remove("collector") {
            None | Some(JsonValue::Null) => return Err(ValidationError::missing("collector")),
            Some(JsonValue::String(name)) if !name.is_empty() => name,
            Some(_) => return Err(ValidationError::invalid("collector", "non-empty string")),
        };

        let ts = match object.get("ts") {
            None | Some(JsonValue::Null) => return Err(ValidationError::missing("ts")),
            Some(raw) => EventTimestamp::from_value(raw)
                .ok_or_else(|| ValidationError::invalid("ts", "string or number"))?,
        };

        let metrics = match object.remove("metrics") {
            None | Some(JsonValue::Null) => return Err(ValidationError::missing("metrics")),
            Some(JsonValue::Object(metrics)) => metrics,
            Some(_) => return Err(ValidationError::invalid("metrics", "object")),
        };

        Ok(Self {
            collector,
            ts,
            metrics,
        })
    }

    /// The `metrics.source` field, used by history filters.
    pub fn source(&self) -> Option<&str> {
        self.metrics.get("source").and_then(JsonValue::as_str)
    }

    /// Scope this event lands in when sent by `host`.
    pub fn scope_for(&self, host: &str) -> ScopeKey {
        ScopeKey::new(host, self.collector.clone())
    }
}

// ----------------------------------------------------------------------------
// 3.5 Display Payload
// ----------------------------------------------------------------------------

/// A rendered broadcast message, shared by every subscriber that receives it.
pub type Payload = Arc<str>;

/// Wire form of an event pushed to live viewers.
#[derive(Debug, Serialize)]
struct RenderedEvent<'a> {
    host: &'a str,
    collector: &'a str,
    ts: &'a EventTimestamp,
    metrics: &'a JsonMap<String, JsonValue>,
}

/// Render the payload pushed to viewers for an event from `host`.
pub fn render_payload(host: &str, event: &Event) -> Result<Payload, serde_json::Error> {
    let rendered = RenderedEvent {
        host,
        collector: &event.collector,
        ts: &event.ts,
        metrics: &event.metrics,
    };
    serde_json::to_string(&rendered).map(Payload::from)
}

// ----------------------------------------------------------------------------
// 3.6 Acknowledgement
// ----------------------------------------------------------------------------

/// Outcome of a batch, reported in server logs only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AckResult {
    /// Events appended to history and fanned out
    pub accepted: usize,
    /// Events dropped by envelope validation
    pub dropped: usize,
}

impl AckResult {
    pub fn total(&self) -> usize {
        self.accepted + self.dropped
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// One error enum per subsystem, aggregated by EngineError. HTTP mapping
// lives with the API layer (SECTION 16).
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Engine Errors
// ----------------------------------------------------------------------------

/// The main error type for the MassAffect engine.
/// All subsystem errors can be converted to this type.
#[derive(Error, Debug)]
pub enum EngineError {
    // ---- Configuration Errors ----
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    // ---- Authentication Errors ----
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    // ---- Validation Errors ----
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    // ---- Storage Errors ----
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    // ---- Transport Errors ----
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    // ---- IO Errors ----
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // ---- Metrics Registry ----
    #[error("Metrics error: {0}")]
    Metrics(String),

    // ---- Generic Errors ----
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl EngineError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            EngineError::Config(_) => false,
            EngineError::Auth(_) => true,
            EngineError::Validation(_) => true,
            EngineError::Storage(e) => e.is_recoverable(),
            EngineError::Transport(e) => e.is_recoverable(),
            EngineError::Io(_) => true,
            EngineError::Metrics(_) => false,
            EngineError::Internal(_) => false,
            EngineError::ShuttingDown => false,
        }
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            EngineError::Config(_) => "config",
            EngineError::Auth(_) => "auth",
            EngineError::Validation(_) => "validation",
            EngineError::Storage(_) => "storage",
            EngineError::Transport(_) => "transport",
            EngineError::Io(_) => "io",
            EngineError::Metrics(_) => "metrics",
            EngineError::Internal(_) => "internal",
            EngineError::ShuttingDown => "shutdown",
        }
    }
}

impl From<prometheus::Error> for EngineError {
    fn from(err: prometheus::Error) -> Self {
        EngineError::Metrics(err.to_string())
    }
}

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

    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },

    #[error("Failed to load agent table from {path}: {message}")]
    AgentTable { path: PathBuf, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        ConfigError::MissingField {
            field: field.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        ConfigError::ParseError {
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Authentication Errors
// ----------------------------------------------------------------------------

/// Why a signature was refused. Never echoed to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureRejection {
    /// No signature header present
    Missing,
    /// Provided text is not the length of a hex HMAC-SHA256
    LengthMismatch,
    /// Right length, wrong value
    Mismatch,
}

impl SignatureRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureRejection::Missing => "missing",
            SignatureRejection::LengthMismatch => "length_mismatch",
            SignatureRejection::Mismatch => "mismatch",
        }
    }
}

impl Display for SignatureRejection {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while authenticating an agent request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Forbidden origin: {address}")]
    Forbidden { address: IpAddr },

    #[error("Invalid signature ({reason})")]
    InvalidSignature { reason: SignatureRejection },
}

impl AuthError {
    /// Label for the rejection counter
    pub fn reason(&self) -> &'static str {
        match self {
            AuthError::Forbidden { .. } => "forbidden",
            AuthError::InvalidSignature { reason } => reason.as_str(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.4 Validation Errors
// ----------------------------------------------------------------------------

/// Per-event envelope errors. The event is dropped, the batch continues.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Event is not a JSON object")]
    NotAnObject,

    #[error("Missing field '{field}'")]
    MissingField { field: &'static str },

    #[error("Field '{field}' must be a {expected}")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
    },
}

impl ValidationError {
    pub fn missing(field: &'static str) -> Self {
        ValidationError::MissingField { field }
    }

    pub fn invalid(field: &'static str, expected: &'static str) -> Self {
        ValidationError::InvalidField { field, expected }
    }

    /// Label for the drop counter
    pub fn reason(&self) -> &'static str {
        match self {
            ValidationError::NotAnObject => "not_an_object",
            ValidationError::MissingField { .. } => "missing_field",
            ValidationError::InvalidField { .. } => "invalid_field",
        }
    }
}

// ----------------------------------------------------------------------------
// 4.5 Storage Errors
// ----------------------------------------------------------------------------

/// Errors related to the cold store
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Cold store connection failed: {message}")]
    Connection { message: String },

    #[error("Cold store migration failed: {message}")]
    Migration { message: String },

    #[error("Write failed: {message}")]
    WriteFailed { message: String },

    #[error("Write timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Write queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Serialization failed: {message}")]
    Serialization { message: String },

    #[error("Cold store writer is closed")]
    Closed,
}

impl StorageError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, StorageError::Migration { .. } | StorageError::Closed)
    }

    /// Label for the write outcome counter
    pub fn outcome(&self) -> &'static str {
        match self {
            StorageError::Timeout { .. } => "timeout",
            StorageError::QueueFull { .. } => "dropped",
            StorageError::Closed => "closed",
            _ => "failed",
        }
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::WriteFailed {
            message: err.to_string(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.6 Transport Errors
// ----------------------------------------------------------------------------

/// Errors delivering to live subscribers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Subscriber {subscriber} closed")]
    SubscriberClosed { subscriber: Uuid },

    #[error("Dispatcher is closed")]
    DispatcherClosed,
}

impl TransportError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TransportError::SubscriberClosed { .. })
    }
}

// ----------------------------------------------------------------------------
// 4.7 Result Type Aliases
// ----------------------------------------------------------------------------

/// Standard result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// Configuration management with:
// - TOML file parsing
// - Environment variable overrides
// - Validation
// - Sensible defaults
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the MassAffect engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// HTTP listener settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Agent authentication
    #[serde(default)]
    pub auth: AuthConfig,

    /// In-memory history
    #[serde(default)]
    pub history: HistoryConfig,

    /// Cold storage
    #[serde(default)]
    pub cold_store: ColdStoreConfig,

    /// Viewer API
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Env::raw().only(&[LEGACY_SECRET_ENV]).map(|_| "auth.secret".into()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment
            .extract()
            .map_err(|e| ConfigError::parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        Self::extract(Self::figment(path))
    }

    /// Load configuration, falling back to defaults plus environment when the
    /// file does not exist
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            debug!(target: "massaffect::engine", path = %path.display(), "Config file missing, using defaults");
        }
        Self::extract(Self::figment(path))
    }

    /// Load from string (for testing)
    pub fn from_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.secret.is_empty() {
            return Err(ConfigError::missing_field("auth.secret"));
        }

        if self.history.capacity == 0 {
            return Err(ConfigError::invalid_value(
                "history.capacity",
                "History capacity must be at least 1",
            ));
        }

        self.server
            .address
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::invalid_value("server.address", e.to_string()))?;

        if self.server.max_body_bytes == 0 {
            return Err(ConfigError::invalid_value(
                "server.max_body_bytes",
                "Body limit must be at least 1 byte",
            ));
        }

        if self.server.max_decompressed_bytes < self.server.max_body_bytes {
            return Err(ConfigError::invalid_value(
                "server.max_decompressed_bytes",
                "Decompressed limit cannot be below the body limit",
            ));
        }

        if self.cold_store.enabled {
            if self.cold_store.workers == 0 {
                return Err(ConfigError::invalid_value(
                    "cold_store.workers",
                    "Worker count must be at least 1",
                ));
            }
            if self.cold_store.queue_capacity == 0 {
                return Err(ConfigError::invalid_value(
                    "cold_store.queue_capacity",
                    "Queue capacity must be at least 1",
                ));
            }
            if self.cold_store.database_url.is_empty() {
                return Err(ConfigError::missing_field("cold_store.database_url"));
            }
        }

        for (address, host) in &self.auth.agents {
            parse_agent_entry(address, host).map_err(|message| {
                ConfigError::invalid_value(format!("auth.agents.{}", address), message)
            })?;
        }

        Ok(())
    }

    /// Build the address table from the inline entries and the optional file.
    /// File entries win over inline ones.
    pub fn resolve_agents(&self) -> Result<AgentTable, ConfigError> {
        let mut table = AgentTable::default();

        for (address, host) in &self.auth.agents {
            let ip = parse_agent_entry(address, host).map_err(|message| {
                ConfigError::invalid_value(format!("auth.agents.{}", address), message)
            })?;
            table.insert(ip, host.clone());
        }

        if let Some(path) = &self.auth.agents_file {
            let raw = fs::read_to_string(path).map_err(|e| ConfigError::AgentTable {
                path: path.clone(),
                message: e.to_string(),
            })?;
            let file: AgentFile = toml::from_str(&raw).map_err(|e| ConfigError::AgentTable {
                path: path.clone(),
                message: e.to_string(),
            })?;
            for (address, host) in &file.agents {
                let ip = parse_agent_entry(address, host).map_err(|message| {
                    ConfigError::AgentTable {
                        path: path.clone(),
                        message: format!("{}: {}", address, message),
                    }
                })?;
                table.insert(ip, host.clone());
            }
        }

        Ok(table)
    }

    /// Create a default config file
    pub fn generate_default_config() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        match self.server.sse_keepalive_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// On-disk agent table: `[agents]` mapping address to hostname.
#[derive(Debug, Default, Deserialize)]
struct AgentFile {
    #[serde(default)]
    agents: BTreeMap<String, String>,
}

fn parse_agent_entry(address: &str, host: &str) -> Result<IpAddr, String> {
    if host.trim().is_empty() {
        return Err("hostname must not be empty".into());
    }
    address
        .parse::<IpAddr>()
        .map(normalize_address)
        .map_err(|e| format!("invalid address '{}': {}", address, e))
}

// ----------------------------------------------------------------------------
// 5.2 Server Configuration
// ----------------------------------------------------------------------------

/// HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_bind_address")]
    pub address: String,

    /// Maximum request body on the wire
    #[serde(default = "default_max_body")]
    pub max_body_bytes: usize,

    /// Maximum body after gzip decoding
    #[serde(default = "default_max_decompressed")]
    pub max_decompressed_bytes: usize,

    /// SSE keep-alive interval, 0 disables
    #[serde(default = "default_keepalive")]
    pub sse_keepalive_secs: u64,

    /// Use the left-most X-Forwarded-For address as the source (reverse proxy)
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_bind_address(),
            max_body_bytes: default_max_body(),
            max_decompressed_bytes: default_max_decompressed(),
            sse_keepalive_secs: default_keepalive(),
            trust_forwarded_for: false,
        }
    }
}

fn default_bind_address() -> String {
    DEFAULT_BIND_ADDRESS.into()
}

fn default_max_body() -> usize {
    DEFAULT_MAX_BODY_BYTES
}

fn default_max_decompressed() -> usize {
    DEFAULT_MAX_DECOMPRESSED_BYTES
}

fn default_keepalive() -> u64 {
    DEFAULT_SSE_KEEPALIVE_SECS
}

// ----------------------------------------------------------------------------
// 5.3 Authentication Configuration
// ----------------------------------------------------------------------------

/// Shared secret and the static address table
#[derive(Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HMAC key shared with every agent
    #[serde(default)]
    pub secret: String,

    /// Optional TOML file with an `[agents]` table
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agents_file: Option<PathBuf>,

    /// Inline address → hostname entries
    #[serde(default = "default_agents")]
    pub agents: BTreeMap<String, String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            agents: default_agents(),
            agents_file: None,
        }
    }
}

impl Debug for AuthConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("secret", &"<redacted>")
            .field("agents", &self.agents)
            .field("agents_file", &self.agents_file)
            .finish()
    }
}

fn default_agents() -> BTreeMap<String, String> {
    let mut agents = BTreeMap::new();
    agents.insert("127.0.0.1".into(), "localhost".into());
    agents.insert("::1".into(), "localhost".into());
    agents
}

// ----------------------------------------------------------------------------
// 5.4 History Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Events kept per scope
    #[serde(default = "default_history_capacity")]
    pub capacity: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            capacity: default_history_capacity(),
        }
    }
}

fn default_history_capacity() -> usize {
    DEFAULT_HISTORY_CAPACITY
}

// ----------------------------------------------------------------------------
// 5.5 Cold Store Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColdStoreConfig {
    /// Persist events at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// sqlx SQLite URL
    #[serde(default = "default_cold_store_url")]
    pub database_url: String,

    /// Background writer tasks
    #[serde(default = "default_cold_store_workers")]
    pub workers: usize,

    /// Pending records before new ones are dropped
    #[serde(default = "default_cold_store_queue")]
    pub queue_capacity: usize,

    /// Per-insert timeout in milliseconds
    #[serde(default = "default_cold_store_timeout")]
    pub write_timeout_ms: u64,
}

impl Default for ColdStoreConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            database_url: default_cold_store_url(),
            workers: default_cold_store_workers(),
            queue_capacity: default_cold_store_queue(),
            write_timeout_ms: default_cold_store_timeout(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_cold_store_url() -> String {
    DEFAULT_COLD_STORE_URL.into()
}

fn default_cold_store_workers() -> usize {
    DEFAULT_COLD_STORE_WORKERS
}

fn default_cold_store_queue() -> usize {
    DEFAULT_COLD_STORE_QUEUE_CAPACITY
}

fn default_cold_store_timeout() -> u64 {
    DEFAULT_COLD_STORE_WRITE_TIMEOUT_MS
}

// ----------------------------------------------------------------------------
// 5.6 API Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Apply the agent origin check to viewer routes as well
    #[serde(default)]
    pub restrict_viewers: bool,
}

// ----------------------------------------------------------------------------
// 5.7 Logging Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub format: String,

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
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================

// ----------------------------------------------------------------------------
// 6.1 Log Level Management
// ----------------------------------------------------------------------------

/// Log levels for the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }

    /// Parse from string, defaulting to info
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

// ----------------------------------------------------------------------------
// 6.2 Logger Initialization
// ----------------------------------------------------------------------------

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> EngineResult<()> {
    let level = LogLevel::parse(&config.level).to_tracing_level();
    let level_filter = tracing::level_filters::LevelFilter::from_level(level);

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_ids(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| EngineError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        "compact" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .compact()
                    .with_ansi(config.colors)
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| EngineError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        _ => {
            // Pretty format (default)
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| EngineError::Internal(format!("Failed to set logger: {}", e)))?;
        }
    }

    info!(
        target: "massaffect::engine",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ============================================================================
// SECTION 7: TESTS
// ============================================================================


// ============================================================================
// SECTION 8: AGENT AUTHENTICATION
// ============================================================================
// Two gates, in order:
// - Origin: the source address must be in the static agent table
// - Authenticity: HMAC-SHA256 of the exact received bytes
// ============================================================================

type HmacSha256 = Hmac<Sha256>;

// ----------------------------------------------------------------------------
// 8.1 Agent Table
// ----------------------------------------------------------------------------

/// Static address → hostname table, fixed at startup.
#[derive(Debug, Clone, Default)]
pub struct AgentTable {
    entries: HashMap<IpAddr, String>,
}

impl AgentTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry. The address is normalized first.
    pub fn insert(&mut self, address: IpAddr, host: impl Into<String>) {
        self.entries.insert(normalize_address(address), host.into());
    }

    pub fn resolve(&self, address: IpAddr) -> Option<&str> {
        self.entries.get(&normalize_address(address)).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&IpAddr, &String)> {
        self.entries.iter()
    }
}

impl<S: Into<String>> FromIterator<(IpAddr, S)> for AgentTable {
    fn from_iter<I: IntoIterator<Item = (IpAddr, S)>>(iter: I) -> Self {
        let mut table = AgentTable::new();
        for (address, host) in iter {
            table.insert(address, host);
        }
        table
    }
}

/// Collapse IPv4-mapped IPv6 (`::ffff:a.b.c.d`) to plain IPv4.
pub fn normalize_address(address: IpAddr) -> IpAddr {
    match address {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(address),
        v4 => v4,
    }
}

// ----------------------------------------------------------------------------
// 8.2 Signatures
// ----------------------------------------------------------------------------

fn keyed_mac(secret: &[u8]) -> HmacSha256 {
    HmacSha256::new_from_slice(secret)
        .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"))
}

/// Lowercase hex HMAC-SHA256 of `body`, as an agent sends it.
pub fn sign_body(secret: &[u8], body: &[u8]) -> String {
    let mut mac = keyed_mac(secret);
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Check `provided` against the HMAC of the exact bytes received.
///
/// The length check short-circuits; the value comparison runs in constant
/// time over the hex text. No case folding.
pub fn verify_signature(body: &[u8], provided: Option<&str>, secret: &[u8]) -> Result<(), AuthError> {
    let provided = provided.ok_or(AuthError::InvalidSignature {
        reason: SignatureRejection::Missing,
    })?;

    if provided.len() != SIGNATURE_HEX_LEN {
        return Err(AuthError::InvalidSignature {
            reason: SignatureRejection::LengthMismatch,
        });
    }

    let expected = sign_body(secret, body);
    if bool::from(expected.as_bytes().ct_eq(provided.as_bytes())) {
        Ok(())
    } else {
        Err(AuthError::InvalidSignature {
            reason: SignatureRejection::Mismatch,
        })
    }
}

// ----------------------------------------------------------------------------
// 8.3 Authenticator
// ----------------------------------------------------------------------------

/// Holds the agent table and the shared secret.
#[derive(Clone)]
pub struct AgentAuthenticator {
    table: Arc<AgentTable>,
    secret: Arc<[u8]>,
}

impl AgentAuthenticator {
    pub fn new(table: AgentTable, secret: impl AsRef<[u8]>) -> Self {
        Self {
            table: Arc::new(table),
            secret: Arc::from(secret.as_ref()),
        }
    }

    /// Resolve the source address to a known agent.
    pub fn verify_origin(&self, address: IpAddr) -> Result<Agent, AuthError> {
        let address = normalize_address(address);
        match self.table.resolve(address) {
            Some(host) => {
                trace!(target: "massaffect::auth", %address, host, "Origin accepted");
                Ok(Agent::new(address, host))
            }
            None => {
                warn!(target: "massaffect::auth", %address, "Rejected unknown origin");
                Err(AuthError::Forbidden { address })
            }
        }
    }

    pub fn verify_signature(&self, body: &[u8], provided: Option<&str>) -> Result<(), AuthError> {
        verify_signature(body, provided, &self.secret).map_err(|err| {
            warn!(target: "massaffect::auth", reason = err.reason(), "Rejected signature");
            err
        })
    }

    pub fn sign(&self, body: &[u8]) -> String {
        sign_body(&self.secret, body)
    }

    pub fn agents(&self) -> &AgentTable {
        &self.table
    }
}

impl Debug for AgentAuthenticator {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentAuthenticator")
            .field("agents", &self.table.len())
            .field("secret", &"<redacted>")
            .finish()
    }
}

// ============================================================================
// SECTION 9: HISTORY STORE
// ============================================================================
// Bounded most-recent-first log per (host, collector), plus the collector
// registry used for discovery. Sharded map: appends to different scopes do
// not contend, appends to one scope are exclusive.
// ============================================================================

// ----------------------------------------------------------------------------
// 9.1 Query Filter
// ----------------------------------------------------------------------------

/// Selection applied to a history read. Filtering happens before paging.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct HistoryFilter {
    /// Substring matched against `metrics.source`
    #[serde(default)]
    pub source: Option<String>,
    /// Case-insensitive source match
    #[serde(default)]
    pub ignore_case: bool,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl HistoryFilter {
    fn matches(&self, event: &Event) -> bool {
        let needle = match self.source.as_deref() {
            None | Some("") => return true,
            Some(needle) => needle,
        };
        let Some(source) = event.source() else {
            return false;
        };
        if self.ignore_case {
            source.to_lowercase().contains(&needle.to_lowercase())
        } else {
            source.contains(needle)
        }
    }
}

// ----------------------------------------------------------------------------
// 9.2 Store
// ----------------------------------------------------------------------------

/// In-memory live tier.
#[derive(Debug)]
pub struct HistoryStore {
    logs: DashMap<ScopeKey, VecDeque<Arc<Event>>>,
    collectors: DashMap<String, BTreeSet<String>>,
    capacity: usize,
}

impl HistoryStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            logs: DashMap::new(),
            collectors: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Push to the front of the scope's log, evicting the oldest entries past
    /// capacity. Returns how many were evicted.
    pub fn append(&self, scope: &ScopeKey, event: Arc<Event>) -> usize {
        let mut log = self
            .logs
            .entry(scope.clone())
            .or_insert_with(|| VecDeque::with_capacity(self.capacity.min(64)));
        log.push_front(event);

        let evicted = log.len().saturating_sub(self.capacity);
        log.truncate(self.capacity);
        if evicted > 0 {
            trace!(target: "massaffect::history", scope = %scope, evicted, "Evicted history entries");
        }
        evicted
    }

    /// Most-recent-first slice. Unknown scopes read as empty.
    pub fn read(&self, scope: &ScopeKey, offset: usize, limit: usize) -> Vec<Arc<Event>> {
        self.logs
            .get(scope)
            .map(|log| log.iter().skip(offset).take(limit).cloned().collect())
            .unwrap_or_default()
    }

    pub fn query(&self, scope: &ScopeKey, filter: &HistoryFilter) -> Vec<Arc<Event>> {
        let limit = filter.limit.unwrap_or(self.capacity);
        self.logs
            .get(scope)
            .map(|log| {
                log.iter()
                    .filter(|event| filter.matches(event))
                    .skip(filter.offset)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn latest(&self, scope: &ScopeKey) -> Option<Arc<Event>> {
        self.logs.get(scope).and_then(|log| log.front().cloned())
    }

    pub fn len(&self, scope: &ScopeKey) -> usize {
        self.logs.get(scope).map(|log| log.len()).unwrap_or(0)
    }

    pub fn scope_count(&self) -> usize {
        self.logs.len()
    }

    // ---- Collector Registry ----

    /// Record that `host` reports through `collector`. Returns true the first
    /// time the pair is seen.
    pub fn register_collector(&self, host: &str, collector: &str) -> bool {
        if let Some(known) = self.collectors.get(host) {
            if known.contains(collector) {
                return false;
            }
        }
        let added = self
            .collectors
            .entry(host.to_string())
            .or_default()
            .insert(collector.to_string());
        if added {
            debug!(target: "massaffect::history", host, collector, "Registered collector");
        }
        added
    }

    /// Every host that has reported, sorted.
    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.collectors.iter().map(|entry| entry.key().clone()).collect();
        hosts.sort();
        hosts
    }

    /// Collectors seen for `host`, sorted.
    pub fn collectors(&self, host: &str) -> Vec<String> {
        self.collectors
            .get(host)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn registry(&self) -> BTreeMap<String, Vec<String>> {
        self.collectors
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().iter().cloned().collect()))
            .collect()
    }
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

// ============================================================================
// SECTION 10: AUTH & HISTORY TESTS
// ============================================================================


// ============================================================================
// SECTION 11: ENGINE METRICS
// ============================================================================
// Prometheus registry for the engine's own behaviour, exposed at /metrics.
// ============================================================================

/// Self-monitoring counters.
pub struct EngineMetrics {
    registry: PrometheusRegistry,
    pub events_accepted: IntCounter,
    pub events_dropped: IntCounterVec,
    pub auth_rejections: IntCounterVec,
    pub cold_store_writes: IntCounterVec,
    pub broadcast_deliveries: IntCounterVec,
    pub transport_errors: IntCounter,
    pub history_evictions: IntCounter,
    pub subscribers: IntGauge,
}

impl EngineMetrics {
    pub fn new() -> EngineResult<Self> {
        let registry = PrometheusRegistry::new_custom(Some("massaffect".into()), None)?;

        let events_accepted = IntCounter::with_opts(Opts::new(
            "events_accepted_total",
            "Events appended to history and broadcast",
        ))?;
        let events_dropped = IntCounterVec::new(
            Opts::new("events_dropped_total", "Events dropped by envelope validation"),
            &["reason"],
        )?;
        let auth_rejections = IntCounterVec::new(
            Opts::new("auth_rejections_total", "Rejected agent requests"),
            &["reason"],
        )?;
        let cold_store_writes = IntCounterVec::new(
            Opts::new("cold_store_writes_total", "Cold store writes by outcome"),
            &["outcome"],
        )?;
        let broadcast_deliveries = IntCounterVec::new(
            Opts::new("broadcast_deliveries_total", "Payloads delivered to live subscribers"),
            &["scope"],
        )?;
        let transport_errors = IntCounter::with_opts(Opts::new(
            "transport_errors_total",
            "Deliveries to subscribers that had already gone away",
        ))?;
        let history_evictions = IntCounter::with_opts(Opts::new(
            "history_evictions_total",
            "History entries evicted at capacity",
        ))?;
        let subscribers = IntGauge::with_opts(Opts::new("subscribers", "Live subscribers"))?;

        registry.register(Box::new(events_accepted.clone()))?;
        registry.register(Box::new(events_dropped.clone()))?;
        registry.register(Box::new(auth_rejections.clone()))?;
        registry.register(Box::new(cold_store_writes.clone()))?;
        registry.register(Box::new(broadcast_deliveries.clone()))?;
        registry.register(Box::new(transport_errors.clone()))?;
        registry.register(Box::new(history_evictions.clone()))?;
        registry.register(Box::new(subscribers.clone()))?;

        Ok(Self {
            registry,
            events_accepted,
            events_dropped,
            auth_rejections,
            cold_store_writes,
            broadcast_deliveries,
            transport_errors,
            history_evictions,
            subscribers,
        })
    }

    /// Prometheus text exposition
    pub fn encode(&self) -> EngineResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| EngineError::Metrics(e.to_string()))
    }
}

impl Debug for EngineMetrics {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineMetrics")
            .field("events_accepted", &self.events_accepted.get())
            .field("subscribers", &self.subscribers.get())
            .finish()
    }
}

// ============================================================================
// SECTION 12: COLD STORE WRITER
// ============================================================================
// Best-effort durable tier:
// - Bounded queue between ingestion and storage, enqueue never blocks
// - Fixed pool of writer tasks, each insert bounded by a timeout
// - Failures are counted and logged, never retried
// ============================================================================

// ----------------------------------------------------------------------------
// 12.1 Cold Record
// ----------------------------------------------------------------------------

/// One row in the cold store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColdRecord {
    pub host: String,
    pub collector: String,
    pub timestamp: String,
    /// Serialized metric tree
    pub metrics: String,
    pub received_at: DateTime<Utc>,
}

impl ColdRecord {
    pub fn from_event(host: &str, event: &Event) -> StorageResult<Self> {
        let metrics = serde_json::to_string(&event.metrics).map_err(|e| StorageError::Serialization {
            message: e.to_string(),
        })?;
        Ok(Self {
            host: host.to_string(),
            collector: event.collector.clone(),
            timestamp: event.ts.to_string(),
            metrics,
            received_at: Utc::now(),
        })
    }
}

// ----------------------------------------------------------------------------
// 12.2 Cold Store Trait
// ----------------------------------------------------------------------------

/// A durable sink for cold records.
#[async_trait]
pub trait ColdStore: Send + Sync + 'static {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Insert a single record.
    async fn insert(&self, record: &ColdRecord) -> StorageResult<()>;
}

// ----------------------------------------------------------------------------
// 12.3 SQLite Backend
// ----------------------------------------------------------------------------

const CREATE_EVENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    host        TEXT NOT NULL,
    collector   TEXT NOT NULL,
    ts          TEXT NOT NULL,
    metrics     TEXT NOT NULL,
    received_at TEXT NOT NULL
)
"#;

const CREATE_EVENTS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_events_scope ON events (host, collector, received_at)";

/// SQLite-backed cold store.
#[derive(Debug, Clone)]
pub struct SqliteColdStore {
    pool: SqlitePool,
}

impl SqliteColdStore {
    /// Open (creating if needed) the database and run migrations.
    pub async fn connect(url: &str) -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| StorageError::Connection {
                message: e.to_string(),
            })?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: e.to_string(),
            })?;

        let store = Self { pool };
        store.migrate().await?;
        info!(target: "massaffect::cold_store", url, "Cold store connected");
        Ok(store)
    }

    /// Private in-memory database, kept on a single connection.
    pub async fn in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(|e| {
            StorageError::Connection {
                message: e.to_string(),
            }
        })?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: e.to_string(),
            })?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> StorageResult<()> {
        for statement in [CREATE_EVENTS_TABLE, CREATE_EVENTS_INDEX] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Migration {
                    message: e.to_string(),
                })?;
        }
        Ok(())
    }

    pub async fn count(&self) -> StorageResult<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl ColdStore for SqliteColdStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn insert(&self, record: &ColdRecord) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO events (host, collector, ts, metrics, received_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.host)
        .bind(&record.collector)
        .bind(&record.timestamp)
        .bind(&record.metrics)
        .bind(record.received_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 12.4 Writer Statistics
// ----------------------------------------------------------------------------

/// Lock-free outcome counters for the writer pool.
#[derive(Debug, Default)]
pub struct WriterStats {
    enqueued: AtomicU64,
    written: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    dropped: AtomicU64,
}

impl WriterStats {
    pub fn snapshot(&self) -> WriterStatsSnapshot {
        WriterStatsSnapshot {
            enqueued: self.enqueued.load(AtomicOrdering::Relaxed),
            written: self.written.load(AtomicOrdering::Relaxed),
            failed: self.failed.load(AtomicOrdering::Relaxed),
            timed_out: self.timed_out.load(AtomicOrdering::Relaxed),
            dropped: self.dropped.load(AtomicOrdering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`WriterStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriterStatsSnapshot {
    pub enqueued: u64,
    pub written: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub dropped: u64,
}

// ----------------------------------------------------------------------------
// 12.5 Writer Pool
// ----------------------------------------------------------------------------

/// Queue plus background workers in front of a [`ColdStore`].
pub struct ColdStoreWriter {
    sender: ArcSwapOption<flume::Sender<ColdRecord>>,
    workers: Mutex<Vec<TokioJoinHandle<()>>>,
    capacity: usize,
    enabled: bool,
    stats: Arc<WriterStats>,
    metrics: Arc<EngineMetrics>,
}

impl ColdStoreWriter {
    /// Start the worker pool. Must be called from within a Tokio runtime.
    pub fn spawn(store: Arc<dyn ColdStore>, config: &ColdStoreConfig, metrics: Arc<EngineMetrics>) -> Self {
        let capacity = config.queue_capacity.max(1);
        let worker_count = config.workers.max(1);
        let write_timeout = Duration::from_millis(config.write_timeout_ms);
        let (sender, receiver) = flume::bounded::<ColdRecord>(capacity);
        let stats = Arc::new(WriterStats::default());

        let workers = (0..worker_count)
            .map(|worker| {
                tokio::spawn(run_writer(
                    worker,
                    Arc::clone(&store),
                    receiver.clone(),
                    write_timeout,
                    Arc::clone(&stats),
                    Arc::clone(&metrics),
                ))
            })
            .collect();

        info!(
            target: "massaffect::cold_store",
            backend = store.name(),
            workers = worker_count,
            queue = capacity,
            timeout_ms = config.write_timeout_ms,
            "Cold store writers started"
        );

        Self {
            sender: ArcSwapOption::from_pointee(sender),
            workers: Mutex::new(workers),
            capacity,
            enabled: true,
            stats,
            metrics,
        }
    }

    /// A writer that discards every record.
    pub fn disabled(metrics: Arc<EngineMetrics>) -> Self {
        info!(target: "massaffect::cold_store", "Cold store disabled");
        Self {
            sender: ArcSwapOption::empty(),
            workers: Mutex::new(Vec::new()),
            capacity: 0,
            enabled: false,
            stats: Arc::new(WriterStats::default()),
            metrics,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Hand a record to the workers without waiting.
    pub fn persist(&self, record: ColdRecord) -> StorageResult<()> {
        if !self.enabled {
            return Ok(());
        }

        let Some(sender) = self.sender.load_full() else {
            return Err(StorageError::Closed);
        };

        match sender.try_send(record) {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, AtomicOrdering::Relaxed);
                Ok(())
            }
            Err(flume::TrySendError::Full(_)) => {
                self.stats.dropped.fetch_add(1, AtomicOrdering::Relaxed);
                self.metrics
                    .cold_store_writes
                    .with_label_values(&["dropped"])
                    .inc();
                Err(StorageError::QueueFull {
                    capacity: self.capacity,
                })
            }
            Err(flume::TrySendError::Disconnected(_)) => Err(StorageError::Closed),
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.sender.load_full().map(|sender| sender.len()).unwrap_or(0)
    }

    pub fn stats(&self) -> WriterStatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop accepting records and abort the workers. Pending records are lost.
    pub fn shutdown(&self) {
        let pending = self.queue_depth();
        self.sender.store(None);
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in &workers {
            worker.abort();
        }
        if self.enabled {
            info!(
                target: "massaffect::cold_store",
                pending,
                workers = workers.len(),
                "Cold store writers stopped"
            );
        }
    }
}

impl Debug for ColdStoreWriter {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ColdStoreWriter")
            .field("enabled", &self.enabled)
            .field("capacity", &self.capacity)
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

async fn run_writer(
    worker: usize,
    store: Arc<dyn ColdStore>,
    receiver: flume::Receiver<ColdRecord>,
    write_timeout: Duration,
    stats: Arc<WriterStats>,
    metrics: Arc<EngineMetrics>,
) {
    while let Ok(record) = receiver.recv_async().await {
        let outcome = match timeout(write_timeout, store.insert(&record)).await {
            Ok(Ok(())) => {
                stats.written.fetch_add(1, AtomicOrdering::Relaxed);
                "written"
            }
            Ok(Err(err)) => {
                stats.failed.fetch_add(1, AtomicOrdering::Relaxed);
                warn!(
                    target: "massaffect::cold_store",
                    worker,
                    host = %record.host,
                    collector = %record.collector,
                    error = %err,
                    "Cold store write failed"
                );
                err.outcome()
            }
            Err(_) => {
                stats.timed_out.fetch_add(1, AtomicOrdering::Relaxed);
                let err = StorageError::Timeout {
                    timeout_ms: write_timeout.as_millis() as u64,
                };
                warn!(
                    target: "massaffect::cold_store",
                    worker,
                    host = %record.host,
                    collector = %record.collector,
                    error = %err,
                    "Cold store write timed out"
                );
                err.outcome()
            }
        };
        metrics.cold_store_writes.with_label_values(&[outcome]).inc();
    }
    debug!(target: "massaffect::cold_store", worker, "Cold store writer exiting");
}

// ============================================================================
// SECTION 13: SUBSCRIPTION REGISTRY & DISPATCHER
// ============================================================================
// Live viewers, one scope each. Broadcast snapshots the scope's senders
// under the read lock and sends outside it. Channels are unbounded and
// nothing is kept for absent subscribers.
// ============================================================================

// ----------------------------------------------------------------------------
// 13.1 Subscriber State
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SubscriberState {
    Connecting,
    Open,
    /// Terminal
    Closed,
}

struct SubscriberSlot {
    sender: UnboundedSender<Payload>,
    closed: Arc<AtomicBool>,
}

// ----------------------------------------------------------------------------
// 13.2 Registry
// ----------------------------------------------------------------------------

struct DispatcherInner {
    scopes: RwLock<HashMap<Scope, HashMap<Uuid, SubscriberSlot>>>,
    closed: AtomicBool,
    metrics: Arc<EngineMetrics>,
}

impl DispatcherInner {
    fn remove(&self, scope: &Scope, id: Uuid) -> bool {
        let mut scopes = self.scopes.write();
        let Some(set) = scopes.get_mut(scope) else {
            return false;
        };
        let removed = match set.remove(&id) {
            Some(slot) => {
                slot.closed.store(true, AtomicOrdering::Release);
                true
            }
            None => false,
        };
        let now_empty = set.is_empty();
        if now_empty {
            scopes.remove(scope);
        }
        drop(scopes);

        if removed {
            self.metrics.subscribers.dec();
            debug!(target: "massaffect::dispatch", subscriber = %id, scope = %scope, "Subscriber removed");
        }
        removed
    }
}

/// Fan-out hub for live viewers. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    pub fn new(metrics: Arc<EngineMetrics>) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                scopes: RwLock::new(HashMap::new()),
                closed: AtomicBool::new(false),
                metrics,
            }),
        }
    }

    /// Register a new subscriber for `scope`.
    pub fn subscribe(&self, scope: Scope) -> Result<SubscriberHandle, TransportError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let mut handle = SubscriberHandle {
            id: Uuid::new_v4(),
            scope,
            state: SubscriberState::Connecting,
            receiver,
            closed: Arc::clone(&closed),
            registry: Arc::downgrade(&self.inner),
        };

        {
            let mut scopes = self.inner.scopes.write();
            if self.inner.closed.load(AtomicOrdering::Acquire) {
                handle.state = SubscriberState::Closed;
                return Err(TransportError::DispatcherClosed);
            }
            scopes
                .entry(handle.scope.clone())
                .or_default()
                .insert(handle.id, SubscriberSlot { sender, closed });
        }

        self.inner.metrics.subscribers.inc();
        handle.state = SubscriberState::Open;
        debug!(target: "massaffect::dispatch", subscriber = %handle.id, scope = %handle.scope, "Subscriber attached");
        Ok(handle)
    }

    /// Remove a subscriber by id. Idempotent.
    pub fn unsubscribe(&self, id: Uuid) -> bool {
        let scope = {
            let scopes = self.inner.scopes.read();
            scopes
                .iter()
                .find(|(_, set)| set.contains_key(&id))
                .map(|(scope, _)| scope.clone())
        };
        match scope {
            Some(scope) => self.inner.remove(&scope, id),
            None => false,
        }
    }

    /// Deliver `payload` to every subscriber of `scope` at call time.
    /// Returns the number of successful deliveries.
    pub fn broadcast(&self, scope: &Scope, payload: Payload) -> usize {
        let targets: Vec<(Uuid, UnboundedSender<Payload>)> = {
            let scopes = self.inner.scopes.read();
            match scopes.get(scope) {
                Some(set) => set
                    .iter()
                    .map(|(id, slot)| (*id, slot.sender.clone()))
                    .collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        let mut gone = Vec::new();
        for (id, sender) in targets {
            match sender.send(Arc::clone(&payload)) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    let err = TransportError::SubscriberClosed { subscriber: id };
                    debug!(target: "massaffect::dispatch", scope = %scope, error = %err, "Delivery failed");
                    self.inner.metrics.transport_errors.inc();
                    gone.push(id);
                }
            }
        }

        for id in gone {
            self.inner.remove(scope, id);
        }

        self.inner
            .metrics
            .broadcast_deliveries
            .with_label_values(&[scope.kind()])
            .inc_by(delivered as u64);
        delivered
    }

    pub fn subscriber_count(&self, scope: &Scope) -> usize {
        self.inner.scopes.read().get(scope).map(HashMap::len).unwrap_or(0)
    }

    pub fn total_subscribers(&self) -> usize {
        self.inner.scopes.read().values().map(HashMap::len).sum()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(AtomicOrdering::Acquire)
    }

    /// Close every channel and refuse new subscribers.
    pub fn close_all(&self) -> usize {
        let drained = {
            let mut scopes = self.inner.scopes.write();
            self.inner.closed.store(true, AtomicOrdering::Release);
            std::mem::take(&mut *scopes)
        };

        let mut closed = 0;
        for slot in drained.into_values().flat_map(HashMap::into_values) {
            slot.closed.store(true, AtomicOrdering::Release);
            closed += 1;
        }
        self.inner.metrics.subscribers.sub(closed as i64);
        info!(target: "massaffect::dispatch", closed, "Closed all subscribers");
        closed
    }
}

impl Debug for Dispatcher {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("subscribers", &self.total_subscribers())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// 13.3 Subscriber Handle
// ----------------------------------------------------------------------------

/// The viewer's end of a subscription. Dropping it unsubscribes.
pub struct SubscriberHandle {
    id: Uuid,
    scope: Scope,
    state: SubscriberState,
    receiver: UnboundedReceiver<Payload>,
    closed: Arc<AtomicBool>,
    registry: Weak<DispatcherInner>,
}

impl SubscriberHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn state(&self) -> SubscriberState {
        self.state
    }

    fn closed_remotely(&self) -> bool {
        self.closed.load(AtomicOrdering::Acquire)
    }

    /// Next payload, or `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<Payload> {
        if self.state == SubscriberState::Closed {
            return None;
        }
        match self.receiver.recv().await {
            Some(payload) if !self.closed_remotely() => Some(payload),
            _ => {
                self.close();
                None
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<Payload> {
        if self.state == SubscriberState::Closed {
            return None;
        }
        if self.closed_remotely() {
            self.close();
            return None;
        }
        self.receiver.try_recv().ok()
    }

    /// Close and deregister. Queued payloads are discarded.
    pub fn close(&mut self) {
        if self.state == SubscriberState::Closed {
            return;
        }
        self.state = SubscriberState::Closed;
        self.closed.store(true, AtomicOrdering::Release);
        self.receiver.close();
        while self.receiver.try_recv().is_ok() {}
        if let Some(inner) = self.registry.upgrade() {
            inner.remove(&self.scope, self.id);
        }
    }

    /// Turn the handle into a stream of payloads.
    pub fn into_stream(self) -> impl Stream<Item = Payload> + Send + 'static {
        stream::unfold(self, |mut handle| async move {
            handle.recv().await.map(|payload| (payload, handle))
        })
    }
}

impl Drop for SubscriberHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl Debug for SubscriberHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberHandle")
            .field("id", &self.id)
            .field("scope", &self.scope)
            .field("state", &self.state)
            .finish()
    }
}

// ============================================================================
// SECTION 14: INGESTION PIPELINE
// ============================================================================
// Per event, in receipt order:
//   validate → history append → collector registration → cold enqueue →
//   broadcast(Global) → broadcast(Specific)
// Nothing here waits on the cold store.
// ============================================================================

/// Decode a request body into the list of raw events it carries.
/// A bare object is treated as a batch of one.
pub fn parse_batch(body: &[u8]) -> Result<Vec<JsonValue>, serde_json::Error> {
    match serde_json::from_slice::<JsonValue>(body)? {
        JsonValue::Array(events) => Ok(events),
        single => Ok(vec![single]),
    }
}

/// Orchestrates the live tier, the cold tier and fan-out.
#[derive(Debug, Clone)]
pub struct IngestionPipeline {
    history: Arc<HistoryStore>,
    cold_store: Arc<ColdStoreWriter>,
    dispatcher: Dispatcher,
    metrics: Arc<EngineMetrics>,
}

impl IngestionPipeline {
    pub fn new(
        history: Arc<HistoryStore>,
        cold_store: Arc<ColdStoreWriter>,
        dispatcher: Dispatcher,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            history,
            cold_store,
            dispatcher,
            metrics,
        }
    }

    /// Accept a batch from an authenticated agent.
    ///
    /// Invalid events are dropped and counted; the rest are processed one at
    /// a time so per-scope order matches receipt order. Returns once every
    /// valid event is in history.
    pub fn accept_batch(&self, agent: &Agent, events: Vec<JsonValue>) -> AckResult {
        let mut ack = AckResult::default();

        for raw in events {
            let event = match Event::from_value(raw) {
                Ok(event) => Arc::new(event),
                Err(err) => {
                    debug!(
                        target: "massaffect::ingest",
                        host = %agent.host,
                        reason = err.reason(),
                        error = %err,
                        "Dropped invalid event"
                    );
                    self.metrics
                        .events_dropped
                        .with_label_values(&[err.reason()])
                        .inc();
                    ack.dropped += 1;
                    continue;
                }
            };

            let scope = event.scope_for(&agent.host);
            let evicted = self.history.append(&scope, Arc::clone(&event));
            if evicted > 0 {
                self.metrics.history_evictions.inc_by(evicted as u64);
            }
            self.history.register_collector(&agent.host, &event.collector);

            if self.cold_store.is_enabled() {
                let enqueued = ColdRecord::from_event(&agent.host, &event)
                    .and_then(|record| self.cold_store.persist(record));
                if let Err(err) = enqueued {
                    warn!(
                        target: "massaffect::ingest",
                        scope = %scope,
                        error = %err,
                        "Cold store enqueue failed"
                    );
                }
            }

            match render_payload(&agent.host, &event) {
                Ok(payload) => {
                    self.dispatcher.broadcast(&Scope::Global, Arc::clone(&payload));
                    self.dispatcher.broadcast(&Scope::Specific(scope), payload);
                }
                Err(err) => {
                    warn!(target: "massaffect::ingest", error = %err, "Failed to render payload");
                }
            }

            self.metrics.events_accepted.inc();
            ack.accepted += 1;
        }

        debug!(
            target: "massaffect::ingest",
            host = %agent.host,
            accepted = ack.accepted,
            dropped = ack.dropped,
            "Batch accepted"
        );
        ack
    }

    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.history
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn cold_store(&self) -> &Arc<ColdStoreWriter> {
        &self.cold_store
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }
}

// ============================================================================
// SECTION 15: PIPELINE, STORAGE & DISPATCH TESTS
// ============================================================================

#[cfg(test)]
mod pipeline_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Keeps every record in memory.
    #[derive(Default)]
    struct RecordingStore {
        records: Mutex<Vec<ColdRecord>>,
    }

    #[async_trait]
    impl ColdStore for RecordingStore {
        fn name(&self) -> &str {
            "recording"
        }

        async fn insert(&self, record: &ColdRecord) -> StorageResult<()> {
            self.records.lock().push(record.clone());
            Ok(())
        }
    }

    /// Fails every write.
    struct FailingStore;

    #[async_trait]
    impl ColdStore for FailingStore {
        fn name(&self) -> &str {
            "failing"
        }

        async fn insert(&self, _record: &ColdRecord) -> StorageResult<()> {
            Err(StorageError::WriteFailed {
                message: "constraint violated".into(),
            })
        }
    }

    /// Never completes a write.
    struct StalledStore;

    #[async_trait]
    impl ColdStore for StalledStore {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn insert(&self, _record: &ColdRecord) -> StorageResult<()> {
            futures::future::pending::<()>().await;
            Ok(())
        }
    }

    fn metrics() -> Arc<EngineMetrics> {
        Arc::new(EngineMetrics::new().unwrap())
    }

    fn cold_config(workers: usize, queue_capacity: usize, write_timeout_ms: u64) -> ColdStoreConfig {
        ColdStoreConfig {
            workers,
            queue_capacity,
            write_timeout_ms,
            ..ColdStoreConfig::default()
        }
    }

    fn pipeline_with(writer: ColdStoreWriter, metrics: Arc<EngineMetrics>) -> IngestionPipeline {
        IngestionPipeline::new(
            Arc::new(HistoryStore::new(100)),
            Arc::new(writer),
            Dispatcher::new(Arc::clone(&metrics)),
            metrics,
        )
    }

    fn agent() -> Agent {
        Agent::new("104.13.36.111".parse().unwrap(), "xeno")
    }

    fn valid(collector: &str, n: i64) -> JsonValue {
        json!({"collector": collector, "ts": n, "metrics": {"n": n}})
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_parse_batch_shapes() {
        assert_eq!(parse_batch(br#"[{"a":1},{"b":2}]"#).unwrap().len(), 2);
        assert_eq!(parse_batch(br#"{"a":1}"#).unwrap().len(), 1);
        assert!(parse_batch(b"[]").unwrap().is_empty());
        assert!(parse_batch(b"not json").is_err());
    }

    #[tokio::test]
    async fn test_malformed_events_are_dropped() {
        let metrics = metrics();
        let pipeline = pipeline_with(ColdStoreWriter::disabled(Arc::clone(&metrics)), Arc::clone(&metrics));

        let ack = pipeline.accept_batch(
            &agent(),
            vec![
                valid("system", 1),
                json!({"collector": "system", "ts": 2}),
                valid("system", 3),
                json!("garbage"),
                valid("nginx", 4),
            ],
        );

        assert_eq!(ack, AckResult { accepted: 3, dropped: 2 });
        let system = ScopeKey::new("xeno", "system");
        assert_eq!(pipeline.history().len(&system), 2);
        assert_eq!(pipeline.history().len(&ScopeKey::new("xeno", "nginx")), 1);
        assert_eq!(pipeline.history().latest(&system).unwrap().ts, EventTimestamp::Unix(3));
        assert_eq!(pipeline.history().collectors("xeno"), vec!["nginx".to_string(), "system".to_string()]);
        assert_eq!(metrics.events_accepted.get(), 3);
        assert_eq!(metrics.events_dropped.with_label_values(&["missing_field"]).get(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_global_and_exact_scope() {
        let metrics = metrics();
        let pipeline = pipeline_with(ColdStoreWriter::disabled(Arc::clone(&metrics)), metrics);
        let dispatcher = pipeline.dispatcher().clone();

        let mut global = dispatcher.subscribe(Scope::Global).unwrap();
        let mut system = dispatcher.subscribe(Scope::specific("xeno", "system")).unwrap();
        let mut other_host = dispatcher.subscribe(Scope::specific("alpha", "system")).unwrap();

        pipeline.accept_batch(&agent(), vec![valid("system", 1), valid("nginx", 2)]);

        let first: JsonValue = serde_json::from_str(&global.recv().await.unwrap()).unwrap();
        let second: JsonValue = serde_json::from_str(&global.recv().await.unwrap()).unwrap();
        assert_eq!(first["collector"], "system");
        assert_eq!(first["host"], "xeno");
        assert_eq!(second["collector"], "nginx");

        let scoped: JsonValue = serde_json::from_str(&system.recv().await.unwrap()).unwrap();
        assert_eq!(scoped["ts"], 1);
        assert!(system.try_recv().is_none());
        assert!(other_host.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_cold_store_receives_records() {
        let metrics = metrics();
        let store = Arc::new(RecordingStore::default());
        let writer = ColdStoreWriter::spawn(store.clone(), &cold_config(2, 16, 1_000), Arc::clone(&metrics));
        let pipeline = pipeline_with(writer, Arc::clone(&metrics));

        pipeline.accept_batch(&agent(), vec![valid("system", 1), valid("system", 2)]);

        wait_for(|| store.records.lock().len() == 2).await;
        let records = store.records.lock().clone();
        assert!(records.iter().all(|r| r.host == "xeno" && r.collector == "system"));
        assert!(records.iter().any(|r| r.timestamp == "1" && r.metrics == r#"{"n":1}"#));

        wait_for(|| pipeline.cold_store().stats().written == 2).await;
        assert_eq!(metrics.cold_store_writes.with_label_values(&["written"]).get(), 2);
    }

    #[tokio::test]
    async fn test_cold_store_failures_do_not_touch_history() {
        let metrics = metrics();
        let writer = ColdStoreWriter::spawn(Arc::new(FailingStore), &cold_config(1, 16, 1_000), Arc::clone(&metrics));
        let pipeline = pipeline_with(writer, Arc::clone(&metrics));

        let ack = pipeline.accept_batch(&agent(), vec![valid("system", 1)]);

        assert_eq!(ack.accepted, 1);
        wait_for(|| pipeline.cold_store().stats().failed == 1).await;
        assert_eq!(pipeline.history().len(&ScopeKey::new("xeno", "system")), 1);
        assert_eq!(metrics.cold_store_writes.with_label_values(&["failed"]).get(), 1);
    }

    #[tokio::test]
    async fn test_cold_store_write_timeout() {
        let metrics = metrics();
        let writer = ColdStoreWriter::spawn(Arc::new(StalledStore), &cold_config(1, 16, 20), Arc::clone(&metrics));

        writer
            .persist(ColdRecord::from_event("xeno", &Event::from_value(valid("system", 1)).unwrap()).unwrap())
            .unwrap();

        wait_for(|| writer.stats().timed_out == 1).await;
        assert_eq!(metrics.cold_store_writes.with_label_values(&["timeout"]).get(), 1);
        writer.shutdown();
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_full_queue_drops_without_blocking() {
        let metrics = metrics();
        let writer = ColdStoreWriter::spawn(Arc::new(StalledStore), &cold_config(1, 1, 60_000), Arc::clone(&metrics));
        let pipeline = pipeline_with(writer, Arc::clone(&metrics));

        let batch: Vec<_> = (0..5).map(|n| valid("system", n)).collect();
        let ack = pipeline.accept_batch(&agent(), batch);

        // The worker has not run yet on this thread: one slot, four drops.
        assert_eq!(ack.accepted, 5);
        assert_eq!(pipeline.history().len(&ScopeKey::new("xeno", "system")), 5);
        assert_eq!(pipeline.cold_store().stats().enqueued, 1);
        assert_eq!(pipeline.cold_store().stats().dropped, 4);
        assert_eq!(metrics.cold_store_writes.with_label_values(&["dropped"]).get(), 4);
        pipeline.cold_store().shutdown();
    }

    #[tokio::test]
    async fn test_writer_shutdown_rejects_new_records() {
        let metrics = metrics();
        let writer = ColdStoreWriter::spawn(Arc::new(RecordingStore::default()), &cold_config(1, 4, 1_000), metrics);
        writer.shutdown();

        let record = ColdRecord::from_event("xeno", &Event::from_value(valid("system", 1)).unwrap()).unwrap();
        assert!(matches!(writer.persist(record), Err(StorageError::Closed)));
    }

    #[tokio::test]
    async fn test_disabled_writer_discards() {
        let writer = ColdStoreWriter::disabled(metrics());
        let record = ColdRecord::from_event("xeno", &Event::from_value(valid("system", 1)).unwrap()).unwrap();

        assert!(!writer.is_enabled());
        assert!(writer.persist(record).is_ok());
        assert_eq!(writer.stats(), WriterStatsSnapshot::default());
    }

    #[tokio::test]
    async fn test_sqlite_cold_store_roundtrip() {
        let store = SqliteColdStore::in_memory().await.unwrap();
        let event = Event::from_value(valid("system", 7)).unwrap();

        store.insert(&ColdRecord::from_event("xeno", &event).unwrap()).await.unwrap();
        store.insert(&ColdRecord::from_event("alpha", &event).unwrap()).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 2);
        let (host, ts, metrics): (String, String, String) =
            sqlx::query_as("SELECT host, ts, metrics FROM events ORDER BY id LIMIT 1")
                .fetch_one(&store.pool)
                .await
                .unwrap();
        assert_eq!(host, "xeno");
        assert_eq!(ts, "7");
        assert_eq!(metrics, r#"{"n":7}"#);
    }

    #[tokio::test]
    async fn test_sqlite_cold_store_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("cold.db").display());

        let store = SqliteColdStore::connect(&url).await.unwrap();
        let event = Event::from_value(valid("system", 1)).unwrap();
        store.insert(&ColdRecord::from_event("xeno", &event).unwrap()).await.unwrap();
        store.close().await;

        let reopened = SqliteColdStore::connect(&url).await.unwrap();
        assert_eq!(reopened.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dispatcher_subscribe_and_drop() {
        let metrics = metrics();
        let dispatcher = Dispatcher::new(Arc::clone(&metrics));
        let scope = Scope::specific("xeno", "system");

        let first = dispatcher.subscribe(scope.clone()).unwrap();
        let mut second = dispatcher.subscribe(scope.clone()).unwrap();
        assert_eq!(first.state(), SubscriberState::Open);
        assert_eq!(dispatcher.subscriber_count(&scope), 2);
        assert_eq!(metrics.subscribers.get(), 2);

        drop(first);
        assert_eq!(dispatcher.subscriber_count(&scope), 1);
        assert_eq!(metrics.subscribers.get(), 1);

        assert_eq!(dispatcher.broadcast(&scope, Payload::from("hello")), 1);
        assert_eq!(second.recv().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_closed_subscriber_does_not_disturb_others() {
        let metrics = metrics();
        let dispatcher = Dispatcher::new(Arc::clone(&metrics));

        let mut alive = dispatcher.subscribe(Scope::Global).unwrap();
        let mut gone = dispatcher.subscribe(Scope::Global).unwrap();
        gone.close();

        assert_eq!(gone.state(), SubscriberState::Closed);
        assert_eq!(dispatcher.broadcast(&Scope::Global, Payload::from("a")), 1);
        assert_eq!(alive.recv().await.as_deref(), Some("a"));
        assert!(gone.recv().await.is_none());
        assert_eq!(dispatcher.total_subscribers(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent_and_discards_queue() {
        let dispatcher = Dispatcher::new(metrics());
        let mut handle = dispatcher.subscribe(Scope::Global).unwrap();

        dispatcher.broadcast(&Scope::Global, Payload::from("queued"));
        assert!(dispatcher.unsubscribe(handle.id()));
        assert!(!dispatcher.unsubscribe(handle.id()));

        assert!(handle.recv().await.is_none());
        assert_eq!(handle.state(), SubscriberState::Closed);
        assert_eq!(dispatcher.broadcast(&Scope::Global, Payload::from("late")), 0);
    }

    #[tokio::test]
    async fn test_global_and_specific_sets_are_distinct() {
        let dispatcher = Dispatcher::new(metrics());
        let _global = dispatcher.subscribe(Scope::Global).unwrap();
        let _scoped = dispatcher.subscribe(Scope::specific("xeno", "system")).unwrap();

        assert_eq!(dispatcher.subscriber_count(&Scope::Global), 1);
        assert_eq!(dispatcher.broadcast(&Scope::specific("xeno", "nginx"), Payload::from("x")), 0);
        assert_eq!(dispatcher.broadcast(&Scope::specific("xeno", "system"), Payload::from("x")), 1);
    }

    #[tokio::test]
    async fn test_close_all_ends_streams() {
        let metrics = metrics();
        let dispatcher = Dispatcher::new(Arc::clone(&metrics));
        let stream = dispatcher.subscribe(Scope::Global).unwrap().into_stream();
        let mut handle = dispatcher.subscribe(Scope::specific("xeno", "system")).unwrap();

        dispatcher.broadcast(&Scope::Global, Payload::from("before"));
        assert_eq!(dispatcher.close_all(), 2);

        let remaining: Vec<Payload> = stream.collect().await;
        assert!(remaining.is_empty());
        assert!(handle.recv().await.is_none());
        assert_eq!(metrics.subscribers.get(), 0);
        assert!(matches!(
            dispatcher.subscribe(Scope::Global),
            Err(TransportError::DispatcherClosed)
        ));
    }

    #[test]
    fn test_metrics_encode() {
        let metrics = EngineMetrics::new().unwrap();
        metrics.events_accepted.inc();
        metrics.auth_rejections.with_label_values(&["forbidden"]).inc();

        let text = metrics.encode().unwrap();
        assert!(text.contains("massaffect_events_accepted_total 1"));
        assert!(text.contains("massaffect_auth_rejections_total{reason=\"forbidden\"} 1"));
    }
}

// ============================================================================
// SECTION 16: HTTP API
// ============================================================================
// Routes:
//   POST /collect                       agent ingestion (origin + signature)
//   GET  /stream                        SSE, every event
//   GET  /stream/:host/:collector       SSE, one scope
//   GET  /history/:host/:collector      recent events, most recent first
//   GET  /registry                      host → collectors
//   GET  /health, /metrics              self-monitoring
// ============================================================================

// ----------------------------------------------------------------------------
// 16.1 API Errors
// ----------------------------------------------------------------------------

/// Request-level failures. Bodies carry a fixed message only.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Invalid body encoding: {0}")]
    InvalidEncoding(String),

    #[error("Payload exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Auth(AuthError::Forbidden { .. }) => StatusCode::FORBIDDEN,
            ApiError::Auth(AuthError::InvalidSignature { .. }) => StatusCode::UNAUTHORIZED,
            ApiError::InvalidJson(_) | ApiError::InvalidEncoding(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn public_message(&self) -> &'static str {
        match self {
            ApiError::Auth(AuthError::Forbidden { .. }) => "Forbidden",
            ApiError::Auth(AuthError::InvalidSignature { .. }) => "Invalid signature",
            ApiError::InvalidJson(_) => "Invalid JSON",
            ApiError::InvalidEncoding(_) => "Invalid body encoding",
            ApiError::PayloadTooLarge { .. } => "Payload too large",
            ApiError::Unavailable(_) => "Service unavailable",
            ApiError::Internal(_) => "Internal server error",
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Auth(auth) => ApiError::Auth(auth),
            EngineError::ShuttingDown => ApiError::Unavailable("shutting down".into()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(target: "massaffect::api", error = %self, "Request failed");
        } else {
            debug!(target: "massaffect::api", error = %self, status = status.as_u16(), "Request rejected");
        }
        (status, Json(json!({ "error": self.public_message() }))).into_response()
    }
}

// ----------------------------------------------------------------------------
// 16.2 Origin Middleware
// ----------------------------------------------------------------------------

/// Resolve the caller's address: the left-most `X-Forwarded-For` entry when
/// trusted, otherwise the socket peer.
fn source_address(request: &Request, trust_forwarded_for: bool) -> Option<IpAddr> {
    if trust_forwarded_for {
        let forwarded = request
            .headers()
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .and_then(|first| first.trim().parse::<IpAddr>().ok());
        if forwarded.is_some() {
            return forwarded;
        }
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(peer)| peer.ip())
}

/// Reject unknown origins before the body is read; attach the [`Agent`].
async fn require_agent(
    State(state): State<Arc<EngineState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let address = source_address(&request, state.config.server.trust_forwarded_for)
        .ok_or_else(|| ApiError::Internal("peer address unavailable".into()))?;

    let agent = state.authenticator.verify_origin(address).map_err(|err| {
        state.metrics.auth_rejections.with_label_values(&[err.reason()]).inc();
        err
    })?;

    request.extensions_mut().insert(agent);
    Ok(next.run(request).await)
}

// ----------------------------------------------------------------------------
// 16.3 Ingestion
// ----------------------------------------------------------------------------

/// Undo `Content-Encoding`, bounded by `limit` decoded bytes.
pub fn decode_body(headers: &HeaderMap, body: Bytes, limit: usize) -> Result<Bytes, ApiError> {
    let encoding = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_ascii_lowercase());

    match encoding.as_deref() {
        None | Some("") | Some("identity") => Ok(body),
        Some("gzip") | Some("x-gzip") => {
            let mut decoded = Vec::new();
            GzDecoder::new(&body[..])
                .take(limit as u64 + 1)
                .read_to_end(&mut decoded)
                .map_err(|e| ApiError::InvalidEncoding(e.to_string()))?;
            if decoded.len() > limit {
                return Err(ApiError::PayloadTooLarge { limit });
            }
            Ok(Bytes::from(decoded))
        }
        Some(other) => Err(ApiError::InvalidEncoding(format!(
            "unsupported content encoding '{}'",
            other
        ))),
    }
}

async fn collect(
    State(state): State<Arc<EngineState>>,
    Extension(agent): Extension<Agent>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<JsonValue>, ApiError> {
    let body = decode_body(&headers, body, state.config.server.max_decompressed_bytes)?;

    let signature = headers.get(SIGNATURE_HEADER).and_then(|value| value.to_str().ok());
    if let Err(err) = state.authenticator.verify_signature(&body, signature) {
        state.metrics.auth_rejections.with_label_values(&[err.reason()]).inc();
        return Err(err.into());
    }

    let events = parse_batch(&body)?;
    let ack = state.pipeline.accept_batch(&agent, events);

    trace!(
        target: "massaffect::api",
        host = %agent.host,
        accepted = ack.accepted,
        dropped = ack.dropped,
        bytes = body.len(),
        "Collect handled"
    );
    Ok(Json(json!({ "ok": true })))
}

// ----------------------------------------------------------------------------
// 16.4 Live Streams
// ----------------------------------------------------------------------------

fn subscribe_sse(
    state: &EngineState,
    scope: Scope,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>> + Send + 'static>, ApiError> {
    let handle = state
        .pipeline
        .dispatcher()
        .subscribe(scope)
        .map_err(|e| ApiError::Unavailable(e.to_string()))?;

    info!(
        target: "massaffect::api",
        subscriber = %handle.id(),
        scope = %handle.scope(),
        "Viewer connected"
    );

    let handshake = stream::once(async { Ok::<_, Infallible>(SseEvent::default().data(CONNECTED_HANDSHAKE)) });
    let updates = handle
        .into_stream()
        .map(|payload| Ok::<_, Infallible>(SseEvent::default().data(&*payload)));

    let sse = Sse::new(handshake.chain(updates));
    Ok(match state.config.keepalive_interval() {
        Some(interval) => sse.keep_alive(KeepAlive::new().interval(interval).text("keepalive")),
        None => sse,
    })
}

async fn stream_all(
    State(state): State<Arc<EngineState>>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>> + Send + 'static>, ApiError> {
    subscribe_sse(&state, Scope::Global)
}

async fn stream_scope(
    State(state): State<Arc<EngineState>>,
    UrlPath((host, collector)): UrlPath<(String, String)>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>> + Send + 'static>, ApiError> {
    subscribe_sse(&state, Scope::specific(host, collector))
}

// ----------------------------------------------------------------------------
// 16.5 History & Discovery
// ----------------------------------------------------------------------------

async fn history(
    State(state): State<Arc<EngineState>>,
    UrlPath((host, collector)): UrlPath<(String, String)>,
    Query(filter): Query<HistoryFilter>,
) -> Json<Vec<Arc<Event>>> {
    let scope = ScopeKey::new(host, collector);
    Json(state.pipeline.history().query(&scope, &filter))
}

async fn registry(State(state): State<Arc<EngineState>>) -> Json<BTreeMap<String, Vec<String>>> {
    Json(state.pipeline.history().registry())
}

// ----------------------------------------------------------------------------
// 16.6 Self-Monitoring
// ----------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub hosts: usize,
    pub scopes: usize,
    pub subscribers: usize,
    pub cold_store: Option<WriterStatsSnapshot>,
}

async fn health(State(state): State<Arc<EngineState>>) -> Json<HealthReport> {
    Json(state.health())
}

async fn metrics(State(state): State<Arc<EngineState>>) -> Result<Response, ApiError> {
    let body = state.metrics.encode()?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response())
}

// ----------------------------------------------------------------------------
// 16.7 Router
// ----------------------------------------------------------------------------

/// Build the application router.
pub fn router(state: Arc<EngineState>) -> Router {
    let ingest = Router::new()
        .route("/collect", post(collect))
        .route_layer(axum_middleware::from_fn_with_state(
            Arc::clone(&state),
            require_agent,
        ));

    let mut viewers = Router::new()
        .route("/stream", get(stream_all))
        .route("/stream/:host/:collector", get(stream_scope))
        .route("/history/:host/:collector", get(history))
        .route("/registry", get(registry));
    if state.config.api.restrict_viewers {
        viewers = viewers.route_layer(axum_middleware::from_fn_with_state(
            Arc::clone(&state),
            require_agent,
        ));
    }

    Router::new()
        .merge(ingest)
        .merge(viewers)
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(DefaultBodyLimit::max(state.config.server.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// SECTION 17: CLI & COMMAND LINE INTERFACE
// ============================================================================

// ----------------------------------------------------------------------------
// 17.1 CLI Argument Parser
// ----------------------------------------------------------------------------

/// MassAffect Engine CLI
#[derive(Parser, Debug)]
#[command(
    name = "massaffect",
    author = "MassAffect Team",
    version,
    about = "Telemetry ingestion and live fan-out for MassAffect agents",
    long_about = "Receives signed metric batches from MassAffect agents, keeps a bounded \
                  recent history per host and collector, persists to SQLite in the \
                  background and streams every event to live viewers over SSE."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, env = "MASSAFFECT_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "MASSAFFECT_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the engine (default)
    Run {
        /// Listen address override
        #[arg(short, long)]
        address: Option<String>,
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

    /// Print the signature an agent would send for a body
    Sign {
        /// File holding the exact request body
        #[arg(short, long)]
        file: PathBuf,

        /// Shared secret (defaults to the configured one)
        #[arg(short, long, env = "AGENT_SECRET", hide_env_values = true)]
        secret: Option<String>,
    },

    /// Show engine version and build info
    Version,
}

// ----------------------------------------------------------------------------
// 17.2 CLI Handler Functions
// ----------------------------------------------------------------------------

/// Handle the validate subcommand
fn handle_validate(config_path: &Path, verbose: bool) -> EngineResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    let config = match EngineConfig::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            println!("Configuration validation failed!");
            println!("Error: {}", e);
            return Err(EngineError::Config(e));
        }
    };
    let agents = config.resolve_agents()?;

    println!("Configuration is valid!");

    if verbose {
        println!("\nParsed configuration:");
        println!("{}", "=".repeat(60));
        let mut redacted = config.clone();
        redacted.auth.secret = "<redacted>".into();
        match toml::to_string_pretty(&redacted) {
            Ok(s) => println!("{}", s),
            Err(e) => println!("Failed to serialize: {}", e),
        }
    }

    println!("\nConfiguration Summary:");
    println!("  • Listen address: {}", config.server.address);
    println!("  • History capacity: {} events per scope", config.history.capacity);
    println!("  • Known agents: {}", agents.len());
    if config.cold_store.enabled {
        println!(
            "  • Cold store: {} ({} workers, queue {})",
            config.cold_store.database_url, config.cold_store.workers, config.cold_store.queue_capacity
        );
    } else {
        println!("  • Cold store: disabled");
    }
    println!(
        "  • Viewer routes: {}",
        if config.api.restrict_viewers { "agents only" } else { "open" }
    );

    Ok(())
}

/// Handle the generate-config subcommand
fn handle_generate_config(output: Option<&Path>) -> EngineResult<()> {
    let config_str = EngineConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("Default configuration written to: {}", path.display());
        }
        None => {
            println!("{}", config_str);
        }
    }

    Ok(())
}

/// Handle the sign subcommand
fn handle_sign(config_path: &Path, file: &Path, secret: Option<String>) -> EngineResult<()> {
    let secret = match secret {
        Some(secret) => secret,
        None => EngineConfig::load_or_default(config_path)?.auth.secret,
    };
    let body = fs::read(file)?;
    println!("{}", sign_body(secret.as_bytes(), &body));
    Ok(())
}

/// Handle the version subcommand
fn handle_version() {
    println!("{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!();
    println!("Features:");
    println!("  • HMAC-SHA256 agent authentication");
    println!("  • Bounded per-scope history");
    println!("  • Background SQLite persistence");
    println!("  • Server-Sent Events fan-out");
}

// ============================================================================
// SECTION 18: ENGINE STATE & LIFECYCLE
// ============================================================================

// ----------------------------------------------------------------------------
// 18.1 Engine State
// ----------------------------------------------------------------------------

/// Process-wide state shared by every request handler.
pub struct EngineState {
    pub config: EngineConfig,
    pub authenticator: AgentAuthenticator,
    pub pipeline: IngestionPipeline,
    pub metrics: Arc<EngineMetrics>,
    started_at: Instant,
}

impl EngineState {
    /// Validate the configuration, connect the cold store and wire the
    /// pipeline.
    pub async fn build(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;

        let store: Option<Arc<dyn ColdStore>> = if config.cold_store.enabled {
            let store = SqliteColdStore::connect(&config.cold_store.database_url).await?;
            Some(Arc::new(store))
        } else {
            None
        };

        Self::with_cold_store(config, store)
    }

    /// Wire the engine around an already-open cold store (`None` disables
    /// persistence). Must be called from within a Tokio runtime.
    pub fn with_cold_store(config: EngineConfig, store: Option<Arc<dyn ColdStore>>) -> EngineResult<Self> {
        let agents = config.resolve_agents()?;
        let metrics = Arc::new(EngineMetrics::new()?);

        let authenticator = AgentAuthenticator::new(agents, config.auth.secret.as_bytes());
        let history = Arc::new(HistoryStore::new(config.history.capacity));
        let writer = match store {
            Some(store) => ColdStoreWriter::spawn(store, &config.cold_store, Arc::clone(&metrics)),
            None => ColdStoreWriter::disabled(Arc::clone(&metrics)),
        };
        let dispatcher = Dispatcher::new(Arc::clone(&metrics));
        let pipeline = IngestionPipeline::new(history, Arc::new(writer), dispatcher, Arc::clone(&metrics));

        info!(
            target: "massaffect::engine",
            agents = authenticator.agents().len(),
            history_capacity = config.history.capacity,
            cold_store = config.cold_store.enabled,
            "Engine state initialized"
        );

        Ok(Self {
            config,
            authenticator,
            pipeline,
            metrics,
            started_at: Instant::now(),
        })
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn health(&self) -> HealthReport {
        let history = self.pipeline.history();
        let cold_store = self.pipeline.cold_store();
        HealthReport {
            status: if self.pipeline.dispatcher().is_closed() { "stopping" } else { "ok" },
            version: ENGINE_VERSION,
            uptime_secs: self.uptime().as_secs(),
            hosts: history.hosts().len(),
            scopes: history.scope_count(),
            subscribers: self.pipeline.dispatcher().total_subscribers(),
            cold_store: cold_store.is_enabled().then(|| cold_store.stats()),
        }
    }

    /// Close every subscriber and stop the cold-store workers. Nothing is
    /// flushed.
    pub fn shutdown(&self) {
        let closed = self.pipeline.dispatcher().close_all();
        self.pipeline.cold_store().shutdown();
        info!(target: "massaffect::engine", subscribers = closed, "Engine state torn down");
    }
}

impl Debug for EngineState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineState")
            .field("authenticator", &self.authenticator)
            .field("pipeline", &self.pipeline)
            .field("uptime", &self.uptime())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// 18.2 Engine
// ----------------------------------------------------------------------------

/// The HTTP server around [`EngineState`].
pub struct Engine {
    state: Arc<EngineState>,
    shutdown: Arc<Notify>,
    running: AtomicBool,
}

impl Engine {
    pub async fn new(config: EngineConfig) -> EngineResult<Self> {
        let state = EngineState::build(config).await?;
        Ok(Self {
            state: Arc::new(state),
            shutdown: Arc::new(Notify::new()),
            running: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> &Arc<EngineState> {
        &self.state
    }

    pub fn is_running(&self) -> bool {
        self.running.load(AtomicOrdering::Relaxed)
    }

    /// Signal shutdown
    pub fn shutdown(&self) {
        info!(target: "massaffect::engine", "Shutdown requested");
        self.shutdown.notify_one();
    }

    /// Serve until SIGINT, SIGTERM or [`Engine::shutdown`].
    pub async fn run(&self) -> EngineResult<()> {
        let address: SocketAddr = self
            .state
            .config
            .server
            .address
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::invalid_value("server.address", e.to_string()))?;

        let listener = tokio::net::TcpListener::bind(address).await?;
        info!(
            target: "massaffect::engine",
            version = ENGINE_VERSION,
            address = %listener.local_addr()?,
            "Starting MassAffect Engine"
        );

        self.running.store(true, AtomicOrdering::Release);

        let app = router(Arc::clone(&self.state));
        let state = Arc::clone(&self.state);
        let shutdown = Arc::clone(&self.shutdown);

        let served = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async move {
                wait_for_shutdown(shutdown).await;
                info!(target: "massaffect::engine", "Starting graceful shutdown");
                state.shutdown();
            })
            .await;

        self.running.store(false, AtomicOrdering::Release);
        served?;

        info!(target: "massaffect::engine", uptime_secs = self.state.uptime().as_secs(), "Engine shutdown complete");
        Ok(())
    }
}

async fn wait_for_shutdown(requested: Arc<Notify>) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(target: "massaffect::engine", error = %err, "Failed to listen for SIGINT");
            futures::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(target: "massaffect::engine", error = %err, "Failed to listen for SIGTERM");
                futures::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = futures::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!(target: "massaffect::engine", "Received SIGINT"),
        _ = terminate => info!(target: "massaffect::engine", "Received SIGTERM"),
        _ = requested.notified() => info!(target: "massaffect::engine", "Shutdown notification received"),
    }
}

// ============================================================================
// SECTION 19: MAIN ENTRY POINT
// ============================================================================

/// Main entry point for the MassAffect engine
#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Subcommands that don't need the runtime state
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
        Some(Commands::Sign { file, secret }) => {
            handle_sign(&cli.config, file, secret.clone())?;
            return Ok(());
        }
        _ => {}
    }

    let mut config = EngineConfig::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if cli.debug {
        config.logging.level = "debug".into();
    }
    if let Some(Commands::Run { address: Some(address) }) = &cli.command {
        config.server.address = address.clone();
    }

    init_logging(&config.logging)?;

    info!("{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);

    let engine = Engine::new(config)
        .await
        .context("Failed to initialize engine state")?;
    engine.run().await?;

    Ok(())
}

// ============================================================================
// SECTION 20: API TESTS
// ============================================================================

#[cfg(test)]
mod api_tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request as HttpRequest};
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tower::ServiceExt;

    const SECRET: &str = "integration-secret";
    const AGENT_IP: &str = "104.13.36.111";
    const STRANGER_IP: &str = "10.9.9.9";

    fn test_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.auth.secret = SECRET.into();
        config.auth.agents.insert(AGENT_IP.into(), "xeno".into());
        config.cold_store.enabled = false;
        config.server.sse_keepalive_secs = 0;
        config
    }

    fn state_with(config: EngineConfig) -> Arc<EngineState> {
        Arc::new(EngineState::with_cold_store(config, None).unwrap())
    }

    fn request(method: Method, uri: &str, peer: &str, body: impl Into<Body>) -> HttpRequest<Body> {
        let mut request = HttpRequest::builder()
            .method(method)
            .uri(uri)
            .body(body.into())
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::new(peer.parse().unwrap(), 40_000)));
        request
    }

    fn signed_collect(peer: &str, body: &[u8]) -> HttpRequest<Body> {
        let mut request = request(Method::POST, "/collect", peer, body.to_vec());
        request
            .headers_mut()
            .insert(SIGNATURE_HEADER, sign_body(SECRET.as_bytes(), body).parse().unwrap());
        request
            .headers_mut()
            .insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        request
    }

    fn gzip(raw: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(raw).unwrap();
        encoder.finish().unwrap()
    }

    async fn json_body(response: Response) -> JsonValue {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn sse_data(frame: &[u8]) -> String {
        std::str::from_utf8(frame)
            .unwrap()
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(str::trim)
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn batch() -> Vec<u8> {
        serde_json::to_vec(&json!([{"collector": "system", "ts": 1, "metrics": {"cpu": 3}}])).unwrap()
    }

    #[tokio::test]
    async fn test_collect_appends_and_acknowledges() {
        let state = state_with(test_config());

        let response = router(Arc::clone(&state))
            .oneshot(signed_collect(AGENT_IP, &batch()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!({"ok": true}));
        let latest = state
            .pipeline
            .history()
            .latest(&ScopeKey::new("xeno", "system"))
            .unwrap();
        assert_eq!(latest.metrics.get("cpu"), Some(&json!(3)));
        assert_eq!(state.metrics.events_accepted.get(), 1);
    }

    #[tokio::test]
    async fn test_single_object_body_is_accepted() {
        let state = state_with(test_config());
        let body = serde_json::to_vec(&json!({"collector": "nginx", "ts": "2024-05-01T10:00:00Z", "metrics": {}})).unwrap();

        let response = router(Arc::clone(&state))
            .oneshot(signed_collect(AGENT_IP, &body))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.pipeline.history().len(&ScopeKey::new("xeno", "nginx")), 1);
    }

    #[tokio::test]
    async fn test_unknown_origin_is_forbidden_before_signature() {
        let state = state_with(test_config());
        let mut request = request(Method::POST, "/collect", STRANGER_IP, batch());
        request
            .headers_mut()
            .insert(SIGNATURE_HEADER, "not-a-signature".parse().unwrap());

        let response = router(Arc::clone(&state)).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(json_body(response).await, json!({"error": "Forbidden"}));
        assert_eq!(state.metrics.auth_rejections.with_label_values(&["forbidden"]).get(), 1);
        assert_eq!(state.metrics.auth_rejections.with_label_values(&["length_mismatch"]).get(), 0);
        assert!(state.pipeline.history().hosts().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_signature_is_unauthorized() {
        let state = state_with(test_config());
        let app = router(Arc::clone(&state));

        let mut tampered = request(Method::POST, "/collect", AGENT_IP, b"[{\"collector\":\"x\",\"ts\":1,\"metrics\":{}}]".to_vec());
        tampered
            .headers_mut()
            .insert(SIGNATURE_HEADER, sign_body(SECRET.as_bytes(), &batch()).parse().unwrap());
        let response = app.clone().oneshot(tampered).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await, json!({"error": "Invalid signature"}));

        let unsigned = request(Method::POST, "/collect", AGENT_IP, batch());
        let response = app.oneshot(unsigned).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        assert_eq!(state.metrics.auth_rejections.with_label_values(&["mismatch"]).get(), 1);
        assert_eq!(state.metrics.auth_rejections.with_label_values(&["missing"]).get(), 1);
        assert!(state.pipeline.history().hosts().is_empty());
    }

    #[tokio::test]
    async fn test_authenticated_non_json_is_bad_request() {
        let state = state_with(test_config());

        let response = router(state)
            .oneshot(signed_collect(AGENT_IP, b"definitely not json"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await, json!({"error": "Invalid JSON"}));
    }

    #[tokio::test]
    async fn test_malformed_event_among_valid_ones() {
        let state = state_with(test_config());
        let body = serde_json::to_vec(&json!([
            {"collector": "system", "ts": 1, "metrics": {}},
            {"ts": 2, "metrics": {}},
            {"collector": "system", "ts": 3, "metrics": {}}
        ]))
        .unwrap();

        let response = router(Arc::clone(&state))
            .oneshot(signed_collect(AGENT_IP, &body))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!({"ok": true}));
        assert_eq!(state.pipeline.history().len(&ScopeKey::new("xeno", "system")), 2);
        assert_eq!(state.metrics.events_dropped.with_label_values(&["missing_field"]).get(), 1);
    }

    #[tokio::test]
    async fn test_gzip_body_signed_over_plain_bytes() {
        let state = state_with(test_config());
        let raw = batch();
        let mut request = request(Method::POST, "/collect", AGENT_IP, gzip(&raw));
        request
            .headers_mut()
            .insert(SIGNATURE_HEADER, sign_body(SECRET.as_bytes(), &raw).parse().unwrap());
        request
            .headers_mut()
            .insert(header::CONTENT_ENCODING, "gzip".parse().unwrap());

        let response = router(Arc::clone(&state)).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.pipeline.history().len(&ScopeKey::new("xeno", "system")), 1);
    }

    #[tokio::test]
    async fn test_bad_encodings_are_rejected() {
        let app = router(state_with(test_config()));

        let mut corrupt = signed_collect(AGENT_IP, b"not gzip at all");
        corrupt
            .headers_mut()
            .insert(header::CONTENT_ENCODING, "gzip".parse().unwrap());
        let response = app.clone().oneshot(corrupt).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await, json!({"error": "Invalid body encoding"}));

        let mut unsupported = signed_collect(AGENT_IP, &batch());
        unsupported
            .headers_mut()
            .insert(header::CONTENT_ENCODING, "br".parse().unwrap());
        let response = app.oneshot(unsupported).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_body_limits() {
        let mut config = test_config();
        config.server.max_body_bytes = 64;
        let app = router(state_with(config));
        let oversized = vec![b' '; 256];
        let response = app.oneshot(signed_collect(AGENT_IP, &oversized)).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let mut config = test_config();
        config.server.max_decompressed_bytes = 100;
        let app = router(state_with(config));
        let raw = vec![b' '; 1_000];
        let mut bomb = request(Method::POST, "/collect", AGENT_IP, gzip(&raw));
        bomb.headers_mut()
            .insert(SIGNATURE_HEADER, sign_body(SECRET.as_bytes(), &raw).parse().unwrap());
        bomb.headers_mut()
            .insert(header::CONTENT_ENCODING, "gzip".parse().unwrap());
        let response = app.oneshot(bomb).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(json_body(response).await, json!({"error": "Payload too large"}));
    }

    #[tokio::test]
    async fn test_mapped_ipv6_peer_is_normalized() {
        let state = state_with(test_config());
        let response = router(Arc::clone(&state))
            .oneshot(signed_collect("::ffff:104.13.36.111", &batch()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.pipeline.history().hosts(), vec!["xeno".to_string()]);
    }

    #[tokio::test]
    async fn test_forwarded_for_only_when_trusted() {
        let forwarded = || {
            let mut request = signed_collect(STRANGER_IP, &batch());
            request
                .headers_mut()
                .insert("x-forwarded-for", "104.13.36.111, 10.0.0.1".parse().unwrap());
            request
        };

        let untrusted = router(state_with(test_config()));
        assert_eq!(untrusted.oneshot(forwarded()).await.unwrap().status(), StatusCode::FORBIDDEN);

        let mut config = test_config();
        config.server.trust_forwarded_for = true;
        let trusted = router(state_with(config));
        assert_eq!(trusted.oneshot(forwarded()).await.unwrap().status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_peer_address_is_internal_error() {
        let mut request = signed_collect(AGENT_IP, &batch());
        request.extensions_mut().remove::<ConnectInfo<SocketAddr>>();

        let response = router(state_with(test_config())).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json_body(response).await, json!({"error": "Internal server error"}));
    }

    #[tokio::test]
    async fn test_end_to_end_stream() {
        let state = state_with(test_config());
        let app = router(Arc::clone(&state));

        let global = app
            .clone()
            .oneshot(request(Method::GET, "/stream", "203.0.113.5", Body::empty()))
            .await
            .unwrap();
        assert_eq!(global.status(), StatusCode::OK);
        assert_eq!(
            global.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );
        let mut global = global.into_body().into_data_stream();
        let handshake = global.next().await.unwrap().unwrap();
        assert_eq!(sse_data(&handshake), CONNECTED_HANDSHAKE);

        let scoped = app
            .clone()
            .oneshot(request(Method::GET, "/stream/xeno/nginx", "203.0.113.5", Body::empty()))
            .await
            .unwrap();
        let mut scoped = scoped.into_body().into_data_stream();
        scoped.next().await.unwrap().unwrap();

        let response = app.clone().oneshot(signed_collect(AGENT_IP, &batch())).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let frame = global.next().await.unwrap().unwrap();
        let payload: JsonValue = serde_json::from_str(&sse_data(&frame)).unwrap();
        assert_eq!(
            payload,
            json!({"host": "xeno", "collector": "system", "ts": 1, "metrics": {"cpu": 3}})
        );
        assert!(tokio::time::timeout(Duration::from_millis(50), scoped.next())
            .await
            .is_err());

        let history = state.pipeline.history().read(&ScopeKey::new("xeno", "system"), 0, 1);
        assert_eq!(history[0].ts, EventTimestamp::Unix(1));

        drop(global);
        assert_eq!(state.pipeline.dispatcher().subscriber_count(&Scope::Global), 0);
        assert_eq!(state.pipeline.dispatcher().total_subscribers(), 1);
    }

    #[tokio::test]
    async fn test_history_endpoint_filters_and_pages() {
        let state = state_with(test_config());
        let app = router(Arc::clone(&state));
        let body = serde_json::to_vec(&json!([
            {"collector": "wp", "ts": 1, "metrics": {"source": "/wp-admin/a.php"}},
            {"collector": "wp", "ts": 2, "metrics": {"source": "/index.php"}},
            {"collector": "wp", "ts": 3, "metrics": {"source": "/wp-admin/b.php"}}
        ]))
        .unwrap();
        app.clone().oneshot(signed_collect(AGENT_IP, &body)).await.unwrap();

        let all = app
            .clone()
            .oneshot(request(Method::GET, "/history/xeno/wp", STRANGER_IP, Body::empty()))
            .await
            .unwrap();
        let all = json_body(all).await;
        assert_eq!(all.as_array().unwrap().len(), 3);
        assert_eq!(all[0]["ts"], 3);

        let filtered = app
            .clone()
            .oneshot(request(
                Method::GET,
                "/history/xeno/wp?source=wp-admin&offset=1&limit=1",
                STRANGER_IP,
                Body::empty(),
            ))
            .await
            .unwrap();
        assert_eq!(
            json_body(filtered).await,
            json!([{"collector": "wp", "ts": 1, "metrics": {"source": "/wp-admin/a.php"}}])
        );

        let unknown = app
            .oneshot(request(Method::GET, "/history/nobody/wp", STRANGER_IP, Body::empty()))
            .await
            .unwrap();
        assert_eq!(json_body(unknown).await, json!([]));
    }

    #[tokio::test]
    async fn test_registry_endpoint() {
        let state = state_with(test_config());
        let app = router(Arc::clone(&state));
        let body = serde_json::to_vec(&json!([
            {"collector": "system", "ts": 1, "metrics": {}},
            {"collector": "nginx", "ts": 1, "metrics": {}},
            {"collector": "system", "ts": 2, "metrics": {}}
        ]))
        .unwrap();
        app.clone().oneshot(signed_collect(AGENT_IP, &body)).await.unwrap();

        let response = app
            .oneshot(request(Method::GET, "/registry", STRANGER_IP, Body::empty()))
            .await
            .unwrap();

        assert_eq!(json_body(response).await, json!({"xeno": ["nginx", "system"]}));
    }

    #[tokio::test]
    async fn test_restricted_viewer_routes() {
        let mut config = test_config();
        config.api.restrict_viewers = true;
        let app = router(state_with(config));

        let stranger = app
            .clone()
            .oneshot(request(Method::GET, "/registry", STRANGER_IP, Body::empty()))
            .await
            .unwrap();
        assert_eq!(stranger.status(), StatusCode::FORBIDDEN);

        let agent = app
            .clone()
            .oneshot(request(Method::GET, "/registry", AGENT_IP, Body::empty()))
            .await
            .unwrap();
        assert_eq!(agent.status(), StatusCode::OK);

        let health = app
            .oneshot(request(Method::GET, "/health", STRANGER_IP, Body::empty()))
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_and_metrics() {
        let state = state_with(test_config());
        let app = router(Arc::clone(&state));
        app.clone().oneshot(signed_collect(AGENT_IP, &batch())).await.unwrap();

        let health = json_body(
            app.clone()
                .oneshot(request(Method::GET, "/health", STRANGER_IP, Body::empty()))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(health["status"], "ok");
        assert_eq!(health["hosts"], 1);
        assert_eq!(health["subscribers"], 0);
        assert!(health["cold_store"].is_null());

        let metrics = app
            .oneshot(request(Method::GET, "/metrics", STRANGER_IP, Body::empty()))
            .await
            .unwrap();
        assert_eq!(metrics.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(metrics.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("massaffect_events_accepted_total 1"));
    }

    #[tokio::test]
    async fn test_state_with_sqlite_cold_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.cold_store.enabled = true;
        config.cold_store.database_url = format!("sqlite://{}", dir.path().join("events.db").display());

        let state = Arc::new(EngineState::build(config).await.unwrap());
        let response = router(Arc::clone(&state))
            .oneshot(signed_collect(AGENT_IP, &batch()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        for _ in 0..200 {
            if state.pipeline.cold_store().stats().written == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state.pipeline.cold_store().stats().written, 1);

        state.shutdown();
        assert_eq!(state.health().status, "stopping");
        assert!(state.pipeline.dispatcher().subscribe(Scope::Global).is_err());
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let mut config = test_config();
        config.auth.secret.clear();
        assert!(matches!(
            EngineState::build(config).await,
            Err(EngineError::Config(ConfigError::MissingField { .. }))
        ));
    }

    #[tokio::test]
    async fn test_engine_serves_until_shutdown() {
        let mut config = test_config();
        config.server.address = "127.0.0.1:0".into();
        let engine = Arc::new(Engine::new(config).await.unwrap());

        let runner = Arc::clone(&engine);
        let task = tokio::spawn(async move { runner.run().await });
        engine.shutdown();

        let result = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(result.is_ok());
        assert!(!engine.is_running());
        assert!(engine.state().pipeline.dispatcher().is_closed());
    }

    #[test]
    fn test_api_error_status_codes() {
        assert_eq!(
            ApiError::Auth(AuthError::Forbidden { address: "10.0.0.1".parse().unwrap() }).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::Auth(AuthError::InvalidSignature { reason: SignatureRejection::Missing }).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::InvalidEncoding("bad".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::PayloadTooLarge { limit: 1 }.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ApiError::from(EngineError::ShuttingDown).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn test_api_error_bodies_do_not_leak_details() {
        let response = ApiError::Internal("database password is hunter2".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert_eq!(body, json!({"error": "Internal server error"}));
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["massaffect", "--config", "custom.toml", "validate", "--verbose"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("custom.toml"));
        assert!(matches!(cli.command, Some(Commands::Validate { verbose: true })));

        let cli = Cli::try_parse_from(["massaffect", "sign", "--file", "body.json", "--secret", "s"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Sign { ref file, secret: Some(ref secret) }) if file == Path::new("body.json") && secret == "s"
        ));

        let cli = Cli::try_parse_from(["massaffect"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_handle_sign_matches_agent_signature() {
        let dir = tempfile::tempdir().unwrap();
        let body_path = dir.path().join("body.json");
        fs::write(&body_path, batch()).unwrap();

        assert!(handle_sign(&dir.path().join("absent.toml"), &body_path, Some(SECRET.into())).is_ok());
        assert!(handle_sign(&dir.path().join("absent.toml"), &dir.path().join("missing.json"), Some(SECRET.into())).is_err());
    }
}
