// SPDX-License-Identifier: AGPL-3.0-only
use clap::{ArgAction, Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum LogFormat {
    /// Human-readable text format (default).
    #[default]
    Text,
    /// JSON structured logging for log aggregation (ELK, Loki).
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "tacplus-server", version, about = "Rust TACACS+ AAA server")]
pub struct Args {
    /// Validate a policy file and exit.
    #[arg(long)]
    pub check_policy: Option<PathBuf>,

    /// JSON schema to validate policy files against.
    #[arg(long)]
    pub schema: Option<PathBuf>,

    /// Path to the active policy.
    #[arg(long)]
    pub policy: Option<PathBuf>,

    /// Listen address for TACACS+ over TCP.
    #[arg(long, default_value = "0.0.0.0:49")]
    pub listen: SocketAddr,

    /// Listen address for HTTP health checks and Prometheus metrics.
    #[arg(long)]
    pub listen_http: Option<SocketAddr>,

    /// Shared secret for TACACS+ body obfuscation.
    #[arg(long)]
    pub secret: Option<String>,

    /// Maximum number of in-flight multi-round conversations tracked.
    #[arg(long, default_value_t = 4096)]
    pub max_sessions: u32,

    /// Seconds a stalled conversation's state survives before reaping.
    #[arg(long, default_value_t = 30)]
    pub session_timeout_secs: u64,

    /// Force byte 3 of generated state tokens to this value so external load
    /// balancers can shard on a stable prefix. Values >= 256 disable this.
    #[arg(long, default_value_t = 256)]
    pub state_seed: u32,

    /// Run request processing on a multi-threaded worker pool. Set to false
    /// for a single-threaded server.
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub spawn_workers: bool,

    /// Log output format: text or json.
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// OpenTelemetry OTLP endpoint URL (e.g., http://jaeger:4317). Enables
    /// distributed tracing.
    #[arg(long)]
    pub otlp_endpoint: Option<String>,

    /// Service name for OpenTelemetry traces.
    #[arg(long, default_value = "tacplus-server")]
    pub otel_service_name: String,

    /// Location identifier for telemetry resource attributes (e.g., NYC01).
    #[arg(long)]
    pub location: Option<String>,
}
