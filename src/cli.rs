//! Command-line interface definition
//!
//! A single entry point: the positional storage path plus flags for the
//! ACME directory, the Marathon and marathon-lb endpoints, the group
//! filter, timeouts, and the Vault toggle. Exit codes follow the usual
//! convention: 0 on clean shutdown, 2 for CLI/config errors (clap's
//! default), 1 for runtime fatals.

use clap::{Parser, ValueEnum};

use crate::config::DEFAULT_ACME_DIRECTORY;

/// Automatically request, renew and distribute ACME (Let's Encrypt)
/// certificates for apps running on Marathon behind marathon-lb.
#[derive(Parser, Debug, Clone)]
#[command(name = "marathon-acme")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Directory for certificate storage, or the Vault KV v2 mount path
    /// when --vault is set
    pub storage_path: String,

    /// The address of the ACME Directory Resource
    #[arg(long, default_value = DEFAULT_ACME_DIRECTORY)]
    pub acme: String,

    /// Email address for ACME registration and recovery contact
    #[arg(long)]
    pub email: Option<String>,

    /// Priority-ordered comma-separated list of Marathon endpoints
    #[arg(long, default_value = "http://marathon.mesos:8080", value_delimiter = ',')]
    pub marathon: Vec<String>,

    /// Comma-separated list of marathon-lb endpoints; all are signalled
    #[arg(long, default_value = "http://marathon-lb.marathon.mesos:9090", value_delimiter = ',')]
    pub lb: Vec<String>,

    /// The marathon-lb group to issue certificates for
    #[arg(long, default_value = "external")]
    pub group: String,

    /// Allow multiple certificates for a single app port, one per listed
    /// domain
    #[arg(long)]
    pub allow_multiple_certs: bool,

    /// Public HOST:PORT to bind; an empty host means all interfaces
    #[arg(long, default_value = ":8000")]
    pub listen: String,

    /// Timeout in seconds for Marathon REST requests
    #[arg(long, default_value_t = 10)]
    pub marathon_timeout: u64,

    /// Idle timeout in seconds for the Marathon event stream; 0 disables
    #[arg(long, default_value_t = 60)]
    pub sse_timeout: u64,

    /// Timeout in seconds for marathon-lb requests
    #[arg(long, default_value_t = 5)]
    pub lb_timeout: u64,

    /// Timeout in seconds for Vault requests
    #[arg(long, default_value_t = 5)]
    pub vault_timeout: u64,

    /// Also sync every _n_ seconds, in addition to event-driven syncs
    #[arg(long)]
    pub poll: Option<u64>,

    /// Reissue certificates this many days before expiry; 0 disables
    #[arg(long, default_value_t = 30)]
    pub renewal_days: u32,

    /// Log level
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Store certificates in Vault; the storage path is then the KV v2
    /// mount path
    #[arg(long)]
    pub vault: bool,
}

/// Log levels accepted on the command line.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Everything, including per-request detail
    Debug,
    /// Normal operation
    Info,
    /// Degraded but functioning
    Warn,
    /// Failures
    Error,
    /// Alias for error; tracing has no higher level
    Critical,
}

impl LogLevel {
    /// The tracing level filter this maps to.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }
}
