//! Runtime configuration
//!
//! [`Config`] is the validated form of the command line: endpoint lists
//! parsed into URLs, timeouts into `Duration`s, the listen string into a
//! socket address. Validation happens once, in [`Config::from_cli`],
//! before any network listener is opened; every later component receives
//! typed values and never re-validates.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::cli::{Cli, LogLevel};
use crate::error::ConfigError;
use crate::sse::{SseOptions, DEFAULT_MAX_LINE_LENGTH};

/// Default ACME directory: Let's Encrypt production.
pub const DEFAULT_ACME_DIRECTORY: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Consecutive event-stream failures before `/health` reports unhealthy.
pub const DEFAULT_EVENT_FAILURE_THRESHOLD: u32 = 3;

/// How long shutdown waits for in-flight work before aborting it.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Where certificates are persisted.
#[derive(Debug, Clone)]
pub enum StorageBackend {
    /// A local directory: `certs/` bundles, `client.key`, `default.pem`
    Directory(PathBuf),
    /// A Vault KV v2 engine at the given mount path
    Vault {
        /// The KV v2 mount path
        mount: String,
    },
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Certificate storage backend
    pub storage: StorageBackend,
    /// ACME directory URL
    pub acme_directory: Url,
    /// Optional registration contact email
    pub email: Option<String>,
    /// Priority-ordered Marathon endpoints
    pub marathon_endpoints: Vec<Url>,
    /// marathon-lb endpoints, all signalled on certificate changes
    pub lb_endpoints: Vec<Url>,
    /// HAProxy group this instance issues certificates for
    pub group: String,
    /// Use every domain in a port label instead of only the first
    pub allow_multiple_certs: bool,
    /// Public bind address for the challenge responder and health endpoint
    pub listen: SocketAddr,
    /// Timeout for Marathon REST requests
    pub marathon_timeout: Duration,
    /// SSE idle timeout; `None` disables the guard
    pub sse_timeout: Option<Duration>,
    /// Timeout for marathon-lb requests
    pub lb_timeout: Duration,
    /// Timeout for Vault requests
    pub vault_timeout: Duration,
    /// Optional periodic sync interval
    pub poll_interval: Option<Duration>,
    /// Renewal lead time in days; 0 disables the renewal sweep
    pub renewal_days: u32,
    /// Consecutive event-stream failures before reporting unhealthy
    pub event_failure_threshold: u32,
    /// Shutdown grace period for in-flight work
    pub shutdown_grace: Duration,
    /// Log level seeding the tracing filter
    pub log_level: LogLevel,
}

impl Config {
    /// Validate and normalize the parsed command line.
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        let marathon_endpoints = parse_endpoints(&cli.marathon, "marathon")?;
        let lb_endpoints = parse_endpoints(&cli.lb, "lb")?;

        let acme_directory =
            Url::parse(&cli.acme).map_err(|e| ConfigError::InvalidEndpoint {
                kind: "acme",
                value: cli.acme.clone(),
                reason: e.to_string(),
            })?;
        require_http(&acme_directory, "acme", &cli.acme)?;

        if let Some(email) = &cli.email {
            if !email.contains('@') {
                return Err(ConfigError::InvalidValue {
                    flag: "--email",
                    reason: format!("'{}' is not an email address", email),
                });
            }
        }

        if cli.group.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                flag: "--group",
                reason: "group must not be empty".to_string(),
            });
        }

        let listen = parse_listen(&cli.listen)?;

        if cli.marathon_timeout == 0 {
            return Err(ConfigError::InvalidValue {
                flag: "--marathon-timeout",
                reason: "timeout must be positive".to_string(),
            });
        }
        if cli.lb_timeout == 0 {
            return Err(ConfigError::InvalidValue {
                flag: "--lb-timeout",
                reason: "timeout must be positive".to_string(),
            });
        }
        if cli.vault_timeout == 0 {
            return Err(ConfigError::InvalidValue {
                flag: "--vault-timeout",
                reason: "timeout must be positive".to_string(),
            });
        }
        if cli.poll == Some(0) {
            return Err(ConfigError::InvalidValue {
                flag: "--poll",
                reason: "interval must be positive; omit the flag to disable".to_string(),
            });
        }

        if cli.storage_path.trim().is_empty() {
            return Err(ConfigError::InvalidStoragePath(
                cli.storage_path.clone(),
                "path must not be empty".to_string(),
            ));
        }
        let storage = if cli.vault {
            StorageBackend::Vault {
                mount: cli.storage_path.trim_matches('/').to_string(),
            }
        } else {
            StorageBackend::Directory(PathBuf::from(&cli.storage_path))
        };

        Ok(Self {
            storage,
            acme_directory,
            email: cli.email.clone(),
            marathon_endpoints,
            lb_endpoints,
            group: cli.group.clone(),
            allow_multiple_certs: cli.allow_multiple_certs,
            listen,
            marathon_timeout: Duration::from_secs(cli.marathon_timeout),
            // 0 disables the idle timeout.
            sse_timeout: (cli.sse_timeout > 0).then(|| Duration::from_secs(cli.sse_timeout)),
            lb_timeout: Duration::from_secs(cli.lb_timeout),
            vault_timeout: Duration::from_secs(cli.vault_timeout),
            poll_interval: cli.poll.map(Duration::from_secs),
            renewal_days: cli.renewal_days,
            event_failure_threshold: DEFAULT_EVENT_FAILURE_THRESHOLD,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            log_level: cli.log_level,
        })
    }

    /// SSE framing options derived from this configuration.
    pub fn sse_options(&self) -> SseOptions {
        SseOptions {
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            idle_timeout: self.sse_timeout,
        }
    }
}

fn require_http(url: &Url, kind: &'static str, value: &str) -> Result<(), ConfigError> {
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidEndpoint {
            kind,
            value: value.to_string(),
            reason: format!("unsupported scheme '{}'", url.scheme()),
        });
    }
    Ok(())
}

fn parse_endpoints(values: &[String], kind: &'static str) -> Result<Vec<Url>, ConfigError> {
    let mut endpoints = Vec::new();
    for value in values {
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        let url = Url::parse(value).map_err(|e| ConfigError::InvalidEndpoint {
            kind,
            value: value.to_string(),
            reason: e.to_string(),
        })?;
        require_http(&url, kind, value)?;
        endpoints.push(url);
    }
    if endpoints.is_empty() {
        return Err(ConfigError::InvalidValue {
            flag: kind,
            reason: "at least one endpoint is required".to_string(),
        });
    }
    Ok(endpoints)
}

/// Parse a `HOST:PORT` listen string; an empty host means all interfaces.
fn parse_listen(value: &str) -> Result<SocketAddr, ConfigError> {
    let (host, port) = value.rsplit_once(':').ok_or_else(|| {
        ConfigError::InvalidListenAddress(value.to_string(), "expected HOST:PORT".to_string())
    })?;

    let port: u16 = port.parse().map_err(|_| {
        ConfigError::InvalidListenAddress(value.to_string(), format!("invalid port '{}'", port))
    })?;

    let host = if host.is_empty() { "0.0.0.0" } else { host };
    format!("{}:{}", host, port)
        .to_socket_addrs()
        .map_err(|e| ConfigError::InvalidListenAddress(value.to_string(), e.to_string()))?
        .next()
        .ok_or_else(|| {
            ConfigError::InvalidListenAddress(
                value.to_string(),
                "address did not resolve".to_string(),
            )
        })
}
