//! Shared error plumbing for marathon-acme
//!
//! Each subsystem defines its own `thiserror` enum close to the code that
//! produces it (`SseError`, `ClientError`, `VaultError`, `StoreError`,
//! `AcmeError`, ...). This module holds the pieces shared across them: the
//! crate-wide `Result` alias used at task boundaries and the configuration
//! error reported before the process does anything observable.

use thiserror::Error;

/// Errors produced while validating the command line into a [`crate::config::Config`].
///
/// Any of these is reported on stderr and terminates the process with exit
/// code 2, before a network listener is opened.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// An endpoint list entry could not be parsed as an HTTP(S) URL
    #[error("invalid {kind} endpoint '{value}': {reason}")]
    InvalidEndpoint {
        /// Which endpoint list the value came from (marathon, lb, acme)
        kind: &'static str,
        /// The offending value
        value: String,
        /// Why it was rejected
        reason: String,
    },

    /// The `--listen` address could not be parsed
    #[error("invalid listen address '{0}': {1}")]
    InvalidListenAddress(String, String),

    /// A flag value is outside its accepted range
    #[error("invalid value for {flag}: {reason}")]
    InvalidValue {
        /// The flag name
        flag: &'static str,
        /// Why the value was rejected
        reason: String,
    },

    /// The storage path is missing or unusable
    #[error("invalid storage path '{0}': {1}")]
    InvalidStoragePath(String, String),
}

/// Result type alias for marathon-acme operations
///
/// Uses `anyhow::Error` so task-level code can attach context while the
/// typed errors remain matchable at the layer that produced them.
pub type Result<T> = anyhow::Result<T>;
