//! HTTP clients for the external collaborators
//!
//! Three JSON-over-HTTP surfaces: Marathon (REST with endpoint failover
//! plus the `/v2/events` SSE stream), marathon-lb (signal fan-out to every
//! replica), and Vault (KV v2 with check-and-set). Each client owns its own
//! `reqwest::Client` and applies its configured timeout per request, so the
//! long-lived event stream is never clipped by a REST timeout.

pub mod marathon;
pub mod marathon_lb;
pub mod vault;

pub use marathon::{MarathonApp, MarathonClient, MarathonEvent, MarathonEventStream};
pub use marathon_lb::MarathonLbClient;
pub use vault::{VaultClient, VaultError};

use thiserror::Error;
use url::Url;

use crate::sse::SseError;

/// Errors shared by the Marathon and marathon-lb clients.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The server answered with a non-success status
    #[error("HTTP error ({status}) for url: {url}")]
    Http {
        /// Response status code
        status: u16,
        /// Request URL
        url: String,
    },

    /// The request never produced a response
    #[error("transport error: {0}")]
    Transport(String),

    /// Every configured endpoint failed
    #[error("failed to make a request to all endpoints")]
    AllEndpointsFailed,

    /// The response violated the expected protocol (wrong content type,
    /// missing field, undecodable body)
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The event stream failed while being read
    #[error("SSE stream error: {0}")]
    Sse(#[from] SseError),
}

/// Join a base endpoint and an absolute path, preserving any path prefix
/// on the endpoint.
pub(crate) fn endpoint_url(endpoint: &Url, path: &str) -> Result<Url, ClientError> {
    let joined = format!("{}{}", endpoint.as_str().trim_end_matches('/'), path);
    Url::parse(&joined).map_err(|e| ClientError::Protocol(format!("invalid request URL: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_url_plain_host() {
        let base = Url::parse("http://marathon.mesos:8080").unwrap();
        let url = endpoint_url(&base, "/v2/apps").unwrap();
        assert_eq!(url.as_str(), "http://marathon.mesos:8080/v2/apps");
    }

    #[test]
    fn test_endpoint_url_keeps_path_prefix() {
        let base = Url::parse("http://proxy.example.com/marathon/").unwrap();
        let url = endpoint_url(&base, "/v2/apps").unwrap();
        assert_eq!(url.as_str(), "http://proxy.example.com/marathon/v2/apps");
    }
}
