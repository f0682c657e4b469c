//! Marathon API client
//!
//! Configured with a priority-ordered list of endpoints. Every REST call
//! tries the endpoints in order and stops at the first success; transport
//! errors and 5xx responses fail over to the next endpoint while a 4xx is
//! treated as an authoritative answer. When the whole list is exhausted the
//! call fails with [`ClientError::AllEndpointsFailed`].
//!
//! The `/v2/events` stream is different: [`MarathonClient::open_event_stream`]
//! tries exactly one endpoint per attempt (rotating through the list across
//! attempts) and leaves reconnection policy to the caller.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::TryStreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use url::Url;

use crate::clients::{endpoint_url, ClientError};
use crate::sse::{read_sse_stream, SseError, SseOptions};

/// A Marathon app definition, reduced to the fields the reconciler needs.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarathonApp {
    /// App ID, e.g. `/mygroup/myapp`
    pub id: String,
    /// App labels
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Port definitions; only the count and order matter here
    #[serde(default)]
    pub port_definitions: Vec<PortDefinition>,
}

/// A single Marathon port definition.
#[derive(Debug, Clone, Deserialize)]
pub struct PortDefinition {
    /// Configured service port
    #[serde(default)]
    pub port: Option<u32>,
}

/// An event received from the Marathon event stream, JSON already decoded.
#[derive(Debug, Clone)]
pub struct MarathonEvent {
    /// The SSE event type, e.g. `api_post_event`
    pub event_type: String,
    /// The decoded JSON payload
    pub data: serde_json::Value,
}

/// Client for the Marathon HTTP API.
pub struct MarathonClient {
    endpoints: Vec<Url>,
    http: reqwest::Client,
    timeout: Duration,
    sse: SseOptions,
    stream_attempts: AtomicUsize,
}

impl MarathonClient {
    /// Create a client for the given priority-ordered endpoints.
    ///
    /// `timeout` bounds each REST request; the SSE stream is only bounded
    /// by the idle timeout in `sse`.
    pub fn new(
        endpoints: Vec<Url>,
        timeout: Duration,
        sse: SseOptions,
    ) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(Self {
            endpoints,
            http,
            timeout,
            sse,
            stream_attempts: AtomicUsize::new(0),
        })
    }

    /// Perform a request against each endpoint in order until one succeeds.
    async fn request_with_failover(
        &self,
        method: Method,
        path: &str,
    ) -> Result<reqwest::Response, ClientError> {
        for endpoint in &self.endpoints {
            let url = endpoint_url(endpoint, path)?;
            let result = self
                .http
                .request(method.clone(), url.clone())
                .header(ACCEPT, "application/json")
                .timeout(self.timeout)
                .send()
                .await;

            match result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    if status.is_server_error() {
                        warn!(
                            endpoint = %endpoint,
                            status = status.as_u16(),
                            "Marathon endpoint returned a server error, trying next"
                        );
                        continue;
                    }
                    // 4xx is an authoritative answer, not a failover case.
                    return Err(ClientError::Http {
                        status: status.as_u16(),
                        url: url.to_string(),
                    });
                }
                Err(e) => {
                    warn!(
                        endpoint = %endpoint,
                        error = %e,
                        "Request to Marathon endpoint failed, trying next"
                    );
                    continue;
                }
            }
        }

        error!("Failed to make a request to all Marathon endpoints");
        Err(ClientError::AllEndpointsFailed)
    }

    /// GET a path and extract one field from the JSON response object.
    ///
    /// Marathon responses wrap their payload in a single-key envelope, e.g.
    /// `/v2/apps` returns `{"apps": [...]}`; a missing field is a protocol
    /// violation.
    async fn get_json_field(
        &self,
        path: &str,
        field: &str,
    ) -> Result<serde_json::Value, ClientError> {
        let response = self.request_with_failover(Method::GET, path).await?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !content_type.starts_with("application/json") {
            return Err(ClientError::Protocol(format!(
                "expected Content-Type application/json, got '{}'",
                content_type
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ClientError::Protocol(format!("undecodable Marathon response: {}", e)))?;

        body.get(field).cloned().ok_or_else(|| {
            ClientError::Protocol(format!("field '{}' missing from Marathon response", field))
        })
    }

    /// Fetch the currently running Marathon apps.
    pub async fn get_apps(&self) -> Result<Vec<MarathonApp>, ClientError> {
        let apps = self.get_json_field("/v2/apps", "apps").await?;
        serde_json::from_value(apps).map_err(|e| {
            ClientError::Protocol(format!("could not decode Marathon apps response: {}", e))
        })
    }

    /// Open the `/v2/events` SSE stream for the given event types.
    ///
    /// Exactly one endpoint is tried; consecutive attempts rotate through
    /// the endpoint list so a dead first endpoint cannot wedge
    /// reconnection. The response must be `200 OK` with
    /// `Content-Type: text/event-stream`.
    pub async fn open_event_stream(
        &self,
        event_types: &[String],
    ) -> Result<MarathonEventStream, ClientError> {
        let index = self.stream_attempts.fetch_add(1, Ordering::Relaxed) % self.endpoints.len();
        let endpoint = &self.endpoints[index];
        let url = endpoint_url(endpoint, "/v2/events")?;

        let mut types: Vec<&String> = event_types.iter().collect();
        types.sort();

        // The event_type parameter was added in Marathon 1.3.7; older
        // versions ignore it and we drop unsubscribed events anyway.
        let query: Vec<(&str, &str)> = types.iter().map(|t| ("event_type", t.as_str())).collect();

        debug!(endpoint = %endpoint, "Opening Marathon event stream");
        let response = self
            .http
            .get(url.clone())
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-store")
            .query(&query)
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        if response.status() != StatusCode::OK {
            return Err(ClientError::Http {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !content_type.starts_with("text/event-stream") {
            return Err(ClientError::Protocol(format!(
                "expected Content-Type text/event-stream, got '{}'",
                content_type
            )));
        }

        Ok(MarathonEventStream {
            response,
            subscribed: event_types.iter().cloned().collect(),
            sse: self.sse.clone(),
        })
    }
}

/// An open, validated Marathon event stream.
///
/// Holding this value means the HTTP connection was established and the
/// response headers checked; [`run`](MarathonEventStream::run) then reads it
/// to completion.
pub struct MarathonEventStream {
    response: reqwest::Response,
    subscribed: HashSet<String>,
    sse: SseOptions,
}

impl MarathonEventStream {
    /// Read the stream until it closes, forwarding subscribed events.
    ///
    /// Events whose type has no subscription are silently dropped;
    /// subscribed events have their data parsed as JSON before being sent.
    /// Returns `Ok(())` on a clean close (including the receiver going
    /// away) and an error on timeout, oversized lines, transport failure,
    /// or undecodable event data.
    pub async fn run(
        self,
        events_tx: mpsc::UnboundedSender<MarathonEvent>,
    ) -> Result<(), ClientError> {
        let byte_stream = self
            .response
            .bytes_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e));

        let subscribed = self.subscribed;
        let mut receiver_gone = false;
        let result = read_sse_stream(byte_stream, self.sse, |event| {
            if !subscribed.contains(&event.event) {
                return Ok(());
            }
            let data: serde_json::Value = serde_json::from_str(&event.data).map_err(|e| {
                SseError::Handler(format!("invalid JSON in '{}' event: {}", event.event, e))
            })?;
            let sent = events_tx.send(MarathonEvent {
                event_type: event.event,
                data,
            });
            if sent.is_err() {
                receiver_gone = true;
                return Err(SseError::Handler("event receiver dropped".to_string()));
            }
            Ok(())
        })
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(SseError::Handler(_)) if receiver_gone => Ok(()),
            Err(SseError::Handler(msg)) => Err(ClientError::Protocol(msg)),
            Err(e) => Err(ClientError::Sse(e)),
        }
    }
}
