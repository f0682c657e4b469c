//! marathon-lb signal client
//!
//! Very small client for the `/_mlb_signal` endpoints on marathon-lb.
//! Unlike the Marathon client, every request is fanned out to all
//! configured endpoints at once: each load balancer replica holds its own
//! HAProxy instance and each must be signalled.

use std::time::Duration;

use futures::future::join_all;
use reqwest::{Method, StatusCode};
use tracing::{debug, error};
use url::Url;

use crate::clients::{endpoint_url, ClientError};

/// Client for the marathon-lb admin signal endpoints.
pub struct MarathonLbClient {
    endpoints: Vec<Url>,
    http: reqwest::Client,
    timeout: Duration,
}

impl MarathonLbClient {
    /// Create a client that signals all of the given endpoints.
    pub fn new(endpoints: Vec<Url>, timeout: Duration) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(Self {
            endpoints,
            http,
            timeout,
        })
    }

    /// POST to `path` on every endpoint concurrently.
    ///
    /// Returns one entry per endpoint, in endpoint order, with `None` for
    /// endpoints that failed. Each failure is logged with the endpoint
    /// identity; only when every endpoint fails is
    /// [`ClientError::AllEndpointsFailed`] raised.
    async fn request_all(
        &self,
        method: Method,
        path: &str,
    ) -> Result<Vec<Option<StatusCode>>, ClientError> {
        let requests = self.endpoints.iter().map(|endpoint| {
            let method = method.clone();
            async move {
                let url = endpoint_url(endpoint, path)?;
                let response = self
                    .http
                    .request(method, url.clone())
                    .timeout(self.timeout)
                    .send()
                    .await
                    .map_err(|e| ClientError::Transport(e.to_string()))?;

                let status = response.status();
                if !status.is_success() {
                    return Err(ClientError::Http {
                        status: status.as_u16(),
                        url: url.to_string(),
                    });
                }
                Ok(status)
            }
        });

        let results = join_all(requests).await;

        let mut responses = Vec::with_capacity(self.endpoints.len());
        let mut failed = 0usize;
        for (endpoint, result) in self.endpoints.iter().zip(results) {
            match result {
                Ok(status) => responses.push(Some(status)),
                Err(e) => {
                    error!(
                        endpoint = %endpoint,
                        error = %e,
                        "Failed to make a request to a marathon-lb instance"
                    );
                    responses.push(None);
                    failed += 1;
                }
            }
        }

        if failed == self.endpoints.len() {
            return Err(ClientError::AllEndpointsFailed);
        }
        if failed > 0 {
            error!(
                "Failed to make a request to {}/{} marathon-lb instances",
                failed,
                self.endpoints.len()
            );
        }

        Ok(responses)
    }

    /// Trigger a SIGHUP: full config reload as though a relevant Marathon
    /// event was received.
    pub async fn signal_hup(&self) -> Result<Vec<Option<StatusCode>>, ClientError> {
        debug!("Sending HUP signal to marathon-lb");
        self.request_all(Method::POST, "/_mlb_signal/hup").await
    }

    /// Trigger a SIGUSR1: reload the existing config whether it has
    /// changed or not. Used after certificate changes.
    pub async fn signal_usr1(&self) -> Result<Vec<Option<StatusCode>>, ClientError> {
        debug!("Sending USR1 signal to marathon-lb");
        self.request_all(Method::POST, "/_mlb_signal/usr1").await
    }
}
