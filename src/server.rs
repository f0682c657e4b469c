//! Public HTTP surface
//!
//! Two routes on the one public listener: `GET /health` for readiness and
//! `GET /.well-known/acme-challenge/<token>` for HTTP-01 validation. The
//! challenge route must be reachable by the ACME server, so this listener
//! is the address marathon-lb forwards `/.well-known/acme-challenge`
//! traffic to.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::sync::RwLock;

use crate::responder::Http01Responder;

/// Orchestrator lifecycle states, reported in health details.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Constructed, nothing started
    Init,
    /// Binding the server and waiting for the ACME service
    Starting,
    /// Event loop running
    Running,
    /// Shutdown in progress
    Stopping,
    /// All resources released
    Stopped,
}

impl LifecycleState {
    fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Init => "init",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
        }
    }
}

/// A point-in-time health judgement plus the JSON details served with it.
#[derive(Debug, Clone)]
pub struct Health {
    /// Whether the service is currently healthy
    pub healthy: bool,
    /// JSON body for the health response
    pub message: serde_json::Value,
}

#[derive(Debug)]
struct HealthInner {
    state: LifecycleState,
    stream_failures: u32,
    acme_ready: bool,
}

/// Shared health status, written by the orchestrator and read by the
/// `/health` route.
///
/// The service is healthy only while the orchestrator is RUNNING, the
/// event stream has fewer consecutive failures than the configured
/// threshold, and the ACME service has reported ready.
#[derive(Clone)]
pub struct HealthState {
    inner: Arc<RwLock<HealthInner>>,
    failure_threshold: u32,
}

impl HealthState {
    /// Create health state; `failure_threshold` is the number of
    /// consecutive event-stream failures that flips the service unhealthy.
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HealthInner {
                state: LifecycleState::Init,
                stream_failures: 0,
                acme_ready: false,
            })),
            failure_threshold,
        }
    }

    /// Record a lifecycle transition.
    pub async fn set_state(&self, state: LifecycleState) {
        self.inner.write().await.state = state;
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> LifecycleState {
        self.inner.read().await.state
    }

    /// Mark the ACME service ready (or not).
    pub async fn set_acme_ready(&self, ready: bool) {
        self.inner.write().await.acme_ready = ready;
    }

    /// Count one event-stream failure; returns the consecutive total.
    pub async fn record_stream_failure(&self) -> u32 {
        let mut inner = self.inner.write().await;
        inner.stream_failures = inner.stream_failures.saturating_add(1);
        inner.stream_failures
    }

    /// Reset the consecutive failure count after a successful connect.
    pub async fn reset_stream_failures(&self) {
        self.inner.write().await.stream_failures = 0;
    }

    /// Produce the current health judgement.
    pub async fn snapshot(&self) -> Health {
        let inner = self.inner.read().await;
        let healthy = inner.state == LifecycleState::Running
            && inner.stream_failures < self.failure_threshold
            && inner.acme_ready;
        Health {
            healthy,
            message: json!({
                "healthy": healthy,
                "details": {
                    "state": inner.state.as_str(),
                    "event_stream_failures": inner.stream_failures,
                    "acme_ready": inner.acme_ready,
                },
            }),
        }
    }
}

/// State shared with the axum routes.
#[derive(Clone)]
pub struct AppState {
    /// Token table for the challenge route
    pub responder: Http01Responder,
    /// Health status for the health route
    pub health: HealthState,
}

/// Build the router serving the public HTTP surface.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/.well-known/acme-challenge/:token", get(acme_challenge))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Response {
    let health = state.health.snapshot().await;
    let status = if health.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health.message)).into_response()
}

async fn acme_challenge(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Response {
    match state.responder.key_authorization_for(&token).await {
        Some(key_authorization) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain")],
            key_authorization,
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
