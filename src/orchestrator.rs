//! Orchestrator: process lifecycle and the main event loop
//!
//! Couples the Marathon event stream, the optional periodic timer, and the
//! startup sync to the reconciler, and owns the lifecycle state machine
//! (`INIT → STARTING → RUNNING → STOPPING → STOPPED`).
//!
//! Sync triggers are funnelled through a bounded channel of depth one
//! consumed by a single worker task: at most one sync runs at a time, and
//! while one is running at most one more is queued — further triggers
//! coalesce into it. The event stream reconnects with jittered exponential
//! backoff (base 1 s, cap 60 s) and feeds a consecutive-failure counter
//! into the health state.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::acme::{AcmeIssuer, RENEWAL_CHECK_INTERVAL};
use crate::clients::{MarathonClient, MarathonEvent};
use crate::config::Config;
use crate::reconciler::Reconciler;
use crate::responder::Http01Responder;
use crate::server::{router, AppState, HealthState, LifecycleState};

/// Why a sync was requested; logged by the sync worker.
#[derive(Debug, Clone, Copy)]
pub enum SyncReason {
    /// An `api_post_event` arrived on the Marathon event stream
    Event,
    /// The periodic timer fired
    Timer,
}

/// Jittered exponential backoff for event-stream reconnects.
///
/// The delay doubles per consecutive failure from `base` up to `cap`, then
/// a uniform jitter scales it into `[0.5, 1.0]` of the capped value so a
/// fleet of instances does not reconnect in lockstep.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    /// Create a backoff starting at `base` and capped at `cap`.
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// Forget accumulated failures after a successful connect.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// The next delay to wait before reconnecting.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(self.attempt.min(16)));
        let capped = exp.min(self.cap);
        self.attempt = self.attempt.saturating_add(1);
        capped.mul_f64(rand::random_range(0.5..=1.0))
    }
}

/// Owns the main loop wiring all components together.
pub struct Orchestrator {
    config: Config,
    marathon: Arc<MarathonClient>,
    reconciler: Arc<Reconciler>,
    acme: Arc<dyn AcmeIssuer>,
    responder: Http01Responder,
    health: HealthState,
}

impl Orchestrator {
    /// Wire the orchestrator. Nothing starts until [`run`](Self::run).
    pub fn new(
        config: Config,
        marathon: Arc<MarathonClient>,
        reconciler: Arc<Reconciler>,
        acme: Arc<dyn AcmeIssuer>,
        responder: Http01Responder,
        health: HealthState,
    ) -> Self {
        Self {
            config,
            marathon,
            reconciler,
            acme,
            responder,
            health,
        }
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Startup order: bind the HTTP server (bind failure is fatal), wait
    /// for the ACME service, run an initial sync, then open the event
    /// stream. On shutdown the in-flight sync gets the configured grace
    /// period to finish before being aborted.
    pub async fn run(self, shutdown: CancellationToken) -> crate::error::Result<()> {
        self.health.set_state(LifecycleState::Starting).await;
        info!(listen = %self.config.listen, "Starting marathon-acme");

        let listener = TcpListener::bind(self.config.listen)
            .await
            .with_context(|| format!("failed to bind HTTP server on {}", self.config.listen))?;
        let app = router(AppState {
            responder: self.responder.clone(),
            health: self.health.clone(),
        });
        let server_shutdown = shutdown.clone();
        let server_task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(server_shutdown.cancelled_owned())
                .await
        });

        // Account registration problems at startup are fatal.
        self.acme
            .when_ready()
            .await
            .context("ACME issuing service failed to become ready")?;
        self.health.set_acme_ready(true).await;

        info!("Running initial sync");
        self.reconciler
            .sync()
            .await
            .context("initial sync failed")?;

        self.health.set_state(LifecycleState::Running).await;

        // Depth-1 channel: one sync in flight, at most one queued.
        let (sync_tx, mut sync_rx) = mpsc::channel::<SyncReason>(1);
        let worker_reconciler = Arc::clone(&self.reconciler);
        let worker_shutdown = shutdown.clone();
        let mut sync_worker = tokio::spawn(async move {
            loop {
                let reason = tokio::select! {
                    _ = worker_shutdown.cancelled() => break,
                    reason = sync_rx.recv() => match reason {
                        Some(reason) => reason,
                        None => break,
                    },
                };
                info!(reason = ?reason, "Starting a sync");
                if let Err(e) = worker_reconciler.sync().await {
                    // The next trigger retries; RUNNING is kept.
                    error!(error = %e, "Sync failed");
                }
            }
        });

        let timer_task = self.config.poll_interval.map(|interval| {
            let tx = sync_tx.clone();
            let timer_shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = timer_shutdown.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {
                            let _ = tx.try_send(SyncReason::Timer);
                        }
                    }
                }
            })
        });

        let renewal_task = (self.config.renewal_days > 0).then(|| {
            let acme = Arc::clone(&self.acme);
            let renewal_shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = renewal_shutdown.cancelled() => break,
                        _ = tokio::time::sleep(RENEWAL_CHECK_INTERVAL) => {
                            match acme.check_renewals().await {
                                Ok(renewed) if !renewed.is_empty() => {
                                    info!(count = renewed.len(), domains = ?renewed, "Renewed certificates");
                                }
                                Ok(_) => {}
                                Err(e) => error!(error = %e, "Certificate renewal sweep failed"),
                            }
                        }
                    }
                }
            })
        });

        self.event_loop(&shutdown, &sync_tx).await;

        // Controlled shutdown: stop accepting triggers, let the in-flight
        // sync finish within the grace period, then tear everything down.
        self.health.set_state(LifecycleState::Stopping).await;
        warn!("Stopping marathon-acme");
        shutdown.cancel();
        drop(sync_tx);

        let grace = self.config.shutdown_grace;
        if tokio::time::timeout(grace, &mut sync_worker).await.is_err() {
            warn!("Sync did not finish within the shutdown grace period, aborting");
            sync_worker.abort();
        }
        if let Some(task) = timer_task {
            task.abort();
        }
        if let Some(task) = renewal_task {
            task.abort();
        }
        match tokio::time::timeout(grace, server_task).await {
            Ok(Ok(Err(e))) => warn!(error = %e, "HTTP server shut down with an error"),
            Ok(_) => {}
            Err(_) => warn!("HTTP server did not shut down within the grace period"),
        }

        self.health.set_state(LifecycleState::Stopped).await;
        info!("marathon-acme stopped");
        Ok(())
    }

    /// Request a sync for a received Marathon event.
    fn schedule_event_sync(&self, event: &MarathonEvent, sync_tx: &mpsc::Sender<SyncReason>) {
        let timestamp = event
            .data
            .get("timestamp")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        info!(timestamp = %timestamp, "Sync triggered by Marathon event");
        // A full queue means a sync is already pending; this trigger
        // coalesces into it.
        let _ = sync_tx.try_send(SyncReason::Event);
    }

    /// Keep the Marathon event stream open, scheduling a sync for every
    /// subscribed event, until `shutdown` is cancelled.
    async fn event_loop(&self, shutdown: &CancellationToken, sync_tx: &mpsc::Sender<SyncReason>) {
        let event_types = vec!["api_post_event".to_string()];
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));

        loop {
            if shutdown.is_cancelled() {
                return;
            }

            match self.marathon.open_event_stream(&event_types).await {
                Ok(stream) => {
                    info!("Listening for events from Marathon");
                    self.health.reset_stream_failures().await;
                    backoff.reset();

                    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
                    let run_fut = stream.run(events_tx);
                    tokio::pin!(run_fut);

                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => return,
                            result = &mut run_fut => {
                                // Events delivered before the close still
                                // count; drain them in wire order.
                                while let Ok(event) = events_rx.try_recv() {
                                    self.schedule_event_sync(&event, sync_tx);
                                }
                                match result {
                                    Ok(()) => warn!("Marathon event stream closed"),
                                    Err(e) => warn!(error = %e, "Marathon event stream failed"),
                                }
                                break;
                            }
                            Some(event) = events_rx.recv() => {
                                self.schedule_event_sync(&event, sync_tx);
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Could not connect to the Marathon event stream");
                }
            }

            let failures = self.health.record_stream_failure().await;
            let delay = backoff.next_delay();
            warn!(
                consecutive_failures = failures,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting to the Marathon event stream after backoff"
            );
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        let expected_caps = [1u64, 2, 4, 8, 16, 32, 60, 60, 60];
        for cap in expected_caps {
            let delay = backoff.next_delay();
            assert!(delay <= Duration::from_secs(cap), "{:?} > {}s", delay, cap);
            assert!(
                delay >= Duration::from_secs(cap).mul_f64(0.5),
                "{:?} < half of {}s",
                delay,
                cap
            );
        }
    }

    #[test]
    fn test_backoff_reset_starts_over() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        for _ in 0..6 {
            backoff.next_delay();
        }
        backoff.reset();
        assert!(backoff.next_delay() <= Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_never_overflows() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        for _ in 0..1000 {
            assert!(backoff.next_delay() <= Duration::from_secs(60));
        }
    }

    #[tokio::test]
    async fn test_sync_trigger_queue_coalesces() {
        // The depth-1 channel accepts one queued trigger and drops the rest.
        let (tx, mut rx) = mpsc::channel::<SyncReason>(1);
        assert!(tx.try_send(SyncReason::Event).is_ok());
        assert!(tx.try_send(SyncReason::Event).is_err());
        assert!(tx.try_send(SyncReason::Timer).is_err());

        assert!(matches!(rx.recv().await, Some(SyncReason::Event)));
        assert!(tx.try_send(SyncReason::Timer).is_ok());
    }
}
