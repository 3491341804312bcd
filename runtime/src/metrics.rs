//! Prometheus metrics for the storefront backend.
//!
//! Metric families:
//! - Lock executor acquisitions, timeouts, wait and hold durations
//! - Optimistic retry conflicts and exhaustion
//! - Coupon issuance outcomes
//! - Order creation outcomes and event publication
//!
//! # Example
//!
//! ```rust,no_run
//! use storefront_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
}

/// Prometheus metrics server.
///
/// Installs the global recorder and serves `/metrics` on `addr`.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server bound to `addr` once started.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the recorder and spawn the HTTP listener.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Build`] if the exporter cannot be built or the
    /// listener address cannot be bound.
    ///
    /// # Note
    ///
    /// If a recorder is already installed (e.g., by an earlier test), the call
    /// logs a warning and succeeds without a handle.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        if metrics::set_global_recorder(recorder).is_err() {
            tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
            return Ok(());
        }

        tokio::spawn(async move {
            if exporter.await.is_err() {
                tracing::error!("Metrics exporter stopped");
            }
        });

        self.handle = Some(handle);
        tracing::info!(
            addr = %self.addr,
            "Metrics server started - available at http://{}/metrics",
            self.addr
        );
        Ok(())
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    describe_counter!("lock_acquired_total", "Lock sets acquired by the lock executor");
    describe_counter!(
        "lock_acquisition_timeouts_total",
        "Lock sets abandoned because a key stayed busy past the wait time"
    );
    describe_counter!(
        "lock_store_errors_total",
        "Coordination store failures seen by the lock executor"
    );
    describe_counter!(
        "lock_lease_lost_total",
        "Lease renewals refused because the holder no longer owned the key"
    );
    describe_histogram!(
        "lock_wait_duration_seconds",
        "Time spent acquiring a lock set"
    );
    describe_histogram!(
        "lock_hold_duration_seconds",
        "Time a lock set was held while its action ran"
    );

    describe_counter!(
        "optimistic_retry_conflicts_total",
        "Version conflicts seen by the optimistic retry executor"
    );
    describe_counter!(
        "optimistic_retry_successes_total",
        "Operations that succeeded after at least one conflict"
    );
    describe_counter!(
        "optimistic_retry_exhausted_total",
        "Operations that kept conflicting until max attempts"
    );

    describe_counter!("coupon_issued_total", "Coupon grants issued");
    describe_counter!(
        "coupon_issue_rejected_total",
        "Coupon issuance attempts rejected, labelled by reason"
    );
    describe_counter!("orders_created_total", "Orders created and paid");
    describe_counter!(
        "order_events_published_total",
        "Order completion events handed to the event bus"
    );
    describe_counter!(
        "order_event_publish_errors_total",
        "Order completion events the event bus refused"
    );
}

/// Lock executor metrics recorder.
pub struct LockMetrics;

impl LockMetrics {
    /// Record a fully acquired lock set.
    pub fn record_acquired(wait: Duration) {
        counter!("lock_acquired_total").increment(1);
        histogram!("lock_wait_duration_seconds").record(wait.as_secs_f64());
    }

    /// Record an acquisition that ran out of wait time.
    pub fn record_timeout(wait: Duration) {
        counter!("lock_acquisition_timeouts_total").increment(1);
        histogram!("lock_wait_duration_seconds").record(wait.as_secs_f64());
    }

    /// Record a coordination store failure.
    pub fn record_store_error() {
        counter!("lock_store_errors_total").increment(1);
    }

    /// Record a refused lease renewal.
    pub fn record_lease_lost() {
        counter!("lock_lease_lost_total").increment(1);
    }

    /// Record how long a lock set was held.
    pub fn record_held(hold: Duration) {
        histogram!("lock_hold_duration_seconds").record(hold.as_secs_f64());
    }
}

/// Optimistic retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a version conflict.
    pub fn record_conflict() {
        counter!("optimistic_retry_conflicts_total").increment(1);
    }

    /// Record a success after retry.
    pub fn record_success() {
        counter!("optimistic_retry_successes_total").increment(1);
    }

    /// Record exhausted attempts.
    pub fn record_exhausted() {
        counter!("optimistic_retry_exhausted_total").increment(1);
    }
}

/// Business outcome metrics recorder.
pub struct ShopMetrics;

impl ShopMetrics {
    /// Record an issued coupon grant.
    pub fn record_coupon_issued() {
        counter!("coupon_issued_total").increment(1);
    }

    /// Record a rejected issuance with its reason.
    pub fn record_coupon_rejected(reason: &'static str) {
        counter!("coupon_issue_rejected_total", "reason" => reason).increment(1);
    }

    /// Record a created order.
    pub fn record_order_created() {
        counter!("orders_created_total").increment(1);
    }

    /// Record an order event publication.
    pub fn record_event_published() {
        counter!("order_events_published_total").increment(1);
    }

    /// Record a failed order event publication.
    pub fn record_event_publish_error() {
        counter!("order_event_publish_errors_total").increment(1);
    }
}
