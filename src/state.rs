//! # Application State Management
//!
//! Shared state accessed by every HTTP request handler simultaneously.
//!
//! ## Layout:
//! - **config**: `Arc<RwLock<AppConfig>>` so the runtime config endpoint can
//!   swap it while readers keep going
//! - **metrics**: HTTP request/error counters behind the same pattern
//! - **registry**: the relay engine; it does its own (finer) locking, so the
//!   state only holds an `Arc` to it
//! - **start_time**: `Instant` is `Copy` and never changes, no lock needed
//!
//! Session counts are not tracked here. The registry is the source of truth
//! for live sessions and waiting peers, so the metrics endpoints read those
//! numbers from it directly instead of mirroring them.

use crate::config::AppConfig;
use crate::relay::registry::CallRegistry;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// The main application state shared across all HTTP request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// HTTP-surface metrics (updated by middleware on every request)
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// The pairing/relay engine
    pub registry: Arc<CallRegistry>,

    /// When the server started
    pub start_time: Instant,
}

/// Metrics collected across all HTTP requests.
#[derive(Debug, Default)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of errors encountered since server start
    pub error_count: u64,

    /// Per-endpoint statistics, keyed by "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Per-endpoint request statistics.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    /// Number of requests to this specific endpoint
    pub request_count: u64,

    /// Total time spent processing all requests to this endpoint (milliseconds)
    pub total_duration_ms: u64,

    /// Number of errors that occurred for this endpoint
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig, registry: Arc<CallRegistry>) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            registry,
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately so other threads aren't
    /// blocked; `AppConfig` is cheap to clone.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        match new_config.validate() {
            Ok(_) => {
                *self.config.write().unwrap() = new_config;
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    /// Increment the total request counter (middleware, every request).
    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.request_count += 1;
    }

    /// Increment the total error counter (4xx/5xx responses).
    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.error_count += 1;
    }

    /// Record one completed request against its endpoint bucket.
    ///
    /// ## Parameters:
    /// - **endpoint**: "METHOD /path" as reported by the metrics middleware
    /// - **duration_ms**: wall time the request took
    /// - **is_error**: whether the response status was 4xx/5xx
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();

        let endpoint_metric = metrics
            .endpoint_metrics
            .entry(endpoint.to_string())
            .or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;

        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Clone out the current metrics so the lock is not held while the
    /// response body is serialized.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap();
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    /// Average response time for this endpoint in milliseconds.
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate as a fraction (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::storage::SegmentStore;
    use std::time::Duration;
    use tempfile::tempdir;

    fn state() -> (AppState, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = SegmentStore::new(dir.path()).unwrap();
        let registry = Arc::new(CallRegistry::new(store, Duration::from_secs(10), 64));
        (AppState::new(AppConfig::default(), registry), dir)
    }

    #[test]
    fn endpoint_metrics_accumulate() {
        let (state, _dir) = state();
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let snapshot = state.get_metrics_snapshot();
        let metric = &snapshot.endpoint_metrics["GET /health"];
        assert_eq!(metric.request_count, 2);
        assert_eq!(metric.average_duration_ms(), 20.0);
        assert_eq!(metric.error_rate(), 0.5);
    }

    #[test]
    fn config_update_validates() {
        let (state, _dir) = state();
        let mut bad = AppConfig::default();
        bad.server.port = 0;
        assert!(state.update_config(bad).is_err());
        // Original config untouched.
        assert_eq!(state.get_config().server.port, 8080);
    }
}
