//! # Application State Management
//!
//! Shared state handed to every request handler: the live configuration,
//! request metrics, and the wired pipeline (store, notifier, ingestion
//! coordinator). Everything mutable sits behind `Arc<RwLock<_>>` so
//! concurrent handlers read without blocking each other and updates stay
//! consistent.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use crate::calls::IngestionCoordinator;
use crate::config::AppConfig;
use crate::notifier::Notifier;
use crate::store::CallStore;

/// State shared across all HTTP request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Live configuration; the processing knobs can change at runtime.
    pub config: Arc<RwLock<AppConfig>>,

    /// Request counters and per-endpoint latency, fed by middleware.
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started.
    pub start_time: Instant,

    pub store: Arc<dyn CallStore>,
    pub notifier: Arc<Notifier>,
    pub coordinator: Arc<IngestionCoordinator>,
}

/// Counters collected across all HTTP requests.
#[derive(Debug, Default)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    /// Currently open dashboard WebSocket connections.
    pub active_connections: u32,
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Per-endpoint request statistics.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(
        config: Arc<RwLock<AppConfig>>,
        store: Arc<dyn CallStore>,
        notifier: Arc<Notifier>,
        coordinator: Arc<IngestionCoordinator>,
    ) -> Self {
        Self {
            config,
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
            store,
            notifier,
            coordinator,
        }
    }

    /// Snapshot of the current configuration. Cloned so no lock is held
    /// while a handler works with it.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    /// Swap in a new configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        match new_config.validate() {
            Ok(_) => {
                *self.config.write().unwrap() = new_config;
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    pub fn increment_request_count(&self) {
        self.metrics.write().unwrap().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics.write().unwrap().error_count += 1;
    }

    /// Record one finished request against its endpoint.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn increment_active_connections(&self) {
        self.metrics.write().unwrap().active_connections += 1;
    }

    pub fn decrement_active_connections(&self) {
        let mut metrics = self.metrics.write().unwrap();
        if metrics.active_connections > 0 {
            metrics.active_connections -= 1;
        }
    }

    /// Clone out the metrics so serialization happens without the lock.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap();
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            active_connections: metrics.active_connections,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
