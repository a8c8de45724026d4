//! # Application State
//!
//! Shared state handed to every HTTP handler: the configuration, the model
//! lifecycle manager, and request metrics. Configuration sits behind
//! `Arc<RwLock<_>>` so handlers read it concurrently; the manager does its
//! own internal locking.

use crate::config::AppConfig;
use crate::lifecycle::ModelManager;
use std::sync::{Arc, RwLock};
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<AppConfig>>,
    pub manager: Arc<ModelManager>,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub start_time: Instant,
}

/// Counters accumulated across all requests since startup.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig, manager: Arc<ModelManager>) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            manager,
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// Copy of the current configuration; the lock is released immediately.
    pub fn get_config(&self) -> AppConfig {
        self.config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn record_request(&self, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap_or_else(|e| e.into_inner());
        metrics.request_count += 1;
        if is_error {
            metrics.error_count += 1;
        }
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
