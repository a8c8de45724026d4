//! # Status Reporting
//!
//! Read-only snapshot of the lifecycle manager for the `/status` endpoint.
//! Snapshots are taken without the transition lock, so a load in progress
//! never blocks a status query; values may be momentarily stale.

use serde::Serialize;

/// Point-in-time view of the manager.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    /// "empty", "loading", or "ready"
    #[serde(rename = "status")]
    pub state: &'static str,
    /// Identifier of the resident model, if any
    pub current_model: Option<String>,
    /// Last successfully loaded identifier from the preference store
    pub saved_model: String,
    /// Device of the resident model, if any
    pub device: Option<String>,
    /// Compute type of the resident model, if any
    pub compute_type: Option<String>,
    pub accelerator_available: bool,
    pub accelerator_memory: AcceleratorMemory,
    pub model_loaded: bool,
    pub model_loading: bool,
    /// Unix timestamp of the last recorded activity
    pub last_activity: i64,
    /// Whether an idle-eviction timer is currently armed
    pub unload_scheduled: bool,
}

/// Accelerator memory counters in megabytes. Best-effort: zeroed when the
/// backend exposes no counters for the active device.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct AcceleratorMemory {
    pub allocated_mb: u64,
    pub reserved_mb: u64,
    pub total_mb: u64,
}

impl AcceleratorMemory {
    /// Counters for a device that exposes none.
    pub fn unavailable() -> Self {
        Self::default()
    }
}
