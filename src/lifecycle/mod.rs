//! # Model Lifecycle Manager
//!
//! The single-slot model cache at the heart of the service. At most one model
//! is ever resident; it is loaded lazily on first use, kept warm across
//! requests, evicted after an idle period to reclaim device memory, and
//! degraded through a bounded fallback chain when a requested variant fails
//! to load.
//!
//! ## Locking Discipline:
//! - A transition mutex serializes every load, change, and eviction. At most
//!   one transition is ever in flight; concurrent callers block on the mutex
//!   rather than racing. Because the mutex fully brackets each transition,
//!   a transition can never observe another one in progress.
//! - The slot itself sits behind a short-lived read/write lock. The fast path
//!   and status snapshots only read it; transitions write it briefly when
//!   installing or clearing the resident model. Materialization happens
//!   outside the slot lock, so status queries never block on a load.
//!
//! ## Invariant:
//! A resident engine exists iff the slot holds one, and the manager always
//! ends every operation with the slot either populated (`Ready`) or empty
//! (`Empty`) - a failed load fully unwinds before any fallback attempt.

pub mod clock;
pub mod prefs;
pub mod scheduler;
pub mod status;

use crate::device::{ComputePreference, ComputeType, DeviceKind, DevicePreference};
use crate::engine::{EngineFactory, SpeechEngine, Transcript, TranscribeOptions};
use anyhow::{anyhow, Result};
use clock::ActivityClock;
use prefs::PreferenceStore;
use scheduler::EvictionScheduler;
use status::{AcceleratorMemory, StatusSnapshot};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tracing::{error, info, warn};

/// The model resource occupying the single slot.
struct Resident {
    engine: Arc<dyn SpeechEngine>,
    model: String,
    device: DeviceKind,
    compute: ComputeType,
}

/// Caller-facing view of the resident model, valid for one request.
///
/// Holds a reference to the engine so an eviction or model change during an
/// in-flight transcription cannot pull the resource out from under the
/// caller; device memory is reclaimed once the last handle drops. Handles
/// must not be retained past the request that obtained them.
pub struct ModelHandle {
    engine: Arc<dyn SpeechEngine>,
    model: String,
    device: DeviceKind,
    compute: ComputeType,
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("model", &self.model)
            .field("device", &self.device)
            .field("compute", &self.compute)
            .finish_non_exhaustive()
    }
}

impl ModelHandle {
    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn device(&self) -> DeviceKind {
        self.device
    }

    pub fn compute(&self) -> ComputeType {
        self.compute
    }

    /// Run inference on the resident engine. Blocking; call from a blocking
    /// thread when on an async runtime.
    pub fn transcribe(&self, samples: &[f32], options: &TranscribeOptions) -> Result<Transcript> {
        self.engine.transcribe(samples, options)
    }
}

/// Owns the single resident model slot and serializes its state transitions.
pub struct ModelManager {
    factory: Arc<dyn EngineFactory>,
    /// Short-lived lock; never held across materialization
    slot: RwLock<Option<Resident>>,
    /// Serializes load / change / evict end to end
    transition: tokio::sync::Mutex<()>,
    /// Status-only indicator that a transition is materializing a model
    loading: AtomicBool,
    clock: ActivityClock,
    scheduler: EvictionScheduler,
    prefs: PreferenceStore,
    unload_delay: Duration,
    device_pref: DevicePreference,
    compute_pref: ComputePreference,
    weak_self: Weak<ModelManager>,
}

impl ModelManager {
    /// Create an empty manager; no model is loaded until first use.
    pub fn new(
        factory: Arc<dyn EngineFactory>,
        prefs: PreferenceStore,
        device_pref: DevicePreference,
        compute_pref: ComputePreference,
        unload_delay: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            factory,
            slot: RwLock::new(None),
            transition: tokio::sync::Mutex::new(()),
            loading: AtomicBool::new(false),
            clock: ActivityClock::new(),
            scheduler: EvictionScheduler::new(),
            prefs,
            unload_delay,
            device_pref,
            compute_pref,
            weak_self: weak.clone(),
        })
    }

    /// Ensure `model` is resident and return a handle to it, using the
    /// configured device and compute preferences.
    pub async fn ensure_loaded(&self, model: &str) -> Result<ModelHandle> {
        self.ensure_loaded_with(model, self.device_pref, self.compute_pref)
            .await
    }

    /// Ensure `model` is resident with explicit preferences.
    ///
    /// Fast path: when the requested identifier is already resident, no
    /// transition lock is taken. Slow path: serialize on the transition
    /// mutex, re-check (another caller may have just loaded the same model),
    /// then release the old resident and materialize the new one, walking
    /// the degradation chain on failure.
    pub async fn ensure_loaded_with(
        &self,
        model: &str,
        device_pref: DevicePreference,
        compute_pref: ComputePreference,
    ) -> Result<ModelHandle> {
        if let Some(handle) = self.resident_handle(model) {
            self.record_activity();
            return Ok(handle);
        }

        let _guard = self.transition.lock().await;
        if let Some(handle) = self.resident_handle(model) {
            self.record_activity();
            return Ok(handle);
        }
        self.load_locked(model, device_pref, compute_pref).await
    }

    /// Force a model change. Always takes the slow path: the only shortcut
    /// is the under-lock re-check for an identical resident identifier.
    pub async fn change_model(&self, model: &str) -> Result<ModelHandle> {
        let _guard = self.transition.lock().await;
        if let Some(handle) = self.resident_handle(model) {
            self.record_activity();
            return Ok(handle);
        }
        self.load_locked(model, self.device_pref, self.compute_pref).await
    }

    /// Resolve the effective model for a request: explicit choice, then the
    /// resident model, then the persisted preference.
    pub fn resolve_model(&self, requested: Option<&str>) -> String {
        if let Some(model) = requested {
            if !model.trim().is_empty() {
                return model.to_string();
            }
        }
        {
            let slot = self.slot.read().unwrap_or_else(|e| e.into_inner());
            if let Some(resident) = slot.as_ref() {
                return resident.model.clone();
            }
        }
        self.prefs.load()
    }

    /// Touch the activity clock without rearming the eviction timer. Used by
    /// the liveness endpoint, which counts as activity but must not extend
    /// the life of an idle model on its own.
    pub fn touch(&self) {
        self.clock.touch();
    }

    /// Record real activity: touch the clock and, when a model is resident,
    /// restart the idle-eviction countdown.
    pub fn record_activity(&self) {
        self.clock.touch();
        let resident = {
            let slot = self.slot.read().unwrap_or_else(|e| e.into_inner());
            slot.is_some()
        };
        if resident {
            self.arm_eviction();
        }
    }

    /// Release the resident model and reclaim its device memory. Invoked by
    /// the eviction timer; the persisted preference is deliberately left
    /// untouched so the next request reloads the same model by default.
    pub async fn evict(&self) {
        let _guard = self.transition.lock().await;
        let previous = {
            let mut slot = self.slot.write().unwrap_or_else(|e| e.into_inner());
            slot.take()
        };
        if let Some(resident) = previous {
            info!(
                "Evicting idle model {} after {}s of inactivity",
                resident.model,
                self.clock.idle_secs()
            );
            self.release(resident);
        }
    }

    /// Lock-free status snapshot; may be momentarily stale.
    pub fn status(&self) -> StatusSnapshot {
        let (current_model, device, compute_type) = {
            let slot = self.slot.read().unwrap_or_else(|e| e.into_inner());
            match slot.as_ref() {
                Some(r) => (
                    Some(r.model.clone()),
                    Some(r.device.as_str().to_string()),
                    Some(r.compute.as_str().to_string()),
                ),
                None => (None, None, None),
            }
        };
        let model_loaded = current_model.is_some();
        let model_loading = self.loading.load(Ordering::SeqCst);
        let state = if model_loading {
            "loading"
        } else if model_loaded {
            "ready"
        } else {
            "empty"
        };

        StatusSnapshot {
            state,
            current_model,
            saved_model: self.prefs.load(),
            device,
            compute_type,
            accelerator_available: crate::device::accelerator_available(),
            // Candle exposes no allocator counters; report zeros per the
            // best-effort contract
            accelerator_memory: AcceleratorMemory::unavailable(),
            model_loaded,
            model_loading,
            last_activity: self.clock.last_activity_unix(),
            unload_scheduled: self.scheduler.is_armed(),
        }
    }

    /// Handle for the resident model when its identifier matches.
    fn resident_handle(&self, model: &str) -> Option<ModelHandle> {
        let slot = self.slot.read().unwrap_or_else(|e| e.into_inner());
        slot.as_ref()
            .filter(|resident| resident.model == model)
            .map(|resident| ModelHandle {
                engine: resident.engine.clone(),
                model: resident.model.clone(),
                device: resident.device,
                compute: resident.compute,
            })
    }

    /// The slow path. Caller must hold the transition mutex.
    async fn load_locked(
        &self,
        requested: &str,
        device_pref: DevicePreference,
        compute_pref: ComputePreference,
    ) -> Result<ModelHandle> {
        // Release the current resident before materializing a replacement.
        // This runs even though the new load may fail: a failed load must
        // leave the slot Empty, never Ready with a stale identifier.
        let previous = {
            let mut slot = self.slot.write().unwrap_or_else(|e| e.into_inner());
            slot.take()
        };
        if let Some(resident) = previous {
            info!("Unloading model {} to load {}", resident.model, requested);
            self.release(resident);
        }
        self.scheduler.cancel();

        let device = device_pref.resolve();
        let compute = compute_pref.resolve(device);
        info!(
            "Loading model {} on {} with {}",
            requested, device, compute
        );

        self.loading.store(true, Ordering::SeqCst);
        let result = self
            .materialize_with_fallback(requested, device, compute)
            .await;
        self.loading.store(false, Ordering::SeqCst);

        match result {
            Ok(resident) => {
                let handle = ModelHandle {
                    engine: resident.engine.clone(),
                    model: resident.model.clone(),
                    device: resident.device,
                    compute: resident.compute,
                };
                let loaded_model = resident.model.clone();
                {
                    let mut slot = self.slot.write().unwrap_or_else(|e| e.into_inner());
                    *slot = Some(resident);
                }
                self.prefs.save(&loaded_model);
                self.clock.touch();
                self.arm_eviction();
                info!("Model {} loaded successfully", loaded_model);
                Ok(handle)
            }
            Err(e) => {
                error!("Failed to load model {}: {}", requested, e);
                Err(e)
            }
        }
    }

    /// Walk the degradation chain until a materialization succeeds or the
    /// chain is exhausted. The chain is a fixed table, bounded to at most two
    /// fallback attempts; fallback identifiers never restart the chain.
    async fn materialize_with_fallback(
        &self,
        requested: &str,
        device: DeviceKind,
        compute: ComputeType,
    ) -> Result<Resident> {
        let mut last_error = None;

        for attempt in degradation_chain(requested) {
            if last_error.is_some() {
                info!("Falling back to {} after load failure", attempt);
            }

            let factory = self.factory.clone();
            let model = attempt.clone();
            let outcome = tokio::task::spawn_blocking(move || {
                factory.materialize(&model, device, compute)
            })
            .await
            .map_err(|e| anyhow!("Model load task panicked: {}", e))?;

            match outcome {
                Ok(engine) => {
                    return Ok(Resident {
                        engine,
                        model: attempt,
                        device,
                        compute,
                    });
                }
                Err(e) => {
                    warn!("Materialization of {} failed: {}", attempt, e);
                    last_error = Some(e);
                }
            }
        }

        let cause = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no materialization attempted".to_string());
        Err(anyhow!("Error loading model {}: {}", requested, cause))
    }

    /// Drop a resident model and force device-memory reclamation.
    fn release(&self, resident: Resident) {
        let device = resident.device;
        drop(resident);
        self.factory.reclaim(device);
    }

    /// (Re)start the idle-eviction countdown from now.
    fn arm_eviction(&self) {
        let weak = self.weak_self.clone();
        self.scheduler.arm(self.unload_delay, async move {
            if let Some(manager) = weak.upgrade() {
                manager.evict().await;
            }
        });
    }
}

/// The fixed degradation table: identifiers starting with "large" retry as
/// "medium" then "small"; "medium" retries as "small"; everything else gets
/// no fallback. Returned chains always start with the requested identifier.
fn degradation_chain(requested: &str) -> Vec<String> {
    let mut chain = vec![requested.to_string()];
    if requested.starts_with("large") {
        chain.push("medium".to_string());
        chain.push("small".to_string());
    } else if requested.starts_with("medium") {
        chain.push("small".to_string());
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    /// Engine stand-in that produces an empty transcript.
    struct NullEngine;

    impl SpeechEngine for NullEngine {
        fn transcribe(
            &self,
            samples: &[f32],
            _options: &TranscribeOptions,
        ) -> Result<Transcript> {
            Ok(Transcript {
                segments: Vec::new(),
                language: "en".to_string(),
                language_probability: 1.0,
                duration: samples.len() as f64 / 16_000.0,
            })
        }
    }

    /// Factory recording every materialization attempt, with per-identifier
    /// failure injection and an optional artificial load delay.
    struct MockFactory {
        failing: HashSet<String>,
        attempts: Mutex<Vec<String>>,
        materializations: AtomicUsize,
        reclaims: AtomicUsize,
        load_delay: Option<Duration>,
    }

    impl MockFactory {
        fn new() -> Self {
            Self {
                failing: HashSet::new(),
                attempts: Mutex::new(Vec::new()),
                materializations: AtomicUsize::new(0),
                reclaims: AtomicUsize::new(0),
                load_delay: None,
            }
        }

        fn failing(mut self, models: &[&str]) -> Self {
            self.failing = models.iter().map(|m| m.to_string()).collect();
            self
        }

        fn with_load_delay(mut self, delay: Duration) -> Self {
            self.load_delay = Some(delay);
            self
        }

        fn attempts(&self) -> Vec<String> {
            self.attempts.lock().unwrap().clone()
        }

        fn materialization_count(&self) -> usize {
            self.materializations.load(Ordering::SeqCst)
        }
    }

    impl EngineFactory for MockFactory {
        fn materialize(
            &self,
            model: &str,
            _device: DeviceKind,
            _compute: ComputeType,
        ) -> Result<Arc<dyn SpeechEngine>> {
            self.attempts.lock().unwrap().push(model.to_string());
            if let Some(delay) = self.load_delay {
                std::thread::sleep(delay);
            }
            if self.failing.contains(model) {
                return Err(anyhow!("injected failure for {}", model));
            }
            self.materializations.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(NullEngine))
        }

        fn reclaim(&self, _device: DeviceKind) {
            self.reclaims.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_prefs(name: &str) -> PreferenceStore {
        let path = std::env::temp_dir().join(format!(
            "whisper-stt-manager-{}-{}.json",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        PreferenceStore::new(path, "base")
    }

    fn manager_with(factory: Arc<MockFactory>, prefs: PreferenceStore) -> Arc<ModelManager> {
        ModelManager::new(
            factory,
            prefs,
            DevicePreference::Cpu,
            ComputePreference::Auto,
            Duration::from_secs(3600),
        )
    }

    #[test]
    fn test_degradation_chain_table() {
        assert_eq!(degradation_chain("large-foo"), vec!["large-foo", "medium", "small"]);
        assert_eq!(degradation_chain("large-v3-turbo"), vec!["large-v3-turbo", "medium", "small"]);
        assert_eq!(degradation_chain("medium.en"), vec!["medium.en", "small"]);
        assert_eq!(degradation_chain("tiny"), vec!["tiny"]);
        assert_eq!(degradation_chain("base"), vec!["base"]);
    }

    #[tokio::test]
    async fn test_lazy_load_and_fast_path_reuse() {
        let factory = Arc::new(MockFactory::new());
        let manager = manager_with(factory.clone(), test_prefs("fastpath"));

        assert_eq!(manager.status().state, "empty");

        let handle = manager.ensure_loaded("base").await.unwrap();
        assert_eq!(handle.model(), "base");
        assert_eq!(factory.materialization_count(), 1);
        assert_eq!(manager.status().state, "ready");

        // Second request for the same identifier takes the fast path
        let handle = manager.ensure_loaded("base").await.unwrap();
        assert_eq!(handle.model(), "base");
        assert_eq!(factory.materialization_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_same_identifier_materializes_once() {
        let factory =
            Arc::new(MockFactory::new().with_load_delay(Duration::from_millis(50)));
        let manager = manager_with(factory.clone(), test_prefs("concurrent"));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move {
                manager.ensure_loaded("small").await.unwrap().model().to_string()
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap(), "small");
        }
        assert_eq!(factory.materialization_count(), 1);
    }

    #[tokio::test]
    async fn test_fallback_chain_for_large_identifier() {
        let factory = Arc::new(MockFactory::new().failing(&["large-v3", "medium"]));
        let manager = manager_with(factory.clone(), test_prefs("fallback-large"));

        let handle = manager.ensure_loaded("large-v3").await.unwrap();
        assert_eq!(handle.model(), "small");
        assert_eq!(factory.attempts(), vec!["large-v3", "medium", "small"]);
        // The succeeding identifier, not the requested one, is persisted
        assert_eq!(manager.resolve_model(None), "small");
    }

    #[tokio::test]
    async fn test_exhausted_chain_surfaces_terminal_error() {
        let factory =
            Arc::new(MockFactory::new().failing(&["large-foo", "medium", "small"]));
        let manager = manager_with(factory.clone(), test_prefs("fallback-exhausted"));

        let err = manager.ensure_loaded("large-foo").await.unwrap_err();
        assert!(err.to_string().contains("large-foo"));
        // Exactly two fallback attempts, then terminal
        assert_eq!(factory.attempts(), vec!["large-foo", "medium", "small"]);
        // Manager unwound fully to Empty, never stuck in Loading
        let status = manager.status();
        assert_eq!(status.state, "empty");
        assert!(!status.model_loading);
    }

    #[tokio::test]
    async fn test_unrecognized_identifier_gets_zero_fallbacks() {
        let factory = Arc::new(MockFactory::new().failing(&["tiny"]));
        let manager = manager_with(factory.clone(), test_prefs("no-fallback"));

        assert!(manager.ensure_loaded("tiny").await.is_err());
        assert_eq!(factory.attempts(), vec!["tiny"]);
    }

    #[tokio::test]
    async fn test_failed_load_does_not_update_preference() {
        let prefs = test_prefs("pref-on-failure");
        prefs.save("base");
        let factory = Arc::new(MockFactory::new().failing(&["tiny"]));
        let manager = manager_with(factory, prefs);

        assert!(manager.ensure_loaded("tiny").await.is_err());
        assert_eq!(manager.resolve_model(None), "base");
    }

    #[tokio::test]
    async fn test_change_model_replaces_resident() {
        let factory = Arc::new(MockFactory::new());
        let manager = manager_with(factory.clone(), test_prefs("change"));

        manager.ensure_loaded("base").await.unwrap();
        let handle = manager.change_model("small").await.unwrap();
        assert_eq!(handle.model(), "small");
        assert_eq!(factory.materialization_count(), 2);
        assert_eq!(factory.reclaims.load(Ordering::SeqCst), 1);
        assert_eq!(manager.status().current_model.as_deref(), Some("small"));

        // Changing to the already-resident model is a no-op under the lock
        manager.change_model("small").await.unwrap();
        assert_eq!(factory.materialization_count(), 2);
    }

    #[tokio::test]
    async fn test_eviction_then_reload_rematerializes() {
        let factory = Arc::new(MockFactory::new());
        let manager = manager_with(factory.clone(), test_prefs("evict"));

        manager.ensure_loaded("base").await.unwrap();
        manager.evict().await;

        let status = manager.status();
        assert_eq!(status.state, "empty");
        assert!(status.current_model.is_none());
        // Eviction never touches the preference
        assert_eq!(status.saved_model, "base");

        manager.ensure_loaded("base").await.unwrap();
        assert_eq!(factory.materialization_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_idle_timer_evicts_resident_model() {
        let factory = Arc::new(MockFactory::new());
        let manager = ModelManager::new(
            factory.clone(),
            test_prefs("idle"),
            DevicePreference::Cpu,
            ComputePreference::Auto,
            Duration::from_millis(50),
        );

        manager.ensure_loaded("base").await.unwrap();
        assert!(manager.status().unload_scheduled);

        tokio::time::sleep(Duration::from_millis(150)).await;
        let status = manager.status();
        assert_eq!(status.state, "empty");
        assert_eq!(status.saved_model, "base");
    }

    #[tokio::test]
    async fn test_preference_drives_default_model_resolution() {
        let prefs = test_prefs("resolve");
        prefs.save("small");
        let factory = Arc::new(MockFactory::new());
        let manager = manager_with(factory.clone(), prefs);

        // No explicit model, nothing resident: preference wins
        assert_eq!(manager.resolve_model(None), "small");

        manager.ensure_loaded("base").await.unwrap();
        // Resident model now takes precedence over the preference file
        assert_eq!(manager.resolve_model(None), "base");
        // Explicit choice always wins
        assert_eq!(manager.resolve_model(Some("medium")), "medium");
        assert_eq!(manager.resolve_model(Some("  ")), "base");
    }

    #[tokio::test]
    async fn test_handle_survives_eviction_of_its_model() {
        let factory = Arc::new(MockFactory::new());
        let manager = manager_with(factory.clone(), test_prefs("handle"));

        let handle = manager.ensure_loaded("base").await.unwrap();
        manager.evict().await;

        // The slot is empty but the in-flight handle still works
        assert_eq!(manager.status().state, "empty");
        let transcript = handle.transcribe(&[0.0f32; 16_000], &TranscribeOptions::default());
        assert!(transcript.is_ok());
    }
}
