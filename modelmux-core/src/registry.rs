use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use tracing::{info, warn};

use crate::backend::{LoadedModel, ModelLoader};
use crate::device::{OccupancyTable, Residency};
use crate::error::ServeError;
use crate::request::{ChatTurn, GenerationJob};

/// Opaque, externally supplied model identifier; the key for every map in
/// the system.
pub type ModelId = String;

/// A resident model: the loaded handles plus the device they were placed on.
/// Immutable once created; residency never changes for a session's lifetime.
pub struct ModelSession {
    model_id: ModelId,
    residency: Residency,
    loaded: LoadedModel,
}

impl ModelSession {
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn residency(&self) -> Residency {
        self.residency
    }

    /// Renders the conversation into the prompt the generator consumes.
    pub fn render(&self, history: &[ChatTurn]) -> anyhow::Result<String> {
        self.loaded.formatter.render(history)
    }

    /// Runs the generation capability. Callers must hold the session's lease,
    /// which is what keeps generations for one model from overlapping.
    pub fn generate(&self, prompt: &str, job: &GenerationJob) -> anyhow::Result<String> {
        self.loaded.generator.generate(prompt, job)
    }
}

struct Resident {
    session: Arc<ModelSession>,
    last_used: Instant,
    busy: bool,
}

enum Slot {
    /// Reserved: placement is decided and counted by the occupancy table,
    /// but the load is still running outside the lock.
    Loading,
    Ready(Resident),
}

struct RegistryState {
    sessions: IndexMap<ModelId, Slot>,
    occupancy: OccupancyTable,
}

struct Shared {
    state: Mutex<RegistryState>,
    settled: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, RegistryState>) -> MutexGuard<'a, RegistryState> {
        self.settled.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive use of one session. Holding a lease marks the slot busy, which
/// keeps the reaper away and blocks other acquirers of the same model until
/// the lease drops (releasing the slot and refreshing its last-used time).
pub struct SessionLease {
    session: Arc<ModelSession>,
    shared: Arc<Shared>,
}

impl std::ops::Deref for SessionLease {
    type Target = ModelSession;

    fn deref(&self) -> &ModelSession {
        &self.session
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        if let Some(Slot::Ready(resident)) = state.sessions.get_mut(self.session.model_id()) {
            resident.busy = false;
            resident.last_used = Instant::now();
        }
        drop(state);
        self.shared.settled.notify_all();
    }
}

/// A point-in-time view of one resident session, for the models listing.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub model_id: ModelId,
    pub residency: Residency,
    pub idle: Duration,
}

/// Owns every piece of shared placement state: the session map and the
/// device occupancy table, serialized by one mutex. Only the bookkeeping
/// runs under that mutex; the slow load for a cold model runs outside it so
/// one cold start never stalls placement for other models.
pub struct ModelRegistry {
    shared: Arc<Shared>,
    loader: Arc<dyn ModelLoader>,
}

impl ModelRegistry {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        let occupancy = OccupancyTable::new(loader.device_count());
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(RegistryState {
                    sessions: IndexMap::new(),
                    occupancy,
                }),
                settled: Condvar::new(),
            }),
            loader,
        }
    }

    /// Returns a lease on the model's session, loading it first if it is not
    /// resident. Blocks while the session is mid-load or leased to another
    /// caller. Fails with [`ServeError::LoadFailure`] if the load fails, in
    /// which case the registry is exactly as it was before the call.
    pub fn acquire(&self, model_id: &str) -> Result<SessionLease, ServeError> {
        let residency = {
            let mut state = self.shared.lock();
            loop {
                match state.sessions.get_mut(model_id) {
                    Some(Slot::Ready(resident)) if !resident.busy => {
                        resident.busy = true;
                        resident.last_used = Instant::now();
                        return Ok(SessionLease {
                            session: resident.session.clone(),
                            shared: self.shared.clone(),
                        });
                    }
                    Some(_) => {
                        state = self.shared.wait(state);
                    }
                    None => {
                        let residency = state.occupancy.place();
                        if let Residency::Device(index) = residency {
                            if state.occupancy.is_free(residency) {
                                info!("Found free device cuda:{index} for `{model_id}`.");
                            } else {
                                info!("All devices occupied. Placing `{model_id}` on cuda:{index}.");
                            }
                        }
                        state.occupancy.insert(residency, model_id);
                        state.sessions.insert(model_id.to_string(), Slot::Loading);
                        break residency;
                    }
                }
            }
        };

        info!("Loading model `{model_id}` onto {residency}...");
        let started = Instant::now();
        let loaded = self.loader.load(model_id, residency);

        let mut state = self.shared.lock();
        match loaded {
            Ok(loaded) => {
                let session = Arc::new(ModelSession {
                    model_id: model_id.to_string(),
                    residency,
                    loaded,
                });
                state.sessions.insert(
                    model_id.to_string(),
                    Slot::Ready(Resident {
                        session: session.clone(),
                        last_used: Instant::now(),
                        busy: true,
                    }),
                );
                drop(state);
                self.shared.settled.notify_all();
                info!(
                    "Loaded `{model_id}` onto {residency} in {:.2?}.",
                    started.elapsed()
                );
                Ok(SessionLease {
                    session,
                    shared: self.shared.clone(),
                })
            }
            Err(cause) => {
                state.sessions.shift_remove(model_id);
                state.occupancy.remove(residency, model_id);
                drop(state);
                self.shared.settled.notify_all();
                warn!("Error loading model `{model_id}`: {cause:#}");
                Err(ServeError::load_failure(model_id, cause))
            }
        }
    }

    /// Refreshes the session's last-used time. A no-op for models that are
    /// not resident.
    pub fn touch(&self, model_id: &str) {
        let mut state = self.shared.lock();
        if let Some(Slot::Ready(resident)) = state.sessions.get_mut(model_id) {
            resident.last_used = Instant::now();
        }
    }

    /// Removes every session idle for longer than `timeout` and frees its
    /// occupancy entry, returning the evicted ids. Slots that are mid-load or
    /// leased out are never candidates, so an in-flight generation cannot
    /// have its session evicted out from under it.
    pub fn evict_idle(&self, now: Instant, timeout: Duration) -> Vec<ModelId> {
        let mut state = self.shared.lock();
        let expired: Vec<ModelId> = state
            .sessions
            .iter()
            .filter_map(|(model_id, slot)| match slot {
                Slot::Ready(resident)
                    if !resident.busy
                        && now.saturating_duration_since(resident.last_used) > timeout =>
                {
                    Some(model_id.clone())
                }
                _ => None,
            })
            .collect();
        for model_id in &expired {
            if let Some(Slot::Ready(resident)) = state.sessions.shift_remove(model_id) {
                state.occupancy.remove(resident.session.residency(), model_id);
                info!("Unloading model `{model_id}` (inactive).");
            }
        }
        expired
    }

    /// Resident sessions in load order. Mid-load slots are omitted.
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let state = self.shared.lock();
        let now = Instant::now();
        state
            .sessions
            .iter()
            .filter_map(|(model_id, slot)| match slot {
                Slot::Ready(resident) => Some(SessionInfo {
                    model_id: model_id.clone(),
                    residency: resident.session.residency(),
                    idle: now.saturating_duration_since(resident.last_used),
                }),
                Slot::Loading => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ChatFormatter, TextGenerator};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;

    struct StubGenerator;

    impl TextGenerator for StubGenerator {
        fn generate(&self, prompt: &str, _job: &GenerationJob) -> anyhow::Result<String> {
            Ok(prompt.to_string())
        }
    }

    struct StubFormatter;

    impl ChatFormatter for StubFormatter {
        fn render(&self, history: &[ChatTurn]) -> anyhow::Result<String> {
            Ok(history
                .iter()
                .map(|turn| turn.content.clone())
                .collect::<Vec<_>>()
                .join("\n"))
        }
    }

    struct CountingLoader {
        devices: usize,
        loads: AtomicUsize,
        fail: AtomicBool,
        delay: Option<Duration>,
    }

    impl CountingLoader {
        fn new(devices: usize) -> Self {
            Self {
                devices,
                loads: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
                delay: None,
            }
        }

        fn with_delay(devices: usize, delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::new(devices)
            }
        }

        fn loads(&self) -> usize {
            self.loads.load(Ordering::SeqCst)
        }
    }

    impl ModelLoader for CountingLoader {
        fn device_count(&self) -> usize {
            self.devices
        }

        fn load(&self, model_id: &str, _residency: Residency) -> anyhow::Result<LoadedModel> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                thread::sleep(delay);
            }
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("no weights found for {model_id}");
            }
            Ok(LoadedModel {
                generator: Arc::new(StubGenerator),
                formatter: Arc::new(StubFormatter),
            })
        }
    }

    fn registry_with(loader: Arc<CountingLoader>) -> ModelRegistry {
        ModelRegistry::new(loader)
    }

    #[test]
    fn test_acquire_reuses_resident_session() {
        let loader = Arc::new(CountingLoader::new(2));
        let registry = registry_with(loader.clone());

        let first = registry.acquire("a").unwrap().residency();
        let second = registry.acquire("a").unwrap().residency();

        assert_eq!(first, Residency::Device(0));
        assert_eq!(second, first);
        assert_eq!(loader.loads(), 1);
    }

    #[test]
    fn test_placement_prefers_empty_then_least_loaded() {
        let registry = registry_with(Arc::new(CountingLoader::new(2)));

        assert_eq!(
            registry.acquire("a").unwrap().residency(),
            Residency::Device(0)
        );
        assert_eq!(
            registry.acquire("b").unwrap().residency(),
            Residency::Device(1)
        );
        // All devices hold one model; ties break toward the lowest index.
        assert_eq!(
            registry.acquire("c").unwrap().residency(),
            Residency::Device(0)
        );
        // Device 0 now holds two, device 1 holds one.
        assert_eq!(
            registry.acquire("d").unwrap().residency(),
            Residency::Device(1)
        );
    }

    #[test]
    fn test_cpu_fallback_when_no_devices() {
        let registry = registry_with(Arc::new(CountingLoader::new(0)));

        assert_eq!(registry.acquire("a").unwrap().residency(), Residency::Cpu);
        let sessions = registry.snapshot();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].residency, Residency::Cpu);
    }

    #[test]
    fn test_load_failure_leaves_registry_unchanged() {
        let loader = Arc::new(CountingLoader::new(1));
        let registry = registry_with(loader.clone());

        loader.fail.store(true, Ordering::SeqCst);
        assert!(matches!(
            registry.acquire("a"),
            Err(ServeError::LoadFailure { .. })
        ));
        assert!(registry.snapshot().is_empty());

        // The reservation was rolled back, so the retry sees a free device.
        loader.fail.store(false, Ordering::SeqCst);
        assert_eq!(
            registry.acquire("a").unwrap().residency(),
            Residency::Device(0)
        );
        assert_eq!(loader.loads(), 2);
    }

    #[test]
    fn test_waiters_share_a_single_load() {
        let loader = Arc::new(CountingLoader::with_delay(1, Duration::from_millis(30)));
        let registry = registry_with(loader.clone());

        thread::scope(|scope| {
            for _ in 0..3 {
                scope.spawn(|| {
                    let lease = registry.acquire("a").unwrap();
                    assert_eq!(lease.residency(), Residency::Device(0));
                });
            }
        });

        assert_eq!(loader.loads(), 1);
    }

    #[test]
    fn test_cold_loads_for_distinct_models_run_concurrently() {
        let loader = Arc::new(CountingLoader::with_delay(2, Duration::from_millis(100)));
        let registry = registry_with(loader.clone());

        let started = Instant::now();
        thread::scope(|scope| {
            scope.spawn(|| registry.acquire("a").unwrap());
            scope.spawn(|| registry.acquire("b").unwrap());
        });

        // Serialized loads would take at least 200ms.
        assert!(started.elapsed() < Duration::from_millis(180));
        assert_eq!(loader.loads(), 2);
    }

    #[test]
    fn test_evict_idle_removes_only_expired() {
        let registry = registry_with(Arc::new(CountingLoader::new(2)));

        registry.acquire("a").unwrap();
        registry.acquire("b").unwrap();
        thread::sleep(Duration::from_millis(30));
        registry.touch("a");

        let evicted = registry.evict_idle(Instant::now(), Duration::from_millis(20));
        assert_eq!(evicted, vec!["b".to_string()]);

        let sessions = registry.snapshot();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].model_id, "a");

        // Device 1 was freed by b's eviction and is empty again.
        assert_eq!(
            registry.acquire("c").unwrap().residency(),
            Residency::Device(1)
        );
    }

    #[test]
    fn test_evict_with_zero_timeout_forces_fresh_load() {
        let loader = Arc::new(CountingLoader::new(1));
        let registry = registry_with(loader.clone());

        registry.acquire("a").unwrap();
        let evicted = registry.evict_idle(
            Instant::now() + Duration::from_millis(1),
            Duration::ZERO,
        );
        assert_eq!(evicted, vec!["a".to_string()]);
        assert!(registry.snapshot().is_empty());

        registry.acquire("a").unwrap();
        assert_eq!(loader.loads(), 2);
    }

    #[test]
    fn test_busy_session_is_never_evicted() {
        let registry = registry_with(Arc::new(CountingLoader::new(1)));

        let lease = registry.acquire("a").unwrap();
        let evicted = registry.evict_idle(
            Instant::now() + Duration::from_secs(3600),
            Duration::ZERO,
        );
        assert!(evicted.is_empty());

        drop(lease);
        let evicted = registry.evict_idle(
            Instant::now() + Duration::from_millis(1),
            Duration::ZERO,
        );
        assert_eq!(evicted, vec!["a".to_string()]);
    }

    #[test]
    fn test_touch_refreshes_last_used() {
        let registry = registry_with(Arc::new(CountingLoader::new(1)));

        registry.acquire("a").unwrap();
        thread::sleep(Duration::from_millis(30));
        registry.touch("a");

        let evicted = registry.evict_idle(Instant::now(), Duration::from_millis(20));
        assert!(evicted.is_empty());
    }

    #[test]
    fn test_lease_blocks_second_acquire_until_dropped() {
        let registry = Arc::new(registry_with(Arc::new(CountingLoader::new(1))));

        let lease = registry.acquire("a").unwrap();
        let registry2 = registry.clone();
        let waiter = thread::spawn(move || {
            let lease = registry2.acquire("a").unwrap();
            lease.residency()
        });

        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        drop(lease);
        assert_eq!(waiter.join().unwrap(), Residency::Device(0));
    }

    #[test]
    fn test_session_renders_and_generates() {
        let registry = registry_with(Arc::new(CountingLoader::new(1)));
        let lease = registry.acquire("a").unwrap();

        let history = vec![ChatTurn {
            role: "user".to_string(),
            content: "hello".to_string(),
        }];
        let job = GenerationJob {
            history: history.clone(),
            constraint: crate::request::Constraint::None,
            random_seed: None,
            response_format: None,
        };
        let prompt = lease.render(&history).unwrap();
        assert_eq!(lease.generate(&prompt, &job).unwrap(), "hello");
    }
}
