use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::dispatch::Dispatcher;
use crate::registry::ModelRegistry;

/// Floor for the scan interval so tiny timeouts cannot turn the reaper into
/// a busy loop.
const MIN_SCAN_INTERVAL: Duration = Duration::from_millis(100);

/// Background thread that periodically evicts idle sessions and retires
/// their dispatch queues. Scans every quarter of the inactivity timeout.
/// Stopped (and joined) on drop.
pub struct Reaper {
    stop: mpsc::Sender<()>,
    worker: Option<JoinHandle<()>>,
}

impl Reaper {
    pub fn spawn(
        registry: Arc<ModelRegistry>,
        dispatcher: Arc<Dispatcher>,
        timeout: Duration,
    ) -> Self {
        let interval = (timeout / 4).max(MIN_SCAN_INTERVAL);
        let (stop, wakeup) = mpsc::channel();
        let worker = std::thread::spawn(move || {
            debug!("Inactivity reaper scanning every {interval:?}.");
            loop {
                match wakeup.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let evicted = registry.evict_idle(Instant::now(), timeout);
                        if !evicted.is_empty() {
                            dispatcher.retire(&evicted);
                            info!("Evicted {} idle model(s).", evicted.len());
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!("Inactivity reaper exiting.");
        });
        Self {
            stop,
            worker: Some(worker),
        }
    }

    fn stop(&mut self) {
        let _ = self.stop.send(());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ChatFormatter, LoadedModel, ModelLoader, TextGenerator};
    use crate::device::Residency;
    use crate::request::{ChatTurn, GenerationJob};
    use std::sync::atomic::{AtomicUsize, Ordering};
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
            Ok(history.last().map(|turn| turn.content.clone()).unwrap_or_default())
        }
    }

    struct CountingLoader {
        loads: AtomicUsize,
    }

    impl ModelLoader for CountingLoader {
        fn device_count(&self) -> usize {
            1
        }

        fn load(&self, _model_id: &str, _residency: Residency) -> anyhow::Result<LoadedModel> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(LoadedModel {
                generator: Arc::new(StubGenerator),
                formatter: Arc::new(StubFormatter),
            })
        }
    }

    #[test]
    fn test_reaper_evicts_idle_sessions() {
        let loader = Arc::new(CountingLoader {
            loads: AtomicUsize::new(0),
        });
        let registry = Arc::new(ModelRegistry::new(loader.clone()));
        let dispatcher = Arc::new(Dispatcher::new(registry.clone()));
        let _reaper = Reaper::spawn(
            registry.clone(),
            dispatcher.clone(),
            Duration::from_millis(50),
        );

        registry.acquire("a").unwrap();
        assert_eq!(registry.snapshot().len(), 1);

        // The clamped interval is 100ms; two cycles are plenty for a 50ms
        // timeout to expire.
        thread::sleep(Duration::from_millis(250));
        assert!(registry.snapshot().is_empty());

        registry.acquire("a").unwrap();
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_reaper_stops_on_drop() {
        let registry = Arc::new(ModelRegistry::new(Arc::new(CountingLoader {
            loads: AtomicUsize::new(0),
        })));
        let dispatcher = Arc::new(Dispatcher::new(registry.clone()));

        let reaper = Reaper::spawn(registry, dispatcher, Duration::from_secs(3600));
        drop(reaper);
    }
}
