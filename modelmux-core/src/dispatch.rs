use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::ServeError;
use crate::registry::{ModelId, ModelRegistry};
use crate::request::GenerationJob;

const QUEUE_CAPACITY: usize = 10_000;

/// One job's reply slot. The worker always sends exactly one outcome; a
/// dropped ticket (retired queue) surfaces to the waiter as a closed channel.
struct JobTicket {
    job: GenerationJob,
    reply: oneshot::Sender<Result<String, ServeError>>,
}

enum Job {
    Generate(JobTicket),
    Shutdown,
}

struct QueueHandle {
    tx: mpsc::Sender<Job>,
    retired: Arc<AtomicBool>,
    worker: JoinHandle<()>,
}

/// Routes jobs onto per-model FIFO queues, each drained by one dedicated
/// worker thread. The single worker per model is what serializes generations
/// for that model; jobs for different models proceed independently. Queues
/// are created lazily on first submission and torn down when the reaper
/// retires their model.
pub struct Dispatcher {
    registry: Arc<ModelRegistry>,
    queues: Mutex<HashMap<ModelId, QueueHandle>>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self {
            registry,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Enqueues a job for `model_id` and returns the channel its outcome
    /// will arrive on. A closed reply channel means the queue was retired
    /// after the job was accepted; callers resubmit onto the fresh queue.
    pub async fn submit(
        &self,
        model_id: &str,
        job: GenerationJob,
    ) -> Result<oneshot::Receiver<Result<String, ServeError>>, ServeError> {
        let (reply, outcome) = oneshot::channel();
        let ticket = JobTicket { job, reply };
        let tx = self.sender_for(model_id);
        tx.send(Job::Generate(ticket))
            .await
            .map_err(|_| ServeError::QueueClosed(model_id.to_string()))?;
        Ok(outcome)
    }

    /// Returns the model's queue sender, spawning the queue and its worker
    /// on first use. The map lock is never held across an await.
    fn sender_for(&self, model_id: &str) -> mpsc::Sender<Job> {
        let mut queues = self.lock_queues();
        if let Some(handle) = queues.get(model_id) {
            return handle.tx.clone();
        }

        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let retired = Arc::new(AtomicBool::new(false));
        let worker = {
            let registry = self.registry.clone();
            let retired = retired.clone();
            let model_id = model_id.to_string();
            thread::spawn(move || worker_loop(&model_id, registry, retired, rx))
        };
        queues.insert(
            model_id.to_string(),
            QueueHandle {
                tx: tx.clone(),
                retired,
                worker,
            },
        );
        tx
    }

    /// Detaches the queues of evicted models. Each retired worker stops
    /// executing jobs immediately (pending tickets are dropped, signalling
    /// their waiters to resubmit) and exits once it drains to the sentinel.
    /// The next submission for such a model builds a fresh queue.
    pub fn retire(&self, model_ids: &[ModelId]) {
        let mut queues = self.lock_queues();
        for model_id in model_ids {
            if let Some(handle) = queues.remove(model_id) {
                handle.retired.store(true, Ordering::Release);
                let _ = handle.tx.try_send(Job::Shutdown);
            }
        }
    }

    /// Stops every worker, dropping any still-queued tickets, and waits for
    /// in-flight jobs to finish.
    pub fn shutdown(&self) {
        let handles: Vec<QueueHandle> = {
            let mut queues = self.lock_queues();
            for handle in queues.values() {
                handle.retired.store(true, Ordering::Release);
            }
            queues.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            let _ = handle.tx.try_send(Job::Shutdown);
            drop(handle.tx);
            if let Err(panic) = handle.worker.join() {
                warn!("A dispatch worker panicked during shutdown: {panic:?}");
            }
        }
    }

    fn lock_queues(&self) -> std::sync::MutexGuard<'_, HashMap<ModelId, QueueHandle>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    model_id: &str,
    registry: Arc<ModelRegistry>,
    retired: Arc<AtomicBool>,
    mut rx: mpsc::Receiver<Job>,
) {
    debug!("Dispatch worker for `{model_id}` starting.");
    while let Some(job) = rx.blocking_recv() {
        let ticket = match job {
            Job::Generate(ticket) => ticket,
            Job::Shutdown => break,
        };
        if retired.load(Ordering::Acquire) {
            // Dropping the ticket closes its reply channel; the waiter
            // resubmits onto the replacement queue.
            continue;
        }
        let outcome = run_job(model_id, &registry, &ticket.job);
        match &outcome {
            // The registry already warns when a load fails.
            Err(err @ ServeError::LoadFailure { .. }) => debug!("{err}"),
            Err(err) => warn!("{err}"),
            Ok(_) => {}
        }
        let _ = ticket.reply.send(outcome);
    }
    debug!("Dispatch worker for `{model_id}` exiting.");
}

/// One generation: lease the session (loading it if cold), render the
/// conversation, and run the generator. Failures are report-and-continue;
/// they never take the worker down with them.
fn run_job(
    model_id: &str,
    registry: &ModelRegistry,
    job: &GenerationJob,
) -> Result<String, ServeError> {
    let lease = registry.acquire(model_id)?;
    let prompt = lease
        .render(&job.history)
        .map_err(|cause| ServeError::generation_failure(model_id, cause))?;
    lease
        .generate(&prompt, job)
        .map_err(|cause| ServeError::generation_failure(model_id, cause))
}
