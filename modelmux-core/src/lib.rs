use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

mod backend;
mod device;
mod dispatch;
mod echo;
mod error;
mod reaper;
mod registry;
mod request;
mod response;

pub use backend::{ChatFormatter, LoadedModel, ModelLoader, TextGenerator};
pub use device::Residency;
pub use dispatch::Dispatcher;
pub use echo::{EchoLoader, EchoModel, PlainChatFormatter};
pub use error::ServeError;
pub use registry::{ModelId, ModelRegistry, ModelSession, SessionInfo, SessionLease};
pub use request::{
    ChatTurn, Constraint, ConstraintType, ForwardRequest, GenerationJob, PrimitiveType,
};
pub use response::ForwardResponse;

use reaper::Reaper;

/// Sessions idle for longer than this are unloaded, unless overridden with
/// [`ModelMuxBuilder::with_inactivity_timeout`].
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(3600);

const DEFAULT_RESERVED_PREFIXES: &[&str] = &["gpt"];

/// Initializes tracing for the process. `MODELMUX_DEBUG=1` lowers the default
/// level to DEBUG; any `RUST_LOG` directives take precedence over both.
pub fn initialize_logging() {
    let is_debug = std::env::var("MODELMUX_DEBUG")
        .unwrap_or_default()
        .contains('1');
    let filter = EnvFilter::builder()
        .with_default_directive(if is_debug {
            LevelFilter::DEBUG.into()
        } else {
            LevelFilter::INFO.into()
        })
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// The ModelMux struct is the serving facade: it owns the model registry,
/// the per-model dispatch queues, and the inactivity reaper, and exposes the
/// one call the request layer needs. Dropping it stops the background
/// threads.
pub struct ModelMux {
    registry: Arc<ModelRegistry>,
    dispatcher: Arc<Dispatcher>,
    reserved_prefixes: Vec<String>,
    request_deadline: Option<Duration>,
    _reaper: Reaper,
}

/// The ModelMuxBuilder takes a model loader and constructs a ModelMux
/// instance around it. The registry, dispatcher, and reaper it wires up all
/// share that loader's view of the hardware.
pub struct ModelMuxBuilder {
    loader: Arc<dyn ModelLoader>,
    inactivity_timeout: Option<Duration>,
    reserved_prefixes: Option<Vec<String>>,
    request_deadline: Option<Duration>,
}

impl ModelMuxBuilder {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            loader,
            inactivity_timeout: None,
            reserved_prefixes: None,
            request_deadline: None,
        }
    }
    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = Some(timeout);
        self
    }
    pub fn with_reserved_prefixes(mut self, prefixes: Vec<String>) -> Self {
        self.reserved_prefixes = Some(prefixes);
        self
    }
    pub fn with_request_deadline(mut self, deadline: Duration) -> Self {
        self.request_deadline = Some(deadline);
        self
    }
    pub fn with_opt_request_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.request_deadline = deadline;
        self
    }

    pub fn build(self) -> Arc<ModelMux> {
        ModelMux::new(self)
    }
}

impl ModelMux {
    fn new(config: ModelMuxBuilder) -> Arc<Self> {
        let ModelMuxBuilder {
            loader,
            inactivity_timeout,
            reserved_prefixes,
            request_deadline,
        } = config;

        let inactivity_timeout = inactivity_timeout.unwrap_or(DEFAULT_INACTIVITY_TIMEOUT);
        let reserved_prefixes = reserved_prefixes.unwrap_or_else(|| {
            DEFAULT_RESERVED_PREFIXES
                .iter()
                .map(|prefix| prefix.to_string())
                .collect()
        });

        let registry = Arc::new(ModelRegistry::new(loader));
        let dispatcher = Arc::new(Dispatcher::new(registry.clone()));
        let reaper = Reaper::spawn(registry.clone(), dispatcher.clone(), inactivity_timeout);

        Arc::new(Self {
            registry,
            dispatcher,
            reserved_prefixes,
            request_deadline,
            _reaper: reaper,
        })
    }

    /// Serves one request end to end: policy check, constraint validation,
    /// then a queued generation on the model's worker. Waits for the outcome
    /// (up to the configured deadline, if any) and maps every failure mode
    /// onto a [`ServeError`] variant.
    pub async fn forward(&self, request: &ForwardRequest) -> Result<ForwardResponse, ServeError> {
        self.check_policy(&request.name_of_model)?;
        let job = GenerationJob::from_request(request)?;
        // One budget for the whole request, however many dispatch attempts
        // it takes.
        let deadline = self.request_deadline.map(|limit| Instant::now() + limit);

        let generated_text = match self
            .dispatch_once(&request.name_of_model, job.clone(), deadline)
            .await
        {
            // The queue was retired between acceptance and execution. The
            // model may have been evicted for idleness a moment before this
            // job arrived; one resubmission lands on a fresh queue.
            Err(ServeError::QueueClosed(_)) => {
                self.dispatch_once(&request.name_of_model, job, deadline)
                    .await?
            }
            other => other?,
        };
        Ok(ForwardResponse { generated_text })
    }

    async fn dispatch_once(
        &self,
        model_id: &str,
        job: GenerationJob,
        deadline: Option<Instant>,
    ) -> Result<String, ServeError> {
        let outcome = self.dispatcher.submit(model_id, job).await?;
        match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, outcome).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(ServeError::QueueClosed(model_id.to_string())),
                Err(_) => Err(ServeError::Cancelled(
                    model_id.to_string(),
                    self.request_deadline.unwrap_or_default(),
                )),
            },
            None => outcome
                .await
                .map_err(|_| ServeError::QueueClosed(model_id.to_string()))?,
        }
    }

    /// Models whose ids begin with a reserved prefix are refused before any
    /// load or queueing happens.
    fn check_policy(&self, model_id: &str) -> Result<(), ServeError> {
        for prefix in &self.reserved_prefixes {
            if model_id.starts_with(prefix.as_str()) {
                return Err(ServeError::PolicyViolation(format!(
                    "{} models are client side only.",
                    prefix.to_uppercase()
                )));
            }
        }
        Ok(())
    }

    /// Resident sessions in load order, for the models listing.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.registry.snapshot()
    }
}
