use std::time::Duration;

use thiserror::Error;

use crate::registry::ModelId;

/// Everything that can go wrong between accepting a request and fulfilling
/// its ticket. Load and generation causes come from the backend as
/// `anyhow::Error` and are folded into the message chain.
#[derive(Debug, Error)]
pub enum ServeError {
    /// The model identifier is reserved for a client-side provider.
    #[error("{0}")]
    PolicyViolation(String),
    /// The model or tokenizer could not be brought up; the registry was left
    /// unchanged.
    #[error("error loading model '{model_id}': {cause:#}")]
    LoadFailure { model_id: ModelId, cause: anyhow::Error },
    /// The generation capability failed for this job. The worker that
    /// reported it keeps serving its queue.
    #[error("error during generation for model '{model_id}': {cause:#}")]
    GenerationFailure { model_id: ModelId, cause: anyhow::Error },
    /// The caller's deadline elapsed while the job was queued or running.
    #[error("request for model '{0}' exceeded its deadline of {1:?}")]
    Cancelled(ModelId, Duration),
    /// The dispatch queue was torn down before the job ran.
    #[error("dispatch queue for model '{0}' closed before the job completed")]
    QueueClosed(ModelId),
    /// The request body decoded but its fields do not form a valid job.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ServeError {
    pub(crate) fn load_failure(model_id: &str, cause: anyhow::Error) -> Self {
        Self::LoadFailure {
            model_id: model_id.to_string(),
            cause,
        }
    }

    pub(crate) fn generation_failure(model_id: &str, cause: anyhow::Error) -> Self {
        Self::GenerationFailure {
            model_id: model_id.to_string(),
            cause,
        }
    }
}
