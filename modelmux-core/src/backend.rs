use std::sync::Arc;

use crate::device::Residency;
use crate::request::{ChatTurn, GenerationJob};

/// The opaque model/tokenizer pair a loader hands back for one model id.
/// The registry owns it for the session's lifetime; workers only ever reach
/// it through a [`crate::SessionLease`].
pub struct LoadedModel {
    pub generator: Arc<dyn TextGenerator>,
    pub formatter: Arc<dyn ChatFormatter>,
}

/// Brings models up. `load` is the slow path: it runs outside the registry
/// lock, may take seconds to minutes, and may fail (unknown id, out of
/// device memory). On failure nothing about the call must linger; the
/// registry rolls its reservation back.
pub trait ModelLoader: Send + Sync {
    /// Fixed number of accelerator devices available to placement.
    /// Zero means every session is CPU-resident.
    fn device_count(&self) -> usize;

    fn load(&self, model_id: &str, residency: Residency) -> anyhow::Result<LoadedModel>;
}

/// Renders a conversation into the single prompt string the generator
/// consumes (chat-template application, in HF terms).
pub trait ChatFormatter: Send + Sync {
    fn render(&self, history: &[ChatTurn]) -> anyhow::Result<String>;
}

/// The generation capability. May be slow and may fail; it is never invoked
/// concurrently for the same session because each model's jobs run on one
/// dedicated worker.
pub trait TextGenerator: Send + Sync {
    fn generate(&self, prompt: &str, job: &GenerationJob) -> anyhow::Result<String>;
}
