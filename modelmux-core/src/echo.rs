use std::sync::Arc;
use std::time::Duration;

use crate::backend::{ChatFormatter, LoadedModel, ModelLoader, TextGenerator};
use crate::device::Residency;
use crate::request::{ChatTurn, Constraint, GenerationJob, PrimitiveType};

/// Loader for the echo backend. It performs no real work, which makes it
/// useful for exercising the serving stack (placement, queueing, eviction)
/// without any model weights on disk.
pub struct EchoLoader {
    device_count: usize,
    load_delay: Option<Duration>,
}

impl EchoLoader {
    pub fn new(device_count: usize) -> Self {
        Self {
            device_count,
            load_delay: None,
        }
    }

    /// Simulates a slow weight load. Only interesting under test.
    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = Some(delay);
        self
    }
}

impl ModelLoader for EchoLoader {
    fn device_count(&self) -> usize {
        self.device_count
    }

    fn load(&self, _model_id: &str, _residency: Residency) -> anyhow::Result<LoadedModel> {
        if let Some(delay) = self.load_delay {
            std::thread::sleep(delay);
        }
        Ok(LoadedModel {
            generator: Arc::new(EchoModel),
            formatter: Arc::new(PlainChatFormatter),
        })
    }
}

/// Renders a conversation as one `role: content` line per turn.
pub struct PlainChatFormatter;

impl ChatFormatter for PlainChatFormatter {
    fn render(&self, history: &[ChatTurn]) -> anyhow::Result<String> {
        Ok(history
            .iter()
            .map(|turn| format!("{}: {}", turn.role, turn.content))
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

/// Echoes the last user turn back, bending the output just enough to
/// honor the request's constraint.
pub struct EchoModel;

impl TextGenerator for EchoModel {
    fn generate(&self, prompt: &str, job: &GenerationJob) -> anyhow::Result<String> {
        match &job.constraint {
            Constraint::Choice(options) => {
                Ok(options.first().cloned().unwrap_or_default())
            }
            Constraint::Typed(PrimitiveType::Int) => Ok("0".to_string()),
            Constraint::Typed(PrimitiveType::Float) => Ok("0.0".to_string()),
            Constraint::Regex(_) | Constraint::None => Ok(job
                .history
                .iter()
                .rev()
                .find(|turn| turn.role == "user")
                .map(|turn| turn.content.clone())
                .unwrap_or_else(|| prompt.to_string())),
        }
    }
}
