use serde::{Deserialize, Serialize};

/// Body of a successful `POST /forward`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardResponse {
    pub generated_text: String,
}
