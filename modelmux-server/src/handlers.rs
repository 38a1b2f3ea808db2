use axum::extract::{Json, State};
use serde::Serialize;

use crate::SharedServerState;

pub async fn health() -> &'static str {
    "OK"
}

/// One row per resident model, in load order.
#[derive(Debug, Serialize)]
pub struct ModelEntry {
    pub model_id: String,
    pub device: String,
    pub idle_secs: u64,
}

pub async fn models(State(state): State<SharedServerState>) -> Json<Vec<ModelEntry>> {
    Json(
        state
            .mux
            .sessions()
            .into_iter()
            .map(|session| ModelEntry {
                model_id: session.model_id,
                device: session.residency.to_string(),
                idle_secs: session.idle.as_secs(),
            })
            .collect(),
    )
}
