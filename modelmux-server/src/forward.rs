use axum::{
    extract::{Json, State},
    http::{self, StatusCode},
    response::IntoResponse,
};
use serde::Serialize;

use modelmux_core::{ForwardRequest, ForwardResponse, ServeError};

use crate::SharedServerState;

pub enum ForwardResponder {
    Json(ForwardResponse),
    BadRequest(ServeError),
    Timeout(ServeError),
    InternalError(ServeError),
}

impl From<ServeError> for ForwardResponder {
    fn from(error: ServeError) -> Self {
        match error {
            ServeError::PolicyViolation(_) | ServeError::InvalidRequest(_) => {
                ForwardResponder::BadRequest(error)
            }
            ServeError::Cancelled(..) => ForwardResponder::Timeout(error),
            ServeError::LoadFailure { .. }
            | ServeError::GenerationFailure { .. }
            | ServeError::QueueClosed(_) => ForwardResponder::InternalError(error),
        }
    }
}

trait ErrorToResponse: Serialize {
    fn to_response(&self, code: StatusCode) -> axum::response::Response {
        let mut r = Json(self).into_response();
        *r.status_mut() = code;
        r
    }
}

#[derive(Serialize)]
struct JsonError {
    message: String,
}

impl JsonError {
    fn new(message: String) -> Self {
        Self { message }
    }
}
impl ErrorToResponse for JsonError {}

impl IntoResponse for ForwardResponder {
    fn into_response(self) -> axum::response::Response {
        match self {
            ForwardResponder::Json(response) => Json(response).into_response(),
            ForwardResponder::BadRequest(e) => {
                JsonError::new(e.to_string()).to_response(http::StatusCode::BAD_REQUEST)
            }
            ForwardResponder::Timeout(e) => {
                JsonError::new(e.to_string()).to_response(http::StatusCode::GATEWAY_TIMEOUT)
            }
            ForwardResponder::InternalError(e) => {
                JsonError::new(e.to_string()).to_response(http::StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}

pub async fn forward(
    State(state): State<SharedServerState>,
    Json(request): Json<ForwardRequest>,
) -> ForwardResponder {
    if request.use_cache {
        if let Some(cache) = &state.cache {
            if let Some(hit) = cache.get(&request) {
                return ForwardResponder::Json(hit);
            }
        }
    }

    match state.mux.forward(&request).await {
        Ok(response) => {
            if request.use_cache {
                if let Some(cache) = &state.cache {
                    cache.put(&request, &response);
                }
            }
            ForwardResponder::Json(response)
        }
        Err(error) => ForwardResponder::from(error),
    }
}
