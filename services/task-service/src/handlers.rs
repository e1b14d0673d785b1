use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;

use crate::models::{ErrorResponse, Task, TaskQuery};
use crate::state::AppState;

pub struct ServiceError {
    pub status: StatusCode,
    pub body: ErrorResponse,
}

impl ServiceError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorResponse {
                code,
                message: message.into(),
            },
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

pub async fn healthz() -> StatusCode {
    StatusCode::OK
}

pub async fn readyz(State(state): State<AppState>) -> StatusCode {
    if state.publisher.current().is_some() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

pub async fn get_task(
    State(state): State<AppState>,
    Query(query): Query<TaskQuery>,
) -> Response {
    match current_task(&state, &query) {
        Ok(task) => (StatusCode::OK, Json(task.as_ref().clone())).into_response(),
        Err(err) => err.into_response(),
    }
}

fn current_task(state: &AppState, query: &TaskQuery) -> Result<Arc<Task>, ServiceError> {
    let validator_id = query.validator_id.as_deref().unwrap_or("").trim();
    if validator_id.is_empty() {
        return Err(ServiceError::new(
            StatusCode::FORBIDDEN,
            "invalid_validator",
            "validator_id is required",
        ));
    }

    if state.rotation.is_refreshing() {
        tracing::debug!(validator_id, "task requested during refresh");
        return Err(ServiceError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "refreshing",
            "task is being refreshed, retry shortly",
        ));
    }

    let Some(task) = state.publisher.current() else {
        return Err(ServiceError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "no_task",
            "no task has been published yet",
        ));
    };
    tracing::info!(validator_id, repo = %task.repository, "task served");
    Ok(task)
}
