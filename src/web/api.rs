//! Defines the Axum API routes and handlers.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use fleet_shared::api_models::{
    JobView, QueueEntryView, StartJobRequest, SubmitSlicingRequest, SubmitSlicingResponse,
};
use std::str::FromStr;

use crate::error::FleetError;
use crate::lifecycle::JobLifecycleManager;
use crate::scheduler::SlicingQueueScheduler;

#[derive(Clone)]
pub struct AppState {
    scheduler: SlicingQueueScheduler,
    lifecycle: JobLifecycleManager,
}

impl AppState {
    pub fn new(scheduler: SlicingQueueScheduler, lifecycle: JobLifecycleManager) -> Self {
        Self { scheduler, lifecycle }
    }
}

/// Creates the Axum router with all the API endpoints.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/queue", post(submit_slicing).get(list_queue))
        .route("/api/v1/queue/{id}", get(get_queue_entry).delete(cancel_queue_entry))
        .route("/api/v1/jobs", post(start_job).get(list_jobs))
        .route("/api/v1/jobs/{id}", get(get_job))
        .route("/api/v1/jobs/{id}/pause", post(pause_job))
        .route("/api/v1/jobs/{id}/resume", post(resume_job))
        .route("/api/v1/jobs/{id}/cancel", post(cancel_job))
        .with_state(state)
}

fn json_error(message: &str, status: StatusCode) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

pub struct ApiError(FleetError);

impl From<FleetError> for ApiError {
    fn from(err: FleetError) -> Self {
        ApiError(err)
    }
}

pub fn status_for(err: &FleetError) -> StatusCode {
    match err {
        FleetError::Validation(_) => StatusCode::BAD_REQUEST,
        FleetError::NotFound { .. } => StatusCode::NOT_FOUND,
        FleetError::Conflict(_) | FleetError::CommandRejected { .. } => StatusCode::CONFLICT,
        FleetError::DriverUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        FleetError::CommandTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!("request failed: {}", self.0);
        } else {
            tracing::debug!("request rejected: {}", self.0);
        }
        json_error(&self.0.to_string(), status)
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn parse_id<T: FromStr>(raw: &str) -> ApiResult<T> {
    raw.parse()
        .map_err(|_| ApiError(FleetError::Validation(format!("malformed id '{raw}'"))))
}

async fn submit_slicing(
    State(state): State<AppState>,
    Json(request): Json<SubmitSlicingRequest>,
) -> ApiResult<(StatusCode, Json<SubmitSlicingResponse>)> {
    let view = state.scheduler.enqueue(request).await?;
    Ok((StatusCode::CREATED, Json(SubmitSlicingResponse { id: view.id })))
}

async fn list_queue(State(state): State<AppState>) -> ApiResult<Json<Vec<QueueEntryView>>> {
    Ok(Json(state.scheduler.list().await?))
}

async fn get_queue_entry(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<QueueEntryView>> {
    Ok(Json(state.scheduler.get(parse_id(&id)?).await?))
}

async fn cancel_queue_entry(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<QueueEntryView>> {
    Ok(Json(state.scheduler.cancel(parse_id(&id)?).await?))
}

async fn start_job(
    State(state): State<AppState>,
    Json(request): Json<StartJobRequest>,
) -> ApiResult<(StatusCode, Json<JobView>)> {
    let view = state.lifecycle.start_job(request).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

async fn list_jobs(State(state): State<AppState>) -> Json<Vec<JobView>> {
    Json(state.lifecycle.list().await)
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobView>> {
    Ok(Json(state.lifecycle.get(parse_id(&id)?).await?))
}

async fn pause_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobView>> {
    Ok(Json(state.lifecycle.pause(parse_id(&id)?).await?))
}

async fn resume_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobView>> {
    Ok(Json(state.lifecycle.resume(parse_id(&id)?).await?))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobView>> {
    Ok(Json(state.lifecycle.cancel(parse_id(&id)?).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_shared::{DriverRef, QueueEntryId, RequestId};

    #[test]
    fn errors_map_to_status_codes() {
        let driver = DriverRef::new("mk4-01");
        assert_eq!(status_for(&FleetError::Validation("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&FleetError::not_found("job", "j")), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&FleetError::Conflict("busy".into())), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&FleetError::DriverUnavailable(driver.clone())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&FleetError::CommandTimeout {
                driver,
                request_id: RequestId(4),
                attempts: 3
            }),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status_for(&FleetError::StaleJob(QueueEntryId::new())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn malformed_ids_are_validation_errors() {
        let err = parse_id::<QueueEntryId>("not-a-uuid").err().unwrap();
        assert!(matches!(err.0, FleetError::Validation(_)));
    }
}
